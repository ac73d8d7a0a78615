//! Region and crop weighted water balance percentile time series.
//!
//! The pipeline clips gridded percentile data to a region, optionally weights
//! it by crop production, averages it over space and merges the historical
//! and forecast horizons into one table.

pub mod aggregate;
pub mod calendar;
pub mod catalog;
pub mod engine;
pub mod raster_io;
pub mod timeseries;
pub mod types;
pub mod weighting;

pub use calendar::{Calendar, InitialConditions, SliderPreset};
pub use catalog::{Catalog, ALL_STATES};
pub use engine::{PipelineOutcome, PipelineResult, Selection, WaterBalanceEngine};
pub use timeseries::{ChartView, TimeSeriesTable, Toggles};
pub use types::{Config, Result, WaterBalanceError};
