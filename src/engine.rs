use crate::aggregate::SpatialAggregator;
use crate::calendar::{Calendar, SliderPreset};
use crate::catalog::{Catalog, CropEntry};
use crate::raster_io::{ClipOptions, ClipOutcome, MapPoint, RasterClipper, RasterIO};
use crate::timeseries::{
    chart_title, export_filename, ChartView, RowLabels, TimeSeriesAssembler, TimeSeriesTable, Toggles,
};
use crate::types::*;
use crate::weighting::ProductionWeighter;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A user's choice of region, crop and window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub country: String,
    pub state: String,
    pub crop: String,
    pub window: u32,
    pub toggles: Toggles,
}

impl Selection {
    pub fn new(country: impl Into<String>, state: impl Into<String>, crop: impl Into<String>, window: u32) -> Self {
        Self {
            country: country.into(),
            state: state.into(),
            crop: crop.into(),
            window,
            toggles: Toggles::default(),
        }
    }

    pub fn with_toggles(mut self, toggles: Toggles) -> Self {
        self.toggles = toggles;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub labels: RowLabels,
    pub crop: CropSelection,
    pub window: Window,
    pub toggles: Toggles,
    pub table: TimeSeriesTable,
    /// Unweighted forecast median on the country grid.
    pub forecast_map: Vec<MapPoint>,
    pub map_zoom: f64,
    /// Valid cell counts (historical, forecast) used to rescale crop weights.
    pub nrows: Option<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Ready(Box<PipelineResult>),
    NoData,
}

impl PipelineOutcome {
    pub fn is_no_data(&self) -> bool {
        matches!(self, PipelineOutcome::NoData)
    }

    pub fn ready(self) -> Option<PipelineResult> {
        match self {
            PipelineOutcome::Ready(result) => Some(*result),
            PipelineOutcome::NoData => None,
        }
    }
}

/// Resolved, validated selection.
struct Request<'a> {
    selection: &'a Selection,
    country: &'a Region,
    region: &'a Region,
    window: Window,
    crop: CropSelection,
    crop_entry: Option<&'a CropEntry>,
}

pub struct WaterBalanceEngine {
    catalog: Arc<Catalog>,
    calendar: Calendar,
}

impl WaterBalanceEngine {
    pub fn new(catalog: Arc<Catalog>, calendar: Calendar) -> Self {
        for window in [Window::Short, Window::Long] {
            let pair = catalog.windows.select(window);
            if pair.forecast.first_time() != calendar.first_forecast_date() {
                warn!(
                    "Window {} forecast starts {:?}, calendar expects {:?}",
                    window,
                    pair.forecast.first_time(),
                    calendar.first_forecast_date()
                );
            }
        }
        Self { catalog, calendar }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    /// Run the clip, weight, aggregate and assemble stages for one selection.
    ///
    /// Invalid selections are returned as errors before any grid is touched.
    /// Everything that goes wrong afterwards yields [`PipelineOutcome::NoData`].
    pub fn compute(&self, selection: &Selection) -> Result<PipelineOutcome> {
        let request = self.validate(selection)?;
        info!(
            "Computing {} / {} / {} / {} months",
            selection.country,
            selection.state,
            request.crop.name(),
            request.window
        );

        match self.run(&request) {
            Ok(result) => Ok(PipelineOutcome::Ready(Box::new(result))),
            Err(e) if e.is_no_data() => {
                info!("No data for {} / {}: {}", selection.country, selection.state, e);
                Ok(PipelineOutcome::NoData)
            }
            Err(e) => {
                error!("Pipeline failed for {} / {}: {}", selection.country, selection.state, e);
                Ok(PipelineOutcome::NoData)
            }
        }
    }

    fn validate<'a>(&'a self, selection: &'a Selection) -> Result<Request<'a>> {
        if selection.country.trim().is_empty() {
            return Err(WaterBalanceError::IncompleteSelection("country is empty".to_string()));
        }
        if selection.state.trim().is_empty() {
            return Err(WaterBalanceError::IncompleteSelection("state is empty".to_string()));
        }

        let window = Window::try_from(selection.window)?;
        let mut crop: CropSelection = selection.crop.parse()?;
        if !window.supports_crops() && crop != CropSelection::None {
            debug!("Ignoring crop {} for the {} month window", crop.name(), window);
            crop = CropSelection::None;
        }

        let country = self.catalog.geometry.country(&selection.country)?;
        let region = self.catalog.geometry.resolve(&selection.country, &selection.state)?;
        let crop_entry = self.catalog.crops.resolve(crop)?;

        Ok(Request {
            selection,
            country,
            region,
            window,
            crop,
            crop_entry,
        })
    }

    fn run(&self, request: &Request<'_>) -> Result<PipelineResult> {
        let options = ClipOptions::default();
        let pair = self.catalog.windows.select(request.window);
        let region = request.region;

        let mut historical =
            RasterClipper::clip(&pair.historical, &region.geometry, options).into_result(&region.name)?;
        let mut forecast =
            RasterClipper::clip(&pair.forecast, &region.geometry, options).into_result(&region.name)?;

        if let Some(entry) = request.crop_entry {
            let context = format!("{} in {}", request.crop.name(), region.name);
            historical = Self::clip_to_crop(&historical, entry, &context)?;
            forecast = Self::clip_to_crop(&forecast, entry, &context)?;
        }

        let forecast_map = self.map_points(&forecast, request.country);

        let mut nrows = None;
        if let Some(entry) = request.crop_entry {
            let weighted =
                ProductionWeighter::new(&entry.production).apply(region, &historical, &forecast)?;
            nrows = Some((weighted.nrows_historical, weighted.nrows_forecast));
            historical = weighted.historical;
            forecast = weighted.forecast;
        }

        let historical_means = SpatialAggregator::aggregate(&historical);
        let forecast_means = SpatialAggregator::aggregate(&forecast);

        let labels = RowLabels {
            country: request.selection.country.clone(),
            state: request.selection.state.clone(),
            crop: request.crop.name().to_string(),
            window: request.window.months(),
        };
        let table = TimeSeriesAssembler::assemble(
            &labels,
            &historical_means,
            &forecast_means,
            request.selection.toggles,
        );
        debug!(
            "Assembled {} rows ({} historical, {} forecast)",
            table.len(),
            table.count(Horizon::Historical),
            table.count(Horizon::Forecast)
        );

        Ok(PipelineResult {
            labels,
            crop: request.crop,
            window: request.window,
            toggles: request.selection.toggles,
            table,
            forecast_map,
            map_zoom: request.country.map_zoom(),
            nrows,
        })
    }

    /// Crop-mask clip of an already region-clipped series. An empty result is
    /// reported as missing data.
    fn clip_to_crop(series: &GriddedSeries, entry: &CropEntry, context: &str) -> Result<GriddedSeries> {
        match RasterClipper::clip(series, &entry.mask, ClipOptions::default()) {
            ClipOutcome::Clipped(clipped) => Ok(clipped),
            ClipOutcome::Empty | ClipOutcome::OutOfBounds => {
                Err(WaterBalanceError::NoDataAvailable(context.to_string()))
            }
        }
    }

    /// Tidy median points of the unweighted forecast, re-clipped to the country.
    fn map_points(&self, forecast: &GriddedSeries, country: &Region) -> Vec<MapPoint> {
        match RasterClipper::clip(forecast, &country.geometry, ClipOptions::default()) {
            ClipOutcome::Clipped(clipped) => RasterIO::map_points(&clipped),
            _ => Vec::new(),
        }
    }

    /// Chart segments from `cutoff` onwards.
    pub fn chart(&self, result: &PipelineResult, cutoff: Option<NaiveDate>) -> Result<ChartView> {
        ChartView::build(&result.table, cutoff, result.toggles)
    }

    pub fn chart_for_preset(&self, result: &PipelineResult, preset: SliderPreset) -> Result<ChartView> {
        self.chart(result, self.calendar.cutoff(preset))
    }

    pub fn chart_title(&self, result: &PipelineResult) -> Option<String> {
        chart_title(&result.labels.country, &result.labels.state, result.toggles)
    }

    pub fn export_filename(&self, result: &PipelineResult) -> String {
        let first_forecast = self
            .calendar
            .first_forecast_date()
            .unwrap_or_else(|| self.calendar.initial_conditions().month_start());
        export_filename(&result.labels, result.toggles, first_forecast)
    }
}
