#![allow(dead_code)]

use chrono::NaiveDate;
use ndarray::{Array2, Array3};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use water_balance::calendar::{month_starts, shift_month};
use water_balance::raster_io::{
    CatalogManifest, CropRecord, DatasetRecord, PolygonRecord, RasterRecord, RegionRecord,
};
use water_balance::types::{Band, Crop, Crs, GeoTransform, Horizon, Window};
use water_balance::{Calendar, Catalog, InitialConditions, WaterBalanceEngine};

/// 2 degree grid covering x -30..60, y -20..70.
pub const TRANSFORM: GeoTransform = [-30.0, 2.0, 0.0, 70.0, 0.0, -2.0];
pub const ROWS: usize = 45;
pub const COLS: usize = 45;
pub const NODATA: f64 = -9999.0;

pub const SHORT_BASE: f64 = 0.1;
pub const LONG_BASE: f64 = 0.6;

pub fn month(y: i32, m: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, 1).unwrap()
}

pub fn historical_start() -> NaiveDate {
    month(2024, 1)
}

pub fn initial_conditions() -> InitialConditions {
    InitialConditions::new(2025, 9).unwrap()
}

pub fn historical_times() -> Vec<NaiveDate> {
    month_starts(historical_start(), initial_conditions().month_start())
}

pub fn forecast_times() -> Vec<NaiveDate> {
    (1..=6)
        .map(|step| shift_month(initial_conditions().month_start(), step).unwrap())
        .collect()
}

/// Median value of the synthetic data at a time step; uniform in space.
pub fn median_at(base: f64, t: usize) -> f64 {
    base + 0.001 * t as f64
}

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<PolygonRecord> {
    vec![PolygonRecord {
        rings: vec![vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1], [x0, y0]]],
    }]
}

fn region(name: &str, country: Option<&str>, bbox: [f64; 4]) -> RegionRecord {
    let [x0, y0, x1, y1] = bbox;
    RegionRecord {
        name: name.to_string(),
        country: country.map(str::to_string),
        polygons: square(x0, y0, x1, y1),
        bbox: serde_json::to_string(&bbox).unwrap(),
    }
}

/// Positive production around Kenya, zero elsewhere.
fn production() -> RasterRecord {
    let data = Array2::from_shape_fn((ROWS, COLS), |(r, c)| {
        if (28..=40).contains(&r) && (28..=40).contains(&c) {
            1.0 + (r + c) as f64
        } else {
            0.0
        }
    });
    RasterRecord {
        transform: TRANSFORM,
        crs: Crs::WGS84,
        nodata: Some(NODATA),
        data,
    }
}

/// Production in a single Iceland cell, outside the wheat mask.
fn wheat_production() -> RasterRecord {
    let mut data = Array2::<f64>::zeros((ROWS, COLS));
    data[[2, 8]] = 3.0;
    RasterRecord {
        transform: TRANSFORM,
        crs: Crs::WGS84,
        nodata: Some(NODATA),
        data,
    }
}

/// Cells (rows 21..=24, cols 16..=19) inside Sahara that have no forecast.
fn forecast_gap(r: usize, c: usize) -> bool {
    (21..=24).contains(&r) && (16..=19).contains(&c)
}

fn median_grid(base: f64, n_times: usize, offset: usize, horizon: Horizon) -> Array3<f64> {
    Array3::from_shape_fn((n_times, ROWS, COLS), |(t, r, c)| {
        // top row is nodata in every dataset
        if r == 0 || (horizon == Horizon::Forecast && forecast_gap(r, c)) {
            NODATA
        } else {
            median_at(base, t + offset)
        }
    })
}

fn dataset(window: Window, horizon: Horizon, base: f64) -> DatasetRecord {
    let historical_len = historical_times().len();
    let (times, offset) = match horizon {
        Horizon::Historical => (historical_times(), 0),
        Horizon::Forecast => (forecast_times(), historical_len),
    };
    let median = median_grid(base, times.len(), offset, horizon);

    let mut bands = BTreeMap::new();
    if horizon == Horizon::Forecast {
        for (band, delta) in [(Band::P5, -0.2), (Band::P20, -0.1), (Band::P80, 0.1), (Band::P95, 0.2)] {
            bands.insert(band, median.mapv(|v| if v == NODATA { v } else { v + delta }));
        }
    }
    bands.insert(Band::P50, median);

    DatasetRecord {
        window,
        horizon,
        times,
        transform: TRANSFORM,
        crs: Crs::WGS84,
        nodata: Some(NODATA),
        bands,
    }
}

pub fn manifest() -> CatalogManifest {
    CatalogManifest {
        regions: vec![
            region("Kenya", None, [34.0, -4.0, 42.0, 4.0]),
            region("Nairobi", Some("Kenya"), [36.0, -2.0, 38.0, 0.0]),
            region("Mombasa", Some("Kenya"), [38.0, -4.0, 42.0, -2.0]),
            region("Iceland", None, [-24.0, 63.0, -14.0, 66.0]),
            region("Atlantis", None, [100.0, 10.0, 110.0, 20.0]),
            region("Sahara", None, [0.0, 20.0, 10.0, 30.0]),
        ],
        crops: vec![
            CropRecord {
                crop: Crop::Coffee,
                mask: square(36.0, -2.0, 40.0, 2.0),
                production: production(),
            },
            CropRecord {
                crop: Crop::Maize,
                mask: square(34.0, -4.0, 42.0, 4.0),
                production: production(),
            },
            CropRecord {
                crop: Crop::Wheat,
                mask: square(-24.0, 63.0, -20.0, 66.0),
                production: wheat_production(),
            },
            CropRecord {
                crop: Crop::Barley,
                mask: square(3.0, 23.0, 5.0, 25.0),
                production: production(),
            },
        ],
        datasets: vec![
            dataset(Window::Short, Horizon::Historical, SHORT_BASE),
            dataset(Window::Short, Horizon::Forecast, SHORT_BASE),
            dataset(Window::Long, Horizon::Historical, LONG_BASE),
            dataset(Window::Long, Horizon::Forecast, LONG_BASE),
        ],
    }
}

pub fn write_manifest(dir: &Path) -> PathBuf {
    let path = dir.join("catalog.json");
    let file = std::fs::File::create(&path).unwrap();
    serde_json::to_writer(file, &manifest()).unwrap();
    path
}

pub fn catalog() -> Catalog {
    Catalog::from_manifest(manifest()).unwrap()
}

pub fn engine() -> WaterBalanceEngine {
    let calendar = Calendar::new(historical_start(), initial_conditions()).unwrap();
    WaterBalanceEngine::new(Arc::new(catalog()), calendar)
}
