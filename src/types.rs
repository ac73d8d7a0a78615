use crate::calendar::InitialConditions;
use chrono::NaiveDate;
use geo_types::MultiPolygon;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, WaterBalanceError>;

/// GDAL-ordered affine transform: `[x0, dx, rot_x, y0, rot_y, dy]`, origin at the
/// top-left corner of the top-left cell.
pub type GeoTransform = [f64; 6];

/// Configuration for the command line tool. Every field has a default so a
/// partial JSON file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub catalog_path: PathBuf,
    pub historical_start: NaiveDate,
    pub initial_conditions: Option<InitialConditions>,
    pub cpu_cores: Option<usize>,
    pub log_level: String,
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("data/catalog.json"),
            historical_start: NaiveDate::from_ymd_opt(1991, 1, 1).unwrap_or_default(),
            initial_conditions: None,
            cpu_cores: None,
            log_level: "info".to_string(),
            output_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    pub const ENV_VAR: &'static str = "WATER_BALANCE_CONFIG";

    /// `<config dir>/water-balance/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("water-balance").join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path first, then `WATER_BALANCE_CONFIG`, then the per-user
    /// config file. Falls back to defaults when none of them exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(Self::ENV_VAR) {
            return Self::from_file(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.cpu_cores {
            return Err(WaterBalanceError::Config(
                "cpu_cores must be at least 1".to_string(),
            ));
        }
        if let Some(ic) = self.initial_conditions {
            if ic.month_start() < self.historical_start {
                return Err(WaterBalanceError::Config(format!(
                    "initial conditions {} precede historical start {}",
                    ic.month_start(),
                    self.historical_start
                )));
            }
        }
        Ok(())
    }

    pub fn get_cpu_cores(&self) -> usize {
        let available = num_cpus::get();
        self.cpu_cores.map_or(available, |n| n.clamp(1, available))
    }

    pub fn initial_conditions(&self) -> InitialConditions {
        self.initial_conditions
            .unwrap_or_else(InitialConditions::from_today)
    }
}

/// The five percentile bands of the water balance index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    #[serde(rename = "p5", alias = "5%")]
    P5,
    #[serde(rename = "p20", alias = "20%")]
    P20,
    #[serde(rename = "p50", alias = "perc")]
    P50,
    #[serde(rename = "p80", alias = "80%")]
    P80,
    #[serde(rename = "p95", alias = "95%")]
    P95,
}

impl Band {
    pub const ALL: [Band; 5] = [Band::P5, Band::P20, Band::P50, Band::P80, Band::P95];

    /// Column heading used in exported tables.
    pub fn column(self) -> &'static str {
        match self {
            Band::P5 => "5%",
            Band::P20 => "20%",
            Band::P50 => "percentile",
            Band::P80 => "80%",
            Band::P95 => "95%",
        }
    }
}

/// Integration window of the upstream percentile index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Window {
    Short,
    Long,
}

impl Window {
    pub fn months(self) -> u32 {
        match self {
            Window::Short => 3,
            Window::Long => 12,
        }
    }

    /// Crop weighting only applies to the short window.
    pub fn supports_crops(self) -> bool {
        matches!(self, Window::Short)
    }
}

impl TryFrom<u32> for Window {
    type Error = WaterBalanceError;

    fn try_from(months: u32) -> Result<Self> {
        match months {
            3 => Ok(Window::Short),
            12 => Ok(Window::Long),
            other => Err(WaterBalanceError::InvalidWindow(other)),
        }
    }
}

impl From<Window> for u32 {
    fn from(window: Window) -> u32 {
        window.months()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.months())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Historical,
    Forecast,
}

impl Horizon {
    pub fn as_str(self) -> &'static str {
        match self {
            Horizon::Historical => "historical",
            Horizon::Forecast => "forecast",
        }
    }
}

/// EPSG code tagging a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(pub u32);

impl Crs {
    pub const WGS84: Crs = Crs(4326);
}

impl Default for Crs {
    fn default() -> Self {
        Crs::WGS84
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Multi-band (time, y, x) percentile grid. Missing cells are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct GriddedSeries {
    pub times: Vec<NaiveDate>,
    pub bands: BTreeMap<Band, Array3<f64>>,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl GriddedSeries {
    pub fn new(times: Vec<NaiveDate>, transform: GeoTransform, crs: Crs) -> Self {
        Self {
            times,
            bands: BTreeMap::new(),
            transform,
            crs,
        }
    }

    pub fn with_band(mut self, band: Band, data: Array3<f64>) -> Result<Self> {
        let (n_times, n_rows, n_cols) = data.dim();
        if n_times != self.times.len() {
            return Err(WaterBalanceError::Catalog(format!(
                "band {:?} has {} time steps, expected {}",
                band,
                n_times,
                self.times.len()
            )));
        }
        if !self.bands.is_empty() && self.dims() != (n_rows, n_cols) {
            return Err(WaterBalanceError::Catalog(format!(
                "band {:?} is {}x{}, other bands are {:?}",
                band,
                n_rows,
                n_cols,
                self.dims()
            )));
        }
        self.bands.insert(band, data);
        Ok(self)
    }

    pub fn band(&self, band: Band) -> Option<&Array3<f64>> {
        self.bands.get(&band)
    }

    /// (rows, cols) of the spatial plane.
    pub fn dims(&self) -> (usize, usize) {
        self.bands
            .values()
            .next()
            .map(|data| {
                let (_, rows, cols) = data.dim();
                (rows, cols)
            })
            .unwrap_or((0, 0))
    }

    pub fn first_time(&self) -> Option<NaiveDate> {
        self.times.first().copied()
    }

    pub fn last_time(&self) -> Option<NaiveDate> {
        self.times.last().copied()
    }

    /// True when every value of the median band is missing. Falls back to all
    /// bands for grids that carry no median.
    pub fn median_all_missing(&self) -> bool {
        match self.band(Band::P50) {
            Some(data) => data.iter().all(|v| v.is_nan()),
            None => self.bands.values().all(|data| data.iter().all(|v| v.is_nan())),
        }
    }

    /// Same transform and the same spatial shape.
    pub fn is_aligned_with(&self, other: &GriddedSeries) -> bool {
        self.transform == other.transform && self.dims() == other.dims()
    }

    pub fn map_bands<F>(&self, f: F) -> GriddedSeries
    where
        F: Fn(&Array3<f64>) -> Array3<f64>,
    {
        GriddedSeries {
            times: self.times.clone(),
            bands: self.bands.iter().map(|(band, data)| (*band, f(data))).collect(),
            transform: self.transform,
            crs: self.crs,
        }
    }
}

/// Crop production intensity on the same grid as the percentile series.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionGrid {
    pub data: Array2<f64>,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl ProductionGrid {
    /// Sum of non-missing cells.
    pub fn total(&self) -> f64 {
        self.data.iter().filter(|v| !v.is_nan()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct Region {
    pub name: String,
    /// Parent country for states, `None` for countries.
    pub country: Option<String>,
    pub geometry: MultiPolygon<f64>,
    /// `[xmin, ymin, xmax, ymax]`
    pub bbox: [f64; 4],
}

impl Region {
    pub fn is_country(&self) -> bool {
        self.country.is_none()
    }

    /// Zoom level for a web map framing this region.
    pub fn map_zoom(&self) -> f64 {
        let [xmin, ymin, xmax, ymax] = self.bbox;
        let extent_km = (xmax - xmin).abs().max((ymax - ymin).abs()) * 111.0;
        if extent_km <= 0.0 {
            return 11.0;
        }
        (11.0 - extent_km.ln()).max(3.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crop {
    Barley,
    Cocoa,
    Coffee,
    Cotton,
    Maize,
    Rice,
    Soy,
    Sugarcane,
    Wheat,
}

impl Crop {
    pub const ALL: [Crop; 9] = [
        Crop::Barley,
        Crop::Cocoa,
        Crop::Coffee,
        Crop::Cotton,
        Crop::Maize,
        Crop::Rice,
        Crop::Soy,
        Crop::Sugarcane,
        Crop::Wheat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Crop::Barley => "barley",
            Crop::Cocoa => "cocoa",
            Crop::Coffee => "coffee",
            Crop::Cotton => "cotton",
            Crop::Maize => "maize",
            Crop::Rice => "rice",
            Crop::Soy => "soy",
            Crop::Sugarcane => "sugarcane",
            Crop::Wheat => "wheat",
        }
    }
}

impl FromStr for Crop {
    type Err = WaterBalanceError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_lowercase();
        match lowered.as_str() {
            "soybean" => Ok(Crop::Soy),
            name => Crop::ALL
                .into_iter()
                .find(|crop| crop.name() == name)
                .ok_or_else(|| WaterBalanceError::UnknownCrop(s.to_string())),
        }
    }
}

/// A crop choice, with "none" (or an empty string) meaning no weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CropSelection {
    None,
    Crop(Crop),
}

impl CropSelection {
    pub fn name(self) -> &'static str {
        match self {
            CropSelection::None => "none",
            CropSelection::Crop(crop) => crop.name(),
        }
    }

    pub fn crop(self) -> Option<Crop> {
        match self {
            CropSelection::None => None,
            CropSelection::Crop(crop) => Some(crop),
        }
    }
}

impl FromStr for CropSelection {
    type Err = WaterBalanceError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Ok(CropSelection::None);
        }
        trimmed.parse().map(CropSelection::Crop)
    }
}

/// One row of the exported time series table. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRow {
    pub country: String,
    pub state: String,
    pub crop: String,
    #[serde(rename = "type")]
    pub kind: Horizon,
    pub window: u32,
    pub time: NaiveDate,
    pub percentile: Option<f64>,
    #[serde(rename = "5%")]
    pub p5: Option<f64>,
    #[serde(rename = "20%")]
    pub p20: Option<f64>,
    #[serde(rename = "80%")]
    pub p80: Option<f64>,
    #[serde(rename = "95%")]
    pub p95: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum WaterBalanceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Region not found: {0}")]
    RegionNotFound(String),
    #[error("Unknown crop: {0}")]
    UnknownCrop(String),
    #[error("Invalid integration window: {0} (expected 3 or 12)")]
    InvalidWindow(u32),
    #[error("Incomplete selection: {0}")]
    IncompleteSelection(String),
    #[error("No data in bounds: {0}")]
    NoDataInBounds(String),
    #[error("No data available: {0}")]
    NoDataAvailable(String),
    #[error("Regional production sums to zero in {0}")]
    ZeroProduction(String),
    #[error("Grid misaligned: {0}")]
    GridMisaligned(String),
    #[error("CRS mismatch: expected {expected}, found {found}")]
    CrsMismatch { expected: Crs, found: Crs },
    #[error("Invalid chart layout: {0}")]
    InvalidChartLayout(String),
    #[error("Invalid catalog: {0}")]
    Catalog(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl WaterBalanceError {
    /// Expected outcomes of a valid selection that simply has nothing to show.
    pub fn is_no_data(&self) -> bool {
        matches!(
            self,
            WaterBalanceError::NoDataInBounds(_) | WaterBalanceError::NoDataAvailable(_)
        )
    }

    /// Input problems caught before any grid is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            WaterBalanceError::RegionNotFound(_)
                | WaterBalanceError::UnknownCrop(_)
                | WaterBalanceError::InvalidWindow(_)
                | WaterBalanceError::IncompleteSelection(_)
        )
    }
}
