//! Read-only base catalog: regions, crops and the four percentile datasets.
//!
//! A [`Catalog`] is built once at start-up and shared between requests
//! behind an `Arc`; nothing in it is mutated afterwards.

use crate::calendar::shift_month;
use crate::raster_io::{to_multipolygon, CatalogManifest, RasterIO};
use crate::types::*;
use geo_types::MultiPolygon;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Sub-region name selecting a whole country.
pub const ALL_STATES: &str = "All";

/// Sub-region listed right after "All" for the United States.
const PROMOTED_STATES: &[(&str, &str)] = &[("USA", "CONUS")];

#[derive(Debug, Clone, Default)]
pub struct GeometryCatalog {
    regions: Vec<Region>,
}

impl GeometryCatalog {
    pub fn new(regions: Vec<Region>) -> Result<Self> {
        let catalog = Self { regions };
        for state in catalog.regions.iter().filter(|r| !r.is_country()) {
            let parent = state.country.as_deref().unwrap_or_default();
            if catalog.country(parent).is_err() {
                return Err(WaterBalanceError::Catalog(format!(
                    "state {} references unknown country {}",
                    state.name, parent
                )));
            }
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn country(&self, name: &str) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.is_country() && r.name == name)
            .ok_or_else(|| WaterBalanceError::RegionNotFound(name.to_string()))
    }

    /// Resolve a country / state pair. `"All"` selects the country itself.
    pub fn resolve(&self, country: &str, state: &str) -> Result<&Region> {
        if state == ALL_STATES {
            return self.country(country);
        }
        self.regions
            .iter()
            .find(|r| r.name == state && r.country.as_deref() == Some(country))
            .ok_or_else(|| WaterBalanceError::RegionNotFound(format!("{}, {}", state, country)))
    }

    /// Sorted country names, optionally filtered by a case-insensitive substring.
    pub fn countries(&self, filter: Option<&str>) -> Vec<&str> {
        let query = filter.map(str::to_lowercase).unwrap_or_default();
        let mut names: Vec<&str> = self
            .regions
            .iter()
            .filter(|r| r.is_country())
            .map(|r| r.name.as_str())
            .filter(|name| query.is_empty() || name.to_lowercase().contains(&query))
            .collect();
        names.sort_unstable();
        names
    }

    /// Sub-region choices for a country, "All" first.
    pub fn state_options(&self, country: &str) -> Result<Vec<String>> {
        self.country(country)?;

        let mut states: Vec<&str> = self
            .regions
            .iter()
            .filter(|r| r.country.as_deref() == Some(country))
            .map(|r| r.name.as_str())
            .collect();
        states.sort_unstable();

        let mut options = vec![ALL_STATES.to_string()];
        if let Some((_, promoted)) = PROMOTED_STATES.iter().find(|(c, _)| *c == country) {
            if let Some(pos) = states.iter().position(|s| s == promoted) {
                options.push(states.remove(pos).to_string());
            }
        }
        options.extend(states.into_iter().map(str::to_string));
        Ok(options)
    }
}

#[derive(Debug, Clone)]
pub struct CropEntry {
    pub mask: MultiPolygon<f64>,
    pub production: ProductionGrid,
}

#[derive(Debug, Clone, Default)]
pub struct CropCatalog {
    entries: HashMap<Crop, CropEntry>,
}

impl CropCatalog {
    pub fn new(entries: HashMap<Crop, CropEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn crops(&self) -> Vec<Crop> {
        let mut crops: Vec<Crop> = self.entries.keys().copied().collect();
        crops.sort();
        crops
    }

    /// `Ok(None)` for no crop; an error if the crop has no catalog entry.
    pub fn resolve(&self, selection: CropSelection) -> Result<Option<&CropEntry>> {
        match selection {
            CropSelection::None => Ok(None),
            CropSelection::Crop(crop) => self.entries.get(&crop).map(Some).ok_or_else(|| {
                WaterBalanceError::Catalog(format!("crop {} has no mask or production data", crop.name()))
            }),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Option<&CropEntry>> {
        self.resolve(name.parse()?)
    }
}

/// Historical and forecast datasets of one integration window.
#[derive(Debug, Clone)]
pub struct SeriesPair {
    pub historical: GriddedSeries,
    pub forecast: GriddedSeries,
}

impl SeriesPair {
    pub fn new(historical: GriddedSeries, forecast: GriddedSeries) -> Result<Self> {
        if historical.band(Band::P50).is_none() {
            return Err(WaterBalanceError::Catalog(
                "historical dataset has no median band".to_string(),
            ));
        }
        if let Some(band) = Band::ALL.iter().find(|b| forecast.band(**b).is_none()) {
            return Err(WaterBalanceError::Catalog(format!(
                "forecast dataset is missing band {:?}",
                band
            )));
        }
        if historical.crs != forecast.crs {
            return Err(WaterBalanceError::CrsMismatch {
                expected: historical.crs,
                found: forecast.crs,
            });
        }
        if !historical.is_aligned_with(&forecast) {
            return Err(WaterBalanceError::GridMisaligned(format!(
                "historical {:?} {:?} vs forecast {:?} {:?}",
                historical.dims(),
                historical.transform,
                forecast.dims(),
                forecast.transform
            )));
        }

        let expected_start = historical.last_time().and_then(|t| shift_month(t, 1));
        if expected_start.is_none() || forecast.first_time() != expected_start {
            return Err(WaterBalanceError::Catalog(format!(
                "forecast starts {:?}, expected the month after {:?}",
                forecast.first_time(),
                historical.last_time()
            )));
        }

        Ok(Self { historical, forecast })
    }
}

#[derive(Debug, Clone)]
pub struct WindowRegistry {
    short: SeriesPair,
    long: SeriesPair,
}

impl WindowRegistry {
    pub fn new(short: SeriesPair, long: SeriesPair) -> Self {
        Self { short, long }
    }

    pub fn select(&self, window: Window) -> &SeriesPair {
        match window {
            Window::Short => &self.short,
            Window::Long => &self.long,
        }
    }

    pub fn select_months(&self, months: u32) -> Result<&SeriesPair> {
        Ok(self.select(Window::try_from(months)?))
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub geometry: GeometryCatalog,
    pub crops: CropCatalog,
    pub windows: WindowRegistry,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_manifest(RasterIO::read_manifest(path)?)
    }

    pub fn from_manifest(manifest: CatalogManifest) -> Result<Self> {
        let regions = manifest
            .regions
            .into_iter()
            .map(|record| record.into_region())
            .collect::<Result<Vec<_>>>()?;
        let geometry = GeometryCatalog::new(regions)?;

        let mut entries = HashMap::new();
        for record in manifest.crops {
            let crop = record.crop;
            let entry = CropEntry {
                mask: to_multipolygon(&record.mask)?,
                production: record.production.into_production(),
            };
            if entries.insert(crop, entry).is_some() {
                warn!("Crop {} listed twice in manifest, keeping the last entry", crop.name());
            }
        }
        let crops = CropCatalog::new(entries);

        let mut datasets: HashMap<(Window, Horizon), GriddedSeries> = HashMap::new();
        for record in manifest.datasets {
            let key = (record.window, record.horizon);
            if datasets.insert(key, record.into_series()?).is_some() {
                return Err(WaterBalanceError::Catalog(format!(
                    "duplicate dataset for window {} {}",
                    key.0,
                    key.1.as_str()
                )));
            }
        }

        let mut take_pair = |window: Window| -> Result<SeriesPair> {
            let historical = datasets.remove(&(window, Horizon::Historical));
            let forecast = datasets.remove(&(window, Horizon::Forecast));
            match (historical, forecast) {
                (Some(historical), Some(forecast)) => SeriesPair::new(historical, forecast),
                _ => Err(WaterBalanceError::Catalog(format!(
                    "missing historical or forecast dataset for window {}",
                    window
                ))),
            }
        };
        let windows = WindowRegistry::new(take_pair(Window::Short)?, take_pair(Window::Long)?);

        for crop in Crop::ALL {
            if crops.resolve(CropSelection::Crop(crop)).is_err() {
                warn!("No catalog entry for crop {}", crop.name());
            }
        }

        let crop_names: Vec<&str> = crops.crops().into_iter().map(Crop::name).collect();
        info!(
            "Catalog ready: {} regions, crops [{}]",
            geometry.len(),
            crop_names.join(", ")
        );

        Ok(Self {
            geometry,
            crops,
            windows,
        })
    }
}
