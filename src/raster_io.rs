use crate::types::*;
use chrono::NaiveDate;
use geo::{BoundingRect, Contains, Intersects};
use geo_types::{Coord, LineString, MultiPolygon, Point, Polygon, Rect};
use ndarray::{s, Array, Array2, Array3, ArrayView2, Axis, Dimension, RemoveAxis, Slice, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// How cells are selected by [`RasterClipper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipOptions {
    /// Keep every cell touching the geometry, not only cells whose centre is inside.
    pub all_touched: bool,
    /// Crop the output to the extent of the retained cells.
    pub drop: bool,
}

impl Default for ClipOptions {
    fn default() -> Self {
        Self {
            all_touched: true,
            drop: true,
        }
    }
}

/// Result of clipping a grid to a geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum ClipOutcome<T> {
    Clipped(T),
    /// Cells were retained, but all of them are missing.
    Empty,
    /// The geometry does not touch the grid.
    OutOfBounds,
}

impl<T> ClipOutcome<T> {
    pub fn into_result(self, context: &str) -> Result<T> {
        match self {
            ClipOutcome::Clipped(value) => Ok(value),
            ClipOutcome::Empty => Err(WaterBalanceError::NoDataAvailable(context.to_string())),
            ClipOutcome::OutOfBounds => Err(WaterBalanceError::NoDataInBounds(context.to_string())),
        }
    }
}

/// Cells of a grid retained by a clip, relative to the source grid.
#[derive(Debug, Clone)]
pub struct ClipWindow {
    pub row_start: usize,
    pub col_start: usize,
    pub mask: Array2<bool>,
    pub transform: GeoTransform,
}

impl ClipWindow {
    pub fn dims(&self) -> (usize, usize) {
        self.mask.dim()
    }

    pub fn retained(&self) -> usize {
        self.mask.iter().filter(|keep| **keep).count()
    }

    pub fn apply2(&self, data: ArrayView2<f64>) -> Array2<f64> {
        let (rows, cols) = self.dims();
        let mut out = data
            .slice(s![
                self.row_start..self.row_start + rows,
                self.col_start..self.col_start + cols
            ])
            .to_owned();
        Zip::from(&mut out).and(&self.mask).for_each(|v, &keep| {
            if !keep {
                *v = f64::NAN;
            }
        });
        out
    }

    pub fn apply3(&self, data: &Array3<f64>) -> Array3<f64> {
        let (rows, cols) = self.dims();
        let mut out = data
            .slice(s![
                ..,
                self.row_start..self.row_start + rows,
                self.col_start..self.col_start + cols
            ])
            .to_owned();
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut step| {
                Zip::from(&mut step).and(&self.mask).for_each(|v, &keep| {
                    if !keep {
                        *v = f64::NAN;
                    }
                });
            });
        out
    }
}

pub struct RasterClipper;

impl RasterClipper {
    /// Work out which cells of a `(rows, cols)` grid the geometry selects.
    /// Returns `None` when no cell is selected.
    pub fn window(
        shape: (usize, usize),
        transform: &GeoTransform,
        geometry: &MultiPolygon<f64>,
        options: ClipOptions,
    ) -> Option<ClipWindow> {
        let (height, width) = shape;
        if height == 0 || width == 0 {
            return None;
        }
        let bounds = geometry.bounding_rect()?;
        let inv_transform = Self::invert_transform(transform);

        // Candidate pixel window from the geometry bounds, widened so that
        // cells touching the bounds on an edge are tested too.
        let (col_a, row_a) = Self::world_to_pixel(bounds.min().x, bounds.max().y, &inv_transform);
        let (col_b, row_b) = Self::world_to_pixel(bounds.max().x, bounds.min().y, &inv_transform);
        let min_col = (col_a.min(col_b).ceil() as i64 - 1).max(0);
        let max_col = (col_a.max(col_b).floor() as i64).min(width as i64 - 1);
        let min_row = (row_a.min(row_b).ceil() as i64 - 1).max(0);
        let max_row = (row_a.max(row_b).floor() as i64).min(height as i64 - 1);

        if max_col < min_col || max_row < min_row {
            debug!("Geometry bounds {:?} fall outside the {}x{} grid", bounds, height, width);
            return None;
        }

        let (min_row, max_row) = (min_row as usize, max_row as usize);
        let (min_col, max_col) = (min_col as usize, max_col as usize);

        let cell_coords: Vec<(usize, usize)> = (min_row..=max_row)
            .flat_map(|row| (min_col..=max_col).map(move |col| (row, col)))
            .collect();

        let selected: Vec<bool> = cell_coords
            .par_iter()
            .map(|&(row, col)| Self::cell_selected(row, col, transform, geometry, options))
            .collect();

        let kept: Vec<(usize, usize)> = cell_coords
            .iter()
            .zip(selected.iter())
            .filter(|(_, keep)| **keep)
            .map(|(coord, _)| *coord)
            .collect();

        if kept.is_empty() {
            return None;
        }

        let (row_start, col_start, rows, cols) = if options.drop {
            let r0 = kept.iter().map(|c| c.0).min().unwrap_or(min_row);
            let r1 = kept.iter().map(|c| c.0).max().unwrap_or(max_row);
            let c0 = kept.iter().map(|c| c.1).min().unwrap_or(min_col);
            let c1 = kept.iter().map(|c| c.1).max().unwrap_or(max_col);
            (r0, c0, r1 - r0 + 1, c1 - c0 + 1)
        } else {
            (0, 0, height, width)
        };

        let mut mask = Array2::from_elem((rows, cols), false);
        for (row, col) in kept {
            mask[[row - row_start, col - col_start]] = true;
        }

        // Update transform for subset
        let mut new_transform = *transform;
        new_transform[0] = transform[0] + col_start as f64 * transform[1] + row_start as f64 * transform[2];
        new_transform[3] = transform[3] + col_start as f64 * transform[4] + row_start as f64 * transform[5];

        Some(ClipWindow {
            row_start,
            col_start,
            mask,
            transform: new_transform,
        })
    }

    pub fn clip(
        series: &GriddedSeries,
        geometry: &MultiPolygon<f64>,
        options: ClipOptions,
    ) -> ClipOutcome<GriddedSeries> {
        let window = match Self::window(series.dims(), &series.transform, geometry, options) {
            Some(window) => window,
            None => return ClipOutcome::OutOfBounds,
        };

        debug!(
            "Clipped {:?} grid to {:?} window at ({}, {}) with {} cells retained",
            series.dims(),
            window.dims(),
            window.row_start,
            window.col_start,
            window.retained()
        );

        let mut clipped = series.map_bands(|data| window.apply3(data));
        clipped.transform = window.transform;

        if clipped.median_all_missing() {
            return ClipOutcome::Empty;
        }
        ClipOutcome::Clipped(clipped)
    }

    pub fn clip_production(
        grid: &ProductionGrid,
        geometry: &MultiPolygon<f64>,
        options: ClipOptions,
    ) -> ClipOutcome<ProductionGrid> {
        let window = match Self::window(grid.data.dim(), &grid.transform, geometry, options) {
            Some(window) => window,
            None => return ClipOutcome::OutOfBounds,
        };

        let data = window.apply2(grid.data.view());
        if data.iter().all(|v| v.is_nan()) {
            return ClipOutcome::Empty;
        }
        ClipOutcome::Clipped(ProductionGrid {
            data,
            transform: window.transform,
            crs: grid.crs,
        })
    }

    fn cell_selected(
        row: usize,
        col: usize,
        transform: &GeoTransform,
        geometry: &MultiPolygon<f64>,
        options: ClipOptions,
    ) -> bool {
        if options.all_touched {
            geometry.intersects(&Self::cell_rect(row, col, transform))
        } else {
            let (x, y) = Self::cell_center(row, col, transform);
            geometry.contains(&Point::new(x, y))
        }
    }

    /// Footprint of a cell in world coordinates.
    pub fn cell_rect(row: usize, col: usize, transform: &GeoTransform) -> Rect<f64> {
        let (x0, y0) = Self::pixel_to_world(col as f64, row as f64, transform);
        let (x1, y1) = Self::pixel_to_world(col as f64 + 1.0, row as f64 + 1.0, transform);
        Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 })
    }

    pub fn cell_center(row: usize, col: usize, transform: &GeoTransform) -> (f64, f64) {
        Self::pixel_to_world(col as f64 + 0.5, row as f64 + 0.5, transform)
    }

    pub fn pixel_to_world(col: f64, row: f64, transform: &GeoTransform) -> (f64, f64) {
        let x = transform[0] + col * transform[1] + row * transform[2];
        let y = transform[3] + col * transform[4] + row * transform[5];
        (x, y)
    }

    fn invert_transform(transform: &GeoTransform) -> GeoTransform {
        let det = transform[1] * transform[5] - transform[2] * transform[4];
        [
            -transform[0] * transform[5] / det + transform[2] * transform[3] / det,
            transform[5] / det,
            -transform[2] / det,
            transform[0] * transform[4] / det - transform[1] * transform[3] / det,
            -transform[4] / det,
            transform[1] / det,
        ]
    }

    fn world_to_pixel(x: f64, y: f64, inv_transform: &GeoTransform) -> (f64, f64) {
        let col = inv_transform[0] + inv_transform[1] * x + inv_transform[2] * y;
        let row = inv_transform[3] + inv_transform[4] * x + inv_transform[5] * y;
        (col, row)
    }
}

/// One non-missing median cell of the forecast map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub time: NaiveDate,
    pub y: f64,
    pub x: f64,
    #[serde(rename = "Percentile")]
    pub percentile: f64,
}

pub struct RasterIO;

impl RasterIO {
    pub fn read_manifest(path: &Path) -> Result<CatalogManifest> {
        let file = std::fs::File::open(path)?;
        let manifest: CatalogManifest = serde_json::from_reader(std::io::BufReader::new(file))?;
        info!(
            "Read catalog manifest {} ({} regions, {} crops, {} datasets)",
            path.display(),
            manifest.regions.len(),
            manifest.crops.len(),
            manifest.datasets.len()
        );
        Ok(manifest)
    }

    /// Flatten the median band into tidy points, skipping missing cells.
    pub fn map_points(series: &GriddedSeries) -> Vec<MapPoint> {
        let data = match series.band(Band::P50) {
            Some(data) => data,
            None => return Vec::new(),
        };
        let (n_times, n_rows, n_cols) = data.dim();
        let mut points = Vec::new();

        for t_idx in 0..n_times {
            for row in 0..n_rows {
                for col in 0..n_cols {
                    let value = data[[t_idx, row, col]];
                    if value.is_nan() {
                        continue;
                    }
                    let (x, y) = RasterClipper::cell_center(row, col, &series.transform);
                    points.push(MapPoint {
                        time: series.times[t_idx],
                        y,
                        x,
                        percentile: value,
                    });
                }
            }
        }
        points
    }

    pub fn write_map_csv<W: Write>(writer: W, points: &[MapPoint]) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        for point in points {
            writer.serialize(point)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Move the columns of a 0..360 longitude grid so that x runs from -180 to 180.
/// Grids that are not global, or already centred on the meridian, are returned as is.
pub fn shift_longitudes<D>(data: &Array<f64, D>, transform: &GeoTransform) -> (Array<f64, D>, GeoTransform)
where
    D: Dimension + RemoveAxis,
{
    let col_axis = Axis(data.ndim() - 1);
    let n_cols = data.len_of(col_axis);
    let dx = transform[1];
    let span = n_cols as f64 * dx;

    if dx <= 0.0 || (span - 360.0).abs() > dx * 0.5 || transform[0] < -dx * 0.5 {
        return (data.clone(), *transform);
    }

    let split = (0..n_cols)
        .find(|&col| transform[0] + (col as f64 + 0.5) * dx >= 180.0)
        .unwrap_or(n_cols);
    if split == n_cols {
        return (data.clone(), *transform);
    }

    let east = data.slice_axis(col_axis, Slice::from(split..));
    let west = data.slice_axis(col_axis, Slice::from(..split));
    let shifted = match ndarray::concatenate(col_axis, &[east, west]) {
        Ok(shifted) => shifted,
        Err(_) => return (data.clone(), *transform),
    };

    let mut new_transform = *transform;
    new_transform[0] = transform[0] + split as f64 * dx - 360.0;
    (shifted, new_transform)
}

fn replace_nodata<D: Dimension>(data: &mut Array<f64, D>, nodata: Option<f64>) {
    if let Some(nodata) = nodata {
        data.mapv_inplace(|v| if v == nodata { f64::NAN } else { v });
    }
}

/// A polygon as a list of rings; the first ring is the exterior, the rest are holes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolygonRecord {
    pub rings: Vec<Vec<[f64; 2]>>,
}

impl PolygonRecord {
    pub fn to_polygon(&self) -> Result<Polygon<f64>> {
        let mut rings = self.rings.iter().map(|ring| {
            if ring.len() < 3 {
                return Err(WaterBalanceError::Catalog(format!(
                    "ring has {} vertices, need at least 3",
                    ring.len()
                )));
            }
            let coords: Vec<(f64, f64)> = ring.iter().map(|c| (c[0], c[1])).collect();
            Ok(LineString::from(coords))
        });

        let exterior = match rings.next() {
            Some(ring) => ring?,
            None => return Err(WaterBalanceError::Catalog("polygon has no rings".to_string())),
        };
        let interiors = rings.collect::<Result<Vec<_>>>()?;

        // Polygon::new closes the rings
        Ok(Polygon::new(exterior, interiors))
    }
}

pub fn to_multipolygon(records: &[PolygonRecord]) -> Result<MultiPolygon<f64>> {
    let polygons = records
        .iter()
        .map(PolygonRecord::to_polygon)
        .collect::<Result<Vec<_>>>()?;
    Ok(MultiPolygon::new(polygons))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionRecord {
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
    pub polygons: Vec<PolygonRecord>,
    /// JSON list `[xmin, ymin, xmax, ymax]`
    pub bbox: String,
}

impl RegionRecord {
    pub fn into_region(self) -> Result<Region> {
        let geometry = to_multipolygon(&self.polygons)?;
        let bbox: [f64; 4] = serde_json::from_str(&self.bbox).map_err(|e| {
            WaterBalanceError::Catalog(format!("bad bbox for {}: {}", self.name, e))
        })?;
        Ok(Region {
            name: self.name,
            country: self.country,
            geometry,
            bbox,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterRecord {
    pub transform: GeoTransform,
    #[serde(default)]
    pub crs: Crs,
    #[serde(default)]
    pub nodata: Option<f64>,
    pub data: Array2<f64>,
}

impl RasterRecord {
    /// Production rasters: nodata and non-positive cells become missing,
    /// 0..360 longitudes are shifted to -180..180.
    pub fn into_production(self) -> ProductionGrid {
        let mut data = self.data;
        replace_nodata(&mut data, self.nodata);
        data.mapv_inplace(|v| if v <= 0.0 { f64::NAN } else { v });
        let (data, transform) = shift_longitudes(&data, &self.transform);
        ProductionGrid {
            data,
            transform,
            crs: self.crs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropRecord {
    pub crop: Crop,
    pub mask: Vec<PolygonRecord>,
    pub production: RasterRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub window: Window,
    pub horizon: Horizon,
    pub times: Vec<NaiveDate>,
    pub transform: GeoTransform,
    #[serde(default)]
    pub crs: Crs,
    #[serde(default)]
    pub nodata: Option<f64>,
    pub bands: BTreeMap<Band, Array3<f64>>,
}

impl DatasetRecord {
    pub fn into_series(self) -> Result<GriddedSeries> {
        let mut transform = self.transform;
        let mut series_bands = Vec::with_capacity(self.bands.len());
        for (band, mut data) in self.bands {
            replace_nodata(&mut data, self.nodata);
            let (shifted, shifted_transform) = shift_longitudes(&data, &self.transform);
            transform = shifted_transform;
            series_bands.push((band, shifted));
        }

        let mut series = GriddedSeries::new(self.times, transform, self.crs);
        for (band, data) in series_bands {
            series = series.with_band(band, data)?;
        }
        Ok(series)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogManifest {
    pub regions: Vec<RegionRecord>,
    pub crops: Vec<CropRecord>,
    pub datasets: Vec<DatasetRecord>,
}
