use crate::raster_io::{ClipOptions, ClipOutcome, RasterClipper};
use crate::types::*;
use ndarray::{Array2, Array3, Axis, Zip};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Offsets closer than this to a whole number of cells count as aligned.
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Crop-weighted historical and forecast series, each rescaled by its own
/// valid-cell count.
#[derive(Debug, Clone)]
pub struct WeightedSeries {
    pub historical: GriddedSeries,
    pub forecast: GriddedSeries,
    pub nrows_historical: usize,
    pub nrows_forecast: usize,
}

pub struct ProductionWeighter<'a> {
    production: &'a ProductionGrid,
}

impl<'a> ProductionWeighter<'a> {
    pub fn new(production: &'a ProductionGrid) -> Self {
        Self { production }
    }

    /// Production clipped to the region and divided by its regional total.
    pub fn standardize(&self, region: &Region) -> Result<ProductionGrid> {
        let clipped = match RasterClipper::clip_production(
            self.production,
            &region.geometry,
            ClipOptions::default(),
        ) {
            ClipOutcome::Clipped(grid) => grid,
            ClipOutcome::Empty => return Err(WaterBalanceError::ZeroProduction(region.name.clone())),
            ClipOutcome::OutOfBounds => {
                return Err(WaterBalanceError::NoDataInBounds(format!(
                    "production grid does not cover {}",
                    region.name
                )))
            }
        };

        let total = clipped.total();
        if !total.is_finite() || total <= 0.0 {
            return Err(WaterBalanceError::ZeroProduction(region.name.clone()));
        }
        debug!("Regional production total for {}: {}", region.name, total);

        Ok(ProductionGrid {
            data: clipped.data.mapv(|v| v / total),
            transform: clipped.transform,
            crs: clipped.crs,
        })
    }

    /// Weight both crop-clipped series by the regional production share and
    /// rescale each by its number of valid cells.
    pub fn apply(
        &self,
        region: &Region,
        historical: &GriddedSeries,
        forecast: &GriddedSeries,
    ) -> Result<WeightedSeries> {
        for series in [historical, forecast] {
            if series.crs != self.production.crs {
                return Err(WaterBalanceError::CrsMismatch {
                    expected: series.crs,
                    found: self.production.crs,
                });
            }
        }

        let weights = self.standardize(region)?;

        let historical = weight_series(historical, &weights)?;
        let forecast = weight_series(forecast, &weights)?;

        let nrows_historical = valid_cell_count(&historical, 0);
        let nrows_forecast = valid_cell_count(&forecast, 0);
        if nrows_historical == 0
            || nrows_forecast == 0
            || historical.median_all_missing()
            || forecast.median_all_missing()
        {
            return Err(WaterBalanceError::NoDataAvailable(format!(
                "no production inside the crop area of {}",
                region.name
            )));
        }
        if nrows_historical != nrows_forecast {
            warn!(
                "Valid cell counts differ for {}: historical {}, forecast {}",
                region.name, nrows_historical, nrows_forecast
            );
        }

        Ok(WeightedSeries {
            historical: rescale(&historical, nrows_historical),
            forecast: rescale(&forecast, nrows_forecast),
            nrows_historical,
            nrows_forecast,
        })
    }
}

/// Resample `weights` onto the grid of `series` by world coordinate.
/// Series cells outside the weight grid get `NaN`.
pub fn align_weights(series: &GriddedSeries, weights: &ProductionGrid) -> Result<Array2<f64>> {
    let st = &series.transform;
    let wt = &weights.transform;

    let same_size = (st[1] - wt[1]).abs() <= ALIGNMENT_TOLERANCE * st[1].abs()
        && (st[5] - wt[5]).abs() <= ALIGNMENT_TOLERANCE * st[5].abs();
    if !same_size || st[2] != 0.0 || st[4] != 0.0 || wt[2] != 0.0 || wt[4] != 0.0 {
        return Err(WaterBalanceError::GridMisaligned(format!(
            "cell size {}x{} vs {}x{}",
            st[1], st[5], wt[1], wt[5]
        )));
    }

    let col_offset = (st[0] - wt[0]) / st[1];
    let row_offset = (st[3] - wt[3]) / st[5];
    if (col_offset - col_offset.round()).abs() > ALIGNMENT_TOLERANCE
        || (row_offset - row_offset.round()).abs() > ALIGNMENT_TOLERANCE
    {
        return Err(WaterBalanceError::GridMisaligned(format!(
            "origins ({}, {}) and ({}, {}) are not a whole number of cells apart",
            st[0], st[3], wt[0], wt[3]
        )));
    }
    let (col_offset, row_offset) = (col_offset.round() as i64, row_offset.round() as i64);

    let (w_rows, w_cols) = weights.data.dim();
    let aligned = Array2::from_shape_fn(series.dims(), |(row, col)| {
        let w_row = row as i64 + row_offset;
        let w_col = col as i64 + col_offset;
        if w_row < 0 || w_col < 0 || w_row >= w_rows as i64 || w_col >= w_cols as i64 {
            f64::NAN
        } else {
            weights.data[[w_row as usize, w_col as usize]]
        }
    });
    Ok(aligned)
}

/// Multiply every band cell-wise by the aligned weights, broadcast over time.
pub fn weight_series(series: &GriddedSeries, weights: &ProductionGrid) -> Result<GriddedSeries> {
    let plane = align_weights(series, weights)?;
    Ok(series.map_bands(|data| {
        let mut out = data.clone();
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut step| {
                Zip::from(&mut step).and(&plane).for_each(|v, &w| *v *= w);
            });
        out
    }))
}

/// Cells where every band is present at time index `t`.
pub fn valid_cell_count(series: &GriddedSeries, t: usize) -> usize {
    if t >= series.times.len() || series.bands.is_empty() {
        return 0;
    }
    let (rows, cols) = series.dims();
    let mut valid = Array2::from_elem((rows, cols), true);
    for data in series.bands.values() {
        Zip::from(&mut valid)
            .and(&data.index_axis(Axis(0), t))
            .for_each(|ok, v| *ok &= v.is_finite());
    }
    valid.iter().filter(|ok| **ok).count()
}

fn rescale(series: &GriddedSeries, nrows: usize) -> GriddedSeries {
    let factor = nrows as f64;
    series.map_bands(|data: &Array3<f64>| data.mapv(|v| v * factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::SpatialAggregator;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;
    use geo_types::{LineString, MultiPolygon, Polygon};

    const TRANSFORM: GeoTransform = [0.0, 1.0, 0.0, 4.0, 0.0, -1.0];

    fn region(x0: f64, y0: f64, x1: f64, y1: f64) -> Region {
        Region {
            name: "Testland".to_string(),
            country: None,
            geometry: MultiPolygon::new(vec![Polygon::new(
                LineString::from(vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1)]),
                vec![],
            )]),
            bbox: [x0, y0, x1, y1],
        }
    }

    fn production() -> ProductionGrid {
        ProductionGrid {
            data: Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c + 1) as f64),
            transform: TRANSFORM,
            crs: Crs::WGS84,
        }
    }

    fn series(transform: GeoTransform) -> GriddedSeries {
        let times = vec![
            NaiveDate::from_ymd_opt(2025, 10, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
        ];
        let data = Array3::from_shape_fn((2, 2, 2), |(t, r, c)| 0.1 * (t + 1) as f64 + 0.2 * r as f64 + 0.05 * c as f64);
        GriddedSeries::new(times, transform, Crs::WGS84)
            .with_band(Band::P50, data)
            .unwrap()
    }

    #[test]
    fn test_standardized_production_sums_to_one() {
        let production = production();
        let weighter = ProductionWeighter::new(&production);
        let standardized = weighter.standardize(&region(0.2, 0.2, 3.8, 3.8)).unwrap();
        assert_abs_diff_eq!(standardized.total(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_production_fails() {
        let production = ProductionGrid {
            data: Array2::from_elem((4, 4), f64::NAN),
            transform: TRANSFORM,
            crs: Crs::WGS84,
        };
        let weighter = ProductionWeighter::new(&production);
        assert!(matches!(
            weighter.standardize(&region(0.2, 0.2, 1.8, 1.8)),
            Err(WaterBalanceError::ZeroProduction(_))
        ));
    }

    #[test]
    fn test_weighted_mean_equals_weighted_sum() {
        let production = production();
        let weighter = ProductionWeighter::new(&production);
        let area = region(1.2, 1.2, 2.8, 2.8);
        // 2x2 block at rows 1..3, cols 1..3 of the production grid
        let source = series([1.0, 1.0, 0.0, 3.0, 0.0, -1.0]);

        let weighted = weighter.apply(&area, &source, &source).unwrap();
        assert_eq!(weighted.nrows_historical, 4);
        assert_eq!(weighted.nrows_forecast, 4);

        let weights = weighter.standardize(&area).unwrap();
        let plane = align_weights(&source, &weights).unwrap();
        let values = source.band(Band::P50).unwrap();
        let means = SpatialAggregator::aggregate(&weighted.historical);
        for (t, mean) in means.band(Band::P50).unwrap().iter().enumerate() {
            let expected: f64 = Zip::from(&values.index_axis(Axis(0), t))
                .and(&plane)
                .fold(0.0, |acc, v, w| acc + v * w);
            assert_abs_diff_eq!(*mean, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_half_cell_offset_is_misaligned() {
        let production = production();
        let source = series([1.5, 1.0, 0.0, 3.0, 0.0, -1.0]);
        assert!(matches!(
            align_weights(&source, &production),
            Err(WaterBalanceError::GridMisaligned(_))
        ));
    }

    #[test]
    fn test_crs_mismatch_is_rejected() {
        let mut production = production();
        production.crs = Crs(4236);
        let weighter = ProductionWeighter::new(&production);
        let source = series([1.0, 1.0, 0.0, 3.0, 0.0, -1.0]);
        assert!(matches!(
            weighter.apply(&region(1.2, 1.2, 2.8, 2.8), &source, &source),
            Err(WaterBalanceError::CrsMismatch { .. })
        ));
    }

    #[test]
    fn test_no_production_under_series_is_no_data() {
        let mut production = production();
        production.data.fill(f64::NAN);
        production.data[[0, 0]] = 3.0;
        let weighter = ProductionWeighter::new(&production);
        let source = series([1.0, 1.0, 0.0, 3.0, 0.0, -1.0]);

        let err = weighter
            .apply(&region(0.2, 0.2, 3.8, 3.8), &source, &source)
            .unwrap_err();
        assert!(matches!(err, WaterBalanceError::NoDataAvailable(_)));
        assert!(err.is_no_data());
    }

    #[test]
    fn test_cells_without_production_become_missing() {
        let mut production = production();
        production.data[[1, 1]] = f64::NAN;
        let source = series([1.0, 1.0, 0.0, 3.0, 0.0, -1.0]);
        let weighted = weight_series(&source, &production).unwrap();
        assert!(weighted.band(Band::P50).unwrap()[[0, 0, 0]].is_nan());
        assert_eq!(valid_cell_count(&weighted, 0), 3);
    }
}
