use crate::types::*;
use chrono::NaiveDate;
use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// One scalar per time step and band.
#[derive(Debug, Clone, PartialEq)]
pub struct BandSeries {
    pub times: Vec<NaiveDate>,
    pub values: BTreeMap<Band, Vec<f64>>,
}

impl BandSeries {
    pub fn band(&self, band: Band) -> Option<&[f64]> {
        self.values.get(&band).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Value of `band` at time index `t`, `NaN` when the band is absent.
    pub fn value(&self, band: Band, t: usize) -> f64 {
        self.band(band)
            .and_then(|values| values.get(t).copied())
            .unwrap_or(f64::NAN)
    }
}

pub struct SpatialAggregator;

impl SpatialAggregator {
    /// Mean over the (y, x) plane of every band, ignoring missing cells.
    pub fn aggregate(series: &GriddedSeries) -> BandSeries {
        let values = series
            .bands
            .iter()
            .map(|(band, data)| {
                let means: Vec<f64> = data
                    .axis_iter(Axis(0))
                    .into_par_iter()
                    .map(Self::nanmean)
                    .collect();
                (*band, means)
            })
            .collect();

        BandSeries {
            times: series.times.clone(),
            values,
        }
    }

    /// `NaN` when no cell has a value.
    pub fn nanmean(plane: ArrayView2<f64>) -> f64 {
        let (sum, count) = plane
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
        if count == 0 {
            f64::NAN
        } else {
            sum / count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr2, Array3};

    #[test]
    fn test_nanmean_skips_missing() {
        let plane = arr2(&[[1.0, f64::NAN], [3.0, 5.0]]);
        assert_relative_eq!(SpatialAggregator::nanmean(plane.view()), 3.0);
        let empty = arr2(&[[f64::NAN, f64::NAN]]);
        assert!(SpatialAggregator::nanmean(empty.view()).is_nan());
    }

    #[test]
    fn test_aggregate_preserves_time_order() {
        let times: Vec<NaiveDate> = (1..=12)
            .map(|m| NaiveDate::from_ymd_opt(2024, m, 1).unwrap())
            .collect();
        let data = Array3::from_shape_fn((12, 3, 3), |(t, r, c)| t as f64 + (r as f64 - c as f64) * 0.1);
        let series = GriddedSeries::new(times.clone(), [0.0, 1.0, 0.0, 3.0, 0.0, -1.0], Crs::WGS84)
            .with_band(Band::P50, data.clone())
            .unwrap()
            .with_band(Band::P95, data.mapv(|v| v + 1.0))
            .unwrap();

        let means = SpatialAggregator::aggregate(&series);
        assert_eq!(means.times, times);
        for t in 0..12 {
            assert_relative_eq!(means.value(Band::P50, t), t as f64, epsilon = 1e-12);
            assert_relative_eq!(means.value(Band::P95, t), t as f64 + 1.0, epsilon = 1e-12);
        }
        assert!(means.value(Band::P5, 0).is_nan());
    }
}
