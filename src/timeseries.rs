//! Historical and forecast band series merged into one export table, plus the
//! chart view that joins the two horizons without a gap.

use crate::aggregate::BandSeries;
use crate::calendar::shift_month;
use crate::catalog::ALL_STATES;
use crate::types::*;
use chrono::NaiveDate;
use serde::Serialize;
use std::io::{Read, Write};

/// Column order of the exported table.
pub const COLUMNS: [&str; 11] = [
    "country",
    "state",
    "crop",
    "type",
    "window",
    "time",
    "percentile",
    "5%",
    "20%",
    "80%",
    "95%",
];

/// Which horizons are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toggles {
    pub historical: bool,
    pub forecast: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            historical: true,
            forecast: true,
        }
    }
}

impl Toggles {
    pub fn label(&self) -> Option<&'static str> {
        match (self.historical, self.forecast) {
            (true, true) => Some("Historical and forecasted"),
            (true, false) => Some("Historical"),
            (false, true) => Some("Forecasted"),
            (false, false) => None,
        }
    }
}

/// Values copied onto every row of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLabels {
    pub country: String,
    pub state: String,
    pub crop: String,
    pub window: u32,
}

/// Four decimals, ties to even.
fn round4(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some((value * 10_000.0).round_ties_even() / 10_000.0)
    } else {
        None
    }
}

pub struct TimeSeriesAssembler;

impl TimeSeriesAssembler {
    pub fn assemble(
        labels: &RowLabels,
        historical: &BandSeries,
        forecast: &BandSeries,
        toggles: Toggles,
    ) -> TimeSeriesTable {
        let mut rows = Vec::new();

        if toggles.historical {
            rows.extend(historical.times.iter().enumerate().map(|(t, time)| {
                Self::row(labels, Horizon::Historical, *time, historical.value(Band::P50, t), None)
            }));
        }
        if toggles.forecast {
            rows.extend(forecast.times.iter().enumerate().map(|(t, time)| {
                let bands = [Band::P5, Band::P20, Band::P80, Band::P95].map(|band| forecast.value(band, t));
                Self::row(labels, Horizon::Forecast, *time, forecast.value(Band::P50, t), Some(bands))
            }));
        }

        rows.sort_by(|a, b| b.time.cmp(&a.time));
        TimeSeriesTable { rows }
    }

    fn row(
        labels: &RowLabels,
        kind: Horizon,
        time: NaiveDate,
        median: f64,
        bands: Option<[f64; 4]>,
    ) -> TimeSeriesRow {
        let [p5, p20, p80, p95] = bands.map_or([None; 4], |values| values.map(round4));
        TimeSeriesRow {
            country: labels.country.clone(),
            state: labels.state.clone(),
            crop: labels.crop.clone(),
            kind,
            window: labels.window,
            time,
            percentile: round4(median),
            p5,
            p20,
            p80,
            p95,
        }
    }
}

/// Table rows without the uncertainty bands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayRow<'a> {
    pub country: &'a str,
    pub state: &'a str,
    pub crop: &'a str,
    #[serde(rename = "type")]
    pub kind: Horizon,
    pub window: u32,
    pub time: NaiveDate,
    pub percentile: Option<f64>,
}

/// Rows sorted by time, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesTable {
    rows: Vec<TimeSeriesRow>,
}

impl TimeSeriesTable {
    pub fn rows(&self) -> &[TimeSeriesRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count(&self, kind: Horizon) -> usize {
        self.rows.iter().filter(|row| row.kind == kind).count()
    }

    /// Rows on or after `cutoff`.
    pub fn since(&self, cutoff: NaiveDate) -> TimeSeriesTable {
        TimeSeriesTable {
            rows: self.rows.iter().filter(|row| row.time >= cutoff).cloned().collect(),
        }
    }

    pub fn display_rows(&self) -> Vec<DisplayRow<'_>> {
        self.rows
            .iter()
            .map(|row| DisplayRow {
                country: &row.country,
                state: &row.state,
                crop: &row.crop,
                kind: row.kind,
                window: row.window,
                time: row.time,
                percentile: row.percentile,
            })
            .collect()
    }

    /// The header is written even when the table is empty.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
        writer.write_record(COLUMNS)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        if headers.iter().ne(COLUMNS.iter().copied()) {
            return Err(WaterBalanceError::Catalog(format!(
                "unexpected table columns: {:?}",
                headers
            )));
        }
        let rows = reader
            .deserialize()
            .collect::<std::result::Result<Vec<TimeSeriesRow>, csv::Error>>()?;
        Ok(Self { rows })
    }
}

/// Chart-ready segments, each in chronological order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartView {
    pub historical: Vec<TimeSeriesRow>,
    pub forecast: Vec<TimeSeriesRow>,
    /// Last historical row followed by the first forecast row.
    pub bridge: Vec<TimeSeriesRow>,
}

impl ChartView {
    pub fn build(table: &TimeSeriesTable, cutoff: Option<NaiveDate>, toggles: Toggles) -> Result<Self> {
        let windowed = match cutoff {
            Some(cutoff) => table.since(cutoff),
            None => table.clone(),
        };
        let rows = windowed.rows();

        let chronological = |slice: &[TimeSeriesRow]| slice.iter().rev().cloned().collect::<Vec<_>>();
        let only = |kind: Horizon| {
            rows.iter()
                .rev()
                .filter(|row| row.kind == kind)
                .cloned()
                .collect::<Vec<_>>()
        };

        if !(toggles.historical && toggles.forecast) {
            return Ok(Self {
                historical: if toggles.historical { only(Horizon::Historical) } else { Vec::new() },
                forecast: if toggles.forecast { only(Horizon::Forecast) } else { Vec::new() },
                bridge: Vec::new(),
            });
        }

        let n_forecast = rows.iter().take_while(|row| row.kind == Horizon::Forecast).count();
        if n_forecast == 0 || n_forecast == rows.len() {
            if rows.iter().skip(n_forecast).any(|row| row.kind == Horizon::Forecast) {
                return Err(WaterBalanceError::InvalidChartLayout(
                    "forecast rows below the historical head".to_string(),
                ));
            }
            return Ok(Self {
                historical: only(Horizon::Historical),
                forecast: only(Horizon::Forecast),
                bridge: Vec::new(),
            });
        }

        let boundary = &rows[n_forecast];
        let first_forecast = &rows[n_forecast - 1];
        if rows[n_forecast..].iter().any(|row| row.kind != Horizon::Historical) {
            return Err(WaterBalanceError::InvalidChartLayout(
                "historical and forecast rows are interleaved".to_string(),
            ));
        }
        if shift_month(boundary.time, 1) != Some(first_forecast.time) {
            return Err(WaterBalanceError::InvalidChartLayout(format!(
                "last historical month {} is not followed by forecast month {}",
                boundary.time, first_forecast.time
            )));
        }

        Ok(Self {
            historical: chronological(&rows[n_forecast..]),
            forecast: chronological(&rows[..=n_forecast]),
            bridge: chronological(&rows[n_forecast - 1..=n_forecast]),
        })
    }
}

/// File name for a downloaded table.
pub fn export_filename(
    labels: &RowLabels,
    toggles: Toggles,
    first_forecast: NaiveDate,
) -> String {
    let crop = if labels.crop == CropSelection::None.name() { "" } else { labels.crop.as_str() };
    let name = format!(
        "drought-table-{}-{}-{}-{}-{}-{}month-{}.csv",
        labels.country.to_lowercase(),
        labels.state.to_lowercase(),
        if toggles.historical { "historical" } else { "" },
        if toggles.forecast { "forecast" } else { "" },
        crop,
        labels.window,
        first_forecast.format("%Y-%m-%d")
    );
    name.replace(' ', "-").replace("--", "-").replace("--", "-")
}

pub fn chart_title(country: &str, state: &str, toggles: Toggles) -> Option<String> {
    let label = toggles.label()?;
    let state_part = if state.is_empty() || state == ALL_STATES {
        String::new()
    } else {
        format!("{}, ", state)
    };
    Some(format!("{} water balance for {}{}", label, state_part, country))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn month(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn labels() -> RowLabels {
        RowLabels {
            country: "Kenya".to_string(),
            state: "All".to_string(),
            crop: "none".to_string(),
            window: 3,
        }
    }

    fn band_series(times: Vec<NaiveDate>, bands: &[Band]) -> BandSeries {
        let n = times.len();
        let values: BTreeMap<Band, Vec<f64>> = bands
            .iter()
            .map(|band| (*band, (0..n).map(|t| 0.123456 + t as f64 * 0.01).collect()))
            .collect();
        BandSeries { times, values }
    }

    fn inputs() -> (BandSeries, BandSeries) {
        let historical = band_series((1..=9).map(|m| month(2025, m)).collect(), &[Band::P50]);
        let forecast = band_series(
            vec![month(2025, 10), month(2025, 11), month(2025, 12), month(2026, 1), month(2026, 2), month(2026, 3)],
            &Band::ALL,
        );
        (historical, forecast)
    }

    #[test]
    fn test_assemble_sorts_descending_and_rounds() {
        let (historical, forecast) = inputs();
        let table = TimeSeriesAssembler::assemble(&labels(), &historical, &forecast, Toggles::default());
        assert_eq!(table.len(), 15);
        assert_eq!(table.rows()[0].time, month(2026, 3));
        assert_eq!(table.rows()[14].time, month(2025, 1));
        assert!(table.rows().windows(2).all(|pair| pair[0].time > pair[1].time));

        let oldest = &table.rows()[14];
        assert_eq!(oldest.percentile, Some(0.1235));
        assert_eq!(oldest.p5, None);
        assert_eq!(oldest.p95, None);
        assert_eq!(table.rows()[0].p5, Some(0.1735));
    }

    #[test]
    fn test_round4_ties_to_even() {
        assert_eq!(round4(0.00025), Some(0.0002));
        assert_eq!(round4(0.00035), Some(0.0004));
        assert_eq!(round4(0.12345), Some(0.1234));
        assert_eq!(round4(-0.00025), Some(-0.0002));
        assert_eq!(round4(f64::NAN), None);
    }

    #[test]
    fn test_both_toggles_off_keeps_schema() {
        let (historical, forecast) = inputs();
        let toggles = Toggles {
            historical: false,
            forecast: false,
        };
        let table = TimeSeriesAssembler::assemble(&labels(), &historical, &forecast, toggles);
        assert!(table.is_empty());

        let mut buffer = Vec::new();
        table.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.trim_end(), COLUMNS.join(","));
        assert!(TimeSeriesTable::read_csv(text.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_csv_round_trip() {
        let (historical, forecast) = inputs();
        let table = TimeSeriesAssembler::assemble(&labels(), &historical, &forecast, Toggles::default());
        let mut buffer = Vec::new();
        table.write_csv(&mut buffer).unwrap();
        let read = TimeSeriesTable::read_csv(buffer.as_slice()).unwrap();
        assert_eq!(read, table);
    }

    #[test]
    fn test_bridge_starts_at_last_historical_row() {
        let (historical, forecast) = inputs();
        let table = TimeSeriesAssembler::assemble(&labels(), &historical, &forecast, Toggles::default());
        let view = ChartView::build(&table, Some(month(2025, 5)), Toggles::default()).unwrap();

        assert_eq!(view.historical.len(), 5);
        assert_eq!(view.forecast.len(), 7);
        assert_eq!(view.bridge.len(), 2);
        assert_eq!(view.bridge[0], *view.historical.last().unwrap());
        assert_eq!(view.bridge[0], view.forecast[0]);
        assert_eq!(view.bridge[1].time, month(2025, 10));
        assert_eq!(view.bridge[1].kind, Horizon::Forecast);
    }

    #[test]
    fn test_chart_rejects_gap_between_horizons() {
        let (historical, _) = inputs();
        let late = band_series(vec![month(2025, 12), month(2026, 1)], &Band::ALL);
        let table = TimeSeriesAssembler::assemble(&labels(), &historical, &late, Toggles::default());
        assert!(matches!(
            ChartView::build(&table, None, Toggles::default()),
            Err(WaterBalanceError::InvalidChartLayout(_))
        ));
    }

    #[test]
    fn test_single_horizon_chart_has_no_bridge() {
        let (historical, forecast) = inputs();
        let toggles = Toggles {
            historical: false,
            forecast: true,
        };
        let table = TimeSeriesAssembler::assemble(&labels(), &historical, &forecast, toggles);
        let view = ChartView::build(&table, None, toggles).unwrap();
        assert!(view.historical.is_empty());
        assert!(view.bridge.is_empty());
        assert_eq!(view.forecast.first().unwrap().time, month(2025, 10));
    }

    #[test]
    fn test_export_filename() {
        let (first, toggles) = (month(2025, 10), Toggles::default());
        assert_eq!(
            export_filename(&labels(), toggles, first),
            "drought-table-kenya-all-historical-forecast-3month-2025-10-01.csv"
        );

        let labels = RowLabels {
            country: "United States".to_string(),
            state: "New York".to_string(),
            crop: "maize".to_string(),
            window: 3,
        };
        let forecast_only = Toggles {
            historical: false,
            forecast: true,
        };
        assert_eq!(
            export_filename(&labels, forecast_only, first),
            "drought-table-united-states-new-york-forecast-maize-3month-2025-10-01.csv"
        );
    }

    #[test]
    fn test_chart_title() {
        assert_eq!(
            chart_title("Kenya", "All", Toggles::default()).unwrap(),
            "Historical and forecasted water balance for Kenya"
        );
        let historical_only = Toggles {
            historical: true,
            forecast: false,
        };
        assert_eq!(
            chart_title("Kenya", "Nairobi", historical_only).unwrap(),
            "Historical water balance for Nairobi, Kenya"
        );
        assert!(chart_title(
            "Kenya",
            "All",
            Toggles {
                historical: false,
                forecast: false
            }
        )
        .is_none());
    }
}
