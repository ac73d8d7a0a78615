use crate::types::{Result, WaterBalanceError};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of monthly steps in every forecast.
pub const FORECAST_STEPS: usize = 6;

/// The most recent historical months are not offered as chart cutoffs.
const SLIDER_TRIM: usize = 4;

/// Shift a month-start date by `months`, which may be negative.
pub fn shift_month(date: NaiveDate, months: i32) -> Option<NaiveDate> {
    let index = date.year() * 12 + date.month0() as i32 + months;
    NaiveDate::from_ymd_opt(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, 1)
}

pub fn month_start(date: NaiveDate) -> Option<NaiveDate> {
    date.with_day(1)
}

/// Month starts from `start` to `end`, both inclusive.
pub fn month_starts(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = month_start(start);
    while let Some(date) = current {
        if date > end {
            break;
        }
        dates.push(date);
        current = shift_month(date, 1);
    }
    dates
}

/// Month of the latest analysed data ("initial conditions" of the forecast).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "YearMonth", into = "YearMonth")]
pub struct InitialConditions(NaiveDate);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct YearMonth {
    year: i32,
    month: u32,
}

impl TryFrom<YearMonth> for InitialConditions {
    type Error = WaterBalanceError;

    fn try_from(value: YearMonth) -> Result<Self> {
        InitialConditions::new(value.year, value.month)
    }
}

impl From<InitialConditions> for YearMonth {
    fn from(ic: InitialConditions) -> Self {
        YearMonth {
            year: ic.year(),
            month: ic.month(),
        }
    }
}

impl InitialConditions {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(InitialConditions)
            .ok_or_else(|| {
                WaterBalanceError::Config(format!("invalid initial conditions {}-{}", year, month))
            })
    }

    /// Forecasts produced in a given month start from the previous month's data.
    pub fn preceding(today: NaiveDate) -> Self {
        let this_month = month_start(today).unwrap_or(today);
        InitialConditions(shift_month(this_month, -1).unwrap_or(this_month))
    }

    pub fn from_today() -> Self {
        Self::preceding(Utc::now().date_naive())
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn month_start(&self) -> NaiveDate {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliderPreset {
    All,
    Last5Years,
    Last5Months,
}

impl FromStr for SliderPreset {
    type Err = WaterBalanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "all" => Ok(SliderPreset::All),
            "last-5-years" => Ok(SliderPreset::Last5Years),
            "last-5-months" => Ok(SliderPreset::Last5Months),
            other => Err(WaterBalanceError::Config(format!(
                "unknown preset '{}', expected all, last-5-years or last-5-months",
                other
            ))),
        }
    }
}

/// Date axes shared by every dataset of one catalog release.
#[derive(Debug, Clone)]
pub struct Calendar {
    initial_conditions: InitialConditions,
    historical: Vec<NaiveDate>,
    forecast: Vec<NaiveDate>,
}

impl Calendar {
    pub fn new(historical_start: NaiveDate, initial_conditions: InitialConditions) -> Result<Self> {
        let ic = initial_conditions.month_start();
        if historical_start > ic {
            return Err(WaterBalanceError::Config(format!(
                "historical start {} is after initial conditions {}",
                historical_start, ic
            )));
        }

        let historical = month_starts(historical_start, ic);
        let forecast: Vec<NaiveDate> = (1..=FORECAST_STEPS as i32)
            .filter_map(|step| shift_month(ic, step))
            .collect();

        Ok(Self {
            initial_conditions,
            historical,
            forecast,
        })
    }

    pub fn initial_conditions(&self) -> InitialConditions {
        self.initial_conditions
    }

    pub fn historical_dates(&self) -> &[NaiveDate] {
        &self.historical
    }

    pub fn forecast_dates(&self) -> &[NaiveDate] {
        &self.forecast
    }

    pub fn first_forecast_date(&self) -> Option<NaiveDate> {
        self.forecast.first().copied()
    }

    /// Dates offered as chart cutoffs.
    pub fn slider_dates(&self) -> &[NaiveDate] {
        let end = self.historical.len().saturating_sub(SLIDER_TRIM);
        &self.historical[..end]
    }

    pub fn preset_index(&self, preset: SliderPreset) -> usize {
        let dates = self.slider_dates();
        match preset {
            SliderPreset::All => 0,
            SliderPreset::Last5Months => dates.len().saturating_sub(1),
            SliderPreset::Last5Years => NaiveDate::from_ymd_opt(self.initial_conditions.year() - 4, 1, 1)
                .and_then(|target| dates.iter().position(|d| *d == target))
                .unwrap_or(0),
        }
    }

    pub fn cutoff(&self, preset: SliderPreset) -> Option<NaiveDate> {
        self.slider_dates().get(self.preset_index(preset)).copied()
    }
}
