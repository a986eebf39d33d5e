use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CASE_GROWTH_RATE: &str = "case_growth_rate";
pub const MORTALITY_RATE: &str = "mortality_rate";
pub const ICU_OCCUPANCY_RATE: &str = "icu_occupancy_rate";
pub const VACCINATION_RATE: &str = "vaccination_rate";

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    /// Percentage; `None` when the indicator is undefined for this window.
    pub value: Option<f64>,
    pub numerator: u64,
    pub sample_size: u64,
    pub period: String,
    pub interpretation: String,
    pub low_confidence: bool,
    pub suspicious: bool,
    pub warnings: Vec<String>,
}

impl Metric {
    pub fn is_undefined(&self) -> bool {
        self.value.is_none()
    }

    pub fn display_value(&self) -> String {
        match self.value {
            Some(v) => format!("{v:.2}%"),
            None => "undefined".to_string(),
        }
    }
}

/// Marker carried by a [`MetricSet`] whose sample is below the configured
/// minimum. The metrics are still present, flagged `low_confidence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientData {
    pub observed: u64,
    pub required: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    pub reference_date: NaiveDate,
    pub period: String,
    pub current_window: DateWindow,
    pub previous_window: DateWindow,
    pub total_cases: u64,
    pub metrics: Vec<Metric>,
    pub insufficient_data: Option<InsufficientData>,
}

impl MetricSet {
    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn suspicious(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter().filter(|m| m.suspicious)
    }

    pub fn is_low_confidence(&self) -> bool {
        self.insufficient_data.is_some()
    }
}
