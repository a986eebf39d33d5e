use chrono::{Duration, NaiveDate};

use crate::models::metrics::{
    CASE_GROWTH_RATE, DateWindow, ICU_OCCUPANCY_RATE, InsufficientData, MORTALITY_RATE, Metric,
    MetricSet, VACCINATION_RATE,
};
use crate::models::{CaseRecord, Outcome, VaccinationStatus};

/// Records split into the current reporting window and the preceding window
/// of equal length.
#[derive(Debug)]
pub struct MetricInput<'a> {
    pub current: Vec<&'a CaseRecord>,
    pub previous: Vec<&'a CaseRecord>,
}

impl MetricInput<'_> {
    pub fn current_where(&self, pred: impl Fn(&CaseRecord) -> bool) -> u64 {
        self.current.iter().filter(|r| pred(r)).count() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    pub value: Option<f64>,
    pub numerator: u64,
    pub sample_size: u64,
}

pub type MetricFn = fn(&MetricInput<'_>) -> MetricValue;
pub type InterpretFn = fn(Option<f64>) -> String;

struct MetricDefinition {
    name: String,
    compute: MetricFn,
    interpret: InterpretFn,
}

/// Ordered set of named metric functions. Output order follows
/// registration order.
pub struct MetricRegistry {
    definitions: Vec<MetricDefinition>,
}

impl MetricRegistry {
    pub fn empty() -> Self {
        Self {
            definitions: Vec::new(),
        }
    }

    /// Registers `name`, replacing any previous definition with that name.
    pub fn register(&mut self, name: &str, compute: MetricFn, interpret: InterpretFn) {
        let definition = MetricDefinition {
            name: name.to_string(),
            compute,
            interpret,
        };
        match self.definitions.iter_mut().find(|d| d.name == name) {
            Some(existing) => *existing = definition,
            None => self.definitions.push(definition),
        }
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CASE_GROWTH_RATE, case_growth_rate, interpret_growth);
        registry.register(MORTALITY_RATE, mortality_rate, interpret_mortality);
        registry.register(ICU_OCCUPANCY_RATE, icu_occupancy_rate, interpret_icu);
        registry.register(VACCINATION_RATE, vaccination_rate, interpret_vaccination);
        registry
    }
}

pub struct MetricsEngine {
    registry: MetricRegistry,
    period_days: u32,
    min_sample_size: u64,
}

impl MetricsEngine {
    pub fn new(registry: MetricRegistry, period_days: u32, min_sample_size: u64) -> Self {
        Self {
            registry,
            period_days,
            min_sample_size,
        }
    }

    pub fn windows(&self, reference_date: NaiveDate) -> (DateWindow, DateWindow) {
        let period = Duration::days(i64::from(self.period_days));
        let current = DateWindow {
            start: reference_date - period,
            end: reference_date,
        };
        let previous_end = current.start - Duration::days(1);
        let previous = DateWindow {
            start: previous_end - period,
            end: previous_end,
        };
        (current, previous)
    }

    /// Never fails: a small sample yields `low_confidence` metrics and an
    /// `insufficient_data` marker, an empty one yields undefined rates.
    #[tracing::instrument(
        name = "pipeline_stage metrics",
        skip(self, records),
        fields(
            pipeline.stage = "metrics",
            metrics.records = records.len(),
            metrics.total_cases,
            metrics.low_confidence,
        )
    )]
    pub fn compute(&self, records: &[CaseRecord], reference_date: NaiveDate) -> MetricSet {
        let (current_window, previous_window) = self.windows(reference_date);
        let input = MetricInput {
            current: records
                .iter()
                .filter(|r| current_window.contains(r.report_date))
                .collect(),
            previous: records
                .iter()
                .filter(|r| previous_window.contains(r.report_date))
                .collect(),
        };

        let total_cases = input.current.len() as u64;
        let insufficient_data = (total_cases < self.min_sample_size).then_some(InsufficientData {
            observed: total_cases,
            required: self.min_sample_size,
        });
        let period = format!("{}_days", self.period_days);

        let metrics = self
            .registry
            .definitions
            .iter()
            .map(|def| {
                let computed = (def.compute)(&input);
                let value = computed.value.map(round2);
                Metric {
                    name: def.name.clone(),
                    value,
                    numerator: computed.numerator,
                    sample_size: computed.sample_size,
                    period: period.clone(),
                    interpretation: (def.interpret)(value),
                    low_confidence: insufficient_data.is_some(),
                    suspicious: false,
                    warnings: Vec::new(),
                }
            })
            .collect();

        if let Some(marker) = insufficient_data {
            tracing::warn!(
                observed = marker.observed,
                required = marker.required,
                "Sample below minimum size, metrics marked low confidence"
            );
        }

        let span = tracing::Span::current();
        span.record("metrics.total_cases", total_cases);
        span.record("metrics.low_confidence", insufficient_data.is_some());

        MetricSet {
            reference_date,
            period,
            current_window,
            previous_window,
            total_cases,
            metrics,
            insufficient_data,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn ratio(numerator: u64, sample_size: u64) -> MetricValue {
    let value = (sample_size > 0).then(|| numerator as f64 / sample_size as f64 * 100.0);
    MetricValue {
        value,
        numerator,
        sample_size,
    }
}

/// Undefined whenever the preceding window is empty, including when both
/// windows are empty.
pub fn case_growth_rate(input: &MetricInput<'_>) -> MetricValue {
    let current = input.current.len() as u64;
    let previous = input.previous.len() as u64;
    let value = (previous > 0).then(|| (current as f64 - previous as f64) / previous as f64 * 100.0);
    MetricValue {
        value,
        numerator: current,
        sample_size: previous,
    }
}

pub fn mortality_rate(input: &MetricInput<'_>) -> MetricValue {
    ratio(
        input.current_where(|r| r.outcome == Outcome::Deceased),
        input.current.len() as u64,
    )
}

pub fn icu_occupancy_rate(input: &MetricInput<'_>) -> MetricValue {
    ratio(
        input.current_where(|r| r.icu_flag),
        input.current.len() as u64,
    )
}

pub fn vaccination_rate(input: &MetricInput<'_>) -> MetricValue {
    ratio(
        input.current_where(|r| r.vaccination_status == VaccinationStatus::Vaccinated),
        input.current.len() as u64,
    )
}

fn interpret_growth(value: Option<f64>) -> String {
    match value {
        None => "No cases in the preceding period; growth is undefined".to_string(),
        Some(v) if v > 0.0 => format!("Increase of {v:.1}% over the preceding period"),
        Some(v) if v < 0.0 => format!("Decrease of {:.1}% over the preceding period", v.abs()),
        Some(_) => "Case count stable".to_string(),
    }
}

fn banded(value: Option<f64>, label: &str, zero: &str, low: f64, moderate: f64) -> String {
    match value {
        None => "No data for the analysed period".to_string(),
        Some(v) if v == 0.0 => zero.to_string(),
        Some(v) if v < low => format!("Low {label}: {v:.1}%"),
        Some(v) if v < moderate => format!("Moderate {label}: {v:.1}%"),
        Some(v) => format!("High {label}: {v:.1}%"),
    }
}

fn interpret_mortality(value: Option<f64>) -> String {
    banded(value, "mortality rate", "No deaths recorded in the period", 5.0, 15.0)
}

fn interpret_icu(value: Option<f64>) -> String {
    banded(value, "ICU rate", "No ICU admissions recorded", 20.0, 40.0)
}

fn interpret_vaccination(value: Option<f64>) -> String {
    banded(value, "vaccination rate", "No vaccinated cases identified", 30.0, 70.0)
}
