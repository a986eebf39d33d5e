use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metrics::MetricSet;
use super::news::NewsContext;
use crate::pipeline::audit::AuditTrail;

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    pub report_date: NaiveDate,
    #[serde(default = "default_true")]
    pub include_news: bool,
    #[serde(default = "default_true")]
    pub include_charts: bool,
}

fn default_true() -> bool {
    true
}

impl ReportRequest {
    pub fn for_date(report_date: NaiveDate) -> Self {
        Self {
            report_date,
            include_news: true,
            include_charts: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub name: String,
    pub locator: String,
    pub media_type: String,
}

/// Optional enrichments that were lost to a recoverable failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    pub news: bool,
    pub narrative: bool,
    pub charts: bool,
}

impl Degradation {
    pub fn any(&self) -> bool {
        self.news || self.narrative || self.charts
    }
}

/// Aggregated view of the anonymized records. Never holds record-level data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSummary {
    pub total_records: usize,
    pub first_report_date: Option<NaiveDate>,
    pub last_report_date: Option<NaiveDate>,
    pub state_distribution: BTreeMap<String, usize>,
    pub age_distribution: BTreeMap<String, usize>,
    pub outcome_distribution: BTreeMap<String, usize>,
    pub icu_cases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub id: Uuid,
    pub report_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub metrics: MetricSet,
    pub narrative: String,
    pub news: Option<NewsContext>,
    pub data_summary: DataSummary,
    pub chart_refs: Vec<ChartRef>,
    pub degraded: Degradation,
    pub signature: String,
    pub audit: AuditTrail,
}
