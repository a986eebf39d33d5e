use std::path::PathBuf;

use chrono::{Duration, NaiveDate};

use crate::error::PipelineError;
use crate::models::case::parse_date;
use crate::models::metrics::DateWindow;
use crate::models::{Age, CaseRecord, Outcome, RawCaseRow, Region, VaccinationStatus};

/// Rows fetched from a source, with the number of entries the source itself
/// could not decode.
#[derive(Debug, Default)]
pub struct SourceRows {
    pub rows: Vec<RawCaseRow>,
    pub malformed: usize,
}

/// Backing store of surveillance rows.
///
/// `window` is a hint; sources may return rows outside it and
/// [`load_window`] filters them. A missing or unreadable store must be
/// reported as [`PipelineError::DataUnavailable`].
#[async_trait::async_trait]
pub trait CaseSource: Send + Sync {
    async fn fetch(&self, window: DateWindow) -> Result<SourceRows, PipelineError>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Default)]
pub struct DiscardStats {
    pub malformed: usize,
    pub unparseable_date: usize,
    pub missing_mandatory: usize,
    pub outside_window: usize,
}

impl DiscardStats {
    pub fn total(&self) -> usize {
        self.malformed + self.unparseable_date + self.missing_mandatory + self.outside_window
    }
}

#[derive(Debug)]
pub struct LoadedWindow {
    pub window: DateWindow,
    pub records: Vec<CaseRecord>,
    pub discarded: DiscardStats,
}

enum RowRejection {
    UnparseableDate,
    MissingMandatory,
}

pub fn window_for(reference_date: NaiveDate, lookback_days: u32) -> DateWindow {
    DateWindow {
        start: reference_date - Duration::days(i64::from(lookback_days)),
        end: reference_date,
    }
}

#[tracing::instrument(
    name = "pipeline_stage retrieve",
    skip(source),
    fields(
        pipeline.stage = "retrieve",
        source = source.name(),
        retrieve.records,
        retrieve.discarded,
    )
)]
pub async fn load_window(
    source: &dyn CaseSource,
    reference_date: NaiveDate,
    lookback_days: u32,
) -> Result<LoadedWindow, PipelineError> {
    if lookback_days == 0 {
        return Err(PipelineError::InvalidRequest(
            "lookback_days must be greater than zero".into(),
        ));
    }

    let window = window_for(reference_date, lookback_days);
    let fetched = source.fetch(window).await?;

    let mut discarded = DiscardStats {
        malformed: fetched.malformed,
        ..Default::default()
    };
    let mut records = Vec::with_capacity(fetched.rows.len());

    for row in fetched.rows {
        match parse_row(&row) {
            Ok(record) if window.contains(record.report_date) => records.push(record),
            Ok(_) => discarded.outside_window += 1,
            Err(RowRejection::UnparseableDate) => discarded.unparseable_date += 1,
            Err(RowRejection::MissingMandatory) => discarded.missing_mandatory += 1,
        }
    }

    records.sort_by_key(|r| r.report_date);

    let span = tracing::Span::current();
    span.record("retrieve.records", records.len());
    span.record("retrieve.discarded", discarded.total());

    Ok(LoadedWindow {
        window,
        records,
        discarded,
    })
}

fn parse_row(row: &RawCaseRow) -> Result<CaseRecord, RowRejection> {
    let raw_date = row
        .report_date
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(RowRejection::MissingMandatory)?;
    let report_date = parse_date(raw_date).ok_or(RowRejection::UnparseableDate)?;

    let onset_date = match row.onset_date.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => Some(parse_date(raw).ok_or(RowRejection::UnparseableDate)?),
        None => None,
    };

    let outcome = row
        .outcome
        .as_deref()
        .and_then(Outcome::parse)
        .ok_or(RowRejection::MissingMandatory)?;

    let age = match row.age {
        Some(years) if (0..=120).contains(&years) => Age::Exact(years),
        _ => Age::Unknown,
    };

    Ok(CaseRecord {
        report_date,
        onset_date,
        outcome,
        icu_flag: row.icu.as_deref().map(str::trim) == Some("1"),
        vaccination_status: VaccinationStatus::parse(row.vaccination.as_deref()),
        region: Region::new(row.state.as_deref(), row.municipality_code.as_deref()),
        age,
        notification_id: row.notification_id.clone(),
    })
}

/// Reads one JSON object per line.
pub struct JsonLinesCaseSource {
    path: PathBuf,
}

impl JsonLinesCaseSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl CaseSource for JsonLinesCaseSource {
    async fn fetch(&self, _window: DateWindow) -> Result<SourceRows, PipelineError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PipelineError::DataUnavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;

        let mut out = SourceRows::default();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RawCaseRow>(line) {
                Ok(row) => out.rows.push(row),
                Err(_) => out.malformed += 1,
            }
        }

        if out.rows.is_empty() && out.malformed > 0 {
            return Err(PipelineError::DataUnavailable(format!(
                "{} contains no decodable rows",
                self.path.display()
            )));
        }

        tracing::info!(
            path = %self.path.display(),
            rows = out.rows.len(),
            malformed = out.malformed,
            "Case rows read"
        );

        Ok(out)
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

/// Fixed rows held in memory. `unavailable()` simulates a missing store.
pub struct InMemoryCaseSource {
    rows: Option<Vec<RawCaseRow>>,
}

impl InMemoryCaseSource {
    pub fn new(rows: Vec<RawCaseRow>) -> Self {
        Self { rows: Some(rows) }
    }

    pub fn unavailable() -> Self {
        Self { rows: None }
    }
}

#[async_trait::async_trait]
impl CaseSource for InMemoryCaseSource {
    async fn fetch(&self, _window: DateWindow) -> Result<SourceRows, PipelineError> {
        match &self.rows {
            Some(rows) => Ok(SourceRows {
                rows: rows.clone(),
                malformed: 0,
            }),
            None => Err(PipelineError::DataUnavailable(
                "in-memory source has no data".into(),
            )),
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}
