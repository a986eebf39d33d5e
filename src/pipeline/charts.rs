use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{Datelike, Duration, NaiveDate};
use serde_json::{Value, json};

use crate::error::PipelineError;
use crate::models::ChartRef;

use super::guardrails::AnonymizedRecords;

pub const VEGA_LITE_MEDIA_TYPE: &str = "application/vnd.vegalite.v5+json";
const VEGA_LITE_SCHEMA: &str = "https://vega.github.io/schema/vega-lite/v5.json";

const DAILY_DAYS: i64 = 30;
const MONTHLY_MONTHS: u32 = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    pub name: String,
    pub payload: Value,
}

/// Destination of rendered chart payloads. Returns where the chart can be
/// found.
#[async_trait::async_trait]
pub trait ChartSink: Send + Sync {
    async fn publish(&self, chart: &ChartSpec) -> anyhow::Result<ChartRef>;
}

/// Writes each chart as `<dir>/<name>.vl.json`.
pub struct FsChartSink {
    dir: PathBuf,
}

impl FsChartSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl ChartSink for FsChartSink {
    async fn publish(&self, chart: &ChartSpec) -> anyhow::Result<ChartRef> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.vl.json", chart.name));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&chart.payload)?).await?;

        Ok(ChartRef {
            name: chart.name.clone(),
            locator: path.display().to_string(),
            media_type: VEGA_LITE_MEDIA_TYPE.to_string(),
        })
    }
}

/// Case counts for each of the last 30 days, zero-filled.
pub fn daily_series(records: &AnonymizedRecords, reference_date: NaiveDate) -> Vec<(NaiveDate, usize)> {
    let start = reference_date - Duration::days(DAILY_DAYS - 1);
    let mut counts: BTreeMap<NaiveDate, usize> = (0..DAILY_DAYS)
        .map(|offset| (start + Duration::days(offset), 0))
        .collect();

    for record in records.as_slice() {
        if let Some(count) = counts.get_mut(&record.report_date) {
            *count += 1;
        }
    }
    counts.into_iter().collect()
}

/// Case counts per calendar month for the 12 months ending with the
/// reference month, zero-filled. Keys are `YYYY-MM`.
pub fn monthly_series(records: &AnonymizedRecords, reference_date: NaiveDate) -> Vec<(String, usize)> {
    let month_index = |d: NaiveDate| d.year() * 12 + d.month0() as i32;
    let last = month_index(reference_date);
    let first = last - (MONTHLY_MONTHS as i32 - 1);

    let mut counts: BTreeMap<i32, usize> = (first..=last).map(|m| (m, 0)).collect();
    for record in records.as_slice() {
        if let Some(count) = counts.get_mut(&month_index(record.report_date)) {
            *count += 1;
        }
    }

    counts
        .into_iter()
        .map(|(idx, n)| (format!("{:04}-{:02}", idx.div_euclid(12), idx.rem_euclid(12) + 1), n))
        .collect()
}

fn bar_chart(title: &str, x_field: &str, x_type: &str, values: Vec<Value>) -> Value {
    json!({
        "$schema": VEGA_LITE_SCHEMA,
        "title": title,
        "data": { "values": values },
        "mark": "bar",
        "encoding": {
            "x": { "field": x_field, "type": x_type },
            "y": { "field": "cases", "type": "quantitative" }
        }
    })
}

pub fn build_charts(records: &AnonymizedRecords, reference_date: NaiveDate) -> Vec<ChartSpec> {
    let daily: Vec<Value> = daily_series(records, reference_date)
        .into_iter()
        .map(|(day, n)| json!({ "date": day.to_string(), "cases": n }))
        .collect();
    let monthly: Vec<Value> = monthly_series(records, reference_date)
        .into_iter()
        .map(|(month, n)| json!({ "month": month, "cases": n }))
        .collect();

    vec![
        ChartSpec {
            name: format!("daily_cases_{reference_date}"),
            payload: bar_chart("SRAG cases per day, last 30 days", "date", "temporal", daily),
        },
        ChartSpec {
            name: format!("monthly_cases_{reference_date}"),
            payload: bar_chart("SRAG cases per month, last 12 months", "month", "ordinal", monthly),
        },
    ]
}

/// All-or-nothing: a failure on any chart fails the stage.
#[tracing::instrument(
    name = "pipeline_stage charts",
    skip(sink, records),
    fields(pipeline.stage = "charts", charts.count)
)]
pub async fn render_charts(
    sink: &dyn ChartSink,
    records: &AnonymizedRecords,
    reference_date: NaiveDate,
) -> Result<Vec<ChartRef>, PipelineError> {
    let mut refs = Vec::new();
    for chart in build_charts(records, reference_date) {
        let chart_ref = sink
            .publish(&chart)
            .await
            .map_err(|e| PipelineError::external("charts", e))?;
        refs.push(chart_ref);
    }
    tracing::Span::current().record("charts.count", refs.len());
    Ok(refs)
}
