use chrono::{NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{ChartRef, DataSummary, Degradation, MetricSet, NewsContext, ReportArtifact};

use super::audit::AuditTrail;
use super::guardrails::ValidatedMetrics;

pub struct AssembleParams {
    pub report_date: NaiveDate,
    pub metrics: ValidatedMetrics,
    pub narrative: String,
    pub news: Option<NewsContext>,
    pub data_summary: DataSummary,
    pub chart_refs: Vec<ChartRef>,
    pub degraded: Degradation,
    pub audit: AuditTrail,
}

#[derive(Serialize)]
struct SignedContent<'a> {
    report_date: NaiveDate,
    metrics: &'a MetricSet,
    narrative: &'a str,
    news: Option<&'a NewsContext>,
    data_summary: &'a DataSummary,
    chart_refs: &'a [ChartRef],
    degraded: &'a Degradation,
}

fn sign(content: &SignedContent<'_>) -> Result<String, PipelineError> {
    let bytes = serde_json::to_vec(content)
        .map_err(|e| PipelineError::Assembly(format!("cannot serialize report: {e}")))?;
    let digest = blake3::hash(&bytes).to_hex();
    Ok(format!("SRAG-{}", &digest.as_str()[..16]))
}

/// The inputs without which no artifact can be built.
pub fn ensure_complete(metrics: &ValidatedMetrics, narrative: &str) -> Result<(), PipelineError> {
    if metrics.set().metrics.is_empty() {
        return Err(PipelineError::Assembly("metric set is empty".into()));
    }
    if narrative.trim().is_empty() {
        return Err(PipelineError::Assembly("narrative is empty".into()));
    }
    Ok(())
}

/// Pure merge of the stage outputs into one artifact. The audit trail is
/// taken as final.
#[tracing::instrument(
    name = "pipeline_stage assemble",
    skip_all,
    fields(pipeline.stage = "assemble", report.signature)
)]
pub fn assemble(params: AssembleParams) -> Result<ReportArtifact, PipelineError> {
    ensure_complete(&params.metrics, &params.narrative)?;
    let metrics = params.metrics.into_inner();

    let signature = sign(&SignedContent {
        report_date: params.report_date,
        metrics: &metrics,
        narrative: &params.narrative,
        news: params.news.as_ref(),
        data_summary: &params.data_summary,
        chart_refs: &params.chart_refs,
        degraded: &params.degraded,
    })?;
    tracing::Span::current().record("report.signature", signature.as_str());

    Ok(ReportArtifact {
        id: Uuid::new_v4(),
        report_date: params.report_date,
        generated_at: Utc::now(),
        metrics,
        narrative: params.narrative,
        news: params.news,
        data_summary: params.data_summary,
        chart_refs: params.chart_refs,
        degraded: params.degraded,
        signature,
        audit: params.audit,
    })
}

/// Recomputes the signature over the artifact's content.
pub fn verify_signature(artifact: &ReportArtifact) -> bool {
    sign(&SignedContent {
        report_date: artifact.report_date,
        metrics: &artifact.metrics,
        narrative: &artifact.narrative,
        news: artifact.news.as_ref(),
        data_summary: &artifact.data_summary,
        chart_refs: &artifact.chart_refs,
        degraded: &artifact.degraded,
    })
    .is_ok_and(|s| s == artifact.signature)
}
