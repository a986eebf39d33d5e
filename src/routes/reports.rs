use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::db::reports::ReportSummaryRow;
use crate::error::{AppError, AppResult, PipelineError, current_trace_id};
use crate::models::{ReportArtifact, ReportRequest};
use crate::pipeline::AuditTrail;

#[derive(Debug, Deserialize)]
pub struct CreateReportBody {
    pub report_date: String,
    pub include_news: Option<bool>,
    pub include_charts: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl CreateReportBody {
    fn into_request(self, today: NaiveDate) -> AppResult<ReportRequest> {
        let report_date = NaiveDate::parse_from_str(&self.report_date, "%Y-%m-%d")
            .map_err(|_| AppError::Validation("invalid report_date format, use YYYY-MM-DD".into()))?;

        if report_date > today {
            return Err(AppError::Validation(
                "report_date must not be in the future".into(),
            ));
        }

        Ok(ReportRequest {
            report_date,
            include_news: self.include_news.unwrap_or(true),
            include_charts: self.include_charts.unwrap_or(true),
        })
    }
}

fn outcome_label(error: &PipelineError) -> &'static str {
    match error {
        PipelineError::Cancelled => "cancelled",
        PipelineError::RunInProgress(_) => "rejected",
        _ => "failed",
    }
}

/// The audit row only references the report when the report row exists.
fn stored_outcome<E>(stored: &Result<Uuid, E>) -> (Option<Uuid>, &'static str) {
    match stored {
        Ok(id) => (Some(*id), "done"),
        Err(_) => (None, "unsaved"),
    }
}

/// Audit rows are kept even when the run failed. A failed write is logged
/// and does not change the response.
async fn flush_audit(
    state: &AppState,
    audit: &AuditTrail,
    report_date: NaiveDate,
    report_id: Option<Uuid>,
    outcome: &str,
) {
    if let Err(e) =
        crate::db::reports::insert_audit(&state.pool, audit, report_date, report_id, outcome).await
    {
        tracing::error!(
            error = %e,
            execution_id = %audit.execution_id,
            "Failed to persist audit trail"
        );
    }
}

pub async fn create_report(
    State(state): State<AppState>,
    Json(body): Json<CreateReportBody>,
) -> AppResult<(StatusCode, Json<ReportArtifact>)> {
    let request = body.into_request(Utc::now().date_naive())?;

    match state.orchestrator.run(&request).await {
        Ok(artifact) => {
            let trace_id = current_trace_id();
            let stored =
                crate::db::reports::insert_report(&state.pool, &artifact, trace_id.as_deref())
                    .await;
            let (report_id, outcome) = stored_outcome(&stored);
            flush_audit(&state, &artifact.audit, request.report_date, report_id, outcome).await;
            stored.map_err(AppError::Database)?;

            Ok((StatusCode::CREATED, Json(artifact)))
        }
        Err(failure) => {
            flush_audit(
                &state,
                &failure.audit,
                request.report_date,
                None,
                outcome_label(&failure.error),
            )
            .await;
            Err(failure.into())
        }
    }
}

pub async fn list_reports(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> AppResult<Json<Vec<ReportSummaryRow>>> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);

    let reports = crate::db::reports::list_reports(&state.pool, limit, offset)
        .await
        .map_err(AppError::Database)?;

    Ok(Json(reports))
}

pub async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReportArtifact>> {
    let report = crate::db::reports::get_report(&state.pool, id)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("Report {} not found", id)))?;

    Ok(Json(report))
}
