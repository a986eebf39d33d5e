use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::ReportArtifact;
use crate::pipeline::audit::AuditTrail;

/// Listing view; the artifact body is only returned by [`get_report`].
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReportSummaryRow {
    pub id: Uuid,
    pub report_date: NaiveDate,
    pub signature: String,
    pub degraded: bool,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[tracing::instrument(name = "db.reports.insert", skip_all, fields(report.id = %artifact.id))]
pub async fn insert_report(
    pool: &PgPool,
    artifact: &ReportArtifact,
    trace_id: Option<&str>,
) -> Result<Uuid, sqlx::Error> {
    let row: (Uuid,) = sqlx::query_as(
        "INSERT INTO srag_reports (id, report_date, signature, degraded, artifact, trace_id) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING id",
    )
    .bind(artifact.id)
    .bind(artifact.report_date)
    .bind(&artifact.signature)
    .bind(artifact.degraded.any())
    .bind(Json(artifact))
    .bind(trace_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Stores the audit trail of a run whether or not it produced an artifact.
#[tracing::instrument(name = "db.audit.insert", skip_all, fields(execution_id = %audit.execution_id))]
pub async fn insert_audit(
    pool: &PgPool,
    audit: &AuditTrail,
    report_date: NaiveDate,
    report_id: Option<Uuid>,
    outcome: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO srag_audit_trails (execution_id, report_id, report_date, outcome, entries) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(audit.execution_id)
    .bind(report_id)
    .bind(report_date)
    .bind(outcome)
    .bind(Json(audit.entries()))
    .execute(pool)
    .await?;

    Ok(())
}

#[tracing::instrument(name = "db.reports.get", skip(pool))]
pub async fn get_report(pool: &PgPool, id: Uuid) -> Result<Option<ReportArtifact>, sqlx::Error> {
    let row: Option<(Json<ReportArtifact>,)> =
        sqlx::query_as("SELECT artifact FROM srag_reports WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(Json(artifact),)| artifact))
}

#[tracing::instrument(name = "db.reports.list", skip(pool))]
pub async fn list_reports(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<ReportSummaryRow>, sqlx::Error> {
    sqlx::query_as::<_, ReportSummaryRow>(
        "SELECT id, report_date, signature, degraded, trace_id, created_at \
         FROM srag_reports ORDER BY report_date DESC, created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}
