use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use opentelemetry::trace::TraceContextExt;
use serde_json::json;
use thiserror::Error;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::pipeline::audit::AuditTrail;
use crate::pipeline::orchestrator::RunState;

/// Conditions raised by pipeline components.
///
/// Only `DataUnavailable` and `Assembly` end a run; the remaining
/// conditions are absorbed into the audit trail and degrade the artifact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Insufficient data: {observed} cases, at least {required} required")]
    InsufficientData { observed: u64, required: u64 },

    #[error("Guardrail violation on {metric}: {reason}")]
    GuardrailViolation { metric: String, reason: String },

    #[error("External service {service} failed: {reason}")]
    ExternalService { service: String, reason: String },

    #[error("Assembly error: {0}")]
    Assembly(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A run for {0} is already in progress")]
    RunInProgress(NaiveDate),

    #[error("Run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn external(service: &str, reason: impl std::fmt::Display) -> Self {
        Self::ExternalService {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A failed run. The audit trail is kept so the caller can still flush it.
#[derive(Error, Debug)]
#[error("report run failed in state {state:?}: {error}")]
pub struct RunFailure {
    pub error: PipelineError,
    pub state: RunState,
    pub audit: AuditTrail,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl From<RunFailure> for AppError {
    fn from(failure: RunFailure) -> Self {
        match failure.error {
            PipelineError::InvalidRequest(msg) => AppError::Validation(msg),
            PipelineError::RunInProgress(date) => {
                AppError::Conflict(format!("a report for {date} is already being generated"))
            }
            PipelineError::DataUnavailable(msg) => AppError::DataUnavailable(msg),
            other => AppError::Pipeline(other.to_string()),
        }
    }
}

pub fn current_trace_id() -> Option<String> {
    let span = Span::current();
    let context = span.context();
    let span_ref = context.span();
    let span_context = span_ref.span_context();

    if span_context.is_valid() {
        Some(span_context.trace_id().to_string())
    } else {
        None
    }
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::DataUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Surveillance data unavailable".to_string(),
            ),
            AppError::Database(_) | AppError::Pipeline(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => tracing::error!(error = %e, "Database error"),
            AppError::DataUnavailable(msg) => tracing::error!(error = %msg, "Data unavailable"),
            AppError::Pipeline(msg) => tracing::error!(error = %msg, "Pipeline error"),
            _ => {}
        }

        let (status, error_message) = self.status_and_message();

        let body = if let Some(trace_id) = current_trace_id() {
            json!({
                "error": error_message,
                "status": status.as_u16(),
                "trace_id": trace_id,
            })
        } else {
            json!({
                "error": error_message,
                "status": status.as_u16(),
            })
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
