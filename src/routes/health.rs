use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = match sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };
    let status = if database == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let cache = state.orchestrator.news_cache();
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "error" },
            "service": "srag-report-generator",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "news_cache": {
                "hits": cache.hits(),
                "misses": cache.misses(),
            },
        })),
    )
}
