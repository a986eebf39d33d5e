pub mod health;
pub mod http;
pub mod reports;

use axum::Router;
use axum::routing::{get, post};

use crate::AppState;

pub use http::with_http_layers;

pub fn router() -> Router<AppState> {
    with_http_layers(
        Router::new()
            .route("/api/health", get(health::health))
            .route("/api/reports", post(reports::create_report).get(reports::list_reports))
            .route("/api/reports/{id}", get(reports::get_report)),
    )
}
