pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod news;
pub mod pipeline;
pub mod routes;
pub mod telemetry;

use std::sync::Arc;

use sqlx::PgPool;

pub use config::Config;

use llm::LlmClient;
use llm::openai::OpenAIProvider;
use news::NewsApiClient;
use pipeline::{CaseSource, Collaborators, FsChartSink, NarrativeGenerator, Orchestrator};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
}

/// Wires the production collaborators around `source`. Charts are written
/// under `<reports_dir>/charts`.
pub fn build_orchestrator(
    config: &Config,
    source: Arc<dyn CaseSource>,
) -> anyhow::Result<Orchestrator> {
    let provider = OpenAIProvider::from_name(
        &config.llm_provider,
        config.openai_api_key.as_deref(),
        config.google_api_key.as_deref(),
    );
    let llm = Arc::new(LlmClient::new(Arc::new(provider)));

    let news = NewsApiClient::new(
        config.news_api_key.clone(),
        &config.news_language,
        config.pipeline.timeouts.news,
    )?;

    tracing::info!(
        llm_provider = %config.llm_provider,
        llm_model = %config.llm_model,
        case_source = source.name(),
        news_configured = config.news_api_key.is_some(),
        "Pipeline collaborators initialized"
    );

    Ok(Orchestrator::new(
        config.pipeline.clone(),
        Collaborators {
            source,
            news: Arc::new(news),
            narrative: NarrativeGenerator::new(
                llm,
                &config.llm_model,
                config.default_temperature,
                config.default_max_tokens,
            ),
            charts: Arc::new(FsChartSink::new(config.reports_dir.join("charts"))),
        },
    ))
}
