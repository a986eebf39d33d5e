use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use serde::Serialize;

use srag_report::db::{self, PgCaseSource};
use srag_report::models::ReportRequest;
use srag_report::pipeline::{CaseSource, JsonLinesCaseSource};
use srag_report::telemetry::init_telemetry;
use srag_report::{Config, build_orchestrator};

#[derive(Parser, Debug)]
#[command(
    name = "srag-report",
    version,
    about = "Generate the daily SRAG epidemiological report"
)]
struct Cli {
    #[arg(long, help = "Reference date (YYYY-MM-DD), defaults to today")]
    date: Option<NaiveDate>,
    #[arg(
        long,
        help = "JSON-lines case file; falls back to SRAG_DATA_FILE, then to DATABASE_URL"
    )]
    data_file: Option<PathBuf>,
    #[arg(long, help = "Directory for the report, audit and chart files")]
    output_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false, help = "Skip the news context")]
    no_news: bool,
    #[arg(long, default_value_t = false, help = "Skip chart rendering")]
    no_charts: bool,
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("cannot write {}", path.display()))
}

async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::warn!("Interrupt received, cancelling report run");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.data_file {
        config.data_file = Some(path);
    }
    if let Some(dir) = cli.output_dir {
        config.reports_dir = dir;
    }

    let telemetry_guard = init_telemetry(&config)?;

    let source: Arc<dyn CaseSource> = match (&config.data_file, &config.database_url) {
        (Some(path), _) => Arc::new(JsonLinesCaseSource::new(path)),
        (None, Some(url)) => Arc::new(PgCaseSource::new(db::create_pool(url).await?)),
        (None, None) => {
            anyhow::bail!("no case source: pass --data-file or set SRAG_DATA_FILE or DATABASE_URL")
        }
    };
    let orchestrator = build_orchestrator(&config, source)?;

    let request = ReportRequest {
        report_date: cli.date.unwrap_or_else(|| Utc::now().date_naive()),
        include_news: !cli.no_news,
        include_charts: !cli.no_charts,
    };
    let date = request.report_date;

    let result = orchestrator.run_until(&request, interrupted()).await;

    tokio::fs::create_dir_all(&config.reports_dir)
        .await
        .with_context(|| format!("cannot create {}", config.reports_dir.display()))?;
    let report_path = config.reports_dir.join(format!("srag_report_{date}.json"));
    let audit_path = config.reports_dir.join(format!("srag_audit_{date}.json"));

    let outcome = match result {
        Ok(artifact) => {
            write_json(&report_path, &artifact).await?;
            write_json(&audit_path, &artifact.audit).await?;
            println!(
                "Report {} for {date} written to {} (signature {}{})",
                artifact.id,
                report_path.display(),
                artifact.signature,
                if artifact.degraded.any() { ", degraded" } else { "" }
            );
            Ok(())
        }
        Err(failure) => {
            write_json(&audit_path, &failure.audit).await?;
            eprintln!("Audit trail written to {}", audit_path.display());
            Err(anyhow::Error::new(failure))
        }
    };

    telemetry_guard.shutdown();
    outcome
}
