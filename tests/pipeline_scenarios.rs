use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};

use srag_report::config::PipelineConfig;
use srag_report::error::PipelineError;
use srag_report::llm::{GenerateRequest, GenerateResponse, LlmClient, Provider};
use srag_report::models::metrics::MORTALITY_RATE;
use srag_report::models::{Article, RawCaseRow, ReportRequest};
use srag_report::news::{NewsError, NewsQuery, NewsSearch};
use srag_report::pipeline::{
    AuditKind, CaseSource, Collaborators, FsChartSink, InMemoryCaseSource, NarrativeGenerator,
    Orchestrator, RunState, verify_signature,
};

fn reference() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
}

/// Fails the first `fail_first` calls with a 503, then returns one relevant
/// article.
struct FlakyNews {
    calls: AtomicU32,
    fail_first: u32,
}

impl FlakyNews {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl NewsSearch for FlakyNews {
    async fn search(&self, _query: &NewsQuery) -> Result<Vec<Article>, NewsError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(NewsError::Status {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        Ok(vec![Article {
            title: "Casos de SRAG lotam UTI em hospital de São Paulo".into(),
            source: "G1".into(),
            url: "https://g1.com/saude/srag".into(),
            summary: "Internação por doença respiratória cresce".into(),
            published_at: Some(Utc.with_ymd_and_hms(2024, 6, 28, 9, 0, 0).unwrap()),
            relevance_score: 0.0,
        }])
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

struct Writer {
    fail: bool,
}

#[async_trait::async_trait]
impl Provider for Writer {
    async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        if self.fail {
            anyhow::bail!("503 service unavailable");
        }
        Ok(GenerateResponse {
            content: format!("Bulletin written from {} prompt characters.", req.prompt.len()),
            model: req.model.clone(),
            input_tokens: 120,
            output_tokens: 40,
            finish_reason: "stop".into(),
            provider: String::new(),
        })
    }

    fn name(&self) -> &str {
        "writer"
    }
}

/// `total` cases spread over June 2024, the first `deceased` of them fatal.
fn june_cases(total: u32, deceased: u32) -> Vec<RawCaseRow> {
    (0..total)
        .map(|i| RawCaseRow {
            report_date: Some(format!("2024-06-{:02}", 1 + i % 30)),
            onset_date: None,
            outcome: Some(if i < deceased { "2" } else { "1" }.into()),
            icu: Some(if i % 4 == 0 { "1" } else { "2" }.into()),
            vaccination: Some(if i % 2 == 0 { "1" } else { "2" }.into()),
            state: Some(["SP", "RJ", "MG"][i as usize % 3].into()),
            municipality_code: Some("3550308".into()),
            age: Some((i % 90) as i32),
            notification_id: Some(format!("N{i:06}")),
        })
        .collect()
}

struct Harness {
    orchestrator: Orchestrator,
    news: Arc<FlakyNews>,
    _charts_dir: tempfile::TempDir,
}

fn harness(source: impl CaseSource + 'static, news: Arc<FlakyNews>, llm_fails: bool) -> Harness {
    let mut config = PipelineConfig::default();
    config.news_retry.base_delay = Duration::from_millis(1);
    config.news_retry.max_delay = Duration::from_millis(2);

    let charts_dir = tempfile::tempdir().unwrap();
    let llm = LlmClient {
        provider: Arc::new(Writer { fail: llm_fails }),
        max_retries: 1,
    };

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            source: Arc::new(source),
            news: news.clone(),
            narrative: NarrativeGenerator::new(Arc::new(llm), "test-model", 0.3, 512),
            charts: Arc::new(FsChartSink::new(charts_dir.path())),
        },
    );

    Harness {
        orchestrator,
        news,
        _charts_dir: charts_dir,
    }
}

#[tokio::test]
async fn scenario_a_mortality_from_complete_window() {
    let h = harness(InMemoryCaseSource::new(june_cases(1000, 100)), FlakyNews::new(0), false);

    let artifact = h
        .orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap();

    let mortality = artifact.metrics.get(MORTALITY_RATE).unwrap();
    assert_eq!(mortality.value, Some(10.0));
    assert!(!mortality.low_confidence);
    assert!(!mortality.suspicious);
    assert_eq!(artifact.metrics.total_cases, 1000);
    assert!(artifact.metrics.insufficient_data.is_none());

    assert!(!artifact.degraded.any());
    assert_eq!(artifact.chart_refs.len(), 2);
    assert_eq!(artifact.news.as_ref().unwrap().len(), 1);
    assert!(artifact.narrative.starts_with("Bulletin written from"));
    assert_eq!(artifact.data_summary.total_records, 1000);
    assert!(verify_signature(&artifact));

    let last = artifact.audit.entries().last().unwrap();
    assert_eq!(last.kind, AuditKind::Transition);
    assert_eq!(last.message, "Assembled -> Done");
}

#[tokio::test]
async fn scenario_b_news_recovers_after_three_retries() {
    let h = harness(InMemoryCaseSource::new(june_cases(200, 10)), FlakyNews::new(3), false);

    let artifact = h
        .orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap();

    assert_eq!(h.news.calls(), 4);
    assert_eq!(artifact.audit.count(AuditKind::Retry), 3);
    assert!(artifact.audit.has("news", AuditKind::ExternalOk));
    assert!(!artifact.degraded.news);
    assert_eq!(artifact.news.as_ref().unwrap().len(), 1);
}

#[tokio::test]
async fn scenario_c_news_exhausted_degrades_report() {
    let h = harness(
        InMemoryCaseSource::new(june_cases(200, 10)),
        FlakyNews::new(u32::MAX),
        false,
    );

    let artifact = h
        .orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap();

    assert_eq!(h.news.calls(), 4);
    assert!(artifact.degraded.news);
    assert!(!artifact.degraded.narrative);
    assert!(artifact.news.as_ref().unwrap().is_empty());
    assert!(artifact.audit.has("news", AuditKind::Degraded));
    assert_eq!(artifact.audit.count(AuditKind::Retry), 3);
    assert!(!artifact.narrative.is_empty());
    assert!(verify_signature(&artifact));
}

#[tokio::test]
async fn scenario_d_missing_source_fails_without_artifact() {
    let h = harness(InMemoryCaseSource::unavailable(), FlakyNews::new(0), false);

    let failure = h
        .orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, PipelineError::DataUnavailable(_)));
    assert_eq!(failure.state, RunState::Init);
    assert_eq!(h.news.calls(), 0);

    let last = failure.audit.entries().last().unwrap();
    assert_eq!(last.message, "Init -> Failed");
}

#[tokio::test]
async fn cached_news_issues_no_network_calls() {
    let h = harness(InMemoryCaseSource::new(june_cases(200, 10)), FlakyNews::new(0), false);
    let request = ReportRequest::for_date(reference());

    let first = h.orchestrator.run(&request).await.unwrap();
    assert_eq!(h.news.calls(), 1);
    assert!(!first.audit.has("news", AuditKind::CacheHit));

    let second = h.orchestrator.run(&request).await.unwrap();
    assert_eq!(h.news.calls(), 1);
    assert!(second.audit.has("news", AuditKind::CacheHit));
    assert_eq!(second.news, first.news);
    assert_eq!(h.orchestrator.news_cache().hits(), 1);
}

#[tokio::test]
async fn empty_window_still_produces_report() {
    let stale: Vec<RawCaseRow> = june_cases(50, 5)
        .into_iter()
        .map(|mut row| {
            row.report_date = row.report_date.map(|d| d.replace("2024", "2022"));
            row
        })
        .collect();
    let h = harness(InMemoryCaseSource::new(stale), FlakyNews::new(0), false);

    let artifact = h
        .orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap();

    assert_eq!(artifact.metrics.total_cases, 0);
    let marker = artifact.metrics.insufficient_data.unwrap();
    assert_eq!(marker.observed, 0);
    assert!(artifact.metrics.get(MORTALITY_RATE).unwrap().value.is_none());
    assert!(artifact.metrics.metrics.iter().all(|m| m.low_confidence));
    assert!(artifact.audit.has("data", AuditKind::Filter));
    assert!(artifact.audit.has("metrics", AuditKind::Decision));
}

#[tokio::test]
async fn narrative_failure_falls_back_to_template() {
    let h = harness(InMemoryCaseSource::new(june_cases(200, 10)), FlakyNews::new(0), true);

    let artifact = h
        .orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap();

    assert!(artifact.degraded.narrative);
    assert!(!artifact.degraded.news);
    assert!(artifact.narrative.starts_with("SRAG daily bulletin for 2024-06-30."));
    assert!(artifact.audit.has("narrative", AuditKind::Degraded));
}

#[tokio::test]
async fn implausible_metric_is_flagged_not_dropped() {
    let h = harness(InMemoryCaseSource::new(june_cases(100, 100)), FlakyNews::new(0), false);

    let artifact = h
        .orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap();

    let mortality = artifact.metrics.get(MORTALITY_RATE).unwrap();
    assert_eq!(mortality.value, Some(100.0));
    assert!(mortality.suspicious);
    assert!(!mortality.warnings.is_empty());
    assert!(
        artifact
            .audit
            .entries()
            .iter()
            .any(|e| e.stage == "guardrails" && e.message.contains("mortality_rate"))
    );
}

struct LeakyNews;

#[async_trait::async_trait]
impl NewsSearch for LeakyNews {
    async fn search(&self, _query: &NewsQuery) -> Result<Vec<Article>, NewsError> {
        Ok(vec![Article {
            title: "Casos de SRAG: paciente CPF 123.456.789-09 segue na UTI".into(),
            source: "G1".into(),
            url: "https://g1.com/saude/uti".into(),
            summary: "Hospital informa contato joao@example.com e (11) 98765-4321".into(),
            published_at: Some(Utc.with_ymd_and_hms(2024, 6, 29, 8, 0, 0).unwrap()),
            relevance_score: 0.0,
        }])
    }

    fn name(&self) -> &str {
        "leaky"
    }
}

/// Keeps every prompt it receives.
#[derive(Default)]
struct RecordingWriter {
    prompts: std::sync::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Provider for RecordingWriter {
    async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        self.prompts.lock().unwrap().push(req.prompt.clone());
        Ok(GenerateResponse {
            content: "Bulletin.".into(),
            model: req.model.clone(),
            input_tokens: 1,
            output_tokens: 1,
            finish_reason: "stop".into(),
            provider: String::new(),
        })
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[tokio::test]
async fn personal_data_in_news_never_leaves_guardrails() {
    let writer = Arc::new(RecordingWriter::default());
    let charts_dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(
        PipelineConfig::default(),
        Collaborators {
            source: Arc::new(InMemoryCaseSource::new(june_cases(100, 5))),
            news: Arc::new(LeakyNews),
            narrative: NarrativeGenerator::new(
                Arc::new(LlmClient {
                    provider: writer.clone(),
                    max_retries: 1,
                }),
                "test-model",
                0.3,
                256,
            ),
            charts: Arc::new(FsChartSink::new(charts_dir.path())),
        },
    );

    let artifact = orchestrator
        .run(&ReportRequest::for_date(reference()))
        .await
        .unwrap();

    let serialized = serde_json::to_string(&artifact).unwrap();
    assert!(!serialized.contains("123.456.789-09"));
    assert!(!serialized.contains("joao@example.com"));
    assert!(!serialized.contains("98765-4321"));
    assert_eq!(artifact.news.as_ref().unwrap().len(), 1);

    let prompts = writer.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].contains("123.456.789-09"));
    assert!(prompts[0].contains("[CPF]"));
}
