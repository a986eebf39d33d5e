use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::NaiveDate;
use opentelemetry::KeyValue;
use serde::Serialize;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, RunFailure};
use crate::models::{Degradation, NewsContext, ReportArtifact, ReportRequest};
use crate::news::{NewsCache, NewsContextAdapter, NewsFetch, NewsSearch};
use crate::telemetry::metrics::{
    GUARDRAIL_FINDINGS, REPORT_CASE_RECORDS, REPORT_DEGRADED, REPORT_GENERATION_DURATION,
    REPORT_RUNS,
};

use super::assemble::{AssembleParams, assemble, ensure_complete};
use super::audit::{AuditKind, AuditTrail};
use super::charts::{ChartSink, render_charts};
use super::guardrails::{GuardrailEnforcer, Severity, filter_news, summarize};
use super::metrics::{MetricRegistry, MetricsEngine};
use super::narrative::{NarrativeGenerator, template_narrative};
use super::retrieve::{CaseSource, load_window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    DataLoaded,
    MetricsComputed,
    Guarded,
    ContextFetched,
    Assembled,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// External capabilities the pipeline depends on.
pub struct Collaborators {
    pub source: Arc<dyn CaseSource>,
    pub news: Arc<dyn NewsSearch>,
    pub narrative: NarrativeGenerator,
    pub charts: Arc<dyn ChartSink>,
}

struct Run {
    state: RunState,
    audit: AuditTrail,
}

impl Run {
    fn new() -> Self {
        Self {
            state: RunState::Init,
            audit: AuditTrail::new(Uuid::new_v4()),
        }
    }

    fn advance(&mut self, to: RunState) {
        self.audit.record(
            "orchestrator",
            AuditKind::Transition,
            format!("{} -> {}", self.state, to),
        );
        self.state = to;
    }

    fn fail(mut self, error: PipelineError) -> RunFailure {
        let state = self.state;
        self.audit
            .record("orchestrator", AuditKind::Decision, format!("run aborted: {error}"));
        self.advance(RunState::Failed);
        RunFailure {
            error,
            state,
            audit: self.audit,
        }
    }
}

/// Removes the reference date from the in-flight set when the run ends,
/// however it ends.
struct InFlight<'a> {
    dates: &'a Mutex<HashSet<NaiveDate>>,
    date: NaiveDate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.dates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.date);
    }
}

pub struct Orchestrator {
    config: PipelineConfig,
    source: Arc<dyn CaseSource>,
    news: NewsContextAdapter,
    narrative: NarrativeGenerator,
    charts: Arc<dyn ChartSink>,
    metrics: MetricsEngine,
    guardrails: GuardrailEnforcer,
    in_flight: Mutex<HashSet<NaiveDate>>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, parts: Collaborators) -> Self {
        Self::with_registry(config, parts, MetricRegistry::default())
    }

    pub fn with_registry(
        config: PipelineConfig,
        parts: Collaborators,
        registry: MetricRegistry,
    ) -> Self {
        let news = NewsContextAdapter::new(
            parts.news,
            NewsCache::new(config.news_cache_ttl),
            config.news_retry.clone(),
            config.news_days,
            config.news_max_articles,
        );
        Self {
            metrics: MetricsEngine::new(registry, config.period_days, config.min_sample_size),
            guardrails: GuardrailEnforcer::new(config.bounds.clone()),
            source: parts.source,
            news,
            narrative: parts.narrative,
            charts: parts.charts,
            in_flight: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn news_cache(&self) -> &NewsCache {
        self.news.cache()
    }

    pub async fn run(&self, request: &ReportRequest) -> Result<ReportArtifact, RunFailure> {
        self.run_until(request, std::future::pending()).await
    }

    /// Runs the pipeline unless `cancel` resolves first, in which case all
    /// outstanding work is dropped and no artifact is produced.
    #[tracing::instrument(
        name = "pipeline report",
        skip(self, request, cancel),
        fields(
            report.date = %request.report_date,
            report.execution_id,
            report.id,
            report.degraded,
            report.duration_ms,
        )
    )]
    pub async fn run_until(
        &self,
        request: &ReportRequest,
        cancel: impl Future<Output = ()>,
    ) -> Result<ReportArtifact, RunFailure> {
        let start = Instant::now();
        let span = tracing::Span::current();
        let mut run = Run::new();
        span.record(
            "report.execution_id",
            run.audit.execution_id.to_string().as_str(),
        );

        let Some(_guard) = self.claim(request.report_date) else {
            REPORT_RUNS.add(1, &[KeyValue::new("outcome", "rejected")]);
            return Err(run.fail(PipelineError::RunInProgress(request.report_date)));
        };

        let outcome = {
            let execution = self.execute(request, &mut run);
            tokio::select! {
                result = execution => Some(result),
                _ = cancel => None,
            }
        };

        let elapsed = start.elapsed();
        span.record("report.duration_ms", elapsed.as_millis() as u64);
        REPORT_GENERATION_DURATION.record(elapsed.as_secs_f64(), &[]);

        match outcome {
            Some(Ok(artifact)) => {
                span.record("report.id", artifact.id.to_string().as_str());
                span.record("report.degraded", artifact.degraded.any());
                REPORT_RUNS.add(1, &[KeyValue::new("outcome", "done")]);
                tracing::info!(
                    report.id = %artifact.id,
                    report.signature = %artifact.signature,
                    degraded = artifact.degraded.any(),
                    "Report generated"
                );
                Ok(artifact)
            }
            Some(Err(error)) => {
                REPORT_RUNS.add(1, &[KeyValue::new("outcome", "failed")]);
                tracing::error!(error = %error, state = %run.state, "Report run failed");
                Err(run.fail(error))
            }
            None => {
                REPORT_RUNS.add(1, &[KeyValue::new("outcome", "cancelled")]);
                tracing::warn!(state = %run.state, "Report run cancelled");
                Err(run.fail(PipelineError::Cancelled))
            }
        }
    }

    fn claim(&self, date: NaiveDate) -> Option<InFlight<'_>> {
        let mut dates = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !dates.insert(date) {
            return None;
        }
        Some(InFlight {
            dates: &self.in_flight,
            date,
        })
    }

    async fn execute(
        &self,
        request: &ReportRequest,
        run: &mut Run,
    ) -> Result<ReportArtifact, PipelineError> {
        let date = request.report_date;
        let timeouts = &self.config.timeouts;
        let mut degraded = Degradation::default();

        run.audit.record(
            "orchestrator",
            AuditKind::Decision,
            format!(
                "report for {date}: period {} days, loading {} days, news {}, charts {}",
                self.config.period_days,
                self.config.lookback_days(),
                on_off(request.include_news),
                on_off(request.include_charts),
            ),
        );

        // Data: nothing else can start without it.
        let loaded = tokio::time::timeout(
            timeouts.data,
            load_window(self.source.as_ref(), date, self.config.lookback_days()),
        )
        .await
        .map_err(|_| {
            PipelineError::DataUnavailable(format!(
                "case source {} timed out after {:?}",
                self.source.name(),
                timeouts.data
            ))
        })??;

        REPORT_CASE_RECORDS.record(loaded.records.len() as f64, &[]);
        run.audit.record(
            "data",
            AuditKind::ExternalOk,
            format!(
                "{} records loaded from {} for {} to {}",
                loaded.records.len(),
                self.source.name(),
                loaded.window.start,
                loaded.window.end
            ),
        );
        if loaded.discarded.total() > 0 {
            let d = &loaded.discarded;
            run.audit.record(
                "data",
                AuditKind::Filter,
                format!(
                    "{} rows discarded: {} malformed, {} unparseable dates, {} missing fields, {} outside window",
                    d.total(),
                    d.malformed,
                    d.unparseable_date,
                    d.missing_mandatory,
                    d.outside_window
                ),
            );
        }
        run.advance(RunState::DataLoaded);

        // Metrics and news are independent of each other.
        let records = loaded.records;
        let news_fetch = async {
            if !request.include_news {
                return None;
            }
            Some(
                tokio::time::timeout(
                    timeouts.news,
                    self.news.fetch_context(date, &self.config.news_terms),
                )
                .await,
            )
        };
        let (metric_set, news_result) =
            tokio::join!(async { self.metrics.compute(&records, date) }, news_fetch);

        if let Some(marker) = metric_set.insufficient_data {
            let condition = PipelineError::InsufficientData {
                observed: marker.observed,
                required: marker.required,
            };
            run.audit.record(
                "metrics",
                AuditKind::Decision,
                format!("{condition}; metrics marked low confidence"),
            );
        }
        run.audit.record(
            "metrics",
            AuditKind::Decision,
            format!(
                "{} metrics computed over {} cases",
                metric_set.metrics.len(),
                metric_set.total_cases
            ),
        );
        run.advance(RunState::MetricsComputed);

        // Guardrails: nothing downstream accepts unguarded data.
        let guarded = self.guardrails.validate_and_anonymize(records, metric_set);
        run.audit.record(
            "guardrails",
            AuditKind::Guardrail,
            format!(
                "{} of {} records anonymized",
                guarded.anonymized,
                guarded.records.len()
            ),
        );
        for finding in &guarded.findings {
            let message = match finding.as_violation() {
                Some(violation) => format!("{violation}; flagged suspicious"),
                None => format!("warning: {}", finding.message),
            };
            let severity = match finding.severity {
                Severity::Warning => "warning",
                Severity::Violation => "violation",
            };
            GUARDRAIL_FINDINGS.add(
                1,
                &[
                    KeyValue::new("metric", finding.metric.clone()),
                    KeyValue::new("severity", severity),
                ],
            );
            run.audit.record("guardrails", AuditKind::Guardrail, message);
        }
        run.advance(RunState::Guarded);

        let news = match news_result {
            None => {
                run.audit
                    .record("news", AuditKind::Decision, "news context disabled by request");
                None
            }
            Some(Err(_)) => {
                let reason = format!("timed out after {:?}", timeouts.news);
                run.audit
                    .record("news", AuditKind::ExternalFailed, reason.clone());
                mark_degraded(run, &mut degraded.news, "news", &reason);
                Some(NewsContext::empty())
            }
            Some(Ok(fetch)) => Some(self.absorb_news(run, fetch, &mut degraded)),
        };
        if news.is_some() {
            run.advance(RunState::ContextFetched);
        }
        let news_context = news.clone().unwrap_or_default();

        let summary = summarize(&guarded.records);

        // Narrative and charts only read guarded data.
        let narrative_task = tokio::time::timeout(
            timeouts.narrative,
            self.narrative
                .generate(&guarded.metrics, &news_context, &summary),
        );
        let charts_task = async {
            if !request.include_charts {
                return None;
            }
            Some(
                tokio::time::timeout(
                    timeouts.charts,
                    render_charts(self.charts.as_ref(), &guarded.records, date),
                )
                .await,
            )
        };
        let (narrative_result, charts_result) = tokio::join!(narrative_task, charts_task);

        let narrative_result = narrative_result
            .map_err(|_| format!("timed out after {:?}", timeouts.narrative))
            .and_then(|generated| generated.map_err(|e| e.to_string()));
        let narrative = match narrative_result {
            Ok(generated) => {
                run.audit.record(
                    "narrative",
                    AuditKind::ExternalOk,
                    format!(
                        "narrative generated by {} ({} input / {} output tokens)",
                        generated.model, generated.input_tokens, generated.output_tokens
                    ),
                );
                generated.text
            }
            Err(reason) => {
                run.audit
                    .record("narrative", AuditKind::ExternalFailed, reason.clone());
                mark_degraded(run, &mut degraded.narrative, "narrative", &reason);
                template_narrative(&guarded.metrics, &news_context, &summary)
            }
        };

        let charts_result = charts_result.map(|published| {
            published
                .map_err(|_| format!("timed out after {:?}", timeouts.charts))
                .and_then(|refs| refs.map_err(|e| e.to_string()))
        });
        let chart_refs = match charts_result {
            None => {
                run.audit
                    .record("charts", AuditKind::Decision, "charts disabled by request");
                Vec::new()
            }
            Some(Ok(refs)) => {
                run.audit.record(
                    "charts",
                    AuditKind::ExternalOk,
                    format!("{} charts published", refs.len()),
                );
                refs
            }
            Some(Err(reason)) => {
                run.audit
                    .record("charts", AuditKind::ExternalFailed, reason.clone());
                mark_degraded(run, &mut degraded.charts, "charts", &reason);
                Vec::new()
            }
        };

        ensure_complete(&guarded.metrics, &narrative)?;
        run.advance(RunState::Assembled);
        run.audit.record(
            "assemble",
            AuditKind::Decision,
            format!(
                "assembling report for {date} with {} charts",
                chart_refs.len()
            ),
        );
        run.advance(RunState::Done);

        let artifact = assemble(AssembleParams {
            report_date: date,
            metrics: guarded.metrics,
            narrative,
            news,
            data_summary: summary,
            chart_refs,
            degraded,
            audit: run.audit.clone(),
        })?;

        Ok(artifact)
    }

    fn absorb_news(
        &self,
        run: &mut Run,
        fetch: NewsFetch,
        degraded: &mut Degradation,
    ) -> NewsContext {
        if fetch.cache_hit {
            run.audit.record(
                "news",
                AuditKind::CacheHit,
                format!("{} articles served from cache", fetch.context.len()),
            );
        }
        for (n, failure) in fetch.failures.iter().take(fetch.retries() as usize).enumerate() {
            run.audit.record(
                "news",
                AuditKind::Retry,
                format!("retry {} after: {failure}", n + 1),
            );
        }

        if let Some(reason) = fetch.degraded {
            run.audit.record(
                "news",
                AuditKind::ExternalFailed,
                format!("{reason} after {} attempts", fetch.attempts),
            );
            mark_degraded(run, &mut degraded.news, "news", &reason);
            return NewsContext::empty();
        }

        if !fetch.cache_hit {
            run.audit.record(
                "news",
                AuditKind::ExternalOk,
                format!(
                    "{} articles after {} attempts",
                    fetch.context.len(),
                    fetch.attempts
                ),
            );
        }

        let (context, rejected) = filter_news(fetch.context);
        for rejection in rejected {
            run.audit.record(
                "guardrails",
                AuditKind::Filter,
                format!("news item \"{}\" removed: {}", rejection.title, rejection.reason),
            );
        }
        context
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn mark_degraded(run: &mut Run, flag: &mut bool, component: &'static str, reason: &str) {
    *flag = true;
    REPORT_DEGRADED.add(1, &[KeyValue::new("component", component)]);
    tracing::warn!(component, reason, "Report component degraded");
    run.audit.record(
        component,
        AuditKind::Degraded,
        format!("{component} degraded: {reason}"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerateRequest, GenerateResponse, LlmClient, Provider};
    use crate::models::{Article, ChartRef, RawCaseRow};
    use crate::news::{NewsError, NewsQuery};
    use crate::pipeline::charts::ChartSpec;
    use crate::pipeline::retrieve::InMemoryCaseSource;
    use std::time::Duration;

    struct Quiet;

    #[async_trait::async_trait]
    impl NewsSearch for Quiet {
        async fn search(&self, _query: &NewsQuery) -> Result<Vec<Article>, NewsError> {
            Ok(vec![])
        }

        fn name(&self) -> &str {
            "quiet"
        }
    }

    struct Writer;

    #[async_trait::async_trait]
    impl Provider for Writer {
        async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
            Ok(GenerateResponse {
                content: "Narrative.".into(),
                model: req.model.clone(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: "stop".into(),
                provider: String::new(),
            })
        }

        fn name(&self) -> &str {
            "writer"
        }
    }

    struct SlowCharts;

    #[async_trait::async_trait]
    impl ChartSink for SlowCharts {
        async fn publish(&self, chart: &ChartSpec) -> anyhow::Result<ChartRef> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ChartRef {
                name: chart.name.clone(),
                locator: "memory".into(),
                media_type: "application/json".into(),
            })
        }
    }

    fn rows() -> Vec<RawCaseRow> {
        (0..40)
            .map(|i| RawCaseRow {
                report_date: Some(format!("2024-06-{:02}", 1 + i % 30)),
                outcome: Some("1".into()),
                state: Some("SP".into()),
                ..Default::default()
            })
            .collect()
    }

    fn orchestrator() -> Orchestrator {
        orchestrator_with(MetricRegistry::default())
    }

    fn orchestrator_with(registry: MetricRegistry) -> Orchestrator {
        let mut config = PipelineConfig::default();
        config.timeouts.charts = Duration::from_millis(50);
        Orchestrator::with_registry(
            config,
            Collaborators {
                source: Arc::new(InMemoryCaseSource::new(rows())),
                news: Arc::new(Quiet),
                narrative: NarrativeGenerator::new(
                    Arc::new(LlmClient {
                        provider: Arc::new(Writer),
                        max_retries: 1,
                    }),
                    "test-model",
                    0.3,
                    256,
                ),
                charts: Arc::new(SlowCharts),
            },
            registry,
        )
    }

    fn request() -> ReportRequest {
        ReportRequest::for_date(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap())
    }

    #[tokio::test]
    async fn test_transitions_recorded_in_order() {
        let artifact = orchestrator().run(&request()).await.unwrap();
        let transitions: Vec<&str> = artifact
            .audit
            .entries()
            .iter()
            .filter(|e| e.kind == AuditKind::Transition)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(
            transitions,
            vec![
                "Init -> DataLoaded",
                "DataLoaded -> MetricsComputed",
                "MetricsComputed -> Guarded",
                "Guarded -> ContextFetched",
                "ContextFetched -> Assembled",
                "Assembled -> Done",
            ]
        );
    }

    #[tokio::test]
    async fn test_artifact_carries_final_audit_trail() {
        let artifact = orchestrator().run(&request()).await.unwrap();
        let last = artifact.audit.entries().last().unwrap();
        assert_eq!(last.message, "Assembled -> Done");
        assert!(artifact.audit.has("assemble", AuditKind::Decision));
    }

    #[tokio::test]
    async fn test_incomplete_inputs_fail_before_assembly() {
        let failure = orchestrator_with(MetricRegistry::empty())
            .run(&request())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, PipelineError::Assembly(_)));
        assert_eq!(failure.state, RunState::ContextFetched);
        assert!(
            !failure
                .audit
                .entries()
                .iter()
                .any(|e| e.message.ends_with("-> Assembled"))
        );
    }

    #[tokio::test]
    async fn test_chart_timeout_degrades_charts_only() {
        let artifact = orchestrator().run(&request()).await.unwrap();
        assert!(artifact.degraded.charts);
        assert!(!artifact.degraded.news);
        assert!(!artifact.degraded.narrative);
        assert!(artifact.chart_refs.is_empty());
        assert!(artifact.audit.has("charts", AuditKind::Degraded));
    }

    #[tokio::test]
    async fn test_disabled_enrichments_are_decisions_not_degradations() {
        let mut req = request();
        req.include_news = false;
        req.include_charts = false;

        let artifact = orchestrator().run(&req).await.unwrap();
        assert!(!artifact.degraded.any());
        assert!(artifact.news.is_none());
        assert!(artifact.audit.has("news", AuditKind::Decision));
        assert!(artifact.audit.has("charts", AuditKind::Decision));
        assert!(!artifact.audit.has("news", AuditKind::ExternalOk));
        assert!(
            artifact
                .audit
                .entries()
                .iter()
                .any(|e| e.message == "Guarded -> Assembled")
        );
    }

    #[tokio::test]
    async fn test_concurrent_run_for_same_date_rejected() {
        let orchestrator = orchestrator();
        let (first_req, second_req) = (request(), request());

        let both = async {
            tokio::join!(orchestrator.run(&first_req), async {
                tokio::task::yield_now().await;
                orchestrator.run(&second_req).await
            })
        };
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("duplicate run must not block the first one");

        assert!(first.is_ok());
        let failure = second.unwrap_err();
        assert_eq!(
            failure.error,
            PipelineError::RunInProgress(first_req.report_date)
        );
        assert_eq!(failure.state, RunState::Init);

        assert!(orchestrator.run(&first_req).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_run_releases_date() {
        let orchestrator = orchestrator();
        let req = request();

        let mut stalled = tokio_test::task::spawn(orchestrator.run(&req));
        tokio_test::assert_pending!(stalled.poll());
        drop(stalled);

        tokio_test::assert_ok!(orchestrator.run(&req).await);
    }

    #[tokio::test]
    async fn test_cancellation_produces_no_artifact() {
        let failure = orchestrator()
            .run_until(&request(), std::future::ready(()))
            .await
            .unwrap_err();
        assert_eq!(failure.error, PipelineError::Cancelled);
        assert!(
            failure
                .audit
                .entries()
                .iter()
                .any(|e| e.message.ends_with("-> Failed"))
        );
    }
}
