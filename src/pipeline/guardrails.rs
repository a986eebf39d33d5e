use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::{MetricBounds, PlausibilityBounds};
use crate::error::PipelineError;
use crate::models::{Age, Article, CaseRecord, DataSummary, Metric, MetricSet, NewsContext};

macro_rules! text_pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

text_pattern!(RE_CPF, r"\b\d{3}\.\d{3}\.\d{3}-\d{2}\b");
text_pattern!(RE_PHONE, r"\(\d{2}\)\s?\d{4,5}-?\d{4}");
text_pattern!(RE_EMAIL, r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}");

const PROHIBITED_TERMS: &[&str] = &[
    "fake news",
    "teoria da conspiração",
    "negacionismo",
    "anti-vacina",
    "desinformação",
    "hoax",
    "golpe",
    "farsa",
];

/// Only rejected when the source is not in [`RELIABLE_SOURCES`].
const SUSPICIOUS_CLAIMS: &[&str] = &["milagre", "cura definitiva", "100% eficaz"];

const RELIABLE_SOURCES: &[&str] = &[
    "g1.com",
    "folha.uol.com.br",
    "estadao.com.br",
    "bbc.com",
    "gov.br",
    "saude.gov.br",
    "fiocruz.br",
    "butantan.gov.br",
];

const TOP_STATES: usize = 10;

/// Records that went through anonymization. Only the enforcer builds these.
#[derive(Debug, Clone)]
pub struct AnonymizedRecords(Vec<CaseRecord>);

impl AnonymizedRecords {
    pub fn as_slice(&self) -> &[CaseRecord] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Metrics that went through plausibility checks. Only the enforcer builds these.
#[derive(Debug, Clone)]
pub struct ValidatedMetrics(MetricSet);

impl ValidatedMetrics {
    pub fn set(&self) -> &MetricSet {
        &self.0
    }

    pub fn into_inner(self) -> MetricSet {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Violation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardFinding {
    pub metric: String,
    pub severity: Severity,
    pub message: String,
}

impl GuardFinding {
    pub fn as_violation(&self) -> Option<PipelineError> {
        (self.severity == Severity::Violation).then(|| PipelineError::GuardrailViolation {
            metric: self.metric.clone(),
            reason: self.message.clone(),
        })
    }
}

#[derive(Debug)]
pub struct GuardOutcome {
    pub records: AnonymizedRecords,
    pub metrics: ValidatedMetrics,
    pub findings: Vec<GuardFinding>,
    /// Records that carried at least one identifying field.
    pub anonymized: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewsRejection {
    pub title: String,
    pub reason: String,
}

pub struct GuardrailEnforcer {
    bounds: PlausibilityBounds,
}

impl GuardrailEnforcer {
    pub fn new(bounds: PlausibilityBounds) -> Self {
        Self { bounds }
    }

    /// Values are never clamped or dropped; out-of-range metrics are flagged
    /// `suspicious` and every fired rule is returned as a finding.
    #[tracing::instrument(
        name = "pipeline_stage guardrails",
        skip_all,
        fields(
            pipeline.stage = "guardrails",
            guardrails.records = records.len(),
            guardrails.findings,
        )
    )]
    pub fn validate_and_anonymize(
        &self,
        records: Vec<CaseRecord>,
        mut metrics: MetricSet,
    ) -> GuardOutcome {
        let anonymized = records.iter().filter(|r| !r.is_anonymized()).count();
        let records = records.into_iter().map(anonymize_record).collect();

        let mut findings = Vec::new();
        for metric in metrics.metrics.iter_mut() {
            if let Some(bounds) = self.bounds.for_metric(&metric.name) {
                findings.extend(check_metric(metric, bounds));
            }
        }

        tracing::Span::current().record("guardrails.findings", findings.len());
        for finding in findings.iter().filter(|f| f.severity == Severity::Violation) {
            tracing::warn!(metric = %finding.metric, "{}", finding.message);
        }

        GuardOutcome {
            records: AnonymizedRecords(records),
            metrics: ValidatedMetrics(metrics),
            findings,
            anonymized,
        }
    }
}

fn check_metric(metric: &mut Metric, bounds: MetricBounds) -> Option<GuardFinding> {
    let value = metric.value?;

    let (severity, message) = if !value.is_finite() || value < bounds.min || value > bounds.max {
        (
            Severity::Violation,
            format!(
                "{} = {value} outside plausible range [{}, {}]",
                metric.name, bounds.min, bounds.max
            ),
        )
    } else if value > bounds.warning_threshold {
        (
            Severity::Warning,
            format!(
                "{} = {value} above warning threshold {}",
                metric.name, bounds.warning_threshold
            ),
        )
    } else {
        return None;
    };

    if severity == Severity::Violation {
        metric.suspicious = true;
    }
    if !metric.warnings.contains(&message) {
        metric.warnings.push(message.clone());
    }

    Some(GuardFinding {
        metric: metric.name.clone(),
        severity,
        message,
    })
}

/// Strips identifiers and municipality, and generalizes exact ages to bands.
/// Applying it twice yields the same record.
pub fn anonymize_record(mut record: CaseRecord) -> CaseRecord {
    record.notification_id = None;
    record.region.municipality = None;
    if let Age::Exact(_) = record.age {
        record.age = record.age.band().map(Age::Band).unwrap_or(Age::Unknown);
    }
    record
}

/// Replaces CPF numbers, phone numbers and e-mail addresses with placeholders.
pub fn scrub_text(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    for (pattern, placeholder) in [
        (&RE_CPF, "[CPF]"),
        (&RE_PHONE, "[PHONE]"),
        (&RE_EMAIL, "[EMAIL]"),
    ] {
        let Some(re) = (**pattern).as_ref() else {
            continue;
        };
        if re.is_match(&out) {
            out = Cow::Owned(re.replace_all(&out, placeholder).into_owned());
        }
    }
    out
}

fn is_reliable_source(url: &str, source: &str) -> bool {
    let url = url.to_lowercase();
    let source = source.to_lowercase();
    RELIABLE_SOURCES
        .iter()
        .any(|domain| url.contains(domain) || source.contains(domain))
}

fn scrub_article(mut article: Article) -> Article {
    for field in [&mut article.title, &mut article.summary, &mut article.source] {
        let scrubbed = scrub_text(field).into_owned();
        *field = scrubbed;
    }
    article
}

/// Scrubs personal data from every article, then drops articles mentioning
/// prohibited terms and articles from unlisted sources making suspicious
/// claims. Order of the kept articles is preserved.
pub fn filter_news(context: NewsContext) -> (NewsContext, Vec<NewsRejection>) {
    let mut kept = Vec::with_capacity(context.articles.len());
    let mut rejected = Vec::new();

    for article in context.articles.into_iter().map(scrub_article) {
        let content = format!("{} {}", article.title, article.summary).to_lowercase();

        let reason = PROHIBITED_TERMS
            .iter()
            .find(|term| content.contains(*term))
            .map(|term| format!("prohibited term \"{term}\""))
            .or_else(|| {
                if is_reliable_source(&article.url, &article.source) {
                    return None;
                }
                SUSPICIOUS_CLAIMS
                    .iter()
                    .find(|term| content.contains(*term))
                    .map(|term| format!("suspicious claim \"{term}\" from unlisted source"))
            });

        match reason {
            Some(reason) => rejected.push(NewsRejection {
                title: article.title,
                reason,
            }),
            None => kept.push(article),
        }
    }

    (NewsContext { articles: kept }, rejected)
}

/// Aggregated view for the report body. Works on anonymized records only.
pub fn summarize(records: &AnonymizedRecords) -> DataSummary {
    let records = records.as_slice();

    let mut states: BTreeMap<String, usize> = BTreeMap::new();
    let mut ages: BTreeMap<String, usize> = BTreeMap::new();
    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    for r in records {
        *states.entry(r.region.state.clone()).or_default() += 1;
        let band = r.age.band().map(|b| b.label()).unwrap_or("unknown");
        *ages.entry(band.to_string()).or_default() += 1;
        *outcomes.entry(r.outcome.as_str().to_string()).or_default() += 1;
    }

    let mut ranked: Vec<(String, usize)> = states.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_STATES);

    DataSummary {
        total_records: records.len(),
        first_report_date: records.iter().map(|r| r.report_date).min(),
        last_report_date: records.iter().map(|r| r.report_date).max(),
        state_distribution: ranked.into_iter().collect(),
        age_distribution: ages,
        outcome_distribution: outcomes,
        icu_cases: records.iter().filter(|r| r.icu_flag).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metrics::{
        CASE_GROWTH_RATE, DateWindow, ICU_OCCUPANCY_RATE, MORTALITY_RATE,
    };
    use crate::models::{AgeBand, Article, Outcome, Region, VaccinationStatus};
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn metric(name: &str, value: Option<f64>) -> Metric {
        Metric {
            name: name.to_string(),
            value,
            numerator: 0,
            sample_size: 100,
            period: "90_days".into(),
            interpretation: String::new(),
            low_confidence: false,
            suspicious: false,
            warnings: Vec::new(),
        }
    }

    fn metric_set(metrics: Vec<Metric>) -> MetricSet {
        let day = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        MetricSet {
            reference_date: day,
            period: "90_days".into(),
            current_window: DateWindow {
                start: day,
                end: day,
            },
            previous_window: DateWindow {
                start: day,
                end: day,
            },
            total_cases: 100,
            metrics,
            insufficient_data: None,
        }
    }

    fn case(age: Age, state: &str, municipality: Option<&str>) -> CaseRecord {
        CaseRecord {
            report_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            onset_date: None,
            outcome: Outcome::Recovered,
            icu_flag: false,
            vaccination_status: VaccinationStatus::Unknown,
            region: Region::new(Some(state), municipality),
            age,
            notification_id: Some("123".into()),
        }
    }

    fn article(title: &str, url: &str) -> Article {
        Article {
            title: title.to_string(),
            source: "Portal".to_string(),
            url: url.to_string(),
            summary: String::new(),
            published_at: None,
            relevance_score: 0.5,
        }
    }

    fn enforcer() -> GuardrailEnforcer {
        GuardrailEnforcer::new(PlausibilityBounds::default())
    }

    #[test]
    fn test_implausible_metric_flagged_not_clamped() {
        let outcome = enforcer().validate_and_anonymize(
            vec![],
            metric_set(vec![
                metric(MORTALITY_RATE, Some(75.0)),
                metric(ICU_OCCUPANCY_RATE, Some(10.0)),
            ]),
        );

        let mortality = outcome.metrics.set().get(MORTALITY_RATE).unwrap();
        assert!(mortality.suspicious);
        assert_eq!(mortality.value, Some(75.0));
        assert_eq!(mortality.warnings.len(), 1);
        assert!(!outcome.metrics.set().get(ICU_OCCUPANCY_RATE).unwrap().suspicious);

        assert_eq!(outcome.findings.len(), 1);
        assert!(matches!(
            outcome.findings[0].as_violation(),
            Some(PipelineError::GuardrailViolation { ref metric, .. }) if metric == MORTALITY_RATE
        ));
    }

    #[test]
    fn test_warning_threshold_does_not_flag() {
        let outcome = enforcer().validate_and_anonymize(
            vec![],
            metric_set(vec![metric(ICU_OCCUPANCY_RATE, Some(85.0))]),
        );
        let icu = outcome.metrics.set().get(ICU_OCCUPANCY_RATE).unwrap();
        assert!(!icu.suspicious);
        assert_eq!(icu.warnings.len(), 1);
        assert_eq!(outcome.findings[0].severity, Severity::Warning);
        assert!(outcome.findings[0].as_violation().is_none());
    }

    #[test]
    fn test_negative_growth_within_bounds_and_undefined_skipped() {
        let outcome = enforcer().validate_and_anonymize(
            vec![],
            metric_set(vec![
                metric(CASE_GROWTH_RATE, Some(-40.0)),
                metric(MORTALITY_RATE, None),
            ]),
        );
        assert!(outcome.findings.is_empty());
    }

    #[test]
    fn test_anonymization_strips_identifiers() {
        let outcome = enforcer().validate_and_anonymize(
            vec![
                case(Age::Exact(72), "SP", Some("355030")),
                case(Age::Exact(8), "RJ", None),
                case(Age::Exact(150), "MG", None),
            ],
            metric_set(vec![]),
        );

        assert_eq!(outcome.anonymized, 3);
        let records = outcome.records.as_slice();
        assert!(records.iter().all(CaseRecord::is_anonymized));
        assert_eq!(records[0].age, Age::Band(AgeBand::Senior));
        assert_eq!(records[0].region.state, "SP");
        assert_eq!(records[1].age, Age::Band(AgeBand::Child));
        assert_eq!(records[2].age, Age::Unknown);
    }

    #[test]
    fn test_scrub_text_replaces_pii() {
        let scrubbed = scrub_text(
            "Contato: joao.silva@example.com, (11) 98765-4321, CPF 123.456.789-09.",
        );
        assert_eq!(scrubbed, "Contato: [EMAIL], [PHONE], CPF [CPF].");
        assert!(matches!(scrub_text("no personal data"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_filter_news_rejects_prohibited_and_unreliable_claims() {
        let context = NewsContext {
            articles: vec![
                article("Casos de SRAG sobem em SP", "https://g1.com/a"),
                article("Fake news sobre vacina circula", "https://g1.com/b"),
                article("Chá milagre contra SRAG", "https://blog.example/c"),
                article("Fiocruz estuda milagre da ciência", "https://fiocruz.br/d"),
            ],
        };

        let (kept, rejected) = filter_news(context);
        let titles: Vec<&str> = kept.articles.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Casos de SRAG sobem em SP", "Fiocruz estuda milagre da ciência"]
        );
        assert_eq!(rejected.len(), 2);
        assert!(rejected[0].reason.contains("fake news"));
        assert!(rejected[1].reason.contains("milagre"));
    }

    #[test]
    fn test_filter_news_scrubs_personal_data() {
        let mut leaky = article(
            "Paciente com CPF 123.456.789-09 internado",
            "https://g1.com/e",
        );
        leaky.summary = "Familia pede contato: joao@example.com ou (11) 98765-4321".into();

        let (kept, rejected) = filter_news(NewsContext {
            articles: vec![leaky],
        });
        assert!(rejected.is_empty());
        let kept = &kept.articles[0];
        assert_eq!(kept.title, "Paciente com CPF [CPF] internado");
        assert_eq!(kept.summary, "Familia pede contato: [EMAIL] ou [PHONE]");
    }

    #[test]
    fn test_summarize_aggregates() {
        let mut records: Vec<CaseRecord> = (0..12)
            .map(|i| case(Age::Exact(30), &format!("A{}", (b'A' + i) as char), None))
            .collect();
        records.push(case(Age::Exact(5), "AA", None));
        records[0].icu_flag = true;

        let outcome = enforcer().validate_and_anonymize(records, metric_set(vec![]));
        let summary = summarize(&outcome.records);

        assert_eq!(summary.total_records, 13);
        assert_eq!(summary.state_distribution.len(), TOP_STATES);
        assert_eq!(summary.state_distribution.get("AA"), Some(&2));
        assert_eq!(summary.age_distribution.get("19-60"), Some(&12));
        assert_eq!(summary.age_distribution.get("0-12"), Some(&1));
        assert_eq!(summary.outcome_distribution.get("recovered"), Some(&13));
        assert_eq!(summary.icu_cases, 1);
    }

    proptest! {
        #[test]
        fn anonymization_is_idempotent(
            age in proptest::option::of(-5i32..140),
            state in "[A-Za-z]{0,3}",
            municipality in proptest::option::of("[0-9]{6}"),
        ) {
            let mut record = case(
                age.map(Age::Exact).unwrap_or(Age::Unknown),
                &state,
                municipality.as_deref(),
            );
            if let Some(years) = age {
                record.age = if years % 2 == 0 {
                    Age::Exact(years)
                } else {
                    AgeBand::from_years(years).map(Age::Band).unwrap_or(Age::Unknown)
                };
            }

            let once = anonymize_record(record);
            let twice = anonymize_record(once.clone());
            prop_assert!(once.is_anonymized());
            prop_assert_eq!(once, twice);
        }
    }
}
