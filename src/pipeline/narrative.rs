use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::llm::{GenerateRequest, LlmClient};
use crate::models::{DataSummary, MetricSet, NewsContext};

use super::guardrails::{ValidatedMetrics, scrub_text};

const SYSTEM_PROMPT: &str = "You are an epidemiologist writing the daily surveillance bulletin \
    on Severe Acute Respiratory Syndrome (SRAG) in Brazil. Use only the figures provided. \
    Never invent numbers, never mention individuals, and state clearly when a metric is \
    undefined, low confidence or flagged as implausible. Write 3 to 5 short paragraphs.";

const MAX_NEWS_IN_PROMPT: usize = 5;

#[derive(Debug, Clone)]
pub struct Narrative {
    pub text: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub struct NarrativeGenerator {
    llm: Arc<LlmClient>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl NarrativeGenerator {
    pub fn new(llm: Arc<LlmClient>, model: &str, temperature: f32, max_tokens: u32) -> Self {
        Self {
            llm,
            model: model.to_string(),
            temperature,
            max_tokens,
        }
    }

    /// Text returned by the model is scrubbed of personal data before it is
    /// handed back.
    #[tracing::instrument(
        name = "pipeline_stage narrative",
        skip_all,
        fields(
            pipeline.stage = "narrative",
            narrative.model = %self.model,
            narrative.chars,
        )
    )]
    pub async fn generate(
        &self,
        metrics: &ValidatedMetrics,
        news: &NewsContext,
        summary: &DataSummary,
    ) -> Result<Narrative, PipelineError> {
        let resp = self
            .llm
            .generate(&GenerateRequest {
                model: self.model.clone(),
                system: SYSTEM_PROMPT.to_string(),
                prompt: build_prompt(metrics.set(), news, summary),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                stage: "narrative".to_string(),
            })
            .await
            .map_err(|e| PipelineError::external("llm", e))?;

        let text = scrub_text(resp.content.trim()).into_owned();
        if text.is_empty() {
            return Err(PipelineError::external("llm", "empty completion"));
        }

        tracing::Span::current().record("narrative.chars", text.len());

        Ok(Narrative {
            text,
            model: resp.model,
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
        })
    }
}

fn metric_lines(metrics: &MetricSet) -> String {
    let mut out = String::new();
    for m in &metrics.metrics {
        let mut flags = Vec::new();
        if m.low_confidence {
            flags.push("low confidence");
        }
        if m.suspicious {
            flags.push("implausible, flagged");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        let _ = writeln!(
            out,
            "- {}: {} (n={}){} {}",
            m.name,
            m.display_value(),
            m.sample_size,
            flags,
            m.interpretation
        );
    }
    out
}

fn build_prompt(metrics: &MetricSet, news: &NewsContext, summary: &DataSummary) -> String {
    let mut prompt = format!(
        "Reference date: {}\nReporting window: {} to {} ({})\nCases in window: {}\n\nIndicators:\n{}",
        metrics.reference_date,
        metrics.current_window.start,
        metrics.current_window.end,
        metrics.period,
        metrics.total_cases,
        metric_lines(metrics),
    );

    if let Some(marker) = metrics.insufficient_data {
        let _ = writeln!(
            prompt,
            "\nOnly {} cases observed, below the minimum of {}. Treat every figure as preliminary.",
            marker.observed, marker.required
        );
    }

    if !summary.state_distribution.is_empty() {
        let states: Vec<String> = summary
            .state_distribution
            .iter()
            .map(|(uf, n)| format!("{uf}: {n}"))
            .collect();
        let _ = writeln!(prompt, "\nCases by state (top): {}", states.join(", "));
    }
    if !summary.age_distribution.is_empty() {
        let ages: Vec<String> = summary
            .age_distribution
            .iter()
            .map(|(band, n)| format!("{band}: {n}"))
            .collect();
        let _ = writeln!(prompt, "Cases by age band: {}", ages.join(", "));
    }

    if news.is_empty() {
        prompt.push_str("\nNo recent news context is available.\n");
    } else {
        prompt.push_str("\nRecent news headlines:\n");
        for article in news.articles.iter().take(MAX_NEWS_IN_PROMPT) {
            let _ = writeln!(prompt, "- {} ({})", article.title, article.source);
        }
    }

    prompt.push_str(
        "\nWrite the bulletin: overall situation, what each indicator means for health \
        services, and how the news context relates to the figures.",
    );
    prompt
}

/// Deterministic narrative used when generation fails or times out.
pub fn template_narrative(
    metrics: &ValidatedMetrics,
    news: &NewsContext,
    summary: &DataSummary,
) -> String {
    let set = metrics.set();
    let mut text = format!(
        "SRAG daily bulletin for {}. {} cases were reported between {} and {}.\n\n",
        set.reference_date, set.total_cases, set.current_window.start, set.current_window.end
    );

    for m in &set.metrics {
        let _ = writeln!(text, "{}: {}. {}.", title_case(&m.name), m.display_value(), m.interpretation);
    }

    if let Some(marker) = set.insufficient_data {
        let _ = write!(
            text,
            "\nThe sample ({} cases) is below the minimum of {}; figures are preliminary.\n",
            marker.observed, marker.required
        );
    }

    let flagged: Vec<&str> = set.suspicious().map(|m| m.name.as_str()).collect();
    if !flagged.is_empty() {
        let _ = write!(
            text,
            "\nThe following indicators fall outside plausible ranges and need review: {}.\n",
            flagged.join(", ")
        );
    }

    if summary.icu_cases > 0 {
        let _ = write!(
            text,
            "\n{} of the analysed records required intensive care.\n",
            summary.icu_cases
        );
    }

    match news.articles.first() {
        Some(top) => {
            let _ = write!(
                text,
                "\n{} related news items were found; the most relevant: \"{}\" ({}).\n",
                news.len(),
                top.title,
                top.source
            );
        }
        None => text.push_str("\nNo news context was available for this report.\n"),
    }

    scrub_text(text.trim_end()).into_owned()
}

fn title_case(name: &str) -> String {
    let spaced = name.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
