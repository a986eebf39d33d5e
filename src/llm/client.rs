use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{GenerateRequest, GenerateResponse, Provider};
use crate::config::RetryPolicy;
use crate::news::retry::backoff_delay;
use crate::telemetry::metrics::{
    GEN_AI_ERROR_COUNT, GEN_AI_OPERATION_DURATION, GEN_AI_RETRY_COUNT, GEN_AI_TOKEN_USAGE,
};

const PROMPT_EVENT_CHARS: usize = 1000;
const COMPLETION_EVENT_CHARS: usize = 2000;

/// Coarse failure classes, derived from the provider's error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    RateLimit,
    Timeout,
    Auth,
    InvalidRequest,
    Server,
    Network,
    Unknown,
}

impl LlmErrorKind {
    pub fn classify(err: &anyhow::Error) -> Self {
        let msg = err.to_string().to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        if has(&["rate limit", "429"]) {
            Self::RateLimit
        } else if has(&["timeout", "timed out", "deadline"]) {
            Self::Timeout
        } else if has(&["401", "403", "auth", "api key"]) {
            Self::Auth
        } else if has(&["400", "422", "invalid"]) {
            Self::InvalidRequest
        } else if has(&["500", "502", "503", "server"]) {
            Self::Server
        } else if has(&["connect", "dns", "network", "reset"]) {
            Self::Network
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Auth => "auth_error",
            Self::InvalidRequest => "invalid_request",
            Self::Server => "server_error",
            Self::Network => "network_error",
            Self::Unknown => "unknown_error",
        }
    }

    /// Asking again with the same key and prompt cannot fix these.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Auth | Self::InvalidRequest)
    }
}

/// Wraps a [`Provider`] with gen_ai spans, token metrics and retries.
pub struct LlmClient {
    pub provider: Arc<dyn Provider>,
    /// Total attempts, not retries. Zero is treated as one.
    pub max_retries: u32,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            max_retries: 3,
        }
    }

    fn backoff(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    async fn attempt(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let provider = self.provider.name();
        let host = super::openai::Backend::from_name(provider).host();
        let start = Instant::now();

        let span = tracing::info_span!(
            "gen_ai.chat",
            otel.name = %format!("gen_ai.chat {}", req.model),
            gen_ai.operation.name = "chat",
            gen_ai.provider.name = %provider,
            gen_ai.request.model = %req.model,
            server.address = host,
            server.port = 443,
            gen_ai.request.temperature = req.temperature,
            gen_ai.request.max_tokens = req.max_tokens as i64,
            gen_ai.response.model = tracing::field::Empty,
            gen_ai.usage.input_tokens = tracing::field::Empty,
            gen_ai.usage.output_tokens = tracing::field::Empty,
            gen_ai.response.finish_reasons = tracing::field::Empty,
            report.stage = %req.stage,
            otel.status_code = tracing::field::Empty,
            error.type = tracing::field::Empty,
        );
        span.add_event(
            "gen_ai.user.message",
            vec![KeyValue::new(
                "gen_ai.prompt",
                truncate(&req.prompt, PROMPT_EVENT_CHARS).to_string(),
            )],
        );

        let result = self.provider.generate(req).instrument(span.clone()).await;
        let model_kv = KeyValue::new("gen_ai.request.model", req.model.clone());
        let provider_kv = KeyValue::new("gen_ai.provider.name", provider.to_string());

        match result {
            Ok(mut resp) => {
                resp.provider = provider.to_string();
                span.record("gen_ai.response.model", resp.model.as_str());
                span.record("gen_ai.usage.input_tokens", resp.input_tokens as i64);
                span.record("gen_ai.usage.output_tokens", resp.output_tokens as i64);
                if !resp.finish_reason.is_empty() {
                    span.record("gen_ai.response.finish_reasons", resp.finish_reason.as_str());
                }
                span.add_event(
                    "gen_ai.assistant.message",
                    vec![KeyValue::new(
                        "gen_ai.completion",
                        truncate(&resp.content, COMPLETION_EVENT_CHARS).to_string(),
                    )],
                );

                for (kind, tokens) in [("input", resp.input_tokens), ("output", resp.output_tokens)] {
                    GEN_AI_TOKEN_USAGE.record(
                        f64::from(tokens),
                        &[
                            KeyValue::new("gen_ai.token.type", kind),
                            provider_kv.clone(),
                            model_kv.clone(),
                        ],
                    );
                }
                GEN_AI_OPERATION_DURATION.record(
                    start.elapsed().as_secs_f64(),
                    &[KeyValue::new("gen_ai.operation.name", "chat"), provider_kv, model_kv],
                );
                Ok(resp)
            }
            Err(err) => {
                let kind = LlmErrorKind::classify(&err).as_str();
                span.record("otel.status_code", "ERROR");
                span.record("error.type", kind);
                GEN_AI_ERROR_COUNT.add(
                    1,
                    &[provider_kv, model_kv, KeyValue::new("error.type", kind)],
                );
                Err(err)
            }
        }
    }

    /// Up to `max_retries` attempts with jittered exponential backoff. Errors
    /// that cannot succeed on a second try end the loop early.
    pub async fn generate(&self, req: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        let policy = self.backoff();
        let attempts = policy.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };

            let kind = LlmErrorKind::classify(&err);
            tracing::warn!(
                attempt,
                attempts,
                provider = self.provider.name(),
                model = %req.model,
                error = %err,
                error.type = kind.as_str(),
                "LLM call failed"
            );
            if !kind.is_retryable() || attempt >= attempts {
                return Err(err);
            }

            GEN_AI_RETRY_COUNT.add(
                1,
                &[
                    KeyValue::new("gen_ai.provider.name", self.provider.name().to_string()),
                    KeyValue::new("gen_ai.request.model", req.model.clone()),
                ],
            );
            tokio::time::sleep(backoff_delay(&policy, attempt - 1)).await;
        }
    }
}

/// Cuts at a char boundary at or below `max` bytes.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
