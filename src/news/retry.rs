use std::time::Duration;

use opentelemetry::KeyValue;

use super::{NewsError, NewsQuery, NewsSearch};
use crate::config::RetryPolicy;
use crate::models::Article;
use crate::telemetry::NEWS_RETRY_COUNT;

#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<Vec<Article>, NewsError>,
    pub attempts: u32,
    /// One message per failed attempt, in order.
    pub failures: Vec<String>,
}

impl RetryOutcome {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// `base * 2^retry` capped at `max_delay`, plus up to 25% jitter.
pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(retry))
        .min(policy.max_delay);
    let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter_ms)
}

/// Calls `client` until it succeeds, a non-retryable error comes back, or
/// `max_retries` retries have been spent.
pub async fn search_with_retry(
    client: &dyn NewsSearch,
    query: &NewsQuery,
    policy: &RetryPolicy,
) -> RetryOutcome {
    let mut failures = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match client.search(query).await {
            Ok(articles) => {
                return RetryOutcome {
                    result: Ok(articles),
                    attempts: attempt,
                    failures,
                };
            }
            Err(err) => {
                failures.push(err.to_string());
                let retries_spent = attempt - 1;

                if !err.is_retryable() || retries_spent >= policy.max_retries {
                    tracing::warn!(
                        attempt,
                        provider = client.name(),
                        error = %err,
                        retryable = err.is_retryable(),
                        "News search failed, giving up"
                    );
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        failures,
                    };
                }

                let delay = backoff_delay(policy, retries_spent);
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    provider = client.name(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "News search failed, retrying"
                );
                NEWS_RETRY_COUNT.add(1, &[KeyValue::new("news.provider", client.name().to_string())]);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
