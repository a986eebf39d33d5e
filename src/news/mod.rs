pub mod cache;
pub mod newsapi;
pub mod retry;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use thiserror::Error;

use crate::config::RetryPolicy;
use crate::models::{Article, NewsContext};

pub use cache::{CacheKey, NewsCache};
pub use newsapi::NewsApiClient;
pub use retry::{RetryOutcome, backoff_delay, search_with_retry};

const RELEVANCE_KEYWORDS: &[&str] = &[
    "srag",
    "respiratória",
    "respiratorio",
    "uti",
    "internação",
    "internacao",
    "hospital",
    "casos",
    "surto",
    "epidemia",
    "pneumonia",
    "covid",
    "influenza",
    "h1n1",
    "gripe",
];

const MIN_KEYWORD_HITS: usize = 2;
/// Keyword hits at which an article scores 1.0.
const RELEVANCE_SATURATION: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NewsError {
    #[error("news request timed out")]
    Timeout,

    #[error("news transport error: {0}")]
    Transport(String),

    #[error("news API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("news response could not be decoded: {0}")]
    Decode(String),

    #[error("news API key not configured")]
    NotConfigured,
}

impl NewsError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::NotConfigured => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewsQuery {
    pub reference_date: NaiveDate,
    pub terms: Vec<String>,
    pub from: NaiveDate,
    pub page_size: usize,
}

impl NewsQuery {
    pub fn new(reference_date: NaiveDate, terms: &[String], days: u32, page_size: usize) -> Self {
        Self {
            reference_date,
            terms: terms.to_vec(),
            from: reference_date - Duration::days(i64::from(days)),
            page_size,
        }
    }

    pub fn search_expression(&self) -> String {
        self.terms
            .iter()
            .map(|t| {
                if t.contains(' ') {
                    format!("\"{t}\"")
                } else {
                    t.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

#[async_trait::async_trait]
pub trait NewsSearch: Send + Sync {
    async fn search(&self, query: &NewsQuery) -> Result<Vec<Article>, NewsError>;
    fn name(&self) -> &str;
}

/// Result of one context fetch. A failed fetch still carries an (empty)
/// context and the reason it was degraded.
#[derive(Debug, Clone, Default)]
pub struct NewsFetch {
    pub context: NewsContext,
    pub attempts: u32,
    pub failures: Vec<String>,
    pub cache_hit: bool,
    pub degraded: Option<String>,
}

impl NewsFetch {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

pub struct NewsContextAdapter {
    client: Arc<dyn NewsSearch>,
    cache: NewsCache,
    retry: RetryPolicy,
    news_days: u32,
    max_articles: usize,
}

impl NewsContextAdapter {
    pub fn new(
        client: Arc<dyn NewsSearch>,
        cache: NewsCache,
        retry: RetryPolicy,
        news_days: u32,
        max_articles: usize,
    ) -> Self {
        Self {
            client,
            cache,
            retry,
            news_days,
            max_articles,
        }
    }

    pub fn cache(&self) -> &NewsCache {
        &self.cache
    }

    /// Never fails. Successful, post-processed contexts are cached; failures
    /// are not.
    #[tracing::instrument(
        name = "pipeline_stage news",
        skip(self, terms),
        fields(
            pipeline.stage = "news",
            news.provider = self.client.name(),
            news.cache_hit,
            news.attempts,
            news.articles,
        )
    )]
    pub async fn fetch_context(&self, reference_date: NaiveDate, terms: &[String]) -> NewsFetch {
        let span = tracing::Span::current();
        let key = CacheKey::new(reference_date, terms);

        if let Some(context) = self.cache.get(&key).await {
            span.record("news.cache_hit", true);
            span.record("news.attempts", 0);
            span.record("news.articles", context.len());
            return NewsFetch {
                context,
                cache_hit: true,
                ..Default::default()
            };
        }
        span.record("news.cache_hit", false);

        let query = NewsQuery::new(reference_date, terms, self.news_days, self.max_articles * 3);
        let outcome = search_with_retry(self.client.as_ref(), &query, &self.retry).await;
        span.record("news.attempts", outcome.attempts);

        match outcome.result {
            Ok(articles) => {
                let context = post_process(articles, &query, self.max_articles);
                span.record("news.articles", context.len());
                self.cache.insert(key, context.clone()).await;
                NewsFetch {
                    context,
                    attempts: outcome.attempts,
                    failures: outcome.failures,
                    cache_hit: false,
                    degraded: None,
                }
            }
            Err(err) => {
                span.record("news.articles", 0);
                NewsFetch {
                    context: NewsContext::empty(),
                    attempts: outcome.attempts,
                    failures: outcome.failures,
                    cache_hit: false,
                    degraded: Some(err.to_string()),
                }
            }
        }
    }
}

pub fn relevance(article: &Article) -> Option<f64> {
    let content = format!("{} {}", article.title, article.summary).to_lowercase();
    let hits = RELEVANCE_KEYWORDS
        .iter()
        .filter(|kw| content.contains(*kw))
        .count();
    (hits >= MIN_KEYWORD_HITS)
        .then(|| (hits as f64 / RELEVANCE_SATURATION as f64).min(1.0))
}

/// Keeps recent, relevant, distinct articles, most relevant first.
fn post_process(articles: Vec<Article>, query: &NewsQuery, max_articles: usize) -> NewsContext {
    let mut seen = HashSet::new();
    let mut kept: Vec<Article> = articles
        .into_iter()
        .filter(|a| match a.published_at {
            Some(at) => {
                let day = at.date_naive();
                day >= query.from && day <= query.reference_date
            }
            None => true,
        })
        .filter(|a| seen.insert(a.title.trim().to_lowercase()))
        .filter_map(|mut a| {
            a.relevance_score = relevance(&a)?;
            Some(a)
        })
        .collect();

    kept.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    kept.truncate(max_articles);
    NewsContext { articles: kept }
}
