use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub source: String,
    pub url: String,
    pub summary: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Keyword relevance in `[0, 1]`.
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewsContext {
    pub articles: Vec<Article>,
}

impl NewsContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }
}
