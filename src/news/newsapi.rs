use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{NewsError, NewsQuery, NewsSearch};
use crate::models::Article;

const NEWSAPI_URL: &str = "https://newsapi.org/v2/everything";

/// Client for the newsapi.org `everything` endpoint.
pub struct NewsApiClient {
    client: reqwest::Client,
    api_key: Option<String>,
    language: String,
}

impl NewsApiClient {
    pub fn new(api_key: Option<String>, language: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            language: language.to_string(),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EverythingResponse {
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsApiArticle {
    source: Option<NewsApiSource>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    published_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct NewsApiSource {
    name: Option<String>,
}

#[derive(Deserialize)]
struct NewsApiError {
    message: String,
}

impl NewsApiArticle {
    /// `None` for untitled entries and the `[Removed]` placeholders.
    fn into_article(self) -> Option<Article> {
        let title = self.title.filter(|t| !t.trim().is_empty() && t != "[Removed]")?;
        Some(Article {
            title,
            source: self.source.and_then(|s| s.name).unwrap_or_default(),
            url: self.url.unwrap_or_default(),
            summary: self.description.unwrap_or_default(),
            published_at: self.published_at,
            relevance_score: 0.0,
        })
    }
}

fn classify_transport(err: reqwest::Error) -> NewsError {
    if err.is_timeout() {
        NewsError::Timeout
    } else if err.is_decode() {
        NewsError::Decode(err.to_string())
    } else {
        NewsError::Transport(err.to_string())
    }
}

#[async_trait::async_trait]
impl NewsSearch for NewsApiClient {
    async fn search(&self, query: &NewsQuery) -> Result<Vec<Article>, NewsError> {
        let api_key = self.api_key.as_deref().ok_or(NewsError::NotConfigured)?;

        let from = query.from.format("%Y-%m-%d").to_string();
        let page_size = query.page_size.clamp(1, 100).to_string();
        let response = self
            .client
            .get(NEWSAPI_URL)
            .query(&[
                ("q", query.search_expression().as_str()),
                ("from", from.as_str()),
                ("language", self.language.as_str()),
                ("sortBy", "relevancy"),
                ("pageSize", page_size.as_str()),
            ])
            .header("X-Api-Key", api_key)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<NewsApiError>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(NewsError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body: EverythingResponse = response.json().await.map_err(classify_transport)?;
        let articles: Vec<Article> = body
            .articles
            .into_iter()
            .filter_map(NewsApiArticle::into_article)
            .collect();

        tracing::info!(
            provider = "newsapi",
            articles = articles.len(),
            "News search completed"
        );

        Ok(articles)
    }

    fn name(&self) -> &str {
        "newsapi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let client = NewsApiClient::new(Some("  ".into()), "pt", Duration::from_secs(1)).unwrap();
        let query = NewsQuery::new(
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            &["srag".to_string()],
            30,
            10,
        );
        assert_eq!(client.search(&query).await.unwrap_err(), NewsError::NotConfigured);
    }

    #[test]
    fn test_article_conversion_skips_removed() {
        let raw: EverythingResponse = serde_json::from_str(
            r#"{
                "status": "ok",
                "articles": [
                    {"source": {"id": null, "name": "G1"}, "title": "Casos de SRAG",
                     "description": "Alta nas internações", "url": "https://g1.com/x",
                     "publishedAt": "2024-06-29T10:00:00Z"},
                    {"source": {"name": "x"}, "title": "[Removed]", "url": null}
                ]
            }"#,
        )
        .unwrap();

        let articles: Vec<Article> = raw
            .articles
            .into_iter()
            .filter_map(NewsApiArticle::into_article)
            .collect();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].source, "G1");
        assert_eq!(articles[0].summary, "Alta nas internações");
        assert!(articles[0].published_at.is_some());
    }
}
