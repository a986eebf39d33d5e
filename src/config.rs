use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

/// Inclusive plausibility range for one indicator, plus the level above which
/// a value is reported as a warning without being flagged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricBounds {
    pub min: f64,
    pub max: f64,
    pub warning_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlausibilityBounds {
    pub case_growth_rate: MetricBounds,
    pub mortality_rate: MetricBounds,
    pub icu_occupancy_rate: MetricBounds,
    pub vaccination_rate: MetricBounds,
}

impl PlausibilityBounds {
    pub fn for_metric(&self, name: &str) -> Option<MetricBounds> {
        use crate::models::metrics::*;
        match name {
            CASE_GROWTH_RATE => Some(self.case_growth_rate),
            MORTALITY_RATE => Some(self.mortality_rate),
            ICU_OCCUPANCY_RATE => Some(self.icu_occupancy_rate),
            VACCINATION_RATE => Some(self.vaccination_rate),
            _ => None,
        }
    }
}

impl Default for PlausibilityBounds {
    fn default() -> Self {
        Self {
            case_growth_rate: MetricBounds {
                min: -100.0,
                max: 1000.0,
                warning_threshold: 200.0,
            },
            mortality_rate: MetricBounds {
                min: 0.0,
                max: 50.0,
                warning_threshold: 30.0,
            },
            icu_occupancy_rate: MetricBounds {
                min: 0.0,
                max: 100.0,
                warning_threshold: 80.0,
            },
            vaccination_rate: MetricBounds {
                min: 0.0,
                max: 100.0,
                warning_threshold: 95.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageTimeouts {
    pub data: Duration,
    pub news: Duration,
    pub narrative: Duration,
    pub charts: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            data: Duration::from_secs(60),
            news: Duration::from_secs(30),
            narrative: Duration::from_secs(60),
            charts: Duration::from_secs(30),
        }
    }
}

/// Ten years of windows; anything longer cannot be loaded as a date range.
const PERIOD_DAYS: RangeInclusive<u32> = 1..=3650;
const NEWS_DAYS: RangeInclusive<u32> = 1..=365;

/// Everything the orchestrator needs to know about policy. Passed in by the
/// binaries; the pipeline never reads the environment itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub period_days: u32,
    pub min_sample_size: u64,
    pub bounds: PlausibilityBounds,
    pub news_cache_ttl: Duration,
    pub news_retry: RetryPolicy,
    pub news_max_articles: usize,
    pub news_days: u32,
    pub news_terms: Vec<String>,
    pub timeouts: StageTimeouts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            period_days: 90,
            min_sample_size: 30,
            bounds: PlausibilityBounds::default(),
            news_cache_ttl: Duration::from_secs(1800),
            news_retry: RetryPolicy::default(),
            news_max_articles: 10,
            news_days: 30,
            news_terms: vec![
                "SRAG".to_string(),
                "Síndrome Respiratória Aguda Grave".to_string(),
                "internação respiratória".to_string(),
            ],
            timeouts: StageTimeouts::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            period_days: parse_in_range("METRICS_PERIOD_DAYS", defaults.period_days, PERIOD_DAYS)?,
            min_sample_size: parse_or("MIN_SAMPLE_SIZE", defaults.min_sample_size)?,
            bounds: defaults.bounds,
            news_cache_ttl: Duration::from_secs(parse_or("NEWS_CACHE_TTL_SECS", 1800)?),
            news_retry: RetryPolicy {
                max_retries: parse_or("NEWS_MAX_RETRIES", defaults.news_retry.max_retries)?,
                base_delay: Duration::from_millis(parse_or("NEWS_RETRY_BASE_MS", 500)?),
                max_delay: Duration::from_millis(parse_or("NEWS_RETRY_MAX_MS", 10_000)?),
            },
            news_max_articles: parse_or("NEWS_MAX_ARTICLES", defaults.news_max_articles)?,
            news_days: parse_in_range("NEWS_DAYS", defaults.news_days, NEWS_DAYS)?,
            news_terms: env::var("NEWS_TERMS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.news_terms),
            timeouts: StageTimeouts {
                data: Duration::from_secs(parse_or("DATA_TIMEOUT_SECS", 60)?),
                news: Duration::from_secs(parse_or("NEWS_TIMEOUT_SECS", 30)?),
                narrative: Duration::from_secs(parse_or("LLM_TIMEOUT_SECS", 60)?),
                charts: Duration::from_secs(parse_or("CHART_TIMEOUT_SECS", 30)?),
            },
        })
    }

    /// Days to load so both the current and the preceding window are covered.
    pub fn lookback_days(&self) -> u32 {
        self.period_days * 2 + 1
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub database_url: Option<String>,
    pub data_file: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub llm_provider: String,
    pub llm_model: String,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub news_api_key: Option<String>,
    pub news_language: String,
    pub otel_service_name: String,
    pub otel_exporter_endpoint: String,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: parse_or("APP_PORT", 8080)?,
            environment: env::var("SRAG_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            database_url: env::var("DATABASE_URL").ok(),
            data_file: env::var("SRAG_DATA_FILE").ok().map(PathBuf::from),
            reports_dir: env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/reports")),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "google".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            google_api_key: env::var("GOOGLE_API_KEY").ok(),
            news_api_key: env::var("NEWS_API_KEY").ok(),
            news_language: env::var("NEWS_LANGUAGE").unwrap_or_else(|_| "pt".to_string()),
            otel_service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "srag-report-generator".to_string()),
            otel_exporter_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            default_temperature: parse_or("DEFAULT_TEMPERATURE", 0.3)?,
            default_max_tokens: parse_or("DEFAULT_MAX_TOKENS", 2048)?,
            pipeline: PipelineConfig::from_env()?,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn parse_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_in_range<T>(name: &str, default: T, range: RangeInclusive<T>) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    check_range(name, parse_or(name, default)?, &range)
}

fn check_range<T: PartialOrd + Display>(
    name: &str,
    value: T,
    range: &RangeInclusive<T>,
) -> anyhow::Result<T> {
    if !range.contains(&value) {
        bail!(
            "{name} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        );
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metrics::{MORTALITY_RATE, VACCINATION_RATE};

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.period_days, 90);
        assert_eq!(config.min_sample_size, 30);
        assert_eq!(config.news_retry.max_retries, 3);
        assert_eq!(config.news_cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.lookback_days(), 181);
    }

    #[test]
    fn test_bounds_lookup() {
        let bounds = PlausibilityBounds::default();
        assert_eq!(bounds.for_metric(MORTALITY_RATE).unwrap().max, 50.0);
        assert_eq!(bounds.for_metric(VACCINATION_RATE).unwrap().max, 100.0);
        assert!(bounds.for_metric("hospital_stay").is_none());
    }

    #[test]
    fn test_parse_or_uses_default_when_unset() {
        let value: u32 = parse_or("SRAG_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_period_days_outside_range_is_rejected() {
        let err = check_range("METRICS_PERIOD_DAYS", 0u32, &PERIOD_DAYS).unwrap_err();
        assert!(err.to_string().contains("METRICS_PERIOD_DAYS"));

        let err = check_range("METRICS_PERIOD_DAYS", u32::MAX, &PERIOD_DAYS).unwrap_err();
        assert!(err.to_string().contains("between 1 and 3650"));

        assert_eq!(check_range("METRICS_PERIOD_DAYS", 90, &PERIOD_DAYS).unwrap(), 90);
        let widest = PipelineConfig {
            period_days: *PERIOD_DAYS.end(),
            ..PipelineConfig::default()
        };
        assert_eq!(widest.lookback_days(), 7301);
    }
}
