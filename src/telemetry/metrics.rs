use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
};
use std::sync::LazyLock;

pub static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("srag-report-generator"));

// --- LLM Gateway Metrics ---

pub static GEN_AI_TOKEN_USAGE: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("gen_ai.client.token.usage")
        .with_description("Number of tokens used per LLM call")
        .with_unit("{token}")
        .build()
});

pub static GEN_AI_OPERATION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("gen_ai.client.operation.duration")
        .with_description("Duration of LLM operations in seconds")
        .with_unit("s")
        .build()
});

pub static GEN_AI_RETRY_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("gen_ai.client.retry.count")
        .with_description("Number of LLM call retries")
        .with_unit("{retry}")
        .build()
});

pub static GEN_AI_ERROR_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("gen_ai.client.error.count")
        .with_description("Number of LLM call errors")
        .with_unit("{error}")
        .build()
});

// --- Report Pipeline Metrics ---

pub static REPORT_RUNS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("report.runs")
        .with_description("Report runs by outcome")
        .with_unit("{run}")
        .build()
});

pub static REPORT_GENERATION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("report.generation.duration")
        .with_description("Total report generation duration in seconds")
        .with_unit("s")
        .build()
});

pub static REPORT_CASE_RECORDS: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("report.case_records")
        .with_description("Number of case records loaded per report")
        .with_unit("{record}")
        .build()
});

pub static REPORT_DEGRADED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("report.degraded")
        .with_description("Optional report components lost to a recoverable failure")
        .with_unit("{component}")
        .build()
});

pub static GUARDRAIL_FINDINGS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("report.guardrail.findings")
        .with_description("Guardrail rules fired on computed metrics")
        .with_unit("{finding}")
        .build()
});

// --- News Metrics ---

pub static NEWS_CACHE_HITS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("news.cache.hits")
        .with_description("News context lookups served from cache")
        .with_unit("{hit}")
        .build()
});

pub static NEWS_CACHE_MISSES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("news.cache.misses")
        .with_description("News context lookups that required a network call")
        .with_unit("{miss}")
        .build()
});

pub static NEWS_RETRY_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("news.retry.count")
        .with_description("Number of news search retries")
        .with_unit("{retry}")
        .build()
});

// --- HTTP Metrics ---

pub static HTTP_REQUESTS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("http.requests.total")
        .with_description("Total number of HTTP requests")
        .with_unit("{request}")
        .build()
});

pub static HTTP_REQUEST_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("http.request.duration")
        .with_description("HTTP request duration in milliseconds")
        .with_unit("ms")
        .with_boundaries(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        ])
        .build()
});
