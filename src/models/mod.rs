pub mod case;
pub mod metrics;
pub mod news;
pub mod report;

pub use case::{Age, AgeBand, CaseRecord, Outcome, RawCaseRow, Region, VaccinationStatus};
pub use metrics::{DateWindow, InsufficientData, Metric, MetricSet};
pub use news::{Article, NewsContext};
pub use report::{ChartRef, DataSummary, Degradation, ReportArtifact, ReportRequest};
