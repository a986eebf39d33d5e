pub mod assemble;
pub mod audit;
pub mod charts;
pub mod guardrails;
pub mod metrics;
pub mod narrative;
pub mod orchestrator;
pub mod retrieve;

pub use assemble::{assemble, verify_signature};
pub use audit::{AuditEntry, AuditKind, AuditTrail};
pub use charts::{ChartSink, FsChartSink};
pub use guardrails::GuardrailEnforcer;
pub use metrics::{MetricRegistry, MetricsEngine};
pub use narrative::NarrativeGenerator;
pub use orchestrator::{Collaborators, Orchestrator, RunState};
pub use retrieve::{CaseSource, InMemoryCaseSource, JsonLinesCaseSource};
