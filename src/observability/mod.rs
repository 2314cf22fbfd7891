//! Observability: structured logging, process-wide metrics and the local
//! health endpoints.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{LogFormat, init_default_logging, init_logging, parse_level};
pub use metrics::{MetricsCollector, MetricsSnapshot, metrics};

// Span macros for structured logging
pub use logging::{job_span, lifecycle_span, transport_span};
