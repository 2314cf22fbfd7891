//! Handler contract and the built-in health check handler

use super::guard::ConcurrencyGuard;
use super::job::Job;
use crate::emitter::JobEmitter;
use crate::observability::metrics;
use crate::protocol::messages::{ErrorCode, HeartbeatMetrics};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// What a handler reports when it finishes normally
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    pub details: Value,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Handler failure; only `Transient` is eligible for redelivery
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Transient(_) => ErrorCode::HandlerTransientFailure,
            Self::Fatal(_) => ErrorCode::HandlerFatalFailure,
        }
    }
}

/// A capability registered for one action type
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job, emitter: &JobEmitter) -> Result<Outcome, HandlerError>;
}

/// Answers `health_check` jobs with the agent's own metrics snapshot
pub struct HealthCheckHandler {
    guard: Arc<ConcurrencyGuard>,
}

impl HealthCheckHandler {
    pub fn new(guard: Arc<ConcurrencyGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    async fn execute(&self, _job: &Job, _emitter: &JobEmitter) -> Result<Outcome, HandlerError> {
        let collector = metrics();
        let details = json!({
            "agentVersion": env!("CARGO_PKG_VERSION"),
            "uptimeSecs": collector.uptime().as_secs(),
            "jobsInFlight": collector.jobs_in_flight(),
            "locksHeld": self.guard.held_count(),
            "activeTransport": collector.active_transport(),
            "cpuCount": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            "loadAverage": HeartbeatMetrics::sample_load_average(),
        });
        Ok(Outcome::success("Agent healthy").with_details(details))
    }
}
