//! Job intake: normalization, routing, resource locking and dispatch

pub mod dispatcher;
pub mod guard;
pub mod handler;
pub mod job;
pub mod normalizer;
pub mod router;

use crate::protocol::messages::ErrorCode;
use thiserror::Error;

pub use dispatcher::{DispatchReport, Dispatcher, Verdict};
pub use guard::{ConcurrencyGuard, ResourceLease};
pub use handler::{HandlerError, HealthCheckHandler, JobHandler, Outcome};
pub use job::{actions, Job};
pub use normalizer::{canonical_action, extract_job_id, JobNormalizer};
pub use router::{resource_key, CommandRouter, Route};

/// Reasons a job is refused before any handler runs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Malformed job: {0}")]
    Malformed(String),
    #[error("Unsupported action type: {0}")]
    Unsupported(String),
    #[error("Resource busy: {0} already has a job in flight")]
    ResourceBusy(String),
}

impl JobError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            JobError::Malformed(_) => ErrorCode::JobMalformed,
            JobError::Unsupported(_) => ErrorCode::JobUnsupported,
            JobError::ResourceBusy(_) => ErrorCode::ResourceBusy,
        }
    }
}
