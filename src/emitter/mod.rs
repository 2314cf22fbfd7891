//! Transport-agnostic outbound path for job status, logs and results
//!
//! Handlers only ever see a [`JobEmitter`]. The transport selector attaches
//! whichever transport is live to the shared [`Emitter`]; with nothing
//! attached, messages are dropped after a single warning per outage.

use crate::error::{sanitize_error_message, AgentError};
use crate::jobs::Outcome;
use crate::observability::metrics;
use crate::protocol::messages::{
    ErrorCode, LogLevel, LogMessage, OutboundMessage, ResultMessage, StatusMessage,
};
use crate::transport::{TransportError, TransportKind};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Publishing capability a live transport hands to the emitter
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

#[derive(Clone)]
struct ActiveSink {
    kind: TransportKind,
    sink: Arc<dyn OutboundSink>,
}

pub struct Emitter {
    server_id: String,
    active: RwLock<Option<ActiveSink>>,
    warned_unattached: AtomicBool,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("server_id", &self.server_id)
            .field("active", &self.active_transport())
            .finish()
    }
}

impl Emitter {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            active: RwLock::new(None),
            warned_unattached: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn attach(&self, kind: TransportKind, sink: Arc<dyn OutboundSink>) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) =
            Some(ActiveSink { kind, sink });
        self.warned_unattached.store(false, Ordering::Relaxed);
        debug!(transport = %kind, "Emitter attached");
    }

    /// Detach the current sink, returning which transport it belonged to
    pub fn detach(&self) -> Option<TransportKind> {
        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = &previous {
            debug!(transport = %active.kind, "Emitter detached");
        }
        previous.map(|active| active.kind)
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.kind)
    }

    /// Forward `message` to the active transport; returns whether it was handed off
    pub async fn emit(&self, message: &OutboundMessage) -> bool {
        let active = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(active) = active else {
            metrics().message_dropped();
            if !self.warned_unattached.swap(true, Ordering::Relaxed) {
                warn!(
                    kind = message.kind(),
                    job_id = message.job_id().unwrap_or(""),
                    "No active transport; dropping outbound messages until one attaches"
                );
            }
            return false;
        };

        match active.sink.publish(message).await {
            Ok(()) => {
                metrics().message_published();
                true
            }
            Err(e) => {
                metrics().publish_failed();
                warn!(
                    transport = %active.kind,
                    kind = message.kind(),
                    job_id = message.job_id().unwrap_or(""),
                    error = %e,
                    "Failed to publish outbound message"
                );
                false
            }
        }
    }

    pub fn for_job(self: &Arc<Self>, job_id: impl Into<String>) -> JobEmitter {
        JobEmitter {
            emitter: Arc::clone(self),
            job_id: job_id.into(),
            terminal_sent: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Per-job reporting handle given to handlers.
///
/// Clones share the terminal flag, so at most one result is ever sent for
/// the job no matter which clone sends it.
#[derive(Debug, Clone)]
pub struct JobEmitter {
    emitter: Arc<Emitter>,
    job_id: String,
    terminal_sent: Arc<AtomicBool>,
}

impl JobEmitter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn send_status(&self, status: &str, message: impl Into<String>) -> bool {
        let record = OutboundMessage::Status(StatusMessage {
            job_id: self.job_id.clone(),
            server_id: self.emitter.server_id.clone(),
            status: status.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        });
        self.emitter.emit(&record).await
    }

    pub async fn send_log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        let record = OutboundMessage::Log(LogMessage {
            job_id: self.job_id.clone(),
            server_id: self.emitter.server_id.clone(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        });
        self.emitter.emit(&record).await
    }

    /// Report the terminal outcome; ignored if one was already sent
    pub async fn send_result(&self, outcome: &Outcome) -> bool {
        let error_code = (!outcome.success).then_some(ErrorCode::HandlerFatalFailure);
        self.send_terminal(ResultMessage {
            job_id: self.job_id.clone(),
            server_id: self.emitter.server_id.clone(),
            success: outcome.success,
            message: if outcome.success {
                outcome.message.clone()
            } else {
                sanitize_error_message(&outcome.message)
            },
            details: outcome.details.clone(),
            error_code,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Report a terminal failure derived from `error`
    pub async fn send_failure(&self, error: &AgentError) -> bool {
        self.send_terminal(error.to_result_message(&self.job_id, &self.emitter.server_id))
            .await
    }

    async fn send_terminal(&self, result: ResultMessage) -> bool {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            warn!(job_id = %self.job_id, "Terminal result already sent; ignoring another");
            return false;
        }
        self.emitter.emit(&OutboundMessage::Result(result)).await
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }
}
