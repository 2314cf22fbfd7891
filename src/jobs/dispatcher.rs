//! Inbound job pipeline shared by both transports
//!
//! normalize → in-flight dedupe → route → resource lock → handler task →
//! release lock → exactly one terminal result. The returned report tells the
//! transport how to settle the delivery; the dispatcher itself never acks.
//!
//! A redelivery that arrives while the same job id is still executing waits
//! for that execution and reports its verdict without running the handler or
//! emitting anything. The original delivery may belong to a channel that is
//! already gone, so the redelivery is the one that gets settled.

use super::guard::ConcurrencyGuard;
use super::handler::{HandlerError, Outcome};
use super::job::Job;
use super::normalizer::{extract_job_id, JobNormalizer};
use super::router::CommandRouter;
use super::JobError;
use crate::emitter::{Emitter, JobEmitter};
use crate::error::AgentError;
use crate::observability::metrics;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn, Instrument};

/// How a dispatched payload ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Handler reported success
    Completed,
    /// Handler failed; `retryable` only for transient handler errors
    Failed { retryable: bool },
    /// Refused before any handler ran
    Rejected(JobError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub job_id: Option<String>,
    pub action: Option<String>,
    pub verdict: Verdict,
    /// Verdict was taken from an execution started by an earlier delivery
    pub duplicate: bool,
}

impl DispatchReport {
    fn new(job_id: Option<String>, action: Option<String>, verdict: Verdict) -> Self {
        Self {
            job_id,
            action,
            verdict,
            duplicate: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.verdict, Verdict::Failed { retryable: true })
    }
}

type VerdictWatch = watch::Receiver<Option<Verdict>>;

#[derive(Debug, Default)]
struct InFlight {
    ids: Mutex<HashMap<String, VerdictWatch>>,
    idle: Notify,
}

impl InFlight {
    fn ids(&self) -> MutexGuard<'_, HashMap<String, VerdictWatch>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a job id as executing until dropped; waiters see the verdict
/// published by [`InFlightClaim::finish`].
struct InFlightClaim {
    set: Arc<InFlight>,
    id: String,
    verdict_tx: watch::Sender<Option<Verdict>>,
}

impl InFlightClaim {
    fn finish(self, verdict: &Verdict) {
        self.verdict_tx.send_replace(Some(verdict.clone()));
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut ids = self.set.ids();
        ids.remove(&self.id);
        if ids.is_empty() {
            self.set.idle.notify_waiters();
        }
    }
}

enum Claim {
    Acquired(InFlightClaim),
    Running(VerdictWatch),
}

/// Verdict of the execution a duplicate delivery waited on.
///
/// An execution that vanished without a verdict (its dispatch future was
/// dropped) never finished the job, so the duplicate is treated as retryable.
async fn running_verdict(mut running: VerdictWatch) -> Verdict {
    match running.wait_for(Option::is_some).await {
        Ok(verdict) => (*verdict).clone().unwrap_or(Verdict::Failed { retryable: true }),
        Err(_) => Verdict::Failed { retryable: true },
    }
}

pub struct Dispatcher {
    normalizer: JobNormalizer,
    router: Arc<CommandRouter>,
    guard: Arc<ConcurrencyGuard>,
    emitter: Arc<Emitter>,
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    pub fn new(
        normalizer: JobNormalizer,
        router: Arc<CommandRouter>,
        guard: Arc<ConcurrencyGuard>,
        emitter: Arc<Emitter>,
    ) -> Self {
        Self {
            normalizer,
            router,
            guard,
            emitter,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn server_id(&self) -> &str {
        self.normalizer.server_id()
    }

    /// Action types this agent can execute
    pub fn capabilities(&self) -> Vec<String> {
        self.router.actions()
    }

    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn is_in_flight(&self, job_id: &str) -> bool {
        self.in_flight.ids().contains_key(job_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.ids().len()
    }

    /// Wait until no job is executing; false if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight.ids().is_empty() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return self.in_flight.ids().is_empty();
            }
        }
    }

    fn claim(&self, job_id: &str) -> Claim {
        let mut ids = self.in_flight.ids();
        if let Some(running) = ids.get(job_id) {
            return Claim::Running(running.clone());
        }
        let (verdict_tx, verdict_rx) = watch::channel(None);
        ids.insert(job_id.to_string(), verdict_rx);
        Claim::Acquired(InFlightClaim {
            set: Arc::clone(&self.in_flight),
            id: job_id.to_string(),
            verdict_tx,
        })
    }

    async fn reject(
        &self,
        job_id: Option<String>,
        action: Option<String>,
        error: JobError,
    ) -> DispatchReport {
        metrics().job_rejected();
        warn!(
            job_id = job_id.as_deref().unwrap_or(""),
            error_code = %error.error_code(),
            error = %error,
            "Job rejected"
        );
        if let Some(id) = &job_id {
            self.emitter
                .for_job(id.clone())
                .send_failure(&AgentError::from(error.clone()))
                .await;
        }
        DispatchReport::new(job_id, action, Verdict::Rejected(error))
    }

    /// Run one inbound payload through the pipeline
    pub async fn dispatch(&self, raw: &Value) -> DispatchReport {
        metrics().job_received();

        let job = match self.normalizer.normalize(raw) {
            Ok(job) => job,
            Err(e) => return self.reject(extract_job_id(raw), None, e).await,
        };
        let job_id = Some(job.id.clone());
        let action = Some(job.action_type.clone());

        let claim = match self.claim(&job.id) {
            Claim::Acquired(claim) => claim,
            Claim::Running(running) => {
                metrics().job_duplicate();
                info!(job_id = %job.id, "Job already executing; waiting for its verdict");
                let verdict = running_verdict(running).await;
                debug!(job_id = %job.id, verdict = ?verdict, "Duplicate delivery settled");
                return DispatchReport {
                    duplicate: true,
                    ..DispatchReport::new(job_id, action, verdict)
                };
            }
        };

        let report = self.execute(job, job_id, action).await;
        claim.finish(&report.verdict);
        report
    }

    async fn execute(
        &self,
        job: Job,
        job_id: Option<String>,
        action: Option<String>,
    ) -> DispatchReport {
        let route = match self.router.resolve(&job) {
            Ok(route) => route,
            Err(e) => return self.reject(job_id, action, e).await,
        };

        let lease = match &route.resource_key {
            Some(key) => match self.guard.acquire_lease(key) {
                Some(lease) => Some(lease),
                None => {
                    let busy = JobError::ResourceBusy(key.clone());
                    return self.reject(job_id, action, busy).await;
                }
            },
            None => None,
        };

        let span = crate::job_span!(
            job_id = %job.id,
            action = %job.action_type,
            resource_key = route.resource_key.as_deref().unwrap_or("")
        );
        let job_emitter = self.emitter.for_job(job.id.clone());
        job_emitter
            .send_status("running", format!("Started {}", job.action_type))
            .await;

        metrics().job_started();
        let started = Instant::now();
        let handler = Arc::clone(&route.handler);
        let task_job = job.clone();
        let task_emitter = job_emitter.clone();
        let handle = tokio::spawn(
            async move { handler.execute(&task_job, &task_emitter).await }.instrument(span),
        );

        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                let reason = panic_message(join_error);
                error!(job_id = %job.id, panic = %reason, "Job handler crashed");
                Err(HandlerError::fatal(format!("Handler crashed: {reason}")))
            }
        };

        // Free the resource before reporting so a follow-up job is never refused
        drop(lease);

        let elapsed = started.elapsed();
        let verdict = match &result {
            Ok(outcome) if outcome.success => {
                metrics().job_completed(&job.action_type, elapsed);
                Verdict::Completed
            }
            Ok(_) => {
                metrics().job_failed(&job.action_type, elapsed);
                Verdict::Failed { retryable: false }
            }
            Err(e) => {
                metrics().job_failed(&job.action_type, elapsed);
                Verdict::Failed {
                    retryable: e.is_transient(),
                }
            }
        };

        report_terminal(&job_emitter, &result).await;
        debug!(
            job_id = %job.id,
            elapsed_ms = elapsed.as_millis() as u64,
            verdict = ?verdict,
            "Job finished"
        );

        DispatchReport::new(job_id, action, verdict)
    }
}

async fn report_terminal(emitter: &JobEmitter, result: &Result<Outcome, HandlerError>) {
    if emitter.terminal_sent() {
        return;
    }
    match result {
        Ok(outcome) => {
            emitter.send_result(outcome).await;
        }
        Err(e) => {
            emitter.send_failure(&AgentError::from(e.clone())).await;
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if !join_error.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
