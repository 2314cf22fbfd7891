//! Mock implementations for testing
//!
//! Provides a recording outbound sink, scripted job handlers, and mock
//! transports with a controllable factory so dispatcher and selector
//! scenarios run without a broker or a socket server.

use crate::emitter::{Emitter, JobEmitter, OutboundSink};
use crate::jobs::{
    CommandRouter, ConcurrencyGuard, Dispatcher, HandlerError, Job, JobHandler, JobNormalizer,
    Outcome,
};
use crate::protocol::messages::{LogLevel, OutboundMessage, ResultMessage};
use crate::transport::{
    ConnectionState, Transport, TransportError, TransportFactory, TransportKind, TransportPlan,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outbound sink that records everything it is asked to publish
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<OutboundMessage>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every publish fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        lock(&self.messages).clone()
    }

    pub fn results(&self) -> Vec<ResultMessage> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::Result(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Results for one job, in emission order
    pub fn results_for(&self, job_id: &str) -> Vec<ResultMessage> {
        self.results()
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.messages).clear();
    }
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::PublishFailed("mock sink failure".to_string()));
        }
        lock(&self.messages).push(message.clone());
        Ok(())
    }
}

/// What a [`ScriptedHandler`] does when executed
#[derive(Debug, Clone)]
pub enum Script {
    /// Return a successful outcome
    Succeed(String),
    /// Return a handler error
    Fail(HandlerError),
    /// Return an unsuccessful outcome
    FailOutcome(String),
    /// Send the terminal result itself, then return success
    ReportThenSucceed(String),
    /// Log a line, then panic with the message
    Panic(String),
    /// Wait for the notify, then succeed
    BlockUntil(Arc<Notify>),
    /// Wait for the notify, then return the error
    BlockThenFail(Arc<Notify>, HandlerError),
}

/// Handler that follows a script and counts its invocations.
///
/// With several scripts queued, each call consumes one; the last one repeats.
#[derive(Debug)]
pub struct ScriptedHandler {
    scripts: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(script: Script) -> Self {
        Self::sequence(vec![script])
    }

    pub fn sequence(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Script {
        let mut scripts = lock(&self.scripts);
        if scripts.len() > 1 {
            if let Some(script) = scripts.pop_front() {
                return script;
            }
        }
        scripts
            .front()
            .cloned()
            .unwrap_or_else(|| Script::Succeed("ok".to_string()))
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn execute(&self, job: &Job, emitter: &JobEmitter) -> Result<Outcome, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_script() {
            Script::Succeed(message) => Ok(Outcome::success(message)),
            Script::Fail(error) => Err(error),
            Script::FailOutcome(message) => Ok(Outcome::failure(message)),
            Script::ReportThenSucceed(message) => {
                emitter.send_result(&Outcome::success(message)).await;
                Ok(Outcome::success("ignored"))
            }
            Script::Panic(message) => {
                emitter
                    .send_log(LogLevel::Info, format!("{} starting", job.action_type))
                    .await;
                panic!("{message}");
            }
            Script::BlockUntil(release) => {
                release.notified().await;
                Ok(Outcome::success("released"))
            }
            Script::BlockThenFail(release, error) => {
                release.notified().await;
                Err(error)
            }
        }
    }
}

/// Dispatcher wired to a fresh emitter with a recording sink attached
pub fn recording_dispatcher(
    server_id: &str,
    router: CommandRouter,
) -> (Arc<Dispatcher>, Arc<RecordingSink>, Arc<ConcurrencyGuard>) {
    let guard = Arc::new(ConcurrencyGuard::new());
    let emitter = Arc::new(Emitter::new(server_id));
    let sink = Arc::new(RecordingSink::new());
    emitter.attach(TransportKind::Queue, sink.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        JobNormalizer::new(server_id),
        Arc::new(router),
        Arc::clone(&guard),
        emitter,
    ));
    (dispatcher, sink, guard)
}

/// How the mock factory treats one transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// No endpoint in the plan
    Unavailable,
    /// Created, but `start` fails
    FailStart,
    /// Created and starts
    Succeed,
}

/// Test-side handle on one mock transport instance
#[derive(Debug)]
pub struct MockControl {
    pub kind: TransportKind,
    pub sink: Arc<RecordingSink>,
    state_tx: watch::Sender<ConnectionState>,
    started: AtomicBool,
    shutdown_reasons: Mutex<Vec<String>>,
}

impl MockControl {
    fn new(kind: TransportKind) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("not started".to_string()));
        Self {
            kind,
            sink: Arc::new(RecordingSink::new()),
            state_tx,
            started: AtomicBool::new(false),
            shutdown_reasons: Mutex::new(Vec::new()),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Simulate the supervisor giving up on reconnection
    pub fn lose_permanently(&self, reason: &str) {
        self.state_tx
            .send_replace(ConnectionState::PermanentlyDisconnected(reason.to_string()));
    }

    pub fn shutdown_reasons(&self) -> Vec<String> {
        lock(&self.shutdown_reasons).clone()
    }
}

pub struct MockTransport {
    control: Arc<MockControl>,
    fail_start: bool,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.control.kind
    }

    async fn start(&mut self, _dispatcher: Arc<Dispatcher>) -> Result<(), TransportError> {
        if self.fail_start {
            self.control
                .state_tx
                .send_replace(ConnectionState::PermanentlyDisconnected(
                    "mock start failure".to_string(),
                ));
            return Err(TransportError::ConnectionFailed(format!(
                "mock {} unreachable",
                self.control.kind
            )));
        }
        self.control.started.store(true, Ordering::SeqCst);
        self.control.state_tx.send_replace(ConnectionState::Connected);
        Ok(())
    }

    async fn shutdown(&mut self, reason: &str) {
        lock(&self.control.shutdown_reasons).push(reason.to_string());
        self.control
            .state_tx
            .send_replace(ConnectionState::PermanentlyDisconnected(reason.to_string()));
    }

    fn connection_state(&self) -> ConnectionState {
        self.control.state()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.control.state_tx.subscribe()
    }

    fn sink(&self) -> Arc<dyn OutboundSink> {
        self.control.sink.clone()
    }
}

/// Factory whose per-kind behavior tests can change between rounds
#[derive(Debug)]
pub struct MockTransportFactory {
    behaviors: Mutex<[(TransportKind, MockBehavior); 2]>,
    created: Mutex<Vec<Arc<MockControl>>>,
    plans: AtomicUsize,
}

impl MockTransportFactory {
    pub fn new(queue: MockBehavior, duplex: MockBehavior) -> Self {
        Self {
            behaviors: Mutex::new([
                (TransportKind::Queue, queue),
                (TransportKind::Duplex, duplex),
            ]),
            created: Mutex::new(Vec::new()),
            plans: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, kind: TransportKind, behavior: MockBehavior) {
        for entry in lock(&self.behaviors).iter_mut() {
            if entry.0 == kind {
                entry.1 = behavior;
            }
        }
    }

    fn behavior(&self, kind: TransportKind) -> MockBehavior {
        lock(&self.behaviors)
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(MockBehavior::Unavailable, |(_, b)| *b)
    }

    /// Selection rounds run so far
    pub fn plans(&self) -> usize {
        self.plans.load(Ordering::SeqCst)
    }

    /// Every transport created, oldest first
    pub fn created(&self) -> Vec<Arc<MockControl>> {
        lock(&self.created).clone()
    }

    pub fn last_created(&self, kind: TransportKind) -> Option<Arc<MockControl>> {
        lock(&self.created)
            .iter()
            .rev()
            .find(|c| c.kind == kind)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn plan(&self) -> TransportPlan {
        self.plans.fetch_add(1, Ordering::SeqCst);
        TransportPlan::default()
    }

    fn create(
        &self,
        kind: TransportKind,
        _plan: &TransportPlan,
    ) -> Result<Option<Box<dyn Transport>>, TransportError> {
        let behavior = self.behavior(kind);
        if behavior == MockBehavior::Unavailable {
            return Ok(None);
        }
        let control = Arc::new(MockControl::new(kind));
        lock(&self.created).push(Arc::clone(&control));
        Ok(Some(Box::new(MockTransport {
            control,
            fail_start: behavior == MockBehavior::FailStart,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{HeartbeatMessage, HeartbeatMetrics};
    use chrono::Utc;

    fn heartbeat() -> OutboundMessage {
        OutboundMessage::Heartbeat(HeartbeatMessage {
            server_id: "srv".to_string(),
            status: crate::protocol::messages::AgentPresence::Online,
            metrics: HeartbeatMetrics::default(),
            agent_version: "test".to_string(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.publish(&heartbeat()).await.unwrap();
        assert_eq!(sink.messages().len(), 1);
        assert!(sink.results().is_empty());

        let failing = RecordingSink::failing();
        assert!(failing.publish(&heartbeat()).await.is_err());
        assert!(failing.messages().is_empty());
    }

    #[tokio::test]
    async fn test_mock_factory_behaviors() {
        let factory = MockTransportFactory::new(MockBehavior::FailStart, MockBehavior::Unavailable);
        let plan = factory.plan().await;
        assert!(factory.create(TransportKind::Duplex, &plan).unwrap().is_none());

        let (dispatcher, _, _) = recording_dispatcher("srv", CommandRouter::new());
        let mut queue = factory.create(TransportKind::Queue, &plan).unwrap().unwrap();
        assert!(queue.start(dispatcher).await.is_err());
        assert!(queue.connection_state().is_permanent());
        assert_eq!(factory.created().len(), 1);
    }

    #[test]
    fn test_sequence_repeats_last_script() {
        let handler = ScriptedHandler::sequence(vec![
            Script::Fail(HandlerError::transient("first")),
            Script::Succeed("second".to_string()),
        ]);
        assert!(matches!(handler.next_script(), Script::Fail(_)));
        assert!(matches!(handler.next_script(), Script::Succeed(_)));
        assert!(matches!(handler.next_script(), Script::Succeed(_)));
    }
}
