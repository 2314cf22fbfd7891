//! Connection state, reconnection decisions and transport errors
//!
//! Each transport owns exactly one [`TransportConnection`]. It tracks the
//! state machine, the consecutive failed attempt counter and the current
//! backoff delay, and publishes every state change on a watch channel.

use super::backoff::BackoffPolicy;
use super::TransportKind;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Connection state for a transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Gave up after the maximum number of attempts, or shut down
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ConnectionState::PermanentlyDisconnected(_))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Settling delivery failed: {0}")]
    SettleFailed(String),
    #[error("Topology declaration failed: {0}")]
    TopologyFailed(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Transport already started")]
    AlreadyStarted,
    #[error("No transport available")]
    Unavailable,
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Determine if reconnection should be attempted (pure; delay without jitter)
pub fn should_attempt_reconnection(
    current_attempts: u32,
    policy: &BackoffPolicy,
    shutdown_requested: bool,
) -> ReconnectionDecision {
    if shutdown_requested {
        return ReconnectionDecision::AbortShutdownRequested;
    }

    if let Some(max_attempts) = policy.max_attempts {
        if current_attempts >= max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }
    }

    let attempt = current_attempts + 1;
    ReconnectionDecision::Proceed {
        attempt,
        delay: policy.delay_for(attempt),
    }
}

/// Per-transport connection bookkeeping
#[derive(Debug)]
pub struct TransportConnection {
    kind: TransportKind,
    policy: BackoffPolicy,
    reconnect_attempt: u32,
    backoff_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
}

impl TransportConnection {
    pub fn new(kind: TransportKind, policy: BackoffPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("not started".to_string()));
        let backoff_delay = policy.base;
        Self {
            kind,
            policy,
            reconnect_attempt: 0,
            backoff_delay,
            state_tx,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn backoff_delay(&self) -> Duration {
        self.backoff_delay
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        log_state_transition(self.kind, &previous, &next);
    }

    pub fn connecting(&self) {
        self.transition(ConnectionState::Connecting);
    }

    /// Successful (re)connect: counters go back to the base
    pub fn connected(&mut self) {
        self.reconnect_attempt = 0;
        self.backoff_delay = self.policy.base;
        self.transition(ConnectionState::Connected);
    }

    pub fn disconnected(&self, reason: impl Into<String>) {
        self.transition(ConnectionState::Disconnected(reason.into()));
    }

    /// Mark the connection finished for good
    pub fn closed(&self, reason: impl Into<String>) {
        self.transition(ConnectionState::PermanentlyDisconnected(reason.into()));
    }

    /// Decide on the next reconnect attempt and move the state machine accordingly
    pub fn next_attempt(&mut self, shutdown_requested: bool) -> ReconnectionDecision {
        match should_attempt_reconnection(self.reconnect_attempt, &self.policy, shutdown_requested)
        {
            ReconnectionDecision::Proceed { attempt, .. } => {
                self.reconnect_attempt = attempt;
                self.backoff_delay = self.policy.jittered_delay_for(attempt);
                self.transition(ConnectionState::Reconnecting(attempt));
                ReconnectionDecision::Proceed {
                    attempt,
                    delay: self.backoff_delay,
                }
            }
            ReconnectionDecision::AbortShutdownRequested => {
                self.closed("shutdown requested");
                ReconnectionDecision::AbortShutdownRequested
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                self.closed(format!(
                    "max reconnection attempts ({}) exceeded",
                    self.reconnect_attempt
                ));
                ReconnectionDecision::AbortMaxAttemptsExceeded
            }
        }
    }
}

fn log_state_transition(kind: TransportKind, from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
            info!(transport = %kind, attempt, "Reconnection successful");
        }
        (_, ConnectionState::Connected) => {
            info!(transport = %kind, "Connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
            warn!(transport = %kind, reason = %reason, "Connection lost");
        }
        (_, ConnectionState::Reconnecting(attempt)) => {
            info!(transport = %kind, attempt, "Starting reconnection attempt");
        }
        (_, ConnectionState::PermanentlyDisconnected(reason)) => {
            error!(transport = %kind, reason = %reason, "Connection permanently closed");
        }
        _ => {
            info!(transport = %kind, "Connection state: {:?} -> {:?}", from, to);
        }
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
/// Returns true if the sleep completed.
pub async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(1000),
            max_attempts,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn test_decision_proceeds_with_growing_delay() {
        let p = policy(Some(3));
        assert_eq!(
            should_attempt_reconnection(0, &p, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            should_attempt_reconnection(2, &p, false),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay: Duration::from_millis(400)
            }
        );
        assert_eq!(
            should_attempt_reconnection(3, &p, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_shutdown_wins_over_everything() {
        assert_eq!(
            should_attempt_reconnection(0, &policy(None), true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_unlimited_attempts() {
        assert!(matches!(
            should_attempt_reconnection(10_000, &policy(None), false),
            ReconnectionDecision::Proceed { .. }
        ));
    }

    #[test]
    fn test_success_resets_backoff_to_base() {
        let mut connection = TransportConnection::new(TransportKind::Queue, policy(None));
        for _ in 0..4 {
            connection.next_attempt(false);
        }
        assert_eq!(connection.reconnect_attempt(), 4);
        assert_eq!(connection.backoff_delay(), Duration::from_millis(800));
        assert_eq!(connection.state(), ConnectionState::Reconnecting(4));

        connection.connected();
        assert_eq!(connection.reconnect_attempt(), 0);
        assert_eq!(connection.backoff_delay(), Duration::from_millis(100));
        assert!(connection.state().is_connected());
    }

    #[test]
    fn test_exhausted_attempts_become_permanent() {
        let mut connection = TransportConnection::new(TransportKind::Duplex, policy(Some(2)));
        let rx = connection.subscribe();
        connection.next_attempt(false);
        connection.next_attempt(false);
        assert_eq!(
            connection.next_attempt(false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert!(rx.borrow().is_permanent());
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx, Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });
        assert!(!interruptible_sleep(rx, Duration::from_secs(5)).await);
    }
}
