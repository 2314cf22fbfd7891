//! Transport layer: the durable queue (primary) and duplex socket (fallback)
//!
//! Both transports hand inbound payloads to the shared [`Dispatcher`] and
//! expose an [`OutboundSink`] that the emitter forwards to while they are
//! active. Connection state lives in each transport's own
//! [`TransportConnection`]; nothing outside the transport mutates it.

pub mod amqp;
pub mod backoff;
pub mod connection;
pub mod duplex;
pub mod selector;

use crate::emitter::OutboundSink;
use crate::jobs::Dispatcher;
use crate::observability::metrics;
use crate::protocol::messages::{
    AgentPresence, HeartbeatMessage, HeartbeatMetrics, OutboundMessage,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;

pub use amqp::AmqpTransport;
pub use backoff::{backoff_delay, BackoffPolicy};
pub use connection::{
    interruptible_sleep, should_attempt_reconnection, ConnectionState, ReconnectionDecision,
    TransportConnection, TransportError,
};
pub use duplex::DuplexTransport;
pub use selector::{
    resolve_queue_secret, Activation, DefaultTransportFactory, SecretSource, TransportFactory,
    TransportPlan, TransportSelector,
};

/// Which channel a transport is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Queue,
    Duplex,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Queue => "queue",
            TransportKind::Duplex => "duplex",
        }
    }

    /// The transport tried when this one fails
    pub fn other(&self) -> TransportKind {
        match self {
            TransportKind::Queue => TransportKind::Duplex,
            TransportKind::Duplex => TransportKind::Queue,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job-carrying channel to the control plane
///
/// Implementations own their connection and reconnection supervisor. The
/// supervisor reports `PermanentlyDisconnected` once it gives up; the
/// selector watches for that through [`Transport::state_watch`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Connect, start consuming into `dispatcher`, and return once the first
    /// connection is confirmed (or has definitively failed)
    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), TransportError>;

    /// Flush the farewell message, stop the supervisor and close the connection
    async fn shutdown(&mut self, reason: &str);

    fn connection_state(&self) -> ConnectionState;

    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    /// Publishing handle for the emitter
    fn sink(&self) -> Arc<dyn OutboundSink>;
}

/// Liveness record for the transport `kind`, with a coarse metrics snapshot
pub fn heartbeat_message(
    dispatcher: &Dispatcher,
    kind: TransportKind,
    presence: AgentPresence,
) -> OutboundMessage {
    let collector = metrics();
    OutboundMessage::Heartbeat(HeartbeatMessage {
        server_id: dispatcher.server_id().to_string(),
        status: presence,
        metrics: HeartbeatMetrics {
            uptime_secs: collector.uptime().as_secs(),
            jobs_in_flight: dispatcher.in_flight_count() as u64,
            jobs_completed: collector.jobs_completed(),
            jobs_failed: collector.jobs_failed(),
            locks_held: dispatcher.guard().held_count() as u64,
            cpu_count: std::thread::available_parallelism().map_or(1, |n| n.get() as u64),
            load_average: HeartbeatMetrics::sample_load_average(),
            active_transport: Some(kind.to_string()),
        },
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_and_failover_partner() {
        assert_eq!(TransportKind::Queue.to_string(), "queue");
        assert_eq!(TransportKind::Duplex.as_str(), "duplex");
        assert_eq!(TransportKind::Queue.other(), TransportKind::Duplex);
        assert_eq!(TransportKind::Duplex.other(), TransportKind::Queue);
    }
}
