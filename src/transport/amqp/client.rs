//! Durable queue transport over AMQP 0-9-1
//!
//! `start` makes the first connection inline so the selector learns right
//! away whether the broker is reachable. After that a supervisor task owns
//! the [`TransportConnection`]: it runs the consume/heartbeat session,
//! schedules reconnects with backoff when the session drops, and gives up
//! with `PermanentlyDisconnected` after the configured attempts.

use super::delivery::{header_delivery_count, process_delivery, InboundDelivery, RetryLedger};
use super::topology::Topology;
use crate::config::QueueSection;
use crate::emitter::OutboundSink;
use crate::error::sanitize_error_message;
use crate::jobs::Dispatcher;
use crate::observability::metrics;
use crate::protocol::messages::{AgentPresence, OutboundMessage};
use crate::transport::{
    heartbeat_message, interruptible_sleep, BackoffPolicy, ConnectionState, ReconnectionDecision,
    Transport, TransportConnection, TransportError, TransportKind,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const PERSISTENT: u8 = 2;

/// Per-agent settings shared by the supervisor and delivery tasks
#[derive(Debug)]
struct QueueSettings {
    server_id: String,
    topology: Topology,
    prefetch: u16,
    heartbeat_interval: Duration,
    max_redeliveries: u32,
}

/// Publishing side of the transport; holds the live channel, if any
pub struct AmqpPublisher {
    settings: Arc<QueueSettings>,
    channel: RwLock<Option<Channel>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl AmqpPublisher {
    fn set_channel(&self, channel: Option<Channel>) {
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = channel;
    }

    fn current_channel(&self) -> Option<Channel> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_ready(&self) -> bool {
        self.current_channel().is_some()
    }
}

#[async_trait]
impl OutboundSink for AmqpPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let channel = self
            .current_channel()
            .ok_or_else(|| TransportError::NotConnected {
                state: self.state_rx.borrow().clone(),
            })?;

        let target = self.settings.topology.target_for(message);
        let payload = message.to_json()?;

        let mut headers = FieldTable::default();
        headers.insert(
            "serverId".into(),
            AMQPValue::LongString(self.settings.server_id.clone().into()),
        );
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into())
            .with_message_id(uuid::Uuid::new_v4().to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64)
            .with_headers(headers);

        let confirmation = channel
            .basic_publish(
                target.exchange,
                target.routing_key,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                properties,
            )
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(TransportError::PublishFailed(format!(
                "broker refused {} message",
                message.kind()
            )));
        }
        Ok(())
    }
}

/// One live broker connection with its consumer
struct Session {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

impl Session {
    async fn open(url: &str, settings: &QueueSettings) -> Result<Self, TransportError> {
        tokio::time::timeout(CONNECT_TIMEOUT, Self::open_inner(url, settings))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::ConnectionFailed(format!(
                    "broker did not answer within {}s",
                    CONNECT_TIMEOUT.as_secs()
                )))
            })
    }

    async fn open_inner(url: &str, settings: &QueueSettings) -> Result<Self, TransportError> {
        let connection = Connection::connect(url, connection_properties())
            .await
            .map_err(connection_error)?;
        let channel = connection
            .create_channel()
            .await
            .map_err(connection_error)?;
        channel
            .basic_qos(settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(connection_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(connection_error)?;

        settings.topology.declare(&channel).await?;

        let consumer = channel
            .basic_consume(
                &settings.topology.command_queue,
                &format!("hostlink-{}", settings.server_id),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(connection_error)?;

        info!(
            transport = "queue",
            queue = %settings.topology.command_queue,
            prefetch = settings.prefetch,
            "Consuming commands"
        );
        Ok(Self {
            connection,
            channel,
            consumer,
        })
    }
}

/// Run lapin's I/O and internal tasks on the current tokio runtime
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

fn connection_error(e: lapin::Error) -> TransportError {
    TransportError::ConnectionFailed(sanitize_error_message(&e.to_string()))
}

/// Primary job transport
pub struct AmqpTransport {
    url: String,
    settings: Arc<QueueSettings>,
    connection: Option<TransportConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    publisher: Arc<AmqpPublisher>,
    ledger: Arc<RetryLedger>,
    dispatcher: Option<Arc<Dispatcher>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
}

impl AmqpTransport {
    pub fn new(
        server_id: &str,
        url: impl Into<String>,
        section: &QueueSection,
        policy: BackoffPolicy,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        validate_broker_url(&url)?;

        let settings = Arc::new(QueueSettings {
            server_id: server_id.to_string(),
            topology: Topology::new(server_id, section),
            prefetch: section.prefetch,
            heartbeat_interval: Duration::from_secs(section.heartbeat_interval_secs),
            max_redeliveries: section.max_redeliveries,
        });
        let connection = TransportConnection::new(TransportKind::Queue, policy);
        let state_rx = connection.subscribe();
        let publisher = Arc::new(AmqpPublisher {
            settings: Arc::clone(&settings),
            channel: RwLock::new(None),
            state_rx: state_rx.clone(),
        });

        Ok(Self {
            url,
            settings,
            connection: Some(connection),
            state_rx,
            publisher,
            ledger: Arc::new(RetryLedger::new()),
            dispatcher: None,
            shutdown_tx: None,
            supervisor: None,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.settings.topology
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Queue
    }

    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), TransportError> {
        let mut connection = self
            .connection
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        connection.connecting();
        metrics().connection_attempt();
        let session = match Session::open(&self.url, &self.settings).await {
            Ok(session) => session,
            Err(e) => {
                metrics().connection_failed();
                connection.closed(e.to_string());
                return Err(e);
            }
        };
        connection.connected();
        metrics().connection_established();
        self.publisher.set_channel(Some(session.channel.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            url: self.url.clone(),
            settings: Arc::clone(&self.settings),
            publisher: Arc::clone(&self.publisher),
            ledger: Arc::clone(&self.ledger),
            dispatcher: Arc::clone(&dispatcher),
        };
        let span = crate::transport_span!(transport = "queue", server_id = %self.settings.server_id);
        let handle = tokio::spawn(supervisor.run(connection, session, shutdown_rx).instrument(span));

        self.dispatcher = Some(dispatcher);
        self.shutdown_tx = Some(shutdown_tx);
        self.supervisor = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self, reason: &str) {
        if let Some(dispatcher) = &self.dispatcher {
            if self.publisher.is_ready() {
                let farewell =
                    heartbeat_message(dispatcher, TransportKind::Queue, AgentPresence::Offline);
                match self.publisher.publish(&farewell).await {
                    Ok(()) => metrics().heartbeat_sent(),
                    Err(e) => warn!(error = %e, "Failed to publish offline heartbeat"),
                }
            }
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if let Some(mut handle) = self.supervisor.take() {
            match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
                Ok(Ok(())) => debug!("Queue supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "Queue supervisor ended with error");
                }
                Err(_) => {
                    warn!("Queue supervisor didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
                _ => {}
            }
        }
        self.publisher.set_channel(None);
        info!(transport = "queue", reason = %reason, "Queue transport stopped");
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn sink(&self) -> Arc<dyn OutboundSink> {
        self.publisher.clone()
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// State moved into the supervisor task
struct Supervisor {
    url: String,
    settings: Arc<QueueSettings>,
    publisher: Arc<AmqpPublisher>,
    ledger: Arc<RetryLedger>,
    dispatcher: Arc<Dispatcher>,
}

impl Supervisor {
    async fn run(
        self,
        mut connection: TransportConnection,
        first: Session,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut session = Some(first);
        loop {
            if let Some(active) = session.take() {
                match self.run_session(active, &mut shutdown_rx).await {
                    SessionEnd::Shutdown => {
                        connection.closed("shutdown requested");
                        break;
                    }
                    SessionEnd::Lost(reason) => {
                        self.publisher.set_channel(None);
                        metrics().connection_lost();
                        connection.disconnected(reason);
                    }
                }
            }

            let shutdown_requested = *shutdown_rx.borrow();
            match connection.next_attempt(shutdown_requested) {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling broker reconnection"
                    );
                    if !interruptible_sleep(shutdown_rx.clone(), delay).await {
                        connection.closed("shutdown requested");
                        break;
                    }
                    metrics().connection_attempt();
                    match Session::open(&self.url, &self.settings).await {
                        Ok(reopened) => {
                            connection.connected();
                            metrics().connection_established();
                            self.publisher.set_channel(Some(reopened.channel.clone()));
                            session = Some(reopened);
                        }
                        Err(e) => {
                            metrics().connection_failed();
                            warn!(attempt, error = %e, "Broker reconnection failed");
                            connection.disconnected(e.to_string());
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!("Queue transport giving up after repeated connection failures");
                    break;
                }
            }
        }
        self.publisher.set_channel(None);
    }

    async fn run_session(
        &self,
        session: Session,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let Session {
            connection,
            channel: _channel,
            mut consumer,
        } = session;

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                _ = heartbeat.tick() => {
                    self.publish_heartbeat().await;
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.spawn_delivery(delivery),
                    Some(Err(e)) => break SessionEnd::Lost(sanitize_error_message(&e.to_string())),
                    None => break SessionEnd::Lost("consumer stream closed".to_string()),
                },
            }
        };

        if matches!(end, SessionEnd::Shutdown) {
            if let Err(e) = connection.close(200, "agent shutdown").await {
                debug!(error = %e, "Broker connection close failed");
            }
        }
        end
    }

    async fn publish_heartbeat(&self) {
        let message = heartbeat_message(&self.dispatcher, TransportKind::Queue, AgentPresence::Online);
        match self.publisher.publish(&message).await {
            Ok(()) => metrics().heartbeat_sent(),
            Err(e) => warn!(error = %e, "Heartbeat publish failed"),
        }
    }

    fn spawn_delivery(&self, delivery: Delivery) {
        metrics().message_received();
        let dispatcher = Arc::clone(&self.dispatcher);
        let ledger = Arc::clone(&self.ledger);
        let max_redeliveries = self.settings.max_redeliveries;
        tokio::spawn(
            async move { handle_delivery(delivery, &dispatcher, &ledger, max_redeliveries).await }
                .in_current_span(),
        );
    }
}

/// Dispatch one delivery and settle it with the broker
async fn handle_delivery(
    delivery: Delivery,
    dispatcher: &Dispatcher,
    ledger: &RetryLedger,
    max_redeliveries: u32,
) {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let inbound = InboundDelivery {
        body: &delivery.data,
        message_id: message_id.as_deref(),
        delivery_count: header_delivery_count(&delivery.properties),
    };
    let disposition =
        process_delivery(inbound, &delivery.acker, dispatcher, ledger, max_redeliveries).await;
    debug!(
        delivery_tag = delivery.delivery_tag,
        disposition = ?disposition,
        "Delivery settled"
    );
}

/// Broker URLs must be `amqp://` or `amqps://` with a host
pub fn validate_broker_url(raw: &str) -> Result<(), TransportError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| TransportError::InvalidUrl(format!("broker URL: {e}")))?;
    if !matches!(parsed.scheme(), "amqp" | "amqps") {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported broker scheme '{}'",
            parsed.scheme()
        )));
    }
    if !parsed.has_host() {
        return Err(TransportError::InvalidUrl("broker URL has no host".to_string()));
    }
    Ok(())
}
