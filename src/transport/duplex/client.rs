//! Fallback transport over a persistent WebSocket to the control plane
//!
//! Same supervision shape as the queue transport: the first connect happens
//! inside `start`, then a supervisor task runs sessions and reconnects with
//! its own backoff counters. Jobs that arrive over the socket are never
//! requeued; a failed attempt gets its terminal failure result and the
//! control plane decides whether to re-issue.

use super::liveness::LivenessProbe;
use crate::config::DuplexSection;
use crate::emitter::OutboundSink;
use crate::error::sanitize_error_message;
use crate::jobs::Dispatcher;
use crate::observability::metrics;
use crate::protocol::frames::{goodbye_frame, outbound_frame, register_frame, InboundFrame};
use crate::protocol::messages::{AgentPresence, OutboundMessage};
use crate::transport::{
    heartbeat_message, interruptible_sleep, BackoffPolicy, ConnectionState, ReconnectionDecision,
    Transport, TransportConnection, TransportError, TransportKind,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn, Instrument};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug)]
struct DuplexSettings {
    server_id: String,
    url: String,
    access_token: Option<String>,
    ping_interval: Duration,
    ping_timeout: Duration,
}

/// Publishing side: frames are queued to the live session's writer
pub struct DuplexPublisher {
    sender: RwLock<Option<mpsc::Sender<Message>>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl DuplexPublisher {
    fn set_sender(&self, sender: Option<mpsc::Sender<Message>>) {
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn current_sender(&self) -> Option<mpsc::Sender<Message>> {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        let sender = self.current_sender().ok_or_else(|| TransportError::NotConnected {
            state: self.state_rx.borrow().clone(),
        })?;
        sender
            .send(Message::Text(frame))
            .await
            .map_err(|_| TransportError::PublishFailed("socket writer has stopped".to_string()))
    }
}

#[async_trait]
impl OutboundSink for DuplexPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let frame = outbound_frame(message)?;
        self.send_frame(frame.to_string()).await
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

async fn open_socket(
    settings: &DuplexSettings,
    capabilities: &[String],
) -> Result<Socket, TransportError> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    if let Some(token) = &settings.access_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid access token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (mut socket, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| {
            TransportError::ConnectionFailed(format!(
                "socket handshake did not finish within {}s",
                CONNECT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| TransportError::ConnectionFailed(sanitize_error_message(&e.to_string())))?;
    debug!(status = %response.status(), "Socket handshake complete");

    let register = register_frame(&settings.server_id, capabilities);
    socket
        .send(Message::Text(register.to_string()))
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("registration failed: {e}")))?;
    Ok(socket)
}

/// Fallback job transport
pub struct DuplexTransport {
    settings: Arc<DuplexSettings>,
    jobs: Arc<Semaphore>,
    connection: Option<TransportConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    publisher: Arc<DuplexPublisher>,
    shutdown_tx: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
}

impl DuplexTransport {
    pub fn new(
        server_id: &str,
        url: impl Into<String>,
        access_token: Option<String>,
        section: &DuplexSection,
        policy: BackoffPolicy,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        validate_socket_url(&url)?;

        let connection = TransportConnection::new(TransportKind::Duplex, policy);
        let state_rx = connection.subscribe();
        Ok(Self {
            settings: Arc::new(DuplexSettings {
                server_id: server_id.to_string(),
                url,
                access_token,
                ping_interval: Duration::from_secs(section.ping_interval_secs),
                ping_timeout: Duration::from_secs(section.ping_timeout_secs),
            }),
            jobs: Arc::new(Semaphore::new(section.max_concurrent_jobs.max(1))),
            connection: Some(connection),
            publisher: Arc::new(DuplexPublisher {
                sender: RwLock::new(None),
                state_rx: state_rx.clone(),
            }),
            state_rx,
            shutdown_tx: None,
            supervisor: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.settings.url
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), TransportError> {
        let mut connection = self
            .connection
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        connection.connecting();
        metrics().connection_attempt();
        let capabilities = dispatcher.capabilities();
        let socket = match open_socket(&self.settings, &capabilities).await {
            Ok(socket) => socket,
            Err(e) => {
                metrics().connection_failed();
                connection.closed(e.to_string());
                return Err(e);
            }
        };
        connection.connected();
        metrics().connection_established();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            settings: Arc::clone(&self.settings),
            publisher: Arc::clone(&self.publisher),
            jobs: Arc::clone(&self.jobs),
            dispatcher,
            capabilities,
        };
        let span = crate::transport_span!(transport = "duplex", server_id = %self.settings.server_id);
        let handle = tokio::spawn(supervisor.run(connection, socket, shutdown_rx).instrument(span));

        self.shutdown_tx = Some(shutdown_tx);
        self.supervisor = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self, reason: &str) {
        if self.publisher.current_sender().is_some() {
            let goodbye = goodbye_frame(&self.settings.server_id, reason);
            if let Err(e) = self.publisher.send_frame(goodbye.to_string()).await {
                warn!(error = %e, "Failed to queue goodbye frame");
            }
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if let Some(mut handle) = self.supervisor.take() {
            match tokio::time::timeout(Duration::from_secs(2), &mut handle).await {
                Ok(Ok(())) => debug!("Socket supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "Socket supervisor ended with error");
                }
                Err(_) => {
                    warn!("Socket supervisor didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
                _ => {}
            }
        }
        self.publisher.set_sender(None);
        info!(transport = "duplex", reason = %reason, "Socket transport stopped");
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

impl Drop for DuplexTransport {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

struct Supervisor {
    settings: Arc<DuplexSettings>,
    publisher: Arc<DuplexPublisher>,
    jobs: Arc<Semaphore>,
    dispatcher: Arc<Dispatcher>,
    capabilities: Vec<String>,
}

impl Supervisor {
    async fn run(
        self,
        mut connection: TransportConnection,
        first: Socket,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut socket = Some(first);
        loop {
            if let Some(active) = socket.take() {
                match self.run_session(active, &mut shutdown_rx).await {
                    SessionEnd::Shutdown => {
                        connection.closed("shutdown requested");
                        break;
                    }
                    SessionEnd::Lost(reason) => {
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
                        "Scheduling socket reconnection"
                    );
                    if !interruptible_sleep(shutdown_rx.clone(), delay).await {
                        connection.closed("shutdown requested");
                        break;
                    }
                    metrics().connection_attempt();
                    match open_socket(&self.settings, &self.capabilities).await {
                        Ok(reopened) => {
                            connection.connected();
                            metrics().connection_established();
                            socket = Some(reopened);
                        }
                        Err(e) => {
                            metrics().connection_failed();
                            warn!(attempt, error = %e, "Socket reconnection failed");
                            connection.disconnected(e.to_string());
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!("Socket transport giving up after repeated connection failures");
                    break;
                }
            }
        }
        self.publisher.set_sender(None);
    }

    async fn run_session(
        &self,
        socket: Socket,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        self.publisher.set_sender(Some(out_tx));

        let mut probe = LivenessProbe::new(self.settings.ping_timeout);
        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            let deadline = probe.deadline();
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = write.send(frame).await {
                        break SessionEnd::Lost(format!("write failed: {e}"));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = self.send_probe(&mut write).await {
                        break SessionEnd::Lost(format!("probe failed: {e}"));
                    }
                    probe.probe_sent(Instant::now());
                }
                _ = sleep_until_deadline(deadline) => {
                    warn!(
                        timeout_secs = self.settings.ping_timeout.as_secs(),
                        "No liveness response; tearing the socket down"
                    );
                    break SessionEnd::Lost("liveness probe timed out".to_string());
                }
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &mut probe),
                    Some(Ok(Message::Pong(_))) => probe.response_received(Instant::now()),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            break SessionEnd::Lost(format!("write failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by peer".to_string());
                        break SessionEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Lost(sanitize_error_message(&e.to_string())),
                    None => break SessionEnd::Lost("socket stream ended".to_string()),
                },
            }
        };

        self.publisher.set_sender(None);
        if matches!(end, SessionEnd::Shutdown) {
            // Flush whatever was queued before shutdown, goodbye frame included
            out_rx.close();
            while let Some(frame) = out_rx.recv().await {
                if write.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        }
        end
    }

    async fn send_probe<S>(&self, write: &mut S) -> Result<(), TransportError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let heartbeat = heartbeat_message(&self.dispatcher, TransportKind::Duplex, AgentPresence::Online);
        let frame = outbound_frame(&heartbeat)?;
        write
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        write
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        metrics().heartbeat_sent();
        Ok(())
    }

    fn handle_text(&self, text: &str, probe: &mut LivenessProbe) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::RegisterAck { session_id }) => {
                info!(session_id = session_id.as_deref().unwrap_or(""), "Registration acknowledged");
                probe.response_received(Instant::now());
            }
            Ok(InboundFrame::HeartbeatAck) => probe.response_received(Instant::now()),
            Ok(InboundFrame::Error { message }) => {
                warn!(message = %message, "Control plane reported an error");
            }
            Ok(InboundFrame::Command(payload)) => {
                metrics().message_received();
                self.spawn_job(payload);
            }
            Err(e) => warn!(error = %e, "Ignoring unparseable socket frame"),
        }
    }

    fn spawn_job(&self, payload: serde_json::Value) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(
            async move {
                let Ok(_permit) = jobs.acquire_owned().await else {
                    return;
                };
                let report = dispatcher.dispatch(&payload).await;
                if report.is_retryable() {
                    debug!(
                        job_id = report.job_id.as_deref().unwrap_or(""),
                        "Transient failure on socket path; not requeued"
                    );
                }
            }
            .in_current_span(),
        );
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Socket URLs must be `ws://` or `wss://`
pub fn validate_socket_url(raw: &str) -> Result<(), TransportError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| TransportError::InvalidUrl(format!("socket URL: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported socket scheme '{}'",
            parsed.scheme()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_validation() {
        assert!(validate_socket_url("wss://control.example.com/agents/ws").is_ok());
        assert!(validate_socket_url("ws://127.0.0.1:9000").is_ok());
        assert!(validate_socket_url("https://control.example.com").is_err());
    }

    #[tokio::test]
    async fn test_sink_refuses_before_start() {
        let transport = DuplexTransport::new(
            "web-01",
            "ws://127.0.0.1:9",
            None,
            &DuplexSection::default(),
            BackoffPolicy::default(),
        )
        .unwrap();
        let goodbye = transport.publisher.send_frame("{}".to_string()).await;
        assert!(matches!(goodbye, Err(TransportError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_deadline_sleep_without_probe_never_fires() {
        let fired =
            tokio::time::timeout(Duration::from_millis(20), sleep_until_deadline(None)).await;
        assert!(fired.is_err());
    }
}
