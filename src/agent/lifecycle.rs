//! Agent lifecycle: wiring, supervision and graceful shutdown

use crate::auth::ControlPlaneClient;
use crate::config::AgentConfig;
use crate::credentials::{derive_key, CredentialStore};
use crate::emitter::Emitter;
use crate::error::AgentError;
use crate::jobs::{
    actions, CommandRouter, ConcurrencyGuard, Dispatcher, HealthCheckHandler, JobNormalizer,
};
use crate::observability::{metrics, HealthServer};
use crate::transport::{
    Activation, DefaultTransportFactory, TransportFactory, TransportKind, TransportSelector,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// How long shutdown waits for running jobs before flushing the farewell
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle states reported through metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Initializing => "initializing",
            AgentState::Running => "running",
            AgentState::Degraded => "degraded",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
        }
    }
}

/// Owns everything the agent runs: dispatcher, selector and health server
pub struct AgentRuntime {
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    selector: Option<TransportSelector>,
    supervisor: Option<JoinHandle<TransportSelector>>,
    health_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    state: AgentState,
}

impl AgentRuntime {
    /// Production wiring: vault, control-plane client and real transports.
    ///
    /// `router` carries the embedding binary's handlers; `health_check` is
    /// always registered on top.
    pub fn build(config: AgentConfig, router: CommandRouter) -> Result<Self, AgentError> {
        config.validate()?;

        let derived = derive_key(Some(&config.agent.id), config.agent.environment);
        let store = CredentialStore::new(config.credentials.path.clone(), derived.key);
        let auth = ControlPlaneClient::from_config(&config)?;
        let factory = DefaultTransportFactory::new(config.clone(), auth, store);

        Ok(Self::with_factory(config, router, Arc::new(factory)))
    }

    /// Wire the runtime around an arbitrary transport factory
    pub fn with_factory(
        config: AgentConfig,
        mut router: CommandRouter,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let server_id = config.agent.id.clone();
        let guard = Arc::new(ConcurrencyGuard::new());
        router.register(
            actions::HEALTH_CHECK,
            Arc::new(HealthCheckHandler::new(Arc::clone(&guard))),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            JobNormalizer::new(&server_id),
            Arc::new(router),
            guard,
            Arc::new(Emitter::new(&server_id)),
        ));
        let selector = TransportSelector::new(
            factory,
            Arc::clone(&dispatcher),
            Duration::from_secs(config.health.degraded_retry_secs),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            dispatcher,
            selector: Some(selector),
            supervisor: None,
            health_handle: None,
            shutdown_tx,
            state: AgentState::Initializing,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent.id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        self.dispatcher.emitter().active_transport()
    }

    fn set_state(&mut self, state: AgentState) {
        self.state = state;
        metrics().set_agent_state(state.as_str());
    }

    /// Start the health server, select a transport and hand the selector to
    /// its supervision task. Degraded mode is not an error.
    pub async fn start(&mut self) -> Result<Activation, AgentError> {
        let Some(mut selector) = self.selector.take() else {
            return Err(AgentError::internal_error("agent already started"));
        };
        info!(
            agent_id = %self.config.agent.id,
            version = env!("CARGO_PKG_VERSION"),
            "Starting agent"
        );

        if self.config.health.enabled {
            let server = Arc::new(HealthServer::new(
                self.config.agent.id.clone(),
                self.config.health.port,
                Arc::clone(&self.dispatcher),
            ));
            self.health_handle = Some(tokio::spawn(server.run(self.shutdown_tx.subscribe())));
        }

        let activation = selector
            .activate()
            .instrument(crate::lifecycle_span!(event = "activate", agent_id = %self.config.agent.id))
            .await;
        match activation {
            Activation::Active(kind) => {
                info!(transport = %kind, "Agent running");
                self.set_state(AgentState::Running);
            }
            Activation::Degraded => {
                warn!("Agent running without a transport");
                self.set_state(AgentState::Degraded);
            }
        }

        self.supervisor = Some(tokio::spawn(selector.supervise(self.shutdown_tx.subscribe())));
        Ok(activation)
    }

    /// Run until SIGINT or SIGTERM, then shut down gracefully
    pub async fn run_until_signal(mut self) -> Result<(), AgentError> {
        self.start().await?;

        let reason = wait_for_signal().await?;
        info!(signal = reason, "Shutdown signal received");
        self.shutdown(reason).await;
        Ok(())
    }

    /// Stop supervision, let running jobs finish, flush the farewell on the
    /// active transport and release every resource lock.
    pub async fn shutdown(&mut self, reason: &str) {
        if self.state == AgentState::Stopped {
            return;
        }
        self.set_state(AgentState::Stopping);
        info!(reason, "Shutting down agent");

        self.shutdown_tx.send_replace(true);
        let mut selector = match self.supervisor.take() {
            Some(handle) => match handle.await {
                Ok(selector) => Some(selector),
                Err(e) => {
                    error!(error = %e, "Transport supervisor ended abnormally");
                    None
                }
            },
            None => self.selector.take(),
        };

        let in_flight = self.dispatcher.in_flight_count();
        if in_flight > 0 {
            info!(in_flight, grace_secs = SHUTDOWN_GRACE.as_secs(), "Waiting for running jobs");
            if !self.dispatcher.wait_idle(SHUTDOWN_GRACE).await {
                warn!(
                    in_flight = self.dispatcher.in_flight_count(),
                    "Jobs still running after grace period"
                );
            }
        }

        if let Some(selector) = selector.as_mut() {
            selector.shutdown(reason).await;
        } else {
            self.dispatcher.emitter().detach();
        }

        let released = self.dispatcher.guard().release_all();
        if released > 0 {
            warn!(released, "Released resource locks held at shutdown");
        }

        if let Some(handle) = self.health_handle.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!("Health server did not stop in time");
            }
        }

        self.set_state(AgentState::Stopped);
        info!("Agent shutdown complete");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str, AgentError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| AgentError::internal_error(format!("SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| AgentError::internal_error(format!("SIGTERM handler: {e}")))?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str, AgentError> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AgentError::internal_error(format!("Ctrl-C handler: {e}")))?;
    Ok("ctrl-c")
}
