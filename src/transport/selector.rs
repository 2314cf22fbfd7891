//! Transport selection, failover and degraded mode
//!
//! Each selection round resolves credentials once (environment, control
//! plane, vault), then tries the transports in preference order. The first
//! one that starts is attached to the emitter. When the active transport
//! reports `PermanentlyDisconnected` the selector fails over to the other
//! one; with nothing available it stays in degraded mode and retries on a
//! fixed period. It never ends the process.

use super::{
    AmqpTransport, BackoffPolicy, DuplexTransport, Transport, TransportError, TransportKind,
};
use crate::auth::{AuthGrant, ControlPlaneClient};
use crate::config::AgentConfig;
use crate::credentials::{CredentialError, CredentialStore};
use crate::jobs::Dispatcher;
use crate::observability::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Preferred order for a fresh selection round
pub const DEFAULT_ORDER: [TransportKind; 2] = [TransportKind::Queue, TransportKind::Duplex];

/// Where the broker secret for this round came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Environment,
    Grant,
    Vault,
}

/// Endpoints and secrets available for one selection round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportPlan {
    pub queue_url: Option<String>,
    pub queue_source: Option<SecretSource>,
    pub socket_url: Option<String>,
    pub access_token: Option<String>,
}

/// Builds transports for the selector; mocked in tests
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Resolve credentials for a selection round (may authenticate)
    async fn plan(&self) -> TransportPlan;

    /// Build an unstarted transport of `kind`, or `None` if the plan has no endpoint for it
    fn create(
        &self,
        kind: TransportKind,
        plan: &TransportPlan,
    ) -> Result<Option<Box<dyn Transport>>, TransportError>;
}

/// Pick the broker secret: environment first, then a fresh grant (persisted),
/// then the vault when authentication failed
pub fn resolve_queue_secret(
    env_url: Option<String>,
    grant: Option<&AuthGrant>,
    store: &CredentialStore,
) -> Option<(String, SecretSource)> {
    if let Some(url) = env_url {
        debug!("Using broker URL from the environment");
        return Some((url, SecretSource::Environment));
    }

    match grant {
        Some(grant) => {
            let url = grant.queue_url.clone()?;
            if let Err(e) = store.save(&url) {
                warn!(error = %e, "Could not persist broker credential");
            }
            Some((url, SecretSource::Grant))
        }
        None => match store.load() {
            Ok(Some(url)) => {
                info!(path = %store.path().display(), "Using stored broker credential");
                Some((url, SecretSource::Vault))
            }
            Ok(None) => None,
            Err(CredentialError::Corrupt(reason)) => {
                warn!(
                    error_code = %CredentialError::Corrupt(reason.clone()).error_code(),
                    reason = %reason,
                    "Stored broker credential is corrupt; ignoring it"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Could not read stored broker credential");
                None
            }
        },
    }
}

/// Production factory: control-plane auth plus the credential vault
pub struct DefaultTransportFactory {
    config: AgentConfig,
    auth: ControlPlaneClient,
    store: CredentialStore,
}

impl DefaultTransportFactory {
    pub fn new(config: AgentConfig, auth: ControlPlaneClient, store: CredentialStore) -> Self {
        Self {
            config,
            auth,
            store,
        }
    }

    async fn authenticate(&self, token: Option<&str>) -> Option<AuthGrant> {
        let token = token?;
        match self.auth.authenticate(token).await {
            Ok(grant) => Some(grant),
            Err(e) => {
                warn!(endpoint = %self.auth.endpoint(), error = %e, "Authentication failed");
                None
            }
        }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn plan(&self) -> TransportPlan {
        let enrollment_token = match self.config.agent_token() {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Skipping control-plane authentication");
                None
            }
        };
        let grant = self.authenticate(enrollment_token.as_deref()).await;

        let queue = resolve_queue_secret(
            self.config.queue_url_from_env(),
            grant.as_ref(),
            &self.store,
        );
        let socket_url = grant
            .as_ref()
            .and_then(|g| g.socket_url.clone())
            .or_else(|| self.config.duplex.url.clone());
        let access_token = grant
            .as_ref()
            .and_then(|g| g.access_token.clone())
            .or(enrollment_token);

        TransportPlan {
            queue_source: queue.as_ref().map(|(_, source)| *source),
            queue_url: queue.map(|(url, _)| url),
            socket_url,
            access_token,
        }
    }

    fn create(
        &self,
        kind: TransportKind,
        plan: &TransportPlan,
    ) -> Result<Option<Box<dyn Transport>>, TransportError> {
        let policy = BackoffPolicy::from_config(&self.config.reconnect);
        let server_id = &self.config.agent.id;
        match kind {
            TransportKind::Queue => plan
                .queue_url
                .as_ref()
                .map(|url| {
                    AmqpTransport::new(server_id, url, &self.config.queue, policy)
                        .map(|t| Box::new(t) as Box<dyn Transport>)
                })
                .transpose(),
            TransportKind::Duplex => plan
                .socket_url
                .as_ref()
                .map(|url| {
                    DuplexTransport::new(
                        server_id,
                        url,
                        plan.access_token.clone(),
                        &self.config.duplex,
                        policy,
                    )
                    .map(|t| Box::new(t) as Box<dyn Transport>)
                })
                .transpose(),
        }
    }
}

/// Result of a selection round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Active(TransportKind),
    Degraded,
}

pub struct TransportSelector {
    factory: Arc<dyn TransportFactory>,
    dispatcher: Arc<Dispatcher>,
    active: Option<Box<dyn Transport>>,
    degraded_retry: Duration,
}

impl TransportSelector {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        dispatcher: Arc<Dispatcher>,
        degraded_retry: Duration,
    ) -> Self {
        Self {
            factory,
            dispatcher,
            active: None,
            degraded_retry,
        }
    }

    pub fn active_kind(&self) -> Option<TransportKind> {
        self.active.as_ref().map(|t| t.kind())
    }

    pub fn is_degraded(&self) -> bool {
        self.active.is_none()
    }

    /// Initial selection: queue first, then the socket
    pub async fn activate(&mut self) -> Activation {
        self.activate_in_order(DEFAULT_ORDER).await
    }

    async fn activate_in_order(&mut self, order: [TransportKind; 2]) -> Activation {
        let plan = self.factory.plan().await;

        for kind in order {
            let mut transport = match self.factory.create(kind, &plan) {
                Ok(Some(transport)) => transport,
                Ok(None) => {
                    debug!(transport = %kind, "No endpoint available; skipping");
                    continue;
                }
                Err(e) => {
                    warn!(transport = %kind, error = %e, "Transport could not be created");
                    continue;
                }
            };

            match transport.start(Arc::clone(&self.dispatcher)).await {
                Ok(()) => {
                    self.dispatcher.emitter().attach(kind, transport.sink());
                    metrics().set_active_transport(Some(kind.as_str()));
                    info!(transport = %kind, "Transport active");
                    self.active = Some(transport);
                    return Activation::Active(kind);
                }
                Err(e) => {
                    warn!(transport = %kind, error = %e, "Transport failed to start");
                    transport.shutdown("start failed").await;
                }
            }
        }

        self.dispatcher.emitter().detach();
        metrics().set_active_transport(None);
        warn!(
            retry_secs = self.degraded_retry.as_secs(),
            "No transport available; running in degraded mode"
        );
        Activation::Degraded
    }

    /// Tear down a dead transport and try the other one first
    async fn fail_over(&mut self) -> Activation {
        let Some(mut failed) = self.active.take() else {
            return self.activate().await;
        };
        let kind = failed.kind();
        error!(
            transport = %kind,
            state = ?failed.connection_state(),
            "Transport lost permanently; failing over"
        );
        self.dispatcher.emitter().detach();
        failed.shutdown("connection lost").await;
        metrics().failover();
        self.activate_in_order([kind.other(), kind]).await
    }

    /// Watch the active transport until shutdown is signalled, then hand the
    /// selector back for the final flush
    pub async fn supervise(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Self {
        loop {
            if *shutdown_rx.borrow() {
                return self;
            }

            match self.active.as_ref().map(|t| t.state_watch()) {
                Some(mut state_rx) => {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return self;
                            }
                        }
                        _ = wait_for_permanent_loss(&mut state_rx) => {
                            self.fail_over().await;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return self;
                            }
                        }
                        _ = tokio::time::sleep(self.degraded_retry) => {
                            info!("Retrying transport selection");
                            self.activate().await;
                        }
                    }
                }
            }
        }
    }

    /// Flush the farewell on the active transport and detach it
    pub async fn shutdown(&mut self, reason: &str) {
        if let Some(mut transport) = self.active.take() {
            transport.shutdown(reason).await;
        }
        self.dispatcher.emitter().detach();
        metrics().set_active_transport(None);
    }
}

async fn wait_for_permanent_loss(state_rx: &mut watch::Receiver<super::ConnectionState>) {
    loop {
        if state_rx.borrow_and_update().is_permanent() {
            return;
        }
        if state_rx.changed().await.is_err() {
            // Sender gone: the transport is finished
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::credentials::derive_key;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CredentialStore {
        let key = derive_key(Some("web-01"), Environment::Development).key;
        CredentialStore::new(dir.path().join("credential.bin"), key)
    }

    fn grant(queue_url: Option<&str>) -> AuthGrant {
        AuthGrant {
            queue_url: queue_url.map(str::to_string),
            socket_url: Some("wss://cp/ws".to_string()),
            access_token: Some("t".to_string()),
            expires_in: None,
        }
    }

    #[test]
    fn test_environment_wins_and_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let resolved = resolve_queue_secret(
            Some("amqp://env/".to_string()),
            Some(&grant(Some("amqp://grant/"))),
            &store,
        );
        assert_eq!(
            resolved,
            Some(("amqp://env/".to_string(), SecretSource::Environment))
        );
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_grant_secret_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let resolved = resolve_queue_secret(None, Some(&grant(Some("amqp://grant/"))), &store);
        assert_eq!(resolved.map(|(_, s)| s), Some(SecretSource::Grant));
        assert_eq!(store.load().unwrap().as_deref(), Some("amqp://grant/"));
    }

    #[test]
    fn test_vault_used_only_when_auth_failed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save("amqp://stored/").unwrap();

        let after_failure = resolve_queue_secret(None, None, &store);
        assert_eq!(
            after_failure,
            Some(("amqp://stored/".to_string(), SecretSource::Vault))
        );

        let socket_only = resolve_queue_secret(None, Some(&grant(None)), &store);
        assert_eq!(socket_only, None);
    }

    #[test]
    fn test_corrupt_vault_is_treated_as_missing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(store.path(), b"\x0cgarbage").unwrap();
        assert_eq!(resolve_queue_secret(None, None, &store), None);
    }
}
