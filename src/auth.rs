//! Control-plane authentication exchange
//!
//! One POST at startup (and on every degraded-mode retry) trades the agent's
//! enrollment token for a broker secret, a socket endpoint and a short-lived
//! access token. Response field names differ between control-plane
//! versions, so each field accepts several aliases.

use crate::config::AgentConfig;
use crate::error::sanitize_error_message;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Control plane unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Control plane rejected the agent credentials (HTTP {status})")]
    Rejected { status: u16 },
    #[error("Control plane answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid authentication response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    server_id: &'a str,
    token: &'a str,
    agent_version: &'a str,
}

/// What a successful authentication grants
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGrant {
    #[serde(default, alias = "rabbitmqUrl", alias = "amqpUrl")]
    pub queue_url: Option<String>,
    #[serde(default, alias = "websocketUrl", alias = "wsUrl")]
    pub socket_url: Option<String>,
    #[serde(default, alias = "token")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl AuthGrant {
    /// Usable only if it opens at least one transport
    pub fn has_transport(&self) -> bool {
        self.queue_url.is_some() || self.socket_url.is_some()
    }

    pub fn expires_after(&self) -> Option<Duration> {
        self.expires_in.map(Duration::from_secs)
    }
}

/// Control-plane client used by the transport selector
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: Client,
    endpoint: String,
    server_id: String,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: &str,
        auth_path: &str,
        server_id: &str,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: join_endpoint(base_url, auth_path),
            server_id: server_id.to_string(),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, AuthError> {
        Self::new(
            &config.control_plane.url,
            &config.control_plane.auth_path,
            &config.agent.id,
            config.auth_timeout(),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Exchange `enrollment_token` for transport credentials
    pub async fn authenticate(&self, enrollment_token: &str) -> Result<AuthGrant, AuthError> {
        debug!(endpoint = %self.endpoint, "Authenticating with control plane");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&AuthRequest {
                server_id: &self.server_id,
                token: enrollment_token,
                agent_version: env!("CARGO_PKG_VERSION"),
            })
            .send()
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            warn!(status = status.as_u16(), "Control plane rejected authentication");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut body = sanitize_error_message(&body);
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let grant: AuthGrant = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        if !grant.has_transport() {
            return Err(AuthError::InvalidResponse(
                "grant carries neither a broker URL nor a socket URL".to_string(),
            ));
        }

        info!(
            queue = grant.queue_url.is_some(),
            socket = grant.socket_url.is_some(),
            expires_in = grant.expires_in.unwrap_or_default(),
            "Authenticated with control plane"
        );
        Ok(grant)
    }
}

fn join_endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
