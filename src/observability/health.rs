//! Local HTTP health endpoints
//!
//! Stays up in degraded mode: `/live` answers as long as the process runs,
//! while `/health` and `/ready` report 503 until a transport is attached.

use crate::jobs::Dispatcher;
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP health check server
pub struct HealthServer {
    agent_id: String,
    port: u16,
    dispatcher: Arc<Dispatcher>,
}

impl HealthServer {
    pub fn new(agent_id: impl Into<String>, port: u16, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            agent_id: agent_id.into(),
            port,
            dispatcher,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);

        // GET /health - transport and job status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /ready - a transport is attached
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&ready_server);
                async move {
                    let transport = server.active_transport();
                    let response = ReadinessResponse {
                        ready: transport.is_some(),
                        transport,
                        timestamp: current_timestamp(),
                    };
                    let code = if response.ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&response),
                        code,
                    ))
                }
            });

        // GET /live - process is running
        let live_route = warp::path("live").and(warp::path::end()).and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        // GET /metrics - JSON snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
    }

    /// Serve until `shutdown_rx` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let routes = Arc::clone(&self).routes();
        let bound = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        let (bound, server) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(port = self.port, error = %e, "Health server failed to bind");
                return;
            }
        };
        info!(addr = %bound, "Health server listening");
        server.await;
        info!("Health server stopped");
    }

    fn active_transport(&self) -> Option<String> {
        self.dispatcher
            .emitter()
            .active_transport()
            .map(|kind| kind.to_string())
    }

    fn health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = BTreeMap::new();

        let transport = self.active_transport();
        checks.insert(
            "transport".to_string(),
            match &transport {
                Some(kind) => HealthCheck {
                    status: "healthy".to_string(),
                    message: Some(format!("{kind} transport active")),
                    last_check: now,
                },
                None => HealthCheck {
                    status: "unhealthy".to_string(),
                    message: Some("No transport available (degraded mode)".to_string()),
                    last_check: now,
                },
            },
        );
        checks.insert(
            "jobs".to_string(),
            HealthCheck {
                status: "healthy".to_string(),
                message: Some(format!(
                    "{} in flight, {} resource locks held",
                    self.dispatcher.in_flight_count(),
                    self.dispatcher.guard().held_count()
                )),
                last_check: now,
            },
        );

        let healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            agent_id: self.agent_id.clone(),
            uptime_seconds: metrics().uptime().as_secs(),
            active_transport: transport,
            checks,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    agent_id: String,
    uptime_seconds: u64,
    active_transport: Option<String>,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    transport: Option<String>,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
