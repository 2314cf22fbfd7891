//! Hostlink agent
//!
//! A host-resident agent that receives deployment and maintenance jobs from a
//! remote control plane and reports progress, logs and results back.
//!
//! # Overview
//!
//! - A durable AMQP queue is the primary transport; a duplex WebSocket is the
//!   fallback. The [`transport::TransportSelector`] picks one, watches it and
//!   fails over when it is lost for good.
//! - Inbound payloads are normalized into canonical [`jobs::Job`]s, routed by
//!   action type and guarded so two jobs never touch the same application at
//!   once.
//! - The transport secret is stored encrypted at rest by [`credentials`].
//!
//! # Quick Start
//!
//! ```rust
//! use hostlink::jobs::JobNormalizer;
//! use serde_json::json;
//!
//! let normalizer = JobNormalizer::new("web-01");
//! let job = normalizer
//!     .normalize(&json!({"jobId": "j-1", "type": "deploy", "payload": {"appName": "shop"}}))
//!     .unwrap();
//! assert_eq!(job.action_type, "deploy_application");
//! ```

pub mod agent;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod emitter;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::{AgentRuntime, AgentState};
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult};
pub use jobs::{CommandRouter, Dispatcher, Job, JobHandler, Outcome};
pub use transport::{Transport, TransportKind, TransportSelector};
