//! Fallback duplex socket transport (WebSocket via `tokio-tungstenite`)

pub mod client;
pub mod liveness;

pub use client::{validate_socket_url, DuplexPublisher, DuplexTransport};
pub use liveness::LivenessProbe;
