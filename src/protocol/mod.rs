//! Wire protocol shared by the queue and socket transports
//!
//! Outbound records (status, log, result, heartbeat), socket frame encoding
//! and agent identity validation.

pub mod frames;
pub mod identity;
pub mod messages;

pub use frames::{FrameError, InboundFrame};
pub use identity::{validate_agent_id, ValidationError};
pub use messages::*;
