//! Agent runtime: builds the job pipeline and transport selector from
//! configuration and owns their lifecycle.

pub mod lifecycle;

pub use lifecycle::{AgentRuntime, AgentState, SHUTDOWN_GRACE};
