//! Testing utilities and mock implementations
//!
//! Lets dispatcher, emitter and selector behavior be exercised without a
//! broker or a control plane.

pub mod mocks;

pub use mocks::*;
