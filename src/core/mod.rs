//! Core abstractions for the gateway.
//!
//! This module provides the foundational error types shared by every
//! other module.

pub mod error;

// Re-export commonly used types
pub use error::{GatewayError, GatewayResult};
