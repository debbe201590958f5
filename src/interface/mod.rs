//! Interface layer - External interfaces
//!
//! This layer handles:
//! - REST API endpoints for call control
//! - Health and Prometheus metrics endpoints
//! - Process signals that trigger a graceful shutdown

pub mod api;
pub mod shutdown;

pub use shutdown::shutdown_signal;
