//! Domain layer - Core call-control rules
//!
//! This layer contains:
//! - Account: the SIP identity and its registration binding
//! - Call: the dialog aggregate and its state machine
//! - Shared kernel: errors, events and value objects

pub mod account;
pub mod call;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
