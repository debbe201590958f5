//! yakphone - a headless SIP softphone
//!
//! Registers one account with a SIP server, places and receives one call
//! at a time, sends DTMF over SIP INFO, and exposes all of it through a
//! small HTTP control API. Signalling state lives on a single engine task;
//! audio is left to an external collaborator.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
