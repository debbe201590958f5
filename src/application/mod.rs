//! Application layer - the softphone engine and its use cases
//!
//! This layer orchestrates domain objects over the SIP stack:
//! - Registration lifecycle of the account
//! - Call control for the single dialog
//! - The engine task that serializes all of it
//! - The control bridge used by the HTTP surface

pub mod bridge;
pub mod context;
pub mod dialog;
pub mod engine;
pub mod media;
pub mod registration;

pub use bridge::{ControlBridge, Intent, Reply, StatusSnapshot};
pub use engine::{Engine, EngineConfig, EngineHandle};
