//! Account bounded context - the single SIP identity of the softphone

pub mod entity;
pub mod value_object;

pub use entity::{Account, FailureOutcome};
pub use value_object::{Credentials, RegistrationState};
