//! Domain errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Operation is not valid for the current dialog or account state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Hangup on a dialog that has already ended
    #[error("Call already terminated")]
    AlreadyTerminated,

    /// No response within the retransmission budget, or the socket refused the send
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Repeated challenge or rejected credentials
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Malformed or unexpected message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("SIP softphone not running")]
    NotRunning,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
