//! SIP protocol implementation
//!
//! The user-agent side of an RFC 3261 stack.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Application Layer     │
//! │ (Dialogs, Registration) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │     (UDP, memory)       │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::{ChallengeKind, DigestChallenge};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::SdpSession;
pub use transaction::{
    ResponseMatch, ServerMatch, SipTimers, TimerOutcome, Transaction, TransactionFailure,
    TransactionId, TransactionKind, TransactionLayer, TransactionOwner, TransactionState,
};
pub use transport::{IncomingMessage, MemoryTransport, OutgoingMessage, Transport, UdpTransport};
