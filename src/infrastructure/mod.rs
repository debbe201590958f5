//! Infrastructure layer - Technical implementations
//!
//! This layer contains the SIP stack: message types, digest auth, SDP,
//! the transaction layer and the UDP/in-memory transports.

pub mod protocols;
