//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We sent the INVITE
    Outgoing,
    /// We received the INVITE
    Incoming,
}

/// Dialog state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Created, nothing sent or received yet
    Idle,
    /// INVITE sent, no provisional response beyond 100
    Calling,
    /// Remote party is being alerted (or we are, for incoming calls)
    Ringing,
    /// 183 / provisional response with session description
    EarlyMedia,
    /// 2xx exchanged and ACKed
    Confirmed,
    /// BYE or CANCEL sent, waiting for the exchange to finish
    Disconnecting,
    /// Dialog is over
    Terminated,
}

impl DialogState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: DialogState) -> bool {
        use DialogState::*;

        match (self, new_state) {
            (Idle, Calling) | (Idle, Ringing) => true,

            (Calling, Ringing) | (Calling, EarlyMedia) => true,
            (Ringing, EarlyMedia) | (EarlyMedia, Ringing) => true,

            (Calling, Confirmed) | (Ringing, Confirmed) | (EarlyMedia, Confirmed) => true,

            (Calling, Disconnecting)
            | (Ringing, Disconnecting)
            | (EarlyMedia, Disconnecting)
            | (Confirmed, Disconnecting) => true,

            // Can't transition from Terminated
            (Terminated, _) => false,
            (_, Terminated) => true,

            // All other transitions are invalid
            _ => false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated)
    }

    /// Early states: INVITE in progress, no final answer yet
    pub fn is_early(&self) -> bool {
        matches!(
            self,
            DialogState::Idle | DialogState::Calling | DialogState::Ringing | DialogState::EarlyMedia
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DialogState::Idle => "Idle",
            DialogState::Calling => "Calling",
            DialogState::Ringing => "Ringing",
            DialogState::EarlyMedia => "EarlyMedia",
            DialogState::Confirmed => "Confirmed",
            DialogState::Disconnecting => "Disconnecting",
            DialogState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reason for call ending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// We sent BYE
    LocalHangup,
    /// Remote party sent BYE
    RemoteHangup,
    /// We cancelled before the call was answered
    Canceled,
    /// Remote party cancelled before we answered
    RemoteCanceled,
    /// Outgoing call rejected with a final response
    Rejected(u16),
    /// We rejected an incoming call
    Declined(u16),
    /// No response within the retransmission budget
    TransportFailure,
    /// INVITE challenged again after sending credentials
    AuthFailure,
    /// Our 2xx was never acknowledged
    AckTimeout,
    /// In-dialog request answered with 408/481
    DialogGone(u16),
    /// Engine shutting down
    Shutdown,
}

impl EndReason {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EndReason::Rejected(_)
                | EndReason::TransportFailure
                | EndReason::AuthFailure
                | EndReason::AckTimeout
                | EndReason::DialogGone(_)
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => write!(f, "local hangup"),
            EndReason::RemoteHangup => write!(f, "remote hangup"),
            EndReason::Canceled => write!(f, "canceled"),
            EndReason::RemoteCanceled => write!(f, "canceled by remote party"),
            EndReason::Rejected(code) => write!(f, "rejected with {}", code),
            EndReason::Declined(code) => write!(f, "declined with {}", code),
            EndReason::TransportFailure => write!(f, "no response from remote party"),
            EndReason::AuthFailure => write!(f, "authentication failed"),
            EndReason::AckTimeout => write!(f, "ACK not received"),
            EndReason::DialogGone(code) => write!(f, "dialog gone ({})", code),
            EndReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_state_transitions() {
        let idle = DialogState::Idle;
        assert!(idle.can_transition_to(DialogState::Calling));
        assert!(idle.can_transition_to(DialogState::Ringing));
        assert!(!idle.can_transition_to(DialogState::Confirmed));

        let calling = DialogState::Calling;
        assert!(calling.can_transition_to(DialogState::Ringing));
        assert!(calling.can_transition_to(DialogState::EarlyMedia));
        assert!(calling.can_transition_to(DialogState::Confirmed));
        assert!(calling.can_transition_to(DialogState::Disconnecting));

        let confirmed = DialogState::Confirmed;
        assert!(confirmed.can_transition_to(DialogState::Disconnecting));
        assert!(confirmed.can_transition_to(DialogState::Terminated));
        assert!(!confirmed.can_transition_to(DialogState::Ringing));
    }

    #[test]
    fn test_invalid_state_transitions() {
        let terminated = DialogState::Terminated;
        assert!(!terminated.can_transition_to(DialogState::Confirmed));
        assert!(!terminated.can_transition_to(DialogState::Terminated));

        // A 2xx racing a CANCEL must not revive the dialog
        assert!(!DialogState::Disconnecting.can_transition_to(DialogState::Confirmed));
    }

    #[test]
    fn test_is_early() {
        assert!(DialogState::Calling.is_early());
        assert!(DialogState::EarlyMedia.is_early());
        assert!(!DialogState::Confirmed.is_early());
        assert!(!DialogState::Disconnecting.is_early());
    }
}
