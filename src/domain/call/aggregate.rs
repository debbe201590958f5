//! Dialog aggregate root

use crate::domain::call::event::{
    CallConfirmed, CallEnded, CallEvent, CallEventBase, CallInitiated, CallMediaChanged,
    CallProgressed,
};
use crate::domain::call::value_object::{CallDirection, DialogState, EndReason};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, SipUri};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Proof that the ACK for a 2xx was handed to the transport (outgoing) or
/// received from the peer (incoming). Only the protocol engine can mint one,
/// which keeps `Confirmed` out of reach of anything but a real ACK exchange.
#[derive(Debug)]
pub struct AckReceipt {
    _sealed: (),
}

impl AckReceipt {
    pub(crate) fn new() -> Self {
        Self { _sealed: () }
    }
}

/// Dialog aggregate root
///
/// Holds the call-level state of one SIP dialog and enforces the legal
/// transitions between [`DialogState`]s. Protocol details (tags, CSeq,
/// transactions) live with the engine's call session.
#[derive(Debug, Clone, Serialize)]
pub struct Dialog {
    id: CallId,
    direction: CallDirection,
    state: DialogState,
    local_uri: SipUri,
    remote_uri: SipUri,
    /// Set by the media layer callback, never by signalling
    media_active: bool,
    started_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
    #[serde(skip)]
    events: Vec<CallEvent>,
}

impl Dialog {
    /// Create a new dialog in `Idle`
    pub fn new(id: CallId, direction: CallDirection, local_uri: SipUri, remote_uri: SipUri) -> Self {
        let mut dialog = Self {
            id,
            direction,
            state: DialogState::Idle,
            local_uri,
            remote_uri: remote_uri.clone(),
            media_active: false,
            started_at: Utc::now(),
            confirmed_at: None,
            ended_at: None,
            end_reason: None,
            events: Vec::new(),
        };

        dialog.record_event(CallEvent::Initiated(CallInitiated {
            base: CallEventBase::new("call.initiated", &dialog.id),
            direction,
            remote_uri,
        }));

        dialog
    }

    /// INVITE sent
    pub fn start_calling(&mut self) -> Result<()> {
        if self.direction != CallDirection::Outgoing {
            return Err(DomainError::InvalidState(
                "Only outgoing dialogs can place an INVITE".to_string(),
            ));
        }
        self.progress_to(DialogState::Calling)
    }

    /// Provisional response received (outgoing) or INVITE received (incoming)
    pub fn ring(&mut self) -> Result<()> {
        if self.state == DialogState::Ringing {
            return Ok(());
        }
        self.progress_to(DialogState::Ringing)
    }

    /// Provisional response carrying a session description
    pub fn early_media(&mut self) -> Result<()> {
        if self.state == DialogState::EarlyMedia {
            return Ok(());
        }
        self.progress_to(DialogState::EarlyMedia)
    }

    /// 2xx exchanged and ACKed
    pub fn confirm(&mut self, _ack: AckReceipt) -> Result<()> {
        self.transition_to(DialogState::Confirmed)?;
        let confirmed_at = Utc::now();
        self.confirmed_at = Some(confirmed_at);

        self.record_event(CallEvent::Confirmed(CallConfirmed {
            base: CallEventBase::new("call.confirmed", &self.id),
            confirmed_at,
        }));

        Ok(())
    }

    /// BYE or CANCEL sent
    pub fn begin_disconnect(&mut self) -> Result<()> {
        self.transition_to(DialogState::Disconnecting)
    }

    /// End the dialog
    pub fn terminate(&mut self, reason: EndReason) -> Result<()> {
        self.transition_to(DialogState::Terminated)?;
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);
        self.end_reason = Some(reason.clone());

        let media_was_active = std::mem::replace(&mut self.media_active, false);
        if media_was_active {
            self.record_event(CallEvent::MediaChanged(CallMediaChanged {
                base: CallEventBase::new("call.media_changed", &self.id),
                active: false,
            }));
        }

        let duration_seconds = self
            .confirmed_at
            .map(|confirmed| (ended_at - confirmed).num_seconds());

        self.record_event(CallEvent::Ended(CallEnded {
            base: CallEventBase::new("call.ended", &self.id),
            reason,
            ended_at,
            duration_seconds,
        }));

        Ok(())
    }

    /// Media layer callback. Returns true when the flag actually changed.
    pub fn set_media_active(&mut self, active: bool) -> Result<bool> {
        if self.state.is_terminated() {
            return Err(DomainError::InvalidState(
                "Dialog is terminated".to_string(),
            ));
        }
        if self.media_active == active {
            return Ok(false);
        }
        self.media_active = active;

        self.record_event(CallEvent::MediaChanged(CallMediaChanged {
            base: CallEventBase::new("call.media_changed", &self.id),
            active,
        }));

        Ok(true)
    }

    fn progress_to(&mut self, new_state: DialogState) -> Result<()> {
        let from = self.state;
        self.transition_to(new_state)?;

        self.record_event(CallEvent::Progressed(CallProgressed {
            base: CallEventBase::new("call.progressed", &self.id),
            from,
            to: new_state,
        }));

        Ok(())
    }

    /// Transition to a new state
    fn transition_to(&mut self, new_state: DialogState) -> Result<()> {
        if !self.state.can_transition_to(new_state) {
            return Err(DomainError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            )));
        }

        self.state = new_state;
        Ok(())
    }

    fn record_event(&mut self, event: CallEvent) {
        self.events.push(event);
    }

    /// Take all pending events
    pub fn take_events(&mut self) -> Vec<CallEvent> {
        std::mem::take(&mut self.events)
    }

    // Getters
    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn local_uri(&self) -> &SipUri {
        &self.local_uri
    }

    pub fn remote_uri(&self) -> &SipUri {
        &self.remote_uri
    }

    pub fn media_active(&self) -> bool {
        self.media_active
    }

    pub fn started_at(&self) -> &DateTime<Utc> {
        &self.started_at
    }

    pub fn confirmed_at(&self) -> Option<&DateTime<Utc>> {
        self.confirmed_at.as_ref()
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> Dialog {
        Dialog::new(
            CallId::from("abc@10.0.0.5"),
            CallDirection::Outgoing,
            SipUri::parse("sip:100@pbx.local").unwrap(),
            SipUri::parse("sip:5551234@pbx.local").unwrap(),
        )
    }

    #[test]
    fn test_outgoing_lifecycle() {
        let mut dialog = outgoing();
        assert_eq!(dialog.state(), DialogState::Idle);

        dialog.start_calling().unwrap();
        dialog.ring().unwrap();
        dialog.ring().unwrap();
        dialog.early_media().unwrap();
        dialog.confirm(AckReceipt::new()).unwrap();
        assert_eq!(dialog.state(), DialogState::Confirmed);
        assert!(dialog.confirmed_at().is_some());

        dialog.begin_disconnect().unwrap();
        dialog.terminate(EndReason::LocalHangup).unwrap();
        assert_eq!(dialog.state(), DialogState::Terminated);
        assert_eq!(dialog.end_reason(), Some(&EndReason::LocalHangup));

        // Initiated, Calling, Ringing, EarlyMedia, Confirmed, Ended
        let events = dialog.take_events();
        assert_eq!(events.len(), 6);
        assert!(matches!(events.last(), Some(CallEvent::Ended(_))));
    }

    #[test]
    fn test_confirm_requires_invite_in_progress() {
        let mut dialog = outgoing();
        assert!(dialog.confirm(AckReceipt::new()).is_err());
        assert_eq!(dialog.state(), DialogState::Idle);
    }

    #[test]
    fn test_terminated_rejects_everything() {
        let mut dialog = outgoing();
        dialog.start_calling().unwrap();
        dialog.terminate(EndReason::Rejected(486)).unwrap();

        assert!(matches!(dialog.ring(), Err(DomainError::InvalidState(_))));
        assert!(dialog.confirm(AckReceipt::new()).is_err());
        assert!(dialog.begin_disconnect().is_err());
        assert!(dialog.terminate(EndReason::LocalHangup).is_err());
        assert!(dialog.set_media_active(true).is_err());
    }

    #[test]
    fn test_incoming_cannot_place_invite() {
        let mut dialog = Dialog::new(
            CallId::from("in@peer"),
            CallDirection::Incoming,
            SipUri::parse("sip:100@pbx.local").unwrap(),
            SipUri::parse("sip:200@pbx.local").unwrap(),
        );
        assert!(dialog.start_calling().is_err());
        dialog.ring().unwrap();
        assert_eq!(dialog.state(), DialogState::Ringing);
    }

    #[test]
    fn test_media_flag_cleared_on_terminate() {
        let mut dialog = outgoing();
        dialog.start_calling().unwrap();
        dialog.confirm(AckReceipt::new()).unwrap();

        assert!(dialog.set_media_active(true).unwrap());
        assert!(!dialog.set_media_active(true).unwrap());
        assert!(dialog.media_active());

        dialog.terminate(EndReason::RemoteHangup).unwrap();
        assert!(!dialog.media_active());
    }
}
