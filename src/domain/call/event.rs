//! Call domain events

use crate::domain::call::value_object::{CallDirection, DialogState, EndReason};
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use crate::domain::shared::value_objects::{CallId, SipUri};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base struct for all call events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEventBase {
    pub metadata: EventMetadata,
    pub call_id: CallId,
}

impl CallEventBase {
    pub fn new(event_type: &str, call_id: &CallId) -> Self {
        Self {
            metadata: EventMetadata::new(event_type),
            call_id: call_id.clone(),
        }
    }
}

/// Dialog created for an outgoing or incoming INVITE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInitiated {
    pub base: CallEventBase,
    pub direction: CallDirection,
    pub remote_uri: SipUri,
}

/// Dialog moved between early states (Calling, Ringing, EarlyMedia)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallProgressed {
    pub base: CallEventBase,
    pub from: DialogState,
    pub to: DialogState,
}

/// 2xx exchanged and ACKed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfirmed {
    pub base: CallEventBase,
    pub confirmed_at: DateTime<Utc>,
}

/// Media layer reported a change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMediaChanged {
    pub base: CallEventBase,
    pub active: bool,
}

/// Dialog terminated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnded {
    pub base: CallEventBase,
    pub reason: EndReason,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: Option<i64>,
}

macro_rules! impl_domain_event {
    ($ty:ty, $name:literal) => {
        impl DomainEvent for $ty {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn occurred_at(&self) -> DateTime<Utc> {
                self.base.metadata.occurred_at
            }
        }
    };
}

impl_domain_event!(CallInitiated, "call.initiated");
impl_domain_event!(CallProgressed, "call.progressed");
impl_domain_event!(CallConfirmed, "call.confirmed");
impl_domain_event!(CallMediaChanged, "call.media_changed");
impl_domain_event!(CallEnded, "call.ended");

/// Union of all call events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    Initiated(CallInitiated),
    Progressed(CallProgressed),
    Confirmed(CallConfirmed),
    MediaChanged(CallMediaChanged),
    Ended(CallEnded),
}

impl CallEvent {
    fn inner(&self) -> &dyn DomainEvent {
        match self {
            CallEvent::Initiated(e) => e,
            CallEvent::Progressed(e) => e,
            CallEvent::Confirmed(e) => e,
            CallEvent::MediaChanged(e) => e,
            CallEvent::Ended(e) => e,
        }
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            CallEvent::Initiated(e) => &e.base.call_id,
            CallEvent::Progressed(e) => &e.base.call_id,
            CallEvent::Confirmed(e) => &e.base.call_id,
            CallEvent::MediaChanged(e) => &e.base.call_id,
            CallEvent::Ended(e) => &e.base.call_id,
        }
    }
}

impl DomainEvent for CallEvent {
    fn event_type(&self) -> &'static str {
        self.inner().event_type()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.inner().occurred_at()
    }
}
