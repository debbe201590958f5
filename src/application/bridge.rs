//! Control bridge
//!
//! Validates user intents coming from the HTTP surface, hands them to the
//! engine and turns the outcome into the reply the caller sees. Status reads
//! never touch the engine queue; they come from the last published
//! [`StatusSnapshot`].

use crate::application::dialog::CallSession;
use crate::application::engine::{CommandOutcome, EngineCommand, EngineHandle};
use crate::domain::account::RegistrationState;
use crate::domain::call::{CallDirection, DialogState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    MakeCall { destination: String },
    Hangup,
    SendDtmf { digits: String },
    /// Answer the ringing call; `None` accepts with 200
    Answer { status_code: Option<u16> },
    Register,
}

impl Intent {
    /// Reject malformed input before the engine is involved
    fn into_command(self) -> Result<EngineCommand> {
        match self {
            Intent::MakeCall { destination } => {
                let destination = destination.trim().to_string();
                if destination.is_empty() {
                    return Err(DomainError::ValidationError(
                        "destination is required".to_string(),
                    ));
                }
                Ok(EngineCommand::MakeCall { destination })
            }
            Intent::Hangup => Ok(EngineCommand::Hangup),
            Intent::SendDtmf { digits } => {
                let digits = digits.trim().to_string();
                if digits.is_empty() {
                    return Err(DomainError::ValidationError("digits is required".to_string()));
                }
                Ok(EngineCommand::SendDtmf { digits })
            }
            Intent::Answer { status_code } => {
                let status_code = status_code.unwrap_or(200);
                if !(200..700).contains(&status_code) {
                    return Err(DomainError::ValidationError(format!(
                        "status_code must be between 200 and 699, got {}",
                        status_code
                    )));
                }
                Ok(EngineCommand::Answer { status_code })
            }
            Intent::Register => Ok(EngineCommand::Register),
        }
    }
}

/// Successful reply to an intent
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl Reply {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            call_id: None,
        }
    }
}

/// The call as seen from outside
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub call_id: String,
    pub direction: CallDirection,
    pub state: DialogState,
    pub remote_uri: String,
    pub media_active: bool,
    pub started_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    /// DTMF received from the peer
    pub received_dtmf: String,
    /// DTMF queued or in flight towards the peer
    pub pending_dtmf: usize,
}

impl CallInfo {
    pub fn from_session(session: &CallSession) -> Self {
        let dialog = session.dialog();
        Self {
            call_id: dialog.id().to_string(),
            direction: dialog.direction(),
            state: dialog.state(),
            remote_uri: dialog.remote_uri().to_string(),
            media_active: dialog.media_active(),
            started_at: *dialog.started_at(),
            confirmed_at: dialog.confirmed_at().copied(),
            end_reason: dialog.end_reason().map(|reason| reason.to_string()),
            received_dtmf: session.received_dtmf(),
            pending_dtmf: session.pending_dtmf(),
        }
    }
}

/// Read-only view of the softphone, published by the engine after every
/// event it handles
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub registered: bool,
    pub registration_state: RegistrationState,
    pub registered_until: Option<DateTime<Utc>>,
    pub server: String,
    pub extension: String,
    /// State of the call while it is not terminated
    pub active_call_state: Option<DialogState>,
    /// Most recent call, terminated or not
    pub call: Option<CallInfo>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Snapshot before the engine has handled anything
    pub fn starting(server: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            running: true,
            registered: false,
            registration_state: RegistrationState::Unregistered,
            registered_until: None,
            server: server.into(),
            extension: extension.into(),
            active_call_state: None,
            call: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.running && self.registered
    }
}

/// Entry point of the control surface
#[derive(Clone)]
pub struct ControlBridge {
    engine: EngineHandle,
}

impl ControlBridge {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }

    pub async fn submit(&self, intent: Intent) -> Result<Reply> {
        let command = intent.into_command()?;
        let target = match &command {
            EngineCommand::MakeCall { destination } => destination.clone(),
            EngineCommand::SendDtmf { digits } => digits.clone(),
            _ => String::new(),
        };

        let outcome = match self.engine.command(command).await {
            // Hanging up twice is not an error for the caller
            Err(DomainError::AlreadyTerminated) => CommandOutcome::HungUp,
            result => result?,
        };

        let reply = match outcome {
            CommandOutcome::CallPlaced(call_id) => {
                info!("Call {} initiated to {}", call_id, target);
                Reply {
                    call_id: Some(call_id.to_string()),
                    ..Reply::success(format!("Call initiated to {}", target))
                }
            }
            CommandOutcome::HungUp => Reply::success("Call hung up"),
            CommandOutcome::DtmfQueued { .. } => Reply::success(format!("DTMF sent: {}", target)),
            CommandOutcome::Answered { status_code } => {
                Reply::success(format!("Call answered with {}", status_code))
            }
            CommandOutcome::Registering => Reply::success("Registration started"),
        };
        Ok(reply)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.engine.status()
    }

    pub fn is_healthy(&self) -> bool {
        self.engine.status().is_healthy()
    }
}

/// HTTP status for a failed intent
pub fn http_status(error: &DomainError) -> u16 {
    match error {
        DomainError::ValidationError(_) => 400,
        DomainError::InvalidState(_) | DomainError::AlreadyTerminated => 409,
        DomainError::NotRunning => 503,
        _ => 500,
    }
}
