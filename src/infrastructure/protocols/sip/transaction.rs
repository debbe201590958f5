//! SIP Transaction Layer
//!
//! Implements client and server transactions as per RFC 3261 Section 17,
//! reduced to what a single user agent needs over UDP.
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2
//!
//! The layer owns no tasks. Every call returns what the engine must do next
//! (send bytes, arm a timer through [`TransactionLayer::next_timer`]) so all
//! state changes happen on the engine's queue.

use super::builder::ack_for_failure;
use super::message::{SipError, SipHeaders, SipMethod, SipRequest, SipResponse};
use super::transport::OutgoingMessage;
use crate::domain::shared::value_objects::CallId;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transaction ID - Via branch plus CSeq method, so a CANCEL and the INVITE
/// it cancels (same branch) are distinct transactions
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId {
    pub branch: String,
    pub method: SipMethod,
}

impl TransactionId {
    pub fn new(branch: impl Into<String>, method: SipMethod) -> Self {
        Self {
            branch: branch.into(),
            method,
        }
    }

    fn from_request(request: &SipRequest) -> Result<Self, SipError> {
        let branch = request
            .branch()
            .ok_or_else(|| SipError::InvalidMessage("Request has no Via branch".to_string()))?;
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidMessage(format!("Unsupported method {}", request.method_name())))?;
        Ok(Self::new(branch, method))
    }

    fn from_response(response: &SipResponse) -> Option<Self> {
        let branch = response.branch()?;
        let (_, method) = response.cseq()?;
        Some(Self::new(branch, method))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.method)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
    /// Request retransmissions before the transaction times out
    pub max_retransmits: u32,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            max_retransmits: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionKind {
    pub fn is_client(&self) -> bool {
        matches!(self, TransactionKind::InviteClient | TransactionKind::NonInviteClient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

impl TransactionState {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Terminated => "Terminated",
        }
    }
}

/// Who gets notified about responses and failures
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionOwner {
    Dialog(CallId),
    Registration,
}

/// Why a transaction gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFailure {
    /// Retransmission budget exhausted without a response
    Timeout,
    /// Our 2xx to an INVITE was never acknowledged
    AckTimeout,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    kind: TransactionKind,
    state: TransactionState,
    owner: TransactionOwner,
    request: SipRequest,
    /// Where requests (client) or responses (server) are sent
    destination: SocketAddr,
    retransmits: u32,
    interval: Duration,
    deadline: Option<Instant>,
    last_response: Option<SipResponse>,
    /// ACK for a non-2xx final, resent when the final is retransmitted
    ack: Option<SipRequest>,
}

impl Transaction {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn owner(&self) -> &TransactionOwner {
        &self.owner
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn retransmits(&self) -> u32 {
        self.retransmits
    }

    fn final_status(&self) -> Option<u16> {
        self.last_response
            .as_ref()
            .map(|r| r.status_code())
            .filter(|code| *code >= 200)
    }

    fn set_state(&mut self, state: TransactionState) {
        debug!(
            "Transaction {} {} -> {}",
            self.id,
            self.state.name(),
            state.name()
        );
        self.state = state;
    }
}

/// A response matched to a client transaction
#[derive(Debug, Clone)]
pub struct ResponseMatch {
    pub id: TransactionId,
    pub owner: TransactionOwner,
    /// The request this response answers
    pub request: SipRequest,
    /// Already seen; not to be delivered to the owner again
    pub retransmission: bool,
    /// ACK the engine must hand to the transport (non-2xx final to INVITE)
    pub ack: Option<OutgoingMessage>,
}

/// Classification of an incoming request
#[derive(Debug, Clone)]
pub enum ServerMatch {
    /// First copy of the request; a server transaction was created
    New(TransactionId),
    /// Retransmitted request; replay the last response if there is one
    Retransmission(Option<OutgoingMessage>),
    /// ACK for a non-2xx final response, absorbed by the transaction
    AckAbsorbed,
    /// ACK for a 2xx; belongs to the dialog, no transaction involved
    Ack,
}

/// What a fired transaction timer means
#[derive(Debug, Clone)]
pub enum TimerOutcome {
    /// Send these bytes again and re-arm with [`TransactionLayer::next_timer`]
    Retransmit(OutgoingMessage),
    /// The transaction gave up and was removed
    Failed {
        id: TransactionId,
        owner: TransactionOwner,
        request: SipRequest,
        reason: TransactionFailure,
    },
    /// Linger period over, transaction removed
    Removed,
    /// Unknown transaction (already gone)
    Ignored,
}

/// All live transactions of the user agent
#[derive(Debug, Default)]
pub struct TransactionLayer {
    timers: SipTimers,
    transactions: HashMap<TransactionId, Transaction>,
}

impl TransactionLayer {
    pub fn new(timers: SipTimers) -> Self {
        Self {
            timers,
            transactions: HashMap::new(),
        }
    }

    pub fn timers(&self) -> &SipTimers {
        &self.timers
    }

    /// Create a client transaction for a request about to be sent
    pub fn start_transaction(
        &mut self,
        request: SipRequest,
        destination: SocketAddr,
        owner: TransactionOwner,
    ) -> Result<TransactionId, SipError> {
        let id = TransactionId::from_request(&request)?;
        if id.method == SipMethod::Ack {
            return Err(SipError::TransactionError(
                "ACK does not create a transaction".to_string(),
            ));
        }
        if self.transactions.contains_key(&id) {
            return Err(SipError::TransactionError(format!(
                "Transaction {} already exists",
                id
            )));
        }

        let kind = if id.method == SipMethod::Invite {
            TransactionKind::InviteClient
        } else {
            TransactionKind::NonInviteClient
        };

        debug!("Starting {:?} transaction {} -> {}", kind, id, destination);
        self.transactions.insert(
            id.clone(),
            Transaction {
                id: id.clone(),
                kind,
                state: TransactionState::Trying,
                owner,
                request,
                destination,
                retransmits: 0,
                interval: self.timers.t1,
                deadline: None,
                last_response: None,
                ack: None,
            },
        );

        Ok(id)
    }

    /// Match a response to its client transaction
    pub fn on_response(&mut self, response: &SipResponse) -> Option<ResponseMatch> {
        let id = TransactionId::from_response(response)?;
        let t4 = self.timers.t4;
        let Some(txn) = self.transactions.get_mut(&id) else {
            debug!("No transaction for response {} ({})", response.status_code(), id);
            return None;
        };
        if !txn.kind.is_client() {
            return None;
        }

        let status = response.status_code();
        let mut ack = None;
        let retransmission;

        match txn.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                retransmission = false;
                if status < 200 {
                    txn.set_state(TransactionState::Proceeding);
                } else if txn.kind == TransactionKind::InviteClient && status < 300 {
                    // ACK for a 2xx is a dialog concern
                    txn.set_state(TransactionState::Terminated);
                } else {
                    if txn.kind == TransactionKind::InviteClient {
                        match ack_for_failure(&txn.request, response) {
                            Ok(request) => {
                                ack = Some(OutgoingMessage::new(request.to_bytes(), txn.destination));
                                txn.ack = Some(request);
                            }
                            Err(e) => warn!("Could not build ACK for {}: {}", id, e),
                        }
                    }
                    txn.deadline = Some(Instant::now() + t4);
                    txn.set_state(TransactionState::Completed);
                }
                txn.last_response = Some(response.clone());
            }
            TransactionState::Completed | TransactionState::Terminated => {
                retransmission = true;
                if status >= 200 {
                    ack = txn
                        .ack
                        .as_ref()
                        .map(|request| OutgoingMessage::new(request.to_bytes(), txn.destination));
                }
            }
        }

        let matched = ResponseMatch {
            id: id.clone(),
            owner: txn.owner.clone(),
            request: txn.request.clone(),
            retransmission,
            ack,
        };

        if txn.state == TransactionState::Terminated {
            self.transactions.remove(&id);
        }

        Some(matched)
    }

    /// Classify an incoming request, creating a server transaction for new ones
    pub fn on_request(
        &mut self,
        request: &SipRequest,
        source: SocketAddr,
    ) -> Result<ServerMatch, SipError> {
        let id = TransactionId::from_request(request)?;

        if id.method == SipMethod::Ack {
            let invite_id = TransactionId::new(id.branch.clone(), SipMethod::Invite);
            let t4 = self.timers.t4;
            if let Some(txn) = self.transactions.get_mut(&invite_id) {
                if txn.kind == TransactionKind::InviteServer
                    && txn.final_status().map(|s| s >= 300).unwrap_or(false)
                {
                    if txn.state == TransactionState::Completed {
                        // RFC 3261 "Confirmed": absorb ACK retransmissions for T4
                        txn.set_state(TransactionState::Terminated);
                        txn.deadline = Some(Instant::now() + t4);
                    }
                    return Ok(ServerMatch::AckAbsorbed);
                }
            }
            return Ok(ServerMatch::Ack);
        }

        if let Some(txn) = self.transactions.get(&id) {
            debug!("Retransmission of {} request {}", id.method, id);
            let replay = txn
                .last_response
                .as_ref()
                .map(|response| OutgoingMessage::new(response.to_bytes(), source));
            return Ok(ServerMatch::Retransmission(replay));
        }

        let kind = if id.method == SipMethod::Invite {
            TransactionKind::InviteServer
        } else {
            TransactionKind::NonInviteServer
        };
        let owner = match request.call_id() {
            Some(call_id) => TransactionOwner::Dialog(CallId::from(call_id)),
            None => TransactionOwner::Registration,
        };

        self.transactions.insert(
            id.clone(),
            Transaction {
                id: id.clone(),
                kind,
                state: TransactionState::Proceeding,
                owner,
                request: request.clone(),
                destination: source,
                retransmits: 0,
                interval: self.timers.t1,
                deadline: None,
                last_response: None,
                ack: None,
            },
        );

        Ok(ServerMatch::New(id))
    }

    /// Store a response sent by a server transaction and return the message
    /// to put on the wire
    pub fn record_response(
        &mut self,
        id: &TransactionId,
        response: SipResponse,
    ) -> Result<OutgoingMessage, SipError> {
        let timers = self.timers;
        let txn = self
            .transactions
            .get_mut(id)
            .ok_or_else(|| SipError::TransactionError(format!("No server transaction {}", id)))?;
        if txn.kind.is_client() {
            return Err(SipError::TransactionError(format!(
                "{} is a client transaction",
                id
            )));
        }

        let outgoing = OutgoingMessage::new(response.to_bytes(), txn.destination);
        let status = response.status_code();
        txn.last_response = Some(response);

        if status >= 200 {
            txn.set_state(TransactionState::Completed);
            txn.retransmits = 0;
            txn.interval = timers.t1;
            txn.deadline = Some(
                Instant::now()
                    + match txn.kind {
                        TransactionKind::InviteServer => timers.t1 * 64,
                        _ => timers.t4,
                    },
            );
        }

        Ok(outgoing)
    }

    /// Delay until the next timer of this transaction, if it needs one
    pub fn next_timer(&self, id: &TransactionId) -> Option<Duration> {
        let txn = self.transactions.get(id)?;
        let until_deadline = || {
            txn.deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        };

        match (txn.kind, txn.state) {
            (TransactionKind::InviteClient, TransactionState::Trying) => Some(txn.interval),
            (TransactionKind::InviteClient, TransactionState::Proceeding) => None,
            (TransactionKind::NonInviteClient, TransactionState::Trying)
            | (TransactionKind::NonInviteClient, TransactionState::Proceeding) => Some(txn.interval),
            (TransactionKind::InviteServer, TransactionState::Completed) => {
                // Retransmit the final response until ACK or deadline
                until_deadline().map(|left| left.min(txn.interval))
            }
            (_, TransactionState::Completed) | (_, TransactionState::Terminated) => until_deadline(),
            (_, _) => None,
        }
    }

    /// Handle a fired timer of a transaction
    pub fn on_timeout(&mut self, id: &TransactionId) -> TimerOutcome {
        let timers = self.timers;
        let now = Instant::now();
        let Some(txn) = self.transactions.get_mut(id) else {
            return TimerOutcome::Ignored;
        };

        match (txn.kind, txn.state) {
            (TransactionKind::InviteClient, TransactionState::Trying)
            | (TransactionKind::NonInviteClient, TransactionState::Trying)
            | (TransactionKind::NonInviteClient, TransactionState::Proceeding) => {
                if txn.retransmits < timers.max_retransmits {
                    txn.retransmits += 1;
                    txn.interval = (txn.interval * 2).min(timers.t2);
                    debug!("Retransmitting {} (attempt {})", id, txn.retransmits);
                    TimerOutcome::Retransmit(OutgoingMessage::new(
                        txn.request.to_bytes(),
                        txn.destination,
                    ))
                } else {
                    warn!(
                        "Transaction {} timed out after {} retransmissions",
                        id, txn.retransmits
                    );
                    self.fail(id, TransactionFailure::Timeout)
                }
            }
            (TransactionKind::InviteServer, TransactionState::Completed) => {
                let expired = txn.deadline.map(|d| now >= d).unwrap_or(true);
                if expired {
                    if txn.final_status().map(|s| s < 300).unwrap_or(false) {
                        warn!("No ACK received for 2xx of {}", id);
                        return self.fail(id, TransactionFailure::AckTimeout);
                    }
                    self.transactions.remove(id);
                    return TimerOutcome::Removed;
                }

                let Some(response) = txn.last_response.as_ref() else {
                    return TimerOutcome::Ignored;
                };
                txn.retransmits += 1;
                let outgoing = OutgoingMessage::new(response.to_bytes(), txn.destination);
                txn.interval = (txn.interval * 2).min(timers.t2);
                debug!("Retransmitting final response of {}", id);
                TimerOutcome::Retransmit(outgoing)
            }
            (_, TransactionState::Completed) | (_, TransactionState::Terminated) => {
                if txn.deadline.map(|d| now >= d).unwrap_or(true) {
                    self.transactions.remove(id);
                    TimerOutcome::Removed
                } else {
                    TimerOutcome::Ignored
                }
            }
            _ => TimerOutcome::Ignored,
        }
    }

    fn fail(&mut self, id: &TransactionId, reason: TransactionFailure) -> TimerOutcome {
        match self.transactions.remove(id) {
            Some(txn) => TimerOutcome::Failed {
                id: id.clone(),
                owner: txn.owner,
                request: txn.request,
                reason,
            },
            None => TimerOutcome::Ignored,
        }
    }

    /// Drop a transaction (ACK for our 2xx arrived, dialog went away)
    pub fn terminate(&mut self, id: &TransactionId) -> Option<Transaction> {
        self.transactions.remove(id)
    }

    /// Drop the transactions of an owner that still have work to do.
    /// Transactions lingering after a non-2xx final stay to absorb
    /// retransmissions and the ACK.
    pub fn abandon_owned_by(&mut self, owner: &TransactionOwner) -> Vec<TransactionId> {
        let ids: Vec<TransactionId> = self
            .transactions
            .values()
            .filter(|txn| &txn.owner == owner)
            .filter(|txn| match txn.state {
                TransactionState::Trying | TransactionState::Proceeding => true,
                TransactionState::Completed => {
                    txn.kind == TransactionKind::InviteServer
                        && txn.final_status().map(|s| s < 300).unwrap_or(false)
                }
                TransactionState::Terminated => false,
            })
            .map(|txn| txn.id.clone())
            .collect();
        for id in &ids {
            debug!("Abandoning transaction {}", id);
            self.transactions.remove(id);
        }
        ids
    }

    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    /// Client transactions still waiting for a final response
    pub fn pending_client_count(&self) -> usize {
        self.transactions
            .values()
            .filter(|txn| {
                txn.kind.is_client()
                    && matches!(txn.state, TransactionState::Trying | TransactionState::Proceeding)
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
