//! Shared plumbing for the engine's protocol handlers: transport, the
//! transaction layer and timer scheduling.

use crate::application::engine::EngineEvent;
use crate::domain::account::Credentials;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::SipUri;
use crate::infrastructure::protocols::sip::{
    OutgoingMessage, SipRequest, SipResponse, TransactionId, TransactionLayer, TransactionOwner,
    Transport,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a timer is for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Transaction(TransactionId),
    RegisterRefresh,
    RegisterExpiry,
    RegisterRetry,
    /// No final response to a cancelled INVITE within 64*T1
    CancelTimeout,
}

/// One-shot timers delivered as events on the engine queue.
///
/// Every arm gets a new generation; a timer that fires after it was
/// re-armed or cancelled carries a stale generation and is dropped.
pub struct Timers {
    events: mpsc::Sender<EngineEvent>,
    armed: HashMap<TimerKey, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl Timers {
    pub fn new(events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events,
            armed: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn arm(&mut self, key: TimerKey, delay: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = self.events.clone();
        let timer_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events
                .send(EngineEvent::Timer {
                    key: timer_key,
                    generation,
                })
                .await;
        });

        if let Some((_, old)) = self.armed.insert(key, (generation, handle)) {
            old.abort();
        }
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        if let Some((_, handle)) = self.armed.remove(key) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Accept a fired timer if it is still the armed one
    pub fn fire(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.armed.get(key) {
            Some((armed, _)) if *armed == generation => {
                self.armed.remove(key);
                true
            }
            _ => {
                debug!("Dropping stale timer {:?}", key);
                false
            }
        }
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }
}

/// Identity and addressing of the user agent
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Address-of-record, `sip:<extension>@<domain>`
    pub aor: SipUri,
    pub credentials: Credentials,
    pub domain: String,
    /// Address advertised in Via and Contact
    pub local_addr: SocketAddr,
    /// Registrar / proxy every out-of-dialog request goes to
    pub server_addr: SocketAddr,
    pub rtp_port: u16,
}

impl LocalIdentity {
    pub fn contact_uri(&self) -> String {
        match self.aor.user() {
            Some(user) => format!("sip:{}@{}", user, self.local_addr),
            None => format!("sip:{}", self.local_addr),
        }
    }

    pub fn via_host(&self) -> String {
        self.local_addr.to_string()
    }
}

pub struct SipContext {
    transport: Arc<dyn Transport>,
    pub layer: TransactionLayer,
    pub timers: Timers,
    pub identity: LocalIdentity,
}

impl SipContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        layer: TransactionLayer,
        timers: Timers,
        identity: LocalIdentity,
    ) -> Self {
        Self {
            transport,
            layer,
            timers,
            identity,
        }
    }

    /// Start a client transaction and put the request on the wire
    pub async fn send_request(
        &mut self,
        request: SipRequest,
        destination: SocketAddr,
        owner: TransactionOwner,
    ) -> Result<TransactionId> {
        let data = request.to_bytes();
        let id = self.layer.start_transaction(request, destination, owner)?;

        if let Err(e) = self.send(OutgoingMessage::new(data, destination)).await {
            self.layer.terminate(&id);
            return Err(e);
        }

        self.schedule(&id);
        Ok(id)
    }

    /// Send a response through its server transaction
    pub async fn send_response(&mut self, id: &TransactionId, response: SipResponse) -> Result<()> {
        let outgoing = self.layer.record_response(id, response)?;
        self.send(outgoing).await?;
        self.schedule(id);
        Ok(())
    }

    /// Send a message outside any transaction (ACK for 2xx, stateless replies)
    pub async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.transport.send(message).await.map_err(|e| {
            warn!("Send failed: {}", e);
            DomainError::from(e)
        })
    }

    /// Arm (or clear) the timer a transaction currently needs
    pub fn schedule(&mut self, id: &TransactionId) {
        let key = TimerKey::Transaction(id.clone());
        match self.layer.next_timer(id) {
            Some(delay) => self.timers.arm(key, delay),
            None => self.timers.cancel(&key),
        }
    }

    /// Stop everything an owner still has in flight
    pub fn abandon(&mut self, owner: &TransactionOwner) {
        for id in self.layer.abandon_owned_by(owner) {
            self.timers.cancel(&TimerKey::Transaction(id));
        }
    }

    pub async fn close(&mut self) {
        self.timers.cancel_all();
        self.transport.close().await;
    }
}
