//! Softphone engine
//!
//! A single task owns every piece of SIP state: the transaction layer, the
//! registration and the call. User commands, inbound datagrams, timer
//! expiries and media callbacks all arrive on one queue and are applied in
//! arrival order, so no state is ever shared across tasks.

use crate::application::bridge::{CallInfo, StatusSnapshot};
use crate::application::context::{LocalIdentity, SipContext, TimerKey, Timers};
use crate::application::dialog::CallController;
use crate::application::media::AudioDeviceManager;
use crate::application::registration::RegistrationManager;
use crate::config::Settings;
use crate::domain::account::{Account, Credentials};
use crate::domain::call::EndReason;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::events::DomainEvent;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, SipUri};
use crate::infrastructure::protocols::sip::{
    IncomingMessage, SipMessage, SipResponse, SipTimers, TimerOutcome, TransactionLayer,
    TransactionOwner, Transport,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Request from the control surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    MakeCall { destination: String },
    Hangup,
    SendDtmf { digits: String },
    Answer { status_code: u16 },
    Register,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    CallPlaced(CallId),
    HungUp,
    DtmfQueued { count: usize },
    Answered { status_code: u16 },
    Registering,
}

/// Everything the engine reacts to
#[derive(Debug)]
pub enum EngineEvent {
    Command(EngineCommand, oneshot::Sender<Result<CommandOutcome>>),
    Inbound(IncomingMessage),
    Timer { key: TimerKey, generation: u64 },
    MediaStateChanged { call_id: CallId, active: bool },
    Shutdown(oneshot::Sender<()>),
}

/// Static configuration of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub identity: LocalIdentity,
    pub timers: SipTimers,
    pub register_expires: Duration,
    pub register_retry_base: Duration,
    pub register_max_failures: u32,
    pub auto_answer: Option<u16>,
    pub shutdown_timeout: Duration,
    /// Server as configured, for status output
    pub server: String,
}

impl EngineConfig {
    /// Engine configuration for resolved addresses
    pub fn from_settings(
        settings: &Settings,
        local_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<Self> {
        let domain = settings.sip_domain().to_string();
        let aor = SipUri::parse(&format!("sip:{}@{}", settings.extension.trim(), domain))
            .map_err(DomainError::ValidationError)?;
        let auto_answer = settings
            .auto_answer_code()
            .map_err(|e| DomainError::ValidationError(e.to_string()))?;

        Ok(Self {
            identity: LocalIdentity {
                aor,
                credentials: Credentials::new(settings.extension.trim(), settings.password.clone()),
                domain,
                local_addr,
                server_addr,
                rtp_port: settings.rtp_port,
            },
            timers: settings.timers(),
            register_expires: settings.register_expires(),
            register_retry_base: settings.register_retry_base(),
            register_max_failures: settings.register_max_failures,
            auto_answer,
            shutdown_timeout: settings.shutdown_timeout(),
            server: settings.sip_server.trim().to_string(),
        })
    }
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    status: watch::Receiver<StatusSnapshot>,
}

impl EngineHandle {
    /// Run a command on the engine and wait for its outcome
    pub async fn command(&self, command: EngineCommand) -> Result<CommandOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.events
            .send(EngineEvent::Command(command, reply))
            .await
            .map_err(|_| DomainError::NotRunning)?;
        outcome.await.map_err(|_| DomainError::NotRunning)?
    }

    /// Last published snapshot
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Media layer reports the call's audio came up or went away
    pub async fn media_state_changed(&self, call_id: CallId, active: bool) -> Result<()> {
        self.events
            .send(EngineEvent::MediaStateChanged { call_id, active })
            .await
            .map_err(|_| DomainError::NotRunning)
    }

    /// Hang up, unregister and stop. Returns once the engine is done.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.events.send(EngineEvent::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
    }
}

pub struct Engine {
    ctx: SipContext,
    registration: RegistrationManager,
    calls: CallController,
    events: mpsc::Receiver<EngineEvent>,
    status: watch::Sender<StatusSnapshot>,
    server: String,
    shutdown_timeout: Duration,
    last_error: Option<String>,
    running: bool,
}

impl Engine {
    /// Start the engine task. Messages arriving on `inbound` are fed into
    /// the engine queue; registration starts right away.
    pub fn spawn(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        mut inbound: mpsc::Receiver<IncomingMessage>,
        audio: Arc<dyn AudioDeviceManager>,
    ) -> EngineHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if forward.send(EngineEvent::Inbound(message)).await.is_err() {
                    break;
                }
            }
            debug!("Inbound forwarder stopped");
        });

        let identity = config.identity;
        let account = Account::new(
            identity.aor.clone(),
            identity.credentials.clone(),
            config.register_expires,
            config.register_max_failures,
            &identity.local_addr.ip().to_string(),
        );
        let extension = identity.aor.user().unwrap_or_default().to_string();
        let (status_tx, status_rx) =
            watch::channel(StatusSnapshot::starting(config.server.clone(), extension));

        let engine = Engine {
            ctx: SipContext::new(
                transport,
                TransactionLayer::new(config.timers),
                Timers::new(events_tx.clone()),
                identity,
            ),
            registration: RegistrationManager::new(account, config.register_retry_base),
            calls: CallController::new(audio, config.auto_answer),
            events: events_rx,
            status: status_tx,
            server: config.server,
            shutdown_timeout: config.shutdown_timeout,
            last_error: None,
            running: true,
        };
        tokio::spawn(engine.run());

        EngineHandle {
            events: events_tx,
            status: status_rx,
        }
    }

    async fn run(mut self) {
        info!(
            "Softphone engine started for {}",
            self.registration.account().aor()
        );
        if let Err(e) = self.registration.register(&mut self.ctx).await {
            warn!("Initial registration failed: {}", e);
        }
        self.settle();

        while let Some(event) = self.events.recv().await {
            if let EngineEvent::Shutdown(done) = event {
                self.shutdown(vec![done]).await;
                return;
            }
            self.handle(event).await;
        }

        self.shutdown(Vec::new()).await;
    }

    async fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Command(command, reply) => {
                debug!("Command: {:?}", command);
                let result = self.execute(command).await;
                if let Err(e) = &result {
                    debug!("Command failed: {}", e);
                }
                let _ = reply.send(result);
            }
            EngineEvent::Inbound(incoming) => match incoming.message {
                SipMessage::Request(request) => {
                    self.calls.on_request(&mut self.ctx, request, incoming.source).await
                }
                SipMessage::Response(response) => self.on_response(response).await,
            },
            EngineEvent::Timer { key, generation } => self.on_timer(key, generation).await,
            EngineEvent::MediaStateChanged { call_id, active } => {
                if let Err(e) = self.calls.media_state_changed(&call_id, active).await {
                    warn!("Media state change for call {} ignored: {}", call_id, e);
                }
            }
            EngineEvent::Shutdown(done) => {
                let _ = done.send(());
            }
        }
        self.settle();
    }

    async fn execute(&mut self, command: EngineCommand) -> Result<CommandOutcome> {
        match command {
            EngineCommand::MakeCall { destination } => {
                if !self.registration.is_registered() {
                    return Err(DomainError::NotRunning);
                }
                let call_id = self.calls.originate(&mut self.ctx, &destination).await?;
                Ok(CommandOutcome::CallPlaced(call_id))
            }
            EngineCommand::Hangup => {
                self.calls.hangup(&mut self.ctx).await?;
                Ok(CommandOutcome::HungUp)
            }
            EngineCommand::SendDtmf { digits } => {
                let count = self.calls.send_dtmf(&mut self.ctx, &digits).await?;
                Ok(CommandOutcome::DtmfQueued { count })
            }
            EngineCommand::Answer { status_code } => {
                self.calls.answer(&mut self.ctx, status_code).await?;
                Ok(CommandOutcome::Answered { status_code })
            }
            EngineCommand::Register => {
                self.registration.register(&mut self.ctx).await?;
                Ok(CommandOutcome::Registering)
            }
        }
    }

    async fn on_response(&mut self, response: SipResponse) {
        let Some(matched) = self.ctx.layer.on_response(&response) else {
            self.calls.on_stray_response(&mut self.ctx, &response).await;
            return;
        };

        self.ctx.schedule(&matched.id);
        if let Some(ack) = matched.ack.clone() {
            if let Err(e) = self.ctx.send(ack).await {
                warn!("ACK for {} could not be sent: {}", matched.id, e);
            }
        }
        if matched.retransmission {
            return;
        }

        match &matched.owner {
            TransactionOwner::Registration => {
                self.registration
                    .on_response(&mut self.ctx, &matched, &response)
                    .await
            }
            TransactionOwner::Dialog(_) => {
                self.calls.on_response(&mut self.ctx, &matched, &response).await
            }
        }
    }

    async fn on_timer(&mut self, key: TimerKey, generation: u64) {
        if !self.ctx.timers.fire(&key, generation) {
            return;
        }

        let id = match key {
            TimerKey::Transaction(id) => id,
            TimerKey::CancelTimeout => {
                self.calls.on_cancel_timeout(&mut self.ctx).await;
                return;
            }
            other => {
                self.registration.on_timer(&mut self.ctx, &other).await;
                return;
            }
        };

        match self.ctx.layer.on_timeout(&id) {
            TimerOutcome::Retransmit(message) => {
                if let Err(e) = self.ctx.send(message).await {
                    warn!("Retransmission of {} failed: {}", id, e);
                }
                self.ctx.schedule(&id);
            }
            TimerOutcome::Failed {
                id, owner, reason, ..
            } => match owner {
                TransactionOwner::Registration => {
                    self.registration
                        .on_transaction_failure(&mut self.ctx, &id, reason)
                }
                TransactionOwner::Dialog(_) => {
                    self.calls
                        .on_transaction_failure(&mut self.ctx, &id, &owner, reason)
                        .await
                }
            },
            TimerOutcome::Removed | TimerOutcome::Ignored => self.ctx.schedule(&id),
        }
    }

    /// Collect errors and events of the last step and publish the snapshot
    fn settle(&mut self) {
        for event in self.calls.take_events() {
            debug!("{} for call {}", event.event_type(), event.call_id());
        }
        if let Some(error) = self.registration.take_error() {
            self.last_error = Some(error);
        }
        if let Some(error) = self.calls.take_error() {
            self.last_error = Some(error);
        }
        self.status.send_replace(self.snapshot());
    }

    fn snapshot(&self) -> StatusSnapshot {
        let account = self.registration.account();
        StatusSnapshot {
            running: self.running,
            registered: self.registration.is_registered(),
            registration_state: account.state(),
            registered_until: account.registered_until(),
            server: self.server.clone(),
            extension: account.aor().user().unwrap_or_default().to_string(),
            active_call_state: self.calls.active().map(|s| s.dialog().state()),
            call: self.calls.current().map(CallInfo::from_session),
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Hang up, unregister, give outstanding transactions a bounded time to
    /// finish, then stop
    async fn shutdown(&mut self, mut waiters: Vec<oneshot::Sender<()>>) {
        info!("Shutting down softphone engine");
        match self.calls.hangup(&mut self.ctx).await {
            Ok(()) | Err(DomainError::AlreadyTerminated) => {}
            Err(e) => warn!("Hangup during shutdown failed: {}", e),
        }
        if let Err(e) = self.registration.unregister(&mut self.ctx).await {
            warn!("Unregister during shutdown failed: {}", e);
        }
        self.settle();

        let deadline = Instant::now() + self.shutdown_timeout;
        while self.ctx.layer.pending_client_count() > 0 {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "Stopping with {} transactions still pending",
                        self.ctx.layer.pending_client_count()
                    );
                    break;
                }
                event = self.events.recv() => match event {
                    Some(EngineEvent::Command(_, reply)) => {
                        let _ = reply.send(Err(DomainError::NotRunning));
                    }
                    Some(EngineEvent::Shutdown(done)) => waiters.push(done),
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        self.calls.terminate(&mut self.ctx, EndReason::Shutdown).await;
        self.ctx.close().await;
        self.running = false;
        self.settle();
        info!("Softphone engine stopped");

        for done in waiters {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::media::NullAudioDevice;
    use crate::domain::account::RegistrationState;
    use crate::infrastructure::protocols::sip::{
        MemoryTransport, OutgoingMessage, ResponseBuilder, SipHeaders, SipMethod, SipRequest,
    };

    const SERVER: &str = "10.0.0.1:5060";

    fn config() -> EngineConfig {
        config_with(&[])
    }

    fn config_with(overrides: &[(&str, &str)]) -> EngineConfig {
        let settings = Settings::from_vars(
            [
                ("SIP_SERVER", "pbx.local"),
                ("EXTENSION", "100"),
                ("PASSWORD", "secret"),
            ]
            .iter()
            .chain(overrides)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        )
        .unwrap();
        EngineConfig::from_settings(
            &settings,
            "10.0.0.5:5060".parse().unwrap(),
            SERVER.parse().unwrap(),
        )
        .unwrap()
    }

    struct Phone {
        handle: EngineHandle,
        wire: mpsc::UnboundedReceiver<OutgoingMessage>,
        inbound: mpsc::Sender<IncomingMessage>,
    }

    impl Phone {
        fn start() -> Self {
            Self::start_with(&[])
        }

        fn start_with(overrides: &[(&str, &str)]) -> Self {
            let (transport, wire) = MemoryTransport::new("10.0.0.5:5060".parse().unwrap());
            let (inbound, inbound_rx) = mpsc::channel(16);
            let handle = Engine::spawn(
                config_with(overrides),
                Arc::new(transport),
                inbound_rx,
                Arc::new(NullAudioDevice),
            );
            Self {
                handle,
                wire,
                inbound,
            }
        }

        async fn next_request(&mut self) -> SipRequest {
            let message = self.wire.recv().await.unwrap();
            SipRequest::parse(&message.data).unwrap()
        }

        /// Next REGISTER with a CSeq above `after`, skipping retransmissions
        async fn next_register_after(&mut self, after: u32) -> SipRequest {
            loop {
                let request = self.next_request().await;
                assert_eq!(request.method(), Some(SipMethod::Register));
                if request.cseq().unwrap().0 > after {
                    return request;
                }
            }
        }

        async fn respond(&self, request: &SipRequest, status: u16) {
            self.respond_with(request, ResponseBuilder::new(status)).await;
        }

        async fn respond_with(&self, request: &SipRequest, response: ResponseBuilder) {
            let response = response
                .to_tag("registrar")
                .build_for_request(request)
                .unwrap();
            self.inbound
                .send(IncomingMessage {
                    message: SipMessage::Response(response),
                    source: SERVER.parse().unwrap(),
                })
                .await
                .unwrap();
        }

        async fn wait_for(&self, check: impl Fn(&StatusSnapshot) -> bool) -> StatusSnapshot {
            let mut status = self.handle.subscribe();
            loop {
                let snapshot = status.borrow_and_update().clone();
                if check(&snapshot) {
                    return snapshot;
                }
                status.changed().await.unwrap();
            }
        }
    }

    #[test]
    fn test_config_from_settings() {
        let config = config();
        assert_eq!(config.identity.aor.to_string(), "sip:100@pbx.local");
        assert_eq!(config.identity.contact_uri(), "sip:100@10.0.0.5:5060");
        assert_eq!(config.auto_answer, Some(200));
        assert_eq!(config.server, "pbx.local");
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_on_start_and_refreshes() {
        let mut phone = Phone::start();

        let register = phone.next_request().await;
        assert_eq!(register.method(), Some(SipMethod::Register));
        phone.respond(&register, 200).await;

        let snapshot = phone.wait_for(|s| s.registered).await;
        assert_eq!(snapshot.registration_state, RegistrationState::Registered);
        assert_eq!(snapshot.extension, "100");

        let started = Instant::now();
        let refresh = phone.next_request().await;
        assert_eq!(refresh.method(), Some(SipMethod::Register));
        assert_eq!(refresh.call_id(), register.call_id());
        // 90% of the 300 s binding
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(270) && elapsed < Duration::from_secs(271));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_register_backs_off_then_gives_up() {
        let mut phone = Phone::start();

        let first = phone.next_register_after(0).await;
        let started = Instant::now();

        // 11.5 s of Timer E retransmissions, then the 5 s backoff
        let second = phone.next_register_after(first.cseq().unwrap().0).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(16_500) && elapsed < Duration::from_secs(17));
        assert_eq!(second.call_id(), first.call_id());
        assert_eq!(phone.handle.status().registration_state, RegistrationState::Registering);

        let started = Instant::now();
        let third = phone.next_register_after(second.cseq().unwrap().0).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(21_500) && elapsed < Duration::from_secs(22));

        // Only retransmissions of the last attempt follow
        let last = third.cseq().unwrap().0;
        while let Ok(message) = tokio::time::timeout(Duration::from_secs(600), phone.wire.recv()).await
        {
            let request = SipRequest::parse(&message.unwrap().data).unwrap();
            assert_eq!(request.cseq().unwrap().0, last);
        }

        let snapshot = phone
            .wait_for(|s| s.registration_state == RegistrationState::Failed)
            .await;
        assert!(!snapshot.registered);
        assert!(snapshot.last_error.unwrap().contains("no response from registrar"));

        // Explicit register restarts the account
        let outcome = phone.handle.command(EngineCommand::Register).await;
        assert_eq!(outcome, Ok(CommandOutcome::Registering));
        let restart = phone.next_register_after(last).await;
        assert_eq!(phone.handle.status().registration_state, RegistrationState::Registering);

        phone.respond(&restart, 200).await;
        phone.wait_for(|s| s.registered).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_too_brief_retries_with_min_expires() {
        let mut phone = Phone::start();

        let register = phone.next_register_after(0).await;
        assert_eq!(register.header("Expires").as_deref(), Some("300"));
        phone
            .respond_with(&register, ResponseBuilder::new(423).header("Min-Expires", "600"))
            .await;

        let retry = phone.next_register_after(register.cseq().unwrap().0).await;
        assert_eq!(retry.header("Expires").as_deref(), Some("600"));
        phone.respond(&retry, 200).await;
        phone.wait_for(|s| s.registered).await;

        let started = Instant::now();
        phone.next_register_after(retry.cseq().unwrap().0).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(540) && elapsed < Duration::from_secs(541));
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_expires_when_refresh_goes_unanswered() {
        let mut phone = Phone::start_with(&[
            ("T1_MS", "60000"),
            ("T2_MS", "60000"),
            ("REGISTER_EXPIRES", "100"),
        ]);

        let register = phone.next_register_after(0).await;
        phone.respond(&register, 200).await;
        phone.wait_for(|s| s.registered).await;
        let started = Instant::now();

        let refresh = phone.next_register_after(register.cseq().unwrap().0).await;
        assert_eq!(refresh.call_id(), register.call_id());

        let snapshot = phone
            .wait_for(|s| s.registration_state == RegistrationState::Registering)
            .await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(100) && elapsed < Duration::from_secs(101));
        assert!(!snapshot.registered);
        assert!(snapshot.registered_until.is_none());
        assert_eq!(snapshot.last_error.as_deref(), Some("Registration expired"));

        // The refresh still in flight brings the binding back
        phone.respond(&refresh, 200).await;
        phone.wait_for(|s| s.registered).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_granted_expiry_keeps_engine_alive() {
        let mut phone = Phone::start();

        let register = phone.next_register_after(0).await;
        phone
            .respond_with(
                &register,
                ResponseBuilder::ok().header("Expires", "18446744073709551615"),
            )
            .await;
        let snapshot = phone.wait_for(|s| s.registered).await;
        assert!(snapshot.registered_until.is_some());

        tokio::time::sleep(Duration::from_secs(86_400)).await;
        assert_eq!(
            phone.handle.command(EngineCommand::Hangup).await,
            Ok(CommandOutcome::HungUp)
        );
        assert!(phone.handle.status().registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_make_call_requires_registration() {
        let phone = Phone::start();

        let result = phone
            .handle
            .command(EngineCommand::MakeCall {
                destination: "200".to_string(),
            })
            .await;
        assert_eq!(result, Err(DomainError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unregisters_and_stops() {
        let mut phone = Phone::start();
        let register = phone.next_request().await;
        phone.respond(&register, 200).await;
        phone.wait_for(|s| s.registered).await;

        let handle = phone.handle.clone();
        let stopping = tokio::spawn(async move { handle.shutdown().await });

        let unregister = phone.next_request().await;
        assert_eq!(unregister.header("Expires").as_deref(), Some("0"));
        phone.respond(&unregister, 200).await;
        stopping.await.unwrap();

        let snapshot = phone.handle.status();
        assert!(!snapshot.running);
        assert!(!snapshot.registered);
        assert_eq!(
            phone.handle.command(EngineCommand::Hangup).await,
            Err(DomainError::NotRunning)
        );
    }
}
