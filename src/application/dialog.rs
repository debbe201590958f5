//! Call control
//!
//! Drives the [`Dialog`] aggregate through the INVITE / ACK / BYE / CANCEL /
//! INFO exchanges of the single call the softphone can have at a time.
//! Everything runs on the engine task; the controller never blocks and never
//! spawns, it only talks to the transaction layer through [`SipContext`].

use crate::application::context::{LocalIdentity, SipContext, TimerKey};
use crate::application::media::AudioDeviceManager;
use crate::domain::call::dtmf::DEFAULT_TONE_DURATION;
use crate::domain::call::{
    AckReceipt, CallDirection, CallEvent, Dialog, DialogState, DtmfDigit, EndReason,
};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{generate_tag, CallId, SipUri};
use crate::infrastructure::protocols::sip::builder::{cancel_for, ALLOW};
use crate::infrastructure::protocols::sip::{
    DigestChallenge, OutgoingMessage, RequestBuilder, ResponseBuilder, ResponseMatch,
    SdpSession, ServerMatch, SipError, SipHeaders, SipMethod, SipRequest, SipResponse,
    TransactionFailure, TransactionId, TransactionOwner,
};
use metrics::{counter, gauge};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SDP_CONTENT_TYPE: &str = "application/sdp";
const DTMF_CONTENT_TYPE: &str = "application/dtmf-relay";

/// Protocol state of a call around its [`Dialog`]
#[derive(Debug)]
pub struct CallSession {
    dialog: Dialog,
    /// From (outgoing) / To (incoming) URI of our side
    local_party: String,
    remote_party: String,
    local_tag: String,
    remote_tag: Option<String>,
    local_cseq: u32,
    /// Request-URI of in-dialog requests
    remote_target: String,
    /// Where in-dialog requests go
    peer: SocketAddr,
    /// Our INVITE (outgoing) or the one we received (incoming)
    invite: Option<SipRequest>,
    invite_txn: Option<TransactionId>,
    cancel_sent: bool,
    /// BYE owed as soon as the 2xx/ACK exchange completes
    bye_pending: bool,
    /// 2xx sent for an incoming INVITE
    answered: bool,
    auth_retried: bool,
    dtmf_queue: VecDeque<DtmfDigit>,
    info_txn: Option<TransactionId>,
    bye_txn: Option<TransactionId>,
    /// ACK for the 2xx, resent when the 2xx is retransmitted
    ack: Option<SipRequest>,
    local_sdp: Option<SdpSession>,
    remote_sdp: Option<SdpSession>,
    received_dtmf: Vec<DtmfDigit>,
}

impl CallSession {
    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn call_id(&self) -> &CallId {
        self.dialog.id()
    }

    /// RTP address from the peer's session description
    pub fn remote_media(&self) -> Option<SocketAddr> {
        self.remote_sdp.as_ref().and_then(|sdp| sdp.audio_addr())
    }

    /// Digits received through INFO, in arrival order
    pub fn received_dtmf(&self) -> String {
        self.received_dtmf.iter().map(|d| d.to_char()).collect()
    }

    /// Digits still waiting to be sent
    pub fn pending_dtmf(&self) -> usize {
        self.dtmf_queue.len() + usize::from(self.info_txn.is_some())
    }

    fn owner(&self) -> TransactionOwner {
        TransactionOwner::Dialog(self.dialog.id().clone())
    }

    fn is_call(&self, call_id: Option<&str>) -> bool {
        call_id == Some(self.dialog.id().as_str())
    }

    /// Next in-dialog request, CSeq already advanced
    fn in_dialog_request(&mut self, method: SipMethod, identity: &LocalIdentity) -> RequestBuilder {
        self.local_cseq += 1;
        RequestBuilder::new(method, self.remote_target.clone())
            .via(identity.via_host())
            .from(self.local_party.clone(), self.local_tag.clone())
            .to(self.remote_party.clone(), self.remote_tag.clone())
            .call_id(self.dialog.id().as_str())
            .cseq(self.local_cseq)
            .contact(identity.contact_uri())
    }

    fn build_invite(
        &mut self,
        identity: &LocalIdentity,
        authorization: Option<(&str, String)>,
    ) -> std::result::Result<SipRequest, SipError> {
        self.local_cseq += 1;
        let offer = self
            .local_sdp
            .as_ref()
            .map(|sdp| sdp.to_string())
            .unwrap_or_default();

        let mut builder = RequestBuilder::new(SipMethod::Invite, self.remote_target.clone())
            .via(identity.via_host())
            .from(self.local_party.clone(), self.local_tag.clone())
            .to(self.remote_party.clone(), None)
            .call_id(self.dialog.id().as_str())
            .cseq(self.local_cseq)
            .contact(identity.contact_uri())
            .header("Allow", ALLOW);
        if let Some((name, value)) = authorization {
            builder = builder.header(name, value);
        }
        builder.body(SDP_CONTENT_TYPE, offer).build()
    }

    /// ACK for a 2xx: new branch, CSeq number of the INVITE (RFC 3261 13.2.2.4)
    fn ack_for_success(&self, identity: &LocalIdentity) -> std::result::Result<SipRequest, SipError> {
        let (cseq, _) = self
            .invite
            .as_ref()
            .and_then(|invite| invite.cseq())
            .ok_or_else(|| SipError::InvalidMessage("No INVITE to acknowledge".to_string()))?;

        RequestBuilder::new(SipMethod::Ack, self.remote_target.clone())
            .via(identity.via_host())
            .from(self.local_party.clone(), self.local_tag.clone())
            .to(self.remote_party.clone(), self.remote_tag.clone())
            .call_id(self.dialog.id().as_str())
            .cseq(cseq)
            .build()
    }
}

/// Owns the current call and applies commands, responses, incoming requests
/// and transaction failures to it
pub struct CallController {
    current: Option<CallSession>,
    audio: Arc<dyn AudioDeviceManager>,
    /// Status code sent automatically to incoming INVITEs
    auto_answer: Option<u16>,
    last_error: Option<String>,
}

impl CallController {
    pub fn new(audio: Arc<dyn AudioDeviceManager>, auto_answer: Option<u16>) -> Self {
        Self {
            current: None,
            audio,
            auto_answer,
            last_error: None,
        }
    }

    /// The current call, terminated or not
    pub fn current(&self) -> Option<&CallSession> {
        self.current.as_ref()
    }

    /// The current call while it is not terminated
    pub fn active(&self) -> Option<&CallSession> {
        self.current.as_ref().filter(|s| s.dialog.is_active())
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    pub fn take_events(&mut self) -> Vec<CallEvent> {
        self.current
            .as_mut()
            .map(|s| s.dialog.take_events())
            .unwrap_or_default()
    }

    /// Send an INVITE to `destination` (a number, user or full `sip:` URI)
    pub async fn originate(&mut self, ctx: &mut SipContext, destination: &str) -> Result<CallId> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(DomainError::ValidationError(
                "destination is required".to_string(),
            ));
        }
        if let Some(active) = self.active() {
            return Err(DomainError::InvalidState(format!(
                "Call {} is already {}",
                active.call_id(),
                active.dialog.state()
            )));
        }

        let identity = &ctx.identity;
        let target = SipUri::for_destination(destination, &identity.domain)
            .map_err(DomainError::ValidationError)?;
        let local_ip = identity.local_addr.ip();
        let call_id = CallId::generate(&local_ip.to_string());

        let mut session = CallSession {
            dialog: Dialog::new(
                call_id.clone(),
                CallDirection::Outgoing,
                identity.aor.clone(),
                target.clone(),
            ),
            local_party: identity.aor.to_string(),
            remote_party: target.to_string(),
            local_tag: generate_tag(),
            remote_tag: None,
            local_cseq: 0,
            remote_target: target.to_string(),
            peer: identity.server_addr,
            invite: None,
            invite_txn: None,
            cancel_sent: false,
            bye_pending: false,
            answered: false,
            auth_retried: false,
            dtmf_queue: VecDeque::new(),
            info_txn: None,
            bye_txn: None,
            ack: None,
            local_sdp: Some(SdpSession::create_audio_session(local_ip, identity.rtp_port)),
            remote_sdp: None,
            received_dtmf: Vec::new(),
        };
        let invite = session.build_invite(identity, None)?;
        session.dialog.start_calling()?;

        info!("Calling {} (call {})", target, call_id);
        counter!("sip_calls_total").increment(1);
        gauge!("sip_active_calls").set(1.0);
        self.current = Some(session);

        self.send_invite(ctx, invite).await?;
        Ok(call_id)
    }

    async fn send_invite(&mut self, ctx: &mut SipContext, invite: SipRequest) -> Result<()> {
        let Some(session) = self.current.as_mut() else {
            return Err(DomainError::Internal("No call to send INVITE for".to_string()));
        };
        let owner = session.owner();
        let peer = session.peer;
        session.invite = Some(invite.clone());

        match ctx.send_request(invite, peer, owner).await {
            Ok(txn) => {
                session.invite_txn = Some(txn);
                Ok(())
            }
            Err(e) => {
                self.terminate(ctx, EndReason::TransportFailure).await;
                Err(e)
            }
        }
    }

    /// End the current call in whatever way its state calls for
    pub async fn hangup(&mut self, ctx: &mut SipContext) -> Result<()> {
        let Some((state, direction, answered)) = self
            .current
            .as_ref()
            .map(|s| (s.dialog.state(), s.dialog.direction(), s.answered))
        else {
            debug!("Hangup without a call");
            return Ok(());
        };

        match state {
            DialogState::Terminated => Err(DomainError::AlreadyTerminated),
            DialogState::Disconnecting => Ok(()),
            DialogState::Confirmed => self.send_bye(ctx).await,
            _ if direction == CallDirection::Outgoing => self.send_cancel(ctx).await,
            _ if answered => self.defer_bye(),
            _ => self.reject(ctx, 603).await,
        }
    }

    /// Our 2xx is out but the ACK has not arrived: BYE once it does
    fn defer_bye(&mut self) -> Result<()> {
        let Some(session) = self.current.as_mut() else {
            return Ok(());
        };
        info!(
            "Call {} not acknowledged yet, BYE deferred until ACK",
            session.call_id()
        );
        session.bye_pending = true;
        session.dialog.begin_disconnect()
    }

    async fn send_bye(&mut self, ctx: &mut SipContext) -> Result<()> {
        let Some(session) = self.current.as_mut() else {
            return Ok(());
        };
        if session.dialog.state() != DialogState::Disconnecting {
            session.dialog.begin_disconnect()?;
        }
        session.bye_pending = false;
        session.dtmf_queue.clear();

        let bye = session.in_dialog_request(SipMethod::Bye, &ctx.identity).build()?;
        let owner = session.owner();
        let peer = session.peer;
        info!("Sending BYE for call {}", session.call_id());

        match ctx.send_request(bye, peer, owner).await {
            Ok(txn) => {
                session.bye_txn = Some(txn);
                Ok(())
            }
            Err(e) => {
                self.terminate(ctx, EndReason::TransportFailure).await;
                Err(e)
            }
        }
    }

    async fn send_cancel(&mut self, ctx: &mut SipContext) -> Result<()> {
        let Some(session) = self.current.as_mut() else {
            return Ok(());
        };
        if session.cancel_sent {
            return Ok(());
        }
        let invite = session
            .invite
            .as_ref()
            .ok_or_else(|| DomainError::Internal("No INVITE to cancel".to_string()))?;
        let cancel = cancel_for(invite)?;

        session.cancel_sent = true;
        session.dialog.begin_disconnect()?;
        let owner = session.owner();
        let peer = session.peer;
        info!("Cancelling call {}", session.call_id());

        if let Err(e) = ctx.send_request(cancel, peer, owner).await {
            self.terminate(ctx, EndReason::TransportFailure).await;
            return Err(e);
        }
        let wait = ctx.layer.timers().t1 * 64;
        ctx.timers.arm(TimerKey::CancelTimeout, wait);
        Ok(())
    }

    /// The cancelled INVITE never got its final response
    pub async fn on_cancel_timeout(&mut self, ctx: &mut SipContext) {
        let Some(session) = self.active().filter(|s| s.cancel_sent) else {
            return;
        };
        warn!(
            "No final response to cancelled INVITE for call {}, giving up",
            session.call_id()
        );
        self.terminate(ctx, EndReason::Canceled).await;
    }

    /// Final non-2xx to the incoming INVITE
    async fn reject(&mut self, ctx: &mut SipContext, status: u16) -> Result<()> {
        let Some(session) = self.current.as_mut() else {
            return Ok(());
        };
        let (Some(invite), Some(txn)) = (session.invite.clone(), session.invite_txn.clone()) else {
            return Err(DomainError::Internal("No INVITE to reject".to_string()));
        };
        let response = ResponseBuilder::new(status)
            .to_tag(session.local_tag.clone())
            .build_for_request(&invite)?;
        info!("Declining call {} with {}", session.call_id(), status);

        let sent = ctx.send_response(&txn, response).await;
        self.terminate(ctx, EndReason::Declined(status)).await;
        sent
    }

    /// Answer the ringing incoming call. 2xx accepts (with an SDP answer),
    /// 3xx-6xx declines.
    pub async fn answer(&mut self, ctx: &mut SipContext, status_code: u16) -> Result<()> {
        if !(200..700).contains(&status_code) {
            return Err(DomainError::ValidationError(format!(
                "status_code {} is not a final response",
                status_code
            )));
        }

        let Some(session) = self.current.as_mut().filter(|s| s.dialog.is_active()) else {
            return Err(DomainError::InvalidState("No incoming call to answer".to_string()));
        };
        if session.dialog.direction() != CallDirection::Incoming
            || session.answered
            || !session.dialog.state().is_early()
        {
            return Err(DomainError::InvalidState(format!(
                "Call {} cannot be answered in {}",
                session.call_id(),
                session.dialog.state()
            )));
        }

        if status_code >= 300 {
            return self.reject(ctx, status_code).await;
        }

        let local_ip = ctx.identity.local_addr.ip();
        let rtp_port = ctx.identity.rtp_port;
        let contact = ctx.identity.contact_uri();

        let Some(session) = self.current.as_mut() else {
            return Ok(());
        };
        let (Some(invite), Some(txn)) = (session.invite.clone(), session.invite_txn.clone()) else {
            return Err(DomainError::Internal("No INVITE to answer".to_string()));
        };

        // An INVITE without an offer gets our offer in the 2xx
        let negotiated = session
            .remote_sdp
            .as_ref()
            .map(|offer| SdpSession::answer(offer, local_ip, rtp_port));
        let local_sdp = match negotiated {
            Some(Some(answer)) => answer,
            Some(None) => {
                warn!("No common codec with call {}", session.call_id());
                return self.reject(ctx, 488).await;
            }
            None => SdpSession::create_audio_session(local_ip, rtp_port),
        };

        let response = ResponseBuilder::new(status_code)
            .to_tag(session.local_tag.clone())
            .contact(&contact)
            .header("Allow", ALLOW)
            .body(SDP_CONTENT_TYPE, local_sdp.to_string().into_bytes())
            .build_for_request(&invite)?;
        session.local_sdp = Some(local_sdp);
        session.answered = true;
        info!("Answering call {} with {}", session.call_id(), status_code);

        if let Err(e) = ctx.send_response(&txn, response).await {
            self.terminate(ctx, EndReason::TransportFailure).await;
            return Err(e);
        }
        Ok(())
    }

    /// Queue DTMF digits on the confirmed call. Returns how many were queued.
    pub async fn send_dtmf(&mut self, ctx: &mut SipContext, digits: &str) -> Result<usize> {
        let digits = DtmfDigit::parse_digits(digits)?;

        let session = self
            .current
            .as_mut()
            .filter(|s| s.dialog.state() == DialogState::Confirmed)
            .ok_or_else(|| {
                DomainError::InvalidState("DTMF requires a confirmed call".to_string())
            })?;

        let count = digits.len();
        session.dtmf_queue.extend(digits);
        let idle = session.info_txn.is_none();
        debug!("Queued {} DTMF digits on call {}", count, session.call_id());

        if idle {
            self.send_next_dtmf(ctx).await?;
        }
        Ok(count)
    }

    /// One INFO in flight at a time
    async fn send_next_dtmf(&mut self, ctx: &mut SipContext) -> Result<()> {
        let Some(session) = self.current.as_mut() else {
            return Ok(());
        };
        if session.dialog.state() != DialogState::Confirmed {
            session.dtmf_queue.clear();
            return Ok(());
        }
        let Some(digit) = session.dtmf_queue.pop_front() else {
            return Ok(());
        };

        let info = session
            .in_dialog_request(SipMethod::Info, &ctx.identity)
            .body(DTMF_CONTENT_TYPE, digit.info_body(DEFAULT_TONE_DURATION))
            .build()?;
        let owner = session.owner();
        let peer = session.peer;
        debug!("Sending DTMF {} on call {}", digit.to_char(), session.call_id());

        match ctx.send_request(info, peer, owner).await {
            Ok(txn) => {
                session.info_txn = Some(txn);
                Ok(())
            }
            Err(e) => {
                self.terminate(ctx, EndReason::TransportFailure).await;
                Err(e)
            }
        }
    }

    /// Media layer callback
    pub async fn media_state_changed(&mut self, call_id: &CallId, active: bool) -> Result<()> {
        let session = self
            .current
            .as_mut()
            .filter(|s| s.dialog.id() == call_id)
            .ok_or_else(|| DomainError::InvalidState(format!("Unknown call {}", call_id)))?;

        if !session.dialog.set_media_active(active)? {
            return Ok(());
        }
        let remote = session.remote_media();
        info!("Media on call {} is now {}", call_id, if active { "active" } else { "inactive" });

        if active {
            self.audio.connect_call(call_id, remote).await
        } else {
            self.audio.disconnect_call(call_id).await
        }
    }

    /// Response matched to one of the call's client transactions
    pub async fn on_response(
        &mut self,
        ctx: &mut SipContext,
        matched: &ResponseMatch,
        response: &SipResponse,
    ) {
        let Some(session) = self.active() else {
            debug!("Response for ended call ignored");
            return;
        };
        if session.owner() != matched.owner {
            debug!("Response for another call ignored ({})", matched.id);
            return;
        }

        let status = response.status_code();
        match matched.id.method {
            SipMethod::Invite => self.on_invite_response(ctx, matched, response).await,
            SipMethod::Cancel if status >= 300 => {
                warn!("CANCEL rejected with {}", status);
                self.terminate(ctx, EndReason::Canceled).await;
            }
            SipMethod::Bye if status >= 200 => {
                if status >= 300 {
                    warn!("BYE answered with {}", status);
                }
                self.terminate(ctx, EndReason::LocalHangup).await;
            }
            SipMethod::Info if status >= 200 => {
                self.on_info_response(ctx, &matched.id, status).await
            }
            _ => {}
        }
    }

    async fn on_invite_response(
        &mut self,
        ctx: &mut SipContext,
        matched: &ResponseMatch,
        response: &SipResponse,
    ) {
        let current = self
            .current
            .as_ref()
            .map(|s| s.invite_txn.as_ref() == Some(&matched.id))
            .unwrap_or(false);
        if !current {
            debug!("Response for superseded INVITE {}", matched.id);
            return;
        }

        let status = response.status_code();
        match status {
            100 => {}
            101..=199 => self.on_provisional(response),
            200..=299 => self.on_invite_success(ctx, response).await,
            401 | 407 => self.on_invite_challenge(ctx, response).await,
            _ => {
                let reason = match self.current.as_ref() {
                    Some(s) if s.cancel_sent => EndReason::Canceled,
                    _ => EndReason::Rejected(status),
                };
                info!("INVITE answered with {}", status);
                self.terminate(ctx, reason).await;
            }
        }
    }

    fn on_provisional(&mut self, response: &SipResponse) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        if !session.dialog.state().is_early() {
            return;
        }

        let status = response.status_code();
        let sdp = sdp_body(response.content_type(), response.body());
        let result = if status == 183 || sdp.is_some() {
            if sdp.is_some() {
                session.remote_sdp = sdp;
            }
            session.dialog.early_media()
        } else if (180..=182).contains(&status) {
            session.dialog.ring()
        } else {
            Ok(())
        };

        match result {
            Ok(()) => debug!("Call {} is {}", session.call_id(), session.dialog.state()),
            Err(e) => warn!("Ignoring {} on call {}: {}", status, session.call_id(), e),
        }
    }

    async fn on_invite_success(&mut self, ctx: &mut SipContext, response: &SipResponse) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        session.remote_tag = response.to_tag();
        if let Some(contact) = response.contact_uri() {
            session.remote_target = contact;
        }
        if let Some(sdp) = sdp_body(response.content_type(), response.body()) {
            session.remote_sdp = Some(sdp);
        }
        session.invite_txn = None;
        ctx.timers.cancel(&TimerKey::CancelTimeout);

        let ack = match session.ack_for_success(&ctx.identity) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Cannot build ACK for call {}: {}", session.call_id(), e);
                self.terminate(ctx, EndReason::TransportFailure).await;
                return;
            }
        };
        let outgoing = OutgoingMessage::new(ack.to_bytes(), session.peer);
        session.ack = Some(ack);

        if let Err(e) = ctx.send(outgoing).await {
            warn!("ACK could not be sent: {}", e);
            self.terminate(ctx, EndReason::TransportFailure).await;
            return;
        }

        let Some(session) = self.current.as_mut() else {
            return;
        };
        if session.cancel_sent || session.bye_pending {
            info!("Call {} answered after hangup, sending BYE", session.call_id());
            if let Err(e) = self.send_bye(ctx).await {
                warn!("BYE after late 2xx failed: {}", e);
            }
            return;
        }

        match session.dialog.confirm(AckReceipt::new()) {
            Ok(()) => info!("Call {} confirmed", session.call_id()),
            Err(e) => warn!("Call {} not confirmed: {}", session.call_id(), e),
        }
    }

    /// 401/407 to our INVITE: resend once with credentials
    async fn on_invite_challenge(&mut self, ctx: &mut SipContext, response: &SipResponse) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        if session.cancel_sent {
            self.terminate(ctx, EndReason::Canceled).await;
            return;
        }
        if session.auth_retried {
            warn!("INVITE for call {} challenged again", session.call_id());
            self.terminate(ctx, EndReason::AuthFailure).await;
            return;
        }

        let challenge = match DigestChallenge::from_response(response) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("Unusable INVITE challenge: {}", e);
                self.terminate(ctx, EndReason::AuthFailure).await;
                return;
            }
        };

        let authorization = challenge.authorize(
            &ctx.identity.credentials,
            SipMethod::Invite.as_str(),
            &session.remote_target,
        );
        session.auth_retried = true;

        let invite = match session.build_invite(
            &ctx.identity,
            Some((challenge.kind.response_header(), authorization)),
        ) {
            Ok(invite) => invite,
            Err(e) => {
                warn!("Cannot build authenticated INVITE: {}", e);
                self.terminate(ctx, EndReason::AuthFailure).await;
                return;
            }
        };

        info!("Resending INVITE for call {} with credentials", session.call_id());
        if let Err(e) = self.send_invite(ctx, invite).await {
            warn!("Authenticated INVITE failed: {}", e);
        }
    }

    async fn on_info_response(&mut self, ctx: &mut SipContext, id: &TransactionId, status: u16) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        if session.info_txn.as_ref() != Some(id) {
            return;
        }
        session.info_txn = None;

        match status {
            408 | 481 => {
                warn!("INFO on call {} answered {}, dialog is gone", session.call_id(), status);
                self.terminate(ctx, EndReason::DialogGone(status)).await;
                return;
            }
            200..=299 => {}
            _ => warn!("DTMF INFO rejected with {}", status),
        }

        if let Err(e) = self.send_next_dtmf(ctx).await {
            warn!("Sending next DTMF digit failed: {}", e);
        }
    }

    /// Response that matched no transaction. A retransmitted 2xx to our
    /// INVITE means the ACK got lost.
    pub async fn on_stray_response(&mut self, ctx: &mut SipContext, response: &SipResponse) {
        let is_invite_success = response.is_success()
            && response.cseq().map(|(_, method)| method) == Some(SipMethod::Invite);
        if !is_invite_success {
            debug!("Stray {} response dropped", response.status_code());
            return;
        }

        let Some(session) = self.current.as_ref() else {
            return;
        };
        if !session.is_call(response.call_id().as_deref()) {
            return;
        }
        if let Some(ack) = &session.ack {
            debug!("Resending ACK for call {}", session.call_id());
            if let Err(e) = ctx.send(OutgoingMessage::new(ack.to_bytes(), session.peer)).await {
                warn!("ACK resend failed: {}", e);
            }
        }
    }

    /// A call transaction ran out of retransmissions or never saw its ACK
    pub async fn on_transaction_failure(
        &mut self,
        ctx: &mut SipContext,
        id: &TransactionId,
        owner: &TransactionOwner,
        reason: TransactionFailure,
    ) {
        let Some(session) = self.active() else {
            return;
        };
        if &session.owner() != owner {
            return;
        }

        warn!("Call {} transaction {} failed: {:?}", session.call_id(), id, reason);
        let end = match reason {
            TransactionFailure::Timeout => EndReason::TransportFailure,
            TransactionFailure::AckTimeout => EndReason::AckTimeout,
        };
        self.terminate(ctx, end).await;
    }

    /// Incoming request from the transport
    pub async fn on_request(&mut self, ctx: &mut SipContext, request: SipRequest, source: SocketAddr) {
        let matched = match ctx.layer.on_request(&request, source) {
            Ok(matched) => matched,
            Err(e) => {
                if request.method().is_none() && request.branch().is_some() {
                    reply_stateless(ctx, &request, source, 501).await;
                } else {
                    debug!("Dropping request {}: {}", request.method_name(), e);
                }
                return;
            }
        };

        match matched {
            ServerMatch::Retransmission(Some(replay)) => {
                if let Err(e) = ctx.send(replay).await {
                    warn!("Response replay failed: {}", e);
                }
            }
            ServerMatch::Retransmission(None) | ServerMatch::AckAbsorbed => {}
            ServerMatch::Ack => self.on_ack(ctx, &request).await,
            ServerMatch::New(id) => match id.method {
                SipMethod::Invite => self.on_invite(ctx, id, request, source).await,
                SipMethod::Bye => self.on_bye(ctx, &id, &request).await,
                SipMethod::Cancel => self.on_cancel(ctx, &id, &request).await,
                SipMethod::Info => self.on_info(ctx, &id, &request).await,
                SipMethod::Options => {
                    let response = ResponseBuilder::ok()
                        .to_tag(generate_tag())
                        .header("Allow", ALLOW)
                        .header("Accept", SDP_CONTENT_TYPE);
                    respond(ctx, &id, &request, response).await;
                }
                _ => {
                    let response = ResponseBuilder::new(501)
                        .to_tag(generate_tag())
                        .header("Allow", ALLOW);
                    respond(ctx, &id, &request, response).await;
                }
            },
        }
    }

    async fn on_invite(
        &mut self,
        ctx: &mut SipContext,
        id: TransactionId,
        request: SipRequest,
        source: SocketAddr,
    ) {
        let call_id = request.call_id();

        if request.to_tag().is_some() {
            // Hold and renegotiation are not supported
            let known = self
                .active()
                .map(|s| s.is_call(call_id.as_deref()))
                .unwrap_or(false);
            let status = if known { 488 } else { 481 };
            info!("Rejecting re-INVITE with {}", status);
            respond(ctx, &id, &request, ResponseBuilder::new(status)).await;
            return;
        }

        if let Some(active) = self.active() {
            info!("Busy with call {}, rejecting incoming INVITE", active.call_id());
            respond(ctx, &id, &request, ResponseBuilder::new(486).to_tag(generate_tag())).await;
            return;
        }

        let (Some(call_id), Some(from), Some(to), Some(from_tag)) = (
            call_id,
            request.from_uri(),
            request.to_uri(),
            request.from_tag(),
        ) else {
            respond(ctx, &id, &request, ResponseBuilder::new(400).to_tag(generate_tag())).await;
            return;
        };
        let remote_uri = match SipUri::parse(&from) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Unsupported caller URI {}: {}", from, e);
                respond(ctx, &id, &request, ResponseBuilder::new(416).to_tag(generate_tag())).await;
                return;
            }
        };
        let local_uri = SipUri::parse(&to).unwrap_or_else(|_| ctx.identity.aor.clone());
        let call_id = CallId::from(call_id);

        let mut session = CallSession {
            dialog: Dialog::new(call_id.clone(), CallDirection::Incoming, local_uri, remote_uri),
            remote_target: request.contact_uri().unwrap_or_else(|| from.clone()),
            local_party: to,
            remote_party: from,
            local_tag: generate_tag(),
            remote_tag: Some(from_tag),
            local_cseq: 0,
            peer: source,
            invite: Some(request.clone()),
            invite_txn: Some(id.clone()),
            cancel_sent: false,
            bye_pending: false,
            answered: false,
            auth_retried: false,
            dtmf_queue: VecDeque::new(),
            info_txn: None,
            bye_txn: None,
            ack: None,
            local_sdp: None,
            remote_sdp: sdp_body(request.content_type(), request.body()),
            received_dtmf: Vec::new(),
        };
        if let Err(e) = session.dialog.ring() {
            warn!("Cannot ring incoming call {}: {}", call_id, e);
            return;
        }

        info!("Incoming call {} from {}", call_id, session.dialog.remote_uri());
        counter!("sip_calls_total").increment(1);
        gauge!("sip_active_calls").set(1.0);

        let ringing = ResponseBuilder::new(180)
            .to_tag(session.local_tag.clone())
            .contact(&ctx.identity.contact_uri())
            .build_for_request(&request);
        self.current = Some(session);

        match ringing {
            Ok(response) => {
                if let Err(e) = ctx.send_response(&id, response).await {
                    warn!("180 Ringing could not be sent: {}", e);
                    self.terminate(ctx, EndReason::TransportFailure).await;
                    return;
                }
            }
            Err(e) => warn!("Cannot build 180 Ringing: {}", e),
        }

        if let Some(code) = self.auto_answer {
            info!("Auto-answering call {} with {}", call_id, code);
            if let Err(e) = self.answer(ctx, code).await {
                warn!("Auto-answer of call {} failed: {}", call_id, e);
            }
        }
    }

    /// ACK for our 2xx completes the incoming call
    async fn on_ack(&mut self, ctx: &mut SipContext, request: &SipRequest) {
        let Some(session) = self.current.as_mut().filter(|s| s.dialog.is_active()) else {
            debug!("ACK without a call");
            return;
        };
        if !session.is_call(request.call_id().as_deref())
            || session.dialog.direction() != CallDirection::Incoming
            || !session.answered
        {
            debug!("ACK for unknown dialog dropped");
            return;
        }
        let Some(txn) = session.invite_txn.take() else {
            debug!("Duplicate ACK for call {}", session.call_id());
            return;
        };
        ctx.layer.terminate(&txn);
        ctx.timers.cancel(&TimerKey::Transaction(txn));

        if session.remote_sdp.is_none() {
            session.remote_sdp = sdp_body(request.content_type(), request.body());
        }

        if session.bye_pending {
            info!("ACK received for call {}, sending deferred BYE", session.call_id());
            if let Err(e) = self.send_bye(ctx).await {
                warn!("Deferred BYE failed: {}", e);
            }
            return;
        }

        match session.dialog.confirm(AckReceipt::new()) {
            Ok(()) => info!("Call {} confirmed", session.call_id()),
            Err(e) => warn!("Call {} not confirmed: {}", session.call_id(), e),
        }
    }

    async fn on_bye(&mut self, ctx: &mut SipContext, id: &TransactionId, request: &SipRequest) {
        let known = self
            .active()
            .map(|s| s.is_call(request.call_id().as_deref()))
            .unwrap_or(false);
        if !known {
            respond(ctx, id, request, ResponseBuilder::new(481)).await;
            return;
        }

        respond(ctx, id, request, ResponseBuilder::ok()).await;
        info!("Remote party hung up");
        self.terminate(ctx, EndReason::RemoteHangup).await;
    }

    async fn on_cancel(&mut self, ctx: &mut SipContext, id: &TransactionId, request: &SipRequest) {
        let Some(session) = self.current.as_ref().filter(|s| {
            s.dialog.is_active()
                && s.is_call(request.call_id().as_deref())
                && s.invite_txn.as_ref().map(|t| t.branch == id.branch).unwrap_or(false)
        }) else {
            respond(ctx, id, request, ResponseBuilder::new(481)).await;
            return;
        };

        // Too late to cancel once the 2xx is out
        let pending = match (&session.invite, &session.invite_txn) {
            (Some(invite), Some(txn)) if !session.answered => Some((
                invite.clone(),
                txn.clone(),
                ResponseBuilder::new(487).to_tag(session.local_tag.clone()),
            )),
            _ => None,
        };

        respond(ctx, id, request, ResponseBuilder::ok()).await;
        let Some((invite, txn, terminated)) = pending else {
            return;
        };

        info!("Caller cancelled the call");
        match terminated.build_for_request(&invite) {
            Ok(response) => {
                if let Err(e) = ctx.send_response(&txn, response).await {
                    warn!("487 could not be sent: {}", e);
                }
            }
            Err(e) => warn!("Cannot build 487: {}", e),
        }
        self.terminate(ctx, EndReason::RemoteCanceled).await;
    }

    async fn on_info(&mut self, ctx: &mut SipContext, id: &TransactionId, request: &SipRequest) {
        let Some(session) = self
            .current
            .as_mut()
            .filter(|s| s.dialog.is_active() && s.is_call(request.call_id().as_deref()))
        else {
            respond(ctx, id, request, ResponseBuilder::new(481)).await;
            return;
        };

        if let Some(digit) = DtmfDigit::from_info_body(&request.body_str()) {
            info!("Received DTMF {} on call {}", digit.to_char(), session.call_id());
            session.received_dtmf.push(digit);
        }
        respond(ctx, id, request, ResponseBuilder::ok()).await;
    }

    /// Move the current call to Terminated and release everything it holds
    pub async fn terminate(&mut self, ctx: &mut SipContext, reason: EndReason) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        if !session.dialog.is_active() {
            return;
        }
        if let Err(e) = session.dialog.terminate(reason.clone()) {
            warn!("Cannot terminate call {}: {}", session.call_id(), e);
            return;
        }

        session.dtmf_queue.clear();
        session.info_txn = None;
        session.bye_txn = None;
        session.bye_pending = false;
        ctx.abandon(&session.owner());
        ctx.timers.cancel(&TimerKey::CancelTimeout);
        let call_id = session.call_id().clone();

        info!("Call {} terminated: {}", call_id, reason);
        gauge!("sip_active_calls").set(0.0);
        if reason.is_failure() {
            counter!("sip_calls_failed", "reason" => reason.to_string()).increment(1);
            self.last_error = Some(format!("Call {}", reason));
        }

        if let Err(e) = self.audio.disconnect_call(&call_id).await {
            warn!("Audio disconnect for call {} failed: {}", call_id, e);
        }
    }
}

async fn respond(
    ctx: &mut SipContext,
    id: &TransactionId,
    request: &SipRequest,
    response: ResponseBuilder,
) {
    match response.build_for_request(request) {
        Ok(response) => {
            if let Err(e) = ctx.send_response(id, response).await {
                warn!("Response to {} could not be sent: {}", id, e);
            }
        }
        Err(e) => warn!("Cannot build response to {}: {}", id, e),
    }
}

/// Reply without a server transaction (unsupported methods)
async fn reply_stateless(ctx: &SipContext, request: &SipRequest, source: SocketAddr, status: u16) {
    let response = ResponseBuilder::new(status)
        .to_tag(generate_tag())
        .header("Allow", ALLOW)
        .build_for_request(request);
    match response {
        Ok(response) => {
            if let Err(e) = ctx.send(OutgoingMessage::new(response.to_bytes(), source)).await {
                warn!("Stateless {} could not be sent: {}", status, e);
            }
        }
        Err(e) => warn!("Cannot build stateless {}: {}", status, e),
    }
}

fn sdp_body(content_type: Option<String>, body: &[u8]) -> Option<SdpSession> {
    if body.is_empty() {
        return None;
    }
    if let Some(content_type) = content_type {
        if !content_type.to_ascii_lowercase().contains(SDP_CONTENT_TYPE) {
            return None;
        }
    }
    SdpSession::parse(&String::from_utf8_lossy(body))
}
