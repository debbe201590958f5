//! Registration manager: REGISTER lifecycle, digest challenges and refresh
//! scheduling for the single account.

use crate::application::context::{SipContext, TimerKey};
use crate::domain::account::{Account, FailureOutcome, RegistrationState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::infrastructure::protocols::sip::message::header_param;
use crate::infrastructure::protocols::sip::{
    DigestChallenge, RequestBuilder, ResponseMatch, SipHeaders, SipMethod, SipResponse,
    TransactionFailure, TransactionId, TransactionOwner,
};
use metrics::counter;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The REGISTER currently in flight
#[derive(Debug, Clone)]
struct PendingRegister {
    txn: TransactionId,
    /// Credentials already sent for this attempt
    authenticated: bool,
    /// Answers a `stale=true` challenge
    stale_retry: bool,
    /// Expires: 0 request
    unregister: bool,
}

pub struct RegistrationManager {
    account: Account,
    pending: Option<PendingRegister>,
    retry_base: Duration,
    last_error: Option<String>,
}

impl RegistrationManager {
    pub fn new(account: Account, retry_base: Duration) -> Self {
        Self {
            account,
            pending: None,
            retry_base,
            last_error: None,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn is_registered(&self) -> bool {
        self.account.is_registered(Instant::now())
    }

    /// Error recorded since the last call
    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    /// Unregister in flight
    pub fn is_unregistering(&self) -> bool {
        self.pending.as_ref().map(|p| p.unregister).unwrap_or(false)
    }

    /// Start registering. Restarts a `Failed` account.
    pub async fn register(&mut self, ctx: &mut SipContext) -> Result<()> {
        if self.pending.as_ref().map(|p| !p.unregister).unwrap_or(false) {
            debug!("REGISTER already in flight");
            return Ok(());
        }

        ctx.timers.cancel(&TimerKey::RegisterRetry);
        self.account.begin_registering();
        self.send_register(ctx, None, false).await
    }

    /// Refresh the binding before it runs out
    pub async fn refresh(&mut self, ctx: &mut SipContext) -> Result<()> {
        if self.pending.is_some() {
            return Ok(());
        }
        info!("Refreshing registration of {}", self.account.aor());
        self.send_register(ctx, None, false).await
    }

    /// Remove the binding (Expires: 0)
    pub async fn unregister(&mut self, ctx: &mut SipContext) -> Result<()> {
        ctx.timers.cancel(&TimerKey::RegisterRefresh);
        ctx.timers.cancel(&TimerKey::RegisterExpiry);
        ctx.timers.cancel(&TimerKey::RegisterRetry);

        if let Some(pending) = self.pending.take() {
            ctx.layer.terminate(&pending.txn);
            ctx.timers.cancel(&TimerKey::Transaction(pending.txn));
        }

        if self.account.state() != RegistrationState::Registered {
            self.account.unregistered();
            return Ok(());
        }

        info!("Unregistering {}", self.account.aor());
        self.send_register(ctx, None, true).await
    }

    async fn send_register(
        &mut self,
        ctx: &mut SipContext,
        authorization: Option<(String, String)>,
        unregister: bool,
    ) -> Result<()> {
        let identity = &ctx.identity;
        let aor = self.account.aor().to_string();
        let expires = if unregister {
            0
        } else {
            self.account.requested_expires().as_secs()
        };

        let mut builder = RequestBuilder::new(SipMethod::Register, format!("sip:{}", identity.domain))
            .via(identity.via_host())
            .from(aor.clone(), self.account.register_tag())
            .to(aor, None)
            .call_id(self.account.register_call_id().as_str())
            .cseq(self.account.next_cseq())
            .contact(identity.contact_uri())
            .header("Expires", expires.to_string())
            .header("Allow", crate::infrastructure::protocols::sip::builder::ALLOW);
        if let Some((name, value)) = authorization {
            builder = builder.header(name, value);
        }
        let request = builder.build()?;
        let authenticated = request.header("Authorization").is_some()
            || request.header("Proxy-Authorization").is_some();

        let server = identity.server_addr;
        match ctx
            .send_request(request, server, TransactionOwner::Registration)
            .await
        {
            Ok(txn) => {
                debug!("REGISTER sent ({})", txn);
                self.pending = Some(PendingRegister {
                    txn,
                    authenticated,
                    stale_retry: false,
                    unregister,
                });
                Ok(())
            }
            Err(e) => {
                if !unregister {
                    self.attempt_failed(ctx, &format!("send failed: {}", e));
                }
                Err(e)
            }
        }
    }

    /// Final or provisional response to our REGISTER
    pub async fn on_response(
        &mut self,
        ctx: &mut SipContext,
        matched: &ResponseMatch,
        response: &SipResponse,
    ) {
        let Some(pending) = self.pending.clone() else {
            return;
        };
        if pending.txn != matched.id {
            debug!("Ignoring response for stale REGISTER {}", matched.id);
            return;
        }

        let status = response.status_code();
        if status < 200 {
            return;
        }
        self.pending = None;

        if pending.unregister {
            if (200..300).contains(&status) {
                info!("Unregistered {}", self.account.aor());
            } else {
                warn!("Unregister rejected with {}", status);
            }
            self.account.unregistered();
            return;
        }

        match status {
            200..=299 => self.on_success(ctx, response),
            401 | 407 => self.on_challenge(ctx, response, &pending).await,
            423 => {
                let min = response
                    .header("Min-Expires")
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                match min {
                    Some(min) if min > self.account.requested_expires() => {
                        info!("Registrar requires at least {:?}, retrying", min);
                        self.account.set_requested_expires(min);
                        if let Err(e) = self.send_register(ctx, None, false).await {
                            warn!("Retrying REGISTER failed: {}", e);
                        }
                    }
                    _ => self.attempt_failed(ctx, "423 Interval Too Brief without usable Min-Expires"),
                }
            }
            _ => self.attempt_failed(ctx, &format!("registrar answered {}", status)),
        }
    }

    fn on_success(&mut self, ctx: &mut SipContext, response: &SipResponse) {
        let requested = self.account.requested_expires();
        let granted = granted_expiry(response, &ctx.identity.contact_uri())
            .filter(|granted| !granted.is_zero())
            .unwrap_or(requested);

        self.account.registered(granted, Instant::now());
        counter!("sip_registrations_total", "success" => "true").increment(1);

        match self.account.refresh_delay() {
            Ok(delay) => ctx.timers.arm(TimerKey::RegisterRefresh, delay),
            Err(e) => warn!("Cannot schedule refresh: {}", e),
        }
        ctx.timers.arm(TimerKey::RegisterExpiry, granted);
        ctx.timers.cancel(&TimerKey::RegisterRetry);
    }

    /// Answer a 401/407 once; a second challenge means bad credentials,
    /// unless it only reports a stale nonce (RFC 2617 section 3.2.1)
    async fn on_challenge(
        &mut self,
        ctx: &mut SipContext,
        response: &SipResponse,
        pending: &PendingRegister,
    ) {
        let challenge = match DigestChallenge::from_response(response) {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!("Unusable REGISTER challenge: {}", e);
                self.on_auth_failure(ctx);
                return;
            }
        };

        let stale_retry = pending.authenticated;
        if stale_retry {
            if !challenge.stale || pending.stale_retry {
                self.on_auth_failure(ctx);
                return;
            }
            info!("Registrar nonce went stale, answering the new one");
        }

        let uri = format!("sip:{}", ctx.identity.domain);
        let value = challenge.authorize(self.account.credentials(), "REGISTER", &uri);
        let header = challenge.kind.response_header().to_string();

        match self.send_register(ctx, Some((header, value)), false).await {
            Ok(()) => {
                if let Some(next) = self.pending.as_mut() {
                    next.stale_retry = stale_retry;
                }
            }
            Err(e) => warn!("Authenticated REGISTER could not be sent: {}", e),
        }
    }

    /// Credentials rejected: no retry until `register()` is called again
    pub fn on_auth_failure(&mut self, ctx: &mut SipContext) {
        let error = DomainError::AuthFailure("registrar rejected credentials".to_string());
        self.account.fail(&error.to_string());
        self.last_error = Some(format!("Registration failed: {}", error));
        counter!("sip_registrations_total", "success" => "false").increment(1);
        ctx.timers.cancel(&TimerKey::RegisterRefresh);
        ctx.timers.cancel(&TimerKey::RegisterExpiry);
        ctx.timers.cancel(&TimerKey::RegisterRetry);
    }

    /// REGISTER transaction timed out
    pub fn on_transaction_failure(
        &mut self,
        ctx: &mut SipContext,
        id: &TransactionId,
        reason: TransactionFailure,
    ) {
        let Some(pending) = self.pending.clone() else {
            return;
        };
        if &pending.txn != id {
            return;
        }
        self.pending = None;

        if pending.unregister {
            warn!("Unregister timed out");
            self.account.unregistered();
            return;
        }
        debug!("REGISTER failed: {:?}", reason);
        self.attempt_failed(ctx, "no response from registrar");
    }

    fn attempt_failed(&mut self, ctx: &mut SipContext, reason: &str) {
        self.last_error = Some(format!("Registration failed: {}", reason));
        counter!("sip_registrations_total", "success" => "false").increment(1);
        ctx.timers.cancel(&TimerKey::RegisterRefresh);
        ctx.timers.cancel(&TimerKey::RegisterExpiry);

        match self.account.record_failure(reason) {
            FailureOutcome::Retry(attempt) => {
                let delay = retry_delay(self.retry_base, attempt);
                info!("Retrying registration in {:?}", delay);
                ctx.timers.arm(TimerKey::RegisterRetry, delay);
            }
            FailureOutcome::GaveUp => {
                ctx.timers.cancel(&TimerKey::RegisterRetry);
            }
        }
    }

    /// Registration timer fired
    pub async fn on_timer(&mut self, ctx: &mut SipContext, key: &TimerKey) {
        let result = match key {
            TimerKey::RegisterRefresh => self.refresh(ctx).await,
            TimerKey::RegisterRetry => {
                if self.account.state() == RegistrationState::Failed {
                    return;
                }
                self.send_register(ctx, None, false).await
            }
            TimerKey::RegisterExpiry => {
                if self.account.expire(Instant::now()) {
                    self.last_error = Some("Registration expired".to_string());
                }
                Ok(())
            }
            TimerKey::Transaction(_) | TimerKey::CancelTimeout => Ok(()),
        };

        if let Err(e) = result {
            warn!("Registration timer {:?} failed: {}", key, e);
        }
    }
}

/// `retry_base * 2^(attempt-1)`
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
}

/// Largest delta-seconds value a registrar may grant (2^32-1)
const MAX_EXPIRES_SECS: u64 = u32::MAX as u64;

/// Granted interval: our Contact's `expires` parameter, else the Expires header
fn granted_expiry(response: &SipResponse, our_contact: &str) -> Option<Duration> {
    let contacts = response.header_all("Contact");
    let from_contact = contacts
        .iter()
        .find(|c| c.contains(our_contact))
        .or_else(|| contacts.first())
        .and_then(|c| header_param(c, "expires"))
        .and_then(|v| v.parse::<u64>().ok());

    from_contact
        .or_else(|| response.header("Expires").and_then(|v| v.trim().parse().ok()))
        .map(|secs| Duration::from_secs(secs.min(MAX_EXPIRES_SECS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::SipResponse;

    fn ok_response(extra: &str) -> SipResponse {
        let data = format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKreg\r\n\
             From: <sip:100@pbx.local>;tag=abc\r\n\
             To: <sip:100@pbx.local>;tag=srv\r\n\
             Call-ID: reg@10.0.0.5\r\n\
             CSeq: 1 REGISTER\r\n\
             {}\
             Content-Length: 0\r\n\r\n",
            extra
        );
        SipResponse::parse(data.as_bytes()).unwrap()
    }

    #[test]
    fn test_retry_backoff() {
        let base = Duration::from_secs(5);
        assert_eq!(retry_delay(base, 1), Duration::from_secs(5));
        assert_eq!(retry_delay(base, 2), Duration::from_secs(10));
        assert_eq!(retry_delay(base, 3), Duration::from_secs(20));
    }

    #[test]
    fn test_granted_expiry_prefers_contact_param() {
        let response = ok_response(
            "Contact: <sip:100@10.0.0.5:5060>;expires=120\r\nExpires: 600\r\n",
        );
        assert_eq!(
            granted_expiry(&response, "sip:100@10.0.0.5:5060"),
            Some(Duration::from_secs(120))
        );

        let response = ok_response("Expires: 600\r\n");
        assert_eq!(
            granted_expiry(&response, "sip:100@10.0.0.5:5060"),
            Some(Duration::from_secs(600))
        );

        let response = ok_response("");
        assert_eq!(granted_expiry(&response, "sip:100@10.0.0.5:5060"), None);
    }

    #[test]
    fn test_granted_expiry_clamped_to_delta_seconds() {
        let response = ok_response("Expires: 18446744073709551615\r\n");
        assert_eq!(
            granted_expiry(&response, "sip:100@10.0.0.5:5060"),
            Some(Duration::from_secs(u32::MAX as u64))
        );
    }
}
