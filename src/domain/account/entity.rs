//! Account entity

use super::value_object::{Credentials, RegistrationState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, SipUri};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Result of recording a registration failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Try again; carries the number of consecutive failures so far
    Retry(u32),
    /// Budget exhausted, account is now `Failed`
    GaveUp,
}

/// The SIP account: identity, credentials and registration binding
#[derive(Debug, Clone)]
pub struct Account {
    aor: SipUri,
    credentials: Credentials,
    state: RegistrationState,
    /// Requested registration interval
    expires: Duration,
    /// Interval granted by the registrar on the last success
    granted: Option<Duration>,
    expires_at: Option<Instant>,
    registered_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    max_failures: u32,
    /// REGISTER requests of one binding share Call-ID and From tag
    register_call_id: CallId,
    register_tag: String,
    cseq: u32,
}

impl Account {
    pub fn new(
        aor: SipUri,
        credentials: Credentials,
        expires: Duration,
        max_failures: u32,
        local_host: &str,
    ) -> Self {
        Self {
            aor,
            credentials,
            state: RegistrationState::Unregistered,
            expires,
            granted: None,
            expires_at: None,
            registered_until: None,
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
            register_call_id: CallId::generate(local_host),
            register_tag: crate::domain::shared::value_objects::generate_tag(),
            cseq: 0,
        }
    }

    /// Start (or restart) a registration attempt
    pub fn begin_registering(&mut self) {
        if self.state == RegistrationState::Failed {
            info!("Restarting registration for {} after failure", self.aor);
            self.consecutive_failures = 0;
        }
        self.state = RegistrationState::Registering;
    }

    /// Registrar accepted the binding for `granted`
    pub fn registered(&mut self, granted: Duration, now: Instant) {
        self.state = RegistrationState::Registered;
        self.granted = Some(granted);
        self.expires_at = now.checked_add(granted);
        self.registered_until = chrono::Duration::from_std(granted)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.consecutive_failures = 0;
        info!("{} registered for {:?}", self.aor, granted);
    }

    /// A registration attempt failed in a retryable way
    pub fn record_failure(&mut self, reason: &str) -> FailureOutcome {
        self.consecutive_failures += 1;
        self.clear_binding();

        if self.consecutive_failures >= self.max_failures {
            warn!(
                "Registration of {} failed {} times, giving up: {}",
                self.aor, self.consecutive_failures, reason
            );
            self.state = RegistrationState::Failed;
            FailureOutcome::GaveUp
        } else {
            warn!(
                "Registration of {} failed (attempt {}): {}",
                self.aor, self.consecutive_failures, reason
            );
            self.state = RegistrationState::Registering;
            FailureOutcome::Retry(self.consecutive_failures)
        }
    }

    /// Hard failure, no retry (bad credentials)
    pub fn fail(&mut self, reason: &str) {
        warn!("Registration of {} failed permanently: {}", self.aor, reason);
        self.clear_binding();
        self.state = RegistrationState::Failed;
    }

    /// Called when the binding lifetime ran out without a successful refresh
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) if self.state == RegistrationState::Registered && now >= at => {
                warn!("Registration of {} expired before refresh", self.aor);
                self.clear_binding();
                self.state = RegistrationState::Registering;
                true
            }
            _ => false,
        }
    }

    /// Binding removed (un-REGISTER)
    pub fn unregistered(&mut self) {
        self.clear_binding();
        self.state = RegistrationState::Unregistered;
    }

    fn clear_binding(&mut self) {
        self.granted = None;
        self.expires_at = None;
        self.registered_until = None;
    }

    /// Registered only while the binding is still within its lifetime.
    /// A lifetime past what the clock can represent never runs out.
    pub fn is_registered(&self, now: Instant) -> bool {
        self.state == RegistrationState::Registered
            && self.expires_at.map(|at| now < at).unwrap_or(self.granted.is_some())
    }

    /// Delay until the refresh: 90% of the granted interval
    pub fn refresh_delay(&self) -> Result<Duration> {
        let granted = self.granted.ok_or_else(|| {
            DomainError::InvalidState("No registration binding to refresh".to_string())
        })?;
        Ok(granted.mul_f64(0.9))
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    pub fn set_requested_expires(&mut self, expires: Duration) {
        self.expires = expires;
    }

    // Getters
    pub fn aor(&self) -> &SipUri {
        &self.aor
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn requested_expires(&self) -> Duration {
        self.expires
    }

    pub fn granted(&self) -> Option<Duration> {
        self.granted
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn registered_until(&self) -> Option<DateTime<Utc>> {
        self.registered_until
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn register_call_id(&self) -> &CallId {
        &self.register_call_id
    }

    pub fn register_tag(&self) -> &str {
        &self.register_tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new(
            SipUri::parse("sip:100@pbx.local").unwrap(),
            Credentials::new("100", "secret"),
            Duration::from_secs(300),
            3,
            "10.0.0.5",
        )
    }

    #[test]
    fn test_registered_only_until_expiry() {
        let mut account = account();
        let now = Instant::now();
        account.begin_registering();
        account.registered(Duration::from_secs(100), now);

        assert!(account.is_registered(now));
        assert!(account.is_registered(now + Duration::from_secs(99)));
        assert!(!account.is_registered(now + Duration::from_secs(100)));

        assert!(account.expire(now + Duration::from_secs(100)));
        assert_eq!(account.state(), RegistrationState::Registering);
    }

    #[test]
    fn test_refresh_at_ninety_percent() {
        let mut account = account();
        assert!(account.refresh_delay().is_err());

        account.registered(Duration::from_secs(3600), Instant::now());
        assert_eq!(account.refresh_delay().unwrap(), Duration::from_secs(3240));
    }

    #[test]
    fn test_gives_up_after_max_failures() {
        let mut account = account();
        account.begin_registering();

        assert_eq!(account.record_failure("timeout"), FailureOutcome::Retry(1));
        assert_eq!(account.record_failure("timeout"), FailureOutcome::Retry(2));
        assert_eq!(account.record_failure("timeout"), FailureOutcome::GaveUp);
        assert_eq!(account.state(), RegistrationState::Failed);

        // Manual restart resets the budget
        account.begin_registering();
        assert_eq!(account.consecutive_failures(), 0);
        assert_eq!(account.state(), RegistrationState::Registering);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut account = account();
        account.record_failure("503");
        account.registered(Duration::from_secs(60), Instant::now());
        assert_eq!(account.consecutive_failures(), 0);
        assert!(account.registered_until().is_some());
    }

    #[test]
    fn test_unrepresentable_lifetime_stays_registered() {
        let mut account = account();
        let now = Instant::now();
        account.registered(Duration::MAX, now);

        assert_eq!(account.state(), RegistrationState::Registered);
        assert_eq!(account.expires_at(), None);
        assert!(account.is_registered(now + Duration::from_secs(86_400)));
        assert!(!account.expire(now + Duration::from_secs(86_400)));
    }

    #[test]
    fn test_cseq_increments() {
        let mut account = account();
        assert_eq!(account.next_cseq(), 1);
        assert_eq!(account.next_cseq(), 2);
    }
}
