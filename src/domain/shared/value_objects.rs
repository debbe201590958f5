//! Shared value objects used across the account and call contexts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call identifier (the SIP Call-ID of the dialog)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh Call-ID scoped to the given host
    pub fn generate(host: &str) -> Self {
        Self(format!("{}@{}", uuid::Uuid::new_v4().simple(), host))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Random From/To tag
pub fn generate_tag() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..10].to_string()
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self { user, host, port }
    }

    pub fn parse(uri: &str) -> Result<Self, String> {
        let uri = uri.trim().trim_start_matches('<').trim_end_matches('>');
        let rest = uri
            .strip_prefix("sip:")
            .ok_or_else(|| "URI must start with 'sip:'".to_string())?;

        // Drop URI parameters and headers
        let rest = rest.split([';', '?']).next().unwrap_or_default();

        let (user, host_port) = match rest.rsplit_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user.to_string()), host_port),
            Some(_) => return Err("Invalid SIP URI format".to_string()),
            None => (None, rest),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| format!("Invalid port in SIP URI: {}", port))?;
                (host.to_string(), Some(port))
            }
            None => (host_port.to_string(), None),
        };

        if host.is_empty() {
            return Err("SIP URI has no host".to_string());
        }

        Ok(Self { user, host, port })
    }

    /// Resolve a dial string into a URI: full `sip:` URIs are kept, bare
    /// numbers or user names are placed on the given domain.
    pub fn for_destination(destination: &str, domain: &str) -> Result<Self, String> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err("destination is empty".to_string());
        }
        if destination.starts_with("sip:") {
            return Self::parse(destination);
        }
        if destination.contains('@') {
            return Self::parse(&format!("sip:{}", destination));
        }
        Self::parse(&format!("sip:{}@{}", destination, domain))
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}
