//! Configuration management
//!
//! Settings come from built-in defaults, then an optional `softphone.toml`
//! (or the file named by `SOFTPHONE_CONFIG`), then environment variables.
//! Environment keys are the upper-case field names (`SIP_SERVER`, `PORT`, ...).

use crate::infrastructure::protocols::sip::SipTimers;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "softphone";
const DEFAULT_SIP_PORT: u16 = 5060;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Registrar / proxy, `host` or `host:port`
    pub sip_server: String,
    pub extension: String,
    pub password: String,
    /// Local SIP port
    pub port: u16,
    pub log_level: String,

    pub api_host: String,
    pub api_port: u16,

    /// Status code used to answer incoming calls, `0` or `off` disables
    pub auto_answer: String,
    /// Requested registration interval in seconds
    pub register_expires: u64,
    /// Port advertised in SDP
    pub rtp_port: u16,
    /// Address advertised in Via/Contact/SDP; discovered when unset
    pub local_ip: Option<String>,

    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub max_retransmits: u32,
    /// Base of the registration retry backoff, in seconds
    pub register_retry_base: u64,
    pub register_max_failures: u32,
    pub shutdown_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sip_server: String::new(),
            extension: String::new(),
            password: String::new(),
            port: DEFAULT_SIP_PORT,
            log_level: "info".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8099,
            auto_answer: "200".to_string(),
            register_expires: 300,
            rtp_port: 4000,
            local_ip: None,
            t1_ms: 500,
            t2_ms: 4000,
            t4_ms: 5000,
            max_retransmits: 4,
            register_retry_base: 5,
            register_max_failures: 3,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl Settings {
    /// Load from the default file and the process environment
    pub fn load() -> Result<Self, SettingsError> {
        let file = std::env::var("SOFTPHONE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::build(Some(&file), None)
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, SettingsError> {
        Self::build(None, Some(vars))
    }

    fn build(file: Option<&str>, vars: Option<HashMap<String, String>>) -> Result<Self, SettingsError> {
        let defaults = Config::try_from(&Settings::default())?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(file) = file {
            builder = builder.add_source(File::with_name(file).required(false));
        }
        // Values stay strings until deserialized so PASSWORD=0123 keeps its zero
        builder = builder.add_source(Environment::default().source(vars));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.sip_server.trim().is_empty() {
            return Err(SettingsError::Invalid("SIP_SERVER is required".to_string()));
        }
        if self.extension.trim().is_empty() {
            return Err(SettingsError::Invalid("EXTENSION is required".to_string()));
        }
        if self.t1_ms == 0 || self.t2_ms < self.t1_ms {
            return Err(SettingsError::Invalid(
                "T1 must be positive and not larger than T2".to_string(),
            ));
        }
        self.auto_answer_code()?;
        if let Some(ip) = &self.local_ip {
            ip.parse::<std::net::IpAddr>()
                .map_err(|_| SettingsError::Invalid(format!("LOCAL_IP is not an IP address: {}", ip)))?;
        }
        Ok(())
    }

    /// Status code for auto-answer, `None` when disabled
    pub fn auto_answer_code(&self) -> Result<Option<u16>, SettingsError> {
        let value = self.auto_answer.trim();
        if value.is_empty() || value == "0" || value.eq_ignore_ascii_case("off") || value.eq_ignore_ascii_case("false") {
            return Ok(None);
        }
        match value.parse::<u16>() {
            Ok(code) if (200..700).contains(&code) => Ok(Some(code)),
            _ => Err(SettingsError::Invalid(format!(
                "AUTO_ANSWER must be a final status code, 0 or off: {}",
                value
            ))),
        }
    }

    /// Host part of the server, used as the SIP domain
    pub fn sip_domain(&self) -> &str {
        let server = self.sip_server.trim();
        match server.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => server,
        }
    }

    /// `host:port` of the server, with the default SIP port when none is given
    pub fn server_host_port(&self) -> String {
        let domain = self.sip_domain();
        if domain == self.sip_server.trim() {
            format!("{}:{}", domain, DEFAULT_SIP_PORT)
        } else {
            self.sip_server.trim().to_string()
        }
    }

    pub fn sip_bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn timers(&self) -> SipTimers {
        SipTimers {
            t1: Duration::from_millis(self.t1_ms),
            t2: Duration::from_millis(self.t2_ms),
            t4: Duration::from_millis(self.t4_ms),
            max_retransmits: self.max_retransmits,
        }
    }

    pub fn register_expires(&self) -> Duration {
        Duration::from_secs(self.register_expires)
    }

    pub fn register_retry_base(&self) -> Duration {
        Duration::from_secs(self.register_retry_base)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_with_required_vars() {
        let settings = Settings::from_vars(vars(&[
            ("SIP_SERVER", "pbx.local"),
            ("EXTENSION", "100"),
            ("PASSWORD", "0123"),
        ]))
        .unwrap();

        assert_eq!(settings.port, 5060);
        assert_eq!(settings.api_port, 8099);
        assert_eq!(settings.password, "0123");
        assert_eq!(settings.auto_answer_code().unwrap(), Some(200));
        assert_eq!(settings.register_expires(), Duration::from_secs(300));
        assert_eq!(settings.sip_domain(), "pbx.local");
        assert_eq!(settings.server_host_port(), "pbx.local:5060");
        assert_eq!(settings.timers().t1, Duration::from_millis(500));
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::from_vars(vars(&[
            ("SIP_SERVER", "10.0.0.1:5080"),
            ("EXTENSION", "100"),
            ("PORT", "5070"),
            ("AUTO_ANSWER", "off"),
            ("API_PORT", "9000"),
        ]))
        .unwrap();

        assert_eq!(settings.port, 5070);
        assert_eq!(settings.api_addr(), "0.0.0.0:9000");
        assert_eq!(settings.auto_answer_code().unwrap(), None);
        assert_eq!(settings.sip_domain(), "10.0.0.1");
        assert_eq!(settings.server_host_port(), "10.0.0.1:5080");
    }

    #[test]
    fn test_missing_server_is_rejected() {
        let result = Settings::from_vars(vars(&[("EXTENSION", "100")]));
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_bad_auto_answer_is_rejected() {
        let result = Settings::from_vars(vars(&[
            ("SIP_SERVER", "pbx.local"),
            ("EXTENSION", "100"),
            ("AUTO_ANSWER", "180"),
        ]));
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }
}
