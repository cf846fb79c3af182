//! Configuration management
//!
//! Settings come from an optional TOML file overlaid with `PBX__SECTION__KEY`
//! environment variables. Every section has working defaults, so an empty
//! file (or none at all) yields a runnable core.

use crate::domain::dialplan::{default_rules, DialplanRuleConfig};
use crate::domain::ip_blacklist::BlacklistConfig;
use crate::domain::sip_trunk::SipTrunk;
use crate::infrastructure::ivr::{DtmfQueueConfig, GoertzelConfig};
use crate::infrastructure::media::RelayConfig;
use crate::infrastructure::protocols::sip::registrar::RegistrarConfig;
use crate::infrastructure::protocols::sip::transaction::SipTimers;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub dtmf: DtmfConfig,
    pub security: SecurityConfig,
    pub codecs: CodecConfig,
    /// Ordered routing rules; empty means the built-in plan
    pub dialplan: Vec<DialplanRuleConfig>,
    pub trunks: Vec<SipTrunk>,
    pub extensions: Vec<ExtensionConfig>,
}

impl Config {
    /// Layer `path` (if it exists) and the environment over the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("PBX")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn dialplan_rules(&self) -> Vec<DialplanRuleConfig> {
        if self.dialplan.is_empty() {
            default_rules()
        } else {
            self.dialplan.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub udp_bind: SocketAddr,
    /// TCP listener; `None` disables it
    pub tcp_bind: Option<SocketAddr>,
    pub domain: String,
    /// Address written into Via, Contact and SDP when the bind address is a wildcard
    pub advertised_ip: Option<IpAddr>,
    /// Challenge INVITEs with 407
    pub authenticate_invites: bool,
    pub ring_timeout_secs: u64,
    pub timers: SipTimers,
    pub registrar: RegistrarConfig,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            udp_bind: SocketAddr::from(([0, 0, 0, 0], 5060)),
            tcp_bind: None,
            domain: "localhost".to_string(),
            advertised_ip: None,
            authenticate_invites: false,
            ring_timeout_secs: 60,
            timers: SipTimers::default(),
            registrar: RegistrarConfig::default(),
        }
    }
}

impl SipConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// IP peers should use to reach us
    pub fn public_ip(&self, bound: IpAddr) -> IpAddr {
        match self.advertised_ip {
            Some(ip) => ip,
            None if bound.is_unspecified() => IpAddr::from([127, 0, 0, 1]),
            None => bound,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub bind_ip: IpAddr,
    pub rtp_port_start: u16,
    pub rtp_port_end: u16,
    pub bind_attempts: u32,
    pub recv_timeout_ms: u64,
    pub inactivity_timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            rtp_port_start: 10000,
            rtp_port_end: 20000,
            bind_attempts: 5,
            recv_timeout_ms: 200,
            inactivity_timeout_secs: 60,
        }
    }
}

impl MediaConfig {
    pub fn relay(&self, dtmf: &DtmfConfig) -> RelayConfig {
        RelayConfig {
            bind_ip: self.bind_ip,
            bind_attempts: self.bind_attempts,
            recv_timeout: Duration::from_millis(self.recv_timeout_ms),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            dtmf_end_redundancy: dtmf.rfc2833_end_redundancy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DtmfConfig {
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub rfc2833_end_redundancy: u8,
    pub inband_enabled: bool,
    pub goertzel: GoertzelConfig,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        let queue = DtmfQueueConfig::default();
        Self {
            debounce_ms: queue.debounce_ms,
            poll_interval_ms: queue.poll_interval_ms,
            rfc2833_end_redundancy: 3,
            inband_enabled: true,
            goertzel: GoertzelConfig::default(),
        }
    }
}

impl DtmfConfig {
    pub fn queue(&self) -> DtmfQueueConfig {
        DtmfQueueConfig {
            debounce_ms: self.debounce_ms,
            poll_interval_ms: self.poll_interval_ms,
        }
    }

    pub fn inband(&self) -> Option<GoertzelConfig> {
        self.inband_enabled.then(|| self.goertzel.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub max_auth_failures: usize,
    pub failure_window_secs: i64,
    pub ban_duration_secs: i64,
    pub nonce_ttl_secs: u64,
    /// Never banned
    pub trusted_ips: Vec<IpAddr>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_auth_failures: 5,
            failure_window_secs: 300,
            ban_duration_secs: 900,
            nonce_ttl_secs: 300,
            trusted_ips: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn blacklist(&self) -> BlacklistConfig {
        BlacklistConfig {
            max_auth_failures: self.max_auth_failures,
            failure_window: chrono::Duration::seconds(self.failure_window_secs),
            ban_duration: chrono::Duration::seconds(self.ban_duration_secs),
        }
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Local preference, best first
    pub priority: Vec<String>,
    /// Listed codecs are never selected
    pub unavailable: Vec<String>,
    /// `None` turns RFC 2833 off
    pub telephone_event: Option<u8>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            priority: ["PCMU", "PCMA", "G722"].map(String::from).to_vec(),
            unavailable: Vec::new(),
            telephone_event: Some(101),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionConfig {
    pub number: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sip.udp_bind.port(), 5060);
        assert_eq!(config.sip.registrar.max_expires, 7200);
        assert_eq!(config.dtmf.queue().debounce_ms, 400);
        assert_eq!(config.dtmf.rfc2833_end_redundancy, 3);
        assert_eq!(config.codecs.telephone_event, Some(101));
        assert!(!config.dialplan_rules().is_empty());
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [sip]
            domain = "pbx.example.com"
            authenticate_invites = true

            [sip.timers]
            t1 = 100

            [media]
            rtp_port_start = 30000
            rtp_port_end = 30100

            [dtmf]
            inband_enabled = false

            [codecs]
            priority = ["G722", "PCMA"]

            [[extensions]]
            number = "1001"
            password = "secret"

            [[trunks]]
            name = "carrier"
            address = "203.0.113.5:5060"
            strip_digits = 1

            [[dialplan]]
            name = "out"
            pattern = "_9."
            target = { type = "trunk", trunk = "carrier" }
            "#,
        )
        .unwrap();

        assert_eq!(config.sip.domain, "pbx.example.com");
        assert!(config.sip.authenticate_invites);
        assert_eq!(config.sip.timers.t1, Duration::from_millis(100));
        assert_eq!(config.sip.timers.t2, Duration::from_secs(4));
        assert_eq!(config.media.rtp_port_start, 30000);
        assert!(config.dtmf.inband().is_none());
        assert_eq!(config.codecs.priority, vec!["G722", "PCMA"]);
        assert_eq!(config.extensions[0].number, "1001");
        assert_eq!(config.trunks[0].strip_digits, 1);
        assert_eq!(config.dialplan_rules().len(), 1);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(matches!(
            Config::from_toml_str("[sip]\nudp_bind = 5"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load("/nonexistent/pbx.toml").unwrap();
        assert_eq!(config.media.rtp_port_end, 20000);
    }
}
