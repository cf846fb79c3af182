//! SIP trunk definitions used by external dialplan routes

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// An upstream carrier reached over plain SIP/UDP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipTrunk {
    pub name: String,
    /// Where outbound INVITEs are sent
    pub address: SocketAddr,
    /// Host placed in the outbound Request-URI; defaults to the address IP
    #[serde(default)]
    pub domain: Option<String>,
    /// Leading digits removed before sending, e.g. the "9" of an outside line
    #[serde(default)]
    pub strip_digits: usize,
    /// Digits added after stripping
    #[serde(default)]
    pub add_prefix: Option<String>,
    /// Sources accepted as this trunk for inbound calls
    #[serde(default)]
    pub allowed_ips: Vec<IpAddr>,
}

impl SipTrunk {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
            domain: None,
            strip_digits: 0,
            add_prefix: None,
            allowed_ips: Vec::new(),
        }
    }

    /// Number as the carrier should receive it
    pub fn transform(&self, dialed: &str) -> String {
        let stripped: String = dialed.chars().skip(self.strip_digits).collect();
        match &self.add_prefix {
            Some(prefix) => format!("{}{}", prefix, stripped),
            None => stripped,
        }
    }

    pub fn request_uri(&self, dialed: &str) -> String {
        let host = self
            .domain
            .clone()
            .unwrap_or_else(|| self.address.ip().to_string());
        format!("sip:{}@{}:{}", self.transform(dialed), host, self.address.port())
    }

    pub fn accepts_source(&self, ip: &IpAddr) -> bool {
        self.address.ip() == *ip || self.allowed_ips.contains(ip)
    }
}
