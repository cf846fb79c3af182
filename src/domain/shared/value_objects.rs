//! Shared value objects used across multiple bounded contexts

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Call identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP URI value object
///
/// Parsing goes through `rsip`, so parameters and escaped user parts are
/// handled the same way as on the wire.
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
        let uri = uri.trim();
        if !(uri.starts_with("sip:") || uri.starts_with("sips:")) {
            return Err(format!("URI must use the sip or sips scheme: {}", uri));
        }

        let parsed = rsip::Uri::try_from(uri).map_err(|e| format!("Invalid SIP URI {}: {}", uri, e))?;

        let user = parsed.auth.map(|auth| auth.user).filter(|u| !u.is_empty());
        let host = parsed.host_with_port.host.to_string();
        let port = parsed
            .host_with_port
            .port
            .and_then(|p| p.to_string().parse::<u16>().ok());

        if host.is_empty() {
            return Err(format!("SIP URI has no host: {}", uri));
        }

        Ok(Self { user, host, port })
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

    /// host:port, falling back to 5060
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(5060))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_uri_parse() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), None);

        let uri_with_port = SipUri::parse("sip:1001@192.168.1.10:5062;transport=udp").unwrap();
        assert_eq!(uri_with_port.user(), Some("1001"));
        assert_eq!(uri_with_port.host(), "192.168.1.10");
        assert_eq!(uri_with_port.port(), Some(5062));
    }

    #[test]
    fn test_sip_uri_without_user() {
        let uri = SipUri::parse("sip:pbx.local").unwrap();
        assert_eq!(uri.user(), None);
        assert_eq!(uri.host_port(), "pbx.local:5060");
    }

    #[test]
    fn test_sip_uri_rejects_other_schemes() {
        assert!(SipUri::parse("mailto:alice@example.com").is_err());
    }

    #[test]
    fn test_sip_uri_display() {
        let uri = SipUri::new(Some("alice".to_string()), "example.com".to_string(), None);
        assert_eq!(uri.to_string(), "sip:alice@example.com");

        let uri_with_port =
            SipUri::new(Some("bob".to_string()), "example.com".to_string(), Some(5060));
        assert_eq!(uri_with_port.to_string(), "sip:bob@example.com:5060");
    }
}
