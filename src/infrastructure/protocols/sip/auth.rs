//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! MD5 with `qop=auth`. Passwords come from the extension store; nonces are
//! issued here and remembered until they expire.

use super::builder::{generate_tag, ResponseBuilder};
use super::message::{SipHeaders, SipRequest, SipResponse};
use crate::domain::extension::ExtensionStore;
use crate::domain::ip_blacklist::IpBlacklist;
use metrics::counter;
use rand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a request did not authenticate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("No credentials supplied")]
    Missing,

    #[error("Malformed credentials: {0}")]
    Malformed(String),

    #[error("Nonce unknown or expired")]
    StaleNonce,

    #[error("Unknown user {0}")]
    UnknownUser(String),

    #[error("Wrong credentials for {0}")]
    BadCredentials(String),
}

impl AuthFailure {
    /// Whether this failure feeds the per-source abuse counter
    pub fn counts_toward_ban(&self) -> bool {
        matches!(
            self,
            AuthFailure::UnknownUser(_) | AuthFailure::BadCredentials(_) | AuthFailure::Malformed(_)
        )
    }
}

/// Registrar (401) or proxy-style (407) challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Www,
    Proxy,
}

impl ChallengeKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ChallengeKind::Www => 401,
            ChallengeKind::Proxy => 407,
        }
    }

    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "WWW-Authenticate",
            ChallengeKind::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn credentials_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub stale: bool,
}

impl AuthChallenge {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: Self::generate_nonce(),
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
            stale: false,
        }
    }

    fn generate_nonce() -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; 16] = rng.gen();
        hex::encode(random_bytes)
    }

    /// Format as WWW-Authenticate / Proxy-Authenticate value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        if self.stale {
            value.push_str(", stale=true");
        }
        value
    }

    /// Read a challenge back from a 401/407, as a client would
    pub fn parse(value: &str) -> Option<Self> {
        let params = digest_params(value);
        Some(Self {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
            algorithm: params.get("algorithm").cloned().unwrap_or_else(|| "MD5".to_string()),
            qop: params.get("qop").cloned(),
            stale: params.get("stale").is_some_and(|s| s.eq_ignore_ascii_case("true")),
        })
    }

    /// Authorization header value answering this challenge
    pub fn authorize(&self, username: &str, password: &str, method: &str, uri: &str, cnonce: &str) -> String {
        let nc = "00000001";
        let qop = self.qop.as_deref().map(|_| "auth");
        let response = digest_response(&DigestInput {
            username,
            realm: &self.realm,
            password,
            method,
            uri,
            nonce: &self.nonce,
            qop: qop.map(|q| (q, nc, cnonce)),
        });
        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
            username, self.realm, self.nonce, uri, response
        );
        if let Some(qop) = qop {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        value
    }
}

/// Inputs to the digest computation
#[derive(Debug, Clone, Copy)]
pub struct DigestInput<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub password: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub nonce: &'a str,
    /// (qop, nc, cnonce) when qop is in use
    pub qop: Option<(&'a str, &'a str, &'a str)>,
}

/// Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
pub fn digest_response(input: &DigestInput<'_>) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!(
        "{:x}",
        md5::compute(format!("{}:{}:{}", input.username, input.realm, input.password))
    );
    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", input.method, input.uri)));

    let digest = match input.qop {
        Some((qop, nc, cnonce)) => md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, input.nonce, nc, cnonce, qop, ha2
        )),
        None => md5::compute(format!("{}:{}:{}", ha1, input.nonce, ha2)),
    };
    format!("{:x}", digest)
}

fn digest_params(value: &str) -> HashMap<String, String> {
    let digest_str = value.trim();
    let digest_str = match digest_str.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("digest ") => &digest_str[7..],
        _ => digest_str,
    };

    // Quoted values may contain commas
    let mut params = HashMap::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in digest_str.chars().chain(std::iter::once(',')) {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                if let Some((key, value)) = current.split_once('=') {
                    params.insert(
                        key.trim().to_ascii_lowercase(),
                        value.trim().trim_matches('"').to_string(),
                    );
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    params
}

/// Parsed Authorization / Proxy-Authorization header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl AuthorizationHeader {
    pub fn parse(value: &str) -> Result<Self, AuthFailure> {
        let params = digest_params(value);
        let required = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| AuthFailure::Malformed(format!("missing {}", name)))
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        })
    }
}

/// Digest authentication against the extension store
pub struct DigestAuth {
    realm: String,
    store: Arc<dyn ExtensionStore>,
    nonce_ttl: Duration,
    active_nonces: Mutex<HashMap<String, Instant>>,
}

impl DigestAuth {
    pub fn new(realm: impl Into<String>, store: Arc<dyn ExtensionStore>) -> Self {
        Self {
            realm: realm.into(),
            store,
            nonce_ttl: Duration::from_secs(300),
            active_nonces: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl = ttl;
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    fn nonces(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.active_nonces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a fresh challenge and remember its nonce
    pub fn create_challenge(&self) -> AuthChallenge {
        let challenge = AuthChallenge::new(&self.realm);
        self.nonces().insert(challenge.nonce.clone(), Instant::now());
        debug!("Created auth challenge with nonce: {}", challenge.nonce);
        challenge
    }

    /// 401/407 carrying a fresh challenge
    pub fn challenge_response(&self, request: &SipRequest, kind: ChallengeKind, stale: bool) -> SipResponse {
        let mut challenge = self.create_challenge();
        challenge.stale = stale;
        ResponseBuilder::new(kind.status_code())
            .header(kind.challenge_header(), challenge.to_header_value())
            .to_tag(generate_tag())
            .build_for_request(request)
    }

    /// Check the request's credentials; returns the authenticated user
    pub async fn verify(&self, request: &SipRequest, kind: ChallengeKind) -> Result<String, AuthFailure> {
        let value = request
            .header(kind.credentials_header())
            .ok_or(AuthFailure::Missing)?;
        let auth = AuthorizationHeader::parse(value)?;

        if auth.realm != self.realm {
            warn!("Realm mismatch: expected {}, got {}", self.realm, auth.realm);
            return Err(AuthFailure::Malformed(format!("realm {}", auth.realm)));
        }
        if let Some(algorithm) = &auth.algorithm {
            if !algorithm.eq_ignore_ascii_case("MD5") {
                return Err(AuthFailure::Malformed(format!("algorithm {}", algorithm)));
            }
        }

        {
            let nonces = self.nonces();
            let issued = nonces.get(&auth.nonce).ok_or(AuthFailure::StaleNonce)?;
            if issued.elapsed() > self.nonce_ttl {
                return Err(AuthFailure::StaleNonce);
            }
        }

        let credentials = self.store.get_credentials(&auth.username).await.ok_or_else(|| {
            warn!("Authentication failed: unknown user {}", auth.username);
            AuthFailure::UnknownUser(auth.username.clone())
        })?;

        let qop = match (&auth.qop, &auth.nc, &auth.cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) => Some((qop.as_str(), nc.as_str(), cnonce.as_str())),
            (Some(_), _, _) => return Err(AuthFailure::Malformed("qop without nc/cnonce".to_string())),
            _ => None,
        };
        let expected = digest_response(&DigestInput {
            username: &auth.username,
            realm: &auth.realm,
            password: &credentials.password,
            method: request.method.as_str(),
            uri: &auth.uri,
            nonce: &auth.nonce,
            qop,
        });

        if auth.response != expected {
            warn!("Authentication failed for user {}: response mismatch", auth.username);
            return Err(AuthFailure::BadCredentials(auth.username));
        }

        info!("Authentication successful for user: {}", auth.username);
        Ok(auth.username)
    }

    /// Verify, and turn failures into the response the peer should get
    ///
    /// Counted failures feed the source's abuse counter; missing or stale
    /// credentials are simply challenged again.
    pub async fn authenticate(
        &self,
        request: &SipRequest,
        kind: ChallengeKind,
        source: IpAddr,
        blacklist: &IpBlacklist,
    ) -> Result<String, SipResponse> {
        let failure = match self.verify(request, kind).await {
            Ok(username) => {
                blacklist.record_auth_success(&source);
                return Ok(username);
            }
            Err(failure) => failure,
        };

        if failure.counts_toward_ban() {
            counter!("pbx_auth_failures_total", "method" => request.method.to_string()).increment(1);
            let outcome = blacklist.record_auth_failure(&source);
            warn!(
                "{} from {} rejected: {} ({} recent failures)",
                request.method, source, failure, outcome.failures
            );
        }

        Err(match failure {
            AuthFailure::UnknownUser(_) => ResponseBuilder::new(403)
                .to_tag(generate_tag())
                .build_for_request(request),
            AuthFailure::StaleNonce => self.challenge_response(request, kind, true),
            _ => self.challenge_response(request, kind, false),
        })
    }

    /// Forget expired nonces
    pub fn cleanup_nonces(&self) -> usize {
        let ttl = self.nonce_ttl;
        let mut nonces = self.nonces();
        let before = nonces.len();
        nonces.retain(|_, issued| issued.elapsed() <= ttl);
        before - nonces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extension::{Extension, InMemoryExtensionStore};
    use crate::infrastructure::protocols::sip::message::SipMethod;

    async fn auth() -> DigestAuth {
        let store = InMemoryExtensionStore::new();
        store.add(Extension::new("1001", "secret")).await;
        DigestAuth::new("pbx.local", Arc::new(store))
    }

    fn register(authorization: Option<String>) -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Register, "sip:pbx.local");
        req.headers.push("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKr");
        req.headers.push("From", "<sip:1001@pbx.local>;tag=r");
        req.headers.push("To", "<sip:1001@pbx.local>");
        req.headers.push("Call-ID", "reg-1");
        req.headers.push("CSeq", "1 REGISTER");
        if let Some(value) = authorization {
            req.headers.push("Authorization", value);
        }
        req
    }

    #[test]
    fn test_rfc2617_example_vector() {
        // RFC 2617 section 3.5
        let response = digest_response(&DigestInput {
            username: "Mufasa",
            realm: "testrealm@host.com",
            password: "Circle Of Life",
            method: "GET",
            uri: "/dir/index.html",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            qop: Some(("auth", "00000001", "0a4f113b")),
        });
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_challenge_header_roundtrip() {
        let challenge = AuthChallenge::new("pbx.local");
        let parsed = AuthChallenge::parse(&challenge.to_header_value()).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_parse_quoted_uri_with_comma() {
        let header = AuthorizationHeader::parse(
            r#"Digest username="alice", realm="pbx.local", nonce="abc", uri="sip:a,b@pbx.local", response="def""#,
        )
        .unwrap();
        assert_eq!(header.uri, "sip:a,b@pbx.local");
        assert_eq!(header.username, "alice");
    }

    #[tokio::test]
    async fn test_valid_credentials_authenticate() {
        let auth = auth().await;
        let challenge = auth.create_challenge();
        let value = challenge.authorize("1001", "secret", "REGISTER", "sip:pbx.local", "c0ffee");
        assert_eq!(auth.verify(&register(Some(value)), ChallengeKind::Www).await.unwrap(), "1001");
    }

    #[tokio::test]
    async fn test_failure_kinds() {
        let auth = auth().await;
        assert_eq!(
            auth.verify(&register(None), ChallengeKind::Www).await,
            Err(AuthFailure::Missing)
        );

        let challenge = auth.create_challenge();
        let wrong = challenge.authorize("1001", "guess", "REGISTER", "sip:pbx.local", "c0ffee");
        let err = auth.verify(&register(Some(wrong)), ChallengeKind::Www).await.unwrap_err();
        assert_eq!(err, AuthFailure::BadCredentials("1001".to_string()));
        assert!(err.counts_toward_ban());

        let unknown = challenge.authorize("9999", "x", "REGISTER", "sip:pbx.local", "c0ffee");
        let err = auth.verify(&register(Some(unknown)), ChallengeKind::Www).await.unwrap_err();
        assert_eq!(err, AuthFailure::UnknownUser("9999".to_string()));

        // A nonce we never issued
        let forged = AuthChallenge::new("pbx.local").authorize("1001", "secret", "REGISTER", "sip:pbx.local", "c");
        let err = auth.verify(&register(Some(forged)), ChallengeKind::Www).await.unwrap_err();
        assert_eq!(err, AuthFailure::StaleNonce);
        assert!(!err.counts_toward_ban());
    }

    #[tokio::test]
    async fn test_proxy_credentials_use_their_own_header() {
        let auth = auth().await;
        let challenge = auth.create_challenge();
        let value = challenge.authorize("1001", "secret", "REGISTER", "sip:pbx.local", "c0ffee");
        // Sent as Authorization, but a proxy challenge expects Proxy-Authorization
        assert_eq!(
            auth.verify(&register(Some(value)), ChallengeKind::Proxy).await,
            Err(AuthFailure::Missing)
        );
    }

    #[tokio::test]
    async fn test_expired_nonces_are_cleaned() {
        let auth = auth().await.with_nonce_ttl(Duration::from_millis(1));
        auth.create_challenge();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(auth.cleanup_nonces(), 1);
    }
}
