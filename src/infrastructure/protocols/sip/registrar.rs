//! SIP Registrar - binds extensions to the contact they registered from

use super::auth::{ChallengeKind, DigestAuth};
use super::builder::{generate_tag, ResponseBuilder};
use super::message::{SipHeaders, SipMethod, SipRequest, SipResponse};
use crate::domain::extension::{ExtensionStore, Registration};
use crate::domain::ip_blacklist::IpBlacklist;
use chrono::{Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registration interval limits (seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub default_expires: u32,
    pub max_expires: u32,
    pub min_expires: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            default_expires: 3600,
            max_expires: 7200,
            min_expires: 60,
        }
    }
}

/// What the registrar decided for a REGISTER
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpiresDecision {
    Unregister,
    TooBrief,
    Bind(u32),
}

pub struct Registrar {
    config: RegistrarConfig,
    auth: Arc<DigestAuth>,
    store: Arc<dyn ExtensionStore>,
    blacklist: Arc<IpBlacklist>,
}

impl Registrar {
    pub fn new(
        config: RegistrarConfig,
        auth: Arc<DigestAuth>,
        store: Arc<dyn ExtensionStore>,
        blacklist: Arc<IpBlacklist>,
    ) -> Self {
        Self {
            config,
            auth,
            store,
            blacklist,
        }
    }

    fn decide_expires(&self, requested: Option<u32>) -> ExpiresDecision {
        match requested {
            Some(0) => ExpiresDecision::Unregister,
            Some(expires) if expires < self.config.min_expires => ExpiresDecision::TooBrief,
            Some(expires) => ExpiresDecision::Bind(expires.min(self.config.max_expires)),
            None => ExpiresDecision::Bind(self.config.default_expires.min(self.config.max_expires)),
        }
    }

    /// Contact `expires` parameter wins over the Expires header
    fn requested_expires(request: &SipRequest) -> Option<u32> {
        request
            .contact()
            .and_then(|c| c.param("expires").and_then(|v| v.parse().ok()))
            .or_else(|| request.expires())
    }

    fn is_wildcard(request: &SipRequest) -> bool {
        request.header("Contact").is_some_and(|c| c.trim() == "*")
    }

    /// Handle one REGISTER; `None` means the source is banned and gets silence
    pub async fn handle(&self, request: &SipRequest, source: SocketAddr) -> Option<SipResponse> {
        if request.method != SipMethod::Register {
            return Some(ResponseBuilder::new(405).build_for_request(request));
        }
        if self.blacklist.is_blocked(&source.ip()) {
            debug!("Ignoring REGISTER from banned source {}", source);
            return None;
        }

        let username = match self
            .auth
            .authenticate(request, ChallengeKind::Www, source.ip(), &self.blacklist)
            .await
        {
            Ok(username) => username,
            Err(response) => {
                counter!("pbx_registrations_total", "result" => "challenged").increment(1);
                return Some(response);
            }
        };

        // Credentials may only bind their own address of record
        let aor = request.to_header().and_then(|to| to.user());
        if aor.as_deref() != Some(username.as_str()) {
            warn!(
                "{} authenticated as {} but tried to register {:?}",
                source, username, aor
            );
            self.blacklist.record_auth_failure(&source.ip());
            counter!("pbx_registrations_total", "result" => "forbidden").increment(1);
            return Some(self.respond(request, 403));
        }

        let response = match self.decide_expires(Self::requested_expires(request)) {
            ExpiresDecision::TooBrief => ResponseBuilder::new(423)
                .to_tag(generate_tag())
                .header("Min-Expires", self.config.min_expires.to_string())
                .build_for_request(request),
            ExpiresDecision::Unregister => {
                if let Err(e) = self.store.remove_registration(&username).await {
                    warn!("Failed to unregister {}: {}", username, e);
                    return Some(self.respond(request, 500));
                }
                info!("Unregistered: {}", username);
                counter!("pbx_registrations_total", "result" => "unregistered").increment(1);
                ResponseBuilder::ok()
                    .to_tag(generate_tag())
                    .header("Expires", "0")
                    .build_for_request(request)
            }
            ExpiresDecision::Bind(_) if Self::is_wildcard(request) => {
                // `Contact: *` is only legal with Expires: 0
                self.respond(request, 400)
            }
            ExpiresDecision::Bind(expires) => {
                let Some(contact) = request.contact() else {
                    // A query: report the current binding
                    return Some(self.current_bindings(request, &username).await);
                };
                let registration = Registration {
                    contact: contact.uri.clone(),
                    source,
                    expires_at: Utc::now() + Duration::seconds(i64::from(expires)),
                    user_agent: request.header("User-Agent").map(str::to_string),
                };
                if let Err(e) = self.store.update_registration(&username, registration).await {
                    warn!("Failed to store registration for {}: {}", username, e);
                    return Some(self.respond(request, 500));
                }
                info!(
                    "Registered: {} -> {} from {} (expires in {}s)",
                    username, contact.uri, source, expires
                );
                counter!("pbx_registrations_total", "result" => "registered").increment(1);
                ResponseBuilder::ok()
                    .to_tag(generate_tag())
                    .header("Contact", format!("<{}>;expires={}", contact.uri, expires))
                    .header("Expires", expires.to_string())
                    .build_for_request(request)
            }
        };
        Some(response)
    }

    async fn current_bindings(&self, request: &SipRequest, username: &str) -> SipResponse {
        let mut builder = ResponseBuilder::ok().to_tag(generate_tag());
        if let Some(registration) = self.store.lookup_contact(username).await {
            let remaining = (registration.expires_at - Utc::now()).num_seconds().max(0);
            builder = builder.header(
                "Contact",
                format!("<{}>;expires={}", registration.contact, remaining),
            );
        }
        builder.build_for_request(request)
    }

    fn respond(&self, request: &SipRequest, code: u16) -> SipResponse {
        ResponseBuilder::new(code)
            .to_tag(generate_tag())
            .build_for_request(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extension::{Extension, InMemoryExtensionStore};
    use crate::domain::ip_blacklist::BlacklistConfig;
    use crate::infrastructure::protocols::sip::auth::AuthChallenge;

    const SOURCE: &str = "192.0.2.10:5060";

    struct Fixture {
        registrar: Registrar,
        auth: Arc<DigestAuth>,
        store: Arc<InMemoryExtensionStore>,
        blacklist: Arc<IpBlacklist>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryExtensionStore::new());
        store.add(Extension::new("1001", "secret")).await;
        let auth = Arc::new(DigestAuth::new("pbx.local", store.clone()));
        let blacklist = Arc::new(IpBlacklist::new(BlacklistConfig {
            max_auth_failures: 3,
            ..BlacklistConfig::default()
        }));
        let registrar = Registrar::new(
            RegistrarConfig::default(),
            auth.clone(),
            store.clone(),
            blacklist.clone(),
        );
        Fixture {
            registrar,
            auth,
            store,
            blacklist,
        }
    }

    fn register(user: &str, expires: Option<u32>) -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Register, "sip:pbx.local");
        req.headers.push("Via", "SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKreg");
        req.headers.push("From", format!("<sip:{}@pbx.local>;tag=ua", user));
        req.headers.push("To", format!("<sip:{}@pbx.local>", user));
        req.headers.push("Call-ID", "reg-call");
        req.headers.push("CSeq", "1 REGISTER");
        req.headers.push("Contact", format!("<sip:{}@192.0.2.10:5060>", user));
        if let Some(expires) = expires {
            req.headers.push("Expires", expires.to_string());
        }
        req
    }

    fn with_credentials(mut req: SipRequest, challenge: &AuthChallenge, user: &str, password: &str) -> SipRequest {
        let value = challenge.authorize(user, password, "REGISTER", "sip:pbx.local", "abc123");
        req.headers.push("Authorization", value);
        req
    }

    fn source() -> SocketAddr {
        SOURCE.parse().unwrap()
    }

    #[tokio::test]
    async fn test_unauthenticated_register_is_challenged_without_counting() {
        let f = fixture().await;
        let resp = f.registrar.handle(&register("1001", Some(3600)), source()).await.unwrap();
        assert_eq!(resp.status_code, 401);
        let challenge = AuthChallenge::parse(resp.header("WWW-Authenticate").unwrap()).unwrap();
        assert_eq!(challenge.realm, "pbx.local");
        assert_eq!(f.blacklist.failure_count(&source().ip()), 0);
    }

    #[tokio::test]
    async fn test_register_caps_expires() {
        let f = fixture().await;
        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("1001", Some(86400)), &challenge, "1001", "secret");

        let resp = f.registrar.handle(&req, source()).await.unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.expires(), Some(7200));
        assert!(f.store.is_registered("1001").await);
        assert_eq!(f.store.lookup_contact("1001").await.unwrap().source, source());
    }

    #[tokio::test]
    async fn test_wrong_password_counts_failure() {
        let f = fixture().await;
        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("1001", Some(3600)), &challenge, "1001", "wrong");

        let resp = f.registrar.handle(&req, source()).await.unwrap();
        assert_eq!(resp.status_code, 401);
        assert_eq!(f.blacklist.failure_count(&source().ip()), 1);
        assert!(!f.store.is_registered("1001").await);
    }

    #[tokio::test]
    async fn test_unknown_user_is_forbidden() {
        let f = fixture().await;
        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("2002", Some(3600)), &challenge, "2002", "x");

        let resp = f.registrar.handle(&req, source()).await.unwrap();
        assert_eq!(resp.status_code, 403);
        assert_eq!(f.blacklist.failure_count(&source().ip()), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_ban_the_source() {
        let f = fixture().await;
        for _ in 0..3 {
            let challenge = f.auth.create_challenge();
            let req = with_credentials(register("1001", Some(3600)), &challenge, "1001", "wrong");
            assert!(f.registrar.handle(&req, source()).await.is_some());
        }
        assert!(f.blacklist.is_blocked(&source().ip()));

        // Even correct credentials get silence now
        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("1001", Some(3600)), &challenge, "1001", "secret");
        assert!(f.registrar.handle(&req, source()).await.is_none());
    }

    #[tokio::test]
    async fn test_interval_too_brief() {
        let f = fixture().await;
        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("1001", Some(10)), &challenge, "1001", "secret");

        let resp = f.registrar.handle(&req, source()).await.unwrap();
        assert_eq!(resp.status_code, 423);
        assert_eq!(resp.header("Min-Expires"), Some("60"));
    }

    #[tokio::test]
    async fn test_expires_zero_unregisters() {
        let f = fixture().await;
        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("1001", Some(3600)), &challenge, "1001", "secret");
        assert_eq!(f.registrar.handle(&req, source()).await.unwrap().status_code, 200);

        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("1001", Some(0)), &challenge, "1001", "secret");
        assert_eq!(f.registrar.handle(&req, source()).await.unwrap().status_code, 200);
        assert!(!f.store.is_registered("1001").await);
    }

    #[tokio::test]
    async fn test_cannot_register_someone_else() {
        let f = fixture().await;
        f.store.add(Extension::new("1002", "other")).await;
        let challenge = f.auth.create_challenge();
        let req = with_credentials(register("1002", Some(3600)), &challenge, "1001", "secret");

        let resp = f.registrar.handle(&req, source()).await.unwrap();
        assert_eq!(resp.status_code, 403);
        assert!(!f.store.is_registered("1002").await);
    }
}
