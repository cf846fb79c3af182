//! Process-wide services shared by every call
//!
//! Nothing here is global: a test can build as many contexts as it likes,
//! each with its own port pool, registry and ban list.

use crate::config::Config;
use crate::domain::cdr::{CallEventSink, LogEventSink};
use crate::domain::dialplan::{Dialplan, DialplanError};
use crate::domain::extension::{Extension, ExtensionStore, InMemoryExtensionStore};
use crate::domain::ip_blacklist::IpBlacklist;
use crate::infrastructure::ivr::FeatureTable;
use crate::infrastructure::media::{CodecNegotiator, MediaError, NegotiationError, RtpPortPool};
use crate::infrastructure::protocols::sip::auth::DigestAuth;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Dialplan: {0}")]
    Dialplan(#[from] DialplanError),

    #[error("Codecs: {0}")]
    Codecs(#[from] NegotiationError),

    #[error("RTP ports: {0}")]
    Media(#[from] MediaError),
}

#[derive(Clone)]
pub struct CoreContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn ExtensionStore>,
    pub port_pool: Arc<RtpPortPool>,
    pub blacklist: Arc<IpBlacklist>,
    pub dialplan: Arc<Dialplan>,
    pub negotiator: Arc<CodecNegotiator>,
    pub features: Arc<FeatureTable>,
    pub events: Arc<dyn CallEventSink>,
    pub auth: Arc<DigestAuth>,
}

impl CoreContext {
    /// Build every service from configuration, seeding the in-memory
    /// registry with the configured extensions
    pub async fn from_config(config: Config) -> Result<Self, ContextError> {
        let store = Arc::new(InMemoryExtensionStore::new());
        for ext in &config.extensions {
            let mut extension = Extension::new(&ext.number, &ext.password);
            if let Some(name) = &ext.display_name {
                extension = extension.with_display_name(name);
            }
            store.add(extension).await;
        }
        Self::with_store(config, store)
    }

    /// Same, with a caller-provided registry
    pub fn with_store(config: Config, store: Arc<dyn ExtensionStore>) -> Result<Self, ContextError> {
        let dialplan = Dialplan::new(&config.dialplan_rules(), &config.trunks)?;
        let negotiator = CodecNegotiator::from_names(
            &config.codecs.priority,
            &config.codecs.unavailable,
            config.codecs.telephone_event,
        )?;
        let port_pool = RtpPortPool::new(config.media.rtp_port_start, config.media.rtp_port_end)?;

        let blacklist = IpBlacklist::new(config.security.blacklist());
        for ip in config
            .security
            .trusted_ips
            .iter()
            .chain(config.trunks.iter().flat_map(|t| t.allowed_ips.iter()))
        {
            blacklist.trust(*ip);
        }
        for trunk in &config.trunks {
            blacklist.trust(trunk.address.ip());
        }

        let auth = DigestAuth::new(config.sip.domain.clone(), store.clone())
            .with_nonce_ttl(config.security.nonce_ttl());

        info!(
            "Core ready: {} dialplan rules, {} trunks, RTP ports {}-{}",
            config.dialplan_rules().len(),
            config.trunks.len(),
            config.media.rtp_port_start,
            config.media.rtp_port_end
        );

        Ok(Self {
            store,
            port_pool: Arc::new(port_pool),
            blacklist: Arc::new(blacklist),
            dialplan: Arc::new(dialplan),
            negotiator: Arc::new(negotiator),
            features: Arc::new(FeatureTable::new()),
            events: Arc::new(LogEventSink),
            auth: Arc::new(auth),
            config: Arc::new(config),
        })
    }

    pub fn with_events(mut self, events: Arc<dyn CallEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_features(mut self, features: FeatureTable) -> Self {
        self.features = Arc::new(features);
        self
    }
}
