//! Extension registry
//!
//! Numbers, their SIP credentials and where each one is currently
//! registered. The registrar writes registrations; routing only reads.

use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Where an extension can currently be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Contact URI as sent in REGISTER
    pub contact: String,
    /// Transport address the REGISTER arrived from
    pub source: SocketAddr,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
}

impl Registration {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct Extension {
    pub number: String,
    pub display_name: Option<String>,
    pub password: String,
    pub registration: Option<Registration>,
}

impl Extension {
    pub fn new(number: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            display_name: None,
            password: password.into(),
            registration: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[async_trait]
pub trait ExtensionStore: Send + Sync {
    async fn get_credentials(&self, number: &str) -> Option<Credentials>;

    /// True only while an unexpired registration exists
    async fn is_registered(&self, number: &str) -> bool;

    async fn lookup_contact(&self, number: &str) -> Option<Registration>;

    async fn update_registration(&self, number: &str, registration: Registration) -> Result<()>;

    async fn remove_registration(&self, number: &str) -> Result<()>;

    /// Drop expired registrations; returns how many went
    async fn purge_expired(&self) -> usize {
        0
    }
}

/// In-process extension registry
#[derive(Debug, Default)]
pub struct InMemoryExtensionStore {
    extensions: RwLock<HashMap<String, Extension>>,
}

impl InMemoryExtensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, extension: Extension) {
        info!("Provisioned extension {}", extension.number);
        self.extensions
            .write()
            .await
            .insert(extension.number.clone(), extension);
    }

    pub async fn count(&self) -> usize {
        self.extensions.read().await.len()
    }

    /// Drop registrations whose expiry has passed
    pub async fn purge_expired(&self) -> usize {
        let mut extensions = self.extensions.write().await;
        let mut purged = 0;
        for extension in extensions.values_mut() {
            if extension.registration.as_ref().is_some_and(Registration::is_expired) {
                debug!("Registration for {} expired", extension.number);
                extension.registration = None;
                purged += 1;
            }
        }
        purged
    }
}

#[async_trait]
impl ExtensionStore for InMemoryExtensionStore {
    async fn get_credentials(&self, number: &str) -> Option<Credentials> {
        self.extensions.read().await.get(number).map(|ext| Credentials {
            username: ext.number.clone(),
            password: ext.password.clone(),
        })
    }

    async fn is_registered(&self, number: &str) -> bool {
        self.lookup_contact(number).await.is_some()
    }

    async fn lookup_contact(&self, number: &str) -> Option<Registration> {
        self.extensions
            .read()
            .await
            .get(number)
            .and_then(|ext| ext.registration.clone())
            .filter(|reg| !reg.is_expired())
    }

    async fn update_registration(&self, number: &str, registration: Registration) -> Result<()> {
        let mut extensions = self.extensions.write().await;
        let extension = extensions
            .get_mut(number)
            .ok_or_else(|| DomainError::NotFound(format!("extension {}", number)))?;
        extension.registration = Some(registration);
        Ok(())
    }

    async fn remove_registration(&self, number: &str) -> Result<()> {
        let mut extensions = self.extensions.write().await;
        let extension = extensions
            .get_mut(number)
            .ok_or_else(|| DomainError::NotFound(format!("extension {}", number)))?;
        extension.registration = None;
        Ok(())
    }

    async fn purge_expired(&self) -> usize {
        InMemoryExtensionStore::purge_expired(self).await
    }
}
