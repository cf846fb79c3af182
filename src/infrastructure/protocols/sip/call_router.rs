//! Call Router
//!
//! Keeps the handle of every live call worker and routes inbound SIP traffic
//! to it by Call-ID. A bridged call answers to two Call-IDs, one per leg.

use super::message::SipMessage;
use super::transport::TransportProtocol;
use crate::domain::shared::CallId;
use crate::infrastructure::media::relay::MediaRelay;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// What a call worker can be asked to do
#[derive(Debug)]
pub enum CallInput {
    /// A request or response for one of the call's legs
    Sip {
        message: SipMessage,
        source: SocketAddr,
        protocol: TransportProtocol,
    },
    /// Give up the relay; the worker keeps running without media
    DetachMedia(oneshot::Sender<Option<MediaRelay>>),
    /// Take over a relay detached from another call
    AttachMedia(MediaRelay, oneshot::Sender<Result<(), TransferError>>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Call {0} not found")]
    CallNotFound(CallId),

    #[error("Call {0} has no media to transfer")]
    NoMedia(CallId),

    #[error("Call {0} cannot take media: {1}")]
    Rejected(CallId, String),
}

#[derive(Debug, Clone)]
struct CallHandle {
    tx: mpsc::Sender<CallInput>,
    sip_call_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct Tables {
    calls: HashMap<CallId, CallHandle>,
    by_sip_call_id: HashMap<String, CallId>,
}

/// Registry of live call workers
#[derive(Debug, Default)]
pub struct CallManager {
    tables: Mutex<Tables>,
}

impl CallManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker under the caller leg's Call-ID
    pub fn insert(&self, call_id: CallId, sip_call_id: &str, tx: mpsc::Sender<CallInput>) {
        let mut tables = self.lock();
        tables.calls.insert(
            call_id,
            CallHandle {
                tx,
                sip_call_ids: vec![sip_call_id.to_string()],
            },
        );
        tables.by_sip_call_id.insert(sip_call_id.to_string(), call_id);
        debug!("Call {} registered for Call-ID {}", call_id, sip_call_id);
    }

    /// Route another Call-ID (the outbound leg) to the same worker
    pub fn alias(&self, sip_call_id: &str, call_id: CallId) {
        let mut tables = self.lock();
        let Some(handle) = tables.calls.get_mut(&call_id) else {
            warn!("Cannot alias {} to unknown call {}", sip_call_id, call_id);
            return;
        };
        handle.sip_call_ids.push(sip_call_id.to_string());
        tables.by_sip_call_id.insert(sip_call_id.to_string(), call_id);
    }

    pub fn lookup(&self, sip_call_id: &str) -> Option<CallId> {
        self.lock().by_sip_call_id.get(sip_call_id).copied()
    }

    pub fn contains(&self, call_id: CallId) -> bool {
        self.lock().calls.contains_key(&call_id)
    }

    fn sender(&self, call_id: CallId) -> Option<mpsc::Sender<CallInput>> {
        self.lock().calls.get(&call_id).map(|h| h.tx.clone())
    }

    /// Hand a message to the worker owning `sip_call_id`; false if none does
    pub async fn dispatch(&self, sip_call_id: &str, input: CallInput) -> bool {
        let tx = {
            let tables = self.lock();
            tables
                .by_sip_call_id
                .get(sip_call_id)
                .and_then(|id| tables.calls.get(id))
                .map(|h| h.tx.clone())
        };
        match tx {
            Some(tx) => tx.send(input).await.is_ok(),
            None => false,
        }
    }

    /// Forget a finished call and all of its Call-IDs
    pub fn remove(&self, call_id: CallId) {
        let mut tables = self.lock();
        if let Some(handle) = tables.calls.remove(&call_id) {
            for sip_call_id in handle.sip_call_ids {
                tables.by_sip_call_id.remove(&sip_call_id);
            }
            debug!("Call {} removed", call_id);
        }
    }

    pub fn count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn active_calls(&self) -> Vec<CallId> {
        self.lock().calls.keys().copied().collect()
    }

    /// Move the RTP relay, and the endpoint reference with it, from one call to another
    pub async fn transfer_media(&self, from: CallId, to: CallId) -> Result<(), TransferError> {
        let from_tx = self.sender(from).ok_or(TransferError::CallNotFound(from))?;
        let to_tx = self.sender(to).ok_or(TransferError::CallNotFound(to))?;

        let (detach_tx, detach_rx) = oneshot::channel();
        from_tx
            .send(CallInput::DetachMedia(detach_tx))
            .await
            .map_err(|_| TransferError::CallNotFound(from))?;
        let relay = detach_rx
            .await
            .map_err(|_| TransferError::CallNotFound(from))?
            .ok_or(TransferError::NoMedia(from))?;

        let (attach_tx, attach_rx) = oneshot::channel();
        to_tx
            .send(CallInput::AttachMedia(relay, attach_tx))
            .await
            .map_err(|_| TransferError::CallNotFound(to))?;
        attach_rx.await.map_err(|_| TransferError::CallNotFound(to))??;

        info!("Media transferred from call {} to call {}", from, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_by_either_call_id() {
        let manager = CallManager::new();
        let call_id = CallId::new();
        let (tx, mut rx) = mpsc::channel(4);
        manager.insert(call_id, "leg-a", tx);
        manager.alias("leg-b", call_id);

        let (detach, _) = oneshot::channel();
        assert!(manager.dispatch("leg-b", CallInput::DetachMedia(detach)).await);
        assert!(matches!(rx.recv().await, Some(CallInput::DetachMedia(_))));

        let (detach, _) = oneshot::channel();
        assert!(!manager.dispatch("unknown", CallInput::DetachMedia(detach)).await);

        manager.remove(call_id);
        assert_eq!(manager.count(), 0);
        assert_eq!(manager.lookup("leg-a"), None);
        assert_eq!(manager.lookup("leg-b"), None);
    }

    #[tokio::test]
    async fn test_transfer_without_media_fails() {
        let manager = CallManager::new();
        let (from, to) = (CallId::new(), CallId::new());
        let (from_tx, mut from_rx) = mpsc::channel(4);
        let (to_tx, _to_rx) = mpsc::channel(4);
        manager.insert(from, "from", from_tx);
        manager.insert(to, "to", to_tx);

        // The source worker answers that it holds no relay
        tokio::spawn(async move {
            if let Some(CallInput::DetachMedia(reply)) = from_rx.recv().await {
                let _ = reply.send(None);
            }
        });

        assert_eq!(
            manager.transfer_media(from, to).await,
            Err(TransferError::NoMedia(from))
        );

        let missing = CallId::new();
        assert_eq!(
            manager.transfer_media(from, missing).await,
            Err(TransferError::CallNotFound(missing))
        );
    }
}
