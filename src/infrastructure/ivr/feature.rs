//! Attach point for IVR-style features (voicemail access, park, queues)
//!
//! A feature never touches the call directly. It gets a [`FeatureSession`]:
//! playout toward the caller, the call's DTMF queue and a cancellation token
//! that fires when the call ends.

use super::dtmf::{DtmfDigit, DtmfEvent};
use super::queue::DtmfQueue;
use crate::domain::audio::WavFile;
use crate::domain::dialplan::{FeatureKind, RoutingError};
use crate::domain::shared::CallId;
use crate::infrastructure::media::relay::MediaPlayer;
use crate::infrastructure::media::MediaError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Caller hung up")]
    Hangup,

    #[error("{0}")]
    Failed(String),
}

/// Everything a feature may use while it owns the call
pub struct FeatureSession {
    call_id: CallId,
    caller: String,
    feature: FeatureKind,
    argument: String,
    player: MediaPlayer,
    dtmf: Arc<DtmfQueue>,
    cancel: CancellationToken,
}

impl FeatureSession {
    pub fn new(
        call_id: CallId,
        caller: impl Into<String>,
        feature: FeatureKind,
        argument: impl Into<String>,
        player: MediaPlayer,
        dtmf: Arc<DtmfQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            call_id,
            caller: caller.into(),
            feature,
            argument: argument.into(),
            player,
            dtmf,
            cancel,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn feature(&self) -> FeatureKind {
        self.feature
    }

    /// Digits dialed after the feature code, e.g. a park slot
    pub fn argument(&self) -> &str {
        &self.argument
    }

    /// Play a stored prompt; returns early with `Hangup` if the call ends
    pub async fn play(&self, wav: &WavFile) -> Result<(), FeatureError> {
        self.player.play(wav).await?;
        if self.cancel.is_cancelled() {
            return Err(FeatureError::Hangup);
        }
        Ok(())
    }

    /// Send a digit to the caller as RFC 2833 telephone-events
    pub async fn send_digit(&self, digit: DtmfDigit, duration: Duration) -> Result<(), FeatureError> {
        self.player.send_digit(digit, duration).await?;
        if self.cancel.is_cancelled() {
            return Err(FeatureError::Hangup);
        }
        Ok(())
    }

    /// Next digit from any detector, `None` on timeout
    pub async fn next_digit(&self, timeout: Duration) -> Result<Option<DtmfEvent>, FeatureError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FeatureError::Hangup),
            digit = self.dtmf.next_digit(timeout) => {
                if digit.is_none() && self.dtmf.is_closed() {
                    return Err(FeatureError::Hangup);
                }
                Ok(digit)
            }
        }
    }

    /// Collect up to `max` digits, stopping early at `terminator`
    pub async fn collect_digits(
        &self,
        max: usize,
        terminator: Option<char>,
        per_digit_timeout: Duration,
    ) -> Result<String, FeatureError> {
        let mut collected = String::new();
        while collected.len() < max {
            let Some(event) = self.next_digit(per_digit_timeout).await? else {
                break;
            };
            let c = event.digit.to_char();
            if Some(c) == terminator {
                break;
            }
            collected.push(c);
        }
        Ok(collected)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for FeatureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSession")
            .field("call_id", &self.call_id)
            .field("feature", &self.feature)
            .field("argument", &self.argument)
            .finish()
    }
}

/// Implemented by voicemail, parking and queue services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeatureHandler: Send + Sync {
    /// Runs while the call is connected; the call is hung up when it returns
    async fn run(&self, session: FeatureSession) -> Result<(), FeatureError>;
}

/// Handlers keyed by feature kind
#[derive(Clone, Default)]
pub struct FeatureTable {
    handlers: HashMap<FeatureKind, Arc<dyn FeatureHandler>>,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: FeatureKind, handler: Arc<dyn FeatureHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn with(mut self, kind: FeatureKind, handler: Arc<dyn FeatureHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: FeatureKind) -> Result<Arc<dyn FeatureHandler>, RoutingError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(RoutingError::FeatureUnavailable(kind))
    }

    pub fn contains(&self, kind: FeatureKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

impl fmt::Debug for FeatureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
