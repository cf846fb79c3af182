//! Per-call DTMF arbitration queue
//!
//! Three producers feed one queue: the SIP INFO handler, the RFC 2833
//! receiver and the in-band detector. Out-of-band digits are always served
//! first; in-band digits are handed out only while no out-of-band digit is
//! waiting. One physical key press reported by several detectors is kept
//! once: a digit from a different source inside the debounce window is a
//! duplicate, and an out-of-band report replaces a still-queued in-band one.

use super::dtmf::{DtmfDigit, DtmfEvent, DtmfSource};
use metrics::counter;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DtmfQueueConfig {
    /// Window in which the same digit from another source is a duplicate
    pub debounce_ms: u64,
    /// Longest sleep between checks in `next_digit`
    pub poll_interval_ms: u64,
}

impl Default for DtmfQueueConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 400,
            poll_interval_ms: 20,
        }
    }
}

impl DtmfQueueConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// A digit accepted recently, and which other sources already echoed it
#[derive(Debug)]
struct Accepted {
    digit: DtmfDigit,
    source: DtmfSource,
    at: Instant,
    echoed_by: Vec<DtmfSource>,
}

#[derive(Debug, Default)]
struct QueueState {
    out_of_band: VecDeque<DtmfEvent>,
    in_band: VecDeque<DtmfEvent>,
    recent: VecDeque<Accepted>,
    closed: bool,
}

/// What happened to a pushed digit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Replaced a queued in-band report of the same key press
    Replaced,
    Duplicate,
    Closed,
}

#[derive(Debug)]
pub struct DtmfQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    debounce: Duration,
    poll_interval: Duration,
}

impl DtmfQueue {
    pub fn new(config: &DtmfQueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            debounce: config.debounce(),
            poll_interval: config.poll_interval(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: DtmfEvent) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            self.arbitrate(&mut state, event)
        };

        if matches!(outcome, PushOutcome::Queued | PushOutcome::Replaced) {
            self.notify.notify_one();
        }
        outcome
    }

    fn arbitrate(&self, state: &mut QueueState, event: DtmfEvent) -> PushOutcome {
        let now = event.at;
        while state
            .recent
            .front()
            .is_some_and(|a| now.saturating_duration_since(a.at) > self.debounce)
        {
            state.recent.pop_front();
        }

        let echo = state.recent.iter_mut().find(|a| {
            a.digit == event.digit && a.source != event.source && !a.echoed_by.contains(&event.source)
        });

        if let Some(accepted) = echo {
            accepted.echoed_by.push(event.source);

            // An out-of-band report wins over an in-band one not yet consumed
            if accepted.source == DtmfSource::InBand && event.source.is_out_of_band() {
                if let Some(index) = state.in_band.iter().position(|e| e.digit == event.digit) {
                    state.in_band.remove(index);
                    accepted.source = event.source;
                    debug!("{} '{}' replaced queued in-band report", event.source.as_str(), event.digit);
                    state.out_of_band.push_back(event);
                    return PushOutcome::Replaced;
                }
            }

            trace!("Dropping duplicate '{}' from {}", event.digit, event.source.as_str());
            return PushOutcome::Duplicate;
        }

        counter!("pbx_dtmf_digits_total", "source" => event.source.as_str()).increment(1);
        debug!("DTMF '{}' via {}", event.digit, event.source.as_str());

        state.recent.push_back(Accepted {
            digit: event.digit,
            source: event.source,
            at: now,
            echoed_by: Vec::new(),
        });
        if event.source.is_out_of_band() {
            state.out_of_band.push_back(event);
        } else {
            state.in_band.push_back(event);
        }
        PushOutcome::Queued
    }

    /// Pop one digit if any is waiting
    pub fn try_next(&self) -> Option<DtmfEvent> {
        let mut state = self.lock();
        match state.out_of_band.pop_front() {
            Some(event) => Some(event),
            None => state.in_band.pop_front(),
        }
    }

    /// Wait up to `timeout` for a digit. Returns `None` on timeout or once
    /// the queue is closed.
    pub async fn next_digit(&self, timeout: Duration) -> Option<DtmfEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();

            if let Some(event) = self.try_next() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining.min(self.poll_interval), notified).await;
        }
    }

    /// Stop accepting digits and discard whatever is queued
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            let dropped = state.out_of_band.len() + state.in_band.len();
            if dropped > 0 {
                debug!("Discarding {} unread DTMF digits", dropped);
            }
            state.out_of_band.clear();
            state.in_band.clear();
            state.recent.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        state.out_of_band.len() + state.in_band.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl Default for DtmfQueue {
    fn default() -> Self {
        Self::new(&DtmfQueueConfig::default())
    }
}
