//! Call aggregate root

use crate::domain::call::event::CallEvent;
use crate::domain::call::value_object::{
    CallDirection, CallState, CallTrigger, Disposition, EndReason, NegotiatedCodec, Party,
    RtpEndpointRef,
};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};

/// Call aggregate root
///
/// Every state change goes through [`Call::apply`], which consults the
/// transition table in [`CallState::next`]. An undefined transition is
/// returned as an error and leaves the call untouched.
#[derive(Debug, Clone)]
pub struct Call {
    id: CallId,
    direction: CallDirection,
    /// Calling extension or remote user
    caller: String,
    /// Dialed string
    callee: String,
    state: CallState,
    codec: Option<NegotiatedCodec>,
    media: Option<RtpEndpointRef>,
    started_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<EndReason>,
    events: Vec<CallEvent>,
}

impl Call {
    pub fn new(id: CallId, caller: impl Into<String>, callee: impl Into<String>, direction: CallDirection) -> Self {
        Self {
            id,
            direction,
            caller: caller.into(),
            callee: callee.into(),
            state: CallState::Idle,
            codec: None,
            media: None,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            events: Vec::new(),
        }
    }

    /// Apply a trigger through the transition table
    pub fn apply(&mut self, trigger: CallTrigger) -> Result<CallState> {
        let next = self.state.next(trigger).ok_or_else(|| DomainError::InvalidStateTransition {
            from: self.state.to_string(),
            trigger: trigger.to_string(),
        })?;

        let previous = self.state;
        self.state = next;
        let now = Utc::now();

        match (previous, next) {
            (CallState::Idle, CallState::Calling) => {
                self.started_at = now;
                self.record_event(CallEvent::Started {
                    call_id: self.id,
                    caller: self.caller.clone(),
                    callee: self.callee.clone(),
                    direction: self.direction,
                    at: now,
                });
            }
            (CallState::Ringing, CallState::Connected) => {
                self.answered_at = Some(now);
                self.record_event(CallEvent::Answered { call_id: self.id, at: now });
            }
            (_, CallState::Ended) => {
                let reason = EndReason::for_trigger(trigger);
                self.ended_at = Some(now);
                self.end_reason = Some(reason);
                let answered = previous.is_answered();
                self.record_event(CallEvent::Ended {
                    call_id: self.id,
                    reason,
                    disposition: Disposition::from_end(answered, reason),
                    at: now,
                    duration_ms: self.duration().map(|d| d.num_milliseconds()),
                });
            }
            _ => {}
        }

        Ok(next)
    }

    pub fn dial(&mut self) -> Result<CallState> {
        self.apply(CallTrigger::Dial)
    }

    pub fn ring(&mut self) -> Result<CallState> {
        self.apply(CallTrigger::Ring)
    }

    pub fn answer(&mut self, codec: NegotiatedCodec) -> Result<CallState> {
        let state = self.apply(CallTrigger::Answer)?;
        self.codec = Some(codec);
        Ok(state)
    }

    pub fn hold(&mut self) -> Result<CallState> {
        self.apply(CallTrigger::Hold)
    }

    pub fn resume(&mut self) -> Result<CallState> {
        self.apply(CallTrigger::Resume)
    }

    pub fn hangup(&mut self, by: Party) -> Result<CallState> {
        self.apply(CallTrigger::Hangup(by))
    }

    /// Attach an RTP endpoint. A call holds at most one.
    pub fn attach_media(&mut self, media: RtpEndpointRef) -> Result<()> {
        if !self.state.is_active() {
            return Err(DomainError::ValidationError(format!(
                "call {} has ended, cannot attach media",
                self.id
            )));
        }
        if self.media.is_some() {
            return Err(DomainError::AlreadyExists(format!("media endpoint on call {}", self.id)));
        }
        self.media = Some(media);
        Ok(())
    }

    /// Give up the RTP endpoint, typically to hand it to another call
    pub fn take_media(&mut self) -> Option<RtpEndpointRef> {
        self.media.take()
    }

    fn record_event(&mut self, event: CallEvent) {
        self.events.push(event);
    }

    /// Take all pending events
    pub fn take_events(&mut self) -> Vec<CallEvent> {
        std::mem::take(&mut self.events)
    }

    // Getters
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn callee(&self) -> &str {
        &self.callee
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn codec(&self) -> Option<&NegotiatedCodec> {
        self.codec.as_ref()
    }

    pub fn media(&self) -> Option<&RtpEndpointRef> {
        self.media.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        self.answered_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.answered_at
            .and_then(|answered| self.ended_at.map(|ended| ended - answered))
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}
