//! Call lifecycle events

use crate::domain::call::value_object::{CallDirection, Disposition, EndReason};
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events recorded by the call aggregate and drained by its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    Started {
        call_id: CallId,
        caller: String,
        callee: String,
        direction: CallDirection,
        at: DateTime<Utc>,
    },
    Answered {
        call_id: CallId,
        at: DateTime<Utc>,
    },
    Ended {
        call_id: CallId,
        reason: EndReason,
        disposition: Disposition,
        at: DateTime<Utc>,
        /// Talk time in milliseconds, present only for answered calls
        duration_ms: Option<i64>,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> CallId {
        match self {
            CallEvent::Started { call_id, .. }
            | CallEvent::Answered { call_id, .. }
            | CallEvent::Ended { call_id, .. } => *call_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            CallEvent::Started { .. } => "call.started",
            CallEvent::Answered { .. } => "call.answered",
            CallEvent::Ended { .. } => "call.ended",
        }
    }
}
