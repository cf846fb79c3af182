//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Inbound call from a trunk
    Inbound,
    /// Outbound call to a trunk
    Outbound,
    /// Internal call between extensions or to a feature
    Internal,
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Connected,
    Hold,
    Ended,
}

impl CallState {
    /// Transition table. `None` means the trigger is not defined for this state.
    pub fn next(self, trigger: CallTrigger) -> Option<CallState> {
        use CallState::*;
        use CallTrigger as T;

        match (self, trigger) {
            (Idle, T::Dial) => Some(Calling),

            (Calling, T::Ring) => Some(Ringing),
            (Ringing, T::Ring) => Some(Ringing),
            (Ringing, T::Answer) => Some(Connected),

            (Calling | Ringing, T::Reject(_))
            | (Calling | Ringing, T::Cancel)
            | (Calling | Ringing, T::Timeout)
            | (Calling | Ringing, T::MediaFailure) => Some(Ended),

            (Connected, T::Hold) => Some(Hold),
            (Hold, T::Resume) => Some(Connected),

            (Connected | Hold, T::Hangup(_)) | (Connected | Hold, T::MediaFailure) => Some(Ended),

            _ => None,
        }
    }

    pub fn can_apply(self, trigger: CallTrigger) -> bool {
        self.next(trigger).is_some()
    }

    pub fn is_active(self) -> bool {
        !matches!(self, CallState::Ended)
    }

    /// Connected or on hold
    pub fn is_answered(self) -> bool {
        matches!(self, CallState::Connected | CallState::Hold)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Hold => "hold",
            CallState::Ended => "ended",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the call acted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    Caller,
    Callee,
    /// The exchange itself (timeouts, features finishing)
    System,
}

/// Inputs to the call state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallTrigger {
    Dial,
    Ring,
    Answer,
    Hold,
    Resume,
    /// Final non-2xx from the far end or a local refusal, with its status code
    Reject(u16),
    Cancel,
    Timeout,
    Hangup(Party),
    MediaFailure,
}

impl CallTrigger {
    pub const ALL: [CallTrigger; 12] = [
        CallTrigger::Dial,
        CallTrigger::Ring,
        CallTrigger::Answer,
        CallTrigger::Hold,
        CallTrigger::Resume,
        CallTrigger::Reject(486),
        CallTrigger::Cancel,
        CallTrigger::Timeout,
        CallTrigger::Hangup(Party::Caller),
        CallTrigger::Hangup(Party::Callee),
        CallTrigger::Hangup(Party::System),
        CallTrigger::MediaFailure,
    ];
}

impl fmt::Display for CallTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTrigger::Reject(code) => write!(f, "reject({})", code),
            CallTrigger::Hangup(party) => write!(f, "hangup({:?})", party),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Reason for call ending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    CallerHangup,
    CalleeHangup,
    SystemHangup,
    Rejected(u16),
    Busy,
    Cancelled,
    NoAnswer,
    MediaFailure,
}

impl EndReason {
    fn from_trigger(trigger: CallTrigger) -> Option<Self> {
        match trigger {
            CallTrigger::Hangup(Party::Caller) => Some(EndReason::CallerHangup),
            CallTrigger::Hangup(Party::Callee) => Some(EndReason::CalleeHangup),
            CallTrigger::Hangup(Party::System) => Some(EndReason::SystemHangup),
            CallTrigger::Reject(486) | CallTrigger::Reject(600) => Some(EndReason::Busy),
            CallTrigger::Reject(code) => Some(EndReason::Rejected(code)),
            CallTrigger::Cancel => Some(EndReason::Cancelled),
            CallTrigger::Timeout => Some(EndReason::NoAnswer),
            CallTrigger::MediaFailure => Some(EndReason::MediaFailure),
            _ => None,
        }
    }

    pub(crate) fn for_trigger(trigger: CallTrigger) -> Self {
        Self::from_trigger(trigger).unwrap_or(EndReason::SystemHangup)
    }
}

/// How a finished call is reported to the lifecycle sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Cancelled,
    Rejected,
    Failed,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Answered => "answered",
            Disposition::NoAnswer => "no-answer",
            Disposition::Busy => "busy",
            Disposition::Cancelled => "cancelled",
            Disposition::Rejected => "rejected",
            Disposition::Failed => "failed",
        }
    }

    pub fn from_end(answered: bool, reason: EndReason) -> Self {
        if answered {
            return Disposition::Answered;
        }
        match reason {
            EndReason::Busy => Disposition::Busy,
            EndReason::Cancelled => Disposition::Cancelled,
            EndReason::NoAnswer => Disposition::NoAnswer,
            EndReason::Rejected(_) => Disposition::Rejected,
            _ => Disposition::Failed,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec agreed for the call's media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedCodec {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub telephone_event: Option<u8>,
}

/// Reference to the RTP port pair a call is using.
///
/// Only one call holds a given reference at a time; it moves between calls
/// through `Call::take_media` / `Call::attach_media`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpEndpointRef {
    pub local: SocketAddr,
    pub remotes: Vec<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert_eq!(CallState::Idle.next(CallTrigger::Dial), Some(CallState::Calling));
        assert_eq!(CallState::Calling.next(CallTrigger::Ring), Some(CallState::Ringing));
        assert_eq!(CallState::Ringing.next(CallTrigger::Answer), Some(CallState::Connected));
        assert_eq!(CallState::Connected.next(CallTrigger::Hold), Some(CallState::Hold));
        assert_eq!(CallState::Hold.next(CallTrigger::Resume), Some(CallState::Connected));
        assert_eq!(
            CallState::Connected.next(CallTrigger::Hangup(Party::Caller)),
            Some(CallState::Ended)
        );
    }

    #[test]
    fn test_early_termination_bypasses_connected() {
        for state in [CallState::Calling, CallState::Ringing] {
            assert_eq!(state.next(CallTrigger::Cancel), Some(CallState::Ended));
            assert_eq!(state.next(CallTrigger::Timeout), Some(CallState::Ended));
            assert_eq!(state.next(CallTrigger::Reject(603)), Some(CallState::Ended));
        }
    }

    #[test]
    fn test_undefined_transitions() {
        assert!(!CallState::Calling.can_apply(CallTrigger::Answer));
        assert!(!CallState::Connected.can_apply(CallTrigger::Cancel));
        assert!(!CallState::Ringing.can_apply(CallTrigger::Hangup(Party::Caller)));
        for trigger in CallTrigger::ALL {
            assert!(!CallState::Ended.can_apply(trigger));
        }
    }

    #[test]
    fn test_disposition_mapping() {
        assert_eq!(Disposition::from_end(true, EndReason::CalleeHangup), Disposition::Answered);
        assert_eq!(Disposition::from_end(false, EndReason::Busy), Disposition::Busy);
        assert_eq!(Disposition::from_end(false, EndReason::NoAnswer).as_str(), "no-answer");
        assert_eq!(
            EndReason::for_trigger(CallTrigger::Reject(486)),
            EndReason::Busy
        );
    }
}
