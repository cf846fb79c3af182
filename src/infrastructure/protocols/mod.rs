//! Signalling protocols: SIP and the WebRTC SDP dialect

pub mod sip;
pub mod webrtc;
