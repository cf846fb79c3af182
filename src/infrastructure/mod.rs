//! Infrastructure layer - Technical implementations
//!
//! - `protocols`: SIP stack and WebRTC SDP interworking
//! - `media`: RTP relay, port pool and codecs
//! - `ivr`: DTMF detection and feature sessions

pub mod ivr;
pub mod media;
pub mod protocols;
