//! WebRTC interworking
pub mod sdp;

pub use sdp::{to_sip, to_webrtc, DtlsFingerprint, DtlsSetup, IceCredentials};
