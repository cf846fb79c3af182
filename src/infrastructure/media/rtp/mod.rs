//! RTP (Real-time Transport Protocol) Implementation
//!
//! Packet codec per RFC 3550 plus the counters kept by the relay.

pub mod packet;
pub mod stats;

pub use packet::{RtpError, RtpHeader, RtpPacket, RtpSequencer};
pub use stats::{RelayStats, StreamCounters, StreamStats};
