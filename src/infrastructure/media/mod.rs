//! Media plane: RTP relay, port pool, codecs and playout

pub mod codec;
pub mod error;
pub mod playout;
pub mod port_pool;
pub mod relay;
pub mod rtp;

pub use codec::{CodecCapability, CodecInfo, CodecNegotiator, G711Type, Negotiated, NegotiationError, NegotiationMode};
pub use error::MediaError;
pub use playout::PlayoutFrames;
pub use port_pool::{PortLease, PortPair, RtpPortPool};
pub use relay::{Leg, MediaPlayer, MediaRelay, RelayConfig, RelayEvent, RelayParams, TappedAudio};
pub use rtp::{RelayStats, RtpPacket, StreamStats};
