//! Audio Codec Implementations

pub mod g711;
pub mod negotiator;

pub use g711::{G711Type, PcmaCodec, PcmuCodec};
pub use negotiator::{
    CodecCapability, CodecInfo, CodecNegotiator, Negotiated, NegotiationError, NegotiationMode,
};
