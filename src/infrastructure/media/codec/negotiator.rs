//! Codec Negotiation
//!
//! Handles SDP offer/answer between endpoints. Each local codec declares a
//! capability: `Native` codecs can be encoded and decoded here, `PassThrough`
//! codecs are only relayed byte-for-byte, and `Unavailable` codecs are never
//! selected.

use super::g711::G711Type;
use crate::domain::call::NegotiatedCodec;
use crate::infrastructure::protocols::sip::sdp::{MediaDirection, SdpCodec, SdpSession};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("No common codec between offer and local capabilities")]
    CodecMismatch,

    #[error("Session description has no audio stream")]
    MissingMedia,

    #[error("Unknown codec in configuration: {0}")]
    UnknownCodec(String),
}

/// What the core can do with a codec's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecCapability {
    /// Encoder and decoder are implemented
    Native,
    /// Forwarded unmodified between legs, never decoded
    PassThrough,
    /// Declared but non-functional; negotiation refuses it
    Unavailable,
}

/// Who consumes the media of the negotiated stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationMode {
    /// Bridged call, the relay only forwards bytes
    Relay,
    /// The core itself plays or analyses audio
    Terminate,
}

impl NegotiationMode {
    fn accepts(&self, capability: CodecCapability) -> bool {
        match (self, capability) {
            (_, CodecCapability::Unavailable) => false,
            (NegotiationMode::Relay, _) => true,
            (NegotiationMode::Terminate, c) => c == CodecCapability::Native,
        }
    }
}

/// Codec Information
#[derive(Debug, Clone, PartialEq)]
pub struct CodecInfo {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: u8,
    pub capability: CodecCapability,
}

impl CodecInfo {
    pub fn new(payload_type: u8, name: &str, clock_rate: u32, capability: CodecCapability) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate,
            channels: 1,
            capability,
        }
    }

    pub fn pcmu() -> Self {
        Self::new(0, "PCMU", 8000, CodecCapability::Native)
    }

    pub fn pcma() -> Self {
        Self::new(8, "PCMA", 8000, CodecCapability::Native)
    }

    /// G.722 rtpmap rate is 8000 although it samples at 16 kHz
    pub fn g722() -> Self {
        Self::new(9, "G722", 8000, CodecCapability::PassThrough)
    }

    pub fn g729() -> Self {
        Self::new(18, "G729", 8000, CodecCapability::PassThrough)
    }

    pub fn gsm() -> Self {
        Self::new(3, "GSM", 8000, CodecCapability::PassThrough)
    }

    pub fn opus() -> Self {
        Self {
            channels: 2,
            ..Self::new(111, "opus", 48000, CodecCapability::Unavailable)
        }
    }

    /// Look up a codec by its rtpmap name
    pub fn by_name(name: &str) -> Option<Self> {
        [Self::pcmu(), Self::pcma(), Self::g722(), Self::g729(), Self::gsm(), Self::opus()]
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Get encoding name for rtpmap
    pub fn encoding(&self) -> String {
        format!("{}/{}", self.name, self.clock_rate)
    }

    pub fn g711(&self) -> Option<G711Type> {
        G711Type::from_name(&self.name)
    }

    /// Static types match by number, dynamic ones by name and clock rate
    pub fn matches(&self, offered: &SdpCodec) -> bool {
        if offered.payload_type < 96 && self.payload_type < 96 {
            offered.payload_type == self.payload_type
        } else {
            offered.name.eq_ignore_ascii_case(&self.name) && offered.clock_rate == self.clock_rate
        }
    }

    pub fn to_sdp(&self) -> SdpCodec {
        let mut codec = SdpCodec::new(self.payload_type, &self.name, self.clock_rate);
        if self.channels > 1 {
            codec.channels = Some(self.channels);
        }
        codec
    }
}

/// Outcome of one offer/answer exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    /// Selected audio codecs, best first, using the offerer's payload numbers
    pub codecs: Vec<SdpCodec>,
    pub telephone_event: Option<SdpCodec>,
}

impl Negotiated {
    pub fn primary(&self) -> &SdpCodec {
        // `negotiate` never yields an empty list
        &self.codecs[0]
    }

    /// Codec list as it appears on an `m=` line
    pub fn sdp_codecs(&self) -> Vec<SdpCodec> {
        self.codecs
            .iter()
            .chain(self.telephone_event.iter())
            .cloned()
            .collect()
    }

    pub fn to_call_codec(&self) -> NegotiatedCodec {
        let primary = self.primary();
        NegotiatedCodec {
            payload_type: primary.payload_type,
            encoding: primary.name.clone(),
            clock_rate: primary.clock_rate,
            telephone_event: self.telephone_event.as_ref().map(|te| te.payload_type),
        }
    }

    pub fn g711(&self) -> Option<G711Type> {
        G711Type::from_name(&self.primary().name)
    }
}

/// Codec Negotiator
#[derive(Debug, Clone)]
pub struct CodecNegotiator {
    /// Local priority order
    local: Vec<CodecInfo>,
    /// Local telephone-event payload type, `None` disables RFC 2833
    telephone_event: Option<u8>,
}

impl CodecNegotiator {
    pub fn new(local: Vec<CodecInfo>, telephone_event: Option<u8>) -> Self {
        Self {
            local,
            telephone_event,
        }
    }

    /// Build from codec names in priority order; names in `unavailable` get the
    /// non-functional marker
    pub fn from_names(
        priority: &[String],
        unavailable: &[String],
        telephone_event: Option<u8>,
    ) -> Result<Self, NegotiationError> {
        let local = priority
            .iter()
            .map(|name| {
                let mut codec = CodecInfo::by_name(name)
                    .ok_or_else(|| NegotiationError::UnknownCodec(name.clone()))?;
                if unavailable.iter().any(|u| u.eq_ignore_ascii_case(name)) {
                    codec.capability = CodecCapability::Unavailable;
                }
                Ok(codec)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(local, telephone_event))
    }

    pub fn local_codecs(&self) -> &[CodecInfo] {
        &self.local
    }

    /// Intersection of the offer with local codecs, ordered by local priority
    pub fn negotiate(
        &self,
        offered: &[SdpCodec],
        mode: NegotiationMode,
    ) -> Result<Negotiated, NegotiationError> {
        let codecs: Vec<SdpCodec> = self
            .local
            .iter()
            .filter(|local| mode.accepts(local.capability))
            .filter_map(|local| {
                offered
                    .iter()
                    .find(|o| !o.is_telephone_event() && local.matches(o))
                    .cloned()
            })
            .collect();

        if codecs.is_empty() {
            return Err(NegotiationError::CodecMismatch);
        }

        let telephone_event = self.telephone_event.and_then(|_| {
            let rate = codecs[0].clock_rate;
            let mut events = offered.iter().filter(|o| o.is_telephone_event());
            let first = events.clone().next().cloned();
            events.find(|o| o.clock_rate == rate).cloned().or(first)
        });

        Ok(Negotiated {
            codecs,
            telephone_event,
        })
    }

    /// Negotiate against the first audio stream of `offer`
    pub fn negotiate_session(
        &self,
        offer: &SdpSession,
        mode: NegotiationMode,
    ) -> Result<Negotiated, NegotiationError> {
        let audio = offer.first_audio().ok_or(NegotiationError::MissingMedia)?;
        self.negotiate(&audio.codecs(), mode)
    }

    /// Answer SDP for `offer`, with media anchored at `address:port`
    pub fn answer(
        &self,
        offer: &SdpSession,
        address: IpAddr,
        port: u16,
        session_id: u64,
        mode: NegotiationMode,
    ) -> Result<(SdpSession, Negotiated), NegotiationError> {
        let negotiated = self.negotiate_session(offer, mode)?;
        let direction = offer.audio_direction().reverse();
        let sdp = SdpSession::audio(address, session_id, port, &negotiated.sdp_codecs(), direction);
        Ok((sdp, negotiated))
    }

    /// Fresh offer listing every codec usable in `mode`
    pub fn offer(&self, address: IpAddr, port: u16, session_id: u64, mode: NegotiationMode) -> SdpSession {
        let mut codecs: Vec<SdpCodec> = self
            .local
            .iter()
            .filter(|c| mode.accepts(c.capability))
            .map(CodecInfo::to_sdp)
            .collect();
        if let Some(pt) = self.telephone_event {
            codecs.push(SdpCodec::new(pt, "telephone-event", 8000).with_fmtp("0-16"));
        }
        SdpSession::audio(address, session_id, port, &codecs, MediaDirection::SendRecv)
    }

    /// Pick the answerer's choice among what we offered
    pub fn accept_answer(
        &self,
        offered: &Negotiated,
        answer: &SdpSession,
    ) -> Result<Negotiated, NegotiationError> {
        let audio = answer.first_audio().ok_or(NegotiationError::MissingMedia)?;
        let answered = audio.codecs();

        let codecs: Vec<SdpCodec> = answered
            .iter()
            .filter(|a| !a.is_telephone_event())
            .filter_map(|a| offered.codecs.iter().find(|o| same_codec(o, a)).cloned())
            .collect();
        if codecs.is_empty() {
            return Err(NegotiationError::CodecMismatch);
        }

        let telephone_event = offered
            .telephone_event
            .clone()
            .filter(|_| answered.iter().any(SdpCodec::is_telephone_event));

        Ok(Negotiated {
            codecs,
            telephone_event,
        })
    }
}

fn same_codec(a: &SdpCodec, b: &SdpCodec) -> bool {
    if a.payload_type < 96 && b.payload_type < 96 {
        a.payload_type == b.payload_type
    } else {
        a.name.eq_ignore_ascii_case(&b.name) && a.clock_rate == b.clock_rate
    }
}

impl Default for CodecNegotiator {
    fn default() -> Self {
        Self::new(vec![CodecInfo::pcmu(), CodecInfo::pcma(), CodecInfo::g722()], Some(101))
    }
}
