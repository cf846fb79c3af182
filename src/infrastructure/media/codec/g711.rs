//! G.711 Audio Codec Implementation
//!
//! G.711 is a narrowband audio codec that provides toll-quality audio at 64 kbit/s.
//! It includes two companding laws:
//! - μ-law (PCMU): payload type 0
//! - A-law (PCMA): payload type 8
//!
//! Both are computed per sample rather than through lookup tables.

use bytes::Bytes;

/// G.711 Codec Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Type {
    /// μ-law (PCMU) - Payload Type 0
    PCMU,
    /// A-law (PCMA) - Payload Type 8
    PCMA,
}

impl G711Type {
    /// Get RTP payload type
    pub fn payload_type(&self) -> u8 {
        match self {
            G711Type::PCMU => 0,
            G711Type::PCMA => 8,
        }
    }

    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        match payload_type {
            0 => Some(G711Type::PCMU),
            8 => Some(G711Type::PCMA),
            _ => None,
        }
    }

    /// Match an rtpmap encoding name
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("PCMU") {
            Some(G711Type::PCMU)
        } else if name.eq_ignore_ascii_case("PCMA") {
            Some(G711Type::PCMA)
        } else {
            None
        }
    }

    /// Get clock rate (always 8000 Hz for G.711)
    pub fn clock_rate(&self) -> u32 {
        8000
    }

    /// Get codec name
    pub fn name(&self) -> &str {
        match self {
            G711Type::PCMU => "PCMU",
            G711Type::PCMA => "PCMA",
        }
    }

    pub fn encode(&self, pcm: &[i16]) -> Bytes {
        match self {
            G711Type::PCMU => PcmuCodec::encode(pcm),
            G711Type::PCMA => PcmaCodec::encode(pcm),
        }
    }

    pub fn decode(&self, data: &[u8]) -> Vec<i16> {
        match self {
            G711Type::PCMU => PcmuCodec::decode(data),
            G711Type::PCMA => PcmaCodec::decode(data),
        }
    }
}

/// G.711 μ-law (PCMU) Codec
pub struct PcmuCodec;

impl PcmuCodec {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    pub fn encode_sample(sample: i16) -> u8 {
        let mut magnitude = sample as i32;
        let sign = if magnitude < 0 {
            magnitude = -magnitude;
            0x80u8
        } else {
            0x00
        };
        magnitude = magnitude.min(Self::CLIP) + Self::BIAS;

        // Highest set bit lies between 7 and 14 after biasing
        let exponent = (31 - (magnitude as u32).leading_zeros()).saturating_sub(7).min(7) as u8;
        let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
        !(sign | (exponent << 4) | mantissa)
    }

    pub fn decode_sample(byte: u8) -> i16 {
        let byte = !byte;
        let exponent = (byte >> 4) & 0x07;
        let mantissa = (byte & 0x0F) as i32;
        let magnitude = (((mantissa << 3) + Self::BIAS) << exponent) - Self::BIAS;
        if byte & 0x80 != 0 {
            -magnitude as i16
        } else {
            magnitude as i16
        }
    }

    /// Encode PCM samples to μ-law
    pub fn encode(pcm: &[i16]) -> Bytes {
        pcm.iter().map(|&s| Self::encode_sample(s)).collect::<Vec<u8>>().into()
    }

    /// Decode μ-law to PCM samples
    pub fn decode(ulaw: &[u8]) -> Vec<i16> {
        ulaw.iter().map(|&b| Self::decode_sample(b)).collect()
    }
}

/// G.711 A-law (PCMA) Codec
pub struct PcmaCodec;

impl PcmaCodec {
    /// Segment end points for 13-bit magnitudes
    const SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

    pub fn encode_sample(sample: i16) -> u8 {
        let mut value = (sample as i32) >> 3;
        let mask = if value >= 0 {
            0xD5u8
        } else {
            value = -value - 1;
            0x55
        };

        let Some(segment) = Self::SEGMENT_END.iter().position(|&end| value <= end) else {
            return 0x7F ^ mask;
        };
        let mantissa = if segment < 2 {
            (value >> 1) & 0x0F
        } else {
            (value >> segment) & 0x0F
        };
        (((segment as i32) << 4) | mantissa) as u8 ^ mask
    }

    pub fn decode_sample(byte: u8) -> i16 {
        let byte = byte ^ 0x55;
        let mut magnitude = ((byte & 0x0F) as i32) << 4;
        let segment = (byte & 0x70) >> 4;
        match segment {
            0 => magnitude += 8,
            1 => magnitude += 0x108,
            _ => magnitude = (magnitude + 0x108) << (segment - 1),
        }
        if byte & 0x80 != 0 {
            magnitude as i16
        } else {
            -magnitude as i16
        }
    }

    /// Encode PCM samples to A-law
    pub fn encode(pcm: &[i16]) -> Bytes {
        pcm.iter().map(|&s| Self::encode_sample(s)).collect::<Vec<u8>>().into()
    }

    /// Decode A-law to PCM samples
    pub fn decode(alaw: &[u8]) -> Vec<i16> {
        alaw.iter().map(|&b| Self::decode_sample(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_g711_type_payload() {
        assert_eq!(G711Type::PCMU.payload_type(), 0);
        assert_eq!(G711Type::PCMA.payload_type(), 8);
        assert_eq!(G711Type::from_payload_type(8), Some(G711Type::PCMA));
        assert_eq!(G711Type::from_name("pcmu"), Some(G711Type::PCMU));
        assert_eq!(G711Type::from_payload_type(9), None);
    }

    #[test]
    fn test_known_code_points() {
        assert_eq!(PcmuCodec::encode_sample(0), 0xFF);
        assert_eq!(PcmuCodec::decode_sample(0xFF), 0);
        assert_eq!(PcmuCodec::decode_sample(0x00), -32124);
        assert_eq!(PcmuCodec::decode_sample(0x80), 32124);

        assert_eq!(PcmaCodec::encode_sample(0), 0xD5);
        assert_eq!(PcmaCodec::decode_sample(0xD5), 8);
    }

    #[test]
    fn test_extremes_do_not_overflow() {
        assert_eq!(PcmuCodec::decode_sample(PcmuCodec::encode_sample(i16::MAX)), 32124);
        assert_eq!(PcmuCodec::decode_sample(PcmuCodec::encode_sample(i16::MIN)), -32124);
        assert_eq!(PcmaCodec::decode_sample(PcmaCodec::encode_sample(i16::MAX)), 32256);
        assert_eq!(PcmaCodec::decode_sample(PcmaCodec::encode_sample(i16::MIN)), -32256);
    }

    #[test]
    fn test_pcmu_encode_decode() {
        let original: Vec<i16> = vec![0, 1000, -1000, 5000, -5000, 10000, -10000];
        let decoded = PcmuCodec::decode(&PcmuCodec::encode(&original));

        assert_eq!(original.len(), decoded.len());
        for (orig, dec) in original.iter().zip(decoded.iter()) {
            let diff = (*orig as i32 - *dec as i32).abs();
            assert!(diff <= (orig.abs() as i32 / 16).max(8), "{} vs {}", orig, dec);
        }
    }

    #[test]
    fn test_pcma_encode_decode() {
        let original: Vec<i16> = vec![0, 1000, -1000, 5000, -5000, 20000, -20000];
        let decoded = PcmaCodec::decode(&PcmaCodec::encode(&original));

        for (orig, dec) in original.iter().zip(decoded.iter()) {
            let diff = (*orig as i32 - *dec as i32).abs();
            assert!(diff <= (orig.abs() as i32 / 16).max(16), "{} vs {}", orig, dec);
        }
    }

    #[test]
    fn test_codecs_are_stable_on_reencode() {
        // Companded values survive decode then encode unchanged
        for byte in 0u8..=255 {
            assert_eq!(PcmaCodec::encode_sample(PcmaCodec::decode_sample(byte)), byte);
            let u = PcmuCodec::encode_sample(PcmuCodec::decode_sample(byte));
            // 0x7F and 0xFF both mean zero in μ-law
            assert!(u == byte || (byte == 0x7F && u == 0xFF));
        }
    }
}
