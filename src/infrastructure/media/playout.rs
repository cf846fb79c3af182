//! Playout of stored audio into a call
//!
//! A WAV resource is converted once, by inspecting its own fmt header, into
//! 20 ms frames of the call's G.711 variant. Other codecs have no native
//! encoder here and are refused.

use super::codec::G711Type;
use super::error::MediaError;
use crate::domain::audio::{WavEncoding, WavFile};
use crate::domain::call::NegotiatedCodec;
use crate::infrastructure::media::codec::{PcmaCodec, PcmuCodec};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

pub const TARGET_RATE: u32 = 8000;
/// Samples per 20 ms frame at 8 kHz
pub const FRAME_SAMPLES: usize = 160;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Encoder for a negotiated codec, if one exists
pub fn encoder_for(codec: &NegotiatedCodec) -> Result<G711Type, MediaError> {
    G711Type::from_payload_type(codec.payload_type)
        .or_else(|| G711Type::from_name(&codec.encoding))
        .ok_or_else(|| MediaError::UnsupportedCodec(codec.encoding.clone()))
}

/// Audio ready to be sent, one payload per RTP packet
#[derive(Debug, Clone)]
pub struct PlayoutFrames {
    codec: G711Type,
    frames: Vec<Bytes>,
}

impl PlayoutFrames {
    /// Convert a resource to 8 kHz mono G.711 frames
    pub fn prepare(wav: &WavFile, codec: G711Type) -> Result<Self, MediaError> {
        let mono = decode_mono(wav)?;
        let samples = resample(&mono, wav.format.sample_rate, TARGET_RATE);

        let frames: Vec<Bytes> = samples
            .chunks(FRAME_SAMPLES)
            .map(|chunk| {
                let mut frame = chunk.to_vec();
                frame.resize(FRAME_SAMPLES, 0);
                codec.encode(&frame)
            })
            .collect();

        debug!(
            "Prepared {} {} frames from {:?} {} Hz x{}",
            frames.len(),
            codec.name(),
            wav.format.encoding,
            wav.format.sample_rate,
            wav.format.channels
        );

        Ok(Self { codec, frames })
    }

    pub fn codec(&self) -> G711Type {
        self.codec
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration(&self) -> Duration {
        FRAME_DURATION * self.frames.len() as u32
    }
}

fn decode_mono(wav: &WavFile) -> Result<Vec<i16>, MediaError> {
    let interleaved: Vec<i16> = match wav.format.encoding {
        WavEncoding::Pcm => wav
            .pcm_samples()
            .ok_or_else(|| MediaError::UnsupportedFormat("PCM data could not be read".to_string()))?,
        WavEncoding::MuLaw => PcmuCodec::decode(&wav.data),
        WavEncoding::ALaw => PcmaCodec::decode(&wav.data),
    };

    match wav.format.channels {
        1 => Ok(interleaved),
        2 => Ok(interleaved
            .chunks_exact(2)
            .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
            .collect()),
        n => Err(MediaError::UnsupportedFormat(format!("{} channels", n))),
    }
}

/// Linear interpolation resampler
fn resample(samples: &[i16], from: u32, to: u32) -> Vec<i16> {
    if from == to || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let index = pos as usize;
            let frac = pos - index as f64;
            let a = samples[index.min(samples.len() - 1)] as f64;
            let b = samples[(index + 1).min(samples.len() - 1)] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}
