//! WAV resource parsing
//!
//! Only the header is interpreted here; sample conversion toward the call's
//! codec happens at playout time.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// WAV file format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WavError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Invalid WAV: {0}")]
    InvalidFormat(String),

    #[error("Unsupported WAV: {0}")]
    UnsupportedFormat(String),
}

impl From<io::Error> for WavError {
    fn from(err: io::Error) -> Self {
        WavError::IoError(err.to_string())
    }
}

/// Sample encoding declared by the fmt chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavEncoding {
    /// Linear PCM, 8-bit unsigned or 16-bit signed little endian
    Pcm,
    /// G.711 A-law (format tag 6)
    ALaw,
    /// G.711 µ-law (format tag 7)
    MuLaw,
}

impl WavEncoding {
    fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(WavEncoding::Pcm),
            6 => Some(WavEncoding::ALaw),
            7 => Some(WavEncoding::MuLaw),
            _ => None,
        }
    }
}

/// WAV audio format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavFormat {
    pub encoding: WavEncoding,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample / 8) as usize
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn calculate_duration(&self, data_size: usize) -> f64 {
        let frames = data_size / self.bytes_per_frame().max(1);
        frames as f64 / self.sample_rate as f64
    }
}

/// WAV file representation
#[derive(Debug, Clone)]
pub struct WavFile {
    pub format: WavFormat,
    /// Sample data exactly as stored
    pub data: Arc<Vec<u8>>,
}

impl WavFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WavError> {
        let mut file = File::open(path)?;
        Self::from_reader(&mut file)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WavError> {
        Self::from_reader(&mut Cursor::new(bytes))
    }

    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self, WavError> {
        let mut riff_header = [0u8; 12];
        reader.read_exact(&mut riff_header)?;

        if &riff_header[0..4] != b"RIFF" {
            return Err(WavError::InvalidFormat("Missing RIFF signature".to_string()));
        }
        if &riff_header[8..12] != b"WAVE" {
            return Err(WavError::InvalidFormat("Not a WAVE file".to_string()));
        }

        let mut format: Option<WavFormat> = None;
        let mut data: Option<Vec<u8>> = None;

        loop {
            let mut chunk_header = [0u8; 8];
            if reader.read_exact(&mut chunk_header).is_err() {
                break;
            }

            let chunk_size = u32::from_le_bytes([
                chunk_header[4],
                chunk_header[5],
                chunk_header[6],
                chunk_header[7],
            ]) as usize;

            match &chunk_header[0..4] {
                b"fmt " => format = Some(Self::parse_fmt_chunk(reader, chunk_size)?),
                b"data" => {
                    let mut audio_data = vec![0u8; chunk_size];
                    reader.read_exact(&mut audio_data)?;
                    data = Some(audio_data);
                }
                _ => {
                    reader.seek(SeekFrom::Current(chunk_size as i64))?;
                }
            }

            // Chunks are word aligned
            if chunk_size % 2 != 0 {
                reader.seek(SeekFrom::Current(1))?;
            }

            if format.is_some() && data.is_some() {
                break;
            }
        }

        let format = format.ok_or_else(|| WavError::InvalidFormat("Missing fmt chunk".to_string()))?;
        let data = data.ok_or_else(|| WavError::InvalidFormat("Missing data chunk".to_string()))?;

        Ok(WavFile {
            format,
            data: Arc::new(data),
        })
    }

    fn parse_fmt_chunk<R: Read>(reader: &mut R, chunk_size: usize) -> Result<WavFormat, WavError> {
        if chunk_size < 16 {
            return Err(WavError::InvalidFormat("fmt chunk too small".to_string()));
        }

        let mut fmt_data = vec![0u8; chunk_size];
        reader.read_exact(&mut fmt_data)?;

        let tag = u16::from_le_bytes([fmt_data[0], fmt_data[1]]);
        let channels = u16::from_le_bytes([fmt_data[2], fmt_data[3]]);
        let sample_rate = u32::from_le_bytes([fmt_data[4], fmt_data[5], fmt_data[6], fmt_data[7]]);
        let bits_per_sample = u16::from_le_bytes([fmt_data[14], fmt_data[15]]);

        let encoding = WavEncoding::from_tag(tag)
            .ok_or_else(|| WavError::UnsupportedFormat(format!("format tag {}", tag)))?;

        if channels == 0 || channels > 2 {
            return Err(WavError::InvalidFormat(format!("Invalid number of channels: {}", channels)));
        }
        if sample_rate == 0 {
            return Err(WavError::InvalidFormat("Invalid sample rate: 0".to_string()));
        }

        let bits_ok = match encoding {
            WavEncoding::Pcm => bits_per_sample == 8 || bits_per_sample == 16,
            WavEncoding::ALaw | WavEncoding::MuLaw => bits_per_sample == 8,
        };
        if !bits_ok {
            return Err(WavError::UnsupportedFormat(format!(
                "{:?} with {} bits per sample",
                encoding, bits_per_sample
            )));
        }

        Ok(WavFormat {
            encoding,
            channels,
            sample_rate,
            bits_per_sample,
        })
    }

    pub fn duration(&self) -> f64 {
        self.format.calculate_duration(self.data.len())
    }

    /// Linear samples for PCM data; `None` for companded encodings
    pub fn pcm_samples(&self) -> Option<Vec<i16>> {
        if self.format.encoding != WavEncoding::Pcm {
            return None;
        }
        let samples = match self.format.bits_per_sample {
            8 => self.data.iter().map(|&b| (b as i16 - 128) << 8).collect(),
            _ => self
                .data
                .chunks_exact(2)
                .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
                .collect(),
        };
        Some(samples)
    }

    /// Build a WAV image in memory
    pub fn encode(format: &WavFormat, data: &[u8]) -> Vec<u8> {
        let tag: u16 = match format.encoding {
            WavEncoding::Pcm => 1,
            WavEncoding::ALaw => 6,
            WavEncoding::MuLaw => 7,
        };
        let block_align = format.bytes_per_frame() as u16;
        let byte_rate = format.sample_rate * block_align as u32;

        let mut out = Vec::with_capacity(44 + data.len());
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&format.channels.to_le_bytes());
        out.extend_from_slice(&format.sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&format.bits_per_sample.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }
}
