//! Audio domain - stored audio resources played into calls

pub mod wav;

pub use wav::{WavEncoding, WavError, WavFile, WavFormat};
