//! In-band DTMF detection with the Goertzel algorithm
//!
//! Audio is cut into fixed blocks (205 samples at 8 kHz by default). For each
//! block the power at the eight DTMF frequencies is evaluated and a digit is
//! accepted only when:
//! - one row and one column tone each carry a minimum share of the block energy
//! - each tone dominates the other frequencies of its group
//! - the row/column power ratio stays within the twist limits
//!
//! A digit is reported after it persists for the configured minimum duration,
//! and the same digit is reported again only after a release gap.

use super::dtmf::DtmfDigit;
use serde::Deserialize;

const ROW_FREQS: [f64; 4] = [697.0, 770.0, 852.0, 941.0];
const COL_FREQS: [f64; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

const KEYPAD: [[DtmfDigit; 4]; 4] = [
    [DtmfDigit::One, DtmfDigit::Two, DtmfDigit::Three, DtmfDigit::A],
    [DtmfDigit::Four, DtmfDigit::Five, DtmfDigit::Six, DtmfDigit::B],
    [DtmfDigit::Seven, DtmfDigit::Eight, DtmfDigit::Nine, DtmfDigit::C],
    [DtmfDigit::Star, DtmfDigit::Zero, DtmfDigit::Pound, DtmfDigit::D],
];

/// Detector tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoertzelConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Tone must persist this long before it is reported
    pub min_tone_ms: u32,
    /// Gap required before the same digit can repeat
    pub release_ms: u32,
    /// Minimum |X|²/(N·Σx²) per tone; a clean tone pair gives about 0.25
    pub min_relative_power: f64,
    /// Minimum estimated amplitude of each tone, in 16-bit sample units
    pub min_tone_amplitude: f64,
    /// Required power ratio between a tone and the runner-up in its group
    pub dominance_ratio: f64,
    /// Column weaker than row, in dB
    pub max_normal_twist_db: f64,
    /// Row weaker than column, in dB
    pub max_reverse_twist_db: f64,
}

impl Default for GoertzelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            block_size: 205,
            min_tone_ms: 40,
            release_ms: 20,
            min_relative_power: 0.1,
            min_tone_amplitude: 100.0,
            dominance_ratio: 4.0,
            max_normal_twist_db: 8.0,
            max_reverse_twist_db: 4.0,
        }
    }
}

impl GoertzelConfig {
    fn blocks_for(&self, ms: u32) -> u32 {
        let samples = ms as u64 * self.sample_rate as u64 / 1000;
        (samples.div_ceil(self.block_size.max(1) as u64)).max(1) as u32
    }
}

/// Streaming dual-tone detector for one audio direction
pub struct GoertzelDetector {
    config: GoertzelConfig,
    row_coeffs: [f64; 4],
    col_coeffs: [f64; 4],
    block: Vec<f64>,
    required_blocks: u32,
    release_blocks: u32,
    candidate: Option<DtmfDigit>,
    candidate_blocks: u32,
    reported: Option<DtmfDigit>,
    absent_blocks: u32,
}

impl GoertzelDetector {
    pub fn new(config: GoertzelConfig) -> Self {
        let coeff = |f: f64| 2.0 * (2.0 * std::f64::consts::PI * f / config.sample_rate as f64).cos();
        let row_coeffs = ROW_FREQS.map(coeff);
        let col_coeffs = COL_FREQS.map(coeff);
        let required_blocks = config.blocks_for(config.min_tone_ms);
        let release_blocks = config.blocks_for(config.release_ms);

        Self {
            block: Vec::with_capacity(config.block_size),
            config,
            row_coeffs,
            col_coeffs,
            required_blocks,
            release_blocks,
            candidate: None,
            candidate_blocks: 0,
            reported: None,
            absent_blocks: 0,
        }
    }

    /// Feed samples; returns digits whose detection completed in this call
    pub fn process(&mut self, samples: &[i16]) -> Vec<DtmfDigit> {
        let mut digits = Vec::new();
        for &sample in samples {
            self.block.push(sample as f64);
            if self.block.len() == self.config.block_size {
                let result = self.analyze_block(&self.block);
                self.block.clear();
                if let Some(digit) = self.on_block(result) {
                    digits.push(digit);
                }
            }
        }
        digits
    }

    pub fn reset(&mut self) {
        self.block.clear();
        self.candidate = None;
        self.candidate_blocks = 0;
        self.reported = None;
        self.absent_blocks = 0;
    }

    fn on_block(&mut self, result: Option<DtmfDigit>) -> Option<DtmfDigit> {
        if self.reported.is_some() && result != self.reported {
            self.absent_blocks += 1;
            if self.absent_blocks >= self.release_blocks {
                self.reported = None;
            }
        } else {
            self.absent_blocks = 0;
        }

        if result == self.candidate {
            self.candidate_blocks = self.candidate_blocks.saturating_add(1);
        } else {
            self.candidate = result;
            self.candidate_blocks = 1;
        }

        match self.candidate {
            Some(digit) if self.candidate_blocks >= self.required_blocks && self.reported != Some(digit) => {
                self.reported = Some(digit);
                self.absent_blocks = 0;
                Some(digit)
            }
            _ => None,
        }
    }

    fn power(coeff: f64, block: &[f64]) -> f64 {
        let (mut s1, mut s2) = (0.0, 0.0);
        for &x in block {
            let s = x + coeff * s1 - s2;
            s2 = s1;
            s1 = s;
        }
        s1 * s1 + s2 * s2 - coeff * s1 * s2
    }

    /// Index and power of the strongest tone, if it dominates its group
    fn dominant(&self, powers: &[f64; 4]) -> Option<(usize, f64)> {
        let (index, peak) = powers
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        let runner_up = powers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, p)| *p)
            .fold(0.0, f64::max);
        (peak >= runner_up * self.config.dominance_ratio).then_some((index, peak))
    }

    fn analyze_block(&self, block: &[f64]) -> Option<DtmfDigit> {
        let n = block.len() as f64;
        let energy: f64 = block.iter().map(|x| x * x).sum();
        if energy <= 0.0 {
            return None;
        }

        let rows = self.row_coeffs.map(|c| Self::power(c, block));
        let cols = self.col_coeffs.map(|c| Self::power(c, block));
        let (row, row_power) = self.dominant(&rows)?;
        let (col, col_power) = self.dominant(&cols)?;

        let min_power = self.config.min_relative_power * n * energy;
        if row_power < min_power || col_power < min_power {
            return None;
        }

        // Amplitude estimate: A ≈ 2|X|/N
        let min_amp = self.config.min_tone_amplitude;
        if 2.0 * row_power.sqrt() / n < min_amp || 2.0 * col_power.sqrt() / n < min_amp {
            return None;
        }

        let twist_db = 10.0 * (row_power / col_power).log10();
        if twist_db > self.config.max_normal_twist_db || -twist_db > self.config.max_reverse_twist_db {
            return None;
        }

        Some(KEYPAD[row][col])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const RATE: f64 = 8000.0;

    fn tone(digit: DtmfDigit, ms: u32, amplitude: f64) -> Vec<i16> {
        let (low, high) = digit.frequencies();
        let samples = (ms as f64 * RATE / 1000.0) as usize;
        (0..samples)
            .map(|i| {
                let t = i as f64 / RATE;
                let v = amplitude * (2.0 * std::f64::consts::PI * low as f64 * t).sin()
                    + amplitude * (2.0 * std::f64::consts::PI * high as f64 * t).sin();
                v as i16
            })
            .collect()
    }

    fn silence(ms: u32) -> Vec<i16> {
        vec![0; (ms as f64 * RATE / 1000.0) as usize]
    }

    #[test]
    fn test_detects_every_digit() {
        for code in 0..16u8 {
            let digit = DtmfDigit::from_event_code(code).unwrap();
            let mut detector = GoertzelDetector::new(GoertzelConfig::default());
            let found = detector.process(&tone(digit, 100, 6000.0));
            assert_eq!(found, vec![digit], "digit {}", digit);
        }
    }

    #[test]
    fn test_held_digit_reported_once() {
        let mut detector = GoertzelDetector::new(GoertzelConfig::default());
        let found = detector.process(&tone(DtmfDigit::Five, 1000, 6000.0));
        assert_eq!(found, vec![DtmfDigit::Five]);
    }

    #[test]
    fn test_repeat_needs_release() {
        let mut detector = GoertzelDetector::new(GoertzelConfig::default());
        let mut audio = tone(DtmfDigit::Five, 100, 6000.0);
        audio.extend(silence(60));
        audio.extend(tone(DtmfDigit::Five, 100, 6000.0));
        audio.extend(silence(60));
        audio.extend(tone(DtmfDigit::Nine, 100, 6000.0));
        assert_eq!(
            detector.process(&audio),
            vec![DtmfDigit::Five, DtmfDigit::Five, DtmfDigit::Nine]
        );
    }

    #[test]
    fn test_short_burst_is_ignored() {
        let mut detector = GoertzelDetector::new(GoertzelConfig::default());
        // Shorter than one analysis block
        let mut audio = silence(10);
        audio.extend(tone(DtmfDigit::One, 20, 6000.0));
        audio.extend(silence(100));
        assert!(detector.process(&audio).is_empty());
    }

    #[test]
    fn test_excessive_twist_is_rejected() {
        let (low, high) = DtmfDigit::Five.frequencies();
        let audio: Vec<i16> = (0..800)
            .map(|i| {
                let t = i as f64 / RATE;
                let v = 8000.0 * (2.0 * std::f64::consts::PI * low as f64 * t).sin()
                    + 1000.0 * (2.0 * std::f64::consts::PI * high as f64 * t).sin();
                v as i16
            })
            .collect();
        let mut detector = GoertzelDetector::new(GoertzelConfig::default());
        assert!(detector.process(&audio).is_empty());
    }

    #[test]
    fn test_single_tone_is_not_a_digit() {
        let audio: Vec<i16> = (0..1600)
            .map(|i| (8000.0 * (2.0 * std::f64::consts::PI * 770.0 * i as f64 / RATE).sin()) as i16)
            .collect();
        let mut detector = GoertzelDetector::new(GoertzelConfig::default());
        assert!(detector.process(&audio).is_empty());
    }

    #[test]
    fn test_speech_band_noise_yields_no_digits() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut detector = GoertzelDetector::new(GoertzelConfig::default());
        let mut low_pass = 0.0f64;
        let mut previous = 0.0f64;

        // Six seconds, fed in 20 ms frames like the relay does
        let mut found = Vec::new();
        for _ in 0..300 {
            let frame: Vec<i16> = (0..160)
                .map(|_| {
                    let white: f64 = rng.gen_range(-8000.0..8000.0);
                    // Crude 300-3400 Hz shaping: one-pole low-pass then first difference
                    low_pass = 0.6 * low_pass + 0.4 * white;
                    let band = low_pass - 0.9 * previous;
                    previous = low_pass;
                    band.clamp(-32768.0, 32767.0) as i16
                })
                .collect();
            found.extend(detector.process(&frame));
        }
        assert!(found.is_empty(), "false digits: {:?}", found);
    }

    #[test]
    fn test_quiet_tone_below_amplitude_floor() {
        let mut detector = GoertzelDetector::new(GoertzelConfig::default());
        assert!(detector.process(&tone(DtmfDigit::Two, 200, 50.0)).is_empty());
    }
}
