//! DTMF (Dual-Tone Multi-Frequency) digits and events
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// DTMF digit representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfDigit {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfDigit {
    /// Convert to character representation
    pub fn to_char(&self) -> char {
        match self {
            DtmfDigit::Zero => '0',
            DtmfDigit::One => '1',
            DtmfDigit::Two => '2',
            DtmfDigit::Three => '3',
            DtmfDigit::Four => '4',
            DtmfDigit::Five => '5',
            DtmfDigit::Six => '6',
            DtmfDigit::Seven => '7',
            DtmfDigit::Eight => '8',
            DtmfDigit::Nine => '9',
            DtmfDigit::Star => '*',
            DtmfDigit::Pound => '#',
            DtmfDigit::A => 'A',
            DtmfDigit::B => 'B',
            DtmfDigit::C => 'C',
            DtmfDigit::D => 'D',
        }
    }

    /// Parse from character
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '0' => Some(DtmfDigit::Zero),
            '1' => Some(DtmfDigit::One),
            '2' => Some(DtmfDigit::Two),
            '3' => Some(DtmfDigit::Three),
            '4' => Some(DtmfDigit::Four),
            '5' => Some(DtmfDigit::Five),
            '6' => Some(DtmfDigit::Six),
            '7' => Some(DtmfDigit::Seven),
            '8' => Some(DtmfDigit::Eight),
            '9' => Some(DtmfDigit::Nine),
            '*' => Some(DtmfDigit::Star),
            '#' => Some(DtmfDigit::Pound),
            'A' => Some(DtmfDigit::A),
            'B' => Some(DtmfDigit::B),
            'C' => Some(DtmfDigit::C),
            'D' => Some(DtmfDigit::D),
            _ => None,
        }
    }

    /// RFC 4733 event code (0-15)
    pub fn event_code(&self) -> u8 {
        match self {
            DtmfDigit::Zero => 0,
            DtmfDigit::One => 1,
            DtmfDigit::Two => 2,
            DtmfDigit::Three => 3,
            DtmfDigit::Four => 4,
            DtmfDigit::Five => 5,
            DtmfDigit::Six => 6,
            DtmfDigit::Seven => 7,
            DtmfDigit::Eight => 8,
            DtmfDigit::Nine => 9,
            DtmfDigit::Star => 10,
            DtmfDigit::Pound => 11,
            DtmfDigit::A => 12,
            DtmfDigit::B => 13,
            DtmfDigit::C => 14,
            DtmfDigit::D => 15,
        }
    }

    pub fn from_event_code(code: u8) -> Option<Self> {
        const DIGITS: [DtmfDigit; 16] = [
            DtmfDigit::Zero,
            DtmfDigit::One,
            DtmfDigit::Two,
            DtmfDigit::Three,
            DtmfDigit::Four,
            DtmfDigit::Five,
            DtmfDigit::Six,
            DtmfDigit::Seven,
            DtmfDigit::Eight,
            DtmfDigit::Nine,
            DtmfDigit::Star,
            DtmfDigit::Pound,
            DtmfDigit::A,
            DtmfDigit::B,
            DtmfDigit::C,
            DtmfDigit::D,
        ];
        DIGITS.get(code as usize).copied()
    }

    /// Get DTMF frequencies (low and high)
    pub fn frequencies(&self) -> (u32, u32) {
        match self {
            DtmfDigit::One => (697, 1209),
            DtmfDigit::Two => (697, 1336),
            DtmfDigit::Three => (697, 1477),
            DtmfDigit::A => (697, 1633),
            DtmfDigit::Four => (770, 1209),
            DtmfDigit::Five => (770, 1336),
            DtmfDigit::Six => (770, 1477),
            DtmfDigit::B => (770, 1633),
            DtmfDigit::Seven => (852, 1209),
            DtmfDigit::Eight => (852, 1336),
            DtmfDigit::Nine => (852, 1477),
            DtmfDigit::C => (852, 1633),
            DtmfDigit::Star => (941, 1209),
            DtmfDigit::Zero => (941, 1336),
            DtmfDigit::Pound => (941, 1477),
            DtmfDigit::D => (941, 1633),
        }
    }
}

impl fmt::Display for DtmfDigit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// Where a digit was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DtmfSource {
    InBand,
    Rfc2833,
    SipInfo,
}

impl DtmfSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DtmfSource::InBand => "in-band",
            DtmfSource::Rfc2833 => "rfc2833",
            DtmfSource::SipInfo => "sip-info",
        }
    }

    pub fn is_out_of_band(&self) -> bool {
        !matches!(self, DtmfSource::InBand)
    }
}

/// One detected digit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtmfEvent {
    pub digit: DtmfDigit,
    pub source: DtmfSource,
    pub at: Instant,
    pub duration: Option<Duration>,
}

impl DtmfEvent {
    pub fn new(digit: DtmfDigit, source: DtmfSource) -> Self {
        Self {
            digit,
            source,
            at: Instant::now(),
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DtmfParseError {
    #[error("Unsupported DTMF content type: {0}")]
    UnsupportedContentType(String),

    #[error("Malformed DTMF body: {0}")]
    MalformedBody(String),
}

/// DTMF parser for SIP INFO bodies
pub struct DtmfParser;

impl DtmfParser {
    pub const DTMF_RELAY: &'static str = "application/dtmf-relay";
    pub const DTMF: &'static str = "application/dtmf";

    pub fn supports(content_type: &str) -> bool {
        content_type.eq_ignore_ascii_case(Self::DTMF_RELAY) || content_type.eq_ignore_ascii_case(Self::DTMF)
    }

    /// Parse an INFO body by content type
    pub fn parse_sip_info(content_type: &str, body: &str) -> Result<DtmfEvent, DtmfParseError> {
        if content_type.eq_ignore_ascii_case(Self::DTMF_RELAY) {
            Self::parse_dtmf_relay(body)
        } else if content_type.eq_ignore_ascii_case(Self::DTMF) {
            let digit = Self::parse_signal(body.trim())
                .ok_or_else(|| DtmfParseError::MalformedBody(body.trim().to_string()))?;
            Ok(DtmfEvent::new(digit, DtmfSource::SipInfo))
        } else {
            Err(DtmfParseError::UnsupportedContentType(content_type.to_string()))
        }
    }

    /// `Signal=<digit>` with optional `Duration=<ms>`
    pub fn parse_dtmf_relay(body: &str) -> Result<DtmfEvent, DtmfParseError> {
        let mut signal = None;
        let mut duration = None;

        for line in body.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "signal" => {
                    signal = Some(
                        Self::parse_signal(value)
                            .ok_or_else(|| DtmfParseError::MalformedBody(format!("Signal={}", value)))?,
                    )
                }
                "duration" => {
                    let ms: u64 = value
                        .parse()
                        .map_err(|_| DtmfParseError::MalformedBody(format!("Duration={}", value)))?;
                    duration = Some(Duration::from_millis(ms));
                }
                _ => {}
            }
        }

        let digit = signal.ok_or_else(|| DtmfParseError::MalformedBody("missing Signal".to_string()))?;
        let mut event = DtmfEvent::new(digit, DtmfSource::SipInfo);
        event.duration = duration;
        Ok(event)
    }

    /// A single digit character, or an event code such as `10` for `*`
    fn parse_signal(value: &str) -> Option<DtmfDigit> {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => DtmfDigit::from_char(c),
            _ => value.parse::<u8>().ok().and_then(DtmfDigit::from_event_code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtmf_digit_conversion() {
        assert_eq!(DtmfDigit::Zero.to_char(), '0');
        assert_eq!(DtmfDigit::Star.to_char(), '*');
        assert_eq!(DtmfDigit::from_char('#'), Some(DtmfDigit::Pound));
        assert_eq!(DtmfDigit::from_char('d'), Some(DtmfDigit::D));
        assert_eq!(DtmfDigit::from_char('x'), None);
    }

    #[test]
    fn test_event_codes_cover_sixteen_digits() {
        for code in 0..16u8 {
            let digit = DtmfDigit::from_event_code(code).unwrap();
            assert_eq!(digit.event_code(), code);
        }
        assert_eq!(DtmfDigit::from_event_code(16), None);
    }

    #[test]
    fn test_dtmf_frequencies() {
        assert_eq!(DtmfDigit::One.frequencies(), (697, 1209));
        assert_eq!(DtmfDigit::Five.frequencies(), (770, 1336));
        assert_eq!(DtmfDigit::D.frequencies(), (941, 1633));
    }

    #[test]
    fn test_parse_dtmf_relay() {
        let event = DtmfParser::parse_sip_info("application/dtmf-relay", "Signal=5\r\nDuration=160\r\n").unwrap();
        assert_eq!(event.digit, DtmfDigit::Five);
        assert_eq!(event.source, DtmfSource::SipInfo);
        assert_eq!(event.duration, Some(Duration::from_millis(160)));

        let star = DtmfParser::parse_sip_info("application/dtmf-relay", "Signal= 10\r\n").unwrap();
        assert_eq!(star.digit, DtmfDigit::Star);
        assert_eq!(star.duration, None);
    }

    #[test]
    fn test_parse_bare_dtmf() {
        let event = DtmfParser::parse_sip_info("application/dtmf", "#\r\n").unwrap();
        assert_eq!(event.digit, DtmfDigit::Pound);
    }

    #[test]
    fn test_malformed_bodies() {
        for body in ["", "Duration=100", "Signal=Z", "Signal=5\r\nDuration=abc"] {
            assert!(matches!(
                DtmfParser::parse_sip_info("application/dtmf-relay", body),
                Err(DtmfParseError::MalformedBody(_))
            ));
        }
        assert!(matches!(
            DtmfParser::parse_sip_info("text/plain", "Signal=5"),
            Err(DtmfParseError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(DtmfSource::InBand.as_str(), "in-band");
        assert!(DtmfSource::Rfc2833.is_out_of_band());
        assert_eq!(serde_json::to_string(&DtmfSource::SipInfo).unwrap(), "\"sip-info\"");
    }
}
