//! RFC 2833 / RFC 4733 telephone-event payloads
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     event     |E|R| volume    |          duration             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Every packet of one event carries the event's start timestamp, which is
//! what identifies the event here.

use super::dtmf::{DtmfDigit, DtmfEvent, DtmfSource};
use crate::infrastructure::media::rtp::{RtpPacket, RtpSequencer};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rfc2833Error {
    #[error("Telephone-event payload too short: {0} bytes")]
    TooShort(usize),

    #[error("Event code {0} is not a DTMF digit")]
    NotDtmf(u8),
}

/// One decoded telephone-event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    /// Power level in -dBm0, 0-63
    pub volume: u8,
    /// In timestamp units
    pub duration: u16,
}

impl TelephoneEvent {
    pub const SIZE: usize = 4;

    pub fn parse(payload: &[u8]) -> Result<Self, Rfc2833Error> {
        if payload.len() < Self::SIZE {
            return Err(Rfc2833Error::TooShort(payload.len()));
        }
        Ok(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let flags = (if self.end { 0x80 } else { 0 }) | (self.volume & 0x3F);
        let duration = self.duration.to_be_bytes();
        [self.event, flags, duration[0], duration[1]]
    }

    pub fn digit(&self) -> Result<DtmfDigit, Rfc2833Error> {
        DtmfDigit::from_event_code(self.event).ok_or(Rfc2833Error::NotDtmf(self.event))
    }
}

/// Timestamps of recently delivered events
const DELIVERED_HISTORY: usize = 16;

/// Turns a telephone-event packet stream into digits, one per event
#[derive(Debug)]
pub struct Rfc2833Receiver {
    payload_type: u8,
    clock_rate: u32,
    delivered: VecDeque<u32>,
}

impl Rfc2833Receiver {
    pub fn new(payload_type: u8, clock_rate: u32) -> Self {
        Self {
            payload_type,
            clock_rate: clock_rate.max(1),
            delivered: VecDeque::with_capacity(DELIVERED_HISTORY),
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Feed one RTP packet. A digit comes out on the first end-flagged
    /// packet of an event; the redundant end packets after it yield nothing.
    pub fn on_packet(&mut self, packet: &RtpPacket) -> Option<DtmfEvent> {
        if packet.payload_type != self.payload_type {
            return None;
        }

        let event = match TelephoneEvent::parse(&packet.payload) {
            Ok(event) => event,
            Err(e) => {
                debug!("Ignoring telephone-event packet: {}", e);
                return None;
            }
        };

        if !event.end {
            trace!("telephone-event {} in progress, ts={}", event.event, packet.timestamp);
            return None;
        }

        if self.delivered.contains(&packet.timestamp) {
            trace!("Duplicate end packet for ts={}", packet.timestamp);
            return None;
        }

        let digit = match event.digit() {
            Ok(digit) => digit,
            Err(e) => {
                debug!("{}", e);
                return None;
            }
        };

        if self.delivered.len() == DELIVERED_HISTORY {
            self.delivered.pop_front();
        }
        self.delivered.push_back(packet.timestamp);

        let millis = event.duration as u64 * 1000 / self.clock_rate as u64;
        Some(DtmfEvent::new(digit, DtmfSource::Rfc2833).with_duration(Duration::from_millis(millis)))
    }
}

/// Generates the packet train for outgoing digits
#[derive(Debug, Clone)]
pub struct Rfc2833Sender {
    payload_type: u8,
    clock_rate: u32,
    /// How many times the final end packet is sent
    end_redundancy: u8,
    /// Timestamp units between progress packets (20 ms at 8 kHz)
    packet_interval: u32,
    volume: u8,
}

impl Rfc2833Sender {
    pub fn new(payload_type: u8, clock_rate: u32, end_redundancy: u8) -> Self {
        Self {
            payload_type,
            clock_rate,
            end_redundancy: end_redundancy.max(1),
            packet_interval: clock_rate / 50,
            volume: 10,
        }
    }

    /// Packets for one digit. All share the event's start timestamp; the
    /// first carries the marker bit.
    pub fn packets(&self, digit: DtmfDigit, duration: Duration, sequencer: &mut RtpSequencer) -> Vec<RtpPacket> {
        let total = (duration.as_millis() as u64 * self.clock_rate as u64 / 1000).min(u16::MAX as u64) as u32;
        let interval = self.packet_interval.max(1);
        let timestamp = sequencer.timestamp();
        let mut packets = Vec::new();

        let mut elapsed = interval.min(total);
        while elapsed < total {
            let payload = TelephoneEvent {
                event: digit.event_code(),
                end: false,
                volume: self.volume,
                duration: elapsed as u16,
            };
            let packet = sequencer.packet(self.payload_type, timestamp, Bytes::copy_from_slice(&payload.to_bytes()));
            packets.push(packet.with_marker(packets.is_empty()));
            elapsed += interval;
        }

        let end = TelephoneEvent {
            event: digit.event_code(),
            end: true,
            volume: self.volume,
            duration: total as u16,
        };
        for _ in 0..self.end_redundancy {
            let packet = sequencer.packet(self.payload_type, timestamp, Bytes::copy_from_slice(&end.to_bytes()));
            packets.push(packet.with_marker(packets.is_empty()));
        }

        sequencer.advance_timestamp(total);
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_packet(seq: u16, ts: u32, end: bool, duration: u16) -> RtpPacket {
        let payload = TelephoneEvent {
            event: 5,
            end,
            volume: 10,
            duration,
        };
        RtpPacket::new(101, seq, ts, 0xABCD, Bytes::copy_from_slice(&payload.to_bytes()))
    }

    #[test]
    fn test_payload_layout() {
        let event = TelephoneEvent::parse(&[11, 0x8A, 0x03, 0x20]).unwrap();
        assert_eq!(event.event, 11);
        assert!(event.end);
        assert_eq!(event.volume, 10);
        assert_eq!(event.duration, 800);
        assert_eq!(event.digit().unwrap(), DtmfDigit::Pound);
        assert_eq!(event.to_bytes(), [11, 0x8A, 0x03, 0x20]);
        assert_eq!(TelephoneEvent::parse(&[1, 2]), Err(Rfc2833Error::TooShort(2)));
    }

    #[test]
    fn test_single_delivery_with_redundant_end_packets() {
        let mut receiver = Rfc2833Receiver::new(101, 8000);
        let packets = [
            event_packet(1, 4000, false, 160),
            event_packet(2, 4000, false, 320),
            event_packet(3, 4000, true, 480),
            event_packet(4, 4000, true, 480),
            event_packet(5, 4000, true, 480),
        ];

        let delivered: Vec<DtmfEvent> = packets.iter().filter_map(|p| receiver.on_packet(p)).collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].digit, DtmfDigit::Five);
        assert_eq!(delivered[0].source, DtmfSource::Rfc2833);
        assert_eq!(delivered[0].duration, Some(Duration::from_millis(60)));
    }

    #[test]
    fn test_repeated_digit_has_new_timestamp() {
        let mut receiver = Rfc2833Receiver::new(101, 8000);
        assert!(receiver.on_packet(&event_packet(1, 1000, true, 400)).is_some());
        assert!(receiver.on_packet(&event_packet(2, 1000, true, 400)).is_none());
        assert!(receiver.on_packet(&event_packet(3, 2000, true, 400)).is_some());
    }

    #[test]
    fn test_other_payload_types_and_events_ignored() {
        let mut receiver = Rfc2833Receiver::new(101, 8000);
        let audio = RtpPacket::new(0, 1, 0, 1, Bytes::from_static(&[0xFF; 160]));
        assert!(receiver.on_packet(&audio).is_none());

        // Event 16 is a flash, not a digit
        let flash = RtpPacket::new(101, 2, 0, 1, Bytes::from_static(&[16, 0x80, 0, 160]));
        assert!(receiver.on_packet(&flash).is_none());
    }

    #[test]
    fn test_sender_packet_train() {
        let sender = Rfc2833Sender::new(101, 8000, 3);
        let mut sequencer = RtpSequencer::new();
        let start_ts = sequencer.timestamp();
        let packets = sender.packets(DtmfDigit::Seven, Duration::from_millis(100), &mut sequencer);

        // 20, 40, 60, 80 ms progress packets then three end packets at 100 ms
        assert_eq!(packets.len(), 7);
        assert!(packets[0].marker);
        assert!(packets[1..].iter().all(|p| !p.marker));
        assert!(packets.iter().all(|p| p.timestamp == start_ts));
        for pair in packets.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence.wrapping_add(1));
        }

        let ends: Vec<TelephoneEvent> = packets
            .iter()
            .map(|p| TelephoneEvent::parse(&p.payload).unwrap())
            .filter(|e| e.end)
            .collect();
        assert_eq!(ends.len(), 3);
        assert!(ends.iter().all(|e| e.duration == 800 && e.event == 7));
        assert_eq!(sequencer.timestamp(), start_ts.wrapping_add(800));
    }

    #[test]
    fn test_sender_output_is_received_once() {
        let sender = Rfc2833Sender::new(101, 8000, 3);
        let mut sequencer = RtpSequencer::new();
        let mut receiver = Rfc2833Receiver::new(101, 8000);

        let mut digits = Vec::new();
        for digit in [DtmfDigit::One, DtmfDigit::One, DtmfDigit::Pound] {
            for packet in sender.packets(digit, Duration::from_millis(80), &mut sequencer) {
                let wire = RtpPacket::parse(&packet.serialize()).unwrap();
                digits.extend(receiver.on_packet(&wire).map(|e| e.digit));
            }
        }
        assert_eq!(digits, vec![DtmfDigit::One, DtmfDigit::One, DtmfDigit::Pound]);
    }
}
