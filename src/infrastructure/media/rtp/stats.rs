//! Per-direction RTP counters
//!
//! Loss is estimated from sequence gaps the way RFC 3550 appendix A.3 does:
//! expected = extended highest sequence - base sequence + 1, lost = expected - received.

use serde::Serialize;

/// Counters for one direction of a relayed stream
#[derive(Debug, Default, Clone)]
pub struct StreamCounters {
    packets: u64,
    bytes: u64,
    base_seq: Option<u16>,
    max_seq: u16,
    cycles: u32,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one packet; `sequence` is `None` for non-RTP datagrams
    pub fn record(&mut self, len: usize, sequence: Option<u16>) {
        self.packets += 1;
        self.bytes += len as u64;

        let Some(seq) = sequence else {
            return;
        };
        match self.base_seq {
            None => {
                self.base_seq = Some(seq);
                self.max_seq = seq;
            }
            Some(_) => {
                let delta = seq.wrapping_sub(self.max_seq);
                // Forward jump within half the sequence space
                if delta != 0 && delta < 0x8000 {
                    if seq < self.max_seq {
                        self.cycles += 1;
                    }
                    self.max_seq = seq;
                }
            }
        }
    }

    pub fn snapshot(&self) -> StreamStats {
        let (expected, lost) = match self.base_seq {
            Some(base) => {
                let extended_max = ((self.cycles as u64) << 16) + self.max_seq as u64;
                let expected = extended_max + 1 - base as u64;
                (expected, expected.saturating_sub(self.packets))
            }
            None => (0, 0),
        };
        StreamStats {
            packets: self.packets,
            bytes: self.bytes,
            expected,
            lost,
        }
    }
}

/// Point-in-time view of one direction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub packets: u64,
    pub bytes: u64,
    pub expected: u64,
    pub lost: u64,
}

impl StreamStats {
    pub fn loss_fraction(&self) -> f64 {
        if self.expected == 0 {
            0.0
        } else {
            self.lost as f64 / self.expected as f64
        }
    }
}

/// Both directions of a relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Caller toward callee
    pub a_to_b: StreamStats,
    /// Callee toward caller
    pub b_to_a: StreamStats,
    pub rtcp_packets: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_without_loss() {
        let mut counters = StreamCounters::new();
        for seq in 100..110u16 {
            counters.record(172, Some(seq));
        }
        let stats = counters.snapshot();
        assert_eq!(stats.packets, 10);
        assert_eq!(stats.bytes, 1720);
        assert_eq!(stats.expected, 10);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn test_gap_counts_as_loss() {
        let mut counters = StreamCounters::new();
        for seq in [1u16, 2, 3, 6, 7] {
            counters.record(10, Some(seq));
        }
        let stats = counters.snapshot();
        assert_eq!(stats.expected, 7);
        assert_eq!(stats.lost, 2);
        assert!((stats.loss_fraction() - 2.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut counters = StreamCounters::new();
        for seq in [65534u16, 65535, 0, 1] {
            counters.record(10, Some(seq));
        }
        let stats = counters.snapshot();
        assert_eq!(stats.expected, 4);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn test_reordered_packet_is_not_loss() {
        let mut counters = StreamCounters::new();
        for seq in [10u16, 12, 11, 13] {
            counters.record(10, Some(seq));
        }
        assert_eq!(counters.snapshot().lost, 0);
    }
}
