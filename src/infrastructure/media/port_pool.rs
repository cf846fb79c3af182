//! RTP port pair pool
//!
//! Pairs are an even RTP port plus the following odd RTCP port. A lease hands
//! its pair back when dropped, so every exit path of a call returns it.
//! Released pairs go to the back of the queue to delay reuse.

use super::error::MediaError;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// RTP and RTCP port of one media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

#[derive(Debug)]
struct PoolState {
    free: VecDeque<u16>,
    leased: HashSet<u16>,
}

/// Process-wide pool of RTP port pairs
#[derive(Debug, Clone)]
pub struct RtpPortPool {
    state: Arc<Mutex<PoolState>>,
    capacity: usize,
}

impl RtpPortPool {
    /// Pool over `[start, end]`; an odd start is rounded up
    pub fn new(start: u16, end: u16) -> Result<Self, MediaError> {
        let first = start.saturating_add(start % 2);
        if first >= end {
            return Err(MediaError::InvalidPortRange { start, end });
        }

        let free: VecDeque<u16> = (first..end).step_by(2).filter(|p| *p < end).collect();
        let capacity = free.len();
        debug!("RTP port pool {}-{}: {} pairs", start, end, capacity);

        Ok(Self {
            state: Arc::new(Mutex::new(PoolState {
                free,
                leased: HashSet::new(),
            })),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the least recently used free pair
    pub fn lease(&self) -> Result<PortLease, MediaError> {
        let mut state = self.lock();
        let rtp = state.free.pop_front().ok_or_else(|| {
            MediaError::ResourceExhaustion(format!("all {} RTP port pairs in use", self.capacity))
        })?;
        state.leased.insert(rtp);

        Ok(PortLease {
            pair: PortPair { rtp, rtcp: rtp + 1 },
            pool: self.clone(),
        })
    }

    fn release(&self, rtp: u16) {
        let mut state = self.lock();
        if state.leased.remove(&rtp) {
            state.free.push_back(rtp);
        } else {
            warn!("RTP port {} released twice", rtp);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    pub fn in_use(&self) -> usize {
        self.lock().leased.len()
    }
}

/// Exclusive hold on one port pair
#[derive(Debug)]
pub struct PortLease {
    pair: PortPair,
    pool: RtpPortPool,
}

impl PortLease {
    pub fn pair(&self) -> PortPair {
        self.pair
    }

    pub fn rtp_port(&self) -> u16 {
        self.pair.rtp
    }

    pub fn rtcp_port(&self) -> u16 {
        self.pair.rtcp
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.pair.rtp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_are_even_odd() {
        let pool = RtpPortPool::new(10001, 10010).unwrap();
        assert_eq!(pool.capacity(), 4); // 10002 10004 10006 10008
        let lease = pool.lease().unwrap();
        assert_eq!(lease.pair(), PortPair { rtp: 10002, rtcp: 10003 });
    }

    #[test]
    fn test_exhaustion_and_release_on_drop() {
        let pool = RtpPortPool::new(20000, 20003).unwrap();
        assert_eq!(pool.capacity(), 2);

        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert_ne!(a.rtp_port(), b.rtp_port());
        assert!(matches!(pool.lease(), Err(MediaError::ResourceExhaustion(_))));
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.lease().is_ok());
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_released_pair_goes_to_back() {
        let pool = RtpPortPool::new(30000, 30009).unwrap();
        let first = pool.lease().unwrap();
        let port = first.rtp_port();
        drop(first);
        let next = pool.lease().unwrap();
        assert_ne!(next.rtp_port(), port);
    }

    #[test]
    fn test_lease_released_when_task_panics() {
        let pool = RtpPortPool::new(40000, 40003).unwrap();
        let cloned = pool.clone();
        let result = std::thread::spawn(move || {
            let _lease = cloned.lease().unwrap();
            panic!("call setup failed");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_invalid_range() {
        assert!(RtpPortPool::new(5000, 5000).is_err());
        assert!(RtpPortPool::new(5001, 5002).is_err());
    }
}
