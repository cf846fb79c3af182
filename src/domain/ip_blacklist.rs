//! Per-source abuse tracking: authentication failure counters and
//! temporary bans.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Why a source ended up banned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlacklistReason {
    Manual,
    AuthenticationFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub ip_address: IpAddr,
    pub reason: BlacklistReason,
    pub added_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Sliding window of failure timestamps for one source
#[derive(Debug, Clone, Default)]
struct FailureTracker {
    failures: VecDeque<DateTime<Utc>>,
}

impl FailureTracker {
    fn record_failure(&mut self, window: Duration) -> usize {
        self.cleanup(window);
        self.failures.push_back(Utc::now());
        self.failures.len()
    }

    fn cleanup(&mut self, window: Duration) {
        let cutoff = Utc::now() - window;
        while let Some(&timestamp) = self.failures.front() {
            if timestamp < cutoff {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlacklistConfig {
    /// Failures inside the window that trigger a ban
    pub max_auth_failures: usize,
    pub failure_window: Duration,
    pub ban_duration: Duration,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            max_auth_failures: 5,
            failure_window: Duration::seconds(300),
            ban_duration: Duration::seconds(900),
        }
    }
}

/// Result of recording one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failures: usize,
    pub banned: bool,
}

/// Process-wide ban list, shared by the registrar and INVITE authentication
#[derive(Debug, Default)]
pub struct IpBlacklist {
    config: BlacklistConfig,
    blacklist: Mutex<HashMap<IpAddr, BlacklistEntry>>,
    trusted: Mutex<HashSet<IpAddr>>,
    failure_trackers: Mutex<HashMap<IpAddr, FailureTracker>>,
}

impl IpBlacklist {
    pub fn new(config: BlacklistConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Sources that are never banned (trunk peers)
    pub fn trust(&self, ip: IpAddr) {
        self.trusted.lock().unwrap_or_else(PoisonError::into_inner).insert(ip);
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        if self.is_trusted(ip) {
            return false;
        }

        let mut blacklist = self.blacklist.lock().unwrap_or_else(PoisonError::into_inner);
        match blacklist.get(ip) {
            Some(entry) if entry.is_expired() => {
                blacklist.remove(ip);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn block(&self, ip: IpAddr, reason: BlacklistReason, duration: Duration) {
        let now = Utc::now();
        let entry = BlacklistEntry {
            ip_address: ip,
            reason,
            added_at: now,
            expires_at: now + duration,
        };
        self.blacklist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip, entry);
    }

    pub fn unblock(&self, ip: &IpAddr) -> bool {
        self.blacklist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ip)
            .is_some()
    }

    /// Record one authentication failure; bans the source once the threshold is reached
    pub fn record_auth_failure(&self, ip: &IpAddr) -> FailureOutcome {
        if self.is_trusted(ip) {
            return FailureOutcome { failures: 0, banned: false };
        }

        let failures = {
            let mut trackers = self
                .failure_trackers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            trackers
                .entry(*ip)
                .or_default()
                .record_failure(self.config.failure_window)
        };

        let banned = failures >= self.config.max_auth_failures;
        if banned {
            warn!(
                "Banning {} for {}s after {} authentication failures",
                ip,
                self.config.ban_duration.num_seconds(),
                failures
            );
            self.block(*ip, BlacklistReason::AuthenticationFailures, self.config.ban_duration);
            self.failure_trackers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(ip);
        }

        FailureOutcome { failures, banned }
    }

    /// Current failure count inside the window
    pub fn failure_count(&self, ip: &IpAddr) -> usize {
        let mut trackers = self
            .failure_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match trackers.get_mut(ip) {
            Some(tracker) => {
                tracker.cleanup(self.config.failure_window);
                tracker.failures.len()
            }
            None => 0,
        }
    }

    pub fn record_auth_success(&self, ip: &IpAddr) {
        self.failure_trackers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ip);
    }

    fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    #[test]
    fn test_failures_count_up_to_ban() {
        let blacklist = IpBlacklist::new(BlacklistConfig {
            max_auth_failures: 3,
            ..BlacklistConfig::default()
        });
        let source = ip(10);

        assert_eq!(blacklist.record_auth_failure(&source).failures, 1);
        assert_eq!(blacklist.failure_count(&source), 1);
        assert!(!blacklist.record_auth_failure(&source).banned);
        assert!(!blacklist.is_blocked(&source));

        let outcome = blacklist.record_auth_failure(&source);
        assert_eq!(outcome, FailureOutcome { failures: 3, banned: true });
        assert!(blacklist.is_blocked(&source));
        assert!(!blacklist.is_blocked(&ip(11)));
    }

    #[test]
    fn test_ban_expires() {
        let blacklist = IpBlacklist::new(BlacklistConfig {
            max_auth_failures: 1,
            ban_duration: Duration::milliseconds(20),
            ..BlacklistConfig::default()
        });
        let source = ip(20);

        assert!(blacklist.record_auth_failure(&source).banned);
        assert!(blacklist.is_blocked(&source));
        std::thread::sleep(std::time::Duration::from_millis(40));
        assert!(!blacklist.is_blocked(&source));
    }

    #[test]
    fn test_success_resets_counter() {
        let blacklist = IpBlacklist::new(BlacklistConfig::default());
        let source = ip(30);
        blacklist.record_auth_failure(&source);
        blacklist.record_auth_failure(&source);
        blacklist.record_auth_success(&source);
        assert_eq!(blacklist.failure_count(&source), 0);
    }

    #[test]
    fn test_trusted_sources_are_never_banned() {
        let blacklist = IpBlacklist::new(BlacklistConfig {
            max_auth_failures: 1,
            ..BlacklistConfig::default()
        });
        let trunk = ip(40);
        blacklist.trust(trunk);
        assert!(!blacklist.record_auth_failure(&trunk).banned);
        assert!(!blacklist.is_blocked(&trunk));
    }

    #[test]
    fn test_manual_block_and_unblock() {
        let blacklist = IpBlacklist::new(BlacklistConfig::default());
        let source = ip(50);
        blacklist.block(source, BlacklistReason::Manual, Duration::hours(1));
        assert!(blacklist.is_blocked(&source));
        assert!(blacklist.unblock(&source));
        assert!(!blacklist.is_blocked(&source));
    }
}
