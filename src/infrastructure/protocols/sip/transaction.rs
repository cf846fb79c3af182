//! SIP Transaction Layer
//!
//! Server transactions are kept in a table keyed by the top Via branch and
//! the request method. A retransmitted request finds its entry and gets the
//! last response re-sent instead of being processed again. Entries with a
//! final response are kept for 64*T1 (timer J / H territory) and then swept.
//!
//! Client-side retransmission (timers A and G) is driven by the owning call
//! worker through [`Retransmit`].

use super::message::{SipHeaders, SipMethod, SipRequest, SipResponse};
use super::transport::{OutgoingMessage, SipSender, TransportProtocol};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    #[serde(with = "millis")]
    pub t1: Duration,
    /// T2: Maximum retransmit interval for non-INVITE requests and INVITE responses (default 4s)
    #[serde(with = "millis")]
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    #[serde(with = "millis")]
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl SipTimers {
    /// Timer B / F / H: 64*T1
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Which retransmission rule applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitKind {
    /// Timer A: INVITE requests, doubling without cap
    InviteRequest,
    /// Timer G: 2xx to INVITE, doubling up to T2
    InviteResponse,
}

/// Exponential retransmission schedule with an overall deadline
#[derive(Debug, Clone)]
pub struct Retransmit {
    kind: RetransmitKind,
    timers: SipTimers,
    interval: Duration,
    next_at: Instant,
    give_up_at: Instant,
    sent: u32,
}

impl Retransmit {
    /// Start after the first transmission at `now`
    pub fn start(kind: RetransmitKind, timers: SipTimers, now: Instant) -> Self {
        Self {
            kind,
            timers,
            interval: timers.t1,
            next_at: now + timers.t1,
            give_up_at: now + timers.transaction_timeout(),
            sent: 1,
        }
    }

    pub fn next_at(&self) -> Instant {
        self.next_at.min(self.give_up_at)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.give_up_at
    }

    /// True when a retransmission is due; advances the schedule
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next_at || self.is_expired(now) {
            return false;
        }
        self.interval *= 2;
        if self.kind == RetransmitKind::InviteResponse {
            self.interval = self.interval.min(self.timers.t2);
        }
        self.next_at = now + self.interval;
        self.sent += 1;
        true
    }

    /// Number of transmissions so far, including the first
    pub fn sent(&self) -> u32 {
        self.sent
    }
}

/// Transaction ID - top Via branch plus method.
///
/// CANCEL and ACK share the INVITE's branch, so the method keeps them apart.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn from_request(request: &SipRequest) -> Option<Self> {
        Some(Self {
            branch: request.branch()?,
            method: request.method.clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct ServerEntry {
    response: Option<SipResponse>,
    destination: SocketAddr,
    protocol: TransportProtocol,
    created: Instant,
    completed: Option<Instant>,
}

/// Result of looking a request up in the table
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionMatch {
    /// First sighting; process it
    New,
    /// Already seen. Carries the response to re-send, if one was sent.
    Retransmission(Option<SipResponse>),
    /// Request has no usable branch; process it without deduplication
    Untracked,
}

/// Server transaction table
#[derive(Debug)]
pub struct ServerTransactions {
    timers: SipTimers,
    /// Entries without a final response are dropped after this long
    proceeding_ttl: Duration,
    entries: Mutex<HashMap<TransactionKey, ServerEntry>>,
}

impl ServerTransactions {
    pub fn new(timers: SipTimers) -> Self {
        Self {
            timers,
            proceeding_ttl: Duration::from_secs(300),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransactionKey, ServerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a request. ACKs are never tracked: they get no response.
    pub fn begin(&self, request: &SipRequest, source: SocketAddr, protocol: TransportProtocol) -> TransactionMatch {
        if request.method == SipMethod::Ack {
            return TransactionMatch::Untracked;
        }
        let Some(key) = TransactionKey::from_request(request) else {
            return TransactionMatch::Untracked;
        };

        let mut entries = self.lock();
        if let Some(entry) = entries.get(&key) {
            trace!("Retransmission of {} {}", key.method, key.branch);
            return TransactionMatch::Retransmission(entry.response.clone());
        }
        entries.insert(
            key,
            ServerEntry {
                response: None,
                destination: source,
                protocol,
                created: Instant::now(),
                completed: None,
            },
        );
        TransactionMatch::New
    }

    /// Remember the latest response; a final one completes the transaction
    pub fn record_response(&self, request: &SipRequest, response: &SipResponse) {
        let Some(key) = TransactionKey::from_request(request) else {
            return;
        };
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.response = Some(response.clone());
            if !response.is_provisional() && entry.completed.is_none() {
                entry.completed = Some(Instant::now());
            }
        }
    }

    /// Where responses for this request go
    pub fn destination(&self, request: &SipRequest) -> Option<(SocketAddr, TransportProtocol)> {
        let key = TransactionKey::from_request(request)?;
        self.lock().get(&key).map(|e| (e.destination, e.protocol))
    }

    /// Whether the INVITE with this branch already has a final response
    pub fn is_completed(&self, branch: &str, method: SipMethod) -> bool {
        let key = TransactionKey {
            branch: branch.to_string(),
            method,
        };
        self.lock().get(&key).is_some_and(|e| e.completed.is_some())
    }

    /// Drop expired entries; returns how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let linger = self.timers.transaction_timeout();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| match entry.completed {
            Some(at) => now.saturating_duration_since(at) < linger,
            None => now.saturating_duration_since(entry.created) < self.proceeding_ttl,
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} server transactions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sends responses through the transaction table and requests straight out
#[derive(Clone)]
pub struct Outbound {
    sender: Arc<dyn SipSender>,
    transactions: Arc<ServerTransactions>,
}

impl Outbound {
    pub fn new(sender: Arc<dyn SipSender>, transactions: Arc<ServerTransactions>) -> Self {
        Self {
            sender,
            transactions,
        }
    }

    pub fn transactions(&self) -> &ServerTransactions {
        &self.transactions
    }

    /// Cache the response for retransmissions of `request`, then send it
    pub async fn respond(
        &self,
        request: &SipRequest,
        response: &SipResponse,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) {
        self.transactions.record_response(request, response);
        self.send_bytes(response.to_bytes(), destination, protocol).await;
    }

    /// Send without touching the table (retransmissions, requests)
    pub async fn send_bytes(&self, data: Bytes, destination: SocketAddr, protocol: TransportProtocol) {
        let message = OutgoingMessage::new(data, destination, protocol);
        if let Err(e) = self.sender.send(message).await {
            // Transient send failures are left to retransmission timers
            warn!("Send to {} over {} failed: {}", destination, protocol.as_str(), e);
        }
    }

    pub async fn send_request(&self, request: &SipRequest, destination: SocketAddr, protocol: TransportProtocol) {
        trace!("-> {} {} to {}", request.method, request.uri, destination);
        self.send_bytes(request.to_bytes(), destination, protocol).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;

    fn request(method: SipMethod, branch: &str) -> SipRequest {
        let mut req = SipRequest::new(method.clone(), "sip:1002@pbx.local");
        req.headers.push("Via", format!("SIP/2.0/UDP 10.0.0.1:5060;branch={}", branch));
        req.headers.push("From", "<sip:1001@pbx.local>;tag=a");
        req.headers.push("To", "<sip:1002@pbx.local>");
        req.headers.push("Call-ID", "tx-1");
        req.headers.push("CSeq", format!("1 {}", method));
        req
    }

    fn source() -> SocketAddr {
        "10.0.0.1:5060".parse().unwrap()
    }

    #[test]
    fn test_timer_durations() {
        let timers = SipTimers::default();
        assert_eq!(timers.transaction_timeout(), Duration::from_secs(32));
    }

    #[test]
    fn test_retransmission_gets_cached_response() {
        let table = ServerTransactions::new(SipTimers::default());
        let invite = request(SipMethod::Invite, "z9hG4bK1");

        assert_eq!(table.begin(&invite, source(), TransportProtocol::Udp), TransactionMatch::New);
        assert_eq!(
            table.begin(&invite, source(), TransportProtocol::Udp),
            TransactionMatch::Retransmission(None)
        );

        let trying = ResponseBuilder::new(100).build_for_request(&invite);
        table.record_response(&invite, &trying);
        assert_eq!(
            table.begin(&invite, source(), TransportProtocol::Udp),
            TransactionMatch::Retransmission(Some(trying))
        );
        assert!(!table.is_completed("z9hG4bK1", SipMethod::Invite));

        let busy = ResponseBuilder::new(486).build_for_request(&invite);
        table.record_response(&invite, &busy);
        assert!(table.is_completed("z9hG4bK1", SipMethod::Invite));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cancel_is_its_own_transaction() {
        let table = ServerTransactions::new(SipTimers::default());
        table.begin(&request(SipMethod::Invite, "z9hG4bK2"), source(), TransportProtocol::Udp);
        assert_eq!(
            table.begin(&request(SipMethod::Cancel, "z9hG4bK2"), source(), TransportProtocol::Udp),
            TransactionMatch::New
        );
        assert_eq!(
            table.begin(&request(SipMethod::Ack, "z9hG4bK2"), source(), TransportProtocol::Udp),
            TransactionMatch::Untracked
        );
    }

    #[test]
    fn test_sweep_after_64_t1() {
        let timers = SipTimers {
            t1: Duration::from_millis(10),
            ..SipTimers::default()
        };
        let table = ServerTransactions::new(timers);
        let bye = request(SipMethod::Bye, "z9hG4bK3");
        table.begin(&bye, source(), TransportProtocol::Udp);
        table.begin(&request(SipMethod::Invite, "z9hG4bK4"), source(), TransportProtocol::Udp);
        table.record_response(&bye, &ResponseBuilder::ok().build_for_request(&bye));

        let now = Instant::now();
        assert_eq!(table.sweep(now), 0);
        // Only the completed one goes
        assert_eq!(table.sweep(now + Duration::from_millis(700)), 1);
        assert_eq!(
            table.begin(&bye, source(), TransportProtocol::Udp),
            TransactionMatch::New
        );
    }

    #[test]
    fn test_timer_a_doubles_and_timer_g_caps() {
        let timers = SipTimers::default();
        let start = Instant::now();

        let mut a = Retransmit::start(RetransmitKind::InviteRequest, timers, start);
        let mut g = Retransmit::start(RetransmitKind::InviteResponse, timers, start);
        let mut a_times = Vec::new();
        let mut g_times = Vec::new();
        let mut t = start;
        while t < start + Duration::from_secs(40) {
            if a.poll(t) {
                a_times.push(t - start);
            }
            if g.poll(t) {
                g_times.push(t - start);
            }
            t += Duration::from_millis(50);
        }

        // 0.5, 1.5, 3.5, 7.5, 15.5, 31.5 s
        assert_eq!(a_times.len(), 6);
        assert_eq!(a_times[1], Duration::from_millis(1500));
        // G: 0.5, 1.5, 3.5, 7.5, then every 4 s up to 32 s
        assert!(g_times.len() > a_times.len());
        for pair in g_times.windows(2).skip(3) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(4));
        }
        assert!(a.is_expired(start + Duration::from_secs(32)));
        assert_eq!(a.sent(), 7);
    }

    #[tokio::test]
    async fn test_outbound_caches_what_it_sends() {
        let (sender, mut rx) = super::super::transport::ChannelSender::new();
        let table = Arc::new(ServerTransactions::new(SipTimers::default()));
        let outbound = Outbound::new(Arc::new(sender), table.clone());
        let invite = request(SipMethod::Invite, "z9hG4bK5");
        table.begin(&invite, source(), TransportProtocol::Udp);

        let ringing = ResponseBuilder::new(180).build_for_request(&invite);
        outbound.respond(&invite, &ringing, source(), TransportProtocol::Udp).await;

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.destination, source());
        assert_eq!(sent.data, ringing.to_bytes());
        assert_eq!(
            table.begin(&invite, source(), TransportProtocol::Udp),
            TransactionMatch::Retransmission(Some(ringing))
        );
    }
}
