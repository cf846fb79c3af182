//! RTP media relay
//!
//! One leased port pair per call. Both legs send to the same local RTP port
//! and are told apart by source address; datagrams are forwarded unmodified
//! to the other leg. The RTCP port does the same for control packets.
//!
//! While forwarding, packets from the caller leg (A) are also inspected for
//! DTMF: telephone-event packets go to the RFC 2833 receiver, and G.711
//! audio is fed to the in-band detector when enabled.

use super::codec::G711Type;
use super::error::MediaError;
use super::playout::{encoder_for, PlayoutFrames, FRAME_DURATION, FRAME_SAMPLES};
use super::port_pool::{PortLease, RtpPortPool};
use super::rtp::{RelayStats, RtpHeader, RtpPacket, RtpSequencer, StreamCounters};
use crate::domain::audio::WavFile;
use crate::domain::call::{NegotiatedCodec, RtpEndpointRef};
use crate::infrastructure::ivr::goertzel::{GoertzelConfig, GoertzelDetector};
use crate::infrastructure::ivr::rfc2833::{Rfc2833Receiver, Rfc2833Sender};
use crate::infrastructure::ivr::{DtmfDigit, DtmfEvent, DtmfQueue, DtmfSource};
use bytes::Bytes;
use metrics::counter;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Side of a bridged call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Caller
    A,
    /// Callee
    B,
}

impl Leg {
    pub fn other(self) -> Leg {
        match self {
            Leg::A => Leg::B,
            Leg::B => Leg::A,
        }
    }

    fn direction_label(self) -> &'static str {
        match self {
            Leg::A => "a_to_b",
            Leg::B => "b_to_a",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_ip: IpAddr,
    /// Port pairs tried before giving up with ResourceExhaustion
    pub bind_attempts: u32,
    /// Longest wait on a receive before liveness and cancellation are checked
    pub recv_timeout: Duration,
    /// No packets in either direction for this long ends the relay
    pub inactivity_timeout: Duration,
    /// Copies of the final packet when sending RFC 2833 digits
    pub dtmf_end_redundancy: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            bind_attempts: 5,
            recv_timeout: Duration::from_millis(200),
            inactivity_timeout: Duration::from_secs(60),
            dtmf_end_redundancy: 3,
        }
    }
}

/// Reported to the owning call worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Inactive,
    Failed(String),
}

/// What the relay needs to know about the negotiated media
#[derive(Debug, Clone)]
pub struct RelayParams {
    pub codec: NegotiatedCodec,
    /// Payload types allowed through; empty forwards everything
    pub payload_types: Vec<u8>,
    /// In-band detection on the caller leg, G.711 only
    pub inband: Option<GoertzelConfig>,
}

/// Audio copied out for a recording tap. Telephone-events never appear here.
#[derive(Debug, Clone)]
pub struct TappedAudio {
    pub leg: Leg,
    pub payload_type: u8,
    pub timestamp: u32,
    pub payload: Bytes,
}

#[derive(Debug, Default, Clone, Copy)]
struct LegTable {
    a: Option<SocketAddr>,
    b: Option<SocketAddr>,
}

impl LegTable {
    fn get(&self, leg: Leg) -> Option<SocketAddr> {
        match leg {
            Leg::A => self.a,
            Leg::B => self.b,
        }
    }

    fn set(&mut self, leg: Leg, addr: SocketAddr) {
        match leg {
            Leg::A => self.a = Some(addr),
            Leg::B => self.b = Some(addr),
        }
    }

    /// Exact match first; otherwise a known IP on a new port re-latches
    /// that leg, unless both legs share the IP.
    fn classify(&mut self, from: SocketAddr) -> Option<Leg> {
        if self.a == Some(from) {
            return Some(Leg::A);
        }
        if self.b == Some(from) {
            return Some(Leg::B);
        }

        let same_ip = |addr: Option<SocketAddr>| addr.is_some_and(|a| a.ip() == from.ip());
        let leg = match (same_ip(self.a), same_ip(self.b)) {
            (true, false) => Leg::A,
            (false, true) => Leg::B,
            _ => return None,
        };
        debug!("Re-latching leg {:?} to {}", leg, from);
        self.set(leg, from);
        Some(leg)
    }
}

#[derive(Debug, Default)]
struct Counters {
    a_to_b: StreamCounters,
    b_to_a: StreamCounters,
    rtcp_packets: u64,
}

/// State shared by the relay handle, its tasks and players
struct Shared {
    rtp_legs: Mutex<LegTable>,
    rtcp_legs: Mutex<LegTable>,
    counters: Mutex<Counters>,
    last_activity: Mutex<Instant>,
    dtmf_queue: Mutex<Option<Arc<DtmfQueue>>>,
    tap: Mutex<Option<mpsc::UnboundedSender<TappedAudio>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        Self {
            rtp_legs: Mutex::new(LegTable::default()),
            rtcp_legs: Mutex::new(LegTable::default()),
            counters: Mutex::new(Counters::default()),
            last_activity: Mutex::new(Instant::now()),
            dtmf_queue: Mutex::new(None),
            tap: Mutex::new(None),
        }
    }

    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    fn peer(&self, leg: Leg) -> Option<SocketAddr> {
        lock(&self.rtp_legs).get(leg)
    }

    fn stats(&self) -> RelayStats {
        let counters = lock(&self.counters);
        RelayStats {
            a_to_b: counters.a_to_b.snapshot(),
            b_to_a: counters.b_to_a.snapshot(),
            rtcp_packets: counters.rtcp_packets,
        }
    }

    fn push_dtmf(&self, event: DtmfEvent) {
        let queue = lock(&self.dtmf_queue).clone();
        match queue {
            Some(queue) => {
                queue.push(event);
            }
            None => trace!("No DTMF queue attached, dropping '{}'", event.digit),
        }
    }
}

/// Socket holding its share of the port pair; the pair returns to the pool
/// only after every socket bound on it is closed
struct LeasedSocket {
    socket: UdpSocket,
    _lease: Arc<PortLease>,
}

impl LeasedSocket {
    fn new(socket: UdpSocket, lease: &Arc<PortLease>) -> Self {
        Self {
            socket,
            _lease: lease.clone(),
        }
    }
}

impl std::ops::Deref for LeasedSocket {
    type Target = UdpSocket;

    fn deref(&self) -> &UdpSocket {
        &self.socket
    }
}

/// Media relay for one call
pub struct MediaRelay {
    label: String,
    config: RelayConfig,
    rtp: Arc<LeasedSocket>,
    rtcp: Arc<LeasedSocket>,
    local_rtp: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
    codec: Option<NegotiatedCodec>,
    sequencer: Arc<tokio::sync::Mutex<RtpSequencer>>,
}

impl std::fmt::Debug for MediaRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaRelay")
            .field("label", &self.label)
            .field("local_rtp", &self.local_rtp)
            .finish_non_exhaustive()
    }
}

impl MediaRelay {
    /// Lease a port pair and bind it, trying other pairs on bind failure
    pub async fn bind(
        label: impl Into<String>,
        pool: &RtpPortPool,
        config: RelayConfig,
        parent: &CancellationToken,
    ) -> Result<Self, MediaError> {
        let label = label.into();
        let attempts = config.bind_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let lease = pool.lease()?;
            match Self::bind_pair(config.bind_ip, &lease).await {
                Ok((rtp, rtcp)) => {
                    let lease = Arc::new(lease);
                    let local_rtp = rtp.local_addr()?;
                    let (events_tx, events_rx) = mpsc::channel(4);
                    debug!("[{}] relay bound on {}", label, local_rtp);
                    return Ok(Self {
                        label,
                        config,
                        rtp: Arc::new(LeasedSocket::new(rtp, &lease)),
                        rtcp: Arc::new(LeasedSocket::new(rtcp, &lease)),
                        local_rtp,
                        shared: Arc::new(Shared::new()),
                        cancel: parent.child_token(),
                        tasks: Vec::new(),
                        events_tx,
                        events_rx,
                        codec: None,
                        sequencer: Arc::new(tokio::sync::Mutex::new(RtpSequencer::new())),
                    });
                }
                Err(e) => {
                    warn!("[{}] bind attempt {}/{} failed: {}", label, attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(MediaError::ResourceExhaustion(format!(
            "no bindable RTP port pair after {} attempts: {}",
            attempts, detail
        )))
    }

    async fn bind_pair(ip: IpAddr, lease: &PortLease) -> Result<(UdpSocket, UdpSocket), MediaError> {
        let rtp_addr = SocketAddr::new(ip, lease.rtp_port());
        let rtp = UdpSocket::bind(rtp_addr)
            .await
            .map_err(|source| MediaError::Bind { addr: rtp_addr, source })?;
        let rtcp_addr = SocketAddr::new(ip, lease.rtcp_port());
        let rtcp = UdpSocket::bind(rtcp_addr)
            .await
            .map_err(|source| MediaError::Bind { addr: rtcp_addr, source })?;
        Ok((rtp, rtcp))
    }

    pub fn local_rtp(&self) -> SocketAddr {
        self.local_rtp
    }

    pub fn local_port(&self) -> u16 {
        self.local_rtp.port()
    }

    /// Set (or move) the remote RTP address of a leg; RTCP is assumed one port up
    pub fn set_leg(&self, leg: Leg, rtp: SocketAddr) {
        lock(&self.shared.rtp_legs).set(leg, rtp);
        let rtcp = SocketAddr::new(rtp.ip(), rtp.port().wrapping_add(1));
        lock(&self.shared.rtcp_legs).set(leg, rtcp);
        debug!("[{}] leg {:?} -> {}", self.label, leg, rtp);
    }

    pub fn leg(&self, leg: Leg) -> Option<SocketAddr> {
        self.shared.peer(leg)
    }

    /// Where digits detected on the caller leg go
    pub fn set_dtmf_queue(&self, queue: Arc<DtmfQueue>) {
        *lock(&self.shared.dtmf_queue) = Some(queue);
    }

    pub fn set_tap(&self, tap: mpsc::UnboundedSender<TappedAudio>) {
        *lock(&self.shared.tap) = Some(tap);
    }

    pub fn endpoint_ref(&self) -> RtpEndpointRef {
        let legs = *lock(&self.shared.rtp_legs);
        RtpEndpointRef {
            local: self.local_rtp,
            remotes: [legs.a, legs.b].into_iter().flatten().collect(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && !self.cancel.is_cancelled()
    }

    /// Spawn the forwarding tasks
    pub fn start(&mut self, params: RelayParams) {
        if !self.tasks.is_empty() {
            warn!("[{}] relay already started", self.label);
            return;
        }

        let inband = params.inband.and_then(|config| match encoder_for(&params.codec) {
            Ok(g711) => Some(InBandTap {
                codec: g711,
                payload_type: params.codec.payload_type,
                detector: GoertzelDetector::new(config),
            }),
            Err(_) => {
                debug!("[{}] in-band detection off for {}", self.label, params.codec.encoding);
                None
            }
        });
        let telephone_event = params
            .codec
            .telephone_event
            .map(|pt| Rfc2833Receiver::new(pt, params.codec.clock_rate));

        self.shared.touch();
        let rtp_worker = RtpWorker {
            label: self.label.clone(),
            socket: self.rtp.clone(),
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
            events: self.events_tx.clone(),
            recv_timeout: self.config.recv_timeout,
            inactivity_timeout: self.config.inactivity_timeout,
            allowed: params.payload_types.iter().copied().collect(),
            telephone_event,
            inband,
        };
        let rtcp_worker = RtcpWorker {
            socket: self.rtcp.clone(),
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
        };

        info!(
            "[{}] relay started on {} ({} pt {})",
            self.label, self.local_rtp, params.codec.encoding, params.codec.payload_type
        );
        self.codec = Some(params.codec);
        self.tasks.push(tokio::spawn(rtp_worker.run()));
        self.tasks.push(tokio::spawn(rtcp_worker.run()));
    }

    /// Wait for the next liveness event
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events_rx.recv().await
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.stats()
    }

    /// Playout toward the caller leg
    pub fn player(&self) -> MediaPlayer {
        MediaPlayer {
            label: self.label.clone(),
            socket: self.rtp.clone(),
            shared: self.shared.clone(),
            codec: self.codec.clone(),
            sequencer: self.sequencer.clone(),
            end_redundancy: self.config.dtmf_end_redundancy,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop forwarding, close both sockets and hand the port pair back
    pub async fn stop(mut self) -> RelayStats {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("[{}] relay task ended abnormally: {}", self.label, e);
            }
        }
        let stats = self.shared.stats();
        info!(
            "[{}] relay stopped: a->b {} pkts, b->a {} pkts, {} rtcp",
            self.label, stats.a_to_b.packets, stats.b_to_a.packets, stats.rtcp_packets
        );
        stats
    }
}

impl Drop for MediaRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct InBandTap {
    codec: G711Type,
    payload_type: u8,
    detector: GoertzelDetector,
}

struct RtpWorker {
    label: String,
    socket: Arc<LeasedSocket>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    events: mpsc::Sender<RelayEvent>,
    recv_timeout: Duration,
    inactivity_timeout: Duration,
    allowed: HashSet<u8>,
    telephone_event: Option<Rfc2833Receiver>,
    inband: Option<InBandTap>,
}

impl RtpWorker {
    async fn run(mut self) {
        let mut buf = vec![0u8; 2048];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = tokio::time::timeout(self.recv_timeout, self.socket.recv_from(&mut buf)) => r,
            };

            match received {
                Ok(Ok((len, from))) => self.on_datagram(&buf[..len], from).await,
                Ok(Err(e)) => {
                    error!("[{}] RTP receive failed: {}", self.label, e);
                    let _ = self.events.try_send(RelayEvent::Failed(e.to_string()));
                    break;
                }
                // Poll tick
                Err(_) => {}
            }

            if self.shared.idle_for() >= self.inactivity_timeout {
                warn!(
                    "[{}] no RTP for {}s, reporting inactive",
                    self.label,
                    self.inactivity_timeout.as_secs()
                );
                let _ = self.events.try_send(RelayEvent::Inactive);
                break;
            }
        }
        debug!("[{}] RTP task finished", self.label);
    }

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let Some(leg) = lock(&self.shared.rtp_legs).classify(from) else {
            trace!("[{}] RTP from unknown source {}", self.label, from);
            return;
        };
        let Some(header) = RtpHeader::peek(data) else {
            trace!("[{}] non-RTP datagram from {}", self.label, from);
            return;
        };

        self.shared.touch();
        {
            let mut counters = lock(&self.shared.counters);
            let stream = match leg {
                Leg::A => &mut counters.a_to_b,
                Leg::B => &mut counters.b_to_a,
            };
            stream.record(data.len(), Some(header.sequence));
        }
        counter!("pbx_rtp_packets_total", "direction" => leg.direction_label()).increment(1);
        counter!("pbx_rtp_bytes_total", "direction" => leg.direction_label()).increment(data.len() as u64);

        if !self.allowed.is_empty() && !self.allowed.contains(&header.payload_type) {
            trace!("[{}] filtered payload type {}", self.label, header.payload_type);
            return;
        }

        let is_event = self
            .telephone_event
            .as_ref()
            .is_some_and(|rx| rx.payload_type() == header.payload_type);
        if leg == Leg::A {
            self.inspect_dtmf(data, is_event);
        }
        if !is_event {
            self.tap(leg, data, &header);
        }

        if let Some(to) = self.shared.peer(leg.other()) {
            if let Err(e) = self.socket.send_to(data, to).await {
                warn!("[{}] RTP send to {} failed: {}", self.label, to, e);
            }
        }
    }

    fn inspect_dtmf(&mut self, data: &[u8], is_event: bool) {
        let packet = match RtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("[{}] unparseable RTP: {}", self.label, e);
                return;
            }
        };

        if is_event {
            if let Some(event) = self.telephone_event.as_mut().and_then(|rx| rx.on_packet(&packet)) {
                self.shared.push_dtmf(event);
            }
            return;
        }

        if let Some(tap) = self.inband.as_mut() {
            if packet.payload_type == tap.payload_type {
                let samples = tap.codec.decode(&packet.payload);
                for digit in tap.detector.process(&samples) {
                    self.shared.push_dtmf(DtmfEvent::new(digit, DtmfSource::InBand));
                }
            }
        }
    }

    fn tap(&self, leg: Leg, data: &[u8], header: &RtpHeader) {
        let tap = lock(&self.shared.tap);
        let Some(tx) = tap.as_ref() else {
            return;
        };
        let payload = RtpPacket::parse(data).map(|p| p.payload).unwrap_or_default();
        let _ = tx.send(TappedAudio {
            leg,
            payload_type: header.payload_type,
            timestamp: header.timestamp,
            payload,
        });
    }
}

struct RtcpWorker {
    socket: Arc<LeasedSocket>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RtcpWorker {
    async fn run(self) {
        let mut buf = vec![0u8; 1500];
        loop {
            let (len, from) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("RTCP receive failed: {}", e);
                        break;
                    }
                },
            };

            let Some(leg) = lock(&self.shared.rtcp_legs).classify(from) else {
                continue;
            };
            lock(&self.shared.counters).rtcp_packets += 1;

            let target = lock(&self.shared.rtcp_legs).get(leg.other());
            if let Some(to) = target {
                if let Err(e) = self.socket.send_to(&buf[..len], to).await {
                    warn!("RTCP send to {} failed: {}", to, e);
                }
            }
        }
    }
}

/// Sends prepared audio to the caller leg from the relay's own port
#[derive(Clone)]
pub struct MediaPlayer {
    label: String,
    socket: Arc<LeasedSocket>,
    shared: Arc<Shared>,
    codec: Option<NegotiatedCodec>,
    sequencer: Arc<tokio::sync::Mutex<RtpSequencer>>,
    end_redundancy: u8,
    cancel: CancellationToken,
}

impl MediaPlayer {
    /// Convert and play a resource. Returns the number of frames sent,
    /// which is short of the full length when the call is torn down.
    pub async fn play(&self, wav: &WavFile) -> Result<usize, MediaError> {
        let codec = self
            .codec
            .as_ref()
            .ok_or_else(|| MediaError::UnsupportedCodec("no codec negotiated".to_string()))?;
        let encoder = encoder_for(codec)?;
        let frames = PlayoutFrames::prepare(wav, encoder)?;
        Ok(self.play_frames(&frames).await)
    }

    pub async fn play_frames(&self, frames: &PlayoutFrames) -> usize {
        let payload_type = frames.codec().payload_type();
        let mut sequencer = self.sequencer.lock().await;
        let mut ticker = tokio::time::interval(FRAME_DURATION);

        for (index, frame) in frames.frames().iter().enumerate() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("[{}] playout cancelled after {} frames", self.label, index);
                    return index;
                }
                _ = ticker.tick() => {}
            }

            let timestamp = sequencer.timestamp();
            let packet = sequencer
                .packet(payload_type, timestamp, frame.clone())
                .with_marker(index == 0);
            sequencer.advance_timestamp(FRAME_SAMPLES as u32);

            let Some(to) = self.shared.peer(Leg::A) else {
                continue;
            };
            if let Err(e) = self.socket.send_to(&packet.serialize(), to).await {
                warn!("[{}] playout send to {} failed: {}", self.label, to, e);
            }
        }
        frames.len()
    }

    /// Send one digit to the caller as telephone-events. Returns the
    /// number of packets sent.
    pub async fn send_digit(&self, digit: DtmfDigit, duration: Duration) -> Result<usize, MediaError> {
        let codec = self
            .codec
            .as_ref()
            .ok_or_else(|| MediaError::UnsupportedCodec("no codec negotiated".to_string()))?;
        let payload_type = codec
            .telephone_event
            .ok_or_else(|| MediaError::UnsupportedCodec("telephone-event".to_string()))?;
        let sender = Rfc2833Sender::new(payload_type, codec.clock_rate, self.end_redundancy);

        let mut sequencer = self.sequencer.lock().await;
        let packets = sender.packets(digit, duration, &mut sequencer);
        let Some(to) = self.shared.peer(Leg::A) else {
            return Ok(0);
        };
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        for (index, packet) in packets.iter().enumerate() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(index),
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.socket.send_to(&packet.serialize(), to).await {
                warn!("[{}] DTMF send to {} failed: {}", self.label, to, e);
            }
        }
        debug!("[{}] sent digit {} in {} packets", self.label, digit.to_char(), packets.len());
        Ok(packets.len())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
