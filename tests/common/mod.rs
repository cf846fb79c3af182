//! Drives a `SipServer` over an in-memory transport. Phones are plain
//! addresses for signalling and real loopback sockets for RTP.

#![allow(dead_code)]

use chrono::Utc;
use pbx_core::config::{Config, ExtensionConfig};
use pbx_core::domain::call::CallEvent;
use pbx_core::domain::cdr::ChannelEventSink;
use pbx_core::domain::extension::Registration;
use pbx_core::infrastructure::ivr::FeatureTable;
use pbx_core::infrastructure::protocols::sip::{
    ChannelSender, IncomingMessage, OutgoingMessage, SipHeaders, SipMessage, SipMethod, SipRequest,
    SipResponse, TransportProtocol,
};
use pbx_core::{CoreContext, SipServer};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

pub const PBX_SIP: &str = "127.0.0.1:5060";
pub const PHONE_A: &str = "127.0.0.1:5091";
pub const PHONE_B: &str = "127.0.0.1:5092";

const WAIT: Duration = Duration::from_secs(5);

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Config with extensions 1001/1002 and a private RTP range
pub fn config(rtp_start: u16, rtp_end: u16) -> Config {
    let mut config = Config::default();
    config.sip.domain = "pbx.test".to_string();
    config.media.bind_ip = "127.0.0.1".parse().unwrap();
    config.media.rtp_port_start = rtp_start;
    config.media.rtp_port_end = rtp_end;
    for (number, password) in [("1001", "secret1"), ("1002", "secret2")] {
        config.extensions.push(ExtensionConfig {
            number: number.to_string(),
            password: password.to_string(),
            display_name: None,
        });
    }
    config
}

pub struct Harness {
    pub server: SipServer,
    pub ctx: CoreContext,
    outgoing: mpsc::UnboundedReceiver<OutgoingMessage>,
    pending: VecDeque<(SipMessage, SocketAddr)>,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl Harness {
    pub async fn new(config: Config) -> Self {
        Self::with_features(config, FeatureTable::new()).await
    }

    pub async fn with_features(config: Config, features: FeatureTable) -> Self {
        let (sink, events) = ChannelEventSink::new();
        let ctx = CoreContext::from_config(config)
            .await
            .unwrap()
            .with_events(Arc::new(sink))
            .with_features(features);
        let (sender, outgoing) = ChannelSender::new();
        let server = SipServer::new(ctx.clone(), Arc::new(sender), addr(PBX_SIP));
        Self {
            server,
            ctx,
            outgoing,
            pending: VecDeque::new(),
            events,
        }
    }

    /// Bind `number` to `phone` without going through REGISTER
    pub async fn register(&self, number: &str, phone: &str) {
        let registration = Registration {
            contact: format!("sip:{}@{}", number, phone),
            source: addr(phone),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            user_agent: None,
        };
        self.ctx.store.update_registration(number, registration).await.unwrap();
    }

    pub async fn send(&self, message: SipMessage, from: &str) {
        self.server
            .handle(IncomingMessage {
                message,
                source: addr(from),
                protocol: TransportProtocol::Udp,
            })
            .await;
    }

    pub async fn send_raw(&self, raw: &str, from: &str) {
        self.send(SipMessage::parse(raw.as_bytes()).unwrap(), from).await;
    }

    /// First message sent to `to` matching `pred`; others stay queued
    pub async fn expect<F>(&mut self, to: &str, pred: F) -> SipMessage
    where
        F: Fn(&SipMessage) -> bool,
    {
        let to = addr(to);
        if let Some(pos) = self.pending.iter().position(|(m, d)| *d == to && pred(m)) {
            return self.pending.remove(pos).unwrap().0;
        }
        let deadline = Instant::now() + WAIT;
        loop {
            let out = timeout(deadline - Instant::now(), self.outgoing.recv())
                .await
                .expect("timed out waiting for SIP message")
                .expect("server dropped its sender");
            let message = out.parse().unwrap();
            if out.destination == to && pred(&message) {
                return message;
            }
            self.pending.push_back((message, out.destination));
        }
    }

    pub async fn expect_response(&mut self, to: &str, code: u16, method: SipMethod) -> SipResponse {
        let message = self
            .expect(to, |m| match m {
                SipMessage::Response(r) => {
                    r.status_code == code && r.cseq().is_some_and(|c| c.method == method)
                }
                _ => false,
            })
            .await;
        match message {
            SipMessage::Response(r) => r,
            _ => unreachable!(),
        }
    }

    pub async fn expect_request(&mut self, to: &str, method: SipMethod) -> SipRequest {
        let message = self
            .expect(to, |m| matches!(m, SipMessage::Request(r) if r.method == method))
            .await;
        match message {
            SipMessage::Request(r) => r,
            _ => unreachable!(),
        }
    }

    /// Whether anything matching `pred` was sent to `to` so far
    pub fn drain_matching<F>(&mut self, to: &str, pred: F) -> usize
    where
        F: Fn(&SipMessage) -> bool,
    {
        while let Ok(out) = self.outgoing.try_recv() {
            let message = out.parse().unwrap();
            self.pending.push_back((message, out.destination));
        }
        let to = addr(to);
        self.pending.iter().filter(|(m, d)| *d == to && pred(m)).count()
    }

    pub async fn next_event(&mut self) -> CallEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for call event")
            .expect("event sink closed")
    }

    /// Skip events until one of type `kind` ("call.ended", ...)
    pub async fn event_of(&mut self, kind: &str) -> CallEvent {
        loop {
            let event = self.next_event().await;
            if event.event_type() == kind {
                return event;
            }
        }
    }

    /// Wait until no call is left and every RTP port is back in the pool
    pub async fn wait_idle(&self) {
        let deadline = Instant::now() + WAIT;
        while self.server.manager().count() > 0 || self.ctx.port_pool.in_use() > 0 {
            assert!(Instant::now() < deadline, "calls or ports still held");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Audio SDP for a phone whose RTP socket is `rtp`
pub fn phone_sdp(rtp: SocketAddr, direction: &str) -> String {
    format!(
        "v=0\r\n\
o=phone 1 1 IN IP4 {ip}\r\n\
s=-\r\n\
c=IN IP4 {ip}\r\n\
t=0 0\r\n\
m=audio {port} RTP/AVP 0 8 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-15\r\n\
a={direction}\r\n",
        ip = rtp.ip(),
        port = rtp.port(),
        direction = direction,
    )
}

pub struct Invite {
    pub call_id: String,
    pub from_tag: String,
    pub branch: String,
    pub dialed: String,
}

impl Invite {
    pub fn new(call_id: &str, dialed: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            from_tag: format!("{}-a", call_id),
            branch: format!("z9hG4bK{}", call_id),
            dialed: dialed.to_string(),
        }
    }

    pub fn raw(&self, sdp: &str) -> String {
        format!(
            "INVITE sip:{dialed}@pbx.test SIP/2.0\r\n\
Via: SIP/2.0/UDP {a};branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:1001@pbx.test>;tag={tag}\r\n\
To: <sip:{dialed}@pbx.test>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:1001@{a}>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: {len}\r\n\r\n{sdp}",
            dialed = self.dialed,
            a = PHONE_A,
            branch = self.branch,
            tag = self.from_tag,
            call_id = self.call_id,
            len = sdp.len(),
            sdp = sdp,
        )
    }

    pub fn cancel(&self) -> String {
        format!(
            "CANCEL sip:{dialed}@pbx.test SIP/2.0\r\n\
Via: SIP/2.0/UDP {a};branch={branch}\r\n\
From: <sip:1001@pbx.test>;tag={tag}\r\n\
To: <sip:{dialed}@pbx.test>\r\n\
Call-ID: {call_id}\r\n\
CSeq: 1 CANCEL\r\n\
Content-Length: 0\r\n\r\n",
            dialed = self.dialed,
            a = PHONE_A,
            branch = self.branch,
            tag = self.from_tag,
            call_id = self.call_id,
        )
    }

    /// In-dialog request from the caller once `to_tag` is known
    pub fn in_dialog(&self, method: &str, cseq: u32, to_tag: &str, body: Option<(&str, &str)>) -> String {
        let (content_type, body) = match body {
            Some((ct, b)) => (format!("Content-Type: {}\r\n", ct), b.to_string()),
            None => (String::new(), String::new()),
        };
        format!(
            "{method} sip:pbx@{pbx} SIP/2.0\r\n\
Via: SIP/2.0/UDP {a};branch=z9hG4bK{call_id}-{cseq}-{lower}\r\n\
From: <sip:1001@pbx.test>;tag={tag}\r\n\
To: <sip:{dialed}@pbx.test>;tag={to_tag}\r\n\
Call-ID: {call_id}\r\n\
CSeq: {cseq} {method}\r\n\
{content_type}Content-Length: {len}\r\n\r\n{body}",
            method = method,
            lower = method.to_ascii_lowercase(),
            pbx = PBX_SIP,
            a = PHONE_A,
            tag = self.from_tag,
            dialed = self.dialed,
            to_tag = to_tag,
            call_id = self.call_id,
            cseq = cseq,
            content_type = content_type,
            len = body.len(),
            body = body,
        )
    }
}

pub async fn rtp_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

pub async fn recv_rtp(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 1500];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no RTP relayed")
        .unwrap();
    buf[..len].to_vec()
}
