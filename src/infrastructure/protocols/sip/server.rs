//! SIP server - the dispatcher between transports and call workers
//!
//! A single dispatcher task consumes what the transport readers deliver,
//! so messages of one dialog are handled in arrival order. Out-of-dialog
//! requests (REGISTER, OPTIONS, new INVITEs) are answered here; everything
//! belonging to a call is handed to that call's worker.

use super::auth::ChallengeKind;
use super::builder::{generate_tag, ResponseBuilder};
use super::call_handler::{CallServices, CallSettings, CallWorker, ALLOWED_METHODS};
use super::call_router::{CallInput, CallManager};
use super::message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest};
use super::registrar::Registrar;
use super::transaction::{Outbound, ServerTransactions, TransactionMatch};
use super::transport::{
    IncomingMessage, SipSender, TcpTransport, TransportProtocol, TransportSet, UdpTransport,
};
use crate::context::CoreContext;
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often expired transactions, nonces and registrations are dropped
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub struct SipServer {
    ctx: CoreContext,
    services: CallServices,
    registrar: Registrar,
    outbound: Outbound,
    transactions: Arc<ServerTransactions>,
    manager: Arc<CallManager>,
    local_sip: SocketAddr,
    shutdown: CancellationToken,
}

impl SipServer {
    /// Server over an arbitrary sender; `local_sip` is what peers are told
    /// to send to
    pub fn new(ctx: CoreContext, sender: Arc<dyn SipSender>, local_sip: SocketAddr) -> Self {
        Self::with_shutdown(ctx, sender, local_sip, CancellationToken::new())
    }

    fn with_shutdown(
        ctx: CoreContext,
        sender: Arc<dyn SipSender>,
        local_sip: SocketAddr,
        shutdown: CancellationToken,
    ) -> Self {
        let config = ctx.config.clone();
        let transactions = Arc::new(ServerTransactions::new(config.sip.timers));
        let outbound = Outbound::new(sender, transactions.clone());
        let manager = Arc::new(CallManager::new());

        let settings = CallSettings {
            local_sip,
            media_ip: config.sip.public_ip(config.media.bind_ip),
            domain: config.sip.domain.clone(),
            timers: config.sip.timers,
            ring_timeout: config.sip.ring_timeout(),
            relay: config.media.relay(&config.dtmf),
            dtmf: config.dtmf.queue(),
            inband: config.dtmf.inband(),
        };
        let services = CallServices {
            settings: Arc::new(settings),
            outbound: outbound.clone(),
            manager: manager.clone(),
            store: ctx.store.clone(),
            dialplan: ctx.dialplan.clone(),
            negotiator: ctx.negotiator.clone(),
            port_pool: ctx.port_pool.clone(),
            features: ctx.features.clone(),
            events: ctx.events.clone(),
            shutdown: shutdown.clone(),
        };
        let registrar = Registrar::new(
            config.sip.registrar.clone(),
            ctx.auth.clone(),
            ctx.store.clone(),
            ctx.blacklist.clone(),
        );

        Self {
            ctx,
            services,
            registrar,
            outbound,
            transactions,
            manager,
            local_sip,
            shutdown,
        }
    }

    /// Bind the configured transports and start their readers. The returned
    /// receiver feeds [`SipServer::run`].
    pub async fn bind(ctx: CoreContext) -> Result<(Self, mpsc::Receiver<IncomingMessage>), SipError> {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1024);
        let sip = ctx.config.sip.clone();

        let udp = UdpTransport::bind(sip.udp_bind).await?;
        let bound = udp.local_addr();
        let udp_sender: Arc<dyn SipSender> = Arc::new(udp.sender());
        tokio::spawn(udp.run(tx.clone(), shutdown.child_token()));

        let tcp_sender = match sip.tcp_bind {
            Some(addr) => {
                let tcp = TcpTransport::bind(addr).await?;
                let sender: Arc<dyn SipSender> = Arc::new(tcp.sender());
                tokio::spawn(tcp.run(tx.clone(), shutdown.child_token()));
                Some(sender)
            }
            None => None,
        };

        let sender = Arc::new(TransportSet::new(udp_sender, tcp_sender));
        let local_sip = SocketAddr::new(sip.public_ip(bound.ip()), bound.port());
        info!("SIP server for {} reachable at {}", sip.domain, local_sip);
        Ok((Self::with_shutdown(ctx, sender, local_sip, shutdown), rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_sip
    }

    pub fn manager(&self) -> &Arc<CallManager> {
        &self.manager
    }

    pub fn transactions(&self) -> &ServerTransactions {
        &self.transactions
    }

    /// Cancelling this stops the transports, every call and every relay
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down SIP server with {} active calls", self.manager.count());
        self.shutdown.cancel();
    }

    /// Dispatcher loop
    pub async fn run(&self, mut rx: mpsc::Receiver<IncomingMessage>) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep().await,
                incoming = rx.recv() => match incoming {
                    Some(incoming) => self.handle(incoming).await,
                    None => break,
                },
            }
        }
        info!("SIP dispatcher stopped");
    }

    /// Periodic housekeeping
    pub async fn sweep(&self) {
        let transactions = self.transactions.sweep(Instant::now());
        let nonces = self.ctx.auth.cleanup_nonces();
        let registrations = self.ctx.store.purge_expired().await;
        gauge!("pbx_active_calls").set(self.manager.count() as f64);
        if transactions + nonces + registrations > 0 {
            debug!(
                "Sweep: {} transactions, {} nonces, {} registrations",
                transactions, nonces, registrations
            );
        }
    }

    /// Handle one inbound message
    pub async fn handle(&self, incoming: IncomingMessage) {
        let IncomingMessage {
            message,
            source,
            protocol,
        } = incoming;

        if self.ctx.blacklist.is_blocked(&source.ip()) {
            debug!("Dropping message from banned source {}", source);
            return;
        }

        if let Err(e) = message.validate() {
            match &message {
                SipMessage::Request(request) if request.top_via().is_some() => {
                    warn!("Rejecting {} from {}: {}", request.method, source, e);
                    let reason = match &e {
                        SipError::ValidationError(header) => format!("Missing or invalid {}", header),
                        other => other.to_string(),
                    };
                    let response = ResponseBuilder::new(400).reason(reason).build_for_request(request);
                    self.outbound.send_bytes(response.to_bytes(), source, protocol).await;
                }
                _ => warn!("Dropping invalid message from {}: {}", source, e),
            }
            return;
        }

        match message {
            SipMessage::Request(request) => self.handle_request(request, source, protocol).await,
            SipMessage::Response(response) => {
                let call_id = response.call_id().unwrap_or_default().to_string();
                let input = CallInput::Sip {
                    message: SipMessage::Response(response),
                    source,
                    protocol,
                };
                if !self.manager.dispatch(&call_id, input).await {
                    debug!("Stray response for Call-ID {} from {}", call_id, source);
                }
            }
        }
    }

    async fn handle_request(&self, request: SipRequest, source: SocketAddr, protocol: TransportProtocol) {
        counter!("pbx_sip_requests_total", "method" => request.method.to_string()).increment(1);

        match self.transactions.begin(&request, source, protocol) {
            TransactionMatch::Retransmission(Some(response)) => {
                debug!("Re-sending {} for retransmitted {}", response.status_code, request.method);
                self.outbound.send_bytes(response.to_bytes(), source, protocol).await;
                return;
            }
            TransactionMatch::Retransmission(None) => {
                debug!("Retransmitted {} still being processed", request.method);
                return;
            }
            TransactionMatch::New | TransactionMatch::Untracked => {}
        }

        let call_id = request.call_id().unwrap_or_default().to_string();
        let in_call = self.manager.lookup(&call_id).is_some();
        let initial_invite = request.method == SipMethod::Invite && request.to_tag().is_none();

        if in_call && !initial_invite {
            let input = CallInput::Sip {
                message: SipMessage::Request(request.clone()),
                source,
                protocol,
            };
            if self.manager.dispatch(&call_id, input).await {
                return;
            }
        }

        match request.method {
            SipMethod::Register => {
                if let Some(response) = self.registrar.handle(&request, source).await {
                    self.outbound.respond(&request, &response, source, protocol).await;
                }
            }
            SipMethod::Options => {
                let response = ResponseBuilder::ok()
                    .to_tag(generate_tag())
                    .header("Allow", ALLOWED_METHODS)
                    .header("Accept", "application/sdp")
                    .build_for_request(&request);
                self.outbound.respond(&request, &response, source, protocol).await;
            }
            SipMethod::Invite if initial_invite && in_call => {
                // Same Call-ID, new branch, no tag: a loop or a fork coming back
                self.reply(&request, 482, source, protocol).await;
            }
            SipMethod::Invite if initial_invite => self.new_call(request, source, protocol).await,
            SipMethod::Ack => debug!("ACK for unknown dialog {} ignored", call_id),
            SipMethod::Invite | SipMethod::Bye | SipMethod::Cancel | SipMethod::Info => {
                self.reply(&request, 481, source, protocol).await;
            }
            _ => {
                debug!("Unsupported method {} from {}", request.method, source);
                self.reply(&request, 501, source, protocol).await;
            }
        }
    }

    async fn reply(&self, request: &SipRequest, code: u16, source: SocketAddr, protocol: TransportProtocol) {
        let mut builder = ResponseBuilder::new(code).to_tag(generate_tag());
        if code == 501 {
            builder = builder.header("Allow", ALLOWED_METHODS);
        }
        let response = builder.build_for_request(request);
        self.outbound.respond(request, &response, source, protocol).await;
    }

    async fn new_call(&self, request: SipRequest, source: SocketAddr, protocol: TransportProtocol) {
        let from_trunk = self.ctx.dialplan.trunk_for_source(&source.ip()).is_some();
        if self.ctx.config.sip.authenticate_invites && !from_trunk {
            match self
                .ctx
                .auth
                .authenticate(&request, ChallengeKind::Proxy, source.ip(), &self.ctx.blacklist)
                .await
            {
                Ok(user) => debug!("INVITE from {} authenticated as {}", source, user),
                Err(response) => {
                    self.outbound.respond(&request, &response, source, protocol).await;
                    return;
                }
            }
        }

        let trying = ResponseBuilder::new(100).build_for_request(&request);
        self.outbound.respond(&request, &trying, source, protocol).await;
        let call_id = CallWorker::spawn(self.services.clone(), request, source, protocol);
        debug!("INVITE from {} started call {}", source, call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::infrastructure::protocols::sip::transport::{ChannelSender, OutgoingMessage};

    async fn server(config: Config) -> (SipServer, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let ctx = CoreContext::from_config(config).await.unwrap();
        let (sender, rx) = ChannelSender::new();
        let server = SipServer::new(ctx, Arc::new(sender), "127.0.0.1:5060".parse().unwrap());
        (server, rx)
    }

    fn incoming(raw: &str) -> IncomingMessage {
        IncomingMessage {
            message: SipMessage::parse_unvalidated(raw.as_bytes()).unwrap(),
            source: "127.0.0.1:5070".parse().unwrap(),
            protocol: TransportProtocol::Udp,
        }
    }

    fn status(out: &OutgoingMessage) -> u16 {
        match out.parse().unwrap() {
            SipMessage::Response(r) => r.status_code,
            SipMessage::Request(r) => panic!("expected a response, got {}", r.method),
        }
    }

    const OPTIONS: &str = "OPTIONS sip:pbx.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bKopt1\r\n\
From: <sip:tester@127.0.0.1>;tag=p\r\n\
To: <sip:pbx.local>\r\n\
Call-ID: opt-1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

    #[tokio::test]
    async fn test_options_lists_allowed_methods() {
        let (server, mut rx) = server(Config::default()).await;
        server.handle(incoming(OPTIONS)).await;

        let out = rx.recv().await.unwrap();
        let SipMessage::Response(response) = out.parse().unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.status_code, 200);
        assert!(response.header("Allow").unwrap().contains("INFO"));
    }

    #[tokio::test]
    async fn test_missing_header_gets_400_naming_it() {
        let (server, mut rx) = server(Config::default()).await;
        let raw = OPTIONS.replace("Call-ID: opt-1\r\n", "");
        server.handle(incoming(&raw)).await;

        let out = rx.recv().await.unwrap();
        let SipMessage::Response(response) = SipMessage::parse_unvalidated(&out.data).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.status_code, 400);
        assert!(response.reason.contains("Call-ID"));
    }

    #[tokio::test]
    async fn test_bye_outside_dialog_and_unknown_method() {
        let (server, mut rx) = server(Config::default()).await;
        let bye = OPTIONS
            .replace("OPTIONS sip", "BYE sip")
            .replace("1 OPTIONS", "1 BYE")
            .replace("opt1", "bye1");
        server.handle(incoming(&bye)).await;
        assert_eq!(status(&rx.recv().await.unwrap()), 481);

        let subscribe = OPTIONS
            .replace("OPTIONS sip", "SUBSCRIBE sip")
            .replace("1 OPTIONS", "1 SUBSCRIBE")
            .replace("opt1", "sub1");
        server.handle(incoming(&subscribe)).await;
        assert_eq!(status(&rx.recv().await.unwrap()), 501);
    }

    #[tokio::test]
    async fn test_retransmission_gets_cached_response() {
        let (server, mut rx) = server(Config::default()).await;
        server.handle(incoming(OPTIONS)).await;
        let first = rx.recv().await.unwrap();
        server.handle(incoming(OPTIONS)).await;
        let second = rx.recv().await.unwrap();
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn test_banned_source_is_ignored() {
        let (server, mut rx) = server(Config::default()).await;
        server.ctx.blacklist.block(
            "127.0.0.1".parse().unwrap(),
            crate::domain::ip_blacklist::BlacklistReason::Manual,
            chrono::Duration::seconds(60),
        );
        server.handle(incoming(OPTIONS)).await;
        assert!(rx.try_recv().is_err());
    }
}
