//! Call worker - one tokio task per call
//!
//! The worker is a back-to-back user agent. It owns the [`Call`] aggregate,
//! the caller leg (A, where we are the UAS), the callee leg (B, where we are
//! the UAC) and the media relay between them. All SIP traffic for either
//! leg reaches it through the [`CallManager`] in arrival order, so nothing
//! about a call is shared with other tasks except through messages.

use super::builder::{generate_branch, generate_call_id, generate_tag, LegAddressing, ResponseBuilder};
use super::call_router::{CallInput, CallManager, TransferError};
use super::dialog::Dialog;
use super::message::{SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
use super::sdp::{SdpError, SdpSession};
use super::transaction::{Outbound, Retransmit, RetransmitKind, SipTimers};
use super::transport::TransportProtocol;
use crate::domain::call::{Call, CallDirection, CallState, CallTrigger, NegotiatedCodec, Party};
use crate::domain::cdr::{publish, CallEventSink};
use crate::domain::dialplan::{Dialplan, FeatureKind, Route, RoutingError};
use crate::domain::extension::ExtensionStore;
use crate::domain::shared::{CallId, DomainError};
use crate::infrastructure::ivr::{
    DtmfParser, DtmfQueue, DtmfQueueConfig, FeatureError, FeatureHandler, FeatureSession, FeatureTable,
    GoertzelConfig,
};
use crate::infrastructure::media::codec::negotiator::{
    CodecNegotiator, Negotiated, NegotiationError, NegotiationMode,
};
use crate::infrastructure::media::port_pool::RtpPortPool;
use crate::infrastructure::media::relay::{Leg, MediaRelay, RelayConfig, RelayEvent, RelayParams};
use crate::infrastructure::media::MediaError;
use metrics::counter;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Methods advertised in Allow headers
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, INFO, REGISTER";

const WARNING_MEDIA_UNAVAILABLE: &str = "304 pbx-core \"Media type not available\"";

/// Per-call knobs taken from configuration
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Address placed in Via and Contact of requests we originate
    pub local_sip: SocketAddr,
    /// Address advertised in SDP for the relay
    pub media_ip: IpAddr,
    pub domain: String,
    pub timers: SipTimers,
    /// Longest wait for the callee to answer once it is ringing
    pub ring_timeout: Duration,
    pub relay: RelayConfig,
    pub dtmf: DtmfQueueConfig,
    /// In-band detection on the caller leg; `None` turns it off
    pub inband: Option<GoertzelConfig>,
}

/// Everything a worker needs besides its own call
#[derive(Clone)]
pub struct CallServices {
    pub settings: Arc<CallSettings>,
    pub outbound: Outbound,
    pub manager: Arc<CallManager>,
    pub store: Arc<dyn ExtensionStore>,
    pub dialplan: Arc<Dialplan>,
    pub negotiator: Arc<CodecNegotiator>,
    pub port_pool: Arc<RtpPortPool>,
    pub features: Arc<FeatureTable>,
    pub events: Arc<dyn CallEventSink>,
    /// Root of every relay's cancellation; relays outlive the call that bound
    /// them when they are transferred
    pub shutdown: CancellationToken,
}

/// Why a call could not be set up
#[derive(Error, Debug)]
pub enum CallSetupError {
    #[error("INVITE carries no SDP offer")]
    MissingOffer,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(#[from] SdpError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Call state error: {0}")]
    Domain(#[from] DomainError),

    #[error("No relay bound for the call")]
    NoRelay,
}

impl CallSetupError {
    /// SIP status sent to the caller
    pub fn status_code(&self) -> u16 {
        match self {
            CallSetupError::MissingOffer | CallSetupError::InvalidSdp(_) => 488,
            CallSetupError::Negotiation(NegotiationError::UnknownCodec(_)) => 500,
            CallSetupError::Negotiation(_) => 488,
            CallSetupError::Routing(RoutingError::NoMatch(_)) => 404,
            CallSetupError::Routing(RoutingError::NotRegistered(_)) => 480,
            CallSetupError::Routing(RoutingError::FeatureUnavailable(_)) => 503,
            CallSetupError::Media(MediaError::ResourceExhaustion(_)) => 503,
            CallSetupError::Media(_) | CallSetupError::Domain(_) | CallSetupError::NoRelay => 500,
        }
    }

    fn warning(&self) -> Option<&'static str> {
        match self {
            CallSetupError::Negotiation(NegotiationError::CodecMismatch) => Some(WARNING_MEDIA_UNAVAILABLE),
            _ => None,
        }
    }
}

/// Where the callee leg is sent
#[derive(Debug, Clone)]
struct Target {
    request_uri: String,
    destination: SocketAddr,
}

/// Leg toward the caller; we answered its INVITE
struct CallerLeg {
    invite: SipRequest,
    source: SocketAddr,
    protocol: TransportProtocol,
    dialog: Dialog,
    /// For requests we send to the caller, e.g. BYE
    addressing: LegAddressing,
    offer: Option<SdpSession>,
    /// Our current answer, re-used for re-INVITEs
    local_sdp: Option<SdpSession>,
    final_sent: bool,
}

/// Leg toward the callee; we sent its INVITE
struct CalleeLeg {
    dialog: Dialog,
    addressing: LegAddressing,
    invite: SipRequest,
    /// Our offer, re-used for re-INVITEs from the callee
    local_sdp: SdpSession,
    retransmit: Option<Retransmit>,
    provisional: bool,
    final_status: Option<u16>,
    last_ack: Option<SipRequest>,
    cancelled: bool,
}

impl CalleeLeg {
    fn answered(&self) -> bool {
        self.final_status.is_some_and(|code| (200..300).contains(&code))
    }
}

/// A 2xx we keep re-sending until the ACK arrives
struct PendingAck {
    leg: Leg,
    response: SipResponse,
    destination: SocketAddr,
    protocol: TransportProtocol,
    retransmit: Retransmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    InviteRetransmit,
    InviteTimeout,
    ResponseRetransmit,
}

enum Step {
    Input(Option<CallInput>),
    Relay(Option<RelayEvent>),
    Feature(Result<Result<(), FeatureError>, JoinError>),
    Timer(Timer),
}

pub struct CallWorker {
    call: Call,
    services: CallServices,
    inputs: mpsc::Receiver<CallInput>,
    cancel: CancellationToken,
    dtmf: Arc<DtmfQueue>,
    route: Option<Result<Route, RoutingError>>,
    caller: CallerLeg,
    callee: Option<CalleeLeg>,
    relay: Option<MediaRelay>,
    /// Codecs accepted from the caller and offered to the callee
    offered: Option<Negotiated>,
    feature: Option<JoinHandle<Result<(), FeatureError>>>,
    pending_ack: Option<PendingAck>,
    started: Instant,
    invite_deadline: Option<Instant>,
    session_id: u64,
}

impl CallWorker {
    /// Register a worker for a new INVITE and start it
    pub fn spawn(
        services: CallServices,
        invite: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> CallId {
        let call_id = CallId::new();
        let sip_call_id = invite.call_id().unwrap_or_default().to_string();
        let (tx, rx) = mpsc::channel(64);
        services.manager.insert(call_id, &sip_call_id, tx);

        let worker = Self::new(call_id, services, rx, invite, source, protocol);
        tokio::spawn(worker.run());
        call_id
    }

    fn new(
        call_id: CallId,
        services: CallServices,
        inputs: mpsc::Receiver<CallInput>,
        invite: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Self {
        let settings = services.settings.clone();
        let caller_id = invite
            .from_header()
            .and_then(|f| f.user())
            .unwrap_or_else(|| "anonymous".to_string());
        let dialed = invite.uri_user().unwrap_or_default();

        let route = services.dialplan.route(&dialed);
        let direction = match &route {
            Ok(Route::Trunk { .. }) => CallDirection::Outbound,
            _ if services.dialplan.trunk_for_source(&source.ip()).is_some() => CallDirection::Inbound,
            _ => CallDirection::Internal,
        };

        let local_tag = generate_tag();
        let dialog = Dialog::uas(&invite, local_tag.clone(), source, protocol);
        let contact = format!("<sip:pbx@{}>", settings.local_sip);
        let addressing = LegAddressing {
            local: settings.local_sip,
            request_uri: invite
                .contact()
                .or_else(|| invite.from_header())
                .map(|c| c.uri)
                .unwrap_or_else(|| format!("sip:{}", source)),
            from: match invite.to_header() {
                Some(to) => format!("<{}>;tag={}", to.uri, local_tag),
                None => format!("<sip:{}@{}>;tag={}", dialed, settings.domain, local_tag),
            },
            to: invite.header("From").unwrap_or_default().to_string(),
            call_id: invite.call_id().unwrap_or_default().to_string(),
            contact,
        };

        Self {
            call: Call::new(call_id, caller_id, dialed, direction),
            inputs,
            cancel: services.shutdown.child_token(),
            dtmf: Arc::new(DtmfQueue::new(&settings.dtmf)),
            route: Some(route),
            caller: CallerLeg {
                invite,
                source,
                protocol,
                dialog,
                addressing,
                offer: None,
                local_sdp: None,
                final_sent: false,
            },
            callee: None,
            relay: None,
            offered: None,
            feature: None,
            pending_ack: None,
            started: Instant::now(),
            invite_deadline: None,
            session_id: rand::random::<u32>() as u64,
            services,
        }
    }

    fn id(&self) -> CallId {
        self.call.id()
    }

    fn settings(&self) -> &CallSettings {
        &self.services.settings
    }

    pub async fn run(mut self) {
        counter!("pbx_calls_started_total").increment(1);
        match self.setup().await {
            Ok(()) => {
                self.flush_events();
                self.event_loop().await;
            }
            Err(e) => self.fail_setup(e).await,
        }
        self.teardown().await;
        self.linger().await;
        self.services.manager.remove(self.id());
    }

    async fn setup(&mut self) -> Result<(), CallSetupError> {
        self.call.dial()?;
        info!(
            "[{}] {} calling {} from {}",
            self.id(),
            self.call.caller(),
            self.call.callee(),
            self.caller.source
        );

        let body = self
            .caller
            .invite
            .body_str()
            .filter(|b| !b.trim().is_empty())
            .ok_or(CallSetupError::MissingOffer)?;
        let offer = SdpSession::parse(body)?;
        self.caller.offer = Some(offer.clone());

        let route = self
            .route
            .take()
            .unwrap_or_else(|| Err(RoutingError::NoMatch(self.call.callee().to_string())))?;
        match route {
            Route::Extension(number) => {
                let registration = self
                    .services
                    .store
                    .lookup_contact(&number)
                    .await
                    .ok_or(RoutingError::NotRegistered(number))?;
                let target = Target {
                    request_uri: registration.contact,
                    destination: registration.source,
                };
                self.bridge(offer, target).await
            }
            Route::Trunk { trunk, dialed } => {
                let target = Target {
                    request_uri: trunk.request_uri(&dialed),
                    destination: trunk.address,
                };
                self.bridge(offer, target).await
            }
            Route::Feature { feature, argument } => {
                let handler = self.services.features.get(feature)?;
                self.answer_feature(offer, handler, feature, argument).await
            }
        }
    }

    /// Offer the call to the callee through a freshly bound relay
    async fn bridge(&mut self, offer: SdpSession, target: Target) -> Result<(), CallSetupError> {
        let offered = self.services.negotiator.negotiate_session(&offer, NegotiationMode::Relay)?;
        let relay = MediaRelay::bind(
            self.id().to_string(),
            &self.services.port_pool,
            self.settings().relay.clone(),
            &self.services.shutdown,
        )
        .await?;
        if let Some(rtp) = offer.audio_endpoint() {
            relay.set_leg(Leg::A, rtp);
        }

        let settings = self.services.settings.clone();
        let local_sdp = SdpSession::audio(
            settings.media_ip,
            self.session_id,
            relay.local_port(),
            &offered.sdp_codecs(),
            offer.audio_direction(),
        );

        let local_tag = generate_tag();
        let sip_call_id = generate_call_id(&settings.local_sip.ip().to_string());
        let addressing = LegAddressing {
            local: settings.local_sip,
            request_uri: target.request_uri.clone(),
            from: format!("<sip:{}@{}>;tag={}", self.call.caller(), settings.domain, local_tag),
            to: format!("<{}>", target.request_uri),
            call_id: sip_call_id.clone(),
            contact: format!("<sip:pbx@{}>", settings.local_sip),
        };
        let invite = addressing.invite(1, &generate_branch(), &local_sdp.build());
        self.services.manager.alias(&sip_call_id, self.id());

        info!(
            "[{}] offering to {} at {} ({} on {})",
            self.id(),
            target.request_uri,
            target.destination,
            offered.primary().name,
            relay.local_rtp()
        );
        self.services
            .outbound
            .send_request(&invite, target.destination, TransportProtocol::Udp)
            .await;

        let now = Instant::now();
        self.callee = Some(CalleeLeg {
            dialog: Dialog::uac(sip_call_id, local_tag, target.destination, 1),
            addressing,
            invite,
            local_sdp,
            retransmit: Some(Retransmit::start(RetransmitKind::InviteRequest, settings.timers, now)),
            provisional: false,
            final_status: None,
            last_ack: None,
            cancelled: false,
        });
        self.invite_deadline = Some(now + settings.ring_timeout.min(settings.timers.transaction_timeout()));
        self.relay = Some(relay);
        self.offered = Some(offered);
        Ok(())
    }

    /// Answer locally and hand the call to a feature handler
    async fn answer_feature(
        &mut self,
        offer: SdpSession,
        handler: Arc<dyn FeatureHandler>,
        feature: FeatureKind,
        argument: String,
    ) -> Result<(), CallSetupError> {
        let negotiated = self.services.negotiator.negotiate_session(&offer, NegotiationMode::Terminate)?;
        let mut relay = MediaRelay::bind(
            self.id().to_string(),
            &self.services.port_pool,
            self.settings().relay.clone(),
            &self.services.shutdown,
        )
        .await?;
        if let Some(rtp) = offer.audio_endpoint() {
            relay.set_leg(Leg::A, rtp);
        }
        let answer = SdpSession::audio(
            self.settings().media_ip,
            self.session_id,
            relay.local_port(),
            &negotiated.sdp_codecs(),
            offer.audio_direction().reverse(),
        );

        let codec = negotiated.to_call_codec();
        self.call.ring()?;
        self.call.answer(codec.clone())?;
        relay.set_dtmf_queue(self.dtmf.clone());
        relay.start(RelayParams {
            codec,
            payload_types: Vec::new(),
            inband: self.settings().inband.clone(),
        });
        self.call.attach_media(relay.endpoint_ref())?;

        let session = FeatureSession::new(
            self.id(),
            self.call.caller(),
            feature,
            argument,
            relay.player(),
            self.dtmf.clone(),
            self.cancel.child_token(),
        );
        self.relay = Some(relay);
        self.send_answer(answer).await;
        counter!("pbx_calls_answered_total").increment(1);

        info!("[{}] attached to feature {:?}", self.id(), feature);
        self.feature = Some(tokio::spawn(async move { handler.run(session).await }));
        Ok(())
    }

    async fn fail_setup(&mut self, e: CallSetupError) {
        let code = e.status_code();
        warn!("[{}] setup failed with {}: {}", self.id(), code, e);
        counter!("pbx_calls_failed_total", "status" => code.to_string()).increment(1);

        let mut response = ResponseBuilder::new(code);
        if let Some(warning) = e.warning() {
            response = response.header("Warning", warning);
        }
        self.send_final_to_caller(response).await;
        if let Err(e) = self.call.apply(CallTrigger::Reject(code)) {
            error!("[{}] {}", self.id(), e);
        }
    }

    async fn event_loop(&mut self) {
        while self.call.is_active() {
            let timer = self.next_timer();
            let step = tokio::select! {
                input = self.inputs.recv() => Step::Input(input),
                event = relay_event(&mut self.relay) => Step::Relay(event),
                result = feature_done(&mut self.feature) => Step::Feature(result),
                timer = timer_fired(timer) => Step::Timer(timer),
            };

            match step {
                Step::Input(Some(input)) => self.on_input(input).await,
                Step::Input(None) => {
                    warn!("[{}] input channel closed", self.id());
                    self.hangup(Party::System).await;
                }
                Step::Relay(Some(event)) => self.on_relay_event(event).await,
                Step::Relay(None) => {}
                Step::Feature(result) => self.on_feature_done(result).await,
                Step::Timer(timer) => self.on_timer(timer).await,
            }
            self.flush_events();
        }
    }

    fn next_timer(&self) -> Option<(Instant, Timer)> {
        let retransmit = self
            .callee
            .as_ref()
            .and_then(|c| c.retransmit.as_ref())
            .map(|r| (r.next_at(), Timer::InviteRetransmit));
        let timeout = self.invite_deadline.map(|at| (at, Timer::InviteTimeout));
        let response = self
            .pending_ack
            .as_ref()
            .map(|p| (p.retransmit.next_at(), Timer::ResponseRetransmit));
        [retransmit, timeout, response]
            .into_iter()
            .flatten()
            .min_by_key(|(at, _)| *at)
    }

    fn flush_events(&mut self) {
        let events = self.call.take_events();
        if !events.is_empty() {
            publish(self.services.events.as_ref(), events);
        }
    }

    fn apply(&mut self, trigger: CallTrigger) {
        match self.call.apply(trigger) {
            Ok(state) => debug!("[{}] {} -> {}", self.id(), trigger, state),
            Err(e) => warn!("[{}] {}", self.id(), e),
        }
    }

    async fn on_input(&mut self, input: CallInput) {
        match input {
            CallInput::Sip {
                message: SipMessage::Request(request),
                source,
                protocol,
            } => self.on_request(request, source, protocol).await,
            CallInput::Sip {
                message: SipMessage::Response(response),
                ..
            } => self.on_response(response).await,
            CallInput::DetachMedia(reply) => {
                let relay = self.relay.take();
                if relay.is_some() {
                    self.call.take_media();
                    info!("[{}] media detached", self.id());
                }
                // If the requester went away the relay is dropped and its ports freed
                let _ = reply.send(relay);
            }
            CallInput::AttachMedia(relay, reply) => {
                let result = self.attach_relay(relay).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn attach_relay(&mut self, relay: MediaRelay) -> Result<(), TransferError> {
        if let Some(old) = self.relay.take() {
            self.call.take_media();
            old.stop().await;
        }
        self.call
            .attach_media(relay.endpoint_ref())
            .map_err(|e| TransferError::Rejected(self.id(), e.to_string()))?;
        relay.set_dtmf_queue(self.dtmf.clone());
        info!("[{}] media attached on {}", self.id(), relay.local_rtp());
        self.relay = Some(relay);
        Ok(())
    }

    fn leg_of(&self, message: &SipMessage) -> Option<Leg> {
        let call_id = message.call_id()?;
        if call_id == self.caller.dialog.call_id() {
            Some(Leg::A)
        } else if self.callee.as_ref().is_some_and(|c| c.dialog.call_id() == call_id) {
            Some(Leg::B)
        } else {
            None
        }
    }

    fn local_tag(&self, leg: Leg) -> String {
        match (leg, &self.callee) {
            (Leg::B, Some(callee)) => callee.dialog.local_tag().to_string(),
            _ => self.caller.dialog.local_tag().to_string(),
        }
    }

    async fn reply(
        &self,
        leg: Leg,
        request: &SipRequest,
        response: ResponseBuilder,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> SipResponse {
        let response = response.to_tag(self.local_tag(leg)).build_for_request(request);
        self.services.outbound.respond(request, &response, source, protocol).await;
        response
    }

    async fn send_final_to_caller(&mut self, response: ResponseBuilder) {
        if self.caller.final_sent {
            return;
        }
        self.caller.final_sent = true;
        let invite = self.caller.invite.clone();
        self.reply(Leg::A, &invite, response, self.caller.source, self.caller.protocol)
            .await;
    }

    /// 200 OK with SDP to the caller, retransmitted until ACKed
    async fn send_answer(&mut self, sdp: SdpSession) {
        let builder = ResponseBuilder::ok()
            .header("Contact", self.caller.addressing.contact.clone())
            .header("Allow", ALLOWED_METHODS)
            .body("application/sdp", sdp.build());
        self.caller.local_sdp = Some(sdp);
        self.caller.final_sent = true;

        let invite = self.caller.invite.clone();
        let (source, protocol) = (self.caller.source, self.caller.protocol);
        let response = self.reply(Leg::A, &invite, builder, source, protocol).await;
        self.pending_ack = Some(PendingAck {
            leg: Leg::A,
            response,
            destination: source,
            protocol,
            retransmit: Retransmit::start(RetransmitKind::InviteResponse, self.settings().timers, Instant::now()),
        });
    }

    async fn on_request(&mut self, request: SipRequest, source: SocketAddr, protocol: TransportProtocol) {
        let Some(leg) = self.leg_of(&SipMessage::Request(request.clone())) else {
            return;
        };

        let in_dialog = !matches!(request.method, SipMethod::Cancel | SipMethod::Ack)
            && !(leg == Leg::A && request.to_tag().is_none());
        if in_dialog {
            let seq = request.cseq().map(|c| c.seq).unwrap_or_default();
            let accepted = match (leg, self.callee.as_mut()) {
                (Leg::B, Some(callee)) => callee.dialog.accept_remote_cseq(seq),
                _ => self.caller.dialog.accept_remote_cseq(seq),
            };
            if !accepted {
                warn!("[{}] out-of-order CSeq {} on leg {:?}", self.id(), seq, leg);
                self.reply(leg, &request, ResponseBuilder::new(500), source, protocol).await;
                return;
            }
        }

        match request.method {
            SipMethod::Invite if !in_dialog => {
                debug!("[{}] ignoring second initial INVITE", self.id());
            }
            SipMethod::Invite => self.on_reinvite(leg, request, source, protocol).await,
            SipMethod::Ack => self.on_ack(leg),
            SipMethod::Cancel if leg == Leg::A => self.on_cancel(request, source, protocol).await,
            SipMethod::Bye => self.on_bye(leg, request, source, protocol).await,
            SipMethod::Info => self.on_info(leg, request, source, protocol).await,
            SipMethod::Options => {
                let response = ResponseBuilder::ok().header("Allow", ALLOWED_METHODS);
                self.reply(leg, &request, response, source, protocol).await;
            }
            _ => {
                let response = ResponseBuilder::new(501).header("Allow", ALLOWED_METHODS);
                self.reply(leg, &request, response, source, protocol).await;
            }
        }
    }

    fn on_ack(&mut self, leg: Leg) {
        if self.pending_ack.as_ref().is_some_and(|p| p.leg == leg) {
            self.pending_ack = None;
            if leg == Leg::A {
                self.caller.dialog.confirm();
            }
            debug!("[{}] ACK received on leg {:?}", self.id(), leg);
        }
    }

    async fn on_cancel(&mut self, request: SipRequest, source: SocketAddr, protocol: TransportProtocol) {
        self.reply(Leg::A, &request, ResponseBuilder::ok(), source, protocol).await;
        if self.caller.final_sent {
            debug!("[{}] CANCEL after final response has no effect", self.id());
            return;
        }

        info!("[{}] cancelled by caller", self.id());
        self.send_final_to_caller(ResponseBuilder::new(487)).await;
        self.cancel_callee().await;
        self.apply(CallTrigger::Cancel);
    }

    async fn on_bye(&mut self, leg: Leg, request: SipRequest, source: SocketAddr, protocol: TransportProtocol) {
        if !matches!(self.call.state(), CallState::Connected | CallState::Hold) {
            self.reply(leg, &request, ResponseBuilder::new(481), source, protocol).await;
            return;
        }

        self.reply(leg, &request, ResponseBuilder::ok(), source, protocol).await;
        let party = match leg {
            Leg::A => Party::Caller,
            Leg::B => Party::Callee,
        };
        info!("[{}] hangup by {:?}", self.id(), party);
        self.send_bye(leg.other()).await;
        self.apply(CallTrigger::Hangup(party));
    }

    async fn on_info(&mut self, leg: Leg, request: SipRequest, source: SocketAddr, protocol: TransportProtocol) {
        let content_type = request.content_type().unwrap_or_default();
        if !DtmfParser::supports(&content_type) {
            let response = ResponseBuilder::new(415).header("Accept", "application/dtmf-relay, application/dtmf");
            self.reply(leg, &request, response, source, protocol).await;
            return;
        }

        let response = match DtmfParser::parse_sip_info(&content_type, request.body_str().unwrap_or_default()) {
            Ok(event) => {
                // Digits are collected from the caller only
                if leg == Leg::A {
                    let outcome = self.dtmf.push(event.clone());
                    debug!("[{}] INFO digit {} -> {:?}", self.id(), event.digit.to_char(), outcome);
                }
                ResponseBuilder::ok()
            }
            Err(e) => {
                warn!("[{}] bad DTMF INFO body: {}", self.id(), e);
                ResponseBuilder::new(400)
            }
        };
        self.reply(leg, &request, response, source, protocol).await;
    }

    /// Hold/resume from either side. Codec changes are refused.
    async fn on_reinvite(&mut self, leg: Leg, request: SipRequest, source: SocketAddr, protocol: TransportProtocol) {
        if self.pending_ack.is_some() || !matches!(self.call.state(), CallState::Connected | CallState::Hold) {
            self.reply(leg, &request, ResponseBuilder::new(491), source, protocol).await;
            return;
        }

        let offer = match request
            .body_str()
            .filter(|b| !b.trim().is_empty())
            .map(SdpSession::parse)
        {
            Some(Ok(offer)) => offer,
            _ => {
                self.reply(leg, &request, ResponseBuilder::new(488), source, protocol).await;
                return;
            }
        };

        let keeps_codec = self.call.codec().is_some_and(|codec| offers_codec(&offer, codec));
        if !keeps_codec {
            warn!("[{}] re-INVITE drops the active codec", self.id());
            let response = ResponseBuilder::new(488).header("Warning", WARNING_MEDIA_UNAVAILABLE);
            self.reply(leg, &request, response, source, protocol).await;
            return;
        }

        let direction = offer.audio_direction();
        match (self.call.state(), direction.is_hold()) {
            (CallState::Connected, true) => self.apply(CallTrigger::Hold),
            (CallState::Hold, false) => self.apply(CallTrigger::Resume),
            _ => {}
        }
        if let (Some(relay), Some(rtp)) = (&self.relay, offer.audio_endpoint()) {
            if !rtp.ip().is_unspecified() {
                relay.set_leg(leg, rtp);
            }
        }

        let local = match (leg, self.callee.as_mut()) {
            (Leg::B, Some(callee)) => Some(&mut callee.local_sdp),
            _ => self.caller.local_sdp.as_mut(),
        };
        let Some(local) = local else {
            self.reply(leg, &request, ResponseBuilder::new(500), source, protocol).await;
            return;
        };
        if let Some(audio) = local.first_audio_mut() {
            audio.set_direction(direction.reverse());
        }
        local.bump_version();
        let body = local.build();

        let builder = ResponseBuilder::ok()
            .header("Contact", format!("<sip:pbx@{}>", self.settings().local_sip))
            .body("application/sdp", body);
        let response = self.reply(leg, &request, builder, source, protocol).await;
        self.pending_ack = Some(PendingAck {
            leg,
            response,
            destination: source,
            protocol,
            retransmit: Retransmit::start(RetransmitKind::InviteResponse, self.settings().timers, Instant::now()),
        });
    }

    async fn on_response(&mut self, response: SipResponse) {
        if self.leg_of(&SipMessage::Response(response.clone())) != Some(Leg::B) {
            debug!("[{}] stray response {}", self.id(), response.status_code);
            return;
        }
        match response.cseq().map(|c| c.method) {
            Some(SipMethod::Invite) => self.on_invite_response(response).await,
            Some(method) => debug!("[{}] {} to our {}", self.id(), response.status_code, method),
            None => {}
        }
    }

    async fn on_invite_response(&mut self, response: SipResponse) {
        let id = self.id();
        let ring_deadline = self.started + self.settings().ring_timeout;
        let Some(callee) = self.callee.as_mut() else {
            return;
        };
        callee.retransmit = None;
        let code = response.status_code;

        if callee.final_status.is_some() {
            // Retransmitted final: the ACK got lost
            if let Some(ack) = &callee.last_ack {
                let destination = callee.dialog.remote_addr;
                self.services
                    .outbound
                    .send_request(ack, destination, TransportProtocol::Udp)
                    .await;
            }
            return;
        }

        if response.is_provisional() {
            if code == 100 || callee.provisional {
                return;
            }
            callee.provisional = true;
            self.invite_deadline = Some(ring_deadline);
            if self.call.state() == CallState::Calling {
                self.apply(CallTrigger::Ring);
            }
            info!("[{}] callee ringing ({})", id, code);
            let invite = self.caller.invite.clone();
            self.reply(Leg::A, &invite, ResponseBuilder::new(180), self.caller.source, self.caller.protocol)
                .await;
            return;
        }

        callee.final_status = Some(code);
        self.invite_deadline = None;
        let ack = callee.addressing.ack(&callee.invite, &response);
        let destination = callee.dialog.remote_addr;
        callee.last_ack = Some(ack.clone());
        self.services
            .outbound
            .send_request(&ack, destination, TransportProtocol::Udp)
            .await;

        if response.is_success() {
            callee.dialog.set_remote_tag(response.to_tag());
            callee.dialog.confirm();
            if let Some(to) = response.header("To") {
                callee.addressing.to = to.to_string();
            }
            if let Some(contact) = response.contact() {
                callee.addressing.request_uri = contact.uri;
            }
            if !self.call.is_active() || callee.cancelled {
                // Answered after we gave up on it
                self.send_bye(Leg::B).await;
                return;
            }
            if let Err(e) = self.connect(&response).await {
                let status = e.status_code();
                warn!("[{}] cannot connect answered call: {}", id, e);
                counter!("pbx_calls_failed_total", "status" => status.to_string()).increment(1);
                self.send_bye(Leg::B).await;
                let mut builder = ResponseBuilder::new(status);
                if let Some(warning) = e.warning() {
                    builder = builder.header("Warning", warning);
                }
                self.send_final_to_caller(builder).await;
                self.apply(CallTrigger::Reject(status));
            }
            return;
        }

        if callee.cancelled {
            return;
        }
        // We do not follow redirects
        let forwarded = if (300..400).contains(&code) { 480 } else { code };
        info!("[{}] callee rejected with {}", id, code);
        counter!("pbx_calls_failed_total", "status" => forwarded.to_string()).increment(1);
        self.send_final_to_caller(ResponseBuilder::new(forwarded)).await;
        self.apply(CallTrigger::Reject(forwarded));
    }

    /// Callee answered: finish negotiation, start forwarding, answer the caller
    async fn connect(&mut self, response: &SipResponse) -> Result<(), CallSetupError> {
        let body = response
            .body_str()
            .filter(|b| !b.trim().is_empty())
            .ok_or(CallSetupError::MissingOffer)?;
        let answer = SdpSession::parse(body)?;
        let offered = self.offered.as_ref().ok_or(CallSetupError::MissingOffer)?;
        let negotiated = self.services.negotiator.accept_answer(offered, &answer)?;
        let caller_offer = self.caller.offer.as_ref().ok_or(CallSetupError::MissingOffer)?;
        let relay = self.relay.as_mut().ok_or(CallSetupError::NoRelay)?;

        if let Some(rtp) = answer.audio_endpoint() {
            relay.set_leg(Leg::B, rtp);
        }
        let caller_sdp = SdpSession::audio(
            self.services.settings.media_ip,
            self.session_id,
            relay.local_port(),
            &negotiated.sdp_codecs(),
            caller_offer.audio_direction().reverse(),
        );

        let mut payload_types: Vec<u8> = caller_offer
            .first_audio()
            .map(|m| m.formats())
            .unwrap_or_default();
        payload_types.extend(answer.first_audio().map(|m| m.formats()).unwrap_or_default());
        payload_types.sort_unstable();
        payload_types.dedup();

        let codec = negotiated.to_call_codec();
        if self.call.state() == CallState::Calling {
            self.call.ring()?;
        }
        self.call.answer(codec.clone())?;
        relay.set_dtmf_queue(self.dtmf.clone());
        relay.start(RelayParams {
            codec,
            payload_types,
            inband: self.services.settings.inband.clone(),
        });
        self.call.attach_media(relay.endpoint_ref())?;

        info!("[{}] connected ({})", self.id(), negotiated.primary().name);
        counter!("pbx_calls_answered_total").increment(1);
        self.send_answer(caller_sdp).await;
        Ok(())
    }

    async fn on_timer(&mut self, timer: Timer) {
        let now = Instant::now();
        match timer {
            Timer::InviteRetransmit => {
                let Some(callee) = self.callee.as_mut() else {
                    return;
                };
                let Some(retransmit) = callee.retransmit.as_mut() else {
                    return;
                };
                if retransmit.poll(now) {
                    debug!("[{}] retransmitting INVITE ({})", self.call.id(), retransmit.sent());
                    let (invite, destination) = (callee.invite.clone(), callee.dialog.remote_addr);
                    self.services
                        .outbound
                        .send_request(&invite, destination, TransportProtocol::Udp)
                        .await;
                } else if retransmit.is_expired(now) {
                    callee.retransmit = None;
                }
            }
            Timer::InviteTimeout => {
                self.invite_deadline = None;
                info!("[{}] no answer", self.id());
                counter!("pbx_calls_failed_total", "status" => "408").increment(1);
                self.cancel_callee().await;
                self.send_final_to_caller(ResponseBuilder::new(408)).await;
                self.apply(CallTrigger::Timeout);
            }
            Timer::ResponseRetransmit => {
                let Some(pending) = self.pending_ack.as_mut() else {
                    return;
                };
                if pending.retransmit.is_expired(now) {
                    warn!("[{}] no ACK for 2xx on leg {:?}", self.call.id(), pending.leg);
                    self.pending_ack = None;
                    self.hangup(Party::System).await;
                } else if pending.retransmit.poll(now) && !pending.protocol.is_reliable() {
                    let (data, destination, protocol) =
                        (pending.response.to_bytes(), pending.destination, pending.protocol);
                    self.services.outbound.send_bytes(data, destination, protocol).await;
                }
            }
        }
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Inactive => warn!("[{}] media inactive, tearing down", self.id()),
            RelayEvent::Failed(reason) => error!("[{}] media failed: {}", self.id(), reason),
        }
        if self.call.state().is_answered() {
            self.send_bye(Leg::A).await;
            self.send_bye(Leg::B).await;
        } else {
            self.cancel_callee().await;
            self.send_final_to_caller(ResponseBuilder::new(500)).await;
        }
        self.apply(CallTrigger::MediaFailure);
    }

    async fn on_feature_done(&mut self, result: Result<Result<(), FeatureError>, JoinError>) {
        self.feature = None;
        match result {
            Ok(Ok(())) => info!("[{}] feature finished", self.id()),
            Ok(Err(FeatureError::Hangup)) => debug!("[{}] feature saw hangup", self.id()),
            Ok(Err(e)) => warn!("[{}] feature failed: {}", self.id(), e),
            Err(e) => error!("[{}] feature task panicked: {}", self.id(), e),
        }
        if self.call.is_active() {
            self.hangup(Party::System).await;
        }
    }

    /// BYE both answered legs and end the call
    async fn hangup(&mut self, party: Party) {
        if self.call.state().is_answered() {
            self.send_bye(Leg::A).await;
            self.send_bye(Leg::B).await;
            self.apply(CallTrigger::Hangup(party));
        } else {
            self.cancel_callee().await;
            self.send_final_to_caller(ResponseBuilder::new(480)).await;
            self.apply(CallTrigger::Timeout);
        }
    }

    async fn send_bye(&mut self, leg: Leg) {
        let (request, destination, protocol) = match leg {
            Leg::A => {
                if !self.caller.final_sent {
                    return;
                }
                let cseq = self.caller.dialog.next_cseq();
                self.caller.dialog.terminate();
                (
                    self.caller.addressing.in_dialog(SipMethod::Bye, cseq),
                    self.caller.source,
                    self.caller.protocol,
                )
            }
            Leg::B => {
                let Some(callee) = self.callee.as_mut().filter(|c| c.answered()) else {
                    return;
                };
                let cseq = callee.dialog.next_cseq();
                callee.dialog.terminate();
                (
                    callee.addressing.in_dialog(SipMethod::Bye, cseq),
                    callee.dialog.remote_addr,
                    TransportProtocol::Udp,
                )
            }
        };
        self.services.outbound.send_request(&request, destination, protocol).await;
    }

    /// CANCEL the outstanding INVITE to the callee, if there is one
    async fn cancel_callee(&mut self) {
        let Some(callee) = self.callee.as_mut() else {
            return;
        };
        callee.retransmit = None;
        if callee.final_status.is_some() || callee.cancelled {
            return;
        }
        callee.cancelled = true;
        let cancel = callee.addressing.cancel(&callee.invite);
        let destination = callee.dialog.remote_addr;
        self.services
            .outbound
            .send_request(&cancel, destination, TransportProtocol::Udp)
            .await;
    }

    async fn teardown(&mut self) {
        if self.call.is_active() {
            self.hangup(Party::System).await;
        }
        self.flush_events();

        // The feature task holds a player on the relay socket
        if let Some(feature) = self.feature.take() {
            feature.abort();
        }
        if let Some(relay) = self.relay.take() {
            let stats = relay.stop().await;
            debug!("[{}] relay stats: {:?}", self.id(), stats);
        }
        self.call.take_media();
        self.dtmf.close();
        self.cancel.cancel();
        info!(
            "[{}] ended: {:?}",
            self.id(),
            self.call.end_reason()
        );
    }

    /// Stay reachable until the callee's INVITE transaction is finished so
    /// its final response gets ACKed (and a late 2xx gets a BYE)
    async fn linger(&mut self) {
        let deadline = Instant::now() + self.settings().timers.transaction_timeout();
        while self.callee.as_ref().is_some_and(|c| c.final_status.is_none()) {
            let input = tokio::select! {
                input = self.inputs.recv() => input,
                _ = tokio::time::sleep_until(deadline.into()) => None,
            };
            let Some(input) = input else {
                break;
            };
            match input {
                CallInput::Sip {
                    message: SipMessage::Response(response),
                    ..
                } => self.on_response(response).await,
                CallInput::Sip {
                    message: SipMessage::Request(request),
                    source,
                    protocol,
                } => {
                    if request.method != SipMethod::Ack {
                        let leg = self.leg_of(&SipMessage::Request(request.clone())).unwrap_or(Leg::A);
                        self.reply(leg, &request, ResponseBuilder::new(481), source, protocol).await;
                    }
                }
                CallInput::DetachMedia(reply) => {
                    let _ = reply.send(None);
                }
                CallInput::AttachMedia(_, reply) => {
                    let _ = reply.send(Err(TransferError::Rejected(self.id(), "call ended".to_string())));
                }
            }
        }
    }
}

/// Whether a re-offer still lists the codec in use
fn offers_codec(offer: &SdpSession, codec: &NegotiatedCodec) -> bool {
    let Some(audio) = offer.first_audio() else {
        return false;
    };
    audio.codecs().iter().any(|c| {
        if codec.payload_type < 96 && c.payload_type == codec.payload_type {
            return true;
        }
        c.name.eq_ignore_ascii_case(&codec.encoding) && c.clock_rate == codec.clock_rate
    })
}

async fn relay_event(relay: &mut Option<MediaRelay>) -> Option<RelayEvent> {
    match relay {
        Some(relay) if relay.is_running() => relay.next_event().await,
        _ => std::future::pending().await,
    }
}

async fn feature_done(
    feature: &mut Option<JoinHandle<Result<(), FeatureError>>>,
) -> Result<Result<(), FeatureError>, JoinError> {
    match feature {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn timer_fired(timer: Option<(Instant, Timer)>) -> Timer {
    match timer {
        Some((at, timer)) => {
            tokio::time::sleep_until(at.into()).await;
            timer
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::sdp::MediaDirection;

    #[test]
    fn test_setup_error_status_codes() {
        assert_eq!(CallSetupError::MissingOffer.status_code(), 488);
        assert_eq!(
            CallSetupError::Routing(RoutingError::NoMatch("7".to_string())).status_code(),
            404
        );
        assert_eq!(
            CallSetupError::Routing(RoutingError::NotRegistered("1002".to_string())).status_code(),
            480
        );
        assert_eq!(
            CallSetupError::Routing(RoutingError::FeatureUnavailable(FeatureKind::Park)).status_code(),
            503
        );
        assert_eq!(
            CallSetupError::Media(MediaError::ResourceExhaustion("pool".to_string())).status_code(),
            503
        );

        let mismatch = CallSetupError::Negotiation(NegotiationError::CodecMismatch);
        assert_eq!(mismatch.status_code(), 488);
        assert!(mismatch.warning().unwrap().starts_with("304 "));
    }

    #[test]
    fn test_reoffer_must_keep_active_codec() {
        let pcmu = NegotiatedCodec {
            payload_type: 0,
            encoding: "PCMU".to_string(),
            clock_rate: 8000,
            telephone_event: Some(101),
        };
        let codecs = |pts: &[u8]| {
            pts.iter()
                .filter_map(|pt| crate::infrastructure::protocols::sip::sdp::SdpCodec::static_payload(*pt))
                .collect::<Vec<_>>()
        };
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        let hold = SdpSession::audio(ip, 1, 4000, &codecs(&[8, 0]), MediaDirection::SendOnly);
        assert!(offers_codec(&hold, &pcmu));

        let switched = SdpSession::audio(ip, 1, 4000, &codecs(&[8]), MediaDirection::SendRecv);
        assert!(!offers_codec(&switched, &pcmu));
    }
}
