//! Feature calls answered by the core, with DTMF from every detector

mod common;

use async_trait::async_trait;
use common::*;
use pbx_core::domain::dialplan::FeatureKind;
use pbx_core::infrastructure::ivr::{
    DtmfDigit, FeatureError, FeatureHandler, FeatureSession, FeatureTable, Rfc2833Sender,
};
use pbx_core::infrastructure::media::rtp::RtpSequencer;
use pbx_core::infrastructure::protocols::sip::{SdpSession, SipHeaders, SipMethod};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Reports every digit it hears until the caller goes quiet
struct DigitProbe {
    heard: mpsc::UnboundedSender<(char, String)>,
}

#[async_trait]
impl FeatureHandler for DigitProbe {
    async fn run(&self, session: FeatureSession) -> Result<(), FeatureError> {
        while let Some(event) = session.next_digit(Duration::from_millis(1500)).await? {
            let _ = self
                .heard
                .send((event.digit.to_char(), event.source.as_str().to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_info_and_rfc2833_digit_delivered_once() {
    let (heard_tx, mut heard) = mpsc::unbounded_channel();
    let features = FeatureTable::new().with(
        FeatureKind::VoicemailAccess,
        Arc::new(DigitProbe { heard: heard_tx }),
    );
    let mut h = Harness::with_features(config(45000, 45010), features).await;
    let a_rtp = rtp_socket().await;

    let invite = Invite::new("vm-1", "*97");
    h.send_raw(&invite.raw(&phone_sdp(a_rtp.local_addr().unwrap(), "sendrecv")), PHONE_A)
        .await;
    let answer = h.expect_response(PHONE_A, 200, SipMethod::Invite).await;
    let to_tag = answer.to_tag().unwrap();
    let relay = SdpSession::parse(answer.body_str().unwrap())
        .unwrap()
        .audio_endpoint()
        .unwrap();
    h.send_raw(&invite.in_dialog("ACK", 1, &to_tag, None), PHONE_A).await;

    // Same key press reported over SIP INFO and RFC 2833
    let body = "Signal=5\r\nDuration=100\r\n";
    h.send_raw(
        &invite.in_dialog("INFO", 2, &to_tag, Some(("application/dtmf-relay", body))),
        PHONE_A,
    )
    .await;
    h.expect_response(PHONE_A, 200, SipMethod::Info).await;

    let sender = Rfc2833Sender::new(101, 8000, 3);
    let mut sequencer = RtpSequencer::new();
    for packet in sender.packets(DtmfDigit::Five, Duration::from_millis(100), &mut sequencer) {
        a_rtp.send_to(&packet.serialize(), relay).await.unwrap();
    }

    let (digit, source) = timeout(Duration::from_secs(2), heard.recv()).await.unwrap().unwrap();
    assert_eq!(digit, '5');
    assert_eq!(source, "sip-info");
    assert!(timeout(Duration::from_millis(800), heard.recv()).await.is_err());

    // Handler gives up after its digit timeout and the core hangs up
    let bye = h.expect_request(PHONE_A, SipMethod::Bye).await;
    assert_eq!(bye.call_id(), Some("vm-1"));
    h.wait_idle().await;
}

#[tokio::test]
async fn test_unsupported_info_body_is_refused() {
    let (heard_tx, _heard) = mpsc::unbounded_channel();
    let features = FeatureTable::new().with(
        FeatureKind::VoicemailAccess,
        Arc::new(DigitProbe { heard: heard_tx }),
    );
    let mut h = Harness::with_features(config(45020, 45030), features).await;
    let a_rtp = rtp_socket().await;

    let invite = Invite::new("vm-2", "*97");
    h.send_raw(&invite.raw(&phone_sdp(a_rtp.local_addr().unwrap(), "sendrecv")), PHONE_A)
        .await;
    let answer = h.expect_response(PHONE_A, 200, SipMethod::Invite).await;
    let to_tag = answer.to_tag().unwrap();
    h.send_raw(&invite.in_dialog("ACK", 1, &to_tag, None), PHONE_A).await;

    h.send_raw(
        &invite.in_dialog("INFO", 2, &to_tag, Some(("text/plain", "5"))),
        PHONE_A,
    )
    .await;
    let refused = h.expect_response(PHONE_A, 415, SipMethod::Info).await;
    assert!(refused.header("Accept").unwrap().contains("application/dtmf-relay"));

    h.send_raw(
        &invite.in_dialog("INFO", 3, &to_tag, Some(("application/dtmf-relay", "Signal=x\r\n"))),
        PHONE_A,
    )
    .await;
    h.expect_response(PHONE_A, 400, SipMethod::Info).await;

    h.send_raw(&invite.in_dialog("BYE", 4, &to_tag, None), PHONE_A).await;
    h.expect_response(PHONE_A, 200, SipMethod::Bye).await;
    h.wait_idle().await;
}

#[tokio::test]
async fn test_feature_without_handler_gets_503() {
    let mut h = Harness::new(config(45040, 45050)).await;
    let a_rtp = rtp_socket().await;

    let invite = Invite::new("park-1", "*70");
    h.send_raw(&invite.raw(&phone_sdp(a_rtp.local_addr().unwrap(), "sendrecv")), PHONE_A)
        .await;
    h.expect_response(PHONE_A, 503, SipMethod::Invite).await;
    h.wait_idle().await;
}
