//! REGISTER handling through the dispatcher

mod common;

use common::*;
use pbx_core::infrastructure::protocols::sip::{AuthChallenge, SipHeaders, SipMethod};

fn register(cseq: u32, authorization: Option<&str>) -> String {
    let auth = authorization
        .map(|a| format!("Authorization: {}\r\n", a))
        .unwrap_or_default();
    format!(
        "REGISTER sip:pbx.test SIP/2.0\r\n\
Via: SIP/2.0/UDP {a};branch=z9hG4bKreg{cseq}\r\n\
From: <sip:1001@pbx.test>;tag=reg\r\n\
To: <sip:1001@pbx.test>\r\n\
Call-ID: reg-1001\r\n\
CSeq: {cseq} REGISTER\r\n\
Contact: <sip:1001@{a}>\r\n\
Expires: 600\r\n\
{auth}Content-Length: 0\r\n\r\n",
        a = PHONE_A,
        cseq = cseq,
        auth = auth,
    )
}

#[tokio::test]
async fn test_register_challenge_then_bind() {
    let mut h = Harness::new(config(44000, 44010)).await;

    h.send_raw(&register(1, None), PHONE_A).await;
    let challenge = h.expect_response(PHONE_A, 401, SipMethod::Register).await;
    let challenge = AuthChallenge::parse(challenge.header("WWW-Authenticate").unwrap()).unwrap();
    assert_eq!(challenge.realm, "pbx.test");

    let authorization = challenge.authorize("1001", "secret1", "REGISTER", "sip:pbx.test", "c0ffee");
    h.send_raw(&register(2, Some(&authorization)), PHONE_A).await;
    let ok = h.expect_response(PHONE_A, 200, SipMethod::Register).await;
    assert_eq!(ok.expires(), Some(600));

    let binding = h.ctx.store.lookup_contact("1001").await.unwrap();
    assert_eq!(binding.contact, format!("sip:1001@{}", PHONE_A));
    assert_eq!(binding.source, addr(PHONE_A));
}

#[tokio::test]
async fn test_wrong_password_counts_toward_ban() {
    let mut h = Harness::new(config(44020, 44030)).await;

    h.send_raw(&register(1, None), PHONE_A).await;
    let challenge = h.expect_response(PHONE_A, 401, SipMethod::Register).await;
    let challenge = AuthChallenge::parse(challenge.header("WWW-Authenticate").unwrap()).unwrap();

    let authorization = challenge.authorize("1001", "wrong", "REGISTER", "sip:pbx.test", "c0ffee");
    h.send_raw(&register(2, Some(&authorization)), PHONE_A).await;
    h.expect_response(PHONE_A, 401, SipMethod::Register).await;

    assert_eq!(h.ctx.blacklist.failure_count(&addr(PHONE_A).ip()), 1);
    assert!(!h.ctx.store.is_registered("1001").await);
}

#[tokio::test]
async fn test_registered_extension_is_reachable() {
    let mut h = Harness::new(config(44040, 44050)).await;

    h.send_raw(&register(1, None), PHONE_A).await;
    let challenge = h.expect_response(PHONE_A, 401, SipMethod::Register).await;
    let challenge = AuthChallenge::parse(challenge.header("WWW-Authenticate").unwrap()).unwrap();
    let authorization = challenge.authorize("1001", "secret1", "REGISTER", "sip:pbx.test", "beef");
    h.send_raw(&register(2, Some(&authorization)), PHONE_A).await;
    h.expect_response(PHONE_A, 200, SipMethod::Register).await;

    // 1002 calls 1001 and the INVITE goes where 1001 registered from
    let a_rtp = rtp_socket().await;
    let invite = Invite::new("reach-1", "1001");
    h.send_raw(&invite.raw(&phone_sdp(a_rtp.local_addr().unwrap(), "sendrecv")), PHONE_B)
        .await;
    let forwarded = h.expect_request(PHONE_A, SipMethod::Invite).await;
    assert_eq!(forwarded.uri, format!("sip:1001@{}", PHONE_A));
}
