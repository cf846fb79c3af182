//! WebRTC SDP transformation
//!
//! Browsers speak ICE + DTLS-SRTP with bundled, muxed RTP; classic SIP
//! endpoints speak plain RTP/AVP. The two functions here rewrite one dialect
//! into the other. Neither fails: input that does not parse is returned as-is.

use crate::infrastructure::protocols::sip::sdp::{MediaDirection, SdpLine, SdpSession};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use tracing::warn;

pub const WEBRTC_PROTOCOL: &str = "UDP/TLS/RTP/SAVPF";
pub const SIP_PROTOCOL: &str = "RTP/AVP";

/// Media-level attributes that only make sense for ICE/DTLS/bundle transports
const WEBRTC_MEDIA_ATTRIBUTES: &[&str] = &[
    "ice-ufrag",
    "ice-pwd",
    "ice-options",
    "ice-lite",
    "candidate",
    "end-of-candidates",
    "fingerprint",
    "setup",
    "mid",
    "msid",
    "ssrc",
    "ssrc-group",
    "extmap",
    "extmap-allow-mixed",
    "rtcp-mux",
    "rtcp-rsize",
    "rtcp-fb",
    "crypto",
];

/// Session-level attributes dropped on the way to SIP
const WEBRTC_SESSION_ATTRIBUTES: &[&str] = &[
    "ice-ufrag",
    "ice-pwd",
    "ice-options",
    "ice-lite",
    "fingerprint",
    "setup",
    "group",
    "msid-semantic",
    "extmap-allow-mixed",
];

fn is_listed(line: &SdpLine, names: &[&str]) -> bool {
    line.as_attribute()
        .map(|(name, _)| names.iter().any(|n| n.eq_ignore_ascii_case(name)))
        .unwrap_or(false)
}

/// DTLS setup role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsSetup {
    Active,
    Passive,
    Actpass,
}

impl DtlsSetup {
    pub fn as_str(&self) -> &'static str {
        match self {
            DtlsSetup::Active => "active",
            DtlsSetup::Passive => "passive",
            DtlsSetup::Actpass => "actpass",
        }
    }
}

/// DTLS fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

impl DtlsFingerprint {
    /// SHA-256 over fresh random key material, uppercase colon-separated hex
    pub fn generate() -> Self {
        let mut material = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut material);
        let digest = Sha256::digest(material);
        let value = digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            algorithm: "sha-256".to_string(),
            value,
        }
    }

    /// To SDP format: "sha-256 AA:BB:CC:..."
    pub fn to_sdp(&self) -> String {
        format!("{} {}", self.algorithm, self.value)
    }
}

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Self {
        let random = |len| {
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect::<String>()
        };
        Self {
            ufrag: random(8),
            pwd: random(24),
        }
    }
}

/// Rewrite a WebRTC description for a plain SIP endpoint
pub fn to_sip(webrtc_sdp: &str) -> String {
    let mut sdp = match SdpSession::parse(webrtc_sdp) {
        Ok(sdp) => sdp,
        Err(e) => {
            warn!("to_sip: leaving unparseable SDP unchanged: {}", e);
            return webrtc_sdp.to_string();
        }
    };

    sdp.remove_session_lines(|l| is_listed(l, WEBRTC_SESSION_ATTRIBUTES));
    let session_direction = sdp
        .session_lines()
        .iter()
        .filter_map(SdpLine::as_attribute)
        .any(|(n, _)| MediaDirection::parse(n).is_some());

    for media in sdp.media.iter_mut() {
        media.remove_lines(|l| is_listed(l, WEBRTC_MEDIA_ATTRIBUTES));
        if media.protocol() != SIP_PROTOCOL && media.protocol().contains("RTP") {
            media.set_protocol(SIP_PROTOCOL);
        }
        if media.direction().is_none() && !session_direction {
            media.push_attribute(MediaDirection::SendRecv.as_str());
        }
    }

    sdp.build()
}

/// Rewrite a SIP description for a browser, with freshly generated ICE and DTLS identity
pub fn to_webrtc(sip_sdp: &str) -> String {
    to_webrtc_with(sip_sdp, &IceCredentials::generate(), &DtlsFingerprint::generate())
}

pub fn to_webrtc_with(sip_sdp: &str, ice: &IceCredentials, fingerprint: &DtlsFingerprint) -> String {
    let mut sdp = match SdpSession::parse(sip_sdp) {
        Ok(sdp) => sdp,
        Err(e) => {
            warn!("to_webrtc: leaving unparseable SDP unchanged: {}", e);
            return sip_sdp.to_string();
        }
    };

    sdp.remove_session_lines(|l| is_listed(l, WEBRTC_SESSION_ATTRIBUTES));
    let mids: Vec<String> = (0..sdp.media.len()).map(|i| i.to_string()).collect();
    if !mids.is_empty() {
        sdp.push_session_attribute(format!("group:BUNDLE {}", mids.join(" ")));
    }

    for (media, mid) in sdp.media.iter_mut().zip(&mids) {
        media.remove_lines(|l| is_listed(l, WEBRTC_MEDIA_ATTRIBUTES));
        media.set_protocol(WEBRTC_PROTOCOL);
        media.push_attribute(format!("ice-ufrag:{}", ice.ufrag));
        media.push_attribute(format!("ice-pwd:{}", ice.pwd));
        media.push_attribute("ice-options:trickle");
        media.push_attribute(format!("fingerprint:{}", fingerprint.to_sdp()));
        media.push_attribute(format!("setup:{}", DtlsSetup::Actpass.as_str()));
        media.push_attribute(format!("mid:{}", mid));
        media.push_attribute("rtcp-mux");
    }

    sdp.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::sdp::SdpCodec;

    const SIP_OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 192.168.1.10\r\n\
s=-\r\n\
c=IN IP4 192.168.1.10\r\n\
t=0 0\r\n\
m=audio 10000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n";

    const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
a=extmap-allow-mixed\r\n\
a=msid-semantic: WMS stream\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8 126\r\n\
c=IN IP4 203.0.113.7\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=candidate:1 1 udp 2122260223 203.0.113.7 50000 typ host\r\n\
a=end-of-candidates\r\n\
a=ice-ufrag:abcd\r\n\
a=ice-pwd:aaaaaaaaaaaaaaaaaaaaaaaa\r\n\
a=ice-options:trickle\r\n\
a=fingerprint:sha-256 AA:BB\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n\
a=msid:stream track\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtcp-fb:111 transport-cc\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:126 telephone-event/8000\r\n\
a=ssrc:1001 cname:xyz\r\n";

    fn has_webrtc_attributes(sdp: &str) -> bool {
        ["ice-", "fingerprint", "setup:", "candidate", "mid:", "msid", "ssrc", "extmap", "rtcp-mux", "group:"]
            .iter()
            .any(|a| sdp.contains(&format!("a={}", a)))
    }

    #[test]
    fn test_to_webrtc_scenario() {
        let out = to_webrtc(SIP_OFFER);
        assert!(out.contains("m=audio 10000 UDP/TLS/RTP/SAVPF 0\r\n"));
        assert!(out.contains("a=ice-ufrag:"));
        assert!(out.contains("a=ice-pwd:"));
        assert!(out.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(out.contains("a=setup:actpass\r\n"));
        assert!(out.contains("a=mid:0\r\n"));
        assert!(out.contains("a=rtcp-mux\r\n"));

        let fingerprint = out
            .lines()
            .find_map(|l| l.strip_prefix("a=fingerprint:sha-256 "))
            .unwrap();
        let octets: Vec<&str> = fingerprint.split(':').collect();
        assert_eq!(octets.len(), 32);
        assert!(octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())));
    }

    #[test]
    fn test_roundtrip_preserves_codecs_and_address() {
        let original = SdpSession::parse(SIP_OFFER).unwrap();
        let back = to_sip(&to_webrtc(SIP_OFFER));
        let back_sdp = SdpSession::parse(&back).unwrap();

        assert!(!has_webrtc_attributes(&back));
        assert_eq!(back_sdp.connection_address(), original.connection_address());
        assert_eq!(
            back_sdp.first_audio().unwrap().codecs(),
            original.first_audio().unwrap().codecs()
        );
        assert_eq!(back_sdp.first_audio().unwrap().protocol(), "RTP/AVP");
        assert_eq!(back_sdp.audio_direction(), MediaDirection::SendRecv);
    }

    #[test]
    fn test_to_sip_strips_browser_offer() {
        let out = to_sip(BROWSER_OFFER);
        assert!(!has_webrtc_attributes(&out), "{}", out);
        assert!(out.contains("m=audio 9 RTP/AVP 111 0 8 126\r\n"));
        assert!(out.contains("a=fmtp:111 minptime=10;useinbandfec=1\r\n"));
        assert!(out.contains("a=sendrecv\r\n"));

        let sdp = SdpSession::parse(&out).unwrap();
        let codecs = sdp.first_audio().unwrap().codecs();
        assert_eq!(codecs[1], SdpCodec::new(0, "PCMU", 8000));
        assert!(codecs[3].is_telephone_event());
    }

    #[test]
    fn test_existing_direction_is_kept() {
        let input = format!("{}a=sendonly\r\n", SIP_OFFER);
        let out = to_sip(&input);
        assert_eq!(out.matches("a=sendonly").count(), 1);
        assert!(!out.contains("a=sendrecv"));
    }

    #[test]
    fn test_unparseable_input_is_returned_unchanged() {
        let garbage = "this is not sdp";
        assert_eq!(to_sip(garbage), garbage);
        assert_eq!(to_webrtc(garbage), garbage);
    }

    #[test]
    fn test_fresh_identity_per_call() {
        assert_ne!(IceCredentials::generate(), IceCredentials::generate());
        assert_ne!(DtlsFingerprint::generate(), DtlsFingerprint::generate());
        assert!(IceCredentials::generate().pwd.len() >= 22);
    }
}
