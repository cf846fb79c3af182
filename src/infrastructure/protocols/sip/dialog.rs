//! SIP dialogs (RFC 3261 Section 12)
//!
//! A dialog is identified by Call-ID plus both tags. The call worker keeps
//! one per leg: the caller leg as UAS, the callee leg as UAC.

use super::message::{SipHeaders, SipMessage, SipRequest};
use super::transport::TransportProtocol;
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    /// Unknown on the UAC side until the first tagged response
    pub remote_tag: Option<String>,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};local={};remote={}",
            self.call_id,
            self.local_tag,
            self.remote_tag.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    id: DialogId,
    state: DialogState,
    /// Where in-dialog requests are sent
    pub remote_addr: SocketAddr,
    pub protocol: TransportProtocol,
    local_cseq: u32,
    remote_cseq: Option<u32>,
}

impl Dialog {
    /// Dialog created by answering an incoming INVITE
    pub fn uas(invite: &SipRequest, local_tag: impl Into<String>, source: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            id: DialogId {
                call_id: invite.call_id().unwrap_or_default().to_string(),
                local_tag: local_tag.into(),
                remote_tag: invite.from_tag(),
            },
            state: DialogState::Early,
            remote_addr: source,
            protocol,
            local_cseq: 0,
            remote_cseq: invite.cseq().map(|c| c.seq),
        }
    }

    /// Dialog created by sending an INVITE
    pub fn uac(call_id: impl Into<String>, local_tag: impl Into<String>, destination: SocketAddr, initial_cseq: u32) -> Self {
        Self {
            id: DialogId {
                call_id: call_id.into(),
                local_tag: local_tag.into(),
                remote_tag: None,
            },
            state: DialogState::Early,
            remote_addr: destination,
            protocol: TransportProtocol::Udp,
            local_cseq: initial_cseq,
            remote_cseq: None,
        }
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn call_id(&self) -> &str {
        &self.id.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.id.local_tag
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    /// Learn the remote tag from a response (UAC side)
    pub fn set_remote_tag(&mut self, tag: Option<String>) {
        if self.id.remote_tag.is_none() {
            self.id.remote_tag = tag;
        }
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    /// CSeq for the next request we originate
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    pub fn local_cseq(&self) -> u32 {
        self.local_cseq
    }

    /// Does a message belong to this dialog?
    ///
    /// Requests from the peer carry our tag in To and theirs in From;
    /// responses to our requests carry them the other way round.
    pub fn matches(&self, message: &SipMessage) -> bool {
        if message.call_id() != Some(self.id.call_id.as_str()) {
            return false;
        }
        let (ours, theirs) = match message {
            SipMessage::Request(req) => (req.to_tag(), req.from_tag()),
            SipMessage::Response(resp) => (resp.from_tag(), resp.to_tag()),
        };
        if ours.as_deref() != Some(self.id.local_tag.as_str()) {
            return false;
        }
        match (&self.id.remote_tag, theirs) {
            (Some(expected), Some(got)) => *expected == got,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    /// Accept a remote CSeq only if it moves forward
    pub fn accept_remote_cseq(&mut self, seq: u32) -> bool {
        match self.remote_cseq {
            Some(last) if seq <= last => false,
            _ => {
                self.remote_cseq = Some(seq);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipRequest {
        let mut req = SipRequest::new(super::super::message::SipMethod::Invite, "sip:1002@pbx.local");
        req.headers.push("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKd");
        req.headers.push("From", "<sip:1001@pbx.local>;tag=caller");
        req.headers.push("To", "<sip:1002@pbx.local>");
        req.headers.push("Call-ID", "dlg-1");
        req.headers.push("CSeq", "10 INVITE");
        req
    }

    #[test]
    fn test_uas_dialog_matches_in_dialog_requests() {
        let dialog = Dialog::uas(&invite(), "pbx", "10.0.0.1:5060".parse().unwrap(), TransportProtocol::Udp);
        assert_eq!(dialog.id().remote_tag.as_deref(), Some("caller"));

        let mut bye = invite();
        bye.headers.set("To", "<sip:1002@pbx.local>;tag=pbx");
        assert!(dialog.matches(&SipMessage::Request(bye.clone())));

        bye.headers.set("To", "<sip:1002@pbx.local>;tag=someone-else");
        assert!(!dialog.matches(&SipMessage::Request(bye)));
    }

    #[test]
    fn test_remote_cseq_must_increase() {
        let mut dialog = Dialog::uas(&invite(), "pbx", "10.0.0.1:5060".parse().unwrap(), TransportProtocol::Udp);
        assert!(!dialog.accept_remote_cseq(10));
        assert!(dialog.accept_remote_cseq(11));
        assert!(!dialog.accept_remote_cseq(11));
    }

    #[test]
    fn test_uac_learns_remote_tag_once() {
        let mut dialog = Dialog::uac("b-leg", "b2b", "10.0.0.2:5060".parse().unwrap(), 1);
        assert_eq!(dialog.next_cseq(), 2);
        dialog.set_remote_tag(Some("callee".to_string()));
        dialog.set_remote_tag(Some("forked".to_string()));
        assert_eq!(dialog.id().remote_tag.as_deref(), Some("callee"));
        dialog.confirm();
        assert_eq!(dialog.state(), DialogState::Confirmed);
    }
}
