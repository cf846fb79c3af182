//! SIP message builder utilities

use super::message::{Headers, SipHeaders, SipMethod, SipRequest, SipResponse};
use bytes::Bytes;
use rand::Rng;
use std::net::SocketAddr;

/// Standard reason phrase for a status code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        600 => "Busy Everywhere",
        603 => "Decline",
        _ => match code / 100 {
            1 => "Progress",
            2 => "OK",
            3 => "Redirect",
            4 => "Client Error",
            5 => "Server Error",
            _ => "Global Failure",
        },
    }
}

fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Fresh From/To tag
pub fn generate_tag() -> String {
    random_token(10)
}

/// Fresh RFC 3261 branch (magic cookie prefixed)
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", random_token(16))
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", random_token(20), host)
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    headers: Headers,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: None,
            to_tag: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Add a To-tag unless the request already carries one
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut headers = Headers::new();

        // Copy essential headers from request
        for value in request.headers.get_all("Via") {
            headers.push("Via", value);
        }
        if let Some(from) = request.header("From") {
            headers.push("From", from);
        }
        if let Some(to) = request.header("To") {
            match (&self.to_tag, request.to_tag()) {
                (Some(tag), None) => headers.push("To", format!("{};tag={}", to, tag)),
                _ => headers.push("To", to),
            }
        }
        if let Some(call_id) = request.header("Call-ID") {
            headers.push("Call-ID", call_id);
        }
        if let Some(cseq) = request.header("CSeq") {
            headers.push("CSeq", cseq);
        }
        for header in self.headers.iter() {
            headers.push(header.name.clone(), header.value.clone());
        }

        SipResponse {
            status_code: self.status_code,
            reason: self
                .reason
                .unwrap_or_else(|| reason_phrase(self.status_code).to_string()),
            headers,
            body: self.body,
        }
    }
}

/// Build a request for the outbound leg
pub struct RequestBuilder {
    request: SipRequest,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            request: SipRequest::new(method, uri),
        }
    }

    /// Top Via sent from `local`
    pub fn via(mut self, local: SocketAddr, branch: &str) -> Self {
        self.request
            .headers
            .push("Via", format!("SIP/2.0/UDP {};branch={};rport", local, branch));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.request.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.request.headers.set("Content-Type", content_type);
        self.request.body = body.into();
        self
    }

    pub fn build(mut self) -> SipRequest {
        if !self.request.headers.contains("Max-Forwards") {
            self.request.headers.push("Max-Forwards", "70");
        }
        self.request
    }
}

/// Dialog-level fields needed to originate requests on one leg
#[derive(Debug, Clone)]
pub struct LegAddressing {
    pub local: SocketAddr,
    pub request_uri: String,
    pub from: String,
    pub to: String,
    pub call_id: String,
    pub contact: String,
}

impl LegAddressing {
    pub fn invite(&self, cseq: u32, branch: &str, sdp: &str) -> SipRequest {
        RequestBuilder::new(SipMethod::Invite, self.request_uri.clone())
            .via(self.local, branch)
            .header("From", self.from.clone())
            .header("To", self.to.clone())
            .header("Call-ID", self.call_id.clone())
            .header("CSeq", format!("{} INVITE", cseq))
            .header("Contact", self.contact.clone())
            .body("application/sdp", sdp.to_string())
            .build()
    }

    /// CANCEL reuses the INVITE's branch and CSeq number
    pub fn cancel(&self, invite: &SipRequest) -> SipRequest {
        let mut builder = RequestBuilder::new(SipMethod::Cancel, invite.uri.clone());
        if let Some(via) = invite.headers.get_all("Via").next() {
            builder = builder.header("Via", via);
        }
        let seq = invite.cseq().map(|c| c.seq).unwrap_or(1);
        builder
            .header("From", self.from.clone())
            .header("To", self.to.clone())
            .header("Call-ID", self.call_id.clone())
            .header("CSeq", format!("{} CANCEL", seq))
            .build()
    }

    /// ACK for a final response; a 2xx ACK is its own transaction
    pub fn ack(&self, invite: &SipRequest, response: &SipResponse) -> SipRequest {
        let seq = invite.cseq().map(|c| c.seq).unwrap_or(1);
        let to = response
            .header("To")
            .map(str::to_string)
            .unwrap_or_else(|| self.to.clone());
        let mut builder = RequestBuilder::new(SipMethod::Ack, self.request_uri.clone());
        if response.is_success() {
            builder = builder.via(self.local, &generate_branch());
        } else if let Some(via) = invite.headers.get_all("Via").next() {
            builder = builder.header("Via", via);
        }
        builder
            .header("From", self.from.clone())
            .header("To", to)
            .header("Call-ID", self.call_id.clone())
            .header("CSeq", format!("{} ACK", seq))
            .build()
    }

    pub fn in_dialog(&self, method: SipMethod, cseq: u32) -> SipRequest {
        let name = method.as_str().to_string();
        RequestBuilder::new(method, self.request_uri.clone())
            .via(self.local, &generate_branch())
            .header("From", self.from.clone())
            .header("To", self.to.clone())
            .header("Call-ID", self.call_id.clone())
            .header("CSeq", format!("{} {}", cseq, name))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMessage;

    fn invite() -> SipRequest {
        let data = b"INVITE sip:1002@pbx.local SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa\r\n\
Max-Forwards: 70\r\n\
From: <sip:1001@pbx.local>;tag=caller\r\n\
To: <sip:1002@pbx.local>\r\n\
Call-ID: call-1\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n";
        match SipMessage::parse(data).unwrap() {
            SipMessage::Request(req) => req,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_response_copies_dialog_headers() {
        let req = invite();
        let resp = ResponseBuilder::new(180).to_tag("callee").build_for_request(&req);
        assert_eq!(resp.reason, "Ringing");
        assert_eq!(resp.call_id(), Some("call-1"));
        assert_eq!(resp.branch().as_deref(), Some("z9hG4bKa"));
        assert_eq!(resp.from_tag().as_deref(), Some("caller"));
        assert_eq!(resp.to_tag().as_deref(), Some("callee"));
        assert_eq!(resp.header("CSeq"), Some("1 INVITE"));
    }

    #[test]
    fn test_response_keeps_existing_to_tag() {
        let mut req = invite();
        req.headers.set("To", "<sip:1002@pbx.local>;tag=already");
        let resp = ResponseBuilder::ok().to_tag("other").build_for_request(&req);
        assert_eq!(resp.to_tag().as_deref(), Some("already"));
    }

    #[test]
    fn test_response_roundtrips_through_codec() {
        let resp = ResponseBuilder::new(488)
            .header("Warning", "304 pbx \"Incompatible media format\"")
            .build_for_request(&invite());
        let parsed = SipMessage::parse(&resp.to_bytes()).unwrap();
        let parsed = parsed.as_response().unwrap();
        assert_eq!(parsed.status_code(), 488);
        assert_eq!(parsed.reason, "Not Acceptable Here");
        assert!(parsed.header("Warning").unwrap().starts_with("304"));
    }

    #[test]
    fn test_leg_requests_are_valid() {
        let leg = LegAddressing {
            local: "127.0.0.1:5060".parse().unwrap(),
            request_uri: "sip:1002@10.0.0.2:5060".to_string(),
            from: "<sip:1001@pbx.local>;tag=b2b".to_string(),
            to: "<sip:1002@pbx.local>".to_string(),
            call_id: generate_call_id("pbx.local"),
            contact: "<sip:pbx@127.0.0.1:5060>".to_string(),
        };
        let invite = leg.invite(1, &generate_branch(), "v=0\r\n");
        let cancel = leg.cancel(&invite);

        for req in [&invite, &cancel, &leg.in_dialog(SipMethod::Bye, 2)] {
            assert!(SipMessage::parse(&req.to_bytes()).is_ok());
        }
        assert_eq!(cancel.branch(), invite.branch());
        assert_eq!(cancel.header("CSeq"), Some("1 CANCEL"));
    }

    #[test]
    fn test_generated_identifiers() {
        assert!(generate_branch().starts_with("z9hG4bK"));
        assert_ne!(generate_tag(), generate_tag());
    }
}
