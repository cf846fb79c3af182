//! SIP message types, parsing and serialization
//!
//! Start lines and header blocks are parsed by rsip. Headers are then kept
//! close to the wire: arrival order is preserved along with repeated headers.
//! Typed views (CSeq, Via, name-addr) are parsed on demand.

use crate::domain::shared::value_objects::SipUri;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: missing or invalid {0}")]
    ValidationError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
    /// Syntactically valid but unsupported method token
    Other(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Other(token) => token,
        }
    }
}

impl FromStr for SipMethod {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(is_token_char) {
            return Err(SipError::ParseError(format!("invalid method token {:?}", s)));
        }
        Ok(match s {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            "PRACK" => SipMethod::Prack,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "REFER" => SipMethod::Refer,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other => SipMethod::Other(other.to_string()),
        })
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

/// Compact header forms (RFC 3261 §7.3.3)
fn expand_compact(name: &str) -> &str {
    if name.len() != 1 {
        return name;
    }
    match name.as_bytes()[0].to_ascii_lowercase() {
        b'v' => "Via",
        b'f' => "From",
        b't' => "To",
        b'i' => "Call-ID",
        b'm' => "Contact",
        b'l' => "Content-Length",
        b'c' => "Content-Type",
        b'e' => "Content-Encoding",
        b'k' => "Supported",
        b's' => "Subject",
        _ => name,
    }
}

fn names_match(a: &str, b: &str) -> bool {
    expand_compact(a).eq_ignore_ascii_case(expand_compact(b))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace every occurrence of `name` with a single header
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|h| names_match(&h.name, name)) {
            Some(index) => {
                self.0[index].value = value;
                let mut seen = 0usize;
                self.0.retain(|h| {
                    if names_match(&h.name, name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.push(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !names_match(&h.name, name));
    }

    /// First occurrence of the header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| names_match(&h.name, name))
            .map(|h| h.value.as_str())
    }

    /// Every occurrence, in order, without splitting comma lists
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| names_match(&h.name, name))
            .map(|h| h.value.as_str())
    }

    /// Every value, with comma-separated lists split into entries
    pub fn values(&self, name: &str) -> Vec<String> {
        self.get_all(name).flat_map(split_list).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Split a header value at commas that are not inside quotes or angle brackets
pub fn split_list(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in value.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '<' if !in_quotes => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(c);
            }
            ',' if !in_quotes && !in_angle => {
                let part = current.trim();
                if !part.is_empty() {
                    parts.push(part.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let part = current.trim();
    if !part.is_empty() {
        parts.push(part.to_string());
    }
    parts
}

/// `;name=value` parameter list
pub fn parse_params(params: &str) -> Vec<(String, Option<String>)> {
    params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().trim_matches('"').to_string())),
            None => (p.to_string(), None),
        })
        .collect()
}

fn find_param<'a>(params: &'a [(String, Option<String>)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.as_deref())
}

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// `"Display" <uri>;params` as used by From, To and Contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: String,
    pub params: Vec<(String, Option<String>)>,
}

impl NameAddr {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        if let Some(open) = value.find('<') {
            let close = value[open..].find('>')? + open;
            let display = value[..open].trim().trim_matches('"').trim();
            Some(Self {
                display_name: (!display.is_empty()).then(|| display.to_string()),
                uri: value[open + 1..close].trim().to_string(),
                params: parse_params(&value[close + 1..]),
            })
        } else {
            // Without brackets every parameter belongs to the header
            let (uri, params) = match value.split_once(';') {
                Some((uri, params)) => (uri, parse_params(params)),
                None => (value, Vec::new()),
            };
            Some(Self {
                display_name: None,
                uri: uri.trim().to_string(),
                params,
            })
        }
    }

    pub fn tag(&self) -> Option<&str> {
        find_param(&self.params, "tag")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        find_param(&self.params, name)
    }

    /// User part of the URI, e.g. the extension number
    pub fn user(&self) -> Option<String> {
        SipUri::parse(&self.uri).ok()?.user().map(str::to_string)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (k, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}

/// One Via entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub protocol: String,
    pub sent_by: String,
    pub params: Vec<(String, Option<String>)>,
}

impl Via {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (head, params) = match value.split_once(';') {
            Some((head, params)) => (head, parse_params(params)),
            None => (value, Vec::new()),
        };
        let mut parts = head.split_whitespace();
        let protocol = parts.next()?.to_string();
        let sent_by = parts.next()?.to_string();
        if !protocol.to_ascii_uppercase().starts_with("SIP/2.0/") {
            return None;
        }
        Some(Self {
            protocol,
            sent_by,
            params,
        })
    }

    pub fn branch(&self) -> Option<&str> {
        find_param(&self.params, "branch")
    }
}

/// Access to the headers every SIP message carries
pub trait SipHeaders {
    fn headers(&self) -> &Headers;

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)
    }

    fn call_id(&self) -> Option<&str> {
        self.header("Call-ID").map(str::trim)
    }

    fn cseq(&self) -> Option<CSeq> {
        self.header("CSeq").and_then(CSeq::parse)
    }

    fn from_header(&self) -> Option<NameAddr> {
        self.header("From").and_then(NameAddr::parse)
    }

    fn to_header(&self) -> Option<NameAddr> {
        self.header("To").and_then(NameAddr::parse)
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|h| h.tag().map(str::to_string))
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|h| h.tag().map(str::to_string))
    }

    fn top_via(&self) -> Option<Via> {
        self.headers().values("Via").first().and_then(|v| Via::parse(v))
    }

    fn branch(&self) -> Option<String> {
        self.top_via().and_then(|v| v.branch().map(str::to_string))
    }

    fn contact(&self) -> Option<NameAddr> {
        self.headers().values("Contact").first().and_then(|v| NameAddr::parse(v))
    }

    fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// Media type in lowercase without parameters
    fn content_type(&self) -> Option<String> {
        self.header("Content-Type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

/// SIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn method(&self) -> &SipMethod {
        &self.method
    }

    /// User part of the Request-URI (the dialed string for INVITE)
    pub fn uri_user(&self) -> Option<String> {
        SipUri::parse(&self.uri).ok()?.user().map(str::to_string)
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} SIP/2.0", self.method, self.uri);
        serialize(&start, &self.headers, &self.body)
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// SIP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipResponse {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("SIP/2.0 {} {}", self.status_code, self.reason);
        serialize(&start, &self.headers, &self.body)
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// SIP message (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// Parse and validate a complete message
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let message = Self::parse_unvalidated(data)?;
        message.validate()?;
        Ok(message)
    }

    /// Parse the framing only; mandatory headers are not checked
    pub fn parse_unvalidated(data: &[u8]) -> Result<Self, SipError> {
        let (head, rest) = split_head(data);
        let head = std::str::from_utf8(head)
            .map_err(|_| SipError::ParseError("header block is not UTF-8".to_string()))?;
        let lines = unfold(head)?;
        let (start_line, header_lines) = lines
            .split_first()
            .ok_or_else(|| SipError::ParseError("empty message".to_string()))?;

        let body = match declared_length(header_lines.iter().map(String::as_str))? {
            Some(len) if rest.len() < len => {
                return Err(SipError::ParseError(format!(
                    "body truncated: declared {} bytes, got {}",
                    len,
                    rest.len()
                )));
            }
            Some(len) => &rest[..len],
            None => rest,
        };

        if let Some(status_part) = start_line.strip_prefix("SIP/2.0 ") {
            let response = rsip::Response::try_from(wire(start_line, header_lines, body).as_slice())?;
            let status_code: u16 = response.status_code.clone().into();
            if !(100..700).contains(&status_code) {
                return Err(SipError::ParseError(format!("bad status line {:?}", start_line)));
            }
            // rsip canonicalises the phrase of well-known codes
            let reason = status_part.split_once(' ').map(|(_, r)| r.trim()).unwrap_or_default();
            return Ok(SipMessage::Response(SipResponse {
                status_code,
                reason: reason.to_string(),
                headers: from_rsip(&response.headers)?,
                body: Bytes::from(response.body),
            }));
        }

        // rsip only knows the RFC 3261 family; extension methods parse under a stand-in
        let token = start_line.split(' ').next().unwrap_or_default();
        let extension = match token.parse::<SipMethod>()? {
            SipMethod::Other(name) => Some(name),
            _ => None,
        };
        let request_line = match &extension {
            Some(name) => start_line.replacen(name.as_str(), "OPTIONS", 1),
            None => start_line.clone(),
        };

        let request = rsip::Request::try_from(wire(&request_line, header_lines, body).as_slice())?;
        if !matches!(request.version, rsip::Version::V2) {
            return Err(SipError::ParseError(format!("unsupported version in {:?}", start_line)));
        }
        let uri = request.uri.to_string();
        if !uri.contains(':') {
            return Err(SipError::ParseError(format!("bad request URI {:?}", uri)));
        }
        let method = match extension {
            Some(name) => SipMethod::Other(name),
            None => request.method.to_string().parse()?,
        };

        Ok(SipMessage::Request(SipRequest {
            method,
            uri,
            headers: from_rsip(&request.headers)?,
            body: Bytes::from(request.body),
        }))
    }

    /// Mandatory header check (Via, From, To, Call-ID, CSeq)
    pub fn validate(&self) -> Result<(), SipError> {
        let headers = self.headers();
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            match headers.get(name) {
                Some(v) if !v.trim().is_empty() => {}
                _ => return Err(SipError::ValidationError(name.to_string())),
            }
        }

        let cseq = CSeq::parse(headers.get("CSeq").unwrap_or_default())
            .ok_or_else(|| SipError::ValidationError("CSeq".to_string()))?;
        if let SipMessage::Request(request) = self {
            if cseq.method != request.method {
                return Err(SipError::ValidationError("CSeq".to_string()));
            }
        }
        if self.top_via().is_none() {
            return Err(SipError::ValidationError("Via".to_string()));
        }
        Ok(())
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl SipHeaders for SipMessage {
    fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }
}

fn split_head(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(data, b"\r\n\r\n") {
        return (&data[..pos], &data[pos + 4..]);
    }
    if let Some(pos) = find(data, b"\n\n") {
        return (&data[..pos], &data[pos + 2..]);
    }
    (data, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Logical header lines with folded continuations joined (RFC 3261 §7.3.1)
fn unfold(head: &str) -> Result<Vec<String>, SipError> {
    let mut lines: Vec<String> = Vec::new();
    for line in head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)) {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(|c| c == ' ' || c == '\t') {
            if lines.len() < 2 {
                return Err(SipError::ParseError(
                    "continuation line before any header".to_string(),
                ));
            }
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
            }
            continue;
        }
        lines.push(line.to_string());
    }
    Ok(lines)
}

fn declared_length<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Option<usize>, SipError> {
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if names_match(name.trim(), "Content-Length") {
                return value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| SipError::ParseError(format!("bad Content-Length {:?}", value)));
            }
        }
    }
    Ok(None)
}

/// Normalised CRLF form handed to rsip
fn wire(start_line: &str, header_lines: &[String], body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + body.len());
    buf.extend_from_slice(start_line.as_bytes());
    buf.extend_from_slice(b"\r\n");
    for line in header_lines {
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
    buf
}

fn from_rsip(headers: &rsip::Headers) -> Result<Headers, SipError> {
    let mut out = Headers::new();
    for header in headers.iter() {
        // Display renders `Name: value` for typed and untyped headers alike
        let line = header.to_string();
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SipError::ParseError(format!("malformed header line {:?}", line)))?;
        out.push(name.trim(), value.trim());
    }
    Ok(out)
}

fn serialize(start_line: &str, headers: &Headers, body: &[u8]) -> Bytes {
    let wire_headers = headers
        .iter()
        .filter(|h| !names_match(&h.name, "Content-Length"))
        .map(|h| rsip::Header::Other(h.name.clone(), h.value.clone()))
        .chain(std::iter::once(rsip::Header::ContentLength(
            rsip::headers::ContentLength::from(body.len() as u32),
        )));

    let mut buf = BytesMut::with_capacity(512 + body.len());
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    for header in wire_headers {
        buf.put_slice(header.to_string().as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.freeze()
}

/// Size of the first complete message in a stream buffer, if one is present
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, SipError> {
    // Leading CRLFs are keep-alives
    let skip = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
    let data = &buf[skip..];
    let Some(end) = find(data, b"\r\n\r\n") else {
        return Ok(None);
    };

    let head = std::str::from_utf8(&data[..end])
        .map_err(|_| SipError::ParseError("header block is not UTF-8".to_string()))?;
    let content_length = declared_length(head.split("\r\n").skip(1))?.unwrap_or(0);

    let total = skip + end + 4 + content_length;
    Ok((buf.len() >= total).then_some(total))
}
