//! SDP (Session Description Protocol) handling
//!
//! A session is stored as its ordered `x=value` lines, split into the
//! session-level block and one block per `m=` line, so that building a parsed
//! session reproduces the input exactly. Typed views (connection address,
//! codecs, direction) are derived from those lines on demand and mutators
//! rewrite them in place.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("Malformed SDP: {0}")]
    Malformed(String),
}

/// One `x=value` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpLine {
    pub kind: char,
    pub value: String,
}

impl SdpLine {
    pub fn new(kind: char, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn attribute(value: impl Into<String>) -> Self {
        Self::new('a', value)
    }

    /// Attribute name and optional value for `a=` lines
    pub fn as_attribute(&self) -> Option<(&str, Option<&str>)> {
        if self.kind != 'a' {
            return None;
        }
        Some(match self.value.split_once(':') {
            Some((name, value)) => (name, Some(value)),
            None => (self.value.as_str(), None),
        })
    }

    pub fn is_attribute(&self, name: &str) -> bool {
        self.as_attribute()
            .map(|(n, _)| n.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    }
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind, self.value)
    }
}

/// Media direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    /// Direction to answer with for an offered direction
    pub fn reverse(&self) -> Self {
        match self {
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            other => *other,
        }
    }

    /// Whether this direction puts the call on hold
    pub fn is_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }
}

/// Codec as declared in a media description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpCodec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub fmtp: Option<String>,
}

impl SdpCodec {
    pub fn new(payload_type: u8, name: &str, clock_rate: u32) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate,
            channels: None,
            fmtp: None,
        }
    }

    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.fmtp = Some(fmtp.into());
        self
    }

    /// RTP/AVP static assignment (RFC 3551), including G722's 8000 Hz rtpmap rate
    pub fn static_payload(payload_type: u8) -> Option<Self> {
        let (name, rate) = match payload_type {
            0 => ("PCMU", 8000),
            3 => ("GSM", 8000),
            4 => ("G723", 8000),
            8 => ("PCMA", 8000),
            9 => ("G722", 8000),
            18 => ("G729", 8000),
            _ => return None,
        };
        Some(Self::new(payload_type, name, rate))
    }

    pub fn is_telephone_event(&self) -> bool {
        self.name.eq_ignore_ascii_case("telephone-event")
    }

    pub fn rtpmap_value(&self) -> String {
        match self.channels {
            Some(ch) => format!("{} {}/{}/{}", self.payload_type, self.name, self.clock_rate, ch),
            None => format!("{} {}/{}", self.payload_type, self.name, self.clock_rate),
        }
    }
}

/// One media description: the `m=` line and the lines that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    lines: Vec<SdpLine>,
}

impl MediaSection {
    pub fn new(media: &str, port: u16, protocol: &str, formats: &[u8]) -> Self {
        let mut section = Self {
            lines: vec![SdpLine::new('m', String::new())],
        };
        section.set_media_line(media, port, protocol, formats);
        section
    }

    fn media_fields(&self) -> Vec<&str> {
        self.lines[0].value.split_whitespace().collect()
    }

    fn set_media_line(&mut self, media: &str, port: u16, protocol: &str, formats: &[u8]) {
        let mut value = format!("{} {} {}", media, port, protocol);
        for pt in formats {
            value.push_str(&format!(" {}", pt));
        }
        self.lines[0].value = value;
    }

    pub fn lines(&self) -> &[SdpLine] {
        &self.lines
    }

    pub fn media_type(&self) -> &str {
        self.media_fields().first().copied().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.media_fields()
            .get(1)
            .and_then(|p| p.split('/').next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    pub fn protocol(&self) -> &str {
        self.media_fields().get(2).copied().unwrap_or_default()
    }

    /// Payload types in `m=` order; non-numeric formats are skipped
    pub fn formats(&self) -> Vec<u8> {
        self.media_fields()
            .iter()
            .skip(3)
            .filter_map(|f| f.parse().ok())
            .collect()
    }

    pub fn set_port(&mut self, port: u16) {
        let mut fields: Vec<String> = self.media_fields().iter().map(|s| s.to_string()).collect();
        if fields.len() >= 2 {
            fields[1] = port.to_string();
            self.lines[0].value = fields.join(" ");
        }
    }

    pub fn set_protocol(&mut self, protocol: &str) {
        let mut fields: Vec<String> = self.media_fields().iter().map(|s| s.to_string()).collect();
        if fields.len() >= 3 {
            fields[2] = protocol.to_string();
            self.lines[0].value = fields.join(" ");
        }
    }

    /// Media-level connection address
    pub fn connection_address(&self) -> Option<IpAddr> {
        self.lines
            .iter()
            .find(|l| l.kind == 'c')
            .and_then(|l| parse_connection(&l.value))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.lines.iter().filter_map(SdpLine::as_attribute)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.lines.iter().any(|l| l.is_attribute(name))
    }

    pub fn push_attribute(&mut self, value: impl Into<String>) {
        self.lines.push(SdpLine::attribute(value));
    }

    /// Remove every line the predicate selects (the `m=` line is kept)
    pub fn remove_lines<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&SdpLine) -> bool,
    {
        let mut first = true;
        self.lines.retain(|line| {
            let keep = first || !predicate(line);
            first = false;
            keep
        });
    }

    pub fn direction(&self) -> Option<MediaDirection> {
        self.attributes().find_map(|(n, _)| MediaDirection::parse(n))
    }

    pub fn set_direction(&mut self, direction: MediaDirection) {
        self.remove_lines(|l| {
            l.as_attribute()
                .map(|(n, _)| MediaDirection::parse(n).is_some())
                .unwrap_or(false)
        });
        self.push_attribute(direction.as_str());
    }

    /// Ordered codec view: rtpmap when present, else the static table
    pub fn codecs(&self) -> Vec<SdpCodec> {
        self.formats()
            .into_iter()
            .filter_map(|pt| {
                let prefix = format!("{} ", pt);
                let mut codec = self
                    .attributes()
                    .filter(|(n, _)| n.eq_ignore_ascii_case("rtpmap"))
                    .filter_map(|(_, v)| v)
                    .find(|v| v.starts_with(&prefix))
                    .and_then(|v| parse_rtpmap(pt, &v[prefix.len()..]))
                    .or_else(|| SdpCodec::static_payload(pt))?;
                codec.fmtp = self
                    .attributes()
                    .filter(|(n, _)| n.eq_ignore_ascii_case("fmtp"))
                    .filter_map(|(_, v)| v)
                    .find(|v| v.starts_with(&prefix))
                    .map(|v| v[prefix.len()..].trim().to_string());
                Some(codec)
            })
            .collect()
    }

    pub fn ptime(&self) -> Option<u32> {
        self.attribute("ptime").and_then(|v| v.trim().parse().ok())
    }
}

fn parse_rtpmap(payload_type: u8, value: &str) -> Option<SdpCodec> {
    let mut parts = value.trim().split('/');
    let name = parts.next()?;
    let clock_rate = parts.next()?.parse().ok()?;
    let channels = parts.next().and_then(|c| c.parse().ok());
    Some(SdpCodec {
        payload_type,
        name: name.to_string(),
        clock_rate,
        channels,
        fmtp: None,
    })
}

fn parse_connection(value: &str) -> Option<IpAddr> {
    let mut parts = value.split_whitespace();
    let _net = parts.next()?;
    let _addr_type = parts.next()?;
    let address = parts.next()?;
    // Multicast TTL suffix
    address.split('/').next()?.parse().ok()
}

fn connection_value(ip: IpAddr) -> String {
    let addr_type = if ip.is_ipv4() { "IP4" } else { "IP6" };
    format!("IN {} {}", addr_type, ip)
}

/// SDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    session: Vec<SdpLine>,
    pub media: Vec<MediaSection>,
}

impl SdpSession {
    pub fn parse(input: &str) -> Result<Self, SdpError> {
        let mut session = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for raw in input.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            let mut chars = line.chars();
            let kind = chars.next().unwrap_or(' ');
            if !kind.is_ascii_lowercase() || chars.next() != Some('=') {
                return Err(SdpError::Malformed(format!("bad line {:?}", line)));
            }
            let line = SdpLine::new(kind, &line[2..]);

            if kind == 'm' {
                if line.value.split_whitespace().count() < 3 {
                    return Err(SdpError::Malformed(format!("bad media line {:?}", line.value)));
                }
                media.push(MediaSection { lines: vec![line] });
            } else if let Some(current) = media.last_mut() {
                current.lines.push(line);
            } else {
                session.push(line);
            }
        }

        match session.first() {
            Some(first) if first.kind == 'v' => {}
            _ => return Err(SdpError::Malformed("missing v= line".to_string())),
        }

        Ok(Self { session, media })
    }

    /// Single audio stream description used for offers and answers
    pub fn audio(
        address: IpAddr,
        session_id: u64,
        port: u16,
        codecs: &[SdpCodec],
        direction: MediaDirection,
    ) -> Self {
        let addr_type = if address.is_ipv4() { "IP4" } else { "IP6" };
        let session = vec![
            SdpLine::new('v', "0"),
            SdpLine::new('o', format!("pbx {} {} IN {} {}", session_id, session_id, addr_type, address)),
            SdpLine::new('s', "pbx"),
            SdpLine::new('c', connection_value(address)),
            SdpLine::new('t', "0 0"),
        ];

        let formats: Vec<u8> = codecs.iter().map(|c| c.payload_type).collect();
        let mut audio = MediaSection::new("audio", port, "RTP/AVP", &formats);
        for codec in codecs {
            audio.push_attribute(format!("rtpmap:{}", codec.rtpmap_value()));
            if let Some(fmtp) = &codec.fmtp {
                audio.push_attribute(format!("fmtp:{} {}", codec.payload_type, fmtp));
            }
        }
        audio.push_attribute("ptime:20");
        audio.push_attribute(direction.as_str());

        Self {
            session,
            media: vec![audio],
        }
    }

    pub fn session_lines(&self) -> &[SdpLine] {
        &self.session
    }

    pub fn session_attribute(&self, name: &str) -> Option<&str> {
        self.session
            .iter()
            .filter_map(SdpLine::as_attribute)
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v)
    }

    pub fn has_session_attribute(&self, name: &str) -> bool {
        self.session.iter().any(|l| l.is_attribute(name))
    }

    pub fn push_session_attribute(&mut self, value: impl Into<String>) {
        self.session.push(SdpLine::attribute(value));
    }

    pub fn remove_session_lines<F>(&mut self, predicate: F)
    where
        F: FnMut(&SdpLine) -> bool,
    {
        let mut predicate = predicate;
        self.session.retain(|l| !predicate(l));
    }

    /// Session-level connection address
    pub fn connection_address(&self) -> Option<IpAddr> {
        self.session
            .iter()
            .find(|l| l.kind == 'c')
            .and_then(|l| parse_connection(&l.value))
    }

    pub fn first_audio(&self) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.media_type() == "audio")
    }

    pub fn first_audio_mut(&mut self) -> Option<&mut MediaSection> {
        self.media.iter_mut().find(|m| m.media_type() == "audio")
    }

    /// Where the first audio stream should be sent
    pub fn audio_endpoint(&self) -> Option<std::net::SocketAddr> {
        let audio = self.first_audio()?;
        let ip = audio.connection_address().or_else(|| self.connection_address())?;
        Some(std::net::SocketAddr::new(ip, audio.port()))
    }

    /// Effective direction of the first audio stream (media, then session, then sendrecv)
    pub fn audio_direction(&self) -> MediaDirection {
        self.first_audio()
            .and_then(MediaSection::direction)
            .or_else(|| {
                self.session
                    .iter()
                    .filter_map(SdpLine::as_attribute)
                    .find_map(|(n, _)| MediaDirection::parse(n))
            })
            .unwrap_or(MediaDirection::SendRecv)
    }

    /// Point every connection line at `ip`
    pub fn set_connection_address(&mut self, ip: IpAddr) {
        let value = connection_value(ip);
        for line in self
            .session
            .iter_mut()
            .chain(self.media.iter_mut().flat_map(|m| m.lines.iter_mut()))
        {
            if line.kind == 'c' {
                line.value = value.clone();
            }
        }
    }

    /// Increment the o= session version for a re-offer
    pub fn bump_version(&mut self) {
        if let Some(origin) = self.session.iter_mut().find(|l| l.kind == 'o') {
            let mut fields: Vec<String> = origin.value.split_whitespace().map(str::to_string).collect();
            if let Some(version) = fields.get_mut(2) {
                if let Ok(v) = version.parse::<u64>() {
                    *version = (v + 1).to_string();
                    origin.value = fields.join(" ");
                }
            }
        }
    }

    pub fn build(&self) -> String {
        let mut out = String::new();
        for line in self
            .session
            .iter()
            .chain(self.media.iter().flat_map(|m| m.lines.iter()))
        {
            out.push_str(&line.to_string());
            out.push_str("\r\n");
        }
        out
    }
}

impl FromStr for SdpSession {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}
