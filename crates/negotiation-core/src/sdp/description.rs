//! Structured session description
//!
//! Keeps just enough structure for negotiation (origin, media sections,
//! directions, mids, msids and candidates) and stores every other line
//! verbatim so that rendering a parsed description reproduces it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::parser::MediaLine;
use crate::media::{Direction, MediaKind};

/// A single `<type>=<value>` line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SdpLine {
    pub key: char,
    pub value: String,
}

impl SdpLine {
    pub fn new(key: char, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    /// `a=<value>` line
    pub fn attribute(value: impl Into<String>) -> Self {
        Self::new('a', value)
    }

    /// Attribute name, the part before the first `:` of an `a=` line
    pub fn attribute_name(&self) -> Option<&str> {
        if self.key != 'a' {
            return None;
        }
        Some(self.value.split_once(':').map_or(self.value.as_str(), |(name, _)| name))
    }

    /// Attribute value, the part after the first `:` of an `a=` line
    pub fn attribute_value(&self) -> Option<&str> {
        if self.key != 'a' {
            return None;
        }
        self.value.split_once(':').map(|(_, value)| value)
    }
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The `o=` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: u64,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Origin {
    /// Anonymous origin as generated by browsers
    pub fn anonymous(session_id: impl Into<String>, session_version: u64) -> Self {
        Self {
            username: "-".to_string(),
            session_id: session_id.into(),
            session_version,
            net_type: "IN".to_string(),
            addr_type: "IP4".to_string(),
            address: "127.0.0.1".to_string(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.username, self.session_id, self.session_version, self.net_type, self.addr_type, self.address
        )
    }
}

/// One `m=` section and the lines that follow it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSection {
    pub media: String,
    pub port: u16,
    pub port_count: Option<u16>,
    pub protocol: String,
    pub formats: Vec<String>,
    pub lines: Vec<SdpLine>,
}

impl MediaSection {
    pub(crate) fn from_media_line(line: &MediaLine<'_>) -> Self {
        Self {
            media: line.media.to_string(),
            port: line.port,
            port_count: line.port_count,
            protocol: line.protocol.to_string(),
            formats: line.formats.iter().map(|f| f.to_string()).collect(),
            lines: Vec::new(),
        }
    }

    /// Section without any attribute lines
    pub fn new(media: impl Into<String>, port: u16, protocol: impl Into<String>, formats: Vec<String>) -> Self {
        Self {
            media: media.into(),
            port,
            port_count: None,
            protocol: protocol.into(),
            formats,
            lines: Vec::new(),
        }
    }

    /// Audio or video kind, `None` for application and unknown sections
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_sdp(&self.media)
    }

    /// Whether this section carries SCTP data channels
    pub fn is_application(&self) -> bool {
        self.media == "application"
    }

    /// A zero port marks a rejected section
    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }

    /// `a=` lines with the given attribute name
    pub fn attributes(&self, name: &str) -> Vec<&SdpLine> {
        self.lines
            .iter()
            .filter(|line| line.attribute_name() == Some(name))
            .collect()
    }

    fn find_attribute(&self, name: &str) -> Option<&SdpLine> {
        self.lines.iter().find(|line| line.attribute_name() == Some(name))
    }

    /// Value of the first attribute with this name (empty for flags)
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.find_attribute(name)
            .map(|line| line.attribute_value().unwrap_or(""))
    }

    /// Whether a flag or valued attribute with this name is present
    pub fn has_attribute(&self, name: &str) -> bool {
        self.find_attribute(name).is_some()
    }

    /// Append an attribute line
    pub fn push_attribute(&mut self, value: impl Into<String>) {
        self.lines.push(SdpLine::attribute(value));
    }

    /// Media direction, `sendrecv` when no direction attribute is present
    pub fn direction(&self) -> Direction {
        self.lines
            .iter()
            .filter(|line| line.key == 'a')
            .find_map(|line| Direction::from_sdp(&line.value))
            .unwrap_or(Direction::SendReceive)
    }

    /// Replace (or add) the direction attribute
    pub fn set_direction(&mut self, direction: Direction) {
        self.lines
            .retain(|line| !(line.key == 'a' && Direction::from_sdp(&line.value).is_some()));
        self.push_attribute(direction.as_sdp());
    }

    /// `a=mid:` value
    pub fn mid(&self) -> Option<&str> {
        self.attribute("mid")
    }

    /// `a=msid:<stream> <track>` split into stream and track ids
    pub fn msid(&self) -> Option<(&str, Option<&str>)> {
        let value = self.attribute("msid")?;
        let mut parts = value.split_whitespace();
        let stream = parts.next()?;
        Some((stream, parts.next()))
    }

    /// `candidate:` values of the `a=candidate` lines
    pub fn candidates(&self) -> Vec<&str> {
        self.attributes("candidate")
            .into_iter()
            .map(|line| line.value.as_str())
            .collect()
    }

    /// Whether the section is marked with `a=end-of-candidates`
    pub fn end_of_candidates(&self) -> bool {
        self.has_attribute(crate::constants::END_OF_CANDIDATES)
    }

    fn write_to(&self, out: &mut String) {
        out.push_str("m=");
        out.push_str(&self.media);
        out.push(' ');
        out.push_str(&self.port.to_string());
        if let Some(count) = self.port_count {
            out.push('/');
            out.push_str(&count.to_string());
        }
        out.push(' ');
        out.push_str(&self.protocol);
        for format in &self.formats {
            out.push(' ');
            out.push_str(format);
        }
        out.push_str("\r\n");

        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push_str("\r\n");
        }
    }
}

/// A parsed session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub version: u8,
    pub origin: Origin,
    pub session_name: String,
    /// Session-level lines other than `v=`, `o=` and `s=`, in order
    pub session_lines: Vec<SdpLine>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    /// Description with the mandatory session lines and no media
    pub fn new(origin: Origin) -> Self {
        Self {
            version: 0,
            origin,
            session_name: "-".to_string(),
            session_lines: vec![SdpLine::new('t', "0 0")],
            media: Vec::new(),
        }
    }

    /// Render as CRLF-separated text with a trailing CRLF
    pub fn to_sdp_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("v={}\r\n", self.version));
        out.push_str(&format!("o={}\r\n", self.origin));
        out.push_str(&format!("s={}\r\n", self.session_name));
        for line in &self.session_lines {
            out.push_str(&line.to_string());
            out.push_str("\r\n");
        }
        for section in &self.media {
            section.write_to(&mut out);
        }
        out
    }

    /// Section at the given m-line index
    pub fn section(&self, mline_index: usize) -> Option<&MediaSection> {
        self.media.get(mline_index)
    }

    /// Index of the section with the given mid
    pub fn find_mid(&self, mid: &str) -> Option<usize> {
        self.media.iter().position(|section| section.mid() == Some(mid))
    }

    /// mids listed in the `a=group:BUNDLE` line
    pub fn bundle_mids(&self) -> Vec<&str> {
        self.session_lines
            .iter()
            .find(|line| line.attribute_name() == Some("group"))
            .and_then(|line| line.attribute_value())
            .and_then(|value| value.strip_prefix("BUNDLE"))
            .map(|mids| mids.split_whitespace().collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sdp_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdp::parser::parse_session_description;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=msid:stream-a track-a\r\n\
a=candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host\r\n\
a=end-of-candidates\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:1\r\n\
a=sctp-port:5000\r\n";

    #[test]
    fn accessors() {
        let description = parse_session_description(OFFER).unwrap();
        let audio = &description.media[0];
        assert_eq!(audio.kind(), Some(MediaKind::Audio));
        assert_eq!(audio.direction(), Direction::SendOnly);
        assert_eq!(audio.mid(), Some("0"));
        assert_eq!(audio.msid(), Some(("stream-a", Some("track-a"))));
        assert_eq!(audio.candidates().len(), 1);
        assert!(audio.end_of_candidates());

        let app = &description.media[1];
        assert!(app.is_application());
        assert_eq!(app.kind(), None);
        assert_eq!(app.direction(), Direction::SendReceive);
        assert_eq!(app.attribute("sctp-port"), Some("5000"));

        assert_eq!(description.bundle_mids(), vec!["0", "1"]);
        assert_eq!(description.find_mid("1"), Some(1));
    }

    #[test]
    fn renders_identically() {
        let description = parse_session_description(OFFER).unwrap();
        assert_eq!(description.to_sdp_string(), OFFER);
    }

    #[test]
    fn set_direction_replaces_existing_attribute() {
        let mut description = parse_session_description(OFFER).unwrap();
        description.media[0].set_direction(Direction::Inactive);
        assert_eq!(description.media[0].direction(), Direction::Inactive);
        assert_eq!(description.media[0].attributes("sendonly").len(), 0);
    }
}
