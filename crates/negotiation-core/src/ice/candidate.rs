//! ICE candidate values
//!
//! Candidate grammar (RFC 8839):
//! `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> [raddr <addr>] [rport <port>] *(<key> <value>)`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A candidate as exchanged with the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// `candidate:...` attribute value, without the `a=` prefix
    pub content: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<usize>,
}

impl IceCandidate {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(mid.into());
        self
    }

    pub fn with_mline_index(mut self, index: usize) -> Self {
        self.sdp_mline_index = Some(index);
        self
    }

    /// The SDP attribute line (`a=candidate:...`)
    pub fn to_sdp_line(&self) -> String {
        format!("a={}", self.content)
    }

    /// Parse the candidate grammar out of `content`
    pub fn info(&self) -> Result<CandidateInfo> {
        self.content.parse()
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    /// Server reflexive
    Srflx,
    /// Peer reflexive
    Prflx,
    Relay,
}

impl CandidateType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Srflx => "srflx",
            Self::Prflx => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::Srflx),
            "prflx" => Ok(Self::Prflx),
            "relay" => Ok(Self::Relay),
            other => Err(Error::parse(format!("invalid candidate type: {}", other))),
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed candidate fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInfo {
    pub foundation: String,
    pub component: u32,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub extensions: Vec<(String, String)>,
}

impl CandidateInfo {
    /// Standard priority for a candidate of the given type and component
    pub fn compute_priority(candidate_type: CandidateType, local_preference: u16, component: u32) -> u32 {
        let type_preference: u32 = match candidate_type {
            CandidateType::Host => 126,
            CandidateType::Prflx => 110,
            CandidateType::Srflx => 100,
            CandidateType::Relay => 0,
        };
        (type_preference << 24) + ((local_preference as u32) << 8) + (256 - component.min(256))
    }
}

fn field<'a>(parts: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    parts
        .get(index)
        .copied()
        .ok_or_else(|| Error::parse(format!("candidate is missing {}", name)))
}

impl FromStr for CandidateInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim();
        let value = value.strip_prefix("a=").unwrap_or(value);
        let value = value
            .strip_prefix("candidate:")
            .ok_or_else(|| Error::parse(format!("not a candidate attribute: {}", value)))?;
        let parts: Vec<&str> = value.split_whitespace().collect();

        let foundation = field(&parts, 0, "foundation")?.to_string();
        let component = match field(&parts, 1, "component")?.parse::<u32>() {
            Ok(id) if (1..=256).contains(&id) => id,
            _ => return Err(Error::parse(format!("invalid component id in candidate: {}", parts[1]))),
        };
        let transport = field(&parts, 2, "transport")?.to_string();
        if !transport.eq_ignore_ascii_case("udp") && !transport.eq_ignore_ascii_case("tcp") {
            return Err(Error::parse(format!("invalid transport in candidate: {}", transport)));
        }
        let priority = field(&parts, 3, "priority")?
            .parse::<u32>()
            .map_err(|_| Error::parse(format!("invalid priority in candidate: {}", parts[3])))?;
        let address = field(&parts, 4, "address")?.to_string();
        let port = field(&parts, 5, "port")?
            .parse::<u16>()
            .map_err(|_| Error::parse(format!("invalid port in candidate: {}", parts[5])))?;
        if field(&parts, 6, "typ")? != "typ" {
            return Err(Error::parse(format!("expected 'typ' in candidate, found: {}", parts[6])));
        }
        let candidate_type = field(&parts, 7, "type")?.parse()?;

        let mut related_address = None;
        let mut related_port = None;
        let mut extensions = Vec::new();
        for pair in parts[8..].chunks(2) {
            let [key, value] = pair else {
                return Err(Error::parse(format!("candidate attribute '{}' has no value", pair[0])));
            };
            match *key {
                "raddr" => related_address = Some(value.to_string()),
                "rport" => {
                    related_port = Some(
                        value
                            .parse::<u16>()
                            .map_err(|_| Error::parse(format!("invalid related port in candidate: {}", value)))?,
                    )
                }
                _ => extensions.push((key.to_string(), value.to_string())),
            }
        }

        Ok(Self {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            candidate_type,
            related_address,
            related_port,
            extensions,
        })
    }
}

impl fmt::Display for CandidateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        )?;
        if let Some(address) = &self.related_address {
            write!(f, " raddr {}", address)?;
        }
        if let Some(port) = self.related_port {
            write!(f, " rport {}", port)?;
        }
        for (key, value) in &self.extensions {
            write!(f, " {} {}", key, value)?;
        }
        Ok(())
    }
}
