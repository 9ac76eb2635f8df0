//! SDP codec
//!
//! Converts session-description text into [`SdpMessage`] values and back.
//! Decoding accepts CRLF, bare LF and the escaped `\r\n` placeholder used by
//! single-line operator consoles; encoding always produces CRLF.

pub mod description;
pub mod parser;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use description::{MediaSection, Origin, SdpLine, SessionDescription};
pub use parser::{escape_line_breaks, parse_session_description, unescape_line_breaks};

use crate::error::{Error, Result};

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

/// JSON envelope browsers exchange: `{"type":"offer","sdp":"..."}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignalingEnvelope {
    #[serde(rename = "type")]
    kind: SdpType,
    sdp: String,
}

/// An immutable offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SignalingEnvelope", into = "SignalingEnvelope")]
pub struct SdpMessage {
    kind: SdpType,
    description: SessionDescription,
}

impl SdpMessage {
    pub fn new(kind: SdpType, description: SessionDescription) -> Self {
        Self { kind, description }
    }

    /// Parse description text of the given type
    pub fn decode(kind: SdpType, text: &str) -> Result<Self> {
        let description = parse_session_description(text)?;
        Ok(Self { kind, description })
    }

    /// Render as CRLF-separated text
    pub fn encode(&self) -> String {
        self.description.to_sdp_string()
    }

    /// Offer or answer
    pub fn kind(&self) -> SdpType {
        self.kind
    }

    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    pub fn into_description(self) -> SessionDescription {
        self.description
    }

    /// Encode as the JSON signaling envelope
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON signaling envelope
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl TryFrom<SignalingEnvelope> for SdpMessage {
    type Error = Error;

    fn try_from(envelope: SignalingEnvelope) -> Result<Self> {
        Self::decode(envelope.kind, &envelope.sdp)
    }
}

impl From<SdpMessage> for SignalingEnvelope {
    fn from(message: SdpMessage) -> Self {
        SignalingEnvelope {
            kind: message.kind,
            sdp: message.encode(),
        }
    }
}

impl fmt::Display for SdpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
