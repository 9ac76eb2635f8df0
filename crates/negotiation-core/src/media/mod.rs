//! Transceivers, tracks and data channels

pub mod plan;
pub mod registry;
pub mod track;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use plan::{NegotiationPlan, PlannedSection, SectionKind};
pub use registry::{
    DataChannel, DataChannelId, Origin, RegistryChange, TransceiverId, TransceiverInfo, TransceiverInit,
    TransceiverRegistry,
};
pub use track::{LocalTrack, MediaSource, MediaSourceProvider, PassthroughMediaProvider, RemoteTrack};

/// Kind of media carried by a transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Media name used on the `m=` line
    pub fn as_sdp(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn from_sdp(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sdp())
    }
}

/// Media direction of a transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    SendReceive,
    SendOnly,
    ReceiveOnly,
    Inactive,
}

impl Direction {
    /// Attribute name (`sendrecv`, `sendonly`, `recvonly`, `inactive`)
    pub fn as_sdp(self) -> &'static str {
        match self {
            Self::SendReceive => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::ReceiveOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    pub fn from_sdp(attribute: &str) -> Option<Self> {
        match attribute {
            "sendrecv" => Some(Self::SendReceive),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::ReceiveOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    pub fn from_flags(send: bool, receive: bool) -> Self {
        match (send, receive) {
            (true, true) => Self::SendReceive,
            (true, false) => Self::SendOnly,
            (false, true) => Self::ReceiveOnly,
            (false, false) => Self::Inactive,
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, Self::SendReceive | Self::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Self::SendReceive | Self::ReceiveOnly)
    }

    /// The direction as seen from the other peer
    pub fn reverse(self) -> Self {
        Self::from_flags(self.receives(), self.sends())
    }

    /// Direction an answerer uses given its own preference and the offered direction
    pub fn answer_to(self, offered: Direction) -> Self {
        Self::from_flags(
            self.sends() && offered.receives(),
            self.receives() && offered.sends(),
        )
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::SendReceive
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sdp())
    }
}
