//! Error handling for the negotiation core
//!
//! Parse and negotiation failures are returned to the immediate caller.
//! Transport failures observed after initialization never come back through
//! a `Result`; they surface as a `Failed` connection-state notification.

use thiserror::Error;

/// Result type alias for negotiation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for every fallible operation in the crate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed SDP or candidate text
    #[error("SDP parse error: {details}")]
    Parse { details: String },

    /// Illegal state transition, glare or description type mismatch
    #[error("Negotiation error: {reason}")]
    Negotiation { reason: String },

    /// Failure reported by the transport during initialization
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Invalid ICE server list or unsupported semantics
    #[error("Configuration error: {details}")]
    Configuration { details: String },

    /// The peer connection has been closed
    #[error("Peer connection is closed")]
    Closed,

    /// No transceiver with this id is registered
    #[error("Unknown transceiver: {id}")]
    UnknownTransceiver { id: u32 },

    /// No data channel with this id is registered
    #[error("Unknown data channel: {id}")]
    UnknownDataChannel { id: u16 },

    /// Track cannot be attached to the transceiver
    #[error("Invalid track: {details}")]
    InvalidTrack { details: String },
}

impl Error {
    /// Create a new parse error
    pub fn parse(details: impl Into<String>) -> Self {
        Self::Parse {
            details: details.into(),
        }
    }

    /// Create a new negotiation error
    pub fn negotiation(reason: impl Into<String>) -> Self {
        Self::Negotiation {
            reason: reason.into(),
        }
    }

    /// Create a new transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration {
            details: details.into(),
        }
    }

    /// Create a new invalid track error
    pub fn invalid_track(details: impl Into<String>) -> Self {
        Self::InvalidTrack {
            details: details.into(),
        }
    }

    /// Whether the caller can retry after fixing its input or rolling back
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::Negotiation { .. }
                | Self::UnknownTransceiver { .. }
                | Self::UnknownDataChannel { .. }
                | Self::InvalidTrack { .. }
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(format!("invalid signaling envelope: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability_follows_taxonomy() {
        assert!(Error::parse("missing v=").is_recoverable());
        assert!(Error::negotiation("glare").is_recoverable());
        assert!(!Error::configuration("bad url").is_recoverable());
        assert!(!Error::transport("dtls").is_recoverable());
        assert!(!Error::Closed.is_recoverable());
    }

    #[test]
    fn display_includes_details() {
        let err = Error::negotiation("answer not valid in state new");
        assert_eq!(err.to_string(), "Negotiation error: answer not valid in state new");
    }
}
