//! ICE candidates, gathering and connectivity states

pub mod aggregator;
pub mod candidate;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use aggregator::{CandidateBundle, IceCandidateAggregator};
pub use candidate::{CandidateInfo, CandidateType, IceCandidate};

/// Local candidate gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    /// Nothing gathered yet
    New,

    /// Gathering in progress
    Gathering,

    /// All candidates of the current pass gathered
    Complete,
}

impl fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Gathering => write!(f, "gathering"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Connectivity state reported by the ICE transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Checking => write!(f, "checking"),
            Self::Connected => write!(f, "connected"),
            Self::Completed => write!(f, "completed"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Aggregate connection state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Connection state implied by an ICE connection state
    pub fn from_ice(state: IceConnectionState) -> Self {
        match state {
            IceConnectionState::New => Self::New,
            IceConnectionState::Checking => Self::Connecting,
            IceConnectionState::Connected | IceConnectionState::Completed => Self::Connected,
            IceConnectionState::Disconnected => Self::Disconnected,
            IceConnectionState::Failed => Self::Failed,
            IceConnectionState::Closed => Self::Closed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_counts_as_connected() {
        assert_eq!(ConnectionState::from_ice(IceConnectionState::Completed), ConnectionState::Connected);
        assert_eq!(ConnectionState::from_ice(IceConnectionState::Checking), ConnectionState::Connecting);
        assert_eq!(ConnectionState::from_ice(IceConnectionState::Failed).to_string(), "failed");
    }
}
