//! ICE transport seam
//!
//! The negotiation core never touches sockets. Everything below the
//! offer/answer exchange (rendering descriptions, candidate gathering,
//! connectivity checks, data channel transport) lives behind
//! [`IceTransport`]. The transport reports what happens through a
//! [`TransportEventSink`] handed to it at initialization.

pub mod simulated;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::PeerConnectionConfig;
use crate::error::Result;
use crate::ice::{IceCandidate, IceConnectionState, IceGatheringState};
use crate::media::{DataChannel, DataChannelId, NegotiationPlan};
use crate::negotiation::machine::Command;
use crate::sdp::SdpMessage;

pub use simulated::SimulatedTransport;

/// Notification pushed by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    GatheringStateChanged(IceGatheringState),
    IceConnectionStateChanged(IceConnectionState),
    /// The remote peer opened a data channel
    DataChannelOpened(DataChannel),
    DataChannelClosed(DataChannelId),
    /// ICE or DTLS failed
    Failed { reason: String },
}

/// Channel from a transport back into its peer connection
///
/// The sink does not keep the peer connection alive; once it is gone every
/// send is silently dropped.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl TransportEventSink {
    pub(crate) fn new(commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Push an event; returns `false` if the peer connection is gone
    pub fn send(&self, event: TransportEvent) -> bool {
        let Some(commands) = self.commands.upgrade() else {
            trace!("Peer connection gone, dropping {:?}", event);
            return false;
        };
        commands.send(Command::Transport(event)).is_ok()
    }

    pub fn candidate(&self, candidate: IceCandidate) -> bool {
        self.send(TransportEvent::LocalCandidate(candidate))
    }

    pub fn gathering_state(&self, state: IceGatheringState) -> bool {
        self.send(TransportEvent::GatheringStateChanged(state))
    }

    pub fn ice_connection_state(&self, state: IceConnectionState) -> bool {
        self.send(TransportEvent::IceConnectionStateChanged(state))
    }

    pub fn data_channel_opened(&self, channel: DataChannel) -> bool {
        self.send(TransportEvent::DataChannelOpened(channel))
    }

    pub fn data_channel_closed(&self, id: DataChannelId) -> bool {
        self.send(TransportEvent::DataChannelClosed(id))
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.send(TransportEvent::Failed { reason: reason.into() })
    }
}

/// ICE/DTLS transport driven by a peer connection
#[async_trait]
pub trait IceTransport: Send + Sync {
    /// Called once before any other method
    async fn initialize(&self, config: &PeerConnectionConfig, events: TransportEventSink) -> Result<()>;

    /// Render the SDP text for a planned offer or answer
    async fn generate_local_description(&self, plan: &NegotiationPlan) -> Result<String>;

    /// Apply a remote offer or answer
    async fn apply_remote_description(&self, description: &SdpMessage) -> Result<()>;

    /// Start a gathering pass for the local description generated last
    async fn start_gathering(&self) -> Result<()>;

    /// Add a candidate received from the remote peer
    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Discard the description applied or generated last
    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    /// Release every resource; no events are expected afterwards
    async fn close(&self) -> Result<()>;
}
