//! WebRTC offer/answer negotiation core
//!
//! Drives the signaling side of a single WebRTC peer connection: SDP offer
//! and answer exchange, ICE candidate aggregation, transceiver and data
//! channel bookkeeping, and ordered delivery of state-change events. Media,
//! DTLS/SRTP and the ICE agent itself sit behind the [`IceTransport`] trait.
//!
//! ```rust,no_run
//! use peerlink_negotiation_core::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let config = PeerConnectionConfig::new()
//!     .with_ice_server("stun:stun.l.google.com:19302")
//!     .with_sdp_semantics(SdpSemantics::PlanB);
//! let peer = PeerConnection::new(config, SimulatedTransport::new()).await?;
//!
//! peer.add_data_channel("channel1", true, true).await?;
//! peer.add_transceiver(MediaKind::Audio).await?;
//!
//! let offer = peer.create_offer().await?;
//! println!("{}", offer.to_json()?);
//! # Ok(())
//! # }
//! ```

// Error handling
pub mod error;

// Configuration and logging
pub mod config;
pub mod logging;

// SDP codec
pub mod sdp;

// ICE candidates and states
pub mod ice;

// Transceivers, tracks and data channels
pub mod media;

// Offer/answer state machine
pub mod negotiation;

// Event fan-out
pub mod events;

// Transport seam
pub mod transport;

// Public handle
pub mod peer_connection;

// Public exports
pub use config::{GlarePolicy, IceServerConfig, PeerConnectionConfig, SdpSemantics};
pub use error::{Error, Result};
pub use events::{observer_fn, EventDispatcher, EventKind, EventSubscriber, PeerEvent, PeerObserver};
pub use ice::{
    CandidateBundle, CandidateInfo, ConnectionState, IceCandidate, IceCandidateAggregator, IceConnectionState,
    IceGatheringState,
};
pub use logging::{setup_logging, LoggingConfig};
pub use media::{
    DataChannel, DataChannelId, Direction, LocalTrack, MediaKind, MediaSource, MediaSourceProvider,
    NegotiationPlan, PassthroughMediaProvider, RemoteTrack, TransceiverId, TransceiverInfo, TransceiverInit,
};
pub use negotiation::NegotiationState;
pub use peer_connection::{PeerConnection, PeerConnectionBuilder, PeerSnapshot};
pub use sdp::{SdpMessage, SdpType, SessionDescription};
pub use transport::{IceTransport, SimulatedTransport, TransportEvent, TransportEventSink};

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        observer_fn, ConnectionState, DataChannel, Direction, Error, EventKind, GlarePolicy, IceCandidate,
        IceConnectionState, IceGatheringState, IceServerConfig, IceTransport, LocalTrack, MediaKind, MediaSource,
        NegotiationState, PeerConnection, PeerConnectionConfig, PeerEvent, PeerObserver, Result, SdpMessage,
        SdpSemantics, SdpType, SimulatedTransport, TransceiverId, TransceiverInit,
    };
}

/// Protocol constants
pub mod constants {
    /// Default port for STUN and TURN servers
    pub const DEFAULT_STUN_PORT: u16 = 3478;

    /// Default port for STUNS and TURNS servers
    pub const DEFAULT_TURNS_PORT: u16 = 5349;

    /// Attribute closing a trickled candidate list
    pub const END_OF_CANDIDATES: &str = "end-of-candidates";
}
