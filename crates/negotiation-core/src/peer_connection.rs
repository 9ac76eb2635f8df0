//! Peer connection handle
//!
//! [`PeerConnection`] is a cheap, cloneable handle. Every operation is sent
//! to the negotiation task owning the connection state and awaits its reply,
//! so operations from different clones are applied one at a time in arrival
//! order.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PeerConnectionConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventKind, EventSubscriber, PeerObserver};
use crate::ice::{ConnectionState, IceCandidate, IceConnectionState, IceGatheringState};
use crate::media::{
    DataChannel, DataChannelId, Direction, LocalTrack, MediaKind, MediaSource, MediaSourceProvider,
    PassthroughMediaProvider, TransceiverId, TransceiverInfo, TransceiverInit,
};
use crate::negotiation::machine::{Command, NegotiationMachine};
use crate::negotiation::NegotiationState;
use crate::sdp::{SdpMessage, SdpType};
use crate::transport::{IceTransport, TransportEventSink};

/// Point-in-time view of a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub id: String,
    pub negotiation_state: NegotiationState,
    pub connection_state: ConnectionState,
    pub ice_connection_state: IceConnectionState,
    pub ice_gathering_state: IceGatheringState,
    pub local_description: Option<SdpMessage>,
    pub remote_description: Option<SdpMessage>,
    /// Local description with the gathered candidates merged in, once the
    /// current gathering pass is complete
    pub complete_local_description: Option<SdpMessage>,
    pub transceivers: Vec<TransceiverInfo>,
    pub data_channels: Vec<DataChannel>,
    pub renegotiation_needed: bool,
}

/// Builder for [`PeerConnection`]
pub struct PeerConnectionBuilder {
    config: PeerConnectionConfig,
    transport: Option<Arc<dyn IceTransport>>,
    provider: Arc<dyn MediaSourceProvider>,
}

impl PeerConnectionBuilder {
    pub fn new(config: PeerConnectionConfig) -> Self {
        Self {
            config,
            transport: None,
            provider: Arc::new(PassthroughMediaProvider),
        }
    }

    pub fn with_transport(mut self, transport: impl IceTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn with_shared_transport(mut self, transport: Arc<dyn IceTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_media_provider(mut self, provider: impl MediaSourceProvider + 'static) -> Self {
        self.provider = Arc::new(provider);
        self
    }

    /// Validate the configuration, initialize the transport and start the
    /// negotiation task
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<PeerConnection> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| Error::configuration("an ICE transport is required"))?;

        let id = Uuid::new_v4().to_string();
        let events = EventDispatcher::new();
        let (commands, receiver) = mpsc::unbounded_channel();

        transport
            .initialize(&self.config, TransportEventSink::new(commands.downgrade()))
            .await?;

        let machine = NegotiationMachine::new(
            id.clone(),
            &self.config,
            transport,
            commands.downgrade(),
            events.clone(),
        );
        tokio::spawn(machine.run(receiver, self.provider.clone()));

        info!(
            "Peer connection {} created ({:?}, {} ICE servers)",
            id,
            self.config.sdp_semantics,
            self.config.ice_servers.len()
        );

        Ok(PeerConnection {
            inner: Arc::new(Inner {
                id,
                config: self.config,
                commands,
                events,
                provider: self.provider,
            }),
        })
    }
}

struct Inner {
    id: String,
    config: PeerConnectionConfig,
    commands: mpsc::UnboundedSender<Command>,
    events: EventDispatcher,
    provider: Arc<dyn MediaSourceProvider>,
}

/// Handle to one WebRTC peer connection
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl PeerConnection {
    pub fn builder(config: PeerConnectionConfig) -> PeerConnectionBuilder {
        PeerConnectionBuilder::new(config)
    }

    /// Peer connection with the default media provider
    pub async fn new(config: PeerConnectionConfig, transport: impl IceTransport + 'static) -> Result<Self> {
        Self::builder(config).with_transport(transport).build().await
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &PeerConnectionConfig {
        &self.inner.config
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(command(reply))
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)?
    }

    // ---- offer/answer ----

    /// Create a local offer; resolves once the transport rendered it
    pub async fn create_offer(&self) -> Result<SdpMessage> {
        self.request(|reply| Command::CreateOffer { reply }).await
    }

    /// Create the answer to the applied remote offer
    pub async fn create_answer(&self) -> Result<SdpMessage> {
        self.request(|reply| Command::CreateAnswer { reply }).await
    }

    /// Apply a remote offer or answer
    pub async fn set_remote_description(&self, message: SdpMessage) -> Result<()> {
        self.request(|reply| Command::SetRemoteDescription { message, reply })
            .await
    }

    /// Decode and apply remote description text
    ///
    /// Accepts the escaped `\r\n` placeholder typed into single-line consoles.
    pub async fn set_remote_description_text(&self, kind: SdpType, text: &str) -> Result<()> {
        let message = SdpMessage::decode(kind, text)?;
        self.set_remote_description(message).await
    }

    /// Undo the outstanding local or remote offer
    pub async fn rollback(&self) -> Result<()> {
        self.request(|reply| Command::Rollback { reply }).await
    }

    /// Forward a candidate received from the remote peer
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.request(|reply| Command::AddIceCandidate { candidate, reply })
            .await
    }

    // ---- transceivers and tracks ----

    /// Add a send-receive transceiver without a track
    pub async fn add_transceiver(&self, kind: MediaKind) -> Result<TransceiverInfo> {
        self.add_transceiver_with(kind, TransceiverInit::default()).await
    }

    pub async fn add_transceiver_with(&self, kind: MediaKind, init: TransceiverInit) -> Result<TransceiverInfo> {
        self.request(|reply| Command::AddTransceiver { kind, init, reply })
            .await
    }

    /// Turn a caller source into a local track through the media provider
    pub async fn create_local_track(&self, source: Arc<dyn MediaSource>, name: &str) -> Result<Arc<LocalTrack>> {
        self.inner.provider.attach(source, name).await
    }

    /// Create a track from `source` and send it on a new send-receive transceiver
    pub async fn add_track(&self, source: Arc<dyn MediaSource>, name: &str) -> Result<TransceiverInfo> {
        let track = self.create_local_track(source, name).await?;
        let init = TransceiverInit::new(Direction::SendReceive).with_track(track.clone());
        match self.add_transceiver_with(track.kind(), init).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.inner.provider.release(track).await;
                Err(e)
            }
        }
    }

    /// Send `track` on a transceiver, replacing (and releasing) the previous one
    pub async fn attach_local_track(&self, id: TransceiverId, track: Arc<LocalTrack>) -> Result<()> {
        let previous = self
            .request(|reply| Command::AttachLocalTrack {
                id,
                track: Some(track),
                reply,
            })
            .await?;
        self.release(previous).await;
        Ok(())
    }

    /// Stop sending on a transceiver and release its track
    pub async fn detach_local_track(&self, id: TransceiverId) -> Result<()> {
        let previous = self
            .request(|reply| Command::AttachLocalTrack { id, track: None, reply })
            .await?;
        self.release(previous).await;
        Ok(())
    }

    async fn release(&self, track: Option<Arc<LocalTrack>>) {
        if let Some(track) = track {
            debug!("Peer connection {} releasing track '{}'", self.inner.id, track.name());
            self.inner.provider.release(track).await;
        }
    }

    pub async fn set_direction(&self, id: TransceiverId, direction: Direction) -> Result<()> {
        self.request(|reply| Command::SetDirection { id, direction, reply })
            .await
    }

    pub async fn add_data_channel(&self, label: &str, ordered: bool, reliable: bool) -> Result<DataChannel> {
        let label = label.to_string();
        self.request(|reply| Command::AddDataChannel {
            label,
            ordered,
            reliable,
            reply,
        })
        .await
    }

    pub async fn remove_data_channel(&self, id: DataChannelId) -> Result<DataChannel> {
        self.request(|reply| Command::RemoveDataChannel { id, reply })
            .await
    }

    // ---- state ----

    pub async fn snapshot(&self) -> Result<PeerSnapshot> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Snapshot { reply })
            .map_err(|_| Error::Closed)?;
        response.await.map_err(|_| Error::Closed)
    }

    pub async fn negotiation_state(&self) -> Result<NegotiationState> {
        Ok(self.snapshot().await?.negotiation_state)
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        Ok(self.snapshot().await?.connection_state)
    }

    pub async fn ice_connection_state(&self) -> Result<IceConnectionState> {
        Ok(self.snapshot().await?.ice_connection_state)
    }

    pub async fn ice_gathering_state(&self) -> Result<IceGatheringState> {
        Ok(self.snapshot().await?.ice_gathering_state)
    }

    pub async fn local_description(&self) -> Result<Option<SdpMessage>> {
        Ok(self.snapshot().await?.local_description)
    }

    pub async fn remote_description(&self) -> Result<Option<SdpMessage>> {
        Ok(self.snapshot().await?.remote_description)
    }

    /// Local description plus gathered candidates and end-of-candidates
    pub async fn complete_local_description(&self) -> Result<Option<SdpMessage>> {
        Ok(self.snapshot().await?.complete_local_description)
    }

    pub async fn transceivers(&self) -> Result<Vec<TransceiverInfo>> {
        Ok(self.snapshot().await?.transceivers)
    }

    pub async fn transceiver(&self, id: TransceiverId) -> Result<TransceiverInfo> {
        self.transceivers()
            .await?
            .into_iter()
            .find(|info| info.id == id)
            .ok_or(Error::UnknownTransceiver { id: id.0 })
    }

    pub async fn data_channels(&self) -> Result<Vec<DataChannel>> {
        Ok(self.snapshot().await?.data_channels)
    }

    // ---- events ----

    /// Register an observer for one kind of event
    pub fn register(&self, kind: EventKind, observer: Arc<dyn PeerObserver>) {
        self.inner.events.register(kind, observer);
    }

    /// Register an observer for every event
    pub fn register_all(&self, observer: Arc<dyn PeerObserver>) {
        self.inner.events.register_all(observer);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.inner.events.subscribe()
    }

    // ---- lifecycle ----

    /// Close the connection
    ///
    /// Idempotent. A pending offer, answer or remote description fails with
    /// [`Error::Closed`], attached tracks are released and every event up to
    /// and including `Closed` has been delivered when this returns. Must not
    /// be awaited from inside an observer.
    pub async fn close(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        if self.inner.commands.send(Command::Close { reply }).is_err() {
            return Ok(());
        }
        let tracks = response.await.unwrap_or_default();
        for track in tracks {
            self.inner.provider.release(track).await;
        }
        self.inner.events.flush().await;
        Ok(())
    }
}
