//! Negotiation actor
//!
//! One task owns all mutable state of a peer connection and consumes a
//! command queue: caller operations, transport notifications and the results
//! of transport calls. Description generation and remote application run on
//! spawned tasks so that `close` can overtake them. Their results carry a
//! ticket; a result whose ticket no longer matches the pending operation is
//! discarded.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::state::{next_state, NegotiationState, NegotiationStep};
use crate::config::{GlarePolicy, PeerConnectionConfig};
use crate::constants::END_OF_CANDIDATES;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, PeerEvent};
use crate::ice::{ConnectionState, IceCandidate, IceCandidateAggregator, IceConnectionState, IceGatheringState};
use crate::media::{
    DataChannel, DataChannelId, Direction, LocalTrack, MediaKind, MediaSourceProvider, NegotiationPlan, TransceiverId,
    TransceiverInfo, TransceiverInit, TransceiverRegistry,
};
use crate::peer_connection::PeerSnapshot;
use crate::sdp::{SdpMessage, SdpType};
use crate::transport::{IceTransport, TransportEvent};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Message consumed by the actor
pub(crate) enum Command {
    CreateOffer {
        reply: Reply<SdpMessage>,
    },
    CreateAnswer {
        reply: Reply<SdpMessage>,
    },
    SetRemoteDescription {
        message: SdpMessage,
        reply: Reply<()>,
    },
    Rollback {
        reply: Reply<()>,
    },
    AddIceCandidate {
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    AddTransceiver {
        kind: MediaKind,
        init: TransceiverInit,
        reply: Reply<TransceiverInfo>,
    },
    AttachLocalTrack {
        id: TransceiverId,
        track: Option<Arc<LocalTrack>>,
        reply: Reply<Option<Arc<LocalTrack>>>,
    },
    SetDirection {
        id: TransceiverId,
        direction: Direction,
        reply: Reply<()>,
    },
    AddDataChannel {
        label: String,
        ordered: bool,
        reliable: bool,
        reply: Reply<DataChannel>,
    },
    RemoveDataChannel {
        id: DataChannelId,
        reply: Reply<DataChannel>,
    },
    Snapshot {
        reply: oneshot::Sender<PeerSnapshot>,
    },
    /// Replies with the local tracks that are no longer in use
    Close {
        reply: oneshot::Sender<Vec<Arc<LocalTrack>>>,
    },
    Transport(TransportEvent),
    DescriptionGenerated {
        ticket: u64,
        result: Result<String>,
    },
    RemoteApplied {
        ticket: u64,
        result: Result<()>,
    },
}

/// Asynchronous operation waiting for the transport
enum PendingOperation {
    LocalDescription {
        ticket: u64,
        kind: SdpType,
        reply: Reply<SdpMessage>,
    },
    RemoteDescription {
        ticket: u64,
        message: SdpMessage,
        reply: Reply<()>,
    },
}

impl PendingOperation {
    fn fail(self, error: Error) {
        match self {
            Self::LocalDescription { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::RemoteDescription { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

pub(crate) struct NegotiationMachine {
    id: String,
    glare_policy: GlarePolicy,
    transport: Arc<dyn IceTransport>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: EventDispatcher,
    registry: TransceiverRegistry,
    aggregator: IceCandidateAggregator,
    state: NegotiationState,
    last_stable: NegotiationState,
    connection_state: ConnectionState,
    ice_connection_state: IceConnectionState,
    gathering_state: IceGatheringState,
    local_description: Option<SdpMessage>,
    remote_description: Option<SdpMessage>,
    /// Descriptions to restore on rollback
    backup: Option<(Option<SdpMessage>, Option<SdpMessage>)>,
    pending: Option<PendingOperation>,
    next_ticket: u64,
    renegotiation_needed: bool,
    closed: bool,
}

impl NegotiationMachine {
    pub(crate) fn new(
        id: String,
        config: &PeerConnectionConfig,
        transport: Arc<dyn IceTransport>,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: EventDispatcher,
    ) -> Self {
        Self {
            id,
            glare_policy: config.glare_policy,
            transport,
            commands,
            events,
            registry: TransceiverRegistry::new(config.sdp_semantics),
            aggregator: IceCandidateAggregator::new(),
            state: NegotiationState::New,
            last_stable: NegotiationState::New,
            connection_state: ConnectionState::New,
            ice_connection_state: IceConnectionState::New,
            gathering_state: IceGatheringState::New,
            local_description: None,
            remote_description: None,
            backup: None,
            pending: None,
            next_ticket: 0,
            renegotiation_needed: false,
            closed: false,
        }
    }

    /// Consume commands until every handle is gone; tracks still attached
    /// then are handed back to `provider`
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        provider: Arc<dyn MediaSourceProvider>,
    ) {
        debug!("Peer connection {} actor started", self.id);
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        if !self.closed {
            debug!("Peer connection {} dropped without close", self.id);
            for track in self.close().await {
                provider.release(track).await;
            }
        }
        debug!("Peer connection {} actor finished", self.id);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::CreateOffer { reply } => self.create_description(SdpType::Offer, reply),
            Command::CreateAnswer { reply } => self.create_description(SdpType::Answer, reply),
            Command::SetRemoteDescription { message, reply } => self.set_remote_description(message, reply).await,
            Command::Rollback { reply } => {
                let result = self.rollback().await;
                let _ = reply.send(result);
            }
            Command::AddIceCandidate { candidate, reply } => {
                let result = self.add_ice_candidate(candidate).await;
                let _ = reply.send(result);
            }
            Command::AddTransceiver { kind, init, reply } => {
                let _ = reply.send(self.add_transceiver(kind, init));
            }
            Command::AttachLocalTrack { id, track, reply } => {
                let _ = reply.send(self.attach_local_track(id, track));
            }
            Command::SetDirection { id, direction, reply } => {
                let _ = reply.send(self.set_direction(id, direction));
            }
            Command::AddDataChannel {
                label,
                ordered,
                reliable,
                reply,
            } => {
                let _ = reply.send(self.add_data_channel(label, ordered, reliable));
            }
            Command::RemoveDataChannel { id, reply } => {
                let _ = reply.send(self.remove_data_channel(id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Close { reply } => {
                let tracks = self.close().await;
                let _ = reply.send(tracks);
            }
            Command::Transport(event) => self.on_transport_event(event),
            Command::DescriptionGenerated { ticket, result } => self.on_description_generated(ticket, result).await,
            Command::RemoteApplied { ticket, result } => self.on_remote_applied(ticket, result).await,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::negotiation("another negotiation operation is in progress"));
        }
        Ok(())
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn dispatch(&self, events: Vec<PeerEvent>) {
        self.events.dispatch(events);
    }

    /// `RenegotiationNeeded` if local changes require a new round and the
    /// notification has not been raised since the last offer
    fn renegotiation_event(&mut self) -> Option<PeerEvent> {
        if self.closed
            || self.state != NegotiationState::Stable
            || self.pending.is_some()
            || self.renegotiation_needed
            || !self.registry.needs_negotiation()
        {
            return None;
        }
        debug!("Peer connection {} needs renegotiation", self.id);
        self.renegotiation_needed = true;
        Some(PeerEvent::RenegotiationNeeded)
    }

    fn set_state(&mut self, new: NegotiationState, events: &mut Vec<PeerEvent>) {
        let old = self.state;
        if old == new {
            return;
        }
        debug!("Peer connection {} negotiation {} -> {}", self.id, old, new);
        self.state = new;
        events.push(PeerEvent::NegotiationStateChanged { old, new });
    }

    // ---- local descriptions ----

    fn plan_description(&mut self, kind: SdpType) -> Result<NegotiationPlan> {
        self.ensure_open()?;
        self.ensure_idle()?;

        match kind {
            SdpType::Offer => {
                next_state(self.state, NegotiationStep::LocalOffer)?;
                let plan = self.registry.build_offer_plan();
                if plan.sections.is_empty() {
                    return Err(Error::negotiation(
                        "nothing to negotiate: add a transceiver or data channel first",
                    ));
                }
                self.renegotiation_needed = false;
                Ok(plan)
            }
            SdpType::Answer => {
                next_state(self.state, NegotiationStep::LocalAnswer)?;
                let remote = self
                    .remote_description
                    .as_ref()
                    .ok_or_else(|| Error::negotiation("no remote offer to answer"))?;
                self.registry.build_answer_plan(remote.description())
            }
        }
    }

    fn create_description(&mut self, kind: SdpType, reply: Reply<SdpMessage>) {
        let plan = match self.plan_description(kind) {
            Ok(plan) => plan,
            Err(e) => {
                debug!("Peer connection {} cannot create {}: {}", self.id, kind, e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        let ticket = self.ticket();
        self.pending = Some(PendingOperation::LocalDescription { ticket, kind, reply });
        trace!("Generating {} (ticket {})", kind, ticket);

        let transport = self.transport.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = transport.generate_local_description(&plan).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::DescriptionGenerated { ticket, result });
            }
        });
    }

    fn take_local(&mut self, ticket: u64) -> Option<(SdpType, Reply<SdpMessage>)> {
        match self.pending.take() {
            Some(PendingOperation::LocalDescription {
                ticket: pending,
                kind,
                reply,
            }) if pending == ticket => Some((kind, reply)),
            other => {
                self.pending = other;
                None
            }
        }
    }

    async fn on_description_generated(&mut self, ticket: u64, result: Result<String>) {
        let Some((kind, reply)) = self.take_local(ticket) else {
            debug!("Discarding stale local description (ticket {})", ticket);
            return;
        };

        let message = result
            .map_err(|e| Error::negotiation(format!("failed to generate {}: {}", kind, e)))
            .and_then(|text| {
                SdpMessage::decode(kind, &text)
                    .map_err(|e| Error::negotiation(format!("transport produced an invalid {}: {}", kind, e)))
            });

        let outcome = match message {
            Ok(message) => match kind {
                SdpType::Offer => self.complete_local_offer(message).await,
                SdpType::Answer => self.complete_local_answer(message).await,
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!("Peer connection {}: {}", self.id, e);
            if kind == SdpType::Offer {
                // Offer never took effect
                self.registry.rollback();
                let events = self.renegotiation_event().into_iter().collect();
                self.dispatch(events);
            }
        }
        let _ = reply.send(outcome);
    }

    async fn complete_local_offer(&mut self, message: SdpMessage) -> Result<SdpMessage> {
        let new = next_state(self.state, NegotiationStep::LocalOffer)?;

        self.backup = Some((self.local_description.take(), self.remote_description.take()));
        self.local_description = Some(message.clone());

        let mut events = Vec::new();
        self.set_state(new, &mut events);
        events.push(PeerEvent::LocalDescriptionReady(message.clone()));
        self.dispatch(events);
        info!("Peer connection {} created offer", self.id);

        self.begin_gathering().await;
        Ok(message)
    }

    async fn complete_local_answer(&mut self, message: SdpMessage) -> Result<SdpMessage> {
        let answered = next_state(self.state, NegotiationStep::LocalAnswer)?;
        let stable = next_state(answered, NegotiationStep::LocalAnswerApplied)?;

        self.local_description = Some(message.clone());
        self.backup = None;
        self.registry.commit();

        let mut events = Vec::new();
        self.set_state(answered, &mut events);
        events.push(PeerEvent::LocalDescriptionReady(message.clone()));
        self.set_state(stable, &mut events);
        self.last_stable = stable;
        events.extend(self.renegotiation_event());
        self.dispatch(events);
        info!("Peer connection {} created answer", self.id);

        self.begin_gathering().await;
        Ok(message)
    }

    /// Start a new candidate pass for the local description just created
    async fn begin_gathering(&mut self) {
        self.aggregator.restart();
        if let Err(e) = self.transport.start_gathering().await {
            warn!("Peer connection {} could not start gathering: {}", self.id, e);
            let mut events = Vec::new();
            self.set_connection_state(ConnectionState::Failed, Some(e.to_string()), &mut events);
            self.dispatch(events);
        }
    }

    // ---- remote descriptions ----

    async fn prepare_remote(&mut self, message: &SdpMessage) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle()?;

        match message.kind() {
            SdpType::Offer => {
                if self.state == NegotiationState::HaveLocalOffer && self.glare_policy == GlarePolicy::Rollback {
                    info!("Peer connection {} glare: rolling back local offer", self.id);
                    self.rollback_local().await;
                }
                next_state(self.state, NegotiationStep::RemoteOffer)?;
                self.registry.validate_remote_offer(message.description())
            }
            SdpType::Answer => {
                next_state(self.state, NegotiationStep::RemoteAnswer)?;
                self.registry.validate_remote_answer(message.description())
            }
        }
    }

    async fn set_remote_description(&mut self, message: SdpMessage, reply: Reply<()>) {
        if let Err(e) = self.prepare_remote(&message).await {
            debug!("Peer connection {} rejected remote {}: {}", self.id, message.kind(), e);
            let _ = reply.send(Err(e));
            return;
        }

        let ticket = self.ticket();
        trace!("Applying remote {} (ticket {})", message.kind(), ticket);
        let transport = self.transport.clone();
        let commands = self.commands.clone();
        let applied = message.clone();
        self.pending = Some(PendingOperation::RemoteDescription { ticket, message, reply });

        tokio::spawn(async move {
            let result = transport.apply_remote_description(&applied).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::RemoteApplied { ticket, result });
            }
        });
    }

    fn take_remote(&mut self, ticket: u64) -> Option<(SdpMessage, Reply<()>)> {
        match self.pending.take() {
            Some(PendingOperation::RemoteDescription {
                ticket: pending,
                message,
                reply,
            }) if pending == ticket => Some((message, reply)),
            other => {
                self.pending = other;
                None
            }
        }
    }

    async fn on_remote_applied(&mut self, ticket: u64, result: Result<()>) {
        let Some((message, reply)) = self.take_remote(ticket) else {
            debug!("Discarding stale remote application (ticket {})", ticket);
            return;
        };

        let kind = message.kind();
        let outcome = match result {
            Err(e) => Err(Error::negotiation(format!("failed to apply remote {}: {}", kind, e))),
            Ok(()) => match kind {
                SdpType::Offer => self.complete_remote_offer(message).await,
                SdpType::Answer => self.complete_remote_answer(message).await,
            },
        };
        if let Err(e) = &outcome {
            warn!("Peer connection {}: {}", self.id, e);
        }
        let _ = reply.send(outcome);
    }

    async fn complete_remote_offer(&mut self, message: SdpMessage) -> Result<()> {
        let new = next_state(self.state, NegotiationStep::RemoteOffer)?;
        let changes = match self.registry.apply_remote_offer(message.description()) {
            Ok(changes) => changes,
            Err(e) => {
                self.rollback_transport().await;
                return Err(e);
            }
        };

        self.backup = Some((self.local_description.clone(), self.remote_description.take()));
        self.remote_description = Some(message);

        let mut events: Vec<PeerEvent> = changes.into_iter().map(PeerEvent::from).collect();
        self.set_state(new, &mut events);
        self.dispatch(events);
        info!("Peer connection {} applied remote offer", self.id);
        Ok(())
    }

    async fn complete_remote_answer(&mut self, message: SdpMessage) -> Result<()> {
        let answered = next_state(self.state, NegotiationStep::RemoteAnswer)?;
        let stable = next_state(answered, NegotiationStep::RemoteAnswerApplied)?;
        let changes = match self.registry.apply_remote_answer(message.description()) {
            Ok(changes) => changes,
            Err(e) => {
                self.rollback_transport().await;
                return Err(e);
            }
        };

        self.remote_description = Some(message);
        self.backup = None;
        self.registry.commit();

        let mut events: Vec<PeerEvent> = changes.into_iter().map(PeerEvent::from).collect();
        self.set_state(answered, &mut events);
        self.set_state(stable, &mut events);
        self.last_stable = stable;
        events.extend(self.renegotiation_event());
        self.dispatch(events);
        info!("Peer connection {} applied remote answer", self.id);
        Ok(())
    }

    // ---- rollback ----

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_idle()?;
        next_state(
            self.state,
            NegotiationStep::Rollback {
                last_stable: self.last_stable,
            },
        )?;
        self.rollback_local().await;
        Ok(())
    }

    async fn rollback_transport(&self) {
        if let Err(e) = self.transport.rollback().await {
            warn!("Peer connection {} transport rollback failed: {}", self.id, e);
        }
    }

    /// Return to the last stable state, restoring the previous descriptions
    async fn rollback_local(&mut self) {
        let changes = self.registry.rollback();
        if let Some((local, remote)) = self.backup.take() {
            self.local_description = local;
            self.remote_description = remote;
        }
        self.rollback_transport().await;

        let mut events: Vec<PeerEvent> = changes.into_iter().map(PeerEvent::from).collect();
        self.set_state(self.last_stable, &mut events);
        events.extend(self.renegotiation_event());
        self.dispatch(events);
        info!("Peer connection {} rolled back to {}", self.id, self.state);
    }

    // ---- candidates ----

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if self.remote_description.is_none() {
            return Err(Error::negotiation(
                "cannot add a remote candidate before a remote description",
            ));
        }
        if !candidate.content.is_empty() && candidate.content != END_OF_CANDIDATES {
            candidate.info()?;
        }
        trace!("Peer connection {} remote candidate {}", self.id, candidate.content);
        self.transport.add_remote_candidate(&candidate).await
    }

    // ---- registry ----

    fn add_transceiver(&mut self, kind: MediaKind, init: TransceiverInit) -> Result<TransceiverInfo> {
        self.ensure_open()?;
        let info = self.registry.add_transceiver(kind, init)?;
        let mut events = vec![PeerEvent::TransceiverAdded(info.clone())];
        events.extend(self.renegotiation_event());
        self.dispatch(events);
        Ok(info)
    }

    fn attach_local_track(
        &mut self,
        id: TransceiverId,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<Option<Arc<LocalTrack>>> {
        self.ensure_open()?;
        let previous = self.registry.attach_local_track(id, track)?;
        let events = self.renegotiation_event().into_iter().collect();
        self.dispatch(events);
        Ok(previous)
    }

    fn set_direction(&mut self, id: TransceiverId, direction: Direction) -> Result<()> {
        self.ensure_open()?;
        self.registry.set_direction(id, direction)?;
        let events = self.renegotiation_event().into_iter().collect();
        self.dispatch(events);
        Ok(())
    }

    fn add_data_channel(&mut self, label: String, ordered: bool, reliable: bool) -> Result<DataChannel> {
        self.ensure_open()?;
        let channel = self.registry.add_data_channel(label, ordered, reliable);
        debug!("Peer connection {} added data channel '{}' ({})", self.id, channel.label, channel.id);
        let mut events = vec![PeerEvent::DataChannelAdded(channel.clone())];
        events.extend(self.renegotiation_event());
        self.dispatch(events);
        Ok(channel)
    }

    fn remove_data_channel(&mut self, id: DataChannelId) -> Result<DataChannel> {
        self.ensure_open()?;
        let channel = self.registry.remove_data_channel(id)?;
        self.dispatch(vec![PeerEvent::DataChannelRemoved(channel.clone())]);
        Ok(channel)
    }

    // ---- transport notifications ----

    fn on_transport_event(&mut self, event: TransportEvent) {
        if self.closed {
            trace!("Peer connection {} ignoring {:?} after close", self.id, event);
            return;
        }

        let mut events = Vec::new();
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.aggregator.on_candidate(candidate.clone()) {
                    events.push(PeerEvent::IceCandidateReady(candidate));
                }
            }
            TransportEvent::GatheringStateChanged(state) => {
                if state != self.gathering_state {
                    debug!("Peer connection {} gathering {} -> {}", self.id, self.gathering_state, state);
                    self.gathering_state = state;
                    events.push(PeerEvent::IceGatheringStateChanged(state));
                }
                if let Some(bundle) = self.aggregator.on_gathering_state_changed(state) {
                    events.push(PeerEvent::IceCandidatesGathered(bundle));
                }
            }
            TransportEvent::IceConnectionStateChanged(state) => {
                self.set_ice_connection_state(state, None, &mut events);
            }
            TransportEvent::Failed { reason } => {
                warn!("Peer connection {} transport failed: {}", self.id, reason);
                self.set_ice_connection_state(IceConnectionState::Failed, Some(reason), &mut events);
            }
            TransportEvent::DataChannelOpened(channel) => {
                if self.registry.insert_remote_data_channel(channel.clone()) {
                    debug!("Peer connection {} remote data channel '{}' ({})", self.id, channel.label, channel.id);
                    events.push(PeerEvent::DataChannelAdded(channel));
                }
            }
            TransportEvent::DataChannelClosed(id) => match self.registry.remove_data_channel(id) {
                Ok(channel) => events.push(PeerEvent::DataChannelRemoved(channel)),
                Err(_) => debug!("Peer connection {} closed unknown data channel {}", self.id, id),
            },
        }
        self.dispatch(events);
    }

    fn set_ice_connection_state(
        &mut self,
        state: IceConnectionState,
        reason: Option<String>,
        events: &mut Vec<PeerEvent>,
    ) {
        if state != self.ice_connection_state {
            debug!("Peer connection {} ICE {} -> {}", self.id, self.ice_connection_state, state);
            self.ice_connection_state = state;
            events.push(PeerEvent::IceConnectionStateChanged(state));
        }
        self.set_connection_state(ConnectionState::from_ice(state), reason, events);
    }

    fn set_connection_state(&mut self, new: ConnectionState, reason: Option<String>, events: &mut Vec<PeerEvent>) {
        let old = self.connection_state;
        if old == new {
            return;
        }

        // Never skip Connecting on the way up
        if old == ConnectionState::New && new == ConnectionState::Connected {
            self.connection_state = ConnectionState::Connecting;
            events.push(PeerEvent::ConnectionStateChanged {
                old,
                new: ConnectionState::Connecting,
                reason: None,
            });
            return self.set_connection_state(new, reason, events);
        }

        info!("Peer connection {} {} -> {}", self.id, old, new);
        self.connection_state = new;
        events.push(PeerEvent::ConnectionStateChanged { old, new, reason });
        if new == ConnectionState::Connected {
            events.push(PeerEvent::Connected);
        }
    }

    // ---- lifecycle ----

    async fn close(&mut self) -> Vec<Arc<LocalTrack>> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        if let Some(pending) = self.pending.take() {
            debug!("Peer connection {} abandoning pending operation", self.id);
            pending.fail(Error::Closed);
        }
        if let Err(e) = self.transport.close().await {
            warn!("Peer connection {} transport close failed: {}", self.id, e);
        }

        let mut events = Vec::new();
        match next_state(self.state, NegotiationStep::Close) {
            Ok(closed) => self.set_state(closed, &mut events),
            Err(e) => warn!("Peer connection {} cannot close from {}: {}", self.id, self.state, e),
        }
        if self.ice_connection_state != IceConnectionState::Closed {
            self.ice_connection_state = IceConnectionState::Closed;
            events.push(PeerEvent::IceConnectionStateChanged(IceConnectionState::Closed));
        }
        let old = self.connection_state;
        self.connection_state = ConnectionState::Closed;
        events.push(PeerEvent::ConnectionStateChanged {
            old,
            new: ConnectionState::Closed,
            reason: None,
        });
        events.push(PeerEvent::Closed);
        self.dispatch(events);

        info!("Peer connection {} closed", self.id);
        self.registry.take_local_tracks()
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            negotiation_state: self.state,
            connection_state: self.connection_state,
            ice_connection_state: self.ice_connection_state,
            ice_gathering_state: self.gathering_state,
            local_description: self.local_description.clone(),
            remote_description: self.remote_description.clone(),
            complete_local_description: self.complete_local_description(),
            transceivers: self.registry.transceivers(),
            data_channels: self.registry.data_channels(),
            renegotiation_needed: self.renegotiation_needed,
        }
    }

    /// Local description with the candidates of the finished pass merged in
    fn complete_local_description(&self) -> Option<SdpMessage> {
        let local = self.local_description.as_ref()?;
        let bundle = self.aggregator.bundle()?;
        let mut description = local.description().clone();
        bundle.apply_to(&mut description);
        Some(SdpMessage::new(local.kind(), description))
    }
}
