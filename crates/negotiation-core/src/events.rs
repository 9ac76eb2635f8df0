//! Peer connection events
//!
//! Every state change of a peer connection is published as a [`PeerEvent`].
//! Events are delivered on a dedicated task, one at a time and in the order
//! they were produced, to observers registered for their [`EventKind`], to
//! observers registered for everything, and to broadcast subscribers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::ice::{CandidateBundle, ConnectionState, IceCandidate, IceConnectionState, IceGatheringState};
use crate::media::{DataChannel, RegistryChange, RemoteTrack, TransceiverId, TransceiverInfo};
use crate::negotiation::NegotiationState;
use crate::sdp::SdpMessage;

/// Capacity of the broadcast channel behind [`EventSubscriber`]
const SUBSCRIBER_CAPACITY: usize = 256;

/// Events published by a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A transceiver was added locally or by a remote offer
    TransceiverAdded(TransceiverInfo),

    /// The remote peer started sending on a transceiver
    TrackAdded {
        transceiver: TransceiverId,
        track: RemoteTrack,
    },

    /// The remote peer stopped sending on a transceiver
    TrackRemoved {
        transceiver: TransceiverId,
        track: RemoteTrack,
    },

    DataChannelAdded(DataChannel),

    DataChannelRemoved(DataChannel),

    NegotiationStateChanged {
        old: NegotiationState,
        new: NegotiationState,
    },

    IceGatheringStateChanged(IceGatheringState),

    IceConnectionStateChanged(IceConnectionState),

    ConnectionStateChanged {
        old: ConnectionState,
        new: ConnectionState,
        /// Failure reason reported by the transport
        reason: Option<String>,
    },

    /// The connection reached `Connected`
    Connected,

    /// A local candidate is ready to be sent to the remote peer
    IceCandidateReady(IceCandidate),

    /// The gathering pass completed
    IceCandidatesGathered(CandidateBundle),

    /// Local changes need a new offer/answer round
    RenegotiationNeeded,

    /// A local offer or answer is ready to be sent to the remote peer
    LocalDescriptionReady(SdpMessage),

    Closed,
}

/// Discriminant of a [`PeerEvent`], used to register observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    TransceiverAdded,
    TrackAdded,
    TrackRemoved,
    DataChannelAdded,
    DataChannelRemoved,
    NegotiationStateChanged,
    IceGatheringStateChanged,
    IceConnectionStateChanged,
    ConnectionStateChanged,
    Connected,
    IceCandidateReady,
    IceCandidatesGathered,
    RenegotiationNeeded,
    LocalDescriptionReady,
    Closed,
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TransceiverAdded(_) => EventKind::TransceiverAdded,
            Self::TrackAdded { .. } => EventKind::TrackAdded,
            Self::TrackRemoved { .. } => EventKind::TrackRemoved,
            Self::DataChannelAdded(_) => EventKind::DataChannelAdded,
            Self::DataChannelRemoved(_) => EventKind::DataChannelRemoved,
            Self::NegotiationStateChanged { .. } => EventKind::NegotiationStateChanged,
            Self::IceGatheringStateChanged(_) => EventKind::IceGatheringStateChanged,
            Self::IceConnectionStateChanged(_) => EventKind::IceConnectionStateChanged,
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::Connected => EventKind::Connected,
            Self::IceCandidateReady(_) => EventKind::IceCandidateReady,
            Self::IceCandidatesGathered(_) => EventKind::IceCandidatesGathered,
            Self::RenegotiationNeeded => EventKind::RenegotiationNeeded,
            Self::LocalDescriptionReady(_) => EventKind::LocalDescriptionReady,
            Self::Closed => EventKind::Closed,
        }
    }
}

impl From<RegistryChange> for PeerEvent {
    fn from(change: RegistryChange) -> Self {
        match change {
            RegistryChange::TransceiverAdded(info) => Self::TransceiverAdded(info),
            RegistryChange::TrackAdded { transceiver, track } => Self::TrackAdded { transceiver, track },
            RegistryChange::TrackRemoved { transceiver, track } => Self::TrackRemoved { transceiver, track },
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receives events on the delivery task
///
/// Observers run one at a time; a slow observer delays later events but
/// never the peer connection itself.
#[async_trait]
pub trait PeerObserver: Send + Sync {
    async fn on_event(&self, event: &PeerEvent);
}

/// Observer backed by a closure
pub struct FnObserver<F>(F);

#[async_trait]
impl<F> PeerObserver for FnObserver<F>
where
    F: Fn(&PeerEvent) + Send + Sync,
{
    async fn on_event(&self, event: &PeerEvent) {
        (self.0)(event)
    }
}

/// Wrap a closure as an observer
pub fn observer_fn<F>(f: F) -> Arc<dyn PeerObserver>
where
    F: Fn(&PeerEvent) + Send + Sync + 'static,
{
    Arc::new(FnObserver(f))
}

/// Broadcast-backed event stream
pub struct EventSubscriber {
    receiver: broadcast::Receiver<PeerEvent>,
}

impl EventSubscriber {
    fn new(receiver: broadcast::Receiver<PeerEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next event; fails with `Closed` once the connection is gone
    pub async fn receive(&mut self) -> Result<PeerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Closed),
            }
        }
    }

    /// Next event if one is queued
    pub fn try_receive(&mut self) -> Option<PeerEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

#[derive(Default)]
struct ObserverTable {
    by_kind: HashMap<EventKind, Vec<Arc<dyn PeerObserver>>>,
    all: Vec<Arc<dyn PeerObserver>>,
}

impl ObserverTable {
    fn observers_for(&self, kind: EventKind) -> Vec<Arc<dyn PeerObserver>> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .chain(self.all.iter())
            .cloned()
            .collect()
    }
}

enum Delivery {
    Batch(Vec<PeerEvent>),
    Flush(oneshot::Sender<()>),
}

/// Ordered fan-out of peer events
#[derive(Clone)]
pub struct EventDispatcher {
    observers: Arc<RwLock<ObserverTable>>,
    broadcast: broadcast::Sender<PeerEvent>,
    queue: mpsc::UnboundedSender<Delivery>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observers = self.observers.read();
        f.debug_struct("EventDispatcher")
            .field("kinds", &observers.by_kind.len())
            .field("all", &observers.all.len())
            .field("subscribers", &self.broadcast.receiver_count())
            .finish()
    }
}

impl EventDispatcher {
    /// Create a dispatcher and spawn its delivery task
    ///
    /// Must be called from within a tokio runtime. The task ends once every
    /// clone of the dispatcher is dropped.
    pub fn new() -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let observers = Arc::new(RwLock::new(ObserverTable::default()));

        tokio::spawn(deliver(receiver, observers.clone(), broadcast.clone()));

        Self {
            observers,
            broadcast,
            queue,
        }
    }

    /// Register an observer for one kind of event
    pub fn register(&self, kind: EventKind, observer: Arc<dyn PeerObserver>) {
        self.observers
            .write()
            .by_kind
            .entry(kind)
            .or_default()
            .push(observer);
        debug!("Registered observer for {}", kind);
    }

    /// Register an observer for every event
    pub fn register_all(&self, observer: Arc<dyn PeerObserver>) {
        self.observers.write().all.push(observer);
        debug!("Registered observer for all events");
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber::new(self.broadcast.subscribe())
    }

    /// Queue a batch of events; the batch is delivered in order
    pub fn dispatch(&self, events: Vec<PeerEvent>) {
        if events.is_empty() {
            return;
        }
        if self.queue.send(Delivery::Batch(events)).is_err() {
            warn!("Event delivery task has stopped, dropping events");
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        self.dispatch(vec![event]);
    }

    /// Wait until every event queued so far has been delivered
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(Delivery::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
    observers: Arc<RwLock<ObserverTable>>,
    broadcast: broadcast::Sender<PeerEvent>,
) {
    while let Some(delivery) = receiver.recv().await {
        let events = match delivery {
            Delivery::Batch(events) => events,
            Delivery::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        for event in events {
            trace!("Delivering {}", event.kind());
            let targets = observers.read().observers_for(event.kind());
            for observer in targets {
                observer.on_event(&event).await;
            }
            // No subscribers is not an error
            let _ = broadcast.send(event);
        }
    }
    debug!("Event delivery task finished");
}
