#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_negotiation_core::prelude::*;
use peerlink_negotiation_core::{setup_logging, EventSubscriber, LoggingConfig};
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = setup_logging(LoggingConfig::for_tests());
    });
}

#[derive(Debug)]
pub struct Microphone;

impl MediaSource for Microphone {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn label(&self) -> &str {
        "test microphone"
    }
}

#[derive(Debug)]
pub struct Camera;

impl MediaSource for Camera {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }
}

pub async fn create_peer(config: PeerConnectionConfig) -> Result<(PeerConnection, SimulatedTransport)> {
    init_logging();
    let transport = SimulatedTransport::new();
    let peer = PeerConnection::new(config, transport.clone()).await?;
    Ok((peer, transport))
}

/// Records every event delivered to an observer
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<PeerEvent>>>,
}

impl Recorder {
    pub fn attach(peer: &PeerConnection) -> Self {
        let recorder = Self::default();
        let events = recorder.events.clone();
        peer.register_all(observer_fn(move |event| events.lock().push(event.clone())));
        recorder
    }

    pub fn events(&self) -> Vec<PeerEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(PeerEvent::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|event| event.kind() == kind).count()
    }
}

/// Receive events until one matches, returning everything seen on the way
pub async fn wait_for<F>(subscriber: &mut EventSubscriber, mut matches: F) -> Vec<PeerEvent>
where
    F: FnMut(&PeerEvent) -> bool,
{
    let mut seen = Vec::new();
    let result = timeout(EVENT_TIMEOUT, async {
        loop {
            let event = subscriber.receive().await?;
            let done = matches(&event);
            seen.push(event);
            if done {
                return Ok::<_, Error>(());
            }
        }
    })
    .await;

    match result {
        Ok(Ok(())) => seen,
        Ok(Err(e)) => panic!("event stream ended early: {e}; saw {seen:?}"),
        Err(_) => panic!("timed out waiting for event; saw {seen:?}"),
    }
}

/// Full offer/answer round from `offerer` to `answerer`
pub async fn negotiate(offerer: &PeerConnection, answerer: &PeerConnection) -> Result<(SdpMessage, SdpMessage)> {
    let offer = offerer.create_offer().await?;
    answerer.set_remote_description(offer.clone()).await?;
    let answer = answerer.create_answer().await?;
    offerer.set_remote_description(answer.clone()).await?;
    Ok((offer, answer))
}
