mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{create_peer, init_logging, negotiate, Microphone, Recorder};
use peerlink_negotiation_core::media::{NegotiationPlan, PassthroughMediaProvider};
use peerlink_negotiation_core::prelude::*;
use peerlink_negotiation_core::{MediaSourceProvider, TransportEventSink};
use tokio::sync::Notify;

/// Holds description generation until released
struct GatedTransport {
    inner: SimulatedTransport,
    gate: Arc<Notify>,
}

#[async_trait]
impl IceTransport for GatedTransport {
    async fn initialize(&self, config: &PeerConnectionConfig, events: TransportEventSink) -> Result<()> {
        self.inner.initialize(config, events).await
    }

    async fn generate_local_description(&self, plan: &NegotiationPlan) -> Result<String> {
        self.gate.notified().await;
        self.inner.generate_local_description(plan).await
    }

    async fn apply_remote_description(&self, description: &SdpMessage) -> Result<()> {
        self.inner.apply_remote_description(description).await
    }

    async fn start_gathering(&self) -> Result<()> {
        self.inner.start_gathering().await
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.inner.add_remote_candidate(candidate).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Counts released tracks
#[derive(Default)]
struct CountingProvider {
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaSourceProvider for CountingProvider {
    async fn attach(&self, source: Arc<dyn MediaSource>, name: &str) -> Result<Arc<LocalTrack>> {
        PassthroughMediaProvider.attach(source, name).await
    }

    async fn release(&self, _track: Arc<LocalTrack>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_close_fails_pending_offer() -> Result<()> {
    init_logging();
    let gate = Arc::new(Notify::new());
    let inner = SimulatedTransport::new();
    let transport = GatedTransport {
        inner: inner.clone(),
        gate: gate.clone(),
    };
    let alice = PeerConnection::new(PeerConnectionConfig::new(), transport).await?;
    alice.add_transceiver(MediaKind::Audio).await?;

    let pending = tokio::spawn({
        let alice = alice.clone();
        async move { alice.create_offer().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    alice.close().await?;
    let result = pending.await.expect("offer task panicked");
    assert_eq!(result.unwrap_err(), Error::Closed);

    // Late completion of the abandoned generation is discarded
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(inner.is_closed());
    let snapshot = alice.snapshot().await?;
    assert_eq!(snapshot.negotiation_state, NegotiationState::Closed);
    assert!(snapshot.local_description.is_none());
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() -> Result<()> {
    let (alice, transport) = create_peer(PeerConnectionConfig::new()).await?;
    let recorder = Recorder::attach(&alice);
    alice.add_transceiver(MediaKind::Audio).await?;

    alice.close().await?;
    alice.close().await?;
    assert!(transport.is_closed());

    let snapshot = alice.snapshot().await?;
    assert_eq!(snapshot.negotiation_state, NegotiationState::Closed);
    assert_eq!(snapshot.connection_state, ConnectionState::Closed);
    assert_eq!(snapshot.ice_connection_state, IceConnectionState::Closed);

    assert_eq!(alice.create_offer().await.unwrap_err(), Error::Closed);
    assert_eq!(alice.add_transceiver(MediaKind::Video).await.unwrap_err(), Error::Closed);
    assert_eq!(alice.rollback().await.unwrap_err(), Error::Closed);
    assert_eq!(alice.add_data_channel("late", true, true).await.unwrap_err(), Error::Closed);

    assert_eq!(recorder.count(EventKind::Closed), 1);
    assert_eq!(recorder.kinds().last(), Some(&EventKind::Closed));

    // Transport reports after close are ignored
    assert!(!transport.report_ice_state(IceConnectionState::Connected));
    Ok(())
}

#[tokio::test]
async fn test_close_releases_local_tracks() -> Result<()> {
    init_logging();
    let provider = CountingProvider::default();
    let released = provider.released.clone();
    let alice = PeerConnection::builder(PeerConnectionConfig::new())
        .with_transport(SimulatedTransport::new())
        .with_media_provider(provider)
        .build()
        .await?;

    let sender = alice.add_track(Arc::new(Microphone), "microphone_track").await?;
    alice.add_track(Arc::new(Microphone), "second_microphone").await?;

    // Replacing a track releases the one it replaces
    let replacement = alice.create_local_track(Arc::new(Microphone), "replacement").await?;
    alice.attach_local_track(sender.id, replacement).await?;
    assert_eq!(released.load(Ordering::SeqCst), 1);

    alice.close().await?;
    assert_eq!(released.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_detach_releases_track() -> Result<()> {
    init_logging();
    let provider = CountingProvider::default();
    let released = provider.released.clone();
    let alice = PeerConnection::builder(PeerConnectionConfig::new())
        .with_transport(SimulatedTransport::new())
        .with_media_provider(provider)
        .build()
        .await?;

    let sender = alice.add_track(Arc::new(Microphone), "microphone_track").await?;
    alice.detach_local_track(sender.id).await?;
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(alice.transceiver(sender.id).await?.local_track, None);

    alice.close().await?;
    assert_eq!(released.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_build_validates_configuration() {
    init_logging();

    let config = PeerConnectionConfig::new().with_ice_server("http://stun.example.org");
    let err = PeerConnection::new(config, SimulatedTransport::new()).await.unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    let err = PeerConnection::builder(PeerConnectionConfig::new())
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    // A transport can only back one peer connection
    let transport = SimulatedTransport::new();
    let _first = PeerConnection::new(PeerConnectionConfig::new(), transport.clone())
        .await
        .expect("first peer");
    let err = PeerConnection::new(PeerConnectionConfig::new(), transport)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
}

#[tokio::test]
async fn test_configuration_from_toml() -> Result<()> {
    let config = PeerConnectionConfig::from_toml_str(
        r#"
        sdp_semantics = "plan-b"
        glare_policy = "rollback"

        [[ice_servers]]
        urls = ["stun:stun.l.google.com:19302"]
        "#,
    )?;
    assert_eq!(config.sdp_semantics, SdpSemantics::PlanB);
    assert_eq!(config.glare_policy, GlarePolicy::Rollback);

    let (alice, _) = create_peer(config).await?;
    assert_eq!(alice.config().ice_servers.len(), 1);
    alice.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_dropping_handles_stops_the_connection() -> Result<()> {
    init_logging();
    let provider = CountingProvider::default();
    let released = provider.released.clone();
    let transport = SimulatedTransport::new();
    let alice = PeerConnection::builder(PeerConnectionConfig::new())
        .with_transport(transport.clone())
        .with_media_provider(provider)
        .build()
        .await?;
    let (bob, _) = create_peer(PeerConnectionConfig::new()).await?;
    alice.add_track(Arc::new(Microphone), "microphone_track").await?;
    negotiate(&alice, &bob).await?;

    drop(alice);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !transport.is_closed() || released.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection shut down after the last handle went away");
    assert_eq!(released.load(Ordering::SeqCst), 1);

    bob.close().await?;
    Ok(())
}
