mod common;

use std::sync::Arc;

use common::{create_peer, negotiate, wait_for, Microphone};
use peerlink_negotiation_core::prelude::*;
use peerlink_negotiation_core::sdp::escape_line_breaks;

fn plan_b_config() -> PeerConnectionConfig {
    PeerConnectionConfig::new()
        .with_ice_server("stun:stun.l.google.com:19302")
        .with_sdp_semantics(SdpSemantics::PlanB)
}

#[tokio::test]
async fn test_offer_answer_connects_both_peers() -> Result<()> {
    let (alice, _) = create_peer(plan_b_config()).await?;
    let (bob, _) = create_peer(PeerConnectionConfig::new()).await?;

    alice.add_data_channel("channel1", true, true).await?;
    alice.add_track(Arc::new(Microphone), "microphone_track").await?;

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let offer = alice.create_offer().await?;
    assert_eq!(offer.kind(), SdpType::Offer);
    assert_eq!(alice.negotiation_state().await?, NegotiationState::HaveLocalOffer);

    let sections = &offer.description().media;
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].media, "audio");
    assert_eq!(sections[0].msid().map(|(stream, _)| stream), Some("microphone_track"));
    assert!(sections[1].is_application());

    bob.set_remote_description(offer).await?;
    assert_eq!(bob.negotiation_state().await?, NegotiationState::HaveRemoteOffer);

    let answer = bob.create_answer().await?;
    assert_eq!(answer.kind(), SdpType::Answer);
    assert_eq!(answer.description().media.len(), 2);
    assert_eq!(bob.negotiation_state().await?, NegotiationState::Stable);

    alice.set_remote_description(answer).await?;
    assert_eq!(alice.negotiation_state().await?, NegotiationState::Stable);

    let seen = wait_for(&mut alice_events, |event| matches!(event, PeerEvent::Connected)).await;
    let transitions: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            PeerEvent::ConnectionStateChanged { old, new, .. } => Some((*old, *new)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (ConnectionState::New, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
        ]
    );
    wait_for(&mut bob_events, |event| matches!(event, PeerEvent::Connected)).await;

    let alice_audio = &alice.transceivers().await?[0];
    assert_eq!(alice_audio.mline_index, Some(0));
    assert_eq!(alice_audio.local_track.as_deref(), Some("microphone_track"));
    assert_eq!(alice_audio.current_direction, Some(Direction::SendOnly));

    let bob_audio = &bob.transceivers().await?[0];
    assert_eq!(bob_audio.mline_index, Some(0));
    assert_eq!(bob_audio.current_direction, Some(Direction::ReceiveOnly));
    assert_eq!(bob_audio.remote_track.as_ref().map(|track| track.kind), Some(MediaKind::Audio));

    assert_eq!(alice.connection_state().await?, ConnectionState::Connected);
    assert_eq!(bob.connection_state().await?, ConnectionState::Connected);

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_second_offer_while_pending_fails() -> Result<()> {
    let (alice, _) = create_peer(PeerConnectionConfig::new()).await?;
    alice.add_transceiver(MediaKind::Audio).await?;

    let (first, second) = futures::future::join(alice.create_offer(), alice.create_offer()).await;
    let failures = [&first, &second].iter().filter(|result| result.is_err()).count();
    assert_eq!(failures, 1);

    let err = second.expect_err("second offer must be refused");
    assert!(matches!(err, Error::Negotiation { .. }));

    // Once the first offer completed, HaveLocalOffer refuses another one
    let err = alice.create_offer().await.unwrap_err();
    assert!(matches!(err, Error::Negotiation { .. }));
    assert_eq!(alice.negotiation_state().await?, NegotiationState::HaveLocalOffer);

    alice.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_answer_without_offer_fails() -> Result<()> {
    let (alice, _) = create_peer(PeerConnectionConfig::new()).await?;
    let (bob, _) = create_peer(PeerConnectionConfig::new()).await?;
    alice.add_transceiver(MediaKind::Audio).await?;
    bob.add_transceiver(MediaKind::Audio).await?;

    assert!(matches!(bob.create_answer().await, Err(Error::Negotiation { .. })));

    // An answer is only acceptable in HaveLocalOffer
    let offer = alice.create_offer().await?;
    bob.set_remote_description(offer).await?;
    let answer = bob.create_answer().await?;

    let (carol, _) = create_peer(PeerConnectionConfig::new()).await?;
    let err = carol.set_remote_description(answer).await.unwrap_err();
    assert!(matches!(err, Error::Negotiation { .. }));
    assert_eq!(carol.negotiation_state().await?, NegotiationState::New);
    assert!(carol.remote_description().await?.is_none());

    for peer in [alice, bob, carol] {
        peer.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_empty_offer_is_refused() -> Result<()> {
    let (alice, _) = create_peer(PeerConnectionConfig::new()).await?;
    let err = alice.create_offer().await.unwrap_err();
    assert!(matches!(err, Error::Negotiation { .. }));
    assert_eq!(alice.negotiation_state().await?, NegotiationState::New);
    alice.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_generation_failure_leaves_state_unchanged() -> Result<()> {
    let (alice, transport) = create_peer(PeerConnectionConfig::new()).await?;
    alice.add_transceiver(MediaKind::Video).await?;

    transport.fail_next_generate("no codecs available");
    let err = alice.create_offer().await.unwrap_err();
    assert!(err.to_string().contains("no codecs available"));
    assert_eq!(alice.negotiation_state().await?, NegotiationState::New);
    assert!(alice.local_description().await?.is_none());

    // The failure is not sticky
    alice.create_offer().await?;
    assert_eq!(alice.negotiation_state().await?, NegotiationState::HaveLocalOffer);

    alice.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_apply_failure_keeps_registry_untouched() -> Result<()> {
    let (alice, _) = create_peer(PeerConnectionConfig::new()).await?;
    let (bob, bob_transport) = create_peer(PeerConnectionConfig::new()).await?;
    alice.add_track(Arc::new(Microphone), "microphone_track").await?;
    let offer = alice.create_offer().await?;

    bob_transport.fail_next_apply("ice agent unavailable");
    let err = bob.set_remote_description(offer.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Negotiation { .. }));
    assert_eq!(bob.negotiation_state().await?, NegotiationState::New);
    assert!(bob.transceivers().await?.is_empty());

    bob.set_remote_description(offer).await?;
    assert_eq!(bob.transceivers().await?.len(), 1);

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_remote_description_from_text() -> Result<()> {
    let (alice, _) = create_peer(PeerConnectionConfig::new()).await?;
    let (bob, _) = create_peer(PeerConnectionConfig::new()).await?;
    alice.add_data_channel("channel1", true, true).await?;

    let offer = alice.create_offer().await?;

    // Pasted through a single-line console
    let escaped = escape_line_breaks(&offer.encode());
    assert!(!escaped.contains('\n'));
    bob.set_remote_description_text(SdpType::Offer, &escaped).await?;
    assert_eq!(bob.remote_description().await?, Some(offer.clone()));

    let json = offer.to_json()?;
    assert_eq!(SdpMessage::from_json(&json)?, offer);

    let err = bob
        .set_remote_description_text(SdpType::Answer, "this is not sdp")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parse { .. }));
    assert_eq!(bob.negotiation_state().await?, NegotiationState::HaveRemoteOffer);

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_remote_candidates_require_remote_description() -> Result<()> {
    let (alice, _) = create_peer(PeerConnectionConfig::new()).await?;
    let (bob, bob_transport) = create_peer(PeerConnectionConfig::new()).await?;
    alice.add_transceiver(MediaKind::Audio).await?;

    let candidate = IceCandidate::new("candidate:1 1 udp 2130706431 192.168.1.10 50000 typ host generation 0")
        .with_mid("0")
        .with_mline_index(0);

    let err = bob.add_ice_candidate(candidate.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Negotiation { .. }));

    negotiate(&alice, &bob).await?;

    bob.add_ice_candidate(candidate.clone()).await?;
    bob.add_ice_candidate(IceCandidate::new("end-of-candidates")).await?;
    let err = bob
        .add_ice_candidate(IceCandidate::new("candidate:broken"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parse { .. }));

    let received = bob_transport.remote_candidates();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0], candidate);

    alice.close().await?;
    bob.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_second_round_keeps_mline_indices() -> Result<()> {
    let (alice, _) = create_peer(PeerConnectionConfig::new()).await?;
    let (bob, _) = create_peer(PeerConnectionConfig::new()).await?;

    let audio = alice.add_transceiver(MediaKind::Audio).await?;
    alice.add_data_channel("chat", true, true).await?;
    negotiate(&alice, &bob).await?;

    let video = alice.add_transceiver(MediaKind::Video).await?;
    let (offer, _) = negotiate(&alice, &bob).await?;

    let media = &offer.description().media;
    assert_eq!(media.len(), 3);
    assert_eq!(media[0].media, "audio");
    assert!(media[1].is_application());
    assert_eq!(media[2].media, "video");

    assert_eq!(alice.transceiver(audio.id).await?.mline_index, Some(0));
    assert_eq!(alice.transceiver(video.id).await?.mline_index, Some(2));
    assert_eq!(bob.transceivers().await?.len(), 2);

    alice.close().await?;
    bob.close().await?;
    Ok(())
}
