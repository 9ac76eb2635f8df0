//! In-process transport
//!
//! Renders descriptions from a plan, "gathers" host candidates on configured
//! addresses and reports a successful connectivity check once both
//! descriptions are in place. No packets are sent. Used by the test suite and
//! as the reference implementation of [`IceTransport`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::{IceTransport, TransportEventSink};
use crate::config::PeerConnectionConfig;
use crate::error::{Error, Result};
use crate::ice::{CandidateInfo, CandidateType, IceCandidate, IceConnectionState, IceGatheringState};
use crate::media::{DataChannel, MediaKind, NegotiationPlan, PlannedSection, SectionKind};
use crate::sdp::{MediaSection, Origin, SdpLine, SdpMessage, SdpType, SessionDescription};

/// Delay between the second description and the connectivity result
const DEFAULT_CHECK_DELAY: Duration = Duration::from_millis(5);

/// SCTP port announced in application sections
const SCTP_PORT: u16 = 5000;

#[derive(Debug)]
struct SimulatedState {
    sink: Option<TransportEventSink>,
    host_addresses: Vec<String>,
    check_delay: Duration,
    session_id: u64,
    session_version: u64,
    ice_ufrag: String,
    ice_pwd: String,
    has_local: bool,
    has_remote: bool,
    checks_started: bool,
    closed: bool,
    gathering_passes: u64,
    remote_candidates: Vec<IceCandidate>,
    fail_generate: Option<String>,
    fail_apply: Option<String>,
    fail_connectivity: Option<String>,
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Transport that connects instantly without touching the network
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatedState>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let session_id = rand::thread_rng().gen_range(1..i64::MAX as u64);
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                sink: None,
                host_addresses: vec!["127.0.0.1".to_string()],
                check_delay: DEFAULT_CHECK_DELAY,
                session_id,
                session_version: 0,
                ice_ufrag: random_token(8),
                ice_pwd: random_token(24),
                has_local: false,
                has_remote: false,
                checks_started: false,
                closed: false,
                gathering_passes: 0,
                remote_candidates: Vec::new(),
                fail_generate: None,
                fail_apply: None,
                fail_connectivity: None,
            })),
        }
    }

    /// Gather one host candidate per address
    pub fn with_host_addresses<I, S>(self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().host_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_check_delay(self, delay: Duration) -> Self {
        self.state.lock().check_delay = delay;
        self
    }

    /// Make the next description generation fail
    pub fn fail_next_generate(&self, reason: impl Into<String>) {
        self.state.lock().fail_generate = Some(reason.into());
    }

    /// Make the next remote description application fail
    pub fn fail_next_apply(&self, reason: impl Into<String>) {
        self.state.lock().fail_apply = Some(reason.into());
    }

    /// Make the connectivity check fail with this reason
    pub fn fail_connectivity(&self, reason: impl Into<String>) {
        self.state.lock().fail_connectivity = Some(reason.into());
    }

    /// Candidates received from the remote peer
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn gathering_passes(&self) -> u64 {
        self.state.lock().gathering_passes
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn sink(&self) -> Option<TransportEventSink> {
        let state = self.state.lock();
        if state.closed {
            return None;
        }
        state.sink.clone()
    }

    /// Report a local candidate as if it had just been gathered
    pub fn inject_candidate(&self, candidate: IceCandidate) -> bool {
        self.sink().is_some_and(|sink| sink.candidate(candidate))
    }

    /// Report a data channel opened by the remote peer
    pub fn open_remote_data_channel(&self, channel: DataChannel) -> bool {
        self.sink().is_some_and(|sink| sink.data_channel_opened(channel))
    }

    /// Report an ICE connection state change
    pub fn report_ice_state(&self, state: IceConnectionState) -> bool {
        self.sink().is_some_and(|sink| sink.ice_connection_state(state))
    }

    /// Run the connectivity check once both descriptions are present
    fn schedule_checks(&self) {
        let (sink, delay, failure) = {
            let mut state = self.state.lock();
            if state.closed || state.checks_started || !(state.has_local && state.has_remote) {
                return;
            }
            let Some(sink) = state.sink.clone() else {
                return;
            };
            state.checks_started = true;
            (sink, state.check_delay, state.fail_connectivity.take())
        };

        let transport = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if transport.is_closed() {
                return;
            }
            sink.ice_connection_state(IceConnectionState::Checking);
            match failure {
                Some(reason) => {
                    warn!("Simulated connectivity check failed: {}", reason);
                    sink.failed(reason);
                }
                None => {
                    debug!("Simulated connectivity check succeeded");
                    sink.ice_connection_state(IceConnectionState::Connected);
                }
            }
        });
    }
}

fn render_section(section: &PlannedSection, plan_kind: SdpType, ufrag: &str, pwd: &str) -> MediaSection {
    let (protocol, format, rtpmap) = match &section.kind {
        SectionKind::Media(MediaKind::Audio) => ("UDP/TLS/RTP/SAVPF", "111", Some("rtpmap:111 opus/48000/2")),
        SectionKind::Media(MediaKind::Video) => ("UDP/TLS/RTP/SAVPF", "96", Some("rtpmap:96 VP8/90000")),
        SectionKind::Application => ("UDP/DTLS/SCTP", "webrtc-datachannel", None),
        SectionKind::Unsupported(_) => ("UDP/TLS/RTP/SAVPF", "0", None),
    };
    let port = if section.rejected { 0 } else { 9 };
    let mut media = MediaSection::new(section.kind.media_name(), port, protocol, vec![format.to_string()]);

    media.lines.push(SdpLine::new('c', "IN IP4 0.0.0.0"));
    media.push_attribute(format!("mid:{}", section.mid));
    if section.rejected {
        return media;
    }

    media.push_attribute(format!("ice-ufrag:{}", ufrag));
    media.push_attribute(format!("ice-pwd:{}", pwd));
    media.push_attribute(match plan_kind {
        SdpType::Offer => "setup:actpass",
        SdpType::Answer => "setup:active",
    });

    match &section.kind {
        SectionKind::Application => media.push_attribute(format!("sctp-port:{}", SCTP_PORT)),
        _ => {
            media.push_attribute(section.direction.as_sdp());
            if let Some(track) = &section.track {
                media.push_attribute(format!("msid:{} {}", track.name, track.id));
            }
            media.push_attribute("rtcp-mux");
            if let Some(rtpmap) = rtpmap {
                media.push_attribute(rtpmap);
            }
        }
    }
    media
}

fn render_description(state: &SimulatedState, plan: &NegotiationPlan) -> SessionDescription {
    let mut description = SessionDescription::new(Origin::anonymous(
        state.session_id.to_string(),
        state.session_version,
    ));

    let mids = plan.bundle_mids();
    if !mids.is_empty() {
        description
            .session_lines
            .push(SdpLine::attribute(format!("group:BUNDLE {}", mids.join(" "))));
    }

    description.media = plan
        .sections
        .iter()
        .map(|section| render_section(section, plan.kind, &state.ice_ufrag, &state.ice_pwd))
        .collect();
    description
}

#[async_trait]
impl IceTransport for SimulatedTransport {
    async fn initialize(&self, config: &PeerConnectionConfig, events: TransportEventSink) -> Result<()> {
        let mut state = self.state.lock();
        if state.sink.is_some() {
            return Err(Error::transport("transport already initialized"));
        }
        for server in &config.ice_servers {
            debug!("Simulated transport ignoring ICE server {:?}", server.urls);
        }
        state.sink = Some(events);
        info!("Simulated transport ready (session {})", state.session_id);
        Ok(())
    }

    async fn generate_local_description(&self, plan: &NegotiationPlan) -> Result<String> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::transport("transport is closed"));
        }
        if let Some(reason) = state.fail_generate.take() {
            return Err(Error::transport(reason));
        }

        state.session_version += 1;
        state.has_local = true;
        let description = render_description(&state, plan);
        debug!(
            "Generated {} version {} with {} sections",
            plan.kind,
            state.session_version,
            description.media.len()
        );
        Ok(description.to_sdp_string())
    }

    async fn apply_remote_description(&self, description: &SdpMessage) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::transport("transport is closed"));
            }
            if let Some(reason) = state.fail_apply.take() {
                return Err(Error::transport(reason));
            }
            state.has_remote = true;
            debug!("Applied remote {}", description.kind());
        }
        self.schedule_checks();
        Ok(())
    }

    async fn start_gathering(&self) -> Result<()> {
        let (sink, candidates) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::transport("transport is closed"));
            }
            let Some(sink) = state.sink.clone() else {
                return Err(Error::transport("transport not initialized"));
            };
            state.gathering_passes += 1;

            let mut rng = rand::thread_rng();
            let candidates: Vec<IceCandidate> = state
                .host_addresses
                .iter()
                .enumerate()
                .map(|(index, address)| {
                    let info = CandidateInfo {
                        foundation: (index + 1).to_string(),
                        component: 1,
                        transport: "udp".to_string(),
                        priority: CandidateInfo::compute_priority(CandidateType::Host, 65535 - index as u16, 1),
                        address: address.clone(),
                        port: rng.gen_range(49152..65535),
                        candidate_type: CandidateType::Host,
                        related_address: None,
                        related_port: None,
                        extensions: vec![("generation".to_string(), "0".to_string())],
                    };
                    IceCandidate::new(info.to_string()).with_mid("0").with_mline_index(0)
                })
                .collect();
            (sink, candidates)
        };

        sink.gathering_state(IceGatheringState::Gathering);
        for candidate in candidates {
            sink.candidate(candidate);
        }
        sink.gathering_state(IceGatheringState::Complete);

        self.schedule_checks();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::transport("transport is closed"));
        }
        debug!("Remote candidate: {}", candidate.content);
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.checks_started {
            state.has_local = false;
            state.has_remote = false;
        }
        debug!("Simulated transport rolled back");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.sink = None;
        info!("Simulated transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::plan::PlannedTrack;
    use crate::media::{Direction, TransceiverId};

    fn plan() -> NegotiationPlan {
        let mut plan = NegotiationPlan::new(SdpType::Offer);
        plan.sections.push(PlannedSection {
            mline_index: 0,
            mid: "0".into(),
            kind: SectionKind::Media(MediaKind::Audio),
            direction: Direction::SendReceive,
            transceiver: Some(TransceiverId(0)),
            track: Some(PlannedTrack {
                id: "track-id".into(),
                name: "microphone_track".into(),
            }),
            rejected: false,
        });
        plan.sections.push(PlannedSection {
            mline_index: 1,
            mid: "1".into(),
            kind: SectionKind::Application,
            direction: Direction::SendReceive,
            transceiver: None,
            track: None,
            rejected: false,
        });
        plan
    }

    #[tokio::test]
    async fn renders_parseable_offer() {
        let transport = SimulatedTransport::new();
        let text = transport.generate_local_description(&plan()).await.unwrap();
        let message = SdpMessage::decode(SdpType::Offer, &text).unwrap();
        let description = message.description();

        assert_eq!(description.bundle_mids(), vec!["0", "1"]);
        assert_eq!(description.media[0].msid(), Some(("microphone_track", Some("track-id"))));
        assert_eq!(description.media[0].direction(), Direction::SendReceive);
        assert!(description.media[1].is_application());
        assert_eq!(description.media[1].attribute("sctp-port"), Some("5000"));
        assert_eq!(description.origin.session_version, 1);
    }

    #[tokio::test]
    async fn injected_generate_failure_is_consumed() {
        let transport = SimulatedTransport::new();
        transport.fail_next_generate("no codecs");
        assert_eq!(
            transport.generate_local_description(&plan()).await.unwrap_err(),
            Error::transport("no codecs")
        );
        assert!(transport.generate_local_description(&plan()).await.is_ok());
    }

    #[tokio::test]
    async fn closed_transport_refuses_work() {
        let transport = SimulatedTransport::new();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert!(transport.generate_local_description(&plan()).await.is_err());
        assert!(!transport.inject_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host")));
    }
}
