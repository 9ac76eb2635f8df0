//! Transceiver and data channel registry
//!
//! The registry owns every transceiver and data channel of a peer
//! connection. Negotiation rounds go through three steps: a plan (or a remote
//! offer) stages pending m-line associations, a remote description updates
//! remote tracks and directions, and `commit` makes the staged state current
//! once the round reaches `Stable`. `rollback` drops the staged state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::plan::{NegotiationPlan, PlannedSection, PlannedTrack, SectionKind};
use super::track::{LocalTrack, RemoteTrack};
use super::{Direction, MediaKind};
use crate::config::SdpSemantics;
use crate::error::{Error, Result};
use crate::sdp::{MediaSection, SdpType, SessionDescription};

/// Transceiver handle, unique within one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransceiverId(pub u32);

impl fmt::Display for TransceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transceiver-{}", self.0)
    }
}

/// SCTP stream id of a data channel
pub type DataChannelId = u16;

/// Who created a transceiver or data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// Initial settings for a new transceiver
#[derive(Debug, Clone, Default)]
pub struct TransceiverInit {
    pub direction: Direction,
    pub track: Option<Arc<LocalTrack>>,
}

impl TransceiverInit {
    pub fn new(direction: Direction) -> Self {
        Self { direction, track: None }
    }

    pub fn with_track(mut self, track: Arc<LocalTrack>) -> Self {
        self.track = Some(track);
        self
    }
}

/// Snapshot of a transceiver handed out to callers and observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransceiverInfo {
    pub id: TransceiverId,
    pub kind: MediaKind,
    /// Desired direction
    pub direction: Direction,
    /// Direction agreed in the last completed round
    pub current_direction: Option<Direction>,
    pub mline_index: Option<usize>,
    pub mid: Option<String>,
    pub origin: Origin,
    /// Name of the attached local track
    pub local_track: Option<String>,
    pub remote_track: Option<RemoteTrack>,
}

/// A data channel known to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannel {
    pub id: DataChannelId,
    pub label: String,
    pub ordered: bool,
    pub reliable: bool,
    pub origin: Origin,
}

/// Registry update produced by applying a description
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    TransceiverAdded(TransceiverInfo),
    TrackAdded { transceiver: TransceiverId, track: RemoteTrack },
    TrackRemoved { transceiver: TransceiverId, track: RemoteTrack },
}

/// What the last completed round put in the local description
#[derive(Debug, Clone)]
struct NegotiatedState {
    role: SdpType,
    local_direction: Direction,
    offered: Option<Direction>,
    track_id: Option<String>,
}

/// Association staged by the round in progress
#[derive(Debug, Clone)]
struct PendingState {
    mline_index: usize,
    mid: String,
    role: Option<SdpType>,
    local_direction: Option<Direction>,
    offered: Option<Direction>,
    track_id: Option<String>,
    current_direction: Option<Direction>,
}

impl PendingState {
    fn new(mline_index: usize, mid: String) -> Self {
        Self {
            mline_index,
            mid,
            role: None,
            local_direction: None,
            offered: None,
            track_id: None,
            current_direction: None,
        }
    }
}

#[derive(Debug)]
struct Transceiver {
    id: TransceiverId,
    kind: MediaKind,
    direction: Direction,
    origin: Origin,
    local_track: Option<Arc<LocalTrack>>,
    remote_track: Option<RemoteTrack>,
    mline_index: Option<usize>,
    mid: Option<String>,
    current_direction: Option<Direction>,
    negotiated: Option<NegotiatedState>,
    pending: Option<PendingState>,
}

impl Transceiver {
    fn info(&self) -> TransceiverInfo {
        TransceiverInfo {
            id: self.id,
            kind: self.kind,
            direction: self.direction,
            current_direction: self.current_direction,
            mline_index: self.mline_index,
            mid: self.mid.clone(),
            origin: self.origin,
            local_track: self.local_track.as_ref().map(|track| track.name().to_string()),
            remote_track: self.remote_track.clone(),
        }
    }

    fn planned_track(&self, direction: Direction) -> Option<PlannedTrack> {
        if !direction.sends() {
            return None;
        }
        self.local_track.as_ref().map(|track| PlannedTrack {
            id: track.id().to_string(),
            name: track.name().to_string(),
        })
    }

    fn needs_negotiation(&self) -> bool {
        let Some(negotiated) = &self.negotiated else {
            return self.mline_index.is_none();
        };

        let expected = match negotiated.role {
            SdpType::Offer => self.direction,
            SdpType::Answer => self
                .direction
                .answer_to(negotiated.offered.unwrap_or_default()),
        };
        if expected != negotiated.local_direction {
            return true;
        }

        let track_id = self.local_track.as_ref().map(|track| track.id().to_string());
        expected.sends() && track_id != negotiated.track_id
    }
}

fn remote_track_for(section: &MediaSection, kind: MediaKind, mline_index: usize) -> RemoteTrack {
    match section.msid() {
        Some((stream, track)) => RemoteTrack {
            id: track.unwrap_or(stream).to_string(),
            stream_id: if stream == "-" { None } else { Some(stream.to_string()) },
            kind,
        },
        None => RemoteTrack {
            id: format!("{}-{}", kind, section.mid().map_or_else(|| mline_index.to_string(), str::to_string)),
            stream_id: None,
            kind,
        },
    }
}

/// Bring the remote track of `transceiver` in line with a remote section
fn sync_remote_track(transceiver: &mut Transceiver, section: &MediaSection, mline_index: usize) -> Vec<RegistryChange> {
    let mut changes = Vec::new();
    let previous = transceiver.remote_track.take();
    let remote_sends = section.direction().sends() && !section.is_rejected();

    if remote_sends {
        let track = remote_track_for(section, transceiver.kind, mline_index);
        match previous {
            Some(old) if old == track => transceiver.remote_track = Some(old),
            Some(old) => {
                changes.push(RegistryChange::TrackRemoved {
                    transceiver: transceiver.id,
                    track: old,
                });
                changes.push(RegistryChange::TrackAdded {
                    transceiver: transceiver.id,
                    track: track.clone(),
                });
                transceiver.remote_track = Some(track);
            }
            None => {
                changes.push(RegistryChange::TrackAdded {
                    transceiver: transceiver.id,
                    track: track.clone(),
                });
                transceiver.remote_track = Some(track);
            }
        }
    } else if let Some(old) = previous {
        changes.push(RegistryChange::TrackRemoved {
            transceiver: transceiver.id,
            track: old,
        });
    }

    changes
}

const APPLICATION: &str = "application";

/// Section of an answer at an m-line index the offer planned
fn answered_section(remote: &SessionDescription, mline_index: usize) -> Result<&MediaSection> {
    remote
        .media
        .get(mline_index)
        .ok_or_else(|| Error::negotiation(format!("answer has no m-line {}", mline_index)))
}

fn section_mid(section: &MediaSection, mline_index: usize) -> String {
    section
        .mid()
        .map_or_else(|| mline_index.to_string(), str::to_string)
}

/// Transceivers and data channels of one peer connection
#[derive(Debug)]
pub struct TransceiverRegistry {
    semantics: SdpSemantics,
    transceivers: Vec<Transceiver>,
    next_transceiver_id: u32,
    data_channels: BTreeMap<DataChannelId, DataChannel>,
    next_channel_id: DataChannelId,
    application: Option<(usize, String)>,
    rejected: BTreeMap<usize, (String, String)>,
    pending_application: Option<(usize, String)>,
    pending_rejected: BTreeMap<usize, (String, String)>,
    pending_section_count: Option<usize>,
}

impl TransceiverRegistry {
    pub fn new(semantics: SdpSemantics) -> Self {
        Self {
            semantics,
            transceivers: Vec::new(),
            next_transceiver_id: 0,
            data_channels: BTreeMap::new(),
            next_channel_id: 0,
            application: None,
            rejected: BTreeMap::new(),
            pending_application: None,
            pending_rejected: BTreeMap::new(),
            pending_section_count: None,
        }
    }

    fn find(&self, id: TransceiverId) -> Result<&Transceiver> {
        self.transceivers
            .iter()
            .find(|t| t.id == id)
            .ok_or(Error::UnknownTransceiver { id: id.0 })
    }

    fn find_mut(&mut self, id: TransceiverId) -> Result<&mut Transceiver> {
        self.transceivers
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(Error::UnknownTransceiver { id: id.0 })
    }

    fn push_transceiver(&mut self, kind: MediaKind, direction: Direction, origin: Origin) -> usize {
        let id = TransceiverId(self.next_transceiver_id);
        self.next_transceiver_id += 1;
        self.transceivers.push(Transceiver {
            id,
            kind,
            direction,
            origin,
            local_track: None,
            remote_track: None,
            mline_index: None,
            mid: None,
            current_direction: None,
            negotiated: None,
            pending: None,
        });
        self.transceivers.len() - 1
    }

    /// Register a local transceiver; it is included in the next offer
    pub fn add_transceiver(&mut self, kind: MediaKind, init: TransceiverInit) -> Result<TransceiverInfo> {
        if let Some(track) = &init.track {
            if track.kind() != kind {
                return Err(Error::invalid_track(format!(
                    "cannot send {} track '{}' on a {} transceiver",
                    track.kind(),
                    track.name(),
                    kind
                )));
            }
        }

        if self.semantics == SdpSemantics::PlanB
            && self
                .transceivers
                .iter()
                .any(|t| t.kind == kind && t.origin == Origin::Local)
        {
            return Err(Error::configuration(format!(
                "plan-b semantics allow a single local {} transceiver",
                kind
            )));
        }

        let index = self.push_transceiver(kind, init.direction, Origin::Local);
        let transceiver = &mut self.transceivers[index];
        transceiver.local_track = init.track;
        debug!("Added {} {} ({})", kind, transceiver.id, transceiver.direction);
        Ok(transceiver.info())
    }

    /// Attach (or with `None` detach) the local track, returning the previous one
    pub fn attach_local_track(
        &mut self,
        id: TransceiverId,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<Option<Arc<LocalTrack>>> {
        let transceiver = self.find_mut(id)?;
        if let Some(track) = &track {
            if track.kind() != transceiver.kind {
                return Err(Error::invalid_track(format!(
                    "cannot send {} track '{}' on {} {}",
                    track.kind(),
                    track.name(),
                    transceiver.kind,
                    id
                )));
            }
        }
        Ok(std::mem::replace(&mut transceiver.local_track, track))
    }

    /// Change the desired direction
    pub fn set_direction(&mut self, id: TransceiverId, direction: Direction) -> Result<()> {
        let transceiver = self.find_mut(id)?;
        if transceiver.direction != direction {
            debug!("{} direction {} -> {}", id, transceiver.direction, direction);
            transceiver.direction = direction;
        }
        Ok(())
    }

    pub fn transceiver(&self, id: TransceiverId) -> Result<TransceiverInfo> {
        self.find(id).map(Transceiver::info)
    }

    pub fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.transceivers.iter().map(Transceiver::info).collect()
    }

    /// Local tracks currently attached to any transceiver
    pub fn local_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.transceivers
            .iter()
            .filter_map(|t| t.local_track.clone())
            .collect()
    }

    /// Detach every local track, returning them for release
    pub fn take_local_tracks(&mut self) -> Vec<Arc<LocalTrack>> {
        self.transceivers
            .iter_mut()
            .filter_map(|t| t.local_track.take())
            .collect()
    }

    /// Create a local data channel
    pub fn add_data_channel(&mut self, label: impl Into<String>, ordered: bool, reliable: bool) -> DataChannel {
        while self.data_channels.contains_key(&self.next_channel_id) {
            self.next_channel_id = self.next_channel_id.wrapping_add(1);
        }
        let channel = DataChannel {
            id: self.next_channel_id,
            label: label.into(),
            ordered,
            reliable,
            origin: Origin::Local,
        };
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        self.data_channels.insert(channel.id, channel.clone());
        channel
    }

    /// Record a channel opened by the remote peer; `false` if the id is taken
    pub fn insert_remote_data_channel(&mut self, channel: DataChannel) -> bool {
        if self.data_channels.contains_key(&channel.id) {
            warn!("Ignoring remote data channel '{}': id {} already in use", channel.label, channel.id);
            return false;
        }
        self.data_channels.insert(channel.id, channel);
        true
    }

    pub fn remove_data_channel(&mut self, id: DataChannelId) -> Result<DataChannel> {
        self.data_channels
            .remove(&id)
            .ok_or(Error::UnknownDataChannel { id })
    }

    pub fn data_channels(&self) -> Vec<DataChannel> {
        self.data_channels.values().cloned().collect()
    }

    /// Whether the remote peer turned down the data channel section
    fn application_rejected(&self) -> bool {
        self.rejected.values().any(|(media, _)| media == APPLICATION)
    }

    /// Whether the local state differs from what the last completed round agreed on
    pub fn needs_negotiation(&self) -> bool {
        let channels_unnegotiated =
            !self.data_channels.is_empty() && self.application.is_none() && !self.application_rejected();
        channels_unnegotiated || self.transceivers.iter().any(Transceiver::needs_negotiation)
    }

    /// Number of m-lines agreed so far
    fn section_count(&self) -> usize {
        let transceivers = self.transceivers.iter().filter_map(|t| t.mline_index);
        let application = self.application.iter().map(|(index, _)| *index);
        let rejected = self.rejected.keys().copied();
        transceivers
            .chain(application)
            .chain(rejected)
            .max()
            .map_or(0, |max| max + 1)
    }

    fn clear_pending(&mut self) {
        for transceiver in &mut self.transceivers {
            transceiver.pending = None;
        }
        self.pending_application = None;
        self.pending_rejected.clear();
        self.pending_section_count = None;
    }

    /// Plan a local offer covering every transceiver and data channel
    pub fn build_offer_plan(&mut self) -> NegotiationPlan {
        self.clear_pending();

        let mut plan = NegotiationPlan::new(SdpType::Offer);
        let mut next_index = self.section_count();

        for transceiver in &mut self.transceivers {
            let (mline_index, mid) = match transceiver.mline_index {
                Some(index) => (index, transceiver.mid.clone().unwrap_or_else(|| index.to_string())),
                None => {
                    let index = next_index;
                    next_index += 1;
                    (index, index.to_string())
                }
            };

            let track = transceiver.planned_track(transceiver.direction);
            let mut pending = PendingState::new(mline_index, mid.clone());
            pending.role = Some(SdpType::Offer);
            pending.local_direction = Some(transceiver.direction);
            pending.track_id = track.as_ref().map(|t| t.id.clone());
            transceiver.pending = Some(pending);

            plan.sections.push(PlannedSection {
                mline_index,
                mid,
                kind: SectionKind::Media(transceiver.kind),
                direction: transceiver.direction,
                transceiver: Some(transceiver.id),
                track,
                rejected: false,
            });
        }

        let application = match &self.application {
            Some(existing) => Some(existing.clone()),
            None if !self.data_channels.is_empty() && !self.application_rejected() => {
                let index = next_index;
                Some((index, index.to_string()))
            }
            None => None,
        };
        if let Some((mline_index, mid)) = application {
            plan.sections.push(PlannedSection {
                mline_index,
                mid: mid.clone(),
                kind: SectionKind::Application,
                direction: Direction::SendReceive,
                transceiver: None,
                track: None,
                rejected: false,
            });
            self.pending_application = Some((mline_index, mid));
        }

        for (mline_index, (media, mid)) in &self.rejected {
            let kind = if media == APPLICATION {
                SectionKind::Application
            } else {
                SectionKind::Unsupported(media.clone())
            };
            plan.sections.push(PlannedSection {
                mline_index: *mline_index,
                mid: mid.clone(),
                kind,
                direction: Direction::Inactive,
                transceiver: None,
                track: None,
                rejected: true,
            });
        }

        plan.sort();
        self.pending_section_count = Some(plan.sections.len());
        plan
    }

    /// Check that a remote offer is compatible with the agreed m-lines
    pub fn validate_remote_offer(&self, remote: &SessionDescription) -> Result<()> {
        let agreed = self.section_count();
        if remote.media.len() < agreed {
            return Err(Error::negotiation(format!(
                "remote offer has {} m-lines, {} were already negotiated",
                remote.media.len(),
                agreed
            )));
        }
        for (index, section) in remote.media.iter().enumerate() {
            if let Some(transceiver) = self.transceivers.iter().find(|t| t.mline_index == Some(index)) {
                if section.kind() != Some(transceiver.kind) {
                    return Err(Error::negotiation(format!(
                        "m-line {} changed from {} to {}",
                        index, transceiver.kind, section.media
                    )));
                }
            }
            if matches!(&self.application, Some((app, _)) if *app == index) && !section.is_application() {
                return Err(Error::negotiation(format!(
                    "m-line {} changed from application to {}",
                    index, section.media
                )));
            }
        }
        Ok(())
    }

    /// Apply a remote offer: associate its sections with transceivers and
    /// create transceivers for sections nothing local matches
    pub fn apply_remote_offer(&mut self, remote: &SessionDescription) -> Result<Vec<RegistryChange>> {
        self.validate_remote_offer(remote)?;
        self.clear_pending();
        let mut changes = Vec::new();

        for (index, section) in remote.media.iter().enumerate() {
            let mid = section_mid(section, index);

            if section.is_application() {
                // One association at a fixed index; every other application section is refused
                let taken = self.pending_application.is_some()
                    || matches!(&self.application, Some((app, _)) if *app != index);
                if section.is_rejected() || taken {
                    self.pending_rejected.insert(index, (section.media.clone(), mid));
                } else {
                    self.pending_application = Some((index, mid));
                }
                continue;
            }

            let Some(kind) = section.kind() else {
                self.pending_rejected.insert(index, (section.media.clone(), mid));
                continue;
            };

            let existing = self
                .transceivers
                .iter()
                .position(|t| t.mline_index == Some(index))
                .or_else(|| {
                    self.transceivers.iter().position(|t| {
                        t.kind == kind && t.origin == Origin::Local && t.mline_index.is_none() && t.pending.is_none()
                    })
                });

            let position = match existing {
                Some(position) => position,
                None => {
                    let position = self.push_transceiver(kind, Direction::ReceiveOnly, Origin::Remote);
                    let info = self.transceivers[position].info();
                    debug!("Remote offer introduced {} {} at m-line {}", kind, info.id, index);
                    changes.push(RegistryChange::TransceiverAdded(info));
                    position
                }
            };

            let transceiver = &mut self.transceivers[position];
            let mut pending = PendingState::new(index, mid);
            pending.offered = Some(section.direction());
            transceiver.pending = Some(pending);
            changes.extend(sync_remote_track(transceiver, section, index));
        }

        Ok(changes)
    }

    /// Plan the answer to the remote offer applied last
    pub fn build_answer_plan(&mut self, remote: &SessionDescription) -> Result<NegotiationPlan> {
        let mut plan = NegotiationPlan::new(SdpType::Answer);

        for (index, section) in remote.media.iter().enumerate() {
            let mid = section_mid(section, index);

            if section.is_application() {
                plan.sections.push(PlannedSection {
                    mline_index: index,
                    mid,
                    kind: SectionKind::Application,
                    direction: Direction::SendReceive,
                    transceiver: None,
                    track: None,
                    rejected: section.is_rejected() || self.pending_rejected.contains_key(&index),
                });
                continue;
            }

            let Some(kind) = section.kind() else {
                plan.sections.push(PlannedSection {
                    mline_index: index,
                    mid,
                    kind: SectionKind::Unsupported(section.media.clone()),
                    direction: Direction::Inactive,
                    transceiver: None,
                    track: None,
                    rejected: true,
                });
                continue;
            };

            let transceiver = self
                .transceivers
                .iter_mut()
                .find(|t| t.pending.as_ref().map(|p| p.mline_index) == Some(index))
                .ok_or_else(|| Error::negotiation(format!("no transceiver associated with m-line {}", index)))?;

            let direction = if section.is_rejected() {
                Direction::Inactive
            } else {
                transceiver.direction.answer_to(section.direction())
            };
            let track = transceiver.planned_track(direction);

            if let Some(pending) = transceiver.pending.as_mut() {
                pending.role = Some(SdpType::Answer);
                pending.local_direction = Some(direction);
                pending.track_id = track.as_ref().map(|t| t.id.clone());
                pending.current_direction = Some(direction);
            }

            plan.sections.push(PlannedSection {
                mline_index: index,
                mid,
                kind: SectionKind::Media(kind),
                direction,
                transceiver: Some(transceiver.id),
                track,
                rejected: section.is_rejected(),
            });
        }

        Ok(plan)
    }

    /// Check that a remote answer matches the offer planned last
    pub fn validate_remote_answer(&self, remote: &SessionDescription) -> Result<()> {
        let expected = self
            .pending_section_count
            .ok_or_else(|| Error::negotiation("no local offer to answer"))?;
        if remote.media.len() != expected {
            return Err(Error::negotiation(format!(
                "answer has {} m-lines, offer had {}",
                remote.media.len(),
                expected
            )));
        }

        for transceiver in &self.transceivers {
            if let Some(pending) = &transceiver.pending {
                let section = answered_section(remote, pending.mline_index)?;
                if section.kind() != Some(transceiver.kind) {
                    return Err(Error::negotiation(format!(
                        "answer m-line {} is {}, offered {}",
                        pending.mline_index, section.media, transceiver.kind
                    )));
                }
            }
        }
        if let Some((index, _)) = &self.pending_application {
            let section = answered_section(remote, *index)?;
            if !section.is_application() {
                return Err(Error::negotiation(format!(
                    "answer m-line {} is {}, offered application",
                    index, section.media
                )));
            }
        }
        Ok(())
    }

    /// Apply the remote answer to the offer planned last
    pub fn apply_remote_answer(&mut self, remote: &SessionDescription) -> Result<Vec<RegistryChange>> {
        self.validate_remote_answer(remote)?;

        let mut changes = Vec::new();
        for transceiver in &mut self.transceivers {
            let Some(index) = transceiver.pending.as_ref().map(|p| p.mline_index) else {
                continue;
            };
            let section = answered_section(remote, index)?;
            let current = if section.is_rejected() {
                Direction::Inactive
            } else {
                section.direction().reverse()
            };
            if let Some(pending) = transceiver.pending.as_mut() {
                pending.current_direction = Some(current);
            }
            changes.extend(sync_remote_track(transceiver, section, index));
        }

        let application_refused = matches!(
            &self.pending_application,
            Some((index, _)) if remote.media.get(*index).is_some_and(MediaSection::is_rejected)
        );
        if application_refused {
            if let Some((index, mid)) = self.pending_application.take() {
                debug!("Remote peer rejected the data channel section at m-line {}", index);
                self.pending_rejected.insert(index, (APPLICATION.to_string(), mid));
            }
        }

        Ok(changes)
    }

    /// Make the staged round current; returns transceivers that received an m-line index
    pub fn commit(&mut self) -> Vec<TransceiverId> {
        let mut assigned = Vec::new();

        for transceiver in &mut self.transceivers {
            let Some(pending) = transceiver.pending.take() else {
                continue;
            };

            match transceiver.mline_index {
                None => {
                    transceiver.mline_index = Some(pending.mline_index);
                    transceiver.mid = Some(pending.mid.clone());
                    assigned.push(transceiver.id);
                }
                Some(index) if index != pending.mline_index => {
                    warn!(
                        "{} keeps m-line {} (round staged {})",
                        transceiver.id, index, pending.mline_index
                    );
                }
                Some(_) => {}
            }

            if let Some(current) = pending.current_direction {
                transceiver.current_direction = Some(current);
            }
            if let (Some(role), Some(local_direction)) = (pending.role, pending.local_direction) {
                transceiver.negotiated = Some(NegotiatedState {
                    role,
                    local_direction,
                    offered: pending.offered,
                    track_id: pending.track_id,
                });
            }
        }

        if let Some(application) = self.pending_application.take() {
            self.rejected.remove(&application.0);
            self.application = Some(application);
        }
        let rejected = std::mem::take(&mut self.pending_rejected);
        for (index, section) in rejected {
            if matches!(&self.application, Some((app, _)) if *app == index) {
                self.application = None;
            }
            self.rejected.entry(index).or_insert(section);
        }
        self.pending_section_count = None;

        assigned
    }

    /// Drop the staged round; transceivers created by a rolled back remote
    /// offer are removed together with their remote tracks
    pub fn rollback(&mut self) -> Vec<RegistryChange> {
        let mut changes = Vec::new();
        let transceivers = std::mem::take(&mut self.transceivers);

        for mut transceiver in transceivers {
            transceiver.pending = None;
            if transceiver.origin == Origin::Remote && transceiver.mline_index.is_none() {
                if let Some(track) = transceiver.remote_track.take() {
                    changes.push(RegistryChange::TrackRemoved {
                        transceiver: transceiver.id,
                        track,
                    });
                }
                debug!("Rollback removed {}", transceiver.id);
                continue;
            }
            self.transceivers.push(transceiver);
        }

        self.clear_pending();
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaSource;
    use crate::sdp::parse_session_description;

    #[derive(Debug)]
    struct Camera;

    impl MediaSource for Camera {
        fn kind(&self) -> MediaKind {
            MediaKind::Video
        }
    }

    fn description(sections: &[&str]) -> SessionDescription {
        let mut text = String::from("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for section in sections {
            text.push_str(section);
        }
        parse_session_description(&text).unwrap()
    }

    #[test]
    fn offer_plan_assigns_sequential_indices() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let audio = registry.add_transceiver(MediaKind::Audio, TransceiverInit::default()).unwrap();
        let video = registry.add_transceiver(MediaKind::Video, TransceiverInit::default()).unwrap();
        registry.add_data_channel("channel1", true, true);

        let plan = registry.build_offer_plan();
        assert_eq!(plan.sections.len(), 3);
        assert_eq!(plan.section_for(audio.id).unwrap().mline_index, 0);
        assert_eq!(plan.section_for(video.id).unwrap().mline_index, 1);
        assert!(plan.has_application());
        assert_eq!(plan.bundle_mids(), vec!["0", "1", "2"]);

        // Nothing is assigned until the round completes
        assert_eq!(registry.transceiver(audio.id).unwrap().mline_index, None);
    }

    #[test]
    fn mline_index_is_immutable_after_commit() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let audio = registry.add_transceiver(MediaKind::Audio, TransceiverInit::default()).unwrap();
        registry.build_offer_plan();
        let answer = description(&["m=audio 9 RTP/AVP 0\r\na=mid:0\r\na=sendrecv\r\n"]);
        registry.apply_remote_answer(&answer).unwrap();
        assert_eq!(registry.commit(), vec![audio.id]);
        assert_eq!(registry.transceiver(audio.id).unwrap().mline_index, Some(0));

        // A later transceiver goes after the existing section
        let video = registry.add_transceiver(MediaKind::Video, TransceiverInit::default()).unwrap();
        let plan = registry.build_offer_plan();
        assert_eq!(plan.section_for(audio.id).unwrap().mline_index, 0);
        assert_eq!(plan.section_for(video.id).unwrap().mline_index, 1);
        let answer = description(&[
            "m=audio 9 RTP/AVP 0\r\na=mid:0\r\n",
            "m=video 9 RTP/AVP 96\r\na=mid:1\r\n",
        ]);
        registry.apply_remote_answer(&answer).unwrap();
        assert_eq!(registry.commit(), vec![video.id]);
        assert_eq!(registry.transceiver(audio.id).unwrap().mline_index, Some(0));
    }

    #[test]
    fn remote_offer_creates_receiving_transceivers() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let offer = description(&[
            "m=audio 9 RTP/AVP 0\r\na=mid:a0\r\na=sendrecv\r\na=msid:stream-1 track-1\r\n",
            "m=text 9 RTP/AVP 98\r\na=mid:t1\r\n",
        ]);

        let changes = registry.apply_remote_offer(&offer).unwrap();
        assert_eq!(changes.len(), 2);
        let RegistryChange::TransceiverAdded(info) = &changes[0] else {
            panic!("expected transceiver first, got {:?}", changes[0]);
        };
        assert_eq!(info.origin, Origin::Remote);
        assert!(matches!(
            &changes[1],
            RegistryChange::TrackAdded { track, .. } if track.id == "track-1" && track.stream_id.as_deref() == Some("stream-1")
        ));

        let plan = registry.build_answer_plan(&offer).unwrap();
        assert_eq!(plan.sections[0].direction, Direction::ReceiveOnly);
        assert_eq!(plan.sections[0].mid, "a0");
        assert!(plan.sections[1].rejected);

        registry.commit();
        let info = registry.transceiver(info.id).unwrap();
        assert_eq!(info.mline_index, Some(0));
        assert_eq!(info.current_direction, Some(Direction::ReceiveOnly));
    }

    #[test]
    fn remote_offer_reuses_unassociated_local_transceiver() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let local = registry.add_transceiver(MediaKind::Audio, TransceiverInit::default()).unwrap();
        let offer = description(&["m=audio 9 RTP/AVP 0\r\na=sendonly\r\n"]);

        let changes = registry.apply_remote_offer(&offer).unwrap();
        assert!(matches!(&changes[..], [RegistryChange::TrackAdded { transceiver, .. }] if *transceiver == local.id));

        let plan = registry.build_answer_plan(&offer).unwrap();
        assert_eq!(plan.section_for(local.id).unwrap().direction, Direction::ReceiveOnly);
    }

    #[test]
    fn remote_offer_cannot_change_kind_of_negotiated_line() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let offer = description(&["m=audio 9 RTP/AVP 0\r\n"]);
        registry.apply_remote_offer(&offer).unwrap();
        registry.build_answer_plan(&offer).unwrap();
        registry.commit();

        let changed = description(&["m=video 9 RTP/AVP 96\r\n"]);
        assert!(matches!(registry.apply_remote_offer(&changed), Err(Error::Negotiation { .. })));
    }

    #[test]
    fn rollback_removes_remote_created_transceivers() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let offer = description(&["m=video 9 RTP/AVP 96\r\na=sendonly\r\n"]);
        registry.apply_remote_offer(&offer).unwrap();
        assert_eq!(registry.transceivers().len(), 1);

        let changes = registry.rollback();
        assert!(matches!(&changes[..], [RegistryChange::TrackRemoved { .. }]));
        assert!(registry.transceivers().is_empty());
    }

    #[test]
    fn needs_negotiation_tracks_changes() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        assert!(!registry.needs_negotiation());

        let video = registry.add_transceiver(MediaKind::Video, TransceiverInit::default()).unwrap();
        assert!(registry.needs_negotiation());

        registry.build_offer_plan();
        registry
            .apply_remote_answer(&description(&["m=video 9 RTP/AVP 96\r\na=recvonly\r\n"]))
            .unwrap();
        registry.commit();
        assert!(!registry.needs_negotiation());
        assert_eq!(
            registry.transceiver(video.id).unwrap().current_direction,
            Some(Direction::SendOnly)
        );

        let track = Arc::new(LocalTrack::new("camera", Arc::new(Camera)));
        registry.attach_local_track(video.id, Some(track)).unwrap();
        assert!(registry.needs_negotiation());
    }

    #[test]
    fn rejected_application_keeps_its_index() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let offer = description(&[
            "m=application 0 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:data\r\n",
            "m=audio 9 RTP/AVP 0\r\na=mid:audio\r\n",
        ]);
        registry.apply_remote_offer(&offer).unwrap();
        let answer = registry.build_answer_plan(&offer).unwrap();
        assert!(answer.sections[0].rejected);
        registry.commit();

        let plan = registry.build_offer_plan();
        assert_eq!(plan.sections.len(), 2);
        assert_eq!(plan.sections[0].kind, SectionKind::Application);
        assert!(plan.sections[0].rejected);
        assert_eq!(plan.sections[1].mline_index, 1);

        // Answers must cover every planned line
        let short = description(&["m=audio 9 RTP/AVP 0\r\na=mid:audio\r\n"]);
        assert!(matches!(registry.apply_remote_answer(&short), Err(Error::Negotiation { .. })));
    }

    #[test]
    fn refused_data_channels_count_as_negotiated() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        registry.add_data_channel("chat", true, true);
        let plan = registry.build_offer_plan();
        assert!(plan.has_application());

        let answer = description(&["m=application 0 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n"]);
        registry.apply_remote_answer(&answer).unwrap();
        registry.commit();
        assert!(!registry.needs_negotiation());

        let plan = registry.build_offer_plan();
        assert_eq!(plan.sections.len(), 1);
        assert!(plan.sections[0].rejected);
        assert!(!plan.has_application());

        // The remote peer may still accept it later
        let offer = description(&["m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n"]);
        registry.apply_remote_offer(&offer).unwrap();
        registry.commit();
        let plan = registry.build_offer_plan();
        assert_eq!(plan.sections.len(), 1);
        assert!(plan.has_application());
    }

    #[test]
    fn rejects_mismatched_track_kind() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        let audio = registry.add_transceiver(MediaKind::Audio, TransceiverInit::default()).unwrap();
        let track = Arc::new(LocalTrack::new("camera", Arc::new(Camera)));
        assert!(matches!(
            registry.attach_local_track(audio.id, Some(track)),
            Err(Error::InvalidTrack { .. })
        ));
        assert!(matches!(
            registry.set_direction(TransceiverId(42), Direction::Inactive),
            Err(Error::UnknownTransceiver { id: 42 })
        ));
    }

    #[test]
    fn plan_b_limits_local_transceivers_per_kind() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::PlanB);
        registry.add_transceiver(MediaKind::Audio, TransceiverInit::default()).unwrap();
        registry.add_transceiver(MediaKind::Video, TransceiverInit::default()).unwrap();
        assert!(matches!(
            registry.add_transceiver(MediaKind::Audio, TransceiverInit::default()),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn data_channel_ids_skip_remote_ones() {
        let mut registry = TransceiverRegistry::new(SdpSemantics::UnifiedPlan);
        assert!(registry.insert_remote_data_channel(DataChannel {
            id: 0,
            label: "remote".into(),
            ordered: true,
            reliable: true,
            origin: Origin::Remote,
        }));
        let local = registry.add_data_channel("local", false, false);
        assert_eq!(local.id, 1);
        assert_eq!(registry.data_channels().len(), 2);
        assert!(registry.remove_data_channel(1).is_ok());
        assert!(matches!(registry.remove_data_channel(1), Err(Error::UnknownDataChannel { id: 1 })));
    }
}
