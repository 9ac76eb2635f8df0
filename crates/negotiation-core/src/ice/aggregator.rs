//! Candidate aggregation
//!
//! Local candidates trickle in from the transport one at a time. The
//! aggregator collects them per gathering pass and hands out one finalized
//! [`CandidateBundle`] when the pass completes. Each new local description
//! starts a new pass.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{IceCandidate, IceGatheringState};
use crate::constants::END_OF_CANDIDATES;
use crate::sdp::SessionDescription;

/// All candidates gathered in one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateBundle {
    pub pass: u64,
    pub candidates: Vec<IceCandidate>,
}

impl CandidateBundle {
    /// `a=candidate:` lines followed by `a=end-of-candidates`
    pub fn to_sdp_lines(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(IceCandidate::to_sdp_line)
            .chain(std::iter::once(format!("a={}", END_OF_CANDIDATES)))
            .collect()
    }

    /// Merge the candidates into a local description
    ///
    /// Candidates land in the section named by their m-line index, then by
    /// mid, then in the first section. Every section that is not rejected
    /// gets the end-of-candidates marker.
    pub fn apply_to(&self, description: &mut SessionDescription) {
        if description.media.is_empty() {
            return;
        }

        for candidate in &self.candidates {
            let index = candidate
                .sdp_mline_index
                .filter(|index| *index < description.media.len())
                .or_else(|| {
                    candidate
                        .sdp_mid
                        .as_deref()
                        .and_then(|mid| description.find_mid(mid))
                })
                .unwrap_or(0);

            let section = &mut description.media[index];
            if !section.candidates().contains(&candidate.content.as_str()) {
                section.push_attribute(candidate.content.clone());
            }
        }

        for section in description.media.iter_mut().filter(|s| !s.is_rejected()) {
            if !section.end_of_candidates() {
                section.push_attribute(END_OF_CANDIDATES);
            }
        }
    }
}

/// Collects local candidates until gathering completes
#[derive(Debug, Default)]
pub struct IceCandidateAggregator {
    pass: u64,
    state: Option<IceGatheringState>,
    pending: Vec<IceCandidate>,
    completed: Option<CandidateBundle>,
}

impl IceCandidateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current gathering pass, starting at 0 before the first restart
    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn gathering_state(&self) -> IceGatheringState {
        self.state.unwrap_or(IceGatheringState::New)
    }

    pub fn is_complete(&self) -> bool {
        self.completed.is_some()
    }

    /// Candidates collected so far in the current pass
    pub fn pending(&self) -> &[IceCandidate] {
        &self.pending
    }

    /// Bundle of the current pass, once complete
    pub fn bundle(&self) -> Option<&CandidateBundle> {
        self.completed.as_ref()
    }

    /// Add a local candidate; returns `false` when the pass already completed
    pub fn on_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.completed.is_some() {
            warn!(
                "Dropping candidate gathered after pass {} completed: {}",
                self.pass, candidate.content
            );
            return false;
        }
        trace!("Pass {} candidate: {}", self.pass, candidate.content);
        self.pending.push(candidate);
        true
    }

    /// Record a gathering state change
    ///
    /// The first transition into `Complete` finalizes the pass and returns its
    /// bundle. Later `Complete` notifications return `None`.
    pub fn on_gathering_state_changed(&mut self, state: IceGatheringState) -> Option<CandidateBundle> {
        self.state = Some(state);
        if state != IceGatheringState::Complete || self.completed.is_some() {
            return None;
        }

        let bundle = CandidateBundle {
            pass: self.pass,
            candidates: self.pending.clone(),
        };
        debug!("Gathering pass {} complete with {} candidates", self.pass, bundle.candidates.len());
        self.completed = Some(bundle.clone());
        Some(bundle)
    }

    /// Start a new pass
    pub fn restart(&mut self) {
        self.pass += 1;
        self.state = None;
        self.pending.clear();
        self.completed = None;
        debug!("Starting gathering pass {}", self.pass);
    }
}
