//! Negotiation plans
//!
//! A plan is the ordered list of m-sections the transport has to render for
//! the next local description. The registry builds it; the transport turns it
//! into SDP text.

use serde::{Deserialize, Serialize};

use super::{Direction, MediaKind, TransceiverId};
use crate::sdp::SdpType;

/// What an m-section carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionKind {
    Media(MediaKind),
    /// SCTP association for data channels
    Application,
    /// Section offered by the remote peer that this core cannot handle
    Unsupported(String),
}

impl SectionKind {
    /// Media name used on the `m=` line
    pub fn media_name(&self) -> &str {
        match self {
            Self::Media(kind) => kind.as_sdp(),
            Self::Application => "application",
            Self::Unsupported(media) => media,
        }
    }
}

/// Local track announced in a section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTrack {
    pub id: String,
    pub name: String,
}

/// One m-section of a planned description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSection {
    pub mline_index: usize,
    pub mid: String,
    pub kind: SectionKind,
    pub direction: Direction,
    pub transceiver: Option<TransceiverId>,
    pub track: Option<PlannedTrack>,
    /// Rendered with port 0
    pub rejected: bool,
}

/// Sections of the next local description, ordered by m-line index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationPlan {
    pub kind: SdpType,
    pub sections: Vec<PlannedSection>,
}

impl NegotiationPlan {
    pub fn new(kind: SdpType) -> Self {
        Self {
            kind,
            sections: Vec::new(),
        }
    }

    /// Section planned for a transceiver
    pub fn section_for(&self, transceiver: TransceiverId) -> Option<&PlannedSection> {
        self.sections
            .iter()
            .find(|section| section.transceiver == Some(transceiver))
    }

    /// mids of the non-rejected sections, for the BUNDLE group
    pub fn bundle_mids(&self) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|section| !section.rejected)
            .map(|section| section.mid.as_str())
            .collect()
    }

    pub fn has_application(&self) -> bool {
        self.sections
            .iter()
            .any(|section| section.kind == SectionKind::Application && !section.rejected)
    }

    pub(crate) fn sort(&mut self) {
        self.sections.sort_by_key(|section| section.mline_index);
    }
}
