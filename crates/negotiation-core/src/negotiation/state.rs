//! Offer/answer state transitions
//!
//! Pure transition function over [`NegotiationState`]. The machine asks it
//! whether a step is legal before starting the step and applies the result
//! once the step completed.
//!
//! ```text
//!   New/Stable --local offer--> HaveLocalOffer --remote answer--> HaveRemoteAnswer --applied--> Stable
//!   New/Stable --remote offer--> HaveRemoteOffer --local answer--> HaveLocalAnswer --applied--> Stable
//!   HaveLocalOffer/HaveRemoteOffer --rollback--> last stable state
//!   any --close--> Closed
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Signaling state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    /// No description exchanged yet
    New,
    HaveLocalOffer,
    HaveRemoteAnswer,
    Stable,
    HaveRemoteOffer,
    HaveLocalAnswer,
    Closed,
}

impl NegotiationState {
    /// States a rollback can return to
    pub fn is_stable(self) -> bool {
        matches!(self, Self::New | Self::Stable)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::HaveLocalOffer => write!(f, "have-local-offer"),
            Self::HaveRemoteAnswer => write!(f, "have-remote-answer"),
            Self::Stable => write!(f, "stable"),
            Self::HaveRemoteOffer => write!(f, "have-remote-offer"),
            Self::HaveLocalAnswer => write!(f, "have-local-answer"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A step of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationStep {
    /// A local offer was generated
    LocalOffer,
    /// A remote offer was received
    RemoteOffer,
    /// A remote answer was received
    RemoteAnswer,
    /// The remote answer took effect
    RemoteAnswerApplied,
    /// A local answer was generated
    LocalAnswer,
    /// The local answer took effect
    LocalAnswerApplied,
    /// Undo the outstanding offer
    Rollback { last_stable: NegotiationState },
    Close,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalOffer => write!(f, "create offer"),
            Self::RemoteOffer => write!(f, "apply remote offer"),
            Self::RemoteAnswer => write!(f, "apply remote answer"),
            Self::RemoteAnswerApplied => write!(f, "complete remote answer"),
            Self::LocalAnswer => write!(f, "create answer"),
            Self::LocalAnswerApplied => write!(f, "complete local answer"),
            Self::Rollback { .. } => write!(f, "roll back"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// State after `step`, or why the step is not allowed in `state`
pub fn next_state(state: NegotiationState, step: NegotiationStep) -> Result<NegotiationState> {
    use NegotiationState::*;
    use NegotiationStep as Step;

    match (state, step) {
        (_, Step::Close) => Ok(Closed),
        (Closed, _) => Err(Error::Closed),

        (New | Stable, Step::LocalOffer) => Ok(HaveLocalOffer),
        (New | Stable, Step::RemoteOffer) => Ok(HaveRemoteOffer),
        (HaveLocalOffer, Step::RemoteOffer) => Err(Error::negotiation(
            "glare: remote offer received while a local offer is outstanding",
        )),
        (HaveLocalOffer, Step::RemoteAnswer) => Ok(HaveRemoteAnswer),
        (HaveRemoteAnswer, Step::RemoteAnswerApplied) => Ok(Stable),
        (HaveRemoteOffer, Step::LocalAnswer) => Ok(HaveLocalAnswer),
        (HaveLocalAnswer, Step::LocalAnswerApplied) => Ok(Stable),

        (HaveLocalOffer | HaveRemoteOffer, Step::Rollback { last_stable }) if last_stable.is_stable() => {
            Ok(last_stable)
        }

        (state, step) => Err(Error::negotiation(format!("cannot {} in state {}", step, state))),
    }
}
