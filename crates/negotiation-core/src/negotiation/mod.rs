//! Offer/answer negotiation

pub(crate) mod machine;
pub mod state;

pub use state::{next_state, NegotiationState, NegotiationStep};
