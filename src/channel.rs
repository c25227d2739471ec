//! Channel data model and the validated signed-state store.
//!
//! A [Channel] names the fixed parameters, a [State] is one point in the
//! channel's timeline, a [SignedState] carries the signatures collected
//! for it and the [ChannelStore] decides which incoming states are
//! accepted according to the turn-taking and signature rules.

mod signed;
mod state;
mod store;

pub use signed::*;
pub use state::*;
pub use store::*;

/// Index of a participant in the channel.
///
/// `0` is the proposer of the channel and the mover of turn 0.
pub type PartIdx = usize;
