//! Message types crossing the protocol core's boundaries: events consumed
//! from the chain layer, transaction requests produced for it, messages
//! exchanged between participants and the host-facing API surface.

pub mod api;
mod chain;

pub use chain::*;

use crate::channel::SignedState;
use crate::{Address, Hash, U256};
use alloc::string::String;
use alloc::vec::Vec;

use api::ChannelResult;

/// Channel configuration sent to the other participants when proposing a
/// channel. Carries everything a peer needs to reconstruct the pre-fund
/// setup state and decide whether to join.
#[derive(Debug, Clone)]
pub struct ChannelProposal {
    pub signed_state: SignedState,
    pub funding_strategy: api::FundingStrategy,
}

/// Messages sent between participants of a channel.
#[derive(Debug, Clone)]
pub enum ParticipantMessage {
    ChannelProposal(ChannelProposal),
    /// Freshly signed or countersigned states. Several states may travel
    /// together, e.g. post-fund setup plus a first application update.
    SignedStates(Vec<SignedState>),
    ProposalRejected {
        channel_id: Hash,
        reason: String,
    },
    UpdateRejected {
        channel_id: Hash,
        turn_num: u64,
        reason: String,
    },
}

/// Notifications emitted towards the host, to be forwarded to the wallet
/// user or put on the wire.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A message for another participant is ready to be delivered.
    MessageQueued {
        sender: Address,
        recipient: Address,
        message: ParticipantMessage,
    },
    ChannelProposed(ChannelResult),
    ChannelUpdated(ChannelResult),
    BudgetUpdated {
        free_send_capacity: U256,
        free_receive_capacity: U256,
    },
    /// We signed a state; the embedding application may act on it.
    StateSigned {
        channel_id: Hash,
        turn_num: u64,
    },
    /// Signing a locally produced state failed. Recoverable: the protocol
    /// state is unchanged and the caller may retry with corrected input.
    SigningFailed {
        channel_id: Hash,
        reason: String,
    },
    /// An opponent state passed validation and was stored.
    ValidationSucceeded {
        channel_id: Hash,
        turn_num: u64,
    },
    /// An opponent state was rejected; the protocol state is unchanged.
    ValidationFailed {
        channel_id: Hash,
        reason: String,
    },
    /// A funding or dispute protocol reached a terminal failure.
    ProtocolFailed {
        channel_id: Hash,
        reason: String,
    },
}
