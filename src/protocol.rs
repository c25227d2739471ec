//! Protocol state machines driving a channel from proposal through
//! funding, updates and disputes to conclusion.
//!
//! Every protocol is a closed enum over its phases. Reducers consume the
//! state by value and return the successor plus an ordered list of
//! [Effect]s; the host applies the effects (send messages, submit
//! transactions, surface notifications) and feeds the next external
//! action back in. The core performs no I/O and never blocks: waiting is
//! a phase that simply absorbs actions until the matching one arrives.

mod application;
mod direct_funding;
mod dispute;
mod ledger_funding;
mod virtual_funding;

pub use application::*;
pub use direct_funding::*;
pub use dispute::*;
pub use ledger_funding::*;
pub use virtual_funding::*;

use crate::channel::{ChannelStore, SignedState, State, StoreError};
use crate::messages::{Notification, ParticipantMessage, TransactionRequest};
use crate::Address;
use alloc::vec;
use alloc::vec::Vec;
use log::warn;

/// The single mutable resource all protocols read and write.
///
/// Threaded explicitly through every reducer as `&mut SharedData`; there
/// is no ambient store. One reducer call holds the one mutable borrow,
/// which makes the single-writer discipline a compile time property.
#[derive(Debug)]
pub struct SharedData {
    pub store: ChannelStore,
}

impl SharedData {
    pub fn new(store: ChannelStore) -> Self {
        SharedData { store }
    }
}

/// Ordered side effect emitted by a reducer step.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Deliver a message to another participant.
    Message {
        recipient: Address,
        message: ParticipantMessage,
    },
    /// Submit a transaction to the chain.
    Transaction(TransactionRequest),
    /// Surface a notification to the host.
    Notify(Notification),
}

pub type Effects = Vec<Effect>;

/// One [Effect::Message] per participant other than ourselves.
pub(crate) fn messages_to_peers(
    channel: &crate::channel::Channel,
    our_index: crate::channel::PartIdx,
    message: ParticipantMessage,
) -> Effects {
    channel
        .participants
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != our_index)
        .map(|(_, addr)| Effect::Message {
            recipient: *addr,
            message: message.clone(),
        })
        .collect()
}

/// One round of everyone-signs-the-same-state consensus.
///
/// Stores the incoming signed state (absorbing duplicate deliveries),
/// adds our own signature if missing and reports whether the state is now
/// supported. Anything other than the agreed state is a competing
/// proposal and rejected.
fn consensus_round(
    expected: &State,
    signed: SignedState,
    shared: &mut SharedData,
) -> Result<(bool, Effects), FailureReason> {
    let channel_id = expected.channel_id().map_err(|_| FailureReason::Store)?;
    if signed.state() != expected {
        warn!("consensus round: competing state for {:?}", channel_id);
        return Err(FailureReason::Rejected);
    }
    match shared.store.check_and_store(signed) {
        Ok(()) => {}
        // stale duplicate, nothing new
        Err(StoreError::InvalidTransition) => {}
        Err(e) => {
            warn!("consensus round: store rejected state: {:?}", e);
            return Err(FailureReason::Store);
        }
    }

    let (our_index, channel, we_signed) = {
        let entry = shared
            .store
            .entry(channel_id)
            .map_err(|_| FailureReason::Store)?;
        let we_signed = match entry.latest() {
            Some(latest) => latest
                .signed_by(entry.our_index(), shared.store.signer())
                .map_err(|_| FailureReason::Store)?,
            None => false,
        };
        (entry.our_index(), entry.channel().clone(), we_signed)
    };

    let mut effects = vec![];
    if !we_signed {
        let signed = shared
            .store
            .sign_and_store(expected.clone())
            .map_err(|_| FailureReason::Store)?;
        effects = messages_to_peers(
            &channel,
            our_index,
            ParticipantMessage::SignedStates(vec![signed]),
        );
    }
    let supported = shared.store.latest_supported_state(channel_id).as_ref() == Ok(expected);
    Ok((supported, effects))
}

/// Reason carried by terminal `Failure` states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The counterpart rejected a proposal or consensus update.
    Rejected,
    /// A required channel failed to fund.
    FundingFailed,
    /// A dispute expired without a valid response.
    ChallengeExpired,
    /// Required store data was missing or invalid.
    Store,
}
