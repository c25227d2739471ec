use alloc::vec;
use alloc::vec::Vec;
use log::{debug, warn};

use super::{
    consensus_round, messages_to_peers, DepositPlan, DirectFunding, Effects, FailureReason,
    SharedData,
};
use crate::channel::{
    AllocationItem, Destination, Funding, Outcome, SignedState, State, StoreError,
};
use crate::messages::{ChainEvent, ParticipantMessage};
use crate::Hash;

/// Actions driving a [LedgerFunding] protocol, routed by the host from
/// peer messages and chain events concerning the ledger channel.
#[derive(Debug, Clone)]
pub enum LedgerFundingAction {
    /// A signed ledger-channel state: the pre-fund setup while a fresh
    /// ledger channel is being opened, the funding update afterwards.
    StateReceived(SignedState),
    /// Deposit progress of a freshly opened ledger channel.
    Deposited(ChainEvent),
    UpdateRejected,
}

/// Funds a channel out of a ledger channel with the same peers.
///
/// With an existing funded ledger channel there is no chain interaction:
/// both parties sign one ledger update that moves the target's full
/// funding from their ledger balances to the target's channel id. Without
/// one, the protocol first opens a fresh two-party ledger channel (its
/// own pre-fund setup round plus direct on-chain funding) and then runs
/// the same update against it.
#[derive(Debug, Clone)]
pub enum LedgerFunding {
    /// Collecting signatures on a fresh ledger channel's setup state.
    WaitForLedgerChannel {
        target_id: Hash,
        ledger_id: Hash,
        /// The setup state every participant must sign.
        ledger0: State,
        contributions: Vec<AllocationItem>,
    },
    /// Depositing into the fresh ledger channel on-chain.
    WaitForLedgerDeposit {
        target_id: Hash,
        ledger_id: Hash,
        contributions: Vec<AllocationItem>,
        inner: DirectFunding,
        /// Funding updates that overtook our chain watcher.
        queued: Vec<SignedState>,
    },
    WaitForLedgerUpdate {
        target_id: Hash,
        ledger_id: Hash,
        /// The exact ledger state both parties must sign.
        expected: State,
    },
    Success { channel_id: Hash },
    Failure { channel_id: Hash, reason: FailureReason },
}

impl LedgerFunding {
    /// Start funding a directly allocated channel from an existing ledger
    /// channel. The contributions are the target's own allocations.
    pub fn new(target: &State, ledger_id: Hash, shared: &mut SharedData) -> (Self, Effects) {
        let (target_id, contributions) = match Self::target_parts(target) {
            Ok(parts) => parts,
            Err((id, reason)) => return Self::fail(id, reason, vec![]),
        };
        Self::with_contributions(target_id, &contributions, ledger_id, shared)
    }

    /// Open a fresh two-party ledger channel and fund the target out of
    /// it. Registers the ledger channel in the store and, if we are the
    /// setup state's mover, puts our signature on the wire; the deposit
    /// and update phases follow once the setup is supported.
    pub fn open(target: &State, ledger0: State, shared: &mut SharedData) -> (Self, Effects) {
        let (target_id, contributions) = match Self::target_parts(target) {
            Ok(parts) => parts,
            Err((id, reason)) => return Self::fail(id, reason, vec![]),
        };
        let ledger_id = match ledger0.channel_id() {
            Ok(id) => id,
            Err(_) => return Self::fail(target_id, FailureReason::Store, vec![]),
        };
        let our_index = match ledger0.channel.index_of(shared.store.signer().address()) {
            Some(i) => i,
            None => return Self::fail(target_id, FailureReason::Store, vec![]),
        };
        if shared
            .store
            .initialize(ledger0.channel.clone(), our_index)
            .is_err()
        {
            return Self::fail(target_id, FailureReason::Store, vec![]);
        }

        let mut effects = vec![];
        if ledger0.mover() == our_index {
            match shared.store.sign_and_store(ledger0.clone()) {
                Ok(signed) => {
                    effects = messages_to_peers(
                        &ledger0.channel,
                        our_index,
                        ParticipantMessage::SignedStates(vec![signed]),
                    );
                }
                Err(e) => {
                    warn!("ledger funding: signing ledger setup failed: {:?}", e);
                    return Self::fail(target_id, FailureReason::Store, vec![]);
                }
            }
        }
        (
            LedgerFunding::WaitForLedgerChannel {
                target_id,
                ledger_id,
                ledger0,
                contributions,
            },
            effects,
        )
    }

    /// Start funding `target_id` from the ledger channel, deducting the
    /// given contributions from the ledger balances. Derives the funding
    /// update from the ledger's latest supported state; if we are the
    /// update's mover it is signed and sent right away, otherwise we wait
    /// for the peer's proposal.
    pub fn with_contributions(
        target_id: Hash,
        contributions: &[AllocationItem],
        ledger_id: Hash,
        shared: &mut SharedData,
    ) -> (Self, Effects) {
        let ledger_state = match shared.store.latest_supported_state(ledger_id) {
            Ok(state) => state,
            Err(_) => return Self::fail(target_id, FailureReason::Store, vec![]),
        };
        let expected = match funding_update(&ledger_state, target_id, contributions) {
            Ok(state) => state,
            Err(reason) => return Self::fail(target_id, reason, vec![]),
        };

        let entry = match shared.store.entry(ledger_id) {
            Ok(entry) => entry,
            Err(_) => return Self::fail(target_id, FailureReason::Store, vec![]),
        };
        let our_index = entry.our_index();
        let channel = entry.channel().clone();

        let mut effects = vec![];
        if expected.mover() == our_index {
            match shared.store.sign_and_store(expected.clone()) {
                Ok(signed) => {
                    effects = messages_to_peers(
                        &channel,
                        our_index,
                        ParticipantMessage::SignedStates(vec![signed]),
                    );
                }
                Err(e) => {
                    warn!("ledger funding: signing update failed: {:?}", e);
                    return Self::fail(target_id, FailureReason::Store, vec![]);
                }
            }
        }
        (
            LedgerFunding::WaitForLedgerUpdate {
                target_id,
                ledger_id,
                expected,
            },
            effects,
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerFunding::Success { .. } | LedgerFunding::Failure { .. })
    }

    /// The ledger channel this protocol is still waiting on, for routing
    /// incoming states and deposits.
    pub fn ledger_id(&self) -> Option<Hash> {
        match self {
            LedgerFunding::WaitForLedgerChannel { ledger_id, .. }
            | LedgerFunding::WaitForLedgerDeposit { ledger_id, .. }
            | LedgerFunding::WaitForLedgerUpdate { ledger_id, .. } => Some(*ledger_id),
            _ => None,
        }
    }

    pub fn reduce(self, action: LedgerFundingAction, shared: &mut SharedData) -> (Self, Effects) {
        match self {
            LedgerFunding::WaitForLedgerChannel {
                target_id,
                ledger_id,
                ledger0,
                contributions,
            } => match action {
                LedgerFundingAction::UpdateRejected => {
                    Self::fail(target_id, FailureReason::Rejected, vec![])
                }
                LedgerFundingAction::StateReceived(signed) => {
                    match consensus_round(&ledger0, signed, shared) {
                        Ok((true, effects)) => Self::start_deposit(
                            target_id,
                            ledger_id,
                            &ledger0,
                            contributions,
                            shared,
                            effects,
                        ),
                        Ok((false, effects)) => (
                            LedgerFunding::WaitForLedgerChannel {
                                target_id,
                                ledger_id,
                                ledger0,
                                contributions,
                            },
                            effects,
                        ),
                        Err(reason) => Self::fail(target_id, reason, vec![]),
                    }
                }
                // nothing can land on-chain before the setup is supported
                LedgerFundingAction::Deposited(_) => (
                    LedgerFunding::WaitForLedgerChannel {
                        target_id,
                        ledger_id,
                        ledger0,
                        contributions,
                    },
                    vec![],
                ),
            },

            LedgerFunding::WaitForLedgerDeposit {
                target_id,
                ledger_id,
                contributions,
                inner,
                mut queued,
            } => match action {
                LedgerFundingAction::UpdateRejected => {
                    Self::fail(target_id, FailureReason::Rejected, vec![])
                }
                // the peer's funding update may overtake our chain watcher
                LedgerFundingAction::StateReceived(signed) => {
                    queued.push(signed);
                    (
                        LedgerFunding::WaitForLedgerDeposit {
                            target_id,
                            ledger_id,
                            contributions,
                            inner,
                            queued,
                        },
                        vec![],
                    )
                }
                LedgerFundingAction::Deposited(event) => {
                    let (inner, mut effects) = inner.reduce(&event);
                    match inner {
                        DirectFunding::Success { .. } => {
                            shared.store.set_funding(ledger_id, Funding::Direct);
                            let (mut next, more) = Self::with_contributions(
                                target_id,
                                &contributions,
                                ledger_id,
                                shared,
                            );
                            effects.extend(more);
                            for signed in queued {
                                let (n, more) = next
                                    .reduce(LedgerFundingAction::StateReceived(signed), shared);
                                next = n;
                                effects.extend(more);
                            }
                            (next, effects)
                        }
                        DirectFunding::Failure { reason, .. } => {
                            Self::fail(target_id, reason, effects)
                        }
                        pending => (
                            LedgerFunding::WaitForLedgerDeposit {
                                target_id,
                                ledger_id,
                                contributions,
                                inner: pending,
                                queued,
                            },
                            effects,
                        ),
                    }
                }
            },

            LedgerFunding::WaitForLedgerUpdate {
                target_id,
                ledger_id,
                expected,
            } => match action {
                LedgerFundingAction::UpdateRejected => {
                    Self::fail(target_id, FailureReason::Rejected, vec![])
                }
                // watcher replays after the ledger is already funded
                LedgerFundingAction::Deposited(_) => (
                    LedgerFunding::WaitForLedgerUpdate {
                        target_id,
                        ledger_id,
                        expected,
                    },
                    vec![],
                ),
                LedgerFundingAction::StateReceived(signed) => {
                    if signed.state() != &expected {
                        warn!(
                            "ledger funding: peer sent unexpected update for {:?}",
                            ledger_id
                        );
                        let effects = match shared.store.entry(ledger_id) {
                            Ok(entry) => messages_to_peers(
                                entry.channel(),
                                entry.our_index(),
                                ParticipantMessage::UpdateRejected {
                                    channel_id: ledger_id,
                                    turn_num: signed.state().turn_num(),
                                    reason: alloc::string::String::from(
                                        "not the agreed funding update",
                                    ),
                                },
                            ),
                            Err(_) => vec![],
                        };
                        return Self::fail(target_id, FailureReason::Rejected, effects);
                    }

                    match shared.store.check_and_store(signed) {
                        Ok(()) => {}
                        // stale duplicate, absorb and keep waiting
                        Err(StoreError::InvalidTransition) => {
                            return (
                                LedgerFunding::WaitForLedgerUpdate {
                                    target_id,
                                    ledger_id,
                                    expected,
                                },
                                vec![],
                            )
                        }
                        Err(e) => {
                            warn!("ledger funding: update rejected by store: {:?}", e);
                            return Self::fail(target_id, FailureReason::Store, vec![]);
                        }
                    }

                    // countersign unless our signature is already on it
                    let mut effects = vec![];
                    if shared.store.latest_supported_state(ledger_id) != Ok(expected.clone()) {
                        match shared.store.sign_and_store(expected.clone()) {
                            Ok(signed) => {
                                let entry = match shared.store.entry(ledger_id) {
                                    Ok(entry) => entry,
                                    Err(_) => {
                                        return Self::fail(target_id, FailureReason::Store, vec![])
                                    }
                                };
                                effects = messages_to_peers(
                                    entry.channel(),
                                    entry.our_index(),
                                    ParticipantMessage::SignedStates(vec![signed]),
                                );
                            }
                            Err(e) => {
                                warn!("ledger funding: countersigning failed: {:?}", e);
                                return Self::fail(target_id, FailureReason::Store, effects);
                            }
                        }
                    }

                    if shared.store.latest_supported_state(ledger_id) == Ok(expected.clone()) {
                        debug!(
                            "ledger funding complete: {:?} funded by {:?}",
                            target_id, ledger_id
                        );
                        shared
                            .store
                            .set_funding(target_id, Funding::Ledger { ledger_id });
                        return (LedgerFunding::Success { channel_id: target_id }, effects);
                    }
                    (
                        LedgerFunding::WaitForLedgerUpdate {
                            target_id,
                            ledger_id,
                            expected,
                        },
                        effects,
                    )
                }
            },

            terminal => (terminal, vec![]),
        }
    }

    /// The supported setup state unlocks the ledger channel's on-chain
    /// funding. Our deposit may go out immediately if we are first in the
    /// allocation order.
    fn start_deposit(
        target_id: Hash,
        ledger_id: Hash,
        ledger0: &State,
        contributions: Vec<AllocationItem>,
        shared: &mut SharedData,
        mut effects: Effects,
    ) -> (Self, Effects) {
        let our_index = match shared.store.entry(ledger_id) {
            Ok(entry) => entry.our_index(),
            Err(_) => return Self::fail(target_id, FailureReason::Store, effects),
        };
        let plan = match DepositPlan::from_state(ledger0, our_index) {
            Ok(plan) => plan,
            Err(reason) => return Self::fail(target_id, reason, effects),
        };
        let (inner, more) = DirectFunding::new(plan);
        effects.extend(more);
        (
            LedgerFunding::WaitForLedgerDeposit {
                target_id,
                ledger_id,
                contributions,
                inner,
                queued: vec![],
            },
            effects,
        )
    }

    fn target_parts(target: &State) -> Result<(Hash, Vec<AllocationItem>), (Hash, FailureReason)> {
        let target_id = target
            .channel_id()
            .map_err(|_| (Hash::default(), FailureReason::Store))?;
        match &target.outcome {
            Outcome::Allocation(items) => Ok((target_id, items.clone())),
            Outcome::Guarantee { .. } => Err((target_id, FailureReason::Store)),
        }
    }

    fn fail(channel_id: Hash, reason: FailureReason, effects: Effects) -> (Self, Effects) {
        (LedgerFunding::Failure { channel_id, reason }, effects)
    }
}

/// The ledger update that funds `target_id`: each contribution is
/// deducted from the matching ledger balance and the sum reallocated to
/// the target's channel id. The ledger's total is unchanged, so the
/// store's transition check goes through.
pub(super) fn funding_update(
    ledger: &State,
    target_id: Hash,
    contributions: &[AllocationItem],
) -> Result<State, FailureReason> {
    let mut items = match &ledger.outcome {
        Outcome::Allocation(items) => items.clone(),
        Outcome::Guarantee { .. } => return Err(FailureReason::Store),
    };

    let mut total = crate::U256::zero();
    for wanted in contributions {
        let slot = items
            .iter_mut()
            .find(|i| i.destination == wanted.destination)
            .ok_or(FailureReason::FundingFailed)?;
        if slot.amount < wanted.amount {
            return Err(FailureReason::FundingFailed);
        }
        slot.amount = slot.amount - wanted.amount;
        total = total + wanted.amount;
    }
    items.retain(|i| !i.amount.is_zero());
    items.push(AllocationItem {
        destination: Destination::from_channel(target_id),
        amount: total,
    });

    let mut next = ledger.next();
    next.outcome = Outcome::Allocation(items);
    Ok(next)
}
