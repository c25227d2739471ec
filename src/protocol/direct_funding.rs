use alloc::vec;
use alloc::vec::Vec;
use log::debug;

use super::{Effect, Effects, FailureReason};
use crate::channel::{Outcome, PartIdx, State};
use crate::messages::{ChainEvent, TransactionRequest};
use crate::{Hash, U256};

/// How much we owe a channel on-chain and when it becomes safe to pay.
///
/// Participants deposit in allocation order. Depositing before everyone
/// ahead of us has paid would let them walk away with our funds, so our
/// safety threshold is the sum of all allocations ordered before ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositPlan {
    pub channel_id: Hash,
    /// Holdings that must exist before our own deposit is safe.
    pub safety_threshold: U256,
    /// Our own contribution.
    pub deposit_amount: U256,
    /// Holdings at which the channel counts as fully funded.
    pub full_funding: U256,
}

impl DepositPlan {
    /// Derive the plan from a pre-fund setup state. Our slice is the
    /// allocation item paying out to our own address; a participant
    /// without one deposits nothing.
    pub fn from_state(state: &State, our_index: PartIdx) -> Result<Self, FailureReason> {
        let channel_id = state.channel_id().map_err(|_| FailureReason::Store)?;
        let items = match &state.outcome {
            Outcome::Allocation(items) => items,
            Outcome::Guarantee { .. } => return Err(FailureReason::Store),
        };
        let our_addr = *state
            .channel
            .participants
            .get(our_index)
            .ok_or(FailureReason::Store)?;
        let ours = crate::channel::Destination::from_address(our_addr);

        let mut safety_threshold = U256::zero();
        let mut deposit_amount = U256::zero();
        for item in items {
            if item.destination == ours {
                deposit_amount = item.amount;
                break;
            }
            safety_threshold = safety_threshold + item.amount;
        }
        Ok(DepositPlan {
            channel_id,
            safety_threshold,
            deposit_amount,
            full_funding: state.outcome.total(),
        })
    }
}

/// Direct on-chain funding of a single channel.
///
/// Driven purely by [ChainEvent::Deposited] events for our channel. The
/// watcher may replay events; every transition here is monotonic, so a
/// replayed event is absorbed without emitting a second deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectFunding {
    /// Participants ahead of us have not deposited enough yet.
    NotSafeToDeposit { plan: DepositPlan },
    /// Our deposit (if any) is on its way; waiting for full funding.
    WaitForFullFunding { plan: DepositPlan },
    Success { channel_id: Hash },
    Failure { channel_id: Hash, reason: FailureReason },
}

impl DirectFunding {
    /// Start funding. If our deposit is safe right away (we are first in
    /// the allocation order) the deposit transaction is emitted
    /// immediately.
    pub fn new(plan: DepositPlan) -> (Self, Effects) {
        if plan.safety_threshold.is_zero() {
            Self::deposit_and_wait(plan, U256::zero())
        } else {
            (DirectFunding::NotSafeToDeposit { plan }, vec![])
        }
    }

    pub fn channel_id(&self) -> Hash {
        match self {
            DirectFunding::NotSafeToDeposit { plan }
            | DirectFunding::WaitForFullFunding { plan } => plan.channel_id,
            DirectFunding::Success { channel_id }
            | DirectFunding::Failure { channel_id, .. } => *channel_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DirectFunding::Success { .. } | DirectFunding::Failure { .. })
    }

    /// Feed a chain event. Events for other channels and events that do
    /// not unlock a transition are absorbed unchanged.
    pub fn reduce(self, event: &ChainEvent) -> (Self, Effects) {
        let holdings = match event {
            ChainEvent::Deposited {
                destination,
                destination_holdings,
                ..
            } if *destination == self.channel_id() => *destination_holdings,
            _ => return (self, vec![]),
        };

        match self {
            DirectFunding::NotSafeToDeposit { plan } => {
                if holdings >= plan.full_funding {
                    // everyone else overfunded us; nothing left to pay
                    debug!("direct funding complete for {:?}", plan.channel_id);
                    (
                        DirectFunding::Success {
                            channel_id: plan.channel_id,
                        },
                        vec![],
                    )
                } else if holdings >= plan.safety_threshold {
                    Self::deposit_and_wait(plan, holdings)
                } else {
                    (DirectFunding::NotSafeToDeposit { plan }, vec![])
                }
            }
            DirectFunding::WaitForFullFunding { plan } => {
                if holdings >= plan.full_funding {
                    debug!("direct funding complete for {:?}", plan.channel_id);
                    (
                        DirectFunding::Success {
                            channel_id: plan.channel_id,
                        },
                        vec![],
                    )
                } else {
                    (DirectFunding::WaitForFullFunding { plan }, vec![])
                }
            }
            terminal => (terminal, vec![]),
        }
    }

    fn deposit_and_wait(plan: DepositPlan, held_now: U256) -> (Self, Effects) {
        let mut effects: Effects = Vec::new();
        if !plan.deposit_amount.is_zero() {
            effects.push(Effect::Transaction(TransactionRequest::Deposit {
                destination: plan.channel_id,
                expected_held: held_now,
                amount: plan.deposit_amount,
            }));
        }
        (DirectFunding::WaitForFullFunding { plan }, effects)
    }
}
