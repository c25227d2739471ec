use alloc::vec;
use log::{debug, warn};

use super::{Effect, Effects, SharedData};
use crate::channel::SignedState;
use crate::messages::{SupportProof, TransactionRequest};
use crate::Hash;

/// Actions driving a [Dispute], derived from chain watcher events plus
/// the host clock.
#[derive(Debug, Clone)]
pub enum DisputeAction {
    ChallengeRegistered {
        channel_id: Hash,
        finalizes_at: u64,
    },
    ChallengeCleared {
        channel_id: Hash,
    },
    /// The host clock passed the challenge expiry.
    ChallengeExpired {
        channel_id: Hash,
        now: u64,
    },
    Concluded {
        channel_id: Hash,
    },
    TransactionFailed {
        channel_id: Hash,
    },
}

impl DisputeAction {
    fn channel_id(&self) -> Hash {
        match self {
            DisputeAction::ChallengeRegistered { channel_id, .. }
            | DisputeAction::ChallengeCleared { channel_id }
            | DisputeAction::ChallengeExpired { channel_id, .. }
            | DisputeAction::Concluded { channel_id }
            | DisputeAction::TransactionFailed { channel_id } => *channel_id,
        }
    }
}

/// Terminal result of a dispute, named from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeOutcome {
    /// Our challenge was answered with a newer state; the channel lives on.
    ChallengingSuccessOpen,
    /// Our challenge expired unanswered; the channel finalized with the
    /// state we submitted.
    ChallengingSuccessClosed,
    ChallengingFailure,
    /// The challenge against us was cleared.
    RespondingSuccess,
    /// The challenge expired before a valid response landed.
    RespondingFailure,
}

/// On-chain dispute, either raised by us or answered by us.
///
/// A challenge carries the challenger's latest supported state. The
/// response rule is a pure function of the challenge state's turn number:
/// we owe a response exactly when `turn_num % n != our_index`, i.e. when
/// the newest state on-chain is not our own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispute {
    /// Our forceMove transaction is out; waiting for the registration
    /// event.
    WaitForChallengeRegistration { channel_id: Hash },
    /// Challenge registered; waiting for a response or the timeout.
    WaitForResponseOrTimeout {
        channel_id: Hash,
        finalizes_at: u64,
    },
    /// Our response or checkpoint transaction is out.
    WaitForResponseConfirmation {
        channel_id: Hash,
        finalizes_at: u64,
    },
    /// We owe no response; waiting for the challenge to resolve.
    WaitForChallengeResolution {
        channel_id: Hash,
        finalizes_at: u64,
    },
    Done {
        channel_id: Hash,
        outcome: DisputeOutcome,
    },
}

impl Dispute {
    /// Raise a challenge with the channel's latest supported state.
    pub fn challenge(channel_id: Hash, shared: &mut SharedData) -> (Self, Effects) {
        let supported = match shared.store.latest_supported_signed_state(channel_id) {
            Ok(signed) => signed,
            Err(e) => {
                warn!("dispute: nothing to challenge with for {:?}: {:?}", channel_id, e);
                return (
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::ChallengingFailure,
                    },
                    vec![],
                );
            }
        };
        let hash = match supported.state().hash() {
            Ok(hash) => hash,
            Err(_) => {
                return (
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::ChallengingFailure,
                    },
                    vec![],
                )
            }
        };
        debug!(
            "dispute: challenging {:?} with turn {}",
            channel_id,
            supported.state().turn_num()
        );
        let challenger_signature = shared.store.signer().sign_eth(hash);
        (
            Dispute::WaitForChallengeRegistration { channel_id },
            vec![Effect::Transaction(TransactionRequest::ForceMove {
                proof: SupportProof::from_supported_state(&supported),
                challenger_signature,
            })],
        )
    }

    /// React to a challenge registered against one of our channels.
    ///
    /// Stores whatever challenge states are newer than our history, then
    /// decides: checkpoint with a later supported state, respond with the
    /// next turn if it is ours to sign, or wait for another participant's
    /// response.
    pub fn respond(
        channel_id: Hash,
        finalizes_at: u64,
        challenge_states: &[SignedState],
        shared: &mut SharedData,
    ) -> (Self, Effects) {
        // catch up on states we may have missed; stale ones are rejected
        // by the store and ignored here
        for signed in challenge_states {
            let _ = shared.store.check_and_store(signed.clone());
        }

        let challenge = match challenge_states.last() {
            Some(signed) => signed.state().clone(),
            None => {
                return (
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::RespondingFailure,
                    },
                    vec![],
                )
            }
        };
        let (our_index, n) = match shared.store.entry(channel_id) {
            Ok(entry) => (entry.our_index(), entry.channel().num_participants()),
            Err(_) => {
                return (
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::RespondingFailure,
                    },
                    vec![],
                )
            }
        };

        if challenge.turn_num() % n as u64 == our_index as u64 {
            // the newest state on-chain is our own; someone else moves
            debug!("dispute: no response owed for {:?}", channel_id);
            return (
                Dispute::WaitForChallengeResolution {
                    channel_id,
                    finalizes_at,
                },
                vec![],
            );
        }

        // a later supported state beats any response
        if let Ok(supported) = shared.store.latest_supported_signed_state(channel_id) {
            if supported.state().turn_num() > challenge.turn_num() {
                debug!(
                    "dispute: checkpointing {:?} with turn {}",
                    channel_id,
                    supported.state().turn_num()
                );
                return (
                    Dispute::WaitForResponseConfirmation {
                        channel_id,
                        finalizes_at,
                    },
                    vec![Effect::Transaction(TransactionRequest::Checkpoint {
                        proof: SupportProof::from_supported_state(&supported),
                    })],
                );
            }
        }

        let next = challenge.next();
        if next.mover() != our_index {
            // another participant owes the actual move
            return (
                Dispute::WaitForChallengeResolution {
                    channel_id,
                    finalizes_at,
                },
                vec![],
            );
        }
        let hash = match next.hash() {
            Ok(hash) => hash,
            Err(_) => {
                return (
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::RespondingFailure,
                    },
                    vec![],
                )
            }
        };
        let signature = shared.store.signer().sign_eth(hash);
        // mirror the response into our own history
        let _ = shared
            .store
            .check_and_store(SignedState::from_parts(next.clone(), vec![signature]));

        debug!(
            "dispute: responding on {:?} with turn {}",
            channel_id,
            next.turn_num()
        );
        (
            Dispute::WaitForResponseConfirmation {
                channel_id,
                finalizes_at,
            },
            vec![Effect::Transaction(TransactionRequest::Respond {
                channel_id,
                response_fixed_part: (&next).into(),
                response_variable_part: (&next).into(),
                signature,
            })],
        )
    }

    pub fn channel_id(&self) -> Hash {
        match self {
            Dispute::WaitForChallengeRegistration { channel_id }
            | Dispute::WaitForResponseOrTimeout { channel_id, .. }
            | Dispute::WaitForResponseConfirmation { channel_id, .. }
            | Dispute::WaitForChallengeResolution { channel_id, .. }
            | Dispute::Done { channel_id, .. } => *channel_id,
        }
    }

    pub fn outcome(&self) -> Option<DisputeOutcome> {
        match self {
            Dispute::Done { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }

    pub fn reduce(self, action: DisputeAction) -> (Self, Effects) {
        if action.channel_id() != self.channel_id() {
            return (self, vec![]);
        }

        let next = match self {
            Dispute::WaitForChallengeRegistration { channel_id } => match action {
                DisputeAction::ChallengeRegistered { finalizes_at, .. } => {
                    Dispute::WaitForResponseOrTimeout {
                        channel_id,
                        finalizes_at,
                    }
                }
                // someone concluded before our challenge landed
                DisputeAction::Concluded { .. } => Dispute::Done {
                    channel_id,
                    outcome: DisputeOutcome::ChallengingSuccessClosed,
                },
                DisputeAction::TransactionFailed { .. } => Dispute::Done {
                    channel_id,
                    outcome: DisputeOutcome::ChallengingFailure,
                },
                _ => Dispute::WaitForChallengeRegistration { channel_id },
            },

            Dispute::WaitForResponseOrTimeout {
                channel_id,
                finalizes_at,
            } => match action {
                DisputeAction::ChallengeCleared { .. } => Dispute::Done {
                    channel_id,
                    outcome: DisputeOutcome::ChallengingSuccessOpen,
                },
                DisputeAction::ChallengeExpired { now, .. } if now >= finalizes_at => {
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::ChallengingSuccessClosed,
                    }
                }
                DisputeAction::Concluded { .. } => Dispute::Done {
                    channel_id,
                    outcome: DisputeOutcome::ChallengingSuccessClosed,
                },
                _ => Dispute::WaitForResponseOrTimeout {
                    channel_id,
                    finalizes_at,
                },
            },

            Dispute::WaitForResponseConfirmation {
                channel_id,
                finalizes_at,
            } => match action {
                DisputeAction::ChallengeCleared { .. } => Dispute::Done {
                    channel_id,
                    outcome: DisputeOutcome::RespondingSuccess,
                },
                DisputeAction::ChallengeExpired { now, .. } if now >= finalizes_at => {
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::RespondingFailure,
                    }
                }
                DisputeAction::Concluded { .. } | DisputeAction::TransactionFailed { .. } => {
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::RespondingFailure,
                    }
                }
                _ => Dispute::WaitForResponseConfirmation {
                    channel_id,
                    finalizes_at,
                },
            },

            Dispute::WaitForChallengeResolution {
                channel_id,
                finalizes_at,
            } => match action {
                DisputeAction::ChallengeCleared { .. } => Dispute::Done {
                    channel_id,
                    outcome: DisputeOutcome::RespondingSuccess,
                },
                DisputeAction::ChallengeExpired { now, .. } if now >= finalizes_at => {
                    Dispute::Done {
                        channel_id,
                        outcome: DisputeOutcome::RespondingFailure,
                    }
                }
                DisputeAction::Concluded { .. } => Dispute::Done {
                    channel_id,
                    outcome: DisputeOutcome::RespondingFailure,
                },
                _ => Dispute::WaitForChallengeResolution {
                    channel_id,
                    finalizes_at,
                },
            },

            done @ Dispute::Done { .. } => done,
        };
        (next, vec![])
    }
}
