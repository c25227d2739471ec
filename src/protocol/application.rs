use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use log::debug;

use super::{
    messages_to_peers, Dispute, DisputeAction, DisputeOutcome, Effect, Effects, FailureReason,
    SharedData,
};
use crate::channel::{PartIdx, SignedState, State, StoreError};
use crate::messages::{Notification, ParticipantMessage, SupportProof, TransactionRequest};
use crate::Hash;

/// Actions driving an [ApplicationProtocol].
#[derive(Debug, Clone)]
pub enum ApplicationAction {
    /// A state our side wants to sign and send, produced from a host
    /// request.
    OwnStateProduced(State),
    /// A signed state received from a peer.
    StateReceived(SignedState),
    /// The host asked us to take the channel on-chain.
    ChallengeRequested,
    /// A challenge against this channel was registered on-chain.
    ChallengeDetected {
        finalizes_at: u64,
        challenge_states: Vec<SignedState>,
    },
    Dispute(DisputeAction),
    /// The channel concluded on-chain.
    Concluded,
}

/// Lifecycle of one application channel, from the pre-fund handshake to
/// conclusion.
///
/// The off-chain happy path never leaves [ApplicationProtocol::Ongoing];
/// a dispute detours through [ApplicationProtocol::WaitForDispute] and
/// returns to `Ongoing` if the channel survives. All terminal states
/// absorb every further action, so replayed events cannot resurrect a
/// closed channel.
#[derive(Debug)]
pub enum ApplicationProtocol {
    /// Waiting for the pre-fund setup state to collect every signature.
    WaitForFirstState { channel_id: Hash },
    Ongoing { channel_id: Hash },
    WaitForDispute { channel_id: Hash, dispute: Dispute },
    Success { channel_id: Hash },
    Failure {
        channel_id: Hash,
        reason: FailureReason,
    },
}

impl ApplicationProtocol {
    /// Open a channel as its proposer (participant 0): sign the pre-fund
    /// setup state and send it to every peer.
    pub fn propose(state0: State, shared: &mut SharedData) -> Result<(Self, Effects), StoreError> {
        let channel = state0.channel.clone();
        let channel_id = shared.store.initialize(channel.clone(), 0)?;
        let signed = shared.store.sign_and_store(state0)?;

        let mut effects = messages_to_peers(
            &channel,
            0,
            ParticipantMessage::SignedStates(vec![signed.clone()]),
        );
        effects.push(Effect::Notify(Notification::StateSigned {
            channel_id,
            turn_num: 0,
        }));
        debug!("application: proposed channel {:?}", channel_id);
        Ok((ApplicationProtocol::WaitForFirstState { channel_id }, effects))
    }

    /// Join a channel someone else proposed: validate the pre-fund setup
    /// state, countersign it and send our signature to every peer.
    pub fn join(
        signed: SignedState,
        our_index: PartIdx,
        shared: &mut SharedData,
    ) -> Result<(Self, Effects), StoreError> {
        let state = signed.state().clone();
        let channel_id = shared.store.check_and_initialize(signed, our_index)?;
        let counter = shared.store.sign_and_store(state.clone())?;

        let supported = counter.is_supported(shared.store.signer());
        let mut effects = messages_to_peers(
            &state.channel,
            our_index,
            ParticipantMessage::SignedStates(vec![counter]),
        );
        effects.push(Effect::Notify(Notification::StateSigned {
            channel_id,
            turn_num: 0,
        }));
        debug!("application: joined channel {:?}", channel_id);
        let phase = if supported {
            ApplicationProtocol::Ongoing { channel_id }
        } else {
            ApplicationProtocol::WaitForFirstState { channel_id }
        };
        Ok((phase, effects))
    }

    pub fn channel_id(&self) -> Hash {
        match self {
            ApplicationProtocol::WaitForFirstState { channel_id }
            | ApplicationProtocol::Ongoing { channel_id }
            | ApplicationProtocol::WaitForDispute { channel_id, .. }
            | ApplicationProtocol::Success { channel_id }
            | ApplicationProtocol::Failure { channel_id, .. } => *channel_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationProtocol::Success { .. } | ApplicationProtocol::Failure { .. }
        )
    }

    pub fn reduce(self, action: ApplicationAction, shared: &mut SharedData) -> (Self, Effects) {
        match self {
            ApplicationProtocol::WaitForFirstState { channel_id } => match action {
                ApplicationAction::StateReceived(signed) => {
                    let (effects, accepted_turn) = Self::ingest(channel_id, signed, shared);
                    if accepted_turn.is_some()
                        && shared.store.latest_supported_state(channel_id).is_ok()
                    {
                        debug!("application: channel {:?} is running", channel_id);
                        return (ApplicationProtocol::Ongoing { channel_id }, effects);
                    }
                    (ApplicationProtocol::WaitForFirstState { channel_id }, effects)
                }
                ApplicationAction::ChallengeDetected {
                    finalizes_at,
                    challenge_states,
                } => Self::enter_dispute_response(
                    channel_id,
                    finalizes_at,
                    &challenge_states,
                    shared,
                ),
                ApplicationAction::Concluded => {
                    (ApplicationProtocol::Success { channel_id }, vec![])
                }
                _ => (ApplicationProtocol::WaitForFirstState { channel_id }, vec![]),
            },

            ApplicationProtocol::Ongoing { channel_id } => match action {
                ApplicationAction::OwnStateProduced(state) => {
                    let turn_num = state.turn_num();
                    match shared.store.sign_and_store(state) {
                        Ok(signed) => {
                            let entry = shared
                                .store
                                .entry(channel_id)
                                .expect("entry exists while the protocol runs");
                            let mut effects = messages_to_peers(
                                entry.channel(),
                                entry.our_index(),
                                ParticipantMessage::SignedStates(vec![signed]),
                            );
                            effects.push(Effect::Notify(Notification::StateSigned {
                                channel_id,
                                turn_num,
                            }));
                            effects.extend(Self::conclude_if_final(channel_id, shared));
                            (ApplicationProtocol::Ongoing { channel_id }, effects)
                        }
                        // recoverable: the host may retry with corrected input
                        Err(e) => (
                            ApplicationProtocol::Ongoing { channel_id },
                            vec![Effect::Notify(Notification::SigningFailed {
                                channel_id,
                                reason: format!("{:?}", e),
                            })],
                        ),
                    }
                }
                ApplicationAction::StateReceived(signed) => {
                    let (mut effects, accepted) = Self::ingest(channel_id, signed, shared);
                    if accepted.is_some() {
                        effects.extend(Self::conclude_if_final(channel_id, shared));
                    }
                    (ApplicationProtocol::Ongoing { channel_id }, effects)
                }
                ApplicationAction::ChallengeRequested => {
                    let (dispute, effects) = Dispute::challenge(channel_id, shared);
                    Self::settle_dispute(channel_id, dispute, effects)
                }
                ApplicationAction::ChallengeDetected {
                    finalizes_at,
                    challenge_states,
                } => Self::enter_dispute_response(
                    channel_id,
                    finalizes_at,
                    &challenge_states,
                    shared,
                ),
                ApplicationAction::Concluded => {
                    (ApplicationProtocol::Success { channel_id }, vec![])
                }
                ApplicationAction::Dispute(_) => {
                    (ApplicationProtocol::Ongoing { channel_id }, vec![])
                }
            },

            ApplicationProtocol::WaitForDispute { channel_id, dispute } => match action {
                ApplicationAction::Dispute(a) => {
                    let (dispute, effects) = dispute.reduce(a);
                    Self::settle_dispute(channel_id, dispute, effects)
                }
                // states keep flowing into the store during a dispute
                ApplicationAction::StateReceived(signed) => {
                    let (effects, _) = Self::ingest(channel_id, signed, shared);
                    (
                        ApplicationProtocol::WaitForDispute { channel_id, dispute },
                        effects,
                    )
                }
                ApplicationAction::Concluded => {
                    let (dispute, effects) =
                        dispute.reduce(DisputeAction::Concluded { channel_id });
                    Self::settle_dispute(channel_id, dispute, effects)
                }
                _ => (
                    ApplicationProtocol::WaitForDispute { channel_id, dispute },
                    vec![],
                ),
            },

            terminal => (terminal, vec![]),
        }
    }

    /// Validate a peer state into the store, reporting the result as a
    /// notification. Returns the accepted turn number, if any.
    fn ingest(
        channel_id: Hash,
        signed: SignedState,
        shared: &mut SharedData,
    ) -> (Effects, Option<u64>) {
        let turn_num = signed.state().turn_num();
        match shared.store.check_and_store(signed) {
            Ok(()) => (
                vec![Effect::Notify(Notification::ValidationSucceeded {
                    channel_id,
                    turn_num,
                })],
                Some(turn_num),
            ),
            Err(e) => (
                vec![Effect::Notify(Notification::ValidationFailed {
                    channel_id,
                    reason: format!("{:?}", e),
                })],
                None,
            ),
        }
    }

    /// A supported final state concludes the channel on-chain.
    fn conclude_if_final(channel_id: Hash, shared: &SharedData) -> Effects {
        match shared.store.latest_supported_signed_state(channel_id) {
            Ok(signed) if signed.state().is_final => {
                debug!("application: concluding {:?}", channel_id);
                vec![Effect::Transaction(TransactionRequest::Conclude {
                    proof: SupportProof::from_supported_state(&signed),
                })]
            }
            _ => vec![],
        }
    }

    fn enter_dispute_response(
        channel_id: Hash,
        finalizes_at: u64,
        challenge_states: &[SignedState],
        shared: &mut SharedData,
    ) -> (Self, Effects) {
        let (dispute, effects) =
            Dispute::respond(channel_id, finalizes_at, challenge_states, shared);
        Self::settle_dispute(channel_id, dispute, effects)
    }

    /// Map a dispute's progress onto the channel lifecycle.
    fn settle_dispute(channel_id: Hash, dispute: Dispute, mut effects: Effects) -> (Self, Effects) {
        match dispute.outcome() {
            None => (
                ApplicationProtocol::WaitForDispute { channel_id, dispute },
                effects,
            ),
            Some(DisputeOutcome::ChallengingSuccessOpen)
            | Some(DisputeOutcome::RespondingSuccess) => {
                debug!("application: dispute resolved, {:?} stays open", channel_id);
                (ApplicationProtocol::Ongoing { channel_id }, effects)
            }
            Some(DisputeOutcome::ChallengingSuccessClosed) => {
                effects.push(Effect::Transaction(TransactionRequest::TransferAll {
                    channel_id,
                }));
                (ApplicationProtocol::Success { channel_id }, effects)
            }
            Some(DisputeOutcome::ChallengingFailure) => {
                // the challenge transaction never landed, so the channel
                // is untouched on-chain; the host may retry
                effects.push(Effect::Notify(Notification::ProtocolFailed {
                    channel_id,
                    reason: format!("{:?}", DisputeOutcome::ChallengingFailure),
                }));
                (ApplicationProtocol::Ongoing { channel_id }, effects)
            }
            Some(DisputeOutcome::RespondingFailure) => {
                effects.push(Effect::Notify(Notification::ProtocolFailed {
                    channel_id,
                    reason: format!("{:?}", DisputeOutcome::RespondingFailure),
                }));
                (
                    ApplicationProtocol::Failure {
                        channel_id,
                        reason: FailureReason::ChallengeExpired,
                    },
                    effects,
                )
            }
        }
    }
}
