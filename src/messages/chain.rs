//! Types crossing the boundary to the chain layer: watcher events we
//! consume and transaction requests we produce. The contracts themselves
//! are external collaborators; only their interface shape lives here.

use crate::channel::{Channel, Destination, Outcome, SignedState, State};
use crate::{encode, Address, Hash, Signature, U256};
use alloc::vec::Vec;

/// Events reported by the chain watcher.
///
/// The watcher may replay events after a reconnect; every consumer must
/// treat them as idempotent.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Deposited {
        destination: Hash,
        amount_deposited: U256,
        /// Total now held for the destination, after this deposit. This is
        /// what funding decisions are based on, not the increment.
        destination_holdings: U256,
    },
    AssetTransferred {
        channel_id: Hash,
        destination: Destination,
        amount: U256,
    },
    ChallengeRegistered {
        channel_id: Hash,
        challenger: Address,
        /// Challenge expiry as a unix timestamp.
        finalizes_at: u64,
        /// The state(s) the challenger submitted, latest last.
        challenge_states: Vec<SignedState>,
    },
    ChallengeCleared {
        channel_id: Hash,
        new_turn_num_record: u64,
    },
    Concluded {
        channel_id: Hash,
    },
}

/// The part of a state that never changes over the channel's lifetime,
/// submitted once per transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPart {
    pub channel: Channel,
    pub app_definition: Address,
    pub challenge_duration: u64,
}

/// The per-turn part of a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablePart {
    pub turn_num: u64,
    pub is_final: bool,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
}

impl From<&State> for FixedPart {
    fn from(state: &State) -> Self {
        FixedPart {
            channel: state.channel.clone(),
            app_definition: state.app_definition,
            challenge_duration: state.challenge_duration,
        }
    }
}

impl From<&State> for VariablePart {
    fn from(state: &State) -> Self {
        VariablePart {
            turn_num: state.turn_num(),
            is_final: state.is_final,
            outcome: state.outcome.clone(),
            app_data: state.app_data.clone(),
        }
    }
}

/// A support proof: the states and signatures a transaction submits,
/// with `who_signed_what[i]` giving the index into `variable_parts` that
/// participant `i`'s signature covers.
#[derive(Debug, Clone)]
pub struct SupportProof {
    pub fixed_part: FixedPart,
    pub variable_parts: Vec<VariablePart>,
    pub signatures: Vec<Signature>,
    pub who_signed_what: Vec<u8>,
}

impl SupportProof {
    /// Proof from a single fully signed state: everyone signed state 0.
    pub fn from_supported_state(signed: &SignedState) -> Self {
        let n = signed.state().channel.num_participants();
        SupportProof {
            fixed_part: signed.state().into(),
            variable_parts: alloc::vec![signed.state().into()],
            signatures: signed.signatures().to_vec(),
            who_signed_what: alloc::vec![0; n],
        }
    }
}

/// Transaction requests handed to the host for submission. The core never
/// talks to a node itself; these are structured argument bundles.
#[derive(Debug, Clone)]
pub enum TransactionRequest {
    Deposit {
        destination: Hash,
        /// Holdings we observed before our deposit; the asset holder
        /// rejects the deposit if its holdings moved in between, which
        /// protects against double-deposits on replays.
        expected_held: U256,
        amount: U256,
    },
    ForceMove {
        proof: SupportProof,
        challenger_signature: Signature,
    },
    Respond {
        channel_id: Hash,
        response_fixed_part: FixedPart,
        response_variable_part: VariablePart,
        signature: Signature,
    },
    Checkpoint {
        proof: SupportProof,
    },
    Conclude {
        proof: SupportProof,
    },
    Transfer {
        channel_id: Hash,
        destination: Destination,
        amount: U256,
    },
    TransferAll {
        channel_id: Hash,
    },
}

impl TransactionRequest {
    /// Channel the transaction concerns, for routing and logging.
    pub fn channel_id(&self) -> Result<Hash, encode::Error> {
        match self {
            TransactionRequest::Deposit { destination, .. } => Ok(*destination),
            TransactionRequest::ForceMove { proof, .. }
            | TransactionRequest::Checkpoint { proof }
            | TransactionRequest::Conclude { proof } => proof.fixed_part.channel.id(),
            TransactionRequest::Respond { channel_id, .. }
            | TransactionRequest::Transfer { channel_id, .. }
            | TransactionRequest::TransferAll { channel_id } => Ok(*channel_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AllocationItem;
    use crate::sig::Signer;
    use alloc::vec;
    use rand::{rngs::StdRng, SeedableRng};

    fn supported_state() -> (SignedState, Hash) {
        let mut rng = StdRng::seed_from_u64(81);
        let alice = Signer::new(&mut rng);
        let bob = Signer::new(&mut rng);
        let channel = Channel {
            chain_id: U256::from(1),
            participants: vec![alice.address(), bob.address()],
            channel_nonce: U256::from(3),
        };
        let outcome = Outcome::Allocation(vec![AllocationItem {
            destination: Destination::from_address(alice.address()),
            amount: U256::from(9),
        }]);
        let state = State::new(channel, outcome, Address::default(), vec![], 60);
        let id = state.channel_id().unwrap();
        let hash = state.hash().unwrap();
        let signed =
            SignedState::from_parts(state, vec![alice.sign_eth(hash), bob.sign_eth(hash)]);
        (signed, id)
    }

    #[test]
    fn transaction_requests_report_the_channel_they_act_on() {
        let (signed, id) = supported_state();
        let proof = SupportProof::from_supported_state(&signed);

        let conclude = TransactionRequest::Conclude {
            proof: proof.clone(),
        };
        assert_eq!(conclude.channel_id().unwrap(), id);

        let checkpoint = TransactionRequest::Checkpoint { proof };
        assert_eq!(checkpoint.channel_id().unwrap(), id);

        let deposit = TransactionRequest::Deposit {
            destination: id,
            expected_held: U256::from(0),
            amount: U256::from(9),
        };
        assert_eq!(deposit.channel_id().unwrap(), id);

        let transfer = TransactionRequest::TransferAll { channel_id: id };
        assert_eq!(transfer.channel_id().unwrap(), id);
    }
}
