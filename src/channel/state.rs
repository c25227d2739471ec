use alloc::vec::Vec;
use serde::Serialize;

use super::PartIdx;
use crate::encode::{
    self, as_bytes,
    types::{Address, Bytes32, Hash, U256},
};

/// The fixed parameters identifying a channel.
///
/// Two channels with the same chain id, participant list and nonce are
/// the same channel: [Channel::id] is the hash of exactly these three
/// fields. Immutable once created.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub chain_id: U256,
    pub participants: Vec<Address>,
    pub channel_nonce: U256,
}

impl Channel {
    /// Content address of the channel. Deterministic: any field change
    /// changes the id.
    pub fn id(&self) -> Result<Hash, encode::Error> {
        encode::to_hash(self)
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    /// Participant allowed to produce the state with the given turn
    /// number.
    pub fn mover(&self, turn_num: u64) -> PartIdx {
        (turn_num % self.participants.len() as u64) as PartIdx
    }

    pub fn index_of(&self, addr: Address) -> Option<PartIdx> {
        self.participants.iter().position(|&p| p == addr)
    }
}

/// Funds recipient inside an outcome: either an external address (zero
/// padded to 32 bytes) or another channel's id.
#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Destination(pub Bytes32);

impl Destination {
    pub fn from_address(addr: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(&addr.0);
        Destination(Bytes32(bytes))
    }

    pub fn from_channel(id: Hash) -> Self {
        Destination(Bytes32(id.0))
    }
}

/// One entry of an allocation outcome.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AllocationItem {
    pub destination: Destination,
    pub amount: U256,
}

/// Who gets what when the channel concludes.
///
/// Application channels carry an ordered allocation. Ledger and joint
/// channels funding another channel carry a guarantee instead, which
/// redirects their holdings to the target channel's outcome.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Allocation(Vec<AllocationItem>),
    Guarantee {
        target_channel_id: Hash,
        destinations: Vec<Destination>,
    },
}

impl Outcome {
    /// Sum of all allocated amounts. Zero for guarantees, which do not
    /// hold funds of their own.
    pub fn total(&self) -> U256 {
        match self {
            Outcome::Allocation(items) => items
                .iter()
                .fold(U256::zero(), |acc, item| acc + item.amount),
            Outcome::Guarantee { .. } => U256::zero(),
        }
    }
}

/// One point in a channel's timeline.
///
/// States are immutable value objects: a new turn creates a new state via
/// [State::next], never mutates one. `turn_num` is private so a caller
/// cannot accidentally write garbage to it; skipping or repeating turn
/// numbers would otherwise only be caught at runtime by the store.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub channel: Channel,
    pub outcome: Outcome,
    turn_num: u64,
    pub is_final: bool,
    pub app_definition: Address,
    #[serde(with = "as_bytes")]
    pub app_data: Vec<u8>,
    pub challenge_duration: u64,
}

impl State {
    /// The initial (pre-fund setup) state of a channel, `turn_num = 0`.
    pub fn new(
        channel: Channel,
        outcome: Outcome,
        app_definition: Address,
        app_data: Vec<u8>,
        challenge_duration: u64,
    ) -> Self {
        State {
            channel,
            outcome,
            turn_num: 0,
            is_final: false,
            app_definition,
            app_data,
            challenge_duration,
        }
    }

    /// Reassemble a state from wire data, turn number included. Nothing
    /// is validated here; the store does that on `check_and_store`.
    pub fn from_parts(
        channel: Channel,
        outcome: Outcome,
        turn_num: u64,
        is_final: bool,
        app_definition: Address,
        app_data: Vec<u8>,
        challenge_duration: u64,
    ) -> Self {
        State {
            channel,
            outcome,
            turn_num,
            is_final,
            app_definition,
            app_data,
            challenge_duration,
        }
    }

    pub fn turn_num(&self) -> u64 {
        self.turn_num
    }

    pub fn channel_id(&self) -> Result<Hash, encode::Error> {
        self.channel.id()
    }

    /// Hash that gets signed by every participant.
    pub fn hash(&self) -> Result<Hash, encode::Error> {
        encode::to_hash(self)
    }

    /// Participant whose turn it is to produce this state.
    pub fn mover(&self) -> PartIdx {
        self.channel.mover(self.turn_num)
    }

    /// Create the state that will replace this state.
    pub fn next(&self) -> Self {
        State {
            channel: self.channel.clone(),
            outcome: self.outcome.clone(),
            turn_num: self.turn_num + 1,
            is_final: self.is_final,
            app_definition: self.app_definition,
            app_data: self.app_data.clone(),
            challenge_duration: self.challenge_duration,
        }
    }

    /// Successor state marked final, used for cooperative close.
    pub fn next_final(&self) -> Self {
        let mut state = self.next();
        state.is_final = true;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn participants() -> Vec<Address> {
        vec![Address([1; 20]), Address([2; 20])]
    }

    fn channel() -> Channel {
        Channel {
            chain_id: U256::from(5),
            participants: participants(),
            channel_nonce: U256::from(42),
        }
    }

    #[test]
    fn channel_id_is_deterministic() {
        assert_eq!(channel().id().unwrap(), channel().id().unwrap());
    }

    #[test]
    fn channel_id_depends_on_every_field() {
        let base = channel().id().unwrap();

        let mut c = channel();
        c.chain_id = U256::from(6);
        assert_ne!(c.id().unwrap(), base);

        let mut c = channel();
        c.channel_nonce = U256::from(43);
        assert_ne!(c.id().unwrap(), base);

        let mut c = channel();
        c.participants.reverse();
        assert_ne!(c.id().unwrap(), base);

        let mut c = channel();
        c.participants.push(Address([3; 20]));
        assert_ne!(c.id().unwrap(), base);
    }

    #[test]
    fn mover_rotates_through_participants() {
        let c = channel();
        assert_eq!(c.mover(0), 0);
        assert_eq!(c.mover(1), 1);
        assert_eq!(c.mover(2), 0);
        assert_eq!(c.mover(7), 1);
    }

    #[test]
    fn next_state_advances_turn_only() {
        let state = State::new(
            channel(),
            Outcome::Allocation(vec![AllocationItem {
                destination: Destination::from_address(Address([1; 20])),
                amount: U256::from(5),
            }]),
            Address::default(),
            vec![],
            60,
        );
        let next = state.next();
        assert_eq!(next.turn_num(), 1);
        assert_eq!(next.outcome, state.outcome);
        assert_eq!(next.channel_id().unwrap(), state.channel_id().unwrap());
        assert_ne!(next.hash().unwrap(), state.hash().unwrap());
    }

    #[test]
    fn outcome_total_sums_allocations() {
        let outcome = Outcome::Allocation(vec![
            AllocationItem {
                destination: Destination::from_address(Address([1; 20])),
                amount: U256::from(5),
            },
            AllocationItem {
                destination: Destination::from_address(Address([2; 20])),
                amount: U256::from(5),
            },
        ]);
        assert_eq!(outcome.total(), U256::from(10));
    }
}
