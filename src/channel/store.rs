use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, warn};

use super::{Channel, Outcome, PartIdx, SignatureError, SignedState, State};
use crate::{encode, sig::Signer, Hash};

/// Typed failure returned by the store. Rejection never mutates the
/// store, so duplicate or out-of-order delivery is a safe no-op for the
/// caller to retry or drop.
#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    ChannelExists,
    ChannelNotFound,
    /// The advancing state does not carry the mover's signature, or we
    /// tried to sign out of turn.
    NotYourTurn,
    /// Turn number gap/regression, channel mismatch, state after a final
    /// state, outcome total change, or a stale duplicate.
    InvalidTransition,
    InvalidSignature,
    UnauthorizedSigner,
    NoSupportedState,
    Encode(encode::Error),
}

impl From<encode::Error> for StoreError {
    fn from(e: encode::Error) -> Self {
        Self::Encode(e)
    }
}
impl From<SignatureError> for StoreError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::Encode(e) => Self::Encode(e),
            SignatureError::InvalidSignature(_) => Self::InvalidSignature,
            SignatureError::UnauthorizedSigner(_) => Self::UnauthorizedSigner,
            // a signature we already hold is a stale duplicate
            SignatureError::AlreadySigned(_) => Self::InvalidTransition,
        }
    }
}

/// Which funding strategy backs a channel.
///
/// A tagged variant instead of two optional channel ids: a directly
/// funded channel *has* no funding channel, a ledger funded one has
/// exactly a ledger, a virtually funded one exactly a joint/guarantor
/// pair. The "both present/both absent" states are unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Funding {
    Direct,
    Ledger { ledger_id: Hash },
    Virtual { joint_id: Hash, guarantor_id: Hash },
}

/// Per-channel record owned by the store.
///
/// The history is append-only: entries are never edited, a
/// countersignature for an already stored turn merges into the existing
/// [SignedState], and a new turn appends. Entries are never destroyed.
#[derive(Debug)]
pub struct ChannelStoreEntry {
    channel: Channel,
    our_index: PartIdx,
    history: Vec<SignedState>,
}

impl ChannelStoreEntry {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn our_index(&self) -> PartIdx {
        self.our_index
    }

    pub fn history(&self) -> &[SignedState] {
        &self.history
    }

    pub fn latest(&self) -> Option<&SignedState> {
        self.history.last()
    }

    pub fn current_turn_num(&self) -> Option<u64> {
        self.latest().map(|s| s.state().turn_num())
    }

    /// Latest state carrying a valid signature from every participant.
    pub fn latest_supported(&self, verifier: &Signer) -> Option<&SignedState> {
        self.history.iter().rev().find(|s| s.is_supported(verifier))
    }
}

/// The validated channel store: per-channel signed-state history plus the
/// funding map.
///
/// Accepts or rejects incoming signed states according to the ForceMove
/// turn-taking and signature rules. Pure data structure: every operation
/// either commits in full or returns a [StoreError] leaving the store
/// untouched. It performs no I/O; the signer is the injected capability
/// used for signing our own states and recovering peers' signatures.
#[derive(Debug)]
pub struct ChannelStore {
    signer: Signer,
    entries: BTreeMap<Hash, ChannelStoreEntry>,
    funding: BTreeMap<Hash, Funding>,
}

impl ChannelStore {
    pub fn new(signer: Signer) -> Self {
        ChannelStore {
            signer,
            entries: BTreeMap::new(),
            funding: BTreeMap::new(),
        }
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Register a new empty entry for a channel we are about to open.
    ///
    /// Fails with [StoreError::ChannelExists] if already present, unless
    /// the existing entry has identical metadata, which makes retried
    /// initialization idempotent.
    pub fn initialize(&mut self, channel: Channel, our_index: PartIdx) -> Result<Hash, StoreError> {
        let channel_id = channel.id()?;
        if let Some(existing) = self.entries.get(&channel_id) {
            if existing.channel == channel && existing.our_index == our_index {
                return Ok(channel_id);
            }
            return Err(StoreError::ChannelExists);
        }
        debug_assert!(our_index < channel.num_participants());

        debug!("store: initialized channel {:?}", channel_id);
        self.entries.insert(
            channel_id,
            ChannelStoreEntry {
                channel,
                our_index,
                history: Vec::new(),
            },
        );
        Ok(channel_id)
    }

    /// Validate and store the very first state of a channel we did not
    /// propose ourselves.
    ///
    /// Only a pre-fund setup state (`turn_num == 0`) may create an entry
    /// this way, and it must carry at least the proposer's signature.
    pub fn check_and_initialize(
        &mut self,
        signed: SignedState,
        our_index: PartIdx,
    ) -> Result<Hash, StoreError> {
        let channel_id = signed.state().channel_id()?;
        if self.entries.contains_key(&channel_id) {
            return Err(StoreError::ChannelExists);
        }
        if signed.state().turn_num() != 0 {
            warn!(
                "store: rejected initial state with turn {} for {:?}",
                signed.state().turn_num(),
                channel_id
            );
            return Err(StoreError::InvalidTransition);
        }
        if our_index >= signed.state().channel.num_participants() {
            return Err(StoreError::UnauthorizedSigner);
        }

        let indices = signed.signer_indices(&self.signer)?;
        // turn 0 is the proposer's move
        if !indices.contains(&signed.state().channel.mover(0)) {
            return Err(StoreError::NotYourTurn);
        }

        debug!("store: accepted initial state for {:?}", channel_id);
        self.entries.insert(
            channel_id,
            ChannelStoreEntry {
                channel: signed.state().channel.clone(),
                our_index,
                history: alloc::vec![signed],
            },
        );
        Ok(channel_id)
    }

    /// Validate an incoming signed state against the entry's history and
    /// append (or merge a countersignature) on success.
    pub fn check_and_store(&mut self, signed: SignedState) -> Result<(), StoreError> {
        let channel_id = signed.state().channel_id()?;
        // validate against an immutable borrow first; commit below
        let entry = self
            .entries
            .get(&channel_id)
            .ok_or(StoreError::ChannelNotFound)?;

        let indices = signed.signer_indices(&self.signer)?;
        if indices.is_empty() {
            return Err(StoreError::InvalidSignature);
        }

        let latest = match entry.latest() {
            Some(latest) => latest,
            None => {
                // entry registered via initialize() but still empty: only
                // the pre-fund setup state may enter
                if signed.state().turn_num() != 0 {
                    return Err(StoreError::InvalidTransition);
                }
                if !indices.contains(&signed.state().channel.mover(0)) {
                    return Err(StoreError::NotYourTurn);
                }
                debug!("store: accepted turn 0 for {:?}", channel_id);
                self.entry_mut(channel_id).history.push(signed);
                return Ok(());
            }
        };

        let current = latest.state().turn_num();
        let turn = signed.state().turn_num();

        if turn == current {
            // countersignature(s) for the stored state
            if signed.state() != latest.state() {
                warn!(
                    "store: conflicting state at turn {} for {:?}",
                    turn, channel_id
                );
                return Err(StoreError::InvalidTransition);
            }
            let mut merged = latest.clone();
            let added = merged.merge_signatures(&signed, &self.signer)?;
            if added == 0 {
                // duplicate delivery, nothing new
                return Err(StoreError::InvalidTransition);
            }
            debug!(
                "store: merged {} countersignature(s) at turn {} for {:?}",
                added, turn, channel_id
            );
            *self.entry_mut(channel_id).history.last_mut().unwrap() = merged;
            return Ok(());
        }

        if turn != current + 1 {
            warn!(
                "store: turn gap/regression ({} after {}) for {:?}",
                turn, current, channel_id
            );
            return Err(StoreError::InvalidTransition);
        }

        Self::check_valid_transition(latest.state(), signed.state())?;

        // only the mover may advance the turn
        if !indices.contains(&signed.state().mover()) {
            warn!("store: turn {} not signed by mover for {:?}", turn, channel_id);
            return Err(StoreError::NotYourTurn);
        }

        debug!("store: accepted turn {} for {:?}", turn, channel_id);
        self.entry_mut(channel_id).history.push(signed);
        Ok(())
    }

    /// Sign a locally produced state and store it.
    ///
    /// Either countersigns the currently stored state (same turn, same
    /// content) or advances the turn by one, which requires that we are
    /// the mover. Returns the stored signed state so the caller can put
    /// it on the wire.
    pub fn sign_and_store(&mut self, state: State) -> Result<SignedState, StoreError> {
        let channel_id = state.channel_id()?;
        let entry = self
            .entries
            .get(&channel_id)
            .ok_or(StoreError::ChannelNotFound)?;
        let our_index = entry.our_index;

        match entry.latest() {
            None => {
                // first state of a channel we proposed
                if state.turn_num() != 0 {
                    return Err(StoreError::InvalidTransition);
                }
                if state.channel.mover(0) != our_index {
                    return Err(StoreError::NotYourTurn);
                }
                let mut signed = SignedState::new(state);
                signed.sign(&self.signer)?;
                debug!("store: signed turn 0 for {:?}", channel_id);
                self.entry_mut(channel_id).history.push(signed.clone());
                Ok(signed)
            }
            Some(latest) => {
                let current = latest.state().turn_num();
                if state.turn_num() == current && &state == latest.state() {
                    // countersign the stored state
                    let mut merged = latest.clone();
                    merged.sign(&self.signer)?;
                    debug!(
                        "store: countersigned turn {} for {:?}",
                        current, channel_id
                    );
                    *self.entry_mut(channel_id).history.last_mut().unwrap() = merged.clone();
                    return Ok(merged);
                }

                if state.turn_num() != current + 1 {
                    return Err(StoreError::InvalidTransition);
                }
                if state.mover() != our_index {
                    return Err(StoreError::NotYourTurn);
                }
                Self::check_valid_transition(latest.state(), &state)?;

                let mut signed = SignedState::new(state);
                signed.sign(&self.signer)?;
                debug!(
                    "store: signed turn {} for {:?}",
                    signed.state().turn_num(),
                    channel_id
                );
                self.entry_mut(channel_id).history.push(signed.clone());
                Ok(signed)
            }
        }
    }

    pub fn entry(&self, channel_id: Hash) -> Result<&ChannelStoreEntry, StoreError> {
        self.entries
            .get(&channel_id)
            .ok_or(StoreError::ChannelNotFound)
    }

    /// All known channels, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &ChannelStoreEntry)> {
        self.entries.iter()
    }

    /// Latest state with signatures from all participants.
    pub fn latest_supported_state(&self, channel_id: Hash) -> Result<State, StoreError> {
        let entry = self.entry(channel_id)?;
        entry
            .latest_supported(&self.signer)
            .map(|s| s.state().clone())
            .ok_or(StoreError::NoSupportedState)
    }

    /// Latest supported state including its signatures, as needed for
    /// on-chain submission.
    pub fn latest_supported_signed_state(
        &self,
        channel_id: Hash,
    ) -> Result<SignedState, StoreError> {
        let entry = self.entry(channel_id)?;
        entry
            .latest_supported(&self.signer)
            .cloned()
            .ok_or(StoreError::NoSupportedState)
    }

    pub fn set_funding(&mut self, channel_id: Hash, funding: Funding) {
        self.funding.insert(channel_id, funding);
    }

    pub fn funding(&self, channel_id: Hash) -> Option<&Funding> {
        self.funding.get(&channel_id)
    }

    fn entry_mut(&mut self, channel_id: Hash) -> &mut ChannelStoreEntry {
        // only called after `entries.get` succeeded under the same id
        self.entries
            .get_mut(&channel_id)
            .expect("entry looked up before mutation")
    }

    fn check_valid_transition(from: &State, to: &State) -> Result<(), StoreError> {
        if from.is_final {
            return Err(StoreError::InvalidTransition);
        }
        if from.channel != to.channel {
            return Err(StoreError::InvalidTransition);
        }
        // allocations may move between destinations but the channel's
        // total holdings are fixed off-chain
        if let (Outcome::Allocation(_), Outcome::Allocation(_)) = (&from.outcome, &to.outcome) {
            if from.outcome.total() != to.outcome.total() {
                return Err(StoreError::InvalidTransition);
            }
        }
        Ok(())
    }
}
