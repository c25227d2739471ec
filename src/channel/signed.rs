use alloc::vec::Vec;

use super::{PartIdx, State};
use crate::{
    encode,
    sig::{self, Signer},
    Address, Signature,
};

/// Error returned when a signature cannot be attached to a state.
#[derive(Debug)]
pub enum SignatureError {
    Encode(encode::Error),
    /// The signature bytes are malformed or recovery failed.
    InvalidSignature(sig::Error),
    /// The recovered signer is not a participant of the channel.
    UnauthorizedSigner(Address),
    /// The participant already has a signature on this state.
    AlreadySigned(PartIdx),
}
impl From<encode::Error> for SignatureError {
    fn from(e: encode::Error) -> Self {
        Self::Encode(e)
    }
}
impl From<sig::Error> for SignatureError {
    fn from(e: sig::Error) -> Self {
        Self::InvalidSignature(e)
    }
}

/// A [State] plus the signatures collected for it so far.
///
/// A state becomes *supported* once it carries one valid signature from
/// every channel participant. The signature list is only mutated through
/// [SignedState::sign] and [SignedState::add_signature], which reject
/// duplicates and outsiders, so a stored signed state never holds junk.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedState {
    state: State,
    signatures: Vec<Signature>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        SignedState {
            state,
            signatures: Vec::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Sign the state with our own key and attach the signature.
    pub fn sign(&mut self, signer: &Signer) -> Result<Signature, SignatureError> {
        let hash = self.state.hash()?;
        let sig = signer.sign_eth(hash);
        let part_idx = self.attach(sig, signer)?;
        debug_assert_eq!(self.state.channel.participants[part_idx], signer.address());
        Ok(sig)
    }

    /// Attach a signature received from another participant.
    ///
    /// Returns the index of the participant the signature recovers to.
    /// `verifier` only provides the recovery capability, its key is not
    /// used.
    pub fn add_signature(
        &mut self,
        sig: Signature,
        verifier: &Signer,
    ) -> Result<PartIdx, SignatureError> {
        self.attach(sig, verifier)
    }

    fn attach(&mut self, sig: Signature, verifier: &Signer) -> Result<PartIdx, SignatureError> {
        let hash = self.state.hash()?;
        let signer_addr = verifier.recover_signer(hash, sig)?;

        let part_idx = match self.state.channel.index_of(signer_addr) {
            Some(part_idx) => part_idx,
            None => return Err(SignatureError::UnauthorizedSigner(signer_addr)),
        };

        if self.signer_indices(verifier)?.contains(&part_idx) {
            return Err(SignatureError::AlreadySigned(part_idx));
        }

        self.signatures.push(sig);
        Ok(part_idx)
    }

    /// Participant indices recovered from the attached signatures.
    ///
    /// Fails on malformed signatures and outsiders; both can only appear
    /// here if the signed state was constructed from untrusted wire data
    /// and not yet validated.
    pub fn signer_indices(&self, verifier: &Signer) -> Result<Vec<PartIdx>, SignatureError> {
        let hash = self.state.hash()?;
        let mut indices = Vec::with_capacity(self.signatures.len());
        for &sig in &self.signatures {
            let addr = verifier.recover_signer(hash, sig)?;
            match self.state.channel.index_of(addr) {
                Some(part_idx) => indices.push(part_idx),
                None => return Err(SignatureError::UnauthorizedSigner(addr)),
            }
        }
        Ok(indices)
    }

    pub fn signed_by(&self, part_idx: PartIdx, verifier: &Signer) -> Result<bool, SignatureError> {
        Ok(self.signer_indices(verifier)?.contains(&part_idx))
    }

    /// True iff the signer set, once resolved to addresses, covers exactly
    /// the participant set.
    ///
    /// Unlike [SignedState::signer_indices] this never fails: malformed,
    /// duplicate or non-participant signatures simply do not count towards
    /// support.
    pub fn is_supported(&self, verifier: &Signer) -> bool {
        let hash = match self.state.hash() {
            Ok(hash) => hash,
            Err(_) => return false,
        };

        let n = self.state.channel.num_participants();
        let mut seen = alloc::vec![false; n];
        for &sig in &self.signatures {
            let addr = match verifier.recover_signer(hash, sig) {
                Ok(addr) => addr,
                Err(_) => return false,
            };
            match self.state.channel.index_of(addr) {
                Some(part_idx) if !seen[part_idx] => seen[part_idx] = true,
                // duplicate or outsider: never counts towards support
                _ => return false,
            }
        }
        seen.iter().all(|&s| s)
    }

    /// Merge the signatures of `other` (same state) into this one.
    ///
    /// Used by the store when a countersignature for an already stored
    /// turn arrives. Returns how many new signatures were added; known
    /// duplicates are skipped silently.
    pub(super) fn merge_signatures(
        &mut self,
        other: &SignedState,
        verifier: &Signer,
    ) -> Result<usize, SignatureError> {
        debug_assert_eq!(self.state, other.state);
        let mut added = 0;
        for &sig in &other.signatures {
            match self.attach(sig, verifier) {
                Ok(_) => added += 1,
                Err(SignatureError::AlreadySigned(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// Build a signed state straight from wire data. The signatures are
    /// not validated here; the store does that on `check_and_store`.
    pub fn from_parts(state: State, signatures: Vec<Signature>) -> Self {
        SignedState { state, signatures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AllocationItem, Channel, Destination, Outcome};
    use crate::U256;
    use alloc::vec;
    use rand::{rngs::StdRng, SeedableRng};

    fn two_party() -> (Signer, Signer, State) {
        let mut rng = StdRng::seed_from_u64(7);
        let alice = Signer::new(&mut rng);
        let bob = Signer::new(&mut rng);
        let channel = Channel {
            chain_id: U256::from(1),
            participants: vec![alice.address(), bob.address()],
            channel_nonce: U256::from(1),
        };
        let outcome = Outcome::Allocation(vec![
            AllocationItem {
                destination: Destination::from_address(alice.address()),
                amount: U256::from(5),
            },
            AllocationItem {
                destination: Destination::from_address(bob.address()),
                amount: U256::from(5),
            },
        ]);
        let state = State::new(channel, outcome, Address::default(), vec![], 60);
        (alice, bob, state)
    }

    #[test]
    fn supported_needs_every_participant() {
        let (alice, bob, state) = two_party();
        let mut signed = SignedState::new(state);

        assert!(!signed.is_supported(&alice));
        signed.sign(&alice).unwrap();
        assert!(!signed.is_supported(&alice));
        signed.sign(&bob).unwrap();
        assert!(signed.is_supported(&alice));
        assert!(signed.is_supported(&bob));
    }

    #[test]
    fn duplicate_signature_is_rejected() {
        let (alice, _, state) = two_party();
        let mut signed = SignedState::new(state);
        signed.sign(&alice).unwrap();
        assert!(matches!(
            signed.sign(&alice),
            Err(SignatureError::AlreadySigned(0))
        ));
    }

    #[test]
    fn outsider_signature_is_rejected() {
        let (alice, bob, state) = two_party();
        let mut rng = StdRng::seed_from_u64(99);
        let eve = Signer::new(&mut rng);

        let mut signed = SignedState::new(state);
        let sig = eve.sign_eth(signed.state().hash().unwrap());
        assert!(matches!(
            signed.add_signature(sig, &alice),
            Err(SignatureError::UnauthorizedSigner(_))
        ));

        // and smuggling it in via from_parts never makes the state
        // supported
        let mut sigs = Vec::new();
        sigs.push(alice.sign_eth(signed.state().hash().unwrap()));
        sigs.push(bob.sign_eth(signed.state().hash().unwrap()));
        sigs.push(eve.sign_eth(signed.state().hash().unwrap()));
        let smuggled = SignedState::from_parts(signed.state().clone(), sigs);
        assert!(!smuggled.is_supported(&alice));
    }

    #[test]
    fn duplicate_in_wire_data_does_not_support() {
        let (alice, _, state) = two_party();
        let sig = alice.sign_eth(state.hash().unwrap());
        let smuggled = SignedState::from_parts(state, vec![sig, sig]);
        assert!(!smuggled.is_supported(&alice));
    }
}
