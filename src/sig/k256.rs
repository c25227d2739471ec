//! Signer using the k256 crate (pure Rust ecdsa, works without std).

use crate::encode::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as K256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use super::hash_to_eth_signed_msg_hash;

pub use k256::ecdsa::Error;

/// Holds the signing key and the derived on-chain address.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // Convert the key into an EncodedPoint (on the curve), which has
        // the data we need in bytes [1..]. This panics only if the byte
        // representation of EncodedPoint stops being 65 bytes, in which
        // case its layout changed and we have bigger problems anyway.
        let pk_bytes: [u8; 65] = key.to_encoded_point(false).as_bytes().try_into().unwrap();

        // Throw away the first byte, which is not part of the public key.
        // It is added by the uncompressed point encoding.
        let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    /// Generate a fresh key pair.
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    /// Load an existing private key, e.g. from a secure element.
    pub fn from_bytes(private_key: &[u8; 32]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(private_key)?;
        let addr = key.verifying_key().into();
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0).unwrap();

        // This Signature type already has the layout we need: 65 bytes
        // containing r, s and v in this order. We still have to add 27 to
        // v for the signature to be valid on-chain.
        let mut sig_bytes: [u8; 65] = sig.as_bytes().try_into().expect(
            "Unreachable: Signature size doesn't match, something big must have changed in the dependency",
        );
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }

    pub fn recover_signer(&self, msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // Undo adding the 27, to go back to the format expected below.
        let mut sig_bytes: [u8; 65] = eth_sig.0;
        if sig_bytes[64] < 27 {
            return Err(Error::new());
        }
        sig_bytes[64] -= 27;

        let sig = recoverable::Signature::from_bytes(&sig_bytes)?;

        let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
        Ok(verifying_key.into())
    }
}
