//! Handles the creation and verification of (Ethereum style) signatures.
//!
//! Signing and recovery are capabilities injected into the store and the
//! protocol reducers; the protocol core never touches key material
//! directly. Which backend provides the capability is a compile time
//! choice via feature flags.

use crate::encode::types::Hash;
use sha3::{Digest, Keccak256};

#[cfg(feature = "k256")]
pub mod k256;
#[cfg(feature = "secp256k1")]
pub mod secp256k1;

#[cfg(any(all(not(feature = "k256"), not(feature = "secp256k1")), doc))]
mod dummy;

#[cfg(feature = "k256")]
pub use self::k256::{Error, Signer};
#[cfg(all(feature = "secp256k1", not(feature = "k256")))]
pub use self::secp256k1::{Error, Signer};
#[cfg(all(not(feature = "k256"), not(feature = "secp256k1")))]
pub use self::dummy::{Error, Signer};

#[cfg(test)]
mod tests;

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format the on-chain adjudicator verifies against.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the canonical encoder here.
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}
