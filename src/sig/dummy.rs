//! Dummy Signer that always panics. Fallback if no signer feature flag is
//! selected, so the rest of the crate still type checks.

use crate::encode::types::{Address, Hash, Signature};

#[derive(Debug)]
pub struct Error {}

#[derive(Debug)]
pub struct Signer {}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(_rng: &mut R) -> Self {
        Signer {}
    }

    pub fn from_bytes(_private_key: &[u8; 32]) -> Result<Self, Error> {
        Ok(Signer {})
    }

    pub fn address(&self) -> Address {
        unimplemented!()
    }

    pub fn sign_eth(&self, _msg: Hash) -> Signature {
        unimplemented!()
    }

    pub fn recover_signer(&self, _hash: Hash, _eth_sig: Signature) -> Result<Address, Error> {
        unimplemented!()
    }
}
