//! Signer using the secp256k1 crate (bindings to libsecp256k1, std only).

use crate::encode::types::{Address, Hash, Signature};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, Secp256k1, SecretKey,
};

use super::hash_to_eth_signed_msg_hash;

pub use secp256k1::Error;

#[derive(Debug)]
pub struct Signer {
    secp: Secp256k1<All>,
    key: SecretKey,
    addr: Address,
}

impl Signer {
    /// Generate a fresh key pair.
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let secp = Secp256k1::new();
        let (key, pk) = secp.generate_keypair(rng);
        let addr = pk.into();
        Self { secp, key, addr }
    }

    /// Load an existing private key.
    pub fn from_bytes(private_key: &[u8; 32]) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(private_key)?;
        let addr = key.public_key(&secp).into();
        Ok(Self { secp, key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Sign a hash producing an Ethereum 65-byte recoverable signature.
    ///
    /// Note that this differs from transaction signatures, as it does not
    /// include a chain id in v. The on-chain signature check recovers the
    /// plain address, so neither EIP-155 nor EIP-2098 compaction apply.
    pub fn sign_eth(&self, msg: Hash) -> Signature {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        // sign_ecdsa_recoverable so the contract can recover the address.
        // This gives us the additional information needed for v.
        let sig = self
            .secp
            .sign_ecdsa_recoverable(&Message::from(hash), &self.key);

        let (v, rs) = sig.serialize_compact();

        // EIP-2 makes all signatures with a non-canonical solution (s
        // starting with bit 1) invalid. The library already produces
        // canonical signatures, this debug_assert is just to fail early if
        // that changes at some point.
        debug_assert!(rs[32] & 0x80 == 0);

        // yParity (v) is offset by 27, a convention Ethereum kept from
        // Bitcoin's binary message prefixes.
        let v: u8 = 27 + v.to_i32() as u8;

        Signature::new(&rs, v)
    }

    /// Recover the signer address from a signature over `msg`.
    ///
    /// `msg` is the hash given to [Signer::sign_eth]; it must not include
    /// the `Ethereum Signed Message` prefix.
    pub fn recover_signer(&self, msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
        let hash = hash_to_eth_signed_msg_hash(msg);

        let rs = &eth_sig.0[..64];
        if eth_sig.0[64] < 27 {
            return Err(Error::InvalidSignature);
        }
        let v = eth_sig.0[64] - 27;

        let recid = RecoveryId::from_i32(v.into())?;
        let sig = RecoverableSignature::from_compact(rs, recid)?;

        let pk = self.secp.recover_ecdsa(&Message::from(hash), &sig)?;

        Ok(pk.into())
    }
}
