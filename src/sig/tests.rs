use crate::encode::{self, types::Hash};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;

fn data() -> Hash {
    #[derive(Serialize, Debug)]
    struct Payload {
        value: u64,
    }
    encode::to_hash(&Payload { value: 0xa1a2a3a4 }).unwrap()
}

macro_rules! make_sign_and_recover {
    ($name:ident, $signer:ty, $verifier:ty) => {
        #[test]
        fn $name() {
            // Do not use a seeded rng on any real device, this is just for
            // testing.
            let mut rng = StdRng::seed_from_u64(0);
            let signer = <$signer>::new(&mut rng);
            let msg = data();
            let sig = signer.sign_eth(msg);

            let verifier = <$verifier>::new(&mut rng);
            let address = verifier.recover_signer(msg, sig).unwrap();

            assert_eq!(address, signer.address());
        }
    };
}

#[cfg(feature = "k256")]
make_sign_and_recover!(k256_to_k256, super::k256::Signer, super::k256::Signer);

#[cfg(feature = "secp256k1")]
make_sign_and_recover!(
    secp256k1_to_secp256k1,
    super::secp256k1::Signer,
    super::secp256k1::Signer
);

// The two backends must be interchangeable: a signature produced by one
// has to recover to the same address with the other.
#[cfg(all(feature = "secp256k1", feature = "k256"))]
make_sign_and_recover!(
    secp256k1_to_k256,
    super::secp256k1::Signer,
    super::k256::Signer
);

#[cfg(all(feature = "secp256k1", feature = "k256"))]
make_sign_and_recover!(
    k256_to_secp256k1,
    super::k256::Signer,
    super::secp256k1::Signer
);

#[cfg(feature = "k256")]
#[test]
fn recover_rejects_garbage() {
    use crate::encode::types::Signature;

    let mut rng = StdRng::seed_from_u64(1);
    let signer = super::k256::Signer::new(&mut rng);
    // v below 27 is not a valid Ethereum signature
    let sig = Signature([0u8; 65]);
    assert!(signer.recover_signer(data(), sig).is_err());
}

#[cfg(feature = "k256")]
#[test]
fn tampered_message_recovers_different_address() {
    let mut rng = StdRng::seed_from_u64(2);
    let signer = super::k256::Signer::new(&mut rng);
    let sig = signer.sign_eth(data());

    let mut other = data();
    other.0[0] ^= 0xff;

    match signer.recover_signer(other, sig) {
        Ok(addr) => assert_ne!(addr, signer.address()),
        // recovery may also fail outright, both are acceptable
        Err(_) => {}
    }
}

#[cfg(feature = "k256")]
#[test]
fn from_bytes_derives_stable_address() {
    let raw = hex::decode("8f2a559490d4d6525cbd0cdab582f5acb2b90a8f47ff79b2ba8e2c16e0d33b40")
        .unwrap();
    let key: [u8; 32] = raw.as_slice().try_into().unwrap();
    let a = super::k256::Signer::from_bytes(&key).unwrap();
    let b = super::k256::Signer::from_bytes(&key).unwrap();
    assert_eq!(a.address(), b.address());
}
