#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod encode {
    mod error;
    mod ser;

    pub mod as_bytes;
    pub mod types;

    pub use error::{Error, Result};
    pub use ser::{to_hash, to_writer, Serializer, Writer};

    #[cfg(test)]
    mod tests;
}
pub mod sig;

pub mod channel;
mod client;
pub mod messages;
pub mod protocol;
pub mod wire;

pub use client::Wallet;
pub use encode::types::{Address, Bytes32, Hash, Signature, U256};
