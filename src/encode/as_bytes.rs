//! Serde helper writing a byte slice through `serialize_bytes`, so it gets
//! the length-prefixed encoding instead of one slot per element.
//!
//! Usage: `#[serde(with = "as_bytes")]` on `Vec<u8>` or `[u8; N]` fields.

use serde::Serializer;

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_bytes(value.as_ref())
}
