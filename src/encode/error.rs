//! Error type and Result alias used by the canonical encoder.

use core::fmt::Display;

use serde::ser;

/// Represents all possible errors that can happen while encoding a value
/// for hashing.
///
/// Note that custom errors using [ser::Error::custom()] are not supported,
/// the encoder never produces them.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The value contains a type that has no canonical encoding.
    ///
    /// Floating point numbers and maps have no deterministic, platform
    /// independent byte representation we are willing to commit to, since
    /// the resulting hash has to be recomputable by every participant and
    /// by the adjudicator. Restructure the type instead of relying on a
    /// default representation.
    TypeNotRepresentable(&'static str),
    /// The type could get a canonical encoding, but the encoder does not
    /// implement it (currently only `char`).
    TypeNotYetSupported(&'static str),
}

impl ser::Error for Error {
    fn custom<T>(_: T) -> Self
    where
        T: core::fmt::Display,
    {
        unimplemented!()
    }
}
#[cfg(feature = "std")]
impl ser::StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::TypeNotRepresentable(type_name) => {
                f.write_str("type has no canonical encoding: ")?;
                f.write_str(type_name)
            }
            Error::TypeNotYetSupported(type_name) => {
                f.write_str("type is not yet implemented: ")?;
                f.write_str(type_name)
            }
        }
    }
}

/// Alias for `Result` using the [Error] returned by the encoder.
pub type Result<T> = core::result::Result<T, Error>;
