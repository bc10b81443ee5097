// SPDX-License-Identifier: CC0-1.0

//! # MWEB Output Descriptors and PSBT
//!
//! Tools for parsing, validating and deriving *output descriptors* — compact
//! textual expressions describing how scriptPubKeys (and MWEB stealth
//! addresses) are built from keys — together with a Partially Signed
//! Transaction container supporting both PSBT version 0 (BIP-174) and
//! version 2 (BIP-370).
//!
//! The descriptor engine covers the standard forms (`pk`, `pkh`, `wpkh`,
//! `combo`, `multi`, `sortedmulti`, `sh`, `wsh`, `tr`, `rawtr`, `addr`,
//! `raw`, miniscript-in-`wsh`) plus the `mweb()` form, which derives
//! confidential stealth addresses from a scan/spend keypair.
//!
//! Descriptors are parsed into an owned tree, may be expanded at a
//! derivation position into concrete scripts and a flat signing provider,
//! and round-trip through three textual modes (public, private and
//! normalized), each protected by an error-correcting checksum.

pub mod descriptor;
pub mod expression;
pub mod miniscript;
pub mod provider;
pub mod psbt;

use core::fmt;
use std::error;

use bitcoin::bip32;
use bitcoin::secp256k1;

pub use crate::descriptor::{Descriptor, DescriptorCache, GenericAddress, StealthAddress};
pub use crate::miniscript::Miniscript;
pub use crate::provider::{FlatSigningProvider, SigningProvider};
pub use crate::psbt::Psbt;

/// Bound on the depth of nested expression trees.
///
/// Real scripts cannot come anywhere near this; the limit only exists to
/// keep the recursive-descent parser from exhausting the stack on
/// adversarial input.
pub const MAX_RECURSION_DEPTH: u32 = 402;

/// Descriptor and miniscript errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Descriptor was required to carry a checksum but none was present.
    MissingChecksum,
    /// The `#`-suffix was not a well-formed 8 character checksum.
    BadChecksum(String),
    /// The provided checksum does not match the one computed from the body.
    ChecksumMismatch {
        /// What the descriptor carried after `#`.
        provided: String,
        /// What the body actually hashes to.
        computed: String,
    },
    /// Character outside the 96-character descriptor alphabet.
    InvalidChar(char),
    /// Malformed descriptor or key expression.
    Syntax(String),
    /// A function form used in a context where it is not permitted.
    Context(String),
    /// Key material required for a derivation was unavailable or unusable.
    KeyDerivation(String),
    /// A miniscript expression parsed but failed sanity analysis. Carries
    /// the deepest offending subexpression for diagnostics.
    Insane {
        /// Textual form of the deepest insane subexpression.
        subexpr: String,
        /// Why it was rejected.
        reason: miniscript::Insanity,
    },
    /// Expression nesting exceeded [`MAX_RECURSION_DEPTH`].
    MaxRecursionDepthExceeded,
    /// BIP-32 derivation failure.
    Bip32(String),
    /// secp256k1 rejected a key or tweak.
    Secp(secp256k1::Error),
    /// Two caches disagreed about an entry during a merge.
    CacheMismatch(&'static str),
    /// Got something we were not expecting.
    Unexpected(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::MissingChecksum => f.write_str("missing checksum"),
            Error::BadChecksum(ref s) => write!(f, "malformed checksum: {}", s),
            Error::ChecksumMismatch { ref provided, ref computed } => write!(
                f,
                "provided checksum '{}' does not match computed checksum '{}'",
                provided, computed
            ),
            Error::InvalidChar(c) => write!(f, "invalid character '{}'", c),
            Error::Syntax(ref s) => write!(f, "{}", s),
            Error::Context(ref s) => write!(f, "{}", s),
            Error::KeyDerivation(ref s) => write!(f, "{}", s),
            Error::Insane { ref subexpr, ref reason } => write!(f, "{} {}", subexpr, reason),
            Error::MaxRecursionDepthExceeded => f.write_str("expression nesting too deep"),
            Error::Bip32(ref s) => write!(f, "bip32: {}", s),
            Error::Secp(ref e) => write!(f, "secp256k1: {}", e),
            Error::CacheMismatch(s) => write!(f, "cache merge conflict: {}", s),
            Error::Unexpected(ref s) => write!(f, "unexpected «{}»", s),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Secp(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Error { Error::Secp(e) }
}

impl From<bip32::Error> for Error {
    fn from(e: bip32::Error) -> Error { Error::Bip32(e.to_string()) }
}

pub(crate) fn errstr(s: &str) -> Error { Error::Unexpected(s.to_owned()) }

/// Serialize a type as its display string and parse it back on
/// deserialization. Descriptors and PSBTs interchange textually.
#[cfg(feature = "serde")]
macro_rules! serde_string_impl {
    ($name:ident, $expecting:literal) => {
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                use core::str::FromStr;

                let s = <&str>::deserialize(d)?;
                $name::from_str(s).map_err(serde::de::Error::custom)
            }
        }
    };
}
#[cfg(feature = "serde")]
pub(crate) use serde_string_impl;

/// Number of bytes a minimally-encoded script number push of `n` occupies,
/// including the length/opcode byte.
pub(crate) fn script_num_size(n: usize) -> usize {
    match n {
        n if n <= 16 => 1,
        n if n < 0x80 => 2,
        n if n < 0x8000 => 3,
        n if n < 0x800000 => 4,
        _ => 5,
    }
}
