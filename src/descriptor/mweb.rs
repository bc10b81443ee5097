// SPDX-License-Identifier: CC0-1.0

//! MWEB stealth addresses
//!
//! A stealth address is a pair of curve points `(A, B)`. The receiver holds
//! a master *scan* secret `a` and a master *spend* keypair `(b, B_m)`; the
//! address at index `n` is derived as
//!
//! ```text
//! m_n = H_addr(n || a)        (tagged hash, interpreted as a scalar)
//! B_n = B_m + m_n·G
//! A_n = a·B_n
//! ```
//!
//! so a payer can derive one-time outputs watchable by the scan-key holder
//! without revealing the link on-chain. The per-address spend secret is
//! `b + m_n`, always computed through [`SecretSum`] so blinding-factor
//! offsets survive the addition.

use core::fmt;
use core::str::FromStr;

use bech32::{Bech32, Hrp};
use bitcoin::secp256k1::{self, Scalar, Secp256k1, SecretKey};

use crate::Error;

/// Human-readable part of the scan half of an encoded stealth address.
const SCAN_HRP: &str = "mweb";
/// Human-readable part of the spend half of an encoded stealth address.
const SPEND_HRP: &str = "ltc";

/// Domain-separation tag of the address-index hash.
const ADDRESS_TAG: u8 = b'A';

/// A one-time-derivable confidential destination: the scan point `A` and
/// spend point `B` of one MWEB subaddress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StealthAddress {
    /// The scan pubkey `A`.
    pub scan: secp256k1::PublicKey,
    /// The spend pubkey `B`.
    pub spend: secp256k1::PublicKey,
}

impl StealthAddress {
    /// The scan pubkey `A`.
    pub fn scan_pubkey(&self) -> &secp256k1::PublicKey { &self.scan }

    /// The spend pubkey `B`.
    pub fn spend_pubkey(&self) -> &secp256k1::PublicKey { &self.spend }
}

impl fmt::Display for StealthAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scan_hrp = Hrp::parse(SCAN_HRP).expect("valid hrp");
        let spend_hrp = Hrp::parse(SPEND_HRP).expect("valid hrp");
        let scan = bech32::encode::<Bech32>(scan_hrp, &self.scan.serialize())
            .map_err(|_| fmt::Error)?;
        let spend = bech32::encode::<Bech32>(spend_hrp, &self.spend.serialize())
            .map_err(|_| fmt::Error)?;
        write!(f, "{}:{}", scan, spend)
    }
}

impl FromStr for StealthAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (scan_part, spend_part) = s
            .split_once(':')
            .ok_or_else(|| Error::Syntax(format!("'{}' is not a stealth address", s)))?;
        let scan = decode_part(scan_part, SCAN_HRP)?;
        let spend = decode_part(spend_part, SPEND_HRP)?;
        Ok(StealthAddress { scan, spend })
    }
}

fn decode_part(part: &str, expected_hrp: &str) -> Result<secp256k1::PublicKey, Error> {
    let (hrp, data) = bech32::decode(part)
        .map_err(|e| Error::Syntax(format!("stealth address part '{}': {}", part, e)))?;
    if hrp.as_str() != expected_hrp {
        return Err(Error::Syntax(format!(
            "stealth address part '{}' has prefix '{}', expected '{}'",
            part, hrp, expected_hrp
        )));
    }
    secp256k1::PublicKey::from_slice(&data).map_err(Error::Secp)
}

/// The scalar `m_n` committing a scan secret to an address index.
pub(crate) fn stealth_index_hash(index: u32, scan_secret: &SecretKey) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[ADDRESS_TAG]);
    hasher.update(&index.to_le_bytes());
    hasher.update(&scan_secret.secret_bytes());
    *hasher.finalize().as_bytes()
}

/// Derive the stealth address at `index` from the master scan secret and
/// master spend pubkey.
pub(crate) fn derive_stealth_address(
    scan_secret: &SecretKey,
    master_spend: &secp256k1::PublicKey,
    index: u32,
) -> Result<StealthAddress, Error> {
    let secp = Secp256k1::new();
    let mi = scalar(stealth_index_hash(index, scan_secret))?;
    let spend = master_spend.add_exp_tweak(&secp, &mi)?;
    let scan = spend.mul_tweak(&secp, &Scalar::from(*scan_secret))?;
    Ok(StealthAddress { scan, spend })
}

/// Derive the spend secret of the stealth address at `index`.
pub(crate) fn derive_stealth_spend_key(
    scan_secret: &SecretKey,
    master_spend_secret: &SecretKey,
    index: u32,
) -> Result<SecretKey, Error> {
    let mi = stealth_index_hash(index, scan_secret);
    Ok(SecretSum::from_key(*master_spend_secret).add(mi)?.total())
}

fn scalar(bytes: [u8; 32]) -> Result<Scalar, Error> {
    Scalar::from_be_bytes(bytes)
        .map_err(|_| Error::KeyDerivation("index hash exceeds the curve order".to_owned()))
}

/// Running sum of secret scalars.
///
/// All stealth-spend derivations must go through this helper rather than
/// raw byte arithmetic: blinding-factor offsets are additive in the scalar
/// group, and this is the seam where they ride along.
#[derive(Debug, Clone, Copy)]
pub struct SecretSum {
    total: SecretKey,
}

impl SecretSum {
    /// Start a sum from a key.
    pub fn from_key(key: SecretKey) -> Self { SecretSum { total: key } }

    /// Add a 32-byte scalar to the sum.
    pub fn add(self, tweak: [u8; 32]) -> Result<Self, Error> {
        let total = self.total.add_tweak(&scalar(tweak)?)?;
        Ok(SecretSum { total })
    }

    /// The accumulated key.
    pub fn total(self) -> SecretKey { self.total }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_secret() -> SecretKey {
        SecretKey::from_slice(&[0x11; 32]).unwrap()
    }

    fn spend_secret() -> SecretKey {
        SecretKey::from_slice(&[0x22; 32]).unwrap()
    }

    #[test]
    fn address_encoding_roundtrip() {
        let secp = Secp256k1::new();
        let addr = StealthAddress {
            scan: scan_secret().public_key(&secp),
            spend: spend_secret().public_key(&secp),
        };
        let encoded = addr.to_string();
        let (scan_part, spend_part) = encoded.split_once(':').unwrap();
        assert!(scan_part.starts_with("mweb1"));
        assert!(spend_part.starts_with("ltc1"));
        assert_eq!(StealthAddress::from_str(&encoded).unwrap(), addr);
    }

    #[test]
    fn derived_addresses_are_distinct() {
        let secp = Secp256k1::new();
        let master_spend = spend_secret().public_key(&secp);
        let mut seen = std::collections::BTreeSet::new();
        for index in 0..16 {
            let addr = derive_stealth_address(&scan_secret(), &master_spend, index).unwrap();
            assert!(seen.insert(addr), "index {} repeated an address", index);
        }
    }

    #[test]
    fn spend_key_matches_spend_point() {
        // The derived spend secret must be the discrete log of the derived
        // spend point.
        let secp = Secp256k1::new();
        let master_spend = spend_secret().public_key(&secp);
        for index in [0u32, 7, 1000] {
            let addr = derive_stealth_address(&scan_secret(), &master_spend, index).unwrap();
            let spend_key =
                derive_stealth_spend_key(&scan_secret(), &spend_secret(), index).unwrap();
            assert_eq!(spend_key.public_key(&secp), addr.spend);
        }
    }

    #[test]
    fn index_hash_depends_on_index_and_secret() {
        let h0 = stealth_index_hash(0, &scan_secret());
        let h1 = stealth_index_hash(1, &scan_secret());
        let h0b = stealth_index_hash(0, &spend_secret());
        assert_ne!(h0, h1);
        assert_ne!(h0, h0b);
    }
}
