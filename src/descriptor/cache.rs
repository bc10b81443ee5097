// SPDX-License-Identifier: CC0-1.0

//! Descriptor derivation cache
//!
//! Memoizes the expensive parts of descriptor expansion: extended-key
//! derivations (keyed by the position of the key expression within the
//! descriptor) and MWEB stealth addresses (keyed by address index). The
//! cache is owned by the caller and grows monotonically; merging two caches
//! detects disagreement instead of silently overwriting.

use std::collections::BTreeMap;

use bitcoin::bip32::Xpub;

use super::mweb::StealthAddress;
use crate::Error;

/// Cached expansion state of a single descriptor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DescriptorCache {
    /// The unhardened root above the wildcard, per key expression.
    parent_xpubs: BTreeMap<u32, Xpub>,
    /// Per-index expansions of hardened-wildcard key expressions.
    derived_xpubs: BTreeMap<u32, BTreeMap<u32, Xpub>>,
    /// The xpub at the last hardened derivation step, per key expression.
    /// Supports normalized-form emission without private material.
    last_hardened_xpubs: BTreeMap<u32, Xpub>,
    /// Stealth addresses by MWEB address index.
    mweb_addresses: BTreeMap<u32, StealthAddress>,
}

impl DescriptorCache {
    /// An empty cache.
    pub fn new() -> Self { Self::default() }

    /// Record the parent xpub of the key expression at `key_exp_pos`.
    pub fn cache_parent_xpub(&mut self, key_exp_pos: u32, xpub: Xpub) {
        self.parent_xpubs.insert(key_exp_pos, xpub);
    }

    /// Record a derived xpub at `der_index` for the key expression at
    /// `key_exp_pos`.
    pub fn cache_derived_xpub(&mut self, key_exp_pos: u32, der_index: u32, xpub: Xpub) {
        self.derived_xpubs.entry(key_exp_pos).or_default().insert(der_index, xpub);
    }

    /// Record the last-hardened xpub of the key expression at `key_exp_pos`.
    pub fn cache_last_hardened_xpub(&mut self, key_exp_pos: u32, xpub: Xpub) {
        self.last_hardened_xpubs.insert(key_exp_pos, xpub);
    }

    /// Record a stealth address by its MWEB address index.
    pub fn cache_mweb_address(&mut self, index: u32, address: StealthAddress) {
        self.mweb_addresses.insert(index, address);
    }

    /// Cached parent xpub of the key expression at `key_exp_pos`, if any.
    pub fn get_parent_xpub(&self, key_exp_pos: u32) -> Option<Xpub> {
        self.parent_xpubs.get(&key_exp_pos).copied()
    }

    /// Cached derived xpub at `der_index`, if any.
    pub fn get_derived_xpub(&self, key_exp_pos: u32, der_index: u32) -> Option<Xpub> {
        self.derived_xpubs.get(&key_exp_pos).and_then(|m| m.get(&der_index)).copied()
    }

    /// Cached last-hardened xpub, if any.
    pub fn get_last_hardened_xpub(&self, key_exp_pos: u32) -> Option<Xpub> {
        self.last_hardened_xpubs.get(&key_exp_pos).copied()
    }

    /// Cached stealth address at `index`, if any.
    pub fn get_mweb_address(&self, index: u32) -> Option<&StealthAddress> {
        self.mweb_addresses.get(&index)
    }

    /// Iterator over all cached stealth addresses.
    pub fn mweb_addresses(&self) -> impl Iterator<Item = (&u32, &StealthAddress)> {
        self.mweb_addresses.iter()
    }

    /// Absorb every entry of `other` not already present, returning the
    /// newly added entries.
    ///
    /// An entry present in both caches with a different value means either
    /// corruption or a cross-wallet mix-up, and fails the whole merge.
    pub fn merge_and_diff(&mut self, other: &DescriptorCache) -> Result<DescriptorCache, Error> {
        let mut diff = DescriptorCache::new();
        for (&pos, xpub) in &other.parent_xpubs {
            match self.get_parent_xpub(pos) {
                Some(existing) if existing != *xpub => {
                    return Err(Error::CacheMismatch(
                        "new cached parent xpub does not match already cached parent xpub",
                    ))
                }
                Some(_) => continue,
                None => {
                    self.cache_parent_xpub(pos, *xpub);
                    diff.cache_parent_xpub(pos, *xpub);
                }
            }
        }
        for (&pos, xpubs) in &other.derived_xpubs {
            for (&der_index, xpub) in xpubs {
                match self.get_derived_xpub(pos, der_index) {
                    Some(existing) if existing != *xpub => {
                        return Err(Error::CacheMismatch(
                            "new cached derived xpub does not match already cached derived xpub",
                        ))
                    }
                    Some(_) => continue,
                    None => {
                        self.cache_derived_xpub(pos, der_index, *xpub);
                        diff.cache_derived_xpub(pos, der_index, *xpub);
                    }
                }
            }
        }
        for (&pos, xpub) in &other.last_hardened_xpubs {
            match self.get_last_hardened_xpub(pos) {
                Some(existing) if existing != *xpub => {
                    return Err(Error::CacheMismatch(
                        "new cached last hardened xpub does not match already cached last hardened xpub",
                    ))
                }
                Some(_) => continue,
                None => {
                    self.cache_last_hardened_xpub(pos, *xpub);
                    diff.cache_last_hardened_xpub(pos, *xpub);
                }
            }
        }
        for (&index, address) in &other.mweb_addresses {
            match self.get_mweb_address(index) {
                Some(existing) if existing != address => {
                    return Err(Error::CacheMismatch(
                        "new cached MWEB address does not match already cached MWEB address",
                    ))
                }
                Some(_) => continue,
                None => {
                    self.cache_mweb_address(index, address.clone());
                    diff.cache_mweb_address(index, address.clone());
                }
            }
        }
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use core::str::FromStr;

    use super::*;

    fn xpub(s: &str) -> Xpub { Xpub::from_str(s).unwrap() }

    const XPUB_A: &str = "xpub6ERApfZwUNrhLCkDtcHTcxd75RbzS1ed54G1LkBUHQVHQKqhMkhgbmJbZRkrgZw4koxb5JaHWkY4ALHY2grBGRjaDMzQLcgJvLJuZZvRcEL";
    const XPUB_B: &str = "xpub68NZiKmJWnxxS6aaHmn81bvJeTESw724CRDs6HbuccFQN9Ku14VQrADWgqbhhTHBaohPX4CjNLf9fq9MYo6oDaPPLPxSb7gwQN3ih19Zm4Y";

    #[test]
    fn merge_returns_diff() {
        let mut a = DescriptorCache::new();
        a.cache_parent_xpub(0, xpub(XPUB_A));

        let mut b = DescriptorCache::new();
        b.cache_parent_xpub(0, xpub(XPUB_A));
        b.cache_derived_xpub(1, 5, xpub(XPUB_B));

        let diff = a.merge_and_diff(&b).unwrap();
        // Only the derived entry was new.
        assert_eq!(diff.get_parent_xpub(0), None);
        assert_eq!(diff.get_derived_xpub(1, 5), Some(xpub(XPUB_B)));
        assert_eq!(a.get_derived_xpub(1, 5), Some(xpub(XPUB_B)));
    }

    #[test]
    fn merge_detects_conflicts() {
        let mut a = DescriptorCache::new();
        a.cache_parent_xpub(0, xpub(XPUB_A));

        let mut b = DescriptorCache::new();
        b.cache_parent_xpub(0, xpub(XPUB_B));

        assert!(matches!(a.merge_and_diff(&b), Err(Error::CacheMismatch(_))));
        // The conflicting entry is left untouched.
        assert_eq!(a.get_parent_xpub(0), Some(xpub(XPUB_A)));
    }
}
