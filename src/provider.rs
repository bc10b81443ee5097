// SPDX-License-Identifier: CC0-1.0

//! # Signing providers
//!
//! Interfaces through which the descriptor engine and the PSBT roles look
//! up keys, scripts and key-origin metadata. Descriptor expansion produces
//! a [`FlatSigningProvider`]: a flat, owned accumulation of everything a
//! signer needs for the expanded scripts, borrowing nothing from the
//! descriptor itself.

use std::collections::BTreeMap;

use bitcoin::key::XOnlyPublicKey;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::{PrivateKey, PubkeyHash, PublicKey, ScriptBuf, ScriptHash};

use crate::descriptor::KeyOrigin;

/// A source of keys, scripts and metadata used while expanding descriptors
/// and signing PSBT inputs.
///
/// All methods default to "not found" so callers can implement only the
/// lookups they actually have.
pub trait SigningProvider {
    /// Look up a redeem/witness script by its script hash.
    fn get_script(&self, _id: &ScriptHash) -> Option<ScriptBuf> { None }

    /// Look up a public key by its hash160.
    fn get_pubkey(&self, _id: &PubkeyHash) -> Option<PublicKey> { None }

    /// Look up a private key by the hash160 of its public key.
    fn get_key(&self, _id: &PubkeyHash) -> Option<PrivateKey> { None }

    /// Look up origin information (master fingerprint and derivation path)
    /// for a public key.
    fn get_key_origin(&self, _id: &PubkeyHash) -> Option<(PublicKey, KeyOrigin)> { None }

    /// Look up origin information for an x-only key, trying both parities.
    fn get_key_origin_by_xonly(&self, key: &XOnlyPublicKey) -> Option<KeyOrigin> {
        let ser = key.serialize();
        for parity in [0x02u8, 0x03] {
            let mut full = [0u8; 33];
            full[0] = parity;
            full[1..].copy_from_slice(&ser);
            if let Ok(pk) = PublicKey::from_slice(&full) {
                if let Some((_, origin)) = self.get_key_origin(&pk.pubkey_hash()) {
                    return Some(origin);
                }
            }
        }
        None
    }

    /// Look up taproot spending data by taproot output key.
    fn get_taproot_spend_info(&self, _output_key: &XOnlyPublicKey) -> Option<TaprootSpendInfo> {
        None
    }
}

/// A provider that knows nothing. Stands in where an operation does not
/// need key material, e.g. expanding from a cache.
pub struct DummyProvider;

impl SigningProvider for DummyProvider {}

/// Flat, owned signing data: everything descriptor expansion learned,
/// merged into plain maps.
#[derive(Debug, Default, Clone)]
pub struct FlatSigningProvider {
    /// Scripts by script hash (redeem scripts and witness scripts alike).
    pub scripts: BTreeMap<ScriptHash, ScriptBuf>,
    /// Public keys by hash160.
    pub pubkeys: BTreeMap<PubkeyHash, PublicKey>,
    /// Key origins by hash160 of the public key.
    pub origins: BTreeMap<PubkeyHash, (PublicKey, KeyOrigin)>,
    /// Private keys by hash160 of the public key.
    pub keys: BTreeMap<PubkeyHash, PrivateKey>,
    /// Taproot spending data by output key.
    pub tr_spend_info: BTreeMap<XOnlyPublicKey, TaprootSpendInfo>,
}

impl FlatSigningProvider {
    /// A provider holding nothing.
    pub fn new() -> Self { Self::default() }

    /// Absorb everything `other` holds. Entries already present win, which
    /// is immaterial in practice since colliding entries are derived from
    /// the same key material.
    pub fn merge(&mut self, other: FlatSigningProvider) {
        for (k, v) in other.scripts {
            self.scripts.entry(k).or_insert(v);
        }
        for (k, v) in other.pubkeys {
            self.pubkeys.entry(k).or_insert(v);
        }
        for (k, v) in other.origins {
            self.origins.entry(k).or_insert(v);
        }
        for (k, v) in other.keys {
            self.keys.entry(k).or_insert(v);
        }
        for (k, v) in other.tr_spend_info {
            self.tr_spend_info.entry(k).or_insert(v);
        }
    }

    /// Record a private key together with the public key it corresponds to.
    pub fn insert_key(&mut self, key: PrivateKey, pubkey: PublicKey) {
        let id = pubkey.pubkey_hash();
        self.pubkeys.insert(id, pubkey);
        self.keys.insert(id, key);
    }
}

impl SigningProvider for FlatSigningProvider {
    fn get_script(&self, id: &ScriptHash) -> Option<ScriptBuf> { self.scripts.get(id).cloned() }

    fn get_pubkey(&self, id: &PubkeyHash) -> Option<PublicKey> { self.pubkeys.get(id).copied() }

    fn get_key(&self, id: &PubkeyHash) -> Option<PrivateKey> { self.keys.get(id).copied() }

    fn get_key_origin(&self, id: &PubkeyHash) -> Option<(PublicKey, KeyOrigin)> {
        self.origins.get(id).cloned()
    }

    fn get_taproot_spend_info(&self, output_key: &XOnlyPublicKey) -> Option<TaprootSpendInfo> {
        self.tr_spend_info.get(output_key).cloned()
    }
}
