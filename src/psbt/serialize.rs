// SPDX-License-Identifier: CC0-1.0

//! PSBT map (de)serialization
//!
//! Each map is written as raw records and read back with the validating
//! contract: duplicate raw keys are fatal, singular fields must have a
//! one-byte key, version-gated fields are rejected outside their version,
//! and required fields are checked once the map ends.

use std::collections::BTreeSet;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource, Xpub};
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash};
use bitcoin::{PublicKey, ScriptBuf, Transaction, TxOut, Txid, Witness};

use super::raw::{
    read_compact_size, read_u32_value, read_u64_value, read_u8, read_vec, write_compact_size,
    write_key, write_pair, write_vec,
};
use super::*;

impl Psbt {
    /// Serialize to the binary wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);

        let version = self.get_version();

        if version == 0 {
            if let Ok(tx) = self.get_unsigned_tx() {
                write_key(&mut w, PSBT_GLOBAL_UNSIGNED_TX, &[]);
                write_vec(&mut w, &serialize_tx_no_witness(&tx));
            }
        }

        if version >= 2 {
            if let Some(tx_version) = self.tx_version {
                write_pair(&mut w, PSBT_GLOBAL_TX_VERSION, &[], &tx_version.to_le_bytes());
            }
            if let Some(fallback) = self.fallback_locktime {
                write_pair(&mut w, PSBT_GLOBAL_FALLBACK_LOCKTIME, &[], &fallback.to_le_bytes());
            }
            let mut count = Vec::new();
            write_compact_size(&mut count, self.inputs.len() as u64);
            write_pair(&mut w, PSBT_GLOBAL_INPUT_COUNT, &[], &count);
            let mut count = Vec::new();
            write_compact_size(&mut count, self.outputs.len() as u64);
            write_pair(&mut w, PSBT_GLOBAL_OUTPUT_COUNT, &[], &count);
            if let Some(modifiable) = self.tx_modifiable {
                write_pair(&mut w, PSBT_GLOBAL_TX_MODIFIABLE, &[], &[modifiable]);
            }
        }

        for (xpub, (fingerprint, path)) in &self.xpubs {
            write_key(&mut w, PSBT_GLOBAL_XPUB, &xpub.encode());
            write_vec(&mut w, &keysource_value(fingerprint, path));
        }

        if version > 0 {
            write_pair(&mut w, PSBT_GLOBAL_VERSION, &[], &version.to_le_bytes());
        }

        for (key, value) in &self.unknown {
            write_vec(&mut w, key);
            write_vec(&mut w, value);
        }
        w.push(0x00);

        for input in &self.inputs {
            serialize_input(&mut w, input, version);
        }
        for output in &self.outputs {
            serialize_output(&mut w, output, version);
        }
        w
    }

    /// Deserialize from the binary wire format, validating as we go.
    pub fn deserialize(bytes: &[u8]) -> Result<Psbt, Error> {
        if bytes.len() > MAX_PSBT_SIZE {
            return Err(Error::OversizedPsbt(bytes.len()));
        }
        let mut r = bytes;
        let magic: [u8; 5] = super::raw::read_array(&mut r)?;
        if magic != PSBT_MAGIC_BYTES {
            return Err(Error::InvalidMagic);
        }

        let mut psbt = Psbt::default();
        let mut key_lookup: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut found_sep = false;
        let mut input_count = 0u64;
        let mut output_count = 0u64;
        let mut found_input_count = false;
        let mut found_output_count = false;

        while !r.is_empty() {
            let key = read_vec(&mut r)?;
            if key.is_empty() {
                found_sep = true;
                break;
            }
            let type_value = key[0];
            match type_value {
                PSBT_GLOBAL_UNSIGNED_TX => {
                    if !key_lookup.insert(key.clone()) {
                        return Err(Error::DuplicateKey("unsigned tx"));
                    }
                    if key.len() != 1 {
                        return Err(Error::NonOneByteKey("global unsigned tx"));
                    }
                    let raw_tx = read_vec(&mut r)?;
                    let tx: Transaction = encode::deserialize(&raw_tx)
                        .map_err(|_| Error::InvalidValue("global unsigned tx"))?;
                    for txin in &tx.input {
                        if !txin.script_sig.is_empty() || !txin.witness.is_empty() {
                            return Err(Error::UnsignedTxHasScriptSigs);
                        }
                    }
                    input_count = tx.input.len() as u64;
                    output_count = tx.output.len() as u64;
                    psbt.unsigned_tx = Some(tx);
                }
                PSBT_GLOBAL_TX_VERSION => {
                    if !key_lookup.insert(key.clone()) {
                        return Err(Error::DuplicateKey("global transaction version"));
                    }
                    if key.len() != 1 {
                        return Err(Error::NonOneByteKey("global transaction version"));
                    }
                    psbt.tx_version = Some(read_u32_value(&mut r)? as i32);
                }
                PSBT_GLOBAL_FALLBACK_LOCKTIME => {
                    if !key_lookup.insert(key.clone()) {
                        return Err(Error::DuplicateKey("global fallback locktime"));
                    }
                    if key.len() != 1 {
                        return Err(Error::NonOneByteKey("global fallback locktime"));
                    }
                    psbt.fallback_locktime = Some(read_u32_value(&mut r)?);
                }
                PSBT_GLOBAL_INPUT_COUNT => {
                    if !key_lookup.insert(key.clone()) {
                        return Err(Error::DuplicateKey("global input count"));
                    }
                    if key.len() != 1 {
                        return Err(Error::NonOneByteKey("global input count"));
                    }
                    input_count = read_compact_value(&mut r, "global input count")?;
                    found_input_count = true;
                }
                PSBT_GLOBAL_OUTPUT_COUNT => {
                    if !key_lookup.insert(key.clone()) {
                        return Err(Error::DuplicateKey("global output count"));
                    }
                    if key.len() != 1 {
                        return Err(Error::NonOneByteKey("global output count"));
                    }
                    output_count = read_compact_value(&mut r, "global output count")?;
                    found_output_count = true;
                }
                PSBT_GLOBAL_TX_MODIFIABLE => {
                    if !key_lookup.insert(key.clone()) {
                        return Err(Error::DuplicateKey("tx modifiable flags"));
                    }
                    if key.len() != 1 {
                        return Err(Error::NonOneByteKey("global tx modifiable flags"));
                    }
                    let value = read_vec(&mut r)?;
                    if value.len() != 1 {
                        return Err(Error::InvalidValue("global tx modifiable flags"));
                    }
                    psbt.tx_modifiable = Some(value[0]);
                }
                PSBT_GLOBAL_XPUB => {
                    let xpub = Xpub::decode(&key[1..])
                        .map_err(|_| Error::InvalidKeyData("global xpub"))?;
                    if psbt.xpubs.contains_key(&xpub) {
                        return Err(Error::DuplicateKey("global xpub"));
                    }
                    let value = read_vec(&mut r)?;
                    psbt.xpubs.insert(xpub, parse_keysource_value(&value, "global xpub")?);
                }
                PSBT_GLOBAL_VERSION => {
                    if psbt.version.is_some() {
                        return Err(Error::DuplicateKey("version"));
                    }
                    if key.len() != 1 {
                        return Err(Error::NonOneByteKey("global version"));
                    }
                    let version = read_u32_value(&mut r)?;
                    if version > PSBT_HIGHEST_VERSION {
                        return Err(Error::UnsupportedVersion(version));
                    }
                    psbt.version = Some(version);
                }
                _ => {
                    if psbt.unknown.contains_key(&key) {
                        return Err(Error::DuplicateKey("unknown global value"));
                    }
                    let value = read_vec(&mut r)?;
                    psbt.unknown.insert(key, value);
                }
            }
        }

        if !found_sep {
            return Err(Error::MissingSeparator("the global map"));
        }

        let version = psbt.get_version();
        if version == 0 {
            if psbt.unsigned_tx.is_none() {
                return Err(Error::NoUnsignedTx);
            }
            if psbt.tx_version.is_some() {
                return Err(Error::FieldNotAllowed { field: "PSBT_GLOBAL_TX_VERSION", version });
            }
            if psbt.fallback_locktime.is_some() {
                return Err(Error::FieldNotAllowed {
                    field: "PSBT_GLOBAL_FALLBACK_LOCKTIME",
                    version,
                });
            }
            if found_input_count {
                return Err(Error::FieldNotAllowed { field: "PSBT_GLOBAL_INPUT_COUNT", version });
            }
            if found_output_count {
                return Err(Error::FieldNotAllowed {
                    field: "PSBT_GLOBAL_OUTPUT_COUNT",
                    version,
                });
            }
            if psbt.tx_modifiable.is_some() {
                return Err(Error::FieldNotAllowed {
                    field: "PSBT_GLOBAL_TX_MODIFIABLE",
                    version,
                });
            }
        }
        if version == 1 {
            return Err(Error::UnsupportedVersion(1));
        }
        if version >= 2 {
            if psbt.tx_version.is_none() {
                return Err(Error::FieldRequired { field: "PSBT_GLOBAL_TX_VERSION", version });
            }
            if !found_input_count {
                return Err(Error::FieldRequired { field: "PSBT_GLOBAL_INPUT_COUNT", version });
            }
            if !found_output_count {
                return Err(Error::FieldRequired { field: "PSBT_GLOBAL_OUTPUT_COUNT", version });
            }
            if psbt.unsigned_tx.is_some() {
                return Err(Error::FieldNotAllowed { field: "PSBT_GLOBAL_UNSIGNED_TX", version });
            }
        }

        while !r.is_empty() && (psbt.inputs.len() as u64) < input_count {
            let input = deserialize_input(&mut r, version)?;
            // The non-witness UTXO must pay the declared outpoint.
            if let Some(ref utxo_tx) = input.non_witness_utxo {
                let txid = utxo_tx.compute_txid();
                let declared = match psbt.unsigned_tx {
                    Some(ref tx) => Some(tx.input[psbt.inputs.len()].previous_output.txid),
                    None => input.previous_txid,
                };
                if declared.map_or(false, |d| d != txid) {
                    return Err(Error::UtxoMismatch);
                }
            }
            psbt.inputs.push(input);
        }
        if psbt.inputs.len() as u64 != input_count {
            return Err(Error::CountMismatch("inputs"));
        }

        while !r.is_empty() && (psbt.outputs.len() as u64) < output_count {
            psbt.outputs.push(deserialize_output(&mut r, version)?);
        }
        if psbt.outputs.len() as u64 != output_count {
            return Err(Error::CountMismatch("outputs"));
        }

        if !r.is_empty() {
            return Err(Error::TrailingData);
        }

        psbt.cache_unsigned_tx_pieces();
        Ok(psbt)
    }
}

/// Serialize a transaction stripped of witness data, the form
/// `UNSIGNED_TX` and `NON_WITNESS_UTXO` values are carried in.
fn serialize_tx_no_witness(tx: &Transaction) -> Vec<u8> {
    let mut stripped = tx.clone();
    for txin in &mut stripped.input {
        txin.witness = Witness::default();
    }
    encode::serialize(&stripped)
}

fn keysource_value(fingerprint: &Fingerprint, path: &DerivationPath) -> Vec<u8> {
    let mut value = Vec::with_capacity(4 + 4 * path.len());
    value.extend_from_slice(fingerprint.as_bytes());
    for child in path {
        value.extend_from_slice(&u32::from(*child).to_le_bytes());
    }
    value
}

fn parse_keysource_value(value: &[u8], field: &'static str) -> Result<KeySource, Error> {
    if value.len() < 4 || value.len() % 4 != 0 {
        return Err(Error::InvalidValue(field));
    }
    let fingerprint = Fingerprint::from(<[u8; 4]>::try_from(&value[..4]).expect("4 bytes"));
    let path: Vec<ChildNumber> = value[4..]
        .chunks_exact(4)
        .map(|chunk| {
            ChildNumber::from(u32::from_le_bytes(<[u8; 4]>::try_from(chunk).expect("4 bytes")))
        })
        .collect();
    Ok((fingerprint, path.into()))
}

fn read_compact_value(r: &mut &[u8], field: &'static str) -> Result<u64, Error> {
    let value = read_vec(r)?;
    let mut inner = value.as_slice();
    let n = read_compact_size(&mut inner)?;
    if !inner.is_empty() {
        return Err(Error::InvalidValue(field));
    }
    Ok(n)
}

fn serialize_hd_keypaths(
    w: &mut Vec<u8>,
    keypaths: &std::collections::BTreeMap<PublicKey, KeySource>,
    type_value: u8,
) {
    for (pubkey, (fingerprint, path)) in keypaths {
        write_key(w, type_value, &pubkey.to_bytes());
        write_vec(w, &keysource_value(fingerprint, path));
    }
}

fn deserialize_hd_keypath(
    r: &mut &[u8],
    key: &[u8],
    keypaths: &mut std::collections::BTreeMap<PublicKey, KeySource>,
    field: &'static str,
) -> Result<(), Error> {
    if key.len() != 34 && key.len() != 66 {
        return Err(Error::InvalidKeyData(field));
    }
    let pubkey = PublicKey::from_slice(&key[1..]).map_err(|_| Error::InvalidKeyData(field))?;
    if keypaths.contains_key(&pubkey) {
        return Err(Error::DuplicateKey(field));
    }
    let value = read_vec(r)?;
    keypaths.insert(pubkey, parse_keysource_value(&value, field)?);
    Ok(())
}

fn serialize_input(w: &mut Vec<u8>, input: &Input, version: u32) {
    if let Some(ref tx) = input.non_witness_utxo {
        write_key(w, PSBT_IN_NON_WITNESS_UTXO, &[]);
        write_vec(w, &serialize_tx_no_witness(tx));
    }
    if let Some(ref utxo) = input.witness_utxo {
        write_key(w, PSBT_IN_WITNESS_UTXO, &[]);
        write_vec(w, &encode::serialize(utxo));
    }

    if !input.is_signed() {
        for (pubkey, sig) in &input.partial_sigs {
            write_pair(w, PSBT_IN_PARTIAL_SIG, &pubkey.to_bytes(), sig);
        }
        if let Some(sighash) = input.sighash_type {
            write_pair(w, PSBT_IN_SIGHASH, &[], &sighash.to_le_bytes());
        }
        if let Some(ref script) = input.redeem_script {
            write_pair(w, PSBT_IN_REDEEMSCRIPT, &[], script.as_bytes());
        }
        if let Some(ref script) = input.witness_script {
            write_pair(w, PSBT_IN_WITNESSSCRIPT, &[], script.as_bytes());
        }
        serialize_hd_keypaths(w, &input.bip32_derivations, PSBT_IN_BIP32_DERIVATION);
        for (hash, preimage) in &input.ripemd160_preimages {
            write_pair(w, PSBT_IN_RIPEMD160, hash.as_byte_array(), preimage);
        }
        for (hash, preimage) in &input.sha256_preimages {
            write_pair(w, PSBT_IN_SHA256, hash.as_byte_array(), preimage);
        }
        for (hash, preimage) in &input.hash160_preimages {
            write_pair(w, PSBT_IN_HASH160, hash.as_byte_array(), preimage);
        }
        for (hash, preimage) in &input.hash256_preimages {
            write_pair(w, PSBT_IN_HASH256, hash.as_byte_array(), preimage);
        }
        if let Some(ref sig) = input.tap_key_sig {
            write_pair(w, PSBT_IN_TAP_KEY_SIG, &[], sig);
        }
        for ((xonly, leaf_hash), sig) in &input.tap_script_sigs {
            let mut key_data = Vec::with_capacity(64);
            key_data.extend_from_slice(&xonly.serialize());
            key_data.extend_from_slice(leaf_hash.as_byte_array());
            write_pair(w, PSBT_IN_TAP_SCRIPT_SIG, &key_data, sig);
        }
        for (control_block, (script, leaf_version)) in &input.tap_scripts {
            let mut value = script.to_bytes();
            value.push(leaf_version.to_consensus());
            write_pair(w, PSBT_IN_TAP_LEAF_SCRIPT, &control_block.serialize(), &value);
        }
        for (xonly, (leaf_hashes, (fingerprint, path))) in &input.tap_bip32_derivations {
            let mut value = Vec::new();
            write_compact_size(&mut value, leaf_hashes.len() as u64);
            for leaf_hash in leaf_hashes {
                value.extend_from_slice(leaf_hash.as_byte_array());
            }
            value.extend_from_slice(&keysource_value(fingerprint, path));
            write_pair(w, PSBT_IN_TAP_BIP32_DERIVATION, &xonly.serialize(), &value);
        }
        if let Some(ref xonly) = input.tap_internal_key {
            write_pair(w, PSBT_IN_TAP_INTERNAL_KEY, &[], &xonly.serialize());
        }
        if let Some(ref root) = input.tap_merkle_root {
            write_pair(w, PSBT_IN_TAP_MERKLE_ROOT, &[], root.as_byte_array());
        }
    }

    if let Some(ref script) = input.final_script_sig {
        write_pair(w, PSBT_IN_SCRIPTSIG, &[], script.as_bytes());
    }
    if let Some(ref witness) = input.final_script_witness {
        write_key(w, PSBT_IN_SCRIPTWITNESS, &[]);
        write_vec(w, &encode::serialize(witness));
    }

    if version >= 2 {
        if let Some(ref txid) = input.previous_txid {
            write_pair(w, PSBT_IN_PREVIOUS_TXID, &[], txid.as_byte_array());
        }
        if let Some(index) = input.output_index {
            write_pair(w, PSBT_IN_OUTPUT_INDEX, &[], &index.to_le_bytes());
        }
        if let Some(sequence) = input.sequence {
            write_pair(w, PSBT_IN_SEQUENCE, &[], &sequence.to_le_bytes());
        }
        if let Some(locktime) = input.time_locktime {
            write_pair(w, PSBT_IN_REQUIRED_TIME_LOCKTIME, &[], &locktime.to_le_bytes());
        }
        if let Some(locktime) = input.height_locktime {
            write_pair(w, PSBT_IN_REQUIRED_HEIGHT_LOCKTIME, &[], &locktime.to_le_bytes());
        }
    }

    for (key, value) in &input.unknown {
        write_vec(w, key);
        write_vec(w, value);
    }
    w.push(0x00);
}

fn deserialize_input(r: &mut &[u8], version: u32) -> Result<Input, Error> {
    let mut input = Input::default();
    let mut key_lookup: BTreeSet<Vec<u8>> = BTreeSet::new();
    let mut found_sep = false;

    while !r.is_empty() {
        let key = read_vec(r)?;
        if key.is_empty() {
            found_sep = true;
            break;
        }
        let type_value = key[0];
        match type_value {
            PSBT_IN_NON_WITNESS_UTXO => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input non-witness utxo"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("non-witness utxo"));
                }
                let raw_tx = read_vec(r)?;
                input.non_witness_utxo = Some(
                    encode::deserialize(&raw_tx)
                        .map_err(|_| Error::InvalidValue("input non-witness utxo"))?,
                );
            }
            PSBT_IN_WITNESS_UTXO => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input witness utxo"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("witness utxo"));
                }
                let raw = read_vec(r)?;
                let utxo: TxOut = encode::deserialize(&raw)
                    .map_err(|_| Error::InvalidValue("input witness utxo"))?;
                input.witness_utxo = Some(utxo);
            }
            PSBT_IN_PARTIAL_SIG => {
                if key.len() != 34 && key.len() != 66 {
                    return Err(Error::InvalidKeyData("partial signature pubkey"));
                }
                let pubkey = PublicKey::from_slice(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("partial signature pubkey"))?;
                if input.partial_sigs.contains_key(&pubkey) {
                    return Err(Error::DuplicateKey("input partial signature for pubkey"));
                }
                let sig = read_vec(r)?;
                input.partial_sigs.insert(pubkey, sig);
            }
            PSBT_IN_SIGHASH => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input sighash type"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("sighash type"));
                }
                input.sighash_type = Some(read_u32_value(r)?);
            }
            PSBT_IN_REDEEMSCRIPT => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input redeemScript"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("input redeemScript"));
                }
                input.redeem_script = Some(ScriptBuf::from_bytes(read_vec(r)?));
            }
            PSBT_IN_WITNESSSCRIPT => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input witnessScript"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("input witnessScript"));
                }
                input.witness_script = Some(ScriptBuf::from_bytes(read_vec(r)?));
            }
            PSBT_IN_BIP32_DERIVATION => {
                deserialize_hd_keypath(r, &key, &mut input.bip32_derivations, "input keypath")?;
            }
            PSBT_IN_SCRIPTSIG => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input final scriptSig"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("final scriptSig"));
                }
                input.final_script_sig = Some(ScriptBuf::from_bytes(read_vec(r)?));
            }
            PSBT_IN_SCRIPTWITNESS => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input final scriptWitness"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("final scriptWitness"));
                }
                let raw = read_vec(r)?;
                let witness: Witness = encode::deserialize(&raw)
                    .map_err(|_| Error::InvalidValue("input final scriptWitness"))?;
                input.final_script_witness = Some(witness);
            }
            PSBT_IN_RIPEMD160 => {
                let hash = bitcoin::hashes::ripemd160::Hash::from_slice(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("ripemd160 preimage"))?;
                if input.ripemd160_preimages.contains_key(&hash) {
                    return Err(Error::DuplicateKey("ripemd160 preimage"));
                }
                input.ripemd160_preimages.insert(hash, read_vec(r)?);
            }
            PSBT_IN_SHA256 => {
                let hash = bitcoin::hashes::sha256::Hash::from_slice(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("sha256 preimage"))?;
                if input.sha256_preimages.contains_key(&hash) {
                    return Err(Error::DuplicateKey("sha256 preimage"));
                }
                input.sha256_preimages.insert(hash, read_vec(r)?);
            }
            PSBT_IN_HASH160 => {
                let hash = bitcoin::hashes::hash160::Hash::from_slice(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("hash160 preimage"))?;
                if input.hash160_preimages.contains_key(&hash) {
                    return Err(Error::DuplicateKey("hash160 preimage"));
                }
                input.hash160_preimages.insert(hash, read_vec(r)?);
            }
            PSBT_IN_HASH256 => {
                let hash = bitcoin::hashes::sha256d::Hash::from_slice(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("hash256 preimage"))?;
                if input.hash256_preimages.contains_key(&hash) {
                    return Err(Error::DuplicateKey("hash256 preimage"));
                }
                input.hash256_preimages.insert(hash, read_vec(r)?);
            }
            PSBT_IN_PREVIOUS_TXID => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("previous txid"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("previous txid"));
                }
                if version == 0 {
                    return Err(Error::FieldNotAllowed {
                        field: "PSBT_IN_PREVIOUS_TXID",
                        version,
                    });
                }
                let value = read_vec(r)?;
                input.previous_txid = Some(
                    Txid::from_slice(&value)
                        .map_err(|_| Error::InvalidValue("previous txid"))?,
                );
            }
            PSBT_IN_OUTPUT_INDEX => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("previous output's index"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("previous output's index"));
                }
                if version == 0 {
                    return Err(Error::FieldNotAllowed {
                        field: "PSBT_IN_OUTPUT_INDEX",
                        version,
                    });
                }
                input.output_index = Some(read_u32_value(r)?);
            }
            PSBT_IN_SEQUENCE => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("sequence"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("sequence"));
                }
                if version == 0 {
                    return Err(Error::FieldNotAllowed { field: "PSBT_IN_SEQUENCE", version });
                }
                input.sequence = Some(read_u32_value(r)?);
            }
            PSBT_IN_REQUIRED_TIME_LOCKTIME => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("required time based locktime"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("required time based locktime"));
                }
                if version == 0 {
                    return Err(Error::FieldNotAllowed {
                        field: "PSBT_IN_REQUIRED_TIME_LOCKTIME",
                        version,
                    });
                }
                let locktime = read_u32_value(r)?;
                if locktime < LOCKTIME_THRESHOLD {
                    return Err(Error::InvalidValue("required time based locktime"));
                }
                input.time_locktime = Some(locktime);
            }
            PSBT_IN_REQUIRED_HEIGHT_LOCKTIME => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("required height based locktime"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("required height based locktime"));
                }
                if version == 0 {
                    return Err(Error::FieldNotAllowed {
                        field: "PSBT_IN_REQUIRED_HEIGHT_LOCKTIME",
                        version,
                    });
                }
                let locktime = read_u32_value(r)?;
                if locktime >= LOCKTIME_THRESHOLD {
                    return Err(Error::InvalidValue("required height based locktime"));
                }
                input.height_locktime = Some(locktime);
            }
            PSBT_IN_TAP_KEY_SIG => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input taproot key signature"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("taproot key signature"));
                }
                let sig = read_vec(r)?;
                if sig.len() != 64 && sig.len() != 65 {
                    return Err(Error::InvalidValue("input taproot key signature"));
                }
                input.tap_key_sig = Some(sig);
            }
            PSBT_IN_TAP_SCRIPT_SIG => {
                if key.len() != 65 {
                    return Err(Error::InvalidKeyData("taproot script signature"));
                }
                let xonly = XOnlyPublicKey::from_slice(&key[1..33])
                    .map_err(|_| Error::InvalidKeyData("taproot script signature"))?;
                let leaf_hash = TapLeafHash::from_slice(&key[33..65])
                    .map_err(|_| Error::InvalidKeyData("taproot script signature"))?;
                if input.tap_script_sigs.contains_key(&(xonly, leaf_hash)) {
                    return Err(Error::DuplicateKey("input taproot script signature"));
                }
                input.tap_script_sigs.insert((xonly, leaf_hash), read_vec(r)?);
            }
            PSBT_IN_TAP_LEAF_SCRIPT => {
                let control_block = ControlBlock::decode(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("taproot leaf script"))?;
                if input.tap_scripts.contains_key(&control_block) {
                    return Err(Error::DuplicateKey("input taproot leaf script"));
                }
                let mut value = read_vec(r)?;
                let leaf_version = match value.pop() {
                    Some(v) => LeafVersion::from_consensus(v)
                        .map_err(|_| Error::InvalidValue("taproot leaf script"))?,
                    None => return Err(Error::InvalidValue("taproot leaf script")),
                };
                input
                    .tap_scripts
                    .insert(control_block, (ScriptBuf::from_bytes(value), leaf_version));
            }
            PSBT_IN_TAP_BIP32_DERIVATION => {
                if key.len() != 33 {
                    return Err(Error::InvalidKeyData("taproot keypath"));
                }
                let xonly = XOnlyPublicKey::from_slice(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("taproot keypath"))?;
                if input.tap_bip32_derivations.contains_key(&xonly) {
                    return Err(Error::DuplicateKey("input taproot keypath"));
                }
                let value = read_vec(r)?;
                input
                    .tap_bip32_derivations
                    .insert(xonly, parse_tap_keysource_value(&value, "taproot keypath")?);
            }
            PSBT_IN_TAP_INTERNAL_KEY => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input taproot internal key"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("taproot internal key"));
                }
                let value = read_vec(r)?;
                input.tap_internal_key = Some(
                    XOnlyPublicKey::from_slice(&value)
                        .map_err(|_| Error::InvalidValue("input taproot internal key"))?,
                );
            }
            PSBT_IN_TAP_MERKLE_ROOT => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("input taproot merkle root"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("taproot merkle root"));
                }
                let value = read_vec(r)?;
                input.tap_merkle_root = Some(
                    TapNodeHash::from_slice(&value)
                        .map_err(|_| Error::InvalidValue("input taproot merkle root"))?,
                );
            }
            _ => {
                if input.unknown.contains_key(&key) {
                    return Err(Error::DuplicateKey("unknown input value"));
                }
                let value = read_vec(r)?;
                input.unknown.insert(key, value);
            }
        }
    }

    if !found_sep {
        return Err(Error::MissingSeparator("an input map"));
    }

    if version >= 2 {
        if input.previous_txid.is_none() {
            return Err(Error::FieldRequired { field: "PSBT_IN_PREVIOUS_TXID", version });
        }
        if input.output_index.is_none() {
            return Err(Error::FieldRequired { field: "PSBT_IN_OUTPUT_INDEX", version });
        }
    }

    Ok(input)
}

fn parse_tap_keysource_value(
    value: &[u8],
    field: &'static str,
) -> Result<(Vec<TapLeafHash>, KeySource), Error> {
    let mut inner = value;
    let n_leaves = read_compact_size(&mut inner)?;
    if n_leaves.saturating_mul(32) > inner.len() as u64 {
        return Err(Error::InvalidValue(field));
    }
    let mut leaf_hashes = Vec::with_capacity(n_leaves as usize);
    for _ in 0..n_leaves {
        let bytes: [u8; 32] = super::raw::read_array(&mut inner)?;
        leaf_hashes.push(TapLeafHash::from_byte_array(bytes));
    }
    Ok((leaf_hashes, parse_keysource_value(inner, field)?))
}

fn serialize_output(w: &mut Vec<u8>, output: &Output, version: u32) {
    if let Some(ref script) = output.redeem_script {
        write_pair(w, PSBT_OUT_REDEEMSCRIPT, &[], script.as_bytes());
    }
    if let Some(ref script) = output.witness_script {
        write_pair(w, PSBT_OUT_WITNESSSCRIPT, &[], script.as_bytes());
    }
    serialize_hd_keypaths(w, &output.bip32_derivations, PSBT_OUT_BIP32_DERIVATION);
    if let Some(ref xonly) = output.tap_internal_key {
        write_pair(w, PSBT_OUT_TAP_INTERNAL_KEY, &[], &xonly.serialize());
    }
    if let Some(ref tree) = output.tap_tree {
        let mut value = Vec::new();
        for (depth, leaf_version, script) in tree {
            value.push(*depth);
            value.push(leaf_version.to_consensus());
            write_vec(&mut value, script.as_bytes());
        }
        write_pair(w, PSBT_OUT_TAP_TREE, &[], &value);
    }
    for (xonly, (leaf_hashes, (fingerprint, path))) in &output.tap_bip32_derivations {
        let mut value = Vec::new();
        write_compact_size(&mut value, leaf_hashes.len() as u64);
        for leaf_hash in leaf_hashes {
            value.extend_from_slice(leaf_hash.as_byte_array());
        }
        value.extend_from_slice(&keysource_value(fingerprint, path));
        write_pair(w, PSBT_OUT_TAP_BIP32_DERIVATION, &xonly.serialize(), &value);
    }

    if version >= 2 {
        if let Some(amount) = output.amount {
            write_pair(w, PSBT_OUT_AMOUNT, &[], &amount.to_le_bytes());
        }
        if let Some(ref script) = output.script {
            write_pair(w, PSBT_OUT_SCRIPT, &[], script.as_bytes());
        }
    }

    for (key, value) in &output.unknown {
        write_vec(w, key);
        write_vec(w, value);
    }
    w.push(0x00);
}

fn deserialize_output(r: &mut &[u8], version: u32) -> Result<Output, Error> {
    let mut output = Output::default();
    let mut key_lookup: BTreeSet<Vec<u8>> = BTreeSet::new();
    let mut found_sep = false;

    while !r.is_empty() {
        let key = read_vec(r)?;
        if key.is_empty() {
            found_sep = true;
            break;
        }
        let type_value = key[0];
        match type_value {
            PSBT_OUT_REDEEMSCRIPT => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("output redeemScript"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("output redeemScript"));
                }
                output.redeem_script = Some(ScriptBuf::from_bytes(read_vec(r)?));
            }
            PSBT_OUT_WITNESSSCRIPT => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("output witnessScript"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("output witnessScript"));
                }
                output.witness_script = Some(ScriptBuf::from_bytes(read_vec(r)?));
            }
            PSBT_OUT_BIP32_DERIVATION => {
                deserialize_hd_keypath(r, &key, &mut output.bip32_derivations, "output keypath")?;
            }
            PSBT_OUT_AMOUNT => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("output amount"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("output amount"));
                }
                if version == 0 {
                    return Err(Error::FieldNotAllowed { field: "PSBT_OUT_AMOUNT", version });
                }
                output.amount = Some(read_u64_value(r)? as i64);
            }
            PSBT_OUT_SCRIPT => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("output script"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("output script"));
                }
                if version == 0 {
                    return Err(Error::FieldNotAllowed { field: "PSBT_OUT_SCRIPT", version });
                }
                output.script = Some(ScriptBuf::from_bytes(read_vec(r)?));
            }
            PSBT_OUT_TAP_INTERNAL_KEY => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("output taproot internal key"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("output taproot internal key"));
                }
                let value = read_vec(r)?;
                output.tap_internal_key = Some(
                    XOnlyPublicKey::from_slice(&value)
                        .map_err(|_| Error::InvalidValue("output taproot internal key"))?,
                );
            }
            PSBT_OUT_TAP_TREE => {
                if !key_lookup.insert(key.clone()) {
                    return Err(Error::DuplicateKey("output taproot tree"));
                }
                if key.len() != 1 {
                    return Err(Error::NonOneByteKey("output taproot tree"));
                }
                let value = read_vec(r)?;
                let mut inner = value.as_slice();
                let mut tree = Vec::new();
                while !inner.is_empty() {
                    let depth = read_u8(&mut inner)?;
                    let leaf_version = LeafVersion::from_consensus(read_u8(&mut inner)?)
                        .map_err(|_| Error::InvalidValue("output taproot tree"))?;
                    let script = ScriptBuf::from_bytes(read_vec(&mut inner)?);
                    tree.push((depth, leaf_version, script));
                }
                output.tap_tree = Some(tree);
            }
            PSBT_OUT_TAP_BIP32_DERIVATION => {
                if key.len() != 33 {
                    return Err(Error::InvalidKeyData("output taproot keypath"));
                }
                let xonly = XOnlyPublicKey::from_slice(&key[1..])
                    .map_err(|_| Error::InvalidKeyData("output taproot keypath"))?;
                if output.tap_bip32_derivations.contains_key(&xonly) {
                    return Err(Error::DuplicateKey("output taproot keypath"));
                }
                let value = read_vec(r)?;
                output
                    .tap_bip32_derivations
                    .insert(xonly, parse_tap_keysource_value(&value, "output taproot keypath")?);
            }
            _ => {
                if output.unknown.contains_key(&key) {
                    return Err(Error::DuplicateKey("unknown output value"));
                }
                let value = read_vec(r)?;
                output.unknown.insert(key, value);
            }
        }
    }

    if !found_sep {
        return Err(Error::MissingSeparator("an output map"));
    }

    if version >= 2 {
        if output.amount.is_none() {
            return Err(Error::FieldRequired { field: "PSBT_OUT_AMOUNT", version });
        }
        if output.script.is_none() {
            return Err(Error::FieldRequired { field: "PSBT_OUT_SCRIPT", version });
        }
    }

    Ok(output)
}
