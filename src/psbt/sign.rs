// SPDX-License-Identifier: CC0-1.0

//! Signer role
//!
//! Determines the script under signature from the witness or non-witness
//! UTXO, computes the appropriate sighash, and contributes a partial
//! signature for every relevant key the signing provider holds.
//! Unsupported script types return `false` without mutating the input.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PubkeyHash, PublicKey, Script, ScriptBuf, ScriptHash, Transaction};

use super::{Error, Psbt};
use crate::descriptor::match_multisig;
use crate::provider::SigningProvider;

/// `SIGHASH_ALL`, the default signature hash type.
pub const SIGHASH_ALL: u32 = 1;

/// How the script under signature is hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SigVersion {
    /// Pre-segwit hashing over the script code.
    Base,
    /// BIP-143 v0 hashing; P2WPKH hashes an implicit P2PKH script code.
    WitnessV0Keyhash,
    /// BIP-143 v0 hashing over a witness script.
    WitnessV0Script,
}

/// The resolved spending template of one input.
#[derive(Debug, Clone)]
pub(crate) struct SolvingData {
    /// The script whose satisfaction goes into scriptSig/witness.
    pub script: ScriptBuf,
    /// Hashing scheme to sign under.
    pub sigversion: SigVersion,
    /// Redeem script when the scriptPubKey was P2SH.
    pub redeem_script: Option<ScriptBuf>,
    /// Witness script when the inner script was P2WSH.
    pub witness_script: Option<ScriptBuf>,
}

/// Resolve what has to be satisfied for `spk`, pulling redeem and witness
/// scripts from the PSBT input or the provider. `None` when the script
/// type is unsupported or a needed script is unavailable.
pub(crate) fn solve_script(
    spk: &Script,
    input: &super::Input,
    provider: &dyn SigningProvider,
) -> Option<SolvingData> {
    let mut redeem_script = None;

    let inner = if spk.is_p2sh() {
        let hash = ScriptHash::from_slice(&spk.as_bytes()[2..22]).expect("20 bytes");
        let redeem = input
            .redeem_script
            .clone()
            .or_else(|| provider.get_script(&hash))?;
        if redeem.script_hash() != hash {
            return None;
        }
        redeem_script = Some(redeem.clone());
        redeem
    } else {
        spk.to_owned()
    };

    if inner.is_p2wpkh() {
        return Some(SolvingData {
            script: inner,
            sigversion: SigVersion::WitnessV0Keyhash,
            redeem_script,
            witness_script: None,
        });
    }
    if inner.is_p2wsh() {
        // Witness scripts are looked up by the hash160 of the script,
        // which is ripemd160 of the 32-byte program.
        let program_hash =
            bitcoin::hashes::ripemd160::Hash::hash(&inner.as_bytes()[2..34]);
        let id = ScriptHash::from_slice(program_hash.as_byte_array()).expect("20 bytes");
        let witness_script = input
            .witness_script
            .clone()
            .or_else(|| provider.get_script(&id))?;
        if witness_script.wscript_hash().as_byte_array()[..] != inner.as_bytes()[2..34] {
            return None;
        }
        return Some(SolvingData {
            script: witness_script.clone(),
            sigversion: SigVersion::WitnessV0Script,
            redeem_script,
            witness_script: Some(witness_script),
        });
    }
    if inner.is_p2tr() || inner.witness_version().is_some() {
        // Taproot and future witness versions are not signed here.
        return None;
    }
    Some(SolvingData {
        script: inner,
        sigversion: SigVersion::Base,
        redeem_script,
        witness_script: None,
    })
}

/// The public keys whose signatures can satisfy `script`, resolved through
/// the provider and the input's derivation metadata. Also returns the
/// signature count required.
pub(crate) fn signing_pubkeys(
    script: &Script,
    input: &super::Input,
    provider: &dyn SigningProvider,
) -> (Vec<PublicKey>, usize) {
    let bytes = script.as_bytes();
    if script.is_p2pk() {
        let key_len = bytes[0] as usize;
        match PublicKey::from_slice(&bytes[1..1 + key_len]) {
            Ok(pk) => return (vec![pk], 1),
            Err(_) => return (vec![], 1),
        }
    }
    if script.is_p2pkh() || script.is_p2wpkh() {
        let range = if script.is_p2pkh() { 3..23 } else { 2..22 };
        let id = PubkeyHash::from_slice(&bytes[range]).expect("20 bytes");
        if let Some(pk) = provider.get_pubkey(&id) {
            return (vec![pk], 1);
        }
        // The updater may have left the key in the derivation map.
        for pk in input.bip32_derivations.keys() {
            if pk.pubkey_hash() == id {
                return (vec![*pk], 1);
            }
        }
        return (vec![], 1);
    }
    if let Some((threshold, keys)) = match_multisig(script) {
        return (keys, threshold as usize);
    }
    (vec![], 1)
}

/// Sign one input of `psbt` with every relevant key `provider` holds
/// (signer role).
///
/// Returns whether the input now has enough signatures to be finalized.
/// Inputs whose script type is unsupported return `Ok(false)` with no
/// mutation.
pub fn sign_psbt_input(
    provider: &dyn SigningProvider,
    psbt: &mut Psbt,
    index: usize,
    sighash_type: Option<u32>,
) -> Result<bool, Error> {
    let tx = psbt.get_unsigned_tx()?;
    if index >= psbt.inputs.len() {
        return Err(Error::IndexOutOfBounds(index));
    }
    if psbt.inputs[index].is_signed() {
        return Ok(true);
    }

    let input = &psbt.inputs[index];
    // Witness UTXOs cannot be cross-checked against the outpoint, so a
    // witness signature is mandatory when only one of those is present.
    let require_witness_sig = input.non_witness_utxo.is_none() && input.witness_utxo.is_some();
    let utxo = match input.utxo() {
        Some(utxo) => utxo,
        None => return Ok(false),
    };
    let solved = match solve_script(&utxo.script_pubkey, input, provider) {
        Some(solved) => solved,
        None => return Ok(false),
    };
    if require_witness_sig && solved.sigversion == SigVersion::Base {
        return Ok(false);
    }

    let sighash_u32 = sighash_type.or(input.sighash_type).unwrap_or(SIGHASH_ALL);
    let sighash = compute_sighash(&tx, index, &solved, utxo.value, sighash_u32)?;

    let (candidates, required) = signing_pubkeys(&solved.script, &psbt.inputs[index], provider);

    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(sighash);
    let input = &mut psbt.inputs[index];
    let mut have = 0usize;
    for pubkey in &candidates {
        if input.partial_sigs.contains_key(pubkey) {
            have += 1;
            continue;
        }
        if let Some((_, origin)) = provider.get_key_origin(&pubkey.pubkey_hash()) {
            input
                .bip32_derivations
                .entry(*pubkey)
                .or_insert((origin.fingerprint, origin.path));
        }
        let key = match provider.get_key(&pubkey.pubkey_hash()) {
            Some(key) => key,
            None => continue,
        };
        let mut sig = secp.sign_ecdsa(&message, &key.inner).serialize_der().to_vec();
        sig.push(sighash_u32 as u8);
        input.partial_sigs.insert(*pubkey, sig);
        have += 1;
        log::debug!("signed psbt input {} with key {}", index, pubkey);
    }

    if solved.sigversion != SigVersion::Base {
        // A witness signature commits to the UTXO; record it.
        input.witness_utxo = Some(utxo);
    }
    if input.redeem_script.is_none() {
        input.redeem_script = solved.redeem_script;
    }
    if input.witness_script.is_none() {
        input.witness_script = solved.witness_script;
    }

    Ok(have >= required)
}

pub(crate) fn compute_sighash(
    tx: &Transaction,
    index: usize,
    solved: &SolvingData,
    value: bitcoin::Amount,
    sighash_u32: u32,
) -> Result<[u8; 32], Error> {
    let mut cache = SighashCache::new(tx);
    match solved.sigversion {
        SigVersion::Base => cache
            .legacy_signature_hash(index, &solved.script, sighash_u32)
            .map(|h| h.to_byte_array())
            .map_err(|_| Error::SighashFailed(index)),
        SigVersion::WitnessV0Keyhash => cache
            .p2wpkh_signature_hash(
                index,
                &solved.script,
                value,
                EcdsaSighashType::from_consensus(sighash_u32),
            )
            .map(|h| h.to_byte_array())
            .map_err(|_| Error::SighashFailed(index)),
        SigVersion::WitnessV0Script => cache
            .p2wsh_signature_hash(
                index,
                &solved.script,
                value,
                EcdsaSighashType::from_consensus(sighash_u32),
            )
            .map(|h| h.to_byte_array())
            .map_err(|_| Error::SighashFailed(index)),
    }
}
