// SPDX-License-Identifier: CC0-1.0

//! Finalizer and extractor roles
//!
//! Assembles final scriptSigs and script witnesses from the collected
//! partial signatures, clears the intermediate metadata, and extracts the
//! broadcastable transaction once every input is final.

use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::{PubkeyHash, PublicKey, Script, ScriptBuf, Transaction, Witness};

use super::sign::{solve_script, SigVersion};
use super::{Error, Input, Psbt};
use crate::descriptor::match_multisig;
use crate::provider::DummyProvider;

/// Finalize every input that has collected enough signatures (finalizer
/// role). Returns whether the PSBT is now complete.
pub fn finalize_psbt(psbt: &mut Psbt) -> Result<bool, Error> {
    let mut complete = true;
    for index in 0..psbt.inputs.len() {
        complete &= finalize_input(psbt, index)?;
    }
    log::debug!(
        "finalized psbt: {} of {} inputs complete",
        psbt.inputs.len() - psbt.count_unsigned_inputs(),
        psbt.inputs.len()
    );
    Ok(complete)
}

/// Finalize one input. Returns whether it now carries final data.
pub fn finalize_input(psbt: &mut Psbt, index: usize) -> Result<bool, Error> {
    if index >= psbt.inputs.len() {
        return Err(Error::IndexOutOfBounds(index));
    }
    if psbt.inputs[index].is_signed() {
        return Ok(true);
    }

    let input = &psbt.inputs[index];
    let utxo = match input.utxo() {
        Some(utxo) => utxo,
        None => return Ok(false),
    };
    // Scripts must already be in the PSBT; the finalizer brings no keys.
    let solved = match solve_script(&utxo.script_pubkey, input, &DummyProvider) {
        Some(solved) => solved,
        None => return Ok(false),
    };

    let (script_sig, witness) = match solved.sigversion {
        SigVersion::Base => {
            let elems = match satisfy_script(&solved.script, input) {
                Some(elems) => elems,
                None => return Ok(false),
            };
            let mut builder = push_elems(Builder::new(), &elems);
            if let Some(ref redeem) = solved.redeem_script {
                builder = push_script(builder, redeem);
            }
            (builder.into_script(), None)
        }
        SigVersion::WitnessV0Keyhash => {
            let bytes = solved.script.as_bytes();
            let id = PubkeyHash::from_slice(&bytes[2..22]).expect("20 bytes");
            let (pubkey, sig) = match input
                .partial_sigs
                .iter()
                .find(|(pk, _)| pk.pubkey_hash() == id)
            {
                Some((pk, sig)) => (*pk, sig.clone()),
                None => return Ok(false),
            };
            let witness = Witness::from_slice(&[sig, pubkey.to_bytes()]);
            let script_sig = match solved.redeem_script {
                Some(ref redeem) => push_script(Builder::new(), redeem).into_script(),
                None => ScriptBuf::new(),
            };
            (script_sig, Some(witness))
        }
        SigVersion::WitnessV0Script => {
            let witness_script =
                solved.witness_script.as_ref().expect("set for v0 script spends");
            let mut elems = match satisfy_script(witness_script, input) {
                Some(elems) => elems,
                None => return Ok(false),
            };
            elems.push(witness_script.to_bytes());
            let script_sig = match solved.redeem_script {
                Some(ref redeem) => push_script(Builder::new(), redeem).into_script(),
                None => ScriptBuf::new(),
            };
            (script_sig, Some(Witness::from_slice(&elems)))
        }
    };

    // Commit the final fields and clear the intermediate metadata.
    let input = &mut psbt.inputs[index];
    if !script_sig.is_empty() {
        input.final_script_sig = Some(script_sig);
    }
    input.final_script_witness = witness;
    if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
        input.final_script_sig = Some(ScriptBuf::new());
    }
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivations.clear();
    Ok(true)
}

/// The witness/scriptSig stack satisfying a plain script template, minus
/// any enclosing redeem/witness script. `None` if signatures are missing.
fn satisfy_script(script: &Script, input: &Input) -> Option<Vec<Vec<u8>>> {
    let bytes = script.as_bytes();
    if script.is_p2pk() {
        let key_len = bytes[0] as usize;
        let pubkey = PublicKey::from_slice(&bytes[1..1 + key_len]).ok()?;
        return Some(vec![input.partial_sigs.get(&pubkey)?.clone()]);
    }
    if script.is_p2pkh() {
        let id = PubkeyHash::from_slice(&bytes[3..23]).expect("20 bytes");
        let (pubkey, sig) =
            input.partial_sigs.iter().find(|(pk, _)| pk.pubkey_hash() == id)?;
        return Some(vec![sig.clone(), pubkey.to_bytes()]);
    }
    if let Some((threshold, keys)) = match_multisig(script) {
        let mut sigs = Vec::with_capacity(threshold as usize);
        for key in &keys {
            if let Some(sig) = input.partial_sigs.get(key) {
                sigs.push(sig.clone());
                if sigs.len() == threshold as usize {
                    break;
                }
            }
        }
        if sigs.len() < threshold as usize {
            return None;
        }
        // CHECKMULTISIG pops one element more than it verifies.
        let mut elems = vec![vec![]];
        elems.extend(sigs);
        return Some(elems);
    }
    None
}

fn push_elems(mut builder: Builder, elems: &[Vec<u8>]) -> Builder {
    use bitcoin::script::PushBytesBuf;
    for elem in elems {
        builder = builder
            .push_slice(PushBytesBuf::try_from(elem.clone()).expect("stack elements fit"));
    }
    builder
}

fn push_script(builder: Builder, script: &Script) -> Builder {
    use bitcoin::script::PushBytesBuf;
    builder.push_slice(PushBytesBuf::try_from(script.to_bytes()).expect("scripts fit in a push"))
}

/// Extract the final transaction from a fully-finalized PSBT (extractor
/// role).
pub fn extract_tx(psbt: &Psbt) -> Result<Transaction, Error> {
    if let Some(index) = psbt.inputs.iter().position(|i| !i.is_signed()) {
        return Err(Error::NotFinalized(index));
    }
    let mut tx = psbt.get_unsigned_tx()?;
    for (txin, input) in tx.input.iter_mut().zip(&psbt.inputs) {
        if let Some(ref script_sig) = input.final_script_sig {
            txin.script_sig = script_sig.clone();
        }
        if let Some(ref witness) = input.final_script_witness {
            txin.witness = witness.clone();
        }
    }
    Ok(tx)
}

/// Finalize then extract, the common tail of the workflow.
pub fn finalize_and_extract(psbt: &mut Psbt) -> Result<Transaction, Error> {
    finalize_psbt(psbt)?;
    extract_tx(psbt)
}
