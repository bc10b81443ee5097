// SPDX-License-Identifier: CC0-1.0

//! # Partially Signed Transactions
//!
//! A binary key-value container for in-flight transactions, implementing
//! both PSBT version 0 (BIP-174) and version 2 (BIP-370). Version 0
//! bundles the whole transaction skeleton in a single global field; version
//! 2 spreads version, locktimes and counts across global and per-input /
//! per-output records. Both converge on a common logical view through
//! [`Psbt::get_unsigned_tx`].
//!
//! The role operations live here and in the submodules: creator and
//! combiner on [`Psbt`] itself, the signer in [`sign`], finalizer and
//! extractor in [`finalizer`].

pub mod finalizer;
pub mod raw;
mod serialize;
pub mod sign;

use core::fmt;
use std::collections::BTreeMap;
use std::error;
use std::str::FromStr;

use base64::Engine as _;
use bitcoin::bip32::{KeySource, Xpub};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash};
use bitcoin::{
    absolute, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

/// Magic prefix of every serialized PSBT.
pub const PSBT_MAGIC_BYTES: [u8; 5] = [b'p', b's', b'b', b't', 0xff];

/// Highest understood PSBT version.
pub const PSBT_HIGHEST_VERSION: u32 = 2;

/// Cap on the accepted size of a serialized PSBT (100 MiB). There is no
/// limit in the BIPs; this only prevents unbounded allocation.
pub const MAX_PSBT_SIZE: usize = 100_000_000;

/// Absolute locktimes at or above this value are UNIX timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

// Global types
pub(crate) const PSBT_GLOBAL_UNSIGNED_TX: u8 = 0x00;
pub(crate) const PSBT_GLOBAL_XPUB: u8 = 0x01;
pub(crate) const PSBT_GLOBAL_TX_VERSION: u8 = 0x02;
pub(crate) const PSBT_GLOBAL_FALLBACK_LOCKTIME: u8 = 0x03;
pub(crate) const PSBT_GLOBAL_INPUT_COUNT: u8 = 0x04;
pub(crate) const PSBT_GLOBAL_OUTPUT_COUNT: u8 = 0x05;
pub(crate) const PSBT_GLOBAL_TX_MODIFIABLE: u8 = 0x06;
pub(crate) const PSBT_GLOBAL_VERSION: u8 = 0xFB;

// Input types
pub(crate) const PSBT_IN_NON_WITNESS_UTXO: u8 = 0x00;
pub(crate) const PSBT_IN_WITNESS_UTXO: u8 = 0x01;
pub(crate) const PSBT_IN_PARTIAL_SIG: u8 = 0x02;
pub(crate) const PSBT_IN_SIGHASH: u8 = 0x03;
pub(crate) const PSBT_IN_REDEEMSCRIPT: u8 = 0x04;
pub(crate) const PSBT_IN_WITNESSSCRIPT: u8 = 0x05;
pub(crate) const PSBT_IN_BIP32_DERIVATION: u8 = 0x06;
pub(crate) const PSBT_IN_SCRIPTSIG: u8 = 0x07;
pub(crate) const PSBT_IN_SCRIPTWITNESS: u8 = 0x08;
pub(crate) const PSBT_IN_RIPEMD160: u8 = 0x0A;
pub(crate) const PSBT_IN_SHA256: u8 = 0x0B;
pub(crate) const PSBT_IN_HASH160: u8 = 0x0C;
pub(crate) const PSBT_IN_HASH256: u8 = 0x0D;
pub(crate) const PSBT_IN_PREVIOUS_TXID: u8 = 0x0e;
pub(crate) const PSBT_IN_OUTPUT_INDEX: u8 = 0x0f;
pub(crate) const PSBT_IN_SEQUENCE: u8 = 0x10;
pub(crate) const PSBT_IN_REQUIRED_TIME_LOCKTIME: u8 = 0x11;
pub(crate) const PSBT_IN_REQUIRED_HEIGHT_LOCKTIME: u8 = 0x12;
pub(crate) const PSBT_IN_TAP_KEY_SIG: u8 = 0x13;
pub(crate) const PSBT_IN_TAP_SCRIPT_SIG: u8 = 0x14;
pub(crate) const PSBT_IN_TAP_LEAF_SCRIPT: u8 = 0x15;
pub(crate) const PSBT_IN_TAP_BIP32_DERIVATION: u8 = 0x16;
pub(crate) const PSBT_IN_TAP_INTERNAL_KEY: u8 = 0x17;
pub(crate) const PSBT_IN_TAP_MERKLE_ROOT: u8 = 0x18;

// Output types
pub(crate) const PSBT_OUT_REDEEMSCRIPT: u8 = 0x00;
pub(crate) const PSBT_OUT_WITNESSSCRIPT: u8 = 0x01;
pub(crate) const PSBT_OUT_BIP32_DERIVATION: u8 = 0x02;
pub(crate) const PSBT_OUT_AMOUNT: u8 = 0x03;
pub(crate) const PSBT_OUT_SCRIPT: u8 = 0x04;
pub(crate) const PSBT_OUT_TAP_INTERNAL_KEY: u8 = 0x05;
pub(crate) const PSBT_OUT_TAP_TREE: u8 = 0x06;
pub(crate) const PSBT_OUT_TAP_BIP32_DERIVATION: u8 = 0x07;

/// PSBT wire-format and semantic errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The magic prefix was wrong.
    InvalidMagic,
    /// Ran out of bytes mid-record.
    UnexpectedEof,
    /// The input exceeded [`MAX_PSBT_SIZE`].
    OversizedPsbt(usize),
    /// The same raw key occurred twice in one map.
    DuplicateKey(&'static str),
    /// A single-value field carried key data.
    NonOneByteKey(&'static str),
    /// The key data of a typed field had the wrong shape.
    InvalidKeyData(&'static str),
    /// A field's value could not be decoded.
    InvalidValue(&'static str),
    /// A map was not terminated with a separator byte.
    MissingSeparator(&'static str),
    /// Version number above [`PSBT_HIGHEST_VERSION`], or the nonexistent
    /// version 1.
    UnsupportedVersion(u32),
    /// A field was present in a PSBT version that does not allow it.
    FieldNotAllowed {
        /// Field name.
        field: &'static str,
        /// The declared PSBT version.
        version: u32,
    },
    /// A field required by the declared PSBT version was absent.
    FieldRequired {
        /// Field name.
        field: &'static str,
        /// The declared PSBT version.
        version: u32,
    },
    /// The unsigned transaction carried signatures.
    UnsignedTxHasScriptSigs,
    /// Input/output map count disagreed with the declared count.
    CountMismatch(&'static str),
    /// A non-witness UTXO's txid does not match the declared outpoint.
    UtxoMismatch,
    /// Bytes remained after the last output map.
    TrailingData,
    /// Inputs require both a height-based and a time-based locktime.
    TimeLockConflict,
    /// Two PSBTs being merged describe different transactions.
    MergeMismatch,
    /// Not valid base64.
    Base64(String),
    /// Operation needs a UTXO the PSBT does not carry.
    MissingUtxo(usize),
    /// Input is not finalized.
    NotFinalized(usize),
    /// Input index outside the PSBT.
    IndexOutOfBounds(usize),
    /// Sighash computation failed.
    SighashFailed(usize),
    /// A version 0 PSBT without an unsigned transaction.
    NoUnsignedTx,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::InvalidMagic => f.write_str("invalid PSBT magic bytes"),
            Error::UnexpectedEof => f.write_str("unexpected end of PSBT data"),
            Error::OversizedPsbt(n) => write!(f, "PSBT of {} bytes exceeds the size cap", n),
            Error::DuplicateKey(field) => write!(f, "duplicate key, {} already provided", field),
            Error::NonOneByteKey(field) => {
                write!(f, "{} key is more than one byte type", field)
            }
            Error::InvalidKeyData(field) => write!(f, "invalid key data for {}", field),
            Error::InvalidValue(field) => write!(f, "invalid value for {}", field),
            Error::MissingSeparator(map) => {
                write!(f, "separator is missing at the end of {}", map)
            }
            Error::UnsupportedVersion(v) => write!(f, "unsupported PSBT version {}", v),
            Error::FieldNotAllowed { field, version } => {
                write!(f, "{} is not allowed in PSBTv{}", field, version)
            }
            Error::FieldRequired { field, version } => {
                write!(f, "{} is required in PSBTv{}", field, version)
            }
            Error::UnsignedTxHasScriptSigs => {
                f.write_str("unsigned tx does not have empty scriptSigs and scriptWitnesses")
            }
            Error::CountMismatch(which) => write!(
                f,
                "{} provided does not match the number declared in the transaction",
                which
            ),
            Error::UtxoMismatch => f.write_str("non-witness UTXO does not match outpoint hash"),
            Error::TrailingData => f.write_str("extra data after PSBT"),
            Error::TimeLockConflict => {
                f.write_str("inputs require incompatible locktime classes")
            }
            Error::MergeMismatch => f.write_str("PSBTs describe different transactions"),
            Error::Base64(ref e) => write!(f, "invalid base64: {}", e),
            Error::MissingUtxo(i) => write!(f, "input {} has no UTXO", i),
            Error::NotFinalized(i) => write!(f, "input {} is not finalized", i),
            Error::IndexOutOfBounds(i) => write!(f, "input index {} out of bounds", i),
            Error::SighashFailed(i) => write!(f, "could not compute sighash for input {}", i),
            Error::NoUnsignedTx => f.write_str("no unsigned transaction was provided"),
        }
    }
}

impl error::Error for Error {}

/// Per-input data of a PSBT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Input {
    /// The full transaction paying this input, for pre-segwit signing.
    pub non_witness_utxo: Option<Transaction>,
    /// The output being spent, for segwit signing.
    pub witness_utxo: Option<TxOut>,
    /// Signatures keyed by the signing pubkey; values are DER signatures
    /// with the sighash byte appended.
    pub partial_sigs: BTreeMap<PublicKey, Vec<u8>>,
    /// The sighash type this input insists on.
    pub sighash_type: Option<u32>,
    /// P2SH redeem script.
    pub redeem_script: Option<ScriptBuf>,
    /// P2WSH witness script.
    pub witness_script: Option<ScriptBuf>,
    /// BIP-32 derivation of the keys involved in this input.
    pub bip32_derivations: BTreeMap<PublicKey, KeySource>,
    /// Completed scriptSig.
    pub final_script_sig: Option<ScriptBuf>,
    /// Completed script witness.
    pub final_script_witness: Option<Witness>,
    /// RIPEMD160 preimages, keyed by hash.
    pub ripemd160_preimages: BTreeMap<bitcoin::hashes::ripemd160::Hash, Vec<u8>>,
    /// SHA256 preimages, keyed by hash.
    pub sha256_preimages: BTreeMap<bitcoin::hashes::sha256::Hash, Vec<u8>>,
    /// HASH160 preimages, keyed by hash.
    pub hash160_preimages: BTreeMap<bitcoin::hashes::hash160::Hash, Vec<u8>>,
    /// HASH256 preimages, keyed by hash.
    pub hash256_preimages: BTreeMap<bitcoin::hashes::sha256d::Hash, Vec<u8>>,
    /// Txid of the transaction being spent (v2; required).
    pub previous_txid: Option<Txid>,
    /// Index of the output being spent (v2; required).
    pub output_index: Option<u32>,
    /// Sequence number (v2).
    pub sequence: Option<u32>,
    /// Required time-based locktime, ≥ 500000000 (v2).
    pub time_locktime: Option<u32>,
    /// Required height-based locktime, < 500000000 (v2).
    pub height_locktime: Option<u32>,
    /// Taproot key-path signature.
    pub tap_key_sig: Option<Vec<u8>>,
    /// Taproot script-path signatures by (key, leaf).
    pub tap_script_sigs: BTreeMap<(XOnlyPublicKey, TapLeafHash), Vec<u8>>,
    /// Taproot leaf scripts by control block.
    pub tap_scripts: BTreeMap<ControlBlock, (ScriptBuf, LeafVersion)>,
    /// Taproot BIP-32 derivations with the leaves each key appears in.
    pub tap_bip32_derivations: BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)>,
    /// Taproot internal key.
    pub tap_internal_key: Option<XOnlyPublicKey>,
    /// Taproot merkle root.
    pub tap_merkle_root: Option<TapNodeHash>,
    /// Unrecognized keys, preserved verbatim.
    pub unknown: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Input {
    /// Whether the input carries no data at all.
    pub fn is_null(&self) -> bool {
        self.non_witness_utxo.is_none()
            && self.witness_utxo.is_none()
            && self.partial_sigs.is_empty()
            && self.unknown.is_empty()
            && self.bip32_derivations.is_empty()
            && self.redeem_script.is_none()
            && self.witness_script.is_none()
    }

    /// Whether the input already carries a completed scriptSig or witness.
    pub fn is_signed(&self) -> bool {
        self.final_script_sig.is_some() || self.final_script_witness.is_some()
    }

    /// The outpoint of this input, when the v2 fields are populated.
    pub fn outpoint(&self) -> Option<OutPoint> {
        Some(OutPoint { txid: self.previous_txid?, vout: self.output_index? })
    }

    /// The UTXO this input spends, from whichever field carries it. The
    /// non-witness form is cross-checked against the declared outpoint.
    pub fn utxo(&self) -> Option<TxOut> {
        if let Some(ref tx) = self.non_witness_utxo {
            let vout = self.output_index? as usize;
            if vout >= tx.output.len() || Some(tx.compute_txid()) != self.previous_txid {
                return None;
            }
            return Some(tx.output[vout].clone());
        }
        self.witness_utxo.clone()
    }

    /// Absorb the fields of `input`. Multi-entry maps are unioned; singular
    /// fields keep the already-present value and fill holes.
    pub fn merge(&mut self, input: &Input) -> Result<(), Error> {
        if self.previous_txid != input.previous_txid || self.output_index != input.output_index {
            return Err(Error::MergeMismatch);
        }

        if self.non_witness_utxo.is_none() {
            self.non_witness_utxo = input.non_witness_utxo.clone();
        }
        if self.witness_utxo.is_none() {
            self.witness_utxo = input.witness_utxo.clone();
        }

        merge_map(&mut self.partial_sigs, &input.partial_sigs);
        merge_map(&mut self.bip32_derivations, &input.bip32_derivations);
        merge_map(&mut self.ripemd160_preimages, &input.ripemd160_preimages);
        merge_map(&mut self.sha256_preimages, &input.sha256_preimages);
        merge_map(&mut self.hash160_preimages, &input.hash160_preimages);
        merge_map(&mut self.hash256_preimages, &input.hash256_preimages);
        merge_map(&mut self.tap_script_sigs, &input.tap_script_sigs);
        merge_map(&mut self.tap_scripts, &input.tap_scripts);
        merge_map(&mut self.tap_bip32_derivations, &input.tap_bip32_derivations);
        merge_map(&mut self.unknown, &input.unknown);

        fill(&mut self.redeem_script, &input.redeem_script);
        fill(&mut self.witness_script, &input.witness_script);
        fill(&mut self.final_script_sig, &input.final_script_sig);
        fill(&mut self.final_script_witness, &input.final_script_witness);
        fill(&mut self.tap_key_sig, &input.tap_key_sig);
        fill(&mut self.tap_internal_key, &input.tap_internal_key);
        fill(&mut self.tap_merkle_root, &input.tap_merkle_root);
        fill(&mut self.sequence, &input.sequence);
        fill(&mut self.time_locktime, &input.time_locktime);
        fill(&mut self.height_locktime, &input.height_locktime);
        Ok(())
    }
}

/// Per-output data of a PSBT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// P2SH redeem script.
    pub redeem_script: Option<ScriptBuf>,
    /// P2WSH witness script.
    pub witness_script: Option<ScriptBuf>,
    /// BIP-32 derivation of the keys involved in this output.
    pub bip32_derivations: BTreeMap<PublicKey, KeySource>,
    /// Output amount in satoshis (v2; required).
    pub amount: Option<i64>,
    /// Output scriptPubKey (v2; required).
    pub script: Option<ScriptBuf>,
    /// Taproot internal key.
    pub tap_internal_key: Option<XOnlyPublicKey>,
    /// Taproot tree as `(depth, leaf version, script)` tuples.
    pub tap_tree: Option<Vec<(u8, LeafVersion, ScriptBuf)>>,
    /// Taproot BIP-32 derivations with the leaves each key appears in.
    pub tap_bip32_derivations: BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)>,
    /// Unrecognized keys, preserved verbatim.
    pub unknown: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Output {
    /// Whether the output carries no data at all.
    pub fn is_null(&self) -> bool {
        self.redeem_script.is_none()
            && self.witness_script.is_none()
            && self.bip32_derivations.is_empty()
            && self.unknown.is_empty()
    }

    /// Absorb the fields of `output`.
    pub fn merge(&mut self, output: &Output) -> Result<(), Error> {
        if self.amount != output.amount || self.script != output.script {
            return Err(Error::MergeMismatch);
        }
        merge_map(&mut self.bip32_derivations, &output.bip32_derivations);
        merge_map(&mut self.tap_bip32_derivations, &output.tap_bip32_derivations);
        merge_map(&mut self.unknown, &output.unknown);
        fill(&mut self.redeem_script, &output.redeem_script);
        fill(&mut self.witness_script, &output.witness_script);
        fill(&mut self.tap_internal_key, &output.tap_internal_key);
        fill(&mut self.tap_tree, &output.tap_tree);
        Ok(())
    }
}

fn merge_map<K: Ord + Clone, V: Clone>(dst: &mut BTreeMap<K, V>, src: &BTreeMap<K, V>) {
    for (k, v) in src {
        dst.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

fn fill<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if dst.is_none() {
        *dst = src.clone();
    }
}

/// A partially signed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Psbt {
    /// The unsigned transaction (v0 only).
    pub unsigned_tx: Option<Transaction>,
    /// Transaction version (v2 only; required).
    pub tx_version: Option<i32>,
    /// Locktime to use when no input requires one (v2 only).
    pub fallback_locktime: Option<u32>,
    /// Modifiability flag bits (v2 only): bit 0 inputs, bit 1 outputs,
    /// bit 2 has SIGHASH_SINGLE signatures.
    pub tx_modifiable: Option<u8>,
    /// Global extended public keys with their origins.
    pub xpubs: BTreeMap<Xpub, KeySource>,
    /// Declared PSBT version; absent means 0.
    pub version: Option<u32>,
    /// Per-input maps.
    pub inputs: Vec<Input>,
    /// Per-output maps.
    pub outputs: Vec<Output>,
    /// Unrecognized global keys, preserved verbatim.
    pub unknown: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Psbt {
    /// A blank PSBT of the given version (creator role).
    pub fn new(version: u32) -> Result<Psbt, Error> {
        if version == 1 || version > PSBT_HIGHEST_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let mut psbt = Psbt::default();
        if version > 0 {
            psbt.version = Some(version);
            psbt.tx_version = Some(2);
        }
        Ok(psbt)
    }

    /// Build a PSBT over an existing unsigned transaction (creator role).
    pub fn from_unsigned_tx(tx: Transaction, version: u32) -> Result<Psbt, Error> {
        if version == 1 || version > PSBT_HIGHEST_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        for txin in &tx.input {
            if !txin.script_sig.is_empty() || !txin.witness.is_empty() {
                return Err(Error::UnsignedTxHasScriptSigs);
            }
        }
        let mut psbt = Psbt {
            version: if version > 0 { Some(version) } else { None },
            inputs: vec![Input::default(); tx.input.len()],
            outputs: vec![Output::default(); tx.output.len()],
            ..Default::default()
        };
        psbt.setup_from_tx(&tx);
        if version == 0 {
            psbt.unsigned_tx = Some(tx);
        }
        Ok(psbt)
    }

    /// The declared version, defaulting to 0.
    pub fn get_version(&self) -> u32 { self.version.unwrap_or(0) }

    /// Whether the PSBT carries no data at all.
    pub fn is_null(&self) -> bool {
        self.unsigned_tx.is_none()
            && self.inputs.is_empty()
            && self.outputs.is_empty()
            && self.unknown.is_empty()
    }

    /// Copy the version/locktime/outpoint/amount pieces of `tx` into the
    /// per-input and per-output records, so version 0 PSBTs expose the
    /// same logical view as version 2.
    fn setup_from_tx(&mut self, tx: &Transaction) {
        self.tx_version = Some(tx.version.0);
        self.fallback_locktime = Some(tx.lock_time.to_consensus_u32());

        for (input, txin) in self.inputs.iter_mut().zip(&tx.input) {
            input.previous_txid = Some(txin.previous_output.txid);
            input.output_index = Some(txin.previous_output.vout);
            input.sequence = Some(txin.sequence.0);
        }
        for (output, txout) in self.outputs.iter_mut().zip(&tx.output) {
            output.amount = Some(txout.value.to_sat() as i64);
            output.script = Some(txout.script_pubkey.clone());
        }
    }

    /// Populate the v2-style per-record fields from the global unsigned
    /// transaction, when one is present.
    pub(crate) fn cache_unsigned_tx_pieces(&mut self) {
        if let Some(tx) = self.unsigned_tx.clone() {
            self.setup_from_tx(&tx);
        }
    }

    /// Resolve the locktime the final transaction must use.
    ///
    /// Inputs requiring a height lock and inputs requiring a time lock are
    /// incompatible. Within one class the maximum wins; with no requirement
    /// the fallback locktime (or 0) applies.
    pub fn compute_time_lock(&self) -> Result<u32, Error> {
        let mut time_lock: Option<u32> = Some(0);
        let mut height_lock: Option<u32> = Some(0);
        for input in &self.inputs {
            if input.time_locktime.is_some() && input.height_locktime.is_none() {
                // This input can no longer be satisfied by a height lock.
                height_lock = None;
                if time_lock.is_none() {
                    return Err(Error::TimeLockConflict);
                }
            } else if input.time_locktime.is_none() && input.height_locktime.is_some() {
                time_lock = None;
                if height_lock.is_none() {
                    return Err(Error::TimeLockConflict);
                }
            }
            if let (Some(required), Some(acc)) = (input.time_locktime, time_lock) {
                time_lock = Some(acc.max(required));
            }
            if let (Some(required), Some(acc)) = (input.height_locktime, height_lock) {
                height_lock = Some(acc.max(required));
            }
        }
        if let Some(height) = height_lock {
            if height > 0 {
                return Ok(height);
            }
        }
        if let Some(time) = time_lock {
            if time > 0 {
                return Ok(time);
            }
        }
        Ok(self.fallback_locktime.unwrap_or(0))
    }

    /// The unsigned transaction this PSBT describes: the global one for v0,
    /// or one reconstructed from the per-record fields for v2.
    pub fn get_unsigned_tx(&self) -> Result<Transaction, Error> {
        if let Some(ref tx) = self.unsigned_tx {
            return Ok(tx.clone());
        }
        let tx_version = self.tx_version.ok_or(Error::NoUnsignedTx)?;
        let lock_time = absolute::LockTime::from_consensus(self.compute_time_lock()?);

        let mut input = Vec::with_capacity(self.inputs.len());
        for psbt_in in &self.inputs {
            let outpoint = psbt_in.outpoint().ok_or(Error::FieldRequired {
                field: "PSBT_IN_PREVIOUS_TXID",
                version: 2,
            })?;
            input.push(TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence(psbt_in.sequence.unwrap_or(Sequence::MAX.0)),
                witness: Witness::default(),
            });
        }
        let mut output = Vec::with_capacity(self.outputs.len());
        for psbt_out in &self.outputs {
            let amount = psbt_out.amount.ok_or(Error::FieldRequired {
                field: "PSBT_OUT_AMOUNT",
                version: 2,
            })?;
            let script_pubkey = psbt_out.script.clone().ok_or(Error::FieldRequired {
                field: "PSBT_OUT_SCRIPT",
                version: 2,
            })?;
            output.push(TxOut {
                value: bitcoin::Amount::from_sat(amount as u64),
                script_pubkey,
            });
        }

        Ok(Transaction {
            version: bitcoin::transaction::Version(tx_version),
            lock_time,
            input,
            output,
        })
    }

    /// A transaction id identifying this PSBT regardless of which
    /// signatures it has collected: sequence numbers are normalized before
    /// hashing so differently-signed PSBTs over one transaction compare
    /// equal.
    pub fn unique_id(&self) -> Result<Txid, Error> {
        if let Some(ref tx) = self.unsigned_tx {
            return Ok(tx.compute_txid());
        }
        let mut tx = self.get_unsigned_tx()?;
        for txin in &mut tx.input {
            txin.sequence = Sequence(0);
        }
        Ok(tx.compute_txid())
    }

    /// Merge `other` into this PSBT (combiner role). Both must describe
    /// the same transaction.
    pub fn merge(&mut self, other: &Psbt) -> Result<(), Error> {
        if self.unique_id()? != other.unique_id()? {
            return Err(Error::MergeMismatch);
        }
        if self.inputs.len() != other.inputs.len() || self.outputs.len() != other.outputs.len() {
            return Err(Error::MergeMismatch);
        }

        for (dst, src) in self.inputs.iter_mut().zip(&other.inputs) {
            dst.merge(src)?;
        }
        for (dst, src) in self.outputs.iter_mut().zip(&other.outputs) {
            dst.merge(src)?;
        }
        merge_map(&mut self.xpubs, &other.xpubs);
        if self.fallback_locktime.is_none() {
            self.fallback_locktime = other.fallback_locktime;
        }
        match (self.tx_modifiable, other.tx_modifiable) {
            (Some(a), Some(b)) => self.tx_modifiable = Some(a | b),
            (None, Some(b)) => self.tx_modifiable = Some(b),
            _ => {}
        }
        merge_map(&mut self.unknown, &other.unknown);
        Ok(())
    }

    /// Combine several PSBTs over the same transaction into one.
    pub fn combine(psbts: Vec<Psbt>) -> Result<Psbt, Error> {
        let mut iter = psbts.into_iter();
        let mut out = iter.next().ok_or(Error::MergeMismatch)?;
        for psbt in iter {
            out.merge(&psbt)?;
        }
        Ok(out)
    }

    /// Add an input (updater role). For v2 PSBTs the inputs-modifiable bit
    /// must be set, and an input carrying a required locktime must not
    /// change the effective locktime once signatures exist.
    pub fn add_input(&mut self, mut input: Input) -> Result<(), Error> {
        let outpoint = input.outpoint().ok_or(Error::FieldRequired {
            field: "PSBT_IN_PREVIOUS_TXID",
            version: self.get_version(),
        })?;
        if self.inputs.iter().any(|i| i.outpoint() == Some(outpoint)) {
            return Err(Error::MergeMismatch);
        }

        if let Some(ref mut tx) = self.unsigned_tx {
            // v0: splice into the global transaction.
            let txin = TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence(input.sequence.unwrap_or(Sequence::MAX.0)),
                witness: Witness::default(),
            };
            if tx.input.contains(&txin) {
                return Err(Error::MergeMismatch);
            }
            tx.input.push(txin);
            input.partial_sigs.clear();
            input.final_script_sig = None;
            input.final_script_witness = None;
            self.inputs.push(input);
            return Ok(());
        }

        // v2: inputs must be modifiable.
        if self.tx_modifiable.map_or(true, |m| m & 0x01 == 0) {
            return Err(Error::FieldNotAllowed {
                field: "new input (inputs not modifiable)",
                version: self.get_version(),
            });
        }

        if input.time_locktime.is_some() || input.height_locktime.is_some() {
            let old_timelock = self.compute_time_lock()?;
            let has_sigs = self.inputs.iter().any(|i| !i.partial_sigs.is_empty());
            let mut probe = self.clone();
            probe.inputs.push(input.clone());
            let new_timelock = probe.compute_time_lock()?;
            if has_sigs && old_timelock != new_timelock {
                return Err(Error::TimeLockConflict);
            }
        }

        self.inputs.push(input);
        Ok(())
    }

    /// Add an output (updater role).
    pub fn add_output(&mut self, output: Output) -> Result<(), Error> {
        let amount = output.amount.ok_or(Error::FieldRequired {
            field: "PSBT_OUT_AMOUNT",
            version: self.get_version(),
        })?;
        let script = output.script.clone().ok_or(Error::FieldRequired {
            field: "PSBT_OUT_SCRIPT",
            version: self.get_version(),
        })?;

        if let Some(ref mut tx) = self.unsigned_tx {
            tx.output.push(TxOut {
                value: bitcoin::Amount::from_sat(amount as u64),
                script_pubkey: script,
            });
            self.outputs.push(output);
            return Ok(());
        }

        if self.tx_modifiable.map_or(true, |m| m & 0x02 == 0) {
            return Err(Error::FieldNotAllowed {
                field: "new output (outputs not modifiable)",
                version: self.get_version(),
            });
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Fill an output's redeem/witness scripts and key origins from
    /// `provider` (updater role), so other participants can verify change
    /// outputs belong to the wallet.
    pub fn update_output_with(
        &mut self,
        provider: &dyn crate::provider::SigningProvider,
        index: usize,
    ) -> Result<(), Error> {
        let script = match self.outputs.get(index) {
            Some(output) => match output.script.clone() {
                Some(script) => script,
                None => {
                    return Err(Error::FieldRequired {
                        field: "PSBT_OUT_SCRIPT",
                        version: self.get_version(),
                    })
                }
            },
            None => return Err(Error::IndexOutOfBounds(index)),
        };
        let probe = Input::default();
        let solved = match sign::solve_script(&script, &probe, provider) {
            Some(solved) => solved,
            // Not a script we understand; leave the output untouched.
            None => return Ok(()),
        };
        let (candidates, _) = sign::signing_pubkeys(&solved.script, &probe, provider);
        let output = &mut self.outputs[index];
        if output.redeem_script.is_none() {
            output.redeem_script = solved.redeem_script;
        }
        if output.witness_script.is_none() {
            output.witness_script = solved.witness_script;
        }
        for pubkey in candidates {
            if let Some((_, origin)) = provider.get_key_origin(&pubkey.pubkey_hash()) {
                output
                    .bip32_derivations
                    .entry(pubkey)
                    .or_insert((origin.fingerprint, origin.path));
            }
        }
        Ok(())
    }

    /// Whether every input is finalized.
    pub fn is_complete(&self) -> bool { self.inputs.iter().all(Input::is_signed) }

    /// Number of inputs that still lack a final scriptSig/witness.
    pub fn count_unsigned_inputs(&self) -> usize {
        self.inputs.iter().filter(|i| !i.is_signed()).count()
    }
}

/// The five conventional PSBT workflow roles.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PsbtRole {
    /// Builds the transaction skeleton.
    Creator,
    /// Adds UTXOs, scripts and derivation metadata.
    Updater,
    /// Contributes partial signatures.
    Signer,
    /// Assembles final scriptSigs and witnesses.
    Finalizer,
    /// Produces the broadcastable transaction.
    Extractor,
}

impl fmt::Display for PsbtRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            PsbtRole::Creator => "creator",
            PsbtRole::Updater => "updater",
            PsbtRole::Signer => "signer",
            PsbtRole::Finalizer => "finalizer",
            PsbtRole::Extractor => "extractor",
        })
    }
}

impl fmt::Display for Psbt {
    /// The canonical textual form: base64 of the wire format.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&base64::engine::general_purpose::STANDARD.encode(self.serialize()))
    }
}

impl FromStr for Psbt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Psbt, Error> {
        if s.len() > MAX_PSBT_SIZE {
            return Err(Error::OversizedPsbt(s.len()));
        }
        let data = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| Error::Base64(e.to_string()))?;
        Psbt::deserialize(&data)
    }
}

#[cfg(feature = "serde")]
crate::serde_string_impl!(Psbt, "a base64-encoded PSBT");

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::{transaction, Amount, PubkeyHash};

    use super::finalizer::{extract_tx, finalize_psbt};
    use super::sign::sign_psbt_input;
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::provider::FlatSigningProvider;

    const TPRV: &str = "tprv8ZgxMBicQKsPcwcD4gSnMti126ZiETsuX7qwrtMypr6FBwAP65puFn4v6c3jrN9VwtMRMph6nyT63NrfUL4C3nBzPcduzVSuHD7zbX2JKVc";

    fn dummy_txid(byte: u8) -> Txid { Txid::from_slice(&[byte; 32]).unwrap() }

    fn dummy_out() -> TxOut {
        TxOut {
            value: Amount::from_sat(99_000),
            script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::from_slice(&[0x11; 20]).unwrap()),
        }
    }

    /// Expand `desc_str` at position 0, build a coin paying it and an
    /// unsigned transaction spending that coin, and return the PSBT plus a
    /// provider holding the signing keys.
    fn spend_setup(desc_str: &str) -> (Psbt, FlatSigningProvider) {
        let mut keys = FlatSigningProvider::new();
        let desc = Descriptor::parse(desc_str, &mut keys, false).unwrap();
        let mut solving = FlatSigningProvider::new();
        let scripts = desc.expand(0, &keys, &mut solving, None).unwrap();
        let spk = scripts[0].script_pubkey().unwrap();
        desc.expand_private(0, &keys, &mut solving);

        let prev_tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: dummy_txid(0xaa), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut { value: Amount::from_sat(100_000), script_pubkey: spk }],
        };
        let unsigned = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: prev_tx.compute_txid(), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![dummy_out()],
        };
        let mut psbt = Psbt::from_unsigned_tx(unsigned, 0).unwrap();
        psbt.inputs[0].witness_utxo = Some(prev_tx.output[0].clone());
        psbt.inputs[0].non_witness_utxo = Some(prev_tx);
        (psbt, solving)
    }

    #[test]
    fn sign_finalize_extract_p2wpkh() {
        let (mut psbt, solving) = spend_setup(&format!("wpkh({}/0/*)", TPRV));
        assert!(sign_psbt_input(&solving, &mut psbt, 0, None).unwrap());
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);

        // Wire round-trip in the half-signed state.
        let bytes = psbt.serialize();
        assert_eq!(Psbt::deserialize(&bytes).unwrap(), psbt);
        assert_eq!(Psbt::deserialize(&bytes).unwrap().serialize(), bytes);

        assert!(finalize_psbt(&mut psbt).unwrap());
        assert!(psbt.inputs[0].partial_sigs.is_empty());
        let tx = extract_tx(&psbt).unwrap();
        assert_eq!(tx.input[0].witness.len(), 2);
        assert!(tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn sign_finalize_extract_p2pkh() {
        let (mut psbt, solving) = spend_setup(&format!("pkh({}/1/*)", TPRV));
        psbt.inputs[0].witness_utxo = None;
        assert!(sign_psbt_input(&solving, &mut psbt, 0, None).unwrap());
        assert!(finalize_psbt(&mut psbt).unwrap());
        let tx = extract_tx(&psbt).unwrap();
        assert!(!tx.input[0].script_sig.is_empty());
        assert!(tx.input[0].witness.is_empty());
    }

    #[test]
    fn sign_finalize_extract_sh_wpkh() {
        let (mut psbt, solving) = spend_setup(&format!("sh(wpkh({}/9/*))", TPRV));
        assert!(sign_psbt_input(&solving, &mut psbt, 0, None).unwrap());
        assert!(finalize_psbt(&mut psbt).unwrap());
        let tx = extract_tx(&psbt).unwrap();
        // scriptSig pushes the redeem script; the witness holds sig+key.
        assert!(!tx.input[0].script_sig.is_empty());
        assert_eq!(tx.input[0].witness.len(), 2);
    }

    #[test]
    fn multisig_combine_and_finalize() {
        // Two signers each contribute one signature; combining yields both.
        let (psbt, solving) = spend_setup(&format!("wsh(multi(2,{}/2/*,{}/3/*))", TPRV, TPRV));
        let ids: Vec<PubkeyHash> = solving.keys.keys().copied().collect();
        assert_eq!(ids.len(), 2);

        let mut signer_a = solving.clone();
        signer_a.keys.retain(|id, _| *id == ids[0]);
        let mut signer_b = solving.clone();
        signer_b.keys.retain(|id, _| *id == ids[1]);

        let mut psbt_a = psbt.clone();
        let mut psbt_b = psbt.clone();
        assert!(!sign_psbt_input(&signer_a, &mut psbt_a, 0, None).unwrap());
        assert!(!sign_psbt_input(&signer_b, &mut psbt_b, 0, None).unwrap());
        assert_eq!(psbt_a.inputs[0].partial_sigs.len(), 1);
        assert_eq!(psbt_b.inputs[0].partial_sigs.len(), 1);

        // Merge is commutative on compatible PSBTs.
        let mut ab = psbt_a.clone();
        ab.merge(&psbt_b).unwrap();
        let mut ba = psbt_b.clone();
        ba.merge(&psbt_a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.inputs[0].partial_sigs.len(), 2);

        let mut merged = Psbt::combine(vec![psbt_a, psbt_b]).unwrap();
        assert!(finalize_psbt(&mut merged).unwrap());
        let tx = extract_tx(&merged).unwrap();
        // Dummy element, two signatures, witness script.
        assert_eq!(tx.input[0].witness.len(), 4);
    }

    #[test]
    fn merge_rejects_different_transactions() {
        let (psbt_a, _) = spend_setup(&format!("wpkh({}/4/*)", TPRV));
        let (psbt_b, _) = spend_setup(&format!("wpkh({}/5/*)", TPRV));
        let mut a = psbt_a;
        assert_eq!(a.merge(&psbt_b), Err(Error::MergeMismatch));
    }

    fn v2_input(txid_byte: u8) -> Input {
        Input {
            previous_txid: Some(dummy_txid(txid_byte)),
            output_index: Some(0),
            ..Default::default()
        }
    }

    fn v2_psbt(inputs: Vec<Input>) -> Psbt {
        let mut psbt = Psbt::new(2).unwrap();
        psbt.inputs = inputs;
        psbt.outputs = vec![Output {
            amount: Some(99_000),
            script: Some(dummy_out().script_pubkey),
            ..Default::default()
        }];
        psbt
    }

    #[test]
    fn time_lock_resolution() {
        // Height locks: the maximum wins.
        let mut a = v2_input(1);
        a.height_locktime = Some(1000);
        let mut b = v2_input(2);
        b.height_locktime = Some(10000);
        assert_eq!(v2_psbt(vec![a.clone(), b]).compute_time_lock(), Ok(10000));

        // Time locks: the maximum wins.
        let mut c = v2_input(3);
        c.time_locktime = Some(1_600_000_000);
        let mut d = v2_input(4);
        d.time_locktime = Some(1_700_000_000);
        assert_eq!(v2_psbt(vec![c.clone(), d]).compute_time_lock(), Ok(1_700_000_000));

        // Mixing classes across inputs fails.
        assert_eq!(
            v2_psbt(vec![a.clone(), c.clone()]).compute_time_lock(),
            Err(Error::TimeLockConflict)
        );

        // No requirement: fallback locktime, else zero.
        let mut psbt = v2_psbt(vec![v2_input(5)]);
        assert_eq!(psbt.compute_time_lock(), Ok(0));
        psbt.fallback_locktime = Some(777);
        assert_eq!(psbt.compute_time_lock(), Ok(777));

        // An input accepting both classes does not force either.
        let mut both = v2_input(6);
        both.height_locktime = Some(500);
        both.time_locktime = Some(1_600_000_000);
        assert_eq!(v2_psbt(vec![both, a]).compute_time_lock(), Ok(1000));
    }

    #[test]
    fn v2_roundtrip() {
        let mut input = v2_input(7);
        input.sequence = Some(0xFFFF_FFFD);
        input.height_locktime = Some(123_456);
        let mut psbt = v2_psbt(vec![input]);
        psbt.tx_modifiable = Some(0b011);
        psbt.fallback_locktime = Some(100);
        psbt.unknown.insert(vec![0xfc, 0x01, 0xaa], vec![0xbb]);

        let bytes = psbt.serialize();
        let decoded = Psbt::deserialize(&bytes).unwrap();
        assert_eq!(decoded, psbt);
        assert_eq!(decoded.serialize(), bytes);

        // Base64 text form round-trips too.
        let text = psbt.to_string();
        assert_eq!(Psbt::from_str(&text).unwrap(), psbt);
    }

    #[test]
    fn unique_id_normalizes_sequences() {
        let mut a = v2_psbt(vec![v2_input(8)]);
        let mut b = v2_psbt(vec![v2_input(8)]);
        a.inputs[0].sequence = Some(1);
        b.inputs[0].sequence = Some(2);
        assert_eq!(a.unique_id().unwrap(), b.unique_id().unwrap());
        // And merging them succeeds despite the differing sequence.
        a.merge(&b).unwrap();
        assert_eq!(a.inputs[0].sequence, Some(1));
    }

    #[test]
    fn version_gating() {
        // v2 PSBTs must not carry an unsigned tx; v0 must not carry v2
        // globals. Craft the offending wire forms by hand.
        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: dummy_txid(0xcc), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![dummy_out()],
        };
        let raw_tx = bitcoin::consensus::encode::serialize(&tx);

        // v0 with a TX_VERSION global.
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);
        raw::write_key(&mut w, PSBT_GLOBAL_UNSIGNED_TX, &[]);
        raw::write_vec(&mut w, &raw_tx);
        raw::write_pair(&mut w, PSBT_GLOBAL_TX_VERSION, &[], &2u32.to_le_bytes());
        w.push(0x00);
        assert_eq!(
            Psbt::deserialize(&w),
            Err(Error::FieldNotAllowed { field: "PSBT_GLOBAL_TX_VERSION", version: 0 })
        );

        // Version 1 is explicitly invalid.
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);
        raw::write_key(&mut w, PSBT_GLOBAL_UNSIGNED_TX, &[]);
        raw::write_vec(&mut w, &raw_tx);
        raw::write_pair(&mut w, PSBT_GLOBAL_VERSION, &[], &1u32.to_le_bytes());
        w.push(0x00);
        assert_eq!(Psbt::deserialize(&w), Err(Error::UnsupportedVersion(1)));

        // Versions above 2 are rejected outright.
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);
        raw::write_pair(&mut w, PSBT_GLOBAL_VERSION, &[], &3u32.to_le_bytes());
        w.push(0x00);
        assert_eq!(Psbt::deserialize(&w), Err(Error::UnsupportedVersion(3)));

        // Duplicate global keys are fatal.
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);
        raw::write_key(&mut w, PSBT_GLOBAL_UNSIGNED_TX, &[]);
        raw::write_vec(&mut w, &raw_tx);
        raw::write_key(&mut w, PSBT_GLOBAL_UNSIGNED_TX, &[]);
        raw::write_vec(&mut w, &raw_tx);
        w.push(0x00);
        assert!(matches!(Psbt::deserialize(&w), Err(Error::DuplicateKey(_))));

        // A missing separator is fatal.
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);
        raw::write_key(&mut w, PSBT_GLOBAL_UNSIGNED_TX, &[]);
        raw::write_vec(&mut w, &raw_tx);
        assert_eq!(Psbt::deserialize(&w), Err(Error::MissingSeparator("the global map")));

        // Bad magic.
        assert_eq!(Psbt::deserialize(b"psbt\x00\x00"), Err(Error::InvalidMagic));

        // Trailing data after the last map.
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);
        raw::write_key(&mut w, PSBT_GLOBAL_UNSIGNED_TX, &[]);
        raw::write_vec(&mut w, &raw_tx);
        w.push(0x00); // end of globals
        w.push(0x00); // empty input map
        w.push(0x00); // empty output map
        w.push(0x42);
        assert_eq!(Psbt::deserialize(&w), Err(Error::TrailingData));

        // v2 without required globals.
        let mut w = Vec::new();
        w.extend_from_slice(&PSBT_MAGIC_BYTES);
        raw::write_pair(&mut w, PSBT_GLOBAL_VERSION, &[], &2u32.to_le_bytes());
        w.push(0x00);
        assert_eq!(
            Psbt::deserialize(&w),
            Err(Error::FieldRequired { field: "PSBT_GLOBAL_TX_VERSION", version: 2 })
        );
    }

    #[test]
    fn unsigned_tx_must_be_unsigned() {
        let mut tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: dummy_txid(9), vout: 0 },
                script_sig: ScriptBuf::from_bytes(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![dummy_out()],
        };
        assert_eq!(
            Psbt::from_unsigned_tx(tx.clone(), 0),
            Err(Error::UnsignedTxHasScriptSigs)
        );
        tx.input[0].script_sig = ScriptBuf::new();
        assert!(Psbt::from_unsigned_tx(tx, 0).is_ok());
    }

    #[test]
    fn add_input_respects_modifiable_flag() {
        let mut psbt = v2_psbt(vec![v2_input(1)]);
        // Inputs are not modifiable by default.
        assert!(psbt.add_input(v2_input(2)).is_err());
        psbt.tx_modifiable = Some(0b01);
        assert!(psbt.add_input(v2_input(2)).is_ok());
        // Duplicated outpoints are rejected.
        assert!(psbt.add_input(v2_input(2)).is_err());
        assert_eq!(psbt.inputs.len(), 2);

        // Outputs follow their own bit.
        let output = Output {
            amount: Some(1),
            script: Some(dummy_out().script_pubkey),
            ..Default::default()
        };
        assert!(psbt.add_output(output.clone()).is_err());
        psbt.tx_modifiable = Some(0b11);
        assert!(psbt.add_output(output).is_ok());
    }

    #[test]
    fn update_output_fills_metadata() {
        let mut keys = FlatSigningProvider::new();
        let desc = Descriptor::parse(&format!("sh(wpkh({}/8/*))", TPRV), &mut keys, false).unwrap();
        let mut solving = FlatSigningProvider::new();
        let scripts = desc.expand(0, &keys, &mut solving, None).unwrap();
        let spk = scripts[0].script_pubkey().unwrap();

        let mut psbt = Psbt::new(2).unwrap();
        psbt.outputs.push(Output {
            amount: Some(1000),
            script: Some(spk),
            ..Default::default()
        });
        psbt.update_output_with(&solving, 0).unwrap();
        let output = &psbt.outputs[0];
        assert!(output.redeem_script.is_some());
        assert_eq!(output.bip32_derivations.len(), 1);

        assert!(matches!(
            psbt.update_output_with(&solving, 5),
            Err(Error::IndexOutOfBounds(5))
        ));
    }

    #[test]
    fn extract_requires_finalized_inputs() {
        let (psbt, _) = spend_setup(&format!("wpkh({}/6/*)", TPRV));
        assert_eq!(extract_tx(&psbt), Err(Error::NotFinalized(0)));
    }

    #[test]
    fn utxo_mismatch_is_fatal() {
        let (mut psbt, _) = spend_setup(&format!("wpkh({}/7/*)", TPRV));
        // Replace the non-witness UTXO with an unrelated transaction.
        let bogus = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: dummy_txid(0xdd), vout: 1 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![dummy_out()],
        };
        psbt.inputs[0].non_witness_utxo = Some(bogus);
        let bytes = psbt.serialize();
        assert_eq!(Psbt::deserialize(&bytes), Err(Error::UtxoMismatch));
    }
}
