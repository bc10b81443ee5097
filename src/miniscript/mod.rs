// SPDX-License-Identifier: CC0-1.0

//! # Miniscript bridge
//!
//! A structured subset of Script used for `wsh()` descriptor bodies. Keys
//! inside a miniscript are abstract: each is a `u32` index into the key
//! expression list of the enclosing descriptor. Three small visitor traits
//! connect the abstract tree to concrete keys: [`KeyParser`] while parsing,
//! [`ScriptMaker`] for script emission and [`StringMaker`] for text
//! emission.
//!
//! Every parsed expression is type-checked with the miniscript correctness
//! and malleability system; sanity analysis on top of the types rejects
//! malleable, signature-less, timelock-mixing, key-duplicating or
//! resource-exceeding expressions, pointing at the deepest offending
//! subexpression.

pub mod limits;
pub mod types;

use core::fmt;

use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::opcodes::all::*;
use bitcoin::script::{Builder, PushBytesBuf, ScriptBuf};

use self::limits::{
    MAX_OPS_PER_SCRIPT, MAX_PUBKEYS_PER_MULTISIG, MAX_STANDARD_P2WSH_SCRIPT_SIZE,
};
use self::types::{TimelockInfo, Type};
use crate::expression::{parse_num, Tree};
use crate::{script_num_size, Error};

/// Callback used while parsing: turns a key expression into an abstract
/// key index.
pub trait KeyParser {
    /// Parse one key expression, recording it and returning its index.
    fn parse_key(&mut self, s: &str) -> Result<u32, Error>;
    /// Whether two indices refer to the same underlying key.
    fn keys_equal(&self, a: u32, b: u32) -> bool;
}

/// Visitor turning abstract key indices into script bytes.
pub trait ScriptMaker {
    /// Serialized public key for `key`.
    fn pk_bytes(&self, key: u32) -> Vec<u8>;
    /// hash160 of the public key for `key`.
    fn pkh_bytes(&self, key: u32) -> [u8; 20];
}

/// Visitor turning abstract key indices back into text.
pub trait StringMaker {
    /// Textual form of `key`, or `None` if it cannot be rendered (e.g. a
    /// private form was requested and no private key is known).
    fn key_string(&self, key: u32) -> Option<String>;
}

/// Why an otherwise-parsable miniscript was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Insanity {
    /// The expression does not type-check.
    Invalid,
    /// Malleable witnesses exist.
    Malleable,
    /// Some spend path does not require a signature.
    NoSignature,
    /// Height-based and time-based locks appear in one spend path.
    TimelockMix,
    /// The same key appears more than once.
    DuplicateKeys,
    /// Witnesses may exceed ops or script-size limits.
    ResourceLimits,
}

impl fmt::Display for Insanity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Insanity::Invalid => f.write_str("is invalid"),
            Insanity::Malleable => f.write_str("is not sane: malleable witnesses exist"),
            Insanity::NoSignature => {
                f.write_str("is not sane: witnesses without signature exist")
            }
            Insanity::TimelockMix => f.write_str(
                "is not sane: contains mixes of timelocks expressed in blocks and seconds",
            ),
            Insanity::DuplicateKeys => f.write_str("is not sane: contains duplicate public keys"),
            Insanity::ResourceLimits => {
                f.write_str("is not sane: needs witnesses that may exceed resource limits")
            }
        }
    }
}

/// Non-type data accumulated bottom-up: emitted script size, static op
/// count, and timelock flavours.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtData {
    /// Size in bytes of the emitted script fragment.
    pub script_size: usize,
    /// Number of non-push opcodes in the fragment.
    pub ops: usize,
    /// Timelock flavours present in the fragment.
    pub timelocks: TimelockInfo,
}

/// One miniscript fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    /// `1`
    True,
    /// `0`
    False,
    /// `pk_k(key)`
    PkK(u32),
    /// `pk_h(key)`
    PkH(u32),
    /// `older(n)` — relative locktime
    Older(u32),
    /// `after(n)` — absolute locktime
    After(u32),
    /// `sha256(h)`
    Sha256([u8; 32]),
    /// `hash256(h)`
    Hash256([u8; 32]),
    /// `ripemd160(h)`
    Ripemd160([u8; 20]),
    /// `hash160(h)`
    Hash160([u8; 20]),
    /// `a:` alt-stack wrapper
    Alt(Box<Miniscript>),
    /// `s:` swap wrapper
    Swap(Box<Miniscript>),
    /// `c:` checksig wrapper
    Check(Box<Miniscript>),
    /// `d:` dup-if wrapper
    DupIf(Box<Miniscript>),
    /// `v:` verify wrapper
    Verify(Box<Miniscript>),
    /// `j:` nonzero wrapper
    NonZero(Box<Miniscript>),
    /// `n:` zero-not-equal wrapper
    ZeroNotEqual(Box<Miniscript>),
    /// `and_v(X,Y)`
    AndV(Box<Miniscript>, Box<Miniscript>),
    /// `and_b(X,Y)`
    AndB(Box<Miniscript>, Box<Miniscript>),
    /// `andor(X,Y,Z)`
    AndOr(Box<Miniscript>, Box<Miniscript>, Box<Miniscript>),
    /// `or_b(X,Z)`
    OrB(Box<Miniscript>, Box<Miniscript>),
    /// `or_c(X,Z)`
    OrC(Box<Miniscript>, Box<Miniscript>),
    /// `or_d(X,Z)`
    OrD(Box<Miniscript>, Box<Miniscript>),
    /// `or_i(X,Z)`
    OrI(Box<Miniscript>, Box<Miniscript>),
    /// `thresh(k,X1,...,Xn)`
    Thresh(usize, Vec<Miniscript>),
    /// `multi(k,key1,...,keyn)`
    Multi(usize, Vec<u32>),
}

/// A type-annotated miniscript node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Miniscript {
    /// The fragment itself.
    pub node: Fragment,
    /// Computed type, or `None` if the fragment does not type-check.
    pub ty: Option<Type>,
    /// Accumulated script size, op count and timelock data.
    pub ext: ExtData,
}

impl Miniscript {
    /// Parse a miniscript from its textual form, resolving key expressions
    /// through `parser`.
    pub fn from_string(s: &str, parser: &mut dyn KeyParser) -> Result<Miniscript, Error> {
        let tree = Tree::from_str(s)?;
        Self::from_tree(&tree, parser)
    }

    /// Direct children of this node.
    pub fn subs(&self) -> Vec<&Miniscript> {
        match self.node {
            Fragment::True
            | Fragment::False
            | Fragment::PkK(..)
            | Fragment::PkH(..)
            | Fragment::Older(..)
            | Fragment::After(..)
            | Fragment::Sha256(..)
            | Fragment::Hash256(..)
            | Fragment::Ripemd160(..)
            | Fragment::Hash160(..)
            | Fragment::Multi(..) => vec![],
            Fragment::Alt(ref x)
            | Fragment::Swap(ref x)
            | Fragment::Check(ref x)
            | Fragment::DupIf(ref x)
            | Fragment::Verify(ref x)
            | Fragment::NonZero(ref x)
            | Fragment::ZeroNotEqual(ref x) => vec![x],
            Fragment::AndV(ref x, ref y)
            | Fragment::AndB(ref x, ref y)
            | Fragment::OrB(ref x, ref y)
            | Fragment::OrC(ref x, ref y)
            | Fragment::OrD(ref x, ref y)
            | Fragment::OrI(ref x, ref y) => vec![x, y],
            Fragment::AndOr(ref x, ref y, ref z) => vec![x, y, z],
            Fragment::Thresh(_, ref subs) => subs.iter().collect(),
        }
    }

    /// All abstract key indices in this subtree, in emission order.
    pub fn keys(&self) -> Vec<u32> {
        let mut out = Vec::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys(&self, out: &mut Vec<u32>) {
        match self.node {
            Fragment::PkK(k) | Fragment::PkH(k) => out.push(k),
            Fragment::Multi(_, ref keys) => out.extend(keys.iter().copied()),
            _ => {
                for sub in self.subs() {
                    sub.collect_keys(out);
                }
            }
        }
    }

    /// Whether the expression is well-typed as a `B`-base top level script.
    pub fn is_valid_top_level(&self) -> bool {
        matches!(self.ty, Some(ty) if ty.base == types::Base::B)
    }

    /// The sanity defect of this node, if any. `is_root` enables the
    /// checks that only make sense for a whole script (signature
    /// requirement, resource limits).
    pub fn insanity(&self, parser: &dyn KeyParser, is_root: bool) -> Option<Insanity> {
        let ty = match self.ty {
            None => return Some(Insanity::Invalid),
            Some(ty) => ty,
        };
        if !ty.non_malleable {
            return Some(Insanity::Malleable);
        }
        if is_root && !ty.safe {
            return Some(Insanity::NoSignature);
        }
        if self.ext.timelocks.contains_combination {
            return Some(Insanity::TimelockMix);
        }
        if self.has_duplicate_keys(parser) {
            return Some(Insanity::DuplicateKeys);
        }
        if is_root
            && (self.ext.ops > MAX_OPS_PER_SCRIPT
                || self.ext.script_size > MAX_STANDARD_P2WSH_SCRIPT_SIZE)
        {
            return Some(Insanity::ResourceLimits);
        }
        None
    }

    /// Whether the whole expression passes sanity analysis.
    pub fn is_sane(&self, parser: &dyn KeyParser) -> bool {
        self.insanity(parser, true).is_none() && self.is_valid_top_level()
    }

    /// The deepest subexpression with a sanity defect, with its reason.
    pub fn find_insane_sub(&self, parser: &dyn KeyParser) -> Option<(&Miniscript, Insanity)> {
        for sub in self.subs() {
            if let Some(found) = sub.find_insane_sub(parser) {
                return Some(found);
            }
        }
        self.insanity(parser, false).map(|reason| (self, reason))
    }

    fn has_duplicate_keys(&self, parser: &dyn KeyParser) -> bool {
        let keys = self.keys();
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                if a != b && parser.keys_equal(*a, *b) {
                    return true;
                }
            }
        }
        false
    }

    /// Emit the fragment as Script.
    pub fn to_script(&self, maker: &dyn ScriptMaker) -> ScriptBuf {
        self.encode(Builder::new(), maker).into_script()
    }

    fn encode(&self, builder: Builder, maker: &dyn ScriptMaker) -> Builder {
        match self.node {
            Fragment::True => builder.push_int(1),
            Fragment::False => builder.push_int(0),
            Fragment::PkK(k) => builder.push_slice(
                PushBytesBuf::try_from(maker.pk_bytes(k)).expect("keys fit in a push"),
            ),
            Fragment::PkH(k) => builder
                .push_opcode(OP_DUP)
                .push_opcode(OP_HASH160)
                .push_slice(maker.pkh_bytes(k))
                .push_opcode(OP_EQUALVERIFY),
            Fragment::Older(n) => builder.push_int(n as i64).push_opcode(OP_CSV),
            Fragment::After(n) => builder.push_int(n as i64).push_opcode(OP_CLTV),
            Fragment::Sha256(ref h) => builder
                .push_opcode(OP_SIZE)
                .push_int(32)
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_SHA256)
                .push_slice(*h)
                .push_opcode(OP_EQUAL),
            Fragment::Hash256(ref h) => builder
                .push_opcode(OP_SIZE)
                .push_int(32)
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_HASH256)
                .push_slice(*h)
                .push_opcode(OP_EQUAL),
            Fragment::Ripemd160(ref h) => builder
                .push_opcode(OP_SIZE)
                .push_int(32)
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_RIPEMD160)
                .push_slice(*h)
                .push_opcode(OP_EQUAL),
            Fragment::Hash160(ref h) => builder
                .push_opcode(OP_SIZE)
                .push_int(32)
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_HASH160)
                .push_slice(*h)
                .push_opcode(OP_EQUAL),
            Fragment::Alt(ref sub) => sub
                .encode(builder.push_opcode(OP_TOALTSTACK), maker)
                .push_opcode(OP_FROMALTSTACK),
            Fragment::Swap(ref sub) => sub.encode(builder.push_opcode(OP_SWAP), maker),
            Fragment::Check(ref sub) => sub.encode(builder, maker).push_opcode(OP_CHECKSIG),
            Fragment::DupIf(ref sub) => sub
                .encode(builder.push_opcode(OP_DUP).push_opcode(OP_IF), maker)
                .push_opcode(OP_ENDIF),
            Fragment::Verify(ref sub) => sub.encode(builder, maker).push_verify(),
            Fragment::NonZero(ref sub) => sub
                .encode(
                    builder.push_opcode(OP_SIZE).push_opcode(OP_0NOTEQUAL).push_opcode(OP_IF),
                    maker,
                )
                .push_opcode(OP_ENDIF),
            Fragment::ZeroNotEqual(ref sub) => {
                sub.encode(builder, maker).push_opcode(OP_0NOTEQUAL)
            }
            Fragment::AndV(ref l, ref r) => r.encode(l.encode(builder, maker), maker),
            Fragment::AndB(ref l, ref r) => {
                r.encode(l.encode(builder, maker), maker).push_opcode(OP_BOOLAND)
            }
            Fragment::AndOr(ref a, ref b, ref c) => {
                let builder = a.encode(builder, maker).push_opcode(OP_NOTIF);
                let builder = c.encode(builder, maker).push_opcode(OP_ELSE);
                b.encode(builder, maker).push_opcode(OP_ENDIF)
            }
            Fragment::OrB(ref l, ref r) => {
                r.encode(l.encode(builder, maker), maker).push_opcode(OP_BOOLOR)
            }
            Fragment::OrC(ref l, ref r) => {
                let builder = l.encode(builder, maker).push_opcode(OP_NOTIF);
                r.encode(builder, maker).push_opcode(OP_ENDIF)
            }
            Fragment::OrD(ref l, ref r) => {
                let builder =
                    l.encode(builder, maker).push_opcode(OP_IFDUP).push_opcode(OP_NOTIF);
                r.encode(builder, maker).push_opcode(OP_ENDIF)
            }
            Fragment::OrI(ref l, ref r) => {
                let builder = l.encode(builder.push_opcode(OP_IF), maker).push_opcode(OP_ELSE);
                r.encode(builder, maker).push_opcode(OP_ENDIF)
            }
            Fragment::Thresh(k, ref subs) => {
                let mut builder = subs[0].encode(builder, maker);
                for sub in &subs[1..] {
                    builder = sub.encode(builder, maker).push_opcode(OP_ADD);
                }
                builder.push_int(k as i64).push_opcode(OP_EQUAL)
            }
            Fragment::Multi(k, ref keys) => {
                let mut builder = builder.push_int(k as i64);
                for key in keys {
                    builder = builder.push_slice(
                        PushBytesBuf::try_from(maker.pk_bytes(*key)).expect("keys fit in a push"),
                    );
                }
                builder.push_int(keys.len() as i64).push_opcode(OP_CHECKMULTISIG)
            }
        }
    }

    /// Render the fragment as text, resolving keys through `maker`.
    pub fn to_string_with(&self, maker: &dyn StringMaker) -> Option<String> {
        let mut s = String::new();
        self.write_to(&mut s, maker)?;
        Some(s)
    }

    fn write_to(&self, s: &mut String, maker: &dyn StringMaker) -> Option<()> {
        let mut wrappers = String::new();
        let mut cur = self;
        loop {
            match cur.node {
                Fragment::Alt(ref sub) => {
                    wrappers.push('a');
                    cur = sub;
                }
                Fragment::Swap(ref sub) => {
                    wrappers.push('s');
                    cur = sub;
                }
                Fragment::DupIf(ref sub) => {
                    wrappers.push('d');
                    cur = sub;
                }
                Fragment::Verify(ref sub) => {
                    wrappers.push('v');
                    cur = sub;
                }
                Fragment::NonZero(ref sub) => {
                    wrappers.push('j');
                    cur = sub;
                }
                Fragment::ZeroNotEqual(ref sub) => {
                    wrappers.push('n');
                    cur = sub;
                }
                Fragment::Check(ref sub) => {
                    if matches!(sub.node, Fragment::PkK(..) | Fragment::PkH(..)) {
                        break;
                    }
                    wrappers.push('c');
                    cur = sub;
                }
                Fragment::AndV(ref l, ref r) if r.node == Fragment::True => {
                    wrappers.push('t');
                    cur = l;
                }
                Fragment::OrI(ref l, ref r) if r.node == Fragment::False => {
                    wrappers.push('u');
                    cur = l;
                }
                Fragment::OrI(ref l, ref r) if l.node == Fragment::False => {
                    wrappers.push('l');
                    cur = r;
                }
                _ => break,
            }
        }
        if !wrappers.is_empty() {
            s.push_str(&wrappers);
            s.push(':');
        }
        cur.write_base(s, maker)
    }

    fn write_base(&self, s: &mut String, maker: &dyn StringMaker) -> Option<()> {
        use core::fmt::Write;
        match self.node {
            Fragment::True => s.push('1'),
            Fragment::False => s.push('0'),
            Fragment::PkK(k) => {
                write!(s, "pk_k({})", maker.key_string(k)?).ok()?;
            }
            Fragment::PkH(k) => {
                write!(s, "pk_h({})", maker.key_string(k)?).ok()?;
            }
            Fragment::Check(ref sub) => match sub.node {
                Fragment::PkK(k) => write!(s, "pk({})", maker.key_string(k)?).ok()?,
                Fragment::PkH(k) => write!(s, "pkh({})", maker.key_string(k)?).ok()?,
                _ => unreachable!("write_to only descends here for pk sugar"),
            },
            Fragment::Older(n) => write!(s, "older({})", n).ok()?,
            Fragment::After(n) => write!(s, "after({})", n).ok()?,
            Fragment::Sha256(ref h) => write!(s, "sha256({})", h.as_slice().to_lower_hex_string()).ok()?,
            Fragment::Hash256(ref h) => write!(s, "hash256({})", h.as_slice().to_lower_hex_string()).ok()?,
            Fragment::Ripemd160(ref h) => {
                write!(s, "ripemd160({})", h.as_slice().to_lower_hex_string()).ok()?
            }
            Fragment::Hash160(ref h) => write!(s, "hash160({})", h.as_slice().to_lower_hex_string()).ok()?,
            Fragment::AndV(ref l, ref r) => Self::write_args(s, "and_v", &[l, r], maker)?,
            Fragment::AndB(ref l, ref r) => Self::write_args(s, "and_b", &[l, r], maker)?,
            Fragment::AndOr(ref a, ref b, ref c) => {
                Self::write_args(s, "andor", &[a, b, c], maker)?
            }
            Fragment::OrB(ref l, ref r) => Self::write_args(s, "or_b", &[l, r], maker)?,
            Fragment::OrC(ref l, ref r) => Self::write_args(s, "or_c", &[l, r], maker)?,
            Fragment::OrD(ref l, ref r) => Self::write_args(s, "or_d", &[l, r], maker)?,
            Fragment::OrI(ref l, ref r) => Self::write_args(s, "or_i", &[l, r], maker)?,
            Fragment::Thresh(k, ref subs) => {
                write!(s, "thresh({}", k).ok()?;
                for sub in subs {
                    s.push(',');
                    sub.write_to(s, maker)?;
                }
                s.push(')');
            }
            Fragment::Multi(k, ref keys) => {
                write!(s, "multi({}", k).ok()?;
                for key in keys {
                    write!(s, ",{}", maker.key_string(*key)?).ok()?;
                }
                s.push(')');
            }
            Fragment::Alt(..)
            | Fragment::Swap(..)
            | Fragment::DupIf(..)
            | Fragment::Verify(..)
            | Fragment::NonZero(..)
            | Fragment::ZeroNotEqual(..) => {
                unreachable!("wrappers are consumed by write_to")
            }
        }
        Some(())
    }

    fn write_args(
        s: &mut String,
        name: &str,
        args: &[&Miniscript],
        maker: &dyn StringMaker,
    ) -> Option<()> {
        s.push_str(name);
        s.push('(');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            arg.write_to(s, maker)?;
        }
        s.push(')');
        Some(())
    }

    fn from_tree(top: &Tree, parser: &mut dyn KeyParser) -> Result<Miniscript, Error> {
        let (wrappers, name) = match top.name.split_once(':') {
            Some((w, n)) => (w, n),
            None => ("", top.name),
        };

        let expect_args = |n: usize| -> Result<(), Error> {
            if top.args.len() == n {
                Ok(())
            } else {
                Err(Error::Syntax(format!(
                    "fragment '{}' takes {} arguments, {} given",
                    name,
                    n,
                    top.args.len()
                )))
            }
        };

        let mut node = match name {
            "1" => {
                expect_args(0)?;
                Self::from_fragment(Fragment::True)
            }
            "0" => {
                expect_args(0)?;
                Self::from_fragment(Fragment::False)
            }
            "pk_k" => {
                expect_args(1)?;
                Self::from_fragment(Fragment::PkK(parser.parse_key(top.args[0].name)?))
            }
            "pk_h" => {
                expect_args(1)?;
                Self::from_fragment(Fragment::PkH(parser.parse_key(top.args[0].name)?))
            }
            "pk" => {
                expect_args(1)?;
                let inner =
                    Self::from_fragment(Fragment::PkK(parser.parse_key(top.args[0].name)?));
                Self::from_fragment(Fragment::Check(Box::new(inner)))
            }
            "pkh" => {
                expect_args(1)?;
                let inner =
                    Self::from_fragment(Fragment::PkH(parser.parse_key(top.args[0].name)?));
                Self::from_fragment(Fragment::Check(Box::new(inner)))
            }
            "older" => {
                expect_args(1)?;
                let n = parse_num(top.args[0].name)?;
                check_locktime(n, "older")?;
                Self::from_fragment(Fragment::Older(n))
            }
            "after" => {
                expect_args(1)?;
                let n = parse_num(top.args[0].name)?;
                check_locktime(n, "after")?;
                Self::from_fragment(Fragment::After(n))
            }
            "sha256" => {
                expect_args(1)?;
                Self::from_fragment(Fragment::Sha256(parse_hash(top.args[0].name)?))
            }
            "hash256" => {
                expect_args(1)?;
                Self::from_fragment(Fragment::Hash256(parse_hash(top.args[0].name)?))
            }
            "ripemd160" => {
                expect_args(1)?;
                Self::from_fragment(Fragment::Ripemd160(parse_hash(top.args[0].name)?))
            }
            "hash160" => {
                expect_args(1)?;
                Self::from_fragment(Fragment::Hash160(parse_hash(top.args[0].name)?))
            }
            "and_v" | "and_b" | "or_b" | "or_c" | "or_d" | "or_i" => {
                expect_args(2)?;
                let l = Box::new(Self::from_tree(&top.args[0], parser)?);
                let r = Box::new(Self::from_tree(&top.args[1], parser)?);
                Self::from_fragment(match name {
                    "and_v" => Fragment::AndV(l, r),
                    "and_b" => Fragment::AndB(l, r),
                    "or_b" => Fragment::OrB(l, r),
                    "or_c" => Fragment::OrC(l, r),
                    "or_d" => Fragment::OrD(l, r),
                    _ => Fragment::OrI(l, r),
                })
            }
            "andor" => {
                expect_args(3)?;
                let a = Box::new(Self::from_tree(&top.args[0], parser)?);
                let b = Box::new(Self::from_tree(&top.args[1], parser)?);
                let c = Box::new(Self::from_tree(&top.args[2], parser)?);
                Self::from_fragment(Fragment::AndOr(a, b, c))
            }
            "thresh" => {
                if top.args.len() < 2 {
                    return Err(Error::Syntax("thresh needs a threshold and subexpressions".to_owned()));
                }
                let k = parse_num(top.args[0].name)? as usize;
                let subs = top.args[1..]
                    .iter()
                    .map(|arg| Self::from_tree(arg, parser))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::from_fragment(Fragment::Thresh(k, subs))
            }
            "multi" => {
                if top.args.len() < 2 {
                    return Err(Error::Syntax("multi needs a threshold and keys".to_owned()));
                }
                let k = parse_num(top.args[0].name)? as usize;
                let keys = top.args[1..]
                    .iter()
                    .map(|arg| parser.parse_key(arg.name))
                    .collect::<Result<Vec<_>, _>>()?;
                if keys.len() > MAX_PUBKEYS_PER_MULTISIG {
                    return Err(Error::Syntax(format!(
                        "cannot have {} keys in multi; the limit is {}",
                        keys.len(),
                        MAX_PUBKEYS_PER_MULTISIG
                    )));
                }
                if k == 0 || k > keys.len() {
                    return Err(Error::Syntax(format!(
                        "multi threshold {} out of range for {} keys",
                        k,
                        keys.len()
                    )));
                }
                Self::from_fragment(Fragment::Multi(k, keys))
            }
            _ => return Err(Error::Syntax(format!("'{}' is not a miniscript fragment", name))),
        };

        for wc in wrappers.chars().rev() {
            let boxed = Box::new(node);
            node = match wc {
                'a' => Self::from_fragment(Fragment::Alt(boxed)),
                's' => Self::from_fragment(Fragment::Swap(boxed)),
                'c' => Self::from_fragment(Fragment::Check(boxed)),
                'd' => Self::from_fragment(Fragment::DupIf(boxed)),
                'v' => Self::from_fragment(Fragment::Verify(boxed)),
                'j' => Self::from_fragment(Fragment::NonZero(boxed)),
                'n' => Self::from_fragment(Fragment::ZeroNotEqual(boxed)),
                't' => Self::from_fragment(Fragment::AndV(
                    boxed,
                    Box::new(Self::from_fragment(Fragment::True)),
                )),
                'u' => Self::from_fragment(Fragment::OrI(
                    boxed,
                    Box::new(Self::from_fragment(Fragment::False)),
                )),
                'l' => Self::from_fragment(Fragment::OrI(
                    Box::new(Self::from_fragment(Fragment::False)),
                    boxed,
                )),
                _ => return Err(Error::Syntax(format!("unknown wrapper '{}'", wc))),
            };
        }
        Ok(node)
    }

    /// Build a node, computing its type and extra data from its children.
    fn from_fragment(node: Fragment) -> Miniscript {
        let ty = Self::type_check(&node);
        let ext = Self::ext_data(&node);
        Miniscript { node, ty, ext }
    }

    fn type_check(node: &Fragment) -> Option<Type> {
        let ty = |ms: &Miniscript| ms.ty;
        match *node {
            Fragment::True => Some(Type::true_()),
            Fragment::False => Some(Type::false_()),
            Fragment::PkK(..) => Some(Type::pk_k()),
            Fragment::PkH(..) => Some(Type::pk_h()),
            Fragment::Older(..) | Fragment::After(..) => Some(Type::time()),
            Fragment::Sha256(..)
            | Fragment::Hash256(..)
            | Fragment::Ripemd160(..)
            | Fragment::Hash160(..) => Some(Type::hash()),
            Fragment::Multi(..) => Some(Type::multi()),
            Fragment::Alt(ref x) => ty(x)?.cast_alt(),
            Fragment::Swap(ref x) => ty(x)?.cast_swap(),
            Fragment::Check(ref x) => ty(x)?.cast_check(),
            Fragment::DupIf(ref x) => ty(x)?.cast_dupif(),
            Fragment::Verify(ref x) => ty(x)?.cast_verify(),
            Fragment::NonZero(ref x) => ty(x)?.cast_nonzero(),
            Fragment::ZeroNotEqual(ref x) => ty(x)?.cast_zeronotequal(),
            Fragment::AndV(ref x, ref y) => Type::and_v(ty(x)?, ty(y)?),
            Fragment::AndB(ref x, ref y) => Type::and_b(ty(x)?, ty(y)?),
            Fragment::AndOr(ref x, ref y, ref z) => Type::and_or(ty(x)?, ty(y)?, ty(z)?),
            Fragment::OrB(ref x, ref y) => Type::or_b(ty(x)?, ty(y)?),
            Fragment::OrC(ref x, ref y) => Type::or_c(ty(x)?, ty(y)?),
            Fragment::OrD(ref x, ref y) => Type::or_d(ty(x)?, ty(y)?),
            Fragment::OrI(ref x, ref y) => Type::or_i(ty(x)?, ty(y)?),
            Fragment::Thresh(k, ref subs) => {
                let tys = subs.iter().map(|s| s.ty).collect::<Option<Vec<_>>>()?;
                Type::threshold(k, &tys)
            }
        }
    }

    fn ext_data(node: &Fragment) -> ExtData {
        let zero = TimelockInfo::default();
        match *node {
            Fragment::True | Fragment::False => {
                ExtData { script_size: 1, ops: 0, timelocks: zero }
            }
            Fragment::PkK(..) => ExtData { script_size: 34, ops: 0, timelocks: zero },
            Fragment::PkH(..) => ExtData { script_size: 24, ops: 3, timelocks: zero },
            Fragment::Older(n) => ExtData {
                script_size: script_num_size(n as usize) + 1,
                ops: 1,
                timelocks: TimelockInfo::from_older(n),
            },
            Fragment::After(n) => ExtData {
                script_size: script_num_size(n as usize) + 1,
                ops: 1,
                timelocks: TimelockInfo::from_after(n),
            },
            Fragment::Sha256(..) | Fragment::Hash256(..) => {
                ExtData { script_size: 39, ops: 4, timelocks: zero }
            }
            Fragment::Ripemd160(..) | Fragment::Hash160(..) => {
                ExtData { script_size: 27, ops: 4, timelocks: zero }
            }
            Fragment::Alt(ref x) => {
                ExtData { script_size: x.ext.script_size + 2, ops: x.ext.ops + 2, ..x.ext }
            }
            Fragment::Swap(ref x) => {
                ExtData { script_size: x.ext.script_size + 1, ops: x.ext.ops + 1, ..x.ext }
            }
            Fragment::Check(ref x) => {
                ExtData { script_size: x.ext.script_size + 1, ops: x.ext.ops + 1, ..x.ext }
            }
            Fragment::DupIf(ref x) => {
                ExtData { script_size: x.ext.script_size + 3, ops: x.ext.ops + 3, ..x.ext }
            }
            Fragment::Verify(ref x) => {
                ExtData { script_size: x.ext.script_size + 1, ops: x.ext.ops + 1, ..x.ext }
            }
            Fragment::NonZero(ref x) => {
                ExtData { script_size: x.ext.script_size + 4, ops: x.ext.ops + 4, ..x.ext }
            }
            Fragment::ZeroNotEqual(ref x) => {
                ExtData { script_size: x.ext.script_size + 1, ops: x.ext.ops + 1, ..x.ext }
            }
            Fragment::AndV(ref x, ref y) => ExtData {
                script_size: x.ext.script_size + y.ext.script_size,
                ops: x.ext.ops + y.ext.ops,
                timelocks: TimelockInfo::combine_and(x.ext.timelocks, y.ext.timelocks),
            },
            Fragment::AndB(ref x, ref y) => ExtData {
                script_size: x.ext.script_size + y.ext.script_size + 1,
                ops: x.ext.ops + y.ext.ops + 1,
                timelocks: TimelockInfo::combine_and(x.ext.timelocks, y.ext.timelocks),
            },
            Fragment::AndOr(ref x, ref y, ref z) => ExtData {
                script_size: x.ext.script_size + y.ext.script_size + z.ext.script_size + 3,
                ops: x.ext.ops + y.ext.ops + z.ext.ops + 3,
                timelocks: TimelockInfo::combine_or(
                    TimelockInfo::combine_and(x.ext.timelocks, y.ext.timelocks),
                    z.ext.timelocks,
                ),
            },
            Fragment::OrB(ref x, ref y) => ExtData {
                script_size: x.ext.script_size + y.ext.script_size + 1,
                ops: x.ext.ops + y.ext.ops + 1,
                timelocks: TimelockInfo::combine_or(x.ext.timelocks, y.ext.timelocks),
            },
            Fragment::OrC(ref x, ref y) => ExtData {
                script_size: x.ext.script_size + y.ext.script_size + 2,
                ops: x.ext.ops + y.ext.ops + 2,
                timelocks: TimelockInfo::combine_or(x.ext.timelocks, y.ext.timelocks),
            },
            Fragment::OrD(ref x, ref y) => ExtData {
                script_size: x.ext.script_size + y.ext.script_size + 3,
                ops: x.ext.ops + y.ext.ops + 3,
                timelocks: TimelockInfo::combine_or(x.ext.timelocks, y.ext.timelocks),
            },
            Fragment::OrI(ref x, ref y) => ExtData {
                script_size: x.ext.script_size + y.ext.script_size + 3,
                ops: x.ext.ops + y.ext.ops + 3,
                timelocks: TimelockInfo::combine_or(x.ext.timelocks, y.ext.timelocks),
            },
            Fragment::Thresh(k, ref subs) => {
                let script_size = subs.iter().map(|s| s.ext.script_size).sum::<usize>()
                    + subs.len()
                    - 1
                    + script_num_size(k)
                    + 1;
                let ops = subs.iter().map(|s| s.ext.ops).sum::<usize>() + subs.len();
                let timelocks =
                    TimelockInfo::combine_threshold(k, subs.iter().map(|s| s.ext.timelocks));
                ExtData { script_size, ops, timelocks }
            }
            Fragment::Multi(k, ref keys) => ExtData {
                script_size: script_num_size(k)
                    + 1
                    + script_num_size(keys.len())
                    + 34 * keys.len(),
                ops: 1,
                timelocks: zero,
            },
        }
    }
}

fn check_locktime(n: u32, name: &str) -> Result<(), Error> {
    if n == 0 || n >= 0x8000_0000 {
        return Err(Error::Syntax(format!("{}({}) locktime out of range", name, n)));
    }
    Ok(())
}

fn parse_hash<const N: usize>(s: &str) -> Result<[u8; N], Error> {
    <[u8; N]>::from_hex(s)
        .map_err(|_| Error::Syntax(format!("'{}' is not a {}-byte hex hash", s, N)))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Key parser over plain hex keys, for tests.
    struct HexKeys(Vec<String>);

    impl KeyParser for HexKeys {
        fn parse_key(&mut self, s: &str) -> Result<u32, Error> {
            self.0.push(s.to_owned());
            Ok(self.0.len() as u32 - 1)
        }
        fn keys_equal(&self, a: u32, b: u32) -> bool {
            self.0[a as usize] == self.0[b as usize]
        }
    }

    impl StringMaker for HexKeys {
        fn key_string(&self, key: u32) -> Option<String> {
            self.0.get(key as usize).cloned()
        }
    }

    const K1: &str = "020202020202020202020202020202020202020202020202020202020202020202";
    const K2: &str = "030303030303030303030303030303030303030303030303030303030303030303";

    fn roundtrip(s: &str) {
        let mut keys = HexKeys(vec![]);
        let ms = Miniscript::from_string(s, &mut keys).unwrap();
        assert_eq!(ms.to_string_with(&keys).unwrap(), s);
    }

    #[test]
    fn parse_print_roundtrip() {
        roundtrip(&format!("pk({})", K1));
        roundtrip(&format!("and_v(v:pk({}),older(144))", K1));
        roundtrip(&format!("or_d(pk({}),and_v(v:pkh({}),after(1000)))", K1, K2));
        roundtrip(&format!("thresh(2,pk({}),s:pk({}),sln:older(12960))", K1, K2));
        roundtrip(&format!("multi(2,{},{})", K1, K2));
        roundtrip(&format!(
            "andor(pk({}),older(42),sha256(0000000000000000000000000000000000000000000000000000000000000000))",
            K1
        ));
    }

    #[test]
    fn sanity_analysis() {
        let mut keys = HexKeys(vec![]);
        let ms = Miniscript::from_string(&format!("and_v(v:pk({}),older(144))", K1), &mut keys)
            .unwrap();
        assert!(ms.is_sane(&keys));

        // No signature anywhere: not sane at the top.
        let mut keys = HexKeys(vec![]);
        let ms = Miniscript::from_string("older(144)", &mut keys).unwrap();
        assert_eq!(ms.insanity(&keys, true), Some(Insanity::NoSignature));
        // But fine as a subexpression.
        assert_eq!(ms.insanity(&keys, false), None);

        // Duplicate keys.
        let mut keys = HexKeys(vec![]);
        let ms =
            Miniscript::from_string(&format!("or_b(pk({}),s:pk({}))", K1, K1), &mut keys).unwrap();
        assert_eq!(ms.insanity(&keys, true), Some(Insanity::DuplicateKeys));

        // Timelock mix inside an `and`.
        let mut keys = HexKeys(vec![]);
        let ms = Miniscript::from_string(
            &format!("and_v(v:pk({}),and_b(older(4194305),a:older(144)))", K1),
            &mut keys,
        )
        .unwrap();
        assert_eq!(ms.insanity(&keys, true), Some(Insanity::TimelockMix));

        // An ill-typed expression: double verify.
        let mut keys = HexKeys(vec![]);
        let ms = Miniscript::from_string(&format!("vv:pk({})", K1), &mut keys).unwrap();
        assert_eq!(ms.insanity(&keys, true), Some(Insanity::Invalid));
        let (sub, reason) = ms.find_insane_sub(&keys).unwrap();
        assert_eq!(reason, Insanity::Invalid);
        // The deepest offender is the inner v:pk fragment re-wrapped.
        assert!(sub.to_string_with(&keys).is_some());
    }

    #[test]
    fn script_emission() {
        struct FixedKeys;
        impl ScriptMaker for FixedKeys {
            fn pk_bytes(&self, _key: u32) -> Vec<u8> {
                let mut v = vec![0x02];
                v.extend_from_slice(&[0x02; 32]);
                v
            }
            fn pkh_bytes(&self, _key: u32) -> [u8; 20] { [0xab; 20] }
        }

        let mut keys = HexKeys(vec![]);
        let ms = Miniscript::from_string(&format!("and_v(v:pk({}),older(144))", K1), &mut keys)
            .unwrap();
        let script = ms.to_script(&FixedKeys);
        // <key> CHECKSIGVERIFY <144> CSV; the fused CHECKSIGVERIFY makes the
        // real script one byte shorter than the conservative size bound.
        assert_eq!(script.len(), 34 + 1 + 3 + 1);
        assert_eq!(ms.ext.script_size, script.len() + 1);
        assert_eq!(script.as_bytes().last(), Some(&OP_CSV.to_u8()));

        let asm = script.to_asm_string();
        assert!(asm.contains("OP_CHECKSIGVERIFY"), "{}", asm);
    }
}
