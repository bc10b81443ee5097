// SPDX-License-Identifier: CC0-1.0

//! Pubkey providers
//!
//! A descriptor's key arguments are *providers*: polymorphic sources of a
//! `(public key, origin)` pair at a derivation position. A constant key
//! ignores the position; a BIP-32 provider walks its path, substituting the
//! position for a trailing wildcard; an origin-wrapped provider prepends
//! externally-supplied origin information to whatever its inner provider
//! produces.

use core::fmt;
use core::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::hashes::Hash as _;
use bitcoin::hex::FromHex;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{PrivateKey, PublicKey};

use super::cache::DescriptorCache;
use super::ParseCtx;
use crate::provider::{FlatSigningProvider, SigningProvider};
use crate::Error;

/// The hardened marker bit of a BIP-32 child index.
pub const HARDENED_BIT: u32 = 0x8000_0000;

/// Master fingerprint, derivation path, and (for MWEB keys) the stealth
/// address index a key was derived with.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyOrigin {
    /// Fingerprint of the master key.
    pub fingerprint: Fingerprint,
    /// Derivation steps below the master key.
    pub path: DerivationPath,
    /// Stealth-address index for keys derived through `mweb()`. The
    /// intermediate HD path of such keys is deliberately not recorded:
    /// spend reconstruction goes through the tweak scalar, not the HD
    /// tree.
    pub mweb_index: Option<u32>,
}

impl KeyOrigin {
    /// Origin carrying only a master fingerprint and a stealth index.
    pub fn for_stealth_index(fingerprint: Fingerprint, index: u32) -> Self {
        KeyOrigin { fingerprint, path: DerivationPath::master(), mweb_index: Some(index) }
    }
}

impl Default for KeyOrigin {
    fn default() -> Self {
        KeyOrigin {
            fingerprint: Fingerprint::from([0u8; 4]),
            path: DerivationPath::master(),
            mweb_index: None,
        }
    }
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.fingerprint)?;
        fmt_derivation_path(f, &self.path)
    }
}

/// Writes a derivation path to the formatter, each step slash-prefixed.
pub(super) fn fmt_derivation_path(f: &mut fmt::Formatter, path: &DerivationPath) -> fmt::Result {
    for child in path {
        write!(f, "/{}", child)?;
    }
    Ok(())
}

/// Whether a BIP-32 provider ends in a wildcard, and of which kind.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Wildcard {
    /// No wildcard: the provider always evaluates to the same key.
    None,
    /// Unhardened wildcard, e.g. `/*`.
    Unhardened,
    /// Hardened wildcard, e.g. `/*'` or `/*h`.
    Hardened,
}

/// A polymorphic source of public keys for one key expression within a
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubkeyProvider {
    /// A fixed public key.
    Const(ConstProvider),
    /// An extended key with a derivation path and optional wildcard.
    Bip32(Bip32Provider),
    /// Externally supplied origin information wrapped around another provider.
    Origin(OriginProvider),
}

/// Provider for a fixed key parsed from hex or WIF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstProvider {
    /// Position of this key expression within its descriptor.
    pub index: u32,
    /// The key itself.
    pub pubkey: PublicKey,
    /// Whether the expression was written in 32-byte x-only form.
    pub xonly: bool,
}

/// Provider deriving along a BIP-32 path below an extended public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bip32Provider {
    /// Position of this key expression within its descriptor.
    pub index: u32,
    /// The root extended key the expression named.
    pub xpub: Xpub,
    /// Path from the root key, excluding any wildcard.
    pub path: DerivationPath,
    /// Trailing wildcard, if any.
    pub wildcard: Wildcard,
}

/// Provider prepending `[fingerprint/path]` origin data to an inner provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginProvider {
    /// Position of this key expression within its descriptor.
    pub index: u32,
    /// The declared origin.
    pub origin: KeyOrigin,
    /// The wrapped provider.
    pub inner: Box<PubkeyProvider>,
}

impl PubkeyProvider {
    /// Position of this key expression within its descriptor.
    pub fn key_exp_index(&self) -> u32 {
        match *self {
            PubkeyProvider::Const(ref p) => p.index,
            PubkeyProvider::Bip32(ref p) => p.index,
            PubkeyProvider::Origin(ref p) => p.index,
        }
    }

    /// Whether any number of keys can be derived from this provider.
    pub fn is_range(&self) -> bool {
        match *self {
            PubkeyProvider::Const(..) => false,
            PubkeyProvider::Bip32(ref p) => p.wildcard != Wildcard::None,
            PubkeyProvider::Origin(ref p) => p.inner.is_range(),
        }
    }

    /// Serialized size of the keys this provider yields.
    pub fn key_size(&self) -> usize {
        match *self {
            PubkeyProvider::Const(ref p) => {
                if p.pubkey.compressed {
                    33
                } else {
                    65
                }
            }
            PubkeyProvider::Bip32(..) => 33,
            PubkeyProvider::Origin(ref p) => p.inner.key_size(),
        }
    }

    /// Derive the public key and its origin at `pos`.
    ///
    /// Expensive derivations are served from `read_cache` when provided and
    /// recorded into `write_cache` when provided.
    pub fn get_pubkey(
        &self,
        pos: i32,
        arg: &dyn SigningProvider,
        read_cache: Option<&DescriptorCache>,
        write_cache: Option<&mut DescriptorCache>,
    ) -> Result<(PublicKey, KeyOrigin), Error> {
        match *self {
            PubkeyProvider::Const(ref p) => {
                let mut origin = KeyOrigin::default();
                let id = p.pubkey.pubkey_hash();
                origin.fingerprint = Fingerprint::from(
                    <[u8; 4]>::try_from(&id.as_byte_array()[..4]).expect("4 byte slice"),
                );
                Ok((p.pubkey, origin))
            }
            PubkeyProvider::Bip32(ref p) => p.get_pubkey(pos, arg, read_cache, write_cache),
            PubkeyProvider::Origin(ref p) => {
                let (pubkey, inner_origin) = p.inner.get_pubkey(pos, arg, read_cache, write_cache)?;
                Ok((pubkey, p.rebase_origin(&inner_origin)))
            }
        }
    }

    /// Derive the private key at `pos`, if `arg` holds the necessary
    /// material.
    pub fn get_privkey(&self, pos: i32, arg: &dyn SigningProvider) -> Option<PrivateKey> {
        match *self {
            PubkeyProvider::Const(ref p) => {
                if p.xonly {
                    // The negated key also satisfies an x-only expression.
                    for id in [p.pubkey.pubkey_hash(), negate(&p.pubkey).pubkey_hash()] {
                        if let Some(key) = arg.get_key(&id) {
                            return Some(key);
                        }
                    }
                    None
                } else {
                    arg.get_key(&p.pubkey.pubkey_hash())
                }
            }
            PubkeyProvider::Bip32(ref p) => p.get_privkey(pos, arg),
            PubkeyProvider::Origin(ref p) => p.inner.get_privkey(pos, arg),
        }
    }

    /// Origin information at `pos` without deriving the key itself.
    pub fn get_key_origin(&self, pos: i32) -> Option<KeyOrigin> {
        match *self {
            PubkeyProvider::Const(..) => None,
            PubkeyProvider::Bip32(ref p) => Some(KeyOrigin {
                fingerprint: p.xpub.fingerprint(),
                path: p.path_at(pos),
                mweb_index: None,
            }),
            PubkeyProvider::Origin(ref p) => {
                let mut origin = match p.inner.get_key_origin(pos) {
                    Some(inner) => p.rebase_origin(&inner),
                    None => p.origin.clone(),
                };
                origin.mweb_index = p.origin.mweb_index;
                Some(origin)
            }
        }
    }

    /// Public textual form of the key expression.
    pub fn to_public_string(&self) -> String {
        match *self {
            PubkeyProvider::Const(ref p) => {
                if p.xonly {
                    let hex = p.pubkey.to_string();
                    hex[2..].to_owned()
                } else {
                    p.pubkey.to_string()
                }
            }
            PubkeyProvider::Bip32(ref p) => p.to_public_string(),
            PubkeyProvider::Origin(ref p) => {
                format!("[{}]{}", p.origin, p.inner.to_public_string())
            }
        }
    }

    /// Textual form with private key material substituted from `arg`.
    /// `None` if the material is unavailable.
    pub fn to_private_string(&self, arg: &dyn SigningProvider) -> Option<String> {
        match *self {
            PubkeyProvider::Const(..) => Some(self.get_privkey(0, arg)?.to_wif()),
            PubkeyProvider::Bip32(ref p) => p.to_private_string(arg),
            PubkeyProvider::Origin(ref p) => {
                Some(format!("[{}]{}", p.origin, p.inner.to_private_string(arg)?))
            }
        }
    }

    /// Normalized textual form: hardened derivation is collapsed into the
    /// origin bracket and the key is rendered as the xpub at the last
    /// hardened step. Needs either a cache holding that xpub or private
    /// material in `arg`.
    pub fn to_normalized_string(
        &self,
        arg: &dyn SigningProvider,
        cache: Option<&DescriptorCache>,
    ) -> Option<String> {
        match *self {
            PubkeyProvider::Const(..) => Some(self.to_public_string()),
            PubkeyProvider::Bip32(ref p) => p.to_normalized_string(arg, cache),
            PubkeyProvider::Origin(ref p) => {
                let sub = p.inner.to_normalized_string(arg, cache)?;
                if let Some(stripped) = sub.strip_prefix('[') {
                    // The inner provider emitted its own origin; splice our
                    // path in front of it, dropping the inner fingerprint.
                    Some(format!("[{}{}", p.origin, &stripped[8..]))
                } else {
                    Some(format!("[{}]{}", p.origin, sub))
                }
            }
        }
    }
}

fn negate(pk: &PublicKey) -> PublicKey {
    let mut ser = pk.inner.serialize();
    ser[0] = if ser[0] == 0x02 { 0x03 } else { 0x02 };
    PublicKey::from_slice(&ser).expect("negating a parity byte preserves validity")
}

impl OriginProvider {
    /// Prefix the declared origin path onto an origin produced by the inner
    /// provider, replacing its fingerprint.
    fn rebase_origin(&self, inner: &KeyOrigin) -> KeyOrigin {
        let mut path: Vec<ChildNumber> = (&self.origin.path).into_iter().copied().collect();
        path.extend((&inner.path).into_iter().copied());
        KeyOrigin {
            fingerprint: self.origin.fingerprint,
            path: path.into(),
            mweb_index: inner.mweb_index.or(self.origin.mweb_index),
        }
    }
}

impl Bip32Provider {
    /// Whether deriving the final key requires private material.
    fn is_hardened(&self) -> bool {
        if self.wildcard == Wildcard::Hardened {
            return true;
        }
        (&self.path).into_iter().any(|c| c.is_hardened())
    }

    /// The child number the wildcard stands for at `pos`.
    fn wildcard_child(&self, pos: i32) -> Result<Option<ChildNumber>, Error> {
        if pos < 0 {
            return Ok(None);
        }
        Ok(match self.wildcard {
            Wildcard::None => None,
            Wildcard::Unhardened => Some(unhardened_child(pos)?),
            Wildcard::Hardened => Some(ChildNumber::from(pos as u32 | HARDENED_BIT)),
        })
    }

    /// The provider path with the wildcard substituted by `pos`.
    fn path_at(&self, pos: i32) -> DerivationPath {
        let mut path: Vec<ChildNumber> = (&self.path).into_iter().copied().collect();
        if pos >= 0 {
            match self.wildcard {
                Wildcard::None => {}
                Wildcard::Unhardened => path.push(ChildNumber::from(pos as u32)),
                Wildcard::Hardened => path.push(ChildNumber::from(pos as u32 | HARDENED_BIT)),
            }
        }
        path.into()
    }

    /// Reconstruct the root xprv by pairing the private key held by `arg`
    /// with this provider's chain code.
    fn root_xprv(&self, arg: &dyn SigningProvider) -> Option<Xpriv> {
        let root_pubkey = PublicKey::new(self.xpub.public_key);
        let key = arg.get_key(&root_pubkey.pubkey_hash())?;
        Some(Xpriv {
            network: key.network,
            depth: self.xpub.depth,
            parent_fingerprint: self.xpub.parent_fingerprint,
            child_number: self.xpub.child_number,
            private_key: key.inner,
            chain_code: self.xpub.chain_code,
        })
    }

    /// Derive the root xprv along the provider path (wildcard excluded).
    /// Also returns the xprv at the last hardened step, when one exists.
    fn get_derived_xprv(&self, arg: &dyn SigningProvider) -> Option<(Xpriv, Option<Xpriv>)> {
        let secp = Secp256k1::new();
        let mut xprv = self.root_xprv(arg)?;
        let mut last_hardened = None;
        for child in &self.path {
            xprv = xprv.derive_priv(&secp, &[*child]).ok()?;
            if child.is_hardened() {
                last_hardened = Some(xprv);
            }
        }
        Some((xprv, last_hardened))
    }

    fn get_pubkey(
        &self,
        pos: i32,
        arg: &dyn SigningProvider,
        read_cache: Option<&DescriptorCache>,
        write_cache: Option<&mut DescriptorCache>,
    ) -> Result<(PublicKey, KeyOrigin), Error> {
        let secp = Secp256k1::new();
        let origin = KeyOrigin {
            fingerprint: self.xpub.fingerprint(),
            path: self.path_at(pos),
            mweb_index: None,
        };

        let mut parent_extkey = None;
        let final_extkey;
        let mut last_hardened_extkey = None;
        if let Some(cache) = read_cache {
            if let Some(cached) = cache.get_derived_xpub(self.index, pos as u32) {
                final_extkey = cached;
            } else {
                if self.wildcard == Wildcard::Hardened {
                    return Err(Error::KeyDerivation(
                        "hardened derivation not present in cache".to_owned(),
                    ));
                }
                let parent = cache.get_parent_xpub(self.index).ok_or_else(|| {
                    Error::KeyDerivation("parent xpub not present in cache".to_owned())
                })?;
                final_extkey = match self.wildcard_child(pos)? {
                    Some(child) => parent.ckd_pub(&secp, child)?,
                    None => parent,
                };
                parent_extkey = Some(parent);
            }
        } else if self.is_hardened() {
            let (mut xprv, lh_xprv) = self.get_derived_xprv(arg).ok_or_else(|| {
                Error::KeyDerivation("hardened derivation requires the private key".to_owned())
            })?;
            parent_extkey = Some(Xpub::from_priv(&secp, &xprv));
            if let Some(child) = self.wildcard_child(pos)? {
                xprv = xprv.derive_priv(&secp, &[child])?;
            }
            final_extkey = Xpub::from_priv(&secp, &xprv);
            last_hardened_extkey = lh_xprv.map(|lh| Xpub::from_priv(&secp, &lh));
        } else {
            let parent = self.xpub.derive_pub(&secp, &self.path)?;
            final_extkey = match self.wildcard_child(pos)? {
                Some(child) => parent.ckd_pub(&secp, child)?,
                None => parent,
            };
            parent_extkey = Some(parent);
        }

        if let Some(cache) = write_cache {
            if self.wildcard != Wildcard::Hardened {
                // Only the parent is cached when the tail is unhardened; the
                // per-index children are cheap to re-derive from it.
                if let Some(parent) = parent_extkey {
                    cache.cache_parent_xpub(self.index, parent);
                }
                if let Some(lh) = last_hardened_extkey {
                    cache.cache_last_hardened_xpub(self.index, lh);
                }
            } else {
                cache.cache_derived_xpub(self.index, pos as u32, final_extkey);
            }
        }

        Ok((PublicKey::new(final_extkey.public_key), origin))
    }

    fn get_privkey(&self, pos: i32, arg: &dyn SigningProvider) -> Option<PrivateKey> {
        let secp = Secp256k1::new();
        let (mut xprv, _) = self.get_derived_xprv(arg)?;
        if let Some(child) = self.wildcard_child(pos).ok()? {
            xprv = xprv.derive_priv(&secp, &[child]).ok()?;
        }
        Some(PrivateKey::new(xprv.private_key, xprv.network))
    }

    fn fmt_suffix(&self, s: &mut String) {
        use core::fmt::Write;
        for child in &self.path {
            write!(s, "/{}", child).expect("writing to string");
        }
        match self.wildcard {
            Wildcard::None => {}
            Wildcard::Unhardened => s.push_str("/*"),
            Wildcard::Hardened => s.push_str("/*'"),
        }
    }

    fn to_public_string(&self) -> String {
        let mut ret = self.xpub.to_string();
        self.fmt_suffix(&mut ret);
        ret
    }

    fn to_private_string(&self, arg: &dyn SigningProvider) -> Option<String> {
        let root_pubkey = PublicKey::new(self.xpub.public_key);
        let key = arg.get_key(&root_pubkey.pubkey_hash())?;
        let xprv = Xpriv {
            network: key.network,
            depth: self.xpub.depth,
            parent_fingerprint: self.xpub.parent_fingerprint,
            child_number: self.xpub.child_number,
            private_key: key.inner,
            chain_code: self.xpub.chain_code,
        };
        let mut ret = xprv.to_string();
        self.fmt_suffix(&mut ret);
        Some(ret)
    }

    fn to_normalized_string(
        &self,
        arg: &dyn SigningProvider,
        cache: Option<&DescriptorCache>,
    ) -> Option<String> {
        use core::fmt::Write;

        // A hardened wildcard cannot be normalized without fixing the
        // position; emit the public form unchanged.
        if self.wildcard == Wildcard::Hardened {
            return Some(self.to_public_string());
        }
        let steps: Vec<ChildNumber> = (&self.path).into_iter().copied().collect();
        let last_hardened = match steps.iter().rposition(|c| c.is_hardened()) {
            Some(i) => i,
            // No derivation, or all-unhardened derivation.
            None => return Some(self.to_public_string()),
        };

        let xpub = match cache.and_then(|c| c.get_last_hardened_xpub(self.index)) {
            Some(xpub) => xpub,
            None => {
                // Cache miss or no cache; derive it ourselves.
                let secp = Secp256k1::new();
                let root_pubkey = PublicKey::new(self.xpub.public_key);
                let key = arg.get_key(&root_pubkey.pubkey_hash())?;
                let mut xprv = Xpriv {
                    network: key.network,
                    depth: self.xpub.depth,
                    parent_fingerprint: self.xpub.parent_fingerprint,
                    child_number: self.xpub.child_number,
                    private_key: key.inner,
                    chain_code: self.xpub.chain_code,
                };
                let prefix: Vec<ChildNumber> = steps[..=last_hardened].to_vec();
                xprv = xprv.derive_priv(&secp, &prefix).ok()?;
                Xpub::from_priv(&secp, &xprv)
            }
        };

        let mut ret = format!("[{}", self.xpub.fingerprint());
        for child in &steps[..=last_hardened] {
            write!(ret, "/{}", child).expect("writing to string");
        }
        write!(ret, "]{}", xpub).expect("writing to string");
        for child in &steps[last_hardened + 1..] {
            write!(ret, "/{}", child).expect("writing to string");
        }
        if self.wildcard == Wildcard::Unhardened {
            ret.push_str("/*");
        }
        Some(ret)
    }
}

fn unhardened_child(pos: i32) -> Result<ChildNumber, Error> {
    if pos < 0 {
        return Err(Error::KeyDerivation(format!("derivation position {} is negative", pos)));
    }
    ChildNumber::from_normal_idx(pos as u32)
        .map_err(|_| Error::KeyDerivation(format!("derivation index {} out of range", pos)))
}

/// Parse a `/`-separated key path. The first element of `split` is the key
/// body and is ignored.
pub(super) fn parse_key_path(split: &[&str]) -> Result<DerivationPath, Error> {
    let mut path = Vec::with_capacity(split.len().saturating_sub(1));
    for elem in &split[1..] {
        let (num, hardened) = match elem.strip_suffix('\'').or_else(|| elem.strip_suffix('h')) {
            Some(prefix) => (prefix, true),
            None => (*elem, false),
        };
        let p = u32::from_str(num).map_err(|_| {
            Error::Syntax(format!("key path value '{}' is not a valid uint32", elem))
        })?;
        if p > 0x7FFF_FFFF {
            return Err(Error::Syntax(format!("key path value {} is out of range", p)));
        }
        path.push(ChildNumber::from(p | ((hardened as u32) << 31)));
    }
    Ok(path.into())
}

/// Parse a key expression that excludes origin information.
fn parse_pubkey_inner(
    key_exp_index: u32,
    sp: &str,
    ctx: ParseCtx,
    out: &mut FlatSigningProvider,
) -> Result<PubkeyProvider, Error> {
    let permit_uncompressed = ctx == ParseCtx::Top || ctx == ParseCtx::P2sh;
    let split: Vec<&str> = sp.split('/').collect();
    let key_str = split[0];
    if key_str.is_empty() {
        return Err(Error::Syntax("no key provided".to_owned()));
    }
    if split.len() == 1 {
        if key_str.len() % 2 == 0 && key_str.chars().all(|c| c.is_ascii_hexdigit()) {
            let data = Vec::<u8>::from_hex(key_str).expect("checked hex");
            if let Ok(pubkey) = PublicKey::from_slice(&data) {
                return if permit_uncompressed || pubkey.compressed {
                    Ok(PubkeyProvider::Const(ConstProvider {
                        index: key_exp_index,
                        pubkey,
                        xonly: false,
                    }))
                } else {
                    Err(Error::Context("uncompressed keys are not allowed".to_owned()))
                };
            }
            if data.len() == 32 && ctx == ParseCtx::P2tr {
                let mut full = [0u8; 33];
                full[0] = 0x02;
                full[1..].copy_from_slice(&data);
                if let Ok(pubkey) = PublicKey::from_slice(&full) {
                    return Ok(PubkeyProvider::Const(ConstProvider {
                        index: key_exp_index,
                        pubkey,
                        xonly: true,
                    }));
                }
            }
            return Err(Error::Syntax(format!("pubkey '{}' is invalid", key_str)));
        }
        if let Ok(key) = PrivateKey::from_wif(key_str) {
            let secp = Secp256k1::signing_only();
            let pubkey = key.public_key(&secp);
            return if permit_uncompressed || key.compressed {
                out.insert_key(key, pubkey);
                Ok(PubkeyProvider::Const(ConstProvider {
                    index: key_exp_index,
                    pubkey,
                    xonly: ctx == ParseCtx::P2tr,
                }))
            } else {
                Err(Error::Context("uncompressed keys are not allowed".to_owned()))
            };
        }
    }

    let (xpub, xprv) = match Xpriv::from_str(key_str) {
        Ok(xprv) => {
            let secp = Secp256k1::signing_only();
            (Xpub::from_priv(&secp, &xprv), Some(xprv))
        }
        Err(_) => match Xpub::from_str(key_str) {
            Ok(xpub) => (xpub, None),
            Err(_) => return Err(Error::Syntax(format!("key '{}' is not valid", key_str))),
        },
    };

    let mut split = split;
    let wildcard = match split.last() {
        Some(&"*") => {
            split.pop();
            Wildcard::Unhardened
        }
        Some(&"*'") | Some(&"*h") => {
            split.pop();
            Wildcard::Hardened
        }
        _ => Wildcard::None,
    };
    if split[1..].iter().any(|e| e.starts_with('*')) {
        return Err(Error::Syntax(
            "'*' may only appear as the last element in a derivation path".to_owned(),
        ));
    }
    let path = parse_key_path(&split)?;

    if let Some(xprv) = xprv {
        out.insert_key(
            PrivateKey::new(xprv.private_key, xprv.network),
            PublicKey::new(xpub.public_key),
        );
    }

    Ok(PubkeyProvider::Bip32(Bip32Provider { index: key_exp_index, xpub, path, wildcard }))
}

/// Parse a key expression, including any `[fingerprint/path]` origin prefix.
///
/// Private keys encountered along the way are deposited in `out` so the
/// caller can sign with them later.
pub(super) fn parse_pubkey(
    key_exp_index: u32,
    sp: &str,
    ctx: ParseCtx,
    out: &mut FlatSigningProvider,
) -> Result<PubkeyProvider, Error> {
    let origin_split: Vec<&str> = sp.splitn(3, ']').collect();
    if origin_split.len() > 2 {
        return Err(Error::Syntax(
            "multiple ']' characters found for a single pubkey".to_owned(),
        ));
    }
    if origin_split.len() == 1 {
        return parse_pubkey_inner(key_exp_index, origin_split[0], ctx, out);
    }
    let origin = match origin_split[0].strip_prefix('[') {
        Some(o) => o,
        None => {
            return Err(Error::Syntax(format!(
                "key origin start '[' character expected but not found, got '{}' instead",
                origin_split[0].chars().next().unwrap_or(']')
            )))
        }
    };
    let slash_split: Vec<&str> = origin.split('/').collect();
    if slash_split[0].len() != 8 {
        return Err(Error::Syntax(format!(
            "fingerprint is not 4 bytes ({} characters instead of 8 characters)",
            slash_split[0].len()
        )));
    }
    let fingerprint = Fingerprint::from_str(slash_split[0]).map_err(|_| {
        Error::Syntax(format!("fingerprint '{}' is not hex", slash_split[0]))
    })?;
    let path = parse_key_path(&slash_split)?;
    let inner = parse_pubkey_inner(key_exp_index, origin_split[1], ctx, out)?;
    Ok(PubkeyProvider::Origin(OriginProvider {
        index: key_exp_index,
        origin: KeyOrigin { fingerprint, path, mweb_index: None },
        inner: Box::new(inner),
    }))
}

/// Build a provider for a key recovered from a script, attaching origin
/// info when `provider` knows it.
pub(super) fn infer_pubkey(pubkey: PublicKey, provider: &dyn SigningProvider) -> PubkeyProvider {
    let inner = PubkeyProvider::Const(ConstProvider { index: 0, pubkey, xonly: false });
    if let Some((_, origin)) = provider.get_key_origin(&pubkey.pubkey_hash()) {
        PubkeyProvider::Origin(OriginProvider { index: 0, origin, inner: Box::new(inner) })
    } else {
        inner
    }
}

/// As [`infer_pubkey`], for x-only keys recovered from taproot scripts.
pub(super) fn infer_xonly_pubkey(
    xonly: &bitcoin::key::XOnlyPublicKey,
    provider: &dyn SigningProvider,
) -> PubkeyProvider {
    let mut full = [0u8; 33];
    full[0] = 0x02;
    full[1..].copy_from_slice(&xonly.serialize());
    let pubkey = PublicKey::from_slice(&full).expect("x-only keys lift to even parity");
    let inner = PubkeyProvider::Const(ConstProvider { index: 0, pubkey, xonly: true });
    if let Some(origin) = provider.get_key_origin_by_xonly(xonly) {
        PubkeyProvider::Origin(OriginProvider { index: 0, origin, inner: Box::new(inner) })
    } else {
        inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str, ctx: ParseCtx) -> Result<PubkeyProvider, Error> {
        let mut out = FlatSigningProvider::new();
        parse_pubkey(0, s, ctx, &mut out)
    }

    #[test]
    fn parse_key_expression_errors() {
        // Misplaced wildcard.
        let desc = "[78412e3a/44'/0'/0']xpub6ERApfZwUNrhLCkDtcHTcxd75RbzS1ed54G1LkBUHQVHQKqhMkhgbmJbZRkrgZw4koxb5JaHWkY4ALHY2grBGRjaDMzQLcgJvLJuZZvRcEL/1/*/44";
        assert!(parse(desc, ParseCtx::Top).is_err());

        // Invalid fingerprint.
        let desc = "[NonHexor]xpub6ERApfZwUNrhLCkDtcHTcxd75RbzS1ed54G1LkBUHQVHQKqhMkhgbmJbZRkrgZw4koxb5JaHWkY4ALHY2grBGRjaDMzQLcgJvLJuZZvRcEL/1/*";
        assert_eq!(
            parse(desc, ParseCtx::Top),
            Err(Error::Syntax("fingerprint 'NonHexor' is not hex".to_owned()))
        );

        // Invalid xpub.
        let desc = "[78412e3a]xpub1ed54G1LkBUHQVHQKqhMkhgbmJbZRkrgZw4koxb5JaLcgJvLJuZZvRcEL/1/*";
        assert!(parse(desc, ParseCtx::Top).is_err());

        // Multiple ']'.
        let desc = "[78412e3a]]03f28773c2d975288bc7d1d205c3748651b075fbc6610e58cddeeddf8f19405aa8";
        assert_eq!(
            parse(desc, ParseCtx::Top),
            Err(Error::Syntax("multiple ']' characters found for a single pubkey".to_owned()))
        );

        // Hybrid keys are rejected.
        let desc = "0777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777777";
        assert!(parse(desc, ParseCtx::Top).is_err());
    }

    #[test]
    fn parse_wildcards() {
        let desc = "[abcdef00/0'/1']tpubDBrgjcxBxnXyL575sHdkpKohWu5qHKoQ7TJXKNrYznh5fVEGBv89hA8ENW7A8MFVpFUSvgLqc4Nj1WZcpePX6rrxviVtPowvMuGF5rdT2Vi/2";
        let key = parse(desc, ParseCtx::Top).unwrap();
        assert!(!key.is_range());
        assert_eq!(key.to_public_string(), desc);

        let desc = "[abcdef00/0'/1']tpubDBrgjcxBxnXyL575sHdkpKohWu5qHKoQ7TJXKNrYznh5fVEGBv89hA8ENW7A8MFVpFUSvgLqc4Nj1WZcpePX6rrxviVtPowvMuGF5rdT2Vi/*";
        let key = parse(desc, ParseCtx::Top).unwrap();
        assert!(key.is_range());

        let desc = "[abcdef00/0'/1']tpubDBrgjcxBxnXyL575sHdkpKohWu5qHKoQ7TJXKNrYznh5fVEGBv89hA8ENW7A8MFVpFUSvgLqc4Nj1WZcpePX6rrxviVtPowvMuGF5rdT2Vi/*h";
        let key = parse(desc, ParseCtx::Top).unwrap();
        assert!(key.is_range());
        // *h and *' are the same wildcard; printing settles on *'.
        assert!(key.to_public_string().ends_with("/*'"));
    }

    #[test]
    fn xprv_parsing_populates_provider() {
        let mut out = FlatSigningProvider::new();
        let desc = "tprv8ZgxMBicQKsPcwcD4gSnMti126ZiETsuX7qwrtMypr6FBwAP65puFn4v6c3jrN9VwtMRMph6nyT63NrfUL4C3nBzPcduzVSuHD7zbX2JKVc/0'/1'/2";
        let key = parse_pubkey(0, desc, ParseCtx::Top, &mut out).unwrap();
        assert_eq!(out.keys.len(), 1);

        // Hardened steps derive through the stored private key.
        let (pubkey, origin) = key.get_pubkey(0, &out, None, None).unwrap();
        assert!(pubkey.compressed);
        assert_eq!(origin.fingerprint.to_string(), "2cbe2a6d");
        assert_eq!(origin.path, DerivationPath::from_str("m/0'/1'/2").unwrap());

        // The private string round-trips to the xprv form.
        let priv_str = key.to_private_string(&out).unwrap();
        assert!(priv_str.starts_with("tprv8ZgxMBicQKsPcwcD4gSnMti126Zi"));

        // Normalized form collapses the hardened prefix into the origin.
        let norm = key.to_normalized_string(&out, None).unwrap();
        assert_eq!(
            norm,
            "[2cbe2a6d/0'/1']tpubDBrgjcxBxnXyL575sHdkpKohWu5qHKoQ7TJXKNrYznh5fVEGBv89hA8ENW7A8MFVpFUSvgLqc4Nj1WZcpePX6rrxviVtPowvMuGF5rdT2Vi/2"
        );
    }

    #[test]
    fn unhardened_derivation_is_public() {
        let mut out = FlatSigningProvider::new();
        let desc = "tpubD6NzVbkrYhZ4WQdzxL7NmJN7b85ePo4p6RSj9QQHF7te2RR9iUeVSGgnGkoUsB9LBRosgvNbjRv9bcsJgzgBd7QKuxDm23ZewkTRzNSLEDr/0/1/*";
        let key = parse_pubkey(0, desc, ParseCtx::Top, &mut out).unwrap();
        assert!(out.keys.is_empty());

        let (pk_a, origin) = key.get_pubkey(7, &out, None, None).unwrap();
        assert_eq!(origin.path, DerivationPath::from_str("m/0/1/7").unwrap());
        let (pk_b, _) = key.get_pubkey(7, &out, None, None).unwrap();
        assert_eq!(pk_a, pk_b);

        // Caching round-trip: writing then reading the cache yields the
        // same key without access to the root xpub.
        let mut cache = DescriptorCache::new();
        let _ = key.get_pubkey(7, &out, None, Some(&mut cache)).unwrap();
        let (pk_c, _) = key.get_pubkey(7, &DummySigner, Some(&cache), None).unwrap();
        assert_eq!(pk_a, pk_c);
    }

    struct DummySigner;
    impl SigningProvider for DummySigner {}
}
