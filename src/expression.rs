// SPDX-License-Identifier: CC0-1.0

//! # Expression parsing utilities
//!
//! Two small parsing toolkits share this module.
//!
//! The *span* helpers ([`take_expr`], [`take_func`], [`take_const`])
//! consume pieces off the front of a `&str` and are what the
//! context-sensitive descriptor parser is written in terms of: descriptor
//! grammar cannot be captured by a plain function tree because `tr()` mixes
//! `{`/`}` grouping with commas and `mweb()` takes a bare trailing integer.
//!
//! The [`Tree`] parser handles the regular `name(arg,arg,...)` fragment
//! grammar and backs the miniscript bridge.

use core::str::FromStr;

use crate::{errstr, Error, MAX_RECURSION_DEPTH};

/// Extract the expression that `sp` begins with.
///
/// The extracted expression ends before the first comma or closing
/// bracket (`)` or `}`) that is not surrounded by brackets opened within
/// the expression itself. `sp` is advanced past the returned prefix.
pub fn take_expr<'a>(sp: &mut &'a str) -> &'a str {
    let mut level = 0usize;
    let mut end = sp.len();
    for (n, ch) in sp.char_indices() {
        match ch {
            '(' | '{' => level += 1,
            ')' | '}' if level > 0 => level -= 1,
            ')' | '}' | ',' if level == 0 => {
                end = n;
                break;
            }
            _ => {}
        }
    }
    let ret = &sp[..end];
    *sp = &sp[end..];
    ret
}

/// If the whole of `sp` is of the form `name(...)`, consume it and return
/// the contents of the parentheses. Otherwise leave `sp` alone.
pub fn take_func<'a>(name: &str, sp: &mut &'a str) -> Option<&'a str> {
    let inner = sp
        .strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')?;
    *sp = "";
    Some(inner)
}

/// If `sp` starts with `prefix`, advance past it and return true.
pub fn take_const(prefix: &str, sp: &mut &str) -> bool {
    match sp.strip_prefix(prefix) {
        Some(rest) => {
            *sp = rest;
            true
        }
        None => false,
    }
}

/// A token of the form `x(...)` or `x`.
#[derive(Debug, PartialEq, Eq)]
pub struct Tree<'a> {
    /// The name `x`
    pub name: &'a str,
    /// The comma-separated contents of the `(...)`, if any
    pub args: Vec<Tree<'a>>,
}

/// A trait for extracting a structure from a [`Tree`] representation.
pub trait FromTree: Sized {
    /// Extract a structure from Tree representation
    fn from_tree(top: &Tree) -> Result<Self, Error>;
}

enum Found {
    Nothing,
    LBracket(usize),
    Comma(usize),
    RBracket(usize),
}

fn next_expr(sl: &str) -> Found {
    for (n, ch) in sl.char_indices() {
        match ch {
            '(' => return Found::LBracket(n),
            ',' => return Found::Comma(n),
            ')' => return Found::RBracket(n),
            _ => {}
        }
    }
    Found::Nothing
}

impl<'a> Tree<'a> {
    /// Parse an expression off the front of `sl`, returning it and the
    /// remainder of the slice.
    pub fn from_slice(sl: &'a str) -> Result<(Tree<'a>, &'a str), Error> {
        Self::from_slice_depth(sl, 0)
    }

    fn from_slice_depth(mut sl: &'a str, depth: u32) -> Result<(Tree<'a>, &'a str), Error> {
        if depth >= MAX_RECURSION_DEPTH {
            return Err(Error::MaxRecursionDepthExceeded);
        }

        match next_expr(sl) {
            Found::Nothing => Ok((Tree { name: sl, args: vec![] }, "")),
            Found::Comma(n) | Found::RBracket(n) => {
                Ok((Tree { name: &sl[..n], args: vec![] }, &sl[n..]))
            }
            Found::LBracket(n) => {
                let mut ret = Tree { name: &sl[..n], args: vec![] };

                sl = &sl[n + 1..];
                loop {
                    let (arg, new_sl) = Tree::from_slice_depth(sl, depth + 1)?;
                    ret.args.push(arg);

                    if new_sl.is_empty() {
                        return Err(Error::Syntax("expected ')', found end of input".to_owned()));
                    }

                    sl = &new_sl[1..];
                    match new_sl.as_bytes()[0] {
                        b',' => {}
                        b')' => break,
                        _ => return Err(Error::Syntax("expected ')' or ','".to_owned())),
                    }
                }
                Ok((ret, sl))
            }
        }
    }

    /// Parse a whole string as an expression tree.
    #[allow(clippy::should_implement_trait)] // Cannot use std::str::FromStr because of lifetimes.
    pub fn from_str(s: &'a str) -> Result<Tree<'a>, Error> {
        // Only ASCII is byte-indexable; everything else is outside the
        // descriptor alphabet anyway.
        for ch in s.bytes() {
            if !ch.is_ascii() {
                return Err(Error::InvalidChar(ch as char));
            }
        }

        let (top, rem) = Tree::from_slice(s)?;
        if rem.is_empty() {
            Ok(top)
        } else {
            Err(errstr(rem))
        }
    }
}

/// Parse a string as a u32, for derivation indices, timelocks or thresholds.
///
/// Rejects leading zeroes and signs.
pub fn parse_num(s: &str) -> Result<u32, Error> {
    if s.len() > 1 {
        let ch = s.chars().next().unwrap();
        if !('1'..='9').contains(&ch) {
            return Err(Error::Syntax(format!("number '{}' must start with a digit 1-9", s)));
        }
    }
    u32::from_str(s).map_err(|_| Error::Syntax(format!("'{}' is not a valid number", s)))
}

/// Attempts to parse a terminal expression
pub fn terminal<T, F, Err>(term: &Tree, convert: F) -> Result<T, Error>
where
    F: FnOnce(&str) -> Result<T, Err>,
    Err: ToString,
{
    if term.args.is_empty() {
        convert(term.name).map_err(|e| Error::Unexpected(e.to_string()))
    } else {
        Err(errstr(term.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_expr_nesting() {
        let mut sp = "multi(2,a,b),rest";
        assert_eq!(take_expr(&mut sp), "multi(2,a,b)");
        assert_eq!(sp, ",rest");

        let mut sp = "xpub/0/*)";
        assert_eq!(take_expr(&mut sp), "xpub/0/*");
        assert_eq!(sp, ")");

        let mut sp = "{pk(a),pk(b)}";
        assert_eq!(take_expr(&mut sp), "{pk(a),pk(b)}");
        assert_eq!(sp, "");
    }

    #[test]
    fn take_func_shape() {
        let mut sp = "pkh(abcd)";
        assert_eq!(take_func("pkh", &mut sp), Some("abcd"));
        assert_eq!(sp, "");

        let mut sp = "pkh(abcd)x";
        assert_eq!(take_func("pkh", &mut sp), None);
        assert_eq!(sp, "pkh(abcd)x");

        let mut sp = "sh(wsh(pk(a)))";
        assert_eq!(take_func("sh", &mut sp), Some("wsh(pk(a))"));

        let mut sp = "pkh(unclosed";
        assert_eq!(take_func("pkh", &mut sp), None);
    }

    #[test]
    fn tree_roundtrip() {
        let tree = Tree::from_str("and_v(v:pk(A),older(144))").unwrap();
        assert_eq!(tree.name, "and_v");
        assert_eq!(tree.args.len(), 2);
        assert_eq!(tree.args[0].name, "v:pk");
        assert_eq!(tree.args[1].name, "older");
        assert_eq!(tree.args[1].args[0].name, "144");
    }

    #[test]
    fn parse_num_rules() {
        assert!(parse_num("0").is_ok());
        assert!(parse_num("00").is_err());
        assert!(parse_num("06").is_err());
        assert!(parse_num("+6").is_err());
        assert!(parse_num("-6").is_err());
        assert_eq!(parse_num("1000").unwrap(), 1000);
    }
}
