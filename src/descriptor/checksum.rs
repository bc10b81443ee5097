// SPDX-License-Identifier: CC0-1.0

//! Descriptor checksum
//!
//! The 8-character checksum protecting descriptor strings. Every group of 3
//! payload characters is expanded into 4 GF(32) symbols over which a cyclic
//! code is defined; the code guarantees detection of up to 4 symbol errors
//! in descriptors of up to 507 characters, and any single symbol error at
//! any length up to 49154 characters.

use core::fmt;

use crate::Error;

/// Character set of descriptor payloads, ordered so that the most common
/// unprotected characters (hex, keypaths) land in the first group of 32 and
/// case errors cause an offset that is a multiple of 32.
pub const INPUT_CHARSET: &str =
    "0123456789()[],'/*abcdefgh@:$%{}IJKLMNOPQRSTUVWXYZ&+-.;<=>?!^_|~ijklmnopqrstuvwxyzABCDEFGH`#\"\\ ";

/// Character set of the checksum suffix itself; same as bech32.
pub const CHECKSUM_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const CHECKSUM_LENGTH: usize = 8;

/// Interprets `c` as 8 groups of 5 bits which are the coefficients of a
/// degree-8 polynomial over GF(32), multiplies the polynomial by x, computes
/// the remainder modulo the generator
/// G(x) = x^8 + {30}x^7 + {23}x^6 + {15}x^5 + {14}x^4 + {10}x^3 + {6}x^2 + {12}x + {9},
/// and adds the constant term `val`.
fn poly_mod(c: u64, val: u64) -> u64 {
    let c0 = c >> 35;
    let mut c = ((c & 0x7ffffffff) << 5) ^ val;
    if c0 & 1 != 0 {
        c ^= 0xf5dee51989;
    }
    if c0 & 2 != 0 {
        c ^= 0xa9fdca3312;
    }
    if c0 & 4 != 0 {
        c ^= 0x1bab10e32d;
    }
    if c0 & 8 != 0 {
        c ^= 0x3706b1677a;
    }
    if c0 & 16 != 0 {
        c ^= 0x644d626ffd;
    }
    c
}

/// Compute the checksum of a descriptor body.
///
/// Does not check that the body is a syntactically valid descriptor, only
/// that its characters are drawn from the descriptor alphabet.
pub fn desc_checksum(desc: &str) -> Result<String, Error> {
    let mut eng = Engine::new();
    eng.input(desc)?;
    Ok(eng.checksum())
}

/// Helper for `FromStr` on descriptor types: if a `#`-suffix is present it
/// must verify; returns the descriptor body without the suffix.
pub fn verify_checksum(s: &str) -> Result<&str, Error> {
    let (body, _) = strip_checksum(s, false)?;
    Ok(body)
}

/// Validate the optional checksum suffix of `s`, requiring its presence if
/// `require` is set. Returns the body and the computed checksum.
pub(crate) fn strip_checksum(s: &str, require: bool) -> Result<(&str, String), Error> {
    let mut parts = s.splitn(3, '#');
    let body = parts.next().unwrap();
    let suffix = parts.next();
    if parts.next().is_some() {
        return Err(Error::BadChecksum("multiple '#' symbols".to_owned()));
    }
    if suffix.is_none() && require {
        return Err(Error::MissingChecksum);
    }
    if let Some(suffix) = suffix {
        if suffix.len() != CHECKSUM_LENGTH {
            return Err(Error::BadChecksum(format!(
                "expected 8 character checksum, not {} characters",
                suffix.len()
            )));
        }
    }
    let computed = desc_checksum(body)?;
    if let Some(suffix) = suffix {
        if suffix != computed {
            return Err(Error::ChecksumMismatch { provided: suffix.to_owned(), computed });
        }
    }
    Ok((body, computed))
}

/// An engine to compute a checksum from a string.
pub struct Engine {
    c: u64,
    cls: u64,
    clscount: u64,
}

impl Default for Engine {
    fn default() -> Engine { Engine::new() }
}

impl Engine {
    /// Construct an engine with no input.
    pub fn new() -> Self { Engine { c: 1, cls: 0, clscount: 0 } }

    /// Input some data into the checksum engine.
    ///
    /// If this function returns an error the engine is left in an
    /// indeterminate state; further input will not produce a meaningful
    /// checksum.
    pub fn input(&mut self, s: &str) -> Result<(), Error> {
        for ch in s.chars() {
            let pos = INPUT_CHARSET.find(ch).ok_or(Error::InvalidChar(ch))? as u64;
            // Emit a symbol for the position within the group, for every character.
            self.c = poly_mod(self.c, pos & 31);
            // Accumulate the group numbers, emitting one extra symbol per 3 characters.
            self.cls = self.cls * 3 + (pos >> 5);
            self.clscount += 1;
            if self.clscount == 3 {
                self.c = poly_mod(self.c, self.cls);
                self.cls = 0;
                self.clscount = 0;
            }
        }
        Ok(())
    }

    /// Obtain the checksum characters of all the data fed to the engine.
    pub fn checksum_chars(&mut self) -> [char; CHECKSUM_LENGTH] {
        if self.clscount > 0 {
            self.c = poly_mod(self.c, self.cls);
        }
        // Shift further to determine the checksum.
        for _ in 0..CHECKSUM_LENGTH {
            self.c = poly_mod(self.c, 0);
        }
        // Prevent appending zeroes from not affecting the checksum.
        self.c ^= 1;

        let mut chars = ['\0'; CHECKSUM_LENGTH];
        for (j, ch) in chars.iter_mut().enumerate() {
            let idx = (self.c >> (5 * (CHECKSUM_LENGTH - 1 - j))) & 31;
            *ch = CHECKSUM_CHARSET.as_bytes()[idx as usize] as char;
        }
        chars
    }

    /// Obtain the checksum as a string.
    pub fn checksum(&mut self) -> String { self.checksum_chars().iter().collect() }
}

/// A wrapper around a `fmt::Formatter` which feeds everything written
/// through a checksum engine, so a descriptor `Display` impl can append its
/// own checksum.
pub struct Formatter<'f, 'a> {
    fmt: &'f mut fmt::Formatter<'a>,
    eng: Engine,
}

impl<'f, 'a> Formatter<'f, 'a> {
    /// Construct a new `Formatter`, wrapping a given `fmt::Formatter`.
    pub fn new(f: &'f mut fmt::Formatter<'a>) -> Self { Formatter { fmt: f, eng: Engine::new() } }

    /// Write the `#`-prefixed checksum into the underlying formatter.
    pub fn write_checksum(&mut self) -> fmt::Result {
        use fmt::Write;
        self.fmt.write_char('#')?;
        for ch in self.eng.checksum_chars().iter().copied() {
            self.fmt.write_char(ch)?;
        }
        Ok(())
    }

    /// Write the checksum unless "alternate" display is on.
    pub fn write_checksum_if_not_alt(&mut self) -> fmt::Result {
        if !self.fmt.alternate() {
            self.write_checksum()?;
        }
        Ok(())
    }
}

impl<'f, 'a> fmt::Write for Formatter<'f, 'a> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.fmt.write_str(s)?;
        self.eng.input(s).map_err(|_| fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! check_expected {
        ($desc: expr, $checksum: expr) => {
            assert_eq!(desc_checksum($desc).unwrap(), $checksum);
        };
    }

    #[test]
    fn valid_descriptor_checksum() {
        check_expected!(
            "wpkh(tprv8ZgxMBicQKsPdpkqS7Eair4YxjcuuvDPNYmKX3sCniCf16tHEVrjjiSXEkFRnUH77yXc6ZcwHHcLNfjdi5qUvw3VDfgYiH5mNsj5izuiu2N/1/2/*)",
            "tqz0nc62"
        );
        check_expected!(
            "pkh(tpubD6NzVbkrYhZ4XHndKkuB8FifXm8r5FQHwrN6oZuWCz13qb93rtgKvD4PQsqC4HP4yhV3tA2fqr2RbY5mNXfM7RxXUoeABoDtsFUq2zJq6YK/44'/1'/0'/0/*)",
            "lasegmfs"
        );
        check_expected!(
            "sh(multi(2,[00000000/111'/222]xprvA1RpRA33e1JQ7ifknakTFpgNXPmW2YvmhqLQYMmrj4xJXXWYpDPS3xz7iAxn8L39njGVyuoseXzU6rcxFLJ8HFsTjSyQbLYnMpCqE2VbFWc,xprv9uPDJpEQgRQfDcW7BkF7eTya6RPxXeJCqCJGHuCJ4GiRVLzkTXBAJMu2qaMWPrS7AANYqdq6vcBcBUdJCVVFceUvJFjaPdGZ2y9WACViL4L/0))",
            "ggrsrxfy"
        );
        check_expected!(
            "sh(multi(2,[00000000/111'/222]xpub6ERApfZwUNrhLCkDtcHTcxd75RbzS1ed54G1LkBUHQVHQKqhMkhgbmJbZRkrgZw4koxb5JaHWkY4ALHY2grBGRjaDMzQLcgJvLJuZZvRcEL,xpub68NZiKmJWnxxS6aaHmn81bvJeTESw724CRDs6HbuccFQN9Ku14VQrADWgqbhhTHBaohPX4CjNLf9fq9MYo6oDaPPLPxSb7gwQN3ih19Zm4Y/0))",
            "tjg09x5t"
        );
        check_expected!("raw(deadbeef)", "89f8spxm");
    }

    #[test]
    fn invalid_character() {
        assert_eq!(desc_checksum("raw(Ü)"), Err(Error::InvalidChar('Ü')));
    }

    #[test]
    fn checksum_verification() {
        // Valid checksum and no checksum both verify.
        assert!(verify_checksum("raw(deadbeef)#89f8spxm").is_ok());
        assert!(verify_checksum("raw(deadbeef)").is_ok());

        for tc in &[
            "raw(deadbeef)#",          // Missing checksum.
            "raw(deadbeef)#89f8spxmx", // Too long checksum.
            "raw(deadbeef)#89f8spx",   // Too short checksum.
            "raw(dedbeef)#89f8spxm",   // Error in payload.
            "raw(deadbeef)##9f8spxm",  // Error in checksum.
        ] {
            assert!(verify_checksum(tc).is_err(), "false positive: {}", tc);
        }

        // A required checksum must be present.
        assert_eq!(strip_checksum("raw(deadbeef)", true), Err(Error::MissingChecksum));
    }

    #[test]
    fn single_symbol_errors_detected() {
        let body = "pkh([d34db33f/44'/0'/0']xpub6ERApfZwUNrhLCkDtcHTcxd75RbzS1ed54G1LkBUHQVHQKqhMkhgbmJbZRkrgZw4koxb5JaHWkY4ALHY2grBGRjaDMzQLcgJvLJuZZvRcEL/1/*)";
        let sum = desc_checksum(body).unwrap();
        let full = format!("{}#{}", body, sum);

        // Substitute every payload character for another in the alphabet and
        // confirm the checksum never verifies.
        for (i, orig) in full.char_indices() {
            if orig == '#' {
                continue;
            }
            for repl in INPUT_CHARSET.chars().take(40) {
                if repl == orig || repl == '#' {
                    continue;
                }
                let mut mutated = String::with_capacity(full.len());
                mutated.push_str(&full[..i]);
                mutated.push(repl);
                mutated.push_str(&full[i + orig.len_utf8()..]);
                assert!(
                    verify_checksum(&mutated).is_err(),
                    "undetected mutation at {} ('{}' -> '{}')",
                    i,
                    orig,
                    repl
                );
            }
        }
    }

    #[test]
    fn engine_incremental_matches_oneshot() {
        let body = "wsh(sortedmulti(2,03a0434d9e47f3c86235477c7b1ae6ae5d3442d49b1943c2b752a68e2a47e247c7,036d2b085e9e382ed10b69fc311a03f8641ccfff21574de0927513a49d9a688a00))";
        let mut eng = Engine::new();
        for chunk in body.as_bytes().chunks(7) {
            eng.input(core::str::from_utf8(chunk).unwrap()).unwrap();
        }
        assert_eq!(eng.checksum(), desc_checksum(body).unwrap());
    }
}
