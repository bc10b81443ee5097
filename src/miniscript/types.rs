// SPDX-License-Identifier: CC0-1.0

//! Miniscript type system
//!
//! Each fragment carries a correctness type (can the expression go where it
//! is placed, and does composition produce a well-formed script?) and
//! malleability properties (can a third party turn one witness into
//! another?). A fragment whose type cannot be computed is *invalid*; a
//! valid fragment may still be rejected later by the sanity analysis.

use crate::miniscript::limits::{LOCKTIME_THRESHOLD, SEQUENCE_LOCKTIME_TYPE_FLAG};

/// Basic type: where the fragment can be placed.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Base {
    /// Pushes a nonzero value on satisfaction, zero on (non-aborting)
    /// dissatisfaction.
    B,
    /// Pushes a public key; must be wrapped in `c:` to become useful.
    K,
    /// Aborts on dissatisfaction and pushes nothing on satisfaction.
    V,
    /// Like `B` but consumes its inputs from below one other element.
    W,
}

/// Input-consumption behaviour of a fragment.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Input {
    /// Consumes no stack elements.
    Zero,
    /// Consumes exactly one stack element.
    One,
    /// Consumes any number of stack elements.
    Any,
    /// Consumes exactly one stack element which must be nonzero when
    /// satisfying.
    OneNonZero,
    /// Consumes one or more stack elements, the top one nonzero when
    /// satisfying.
    AnyNonZero,
}

/// Whether the fragment has a dissatisfaction, and if so whether it is
/// unique and always available.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Dissat {
    /// No dissatisfactions; aborts on non-satisfying input.
    None,
    /// A unique dissatisfaction, always available.
    Unique,
    /// Nothing may be assumed about dissatisfying this fragment.
    Unknown,
}

/// The full type of a fragment: correctness and malleability folded into
/// one record.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Type {
    /// The base type.
    pub base: Base,
    /// Input consumption properties.
    pub input: Input,
    /// Whether dissatisfaction is definitely possible.
    pub dissatisfiable: bool,
    /// Whether the satisfaction output is always exactly 1.
    pub unit: bool,
    /// Dissatisfaction properties relevant to malleability.
    pub dissat: Dissat,
    /// Whether satisfactions cannot be created without a signature.
    pub safe: bool,
    /// Whether a non-malleable satisfaction is guaranteed to exist.
    pub non_malleable: bool,
}

impl Type {
    /// Type of the `1` fragment.
    pub fn true_() -> Type {
        Type {
            base: Base::B,
            input: Input::Zero,
            dissatisfiable: false,
            unit: true,
            dissat: Dissat::None,
            safe: false,
            non_malleable: true,
        }
    }

    /// Type of the `0` fragment.
    pub fn false_() -> Type {
        Type {
            base: Base::B,
            input: Input::Zero,
            dissatisfiable: true,
            unit: true,
            dissat: Dissat::Unique,
            safe: true,
            non_malleable: true,
        }
    }

    /// Type of the `pk_k` fragment.
    pub fn pk_k() -> Type {
        Type {
            base: Base::K,
            input: Input::OneNonZero,
            dissatisfiable: true,
            unit: true,
            dissat: Dissat::Unique,
            safe: true,
            non_malleable: true,
        }
    }

    /// Type of the `pk_h` fragment.
    pub fn pk_h() -> Type {
        Type { input: Input::AnyNonZero, ..Type::pk_k() }
    }

    /// Type of the `multi` fragment.
    pub fn multi() -> Type {
        Type { base: Base::B, ..Type::pk_h() }
    }

    /// Type of the hash-preimage fragments.
    pub fn hash() -> Type {
        Type {
            base: Base::B,
            input: Input::OneNonZero,
            dissatisfiable: true,
            unit: true,
            dissat: Dissat::Unknown,
            safe: false,
            non_malleable: true,
        }
    }

    /// Type of the `older`/`after` fragments.
    pub fn time() -> Type {
        Type {
            base: Base::B,
            input: Input::Zero,
            dissatisfiable: false,
            unit: false,
            dissat: Dissat::None,
            safe: false,
            non_malleable: true,
        }
    }

    /// `a:` wrapper.
    pub fn cast_alt(self) -> Option<Type> {
        if self.base != Base::B {
            return None;
        }
        Some(Type { base: Base::W, input: Input::Any, ..self })
    }

    /// `s:` wrapper.
    pub fn cast_swap(self) -> Option<Type> {
        if self.base != Base::B || !matches!(self.input, Input::One | Input::OneNonZero) {
            return None;
        }
        Some(Type { base: Base::W, input: Input::Any, ..self })
    }

    /// `c:` wrapper.
    pub fn cast_check(self) -> Option<Type> {
        if self.base != Base::K {
            return None;
        }
        Some(Type { base: Base::B, unit: true, ..self })
    }

    /// `d:` wrapper.
    pub fn cast_dupif(self) -> Option<Type> {
        if self.base != Base::V || self.input != Input::Zero {
            return None;
        }
        Some(Type {
            base: Base::B,
            input: Input::OneNonZero,
            dissatisfiable: true,
            unit: false,
            dissat: if self.dissat == Dissat::None { Dissat::Unique } else { Dissat::Unknown },
            ..self
        })
    }

    /// `v:` wrapper.
    pub fn cast_verify(self) -> Option<Type> {
        if self.base != Base::B {
            return None;
        }
        Some(Type {
            base: Base::V,
            dissatisfiable: false,
            unit: false,
            dissat: Dissat::None,
            ..self
        })
    }

    /// `j:` wrapper.
    pub fn cast_nonzero(self) -> Option<Type> {
        if self.base != Base::B
            || !matches!(self.input, Input::OneNonZero | Input::AnyNonZero)
        {
            return None;
        }
        Some(Type {
            dissatisfiable: true,
            dissat: if self.dissat == Dissat::None { Dissat::Unique } else { Dissat::Unknown },
            ..self
        })
    }

    /// `n:` wrapper.
    pub fn cast_zeronotequal(self) -> Option<Type> {
        if self.base != Base::B {
            return None;
        }
        Some(Type { unit: true, ..self })
    }

    /// The `and_b` combinator.
    pub fn and_b(l: Type, r: Type) -> Option<Type> {
        if l.base != Base::B || r.base != Base::W {
            return None;
        }
        Some(Type {
            base: Base::B,
            input: combine_inputs(l.input, r.input),
            dissatisfiable: l.dissatisfiable && r.dissatisfiable,
            unit: true,
            dissat: match (l.dissat, r.dissat) {
                (Dissat::None, Dissat::None) => Dissat::None,
                (Dissat::None, _) if l.safe => Dissat::None,
                (_, Dissat::None) if r.safe => Dissat::None,
                (Dissat::Unique, Dissat::Unique) if l.safe && r.safe => Dissat::Unique,
                _ => Dissat::Unknown,
            },
            safe: l.safe || r.safe,
            non_malleable: l.non_malleable && r.non_malleable,
        })
    }

    /// The `and_v` combinator.
    pub fn and_v(l: Type, r: Type) -> Option<Type> {
        let base = match (l.base, r.base) {
            (Base::V, Base::B) => Base::B,
            (Base::V, Base::K) => Base::K,
            (Base::V, Base::V) => Base::V,
            _ => return None,
        };
        Some(Type {
            base,
            input: combine_inputs(l.input, r.input),
            dissatisfiable: false,
            unit: r.unit,
            dissat: match (l.safe, r.dissat) {
                (_, Dissat::None) => Dissat::None,
                (true, _) => Dissat::None,
                _ => Dissat::Unknown,
            },
            safe: l.safe || r.safe,
            non_malleable: l.non_malleable && r.non_malleable,
        })
    }

    /// The `or_b` combinator.
    pub fn or_b(l: Type, r: Type) -> Option<Type> {
        if l.base != Base::B || r.base != Base::W || !l.dissatisfiable || !r.dissatisfiable {
            return None;
        }
        Some(Type {
            base: Base::B,
            input: or_inputs(l.input, r.input),
            dissatisfiable: true,
            unit: true,
            dissat: Dissat::Unique,
            safe: l.safe && r.safe,
            non_malleable: l.non_malleable
                && l.dissat == Dissat::Unique
                && r.non_malleable
                && r.dissat == Dissat::Unique
                && (l.safe || r.safe),
        })
    }

    /// The `or_d` combinator.
    pub fn or_d(l: Type, r: Type) -> Option<Type> {
        if l.base != Base::B || r.base != Base::B || !l.dissatisfiable || !l.unit {
            return None;
        }
        Some(Type {
            base: Base::B,
            input: or_inputs(l.input, r.input),
            dissatisfiable: r.dissatisfiable,
            unit: r.unit,
            dissat: r.dissat,
            safe: l.safe && r.safe,
            non_malleable: l.non_malleable
                && l.dissat == Dissat::Unique
                && r.non_malleable
                && (l.safe || r.safe),
        })
    }

    /// The `or_c` combinator.
    pub fn or_c(l: Type, r: Type) -> Option<Type> {
        if l.base != Base::B || r.base != Base::V || !l.dissatisfiable || !l.unit {
            return None;
        }
        Some(Type {
            base: Base::V,
            input: or_inputs(l.input, r.input),
            dissatisfiable: false,
            unit: false,
            dissat: Dissat::None,
            safe: l.safe && r.safe,
            non_malleable: l.non_malleable
                && l.dissat == Dissat::Unique
                && r.non_malleable
                && (l.safe || r.safe),
        })
    }

    /// The `or_i` combinator.
    pub fn or_i(l: Type, r: Type) -> Option<Type> {
        let base = match (l.base, r.base) {
            (Base::B, Base::B) => Base::B,
            (Base::V, Base::V) => Base::V,
            (Base::K, Base::K) => Base::K,
            _ => return None,
        };
        Some(Type {
            base,
            input: if l.input == Input::Zero && r.input == Input::Zero {
                Input::One
            } else {
                Input::Any
            },
            dissatisfiable: l.dissatisfiable || r.dissatisfiable,
            unit: l.unit && r.unit,
            dissat: match (l.dissat, r.dissat) {
                (Dissat::None, Dissat::None) => Dissat::None,
                (Dissat::Unique, Dissat::None) | (Dissat::None, Dissat::Unique) => Dissat::Unique,
                _ => Dissat::Unknown,
            },
            safe: l.safe && r.safe,
            non_malleable: l.non_malleable && r.non_malleable && (l.safe || r.safe),
        })
    }

    /// The `andor` combinator.
    pub fn and_or(a: Type, b: Type, c: Type) -> Option<Type> {
        if !a.dissatisfiable || !a.unit {
            return None;
        }
        let base = match (a.base, b.base, c.base) {
            (Base::B, Base::B, Base::B) => Base::B,
            (Base::B, Base::K, Base::K) => Base::K,
            (Base::B, Base::V, Base::V) => Base::V,
            _ => return None,
        };
        Some(Type {
            base,
            input: match (a.input, b.input, c.input) {
                (Input::Zero, Input::Zero, Input::Zero) => Input::Zero,
                _ => Input::Any,
            },
            dissatisfiable: c.dissatisfiable,
            unit: b.unit && c.unit,
            dissat: match (a.safe, b.dissat, c.dissat) {
                (_, Dissat::None, Dissat::Unique) => Dissat::Unique,
                (true, _, Dissat::Unique) => Dissat::Unique,
                (_, Dissat::None, Dissat::None) => Dissat::None,
                (true, _, Dissat::None) => Dissat::None,
                _ => Dissat::Unknown,
            },
            safe: (a.safe || b.safe) && c.safe,
            non_malleable: a.non_malleable
                && c.non_malleable
                && a.dissat == Dissat::Unique
                && b.non_malleable
                && (a.safe || b.safe || c.safe),
        })
    }

    /// The `thresh` combinator.
    pub fn threshold(k: usize, subs: &[Type]) -> Option<Type> {
        if k == 0 || k > subs.len() {
            return None;
        }
        let mut num_args = 0usize;
        let mut safe_count = 0usize;
        let mut all_dissat_unique = true;
        let mut all_non_malleable = true;
        for (i, sub) in subs.iter().enumerate() {
            let expected = if i == 0 { Base::B } else { Base::W };
            if sub.base != expected || !sub.unit || !sub.dissatisfiable {
                return None;
            }
            num_args += match sub.input {
                Input::Zero => 0,
                Input::One | Input::OneNonZero => 1,
                Input::Any | Input::AnyNonZero => 2,
            };
            safe_count += sub.safe as usize;
            all_dissat_unique &= sub.dissat == Dissat::Unique;
            all_non_malleable &= sub.non_malleable;
        }
        let n = subs.len();
        Some(Type {
            base: Base::B,
            input: match num_args {
                0 => Input::Zero,
                1 => Input::One,
                _ => Input::Any,
            },
            dissatisfiable: true,
            unit: true,
            dissat: if all_dissat_unique && (k == 1 || safe_count == n) {
                Dissat::Unique
            } else {
                Dissat::Unknown
            },
            safe: safe_count > n - k,
            non_malleable: all_non_malleable
                && safe_count >= n - k
                && (k == n || all_dissat_unique),
        })
    }
}

fn combine_inputs(l: Input, r: Input) -> Input {
    match (l, r) {
        (Input::Zero, Input::Zero) => Input::Zero,
        (Input::Zero, Input::One) | (Input::One, Input::Zero) => Input::One,
        (Input::Zero, Input::OneNonZero) | (Input::OneNonZero, Input::Zero) => Input::OneNonZero,
        (Input::OneNonZero, _) | (Input::AnyNonZero, _) | (Input::Zero, Input::AnyNonZero) => {
            Input::AnyNonZero
        }
        _ => Input::Any,
    }
}

fn or_inputs(l: Input, r: Input) -> Input {
    match (l, r) {
        (Input::Zero, Input::Zero) => Input::Zero,
        (Input::One, Input::Zero) | (Input::OneNonZero, Input::Zero) => Input::One,
        _ => Input::Any,
    }
}

/// Which flavours of timelock a subtree contains, and whether any spend
/// path would require satisfying a height-based and a time-based lock
/// simultaneously (which no transaction can do).
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct TimelockInfo {
    /// A relative height-based lock is present.
    pub csv_with_height: bool,
    /// A relative time-based lock is present.
    pub csv_with_time: bool,
    /// An absolute height-based lock is present.
    pub cltv_with_height: bool,
    /// An absolute time-based lock is present.
    pub cltv_with_time: bool,
    /// Some spend path mixes height-based and time-based locks.
    pub contains_combination: bool,
}

impl TimelockInfo {
    /// Info for an `older(n)` fragment.
    pub fn from_older(n: u32) -> TimelockInfo {
        TimelockInfo {
            csv_with_height: (n & SEQUENCE_LOCKTIME_TYPE_FLAG) == 0,
            csv_with_time: (n & SEQUENCE_LOCKTIME_TYPE_FLAG) != 0,
            ..Default::default()
        }
    }

    /// Info for an `after(n)` fragment.
    pub fn from_after(n: u32) -> TimelockInfo {
        TimelockInfo {
            cltv_with_height: n < LOCKTIME_THRESHOLD,
            cltv_with_time: n >= LOCKTIME_THRESHOLD,
            ..Default::default()
        }
    }

    /// Combine two subtrees which must both be satisfied.
    pub fn combine_and(a: TimelockInfo, b: TimelockInfo) -> TimelockInfo {
        Self::combine_threshold(2, [a, b])
    }

    /// Combine two subtrees of which either may be satisfied.
    pub fn combine_or(a: TimelockInfo, b: TimelockInfo) -> TimelockInfo {
        Self::combine_threshold(1, [a, b])
    }

    /// Combine subtrees under a `k`-of-n threshold. With `k > 1` two
    /// subtrees may need satisfying together, so cross-flavour locks
    /// become a forbidden combination.
    pub fn combine_threshold<I>(k: usize, subs: I) -> TimelockInfo
    where
        I: IntoIterator<Item = TimelockInfo>,
    {
        let mut acc = TimelockInfo::default();
        for info in subs {
            if k > 1 {
                acc.contains_combination |= (acc.csv_with_height && info.csv_with_time)
                    || (acc.csv_with_time && info.csv_with_height)
                    || (acc.cltv_with_height && info.cltv_with_time)
                    || (acc.cltv_with_time && info.cltv_with_height);
            }
            acc.csv_with_height |= info.csv_with_height;
            acc.csv_with_time |= info.csv_with_time;
            acc.cltv_with_height |= info.cltv_with_height;
            acc.cltv_with_time |= info.cltv_with_time;
            acc.contains_combination |= info.contains_combination;
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_casts() {
        // c: only applies to K.
        assert!(Type::pk_k().cast_check().is_some());
        assert!(Type::true_().cast_check().is_none());

        // s: needs exactly one input.
        let b = Type::pk_k().cast_check().unwrap();
        assert!(b.cast_swap().is_some());
        assert!(Type::true_().cast_swap().is_none());

        // d: needs V with zero inputs.
        let v = Type::time().cast_verify();
        // time() is B with zero input, verify gives V.
        assert!(v.unwrap().cast_dupif().is_some());
    }

    #[test]
    fn timelock_mixing() {
        let older_height = TimelockInfo::from_older(144);
        let older_time = TimelockInfo::from_older(144 | SEQUENCE_LOCKTIME_TYPE_FLAG);
        let after_height = TimelockInfo::from_after(100_000);
        let after_time = TimelockInfo::from_after(1_600_000_000);

        assert!(TimelockInfo::combine_and(older_height, older_time).contains_combination);
        assert!(TimelockInfo::combine_and(after_height, after_time).contains_combination);
        assert!(!TimelockInfo::combine_or(older_height, older_time).contains_combination);
        assert!(!TimelockInfo::combine_and(older_height, after_time).contains_combination);

        // Mixes survive nesting.
        let inner = TimelockInfo::combine_and(older_height, older_time);
        assert!(TimelockInfo::combine_or(inner, TimelockInfo::default()).contains_combination);
    }
}
