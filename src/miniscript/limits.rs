// SPDX-License-Identifier: CC0-1.0

//! Consensus and standardness limits relevant to descriptor validation.

/// Maximum pushable element size, which also bounds P2SH redeem scripts.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Maximum number of non-push opcodes per script.
pub const MAX_OPS_PER_SCRIPT: usize = 201;
/// Maximum number of keys in a CHECKMULTISIG.
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
/// Maximum number of keys in a tapscript CHECKSIGADD chain.
pub const MAX_PUBKEYS_PER_MULTI_A: usize = 999;
/// Maximum number of keys in bare (top-level) multisig outputs.
pub const MAX_PUBKEYS_PER_BARE_MULTISIG: usize = 3;
/// Maximum size of a standard P2WSH witness script.
pub const MAX_STANDARD_P2WSH_SCRIPT_SIZE: usize = 3600;
/// Absolute locktimes below this threshold are block heights; at or above
/// it they are UNIX timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Bit of a relative locktime selecting time-based (512s units) locks.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
