//! Proof-of-work target expansion and chain work accounting

use crate::error::{ChainError, Result};

/// Compact target: 0x1d00ffff where
/// - 0x1d is the exponent (29)
/// - 0x00ffff is the mantissa (65535)
///
/// The target is: mantissa × 2^(8 × (exponent - 3))
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub exponent: u32,
    pub mantissa: u32,
}

/// ExpandTarget: ℕ₃₂ → CompactTarget
///
/// Rejects the sign bit, a zero mantissa and targets wider than 256 bits.
pub fn expand_target(bits: u32) -> Result<CompactTarget> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 {
        return Err(ChainError::BlockValidation(format!(
            "negative target in bits {:#010x}",
            bits
        )));
    }
    if mantissa == 0 {
        return Err(ChainError::BlockValidation(format!(
            "zero target in bits {:#010x}",
            bits
        )));
    }
    if exponent > 34 || (exponent > 33 && mantissa > 0xff) || (exponent > 32 && mantissa > 0xffff) {
        return Err(ChainError::BlockValidation(format!(
            "target overflow in bits {:#010x}",
            bits
        )));
    }

    Ok(CompactTarget { exponent, mantissa })
}

/// BlockProof: ℕ₃₂ → ℕ
///
/// Expected number of hashes to find a block at target T:
/// work = 2²⁵⁶ / (T + 1) ≈ 2^(256 - 8·(e - 3)) / mantissa
///
/// Targets so small that the work exceeds 128 bits saturate at `u128::MAX`.
pub fn block_proof(bits: u32) -> Result<u128> {
    let target = expand_target(bits)?;
    let mantissa = target.mantissa as u128;

    if target.exponent <= 3 {
        // Tiny target: the whole mantissa shifts out below 2^24.
        return Ok(u128::MAX);
    }

    let shift = 8 * (target.exponent - 3);
    if shift >= 256 {
        return Ok(1);
    }
    let work_shift = 256 - shift;
    if work_shift >= 128 {
        return Ok(u128::MAX);
    }
    Ok(((1u128 << work_shift) / mantissa).max(1))
}
