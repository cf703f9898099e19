// Copyright (C) 2024, 2025 NimPool Developers (see AUTHORS)
//
// This file is part of NimPool
//
// NimPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// NimPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// NimPool. If not, see <https://www.gnu.org/licenses/>.

//! Conversions between difficulty, full targets and the compact `n_bits`
//! encoding.

use super::Hash;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use rust_decimal::Decimal;
use std::sync::LazyLock;

/// Easiest possible target, difficulty 1.
pub static BLOCK_TARGET_MAX: LazyLock<BigUint> = LazyLock::new(|| BigUint::one() << 240u32);

/// Decimal places difficulties are rounded to.
pub const DIFFICULTY_SCALE: u32 = 8;

/// `BLOCK_TARGET_MAX / difficulty`. Non-positive difficulties map to the
/// maximum target.
pub fn difficulty_to_target(difficulty: Decimal) -> BigUint {
    if difficulty <= Decimal::ZERO {
        return BLOCK_TARGET_MAX.clone();
    }
    let mantissa = BigUint::from(difficulty.mantissa().unsigned_abs());
    if mantissa.is_zero() {
        return BLOCK_TARGET_MAX.clone();
    }
    let scale = BigUint::from(10u32).pow(difficulty.scale());
    let target = &*BLOCK_TARGET_MAX * scale / mantissa;
    if target.is_zero() {
        BigUint::one()
    } else {
        target
    }
}

/// Inverse of [`difficulty_to_target`], rounded down to
/// [`DIFFICULTY_SCALE`] places.
pub fn target_to_difficulty(target: &BigUint) -> Decimal {
    if target.is_zero() {
        return Decimal::MAX;
    }
    let scaled = &*BLOCK_TARGET_MAX * BigUint::from(10u64.pow(DIFFICULTY_SCALE)) / target;
    scaled
        .to_i128()
        .and_then(|v| Decimal::try_from_i128_with_scale(v, DIFFICULTY_SCALE).ok())
        .unwrap_or(Decimal::MAX)
}

/// Compact form: one size byte followed by the three most significant
/// bytes. A zero byte is prepended when the top byte has its high bit set.
pub fn target_to_compact(target: &BigUint) -> u32 {
    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u32;
    if bytes[0] >= 0x80 {
        size += 1;
    }
    let mantissa = if size >= 3 {
        target >> ((size - 3) * 8)
    } else {
        target << ((3 - size) * 8)
    };
    let mantissa = (mantissa & BigUint::from(0xff_ffffu32)).to_u32().unwrap_or(0);
    (size << 24) | mantissa
}

pub fn compact_to_target(compact: u32) -> BigUint {
    let size = compact >> 24;
    let mantissa = BigUint::from(compact & 0xff_ffff);
    if size >= 3 {
        mantissa << ((size - 3) * 8)
    } else {
        mantissa >> ((3 - size) * 8)
    }
}

/// Whether a pow hash read big endian is at or below `target`.
pub fn is_proof_of_work(pow: &Hash, target: &BigUint) -> bool {
    BigUint::from_bytes_be(pow.as_bytes()) <= *target
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_difficulty_one_is_max_target() {
        assert_eq!(difficulty_to_target(dec!(1)), *BLOCK_TARGET_MAX);
        assert_eq!(difficulty_to_target(dec!(0)), *BLOCK_TARGET_MAX);
    }

    #[test]
    fn test_difficulty_scales_target_down() {
        assert_eq!(difficulty_to_target(dec!(2)), &*BLOCK_TARGET_MAX >> 1u32);
        assert_eq!(difficulty_to_target(dec!(0.5)), &*BLOCK_TARGET_MAX << 1u32);
        assert_eq!(target_to_difficulty(&difficulty_to_target(dec!(4))), dec!(4));
    }

    #[test]
    fn test_compact_of_max_target() {
        // 2^240 is 31 bytes with a leading 0x01
        assert_eq!(target_to_compact(&BLOCK_TARGET_MAX), 0x1f01_0000);
        assert_eq!(compact_to_target(0x1f01_0000), *BLOCK_TARGET_MAX);
    }

    #[test]
    fn test_compact_prepends_zero_for_high_bit() {
        let target = BigUint::from(0x80u32) << 16u32;
        assert_eq!(target_to_compact(&target), 0x0400_8000);
        assert_eq!(compact_to_target(0x0400_8000), target);
    }

    #[test]
    fn test_compact_of_small_target() {
        assert_eq!(target_to_compact(&BigUint::from(0x12u32)), 0x0112_0000);
        assert_eq!(compact_to_target(0x0112_0000), BigUint::from(0x12u32));
    }

    #[test]
    fn test_proof_of_work_compares_big_endian() {
        let target = BigUint::from(1u32) << 200u32;
        let mut below = [0u8; 32];
        below[7] = 0xff;
        let mut above = [0u8; 32];
        above[0] = 1;
        assert!(is_proof_of_work(&Hash(below), &target));
        assert!(!is_proof_of_work(&Hash(above), &target));
    }
}
