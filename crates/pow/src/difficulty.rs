//! Difficulty and compact target utilities.

use coind_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// The slice of a block header that retargeting looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if size > 34 {
            if word != 0 {
                return Err(CompactError::Overflow);
            }
            return Ok(U256::zero());
        }
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        if (bits & 0x0080_0000) != 0 {
            return Err(CompactError::Negative);
        }
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32 = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(u256_to_hash(value))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

pub fn u256_to_hash(value: U256) -> Hash256 {
    value.to_little_endian()
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`.
/// Invalid or zero targets contribute no work.
pub fn block_proof(bits: u32) -> U256 {
    let target = match compact_to_u256(bits) {
        Ok(target) if !target.is_zero() => target,
        _ => return U256::zero(),
    };
    // 2^256 does not fit, but (~target / (target + 1)) + 1 equals it.
    (!target / (target + U256::one())) + U256::one()
}

/// Seconds of block production at `tip_bits` difficulty that separate
/// chain work `from` from chain work `to`. Negative when `to` has less work.
pub fn block_proof_equivalent_time(to: U256, from: U256, tip_bits: u32, spacing: i64) -> i64 {
    let (diff, sign) = if to > from {
        (to - from, 1)
    } else {
        (from - to, -1)
    };
    let proof = block_proof(tip_bits);
    if proof.is_zero() {
        return 0;
    }
    let seconds = diff.saturating_mul(U256::from(spacing.max(0) as u64)) / proof;
    if seconds.bits() > 63 {
        return sign * i64::MAX;
    }
    sign * seconds.low_u64() as i64
}

/// Compact bits required for the block after `last`.
///
/// `ancestor(h)` must return the ancestor of `last` at height `h`.
pub fn get_next_work_required<F>(
    last: Option<&HeaderInfo>,
    next_block_time: i64,
    ancestor: F,
    params: &ConsensusParams,
) -> u32
where
    F: Fn(i64) -> Option<HeaderInfo>,
{
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let Some(last) = last else {
        return pow_limit_bits;
    };
    let interval = params.difficulty_adjustment_interval();

    if (last.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            // A block arriving more than twice the spacing late may use minimum difficulty.
            if next_block_time > last.time + params.pow_target_spacing * 2 {
                return pow_limit_bits;
            }
            // Otherwise return the last non-minimum difficulty.
            let mut cursor = *last;
            while cursor.height > 0
                && cursor.height % interval != 0
                && cursor.bits == pow_limit_bits
            {
                match ancestor(cursor.height - 1) {
                    Some(prev) => cursor = prev,
                    None => break,
                }
            }
            return cursor.bits;
        }
        return last.bits;
    }

    let first_height = last.height - (interval - 1);
    let first_time = ancestor(first_height.max(0))
        .map(|first| first.time)
        .unwrap_or(last.time);
    calculate_next_work_required(last, first_time, params)
}

pub fn calculate_next_work_required(
    last: &HeaderInfo,
    first_block_time: i64,
    params: &ConsensusParams,
) -> u32 {
    if params.pow_no_retargeting {
        return last.bits;
    }

    let timespan = params.pow_target_timespan;
    let actual = (last.time - first_block_time).clamp(timespan / 4, timespan * 4);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let current = compact_to_u256(last.bits).unwrap_or(pow_limit);
    let (scaled, overflow) = current.overflowing_mul(U256::from(actual as u64));
    let mut next = if overflow {
        pow_limit
    } else {
        scaled / U256::from(timespan as u64)
    };
    if next > pow_limit {
        next = pow_limit;
    }
    u256_to_compact(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_consensus::params::{consensus_params, Network};

    fn header(height: i64, time: i64, bits: u32) -> HeaderInfo {
        HeaderInfo { height, time, bits }
    }

    #[test]
    fn proof_equivalent_time_counts_blocks_of_work() {
        let bits = 0x1d00_ffff;
        let proof = block_proof(bits);
        let ten_blocks = proof * U256::from(10u64);
        assert_eq!(block_proof_equivalent_time(ten_blocks, U256::zero(), bits, 600), 6000);
        assert_eq!(block_proof_equivalent_time(U256::zero(), ten_blocks, bits, 600), -6000);
        assert_eq!(block_proof_equivalent_time(proof, proof, bits, 600), 0);
    }

    #[test]
    fn retarget_vectors() {
        let params = consensus_params(Network::Mainnet);

        let last = header(32_255, 1_262_152_739, 0x1d00ffff);
        assert_eq!(
            calculate_next_work_required(&last, 1_261_130_161, &params),
            0x1d00d86a
        );

        let last = header(2_015, 1_233_061_996, 0x1d00ffff);
        assert_eq!(
            calculate_next_work_required(&last, 1_231_006_505, &params),
            0x1d00ffff
        );

        let last = header(68_543, 1_279_297_671, 0x1c05a3f4);
        assert_eq!(
            calculate_next_work_required(&last, 1_279_008_237, &params),
            0x1c0168fd
        );

        let last = header(46_367, 1_269_211_443, 0x1c387f6f);
        assert_eq!(
            calculate_next_work_required(&last, 1_263_163_443, &params),
            0x1d00e1fd
        );
    }

    #[test]
    fn no_retarget_between_boundaries() {
        let params = consensus_params(Network::Mainnet);
        let last = header(100, 1_300_000_000, 0x1c05a3f4);
        let bits = get_next_work_required(Some(&last), 1_300_000_600, |_| None, &params);
        assert_eq!(bits, 0x1c05a3f4);
    }

    #[test]
    fn testnet_min_difficulty_after_long_gap() {
        let params = consensus_params(Network::Testnet);
        let limit = target_to_compact(&params.pow_limit);
        let normal = 0x1c05a3f4;
        let history = [
            header(2_016, 1_000, normal),
            header(2_017, 1_600, limit),
            header(2_018, 2_200, limit),
        ];
        let last = history[2];
        let lookup = |height: i64| history.iter().copied().find(|h| h.height == height);

        let late = get_next_work_required(Some(&last), last.time + 1_201, lookup, &params);
        assert_eq!(late, limit);

        let on_time = get_next_work_required(Some(&last), last.time + 600, lookup, &params);
        assert_eq!(on_time, normal);
    }

    #[test]
    fn block_proof_of_easiest_target() {
        assert_eq!(block_proof(0x207fffff), U256::from(2u64));
        assert_eq!(block_proof(0x1d00ffff), U256::from(0x1_0001_0001u64));
        assert!(block_proof(0).is_zero());
        assert!(block_proof(0x04923456).is_zero());
    }

    #[test]
    fn compact_sign_and_overflow() {
        assert_eq!(compact_to_u256(0x01fedcba), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff123456), Err(CompactError::Overflow));
        assert_eq!(compact_to_u256(0x00123456).expect("zero"), U256::zero());
        assert_eq!(u256_to_compact(U256::from(0x80u64)), 0x02008000);
    }
}
