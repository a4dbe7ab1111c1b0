//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use primitive_types::{U256, U512};
use utxod_consensus::constants::MEDIAN_TIME_SPAN;
use utxod_consensus::{ConsensusParams, Hash256};

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    ShortWindow { have: usize, need: usize },
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::ShortWindow { have, need } => {
                write!(f, "retarget needs {need} headers, got {have}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        if word != 0 {
            let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
            if overflow {
                return Err(CompactError::Overflow);
            }
        }
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn pow_limit(params: &ConsensusParams) -> U256 {
    U256::from_little_endian(&params.pow_limit)
}

pub fn pow_limit_bits(params: &ConsensusParams) -> u32 {
    u256_to_compact(pow_limit(params))
}

pub fn hash_to_u256(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash)
}

pub fn hash_meets_target(hash: &Hash256, target: &U256) -> bool {
    hash_to_u256(hash) <= *target
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    hash_to_u256(a).cmp(&hash_to_u256(b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    TargetOutOfRange,
    HashAboveTarget,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::TargetOutOfRange => write!(f, "target is zero or above the proof-of-work limit"),
            PowError::HashAboveTarget => write!(f, "hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits).map_err(PowError::Compact)?;
    if target.is_zero() || target > pow_limit(params) {
        return Err(PowError::TargetOutOfRange);
    }
    if !hash_meets_target(hash, &target) {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

/// Bits required for the block following `chain.last()`.
///
/// `chain` is a contiguous, height-ordered run of headers ending at the
/// parent. A retarget needs the last `pow_retarget_interval` headers; between
/// retargets the min-difficulty rule needs the run back to the last
/// retarget boundary or non-limit block.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let limit_bits = pow_limit_bits(params);
    let Some(last) = chain.last() else {
        return Ok(limit_bits);
    };
    ensure_contiguous(chain)?;

    let interval = params.pow_retarget_interval as i64;
    let next_height = last.height + 1;

    if next_height % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            if next_block_time > last.time + params.pow_target_spacing() * 2 {
                return Ok(limit_bits);
            }
            let found = chain
                .iter()
                .rev()
                .find(|header| header.height % interval == 0 || header.bits != limit_bits)
                .unwrap_or(&chain[0]);
            return Ok(found.bits);
        }
        return Ok(last.bits);
    }

    let need = interval as usize;
    if chain.len() < need {
        return Err(DifficultyError::ShortWindow {
            have: chain.len(),
            need,
        });
    }
    let first = &chain[chain.len() - need];
    Ok(calculate_next_work_required(last, first.time, params)?)
}

pub fn calculate_next_work_required(
    last: &HeaderInfo,
    first_time: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let timespan = params.pow_target_timespan;
    let actual = (last.time - first_time).clamp(timespan / 4, timespan * 4);

    let previous = U512::from(compact_to_u256(last.bits)?);
    let scaled = previous * U512::from(actual as u64) / U512::from(timespan as u64);
    let limit = pow_limit(params);
    let next = U256::try_from(scaled).unwrap_or(limit).min(limit);
    Ok(u256_to_compact(next))
}

/// Easiest target a block may have `time_delta` seconds after a block with
/// `base_bits`: the target can grow at most fourfold per retarget timespan.
pub fn compute_min_work(
    base_bits: u32,
    time_delta: i64,
    params: &ConsensusParams,
) -> Result<U256, CompactError> {
    let limit = pow_limit(params);
    if params.pow_allow_min_difficulty_blocks && time_delta > params.pow_target_spacing() * 2 {
        return Ok(limit);
    }
    let mut result = compact_to_u256(base_bits)?;
    let mut remaining = time_delta;
    while remaining > 0 && result < limit {
        result = result.saturating_mul(U256::from(4u64));
        remaining -= params.pow_target_timespan * 4;
    }
    Ok(result.min(limit))
}

/// Median of the last `MEDIAN_TIME_SPAN` timestamps (fewer near genesis).
pub fn median_time_past(times: &[i64]) -> Option<i64> {
    if times.is_empty() {
        return None;
    }
    let start = times.len().saturating_sub(MEDIAN_TIME_SPAN);
    let mut window = times[start..].to_vec();
    window.sort_unstable();
    Some(window[window.len() / 2])
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain.first().ok_or(DifficultyError::EmptyChain)?.height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::params::{chain_params, display_hash, Network};

    fn mainnet() -> ConsensusParams {
        chain_params(Network::Mainnet).consensus
    }

    fn run(start: i64, len: usize, spacing: i64, bits: u32) -> Vec<HeaderInfo> {
        (0..len)
            .map(|offset| HeaderInfo {
                height: start + offset as i64,
                time: 1_000_000 + offset as i64 * spacing,
                bits,
            })
            .collect()
    }

    #[test]
    fn compact_codec_known_values() {
        assert_eq!(u256_to_compact(compact_to_u256(0x1d00ffff).expect("bits")), 0x1d00ffff);
        assert_eq!(compact_to_u256(0x01003456).expect("bits"), U256::zero());
        assert_eq!(compact_to_u256(0x05009234).expect("bits"), U256::from(0x92340000u64));
        assert_eq!(compact_to_u256(0x04923456), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff123456), Err(CompactError::Overflow));
        assert_eq!(pow_limit_bits(&mainnet()), 0x1d00ffff);
    }

    #[test]
    fn genesis_proof_of_work() {
        let hash = display_hash("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f");
        assert_eq!(check_proof_of_work(&hash, 0x1d00ffff, &mainnet()), Ok(()));
        assert_eq!(
            check_proof_of_work(&hash, 0x1b0404cb, &mainnet()),
            Err(PowError::HashAboveTarget)
        );
        assert_eq!(
            check_proof_of_work(&hash, 0x1e00ffff, &mainnet()),
            Err(PowError::TargetOutOfRange)
        );
    }

    #[test]
    fn block_proof_of_minimum_difficulty() {
        assert_eq!(block_proof(0x1d00ffff).expect("proof"), U256::from(0x1_0001_0001u64));
    }

    #[test]
    fn keeps_bits_between_retargets() {
        let params = mainnet();
        let chain = run(10, 1, 600, 0x1c0ffff0);
        assert_eq!(get_next_work_required(&chain, 0, &params), Ok(0x1c0ffff0));
    }

    #[test]
    fn retarget_clamps_timespan() {
        let params = mainnet();
        let fast = run(0, 2016, 1, 0x1c0ffff0);
        let bits = get_next_work_required(&fast, 0, &params).expect("retarget");
        let expected = compact_to_u256(0x1c0ffff0).expect("bits") / U256::from(4u64);
        assert_eq!(bits, u256_to_compact(expected));

        let slow = run(0, 2016, 6000, 0x1c0ffff0);
        let bits = get_next_work_required(&slow, 0, &params).expect("retarget");
        let expected = compact_to_u256(0x1c0ffff0).expect("bits") * U256::from(4u64);
        assert_eq!(bits, u256_to_compact(expected));
    }

    #[test]
    fn retarget_never_exceeds_limit() {
        let params = mainnet();
        let slow = run(0, 2016, 6000, 0x1d00ffff);
        assert_eq!(get_next_work_required(&slow, 0, &params), Ok(0x1d00ffff));
    }

    #[test]
    fn retarget_requires_full_window() {
        let params = mainnet();
        let chain = run(1000, 1016, 600, 0x1d00ffff);
        assert_eq!(
            get_next_work_required(&chain, 0, &params),
            Err(DifficultyError::ShortWindow { have: 1016, need: 2016 })
        );
    }

    #[test]
    fn testnet_min_difficulty_rules() {
        let params = chain_params(Network::Testnet).consensus;
        let mut chain = run(2016, 5, 600, 0x1c0ffff0);
        for header in chain.iter_mut().skip(2) {
            header.bits = 0x1d00ffff;
        }
        let last_time = chain[4].time;
        // slow block may use the limit
        assert_eq!(get_next_work_required(&chain, last_time + 1201, &params), Ok(0x1d00ffff));
        // otherwise walk back past min-difficulty blocks
        assert_eq!(get_next_work_required(&chain, last_time + 600, &params), Ok(0x1c0ffff0));
    }

    #[test]
    fn min_work_grows_fourfold_per_timespan() {
        let params = mainnet();
        let base = compact_to_u256(0x1b0404cb).expect("bits");
        assert_eq!(compute_min_work(0x1b0404cb, 0, &params), Ok(base));
        assert_eq!(compute_min_work(0x1b0404cb, 1, &params), Ok(base * U256::from(4u64)));
        let span = params.pow_target_timespan * 4;
        assert_eq!(
            compute_min_work(0x1b0404cb, span + 1, &params),
            Ok(base * U256::from(16u64))
        );
        assert_eq!(compute_min_work(0x1b0404cb, span * 100, &params), Ok(pow_limit(&params)));
    }

    #[test]
    fn median_of_last_eleven() {
        assert_eq!(median_time_past(&[]), None);
        assert_eq!(median_time_past(&[5, 1, 3]), Some(3));
        let times: Vec<i64> = (0..20).collect();
        assert_eq!(median_time_past(&times), Some(14));
    }
}
