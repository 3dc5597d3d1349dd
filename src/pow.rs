//! Difficulty targets, block work and hashrate estimation

use num_bigint::BigUint;

use crate::types::BlueWork;

/// Expands compact difficulty bits into the full 256-bit target.
///
/// The format is `0xEEMMMMMM`: an exponent byte and a 23-bit mantissa with a
/// sign bit. Negative or zero mantissas produce a zero target.
pub fn compact_to_target(bits: u32) -> BigUint {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    let is_negative = bits & 0x0080_0000 != 0;
    if is_negative || mantissa == 0 {
        return BigUint::default();
    }
    let mantissa = BigUint::from(mantissa);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent) as usize)
    } else {
        mantissa << (8 * (exponent - 3) as usize)
    }
}

/// Compresses a target into compact bits, the inverse of [`compact_to_target`]
pub fn target_to_compact(target: &BigUint) -> u32 {
    let bytes = target.to_bytes_be();
    if *target == BigUint::default() {
        return 0;
    }
    let mut size = bytes.len() as u32;
    let mut mantissa: u32 = if size <= 3 {
        let mut value = 0u32;
        for byte in &bytes {
            value = (value << 8) | *byte as u32;
        }
        value << (8 * (3 - size))
    } else {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    };
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | mantissa
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`
pub fn calc_work(bits: u32) -> BlueWork {
    let target = compact_to_target(bits);
    if target == BigUint::default() {
        return BlueWork::default();
    }
    let numerator: BigUint = BigUint::from(1u8) << 256usize;
    numerator / (target + 1u8)
}

/// Estimates hashes per second over a window of `(timestamp_ms, blue_work)` samples.
///
/// Work is the blue-work gap between the earliest and latest samples divided by
/// the elapsed time. Returns zero when the window spans no time.
pub fn estimate_hashes_per_second(samples: &[(i64, BlueWork)]) -> u64 {
    let earliest = samples.iter().min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    let latest = samples.iter().max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    let (Some(earliest), Some(latest)) = (earliest, latest) else {
        return 0;
    };
    let elapsed_seconds = (latest.0 - earliest.0) / 1000;
    if elapsed_seconds <= 0 || latest.1 <= earliest.1 {
        return 0;
    }
    let work = &latest.1 - &earliest.1;
    let rate = work / BigUint::from(elapsed_seconds as u64);
    let digits = rate.to_u64_digits();
    match digits.len() {
        0 => 0,
        1 => digits[0],
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_round_trip() {
        for bits in [0x1d00ffffu32, 0x207fffff, 0x1e7fffff, 0x1b0404cb] {
            assert_eq!(target_to_compact(&compact_to_target(bits)), bits);
        }
    }

    #[test]
    fn test_negative_and_zero_mantissa_give_zero_target() {
        assert_eq!(compact_to_target(0x1d800000), BigUint::default());
        assert_eq!(compact_to_target(0x1d000000), BigUint::default());
        assert_eq!(calc_work(0x1d000000), BlueWork::default());
    }

    #[test]
    fn test_easiest_simnet_target_has_work_two() {
        // 0x7fffff << 232 is just below 2^255
        assert_eq!(calc_work(0x207fffff), BlueWork::from(2u8));
    }

    #[test]
    fn test_harder_target_has_more_work() {
        assert!(calc_work(0x1d00ffff) > calc_work(0x1e7fffff));
        assert!(calc_work(0x1e7fffff) > calc_work(0x207fffff));
    }

    #[test]
    fn test_estimate_hashes_per_second() {
        let samples = vec![
            (1_000i64, BlueWork::from(100u32)),
            (11_000, BlueWork::from(1_100u32)),
            (6_000, BlueWork::from(600u32)),
        ];
        assert_eq!(estimate_hashes_per_second(&samples), 100);
        assert_eq!(estimate_hashes_per_second(&samples[..1]), 0);
        assert_eq!(estimate_hashes_per_second(&[]), 0);
    }
}
