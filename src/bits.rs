//! Word-level rank/select primitives for the block occupancy bitvector.

/// Extension trait for the bit operations the occupancy encoding is built on.
pub(crate) trait BitExt {
    /// Position of the `rank`-th (0-indexed) set bit, or 64 when fewer than
    /// `rank + 1` bits are set.
    fn select(self, rank: u32) -> u32;
}

impl BitExt for u64 {
    #[inline]
    fn select(self, rank: u32) -> u32 {
        if rank >= u64::BITS {
            return u64::BITS;
        }
        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("bmi2") {
                // SAFETY: bmi2 presence was just checked
                return unsafe { select_bmi2(self, rank) };
            }
        }
        select_portable(self, rank)
    }
}

/// Depositing the single bit `1 << rank` into the word's set positions lands
/// it exactly on the `rank`-th one; trailing zeros recover its index. An
/// exhausted deposit leaves 0, whose trailing-zero count is the 64 sentinel.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "bmi2")]
#[inline]
unsafe fn select_bmi2(word: u64, rank: u32) -> u32 {
    std::arch::x86_64::_pdep_u64(1 << rank, word).trailing_zeros()
}

#[inline]
fn select_portable(mut word: u64, rank: u32) -> u32 {
    for _ in 0..rank {
        word &= word.wrapping_sub(1);
    }
    word.trailing_zeros()
}

/// `select` over the full 128-bit metadata word: low half first, with the
/// leftover rank carried into the high half. Sentinel is 128.
#[inline]
pub(crate) fn select_128(word: u128, rank: u32) -> u32 {
    let low = word as u64;
    let low_ones = low.count_ones();
    if rank < low_ones {
        low.select(rank)
    } else {
        u64::BITS + ((word >> 64) as u64).select(rank - low_ones)
    }
}

/// Inserts a zero at `index`: bits below stay put, bits at or above shift up
/// one, and the top bit falls off so the width stays at 128. This is how a
/// run gains a slot without disturbing the terminators below it.
#[inline]
pub(crate) fn md_insert_zero(md: u128, index: u32) -> u128 {
    let keep = (1u128 << index) - 1;
    (md & keep) | ((md & !keep) << 1)
}

/// Inverse of [`md_insert_zero`]: drops the bit at `index`, shifts everything
/// above it down one, and tops the word up with a one at bit 127.
#[inline]
pub(crate) fn md_remove_zero(md: u128, index: u32) -> u128 {
    let keep = (1u128 << index) - 1;
    (md & keep) | ((md >> 1) & !keep) | (1 << 127)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_u64_basics() {
        assert_eq!(u64::MAX.select(0), 0);
        assert_eq!(u64::MAX.select(63), 63);
        assert_eq!(0b1010_1010u64.select(0), 1);
        assert_eq!(0b1010_1010u64.select(3), 7);
        assert_eq!((1u64 << 63).select(0), 63);
        // sentinel when the rank overshoots the ones present
        assert_eq!(0u64.select(0), 64);
        assert_eq!(1u64.select(1), 64);
        assert_eq!(u64::MAX.select(64), 64);
    }

    #[test]
    fn select_portable_agrees() {
        let words = [
            0u64,
            1,
            u64::MAX,
            0xdead_beef_cafe_f00d,
            1 << 63,
            0x5555_5555_5555_5555,
            0x8000_0000_0000_0001,
        ];
        for &word in &words {
            for rank in 0..=64 {
                assert_eq!(word.select(rank), select_portable(word, rank), "{word:#x} {rank}");
            }
        }
    }

    #[test]
    fn select_128_crosses_the_seam() {
        for rank in 0..128 {
            assert_eq!(select_128(u128::MAX, rank), rank);
        }
        let sparse = 0b1001u128 | (1u128 << 64) | (1u128 << 127);
        assert_eq!(select_128(sparse, 0), 0);
        assert_eq!(select_128(sparse, 1), 3);
        assert_eq!(select_128(sparse, 2), 64);
        assert_eq!(select_128(sparse, 3), 127);
        assert_eq!(select_128(sparse, 4), 128);
    }

    #[test]
    fn insert_zero_shifts_the_upper_bits() {
        let md = md_insert_zero(u128::MAX, 0);
        assert_eq!(md, u128::MAX << 1);
        let md = md_insert_zero(md, 2);
        assert_eq!(md & 0b111, 0b010);
        assert_eq!(md.count_ones(), 126);
    }

    #[test]
    fn remove_zero_tops_up_with_a_one() {
        let md = md_insert_zero(u128::MAX, 127);
        assert_eq!(md.count_ones(), 127);
        assert_eq!(md_remove_zero(md, 127), u128::MAX);
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let mut md = u128::MAX;
        for index in [10, 5, 90, 64, 63, 0] {
            md = md_insert_zero(md, index);
        }
        assert_eq!(md.count_ones(), 122);
        for index in [0, 63, 64, 90, 5, 10] {
            md = md_remove_zero(md, index);
        }
        assert_eq!(md, u128::MAX);
    }
}
