//! Fixed-geometry storage block: a 128-bit occupancy word plus the 48 tags
//! it describes, packed into one cache line.

use crate::bits::select_128;

/// Tag slots per block.
pub(crate) const SLOTS_PER_BLOCK: usize = 48;
/// Buckets sharing one block; each owns a contiguous run of the tag array.
pub(crate) const BUCKETS_PER_BLOCK: u64 = 80;
/// Occupancy bitvector width, one bit per bucket terminator or stored tag.
pub(crate) const METADATA_BITS: u32 = BUCKETS_PER_BLOCK as u32 + SLOTS_PER_BLOCK as u32;

/// Runs are kept in bucket order in `tags`; `md` starts all-ones (every run
/// empty) and always satisfies `count_ones() == 128 - used_slots`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(64))]
pub(crate) struct Block {
    pub(crate) md: u128,
    pub(crate) tags: [u8; SLOTS_PER_BLOCK],
}

const _: () = assert!(std::mem::size_of::<Block>() == 64);
const _: () = assert!(METADATA_BITS == u128::BITS);

impl Block {
    pub(crate) const EMPTY: Block = Block {
        md: u128::MAX,
        tags: [0; SLOTS_PER_BLOCK],
    };

    /// Raw popcount of the metadata: 128 for an empty block, down to 80 when
    /// all 48 slots are used. The two-choice policy compares blocks in this
    /// unit, so it is deliberately not normalized.
    #[inline]
    pub(crate) fn free_space(&self) -> u32 {
        self.md.count_ones()
    }

    /// Number of occupied tag slots.
    #[inline]
    pub(crate) fn used_slots(&self) -> u32 {
        METADATA_BITS - self.md.count_ones()
    }

    /// Slot range `[start, end)` of the run belonging to the bucket at
    /// `offset` within this block. Bucket 0 starts at slot 0 rather than
    /// after a preceding terminator.
    #[inline]
    pub(crate) fn run_bounds(&self, offset: u32) -> (u32, u32) {
        let start = if offset == 0 {
            0
        } else {
            select_128(self.md, offset - 1) - (offset - 1)
        };
        let end = select_128(self.md, offset) - offset;
        (start, end)
    }

    /// Bitmask of the slots inside bucket `offset`'s run holding exactly
    /// `tag`. The equality mask covers the whole block in one pass and is
    /// only then narrowed to the run.
    #[inline]
    pub(crate) fn tag_hits(&self, offset: u32, tag: u8) -> u64 {
        let matches = tag_match_mask(&self.tags, tag);
        if matches == 0 {
            return 0;
        }
        let (start, end) = self.run_bounds(offset);
        matches & ((1u64 << end) - (1u64 << start))
    }

    /// Writes `tag` at `slot`, sliding that slot and everything above it up
    /// one position. The incoming tag is staged in the top slot and the
    /// table row pulls it into place.
    #[inline]
    pub(crate) fn push_tag(&mut self, slot: usize, tag: u8) {
        let mut staged = self.tags;
        staged[SLOTS_PER_BLOCK - 1] = tag;
        self.tags = permute(&staged, &SHIFT_UP[slot]);
    }

    /// Deletes the tag at `slot`, sliding everything above it down one and
    /// zeroing the vacated top slot.
    #[inline]
    pub(crate) fn pull_tag(&mut self, slot: usize) {
        self.tags = permute(&self.tags, &SHIFT_DOWN[slot]);
        self.tags[SLOTS_PER_BLOCK - 1] = 0;
    }
}

/// Destination-indexed source maps for the two tag movers, one row per slot.
const SHIFT_UP: [[u8; SLOTS_PER_BLOCK]; SLOTS_PER_BLOCK] = build_shift_up();
const SHIFT_DOWN: [[u8; SLOTS_PER_BLOCK]; SLOTS_PER_BLOCK] = build_shift_down();

const fn build_shift_up() -> [[u8; SLOTS_PER_BLOCK]; SLOTS_PER_BLOCK] {
    let mut table = [[0u8; SLOTS_PER_BLOCK]; SLOTS_PER_BLOCK];
    let mut slot = 0;
    while slot < SLOTS_PER_BLOCK {
        let mut dst = 0;
        while dst < SLOTS_PER_BLOCK {
            table[slot][dst] = if dst < slot {
                dst as u8
            } else if dst == slot {
                // the staged incoming tag
                (SLOTS_PER_BLOCK - 1) as u8
            } else {
                (dst - 1) as u8
            };
            dst += 1;
        }
        slot += 1;
    }
    table
}

const fn build_shift_down() -> [[u8; SLOTS_PER_BLOCK]; SLOTS_PER_BLOCK] {
    let mut table = [[0u8; SLOTS_PER_BLOCK]; SLOTS_PER_BLOCK];
    let mut slot = 0;
    while slot < SLOTS_PER_BLOCK {
        let mut dst = 0;
        while dst < SLOTS_PER_BLOCK {
            table[slot][dst] = if dst < slot || dst == SLOTS_PER_BLOCK - 1 {
                dst as u8
            } else {
                (dst + 1) as u8
            };
            dst += 1;
        }
        slot += 1;
    }
    table
}

#[inline]
fn permute(tags: &[u8; SLOTS_PER_BLOCK], map: &[u8; SLOTS_PER_BLOCK]) -> [u8; SLOTS_PER_BLOCK] {
    let mut out = [0u8; SLOTS_PER_BLOCK];
    for (dst, src) in out.iter_mut().zip(map) {
        *dst = tags[*src as usize];
    }
    out
}

/// Per-slot equality bitmask of `tag` against all 48 slots: bit `i` is set
/// iff `tags[i] == tag`. The SWAR fallback stays reachable on every target
/// so both implementations keep compiling.
#[inline]
#[allow(unreachable_code)]
fn tag_match_mask(tags: &[u8; SLOTS_PER_BLOCK], tag: u8) -> u64 {
    #[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
    return tag_match_mask_sse2(tags, tag);
    tag_match_mask_swar(tags, tag)
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
#[inline]
fn tag_match_mask_sse2(tags: &[u8; SLOTS_PER_BLOCK], tag: u8) -> u64 {
    use std::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8,
    };
    // SAFETY: sse2 is a compile-time target feature in this branch and the
    // three unaligned loads cover the 48-byte array exactly.
    unsafe {
        let needle = _mm_set1_epi8(tag as i8);
        let ptr = tags.as_ptr();
        let lane0 =
            _mm_movemask_epi8(_mm_cmpeq_epi8(_mm_loadu_si128(ptr.cast::<__m128i>()), needle));
        let lane1 = _mm_movemask_epi8(_mm_cmpeq_epi8(
            _mm_loadu_si128(ptr.add(16).cast::<__m128i>()),
            needle,
        ));
        let lane2 = _mm_movemask_epi8(_mm_cmpeq_epi8(
            _mm_loadu_si128(ptr.add(32).cast::<__m128i>()),
            needle,
        ));
        lane0 as u32 as u64 | (lane1 as u32 as u64) << 16 | (lane2 as u32 as u64) << 32
    }
}

/// Branch-free fallback: exact SWAR zero-byte detection on `word ^ needle`,
/// then the per-byte high flags gathered down to one bit per slot.
#[inline]
fn tag_match_mask_swar(tags: &[u8; SLOTS_PER_BLOCK], tag: u8) -> u64 {
    const LOW7: u64 = 0x7f7f_7f7f_7f7f_7f7f;
    const HIGH: u64 = 0x8080_8080_8080_8080;
    const GATHER: u64 = 0x0102_0408_1020_4080;
    let needle = u64::from_le_bytes([tag; 8]);
    let mut mask = 0u64;
    for (word_idx, chunk) in tags.chunks_exact(8).enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        let diff = u64::from_le_bytes(bytes) ^ needle;
        // bit 8i+7 of `zero` is set iff byte i of `diff` is 0; the masked
        // add cannot carry across bytes, so the flags are exact
        let zero = !(((diff & LOW7) + LOW7) | diff) & HIGH;
        mask |= ((zero >> 7).wrapping_mul(GATHER) >> 56) << (word_idx * 8);
    }
    mask
}
