//! Approximate Membership Query Filter ([AMQ-Filter](https://en.wikipedia.org/wiki/Approximate_Membership_Query_Filter))
//! based on the [Vector Quotient Filter (VQF)](https://dl.acm.org/doi/10.1145/3448016.3452841).
//!
//! The filter stores an 8-bit fingerprint ("tag") per item in one of two
//! candidate blocks, chosen by load at insert time. A block packs 48 tag
//! slots and a 128-bit rank/select bitvector mapping 80 buckets to contiguous
//! runs of tags into a single cache line, so every operation touches at most
//! two lines and never loops over a run. Like a bloom filter there are no
//! false negatives, but unlike one it also supports deletions and
//! [serde](https://crates.io/crates/serde) serialization.
//!
//! ### Example
//!
//! ```rust
//! let mut f = vqfilter::Filter::new(1000).unwrap();
//! for i in 0..800 {
//!     f.insert(i).unwrap();
//! }
//! for i in 0..800 {
//!     assert!(f.contains(i));
//! }
//! assert!(f.remove(0));
//! ```
//!
//! ### Hasher
//!
//! The hashing algorithm used is [xxhash3](https://crates.io/crates/xxhash-rust)
//! which offers both high performance and stability across platforms.
//!
//! ### Filter size and accuracy
//!
//! Storage is one 64-byte block per 48 slots (≈10.7 bits per slot) regardless
//! of load. With 8-bit tags and both candidate runs scanned, the error ratio
//! when full is about 0.5% (see [`Filter::max_error_ratio`]) and shrinks
//! proportionally at lighter loads.
//!
//! ### Capacity
//!
//! Capacity is fixed at construction, rounded up to whole blocks. Placement
//! is load-based, so inserts can start failing with
//! [`Error::CapacityExceeded`] slightly before every slot is used; plan for
//! at most ~90% load.
//!
//! ### Removal hazard
//!
//! Removing an item that was never inserted may delete a colliding member's
//! tag and silently make that member disappear. Only remove items known to
//! be present.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::{
    fmt,
    hash::{Hash, Hasher},
};

#[cfg(feature = "jsonschema")]
use schemars::JsonSchema;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use bits::{md_insert_zero, md_remove_zero, select_128};
use block::{Block, BUCKETS_PER_BLOCK, SLOTS_PER_BLOCK};
use stable_hasher::StableHasher;

mod bits;
mod block;
mod concurrent;
mod stable_hasher;

pub use concurrent::ConcurrentFilter;

/// Fingerprint width; a tag is the low byte of the reduced hash.
const TAG_BITS: u32 = 8;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
/// Odd multiplier decorrelating an item's alternate bucket from its primary.
const ALT_HASH_MUL: u64 = 0x5bd1_e995;
/// Raw free-space reading (metadata popcount) below which insert also weighs
/// the alternate block's load. Tuned value, kept as-is.
const ALT_CHECK_THRESHOLD: u32 = 92;

/// Approximate membership filter with two-choice block placement, supporting
/// insertion, lookup and removal of hashable items.
///
/// Items are stored as 8-bit tags inside per-bucket runs, located purely
/// through the block's occupancy bitvector. Distinct items can share a tag,
/// which is where false positives come from; a stored tag is never moved
/// between buckets, which is why false negatives cannot happen.
///
/// See the [crate docs](crate) for sizing and the removal contract.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "jsonschema", derive(JsonSchema))]
pub struct Filter {
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "b",
            serialize_with = "serialize_blocks",
            deserialize_with = "deserialize_blocks"
        )
    )]
    #[cfg_attr(feature = "jsonschema", schemars(with = "Vec<u8>"))]
    blocks: Box<[Block]>,
    #[cfg_attr(feature = "serde", serde(rename = "l"))]
    len: u64,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Both candidate blocks for the item are full
    CapacityExceeded,
    /// The requested capacity cannot be represented
    CapacityTooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

impl Filter {
    /// Creates a filter with room for `capacity` items, rounded up to whole
    /// 48-slot blocks (at least one).
    pub fn new(capacity: u64) -> Result<Self, Error> {
        let nblocks = capacity.div_ceil(SLOTS_PER_BLOCK as u64).max(1);
        // the addressable range, nblocks * 80 * 256, must stay in u64
        nblocks
            .checked_mul(BUCKETS_PER_BLOCK)
            .and_then(|buckets| buckets.checked_mul(1 << TAG_BITS))
            .ok_or(Error::CapacityTooLarge)?;
        let nblocks = usize::try_from(nblocks).map_err(|_| Error::CapacityTooLarge)?;
        nblocks
            .checked_mul(std::mem::size_of::<Block>())
            .filter(|bytes| *bytes <= isize::MAX as usize)
            .ok_or(Error::CapacityTooLarge)?;
        Ok(Self {
            blocks: vec![Block::EMPTY; nblocks].into_boxed_slice(),
            len: 0,
        })
    }

    /// Number of items currently stored (inserted minus removed).
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the filter stores nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total tag slots across all blocks.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.blocks.len() as u64 * SLOTS_PER_BLOCK as u64
    }

    /// Size of the hash domain candidate buckets are derived from.
    ///
    /// Callers feeding [`insert_hash`](Self::insert_hash) and friends should
    /// draw hashes uniform over `[0, range)`; wider values are folded in by
    /// a modulo reduction.
    #[inline]
    pub fn range(&self) -> u64 {
        self.total_buckets() << TAG_BITS
    }

    /// Resets the filter to its freshly constructed state.
    pub fn clear(&mut self) {
        self.blocks.fill(Block::EMPTY);
        self.len = 0;
    }

    /// Estimated false-positive probability with every slot in use.
    pub fn max_error_ratio(&self) -> f64 {
        // both candidate runs get scanned, 48/80 tags per bucket at capacity
        2.0 * (SLOTS_PER_BLOCK as f64 / BUCKETS_PER_BLOCK as f64) / (1u64 << TAG_BITS) as f64
    }

    /// Estimated false-positive probability at the current load.
    pub fn current_error_ratio(&self) -> f64 {
        let avg_run = self.len as f64 / self.total_buckets() as f64;
        2.0 * avg_run / (1u64 << TAG_BITS) as f64
    }

    /// Inserts `item`.
    ///
    /// Fails with [`Error::CapacityExceeded`] when both of the item's
    /// candidate blocks are full, leaving the filter untouched.
    pub fn insert<T: Hash>(&mut self, item: T) -> Result<(), Error> {
        self.insert_hash(self.hash(item))
    }

    /// Whether `item` is probably in the filter. False positives are
    /// possible; false negatives are not.
    pub fn contains<T: Hash>(&self, item: T) -> bool {
        self.contains_hash(self.hash(item))
    }

    /// Removes one copy of `item`, reporting whether a tag was deleted.
    ///
    /// Removing an item that is not a current member may delete a colliding
    /// member's tag instead, silently making that other item disappear.
    /// Only remove items known to be present.
    pub fn remove<T: Hash>(&mut self, item: T) -> bool {
        self.remove_hash(self.hash(item))
    }

    /// [`insert`](Self::insert) for an already-hashed item.
    pub fn insert_hash(&mut self, hash: u64) -> Result<(), Error> {
        let (bucket, tag, alt_bucket) = self.calc_candidates(hash);
        let mut target = bucket;
        let free = self.block_for(bucket).free_space();
        if free < ALT_CHECK_THRESHOLD {
            // near-full primary: place into whichever candidate is freer
            let alt_free = self.block_for(alt_bucket).free_space();
            if alt_free > free {
                target = alt_bucket;
            } else if free == BUCKETS_PER_BLOCK as u32 {
                return Err(Error::CapacityExceeded);
            }
        }
        let offset = (target % BUCKETS_PER_BLOCK) as u32;
        let block = &mut self.blocks[(target / BUCKETS_PER_BLOCK) as usize];
        let end_bit = select_128(block.md, offset);
        block.push_tag((end_bit - offset) as usize, tag);
        block.md = md_insert_zero(block.md, end_bit);
        self.len += 1;
        Ok(())
    }

    /// [`contains`](Self::contains) for an already-hashed item.
    pub fn contains_hash(&self, hash: u64) -> bool {
        let (bucket, tag, alt_bucket) = self.calc_candidates(hash);
        self.bucket_has_tag(bucket, tag) || self.bucket_has_tag(alt_bucket, tag)
    }

    /// [`remove`](Self::remove) for an already-hashed item, with the same
    /// non-member hazard.
    pub fn remove_hash(&mut self, hash: u64) -> bool {
        let (bucket, tag, alt_bucket) = self.calc_candidates(hash);
        self.remove_tag(bucket, tag) || self.remove_tag(alt_bucket, tag)
    }

    /// Splits a hash into `(primary bucket, tag, alternate bucket)`. Any
    /// `u64` is legal input; it is first folded into `[0, range)`.
    #[inline]
    fn calc_candidates(&self, hash: u64) -> (u64, u8, u64) {
        let range = self.range();
        let hash = hash % range;
        let tag = (hash & TAG_MASK) as u8;
        let bucket = hash >> TAG_BITS;
        let alt_bucket = ((hash ^ (u64::from(tag) * ALT_HASH_MUL)) % range) >> TAG_BITS;
        (bucket, tag, alt_bucket)
    }

    #[inline]
    fn hash<T: Hash>(&self, item: T) -> u64 {
        let mut hasher = StableHasher::default();
        item.hash(&mut hasher);
        hasher.finish()
    }

    #[inline]
    fn total_buckets(&self) -> u64 {
        self.blocks.len() as u64 * BUCKETS_PER_BLOCK
    }

    #[inline]
    fn block_for(&self, bucket: u64) -> &Block {
        &self.blocks[(bucket / BUCKETS_PER_BLOCK) as usize]
    }

    #[inline]
    fn bucket_has_tag(&self, bucket: u64, tag: u8) -> bool {
        self.block_for(bucket)
            .tag_hits((bucket % BUCKETS_PER_BLOCK) as u32, tag)
            != 0
    }

    fn remove_tag(&mut self, bucket: u64, tag: u8) -> bool {
        let offset = (bucket % BUCKETS_PER_BLOCK) as u32;
        let block = &mut self.blocks[(bucket / BUCKETS_PER_BLOCK) as usize];
        let hits = block.tag_hits(offset, tag);
        if hits == 0 {
            return false;
        }
        // lowest matching slot in the run
        let slot = hits.trailing_zeros();
        block.pull_tag(slot as usize);
        block.md = md_remove_zero(block.md, slot + offset);
        self.len -= 1;
        true
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

#[cfg(feature = "serde")]
const BLOCK_BYTES: usize = std::mem::size_of::<Block>();

#[cfg(feature = "serde")]
fn serialize_blocks<S: serde::Serializer>(blocks: &[Block], ser: S) -> Result<S::Ok, S::Error> {
    let mut bytes = Vec::with_capacity(blocks.len() * BLOCK_BYTES);
    for block in blocks {
        bytes.extend_from_slice(&block.md.to_le_bytes());
        bytes.extend_from_slice(&block.tags);
    }
    serde_bytes::serialize(&bytes, ser)
}

#[cfg(feature = "serde")]
fn deserialize_blocks<'de, D: serde::Deserializer<'de>>(de: D) -> Result<Box<[Block]>, D::Error> {
    use serde::de::Error as _;
    let bytes: serde_bytes::ByteBuf = serde_bytes::deserialize(de)?;
    if bytes.is_empty() || bytes.len() % BLOCK_BYTES != 0 {
        return Err(D::Error::invalid_length(
            bytes.len(),
            &"a non-zero whole number of 64-byte blocks",
        ));
    }
    let mut blocks = Vec::with_capacity(bytes.len() / BLOCK_BYTES);
    for (i, chunk) in bytes.chunks_exact(BLOCK_BYTES).enumerate() {
        let mut md = [0u8; 16];
        md.copy_from_slice(&chunk[..16]);
        let mut tags = [0u8; SLOTS_PER_BLOCK];
        tags.copy_from_slice(&chunk[16..]);
        let block = Block {
            md: u128::from_le_bytes(md),
            tags,
        };
        // reject metadata that would break the run encoding
        let terminators = BUCKETS_PER_BLOCK as u32;
        if block.free_space() < terminators
            || select_128(block.md, terminators - 1) != terminators - 1 + block.used_slots()
        {
            return Err(D::Error::custom(format_args!(
                "corrupt occupancy metadata in block {i}"
            )));
        }
        blocks.push(block);
    }
    Ok(blocks.into_boxed_slice())
}

#[cfg(any(fuzzing, test))]
impl Filter {
    /// `(primary bucket, tag, alternate bucket)` for `hash`. Lets the fuzz
    /// harness reason about which items can collide.
    #[doc(hidden)]
    pub fn candidates(&self, hash: u64) -> (u64, u8, u64) {
        self.calc_candidates(hash)
    }

    /// Asserts every structural invariant. Test and fuzzing support.
    #[doc(hidden)]
    pub fn validate(&self) {
        let terminators = BUCKETS_PER_BLOCK as u32;
        let mut used_total = 0u64;
        for (i, block) in self.blocks.iter().enumerate() {
            let used = block.used_slots();
            assert!(
                block.free_space() >= terminators,
                "block {i} lost a terminator"
            );
            assert_eq!(
                select_128(block.md, terminators - 1),
                terminators - 1 + used,
                "block {i} has bits above its last terminator"
            );
            for slot in used as usize..SLOTS_PER_BLOCK {
                assert_eq!(block.tags[slot], 0, "block {i} slot {slot} not scrubbed");
            }
            used_total += u64::from(used);
        }
        assert_eq!(used_total, self.len, "len out of sync with the blocks");
    }

    /// Dumps every block; only sensible for small filters.
    #[doc(hidden)]
    pub fn printout(&self) {
        for (i, block) in self.blocks.iter().enumerate() {
            eprintln!(
                "block {i}: used {:2} md {:0128b}",
                block.used_slots(),
                block.md
            );
            eprintln!("  tags {:?}", &block.tags[..]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_geometry() {
        let filter = Filter::new(0).unwrap();
        assert_eq!(filter.capacity(), 48);
        assert_eq!(filter.range(), 80 * 256);
        assert!(filter.is_empty());

        let filter = Filter::new(48).unwrap();
        assert_eq!(filter.capacity(), 48);

        let filter = Filter::new(1000).unwrap();
        assert_eq!(filter.capacity(), 21 * 48);
        assert_eq!(filter.range(), 21 * 80 * 256);

        assert!(matches!(Filter::new(u64::MAX), Err(Error::CapacityTooLarge)));
    }

    #[test]
    fn insert_then_find_at_high_load() {
        for capacity in [100u64, 1000, 10_000, 100_000] {
            let mut filter = Filter::new(capacity).unwrap();
            let n = filter.capacity() * 85 / 100;
            for i in 0..n {
                filter.insert((capacity, i)).unwrap();
            }
            assert_eq!(filter.len(), n);
            filter.validate();
            for i in 0..n {
                assert!(filter.contains((capacity, i)), "{capacity}/{i}");
            }
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut filter = Filter::new(50_000).unwrap();
        let n = filter.capacity() * 85 / 100;
        for i in 0..n {
            filter.insert(i).unwrap();
        }
        let sample = 200_000u64;
        let mut false_positives = 0u64;
        for i in 0..sample {
            false_positives += filter.contains(u64::MAX - i) as u64;
        }
        let rate = false_positives as f64 / sample as f64;
        dbg!(rate, filter.current_error_ratio());
        assert!(rate < 2.0 * filter.max_error_ratio(), "{rate}");
        assert!(rate > filter.max_error_ratio() / 10.0, "{rate}");
    }

    #[test]
    fn small_filter_fp_sample() {
        let mut filter = Filter::new(1024).unwrap();
        for i in 0..870u64 {
            filter.insert(i).unwrap();
        }
        for i in 0..870u64 {
            assert!(filter.contains(i));
        }
        let mut false_positives = 0u32;
        for i in 1_000_000..1_010_000u64 {
            false_positives += filter.contains(i) as u32;
        }
        assert!(false_positives < 100, "{false_positives}");
    }

    #[test]
    fn remove_makes_the_item_absent() {
        let mut filter = Filter::new(100).unwrap();
        filter.insert("solo").unwrap();
        assert!(filter.contains("solo"));
        assert!(filter.remove("solo"));
        // nothing else is resident, so no tag can collide
        assert!(!filter.contains("solo"));
        assert!(filter.is_empty());
        filter.validate();
    }

    #[test]
    fn interleaved_insert_remove_stays_exact() {
        let mut filter = Filter::new(1000).unwrap();
        let buckets = filter.range() >> TAG_BITS;
        // one tag in every third bucket keeps each block lightly loaded, so
        // placement always stays primary and removal always hits its own tag
        let hashes: Vec<u64> = (0..buckets / 3)
            .map(|i| (i * 3) << TAG_BITS | (i & 0xff))
            .collect();
        for &hash in &hashes {
            filter.insert_hash(hash).unwrap();
        }
        assert_eq!(filter.len(), hashes.len() as u64);
        filter.validate();

        for &hash in hashes.iter().step_by(2) {
            assert!(filter.remove_hash(hash));
        }
        filter.validate();
        for &hash in hashes.iter().skip(1).step_by(2) {
            assert!(filter.contains_hash(hash));
        }
        for &hash in hashes.iter().skip(1).step_by(2) {
            assert!(filter.remove_hash(hash));
        }
        assert!(filter.is_empty());
        filter.validate();
    }

    #[test]
    fn spills_into_the_alternate_block() {
        let mut filter = Filter::new(1000).unwrap();
        // distinct tags, all with their primary bucket in block 0; the block
        // passes the fullness threshold at 37 used slots and starts spilling
        for hash in 0..60u64 {
            filter.insert_hash(hash).unwrap();
        }
        assert_eq!(filter.len(), 60);
        filter.validate();
        for hash in 0..60u64 {
            assert!(filter.contains_hash(hash), "{hash}");
        }
        for hash in 0..60u64 {
            assert!(filter.remove_hash(hash), "{hash}");
        }
        assert!(filter.is_empty());
        filter.validate();
    }

    #[test]
    fn full_filter_rejects_without_damage() {
        let mut filter = Filter::new(1).unwrap();
        assert_eq!(filter.capacity(), 48);
        // a single block leaves nowhere to spill; distinct tags keep the
        // removals below exact
        for hash in 0..48u64 {
            filter.insert_hash(hash).unwrap();
        }
        assert_eq!(filter.len(), 48);
        assert!(matches!(
            filter.insert_hash(48),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(filter.len(), 48);
        filter.validate();
        for hash in 0..48u64 {
            assert!(filter.contains_hash(hash));
        }
        // tag 48 was rejected, so probing for it misses
        assert!(!filter.contains_hash(48 + 256));

        assert!(filter.remove_hash(47));
        assert_eq!(filter.len(), 47);
        filter.insert_hash(48).unwrap();
        filter.validate();
    }

    #[test]
    fn high_load_churn_drains_the_filter() {
        let mut filter = Filter::new(10_000).unwrap();
        let n = filter.capacity() * 85 / 100;
        for i in 0..n {
            filter.insert(i).unwrap();
        }
        // a removal may take a colliding member's tag instead, leaving that
        // member's own copy behind to fail its removal later; such pairs are
        // rare enough to bound
        let mut removed = 0u64;
        for i in 0..n {
            removed += filter.remove(i) as u64;
        }
        assert!(removed >= n - n / 50, "{removed} of {n}");
        assert_eq!(filter.len(), n - removed);
        filter.validate();
    }

    #[test]
    fn clear_resets_everything() {
        let mut filter = Filter::new(300).unwrap();
        for i in 0..200u64 {
            filter.insert(i).unwrap();
        }
        filter.clear();
        assert!(filter.is_empty());
        filter.validate();
        for i in 0..200u64 {
            assert!(!filter.contains(i));
        }
        for i in 0..200u64 {
            filter.insert(i).unwrap();
        }
        assert_eq!(filter.len(), 200);
    }

    #[test]
    fn hashes_fold_into_range() {
        let mut filter = Filter::new(100).unwrap();
        let range = filter.range();
        filter.insert_hash(range * 3 + 17).unwrap();
        assert!(filter.contains_hash(17));
        assert!(filter.contains_hash(range + 17));
        assert!(filter.remove_hash(range * 7 + 17));
        assert!(filter.is_empty());
    }

    #[test]
    fn error_ratio_estimates() {
        let mut filter = Filter::new(1000).unwrap();
        assert_eq!(filter.current_error_ratio(), 0.0);
        assert!(filter.max_error_ratio() > 0.0);
        assert!(filter.max_error_ratio() < 1.0);
        for i in 0..500u64 {
            filter.insert(i).unwrap();
        }
        assert!(filter.current_error_ratio() > 0.0);
        assert!(filter.current_error_ratio() <= filter.max_error_ratio());
    }

    #[test]
    fn debug_is_compact() {
        let filter = Filter::new(1000).unwrap();
        let repr = format!("{filter:?}");
        assert!(repr.contains("len: 0"), "{repr}");
        assert!(!repr.contains("md"), "{repr}");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_round_trip() {
        let mut filter = Filter::new(500).unwrap();
        for i in 0..400u64 {
            filter.insert(i).unwrap();
        }
        let bytes = serde_cbor::to_vec(&filter).unwrap();
        let back: Filter = serde_cbor::from_slice(&bytes).unwrap();
        back.validate();
        assert_eq!(back.len(), filter.len());
        assert_eq!(back.blocks, filter.blocks);
        for i in 0..400u64 {
            assert!(back.contains(i));
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_rejects_corrupt_metadata() {
        let filter = Filter::new(48).unwrap();
        let mut bytes = serde_cbor::to_vec(&filter).unwrap();
        // zero the top metadata byte: terminators go missing while the open
        // slots below claim to be unused
        let position = bytes
            .iter()
            .position(|&b| b == 0xff)
            .expect("metadata bytes present");
        bytes[position + 15] = 0;
        assert!(serde_cbor::from_slice::<Filter>(&bytes).is_err());
    }
}
