//! Hashing that is stable across platforms, Rust releases, and process runs.

use std::hash::Hasher;
use xxhash_rust::xxh3::Xxh3;

/// The `Hasher` behind the generic filter API. Integer writes are pinned to
/// little-endian so an item maps to the same candidate buckets on any
/// platform, which is what keeps serialized filters portable.
#[derive(Default)]
pub(crate) struct StableHasher(Xxh3);

impl Hasher for StableHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0.digest()
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    #[inline]
    fn write_u8(&mut self, i: u8) {
        self.0.update(&[i]);
    }

    #[inline]
    fn write_u16(&mut self, i: u16) {
        self.0.update(&i.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.0.update(&i.to_le_bytes());
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.0.update(&i.to_le_bytes());
    }

    #[inline]
    fn write_u128(&mut self, i: u128) {
        self.0.update(&i.to_le_bytes());
    }

    #[inline]
    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64);
    }
}
