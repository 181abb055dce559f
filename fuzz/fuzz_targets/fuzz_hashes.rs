#![no_main]
use std::collections::HashSet;

use libfuzzer_sys::arbitrary;
use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

const CHECK_EVERY: usize = 8;

#[derive(Debug, Arbitrary)]
struct Input {
    cap: u16,
    ops: Vec<(bool, u16)>,
}

fuzz_target!(|input: Input| {
    let Input { cap, ops } = input;
    // The "Model", tracks the count for each reduced hash. u16 hashes keep
    // the domain dense enough that runs, spills and collisions all happen.
    let mut counts = [0u64; (u16::MAX as usize) + 1];
    let mut total = 0u64;
    let mut live = HashSet::new();
    let mut tainted = HashSet::new();
    let mut f = vqfilter::Filter::new(cap as u64).unwrap();
    let range = f.range();
    for i in 0..ops.len() {
        let (add, h) = ops[i];
        let h = h as u64 % range;
        if add {
            if f.insert_hash(h).is_err() {
                continue;
            }
            counts[h as usize] += 1;
            total += 1;
            live.insert(h as u16);
            // at least one copy is definitely resident again
            tainted.remove(&(h as u16));
        } else if counts[h as usize] != 0 && f.remove_hash(h) {
            counts[h as usize] -= 1;
            total -= 1;
            if counts[h as usize] == 0 {
                live.remove(&(h as u16));
            }
            // the deleted tag may have belonged to any live hash sharing a
            // candidate bucket and tag with h
            let (b, tag, alt) = f.candidates(h);
            for &r in &live {
                let (rb, rtag, ralt) = f.candidates(r as u64);
                if rtag == tag && (rb == b || rb == alt || ralt == b || ralt == alt) {
                    tainted.insert(r);
                }
            }
        } else {
            continue;
        }
        if i % CHECK_EVERY == 0 {
            assert_eq!(f.len(), total);
            for &r in &live {
                if !tainted.contains(&r) {
                    assert!(f.contains_hash(r as u64), "{r} went missing");
                }
            }
        }
    }
    assert_eq!(f.len(), total);
    f.validate();
});
