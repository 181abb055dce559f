#![no_main]
use libfuzzer_sys::fuzz_target;

const FUZZ_REMOVES: Option<&str> = option_env!("FUZZ_REMOVES");

fuzz_target!(|data: Vec<i16>| {
    if data.len() < 2 {
        return;
    }
    let cap = (data[0] as u64).min(data.len() as u64 / 2);
    let ops = data
        .into_iter()
        .map(|i| {
            if i < 0 && FUZZ_REMOVES.is_some() {
                (false, i.unsigned_abs())
            } else {
                (true, i as u16)
            }
        })
        .collect::<Vec<(bool, u16)>>();
    // The "Model", tracks the count for each item
    let mut counts = [0u64; (u16::MAX as usize) + 1];
    let mut total = 0u64;
    let mut removed_any = false;
    let mut f = vqfilter::Filter::new(cap).unwrap();
    for i in 0..ops.len() {
        let (add, item) = ops[i];
        if add {
            if f.insert(item).is_err() {
                continue;
            }
            counts[item as usize] += 1;
            total += 1;
        } else if counts[item as usize] != 0 && f.remove(item) {
            // a removal may delete a colliding member's tag, after which
            // membership of other items can no longer be asserted
            counts[item as usize] -= 1;
            total -= 1;
            removed_any = true;
        } else {
            continue;
        }
        assert_eq!(f.len(), total);
        if !removed_any {
            for &(_add, e) in &ops[..=i] {
                if counts[e as usize] != 0 {
                    assert!(f.contains(e), "{e} went missing");
                }
            }
        }
    }
    f.validate();
});
