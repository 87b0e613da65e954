#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use strip_slicer::CutPlan;

#[derive(Arbitrary, Debug)]
struct Input {
    height: u32,
    offsets: Vec<i64>,
}

fuzz_target!(|input: Input| {
    let Ok(plan) = CutPlan::new(input.offsets, input.height) else {
        return;
    };
    let slices = plan.slices();
    assert_eq!(slices.first().map(|s| s.0), Some(0));
    assert_eq!(slices.last().map(|s| s.1), Some(input.height));
    assert!(slices.iter().all(|(top, bottom)| top < bottom));
});
