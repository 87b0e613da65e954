#![no_main]

use libfuzzer_sys::fuzz_target;
use strip_slicer::inspect_header_from_bytes;

fuzz_target!(|data: &[u8]| {
    if let Ok(meta) = inspect_header_from_bytes(data) {
        assert!(meta.width > 0 && meta.height > 0);
    }
});
