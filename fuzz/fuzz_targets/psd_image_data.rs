#![no_main]

use image::GenericImageView;
use libfuzzer_sys::fuzz_target;
use strip_slicer::engine::{read_image_data, PsdHeader};

fuzz_target!(|data: &[u8]| {
    // Keep allocations bounded; the reader trusts the header for plane sizes.
    let Ok(header) = PsdHeader::parse(data) else {
        return;
    };
    if header.width as u64 * header.height as u64 > 4 * 1024 * 1024 {
        return;
    }
    if let Ok(img) = read_image_data(data) {
        assert_eq!(img.dimensions(), (header.width, header.height));
    }
});
