// lib.rs
//
// strip-slicer: slicing, merging and resizing engine for tall webtoon strips
//
// Design goals:
// - Hard pixel and memory ceilings, checked from headers before decoding
// - Composites larger than memory allows are merged by spilling to disk
// - Layered documents (PSD/PSB) are flattened with ordered fallbacks
// - No partial output files, on failure or on cancellation

// Memory allocator optimization - jemalloc copes better with the large,
// short-lived composite buffers.
// Note: jemalloc is not supported on Windows/MSVC, so we exclude it on that platform
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod engine;
pub mod error;
pub mod ops;

pub use engine::{
    inspect, merge, resize_batch, split, CancelFlag, DecodeCache, EngineLimits, ImageDescriptor,
    Progress,
};
pub use error::{ErrorCategory, ErrorKind, Result, SlicerError};
pub use ops::{
    CutPlan, CutSpec, MergeTask, OutputFormat, PlatformSpec, QualityPolicy, ResampleFilter,
    ResizeRequest, SplitRequest,
};

#[cfg(feature = "fuzzing")]
use engine::PsdHeader;

#[cfg(feature = "fuzzing")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectMetadata {
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
}

/// Header-only inspection of an in-memory buffer, for fuzzing the same
/// header paths `inspect` takes for files.
#[cfg(feature = "fuzzing")]
pub fn inspect_header_from_bytes(data: &[u8]) -> Result<InspectMetadata> {
    use std::path::Path;

    let origin = Path::new("<memory>");
    if data.starts_with(b"8BPS") {
        let header = PsdHeader::parse(data).map_err(|reason| SlicerError::decode_failed(origin, reason))?;
        let format = if header.is_large() { "psb" } else { "psd" };
        return Ok(InspectMetadata {
            width: header.width,
            height: header.height,
            format: Some(format.to_string()),
        });
    }

    let reader = image::ImageReader::new(std::io::Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| SlicerError::decode_failed(origin, format!("failed to read image header: {e}")))?;
    let format = reader.format().map(|f| format!("{:?}", f).to_lowercase());
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| SlicerError::decode_failed(origin, format!("failed to read dimensions: {e}")))?;
    Ok(InspectMetadata {
        width,
        height,
        format,
    })
}
