// src/engine.rs
//
// The core of strip-slicer. Every workflow is a synchronous function that:
// 1. Validates its request and checks the destination before writing anything
// 2. Decodes under the configured pixel/memory ceilings
// 3. Reports progress and honours cancellation through explicit handles
//
// This file is a facade over the modules in engine/

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

mod cache;
mod common;
mod decoder;
mod encoder;
mod io;
mod limits;
mod merger;
mod pipeline;
mod psd;
mod resizer;
mod slicer;
mod streaming;

pub use cache::{CacheKey, DecodeCache};
pub use common::{CancelFlag, Progress};
pub use decoder::{decode, ColorMode, ImageHandle};
pub use encoder::{
    encode, encode_jpeg, encode_png, encode_to_vec, platform_dimensions, write_atomic, JPEG_MAX_DIMENSION,
};
pub use io::{
    ensure_writable_dir, extract_dpi, inspect, is_supported, sanitize_merge_base, sanitize_slice_base,
    unique_path, ImageDescriptor, SourceFormat, SUPPORTED_EXTENSIONS,
};
pub use limits::{
    rgba_bytes, EngineLimits, DEFAULT_CACHE_BUDGET, DEFAULT_CACHE_ENTRY_LIMIT, DEFAULT_CHUNK_HEIGHT,
    DEFAULT_DECODE_MEMORY_LIMIT, DEFAULT_STREAMING_THRESHOLD, MAX_ADDRESSABLE_PIXELS,
};
pub use merger::{estimate_composite_bytes, merge, merge_output_path, MergeMode, MergeOutcome};
pub use pipeline::{crop_rows, scale_to_width, scaled_height, ResizeError};
pub use psd::{flatten, read_image_data, FlattenStrategy, PsdHeader, FLATTEN_STRATEGIES};
pub use resizer::{resize_batch, resized_file_name, ResizeReport, DEFAULT_DPI};
pub use slicer::{slice_file_name, split, split_every, SplitOutcome};
