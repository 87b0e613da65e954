// src/engine/limits.rs
//
// Hard ceilings and thresholds, and the enforcement helpers every decode and
// merge path goes through.

use crate::error::{Result, SlicerError};
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

/// Largest pixel count a single buffer may address (i32::MAX).
pub const MAX_ADDRESSABLE_PIXELS: u64 = (1u64 << 31) - 1;
pub const DEFAULT_DECODE_MEMORY_LIMIT: u64 = 2048 * MIB;
pub const DEFAULT_STREAMING_THRESHOLD: u64 = 1000 * MIB;
pub const DEFAULT_CACHE_BUDGET: u64 = 500 * MIB;
pub const DEFAULT_CACHE_ENTRY_LIMIT: u64 = 50 * MIB;
pub const DEFAULT_CHUNK_HEIGHT: u32 = 1000;

/// Bytes an RGBA buffer of `width x height` needs.
pub fn rgba_bytes(width: u32, height: u32) -> u64 {
    (width as u64 * height as u64).saturating_mul(4)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineLimits {
    pub max_pixels: u64,
    /// Per-file ceiling on both file size and decoded RGBA footprint.
    pub decode_memory_limit: u64,
    /// Composite footprint above which merges switch to streaming mode.
    pub streaming_threshold: u64,
    pub cache_budget: u64,
    /// Decoded buffers at or above this size are never cached.
    pub cache_entry_limit: u64,
    pub chunk_height: u32,
    /// Parent for streaming-merge spill directories; the system temp dir
    /// when unset.
    pub spill_dir: Option<PathBuf>,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_pixels: MAX_ADDRESSABLE_PIXELS,
            decode_memory_limit: DEFAULT_DECODE_MEMORY_LIMIT,
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            cache_budget: DEFAULT_CACHE_BUDGET,
            cache_entry_limit: DEFAULT_CACHE_ENTRY_LIMIT,
            chunk_height: DEFAULT_CHUNK_HEIGHT,
            spill_dir: None,
        }
    }
}

impl EngineLimits {
    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = max_pixels.min(MAX_ADDRESSABLE_PIXELS);
        self
    }

    pub fn with_decode_memory_limit(mut self, bytes: u64) -> Self {
        self.decode_memory_limit = bytes;
        self
    }

    pub fn with_streaming_threshold(mut self, bytes: u64) -> Self {
        self.streaming_threshold = bytes;
        self
    }

    pub fn with_cache_budget(mut self, bytes: u64) -> Self {
        self.cache_budget = bytes;
        self
    }

    pub fn with_cache_entry_limit(mut self, bytes: u64) -> Self {
        self.cache_entry_limit = bytes;
        self
    }

    pub fn with_chunk_height(mut self, rows: u32) -> Self {
        self.chunk_height = rows.max(1);
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Reject a file whose on-disk size alone exceeds the decode ceiling.
    pub fn enforce_file_size(&self, path: &Path, len: u64) -> Result<()> {
        if len > self.decode_memory_limit {
            return Err(SlicerError::memory_budget_exceeded(
                format!("file '{}' size", path.display()),
                len,
                self.decode_memory_limit,
            ));
        }
        Ok(())
    }

    pub fn enforce_pixels(&self, context: &str, width: u32, height: u32) -> Result<()> {
        let pixels = width as u64 * height as u64;
        if pixels > self.max_pixels {
            return Err(SlicerError::pixel_limit_exceeded(
                format!("{context} ({width}x{height})"),
                pixels,
                self.max_pixels,
            ));
        }
        Ok(())
    }

    pub fn enforce_decode_memory(&self, context: &str, width: u32, height: u32) -> Result<()> {
        let required = rgba_bytes(width, height);
        if required > self.decode_memory_limit {
            return Err(SlicerError::memory_budget_exceeded(
                format!("{context} ({width}x{height} RGBA)"),
                required,
                self.decode_memory_limit,
            ));
        }
        Ok(())
    }

    /// Both decode ceilings at once.
    pub fn enforce_decoded(&self, context: &str, width: u32, height: u32) -> Result<()> {
        self.enforce_pixels(context, width, height)?;
        self.enforce_decode_memory(context, width, height)
    }

    /// Whether a `width x total_height` composite must be merged in streaming
    /// mode. Heights are summed across sources, hence `u64`.
    pub fn needs_streaming(&self, width: u32, total_height: u64) -> bool {
        (width as u64 * total_height).saturating_mul(4) > self.streaming_threshold
    }
}
