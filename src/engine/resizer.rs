// src/engine/resizer.rs
//
// Batch resize to a fixed width. Unlike split and merge, a failing file is
// recorded and the batch moves on.

use crate::engine::common::{CancelFlag, Progress};
use crate::engine::decoder::{decode, ColorMode};
use crate::engine::encoder::encode;
use crate::engine::io::{ensure_writable_dir, unique_path};
use crate::engine::limits::EngineLimits;
use crate::engine::pipeline::{scale_to_width, to_mode};
use crate::error::{Result, SlicerError};
use crate::ops::{OutputFormat, ResizeRequest, MAX_RESIZE_WIDTH, MIN_RESIZE_WIDTH};
use std::path::{Path, PathBuf};

/// Resolution written when the source carries none.
pub const DEFAULT_DPI: (u32, u32) = (300, 300);

#[derive(Debug, Default)]
pub struct ResizeReport {
    /// Files written.
    pub written: Vec<PathBuf>,
    /// Sources already at the target width; nothing is written for them.
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, SlicerError)>,
}

impl ResizeReport {
    /// Written plus skipped.
    pub fn processed(&self) -> usize {
        self.written.len() + self.skipped.len()
    }
}

/// `{stem}_{width}px.{ext}` or `{stem}.{ext}`.
pub fn resized_file_name(stem: &str, target_width: u32, add_width_suffix: bool, format: OutputFormat) -> String {
    let ext = format.extension();
    if add_width_suffix {
        format!("{stem}_{target_width}px.{ext}")
    } else {
        format!("{stem}.{ext}")
    }
}

fn validate(request: &ResizeRequest) -> Result<()> {
    if !(MIN_RESIZE_WIDTH..=MAX_RESIZE_WIDTH).contains(&request.target_width) {
        return Err(SlicerError::invalid_argument(
            "target_width",
            request.target_width.to_string(),
            format!("must be between {MIN_RESIZE_WIDTH} and {MAX_RESIZE_WIDTH} pixels"),
        ));
    }
    if request.files.is_empty() {
        return Err(SlicerError::invalid_argument(
            "files",
            "[]",
            "at least one image is required to resize",
        ));
    }
    Ok(())
}

enum FileOutcome {
    Written(PathBuf),
    Skipped,
}

fn resize_one(request: &ResizeRequest, path: &Path, limits: &EngineLimits) -> Result<FileOutcome> {
    let handle = decode(path, None, limits)?;
    let dpi = handle.dpi().unwrap_or(DEFAULT_DPI);
    let image = to_mode(handle.into_image(), ColorMode::Rgb);
    if image.width() == request.target_width {
        return Ok(FileOutcome::Skipped);
    }

    let resized = scale_to_width(image, request.target_width, request.filter)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = resized_file_name(&stem, request.target_width, request.add_width_suffix, request.format);
    let target = unique_path(&request.output_dir.join(name));
    let written = encode(&resized, &target, request.quality, request.format, None, Some(dpi))?;
    Ok(FileOutcome::Written(written))
}

/// Resize every file in `request` to `request.target_width`.
///
/// Parameter errors and an unwritable output directory fail the whole call;
/// per-file errors are collected in the report. Cancellation stops between
/// files and returns `Cancelled`.
pub fn resize_batch(
    request: &ResizeRequest,
    limits: &EngineLimits,
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<ResizeReport> {
    validate(request)?;
    ensure_writable_dir(&request.output_dir)?;

    let n = request.files.len();
    tracing::info!(files = n, width = request.target_width, "resizing batch");
    let mut report = ResizeReport::default();
    for (i, path) in request.files.iter().enumerate() {
        cancel.check()?;
        match resize_one(request, path, limits) {
            Ok(FileOutcome::Written(out)) => report.written.push(out),
            Ok(FileOutcome::Skipped) => {
                tracing::debug!(path = %path.display(), "already at target width");
                report.skipped.push(path.clone());
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "resize failed");
                report.failed.push((path.clone(), e.at_input(i, path)));
            }
        }
        progress.report((i + 1) as f32 / n as f32 * 100.0);
    }

    tracing::info!(
        written = report.written.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "resize finished"
    );
    Ok(report)
}
