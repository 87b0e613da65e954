// src/engine/slicer.rs
//
// Split one tall image into consecutive full-width slices.

use crate::engine::common::{CancelFlag, Progress};
use crate::engine::decoder::decode;
use crate::engine::encoder::encode;
use crate::engine::io::{check_input, inspect, ensure_writable_dir, sanitize_slice_base, SourceFormat};
use crate::engine::limits::EngineLimits;
use crate::engine::pipeline::crop_rows;
use crate::error::{Result, SlicerError};
use crate::ops::{CutPlan, CutSpec, OutputFormat, SplitRequest, MAX_INDEX_DIGITS, MIN_INDEX_DIGITS};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Written files, top to bottom.
    pub outputs: Vec<PathBuf>,
    /// Source rows covered by each slice.
    pub slice_heights: Vec<u32>,
}

/// `{base}_{index}` or `{base}_v{version:03}_{index}`, index zero-padded to
/// `digits`.
pub fn slice_file_name(
    base: &str,
    index: usize,
    digits: usize,
    sequence_version: u32,
    format: OutputFormat,
) -> String {
    let ext = format.extension();
    if sequence_version == 0 {
        format!("{base}_{index:0digits$}.{ext}")
    } else {
        format!("{base}_v{sequence_version:03}_{index:0digits$}.{ext}")
    }
}

fn validate_digits(digits: usize) -> Result<()> {
    if !(MIN_INDEX_DIGITS..=MAX_INDEX_DIGITS).contains(&digits) {
        return Err(SlicerError::invalid_argument(
            "digits",
            digits.to_string(),
            format!("index width must be between {MIN_INDEX_DIGITS} and {MAX_INDEX_DIGITS}"),
        ));
    }
    Ok(())
}

fn remove_written(outputs: &[PathBuf]) {
    for path in outputs {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove slice after cancellation");
        }
    }
}

/// Split `request.source` at the requested rows.
///
/// Nothing is written before the output directory passes the write check.
/// A failing slice aborts the run; cancellation also removes the slices this
/// run already wrote.
pub fn split(
    request: &SplitRequest,
    limits: &EngineLimits,
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<SplitOutcome> {
    validate_digits(request.digits)?;
    let source = request.source.as_path();
    check_input(source)?;
    SourceFormat::from_path(source)?;
    ensure_writable_dir(&request.output_dir)?;
    cancel.check()?;

    let handle = decode(source, None, limits)?;
    let plan = request.cuts.plan(handle.height())?;
    let dpi = handle.dpi();
    let image = handle.into_image();

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = match request.base_name.as_deref() {
        Some(name) if !name.trim().is_empty() => sanitize_slice_base(name, &stem),
        _ => stem,
    };
    let (format, quality) = match request.platform.as_ref() {
        Some(spec) => spec.resolve(request.format, request.quality),
        None => (request.format, request.quality),
    };

    let slices = plan.slices();
    let total = slices.len();
    tracing::info!(
        source = %source.display(),
        slices = total,
        format = format.as_str(),
        "splitting"
    );

    let mut outcome = SplitOutcome {
        outputs: Vec::with_capacity(total),
        slice_heights: Vec::with_capacity(total),
    };
    for (index, &(top, bottom)) in slices.iter().enumerate() {
        if let Err(cancelled) = cancel.check() {
            remove_written(&outcome.outputs);
            tracing::info!(written = outcome.outputs.len(), "split cancelled");
            return Err(cancelled);
        }
        progress.report(index as f32 / total as f32 * 100.0);

        let crop = crop_rows(&image, top, bottom);
        let target = request
            .output_dir
            .join(slice_file_name(&base, index, request.digits, request.sequence_version, format));
        let written = encode(&crop, &target, quality, format, request.platform.as_ref(), dpi)
            .map_err(|e| e.at_slice(index, total))?;
        drop(crop);

        outcome.outputs.push(written);
        outcome.slice_heights.push(bottom - top);
    }

    progress.report(100.0);
    tracing::info!(source = %source.display(), written = total, "split finished");
    Ok(outcome)
}

/// Split every `interval` rows. The plan is validated from the header before
/// anything is decoded.
pub fn split_every(
    source: &Path,
    interval: u32,
    output_dir: &Path,
    limits: &EngineLimits,
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<SplitOutcome> {
    let descriptor = inspect(source)?;
    let plan = CutPlan::every(interval, descriptor.height)?;
    let offsets = plan.offsets().iter().map(|&o| o as i64).collect();
    let request = SplitRequest::new(source, CutSpec::At(offsets), output_dir);
    split(&request, limits, progress, cancel)
}
