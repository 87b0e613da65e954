// src/engine/streaming.rs
//
// Chunk-and-spill merge for composites too large to assemble from fully
// decoded sources. Each source is decoded alone, cut into row bands, spilled
// as PNG to a scratch directory and released; the composite is then rebuilt
// one band at a time.

use crate::engine::common::{CancelFlag, Progress};
use crate::engine::merger::{write_composite, MergeLayout, MergeMode, MergeOutcome};
use crate::engine::limits::EngineLimits;
use crate::engine::pipeline::{blank_canvas, crop_rows, paste_centered};
use crate::error::{Result, SlicerError};
use crate::ops::MergeTask;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::DynamicImage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One spilled band and where it lands in the composite.
#[derive(Clone, Debug)]
struct SpilledChunk {
    path: PathBuf,
    width: u32,
    height: u32,
    y: u32,
    /// Position of the originating file in the task.
    source: usize,
    /// Band number within its source.
    index: usize,
}

fn spill_root(limits: &EngineLimits) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("strip-slicer-spill-");
    match limits.spill_dir.as_deref() {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| SlicerError::output_unwritable(dir, e))?;
            builder.tempdir_in(dir).map_err(|e| SlicerError::output_unwritable(dir, e))
        }
        None => builder
            .tempdir()
            .map_err(|e| SlicerError::output_unwritable(&std::env::temp_dir(), e)),
    }
}

/// Bands are scratch data: fast deflate, no oxipng pass.
fn write_band(band: &DynamicImage, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| SlicerError::output_unwritable(path, e))?;
    let mut writer = BufWriter::new(file);
    let encoder = PngEncoder::new_with_quality(&mut writer, CompressionType::Fast, PngFilter::Adaptive);
    band.write_with_encoder(encoder)
        .map_err(|e| SlicerError::encode_failed("png", format!("spill: {e}")))?;
    writer.flush().map_err(|e| SlicerError::output_unwritable(path, e))
}

fn read_band(chunk: &SpilledChunk) -> Result<DynamicImage> {
    image::open(&chunk.path)
        .map_err(|e| SlicerError::decode_failed(&chunk.path, format!("spilled chunk: {e}")))
}

/// Chunk pass (20 to 80%).
fn spill_sources(
    task: &MergeTask,
    layout: &MergeLayout,
    limits: &EngineLimits,
    scratch: &Path,
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<Vec<SpilledChunk>> {
    let n = task.files.len();
    let band_height = limits.chunk_height.max(1);
    let mut chunks = Vec::new();
    let mut y = 0u32;

    for (i, path) in task.files.iter().enumerate() {
        cancel.check()?;
        let tile = layout
            .prepare(path, limits)
            .and_then(|tile| layout.check_fits(path, y, tile.height()).map(|()| tile))
            .map_err(|e| e.at_input(i, path))?;

        for (index, top) in (0..tile.height()).step_by(band_height as usize).enumerate() {
            cancel.check()?;
            let y_pos = y.saturating_add(top);
            let bottom = top.saturating_add(band_height).min(tile.height());
            let band = crop_rows(&tile, top, bottom);
            let chunk_path = scratch.join(format!("chunk_{i:05}_{index:05}.png"));
            write_band(&band, &chunk_path).map_err(|e| e.at_chunk(index, path))?;
            chunks.push(SpilledChunk {
                path: chunk_path,
                width: band.width(),
                height: band.height(),
                y: y_pos,
                source: i,
                index,
            });
        }

        y = y.saturating_add(tile.height());
        drop(tile);
        progress.report(20.0 + (i + 1) as f32 / n as f32 * 60.0);
    }

    tracing::debug!(chunks = chunks.len(), dir = %scratch.display(), "spilled merge chunks");
    Ok(chunks)
}

/// Reassembly (80 to 90%).
fn reassemble(
    task: &MergeTask,
    layout: &MergeLayout,
    chunks: &[SpilledChunk],
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<DynamicImage> {
    cancel.check()?;
    let mut canvas = blank_canvas(layout.width, layout.height, layout.mode);
    for (k, chunk) in chunks.iter().enumerate() {
        cancel.check()?;
        let band = read_band(chunk).map_err(|e| e.at_chunk(chunk.index, &task.files[chunk.source]))?;
        debug_assert_eq!((band.width(), band.height()), (chunk.width, chunk.height));
        paste_centered(&mut canvas, &band, chunk.y);
        progress.report_fraction(80.0, 90.0, k + 1, chunks.len());
    }
    Ok(canvas)
}

/// Streaming counterpart of `merge`. Produces the same pixels; peak memory
/// is one decoded source plus the composite.
///
/// The scratch directory is removed on every exit path, and no output is
/// written when the run is cancelled at any point.
pub(crate) fn merge_streaming(
    task: &MergeTask,
    layout: &MergeLayout,
    limits: &EngineLimits,
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<MergeOutcome> {
    let scratch = spill_root(limits)?;
    let chunks = spill_sources(task, layout, limits, scratch.path(), progress, cancel)?;
    let canvas = reassemble(task, layout, &chunks, progress, cancel)?;
    cancel.check()?;

    let output = write_composite(task, &canvas)?;
    drop(canvas);

    let scratch_path = scratch.path().to_path_buf();
    if let Err(e) = scratch.close() {
        tracing::warn!(dir = %scratch_path.display(), error = %e, "failed to remove spill directory");
    }
    progress.report(100.0);
    tracing::info!(output = %output.display(), chunks = chunks.len(), "streaming merge finished");
    let (width, height) = layout.encoded_size(task.platform.as_ref());
    Ok(MergeOutcome {
        output,
        width,
        height,
        mode: MergeMode::Streaming,
    })
}
