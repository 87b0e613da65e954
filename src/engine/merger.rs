// src/engine/merger.rs
//
// Stack a sequence of images into one vertical composite, horizontally
// centred. Composites whose RGBA estimate crosses the streaming threshold are
// handed to engine::streaming.

use crate::engine::common::{CancelFlag, Progress};
use crate::engine::decoder::{decode, ColorMode};
use crate::engine::encoder::{encode, platform_dimensions};
use crate::engine::io::{inspect, ensure_writable_dir, sanitize_merge_base, unique_path, ImageDescriptor};
use crate::engine::limits::{rgba_bytes, EngineLimits};
use crate::engine::pipeline::{blank_canvas, paste_centered, scaled_height, shrink_to_width, to_mode};
use crate::engine::streaming;
use crate::error::{Result, SlicerError};
use crate::ops::{MergeTask, OutputFormat, PlatformSpec, QualityPolicy, ResampleFilter};
use image::DynamicImage;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    InMemory,
    Streaming,
}

impl MergeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InMemory => "in-memory",
            Self::Streaming => "streaming",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Path actually written; the extension follows the encoded format.
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub mode: MergeMode,
}

/// Canvas geometry shared by both merge modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MergeLayout {
    pub width: u32,
    pub height: u32,
    pub mode: ColorMode,
    /// Sources wider than this are downscaled before pasting.
    pub platform_width: Option<u32>,
}

impl MergeLayout {
    /// Widest source by the summed heights. With a platform whose width the
    /// widest source exceeds, the canvas takes the platform width and every
    /// wider source contributes its downscaled height; narrower sources keep
    /// theirs.
    pub(crate) fn new(
        descriptors: &[ImageDescriptor],
        format: OutputFormat,
        platform: Option<&PlatformSpec>,
    ) -> Result<Self> {
        let mode = if format.supports_alpha() {
            ColorMode::Rgba
        } else {
            ColorMode::Rgb
        };
        let max_width = descriptors.iter().map(|d| d.width).max().unwrap_or(0);
        let platform_width = platform
            .map(|spec| spec.max_width)
            .filter(|&cap| max_width > cap);
        let width = platform_width.unwrap_or(max_width);
        let height: u64 = descriptors
            .iter()
            .map(|d| match platform_width {
                Some(cap) if d.width > cap => scaled_height(d.width, d.height, cap) as u64,
                _ => d.height as u64,
            })
            .sum();
        let height = u32::try_from(height.max(1)).map_err(|_| {
            SlicerError::pixel_limit_exceeded(
                "merged composite height",
                width as u64 * height,
                u32::MAX as u64,
            )
        })?;
        Ok(Self {
            width,
            height,
            mode,
            platform_width,
        })
    }

    /// Decode one source and bring it to the canvas width rule and colour
    /// mode.
    pub(crate) fn prepare(&self, path: &Path, limits: &EngineLimits) -> Result<DynamicImage> {
        let image = decode(path, None, limits)?.into_image();
        let image = match self.platform_width {
            Some(width) => shrink_to_width(image, width, ResampleFilter::Lanczos3)?,
            None => image,
        };
        Ok(to_mode(image, self.mode))
    }

    /// Size of the written file: the canvas, unless a platform height cap
    /// shrinks it further at encode time.
    pub(crate) fn encoded_size(&self, platform: Option<&PlatformSpec>) -> (u32, u32) {
        match platform {
            Some(spec) => platform_dimensions(spec, self.width, self.height),
            None => (self.width, self.height),
        }
    }

    /// A prepared source must end inside the canvas; anything else means the
    /// decoded size disagrees with the header the layout was built from.
    pub(crate) fn check_fits(&self, path: &Path, y: u32, tile_height: u32) -> Result<()> {
        let bottom = y as u64 + tile_height as u64;
        if bottom > self.height as u64 {
            return Err(SlicerError::decode_failed(
                path,
                format!(
                    "decoded height {tile_height} at row {y} overruns the {}-row composite",
                    self.height
                ),
            ));
        }
        Ok(())
    }
}

/// Output path for a merge: sanitised base name in `dir`, with `_001`, `_002`,
/// ... appended when the name is taken. The extension is the one the encoder
/// will write, after `platform` had its say on the format.
pub fn merge_output_path(
    dir: &Path,
    base_name: &str,
    format: OutputFormat,
    platform: Option<&PlatformSpec>,
) -> PathBuf {
    let format = effective_format(format, platform);
    let file = format!("{}.{}", sanitize_merge_base(base_name), format.extension());
    unique_path(&dir.join(file))
}

fn effective_format(format: OutputFormat, platform: Option<&PlatformSpec>) -> OutputFormat {
    match platform {
        Some(spec) => spec.resolve(format, QualityPolicy::default()).0,
        None => format,
    }
}

/// Directories created for the output by the up-front write check. Unless kept,
/// they are removed again (deepest first, only while empty) on drop.
struct CreatedDirs {
    dirs: Vec<PathBuf>,
    keep: bool,
}

impl CreatedDirs {
    fn prepare(dir: &Path) -> Result<Self> {
        let dirs = dir
            .ancestors()
            .take_while(|d| !d.as_os_str().is_empty() && !d.exists())
            .map(Path::to_path_buf)
            .collect();
        let guard = Self { dirs, keep: false };
        ensure_writable_dir(dir)?;
        Ok(guard)
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for CreatedDirs {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for dir in &self.dirs {
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
        }
    }
}

/// Descriptor pass (0 to 20%). Returns `(descriptors, max_width, total_height)`.
fn measure(
    files: &[PathBuf],
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<(Vec<ImageDescriptor>, u32, u64)> {
    let n = files.len();
    let mut descriptors = Vec::with_capacity(n);
    let mut max_width = 0u32;
    let mut total_height = 0u64;
    for (i, path) in files.iter().enumerate() {
        cancel.check()?;
        let descriptor = inspect(path).map_err(|e| e.at_input(i, path))?;
        max_width = max_width.max(descriptor.width);
        total_height += descriptor.height as u64;
        descriptors.push(descriptor);
        progress.report(i as f32 / n as f32 * 20.0);
    }
    Ok((descriptors, max_width, total_height))
}

/// Merge `task.files` top to bottom into `task.output_path`.
///
/// The destination directory is checked before any source is read; directories
/// created for it are removed again if the merge does not complete.
/// Cancellation drops the composite and writes nothing. The encoder writes
/// through a temporary file, so a failed or cancelled run leaves no partial
/// output behind.
pub fn merge(
    task: MergeTask,
    limits: &EngineLimits,
    progress: &mut Progress<'_>,
    cancel: &CancelFlag,
) -> Result<MergeOutcome> {
    if task.files.is_empty() {
        return Err(SlicerError::invalid_argument(
            "files",
            "[]",
            "at least one image is required to merge",
        ));
    }

    cancel.check()?;
    let parent = match task.output_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let created = CreatedDirs::prepare(&parent)?;

    let (descriptors, max_width, total_height) = measure(&task.files, progress, cancel)?;
    let total_pixels = max_width as u64 * total_height;
    if total_pixels > limits.max_pixels {
        return Err(SlicerError::pixel_limit_exceeded(
            format!("merged composite ({max_width}x{total_height})"),
            total_pixels,
            limits.max_pixels,
        ));
    }

    let layout = MergeLayout::new(&descriptors, task.format, task.platform.as_ref())?;
    drop(descriptors);
    if limits.needs_streaming(max_width, total_height) {
        tracing::info!(
            files = task.files.len(),
            estimated_mib = total_pixels * 4 / (1024 * 1024),
            "composite exceeds streaming threshold, spilling chunks to disk"
        );
        let outcome = streaming::merge_streaming(&task, &layout, limits, progress, cancel)?;
        created.keep();
        return Ok(outcome);
    }

    tracing::info!(
        files = task.files.len(),
        width = layout.width,
        height = layout.height,
        "merging in memory"
    );
    let mut canvas = blank_canvas(layout.width, layout.height, layout.mode);
    let n = task.files.len();
    let mut y = 0u32;
    for (i, path) in task.files.iter().enumerate() {
        // canvas is dropped on return
        cancel.check()?;
        let tile = layout
            .prepare(path, limits)
            .and_then(|tile| layout.check_fits(path, y, tile.height()).map(|()| tile))
            .map_err(|e| e.at_input(i, path))?;
        paste_centered(&mut canvas, &tile, y);
        y = y.saturating_add(tile.height());
        drop(tile);
        progress.report(20.0 + (i + 1) as f32 / n as f32 * 70.0);
    }
    cancel.check()?;

    let output = write_composite(&task, &canvas)?;
    created.keep();
    progress.report(100.0);
    tracing::info!(output = %output.display(), "merge finished");
    let (width, height) = layout.encoded_size(task.platform.as_ref());
    Ok(MergeOutcome {
        output,
        width,
        height,
        mode: MergeMode::InMemory,
    })
}

/// Phase 3: encode into the checked directory.
///
/// When a platform changes the format, the encoder writes under a different
/// extension than the caller asked for; that path gets its own collision
/// suffix instead of replacing whatever already sits there.
pub(crate) fn write_composite(task: &MergeTask, canvas: &DynamicImage) -> Result<PathBuf> {
    let format = effective_format(task.format, task.platform.as_ref());
    let requested = task.output_path.as_path();
    let target = requested.with_extension(format.extension());
    let target = if target == requested {
        target
    } else {
        unique_path(&target)
    };
    encode(
        canvas,
        &target,
        task.quality,
        task.format,
        task.platform.as_ref(),
        None,
    )
}

/// RGBA footprint of the composite the descriptors describe, for callers
/// that want to predict the merge mode.
pub fn estimate_composite_bytes(descriptors: &[ImageDescriptor]) -> u64 {
    let width = descriptors.iter().map(|d| d.width).max().unwrap_or(0);
    descriptors
        .iter()
        .map(|d| rgba_bytes(width, d.height))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{GenericImageView, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    fn solid(dir: &Path, name: &str, width: u32, height: u32, color: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(width, height, Rgb(color))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        path
    }

    fn png_task(files: Vec<PathBuf>, output: PathBuf) -> MergeTask {
        let mut task = MergeTask::new(files, output);
        task.format = OutputFormat::Png;
        task
    }

    #[test]
    fn three_images_are_centred_and_stacked() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            solid(dir.path(), "a.png", 600, 1000, [255, 0, 0]),
            solid(dir.path(), "b.png", 800, 1500, [0, 255, 0]),
            solid(dir.path(), "c.png", 600, 800, [0, 0, 255]),
        ];
        let outcome = merge(
            png_task(files, dir.path().join("out/merged.png")),
            &EngineLimits::default(),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!((outcome.width, outcome.height), (800, 3300));
        assert_eq!(outcome.mode, MergeMode::InMemory);

        let merged = image::open(&outcome.output).unwrap().to_rgba8();
        assert_eq!(merged.dimensions(), (800, 3300));
        assert_eq!(merged.get_pixel(99, 10), &Rgba([0, 0, 0, 0]));
        assert_eq!(merged.get_pixel(100, 10), &Rgba([255, 0, 0, 255]));
        assert_eq!(merged.get_pixel(699, 999), &Rgba([255, 0, 0, 255]));
        assert_eq!(merged.get_pixel(0, 1000), &Rgba([0, 255, 0, 255]));
        assert_eq!(merged.get_pixel(100, 2500), &Rgba([0, 0, 255, 255]));
        assert_eq!(merged.get_pixel(700, 2500), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn jpeg_composite_has_white_margins() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            solid(dir.path(), "a.png", 20, 16, [0, 0, 0]),
            solid(dir.path(), "b.png", 40, 16, [0, 0, 0]),
        ];
        let outcome = merge(
            MergeTask::new(files, dir.path().join("merged")),
            &EngineLimits::default(),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(outcome.output, dir.path().join("merged.jpg"));
        let merged = image::open(&outcome.output).unwrap().to_rgb8();
        assert_eq!(merged.dimensions(), (40, 32));
        assert!(merged.get_pixel(1, 4).0.iter().all(|&c| c > 240));
        assert!(merged.get_pixel(20, 4).0.iter().all(|&c| c < 20));
    }

    #[test]
    fn alpha_sources_are_flattened_for_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clear.png");
        RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 0]))
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        let outcome = merge(
            MergeTask::new(vec![path], dir.path().join("m.jpg")),
            &EngineLimits::default(),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap();
        let merged = image::open(&outcome.output).unwrap().to_rgb8();
        assert!(merged.get_pixel(8, 8).0.iter().all(|&c| c > 240));
    }

    #[test]
    fn progress_bands() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            solid(dir.path(), "a.png", 8, 8, [1, 1, 1]),
            solid(dir.path(), "b.png", 8, 8, [2, 2, 2]),
        ];
        let mut seen = Vec::new();
        {
            let mut sink = |v: f32| seen.push(v);
            let mut progress = Progress::new(&mut sink);
            merge(
                png_task(files, dir.path().join("m.png")),
                &EngineLimits::default(),
                &mut progress,
                &CancelFlag::new(),
            )
            .unwrap();
        }
        assert_eq!(seen, vec![0.0, 10.0, 55.0, 90.0, 100.0]);
    }

    #[test]
    fn platform_width_scales_only_wide_sources() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            solid(dir.path(), "wide.png", 1380, 200, [10, 10, 10]),
            solid(dir.path(), "narrow.png", 600, 100, [200, 0, 0]),
        ];
        let mut task = MergeTask::new(files, dir.path().join("m.jpg"));
        task.platform = PlatformSpec::get("naver");
        let outcome = merge(task, &EngineLimits::default(), &mut Progress::none(), &CancelFlag::new()).unwrap();
        // 200 * 690 / 1380 rows from the wide source, all 100 from the narrow one
        assert_eq!((outcome.width, outcome.height), (690, 200));
        let merged = image::open(&outcome.output).unwrap().to_rgb8();
        assert_eq!(merged.dimensions(), (690, 200));

        let is_red = |p: &Rgb<u8>| p.0[0] > 150 && p.0[1] < 60 && p.0[2] < 60;
        assert!(merged.get_pixel(345, 50).0.iter().all(|&c| c < 40));
        for y in [106, 150, 197] {
            assert!(is_red(merged.get_pixel(345, y)), "row {y}");
        }
        // narrow source centred at x = (690 - 600) / 2
        assert!(merged.get_pixel(20, 150).0.iter().all(|&c| c > 220));
    }

    #[test]
    fn layout_sums_per_source_heights() {
        let descriptor = |width, height| ImageDescriptor {
            path: PathBuf::from("x.png"),
            width,
            height,
            byte_size: 0,
            format: crate::engine::io::SourceFormat::Png,
        };
        let descriptors = [descriptor(1000, 999), descriptor(500, 300), descriptor(2000, 10)];
        let naver = PlatformSpec::naver();
        let layout = MergeLayout::new(&descriptors, OutputFormat::Jpeg, Some(&naver)).unwrap();
        // floor(999 * 690 / 1000) + 300 + floor(10 * 690 / 2000)
        assert_eq!((layout.width, layout.height), (690, 689 + 300 + 3));
        assert_eq!(layout.platform_width, Some(690));

        let wide_cap = PlatformSpec::new("print", 2500, None, QualityPolicy::Lossless);
        let layout = MergeLayout::new(&descriptors, OutputFormat::Png, Some(&wide_cap)).unwrap();
        assert_eq!((layout.width, layout.height), (2000, 1309));
        assert_eq!(layout.platform_width, None);
        assert_eq!(layout.mode, ColorMode::Rgba);
    }

    #[test]
    fn forced_format_does_not_replace_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("merged_images.jpg");
        std::fs::write(&existing, b"keep me").unwrap();
        let naver = PlatformSpec::naver();

        let planned = merge_output_path(dir.path(), "merged_images", OutputFormat::Png, Some(&naver));
        assert_eq!(planned, dir.path().join("merged_images_001.jpg"));

        // a caller-built PNG path still must not land on the existing JPEG
        let files = vec![solid(dir.path(), "a.png", 8, 8, [0, 0, 0])];
        let mut task = png_task(files, dir.path().join("merged_images.png"));
        task.platform = Some(naver);
        let outcome = merge(task, &EngineLimits::default(), &mut Progress::none(), &CancelFlag::new()).unwrap();
        assert_eq!(outcome.output, dir.path().join("merged_images_001.jpg"));
        assert_eq!(std::fs::read(&existing).unwrap(), b"keep me");
    }

    #[test]
    fn unwritable_destination_is_reported_before_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let files = vec![dir.path().join("missing.png")];
        let err = merge(
            png_task(files, blocker.join("m.png")),
            &EngineLimits::default(),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutputUnwritable);
    }

    #[test]
    fn failed_merge_removes_directories_it_created() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            solid(dir.path(), "a.png", 8, 8, [0, 0, 0]),
            dir.path().join("gone.png"),
        ];
        let err = merge(
            png_task(files, dir.path().join("out/nested/m.png")),
            &EngineLimits::default(),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputNotFound);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn pixel_ceiling_is_checked_before_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            solid(dir.path(), "a.png", 100, 100, [0, 0, 0]),
            solid(dir.path(), "b.png", 100, 100, [0, 0, 0]),
        ];
        let err = merge(
            png_task(files, dir.path().join("m.png")),
            &EngineLimits::default().with_max_pixels(19_999),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PixelLimitExceeded);
        assert!(err.to_string().contains("20000"));
        assert!(!dir.path().join("m.png").exists());
    }

    #[test]
    fn empty_file_list_is_rejected() {
        let err = merge(
            MergeTask::new(Vec::new(), "unused.png"),
            &EngineLimits::default(),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn missing_input_names_its_position() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            solid(dir.path(), "a.png", 8, 8, [0, 0, 0]),
            dir.path().join("gone.png"),
        ];
        let err = merge(
            png_task(files, dir.path().join("m.png")),
            &EngineLimits::default(),
            &mut Progress::none(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InputNotFound);
        assert!(err.to_string().starts_with("Input #2"));
    }

    #[test]
    fn cancelled_merge_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![solid(dir.path(), "a.png", 8, 8, [0, 0, 0])];
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = merge(
            png_task(files, dir.path().join("out/m.png")),
            &EngineLimits::default(),
            &mut Progress::none(),
            &cancel,
        )
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn output_path_sanitises_and_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = merge_output_path(dir.path(), "ep:1?", OutputFormat::Png, None);
        assert_eq!(first, dir.path().join("ep_1_.png"));
        std::fs::write(&first, b"x").unwrap();
        assert_eq!(
            merge_output_path(dir.path(), "ep:1?", OutputFormat::Png, None),
            dir.path().join("ep_1__001.png")
        );
        assert_eq!(
            merge_output_path(dir.path(), " . ", OutputFormat::Jpeg, None),
            dir.path().join("merged_images.jpg")
        );
    }

    #[test]
    fn composite_estimate_uses_widest_source() {
        let descriptors = [(800u32, 1000u32), (400, 500)]
            .iter()
            .map(|&(width, height)| ImageDescriptor {
                path: PathBuf::from("x.png"),
                width,
                height,
                byte_size: 0,
                format: crate::engine::io::SourceFormat::Png,
            })
            .collect::<Vec<_>>();
        assert_eq!(estimate_composite_bytes(&descriptors), 800 * 1500 * 4);
    }
}
