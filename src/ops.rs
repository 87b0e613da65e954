// src/ops.rs
//
// Request and policy types. These are cheap to build and carry no pixels;
// the engine modules do the expensive work.

use crate::error::{Result, SlicerError};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Output container family. JPEG covers `.jpg`/`.jpeg`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OutputFormat {
    Png,
    #[default]
    Jpeg,
}

impl OutputFormat {
    pub fn from_png_flag(save_as_png: bool) -> Self {
        if save_as_png {
            Self::Png
        } else {
            Self::Jpeg
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    pub fn supports_alpha(self) -> bool {
        matches!(self, Self::Png)
    }
}

/// Encode quality, either a named level or an explicit JPEG quality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QualityPolicy {
    Lossless,
    #[default]
    High,
    Medium,
    Low,
    Custom(u8),
}

impl QualityPolicy {
    /// JPEG quality factor (0-100).
    pub fn jpeg_quality(self) -> u8 {
        match self {
            Self::Lossless => 100,
            Self::High => 95,
            Self::Medium => 85,
            Self::Low => 70,
            Self::Custom(q) => q.min(100),
        }
    }

    /// Chroma subsampling is only disabled (4:4:4) at Lossless and High.
    pub fn full_chroma(self) -> bool {
        matches!(self, Self::Lossless | Self::High)
    }
}

impl FromStr for QualityPolicy {
    type Err = SlicerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lossless" => Ok(Self::Lossless),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => other
                .parse::<u8>()
                .ok()
                .filter(|q| *q <= 100)
                .map(Self::Custom)
                .ok_or_else(|| {
                    SlicerError::invalid_argument(
                        "quality",
                        other.to_string(),
                        "expected lossless, high, medium, low or 0-100",
                    )
                }),
        }
    }
}

impl fmt::Display for QualityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lossless => f.write_str("lossless"),
            Self::High => f.write_str("high"),
            Self::Medium => f.write_str("medium"),
            Self::Low => f.write_str("low"),
            Self::Custom(q) => write!(f, "{q}"),
        }
    }
}

// =============================================================================
// PLATFORM PRESETS - distribution targets with width/format constraints
// =============================================================================

/// Named size/format constraint applied at encode time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformSpec {
    pub name: String,
    pub max_width: u32,
    /// Applied after the width cap; none of the presets set it.
    pub max_height: Option<u32>,
    /// When set to a lossy format, it overrides the caller's PNG choice.
    pub preferred_format: Option<OutputFormat>,
    pub default_quality: QualityPolicy,
}

impl PlatformSpec {
    pub fn new(
        name: impl Into<String>,
        max_width: u32,
        preferred_format: Option<OutputFormat>,
        default_quality: QualityPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            max_width,
            max_height: None,
            preferred_format,
            default_quality,
        }
    }

    /// Get the built-in preset by name
    pub fn get(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "webtoon" => Some(Self::webtoon()),
            "naver" => Some(Self::naver()),
            "kakao" => Some(Self::kakao()),
            "lezhin" => Some(Self::lezhin()),
            "archive" => Some(Self::archive()),
            _ => None,
        }
    }

    /// Add a height cap; the encoder scales the image down to fit it.
    pub fn with_max_height(mut self, max_height: u32) -> Self {
        self.max_height = Some(max_height.max(1));
        self
    }

    pub fn preset_names() -> &'static [&'static str] {
        &["webtoon", "naver", "kakao", "lezhin", "archive"]
    }

    /// Generic vertical-scroll target: 800px wide JPEG
    pub fn webtoon() -> Self {
        Self::new("webtoon", 800, Some(OutputFormat::Jpeg), QualityPolicy::High)
    }

    pub fn naver() -> Self {
        Self::new("naver", 690, Some(OutputFormat::Jpeg), QualityPolicy::High)
    }

    pub fn kakao() -> Self {
        Self::new("kakao", 720, Some(OutputFormat::Jpeg), QualityPolicy::High)
    }

    pub fn lezhin() -> Self {
        Self::new("lezhin", 900, Some(OutputFormat::Jpeg), QualityPolicy::High)
    }

    /// Archive copies keep the caller's format and are only width-capped.
    pub fn archive() -> Self {
        Self::new("archive", 1600, None, QualityPolicy::Lossless)
    }

    /// Lossy preferred formats win over the caller's choice.
    pub fn resolve(&self, format: OutputFormat, quality: QualityPolicy) -> (OutputFormat, QualityPolicy) {
        match self.preferred_format {
            Some(OutputFormat::Jpeg) => (OutputFormat::Jpeg, self.default_quality),
            _ => (format, quality),
        }
    }
}

// =============================================================================
// CUT PLAN
// =============================================================================

/// Validated, strictly ascending row offsets inside `(0, height)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CutPlan {
    offsets: Vec<u32>,
    height: u32,
}

impl CutPlan {
    /// Sorts and de-duplicates `offsets`, then rejects any offset outside
    /// `(0, height)`. Out-of-range offsets are an error, never clamped.
    pub fn new(offsets: impl IntoIterator<Item = i64>, height: u32) -> Result<Self> {
        let mut sorted: Vec<i64> = offsets.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();

        if let Some(bad) = sorted
            .iter()
            .find(|&&offset| offset <= 0 || offset >= height as i64)
        {
            return Err(SlicerError::invalid_cut_plan(
                height,
                format!("offset {bad} is outside (0, {height})"),
            ));
        }

        Ok(Self {
            offsets: sorted.into_iter().map(|o| o as u32).collect(),
            height,
        })
    }

    /// Cut every `interval` rows: `interval, 2*interval, ...` below `height`.
    pub fn every(interval: u32, height: u32) -> Result<Self> {
        if interval == 0 {
            return Err(SlicerError::invalid_cut_plan(height, "interval must be positive"));
        }
        if interval >= height {
            return Err(SlicerError::invalid_cut_plan(
                height,
                format!("interval {interval} is not smaller than the image height"),
            ));
        }
        let offsets = (1..)
            .map(|i: u64| i * interval as u64)
            .take_while(|&y| y < height as u64)
            .map(|y| y as i64);
        Self::new(offsets, height)
    }

    /// `count` cut lines spaced `height / (count + 1)` apart.
    pub fn equal_parts(count: u32, height: u32) -> Result<Self> {
        if count == 0 {
            return Err(SlicerError::invalid_cut_plan(height, "cut count must be positive"));
        }
        let step = height / (count + 1);
        if step == 0 {
            return Err(SlicerError::invalid_cut_plan(
                height,
                format!("{count} cuts do not fit in {height} rows"),
            ));
        }
        Self::new((1..=count).map(|i| (i * step) as i64), height)
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// `[0] + offsets + [height]`
    pub fn boundaries(&self) -> Vec<u32> {
        let mut seq = Vec::with_capacity(self.offsets.len() + 2);
        seq.push(0);
        seq.extend_from_slice(&self.offsets);
        seq.push(self.height);
        seq
    }

    /// Half-open row ranges `[a, b)` of every slice, top to bottom.
    pub fn slices(&self) -> Vec<(u32, u32)> {
        self.boundaries().windows(2).map(|w| (w[0], w[1])).collect()
    }

    pub fn slice_count(&self) -> usize {
        self.offsets.len() + 1
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Where the cut offsets of a split come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CutSpec {
    /// Explicit offsets; normalized against the decoded height.
    At(Vec<i64>),
    /// Fixed interval in rows.
    Every(u32),
    /// Number of evenly spaced cut lines.
    Parts(u32),
}

impl CutSpec {
    pub fn plan(&self, height: u32) -> Result<CutPlan> {
        match self {
            Self::At(offsets) => CutPlan::new(offsets.iter().copied(), height),
            Self::Every(interval) => CutPlan::every(*interval, height),
            Self::Parts(count) => CutPlan::equal_parts(*count, height),
        }
    }
}

pub const DEFAULT_INDEX_DIGITS: usize = 3;
pub const MIN_INDEX_DIGITS: usize = 2;
pub const MAX_INDEX_DIGITS: usize = 5;

#[derive(Clone, Debug)]
pub struct SplitRequest {
    pub source: PathBuf,
    pub cuts: CutSpec,
    pub output_dir: PathBuf,
    pub quality: QualityPolicy,
    /// 0 for the first run; later runs embed `_vNNN_` in slice names.
    pub sequence_version: u32,
    pub format: OutputFormat,
    pub platform: Option<PlatformSpec>,
    /// Overrides the source stem; sanitized before use.
    pub base_name: Option<String>,
    pub digits: usize,
}

impl SplitRequest {
    pub fn new(source: impl Into<PathBuf>, cuts: CutSpec, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            cuts,
            output_dir: output_dir.into(),
            quality: QualityPolicy::default(),
            sequence_version: 0,
            format: OutputFormat::default(),
            platform: None,
            base_name: None,
            digits: DEFAULT_INDEX_DIGITS,
        }
    }
}

/// One merge invocation. Consumed by `merge`.
#[derive(Clone, Debug)]
pub struct MergeTask {
    pub files: Vec<PathBuf>,
    pub output_path: PathBuf,
    pub quality: QualityPolicy,
    pub platform: Option<PlatformSpec>,
    pub format: OutputFormat,
}

impl MergeTask {
    pub fn new(files: Vec<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            files,
            output_path: output_path.into(),
            quality: QualityPolicy::default(),
            platform: None,
            format: OutputFormat::default(),
        }
    }
}

/// Resampling filter for batch resize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ResampleFilter {
    /// High quality (slow)
    #[default]
    Lanczos3,
    /// Standard (bicubic)
    CatmullRom,
    /// Fast
    Bilinear,
}

impl FromStr for ResampleFilter {
    type Err = SlicerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "lanczos" | "lanczos3" | "high" => Ok(Self::Lanczos3),
            "bicubic" | "catmullrom" | "standard" => Ok(Self::CatmullRom),
            "bilinear" | "fast" => Ok(Self::Bilinear),
            other => Err(SlicerError::invalid_argument(
                "filter",
                other.to_string(),
                "expected lanczos, bicubic or bilinear",
            )),
        }
    }
}

pub const MIN_RESIZE_WIDTH: u32 = 100;
pub const MAX_RESIZE_WIDTH: u32 = 5000;

#[derive(Clone, Debug)]
pub struct ResizeRequest {
    pub files: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub target_width: u32,
    pub quality: QualityPolicy,
    pub format: OutputFormat,
    pub filter: ResampleFilter,
    /// Append `_{width}px` to output names.
    pub add_width_suffix: bool,
}

impl ResizeRequest {
    pub fn new(files: Vec<PathBuf>, output_dir: impl Into<PathBuf>, target_width: u32) -> Self {
        Self {
            files,
            output_dir: output_dir.into(),
            target_width,
            quality: QualityPolicy::default(),
            format: OutputFormat::default(),
            filter: ResampleFilter::default(),
            add_width_suffix: false,
        }
    }
}
