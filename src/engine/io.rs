// src/engine/io.rs
//
// I/O operations: input checks, source format tags, header-only descriptors,
// output naming, directory write checks and DPI metadata extraction

use crate::engine::psd::PsdHeader;
use crate::error::{Result, SlicerError};
use img_parts::{jpeg::Jpeg, png::Png, Bytes};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Extensions accepted as input, lowercase and without the dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "psd", "psb"];

/// Name of the file written and removed by [`ensure_writable_dir`].
pub const WRITE_CHECK_NAME: &str = ".write_test";

const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_MERGE_NAME_LEN: usize = 200;
const DEFAULT_SLICE_BASE: &str = "image";
const DEFAULT_MERGE_BASE: &str = "merged_images";

/// Closed set of decodable source formats, chosen once per file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Png,
    Jpeg,
    WebP,
    /// Layered document, version 1
    Psd,
    /// Large layered document, version 2
    Psb,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::WebP),
            "psd" => Ok(Self::Psd),
            "psb" => Ok(Self::Psb),
            "" => Err(SlicerError::input_unreadable(
                path,
                "unsupported format: missing file extension",
            )),
            other => Err(SlicerError::input_unreadable(
                path,
                format!("unsupported format '.{other}'"),
            )),
        }
    }

    pub fn is_layered(self) -> bool {
        matches!(self, Self::Psd | Self::Psb)
    }

    /// Whether `bytes` starts with this format's signature.
    pub fn matches_magic(self, bytes: &[u8]) -> bool {
        match self {
            Self::Png => bytes.starts_with(b"\x89PNG\r\n\x1a\n"),
            Self::Jpeg => bytes.starts_with(&[0xFF, 0xD8, 0xFF]),
            Self::WebP => bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP",
            Self::Psd | Self::Psb => bytes.starts_with(b"8BPS"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::WebP => "webp",
            Self::Psd => "psd",
            Self::Psb => "psb",
        }
    }
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Dimensions and size of a source, read from headers only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub format: SourceFormat,
}

impl ImageDescriptor {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Existence and regular-file checks. Returns the file length.
pub fn check_input(path: &Path) -> Result<u64> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SlicerError::input_not_found(path))
        }
        Err(e) => return Err(SlicerError::input_unreadable(path, e.to_string())),
    };
    if !meta.is_file() {
        return Err(SlicerError::input_unreadable(path, "not a regular file"));
    }
    if meta.len() == 0 {
        return Err(SlicerError::input_unreadable(path, "file is empty"));
    }
    Ok(meta.len())
}

/// Memory-map a source file for decoding.
pub fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| open_error(path, e))?;
    // Safety: sources are treated as read-only for the lifetime of the map.
    // A file truncated by another process while mapped can fault; callers
    // drop the map before returning.
    unsafe { Mmap::map(&file) }.map_err(|e| SlicerError::input_unreadable(path, e.to_string()))
}

fn open_error(path: &Path, e: io::Error) -> SlicerError {
    if e.kind() == io::ErrorKind::NotFound {
        SlicerError::input_not_found(path)
    } else {
        SlicerError::input_unreadable(path, e.to_string())
    }
}

/// Read dimensions without decoding pixels.
pub fn inspect(path: &Path) -> Result<ImageDescriptor> {
    let byte_size = check_input(path)?;
    let format = SourceFormat::from_path(path)?;

    let (width, height) = if format.is_layered() {
        let mut head = [0u8; PsdHeader::LEN];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut head))
            .map_err(|e| open_error(path, e))?;
        let header = PsdHeader::parse(&head).map_err(|reason| SlicerError::decode_failed(path, reason))?;
        (header.width, header.height)
    } else {
        let mut head = [0u8; 16];
        let read = File::open(path)
            .and_then(|mut f| f.read(&mut head))
            .map_err(|e| open_error(path, e))?;
        if !format.matches_magic(&head[..read]) {
            return Err(SlicerError::decode_failed(
                path,
                format!("content does not look like {}", format.as_str()),
            ));
        }
        image::ImageReader::open(path)
            .map_err(|e| open_error(path, e))?
            .with_guessed_format()
            .map_err(|e| SlicerError::input_unreadable(path, e.to_string()))?
            .into_dimensions()
            .map_err(|e| SlicerError::decode_failed(path, format!("header: {e}")))?
    };

    Ok(ImageDescriptor {
        path: path.to_path_buf(),
        width,
        height,
        byte_size,
        format,
    })
}

// =============================================================================
// OUTPUT NAMING
// =============================================================================

fn replace_forbidden(name: &str) -> String {
    name.chars()
        .map(|c| {
            if FORBIDDEN_NAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Base name for slice files. Spaces become underscores; `fallback` is used
/// when nothing printable survives.
pub fn sanitize_slice_base(name: &str, fallback: &str) -> String {
    let replaced = replace_forbidden(name).replace(' ', "_");
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.' || c == '_');
    if !trimmed.is_empty() {
        trimmed.to_string()
    } else if !fallback.is_empty() {
        fallback.to_string()
    } else {
        DEFAULT_SLICE_BASE.to_string()
    }
}

/// Base name for merge output. Spaces are kept; capped at 200 characters.
pub fn sanitize_merge_base(name: &str) -> String {
    let replaced = replace_forbidden(name);
    let trimmed = replaced.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return DEFAULT_MERGE_BASE.to_string();
    }
    let capped: String = trimmed.chars().take(MAX_MERGE_NAME_LEN).collect();
    let capped = capped.trim_end_matches(|c| c == ' ' || c == '.');
    if capped.is_empty() {
        DEFAULT_MERGE_BASE.to_string()
    } else {
        capped.to_string()
    }
}

/// `path` if free, otherwise the first free `{stem}_NNN.{ext}` sibling.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    (1u32..)
        .map(|n| parent.join(format!("{stem}_{n:03}{ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Create `dir` (with parents) and prove it accepts writes.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| SlicerError::output_unwritable(dir, e))?;
    let marker = dir.join(WRITE_CHECK_NAME);
    fs::write(&marker, b"test").map_err(|e| SlicerError::output_unwritable(dir, e))?;
    fs::remove_file(&marker).map_err(|e| SlicerError::output_unwritable(dir, e))?;
    Ok(())
}

// =============================================================================
// DPI METADATA
// =============================================================================

const METERS_PER_INCH: f64 = 0.0254;

/// Horizontal and vertical resolution from PNG `pHYs` or JPEG JFIF density.
pub fn extract_dpi(data: &[u8]) -> Option<(u32, u32)> {
    if SourceFormat::Png.matches_magic(data) {
        extract_dpi_from_png(data)
    } else if SourceFormat::Jpeg.matches_magic(data) {
        extract_dpi_from_jpeg(data)
    } else {
        None
    }
}

pub(crate) fn extract_dpi_from_png(data: &[u8]) -> Option<(u32, u32)> {
    let png = Png::from_bytes(Bytes::copy_from_slice(data)).ok()?;
    let chunk = png.chunk_by_type(*b"pHYs")?;
    let body = chunk.contents();
    if body.len() < 9 || body[8] != 1 {
        return None;
    }
    let x = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let y = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    let to_dpi = |ppm: u32| (ppm as f64 * METERS_PER_INCH).round() as u32;
    Some((to_dpi(x), to_dpi(y))).filter(|(x, y)| *x > 0 && *y > 0)
}

pub(crate) fn extract_dpi_from_jpeg(data: &[u8]) -> Option<(u32, u32)> {
    use img_parts::jpeg::markers::APP0;

    let jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(data)).ok()?;
    let segment = jpeg
        .segments()
        .iter()
        .find(|s| s.marker() == APP0 && s.contents().starts_with(b"JFIF\0"))?;
    let body = segment.contents();
    if body.len() < 12 {
        return None;
    }
    let x = u16::from_be_bytes([body[8], body[9]]) as u32;
    let y = u16::from_be_bytes([body[10], body[11]]) as u32;
    let (x, y) = match body[7] {
        1 => (x, y),
        2 => (
            (x as f64 * 2.54).round() as u32,
            (y as f64 * 2.54).round() as u32,
        ),
        _ => return None,
    };
    Some((x, y)).filter(|(x, y)| *x > 0 && *y > 0)
}
