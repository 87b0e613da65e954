// src/engine/psd.rs
//
// Layered document (PSD/PSB) flattening. Strategies are tried in order and the
// first success wins; when all of them fail, every failure is reported.

use crate::engine::common::run_with_panic_policy;
use crate::error::{Result, SlicerError};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use std::path::Path;

pub type StrategyResult = std::result::Result<DynamicImage, String>;

/// One named way of turning document bytes into a flat image.
pub struct FlattenStrategy {
    pub name: &'static str,
    run: fn(&[u8]) -> StrategyResult,
}

/// Ordered strategy list: composite the visible layers, then the stored
/// merged composite through the `psd` crate, then our own reader of the
/// merged image-data section (the only one that understands PSB).
pub const FLATTEN_STRATEGIES: &[FlattenStrategy] = &[
    FlattenStrategy {
        name: "layer-compose",
        run: compose_visible_layers,
    },
    FlattenStrategy {
        name: "merged-composite",
        run: merged_composite,
    },
    FlattenStrategy {
        name: "image-data",
        run: read_image_data,
    },
];

pub fn flatten(path: &Path, bytes: &[u8]) -> Result<DynamicImage> {
    flatten_with(path, bytes, FLATTEN_STRATEGIES)
}

pub(crate) fn flatten_with(
    path: &Path,
    bytes: &[u8],
    strategies: &[FlattenStrategy],
) -> Result<DynamicImage> {
    let mut failures = Vec::with_capacity(strategies.len());

    for strategy in strategies {
        let outcome = run_with_panic_policy(
            "decode:psd",
            |msg| SlicerError::decode_failed(path, msg),
            || (strategy.run)(bytes).map_err(|reason| SlicerError::decode_failed(path, reason)),
        );
        match outcome {
            Ok(img) => {
                tracing::debug!(
                    path = %path.display(),
                    strategy = strategy.name,
                    skipped = failures.len(),
                    "flattened layered document"
                );
                return Ok(img);
            }
            Err(SlicerError::DecodeFailed { message, .. }) => {
                tracing::debug!(strategy = strategy.name, %message, "flatten strategy failed");
                failures.push(format!("{}: {message}", strategy.name));
            }
            Err(other) => return Err(other),
        }
    }

    Err(SlicerError::decode_failed(
        path,
        format!("no flattening strategy succeeded ({})", failures.join("; ")),
    ))
}

fn rgba_from_raw(width: u32, height: u32, buf: Vec<u8>) -> StrategyResult {
    RgbaImage::from_raw(width, height, buf)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| "composite buffer does not match document size".to_string())
}

fn compose_visible_layers(bytes: &[u8]) -> StrategyResult {
    let doc = psd::Psd::from_bytes(bytes).map_err(|e| format!("{e:?}"))?;
    if !doc.layers().iter().any(|layer| layer.visible()) {
        return Err("no visible layers".to_string());
    }
    let buf = doc
        .flatten_layers_rgba(&|(_, layer)| layer.visible())
        .map_err(|e| format!("{e:?}"))?;
    rgba_from_raw(doc.width(), doc.height(), buf)
}

fn merged_composite(bytes: &[u8]) -> StrategyResult {
    let doc = psd::Psd::from_bytes(bytes).map_err(|e| format!("{e:?}"))?;
    rgba_from_raw(doc.width(), doc.height(), doc.rgba())
}

// =============================================================================
// IMAGE-DATA SECTION READER
// =============================================================================

const COLOR_MODE_GRAYSCALE: u16 = 1;
const COLOR_MODE_RGB: u16 = 3;

/// Fixed 26-byte file header shared by PSD and PSB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PsdHeader {
    /// 1 for PSD, 2 for PSB
    pub version: u16,
    pub channels: u16,
    pub height: u32,
    pub width: u32,
    pub depth: u16,
    pub color_mode: u16,
}

impl PsdHeader {
    pub const LEN: usize = 26;

    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < Self::LEN {
            return Err("truncated header".to_string());
        }
        if &bytes[0..4] != b"8BPS" {
            return Err("missing 8BPS signature".to_string());
        }
        let mut r = Reader::new(bytes, 4);
        let version = r.u16()?;
        if version != 1 && version != 2 {
            return Err(format!("unknown version {version}"));
        }
        r.skip(6)?;
        let header = Self {
            version,
            channels: r.u16()?,
            height: r.u32()?,
            width: r.u32()?,
            depth: r.u16()?,
            color_mode: r.u16()?,
        };

        let max_side = if header.is_large() { 300_000 } else { 30_000 };
        if header.width == 0 || header.height == 0 {
            return Err("zero-sized document".to_string());
        }
        if header.width > max_side || header.height > max_side {
            return Err(format!(
                "dimensions {}x{} exceed the format maximum {max_side}",
                header.width, header.height
            ));
        }
        if header.channels == 0 || header.channels > 56 {
            return Err(format!("invalid channel count {}", header.channels));
        }
        Ok(header)
    }

    pub fn is_large(&self) -> bool {
        self.version == 2
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| format!("unexpected end of data at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> std::result::Result<(), String> {
        self.take(n).map(|_| ())
    }

    fn u16(&mut self) -> std::result::Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn skip_section(&mut self, wide: bool) -> std::result::Result<(), String> {
        let len = if wide { self.u64()? } else { self.u32()? as u64 };
        let len = usize::try_from(len).map_err(|_| "section length overflow".to_string())?;
        self.skip(len)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

/// Decode one PackBits row into `dst`, which must be filled exactly.
pub(crate) fn unpack_bits(src: &[u8], dst: &mut [u8]) -> std::result::Result<(), String> {
    let mut i = 0;
    let mut o = 0;
    while o < dst.len() {
        let header = *src.get(i).ok_or("packbits: truncated run header")? as i8;
        i += 1;
        match header {
            -128 => {}
            n if n >= 0 => {
                let len = n as usize + 1;
                let literal = src.get(i..i + len).ok_or("packbits: truncated literal run")?;
                dst.get_mut(o..o + len)
                    .ok_or("packbits: row overrun")?
                    .copy_from_slice(literal);
                i += len;
                o += len;
            }
            n => {
                let len = (1 - n as isize) as usize;
                let value = *src.get(i).ok_or("packbits: truncated repeat run")?;
                i += 1;
                dst.get_mut(o..o + len)
                    .ok_or("packbits: row overrun")?
                    .fill(value);
                o += len;
            }
        }
    }
    Ok(())
}

/// Read the merged composite from the image-data section directly.
///
/// Supports 8-bit Grayscale and RGB documents, raw or PackBits compressed,
/// in both PSD and PSB layouts. A channel beyond the colour channels is
/// treated as alpha.
pub fn read_image_data(bytes: &[u8]) -> StrategyResult {
    let header = PsdHeader::parse(bytes)?;
    if header.depth != 8 {
        return Err(format!("unsupported bit depth {}", header.depth));
    }
    let color_channels = match header.color_mode {
        COLOR_MODE_GRAYSCALE => 1usize,
        COLOR_MODE_RGB => 3,
        other => return Err(format!("unsupported color mode {other}")),
    };
    let total_channels = header.channels as usize;
    if total_channels < color_channels {
        return Err(format!(
            "{total_channels} channels is too few for color mode {}",
            header.color_mode
        ));
    }
    let has_alpha = total_channels > color_channels;
    let needed = color_channels + has_alpha as usize;

    let mut r = Reader::new(bytes, PsdHeader::LEN);
    r.skip_section(false)?; // color mode data
    r.skip_section(false)?; // image resources
    r.skip_section(header.is_large())?; // layer and mask information
    let compression = r.u16()?;

    let width = header.width as usize;
    let height = header.height as usize;
    let plane_len = width
        .checked_mul(height)
        .ok_or_else(|| "plane size overflow".to_string())?;

    let planes: Vec<Vec<u8>> = match compression {
        0 => {
            let data = r.rest();
            if data.len() / plane_len < needed {
                return Err(format!(
                    "raw image data holds {} bytes, expected at least {}",
                    data.len(),
                    plane_len * needed
                ));
            }
            data.chunks_exact(plane_len).take(needed).map(<[u8]>::to_vec).collect()
        }
        1 => read_rle_planes(&mut r, &header, needed, width, height)?,
        other => return Err(format!("unsupported compression {other}")),
    };

    interleave(header.width, header.height, &planes, color_channels, has_alpha)
}

fn read_rle_planes(
    r: &mut Reader<'_>,
    header: &PsdHeader,
    needed: usize,
    width: usize,
    height: usize,
) -> std::result::Result<Vec<Vec<u8>>, String> {
    let rows = header.channels as usize * height;
    let mut counts = Vec::with_capacity(rows.min(r.rest().len() / 2));
    for _ in 0..rows {
        let count = if header.is_large() { r.u32()? as usize } else { r.u16()? as usize };
        counts.push(count);
    }

    // A PackBits row needs at least 2 bytes per 128 output bytes.
    let min_row = 2 * width.div_ceil(128);
    let needed_rows = needed * height;
    if counts[..needed_rows].iter().any(|&c| c < min_row) {
        return Err("rle row too short for document width".to_string());
    }
    let compressed: usize = counts[..needed_rows].iter().sum();
    if compressed > r.rest().len() {
        return Err(format!(
            "rle data holds {} bytes, rows need {compressed}",
            r.rest().len()
        ));
    }

    let mut planes = Vec::with_capacity(needed);
    for channel in 0..needed {
        let mut plane = vec![0u8; width * height];
        for (row, dst) in plane.chunks_exact_mut(width).enumerate() {
            let src = r.take(counts[channel * height + row])?;
            unpack_bits(src, dst).map_err(|e| format!("channel {channel} row {row}: {e}"))?;
        }
        planes.push(plane);
    }
    Ok(planes)
}

fn interleave(
    width: u32,
    height: u32,
    planes: &[Vec<u8>],
    color_channels: usize,
    has_alpha: bool,
) -> StrategyResult {
    let n = width as usize * height as usize;
    let built = match (color_channels, has_alpha) {
        (1, false) => GrayImage::from_raw(width, height, planes[0].clone()).map(DynamicImage::ImageLuma8),
        (1, true) => {
            let mut buf = Vec::with_capacity(n * 4);
            for (&v, &a) in planes[0].iter().zip(&planes[1]) {
                buf.extend_from_slice(&[v, v, v, a]);
            }
            RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
        }
        (_, false) => {
            let mut buf = Vec::with_capacity(n * 3);
            for i in 0..n {
                buf.extend_from_slice(&[planes[0][i], planes[1][i], planes[2][i]]);
            }
            RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8)
        }
        (_, true) => {
            let mut buf = Vec::with_capacity(n * 4);
            for i in 0..n {
                buf.extend_from_slice(&[planes[0][i], planes[1][i], planes[2][i], planes[3][i]]);
            }
            RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
        }
    };
    built.ok_or_else(|| "image data does not match document size".to_string())
}
