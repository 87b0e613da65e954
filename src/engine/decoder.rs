// src/engine/decoder.rs
//
// Decoder operations: JPEG (mozjpeg), PNG (zune-png), WebP (libwebp), layered
// documents (engine::psd), with the image crate as fallback. Every path
// checks the configured ceilings before pixels are materialised.

use crate::engine::common::run_with_panic_policy;
use crate::engine::io::{check_input, extract_dpi, map_file, SourceFormat};
use crate::engine::limits::EngineLimits;
use crate::engine::pipeline;
use crate::engine::psd::{self, PsdHeader};
use crate::error::{Result, SlicerError};
use crate::ops::ResampleFilter;
use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageReader, RgbImage, RgbaImage};
use mozjpeg::Decompress;
use std::io::Cursor;
use std::path::Path;
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::bytestream::ZCursor;
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

/// Pixel layouts an [`ImageHandle`] can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorMode {
    Grayscale,
    Rgb,
    Rgba,
}

impl ColorMode {
    pub fn channels(self) -> u64 {
        match self {
            Self::Grayscale => 1,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

/// Exclusively owned decoded raster.
///
/// Not `Clone`: copies are explicit through [`ImageHandle::duplicate`] so
/// that every large allocation is visible at the call site.
#[derive(Debug)]
pub struct ImageHandle {
    image: DynamicImage,
    dpi: Option<(u32, u32)>,
}

impl ImageHandle {
    /// Wrap `image`, normalising exotic layouts to Luma8, Rgb8 or Rgba8.
    pub fn new(image: DynamicImage) -> Self {
        let image = match image {
            img @ (DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageRgba8(_)) => img,
            other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
            other if other.color().has_color() => DynamicImage::ImageRgb8(other.to_rgb8()),
            other => DynamicImage::ImageLuma8(other.to_luma8()),
        };
        Self { image, dpi: None }
    }

    pub fn with_dpi(mut self, dpi: Option<(u32, u32)>) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn mode(&self) -> ColorMode {
        match self.image {
            DynamicImage::ImageLuma8(_) => ColorMode::Grayscale,
            DynamicImage::ImageRgba8(_) => ColorMode::Rgba,
            _ => ColorMode::Rgb,
        }
    }

    pub fn dpi(&self) -> Option<(u32, u32)> {
        self.dpi
    }

    /// Footprint used for cache accounting: `width * height * channels * 4`.
    pub fn estimated_bytes(&self) -> u64 {
        self.width() as u64 * self.height() as u64 * self.mode().channels() * 4
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }

    /// Independent deep copy.
    pub fn duplicate(&self) -> Self {
        Self {
            image: self.image.clone(),
            dpi: self.dpi,
        }
    }

    /// Drop the pixel buffer now.
    pub fn release(self) {
        drop(self);
    }

    fn thumbnail(self, max_side: u32) -> Result<Self> {
        let (w, h) = pipeline::fit_within(self.width(), self.height(), max_side);
        if (w, h) == (self.width(), self.height()) {
            return Ok(self);
        }
        let dpi = self.dpi;
        let image = pipeline::resize_exact(self.image, w, h, ResampleFilter::Lanczos3)?;
        Ok(Self { image, dpi })
    }
}

/// Decode `path` into an owned raster.
///
/// With `max_dimension`, the result is downsampled so its larger side equals
/// that value (floor rounding); smaller images are returned as decoded.
pub fn decode(path: &Path, max_dimension: Option<u32>, limits: &EngineLimits) -> Result<ImageHandle> {
    let len = check_input(path)?;
    let format = SourceFormat::from_path(path)?;
    limits.enforce_file_size(path, len)?;

    let context = path.display().to_string();
    let (image, dpi) = {
        let map = map_file(path)?;
        let bytes: &[u8] = &map;
        if !format.matches_magic(bytes) {
            return Err(SlicerError::decode_failed(
                path,
                format!("content does not look like {}", format.as_str()),
            ));
        }

        let (width, height) = header_dimensions(path, format, bytes)?;
        limits.enforce_decoded(&context, width, height)?;

        let image = match format {
            SourceFormat::Psd | SourceFormat::Psb => psd::flatten(path, bytes)?,
            raster => decode_raster(path, raster, bytes, limits)?,
        };
        let dpi = if format.is_layered() { None } else { extract_dpi(bytes) };
        (image, dpi)
    };

    limits.enforce_decoded(&context, image.width(), image.height())?;
    tracing::debug!(
        path = %path.display(),
        format = format.as_str(),
        width = image.width(),
        height = image.height(),
        "decoded"
    );

    let handle = ImageHandle::new(image).with_dpi(dpi);
    match max_dimension {
        Some(max_side) if max_side > 0 => handle.thumbnail(max_side),
        _ => Ok(handle),
    }
}

/// Primary codec for a raster format, retried through the image crate when
/// the primary codec rejects the stream.
fn decode_raster(path: &Path, format: SourceFormat, bytes: &[u8], limits: &EngineLimits) -> Result<DynamicImage> {
    let primary = match format {
        SourceFormat::Jpeg => decode_jpeg_mozjpeg(path, bytes),
        SourceFormat::Png => decode_png_zune(path, bytes, limits),
        _ => decode_webp_libwebp(path, bytes, limits),
    };
    let message = match primary {
        Err(SlicerError::DecodeFailed { message, .. }) => message,
        other => return other,
    };

    tracing::debug!(
        path = %path.display(),
        format = format.as_str(),
        reason = %message,
        "primary decoder failed, retrying with image crate"
    );
    decode_with_image_crate(path, bytes, limits).map_err(|fallback| match fallback {
        SlicerError::DecodeFailed { message: second, .. } => {
            SlicerError::decode_failed(path, format!("{message}; fallback: {second}"))
        }
        other => other,
    })
}

/// Dimensions from the container header, without decoding pixels.
fn header_dimensions(path: &Path, format: SourceFormat, bytes: &[u8]) -> Result<(u32, u32)> {
    if format.is_layered() {
        let header = PsdHeader::parse(bytes).map_err(|reason| SlicerError::decode_failed(path, reason))?;
        return Ok((header.width, header.height));
    }
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| SlicerError::input_unreadable(path, e.to_string()))?
        .into_dimensions()
        .map_err(|e| SlicerError::decode_failed(path, format!("header: {e}")))
}

/// JPEG through mozjpeg (libjpeg-turbo).
pub fn decode_jpeg_mozjpeg(path: &Path, data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy(
        "decode:mozjpeg",
        |msg| SlicerError::decode_failed(path, msg),
        || {
            if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
                return Err(SlicerError::decode_failed(path, "mozjpeg: missing JPEG EOI marker"));
            }

            let decompress = Decompress::new_mem(data).map_err(|e| {
                SlicerError::decode_failed(path, format!("mozjpeg decompress init failed: {e:?}"))
            })?;
            let mut decompress = decompress.rgb().map_err(|e| {
                SlicerError::decode_failed(path, format!("mozjpeg rgb conversion failed: {e:?}"))
            })?;

            let width = decompress.width() as u32;
            let height = decompress.height() as u32;

            let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
                SlicerError::decode_failed(path, format!("mozjpeg: failed to read scanlines: {e:?}"))
            })?;
            let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

            RgbImage::from_raw(width, height, flat_pixels)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| {
                    SlicerError::decode_failed(path, "mozjpeg: failed to create image from raw data")
                })
        },
    )
}

/// PNG through zune-png; 16-bit input is stripped to 8-bit.
pub fn decode_png_zune(path: &Path, data: &[u8], limits: &EngineLimits) -> Result<DynamicImage> {
    run_with_panic_policy(
        "decode:png",
        |msg| SlicerError::decode_failed(path, msg),
        || {
            // zune caps each side at 16384 by default; strips are far taller.
            let max_side = limits.max_pixels.min(usize::MAX as u64) as usize;
            let options = DecoderOptions::default()
                .png_set_strip_to_8bit(true)
                .set_max_width(max_side)
                .set_max_height(max_side);
            let mut decoder = PngDecoder::new_with_options(ZCursor::new(data), options);
            let pixels = decoder
                .decode()
                .map_err(|e| SlicerError::decode_failed(path, format!("png: decode failed: {e:?}")))?;

            let info = decoder
                .info()
                .ok_or_else(|| SlicerError::decode_failed(path, "png: missing header info"))?;
            let width = info.width as u32;
            let height = info.height as u32;

            let buf = match pixels {
                zune_core::result::DecodingResult::U8(v) => v,
                _ => {
                    return Err(SlicerError::decode_failed(
                        path,
                        "png: unexpected non-U8 pixel buffer",
                    ))
                }
            };

            let colorspace = decoder
                .colorspace()
                .ok_or_else(|| SlicerError::decode_failed(path, "png: missing colorspace"))?;

            let built = match colorspace {
                ColorSpace::RGB => RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8),
                ColorSpace::RGBA => RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8),
                ColorSpace::Luma => GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8),
                ColorSpace::LumaA => {
                    GrayAlphaImage::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
                }
                other => {
                    return Err(SlicerError::decode_failed(
                        path,
                        format!("png: unsupported colorspace {other:?}"),
                    ))
                }
            };
            built.ok_or_else(|| {
                SlicerError::decode_failed(path, "png: pixel buffer does not match header")
            })
        },
    )
}

/// WebP through libwebp. Animated files go through the image crate.
pub fn decode_webp_libwebp(path: &Path, data: &[u8], limits: &EngineLimits) -> Result<DynamicImage> {
    let features = BitstreamFeatures::new(data)
        .ok_or_else(|| SlicerError::decode_failed(path, "webp: failed to read bitstream features"))?;
    if features.has_animation() {
        return decode_with_image_crate(path, data, limits);
    }

    run_with_panic_policy(
        "decode:webp",
        |msg| SlicerError::decode_failed(path, msg),
        || {
            let decoded = WebPDecoder::new(data)
                .decode()
                .ok_or_else(|| SlicerError::decode_failed(path, "webp: decode failed"))?;
            Ok(decoded.to_image())
        },
    )
}

/// Generic fallback through the image crate, with our ceilings in place of
/// the crate's default 512 MiB allocation cap.
pub fn decode_with_image_crate(path: &Path, data: &[u8], limits: &EngineLimits) -> Result<DynamicImage> {
    run_with_panic_policy(
        "decode:image",
        |msg| SlicerError::decode_failed(path, msg),
        || {
            let mut reader = ImageReader::new(Cursor::new(data))
                .with_guessed_format()
                .map_err(|e| SlicerError::input_unreadable(path, e.to_string()))?;
            let mut crate_limits = image::Limits::default();
            crate_limits.max_image_width = None;
            crate_limits.max_image_height = None;
            crate_limits.max_alloc = Some(limits.decode_memory_limit);
            reader.limits(crate_limits);
            reader
                .decode()
                .map_err(|e| SlicerError::decode_failed(path, format!("decode failed: {e}")))
        },
    )
}
