// src/engine/pipeline.rs
//
// Pixel operations used by every workflow: resize (fast_image_resize with an
// image crate fallback), row crops, colour mode conversion and pasting into a
// vertical composite.

use crate::engine::decoder::ColorMode;
use crate::error::{Result, SlicerError};
use crate::ops::ResampleFilter;
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Rgb, RgbImage, Rgba, RgbaImage};

#[derive(Debug)]
pub struct ResizeError {
    pub source_dims: (u32, u32),
    pub target_dims: (u32, u32),
    pub reason: String,
}

impl ResizeError {
    pub fn new(
        source_dims: (u32, u32),
        target_dims: (u32, u32),
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source_dims,
            target_dims,
            reason: reason.into(),
        }
    }

    pub fn into_slicer_error(self) -> SlicerError {
        SlicerError::encode_failed(
            "resize",
            format!(
                "{}x{} -> {}x{}: {}",
                self.source_dims.0,
                self.source_dims.1,
                self.target_dims.0,
                self.target_dims.1,
                self.reason
            ),
        )
    }
}

/// Height after scaling `width x height` to `target_width`, rounded down,
/// never below one row.
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return height.max(1);
    }
    ((height as u64 * target_width as u64) / width as u64).max(1) as u32
}

/// Dimensions whose larger side equals `max_side`, floor rounding.
/// Returns the input unchanged when it already fits.
pub fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let larger = width.max(height);
    if larger <= max_side || larger == 0 {
        return (width, height);
    }
    let scale = |v: u32| ((v as u64 * max_side as u64) / larger as u64).max(1) as u32;
    (scale(width), scale(height))
}

fn fir_filter(filter: ResampleFilter) -> fir::FilterType {
    match filter {
        ResampleFilter::Lanczos3 => fir::FilterType::Lanczos3,
        ResampleFilter::CatmullRom => fir::FilterType::CatmullRom,
        ResampleFilter::Bilinear => fir::FilterType::Bilinear,
    }
}

fn image_filter(filter: ResampleFilter) -> FilterType {
    match filter {
        ResampleFilter::Lanczos3 => FilterType::Lanczos3,
        ResampleFilter::CatmullRom => FilterType::CatmullRom,
        ResampleFilter::Bilinear => FilterType::Triangle,
    }
}

/// Resize to exactly `dst_width x dst_height`, keeping the pixel layout.
pub fn resize_exact(
    img: DynamicImage,
    dst_width: u32,
    dst_height: u32,
    filter: ResampleFilter,
) -> Result<DynamicImage> {
    if img.width() == dst_width && img.height() == dst_height {
        return Ok(img);
    }
    fast_resize_owned(img, dst_width, dst_height, filter).map_err(ResizeError::into_slicer_error)
}

/// Downscale to `max_width` when wider; narrower images pass through.
pub fn shrink_to_width(img: DynamicImage, max_width: u32, filter: ResampleFilter) -> Result<DynamicImage> {
    if img.width() <= max_width {
        return Ok(img);
    }
    let height = scaled_height(img.width(), img.height(), max_width);
    resize_exact(img, max_width, height, filter)
}

/// Scale to `target_width` in either direction.
pub fn scale_to_width(img: DynamicImage, target_width: u32, filter: ResampleFilter) -> Result<DynamicImage> {
    let height = scaled_height(img.width(), img.height(), target_width);
    resize_exact(img, target_width, height, filter)
}

pub fn fast_resize_owned(
    img: DynamicImage,
    dst_width: u32,
    dst_height: u32,
    filter: ResampleFilter,
) -> std::result::Result<DynamicImage, ResizeError> {
    let src_width = img.width();
    let src_height = img.height();

    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(ResizeError::new(
            (src_width, src_height),
            (dst_width, dst_height),
            "invalid dimensions for resize",
        ));
    }

    // Take ownership of the buffer; only exotic layouts are converted.
    let (pixel_type, src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageLuma8(gray) => (PixelType::U8, gray.into_raw()),
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.into_raw()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.into_raw()),
        other => (PixelType::U8x4, other.to_rgba8().into_raw()),
    };

    let options = ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir_filter(filter)));
    fast_resize_internal_impl(
        src_width, src_height, src_pixels, pixel_type, dst_width, dst_height, options, filter,
    )
    .map_err(|reason| ResizeError::new((src_width, src_height), (dst_width, dst_height), reason))
}

#[inline]
fn requires_premultiply(pixel_type: PixelType) -> bool {
    matches!(pixel_type, PixelType::U8x4)
}

#[allow(clippy::too_many_arguments)]
fn fast_resize_internal_impl(
    src_width: u32,
    src_height: u32,
    mut src_pixels: Vec<u8>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: ResizeOptions,
    filter: ResampleFilter,
) -> std::result::Result<DynamicImage, String> {
    let pixel_count = (src_width as usize)
        .checked_mul(src_height as usize)
        .ok_or_else(|| "image dimensions overflow during resize".to_string())?;
    let required_bytes = pixel_count
        .checked_mul(pixel_type.size())
        .ok_or_else(|| "image buffer size overflow during resize".to_string())?;

    if src_pixels.len() < required_bytes {
        return Err(format!(
            "fir source image invalid buffer size. expected {required_bytes} bytes, got {} bytes",
            src_pixels.len()
        ));
    }

    let primary_result = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => {
            resize_with_source_image(src_image, pixel_type, dst_width, dst_height, &options)
        }
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let aligned_image = copy_pixels_to_aligned_image(
                src_width,
                src_height,
                pixel_type,
                &src_pixels,
                required_bytes,
            )?;
            resize_with_source_image(aligned_image, pixel_type, dst_width, dst_height, &options)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary_result {
        Ok(img) => Ok(img),
        Err(err) => {
            tracing::debug!(%err, "fir resize failed, using image crate fallback");
            resize_with_image_crate_fallback(
                &src_pixels,
                src_width,
                src_height,
                pixel_type,
                dst_width,
                dst_height,
                image_filter(filter),
            )
            .map_err(|fallback_err| format!("{err}; image crate fallback failed: {fallback_err}"))
        }
    }
}

fn copy_pixels_to_aligned_image(
    width: u32,
    height: u32,
    pixel_type: PixelType,
    src_pixels: &[u8],
    required_bytes: usize,
) -> std::result::Result<fir::images::Image<'static>, String> {
    let mut aligned_image = fir::images::Image::new(width, height, pixel_type);
    let aligned_buffer = aligned_image.buffer_mut();
    if aligned_buffer.len() != required_bytes {
        return Err(format!(
            "fir alignment fallback buffer mismatch. expected {required_bytes} bytes, got {} bytes",
            aligned_buffer.len()
        ));
    }
    aligned_buffer.copy_from_slice(&src_pixels[..required_bytes]);
    Ok(aligned_image)
}

fn resize_with_image_crate_fallback(
    src_pixels: &[u8],
    src_width: u32,
    src_height: u32,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    filter: FilterType,
) -> std::result::Result<DynamicImage, String> {
    match pixel_type {
        PixelType::U8 => {
            let gray = GrayImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build gray image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageLuma8(imageops::resize(
                &gray, dst_width, dst_height, filter,
            )))
        }
        PixelType::U8x3 => {
            let rgb = RgbImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgb image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgb8(imageops::resize(
                &rgb, dst_width, dst_height, filter,
            )))
        }
        PixelType::U8x4 => {
            let rgba = RgbaImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgba image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgba8(imageops::resize(
                &rgba, dst_width, dst_height, filter,
            )))
        }
        _ => Err("fallback resize supports only U8/U8x3/U8x4 pixel types".to_string()),
    }
}

/// Only scans images of at least one megapixel; below that premultiplying is
/// cheaper than the scan.
fn is_fully_opaque(image: &fir::images::Image, pixel_type: PixelType) -> bool {
    if pixel_type != PixelType::U8x4 {
        return true;
    }
    const THRESHOLD_PIXELS: u64 = 1_000_000;
    if (image.width() as u64).saturating_mul(image.height() as u64) < THRESHOLD_PIXELS {
        return false;
    }
    image.buffer().iter().skip(3).step_by(4).all(|&alpha| alpha == 255)
}

fn resize_with_source_image(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
) -> std::result::Result<DynamicImage, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);

    let needs_premultiply =
        requires_premultiply(pixel_type) && !is_fully_opaque(&src_image, pixel_type);

    let mul_div = MulDiv::default();
    if needs_premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if needs_premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    let dst_pixels = dst_image.into_vec();
    match pixel_type {
        PixelType::U8 => GrayImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| "failed to create gray image from resized data".to_string()),
        PixelType::U8x3 => RgbImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| "failed to create rgb image from resized data".to_string()),
        PixelType::U8x4 => RgbaImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| "failed to create rgba image from resized data".to_string()),
        _ => Err("unsupported pixel type after resize".to_string()),
    }
}

// =============================================================================
// CROPS, MODE CONVERSION, COMPOSITING
// =============================================================================

/// Rows `[top, bottom)` at full width.
pub fn crop_rows(img: &DynamicImage, top: u32, bottom: u32) -> DynamicImage {
    let bottom = bottom.min(img.height());
    let top = top.min(bottom);
    img.crop_imm(0, top, img.width(), bottom - top)
}

/// Composite an RGBA buffer over opaque white.
pub fn flatten_onto_white(rgba: &RgbaImage) -> RgbImage {
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let [r, g, b, a] = src.0;
        let a = a as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a) + 127) / 255) as u8;
        *dst = Rgb([blend(r), blend(g), blend(b)]);
    }
    out
}

/// Convert to `mode`. Alpha is flattened onto white whenever it is dropped.
pub fn to_mode(img: DynamicImage, mode: ColorMode) -> DynamicImage {
    match (mode, img) {
        (ColorMode::Rgba, DynamicImage::ImageRgba8(rgba)) => DynamicImage::ImageRgba8(rgba),
        (ColorMode::Rgba, other) => DynamicImage::ImageRgba8(other.to_rgba8()),
        (ColorMode::Rgb, DynamicImage::ImageRgb8(rgb)) => DynamicImage::ImageRgb8(rgb),
        (ColorMode::Rgb, other) if other.color().has_alpha() => {
            DynamicImage::ImageRgb8(flatten_onto_white(&other.to_rgba8()))
        }
        (ColorMode::Rgb, other) => DynamicImage::ImageRgb8(other.to_rgb8()),
        (ColorMode::Grayscale, DynamicImage::ImageLuma8(gray)) => DynamicImage::ImageLuma8(gray),
        (ColorMode::Grayscale, other) if other.color().has_alpha() => {
            DynamicImage::ImageLuma8(DynamicImage::ImageRgb8(flatten_onto_white(&other.to_rgba8())).into_luma8())
        }
        (ColorMode::Grayscale, other) => DynamicImage::ImageLuma8(other.to_luma8()),
    }
}

/// Blank composite canvas: transparent RGBA or white RGB.
pub fn blank_canvas(width: u32, height: u32, mode: ColorMode) -> DynamicImage {
    match mode {
        ColorMode::Rgba => DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]))),
        ColorMode::Rgb => DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255]))),
        ColorMode::Grayscale => DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, image::Luma([255]))),
    }
}

/// Copy `tile` into `canvas` horizontally centred at row `y`, clipping
/// anything that falls outside. Returns the number of rows written.
pub fn paste_centered(canvas: &mut DynamicImage, tile: &DynamicImage, y: u32) -> u32 {
    let x = (canvas.width() as i64 - tile.width() as i64) / 2;
    let rows = tile.height().min(canvas.height().saturating_sub(y));
    match canvas {
        DynamicImage::ImageRgba8(dst) => match tile {
            DynamicImage::ImageRgba8(src) => imageops::replace(dst, src, x, y as i64),
            other => imageops::replace(dst, &other.to_rgba8(), x, y as i64),
        },
        DynamicImage::ImageRgb8(dst) => match tile {
            DynamicImage::ImageRgb8(src) => imageops::replace(dst, src, x, y as i64),
            other if other.color().has_alpha() => {
                imageops::replace(dst, &flatten_onto_white(&other.to_rgba8()), x, y as i64)
            }
            other => imageops::replace(dst, &other.to_rgb8(), x, y as i64),
        },
        DynamicImage::ImageLuma8(dst) => imageops::replace(dst, &tile.to_luma8(), x, y as i64),
        _ => return 0,
    }
    rows
}
