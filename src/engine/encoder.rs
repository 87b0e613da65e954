// src/engine/encoder.rs
//
// Encoder operations: JPEG (mozjpeg) and PNG (image crate + oxipng), platform
// width caps, DPI metadata and atomic file output

use crate::engine::common::run_with_panic_policy;
use crate::engine::pipeline;
use crate::error::{Result, SlicerError};
use crate::ops::{OutputFormat, PlatformSpec, QualityPolicy, ResampleFilter};
use image::{DynamicImage, ImageFormat, RgbImage};
use img_parts::{jpeg::Jpeg, png::Png, Bytes};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// libjpeg's per-side ceiling.
pub const JPEG_MAX_DIMENSION: u32 = 65_500;

/// Encode `img` to JPEG with the policy's quality and chroma subsampling.
/// Alpha is flattened onto white.
pub fn encode_jpeg(img: &DynamicImage, quality: QualityPolicy) -> Result<Vec<u8>> {
    run_with_panic_policy(
        "encode:jpeg",
        |msg| SlicerError::encode_failed("jpeg", msg),
        || {
            let rgb: Cow<'_, RgbImage> = match img {
                DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
                other if other.color().has_alpha() => {
                    Cow::Owned(pipeline::flatten_onto_white(&other.to_rgba8()))
                }
                other => Cow::Owned(other.to_rgb8()),
            };
            let (w, h) = rgb.dimensions();
            if w == 0 || h == 0 {
                return Err(SlicerError::encode_failed("jpeg", "image has zero width or height"));
            }
            if w > JPEG_MAX_DIMENSION || h > JPEG_MAX_DIMENSION {
                return Err(SlicerError::encode_failed(
                    "jpeg",
                    format!("{w}x{h} exceeds the JPEG maximum of {JPEG_MAX_DIMENSION} per side"),
                ));
            }

            let mut comp = Compress::new(ColorSpace::JCS_RGB);
            comp.set_size(w as usize, h as usize);
            comp.set_color_space(ColorSpace::JCS_YCbCr);
            comp.set_quality(quality.jpeg_quality() as f32);

            if quality.full_chroma() {
                comp.set_chroma_sampling_pixel_sizes((1, 1), (1, 1));
            } else {
                comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
            }
            comp.set_progressive_mode();
            comp.set_optimize_coding(true);
            comp.set_optimize_scans(true);
            comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);

            let estimated_size = (w as usize * h as usize * 3 / 10).max(4096);
            let mut output = Vec::with_capacity(estimated_size);
            {
                let mut writer = comp.start_compress(&mut output).map_err(|e| {
                    SlicerError::encode_failed("jpeg", format!("mozjpeg: failed to start compress: {e:?}"))
                })?;
                for row in rgb.as_raw().chunks(w as usize * 3) {
                    writer.write_scanlines(row).map_err(|e| {
                        SlicerError::encode_failed("jpeg", format!("mozjpeg: failed to write scanlines: {e:?}"))
                    })?;
                }
                writer.finish().map_err(|e| {
                    SlicerError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
                })?;
            }
            Ok(output)
        },
    )
}

/// Encode to RGBA PNG, then optimise losslessly with oxipng.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    run_with_panic_policy(
        "encode:png",
        |msg| SlicerError::encode_failed("png", msg),
        || {
            let rgba: Cow<'_, DynamicImage> = match img {
                DynamicImage::ImageRgba8(_) => Cow::Borrowed(img),
                other => Cow::Owned(DynamicImage::ImageRgba8(other.to_rgba8())),
            };
            let mut buf = Vec::new();
            rgba.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(|e| SlicerError::encode_failed("png", format!("PNG encode failed: {e}")))?;
            drop(rgba);

            let mut options = oxipng::Options::from_preset(4);
            options.strip = oxipng::StripChunks::None;
            oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
                SlicerError::encode_failed("png", format!("oxipng optimization failed: {e}"))
            })
        },
    )
}

const METERS_PER_INCH: f64 = 0.0254;

/// Set the PNG `pHYs` chunk (pixels per metre) to `dpi`.
pub fn embed_dpi_png(png_data: Vec<u8>, dpi: (u32, u32)) -> Result<Vec<u8>> {
    use img_parts::png::PngChunk;

    let mut png = Png::from_bytes(Bytes::from(png_data))
        .map_err(|e| SlicerError::encode_failed("png", format!("failed to parse PNG for pHYs: {e}")))?;

    let to_ppm = |d: u32| (d as f64 / METERS_PER_INCH).round() as u32;
    let mut body = Vec::with_capacity(9);
    body.extend_from_slice(&to_ppm(dpi.0).to_be_bytes());
    body.extend_from_slice(&to_ppm(dpi.1).to_be_bytes());
    body.push(1);

    let chunks = png.chunks_mut();
    chunks.retain(|c| c.kind() != *b"pHYs");
    let idat = chunks
        .iter()
        .position(|c| c.kind() == *b"IDAT")
        .unwrap_or(chunks.len());
    chunks.insert(idat, PngChunk::new(*b"pHYs", Bytes::from(body)));

    let mut output = Vec::new();
    png.encoder()
        .write_to(&mut output)
        .map_err(|e| SlicerError::encode_failed("png", format!("failed to write PNG with pHYs: {e}")))?;
    Ok(output)
}

/// Rewrite (or insert) the JFIF APP0 segment with dots-per-inch density.
pub fn embed_dpi_jpeg(jpeg_data: Vec<u8>, dpi: (u32, u32)) -> Result<Vec<u8>> {
    use img_parts::jpeg::{markers::APP0, JpegSegment};

    let mut jpeg = Jpeg::from_bytes(Bytes::from(jpeg_data))
        .map_err(|e| SlicerError::encode_failed("jpeg", format!("failed to parse JPEG for JFIF: {e}")))?;

    let clamp = |d: u32| d.clamp(1, u16::MAX as u32) as u16;
    let mut body = Vec::with_capacity(14);
    body.extend_from_slice(b"JFIF\0");
    body.extend_from_slice(&[1, 1, 1]); // version 1.01, units: dots per inch
    body.extend_from_slice(&clamp(dpi.0).to_be_bytes());
    body.extend_from_slice(&clamp(dpi.1).to_be_bytes());
    body.extend_from_slice(&[0, 0]); // no thumbnail
    let segment = JpegSegment::new_with_contents(APP0, Bytes::from(body));

    let segments = jpeg.segments_mut();
    match segments
        .iter()
        .position(|s| s.marker() == APP0 && s.contents().starts_with(b"JFIF\0"))
    {
        Some(index) => segments[index] = segment,
        None => segments.insert(0, segment),
    }

    let mut output = Vec::new();
    jpeg.encoder()
        .write_to(&mut output)
        .map_err(|e| SlicerError::encode_failed("jpeg", format!("failed to write JPEG with JFIF: {e}")))?;
    Ok(output)
}

/// Size after the platform caps: width first, then height, both keeping the
/// aspect ratio with floor rounding. Never upscales.
pub fn platform_dimensions(spec: &PlatformSpec, width: u32, height: u32) -> (u32, u32) {
    let (mut w, mut h) = (width, height);
    if w > spec.max_width {
        h = pipeline::scaled_height(w, h, spec.max_width);
        w = spec.max_width;
    }
    if let Some(max_height) = spec.max_height.filter(|&m| h > m) {
        w = pipeline::scaled_height(h, w, max_height);
        h = max_height;
    }
    (w, h)
}

/// Encode to bytes. Returns the format actually used, which a platform with a
/// preferred lossy format may override.
pub fn encode_to_vec(
    img: &DynamicImage,
    quality: QualityPolicy,
    format: OutputFormat,
    platform: Option<&PlatformSpec>,
    dpi: Option<(u32, u32)>,
) -> Result<(Vec<u8>, OutputFormat)> {
    let (format, quality) = match platform {
        Some(spec) => spec.resolve(format, quality),
        None => (format, quality),
    };

    let prepared: Cow<'_, DynamicImage> = match platform {
        Some(spec) => {
            let (width, height) = platform_dimensions(spec, img.width(), img.height());
            if (width, height) == (img.width(), img.height()) {
                Cow::Borrowed(img)
            } else {
                Cow::Owned(pipeline::resize_exact(img.clone(), width, height, ResampleFilter::Lanczos3)?)
            }
        }
        None => Cow::Borrowed(img),
    };

    let bytes = match format {
        OutputFormat::Jpeg => {
            let encoded = encode_jpeg(&prepared, quality)?;
            match dpi {
                Some(dpi) => embed_dpi_jpeg(encoded, dpi)?,
                None => encoded,
            }
        }
        OutputFormat::Png => {
            let encoded = encode_png(&prepared)?;
            match dpi {
                Some(dpi) => embed_dpi_png(encoded, dpi)?,
                None => encoded,
            }
        }
    };
    Ok((bytes, format))
}

/// Encode and write `img` next to `output_path`, replacing its extension with
/// the format's. The write goes through a temporary file in the destination
/// directory, so a partial file never appears under the final name.
pub fn encode(
    img: &DynamicImage,
    output_path: &Path,
    quality: QualityPolicy,
    format: OutputFormat,
    platform: Option<&PlatformSpec>,
    dpi: Option<(u32, u32)>,
) -> Result<PathBuf> {
    let (bytes, format) = encode_to_vec(img, quality, format, platform, dpi)?;
    let final_path = output_path.with_extension(format.extension());
    write_atomic(&final_path, &bytes)?;
    tracing::debug!(
        path = %final_path.display(),
        format = format.as_str(),
        bytes = bytes.len(),
        "encoded"
    );
    Ok(final_path)
}

/// Write `data` to `path` through a same-directory temporary file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let output_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut temp_file =
        NamedTempFile::new_in(output_dir).map_err(|e| SlicerError::output_unwritable(output_dir, e))?;
    temp_file
        .write_all(data)
        .map_err(|e| SlicerError::output_unwritable(path, e))?;
    temp_file
        .as_file_mut()
        .sync_all()
        .map_err(|e| SlicerError::output_unwritable(path, e))?;
    // On failure the temporary file is removed when the error is dropped.
    temp_file
        .persist(path)
        .map_err(|e| SlicerError::output_unwritable(path, e.error))?;
    Ok(())
}
