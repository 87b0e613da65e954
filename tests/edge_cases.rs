// tests/edge_cases.rs
//
// Edge case tests for strip-slicer
// Tests boundary values, invalid inputs, ceilings and layered documents

use image::{GenericImageView, ImageFormat, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use strip_slicer::engine::{decode, inspect, read_image_data, SourceFormat};
use strip_slicer::{
    merge, split, CancelFlag, CutSpec, EngineLimits, ErrorCategory, ErrorKind, MergeTask,
    OutputFormat, Progress, SplitRequest,
};

fn create_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 9]))
        .save_with_format(&path, ImageFormat::Png)
        .unwrap();
    path
}

/// Raw (uncompressed) RGB document; `version` 1 is PSD, 2 is PSB.
fn create_layered(version: u16, width: u32, height: u32) -> Vec<u8> {
    let mut doc = Vec::new();
    doc.extend_from_slice(b"8BPS");
    doc.extend_from_slice(&version.to_be_bytes());
    doc.extend_from_slice(&[0; 6]);
    doc.extend_from_slice(&3u16.to_be_bytes());
    doc.extend_from_slice(&height.to_be_bytes());
    doc.extend_from_slice(&width.to_be_bytes());
    doc.extend_from_slice(&8u16.to_be_bytes());
    doc.extend_from_slice(&3u16.to_be_bytes());
    doc.extend_from_slice(&0u32.to_be_bytes());
    doc.extend_from_slice(&0u32.to_be_bytes());
    if version == 2 {
        doc.extend_from_slice(&0u64.to_be_bytes());
    } else {
        doc.extend_from_slice(&0u32.to_be_bytes());
    }
    doc.extend_from_slice(&0u16.to_be_bytes());
    for channel in 0..3u32 {
        for y in 0..height {
            for x in 0..width {
                doc.push(((x * 10 + y * 3 + channel * 80) % 256) as u8);
            }
        }
    }
    doc
}

fn expected_layered_pixel(x: u32, y: u32) -> Rgb<u8> {
    let c = |channel: u32| ((x * 10 + y * 3 + channel * 80) % 256) as u8;
    Rgb([c(0), c(1), c(2)])
}

// =============================================================================
// INPUT VALIDATION
// =============================================================================

#[test]
fn test_missing_input() {
    let limits = EngineLimits::default();
    let err = decode(Path::new("/definitely/not/here.png"), None, &limits).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputNotFound);
    assert!(err.is_retryable());
}

#[test]
fn test_directory_and_empty_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let limits = EngineLimits::default();

    let folder = dir.path().join("folder.png");
    std::fs::create_dir(&folder).unwrap();
    assert_eq!(decode(&folder, None, &limits).unwrap_err().kind(), ErrorKind::InputUnreadable);

    let empty = dir.path().join("empty.png");
    std::fs::write(&empty, b"").unwrap();
    let err = decode(&empty, None, &limits).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputUnreadable);
    assert_eq!(err.category(), ErrorCategory::UserError);
}

#[test]
fn test_unsupported_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strip.gif");
    std::fs::write(&path, b"GIF89a").unwrap();
    assert!(SourceFormat::from_path(&path).is_err());
    assert_eq!(inspect(&path).unwrap_err().kind(), ErrorKind::InputUnreadable);
}

#[test]
fn test_content_not_matching_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fake.jpg");
    std::fs::write(&path, b"\x89PNG\r\n\x1a\n0000000000000000").unwrap();
    let err = decode(&path, None, &EngineLimits::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecodeFailed);
}

#[test]
fn test_truncated_png() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_png(dir.path(), "t.png", 64, 64);
    let bytes = std::fs::read(&path).unwrap();
    // signature and IHDR survive, no image data does
    std::fs::write(&path, &bytes[..40]).unwrap();
    let err = decode(&path, None, &EngineLimits::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecodeFailed);
}

// =============================================================================
// CEILINGS
// =============================================================================

#[test]
fn test_pixel_ceiling_from_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_png(dir.path(), "big.png", 100, 100);
    let limits = EngineLimits::default().with_max_pixels(9_999);
    let err = decode(&path, None, &limits).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PixelLimitExceeded);
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("10000"));
}

#[test]
fn test_decode_memory_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let path = create_png(dir.path(), "big.png", 100, 100);
    let limits = EngineLimits::default().with_decode_memory_limit(100 * 100 * 4 - 1);
    let err = decode(&path, None, &limits).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MemoryBudgetExceeded);
    assert!(err.is_retryable());
}

#[test]
fn test_merge_pixel_ceiling_counts_total_height() {
    let dir = tempfile::tempdir().unwrap();
    let files = vec![
        create_png(dir.path(), "a.png", 50, 100),
        create_png(dir.path(), "b.png", 100, 50),
    ];
    // 100 wide x 150 tall, although neither source alone is that large
    let limits = EngineLimits::default().with_max_pixels(14_999);
    let mut task = MergeTask::new(files, dir.path().join("m.png"));
    task.format = OutputFormat::Png;
    let err = merge(task, &limits, &mut Progress::none(), &CancelFlag::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PixelLimitExceeded);
    assert!(err.to_string().contains("15000"));
}

// =============================================================================
// CUT PLAN BOUNDARIES
// =============================================================================

#[test]
fn test_offset_at_height_is_rejected_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let source = create_png(dir.path(), "s.png", 8, 100);
    let out = dir.path().join("out");
    for offsets in [vec![100], vec![0], vec![-5, 50]] {
        let request = SplitRequest::new(&source, CutSpec::At(offsets), &out);
        let err = split(&request, &EngineLimits::default(), &mut Progress::none(), &CancelFlag::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCutPlan);
    }
    let leftovers = std::fs::read_dir(&out).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn test_empty_plan_writes_one_slice() {
    let dir = tempfile::tempdir().unwrap();
    let source = create_png(dir.path(), "s.png", 8, 100);
    let mut request = SplitRequest::new(&source, CutSpec::At(Vec::new()), dir.path().join("out"));
    request.format = OutputFormat::Png;
    let outcome = split(&request, &EngineLimits::default(), &mut Progress::none(), &CancelFlag::new()).unwrap();
    assert_eq!(outcome.slice_heights, vec![100]);
}

#[test]
fn test_one_row_slices() {
    let dir = tempfile::tempdir().unwrap();
    let source = create_png(dir.path(), "s.png", 3, 4);
    let mut request = SplitRequest::new(&source, CutSpec::At(vec![1, 2, 3]), dir.path().join("out"));
    request.format = OutputFormat::Png;
    let outcome = split(&request, &EngineLimits::default(), &mut Progress::none(), &CancelFlag::new()).unwrap();
    assert_eq!(outcome.slice_heights, vec![1, 1, 1, 1]);
    for path in &outcome.outputs {
        assert_eq!(image::open(path).unwrap().dimensions(), (3, 1));
    }
}

// =============================================================================
// LAYERED DOCUMENTS
// =============================================================================

#[test]
fn test_psb_is_flattened_through_decode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.psb");
    std::fs::write(&path, create_layered(2, 12, 7)).unwrap();

    let descriptor = inspect(&path).unwrap();
    assert_eq!((descriptor.width, descriptor.height), (12, 7));
    assert_eq!(descriptor.format, SourceFormat::Psb);

    let handle = decode(&path, None, &EngineLimits::default()).unwrap();
    let rgb = handle.image().to_rgb8();
    assert_eq!(rgb.dimensions(), (12, 7));
    assert_eq!(rgb.get_pixel(5, 3), &expected_layered_pixel(5, 3));
    assert_eq!(rgb.get_pixel(11, 6), &expected_layered_pixel(11, 6));
}

#[test]
fn test_psd_can_be_split() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.psd");
    std::fs::write(&path, create_layered(1, 6, 20)).unwrap();

    let mut request = SplitRequest::new(&path, CutSpec::Every(10), dir.path().join("out"));
    request.format = OutputFormat::Png;
    let outcome = split(&request, &EngineLimits::default(), &mut Progress::none(), &CancelFlag::new()).unwrap();
    let second = image::open(&outcome.outputs[1]).unwrap().to_rgb8();
    assert_eq!(second.get_pixel(2, 0), &expected_layered_pixel(2, 10));
}

#[test]
fn test_layered_file_size_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.psd");
    let doc = create_layered(1, 6, 6);
    std::fs::write(&path, &doc).unwrap();
    let limits = EngineLimits::default().with_decode_memory_limit(doc.len() as u64 - 1);
    let err = decode(&path, None, &limits).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MemoryBudgetExceeded);
}

#[test]
fn test_corrupt_layered_document_reports_every_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.psd");
    let mut doc = create_layered(1, 6, 6);
    doc.truncate(doc.len() - 40);
    std::fs::write(&path, &doc).unwrap();
    let err = decode(&path, None, &EngineLimits::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecodeFailed);
    let msg = err.to_string();
    assert!(msg.contains("layer-compose"));
    assert!(msg.contains("merged-composite"));
    assert!(msg.contains("image-data"));
}

#[test]
fn test_image_data_reader_rejects_garbage() {
    assert!(read_image_data(b"").is_err());
    assert!(read_image_data(b"8BPS\x00\x01").is_err());
    let mut doc = create_layered(1, 2, 2);
    doc[24] = 0;
    doc[25] = 9; // unsupported colour mode
    assert!(read_image_data(&doc).is_err());
}
