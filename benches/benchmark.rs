use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use image::{ImageFormat, Rgb, RgbImage};
use std::hint::black_box;
use std::path::{Path, PathBuf};
use strip_slicer::engine::{crop_rows, read_image_data, scale_to_width};
use strip_slicer::{
    merge, split, CancelFlag, CutSpec, EngineLimits, MergeTask, OutputFormat, Progress, ResampleFilter,
    SplitRequest,
};

fn strip(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8])
    })
}

fn save(dir: &Path, name: &str, image: &RgbImage) -> PathBuf {
    let path = dir.join(name);
    image.save_with_format(&path, ImageFormat::Png).unwrap();
    path
}

/// Uncompressed 8-bit RGB document with empty resource and layer sections.
fn raw_psd(width: u32, height: u32) -> Vec<u8> {
    let mut doc = b"8BPS".to_vec();
    doc.extend_from_slice(&1u16.to_be_bytes());
    doc.extend_from_slice(&[0; 6]);
    doc.extend_from_slice(&3u16.to_be_bytes());
    doc.extend_from_slice(&height.to_be_bytes());
    doc.extend_from_slice(&width.to_be_bytes());
    doc.extend_from_slice(&8u16.to_be_bytes());
    doc.extend_from_slice(&3u16.to_be_bytes());
    doc.extend_from_slice(&[0; 12]);
    doc.extend_from_slice(&0u16.to_be_bytes());
    doc.extend((0..width as usize * height as usize * 3).map(|i| (i % 251) as u8));
    doc
}

fn bench_pipeline(c: &mut Criterion) {
    let img = image::DynamicImage::ImageRgb8(strip(800, 12_000));
    c.bench_function("crop_rows 800x12000 -> 1280 rows", |b| {
        b.iter(|| crop_rows(black_box(&img), 4000, 5280))
    });
    c.bench_function("scale_to_width 800x12000 -> 690 lanczos", |b| {
        b.iter_batched(
            || img.clone(),
            |owned| scale_to_width(owned, 690, ResampleFilter::Lanczos3).unwrap(),
            BatchSize::LargeInput,
        )
    });
}

fn bench_split(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let source = save(dir.path(), "episode.png", &strip(800, 8000));

    c.bench_function("split 800x8000 every 1280 (jpeg)", |b| {
        b.iter_batched(
            || tempfile::tempdir_in(dir.path()).unwrap(),
            |out| {
                let request = SplitRequest::new(&source, CutSpec::Every(1280), out.path());
                split(&request, &EngineLimits::default(), &mut Progress::none(), &CancelFlag::new()).unwrap()
            },
            BatchSize::PerIteration,
        )
    });
}

fn bench_merge(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let files: Vec<PathBuf> = (0..6)
        .map(|i| save(dir.path(), &format!("{i}.png"), &strip(600 + i * 40, 1200)))
        .collect();

    let mut group = c.benchmark_group("merge 6 slices");
    group.sample_size(10);
    for (label, limits) in [
        ("in-memory", EngineLimits::default()),
        (
            "streaming",
            EngineLimits::default()
                .with_streaming_threshold(1)
                .with_chunk_height(1024),
        ),
    ] {
        group.bench_function(label, |b| {
            b.iter_batched(
                || tempfile::tempdir_in(dir.path()).unwrap(),
                |out| {
                    let mut task = MergeTask::new(files.clone(), out.path().join("merged.png"));
                    task.format = OutputFormat::Png;
                    merge(task, &limits, &mut Progress::none(), &CancelFlag::new()).unwrap()
                },
                BatchSize::PerIteration,
            )
        });
    }
    group.finish();
}

fn bench_layered(c: &mut Criterion) {
    let doc = raw_psd(690, 4000);
    c.bench_function("read_image_data raw 690x4000", |b| {
        b.iter(|| read_image_data(black_box(&doc)).unwrap())
    });
}

criterion_group!(benches, bench_pipeline, bench_split, bench_merge, bench_layered);
criterion_main!(benches);
