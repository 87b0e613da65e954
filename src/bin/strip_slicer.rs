//! Command-line driver for the strip-slicer engine.

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use strip_slicer::engine::merge_output_path;
use strip_slicer::{
    inspect, merge, resize_batch, split, CancelFlag, CutSpec, EngineLimits, MergeTask, OutputFormat,
    PlatformSpec, Progress, QualityPolicy, ResampleFilter, ResizeRequest, SlicerError, SplitRequest,
};
use tracing_subscriber::EnvFilter;

/// Split, merge and resize tall webtoon strip images.
#[derive(Parser)]
#[command(name = "strip-slicer", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Hide the progress indicator.
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Args)]
struct EncodeArgs {
    /// lossless, high, medium, low or a number from 0 to 100.
    #[arg(long, default_value = "medium")]
    quality: QualityPolicy,

    /// Write PNG instead of JPEG.
    #[arg(long)]
    png: bool,

    /// Distribution preset (webtoon, naver, kakao, lezhin, archive).
    #[arg(long, value_parser = parse_platform)]
    platform: Option<PlatformSpec>,
}

#[derive(Subcommand)]
enum Command {
    /// Cut one image into full-width slices
    Split {
        source: PathBuf,

        /// Explicit cut rows, comma separated.
        #[arg(long, value_delimiter = ',', conflicts_with_all = ["every", "parts"], allow_negative_numbers = true)]
        at: Vec<i64>,

        /// Cut every N rows.
        #[arg(long, conflicts_with = "parts")]
        every: Option<u32>,

        /// Number of evenly spaced cut lines.
        #[arg(long)]
        parts: Option<u32>,

        #[arg(short, long, default_value = "slices")]
        output: PathBuf,

        /// Base name for slice files; defaults to the source file name.
        #[arg(long)]
        name: Option<String>,

        /// Zero padding of the slice index (2 to 5).
        #[arg(long, default_value_t = 3)]
        digits: usize,

        /// Re-run number; non-zero adds `_vNNN` to slice names.
        #[arg(long = "version", value_name = "N", default_value_t = 0)]
        sequence_version: u32,

        #[command(flatten)]
        encode: EncodeArgs,
    },

    /// Stack images vertically into one composite
    Merge {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long, default_value = "slices/merged")]
        output: PathBuf,

        #[arg(long, default_value = "merged_images")]
        name: String,

        /// Composite size (MiB, RGBA) above which chunks are spilled to disk.
        #[arg(long)]
        streaming_threshold_mib: Option<u64>,

        #[command(flatten)]
        encode: EncodeArgs,
    },

    /// Resize images to a fixed width
    Resize {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long)]
        width: u32,

        #[arg(short, long, default_value = "slices/resized")]
        output: PathBuf,

        /// lanczos, bicubic or bilinear.
        #[arg(long, default_value = "lanczos")]
        filter: ResampleFilter,

        /// Append `_{width}px` to output names.
        #[arg(long)]
        suffix: bool,

        #[arg(long, default_value = "medium")]
        quality: QualityPolicy,

        #[arg(long)]
        png: bool,
    },

    /// Print dimensions without decoding pixels
    Inspect {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn parse_platform(name: &str) -> Result<PlatformSpec, String> {
    PlatformSpec::get(name).ok_or_else(|| {
        format!(
            "unknown platform '{name}', expected one of: {}",
            PlatformSpec::preset_names().join(", ")
        )
    })
}

fn progress_printer(enabled: bool) -> impl FnMut(f32) {
    move |percent| {
        if enabled {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "\r{percent:>5.1}%");
            if percent >= 100.0 {
                let _ = writeln!(stderr);
            }
            let _ = stderr.flush();
        }
    }
}

fn run(cli: Cli) -> Result<(), SlicerError> {
    let limits = EngineLimits::default();
    // never set; Ctrl-C terminates the process
    let cancel = CancelFlag::new();
    let mut printer = progress_printer(!cli.quiet && std::io::stderr().is_terminal());
    let mut progress = Progress::new(&mut printer);

    match cli.command {
        Command::Split {
            source,
            at,
            every,
            parts,
            output,
            name,
            digits,
            sequence_version,
            encode,
        } => {
            let cuts = match (every, parts) {
                (Some(interval), _) => CutSpec::Every(interval),
                (None, Some(count)) => CutSpec::Parts(count),
                (None, None) => CutSpec::At(at),
            };
            let mut request = SplitRequest::new(source, cuts, output);
            request.base_name = name;
            request.digits = digits;
            request.sequence_version = sequence_version;
            request.quality = encode.quality;
            request.format = OutputFormat::from_png_flag(encode.png);
            request.platform = encode.platform;
            let outcome = split(&request, &limits, &mut progress, &cancel)?;
            for path in &outcome.outputs {
                println!("{}", path.display());
            }
        }
        Command::Merge {
            files,
            output,
            name,
            streaming_threshold_mib,
            encode,
        } => {
            let format = OutputFormat::from_png_flag(encode.png);
            let limits = match streaming_threshold_mib {
                Some(mib) => limits.with_streaming_threshold(mib.saturating_mul(1024 * 1024)),
                None => limits,
            };
            let output_path = merge_output_path(&output, &name, format, encode.platform.as_ref());
            let mut task = MergeTask::new(files, output_path);
            task.quality = encode.quality;
            task.format = format;
            task.platform = encode.platform;
            let outcome = merge(task, &limits, &mut progress, &cancel)?;
            println!(
                "{} ({}x{}, {})",
                outcome.output.display(),
                outcome.width,
                outcome.height,
                outcome.mode.as_str()
            );
        }
        Command::Resize {
            files,
            width,
            output,
            filter,
            suffix,
            quality,
            png,
        } => {
            let mut request = ResizeRequest::new(files, output, width);
            request.filter = filter;
            request.add_width_suffix = suffix;
            request.quality = quality;
            request.format = OutputFormat::from_png_flag(png);
            let report = resize_batch(&request, &limits, &mut progress, &cancel)?;
            for path in &report.written {
                println!("{}", path.display());
            }
            for path in &report.skipped {
                println!("{} (already {width}px, skipped)", path.display());
            }
            for (path, err) in &report.failed {
                eprintln!("{}: {err}", path.display());
            }
            if !report.failed.is_empty() {
                tracing::warn!(
                    processed = report.processed(),
                    failed = report.failed.len(),
                    "some files were not resized"
                );
            }
        }
        Command::Inspect { files } => {
            for path in files {
                match inspect(&path) {
                    Ok(d) => println!(
                        "{}\t{}x{}\t{}\t{} bytes",
                        d.path.display(),
                        d.width,
                        d.height,
                        d.format.as_str(),
                        d.byte_size
                    ),
                    Err(err) => eprintln!("{}: {err}", path.display()),
                }
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is_cancelled() => ExitCode::from(130),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
