use clap::{Parser, Subcommand};
use heic_batch::imaging::{self, NativeHeifDecoder, SIGNATURE_LEN};
use heic_batch::pipeline::{Notification, Pipeline, RunSummary};
use heic_batch::preferences::{MemoryPreferences, Preferences, TomlPreferences};
use heic_batch::transcode::ImageTranscoder;
use heic_batch::types::{OutputFormat, SourceItem};
use heic_batch::{config, output};
use serde::Serialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Extensions picked up when a directory is given.
const HEIF_EXTENSIONS: &[&str] = &["heic", "heif"];

#[derive(Parser)]
#[command(name = "heic-batch")]
#[command(about = "Convert batches of HEIC/HEIF photos to JPEG, PNG or WEBP")]
#[command(long_about = "\
Convert batches of HEIC/HEIF photos to JPEG, PNG or WEBP

Files are converted in small chunks to keep memory bounded. A file that
fails to convert is reported and skipped; the rest of the batch carries on.
Inputs that are really JPEG/PNG/WEBP despite a .heic name are detected and
re-encoded directly.

The last format and quality are remembered when [preferences] path is set
in the config file.

Run 'heic-batch gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct ConvertArgs {
    /// Files or directories (directories are searched for .heic/.heif)
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Output format: jpeg, png or webp
    #[arg(short, long)]
    format: Option<OutputFormat>,

    /// Quality from 0.0 to 1.0 (ignored for PNG)
    #[arg(short, long)]
    quality: Option<f32>,

    /// Directory converted files are written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Print a JSON report instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Convert files to the chosen format
    Convert(ConvertArgs),
    /// Show what each file really is
    Detect {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

#[derive(Serialize)]
struct JsonReport {
    format: OutputFormat,
    quality: f32,
    written: Vec<WrittenFile>,
    failed: Vec<FailedFile>,
    excluded: usize,
}

#[derive(Serialize)]
struct WrittenFile {
    name: String,
    path: PathBuf,
    bytes: usize,
}

#[derive(Serialize)]
struct FailedFile {
    name: String,
    reason: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Convert(args) => {
            let config = config::load_config(cli.config.as_deref())?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(convert(args, config))?;
        }
        Command::Detect { paths } => {
            for path in collect_files(&paths, None) {
                let prefix = read_prefix(&path)?;
                let name = path.display().to_string();
                println!("{}", output::format_detection(&name, &imaging::detect(&prefix)));
            }
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Logs go to stderr so `--json` output stays clean.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "heic_batch=debug"
    } else {
        "heic_batch=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn convert(
    args: ConvertArgs,
    config: config::PipelineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if !NativeHeifDecoder::is_available() {
        warn!("built without the `heif` feature: only misnamed standard images can be converted");
    }

    let files = collect_files(&args.paths, Some(HEIF_EXTENSIONS));
    if files.is_empty() {
        println!("No HEIC/HEIF files found");
        return Ok(());
    }
    let mut sources = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        sources.push(SourceItem::new(name, bytes));
    }

    let preferences: Arc<dyn Preferences> = match config.preferences_path() {
        Some(path) => Arc::new(TomlPreferences::new(path)),
        None => Arc::new(MemoryPreferences::new()),
    };
    let pipeline = Pipeline::new(&config, Arc::new(ImageTranscoder::native()), preferences)?;
    if sources.len() > pipeline.max_files() {
        warn!(
            found = sources.len(),
            limit = pipeline.max_files(),
            "more files than one batch holds, the rest are left out"
        );
    }

    let mut notifications = pipeline.subscribe();
    let json = args.json;
    let printer = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            if !json {
                output::print_notification(&notification);
            }
            if let Notification::ItemFailed { name, reason, .. } = &notification {
                debug!(file = %name, error = %reason, "item failed");
            }
        }
    });

    // Applied on the empty batch, so no conversion runs yet.
    if let Some(format) = args.format {
        pipeline.set_format(format).await?;
    }
    if let Some(quality) = args.quality {
        if pipeline.target().format().is_lossy() {
            pipeline.set_quality(quality).await?;
        } else {
            warn!("--quality has no effect on PNG output");
        }
    }

    let report = pipeline.submit_files(sources).await?;
    let written = write_downloads(&pipeline, &args.output).await?;
    let snapshot = pipeline.snapshot();
    let target = pipeline.target();
    pipeline.close();
    printer.await?;

    if json {
        let failed = report
            .run
            .as_ref()
            .map(|run: &RunSummary| {
                run.failed
                    .iter()
                    .map(|f| FailedFile {
                        name: f.name.clone(),
                        reason: f.reason.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let report = JsonReport {
            format: target.format(),
            quality: target.quality().value(),
            written,
            failed,
            excluded: report.excluded,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        output::print_batch(&snapshot);
        println!("==> Wrote {} file(s) to {}", written.len(), args.output.display());
    }
    Ok(())
}

/// Write every converted file, never overwriting one written in this run.
async fn write_downloads(
    pipeline: &Pipeline,
    dir: &Path,
) -> Result<Vec<WrittenFile>, std::io::Error> {
    tokio::fs::create_dir_all(dir).await?;
    let mut taken = HashSet::new();
    let mut written = Vec::new();
    for (name, artifact) in pipeline.downloads() {
        let name = unique_name(&name, &mut taken);
        let path = dir.join(&name);
        tokio::fs::write(&path, &artifact.bytes).await?;
        debug!(path = %path.display(), bytes = artifact.len(), "wrote artifact");
        written.push(WrittenFile {
            name,
            path,
            bytes: artifact.len(),
        });
    }
    Ok(written)
}

/// `a.jpg`, then `a (2).jpg`, `a (3).jpg`, ...
fn unique_name(name: &str, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    let mut n = 2;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Expand directories; files given explicitly are always kept.
fn collect_files(paths: &[PathBuf], extensions: Option<&[&str]>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if !path.is_dir() {
            files.push(path.clone());
            continue;
        }
        let mut found: Vec<PathBuf> = WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| match extensions {
                Some(exts) => p
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| exts.iter().any(|x| x.eq_ignore_ascii_case(e))),
                None => true,
            })
            .collect();
        found.sort();
        files.extend(found);
    }
    files
}

fn read_prefix(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let mut prefix = Vec::with_capacity(SIGNATURE_LEN);
    std::fs::File::open(path)?
        .take(SIGNATURE_LEN as u64)
        .read_to_end(&mut prefix)?;
    Ok(prefix)
}
