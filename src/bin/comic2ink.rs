//! CLI binary for comic2ink.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `JobConfig` / `TransformConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use comic2ink::{
    convert_batch, convert_with_cancel, discover_inputs, inspect, profile, Budget,
    CancellationToken, ConversionProgressCallback, ConvertError, DitherMode, ErrorKind,
    FailurePolicy, Fit, JobConfig, JobId, JobReport, OutputContainer, OutputFormat, PageError,
    PageKey, ProgressCallback, SplitPolicy, TransformConfig,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const MIB: u64 = 1024 * 1024;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One progress bar per running archive, stacked with [`MultiProgress`].
///
/// Page events of one job arrive in order from its writer loop; bars of
/// different jobs are keyed by job id.
struct CliProgressCallback {
    multi: MultiProgress,
    names: HashMap<JobId, String>,
    bars: Mutex<HashMap<JobId, ProgressBar>>,
}

impl CliProgressCallback {
    fn new(names: HashMap<JobId, String>) -> Arc<Self> {
        Arc::new(Self {
            multi: MultiProgress::new(),
            names,
            bars: Mutex::new(HashMap::new()),
        })
    }

    fn style(known_total: bool) -> ProgressStyle {
        let template = if known_total {
            "{spinner:.cyan} {prefix:.bold}  [{bar:36.green/238}] {pos:>4}/{len} pages  ⏱ {elapsed_precise}  ETA {eta_precise}"
        } else {
            "{spinner:.cyan} {prefix:.bold}  {pos} pages  ⏱ {elapsed_precise}"
        };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"])
    }

    fn with_bar(&self, job: JobId, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(&job) {
                f(bar);
            }
        }
    }

    fn name(&self, job: JobId) -> &str {
        self.names.get(&job).map(String::as_str).unwrap_or("archive")
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_job_start(&self, job: JobId, total_pages: Option<usize>) {
        let bar = self
            .multi
            .add(ProgressBar::new(total_pages.unwrap_or(0) as u64));
        bar.set_style(Self::style(total_pages.is_some()));
        bar.set_prefix(self.name(job).to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(job, bar);
        }
    }

    fn on_page_written(&self, job: JobId, key: PageKey, _bytes: usize) {
        // a split spread reports both halves; count the source page once
        if key.part + 1 == key.parts {
            self.with_bar(job, |bar| bar.inc(1));
        }
    }

    fn on_page_failed(&self, job: JobId, error: &PageError) {
        let msg = error.to_string();
        let msg = if msg.chars().count() > 80 {
            format!("{}\u{2026}", msg.chars().take(79).collect::<String>())
        } else {
            msg
        };
        self.with_bar(job, |bar| {
            bar.println(format!("  {} {}  {}", red("✗"), self.name(job), red(&msg)));
            bar.inc(1);
        });
    }

    fn on_job_complete(&self, job: JobId, report: &JobReport) {
        let bar = self.bars.lock().ok().and_then(|mut bars| bars.remove(&job));
        if let Some(bar) = bar {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        let _ = self.multi.println(format!(
            "{} {}  {}/{} pages  {}",
            if report.is_complete() {
                green("✔")
            } else {
                cyan("⚠")
            },
            bold(self.name(job)),
            report.written_pages,
            report.total_pages,
            dim(&format!("{:.1}s", report.stats.duration_ms as f64 / 1000.0)),
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one volume for a Kobo Libra 2
  comic2ink --profile kobo-libra volume01.cbz -o volume01-kobo.cbz

  # Manga: split spreads right-to-left, ordered dithering
  comic2ink --profile kindle-paperwhite --split rtl --dither ordered vol.cbz

  # A whole library, 2 archives at a time, 4 workers each
  comic2ink --profile kobo-clara ~/comics -o ~/kobo --archives 2 -c 4

  # Tight memory cap, keep going past broken pages
  comic2ink --budget-mb 128 --skip-bad-pages damaged.cbz

  # List pages without converting
  comic2ink --inspect-only volume01.cbz

PROFILES:
  Run `comic2ink --list-profiles` for the built-in device presets.
  --width/--height/--bits override the chosen profile.

EXIT CODES:
  0  every archive converted completely
  1  one or more archives failed or had skipped pages
  2  configuration error
  3  I/O error (e.g. output not writable or already present)

ENVIRONMENT VARIABLES:
  Every flag can be set as COMIC2INK_<FLAG>, e.g. COMIC2INK_PROFILE=kobo-libra.
  RUST_LOG overrides the log filter.
"#;

/// Convert comic and manga archives for e-ink readers.
#[derive(Parser, Debug)]
#[command(
    name = "comic2ink",
    version,
    about = "Convert comic and manga archives for e-ink readers",
    long_about = "Convert comic archives (CBZ/ZIP or directories of images) into e-ink \
optimised CBZ files: spreads split, pages fit to the screen, levels stretched and gray \
depth reduced with dithering. Pages stream through a bounded worker pool, so memory \
stays flat regardless of archive size.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Archives, directories of archives, or directories of page images.
    #[arg(required_unless_present = "list_profiles")]
    inputs: Vec<PathBuf>,

    /// Output file (single archive) or directory (several archives).
    #[arg(short, long, env = "COMIC2INK_OUTPUT")]
    output: Option<PathBuf>,

    /// Device profile (see --list-profiles).
    #[arg(long, env = "COMIC2INK_PROFILE", default_value = "kindle-paperwhite")]
    profile: String,

    /// Target width in pixels (overrides the profile).
    #[arg(long, env = "COMIC2INK_WIDTH")]
    width: Option<u32>,

    /// Target height in pixels (overrides the profile).
    #[arg(long, env = "COMIC2INK_HEIGHT")]
    height: Option<u32>,

    /// Gray depth in bits per pixel, 1–8 (overrides the profile).
    #[arg(long, env = "COMIC2INK_BITS",
          value_parser = clap::value_parser!(u8).range(1..=8))]
    bits: Option<u8>,

    /// Fit mode: contain, pad, crop.
    #[arg(long, env = "COMIC2INK_FIT", value_enum, default_value = "contain")]
    fit: FitArg,

    /// Dithering: none, ordered, floyd-steinberg, atkinson.
    #[arg(long, env = "COMIC2INK_DITHER", value_enum, default_value = "floyd-steinberg")]
    dither: DitherArg,

    /// Split landscape spreads: off, ltr, rtl.
    #[arg(long, env = "COMIC2INK_SPLIT", value_enum, default_value = "off")]
    split: SplitArg,

    /// Enlarge pages smaller than the screen.
    #[arg(long, env = "COMIC2INK_UPSCALE")]
    upscale: bool,

    /// Autocontrast clip percentage per side.
    #[arg(long, env = "COMIC2INK_AUTOCONTRAST", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..50))]
    autocontrast: u8,

    /// Gamma correction (1.0 disables).
    #[arg(long, env = "COMIC2INK_GAMMA", default_value_t = 1.0)]
    gamma: f64,

    /// Output page format: png, jpeg.
    #[arg(long, env = "COMIC2INK_FORMAT", value_enum, default_value = "png")]
    format: FormatArg,

    /// JPEG quality (1–100), with --format jpeg.
    #[arg(long, env = "COMIC2INK_QUALITY", default_value_t = 85,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Write a directory of pages instead of a .cbz.
    #[arg(long, env = "COMIC2INK_DIRECTORY")]
    directory: bool,

    /// Pages processed concurrently per archive.
    #[arg(short, long, env = "COMIC2INK_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Archives converted at once in batch mode.
    #[arg(long, env = "COMIC2INK_ARCHIVES", default_value_t = 1)]
    archives: usize,

    /// Memory budget as a number of decoded pages.
    #[arg(long, env = "COMIC2INK_BUDGET_PAGES", conflicts_with = "budget_mb")]
    budget_pages: Option<usize>,

    /// Memory budget in MiB of decoded pixel data.
    #[arg(long, env = "COMIC2INK_BUDGET_MB")]
    budget_mb: Option<u64>,

    /// Skip pages that fail instead of failing the archive.
    #[arg(long, env = "COMIC2INK_SKIP_BAD_PAGES")]
    skip_bad_pages: bool,

    /// Per-page processing timeout in seconds.
    #[arg(long, env = "COMIC2INK_PAGE_TIMEOUT")]
    page_timeout: Option<u64>,

    /// Replace existing outputs.
    #[arg(long, env = "COMIC2INK_OVERWRITE")]
    overwrite: bool,

    /// Print reports as JSON on stdout.
    #[arg(long, env = "COMIC2INK_JSON")]
    json: bool,

    /// List built-in device profiles and exit.
    #[arg(long)]
    list_profiles: bool,

    /// List each archive's pages, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// Disable progress bars.
    #[arg(long, env = "COMIC2INK_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "COMIC2INK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "COMIC2INK_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FitArg {
    Contain,
    Pad,
    Crop,
}

impl From<FitArg> for Fit {
    fn from(v: FitArg) -> Self {
        match v {
            FitArg::Contain => Fit::Contain,
            FitArg::Pad => Fit::Pad,
            FitArg::Crop => Fit::Crop,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum DitherArg {
    None,
    Ordered,
    FloydSteinberg,
    Atkinson,
}

impl From<DitherArg> for DitherMode {
    fn from(v: DitherArg) -> Self {
        match v {
            DitherArg::None => DitherMode::None,
            DitherArg::Ordered => DitherMode::Ordered,
            DitherArg::FloydSteinberg => DitherMode::FloydSteinberg,
            DitherArg::Atkinson => DitherMode::Atkinson,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum SplitArg {
    Off,
    Ltr,
    Rtl,
}

impl From<SplitArg> for SplitPolicy {
    fn from(v: SplitArg) -> Self {
        match v {
            SplitArg::Off => SplitPolicy::Off,
            SplitArg::Ltr => SplitPolicy::LeftToRight,
            SplitArg::Rtl => SplitPolicy::RightToLeft,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Png,
    Jpeg,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs would fight with the progress bars.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match run(cli, show_progress).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", red("error:"));
            exit_code_for(&e)
        }
    }
}

async fn run(cli: Cli, show_progress: bool) -> Result<ExitCode> {
    // ── Profiles ─────────────────────────────────────────────────────────
    if cli.list_profiles {
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(profile::list())
                    .context("Failed to serialise profiles")?
            );
        } else {
            for p in profile::list() {
                println!(
                    "{:<18} {:>4}×{:<4} {} bpp  {}",
                    p.name,
                    p.width,
                    p.height,
                    p.bits_per_pixel,
                    dim(p.description)
                );
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut archives = Vec::new();
    for input in &cli.inputs {
        let found = discover_inputs(input)
            .with_context(|| format!("Failed to read '{}'", input.display()))?;
        if found.is_empty() {
            tracing::warn!("No archives found under '{}'", input.display());
        }
        archives.extend(found);
    }
    if archives.is_empty() {
        return Err(ConvertError::InvalidConfig("no input archives found".into()).into());
    }

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        for path in &archives {
            let info = inspect(path)
                .await
                .with_context(|| format!("Failed to inspect '{}'", path.display()))?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&info).context("Failed to serialise info")?
                );
            } else {
                println!("File:       {}", info.path.display());
                println!("Container:  {:?}", info.container);
                println!("Pages:      {}", info.page_count);
                for (i, name) in info.pages.iter().enumerate() {
                    println!("  {i:>5}  {name}");
                }
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    // ── Build config ─────────────────────────────────────────────────────
    let transform = build_transform(&cli)?;
    let names: HashMap<JobId, String> = archives
        .iter()
        .enumerate()
        .map(|(i, p)| (i as JobId, display_name(p)))
        .collect();
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new(names) as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let job = build_job(&cli, progress)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", cyan("Interrupted, cleaning up…"));
                cancel.cancel();
            }
        });
    }

    // ── Run conversion ───────────────────────────────────────────────────
    let single_file = archives.len() == 1 && cli.inputs.len() == 1 && cli.inputs[0] == archives[0];
    if single_file {
        let input = &archives[0];
        let output = match &cli.output {
            Some(out) if !out.is_dir() => out.clone(),
            Some(dir) => comic2ink::output_path_for(input, dir, job.container),
            None => default_output(input, job.container),
        };
        let report = convert_with_cancel(input, &output, &job, &transform, cancel)
            .await
            .with_context(|| format!("Conversion of '{}' failed", input.display()))?;
        print_report(&cli, &report)?;
        return Ok(if report.is_complete() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        });
    }

    let output_dir = cli.output.clone().unwrap_or_else(|| PathBuf::from("eink"));
    let batch = convert_batch(&archives, &output_dir, &job, &transform, cancel)
        .await
        .context("Batch conversion failed")?;

    let mut io_failure = false;
    for entry in &batch.entries {
        match &entry.result {
            Ok(report) => print_report(&cli, report)?,
            Err(e) => {
                io_failure |= e.kind() == ErrorKind::Io;
                if cli.json {
                    let value = serde_json::json!({
                        "input": entry.input,
                        "output": entry.output,
                        "error": e.to_string(),
                    });
                    println!("{value}");
                } else if !cli.quiet {
                    eprintln!("{} {}  {}", red("✘"), bold(&display_name(&entry.input)), red(&e.to_string()));
                }
            }
        }
    }
    if !cli.quiet && !cli.json {
        eprintln!(
            "{} of {} archives converted completely  →  {}",
            bold(&batch.complete().to_string()),
            batch.entries.len(),
            bold(&output_dir.display().to_string())
        );
    }

    Ok(if io_failure {
        ExitCode::from(3)
    } else if batch.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Map CLI args to `TransformConfig`, starting from the chosen profile.
fn build_transform(cli: &Cli) -> Result<TransformConfig> {
    let mut config = profile::resolve(&cli.profile)?.transform_config();
    if let Some(w) = cli.width {
        config.width = w;
    }
    if let Some(h) = cli.height {
        config.height = h;
    }
    if let Some(b) = cli.bits {
        config.bits_per_pixel = b;
    }
    config.fit = cli.fit.into();
    config.dither = cli.dither.into();
    config.split = cli.split.into();
    config.upscale = cli.upscale;
    config.autocontrast_cutoff = cli.autocontrast;
    config.gamma = cli.gamma;
    config.output_format = match cli.format {
        FormatArg::Png => OutputFormat::Png,
        FormatArg::Jpeg => OutputFormat::Jpeg {
            quality: cli.quality,
        },
    };
    config.validate().context("Invalid transform settings")?;
    Ok(config)
}

/// Map CLI args to `JobConfig`.
fn build_job(cli: &Cli, progress: Option<ProgressCallback>) -> Result<JobConfig> {
    let mut builder = JobConfig::builder()
        .concurrency(cli.concurrency)
        .archive_concurrency(cli.archives)
        .overwrite(cli.overwrite)
        .failure_policy(if cli.skip_bad_pages {
            FailurePolicy::Skip
        } else {
            FailurePolicy::Abort
        })
        .container(if cli.directory {
            OutputContainer::Directory
        } else {
            OutputContainer::Cbz
        });

    if let Some(n) = cli.budget_pages {
        builder = builder.budget(Budget::Pages(n));
    } else if let Some(mb) = cli.budget_mb {
        builder = builder.budget(Budget::Bytes(mb.saturating_mul(MIB)));
    }
    if let Some(secs) = cli.page_timeout {
        builder = builder.page_timeout(Duration::from_secs(secs));
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid job settings")
}

fn print_report(cli: &Cli, report: &JobReport) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string(report).context("Failed to serialise report")?
        );
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }
    eprintln!(
        "{}  {}/{} pages  {} entries  {}ms  →  {}",
        if report.is_complete() {
            green("✔")
        } else {
            cyan("⚠")
        },
        report.written_pages,
        report.total_pages,
        report.written_entries,
        report.stats.duration_ms,
        bold(&report.output.display().to_string()),
    );
    for error in &report.errors {
        eprintln!("   {} {}", red("skipped"), dim(&error.to_string()));
    }
    if cli.verbose {
        eprintln!(
            "   {}",
            dim(&format!(
                "{} KiB in / {} KiB out, peak {} of {} budget units, {} re-decoded",
                report.stats.bytes_in / 1024,
                report.stats.bytes_out / 1024,
                report.stats.peak_in_flight,
                report.stats.budget_units,
                report.stats.redecoded_pages,
            ))
        );
    }
    Ok(())
}

/// `vol01.cbz` → `vol01.eink.cbz` next to the input.
fn default_output(input: &Path, container: OutputContainer) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "comic".to_string());
    let name = match container {
        OutputContainer::Cbz => format!("{stem}.eink.cbz"),
        OutputContainer::Directory => format!("{stem}.eink"),
    };
    input.with_file_name(name)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<ConvertError>().map(ConvertError::kind) {
        Some(ErrorKind::Configuration) => ExitCode::from(2),
        Some(ErrorKind::Io) => ExitCode::from(3),
        _ => ExitCode::from(1),
    }
}
