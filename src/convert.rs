//! Conversion entry points.
//!
//! [`convert`] runs one archive; [`convert_batch`] runs many, isolating
//! failures so one bad archive never stops its siblings. Both open the
//! source before the sink, so an unreadable input never creates output.

use crate::config::{JobConfig, OutputContainer, TransformConfig};
use crate::error::ConvertError;
use crate::output::{ArchiveInfo, BatchEntry, BatchReport, JobId, JobReport};
use crate::pipeline::codec::ImageCodec;
use crate::pipeline::sink::open_sink;
use crate::pipeline::source::{self, natural_cmp, open_source};
use crate::pipeline::transform::TransformStage;
use crate::scheduler::Job;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// File extensions collected by [`discover_inputs`]. RAR and 7z variants
/// are included so they are reported instead of silently ignored.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["cbz", "zip", "cbr", "rar", "cb7", "7z"];

/// Convert one archive.
///
/// # Arguments
/// * `input`    : comic archive or directory of page images
/// * `output`   : target `.cbz` file (or directory, per [`JobConfig::container`])
/// * `job`      : pipeline settings
/// * `transform`: device settings, e.g. from [`crate::profile::resolve`]
///
/// # Returns
/// `Ok(JobReport)` once the output is finalised. Under
/// [`crate::config::FailurePolicy::Skip`] the report may list skipped
/// pages; use [`JobReport::into_result`] to treat those as an error.
///
/// # Example
/// ```rust,no_run
/// use comic2ink::{convert, profile, JobConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transform = profile::resolve("kobo-libra")?.transform_config();
/// let job = JobConfig::default();
/// let report = convert("volume01.cbz", "out/volume01.cbz", &job, &transform).await?;
/// println!("{} pages written", report.written_pages);
/// # Ok(())
/// # }
/// ```
pub async fn convert(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    job: &JobConfig,
    transform: &TransformConfig,
) -> Result<JobReport, ConvertError> {
    convert_with_cancel(input, output, job, transform, CancellationToken::new()).await
}

/// [`convert`] with a caller-owned cancellation token.
///
/// Cancelling stops the job with [`ConvertError::Cancelled`]; the staged
/// output is removed and nothing appears at `output`.
pub async fn convert_with_cancel(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    job: &JobConfig,
    transform: &TransformConfig,
    cancel: CancellationToken,
) -> Result<JobReport, ConvertError> {
    run_job(0, input.as_ref(), output.as_ref(), job, transform, cancel).await
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    job: &JobConfig,
    transform: &TransformConfig,
) -> Result<JobReport, ConvertError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ConvertError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert(input, output, job, transform))
}

/// Convert an archive held in memory.
///
/// The bytes are written to a managed [`tempfile`] that is removed when
/// this returns.
pub async fn convert_bytes(
    bytes: &[u8],
    output: impl AsRef<Path>,
    job: &JobConfig,
    transform: &TransformConfig,
) -> Result<JobReport, ConvertError> {
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| ConvertError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| ConvertError::Internal(format!("tempfile write: {e}")))?;
    tmp.flush()
        .map_err(|e| ConvertError::Internal(format!("tempfile flush: {e}")))?;
    // `tmp` lives until the job has finished reading it
    convert(tmp.path(), output, job, transform).await
}

/// List an archive's pages without decoding them.
pub async fn inspect(input: impl AsRef<Path>) -> Result<ArchiveInfo, ConvertError> {
    let path = input.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let source = open_source(&path)?;
        let pages = source.entry_names();
        Ok(ArchiveInfo {
            container: source.kind(),
            page_count: pages.len(),
            pages,
            path,
        })
    })
    .await
    .map_err(|e| ConvertError::Internal(format!("Task join error: {e}")))?
}

/// Convert several archives into `output_dir`.
///
/// Archives run [`JobConfig::archive_concurrency`] at a time; results come
/// back in input order. A failing archive is recorded in its
/// [`BatchEntry`] and the batch carries on. Configuration errors are the
/// exception: they would fail every archive the same way, so they are
/// returned before any work starts.
pub async fn convert_batch(
    inputs: &[PathBuf],
    output_dir: impl AsRef<Path>,
    job: &JobConfig,
    transform: &TransformConfig,
    cancel: CancellationToken,
) -> Result<BatchReport, ConvertError> {
    job.validate()?;
    transform.validate()?;

    let outputs = output_paths(inputs, output_dir.as_ref(), job.container);
    info!(
        "Converting {} archives into '{}'",
        inputs.len(),
        output_dir.as_ref().display()
    );

    let entries = stream::iter(inputs.iter().zip(outputs).enumerate().map(
        |(i, (input, output))| {
            let cancel = cancel.clone();
            async move {
                let result = if cancel.is_cancelled() {
                    Err(ConvertError::Cancelled { written: 0 })
                } else {
                    run_job(i as JobId, input, &output, job, transform, cancel).await
                };
                if let Err(e) = &result {
                    warn!("'{}': {e}", input.display());
                }
                BatchEntry {
                    input: input.clone(),
                    output,
                    result,
                }
            }
        },
    ))
    .buffered(job.archive_concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

    Ok(BatchReport { entries })
}

/// Collect the archives to convert under `path`.
///
/// A file is returned as-is. A directory is walked recursively for files
/// with an [`ARCHIVE_EXTENSIONS`] extension, in natural order; a directory
/// holding no archives but page images is itself one (unpacked) comic.
pub fn discover_inputs(path: impl AsRef<Path>) -> Result<Vec<PathBuf>, ConvertError> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConvertError::InputNotFound {
            path: path.to_path_buf(),
        },
        _ => ConvertError::PermissionDenied {
            path: path.to_path_buf(),
        },
    })?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut found = Vec::new();
    let mut has_pages = false;
    walk(path, &mut found, &mut has_pages)?;
    if found.is_empty() && has_pages {
        debug!("'{}' holds loose pages; treating it as one comic", path.display());
        return Ok(vec![path.to_path_buf()]);
    }
    found.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(found)
}

/// Output location for `input` inside `output_dir`.
pub fn output_path_for(input: &Path, output_dir: &Path, container: OutputContainer) -> PathBuf {
    output_name(&output_stem(input), None, output_dir, container)
}

// ── Internal helpers ─────────────────────────────────────────────────────

fn output_stem(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "comic".to_string())
}

fn output_name(
    stem: &str,
    suffix: Option<usize>,
    output_dir: &Path,
    container: OutputContainer,
) -> PathBuf {
    let stem = match suffix {
        Some(n) => format!("{stem}-{n}"),
        None => stem.to_string(),
    };
    match container {
        OutputContainer::Cbz => output_dir.join(format!("{stem}.cbz")),
        OutputContainer::Directory => output_dir.join(stem),
    }
}

async fn run_job(
    id: JobId,
    input: &Path,
    output: &Path,
    job: &JobConfig,
    transform: &TransformConfig,
    cancel: CancellationToken,
) -> Result<JobReport, ConvertError> {
    job.validate()?;
    transform.validate()?;
    if input == output {
        return Err(ConvertError::InvalidConfig(format!(
            "output '{}' would overwrite its own input",
            output.display()
        )));
    }

    let (container, overwrite) = (job.container, job.overwrite);
    let (input_path, output_path) = (input.to_path_buf(), output.to_path_buf());
    let (source, sink) = tokio::task::spawn_blocking(move || {
        let source = open_source(&input_path)?;
        let sink = open_sink(&output_path, container, overwrite)?;
        Ok::<_, ConvertError>((source, sink))
    })
    .await
    .map_err(|e| ConvertError::Internal(format!("Task join error: {e}")))??;

    Job {
        id,
        input: input.to_path_buf(),
        source,
        sink,
        codec: Arc::new(ImageCodec),
        transform: Arc::new(TransformStage::new(transform)),
        config: job.clone(),
    }
    .run(cancel)
    .await
}

/// One output path per input; repeated stems get a `-2`, `-3`… suffix.
fn output_paths(inputs: &[PathBuf], output_dir: &Path, container: OutputContainer) -> Vec<PathBuf> {
    let mut used = HashSet::new();
    inputs
        .iter()
        .map(|input| {
            // The input stem, not the output's: a directory named `Vol.1`
            // has no extension to strip.
            let stem = output_stem(input);
            let mut candidate = output_name(&stem, None, output_dir, container);
            let mut n = 2;
            while !used.insert(candidate.clone()) {
                candidate = output_name(&stem, Some(n), output_dir, container);
                n += 1;
            }
            candidate
        })
        .collect()
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>, has_pages: &mut bool) -> Result<(), ConvertError> {
    let entries = std::fs::read_dir(dir).map_err(|_| ConvertError::PermissionDenied {
        path: dir.to_path_buf(),
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "__MACOSX" {
            continue;
        }
        if path.is_dir() {
            walk(&path, found, has_pages)?;
            continue;
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
            found.push(path);
        } else if source::is_page_entry(&name) {
            *has_pages = true;
        }
    }
    Ok(())
}
