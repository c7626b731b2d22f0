//! Archive sinks: stream encoded pages into an output container.
//!
//! Every sink stages its output under `<target>.partial` and only renames
//! it to `<target>` in [`ArchiveSink::close`]. Whatever happens before
//! that (abort, cancellation, a crash, a dropped sink) never leaves a file
//! at the target path that a reader could mistake for a complete archive.

use crate::config::OutputContainer;
use crate::error::ConvertError;
use crate::page::{EncodedPage, PageKey};
use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Incremental writer for one output container.
///
/// Owned by the scheduler's writer loop; pages arrive in strictly
/// increasing key order.
pub trait ArchiveSink: Send {
    /// Append one page.
    fn write(&mut self, page: &EncodedPage) -> Result<(), ConvertError>;

    /// Entries written so far.
    fn written(&self) -> usize;

    /// Finalise the container and move it into place. Returns the target path.
    fn close(self: Box<Self>) -> Result<PathBuf, ConvertError>;

    /// Discard everything written so far.
    fn abort(self: Box<Self>);
}

/// Open a sink for `target`.
///
/// Fails with [`ConvertError::OutputExists`] when `target` exists and
/// `overwrite` is off. A stale staging path from an earlier interrupted
/// run is removed.
pub fn open_sink(
    target: &Path,
    container: OutputContainer,
    overwrite: bool,
) -> Result<Box<dyn ArchiveSink>, ConvertError> {
    if target.exists() && !overwrite {
        return Err(ConvertError::OutputExists {
            path: target.to_path_buf(),
        });
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ConvertError::sink(parent, e))?;
    }

    let staging = staging_path(target);
    remove_path(&staging).map_err(|e| ConvertError::sink(&staging, e))?;

    match container {
        OutputContainer::Cbz => Ok(Box::new(ZipSink::create(target, staging)?)),
        OutputContainer::Directory => Ok(Box::new(DirSink::create(target, staging)?)),
    }
}

/// `<target>.partial`
pub fn staging_path(target: &Path) -> PathBuf {
    let mut s = OsString::from(target.as_os_str());
    s.push(".partial");
    PathBuf::from(s)
}

// ── Zip ──────────────────────────────────────────────────────────────────

/// CBZ output: stored (uncompressed) entries with a fixed timestamp, so
/// two runs over the same input produce byte-identical archives.
pub struct ZipSink {
    target: PathBuf,
    staging: PathBuf,
    writer: ZipWriter<File>,
    last: Option<PageKey>,
    written: usize,
}

impl ZipSink {
    fn create(target: &Path, staging: PathBuf) -> Result<Self, ConvertError> {
        let file = File::create(&staging).map_err(|e| ConvertError::sink(&staging, e))?;
        debug!("Staging CBZ at '{}'", staging.display());
        Ok(Self {
            target: target.to_path_buf(),
            staging,
            writer: ZipWriter::new(file),
            last: None,
            written: 0,
        })
    }

    fn entry_options() -> SimpleFileOptions {
        // Page payloads are already compressed images.
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644)
    }
}

impl ArchiveSink for ZipSink {
    fn write(&mut self, page: &EncodedPage) -> Result<(), ConvertError> {
        debug_assert!(self.last.map_or(true, |last| last < page.key));
        let name = page.entry_name();
        self.writer
            .start_file(name.as_str(), Self::entry_options())
            .map_err(|e| ConvertError::sink(&self.staging, e.into()))?;
        self.writer
            .write_all(&page.data)
            .map_err(|e| ConvertError::sink(&self.staging, e))?;
        self.last = Some(page.key);
        self.written += 1;
        Ok(())
    }

    fn written(&self) -> usize {
        self.written
    }

    fn close(self: Box<Self>) -> Result<PathBuf, ConvertError> {
        let ZipSink {
            target,
            staging,
            writer,
            written,
            ..
        } = *self;
        discard_on_error(&staging, || {
            let file = writer
                .finish()
                .map_err(|e| ConvertError::sink(&staging, e.into()))?;
            file.sync_all().map_err(|e| ConvertError::sink(&staging, e))?;
            drop(file);
            promote(&staging, &target)
        })?;
        debug!("Wrote CBZ '{}' ({written} entries)", target.display());
        Ok(target)
    }

    fn abort(self: Box<Self>) {
        let staging = self.staging.clone();
        drop(self);
        if let Err(e) = remove_path(&staging) {
            warn!("Failed to remove '{}': {e}", staging.display());
        }
    }
}

// ── Directory ────────────────────────────────────────────────────────────

/// Output as a plain directory of page files.
pub struct DirSink {
    target: PathBuf,
    staging: PathBuf,
    last: Option<PageKey>,
    written: usize,
}

impl DirSink {
    fn create(target: &Path, staging: PathBuf) -> Result<Self, ConvertError> {
        std::fs::create_dir_all(&staging).map_err(|e| ConvertError::sink(&staging, e))?;
        Ok(Self {
            target: target.to_path_buf(),
            staging,
            last: None,
            written: 0,
        })
    }
}

impl ArchiveSink for DirSink {
    fn write(&mut self, page: &EncodedPage) -> Result<(), ConvertError> {
        debug_assert!(self.last.map_or(true, |last| last < page.key));
        let path = self.staging.join(page.entry_name());
        std::fs::write(&path, &page.data).map_err(|e| ConvertError::sink(&path, e))?;
        self.last = Some(page.key);
        self.written += 1;
        Ok(())
    }

    fn written(&self) -> usize {
        self.written
    }

    fn close(self: Box<Self>) -> Result<PathBuf, ConvertError> {
        discard_on_error(&self.staging, || promote(&self.staging, &self.target))?;
        debug!(
            "Wrote directory '{}' ({} entries)",
            self.target.display(),
            self.written
        );
        Ok(self.target)
    }

    fn abort(self: Box<Self>) {
        if let Err(e) = remove_path(&self.staging) {
            warn!("Failed to remove '{}': {e}", self.staging.display());
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Move the staged output over `target`, replacing what is there.
fn promote(staging: &Path, target: &Path) -> Result<(), ConvertError> {
    remove_path(target).map_err(|e| ConvertError::sink(target, e))?;
    std::fs::rename(staging, target).map_err(|e| ConvertError::sink(target, e))
}

/// Run the finalising step `f`; if it fails, remove the staged output the
/// way [`ArchiveSink::abort`] would.
fn discard_on_error<T>(
    staging: &Path,
    f: impl FnOnce() -> Result<T, ConvertError>,
) -> Result<T, ConvertError> {
    f().inspect_err(|_| {
        if let Err(e) = remove_path(staging) {
            warn!("Failed to remove '{}': {e}", staging.display());
        }
    })
}

/// Remove a file or directory tree; a missing path is not an error.
fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    fn page(index: usize, part: u8, parts: u8, data: &[u8]) -> EncodedPage {
        EncodedPage {
            key: PageKey::split(index, part, parts),
            extension: "png",
            data: data.to_vec(),
        }
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(str::to_string).collect::<Vec<_>>()
    }

    #[test]
    fn failed_finalise_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = staging_path(&dir.path().join("out.cbz"));
        std::fs::write(&staging, b"half an archive").unwrap();

        let err = discard_on_error(&staging, || -> Result<(), ConvertError> {
            Err(ConvertError::sink(&staging, std::io::Error::other("disk full")))
        })
        .unwrap_err();
        assert!(matches!(err, ConvertError::SinkWrite { .. }));
        assert!(!staging.exists());

        std::fs::write(&staging, b"fine").unwrap();
        discard_on_error(&staging, || Ok(())).unwrap();
        assert!(staging.exists());
    }

    #[test]
    fn zip_sink_stages_then_renames() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.cbz");
        let mut sink = open_sink(&target, OutputContainer::Cbz, false).unwrap();

        sink.write(&page(0, 0, 1, b"zero")).unwrap();
        sink.write(&page(1, 0, 2, b"one-a")).unwrap();
        sink.write(&page(1, 1, 2, b"one-b")).unwrap();
        assert!(!target.exists(), "target must not exist before close");
        assert!(staging_path(&target).exists());
        assert_eq!(sink.written(), 3);

        let out = sink.close().unwrap();
        assert_eq!(out, target);
        assert!(!staging_path(&target).exists());

        let mut names = zip_names(&target);
        names.sort();
        assert_eq!(names, vec!["00000.png", "00001a.png", "00001b.png"]);

        let mut archive = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        let mut data = String::new();
        archive
            .by_name("00001b.png")
            .unwrap()
            .read_to_string(&mut data)
            .unwrap();
        assert_eq!(data, "one-b");
    }

    #[test]
    fn aborted_zip_sink_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.cbz");
        let mut sink = open_sink(&target, OutputContainer::Cbz, false).unwrap();
        sink.write(&page(0, 0, 1, b"zero")).unwrap();
        sink.abort();
        assert!(!target.exists());
        assert!(!staging_path(&target).exists());
    }

    #[test]
    fn dropped_sink_leaves_only_partial() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.cbz");
        let mut sink = open_sink(&target, OutputContainer::Cbz, false).unwrap();
        sink.write(&page(0, 0, 1, b"zero")).unwrap();
        drop(sink);
        assert!(!target.exists());
        assert!(staging_path(&target).exists());

        // a fresh run clears the stale staging file
        let sink = open_sink(&target, OutputContainer::Cbz, false).unwrap();
        sink.close().unwrap();
        assert!(zip_names(&target).is_empty());
    }

    #[test]
    fn existing_output_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.cbz");
        std::fs::write(&target, b"old").unwrap();

        let err = open_sink(&target, OutputContainer::Cbz, false)
            .err()
            .unwrap();
        assert!(matches!(err, ConvertError::OutputExists { .. }));

        let mut sink = open_sink(&target, OutputContainer::Cbz, true).unwrap();
        sink.write(&page(0, 0, 1, b"new")).unwrap();
        sink.close().unwrap();
        assert_eq!(zip_names(&target), vec!["00000.png"]);
    }

    #[test]
    fn zip_output_is_byte_identical_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut outputs = Vec::new();
        for name in ["a.cbz", "b.cbz"] {
            let target = dir.path().join(name);
            let mut sink = open_sink(&target, OutputContainer::Cbz, false).unwrap();
            sink.write(&page(0, 0, 1, b"zero")).unwrap();
            sink.write(&page(1, 0, 1, b"one")).unwrap();
            sink.close().unwrap();
            outputs.push(std::fs::read(&target).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn dir_sink_writes_page_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out");
        let mut sink = open_sink(&target, OutputContainer::Directory, false).unwrap();
        sink.write(&page(3, 0, 1, b"three")).unwrap();
        assert!(!target.exists());
        sink.close().unwrap();

        assert_eq!(std::fs::read(target.join("00003.png")).unwrap(), b"three");
        assert!(!staging_path(&target).exists());
    }

    #[test]
    fn aborted_dir_sink_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        let mut sink = open_sink(&target, OutputContainer::Directory, false).unwrap();
        sink.write(&page(0, 0, 1, b"x")).unwrap();
        sink.abort();
        assert!(!target.exists());
        assert!(!staging_path(&target).exists());
    }
}
