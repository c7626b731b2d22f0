//! Error types for the comic2ink library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ConvertError`]: **Fatal**: the job cannot proceed at all (bad
//!   configuration, unrecognised container, output storage failure). Returned
//!   as `Err(ConvertError)` from the top-level `convert*` functions.
//!
//! * [`PageError`]: **Per-page**: a single page could not be read, decoded
//!   or encoded but the rest of the archive is fine. Whether it aborts the
//!   job or is recorded as skipped depends on
//!   [`crate::config::FailurePolicy`].

use crate::page::PageIndex;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the comic2ink library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A device profile name that is not in the catalog.
    #[error("Unknown device profile '{name}'\nRun with --list-profiles to see the available presets.")]
    UnknownProfile { name: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input path does not exist.
    #[error("Input not found: '{path}'")]
    InputNotFound { path: PathBuf },

    /// Process does not have read permission on the input.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The magic bytes do not belong to a container we can read.
    #[error("Unsupported container '{path}': {format}")]
    UnsupportedContainer { path: PathBuf, format: String },

    /// The container was recognised but its table of contents is unreadable.
    #[error("Archive '{path}' is corrupt: {detail}")]
    CorruptContainer { path: PathBuf, detail: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// One page needs more memory than the whole budget allows.
    #[error(
        "Page {index} needs {required} budget units but the whole budget is {budget}\n\
         Raise --budget-mb or lower the concurrency."
    )]
    OversizedPage {
        index: PageIndex,
        required: u64,
        budget: u64,
    },

    /// A page failed while the job runs under [`crate::config::FailurePolicy::Abort`].
    #[error("Aborted: {0}\nUse --skip-bad-pages to continue past unreadable pages.")]
    PageFailed(PageError),

    /// Some pages were skipped.
    ///
    /// Returned by [`crate::output::JobReport::into_result`] when the caller
    /// wants to treat any skipped page as an error.
    #[error("{skipped}/{total} pages were skipped during conversion")]
    PartialFailure { skipped: usize, total: usize },

    /// The job was cancelled before it finished.
    #[error("Conversion cancelled after {written} pages")]
    Cancelled { written: usize },

    // ── Output errors ─────────────────────────────────────────────────────
    /// The output container could not be written or finalised.
    #[error("Failed to write output '{path}': {source}")]
    SinkWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output path already exists and overwriting is disabled.
    #[error("Output '{path}' already exists\nPass --overwrite to replace it.")]
    OutputExists { path: PathBuf },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ConvertError`], used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Raised before any work starts.
    Configuration,
    /// The archive itself (or one of its pages) is the problem.
    Archive,
    /// Storage-level failure.
    Io,
}

impl ConvertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::InvalidConfig(_) | ConvertError::UnknownProfile { .. } => {
                ErrorKind::Configuration
            }
            ConvertError::SinkWrite { .. }
            | ConvertError::OutputExists { .. }
            | ConvertError::PermissionDenied { .. } => ErrorKind::Io,
            ConvertError::InputNotFound { .. }
            | ConvertError::UnsupportedContainer { .. }
            | ConvertError::CorruptContainer { .. }
            | ConvertError::OversizedPage { .. }
            | ConvertError::PageFailed(_)
            | ConvertError::PartialFailure { .. }
            | ConvertError::Cancelled { .. }
            | ConvertError::Internal(_) => ErrorKind::Archive,
        }
    }

    pub(crate) fn sink(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConvertError::SinkWrite {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The container entry could not be read.
    #[error("Page {index}: entry '{name}' unreadable: {detail}")]
    EntryRead {
        index: PageIndex,
        name: String,
        detail: String,
    },

    /// The payload is not a decodable image.
    #[error("Page {index}: decode failed: {detail}")]
    Decode { index: PageIndex, detail: String },

    /// The magic bytes disagree with the entry's file extension.
    #[error("Page {index}: content is {actual} but the entry is named as {declared}")]
    FormatMismatch {
        index: PageIndex,
        declared: String,
        actual: String,
    },

    /// Re-encoding the transformed page failed.
    #[error("Page {index}: encode failed: {detail}")]
    Encode { index: PageIndex, detail: String },

    /// The per-page deadline expired.
    #[error("Page {index}: timed out after {millis}ms")]
    Timeout { index: PageIndex, millis: u64 },
}

impl PageError {
    /// Logical index of the page this error belongs to.
    pub fn index(&self) -> PageIndex {
        match self {
            PageError::EntryRead { index, .. }
            | PageError::Decode { index, .. }
            | PageError::FormatMismatch { index, .. }
            | PageError::Encode { index, .. }
            | PageError::Timeout { index, .. } => *index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_display() {
        let e = ConvertError::PartialFailure {
            skipped: 1,
            total: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("1/10"), "got: {msg}");
    }

    #[test]
    fn oversized_page_display_names_page_and_budget() {
        let e = ConvertError::OversizedPage {
            index: 7,
            required: 4096,
            budget: 1024,
        };
        let msg = e.to_string();
        assert!(msg.contains("Page 7"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn kinds_map_to_exit_classes() {
        assert_eq!(
            ConvertError::InvalidConfig("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            ConvertError::UnknownProfile { name: "x".into() }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            ConvertError::sink("/tmp/out.cbz", std::io::Error::other("disk full")).kind(),
            ErrorKind::Io
        );
        assert_eq!(
            ConvertError::CorruptContainer {
                path: "a.cbz".into(),
                detail: "bad".into()
            }
            .kind(),
            ErrorKind::Archive
        );
    }

    #[test]
    fn page_error_index() {
        let e = PageError::Decode {
            index: 4,
            detail: "truncated".into(),
        };
        assert_eq!(e.index(), 4);
        assert!(e.to_string().contains("Page 4"));
    }

    #[test]
    fn page_failed_wraps_page_error() {
        let e = ConvertError::PageFailed(PageError::Timeout {
            index: 2,
            millis: 1500,
        });
        assert!(e.to_string().contains("1500ms"));
    }
}
