//! Progress-callback trait for per-page conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::JobConfigBuilder::progress_callback`] to receive events
//! as the scheduler writes or gives up on each page.
//!
//! The callback is the only reporting channel the library owns: no global
//! logger state, no stdout. The binary renders it as a progress bar, a
//! server could forward it to a websocket.
//!
//! # Example
//!
//! ```rust
//! use comic2ink::{ConversionProgressCallback, JobConfig, JobId, PageKey};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     written: AtomicUsize,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_page_written(&self, _job: JobId, key: PageKey, bytes: usize) {
//!         self.written.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {key} written ({bytes} bytes)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { written: AtomicUsize::new(0) });
//!
//! let config = JobConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::PageError;
use crate::output::{JobId, JobReport};
use crate::page::PageKey;
use std::sync::Arc;

/// Called by the scheduler as a job progresses.
///
/// Implementations must be `Send + Sync`. All methods have default no-op
/// implementations so callers only override what they care about.
///
/// # Thread safety
///
/// Page events are raised from the job's single writer loop, in page
/// order, so within one job they never overlap. Batch conversions running
/// several jobs at once share the callback across jobs; tell them apart by
/// `job`.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once after the archive is opened.
    ///
    /// # Arguments
    /// * `job`        : job identifier
    /// * `total_pages`: page count if the container knows it up front
    fn on_job_start(&self, job: JobId, total_pages: Option<usize>) {
        let _ = (job, total_pages);
    }

    /// Called when an output page has been appended to the sink.
    ///
    /// A split spread raises this twice, once per half.
    fn on_page_written(&self, job: JobId, key: PageKey, bytes: usize) {
        let _ = (job, key, bytes);
    }

    /// Called when a page is given up on (skip mode) or aborts the job.
    fn on_page_failed(&self, job: JobId, error: &PageError) {
        let _ = (job, error);
    }

    /// Called once after the output has been finalised.
    fn on_job_complete(&self, job: JobId, report: &JobReport) {
        let _ = (job, report);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::JobConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
