//! # comic2ink
//!
//! Convert comic and manga archives into e-ink friendly archives.
//!
//! ## Why this crate?
//!
//! Comic pages are usually large colour scans meant for a monitor. On an
//! e-reader they waste space, render slowly and look muddy. This crate
//! rewrites each page for a target device: spreads split, fit to the
//! screen, levels stretched, gray depth reduced with dithering. It streams
//! pages through a worker pool so a 2 GB archive converts in bounded memory,
//! and it writes pages back in reading order no matter which worker
//! finishes first.
//!
//! ## Pipeline Overview
//!
//! ```text
//! archive (.cbz / .zip / directory)
//!  │
//!  ├─ 1. Source     sniff container, list pages in natural order
//!  ├─ 2. Budget     wait for memory budget (pages or bytes)
//!  ├─ 3. Decode     probe + decode (CPU-bound, spawn_blocking)
//!  ├─ 4. Transform  split → resize → autocontrast → gamma → dither
//!  ├─ 5. Encode     PNG / JPEG, budget released
//!  ├─ 6. Reorder    park early pages until their turn
//!  └─ 7. Sink       staged .cbz, promoted atomically on success
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use comic2ink::{convert, profile, Budget, JobConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transform = profile::resolve("kindle-paperwhite")?.transform_config();
//!     let job = JobConfig::builder()
//!         .concurrency(4)
//!         .budget(Budget::Bytes(256 * 1024 * 1024))
//!         .build()?;
//!     let report = convert("onepiece-v01.cbz", "kindle/onepiece-v01.cbz", &job, &transform).await?;
//!     eprintln!(
//!         "{} pages, peak {} budget units in flight",
//!         report.written_pages, report.stats.peak_in_flight
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `comic2ink` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! comic2ink = { version = "0.1", default-features = false }
//! ```
//!
//! ## Choosing a Budget
//!
//! | Budget | Charges | Best for |
//! |--------|---------|----------|
//! | `Budget::Pages(n)` | 1 per page | Uniform scans, simplest |
//! | `Budget::Bytes(n)` | decoded size (KiB) | Mixed sizes, hard memory caps |
//!
//! Byte budgets estimate each page before decoding it (from the image
//! header by default) and re-charge after decoding if the estimate was low.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod page;
pub mod pipeline;
pub mod profile;
pub mod progress;
pub mod scheduler;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    Budget, ColorMode, DitherMode, FailurePolicy, Fit, JobConfig, JobConfigBuilder, OutputContainer,
    OutputFormat, ResizeFilter, SizeEstimate, SplitPolicy, TransformConfig, TransformConfigBuilder,
};
pub use convert::{
    convert, convert_batch, convert_bytes, convert_sync, convert_with_cancel, discover_inputs,
    inspect, output_path_for,
};
pub use error::{ConvertError, ErrorKind, PageError};
pub use output::{ArchiveInfo, BatchEntry, BatchReport, JobId, JobReport, JobStats};
pub use page::{PageIndex, PageKey};
pub use pipeline::source::ContainerKind;
pub use profile::DeviceProfile;
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use tokio_util::sync::CancellationToken;
