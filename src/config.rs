//! Configuration types for archive conversion.
//!
//! Two structs split the knobs by lifetime and sharing:
//!
//! * [`TransformConfig`]: what a page should look like on the target
//!   device. Immutable once a job starts and shared by reference across all
//!   workers, so every worker produces the same bytes for the same input.
//! * [`JobConfig`]: how the pipeline runs: concurrency degree, memory
//!   budget, failure policy, per-page deadline and progress reporting.
//!
//! Both are built through builders that validate in `build()`, so an invalid
//! combination surfaces as [`ConvertError::InvalidConfig`] before any archive
//! is opened.

use crate::error::ConvertError;
use crate::progress::ProgressCallback;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

// ── Transform configuration ──────────────────────────────────────────────

/// Device-targeted image pipeline settings.
///
/// # Example
/// ```rust
/// use comic2ink::{DitherMode, SplitPolicy, TransformConfig};
///
/// let config = TransformConfig::builder()
///     .size(1072, 1448)
///     .bits_per_pixel(4)
///     .dither(DitherMode::FloydSteinberg)
///     .split(SplitPolicy::RightToLeft)
///     .build()
///     .unwrap();
/// assert_eq!(config.levels(), 16);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Maximum output width in pixels; 0 keeps the source width. Default: 1920.
    pub width: u32,

    /// Maximum output height in pixels; 0 keeps the source height. Default: 1920.
    pub height: u32,

    /// Enlarge pages smaller than the target box. Default: false.
    pub upscale: bool,

    /// How the page is fitted into the target box. Default: [`Fit::Contain`].
    pub fit: Fit,

    /// Resampling filter. Default: [`ResizeFilter::CatmullRom`].
    pub filter: ResizeFilter,

    /// Grayscale or colour output. Default: [`ColorMode::Grayscale`].
    pub color: ColorMode,

    /// Gray levels are `2^bits_per_pixel`, 1–8. Default: 4 (16 levels).
    ///
    /// Most e-ink panels render 16 gray levels; anything beyond that is
    /// wasted bytes. Ignored in colour mode.
    pub bits_per_pixel: u8,

    /// Dithering used when reducing gray levels. Default: [`DitherMode::FloydSteinberg`].
    pub dither: DitherMode,

    /// Percent of darkest and brightest pixels ignored when stretching the
    /// histogram, 0–49. With 0 the range `[0, max]` is still stretched
    /// unless the page already reaches white. Default: 1.
    pub autocontrast_cutoff: u8,

    /// Gamma modifier. Values < 1 darken the image, values > 1 brighten it.
    /// Default: 0.75.
    pub gamma: f64,

    /// Double-page spread handling. Default: [`SplitPolicy::Off`].
    pub split: SplitPolicy,

    /// Codec of the output pages. Default: [`OutputFormat::Png`].
    pub output_format: OutputFormat,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1920,
            upscale: false,
            fit: Fit::default(),
            filter: ResizeFilter::default(),
            color: ColorMode::default(),
            bits_per_pixel: 4,
            dither: DitherMode::default(),
            autocontrast_cutoff: 1,
            gamma: 0.75,
            split: SplitPolicy::default(),
            output_format: OutputFormat::default(),
        }
    }
}

impl TransformConfig {
    /// Create a new builder for `TransformConfig`.
    pub fn builder() -> TransformConfigBuilder {
        TransformConfigBuilder {
            config: Self::default(),
        }
    }

    /// Number of gray levels the output is quantized to.
    pub fn levels(&self) -> u16 {
        1u16 << self.bits_per_pixel.clamp(1, 8)
    }

    /// Check ranges; also run by the builder.
    pub fn validate(&self) -> Result<(), ConvertError> {
        if !(1..=8).contains(&self.bits_per_pixel) {
            return Err(ConvertError::InvalidConfig(format!(
                "bits per pixel must be 1–8, got {}",
                self.bits_per_pixel
            )));
        }
        if !(self.gamma.is_finite() && self.gamma > 0.0) {
            return Err(ConvertError::InvalidConfig(format!(
                "gamma must be > 0, got {}",
                self.gamma
            )));
        }
        if self.autocontrast_cutoff >= 50 {
            return Err(ConvertError::InvalidConfig(format!(
                "autocontrast cutoff must be below 50%, got {}",
                self.autocontrast_cutoff
            )));
        }
        if let OutputFormat::Jpeg { quality } = self.output_format {
            if !(1..=100).contains(&quality) {
                return Err(ConvertError::InvalidConfig(format!(
                    "JPEG quality must be 1–100, got {quality}"
                )));
            }
        }
        if matches!(self.fit, Fit::Pad | Fit::Crop) && (self.width == 0 || self.height == 0) {
            return Err(ConvertError::InvalidConfig(
                "pad and crop fitting need both a width and a height".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`TransformConfig`].
#[derive(Debug)]
pub struct TransformConfigBuilder {
    config: TransformConfig,
}

impl TransformConfigBuilder {
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    pub fn width(mut self, width: u32) -> Self {
        self.config.width = width;
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.config.height = height;
        self
    }

    pub fn upscale(mut self, v: bool) -> Self {
        self.config.upscale = v;
        self
    }

    pub fn fit(mut self, fit: Fit) -> Self {
        self.config.fit = fit;
        self
    }

    pub fn filter(mut self, filter: ResizeFilter) -> Self {
        self.config.filter = filter;
        self
    }

    pub fn color(mut self, color: ColorMode) -> Self {
        self.config.color = color;
        self
    }

    pub fn bits_per_pixel(mut self, bits: u8) -> Self {
        self.config.bits_per_pixel = bits;
        self
    }

    pub fn dither(mut self, dither: DitherMode) -> Self {
        self.config.dither = dither;
        self
    }

    pub fn autocontrast_cutoff(mut self, percent: u8) -> Self {
        self.config.autocontrast_cutoff = percent;
        self
    }

    pub fn gamma(mut self, gamma: f64) -> Self {
        self.config.gamma = gamma;
        self
    }

    pub fn split(mut self, split: SplitPolicy) -> Self {
        self.config.split = split;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<TransformConfig, ConvertError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// How a page is fitted into the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fit {
    /// Scale to fit inside the box, aspect ratio preserved. (default)
    #[default]
    Contain,
    /// Like `Contain`, then pad with white to exactly the box size.
    Pad,
    /// Scale to cover the box, then centre-crop to exactly the box size.
    Crop,
}

/// Resampling filter used when resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    /// (default)
    #[default]
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(f: ResizeFilter) -> Self {
        match f {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Output colour handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorMode {
    /// Luma only, quantized to `2^bits_per_pixel` levels. (default)
    #[default]
    Grayscale,
    /// Keep RGB for colour e-ink panels; only resize and gamma apply.
    Color,
}

/// Dithering algorithm applied during gray-level reduction.
///
/// Each page is dithered on its own with no state carried between pages,
/// which is what lets pages be processed in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DitherMode {
    /// Round to the nearest level.
    None,
    /// 8×8 Bayer threshold matrix.
    Ordered,
    /// Serpentine Floyd-Steinberg error diffusion. (default)
    #[default]
    FloydSteinberg,
    /// Atkinson diffusion (75% of the error), crisper on line art.
    Atkinson,
}

/// Double-page spread handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SplitPolicy {
    /// Never split. (default)
    #[default]
    Off,
    /// Split landscape pages, left half first (western comics).
    LeftToRight,
    /// Split landscape pages, right half first (manga).
    RightToLeft,
}

/// Codec used for the output pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Lossless; grayscale pages stay 8-bit luma. (default)
    #[default]
    Png,
    Jpeg { quality: u8 },
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg { .. } => "jpg",
        }
    }
}

// ── Job configuration ────────────────────────────────────────────────────

/// Cap on decoded page memory resident at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Budget {
    /// At most this many pages decoded at once.
    Pages(usize),
    /// At most this many bytes of decoded pixel data at once.
    Bytes(u64),
}

impl Default for Budget {
    fn default() -> Self {
        Budget::Bytes(512 * MIB)
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Budget::Pages(n) => write!(f, "{n} pages"),
            Budget::Bytes(n) => write!(f, "{} MiB", n / MIB),
        }
    }
}

/// What to do when a single page cannot be read, decoded or encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Fail the whole job; the output is never finalised. (default)
    #[default]
    Abort,
    /// Record the page as skipped and keep going.
    Skip,
}

/// How a page's decoded size is estimated before decoding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeEstimate {
    /// Read the dimensions from the image header; fall back to
    /// `compressed size × 10` when the header is unreadable. (default)
    #[default]
    HeaderProbe,
    /// Assume `compressed size × ratio` without touching the header.
    CompressedRatio(u32),
}

/// Kind of output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputContainer {
    /// Zip archive with stored entries. (default)
    #[default]
    Cbz,
    /// Plain directory of page files.
    Directory,
}

/// Pipeline settings for one conversion job.
///
/// # Example
/// ```rust
/// use comic2ink::{Budget, FailurePolicy, JobConfig};
///
/// let config = JobConfig::builder()
///     .concurrency(4)
///     .budget(Budget::Pages(3))
///     .failure_policy(FailurePolicy::Skip)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 4);
/// ```
#[derive(Clone)]
pub struct JobConfig {
    /// Number of worker tasks. Default: available parallelism.
    pub concurrency: usize,

    /// Memory cap on decoded pages. Default: 512 MiB.
    pub budget: Budget,

    /// Minimum charge per page in byte mode. Default: 8 MiB.
    ///
    /// Also the unit of the start-up check `budget ≥ concurrency × floor`.
    pub page_floor_bytes: u64,

    /// Per-page failure handling. Default: [`FailurePolicy::Abort`].
    pub failure_policy: FailurePolicy,

    /// Decoded-size estimation strategy. Default: [`SizeEstimate::HeaderProbe`].
    pub size_estimate: SizeEstimate,

    /// Deadline for one page's decode/transform/encode. Default: none.
    pub page_timeout: Option<Duration>,

    /// Output container kind. Default: [`OutputContainer::Cbz`].
    pub container: OutputContainer,

    /// Replace an existing output. Default: false.
    pub overwrite: bool,

    /// Archives converted at once by [`crate::convert::convert_batch`].
    /// Each runs its own worker pool and budget. Default: 1.
    pub archive_concurrency: usize,

    /// Receives per-page events. Default: none.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            budget: Budget::default(),
            page_floor_bytes: 8 * MIB,
            failure_policy: FailurePolicy::default(),
            size_estimate: SizeEstimate::default(),
            page_timeout: None,
            container: OutputContainer::default(),
            overwrite: false,
            archive_concurrency: 1,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("concurrency", &self.concurrency)
            .field("budget", &self.budget)
            .field("page_floor_bytes", &self.page_floor_bytes)
            .field("failure_policy", &self.failure_policy)
            .field("size_estimate", &self.size_estimate)
            .field("page_timeout", &self.page_timeout)
            .field("container", &self.container)
            .field("overwrite", &self.overwrite)
            .field("archive_concurrency", &self.archive_concurrency)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl JobConfig {
    /// Create a new builder for `JobConfig`.
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check that the budget can feed the configured worker count.
    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.concurrency == 0 {
            return Err(ConvertError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        match self.budget {
            Budget::Pages(0) => Err(ConvertError::InvalidConfig(
                "Page budget must be ≥ 1".into(),
            )),
            Budget::Pages(_) => Ok(()),
            Budget::Bytes(bytes) => {
                if bytes < 1024 {
                    return Err(ConvertError::InvalidConfig(format!(
                        "Byte budget must be at least 1 KiB, got {bytes}"
                    )));
                }
                if self.page_floor_bytes == 0 {
                    return Err(ConvertError::InvalidConfig(
                        "Per-page floor must be > 0 bytes".into(),
                    ));
                }
                let needed = self.page_floor_bytes.saturating_mul(self.concurrency as u64);
                if bytes < needed {
                    return Err(ConvertError::InvalidConfig(format!(
                        "Budget of {bytes} bytes cannot feed {} workers at {} bytes per page \
                         (need ≥ {needed})",
                        self.concurrency, self.page_floor_bytes
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Builder for [`JobConfig`].
#[derive(Debug)]
pub struct JobConfigBuilder {
    config: JobConfig,
}

impl JobConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn budget(mut self, budget: Budget) -> Self {
        self.config.budget = budget;
        self
    }

    pub fn page_floor_bytes(mut self, bytes: u64) -> Self {
        self.config.page_floor_bytes = bytes;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn size_estimate(mut self, estimate: SizeEstimate) -> Self {
        self.config.size_estimate = estimate;
        self
    }

    pub fn page_timeout(mut self, timeout: Duration) -> Self {
        self.config.page_timeout = Some(timeout);
        self
    }

    pub fn container(mut self, container: OutputContainer) -> Self {
        self.config.container = container;
        self
    }

    pub fn overwrite(mut self, v: bool) -> Self {
        self.config.overwrite = v;
        self
    }

    pub fn archive_concurrency(mut self, n: usize) -> Self {
        self.config.archive_concurrency = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<JobConfig, ConvertError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_defaults() {
        let c = TransformConfig::default();
        assert_eq!((c.width, c.height), (1920, 1920));
        assert!(!c.upscale);
        assert_eq!(c.autocontrast_cutoff, 1);
        assert_eq!(c.filter, ResizeFilter::CatmullRom);
        assert!((c.gamma - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn transform_rejects_bad_bits_and_gamma() {
        assert!(TransformConfig::builder().bits_per_pixel(0).build().is_err());
        assert!(TransformConfig::builder().bits_per_pixel(9).build().is_err());
        assert!(TransformConfig::builder().gamma(0.0).build().is_err());
        assert!(TransformConfig::builder().gamma(f64::NAN).build().is_err());
        assert!(TransformConfig::builder()
            .autocontrast_cutoff(50)
            .build()
            .is_err());
    }

    #[test]
    fn pad_needs_both_dimensions() {
        let err = TransformConfig::builder()
            .size(0, 800)
            .fit(Fit::Pad)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));
    }

    #[test]
    fn jpeg_quality_range() {
        assert!(TransformConfig::builder()
            .output_format(OutputFormat::Jpeg { quality: 0 })
            .build()
            .is_err());
        let c = TransformConfig::builder()
            .output_format(OutputFormat::Jpeg { quality: 85 })
            .build()
            .unwrap();
        assert_eq!(c.output_format.extension(), "jpg");
    }

    #[test]
    fn levels_from_bits() {
        let c = TransformConfig::builder().bits_per_pixel(1).build().unwrap();
        assert_eq!(c.levels(), 2);
        let c = TransformConfig::builder().bits_per_pixel(8).build().unwrap();
        assert_eq!(c.levels(), 256);
    }

    #[test]
    fn byte_budget_must_cover_every_worker() {
        let err = JobConfig::builder()
            .concurrency(8)
            .page_floor_bytes(10 * MIB)
            .budget(Budget::Bytes(40 * MIB))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));

        assert!(JobConfig::builder()
            .concurrency(4)
            .page_floor_bytes(10 * MIB)
            .budget(Budget::Bytes(40 * MIB))
            .build()
            .is_ok());
    }

    #[test]
    fn byte_budget_below_one_kib_is_rejected() {
        let err = JobConfig::builder()
            .concurrency(1)
            .page_floor_bytes(1)
            .budget(Budget::Bytes(1000))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));
    }

    #[test]
    fn page_budget_smaller_than_workers_is_allowed() {
        let c = JobConfig::builder()
            .concurrency(4)
            .budget(Budget::Pages(3))
            .build()
            .unwrap();
        assert_eq!(c.budget, Budget::Pages(3));
        assert!(JobConfig::builder()
            .budget(Budget::Pages(0))
            .build()
            .is_err());
    }

    #[test]
    fn concurrency_is_clamped_to_one() {
        let c = JobConfig::builder()
            .concurrency(0)
            .budget(Budget::Pages(1))
            .build()
            .unwrap();
        assert_eq!(c.concurrency, 1);
    }

    #[test]
    fn transform_config_serde_roundtrip_keeps_enums_readable() {
        let c = TransformConfig::builder()
            .split(SplitPolicy::RightToLeft)
            .build()
            .unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"right-to-left\""), "got: {json}");
        let back: TransformConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
