//! Bounded pipeline scheduler: runs one archive through the page pipeline.
//!
//! ## Shape
//!
//! ```text
//!              ┌─────────── window (C permits) ───────────┐
//!  source ──►  worker × C  ──► completion channel ──► writer loop ──► sink
//!              └─ budget ─┘    (index, outcome)       reorder buffer
//! ```
//!
//! * **Workers** (a [`JoinSet`] of exactly `concurrency` tasks) claim the
//!   next page from the shared source, decode, transform and encode it on
//!   the blocking pool, and report the outcome on the completion channel.
//!   Per-page failures travel the same channel as successes.
//! * **Budget**: a worker holds a [`BudgetPermit`] from before decode until
//!   encode completes. Page budgets are acquired before the page is pulled,
//!   so the source cannot race ahead of slow encodes. Byte budgets need the
//!   page's size, so the raw page is pulled first and charged by its
//!   estimated decoded size.
//! * **Window**: a second semaphore with `concurrency` permits, held from
//!   claiming a page until the writer has written or skipped it. It keeps
//!   the reorder buffer below `concurrency` entries.
//! * **Writer**: the task that called [`Job::run`]. It parks completions in
//!   the [`ReorderBuffer`], drains every in-sequence page to the sink in one
//!   blocking call, and applies the [`FailurePolicy`]. It is the only owner
//!   of the sink.
//!
//! ## Termination
//!
//! The job succeeds once every worker has found the source exhausted and
//! every claimed page is written or skipped. A fatal error, an aborting
//! page failure or cancellation closes both semaphores, aborts the sink
//! (removing its staging output) and returns the error.

mod budget;
mod reorder;

pub use budget::{BudgetPermit, MemoryBudget};
pub use reorder::ReorderBuffer;

use crate::config::{FailurePolicy, JobConfig, OutputFormat, SizeEstimate};
use crate::error::{ConvertError, PageError};
use crate::output::{JobId, JobReport, JobStats};
use crate::page::{EncodedPage, PageIndex, RawPage};
use crate::pipeline::codec::PageCodec;
use crate::pipeline::sink::ArchiveSink;
use crate::pipeline::source::ArchiveSource;
use crate::pipeline::transform::TransformStage;
use crate::progress::ProgressCallback;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decoded-size multiplier applied to the compressed size when a page's
/// header cannot be probed.
const FALLBACK_RATIO: u64 = 10;

/// One archive conversion, ready to run.
pub struct Job {
    pub id: JobId,
    /// Input path, for the report.
    pub input: PathBuf,
    pub source: Box<dyn ArchiveSource>,
    pub sink: Box<dyn ArchiveSink>,
    pub codec: Arc<dyn PageCodec>,
    pub transform: Arc<TransformStage>,
    pub config: JobConfig,
}

impl Job {
    /// Run the job to completion.
    ///
    /// Returns a [`JobReport`] once the output is finalised, or the error
    /// that stopped the job; in that case the sink has been aborted.
    /// Cancelling `cancel` stops the job with [`ConvertError::Cancelled`].
    pub async fn run(self, cancel: CancellationToken) -> Result<JobReport, ConvertError> {
        let Job {
            id,
            input,
            source,
            sink,
            codec,
            transform,
            config,
        } = self;

        if let Err(e) = config.validate() {
            abort_sink(sink).await;
            return Err(e);
        }

        let started = Instant::now();
        let total = source.len();
        let callback = config.progress_callback.clone();
        if let Some(cb) = &callback {
            cb.on_job_start(id, total);
        }
        info!(
            job = id,
            concurrency = config.concurrency,
            budget = %config.budget,
            "Converting '{}' ({} pages)",
            input.display(),
            total.map_or_else(|| "?".to_string(), |n| n.to_string())
        );

        // Internal stop signal; also fires when the caller cancels.
        let stop = cancel.child_token();
        let budget = Arc::new(MemoryBudget::new(config.budget, config.page_floor_bytes));
        let window = Arc::new(Semaphore::new(config.concurrency));
        let ctx = Arc::new(WorkerContext {
            job: id,
            source: Mutex::new(source),
            codec,
            format: transform.config().output_format,
            transform,
            budget: Arc::clone(&budget),
            window: Arc::clone(&window),
            size_estimate: config.size_estimate,
            page_timeout: config.page_timeout,
            stop: stop.clone(),
            pulled: AtomicUsize::new(0),
            redecoded: AtomicUsize::new(0),
        });

        let (tx, mut rx) = mpsc::channel(config.concurrency);
        let mut workers = JoinSet::new();
        for _ in 0..config.concurrency {
            workers.spawn(run_worker(Arc::clone(&ctx), tx.clone()));
        }
        drop(tx);

        let mut writer = Writer {
            job: id,
            sink: Some(sink),
            reorder: ReorderBuffer::new(0),
            policy: config.failure_policy,
            callback: callback.clone(),
            written_pages: 0,
            written_entries: 0,
            skipped: Vec::new(),
            errors: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
        };
        let mut outcome = writer.drive(&mut rx, &stop).await;

        // Stop issuing permits and let in-flight workers wind down.
        stop.cancel();
        budget.close();
        window.close();
        drop(rx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() && outcome.is_ok() {
                    outcome = Err(ConvertError::Internal(format!("worker panicked: {e}")));
                }
            }
        }

        let pulled = ctx.pulled.load(Ordering::SeqCst);
        if outcome.is_ok() && (!writer.reorder.is_empty() || writer.reorder.next_to_write() != pulled)
        {
            outcome = Err(ConvertError::Internal(format!(
                "{} pages claimed but only {} accounted for",
                pulled,
                writer.reorder.next_to_write()
            )));
        }

        if let Err(e) = outcome {
            error!(job = id, "Conversion of '{}' failed: {e}", input.display());
            if let Some(sink) = writer.sink.take() {
                abort_sink(sink).await;
            }
            return Err(e);
        }

        let sink = writer
            .sink
            .take()
            .ok_or_else(|| ConvertError::Internal("sink lost before close".into()))?;
        let output = tokio::task::spawn_blocking(move || sink.close())
            .await
            .map_err(join_error)??;

        let report = JobReport {
            job: id,
            input,
            output,
            total_pages: pulled,
            written_pages: writer.written_pages,
            written_entries: writer.written_entries,
            skipped: writer.skipped,
            errors: writer.errors,
            stats: JobStats {
                bytes_in: writer.bytes_in,
                bytes_out: writer.bytes_out,
                budget_units: budget.capacity(),
                peak_in_flight: budget.peak(),
                peak_reorder: writer.reorder.high_water(),
                redecoded_pages: ctx.redecoded.load(Ordering::SeqCst),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        };

        info!(
            job = id,
            "Wrote '{}': {}/{} pages, {} skipped, {}ms",
            report.output.display(),
            report.written_pages,
            report.total_pages,
            report.skipped.len(),
            report.stats.duration_ms
        );
        if let Some(cb) = &callback {
            cb.on_job_complete(id, &report);
        }
        Ok(report)
    }
}

// ── Workers ──────────────────────────────────────────────────────────────

/// State shared by all workers of one job.
struct WorkerContext {
    job: JobId,
    source: Mutex<Box<dyn ArchiveSource>>,
    codec: Arc<dyn PageCodec>,
    transform: Arc<TransformStage>,
    format: OutputFormat,
    budget: Arc<MemoryBudget>,
    window: Arc<Semaphore>,
    size_estimate: SizeEstimate,
    page_timeout: Option<Duration>,
    stop: CancellationToken,
    /// Pages taken from the source, readable or not.
    pulled: AtomicUsize,
    redecoded: AtomicUsize,
}

enum Message {
    Page(Completion),
    Fatal(ConvertError),
}

/// A finished page on its way to the writer.
struct Completion {
    index: PageIndex,
    outcome: Result<Vec<EncodedPage>, PageError>,
    bytes_in: u64,
    /// Released once the writer is done with the page.
    window: OwnedSemaphorePermit,
}

/// A page taken from the source, with its estimated decoded size.
struct Claimed {
    index: PageIndex,
    page: Result<RawPage, PageError>,
    estimate: Estimate,
}

#[derive(Debug, Clone, Copy)]
struct Estimate {
    bytes: u64,
    /// Read from the image header rather than guessed.
    exact: bool,
}

enum WorkerError {
    Page(PageError),
    Fatal(ConvertError),
    Stopped,
}

enum Processed {
    Encoded(Vec<EncodedPage>),
    /// The decoded buffer was larger than the budget charged for it.
    Undercharged { measured: u64 },
}

async fn run_worker(ctx: Arc<WorkerContext>, tx: mpsc::Sender<Message>) {
    loop {
        let window = tokio::select! {
            _ = ctx.stop.cancelled() => return,
            permit = Arc::clone(&ctx.window).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        // Page budgets are taken before pulling so the source never runs
        // ahead of the encoders.
        let reserved = if ctx.budget.is_per_page() {
            match ctx.reserve(1).await {
                Some(permit) => Some(permit),
                None => return,
            }
        } else {
            None
        };

        let claimed = match ctx.pull().await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Message::Fatal(e)).await;
                return;
            }
        };

        let index = claimed.index;
        let mut bytes_in = 0;
        let outcome = match claimed.page {
            Err(e) => {
                warn!(job = ctx.job, page = index, "{e}");
                Err(e)
            }
            Ok(raw) => {
                bytes_in = raw.data.len() as u64;
                match ctx.convert_page(raw, claimed.estimate, reserved).await {
                    Ok(pages) => Ok(pages),
                    Err(WorkerError::Page(e)) => {
                        warn!(job = ctx.job, page = index, "{e}");
                        Err(e)
                    }
                    Err(WorkerError::Fatal(e)) => {
                        let _ = tx.send(Message::Fatal(e)).await;
                        return;
                    }
                    Err(WorkerError::Stopped) => return,
                }
            }
        };

        let done = Completion {
            index,
            outcome,
            bytes_in,
            window,
        };
        if tx.send(Message::Page(done)).await.is_err() {
            return;
        }
    }
}

impl WorkerContext {
    /// Wait for `units` of budget, giving up when the job stops.
    async fn reserve(&self, units: u64) -> Option<BudgetPermit> {
        tokio::select! {
            _ = self.stop.cancelled() => None,
            permit = self.budget.acquire(units) => permit,
        }
    }

    /// Charge the budget for a page of `estimate` decoded bytes.
    ///
    /// Charges are capped at the whole budget; only an exact size above
    /// the configured byte limit can never be satisfied and is fatal.
    async fn charge(&self, index: PageIndex, estimate: Estimate) -> Result<BudgetPermit, WorkerError> {
        let capacity = self.budget.capacity();
        let mut units = self.budget.units_for(estimate.bytes);
        if units > capacity {
            let exceeds = self
                .budget
                .limit_bytes()
                .is_some_and(|limit| estimate.bytes > limit);
            if estimate.exact && exceeds {
                return Err(WorkerError::Fatal(ConvertError::OversizedPage {
                    index,
                    required: units,
                    budget: capacity,
                }));
            }
            units = capacity;
        }
        self.reserve(units).await.ok_or(WorkerError::Stopped)
    }

    /// Take the next page from the source.
    async fn pull(self: &Arc<Self>) -> Result<Option<Claimed>, ConvertError> {
        let ctx = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let next = {
                let mut source = ctx
                    .source
                    .lock()
                    .map_err(|_| ConvertError::Internal("archive source lock poisoned".into()))?;
                source.next_page()
            };
            let Some(next) = next else {
                return Ok(None);
            };
            ctx.pulled.fetch_add(1, Ordering::SeqCst);

            Ok(Some(match next {
                Ok(raw) => Claimed {
                    index: raw.index,
                    estimate: ctx.estimate(&raw),
                    page: Ok(raw),
                },
                Err(e) => Claimed {
                    index: e.index(),
                    page: Err(e),
                    estimate: Estimate {
                        bytes: 0,
                        exact: false,
                    },
                },
            }))
        })
        .await
        .map_err(join_error)?
    }

    fn estimate(&self, raw: &RawPage) -> Estimate {
        let compressed = raw.data.len() as u64;
        if self.budget.is_per_page() {
            return Estimate {
                bytes: 0,
                exact: false,
            };
        }
        match self.size_estimate {
            SizeEstimate::HeaderProbe => match self.codec.probe(raw) {
                Ok(geometry) => Estimate {
                    bytes: geometry.decoded_bytes(),
                    exact: true,
                },
                Err(e) => {
                    debug!(job = self.job, page = raw.index, "header probe failed: {e}");
                    Estimate {
                        bytes: compressed.saturating_mul(FALLBACK_RATIO),
                        exact: false,
                    }
                }
            },
            SizeEstimate::CompressedRatio(ratio) => Estimate {
                bytes: compressed.saturating_mul(u64::from(ratio)),
                exact: false,
            },
        }
    }

    /// Decode, transform and encode one page under the budget.
    async fn convert_page(
        self: &Arc<Self>,
        raw: RawPage,
        estimate: Estimate,
        reserved: Option<BudgetPermit>,
    ) -> Result<Vec<EncodedPage>, WorkerError> {
        let index = raw.index;
        let permit = match reserved {
            Some(permit) => permit,
            None => self.charge(index, estimate).await?,
        };
        let limit = (!self.budget.is_per_page()).then(|| self.budget.bytes_covered(permit.units()));

        let (raw, processed) = self.process_blocking(raw, permit, limit).await?;
        let measured = match processed {
            Processed::Encoded(pages) => return Ok(pages),
            Processed::Undercharged { measured } => measured,
        };

        debug!(
            job = self.job,
            page = index,
            measured,
            "Decoded size above estimate; decoding again with a larger charge"
        );
        self.redecoded.fetch_add(1, Ordering::SeqCst);
        let exact = Estimate {
            bytes: measured,
            exact: true,
        };
        let permit = self.charge(index, exact).await?;
        match self.process_blocking(raw, permit, None).await?.1 {
            Processed::Encoded(pages) => Ok(pages),
            Processed::Undercharged { .. } => Err(WorkerError::Fatal(ConvertError::Internal(
                format!("page {index} undercharged twice"),
            ))),
        }
    }

    /// Run [`Self::process`] on the blocking pool, holding `permit` until it
    /// returns. The page's deadline, if any, bounds the wait; a page that
    /// misses it keeps its permit until the blocking work actually ends.
    async fn process_blocking(
        self: &Arc<Self>,
        raw: RawPage,
        permit: BudgetPermit,
        limit: Option<u64>,
    ) -> Result<(RawPage, Processed), WorkerError> {
        let index = raw.index;
        let ctx = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || {
            let result = ctx.process(&raw, limit);
            drop(permit);
            (raw, result)
        });

        let joined = match self.page_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    return Err(WorkerError::Page(PageError::Timeout {
                        index,
                        millis: deadline.as_millis() as u64,
                    }))
                }
            },
            None => handle.await,
        };
        let (raw, result) = joined.map_err(|e| WorkerError::Fatal(join_error(e)))?;
        let processed = result.map_err(WorkerError::Page)?;
        Ok((raw, processed))
    }

    /// Pixel buffers exist only inside this function.
    fn process(&self, raw: &RawPage, limit: Option<u64>) -> Result<Processed, PageError> {
        let image = self.codec.decode(raw)?;
        let measured = image.as_bytes().len() as u64;
        if limit.is_some_and(|limit| measured > limit) {
            return Ok(Processed::Undercharged { measured });
        }

        let pages = self
            .transform
            .apply(image, raw.index)
            .into_iter()
            .map(|(key, image)| {
                let data = self.codec.encode(&image, key, self.format)?;
                Ok(EncodedPage {
                    key,
                    extension: self.format.extension(),
                    data,
                })
            })
            .collect::<Result<Vec<_>, PageError>>()?;
        Ok(Processed::Encoded(pages))
    }
}

// ── Writer ───────────────────────────────────────────────────────────────

/// The single in-order consumer of worker completions.
struct Writer {
    job: JobId,
    sink: Option<Box<dyn ArchiveSink>>,
    reorder: ReorderBuffer<Completion>,
    policy: FailurePolicy,
    callback: Option<ProgressCallback>,
    written_pages: usize,
    written_entries: usize,
    skipped: Vec<PageIndex>,
    errors: Vec<PageError>,
    bytes_in: u64,
    bytes_out: u64,
}

impl Writer {
    /// Consume completions until every worker has finished.
    async fn drive(
        &mut self,
        rx: &mut mpsc::Receiver<Message>,
        stop: &CancellationToken,
    ) -> Result<(), ConvertError> {
        loop {
            let message = tokio::select! {
                biased;
                _ = stop.cancelled() => return Err(self.cancelled()),
                message = rx.recv() => message,
            };
            match message {
                None if stop.is_cancelled() => return Err(self.cancelled()),
                None => return Ok(()),
                Some(Message::Fatal(e)) => return Err(e),
                Some(Message::Page(done)) => {
                    self.bytes_in += done.bytes_in;
                    self.reorder.insert(done.index, done);
                    let ready = self.reorder.drain_ready();
                    self.flush(ready).await?;
                }
            }
        }
    }

    fn cancelled(&self) -> ConvertError {
        warn!(job = self.job, "Cancelled after {} pages", self.written_pages);
        ConvertError::Cancelled {
            written: self.written_pages,
        }
    }

    /// Write (or skip) a run of consecutive pages.
    async fn flush(&mut self, ready: Vec<(PageIndex, Completion)>) -> Result<(), ConvertError> {
        if ready.is_empty() {
            return Ok(());
        }
        let mut batch = Vec::new();
        let mut windows = Vec::with_capacity(ready.len());
        for (index, done) in ready {
            windows.push(done.window);
            match done.outcome {
                Ok(pages) => {
                    self.written_pages += 1;
                    batch.extend(pages);
                }
                Err(e) => {
                    if let Some(cb) = &self.callback {
                        cb.on_page_failed(self.job, &e);
                    }
                    match self.policy {
                        FailurePolicy::Skip => {
                            warn!(job = self.job, page = index, "Skipping page");
                            self.skipped.push(index);
                            self.errors.push(e);
                        }
                        FailurePolicy::Abort => return Err(ConvertError::PageFailed(e)),
                    }
                }
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| ConvertError::Internal("sink already closed".into()))?;
        let (sink, result) = tokio::task::spawn_blocking(move || {
            let mut written = Vec::with_capacity(batch.len());
            for page in &batch {
                if let Err(e) = sink.write(page) {
                    return (sink, Err(e));
                }
                written.push((page.key, page.data.len()));
            }
            (sink, Ok(written))
        })
        .await
        .map_err(join_error)?;
        self.sink = Some(sink);

        for (key, bytes) in result? {
            self.written_entries += 1;
            self.bytes_out += bytes as u64;
            debug!(job = self.job, page = %key, bytes, "Page written");
            if let Some(cb) = &self.callback {
                cb.on_page_written(self.job, key, bytes);
            }
        }
        drop(windows);
        Ok(())
    }
}

async fn abort_sink(sink: Box<dyn ArchiveSink>) {
    if let Err(e) = tokio::task::spawn_blocking(move || sink.abort()).await {
        warn!("Sink abort failed: {e}");
    }
}

fn join_error(e: tokio::task::JoinError) -> ConvertError {
    ConvertError::Internal(format!("Task join error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Budget, TransformConfig};
    use crate::page::PageKey;
    use crate::pipeline::codec::PageGeometry;
    use crate::pipeline::source::ContainerKind;
    use crate::progress::ConversionProgressCallback;
    use image::{DynamicImage, GrayImage, Luma};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    // ── Test doubles ─────────────────────────────────────────────────────

    /// Source emitting `n` tiny payloads; listed indices are unreadable.
    struct SyntheticSource {
        count: usize,
        unreadable: HashSet<usize>,
        cursor: usize,
    }

    impl ArchiveSource for SyntheticSource {
        fn kind(&self) -> ContainerKind {
            ContainerKind::Directory
        }

        fn len(&self) -> Option<usize> {
            Some(self.count)
        }

        fn entry_names(&self) -> Vec<String> {
            (0..self.count).map(|i| format!("{i:03}.png")).collect()
        }

        fn next_page(&mut self) -> Option<Result<RawPage, PageError>> {
            if self.cursor >= self.count {
                return None;
            }
            let index = self.cursor;
            self.cursor += 1;
            if self.unreadable.contains(&index) {
                return Some(Err(PageError::EntryRead {
                    index,
                    name: format!("{index:03}.png"),
                    detail: "crc mismatch".into(),
                }));
            }
            Some(Ok(RawPage::new(index, format!("{index:03}.png"), vec![index as u8; 16])))
        }
    }

    /// Codec counting decoded pages that have not been encoded yet.
    struct CountingCodec {
        side: u32,
        corrupt: HashSet<usize>,
        slow: HashSet<usize>,
        slow_for: Duration,
        resident: AtomicUsize,
        peak: AtomicUsize,
        decodes: AtomicUsize,
    }

    impl CountingCodec {
        fn new(side: u32) -> Self {
            Self {
                side,
                corrupt: HashSet::new(),
                slow: HashSet::new(),
                slow_for: Duration::ZERO,
                resident: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                decodes: AtomicUsize::new(0),
            }
        }
    }

    impl PageCodec for CountingCodec {
        fn probe(&self, _page: &RawPage) -> Result<PageGeometry, PageError> {
            Ok(PageGeometry {
                width: self.side,
                height: self.side,
                bytes_per_pixel: 1,
            })
        }

        fn decode(&self, page: &RawPage) -> Result<DynamicImage, PageError> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            if self.corrupt.contains(&page.index) {
                return Err(PageError::Decode {
                    index: page.index,
                    detail: "bad huffman table".into(),
                });
            }
            let now = self.resident.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            // scramble completion order
            let delay = if self.slow.contains(&page.index) {
                self.slow_for
            } else {
                Duration::from_millis((page.index as u64 * 7) % 5)
            };
            std::thread::sleep(delay);

            Ok(DynamicImage::ImageLuma8(GrayImage::from_pixel(
                self.side,
                self.side,
                Luma([page.index as u8]),
            )))
        }

        fn encode(
            &self,
            _image: &DynamicImage,
            key: PageKey,
            _format: OutputFormat,
        ) -> Result<Vec<u8>, PageError> {
            self.resident.fetch_sub(1, Ordering::SeqCst);
            Ok(key.to_string().into_bytes())
        }
    }

    /// Sink recording keys in write order.
    #[derive(Clone, Default)]
    struct RecordingSink {
        keys: Arc<Mutex<Vec<PageKey>>>,
        closed: Arc<AtomicBool>,
        aborted: Arc<AtomicBool>,
    }

    impl RecordingSink {
        fn keys(&self) -> Vec<usize> {
            self.keys.lock().unwrap().iter().map(|k| k.index).collect()
        }
    }

    impl ArchiveSink for RecordingSink {
        fn write(&mut self, page: &EncodedPage) -> Result<(), ConvertError> {
            self.keys.lock().unwrap().push(page.key);
            Ok(())
        }

        fn written(&self) -> usize {
            self.keys.lock().unwrap().len()
        }

        fn close(self: Box<Self>) -> Result<PathBuf, ConvertError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(PathBuf::from("out.cbz"))
        }

        fn abort(self: Box<Self>) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    struct CancelAfter {
        token: CancellationToken,
        after: usize,
        written: AtomicUsize,
    }

    impl ConversionProgressCallback for CancelAfter {
        fn on_page_written(&self, _job: JobId, _key: PageKey, _bytes: usize) {
            if self.written.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.token.cancel();
            }
        }
    }

    fn source(count: usize) -> SyntheticSource {
        SyntheticSource {
            count,
            unreadable: HashSet::new(),
            cursor: 0,
        }
    }

    fn job(
        source: SyntheticSource,
        codec: Arc<CountingCodec>,
        sink: &RecordingSink,
        config: JobConfig,
    ) -> Job {
        let transform = TransformConfig::builder().size(0, 0).build().unwrap();
        Job {
            id: 1,
            input: PathBuf::from("synthetic"),
            source: Box::new(source),
            sink: Box::new(sink.clone()),
            codec,
            transform: Arc::new(TransformStage::new(&transform)),
            config,
        }
    }

    fn pages_config(concurrency: usize, pages: usize) -> crate::config::JobConfigBuilder {
        JobConfig::builder()
            .concurrency(concurrency)
            .budget(Budget::Pages(pages))
    }

    // ── Ordering and memory ──────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn output_order_matches_source_for_any_concurrency() {
        for concurrency in [1, 2, 3, 4, 8] {
            let codec = Arc::new(CountingCodec::new(8));
            let sink = RecordingSink::default();
            let config = pages_config(concurrency, concurrency).build().unwrap();
            let report = job(source(20), codec, &sink, config)
                .run(CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(sink.keys(), (0..20).collect::<Vec<_>>(), "c={concurrency}");
            assert!(sink.closed.load(Ordering::SeqCst));
            assert_eq!(report.written_pages, 20);
            assert!(report.stats.peak_reorder < concurrency, "c={concurrency}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ten_pages_three_page_budget_four_workers() {
        let codec = Arc::new(CountingCodec::new(32));
        let sink = RecordingSink::default();
        let config = pages_config(4, 3).build().unwrap();
        let report = job(source(10), Arc::clone(&codec), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.keys(), (0..10).collect::<Vec<_>>());
        assert!(report.is_complete());
        assert!(codec.peak.load(Ordering::SeqCst) <= 3);
        assert!(report.stats.peak_in_flight <= 3);
        assert_eq!(report.stats.budget_units, 3);
        assert_eq!(codec.resident.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn byte_budget_is_never_exceeded() {
        // 64×64 gray = 4 KiB decoded; budget fits three pages
        let codec = Arc::new(CountingCodec::new(64));
        let sink = RecordingSink::default();
        let config = JobConfig::builder()
            .concurrency(4)
            .page_floor_bytes(1024)
            .budget(Budget::Bytes(12 * 1024))
            .build()
            .unwrap();
        let report = job(source(12), Arc::clone(&codec), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.keys(), (0..12).collect::<Vec<_>>());
        assert_eq!(report.stats.budget_units, 12);
        assert!(report.stats.peak_in_flight <= 12);
        assert!(codec.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(report.stats.redecoded_pages, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn underestimated_pages_are_decoded_again() {
        let codec = Arc::new(CountingCodec::new(64));
        let sink = RecordingSink::default();
        let config = JobConfig::builder()
            .concurrency(2)
            .page_floor_bytes(1024)
            .budget(Budget::Bytes(64 * 1024))
            .size_estimate(SizeEstimate::CompressedRatio(1))
            .build()
            .unwrap();
        let report = job(source(4), Arc::clone(&codec), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.keys(), vec![0, 1, 2, 3]);
        assert_eq!(report.stats.redecoded_pages, 4);
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn page_larger_than_budget_is_fatal() {
        let codec = Arc::new(CountingCodec::new(1000));
        let sink = RecordingSink::default();
        let config = JobConfig::builder()
            .concurrency(1)
            .page_floor_bytes(1024)
            .budget(Budget::Bytes(64 * 1024))
            .build()
            .unwrap();
        let err = job(source(3), codec, &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ConvertError::OversizedPage {
                index,
                required,
                budget,
            } => {
                assert_eq!(index, 0);
                assert_eq!(budget, 64);
                assert!(required > budget);
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(sink.aborted.load(Ordering::SeqCst));
        assert!(!sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn page_exactly_the_size_of_the_budget_converts() {
        // 100×100 gray = 10,000 bytes, the whole budget
        let codec = Arc::new(CountingCodec::new(100));
        let sink = RecordingSink::default();
        let config = JobConfig::builder()
            .concurrency(1)
            .page_floor_bytes(1)
            .budget(Budget::Bytes(10_000))
            .build()
            .unwrap();
        let report = job(source(2), Arc::clone(&codec), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.keys(), vec![0, 1]);
        assert_eq!(report.stats.budget_units, 9);
        assert_eq!(report.stats.redecoded_pages, 0);
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 2);
    }

    // ── Failure policy ───────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn skip_mode_drops_only_the_corrupt_page() {
        let mut codec = CountingCodec::new(16);
        codec.corrupt.insert(4);
        let sink = RecordingSink::default();
        let config = pages_config(4, 3)
            .failure_policy(FailurePolicy::Skip)
            .build()
            .unwrap();
        let report = job(source(10), Arc::new(codec), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.keys(), vec![0, 1, 2, 3, 5, 6, 7, 8, 9]);
        assert_eq!(report.skipped, vec![4]);
        assert!(matches!(report.errors[0], PageError::Decode { index: 4, .. }));
        assert!(!report.is_complete());
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn abort_mode_never_finalises_output() {
        let mut codec = CountingCodec::new(16);
        codec.corrupt.insert(4);
        let sink = RecordingSink::default();
        let config = pages_config(4, 3).build().unwrap();
        let err = job(source(10), Arc::new(codec), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConvertError::PageFailed(PageError::Decode { index: 4, .. })
        ));
        assert!(sink.aborted.load(Ordering::SeqCst));
        assert!(!sink.closed.load(Ordering::SeqCst));
        assert!(sink.keys().iter().all(|&i| i < 4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreadable_entry_is_skipped_without_stopping_enumeration() {
        let mut src = source(5);
        src.unreadable.insert(2);
        let sink = RecordingSink::default();
        let config = pages_config(2, 2)
            .failure_policy(FailurePolicy::Skip)
            .build()
            .unwrap();
        let report = job(src, Arc::new(CountingCodec::new(8)), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.keys(), vec![0, 1, 3, 4]);
        assert_eq!(report.skipped, vec![2]);
        assert!(matches!(report.errors[0], PageError::EntryRead { index: 2, .. }));
        assert_eq!(report.total_pages, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_page_times_out_alone() {
        let mut codec = CountingCodec::new(8);
        codec.slow.insert(1);
        codec.slow_for = Duration::from_millis(600);
        let sink = RecordingSink::default();
        let config = pages_config(2, 2)
            .failure_policy(FailurePolicy::Skip)
            .page_timeout(Duration::from_millis(150))
            .build()
            .unwrap();
        let report = job(source(4), Arc::new(codec), &sink, config)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.skipped, vec![1]);
        assert!(matches!(report.errors[0], PageError::Timeout { index: 1, .. }));
        assert_eq!(sink.keys(), vec![0, 2, 3]);
    }

    // ── Cancellation ─────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancellation_mid_job_aborts_the_sink() {
        let token = CancellationToken::new();
        let callback = Arc::new(CancelAfter {
            token: token.clone(),
            after: 5,
            written: AtomicUsize::new(0),
        });
        let sink = RecordingSink::default();
        let config = pages_config(2, 2)
            .progress_callback(callback)
            .build()
            .unwrap();
        let err = job(source(10), Arc::new(CountingCodec::new(8)), &sink, config)
            .run(token)
            .await
            .unwrap_err();

        match err {
            ConvertError::Cancelled { written } => assert!((5..10).contains(&written)),
            other => panic!("unexpected: {other}"),
        }
        assert!(sink.aborted.load(Ordering::SeqCst));
        assert!(!sink.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_before_start_writes_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let sink = RecordingSink::default();
        let config = pages_config(2, 2).build().unwrap();
        let err = job(source(10), Arc::new(CountingCodec::new(8)), &sink, config)
            .run(token)
            .await
            .unwrap_err();

        assert!(matches!(err, ConvertError::Cancelled { written: 0 }));
        assert!(sink.keys().is_empty());
        assert!(sink.aborted.load(Ordering::SeqCst));
    }
}
