//! Result types returned by the conversion entry points.

use crate::error::{ConvertError, PageError};
use crate::page::PageIndex;
use crate::pipeline::source::ContainerKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of one conversion job, unique within a batch.
pub type JobId = u64;

/// Outcome of a job that reached the end of its archive.
///
/// A job that aborts returns `Err(ConvertError)` instead; a `JobReport`
/// always means the output container was finalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: JobId,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Pages the source emitted.
    pub total_pages: usize,
    /// Source pages written (a split spread counts once).
    pub written_pages: usize,
    /// Entries in the output container (a split spread counts twice).
    pub written_entries: usize,
    /// Indices given up on under skip mode, ascending.
    pub skipped: Vec<PageIndex>,
    /// One error per skipped page, same order as `skipped`.
    pub errors: Vec<PageError>,
    pub stats: JobStats,
}

impl JobReport {
    /// True when every page the source emitted was written.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// Treat any skipped page as an error.
    pub fn into_result(self) -> Result<JobReport, ConvertError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(ConvertError::PartialFailure {
                skipped: self.skipped.len(),
                total: self.total_pages,
            })
        }
    }
}

/// Counters collected while a job runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Compressed bytes read from the source.
    pub bytes_in: u64,
    /// Encoded bytes handed to the sink.
    pub bytes_out: u64,
    /// Budget capacity in units (pages, or KiB in byte mode).
    pub budget_units: u64,
    /// Highest number of budget units held at once.
    pub peak_in_flight: u64,
    /// Most completed pages waiting in the reorder buffer at once.
    pub peak_reorder: usize,
    /// Pages decoded a second time after their size was underestimated.
    pub redecoded_pages: usize,
    pub duration_ms: u64,
}

/// Container summary returned by [`crate::convert::inspect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub container: ContainerKind,
    pub page_count: usize,
    /// Page entry names in reading order.
    pub pages: Vec<String>,
}

/// One archive of a batch.
#[derive(Debug)]
pub struct BatchEntry {
    pub input: PathBuf,
    pub output: PathBuf,
    pub result: Result<JobReport, ConvertError>,
}

/// Per-archive results of [`crate::convert::convert_batch`], in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    /// Archives converted with every page written.
    pub fn complete(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(&e.result, Ok(r) if r.is_complete()))
            .count()
    }

    /// Archives that failed or finished with skipped pages.
    pub fn incomplete(&self) -> usize {
        self.entries.len() - self.complete()
    }

    pub fn is_success(&self) -> bool {
        self.incomplete() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(skipped: Vec<PageIndex>) -> JobReport {
        JobReport {
            job: 1,
            input: "in.cbz".into(),
            output: "out.cbz".into(),
            total_pages: 10,
            written_pages: 10 - skipped.len(),
            written_entries: 10 - skipped.len(),
            errors: skipped
                .iter()
                .map(|&index| PageError::Decode {
                    index,
                    detail: "corrupt".into(),
                })
                .collect(),
            skipped,
            stats: JobStats::default(),
        }
    }

    #[test]
    fn complete_report_passes_into_result() {
        let r = report(vec![]);
        assert!(r.is_complete());
        assert!(r.into_result().is_ok());
    }

    #[test]
    fn skipped_pages_become_partial_failure() {
        let err = report(vec![4]).into_result().unwrap_err();
        match err {
            ConvertError::PartialFailure { skipped, total } => {
                assert_eq!((skipped, total), (1, 10));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn batch_counts_partial_jobs_as_incomplete() {
        let batch = BatchReport {
            entries: vec![
                BatchEntry {
                    input: "a.cbz".into(),
                    output: "a.out.cbz".into(),
                    result: Ok(report(vec![])),
                },
                BatchEntry {
                    input: "b.cbz".into(),
                    output: "b.out.cbz".into(),
                    result: Ok(report(vec![2])),
                },
                BatchEntry {
                    input: "c.cbr".into(),
                    output: "c.out.cbz".into(),
                    result: Err(ConvertError::UnsupportedContainer {
                        path: "c.cbr".into(),
                        format: "RAR".into(),
                    }),
                },
            ],
        };
        assert_eq!(batch.complete(), 1);
        assert_eq!(batch.incomplete(), 2);
        assert!(!batch.is_success());
    }

    #[test]
    fn report_serialises_skipped_list() {
        let json = serde_json::to_string(&report(vec![4])).unwrap();
        assert!(json.contains("\"skipped\":[4]"), "got: {json}");
    }
}
