//! In-flight memory budget.
//!
//! A counting semaphore whose permits are budget units: one per page for
//! [`Budget::Pages`], one per KiB of decoded pixel data for
//! [`Budget::Bytes`]. A worker holds a [`BudgetPermit`] from before it
//! decodes a page until the page is encoded; dropping the permit is what
//! frees the budget.
//!
//! The budget also keeps an instrumented `in_use` counter and its
//! high-water mark, reported as `peak_in_flight` in the job stats.

use crate::config::Budget;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const KIB: u64 = 1024;

/// Shared budget for one job.
#[derive(Debug)]
pub struct MemoryBudget {
    semaphore: Arc<Semaphore>,
    capacity: u64,
    /// Configured byte limit; equal to `capacity` for page budgets.
    limit: u64,
    per_page: bool,
    floor_bytes: u64,
    in_use: AtomicU64,
    peak: AtomicU64,
}

impl MemoryBudget {
    pub fn new(budget: Budget, floor_bytes: u64) -> Self {
        let (capacity, limit, per_page) = match budget {
            Budget::Pages(n) => (n as u64, n as u64, true),
            // rounded down so permits never cover more than the limit
            Budget::Bytes(bytes) => (bytes / KIB, bytes, false),
        };
        // acquire_many takes a u32; validation rejects sub-KiB budgets
        let capacity = capacity.clamp(1, u64::from(u32::MAX));
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            limit,
            per_page,
            floor_bytes,
            in_use: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    /// True for page-count budgets, where every page costs one unit.
    pub fn is_per_page(&self) -> bool {
        self.per_page
    }

    /// Total units.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Units charged for a page of `bytes` decoded bytes.
    pub fn units_for(&self, bytes: u64) -> u64 {
        if self.per_page {
            1
        } else {
            bytes.max(self.floor_bytes).div_ceil(KIB).max(1)
        }
    }

    /// Configured limit in bytes, `None` for page budgets.
    pub fn limit_bytes(&self) -> Option<u64> {
        (!self.per_page).then_some(self.limit)
    }

    /// Bytes covered by `units` in byte mode. Holding the whole capacity
    /// covers the whole configured limit.
    pub fn bytes_covered(&self, units: u64) -> u64 {
        if units >= self.capacity {
            self.limit
        } else {
            units.saturating_mul(KIB)
        }
    }

    /// Wait for `units` to become free.
    ///
    /// Returns `None` once the budget is closed. Callers must reject
    /// requests larger than [`Self::capacity`] beforehand; they would wait
    /// forever.
    pub async fn acquire(self: &Arc<Self>, units: u64) -> Option<BudgetPermit> {
        debug_assert!(units <= self.capacity);
        let n = u32::try_from(units).ok()?;
        let permit = self.semaphore.clone().acquire_many_owned(n).await.ok()?;
        let now = self.in_use.fetch_add(units, Ordering::SeqCst) + units;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Some(BudgetPermit {
            units,
            budget: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Stop issuing permits; pending and future acquisitions return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Units held by one page. Released on drop.
#[derive(Debug)]
pub struct BudgetPermit {
    units: u64,
    budget: Arc<MemoryBudget>,
    // dropped after `Drop::drop` has run, so `in_use` never under-reports
    _permit: OwnedSemaphorePermit,
}

impl BudgetPermit {
    pub fn units(&self) -> u64 {
        self.units
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(self.units, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn byte_budget_is_counted_in_kib_with_a_floor() {
        let b = MemoryBudget::new(Budget::Bytes(64 * MIB), 8 * MIB);
        assert_eq!(b.capacity(), 64 * 1024);
        assert!(!b.is_per_page());
        // floor applies to small pages
        assert_eq!(b.units_for(100), 8 * 1024);
        // rounding up
        assert_eq!(b.units_for(10 * MIB + 1), 10 * 1024 + 1);
    }

    #[test]
    fn page_the_size_of_the_budget_is_fully_covered() {
        let b = MemoryBudget::new(Budget::Bytes(10_000), 1);
        assert_eq!(b.capacity(), 9);
        assert_eq!(b.limit_bytes(), Some(10_000));
        // the charge rounds up past capacity, but the whole budget covers it
        assert_eq!(b.units_for(10_000), 10);
        assert_eq!(b.bytes_covered(b.capacity()), 10_000);
        assert_eq!(b.bytes_covered(4), 4 * 1024);
    }

    #[test]
    fn page_budget_charges_one_unit() {
        let b = MemoryBudget::new(Budget::Pages(3), 8 * MIB);
        assert!(b.is_per_page());
        assert_eq!(b.capacity(), 3);
        assert_eq!(b.units_for(500 * MIB), 1);
        assert_eq!(b.limit_bytes(), None);
    }

    #[tokio::test]
    async fn permits_track_in_use_and_peak() {
        let b = Arc::new(MemoryBudget::new(Budget::Pages(3), 0));
        let p1 = b.acquire(1).await.unwrap();
        let p2 = b.acquire(1).await.unwrap();
        assert_eq!(b.in_use(), 2);
        drop(p1);
        let p3 = b.acquire(1).await.unwrap();
        let p4 = b.acquire(1).await.unwrap();
        assert_eq!(b.in_use(), 3);
        assert_eq!(b.peak(), 3);
        drop((p2, p3, p4));
        assert_eq!(b.in_use(), 0);
        assert_eq!(b.peak(), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_until_release() {
        let b = Arc::new(MemoryBudget::new(Budget::Pages(1), 0));
        let held = b.acquire(1).await.unwrap();

        let mut waiting = tokio_test::task::spawn({
            let b = Arc::clone(&b);
            async move { b.acquire(1).await.map(|p| p.units()) }
        });
        assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        let units = assert_ready!(waiting.poll());
        assert_eq!(units, Some(1));
    }

    #[tokio::test]
    async fn closed_budget_refuses_permits() {
        let b = Arc::new(MemoryBudget::new(Budget::Pages(2), 0));
        b.close();
        assert!(b.acquire(1).await.is_none());
    }
}
