//! Reorder buffer between out-of-order workers and the in-order writer.

use crate::page::PageIndex;
use std::collections::BTreeMap;

/// Completed pages waiting for every lower index to be written.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeMap<PageIndex, T>,
    next: PageIndex,
    high_water: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new(first: PageIndex) -> Self {
        Self {
            pending: BTreeMap::new(),
            next: first,
            high_water: 0,
        }
    }

    /// Park a completed page.
    pub fn insert(&mut self, index: PageIndex, item: T) {
        debug_assert!(index >= self.next, "page {index} arrived after it was written");
        let previous = self.pending.insert(index, item);
        debug_assert!(previous.is_none(), "page {index} completed twice");
    }

    /// Take every page that is now in sequence, advancing `next_to_write`
    /// past each one.
    pub fn drain_ready(&mut self) -> Vec<(PageIndex, T)> {
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push((self.next, item));
            self.next += 1;
        }
        self.high_water = self.high_water.max(self.pending.len());
        ready
    }

    pub fn next_to_write(&self) -> PageIndex {
        self.next
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Most pages ever left waiting after a drain.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}
