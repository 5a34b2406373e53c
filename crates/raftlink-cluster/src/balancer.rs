//! Round-robin selection over a changing set of candidates.
//!
//! Used by the event service to pick the next subscriber of a topic. The
//! candidate list may grow or shrink between calls; the counter just keeps
//! advancing.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next index in `0..count`, or `None` if there is nothing to pick.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }

    /// Pick the next element of `candidates`.
    pub fn pick<'a, T>(&self, candidates: &'a [T]) -> Option<&'a T> {
        self.next(candidates.len()).map(|i| &candidates[i])
    }
}
