//! Shared "m of N" progress indicator (§3). `total` is fixed at the start of each
//! phase; `next()` increments and reads atomically so concurrent workers can
//! format a stable progress label without taking a lock.

use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Counter {
    count: AtomicUsize,
    total: AtomicUsize,
}

impl Counter {
    pub fn new() -> Counter {
        Counter {
            count: AtomicUsize::new(1),
            total: AtomicUsize::new(0),
        }
    }

    pub fn reset(&self, total: usize) {
        self.count.store(1, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// Increment-and-read: returns a formatted "  3 of 120" style label, padded
    /// so every label in a phase has the same width.
    pub fn next(&self) -> String {
        let count = self.count.fetch_add(1, Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        Self::format(count, total)
    }

    fn format(count: usize, total: usize) -> String {
        let suffix = total.to_string();
        let label = count.to_string();
        let padding = suffix.len().saturating_sub(label.len());
        format!("{}{} of {}", " ".repeat(padding), label, suffix)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_total_width() {
        let counter = Counter::new();
        counter.reset(120);
        assert_eq!(counter.next(), "  1 of 120");
        assert_eq!(counter.next(), "  2 of 120");
    }

    #[test]
    fn reset_restarts_count() {
        let counter = Counter::new();
        counter.reset(5);
        counter.next();
        counter.next();
        counter.reset(5);
        assert_eq!(counter.next(), "1 of 5");
    }
}
