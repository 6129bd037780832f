//! Allocation observers.
//!
//! The pool reports every allocate/rent/release/trim to an optional observer.
//! Nothing in the trainer depends on one being installed.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::tensor::Shape;

pub trait AllocationObserver: Send + Sync {
    /// A fresh buffer was created because the shape's bucket was empty.
    fn on_allocate(&self, _shape: &Shape) {}
    fn on_rent(&self, _shape: &Shape) {}
    fn on_release(&self, _shape: &Shape) {}
    /// `freed` pooled buffers were handed back to the engine.
    fn on_trim(&self, _freed: usize) {}
}

/// Counts events; handy for leak checks in tests and debug runs.
#[derive(Debug, Default)]
pub struct CountingObserver {
    allocations: AtomicUsize,
    rents: AtomicUsize,
    releases: AtomicUsize,
    trimmed: AtomicUsize,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn rents(&self) -> usize {
        self.rents.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }

    pub fn trimmed(&self) -> usize {
        self.trimmed.load(Ordering::Relaxed)
    }

    /// Rented but not yet released.
    pub fn outstanding(&self) -> usize {
        self.rents().saturating_sub(self.releases())
    }
}

impl AllocationObserver for CountingObserver {
    fn on_allocate(&self, _shape: &Shape) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn on_rent(&self, _shape: &Shape) {
        self.rents.fetch_add(1, Ordering::Relaxed);
    }

    fn on_release(&self, _shape: &Shape) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    fn on_trim(&self, freed: usize) {
        self.trimmed.fetch_add(freed, Ordering::Relaxed);
    }
}
