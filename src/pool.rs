//! Shape-keyed recycling of scratch tensors.
//!
//! Every timestep rents the same handful of `[1, H]` buffers; keeping them on
//! a free list avoids an allocate/free pair per op. There is no eviction other
//! than `trim`.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, trace};

use crate::engine::ComputeEngine;
use crate::error::Result;
use crate::observer::AllocationObserver;
use crate::tensor::{Shape, Tensor};

pub struct TensorPool<E: ComputeEngine> {
    engine: Arc<E>,
    free: HashMap<Shape, Vec<Tensor>>,
    outstanding: usize,
    observer: Option<Arc<dyn AllocationObserver>>,
}

impl<E: ComputeEngine> TensorPool<E> {
    pub fn new(engine: Arc<E>) -> Self {
        TensorPool { engine, free: HashMap::new(), outstanding: 0, observer: None }
    }

    pub fn with_observer(engine: Arc<E>, observer: Arc<dyn AllocationObserver>) -> Self {
        TensorPool { observer: Some(observer), ..Self::new(engine) }
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn AllocationObserver>>) {
        self.observer = observer;
    }

    /// A tensor of exactly `shape`. Contents are whatever the previous renter
    /// left behind.
    pub fn rent(&mut self, shape: &Shape) -> Result<Tensor> {
        let reused = self.free.get_mut(shape).and_then(|bucket| bucket.pop());
        let t = match reused {
            Some(t) => t,
            None => {
                let t = self.engine.allocate(shape)?;
                if let Some(obs) = &self.observer { obs.on_allocate(shape); }
                t
            }
        };
        self.outstanding += 1;
        if let Some(obs) = &self.observer { obs.on_rent(shape); }
        Ok(t)
    }

    pub fn rent_zeroed(&mut self, shape: &Shape) -> Result<Tensor> {
        let mut t = self.rent(shape)?;
        self.engine.fill(&mut t, 0.0);
        Ok(t)
    }

    /// Give a tensor back. Taking it by value means the caller cannot use it
    /// afterwards.
    pub fn release(&mut self, t: Tensor) {
        if let Some(obs) = &self.observer { obs.on_release(t.shape()); }
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.entry(t.shape().clone()).or_default().push(t);
    }

    pub fn release_all(&mut self, ts: impl IntoIterator<Item = Tensor>) {
        for t in ts {
            self.release(t);
        }
    }

    /// Hand every pooled buffer back to the engine.
    pub fn trim(&mut self) -> usize {
        let freed = self.pooled_count();
        self.free.clear();
        if let Some(obs) = &self.observer { obs.on_trim(freed); }
        info!("pool: trimmed {} buffers", freed);
        freed
    }

    /// Tensors rented and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Reset the outstanding counter after an aborted step whose rented
    /// tensors were dropped instead of released. Returns the old count.
    pub fn forget_outstanding(&mut self) -> usize {
        let n = self.outstanding;
        self.outstanding = 0;
        trace!("pool: forgot {} outstanding rentals", n);
        n
    }

    /// Buffers currently sitting on free lists.
    pub fn pooled_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    pub fn pooled_for(&self, shape: &Shape) -> usize {
        self.free.get(shape).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;
    use crate::observer::CountingObserver;

    #[test]
    fn rent_release_rent_reuses_same_shape() {
        let mut pool = TensorPool::new(Arc::new(CpuEngine::new()));
        let s = Shape::matrix(1, 8);
        let t = pool.rent(&s).unwrap();
        assert_eq!(t.shape(), &s);
        pool.release(t);
        assert_eq!(pool.pooled_for(&s), 1);
        let again = pool.rent(&s).unwrap();
        assert_eq!(again.shape(), &s);
        assert_eq!(pool.pooled_for(&s), 0);
        assert_eq!(pool.outstanding(), 1);
        pool.release(again);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn different_shapes_use_different_buckets() {
        let mut pool = TensorPool::new(Arc::new(CpuEngine::new()));
        let a = pool.rent(&Shape::matrix(2, 3)).unwrap();
        pool.release(a);
        let b = pool.rent(&Shape::matrix(3, 2)).unwrap();
        assert_eq!(b.shape(), &Shape::matrix(3, 2));
        assert_eq!(pool.pooled_for(&Shape::matrix(2, 3)), 1);
        pool.release(b);
    }

    #[test]
    fn trim_empties_every_bucket() {
        let obs = Arc::new(CountingObserver::new());
        let mut pool = TensorPool::with_observer(Arc::new(CpuEngine::new()), obs.clone());
        let shapes = [Shape::matrix(1, 4), Shape::matrix(4, 4), Shape::matrix(20, 4)];
        let rented: Vec<Tensor> = shapes.iter().map(|s| pool.rent(s).unwrap()).collect();
        pool.release_all(rented);
        assert_eq!(pool.pooled_count(), 3);
        assert_eq!(pool.trim(), 3);
        for s in &shapes {
            assert_eq!(pool.pooled_for(s), 0);
        }
        assert_eq!(obs.allocations(), 3);
        assert_eq!(obs.trimmed(), 3);
        assert_eq!(obs.outstanding(), 0);
    }

    #[test]
    fn rent_zeroed_clears_stale_contents() {
        let engine = Arc::new(CpuEngine::new());
        let mut pool = TensorPool::new(engine.clone());
        let s = Shape::matrix(1, 3);
        let mut t = pool.rent(&s).unwrap();
        engine.fill(&mut t, 9.0);
        pool.release(t);
        let z = pool.rent_zeroed(&s).unwrap();
        assert!(z.as_slice().iter().all(|&x| x == 0.0));
        pool.release(z);
    }
}
