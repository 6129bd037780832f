//! Adam moment state, one entry per parameter group.
//!
//! State for a layer id is created lazily on its first update and lives until
//! `reset`. The numeric step itself is a single fused `adam_update` call on the
//! engine; moments never leave the engine except through `get_state`.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::engine::ComputeEngine;
use crate::error::{LstmError, Result};
use crate::tensor::{Shape, Tensor};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Decoupled (AdamW-style) decay; 0 gives plain Adam.
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig { learning_rate: 0.001, beta1: 0.9, beta2: 0.999, epsilon: 1e-8, weight_decay: 0.0 }
    }
}

struct MomentState {
    m: Tensor,
    v: Tensor,
    t: u64,
}

/// Host copy of one layer's moments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerMoments {
    pub layer_id: usize,
    pub shape: Shape,
    pub m: Vec<f32>,
    pub v: Vec<f32>,
    pub t: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSnapshot {
    pub layers: Vec<LayerMoments>,
}

pub struct AdamOptimizer<E: ComputeEngine> {
    engine: Arc<E>,
    config: AdamConfig,
    layers: BTreeMap<usize, MomentState>,
}

impl<E: ComputeEngine> AdamOptimizer<E> {
    pub fn new(engine: Arc<E>, config: AdamConfig) -> Self {
        AdamOptimizer { engine, config, layers: BTreeMap::new() }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Update counter for `layer_id`, `None` if it has no state yet.
    pub fn step_count(&self, layer_id: usize) -> Option<u64> {
        self.layers.get(&layer_id).map(|s| s.t)
    }

    pub fn update(&mut self, layer_id: usize, params: &mut Tensor, grads: &Tensor) -> Result<()> {
        if params.shape() != grads.shape() {
            return Err(LstmError::shape_mismatch(
                format!("gradient {} for layer {} parameter {}", grads.shape(), layer_id, params.shape()),
                params.len(),
                grads.len(),
            ));
        }
        if !self.layers.contains_key(&layer_id) {
            let m = self.engine.allocate(params.shape())?;
            let v = self.engine.allocate(params.shape())?;
            debug!("adam: new moment state for layer {} {}", layer_id, params.shape());
            self.layers.insert(layer_id, MomentState { m, v, t: 0 });
        }
        let state = self
            .layers
            .get_mut(&layer_id)
            .ok_or_else(|| LstmError::not_found("optimizer layer", layer_id))?;
        if state.m.shape() != params.shape() {
            return Err(LstmError::shape_mismatch(
                format!("moment state for layer {}", layer_id),
                state.m.len(),
                params.len(),
            ));
        }
        state.t += 1;
        self.engine.adam_update(params, grads, &mut state.m, &mut state.v, &self.config, state.t)
    }

    /// Drop every layer's moments. The next update for any layer starts from
    /// zero moments and step 1.
    pub fn reset(&mut self) {
        let n = self.layers.len();
        self.layers.clear();
        debug!("adam: reset {} layer states", n);
    }

    pub fn get_state(&self) -> OptimizerSnapshot {
        self.engine.synchronize();
        let layers = self
            .layers
            .iter()
            .map(|(&layer_id, s)| LayerMoments {
                layer_id,
                shape: s.m.shape().clone(),
                m: self.engine.to_host(&s.m),
                v: self.engine.to_host(&s.v),
                t: s.t,
            })
            .collect();
        OptimizerSnapshot { layers }
    }

    /// Replace all state with `snapshot`. On error the previous state is kept.
    pub fn set_state(&mut self, snapshot: OptimizerSnapshot) -> Result<()> {
        let mut layers = BTreeMap::new();
        for lm in snapshot.layers {
            let m = self.engine.from_host(lm.m, lm.shape.clone())?;
            let v = self.engine.from_host(lm.v, lm.shape)?;
            layers.insert(lm.layer_id, MomentState { m, v, t: lm.t });
        }
        self.layers = layers;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CpuEngine;

    fn tensor(e: &CpuEngine, data: &[f32]) -> Tensor {
        e.from_host(data.to_vec(), Shape::matrix(1, data.len())).unwrap()
    }

    #[test]
    fn state_is_created_lazily_and_counts_steps() {
        let e = Arc::new(CpuEngine::new());
        let mut opt = AdamOptimizer::new(e.clone(), AdamConfig::default());
        assert_eq!(opt.step_count(3), None);
        let mut p = tensor(&e, &[0.1, 0.2]);
        let g = tensor(&e, &[0.01, -0.02]);
        opt.update(3, &mut p, &g).unwrap();
        opt.update(3, &mut p, &g).unwrap();
        assert_eq!(opt.step_count(3), Some(2));
        assert_eq!(opt.layer_count(), 1);
    }

    #[test]
    fn reset_makes_next_update_match_first() {
        let e = Arc::new(CpuEngine::new());
        let mut opt = AdamOptimizer::new(e.clone(), AdamConfig::default());
        let g = tensor(&e, &[0.3, -0.7, 1.5]);

        let mut first = tensor(&e, &[1.0, 2.0, 3.0]);
        opt.update(0, &mut first, &g).unwrap();
        let mut other = tensor(&e, &[1.0, 2.0, 3.0]);
        opt.update(0, &mut other, &g).unwrap();
        opt.update(0, &mut other, &g).unwrap();

        opt.reset();
        assert_eq!(opt.layer_count(), 0);
        let mut again = tensor(&e, &[1.0, 2.0, 3.0]);
        opt.update(0, &mut again, &g).unwrap();
        assert_eq!(opt.step_count(0), Some(1));
        assert_eq!(first.as_slice(), again.as_slice());
    }

    #[test]
    fn snapshot_round_trip_restores_moments() {
        let e = Arc::new(CpuEngine::new());
        let mut opt = AdamOptimizer::new(e.clone(), AdamConfig::default());
        let g = tensor(&e, &[0.5, 0.25]);
        let mut p = tensor(&e, &[0.0, 0.0]);
        opt.update(7, &mut p, &g).unwrap();
        let snap = opt.get_state();
        assert_eq!(snap.layers.len(), 1);
        assert_eq!(snap.layers[0].layer_id, 7);
        assert_eq!(snap.layers[0].t, 1);

        let mut restored = AdamOptimizer::new(e.clone(), AdamConfig::default());
        restored.set_state(snap.clone()).unwrap();
        assert_eq!(restored.get_state(), snap);

        let mut p1 = tensor(&e, &[0.0, 0.0]);
        let mut p2 = tensor(&e, &[0.0, 0.0]);
        opt.update(7, &mut p1, &g).unwrap();
        restored.update(7, &mut p2, &g).unwrap();
        assert_eq!(p1.as_slice(), p2.as_slice());
    }

    #[test]
    fn mismatched_gradient_is_rejected() {
        let e = Arc::new(CpuEngine::new());
        let mut opt = AdamOptimizer::new(e.clone(), AdamConfig::default());
        let mut p = tensor(&e, &[0.0, 0.0]);
        let g = tensor(&e, &[0.0, 0.0, 0.0]);
        let err = opt.update(0, &mut p, &g).unwrap_err();
        assert!(matches!(err, LstmError::ShapeMismatch { .. }));
        assert_eq!(opt.layer_count(), 0);
    }
}
