//! Backpropagation through time over a single-layer LSTM.
//!
//! One training step runs `Idle -> Forwarding -> Backwarding -> Updating ->
//! Idle`. The forward pass writes a `StepRecord` per timestep to the step
//! cache and keeps nothing else alive between timesteps except the carried
//! hidden and cell state. The backward pass reads the records back in reverse
//! order. Parameters live in the tensor store and are loaded per pass; all
//! scratch comes from the pool and goes back to it before the step returns.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use rand::Rng;

use crate::checkpoint::{iso_timestamp, Checkpoint, CheckpointEntry, CHECKPOINT_VERSION};
use crate::engine::{ComputeEngine, MatMul};
use crate::error::{LstmError, Result, ValueRole};
use crate::observer::AllocationObserver;
use crate::optimizer::{AdamConfig, AdamOptimizer};
use crate::params::{GradientSet, LstmDims, LstmParams, ParamName};
use crate::pool::TensorPool;
use crate::step_cache::{StepCache, StepDims, StepRecord};
use crate::store::TensorStore;
use crate::tensor::{Shape, Tensor};

/// Floor applied to the target probability before taking its log.
const PROB_FLOOR: f32 = 1e-12;

#[derive(Clone, Debug)]
pub struct TrainerConfig {
    /// Global L2 ceiling for the gradient set.
    pub max_grad_norm: f32,
    /// Per-timestep band every gradient contribution is clipped to.
    pub contribution_clip: f32,
    pub optimizer: AdamConfig,
    /// Parent of the session namespace used by the store and step cache.
    pub cache_dir: PathBuf,
    pub session: String,
    /// `fsync` the step cache after every timestep.
    pub sync_writes: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            max_grad_norm: 5.0,
            contribution_clip: 5.0,
            optimizer: AdamConfig::default(),
            cache_dir: std::env::temp_dir().join("lstm-rust"),
            session: "default".to_string(),
            sync_writes: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Forwarding,
    Backwarding,
    Updating,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipReport {
    /// Global norm before clipping.
    pub norm: f32,
    pub scaled: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    pub grad_norm: f32,
    pub clipped: bool,
    /// Parameters whose update was skipped because their gradient was not finite.
    pub skipped: Vec<ParamName>,
    /// Step records written by the forward pass.
    pub steps: usize,
}

pub struct Trainer<E: ComputeEngine> {
    engine: Arc<E>,
    dims: LstmDims,
    config: TrainerConfig,
    // Declared before `store` so its files go before the namespace directory.
    cache: StepCache<E>,
    store: TensorStore<E>,
    pool: TensorPool<E>,
    optimizer: AdamOptimizer<E>,
    ids: LstmParams<String>,
    phase: Phase,
}

impl<E: ComputeEngine> Trainer<E> {
    /// Fresh model: Xavier-scaled normal weights, zero biases, forget bias 1.
    pub fn new(engine: Arc<E>, dims: LstmDims, config: TrainerConfig, rng: &mut impl Rng) -> Result<Self> {
        Self::assemble(engine, dims, config, |store| {
            LstmParams::try_build(|p| {
                let data = init_values(p, &dims, &mut *rng);
                store.create_and_store(data, p.shape(&dims), p.as_str())
            })
        })
    }

    /// Rebuild a trainer from a checkpoint, recreating every store record under
    /// its saved id and reinstating the optimizer moments.
    pub fn restore(engine: Arc<E>, checkpoint: Checkpoint, config: TrainerConfig) -> Result<Self> {
        let Checkpoint { dims, mut entries, optimizer, timestamp, .. } = checkpoint;
        let mut trainer = Self::assemble(engine, dims, config, |store| {
            LstmParams::try_build(|p| {
                let pos = entries
                    .iter()
                    .position(|e| e.name == p.as_str())
                    .ok_or_else(|| LstmError::not_found("checkpoint entry", p))?;
                let entry = entries.swap_remove(pos);
                let expected = p.shape(&dims);
                if entry.shape != expected {
                    return Err(LstmError::shape_mismatch(
                        format!("checkpoint entry `{}` {} (expected {})", p, entry.shape, expected),
                        expected.len(),
                        entry.shape.len(),
                    ));
                }
                store.insert_with_id(&entry.id, entry.data, entry.shape, p.as_str())?;
                Ok(entry.id)
            })
        })?;
        if !entries.is_empty() {
            warn!("restore: ignoring {} unknown checkpoint entries", entries.len());
        }
        for layer in &optimizer.layers {
            let name = ParamName::ALL
                .get(layer.layer_id)
                .copied()
                .ok_or_else(|| LstmError::not_found("optimizer layer", layer.layer_id))?;
            let expected = name.shape(&dims);
            if layer.shape != expected || layer.m.len() != expected.len() || layer.v.len() != expected.len() {
                return Err(LstmError::shape_mismatch(
                    format!("optimizer moments for `{}` {}", name, layer.shape),
                    expected.len(),
                    layer.m.len(),
                ));
            }
        }
        trainer.optimizer.set_state(optimizer)?;
        info!(
            "restored checkpoint from {} ({} optimizer layers)",
            timestamp,
            trainer.optimizer.layer_count()
        );
        Ok(trainer)
    }

    fn assemble(
        engine: Arc<E>,
        dims: LstmDims,
        config: TrainerConfig,
        init: impl FnOnce(&mut TensorStore<E>) -> Result<LstmParams<String>>,
    ) -> Result<Self> {
        if dims.vocab_size == 0 || dims.embed_size == 0 || dims.hidden_size == 0 {
            return Err(LstmError::InvalidConfig(format!("model dimensions must be positive: {:?}", dims)));
        }
        let mut store = TensorStore::new(engine.clone(), &config.cache_dir, &config.session)?;
        let ids = init(&mut store)?;
        let mut cache = StepCache::create(engine.clone(), store.root().join("steps"), "bptt", StepDims::from(dims))?;
        cache.set_sync_writes(config.sync_writes);
        let pool = TensorPool::new(engine.clone());
        let optimizer = AdamOptimizer::new(engine.clone(), config.optimizer.clone());
        debug!(
            "trainer: V={} E={} H={} under {:?}",
            dims.vocab_size,
            dims.embed_size,
            dims.hidden_size,
            store.root()
        );
        Ok(Trainer { engine, dims, config, cache, store, pool, optimizer, ids, phase: Phase::Idle })
    }

    pub fn dims(&self) -> LstmDims {
        self.dims
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn pool(&self) -> &TensorPool<E> {
        &self.pool
    }

    pub fn cache(&self) -> &StepCache<E> {
        &self.cache
    }

    pub fn store(&self) -> &TensorStore<E> {
        &self.store
    }

    pub fn optimizer(&self) -> &AdamOptimizer<E> {
        &self.optimizer
    }

    /// Store id backing `name`.
    pub fn param_id(&self, name: ParamName) -> &str {
        self.ids.get(name)
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn AllocationObserver>>) {
        self.pool.set_observer(observer);
    }

    // ========================================================================
    // Training step
    // ========================================================================

    /// Forward, backward, clip, update, then release everything the step
    /// created. Cleanup runs whether or not the step succeeded.
    pub fn train_step(&mut self, inputs: &[usize], targets: &[usize]) -> Result<StepOutcome> {
        let outcome = self.run_step(inputs, targets);
        let cleanup = self.finish_step();
        let outcome = outcome?;
        cleanup?;
        Ok(outcome)
    }

    fn run_step(&mut self, inputs: &[usize], targets: &[usize]) -> Result<StepOutcome> {
        let loss = self.forward(inputs, targets)?;
        let steps = self.cache.len();
        let mut grads = self.backward(inputs, targets)?;
        let clip = self.clip_gradients(&mut grads);
        let applied = self.apply_gradients(&grads);
        grads.release_into(&mut self.pool);
        let skipped = applied?;
        Ok(StepOutcome { loss, grad_norm: clip.norm, clipped: clip.scaled, skipped, steps })
    }

    fn finish_step(&mut self) -> Result<()> {
        self.enter(Phase::Idle);
        let reset = self.cache.reset();
        let outstanding = self.pool.outstanding();
        if outstanding > 0 {
            warn!("trainer: {} pool rentals outstanding at end of step, dropping them", outstanding);
            self.pool.forget_outstanding();
        }
        reset
    }

    /// Run the sequence forward, caching one record per timestep. Returns the
    /// mean cross-entropy loss.
    pub fn forward(&mut self, inputs: &[usize], targets: &[usize]) -> Result<f32> {
        self.validate_sequence(inputs, targets)?;
        if !self.cache.is_empty() {
            debug!("forward: discarding {} stale cached steps", self.cache.len());
            self.cache.reset()?;
        }
        self.enter(Phase::Forwarding);
        let w = self.load_params()?;
        let hs = Shape::matrix(1, self.dims.hidden_size);
        let mut k = Kernels { engine: &*self.engine, pool: &mut self.pool, band: self.config.contribution_clip };

        let mut h = k.pool.rent_zeroed(&hs)?;
        let mut c = k.pool.rent_zeroed(&hs)?;
        let mut total = 0.0f64;
        for (t, (&x, &y)) in inputs.iter().zip(targets).enumerate() {
            let record = k.cell_forward(&w, x, h, c).map_err(|e| e.at_timestep(t))?;
            self.cache.cache_step(&record)?;
            let nll = k.step_nll(&w, &record.hidden_next, y).map_err(|e| e.at_timestep(t))?;
            trace!("forward: t={} token={} target={} nll={:.4}", t, x, y, nll);
            total += nll as f64;
            let (h_next, c_next) = k.recycle(record);
            h = h_next;
            c = c_next;
        }
        k.pool.release(h);
        k.pool.release(c);

        let loss = (total / inputs.len() as f64) as f32;
        if !loss.is_finite() {
            return Err(LstmError::non_finite(ValueRole::Activation, "loss"));
        }
        Ok(loss)
    }

    /// Walk the cached records in reverse and return the accumulated
    /// gradients. The cache is only read, so calling this twice after one
    /// forward pass gives identical results.
    pub fn backward(&mut self, inputs: &[usize], targets: &[usize]) -> Result<GradientSet> {
        self.validate_sequence(inputs, targets)?;
        if self.cache.len() != inputs.len() {
            return Err(LstmError::InvalidSequence(format!(
                "step cache holds {} steps but the sequence has {}",
                self.cache.len(),
                inputs.len()
            )));
        }
        self.enter(Phase::Backwarding);
        let w = self.load_params()?;
        let mut grads = GradientSet::zeroed(&mut self.pool, &self.dims)?;
        let hs = Shape::matrix(1, self.dims.hidden_size);
        let scale = 1.0 / inputs.len() as f32;
        let mut k = Kernels { engine: &*self.engine, pool: &mut self.pool, band: self.config.contribution_clip };

        let mut carry = Carry { dh: k.pool.rent_zeroed(&hs)?, dc: k.pool.rent_zeroed(&hs)? };
        for t in (0..inputs.len()).rev() {
            let rec = self.cache.retrieve_record(t)?;
            let step = BackwardStep { token: inputs[t], target: targets[t], scale };
            carry = k.cell_backward(&w, &mut grads, &rec, step, carry).map_err(|e| e.at_timestep(t))?;
            trace!("backward: t={} done", t);
        }
        k.pool.release(carry.dh);
        k.pool.release(carry.dc);
        Ok(grads)
    }

    /// Scale every gradient by `ceiling / norm` when the global norm exceeds
    /// the ceiling or is not finite.
    pub fn clip_gradients(&self, grads: &mut GradientSet) -> ClipReport {
        let norm = grads.global_norm(&*self.engine);
        let ceiling = self.config.max_grad_norm;
        if norm > ceiling || !norm.is_finite() {
            let s = ceiling / norm;
            for name in ParamName::ALL {
                self.engine.scale(grads.get_mut(name), s);
            }
            debug!("clip: global norm {:.4} above {}, scaled by {:.4}", norm, ceiling, s);
            ClipReport { norm, scaled: true }
        } else {
            ClipReport { norm, scaled: false }
        }
    }

    /// Run the optimizer over every parameter. A non-finite gradient skips
    /// that parameter; a non-finite parameter before or after its update is
    /// fatal and nothing is written back for it.
    pub fn apply_gradients(&mut self, grads: &GradientSet) -> Result<Vec<ParamName>> {
        self.enter(Phase::Updating);
        let engine = &*self.engine;
        let optimizer = &mut self.optimizer;
        let mut skipped = Vec::new();
        engine.synchronize();
        for (name, grad) in grads.iter() {
            let layer = name.layer_id();
            if !engine.all_finite(grad) {
                let err = LstmError::non_finite(ValueRole::Gradient, name.as_str()).at_layer(layer);
                warn!("update skipped: {}", err);
                skipped.push(name);
                continue;
            }
            self.store.update(self.ids.get(name), |p| {
                engine.synchronize();
                if !engine.all_finite(p) {
                    return Err(LstmError::non_finite(ValueRole::Parameter, name.as_str()).at_layer(layer));
                }
                optimizer.update(layer, p, grad)?;
                engine.synchronize();
                if !engine.all_finite(p) {
                    return Err(LstmError::non_finite(ValueRole::Parameter, name.as_str()).at_layer(layer));
                }
                Ok(())
            })?;
        }
        Ok(skipped)
    }

    pub fn release_gradients(&mut self, grads: GradientSet) {
        grads.release_into(&mut self.pool);
    }

    /// Drop all optimizer moments. Meant for coarse boundaries such as epochs
    /// or checkpoints.
    pub fn reset_optimizer(&mut self) {
        self.optimizer.reset();
    }

    pub fn trim_pool(&mut self) -> usize {
        self.pool.trim()
    }

    // ========================================================================
    // Parameters, sampling, checkpoints
    // ========================================================================

    /// Host copy of a parameter's current values.
    pub fn parameter(&mut self, name: ParamName) -> Result<Vec<f32>> {
        let t = self.store.load(self.ids.get(name))?;
        self.engine.synchronize();
        Ok(self.engine.to_host(&t))
    }

    /// Overwrite a parameter's values; the length must match its shape.
    pub fn set_parameter(&mut self, name: ParamName, data: Vec<f32>) -> Result<()> {
        let engine = &*self.engine;
        self.store.update(self.ids.get(name), |t| {
            if data.len() != t.len() {
                return Err(LstmError::shape_mismatch(format!("parameter `{}` {}", name, t.shape()), t.len(), data.len()));
            }
            *t = engine.from_host(data, t.shape().clone())?;
            Ok(())
        })
    }

    /// Feed `prefix` through the cell, then draw `length` tokens. Does not
    /// touch the step cache or the optimizer.
    pub fn sample(
        &mut self,
        prefix: &[usize],
        length: usize,
        temperature: f32,
        rng: &mut impl Rng,
    ) -> Result<Vec<usize>> {
        let (&last, head) = prefix
            .split_last()
            .ok_or_else(|| LstmError::InvalidSequence("sampling needs a non-empty prefix".into()))?;
        self.check_tokens(prefix, "prefix")?;
        let w = self.load_params()?;
        let hs = Shape::matrix(1, self.dims.hidden_size);
        let mut k = Kernels { engine: &*self.engine, pool: &mut self.pool, band: self.config.contribution_clip };

        let mut h = k.pool.rent_zeroed(&hs)?;
        let mut c = k.pool.rent_zeroed(&hs)?;
        for &tok in head {
            let (hn, cn) = k.advance(&w, tok, h, c)?;
            h = hn;
            c = cn;
        }
        let mut token = last;
        let mut out = Vec::with_capacity(length);
        for _ in 0..length {
            let (hn, cn) = k.advance(&w, token, h, c)?;
            h = hn;
            c = cn;
            let logits = k.logits(&w, &h)?;
            k.engine.synchronize();
            token = sample_index(&k.engine.to_host(&logits), temperature, rng);
            k.pool.release(logits);
            out.push(token);
        }
        k.pool.release(h);
        k.pool.release(c);
        Ok(out)
    }

    /// Snapshot parameters (by name and store id) and optimizer moments.
    pub fn checkpoint(&mut self, metadata: Option<&serde_json::Value>) -> Result<Checkpoint> {
        let mut entries = Vec::with_capacity(ParamName::ALL.len());
        for name in ParamName::ALL {
            let id = self.ids.get(name).clone();
            let t = self.store.load(&id)?;
            self.engine.synchronize();
            entries.push(CheckpointEntry {
                name: name.as_str().to_string(),
                id,
                shape: t.shape().clone(),
                data: self.engine.to_host(&t),
            });
        }
        Ok(Checkpoint {
            version: CHECKPOINT_VERSION.to_string(),
            timestamp: iso_timestamp(),
            metadata: metadata.map(serde_json::to_string).transpose()?,
            dims: self.dims,
            entries,
            optimizer: self.optimizer.get_state(),
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("trainer: {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn load_params(&mut self) -> Result<LstmParams<Tensor>> {
        let store = &mut self.store;
        let ids = &self.ids;
        LstmParams::try_build(|p| store.load(ids.get(p)))
    }

    fn validate_sequence(&self, inputs: &[usize], targets: &[usize]) -> Result<()> {
        if inputs.is_empty() {
            return Err(LstmError::InvalidSequence("empty sequence".into()));
        }
        if inputs.len() != targets.len() {
            return Err(LstmError::InvalidSequence(format!(
                "{} inputs but {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        self.check_tokens(inputs, "input")?;
        self.check_tokens(targets, "target")
    }

    fn check_tokens(&self, tokens: &[usize], what: &str) -> Result<()> {
        match tokens.iter().position(|&t| t >= self.dims.vocab_size) {
            Some(pos) => Err(LstmError::InvalidSequence(format!(
                "{} token {} at position {} is outside the vocabulary of {}",
                what, tokens[pos], pos, self.dims.vocab_size
            ))),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Cell kernels
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Gate {
    Forget,
    Input,
    Cell,
    Output,
}

impl Gate {
    /// Input weights, recurrent weights, bias.
    fn params(self) -> (ParamName, ParamName, ParamName) {
        match self {
            Gate::Forget => (ParamName::WForget, ParamName::UForget, ParamName::BForget),
            Gate::Input => (ParamName::WInput, ParamName::UInput, ParamName::BInput),
            Gate::Cell => (ParamName::WCell, ParamName::UCell, ParamName::BCell),
            Gate::Output => (ParamName::WOutput, ParamName::UOutput, ParamName::BOutput),
        }
    }
}

#[derive(Clone, Copy)]
enum Activation {
    Sigmoid,
    Tanh,
}

#[derive(Clone, Copy)]
struct BackwardStep {
    token: usize,
    target: usize,
    /// `1 / T`, the loss is a mean over timesteps.
    scale: f32,
}

/// Gradients flowing from step `t + 1` into step `t`.
struct Carry {
    dh: Tensor,
    dc: Tensor,
}

struct Kernels<'a, E: ComputeEngine> {
    engine: &'a E,
    pool: &'a mut TensorPool<E>,
    band: f32,
}

impl<'a, E: ComputeEngine> Kernels<'a, E> {
    fn gate(&mut self, w: &LstmParams<Tensor>, gate: Gate, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let (wn, un, bn) = gate.params();
        let mut pre = self.pool.rent(w.get(bn).shape())?;
        self.engine.matmul(x, w.get(wn), &mut pre, MatMul::PLAIN)?;
        self.engine.matmul(h, w.get(un), &mut pre, MatMul::PLAIN.accumulate())?;
        self.engine.accumulate(&mut pre, w.get(bn))?;
        let mut out = self.pool.rent(pre.shape())?;
        match gate {
            Gate::Cell => self.engine.tanh(&pre, &mut out)?,
            _ => self.engine.sigmoid(&pre, &mut out)?,
        }
        self.pool.release(pre);
        Ok(out)
    }

    /// One LSTM step. Takes ownership of the previous state, which ends up in
    /// the returned record.
    fn cell_forward(&mut self, w: &LstmParams<Tensor>, token: usize, h: Tensor, c: Tensor) -> Result<StepRecord> {
        let e = self.engine;
        let hs = h.shape().clone();
        let mut x = self.pool.rent(&Shape::matrix(1, w.embedding.cols()))?;
        e.lookup(&w.embedding, token, &mut x)?;

        let f = self.gate(w, Gate::Forget, &x, &h)?;
        let i = self.gate(w, Gate::Input, &x, &h)?;
        let g = self.gate(w, Gate::Cell, &x, &h)?;
        let o = self.gate(w, Gate::Output, &x, &h)?;

        let mut c_next = self.pool.rent(&hs)?;
        e.multiply(&f, &c, &mut c_next)?;
        let mut ig = self.pool.rent(&hs)?;
        e.multiply(&i, &g, &mut ig)?;
        e.accumulate(&mut c_next, &ig)?;
        self.pool.release(ig);

        let mut tc = self.pool.rent(&hs)?;
        e.tanh(&c_next, &mut tc)?;
        let mut h_next = self.pool.rent(&hs)?;
        e.multiply(&o, &tc, &mut h_next)?;

        e.synchronize();
        if !e.all_finite(&c_next) {
            return Err(LstmError::non_finite(ValueRole::Activation, "cell_next"));
        }
        if !e.all_finite(&h_next) {
            return Err(LstmError::non_finite(ValueRole::Activation, "hidden_next"));
        }
        Ok(StepRecord {
            input: x,
            hidden_prev: h,
            cell_prev: c,
            forget_gate: f,
            input_gate: i,
            cell_candidate: g,
            output_gate: o,
            cell_next: c_next,
            tanh_cell_next: tc,
            hidden_next: h_next,
        })
    }

    /// Return a record's tensors to the pool, keeping the new state.
    fn recycle(&mut self, record: StepRecord) -> (Tensor, Tensor) {
        let [input, hidden_prev, cell_prev, f, i, g, o, cell_next, tc, hidden_next] = record.into_tensors();
        self.pool.release_all([input, hidden_prev, cell_prev, f, i, g, o, tc]);
        (hidden_next, cell_next)
    }

    fn advance(&mut self, w: &LstmParams<Tensor>, token: usize, h: Tensor, c: Tensor) -> Result<(Tensor, Tensor)> {
        let record = self.cell_forward(w, token, h, c)?;
        Ok(self.recycle(record))
    }

    fn logits(&mut self, w: &LstmParams<Tensor>, h: &Tensor) -> Result<Tensor> {
        let mut logits = self.pool.rent(w.b_y.shape())?;
        self.engine.matmul(h, &w.w_y, &mut logits, MatMul::PLAIN)?;
        self.engine.accumulate(&mut logits, &w.b_y)?;
        Ok(logits)
    }

    fn probabilities(&mut self, w: &LstmParams<Tensor>, h: &Tensor) -> Result<Tensor> {
        let logits = self.logits(w, h)?;
        let mut p = self.pool.rent(logits.shape())?;
        self.engine.softmax(&logits, &mut p)?;
        self.pool.release(logits);
        Ok(p)
    }

    fn step_nll(&mut self, w: &LstmParams<Tensor>, h: &Tensor, target: usize) -> Result<f32> {
        let p = self.probabilities(w, h)?;
        self.engine.synchronize();
        let prob = self.engine.to_host(&p).get(target).copied();
        self.pool.release(p);
        let prob = prob.ok_or_else(|| LstmError::not_found("target index", target))?;
        if !prob.is_finite() {
            return Err(LstmError::non_finite(ValueRole::Activation, "softmax output"));
        }
        Ok(-prob.max(PROB_FLOOR).ln())
    }

    /// `a * b * act'(y)`, where `y` is already the activation's output.
    fn gate_delta(&mut self, a: &Tensor, b: &Tensor, y: &Tensor, act: Activation) -> Result<Tensor> {
        let mut deriv = self.pool.rent(y.shape())?;
        match act {
            Activation::Sigmoid => self.engine.sigmoid_derivative(y, &mut deriv)?,
            Activation::Tanh => self.engine.tanh_derivative(y, &mut deriv)?,
        }
        let mut ab = self.pool.rent(a.shape())?;
        self.engine.multiply(a, b, &mut ab)?;
        let mut out = self.pool.rent(a.shape())?;
        self.engine.multiply(&ab, &deriv, &mut out)?;
        self.pool.release_all([ab, deriv]);
        Ok(out)
    }

    /// Compute a contribution into scratch, clip it to the band, add it to `dst`.
    fn contribute(&mut self, dst: &mut Tensor, compute: impl FnOnce(&mut Tensor) -> Result<()>) -> Result<()> {
        let mut s = self.pool.rent(dst.shape())?;
        compute(&mut s)?;
        self.engine.clip(&mut s, -self.band, self.band);
        self.engine.accumulate(dst, &s)?;
        self.pool.release(s);
        Ok(())
    }

    fn clip_local(&self, t: &mut Tensor) {
        self.engine.clip(t, -self.band, self.band);
    }

    fn cell_backward(
        &mut self,
        w: &LstmParams<Tensor>,
        grads: &mut GradientSet,
        rec: &StepRecord,
        step: BackwardStep,
        carry: Carry,
    ) -> Result<Carry> {
        let e = self.engine;
        let hs = rec.hidden_next.shape().clone();

        // Output layer: dy = (softmax(h W_y + b_y) - onehot) / T.
        let p = self.probabilities(w, &rec.hidden_next)?;
        let mut onehot = self.pool.rent(p.shape())?;
        e.one_hot(step.target, &mut onehot)?;
        let mut dy = self.pool.rent(p.shape())?;
        e.subtract(&p, &onehot, &mut dy)?;
        e.scale(&mut dy, step.scale);
        self.pool.release_all([p, onehot]);

        self.contribute(&mut grads.w_y, |s| e.matmul(&rec.hidden_next, &dy, s, MatMul::PLAIN.transpose_a()))?;
        self.contribute(&mut grads.b_y, |s| e.copy(&dy, s))?;

        let mut dh = self.pool.rent(&hs)?;
        e.matmul(&dy, &w.w_y, &mut dh, MatMul::PLAIN.transpose_b())?;
        self.pool.release(dy);
        e.accumulate(&mut dh, &carry.dh)?;
        self.clip_local(&mut dh);

        let d_o = self.gate_delta(&dh, &rec.tanh_cell_next, &rec.output_gate, Activation::Sigmoid)?;
        let mut dc = self.gate_delta(&dh, &rec.output_gate, &rec.tanh_cell_next, Activation::Tanh)?;
        e.accumulate(&mut dc, &carry.dc)?;
        self.clip_local(&mut dc);
        let d_f = self.gate_delta(&dc, &rec.cell_prev, &rec.forget_gate, Activation::Sigmoid)?;
        let d_i = self.gate_delta(&dc, &rec.cell_candidate, &rec.input_gate, Activation::Sigmoid)?;
        let d_g = self.gate_delta(&dc, &rec.input_gate, &rec.cell_candidate, Activation::Tanh)?;

        let mut dx = self.pool.rent_zeroed(rec.input.shape())?;
        let mut dh_prev = self.pool.rent_zeroed(&hs)?;
        for (gate, d) in [(Gate::Forget, &d_f), (Gate::Input, &d_i), (Gate::Cell, &d_g), (Gate::Output, &d_o)] {
            let (wn, un, bn) = gate.params();
            self.contribute(grads.get_mut(wn), |s| e.matmul(&rec.input, d, s, MatMul::PLAIN.transpose_a()))?;
            self.contribute(grads.get_mut(un), |s| e.matmul(&rec.hidden_prev, d, s, MatMul::PLAIN.transpose_a()))?;
            self.contribute(grads.get_mut(bn), |s| e.copy(d, s))?;
            e.matmul(d, w.get(wn), &mut dx, MatMul::PLAIN.transpose_b().accumulate())?;
            e.matmul(d, w.get(un), &mut dh_prev, MatMul::PLAIN.transpose_b().accumulate())?;
        }
        self.clip_local(&mut dx);
        e.accumulate_row(&mut grads.embedding, step.token, &dx)?;

        let mut dc_prev = self.pool.rent(&hs)?;
        e.multiply(&dc, &rec.forget_gate, &mut dc_prev)?;
        self.clip_local(&mut dc_prev);
        self.clip_local(&mut dh_prev);

        self.pool.release_all([dx, dh, dc, d_f, d_i, d_g, d_o, carry.dh, carry.dc]);
        Ok(Carry { dh: dh_prev, dc: dc_prev })
    }
}

// ============================================================================
// Initialisation and sampling
// ============================================================================

fn rand_normal(n: usize, scale: f32, rng: &mut impl Rng) -> Vec<f32> {
    (0..n)
        .map(|_| {
            let u1: f32 = rng.gen::<f32>().max(1e-10);
            let u2: f32 = rng.gen();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos() * scale
        })
        .collect()
}

fn init_values(name: ParamName, dims: &LstmDims, rng: &mut impl Rng) -> Vec<f32> {
    let shape = name.shape(dims);
    match name {
        ParamName::BForget => vec![1.0; shape.len()],
        n if n.is_bias() => vec![0.0; shape.len()],
        _ => {
            let scale = (2.0 / (shape.rows() + shape.cols()) as f32).sqrt();
            rand_normal(shape.len(), scale, rng)
        }
    }
}

/// Draw from `softmax(logits / temperature)`; a non-positive temperature
/// means greedy argmax.
pub fn sample_index(logits: &[f32], temperature: f32, rng: &mut impl Rng) -> usize {
    if logits.is_empty() {
        return 0;
    }
    if temperature <= 0.0 {
        return logits
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (j, &l)| if l > best.1 { (j, l) } else { best })
            .0;
    }
    let mx = logits.iter().fold(f32::NEG_INFINITY, |m, &l| m.max(l / temperature));
    let ex: Vec<f32> = logits.iter().map(|l| (l / temperature - mx).exp()).collect();
    let sum: f32 = ex.iter().sum();
    let mut r = rng.gen::<f32>() * sum;
    for (j, e) in ex.iter().enumerate() {
        r -= e;
        if r <= 0.0 {
            return j;
        }
    }
    ex.len() - 1
}
