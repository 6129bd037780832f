//! LSTM training with disk-paged backpropagation through time.
//!
//! The per-timestep working set of the forward pass is written to a step
//! cache on local disk and read back in reverse during the backward pass, so
//! sequence length is bounded by disk rather than memory. Parameters live in
//! an id-addressed tensor store; scratch buffers are recycled through a
//! shape-keyed pool.

pub mod bptt;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod observer;
pub mod optimizer;
pub mod params;
pub mod pool;
pub mod step_cache;
pub mod store;
pub mod tensor;

pub use bptt::{ClipReport, Phase, StepOutcome, Trainer, TrainerConfig};
pub use checkpoint::{load_checkpoint, peek_checkpoint, save_checkpoint, Checkpoint, CheckpointInfo};
pub use engine::{ComputeEngine, CpuEngine, MatMul};
pub use error::{LstmError, Result, ValueRole};
pub use observer::{AllocationObserver, CountingObserver};
pub use optimizer::{AdamConfig, AdamOptimizer, OptimizerSnapshot};
pub use params::{GradientSet, LstmDims, LstmParams, ParamName};
pub use pool::TensorPool;
pub use step_cache::{StepCache, StepDims, StepField, StepRecord};
pub use store::{StoreStats, TensorStore};
pub use tensor::{Shape, Tensor};

use std::sync::Once;

static INIT: Once = Once::new();

/// Set up `env_logger` once. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging() {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or("info");
        let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();
    });
}
