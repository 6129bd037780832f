use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use lstm_rust::{CountingObserver, CpuEngine, LstmDims, ParamName, Phase, Trainer, TrainerConfig};

fn config(dir: &TempDir, session: &str) -> TrainerConfig {
    TrainerConfig {
        cache_dir: dir.path().to_path_buf(),
        session: session.to_string(),
        sync_writes: false,
        ..TrainerConfig::default()
    }
}

fn new_trainer(dir: &TempDir, dims: LstmDims, seed: u64) -> Trainer<CpuEngine> {
    let mut rng = StdRng::seed_from_u64(seed);
    Trainer::new(Arc::new(CpuEngine::new()), dims, config(dir, "it"), &mut rng).unwrap()
}

#[test]
fn three_step_sequence_trains_cleanly() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 20, embed_size: 4, hidden_size: 4 };
    let mut trainer = new_trainer(&dir, dims, 11);
    let observer = Arc::new(CountingObserver::new());
    trainer.set_observer(Some(observer.clone()));

    let outcome = trainer.train_step(&[5, 12, 5], &[12, 5, 3]).unwrap();

    assert_eq!(outcome.steps, 3);
    assert!(outcome.loss.is_finite());
    assert!(outcome.grad_norm.is_finite());
    assert!(outcome.skipped.is_empty());
    assert!(trainer.cache().is_empty());
    assert_eq!(trainer.pool().outstanding(), 0);
    assert_eq!(observer.outstanding(), 0);
    assert!(observer.rents() > 0);
    assert_eq!(trainer.phase(), Phase::Idle);
    for name in ParamName::ALL {
        assert_eq!(trainer.optimizer().step_count(name.layer_id()), Some(1), "{}", name);
    }
}

#[test]
fn pool_buffers_are_reused_across_steps() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 20, embed_size: 4, hidden_size: 4 };
    let mut trainer = new_trainer(&dir, dims, 3);
    let observer = Arc::new(CountingObserver::new());
    trainer.set_observer(Some(observer.clone()));

    trainer.train_step(&[1, 2, 3, 4], &[2, 3, 4, 5]).unwrap();
    let allocated = observer.allocations();
    trainer.train_step(&[1, 2, 3, 4], &[2, 3, 4, 5]).unwrap();
    assert_eq!(observer.allocations(), allocated);
    assert!(trainer.pool().pooled_count() > 0);

    let pooled = trainer.pool().pooled_count();
    assert_eq!(trainer.trim_pool(), pooled);
    assert_eq!(trainer.pool().pooled_count(), 0);
}

#[test]
fn long_sequence_is_paged_through_the_cache() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 7, embed_size: 3, hidden_size: 5 };
    let mut trainer = new_trainer(&dir, dims, 5);
    let inputs: Vec<usize> = (0..200).map(|i| (i * 3) % 7).collect();
    let targets: Vec<usize> = (0..200).map(|i| (i * 3 + 1) % 7).collect();

    trainer.forward(&inputs, &targets).unwrap();
    assert_eq!(trainer.cache().len(), 200);
    assert_eq!(trainer.cache().read_index_log().unwrap().len(), 200);
    assert!(trainer.cache().data_bytes() > 0);
    let grads = trainer.backward(&inputs, &targets).unwrap();
    trainer.release_gradients(grads);
    assert_eq!(trainer.pool().outstanding(), 0);
}

#[test]
fn optimizer_reset_clears_every_layer() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 10, embed_size: 3, hidden_size: 3 };
    let mut trainer = new_trainer(&dir, dims, 9);
    trainer.train_step(&[1, 2], &[2, 3]).unwrap();
    trainer.train_step(&[1, 2], &[2, 3]).unwrap();
    assert_eq!(trainer.optimizer().step_count(0), Some(2));

    trainer.reset_optimizer();
    assert_eq!(trainer.optimizer().layer_count(), 0);
    trainer.train_step(&[1, 2], &[2, 3]).unwrap();
    assert_eq!(trainer.optimizer().step_count(0), Some(1));
}

#[test]
fn dropping_the_trainer_removes_its_namespace() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 10, embed_size: 3, hidden_size: 3 };
    let trainer = new_trainer(&dir, dims, 1);
    let root = trainer.store().root().to_path_buf();
    assert!(root.exists());
    drop(trainer);
    assert!(!root.exists());
}
