use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use lstm_rust::{
    load_checkpoint, peek_checkpoint, save_checkpoint, CpuEngine, LstmDims, LstmError, ParamName, Shape, Trainer,
    TrainerConfig,
};

const INPUTS: [usize; 5] = [0, 4, 2, 7, 1];
const TARGETS: [usize; 5] = [4, 2, 7, 1, 3];

fn config(dir: &TempDir, session: &str) -> TrainerConfig {
    TrainerConfig {
        cache_dir: dir.path().to_path_buf(),
        session: session.to_string(),
        sync_writes: false,
        ..TrainerConfig::default()
    }
}

#[test]
fn restored_trainer_continues_identically() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 8, embed_size: 3, hidden_size: 4 };
    let engine = Arc::new(CpuEngine::new());
    let mut rng = StdRng::seed_from_u64(21);
    let mut a = Trainer::new(engine.clone(), dims, config(&dir, "a"), &mut rng).unwrap();
    for _ in 0..3 {
        a.train_step(&INPUTS, &TARGETS).unwrap();
    }

    let meta = serde_json::json!({"epoch": 3});
    let path = dir.path().join("ckpt.bin");
    save_checkpoint(&path, &a.checkpoint(Some(&meta)).unwrap()).unwrap();

    let info = peek_checkpoint(&path).unwrap();
    assert_eq!(info.tensors, 15);
    assert_eq!(info.optimizer_layers, 15);
    assert_eq!(info.optimizer_step, 3);
    assert_eq!(info.dims, dims);

    let cp = load_checkpoint(&path).unwrap();
    assert_eq!(cp.metadata_json().unwrap().unwrap()["epoch"], 3);
    let mut b = Trainer::restore(engine, cp, config(&dir, "b")).unwrap();

    for name in ParamName::ALL {
        assert_eq!(a.param_id(name), b.param_id(name));
        assert_eq!(a.parameter(name).unwrap(), b.parameter(name).unwrap(), "{}", name);
    }
    assert_eq!(a.optimizer().get_state(), b.optimizer().get_state());

    let la = a.train_step(&INPUTS, &TARGETS).unwrap();
    let lb = b.train_step(&INPUTS, &TARGETS).unwrap();
    assert_eq!(la, lb);
    for name in ParamName::ALL {
        assert_eq!(a.parameter(name).unwrap(), b.parameter(name).unwrap(), "{}", name);
    }
}

#[test]
fn restore_rejects_a_misshapen_entry() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 8, embed_size: 3, hidden_size: 4 };
    let engine = Arc::new(CpuEngine::new());
    let mut rng = StdRng::seed_from_u64(2);
    let mut a = Trainer::new(engine.clone(), dims, config(&dir, "a"), &mut rng).unwrap();
    let mut cp = a.checkpoint(None).unwrap();
    let entry = cp.entries.iter_mut().find(|e| e.name == "u_c").unwrap();
    entry.shape = Shape::matrix(2, 8);

    let err = Trainer::restore(engine, cp, config(&dir, "b")).err().unwrap();
    assert!(matches!(err, LstmError::ShapeMismatch { .. }));
}

#[test]
fn restore_requires_every_parameter() {
    let dir = TempDir::new().unwrap();
    let dims = LstmDims { vocab_size: 8, embed_size: 3, hidden_size: 4 };
    let engine = Arc::new(CpuEngine::new());
    let mut rng = StdRng::seed_from_u64(2);
    let mut a = Trainer::new(engine.clone(), dims, config(&dir, "a"), &mut rng).unwrap();
    let mut cp = a.checkpoint(None).unwrap();
    cp.entries.retain(|e| e.name != "b_o");

    let err = Trainer::restore(engine, cp, config(&dir, "b")).err().unwrap();
    assert!(matches!(err, LstmError::NotFound { .. }));
}
