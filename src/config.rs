//! Command-line configuration for the training binary.
//!
//! Arguments are `--key=value`. Keys are matched case-insensitively, unknown
//! keys are ignored, and a value that fails to parse keeps the default.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bptt::TrainerConfig;
use crate::optimizer::AdamConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub hidden_size: usize,
    pub embed_size: usize,
    pub seq_length: usize,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    pub epochs: usize,
    pub log_every: usize,
    pub max_grad_norm: f32,
    pub contribution_clip: f32,
    pub training_text: String,
    pub training_file: String,
    pub cache_dir: String,
    pub session: String,
    pub save_path: String,
    pub save_every: usize,
    pub save_on_complete: bool,
    pub load_checkpoint: String,
    pub reset_optimizer_every: usize,
    pub seed: u64,
    pub sample_length: usize,
    pub temperature: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            hidden_size: 32,
            embed_size: 16,
            seq_length: 64,
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            epochs: 200,
            log_every: 25,
            max_grad_norm: 5.0,
            contribution_clip: 5.0,
            training_text: "hello world this is a long short term memory network paging its \
                            activations to disk so that backpropagation through time fits in memory"
                .to_string(),
            training_file: String::new(),
            cache_dir: env::temp_dir().join("lstm-rust").to_string_lossy().into_owned(),
            session: "train".to_string(),
            save_path: "./checkpoint.bin".to_string(),
            save_every: 0,
            save_on_complete: true,
            load_checkpoint: String::new(),
            reset_optimizer_every: 0,
            seed: 42,
            sample_length: 100,
            temperature: 0.5,
        }
    }
}

impl TrainConfig {
    pub fn from_args() -> Self {
        Self::from_args_iter(env::args().skip(1))
    }

    pub fn from_args_iter<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for arg in args {
            let arg = arg.as_ref().trim_start_matches("--");
            if let Some((key, value)) = arg.split_once('=') {
                config.apply(key, value);
            }
        }
        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key.to_lowercase().as_str() {
            "hiddensize" => self.hidden_size = value.parse().unwrap_or(self.hidden_size),
            "embedsize" => self.embed_size = value.parse().unwrap_or(self.embed_size),
            "seqlength" => self.seq_length = value.parse().unwrap_or(self.seq_length),
            "learningrate" => self.learning_rate = value.parse().unwrap_or(self.learning_rate),
            "beta1" => self.beta1 = value.parse().unwrap_or(self.beta1),
            "beta2" => self.beta2 = value.parse().unwrap_or(self.beta2),
            "epsilon" => self.epsilon = value.parse().unwrap_or(self.epsilon),
            "weightdecay" => self.weight_decay = value.parse().unwrap_or(self.weight_decay),
            "epochs" => self.epochs = value.parse().unwrap_or(self.epochs),
            "logevery" => self.log_every = value.parse().unwrap_or(self.log_every),
            "maxgradnorm" => self.max_grad_norm = value.parse().unwrap_or(self.max_grad_norm),
            "contributionclip" => self.contribution_clip = value.parse().unwrap_or(self.contribution_clip),
            "trainingtext" => self.training_text = value.to_string(),
            "trainingfile" => self.training_file = value.to_string(),
            "cachedir" => self.cache_dir = value.to_string(),
            "session" => self.session = value.to_string(),
            "savepath" => self.save_path = value.to_string(),
            "saveevery" => self.save_every = value.parse().unwrap_or(self.save_every),
            "saveoncomplete" => self.save_on_complete = value == "true",
            "loadcheckpoint" => self.load_checkpoint = value.to_string(),
            "resetoptimizerevery" => {
                self.reset_optimizer_every = value.parse().unwrap_or(self.reset_optimizer_every)
            }
            "seed" => self.seed = value.parse().unwrap_or(self.seed),
            "samplelength" => self.sample_length = value.parse().unwrap_or(self.sample_length),
            "temperature" => self.temperature = value.parse().unwrap_or(self.temperature),
            _ => {}
        }
    }

    pub fn adam(&self) -> AdamConfig {
        AdamConfig {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            weight_decay: self.weight_decay,
        }
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            max_grad_norm: self.max_grad_norm,
            contribution_clip: self.contribution_clip,
            optimizer: self.adam(),
            cache_dir: PathBuf::from(&self.cache_dir),
            session: self.session.clone(),
            ..TrainerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_case_insensitively() {
        let c = TrainConfig::from_args_iter([
            "--hiddenSize=8",
            "--EMBEDSIZE=4",
            "--learningRate=0.01",
            "--session=exp1",
            "--saveOnComplete=false",
            "--resetOptimizerEvery=10",
        ]);
        assert_eq!(c.hidden_size, 8);
        assert_eq!(c.embed_size, 4);
        assert_eq!(c.learning_rate, 0.01);
        assert_eq!(c.session, "exp1");
        assert!(!c.save_on_complete);
        assert_eq!(c.reset_optimizer_every, 10);
    }

    #[test]
    fn bad_values_and_unknown_keys_keep_defaults() {
        let d = TrainConfig::default();
        let c = TrainConfig::from_args_iter(["--epochs=lots", "--nonsense=1", "positional", "--seqLength"]);
        assert_eq!(c, d);
    }

    #[test]
    fn trainer_config_carries_optimizer_and_clip_settings() {
        let c = TrainConfig::from_args_iter(["--maxGradNorm=2.5", "--beta2=0.99", "--cacheDir=/tmp/x"]);
        let t = c.trainer_config();
        assert_eq!(t.max_grad_norm, 2.5);
        assert_eq!(t.contribution_clip, 5.0);
        assert_eq!(t.optimizer.beta2, 0.99);
        assert_eq!(t.cache_dir, PathBuf::from("/tmp/x"));
        assert!(t.sync_writes);
    }
}
