use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lstm_rust::config::TrainConfig;
use lstm_rust::data::CharCorpus;
use lstm_rust::{init_logging, load_checkpoint, save_checkpoint, CpuEngine, LstmDims, Trainer};

fn main() -> anyhow::Result<()> {
    init_logging();
    let config = TrainConfig::from_args();
    train(&config)
}

fn load_text(config: &TrainConfig) -> anyhow::Result<String> {
    if !config.training_file.is_empty() && Path::new(&config.training_file).exists() {
        let text = fs::read_to_string(&config.training_file)
            .with_context(|| format!("reading training file {}", config.training_file))?;
        info!("loaded training text from {} ({} chars)", config.training_file, text.len());
        return Ok(text);
    }
    Ok(config.training_text.clone())
}

fn train(config: &TrainConfig) -> anyhow::Result<()> {
    let text = load_text(config)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let engine = Arc::new(CpuEngine::new());

    let mut start_epoch = 0usize;
    let resume = !config.load_checkpoint.is_empty() && Path::new(&config.load_checkpoint).exists();
    let (corpus, mut trainer) = if resume {
        let cp = load_checkpoint(&config.load_checkpoint)
            .with_context(|| format!("loading checkpoint {}", config.load_checkpoint))?;
        let meta = cp.metadata_json()?;
        if let Some(e) = meta.as_ref().and_then(|m| m.get("epoch")).and_then(|e| e.as_u64()) {
            start_epoch = e as usize;
        }
        let corpus = match meta.as_ref().and_then(|m| m.get("vocab")).and_then(|v| v.as_str()) {
            Some(vocab) => CharCorpus::with_vocab(&text, vocab.chars().collect())?,
            None => CharCorpus::from_text(&text)?,
        };
        if corpus.vocab_size() != cp.dims.vocab_size {
            bail!(
                "checkpoint vocabulary has {} symbols, training text has {}",
                cp.dims.vocab_size,
                corpus.vocab_size()
            );
        }
        let trainer = Trainer::restore(engine, cp, config.trainer_config())?;
        (corpus, trainer)
    } else {
        let corpus = CharCorpus::from_text(&text)?;
        let dims = LstmDims {
            vocab_size: corpus.vocab_size(),
            embed_size: config.embed_size,
            hidden_size: config.hidden_size,
        };
        let trainer = Trainer::new(engine, dims, config.trainer_config(), &mut rng)?;
        (corpus, trainer)
    };

    let dims = trainer.dims();
    info!(
        "config: hidden={} embed={} vocab={} seq={} lr={} wd={} epochs={} clip={}",
        dims.hidden_size,
        dims.embed_size,
        dims.vocab_size,
        config.seq_length,
        config.learning_rate,
        config.weight_decay,
        config.epochs,
        config.max_grad_norm
    );

    let seqs = corpus.sequences(config.seq_length);
    info!("training on {} sequences", seqs.len());
    let t0 = Instant::now();
    let mut best_loss = f32::INFINITY;

    for epoch in start_epoch..config.epochs {
        let mut order: Vec<usize> = (0..seqs.len()).collect();
        for i in (1..order.len()).rev() {
            let j = rng.gen_range(0..=i);
            order.swap(i, j);
        }

        let (mut el, mut egn, mut skipped) = (0.0f32, 0.0f32, 0usize);
        for &k in &order {
            let (xs, ts) = seqs[k];
            let out = trainer.train_step(xs, ts).with_context(|| format!("epoch {} sequence {}", epoch + 1, k))?;
            el += out.loss;
            egn += out.grad_norm;
            skipped += out.skipped.len();
        }
        let n = seqs.len().max(1) as f32;
        let al = el / n;

        if (epoch + 1) % config.log_every.max(1) == 0 || epoch == start_epoch {
            info!(
                "Epoch {:4} | Loss: {:.6} | \u{2207}: {:.4} | Time: {:.1}s",
                epoch + 1,
                al,
                egn / n,
                t0.elapsed().as_secs_f64()
            );
        }
        if skipped > 0 {
            warn!("epoch {}: {} parameter updates skipped", epoch + 1, skipped);
        }
        if config.save_every > 0 && (epoch + 1) % config.save_every == 0 {
            let path = config.save_path.replace(".bin", &format!("_epoch{}.bin", epoch + 1));
            let meta = serde_json::json!({"epoch": epoch + 1, "loss": al, "vocab": corpus.vocab()});
            save_checkpoint(&path, &trainer.checkpoint(Some(&meta))?)?;
        }
        if config.reset_optimizer_every > 0 && (epoch + 1) % config.reset_optimizer_every == 0 {
            trainer.reset_optimizer();
            trainer.trim_pool();
        }
        if al < best_loss {
            best_loss = al;
        }
    }

    let tt = t0.elapsed().as_secs_f64();
    info!("done in {:.1}s | best loss: {:.6}", tt, best_loss);
    if config.save_on_complete {
        let meta = serde_json::json!({
            "epoch": config.epochs,
            "loss": best_loss,
            "time": format!("{:.1}", tt),
            "completed": true,
            "vocab": corpus.vocab(),
        });
        save_checkpoint(&config.save_path, &trainer.checkpoint(Some(&meta))?)?;
    }

    let prefix = corpus.inputs.first().copied().into_iter().collect::<Vec<_>>();
    let generated = trainer.sample(&prefix, config.sample_length, config.temperature, &mut rng)?;
    println!(
        "Temperature: {}\nGenerated ({} tokens):\n{}\n{}{}\n{}",
        config.temperature,
        generated.len(),
        "-".repeat(70),
        corpus.decode(&prefix),
        corpus.decode(&generated),
        "-".repeat(70)
    );
    Ok(())
}
