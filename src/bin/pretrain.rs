//! Pretraining driver binary.
//!
//! Streams shard-table batches through the prefetching loader, tokenizes
//! captions, and drives the training loop with a null compute backend that
//! consumes every tensor it is handed. Checkpoints rotate in the output
//! directory and per-epoch metrics append to `log.txt`, so the full data
//! and bookkeeping path can be exercised before a real model is attached.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin pretrain -- \
//!     --config config.json \
//!     --output-dir runs/pretrain \
//!     --tokenizer tokenizer.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use indicatif::HumanDuration;
use tracing::info;

use confluence::checkpoint::{self, CheckpointError};
use confluence::config::TrainConfig;
use confluence::dataset::pretrain::PretrainShardDataset;
use confluence::dataset::Dataset;
use confluence::imaging::TrainAugment;
use confluence::loader::{BatchLoader, PretrainBatch};
use confluence::training::{
    self, configure_tokenizer, LossSet, LrScheduler, Optimizer, PretrainModel, TextBatch,
};

#[derive(Parser, Debug)]
#[command(about = "Run vision-language pretraining over shard tables")]
struct Args {
    /// Path to the run config JSON.
    #[arg(long)]
    config: PathBuf,

    /// Directory for checkpoints, the metrics log, and the config snapshot.
    #[arg(long)]
    output_dir: PathBuf,

    /// Tokenizer definition file (tokenizer.json).
    #[arg(long)]
    tokenizer: PathBuf,

    /// Resume from this checkpoint instead of starting fresh.
    #[arg(long)]
    resume: Option<PathBuf>,
}

/// Stand-in compute backend.
///
/// Reduces both image views and the attention mask to means so every byte
/// the loader produces is actually read, and reports those means as losses.
struct NullModel {
    steps: u64,
}

fn mean_abs(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| v.abs()).sum::<f32>() / values.len() as f32
}

impl PretrainModel for NullModel {
    fn train_step(
        &mut self,
        batch: &PretrainBatch,
        text: &TextBatch,
        _alpha: f32,
        _neg_thresh: f32,
    ) -> LossSet {
        self.steps += 1;
        let itm = if text.attention_mask.is_empty() {
            0.0
        } else {
            text.attention_mask.iter().sum::<u32>() as f32 / text.attention_mask.len() as f32
        };
        LossSet {
            mlm: mean_abs(&batch.views),
            ita: mean_abs(&batch.views_aug),
            itm,
        }
    }

    fn state(&self) -> Vec<u8> {
        self.steps.to_le_bytes().to_vec()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), CheckpointError> {
        self.steps = read_u64_state("model", bytes)?;
        Ok(())
    }
}

struct NullOptimizer {
    steps: u64,
    learning_rate: f64,
}

impl Optimizer for NullOptimizer {
    fn zero_grad(&mut self) {}

    fn step(&mut self) {
        self.steps += 1;
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn state(&self) -> Vec<u8> {
        self.steps.to_le_bytes().to_vec()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), CheckpointError> {
        self.steps = read_u64_state("optimizer", bytes)?;
        Ok(())
    }
}

struct NullScheduler {
    position: u64,
}

impl LrScheduler for NullScheduler {
    fn step(&mut self, position: usize) {
        self.position = position as u64;
    }

    fn state(&self) -> Vec<u8> {
        self.position.to_le_bytes().to_vec()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), CheckpointError> {
        self.position = read_u64_state("scheduler", bytes)?;
        Ok(())
    }
}

fn read_u64_state(section: &'static str, bytes: &[u8]) -> Result<u64, CheckpointError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| CheckpointError::BadState {
        section,
        reason: format!("expected 8 bytes, got {}", bytes.len()),
    })?;
    Ok(u64::from_le_bytes(raw))
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let pipeline_start = std::time::Instant::now();

    info!("Step 1: Loading config from {}", args.config.display());
    let config = TrainConfig::load(&args.config)?;
    std::fs::create_dir_all(&args.output_dir)?;
    config.save(&args.output_dir.join("config.json"))?;

    info!(
        "Step 2: Opening pretraining corpus ({} shard tables)",
        config.train_files.len()
    );
    let transform = Arc::new(TrainAugment::new(config.image_size));
    let dataset = PretrainShardDataset::open(&config.train_files, transform, config.max_words)?;
    info!("  {} image-caption pairs", dataset.len());
    let loader = BatchLoader::new(Arc::new(dataset), config.loader_config());
    info!("  {} batches per epoch", loader.num_batches());

    info!(
        "Step 3: Loading tokenizer from {}",
        args.tokenizer.display()
    );
    let mut tokenizer = tokenizers::Tokenizer::from_file(&args.tokenizer)?;
    configure_tokenizer(&mut tokenizer, config.max_text_len)?;

    let mut model = NullModel { steps: 0 };
    let mut optimizer = NullOptimizer {
        steps: 0,
        learning_rate: 1e-4,
    };
    let mut scheduler = NullScheduler { position: 0 };

    let start_epoch = match args.resume {
        Some(ref path) => {
            let restored = checkpoint::load(path)?;
            model.load_state(&restored.model)?;
            optimizer.load_state(&restored.optimizer)?;
            scheduler.load_state(&restored.scheduler)?;
            info!(
                "Step 4: Resuming after epoch {} from {}",
                restored.epoch,
                path.display()
            );
            restored.epoch + 1
        }
        None => {
            info!("Step 4: Training from scratch");
            0
        }
    };

    training::fit(
        &mut model,
        &mut optimizer,
        &mut scheduler,
        &loader,
        &tokenizer,
        &config,
        &args.output_dir,
        start_epoch,
    )?;

    info!(
        "Training complete in {} ({} model steps)",
        HumanDuration(pipeline_start.elapsed()),
        model.steps
    );
    Ok(())
}
