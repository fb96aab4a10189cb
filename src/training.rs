//! Pretraining loop driver.
//!
//! The driver owns the schedule arithmetic and the per-epoch bookkeeping
//! (checkpoint rotation, metrics log) and talks to the model, optimizer,
//! and scheduler through narrow traits. The model step is a black box that
//! takes one collated batch plus the two schedule scalars and hands back
//! its named losses, so any backend that can do that plugs in here.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::checkpoint::{self, Checkpoint, CheckpointError};
use crate::config::TrainConfig;
use crate::dataset::pretrain::PretrainSample;
use crate::dataset::Dataset;
use crate::error::FetchError;
use crate::loader::{BatchLoader, LoaderError, PretrainBatch};

/// Scheduler positions advance once per this many steps inside epoch 0.
pub const WARMUP_STEP_SIZE: usize = 100;

const LOG_EVERY: usize = 100;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("tokenization failed: {0}")]
    Tokenize(tokenizers::Error),

    #[error("batch fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("failed to snapshot config: {0}")]
    ConfigSnapshot(#[from] serde_json::Error),

    #[error("failed to append metrics log: {0}")]
    Log(#[from] std::io::Error),
}

// ============================================================================
// Text batching
// ============================================================================

/// Tokenized captions, padded to the longest sequence in the batch.
///
/// `ids` and `attention_mask` are flat `[batch, seq_len]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBatch {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub batch: usize,
    pub seq_len: usize,
}

/// Set batch-longest padding and a hard token cap on `tokenizer`.
pub fn configure_tokenizer(
    tokenizer: &mut Tokenizer,
    max_text_len: usize,
) -> Result<(), TrainError> {
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_text_len,
            ..Default::default()
        }))
        .map_err(TrainError::Tokenize)?;
    tokenizer.with_padding(Some(PaddingParams::default()));
    Ok(())
}

pub fn tokenize_batch(
    tokenizer: &Tokenizer,
    captions: &[String],
) -> Result<TextBatch, TrainError> {
    let encodings = tokenizer
        .encode_batch(captions.to_vec(), true)
        .map_err(TrainError::Tokenize)?;

    let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);
    let mut ids = Vec::with_capacity(encodings.len() * seq_len);
    let mut attention_mask = Vec::with_capacity(encodings.len() * seq_len);
    for encoding in &encodings {
        // padding was configured, so every row comes back the same length
        debug_assert_eq!(encoding.get_ids().len(), seq_len);
        ids.extend_from_slice(encoding.get_ids());
        attention_mask.extend_from_slice(encoding.get_attention_mask());
    }

    Ok(TextBatch {
        ids,
        attention_mask,
        batch: encodings.len(),
        seq_len,
    })
}

// ============================================================================
// Model-facing traits
// ============================================================================

/// Per-step losses returned by the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSet {
    pub mlm: f32,
    pub ita: f32,
    pub itm: f32,
}

impl LossSet {
    pub fn total(&self) -> f32 {
        self.mlm + self.ita + self.itm
    }
}

pub trait PretrainModel {
    /// Run one forward/backward over the batch.
    ///
    /// `alpha` is the distillation mixing coefficient, `neg_thresh` the
    /// hard-negative sampling threshold, both already scheduled by the
    /// driver.
    fn train_step(
        &mut self,
        batch: &PretrainBatch,
        text: &TextBatch,
        alpha: f32,
        neg_thresh: f32,
    ) -> LossSet;

    fn state(&self) -> Vec<u8>;

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), CheckpointError>;
}

pub trait Optimizer {
    fn zero_grad(&mut self);

    fn step(&mut self);

    fn learning_rate(&self) -> f64;

    fn state(&self) -> Vec<u8>;

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), CheckpointError>;
}

pub trait LrScheduler {
    /// Move the schedule to `position`. Positions are fractional-epoch
    /// indices during warmup and whole-epoch indices afterward.
    fn step(&mut self, position: usize);

    fn state(&self) -> Vec<u8>;

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), CheckpointError>;
}

// ============================================================================
// Schedules
// ============================================================================

/// Mixing coefficient for the current step.
///
/// Ramps linearly from 0 to `alpha` across epoch 0, then stays at `alpha`.
pub fn warmup_alpha(alpha: f32, epoch: usize, step: usize, num_batches: usize) -> f32 {
    if epoch > 0 || num_batches == 0 {
        return alpha;
    }
    alpha * (step as f32 / num_batches as f32).min(1.0)
}

/// Negative-sampling threshold for the current epoch.
///
/// Zero at epoch 0, reaching the configured value at the final epoch.
pub fn negative_threshold(neg_thresh: f32, epoch: usize, max_epoch: usize) -> f32 {
    if max_epoch <= 1 {
        return 0.0;
    }
    epoch as f32 * neg_thresh / (max_epoch - 1) as f32
}

// ============================================================================
// Driver
// ============================================================================

/// Per-epoch averages, as written to the metrics log.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochStats {
    pub loss_mlm: f32,
    pub loss_ita: f32,
    pub loss_itm: f32,
    pub lr: f64,
}

pub fn train_epoch<D>(
    model: &mut dyn PretrainModel,
    optimizer: &mut dyn Optimizer,
    scheduler: &mut dyn LrScheduler,
    loader: &BatchLoader<D>,
    tokenizer: &Tokenizer,
    config: &TrainConfig,
    epoch: usize,
) -> Result<EpochStats, TrainError>
where
    D: Dataset<Sample = PretrainSample> + 'static,
{
    let num_batches = loader.num_batches();
    let warmup_steps = config.warmup_epochs * WARMUP_STEP_SIZE;

    let mut mlm_sum = 0f64;
    let mut ita_sum = 0f64;
    let mut itm_sum = 0f64;
    let mut lr_sum = 0f64;
    let mut steps = 0usize;

    for (i, batch) in loader.epoch(epoch)?.enumerate() {
        let batch = batch?;
        optimizer.zero_grad();
        let text = tokenize_batch(tokenizer, &batch.captions)?;

        let alpha = warmup_alpha(config.alpha, epoch, i, num_batches);
        let neg_thresh = negative_threshold(config.neg_thresh, epoch, config.epochs);
        let losses = model.train_step(&batch, &text, alpha, neg_thresh);
        optimizer.step();

        mlm_sum += f64::from(losses.mlm);
        ita_sum += f64::from(losses.ita);
        itm_sum += f64::from(losses.itm);
        lr_sum += optimizer.learning_rate();
        steps += 1;

        if i % LOG_EVERY == 0 {
            info!(
                epoch,
                step = i,
                loss_mlm = losses.mlm,
                loss_ita = losses.ita,
                loss_itm = losses.itm,
                lr = optimizer.learning_rate(),
                "train step"
            );
        }

        // the schedule advances in fractional-epoch positions inside epoch 0
        if epoch == 0 && i % WARMUP_STEP_SIZE == 0 && i <= warmup_steps {
            scheduler.step(i / WARMUP_STEP_SIZE);
        }
    }

    if steps == 0 {
        return Ok(EpochStats::default());
    }
    let steps_f = steps as f64;
    Ok(EpochStats {
        loss_mlm: (mlm_sum / steps_f) as f32,
        loss_ita: (ita_sum / steps_f) as f32,
        loss_itm: (itm_sum / steps_f) as f32,
        lr: lr_sum / steps_f,
    })
}

/// Run epochs `start_epoch..config.epochs`, checkpointing after each one.
#[allow(clippy::too_many_arguments)]
pub fn fit<D>(
    model: &mut dyn PretrainModel,
    optimizer: &mut dyn Optimizer,
    scheduler: &mut dyn LrScheduler,
    loader: &BatchLoader<D>,
    tokenizer: &Tokenizer,
    config: &TrainConfig,
    output_dir: &Path,
    start_epoch: usize,
) -> Result<(), TrainError>
where
    D: Dataset<Sample = PretrainSample> + 'static,
{
    for epoch in start_epoch..config.epochs {
        if epoch > 0 {
            scheduler.step(epoch + config.warmup_epochs);
        }

        let stats = train_epoch(model, optimizer, scheduler, loader, tokenizer, config, epoch)?;
        info!(
            epoch,
            loss_mlm = stats.loss_mlm,
            loss_ita = stats.loss_ita,
            loss_itm = stats.loss_itm,
            lr = stats.lr,
            "epoch complete"
        );

        let snapshot = Checkpoint {
            epoch,
            config_json: serde_json::to_string(config)?,
            model: model.state(),
            optimizer: optimizer.state(),
            scheduler: scheduler.state(),
        };
        let path = checkpoint::save(output_dir, &snapshot)?;
        checkpoint::remove_previous(output_dir, epoch)?;
        debug!(path = %path.display(), "checkpoint written");

        append_log(output_dir, epoch, &stats)?;
    }
    Ok(())
}

fn append_log(output_dir: &Path, epoch: usize, stats: &EpochStats) -> Result<(), TrainError> {
    let line = serde_json::json!({
        "train_loss_mlm": round3(f64::from(stats.loss_mlm)),
        "train_loss_ita": round3(f64::from(stats.loss_ita)),
        "train_loss_itm": round3(f64::from(stats.loss_itm)),
        "train_lr": round3(stats.lr),
        "epoch": epoch,
    });
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_dir.join("log.txt"))?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
