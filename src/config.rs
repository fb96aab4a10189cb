//! Training configuration, loaded from JSON.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loader::LoaderConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode config: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pretraining run configuration.
///
/// Every field except `train_files` has a default, so a minimal config is
/// just the shard list. Unknown keys are rejected rather than silently
/// ignored; a typo in a hyperparameter name should fail loudly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    /// Shard-table files the pretraining corpus is read from.
    pub train_files: Vec<PathBuf>,

    /// Square side the augmentation crops to.
    #[serde(default = "default_image_size")]
    pub image_size: u32,

    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Word cap applied by caption normalization.
    #[serde(default = "default_max_words")]
    pub max_words: usize,

    /// Token cap applied by the tokenizer.
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,

    /// Distillation mixing coefficient, warmed up over epoch 0.
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Hard-negative sampling threshold at the final epoch.
    #[serde(default = "default_neg_thresh")]
    pub neg_thresh: f32,

    /// Total training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Scheduler warmup length, in epochs.
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,

    /// Base seed for shuffling and augmentation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Batches fetched ahead of the training step.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Drop the final short batch of each epoch.
    #[serde(default = "default_drop_last")]
    pub drop_last: bool,
}

fn default_image_size() -> u32 {
    256
}

fn default_batch_size() -> usize {
    64
}

fn default_max_words() -> usize {
    30
}

fn default_max_text_len() -> usize {
    25
}

fn default_alpha() -> f32 {
    0.4
}

fn default_neg_thresh() -> f32 {
    0.5
}

fn default_epochs() -> usize {
    30
}

fn default_warmup_epochs() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_prefetch() -> usize {
    3
}

fn default_drop_last() -> bool {
    true
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the resolved config, defaults included, next to the run's
    /// other outputs.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let bytes =
            serde_json::to_vec_pretty(self).map_err(|source| ConfigError::Encode { source })?;
        fs::write(path, bytes).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            prefetch: self.prefetch,
            seed: self.seed,
            drop_last: self.drop_last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config: TrainConfig =
            serde_json::from_str(r#"{"train_files": ["corpus.arrow"]}"#).unwrap();
        assert_eq!(config.train_files, vec![PathBuf::from("corpus.arrow")]);
        assert_eq!(config.image_size, 256);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.max_words, 30);
        assert_eq!(config.max_text_len, 25);
        assert_eq!(config.alpha, 0.4);
        assert_eq!(config.neg_thresh, 0.5);
        assert_eq!(config.epochs, 30);
        assert_eq!(config.warmup_epochs, 1);
        assert_eq!(config.seed, 42);
        assert_eq!(config.prefetch, 3);
        assert!(config.drop_last);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = serde_json::from_str::<TrainConfig>(
            r#"{"train_files": [], "learning_rte": 0.001}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("learning_rte"));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config: TrainConfig =
            serde_json::from_str(r#"{"train_files": ["a.arrow", "b.arrow"], "epochs": 3}"#)
                .unwrap();
        config.save(&path).unwrap();
        assert_eq!(TrainConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_loader_config_projection() {
        let config: TrainConfig = serde_json::from_str(
            r#"{"train_files": [], "batch_size": 8, "prefetch": 2, "seed": 9, "drop_last": false}"#,
        )
        .unwrap();
        let loader = config.loader_config();
        assert_eq!(loader.batch_size, 8);
        assert_eq!(loader.prefetch, 2);
        assert_eq!(loader.seed, 9);
        assert!(!loader.drop_last);
    }
}
