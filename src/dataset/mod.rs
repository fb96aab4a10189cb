//! Task datasets over annotation corpora.
//!
//! Every dataset is constructed once, single-threaded, and then serves
//! `get` from many worker threads: all internal structures are immutable
//! after construction and hot-path randomness comes from the caller's rng.
//! The storage backend is fixed per instance: loose files under an image
//! root, or shard tables resolved through the registry.

pub mod entailment;
pub mod grounding;
pub mod nlvr;
pub mod pretrain;
pub mod retrieval;
pub mod vqa;

use std::path::PathBuf;

use image::RgbImage;
use rand::rngs::SmallRng;

use crate::error::FetchError;
use crate::imaging;
use crate::shard::ShardRegistry;

/// Randomly-indexable sample source.
///
/// Implementations keep no mutable state, so `get` is safe to call
/// concurrently; randomness comes only from `rng`.
pub trait Dataset: Send + Sync {
    type Sample;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError>;
}

/// How a dataset turns records into pixels, fixed at construction.
#[derive(Debug)]
pub enum ImageSource {
    /// Resolve the record's image path against a root directory.
    PathBacked { root: PathBuf },
    /// Read raw bytes from the shard table backing the record's global
    /// index range.
    TableBacked { registry: ShardRegistry },
}

impl ImageSource {
    /// Table-backed when any annotation file registered a shard range.
    pub fn new(registry: ShardRegistry, root: PathBuf) -> Self {
        if registry.is_empty() {
            Self::PathBacked { root }
        } else {
            Self::TableBacked { registry }
        }
    }

    pub fn is_table_backed(&self) -> bool {
        matches!(self, Self::TableBacked { .. })
    }

    /// Decode the shard row backing `index`; a path-backed source reports
    /// the index as unregistered.
    pub fn decode_row(&self, index: usize, row: usize) -> Result<RgbImage, FetchError> {
        let Self::TableBacked { registry } = self else {
            return Err(FetchError::IndexRange { index });
        };
        let table = registry.resolve(index)?;
        Ok(imaging::decode_bytes(table.image_bytes(row)?)?)
    }
}
