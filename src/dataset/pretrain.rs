//! Web-scale pretraining datasets.
//!
//! Two storage layouts feed the same sample shape. The loose-files variant
//! walks annotation records whose `image` field is itself the path to the
//! encoded file. The shard variant reads image bytes and captions straight
//! out of concatenated shard tables with no annotation files at all; every
//! (row, caption) pair is one sample. Web-crawled shards carry the
//! occasional corrupt image, so the shard variant swaps a failed fetch for
//! a uniformly re-drawn index instead of killing the epoch, up to a fixed
//! cap of replacement draws.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::prelude::*;
use rand::rngs::SmallRng;
use tracing::debug;

use super::Dataset;
use crate::annotation::{self, Annotation};
use crate::error::{DatasetError, FetchError};
use crate::imaging::{self, ImageTensor, ImageTransform};
use crate::shard::{self, CaptionIndex, ShardTable};
use crate::text;

/// Replacement draws allowed after a failed shard fetch before the error
/// surfaces to the caller.
const MAX_RESAMPLE_DRAWS: usize = 10;

/// Two independently-augmented views of one image plus one of its captions.
#[derive(Debug, Clone)]
pub struct PretrainSample {
    pub view: ImageTensor,
    pub view_aug: ImageTensor,
    pub caption: String,
}

// ============================================================================
// Loose-files variant
// ============================================================================

/// Pretraining corpus of annotation records pointing at image files on disk.
///
/// The `image` field is used as the path verbatim, no root is joined. A
/// list-valued caption field is re-sampled uniformly on every access.
pub struct PretrainPathDataset {
    records: Vec<Annotation>,
    transform: Arc<dyn ImageTransform>,
    max_words: usize,
}

impl std::fmt::Debug for PretrainPathDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PretrainPathDataset").finish_non_exhaustive()
    }
}

impl PretrainPathDataset {
    pub fn open(
        ann_files: &[PathBuf],
        transform: Arc<dyn ImageTransform>,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let mut records = Vec::new();
        for path in ann_files {
            records.extend(annotation::read_annotation_file(path)?);
        }
        if records.is_empty() {
            return Err(DatasetError::EmptyCorpus);
        }
        Ok(Self {
            records,
            transform,
            max_words,
        })
    }
}

impl Dataset for PretrainPathDataset {
    type Sample = PretrainSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let raw = ann
            .require_caption(index)?
            .pick(rng)
            .ok_or(FetchError::MissingField {
                index,
                field: "caption",
            })?;
        let caption = text::normalize(raw, self.max_words);

        let image = imaging::load_path(Path::new(ann.require_image(index)?))?;
        Ok(PretrainSample {
            view: self.transform.apply(&image, rng),
            view_aug: self.transform.apply(&image, rng),
            caption,
        })
    }
}

// ============================================================================
// Shard variant
// ============================================================================

/// Pretraining corpus read directly from shard tables.
///
/// Input paths are the shard files themselves. Tables are concatenated with
/// schema promotion and the caption index flattens rows into one sample per
/// (row, caption) pair, so `len()` is the total caption count.
pub struct PretrainShardDataset {
    table: ShardTable,
    texts: Vec<Vec<String>>,
    index: CaptionIndex,
    transform: Arc<dyn ImageTransform>,
    max_words: usize,
}

impl std::fmt::Debug for PretrainShardDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PretrainShardDataset").finish_non_exhaustive()
    }
}

impl PretrainShardDataset {
    pub fn open(
        shard_files: &[PathBuf],
        transform: Arc<dyn ImageTransform>,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let table = shard::concat_shard_tables(shard_files)?;
        let texts = table.caption_lists()?;
        let index = CaptionIndex::build(&texts);
        if index.is_empty() {
            return Err(DatasetError::EmptyCorpus);
        }
        Ok(Self {
            table,
            texts,
            index,
            transform,
            max_words,
        })
    }

    fn fetch(&self, flat: usize, rng: &mut SmallRng) -> Result<PretrainSample, FetchError> {
        let (row, k) = self
            .index
            .resolve(flat)
            .ok_or(FetchError::IndexRange { index: flat })?;
        let image = imaging::decode_bytes(self.table.image_bytes(row)?)?;
        let caption = text::normalize(&self.texts[row][k], self.max_words);
        Ok(PretrainSample {
            view: self.transform.apply(&image, rng),
            view_aug: self.transform.apply(&image, rng),
            caption,
        })
    }
}

impl Dataset for PretrainShardDataset {
    type Sample = PretrainSample;

    fn len(&self) -> usize {
        self.index.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let mut current = index;
        let mut draws = 0;
        loop {
            match self.fetch(current, rng) {
                Ok(sample) => return Ok(sample),
                Err(err) if draws < MAX_RESAMPLE_DRAWS => {
                    draws += 1;
                    let replacement = rng.random_range(0..self.index.len());
                    debug!(
                        index = current,
                        replacement,
                        error = %err,
                        "fetch failed, resampling"
                    );
                    current = replacement;
                }
                Err(err) => {
                    return Err(FetchError::RetriesExhausted {
                        attempts: draws,
                        last: Box::new(err),
                    })
                }
            }
        }
    }
}
