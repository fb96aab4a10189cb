//! Visual question answering, train and test splits.
//!
//! Training records come from two source corpora mixed in one annotation
//! list: VQA-style records carry one answer per human rater and get a
//! weighted answer distribution, Visual-Genome records carry a single
//! answer at a fixed weight. The `dataset` field names the source and, in
//! path mode, picks which image root the record resolves against.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use indexmap::IndexMap;
use rand::rngs::SmallRng;

use super::{Dataset, ImageSource};
use crate::annotation::{self, Annotation};
use crate::error::{DatasetError, FetchError};
use crate::imaging::{self, ImageTensor, ImageTransform};
use crate::text;

/// Marker appended to every answer so the decoder learns where to stop.
pub const DEFAULT_EOS: &str = "[SEP]";

/// Test questions keep more words than training ones.
const TEST_MAX_QUESTION_WORDS: usize = 50;

// ============================================================================
// Train split
// ============================================================================

#[derive(Debug, Clone)]
pub struct VqaTrainSample {
    pub image: ImageTensor,
    pub question: String,
    /// Distinct answers in first-seen order, eos marker appended.
    pub answers: Vec<String>,
    /// Per-answer weights, parallel to `answers`.
    pub weights: Vec<f32>,
}

pub struct VqaTrainDataset {
    records: Vec<Annotation>,
    source: ImageSource,
    vg_root: PathBuf,
    transform: Arc<dyn ImageTransform>,
    eos: String,
    max_words: usize,
}

impl VqaTrainDataset {
    pub fn open(
        ann_files: &[PathBuf],
        transform: Arc<dyn ImageTransform>,
        vqa_root: impl Into<PathBuf>,
        vg_root: impl Into<PathBuf>,
        eos: &str,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let corpus = annotation::load_corpus(ann_files)?;
        Ok(Self {
            records: corpus.records,
            source: ImageSource::new(corpus.registry, vqa_root.into()),
            vg_root: vg_root.into(),
            transform,
            eos: eos.to_string(),
            max_words,
        })
    }

    fn fetch_image(&self, index: usize, ann: &Annotation) -> Result<RgbImage, FetchError> {
        match &self.source {
            ImageSource::TableBacked { .. } => {
                self.source.decode_row(index, ann.require_row(index)?)
            }
            ImageSource::PathBacked { root } => {
                let root = match ann.require_dataset(index)? {
                    "vqa" => root,
                    "vg" => &self.vg_root,
                    other => {
                        return Err(FetchError::UnknownLabel {
                            index,
                            label: other.to_string(),
                        })
                    }
                };
                imaging::load_path(&root.join(ann.require_image(index)?))
            }
        }
    }

    /// Weighted answer distribution for one record.
    ///
    /// VQA records list one answer per rater; each distinct answer's weight
    /// is its share of the rater count, first-seen order preserved.
    /// Visual-Genome records carry one answer at weight 0.5.
    fn answer_distribution(
        &self,
        index: usize,
        ann: &Annotation,
    ) -> Result<(Vec<String>, Vec<f32>), FetchError> {
        match ann.require_dataset(index)? {
            "vqa" => {
                let raters = ann.require_answer(index)?.as_slice();
                let mut counts: IndexMap<&str, usize> = IndexMap::new();
                for answer in raters {
                    *counts.entry(answer.as_str()).or_insert(0) += 1;
                }
                let total = raters.len() as f32;
                let answers = counts
                    .keys()
                    .map(|answer| format!("{answer}{}", self.eos))
                    .collect();
                let weights = counts.values().map(|&n| n as f32 / total).collect();
                Ok((answers, weights))
            }
            "vg" => {
                let answer =
                    ann.require_answer(index)?
                        .primary()
                        .ok_or(FetchError::MissingField {
                            index,
                            field: "answer",
                        })?;
                Ok((vec![format!("{answer}{}", self.eos)], vec![0.5]))
            }
            other => Err(FetchError::UnknownLabel {
                index,
                label: other.to_string(),
            }),
        }
    }
}

impl Dataset for VqaTrainDataset {
    type Sample = VqaTrainSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let image = self.fetch_image(index, ann)?;
        let question = text::normalize(ann.require_question(index)?, self.max_words);
        let (answers, weights) = self.answer_distribution(index, ann)?;
        Ok(VqaTrainSample {
            image: self.transform.apply(&image, rng),
            question,
            answers,
            weights,
        })
    }
}

// ============================================================================
// Test split
// ============================================================================

#[derive(Debug, Clone)]
pub struct VqaTestSample {
    pub image: ImageTensor,
    pub question: String,
    pub question_id: i64,
}

/// Test split: raw questions against a fixed answer vocabulary, loaded once
/// from a JSON string array.
pub struct VqaTestDataset {
    records: Vec<Annotation>,
    source: ImageSource,
    transform: Arc<dyn ImageTransform>,
    answer_list: Vec<String>,
}

impl std::fmt::Debug for VqaTestDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VqaTestDataset").finish_non_exhaustive()
    }
}

impl VqaTestDataset {
    pub fn open(
        ann_file: &Path,
        transform: Arc<dyn ImageTransform>,
        vqa_root: impl Into<PathBuf>,
        answer_list: Option<&Path>,
    ) -> Result<Self, DatasetError> {
        let vocab_path = answer_list.ok_or(DatasetError::MissingAnswerList)?;
        let bytes = fs::read(vocab_path).map_err(|source| DatasetError::AnnotationRead {
            path: vocab_path.to_path_buf(),
            source,
        })?;
        let answer_list =
            serde_json::from_slice(&bytes).map_err(|source| DatasetError::AnnotationParse {
                path: vocab_path.to_path_buf(),
                source,
            })?;
        let corpus = annotation::load_single(ann_file)?;
        Ok(Self {
            records: corpus.records,
            source: ImageSource::new(corpus.registry, vqa_root.into()),
            transform,
            answer_list,
        })
    }

    /// Candidate answers scored against every question.
    pub fn answer_list(&self) -> &[String] {
        &self.answer_list
    }

    fn fetch_image(&self, index: usize, ann: &Annotation) -> Result<RgbImage, FetchError> {
        match &self.source {
            ImageSource::TableBacked { .. } => {
                self.source.decode_row(index, ann.require_row(index)?)
            }
            ImageSource::PathBacked { root } => {
                imaging::load_path(&root.join(ann.require_image(index)?))
            }
        }
    }
}

impl Dataset for VqaTestDataset {
    type Sample = VqaTestSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let image = self.fetch_image(index, ann)?;
        let question = text::normalize(ann.require_question(index)?, TEST_MAX_QUESTION_WORDS);
        let question_id = ann.question_id.ok_or(FetchError::MissingField {
            index,
            field: "question_id",
        })?;
        Ok(VqaTestSample {
            image: self.transform.apply(&image, rng),
            question,
            question_id,
        })
    }
}
