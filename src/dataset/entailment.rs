//! Visual entailment dataset: does the image support the sentence?

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use rand::rngs::SmallRng;

use super::{Dataset, ImageSource};
use crate::annotation::{self, Annotation};
use crate::error::{DatasetError, FetchError};
use crate::imaging::{self, ImageTensor, ImageTransform};
use crate::text;

/// 3-way verdict code: contradiction 0, neutral 1, entailment 2.
fn label_code(label: &str) -> Option<u8> {
    match label {
        "entailment" => Some(2),
        "neutral" => Some(1),
        "contradiction" => Some(0),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EntailmentSample {
    pub image: ImageTensor,
    pub sentence: String,
    pub label: u8,
}

pub struct EntailmentDataset {
    records: Vec<Annotation>,
    source: ImageSource,
    transform: Arc<dyn ImageTransform>,
    max_words: usize,
}

impl EntailmentDataset {
    pub fn open(
        ann_file: &Path,
        transform: Arc<dyn ImageTransform>,
        image_root: impl Into<PathBuf>,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let corpus = annotation::load_single(ann_file)?;
        Ok(Self {
            records: corpus.records,
            source: ImageSource::new(corpus.registry, image_root.into()),
            transform,
            max_words,
        })
    }

    fn fetch_image(&self, index: usize, ann: &Annotation) -> Result<RgbImage, FetchError> {
        match &self.source {
            ImageSource::TableBacked { .. } => {
                self.source.decode_row(index, ann.require_row(index)?)
            }
            ImageSource::PathBacked { root } => {
                // records name the image by bare id, the files carry .jpg
                let file = format!("{}.jpg", ann.require_image(index)?);
                imaging::load_path(&root.join(file))
            }
        }
    }
}

impl Dataset for EntailmentDataset {
    type Sample = EntailmentSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let image = self.fetch_image(index, ann)?;
        let sentence = text::normalize(ann.require_sentence(index)?, self.max_words);
        let raw_label = ann.require_label(index)?;
        let label = label_code(raw_label).ok_or_else(|| FetchError::UnknownLabel {
            index,
            label: raw_label.to_string(),
        })?;
        Ok(EntailmentSample {
            image: self.transform.apply(&image, rng),
            sentence,
            label,
        })
    }
}
