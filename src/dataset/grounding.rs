//! Referring-expression grounding dataset.

use std::path::PathBuf;
use std::sync::Arc;

use image::RgbImage;
use rand::rngs::SmallRng;

use super::{Dataset, ImageSource};
use crate::annotation::{self, Annotation, ImageIdMap, ImageKey};
use crate::error::{DatasetError, FetchError};
use crate::imaging::{self, ImageTensor, ImageTransform};
use crate::text;

/// One grounding sample. In train mode `target` is the dense image id keyed
/// on the image file name; in eval mode it is the record's reference id.
#[derive(Debug, Clone)]
pub struct GroundingSample {
    pub image: ImageTensor,
    pub text: String,
    pub target: i64,
}

enum TargetSource {
    DenseImageIds(ImageIdMap),
    RefIds,
}

pub struct GroundingDataset {
    records: Vec<Annotation>,
    source: ImageSource,
    transform: Arc<dyn ImageTransform>,
    targets: TargetSource,
    max_words: usize,
}

impl std::fmt::Debug for GroundingDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroundingDataset").finish_non_exhaustive()
    }
}

impl GroundingDataset {
    /// Train-mode corpus: image ids are re-numbered densely by the file-name
    /// component of each record's image path, so records pointing at the
    /// same file share a target.
    pub fn open_train(
        ann_files: &[PathBuf],
        transform: Arc<dyn ImageTransform>,
        image_root: impl Into<PathBuf>,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let corpus = annotation::load_corpus(ann_files)?;
        let mut keys = Vec::with_capacity(corpus.records.len());
        for (index, ann) in corpus.records.iter().enumerate() {
            let name = ann.image_file_name().ok_or(DatasetError::MissingField {
                index,
                field: "image",
            })?;
            keys.push(ImageKey::Name(name.to_string()));
        }
        Ok(Self {
            records: corpus.records,
            source: ImageSource::new(corpus.registry, image_root.into()),
            transform,
            targets: TargetSource::DenseImageIds(ImageIdMap::from_keys(keys)),
            max_words,
        })
    }

    /// Eval-mode corpus: targets are the records' `ref_id` values.
    pub fn open_eval(
        ann_files: &[PathBuf],
        transform: Arc<dyn ImageTransform>,
        image_root: impl Into<PathBuf>,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let corpus = annotation::load_corpus(ann_files)?;
        Ok(Self {
            records: corpus.records,
            source: ImageSource::new(corpus.registry, image_root.into()),
            transform,
            targets: TargetSource::RefIds,
            max_words,
        })
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

impl Dataset for GroundingDataset {
    type Sample = GroundingSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let image = self.fetch_image(index, ann)?;
        let text = text::normalize(ann.require_text(index)?, self.max_words);
        let target = match &self.targets {
            TargetSource::DenseImageIds(map) => {
                let name = ann.image_file_name().ok_or(FetchError::MissingField {
                    index,
                    field: "image",
                })?;
                i64::from(map.get(&ImageKey::Name(name.to_string())).ok_or(
                    FetchError::MissingField {
                        index,
                        field: "image",
                    },
                )?)
            }
            TargetSource::RefIds => ann.ref_id.ok_or(FetchError::MissingField {
                index,
                field: "ref_id",
            })?,
        };
        Ok(GroundingSample {
            image: self.transform.apply(&image, rng),
            text,
            target,
        })
    }
}
