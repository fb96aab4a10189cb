//! Image-text retrieval datasets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use rand::rngs::SmallRng;

use super::{Dataset, ImageSource};
use crate::annotation::{self, Annotation, ImageIdMap};
use crate::error::{DatasetError, FetchError};
use crate::imaging::{self, ImageTensor, ImageTransform};
use crate::text;

/// Training sample: two augmented views of one image, its caption, and the
/// dense image id its sibling captions share.
#[derive(Debug, Clone)]
pub struct RetrievalTrainSample {
    pub view: ImageTensor,
    pub view_aug: ImageTensor,
    pub caption: String,
    pub image_id: u32,
}

pub struct RetrievalTrainDataset {
    records: Vec<Annotation>,
    source: ImageSource,
    transform: Arc<dyn ImageTransform>,
    img_ids: ImageIdMap,
    max_words: usize,
}

impl std::fmt::Debug for RetrievalTrainDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalTrainDataset").finish_non_exhaustive()
    }
}

impl RetrievalTrainDataset {
    pub fn open(
        ann_files: &[PathBuf],
        transform: Arc<dyn ImageTransform>,
        image_root: impl Into<PathBuf>,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let corpus = annotation::load_corpus(ann_files)?;
        let mut keys = Vec::with_capacity(corpus.records.len());
        for (index, ann) in corpus.records.iter().enumerate() {
            let key = ann.image_id.clone().ok_or(DatasetError::MissingField {
                index,
                field: "image_id",
            })?;
            keys.push(key);
        }
        Ok(Self {
            records: corpus.records,
            source: ImageSource::new(corpus.registry, image_root.into()),
            transform,
            img_ids: ImageIdMap::from_keys(keys),
            max_words,
        })
    }

    /// Number of distinct images across the caption records.
    pub fn num_images(&self) -> usize {
        self.img_ids.len()
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

impl Dataset for RetrievalTrainDataset {
    type Sample = RetrievalTrainSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let image = self.fetch_image(index, ann)?;
        // decoded once, transformed twice for the contrastive pair
        let view = self.transform.apply(&image, rng);
        let view_aug = self.transform.apply(&image, rng);

        let raw = ann
            .require_caption(index)?
            .primary()
            .ok_or(FetchError::MissingField {
                index,
                field: "caption",
            })?;
        let caption = text::normalize(raw, self.max_words);

        let image_id = ann
            .image_id
            .as_ref()
            .and_then(|key| self.img_ids.get(key))
            .ok_or(FetchError::MissingField {
                index,
                field: "image_id",
            })?;

        Ok(RetrievalTrainSample {
            view,
            view_aug,
            caption,
            image_id,
        })
    }
}

/// Eval sample: one transformed image and its echoed record index.
#[derive(Debug, Clone)]
pub struct RetrievalEvalSample {
    pub image: ImageTensor,
    pub index: u32,
}

/// Eval-side retrieval dataset: images iterate by record index while the
/// flattened caption list and the two cross-reference maps support
/// all-pairs similarity scoring without duplicating captions per image.
pub struct RetrievalEvalDataset {
    records: Vec<Annotation>,
    source: ImageSource,
    transform: Arc<dyn ImageTransform>,
    texts: Vec<String>,
    image_to_texts: Vec<Vec<u32>>,
    text_to_image: Vec<u32>,
}

impl RetrievalEvalDataset {
    pub fn open(
        ann_file: &Path,
        transform: Arc<dyn ImageTransform>,
        image_root: impl Into<PathBuf>,
        max_words: usize,
    ) -> Result<Self, DatasetError> {
        let corpus = annotation::load_single(ann_file)?;
        let mut texts = Vec::new();
        let mut image_to_texts = Vec::with_capacity(corpus.records.len());
        let mut text_to_image = Vec::new();
        for (img_index, ann) in corpus.records.iter().enumerate() {
            let captions = ann
                .caption
                .as_ref()
                .ok_or(DatasetError::MissingField {
                    index: img_index,
                    field: "caption",
                })?
                .as_slice();
            let mut own = Vec::with_capacity(captions.len());
            for caption in captions {
                own.push(texts.len() as u32);
                text_to_image.push(img_index as u32);
                texts.push(text::normalize(caption, max_words));
            }
            image_to_texts.push(own);
        }
        Ok(Self {
            records: corpus.records,
            source: ImageSource::new(corpus.registry, image_root.into()),
            transform,
            texts,
            image_to_texts,
            text_to_image,
        })
    }

    /// Normalized captions in flat order.
    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    /// Text indices belonging to each image.
    pub fn image_to_texts(&self) -> &[Vec<u32>] {
        &self.image_to_texts
    }

    /// Source image of each text.
    pub fn text_to_image(&self) -> &[u32] {
        &self.text_to_image
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

impl Dataset for RetrievalEvalDataset {
    type Sample = RetrievalEvalSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let image = self.fetch_image(index, ann)?;
        Ok(RetrievalEvalSample {
            image: self.transform.apply(&image, rng),
            index: index as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use super::*;
    use crate::dataset::testutil::write_json;
    use crate::imaging::{tiny_png, ProbeTransform};
    use crate::shard::fixtures::write_shard;

    #[test]
    fn test_train_caption_stable_views_independent() {
        let dir = tempfile::tempdir().unwrap();
        let png = tiny_png(2, 2, [50, 60, 70]);
        write_shard(
            &dir.path().join("re.arrow"),
            &[(Some(png), vec!["dup".into()])],
        );
        let ann = dir.path().join("re.arrow.json");
        write_json(
            &ann,
            serde_json::json!([
                {"caption": "A Dog!", "arrow_index": 0, "image_id": 11}
            ]),
        );

        let ds = RetrievalTrainDataset::open(
            &[ann],
            Arc::new(ProbeTransform),
            dir.path(),
            text::DEFAULT_MAX_WORDS,
        )
        .unwrap();
        assert_eq!(ds.len(), 1);

        let mut rng = SmallRng::seed_from_u64(1);
        let first = ds.get(0, &mut rng).unwrap();
        let second = ds.get(0, &mut rng).unwrap();
        assert_eq!(first.caption, "a dog");
        assert_eq!(second.caption, "a dog");
        // two transform invocations per get, each consuming fresh randomness
        assert_ne!(first.view.data[0], first.view_aug.data[0]);
    }

    #[test]
    fn test_train_dense_image_ids() {
        let dir = tempfile::tempdir().unwrap();
        let png = tiny_png(1, 1, [0, 0, 0]);
        write_shard(
            &dir.path().join("re.arrow"),
            &[
                (Some(png.clone()), vec!["a".into()]),
                (Some(png.clone()), vec!["b".into()]),
                (Some(png), vec!["c".into()]),
            ],
        );
        let ann = dir.path().join("re.arrow.json");
        write_json(
            &ann,
            serde_json::json!([
                {"caption": "first of pair", "arrow_index": 0, "image_id": 500},
                {"caption": "second of pair", "arrow_index": 1, "image_id": 500},
                {"caption": "solo", "arrow_index": 2, "image_id": 731}
            ]),
        );

        let ds = RetrievalTrainDataset::open(&[ann], Arc::new(ProbeTransform), "", 30).unwrap();
        assert_eq!(ds.num_images(), 2);

        let mut rng = SmallRng::seed_from_u64(0);
        let ids: Vec<u32> = (0..3)
            .map(|i| ds.get(i, &mut rng).unwrap().image_id)
            .collect();
        assert_eq!(ids, vec![0, 0, 1]);
    }

    #[test]
    fn test_train_missing_image_id_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let ann = dir.path().join("plain.json");
        write_json(&ann, serde_json::json!([{"image": "x.jpg", "caption": "c"}]));
        let err =
            RetrievalTrainDataset::open(&[ann], Arc::new(ProbeTransform), "", 30).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::MissingField { field: "image_id", .. }
        ));
    }

    #[test]
    fn test_train_path_backed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("imgs")).unwrap();
        std::fs::write(
            dir.path().join("imgs/cat.png"),
            tiny_png(3, 3, [200, 10, 10]),
        )
        .unwrap();
        let ann = dir.path().join("plain.json");
        write_json(
            &ann,
            serde_json::json!([
                {"image": "imgs/cat.png", "caption": "a red cat", "image_id": 1}
            ]),
        );

        let ds = RetrievalTrainDataset::open(&[ann], Arc::new(ProbeTransform), dir.path(), 30)
            .unwrap();
        let mut rng = SmallRng::seed_from_u64(9);
        let sample = ds.get(0, &mut rng).unwrap();
        assert_eq!(sample.caption, "a red cat");
        assert_eq!(sample.image_id, 0);
    }

    #[test]
    fn test_eval_cross_reference_maps() {
        let dir = tempfile::tempdir().unwrap();
        let png = tiny_png(1, 1, [9, 9, 9]);
        write_shard(
            &dir.path().join("val.arrow"),
            &[
                (Some(png.clone()), vec![]),
                (Some(png), vec![]),
            ],
        );
        let ann = dir.path().join("val.arrow.json");
        write_json(
            &ann,
            serde_json::json!([
                {"caption": ["Blue sky.", "The SKY"], "arrow_index": 0},
                {"caption": ["a field"], "arrow_index": 1}
            ]),
        );

        let ds =
            RetrievalEvalDataset::open(&ann, Arc::new(ProbeTransform), "", 30).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.texts(), &["blue sky", "the sky", "a field"]);
        assert_eq!(ds.image_to_texts(), &[vec![0, 1], vec![2]]);
        assert_eq!(ds.text_to_image(), &[0, 0, 1]);

        let mut rng = SmallRng::seed_from_u64(4);
        assert_eq!(ds.get(1, &mut rng).unwrap().index, 1);
    }
}
