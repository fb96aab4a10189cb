//! Natural-language visual-reasoning dataset: one sentence about a pair of
//! images, judged true or false.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use rand::rngs::SmallRng;

use super::{Dataset, ImageSource};
use crate::annotation::{self, Annotation};
use crate::error::{DatasetError, FetchError};
use crate::imaging::{self, ImageTensor, ImageTransform};
use crate::text;

#[derive(Debug, Clone)]
pub struct NlvrSample {
    pub left: ImageTensor,
    pub right: ImageTensor,
    pub sentence: String,
    pub label: u8,
}

pub struct NlvrDataset {
    records: Vec<Annotation>,
    source: ImageSource,
    transform: Arc<dyn ImageTransform>,
    max_words: usize,
}

impl NlvrDataset {
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

    fn fetch_pair(
        &self,
        index: usize,
        ann: &Annotation,
    ) -> Result<(RgbImage, RgbImage), FetchError> {
        match &self.source {
            ImageSource::TableBacked { .. } => {
                let [first, second] = ann.require_row_pair(index)?;
                Ok((
                    self.source.decode_row(index, first)?,
                    self.source.decode_row(index, second)?,
                ))
            }
            ImageSource::PathBacked { root } => {
                let paths = ann.require_images(index)?;
                Ok((
                    imaging::load_path(&root.join(&paths[0]))?,
                    imaging::load_path(&root.join(&paths[1]))?,
                ))
            }
        }
    }
}

impl Dataset for NlvrDataset {
    type Sample = NlvrSample;

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize, rng: &mut SmallRng) -> Result<Self::Sample, FetchError> {
        let ann = &self.records[index];
        let (left, right) = self.fetch_pair(index, ann)?;
        let sentence = text::normalize(ann.require_sentence(index)?, self.max_words);
        // anything but the exact string "True" counts as false
        let label = u8::from(ann.require_label(index)? == "True");
        Ok(NlvrSample {
            left: self.transform.apply(&left, rng),
            right: self.transform.apply(&right, rng),
            sentence,
            label,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use super::*;
    use crate::dataset::testutil::write_json;
    use crate::imaging::{tiny_png, EvalResize, ProbeTransform};
    use crate::shard::fixtures::write_shard;

    #[test]
    fn test_label_mapping() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.png"), tiny_png(1, 1, [1, 1, 1])).unwrap();
        let ann = dir.path().join("nlvr.json");
        let record = |label: &str| {
            serde_json::json!({
                "images": ["x.png", "x.png"],
                "sentence": "both squares are dark",
                "label": label
            })
        };
        write_json(
            &ann,
            serde_json::Value::Array(vec![
                record("True"),
                record("False"),
                record("true"),
                record("banana"),
            ]),
        );

        let ds = NlvrDataset::open(&ann, Arc::new(ProbeTransform), dir.path(), 30).unwrap();
        let mut rng = SmallRng::seed_from_u64(0);
        let labels: Vec<u8> = (0..4)
            .map(|i| ds.get(i, &mut rng).unwrap().label)
            .collect();
        assert_eq!(labels, vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_row_pair_from_table() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(
            &dir.path().join("nlvr.arrow"),
            &[
                (Some(tiny_png(1, 1, [255, 0, 0])), vec![]),
                (Some(tiny_png(1, 1, [0, 255, 0])), vec![]),
                (Some(tiny_png(1, 1, [0, 0, 255])), vec![]),
            ],
        );
        let ann = dir.path().join("nlvr.arrow.json");
        write_json(
            &ann,
            serde_json::json!([
                {"arrow_index": [0, 2], "sentence": "red then blue", "label": "True"},
                {"arrow_index": [2, 0], "sentence": "blue then red", "label": "True"}
            ]),
        );

        let ds = NlvrDataset::open(&ann, Arc::new(EvalResize::new(1)), "", 30).unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let forward = ds.get(0, &mut rng).unwrap();
        let reversed = ds.get(1, &mut rng).unwrap();
        assert_ne!(forward.left.data, forward.right.data);
        assert_eq!(forward.left.data, reversed.right.data);
        assert_eq!(forward.right.data, reversed.left.data);
    }

    #[test]
    fn test_single_row_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(
            &dir.path().join("nlvr.arrow"),
            &[(Some(tiny_png(1, 1, [0, 0, 0])), vec![])],
        );
        let ann = dir.path().join("nlvr.arrow.json");
        write_json(
            &ann,
            serde_json::json!([
                {"arrow_index": 0, "sentence": "s", "label": "False"}
            ]),
        );

        let ds = NlvrDataset::open(&ann, Arc::new(ProbeTransform), "", 30).unwrap();
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(matches!(
            ds.get(0, &mut rng).unwrap_err(),
            FetchError::RowShape { .. }
        ));
    }
}
