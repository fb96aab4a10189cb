//! Annotation records and corpus loading.
//!
//! An annotation file is a JSON array of task-shaped records. Field
//! presence varies by task (captions for retrieval, question/answer for
//! VQA, sentence pairs for NLVR), so the record type keeps everything
//! optional and datasets demand what they need through the `require_*`
//! accessors. Loading a corpus also opens the paired shard table of every
//! shard-backed file and registers its global index range.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rand::prelude::*;
use rand::rngs::SmallRng;
use serde::Deserialize;
use tracing::info;

use crate::error::{DatasetError, FetchError};
use crate::shard::{ShardRegistry, ShardTable};

/// Annotation files whose name contains this substring store their images
/// in a paired shard table.
pub const SHARD_MARKER: &str = "arrow";

// ============================================================================
// Record fields
// ============================================================================

/// A caption or answer field that may be a single string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TextField {
    One(String),
    Many(Vec<String>),
}

impl TextField {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(s) => std::slice::from_ref(s),
            Self::Many(v) => v.as_slice(),
        }
    }

    /// The value itself, or the head of a list.
    pub fn primary(&self) -> Option<&str> {
        self.as_slice().first().map(String::as_str)
    }

    /// Uniform random entry for list fields; the value itself otherwise.
    pub fn pick<'a>(&'a self, rng: &mut SmallRng) -> Option<&'a str> {
        let entries = self.as_slice();
        if entries.is_empty() {
            return None;
        }
        Some(entries[rng.random_range(0..entries.len())].as_str())
    }
}

/// Row reference into a shard table: one row, or the row pair NLVR uses.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum RowRef {
    Row(u64),
    Pair([u64; 2]),
}

/// Natural image key: numeric or string identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum ImageKey {
    Id(i64),
    Name(String),
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// One record from an annotation file.
///
/// Accessors return a fetch error naming the missing field instead of
/// panicking, so a malformed record surfaces with its global index.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Annotation {
    pub image: Option<String>,
    pub images: Option<Vec<String>>,
    pub caption: Option<TextField>,
    pub text: Option<String>,
    pub sentence: Option<String>,
    pub question: Option<String>,
    pub answer: Option<TextField>,
    pub label: Option<String>,
    pub dataset: Option<String>,
    pub arrow_index: Option<RowRef>,
    pub image_id: Option<ImageKey>,
    pub ref_id: Option<i64>,
    pub question_id: Option<i64>,
}

impl Annotation {
    pub fn require_image(&self, index: usize) -> Result<&str, FetchError> {
        self.image.as_deref().ok_or(FetchError::MissingField {
            index,
            field: "image",
        })
    }

    /// The NLVR image pair.
    pub fn require_images(&self, index: usize) -> Result<&[String], FetchError> {
        match self.images.as_deref() {
            Some(paths) if paths.len() >= 2 => Ok(paths),
            _ => Err(FetchError::MissingField {
                index,
                field: "images",
            }),
        }
    }

    pub fn require_caption(&self, index: usize) -> Result<&TextField, FetchError> {
        self.caption.as_ref().ok_or(FetchError::MissingField {
            index,
            field: "caption",
        })
    }

    pub fn require_text(&self, index: usize) -> Result<&str, FetchError> {
        self.text.as_deref().ok_or(FetchError::MissingField {
            index,
            field: "text",
        })
    }

    pub fn require_sentence(&self, index: usize) -> Result<&str, FetchError> {
        self.sentence.as_deref().ok_or(FetchError::MissingField {
            index,
            field: "sentence",
        })
    }

    pub fn require_question(&self, index: usize) -> Result<&str, FetchError> {
        self.question.as_deref().ok_or(FetchError::MissingField {
            index,
            field: "question",
        })
    }

    pub fn require_answer(&self, index: usize) -> Result<&TextField, FetchError> {
        self.answer.as_ref().ok_or(FetchError::MissingField {
            index,
            field: "answer",
        })
    }

    pub fn require_label(&self, index: usize) -> Result<&str, FetchError> {
        self.label.as_deref().ok_or(FetchError::MissingField {
            index,
            field: "label",
        })
    }

    pub fn require_dataset(&self, index: usize) -> Result<&str, FetchError> {
        self.dataset.as_deref().ok_or(FetchError::MissingField {
            index,
            field: "dataset",
        })
    }

    pub fn require_row(&self, index: usize) -> Result<usize, FetchError> {
        match self.arrow_index {
            Some(RowRef::Row(row)) => Ok(row as usize),
            Some(RowRef::Pair(_)) => Err(FetchError::RowShape {
                index,
                expected: "single row",
                found: "row pair",
            }),
            None => Err(FetchError::MissingField {
                index,
                field: "arrow_index",
            }),
        }
    }

    pub fn require_row_pair(&self, index: usize) -> Result<[usize; 2], FetchError> {
        match self.arrow_index {
            Some(RowRef::Pair([a, b])) => Ok([a as usize, b as usize]),
            Some(RowRef::Row(_)) => Err(FetchError::RowShape {
                index,
                expected: "row pair",
                found: "single row",
            }),
            None => Err(FetchError::MissingField {
                index,
                field: "arrow_index",
            }),
        }
    }

    /// Path component of `image` after the last slash.
    pub fn image_file_name(&self) -> Option<&str> {
        self.image
            .as_deref()
            .map(|p| p.rsplit('/').next().unwrap_or(p))
    }
}

// ============================================================================
// Corpus loading
// ============================================================================

/// Records from one or more annotation files plus the shard ranges
/// registered for the files that carry paired tables.
#[derive(Debug)]
pub struct Corpus {
    pub records: Vec<Annotation>,
    pub registry: ShardRegistry,
}

/// True when the file name carries the shard marker.
pub fn is_shard_backed(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().contains(SHARD_MARKER))
        .unwrap_or(false)
}

/// The table paired with a shard-backed annotation file: the same path
/// minus the `.json` suffix.
pub fn paired_table_path(ann_path: &Path) -> PathBuf {
    let raw = ann_path.to_string_lossy();
    match raw.strip_suffix(".json") {
        Some(stem) => PathBuf::from(stem),
        None => ann_path.to_path_buf(),
    }
}

/// Parse one annotation file.
pub fn read_annotation_file(path: &Path) -> Result<Vec<Annotation>, DatasetError> {
    let bytes = fs::read(path).map_err(|source| DatasetError::AnnotationRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| DatasetError::AnnotationParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load annotation files in order, opening the paired shard table of every
/// shard-backed file and registering its global index range
/// `[prior_total, prior_total + file_len)`.
pub fn load_corpus(paths: &[PathBuf]) -> Result<Corpus, DatasetError> {
    let mut records: Vec<Annotation> = Vec::new();
    let mut registry = ShardRegistry::default();
    for path in paths {
        let file_records = read_annotation_file(path)?;
        if is_shard_backed(path) {
            let table = ShardTable::open(&paired_table_path(path))?;
            registry.register(records.len(), file_records.len(), table);
        }
        records.extend(file_records);
    }
    info!(
        records = records.len(),
        shard_ranges = registry.num_ranges(),
        "loaded annotation corpus"
    );
    Ok(Corpus { records, registry })
}

/// Single-file convenience used by the eval-style datasets.
pub fn load_single(path: &Path) -> Result<Corpus, DatasetError> {
    load_corpus(&[path.to_path_buf()])
}

// ============================================================================
// Image-id map
// ============================================================================

/// Dense first-seen re-numbering of natural image keys.
#[derive(Debug, Default)]
pub struct ImageIdMap {
    ids: IndexMap<ImageKey, u32>,
}

impl ImageIdMap {
    pub fn from_keys(keys: impl IntoIterator<Item = ImageKey>) -> Self {
        let mut ids = IndexMap::new();
        for key in keys {
            let next = ids.len() as u32;
            ids.entry(key).or_insert(next);
        }
        Self { ids }
    }

    pub fn get(&self, key: &ImageKey) -> Option<u32> {
        self.ids.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
