//! Error taxonomy for the dataset layer.
//!
//! Construction failures (`DatasetError`) are fatal: a dataset is either
//! fully built or not built at all, never partial. Fetch failures
//! (`FetchError`) surface per sample; the shard-backed pretrain dataset is
//! the only caller that recovers from them (by resampling, see
//! `dataset::pretrain`), everywhere else they propagate to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors raised while building a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read annotation file {path}: {source}")]
    AnnotationRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse annotation file {path}: {source}")]
    AnnotationParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to open shard table {path}: {source}")]
    TableOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read shard table {path}: {source}")]
    TableRead {
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("shard table {path} has no `{column}` column")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("unsupported `{column}` column type {datatype} in shard table {path}")]
    ColumnType {
        path: PathBuf,
        column: &'static str,
        datatype: String,
    },

    #[error("column `{column}` changes type across shard tables ({left} vs {right})")]
    SchemaMismatch {
        column: String,
        left: String,
        right: String,
    },

    #[error("failed to concatenate shard tables: {source}")]
    Concat {
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("no shard tables given")]
    EmptyTableList,

    #[error("shard corpus contains no captions")]
    EmptyCorpus,

    #[error("annotation {index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("test split requires an answer vocabulary file")]
    MissingAnswerList,
}

/// Per-sample errors raised by `get`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to decode image bytes: {0}")]
    Decode(#[from] image::ImageError),

    #[error("failed to read image {path}: {source}")]
    MissingImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("global index {index} is outside every registered shard range")]
    IndexRange { index: usize },

    #[error("shard row {row} is out of bounds for a table of {rows} rows")]
    RowOutOfBounds { row: usize, rows: usize },

    #[error("shard row {row} has a null `{column}` cell")]
    NullCell { row: usize, column: &'static str },

    #[error("annotation {index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("annotation {index} carries a {found} arrow_index where a {expected} was expected")]
    RowShape {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("unrecognized label `{label}` in annotation {index}")]
    UnknownLabel { index: usize, label: String },

    #[error("gave up after {attempts} resample draws; last failure: {last}")]
    RetriesExhausted { attempts: usize, last: Box<FetchError> },
}
