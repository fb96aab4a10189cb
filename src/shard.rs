//! Shard tables and the global-index registry.
//!
//! A shard table is an Arrow IPC file bundling raw encoded image bytes with
//! captions, one image per row:
//!
//! ```text
//! row   image (Binary)        caption (List<Utf8> or Utf8)
//! 0     <jpeg bytes>          ["a dog on grass", "dog running"]
//! 1     <jpeg bytes>          ["two birds"]
//! ...
//! ```
//!
//! Tables are memory-mapped and decoded into immutable column views once at
//! load; every structure here is read-only afterwards and safe to share
//! across worker threads. The registry stitches the tables of several
//! annotation files into one global index space; the caption index flattens
//! a one-image-to-many-captions table into a flat sample sequence.

use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BinaryArray, LargeBinaryArray, LargeListArray,
    LargeStringArray, ListArray, StringArray,
};
use arrow::compute::concat_batches;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;
use memmap2::Mmap;
use tracing::debug;

use crate::error::{DatasetError, FetchError};

// ============================================================================
// Column views
// ============================================================================

/// The `image` column, downcast once at load.
#[derive(Debug, Clone)]
enum ImageColumn {
    Binary(BinaryArray),
    LargeBinary(LargeBinaryArray),
}

impl ImageColumn {
    fn from_array(array: &ArrayRef) -> Option<Self> {
        if let Some(a) = array.as_any().downcast_ref::<BinaryArray>() {
            Some(Self::Binary(a.clone()))
        } else if let Some(a) = array.as_any().downcast_ref::<LargeBinaryArray>() {
            Some(Self::LargeBinary(a.clone()))
        } else {
            None
        }
    }

    fn is_null(&self, row: usize) -> bool {
        match self {
            Self::Binary(a) => a.is_null(row),
            Self::LargeBinary(a) => a.is_null(row),
        }
    }

    fn value(&self, row: usize) -> &[u8] {
        match self {
            Self::Binary(a) => a.value(row),
            Self::LargeBinary(a) => a.value(row),
        }
    }
}

/// The `caption` column. `Missing` covers tables that never stored captions
/// (only the shard-backed pretrain corpus reads them).
#[derive(Debug, Clone)]
enum CaptionColumn {
    Utf8(StringArray),
    LargeUtf8(LargeStringArray),
    List(ListArray),
    LargeList(LargeListArray),
    Missing,
}

impl CaptionColumn {
    fn from_array(array: &ArrayRef) -> Option<Self> {
        if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
            Some(Self::Utf8(a.clone()))
        } else if let Some(a) = array.as_any().downcast_ref::<LargeStringArray>() {
            Some(Self::LargeUtf8(a.clone()))
        } else if let Some(a) = array.as_any().downcast_ref::<ListArray>() {
            Some(Self::List(a.clone()))
        } else if let Some(a) = array.as_any().downcast_ref::<LargeListArray>() {
            Some(Self::LargeList(a.clone()))
        } else {
            None
        }
    }
}

// ============================================================================
// Shard table
// ============================================================================

/// One loaded shard: the concatenated record batches of an IPC file with
/// the `image` and `caption` columns pre-downcast.
#[derive(Debug)]
pub struct ShardTable {
    path: PathBuf,
    rows: usize,
    images: ImageColumn,
    captions: CaptionColumn,
}

impl ShardTable {
    /// Memory-map and read a shard file.
    pub fn open(path: &Path) -> Result<Self, DatasetError> {
        let (schema, batches) = read_ipc_file(path)?;
        let batch = concat_batches(&schema, &batches).map_err(|source| {
            DatasetError::TableRead {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let table = Self::from_batch(path, batch)?;
        debug!(path = %path.display(), rows = table.rows, "opened shard table");
        Ok(table)
    }

    fn from_batch(path: &Path, batch: RecordBatch) -> Result<Self, DatasetError> {
        let images = match batch.column_by_name("image") {
            Some(col) => {
                ImageColumn::from_array(col).ok_or_else(|| DatasetError::ColumnType {
                    path: path.to_path_buf(),
                    column: "image",
                    datatype: col.data_type().to_string(),
                })?
            }
            None => {
                return Err(DatasetError::MissingColumn {
                    path: path.to_path_buf(),
                    column: "image",
                })
            }
        };
        let captions = match batch.column_by_name("caption") {
            Some(col) => {
                CaptionColumn::from_array(col).ok_or_else(|| DatasetError::ColumnType {
                    path: path.to_path_buf(),
                    column: "caption",
                    datatype: col.data_type().to_string(),
                })?
            }
            None => CaptionColumn::Missing,
        };
        Ok(Self {
            path: path.to_path_buf(),
            rows: batch.num_rows(),
            images,
            captions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Raw encoded bytes of one row's image cell.
    pub fn image_bytes(&self, row: usize) -> Result<&[u8], FetchError> {
        if row >= self.rows {
            return Err(FetchError::RowOutOfBounds {
                row,
                rows: self.rows,
            });
        }
        if self.images.is_null(row) {
            return Err(FetchError::NullCell {
                row,
                column: "image",
            });
        }
        Ok(self.images.value(row))
    }

    /// Materialize every row's caption list. A plain string column yields
    /// one caption per row; null cells yield empty lists.
    pub fn caption_lists(&self) -> Result<Vec<Vec<String>>, DatasetError> {
        let mut lists = Vec::with_capacity(self.rows);
        match &self.captions {
            CaptionColumn::Utf8(a) => {
                for row in 0..self.rows {
                    if a.is_null(row) {
                        lists.push(Vec::new());
                    } else {
                        lists.push(vec![a.value(row).to_string()]);
                    }
                }
            }
            CaptionColumn::LargeUtf8(a) => {
                for row in 0..self.rows {
                    if a.is_null(row) {
                        lists.push(Vec::new());
                    } else {
                        lists.push(vec![a.value(row).to_string()]);
                    }
                }
            }
            CaptionColumn::List(a) => {
                for row in 0..self.rows {
                    if a.is_null(row) {
                        lists.push(Vec::new());
                    } else {
                        lists.push(self.string_values(&a.value(row))?);
                    }
                }
            }
            CaptionColumn::LargeList(a) => {
                for row in 0..self.rows {
                    if a.is_null(row) {
                        lists.push(Vec::new());
                    } else {
                        lists.push(self.string_values(&a.value(row))?);
                    }
                }
            }
            CaptionColumn::Missing => {
                return Err(DatasetError::MissingColumn {
                    path: self.path.clone(),
                    column: "caption",
                })
            }
        }
        Ok(lists)
    }

    fn string_values(&self, values: &ArrayRef) -> Result<Vec<String>, DatasetError> {
        let strings = values
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| DatasetError::ColumnType {
                path: self.path.clone(),
                column: "caption",
                datatype: values.data_type().to_string(),
            })?;
        Ok(strings
            .iter()
            .map(|s| s.unwrap_or_default().to_string())
            .collect())
    }
}

/// Read all record batches of an IPC file through a read-only memory map.
fn read_ipc_file(path: &Path) -> Result<(SchemaRef, Vec<RecordBatch>), DatasetError> {
    let table_read = |source| DatasetError::TableRead {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(|source| DatasetError::TableOpen {
        path: path.to_path_buf(),
        source,
    })?;
    // SAFETY: shard files are written once and never modified while the
    // process runs; the mapping is only ever read.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|source| DatasetError::TableOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = FileReader::try_new(Cursor::new(&mmap[..]), None).map_err(table_read)?;
    let schema = reader.schema();
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(table_read)?);
    }
    Ok((schema, batches))
}

/// Concatenate shard files into one table with schema promotion: a column
/// absent from a file is filled with nulls for that file's rows. A column
/// changing type across files is an error.
pub fn concat_shard_tables(paths: &[PathBuf]) -> Result<ShardTable, DatasetError> {
    if paths.is_empty() {
        return Err(DatasetError::EmptyTableList);
    }

    let mut per_file = Vec::with_capacity(paths.len());
    for path in paths {
        per_file.push(read_ipc_file(path)?);
    }

    // Union schema in first-seen column order, everything nullable so the
    // padding columns are representable.
    let mut union: IndexMap<String, Field> = IndexMap::new();
    for (schema, _) in &per_file {
        for field in schema.fields() {
            match union.get(field.name()) {
                None => {
                    union.insert(
                        field.name().clone(),
                        Field::new(field.name(), field.data_type().clone(), true),
                    );
                }
                Some(existing) if existing.data_type() != field.data_type() => {
                    return Err(DatasetError::SchemaMismatch {
                        column: field.name().clone(),
                        left: existing.data_type().to_string(),
                        right: field.data_type().to_string(),
                    });
                }
                Some(_) => {}
            }
        }
    }
    let union_schema = Arc::new(Schema::new(union.values().cloned().collect::<Vec<_>>()));

    let mut padded = Vec::new();
    for (_, batches) in &per_file {
        for batch in batches {
            let columns: Vec<ArrayRef> = union_schema
                .fields()
                .iter()
                .map(|field| {
                    batch
                        .column_by_name(field.name())
                        .cloned()
                        .unwrap_or_else(|| new_null_array(field.data_type(), batch.num_rows()))
                })
                .collect();
            padded.push(
                RecordBatch::try_new(union_schema.clone(), columns)
                    .map_err(|source| DatasetError::Concat { source })?,
            );
        }
    }

    let combined = concat_batches(&union_schema, &padded)
        .map_err(|source| DatasetError::Concat { source })?;
    ShardTable::from_batch(&paths[0], combined)
}

// ============================================================================
// Registry
// ============================================================================

/// Maps half-open global-index ranges to the shard table whose rows back
/// them. Ranges are registered in file order during corpus loading and
/// never change afterwards.
#[derive(Debug, Default)]
pub struct ShardRegistry {
    starts: Vec<usize>,
    ends: Vec<usize>,
    tables: Vec<ShardTable>,
}

impl ShardRegistry {
    /// Register `[start, start + len)` as backed by `table`.
    pub fn register(&mut self, start: usize, len: usize, table: ShardTable) {
        debug_assert!(self.ends.last().map_or(true, |&end| start >= end));
        self.starts.push(start);
        self.ends.push(start + len);
        self.tables.push(table);
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn num_ranges(&self) -> usize {
        self.tables.len()
    }

    /// Resolve a global sample index to its backing table.
    ///
    /// Binary search over the sorted range starts, O(log T) in the number
    /// of tables.
    pub fn resolve(&self, index: usize) -> Result<&ShardTable, FetchError> {
        // starts is sorted; partition_point finds the first start > index,
        // so the candidate range is the one before it.
        let pos = self.starts.partition_point(|&start| start <= index);
        if pos == 0 || index >= self.ends[pos - 1] {
            return Err(FetchError::IndexRange { index });
        }
        Ok(&self.tables[pos - 1])
    }

    /// Registered `(start, end)` ranges in file order.
    pub fn ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.starts
            .iter()
            .zip(self.ends.iter())
            .map(|(&start, &end)| (start, end))
    }

    pub fn tables(&self) -> impl Iterator<Item = &ShardTable> {
        self.tables.iter()
    }
}

// ============================================================================
// Caption index
// ============================================================================

/// Flat enumeration of every (row, caption) pair in caption-list order, so
/// a one-image-to-many-captions table reads as a flat sample sequence.
#[derive(Debug, Default)]
pub struct CaptionIndex {
    pairs: Vec<(u32, u32)>,
}

impl CaptionIndex {
    pub fn build(caption_lists: &[Vec<String>]) -> Self {
        let total = caption_lists.iter().map(Vec::len).sum();
        let mut pairs = Vec::with_capacity(total);
        for (row, captions) in caption_lists.iter().enumerate() {
            for k in 0..captions.len() {
                pairs.push((row as u32, k as u32));
            }
        }
        Self { pairs }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Map a flat sample index to (table_row, caption_within_row).
    pub fn resolve(&self, flat: usize) -> Option<(usize, usize)> {
        self.pairs
            .get(flat)
            .map(|&(row, k)| (row as usize, k as usize))
    }
}

// ============================================================================
// Test fixtures
// ============================================================================
