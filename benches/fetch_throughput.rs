//! Sample-fetch throughput benchmarks.
//!
//! Benchmarks the hot path of the data loader on three workloads:
//! - **sample_fetch**: Full shard-backed fetch (mmap read, image decode,
//!   augmentation, caption normalization) at several output resolutions;
//!   this is the per-worker cost that bounds loader throughput.
//! - **caption_normalize**: Text cleanup alone, on a realistic mix of
//!   short and long captions.
//! - **caption_index**: Flat-index construction and resolution for a
//!   large multi-caption corpus.
//!
//! # Running
//!
//! ```sh
//! cargo bench --bench fetch_throughput
//! ```

use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, BinaryBuilder, ListBuilder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use criterion::{BenchmarkId, Criterion, Throughput};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::LogNormal;

use confluence::dataset::pretrain::PretrainShardDataset;
use confluence::dataset::Dataset;
use confluence::imaging::TrainAugment;
use confluence::shard::CaptionIndex;
use confluence::text;

// ============================================================================
// Test data generators
// ============================================================================

/// Encode a gradient image as PNG bytes of the given dimensions.
fn encode_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// Write an IPC shard with `image` (Binary) and `caption` (List<Utf8>)
/// columns, every row carrying the same PNG payload.
fn write_shard(path: &Path, rows: usize, png: &[u8]) {
    let mut images = BinaryBuilder::new();
    let mut captions = ListBuilder::new(StringBuilder::new());
    for i in 0..rows {
        images.append_value(png);
        captions
            .values()
            .append_value(format!("a photo of scene number {i} on a sunny day"));
        captions.append(true);
    }
    let schema = Arc::new(Schema::new(vec![
        Field::new("image", DataType::Binary, true),
        Field::new(
            "caption",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            true,
        ),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(images.finish()) as ArrayRef,
            Arc::new(captions.finish()) as ArrayRef,
        ],
    )
    .unwrap();
    let file = File::create(path).unwrap();
    let mut writer = FileWriter::try_new(file, &schema).unwrap();
    writer.write(&batch).unwrap();
    writer.finish().unwrap();
}

/// Generate captions with a log-normal word-count distribution.
///
/// Web alt-text corpora mix three-word fragments with sentence-length
/// descriptions; a log-normal with a median around 10 words is a fair
/// stand-in. Lengths are clamped to `[3, 60]`.
fn generate_captions(count: usize) -> Vec<String> {
    let sample_phrases = [
        "a dog running across a sandy beach at sunset",
        "two people sitting on a wooden bench near the lake",
        "close-up view of a red bicycle leaning against a brick wall",
        "a bowl of fresh fruit on a kitchen table",
        "city skyline reflected in the river after rain",
        "a child flying a colorful kite in an open field",
        "black and white photograph of an old railway station",
        "several boats docked at the harbor in the early morning",
        "a cat sleeping on a pile of folded laundry",
        "mountains covered in snow under a clear blue sky",
    ];

    let ln = LogNormal::new(2.3, 0.6).unwrap();
    let mut rng = SmallRng::seed_from_u64(11);

    (0..count)
        .map(|i| {
            let target_words: usize = (rng.sample::<f64, _>(&ln) as usize).clamp(3, 60);
            let mut result = String::new();
            let mut word_count = 0;
            while word_count < target_words {
                let phrase = sample_phrases[i % sample_phrases.len()];
                if !result.is_empty() {
                    result.push_str(", ");
                }
                result.push_str(phrase);
                word_count += phrase.split_whitespace().count();
            }
            result
        })
        .collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_sample_fetch(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let shard = dir.path().join("bench.arrow");
    let rows = 64;
    write_shard(&shard, rows, &encode_png(512, 512));

    let mut group = c.benchmark_group("sample_fetch");
    group.sample_size(30);
    group.noise_threshold(0.05);
    group.throughput(Throughput::Elements(1));

    for image_size in [224, 256, 384] {
        let dataset = PretrainShardDataset::open(
            &[shard.clone()],
            Arc::new(TrainAugment::new(image_size)),
            text::DEFAULT_MAX_WORDS,
        )
        .unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut next = 0usize;
        group.bench_with_input(
            BenchmarkId::new("get", image_size),
            &image_size,
            |b, _| {
                b.iter(|| {
                    let sample = dataset.get(next % rows, &mut rng).unwrap();
                    next += 1;
                    sample
                });
            },
        );
    }
    group.finish();
}

fn bench_caption_normalize(c: &mut Criterion) {
    let num_captions = 8_192;
    let captions = generate_captions(num_captions);

    let mut group = c.benchmark_group("caption_normalize");
    group.noise_threshold(0.05);
    group.throughput(Throughput::Elements(num_captions as u64));

    group.bench_function("normalize", |b| {
        b.iter(|| {
            captions
                .iter()
                .map(|caption| text::normalize(caption, text::DEFAULT_MAX_WORDS))
                .collect::<Vec<_>>()
        });
    });
    group.finish();
}

fn bench_caption_index(c: &mut Criterion) {
    // alternating 1/5/7 captions per row, like a mixed web+coco corpus
    let rows: Vec<Vec<String>> = (0..100_000)
        .map(|i| {
            let count = [1, 5, 7][i % 3];
            (0..count).map(|k| format!("caption {i} {k}")).collect()
        })
        .collect();

    let mut group = c.benchmark_group("caption_index");
    group.noise_threshold(0.05);

    group.throughput(Throughput::Elements(rows.len() as u64));
    group.bench_function("build", |b| {
        b.iter(|| CaptionIndex::build(&rows));
    });

    let index = CaptionIndex::build(&rows);
    group.throughput(Throughput::Elements(index.len() as u64));
    group.bench_function("resolve_all", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for flat in 0..index.len() {
                if index.resolve(flat).is_some() {
                    hits += 1;
                }
            }
            hits
        });
    });
    group.finish();
}

// ============================================================================
// Criterion main
// ============================================================================

fn main() {
    let mut criterion = Criterion::default()
        .warm_up_time(std::time::Duration::from_secs(3))
        .measurement_time(std::time::Duration::from_secs(10))
        .configure_from_args();

    bench_sample_fetch(&mut criterion);
    bench_caption_normalize(&mut criterion);
    bench_caption_index(&mut criterion);

    criterion.final_summary();
}
