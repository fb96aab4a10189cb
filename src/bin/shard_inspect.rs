//! Inspect pretraining shard tables: dump row counts, caption stats, image
//! byte sizes, and sample captions in a human-readable format. Optionally
//! decode every image and cross-check an annotation file's row references.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin shard_inspect -- data/coco_0.arrow data/coco_1.arrow
//! cargo run --release --bin shard_inspect -- data/coco_0.arrow --decode
//! cargo run --release --bin shard_inspect -- data/*.arrow --annotations data/vg_arrow.json
//! ```

use std::path::PathBuf;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use confluence::annotation::{read_annotation_file, RowRef};
use confluence::error::DatasetError;
use confluence::imaging::decode_bytes;
use confluence::shard::ShardTable;

#[derive(Parser, Debug)]
#[command(about = "Inspect pretraining shard tables")]
struct Args {
    /// Shard table files to inspect.
    #[arg(required = true)]
    tables: Vec<PathBuf>,

    /// Annotation file whose row references are checked against the tables.
    #[arg(long)]
    annotations: Option<PathBuf>,

    /// Decode every image and report failures.
    #[arg(long)]
    decode: bool,

    /// Number of sample captions to dump per table (0 to skip).
    #[arg(long, default_value_t = 5)]
    sample_captions: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let mut tables = Vec::with_capacity(args.tables.len());
    let mut caption_lists = Vec::with_capacity(args.tables.len());
    for path in &args.tables {
        let table = ShardTable::open(path)?;
        // Image-only tables are still worth inspecting.
        let captions = match table.caption_lists() {
            Ok(lists) => lists,
            Err(DatasetError::MissingColumn { .. }) => vec![Vec::new(); table.rows()],
            Err(err) => return Err(err.into()),
        };
        caption_lists.push(captions);
        tables.push(table);
    }
    let total_rows: usize = tables.iter().map(|t| t.rows()).sum();
    let total_captions: usize = caption_lists
        .iter()
        .map(|lists| lists.iter().map(|c| c.len()).sum::<usize>())
        .sum();

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Shard tables: {}", tables.len());
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Total rows:     {total_rows:>10}");
    println!("║  Total captions: {total_captions:>10}");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Tables ────────────────────────────────────────────────────────────
    for (ti, table) in tables.iter().enumerate() {
        let captions = &caption_lists[ti];
        let rows = table.rows();
        let caption_total: usize = captions.iter().map(|c| c.len()).sum();
        let per_row_min = captions.iter().map(|c| c.len()).min().unwrap_or(0);
        let per_row_max = captions.iter().map(|c| c.len()).max().unwrap_or(0);

        println!("┌─ Table {ti}: \"{}\"", table.path().display());
        println!(
            "│  Rows: {rows}  Captions: {caption_total} (per row: min {per_row_min}, max {per_row_max})"
        );

        let mut missing = 0usize;
        let mut counted = 0usize;
        let mut min_bytes = usize::MAX;
        let mut max_bytes = 0usize;
        let mut sum_bytes = 0u64;
        for row in 0..rows {
            match table.image_bytes(row) {
                Ok(bytes) => {
                    counted += 1;
                    min_bytes = min_bytes.min(bytes.len());
                    max_bytes = max_bytes.max(bytes.len());
                    sum_bytes += bytes.len() as u64;
                }
                Err(_) => missing += 1,
            }
        }
        if counted > 0 {
            println!(
                "│  Image bytes: min {min_bytes}  max {max_bytes}  mean {:.1}  ({missing} missing)",
                sum_bytes as f64 / counted as f64
            );
        } else {
            println!("│  Image bytes: (none present)");
        }

        if args.sample_captions > 0 && rows > 0 {
            let show = rows.min(args.sample_captions);
            println!("│");
            println!("│  Sample captions (first {show} of {rows} rows):");
            for row in 0..show {
                let text = captions[row]
                    .first()
                    .map(|c| c.as_str())
                    .unwrap_or("(no caption)");
                let truncated: String = text.chars().take(60).collect();
                let suffix = if captions[row].len() > 1 {
                    format!(" (+{} more)", captions[row].len() - 1)
                } else {
                    String::new()
                };
                println!("│    [{row}] {truncated}{suffix}");
            }
            if rows > show {
                println!("│  ... ({} more rows)", rows - show);
            }
        }

        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    // ── Decode check ──────────────────────────────────────────────────────
    if args.decode {
        let pb = ProgressBar::new(total_rows as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "  Decoding   {bar:40.cyan/blue} {pos}/{len} rows [{elapsed_precise}]",
            )
            .unwrap()
            .progress_chars("##-"),
        );

        let mut decoded = 0usize;
        let mut failures: Vec<(usize, usize, String)> = Vec::new();
        let mut width_range = (u32::MAX, 0u32);
        let mut height_range = (u32::MAX, 0u32);
        for (ti, table) in tables.iter().enumerate() {
            for row in 0..table.rows() {
                match table.image_bytes(row) {
                    Ok(bytes) => match decode_bytes(bytes) {
                        Ok(image) => {
                            decoded += 1;
                            width_range.0 = width_range.0.min(image.width());
                            width_range.1 = width_range.1.max(image.width());
                            height_range.0 = height_range.0.min(image.height());
                            height_range.1 = height_range.1.max(image.height());
                        }
                        Err(err) => failures.push((ti, row, err.to_string())),
                    },
                    Err(err) => failures.push((ti, row, err.to_string())),
                }
                pb.inc(1);
            }
        }
        pb.finish_and_clear();

        println!("┌─ Decode check");
        println!("│  Decoded: {decoded}/{total_rows}");
        if decoded > 0 {
            println!(
                "│  Width:  [{}, {}]  Height: [{}, {}]",
                width_range.0, width_range.1, height_range.0, height_range.1
            );
        }
        if !failures.is_empty() {
            println!("│  Failures: {}", failures.len());
            for (ti, row, err) in failures.iter().take(10) {
                println!("│    table {ti} row {row}: {err}");
            }
            if failures.len() > 10 {
                println!("│  ... ({} more failures)", failures.len() - 10);
            }
        }
        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    // ── Annotation cross-check ────────────────────────────────────────────
    if let Some(path) = &args.annotations {
        let records = read_annotation_file(path)?;

        let mut row_refs = 0usize;
        let mut pair_refs = 0usize;
        let mut without = 0usize;
        let mut out_of_range: Vec<(usize, u64)> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            match &record.arrow_index {
                Some(RowRef::Row(row)) => {
                    row_refs += 1;
                    if *row as usize >= total_rows {
                        out_of_range.push((i, *row));
                    }
                }
                Some(RowRef::Pair(pair)) => {
                    pair_refs += 1;
                    for &row in pair {
                        if row as usize >= total_rows {
                            out_of_range.push((i, row));
                        }
                    }
                }
                None => without += 1,
            }
        }

        println!("┌─ Annotations: \"{}\"", path.display());
        println!("│  Records: {}", records.len());
        println!("│  Row refs: {row_refs}  Pair refs: {pair_refs}  Without: {without}");
        if out_of_range.is_empty() {
            println!("│  All row references within [0, {total_rows})");
        } else {
            println!("│  Out of range: {}", out_of_range.len());
            for (i, row) in out_of_range.iter().take(10) {
                println!("│    record {i} → row {row}");
            }
            if out_of_range.len() > 10 {
                println!("│  ... ({} more)", out_of_range.len() - 10);
            }
        }
        println!("└──────────────────────────────────────────────────────────────");
    }

    Ok(())
}
