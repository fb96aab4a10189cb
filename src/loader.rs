//! Prefetching batch loader.
//!
//! One epoch is a deterministic shuffle of the dataset split into batches.
//! A named producer thread fetches each batch's samples in parallel, stacks
//! the two view tensors, and pushes the collated batch over a bounded
//! channel; the consumer side is a plain iterator. Dropping the iterator
//! mid-epoch signals the producer and joins it.
//!
//! ```text
//! shuffle(0..len) -> [b0, b1, ...] -> producer thread -> bounded channel -> EpochStream
//!                                     (rayon fetch fan-out,  depth = prefetch
//!                                      one rng per sample)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use rand::prelude::*;
use rand::rngs::SmallRng;
use rayon::prelude::*;
use tracing::debug;

use crate::dataset::pretrain::PretrainSample;
use crate::dataset::Dataset;
use crate::error::FetchError;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Samples per batch.
    pub batch_size: usize,
    /// Bounded-channel depth of batches fetched ahead of the consumer.
    pub prefetch: usize,
    /// Base seed; the epoch number is folded in per epoch.
    pub seed: u64,
    /// Drop the final short batch instead of yielding it.
    pub drop_last: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            prefetch: 3,
            seed: 42,
            drop_last: true,
        }
    }
}

// ============================================================================
// Collated batch
// ============================================================================

/// A batch of stacked view pairs, ready for the model step.
///
/// Tensors are flat `[B, C, H, W]` f32 in row-major order.
pub struct PretrainBatch {
    pub batch_size: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,

    pub views: Vec<f32>,
    pub views_aug: Vec<f32>,
    pub captions: Vec<String>,
}

fn collate(samples: Vec<PretrainSample>) -> PretrainBatch {
    let batch_size = samples.len();
    let (channels, height, width) = samples
        .first()
        .map(|s| s.view.shape())
        .unwrap_or((0, 0, 0));
    let per_sample = channels * height * width;

    let mut views = Vec::with_capacity(batch_size * per_sample);
    let mut views_aug = Vec::with_capacity(batch_size * per_sample);
    let mut captions = Vec::with_capacity(batch_size);
    for sample in samples {
        debug_assert_eq!(sample.view.len(), per_sample);
        debug_assert_eq!(sample.view_aug.len(), per_sample);
        views.extend_from_slice(&sample.view.data);
        views_aug.extend_from_slice(&sample.view_aug.data);
        captions.push(sample.caption);
    }
    PretrainBatch {
        batch_size,
        channels,
        height,
        width,
        views,
        views_aug,
        captions,
    }
}

// ============================================================================
// Loader
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("failed to spawn loader thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct BatchLoader<D> {
    dataset: Arc<D>,
    config: LoaderConfig,
}

impl<D> BatchLoader<D>
where
    D: Dataset<Sample = PretrainSample> + 'static,
{
    pub fn new(dataset: Arc<D>, config: LoaderConfig) -> Self {
        debug_assert!(config.batch_size > 0);
        Self { dataset, config }
    }

    /// Batches one epoch will yield.
    pub fn num_batches(&self) -> usize {
        let len = self.dataset.len();
        if self.config.drop_last {
            len / self.config.batch_size
        } else {
            len.div_ceil(self.config.batch_size)
        }
    }

    /// Start one epoch: shuffle, spawn the producer, hand back the
    /// consuming iterator. Fully deterministic for a fixed (seed, epoch).
    pub fn epoch(&self, epoch: usize) -> Result<EpochStream, LoaderError> {
        let mut rng = SmallRng::seed_from_u64(self.config.seed ^ epoch as u64);
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        indices.shuffle(&mut rng);

        let mut batches: Vec<Vec<usize>> = indices
            .chunks(self.config.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        if self.config.drop_last {
            if let Some(last) = batches.last() {
                if last.len() < self.config.batch_size {
                    batches.pop();
                }
            }
        }
        debug!(epoch, batches = batches.len(), "starting epoch stream");

        let (tx, rx) = channel::bounded(self.config.prefetch.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let dataset = Arc::clone(&self.dataset);
            let stop = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name(format!("loader-epoch-{epoch}"))
                .spawn(move || producer_loop(dataset, batches, rng, tx, stop))?
        };

        Ok(EpochStream {
            rx,
            shutdown,
            handle: Some(handle),
        })
    }
}

/// Fetch and send every batch, stopping early on shutdown, a closed
/// channel, or the first fetch error.
fn producer_loop<D>(
    dataset: Arc<D>,
    batches: Vec<Vec<usize>>,
    mut rng: SmallRng,
    tx: Sender<Result<PretrainBatch, FetchError>>,
    shutdown: Arc<AtomicBool>,
) where
    D: Dataset<Sample = PretrainSample> + 'static,
{
    for indices in batches {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        // one pre-drawn seed per sample keeps the parallel fetch
        // deterministic regardless of rayon's scheduling
        let item_seeds: Vec<u64> = (0..indices.len()).map(|_| rng.random()).collect();
        let fetched: Result<Vec<PretrainSample>, FetchError> = indices
            .par_iter()
            .zip(item_seeds.par_iter())
            .map(|(&index, &item_seed)| {
                let mut item_rng = SmallRng::seed_from_u64(item_seed);
                dataset.get(index, &mut item_rng)
            })
            .collect();
        match fetched {
            Ok(samples) => {
                if tx.send(Ok(collate(samples))).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                break;
            }
        }
    }
    debug!("loader producer exiting");
}

// ============================================================================
// Consumer side
// ============================================================================

/// Receiving end of one epoch. Iterates batches in shuffle order; ends when
/// the producer has sent everything (or after forwarding a fetch error).
pub struct EpochStream {
    rx: Receiver<Result<PretrainBatch, FetchError>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochStream {
    /// Signal the producer, drain in-flight batches so it can unblock,
    /// and join it.
    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        while self.rx.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Iterator for EpochStream {
    type Item = Result<PretrainBatch, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for EpochStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::pretrain::PretrainShardDataset;
    use crate::imaging::{tiny_png, ProbeTransform};
    use crate::shard::fixtures::write_shard;

    fn indexed_dataset(dir: &std::path::Path, rows: usize) -> Arc<PretrainShardDataset> {
        let png = tiny_png(1, 1, [2, 2, 2]);
        let shard: Vec<_> = (0..rows)
            .map(|i| (Some(png.clone()), vec![format!("i{i:02}")]))
            .collect();
        let path = dir.join("corpus.arrow");
        write_shard(&path, &shard);
        Arc::new(PretrainShardDataset::open(&[path], Arc::new(ProbeTransform), 30).unwrap())
    }

    fn epoch_captions(loader: &BatchLoader<PretrainShardDataset>, epoch: usize) -> Vec<String> {
        loader
            .epoch(epoch)
            .unwrap()
            .map(|batch| batch.unwrap().captions)
            .collect::<Vec<_>>()
            .concat()
    }

    #[test]
    fn test_epoch_covers_every_index_once() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = indexed_dataset(dir.path(), 32);
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: 5,
                prefetch: 2,
                seed: 7,
                drop_last: false,
            },
        );
        assert_eq!(loader.num_batches(), 7);

        let batches: Vec<_> = loader
            .epoch(0)
            .unwrap()
            .map(|batch| batch.unwrap())
            .collect();
        assert_eq!(batches.len(), 7);
        assert_eq!(batches[6].batch_size, 2);
        assert_eq!(batches[0].views.len(), 5);
        assert_ne!(batches[0].views, batches[0].views_aug);

        let mut seen: Vec<String> = batches.into_iter().flat_map(|b| b.captions).collect();
        seen.sort();
        let expected: Vec<String> = (0..32).map(|i| format!("i{i:02}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_shuffle_deterministic_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = indexed_dataset(dir.path(), 24);
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: 4,
                prefetch: 1,
                seed: 99,
                drop_last: true,
            },
        );

        let first = epoch_captions(&loader, 3);
        let again = epoch_captions(&loader, 3);
        assert_eq!(first, again);

        let other_epoch = epoch_captions(&loader, 4);
        assert_ne!(first, other_epoch);
        let mut a = first;
        let mut b = other_epoch;
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_drop_last_discards_short_batch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = indexed_dataset(dir.path(), 32);
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: 5,
                prefetch: 2,
                seed: 7,
                drop_last: true,
            },
        );
        assert_eq!(loader.num_batches(), 6);
        assert_eq!(epoch_captions(&loader, 0).len(), 30);
    }

    #[test]
    fn test_fetch_error_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.arrow");
        write_shard(
            &path,
            &[(Some(b"not an image".to_vec()), vec!["x".to_string()])],
        );
        let dataset =
            Arc::new(PretrainShardDataset::open(&[path], Arc::new(ProbeTransform), 30).unwrap());
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: 1,
                prefetch: 1,
                seed: 0,
                drop_last: false,
            },
        );

        let mut stream = loader.epoch(0).unwrap();
        let first = stream.next().unwrap();
        assert!(matches!(first, Err(FetchError::RetriesExhausted { .. })));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_drop_mid_epoch_joins_producer() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = indexed_dataset(dir.path(), 32);
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: 2,
                prefetch: 1,
                seed: 1,
                drop_last: false,
            },
        );

        let mut stream = loader.epoch(0).unwrap();
        let _ = stream.next().unwrap().unwrap();
        drop(stream);
    }
}
