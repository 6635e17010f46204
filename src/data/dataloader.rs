use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::collate::{pad_batch, Batch};
use super::dataset::{DetectionDataset, DetectionSample};
use crate::error::{DetectionError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// 0 loads on the consuming thread.
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            batch_size: 4,
            shuffle: false,
            seed: 42,
            workers: 0,
            queue_depth: 4,
        }
    }
}

/// Batches a [`DetectionDataset`], optionally prefetching with a pool of
/// worker threads feeding a bounded queue.
pub struct DetectionDataLoader<B: Backend> {
    dataset: Arc<DetectionDataset>,
    options: LoaderOptions,
    device: B::Device,
}

impl<B: Backend> DetectionDataLoader<B> {
    pub fn new(dataset: DetectionDataset, options: LoaderOptions, device: B::Device) -> Self {
        Self {
            dataset: Arc::new(dataset),
            options: LoaderOptions {
                batch_size: options.batch_size.max(1),
                queue_depth: options.queue_depth.max(1),
                ..options
            },
            device,
        }
    }

    pub fn dataset(&self) -> &DetectionDataset {
        &self.dataset
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.options.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Sample indices per batch. Shuffling is seeded by `(seed, epoch)` so a
    /// run is reproducible.
    pub fn plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
            .chunks(self.options.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    pub fn iter(&self, epoch: usize) -> BatchIter<B> {
        let plan = Arc::new(self.plan(epoch));
        let seed = sample_seed_base(self.options.seed, epoch);
        let total = plan.len();

        let source = if self.options.workers == 0 {
            Source::Inline {
                dataset: Arc::clone(&self.dataset),
                plan,
                seed,
            }
        } else {
            let dataset = Arc::clone(&self.dataset);
            Source::Prefetch(Prefetcher::spawn(
                total,
                self.options.workers,
                self.options.queue_depth,
                move |b| load_samples(&dataset, &plan[b], seed),
            ))
        };

        BatchIter {
            source,
            device: self.device.clone(),
            next_batch: 0,
            total,
        }
    }
}

fn sample_seed_base(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add((epoch as u64).wrapping_mul(1_000_003))
}

/// Loads the samples of one batch, dropping malformed ones. Each sample gets
/// its own RNG so the result does not depend on worker scheduling.
fn load_samples(dataset: &DetectionDataset, indices: &[usize], seed: u64) -> Vec<DetectionSample> {
    indices
        .iter()
        .filter_map(|&idx| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));
            match dataset.get(idx, &mut rng) {
                Ok(sample) => sample,
                Err(e) => {
                    log::warn!("Dropping sample {}: {}", idx, e);
                    None
                }
            }
        })
        .collect()
}

/// Lets workers run at most `depth` items ahead of the consumer.
struct Window {
    state: Mutex<WindowState>,
    ready: Condvar,
}

struct WindowState {
    consumed: usize,
    closed: bool,
}

impl Window {
    fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                consumed: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Blocks until item `b` is inside the window. False once closed.
    fn wait_for(&self, b: usize, depth: usize) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.closed && b >= state.consumed + depth {
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        !state.closed
    }

    fn advance(&self, consumed: usize) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).consumed = consumed;
        self.ready.notify_all();
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        self.ready.notify_all();
    }
}

type Loaded<T> = (usize, std::result::Result<T, String>);

/// Computes `load(0..total)` on a worker pool and hands the results back in
/// index order. A panicking `load` becomes an error for its index.
struct Prefetcher<T> {
    receiver: Option<Receiver<Loaded<T>>>,
    pending: BTreeMap<usize, std::result::Result<T, String>>,
    window: Arc<Window>,
    handles: Vec<JoinHandle<()>>,
    next: usize,
    total: usize,
}

impl<T: Send + 'static> Prefetcher<T> {
    fn spawn<F>(total: usize, workers: usize, depth: usize, load: F) -> Self
    where
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        let depth = depth.max(1);
        let (sender, receiver) = sync_channel(depth);
        let claimed = Arc::new(AtomicUsize::new(0));
        let window = Arc::new(Window::new());
        let load = Arc::new(load);

        let handles = (0..workers.max(1))
            .map(|_| {
                let sender = sender.clone();
                let claimed = Arc::clone(&claimed);
                let window = Arc::clone(&window);
                let load = Arc::clone(&load);
                std::thread::spawn(move || loop {
                    let b = claimed.fetch_add(1, Ordering::SeqCst);
                    if b >= total || !window.wait_for(b, depth) {
                        break;
                    }
                    let item = catch_unwind(AssertUnwindSafe(|| (*load)(b))).map_err(panic_message);
                    if sender.send((b, item)).is_err() {
                        break;
                    }
                })
            })
            .collect();

        Self {
            receiver: Some(receiver),
            pending: BTreeMap::new(),
            window,
            handles,
            next: 0,
            total,
        }
    }

    /// The next item in index order; `None` once all items were returned or
    /// after the first error.
    fn next_item(&mut self) -> Option<Result<T>> {
        if self.next >= self.total {
            return None;
        }
        let b = self.next;
        loop {
            if let Some(item) = self.pending.remove(&b) {
                return Some(match item {
                    Ok(item) => {
                        self.next += 1;
                        self.window.advance(self.next);
                        Ok(item)
                    }
                    Err(msg) => {
                        self.stop();
                        Err(DetectionError::DataLoader(format!("batch {} failed: {}", b, msg)))
                    }
                });
            }
            let received = self.receiver.as_ref().and_then(|r| r.recv().ok());
            match received {
                Some((idx, item)) => {
                    self.pending.insert(idx, item);
                }
                None => {
                    self.stop();
                    return Some(Err(DetectionError::DataLoader(format!(
                        "workers stopped before batch {} of {}",
                        b, self.total
                    ))));
                }
            }
        }
    }

    /// Ends the epoch early.
    fn stop(&mut self) {
        self.next = self.total;
        self.pending.clear();
        self.shutdown();
    }
}

impl<T> Prefetcher<T> {
    fn shutdown(&mut self) {
        self.window.close();
        // unblocks workers waiting on a full queue
        self.receiver.take();
        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                log::error!("data loader worker panicked: {}", panic_message(payload));
            }
        }
    }
}

impl<T> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

enum Source {
    Inline {
        dataset: Arc<DetectionDataset>,
        plan: Arc<Vec<Vec<usize>>>,
        seed: u64,
    },
    Prefetch(Prefetcher<Vec<DetectionSample>>),
}

/// Batches of one epoch in plan order. Batches whose samples were all dropped
/// are skipped; a failed worker ends the epoch with an error.
pub struct BatchIter<B: Backend> {
    source: Source,
    device: B::Device,
    next_batch: usize,
    total: usize,
}

impl<B: Backend> BatchIter<B> {
    fn next_samples(&mut self) -> Option<Result<Vec<DetectionSample>>> {
        if self.next_batch >= self.total {
            return None;
        }
        let b = self.next_batch;
        self.next_batch += 1;

        let samples = match &mut self.source {
            Source::Inline { dataset, plan, seed } => Some(Ok(load_samples(dataset, &plan[b], *seed))),
            Source::Prefetch(prefetcher) => prefetcher.next_item(),
        };
        if matches!(samples, Some(Err(_)) | None) {
            self.next_batch = self.total;
        }
        samples
    }
}

impl<B: Backend> Iterator for BatchIter<B> {
    type Item = Result<Batch<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let samples = match self.next_samples()? {
                Ok(samples) => samples,
                Err(e) => return Some(Err(e)),
            };
            match pad_batch(samples, &self.device) {
                Ok(Some(batch)) => return Some(Ok(batch)),
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Dropping batch {}: {}", self.next_batch - 1, e);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::AnchorSet;
    use crate::data::annotations::TextOcrAnnotations;
    use crate::data::dataset::DatasetOptions;
    use crate::data::transforms::{Normalization, RandomRotation};
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::path::Path;

    type TestBackend = NdArray;

    fn dataset(dir: &Path, images: usize, augment: bool) -> DetectionDataset {
        let mut imgs = Vec::new();
        let mut anns = Vec::new();
        let mut index = Vec::new();
        for i in 0..images {
            let name = format!("img{}", i);
            RgbImage::from_pixel(16 + i as u32, 16, Rgb([i as u8 * 10, 0, 0]))
                .save(dir.join(format!("{}.png", name)))
                .unwrap();
            imgs.push(format!(
                r#""{n}": {{"id": "{n}", "width": {w}, "height": 16, "file_name": "{n}.png"}}"#,
                n = name,
                w = 16 + i
            ));
            anns.push(format!(
                r#""{n}_0": {{"id": "{n}_0", "image_id": "{n}", "bbox": [2, 2, 8, 4], "utf8_string": "t"}}"#,
                n = name
            ));
            index.push(format!(r#""{n}": ["{n}_0"]"#, n = name));
        }
        let json = format!(
            r#"{{"imgs": {{{}}}, "anns": {{{}}}, "imgToAnns": {{{}}}}}"#,
            imgs.join(","),
            anns.join(","),
            index.join(",")
        );
        let ann: TextOcrAnnotations = serde_json::from_str(&json).unwrap();
        let options = DatasetOptions {
            canvas: 32,
            normalization: Normalization::default(),
            augment,
            rotation: RandomRotation::default(),
        };
        let anchors = AnchorSet::new(vec![[4.0, 2.0], [8.0, 4.0]], 1).unwrap();
        DetectionDataset::new(&ann, dir, anchors, options)
    }

    #[test]
    fn test_batches_cover_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoaderOptions {
            batch_size: 2,
            ..LoaderOptions::default()
        };
        let loader = DetectionDataLoader::<TestBackend>::new(dataset(dir.path(), 5, false), options, Default::default());
        assert_eq!(loader.len(), 3);

        let sizes: Vec<usize> = loader.iter(0).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_prefetch_matches_inline() {
        let dir = tempfile::tempdir().unwrap();
        let base = LoaderOptions {
            batch_size: 2,
            shuffle: true,
            seed: 3,
            workers: 0,
            queue_depth: 1,
        };
        let inline = DetectionDataLoader::<TestBackend>::new(dataset(dir.path(), 7, true), base, Default::default());
        let pooled = DetectionDataLoader::<TestBackend>::new(
            dataset(dir.path(), 7, true),
            LoaderOptions { workers: 3, ..base },
            Default::default(),
        );

        let collect = |loader: &DetectionDataLoader<TestBackend>| {
            loader
                .iter(1)
                .map(|b| b.unwrap())
                .map(|b| (b.paths.clone(), b.letterboxes.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(collect(&inline), collect(&pooled));
    }

    #[test]
    fn test_drop_mid_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoaderOptions {
            batch_size: 1,
            workers: 2,
            queue_depth: 1,
            ..LoaderOptions::default()
        };
        let loader = DetectionDataLoader::<TestBackend>::new(dataset(dir.path(), 6, false), options, Default::default());
        let mut iter = loader.iter(0);
        assert!(iter.next().unwrap().is_ok());
        drop(iter);
    }

    #[test]
    fn test_shuffle_depends_on_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoaderOptions {
            batch_size: 1,
            shuffle: true,
            ..LoaderOptions::default()
        };
        let loader = DetectionDataLoader::<TestBackend>::new(dataset(dir.path(), 8, false), options, Default::default());
        assert_eq!(loader.plan(2), loader.plan(2));
        assert_ne!(loader.plan(0), loader.plan(1));
    }

    #[test]
    fn test_workers_stay_within_queue_depth() {
        use std::time::Duration;

        let highest = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&highest);
        let mut prefetcher = Prefetcher::spawn(20, 4, 2, move |i| {
            seen.fetch_max(i, Ordering::SeqCst);
            i * 10
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(highest.load(Ordering::SeqCst) < 2);

        let mut out = Vec::new();
        while let Some(item) = prefetcher.next_item() {
            out.push(item.unwrap());
            assert!(prefetcher.pending.len() <= 2);
            assert!(highest.load(Ordering::SeqCst) < out.len() + 2);
        }
        assert_eq!(out, (0..20).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_panic_ends_epoch_with_error() {
        let mut prefetcher = Prefetcher::spawn(8, 2, 2, |i| {
            if i == 3 {
                panic!("corrupt sample {}", i);
            }
            i
        });

        for expected in 0..3 {
            assert_eq!(prefetcher.next_item().unwrap().unwrap(), expected);
        }
        match prefetcher.next_item() {
            Some(Err(DetectionError::DataLoader(msg))) => assert!(msg.contains("corrupt sample 3"), "{}", msg),
            other => panic!("expected a loader error, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(prefetcher.next_item().is_none());
    }
}
