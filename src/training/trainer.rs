use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::config::TrainingConfig;
use super::early_stopping::{EarlyStopping, Verdict};
use super::metrics::{match_ground_truth, EpochAccumulator, EpochMetrics, MatchCount};
use super::progress::ProgressMarkers;
use super::schedule::WarmupSchedule;
use super::state::{EpochRecord, TrainingState};
use crate::boxes::{AnchorSet, BBox};
use crate::checkpoint::{self, CheckpointMeta};
use crate::data::transforms::chw_to_image;
use crate::data::{Batch, DetectionDataLoader, DetectionDataset, DetectionSample, TextOcrAnnotations};
use crate::error::{DetectionError, Result};
use crate::model::{DetectionLoss, TextDetector, YoloLoss};
use crate::postprocess::{ImageDetections, PostProcessor};
use crate::visualize;

/// Owns the model, optimiser and run context for one training run.
pub struct Trainer<B: AutodiffBackend, L = YoloLoss> {
    pub model: TextDetector<B>,
    loss_fn: L,
    anchors: AnchorSet,
    config: TrainingConfig,
    device: B::Device,
    optimizer: OptimizerAdaptor<Adam, TextDetector<B>, B>,
    schedule: WarmupSchedule,
    early_stopping: EarlyStopping,
    postprocess: PostProcessor,
    state: TrainingState,
}

impl<B: AutodiffBackend> Trainer<B, YoloLoss> {
    /// Trainer with the default [`YoloLoss`] and the anchors named by the
    /// config.
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        let anchors = AnchorSet::from_json(&config.anchors_path, config.model.anchors_per_scale)?;
        let loss_fn = YoloLoss::new(config.loss);
        Self::with_loss(config, anchors, loss_fn, device)
    }
}

impl<B, L> Trainer<B, L>
where
    B: AutodiffBackend,
    L: DetectionLoss<B> + DetectionLoss<B::InnerBackend>,
{
    pub fn with_loss(config: TrainingConfig, anchors: AnchorSet, loss_fn: L, device: B::Device) -> Result<Self> {
        config.validate()?;
        let scales = config.model.scales();
        if anchors.num_scales() != scales.len() {
            return Err(DetectionError::InvalidAnchors(format!(
                "{} anchor groups for {} active scales {:?}",
                anchors.num_scales(),
                scales.len(),
                scales
            )));
        }

        let model = TextDetector::new(&device, &config.model)?;

        let schedule = if config.warmup_lr_sequence.is_empty() {
            WarmupSchedule::linear(config.learning_rate, config.warmup_epochs)
        } else {
            WarmupSchedule::from_sequence(config.learning_rate, config.warmup_lr_sequence.clone())?
        };

        let early_stopping = EarlyStopping::new(config.patience, config.min_delta);

        let optimizer = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)))
            .init();

        Ok(Self {
            model,
            loss_fn,
            anchors,
            postprocess: config.post_processor(),
            config,
            device,
            optimizer,
            schedule,
            early_stopping,
            state: TrainingState::new(),
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Loads both splits and runs [`Trainer::fit`].
    pub fn train(&mut self) -> Result<&TrainingState> {
        println!("Starting text detector training");

        let train_ann = TextOcrAnnotations::load(&self.config.train_annotations)?;
        let val_ann = TextOcrAnnotations::load(&self.config.val_annotations)?;

        let train_dataset = DetectionDataset::new(
            &train_ann,
            Path::new(&self.config.train_images),
            self.anchors.clone(),
            self.config.dataset_options(true),
        );
        let val_dataset = DetectionDataset::new(
            &val_ann,
            Path::new(&self.config.val_images),
            self.anchors.clone(),
            self.config.dataset_options(false),
        );

        println!("Dataset loaded:");
        println!("  Train: {} images", train_dataset.len());
        println!("  Val: {} images", val_dataset.len());
        println!();

        self.fit(train_dataset, val_dataset)
    }

    /// Epoch loop: train, evaluate, checkpoint, early stop.
    pub fn fit(&mut self, train_dataset: DetectionDataset, val_dataset: DetectionDataset) -> Result<&TrainingState> {
        let save_dir = PathBuf::from(&self.config.save_dir);
        std::fs::create_dir_all(&save_dir).map_err(|e| DetectionError::io(&save_dir, e))?;
        self.config.save(save_dir.join("config.yaml"))?;

        let vis_sample = self.load_vis_sample(&val_dataset);

        let train_loader: DetectionDataLoader<B> =
            DetectionDataLoader::new(train_dataset, self.config.loader_options(true), self.device.clone());
        let val_loader: DetectionDataLoader<B::InnerBackend> = DetectionDataLoader::new(
            val_dataset,
            self.config.loader_options(false),
            <B::InnerBackend as Backend>::Device::default(),
        );

        let pb = ProgressBar::new(self.config.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();
            let lr = self.schedule.lr(epoch);
            if epoch <= self.schedule.warmup_epochs() {
                log::info!("Warmup epoch {}: learning rate {}", epoch, lr);
            }

            println!("\nEpoch [{}/{}]", epoch, self.config.epochs);
            let train = self.train_epoch(&train_loader, epoch, lr, vis_sample.as_ref())?;
            let val = self.evaluate_epoch(&val_loader, epoch)?;

            println!(
                "  Train Loss: {:.4}, Acc: {:.2}% | Val Loss: {:.4}, Acc: {:.2}%",
                train.loss,
                train.accuracy * 100.0,
                val.loss,
                val.accuracy * 100.0
            );
            pb.set_message(format!("Epoch {}: Train={:.4}, Val={:.4}", epoch, train.loss, val.loss));
            pb.inc(1);

            let improved = self.state.push(EpochRecord {
                epoch,
                learning_rate: lr,
                train,
                val,
                seconds: epoch_start.elapsed().as_secs_f32(),
            });

            if improved {
                println!("  Validation loss improved, saving best checkpoint");
                self.save_checkpoint("best", epoch, Some((train, val)))?;
            }

            if epoch % self.config.save_interval == 0 {
                self.save_checkpoint(&format!("epoch_{}", epoch), epoch, Some((train, val)))?;
            }

            match self.early_stopping.observe(val.loss) {
                Verdict::Stop => {
                    println!("  Early stopping at epoch {}", epoch);
                    break;
                }
                Verdict::Stale(n) => log::debug!("No validation improvement for {} epoch(s)", n),
                Verdict::Improved => {}
            }

            println!("  Epoch time: {:.2}s", epoch_start.elapsed().as_secs_f32());
        }

        let last = self.state.last().map(|r| (r.epoch, r.train, r.val));
        match last {
            Some((epoch, train, val)) => self.save_checkpoint("final", epoch, Some((train, val)))?,
            None => self.save_checkpoint("final", 0, None)?,
        };
        self.state.save(save_dir.join("history.json"))?;

        pb.finish_with_message("Training completed!");
        println!("Checkpoints saved in: {}", self.config.save_dir);
        Ok(&self.state)
    }

    /// One optimisation pass. Visualises the fixed sample on the configured
    /// batches and skips batches whose loss is not finite.
    pub fn train_epoch(
        &mut self,
        loader: &DetectionDataLoader<B>,
        epoch: usize,
        lr: f64,
        vis_sample: Option<&DetectionSample>,
    ) -> Result<EpochMetrics> {
        let mut acc = EpochAccumulator::new();
        let mut markers = ProgressMarkers::new(loader.len());
        let canvas = self.config.desired_size as usize;

        for (batch_idx, batch) in loader.iter(epoch).enumerate() {
            let batch = batch?;
            if let Some(sample) = vis_sample.filter(|_| self.config.visualize_at(batch_idx)) {
                match self.visualize(sample, epoch, batch_idx) {
                    Ok(path) => log::debug!("Visualisation written to {}", path.display()),
                    Err(e) => log::warn!("Visualisation failed at batch {}: {}", batch_idx, e),
                }
            }
            print_markers(markers.advance(batch_idx + 1));

            self.model.check_input(&batch.images)?;
            let outputs = self.model.forward(batch.images.clone());
            let loss = DetectionLoss::<B>::loss(&self.loss_fn, &outputs, &batch.targets, &self.anchors, canvas)?;
            let loss_value = loss.clone().into_scalar().elem::<f32>();

            if !loss_value.is_finite() {
                log::warn!("Non-finite loss at batch {}, skipping", batch_idx + 1);
                acc.skip_batch();
                continue;
            }

            let matches = self.count_matches(&outputs, &batch)?;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optimizer.step(lr, self.model.clone(), grads);
            self.state.steps += 1;

            acc.add_batch(loss_value, batch.len(), matches);
            log::debug!("batch {}: loss={:.4}", batch_idx + 1, loss_value);
        }
        println!();

        if acc.skipped() > 0 {
            log::warn!("{} training batch(es) skipped in epoch {}", acc.skipped(), epoch);
        }
        acc.finish("training epoch")
    }

    /// Same pass as training on the inner backend: no gradients, no updates.
    pub fn evaluate_epoch(&self, loader: &DetectionDataLoader<B::InnerBackend>, epoch: usize) -> Result<EpochMetrics> {
        let model = self.model.valid();
        let mut acc = EpochAccumulator::new();
        let mut markers = ProgressMarkers::new(loader.len());
        let canvas = self.config.desired_size as usize;

        for (batch_idx, batch) in loader.iter(epoch).enumerate() {
            let batch = batch?;
            print_markers(markers.advance(batch_idx + 1));

            model.check_input(&batch.images)?;
            let outputs = model.forward(batch.images.clone());
            let loss = DetectionLoss::<B::InnerBackend>::loss(
                &self.loss_fn,
                &outputs,
                &batch.targets,
                &self.anchors,
                canvas,
            )?;
            let loss_value = loss.into_scalar().elem::<f32>();
            if !loss_value.is_finite() {
                log::warn!("Non-finite validation loss at batch {}, skipping", batch_idx + 1);
                acc.skip_batch();
                continue;
            }

            let matches = self.count_matches(&outputs, &batch)?;
            acc.add_batch(loss_value, batch.len(), matches);
        }
        println!();

        acc.finish("validation epoch")
    }

    /// Post-processes a batch's outputs and matches them against its
    /// canvas-space ground truth.
    fn count_matches<BB: Backend>(&self, outputs: &[Tensor<BB, 5>], batch: &Batch<BB>) -> Result<MatchCount> {
        let detections = self.postprocess.process(outputs, &self.anchors, &batch.letterboxes)?;
        let mut total = MatchCount::default();
        for (dets, gt) in detections.iter().zip(&batch.boxes) {
            let predicted: Vec<BBox> = dets.canvas.iter().map(|d| d.bbox).collect();
            total += match_ground_truth(&predicted, gt, self.config.metric_iou_threshold);
        }
        Ok(total)
    }

    /// Runs the inference-mode model on `sample` and writes the overlay.
    /// Uses `valid()` so the training graph is untouched.
    pub fn visualize(&mut self, sample: &DetectionSample, epoch: usize, batch_idx: usize) -> Result<PathBuf> {
        let model = self.model.valid();
        let device = <B::InnerBackend as Backend>::Device::default();
        let canvas = sample.canvas;
        let input = Tensor::<B::InnerBackend, 4>::from_data(
            TensorData::new(sample.image.clone(), [1, 3, canvas, canvas]),
            &device,
        );
        let outputs = model.forward(input);
        let detections = self
            .postprocess
            .process(&outputs, &self.anchors, &[sample.letterbox])?
            .pop()
            .unwrap_or_else(ImageDetections::default);

        let image = chw_to_image(&sample.image, canvas as u32, canvas as u32, &self.config.normalization)?;
        let rendered = visualize::render_detections(&image, &detections.canvas, &sample.all_boxes());
        let path = visualize::visualization_path(
            Path::new(&self.config.vis_dir),
            epoch,
            batch_idx,
            self.config.vis_sample,
        );
        visualize::save_image(&rendered, &path)?;
        self.state.visualizations += 1;
        log::info!(
            "Visualisation epoch {} batch {}: {} box(es)",
            epoch,
            batch_idx,
            detections.canvas.len()
        );
        Ok(path)
    }

    fn load_vis_sample(&self, dataset: &DetectionDataset) -> Option<DetectionSample> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        match dataset.get(self.config.vis_sample, &mut rng) {
            Ok(Some(sample)) => Some(sample),
            Ok(None) => {
                log::warn!("Visualisation sample {} is unreadable", self.config.vis_sample);
                None
            }
            Err(e) => {
                log::warn!("Visualisation disabled: {}", e);
                None
            }
        }
    }

    fn save_checkpoint(&self, name: &str, epoch: usize, metrics: Option<(EpochMetrics, EpochMetrics)>) -> Result<PathBuf> {
        let mut meta = CheckpointMeta::new(
            self.config.model.clone(),
            self.config.desired_size,
            self.config.normalization,
            epoch,
        )
        .with_anchors(&self.anchors);
        if let Some((train, val)) = metrics {
            meta = meta.with_metrics(train, val);
        }
        let dir = self.config.checkpoint_dir(name);
        checkpoint::save(&self.model, &dir, &meta)?;
        println!("  Checkpoint '{}' saved to {}", name, dir.display());
        Ok(dir)
    }
}

fn print_markers(markers: Vec<u32>) {
    if markers.is_empty() {
        return;
    }
    for m in markers {
        print!("{}% ", m);
    }
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DatasetOptions, Normalization, RandomRotation};
    use crate::model::{DetectionScale, ModelConfig};
    use burn::backend::{Autodiff, NdArray};
    use image::{Rgb, RgbImage};

    type TestBackend = Autodiff<NdArray>;

    fn fixture(dir: &Path) -> (TextOcrAnnotations, AnchorSet) {
        let mut img = RgbImage::from_pixel(64, 48, Rgb([30, 30, 30]));
        for x in 10..40 {
            for y in 12..22 {
                img.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        img.save(dir.join("a.png")).unwrap();
        img.save(dir.join("b.png")).unwrap();
        let json = r#"{
            "imgs": {
                "a": {"id": "a", "width": 64, "height": 48, "file_name": "a.png"},
                "b": {"id": "b", "width": 64, "height": 48, "file_name": "b.png"}
            },
            "anns": {
                "a_1": {"id": "a_1", "image_id": "a", "bbox": [10, 12, 30, 10], "utf8_string": "word"},
                "b_1": {"id": "b_1", "image_id": "b", "bbox": [10, 12, 30, 10], "utf8_string": "word"}
            },
            "imgToAnns": {"a": ["a_1"], "b": ["b_1"]}
        }"#;
        let ann = serde_json::from_str(json).unwrap();
        let anchors = AnchorSet::new(vec![[12.0, 6.0], [24.0, 8.0], [32.0, 12.0]], 3).unwrap();
        (ann, anchors)
    }

    fn config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            desired_size: 64,
            model: ModelConfig {
                active_scales: vec![DetectionScale::Medium],
                ..ModelConfig::tiny()
            },
            epochs: 2,
            batch_size: 2,
            warmup_epochs: 1,
            conf_threshold: 0.0,
            vis_dir: dir.join("vis").to_string_lossy().into_owned(),
            save_dir: dir.join("runs").to_string_lossy().into_owned(),
            save_interval: 1,
            workers: 0,
            augment: false,
            ..TrainingConfig::default()
        }
    }

    fn dataset(ann: &TextOcrAnnotations, dir: &Path, anchors: &AnchorSet) -> DetectionDataset {
        let options = DatasetOptions {
            canvas: 64,
            normalization: Normalization::default(),
            augment: false,
            rotation: RandomRotation::default(),
        };
        DetectionDataset::new(ann, dir, anchors.clone(), options)
    }

    #[test]
    fn test_rejects_anchor_scale_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (_, anchors) = fixture(dir.path());
        let config = TrainingConfig {
            model: ModelConfig::tiny(),
            ..config(dir.path())
        };
        let result = Trainer::<TestBackend>::with_loss(config, anchors, YoloLoss::default(), Default::default());
        assert!(matches!(result, Err(DetectionError::InvalidAnchors(_))));
    }

    #[test]
    fn test_fit_runs_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (ann, anchors) = fixture(dir.path());
        let config = config(dir.path());
        let mut trainer =
            Trainer::<TestBackend>::with_loss(config.clone(), anchors.clone(), YoloLoss::default(), Default::default())
                .unwrap();

        let state = trainer
            .fit(dataset(&ann, dir.path(), &anchors), dataset(&ann, dir.path(), &anchors))
            .unwrap();

        assert_eq!(state.history.len(), 2);
        assert_eq!(state.steps, 2);
        assert!(state.best.is_some());
        assert!(state.visualizations >= 2);
        for record in &state.history {
            assert!(record.train.loss.is_finite());
            assert_eq!(record.val.boxes, 2);
            assert!((0.0..=1.0).contains(&record.val.accuracy));
        }
        assert!((state.history[0].learning_rate - config.learning_rate / 2.0).abs() < 1e-12);

        let runs = dir.path().join("runs");
        for name in ["best", "epoch_1", "epoch_2", "final"] {
            assert!(runs.join(name).join("checkpoint.json").exists(), "{}", name);
        }
        assert!(runs.join("history.json").exists());
        assert!(runs.join("config.yaml").exists());
        assert!(visualize::visualization_path(&dir.path().join("vis"), 1, 0, 0).exists());

        let (_, meta) = checkpoint::load::<NdArray>(&runs.join("final"), &Default::default()).unwrap();
        assert_eq!(meta.epoch, 2);
    }

    #[test]
    fn test_visualize_leaves_parameters_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (ann, anchors) = fixture(dir.path());
        let mut trainer =
            Trainer::<TestBackend>::with_loss(config(dir.path()), anchors.clone(), YoloLoss::default(), Default::default())
                .unwrap();
        let ds = dataset(&ann, dir.path(), &anchors);
        let sample = ds.get(0, &mut StdRng::seed_from_u64(0)).unwrap().unwrap();

        let before = trainer.model.valid().forward(Tensor::ones([1, 3, 64, 64], &Default::default()));
        let path = trainer.visualize(&sample, 3, 10).unwrap();
        let after = trainer.model.valid().forward(Tensor::ones([1, 3, 64, 64], &Default::default()));

        assert!(path.exists());
        let a = before[0].clone().into_data().to_vec::<f32>().unwrap();
        let b = after[0].clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
