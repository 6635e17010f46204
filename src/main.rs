use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use clap::Parser;

use yolo_text_detection::data::directory_stats;
use yolo_text_detection::training::{Trainer, TrainingConfig};

type MyBackend = NdArray;
type MyAutodiffBackend = Autodiff<MyBackend>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the YOLO-style text detector", long_about = None)]
struct Args {
    /// Training config; a default one is written here if missing
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    /// Print per-channel mean/std of the images under this directory and exit
    #[arg(long)]
    stats: Option<PathBuf>,
}

fn load_or_create_config(path: &Path) -> anyhow::Result<TrainingConfig> {
    if path.exists() {
        println!("Loading config from {}", path.display());
        return TrainingConfig::from_yaml(path).with_context(|| format!("reading {}", path.display()));
    }
    let config = TrainingConfig::default();
    config
        .save(path)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    println!("Created default config at {}", path.display());
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    if let Some(dir) = args.stats {
        let norm = directory_stats(&dir).with_context(|| format!("computing statistics of {}", dir.display()))?;
        println!("mean: {:?}", norm.mean);
        println!("std:  {:?}", norm.std);
        return Ok(());
    }

    println!("Text Detector Training (CPU)");
    println!("============================\n");

    let config = load_or_create_config(&args.config)?;

    println!("\nTraining Configuration:");
    println!("  Train annotations: {}", config.train_annotations);
    println!("  Val annotations: {}", config.val_annotations);
    println!("  Anchors: {}", config.anchors_path);
    println!("  Epochs: {}", config.epochs);
    println!("  Batch size: {}", config.batch_size);
    println!("  Learning rate: {}", config.learning_rate);
    println!("  Canvas: {}x{}", config.desired_size, config.desired_size);
    println!("  NMS thresholds: {:?}", config.nms_thresholds);
    println!("  Save dir: {}", config.save_dir);
    println!();

    let device = Default::default();
    let mut trainer = Trainer::<MyAutodiffBackend>::new(config, device).context("building trainer")?;
    let state = trainer.train().context("training failed")?;

    if let Some((epoch, loss)) = state.best {
        println!("Best validation loss {:.4} at epoch {}", loss, epoch);
    }
    Ok(())
}
