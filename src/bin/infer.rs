use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::prelude::*;
use clap::Parser;

use yolo_text_detection::boxes::{AnchorSet, Letterbox};
use yolo_text_detection::checkpoint::{self, CheckpointMeta};
use yolo_text_detection::data::transforms::{chw_to_image, letterbox_to_chw};
use yolo_text_detection::postprocess::PostProcessor;
use yolo_text_detection::visualize::{render_detections, save_image};

type MyBackend = NdArray;

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect text regions in one image", long_about = None)]
struct Args {
    /// Input image; prompted for on stdin when omitted
    #[arg(short, long)]
    image: Option<String>,

    /// Checkpoint directory (holds checkpoint.json)
    #[arg(short = 'w', long, default_value = "runs/text_detection/best")]
    checkpoint: PathBuf,

    /// Anchor boxes JSON; defaults to the anchors stored in the checkpoint
    #[arg(short, long)]
    anchors: Option<PathBuf>,

    /// Confidence threshold
    #[arg(short, long, default_value_t = 0.5)]
    conf: f32,

    /// NMS IoU thresholds, applied in order
    #[arg(long, value_delimiter = ',', default_value = "0.7,0.3")]
    nms: Vec<f32>,

    /// Directory for the annotated images
    #[arg(short, long, default_value = "runs/inference")]
    output: PathBuf,
}

/// Removes one pair of matching surrounding quotes, as left by shells and
/// file managers when pasting a path.
fn strip_quotes(raw: &str) -> &str {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    trimmed
}

fn prompt_path() -> anyhow::Result<String> {
    print!("Please enter the image path: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

fn output_path(dir: &Path, image: &Path, suffix: &str) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    dir.join(format!("{}_{}.png", stem, suffix))
}

/// Anchors from `--anchors` when given, otherwise the checkpoint's own. Either
/// way there must be one group per active scale of the loaded model.
fn resolve_anchors(path: Option<&Path>, meta: &CheckpointMeta) -> anyhow::Result<AnchorSet> {
    let anchors = match (path, meta.anchor_set()?) {
        (Some(path), _) => AnchorSet::from_json(path, meta.model_config.anchors_per_scale)
            .with_context(|| format!("loading anchors {}", path.display()))?,
        (None, Some(stored)) => stored,
        (None, None) => bail!("checkpoint stores no anchors; pass --anchors"),
    };
    anchors
        .check_scales(meta.model_config.scales().len())
        .with_context(|| format!("anchors do not fit scales {:?}", meta.model_config.scales()))?;
    Ok(anchors)
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let raw = match &args.image {
        Some(image) => image.clone(),
        None => prompt_path()?,
    };
    let image_path = PathBuf::from(strip_quotes(&raw));
    if image_path.as_os_str().is_empty() {
        bail!("no image path given");
    }

    let device = NdArrayDevice::default();

    println!("Loading checkpoint {}...", args.checkpoint.display());
    let (model, meta) = checkpoint::load::<MyBackend>(&args.checkpoint, &device)
        .with_context(|| format!("loading checkpoint {}", args.checkpoint.display()))?;
    let anchors = resolve_anchors(args.anchors.as_deref(), &meta)?;

    println!("Loading image: {}", image_path.display());
    let img = image::open(&image_path)
        .with_context(|| format!("opening {}", image_path.display()))?
        .to_rgb8();
    let (orig_w, orig_h) = img.dimensions();
    let canvas = meta.desired_size;
    let letterbox = Letterbox::centered(orig_w, orig_h, canvas)?;
    println!(
        "Original size: {}x{}, canvas {}x{}, scale {:.4}",
        orig_w, orig_h, canvas, canvas, letterbox.scale_x
    );

    let pixels = letterbox_to_chw(&img, &letterbox, &meta.normalization);
    let input = Tensor::<MyBackend, 4>::from_data(
        TensorData::new(pixels.clone(), [1, 3, canvas as usize, canvas as usize]),
        &device,
    );
    model.check_input(&input)?;

    println!("Running inference...");
    let outputs = model.forward(input);
    let postprocess = PostProcessor::new(args.conf, args.nms.clone(), canvas as usize);
    let detections = postprocess
        .process(&outputs, &anchors, &[letterbox])?
        .pop()
        .unwrap_or_default();

    println!("Found {} text region(s)", detections.original.len());
    for (i, det) in detections.original.iter().enumerate() {
        let b = det.bbox;
        println!(
            "  {}. [{:.1}, {:.1}, {:.1}, {:.1}] confidence {:.2}%",
            i + 1,
            b.x1,
            b.y1,
            b.x2,
            b.y2,
            det.confidence * 100.0
        );
    }

    let canvas_img = chw_to_image(&pixels, canvas, canvas, &meta.normalization)?;
    let canvas_path = output_path(&args.output, &image_path, "canvas");
    save_image(&render_detections(&canvas_img, &detections.canvas, &[]), &canvas_path)?;
    println!("Image of bounding boxes taken, stored in path:");
    println!("{}", canvas_path.display());

    let original_path = output_path(&args.output, &image_path, "detections");
    save_image(&render_detections(&img, &detections.original, &[]), &original_path)?;
    println!("Image of bounding boxes taken, stored in path:");
    println!("{}", original_path.display());

    Ok(())
}
