use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use yolo_text_detection::data::ocr::{export_crops, DEFAULT_CHARSET};
use yolo_text_detection::data::TextOcrAnnotations;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cut annotated text lines out of TextOCR images", long_about = None)]
struct Args {
    /// TextOCR annotation JSON
    #[arg(short, long)]
    annotations: PathBuf,

    /// Directory holding the annotated images
    #[arg(short, long)]
    images: PathBuf,

    /// Output directory, one `<annotation id>.png` per line
    #[arg(short, long)]
    output: PathBuf,

    /// Characters kept after accent removal
    #[arg(long, default_value = DEFAULT_CHARSET)]
    charset: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    println!("Text line cropper");
    println!("=================\n");
    println!("Annotations: {}", args.annotations.display());
    println!("Images: {}", args.images.display());
    println!("Output: {}\n", args.output.display());

    let annotations = TextOcrAnnotations::load(&args.annotations)
        .with_context(|| format!("loading {}", args.annotations.display()))?;
    let written = export_crops(&annotations, &args.images, &args.output, &args.charset)
        .context("exporting crops")?;

    println!("Wrote {} crops to {}", written, args.output.display());
    Ok(())
}
