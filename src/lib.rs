pub mod boxes;
pub mod checkpoint;
pub mod clamp;
pub mod data;
pub mod error;
pub mod model;
pub mod postprocess;
pub mod training;
pub mod visualize;

// Re-exports for convenience
pub use boxes::{AnchorSet, BBox, Letterbox};
pub use error::{DetectionError, Result};
pub use model::{Detection, DetectionLoss, ModelConfig, TextDetector, YoloLoss};
pub use postprocess::{ImageDetections, PostProcessor};
pub use training::{Trainer, TrainingConfig};
