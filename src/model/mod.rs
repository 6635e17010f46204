pub mod backbone;
pub mod blocks;
pub mod config;
pub mod head;
pub mod loss;
pub mod neck;
pub mod nms;
pub mod yolo;

pub use backbone::Backbone;
pub use config::{DetectionScale, ModelConfig};
pub use head::DetectionHead;
pub use loss::{DetectionLoss, LossWeights, YoloLoss};
pub use neck::Neck;
pub use nms::{nms, nms_passes, Detection};
pub use yolo::TextDetector;
