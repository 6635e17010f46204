pub mod annotations;
pub mod collate;
pub mod dataloader;
pub mod dataset;
pub mod ocr;
pub mod transforms;

pub use annotations::{Annotation, TextOcrAnnotations};
pub use collate::{pad_batch, pad_boxes, Batch, PaddedBoxes};
pub use dataloader::{BatchIter, DetectionDataLoader, LoaderOptions};
pub use dataset::{split_by_scale, DatasetOptions, DetectionDataset, DetectionSample};
pub use ocr::{OcrLineDataset, OcrSample};
pub use transforms::{directory_stats, ChannelStats, Normalization, RandomRotation};
