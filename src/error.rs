use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DetectionError>;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error("invalid anchor configuration: {0}")]
    InvalidAnchors(String),

    #[error("degenerate polygon with {0} point(s); at least 2 are required")]
    DegeneratePolygon(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("data loader error: {0}")]
    DataLoader(String),

    #[error("no samples were accumulated for {0}")]
    EmptyEpoch(&'static str),
}

impl DetectionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    pub fn shape(context: &'static str, expected: impl ToString, actual: impl ToString) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
