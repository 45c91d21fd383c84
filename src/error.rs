use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

/// Errors produced while building vocabularies, loading data, constructing
/// models or reading checkpoints.
///
/// The type is `Clone` so that batches can carry a failed image load through
/// burn's data loader workers.
#[derive(Error, Debug, Clone)]
pub enum CaptionError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown {kind} variant '{tag}'")]
    UnknownVariant { kind: &'static str, tag: String },

    #[error("token id {id} is out of range for a vocabulary of {len} entries")]
    TokenOutOfRange { id: usize, len: usize },

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("failed to decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: Arc<image::ImageError>,
    },

    #[error("corpus parse error: {0}")]
    Csv(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl CaptionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

impl From<csv::Error> for CaptionError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err.to_string())
    }
}

impl From<serde_json::Error> for CaptionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaptionError>;
