use std::io;
use std::path::PathBuf;

use safetensors::SafeTensorError;
use tch::TchError;
use thiserror::Error;

/// Main library error type.
#[derive(Error, Debug)]
pub enum FinetuneError {
    /// Architecture token that the model selector does not know.
    #[error("Model not supported! ({0})")]
    UnsupportedModel(String),

    /// A split directory (`train`, `val`) does not exist.
    #[error("split directory not found: {}", .0.display())]
    MissingSplit(PathBuf),

    /// A split directory holds no usable image.
    #[error("no image found in split '{0}'")]
    EmptySplit(String),

    /// The training split does not have the expected number of classes.
    #[error("expected {expected} classes, found {}: {found:?}", .found.len())]
    ClassCount { expected: usize, found: Vec<String> },

    /// A validation class directory that the training split does not have.
    #[error("class '{class}' of split '{split}' is not a training class")]
    UnknownClass { split: String, class: String },

    /// Image decoding failure.
    #[error("cannot read image {}: {source}", .path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Pretrained weights file given explicitly but absent.
    #[error("weights file not found: {}", .0.display())]
    MissingWeights(PathBuf),

    /// Malformed model definition or weights content.
    #[error("invalid model file: {0}")]
    ModelDef(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Errors returned by libtorch.
    #[error(transparent)]
    Torch(#[from] TchError),

    /// Safetensors container error.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] SafeTensorError),

    /// Model definition metadata encoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Loader worker pool could not be started.
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, FinetuneError>;
