//! Fine-tunes a pretrained ResNet-18 or AlexNet into a two-class image
//! classifier trained on `train`/`val` image folders.
pub mod app;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod persist;
pub mod train;

pub use app::{run, RunSummary};
pub use config::FinetuneConfig;
pub use error::{FinetuneError, Result};
pub use model::{Architecture, FineTuneModel, OptimizerSpec, Snapshot};
