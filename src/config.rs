use std::path::PathBuf;

use tch::Device;

// =============== HYPERPARAM & PATH ===============
pub const DATA_DIR: &str = "data/oirds";
pub const OUTPUT_DIR: &str = ".";
pub const EPOCHS: usize = 25;
pub const BATCH_SIZE: usize = 128;
pub const THREADS: usize = 8;

pub const IMG_SIZE: u32 = 224;
pub const RESIZE_SIZE: u32 = 256;
pub const NUM_CLASSES: i64 = 2;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub const TRAIN_SPLIT: &str = "train";
pub const VAL_SPLIT: &str = "val";

/// Everything a run needs, resolved once before training starts.
#[derive(Debug, Clone)]
pub struct FinetuneConfig {
    /// Architecture token, validated by the model selector.
    pub architecture: String,
    /// Directory holding the `train` and `val` image folders.
    pub data_dir: PathBuf,
    /// Pretrained weights. `None` looks for `<architecture>.ot` and tolerates its absence.
    pub weights: Option<PathBuf>,
    /// Directory receiving the two model files.
    pub output_dir: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    /// Loader worker threads.
    pub threads: usize,
    pub seed: Option<u64>,
    pub force_cpu: bool,
    pub progress: bool,
}

impl FinetuneConfig {
    pub fn new(architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            data_dir: PathBuf::from(DATA_DIR),
            weights: None,
            output_dir: PathBuf::from(OUTPUT_DIR),
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            threads: THREADS,
            seed: None,
            force_cpu: false,
            progress: true,
        }
    }

    pub fn device(&self) -> Device {
        if self.force_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        }
    }

    pub fn default_weights(&self) -> PathBuf {
        PathBuf::from(format!("{}.ot", self.architecture))
    }
}
