use log::{info, warn};

use crate::config::FinetuneConfig;
use crate::data::DataContext;
use crate::error::{FinetuneError, Result};
use crate::model::{Architecture, FineTuneModel};
use crate::persist::{self, ArtifactPaths, ModelInfo};
use crate::train::{train_model, TrainOutcome, TrainSettings};

#[derive(Debug)]
pub struct RunSummary {
    pub architecture: Architecture,
    pub classes: Vec<String>,
    pub outcome: TrainOutcome,
    pub artifacts: ArtifactPaths,
}

fn load_weights(model: &mut FineTuneModel, config: &FinetuneConfig) -> Result<()> {
    match &config.weights {
        Some(path) if !path.exists() => Err(FinetuneError::MissingWeights(path.clone())),
        Some(path) => model.load_pretrained(path).map(|_| ()),
        None => {
            let path = config.default_weights();
            if path.exists() {
                model.load_pretrained(&path).map(|_| ())
            } else {
                warn!("pretrained file not found: {}, starting from scratch", path.display());
                Ok(())
            }
        }
    }
}

/// Selects the model, trains it and writes the best one to disk.
pub fn run(config: &FinetuneConfig) -> Result<RunSummary> {
    let architecture: Architecture = config.architecture.parse()?;

    let device = config.device();
    if let Some(seed) = config.seed {
        tch::manual_seed(seed as i64);
    }
    info!("using device {device:?}");

    println!("Load pre-trained model, {architecture}");
    let mut model = FineTuneModel::new(architecture, device);
    let optimizer_spec = architecture.optimizer();
    let mut optimizer = optimizer_spec.build(model.var_store())?;

    let mut data = DataContext::open(config, device)?;
    load_weights(&mut model, config)?;
    println!("{model}");
    info!("optimizer {optimizer_spec}");

    println!("Training model:");
    let settings = TrainSettings { epochs: config.epochs, progress: config.progress };
    let outcome = train_model(&mut model, &mut optimizer, &mut data, &settings)?;

    match &outcome.best {
        Some(best) => best.restore(&mut model)?,
        None => warn!("validation accuracy never improved, keeping the last model"),
    }
    model.set_train(false);

    let artifacts = ArtifactPaths::new(architecture, &config.output_dir);
    let info = ModelInfo {
        architecture,
        classes: data.classes.clone(),
        best_acc: outcome.best_acc,
    };
    persist::save(&model, &info, &artifacts)?;

    Ok(RunSummary { architecture, classes: data.classes, outcome, artifacts })
}
