//! Writing and reading the fine-tuned model files.
//!
//! `modelDef-<arch>.pth` is a safetensors container holding every variable,
//! batch-norm running statistics included. Its metadata names the
//! architecture and classes, so it can be turned back into a model.
//! `finemodel-<arch>.pth` is the bare state: the same variables in libtorch's
//! `save_multi` format, read back with [`load_state`].
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use bytemuck::cast_slice;
use log::info;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use tch::{Device, Kind, Tensor};

use crate::error::{FinetuneError, Result};
use crate::model::{safetensors_to_map, try_copy, Architecture, FineTuneModel};

const META_ARCHITECTURE: &str = "architecture";
const META_NUM_CLASSES: &str = "num_classes";
const META_CLASSES: &str = "classes";
const META_BEST_ACC: &str = "best_acc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub model_def: PathBuf,
    pub state: PathBuf,
}

impl ArtifactPaths {
    pub fn new(architecture: Architecture, dir: &Path) -> Self {
        Self {
            model_def: dir.join(architecture.model_def_file()),
            state: dir.join(architecture.state_file()),
        }
    }
}

/// What the model definition file records besides the tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub architecture: Architecture,
    pub classes: Vec<String>,
    pub best_acc: f64,
}

/// Writes both files, replacing whatever is already there.
pub fn save(model: &FineTuneModel, info: &ModelInfo, paths: &ArtifactPaths) -> Result<()> {
    for path in [&paths.model_def, &paths.state] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
    }
    save_model_def(model, info, &paths.model_def)?;
    save_state(model, &paths.state)?;
    info!("saved {} and {}", paths.model_def.display(), paths.state.display());
    Ok(())
}

pub fn save_model_def(model: &FineTuneModel, info: &ModelInfo, path: &Path) -> Result<()> {
    let vars: BTreeMap<String, Tensor> = model.var_store().variables().into_iter().collect();

    let mut buffers: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::with_capacity(vars.len());
    for (name, t) in vars.iter() {
        let shape: Vec<usize> = t.size().iter().map(|&d| d as usize).collect();
        let flat = t.detach().to_device(Device::Cpu).to_kind(Kind::Float).reshape([-1]);
        let values = Vec::<f32>::try_from(&flat)?;
        buffers.push((name.clone(), shape, values));
    }

    let views = buffers
        .iter()
        .map(|(name, shape, values)| -> Result<(&str, TensorView<'_>)> {
            Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), cast_slice(values))?))
        })
        .collect::<Result<Vec<_>>>()?;

    let metadata: HashMap<String, String> = HashMap::from([
        (META_ARCHITECTURE.to_string(), info.architecture.name().to_string()),
        (META_NUM_CLASSES.to_string(), info.classes.len().to_string()),
        (META_CLASSES.to_string(), serde_json::to_string(&info.classes)?),
        (META_BEST_ACC.to_string(), info.best_acc.to_string()),
    ]);

    safetensors::serialize_to_file(views, &Some(metadata), path)?;
    Ok(())
}

pub fn save_state(model: &FineTuneModel, path: &Path) -> Result<()> {
    let named: Vec<(String, Tensor)> = model
        .var_store()
        .variables()
        .into_iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .collect();
    Tensor::save_multi(&named, path)?;
    Ok(())
}

/// Rebuilds a model of the given architecture from a state file.
pub fn load_state(path: &Path, architecture: Architecture, device: Device) -> Result<FineTuneModel> {
    let named = Tensor::load_multi(path)?;
    let model = FineTuneModel::new(architecture, device);
    copy_all(&model, named.iter().map(|(name, t)| (name, t)))?;
    Ok(model)
}

/// Copies every named tensor into the model. Names and count must match exactly.
fn copy_all<'a, S, I>(model: &FineTuneModel, src: I) -> Result<()>
where
    S: AsRef<str> + 'a,
    I: ExactSizeIterator<Item = (&'a S, &'a Tensor)>,
{
    let architecture = model.architecture();
    let mut vars = model.var_store().variables();
    if src.len() != vars.len() {
        return Err(FinetuneError::ModelDef(format!(
            "{} tensors in file, {} variables in {architecture}",
            src.len(),
            vars.len()
        )));
    }
    for (name, t) in src {
        let name = name.as_ref();
        if !try_copy(&mut vars, name, t)? {
            return Err(FinetuneError::ModelDef(format!("variable {name} does not fit {architecture}")));
        }
    }
    Ok(())
}

fn metadata_field<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| FinetuneError::ModelDef(format!("missing metadata field '{key}'")))
}

/// Rebuilds a model from a model definition file.
pub fn load_model_def(path: &Path, device: Device) -> Result<(FineTuneModel, ModelInfo)> {
    let bytes = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| FinetuneError::ModelDef("no metadata header".to_string()))?;

    let architecture: Architecture = metadata_field(metadata, META_ARCHITECTURE)?.parse()?;
    let classes: Vec<String> = serde_json::from_str(metadata_field(metadata, META_CLASSES)?)?;
    let best_acc: f64 = metadata_field(metadata, META_BEST_ACC)?
        .parse()
        .map_err(|e| FinetuneError::ModelDef(format!("bad best_acc: {e}")))?;

    let model = FineTuneModel::new(architecture, device);
    let st = SafeTensors::deserialize(&bytes)?;
    let src = safetensors_to_map(&st)?;
    copy_all(&model, src.iter())?;

    Ok((model, ModelInfo { architecture, classes, best_acc }))
}
