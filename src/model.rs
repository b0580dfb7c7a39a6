//! Model selection: pretrained backbones with a fresh two-class head.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use half::{bf16, f16};
use log::{debug, info};
use safetensors::{tensor::Dtype, SafeTensors};
use tch::nn::{self, ModuleT, OptimizerConfig};
use tch::vision::{alexnet, resnet};
use tch::{Device, Kind, Tensor};

use crate::config::NUM_CLASSES;
use crate::error::{FinetuneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Resnet18,
    Alexnet,
}

impl FromStr for Architecture {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resnet18" => Ok(Architecture::Resnet18),
            "alexnet" => Ok(Architecture::Alexnet),
            other => Err(FinetuneError::UnsupportedModel(other.to_string())),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Architecture {
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Resnet18 => "resnet18",
            Architecture::Alexnet => "alexnet",
        }
    }

    /// Variable path of the final classification layer.
    pub fn head(self) -> &'static str {
        match self {
            Architecture::Resnet18 => "fc",
            Architecture::Alexnet => "classifier.6",
        }
    }

    pub fn model_def_file(self) -> String {
        format!("modelDef-{}.pth", self.name())
    }

    pub fn state_file(self) -> String {
        format!("finemodel-{}.pth", self.name())
    }

    /// Adam with default settings for ResNet-18, momentum SGD for AlexNet.
    pub fn optimizer(self) -> OptimizerSpec {
        match self {
            Architecture::Resnet18 => OptimizerSpec::Adam { lr: 1e-3 },
            Architecture::Alexnet => OptimizerSpec::Sgd { lr: 0.01, momentum: 0.9 },
        }
    }

    fn build(self, p: &nn::Path, num_classes: i64) -> Box<dyn ModuleT> {
        match self {
            Architecture::Resnet18 => Box::new(resnet::resnet18(p, num_classes)),
            Architecture::Alexnet => Box::new(alexnet::alexnet(p, num_classes)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerSpec {
    Adam { lr: f64 },
    Sgd { lr: f64, momentum: f64 },
}

impl OptimizerSpec {
    pub fn learning_rate(&self) -> f64 {
        match *self {
            OptimizerSpec::Adam { lr } | OptimizerSpec::Sgd { lr, .. } => lr,
        }
    }

    pub fn build(&self, vs: &nn::VarStore) -> Result<nn::Optimizer> {
        let opt = match *self {
            OptimizerSpec::Adam { lr } => nn::Adam::default().build(vs, lr)?,
            OptimizerSpec::Sgd { lr, momentum } => {
                nn::Sgd { momentum, ..Default::default() }.build(vs, lr)?
            }
        };
        Ok(opt)
    }
}

impl fmt::Display for OptimizerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerSpec::Adam { lr } => write!(f, "Adam(lr={lr})"),
            OptimizerSpec::Sgd { lr, momentum } => write!(f, "SGD(lr={lr}, momentum={momentum})"),
        }
    }
}

/// A network, its variables and its train/eval switch.
#[derive(Debug)]
pub struct FineTuneModel {
    architecture: Architecture,
    vs: nn::VarStore,
    net: Box<dyn ModuleT>,
    train: bool,
}

impl FineTuneModel {
    pub fn new(architecture: Architecture, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let net = architecture.build(&vs.root(), NUM_CLASSES);
        Self { architecture, vs, net, train: false }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    pub fn is_train(&self) -> bool {
        self.train
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        self.net.forward_t(xs, self.train)
    }

    /// `[out_features, in_features]` of the classification head.
    pub fn head_shape(&self) -> Option<Vec<i64>> {
        self.vs
            .variables()
            .get(&format!("{}.weight", self.architecture.head()))
            .map(|t| t.size())
    }

    pub fn num_parameters(&self) -> i64 {
        self.vs.trainable_variables().iter().map(|t| t.numel() as i64).sum()
    }

    /// Copies every pretrained tensor whose name and shape match. The replaced
    /// head keeps its fresh initialisation.
    pub fn load_pretrained(&mut self, path: &Path) -> Result<usize> {
        let src = load_weights_map(path)?;
        let mut tgt_vars = self.vs.variables();

        let mut copied = 0usize;
        let mut skipped = Vec::new();
        for (key, t) in src.iter() {
            let Some(name) = normalize_key(key) else { continue };
            if try_copy(&mut tgt_vars, &name, t)? {
                copied += 1;
            } else {
                skipped.push(name);
            }
        }

        if copied == 0 {
            return Err(FinetuneError::ModelDef(format!(
                "no tensors copied from '{}'",
                path.display()
            )));
        }
        skipped.sort();
        debug!("not copied from pretrained weights: {skipped:?}");
        info!(
            "loaded pretrained {} (copied {copied}/{}) from {}",
            self.architecture,
            tgt_vars.len(),
            path.display()
        );
        Ok(copied)
    }
}

impl fmt::Display for FineTuneModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars: BTreeMap<String, Tensor> = self.vs.variables().into_iter().collect();
        writeln!(f, "{} (", self.architecture)?;
        for (name, t) in vars.iter() {
            writeln!(f, "  {name}: {:?}", t.size())?;
        }
        writeln!(f, ")")?;
        if let Some(head) = self.head_shape() {
            writeln!(f, "head {}: {} -> {}", self.architecture.head(), head[1], head[0])?;
        }
        write!(f, "trainable parameters: {}", self.num_parameters())
    }
}

/// Independent deep copy of every variable of a model.
#[derive(Debug)]
pub struct Snapshot {
    tensors: Vec<(String, Tensor)>,
}

impl Snapshot {
    pub fn capture(model: &FineTuneModel) -> Self {
        let mut tensors: Vec<(String, Tensor)> = tch::no_grad(|| {
            model
                .vs
                .variables()
                .into_iter()
                .map(|(name, t)| (name, t.detach().copy()))
                .collect()
        });
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        Self { tensors }
    }

    pub fn restore(&self, model: &mut FineTuneModel) -> Result<()> {
        let mut vars = model.vs.variables();
        for (name, src) in self.tensors.iter() {
            let dst = vars.get_mut(name).ok_or_else(|| {
                FinetuneError::ModelDef(format!("snapshot variable {name} is not in the model"))
            })?;
            tch::no_grad(|| dst.f_copy_(src))?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

// =============== PRETRAINED WEIGHTS ===============
fn read_pod<T: bytemuck::Pod>(data: &[u8]) -> Vec<T> {
    match bytemuck::try_cast_slice::<u8, T>(data) {
        Ok(slice) => slice.to_vec(),
        Err(_) => data
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect(),
    }
}

pub(crate) fn safetensors_to_map(st: &SafeTensors<'_>) -> Result<HashMap<String, Tensor>> {
    let mut map: HashMap<String, Tensor> = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name)?;
        let shape_i64: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        let t = match tv.dtype() {
            Dtype::F32 => Tensor::from_slice(&read_pod::<f32>(data)),
            Dtype::F16 => {
                let vec_f32: Vec<f32> =
                    read_pod::<u16>(data).into_iter().map(|h| f16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&vec_f32)
            }
            Dtype::BF16 => {
                let vec_f32: Vec<f32> =
                    read_pod::<u16>(data).into_iter().map(|h| bf16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&vec_f32)
            }
            Dtype::I64 => Tensor::from_slice(&read_pod::<i64>(data)),
            Dtype::I32 => Tensor::from_slice(&read_pod::<i32>(data)).to_kind(Kind::Int),
            other => {
                debug!("skipping tensor {name} with unsupported dtype {other:?}");
                continue;
            }
        };

        map.insert(name.to_string(), t.reshape(&shape_i64));
    }
    Ok(map)
}

fn load_weights_map(path: &Path) -> Result<HashMap<String, Tensor>> {
    let is_safetensors = path.extension().and_then(|e| e.to_str()) == Some("safetensors");
    if is_safetensors {
        let bytes = fs::read(path)?;
        let st = SafeTensors::deserialize(&bytes)?;
        safetensors_to_map(&st)
    } else {
        Ok(Tensor::load_multi(path)?.into_iter().collect())
    }
}

/// Strips a data-parallel `module.` prefix and drops batch counters.
fn normalize_key(key: &str) -> Option<String> {
    let key = key.strip_prefix("module.").unwrap_or(key);
    if key.ends_with("num_batches_tracked") {
        return None;
    }
    Some(key.to_string())
}

/// Copies `src` into the variable `name` when it exists with the same shape.
pub(crate) fn try_copy(dst: &mut HashMap<String, Tensor>, name: &str, src: &Tensor) -> Result<bool> {
    if let Some(d) = dst.get_mut(name) {
        if d.size() == src.size() {
            tch::no_grad(|| d.f_copy_(src))?;
            return Ok(true);
        }
    }
    Ok(false)
}
