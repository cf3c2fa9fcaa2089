//! Checkpoint persistence
//!
//! A checkpoint is one safetensors file. Scalars live under `meta.*`, live
//! model parameters and buffers under `state_dict.*`, the EMA shadow under
//! `shadow.*` and optimizer state under `optimizer.*`. Files are written to a
//! temporary path and renamed into place. Loading is permissive: weights come
//! from `shadow` (evaluation only), then `state_dict`, then any unprefixed
//! tensors; `module.` segments are stripped and unmatched or mis-shaped keys
//! are skipped and counted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::ema::EmaShadow;
use super::optimizers::Optimizer;
use crate::error::{Error, Result};
use crate::model::SegmentationModel;

pub const META_EPOCH: &str = "meta.epoch";
pub const META_ITER: &str = "meta.iter";
pub const META_BEST_MIOU: &str = "meta.best_miou";

const STATE_DICT_PREFIX: &str = "state_dict.";
const SHADOW_PREFIX: &str = "shadow.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const META_PREFIX: &str = "meta.";
const WRAPPER_PREFIX: &str = "module.";
const EXTENSION: &str = "safetensors";

/// Scalar progress stored alongside the weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Epoch to resume at (the saved epoch + 1)
    pub epoch: usize,
    pub iter: usize,
    pub best_miou: f64,
}

/// Which section model weights were read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightSource {
    Shadow,
    StateDict,
    Raw,
}

/// What to take from a checkpoint beyond model weights on resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePolicy {
    pub restore_optimizer_state: bool,
    pub restore_progress_counters: bool,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            restore_optimizer_state: true,
            restore_progress_counters: false,
        }
    }
}

/// Outcome of assigning saved weights onto a model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub assigned: usize,
    pub unmatched: usize,
    pub shape_mismatched: usize,
    pub missing: usize,
}

/// Result of restoring a checkpoint into a trainer's parts
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub source: WeightSource,
    pub summary: LoadSummary,
    pub meta: Option<CheckpointMeta>,
    /// Entries of optimizer state restored, when it was considered
    pub optimizer_entries: Option<usize>,
    /// Counters to resume from, when the policy asked for them
    pub counters: Option<(usize, usize)>,
}

/// A checkpoint file split into its sections
#[derive(Debug, Clone, Default)]
pub struct LoadedCheckpoint {
    pub meta: Option<CheckpointMeta>,
    pub state_dict: HashMap<String, Tensor>,
    pub shadow: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, Tensor>,
    pub raw: HashMap<String, Tensor>,
}

impl LoadedCheckpoint {
    /// Split a flat tensor map by section prefix
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut loaded = Self::default();
        let mut meta = HashMap::new();

        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(STATE_DICT_PREFIX) {
                loaded.state_dict.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(SHADOW_PREFIX) {
                loaded.shadow.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(OPTIMIZER_PREFIX) {
                loaded.optimizer.insert(name.to_string(), tensor);
            } else if key.starts_with(META_PREFIX) {
                meta.insert(key, tensor);
            } else {
                loaded.raw.insert(key, tensor);
            }
        }

        loaded.meta = match (meta.get(META_EPOCH), meta.get(META_ITER)) {
            (Some(epoch), Some(iter)) => Some(CheckpointMeta {
                epoch: read_count(epoch)?,
                iter: read_count(iter)?,
                best_miou: match meta.get(META_BEST_MIOU) {
                    Some(t) => read_f64(t)?,
                    None => 0.0,
                },
            }),
            _ => None,
        };
        Ok(loaded)
    }

    /// Model weights by preference; the shadow is only used outside training
    pub fn model_weights(&self, train_mode: bool) -> (WeightSource, &HashMap<String, Tensor>) {
        if !train_mode && !self.shadow.is_empty() {
            (WeightSource::Shadow, &self.shadow)
        } else if !self.state_dict.is_empty() {
            (WeightSource::StateDict, &self.state_dict)
        } else {
            (WeightSource::Raw, &self.raw)
        }
    }
}

fn read_count(t: &Tensor) -> Result<usize> {
    let values = t.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    values
        .first()
        .map(|&v| v.max(0) as usize)
        .ok_or_else(|| Error::checkpoint("empty counter tensor"))
}

fn read_f64(t: &Tensor) -> Result<f64> {
    let values = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    values
        .first()
        .copied()
        .ok_or_else(|| Error::checkpoint("empty scalar tensor"))
}

/// Remove data-parallel wrapper segments from a parameter name
pub fn strip_wrapper_prefix(name: &str) -> String {
    name.replace(WRAPPER_PREFIX, "")
}

/// Copy matching tensors onto the model's parameters and buffers
pub fn assign_partial<M: SegmentationModel + ?Sized>(
    model: &M,
    weights: &HashMap<String, Tensor>,
) -> Result<LoadSummary> {
    let state: HashMap<String, _> = model.named_state()?.into_iter().collect();
    let mut summary = LoadSummary::default();
    let mut seen = 0;

    for (key, tensor) in weights {
        let name = strip_wrapper_prefix(key);
        match state.get(&name) {
            Some(var) if var.dims() == tensor.dims() => {
                let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
                var.set(&value)?;
                summary.assigned += 1;
                seen += 1;
            }
            Some(var) => {
                debug!(
                    "Skipping {}: checkpoint shape {:?}, model shape {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                );
                summary.shape_mismatched += 1;
                seen += 1;
            }
            None => summary.unmatched += 1,
        }
    }
    summary.missing = state.len().saturating_sub(seen);
    Ok(summary)
}

/// Writes and reads named checkpoints in one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of the checkpoint called `name`
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{}", name, EXTENSION))
    }

    /// Write checkpoint `name`; `epoch` is the current zero-based epoch
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, model, ema, optimizer))]
    pub fn save<M: SegmentationModel + ?Sized>(
        &self,
        name: &str,
        epoch: usize,
        iter: usize,
        best_miou: f64,
        model: &M,
        ema: &EmaShadow,
        optimizer: &dyn Optimizer,
    ) -> Result<PathBuf> {
        let state = model.named_state()?;
        let device = state
            .first()
            .map(|(_, v)| v.device().clone())
            .unwrap_or(Device::Cpu);

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert(META_EPOCH.to_string(), Tensor::new(&[(epoch + 1) as i64], &device)?);
        tensors.insert(META_ITER.to_string(), Tensor::new(&[iter as i64], &device)?);
        tensors.insert(META_BEST_MIOU.to_string(), Tensor::new(&[best_miou], &device)?);

        for (name, var) in state {
            tensors.insert(format!("{}{}", STATE_DICT_PREFIX, name), var.as_tensor().copy()?);
        }
        for (name, tensor) in ema.state_tensors() {
            tensors.insert(format!("{}{}", SHADOW_PREFIX, name), tensor);
        }
        for (name, tensor) in optimizer.state_tensors()? {
            tensors.insert(format!("{}{}", OPTIMIZER_PREFIX, name), tensor);
        }

        let path = self.path_for(name);
        let tmp = path.with_extension(format!("{}.tmp", EXTENSION));
        candle_core::safetensors::save(&tensors, &tmp)?;
        std::fs::rename(&tmp, &path)?;

        info!("Saved checkpoint {} ({} tensors)", path.display(), tensors.len());
        Ok(path)
    }

    /// Read and split a checkpoint file
    pub fn read<P: AsRef<Path>>(path: P, device: &Device) -> Result<LoadedCheckpoint> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::CheckpointNotFound(path.to_path_buf()));
        }
        let tensors = candle_core::safetensors::load(path, device)?;
        LoadedCheckpoint::from_tensors(tensors)
    }

    /// Load a checkpoint into the model and, on resume, the optimizer
    ///
    /// Optimizer state and counters are only considered when training and
    /// resuming; the policy then decides which of the two is taken.
    #[instrument(skip(path, model, optimizer), fields(path = %path.as_ref().display()))]
    pub fn restore<M: SegmentationModel + ?Sized, P: AsRef<Path>>(
        path: P,
        model: &M,
        optimizer: &mut dyn Optimizer,
        train_mode: bool,
        resume: bool,
        policy: ResumePolicy,
    ) -> Result<RestoreOutcome> {
        let path = path.as_ref();
        let device = model
            .named_parameters()?
            .first()
            .map(|(_, v)| v.device().clone())
            .unwrap_or(Device::Cpu);
        let loaded = Self::read(path, &device)?;

        let (source, weights) = loaded.model_weights(train_mode);
        let summary = assign_partial(model, weights)?;
        if summary.assigned == 0 {
            warn!("No tensors from {} matched the model", path.display());
        }
        info!(
            "Model loaded from {} ({:?}): {} assigned, {} unmatched, {} shape-mismatched",
            path.display(),
            source,
            summary.assigned,
            summary.unmatched,
            summary.shape_mismatched
        );

        let mut outcome = RestoreOutcome {
            source,
            summary,
            meta: loaded.meta,
            optimizer_entries: None,
            counters: None,
        };

        if !(train_mode && resume) {
            info!("Did not resume optimizer");
            return Ok(outcome);
        }

        if policy.restore_optimizer_state && !loaded.optimizer.is_empty() {
            let restored = optimizer.load_state_tensors(&loaded.optimizer)?;
            info!("Optimizer state restored ({} entries)", restored);
            outcome.optimizer_entries = Some(restored);
        }

        if let Some(meta) = loaded.meta {
            let counters = if policy.restore_progress_counters {
                (meta.epoch, meta.iter)
            } else {
                (0, 0)
            };
            info!("Resuming training from epoch {} iter {}", counters.0, counters.1);
            outcome.counters = Some(counters);
        }

        Ok(outcome)
    }
}

/// Detached, frozen copy of checkpoint weights kept for reference
#[derive(Debug, Clone)]
pub struct ReferenceWeights {
    tensors: HashMap<String, Tensor>,
}

impl ReferenceWeights {
    /// Snapshot the training-time weights of a checkpoint file
    pub fn from_file<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let loaded = CheckpointManager::read(path, device)?;
        let (_, weights) = loaded.model_weights(true);
        let tensors = weights
            .iter()
            .map(|(k, v)| Ok((strip_wrapper_prefix(k), v.detach().copy()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { tensors })
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}
