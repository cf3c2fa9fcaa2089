//! Training configuration for source-to-target adaptation runs
//!
//! This module provides the configuration record for the trainer, including
//! data sources, optimization settings, loss weights, pseudo-label thresholds,
//! EMA behaviour, validation cadence and checkpointing policy. Every field has
//! a default; files may be YAML or JSON.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::data::{DatasetName, DatasetRole};
use crate::error::{Error, Result};

/// Main trainer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Run name, used for the metrics file and log lines
    pub name: String,

    /// Train (`true`) or evaluate a checkpoint (`false`)
    pub train: bool,

    /// Source and target data
    pub data: DataConfig,

    /// Model settings
    pub model: ModelConfig,

    /// Optimization settings
    pub optimizer: OptimizerConfig,

    /// Loss weights and perturbation toggles
    pub losses: LossConfig,

    /// Pseudo-label thresholds
    pub pseudo_labels: PseudoLabelConfig,

    /// EMA shadow settings
    pub ema: EmaConfig,

    /// Validation cadence
    pub validation: ValidationConfig,

    /// Checkpoint location and resume policy
    pub checkpointing: CheckpointingConfig,

    /// Logging and metrics output
    pub logging: LoggingConfig,

    /// Device and seed
    pub runtime: RuntimeConfig,
}

/// One dataset binding: a registered dataset name plus file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSpec {
    /// Registered dataset name (e.g. `gta5`, `cityscapes`)
    pub dataset: String,

    /// Training split file
    pub train_path: PathBuf,

    /// Validation split file
    pub val_path: Option<PathBuf>,

    /// Labels follow the 16-class protocol (evaluation also reports the
    /// 13-class subset); source and target must agree
    pub class_16: bool,
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Labeled source domain
    pub source: DatasetSpec,

    /// Unlabeled target domain
    pub target: DatasetSpec,

    /// Number of segmentation classes
    pub num_classes: usize,

    /// Batch size for both domains
    pub batch_size: usize,

    /// Shuffle training splits every pass
    pub shuffle: bool,

    /// Cap on batches when validating on the source domain
    pub source_val_iterations: usize,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Pretrained or resumable checkpoint to load before training
    pub checkpoint: Option<PathBuf>,

    /// Keep a frozen copy of the checkpoint weights alongside the live model
    pub keep_reference: bool,

    /// Target selector passed to every forward call
    pub num_target: usize,

    /// Channel width of the reference network
    pub width: usize,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer kind: `SGD` or `Adam`
    pub kind: String,

    /// Base learning rate
    pub lr: f64,

    /// SGD momentum
    pub momentum: f64,

    /// L2 weight decay
    pub weight_decay: f64,

    /// Adam beta coefficients
    pub betas: (f64, f64),

    /// Adam epsilon
    pub epsilon: f64,

    /// Polynomial decay power
    pub poly_power: f64,

    /// Iteration budget
    pub iterations: usize,

    /// Learning-rate multiplier for the second parameter group
    pub head_lr_factor: f64,
}

/// Image fed to the original pseudo-label pass and the consistency perturbations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PseudoLabelInput {
    /// The raw target batch
    Target,
    /// The self-best hybrid image
    Hybrid,
}

/// Loss weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Apply auxiliary-head losses
    pub aux: bool,

    /// Auxiliary-head loss weight
    pub lam_aux: f64,

    /// Self-best self-training weight
    pub lam_new: f64,

    /// Augmentation consistency weight (0 disables)
    pub lam_aug: f64,

    /// Fourier consistency weight (0 disables)
    pub lam_fourier: f64,

    /// CutMix consistency weight (0 disables)
    pub lam_cutmix: f64,

    /// Fourier-mix source images toward target style before the source loss
    pub source_fourier: bool,

    /// Low-frequency window size for Fourier mixing
    pub fourier_beta: f64,

    /// Input of the original pseudo-label pass
    pub original_pass_input: PseudoLabelInput,
}

/// Pseudo-label thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudoLabelConfig {
    /// Threshold of the self-best policy
    pub pseudobest_threshold: f64,

    /// Threshold of the original policy
    pub pseudolabel_threshold: f64,
}

/// When shadow buffers are refreshed from live running statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BufferSync {
    /// After every completed step
    EveryStep,
    /// After every `n` completed steps
    EveryNSteps { n: usize },
    /// Once per pass over the data
    EpochEnd,
}

/// EMA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaConfig {
    /// Decay applied to the shadow each step
    pub decay: f64,

    /// Ramp the decay up over the first steps
    pub warmup: bool,

    /// Buffer refresh cadence
    pub buffer_sync: BufferSync,

    /// Re-seed the shadow from live weights after loading a checkpoint
    pub resync_on_load: bool,
}

/// Validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Validate every `interval` batches within a pass
    pub interval: usize,

    /// Send sample images to the metrics sink every N validation batches
    pub image_log_interval: usize,
}

/// Checkpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Directory for `best` and `final` checkpoints
    pub output_dir: PathBuf,

    /// Resume optimizer/progress from `model.checkpoint`
    pub resume: bool,

    /// Restore optimizer state on resume
    pub restore_optimizer_state: bool,

    /// Restore epoch/iteration counters on resume
    pub restore_progress_counters: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit an info line every N batches
    pub log_every: usize,

    /// Append scalar metrics as JSON lines to this file
    pub metrics_file: Option<PathBuf>,
}

/// Device selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda { ordinal: usize },
    Metal { ordinal: usize },
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Compute device
    pub device: DeviceType,

    /// Seed for shuffling and perturbations
    pub seed: u64,
}

/// Supported optimizer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl OptimizerKind {
    /// Parse an optimizer kind, failing on anything unknown
    pub fn parse(kind: &str) -> Result<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            other => Err(Error::config(format!("unknown optimizer kind '{}'", other))),
        }
    }
}

impl DeviceType {
    /// Open the configured device
    pub fn open(&self) -> Result<Device> {
        Ok(match *self {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda { ordinal } => Device::new_cuda(ordinal)?,
            DeviceType::Metal { ordinal } => Device::new_metal(ordinal)?,
        })
    }
}

impl LossConfig {
    /// Whether any consistency term is active
    pub fn any_consistency(&self) -> bool {
        self.lam_aug > 0.0 || self.lam_fourier > 0.0 || self.lam_cutmix > 0.0
    }
}

impl TrainerConfig {
    /// Load configuration from a YAML or JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Parsed optimizer kind
    pub fn optimizer_kind(&self) -> Result<OptimizerKind> {
        OptimizerKind::parse(&self.optimizer.kind)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.optimizer_kind()?;

        let source = DatasetName::parse(&self.data.source.dataset)?;
        if source.role() != DatasetRole::Source {
            return Err(Error::config(format!(
                "dataset '{}' cannot be used as a source domain",
                self.data.source.dataset
            )));
        }
        let target = DatasetName::parse(&self.data.target.dataset)?;
        if target.role() != DatasetRole::Target {
            return Err(Error::config(format!(
                "dataset '{}' cannot be used as a target domain",
                self.data.target.dataset
            )));
        }

        if self.data.num_classes == 0 {
            return Err(Error::config("Number of classes must be greater than 0"));
        }
        if self.data.source.class_16 != self.data.target.class_16 {
            return Err(Error::config("class_16 must be set on both source and target or on neither"));
        }
        if self.data.class_16() && self.data.num_classes != 16 {
            return Err(Error::config(format!(
                "class_16 requires num_classes = 16, got {}",
                self.data.num_classes
            )));
        }
        if self.data.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if self.optimizer.lr <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }
        if self.optimizer.iterations == 0 {
            return Err(Error::config("Iteration budget must be greater than 0"));
        }
        if self.optimizer.poly_power <= 0.0 {
            return Err(Error::config("Polynomial decay power must be positive"));
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            return Err(Error::config("Momentum must be in [0.0, 1.0)"));
        }
        if self.ema.decay <= 0.0 || self.ema.decay >= 1.0 {
            return Err(Error::config("EMA decay must be in (0.0, 1.0)"));
        }
        if let BufferSync::EveryNSteps { n: 0 } = self.ema.buffer_sync {
            return Err(Error::config("Buffer sync interval must be greater than 0"));
        }

        for (name, threshold) in [
            ("pseudobest_threshold", self.pseudo_labels.pseudobest_threshold),
            ("pseudolabel_threshold", self.pseudo_labels.pseudolabel_threshold),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(Error::config(format!("{} must be in [0.0, 1.0]", name)));
            }
        }

        for (name, weight) in [
            ("lam_aux", self.losses.lam_aux),
            ("lam_new", self.losses.lam_new),
            ("lam_aug", self.losses.lam_aug),
            ("lam_fourier", self.losses.lam_fourier),
            ("lam_cutmix", self.losses.lam_cutmix),
        ] {
            if weight < 0.0 || !weight.is_finite() {
                return Err(Error::config(format!("{} must be a non-negative number", name)));
            }
        }
        if self.losses.fourier_beta <= 0.0 || self.losses.fourier_beta > 0.5 {
            return Err(Error::config("fourier_beta must be in (0.0, 0.5]"));
        }

        if self.validation.interval == 0 {
            return Err(Error::config("Validation interval must be greater than 0"));
        }
        if self.logging.log_every == 0 {
            return Err(Error::config("log_every must be greater than 0"));
        }

        Ok(())
    }
}

impl DataConfig {
    /// 16-class evaluation mode, taken from the source binding
    pub fn class_16(&self) -> bool {
        self.source.class_16
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            name: "gta5_to_cityscapes".to_string(),
            train: true,
            data: DataConfig::default(),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            losses: LossConfig::default(),
            pseudo_labels: PseudoLabelConfig::default(),
            ema: EmaConfig::default(),
            validation: ValidationConfig::default(),
            checkpointing: CheckpointingConfig::default(),
            logging: LoggingConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for DatasetSpec {
    fn default() -> Self {
        Self {
            dataset: "gta5".to_string(),
            train_path: PathBuf::from("data/gta5_train.safetensors"),
            val_path: Some(PathBuf::from("data/gta5_val.safetensors")),
            class_16: false,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: DatasetSpec::default(),
            target: DatasetSpec {
                dataset: "cityscapes".to_string(),
                train_path: PathBuf::from("data/cityscapes_train.safetensors"),
                val_path: Some(PathBuf::from("data/cityscapes_val.safetensors")),
                class_16: false,
            },
            num_classes: 19,
            batch_size: 1,
            shuffle: true,
            source_val_iterations: 100,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            keep_reference: false,
            num_target: 1,
            width: 32,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: "SGD".to_string(),
            lr: 2.5e-4,
            momentum: 0.9,
            weight_decay: 5e-4,
            betas: (0.9, 0.99),
            epsilon: 1e-8,
            poly_power: 0.9,
            iterations: 100_000,
            head_lr_factor: 10.0,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            aux: true,
            lam_aux: 0.1,
            lam_new: 1.0,
            lam_aug: 0.1,
            lam_fourier: 0.0,
            lam_cutmix: 0.0,
            source_fourier: false,
            fourier_beta: 0.01,
            original_pass_input: PseudoLabelInput::Target,
        }
    }
}

impl Default for PseudoLabelConfig {
    fn default() -> Self {
        Self {
            pseudobest_threshold: 0.9,
            pseudolabel_threshold: 0.0,
        }
    }
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            decay: 0.999,
            warmup: false,
            buffer_sync: BufferSync::EveryStep,
            resync_on_load: true,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            interval: 200,
            image_log_interval: 300,
        }
    }
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("checkpoints"),
            resume: false,
            restore_optimizer_state: true,
            restore_progress_counters: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_every: 100,
            metrics_file: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceType::Cpu,
            seed: 42,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_optimizer_kind_fails() {
        let mut config = TrainerConfig::default();
        config.optimizer.kind = "RMSprop".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_dataset_fails() {
        let mut config = TrainerConfig::default();
        config.data.target.dataset = "kitti".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_target_dataset_in_source_role_fails() {
        let mut config = TrainerConfig::default();
        config.data.source.dataset = "cityscapes".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_threshold_range_checked() {
        let mut config = TrainerConfig::default();
        config.pseudo_labels.pseudobest_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_optimizer_kind_is_case_insensitive() {
        assert_eq!(OptimizerKind::parse("adam").unwrap(), OptimizerKind::Adam);
        assert_eq!(OptimizerKind::parse("SGD").unwrap(), OptimizerKind::Sgd);
    }

    #[test]
    fn test_yaml_round_trip_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(
            &path,
            "name: synthia_run\nlosses:\n  lam_cutmix: 0.5\nema:\n  buffer_sync:\n    mode: every_n_steps\n    n: 4\n",
        )
        .unwrap();

        let config = TrainerConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "synthia_run");
        assert_eq!(config.losses.lam_cutmix, 0.5);
        assert_eq!(config.losses.lam_aux, 0.1);
        assert_eq!(config.ema.buffer_sync, BufferSync::EveryNSteps { n: 4 });

        let json_path = dir.path().join("run.json");
        config.to_file(&json_path).unwrap();
        let reloaded = TrainerConfig::from_file(&json_path).unwrap();
        assert_eq!(reloaded.name, "synthia_run");
    }

    #[test]
    fn test_bundled_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/gta5_to_cityscapes.yaml");
        let config = TrainerConfig::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.ema.buffer_sync, BufferSync::EveryStep);
        assert_eq!(config.losses.original_pass_input, PseudoLabelInput::Target);
        assert_eq!(config.data.num_classes, 19);
    }

    #[test]
    fn test_class_16_needs_sixteen_classes() {
        let mut config = TrainerConfig::default();
        config.data.source.class_16 = true;
        config.data.target.class_16 = true;
        assert!(matches!(config.validate().unwrap_err(), Error::Config(_)));

        config.data.num_classes = 16;
        assert!(config.validate().is_ok());
        assert!(config.data.class_16());
    }

    #[test]
    fn test_class_16_must_agree_across_domains() {
        let mut config = TrainerConfig::default();
        config.data.num_classes = 16;
        config.data.source.class_16 = true;
        assert!(matches!(config.validate().unwrap_err(), Error::Config(_)));
    }
}
