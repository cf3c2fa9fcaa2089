//! Domain-adaptation training
//!
//! # Main Components
//!
//! - **Configuration**: validated trainer configuration loaded from YAML or JSON
//! - **Trainer**: the per-step loss schedule, EMA shadow and validation cadence
//! - **Losses and pseudo-labels**: ignore-aware cross-entropy terms feeding one
//!   shared gradient buffer, and confidence-thresholded pseudo-labels
//! - **Optimizers**: SGD with momentum and Adam with per-group learning rates
//!   under polynomial decay
//! - **Evaluation**: confusion-matrix metrics and a validation runner
//! - **Checkpoints**: safetensors checkpoints with permissive loading
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pixelmix::training::{DomainAdaptationTrainer, TrainerConfig, TracingSink};
//! use pixelmix::perturb::Perturbations;
//!
//! let config = TrainerConfig::from_file("configs/gta5_to_cityscapes.yaml")?;
//! let mut trainer = DomainAdaptationTrainer::new(
//!     config,
//!     model,
//!     providers,
//!     Perturbations::standard(42),
//!     Box::new(TracingSink),
//! )?;
//! let result = trainer.train()?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod ema;
pub mod evaluator;
pub mod gradients;
pub mod loss;
pub mod metrics;
pub mod mixing;
pub mod optimizers;
pub mod pseudo_label;
pub mod scheduler;
pub mod trainer;
pub mod validation;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    BufferSync, CheckpointingConfig, DataConfig, DatasetSpec, DeviceType, EmaConfig, LoggingConfig,
    LossConfig, ModelConfig, OptimizerConfig, OptimizerKind, PseudoLabelConfig, PseudoLabelInput,
    RuntimeConfig, TrainerConfig, ValidationConfig,
};

// Trainer re-exports
pub use trainer::{
    DataProviders, DomainAdaptationTrainer, StepOutcome, TrainerCounters, TrainingEvent, TrainingResult,
    TrainingStatus,
};

// Component re-exports
pub use checkpoint::{
    CheckpointManager, CheckpointMeta, LoadSummary, ReferenceWeights, RestoreOutcome, ResumePolicy,
    WeightSource,
};
pub use ema::{with_shadow, EmaShadow, ShadowSwap};
pub use evaluator::{Evaluator, MetricPair, CITYSCAPES_CLASSES};
pub use gradients::GradientBuffer;
pub use loss::{cross_entropy_ignore, LossAggregator, LossTerm, IGNORE_LABEL};
pub use metrics::{FanoutSink, JsonlSink, MemorySink, MetricsSink, RgbImage, TracingSink};
pub use optimizers::{create_optimizer, AdamOptimizer, Optimizer, SGDOptimizer};
pub use pseudo_label::{OriginalPseudoLabels, PseudoLabel, PseudoLabelEngine};
pub use scheduler::{poly_rate, PolyLrScheduler};
pub use validation::{ValidationMode, ValidationReport, ValidationRunner};
