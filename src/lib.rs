//! PixelMix - source-to-target domain adaptation for semantic segmentation
//!
//! A dual-head segmentation network is trained on labeled source images and
//! adapted to an unlabeled target domain with confidence-thresholded
//! pseudo-labels, pixel-mixed hybrid images and augmentation, Fourier and
//! CutMix consistency losses. An exponential moving average of the weights
//! is validated periodically and the best one is checkpointed.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod perturb;
pub mod training;

// Re-exports
pub use data::{Batch, BatchProvider, DataLoader, DataLoaderConfig, DatasetName, InMemoryProvider, TensorDataset};
pub use error::{Error, Result};
pub use model::{DualHeadConfig, DualHeadSegNet, Prediction, SegmentationModel};
pub use perturb::Perturbations;
pub use training::{DomainAdaptationTrainer, TrainerConfig};
