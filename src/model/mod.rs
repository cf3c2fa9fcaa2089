//! Segmentation model interface
//!
//! The trainer only talks to models through [`SegmentationModel`]: a forward
//! pass returning a tagged [`Prediction`], and named access to trainable
//! parameters, running-statistic buffers and optimizer parameter groups.

pub mod dual_head;

pub use dual_head::{DualHeadConfig, DualHeadSegNet};

use candle_core::{Tensor, Var};

use crate::error::{Error, Result};

/// Output of a segmentation forward pass, logits `[N, K, H, W]`
#[derive(Debug, Clone)]
pub enum Prediction {
    /// Main head only
    Single(Tensor),
    /// Main and auxiliary heads, same shape
    Dual { main: Tensor, aux: Tensor },
}

impl Prediction {
    /// Main-head logits
    pub fn main(&self) -> &Tensor {
        match self {
            Prediction::Single(main) | Prediction::Dual { main, .. } => main,
        }
    }

    /// Auxiliary-head logits, if the model produced them
    pub fn aux(&self) -> Option<&Tensor> {
        match self {
            Prediction::Single(_) => None,
            Prediction::Dual { aux, .. } => Some(aux),
        }
    }

    /// Auxiliary-head logits, or an error for single-head predictions
    pub fn require_aux(&self) -> Result<&Tensor> {
        self.aux()
            .ok_or_else(|| Error::invalid_input("auxiliary loss requested but the prediction has no auxiliary head"))
    }

    /// Cut both heads out of the autograd graph
    pub fn detach(&self) -> Prediction {
        match self {
            Prediction::Single(main) => Prediction::Single(main.detach()),
            Prediction::Dual { main, aux } => Prediction::Dual {
                main: main.detach(),
                aux: aux.detach(),
            },
        }
    }
}

/// Parameters that share a learning-rate multiplier
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    pub name: String,
    pub params: Vec<(String, Var)>,
}

/// A trainable dual-head segmentation network
pub trait SegmentationModel {
    /// Forward pass; `target` selects the target-domain pathway and `train`
    /// toggles batch statistics
    fn forward_t(&self, images: &Tensor, target: usize, train: bool) -> Result<Prediction>;

    /// Trainable parameters by name, sorted
    fn named_parameters(&self) -> Result<Vec<(String, Var)>>;

    /// Non-trainable running statistics by name, sorted
    fn named_buffers(&self) -> Result<Vec<(String, Var)>>;

    /// Parameter groups for the optimizer, group 0 first
    fn parameter_groups(&self) -> Result<Vec<ParameterGroup>>;

    /// Number of output classes
    fn num_classes(&self) -> usize;

    /// Parameters followed by buffers
    fn named_state(&self) -> Result<Vec<(String, Var)>> {
        let mut state = self.named_parameters()?;
        state.extend(self.named_buffers()?);
        Ok(state)
    }
}
