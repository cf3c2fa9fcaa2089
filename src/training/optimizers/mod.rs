//! Optimizers for segmentation training
//!
//! This module provides SGD with momentum and Adam, both with L2 weight
//! decay folded into the gradient. Parameters are organised in groups with
//! independent learning rates, and all per-parameter state is exposed as
//! named tensors for checkpointing.

pub mod adam;
pub mod sgd;

pub use adam::AdamOptimizer;
pub use sgd::SGDOptimizer;

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};

use super::config::{OptimizerConfig, OptimizerKind};
use super::gradients::GradientBuffer;
use crate::error::{Error, Result};
use crate::model::ParameterGroup;

/// Key of the step counter in optimizer state
pub const STEP_KEY: &str = "step";

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from the accumulated gradients
    fn step(&mut self, gradients: &GradientBuffer) -> Result<()>;

    /// Learning rate of a group
    fn learning_rate(&self, group: usize) -> Result<f64>;

    /// Set the learning rate of a group
    fn set_learning_rate(&mut self, group: usize, lr: f64) -> Result<()>;

    /// Number of parameter groups
    fn num_groups(&self) -> usize;

    /// Number of completed updates
    fn step_count(&self) -> usize;

    /// Optimizer state as named tensors
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>>;

    /// Restore state from named tensors; returns the number of entries used
    fn load_state_tensors(&mut self, state: &HashMap<String, Tensor>) -> Result<usize>;
}

/// Parameters sharing one learning rate
#[derive(Debug, Clone)]
pub struct OptimizerGroup {
    pub name: String,
    pub lr: f64,
    pub params: Vec<(String, Var)>,
}

impl OptimizerGroup {
    /// Wrap model parameter groups, all starting at `lr`
    pub fn from_model_groups(groups: Vec<ParameterGroup>, lr: f64) -> Vec<Self> {
        groups
            .into_iter()
            .map(|g| Self {
                name: g.name,
                lr,
                params: g.params,
            })
            .collect()
    }
}

pub(crate) fn group_lr(groups: &[OptimizerGroup], group: usize) -> Result<f64> {
    groups
        .get(group)
        .map(|g| g.lr)
        .ok_or_else(|| Error::invalid_input(format!("no parameter group {}", group)))
}

pub(crate) fn set_group_lr(groups: &mut [OptimizerGroup], group: usize, lr: f64) -> Result<()> {
    let g = groups
        .get_mut(group)
        .ok_or_else(|| Error::invalid_input(format!("no parameter group {}", group)))?;
    g.lr = lr;
    Ok(())
}

/// Gradient with L2 weight decay folded in
pub(crate) fn decayed_grad(param: &Tensor, grad: &Tensor, weight_decay: f64) -> Result<Tensor> {
    if weight_decay > 0.0 {
        Ok((grad + (param * weight_decay)?)?)
    } else {
        Ok(grad.clone())
    }
}

pub(crate) fn step_tensor(step: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(&[step as i64], device)?)
}

pub(crate) fn read_step(state: &HashMap<String, Tensor>) -> Result<Option<usize>> {
    match state.get(STEP_KEY) {
        Some(t) => {
            let values = t.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
            Ok(values.first().map(|&v| v.max(0) as usize))
        }
        None => Ok(None),
    }
}

/// Copy a saved moment tensor into `slot` when shapes agree
pub(crate) fn restore_moment(
    state: &HashMap<String, Tensor>,
    key: &str,
    param: &Var,
    slot: &mut HashMap<String, Tensor>,
    name: &str,
) -> Result<bool> {
    match state.get(key) {
        Some(saved) if saved.dims() == param.dims() => {
            let restored = saved.to_dtype(param.dtype())?.to_device(param.device())?;
            slot.insert(name.to_string(), restored);
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Create an optimizer from configuration
pub fn create_optimizer(
    config: &OptimizerConfig,
    groups: Vec<ParameterGroup>,
) -> Result<Box<dyn Optimizer>> {
    let groups = OptimizerGroup::from_model_groups(groups, config.lr);

    let optimizer: Box<dyn Optimizer> = match OptimizerKind::parse(&config.kind)? {
        OptimizerKind::Sgd => Box::new(SGDOptimizer::new(groups, config.momentum, config.weight_decay)),
        OptimizerKind::Adam => Box::new(AdamOptimizer::new(
            groups,
            config.betas.0,
            config.betas.1,
            config.epsilon,
            config.weight_decay,
        )),
    };

    Ok(optimizer)
}
