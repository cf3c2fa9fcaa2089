//! SGD optimizer implementation with momentum
//!
//! This module provides Stochastic Gradient Descent with optional momentum
//! and L2 weight decay, per-group learning rates.

use std::collections::HashMap;

use candle_core::Tensor;

use super::{
    decayed_grad, group_lr, read_step, restore_moment, set_group_lr, step_tensor, Optimizer,
    OptimizerGroup, STEP_KEY,
};
use crate::error::Result;
use crate::training::gradients::GradientBuffer;

const MOMENTUM_PREFIX: &str = "momentum.";

/// SGD optimizer with momentum
pub struct SGDOptimizer {
    /// Parameter groups
    groups: Vec<OptimizerGroup>,

    /// Momentum coefficient
    momentum: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// Momentum buffers
    momentum_buffers: HashMap<String, Tensor>,
}

impl SGDOptimizer {
    /// Create a new SGD optimizer
    pub fn new(groups: Vec<OptimizerGroup>, momentum: f64, weight_decay: f64) -> Self {
        Self {
            groups,
            momentum,
            weight_decay,
            step_count: 0,
            momentum_buffers: HashMap::new(),
        }
    }

    /// Compute the update direction for one parameter
    fn direction(&mut self, name: &str, param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        let grad = decayed_grad(param, grad, self.weight_decay)?;
        if self.momentum <= 0.0 {
            return Ok(grad);
        }

        // v_t = μ * v_{t-1} + g_t, seeded with g on the first step
        let buffer = match self.momentum_buffers.remove(name) {
            Some(previous) => ((previous * self.momentum)? + &grad)?,
            None => grad,
        };
        self.momentum_buffers.insert(name.to_string(), buffer.clone());
        Ok(buffer)
    }
}

impl Optimizer for SGDOptimizer {
    fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    fn step(&mut self, gradients: &GradientBuffer) -> Result<()> {
        let groups = self.groups.clone();
        for group in &groups {
            for (name, var) in &group.params {
                let Some(grad) = gradients.get(name) else {
                    continue;
                };
                let param = var.as_tensor().detach();
                let update = self.direction(name, &param, grad)?;
                // θ_t = θ_{t-1} - α * update
                var.set(&(param - (update * group.lr)?)?)?;
            }
        }
        self.step_count += 1;
        Ok(())
    }

    fn learning_rate(&self, group: usize) -> Result<f64> {
        group_lr(&self.groups, group)
    }

    fn set_learning_rate(&mut self, group: usize, lr: f64) -> Result<()> {
        set_group_lr(&mut self.groups, group, lr)
    }

    fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, buffer) in &self.momentum_buffers {
            state.insert(format!("{}{}", MOMENTUM_PREFIX, name), buffer.clone());
        }
        if let Some((_, var)) = self.groups.iter().flat_map(|g| g.params.iter()).next() {
            state.insert(STEP_KEY.to_string(), step_tensor(self.step_count, var.device())?);
        }
        Ok(state)
    }

    fn load_state_tensors(&mut self, state: &HashMap<String, Tensor>) -> Result<usize> {
        let mut restored = 0;
        for group in &self.groups {
            for (name, var) in &group.params {
                let key = format!("{}{}", MOMENTUM_PREFIX, name);
                if restore_moment(state, &key, var, &mut self.momentum_buffers, name)? {
                    restored += 1;
                }
            }
        }
        if let Some(step) = read_step(state)? {
            self.step_count = step;
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Var};

    fn setup(momentum: f64) -> (Var, SGDOptimizer, GradientBuffer) {
        let w = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let group = OptimizerGroup {
            name: "all".to_string(),
            lr: 0.1,
            params: vec![("w".to_string(), w.clone())],
        };
        let optimizer = SGDOptimizer::new(vec![group], momentum, 0.0);
        let buffer = GradientBuffer::new(vec![("w".to_string(), w.clone())]);
        (w, optimizer, buffer)
    }

    #[test]
    fn test_plain_sgd_update() {
        let (w, mut optimizer, mut buffer) = setup(0.0);
        // grad of sum(w) is 1
        buffer.accumulate(&w.as_tensor().sum_all().unwrap()).unwrap();
        optimizer.step(&buffer).unwrap();

        let values: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert_relative_eq!(values[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(values[1], 1.9, epsilon = 1e-6);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn test_momentum_accumulates() {
        let (w, mut optimizer, mut buffer) = setup(0.9);
        for _ in 0..2 {
            buffer.clear();
            buffer.accumulate(&w.as_tensor().sum_all().unwrap()).unwrap();
            optimizer.step(&buffer).unwrap();
        }
        // updates: 0.1 * 1, then 0.1 * (0.9 + 1)
        let values: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert_relative_eq!(values[0], 1.0 - 0.1 - 0.19, epsilon = 1e-5);
    }

    #[test]
    fn test_state_round_trip() {
        let (w, mut optimizer, mut buffer) = setup(0.9);
        buffer.accumulate(&w.as_tensor().sum_all().unwrap()).unwrap();
        optimizer.step(&buffer).unwrap();
        let state = optimizer.state_tensors().unwrap();
        assert!(state.contains_key("momentum.w"));

        let (_, mut fresh, _) = setup(0.9);
        assert_eq!(fresh.load_state_tensors(&state).unwrap(), 2);
        assert_eq!(fresh.step_count(), 1);
    }
}
