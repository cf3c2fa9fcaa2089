//! Adam optimizer implementation
//!
//! Adam with bias correction and L2 weight decay added to the gradient
//! (not decoupled).

use std::collections::HashMap;

use candle_core::Tensor;

use super::{
    decayed_grad, group_lr, read_step, restore_moment, set_group_lr, step_tensor, Optimizer,
    OptimizerGroup, STEP_KEY,
};
use crate::error::Result;
use crate::training::gradients::GradientBuffer;

const EXP_AVG_PREFIX: &str = "exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "exp_avg_sq.";

/// Adam optimizer
pub struct AdamOptimizer {
    /// Parameter groups
    groups: Vec<OptimizerGroup>,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// First moment estimates
    exp_avg: HashMap<String, Tensor>,

    /// Second moment estimates
    exp_avg_sq: HashMap<String, Tensor>,
}

impl AdamOptimizer {
    /// Create a new Adam optimizer
    pub fn new(
        groups: Vec<OptimizerGroup>,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Self {
        Self {
            groups,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            exp_avg: HashMap::new(),
            exp_avg_sq: HashMap::new(),
        }
    }

    fn moments(&mut self, name: &str, grad: &Tensor) -> Result<(Tensor, Tensor)> {
        let m = match self.exp_avg.remove(name) {
            Some(m) => ((m * self.beta1)? + (grad * (1.0 - self.beta1))?)?,
            None => (grad * (1.0 - self.beta1))?,
        };
        let v = match self.exp_avg_sq.remove(name) {
            Some(v) => ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?,
            None => (grad.sqr()? * (1.0 - self.beta2))?,
        };
        self.exp_avg.insert(name.to_string(), m.clone());
        self.exp_avg_sq.insert(name.to_string(), v.clone());
        Ok((m, v))
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, gradients: &GradientBuffer) -> Result<()> {
        let t = (self.step_count + 1) as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let groups = self.groups.clone();
        for group in &groups {
            let step_size = group.lr / bias_correction1;
            for (name, var) in &group.params {
                let Some(grad) = gradients.get(name) else {
                    continue;
                };
                let param = var.as_tensor().detach();
                let grad = decayed_grad(&param, grad, self.weight_decay)?;
                let (m, v) = self.moments(name, &grad)?;

                let denom = ((v / bias_correction2)?.sqrt()? + self.epsilon)?;
                let update = (m.div(&denom)? * step_size)?;
                var.set(&(param - update)?)?;
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
        for (name, m) in &self.exp_avg {
            state.insert(format!("{}{}", EXP_AVG_PREFIX, name), m.clone());
        }
        for (name, v) in &self.exp_avg_sq {
            state.insert(format!("{}{}", EXP_AVG_SQ_PREFIX, name), v.clone());
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
                let m_key = format!("{}{}", EXP_AVG_PREFIX, name);
                let v_key = format!("{}{}", EXP_AVG_SQ_PREFIX, name);
                if restore_moment(state, &m_key, var, &mut self.exp_avg, name)? {
                    restored += 1;
                }
                if restore_moment(state, &v_key, var, &mut self.exp_avg_sq, name)? {
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

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let w = Var::new(&[1f32, -2.0], &Device::Cpu).unwrap();
        let group = OptimizerGroup {
            name: "all".to_string(),
            lr: 0.01,
            params: vec![("w".to_string(), w.clone())],
        };
        let mut optimizer = AdamOptimizer::new(vec![group], 0.9, 0.99, 1e-8, 0.0);
        let mut buffer = GradientBuffer::new(vec![("w".to_string(), w.clone())]);

        // grad of sum(w^2) is 2w; bias-corrected first Adam step is lr * sign(g)
        buffer.accumulate(&w.as_tensor().sqr().unwrap().sum_all().unwrap()).unwrap();
        optimizer.step(&buffer).unwrap();

        let values: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert_relative_eq!(values[0], 0.99, epsilon = 1e-5);
        assert_relative_eq!(values[1], -1.99, epsilon = 1e-5);

        let state = optimizer.state_tensors().unwrap();
        assert!(state.contains_key("exp_avg.w"));
        assert!(state.contains_key("exp_avg_sq.w"));
        assert!(state.contains_key(STEP_KEY));
    }
}
