//! Shared gradient buffer
//!
//! Every loss term of a step backpropagates into the same buffer; the buffer
//! is only cleared after the single optimizer update at the end of the step.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use tracing::trace;

use crate::error::{Error, Result};

/// Per-parameter gradients summed across several backward passes
pub struct GradientBuffer {
    vars: Vec<(String, Var)>,
    grads: HashMap<String, Tensor>,
    contributions: usize,
}

impl GradientBuffer {
    /// Track gradients for the given named parameters
    pub fn new(vars: Vec<(String, Var)>) -> Self {
        Self {
            vars,
            grads: HashMap::new(),
            contributions: 0,
        }
    }

    /// Backpropagate `loss` and add the result into the buffer
    pub fn accumulate(&mut self, loss: &Tensor) -> Result<()> {
        if loss.elem_count() != 1 {
            return Err(Error::invalid_input(format!(
                "loss must be a scalar, got shape {:?}",
                loss.dims()
            )));
        }

        let store = loss.backward()?;
        for (name, var) in &self.vars {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let merged = match self.grads.remove(name) {
                Some(existing) => (existing + grad)?,
                None => grad.clone(),
            };
            self.grads.insert(name.clone(), merged);
        }
        self.contributions += 1;
        trace!("Accumulated gradients from {} backward passes", self.contributions);
        Ok(())
    }

    /// Accumulated gradient for a parameter
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    /// Tracked parameters
    pub fn vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    /// Number of backward passes since the last clear
    pub fn contributions(&self) -> usize {
        self.contributions
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn clear(&mut self) {
        self.grads.clear();
        self.contributions = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_two_backward_passes_sum() {
        let w = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let mut buffer = GradientBuffer::new(vec![("w".to_string(), w.clone())]);

        // d/dw sum(w * 3) = 3, d/dw sum(w^2) = 2w
        let first = (w.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let second = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        buffer.accumulate(&first).unwrap();
        buffer.accumulate(&second).unwrap();

        let grad: Vec<f32> = buffer.get("w").unwrap().to_vec1().unwrap();
        assert_eq!(grad, vec![5.0, 7.0]);
        assert_eq!(buffer.contributions(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.contributions(), 0);
    }

    #[test]
    fn test_non_scalar_loss_rejected() {
        let w = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let mut buffer = GradientBuffer::new(vec![("w".to_string(), w.clone())]);
        assert!(buffer.accumulate(w.as_tensor()).is_err());
    }
}
