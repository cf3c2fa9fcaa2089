//! Polynomial learning-rate decay

use tracing::trace;

use super::optimizers::Optimizer;
use crate::error::Result;

/// `init * (1 - iter / max_iter)^power`, with `iter` clamped to `max_iter`
pub fn poly_rate(iter: usize, init: f64, max_iter: usize, power: f64) -> f64 {
    if max_iter == 0 {
        return 0.0;
    }
    let progress = iter.min(max_iter) as f64 / max_iter as f64;
    init * (1.0 - progress).powf(power)
}

/// Polynomial decay applied to every optimizer group
///
/// Group 0 gets the base rate; every later group gets `head_lr_factor`
/// times it.
#[derive(Debug, Clone)]
pub struct PolyLrScheduler {
    base_lr: f64,
    max_iter: usize,
    power: f64,
    head_lr_factor: f64,
}

impl PolyLrScheduler {
    pub fn new(base_lr: f64, max_iter: usize, power: f64, head_lr_factor: f64) -> Self {
        Self {
            base_lr,
            max_iter,
            power,
            head_lr_factor,
        }
    }

    /// Rate of group 0 at `iter`
    pub fn rate(&self, iter: usize) -> f64 {
        poly_rate(iter, self.base_lr, self.max_iter, self.power)
    }

    /// Set every group's rate for `iter`; returns the group 0 rate
    pub fn apply(&self, iter: usize, optimizer: &mut dyn Optimizer) -> Result<f64> {
        let rate = self.rate(iter);
        for group in 0..optimizer.num_groups() {
            let lr = if group == 0 { rate } else { rate * self.head_lr_factor };
            optimizer.set_learning_rate(group, lr)?;
        }
        trace!("iter {} lr {:.3e}", iter, rate);
        Ok(rate)
    }
}
