//! Exponential moving average of model weights
//!
//! The shadow tracks trainable parameters through the decay update and
//! copies running-statistic buffers verbatim. [`ShadowSwap`] swaps the
//! shadow into the live model for evaluation and puts the live weights back
//! when dropped, on every exit path.

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use tracing::{debug, error};

use super::config::BufferSync;
use crate::error::{Error, Result};
use crate::model::SegmentationModel;

/// Shadow parameters and buffers with a swap backup
pub struct EmaShadow {
    decay: f64,
    warmup: bool,
    num_updates: usize,
    cadence: BufferSync,
    steps_since_sync: usize,
    shadow_params: HashMap<String, Tensor>,
    shadow_buffers: HashMap<String, Tensor>,
    backup: HashMap<String, Tensor>,
}

impl EmaShadow {
    /// Seed the shadow from the live model
    pub fn new<M: SegmentationModel + ?Sized>(
        model: &M,
        decay: f64,
        warmup: bool,
        cadence: BufferSync,
    ) -> Result<Self> {
        if decay <= 0.0 || decay >= 1.0 {
            return Err(Error::config(format!("EMA decay {} must be in (0, 1)", decay)));
        }

        let mut ema = Self {
            decay,
            warmup,
            num_updates: 0,
            cadence,
            steps_since_sync: 0,
            shadow_params: HashMap::new(),
            shadow_buffers: HashMap::new(),
            backup: HashMap::new(),
        };
        ema.resync(model)?;
        Ok(ema)
    }

    /// Decay used by the next update
    pub fn effective_decay(&self) -> f64 {
        if self.warmup {
            let step = self.num_updates as f64;
            self.decay.min((step + 1.0) / (step + 10.0))
        } else {
            self.decay
        }
    }

    /// `shadow = d * shadow + (1 - d) * live` over trainable parameters
    pub fn update_params<M: SegmentationModel + ?Sized>(&mut self, model: &M) -> Result<()> {
        self.ensure_not_applied("update_params")?;
        let decay = self.effective_decay();

        for (name, var) in model.named_parameters()? {
            let live = var.as_tensor().detach();
            let updated = match self.shadow_params.remove(&name) {
                Some(shadow) if shadow.dims() == live.dims() => {
                    ((shadow * decay)? + (live * (1.0 - decay))?)?
                }
                _ => live.copy()?,
            };
            self.shadow_params.insert(name, updated);
        }
        self.num_updates += 1;
        Ok(())
    }

    /// Copy running statistics from the live model into the shadow
    pub fn update_buffers<M: SegmentationModel + ?Sized>(&mut self, model: &M) -> Result<()> {
        self.ensure_not_applied("update_buffers")?;
        for (name, var) in model.named_buffers()? {
            self.shadow_buffers.insert(name, var.as_tensor().copy()?);
        }
        self.steps_since_sync = 0;
        Ok(())
    }

    /// Called after each completed step; refreshes buffers when the cadence says so
    pub fn on_step_end<M: SegmentationModel + ?Sized>(&mut self, model: &M) -> Result<bool> {
        self.steps_since_sync += 1;
        let due = match self.cadence {
            BufferSync::EveryStep => true,
            BufferSync::EveryNSteps { n } => self.steps_since_sync >= n,
            BufferSync::EpochEnd => false,
        };
        if due {
            self.update_buffers(model)?;
        }
        Ok(due)
    }

    /// Called at the end of each pass over the data
    pub fn on_epoch_end<M: SegmentationModel + ?Sized>(&mut self, model: &M) -> Result<bool> {
        if self.cadence == BufferSync::EpochEnd {
            self.update_buffers(model)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Swap shadow weights into the live model, backing up the live ones
    pub fn apply_shadow<M: SegmentationModel + ?Sized>(&mut self, model: &M) -> Result<()> {
        self.ensure_not_applied("apply_shadow")?;

        let params = model.named_parameters()?;
        let buffers = model.named_buffers()?;
        let mut backup = HashMap::with_capacity(params.len() + buffers.len());

        for (name, var) in params.iter().chain(buffers.iter()) {
            backup.insert(name.clone(), var.as_tensor().copy()?);
        }

        let swapped = install(&params, &self.shadow_params)
            .and_then(|_| install(&buffers, &self.shadow_buffers));
        if let Err(e) = swapped {
            // put back whatever was already overwritten
            let all: Vec<(String, Var)> = params.into_iter().chain(buffers).collect();
            install(&all, &backup)?;
            return Err(e);
        }

        self.backup = backup;
        debug!("Applied EMA shadow ({} tensors backed up)", self.backup.len());
        Ok(())
    }

    /// Put the backed-up live weights back
    pub fn restore<M: SegmentationModel + ?Sized>(&mut self, model: &M) -> Result<()> {
        if self.backup.is_empty() {
            return Err(Error::invalid_state("restore called without apply_shadow"));
        }
        install(&model.named_state()?, &self.backup)?;
        self.backup.clear();
        debug!("Restored live weights");
        Ok(())
    }

    pub fn is_applied(&self) -> bool {
        !self.backup.is_empty()
    }

    /// Re-seed the shadow from the live model
    pub fn resync<M: SegmentationModel + ?Sized>(&mut self, model: &M) -> Result<()> {
        self.ensure_not_applied("resync")?;
        self.shadow_params.clear();
        for (name, var) in model.named_parameters()? {
            self.shadow_params.insert(name, var.as_tensor().copy()?);
        }
        self.update_buffers(model)
    }

    /// Shadow parameters and buffers by name
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        self.shadow_params
            .iter()
            .chain(self.shadow_buffers.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Overwrite shadow entries whose names and shapes match; returns the count
    pub fn load_state_tensors(&mut self, state: &HashMap<String, Tensor>) -> Result<usize> {
        let mut loaded = 0;
        for slot in [&mut self.shadow_params, &mut self.shadow_buffers] {
            for (name, current) in slot.iter_mut() {
                if let Some(saved) = state.get(name) {
                    if saved.dims() == current.dims() {
                        *current = saved.to_dtype(current.dtype())?.to_device(current.device())?;
                        loaded += 1;
                    }
                }
            }
        }
        Ok(loaded)
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    fn ensure_not_applied(&self, op: &str) -> Result<()> {
        if self.is_applied() {
            return Err(Error::invalid_state(format!(
                "{} while the EMA shadow is applied",
                op
            )));
        }
        Ok(())
    }
}

fn install(vars: &[(String, Var)], values: &HashMap<String, Tensor>) -> Result<()> {
    for (name, var) in vars {
        if let Some(value) = values.get(name) {
            var.set(value)?;
        }
    }
    Ok(())
}

/// Shadow weights swapped into a model for the lifetime of the guard
pub struct ShadowSwap<'a, M: SegmentationModel + ?Sized> {
    ema: &'a mut EmaShadow,
    model: &'a M,
    restored: bool,
}

impl<'a, M: SegmentationModel + ?Sized> ShadowSwap<'a, M> {
    /// Apply the shadow to `model`
    pub fn apply(ema: &'a mut EmaShadow, model: &'a M) -> Result<Self> {
        ema.apply_shadow(model)?;
        Ok(Self {
            ema,
            model,
            restored: false,
        })
    }

    /// The model, currently carrying shadow weights
    pub fn model(&self) -> &M {
        self.model
    }

    /// Restore live weights, surfacing any failure
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.ema.restore(self.model)
    }
}

impl<M: SegmentationModel + ?Sized> Drop for ShadowSwap<'_, M> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.ema.restore(self.model) {
            error!("Failed to restore live weights after EMA swap: {}", e);
        }
    }
}

/// Run `f` with the shadow applied, restoring live weights afterwards
pub fn with_shadow<M, F, R>(ema: &mut EmaShadow, model: &M, f: F) -> Result<R>
where
    M: SegmentationModel + ?Sized,
    F: FnOnce(&M) -> Result<R>,
{
    let swap = ShadowSwap::apply(ema, model)?;
    let result = f(swap.model());
    swap.restore()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DualHeadConfig, DualHeadSegNet};
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn model() -> DualHeadSegNet {
        let config = DualHeadConfig {
            width: 4,
            num_classes: 3,
            ..Default::default()
        };
        DualHeadSegNet::new(config, &Device::Cpu).unwrap()
    }

    fn snapshot(model: &DualHeadSegNet) -> Vec<(String, Vec<f32>)> {
        model
            .named_state()
            .unwrap()
            .into_iter()
            .map(|(n, v)| (n, v.as_tensor().flatten_all().unwrap().to_vec1().unwrap()))
            .collect()
    }

    fn perturb(model: &DualHeadSegNet) {
        for (_, var) in model.named_state().unwrap() {
            let shifted = (var.as_tensor() + 1.0).unwrap();
            var.set(&shifted).unwrap();
        }
    }

    #[test]
    fn test_apply_then_restore_is_identity() {
        let model = model();
        let mut ema = EmaShadow::new(&model, 0.99, false, BufferSync::EveryStep).unwrap();
        perturb(&model);
        ema.update_params(&model).unwrap();

        let live = snapshot(&model);
        ema.apply_shadow(&model).unwrap();
        assert_ne!(snapshot(&model), live);
        ema.restore(&model).unwrap();
        assert_eq!(snapshot(&model), live);
    }

    #[test]
    fn test_decay_update() {
        let model = model();
        let mut ema = EmaShadow::new(&model, 0.9, false, BufferSync::EveryStep).unwrap();
        let (name, var) = model.named_parameters().unwrap().remove(0);
        let before: Vec<f32> = var.as_tensor().flatten_all().unwrap().to_vec1().unwrap();

        perturb(&model);
        ema.update_params(&model).unwrap();
        let shadow: Vec<f32> = ema.state_tensors()[&name].flatten_all().unwrap().to_vec1().unwrap();
        assert_relative_eq!(shadow[0], before[0] + 0.1, epsilon = 1e-5);
    }

    #[test]
    fn test_warmup_ramps_decay() {
        let model = model();
        let ema = EmaShadow::new(&model, 0.999, true, BufferSync::EveryStep).unwrap();
        assert_relative_eq!(ema.effective_decay(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_restore_without_apply_is_error() {
        let model = model();
        let mut ema = EmaShadow::new(&model, 0.99, false, BufferSync::EveryStep).unwrap();
        assert!(matches!(ema.restore(&model), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_double_apply_is_error() {
        let model = model();
        let mut ema = EmaShadow::new(&model, 0.99, false, BufferSync::EveryStep).unwrap();
        ema.apply_shadow(&model).unwrap();
        assert!(ema.apply_shadow(&model).is_err());
        ema.restore(&model).unwrap();
    }

    #[test]
    fn test_guard_restores_on_error() {
        let model = model();
        let mut ema = EmaShadow::new(&model, 0.99, false, BufferSync::EveryStep).unwrap();
        perturb(&model);
        let live = snapshot(&model);

        let result: Result<()> = with_shadow(&mut ema, &model, |_| Err(Error::data("boom")));
        assert!(result.is_err());
        assert!(!ema.is_applied());
        assert_eq!(snapshot(&model), live);
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let model = model();
        let mut ema = EmaShadow::new(&model, 0.99, false, BufferSync::EveryStep).unwrap();
        perturb(&model);
        let live = snapshot(&model);
        {
            let _swap = ShadowSwap::apply(&mut ema, &model).unwrap();
        }
        assert!(!ema.is_applied());
        assert_eq!(snapshot(&model), live);
    }

    #[test]
    fn test_every_n_steps_cadence() {
        let model = model();
        let mut ema = EmaShadow::new(&model, 0.99, false, BufferSync::EveryNSteps { n: 3 }).unwrap();
        let synced: Vec<bool> = (0..6).map(|_| ema.on_step_end(&model).unwrap()).collect();
        assert_eq!(synced, vec![false, false, true, false, false, true]);
        assert!(!ema.on_epoch_end(&model).unwrap());
    }
}
