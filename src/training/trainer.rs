//! Domain-adaptation trainer
//!
//! Drives the per-step loss schedule over lockstep source/target batches,
//! a single optimizer update per step, the EMA shadow and the periodic
//! shadow validation with best/final checkpointing.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::checkpoint::{CheckpointManager, ReferenceWeights, ResumePolicy, RestoreOutcome};
use super::config::{PseudoLabelInput, TrainerConfig};
use super::ema::{EmaShadow, ShadowSwap};
use super::gradients::GradientBuffer;
use super::loss::LossAggregator;
use super::metrics::MetricsSink;
use super::mixing::blend_by_mask;
use super::optimizers::{create_optimizer, Optimizer};
use super::pseudo_label::PseudoLabelEngine;
use super::scheduler::PolyLrScheduler;
use super::validation::{ValidationMode, ValidationReport, ValidationRunner};
use crate::data::{next_pair, paired_len, Batch, BatchProvider};
use crate::error::{Error, Result};
use crate::model::{Prediction, SegmentationModel};
use crate::perturb::Perturbations;

const BEST_CHECKPOINT: &str = "best";
const FINAL_CHECKPOINT: &str = "final";

/// Batch providers used by the trainer
pub struct DataProviders {
    pub source_train: Box<dyn BatchProvider>,
    pub target_train: Box<dyn BatchProvider>,
    pub target_val: Box<dyn BatchProvider>,
    pub source_val: Option<Box<dyn BatchProvider>>,
}

/// Progress counters and best-model tracking
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerCounters {
    pub epoch: usize,
    pub iter: usize,
    pub current_miou: f64,
    pub best_miou: f64,
    pub best_iter: usize,
}

impl TrainerCounters {
    /// Record a validation MIoU; returns true when it beats the best so far
    pub fn observe(&mut self, miou: f64) -> bool {
        self.current_miou = miou;
        if miou > self.best_miou {
            self.best_miou = miou;
            self.best_iter = self.iter;
            true
        } else {
            false
        }
    }
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Completed,
    Failed { error: String },
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize },
    StepCompleted { iter: usize, loss: f64, lr: f64 },
    ValidationCompleted { iter: usize, miou: f64, is_best: bool },
    CheckpointSaved { path: PathBuf },
    TrainingCompleted { total_steps: usize, best_miou: f64 },
    Error { error: String },
}

/// What a single training step did
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Iteration counter after the step
    pub iter: usize,
    pub lr: f64,
    /// `(name, value)` of every recorded loss
    pub losses: Vec<(String, f64)>,
    pub total_loss: f64,
    pub validation: Option<ValidationReport>,
    /// The iteration budget is spent
    pub stop: bool,
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    pub counters: TrainerCounters,
    pub final_checkpoint: PathBuf,
    pub best_checkpoint: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub training_duration: Duration,
    pub total_steps: usize,
}

/// Source-to-target adaptation trainer over a dual-head segmentation model
pub struct DomainAdaptationTrainer<M: SegmentationModel> {
    config: TrainerConfig,
    model: M,
    optimizer: Box<dyn Optimizer>,
    scheduler: PolyLrScheduler,
    engine: PseudoLabelEngine,
    losses: LossAggregator,
    ema: EmaShadow,
    validator: ValidationRunner,
    checkpoints: CheckpointManager,
    data: DataProviders,
    perturbations: Perturbations,
    sink: Box<dyn MetricsSink>,
    counters: TrainerCounters,
    status: TrainingStatus,
    reference: Option<ReferenceWeights>,
    best_checkpoint: Option<PathBuf>,
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl<M: SegmentationModel> DomainAdaptationTrainer<M> {
    /// Create a trainer; the configuration is validated first
    #[instrument(skip_all, fields(name = %config.name))]
    pub fn new(
        config: TrainerConfig,
        model: M,
        data: DataProviders,
        perturbations: Perturbations,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        if model.num_classes() != config.data.num_classes {
            return Err(Error::config(format!(
                "model predicts {} classes but data has {}",
                model.num_classes(),
                config.data.num_classes
            )));
        }

        let optimizer = create_optimizer(&config.optimizer, model.parameter_groups()?)?;
        let scheduler = PolyLrScheduler::new(
            config.optimizer.lr,
            config.optimizer.iterations,
            config.optimizer.poly_power,
            config.optimizer.head_lr_factor,
        );
        let engine = PseudoLabelEngine::new(
            config.pseudo_labels.pseudobest_threshold,
            config.pseudo_labels.pseudolabel_threshold,
        );
        let losses = LossAggregator::new(
            GradientBuffer::new(model.named_parameters()?),
            config.losses.aux,
            config.losses.lam_aux,
        );
        let ema = EmaShadow::new(&model, config.ema.decay, config.ema.warmup, config.ema.buffer_sync)?;
        let validator = ValidationRunner::new(
            config.data.num_classes,
            config.data.class_16(),
            config.data.source_val_iterations,
            config.validation.image_log_interval,
            config.model.num_target,
        )?;
        let checkpoints = CheckpointManager::new(&config.checkpointing.output_dir)?;

        info!(
            "Trainer ready: {} optimizer, {} iterations, {} steps per epoch",
            optimizer.name(),
            config.optimizer.iterations,
            paired_len(data.source_train.as_ref(), data.target_train.as_ref())
        );

        Ok(Self {
            config,
            model,
            optimizer,
            scheduler,
            engine,
            losses,
            ema,
            validator,
            checkpoints,
            data,
            perturbations,
            sink,
            counters: TrainerCounters::default(),
            status: TrainingStatus::NotStarted,
            reference: None,
            best_checkpoint: None,
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Train until the iteration budget is spent, then write the final checkpoint
    pub fn train(&mut self) -> Result<TrainingResult> {
        info!("Starting training");
        let started_at = Utc::now();
        let clock = Instant::now();
        let start_iter = self.counters.iter;
        self.status = TrainingStatus::Running;

        if let Err(e) = self.run_epochs() {
            let message = format!("Training failed: {}", e);
            error!("{}", message);
            self.status = TrainingStatus::Failed { error: message.clone() };
            self.send_event(TrainingEvent::Error { error: message });
            return Err(e);
        }

        info!(
            "The best MIoU was {:.3} at iter {}",
            self.counters.best_miou, self.counters.best_iter
        );
        let final_checkpoint = self.save_checkpoint(FINAL_CHECKPOINT)?;
        self.sink.flush()?;
        self.status = TrainingStatus::Completed;

        let result = TrainingResult {
            counters: self.counters.clone(),
            final_checkpoint,
            best_checkpoint: self.best_checkpoint.clone(),
            started_at,
            training_duration: clock.elapsed(),
            total_steps: self.counters.iter.saturating_sub(start_iter),
        };
        info!("Training completed in {:?}", result.training_duration);
        self.send_event(TrainingEvent::TrainingCompleted {
            total_steps: result.total_steps,
            best_miou: self.counters.best_miou,
        });
        Ok(result)
    }

    fn run_epochs(&mut self) -> Result<()> {
        if paired_len(self.data.source_train.as_ref(), self.data.target_train.as_ref()) == 0 {
            return Err(Error::data("source or target training data yields no batches"));
        }

        loop {
            self.send_event(TrainingEvent::EpochStarted {
                epoch: self.counters.epoch,
            });
            let keep_going = self.train_one_epoch()?;
            if self.ema.on_epoch_end(&self.model)? {
                debug!("EMA buffers synced at end of epoch {}", self.counters.epoch);
            }
            self.counters.epoch += 1;
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// One lockstep pass over source and target; false once the budget is spent
    pub fn train_one_epoch(&mut self) -> Result<bool> {
        self.data.source_train.reset()?;
        self.data.target_train.reset()?;

        let mut batch_idx = 0;
        while let Some((source, target)) =
            next_pair(self.data.source_train.as_mut(), self.data.target_train.as_mut())?
        {
            let outcome = self.train_step(batch_idx, &source, &target)?;
            if outcome.stop {
                return Ok(false);
            }
            batch_idx += 1;
        }
        Ok(true)
    }

    /// Run one full step: every enabled loss term, one update, EMA and validation
    pub fn train_step(&mut self, batch_idx: usize, source: &Batch, target: &Batch) -> Result<StepOutcome> {
        let lr = self.scheduler.apply(self.counters.iter, self.optimizer.as_mut())?;
        self.sink.add_scalar("train/lr", lr, self.counters.iter)?;

        self.accumulate_losses(source, target)?;

        self.optimizer.step(self.losses.gradients())?;
        self.losses.clear_gradients();
        self.ema.update_params(&self.model)?;

        let losses: Vec<(String, f64)> = self
            .losses
            .terms()
            .iter()
            .map(|t| (t.name.clone(), t.value))
            .collect();
        let total_loss = self.losses.finalize();
        for (name, value) in &losses {
            self.sink.add_scalar(&format!("train/{}", name), *value, self.counters.iter)?;
        }
        self.sink.add_scalar("train/total", total_loss, self.counters.iter)?;

        let log_every = self.config.logging.log_every;
        if log_every > 0 && batch_idx % log_every == 0 {
            let parts: Vec<String> = losses.iter().map(|(n, l)| format!("{}: {:.3}", n, l)).collect();
            info!("[Epoch {}] {}", self.counters.epoch, parts.join("  "));
        }

        self.counters.iter += 1;
        self.send_event(TrainingEvent::StepCompleted {
            iter: self.counters.iter,
            loss: total_loss,
            lr,
        });

        let mut outcome = StepOutcome {
            iter: self.counters.iter,
            lr,
            losses,
            total_loss,
            validation: None,
            stop: false,
        };
        if self.counters.iter > self.config.optimizer.iterations {
            info!("Iteration budget of {} reached", self.config.optimizer.iterations);
            outcome.stop = true;
            return Ok(outcome);
        }

        self.ema.on_step_end(&self.model)?;

        let interval = self.config.validation.interval;
        if interval > 0 && batch_idx > 0 && batch_idx % interval == 0 {
            outcome.validation = Some(self.validate_and_checkpoint()?);
        }
        Ok(outcome)
    }

    fn forward(&self, images: &Tensor) -> Result<Prediction> {
        self.model.forward_t(images, self.config.model.num_target, true)
    }

    fn accumulate_losses(&mut self, source: &Batch, target: &Batch) -> Result<()> {
        let losses = self.config.losses.clone();
        let source_label = source.require_label()?;
        self.losses.begin_step();

        // supervised source
        let source_image = if losses.source_fourier {
            self.perturbations
                .fourier
                .mix(&source.image, &target.image, losses.fourier_beta)?
        } else {
            source.image.clone()
        };
        let prediction = self.forward(&source_image)?;
        self.losses.add_term("source", &prediction, source_label, None, 1.0)?;

        // self-best pseudo-labels and the hybrid image
        let detached = self.forward(&target.image)?.detach();
        let best = self.engine.self_best(detached.main(), source_label)?;
        debug!("Self-best coverage {:.3}", best.coverage()?);
        let hybrid = blend_by_mask(&target.image, &source.image, &best.mask)?;
        let prediction = self.forward(&hybrid)?;
        self.losses
            .add_term("self_best", &prediction, &best.labels, None, losses.lam_new)?;

        if !losses.any_consistency() {
            return Ok(());
        }

        // original pseudo-labels for the consistency terms
        let base = match losses.original_pass_input {
            PseudoLabelInput::Target => target.image.clone(),
            PseudoLabelInput::Hybrid => hybrid,
        };
        let original = self.engine.original(&self.forward(&base)?.detach())?;
        let main_labels = &original.main.labels;
        let aux_labels = original.aux_labels();

        if losses.lam_aug > 0.0 {
            let (images, maps) = self
                .perturbations
                .augmenter
                .augment(&base, &[main_labels, aux_labels])?;
            let [aug_main, aug_aux] = maps.as_slice() else {
                return Err(Error::invalid_state(format!(
                    "augmenter returned {} label maps for 2 inputs",
                    maps.len()
                )));
            };
            let prediction = self.forward(&images)?;
            self.losses
                .add_term("aug", &prediction, aug_main, Some(aug_aux), losses.lam_aug)?;
        }

        if losses.lam_fourier > 0.0 {
            let images = self
                .perturbations
                .fourier
                .mix(&base, &source.image, losses.fourier_beta)?;
            let prediction = self.forward(&images)?;
            self.losses
                .add_term("fourier", &prediction, main_labels, Some(aux_labels), losses.lam_fourier)?;
        }

        if losses.lam_cutmix > 0.0 {
            let (images, labels) =
                self.perturbations
                    .cutmix
                    .combine(&base, main_labels, &source.image, source_label)?;
            let prediction = self.forward(&images)?;
            self.losses
                .add_term("cutmix", &prediction, &labels, None, losses.lam_cutmix)?;
        }
        Ok(())
    }

    /// Validate the EMA shadow on target data; live weights are restored afterwards
    pub fn validate_ema(&mut self) -> Result<ValidationReport> {
        let step = self.counters.iter;
        let swap = ShadowSwap::apply(&mut self.ema, &self.model)?;
        let report = self.validator.run(
            swap.model(),
            self.data.target_val.as_mut(),
            ValidationMode::Target,
            self.sink.as_mut(),
            step,
        );
        swap.restore()?;
        report
    }

    fn validate_and_checkpoint(&mut self) -> Result<ValidationReport> {
        let report = self.validate_ema()?;
        let miou = report.miou();
        let is_best = self.counters.observe(miou);

        if is_best {
            info!(
                "New best MIoU {:.3} at iter {}, saving checkpoint",
                self.counters.best_miou, self.counters.best_iter
            );
            self.best_checkpoint = Some(self.save_checkpoint(BEST_CHECKPOINT)?);
        } else {
            info!(
                "MIoU {:.3} did not improve, best is still {:.3} from iter {}",
                miou, self.counters.best_miou, self.counters.best_iter
            );
        }
        self.send_event(TrainingEvent::ValidationCompleted {
            iter: self.counters.iter,
            miou,
            is_best,
        });
        Ok(report)
    }

    /// Validate the live model on either domain
    pub fn validate(&mut self, mode: ValidationMode) -> Result<ValidationReport> {
        let step = self.counters.iter;
        let provider = match mode {
            ValidationMode::Target => self.data.target_val.as_mut(),
            ValidationMode::Source => self
                .data
                .source_val
                .as_deref_mut()
                .ok_or_else(|| Error::invalid_state("no source validation data configured"))?,
        };
        self.validator.run(&self.model, provider, mode, self.sink.as_mut(), step)
    }

    /// Write checkpoint `name` with the current counters
    pub fn save_checkpoint(&mut self, name: &str) -> Result<PathBuf> {
        let path = self.checkpoints.save(
            name,
            self.counters.epoch,
            self.counters.iter,
            self.counters.best_miou,
            &self.model,
            &self.ema,
            self.optimizer.as_ref(),
        )?;
        self.send_event(TrainingEvent::CheckpointSaved { path: path.clone() });
        Ok(path)
    }

    /// Load a checkpoint into the model (and, on resume, optimizer and counters)
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<RestoreOutcome> {
        let path = path.as_ref();
        let policy = ResumePolicy {
            restore_optimizer_state: self.config.checkpointing.restore_optimizer_state,
            restore_progress_counters: self.config.checkpointing.restore_progress_counters,
        };
        let outcome = CheckpointManager::restore(
            path,
            &self.model,
            self.optimizer.as_mut(),
            self.config.train,
            self.config.checkpointing.resume,
            policy,
        )?;

        if let Some((epoch, iter)) = outcome.counters {
            self.counters.epoch = epoch;
            self.counters.iter = iter;
        }

        let device = self.device()?;
        if self.config.ema.resync_on_load {
            self.ema.resync(&self.model)?;
        } else {
            let loaded = CheckpointManager::read(path, &device)?;
            let restored = self.ema.load_state_tensors(&loaded.shadow)?;
            if restored == 0 {
                warn!("Checkpoint has no usable shadow; EMA keeps its previous weights");
            }
        }

        if self.config.model.keep_reference {
            let reference = ReferenceWeights::from_file(path, &device)?;
            info!("Frozen reference copy holds {} tensors", reference.len());
            self.reference = Some(reference);
        }
        Ok(outcome)
    }

    fn device(&self) -> Result<Device> {
        Ok(self
            .model
            .named_parameters()?
            .first()
            .map(|(_, v)| v.device().clone())
            .unwrap_or(Device::Cpu))
    }

    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn ema(&self) -> &EmaShadow {
        &self.ema
    }

    pub fn counters(&self) -> &TrainerCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut TrainerCounters {
        &mut self.counters
    }

    pub fn status(&self) -> &TrainingStatus {
        &self.status
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Frozen reference weights, when configured and loaded
    pub fn reference(&self) -> Option<&ReferenceWeights> {
        self.reference.as_ref()
    }

    /// Evaluator of the most recent validation run
    pub fn evaluator(&self) -> &super::evaluator::Evaluator {
        self.validator.evaluator()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_tracks_best() {
        let mut counters = TrainerCounters {
            iter: 200,
            best_miou: 0.38,
            ..Default::default()
        };
        assert!(counters.observe(0.41));
        assert_eq!(counters.best_miou, 0.41);
        assert_eq!(counters.best_iter, 200);

        counters.iter = 400;
        assert!(!counters.observe(0.40));
        assert_eq!(counters.current_miou, 0.40);
        assert_eq!(counters.best_iter, 200);
    }
}
