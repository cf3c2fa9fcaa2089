//! Held-out evaluation of the current model weights

use tracing::{info, instrument, warn};

use super::evaluator::{Evaluator, MetricPair};
use super::loss::hard_labels;
use super::metrics::{colorize_tensor, MetricsSink};
use crate::data::BatchProvider;
use crate::error::Result;
use crate::model::SegmentationModel;

/// Number of samples from the last batch sent to the sink after a run
const PREVIEW_IMAGES: usize = 2;

/// Which held-out split to evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Source,
    Target,
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationMode::Source => f.write_str("source"),
            ValidationMode::Target => f.write_str("target"),
        }
    }
}

/// Metrics of one validation run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationReport {
    pub pixel_accuracy: f64,
    pub mean_pixel_accuracy: MetricPair,
    pub mean_iou: MetricPair,
    pub fw_iou: MetricPair,
    pub mean_precision: MetricPair,
    pub batches: usize,
}

impl ValidationReport {
    /// MIoU used for best-model comparison (13-class in 16-class mode)
    pub fn miou(&self) -> f64 {
        self.mean_iou.headline()
    }

    /// `(PA, MPA, MIoU, FWIoU)` as reported
    pub fn summary(&self) -> (f64, f64, f64, f64) {
        (
            self.pixel_accuracy,
            self.mean_pixel_accuracy.headline(),
            self.mean_iou.headline(),
            self.fw_iou.headline(),
        )
    }
}

/// Runs a model over a held-out provider and accumulates metrics
pub struct ValidationRunner {
    evaluator: Evaluator,
    source_val_iterations: usize,
    image_log_interval: usize,
    target_selector: usize,
}

impl ValidationRunner {
    pub fn new(
        num_classes: usize,
        class_16: bool,
        source_val_iterations: usize,
        image_log_interval: usize,
        target_selector: usize,
    ) -> Result<Self> {
        Ok(Self {
            evaluator: Evaluator::new(num_classes, class_16)?,
            source_val_iterations,
            image_log_interval,
            target_selector,
        })
    }

    /// Evaluator holding the confusion matrix of the last run
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Evaluate `model` (in eval mode) over one pass of `provider`
    #[instrument(skip(self, model, provider, sink))]
    pub fn run<M: SegmentationModel + ?Sized>(
        &mut self,
        model: &M,
        provider: &mut dyn BatchProvider,
        mode: ValidationMode,
        sink: &mut dyn MetricsSink,
        step: usize,
    ) -> Result<ValidationReport> {
        info!("Validating on {}", mode);
        self.evaluator.reset();
        provider.reset()?;

        let mut batches = 0;
        let mut last = None;
        while let Some(batch) = provider.next_batch()? {
            if mode == ValidationMode::Source && batches >= self.source_val_iterations {
                break;
            }

            let label = batch.require_label()?.clone();
            let prediction = model.forward_t(&batch.image, self.target_selector, false)?;
            let predicted = hard_labels(prediction.main())?;
            self.evaluator.add_tensors(&label, &predicted)?;

            if self.image_log_interval > 0 && batches > 0 && batches % self.image_log_interval == 0 {
                sink.add_image(&format!("val/{}/{}_gt", mode, batches), &colorize_tensor(&label, 0)?, step)?;
                sink.add_image(&format!("val/{}/{}_pred", mode, batches), &colorize_tensor(&predicted, 0)?, step)?;
            }

            batches += 1;
            last = Some((label, predicted));
        }

        match &last {
            Some((label, predicted)) => {
                let shown = label.dims()[0].min(PREVIEW_IMAGES);
                for i in 0..shown {
                    sink.add_image(&format!("{}/labels", i), &colorize_tensor(label, i)?, step)?;
                    sink.add_image(&format!("{}/preds", i), &colorize_tensor(predicted, i)?, step)?;
                }
            }
            None => warn!("Validation provider for {} produced no batches", mode),
        }

        let report = ValidationReport {
            pixel_accuracy: self.evaluator.pixel_accuracy(),
            mean_pixel_accuracy: self.evaluator.mean_pixel_accuracy(),
            mean_iou: self.evaluator.mean_iou(),
            fw_iou: self.evaluator.fw_iou(),
            mean_precision: self.evaluator.mean_precision(),
            batches,
        };
        self.log_report(&report, sink, step)?;
        Ok(report)
    }

    fn log_report(&self, report: &ValidationReport, sink: &mut dyn MetricsSink, step: usize) -> Result<()> {
        let pairs = [
            ("MPA", report.mean_pixel_accuracy),
            ("MIoU", report.mean_iou),
            ("FWIoU", report.fw_iou),
            ("PC", report.mean_precision),
        ];

        sink.add_scalar("PA", report.pixel_accuracy, step)?;
        for (name, pair) in pairs {
            match pair.subset {
                Some(subset) => {
                    sink.add_scalar(&format!("{}_16", name), pair.full, step)?;
                    sink.add_scalar(&format!("{}_13", name), subset, step)?;
                }
                None => sink.add_scalar(name, pair.full, step)?,
            }
        }

        if report.mean_iou.subset.is_some() {
            info!(
                "PA:{:.3}, MPA_16:{:.3}, MIoU_16:{:.3}, FWIoU_16:{:.3}, PC_16:{:.3}",
                report.pixel_accuracy,
                report.mean_pixel_accuracy.full,
                report.mean_iou.full,
                report.fw_iou.full,
                report.mean_precision.full
            );
        }
        let (pa, mpa, miou, fwiou) = report.summary();
        info!(
            "PA:{:.3}, MPA:{:.3}, MIoU:{:.3}, FWIoU:{:.3}, PC:{:.3}",
            pa,
            mpa,
            miou,
            fwiou,
            report.mean_precision.headline()
        );
        Ok(())
    }
}
