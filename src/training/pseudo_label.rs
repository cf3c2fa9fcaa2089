//! Confidence-thresholded pseudo-labels for the unlabeled target domain
//!
//! Two policies share the same thresholding core. The self-best policy falls
//! back to the source ground truth at the same batch position for pixels
//! below threshold; the original policy marks them ignored.

use candle_core::{DType, Tensor};

use super::loss::{class_probabilities, hard_labels, max_confidence, IGNORE_LABEL};
use crate::error::{Error, Result};
use crate::model::Prediction;

/// Hard labels with the mask that selected them
#[derive(Debug, Clone)]
pub struct PseudoLabel {
    /// `[N, H, W]` i64
    pub labels: Tensor,
    /// `[N, H, W]` u8, 1 where confidence exceeded the threshold
    pub mask: Tensor,
    /// `[N, H, W]` max softmax probability
    pub confidence: Tensor,
}

impl PseudoLabel {
    /// Fraction of pixels above threshold
    pub fn coverage(&self) -> Result<f64> {
        let mean = self.mask.to_dtype(DType::F64)?.mean_all()?;
        Ok(mean.to_scalar::<f64>()?)
    }
}

/// Output of the original policy
#[derive(Debug, Clone)]
pub struct OriginalPseudoLabels {
    /// Labels for main-head losses
    pub main: PseudoLabel,
    /// Labels from the averaged main+aux distribution, for aux-head losses
    pub aux: Option<PseudoLabel>,
}

impl OriginalPseudoLabels {
    /// Labels for aux-head losses, falling back to the main labels
    pub fn aux_labels(&self) -> &Tensor {
        self.aux.as_ref().map_or(&self.main.labels, |aux| &aux.labels)
    }
}

/// Strict `confidence > threshold` mask as u8
pub fn confidence_mask(confidence: &Tensor, threshold: f64) -> Result<Tensor> {
    Ok(confidence.gt(threshold)?)
}

/// Applies both pseudo-label policies
#[derive(Debug, Clone)]
pub struct PseudoLabelEngine {
    best_threshold: f64,
    original_threshold: f64,
}

impl PseudoLabelEngine {
    pub fn new(best_threshold: f64, original_threshold: f64) -> Self {
        Self {
            best_threshold,
            original_threshold,
        }
    }

    pub fn best_threshold(&self) -> f64 {
        self.best_threshold
    }

    pub fn original_threshold(&self) -> f64 {
        self.original_threshold
    }

    /// Self-best labels from detached main logits, falling back to `fallback`
    pub fn self_best(&self, logits: &Tensor, fallback: &Tensor) -> Result<PseudoLabel> {
        let logits = logits.detach();
        let probs = class_probabilities(&logits)?;
        let confidence = max_confidence(&probs)?;
        let predicted = hard_labels(&probs)?;

        let fallback = fallback.to_dtype(DType::I64)?;
        if fallback.dims() != predicted.dims() {
            return Err(Error::invalid_input(format!(
                "fallback labels {:?} do not match predictions {:?}",
                fallback.dims(),
                predicted.dims()
            )));
        }

        let mask = confidence_mask(&confidence, self.best_threshold)?;
        let labels = mask.where_cond(&predicted, &fallback)?;
        Ok(PseudoLabel {
            labels,
            mask,
            confidence,
        })
    }

    /// Original-policy labels; a second map is built when the prediction has an aux head
    pub fn original(&self, prediction: &Prediction) -> Result<OriginalPseudoLabels> {
        let prediction = prediction.detach();

        let main_probs = class_probabilities(prediction.main())?;
        let main_conf = max_confidence(&main_probs)?;
        let main_mask = confidence_mask(&main_conf, self.original_threshold)?;
        let ignore = ignore_like(&main_conf)?;

        let main = PseudoLabel {
            labels: main_mask.where_cond(&hard_labels(&main_probs)?, &ignore)?,
            mask: main_mask.clone(),
            confidence: main_conf,
        };

        let aux = match prediction.aux() {
            Some(aux_logits) => {
                let aux_probs = class_probabilities(aux_logits)?;
                let aux_mask = confidence_mask(&max_confidence(&aux_probs)?, self.original_threshold)?;
                let averaged = ((&main_probs + &aux_probs)? * 0.5)?;
                let mask = main_mask.maximum(&aux_mask)?;
                Some(PseudoLabel {
                    labels: mask.where_cond(&hard_labels(&averaged)?, &ignore)?,
                    mask,
                    confidence: max_confidence(&averaged)?,
                })
            }
            None => None,
        };

        Ok(OriginalPseudoLabels { main, aux })
    }
}

fn ignore_like(reference: &Tensor) -> Result<Tensor> {
    Ok(Tensor::full(IGNORE_LABEL, reference.dims(), reference.device())?)
}
