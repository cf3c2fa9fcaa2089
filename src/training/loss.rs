//! Ignore-aware cross-entropy and the per-step loss aggregator
//!
//! Each named term is backpropagated as soon as it is added, into the shared
//! [`GradientBuffer`]. Nothing is stepped here; the trainer applies one
//! optimizer update after all terms of a step are in.

use candle_core::{DType, Tensor};
use tracing::debug;

use super::gradients::GradientBuffer;
use crate::error::{Error, Result};
use crate::model::Prediction;

/// Label value excluded from losses and metrics
pub const IGNORE_LABEL: i64 = -1;

/// Mean cross-entropy over pixels whose label lies in `[0, K)`
///
/// `logits` is `[N, K, H, W]`, `labels` is `[N, H, W]`. Pixels labelled
/// [`IGNORE_LABEL`] (or any other out-of-range value) are excluded. A map
/// with no valid pixel gives a zero loss.
pub fn cross_entropy_ignore(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (n, k, h, w) = logits.dims4()?;
    if labels.dims() != [n, h, w] {
        return Err(Error::invalid_input(format!(
            "labels {:?} do not match logits {:?}",
            labels.dims(),
            logits.dims()
        )));
    }

    let labels = labels.to_dtype(DType::I64)?;
    let valid = labels.ge(0i64)?.mul(&labels.lt(k as i64)?)?;
    let safe = valid.where_cond(&labels, &labels.zeros_like()?)?;

    let log_probs = candle_nn::ops::log_softmax(logits, 1)?;
    let picked = log_probs
        .gather(&safe.to_dtype(DType::U32)?.unsqueeze(1)?, 1)?
        .squeeze(1)?;

    let count = valid_pixel_count(&valid)?;
    if count == 0 {
        return Ok((picked.sum_all()? * 0.0)?);
    }

    let total = picked.mul(&valid.to_dtype(logits.dtype())?)?.sum_all()?;
    Ok((total.neg()? / count as f64)?)
}

/// Number of set entries in a 0/1 mask, counted exactly in i64
fn valid_pixel_count(mask: &Tensor) -> Result<u64> {
    let count = mask.to_dtype(DType::I64)?.sum_all()?.to_scalar::<i64>()?;
    Ok(count.max(0) as u64)
}

/// Arg-max class per pixel, as i64 `[N, H, W]`
pub fn hard_labels(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.argmax_keepdim(1)?.squeeze(1)?.to_dtype(DType::I64)?)
}

/// Softmax over the class dimension
pub fn class_probabilities(logits: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::softmax(logits, 1)?)
}

/// Max over the class dimension, `[N, H, W]`
pub fn max_confidence(probs: &Tensor) -> Result<Tensor> {
    Ok(probs.max_keepdim(1)?.squeeze(1)?)
}

/// One recorded loss contribution
#[derive(Debug, Clone, PartialEq)]
pub struct LossTerm {
    /// `{term}_main` or `{term}_aux`
    pub name: String,

    /// Weighted value, detached
    pub value: f64,

    /// Effective weight applied to the raw cross-entropy
    pub weight: f64,
}

/// Collects named loss terms for one step and drives the shared gradient buffer
pub struct LossAggregator {
    buffer: GradientBuffer,
    terms: Vec<LossTerm>,
    aux_enabled: bool,
    aux_weight: f64,
}

impl LossAggregator {
    pub fn new(buffer: GradientBuffer, aux_enabled: bool, aux_weight: f64) -> Self {
        Self {
            buffer,
            terms: Vec::new(),
            aux_enabled,
            aux_weight,
        }
    }

    /// Forget the recorded values of the previous step
    pub fn begin_step(&mut self) {
        self.terms.clear();
    }

    /// Add a weighted term and backpropagate it immediately
    ///
    /// The main head contributes `weight * CE(main, main_labels)`; with the
    /// auxiliary head enabled, `aux_weight * weight * CE(aux, aux_labels)` is
    /// added too, `aux_labels` defaulting to `main_labels`.
    pub fn add_term(
        &mut self,
        name: &str,
        prediction: &Prediction,
        main_labels: &Tensor,
        aux_labels: Option<&Tensor>,
        weight: f64,
    ) -> Result<f64> {
        let main = (cross_entropy_ignore(prediction.main(), main_labels)? * weight)?;
        let main_value = scalar(&main)?;

        let (objective, aux_value) = if self.aux_enabled {
            let aux_logits = prediction.require_aux()?;
            let aux_weight = self.aux_weight * weight;
            let aux = (cross_entropy_ignore(aux_logits, aux_labels.unwrap_or(main_labels))? * aux_weight)?;
            let aux_value = scalar(&aux)?;
            ((main + aux)?, Some((aux_value, aux_weight)))
        } else {
            (main, None)
        };

        self.buffer.accumulate(&objective)?;

        self.terms.push(LossTerm {
            name: format!("{}_main", name),
            value: main_value,
            weight,
        });
        let mut total = main_value;
        if let Some((value, weight)) = aux_value {
            self.terms.push(LossTerm {
                name: format!("{}_aux", name),
                value,
                weight,
            });
            total += value;
        }

        debug!("Loss term {}: {:.5}", name, total);
        Ok(total)
    }

    /// Sum of every value recorded this step
    pub fn finalize(&self) -> f64 {
        self.terms.iter().map(|t| t.value).sum()
    }

    pub fn terms(&self) -> &[LossTerm] {
        &self.terms
    }

    /// Distinct term names added this step, in order (`source`, `self_best`, ...)
    pub fn term_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for term in &self.terms {
            let base = term
                .name
                .strip_suffix("_main")
                .or_else(|| term.name.strip_suffix("_aux"))
                .unwrap_or(&term.name);
            if !names.contains(&base) {
                names.push(base);
            }
        }
        names
    }

    pub fn gradients(&self) -> &GradientBuffer {
        &self.buffer
    }

    pub fn clear_gradients(&mut self) {
        self.buffer.clear();
    }

    pub fn aux_enabled(&self) -> bool {
        self.aux_enabled
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
