//! Confusion-matrix segmentation metrics
//!
//! Pixel accuracy, mean pixel accuracy, mean IoU, frequency-weighted IoU and
//! mean precision. In 16-class mode (the Synthia protocol) every
//! class-averaged metric is also reported over the 13-class subset.

use candle_core::{DType, Tensor};
use ndarray::{Array1, Array2};

use crate::error::{Error, Result};

/// Class indices of the 13-class subset of the 16-class protocol
pub const SUBSET_13: [usize; 13] = [0, 1, 2, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// Metric over all classes, plus the 13-class subset in 16-class mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPair {
    pub full: f64,
    pub subset: Option<f64>,
}

impl MetricPair {
    /// Value used for reporting and best-model comparison
    pub fn headline(&self) -> f64 {
        self.subset.unwrap_or(self.full)
    }
}

/// Accumulates a `K x K` confusion matrix (rows: ground truth, cols: prediction)
#[derive(Debug, Clone)]
pub struct Evaluator {
    num_class: usize,
    confusion: Array2<u64>,
    subset_mode: bool,
}

impl Evaluator {
    /// `class_16` enables the 16/13-class pair and requires exactly 16 classes
    pub fn new(num_class: usize, class_16: bool) -> Result<Self> {
        if class_16 && num_class != 16 {
            return Err(Error::config(format!(
                "16-class mode needs 16 classes, got {}",
                num_class
            )));
        }
        Ok(Self {
            num_class,
            confusion: Array2::zeros((num_class, num_class)),
            subset_mode: class_16,
        })
    }

    pub fn is_class_16(&self) -> bool {
        self.subset_mode
    }

    pub fn num_class(&self) -> usize {
        self.num_class
    }

    pub fn reset(&mut self) {
        self.confusion.fill(0);
    }

    pub fn confusion_matrix(&self) -> &Array2<u64> {
        &self.confusion
    }

    /// Count pixels whose ground truth is in `[0, K)`
    pub fn add_batch(&mut self, gt: &[i64], pred: &[i64]) -> Result<()> {
        if gt.len() != pred.len() {
            return Err(Error::invalid_input(format!(
                "ground truth has {} pixels but prediction has {}",
                gt.len(),
                pred.len()
            )));
        }
        let k = self.num_class as i64;
        for (&g, &p) in gt.iter().zip(pred.iter()) {
            if (0..k).contains(&g) && (0..k).contains(&p) {
                self.confusion[[g as usize, p as usize]] += 1;
            }
        }
        Ok(())
    }

    /// Accumulate from `[N, H, W]` label tensors
    pub fn add_tensors(&mut self, gt: &Tensor, pred: &Tensor) -> Result<()> {
        let gt = gt.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        let pred = pred.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        self.add_batch(&gt, &pred)
    }

    fn diag(&self) -> Array1<f64> {
        self.confusion.diag().mapv(|v| v as f64)
    }

    fn row_sums(&self) -> Array1<f64> {
        self.confusion.sum_axis(ndarray::Axis(1)).mapv(|v| v as f64)
    }

    fn col_sums(&self) -> Array1<f64> {
        self.confusion.sum_axis(ndarray::Axis(0)).mapv(|v| v as f64)
    }

    fn total(&self) -> f64 {
        self.confusion.sum() as f64
    }

    fn pair(&self, per_class: &Array1<f64>) -> MetricPair {
        let full = nanmean(per_class.iter().copied());
        let subset = self
            .subset_mode
            .then(|| nanmean(SUBSET_13.iter().map(|&i| per_class[i])));
        MetricPair { full, subset }
    }

    /// Correct pixels over all counted pixels
    pub fn pixel_accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0.0 {
            return 0.0;
        }
        self.diag().sum() / total
    }

    /// Per-class recall averaged over classes present in the ground truth
    pub fn mean_pixel_accuracy(&self) -> MetricPair {
        let acc = &self.diag() / &self.row_sums();
        self.pair(&acc)
    }

    /// Per-class IoU, NaN for classes absent from both prediction and ground truth
    pub fn class_iou(&self) -> Array1<f64> {
        let diag = self.diag();
        let union = &self.row_sums() + &self.col_sums() - &diag;
        &diag / &union
    }

    pub fn mean_iou(&self) -> MetricPair {
        self.pair(&self.class_iou())
    }

    /// IoU weighted by ground-truth class frequency
    pub fn fw_iou(&self) -> MetricPair {
        let total = self.total();
        if total == 0.0 {
            return MetricPair {
                full: 0.0,
                subset: self.subset_mode.then_some(0.0),
            };
        }
        let freq = self.row_sums() / total;
        let iou = self.class_iou();
        let weighted = |indices: &mut dyn Iterator<Item = usize>| -> f64 {
            indices
                .filter(|&i| freq[i] > 0.0 && !iou[i].is_nan())
                .map(|i| freq[i] * iou[i])
                .sum()
        };

        MetricPair {
            full: weighted(&mut (0..self.num_class)),
            subset: self.subset_mode.then(|| weighted(&mut SUBSET_13.iter().copied())),
        }
    }

    /// Per-class precision averaged over predicted classes
    pub fn mean_precision(&self) -> MetricPair {
        let precision = &self.diag() / &self.col_sums();
        self.pair(&precision)
    }

    /// One line per class: `index, IoU, precision`
    pub fn per_class_table(&self, class_names: Option<&[&str]>) -> Vec<String> {
        let iou = self.class_iou();
        let precision = &self.diag() / &self.col_sums();
        (0..self.num_class)
            .map(|i| {
                let name = class_names
                    .and_then(|names| names.get(i).copied())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("class_{:02}", i));
                let in_subset = if self.subset_mode && !SUBSET_13.contains(&i) {
                    " (excluded from 13)"
                } else {
                    ""
                };
                format!(
                    "{:>14}: IoU {:6.2}  Precision {:6.2}{}",
                    name,
                    iou[i] * 100.0,
                    precision[i] * 100.0,
                    in_subset
                )
            })
            .collect()
    }
}

/// Mean of non-NaN values; 0 when there are none
fn nanmean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Cityscapes class names in training-id order
pub const CITYSCAPES_CLASSES: [&str; 19] = [
    "road",
    "sidewalk",
    "building",
    "wall",
    "fence",
    "pole",
    "light",
    "sign",
    "vegetation",
    "terrain",
    "sky",
    "person",
    "rider",
    "car",
    "truck",
    "bus",
    "train",
    "motorcycle",
    "bicycle",
];
