//! Per-sample horizontal flip with brightness/contrast jitter

use candle_core::{Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::Augmenter;
use crate::error::{Error, Result};

/// Flips each sample with probability `flip_prob` (images and all label maps
/// together) and jitters image gain and bias; labels are never jittered.
pub struct FlipJitterAugmenter {
    rng: StdRng,
    flip_prob: f64,
    gain_std: f64,
    bias_std: f64,
}

impl FlipJitterAugmenter {
    pub fn new(seed: u64) -> Self {
        Self::with_params(seed, 0.5, 0.1, 0.05)
    }

    pub fn with_params(seed: u64, flip_prob: f64, gain_std: f64, bias_std: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            flip_prob: flip_prob.clamp(0.0, 1.0),
            gain_std: gain_std.abs(),
            bias_std: bias_std.abs(),
        }
    }

    fn jitter(&mut self) -> (f64, f64) {
        let z_gain: f64 = self.rng.sample(StandardNormal);
        let z_bias: f64 = self.rng.sample(StandardNormal);
        (1.0 + self.gain_std * z_gain, self.bias_std * z_bias)
    }
}

fn flip_width(t: &Tensor) -> Result<Tensor> {
    let w = t.dim(D::Minus1)?;
    let reversed: Vec<u32> = (0..w as u32).rev().collect();
    let idx = Tensor::new(reversed.as_slice(), t.device())?;
    Ok(t.index_select(&idx, t.rank() - 1)?)
}

impl Augmenter for FlipJitterAugmenter {
    fn augment(&mut self, images: &Tensor, label_maps: &[&Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        let (n, _c, h, w) = images.dims4()?;
        for labels in label_maps {
            if labels.dims() != [n, h, w] {
                return Err(Error::invalid_input(format!(
                    "label map {:?} does not match images {:?}",
                    labels.dims(),
                    images.dims()
                )));
            }
        }

        let mut out_images = Vec::with_capacity(n);
        let mut out_labels: Vec<Vec<Tensor>> = vec![Vec::with_capacity(n); label_maps.len()];

        for i in 0..n {
            let flip = self.rng.random_bool(self.flip_prob);
            let (gain, bias) = self.jitter();

            let mut image = images.narrow(0, i, 1)?;
            if flip {
                image = flip_width(&image)?;
            }
            out_images.push(image.affine(gain, bias)?);

            for (slot, labels) in out_labels.iter_mut().zip(label_maps) {
                let mut sample = labels.narrow(0, i, 1)?;
                if flip {
                    sample = flip_width(&sample)?;
                }
                slot.push(sample);
            }
        }

        let images = Tensor::cat(&out_images, 0)?;
        let labels = out_labels
            .iter()
            .map(|parts| Tensor::cat(parts, 0).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        Ok((images, labels))
    }
}
