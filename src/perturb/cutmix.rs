//! Box CutMix between two labelled batches

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Beta;

use super::CutMixer;
use crate::error::{Error, Result};
use crate::training::mixing::blend_by_mask;

/// Pastes one random box per sample from the second batch into the first.
///
/// The box area fraction is `1 - lam` with `lam ~ Beta(alpha, alpha)`; the
/// box centre is uniform over the image and the box is clipped at the border.
pub struct BoxCutMixer {
    rng: StdRng,
    alpha: f64,
}

impl BoxCutMixer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            alpha: 1.0,
        }
    }

    pub fn with_alpha(seed: u64, alpha: f64) -> Result<Self> {
        if alpha.is_nan() || alpha <= 0.0 {
            return Err(Error::invalid_input(format!("cutmix alpha must be positive, got {alpha}")));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            alpha,
        })
    }

    /// Half-open box `(y0, y1, x0, x1)` for an `h x w` image
    fn draw_box(&mut self, h: usize, w: usize) -> Result<(usize, usize, usize, usize)> {
        let beta = Beta::new(self.alpha, self.alpha)
            .map_err(|e| Error::invalid_state(format!("cutmix distribution: {e}")))?;
        let lam: f64 = self.rng.sample(beta);
        let ratio = (1.0 - lam).sqrt();

        let cut_h = (h as f64 * ratio) as usize;
        let cut_w = (w as f64 * ratio) as usize;
        let cy = self.rng.random_range(0..h);
        let cx = self.rng.random_range(0..w);

        let y0 = cy.saturating_sub(cut_h / 2);
        let y1 = (cy + cut_h / 2).min(h);
        let x0 = cx.saturating_sub(cut_w / 2);
        let x1 = (cx + cut_w / 2).min(w);
        Ok((y0, y1, x0, x1))
    }
}

impl CutMixer for BoxCutMixer {
    fn combine(
        &mut self,
        img1: &Tensor,
        lab1: &Tensor,
        img2: &Tensor,
        lab2: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (n, _c, h, w) = img1.dims4()?;
        if lab1.dims() != [n, h, w] || lab2.dims() != [n, h, w] {
            return Err(Error::invalid_input(format!(
                "cutmix labels {:?} / {:?} do not match images {:?}",
                lab1.dims(),
                lab2.dims(),
                img1.dims()
            )));
        }

        let mut mask = vec![0u8; n * h * w];
        for i in 0..n {
            let (y0, y1, x0, x1) = self.draw_box(h, w)?;
            for y in y0..y1 {
                let row = i * h * w + y * w;
                mask[row + x0..row + x1].fill(1);
            }
        }
        let mask = Tensor::from_vec(mask, (n, h, w), img1.device())?;

        let image = blend_by_mask(img2, img1, &mask)?;
        let labels = mask.where_cond(&lab2.to_dtype(DType::I64)?, &lab1.to_dtype(DType::I64)?)?;
        Ok((image, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_labels_follow_pasted_pixels() {
        let device = Device::Cpu;
        let img1 = Tensor::zeros((4, 3, 8, 8), DType::F32, &device).unwrap();
        let img2 = Tensor::ones((4, 3, 8, 8), DType::F32, &device).unwrap();
        let lab1 = Tensor::zeros((4, 8, 8), DType::I64, &device).unwrap();
        let lab2 = Tensor::ones((4, 8, 8), DType::I64, &device).unwrap();

        let mut mixer = BoxCutMixer::new(11);
        let (image, labels) = mixer.combine(&img1, &lab1, &img2, &lab2).unwrap();
        assert_eq!(image.dims(), &[4, 3, 8, 8]);
        assert_eq!(labels.dims(), &[4, 8, 8]);

        // every channel of a pixel comes from the same batch as its label
        let labels: Vec<i64> = labels.flatten_all().unwrap().to_vec1().unwrap();
        let channel0: Vec<f32> = image
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (l, p) in labels.iter().zip(channel0.iter()) {
            assert_eq!(*l as f32, *p);
        }
    }

    #[test]
    fn test_box_stays_inside_image() {
        let mut mixer = BoxCutMixer::new(0);
        for _ in 0..100 {
            let (y0, y1, x0, x1) = mixer.draw_box(5, 7).unwrap();
            assert!(y0 <= y1 && y1 <= 5);
            assert!(x0 <= x1 && x1 <= 7);
        }
    }

    #[test]
    fn test_invalid_alpha() {
        assert!(BoxCutMixer::with_alpha(0, 0.0).is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let device = Device::Cpu;
        let img = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let lab = Tensor::zeros((1, 4, 4), DType::I64, &device).unwrap();
        let bad = Tensor::zeros((1, 4, 5), DType::I64, &device).unwrap();
        assert!(BoxCutMixer::new(0).combine(&img, &lab, &img, &bad).is_err());
    }
}
