//! Image perturbations used by the consistency losses
//!
//! Each perturbation is a trait so the trainer can be driven by the shipped
//! implementations or by test doubles.

pub mod augment;
pub mod cutmix;
pub mod fourier;

pub use augment::FlipJitterAugmenter;
pub use cutmix::BoxCutMixer;
pub use fourier::SpectralMixer;

use candle_core::Tensor;

use crate::error::Result;

/// Photometric/geometric augmentation of a batch and its label maps
pub trait Augmenter {
    /// Augment `images` `[N, C, H, W]`; every map in `label_maps` (`[N, H, W]`)
    /// receives the same geometric transform as the images
    fn augment(&mut self, images: &Tensor, label_maps: &[&Tensor]) -> Result<(Tensor, Vec<Tensor>)>;
}

/// Spectral style transfer between image batches
pub trait FourierMixer {
    /// Keep the phase of `src` and take the low-frequency amplitude of `tgt`
    fn mix(&mut self, src: &Tensor, tgt: &Tensor, beta: f64) -> Result<Tensor>;
}

/// Region mixing of two labelled batches
pub trait CutMixer {
    /// Paste a region of `(img2, lab2)` into `(img1, lab1)`
    fn combine(
        &mut self,
        img1: &Tensor,
        lab1: &Tensor,
        img2: &Tensor,
        lab2: &Tensor,
    ) -> Result<(Tensor, Tensor)>;
}

/// The three perturbations used by a training step
pub struct Perturbations {
    pub augmenter: Box<dyn Augmenter>,
    pub fourier: Box<dyn FourierMixer>,
    pub cutmix: Box<dyn CutMixer>,
}

impl Perturbations {
    /// Flip/jitter augmentation, spectral mixing and box CutMix, seeded
    pub fn standard(seed: u64) -> Self {
        Self {
            augmenter: Box::new(FlipJitterAugmenter::new(seed)),
            fourier: Box::new(SpectralMixer::new()),
            cutmix: Box::new(BoxCutMixer::new(seed.wrapping_add(1))),
        }
    }
}
