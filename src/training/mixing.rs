//! Mask-driven blending of target and source images

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Keep `target` pixels where `mask` is set, take `source` pixels elsewhere
///
/// `mask` is `[N, H, W]` and is broadcast across the channel dimension of
/// the `[N, C, H, W]` images.
pub fn blend_by_mask(target: &Tensor, source: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if target.dims() != source.dims() {
        return Err(Error::invalid_input(format!(
            "cannot blend images of shapes {:?} and {:?}",
            target.dims(),
            source.dims()
        )));
    }
    let (n, c, h, w) = target.dims4()?;
    if mask.dims() != [n, h, w] {
        return Err(Error::invalid_input(format!(
            "mask {:?} does not cover images {:?}",
            mask.dims(),
            target.dims()
        )));
    }

    let mask = mask.unsqueeze(1)?.broadcast_as((n, c, h, w))?.contiguous()?;
    Ok(mask.where_cond(target, source)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_mask_selects_per_pixel_across_channels() {
        let device = Device::Cpu;
        let target = Tensor::ones((1, 2, 1, 2), DType::F32, &device).unwrap();
        let source = Tensor::zeros((1, 2, 1, 2), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[[1u8, 0]]], &device).unwrap();

        let hybrid = blend_by_mask(&target, &source, &mask).unwrap();
        let values: Vec<f32> = hybrid.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let device = Device::Cpu;
        let target = Tensor::ones((1, 2, 2, 2), DType::F32, &device).unwrap();
        let source = Tensor::zeros((1, 2, 2, 2), DType::F32, &device).unwrap();
        let mask = Tensor::ones((1, 2, 3), DType::U8, &device).unwrap();
        assert!(blend_by_mask(&target, &source, &mask).is_err());
    }
}
