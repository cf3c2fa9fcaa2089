//! Low-frequency amplitude swap in the 2-D discrete Fourier domain
//!
//! For each image plane the amplitude of the centred low-frequency square
//! `-b..=b` on both axes (the corner blocks of the unshifted spectrum,
//! `b = floor(min(H, W) * beta)`) is replaced by the amplitude of the corresponding target plane while the
//! source phase is kept. Only the touched frequencies are transformed: the
//! change is computed as a sparse spectrum and added back to the source
//! through a partial inverse DFT, which is exact for the real part.

use std::f64::consts::PI;

use candle_core::{DType, Tensor};
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::FourierMixer;
use crate::error::{Error, Result};

/// Spectral style mixer
#[derive(Debug, Default, Clone)]
pub struct SpectralMixer;

impl SpectralMixer {
    pub fn new() -> Self {
        Self
    }
}

/// Indices of the low-frequency band along one axis: `[0, b]` and `[n - b, n)`
fn band(n: usize, b: usize) -> Vec<usize> {
    let b = b.min(n);
    let mut idx: Vec<usize> = (0..(b + 1).min(n)).collect();
    for i in n.saturating_sub(b)..n {
        if !idx.contains(&i) {
            idx.push(i);
        }
    }
    idx
}

/// Twiddle factors `exp(sign * 2πi * k * x / n)` as `[k][x]` (cos, sin)
fn twiddles(freqs: &[usize], n: usize, sign: f64) -> Vec<Vec<(f64, f64)>> {
    freqs
        .iter()
        .map(|&k| {
            (0..n)
                .map(|x| {
                    let angle = sign * 2.0 * PI * ((k * x) % n) as f64 / n as f64;
                    (angle.cos(), angle.sin())
                })
                .collect()
        })
        .collect()
}

/// Spectrum of `plane` at rows `us` and columns `vs`, as `[u][v]` complex
fn partial_dft(
    plane: ArrayView2<f64>,
    row_tw: &[Vec<(f64, f64)>],
    col_tw: &[Vec<(f64, f64)>],
) -> Vec<Vec<(f64, f64)>> {
    let (h, _w) = plane.dim();

    // along width: P[y][v]
    let partial: Vec<Vec<(f64, f64)>> = (0..h)
        .map(|y| {
            let row = plane.row(y);
            col_tw
                .iter()
                .map(|tw| {
                    row.iter().zip(tw.iter()).fold((0.0, 0.0), |(re, im), (&x, &(c, s))| {
                        (re + x * c, im + x * s)
                    })
                })
                .collect()
        })
        .collect();

    // along height: F[u][v]
    row_tw
        .iter()
        .map(|tw| {
            (0..col_tw.len())
                .map(|vi| {
                    (0..h).fold((0.0, 0.0), |(re, im), y| {
                        let (pr, pi) = partial[y][vi];
                        let (c, s) = tw[y];
                        (re + pr * c - pi * s, im + pr * s + pi * c)
                    })
                })
                .collect()
        })
        .collect()
}

fn mix_plane(src: ArrayView2<f64>, tgt: ArrayView2<f64>, b: usize) -> Array2<f64> {
    let (h, w) = src.dim();
    let us = band(h, b);
    let vs = band(w, b);

    let fwd_rows = twiddles(&us, h, -1.0);
    let fwd_cols = twiddles(&vs, w, -1.0);
    let spec_src = partial_dft(src, &fwd_rows, &fwd_cols);
    let spec_tgt = partial_dft(tgt, &fwd_rows, &fwd_cols);

    // delta = (|T| - |S|) * exp(i * arg S)
    let delta: Vec<Vec<(f64, f64)>> = spec_src
        .iter()
        .zip(spec_tgt.iter())
        .map(|(srow, trow)| {
            srow.iter()
                .zip(trow.iter())
                .map(|(&(sr, si), &(tr, ti))| {
                    let amp_s = (sr * sr + si * si).sqrt();
                    let amp_t = (tr * tr + ti * ti).sqrt();
                    let (cos, sin) = if amp_s > 0.0 { (sr / amp_s, si / amp_s) } else { (1.0, 0.0) };
                    let d = amp_t - amp_s;
                    (d * cos, d * sin)
                })
                .collect()
        })
        .collect();

    let inv_rows = twiddles(&us, h, 1.0);
    let inv_cols = twiddles(&vs, w, 1.0);
    let scale = 1.0 / (h * w) as f64;

    // Q[y][v] = Σ_u delta[u][v] e^{+iθ}
    let q: Vec<Vec<(f64, f64)>> = (0..h)
        .map(|y| {
            (0..vs.len())
                .map(|vi| {
                    delta.iter().zip(inv_rows.iter()).fold((0.0, 0.0), |(re, im), (drow, tw)| {
                        let (dr, di) = drow[vi];
                        let (c, s) = tw[y];
                        (re + dr * c - di * s, im + dr * s + di * c)
                    })
                })
                .collect()
        })
        .collect();

    let mut out = src.to_owned();
    for y in 0..h {
        for x in 0..w {
            let real: f64 = q[y]
                .iter()
                .zip(inv_cols.iter())
                .map(|(&(qr, qi), tw)| {
                    let (c, s) = tw[x];
                    qr * c - qi * s
                })
                .sum();
            out[[y, x]] += real * scale;
        }
    }
    out
}

impl FourierMixer for SpectralMixer {
    fn mix(&mut self, src: &Tensor, tgt: &Tensor, beta: f64) -> Result<Tensor> {
        if src.dims() != tgt.dims() {
            return Err(Error::invalid_input(format!(
                "cannot mix spectra of shapes {:?} and {:?}",
                src.dims(),
                tgt.dims()
            )));
        }
        let (n, c, h, w) = src.dims4()?;
        let b = (h.min(w) as f64 * beta).floor() as usize;
        if b == 0 {
            return Ok(src.copy()?);
        }

        let src_data = src.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        let tgt_data = tgt.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        let plane = h * w;

        let mixed: Vec<f64> = (0..n * c)
            .into_par_iter()
            .map(|p| {
                let range = p * plane..(p + 1) * plane;
                let s = ArrayView2::from_shape((h, w), &src_data[range.clone()])
                    .map_err(|e| Error::invalid_state(e.to_string()))?;
                let t = ArrayView2::from_shape((h, w), &tgt_data[range])
                    .map_err(|e| Error::invalid_state(e.to_string()))?;
                Ok(mix_plane(s, t, b).into_raw_vec())
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        Ok(Tensor::from_vec(mixed, (n, c, h, w), src.device())?.to_dtype(src.dtype())?)
    }
}
