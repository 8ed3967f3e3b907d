//! Hardware-chain modeling between the optimizer's raw samples and the
//! waveform the quantum system actually sees.
//!
//! The forward pipeline is: multiply by a smooth turn-on/turn-off envelope,
//! upsample by an impulse pattern, then convolve with a measured response
//! kernel (either one real kernel per control line or one complex kernel per
//! IQ pair). Every stage is linear, so gradients flow back through the exact
//! adjoint: correlation against the conjugated kernel, impulse-weighted
//! downsampling, and the same envelope mask.

use ndarray::{ self as nd, linalg::kron, Axis };
use num_complex::Complex64 as C64;
use num_traits::Zero;
use crate::error::{ GrapeError, Result };

/// Measured transfer function of the control hardware, applied by direct
/// time-domain convolution.
#[derive(Clone, Debug)]
pub enum Response {
    /// One real kernel per control line (a single row is broadcast to all
    /// lines). Output rows are `n + m - 1` samples long.
    Real(nd::Array2<f64>),
    /// One complex kernel per IQ pair: rows `2p` and `2p + 1` of the control
    /// array are the I and Q components of pair `p`.
    Iq(nd::Array2<C64>),
}

fn convolve_full(x: &[C64], k: &[C64]) -> Vec<C64> {
    let n = x.len();
    let m = k.len();
    let mut out = vec![C64::zero(); n + m - 1];
    for (t, &xt) in x.iter().enumerate() {
        for (s, &ks) in k.iter().enumerate() {
            out[t + s] += xt * ks;
        }
    }
    out
}

/// Correlation of `g` against `k`, keeping only the fully-overlapping
/// window: `out[t] = Σ_s conj(k[s]) g[t + s]`, length `g.len() - k.len() + 1`.
fn correlate_valid(g: &[C64], k: &[C64]) -> Vec<C64> {
    let n = g.len();
    let m = k.len();
    let mut out = vec![C64::zero(); n - m + 1];
    for (t, o) in out.iter_mut().enumerate() {
        *o = k.iter().zip(&g[t..t + m])
            .map(|(&ks, &gs)| ks.conj() * gs)
            .sum();
    }
    out
}

impl Response {
    fn kernel_for(&self, row: usize, n_rows: usize) -> Result<usize> {
        let nk = match self {
            Self::Real(k) => k.nrows(),
            Self::Iq(k) => k.nrows(),
        };
        if nk == 1 {
            Ok(0)
        } else if nk == n_rows {
            Ok(row)
        } else {
            Err(GrapeError::MalformedResponse(
                format!("{} kernel rows for {} control rows", nk, n_rows)
            ))
        }
    }

    /// Number of extra samples the convolution appends.
    pub fn tail_len(&self) -> usize {
        match self {
            Self::Real(k) => k.ncols() - 1,
            Self::Iq(k) => k.ncols() - 1,
        }
    }

    /// Convolve every control row (or IQ pair) with its kernel.
    pub fn apply(&self, controls: &nd::Array2<f64>)
        -> Result<nd::Array2<f64>>
    {
        let (n_ctrls, plen) = controls.dim();
        let out_len = plen + self.tail_len();
        let mut out: nd::Array2<f64> = nd::Array2::zeros((n_ctrls, out_len));
        match self {
            Self::Real(kern) => {
                for (r, row) in controls.rows().into_iter().enumerate() {
                    let ki = self.kernel_for(r, n_ctrls)?;
                    let x: Vec<C64>
                        = row.iter().map(|&v| C64::from(v)).collect();
                    let k: Vec<C64> = kern.row(ki).iter()
                        .map(|&v| C64::from(v))
                        .collect();
                    for (t, w) in convolve_full(&x, &k).iter().enumerate() {
                        out[[r, t]] = w.re;
                    }
                }
            },
            Self::Iq(kern) => {
                if n_ctrls % 2 != 0 {
                    return Err(GrapeError::MalformedResponse(
                        format!(
                            "IQ response requires an even number of control \
                            rows, got {}", n_ctrls,
                        )
                    ));
                }
                for p in 0..n_ctrls / 2 {
                    let ki = self.kernel_for(p, n_ctrls / 2)?;
                    let z: Vec<C64> = (0..plen)
                        .map(|t| C64::new(
                            controls[[2 * p, t]], controls[[2 * p + 1, t]]))
                        .collect();
                    let k: Vec<C64> = kern.row(ki).to_vec();
                    for (t, w) in convolve_full(&z, &k).iter().enumerate() {
                        out[[2 * p, t]] = w.re;
                        out[[2 * p + 1, t]] = w.im;
                    }
                }
            },
        }
        Ok(out)
    }

    /// Pull a gradient with respect to the convolved waveform back to the
    /// pre-convolution samples.
    pub fn adjoint(&self, grad: &nd::Array2<f64>)
        -> Result<nd::Array2<f64>>
    {
        let (n_ctrls, out_len) = grad.dim();
        let plen = out_len - self.tail_len();
        let mut out: nd::Array2<f64> = nd::Array2::zeros((n_ctrls, plen));
        match self {
            Self::Real(kern) => {
                for (r, row) in grad.rows().into_iter().enumerate() {
                    let ki = self.kernel_for(r, n_ctrls)?;
                    let g: Vec<C64>
                        = row.iter().map(|&v| C64::from(v)).collect();
                    let k: Vec<C64> = kern.row(ki).iter()
                        .map(|&v| C64::from(v))
                        .collect();
                    for (t, w) in correlate_valid(&g, &k).iter().enumerate() {
                        out[[r, t]] = w.re;
                    }
                }
            },
            Self::Iq(kern) => {
                if n_ctrls % 2 != 0 {
                    return Err(GrapeError::MalformedResponse(
                        format!(
                            "IQ response requires an even number of control \
                            rows, got {}", n_ctrls,
                        )
                    ));
                }
                for p in 0..n_ctrls / 2 {
                    let ki = self.kernel_for(p, n_ctrls / 2)?;
                    let g: Vec<C64> = (0..out_len)
                        .map(|t| C64::new(
                            grad[[2 * p, t]], grad[[2 * p + 1, t]]))
                        .collect();
                    let k: Vec<C64> = kern.row(ki).to_vec();
                    for (t, w) in correlate_valid(&g, &k).iter().enumerate() {
                        out[[2 * p, t]] = w.re;
                        out[[2 * p + 1, t]] = w.im;
                    }
                }
            },
        }
        Ok(out)
    }
}

/// Smooth turn-on/turn-off envelope `1 - e^{-t/σ} - e^{-(T-t)/σ}` sampled at
/// the raw waveform resolution; non-positive `σ` gives a flat envelope.
pub fn shape_envelope(plen: usize, dt: f64, sigma: f64) -> nd::Array1<f64> {
    if sigma <= 0.0 {
        return nd::Array1::ones(plen);
    }
    let total = plen as f64 * dt;
    nd::Array1::from_iter(
        (0..plen).map(|i| {
            let t = (i as f64 + 0.5) * dt;
            1.0 - (-t / sigma).exp() - (-(total - t) / sigma).exp()
        })
    )
}

/// Repeat every raw sample by the impulse pattern, taking each row from
/// length `plen` to `plen * impulse.len()`.
pub fn upsample(controls: &nd::Array2<f64>, impulse: &nd::Array1<f64>)
    -> nd::Array2<f64>
{
    let pattern = impulse.view().insert_axis(Axis(0));
    kron(controls, &pattern)
}

/// Adjoint of [`upsample`]: contract each length-`n_ss` block of the
/// gradient against the impulse pattern.
pub fn downsample(grad: &nd::Array2<f64>, impulse: &nd::Array1<f64>)
    -> nd::Array2<f64>
{
    let (n_ctrls, full_len) = grad.dim();
    let n_ss = impulse.len();
    let plen = full_len / n_ss;
    nd::Array2::from_shape_fn(
        (n_ctrls, plen),
        |(k, t)| {
            impulse.iter().enumerate()
                .map(|(s, &w)| w * grad[[k, t * n_ss + s]])
                .sum()
        },
    )
}

/// Time-domain Gaussian kernel with standard deviation `sigma`, truncated at
/// `width` standard deviations and normalized to unit sum.
pub fn gaussian_response(sigma: f64, dt: f64, width: f64)
    -> nd::Array1<f64>
{
    let half = ((width * sigma / dt).ceil() as usize).max(1);
    let mut k: nd::Array1<f64> = nd::Array1::from_iter(
        (0..2 * half + 1).map(|i| {
            let t = (i as f64 - half as f64) * dt;
            (-0.5 * (t / sigma).powi(2)).exp()
        })
    );
    let norm = k.sum();
    k.mapv_inplace(|v| v / norm);
    k
}
