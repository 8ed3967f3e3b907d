//! Waveform regularizers added to the control cost.
//!
//! Each constructor returns a closure scoring the shaped waveform (one row
//! per control, one column per raw sample) and returning the cost together
//! with its gradient in the same layout. IQ-paired variants treat consecutive
//! row pairs as the real and imaginary parts of one drive and penalize the
//! power envelope `i² + q²` instead of the bare samples.

use ndarray::{ self as nd };
use crate::error::Result;
use crate::response::{ Response, downsample, upsample };

/// Waveform penalty: cost and gradient with respect to every sample.
pub type PenaltyFn
    = Box<dyn Fn(&nd::Array2<f64>) -> Result<(f64, nd::Array2<f64>)>
        + Send + Sync>;

fn iq_envelope(waves: &nd::Array2<f64>) -> nd::Array2<f64> {
    let (n, plen) = waves.dim();
    nd::Array2::from_shape_fn(
        (n / 2, plen),
        |(p, t)| {
            waves[[2 * p, t]].powi(2) + waves[[2 * p + 1, t]].powi(2)
        },
    )
}

/// Linear amplitude cost `reg Σ |w|` (or `reg Σ √(i² + q²)` over IQ pairs).
pub fn lin_amp_cost(reg: f64, iq_pairs: bool) -> PenaltyFn {
    Box::new(move |waves| {
        if iq_pairs {
            let (n, plen) = waves.dim();
            let mut cost = 0.0;
            let mut grad: nd::Array2<f64> = nd::Array2::zeros(waves.raw_dim());
            for p in 0..n / 2 {
                for t in 0..plen {
                    let i = waves[[2 * p, t]];
                    let q = waves[[2 * p + 1, t]];
                    let a = i.hypot(q);
                    cost += reg * a;
                    if a > 0.0 {
                        grad[[2 * p, t]] = reg * i / a;
                        grad[[2 * p + 1, t]] = reg * q / a;
                    }
                }
            }
            Ok((cost, grad))
        } else {
            let cost = reg * waves.iter().map(|w| w.abs()).sum::<f64>();
            let grad = waves.mapv(|w| reg * w.signum());
            Ok((cost, grad))
        }
    })
}

/// Soft amplitude ceiling `reg Σ (e^{w²/2τ²} - 1)`: negligible below the
/// threshold `τ`, rapidly dominant above it.
pub fn amp_cost(reg: f64, thresh: f64, iq_pairs: bool) -> PenaltyFn {
    let t2 = thresh * thresh;
    Box::new(move |waves| {
        if iq_pairs {
            let env = iq_envelope(waves);
            let cost = reg * env.iter()
                .map(|a| (a / (2.0 * t2)).exp() - 1.0)
                .sum::<f64>();
            let mut grad: nd::Array2<f64> = nd::Array2::zeros(waves.raw_dim());
            for ((p, t), &a) in env.indexed_iter() {
                let d = reg / (2.0 * t2) * (a / (2.0 * t2)).exp();
                grad[[2 * p, t]] = d * 2.0 * waves[[2 * p, t]];
                grad[[2 * p + 1, t]] = d * 2.0 * waves[[2 * p + 1, t]];
            }
            Ok((cost, grad))
        } else {
            let cost = reg * waves.iter()
                .map(|w| (w * w / (2.0 * t2)).exp() - 1.0)
                .sum::<f64>();
            let grad = waves
                .mapv(|w| reg * (w / t2) * (w * w / (2.0 * t2)).exp());
            Ok((cost, grad))
        }
    })
}

fn diff_quad(waves: &nd::Array2<f64>, reg: f64) -> (f64, nd::Array2<f64>) {
    let (n, plen) = waves.dim();
    let mut cost = 0.0;
    let mut grad: nd::Array2<f64> = nd::Array2::zeros(waves.raw_dim());
    for k in 0..n {
        for t in 0..plen - 1 {
            let df = waves[[k, t + 1]] - waves[[k, t]];
            cost += reg * df * df;
            grad[[k, t]] -= 2.0 * reg * df;
            grad[[k, t + 1]] += 2.0 * reg * df;
        }
    }
    (cost, grad)
}

/// Quadratic slew-rate cost `reg Σ (w[t+1] - w[t])²`; the IQ variant
/// penalizes the slew of the power envelope, leaving rapid phase rotation at
/// constant power unpunished.
pub fn lin_deriv_cost(reg: f64, iq_pairs: bool) -> PenaltyFn {
    Box::new(move |waves| {
        if iq_pairs {
            let env = iq_envelope(waves);
            let (cost, env_grad) = diff_quad(&env, reg);
            let mut grad: nd::Array2<f64> = nd::Array2::zeros(waves.raw_dim());
            for ((p, t), &d) in env_grad.indexed_iter() {
                grad[[2 * p, t]] = d * 2.0 * waves[[2 * p, t]];
                grad[[2 * p + 1, t]] = d * 2.0 * waves[[2 * p + 1, t]];
            }
            Ok((cost, grad))
        } else {
            Ok(diff_quad(waves, reg))
        }
    })
}

/// Exponential slew-rate ceiling `reg Σ (e^{(w[t+1]-w[t])²/2τ²} - 1)`.
pub fn deriv_cost(reg: f64, thresh: f64) -> PenaltyFn {
    let t2 = thresh * thresh;
    Box::new(move |waves| {
        let (n, plen) = waves.dim();
        let mut cost = 0.0;
        let mut grad: nd::Array2<f64> = nd::Array2::zeros(waves.raw_dim());
        for k in 0..n {
            for t in 0..plen - 1 {
                let df = waves[[k, t + 1]] - waves[[k, t]];
                cost += reg * ((df * df / (2.0 * t2)).exp() - 1.0);
                let d = reg * (df / t2) * (df * df / (2.0 * t2)).exp();
                grad[[k, t]] -= d;
                grad[[k, t + 1]] += d;
            }
        }
        Ok((cost, grad))
    })
}

/// Smoothed L1 sparsity penalty.
///
/// Large samples pay `reg |w|` exactly; samples with `α|w| ≤ 25` use the
/// softplus smoothing `(reg/α)(log(1+e^{αw}) + log(1+e^{-αw}))` (offset to
/// vanish at zero), whose gradient `reg tanh(αw/2)` is continuous through
/// the origin.
pub fn l1_penalty(reg: f64, alpha: f64) -> PenaltyFn {
    let cut = 25.0 / alpha;
    let offset = 2.0 * (2.0_f64).ln() / alpha;
    Box::new(move |waves| {
        let cost = reg * waves.iter()
            .map(|&w| {
                if w.abs() > cut {
                    w.abs()
                } else {
                    ((1.0 + (alpha * w).exp()).ln()
                        + (1.0 + (-alpha * w).exp()).ln()) / alpha
                        - offset
                }
            })
            .sum::<f64>();
        let grad = waves.mapv(|w| {
            if w.abs() > cut {
                reg * w.signum()
            } else {
                reg * (alpha * w / 2.0).tanh()
            }
        });
        Ok((cost, grad))
    })
}

/// Penalize energy left ringing in the response tail after the nominal end
/// of the waveform, pushing the optimizer toward pulses the hardware can
/// actually terminate.
pub fn tail_cost(
    reg: f64,
    response: Response,
    impulse: nd::Array1<f64>,
) -> PenaltyFn
{
    Box::new(move |waves| {
        let up = upsample(waves, &impulse);
        let full = response.apply(&up)?;
        let (n, full_len) = full.dim();
        let tail_len = response.tail_len();
        let body = full_len - tail_len;
        let mut cost = 0.0;
        let mut full_grad: nd::Array2<f64> = nd::Array2::zeros(full.raw_dim());
        for k in 0..n {
            for t in body..full_len {
                cost += reg * full[[k, t]] * full[[k, t]];
                full_grad[[k, t]] = 2.0 * reg * full[[k, t]];
            }
        }
        let up_grad = response.adjoint(&full_grad)?;
        Ok((cost, downsample(&up_grad, &impulse)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ Rng, SeedableRng, rngs::StdRng };

    fn random_waves(shape: (usize, usize), rng: &mut StdRng)
        -> nd::Array2<f64>
    {
        nd::Array2::from_shape_fn(shape, |_| rng.gen_range(-1.0..1.0))
    }

    fn check_gradient(pen: &PenaltyFn, waves: &nd::Array2<f64>, tol: f64) {
        let eps = 1e-6;
        let (_, grad) = pen(waves).unwrap();
        for k in 0..waves.nrows() {
            for t in 0..waves.ncols() {
                let mut wp = waves.clone();
                wp[[k, t]] += eps;
                let (cp, _) = pen(&wp).unwrap();
                let mut wm = waves.clone();
                wm[[k, t]] -= eps;
                let (cm, _) = pen(&wm).unwrap();
                let fd = (cp - cm) / (2.0 * eps);
                let an = grad[[k, t]];
                assert!(
                    (fd - an).abs() < tol * fd.abs().max(an.abs()).max(1e-3),
                    "k={}, t={}: fd={:.6e}, analytic={:.6e}", k, t, fd, an,
                );
            }
        }
    }

    #[test]
    fn amp_cost_gradient() {
        let mut rng = StdRng::seed_from_u64(401);
        let waves = random_waves((2, 8), &mut rng);
        check_gradient(&amp_cost(1.5, 0.7, false), &waves, 1e-4);
        check_gradient(&amp_cost(1.5, 0.7, true), &waves, 1e-4);
    }

    #[test]
    fn lin_amp_cost_gradient() {
        let mut rng = StdRng::seed_from_u64(403);
        let waves = random_waves((2, 8), &mut rng);
        // the non-IQ variant is non-differentiable at 0; samples here are
        // bounded away from it
        check_gradient(&lin_amp_cost(0.8, false), &waves, 1e-4);
        check_gradient(&lin_amp_cost(0.8, true), &waves, 1e-4);
    }

    #[test]
    fn deriv_cost_gradients() {
        let mut rng = StdRng::seed_from_u64(409);
        let waves = random_waves((2, 10), &mut rng);
        check_gradient(&lin_deriv_cost(0.6, false), &waves, 1e-4);
        check_gradient(&lin_deriv_cost(0.6, true), &waves, 1e-4);
        check_gradient(&deriv_cost(0.6, 0.5), &waves, 1e-4);
    }

    #[test]
    fn l1_penalty_gradient_and_offset() {
        let mut rng = StdRng::seed_from_u64(419);
        let pen = l1_penalty(1.0, 10.0);
        let waves = random_waves((2, 8), &mut rng);
        check_gradient(&pen, &waves, 1e-4);
        let (zero_cost, _) = pen(&nd::Array2::zeros((2, 8))).unwrap();
        assert!(zero_cost.abs() < 1e-12);
    }

    #[test]
    fn tail_cost_gradient() {
        let mut rng = StdRng::seed_from_u64(421);
        let kern = random_waves((1, 4), &mut rng);
        let impulse = nd::Array1::ones(2);
        let pen = tail_cost(1.0, Response::Real(kern), impulse);
        let waves = random_waves((2, 6), &mut rng);
        check_gradient(&pen, &waves, 1e-4);
    }

    #[test]
    fn zero_waveform_costs_nothing() {
        let waves = nd::Array2::zeros((2, 8));
        for pen in [
            lin_amp_cost(1.0, false),
            amp_cost(1.0, 0.5, false),
            lin_deriv_cost(1.0, false),
            deriv_cost(1.0, 0.5),
        ] {
            let (cost, _) = pen(&waves).unwrap();
            assert_eq!(cost, 0.0);
        }
    }
}
