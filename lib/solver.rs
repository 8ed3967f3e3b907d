//! Bounded quasi-Newton minimizer.
//!
//! Limited-memory BFGS with box constraints handled by projection: search
//! points are clamped to the bounds, curvature pairs come from the projected
//! steps, and convergence is measured on the projected gradient. The line
//! search is Armijo backtracking against the projected step. Objectives can
//! short-circuit the whole search by setting [`ObjectiveEval::satisfied`],
//! which counts as success regardless of the local gradient.

use std::collections::VecDeque;
use ndarray::{ self as nd };
use crate::error::Result;

/// One objective evaluation.
#[derive(Clone, Debug)]
pub struct ObjectiveEval {
    pub cost: f64,
    pub grad: nd::Array1<f64>,
    /// The caller's own stopping criterion is met at this point; accept it
    /// and stop.
    pub satisfied: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Projected gradient or relative cost change fell below tolerance.
    Converged,
    /// The objective reported its stopping criterion.
    TargetReached,
    MaxIters,
    LineSearchFailed,
}

#[derive(Clone, Debug)]
pub struct SolverReport {
    pub x: nd::Array1<f64>,
    pub cost: f64,
    pub status: Status,
    pub message: String,
    pub success: bool,
    /// Iterations taken.
    pub nit: usize,
    /// Objective evaluations spent.
    pub nfev: usize,
}

#[derive(Copy, Clone, Debug)]
pub struct SolverOpts {
    pub maxiter: usize,
    /// Number of curvature pairs retained.
    pub history: usize,
    /// Convergence threshold on the max-norm of the projected gradient.
    pub gtol: f64,
    /// Convergence threshold on the relative cost decrease.
    pub ftol: f64,
    /// Backtracking steps allowed per line search.
    pub maxls: usize,
}

impl Default for SolverOpts {
    fn default() -> Self {
        Self {
            maxiter: 1000,
            history: 10,
            gtol: 1e-8,
            ftol: 1e-12,
            maxls: 20,
        }
    }
}

const ARMIJO_C1: f64 = 1e-4;

fn projected_gradient(
    x: &nd::Array1<f64>,
    g: &nd::Array1<f64>,
    bounds: Option<&[(f64, f64)]>,
) -> nd::Array1<f64>
{
    match bounds {
        None => g.clone(),
        Some(bs) => {
            nd::Array1::from_shape_fn(
                g.len(),
                |i| {
                    let (lo, hi) = bs[i];
                    if (x[i] <= lo && g[i] > 0.0)
                        || (x[i] >= hi && g[i] < 0.0)
                    {
                        0.0
                    } else {
                        g[i]
                    }
                },
            )
        },
    }
}

fn inf_norm(v: &nd::Array1<f64>) -> f64 {
    v.iter().map(|x| x.abs()).fold(0.0, f64::max)
}

/// Minimize `f` from `x0`, optionally clamping each coordinate to its
/// `(lo, hi)` pair (use infinities for unbounded coordinates).
pub fn minimize_lbfgsb<F>(
    mut f: F,
    x0: nd::Array1<f64>,
    bounds: Option<&[(f64, f64)]>,
    opts: &SolverOpts,
) -> Result<SolverReport>
where F: FnMut(&nd::Array1<f64>) -> Result<ObjectiveEval>
{
    let project = |x: &mut nd::Array1<f64>| {
        if let Some(bs) = bounds {
            for (v, &(lo, hi)) in x.iter_mut().zip(bs.iter()) {
                *v = v.clamp(lo, hi);
            }
        }
    };
    let mut x = x0;
    project(&mut x);
    let mut nfev: usize = 1;
    let mut eval = f(&x)?;
    if eval.satisfied {
        return Ok(SolverReport {
            x,
            cost: eval.cost,
            status: Status::TargetReached,
            message: "stopping criterion met at the initial point".into(),
            success: true,
            nit: 0,
            nfev,
        });
    }

    let mut s_hist: VecDeque<nd::Array1<f64>>
        = VecDeque::with_capacity(opts.history);
    let mut y_hist: VecDeque<nd::Array1<f64>>
        = VecDeque::with_capacity(opts.history);
    let mut rho_hist: VecDeque<f64> = VecDeque::with_capacity(opts.history);

    let mut status = Status::MaxIters;
    let mut message = format!("iteration limit ({}) reached", opts.maxiter);
    let mut nit: usize = 0;
    'outer: for _ in 0..opts.maxiter {
        let pg = projected_gradient(&x, &eval.grad, bounds);
        if inf_norm(&pg) < opts.gtol {
            status = Status::Converged;
            message = "projected gradient below tolerance".into();
            break;
        }

        // two-loop recursion over the stored curvature pairs
        let m = s_hist.len();
        let mut q = pg.clone();
        let mut alphas = vec![0.0; m];
        for i in (0..m).rev() {
            alphas[i] = rho_hist[i] * s_hist[i].dot(&q);
            q.scaled_add(-alphas[i], &y_hist[i]);
        }
        if m > 0 {
            let gamma = s_hist[m - 1].dot(&y_hist[m - 1])
                / y_hist[m - 1].dot(&y_hist[m - 1]);
            q *= gamma;
        }
        for i in 0..m {
            let beta = rho_hist[i] * y_hist[i].dot(&q);
            q.scaled_add(alphas[i] - beta, &s_hist[i]);
        }
        let mut dir = -q;
        if dir.dot(&eval.grad) >= 0.0 {
            dir = -pg.clone();
        }

        // Armijo backtracking on projected trial points
        let mut alpha = 1.0;
        let mut accepted: Option<(nd::Array1<f64>, ObjectiveEval)> = None;
        for _ in 0..opts.maxls {
            let mut xn = &x + &(alpha * &dir);
            project(&mut xn);
            let step = &xn - &x;
            let en = f(&xn)?;
            nfev += 1;
            if en.satisfied {
                nit += 1;
                return Ok(SolverReport {
                    x: xn,
                    cost: en.cost,
                    status: Status::TargetReached,
                    message: "stopping criterion met".into(),
                    success: true,
                    nit,
                    nfev,
                });
            }
            if en.cost <= eval.cost + ARMIJO_C1 * eval.grad.dot(&step) {
                accepted = Some((xn, en));
                break;
            }
            alpha *= 0.5;
        }
        let (xn, en) = match accepted {
            Some(pair) => pair,
            None => {
                status = Status::LineSearchFailed;
                message = format!(
                    "line search failed after {} backtracking steps",
                    opts.maxls,
                );
                break 'outer;
            },
        };
        nit += 1;

        let s = &xn - &x;
        let y = &en.grad - &eval.grad;
        let sy = s.dot(&y);
        let s_norm = s.dot(&s).sqrt();
        let y_norm = y.dot(&y).sqrt();
        if sy > 1e-10 * s_norm * y_norm {
            if s_hist.len() == opts.history {
                s_hist.pop_front();
                y_hist.pop_front();
                rho_hist.pop_front();
            }
            rho_hist.push_back(1.0 / sy);
            s_hist.push_back(s);
            y_hist.push_back(y);
        }

        let dcost = eval.cost - en.cost;
        let scale = eval.cost.abs().max(en.cost.abs()).max(1.0);
        x = xn;
        eval = en;
        if dcost.abs() <= opts.ftol * scale {
            status = Status::Converged;
            message = "relative cost decrease below tolerance".into();
            break;
        }
    }

    let success
        = matches!(status, Status::Converged | Status::TargetReached);
    Ok(SolverReport {
        x,
        cost: eval.cost,
        status,
        message,
        success,
        nit,
        nfev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic(center: &nd::Array1<f64>)
        -> impl FnMut(&nd::Array1<f64>) -> Result<ObjectiveEval> + '_
    {
        move |x| {
            let diff = x - center;
            Ok(ObjectiveEval {
                cost: 0.5 * diff.dot(&diff),
                grad: diff,
                satisfied: false,
            })
        }
    }

    #[test]
    fn unbounded_quadratic_converges_to_center() {
        let center = nd::array![1.0, -2.0, 3.0];
        let report = minimize_lbfgsb(
            quadratic(&center),
            nd::Array1::zeros(3),
            None,
            &SolverOpts::default(),
        ).unwrap();
        assert!(report.success);
        assert_eq!(report.status, Status::Converged);
        for (a, b) in report.x.iter().zip(center.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn bounds_pin_the_solution() {
        let center = nd::array![5.0, -5.0];
        let bounds = vec![(-1.0, 1.0); 2];
        let report = minimize_lbfgsb(
            quadratic(&center),
            nd::Array1::zeros(2),
            Some(&bounds),
            &SolverOpts::default(),
        ).unwrap();
        assert!(report.success);
        assert!((report.x[0] - 1.0).abs() < 1e-8);
        assert!((report.x[1] + 1.0).abs() < 1e-8);
    }

    #[test]
    fn satisfied_token_stops_the_search() {
        let center = nd::array![2.0, 2.0];
        let mut n_evals = 0;
        let report = minimize_lbfgsb(
            |x: &nd::Array1<f64>| {
                n_evals += 1;
                let diff = x - &center;
                let cost = 0.5 * diff.dot(&diff);
                Ok(ObjectiveEval {
                    cost,
                    grad: diff,
                    satisfied: cost < 1.0,
                })
            },
            nd::Array1::zeros(2),
            None,
            &SolverOpts::default(),
        ).unwrap();
        assert!(report.success);
        assert_eq!(report.status, Status::TargetReached);
        assert!(report.cost < 1.0);
        assert_eq!(report.nfev, n_evals);
    }

    #[test]
    fn rosenbrock_reaches_the_valley_floor() {
        let rosen = |x: &nd::Array1<f64>| {
            let (a, b) = (x[0], x[1]);
            let cost = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
            let grad = nd::array![
                -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
                200.0 * (b - a * a),
            ];
            Ok(ObjectiveEval { cost, grad, satisfied: false })
        };
        let opts = SolverOpts { maxiter: 5000, ..SolverOpts::default() };
        let report = minimize_lbfgsb(
            rosen, nd::array![-1.2, 1.0], None, &opts).unwrap();
        assert!(report.cost < 1e-8);
    }
}
