//! Fidelity functionals and their exact gradients over a piecewise-constant
//! control waveform.
//!
//! All state-transfer modes share one forward/backward sweep: initial states
//! are pushed forward through the step propagators, conjugated target states
//! are pulled backward, and the gradient with respect to each control sample
//! is a sandwich `⟨targets| U_N ⋯ (∂U_t/∂c) ⋯ U_1 |inits⟩` that reuses the
//! per-step propagator derivatives from [`crate::propagator`]. Gauge degrees
//! of freedom enter as one extra propagator after the final time step, so
//! their gradients fall out of the same sweep.

use ndarray::{ self as nd, Axis };
use num_complex::Complex64 as C64;
use num_traits::Zero;
use crate::error::Result;
use crate::propagator::{
    apply_loss,
    step_propagator,
    step_propagator_nonhermitian,
};

/// Order of the nested-commutator recursion in the non-Hermitian propagator
/// derivative.
const COMM_ORDER: usize = 3;

/// Time-step generators shared by all fidelity sweeps.
#[derive(Copy, Clone)]
pub struct Generators<'a> {
    /// Drift generator.
    pub h0: &'a nd::Array2<C64>,
    /// Control generators, one per waveform row.
    pub hcs: &'a [nd::Array2<C64>],
    /// Optional gauge generators applied once after the last time step.
    pub gauge_ops: Option<&'a [nd::Array2<C64>]>,
    /// Optional per-level amplitude mask applied after every step.
    pub loss: Option<&'a nd::Array1<f64>>,
    /// Whether the generators are Hermitian (eigendecomposition path) or not
    /// (scaling-and-squaring path).
    pub hermitian: bool,
    /// Time-step duration.
    pub dt: f64,
}

impl<'a> Generators<'a> {
    fn n_aux(&self) -> usize { self.gauge_ops.map(|g| g.len()).unwrap_or(0) }
}

/// How overlaps between propagated initial states and target states are
/// scored.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateOverlap {
    /// Phase-sensitive sum of per-state overlaps.
    Coherent,
    /// Sum of per-state squared overlap magnitudes.
    Incoherent,
    /// Squared magnitude of every entry of the cross-overlap matrix; target
    /// states span a subspace rather than pairing with initial states.
    Subspace,
}

/// Output of one fidelity sweep.
#[derive(Clone, Debug)]
pub struct SweepOut {
    pub fid: f64,
    /// Gradient with respect to each control sample, `(n_ctrls, plen)`.
    pub d_controls: nd::Array2<f64>,
    /// Gradient with respect to each gauge parameter.
    pub d_aux: nd::Array1<f64>,
    /// Final propagated states (columns), or the total propagator for the
    /// unitary mode.
    pub states: nd::Array2<C64>,
}

/// Build the step propagators and their control derivatives for one waveform;
/// if gauge generators are present the gauge propagator is appended with its
/// derivatives taken with respect to the gauge parameters.
fn build_props(
    gens: &Generators,
    controls: &nd::Array2<f64>,
    aux: &[f64],
) -> Result<(Vec<nd::Array2<C64>>, Vec<Vec<nd::Array2<C64>>>)>
{
    let (_, plen) = controls.dim();
    let dhs: Vec<nd::Array2<C64>>
        = gens.hcs.iter().map(|hc| hc.mapv(|x| x * gens.dt)).collect();
    let mut props: Vec<nd::Array2<C64>> = Vec::with_capacity(plen + 1);
    let mut d_props: Vec<Vec<nd::Array2<C64>>> = Vec::with_capacity(plen + 1);
    for t in 0..plen {
        let mut h: nd::Array2<C64> = gens.h0.clone();
        for (k, hc) in gens.hcs.iter().enumerate() {
            h.scaled_add(C64::from(controls[[k, t]]), hc);
        }
        h.mapv_inplace(|x| x * gens.dt);
        let (p, dp) = if gens.hermitian {
            step_propagator(&h, &dhs, gens.loss)?
        } else {
            step_propagator_nonhermitian(&h, &dhs, COMM_ORDER, gens.loss)?
        };
        props.push(p);
        d_props.push(dp);
    }
    if let Some(gops) = gens.gauge_ops {
        let dim = gens.h0.nrows();
        let mut g: nd::Array2<C64> = nd::Array2::zeros((dim, dim));
        for (&a, gop) in aux.iter().zip(gops.iter()) {
            g.scaled_add(C64::from(a), gop);
        }
        let (p, dp) = if gens.hermitian {
            step_propagator(&g, gops, gens.loss)?
        } else {
            step_propagator_nonhermitian(&g, gops, COMM_ORDER, gens.loss)?
        };
        props.push(p);
        d_props.push(dp);
    }
    Ok((props, d_props))
}

/// Score an overlap matrix and return the fidelity together with the dual
/// matrix `W` for which every gradient entry is `Σ Re(conj(W) ∘ S)` over the
/// corresponding sandwich matrix `S`.
fn overlap_weight(kind: StateOverlap, ovlps: &nd::Array2<C64>)
    -> (f64, nd::Array2<C64>)
{
    let n = ovlps.ncols() as f64;
    match kind {
        StateOverlap::Coherent => {
            let o: C64 = ovlps.diag().iter().sum();
            let fid = o.norm() / n;
            let mut w: nd::Array2<C64> = nd::Array2::zeros(ovlps.raw_dim());
            if o.norm() > 0.0 {
                let wd = o / o.norm() / n;
                for j in 0..ovlps.nrows().min(ovlps.ncols()) {
                    w[[j, j]] = wd;
                }
            }
            (fid, w)
        },
        StateOverlap::Incoherent => {
            let fid: f64
                = ovlps.diag().iter().map(|o| o.norm_sqr()).sum::<f64>() / n;
            let mut w: nd::Array2<C64> = nd::Array2::zeros(ovlps.raw_dim());
            for j in 0..ovlps.nrows().min(ovlps.ncols()) {
                w[[j, j]] = 2.0 * ovlps[[j, j]] / n;
            }
            (fid, w)
        },
        StateOverlap::Subspace => {
            let fid: f64
                = ovlps.iter().map(|o| o.norm_sqr()).sum::<f64>() / n;
            (fid, ovlps.mapv(|o| 2.0 * o / n))
        },
    }
}

fn weighted_re(w: &nd::Array2<C64>, s: &nd::Array2<C64>) -> f64 {
    w.iter().zip(s.iter()).map(|(wx, sx)| (wx.conj() * sx).re).sum()
}

/// Compute a state-transfer fidelity and its gradients via the exact
/// eigendecomposition propagators.
///
/// `inits` and `finals` hold one state per row; `finals` may have a different
/// row count only in [`StateOverlap::Subspace`] mode.
pub fn states_fidelity(
    gens: &Generators,
    controls: &nd::Array2<f64>,
    aux: &[f64],
    inits: &nd::Array2<C64>,
    finals: &nd::Array2<C64>,
    kind: StateOverlap,
) -> Result<SweepOut>
{
    let (n_ctrls, plen) = controls.dim();
    let n_aux = gens.n_aux();
    let (props, d_props) = build_props(gens, controls, aux)?;
    let nsteps = props.len();

    let mut prop_inits: Vec<nd::Array2<C64>> = Vec::with_capacity(nsteps + 1);
    prop_inits.push(inits.t().to_owned());
    for p in props.iter() {
        let next = p.dot(prop_inits.last().unwrap());
        prop_inits.push(next);
    }
    let mut prop_finals: Vec<nd::Array2<C64>> = Vec::with_capacity(nsteps + 1);
    prop_finals.push(finals.mapv(|a| a.conj()));
    for p in props.iter().rev() {
        let next = prop_finals.last().unwrap().dot(p);
        prop_finals.push(next);
    }
    prop_finals.reverse();

    let ovlps = prop_finals[nsteps].dot(&prop_inits[nsteps]);
    let (fid, w) = overlap_weight(kind, &ovlps);

    let mut d_controls: nd::Array2<f64> = nd::Array2::zeros((n_ctrls, plen));
    for t in 0..plen {
        for k in 0..n_ctrls {
            let s = prop_finals[t + 1]
                .dot(&d_props[t][k].dot(&prop_inits[t]));
            d_controls[[k, t]] = weighted_re(&w, &s);
        }
    }
    let mut d_aux: nd::Array1<f64> = nd::Array1::zeros(n_aux);
    if n_aux > 0 {
        let t = plen;
        for (j, dg) in d_props[t].iter().enumerate() {
            let s = prop_finals[t + 1].dot(&dg.dot(&prop_inits[t]));
            d_aux[j] = weighted_re(&w, &s);
        }
    }
    let states = prop_inits.pop().unwrap();
    Ok(SweepOut { fid, d_controls, d_aux, states })
}

/// Build partial products around every step: `ahead[t]` is the product of all
/// propagators before step `t`, `behind[t]` the product of all after it.
fn partial_products(props: &[nd::Array2<C64>])
    -> (Vec<nd::Array2<C64>>, Vec<nd::Array2<C64>>)
{
    let nsteps = props.len();
    let dim = props[0].nrows();
    let mut ahead: Vec<nd::Array2<C64>> = Vec::with_capacity(nsteps);
    ahead.push(nd::Array2::eye(dim));
    for p in props[..nsteps - 1].iter() {
        let next = p.dot(ahead.last().unwrap());
        ahead.push(next);
    }
    let mut behind: Vec<nd::Array2<C64>> = vec![nd::Array2::eye(dim); nsteps];
    for t in (0..nsteps - 1).rev() {
        behind[t] = behind[t + 1].dot(&props[t + 1]);
    }
    (ahead, behind)
}

fn trace_prod(a: &nd::Array2<C64>, b: &nd::Array2<C64>) -> C64 {
    (a * &b.t()).sum()
}

/// Compute the phase-insensitive overlap of the realized total propagator
/// with a target unitary, with gradients.
///
/// The score is `|Σ conj(U_target) ∘ U| / Σ |U_target|²`, so a target that
/// acts only on a subspace (zero rows elsewhere) is matched on that subspace.
pub fn unitary_fidelity(
    gens: &Generators,
    controls: &nd::Array2<f64>,
    aux: &[f64],
    u_target: &nd::Array2<C64>,
) -> Result<SweepOut>
{
    let (n_ctrls, plen) = controls.dim();
    let n_aux = gens.n_aux();
    let (props, d_props) = build_props(gens, controls, aux)?;
    let nsteps = props.len();
    let (ahead, behind) = partial_products(&props);
    let tot = props[nsteps - 1].dot(ahead.last().unwrap());

    let norm: f64 = u_target.iter().map(|x| x.norm_sqr()).sum();
    let ut_hc = u_target.t().mapv(|x| x.conj());
    let o = trace_prod(&ut_hc, &tot) / norm;
    let fid = o.norm();
    let wphase = if fid > 0.0 { o.conj() / fid } else { C64::zero() };

    let mut d_controls: nd::Array2<f64> = nd::Array2::zeros((n_ctrls, plen));
    let mut d_aux: nd::Array1<f64> = nd::Array1::zeros(n_aux);
    for t in 0..nsteps {
        // tr(U† B dP A) = tr((A U† B) dP)
        let m = ahead[t].dot(&ut_hc).dot(&behind[t]);
        for (k, dp) in d_props[t].iter().enumerate() {
            let val = (wphase * trace_prod(&m, dp) / norm).re;
            if t < plen {
                d_controls[[k, t]] = val;
            } else {
                d_aux[k] = val;
            }
        }
    }
    Ok(SweepOut { fid, d_controls, d_aux, states: tot })
}

/// Compute the expectation value of a Hermitian observable in the state
/// obtained by propagating `init`, with gradients.
pub fn expectation_value(
    gens: &Generators,
    controls: &nd::Array2<f64>,
    aux: &[f64],
    init: &nd::Array1<C64>,
    op: &nd::Array2<C64>,
) -> Result<SweepOut>
{
    let (n_ctrls, plen) = controls.dim();
    let n_aux = gens.n_aux();
    let (props, d_props) = build_props(gens, controls, aux)?;
    let nsteps = props.len();
    let (ahead, behind) = partial_products(&props);
    let tot = props[nsteps - 1].dot(ahead.last().unwrap());

    let fin: nd::Array1<C64> = tot.dot(init);
    let o_fin: nd::Array1<C64> = op.dot(&fin);
    let o_fin_c = o_fin.mapv(|x| x.conj());
    let fid = fin.mapv(|x| x.conj()).dot(&o_fin).re;

    let mut d_controls: nd::Array2<f64> = nd::Array2::zeros((n_ctrls, plen));
    let mut d_aux: nd::Array1<f64> = nd::Array1::zeros(n_aux);
    for t in 0..nsteps {
        let row: nd::Array1<C64> = behind[t].t().dot(&o_fin_c);
        let col: nd::Array1<C64> = ahead[t].dot(init);
        for (k, dp) in d_props[t].iter().enumerate() {
            let val = 2.0 * row.dot(&dp.dot(&col)).re;
            if t < plen {
                d_controls[[k, t]] = val;
            } else {
                d_aux[k] = val;
            }
        }
    }
    let states = fin.insert_axis(Axis(1));
    Ok(SweepOut { fid, d_controls, d_aux, states })
}

/// Compute a state-transfer fidelity and its gradients without ever forming a
/// step propagator, by truncated-series propagation of the boundary states.
///
/// The derivative of each step's action on the incoming states rides along
/// the forward series through the coupled recursion
/// `d_m = (L d_{m-1} + D s_{m-1}) / m`, `s_m = L s_{m-1} / m`, so the cost
/// per step is `order` matrix-vector products per state per control. The
/// backward sweep runs the adjoint series. Gauge generators still go through
/// the dense propagator since they act once.
pub fn taylor_states_fidelity(
    gens: &Generators,
    controls: &nd::Array2<f64>,
    aux: &[f64],
    inits: &nd::Array2<C64>,
    finals: &nd::Array2<C64>,
    kind: StateOverlap,
    order: usize,
) -> Result<SweepOut>
{
    let (n_ctrls, plen) = controls.dim();
    let n_aux = gens.n_aux();
    let minus_i_dt = C64::new(0.0, -gens.dt);
    let dks: Vec<nd::Array2<C64>>
        = gens.hcs.iter().map(|hc| hc.mapv(|x| minus_i_dt * x)).collect();

    // forward sweep
    let mut psi: nd::Array2<C64> = inits.t().to_owned();
    let mut d_states: Vec<Vec<nd::Array2<C64>>>
        = Vec::with_capacity(plen + 1);
    for t in 0..plen {
        let mut l: nd::Array2<C64> = gens.h0.clone();
        for (k, hc) in gens.hcs.iter().enumerate() {
            l.scaled_add(C64::from(controls[[k, t]]), hc);
        }
        l.mapv_inplace(|x| x * minus_i_dt);
        let mut s = psi.clone();
        let mut psi_out = psi.clone();
        let mut ds: Vec<nd::Array2<C64>>
            = (0..n_ctrls).map(|_| nd::Array2::zeros(psi.raw_dim()))
            .collect();
        for m in 1..=order {
            let inv = 1.0 / m as f64;
            for (d, dk) in ds.iter_mut().zip(dks.iter()) {
                *d = (l.dot(d) + dk.dot(&s)).mapv(|x| x * inv);
            }
            s = l.dot(&s).mapv(|x| x * inv);
            psi_out += &s;
        }
        if let Some(lv) = gens.loss {
            psi_out = apply_loss(psi_out, lv);
            ds = ds.into_iter().map(|d| apply_loss(d, lv)).collect();
        }
        psi = psi_out;
        d_states.push(ds);
    }
    let mut gauge_prop: Option<nd::Array2<C64>> = None;
    if let Some(gops) = gens.gauge_ops {
        let dim = gens.h0.nrows();
        let mut g: nd::Array2<C64> = nd::Array2::zeros((dim, dim));
        for (&a, gop) in aux.iter().zip(gops.iter()) {
            g.scaled_add(C64::from(a), gop);
        }
        let (gp, gdp) = if gens.hermitian {
            step_propagator(&g, gops, gens.loss)?
        } else {
            step_propagator_nonhermitian(&g, gops, COMM_ORDER, gens.loss)?
        };
        let ds: Vec<nd::Array2<C64>>
            = gdp.iter().map(|dg| dg.dot(&psi)).collect();
        psi = gp.dot(&psi);
        d_states.push(ds);
        gauge_prop = Some(gp);
    }
    let nsteps = d_states.len();

    // backward sweep: adjoint series on the (unconjugated) target states
    let h0_hc: nd::Array2<C64> = gens.h0.t().mapv(|x| x.conj());
    let hcs_hc: Vec<nd::Array2<C64>>
        = gens.hcs.iter().map(|hc| hc.t().mapv(|x| x.conj())).collect();
    let plus_i_dt = C64::new(0.0, gens.dt);
    let mut pf: Vec<nd::Array2<C64>> = Vec::with_capacity(nsteps + 1);
    pf.push(finals.t().to_owned());
    if let Some(gp) = &gauge_prop {
        let gp_hc = gp.t().mapv(|x| x.conj());
        let next = gp_hc.dot(pf.last().unwrap());
        pf.push(next);
    }
    for t in (0..plen).rev() {
        let mut phi = pf.last().unwrap().clone();
        if let Some(lv) = gens.loss { phi = apply_loss(phi, lv); }
        let mut lh: nd::Array2<C64> = h0_hc.clone();
        for (k, hc) in hcs_hc.iter().enumerate() {
            lh.scaled_add(C64::from(controls[[k, t]]), hc);
        }
        lh.mapv_inplace(|x| x * plus_i_dt);
        let mut s = phi.clone();
        let mut out = phi;
        for m in 1..=order {
            let inv = 1.0 / m as f64;
            s = lh.dot(&s).mapv(|x| x * inv);
            out += &s;
        }
        pf.push(out);
    }
    pf.reverse();

    let ovlps = pf[nsteps].mapv(|x| x.conj()).t().dot(&psi);
    let (fid, w) = overlap_weight(kind, &ovlps);

    let mut d_controls: nd::Array2<f64> = nd::Array2::zeros((n_ctrls, plen));
    let mut d_aux: nd::Array1<f64> = nd::Array1::zeros(n_aux);
    for (t, ds) in d_states.iter().enumerate() {
        let pf_hc = pf[t + 1].mapv(|x| x.conj()).reversed_axes();
        for (k, d) in ds.iter().enumerate() {
            let s = pf_hc.dot(d);
            let val = weighted_re(&w, &s);
            if t < plen {
                d_controls[[k, t]] = val;
            } else {
                d_aux[k] = val;
            }
        }
    }
    Ok(SweepOut { fid, d_controls, d_aux, states: psi })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ Rng, SeedableRng, rngs::StdRng };

    fn random_hermitian(dim: usize, rng: &mut StdRng) -> nd::Array2<C64> {
        let mut h: nd::Array2<C64> = nd::Array2::zeros((dim, dim));
        for x in h.iter_mut() {
            *x = C64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
        }
        let hc = h.t().mapv(|a| a.conj());
        h + hc
    }

    fn random_states(n: usize, dim: usize, rng: &mut StdRng)
        -> nd::Array2<C64>
    {
        let mut s: nd::Array2<C64> = nd::Array2::zeros((n, dim));
        for x in s.iter_mut() {
            *x = C64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
        }
        for mut row in s.rows_mut() {
            let norm = row.iter().map(|x| x.norm_sqr()).sum::<f64>().sqrt();
            row.mapv_inplace(|x| x / norm);
        }
        s
    }

    fn random_controls(n_ctrls: usize, plen: usize, rng: &mut StdRng)
        -> nd::Array2<f64>
    {
        nd::Array2::from_shape_fn(
            (n_ctrls, plen), |_| rng.gen_range(-0.5..0.5))
    }

    struct Problem {
        h0: nd::Array2<C64>,
        hcs: Vec<nd::Array2<C64>>,
        inits: nd::Array2<C64>,
        finals: nd::Array2<C64>,
        controls: nd::Array2<f64>,
    }

    fn make_problem(
        dim: usize,
        n_ctrls: usize,
        n_states: usize,
        plen: usize,
        rng: &mut StdRng,
    ) -> Problem
    {
        Problem {
            h0: random_hermitian(dim, rng),
            hcs: (0..n_ctrls).map(|_| random_hermitian(dim, rng)).collect(),
            inits: random_states(n_states, dim, rng),
            finals: random_states(n_states, dim, rng),
            controls: random_controls(n_ctrls, plen, rng),
        }
    }

    fn check_control_gradient<F>(
        controls: &nd::Array2<f64>,
        eval: F,
        tol: f64,
    )
    where F: Fn(&nd::Array2<f64>) -> SweepOut
    {
        let eps = 1e-6;
        let out = eval(controls);
        for k in 0..controls.nrows() {
            for t in 0..controls.ncols() {
                let mut cp = controls.clone();
                cp[[k, t]] += eps;
                let fp = eval(&cp).fid;
                let mut cm = controls.clone();
                cm[[k, t]] -= eps;
                let fm = eval(&cm).fid;
                let fd = (fp - fm) / (2.0 * eps);
                let an = out.d_controls[[k, t]];
                assert!(
                    (fd - an).abs() < tol * fd.abs().max(an.abs()).max(1e-3),
                    "k={}, t={}: fd={:.6e}, analytic={:.6e}", k, t, fd, an,
                );
            }
        }
    }

    #[test]
    fn coherent_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(101);
        let pr = make_problem(4, 2, 2, 5, &mut rng);
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: true, dt: 0.15,
        };
        check_control_gradient(
            &pr.controls,
            |c| {
                states_fidelity(
                    &gens, c, &[], &pr.inits, &pr.finals,
                    StateOverlap::Coherent,
                ).unwrap()
            },
            1e-2,
        );
    }

    #[test]
    fn incoherent_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(103);
        let pr = make_problem(4, 2, 3, 4, &mut rng);
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: true, dt: 0.15,
        };
        check_control_gradient(
            &pr.controls,
            |c| {
                states_fidelity(
                    &gens, c, &[], &pr.inits, &pr.finals,
                    StateOverlap::Incoherent,
                ).unwrap()
            },
            1e-2,
        );
    }

    #[test]
    fn subspace_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(107);
        let pr = make_problem(5, 2, 2, 4, &mut rng);
        // target subspace spanned by three states
        let finals = random_states(3, 5, &mut rng);
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: true, dt: 0.15,
        };
        check_control_gradient(
            &pr.controls,
            |c| {
                states_fidelity(
                    &gens, c, &[], &pr.inits, &finals,
                    StateOverlap::Subspace,
                ).unwrap()
            },
            1e-2,
        );
    }

    #[test]
    fn gauge_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(109);
        let pr = make_problem(4, 1, 2, 3, &mut rng);
        let gauge = vec![random_hermitian(4, &mut rng)];
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: Some(&gauge), loss: None,
            hermitian: true, dt: 0.15,
        };
        let eval = |aux: &[f64]| {
            states_fidelity(
                &gens, &pr.controls, aux, &pr.inits, &pr.finals,
                StateOverlap::Coherent,
            ).unwrap()
        };
        let eps = 1e-6;
        let out = eval(&[0.3]);
        let fd = (eval(&[0.3 + eps]).fid - eval(&[0.3 - eps]).fid)
            / (2.0 * eps);
        assert!((fd - out.d_aux[0]).abs() < 1e-5 * fd.abs().max(1e-3));
    }

    #[test]
    fn unitary_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(113);
        let pr = make_problem(3, 2, 1, 4, &mut rng);
        // unitary target from a random Hermitian generator
        let g = random_hermitian(3, &mut rng);
        let (u_target, _)
            = step_propagator(&g, &[], None).unwrap();
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: true, dt: 0.15,
        };
        check_control_gradient(
            &pr.controls,
            |c| unitary_fidelity(&gens, c, &[], &u_target).unwrap(),
            1e-2,
        );
    }

    #[test]
    fn expectation_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(127);
        let pr = make_problem(4, 2, 1, 4, &mut rng);
        let init = random_states(1, 4, &mut rng).row(0).to_owned();
        let op = random_hermitian(4, &mut rng);
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: true, dt: 0.15,
        };
        check_control_gradient(
            &pr.controls,
            |c| expectation_value(&gens, c, &[], &init, &op).unwrap(),
            1e-2,
        );
    }

    #[test]
    fn taylor_agrees_with_exact_sweep() {
        let mut rng = StdRng::seed_from_u64(131);
        let pr = make_problem(4, 2, 2, 5, &mut rng);
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: true, dt: 0.05,
        };
        let exact = states_fidelity(
            &gens, &pr.controls, &[], &pr.inits, &pr.finals,
            StateOverlap::Coherent,
        ).unwrap();
        let taylor = taylor_states_fidelity(
            &gens, &pr.controls, &[], &pr.inits, &pr.finals,
            StateOverlap::Coherent, 16,
        ).unwrap();
        assert!((exact.fid - taylor.fid).abs() < 1e-10);
        let dmax = exact.d_controls.iter().zip(taylor.d_controls.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(dmax < 1e-9);
    }

    #[test]
    fn taylor_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(137);
        let pr = make_problem(4, 2, 2, 4, &mut rng);
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: true, dt: 0.1,
        };
        check_control_gradient(
            &pr.controls,
            |c| {
                taylor_states_fidelity(
                    &gens, c, &[], &pr.inits, &pr.finals,
                    StateOverlap::Incoherent, 20,
                ).unwrap()
            },
            1e-2,
        );
    }

    #[test]
    fn nonhermitian_sweep_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(139);
        let mut pr = make_problem(3, 1, 1, 3, &mut rng);
        // add decay to the drift
        for k in 0..3 {
            pr.h0[[k, k]] -= C64::i() * 0.05 * k as f64;
        }
        let gens = Generators {
            h0: &pr.h0, hcs: &pr.hcs,
            gauge_ops: None, loss: None,
            hermitian: false, dt: 0.15,
        };
        check_control_gradient(
            &pr.controls,
            |c| {
                states_fidelity(
                    &gens, c, &[], &pr.inits, &pr.finals,
                    StateOverlap::Incoherent,
                ).unwrap()
            },
            1e-2,
        );
    }
}
