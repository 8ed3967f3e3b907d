//! Exact second derivatives of the coherent state-transfer overlap, for
//! Newton-type refinement of nearly-converged waveforms.
//!
//! The per-step second derivative of the matrix exponential comes from
//! second divided differences of `exp` over the step eigenvalues
//! (Daleckii-Krein): `[d²U]_{ik} = Σ_j f[z_i,z_j,z_k](A_{ij}B_{jk} +
//! B_{ij}A_{jk})` in the eigenbasis. Degenerate eigenvalue clusters fall
//! back to the confluent limits of the divided differences, so spectra with
//! exact symmetries are handled without special-casing by the caller.

use ndarray::{ self as nd };
use ndarray_linalg::{ Eigh, UPLO };
use num_complex::Complex64 as C64;
use num_traits::Zero;
use crate::error::Result;

const CONFLUENT_TOL: f64 = 1e-7;

/// Second divided difference with both leading arguments confluent:
/// `f[z_a, z_a, z_b]` for `exp`.
fn dd2_confluent(za: C64, zb: C64) -> C64 {
    let d = za - zb;
    (za.exp() * d - (za.exp() - zb.exp())) / (d * d)
}

/// Compute `U = exp(-i H)` together with its exact first and second
/// derivatives in the directions `dHs`; `d2[a][b]` is filled for every pair.
pub fn step_propagator_second(
    H: &nd::Array2<C64>,
    dHs: &[nd::Array2<C64>],
) -> Result<(
    nd::Array2<C64>,
    Vec<nd::Array2<C64>>,
    Vec<Vec<nd::Array2<C64>>>,
)>
{
    let (vals, basis): (nd::Array1<f64>, nd::Array2<C64>)
        = H.eigh(UPLO::Lower)?;
    let d = vals.len();
    let z: nd::Array1<C64> = vals.mapv(|e| -C64::i() * e);
    let expz: nd::Array1<C64> = z.mapv(C64::exp);
    let basis_hc: nd::Array2<C64> = basis.t().mapv(|a| a.conj());
    let prop: nd::Array2<C64> = (&basis * &expz).dot(&basis_hc);

    // directions in the eigenbasis, with the -i of the generator absorbed
    let a_mats: Vec<nd::Array2<C64>> = dHs.iter()
        .map(|dh| {
            basis_hc.dot(dh).dot(&basis).mapv(|x| -C64::i() * x)
        })
        .collect();

    let mut g1: nd::Array2<C64> = nd::Array2::zeros((d, d));
    for ((i, j), g) in g1.indexed_iter_mut() {
        let dz = z[i] - z[j];
        *g = if dz.norm() < CONFLUENT_TOL {
            expz[i]
        } else {
            (expz[i] - expz[j]) / dz
        };
    }
    let d1: Vec<nd::Array2<C64>> = a_mats.iter()
        .map(|a| basis.dot(&(&g1 * a)).dot(&basis_hc))
        .collect();

    let mut g2: nd::Array3<C64> = nd::Array3::zeros((d, d, d));
    for ((i, j, k), g) in g2.indexed_iter_mut() {
        let dij = z[i] - z[j];
        let dik = z[i] - z[k];
        let djk = z[j] - z[k];
        let mij = dij.norm() < CONFLUENT_TOL;
        let mik = dik.norm() < CONFLUENT_TOL;
        let mjk = djk.norm() < CONFLUENT_TOL;
        *g = if mij && mik && mjk {
            expz[i] / 2.0
        } else if mjk {
            dd2_confluent(z[j], z[i])
        } else if mik {
            dd2_confluent(z[i], z[j])
        } else if mij {
            dd2_confluent(z[i], z[k])
        } else {
            expz[i] / (dij * dik)
                - expz[j] / (djk * dij)
                + expz[k] / (dik * djk)
        };
    }

    let n_dirs = dHs.len();
    let mut d2: Vec<Vec<nd::Array2<C64>>>
        = vec![Vec::with_capacity(n_dirs); n_dirs];
    for a in 0..n_dirs {
        for b in 0..n_dirs {
            let mut kern: nd::Array2<C64> = nd::Array2::zeros((d, d));
            for i in 0..d {
                for k in 0..d {
                    let mut acc = C64::zero();
                    for j in 0..d {
                        acc += g2[[i, j, k]]
                            * (a_mats[a][[i, j]] * a_mats[b][[j, k]]
                                + a_mats[b][[i, j]] * a_mats[a][[j, k]]);
                    }
                    kern[[i, k]] = acc;
                }
            }
            d2[a].push(basis.dot(&kern).dot(&basis_hc));
        }
    }
    Ok((prop, d1, d2))
}

fn diag_sum(
    pf: &nd::Array2<C64>,
    mid: &nd::Array2<C64>,
    pi: &nd::Array2<C64>,
) -> C64
{
    pf.dot(&mid.dot(pi)).diag().iter().sum()
}

/// Compute the coherent overlap score `|Σ_j ⟨f_j|U|i_j⟩|² / n²` of a
/// waveform along with its exact gradient and Hessian.
///
/// Parameters are flattened control-major: entry `k * plen + t` is control
/// `k` at sample `t`. Second derivatives across time steps reuse the
/// first-derivative states of earlier steps, propagated forward alongside
/// the main sweep.
pub fn states_fidelity_hessian(
    h0: &nd::Array2<C64>,
    hcs: &[nd::Array2<C64>],
    controls: &nd::Array2<f64>,
    inits: &nd::Array2<C64>,
    finals: &nd::Array2<C64>,
    dt: f64,
) -> Result<(f64, nd::Array1<f64>, nd::Array2<f64>)>
{
    let (n_ctrls, plen) = controls.dim();
    let n = n_ctrls * plen;
    let n_states = inits.nrows() as f64;
    let dhs: Vec<nd::Array2<C64>>
        = hcs.iter().map(|hc| hc.mapv(|x| x * dt)).collect();

    let mut props: Vec<nd::Array2<C64>> = Vec::with_capacity(plen);
    let mut d_props: Vec<Vec<nd::Array2<C64>>> = Vec::with_capacity(plen);
    let mut d2_props: Vec<Vec<Vec<nd::Array2<C64>>>>
        = Vec::with_capacity(plen);
    for t in 0..plen {
        let mut h: nd::Array2<C64> = h0.clone();
        for (k, hc) in hcs.iter().enumerate() {
            h.scaled_add(C64::from(controls[[k, t]]), hc);
        }
        h.mapv_inplace(|x| x * dt);
        let (p, d1, d2) = step_propagator_second(&h, &dhs)?;
        props.push(p);
        d_props.push(d1);
        d2_props.push(d2);
    }

    let mut prop_inits: Vec<nd::Array2<C64>> = Vec::with_capacity(plen + 1);
    prop_inits.push(inits.t().to_owned());
    for p in props.iter() {
        let next = p.dot(prop_inits.last().unwrap());
        prop_inits.push(next);
    }
    let mut prop_finals: Vec<nd::Array2<C64>> = Vec::with_capacity(plen + 1);
    prop_finals.push(finals.mapv(|a| a.conj()));
    for p in props.iter().rev() {
        let next = prop_finals.last().unwrap().dot(p);
        prop_finals.push(next);
    }
    prop_finals.reverse();

    let o: C64 = prop_finals[plen].dot(&prop_inits[plen])
        .diag().iter().sum();

    let mut dov: nd::Array1<C64> = nd::Array1::zeros(n);
    for t in 0..plen {
        for k in 0..n_ctrls {
            dov[k * plen + t] = diag_sum(
                &prop_finals[t + 1], &d_props[t][k], &prop_inits[t]);
        }
    }

    // lower-triangular (in time) second-derivative overlaps; equal-time
    // entries carry half weight so S + Sᵀ is the full symmetric matrix
    let mut s_mat: nd::Array2<C64> = nd::Array2::zeros((n, n));
    let mut d1_states: Vec<Vec<nd::Array2<C64>>> = Vec::with_capacity(plen);
    for t1 in 0..plen {
        for a in 0..n_ctrls {
            for b in 0..=a {
                let v = diag_sum(
                    &prop_finals[t1 + 1],
                    &d2_props[t1][a][b],
                    &prop_inits[t1],
                );
                s_mat[[a * plen + t1, b * plen + t1]] = v / 2.0;
                s_mat[[b * plen + t1, a * plen + t1]] = v / 2.0;
            }
        }
        for (t2, ds) in d1_states.iter().enumerate() {
            for a in 0..n_ctrls {
                for (b, dstate) in ds.iter().enumerate() {
                    s_mat[[a * plen + t1, b * plen + t2]]
                        = prop_finals[t1 + 1]
                        .dot(&d_props[t1][a].dot(dstate))
                        .diag().iter().sum();
                }
            }
        }
        for ds in d1_states.iter_mut() {
            for dstate in ds.iter_mut() {
                *dstate = props[t1].dot(dstate);
            }
        }
        d1_states.push(
            d_props[t1].iter()
                .map(|dp| dp.dot(&prop_inits[t1]))
                .collect()
        );
    }
    let d2ov = &s_mat + &s_mat.t();

    // fid = (Re o)² + (Im o)², normalized by the state count
    let ns2 = n_states * n_states;
    let fid = o.norm_sqr() / ns2;
    let grad: nd::Array1<f64> = dov.mapv(|dv| {
        2.0 * (o.re * dv.re + o.im * dv.im) / ns2
    });
    let mut hess: nd::Array2<f64> = nd::Array2::zeros((n, n));
    for ((p, q), h) in hess.indexed_iter_mut() {
        *h = 2.0 * (
            dov[p].re * dov[q].re + dov[p].im * dov[q].im
            + o.re * d2ov[[p, q]].re + o.im * d2ov[[p, q]].im
        ) / ns2;
    }
    Ok((fid, grad, hess))
}
