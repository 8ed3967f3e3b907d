//! Top-level optimization driver.
//!
//! [`run_grape`] flattens the raw waveform and gauge parameters into one
//! parameter vector, runs the forward pipeline (envelope, upsampling,
//! response convolution), fans the resulting simulation waveform out over
//! all setups, and aggregates fidelity gradients back through the exact
//! adjoint of each pipeline stage before handing the whole objective to the
//! bounded quasi-Newton solver.

use std::path::Path;
use ndarray::{ self as nd, s };
use rayon::prelude::*;
use serde::{ Deserialize, Serialize };
use crate::error::{ GrapeError, Result };
use crate::penalty::PenaltyFn;
use crate::reporters::{ ReportData, Reporter };
use crate::response::{ self, Response };
use crate::setup::Setup;
use crate::solver::{ self, ObjectiveEval, SolverOpts };

/// Options for [`run_grape`].
///
/// The serializable fields can be loaded from a TOML table via
/// [`GrapeOpts::load`]; array-valued fields (response kernel, impulse
/// pattern, initial gauge parameters) are set in code.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GrapeOpts {
    /// Raw-sample duration; simulation steps are `dt / n_ss` long.
    pub dt: f64,
    /// Upsampling factor from raw samples to simulation samples.
    pub n_ss: usize,
    /// Envelope time constant; non-positive disables shaping.
    pub shape_sigma: f64,
    /// Weight on the squared spread of per-setup fidelities.
    pub discrepancy_penalty: f64,
    /// Stop as soon as every setup reaches this fidelity.
    pub term_fid: Option<f64>,
    /// Spot-check one gradient component against a finite difference every
    /// this many evaluations, logging a warning on mismatch.
    pub check_grad: Option<usize>,
    pub maxiter: usize,
    /// Box constraint applied to every raw waveform sample (gauge parameters
    /// stay unbounded).
    pub bounds: Option<(f64, f64)>,
    /// Worker threads for the per-setup fan-out; 1 keeps everything on the
    /// calling thread.
    pub n_proc: usize,
    pub gtol: f64,
    pub ftol: f64,
    #[serde(skip)]
    pub response: Option<Response>,
    /// Upsampling pattern; defaults to `n_ss` ones (sample-and-hold).
    #[serde(skip)]
    pub impulse: Option<nd::Array1<f64>>,
    /// Explicit envelope samples, overriding `shape_sigma`.
    #[serde(skip)]
    pub shape_array: Option<nd::Array1<f64>>,
    #[serde(skip)]
    pub init_aux_params: Option<nd::Array1<f64>>,
}

impl Default for GrapeOpts {
    fn default() -> Self {
        Self {
            dt: 1.0,
            n_ss: 1,
            shape_sigma: 0.0,
            discrepancy_penalty: 0.0,
            term_fid: None,
            check_grad: None,
            maxiter: 1000,
            bounds: None,
            n_proc: 1,
            gtol: 1e-5,
            ftol: 1e-10,
            response: None,
            impulse: None,
            shape_array: None,
            init_aux_params: None,
        }
    }
}

impl GrapeOpts {
    pub fn from_toml_str(table: &str) -> Result<Self> {
        Ok(toml::from_str(table)?)
    }

    pub fn load<P>(path: P) -> Result<Self>
    where P: AsRef<Path>
    {
        let table = std::fs::read_to_string(path)?;
        Self::from_toml_str(&table)
    }
}

/// Outcome of one optimization run.
#[derive(Clone, Debug)]
pub struct GrapeResults {
    /// Optimizer-resolution samples.
    pub raw_controls: nd::Array2<f64>,
    /// Envelope-shaped samples.
    pub awg_controls: nd::Array2<f64>,
    /// Upsampled, response-convolved samples.
    pub sim_controls: nd::Array2<f64>,
    pub aux_params: nd::Array1<f64>,
    /// Final per-setup fidelities.
    pub fids: Vec<f64>,
    /// Per-setup fidelities at every objective evaluation.
    pub fids_hist: Vec<Vec<f64>>,
    pub tot_cost: f64,
    pub message: String,
    pub success: bool,
    pub nit: usize,
    pub nfev: usize,
    pub dt: f64,
}

struct PipelineEval {
    fids: Vec<f64>,
    awg: nd::Array2<f64>,
    sim: nd::Array2<f64>,
    grad_raw: nd::Array2<f64>,
    grad_aux: nd::Array1<f64>,
    pen_costs: Vec<f64>,
    tot_cost: f64,
}

fn inf_norm<'a, I>(vals: I) -> f64
where I: IntoIterator<Item = &'a f64>
{
    vals.into_iter().map(|x| x.abs()).fold(0.0, f64::max)
}

/// Optimize one waveform against all given setups jointly.
///
/// `init_controls` has one row per control and one column per raw sample.
/// The cost is `1 - mean(fids)` plus the discrepancy term and all penalties;
/// every setup must therefore expose the same number of controls and gauge
/// generators. Reporters fire after each objective evaluation according to
/// their strides.
pub fn run_grape(
    init_controls: &nd::Array2<f64>,
    setups: &[Setup],
    penalties: &[PenaltyFn],
    reporters: &mut [Reporter],
    opts: &GrapeOpts,
) -> Result<GrapeResults>
{
    if setups.is_empty() {
        return Err(GrapeError::DimensionMismatch(
            "at least one setup is required".into()
        ));
    }
    if opts.n_ss == 0 {
        return Err(GrapeError::DimensionMismatch(
            "upsampling factor must be positive".into()
        ));
    }
    let (n_ctrls, plen) = init_controls.dim();
    let n_aux = setups[0].n_aux();
    for (j, setup) in setups.iter().enumerate() {
        if setup.n_ctrls() != n_ctrls {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "setup {} has {} controls but the waveform has {} rows",
                    j, setup.n_ctrls(), n_ctrls,
                )
            ));
        }
        if setup.n_aux() != n_aux {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "setup {} has {} gauge generators but setup 0 has {}",
                    j, setup.n_aux(), n_aux,
                )
            ));
        }
    }
    let ctrl_size = n_ctrls * plen;

    let sim_dt = opts.dt / opts.n_ss as f64;
    let shape: nd::Array1<f64> = match &opts.shape_array {
        Some(arr) => {
            if arr.len() != plen {
                return Err(GrapeError::DimensionMismatch(
                    format!(
                        "shape array has {} samples but the waveform has {}",
                        arr.len(), plen,
                    )
                ));
            }
            arr.clone()
        },
        None => response::shape_envelope(plen, opts.dt, opts.shape_sigma),
    };
    let default_impulse: nd::Array1<f64> = nd::Array1::ones(opts.n_ss);
    let impulse: &nd::Array1<f64>
        = opts.impulse.as_ref().unwrap_or(&default_impulse);
    if impulse.len() != opts.n_ss {
        return Err(GrapeError::MalformedResponse(
            format!(
                "impulse pattern has {} samples but n_ss is {}",
                impulse.len(), opts.n_ss,
            )
        ));
    }

    let pool = if opts.n_proc > 1 {
        Some(
            rayon::ThreadPoolBuilder::new()
                .num_threads(opts.n_proc)
                .build()?
        )
    } else {
        None
    };

    // One full forward/adjoint pass at a given raw waveform and gauge
    // parameters.
    let evaluate = |raw: &nd::Array2<f64>, aux: &[f64]|
        -> Result<PipelineEval>
    {
        let awg = raw * &shape;
        let up = response::upsample(&awg, impulse);
        let sim = match &opts.response {
            Some(resp) => resp.apply(&up)?,
            None => up,
        };
        let fids_out = match &pool {
            Some(p) => {
                p.install(|| {
                    setups.par_iter()
                        .map(|setup| setup.get_fids(&sim, aux, sim_dt))
                        .collect::<Result<Vec<_>>>()
                })?
            },
            None => {
                setups.iter()
                    .map(|setup| setup.get_fids(&sim, aux, sim_dt))
                    .collect::<Result<Vec<_>>>()?
            },
        };
        let n = setups.len() as f64;
        let fids: Vec<f64> = fids_out.iter().map(|f| f.fid).collect();
        let mean: f64 = fids.iter().sum::<f64>() / n;
        let disc: f64 = opts.discrepancy_penalty
            * fids.iter().map(|f| (f - mean).powi(2)).sum::<f64>();

        // setup deviations sum to zero, so the discrepancy gradient through
        // the mean cancels exactly
        let mut g_sim: nd::Array2<f64> = nd::Array2::zeros(sim.raw_dim());
        let mut g_aux: nd::Array1<f64> = nd::Array1::zeros(n_aux);
        for (fid, out) in fids.iter().zip(fids_out.iter()) {
            let wgt = -1.0 / n
                + 2.0 * opts.discrepancy_penalty * (fid - mean);
            g_sim.scaled_add(wgt, &out.d_controls);
            g_aux.scaled_add(wgt, &out.d_aux);
        }
        let g_up = match &opts.response {
            Some(resp) => resp.adjoint(&g_sim)?,
            None => g_sim,
        };
        let mut g_awg = response::downsample(&g_up, impulse);

        let mut pen_costs: Vec<f64> = Vec::with_capacity(penalties.len());
        for pen in penalties.iter() {
            let (cost, grad) = pen(&awg)?;
            pen_costs.push(cost);
            g_awg += &grad;
        }
        let grad_raw = &g_awg * &shape;
        let tot_cost
            = (1.0 - mean) + disc + pen_costs.iter().sum::<f64>();
        Ok(PipelineEval {
            fids,
            awg,
            sim,
            grad_raw,
            grad_aux: g_aux,
            pen_costs,
            tot_cost,
        })
    };

    // gauge parameters move on a very different scale than waveform samples;
    // rescale their block once, from the gradients at the initial point
    let aux0: nd::Array1<f64> = match &opts.init_aux_params {
        Some(a) => {
            if a.len() != n_aux {
                return Err(GrapeError::DimensionMismatch(
                    format!(
                        "{} initial gauge parameters for {} gauge generators",
                        a.len(), n_aux,
                    )
                ));
            }
            a.clone()
        },
        None => nd::Array1::zeros(n_aux),
    };
    let precon: f64 = if n_aux > 0 {
        let e0 = evaluate(init_controls, &aux0.to_vec())?;
        let max_dc = inf_norm(e0.grad_raw.iter());
        let max_da = inf_norm(e0.grad_aux.iter());
        if max_da > 0.0 {
            (0.5 * max_dc / max_da).clamp(1e-3, 1.0)
        } else {
            1.0
        }
    } else {
        1.0
    };

    let x0: nd::Array1<f64> = init_controls.iter().copied()
        .chain(aux0.iter().map(|a| a / precon))
        .collect();
    let bounds_vec: Option<Vec<(f64, f64)>> = opts.bounds.map(|(lo, hi)| {
        let mut bs = vec![(lo, hi); ctrl_size];
        bs.extend(
            std::iter::repeat((f64::NEG_INFINITY, f64::INFINITY))
                .take(n_aux)
        );
        bs
    });

    let mut n_eval: usize = 0;
    let mut fids_hist: Vec<Vec<f64>> = Vec::new();
    let objective = |x: &nd::Array1<f64>| -> Result<ObjectiveEval> {
        let raw: nd::Array2<f64> = x.slice(s![..ctrl_size])
            .to_owned()
            .into_shape((n_ctrls, plen))?;
        let aux_vec: Vec<f64> = x.iter().skip(ctrl_size)
            .map(|z| z * precon)
            .collect();
        let ev = evaluate(&raw, &aux_vec)?;
        let grad: nd::Array1<f64> = ev.grad_raw.iter().copied()
            .chain(ev.grad_aux.iter().map(|g| g * precon))
            .collect();
        n_eval += 1;
        fids_hist.push(ev.fids.clone());

        if let Some(stride) = opts.check_grad {
            if n_eval % stride.max(1) == 0 {
                let cost_at = |xv: &nd::Array1<f64>| -> Result<f64> {
                    let r: nd::Array2<f64> = xv.slice(s![..ctrl_size])
                        .to_owned()
                        .into_shape((n_ctrls, plen))?;
                    let a: Vec<f64> = xv.iter().skip(ctrl_size)
                        .map(|z| z * precon)
                        .collect();
                    Ok(evaluate(&r, &a)?.tot_cost)
                };
                let idx = (n_eval * 7919) % x.len();
                let eps = 1e-7;
                let mut xp = x.to_owned();
                xp[idx] += eps;
                let mut xm = x.to_owned();
                xm[idx] -= eps;
                let fd = (cost_at(&xp)? - cost_at(&xm)?) / (2.0 * eps);
                let an = grad[idx];
                let scale = fd.abs().max(an.abs());
                if scale > 1e-10 && (fd - an).abs() > 1e-2 * scale {
                    log::warn!(
                        "gradient check failed at parameter {}: \
                        analytic {:.6e} vs finite-difference {:.6e}",
                        idx, an, fd,
                    );
                }
            }
        }

        let aux_arr = nd::Array1::from_vec(aux_vec);
        let data = ReportData {
            n_eval,
            fids: &ev.fids,
            raw_controls: &raw,
            awg_controls: &ev.awg,
            sim_controls: &ev.sim,
            aux_params: &aux_arr,
            pen_costs: &ev.pen_costs,
            tot_cost: ev.tot_cost,
            tot_grad: &grad,
            dt: sim_dt,
            n_ss: opts.n_ss,
        };
        for rep in reporters.iter_mut() {
            rep.call(&data)?;
        }

        let satisfied = opts.term_fid
            .map(|term| ev.fids.iter().all(|&f| f >= term))
            .unwrap_or(false);
        Ok(ObjectiveEval {
            cost: ev.tot_cost,
            grad,
            satisfied,
        })
    };

    let solver_opts = SolverOpts {
        maxiter: opts.maxiter,
        gtol: opts.gtol,
        ftol: opts.ftol,
        ..SolverOpts::default()
    };
    let report = solver::minimize_lbfgsb(
        objective, x0, bounds_vec.as_deref(), &solver_opts)?;
    log::info!(
        "finished after {} iterations ({} evaluations): {}",
        report.nit, report.nfev, report.message,
    );

    let raw_controls: nd::Array2<f64> = report.x.slice(s![..ctrl_size])
        .to_owned()
        .into_shape((n_ctrls, plen))?;
    let aux_vec: Vec<f64> = report.x.iter().skip(ctrl_size)
        .map(|z| z * precon)
        .collect();
    let ev = evaluate(&raw_controls, &aux_vec)?;
    Ok(GrapeResults {
        raw_controls,
        awg_controls: ev.awg,
        sim_controls: ev.sim,
        aux_params: nd::Array1::from_vec(aux_vec),
        fids: ev.fids,
        fids_hist,
        tot_cost: ev.tot_cost,
        message: report.message,
        success: report.success,
        nit: report.nit,
        nfev: report.nfev,
        dt: sim_dt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64 as C64;
    use crate::setup::FidelityKind;

    #[test]
    fn opts_parse_from_toml_with_defaults() {
        let opts = GrapeOpts::from_toml_str(
            "dt = 0.25\nmaxiter = 50\nterm_fid = 0.999\n"
        ).unwrap();
        assert_eq!(opts.dt, 0.25);
        assert_eq!(opts.maxiter, 50);
        assert_eq!(opts.term_fid, Some(0.999));
        assert_eq!(opts.n_ss, 1);
        assert!(opts.bounds.is_none());
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            GrapeOpts::from_toml_str("dt = \"fast\""),
            Err(GrapeError::Config(_)),
        ));
    }

    fn qubit_flip_setup() -> Setup {
        let h0 = nd::Array2::<C64>::zeros((2, 2));
        let sx = nd::array![
            [C64::from(0.0), C64::from(0.5)],
            [C64::from(0.5), C64::from(0.0)],
        ];
        let mut inits = nd::Array2::<C64>::zeros((1, 2));
        inits[[0, 0]] = C64::from(1.0);
        let mut finals = nd::Array2::<C64>::zeros((1, 2));
        finals[[0, 1]] = C64::from(1.0);
        Setup::state_transfer(
            h0, vec![sx], inits, finals, FidelityKind::Coherent,
        ).unwrap()
    }

    #[test]
    fn qubit_flip_optimizes_to_high_fidelity() {
        let setup = qubit_flip_setup();
        let plen = 16;
        let init: nd::Array2<f64> = nd::Array2::from_shape_fn(
            (1, plen),
            |(_, t)| {
                0.5 * (std::f64::consts::PI * (t as f64 + 0.5)
                    / plen as f64).sin()
            },
        );
        let opts = GrapeOpts {
            dt: std::f64::consts::PI / plen as f64,
            maxiter: 500,
            term_fid: Some(0.9999),
            bounds: Some((-4.0, 4.0)),
            ..GrapeOpts::default()
        };
        let results
            = run_grape(&init, &[setup], &[], &mut [], &opts).unwrap();
        assert!(results.success, "{}", results.message);
        assert!(results.fids[0] > 0.9999);
        assert_eq!(results.fids_hist.len(), results.nfev);
    }

    #[test]
    fn identical_setups_have_zero_discrepancy() {
        let setups = vec![qubit_flip_setup(), qubit_flip_setup()];
        let init: nd::Array2<f64> = nd::Array2::from_elem((1, 8), 0.3);
        let opts = GrapeOpts {
            dt: 0.2,
            maxiter: 1,
            discrepancy_penalty: 10.0,
            ..GrapeOpts::default()
        };
        let results
            = run_grape(&init, &setups, &[], &mut [], &opts).unwrap();
        assert_eq!(results.fids[0], results.fids[1]);
        // the discrepancy term contributes nothing
        assert!(
            (results.tot_cost - (1.0 - results.fids[0])).abs() < 1e-12
        );
    }

    #[test]
    fn mismatched_setup_controls_are_rejected() {
        let setup = qubit_flip_setup();
        let init: nd::Array2<f64> = nd::Array2::zeros((2, 8));
        let res = run_grape(
            &init, &[setup], &[], &mut [], &GrapeOpts::default());
        assert!(matches!(res, Err(GrapeError::DimensionMismatch(_))));
    }
}
