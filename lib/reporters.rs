//! Progress hooks invoked during optimization.
//!
//! A [`Reporter`] wraps a callback and a stride; [`run_grape`]
//! [`crate::optimize::run_grape`] calls every reporter after each objective
//! evaluation and the stride decides which calls actually fire. Stock
//! reporters cover logging and snapshotting waveforms to `.npz`; anything
//! else goes through [`Reporter::new`].

use std::fs::File;
use std::path::PathBuf;
use itertools::Itertools;
use ndarray::{ self as nd };
use ndarray_npy::NpzWriter;
use crate::error::Result;

/// Everything a reporter may want to look at after one objective evaluation.
#[derive(Copy, Clone)]
pub struct ReportData<'a> {
    /// Objective evaluations completed so far.
    pub n_eval: usize,
    /// Per-setup fidelities.
    pub fids: &'a [f64],
    /// Optimizer-resolution samples.
    pub raw_controls: &'a nd::Array2<f64>,
    /// Envelope-shaped samples, the waveform the hardware is programmed
    /// with.
    pub awg_controls: &'a nd::Array2<f64>,
    /// Upsampled, response-convolved samples the system actually sees.
    pub sim_controls: &'a nd::Array2<f64>,
    pub aux_params: &'a nd::Array1<f64>,
    /// Per-penalty costs, in the order the penalties were given.
    pub pen_costs: &'a [f64],
    pub tot_cost: f64,
    /// Flattened total-cost gradient (controls then gauge parameters).
    pub tot_grad: &'a nd::Array1<f64>,
    /// Simulation time step.
    pub dt: f64,
    /// Upsampling factor.
    pub n_ss: usize,
}

/// A progress callback with a call-count stride.
pub struct Reporter {
    every: usize,
    f: Box<dyn FnMut(&ReportData) -> Result<()>>,
}

impl Reporter {
    /// Wrap a callback to fire on every `every`-th objective evaluation.
    pub fn new<F>(every: usize, f: F) -> Self
    where F: FnMut(&ReportData) -> Result<()> + 'static
    {
        Self { every: every.max(1), f: Box::new(f) }
    }

    pub(crate) fn call(&mut self, data: &ReportData) -> Result<()> {
        if data.n_eval % self.every == 0 {
            (self.f)(data)
        } else {
            Ok(())
        }
    }
}

/// Log the total cost and per-setup fidelities.
pub fn print_costs(every: usize) -> Reporter {
    Reporter::new(every, |data| {
        log::info!(
            "eval {}: cost {:.6e}, fids [{}]",
            data.n_eval,
            data.tot_cost,
            data.fids.iter().map(|f| format!("{:.6}", f)).join(", "),
        );
        Ok(())
    })
}

/// Log per-penalty costs alongside the fidelity part of the total.
pub fn print_penalties(every: usize) -> Reporter {
    Reporter::new(every, |data| {
        let mean_fid: f64
            = data.fids.iter().sum::<f64>() / data.fids.len() as f64;
        log::info!(
            "eval {}: infidelity {:.6e}, penalties [{}]",
            data.n_eval,
            1.0 - mean_fid,
            data.pen_costs.iter().map(|c| format!("{:.3e}", c)).join(", "),
        );
        Ok(())
    })
}

/// Snapshot the current waveforms and fidelities to an `.npz` archive,
/// overwriting it each time so the file always holds the latest iterate.
pub fn save_waves<P>(every: usize, path: P) -> Reporter
where P: Into<PathBuf>
{
    let path: PathBuf = path.into();
    Reporter::new(every, move |data| {
        let mut npz = NpzWriter::new(File::create(&path)?);
        npz.add_array("raw_controls", data.raw_controls)?;
        npz.add_array("awg_controls", data.awg_controls)?;
        npz.add_array("sim_controls", data.sim_controls)?;
        npz.add_array("aux_params", data.aux_params)?;
        npz.add_array("fids", &nd::Array1::from_vec(data.fids.to_vec()))?;
        npz.add_array("dt", &nd::arr0(data.dt))?;
        npz.finish()?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_data<'a>(
        n_eval: usize,
        arrs: &'a (nd::Array2<f64>, nd::Array1<f64>),
    ) -> ReportData<'a>
    {
        ReportData {
            n_eval,
            fids: &[],
            raw_controls: &arrs.0,
            awg_controls: &arrs.0,
            sim_controls: &arrs.0,
            aux_params: &arrs.1,
            pen_costs: &[],
            tot_cost: 0.0,
            tot_grad: &arrs.1,
            dt: 1.0,
            n_ss: 1,
        }
    }

    #[test]
    fn stride_gates_the_callback() {
        let arrs = (nd::Array2::zeros((1, 4)), nd::Array1::zeros(0));
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let fired_inner = fired.clone();
        let mut rep = Reporter::new(3, move |_| {
            fired_inner.set(fired_inner.get() + 1);
            Ok(())
        });
        for n in 1..=9 {
            rep.call(&dummy_data(n, &arrs)).unwrap();
        }
        assert_eq!(fired.get(), 3);
    }
}
