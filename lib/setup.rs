//! Optimization targets: a drift, a set of control generators, and a
//! figure of merit with exact gradients.
//!
//! A [`Setup`] owns everything needed to score one waveform against one
//! physical target. The fidelity mode and propagation method are fixed at
//! construction, so the evaluation path contains no mode dispatch beyond a
//! single match on the stored target. Several setups can be optimized
//! jointly; see [`crate::optimize::run_grape`].

use ndarray::{ self as nd, linalg::kron };
use num_complex::Complex64 as C64;
use crate::error::{ GrapeError, Result };
use crate::fidelity::{
    self,
    Generators,
    StateOverlap,
};

/// How state-transfer overlaps are scored; see [`StateOverlap`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FidelityKind {
    Coherent,
    Incoherent,
    Subspace,
}

impl From<FidelityKind> for StateOverlap {
    fn from(kind: FidelityKind) -> Self {
        match kind {
            FidelityKind::Coherent => Self::Coherent,
            FidelityKind::Incoherent => Self::Incoherent,
            FidelityKind::Subspace => Self::Subspace,
        }
    }
}

/// Propagation method for state-transfer targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    /// Dense per-step propagators with exact derivatives.
    Exact,
    /// Truncated-series propagation of the boundary states; never forms a
    /// propagator, so it scales to large dimensions. Ignored for unitary and
    /// expectation-value targets.
    Taylor,
}

const DEFAULT_TAYLOR_ORDER: usize = 5;

/// Calibration refuses to raise the series order beyond this.
pub const MAX_TAYLOR_ORDER: usize = 256;

#[derive(Clone, Debug)]
enum Target {
    States {
        inits: nd::Array2<C64>,
        finals: nd::Array2<C64>,
        kind: StateOverlap,
    },
    Unitary(nd::Array2<C64>),
    Expectation {
        init: nd::Array1<C64>,
        op: nd::Array2<C64>,
    },
}

/// Fidelity and gradients for one waveform against one setup.
#[derive(Clone, Debug)]
pub struct Fids {
    pub fid: f64,
    /// `(n_ctrls, plen)`, aligned with the waveform.
    pub d_controls: nd::Array2<f64>,
    /// One entry per gauge parameter.
    pub d_aux: nd::Array1<f64>,
    /// Final propagated states, one per column.
    pub states: nd::Array2<C64>,
}

/// One optimization target.
#[derive(Clone, Debug)]
pub struct Setup {
    h0: nd::Array2<C64>,
    hcs: Vec<nd::Array2<C64>>,
    target: Target,
    gauge_ops: Option<Vec<nd::Array2<C64>>>,
    loss_vec: Option<nd::Array1<f64>>,
    hermitian: bool,
    method: Method,
    taylor_order: usize,
    /// The raw figure of merit is quadratic in the underlying amplitudes
    /// (density-operator overlaps); report its square root instead.
    sqrt_rescale: bool,
}

fn hermitian_enough(a: &nd::Array2<C64>) -> bool {
    let scale: f64
        = a.iter().map(|x| x.norm()).fold(0.0, f64::max).max(1.0);
    a.indexed_iter()
        .all(|((i, j), x)| (x - a[[j, i]].conj()).norm() < 1e-12 * scale)
}

fn check_generators(h0: &nd::Array2<C64>, hcs: &[nd::Array2<C64>])
    -> Result<bool>
{
    let dim = h0.nrows();
    if h0.ncols() != dim {
        return Err(GrapeError::DimensionMismatch(
            format!("drift is {}x{}, expected square", dim, h0.ncols())
        ));
    }
    for (k, hc) in hcs.iter().enumerate() {
        if hc.dim() != (dim, dim) {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "control generator {} is {}x{}, expected {}x{}",
                    k, hc.nrows(), hc.ncols(), dim, dim,
                )
            ));
        }
    }
    let hermitian
        = hermitian_enough(h0) && hcs.iter().all(hermitian_enough);
    if !hermitian {
        log::warn!(
            "non-Hermitian generator detected; \
            switching to scaling-and-squaring propagators"
        );
    }
    Ok(hermitian)
}

fn check_states(label: &str, states: &nd::Array2<C64>, dim: usize)
    -> Result<()>
{
    if states.ncols() != dim {
        return Err(GrapeError::DimensionMismatch(
            format!(
                "{} states have length {}, expected {}",
                label, states.ncols(), dim,
            )
        ));
    }
    Ok(())
}

impl Setup {
    /// Drive a set of initial states onto a set of target states, scored
    /// according to `kind`.
    ///
    /// States are rows of `inits` and `finals`; the row counts must match
    /// except in [`FidelityKind::Subspace`] mode, where `finals` spans the
    /// target subspace.
    pub fn state_transfer(
        h0: nd::Array2<C64>,
        hcs: Vec<nd::Array2<C64>>,
        inits: nd::Array2<C64>,
        finals: nd::Array2<C64>,
        kind: FidelityKind,
    ) -> Result<Self>
    {
        let hermitian = check_generators(&h0, &hcs)?;
        let dim = h0.nrows();
        check_states("initial", &inits, dim)?;
        check_states("target", &finals, dim)?;
        if kind != FidelityKind::Subspace
            && inits.nrows() != finals.nrows()
        {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "{} initial states but {} target states",
                    inits.nrows(), finals.nrows(),
                )
            ));
        }
        Ok(Self {
            h0,
            hcs,
            target: Target::States { inits, finals, kind: kind.into() },
            gauge_ops: None,
            loss_vec: None,
            hermitian,
            method: Method::Exact,
            taylor_order: DEFAULT_TAYLOR_ORDER,
            sqrt_rescale: false,
        })
    }

    /// Realize a target unitary up to global phase.
    ///
    /// A target with support on only some rows matches the evolution on the
    /// corresponding subspace.
    pub fn unitary(
        h0: nd::Array2<C64>,
        hcs: Vec<nd::Array2<C64>>,
        u_target: nd::Array2<C64>,
    ) -> Result<Self>
    {
        let hermitian = check_generators(&h0, &hcs)?;
        let dim = h0.nrows();
        if u_target.dim() != (dim, dim) {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "target unitary is {}x{}, expected {}x{}",
                    u_target.nrows(), u_target.ncols(), dim, dim,
                )
            ));
        }
        Ok(Self {
            h0,
            hcs,
            target: Target::Unitary(u_target),
            gauge_ops: None,
            loss_vec: None,
            hermitian,
            method: Method::Exact,
            taylor_order: DEFAULT_TAYLOR_ORDER,
            sqrt_rescale: false,
        })
    }

    /// Maximize the expectation value of a Hermitian observable in the final
    /// propagated state.
    pub fn expectation(
        h0: nd::Array2<C64>,
        hcs: Vec<nd::Array2<C64>>,
        init: nd::Array1<C64>,
        op: nd::Array2<C64>,
    ) -> Result<Self>
    {
        let hermitian = check_generators(&h0, &hcs)?;
        let dim = h0.nrows();
        if init.len() != dim || op.dim() != (dim, dim) {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "expectation target: state length {}, observable {}x{}, \
                    expected dimension {}",
                    init.len(), op.nrows(), op.ncols(), dim,
                )
            ));
        }
        Ok(Self {
            h0,
            hcs,
            target: Target::Expectation { init, op },
            gauge_ops: None,
            loss_vec: None,
            hermitian,
            method: Method::Exact,
            taylor_order: DEFAULT_TAYLOR_ORDER,
            sqrt_rescale: false,
        })
    }

    /// Drive density operators under full Lindblad dynamics.
    ///
    /// Generators and collapse operators live in the Hilbert space; the setup
    /// is built in the vectorized Liouville space of dimension `dim²`. If
    /// `inits`/`finals` rows have length `dim` they are taken as Hilbert-space
    /// states and every outer-product pair `|i_a⟩⟨i_b|` becomes a boundary
    /// operator, so phase coherence between the tracked states is scored too;
    /// rows of length `dim²` are taken as already-vectorized operators.
    ///
    /// The raw density-operator overlap is quadratic in the state amplitudes,
    /// so the reported fidelity is its square root with the matching factor
    /// in the gradients.
    pub fn lindblad(
        h0: nd::Array2<C64>,
        hcs: Vec<nd::Array2<C64>>,
        c_ops: &[nd::Array2<C64>],
        inits: nd::Array2<C64>,
        finals: nd::Array2<C64>,
        kind: FidelityKind,
    ) -> Result<Self>
    {
        check_generators(&h0, &hcs)?;
        let dim = h0.nrows();
        for (k, c) in c_ops.iter().enumerate() {
            if c.dim() != (dim, dim) {
                return Err(GrapeError::DimensionMismatch(
                    format!(
                        "collapse operator {} is {}x{}, expected {}x{}",
                        k, c.nrows(), c.ncols(), dim, dim,
                    )
                ));
            }
        }
        let mut h0_super = hamiltonian_superop(&h0);
        for c in c_ops.iter() {
            h0_super += &dissipator_superop(c);
        }
        let hcs_super: Vec<nd::Array2<C64>>
            = hcs.iter().map(hamiltonian_superop).collect();
        let (rho_inits, rho_finals) =
            if inits.ncols() == dim {
                check_states("initial", &inits, dim)?;
                check_states("target", &finals, dim)?;
                (density_rows(&inits), density_rows(&finals))
            } else {
                check_states("initial", &inits, dim * dim)?;
                check_states("target", &finals, dim * dim)?;
                (inits, finals)
            };
        if kind != FidelityKind::Subspace
            && rho_inits.nrows() != rho_finals.nrows()
        {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "{} initial operators but {} target operators",
                    rho_inits.nrows(), rho_finals.nrows(),
                )
            ));
        }
        Ok(Self {
            h0: h0_super,
            hcs: hcs_super,
            target: Target::States {
                inits: rho_inits,
                finals: rho_finals,
                kind: kind.into(),
            },
            gauge_ops: None,
            loss_vec: None,
            hermitian: false,
            method: Method::Exact,
            taylor_order: DEFAULT_TAYLOR_ORDER,
            sqrt_rescale: true,
        })
    }

    /// Fold collapse operators into the drift as the effective non-Hermitian
    /// term `-(i/2) Σ c†c`.
    ///
    /// This keeps the Hilbert-space dimension (no vectorization) at the cost
    /// of treating quantum jumps as pure loss; amplitude that would decay
    /// simply leaves the norm.
    pub fn with_absorbed_dissipators(
        mut self,
        c_ops: &[nd::Array2<C64>],
    ) -> Result<Self>
    {
        let dim = self.h0.nrows();
        for (k, c) in c_ops.iter().enumerate() {
            if c.dim() != (dim, dim) {
                return Err(GrapeError::DimensionMismatch(
                    format!(
                        "collapse operator {} is {}x{}, expected {}x{}",
                        k, c.nrows(), c.ncols(), dim, dim,
                    )
                ));
            }
            let chc = c.t().mapv(|x| x.conj()).dot(c);
            self.h0.scaled_add(C64::new(0.0, -0.5), &chc);
        }
        self.hermitian = false;
        Ok(self)
    }

    /// Add gauge generators; one auxiliary parameter per generator is
    /// optimized alongside the waveform.
    pub fn with_gauge_ops(mut self, gauge_ops: Vec<nd::Array2<C64>>)
        -> Result<Self>
    {
        let dim = self.h0.nrows();
        for (j, g) in gauge_ops.iter().enumerate() {
            if g.dim() != (dim, dim) {
                return Err(GrapeError::DimensionMismatch(
                    format!(
                        "gauge generator {} is {}x{}, expected {}x{}",
                        j, g.nrows(), g.ncols(), dim, dim,
                    )
                ));
            }
        }
        self.gauge_ops = Some(gauge_ops);
        Ok(self)
    }

    /// Mask per-level amplitude after every step; entries should be 1 for
    /// retained levels and 0 (or a decay factor) for lossy ones.
    pub fn with_loss_vec(mut self, loss_vec: nd::Array1<f64>)
        -> Result<Self>
    {
        if loss_vec.len() != self.h0.nrows() {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "loss vector has length {}, expected {}",
                    loss_vec.len(), self.h0.nrows(),
                )
            ));
        }
        self.loss_vec = Some(loss_vec);
        Ok(self)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_taylor_order(mut self, order: usize) -> Self {
        self.taylor_order = order.max(1);
        self
    }

    pub fn n_ctrls(&self) -> usize { self.hcs.len() }

    pub fn n_aux(&self) -> usize {
        self.gauge_ops.as_ref().map(|g| g.len()).unwrap_or(0)
    }

    pub fn dim(&self) -> usize { self.h0.nrows() }

    pub fn taylor_order(&self) -> usize { self.taylor_order }

    fn generators<'a>(&'a self, dt: f64) -> Generators<'a> {
        Generators {
            h0: &self.h0,
            hcs: &self.hcs,
            gauge_ops: self.gauge_ops.as_deref(),
            loss: self.loss_vec.as_ref(),
            hermitian: self.hermitian,
            dt,
        }
    }

    /// Score one waveform: fidelity plus gradients with respect to every
    /// control sample and gauge parameter.
    pub fn get_fids(
        &self,
        controls: &nd::Array2<f64>,
        aux_params: &[f64],
        dt: f64,
    ) -> Result<Fids>
    {
        if controls.nrows() != self.hcs.len() {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "waveform has {} rows but setup has {} controls",
                    controls.nrows(), self.hcs.len(),
                )
            ));
        }
        if aux_params.len() != self.n_aux() {
            return Err(GrapeError::DimensionMismatch(
                format!(
                    "{} auxiliary parameters but {} gauge generators",
                    aux_params.len(), self.n_aux(),
                )
            ));
        }
        let gens = self.generators(dt);
        let sweep = match (&self.target, self.method) {
            (Target::States { inits, finals, kind }, Method::Exact) => {
                fidelity::states_fidelity(
                    &gens, controls, aux_params, inits, finals, *kind)?
            },
            (Target::States { inits, finals, kind }, Method::Taylor) => {
                fidelity::taylor_states_fidelity(
                    &gens, controls, aux_params, inits, finals, *kind,
                    self.taylor_order,
                )?
            },
            (Target::Unitary(u_target), _) => {
                fidelity::unitary_fidelity(
                    &gens, controls, aux_params, u_target)?
            },
            (Target::Expectation { init, op }, _) => {
                fidelity::expectation_value(
                    &gens, controls, aux_params, init, op)?
            },
        };
        let (fid, d_controls, d_aux) =
            if self.sqrt_rescale {
                let raw = sweep.fid.max(f64::MIN_POSITIVE);
                let fid = raw.sqrt();
                let scale = 0.5 / fid;
                (
                    fid,
                    sweep.d_controls.mapv(|x| x * scale),
                    sweep.d_aux.mapv(|x| x * scale),
                )
            } else {
                (sweep.fid, sweep.d_controls, sweep.d_aux)
            };
        Ok(Fids { fid, d_controls, d_aux, states: sweep.states })
    }

    /// Raise the series order until doubling it no longer changes the final
    /// states of a full-amplitude probe waveform by more than `tol`
    /// (relative), starting from the current order.
    ///
    /// The probe is deterministic, so repeated calibration with unchanged
    /// parameters is a no-op. Fails with
    /// [`CalibrationDiverged`][GrapeError::CalibrationDiverged] rather than
    /// raising the order past [`MAX_TAYLOR_ORDER`].
    pub fn calibrate_taylor_order(
        &mut self,
        max_amp: f64,
        plen: usize,
        dt: f64,
        tol: f64,
    ) -> Result<usize>
    {
        let (inits, finals, kind) = match &self.target {
            Target::States { inits, finals, kind } => (inits, finals, *kind),
            _ => return Ok(self.taylor_order),
        };
        let n_ctrls = self.hcs.len();
        let probe: nd::Array2<f64> = nd::Array2::from_shape_fn(
            (n_ctrls, plen),
            |(k, t)| {
                let phase = std::f64::consts::PI
                    * (k + 1) as f64 * (t as f64 + 0.5) / plen as f64;
                max_amp * phase.cos()
            },
        );
        let aux = vec![0.0; self.n_aux()];
        let gens = self.generators(dt);
        let mut order = self.taylor_order;
        loop {
            let lo = fidelity::taylor_states_fidelity(
                &gens, &probe, &aux, inits, finals, kind, order)?;
            let hi = fidelity::taylor_states_fidelity(
                &gens, &probe, &aux, inits, finals, kind, 2 * order)?;
            let num: f64 = lo.states.iter().zip(hi.states.iter())
                .map(|(a, b)| (a - b).norm_sqr())
                .sum();
            let den: f64
                = hi.states.iter().map(|x| x.norm_sqr()).sum::<f64>()
                .max(f64::MIN_POSITIVE);
            if (num / den).sqrt() < tol {
                break;
            }
            order *= 2;
            if order > MAX_TAYLOR_ORDER {
                return Err(GrapeError::CalibrationDiverged(
                    MAX_TAYLOR_ORDER));
            }
            log::info!("taylor order raised to {}", order);
        }
        self.taylor_order = order;
        Ok(order)
    }
}

/// Superoperator of the commutator `-i[H, ·]` (without the `-i`), acting on
/// row-major vectorized operators.
pub fn hamiltonian_superop(h: &nd::Array2<C64>) -> nd::Array2<C64> {
    let eye: nd::Array2<C64> = nd::Array2::eye(h.nrows());
    kron(h, &eye) - kron(&eye, &h.t())
}

/// Lindblad dissipator of one collapse operator as a contribution to the
/// effective superoperator drift: `i (c ⊗ c* − ½ (c†c ⊗ 1 + 1 ⊗ (c†c)ᵀ))`,
/// so that `exp(-i dt H_super)` realizes the dissipative semigroup.
pub fn dissipator_superop(c: &nd::Array2<C64>) -> nd::Array2<C64> {
    let dim = c.nrows();
    let eye: nd::Array2<C64> = nd::Array2::eye(dim);
    let c_conj = c.mapv(|x| x.conj());
    let chc = c.t().mapv(|x| x.conj()).dot(c);
    let mut d = kron(c, &c_conj);
    d.scaled_add(C64::from(-0.5), &kron(&chc, &eye));
    d.scaled_add(C64::from(-0.5), &kron(&eye, &chc.t()));
    d.mapv(|x| C64::i() * x)
}

/// Vectorize every outer-product pair of the given Hilbert-space states
/// (rows) into density-operator rows.
fn density_rows(states: &nd::Array2<C64>) -> nd::Array2<C64> {
    let n = states.nrows();
    let dim = states.ncols();
    let mut out: nd::Array2<C64> = nd::Array2::zeros((n * n, dim * dim));
    for a in 0..n {
        for b in 0..n {
            for i in 0..dim {
                for j in 0..dim {
                    out[[a * n + b, i * dim + j]]
                        = states[[a, i]] * states[[b, j]].conj();
                }
            }
        }
    }
    out
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

    fn basis_state(dim: usize, k: usize) -> nd::Array2<C64> {
        let mut s: nd::Array2<C64> = nd::Array2::zeros((1, dim));
        s[[0, k]] = C64::from(1.0);
        s
    }

    #[test]
    fn mismatched_control_dims_are_rejected() {
        let h0 = nd::Array2::<C64>::zeros((3, 3));
        let hc = nd::Array2::<C64>::zeros((2, 2));
        let res = Setup::state_transfer(
            h0, vec![hc],
            basis_state(3, 0), basis_state(3, 1),
            FidelityKind::Coherent,
        );
        assert!(matches!(res, Err(GrapeError::DimensionMismatch(_))));
    }

    #[test]
    fn pi_pulse_reaches_unit_fidelity() {
        // H = (c/2) σx with c = 1 over total time π flips |0⟩ to |1⟩
        let h0 = nd::Array2::<C64>::zeros((2, 2));
        let sx = nd::array![
            [C64::from(0.0), C64::from(0.5)],
            [C64::from(0.5), C64::from(0.0)],
        ];
        let setup = Setup::state_transfer(
            h0, vec![sx],
            basis_state(2, 0), basis_state(2, 1),
            FidelityKind::Coherent,
        ).unwrap();
        let controls = nd::Array2::from_elem((1, 4), 1.0);
        let fids = setup
            .get_fids(&controls, &[], std::f64::consts::PI / 4.0)
            .unwrap();
        assert!((fids.fid - 1.0).abs() < 1e-12);
    }

    #[test]
    fn lindblad_without_dissipation_matches_pure_state_overlap() {
        let mut rng = StdRng::seed_from_u64(211);
        let h0 = random_hermitian(2, &mut rng);
        let hc = random_hermitian(2, &mut rng);
        let controls = nd::Array2::from_shape_fn(
            (1, 4), |_| rng.gen_range(-0.5..0.5));
        let dt = 0.2;

        let pure = Setup::state_transfer(
            h0.clone(), vec![hc.clone()],
            basis_state(2, 0), basis_state(2, 1),
            FidelityKind::Coherent,
        ).unwrap();
        let lind = Setup::lindblad(
            h0, vec![hc], &[],
            basis_state(2, 0), basis_state(2, 1),
            FidelityKind::Coherent,
        ).unwrap();

        let f_pure = pure.get_fids(&controls, &[], dt).unwrap().fid;
        let f_lind = lind.get_fids(&controls, &[], dt).unwrap().fid;
        assert!((f_pure - f_lind).abs() < 1e-10);
    }

    #[test]
    fn lindblad_fidelity_stays_bounded_with_decay() {
        let mut rng = StdRng::seed_from_u64(223);
        let h0 = random_hermitian(2, &mut rng);
        let hc = random_hermitian(2, &mut rng);
        let lower = nd::array![
            [C64::from(0.0), C64::from(0.4)],
            [C64::from(0.0), C64::from(0.0)],
        ];
        let lind = Setup::lindblad(
            h0, vec![hc], &[lower],
            basis_state(2, 0), basis_state(2, 1),
            FidelityKind::Coherent,
        ).unwrap();
        let controls = nd::Array2::from_shape_fn(
            (1, 6), |_| rng.gen_range(-0.5..0.5));
        let fid = lind.get_fids(&controls, &[], 0.2).unwrap().fid;
        assert!(fid >= 0.0 && fid <= 1.0 + 1e-12);
    }

    #[test]
    fn absorbed_dissipators_shrink_the_norm() {
        let mut rng = StdRng::seed_from_u64(227);
        let h0 = random_hermitian(2, &mut rng);
        let hc = random_hermitian(2, &mut rng);
        let lower = nd::array![
            [C64::from(0.0), C64::from(0.5)],
            [C64::from(0.0), C64::from(0.0)],
        ];
        let setup = Setup::state_transfer(
            h0, vec![hc],
            basis_state(2, 1), basis_state(2, 1),
            FidelityKind::Coherent,
        ).unwrap()
            .with_absorbed_dissipators(&[lower])
            .unwrap();
        let controls = nd::Array2::zeros((1, 5));
        let fids = setup.get_fids(&controls, &[], 0.3).unwrap();
        let norm: f64
            = fids.states.iter().map(|x| x.norm_sqr()).sum();
        assert!(norm < 1.0 - 1e-6);
    }

    #[test]
    fn taylor_calibration_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(229);
        let h0 = random_hermitian(3, &mut rng);
        let hc = random_hermitian(3, &mut rng);
        let mut setup = Setup::state_transfer(
            h0, vec![hc],
            basis_state(3, 0), basis_state(3, 2),
            FidelityKind::Coherent,
        ).unwrap()
            .with_method(Method::Taylor);
        let first = setup
            .calibrate_taylor_order(1.0, 8, 0.1, 1e-9)
            .unwrap();
        let second = setup
            .calibrate_taylor_order(1.0, 8, 0.1, 1e-9)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(setup.taylor_order(), first);
    }

    #[test]
    fn impossible_calibration_tolerance_hits_the_order_cap() {
        let mut rng = StdRng::seed_from_u64(231);
        let h0 = random_hermitian(3, &mut rng);
        let hc = random_hermitian(3, &mut rng);
        let mut setup = Setup::state_transfer(
            h0, vec![hc],
            basis_state(3, 0), basis_state(3, 2),
            FidelityKind::Coherent,
        ).unwrap()
            .with_method(Method::Taylor);
        let res = setup.calibrate_taylor_order(1.0, 8, 0.1, 0.0);
        assert!(matches!(
            res,
            Err(GrapeError::CalibrationDiverged(MAX_TAYLOR_ORDER)),
        ));
    }

    #[test]
    fn superop_drift_preserves_trace() {
        let mut rng = StdRng::seed_from_u64(233);
        let h = random_hermitian(2, &mut rng);
        let lower = nd::array![
            [C64::from(0.0), C64::from(0.3)],
            [C64::from(0.0), C64::from(0.0)],
        ];
        let l = hamiltonian_superop(&h) + dissipator_superop(&lower);
        // the trace functional (1, 0, 0, 1) must be a left null vector of
        // the generator -iL
        let tr = nd::array![
            C64::from(1.0), C64::from(0.0), C64::from(0.0), C64::from(1.0),
        ];
        let lhs = tr.dot(&l);
        assert!(lhs.iter().all(|x| x.norm() < 1e-12));
    }
}
