#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Gradient Ascent Pulse Engineering (GRAPE) for quantum-control waveforms.
//!
//! Given a drift Hamiltonian, a set of control Hamiltonians with
//! time-discretized amplitudes, and a target (boundary state pairs, a target
//! unitary, or an observable), this crate computes the fidelity of the
//! realized evolution and its exact analytic gradient with respect to every
//! waveform sample, then drives a bounded quasi-Newton search to maximize the
//! fidelity.
//!
//! Propagator derivatives are exact: the eigenbasis/Loewner divided-difference
//! construction for Hermitian generators and scaling-and-squaring with a
//! nested-commutator recursion for non-Hermitian ones. No finite differencing
//! and no tracing autodiff anywhere in the evaluation path.

pub mod error;
pub mod propagator;
pub mod fidelity;
pub mod setup;
pub mod response;
pub mod penalty;
pub mod hessian;
pub mod solver;
pub mod optimize;
pub mod reporters;
pub mod waves;

pub use error::{ GrapeError, Result };
pub use setup::{ Setup, Fids, FidelityKind, Method };
pub use optimize::{ run_grape, GrapeOpts, GrapeResults };
