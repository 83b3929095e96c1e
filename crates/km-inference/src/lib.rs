//! # km-inference
//!
//! Profile-likelihood confidence bands for Kaplan-Meier curves when the stratification
//! parameter of each patient is only known up to a likelihood.
//!
//! This crate provides:
//! - patient likelihoods and parameter ranges
//! - the per-time-point optimisation model (patient selection + binomial profile)
//! - a solver seam with an exact count-enumeration backend and a fallback ladder
//! - the deviance sweep that turns a curve of twice-NLL values into confidence bands
//! - nominal (observed-parameter) curves for reference
//!
//! ## Architecture
//!
//! [`formulation::TimePointProblem`] builds a [`model::Model`] once per time point and only
//! swaps the probability-dependent constraints between candidates. Any backend that
//! implements [`solver::Solver`] can consume that model; [`exact::ExactSolver`] is the
//! one shipped here.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Likelihood and solver settings.
pub mod config;
/// Tie-tolerant discrete minimisation and grid bisection.
pub mod discrete;
/// Exact count-enumeration solver for the selection model.
pub mod exact;
/// Time-point problem: derived data and the optimisation model.
pub mod formulation;
/// Event grouping at a time point.
pub mod grouping;
/// Kaplan-Meier probabilities from group counts.
pub mod km;
/// Algebraic optimisation model.
pub mod model;
/// Nominal curves on observed parameters.
pub mod nominal;
/// Patients and their parameter likelihoods.
pub mod patient;
/// Patient-wise and binomial penalties.
pub mod penalty;
/// Deviance curves and confidence bands.
pub mod profile;
/// Solver trait, parameters and the fallback ladder.
pub mod solver;

pub use config::{CandidateGrid, ExactSolverConfig, LikelihoodConfig};
pub use exact::ExactSolver;
pub use formulation::{ProfileFit, TimePointProblem};
pub use grouping::{EventGroups, group_patients};
pub use km::kaplan_meier_probability;
pub use nominal::{NominalCurve, NominalSeries, StratifiedCurves, times_for_plot};
pub use patient::{ParameterLikelihood, Patient};
pub use penalty::ParameterRange;
pub use profile::{
    ConfidenceBand, DevianceCurve, KaplanMeierLikelihood, LikelihoodBand, possible_probabilities,
};
pub use solver::{SolveStatus, Solver, SolverOutput, SolverParams};
