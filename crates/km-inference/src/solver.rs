//! Solver seam and the fallback ladder.
//!
//! The time-point problem only produces a [`Model`]; anything that implements [`Solver`]
//! can optimise it. Parameters are passed as named numeric values so that a backend can
//! map them onto its own settings and ignore the ones it has no use for.

use crate::model::Model;
use km_core::{Error, Mode, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Relative optimality gap.
pub const MIP_GAP: &str = "mip_gap";
/// Absolute optimality gap.
pub const MIP_GAP_ABS: &str = "mip_gap_abs";
/// Wall-clock budget in seconds.
pub const TIME_LIMIT: &str = "time_limit";
/// Thread count.
pub const THREADS: &str = "threads";
/// Search focus.
pub const MIP_FOCUS: &str = "mip_focus";
/// Numerical care.
pub const NUMERIC_FOCUS: &str = "numeric_focus";
/// Pieces of the piecewise-linear approximation of `exp`/`ln`.
pub const FUNC_PIECES: &str = "func_pieces";
/// Error ratio of the piecewise-linear approximation.
pub const FUNC_PIECE_RATIO: &str = "func_piece_ratio";
/// Cut generation aggressiveness.
pub const CUTS: &str = "cuts";
/// Share of time spent in heuristics.
pub const HEURISTICS: &str = "heuristics";
/// Random seed.
pub const SEED: &str = "seed";
/// Allow non-convex terms.
pub const NON_CONVEX: &str = "non_convex";

/// Outcome of one solve.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    /// Proven optimal within the gaps.
    Optimal,
    /// Feasible but not proven optimal.
    Suboptimal,
    /// No feasible point exists.
    Infeasible,
    /// Budget exhausted; an incumbent may exist.
    TimeLimit,
    /// Anything else the backend reports.
    Other(String),
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Optimal => f.write_str("optimal"),
            SolveStatus::Suboptimal => f.write_str("suboptimal"),
            SolveStatus::Infeasible => f.write_str("infeasible"),
            SolveStatus::TimeLimit => f.write_str("time limit"),
            SolveStatus::Other(s) => write!(f, "other ({s})"),
        }
    }
}

/// Result of [`Solver::optimize`].
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutput {
    /// Termination status.
    pub status: SolveStatus,
    /// Objective of the incumbent, if any.
    pub objective: Option<f64>,
    /// Variable values of the incumbent, indexed by `VarId` (empty without one).
    pub values: Vec<f64>,
}

/// Named numeric solver parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolverParams {
    values: BTreeMap<String, f64>,
}

impl SolverParams {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter.
    pub fn set(&mut self, name: &str, value: f64) -> &mut Self {
        self.values.insert(name.to_string(), value);
        self
    }

    /// Set a parameter when a value is given.
    pub fn set_opt(&mut self, name: &str, value: Option<f64>) -> &mut Self {
        if let Some(v) = value {
            self.set(name, v);
        }
        self
    }

    /// Read a parameter.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Overlay `other` on top of `self`.
    pub fn apply(&mut self, other: &SolverParams) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), *v);
        }
    }

    /// All parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<const N: usize> From<[(&str, f64); N]> for SolverParams {
    fn from(pairs: [(&str, f64); N]) -> Self {
        let mut p = SolverParams::new();
        for (k, v) in pairs {
            p.set(k, v);
        }
        p
    }
}

/// Optimisation backend.
pub trait Solver {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Minimise the model's objective.
    fn optimize(&mut self, model: &Model, params: &SolverParams) -> Result<SolverOutput>;
}

impl<S: Solver + ?Sized> Solver for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn optimize(&mut self, model: &Model, params: &SolverParams) -> Result<SolverOutput> {
        (**self).optimize(model, params)
    }
}

/// Parameters of the first attempt.
pub fn initial_params(
    mode: Mode,
    mip_gap: f64,
    mip_gap_abs: f64,
    time_limit: Option<f64>,
    threads: Option<u32>,
    mip_focus: Option<u8>,
) -> SolverParams {
    let mut p = SolverParams::from([
        (MIP_GAP, mip_gap),
        (MIP_GAP_ABS, mip_gap_abs),
        (NON_CONVEX, 2.0),
        (NUMERIC_FOCUS, if mode == Mode::PatientWiseOnly { 3.0 } else { 0.0 }),
        (SEED, 123_456.0),
        (FUNC_PIECES, 1000.0),
        (FUNC_PIECE_RATIO, 0.5),
    ]);
    p.set_opt(TIME_LIMIT, time_limit)
        .set_opt(THREADS, threads.map(f64::from))
        .set_opt(MIP_FOCUS, mip_focus.map(f64::from));
    p
}

/// One rung of the fallback ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackStep {
    /// Parameters overridden for this and every later attempt.
    pub overrides: SolverParams,
    /// What the step does, for logs.
    pub description: String,
}

impl FallbackStep {
    fn new(overrides: SolverParams, description: &str) -> Self {
        Self { overrides, description: description.to_string() }
    }
}

/// Ordered fallback steps tried while a solve is not proven optimal.
pub fn fallback_ladder(mode: Mode, initial: &SolverParams) -> Vec<FallbackStep> {
    let mut steps = Vec::new();
    if initial.get(MIP_FOCUS) != Some(2.0) {
        steps.push(FallbackStep::new([(MIP_FOCUS, 2.0)].into(), "mip_focus set to 2 (optimality)"));
    }
    if let Some(t) = initial.get(TIME_LIMIT) {
        steps.push(FallbackStep::new([(TIME_LIMIT, t * 1.5)].into(), "time limit increased by 50%"));
    }
    let pieces = initial.get(FUNC_PIECES).unwrap_or(0.0);
    if pieces < 2000.0 {
        steps.push(FallbackStep::new(
            [(FUNC_PIECES, (pieces * 2.0).floor().max(2000.0))].into(),
            "func_pieces doubled",
        ));
    }
    if pieces < 5000.0 {
        steps.push(FallbackStep::new(
            [(FUNC_PIECES, (pieces * 2.5).floor().max(5000.0)), (FUNC_PIECE_RATIO, 0.75)].into(),
            "func_pieces increased and func_piece_ratio set to 0.75",
        ));
    }
    if mode == Mode::PatientWiseOnly {
        steps.push(FallbackStep::new([(NUMERIC_FOCUS, 1.0)].into(), "numeric_focus set to 1"));
    } else {
        steps.push(FallbackStep::new([(NUMERIC_FOCUS, 2.0)].into(), "numeric_focus set to 2"));
    }
    steps.push(FallbackStep::new([(CUTS, 2.0)].into(), "aggressive cut generation"));
    steps.push(FallbackStep::new([(HEURISTICS, 0.5)].into(), "less aggressive heuristics"));
    steps
}

/// Solve, climbing the fallback ladder while the result is suboptimal or timed out.
///
/// Returns the output when it is `Optimal` or `Infeasible`; every other final status
/// is an [`Error::Solver`].
pub fn optimize_with_fallbacks<S: Solver + ?Sized>(
    solver: &mut S,
    model: &Model,
    initial: &SolverParams,
    ladder: &[FallbackStep],
) -> Result<SolverOutput> {
    let mut params = initial.clone();
    log::debug!("{}: solving '{}'", solver.name(), model.name());
    let mut out = solver.optimize(model, &params)?;

    if matches!(out.status, SolveStatus::Suboptimal | SolveStatus::TimeLimit) {
        for (i, step) in ladder.iter().enumerate() {
            log::warn!(
                "{}: status {} on '{}'; fallback {}: {}",
                solver.name(),
                out.status,
                model.name(),
                i + 1,
                step.description
            );
            params.apply(&step.overrides);
            out = solver.optimize(model, &params)?;
            if out.status == SolveStatus::Optimal {
                log::info!("{}: fallback {} reached optimality", solver.name(), i + 1);
                break;
            }
        }
    }

    if matches!(out.status, SolveStatus::Optimal | SolveStatus::Infeasible) {
        return Ok(out);
    }
    Err(Error::Solver(format!(
        "{} finished '{}' with status {} after {} fallbacks",
        solver.name(),
        model.name(),
        out.status,
        ladder.len()
    )))
}
