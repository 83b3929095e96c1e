//! Profile-likelihood sweep.
//!
//! For every time point the deviance (twice the profiled NLL) is a function of the
//! candidate survival probability. The best fit minimises it; a confidence interval at
//! level `CL` is the set of probabilities whose deviance stays within
//! `chi2.ppf(CL, 1)` of the minimum.
//!
//! Full and binomial-only modes are smooth in the probability and use argmin's Brent
//! minimiser and root finder. The patient-wise-only deviance is a step function, so it
//! is minimised and inverted on a grid (see [`crate::discrete`]).

use crate::config::{CandidateGrid, LikelihoodConfig};
use crate::discrete::{binary_search_sign_change, minimize_discrete_single_minimum};
use crate::formulation::{ProfileFit, TimePointProblem};
use crate::patient::Patient;
use crate::penalty::ParameterRange;
use crate::solver::Solver;
use argmin::core::{CostFunction, Executor, State};
use argmin::solver::brent::{BrentOpt, BrentRoot};
use km_core::{Error, Mode, Result};
use km_prob::chi2;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;

/// Sorted unique ratios `k / n` with `0 <= k <= n <= n_patients`, `n > 0`.
pub fn possible_probabilities(n_patients: usize) -> Vec<f64> {
    let mut out: Vec<f64> = (1..=n_patients)
        .flat_map(|n| (0..=n).map(move |k| k as f64 / n as f64))
        .collect();
    out.sort_by(f64::total_cmp);
    out.dedup();
    out
}

/// Memoised deviance of one time point and mode.
pub struct DevianceCurve<'a, S: Solver> {
    problem: TimePointProblem<'a>,
    mode: Mode,
    solver: &'a RefCell<S>,
    memo: RefCell<HashMap<u64, f64>>,
}

impl<'a, S: Solver> DevianceCurve<'a, S> {
    /// The underlying time-point problem.
    pub fn problem(&self) -> &TimePointProblem<'a> {
        &self.problem
    }

    /// Ablation mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Full fit at `p` (not memoised).
    pub fn fit(&self, p: f64) -> Result<ProfileFit> {
        let mut solver = self
            .solver
            .try_borrow_mut()
            .map_err(|_| Error::Internal("solver is already in use".to_string()))?;
        self.problem.solve(p, self.mode, &mut *solver)
    }

    /// Twice the profiled NLL at `p`.
    pub fn evaluate(&self, p: f64) -> Result<f64> {
        if let Some(&v) = self.memo.borrow().get(&p.to_bits()) {
            return Ok(v);
        }
        let v = self.fit(p)?.twice_nll;
        self.memo.borrow_mut().insert(p.to_bits(), v);
        Ok(v)
    }

    /// Number of distinct probabilities evaluated so far.
    pub fn evaluations(&self) -> usize {
        self.memo.borrow().len()
    }
}

struct ScalarProblem<F>(F);

impl<F: Fn(f64) -> Result<f64>> CostFunction for ScalarProblem<F> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        (self.0)(*p).map_err(|e| argmin::core::Error::msg(e.to_string()))
    }
}

/// Confidence intervals at one level, one per time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBand {
    /// Confidence level.
    pub cl: f64,
    /// `(lower, upper)` per time point.
    pub intervals: Vec<(f64, f64)>,
}

/// Result of a sweep over time points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodBand {
    /// Time points.
    pub times: Vec<f64>,
    /// Best-fit probability per time point.
    pub best_probabilities: Vec<f64>,
    /// One band per requested confidence level, in request order.
    pub bands: Vec<ConfidenceBand>,
}

impl LikelihoodBand {
    /// Band at confidence level `cl`.
    pub fn band(&self, cl: f64) -> Option<&ConfidenceBand> {
        self.bands.iter().find(|b| b.cl == cl)
    }
}

/// Kaplan-Meier likelihood over a cohort, a parameter range and a solver backend.
pub struct KaplanMeierLikelihood<S: Solver> {
    patients: Vec<Patient>,
    range: ParameterRange,
    config: LikelihoodConfig,
    solver: RefCell<S>,
}

impl<S: Solver> KaplanMeierLikelihood<S> {
    /// Validate inputs and wrap the solver.
    pub fn new(
        patients: Vec<Patient>,
        range: ParameterRange,
        config: LikelihoodConfig,
        solver: S,
    ) -> Result<Self> {
        if patients.is_empty() {
            return Err(Error::Validation("at least one patient is required".to_string()));
        }
        for (i, p) in patients.iter().enumerate() {
            p.validate().map_err(|e| Error::Validation(format!("patient {i}: {e}")))?;
        }
        config.validate()?;
        Ok(Self { patients, range, config, solver: RefCell::new(solver) })
    }

    /// The cohort.
    pub fn patients(&self) -> &[Patient] {
        &self.patients
    }

    /// The parameter range.
    pub fn range(&self) -> ParameterRange {
        self.range
    }

    /// The settings.
    pub fn config(&self) -> &LikelihoodConfig {
        &self.config
    }

    /// Deviance curve at time point `t`.
    pub fn deviance_curve(&self, t: f64, mode: Mode) -> DevianceCurve<'_, S> {
        DevianceCurve {
            problem: TimePointProblem::new(&self.patients, self.range, t, &self.config),
            mode,
            solver: &self.solver,
            memo: RefCell::new(HashMap::new()),
        }
    }

    /// Probabilities searched in patient-wise mode.
    pub fn candidate_grid(&self, curve: &DevianceCurve<'_, S>) -> Result<Vec<f64>> {
        match self.config.candidate_grid {
            CandidateGrid::Ratios => Ok(possible_probabilities(self.patients.len())),
            CandidateGrid::Achievable => curve.problem().possible_probabilities(),
        }
    }

    /// `(probability, deviance)` minimising the deviance at `t`.
    pub fn best_probability(&self, t: f64, mode: Mode) -> Result<(f64, f64)> {
        let curve = self.deviance_curve(t, mode);
        self.best_on_curve(&curve)
    }

    fn best_on_curve(&self, curve: &DevianceCurve<'_, S>) -> Result<(f64, f64)> {
        let cfg = &self.config;
        if curve.mode() == Mode::PatientWiseOnly {
            let grid = self.candidate_grid(curve)?;
            return minimize_discrete_single_minimum(
                |p| curve.evaluate(p),
                &grid,
                cfg.discrete_atol,
                cfg.discrete_rtol,
            );
        }

        let eps = cfg.endpoint_epsilon;
        let solver = BrentOpt::new(eps, 1.0 - eps).set_tolerance(f64::EPSILON.sqrt(), cfg.minimize_tolerance);
        let res = Executor::new(ScalarProblem(|p| curve.evaluate(p)), solver)
            .configure(|state| state.max_iters(cfg.max_iter))
            .run()
            .map_err(|e| {
                Error::Computation(format!(
                    "best probability at t={} failed: {e}",
                    curve.problem().time_point()
                ))
            })?;
        let state = res.state();
        let best = *state.get_best_param().ok_or_else(|| {
            Error::Computation(format!(
                "no best probability found at t={}",
                curve.problem().time_point()
            ))
        })?;
        Ok((best, state.get_best_cost()))
    }

    fn brent_root(&self, f: impl Fn(f64) -> Result<f64>, lo: f64, hi: f64, t: f64) -> Result<f64> {
        let solver = BrentRoot::new(lo, hi, self.config.root_xtol);
        let res = Executor::new(ScalarProblem(f), solver)
            .configure(|state| state.max_iters(self.config.max_iter))
            .run()
            .map_err(|e| Error::RootFinding(format!("no root in [{lo}, {hi}] at t={t}: {e}")))?;
        res.state()
            .get_best_param()
            .copied()
            .ok_or_else(|| Error::RootFinding(format!("root finder returned nothing at t={t}")))
    }

    /// Best fits and confidence intervals at every time point.
    ///
    /// `cls` are confidence levels in `(0, 1)`. In patient-wise mode a time point before
    /// the first patient time yields `(1, 1)` and one at or after the last `(0, 0)`.
    pub fn survival_probabilities_likelihood(
        &self,
        cls: &[f64],
        times: &[f64],
        mode: Mode,
    ) -> Result<LikelihoodBand> {
        let cutoffs = cls.iter().map(|&cl| chi2::deviance_cutoff(cl)).collect::<Result<Vec<_>>>()?;
        let first_time = self.patients.iter().map(|p| p.time).fold(f64::INFINITY, f64::min);
        let last_time = self.patients.iter().map(|p| p.time).fold(f64::NEG_INFINITY, f64::max);
        let eps = self.config.endpoint_epsilon;

        let mut best_probabilities = Vec::with_capacity(times.len());
        let mut intervals: Vec<Vec<(f64, f64)>> = vec![Vec::with_capacity(times.len()); cls.len()];

        for &t in times {
            let curve = self.deviance_curve(t, mode);
            let (best, deviance_min) = self.best_on_curve(&curve)?;
            best_probabilities.push(best);
            log::info!("t={t}: best probability {best:.6} ({mode}, 2nll={deviance_min:.6})");

            let patient_wise = mode == Mode::PatientWiseOnly;
            let grid = if patient_wise { self.candidate_grid(&curve)? } else { Vec::new() };

            for (k, &cutoff) in cutoffs.iter().enumerate() {
                if patient_wise && t < first_time {
                    intervals[k].push((1.0, 1.0));
                    continue;
                }
                if patient_wise && t >= last_time {
                    intervals[k].push((0.0, 0.0));
                    continue;
                }
                let objective = |p: f64| -> Result<f64> { Ok(curve.evaluate(p)? - deviance_min - cutoff) };

                let interval = if patient_wise {
                    let last = grid.len() - 1;
                    let i_best = grid.partition_point(|&v| v < best).min(last);
                    let upper = if objective(grid[last])? < 0.0 {
                        1.0
                    } else {
                        binary_search_sign_change(objective, &grid, i_best, last)?.ok_or_else(|| {
                            Error::RootFinding(format!("no upper sign change at t={t}"))
                        })?
                    };
                    let lower = if objective(grid[0])? < 0.0 {
                        0.0
                    } else {
                        binary_search_sign_change(objective, &grid, 0, i_best)?.ok_or_else(|| {
                            Error::RootFinding(format!("no lower sign change at t={t}"))
                        })?
                    };
                    (lower, upper)
                } else {
                    let lower = if objective(eps)? < 0.0 {
                        0.0
                    } else {
                        self.brent_root(objective, eps, best, t)?
                    };
                    let upper = if objective(1.0 - eps)? < 0.0 {
                        1.0
                    } else {
                        self.brent_root(objective, best, 1.0 - eps, t)?
                    };
                    (lower, upper)
                };
                log::debug!("t={t}: CL {} interval [{:.6}, {:.6}]", cls[k], interval.0, interval.1);
                intervals[k].push(interval);
            }
            log::debug!("t={t}: {} deviance evaluations", curve.evaluations());
        }

        Ok(LikelihoodBand {
            times: times.to_vec(),
            best_probabilities,
            bands: cls
                .iter()
                .zip(intervals)
                .map(|(&cl, intervals)| ConfidenceBand { cl, intervals })
                .collect(),
        })
    }
}
