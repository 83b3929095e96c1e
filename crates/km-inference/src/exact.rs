//! Exact solver for the patient-selection model.
//!
//! The objective of the selection model depends on the selected patients only through
//! how many are picked from each pool: the untracked patients, each censoring group and
//! each death group. Within a pool the cheapest free patients are always the best pick.
//! Enumerating the per-pool counts therefore solves the model exactly; the binomial term
//! for a given count vector is the closed profile of [`crate::penalty::binomial_profile`].
//!
//! Only constraints with a single variable are read (they are folded into bounds); the
//! multi-variable constraints are the structural ones described by the model's
//! [`SelectionStructure`] and are satisfied by construction of the returned point.

use crate::config::ExactSolverConfig;
use crate::km::at_risk_counts;
use crate::model::{Constraint, Model, PatientSlot, SelectionStructure, Sense, VarId, VarKind};
use crate::penalty::{BinomialProfile, GroupCounts, binomial_profile};
use crate::solver::{SolveStatus, Solver, SolverOutput, SolverParams, TIME_LIMIT};
use km_core::{Error, Result};
use km_prob::LnChooseTable;
use km_prob::binomial::survival_step_nll;
use std::time::Instant;

const FEAS_TOL: f64 = 1e-9;

/// Advance `counts` to the next vector in `[0, limits]` (odometer order).
/// Returns `false` after the last vector.
pub(crate) fn next_combination(counts: &mut [usize], limits: &[usize]) -> bool {
    for (c, &lim) in counts.iter_mut().zip(limits) {
        if *c < lim {
            *c += 1;
            return true;
        }
        *c = 0;
    }
    false
}

/// Patients of one pool, split by what their bounds allow.
#[derive(Debug, Default)]
struct Pool {
    forced: Vec<usize>,
    /// Free patients, cheapest first.
    free: Vec<usize>,
    /// `prefix[k]`: objective cost of the `k` cheapest free patients.
    prefix: Vec<f64>,
}

/// Enumerating solver for models built by [`crate::formulation::TimePointProblem`].
#[derive(Debug, Clone, Default)]
pub struct ExactSolver {
    config: ExactSolverConfig,
}

impl ExactSolver {
    /// Solver with the given limits.
    pub fn new(config: ExactSolverConfig) -> Self {
        Self { config }
    }
}

struct Incumbent {
    objective: f64,
    counts: Vec<usize>,
    use_binomial: bool,
    profile: BinomialProfile,
}

fn folded_bounds(model: &Model) -> (Vec<f64>, Vec<f64>) {
    let mut lb: Vec<f64> = model.vars().iter().map(|v| v.lb).collect();
    let mut ub: Vec<f64> = model.vars().iter().map(|v| v.ub).collect();
    for c in model.constraints() {
        let Constraint::Linear { expr, sense, rhs } = &c.constraint else {
            continue;
        };
        let [(var, coef)] = expr.terms.as_slice() else {
            continue;
        };
        if *coef == 0.0 {
            continue;
        }
        let v = (rhs - expr.constant) / coef;
        let sense = match (sense, *coef < 0.0) {
            (Sense::Le, true) => Sense::Ge,
            (Sense::Ge, true) => Sense::Le,
            (s, _) => *s,
        };
        let i = var.0;
        match sense {
            Sense::Eq => {
                lb[i] = lb[i].max(v);
                ub[i] = ub[i].min(v);
            }
            Sense::Le => ub[i] = ub[i].min(v),
            Sense::Ge => lb[i] = lb[i].max(v),
        }
    }
    for (i, var) in model.vars().iter().enumerate() {
        if var.kind != VarKind::Continuous {
            lb[i] = (lb[i] - FEAS_TOL).ceil();
            ub[i] = (ub[i] + FEAS_TOL).floor();
        }
    }
    (lb, ub)
}

impl Solver for ExactSolver {
    fn name(&self) -> &str {
        "exact"
    }

    fn optimize(&mut self, model: &Model, params: &SolverParams) -> Result<SolverOutput> {
        let s = model
            .structure()
            .ok_or_else(|| Error::Solver("exact solver needs a selection structure".to_string()))?;
        let started = Instant::now();
        let time_limit = params.get(TIME_LIMIT);
        let infeasible =
            || SolverOutput { status: SolveStatus::Infeasible, objective: None, values: Vec::new() };

        let (lb, ub) = folded_bounds(model);
        if lb.iter().zip(&ub).any(|(l, u)| *l > *u + FEAS_TOL) {
            return Ok(infeasible());
        }

        // Objective: only selection binaries and the binomial total may carry coefficients.
        let n = s.x.len();
        let mut x_index = vec![None; model.vars().len()];
        for (i, v) in s.x.iter().enumerate() {
            x_index[v.0] = Some(i);
        }
        let mut x_cost = vec![0.0; n];
        let mut binomial_coef = 0.0;
        for &(var, coef) in &model.objective().terms {
            if var == s.binomial_penalty {
                binomial_coef += coef;
            } else if let Some(i) = x_index.get(var.0).copied().flatten() {
                x_cost[i] += coef;
            } else {
                return Err(Error::Solver(format!(
                    "exact solver cannot handle objective term on '{}'",
                    model.var(var)?.name
                )));
            }
        }

        let n_groups = s.groups.len();
        let mut pools: Vec<Pool> = (0..1 + 2 * n_groups).map(|_| Pool::default()).collect();
        let mut fixed_cost = model.objective().constant;
        for (i, slot) in s.slots.iter().enumerate() {
            let pool = match *slot {
                PatientSlot::Untracked { .. } => 0,
                PatientSlot::Censored(g) => 1 + g,
                PatientSlot::Died(g) => 1 + n_groups + g,
            };
            let (l, u) = (lb[s.x[i].0], ub[s.x[i].0]);
            if l >= 1.0 {
                pools[pool].forced.push(i);
                fixed_cost += x_cost[i];
            } else if u >= 1.0 {
                pools[pool].free.push(i);
            }
        }
        for pool in &mut pools {
            pool.free.sort_by(|&a, &b| x_cost[a].total_cmp(&x_cost[b]));
            pool.prefix = std::iter::once(0.0)
                .chain(pool.free.iter().scan(0.0, |acc, &i| {
                    *acc += x_cost[i];
                    Some(*acc)
                }))
                .collect();
        }

        let limits: Vec<usize> = pools.iter().map(|p| p.free.len()).collect();
        let combinations = limits
            .iter()
            .try_fold(1u64, |acc, &l| acc.checked_mul(l as u64 + 1))
            .filter(|&c| c <= self.config.max_combinations)
            .ok_or_else(|| {
                Error::Solver(format!(
                    "exact enumeration exceeds {} combinations (pool sizes {:?})",
                    self.config.max_combinations, limits
                ))
            })?;
        log::debug!("exact: enumerating {combinations} count combinations");

        let bound = |v: VarId| (lb[v.0], ub[v.0]);
        let (u_lb, u_ub) = bound(s.use_binomial);
        let (km_lb, km_ub) = bound(s.km_probability);
        let (e_lb, e_ub) = bound(s.expected_probability);
        let (le_lb, le_ub) = bound(s.log_expected_probability);
        let log_target = (le_lb.max(e_lb.ln()), le_ub.min(e_ub.ln()));
        let binomial_options: Vec<bool> =
            [false, true].into_iter().filter(|&u| (u as u8 as f64) >= u_lb && (u as u8 as f64) <= u_ub).collect();
        if binomial_options.is_empty() {
            return Ok(infeasible());
        }

        let table = LnChooseTable::new(n);
        let mut counts = vec![0usize; pools.len()];
        let mut best: Option<Incumbent> = None;
        let mut timed_out = false;
        let mut visited = 0u64;

        loop {
            visited += 1;
            if visited % 1024 == 0 {
                if let Some(t) = time_limit {
                    if started.elapsed().as_secs_f64() > t {
                        timed_out = true;
                        break;
                    }
                }
            }

            let sel = |p: usize| pools[p].forced.len() + counts[p];
            let total: usize = (0..pools.len()).map(sel).sum();
            let censored: Vec<usize> = (0..n_groups).map(|g| sel(1 + g)).collect();
            let died: Vec<usize> = (0..n_groups).map(|g| sel(1 + n_groups + g)).collect();
            let at_risk = at_risk_counts(total, &censored, &died)?;
            let km: f64 = at_risk
                .iter()
                .zip(&died)
                .filter(|(n, _)| **n > 0)
                .map(|(&n, &d)| (n - d) as f64 / n as f64)
                .product();

            if km >= km_lb - FEAS_TOL && km <= km_ub + FEAS_TOL {
                let group_counts: Vec<GroupCounts> = at_risk
                    .iter()
                    .zip(&died)
                    .map(|(&a, &d)| GroupCounts { at_risk: a, died: d })
                    .collect();
                if let Some(profile) =
                    binomial_profile(&group_counts, log_target, s.log_p_bounds, &table)?
                {
                    let patient_cost: f64 =
                        fixed_cost + pools.iter().zip(&counts).map(|(p, &k)| p.prefix[k]).sum::<f64>();
                    for &u in &binomial_options {
                        let objective =
                            patient_cost + if u { binomial_coef * profile.nll } else { 0.0 };
                        if best.as_ref().is_none_or(|b| objective < b.objective) {
                            best = Some(Incumbent {
                                objective,
                                counts: counts.clone(),
                                use_binomial: u,
                                profile: profile.clone(),
                            });
                        }
                    }
                }
            }

            if !next_combination(&mut counts, &limits) {
                break;
            }
        }

        let Some(inc) = best else {
            return Ok(if timed_out {
                SolverOutput { status: SolveStatus::TimeLimit, objective: None, values: Vec::new() }
            } else {
                infeasible()
            });
        };
        let values = fill_values(model, s, &pools, &inc, &table)?;
        let objective = model.objective().evaluate(&values);
        let status = if timed_out { SolveStatus::TimeLimit } else { SolveStatus::Optimal };
        log::debug!("exact: {status} with objective {objective:.6} after {visited} combinations");
        Ok(SolverOutput { status, objective: Some(objective), values })
    }
}

fn fill_values(
    model: &Model,
    s: &SelectionStructure,
    pools: &[Pool],
    inc: &Incumbent,
    table: &LnChooseTable,
) -> Result<Vec<f64>> {
    let mut v = vec![0.0; model.vars().len()];
    let eps = s.log_zero_epsilon;
    let n_groups = s.groups.len();

    let mut selected = vec![false; s.x.len()];
    for (pool, &k) in pools.iter().zip(&inc.counts) {
        for &i in pool.forced.iter().chain(pool.free.iter().take(k)) {
            selected[i] = true;
        }
    }
    for (i, &on) in selected.iter().enumerate() {
        v[s.x[i].0] = if on { 1.0 } else { 0.0 };
    }
    let total = selected.iter().filter(|&&b| b).count();
    let alive = s
        .slots
        .iter()
        .zip(&selected)
        .filter(|(slot, on)| **on && matches!(slot, PatientSlot::Untracked { alive: true }))
        .count();
    v[s.n_total.0] = total as f64;
    v[s.n_alive.0] = alive as f64;

    let count_of = |pool: usize| pools[pool].forced.len() + inc.counts[pool];
    let censored: Vec<usize> = (0..n_groups).map(|g| count_of(1 + g)).collect();
    let died: Vec<usize> = (0..n_groups).map(|g| count_of(1 + n_groups + g)).collect();
    let at_risk = at_risk_counts(total, &censored, &died)?;

    let mut km_log = 0.0;
    for (g, h) in s.groups.iter().enumerate() {
        let (n, d) = (at_risk[g], died[g]);
        let surv = n - d;
        let log_n = (n as f64 + eps).ln();
        let log_s = (surv as f64 + eps).ln();
        let term = if n == 0 { 0.0 } else { log_s - log_n };
        km_log += term;

        v[h.n_censored.0] = censored[g] as f64;
        v[h.n_died.0] = d as f64;
        v[h.n_at_risk.0] = n as f64;
        v[h.n_survived.0] = surv as f64;
        v[h.at_risk_shifted.0] = n as f64 + eps;
        v[h.survived_shifted.0] = surv as f64 + eps;
        v[h.log_at_risk.0] = log_n;
        v[h.log_survived.0] = log_s;
        v[h.at_risk_is_zero.0] = if n == 0 { 1.0 } else { 0.0 };
        v[h.km_log_term.0] = term;

        let lp = inc.profile.log_p_survived[g];
        let p_surv = lp.exp();
        let log_p_died = (-p_surv).ln_1p();
        v[h.log_p_survived.0] = lp;
        v[h.p_survived.0] = p_surv;
        v[h.p_died.0] = 1.0 - p_surv;
        v[h.log_p_died.0] = log_p_died;
        v[h.binomial_term.0] = survival_step_nll(table, n, d, lp)?;
        for &((cn, cd), id) in &h.count_indicators {
            v[id.0] = if cn == n && cd == d { 1.0 } else { 0.0 };
        }
    }
    v[s.km_log_probability.0] = km_log;
    v[s.km_probability.0] = km_log.exp();

    let log_expected = inc.profile.log_total();
    v[s.log_expected_probability.0] = log_expected;
    v[s.expected_probability.0] = log_expected.exp();
    v[s.use_binomial.0] = if inc.use_binomial { 1.0 } else { 0.0 };
    v[s.binomial_penalty.0] = if inc.use_binomial {
        s.groups.iter().map(|h| v[h.binomial_term.0]).sum()
    } else {
        0.0
    };
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odometer_visits_every_vector() {
        let limits = [2usize, 0, 1];
        let mut c = vec![0usize; 3];
        let mut seen = vec![c.clone()];
        while next_combination(&mut c, &limits) {
            seen.push(c.clone());
        }
        assert_eq!(seen.len(), 3 * 1 * 2);
        assert_eq!(seen.last().unwrap(), &vec![2, 0, 1]);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_requires_structure() {
        let mut solver = ExactSolver::default();
        let err = solver.optimize(&Model::new("bare"), &SolverParams::new()).unwrap_err();
        assert!(matches!(err, Error::Solver(_)));
    }
}
