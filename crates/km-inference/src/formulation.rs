//! Per-time-point optimisation problem.
//!
//! A [`TimePointProblem`] owns everything that depends on the time point but not on the
//! candidate probability: risk-set flags, event groups, patient penalties, the observed
//! Kaplan-Meier probability and the structural selection model. The model is built on
//! the first solve; later solves only replace the handful of constraints that pin the
//! candidate probability and the ablation mode.

use crate::config::LikelihoodConfig;
use crate::exact::next_combination;
use crate::grouping::{self, EventGroups};
use crate::km::kaplan_meier_probability;
use crate::model::{
    ConstrId, Constraint, GroupHandles, LinExpr, Model, PatientSlot, SelectionStructure, Sense,
    VarId, VarKind,
};
use crate::patient::Patient;
use crate::penalty::{ParameterRange, log_p_bounds, patient_penalty};
use crate::solver::{
    SolveStatus, Solver, fallback_ladder, initial_params, optimize_with_fallbacks,
};
use km_core::{Error, Mode, Result};
use km_prob::LnChooseTable;
use std::cell::{OnceCell, RefCell};

/// Upper limit on count vectors visited by [`TimePointProblem::possible_probabilities`].
const MAX_ACHIEVABLE_ENUMERATION: u64 = 50_000_000;

/// Result of one profile fit at a candidate probability.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileFit {
    /// Twice the minimised NLL (binomial plus patient-wise); `+inf` when not successful.
    pub twice_nll: f64,
    /// `false` when the candidate cannot be reached (patient-wise mode only).
    pub success: bool,
    /// Final solver status.
    pub status: SolveStatus,
    /// Number of selected patients.
    pub n_total: usize,
    /// Number of selected patients alive after the time point.
    pub n_alive: usize,
    /// Binomial part of `twice_nll`.
    pub binomial_2nll: f64,
    /// Patient-wise part of `twice_nll`.
    pub patient_2nll: f64,
    /// Indices of the selected patients.
    pub selected: Vec<usize>,
}

impl ProfileFit {
    fn unreachable(status: SolveStatus) -> Self {
        Self {
            twice_nll: f64::INFINITY,
            success: false,
            status,
            n_total: 0,
            n_alive: 0,
            binomial_2nll: f64::INFINITY,
            patient_2nll: f64::INFINITY,
            selected: Vec::new(),
        }
    }
}

struct BuiltModel {
    model: Model,
    replaceable: Vec<ConstrId>,
}

/// Profile-likelihood problem at a single time point.
pub struct TimePointProblem<'a> {
    patients: &'a [Patient],
    range: ParameterRange,
    time_point: f64,
    config: &'a LikelihoodConfig,
    still_at_risk: OnceCell<Vec<bool>>,
    alive: OnceCell<Vec<bool>>,
    in_range: OnceCell<Vec<bool>>,
    groups: OnceCell<EventGroups>,
    penalties: OnceCell<Vec<f64>>,
    observed_km: OnceCell<f64>,
    ln_choose: OnceCell<LnChooseTable>,
    built: RefCell<Option<BuiltModel>>,
}

impl<'a> TimePointProblem<'a> {
    /// New problem; nothing is computed until needed.
    pub fn new(
        patients: &'a [Patient],
        range: ParameterRange,
        time_point: f64,
        config: &'a LikelihoodConfig,
    ) -> Self {
        Self {
            patients,
            range,
            time_point,
            config,
            still_at_risk: OnceCell::new(),
            alive: OnceCell::new(),
            in_range: OnceCell::new(),
            groups: OnceCell::new(),
            penalties: OnceCell::new(),
            observed_km: OnceCell::new(),
            ln_choose: OnceCell::new(),
            built: RefCell::new(None),
        }
    }

    /// The time point.
    pub fn time_point(&self) -> f64 {
        self.time_point
    }

    /// Number of patients.
    pub fn n_patients(&self) -> usize {
        self.patients.len()
    }

    /// Per patient: still in the risk set at the time point.
    pub fn still_at_risk(&self) -> &[bool] {
        self.still_at_risk.get_or_init(|| {
            self.patients
                .iter()
                .map(|p| grouping::still_at_risk(p.time, p.censored, self.time_point))
                .collect()
        })
    }

    /// Per patient: alive after the time point.
    pub fn alive(&self) -> &[bool] {
        self.alive.get_or_init(|| {
            self.patients.iter().map(|p| grouping::alive(p.time, self.time_point)).collect()
        })
    }

    /// Per patient: observed parameter inside the range.
    pub fn parameter_in_range(&self) -> &[bool] {
        self.in_range.get_or_init(|| {
            self.patients.iter().map(|p| self.range.contains(p.observed_parameter())).collect()
        })
    }

    /// Censoring/death groups at the time point.
    pub fn groups(&self) -> Result<&EventGroups> {
        if let Some(g) = self.groups.get() {
            return Ok(g);
        }
        let times: Vec<f64> = self.patients.iter().map(|p| p.time).collect();
        let censored: Vec<bool> = self.patients.iter().map(|p| p.censored).collect();
        let groups = grouping::group_patients(&times, &censored, self.still_at_risk())?;
        Ok(self.groups.get_or_init(|| groups))
    }

    /// Patient-wise penalties (see [`patient_penalty`]).
    pub fn patient_penalties(&self) -> Result<&[f64]> {
        if let Some(p) = self.penalties.get() {
            return Ok(p);
        }
        let penalties = self
            .patients
            .iter()
            .map(|p| patient_penalty(p, &self.range))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.penalties.get_or_init(|| penalties))
    }

    /// Number of patients whose observed parameter is in range.
    pub fn n_total_observed(&self) -> usize {
        self.parameter_in_range().iter().filter(|&&b| b).count()
    }

    /// Number of in-range patients alive after the time point.
    pub fn n_alive_observed(&self) -> usize {
        self.alive().iter().zip(self.parameter_in_range()).filter(|(a, r)| **a && **r).count()
    }

    /// Per-group censored and died counts restricted to in-range patients.
    pub fn observed_group_counts(&self) -> Result<(Vec<usize>, Vec<usize>)> {
        Ok(self.groups()?.counts_for(self.parameter_in_range()))
    }

    /// Kaplan-Meier probability of the in-range patients.
    pub fn observed_km_probability(&self) -> Result<f64> {
        if let Some(&p) = self.observed_km.get() {
            return Ok(p);
        }
        let (c, d) = self.observed_group_counts()?;
        let p = kaplan_meier_probability(self.n_total_observed(), &c, &d)?;
        Ok(*self.observed_km.get_or_init(|| p))
    }

    fn ln_choose(&self) -> &LnChooseTable {
        self.ln_choose.get_or_init(|| LnChooseTable::new(self.patients.len()))
    }

    /// Every Kaplan-Meier probability reachable by some selection of at least one patient.
    ///
    /// Sorted ascending, without duplicates.
    pub fn possible_probabilities(&self) -> Result<Vec<f64>> {
        let groups = self.groups()?;
        let n = self.patients.len();
        let limits: Vec<usize> =
            groups.censored_counts().into_iter().chain(groups.died_counts()).collect();
        let vectors = limits
            .iter()
            .try_fold(1u64, |acc, &l| acc.checked_mul(l as u64 + 1))
            .filter(|&v| v <= MAX_ACHIEVABLE_ENUMERATION)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "too many group count combinations to enumerate at t={}",
                    self.time_point
                ))
            })?;
        log::debug!("t={}: enumerating {vectors} count vectors", self.time_point);

        let g = groups.n_groups();
        let mut counts = vec![0usize; limits.len()];
        let mut out = Vec::new();
        loop {
            let events: usize = counts.iter().sum();
            for total in events.max(1)..=n {
                out.push(kaplan_meier_probability(total, &counts[..g], &counts[g..])?);
            }
            if !next_combination(&mut counts, &limits) {
                break;
            }
        }
        out.sort_by(f64::total_cmp);
        out.dedup();
        Ok(out)
    }

    /// Run `f` on the structural model (building it first if needed).
    pub fn with_model<R>(&self, f: impl FnOnce(&Model) -> R) -> Result<R> {
        let mut built = self.built.borrow_mut();
        if built.is_none() {
            *built = Some(self.build_model()?);
        }
        match built.as_ref() {
            Some(b) => Ok(f(&b.model)),
            None => Err(Error::Internal("selection model missing after build".to_string())),
        }
    }

    fn build_model(&self) -> Result<BuiltModel> {
        let n = self.patients.len();
        let groups = self.groups()?;
        let penalties = self.patient_penalties()?;
        let alive = self.alive();
        let table = self.ln_choose();
        let eps = self.config.log_zero_epsilon;
        let n_groups = groups.n_groups();
        let c_tot = groups.censored_counts();
        let d_tot = groups.died_counts();

        let mut m = Model::new(format!("km_t{}", self.time_point));
        let x = m.add_vars(n, "x", VarKind::Binary, 0.0, 1.0);

        let mut slots: Vec<PatientSlot> =
            alive.iter().map(|&a| PatientSlot::Untracked { alive: a }).collect();
        for g in 0..n_groups {
            for &i in &groups.censored[g] {
                slots[i] = PatientSlot::Censored(g);
            }
            for &i in &groups.died[g] {
                slots[i] = PatientSlot::Died(g);
            }
        }

        let n_total = m.add_var("n_total", VarKind::Integer, 0.0, n as f64);
        m.add_linear(
            "n_total_def",
            LinExpr::term(n_total, 1.0).add_expr(&LinExpr::sum(x.iter().copied()), -1.0),
            Sense::Eq,
            0.0,
        );
        let n_alive = m.add_var("n_alive", VarKind::Integer, 0.0, n as f64);
        let alive_x = x.iter().zip(alive).filter(|(_, a)| **a).map(|(v, _)| *v);
        m.add_linear(
            "n_alive_def",
            LinExpr::term(n_alive, 1.0).add_expr(&LinExpr::sum(alive_x), -1.0),
            Sense::Eq,
            0.0,
        );

        let log_count_ub = (n as f64 + eps).ln();
        let (lp_lo, lp_hi) = log_p_bounds(self.config.endpoint_epsilon, n_groups);
        let max_log_p = lp_lo.abs().max(lp_hi.abs());

        let mut handles: Vec<GroupHandles> = Vec::with_capacity(n_groups);
        let mut prev: Option<(VarId, VarId)> = None;
        let mut removed_before = 0usize;
        for g in 0..n_groups {
            let n_max = n - removed_before - c_tot[g];
            removed_before += c_tot[g] + d_tot[g];

            let n_censored = m.add_var(format!("n_censored[{g}]"), VarKind::Integer, 0.0, c_tot[g] as f64);
            let n_died = m.add_var(format!("n_died[{g}]"), VarKind::Integer, 0.0, d_tot[g] as f64);
            let n_at_risk = m.add_var(format!("n_at_risk[{g}]"), VarKind::Integer, 0.0, n_max as f64);
            let n_survived = m.add_var(format!("n_survived[{g}]"), VarKind::Integer, 0.0, n_max as f64);
            let sum_x = |idx: &[usize]| LinExpr::sum(idx.iter().map(|&i| x[i]));
            m.add_linear(
                format!("n_censored_def[{g}]"),
                LinExpr::term(n_censored, 1.0).add_expr(&sum_x(&groups.censored[g]), -1.0),
                Sense::Eq,
                0.0,
            );
            m.add_linear(
                format!("n_died_def[{g}]"),
                LinExpr::term(n_died, 1.0).add_expr(&sum_x(&groups.died[g]), -1.0),
                Sense::Eq,
                0.0,
            );
            let at_risk_def = match prev {
                None => LinExpr::term(n_at_risk, 1.0).add(n_total, -1.0).add(n_censored, 1.0),
                Some((prev_at_risk, prev_died)) => LinExpr::term(n_at_risk, 1.0)
                    .add(prev_at_risk, -1.0)
                    .add(prev_died, 1.0)
                    .add(n_censored, 1.0),
            };
            m.add_linear(format!("n_at_risk_def[{g}]"), at_risk_def, Sense::Eq, 0.0);
            m.add_linear(
                format!("n_survived_def[{g}]"),
                LinExpr::term(n_survived, 1.0).add(n_at_risk, -1.0).add(n_died, 1.0),
                Sense::Eq,
                0.0,
            );
            prev = Some((n_at_risk, n_died));

            // ln KM term, switched off when nobody is at risk.
            let at_risk_shifted =
                m.add_var(format!("n_at_risk_shifted[{g}]"), VarKind::Continuous, eps, f64::INFINITY);
            let survived_shifted =
                m.add_var(format!("n_survived_shifted[{g}]"), VarKind::Continuous, eps, f64::INFINITY);
            m.add_linear(
                format!("n_at_risk_shift[{g}]"),
                LinExpr::term(at_risk_shifted, 1.0).add(n_at_risk, -1.0),
                Sense::Eq,
                eps,
            );
            m.add_linear(
                format!("n_survived_shift[{g}]"),
                LinExpr::term(survived_shifted, 1.0).add(n_survived, -1.0),
                Sense::Eq,
                eps,
            );
            let log_at_risk =
                m.add_var(format!("log_n_at_risk[{g}]"), VarKind::Continuous, f64::NEG_INFINITY, log_count_ub);
            let log_survived =
                m.add_var(format!("log_n_survived[{g}]"), VarKind::Continuous, f64::NEG_INFINITY, log_count_ub);
            m.add_constr(format!("log_n_at_risk_def[{g}]"), Constraint::Log { x: at_risk_shifted, y: log_at_risk });
            m.add_constr(format!("log_n_survived_def[{g}]"), Constraint::Log { x: survived_shifted, y: log_survived });
            let at_risk_is_zero = m.add_var(format!("n_at_risk_is_zero[{g}]"), VarKind::Binary, 0.0, 1.0);
            m.add_constr(
                format!("n_at_risk_zero[{g}]"),
                Constraint::Indicator {
                    indicator: at_risk_is_zero,
                    active: true,
                    expr: LinExpr::term(n_at_risk, 1.0),
                    sense: Sense::Eq,
                    rhs: 0.0,
                },
            );
            let km_log_term =
                m.add_var(format!("km_log_term[{g}]"), VarKind::Continuous, f64::NEG_INFINITY, 0.0);
            m.add_constr(
                format!("km_log_term_active[{g}]"),
                Constraint::Indicator {
                    indicator: at_risk_is_zero,
                    active: false,
                    expr: LinExpr::term(km_log_term, 1.0).add(log_survived, -1.0).add(log_at_risk, 1.0),
                    sense: Sense::Eq,
                    rhs: 0.0,
                },
            );
            m.add_constr(
                format!("km_log_term_inactive[{g}]"),
                Constraint::Indicator {
                    indicator: at_risk_is_zero,
                    active: true,
                    expr: LinExpr::term(km_log_term, 1.0),
                    sense: Sense::Eq,
                    rhs: 0.0,
                },
            );

            // Binomial term of the group, one indicator per admissible (at risk, died) pair.
            let p_died = m.add_var(format!("p_died[{g}]"), VarKind::Continuous, 0.0, 1.0);
            let p_survived = m.add_var(format!("p_survived[{g}]"), VarKind::Continuous, 0.0, 1.0);
            let log_p_died = m.add_var(format!("log_p_died[{g}]"), VarKind::Continuous, lp_lo, lp_hi);
            let log_p_survived = m.add_var(format!("log_p_survived[{g}]"), VarKind::Continuous, lp_lo, lp_hi);
            m.add_constr(format!("p_died_def[{g}]"), Constraint::Exp { x: log_p_died, y: p_died });
            m.add_constr(format!("p_survived_def[{g}]"), Constraint::Exp { x: log_p_survived, y: p_survived });
            m.add_linear(
                format!("p_sum[{g}]"),
                LinExpr::sum([p_died, p_survived]),
                Sense::Eq,
                1.0,
            );
            let binomial_term = m.add_var(format!("binomial_term[{g}]"), VarKind::Continuous, 0.0, f64::INFINITY);
            let mut count_indicators = Vec::new();
            for at_risk in 0..=n_max {
                for died in 0..=at_risk.min(d_tot[g]) {
                    let z = m.add_var(format!("z[{g},{at_risk},{died}]"), VarKind::Binary, 0.0, 1.0);
                    let on = |expr: LinExpr, rhs: f64| Constraint::Indicator {
                        indicator: z,
                        active: true,
                        expr,
                        sense: Sense::Eq,
                        rhs,
                    };
                    m.add_constr(format!("z_at_risk[{g},{at_risk},{died}]"), on(LinExpr::term(n_at_risk, 1.0), at_risk as f64));
                    m.add_constr(format!("z_died[{g},{at_risk},{died}]"), on(LinExpr::term(n_died, 1.0), died as f64));
                    let term = LinExpr::term(binomial_term, 1.0)
                        .add(log_p_died, died as f64)
                        .add(log_p_survived, (at_risk - died) as f64);
                    m.add_constr(format!("z_binomial[{g},{at_risk},{died}]"), on(term, -table.get(at_risk, died)?));
                    count_indicators.push(((at_risk, died), z));
                }
            }
            m.add_linear(
                format!("z_choice[{g}]"),
                LinExpr::sum(count_indicators.iter().map(|(_, z)| *z)),
                Sense::Eq,
                1.0,
            );

            handles.push(GroupHandles {
                n_censored,
                n_died,
                n_at_risk,
                n_survived,
                at_risk_shifted,
                survived_shifted,
                log_at_risk,
                log_survived,
                at_risk_is_zero,
                km_log_term,
                p_died,
                p_survived,
                log_p_died,
                log_p_survived,
                binomial_term,
                count_indicators,
            });
        }

        let km_log_probability =
            m.add_var("km_log_probability", VarKind::Continuous, f64::NEG_INFINITY, 0.0);
        m.add_linear(
            "km_log_probability_def",
            LinExpr::term(km_log_probability, 1.0)
                .add_expr(&LinExpr::sum(handles.iter().map(|h| h.km_log_term)), -1.0),
            Sense::Eq,
            0.0,
        );
        let km_probability = m.add_var("km_probability", VarKind::Continuous, 0.0, 1.0);
        m.add_constr("km_probability_def", Constraint::Exp { x: km_log_probability, y: km_probability });

        let endpoint = self.config.endpoint_epsilon;
        let expected_probability = m.add_var("expected_probability", VarKind::Continuous, 0.0, 1.0);
        let log_expected_probability = m.add_var(
            "log_expected_probability",
            VarKind::Continuous,
            endpoint.ln(),
            (1.0 - endpoint).ln(),
        );
        m.add_constr(
            "expected_probability_def",
            Constraint::Exp { x: log_expected_probability, y: expected_probability },
        );
        m.add_linear(
            "log_expected_probability_def",
            LinExpr::term(log_expected_probability, 1.0)
                .add_expr(&LinExpr::sum(handles.iter().map(|h| h.log_p_survived)), -1.0),
            Sense::Eq,
            0.0,
        );

        let use_binomial = m.add_var("use_binomial", VarKind::Binary, 0.0, 1.0);
        let binomial_penalty = m.add_var("binomial_penalty", VarKind::Continuous, 0.0, f64::INFINITY);
        m.add_constr(
            "binomial_penalty_off",
            Constraint::Indicator {
                indicator: use_binomial,
                active: false,
                expr: LinExpr::term(binomial_penalty, 1.0),
                sense: Sense::Eq,
                rhs: 0.0,
            },
        );
        let max_died = d_tot.iter().copied().max().unwrap_or(0).max(1) as f64;
        let big_m = 2.0
            * n_groups.max(1) as f64
            * (table.max_abs() + max_died * max_log_p + n as f64 * max_log_p);
        let terms = LinExpr::sum(handles.iter().map(|h| h.binomial_term));
        let linked = LinExpr::term(binomial_penalty, 1.0).add_expr(&terms, -1.0);
        m.add_linear("binomial_penalty_ub", linked.clone().add(use_binomial, big_m), Sense::Le, big_m);
        m.add_linear("binomial_penalty_lb", linked.add(use_binomial, -big_m), Sense::Ge, -big_m);

        // Patient-wise terms: finite penalties in the objective, infinite ones as fixings.
        let mut objective = LinExpr::term(binomial_penalty, 2.0);
        for (i, &pen) in penalties.iter().enumerate() {
            if pen == f64::NEG_INFINITY {
                m.add_linear(format!("patient_{i}_must_be_selected"), LinExpr::term(x[i], 1.0), Sense::Eq, 1.0);
            } else if pen == f64::INFINITY {
                m.add_linear(format!("patient_{i}_must_not_be_selected"), LinExpr::term(x[i], 1.0), Sense::Eq, 0.0);
            } else if pen != 0.0 {
                objective = objective.add(x[i], 2.0 * pen);
            }
        }
        m.set_objective(objective);

        m.set_structure(SelectionStructure {
            slots,
            x,
            n_total,
            n_alive,
            groups: handles,
            km_log_probability,
            km_probability,
            expected_probability,
            log_expected_probability,
            use_binomial,
            binomial_penalty,
            log_p_bounds: (lp_lo, lp_hi),
            log_zero_epsilon: eps,
        });
        log::debug!(
            "t={}: built model with {} variables and {} constraints over {} groups",
            self.time_point,
            m.vars().len(),
            m.num_constraints(),
            n_groups
        );
        Ok(BuiltModel { model: m, replaceable: Vec::new() })
    }

    fn replace_candidate_constraints(&self, built: &mut BuiltModel, p: f64, mode: Mode) -> Result<()> {
        for id in built.replaceable.drain(..) {
            built.model.remove(id)?;
        }
        let observed = self.observed_km_probability()?;
        let in_range = self.parameter_in_range();
        let m = &mut built.model;
        let s = m
            .structure()
            .cloned()
            .ok_or_else(|| Error::Internal("selection model has no structure".to_string()))?;
        let mut added = Vec::new();

        if mode.uses_binomial() {
            added.push(m.add_linear("use_binomial_on", LinExpr::term(s.use_binomial, 1.0), Sense::Eq, 1.0));
            added.push(m.add_linear(
                "expected_probability_value",
                LinExpr::term(s.expected_probability, 1.0),
                Sense::Eq,
                p,
            ));
        } else {
            let eps = self.config.endpoint_epsilon;
            added.push(m.add_linear("use_binomial_off", LinExpr::term(s.use_binomial, 1.0), Sense::Eq, 0.0));
            if p > observed {
                added.push(m.add_linear(
                    "km_probability_at_least",
                    LinExpr::term(s.km_probability, 1.0),
                    Sense::Ge,
                    p - eps,
                ));
            } else if p < observed {
                added.push(m.add_linear(
                    "km_probability_at_most",
                    LinExpr::term(s.km_probability, 1.0),
                    Sense::Le,
                    p + eps,
                ));
            }
        }

        if mode == Mode::BinomialOnly {
            for (i, &x) in s.x.iter().enumerate() {
                let (name, value) = if in_range[i] {
                    (format!("patient_{i}_observed_selected"), 1.0)
                } else {
                    (format!("patient_{i}_observed_excluded"), 0.0)
                };
                added.push(m.add_linear(name, LinExpr::term(x, 1.0), Sense::Eq, value));
            }
        }
        built.replaceable = added;
        Ok(())
    }

    /// Minimise twice the NLL at candidate probability `p`.
    pub fn solve<S: Solver + ?Sized>(&self, p: f64, mode: Mode, solver: &mut S) -> Result<ProfileFit> {
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::Validation(format!("probability {p} is outside [0, 1]")));
        }
        if mode.uses_binomial() && (p == 0.0 || p == 1.0) {
            return Err(Error::Validation(format!(
                "probability {p} is not allowed in {mode} mode; use a value strictly inside (0, 1)"
            )));
        }

        let mut slot = self.built.borrow_mut();
        if slot.is_none() {
            *slot = Some(self.build_model()?);
        }
        let built = slot
            .as_mut()
            .ok_or_else(|| Error::Internal("selection model missing after build".to_string()))?;
        self.replace_candidate_constraints(built, p, mode)?;

        let cfg = self.config;
        let initial = initial_params(
            mode,
            cfg.mip_gap,
            cfg.mip_gap_abs,
            cfg.time_limit,
            cfg.threads,
            cfg.mip_focus,
        );
        let ladder = fallback_ladder(mode, &initial);
        let out = optimize_with_fallbacks(solver, &built.model, &initial, &ladder)?;

        if out.status == SolveStatus::Infeasible {
            if mode == Mode::PatientWiseOnly {
                log::debug!("t={}: p={p} unreachable in {mode} mode", self.time_point);
                return Ok(ProfileFit::unreachable(out.status));
            }
            return Err(Error::Solver(format!(
                "model '{}' is infeasible at p={p} in {mode} mode",
                built.model.name()
            )));
        }

        let s = built
            .model
            .structure()
            .ok_or_else(|| Error::Internal("selection model has no structure".to_string()))?;
        let value = |v: VarId| {
            out.values
                .get(v.0)
                .copied()
                .ok_or_else(|| Error::Solver(format!("solver returned no value for variable {}", v.0)))
        };
        let twice_nll = out
            .objective
            .ok_or_else(|| Error::Solver("optimal status without an objective value".to_string()))?;
        let penalties = self.patient_penalties()?;
        let mut selected = Vec::new();
        let mut patient_2nll = 0.0;
        for (i, &xv) in s.x.iter().enumerate() {
            if value(xv)? > 0.5 {
                selected.push(i);
                if penalties[i].is_finite() {
                    patient_2nll += 2.0 * penalties[i];
                }
            }
        }
        let fit = ProfileFit {
            twice_nll,
            success: true,
            status: out.status,
            n_total: value(s.n_total)?.round() as usize,
            n_alive: value(s.n_alive)?.round() as usize,
            binomial_2nll: 2.0 * value(s.binomial_penalty)?,
            patient_2nll,
            selected,
        };
        log::debug!(
            "t={}: p={p:.6} {mode}: 2nll={:.6} (binomial {:.6}, patients {:.6}), n_total={}",
            self.time_point,
            fit.twice_nll,
            fit.binomial_2nll,
            fit.patient_2nll,
            fit.n_total
        );
        Ok(fit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exact::ExactSolver;
    use approx::assert_relative_eq;

    fn cohort() -> Vec<Patient> {
        vec![
            Patient::from_count(1.0, false, 3),
            Patient::from_count(2.0, true, 8),
            Patient::from_count(3.0, false, 6),
            Patient::from_count(4.0, false, 2),
            Patient::from_count(5.0, true, 9),
            Patient::from_count(6.0, false, 7),
        ]
    }

    fn range() -> ParameterRange {
        ParameterRange::new(5.0, f64::INFINITY).unwrap()
    }

    #[test]
    fn test_observed_quantities() {
        let patients = cohort();
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, range(), 3.5, &cfg);
        assert_eq!(prob.still_at_risk(), &[false, false, false, true, true, true]);
        assert_eq!(prob.alive(), &[false, false, false, true, true, true]);
        assert_eq!(prob.parameter_in_range(), &[false, true, true, false, true, true]);
        assert_eq!(prob.n_total_observed(), 4);
        assert_eq!(prob.n_alive_observed(), 2);
        let groups = prob.groups().unwrap();
        assert_eq!(groups.censored_counts(), vec![0, 1]);
        assert_eq!(groups.died_counts(), vec![1, 1]);
        // In range: censored at 2, died at 3, two alive. KM = 2/3.
        assert_relative_eq!(prob.observed_km_probability().unwrap(), 2.0 / 3.0, epsilon = 1e-15);
    }

    #[test]
    fn test_possible_probabilities_small() {
        let patients = vec![
            Patient::fixed(1.0, false, 1.0),
            Patient::fixed(2.0, false, 1.0),
            Patient::fixed(3.0, false, 1.0),
        ];
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, ParameterRange::unbounded(), 1.5, &cfg);
        let probs = prob.possible_probabilities().unwrap();
        assert_eq!(probs, vec![0.0, 0.5, 2.0 / 3.0, 1.0]);
    }

    #[test]
    fn test_probability_validation() {
        let patients = cohort();
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, range(), 3.5, &cfg);
        let mut solver = ExactSolver::default();
        assert!(matches!(prob.solve(1.2, Mode::Full, &mut solver), Err(Error::Validation(_))));
        assert!(matches!(prob.solve(f64::NAN, Mode::Full, &mut solver), Err(Error::Validation(_))));
        assert!(matches!(prob.solve(0.0, Mode::BinomialOnly, &mut solver), Err(Error::Validation(_))));
        assert!(matches!(prob.solve(1.0, Mode::Full, &mut solver), Err(Error::Validation(_))));
        assert!(prob.solve(1.0, Mode::PatientWiseOnly, &mut solver).is_ok());
    }

    #[test]
    fn test_patient_wise_observed_probability_costs_nothing() {
        let patients = cohort();
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, range(), 3.5, &cfg);
        let mut solver = ExactSolver::default();
        let fit = prob.solve(2.0 / 3.0, Mode::PatientWiseOnly, &mut solver).unwrap();
        assert!(fit.success);
        assert!(fit.twice_nll <= 1e-9);
        assert_eq!(fit.binomial_2nll, 0.0);
    }

    #[test]
    fn test_patient_wise_unreachable_probability() {
        // Fixed parameters: every membership is forced, nothing can move the curve.
        let patients = vec![
            Patient::fixed(1.0, false, 1.0),
            Patient::fixed(2.0, false, 1.0),
            Patient::fixed(3.0, false, 1.0),
        ];
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, ParameterRange::unbounded(), 1.5, &cfg);
        let mut solver = ExactSolver::default();
        let fit = prob.solve(0.2, Mode::PatientWiseOnly, &mut solver).unwrap();
        assert!(!fit.success);
        assert_eq!(fit.twice_nll, f64::INFINITY);
    }

    #[test]
    fn test_solution_satisfies_model() {
        let patients = cohort();
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, range(), 3.5, &cfg);
        let mut solver = ExactSolver::default();
        for (p, mode) in [(0.4, Mode::Full), (0.8, Mode::BinomialOnly), (0.3, Mode::PatientWiseOnly)] {
            prob.solve(p, mode, &mut solver).unwrap();
            let out = prob
                .with_model(|m| solver.optimize(m, &crate::solver::SolverParams::new()))
                .unwrap()
                .unwrap();
            assert_eq!(out.status, SolveStatus::Optimal);
            let (violation, name) = prob.with_model(|m| m.max_violation(&out.values)).unwrap();
            assert!(violation < 1e-6, "{mode}: {name} violated by {violation}");
        }
    }

    #[test]
    fn test_binomial_only_keeps_observed_selection() {
        let patients = cohort();
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, range(), 3.5, &cfg);
        let mut solver = ExactSolver::default();
        let fit = prob.solve(0.5, Mode::BinomialOnly, &mut solver).unwrap();
        assert_eq!(fit.selected, vec![1, 2, 4, 5]);
        assert_eq!(fit.n_total, 4);
        assert_eq!(fit.n_alive, 2);
        assert!(fit.binomial_2nll > 0.0);
    }

    #[test]
    fn test_model_is_built_once() {
        let patients = cohort();
        let cfg = LikelihoodConfig::default();
        let prob = TimePointProblem::new(&patients, range(), 3.5, &cfg);
        let mut solver = ExactSolver::default();
        prob.solve(0.5, Mode::Full, &mut solver).unwrap();
        let first = prob.with_model(|m| (m.vars().len(), m.num_constraints())).unwrap();
        prob.solve(0.6, Mode::Full, &mut solver).unwrap();
        prob.solve(0.7, Mode::Full, &mut solver).unwrap();
        let later = prob.with_model(|m| (m.vars().len(), m.num_constraints())).unwrap();
        assert_eq!(first, later);
    }
}
