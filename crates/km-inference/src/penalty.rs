//! Penalties entering the deviance.
//!
//! - the patient-wise penalty: the NLL cost of moving one patient across the
//!   boundary of the parameter range
//! - the binomial penalty: the NLL of the deaths in each group given per-group
//!   survival probabilities whose product is the candidate probability, profiled
//!   over those per-group probabilities

use crate::patient::Patient;
use km_core::{Error, Result};
use km_prob::LnChooseTable;
use km_prob::binomial::survival_step_nll;
use serde::{Deserialize, Serialize};

/// Half-open parameter range `[min, max)` defining the stratum of interest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    /// Lower edge (finite or `-inf`).
    pub min: f64,
    /// Upper edge (finite or `+inf`).
    pub max: f64,
}

impl ParameterRange {
    /// Validated range.
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if min.is_nan() || max.is_nan() {
            return Err(Error::Validation("parameter range must not contain NaN".to_string()));
        }
        if min == f64::INFINITY {
            return Err(Error::Validation("parameter_min must be finite or -inf".to_string()));
        }
        if max == f64::NEG_INFINITY {
            return Err(Error::Validation("parameter_max must be finite or +inf".to_string()));
        }
        if min >= max {
            return Err(Error::Validation(format!(
                "parameter_min ({min}) must be smaller than parameter_max ({max})"
            )));
        }
        Ok(Self { min, max })
    }

    /// The whole real line.
    pub fn unbounded() -> Self {
        Self { min: f64::NEG_INFINITY, max: f64::INFINITY }
    }

    /// `min <= x < max`.
    pub fn contains(&self, x: f64) -> bool {
        self.min <= x && x < self.max
    }
}

/// NLL penalty for counting `patient` as inside `range`.
///
/// `sign * (nll(observed) - min(nll(min), nll(max)))` with `sign = +1` when the observed
/// parameter is in range and `-1` otherwise; an infinite edge contributes `+inf`.
/// Negative values favour selection; `-inf` forces it and `+inf` forbids it.
pub fn patient_penalty(patient: &Patient, range: &ParameterRange) -> Result<f64> {
    let observed = patient.observed_parameter();
    let sign = if range.contains(observed) { 1.0 } else { -1.0 };
    let edge_nll = |edge: f64| if edge.is_finite() { patient.parameter_nll(edge) } else { f64::INFINITY };
    let boundary = edge_nll(range.min).min(edge_nll(range.max));
    let penalty = sign * (patient.parameter_nll(observed) - boundary);
    if penalty.is_nan() {
        return Err(Error::Computation(format!(
            "undefined patient penalty (observed parameter {observed}, time {})",
            patient.time
        )));
    }
    Ok(penalty)
}

/// At-risk and death counts of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCounts {
    /// Number at risk.
    pub at_risk: usize,
    /// Number dying.
    pub died: usize,
}

impl GroupCounts {
    fn survived(&self) -> f64 {
        (self.at_risk - self.died) as f64
    }
}

/// Profiled per-group survival probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct BinomialProfile {
    /// `ln p_g` per group.
    pub log_p_survived: Vec<f64>,
    /// `sum_g -ln Binom(d_g; n_g, 1 - p_g)` at the profiled probabilities.
    pub nll: f64,
}

impl BinomialProfile {
    /// `sum_g ln p_g`, the log of the probability the profile reproduces.
    pub fn log_total(&self) -> f64 {
        self.log_p_survived.iter().sum()
    }
}

/// Per-group `ln p` bounds used by the binomial block: `ln(eps / G / 2)` to
/// `ln(1 - eps / G / 2)`.
pub fn log_p_bounds(endpoint_epsilon: f64, n_groups: usize) -> (f64, f64) {
    let half = endpoint_epsilon / n_groups.max(1) as f64 / 2.0;
    (half.ln(), (1.0 - half).ln())
}

fn group_nll(c: &GroupCounts, log_p: f64, table: &LnChooseTable) -> Result<f64> {
    survival_step_nll(table, c.at_risk, c.died, log_p)
}

/// Sum of `ln p_g(mu)` for the Lagrange multiplier `mu`.
///
/// Groups with deaths follow `p = (s + mu) / (s + mu + d)` clamped to the bounds. Groups
/// without deaths are linear in `ln p`; at their breakpoint `mu = -s` they may sit anywhere
/// in the bounds, and `at_upper` picks which end is reported.
fn log_sum_at(groups: &[GroupCounts], mu: f64, bounds: (f64, f64), at_upper: bool) -> f64 {
    groups.iter().map(|c| log_p_at(c, mu, bounds, at_upper)).sum()
}

fn log_p_at(c: &GroupCounts, mu: f64, (lo, hi): (f64, f64), at_upper: bool) -> f64 {
    let s = c.survived();
    if c.died == 0 {
        let kink = -s;
        return if mu > kink {
            hi
        } else if mu < kink {
            lo
        } else if at_upper {
            hi
        } else {
            lo
        };
    }
    let num = s + mu;
    if num <= 0.0 {
        return lo;
    }
    let p = num / (num + c.died as f64);
    p.ln().clamp(lo, hi)
}

/// Profile the binomial NLL over per-group survival probabilities.
///
/// Minimises `sum_g -[ln C(n_g, d_g) + d_g ln(1 - p_g) + s_g ln p_g]` subject to
/// `ln p_g` in `log_p_bounds` and `sum_g ln p_g` inside `log_target`. Returns `None` when
/// the target interval cannot be reached within the per-group bounds.
///
/// The problem is separable and convex in `ln p_g`, so the minimiser is found on the
/// Lagrange dual by bisection on the multiplier.
pub fn binomial_profile(
    groups: &[GroupCounts],
    log_target: (f64, f64),
    log_p_bounds: (f64, f64),
    table: &LnChooseTable,
) -> Result<Option<BinomialProfile>> {
    let (lo, hi) = log_p_bounds;
    if !(lo <= hi) {
        return Err(Error::Validation(format!("invalid log-probability bounds ({lo}, {hi})")));
    }
    if groups.is_empty() {
        let ok = log_target.0 <= 0.0 && 0.0 <= log_target.1;
        return Ok(ok.then(|| BinomialProfile { log_p_survived: Vec::new(), nll: 0.0 }));
    }
    let g = groups.len() as f64;
    let target_lo = log_target.0.max(g * lo);
    let target_hi = log_target.1.min(g * hi);
    if target_lo > target_hi {
        return Ok(None);
    }

    // Unconstrained optimum sits at mu = 0; project it onto the target interval.
    let free_lo = log_sum_at(groups, 0.0, log_p_bounds, false);
    let free_hi = log_sum_at(groups, 0.0, log_p_bounds, true);
    let target = if free_hi < target_lo {
        target_lo
    } else if free_lo > target_hi {
        target_hi
    } else {
        free_lo.clamp(target_lo, target_hi)
    };

    let mu = solve_multiplier(groups, target, log_p_bounds);
    let at_kink =
        |c: &GroupCounts| c.died == 0 && (mu + c.survived()).abs() <= 1e-9 * (1.0 + mu.abs());
    let mut log_p: Vec<f64> = groups
        .iter()
        .map(|c| if at_kink(c) { lo } else { log_p_at(c, mu, log_p_bounds, false) })
        .collect();

    // Groups without deaths at their breakpoint absorb whatever the others leave over.
    let mut residual = target - log_p.iter().sum::<f64>();
    for (c, lp) in groups.iter().zip(log_p.iter_mut()) {
        if residual <= 0.0 {
            break;
        }
        if at_kink(c) {
            let step = residual.min(hi - *lp);
            *lp += step;
            residual -= step;
        }
    }

    let mut nll = 0.0;
    for (c, &lp) in groups.iter().zip(&log_p) {
        nll += group_nll(c, lp, table)?;
    }
    Ok(Some(BinomialProfile { log_p_survived: log_p, nll }))
}

fn solve_multiplier(groups: &[GroupCounts], target: f64, bounds: (f64, f64)) -> f64 {
    let q = bounds.1.exp();
    let odds = q / (1.0 - q).max(f64::MIN_POSITIVE);
    let max_s = groups.iter().map(GroupCounts::survived).fold(0.0, f64::max);
    let max_d = groups.iter().map(|c| c.died as f64).fold(0.0, f64::max);
    // Below mu_lo every group sits at the lower bound, above mu_hi at the upper one.
    let mut mu_lo = -max_s - 1.0;
    let mut mu_hi = (max_d * odds + 1.0).min(f64::MAX / 4.0);

    for _ in 0..400 {
        let mid = 0.5 * (mu_lo + mu_hi);
        if log_sum_at(groups, mid, bounds, true) < target {
            mu_lo = mid;
        } else if log_sum_at(groups, mid, bounds, false) > target {
            mu_hi = mid;
        } else {
            return mid;
        }
        if mu_hi - mu_lo <= 1e-14 * (1.0 + mid.abs()) {
            break;
        }
    }
    0.5 * (mu_lo + mu_hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn counts(v: &[(usize, usize)]) -> Vec<GroupCounts> {
        v.iter().map(|&(n, d)| GroupCounts { at_risk: n, died: d }).collect()
    }

    #[test]
    fn test_range_validation() {
        assert!(ParameterRange::new(f64::NAN, 1.0).is_err());
        assert!(ParameterRange::new(f64::INFINITY, 1.0).is_err());
        assert!(ParameterRange::new(0.0, f64::NEG_INFINITY).is_err());
        assert!(ParameterRange::new(2.0, 2.0).is_err());
        let r = ParameterRange::new(f64::NEG_INFINITY, 3.0).unwrap();
        assert!(r.contains(-1e300));
        assert!(!r.contains(3.0));
        assert!(ParameterRange::unbounded().contains(0.0));
    }

    #[test]
    fn test_fixed_penalties_force_membership() {
        let r = ParameterRange::new(1.0, 2.0).unwrap();
        let inside = Patient::fixed(1.0, false, 1.5);
        let outside = Patient::fixed(1.0, false, 2.5);
        assert_eq!(patient_penalty(&inside, &r).unwrap(), f64::NEG_INFINITY);
        assert_eq!(patient_penalty(&outside, &r).unwrap(), f64::INFINITY);
        // Sitting exactly on the lower edge costs nothing either way.
        let edge = Patient::fixed(1.0, false, 1.0);
        assert_eq!(patient_penalty(&edge, &r).unwrap(), 0.0);
    }

    #[test]
    fn test_count_penalty_sign() {
        let r = ParameterRange::new(5.0, f64::INFINITY).unwrap();
        let inside = Patient::from_count(1.0, false, 9);
        let outside = Patient::from_count(1.0, false, 2);
        let p_in = patient_penalty(&inside, &r).unwrap();
        let p_out = patient_penalty(&outside, &r).unwrap();
        assert!(p_in < 0.0 && p_in.is_finite());
        assert!(p_out > 0.0 && p_out.is_finite());
        assert_relative_eq!(
            p_in,
            inside.parameter_nll(9.0) - inside.parameter_nll(5.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_profile_single_group_is_fixed() {
        let table = LnChooseTable::new(10);
        let g = counts(&[(4, 1)]);
        let bounds = log_p_bounds(1e-6, 1);
        let target = 0.6f64.ln();
        let prof = binomial_profile(&g, (target, target), bounds, &table).unwrap().unwrap();
        assert_relative_eq!(prof.log_p_survived[0], target, epsilon = 1e-10);
        let expected = -(4.0f64.ln() + 0.4f64.ln() + 3.0 * 0.6f64.ln());
        assert_relative_eq!(prof.nll, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_profile_matches_grid_two_groups() {
        let table = LnChooseTable::new(10);
        let g = counts(&[(6, 2), (3, 1)]);
        let bounds = log_p_bounds(1e-6, 2);
        let target = 0.35f64.ln();
        let prof = binomial_profile(&g, (target, target), bounds, &table).unwrap().unwrap();
        assert_relative_eq!(prof.log_total(), target, epsilon = 1e-9);

        let mut best = f64::INFINITY;
        for k in 1..20000 {
            let y0 = target * k as f64 / 20000.0;
            let y1 = target - y0;
            if y0 < bounds.0 || y0 > bounds.1 || y1 < bounds.0 || y1 > bounds.1 {
                continue;
            }
            let nll = group_nll(&g[0], y0, &table).unwrap() + group_nll(&g[1], y1, &table).unwrap();
            best = best.min(nll);
        }
        assert!(prof.nll <= best + 1e-9);
        assert_relative_eq!(prof.nll, best, epsilon = 1e-6);
    }

    #[test]
    fn test_profile_empty_group_absorbs_residual() {
        let table = LnChooseTable::new(10);
        // Second group has nobody at risk and may take any probability.
        let g = counts(&[(5, 0), (0, 0)]);
        let bounds = log_p_bounds(1e-6, 2);
        let target = 0.5f64.ln();
        let prof = binomial_profile(&g, (target, target), bounds, &table).unwrap().unwrap();
        assert_relative_eq!(prof.log_total(), target, epsilon = 1e-9);
        // Survivors want p = 1, so the empty group carries the whole drop.
        assert!(prof.log_p_survived[0] > -1e-5);
        assert!(prof.nll < 1e-4);
    }

    #[test]
    fn test_profile_interval_returns_free_optimum() {
        let table = LnChooseTable::new(10);
        let g = counts(&[(4, 2)]);
        let bounds = log_p_bounds(1e-6, 1);
        let prof = binomial_profile(&g, (1e-6f64.ln(), (1.0 - 1e-6f64).ln()), bounds, &table)
            .unwrap()
            .unwrap();
        assert_relative_eq!(prof.log_p_survived[0], 0.5f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn test_profile_unreachable_target() {
        let table = LnChooseTable::new(4);
        let g = counts(&[(2, 1)]);
        let bounds = log_p_bounds(1e-2, 1);
        let target = 1e-5f64.ln();
        assert!(binomial_profile(&g, (target, target), bounds, &table).unwrap().is_none());
    }
}
