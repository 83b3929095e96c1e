//! Kaplan-Meier probabilities.
//!
//! [`kaplan_meier_probability`] works on group counts, which is the form the optimisation
//! model reasons about. [`kaplan_meier`] is the classical product-limit estimator on raw
//! times; the two agree whenever every patient is selected.

use km_core::{Error, Result};
use std::cmp::Ordering;

/// At-risk counts per group: `total - c[0]`, then `n[i-1] - d[i-1] - c[i]`.
pub fn at_risk_counts(
    total: usize,
    censored_counts: &[usize],
    died_counts: &[usize],
) -> Result<Vec<usize>> {
    if censored_counts.len() != died_counts.len() {
        return Err(Error::Internal(format!(
            "censored and died counts differ in length ({} vs {})",
            censored_counts.len(),
            died_counts.len()
        )));
    }
    let mut at_risk = Vec::with_capacity(censored_counts.len());
    let mut prev: Option<(usize, usize)> = None;
    for (&c, &d) in censored_counts.iter().zip(died_counts) {
        let base = match prev {
            None => Some(total),
            Some((n, d_prev)) => n.checked_sub(d_prev),
        };
        let n = base.and_then(|b| b.checked_sub(c)).ok_or_else(|| {
            Error::Validation(format!(
                "group counts exceed the total of {total} patients"
            ))
        })?;
        if d > n {
            return Err(Error::Validation(format!(
                "{d} deaths in a group with only {n} at risk"
            )));
        }
        at_risk.push(n);
        prev = Some((n, d));
    }
    Ok(at_risk)
}

/// Kaplan-Meier probability from group counts.
///
/// Each group contributes `(n - d) / n`; groups with nobody at risk contribute 1.
/// With no groups at all the probability is 1.
pub fn kaplan_meier_probability(
    total: usize,
    censored_counts: &[usize],
    died_counts: &[usize],
) -> Result<f64> {
    let at_risk = at_risk_counts(total, censored_counts, died_counts)?;
    Ok(at_risk
        .iter()
        .zip(died_counts)
        .filter(|(n, _)| **n > 0)
        .map(|(&n, &d)| (n - d) as f64 / n as f64)
        .product())
}

/// One distinct event time of the product-limit estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct KaplanMeierStep {
    /// Event time.
    pub time: f64,
    /// Number at risk just before this time.
    pub n_risk: usize,
    /// Number of deaths at this time.
    pub n_events: usize,
    /// Number of censorings at this time.
    pub n_censored: usize,
    /// S(t) just after this time.
    pub survival: f64,
}

/// Classical product-limit estimator.
///
/// `events[i]` is `true` for a death and `false` for a censoring. Returns one step per
/// distinct time with at least one death.
pub fn kaplan_meier(times: &[f64], events: &[bool]) -> Result<Vec<KaplanMeierStep>> {
    if times.len() != events.len() {
        return Err(Error::Validation(format!(
            "times and events differ in length ({} vs {})",
            times.len(),
            events.len()
        )));
    }
    if times.iter().any(|t| t.is_nan()) {
        return Err(Error::Validation("times must not contain NaN".to_string()));
    }

    let n = times.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        times[a]
            .partial_cmp(&times[b])
            .unwrap_or(Ordering::Equal)
            .then_with(|| events[b].cmp(&events[a]))
    });

    let mut steps = Vec::new();
    let mut n_risk = n;
    let mut s = 1.0_f64;
    let mut i = 0;
    while i < n {
        let t = times[order[i]];
        let (mut d, mut c) = (0usize, 0usize);
        while i < n && times[order[i]] == t {
            if events[order[i]] {
                d += 1;
            } else {
                c += 1;
            }
            i += 1;
        }
        if d > 0 {
            s *= 1.0 - d as f64 / n_risk as f64;
            steps.push(KaplanMeierStep { time: t, n_risk, n_events: d, n_censored: c, survival: s });
        }
        n_risk -= d + c;
    }
    Ok(steps)
}

/// Value of a product-limit curve at `t` (right-continuous step function).
pub fn survival_at(steps: &[KaplanMeierStep], t: f64) -> f64 {
    steps.iter().take_while(|st| st.time <= t).last().map_or(1.0, |st| st.survival)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::{group_patients, still_at_risk};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_probability_simple() {
        // 4 patients, 1 death then 1 death among the remaining 3.
        let p = kaplan_meier_probability(4, &[0, 0], &[1, 1]).unwrap();
        assert_relative_eq!(p, 0.75 * (2.0 / 3.0), epsilon = 1e-15);
    }

    #[test]
    fn test_zero_at_risk_contributes_one() {
        let p = kaplan_meier_probability(2, &[2, 0], &[0, 0]).unwrap();
        assert_eq!(p, 1.0);
        assert_eq!(kaplan_meier_probability(0, &[], &[]).unwrap(), 1.0);
        assert_eq!(kaplan_meier_probability(0, &[0], &[0]).unwrap(), 1.0);
    }

    #[test]
    fn test_all_die() {
        assert_eq!(kaplan_meier_probability(3, &[0], &[3]).unwrap(), 0.0);
    }

    #[test]
    fn test_inconsistent_counts() {
        assert!(kaplan_meier_probability(1, &[1], &[1]).is_err());
        assert!(kaplan_meier_probability(3, &[0, 1], &[1]).is_err());
    }

    #[test]
    fn test_product_limit_small() {
        let times = [1.0, 2.0, 2.0, 3.0, 4.0];
        let events = [true, true, false, false, true];
        let steps = kaplan_meier(&times, &events).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].n_risk, 5);
        assert_relative_eq!(steps[0].survival, 0.8, epsilon = 1e-15);
        assert_eq!(steps[1].n_risk, 4);
        assert_eq!(steps[1].n_censored, 1);
        assert_relative_eq!(steps[1].survival, 0.6, epsilon = 1e-15);
        assert_eq!(steps[2].n_risk, 1);
        assert_eq!(steps[2].survival, 0.0);
        assert_eq!(survival_at(&steps, 0.5), 1.0);
        assert_relative_eq!(survival_at(&steps, 3.5), 0.6, epsilon = 1e-15);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn prop_group_probability_matches_product_limit(
            raw in proptest::collection::vec((1u8..10, any::<bool>()), 1..25),
        ) {
            let times: Vec<f64> = raw.iter().map(|(t, _)| *t as f64).collect();
            let censored: Vec<bool> = raw.iter().map(|(_, c)| *c).collect();
            let events: Vec<bool> = censored.iter().map(|c| !c).collect();
            let steps = kaplan_meier(&times, &events).unwrap();

            for st in &steps {
                let t = st.time;
                let risk: Vec<bool> = times
                    .iter()
                    .zip(&censored)
                    .map(|(&ti, &c)| still_at_risk(ti, c, t))
                    .collect();
                let groups = group_patients(&times, &censored, &risk).unwrap();
                let p = kaplan_meier_probability(
                    times.len(),
                    &groups.censored_counts(),
                    &groups.died_counts(),
                )
                .unwrap();
                prop_assert!((p - st.survival).abs() < 1e-12);
            }
        }
    }
}
