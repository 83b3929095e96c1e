//! Searches over a sorted grid of candidate values.
//!
//! The patient-wise deviance is piecewise constant in the candidate probability, so it is
//! minimised and inverted on the grid of achievable values instead of on a continuum.
//! Evaluations are expensive (one model solve each) and memoised.

use km_core::{Error, Result};
use km_prob::isclose;

fn strictly_less(a: f64, b: f64, atol: f64, rtol: f64) -> bool {
    a < b && !isclose(a, b, atol, rtol)
}

struct Memo<'v, F> {
    f: F,
    values: &'v [f64],
    cache: Vec<Option<f64>>,
    best: Option<(usize, f64)>,
    evaluations: usize,
}

impl<F: FnMut(f64) -> Result<f64>> Memo<'_, F> {
    fn at(&mut self, i: usize) -> Result<f64> {
        if let Some(y) = self.cache[i] {
            return Ok(y);
        }
        let raw = (self.f)(self.values[i])?;
        let y = if raw.is_nan() { f64::INFINITY } else { raw };
        self.cache[i] = Some(y);
        self.evaluations += 1;
        if self.best.is_none_or(|(_, b)| y < b) {
            self.best = Some((i, y));
        }
        Ok(y)
    }
}

/// Minimise `f` over sorted `values`, assuming a single (possibly flat) minimum.
///
/// Ternary search on indices where values within `isclose(atol, rtol)` of each other
/// count as ties. A tie is broken by probing the midpoint between the two thirds; when
/// the midpoint is no lower, all four remaining sub-windows are searched. Windows of
/// fewer than three points are scanned. NaN evaluates as `+inf`.
///
/// Returns the grid value with the lowest evaluation seen, and that evaluation.
pub fn minimize_discrete_single_minimum<F>(
    f: F,
    values: &[f64],
    atol: f64,
    rtol: f64,
) -> Result<(f64, f64)>
where
    F: FnMut(f64) -> Result<f64>,
{
    if values.is_empty() {
        return Err(Error::Validation("cannot minimise over an empty grid".to_string()));
    }
    let mut memo = Memo { f, values, cache: vec![None; values.len()], best: None, evaluations: 0 };
    let lt = |a: f64, b: f64| strictly_less(a, b, atol, rtol);

    let mut stack = vec![(0usize, values.len() - 1)];
    while let Some((lo, hi)) = stack.pop() {
        if hi < lo + 2 {
            for i in lo..=hi {
                memo.at(i)?;
            }
            continue;
        }
        let third = (hi - lo) / 3;
        let (m1, m2) = (lo + third, hi - third);
        let (f1, f2) = (memo.at(m1)?, memo.at(m2)?);
        if lt(f1, f2) {
            stack.push((lo, m2 - 1));
        } else if lt(f2, f1) {
            stack.push((m1 + 1, hi));
        } else {
            let mid = m1 + (m2 - m1) / 2;
            let fm = memo.at(mid)?;
            if lt(fm, f1) && lt(fm, f2) {
                stack.push((m1 + 1, m2 - 1));
            } else {
                let windows = [
                    (lo, m1.checked_sub(1)),
                    (m1 + 1, mid.checked_sub(1)),
                    (mid + 1, Some(m2 - 1)),
                    (m2 + 1, Some(hi)),
                ];
                for (a, b) in windows {
                    if let Some(b) = b {
                        if a <= b {
                            stack.push((a, b));
                        }
                    }
                }
            }
        }
    }

    log::debug!("discrete minimum after {} evaluations over {} values", memo.evaluations, values.len());
    match memo.best {
        Some((i, y)) => Ok((values[i], y)),
        None => Err(Error::Internal("discrete search evaluated nothing".to_string())),
    }
}

/// Bisect `values[lo..=hi]` for the point where `f` changes between `< 0` and `>= 0`.
///
/// Returns the grid value on the negative side of the crossing, or `None` when `f`
/// has the same sign at both ends.
pub fn binary_search_sign_change<F>(mut f: F, values: &[f64], lo: usize, hi: usize) -> Result<Option<f64>>
where
    F: FnMut(f64) -> Result<f64>,
{
    if lo > hi || hi >= values.len() {
        return Err(Error::Validation(format!(
            "invalid search window [{lo}, {hi}] over {} values",
            values.len()
        )));
    }
    let negative_at_lo = f(values[lo])? < 0.0;
    if negative_at_lo == (f(values[hi])? < 0.0) {
        return Ok(None);
    }
    let (mut a, mut b) = (lo, hi);
    while b - a > 1 {
        let mid = a + (b - a) / 2;
        if (f(values[mid])? < 0.0) == negative_at_lo {
            a = mid;
        } else {
            b = mid;
        }
    }
    Ok(Some(values[if negative_at_lo { a } else { b }]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCES: [(f64, f64); 5] =
        [(1e-8, 0.0), (1e-6, 1e-5), (1e-3, 1e-2), (1e-10, 1e-10), (0.1, 0.1)];

    fn grid() -> Vec<f64> {
        (0..=10_000).map(|i| i as f64 / 1000.0).collect()
    }

    fn check(f: impl Fn(f64) -> f64, expected: (f64, f64), atol: f64, rtol: f64) {
        let values = grid();
        let (x, y) = minimize_discrete_single_minimum(|v| Ok(f(v)), &values, atol, rtol).unwrap();
        assert!(isclose(y, f(x), atol, rtol), "y={y} f(x)={}", f(x));
        assert!(x >= expected.0 - atol, "x={x} below {expected:?} (atol={atol}, rtol={rtol})");
        assert!(x <= expected.1 + atol, "x={x} above {expected:?} (atol={atol}, rtol={rtol})");
        let global = values.iter().map(|&v| f(v)).fold(f64::INFINITY, f64::min);
        assert!(isclose(y, global, atol, rtol), "y={y} not close to global {global}");
    }

    fn near(x: f64, target: f64) -> bool {
        isclose(x, target, 1e-8, 1e-5)
    }

    #[test]
    fn test_plateau_middle() {
        check(|x| if (4.0..=6.0).contains(&x) { 0.0 } else { 1.0 }, (4.0, 6.0), 1e-8, 0.0);
    }

    #[test]
    fn test_plateau_at_start() {
        check(|x| if x <= 1.0 { 0.0 } else { 1.0 }, (0.0, 1.0), 1e-8, 0.0);
    }

    #[test]
    fn test_plateau_at_end() {
        check(|x| if x >= 9.0 { 0.0 } else { 1.0 }, (9.0, 10.0), 1e-8, 0.0);
    }

    #[test]
    fn test_single_point_minimum() {
        for target in [5.0, 0.0, 10.0] {
            check(|x| if near(x, target) { 0.0 } else { 1.0 }, (target, target), 1e-8, 0.0);
        }
    }

    #[test]
    fn test_all_values_equal() {
        let values = grid();
        let (x, y) = minimize_discrete_single_minimum(|_| Ok(42.0), &values, 1e-8, 0.0).unwrap();
        assert!(values.contains(&x));
        assert_eq!(y, 42.0);
    }

    #[test]
    fn test_tiny_v_finds_exact_minimum() {
        let f = |x: f64| if (4.0..=6.0).contains(&x) { 0.001 * (x - 5.0).abs() } else { 1.0 };
        check(f, (5.0, 5.0), 1e-8, 0.0);
    }

    #[test]
    fn test_near_flat_plateau_left() {
        for (atol, rtol) in TOLERANCES {
            let f = move |x: f64| {
                if x <= 2.0 {
                    0.0
                } else if x <= 4.0 {
                    0.5 * atol
                } else {
                    1.0
                }
            };
            check(f, (0.0, 4.0), atol, rtol);
        }
    }

    #[test]
    fn test_near_flat_plateau_right() {
        for (atol, rtol) in TOLERANCES {
            let f = move |x: f64| {
                if x >= 8.0 {
                    0.0
                } else if x > 6.0 {
                    0.5 * atol
                } else {
                    1.0
                }
            };
            check(f, (6.0, 10.0), atol, rtol);
        }
    }

    #[test]
    fn test_wavy_central_plateau() {
        for (atol, rtol) in TOLERANCES {
            let f = move |x: f64| {
                let noise = (x * 10.0).sin() * 0.1 * atol;
                if (4.0..=6.0).contains(&x) {
                    noise
                } else if x < 4.0 {
                    (4.0 - x) * 2.0 * atol + noise
                } else {
                    (x - 6.0) * 2.0 * atol + noise
                }
            };
            check(f, (4.0, 6.0), atol, rtol);
        }
    }

    #[test]
    fn test_wide_plateau_with_exact_core() {
        for (atol, rtol) in TOLERANCES {
            let f = move |x: f64| {
                if (4.5..=5.5).contains(&x) {
                    0.0
                } else if (3.0..=7.0).contains(&x) {
                    0.5 * atol
                } else {
                    1.0
                }
            };
            check(f, (3.0, 7.0), atol, rtol);
        }
    }

    #[test]
    fn test_evaluations_are_memoised() {
        let values = grid();
        let mut calls = 0usize;
        let (x, _) = minimize_discrete_single_minimum(
            |v| {
                calls += 1;
                Ok((v - 7.3).abs())
            },
            &values,
            1e-12,
            0.0,
        )
        .unwrap();
        assert!((x - 7.3).abs() < 1e-9);
        assert!(calls < 200, "{calls} evaluations");
    }

    #[test]
    fn test_nan_counts_as_infinite() {
        let values = [0.0, 1.0, 2.0, 3.0];
        let (x, y) = minimize_discrete_single_minimum(
            |v| Ok(if v == 2.0 { 0.5 } else { f64::NAN }),
            &values,
            1e-8,
            0.0,
        )
        .unwrap();
        assert_eq!((x, y), (2.0, 0.5));
    }

    #[test]
    fn test_empty_grid_is_rejected() {
        assert!(minimize_discrete_single_minimum(|v| Ok(v), &[], 1e-8, 0.0).is_err());
    }

    #[test]
    fn test_sign_change_upward() {
        let values: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        // Negative up to 0.6 inclusive.
        let f = |p: f64| Ok(if p <= 0.65 { -1.0 } else { 1.0 });
        assert_eq!(binary_search_sign_change(f, &values, 2, 10).unwrap(), Some(0.6));
    }

    #[test]
    fn test_sign_change_downward() {
        let values: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        // Negative from 0.3 inclusive.
        let f = |p: f64| Ok(if p >= 0.25 { -1.0 } else { 2.0 });
        assert_eq!(binary_search_sign_change(f, &values, 0, 7).unwrap(), Some(0.3));
    }

    #[test]
    fn test_no_sign_change() {
        let values = [0.1, 0.2, 0.3];
        assert_eq!(binary_search_sign_change(|_| Ok(1.0), &values, 0, 2).unwrap(), None);
        assert!(binary_search_sign_change(|_| Ok(1.0), &values, 2, 1).is_err());
        assert!(binary_search_sign_change(|_| Ok(1.0), &values, 0, 3).is_err());
    }
}
