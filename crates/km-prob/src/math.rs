//! Small numeric helpers shared across the likelihood code.

use km_core::{Error, Result};
use statrs::function::gamma::ln_gamma;

/// `ln(n choose k)` via `ln Γ`.
pub fn ln_choose(n: u64, k: u64) -> f64 {
    debug_assert!(k <= n);
    let n1 = (n as f64) + 1.0;
    let k1 = (k as f64) + 1.0;
    let nk1 = ((n - k) as f64) + 1.0;
    ln_gamma(n1) - ln_gamma(k1) - ln_gamma(nk1)
}

/// numpy-style closeness: `|a - b| <= atol + rtol * |b|`.
///
/// Equal infinities compare close; NaN never does.
#[inline]
pub fn isclose(a: f64, b: f64, atol: f64, rtol: f64) -> bool {
    if a == b {
        return true;
    }
    if !a.is_finite() || !b.is_finite() {
        return false;
    }
    (a - b).abs() <= atol + rtol * b.abs()
}

/// Precomputed `ln C(n, d)` for every `0 <= d <= n <= ceiling`.
///
/// Built once per patient count and shared read-only by all groups and time points.
#[derive(Debug, Clone)]
pub struct LnChooseTable {
    ceiling: usize,
    // Row-major triangle: row n starts at n * (n + 1) / 2.
    values: Vec<f64>,
}

impl LnChooseTable {
    /// Build the table up to `ceiling` (inclusive).
    pub fn new(ceiling: usize) -> Self {
        let mut values = Vec::with_capacity((ceiling + 1) * (ceiling + 2) / 2);
        for n in 0..=ceiling {
            for d in 0..=n {
                values.push(ln_choose(n as u64, d as u64));
            }
        }
        Self { ceiling, values }
    }

    /// Largest `n` covered by the table.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// `ln C(n, d)`.
    pub fn get(&self, n: usize, d: usize) -> Result<f64> {
        if n > self.ceiling || d > n {
            return Err(Error::Validation(format!(
                "ln-choose table lookup out of range: n={n}, d={d}, ceiling={}",
                self.ceiling
            )));
        }
        Ok(self.values[n * (n + 1) / 2 + d])
    }

    /// Largest absolute entry; used to size big-M constants.
    pub fn max_abs(&self) -> f64 {
        self.values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ln_choose_small_values() {
        assert_relative_eq!(ln_choose(5, 2), 10f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(ln_choose(10, 0), 0.0, epsilon = 1e-12);
        assert_relative_eq!(ln_choose(10, 10), 0.0, epsilon = 1e-12);
        assert_relative_eq!(ln_choose(7, 3), 35f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_table_matches_direct() {
        let table = LnChooseTable::new(12);
        for n in 0..=12usize {
            for d in 0..=n {
                let direct = ln_choose(n as u64, d as u64);
                assert_relative_eq!(table.get(n, d).unwrap(), direct, epsilon = 1e-12);
            }
        }
        assert!(table.get(13, 0).is_err());
        assert!(table.get(4, 5).is_err());
        assert_eq!(table.ceiling(), 12);
    }

    #[test]
    fn test_isclose_semantics() {
        assert!(isclose(1.0, 1.0 + 1e-9, 1e-8, 0.0));
        assert!(!isclose(1.0, 1.0 + 1e-6, 1e-8, 0.0));
        assert!(isclose(100.0, 100.5, 0.0, 0.01));
        assert!(isclose(f64::INFINITY, f64::INFINITY, 0.0, 0.0));
        assert!(!isclose(f64::INFINITY, 1e300, 1.0, 1.0));
        assert!(!isclose(f64::NAN, f64::NAN, 1.0, 1.0));
    }
}
