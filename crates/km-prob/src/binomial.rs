//! Binomial survival steps in log space.

use crate::math::LnChooseTable;
use km_core::{Error, Result};

/// `-ln Binom(survived; at_risk, exp(log_p))` with `survived = at_risk - died`.
///
/// `log_p` is the log of the per-step survival probability. Terms whose count is zero are
/// skipped, so `log_p = 0` with no deaths (or `-inf` with no survivors) stays finite.
pub fn survival_step_nll(
    table: &LnChooseTable,
    at_risk: usize,
    died: usize,
    log_p: f64,
) -> Result<f64> {
    if log_p.is_nan() || log_p > 0.0 {
        return Err(Error::Validation(format!("log survival probability must be <= 0, got {log_p}")));
    }
    let ln_c = table.get(at_risk, died)?;
    let survived = (at_risk - died) as f64;
    let mut nll = -ln_c;
    if died > 0 {
        nll -= died as f64 * (-log_p.exp()).ln_1p();
    }
    if survived > 0.0 {
        nll -= survived * log_p;
    }
    Ok(nll)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_matches_direct_pmf() {
        // 2 survivors of 4 at p = 0.5: Binom = 6 / 16.
        let table = LnChooseTable::new(4);
        let nll = survival_step_nll(&table, 4, 2, 0.5f64.ln()).unwrap();
        assert_relative_eq!(nll, -(6.0f64 / 16.0).ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_probabilities_stay_finite() {
        let table = LnChooseTable::new(5);
        assert_eq!(survival_step_nll(&table, 5, 0, 0.0).unwrap(), 0.0);
        assert_eq!(survival_step_nll(&table, 5, 5, f64::NEG_INFINITY).unwrap(), 0.0);
        assert!(survival_step_nll(&table, 5, 1, 0.0).unwrap().is_infinite());
    }

    #[test]
    fn test_invalid_inputs() {
        let table = LnChooseTable::new(4);
        assert!(survival_step_nll(&table, 3, 4, -0.5).is_err());
        assert!(survival_step_nll(&table, 9, 1, -0.5).is_err());
        assert!(survival_step_nll(&table, 4, 1, 0.1).is_err());
        assert!(survival_step_nll(&table, 4, 1, f64::NAN).is_err());
    }

    #[test]
    fn test_minimum_at_observed_fraction() {
        // 1 death of 4: the MLE of the survival probability is 0.75.
        let table = LnChooseTable::new(4);
        let at = survival_step_nll(&table, 4, 1, 0.75f64.ln()).unwrap();
        assert!(survival_step_nll(&table, 4, 1, 0.5f64.ln()).unwrap() > at);
        assert!(survival_step_nll(&table, 4, 1, 0.9f64.ln()).unwrap() > at);
    }
}
