//! Configuration for the likelihood sweep and the shipped solver.

use km_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Which probabilities the discrete (patient-wise) sweep scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateGrid {
    /// Every ratio `k / n` with `0 <= k <= n <= N`, `n > 0`.
    #[default]
    Ratios,
    /// Only the Kaplan-Meier values reachable from the event groups at the time point.
    Achievable,
}

/// Settings shared by every time point of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfig {
    /// Distance kept from 0 and 1 by the continuous search and the log-probability bounds.
    pub endpoint_epsilon: f64,
    /// Added to counts before taking logs in the Kaplan-Meier block of the model.
    pub log_zero_epsilon: f64,
    /// Relative optimality gap passed to the solver.
    pub mip_gap: f64,
    /// Absolute optimality gap passed to the solver.
    pub mip_gap_abs: f64,
    /// Wall-clock budget per solve, in seconds.
    pub time_limit: Option<f64>,
    /// Solver thread count.
    pub threads: Option<u32>,
    /// Solver search focus (0-3).
    pub mip_focus: Option<u8>,
    /// Tolerance of the bounded Brent minimisation.
    pub minimize_tolerance: f64,
    /// Tolerance of the Brent root search.
    pub root_xtol: f64,
    /// Iteration cap for Brent minimisation and root finding.
    pub max_iter: u64,
    /// Absolute tie tolerance of the discrete minimiser.
    pub discrete_atol: f64,
    /// Relative tie tolerance of the discrete minimiser.
    pub discrete_rtol: f64,
    /// Candidate grid for the patient-wise sweep.
    pub candidate_grid: CandidateGrid,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            endpoint_epsilon: 1e-6,
            log_zero_epsilon: 1e-10,
            mip_gap: 1e-4,
            mip_gap_abs: 1e-7,
            time_limit: None,
            threads: None,
            mip_focus: None,
            minimize_tolerance: 1e-5,
            root_xtol: 1e-6,
            max_iter: 500,
            discrete_atol: 1e-8,
            discrete_rtol: 0.0,
            candidate_grid: CandidateGrid::Ratios,
        }
    }
}

impl LikelihoodConfig {
    /// Reject settings that would make the sweep ill-defined.
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint_epsilon > 0.0 && self.endpoint_epsilon < 0.5) {
            return Err(Error::Validation(format!(
                "endpoint_epsilon must be in (0, 0.5), got {}",
                self.endpoint_epsilon
            )));
        }
        if !(self.log_zero_epsilon > 0.0 && self.log_zero_epsilon.is_finite()) {
            return Err(Error::Validation(format!(
                "log_zero_epsilon must be positive, got {}",
                self.log_zero_epsilon
            )));
        }
        for (name, v) in [
            ("mip_gap", self.mip_gap),
            ("mip_gap_abs", self.mip_gap_abs),
            ("discrete_atol", self.discrete_atol),
            ("discrete_rtol", self.discrete_rtol),
        ] {
            if !(v >= 0.0 && v.is_finite()) {
                return Err(Error::Validation(format!("{name} must be >= 0, got {v}")));
            }
        }
        for (name, v) in [
            ("minimize_tolerance", self.minimize_tolerance),
            ("root_xtol", self.root_xtol),
        ] {
            if !(v > 0.0 && v.is_finite()) {
                return Err(Error::Validation(format!("{name} must be > 0, got {v}")));
            }
        }
        if let Some(t) = self.time_limit {
            if !(t > 0.0) {
                return Err(Error::Validation(format!("time_limit must be > 0, got {t}")));
            }
        }
        if let Some(f) = self.mip_focus {
            if f > 3 {
                return Err(Error::Validation(format!("mip_focus must be in 0..=3, got {f}")));
            }
        }
        if self.max_iter == 0 {
            return Err(Error::Validation("max_iter must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Limits of [`crate::ExactSolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExactSolverConfig {
    /// Largest number of count combinations enumerated per solve.
    pub max_combinations: u64,
}

impl Default for ExactSolverConfig {
    fn default() -> Self {
        Self { max_combinations: 2_000_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        LikelihoodConfig::default().validate().unwrap();
        assert_eq!(ExactSolverConfig::default().max_combinations, 2_000_000);
    }

    #[test]
    fn test_rejects_bad_epsilon() {
        let cfg = LikelihoodConfig { endpoint_epsilon: 0.0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = LikelihoodConfig { time_limit: Some(-1.0), ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = LikelihoodConfig { mip_focus: Some(7), ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: LikelihoodConfig =
            serde_json::from_str(r#"{"time_limit": 30.0, "candidate_grid": "achievable"}"#)
                .unwrap();
        assert_eq!(cfg.time_limit, Some(30.0));
        assert_eq!(cfg.candidate_grid, CandidateGrid::Achievable);
        assert_eq!(cfg.endpoint_epsilon, 1e-6);
    }
}
