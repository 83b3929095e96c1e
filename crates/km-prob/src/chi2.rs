//! Chi-square cutoffs for likelihood-ratio intervals.

use km_core::{Error, Result};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Quantile of the chi-square distribution: `chi2.ppf(cl, dof)`.
pub fn quantile(cl: f64, dof: f64) -> Result<f64> {
    if !(cl > 0.0 && cl < 1.0) {
        return Err(Error::Validation(format!("confidence level must be in (0, 1), got {cl}")));
    }
    let dist = ChiSquared::new(dof)
        .map_err(|e| Error::Validation(format!("invalid chi-square dof {dof}: {e}")))?;
    Ok(dist.inverse_cdf(cl))
}

/// Deviance cutoff for a one-parameter interval at confidence level `cl` (Wilks).
pub fn deviance_cutoff(cl: f64) -> Result<f64> {
    quantile(cl, 1.0)
}
