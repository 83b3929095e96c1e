//! Patients and the likelihood of their stratification parameter.
//!
//! Each patient carries a survival time, a censoring flag and a
//! [`ParameterLikelihood`]: the negative log-likelihood of the measured data as a
//! function of the true parameter value. The likelihood is a closed set of variants
//! so that it can be serialised, compared and evaluated at `±inf`.

use km_core::{Error, Result};
use km_prob::{isclose, poisson};
use serde::{Deserialize, Serialize};

/// Bounds of the latent denominator mean profiled out of [`ParameterLikelihood::PoissonRatio`].
pub const RATIO_DENOMINATOR_BOUNDS: (f64, f64) = (1e-8, 1e6);

fn default_rel_epsilon() -> f64 {
    1e-6
}

fn default_abs_epsilon() -> f64 {
    1e-8
}

/// Negative log-likelihood of a patient's parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterLikelihood {
    /// Parameter known exactly: NLL is 0 at `value` (within tolerance), `+inf` elsewhere.
    Fixed {
        /// The known value.
        value: f64,
        /// Relative tolerance.
        #[serde(default = "default_rel_epsilon")]
        rel_epsilon: f64,
        /// Absolute tolerance.
        #[serde(default = "default_abs_epsilon")]
        abs_epsilon: f64,
    },
    /// Poisson count whose mean is the parameter.
    PoissonCount {
        /// Observed count.
        count: u64,
    },
    /// Poisson count over a precisely known area; the parameter is the density.
    PoissonDensity {
        /// Observed count.
        count: u64,
        /// Area the count was taken over.
        area: f64,
    },
    /// Ratio of two Poisson means; the denominator mean is profiled out.
    PoissonRatio {
        /// Numerator count.
        numerator: u64,
        /// Denominator count.
        denominator: u64,
    },
}

impl ParameterLikelihood {
    /// NLL of the data given parameter value `x`. Pure and total.
    pub fn nll(&self, x: f64) -> f64 {
        match *self {
            ParameterLikelihood::Fixed { value, rel_epsilon, abs_epsilon } => {
                if isclose(x, value, abs_epsilon, rel_epsilon) { 0.0 } else { f64::INFINITY }
            }
            ParameterLikelihood::PoissonCount { count } => poisson::nll(count, x),
            ParameterLikelihood::PoissonDensity { count, area } => poisson::nll(count, x * area),
            ParameterLikelihood::PoissonRatio { numerator, denominator } => {
                poisson::ratio_profile_nll(numerator, denominator, x, RATIO_DENOMINATOR_BOUNDS)
            }
        }
    }

    /// Maximum-likelihood value of the parameter.
    pub fn observed(&self) -> f64 {
        match *self {
            ParameterLikelihood::Fixed { value, .. } => value,
            ParameterLikelihood::PoissonCount { count } => count as f64,
            ParameterLikelihood::PoissonDensity { count, area } => count as f64 / area,
            ParameterLikelihood::PoissonRatio { numerator, denominator } => {
                if denominator > 0 {
                    numerator as f64 / denominator as f64
                } else {
                    f64::INFINITY
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            ParameterLikelihood::Fixed { value, rel_epsilon, abs_epsilon } => {
                if value.is_nan() {
                    return Err(Error::Validation("fixed parameter value is NaN".to_string()));
                }
                if !(rel_epsilon >= 0.0 && abs_epsilon >= 0.0) {
                    return Err(Error::Validation(format!(
                        "fixed parameter tolerances must be >= 0, got rel={rel_epsilon} abs={abs_epsilon}"
                    )));
                }
            }
            ParameterLikelihood::PoissonDensity { area, .. } => {
                if !(area > 0.0 && area.is_finite()) {
                    return Err(Error::Validation(format!(
                        "density area must be positive and finite, got {area}"
                    )));
                }
            }
            ParameterLikelihood::PoissonCount { .. } | ParameterLikelihood::PoissonRatio { .. } => {}
        }
        Ok(())
    }
}

/// One patient of the cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Death or censoring time.
    pub time: f64,
    /// `true` when the patient left the study alive at `time`.
    pub censored: bool,
    /// Likelihood of the stratification parameter.
    pub likelihood: ParameterLikelihood,
}

impl Patient {
    /// Create a patient from an arbitrary likelihood.
    pub fn new(time: f64, censored: bool, likelihood: ParameterLikelihood) -> Self {
        Self { time, censored, likelihood }
    }

    /// Patient with an exactly known parameter and default tolerances.
    pub fn fixed(time: f64, censored: bool, value: f64) -> Self {
        Self::new(
            time,
            censored,
            ParameterLikelihood::Fixed {
                value,
                rel_epsilon: default_rel_epsilon(),
                abs_epsilon: default_abs_epsilon(),
            },
        )
    }

    /// Patient whose parameter is the mean of a Poisson count.
    pub fn from_count(time: f64, censored: bool, count: u64) -> Self {
        Self::new(time, censored, ParameterLikelihood::PoissonCount { count })
    }

    /// Patient whose parameter is a count density over a known area.
    pub fn from_poisson_density(time: f64, censored: bool, count: u64, area: f64) -> Result<Self> {
        let patient = Self::new(time, censored, ParameterLikelihood::PoissonDensity { count, area });
        patient.validate()?;
        Ok(patient)
    }

    /// Patient whose parameter is the ratio of two Poisson means.
    pub fn from_poisson_ratio(time: f64, censored: bool, numerator: u64, denominator: u64) -> Self {
        Self::new(time, censored, ParameterLikelihood::PoissonRatio { numerator, denominator })
    }

    /// Maximum-likelihood value of the parameter.
    pub fn observed_parameter(&self) -> f64 {
        self.likelihood.observed()
    }

    /// NLL of this patient's data at parameter value `x`.
    pub fn parameter_nll(&self, x: f64) -> f64 {
        self.likelihood.nll(x)
    }

    /// Check the time and likelihood settings.
    pub fn validate(&self) -> Result<()> {
        if self.time.is_nan() {
            return Err(Error::Validation("patient time is NaN".to_string()));
        }
        self.likelihood.validate()
    }
}
