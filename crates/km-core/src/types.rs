//! Common data types for kmband

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which terms of the likelihood enter the deviance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Binomial term plus patient-wise membership term.
    #[default]
    Full,
    /// Binomial term only; every patient keeps its observed membership.
    BinomialOnly,
    /// Membership term only; the candidate probability bounds the selected subset's
    /// Kaplan-Meier probability from one side.
    PatientWiseOnly,
}

impl Mode {
    /// `true` when the binomial term is part of the objective.
    pub fn uses_binomial(self) -> bool {
        !matches!(self, Mode::PatientWiseOnly)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Full => "full",
            Mode::BinomialOnly => "binomial_only",
            Mode::PatientWiseOnly => "patient_wise_only",
        };
        f.write_str(s)
    }
}

/// Raw ablation switches as they arrive from a caller (CLI flags, JSON config).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags {
    /// Drop the patient-wise term.
    #[serde(default)]
    pub binomial_only: bool,
    /// Drop the binomial term.
    #[serde(default)]
    pub patient_wise_only: bool,
}

impl ModeFlags {
    /// Resolve the flags into a [`Mode`]. Both flags at once is rejected.
    pub fn resolve(self) -> Result<Mode> {
        match (self.binomial_only, self.patient_wise_only) {
            (false, false) => Ok(Mode::Full),
            (true, false) => Ok(Mode::BinomialOnly),
            (false, true) => Ok(Mode::PatientWiseOnly),
            (true, true) => Err(Error::Validation(
                "binomial_only and patient_wise_only cannot both be set".to_string(),
            )),
        }
    }
}

impl TryFrom<ModeFlags> for Mode {
    type Error = Error;

    fn try_from(flags: ModeFlags) -> Result<Self> {
        flags.resolve()
    }
}
