use anyhow::{Context, Result};
use km_inference::{LikelihoodConfig, Patient};
use serde::Deserialize;
use std::path::Path;

/// Cohort file: either a bare patient array or an object with optional settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CohortJson {
    Wrapped {
        patients: Vec<Patient>,
        #[serde(default)]
        config: Option<LikelihoodConfig>,
    },
    Bare(Vec<Patient>),
}

#[derive(Debug, Clone)]
pub struct Cohort {
    pub patients: Vec<Patient>,
    pub config: LikelihoodConfig,
}

pub fn load_cohort(path: &Path) -> Result<Cohort> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: CohortJson = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing cohort JSON {}", path.display()))?;
    let (patients, config) = match parsed {
        CohortJson::Wrapped { patients, config } => (patients, config.unwrap_or_default()),
        CohortJson::Bare(patients) => (patients, LikelihoodConfig::default()),
    };
    for (i, p) in patients.iter().enumerate() {
        p.validate().with_context(|| format!("patient {i} in {}", path.display()))?;
    }
    tracing::debug!("loaded {} patients from {}", patients.len(), path.display());
    Ok(Cohort { patients, config })
}
