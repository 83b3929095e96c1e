//! Nominal curves: survival curves on observed parameters, without any uncertainty.

use crate::patient::Patient;
use crate::penalty::ParameterRange;
use km_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// `[0] + sorted unique times + [last * 1.1]`.
pub fn times_for_plot(patient_times: &[f64]) -> Result<Vec<f64>> {
    if patient_times.iter().any(|t| !t.is_finite()) {
        return Err(Error::Validation("patient times must be finite".to_string()));
    }
    let mut sorted = patient_times.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    let last = *sorted
        .last()
        .ok_or_else(|| Error::Validation("no patient times to plot".to_string()))?;
    let mut out = Vec::with_capacity(sorted.len() + 2);
    out.push(0.0);
    out.extend(sorted);
    out.push(last * 1.1);
    Ok(out)
}

/// Step-function points: every time after the first appears twice, once with the
/// previous probability and once with its own.
pub fn step_points(times: &[f64], probabilities: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut x = Vec::with_capacity(2 * times.len());
    let mut y = Vec::with_capacity(2 * times.len());
    if let (Some(&t0), Some(&p0)) = (times.first(), probabilities.first()) {
        x.push(t0);
        y.push(p0);
    }
    for (w, &t) in probabilities.windows(2).zip(times.iter().skip(1)) {
        x.extend([t, t]);
        y.extend([w[0], w[1]]);
    }
    (x, y)
}

/// Survival curve of the patients whose observed parameter lies in a range.
#[derive(Debug, Clone, PartialEq)]
pub struct NominalCurve {
    range: ParameterRange,
    times: Vec<f64>,
    censored: Vec<bool>,
}

/// Serialisable evaluation of a [`NominalCurve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NominalSeries {
    /// Parameter range of the curve.
    pub range: ParameterRange,
    /// Number of patients in the range.
    pub n_patients: usize,
    /// Evaluation times.
    pub times: Vec<f64>,
    /// Survival probability at each time.
    pub survival: Vec<f64>,
}

impl NominalCurve {
    /// Keep the patients whose observed parameter is inside `range`.
    pub fn new(patients: &[Patient], range: ParameterRange) -> Self {
        let kept: Vec<&Patient> =
            patients.iter().filter(|p| range.contains(p.observed_parameter())).collect();
        Self {
            range,
            times: kept.iter().map(|p| p.time).collect(),
            censored: kept.iter().map(|p| p.censored).collect(),
        }
    }

    /// Parameter range.
    pub fn range(&self) -> ParameterRange {
        self.range
    }

    /// Number of patients in the curve.
    pub fn n_patients(&self) -> usize {
        self.times.len()
    }

    /// Default evaluation times (see [`times_for_plot`]).
    pub fn times_for_plot(&self) -> Result<Vec<f64>> {
        times_for_plot(&self.times)
    }

    /// `alive / (alive or died)` at each time.
    ///
    /// Patients censored by `t` drop out of both counts. When nobody is left the previous
    /// value is carried forward (1 at the first time).
    pub fn survival_probabilities(&self, times: &[f64]) -> Vec<f64> {
        let mut out: Vec<f64> = Vec::with_capacity(times.len());
        for &t in times {
            let mut alive = 0usize;
            let mut counted = 0usize;
            for (&time, &censored) in self.times.iter().zip(&self.censored) {
                let is_alive = time > t;
                if is_alive || !censored {
                    counted += 1;
                }
                if is_alive {
                    alive += 1;
                }
            }
            let p = if counted > 0 {
                alive as f64 / counted as f64
            } else {
                out.last().copied().unwrap_or(1.0)
            };
            out.push(p);
        }
        out
    }

    /// Step-function points of the curve at `times`.
    pub fn points_for_plot(&self, times: &[f64]) -> (Vec<f64>, Vec<f64>) {
        step_points(times, &self.survival_probabilities(times))
    }

    /// Evaluate at `times` into a serialisable record.
    pub fn series(&self, times: &[f64]) -> NominalSeries {
        NominalSeries {
            range: self.range,
            n_patients: self.n_patients(),
            times: times.to_vec(),
            survival: self.survival_probabilities(times),
        }
    }
}

/// One nominal curve per parameter band `[-inf, t1), [t1, t2), ..., [tk, inf)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StratifiedCurves {
    curves: Vec<NominalCurve>,
    all_times: Vec<f64>,
}

impl StratifiedCurves {
    /// Split the cohort at `thresholds` (any order; duplicates are rejected).
    pub fn new(patients: &[Patient], thresholds: &[f64]) -> Result<Self> {
        if thresholds.iter().any(|t| t.is_nan()) {
            return Err(Error::Validation("thresholds must not be NaN".to_string()));
        }
        let mut edges = Vec::with_capacity(thresholds.len() + 2);
        edges.push(f64::NEG_INFINITY);
        let mut sorted = thresholds.to_vec();
        sorted.sort_by(f64::total_cmp);
        edges.extend(sorted);
        edges.push(f64::INFINITY);

        let curves = edges
            .windows(2)
            .map(|w| ParameterRange::new(w[0], w[1]).map(|r| NominalCurve::new(patients, r)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { curves, all_times: patients.iter().map(|p| p.time).collect() })
    }

    /// The curves, lowest band first.
    pub fn curves(&self) -> &[NominalCurve] {
        &self.curves
    }

    /// Evaluation times covering every patient.
    pub fn times_for_plot(&self) -> Result<Vec<f64>> {
        times_for_plot(&self.all_times)
    }
}
