//! Algebraic optimisation model.
//!
//! A small, solver-agnostic representation of a mixed-integer model with linear,
//! indicator, exponential and logarithmic constraints and a linear objective.
//! Constraints can be removed by handle, which lets a caller keep the structural part
//! of a model and swap only a few constraints between solves.

use km_core::{Error, Result};

/// Variable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Constraint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstrId(pub usize);

/// Variable domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// 0/1 variable.
    Binary,
    /// Integer variable.
    Integer,
    /// Real variable.
    Continuous,
}

/// A decision variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Name, unique within the model by convention.
    pub name: String,
    /// Domain.
    pub kind: VarKind,
    /// Lower bound (may be `-inf`).
    pub lb: f64,
    /// Upper bound (may be `+inf`).
    pub ub: f64,
}

/// `sum(coef * var) + constant`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinExpr {
    /// Coefficients.
    pub terms: Vec<(VarId, f64)>,
    /// Constant offset.
    pub constant: f64,
}

impl LinExpr {
    /// Empty expression.
    pub fn new() -> Self {
        Self::default()
    }

    /// `coef * var`.
    pub fn term(var: VarId, coef: f64) -> Self {
        Self { terms: vec![(var, coef)], constant: 0.0 }
    }

    /// `sum(vars)`.
    pub fn sum(vars: impl IntoIterator<Item = VarId>) -> Self {
        Self { terms: vars.into_iter().map(|v| (v, 1.0)).collect(), constant: 0.0 }
    }

    /// Append `coef * var`.
    pub fn add(mut self, var: VarId, coef: f64) -> Self {
        self.terms.push((var, coef));
        self
    }

    /// Append every term of `other` scaled by `scale`.
    pub fn add_expr(mut self, other: &LinExpr, scale: f64) -> Self {
        self.terms.extend(other.terms.iter().map(|&(v, c)| (v, c * scale)));
        self.constant += other.constant * scale;
        self
    }

    /// Add a constant.
    pub fn plus(mut self, constant: f64) -> Self {
        self.constant += constant;
        self
    }

    /// Value at `values` (indexed by [`VarId`]).
    pub fn evaluate(&self, values: &[f64]) -> f64 {
        self.terms.iter().map(|&(v, c)| c * values.get(v.0).copied().unwrap_or(0.0)).sum::<f64>()
            + self.constant
    }

    /// Coefficient of `var` (summing duplicates).
    pub fn coefficient(&self, var: VarId) -> f64 {
        self.terms.iter().filter(|(v, _)| *v == var).map(|(_, c)| c).sum()
    }
}

/// Comparison sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `==`
    Eq,
}

impl Sense {
    fn violation(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Sense::Le => (lhs - rhs).max(0.0),
            Sense::Ge => (rhs - lhs).max(0.0),
            Sense::Eq => (lhs - rhs).abs(),
        }
    }
}

/// A model constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// `expr (sense) rhs`.
    Linear {
        /// Left-hand side.
        expr: LinExpr,
        /// Comparison.
        sense: Sense,
        /// Right-hand side.
        rhs: f64,
    },
    /// `indicator == active => expr (sense) rhs`.
    Indicator {
        /// Binary switch.
        indicator: VarId,
        /// Value of the switch that activates the constraint.
        active: bool,
        /// Left-hand side.
        expr: LinExpr,
        /// Comparison.
        sense: Sense,
        /// Right-hand side.
        rhs: f64,
    },
    /// `y == exp(x)`.
    Exp {
        /// Argument.
        x: VarId,
        /// Result.
        y: VarId,
    },
    /// `y == ln(x)`.
    Log {
        /// Argument.
        x: VarId,
        /// Result.
        y: VarId,
    },
}

/// A constraint with its name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedConstraint {
    /// Name for diagnostics.
    pub name: String,
    /// The constraint.
    pub constraint: Constraint,
}

/// Where a patient sits in the event structure of a time point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientSlot {
    /// Not part of any group: still at risk, or censored after the last death.
    Untracked {
        /// Alive after the time point.
        alive: bool,
    },
    /// In censoring group `g`.
    Censored(usize),
    /// In death group `g`.
    Died(usize),
}

/// Variable handles of one censoring/death group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupHandles {
    /// Selected censorings.
    pub n_censored: VarId,
    /// Selected deaths.
    pub n_died: VarId,
    /// Selected patients at risk.
    pub n_at_risk: VarId,
    /// `n_at_risk - n_died`.
    pub n_survived: VarId,
    /// `n_at_risk + eps`.
    pub at_risk_shifted: VarId,
    /// `n_survived + eps`.
    pub survived_shifted: VarId,
    /// `ln(n_at_risk + eps)`.
    pub log_at_risk: VarId,
    /// `ln(n_survived + eps)`.
    pub log_survived: VarId,
    /// 1 when nobody is at risk.
    pub at_risk_is_zero: VarId,
    /// Contribution of the group to `ln KM`.
    pub km_log_term: VarId,
    /// Per-group death probability.
    pub p_died: VarId,
    /// Per-group survival probability.
    pub p_survived: VarId,
    /// `ln p_died`.
    pub log_p_died: VarId,
    /// `ln p_survived`.
    pub log_p_survived: VarId,
    /// Binomial NLL of the group.
    pub binomial_term: VarId,
    /// One binary per admissible `(at_risk, died)` pair.
    pub count_indicators: Vec<((usize, usize), VarId)>,
}

/// Hint describing how the model encodes patient selection.
///
/// Structure-aware backends (such as [`crate::exact::ExactSolver`]) read this instead of
/// rediscovering the structure from the constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionStructure {
    /// Event slot of each patient.
    pub slots: Vec<PatientSlot>,
    /// Selection binary of each patient.
    pub x: Vec<VarId>,
    /// Number of selected patients.
    pub n_total: VarId,
    /// Number of selected patients alive after the time point.
    pub n_alive: VarId,
    /// Per-group handles.
    pub groups: Vec<GroupHandles>,
    /// `sum` of the group log terms.
    pub km_log_probability: VarId,
    /// Kaplan-Meier probability of the selection.
    pub km_probability: VarId,
    /// Probability the binomial term is evaluated at.
    pub expected_probability: VarId,
    /// `ln expected_probability`.
    pub log_expected_probability: VarId,
    /// Switch of the binomial term.
    pub use_binomial: VarId,
    /// Total binomial NLL (0 when switched off).
    pub binomial_penalty: VarId,
    /// Bounds of every `ln p` variable.
    pub log_p_bounds: (f64, f64),
    /// Shift added to counts before taking logs.
    pub log_zero_epsilon: f64,
}

/// Mixed-integer model with a linear objective to minimise.
#[derive(Debug, Clone, Default)]
pub struct Model {
    name: String,
    vars: Vec<Variable>,
    constraints: Vec<Option<NamedConstraint>>,
    /// Slots emptied by [`Model::remove`], reused by the next additions.
    free_slots: Vec<usize>,
    objective: LinExpr,
    structure: Option<SelectionStructure>,
}

impl Model {
    /// Empty model.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a variable.
    pub fn add_var(&mut self, name: impl Into<String>, kind: VarKind, lb: f64, ub: f64) -> VarId {
        let (lb, ub) = match kind {
            VarKind::Binary => (lb.max(0.0), ub.min(1.0)),
            _ => (lb, ub),
        };
        self.vars.push(Variable { name: name.into(), kind, lb, ub });
        VarId(self.vars.len() - 1)
    }

    /// Add `n` variables named `name[i]`.
    pub fn add_vars(
        &mut self,
        n: usize,
        name: &str,
        kind: VarKind,
        lb: f64,
        ub: f64,
    ) -> Vec<VarId> {
        (0..n).map(|i| self.add_var(format!("{name}[{i}]"), kind, lb, ub)).collect()
    }

    /// Add a constraint. Handles of removed constraints may be handed out again.
    pub fn add_constr(&mut self, name: impl Into<String>, constraint: Constraint) -> ConstrId {
        let entry = Some(NamedConstraint { name: name.into(), constraint });
        if let Some(slot) = self.free_slots.pop() {
            self.constraints[slot] = entry;
            return ConstrId(slot);
        }
        self.constraints.push(entry);
        ConstrId(self.constraints.len() - 1)
    }

    /// Add `expr (sense) rhs`.
    pub fn add_linear(
        &mut self,
        name: impl Into<String>,
        expr: LinExpr,
        sense: Sense,
        rhs: f64,
    ) -> ConstrId {
        self.add_constr(name, Constraint::Linear { expr, sense, rhs })
    }

    /// Remove a constraint. Removing twice is an error.
    pub fn remove(&mut self, id: ConstrId) -> Result<()> {
        match self.constraints.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free_slots.push(id.0);
                Ok(())
            }
            _ => Err(Error::Internal(format!("constraint {} is not in the model", id.0))),
        }
    }

    /// All variables, indexed by [`VarId`].
    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    /// One variable.
    pub fn var(&self, id: VarId) -> Result<&Variable> {
        self.vars
            .get(id.0)
            .ok_or_else(|| Error::Internal(format!("variable {} is not in the model", id.0)))
    }

    /// Active constraints.
    pub fn constraints(&self) -> impl Iterator<Item = &NamedConstraint> {
        self.constraints.iter().flatten()
    }

    /// Number of active constraints.
    pub fn num_constraints(&self) -> usize {
        self.constraints().count()
    }

    /// Set the objective (minimised).
    pub fn set_objective(&mut self, objective: LinExpr) {
        self.objective = objective;
    }

    /// The objective.
    pub fn objective(&self) -> &LinExpr {
        &self.objective
    }

    /// Attach the selection-structure hint.
    pub fn set_structure(&mut self, structure: SelectionStructure) {
        self.structure = Some(structure);
    }

    /// The selection-structure hint, if any.
    pub fn structure(&self) -> Option<&SelectionStructure> {
        self.structure.as_ref()
    }

    /// Largest violation of any bound or constraint at `values`, with its name.
    ///
    /// Integrality is checked for binary and integer variables. Used to audit
    /// solutions returned by a backend.
    pub fn max_violation(&self, values: &[f64]) -> (f64, String) {
        let mut worst = (0.0_f64, String::new());
        let mut note = |v: f64, name: &str| {
            if v > worst.0 || v.is_nan() {
                worst = (if v.is_nan() { f64::INFINITY } else { v }, name.to_string());
            }
        };
        let value = |id: VarId| values.get(id.0).copied().unwrap_or(f64::NAN);

        for (i, var) in self.vars.iter().enumerate() {
            let x = value(VarId(i));
            note((var.lb - x).max(0.0).max((x - var.ub).max(0.0)), &var.name);
            if var.kind != VarKind::Continuous {
                note((x - x.round()).abs(), &var.name);
            }
        }
        for c in self.constraints() {
            let v = match &c.constraint {
                Constraint::Linear { expr, sense, rhs } => sense.violation(expr.evaluate(values), *rhs),
                Constraint::Indicator { indicator, active, expr, sense, rhs } => {
                    let on = value(*indicator) > 0.5;
                    if on == *active { sense.violation(expr.evaluate(values), *rhs) } else { 0.0 }
                }
                Constraint::Exp { x, y } => (value(*y) - value(*x).exp()).abs(),
                Constraint::Log { x, y } => {
                    let (a, b) = (value(*x).ln(), value(*y));
                    if a == b { 0.0 } else { (a - b).abs() }
                }
            };
            note(v, &c.name);
        }
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_remove_constraints() {
        let mut m = Model::new("toy");
        let x = m.add_var("x", VarKind::Binary, 0.0, 1.0);
        let y = m.add_var("y", VarKind::Continuous, 0.0, 10.0);
        let c0 = m.add_linear("c0", LinExpr::term(x, 1.0).add(y, 1.0), Sense::Le, 3.0);
        let c1 = m.add_linear("c1", LinExpr::term(x, 1.0), Sense::Eq, 1.0);
        assert_eq!(m.num_constraints(), 2);
        m.remove(c1).unwrap();
        assert_eq!(m.num_constraints(), 1);
        assert!(m.remove(c1).is_err());
        m.remove(c0).unwrap();
        assert_eq!(m.num_constraints(), 0);
    }

    #[test]
    fn test_removed_slots_are_reused() {
        let mut m = Model::new("swap");
        let x = m.add_var("x", VarKind::Continuous, 0.0, 1.0);
        m.add_linear("structural", LinExpr::term(x, 1.0), Sense::Le, 1.0);
        let mut swapped = vec![m.add_linear("c", LinExpr::term(x, 1.0), Sense::Ge, 0.0)];
        for k in 0..50 {
            for id in swapped.drain(..) {
                m.remove(id).unwrap();
            }
            swapped.push(m.add_linear(format!("a{k}"), LinExpr::term(x, 1.0), Sense::Ge, 0.1));
            swapped.push(m.add_linear(format!("b{k}"), LinExpr::term(x, 1.0), Sense::Le, 0.9));
        }
        assert_eq!(m.num_constraints(), 3);
        assert_eq!(m.constraints.len(), 3);
        let names: Vec<&str> = m.constraints().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"structural") && names.contains(&"a49") && names.contains(&"b49"));
    }

    #[test]
    fn test_binary_bounds_are_clamped() {
        let mut m = Model::new("toy");
        let x = m.add_var("x", VarKind::Binary, -3.0, 7.0);
        let v = m.var(x).unwrap();
        assert_eq!((v.lb, v.ub), (0.0, 1.0));
    }

    #[test]
    fn test_violation_audit() {
        let mut m = Model::new("toy");
        let z = m.add_var("z", VarKind::Binary, 0.0, 1.0);
        let a = m.add_var("a", VarKind::Continuous, -10.0, 10.0);
        let b = m.add_var("b", VarKind::Continuous, 0.0, 100.0);
        m.add_constr("exp", Constraint::Exp { x: a, y: b });
        m.add_constr(
            "ind",
            Constraint::Indicator {
                indicator: z,
                active: true,
                expr: LinExpr::term(a, 1.0),
                sense: Sense::Eq,
                rhs: 1.0,
            },
        );
        let ok = [1.0, 1.0, 1.0f64.exp()];
        assert!(m.max_violation(&ok).0 < 1e-12);

        let bad = [1.0, 2.0, 2.0f64.exp()];
        let (v, name) = m.max_violation(&bad);
        assert!((v - 1.0).abs() < 1e-12);
        assert_eq!(name, "ind");

        let off = [0.0, 2.0, 2.0f64.exp()];
        assert!(m.max_violation(&off).0 < 1e-12);
    }

    #[test]
    fn test_linexpr_helpers() {
        let e = LinExpr::sum([VarId(0), VarId(1)]).add(VarId(0), 2.0).plus(1.5);
        assert_eq!(e.coefficient(VarId(0)), 3.0);
        assert_eq!(e.evaluate(&[1.0, 2.0]), 1.0 + 2.0 + 2.0 + 1.5);
        let f = LinExpr::new().add_expr(&e, -1.0);
        assert_eq!(f.evaluate(&[1.0, 2.0]), -6.5);
    }
}
