//! Probability building blocks for kmband.
//!
//! - combinatorial tables (`ln C(n, d)`) shared by every time point of a sweep
//! - Poisson negative log-likelihood and the binomial survival step
//! - chi-square quantiles for Wilks cutoffs

pub mod binomial;
pub mod chi2;
pub mod math;
pub mod poisson;

pub use math::{LnChooseTable, isclose, ln_choose};
