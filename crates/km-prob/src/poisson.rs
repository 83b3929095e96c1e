//! Poisson negative log-likelihood.

use statrs::function::gamma::ln_gamma;

/// `-ln P(k; mu)` for a Poisson mean `mu`.
///
/// Total over the extended real line: negative or NaN means give `+inf`,
/// `mu = 0` is `0` for `k = 0` and `+inf` otherwise, `mu = +inf` gives `+inf`.
pub fn nll(k: u64, mu: f64) -> f64 {
    if mu.is_nan() || mu < 0.0 || mu == f64::INFINITY {
        return f64::INFINITY;
    }
    if mu == 0.0 {
        return if k == 0 { 0.0 } else { f64::INFINITY };
    }
    let kf = k as f64;
    mu - kf * mu.ln() + ln_gamma(kf + 1.0)
}

/// Profile NLL of a ratio `r = mu_n / mu_d` of two Poisson means.
///
/// The latent denominator mean is minimised out on `[lambda_lo, lambda_hi]`.
/// The stationary point `(n + m) / (1 + r)` is exact for this convex problem,
/// so it is clamped to the bounds instead of searched for.
pub fn ratio_profile_nll(numerator: u64, denominator: u64, ratio: f64, bounds: (f64, f64)) -> f64 {
    if ratio.is_nan() || ratio < 0.0 {
        return f64::INFINITY;
    }
    let (lo, hi) = bounds;
    let total = (numerator + denominator) as f64;
    let stationary = total / (1.0 + ratio);
    let lambda_d = if stationary.is_finite() { stationary.clamp(lo, hi) } else { lo };
    nll(numerator, ratio * lambda_d) + nll(denominator, lambda_d)
}
