//! Two-state free energy estimators: exponential averaging and the Bennett acceptance ratio.
//!
//! Work values are reduced (dimensionless). `w_f[t]` is the forward work $u_1(x_t) - u_0(x_t)$ for
//! samples `x_t` drawn from state 0, and `w_r[t]` the reverse work $u_0(x_t) - u_1(x_t)$ for samples
//! drawn from state 1. Both estimators return $\Delta f = f_1 - f_0$.
//!
//! # References
//!
//! 1. Bennett CH. Efficient estimation of free energy differences from Monte Carlo data.
//! J. Comput. Phys. 22:245, 1976.
//! 2. Shirts MR, Bair E, Hooker G, and Pande VS. Equilibrium free energies from nonequilibrium
//! measurements using maximum-likelihood methods. PRL 91:140601, 2003.

use crate::errors::*;
use crate::utils::logsumexp;
use ndarray::{Array1, ArrayView1};
use tracing::debug;

const MAXIMUM_ITERATIONS: usize = 500;
const RELATIVE_TOLERANCE: f64 = 1.0e-12;
const MAXIMUM_BRACKET_EXPANSIONS: usize = 64;

/// A free energy difference and its asymptotic uncertainty
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarEstimate {
    /// Estimated dimensionless free energy difference $f_1 - f_0$
    pub delta_f: f64,
    /// Uncertainty of `delta_f` at one standard deviation
    pub d_delta_f: f64,
}

/// $\ln(1 + e^x)$, accurate for large positive and negative `x`
fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Estimate $\Delta f$ by exponential averaging (the Zwanzig relation):
/// $\Delta f = -\ln \langle e^{-w} \rangle$.
pub fn exp(w_f: ArrayView1<'_, f64>) -> Result<BarEstimate> {
    let t = w_f.len();
    if t == 0 {
        return Err(MBarError::InvalidParameter(
            "exponential averaging needs at least one work value".to_string(),
        ));
    }
    let t = t as f64;

    let neg_w = w_f.mapv(|w| -w);
    let delta_f = -(logsumexp(neg_w.view()) - t.ln());

    let max_arg = neg_w.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
    let x = neg_w.mapv(|a| (a - max_arg).exp());
    let mean = x.sum() / t;
    let variance = x.mapv(|v| (v - mean).powi(2)).sum() / t;
    let d_delta_f = variance.sqrt() / t.sqrt() / mean;

    Ok(BarEstimate { delta_f, d_delta_f })
}

/// Log of the Fermi function terms of the BAR implicit equation for both directions
fn log_fermi_terms(
    w_f: ArrayView1<'_, f64>,
    w_r: ArrayView1<'_, f64>,
    delta_f: f64,
) -> (Array1<f64>, Array1<f64>) {
    let m = (w_f.len() as f64 / w_r.len() as f64).ln();
    let log_f_f = w_f.mapv(|w| -log1p_exp(m + w - delta_f));
    let log_f_r = w_r.mapv(|w| -log1p_exp(-m + w + delta_f));
    (log_f_f, log_f_r)
}

/// The BAR implicit function; monotonically increasing in `delta_f` and zero at the estimate.
fn bar_zero(w_f: ArrayView1<'_, f64>, w_r: ArrayView1<'_, f64>, delta_f: f64) -> f64 {
    let (log_f_f, log_f_r) = log_fermi_terms(w_f, w_r, delta_f);
    logsumexp(log_f_f.view()) - logsumexp(log_f_r.view())
}

/// Estimate $\Delta f$ with the Bennett acceptance ratio.
///
/// The implicit BAR equation is bracketed between the forward and reverse exponential averaging
/// estimates (widening the bracket if needed) and solved by bisection.
pub fn bar(w_f: ArrayView1<'_, f64>, w_r: ArrayView1<'_, f64>) -> Result<BarEstimate> {
    if w_f.is_empty() || w_r.is_empty() {
        return Err(MBarError::InvalidParameter(
            "BAR needs work values in both directions".to_string(),
        ));
    }

    let forward = exp(w_f)?.delta_f;
    let reverse = -exp(w_r)?.delta_f;
    let mut lower = forward.min(reverse);
    let mut upper = forward.max(reverse);
    if !(lower.is_finite() && upper.is_finite()) {
        return Err(MBarError::InvalidParameter(
            "work values give a non-finite exponential averaging estimate".to_string(),
        ));
    }

    let mut width = (upper - lower).max(1.0);
    let mut expansions = 0;
    while bar_zero(w_f, w_r, lower) > 0.0 {
        lower -= width;
        width *= 2.0;
        expansions += 1;
        if expansions > MAXIMUM_BRACKET_EXPANSIONS {
            return Err(MBarError::InvalidParameter(
                "could not bracket the BAR free energy".to_string(),
            ));
        }
    }
    while bar_zero(w_f, w_r, upper) < 0.0 {
        upper += width;
        width *= 2.0;
        expansions += 1;
        if expansions > MAXIMUM_BRACKET_EXPANSIONS {
            return Err(MBarError::InvalidParameter(
                "could not bracket the BAR free energy".to_string(),
            ));
        }
    }

    let mut delta_f = 0.5 * (lower + upper);
    for iteration in 0..MAXIMUM_ITERATIONS {
        delta_f = 0.5 * (lower + upper);
        let zero = bar_zero(w_f, w_r, delta_f);
        if zero == 0.0 {
            break;
        } else if zero > 0.0 {
            upper = delta_f;
        } else {
            lower = delta_f;
        }
        if upper - lower <= RELATIVE_TOLERANCE * delta_f.abs().max(1.0) {
            debug!(iteration, delta_f, "BAR converged");
            delta_f = 0.5 * (lower + upper);
            break;
        }
    }

    let (log_f_f, log_f_r) = log_fermi_terms(w_f, w_r, delta_f);
    let t_f = w_f.len() as f64;
    let t_r = w_r.len() as f64;
    // <f^2>/<f>^2 for each direction, in log space
    let ratio_f = (t_f.ln() + logsumexp(log_f_f.mapv(|l| 2.0 * l).view())
        - 2.0 * logsumexp(log_f_f.view()))
    .exp();
    let ratio_r = (t_r.ln() + logsumexp(log_f_r.mapv(|l| 2.0 * l).view())
        - 2.0 * logsumexp(log_f_r.view()))
    .exp();
    let variance = (ratio_f - 1.0) / t_f + (ratio_r - 1.0) / t_r;

    Ok(BarEstimate {
        delta_f,
        d_delta_f: variance.max(0.0).sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::Normal;

    #[test]
    fn exp_of_constant_work_is_exact() {
        let w = array![1.25, 1.25, 1.25];
        let estimate = exp(w.view()).unwrap();
        assert_abs_diff_eq!(estimate.delta_f, 1.25, epsilon = 1e-12);
        assert_abs_diff_eq!(estimate.d_delta_f, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn bar_of_constant_work_is_exact() {
        let w_f = array![0.8, 0.8, 0.8, 0.8];
        let w_r = array![-0.8, -0.8];
        let estimate = bar(w_f.view(), w_r.view()).unwrap();
        assert_abs_diff_eq!(estimate.delta_f, 0.8, epsilon = 1e-9);
    }

    #[test]
    fn bar_recovers_gaussian_work_free_energy() {
        // Gaussian work distributions obeying the Crooks relation
        let delta_f = 2.0;
        let sigma = 1.0;
        let mut rng = SmallRng::seed_from_u64(42);
        let forward = Normal::new(delta_f + 0.5 * sigma * sigma, sigma).unwrap();
        let reverse = Normal::new(-delta_f + 0.5 * sigma * sigma, sigma).unwrap();
        let w_f: Array1<f64> = (0..2000).map(|_| rng.sample(forward)).collect();
        let w_r: Array1<f64> = (0..2000).map(|_| rng.sample(reverse)).collect();

        let estimate = bar(w_f.view(), w_r.view()).unwrap();
        assert!(estimate.d_delta_f > 0.0);
        assert!(
            (estimate.delta_f - delta_f).abs() < 6.0 * estimate.d_delta_f,
            "BAR estimate {:?} too far from {}",
            estimate,
            delta_f
        );
    }

    #[test]
    fn empty_work_is_rejected() {
        let empty: Array1<f64> = Array1::zeros(0);
        assert!(exp(empty.view()).is_err());
        assert!(bar(empty.view(), array![1.0].view()).is_err());
    }
}
