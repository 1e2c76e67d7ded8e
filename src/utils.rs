//! Numerical helpers shared by the estimator and its callers.

use crate::errors::*;
use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, Dimension};
use tracing::warn;

/// Compute $\ln \sum_i e^{a_i}$ without overflow.
///
/// Returns negative infinity for empty input or when every element is negative infinity.
pub fn logsumexp(a: ArrayView1<'_, f64>) -> f64 {
    let max = a.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = a.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Compute $\ln \sum_i b_i e^{a_i}$ without overflow.
///
/// Terms with `b[i] == 0` are skipped entirely, so `a[i]` may be infinite there. All `b[i]` must
/// be non-negative.
pub fn logsumexp_weighted(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let max = a
        .iter()
        .zip(b.iter())
        .filter(|(_, &b)| b != 0.0)
        .fold(f64::NEG_INFINITY, |m, (&x, _)| m.max(x));
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .filter(|(_, &b)| b != 0.0)
        .map(|(&x, &b)| b * (x - max).exp())
        .sum();
    max + sum.ln()
}

/// Convert `u_kln[k, l, n]`, the reduced potential of sample `n` from state `k` evaluated at
/// state `l`, into `u_kn[l, n]` with samples in concatenated order.
///
/// Only the first `n_k[k]` entries along the last axis of `u_kln[k, .., ..]` are used.
pub fn kln_to_kn(u_kln: ArrayView3<'_, f64>, n_k: ArrayView1<'_, usize>) -> Result<Array2<f64>> {
    let (k, l, n_max) = u_kln.dim();
    if k != n_k.len() {
        return Err(MBarError::ArrayLengthMismatch(n_k.len(), k));
    }
    if let Some(&too_many) = n_k.iter().find(|&&n| n > n_max) {
        return Err(MBarError::ArrayLengthMismatch(n_max, too_many));
    }

    let n_tot: usize = n_k.sum();
    let mut u_kn = Array2::zeros((l, n_tot));
    let mut offset = 0;
    for (state, &count) in n_k.iter().enumerate() {
        for target in 0..l {
            for n in 0..count {
                u_kn[[target, offset + n]] = u_kln[[state, target, n]];
            }
        }
        offset += count;
    }
    Ok(u_kn)
}

/// Flatten `x_kn[k, n]`, padded per state, into `x_n` with samples in concatenated order.
pub fn kn_to_n(x_kn: ArrayView2<'_, f64>, n_k: ArrayView1<'_, usize>) -> Result<Array1<f64>> {
    let (k, n_max) = x_kn.dim();
    if k != n_k.len() {
        return Err(MBarError::ArrayLengthMismatch(n_k.len(), k));
    }
    if let Some(&too_many) = n_k.iter().find(|&&n| n > n_max) {
        return Err(MBarError::ArrayLengthMismatch(n_max, too_many));
    }

    Ok(x_kn
        .outer_iter()
        .zip(n_k.iter())
        .flat_map(|(row, &count)| row.iter().take(count).copied().collect::<Vec<_>>())
        .collect())
}

/// Check the two normalization conditions on an MBAR weight matrix `w_nk[n, k]`.
///
/// Each column must sum to one, and for every sample $\sum_k N_k W_{nk} = 1$ must hold over the
/// sampled states.
pub fn check_w_normalized(
    w_nk: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    tolerance: f64,
) -> Result<()> {
    let (_, k) = w_nk.dim();
    if k != n_k.len() {
        return Err(MBarError::ArrayLengthMismatch(n_k.len(), k));
    }

    let column_sums = w_nk.sum_axis(Axis(0));
    if let Some((state, sum)) = column_sums
        .iter()
        .enumerate()
        .find(|(_, &sum)| (sum - 1.0).abs() > tolerance)
    {
        return Err(MBarError::NotNormalized(format!(
            "column {} of W_nk sums to {}",
            state, sum
        )));
    }

    let row_sums = w_nk.dot(&n_k);
    if let Some((sample, sum)) = row_sums
        .iter()
        .enumerate()
        .find(|(_, &sum)| (sum - 1.0).abs() > tolerance)
    {
        return Err(MBarError::NotNormalized(format!(
            "sum_k N_k W_nk for sample {} is {}",
            sample, sum
        )));
    }

    Ok(())
}

/// Replace negative squared uncertainties with zero.
///
/// Small negative values are round-off. Values more negative than `-warning_cutoff` are still
/// zeroed, but a warning is logged since they usually indicate a poorly converged estimate.
pub fn clamp_squared_uncertainties<D: Dimension>(d2: &mut Array<f64, D>, warning_cutoff: f64) {
    let mut worst = 0.0_f64;
    d2.mapv_inplace(|x| {
        if x < 0.0 {
            worst = worst.min(x);
            0.0
        } else {
            x
        }
    });
    if worst < -warning_cutoff {
        warn!(
            "A squared uncertainty is negative ({:e}); it has been set to zero",
            worst
        );
    }
}
