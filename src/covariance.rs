//! Asymptotic covariance of the MBAR estimates of $\ln c_k$, the log normalization constants of
//! each (possibly augmented) state.
//!
//! Every uncertainty in this crate is a quadratic form in the matrix $\Theta$ computed here. See
//! Appendix D of Shirts & Chodera (2008).

use crate::errors::*;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Singular values below this fraction of the largest are treated as zero by the pseudo-inverse
const PINV_RELATIVE_CUTOFF: f64 = 1.0e-10;

/// Method to use to compute uncertainty for expectations
///
/// Method used to compute the asymptotic covariance matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UncertaintyMethod {
    /// Use fast approximate expression from Kong et al.
    ///
    /// This underestimates the true covariance, but may be a good approximation in some cases and
    /// requires no matrix inversions
    Approximate,
    /// Use singular value decomposition based approach to efficiently compute uncertainty
    ///
    /// See Appendix D.1, Eq. D4 in [1].
    Svd,
    /// Use eigenvalue decomposition of W'W in a SVD-based approach to efficiently compute uncertainty
    ///
    /// The eigenvalue decomposition of W'W is used to forego computing the SVD.
    /// See Appendix D.1, Eqs. D4 and D5 of [1].
    SvdEw,
}

impl Default for UncertaintyMethod {
    fn default() -> Self {
        Self::SvdEw
    }
}

fn to_nalgebra(a: ArrayView2<'_, f64>) -> DMatrix<f64> {
    let (rows, cols) = a.dim();
    DMatrix::from_fn(rows, cols, |i, j| a[[i, j]])
}

fn to_ndarray(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Moore-Penrose pseudo-inverse with a cutoff relative to the largest singular value
fn pseudo_inverse(m: DMatrix<f64>) -> Result<DMatrix<f64>> {
    let svd = m.svd(true, true);
    let largest = svd.singular_values.max();
    svd.pseudo_inverse(largest * PINV_RELATIVE_CUTOFF)
        .map_err(|e| MBarError::LinearAlgebra(e.to_string()))
}

/// $\Theta = V \Sigma \left(I - \Sigma V^T N V \Sigma\right)^+ \Sigma V^T$ from the right singular
/// vectors `v` and singular values `s` of $W$
fn theta_from_decomposition(
    v: &DMatrix<f64>,
    s: &[f64],
    n_k: ArrayView1<'_, f64>,
) -> Result<DMatrix<f64>> {
    let k = n_k.len();
    let r = s.len();
    let sigma = DMatrix::from_fn(r, r, |i, j| if i == j { s[i] } else { 0.0 });
    let n_diag = DMatrix::from_fn(k, k, |i, j| if i == j { n_k[i] } else { 0.0 });

    let inner = DMatrix::identity(r, r) - &sigma * v.transpose() * n_diag * v * &sigma;
    let inner_pinv = pseudo_inverse(inner)?;
    Ok(v * &sigma * inner_pinv * &sigma * v.transpose())
}

/// Compute the asymptotic covariance matrix $\Theta$ of $\ln c_k$ for a weight matrix.
///
/// # Parameters
///
/// * `w_nk[n, k]` is the normalized weight of sample `n` in state `k`. States beyond the sampled
///   ones (for observables, PMF bins or perturbed states) are appended as extra columns.
///
/// * `n_k[k]` is the number of samples drawn from state `k`; zero for appended states.
///
/// Returns the `K × K` matrix $\Theta$.
pub fn asymptotic_covariance(
    w_nk: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    method: UncertaintyMethod,
) -> Result<Array2<f64>> {
    let (_, k) = w_nk.dim();
    if n_k.len() != k {
        return Err(MBarError::ArrayLengthMismatch(n_k.len(), k));
    }

    let theta = match method {
        UncertaintyMethod::Approximate => return Ok(w_nk.t().dot(&w_nk)),
        UncertaintyMethod::Svd => {
            let svd = to_nalgebra(w_nk).svd(false, true);
            let v_t = svd
                .v_t
                .ok_or_else(|| MBarError::LinearAlgebra("SVD did not produce V^T".to_string()))?;
            let s: Vec<f64> = svd.singular_values.iter().copied().collect();
            theta_from_decomposition(&v_t.transpose(), &s, n_k)?
        }
        UncertaintyMethod::SvdEw => {
            let wtw = to_nalgebra(w_nk.t().dot(&w_nk).view());
            let eigen = SymmetricEigen::new(wtw);
            let s: Vec<f64> = eigen
                .eigenvalues
                .iter()
                .map(|&lambda| lambda.max(0.0).sqrt())
                .collect();
            theta_from_decomposition(&eigen.eigenvectors, &s, n_k)?
        }
    };

    if theta.iter().any(|x| !x.is_finite()) {
        return Err(MBarError::LinearAlgebra(
            "asymptotic covariance matrix is not finite".to_string(),
        ));
    }
    Ok(to_ndarray(&theta))
}

/// Squared uncertainties of all pairwise differences, $\Theta_{ii} + \Theta_{jj} - 2\Theta_{ij}$,
/// restricted to the states in `indices`.
pub fn difference_variances(theta: ArrayView2<'_, f64>, indices: &[usize]) -> Array2<f64> {
    let n = indices.len();
    Array2::from_shape_fn((n, n), |(i, j)| {
        let (a, b) = (indices[i], indices[j]);
        theta[[a, a]] + theta[[b, b]] - 2.0 * theta[[a, b]]
    })
}

/// Variance of $\sum_i c_i \ln c_{k_i}$ for sparse `coefficients` of `(k_i, c_i)` pairs.
pub fn quadratic_form(theta: ArrayView2<'_, f64>, coefficients: &[(usize, f64)]) -> f64 {
    coefficients
        .iter()
        .flat_map(|&(i, a)| coefficients.iter().map(move |&(j, b)| a * b * theta[[i, j]]))
        .sum()
}

/// Covariance of two sparse linear combinations of $\ln c_k$
pub fn bilinear_form(
    theta: ArrayView2<'_, f64>,
    left: &[(usize, f64)],
    right: &[(usize, f64)],
) -> f64 {
    left.iter()
        .flat_map(|&(i, a)| right.iter().map(move |&(j, b)| a * b * theta[[i, j]]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Two states with fully overlapping samples and a known weight matrix
    fn uniform_weights() -> (Array2<f64>, ndarray::Array1<f64>) {
        (Array2::from_elem((4, 2), 0.25), array![2.0, 2.0])
    }

    #[test]
    fn methods_agree_on_differences() {
        let w_nk = array![
            [0.4, 0.1],
            [0.3, 0.2],
            [0.2, 0.3],
            [0.1, 0.4],
        ];
        let n_k = array![2.0, 2.0];
        let ew = asymptotic_covariance(w_nk.view(), n_k.view(), UncertaintyMethod::SvdEw).unwrap();
        let svd = asymptotic_covariance(w_nk.view(), n_k.view(), UncertaintyMethod::Svd).unwrap();

        let d_ew = difference_variances(ew.view(), &[0, 1]);
        let d_svd = difference_variances(svd.view(), &[0, 1]);
        assert_abs_diff_eq!(d_ew[[0, 1]], d_svd[[0, 1]], epsilon = 1e-10);
        assert_abs_diff_eq!(d_ew[[0, 0]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn identical_states_have_no_difference_uncertainty() {
        let (w_nk, n_k) = uniform_weights();
        let theta = asymptotic_covariance(w_nk.view(), n_k.view(), UncertaintyMethod::SvdEw).unwrap();
        let d2 = difference_variances(theta.view(), &[0, 1]);
        assert_abs_diff_eq!(d2[[0, 1]], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn approximate_is_w_transpose_w() {
        let (w_nk, n_k) = uniform_weights();
        let theta =
            asymptotic_covariance(w_nk.view(), n_k.view(), UncertaintyMethod::Approximate).unwrap();
        assert_eq!(theta, Array2::from_elem((2, 2), 0.25));
    }

    #[test]
    fn quadratic_form_matches_difference_variance() {
        let theta = array![[2.0, 0.5], [0.5, 1.0]];
        let direct = difference_variances(theta.view(), &[0, 1])[[0, 1]];
        let form = quadratic_form(theta.view(), &[(1, 1.0), (0, -1.0)]);
        assert_abs_diff_eq!(direct, form);
        assert_abs_diff_eq!(
            bilinear_form(theta.view(), &[(0, 1.0)], &[(1, 2.0)]),
            1.0
        );
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        let (w_nk, _) = uniform_weights();
        let result = asymptotic_covariance(w_nk.view(), array![1.0].view(), UncertaintyMethod::Svd);
        assert!(matches!(result, Err(MBarError::ArrayLengthMismatch(1, 2))));
    }
}
