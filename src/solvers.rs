//! Solution of the MBAR self-consistent equations.
//!
//! All functions here take the reduced potentials `u_kn[k, n]`, the sample counts `n_k[k]` (as
//! floats) and the current free energies `f_k[k]`. The MBAR objective is invariant to adding a
//! constant to every `f_k`, so solutions are always reported with `f_k[0] == 0`.

use crate::errors::*;
use crate::utils::logsumexp;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use tracing::{debug, info};

/// Algorithm used to solve the MBAR equations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolverMethod {
    /// Take a self-consistent step and a Newton-Raphson step each iteration, and keep whichever
    /// gives the smaller gradient norm. Robust far from the solution and quadratically convergent
    /// close to it.
    Adaptive,
    /// Iterate the self-consistent equations (Eq. 11 of Shirts & Chodera). Slow but always
    /// stable.
    SelfConsistent,
    /// Newton-Raphson on the MBAR likelihood, falling back to a self-consistent step whenever the
    /// Hessian cannot be solved.
    NewtonRaphson,
}

impl Default for SolverMethod {
    fn default() -> Self {
        Self::Adaptive
    }
}

/// Convergence settings for [`solve_mbar_for_all_states`]
#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    /// Which iteration scheme to use
    pub method: SolverMethod,
    /// Give up after this many iterations
    pub maximum_iterations: usize,
    /// Stop when the largest change in `f_k`, relative to the largest `|f_k|`, drops below this
    pub relative_tolerance: f64,
    /// Log each iteration at info rather than debug level
    pub verbose: bool,
}

/// $\ln D_n = \ln \sum_k N_k e^{f_k - u_{kn}}$, the log of the MBAR mixture denominator of each
/// sample. Only states with `n_k[k] > 0` contribute.
pub fn log_denominator(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
) -> Array1<f64> {
    let sampled: Vec<(usize, f64)> = n_k
        .iter()
        .enumerate()
        .filter(|(_, &n)| n > 0.0)
        .map(|(k, &n)| (k, f_k[k] + n.ln()))
        .collect();

    let mut terms = Array1::zeros(sampled.len());
    u_kn.axis_iter(Axis(1))
        .map(|u_k| {
            for (term, &(k, offset)) in terms.iter_mut().zip(sampled.iter()) {
                *term = offset - u_k[k];
            }
            logsumexp(terms.view())
        })
        .collect()
}

/// $\ln W_{nk} = f_k - u_{kn} - \ln D_n$, returned with shape `[N, K]`.
pub fn mbar_log_w_nk(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let log_denom_n = log_denominator(u_kn, n_k, f_k);
    let (k, n) = u_kn.dim();
    Array2::from_shape_fn((n, k), |(n, k)| f_k[k] - u_kn[[k, n]] - log_denom_n[n])
}

/// $\ln \sum_n e^{-u_{kn} - \ln D_n}$ for every state `k`
fn log_numerators(u_kn: ArrayView2<'_, f64>, log_denom_n: ArrayView1<'_, f64>) -> Array1<f64> {
    u_kn.outer_iter()
        .map(|u_n| {
            let log_w_n = Zip::from(&u_n)
                .and(&log_denom_n)
                .map_collect(|&u, &d| -u - d);
            logsumexp(log_w_n.view())
        })
        .collect()
}

/// One application of the self-consistent equations:
/// $f_k \leftarrow -\ln \sum_n e^{-u_{kn}} / D_n$.
///
/// The result is not shifted; every state, sampled or not, gets a new estimate.
pub fn self_consistent_update(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
) -> Array1<f64> {
    let log_denom_n = log_denominator(u_kn, n_k, f_k);
    log_numerators(u_kn, log_denom_n.view()).mapv(|x| -x)
}

/// Gradient of the (negated) MBAR log likelihood with respect to `f_k`.
///
/// $g_k = -N_k \left(1 - e^{f_k} \sum_n e^{-u_{kn}} / D_n\right)$, which vanishes at the solution.
pub fn mbar_gradient(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
) -> Array1<f64> {
    let log_denom_n = log_denominator(u_kn, n_k, f_k);
    let log_num_k = log_numerators(u_kn, log_denom_n.view());
    Zip::from(&n_k)
        .and(&f_k)
        .and(&log_num_k)
        .map_collect(|&n, &f, &num| -n * (1.0 - (f + num).exp()))
}

/// Hessian matching [`mbar_gradient`]: $H = -\left(N W^T W N - \mathrm{diag}(N_k \sum_n W_{nk})\right)$
pub fn mbar_hessian(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let w_nk = mbar_log_w_nk(u_kn, n_k, f_k).mapv(f64::exp);
    let column_sums = w_nk.sum_axis(Axis(0));
    let mut h = w_nk.t().dot(&w_nk);
    let k = n_k.len();
    for i in 0..k {
        for j in 0..k {
            h[[i, j]] *= n_k[i] * n_k[j];
        }
        h[[i, i]] -= n_k[i] * column_sums[i];
    }
    h.mapv_inplace(|x| -x);
    h
}

/// Newton-Raphson step from `f_k`, or `None` if the Hessian is singular.
///
/// The Hessian always has the uniform vector in its null space, so the first state is pinned and
/// the reduced system is solved instead.
fn newton_step(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k: ArrayView1<'_, f64>,
) -> Option<Array1<f64>> {
    let k = f_k.len();
    if k < 2 {
        return Some(f_k.to_owned());
    }
    let g = mbar_gradient(u_kn, n_k, f_k);
    let h = mbar_hessian(u_kn, n_k, f_k);

    let reduced_h = DMatrix::from_fn(k - 1, k - 1, |i, j| h[[i + 1, j + 1]]);
    let reduced_g = DVector::from_fn(k - 1, |i, _| g[i + 1]);
    let step = reduced_h.lu().solve(&reduced_g)?;
    if step.iter().any(|x| !x.is_finite()) {
        return None;
    }

    let mut f_new = f_k.to_owned();
    for i in 1..k {
        f_new[i] -= step[i - 1];
    }
    Some(f_new)
}

fn shift_to_first(mut f_k: Array1<f64>) -> Array1<f64> {
    if !f_k.is_empty() {
        let f0 = f_k[0];
        f_k.mapv_inplace(|f| f - f0);
    }
    f_k
}

fn gradient_norm(u_kn: ArrayView2<'_, f64>, n_k: ArrayView1<'_, f64>, f_k: ArrayView1<'_, f64>) -> f64 {
    let g = mbar_gradient(u_kn, n_k, f_k);
    g.dot(&g)
}

fn max_abs(a: &Array1<f64>) -> f64 {
    a.fold(0.0_f64, |m, &x| m.max(x.abs()))
}

/// Solve the MBAR equations when every state in `u_kn` has samples.
///
/// Returns the solved free energies, shifted so `f_k[0] == 0`, and the number of iterations used.
pub fn solve_mbar(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k_init: ArrayView1<'_, f64>,
    options: &SolverOptions,
) -> Result<(Array1<f64>, usize)> {
    let mut f_k = shift_to_first(f_k_init.to_owned());
    if f_k.len() < 2 {
        return Ok((f_k, 0));
    }

    let mut relative_change = f64::INFINITY;
    for iteration in 0..options.maximum_iterations {
        let f_sc = shift_to_first(self_consistent_update(u_kn, n_k, f_k.view()));

        let (f_new, step_kind, g_norm) = match options.method {
            SolverMethod::SelfConsistent => {
                let g_sc = gradient_norm(u_kn, n_k, f_sc.view());
                (f_sc, "self-consistent", g_sc)
            }
            SolverMethod::NewtonRaphson => match newton_step(u_kn, n_k, f_k.view()) {
                Some(f_nr) => {
                    let g_nr = gradient_norm(u_kn, n_k, f_nr.view());
                    (f_nr, "Newton-Raphson", g_nr)
                }
                None => {
                    let g_sc = gradient_norm(u_kn, n_k, f_sc.view());
                    (f_sc, "self-consistent", g_sc)
                }
            },
            SolverMethod::Adaptive => {
                let g_sc = gradient_norm(u_kn, n_k, f_sc.view());
                match newton_step(u_kn, n_k, f_k.view()) {
                    Some(f_nr) => {
                        let g_nr = gradient_norm(u_kn, n_k, f_nr.view());
                        if g_nr.is_finite() && g_nr < g_sc {
                            (f_nr, "Newton-Raphson", g_nr)
                        } else {
                            (f_sc, "self-consistent", g_sc)
                        }
                    }
                    None => (f_sc, "self-consistent", g_sc),
                }
            }
        };

        let change = max_abs(&(&f_new - &f_k));
        let scale = max_abs(&f_new);
        relative_change = if scale > 0.0 { change / scale } else { change };
        f_k = f_new;

        if options.verbose {
            info!(
                iteration,
                step = step_kind,
                gradient_norm = g_norm,
                relative_change,
                "MBAR iteration"
            );
        } else {
            debug!(
                iteration,
                step = step_kind,
                gradient_norm = g_norm,
                relative_change,
                "MBAR iteration"
            );
        }

        if !relative_change.is_finite() {
            break;
        }
        if relative_change < options.relative_tolerance || g_norm == 0.0 {
            return Ok((f_k, iteration + 1));
        }
    }

    Err(MBarError::NotConverged {
        iterations: options.maximum_iterations,
        relative_change,
    })
}

/// Solve the MBAR equations for every state, including states without samples.
///
/// The equations are solved over the sampled states only; free energies of unsampled states
/// then follow directly from the self-consistent expression. The result is shifted so that
/// `f_k[0] == 0`.
pub fn solve_mbar_for_all_states(
    u_kn: ArrayView2<'_, f64>,
    n_k: ArrayView1<'_, f64>,
    f_k_init: ArrayView1<'_, f64>,
    options: &SolverOptions,
) -> Result<Array1<f64>> {
    let k = n_k.len();
    if u_kn.len_of(Axis(0)) != k {
        return Err(MBarError::ArrayLengthMismatch(k, u_kn.len_of(Axis(0))));
    }
    if f_k_init.len() != k {
        return Err(MBarError::ArrayLengthMismatch(f_k_init.len(), k));
    }

    let sampled: Vec<usize> = (0..k).filter(|&i| n_k[i] > 0.0).collect();
    if sampled.is_empty() {
        return Err(MBarError::InvalidParameter(
            "at least one state must have samples".to_string(),
        ));
    }

    let u_sampled = u_kn.select(Axis(0), &sampled);
    let n_sampled = n_k.select(Axis(0), &sampled);
    let f_init_sampled = f_k_init.select(Axis(0), &sampled);

    let (f_sampled, iterations) = solve_mbar(
        u_sampled.view(),
        n_sampled.view(),
        f_init_sampled.view(),
        options,
    )?;

    if options.verbose {
        info!(iterations, "MBAR converged");
    } else {
        debug!(iterations, "MBAR converged");
    }

    // Free energies of all states, in the gauge of the sampled solution.
    let mut f_full = Array1::zeros(k);
    for (&i, &f) in sampled.iter().zip(f_sampled.iter()) {
        f_full[i] = f;
    }
    let f_all = self_consistent_update(u_kn, n_k, f_full.view());
    let mut f_k = f_full;
    for i in 0..k {
        if n_k[i] == 0.0 {
            f_k[i] = f_all[i];
        }
    }

    Ok(shift_to_first(f_k))
}
