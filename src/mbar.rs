//! The MBAR estimator: the [`MBar`] builder, its self-consistent solution and every estimate
//! derived from the converged weights.

use crate::bar::bar;
use crate::covariance::*;
use crate::errors::*;
use crate::solvers::{self, SolverMethod, SolverOptions};
use crate::utils::{clamp_squared_uncertainties, logsumexp};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{s, Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix2, Zip};
use tracing::{debug, info, instrument};

/// Observables are shifted to be at least this large so their logarithms are finite
const LOG_FACTOR: f64 = 4.0 * f64::EPSILON;

/// Define the initial guess for free energies
///
/// `InitMBar::BAR` works best when the states are ordered such that adjacent states maximize
/// the overlap between states. Its up to the user to arrange the states in such an order, or at
/// least close to such an order. If you are uncertain what the order of states should be, or if
/// it does not make sense to think of states as adjacent, then choose `InitMBar::Zeros`.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialFreeEnergies {
    /// Use the specified free energy values
    Specified(Vec<f64>),
    /// Initialize all free energies to zero
    Zeros,
    /// Use BAR between the pairwise state to initialize the free energies.
    ///
    /// Each sampled state is paired with the next sampled state; unsampled states start at zero.
    BAR,
}

impl Default for InitialFreeEnergies {
    fn default() -> Self {
        Self::Zeros
    }
}

impl From<&[f64]> for InitialFreeEnergies {
    fn from(slice: &[f64]) -> Self {
        Self::Specified(Vec::from(slice))
    }
}

/// Multistate Bennett acceptance ratio method (MBAR) for the analysis of multiple equilibrium
/// samples.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively independent) samples.
///
/// # References
///
/// 1. Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
/// equilibrium states. J. Chem. Phys. 129:124105, 2008 <http://dx.doi.org/10.1063/1.2978177>
#[derive(Builder, Debug)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct MBar {
    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    u_kn: Array2<f64>,

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    ///
    /// Unless `x_kindices` says otherwise, the first `n_k[0]` samples are from the first state,
    /// the next `n_k[1]` from the second state, and so forth. This only matters for the BAR
    /// initial guess; MBAR itself does not care which samples are from which state.
    n_k: Array1<usize>,

    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maximum_iterations: usize,

    /// Set to determine the relative tolerance convergence criteria
    #[builder(default = "1.0e-7")]
    relative_tolerance: f64,

    /// Set to the initial dimensionless free energies to use as a guess
    #[builder(default)]
    initial_free_energies: InitialFreeEnergies,

    /// Which state is each x from?
    ///
    /// Usually doesn’t matter, but does for BAR. We assume the samples are in K order (the first
    /// `n_k[0]` samples are from the 0th state, the next `n_k[1]` samples from the 1st state, and
    /// so forth.
    #[builder(setter(strip_option), default)]
    x_kindices: Option<Array1<usize>>,

    /// Algorithm used to solve the MBAR equations
    #[builder(default)]
    solver: SolverMethod,

    /// Warn if a squared uncertainty is negative and larger in magnitude than this number
    #[builder(default = "1.0e-10")]
    warning_cutoff: f64,

    /// Set to True if verbose debug output is desired
    #[builder(setter(skip), default = "false")]
    verbose: bool,

    /// Solved dimensionless free energies, with `f_k[0] == 0`
    #[builder(setter(skip), default = "Array1::zeros(0)")]
    f_k: Array1<f64>,

    /// Normalized log weights, shape `[N, K]`
    #[builder(setter(skip), default = "Array2::zeros((0, 0))")]
    log_w_nk: Array2<f64>,

    /// $\ln \sum_k N_k e^{f_k - u_{kn}}$ for each sample
    #[builder(setter(skip), default = "Array1::zeros(0)")]
    log_denom_n: Array1<f64>,
}

impl MBarBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(u_kn), Some(n_k)) = (&self.u_kn, &self.n_k) {
            let k = u_kn.len_of(Axis(0));
            let n_tot = u_kn.len_of(Axis(1));

            if n_tot != n_k.iter().sum() {
                return Err(format!(
                    "n_k.sum() must equal the total number of samples ({})",
                    n_tot
                ));
            }

            if k != n_k.len() {
                return Err(format!(
                    "n_k's length must equal the number of states ({})",
                    k
                ));
            }

            if n_tot == 0 {
                return Err("at least one sample is required".to_string());
            }

            if u_kn.iter().any(|u| u.is_nan()) {
                return Err("u_kn must not contain NaN".to_string());
            }

            if let Some(Some(x_kindices)) = &self.x_kindices {
                if x_kindices.len() != n_tot {
                    return Err(format!(
                        "x_kindices must have one entry per sample ({})",
                        n_tot
                    ));
                }
                let mut counts = vec![0; k];
                for &state in x_kindices.iter() {
                    if state >= k {
                        return Err(format!(
                            "x_kindices refers to state {} but there are only {} states",
                            state, k
                        ));
                    }
                    counts[state] += 1;
                }
                if counts.iter().zip(n_k.iter()).any(|(a, b)| a != b) {
                    return Err("x_kindices disagrees with n_k".to_string());
                }
            }

            // Each sample must have a finite energy in the state it was drawn from
            let origin: Vec<usize> = match &self.x_kindices {
                Some(Some(x_kindices)) => x_kindices.to_vec(),
                _ => n_k
                    .iter()
                    .enumerate()
                    .flat_map(|(state, &count)| std::iter::repeat(state).take(count))
                    .collect(),
            };
            if let Some(n) = (0..n_tot).find(|&n| !u_kn[[origin[n], n]].is_finite()) {
                return Err(format!(
                    "sample {} has a non-finite reduced potential in its own state",
                    n
                ));
            }

            if let Some(InitialFreeEnergies::Specified(energies)) = &self.initial_free_energies {
                if energies.len() != k {
                    return Err(format!(
                        "{} initial free energies given for {} states",
                        energies.len(),
                        k
                    ));
                }
            }
        }

        if let Some(tolerance) = self.relative_tolerance {
            if !(tolerance > 0.0) {
                return Err("relative_tolerance must be positive".to_string());
            }
        }

        Ok(())
    }

    /// Build and solve the MBAR equations, logging progress at info level
    pub fn build_verbose(&self) -> Result<MBar> {
        let mut new = self.build_inner()?;
        new.verbose = true;
        new.init()
    }

    /// Build and solve the MBAR equations
    pub fn build(&self) -> Result<MBar> {
        let mut new = self.build_inner()?;
        new.verbose = false;
        new.init()
    }
}

/// Input observable for [`MBar::expectations`]
#[derive(Debug, Clone, Copy)]
pub enum Observable<'a> {
    /// `a_n[n]` is the value of the observable for sample `n`, the same in every state
    Independent(ArrayView1<'a, f64>),
    /// `a_ln[l, n]` is the value of the observable for sample `n` in target state `l`
    StateDependent(ArrayView2<'a, f64>),
}

impl<'a> From<ArrayView1<'a, f64>> for Observable<'a> {
    fn from(a_n: ArrayView1<'a, f64>) -> Self {
        Self::Independent(a_n)
    }
}

impl<'a> From<&'a Array1<f64>> for Observable<'a> {
    fn from(a_n: &'a Array1<f64>) -> Self {
        Self::Independent(a_n.view())
    }
}

impl<'a> From<ArrayView2<'a, f64>> for Observable<'a> {
    fn from(a_ln: ArrayView2<'a, f64>) -> Self {
        Self::StateDependent(a_ln)
    }
}

impl<'a> From<&'a Array2<f64>> for Observable<'a> {
    fn from(a_ln: &'a Array2<f64>) -> Self {
        Self::StateDependent(a_ln.view())
    }
}

impl MBar {
    /// Solve the MBAR equations and store the weights; called by build methods
    #[instrument(level = "debug", skip_all, fields(k = self.k(), n_tot = self.n_tot()))]
    fn init(mut self) -> Result<Self> {
        let n_k = self.n_k_f64();

        let f_init = match &self.initial_free_energies {
            InitialFreeEnergies::Specified(energies) => {
                if energies.len() != self.k() {
                    return Err(MBarError::ArrayLengthMismatch(energies.len(), self.k()));
                }
                Array1::from(energies.clone())
            }
            InitialFreeEnergies::Zeros => Array1::zeros(self.k()),
            InitialFreeEnergies::BAR => self.bar_initial_free_energies()?,
        };

        let options = SolverOptions {
            method: self.solver,
            maximum_iterations: self.maximum_iterations,
            relative_tolerance: self.relative_tolerance,
            verbose: self.verbose,
        };
        let f_k =
            solvers::solve_mbar_for_all_states(self.u_kn.view(), n_k.view(), f_init.view(), &options)?;

        self.log_denom_n = solvers::log_denominator(self.u_kn.view(), n_k.view(), f_k.view());
        let mut log_w_nk = Array2::from_shape_fn((self.n_tot(), self.k()), |(n, k)| {
            -self.u_kn[[k, n]] - self.log_denom_n[n]
        });
        for mut column in log_w_nk.axis_iter_mut(Axis(1)) {
            let norm = logsumexp(column.view());
            column.mapv_inplace(|x| x - norm);
        }
        self.log_w_nk = log_w_nk;
        self.f_k = f_k;

        if self.verbose {
            info!(f_k = ?self.f_k, "MBAR free energies");
        } else {
            debug!(f_k = ?self.f_k, "MBAR free energies");
        }

        Ok(self)
    }

    /// Sample indices of each state, from `x_kindices` or the contiguous default ordering
    fn samples_by_state(&self) -> Vec<Vec<usize>> {
        let mut by_state = vec![Vec::new(); self.k()];
        match &self.x_kindices {
            Some(x_kindices) => {
                for (n, &state) in x_kindices.iter().enumerate() {
                    by_state[state].push(n);
                }
            }
            None => {
                let mut start = 0;
                for (state, &count) in self.n_k.iter().enumerate() {
                    by_state[state].extend(start..start + count);
                    start += count;
                }
            }
        }
        by_state
    }

    /// Initial guess from BAR between each pair of consecutive sampled states
    fn bar_initial_free_energies(&self) -> Result<Array1<f64>> {
        let by_state = self.samples_by_state();
        let sampled: Vec<usize> = (0..self.k()).filter(|&k| self.n_k[k] > 0).collect();

        let mut f_k = Array1::zeros(self.k());
        for pair in sampled.windows(2) {
            let (i, j) = (pair[0], pair[1]);
            let w_f: Array1<f64> = by_state[i]
                .iter()
                .map(|&n| self.u_kn[[j, n]] - self.u_kn[[i, n]])
                .collect();
            let w_r: Array1<f64> = by_state[j]
                .iter()
                .map(|&n| self.u_kn[[i, n]] - self.u_kn[[j, n]])
                .collect();
            let estimate = bar(w_f.view(), w_r.view())?;
            debug!(from = i, to = j, delta_f = estimate.delta_f, "BAR initial guess");
            f_k[j] = f_k[i] + estimate.delta_f;
        }
        Ok(f_k)
    }

    /// Get a new builder for the `MBar` struct. `MBar` can only be constructed via the builder.
    pub fn builder() -> MBarBuilder {
        MBarBuilder::default()
    }

    /// $N_{tot}$, the total number of snapshots from all states
    pub fn n_tot(&self) -> usize {
        self.u_kn.len_of(Axis(1))
    }

    /// $K$, the total number of thermodynamic states
    pub fn k(&self) -> usize {
        self.u_kn.len_of(Axis(0))
    }

    /// `u_kn[k][n]` is the reduced potential energy of configuration n evaluated at state `k`
    pub fn u_kn(&self) -> &Array2<f64> {
        &self.u_kn
    }

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    fn n_k_f64(&self) -> Array1<f64> {
        self.n_k.mapv(|n| n as f64)
    }

    /// Which state is each x from?
    ///
    /// Usually doesn’t matter, but does for BAR. We assume the samples are in K order (the first
    /// `n_k[0]` samples are from the 0th state, the next `n_k[1]` samples from the 1st state, and
    /// so forth.
    pub fn x_kindices(&self) -> Option<&Array1<usize>> {
        self.x_kindices.as_ref()
    }

    /// Retrieve a copy of the relative dimensionless free energy $f_k$ of states $k$
    pub fn f_k(&self) -> Array1<f64> {
        self.f_k.clone()
    }

    /// Retrieve a copy of the log weight matrix $\ln(W_nk)$
    pub fn log_w_nk(&self) -> Array2<f64> {
        self.log_w_nk.clone()
    }

    /// Retrieve a copy of the weight matrix $W_nk$
    ///
    /// Each column sums to one: `w_nk[.., k]` are the weights of every sample in state `k`.
    pub fn w_nk(&self) -> Array2<f64> {
        self.log_w_nk.mapv(f64::exp)
    }

    /// $\ln w_n = -u_n - \ln D_n$, log weights for a new state with reduced potential `u_n`,
    /// unnormalized but in the same gauge as `f_k`
    fn unnormalized_log_weights(&self, u_n: ArrayView1<'_, f64>) -> Array1<f64> {
        &u_n.mapv(|u| -u) - &self.log_denom_n
    }

    /// Normalized weights and free energies of new states with reduced potentials `u_ln[l, n]`
    fn target_states(&self, u_ln: ArrayView2<'_, f64>) -> (Array1<f64>, Vec<Array1<f64>>) {
        let mut f_l = Array1::zeros(u_ln.nrows());
        let mut w_ln = Vec::with_capacity(u_ln.nrows());
        for (l, u_n) in u_ln.outer_iter().enumerate() {
            let log_w_n = self.unnormalized_log_weights(u_n);
            f_l[l] = -logsumexp(log_w_n.view());
            w_ln.push(log_w_n.mapv(|x| (x + f_l[l]).exp()));
        }
        (f_l, w_ln)
    }

    /// $\Theta$ for the sampled states plus `extra` unsampled states given by their normalized
    /// weight columns. Indices `0..K` of the result are the sampled states and `K..` the extras.
    fn augmented_theta(
        &self,
        extra: &[Array1<f64>],
        method: UncertaintyMethod,
    ) -> Result<Array2<f64>> {
        let k = self.k();
        let mut w_nk: Array2<f64> = Array2::zeros((self.n_tot(), k + extra.len()));
        w_nk.slice_mut(s![.., ..k])
            .assign(&self.log_w_nk.mapv(f64::exp));
        for (i, column) in extra.iter().enumerate() {
            w_nk.column_mut(k + i).assign(column);
        }

        let mut n_k: Array1<f64> = Array1::zeros(k + extra.len());
        n_k.slice_mut(s![..k]).assign(&self.n_k_f64());

        asymptotic_covariance(w_nk.view(), n_k.view(), method)
    }

    fn check_samples<D>(&self, a: &ArrayBase<D, Ix2>) -> Result<()>
    where
        D: Data<Elem = f64>,
    {
        if a.ncols() != self.n_tot() {
            return Err(MBarError::ArrayShapeMismatch(
                a.dim(),
                (a.nrows(), self.n_tot()),
            ));
        }
        Ok(())
    }

    /// Compute the dimensionless free energy differences between all pairs of states.
    ///
    /// # Returns
    ///
    /// `delta_f[i, j]` is $f_j - f_i$ and `d_delta_f[i, j]` its uncertainty at one standard
    /// deviation. `theta` is the asymptotic covariance matrix of the sampled states.
    pub fn free_energy_differences(
        &self,
        uncertainty_method: UncertaintyMethod,
    ) -> Result<FreeEnergyDifferences> {
        let k = self.k();
        let delta_f = Array2::from_shape_fn((k, k), |(i, j)| self.f_k[j] - self.f_k[i]);

        let theta = self.augmented_theta(&[], uncertainty_method)?;
        let indices: Vec<usize> = (0..k).collect();
        let mut d2 = difference_variances(theta.view(), &indices);
        clamp_squared_uncertainties(&mut d2, self.warning_cutoff);

        Ok(FreeEnergyDifferences {
            delta_f,
            d_delta_f: d2.mapv(f64::sqrt),
            theta,
        })
    }

    /// Compute the free energies of new states from the existing samples.
    ///
    /// The new states are never sampled, so their reduced potentials `u_ln[l, n]` only need to be
    /// evaluated on the existing configurations.
    ///
    /// # Returns
    ///
    /// `delta_f[i, j]` is $f_j - f_i$ between the new states `i` and `j`, `d_delta_f` its
    /// uncertainty. `theta` covers the sampled states followed by the new ones.
    pub fn compute_perturbed_free_energies(
        &self,
        u_ln: ArrayView2<'_, f64>,
        uncertainty_method: UncertaintyMethod,
    ) -> Result<FreeEnergyDifferences> {
        self.check_samples(&u_ln)?;
        let k = self.k();
        let l = u_ln.nrows();

        let (f_l, w_ln) = self.target_states(u_ln);
        let theta = self.augmented_theta(&w_ln, uncertainty_method)?;

        let delta_f = Array2::from_shape_fn((l, l), |(i, j)| f_l[j] - f_l[i]);
        let indices: Vec<usize> = (k..k + l).collect();
        let mut d2 = difference_variances(theta.view(), &indices);
        clamp_squared_uncertainties(&mut d2, self.warning_cutoff);

        Ok(FreeEnergyDifferences {
            delta_f,
            d_delta_f: d2.mapv(f64::sqrt),
            theta,
        })
    }

    /// Compute expectations of several observables at several states, with full covariance.
    ///
    /// This is the engine behind all other expectation methods.
    ///
    /// # Parameters
    ///
    /// * `a_in[i, n]` is observable `i` evaluated on sample `n`
    ///
    /// * `u_ln[l, n]` is the reduced potential of sample `n` in target state `l`
    ///
    /// * `state_map` lists the `(observable, state)` pairs to estimate, `⟨a_i⟩_l`
    ///
    /// # Notes
    ///
    /// Each observable is shifted to be strictly positive, and for every pair in `state_map` the
    /// weight matrix is augmented with a column of weights proportional to $a_i(x_n) W_{nl}$. The
    /// augmented matrix has the `K` sampled states first, then the `L` target states, then one
    /// column per requested expectation; `theta` uses the same ordering.
    ///
    /// See Section IV of [1].
    pub fn compute_expectations_inner(
        &self,
        a_in: ArrayView2<'_, f64>,
        u_ln: ArrayView2<'_, f64>,
        state_map: &[(usize, usize)],
        uncertainty_method: UncertaintyMethod,
    ) -> Result<ExpectationsInner> {
        self.check_samples(&a_in)?;
        self.check_samples(&u_ln)?;
        let k = self.k();
        let n_observables = a_in.nrows();
        let l = u_ln.nrows();
        for &(i, state) in state_map {
            if i >= n_observables {
                return Err(MBarError::IndexOutOfBounds {
                    what: "observables",
                    index: i,
                    len: n_observables,
                });
            }
            if state >= l {
                return Err(MBarError::IndexOutOfBounds {
                    what: "target states",
                    index: state,
                    len: l,
                });
            }
        }

        let (f_l, mut extra) = self.target_states(u_ln);
        let a_min = a_in.fold_axis(Axis(1), f64::INFINITY, |&m, &x| m.min(x));

        let mut observables: Array1<f64> = Array1::zeros(state_map.len());
        let mut shifted: Array1<f64> = Array1::zeros(state_map.len());
        for (s, &(i, state)) in state_map.iter().enumerate() {
            let log_w_n = self.unnormalized_log_weights(u_ln.row(state));
            let log_a_w_n = Zip::from(&a_in.row(i))
                .and(&log_w_n)
                .map_collect(|&a, &lw| (a - a_min[i] + LOG_FACTOR).ln() + lw);
            let f_s = -logsumexp(log_a_w_n.view());
            shifted[s] = (f_l[state] - f_s).exp();
            observables[s] = shifted[s] + a_min[i] - LOG_FACTOR;
            extra.push(log_a_w_n.mapv(|x| (x + f_s).exp()));
        }

        let theta = self.augmented_theta(&extra, uncertainty_method)?;

        // Indices of <a_s> and its target state in theta
        let terms: Vec<[(usize, f64); 2]> = state_map
            .iter()
            .enumerate()
            .map(|(s, &(_, state))| [(k + l + s, 1.0), (k + state, -1.0)])
            .collect();
        let covariance = Array2::from_shape_fn((state_map.len(), state_map.len()), |(s, t)| {
            shifted[s] * shifted[t] * bilinear_form(theta.view(), &terms[s], &terms[t])
        });

        Ok(ExpectationsInner {
            observables,
            free_energies: f_l,
            covariance,
            theta,
        })
    }

    fn expectations_core(
        &self,
        a: Observable<'_>,
        params: ExpectationsParams,
    ) -> Result<ExpectationsInner> {
        let ExpectationsParams {
            u_kn,
            uncertainty_method,
        } = params;
        let u_ln = u_kn.unwrap_or_else(|| self.u_kn.clone());
        let l = u_ln.nrows();

        match a {
            Observable::Independent(a_n) => {
                if a_n.len() != self.n_tot() {
                    return Err(MBarError::ArrayLengthMismatch(a_n.len(), self.n_tot()));
                }
                let state_map: Vec<(usize, usize)> = (0..l).map(|state| (0, state)).collect();
                self.compute_expectations_inner(
                    a_n.insert_axis(Axis(0)),
                    u_ln.view(),
                    &state_map,
                    uncertainty_method,
                )
            }
            Observable::StateDependent(a_ln) => {
                if a_ln.dim() != (l, self.n_tot()) {
                    return Err(MBarError::ArrayShapeMismatch(a_ln.dim(), (l, self.n_tot())));
                }
                let state_map: Vec<(usize, usize)> = (0..l).map(|state| (state, state)).collect();
                self.compute_expectations_inner(a_ln, u_ln.view(), &state_map, uncertainty_method)
            }
        }
    }

    /// Compute the expectation of an observable of a phase space function.
    ///
    /// Compute the expectation of an observable of a single phase space
    /// function A(x) at all states where potentials are generated.
    ///
    /// # Parameters
    ///
    /// * `a` is either `a_n[n] = A(x_n)`, or `a_ln[l, n] = A_l(x_n)` for an observable that
    ///   depends on the state (such as the potential energy)
    ///
    /// * `params.u_kn` selects the states of interest; defaults to the sampled states
    ///
    /// # References
    ///
    /// See Section IV of [1].
    pub fn expectations<'a>(
        &self,
        a: impl Into<Observable<'a>>,
        params: ExpectationsParams,
    ) -> Result<Expectations> {
        let inner = self.expectations_core(a.into(), params)?;
        let mut variances = inner.covariance.diag().to_owned();
        clamp_squared_uncertainties(&mut variances, self.warning_cutoff);

        Ok(Expectations {
            theta: inner.theta,
            mu: inner.observables,
            sigma: variances.mapv(f64::sqrt),
        })
    }

    /// Compute the differences (in expectation) of an observable of a phase space function between states.
    ///
    /// Compute the expectation of an observable of a single phase space
    /// function A(x) at all states where potentials are generated.
    ///
    /// # Parameters
    ///
    /// As for [`MBar::expectations`].
    ///
    /// # References
    ///
    /// See Section IV of [1].
    pub fn differences_in_expectation<'a>(
        &self,
        a: impl Into<Observable<'a>>,
        params: ExpectationsParams,
    ) -> Result<DifferencesInExpectation> {
        let inner = self.expectations_core(a.into(), params)?;
        let l = inner.observables.len();
        let mu = Array2::from_shape_fn((l, l), |(i, j)| {
            inner.observables[j] - inner.observables[i]
        });

        let indices: Vec<usize> = (0..l).collect();
        let mut d2 = difference_variances(inner.covariance.view(), &indices);
        clamp_squared_uncertainties(&mut d2, self.warning_cutoff);

        Ok(DifferencesInExpectation {
            theta: inner.theta,
            mu,
            sigma: d2.mapv(f64::sqrt),
        })
    }

    /// Compute the expectations of multiple observables of phase space functions at one state.
    ///
    /// # Parameters
    ///
    /// * `a_in[i, n]` is observable `i` evaluated on sample `n`
    ///
    /// * `u_n[n]` is the reduced potential of sample `n` in the state of interest
    pub fn multiple_expectations(
        &self,
        a_in: ArrayView2<'_, f64>,
        u_n: ArrayView1<'_, f64>,
        uncertainty_method: UncertaintyMethod,
    ) -> Result<MultipleExpectations> {
        if u_n.len() != self.n_tot() {
            return Err(MBarError::ArrayLengthMismatch(u_n.len(), self.n_tot()));
        }
        let state_map: Vec<(usize, usize)> = (0..a_in.nrows()).map(|i| (i, 0)).collect();
        let inner = self.compute_expectations_inner(
            a_in,
            u_n.insert_axis(Axis(0)),
            &state_map,
            uncertainty_method,
        )?;

        let mut variances = inner.covariance.diag().to_owned();
        clamp_squared_uncertainties(&mut variances, self.warning_cutoff);

        Ok(MultipleExpectations {
            theta: inner.theta,
            mu: inner.observables,
            sigma: variances.mapv(f64::sqrt),
            covariance: inner.covariance,
        })
    }

    /// Compute the free energy of occupying a number of bins.
    ///
    /// This implementation computes the expectation of an indicator-function observable for each bin.
    ///
    /// # Parameters
    ///
    /// * `u_n[n]` is the reduced potential energy of snapshot `n` of state `k`
    /// for which the PMF is to be computed.
    ///
    /// * `bin_n[n]` is the bin index of snapshot `n` of state `k` and is in `0..n_bins`
    ///
    /// * `n_bins` is the number of bins. No bin may be empty of snapshots
    ///
    /// * `uncertainties` is the method for reporting uncertainties
    ///
    /// # Notes
    ///
    /// - All bins must have some samples in them from at least one of the states – this will not
    ///   work if `bin_n.sum(0) == 0`. Empty bins should be removed before calling `compute_pmf()`.
    /// - This method works by computing the free energy of localizing the system to each bin for
    ///   the given potential by aggregating the log weights for the given potential.
    /// - To estimate uncertainties, the N×K weight matrix $W_nk$ is augmented to be N×(K+`n_bins`)
    ///   in order to accomodate the normalized weights of states where the potential is given by
    ///   `u_kn` within each bin and infinite potential outside the bin. The uncertainties with
    ///   respect to the bin of lowest free energy are then computed in the standard way.
    /// - The covariance of the augmented weights is always computed with
    ///   [`UncertaintyMethod::SvdEw`], the default method.
    #[instrument(level = "debug", skip(self, u_n, bin_n))]
    pub fn compute_pmf(
        &self,
        u_n: &[f64],
        bin_n: &[usize],
        n_bins: usize,
        uncertainties: PmfUncertainties,
    ) -> Result<Pmf> {
        if u_n.len() != self.n_tot() {
            return Err(MBarError::ArrayLengthMismatch(u_n.len(), self.n_tot()));
        }
        if bin_n.len() != self.n_tot() {
            return Err(MBarError::ArrayLengthMismatch(bin_n.len(), self.n_tot()));
        }
        let mut counts = vec![0_usize; n_bins];
        for &bin in bin_n {
            if bin >= n_bins {
                return Err(MBarError::IndexOutOfBounds {
                    what: "bins",
                    index: bin,
                    len: n_bins,
                });
            }
            counts[bin] += 1;
        }
        if let Some(empty) = counts.iter().position(|&c| c == 0) {
            return Err(MBarError::EmptyBin(empty));
        }
        if let PmfUncertainties::FromSpecified(reference) = uncertainties {
            if reference >= n_bins {
                return Err(MBarError::IndexOutOfBounds {
                    what: "bins",
                    index: reference,
                    len: n_bins,
                });
            }
        }

        let k = self.k();
        let log_w_n = self.unnormalized_log_weights(ArrayView1::from(u_n));

        let mut f_i: Array1<f64> = Array1::zeros(n_bins);
        for (i, f) in f_i.iter_mut().enumerate() {
            let in_bin: Array1<f64> = log_w_n
                .iter()
                .zip(bin_n)
                .filter(|(_, &bin)| bin == i)
                .map(|(&lw, _)| lw)
                .collect();
            *f = -logsumexp(in_bin.view());
        }

        let extra: Vec<Array1<f64>> = (0..n_bins)
            .map(|i| {
                log_w_n
                    .iter()
                    .zip(bin_n)
                    .map(|(&lw, &bin)| if bin == i { (lw + f_i[i]).exp() } else { 0.0 })
                    .collect()
            })
            .collect();
        let theta = self.augmented_theta(&extra, UncertaintyMethod::default())?;
        let bins: Vec<usize> = (k..k + n_bins).collect();

        let lowest = f_i
            .iter()
            .enumerate()
            .fold((0, f64::INFINITY), |(best, min), (i, &f)| {
                if f < min {
                    (i, f)
                } else {
                    (best, min)
                }
            })
            .0;

        let relative_to = |reference: usize, f_i: Array1<f64>| -> Pmf {
            let mut d2 = Array1::from_shape_fn(n_bins, |i| {
                theta[[k + i, k + i]] + theta[[k + reference, k + reference]]
                    - 2.0 * theta[[k + i, k + reference]]
            });
            clamp_squared_uncertainties(&mut d2, self.warning_cutoff);
            let f_ref = f_i[reference];
            Pmf {
                f_i: f_i.mapv(|f| f - f_ref),
                df_i: Some(d2.mapv(f64::sqrt)),
                df_ij: None,
            }
        };

        Ok(match uncertainties {
            PmfUncertainties::FromLowest => relative_to(lowest, f_i),
            PmfUncertainties::FromSpecified(reference) => relative_to(reference, f_i),
            PmfUncertainties::FromNormalization => {
                let neg_f = f_i.mapv(|f| -f);
                let log_norm = logsumexp(neg_f.view());
                let p_i = neg_f.mapv(|x| (x - log_norm).exp());
                let mut d2 = Array1::from_shape_fn(n_bins, |target| {
                    let coefficients: Vec<(usize, f64)> = (0..n_bins)
                        .map(|i| {
                            let delta = if i == target { 1.0 } else { 0.0 };
                            (k + i, p_i[i] - delta)
                        })
                        .collect();
                    quadratic_form(theta.view(), &coefficients)
                });
                clamp_squared_uncertainties(&mut d2, self.warning_cutoff);
                Pmf {
                    f_i: p_i.mapv(|p| -p.ln()),
                    df_i: Some(d2.mapv(f64::sqrt)),
                    df_ij: None,
                }
            }
            PmfUncertainties::AllDifferences => {
                let mut d2 = difference_variances(theta.view(), &bins);
                clamp_squared_uncertainties(&mut d2, self.warning_cutoff);
                let f_lowest = f_i[lowest];
                Pmf {
                    f_i: f_i.mapv(|f| f - f_lowest),
                    df_i: None,
                    df_ij: Some(d2.mapv(f64::sqrt)),
                }
            }
        })
    }

    /// Decompose free energy differences into enthalpy and entropy differences.
    ///
    /// Compute the decomposition of the free energy difference between
    /// states 1 and N into reduced free energy differences, reduced potential
    /// (enthalpy) differences, and reduced entropy (S/k) differences.
    ///
    /// `params.u_kn[k, n]`, if given, is the reduced potential energy of sample `n` in sampled
    /// state `k` to average; by default the potentials the estimator was built with are used.
    pub fn compute_entropy_and_enthalpy(
        &self,
        params: ExpectationsParams,
    ) -> Result<EntropyEnthalpy> {
        let ExpectationsParams {
            u_kn,
            uncertainty_method,
        } = params;
        let k = self.k();
        let energies = u_kn.unwrap_or_else(|| self.u_kn.clone());
        if energies.dim() != (k, self.n_tot()) {
            return Err(MBarError::ArrayShapeMismatch(
                energies.dim(),
                (k, self.n_tot()),
            ));
        }

        // Shift so every energy is at least one; differences are unaffected
        let u_min = energies.fold(f64::INFINITY, |m, &u| m.min(u));
        let mut u_i = Array1::zeros(k);
        let mut extra = Vec::with_capacity(k);
        for (l, u_n) in energies.outer_iter().enumerate() {
            let log_w_n = Zip::from(&u_n)
                .and(self.log_w_nk.column(l))
                .map_collect(|&u, &lw| (u - (u_min - 1.0)).ln() + lw);
            let f_u = -logsumexp(log_w_n.view());
            u_i[l] = (-f_u).exp();
            extra.push(log_w_n.mapv(|x| (x + f_u).exp()));
        }

        let theta = self.augmented_theta(&extra, uncertainty_method)?;

        let f_k = &self.f_k;
        let s_i = &u_i - f_k;
        let delta_f = Array2::from_shape_fn((k, k), |(i, j)| f_k[j] - f_k[i]);
        let delta_u = Array2::from_shape_fn((k, k), |(i, j)| u_i[j] - u_i[i]);
        let delta_s = Array2::from_shape_fn((k, k), |(i, j)| s_i[j] - s_i[i]);

        let indices: Vec<usize> = (0..k).collect();
        let mut d2_f = difference_variances(theta.view(), &indices);
        // In terms of ln c: u_i = exp(ln c_{K+i} - ln c_i) and s_i = u_i + ln c_i
        let mut d2_u = Array2::from_shape_fn((k, k), |(i, j)| {
            quadratic_form(
                theta.view(),
                &[
                    (k + j, u_i[j]),
                    (j, -u_i[j]),
                    (k + i, -u_i[i]),
                    (i, u_i[i]),
                ],
            )
        });
        let mut d2_s = Array2::from_shape_fn((k, k), |(i, j)| {
            quadratic_form(
                theta.view(),
                &[
                    (k + j, u_i[j]),
                    (j, 1.0 - u_i[j]),
                    (k + i, -u_i[i]),
                    (i, u_i[i] - 1.0),
                ],
            )
        });
        clamp_squared_uncertainties(&mut d2_f, self.warning_cutoff);
        clamp_squared_uncertainties(&mut d2_u, self.warning_cutoff);
        clamp_squared_uncertainties(&mut d2_s, self.warning_cutoff);

        Ok(EntropyEnthalpy {
            delta_f,
            d_delta_f: d2_f.mapv(f64::sqrt),
            delta_u,
            d_delta_u: d2_u.mapv(f64::sqrt),
            delta_s,
            d_delta_s: d2_s.mapv(f64::sqrt),
        })
    }

    /// Compute the overlap matrix between the sampled states.
    ///
    /// $O_{ij} = N_j \sum_n W_{ni} W_{nj}$ is the probability that a sample drawn from state `i`
    /// would be attributed to state `j`. Each row sums to one, the largest eigenvalue is one,
    /// and one minus the second largest eigenvalue is a scalar measure of overlap: zero when the
    /// states are completely disjoint.
    pub fn compute_overlap(&self) -> Result<Overlap> {
        let k = self.k();
        let n_k = self.n_k_f64();
        let w_nk = self.w_nk();
        let wtw = w_nk.t().dot(&w_nk);

        let matrix = Array2::from_shape_fn((k, k), |(i, j)| wtw[[i, j]] * n_k[j]);

        // O = W'W N is similar to N^1/2 W'W N^1/2, which is symmetric
        let sqrt_n = n_k.mapv(f64::sqrt);
        let symmetric = DMatrix::from_fn(k, k, |i, j| sqrt_n[i] * wtw[[i, j]] * sqrt_n[j]);
        let mut eigenvalues: Vec<f64> = SymmetricEigen::new(symmetric)
            .eigenvalues
            .iter()
            .copied()
            .collect();
        if eigenvalues.iter().any(|x| !x.is_finite()) {
            return Err(MBarError::LinearAlgebra(
                "overlap matrix has non-finite eigenvalues".to_string(),
            ));
        }
        eigenvalues.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let scalar = 1.0 - eigenvalues.get(1).copied().unwrap_or(0.0);

        Ok(Overlap {
            scalar,
            eigenvalues: Array1::from(eigenvalues),
            matrix,
        })
    }

    /// Compute the effective sample number of each state
    ///
    /// The effective sample number $n_\mathrm{eff}(k)$ is an estimate of how many samples are
    /// contributing to the average at a given state.
    ///
    /// # Returns
    ///
    /// `n_eff[k]` is the estimated number of samples contributing to estimates at each
    /// state k. An estimate to how many samples collected just at state k would result
    /// in similar statistical efficiency as the MBAR simulation. Valid for both sampled
    /// states, in which the weight will be greater than `N_k[k]`, and unsampled states.
    ///
    /// # Notes
    ///
    /// Using Kish (1965) formula (Kish, Leslie (1965). Survey Sampling. New York: Wiley)
    ///
    /// As the weights become more concentrated in fewer observations, the effective sample size
    /// shrinks (<http://healthcare-economist.com/2013/08/22/effective-sample-size/>):
    ///
    /// $$
    ///     n_\mathrm{eff}(k)
    ///         =  \frac{(\sum_{n=1}^N w_k n)^2}{\sum_{n=1}^N w_k n^2}
    ///         =  \frac{1}{\sum_{n=1}^N w_k n^2}
    /// $$
    ///
    /// the effective sample number is most useful to diagnose when there are only a few samples
    /// contributing to the averages.
    pub fn n_eff(&self) -> Array1<f64> {
        self.compute_effective_sample_number(false)
    }

    /// Compute the effective sample number of each state, logging the sampling efficiency
    ///
    /// The efficiency is the ratio of the effective number of samples at a given state to the
    /// total number of samples collected. It is logged at info level for each state but not
    /// returned. See [`MBar::n_eff`].
    pub fn n_eff_verbose(&self) -> Array1<f64> {
        self.compute_effective_sample_number(true)
    }

    fn compute_effective_sample_number(&self, verbose: bool) -> Array1<f64> {
        let n_eff = self
            .log_w_nk
            .map_axis(Axis(0), |log_w_n| {
                1.0 / log_w_n.iter().map(|&lw| (2.0 * lw).exp()).sum::<f64>()
            });
        if verbose {
            for (k, &n) in n_eff.iter().enumerate() {
                info!(
                    state = k,
                    n_eff = n,
                    efficiency = n / self.n_tot() as f64,
                    "Effective number of samples"
                );
            }
        }
        n_eff
    }

    /// Calculate the variance of a weighted sum of free energy differences.
    ///
    /// For example,  $\mathrm{Var}(\sum_i a_i df_i)$
    ///
    /// # Parameters
    ///
    /// `d_ij` : a matrix of standard deviations of the quantities f_i - f_j
    /// `k` : The number of states in each 'chunk', has to be constant
    ///
    /// # Returns
    ///
    /// KxK matrix of standard deviations of the sums or differences $\sum_i a_i df_i$
    ///
    /// # Notes
    ///
    /// We explicitly lay out the calculations for four variables (where each variable
    /// is a logarithm of a partition function), then generalize.
    /// The uncertainty in the sum of two weighted differences is
    ///
    /// $$
    /// \begin{aligned}
    ///     \mathrm{Var}(a_1(f_{i1} - f_{j1}) + a_2(f_{i2} - f_{j2})) =&\ a_1^2 \mathrm{Var}(f_{i1} - f_{j1}) \\\\
    ///         & + a_2^2 \mathrm{Var}(f_{i2} - f_{j2}) \\\\
    ///         & + 2 a_1 a_2 \mathrm{cov}(f_{i1} - f_{j1}, f_{i2} - f_{j2})
    /// \end{aligned}
    /// $$
    ///
    /// Since $\mathrm{Var}(x-y) = \mathrm{Var}(x) + \mathrm{Var}(y) - 2 \mathrm{cov}(x,y)$, each
    /// covariance of differences can be written with variances of differences only:
    ///
    /// $$
    /// 2 \mathrm{cov}(a-b,c-d) = - \mathrm{Var}(a-c) + \mathrm{Var}(a-d) + \mathrm{Var}(b-c) - \mathrm{Var}(b-d)
    /// $$
    ///
    /// For $a - b = c - d$ this reduces to $\mathrm{Var}(a-b)$, so the variance of
    /// $\sum_p a_p (f_{i,p} - f_{j,p})$ is the double sum of $a_p a_q \mathrm{cov}$ over all
    /// chunk pairs `p`, `q`. Each chunk is separated from the next by an offset of `k` states.
    pub fn covariance_of_sums(
        &self,
        d_ij: Array2<f64>,
        k: usize,
        a: Array1<f64>,
    ) -> Result<Array2<f64>> {
        let chunks = a.len();
        if d_ij.dim() != (k * chunks, k * chunks) {
            return Err(MBarError::ArrayShapeMismatch(
                d_ij.dim(),
                (k * chunks, k * chunks),
            ));
        }

        let var_ij = d_ij.mapv(|d| d * d);
        let mut d2 = Array2::from_shape_fn((k, k), |(i, j)| {
            let mut total = 0.0;
            for p in 0..chunks {
                for q in 0..chunks {
                    let (ip, jp, iq, jq) = (i + p * k, j + p * k, i + q * k, j + q * k);
                    total += a[p]
                        * a[q]
                        * 0.5
                        * (-var_ij[[ip, iq]] + var_ij[[ip, jq]] + var_ij[[jp, iq]]
                            - var_ij[[jp, jq]]);
                }
            }
            total
        });
        clamp_squared_uncertainties(&mut d2, self.warning_cutoff);
        Ok(d2.mapv(f64::sqrt))
    }
}

/// Method for reporting uncertainties for PMFs
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PmfUncertainties {
    /// The uncertainties in the free energy difference with lowest point on PMF are reported
    FromLowest,
    /// The uncertainties in the free energy difference with the specified state are reported
    FromSpecified(usize),
    /// The normalization $\sum_i p_i = 1$ is used to determine uncertainties spread out through the
    /// PMF. Free energies are reported as $-\ln p_i$.
    FromNormalization,
    /// The nbins × nbins matrix $df_ij$ of uncertainties in free energy differences is returned
    /// instead of $df_i$.
    AllDifferences,
}

impl Default for PmfUncertainties {
    fn default() -> Self {
        Self::FromLowest
    }
}

/// A Potential of Mean Force
#[derive(Debug, Clone)]
pub struct Pmf {
    /// `f_i[i]` is the dimensionless free energy of bin `i`, relative to the reference bin
    /// (the lowest bin unless a reference was specified)
    pub f_i: Array1<f64>,
    /// `df_i[i]` is the uncertainty in the difference of `f_i` for uncertainty options other than AllDifferences
    pub df_i: Option<Array1<f64>>,
    /// `df_ij[i][j]` is the uncertainty in the difference of `f_i` for AllDifferences
    pub df_ij: Option<Array2<f64>>,
}

/// Parameters for computing expectation values
#[derive(Debug, Clone)]
pub struct ExpectationsParams {
    /// `u_kn[k, n]` is the reduced potential of configuration n at state k
    ///
    /// If None (the default) use MBar.u_kn
    pub u_kn: Option<Array2<f64>>,
    /// How to compute uncertainties. Default is SvdEw
    pub uncertainty_method: UncertaintyMethod,
}

impl Default for ExpectationsParams {
    fn default() -> Self {
        Self {
            u_kn: None,
            uncertainty_method: UncertaintyMethod::SvdEw,
        }
    }
}

/// Free energy differences between states
#[derive(Debug, Clone)]
pub struct FreeEnergyDifferences {
    /// `delta_f[i, j]` is the dimensionless free energy difference $f_j - f_i$
    pub delta_f: Array2<f64>,
    /// `d_delta_f[i, j]` is the uncertainty in the dimensionless free energy difference $f_j - f_i$
    pub d_delta_f: Array2<f64>,
    /// Covariance matrix of log weights
    pub theta: Array2<f64>,
}

/// Expectations for a value
#[derive(Debug, Clone)]
pub struct Expectations {
    /// Covariance matrix of log weights
    pub theta: Array2<f64>,
    /// `mu[i]` is the estimate for the expectation of $A(x)$ for thermodynamic state `i`.
    pub mu: Array1<f64>,
    /// `sigma[i]` is the uncertainty estimate at one standard deviation for mu[i]
    pub sigma: Array1<f64>,
}

/// Expectations for a value expressed as differences between states
#[derive(Debug, Clone)]
pub struct DifferencesInExpectation {
    /// Covariance matrix of log weights
    pub theta: Array2<f64>,
    /// `mu[i, j]` is the estimated difference in expectation of $A(x)$ between states `i` and `j`.
    pub mu: Array2<f64>,
    /// `sigma[i, j]` is the uncertainty estimate at one standard deviation for the difference in $A$ beteen `i` and `j`
    pub sigma: Array2<f64>,
}

/// Expectations of several observables at a single state
#[derive(Debug, Clone)]
pub struct MultipleExpectations {
    /// Covariance matrix of log weights
    pub theta: Array2<f64>,
    /// `mu[i]` is the expectation of observable `i`
    pub mu: Array1<f64>,
    /// `sigma[i]` is the uncertainty of `mu[i]` at one standard deviation
    pub sigma: Array1<f64>,
    /// `covariance[i, j]` is the covariance of the estimates `mu[i]` and `mu[j]`
    pub covariance: Array2<f64>,
}

/// Result of [`MBar::compute_expectations_inner`]
#[derive(Debug, Clone)]
pub struct ExpectationsInner {
    /// `observables[s]` is the expectation for entry `s` of the state map
    pub observables: Array1<f64>,
    /// `free_energies[l]` is the dimensionless free energy of target state `l`, in the same
    /// reference as [`MBar::f_k`]
    pub free_energies: Array1<f64>,
    /// Covariance of the estimates in `observables`
    pub covariance: Array2<f64>,
    /// Covariance matrix of log weights over sampled states, target states and observables
    pub theta: Array2<f64>,
}

/// Free energy differences decomposed into enthalpy and entropy
#[derive(Debug, Clone)]
pub struct EntropyEnthalpy {
    /// `delta_f[i, j]` is the dimensionless free energy difference $f_j - f_i$
    pub delta_f: Array2<f64>,
    /// `d_delta_f[i, j]` is the uncertainty in the dimensionless free energy difference $f_j - f_i$
    pub d_delta_f: Array2<f64>,
    /// `delta_u[i, j]` is the reduced potential energy difference $u_j - u_i$
    pub delta_u: Array2<f64>,
    /// `d_delta_u[i, j]` is the uncertainty in the reduced potential energy difference $u_j - u_i$
    pub d_delta_u: Array2<f64>,
    /// `delta_s[i, j]` is the reduced entropy difference $S_j/k_b - S_i/k_b$
    pub delta_s: Array2<f64>,
    /// `d_delta_s[i, j]` is the uncertainty in the reduced entropy difference $S_j/k_b - S_i/k_b$
    pub d_delta_s: Array2<f64>,
}

/// Overlap between sampled states
#[derive(Debug, Clone)]
pub struct Overlap {
    /// One minus the second largest eigenvalue of `matrix`
    pub scalar: f64,
    /// Eigenvalues of `matrix` in descending order
    pub eigenvalues: Array1<f64>,
    /// `matrix[i, j]` is the overlap of state `i` with state `j`
    pub matrix: Array2<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn small_u_kn() -> Array2<f64> {
        array![
            [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
            [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
            [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
        ]
    }

    fn small_mbar() -> MBar {
        MBarBuilder::default()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 2])
            .relative_tolerance(1e-12)
            .build()
            .unwrap()
    }

    #[test]
    fn build_mbar() {
        let mbar = MBarBuilder::default()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 2])
            .build_inner()
            .unwrap();

        assert_eq!(mbar.u_kn, small_u_kn());
        assert_eq!(mbar.n_k, array![2, 2, 2]);
        assert_eq!(mbar.maximum_iterations, 1000);
        assert_eq!(mbar.relative_tolerance, 1.0e-7);
        assert_eq!(mbar.verbose, false);
        assert_eq!(mbar.initial_free_energies, InitialFreeEnergies::Zeros);
        assert_eq!(mbar.x_kindices, None);
        assert_eq!(mbar.solver, SolverMethod::Adaptive);
    }

    #[test]
    fn init_mbar() {
        let mbar = small_mbar();
        assert_eq!(mbar.f_k().len(), 3);
        assert_eq!(mbar.f_k()[0], 0.0);
        assert_eq!(mbar.log_w_nk().dim(), (6, 3));

        let n_k = mbar.n_k_f64();
        crate::utils::check_w_normalized(mbar.w_nk().view(), n_k.view(), 1e-8).unwrap();
    }

    #[test]
    fn validation_rejects_inconsistent_counts() {
        let wrong_sum = MBar::builder()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 1])
            .build();
        assert!(matches!(wrong_sum, Err(MBarError::BuilderError(_))));

        let wrong_len = MBar::builder()
            .u_kn(small_u_kn())
            .n_k(array![3, 3])
            .build();
        assert!(matches!(wrong_len, Err(MBarError::BuilderError(_))));

        let bad_indices = MBar::builder()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 2])
            .x_kindices(array![0, 0, 1, 1, 1, 2])
            .build();
        assert!(matches!(bad_indices, Err(MBarError::BuilderError(_))));

        let bad_guess = MBar::builder()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 2])
            .initial_free_energies(InitialFreeEnergies::from(&[0.0, 1.0][..]))
            .build();
        assert!(matches!(bad_guess, Err(MBarError::BuilderError(_))));
    }

    #[test]
    fn initial_guesses_converge_to_same_answer() {
        let zeros = small_mbar();
        let from_bar = MBar::builder()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 2])
            .relative_tolerance(1e-12)
            .initial_free_energies(InitialFreeEnergies::BAR)
            .build()
            .unwrap();
        let from_guess = MBar::builder()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 2])
            .relative_tolerance(1e-12)
            .initial_free_energies(InitialFreeEnergies::Specified(vec![0.0, 1.0, -1.0]))
            .build()
            .unwrap();

        for k in 0..3 {
            assert_abs_diff_eq!(zeros.f_k()[k], from_bar.f_k()[k], epsilon = 1e-7);
            assert_abs_diff_eq!(zeros.f_k()[k], from_guess.f_k()[k], epsilon = 1e-7);
        }
    }

    #[test]
    fn shuffled_samples_with_x_kindices() {
        // Same samples as small_u_kn, with the state of origin given explicitly
        let mbar = MBar::builder()
            .u_kn(small_u_kn())
            .n_k(array![2, 2, 2])
            .x_kindices(array![2, 0, 1, 0, 2, 1])
            .initial_free_energies(InitialFreeEnergies::BAR)
            .relative_tolerance(1e-12)
            .build()
            .unwrap();
        let reference = small_mbar();
        for k in 0..3 {
            assert_abs_diff_eq!(mbar.f_k()[k], reference.f_k()[k], epsilon = 1e-7);
        }
        assert_eq!(mbar.x_kindices(), Some(&array![2, 0, 1, 0, 2, 1]));
        assert_eq!(reference.x_kindices(), None);
    }

    #[test]
    fn free_energy_differences_are_antisymmetric() {
        let mbar = small_mbar();
        let result = mbar.free_energy_differences(UncertaintyMethod::SvdEw).unwrap();
        for i in 0..3 {
            assert_eq!(result.delta_f[[i, i]], 0.0);
            assert_abs_diff_eq!(result.d_delta_f[[i, i]], 0.0, epsilon = 1e-6);
            for j in 0..3 {
                assert_abs_diff_eq!(result.delta_f[[i, j]], -result.delta_f[[j, i]]);
                assert_abs_diff_eq!(
                    result.d_delta_f[[i, j]],
                    result.d_delta_f[[j, i]],
                    epsilon = 1e-10
                );
            }
        }
    }

    #[test]
    fn perturbing_to_sampled_states_reproduces_free_energies() {
        let mbar = small_mbar();
        let direct = mbar.free_energy_differences(UncertaintyMethod::SvdEw).unwrap();
        let perturbed = mbar
            .compute_perturbed_free_energies(small_u_kn().view(), UncertaintyMethod::SvdEw)
            .unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(
                    perturbed.delta_f[[i, j]],
                    direct.delta_f[[i, j]],
                    epsilon = 1e-8
                );
                assert_abs_diff_eq!(
                    perturbed.d_delta_f[[i, j]],
                    direct.d_delta_f[[i, j]],
                    epsilon = 1e-5
                );
            }
        }
    }

    #[test]
    fn expectation_of_constant_is_exact() {
        let mbar = small_mbar();
        let a_n = Array1::from_elem(6, 3.5);
        let result = mbar.expectations(&a_n, ExpectationsParams::default()).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(result.mu[k], 3.5, epsilon = 1e-10);
            assert_abs_diff_eq!(result.sigma[k], 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn expectations_match_weighted_averages() {
        let mbar = small_mbar();
        let a_n = array![0.5, -1.0, 2.0, 3.0, 0.0, 1.5];
        let result = mbar.expectations(&a_n, ExpectationsParams::default()).unwrap();
        let direct = mbar.w_nk().t().dot(&a_n);
        for k in 0..3 {
            assert_abs_diff_eq!(result.mu[k], direct[k], epsilon = 1e-10);
        }

        let differences = mbar
            .differences_in_expectation(&a_n, ExpectationsParams::default())
            .unwrap();
        assert_abs_diff_eq!(differences.mu[[0, 2]], direct[2] - direct[0], epsilon = 1e-10);
    }

    #[test]
    fn state_dependent_observable_must_match_states() {
        let mbar = small_mbar();
        let a_ln = Array2::zeros((2, 6));
        assert!(matches!(
            mbar.expectations(&a_ln, ExpectationsParams::default()),
            Err(MBarError::ArrayShapeMismatch(_, _))
        ));
    }

    #[test]
    fn inner_rejects_bad_state_map() {
        let mbar = small_mbar();
        let a_in = Array2::zeros((1, 6));
        let result = mbar.compute_expectations_inner(
            a_in.view(),
            small_u_kn().view(),
            &[(1, 0)],
            UncertaintyMethod::SvdEw,
        );
        assert!(matches!(result, Err(MBarError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn pmf_rejects_empty_bins() {
        let mbar = small_mbar();
        let u_n = small_u_kn().row(0).to_vec();
        let result = mbar.compute_pmf(&u_n, &[0, 0, 2, 2, 0, 2], 3, PmfUncertainties::FromLowest);
        assert!(matches!(result, Err(MBarError::EmptyBin(1))));

        let out_of_range =
            mbar.compute_pmf(&u_n, &[0, 1, 2, 3, 0, 1], 3, PmfUncertainties::FromLowest);
        assert!(matches!(out_of_range, Err(MBarError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn pmf_uncertainty_modes_agree_on_free_energies() {
        let mbar = small_mbar();
        let u_n = small_u_kn().row(0).to_vec();
        let bin_n = [0, 1, 2, 0, 2, 1];

        let lowest = mbar
            .compute_pmf(&u_n, &bin_n, 3, PmfUncertainties::FromLowest)
            .unwrap();
        let specified = mbar
            .compute_pmf(&u_n, &bin_n, 3, PmfUncertainties::FromSpecified(1))
            .unwrap();
        let all = mbar
            .compute_pmf(&u_n, &bin_n, 3, PmfUncertainties::AllDifferences)
            .unwrap();
        let normalized = mbar
            .compute_pmf(&u_n, &bin_n, 3, PmfUncertainties::FromNormalization)
            .unwrap();

        assert_abs_diff_eq!(specified.f_i[1], 0.0);
        assert_eq!(specified.df_i.as_ref().unwrap()[1], 0.0);
        let p_sum: f64 = normalized.f_i.iter().map(|f| (-f).exp()).sum();
        assert_abs_diff_eq!(p_sum, 1.0, epsilon = 1e-12);

        for i in 0..3 {
            assert_abs_diff_eq!(lowest.f_i[i], all.f_i[i], epsilon = 1e-12);
            assert_abs_diff_eq!(
                specified.f_i[i] - specified.f_i[0],
                lowest.f_i[i] - lowest.f_i[0],
                epsilon = 1e-12
            );
            assert_abs_diff_eq!(
                normalized.f_i[i] - normalized.f_i[0],
                lowest.f_i[i] - lowest.f_i[0],
                epsilon = 1e-12
            );
        }
        assert!(all.df_ij.is_some() && all.df_i.is_none());
    }

    #[test]
    fn pmf_uncertainties_match_augmented_covariance() {
        let mbar = small_mbar();
        let u_n = small_u_kn().row(2).to_owned();
        let bin_n = [0, 1, 2, 0, 2, 1];
        let n_bins = 3;
        let k = mbar.k();

        // Normalized weights of each bin, built independently of compute_pmf
        let w_n = mbar.unnormalized_log_weights(u_n.view()).mapv(f64::exp);
        let extra: Vec<Array1<f64>> = (0..n_bins)
            .map(|i| {
                let in_bin: Array1<f64> = w_n
                    .iter()
                    .zip(&bin_n)
                    .map(|(&w, &bin)| if bin == i { w } else { 0.0 })
                    .collect();
                let total = in_bin.sum();
                in_bin / total
            })
            .collect();
        let theta = mbar
            .augmented_theta(&extra, UncertaintyMethod::SvdEw)
            .unwrap();
        let bins: Vec<usize> = (k..k + n_bins).collect();
        let expected_d2 = difference_variances(theta.view(), &bins);

        let u_n = u_n.to_vec();
        let specified = mbar
            .compute_pmf(&u_n, &bin_n, n_bins, PmfUncertainties::FromSpecified(2))
            .unwrap();
        let df_i = specified.df_i.unwrap();
        for i in 0..n_bins {
            assert_abs_diff_eq!(df_i[i], expected_d2[[i, 2]].max(0.0).sqrt(), epsilon = 1e-8);
        }

        let all = mbar
            .compute_pmf(&u_n, &bin_n, n_bins, PmfUncertainties::AllDifferences)
            .unwrap();
        let df_ij = all.df_ij.unwrap();
        for i in 0..n_bins {
            for j in 0..n_bins {
                assert_abs_diff_eq!(
                    df_ij[[i, j]],
                    expected_d2[[i, j]].max(0.0).sqrt(),
                    epsilon = 1e-8
                );
            }
        }

        let normalized = mbar
            .compute_pmf(&u_n, &bin_n, n_bins, PmfUncertainties::FromNormalization)
            .unwrap();
        let p_i = normalized.f_i.mapv(|f| (-f).exp());
        let df_i = normalized.df_i.unwrap();
        for target in 0..n_bins {
            let coefficients: Vec<(usize, f64)> = (0..n_bins)
                .map(|i| (k + i, if i == target { p_i[i] - 1.0 } else { p_i[i] }))
                .collect();
            let expected = quadratic_form(theta.view(), &coefficients).max(0.0).sqrt();
            assert_abs_diff_eq!(df_i[target], expected, epsilon = 1e-8);
        }
    }

    #[test]
    fn overlap_of_identical_states_is_uniform() {
        let u_n = array![0.1, 0.4, 1.3, 0.2, 0.8, 2.0, 0.5, 0.9];
        let mut u_kn = Array2::zeros((4, 8));
        for mut row in u_kn.outer_iter_mut() {
            row.assign(&u_n);
        }
        let mbar = MBar::builder()
            .u_kn(u_kn)
            .n_k(array![2, 2, 2, 2])
            .build()
            .unwrap();

        let overlap = mbar.compute_overlap().unwrap();
        for &o in overlap.matrix.iter() {
            assert_abs_diff_eq!(o, 0.25, epsilon = 1e-10);
        }
        assert_abs_diff_eq!(overlap.eigenvalues[0], 1.0, epsilon = 1e-10);
        for &lambda in overlap.eigenvalues.iter().skip(1) {
            assert_abs_diff_eq!(lambda, 0.0, epsilon = 1e-10);
        }
        assert_abs_diff_eq!(overlap.scalar, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn covariance_of_sums_matches_direct_variance() {
        let mbar = small_mbar();
        // Covariance of six log partition functions: two chunks of three states
        let cov: Array2<f64> = array![
            [2.0, 0.3, 0.1, 0.2, 0.0, 0.1],
            [0.3, 1.5, 0.2, 0.1, 0.3, 0.0],
            [0.1, 0.2, 1.0, 0.0, 0.1, 0.2],
            [0.2, 0.1, 0.0, 1.2, 0.2, 0.1],
            [0.0, 0.3, 0.1, 0.2, 0.9, 0.3],
            [0.1, 0.0, 0.2, 0.1, 0.3, 1.1],
        ];
        let d_ij = Array2::from_shape_fn((6, 6), |(i, j)| {
            (cov[[i, i]] + cov[[j, j]] - 2.0 * cov[[i, j]]).sqrt()
        });
        let a = array![1.0, -0.5];

        let result = mbar.covariance_of_sums(d_ij, 3, a.clone()).unwrap();

        for i in 0..3 {
            for j in 0..3 {
                let mut c = Array1::zeros(6);
                for p in 0..2 {
                    c[i + 3 * p] += a[p];
                    c[j + 3 * p] -= a[p];
                }
                let direct = c.dot(&cov.dot(&c));
                assert_abs_diff_eq!(result[[i, j]], direct.sqrt(), epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn effective_sample_number_is_bounded() {
        let mbar = small_mbar();
        for &n in mbar.n_eff().iter() {
            assert!(n >= 1.0 - 1e-10 && n <= 6.0 + 1e-10);
        }
    }
}
