//! Toy systems with analytically known free energies and expectations, for testing estimators.
//!
//! Each state `k` of a test case is a one-dimensional distribution with reduced potential
//! $u_k(x)$. Samples can be drawn from every state and evaluated at all states, in either the
//! concatenated `u_kn` layout used by [`MBar`](crate::mbar::MBar) or the padded `u_kln` layout.

use crate::errors::*;
use ndarray::{array, Array1, Array2, Array3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use std::f64::consts::PI;
use std::str::FromStr;
use tracing::debug;

/// Named observables with closed-form expectations in every state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticalObservable {
    /// $\langle x \rangle$
    Position,
    /// $\langle x^2 \rangle$
    PositionSquared,
    /// $\sqrt{\langle (x - \langle x \rangle)^2 \rangle}$
    RmsDeviation,
    /// $\langle u_k(x) \rangle$, the reduced potential energy of the state itself
    PotentialEnergy,
}

impl FromStr for AnalyticalObservable {
    type Err = MBarError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "position" => Ok(Self::Position),
            "position^2" => Ok(Self::PositionSquared),
            "RMS deviation" => Ok(Self::RmsDeviation),
            "potential energy" => Ok(Self::PotentialEnergy),
            other => Err(MBarError::UnknownObservable(other.to_string())),
        }
    }
}

/// A sample from a test case
#[derive(Debug)]
pub struct Sample {
    /// `x_n[n]` is sample n (in concatenated indexing)
    pub x_n: Array1<f64>,
    /// `u_kn[k,n]` is the reduced potential of sample n (in concatenated indexing) evaluated at state k.
    pub u_kn: Array2<f64>,
    /// `n_k[k]` is the number of samples generated from state k
    pub n_k: Array1<usize>,
    /// `s_n[n]` is the state of origin of `x_n[n]`
    pub s_n: Array1<usize>,
}

/// A sample from a test case in padded, per-state layout
#[derive(Debug)]
pub struct SampleKln {
    /// `x_kn[k, n]` is sample `n` from state `k`; entries past `n_k[k]` are zero
    pub x_kn: Array2<f64>,
    /// `u_kln[k, l, n]` is the reduced potential of sample `n` from state `k` evaluated at state `l`
    pub u_kln: Array3<f64>,
    /// `n_k[k]` is the number of samples generated from state k
    pub n_k: Array1<usize>,
}

/// A family of states with known analytical properties
pub trait TestCase {
    /// Number of thermodynamic states
    fn n_states(&self) -> usize;

    /// Reduced potential of configuration `x` in state `k`
    fn reduced_potential(&self, k: usize, x: f64) -> f64;

    /// Draw one configuration from state `k`
    fn draw<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> f64;

    /// Mean position of each state
    fn analytical_means(&self) -> Array1<f64>;

    /// Variance of the position in each state
    fn analytical_variances(&self) -> Array1<f64>;

    /// Dimensionless free energies $f_k = -\ln Z_k$, optionally relative to state
    /// `subtract_component`
    fn analytical_free_energies(&self, subtract_component: Option<usize>) -> Array1<f64>;

    /// Expectation of `observable` in each state
    fn analytical_observable(&self, observable: AnalyticalObservable) -> Array1<f64>;

    /// Standard deviation of the position in each state
    fn analytical_standard_deviations(&self) -> Array1<f64> {
        self.analytical_variances().mapv(f64::sqrt)
    }

    /// Reduced entropies $s_k = \langle u_k \rangle - f_k$
    fn analytical_entropies(&self, subtract_component: Option<usize>) -> Array1<f64> {
        self.analytical_observable(AnalyticalObservable::PotentialEnergy)
            - self.analytical_free_energies(subtract_component)
    }

    /// Draw `n_k[k]` samples from each state `k` using `rng`, in concatenated layout
    fn sample_from_rng<R: Rng + ?Sized>(&self, n_k: Array1<usize>, rng: &mut R) -> Result<Sample> {
        let k = self.n_states();
        if n_k.len() != k {
            return Err(MBarError::ArrayLengthMismatch(n_k.len(), k));
        }
        let n_tot: usize = n_k.sum();

        let mut x_n = Array1::zeros(n_tot);
        let mut s_n = Array1::zeros(n_tot);
        let mut n = 0;
        for (state, &count) in n_k.iter().enumerate() {
            for _ in 0..count {
                x_n[n] = self.draw(state, rng);
                s_n[n] = state;
                n += 1;
            }
        }
        let u_kn = Array2::from_shape_fn((k, n_tot), |(l, n)| self.reduced_potential(l, x_n[n]));
        debug!(n_states = k, n_tot, "Sampled test case");

        Ok(Sample {
            x_n,
            u_kn,
            n_k,
            s_n,
        })
    }

    /// Draw `n_k[k]` samples from each state `k` using `rng`, in padded `u_kln` layout
    fn sample_kln_from_rng<R: Rng + ?Sized>(
        &self,
        n_k: Array1<usize>,
        rng: &mut R,
    ) -> Result<SampleKln> {
        let k = self.n_states();
        if n_k.len() != k {
            return Err(MBarError::ArrayLengthMismatch(n_k.len(), k));
        }
        let n_max = n_k.iter().copied().max().unwrap_or(0);

        let mut x_kn = Array2::zeros((k, n_max));
        let mut u_kln = Array3::zeros((k, k, n_max));
        for (state, &count) in n_k.iter().enumerate() {
            for n in 0..count {
                let x = self.draw(state, rng);
                x_kn[[state, n]] = x;
                for l in 0..k {
                    u_kln[[state, l, n]] = self.reduced_potential(l, x);
                }
            }
        }

        Ok(SampleKln { x_kn, u_kln, n_k })
    }

    /// Draw samples from the distribution with a random seed
    fn sample(&self, n_k: Array1<usize>) -> Result<Sample> {
        let mut rng = SmallRng::seed_from_u64(rand::rng().random());
        self.sample_from_rng(n_k, &mut rng)
    }

    /// Draw samples from the distribution with a specified seed
    fn sample_with_seed(&self, n_k: Array1<usize>, seed: u64) -> Result<Sample> {
        let mut rng = SmallRng::seed_from_u64(seed);
        self.sample_from_rng(n_k, &mut rng)
    }

    /// Draw samples in `u_kln` layout, seeded if `seed` is given
    fn sample_kln(&self, n_k: Array1<usize>, seed: Option<u64>) -> Result<SampleKln> {
        let seed = seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = SmallRng::seed_from_u64(seed);
        self.sample_kln_from_rng(n_k, &mut rng)
    }
}

fn subtract(mut f_k: Array1<f64>, subtract_component: Option<usize>) -> Array1<f64> {
    if let Some(reference) = subtract_component.and_then(|i| f_k.get(i).copied()) {
        f_k.mapv_inplace(|f| f - reference);
    }
    f_k
}

/// Test cases using harmonic oscillators.
///
/// State `k` has reduced potential $u_k(x) = \beta K_k (x - O_k)^2 / 2$, so $x$ is normally
/// distributed with mean $O_k$ and variance $1 / (\beta K_k)$.
///
/// # Examples
///
/// Generate energy samples with default parameters.
///
/// ```
/// use mbar_rs::testsystems::*;
/// use ndarray::array;
///
/// let testcase = HarmonicOscillator::default();
/// let Sample {x_n, u_kn, n_k, s_n} = testcase.sample(array![10, 20, 30, 40, 50]).unwrap();
/// assert_eq!(u_kn.dim(), (5, 150));
///
/// let x_squared = testcase.analytical_observable(AnalyticalObservable::PositionSquared);
/// ```
///
/// Generate energy samples with specified parameters.
///
/// ```
/// use mbar_rs::testsystems::*;
/// use ndarray::array;
///
/// let testcase = HarmonicOscillator::builder()
///     .o_k(array![0.0, 1.0, 2.0, 3.0, 4.0])
///     .k_k(array![1.0, 2.0, 4.0, 8.0, 16.0])
///     .build()
///     .unwrap();
/// let SampleKln {x_kn, u_kln, n_k} = testcase.sample_kln(array![10, 20, 30, 40, 50], Some(1)).unwrap();
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct HarmonicOscillator {
    /// Offset parameters for each state.
    #[builder(default = "array![0.0, 1.0, 2.0, 3.0, 4.0]")]
    o_k: Array1<f64>,

    /// Force constants for each state.
    #[builder(default = "array![1.0, 2.0, 4.0, 8.0, 16.0]")]
    k_k: Array1<f64>,

    /// Inverse temperature
    #[builder(default = "1.0")]
    beta: f64,

    #[builder(setter(skip), default = "Vec::new()")]
    distributions: Vec<Normal<f64>>,
}

impl HarmonicOscillatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(o_k), Some(k_k)) = (&self.o_k, &self.k_k) {
            if o_k.len() != k_k.len() {
                return Err(format!(
                    "o_k and k_k must have equal lengths (not {} and {})",
                    o_k.len(),
                    k_k.len()
                ));
            }
        }
        if let Some(k_k) = &self.k_k {
            if k_k.iter().any(|&k| !(k > 0.0)) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(beta) = self.beta {
            if !(beta > 0.0) {
                return Err("beta must be positive".to_string());
            }
        }

        Ok(())
    }

    /// Build the test case
    pub fn build(&self) -> Result<HarmonicOscillator> {
        self.build_inner()?.init()
    }
}

impl HarmonicOscillator {
    fn init(mut self) -> Result<Self> {
        self.distributions = self
            .o_k
            .iter()
            .zip(self.analytical_standard_deviations().iter())
            .map(|(&mean, &sigma)| {
                Normal::new(mean, sigma).map_err(|e| MBarError::InvalidParameter(e.to_string()))
            })
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Get a new builder for the `HarmonicOscillator` struct.
    pub fn builder() -> HarmonicOscillatorBuilder {
        HarmonicOscillatorBuilder::default()
    }

    /// Offset of each state
    pub fn o_k(&self) -> &Array1<f64> {
        &self.o_k
    }

    /// Force constant of each state
    pub fn k_k(&self) -> &Array1<f64> {
        &self.k_k
    }

    /// Inverse temperature
    pub fn beta(&self) -> f64 {
        self.beta
    }
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("HarmonicOscillator should not fail with default params")
    }
}

impl TestCase for HarmonicOscillator {
    fn n_states(&self) -> usize {
        self.o_k.len()
    }

    fn reduced_potential(&self, k: usize, x: f64) -> f64 {
        0.5 * self.beta * self.k_k[k] * (x - self.o_k[k]).powi(2)
    }

    fn draw<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> f64 {
        self.distributions[k].sample(rng)
    }

    fn analytical_means(&self) -> Array1<f64> {
        self.o_k.clone()
    }

    fn analytical_variances(&self) -> Array1<f64> {
        self.k_k.mapv(|k| 1.0 / (self.beta * k))
    }

    fn analytical_free_energies(&self, subtract_component: Option<usize>) -> Array1<f64> {
        let f_k = self.k_k.mapv(|k| -0.5 * (2.0 * PI / (self.beta * k)).ln());
        subtract(f_k, subtract_component)
    }

    fn analytical_observable(&self, observable: AnalyticalObservable) -> Array1<f64> {
        match observable {
            AnalyticalObservable::Position => self.analytical_means(),
            AnalyticalObservable::PositionSquared => {
                self.analytical_variances() + self.o_k.mapv(|o| o * o)
            }
            AnalyticalObservable::RmsDeviation => self.analytical_standard_deviations(),
            AnalyticalObservable::PotentialEnergy => Array1::from_elem(self.n_states(), 0.5),
        }
    }
}

/// Test cases using exponential distributions.
///
/// State `k` has reduced potential $u_k(x) = \lambda_k x$ on $x \geq 0$, so $x$ is exponentially
/// distributed with rate $\lambda_k$ and $f_k = \ln \lambda_k$.
///
/// ```
/// use mbar_rs::testsystems::*;
/// use ndarray::array;
///
/// let testcase = Exponential::builder().rates(array![1.0, 2.0, 3.0]).build().unwrap();
/// let sample = testcase.sample_with_seed(array![5, 5, 5], 7).unwrap();
/// assert!(sample.x_n.iter().all(|&x| x >= 0.0));
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", name = "build_inner", private))]
pub struct Exponential {
    /// Rate parameter $\lambda_k$ of each state
    #[builder(default = "array![1.0, 2.0, 3.0, 4.0, 5.0]")]
    rates: Array1<f64>,

    #[builder(setter(skip), default = "Vec::new()")]
    distributions: Vec<Exp<f64>>,
}

impl ExponentialBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(rates) = &self.rates {
            if rates.iter().any(|&rate| !(rate > 0.0)) {
                return Err("rates must be positive".to_string());
            }
        }
        Ok(())
    }

    /// Build the test case
    pub fn build(&self) -> Result<Exponential> {
        self.build_inner()?.init()
    }
}

impl Exponential {
    fn init(mut self) -> Result<Self> {
        self.distributions = self
            .rates
            .iter()
            .map(|&rate| Exp::new(rate).map_err(|e| MBarError::InvalidParameter(e.to_string())))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Get a new builder for the `Exponential` struct.
    pub fn builder() -> ExponentialBuilder {
        ExponentialBuilder::default()
    }

    /// Rate parameter of each state
    pub fn rates(&self) -> &Array1<f64> {
        &self.rates
    }
}

impl Default for Exponential {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Exponential should not fail with default params")
    }
}

impl TestCase for Exponential {
    fn n_states(&self) -> usize {
        self.rates.len()
    }

    fn reduced_potential(&self, k: usize, x: f64) -> f64 {
        self.rates[k] * x
    }

    fn draw<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> f64 {
        self.distributions[k].sample(rng)
    }

    fn analytical_means(&self) -> Array1<f64> {
        self.rates.mapv(|rate| 1.0 / rate)
    }

    fn analytical_variances(&self) -> Array1<f64> {
        self.rates.mapv(|rate| 1.0 / (rate * rate))
    }

    fn analytical_free_energies(&self, subtract_component: Option<usize>) -> Array1<f64> {
        subtract(self.rates.mapv(f64::ln), subtract_component)
    }

    fn analytical_observable(&self, observable: AnalyticalObservable) -> Array1<f64> {
        match observable {
            AnalyticalObservable::Position => self.analytical_means(),
            AnalyticalObservable::PositionSquared => self.rates.mapv(|rate| 2.0 / (rate * rate)),
            AnalyticalObservable::RmsDeviation => self.analytical_standard_deviations(),
            AnalyticalObservable::PotentialEnergy => Array1::from_elem(self.n_states(), 1.0),
        }
    }
}
