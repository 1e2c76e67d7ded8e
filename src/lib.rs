#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! The multistate Bennett acceptance ratio (MBAR) method for the analysis of equilibrium samples
//! from multiple arbitrary thermodynamic states in computing equilibrium expectations, free energy
//! differences, potentials of mean force, and entropy and enthalpy contributions.
//!
//! Please reference the following if you use this code in your research:
//!
//! [1] Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
//! equilibrium states. J. Chem. Phys. 129:124105, 2008. <http://dx.doi.org/10.1063/1.2978177>
//!
//! # Example
//!
//! ```
//! use mbar_rs::*;
//! use mbar_rs::testsystems::{HarmonicOscillator, Sample, TestCase};
//! use ndarray::array;
//!
//! let testcase = HarmonicOscillator::default();
//! let Sample { x_n, u_kn, n_k, .. } = testcase
//!     .sample_with_seed(array![100, 100, 100, 100, 100], 0)
//!     .unwrap();
//!
//! let mbar = MBar::builder().u_kn(u_kn).n_k(n_k).build().unwrap();
//! let results = mbar.free_energy_differences(UncertaintyMethod::SvdEw).unwrap();
//! let position = mbar.expectations(&x_n, ExpectationsParams::default()).unwrap();
//! assert_eq!(results.delta_f.dim(), (5, 5));
//! assert_eq!(position.mu.len(), 5);
//! ```

#[macro_use]
extern crate derive_builder;

pub mod bar;
pub mod covariance;
pub mod errors;
pub mod mbar;
pub mod solvers;
pub mod testsystems;
pub mod utils;

pub use crate::covariance::UncertaintyMethod;
pub use crate::errors::{MBarError, Result};
pub use crate::mbar::*;
pub use crate::solvers::SolverMethod;
