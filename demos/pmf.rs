use anyhow::Result;
use itertools::Itertools;
use mbar_rs::mbar::*;
use mbar_rs::testsystems::*;
use ndarray::{array, s, Array1, Axis};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

/// Produce a sorted copy of an array
fn sorted(s: &Array1<f64>) -> Array1<f64> {
    let mut new = s.to_vec();
    new.sort_by(|a, b| a.partial_cmp(b).expect("Tried to compare a NaN"));
    Array1::from(new)
}

/// Return the indices of the bins to which each value in input array belongs.
fn digitise<T: PartialOrd>(x_n: &[T], bin_edges: &[T]) -> Vec<usize> {
    x_n.iter()
        .map(|x| {
            bin_edges
                .iter()
                .enumerate()
                .find_map(|(i, left)| if x < left { Some(i - 1) } else { None })
        })
        .map(|opt| opt.expect("Value didn't get a bin"))
        .collect()
}

/// Each `-v` on the command line raises the log level by one step from `WARN`
fn setup_logging() {
    let verbosity = std::env::args().filter(|arg| arg == "-v").count();
    let level_filter = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::registry()
        .with(level_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
        .init();
}

/// Exact reduced free energy of confining state `k` of `testcase` to `[left, right)`,
/// by midpoint quadrature of the Boltzmann factor
fn analytical_bin_free_energy(testcase: &HarmonicOscillator, k: usize, left: f64, right: f64) -> f64 {
    let steps = 2000;
    let dx = (right - left) / steps as f64;
    let z: f64 = (0..steps)
        .map(|i| (-testcase.reduced_potential(k, left + (i as f64 + 0.5) * dx)).exp() * dx)
        .sum();
    -z.ln()
}

fn main() -> Result<()> {
    setup_logging();

    let testcase = HarmonicOscillator::default();
    let state = 0;

    let Sample {
        x_n,
        u_kn,
        n_k,
        s_n,
    } = testcase.sample(array![100, 200, 300, 400, 500])?;

    println!("Samples per state: {}", n_k);

    let mbar = MBar::builder()
        .u_kn(u_kn.clone())
        .n_k(n_k)
        .x_kindices(s_n)
        .initial_free_energies(InitialFreeEnergies::BAR)
        .build_verbose()?;

    let overlap = mbar.compute_overlap()?;
    println!("Overlap scalar: {:.4}", overlap.scalar);

    // Divide x_n into equally populated bins
    let n_bins = 10;
    let n_tot = x_n.len();
    let x_n_sorted = sorted(&x_n);
    let bin_size = n_tot / n_bins;
    let mut bin_edges = x_n_sorted.slice(s![..;bin_size]).to_vec();
    bin_edges.truncate(n_bins);
    bin_edges.push(x_n_sorted[n_tot - 1] + 0.001);

    let bin_n = digitise(&x_n.to_vec(), &bin_edges);

    let pmf = mbar.compute_pmf(
        &u_kn.index_axis(Axis(0), state).to_vec(),
        &bin_n,
        n_bins,
        PmfUncertainties::FromLowest,
    )?;
    let df_i = pmf
        .df_i
        .ok_or_else(|| anyhow::anyhow!("from-lowest PMF has per-bin uncertainties"))?;

    let f_exact: Array1<f64> = bin_edges
        .iter()
        .tuple_windows()
        .map(|(&left, &right)| analytical_bin_free_energy(&testcase, state, left, right))
        .collect();
    let lowest = pmf
        .f_i
        .iter()
        .position(|&f| f == 0.0)
        .unwrap_or(0);
    let f_exact = &f_exact - f_exact[lowest];

    println!(
        "{:>10} {:>10} {:>10} {:>10} {:>10} {:>8}",
        "left", "right", "f", "df", "exact", "z"
    );
    for (i, (left, right)) in bin_edges.iter().tuple_windows().enumerate() {
        let z = if df_i[i] > 0.0 {
            (pmf.f_i[i] - f_exact[i]) / df_i[i]
        } else {
            0.0
        };
        println!(
            "{:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>8.2}",
            left, right, pmf.f_i[i], df_i[i], f_exact[i], z
        );
    }

    // Correct for unequally spaced bins to get a PMF on uniform measure
    let f_i_corrected: Vec<_> = pmf
        .f_i
        .iter()
        .zip(bin_edges.iter().tuple_windows())
        .map(|(f, (left, right))| f + (right - left).abs().ln())
        .collect();
    println!("PMF per unit length: {:.4?}", f_i_corrected);

    Ok(())
}
