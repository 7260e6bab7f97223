//! # Utilities
//!
//! Shared numerics for the models and the sampler: faer linear solves,
//! Cholesky factors, order statistics, and standard-normal draws.

use faer::Mat;
use faer::prelude::Solve;
use num_traits::ToPrimitive;
use rand::RngExt;
use rand::rngs::StdRng;

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[must_use]
pub fn u64_to_f64(value: u64) -> f64 {
    value.to_f64().unwrap_or(f64::MAX)
}

/// Solve `a * x = b` with a fully pivoted LU factorization.
///
/// Returns `None` when the solution contains non-finite values.
#[must_use]
pub fn solve_linear_system(a: &Mat<f64>, b: &Mat<f64>) -> Option<Mat<f64>> {
    let rhs = b.clone();
    let lu = a.full_piv_lu();
    let solution = lu.solve(rhs);
    matrix_is_finite(&solution).then_some(solution)
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

/// Lower Cholesky factor `L` with `L * L^T = matrix`.
///
/// Returns `None` for non-square or non-positive-definite input.
#[must_use]
pub fn cholesky_lower(matrix: &Mat<f64>) -> Option<Mat<f64>> {
    let dim = matrix.ncols();
    if matrix.nrows() != dim {
        return None;
    }
    let mut lower = Mat::<f64>::zeros(dim, dim);
    for row in 0..dim {
        for col in 0..=row {
            let mut sum = matrix[(row, col)];
            for k in 0..col {
                sum -= lower[(row, k)] * lower[(col, k)];
            }
            if row == col {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                lower[(row, col)] = sum.sqrt();
            } else {
                lower[(row, col)] = sum / lower[(col, col)];
            }
        }
    }
    Some(lower)
}

/// Quantile of pre-sorted values by linear interpolation between order
/// statistics (Hyndman-Fan type 7).
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last).min(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / usize_to_f64(values.len())
}

/// Unbiased sample variance around a precomputed mean.
#[must_use]
pub fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values
        .iter()
        .map(|value| {
            let centered = *value - mean;
            centered * centered
        })
        .sum::<f64>()
        / usize_to_f64(values.len() - 1)
}

#[must_use]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

/// Box-Muller standard normal draw.
pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
