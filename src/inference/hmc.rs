//! Euclidean metrics and the leapfrog integrator.

use faer::Mat;
use rand::rngs::StdRng;

use crate::utils::{cholesky_lower, sample_standard_normal};

use super::{InferenceError, LogDensity, MetricKind};

/// Inverse mass matrix `M^{-1}` used for kinetic energy and momentum draws.
#[derive(Debug, Clone)]
pub enum Metric {
    Diagonal {
        inv_mass: Vec<f64>,
    },
    Dense {
        inv_mass: Mat<f64>,
        /// Lower Cholesky factor of `inv_mass`.
        chol_inv_mass: Mat<f64>,
    },
}

impl Metric {
    #[must_use]
    pub fn identity(dim: usize, kind: MetricKind) -> Self {
        match kind {
            MetricKind::Diagonal => Self::Diagonal {
                inv_mass: vec![1.0; dim],
            },
            MetricKind::Dense => {
                let identity = Mat::from_fn(dim, dim, |i, j| if i == j { 1.0 } else { 0.0 });
                Self::Dense {
                    chol_inv_mass: identity.clone(),
                    inv_mass: identity,
                }
            }
        }
    }

    /// Dense metric from a covariance estimate; `None` if it is not positive definite.
    #[must_use]
    pub fn dense(inv_mass: Mat<f64>) -> Option<Self> {
        let chol_inv_mass = cholesky_lower(&inv_mass)?;
        Some(Self::Dense {
            inv_mass,
            chol_inv_mass,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Diagonal { .. } => MetricKind::Diagonal,
            Self::Dense { .. } => MetricKind::Dense,
        }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        match self {
            Self::Diagonal { inv_mass } => inv_mass.len(),
            Self::Dense { inv_mass, .. } => inv_mass.nrows(),
        }
    }

    /// Diagonal of `M^{-1}`, reported in chain summaries.
    #[must_use]
    pub fn inv_mass_diagonal(&self) -> Vec<f64> {
        match self {
            Self::Diagonal { inv_mass } => inv_mass.clone(),
            Self::Dense { inv_mass, .. } => {
                (0..inv_mass.nrows()).map(|i| inv_mass[(i, i)]).collect()
            }
        }
    }

    /// `M^{-1} p`.
    #[must_use]
    pub fn velocity(&self, momentum: &[f64]) -> Vec<f64> {
        match self {
            Self::Diagonal { inv_mass } => inv_mass
                .iter()
                .zip(momentum)
                .map(|(scale, p)| scale * p)
                .collect(),
            Self::Dense { inv_mass, .. } => (0..inv_mass.nrows())
                .map(|row| {
                    momentum
                        .iter()
                        .enumerate()
                        .map(|(col, p)| inv_mass[(row, col)] * p)
                        .sum()
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn kinetic_energy(&self, momentum: &[f64]) -> f64 {
        0.5 * dot(momentum, &self.velocity(momentum))
    }

    /// Draw `p ~ Normal(0, M)`.
    pub fn sample_momentum(&self, rng: &mut StdRng) -> Vec<f64> {
        match self {
            Self::Diagonal { inv_mass } => inv_mass
                .iter()
                .map(|scale| sample_standard_normal(rng) / scale.sqrt())
                .collect(),
            Self::Dense { chol_inv_mass, .. } => {
                // M^{-1} = L L^T, so p = L^{-T} z has covariance M.
                let dim = chol_inv_mass.nrows();
                let z: Vec<f64> = (0..dim).map(|_| sample_standard_normal(rng)).collect();
                let mut momentum = vec![0.0; dim];
                for row in (0..dim).rev() {
                    let mut sum = z[row];
                    for col in (row + 1)..dim {
                        sum -= chol_inv_mass[(col, row)] * momentum[col];
                    }
                    momentum[row] = sum / chol_inv_mass[(row, row)];
                }
                momentum
            }
        }
    }
}

#[must_use]
pub fn dot(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

/// Position, momentum and cached target evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePoint {
    pub position: Vec<f64>,
    pub momentum: Vec<f64>,
    pub log_density: f64,
    pub gradient: Vec<f64>,
}

impl PhasePoint {
    /// Evaluate the target at `position` with zero momentum.
    ///
    /// # Errors
    ///
    /// Propagates target failures.
    pub fn at<T: LogDensity + ?Sized>(
        target: &T,
        position: Vec<f64>,
    ) -> Result<Self, InferenceError> {
        if position.len() != target.dim() {
            return Err(InferenceError::DimensionMismatch {
                expected: target.dim(),
                found: position.len(),
            });
        }
        let mut gradient = vec![0.0; position.len()];
        let log_density = target.log_density_and_gradient(&position, &mut gradient)?;
        Ok(Self {
            momentum: vec![0.0; position.len()],
            position,
            log_density,
            gradient,
        })
    }

    /// Potential plus kinetic energy.
    #[must_use]
    pub fn hamiltonian(&self, metric: &Metric) -> f64 {
        -self.log_density + metric.kinetic_energy(&self.momentum)
    }
}

/// One leapfrog step of signed size `step_size`.
///
/// A step that leaves the finite reals returns a point with log-density
/// `-inf`, which the tree builder treats as a divergence. Only a non-finite
/// evaluation at a finite position is an error.
///
/// # Errors
///
/// Propagates target failures.
pub fn leapfrog<T: LogDensity + ?Sized>(
    target: &T,
    metric: &Metric,
    point: &PhasePoint,
    step_size: f64,
) -> Result<PhasePoint, InferenceError> {
    let half = 0.5 * step_size;
    let mut momentum: Vec<f64> = point
        .momentum
        .iter()
        .zip(&point.gradient)
        .map(|(p, g)| half.mul_add(*g, *p))
        .collect();
    let velocity = metric.velocity(&momentum);
    let position: Vec<f64> = point
        .position
        .iter()
        .zip(&velocity)
        .map(|(q, v)| step_size.mul_add(*v, *q))
        .collect();

    if position.iter().any(|value| !value.is_finite()) {
        return Ok(PhasePoint {
            gradient: vec![0.0; position.len()],
            position,
            momentum,
            log_density: f64::NEG_INFINITY,
        });
    }

    let mut gradient = vec![0.0; position.len()];
    let log_density = target.log_density_and_gradient(&position, &mut gradient)?;
    for (p, g) in momentum.iter_mut().zip(&gradient) {
        *p = half.mul_add(*g, *p);
    }
    Ok(PhasePoint {
        position,
        momentum,
        log_density,
        gradient,
    })
}

#[cfg(test)]
pub(crate) mod test_targets {
    use super::{InferenceError, LogDensity};

    /// Independent normals with the given scales.
    pub struct StandardNormal {
        pub scales: Vec<f64>,
    }

    impl LogDensity for StandardNormal {
        fn dim(&self) -> usize {
            self.scales.len()
        }

        fn log_density_and_gradient(
            &self,
            position: &[f64],
            gradient: &mut [f64],
        ) -> Result<f64, InferenceError> {
            let mut total = 0.0;
            for ((x, scale), g) in position.iter().zip(&self.scales).zip(gradient.iter_mut()) {
                let z = x / scale;
                total -= 0.5 * z * z;
                *g = -z / scale;
            }
            Ok(total)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    use super::test_targets::StandardNormal;
    use super::*;
    use crate::utils::{mean, sample_variance};

    #[test]
    fn leapfrog_approximately_conserves_energy() {
        let target = StandardNormal {
            scales: vec![1.0, 2.0],
        };
        let metric = Metric::identity(2, MetricKind::Diagonal);
        let mut point = PhasePoint::at(&target, vec![0.5, -1.0]).expect("finite start");
        point.momentum = vec![0.3, 0.8];
        let h0 = point.hamiltonian(&metric);
        for _ in 0..50 {
            point = leapfrog(&target, &metric, &point, 0.05).expect("finite step");
        }
        assert_relative_eq!(point.hamiltonian(&metric), h0, epsilon = 1.0e-3);
    }

    #[test]
    fn leapfrog_is_reversible() {
        let target = StandardNormal {
            scales: vec![1.0, 0.5],
        };
        let metric = Metric::identity(2, MetricKind::Dense);
        let mut start = PhasePoint::at(&target, vec![0.2, 0.1]).expect("finite start");
        start.momentum = vec![-0.4, 1.1];
        let forward = leapfrog(&target, &metric, &start, 0.1).expect("forward");
        let back = leapfrog(&target, &metric, &forward, -0.1).expect("backward");
        for (a, b) in back.position.iter().zip(&start.position) {
            assert_relative_eq!(a, b, epsilon = 1.0e-12);
        }
    }

    #[test]
    fn dense_and_diagonal_agree_for_diagonal_covariance() {
        let inv_mass = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 4.0,
            (1, 1) => 0.25,
            _ => 0.0,
        });
        let dense = Metric::dense(inv_mass).expect("positive definite");
        let diagonal = Metric::Diagonal {
            inv_mass: vec![4.0, 0.25],
        };
        let momentum = [1.5, -2.0];
        assert_relative_eq!(
            dense.kinetic_energy(&momentum),
            diagonal.kinetic_energy(&momentum),
            epsilon = 1.0e-12
        );
        assert_eq!(dense.inv_mass_diagonal(), vec![4.0, 0.25]);
    }

    #[test]
    fn dense_momentum_has_inverse_metric_covariance() {
        let inv_mass = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 2.0,
            (0, 1) | (1, 0) => 0.5,
            _ => 1.0,
        });
        let metric = Metric::dense(inv_mass).expect("positive definite");
        let mut rng = StdRng::seed_from_u64(11);
        let draws: Vec<Vec<f64>> = (0..40_000)
            .map(|_| metric.sample_momentum(&mut rng))
            .collect();
        // M = inv([[2, .5], [.5, 1]]) = [[1, -.5], [-.5, 2]] / 1.75
        let first: Vec<f64> = draws.iter().map(|p| p[0]).collect();
        let second: Vec<f64> = draws.iter().map(|p| p[1]).collect();
        assert_relative_eq!(
            sample_variance(&first, mean(&first)),
            1.0 / 1.75,
            epsilon = 0.02
        );
        assert_relative_eq!(
            sample_variance(&second, mean(&second)),
            2.0 / 1.75,
            epsilon = 0.04
        );
    }
}
