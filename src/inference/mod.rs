//! Reusable Hamiltonian Monte Carlo machinery.
//!
//! The engine samples any target implementing [`LogDensity`] over an
//! unconstrained parameter vector. Model crates supply the target and
//! convert the raw positions into their own draw types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod adaptation;
pub mod chain;
pub mod hmc;
pub mod nuts;

pub use adaptation::{DualAveraging, MetricEstimator, WarmupSchedule, find_reasonable_step_size};
pub use chain::{ChainPhase, ChainStatus, RawChain, run_chain, sample_chains};
pub use hmc::{Metric, PhasePoint};
pub use nuts::{Transition, TransitionStats, nuts_transition};

/// Errors from sampler configuration and target evaluation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("target acceptance must lie strictly between 0 and 1; found {0}")]
    InvalidTargetAccept(f64),
    #[error("maximum tree depth must be between 1 and {max}; found {found}")]
    InvalidMaxTreeDepth { found: usize, max: usize },
    #[error("at least one chain is required")]
    InvalidChainCount,
    #[error("number of post-warmup draws must be positive")]
    InvalidDraws,
    #[error("initial jitter must be finite and non-negative; found {0}")]
    InvalidJitter(f64),
    #[error("position has length {found}; target dimension is {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("log-density or gradient is not finite at a finite position")]
    NonFiniteDensity,
    #[error("chain {0} panicked")]
    ChainPanicked(usize),
}

/// Upper bound accepted for `max_tree_depth` (2^20 leapfrog steps).
pub const MAX_TREE_DEPTH_LIMIT: usize = 20;

/// Differentiable log-density over an unconstrained vector.
///
/// Implementations must be pure: chains call them concurrently through a
/// shared reference.
pub trait LogDensity: Sync {
    /// Length of the unconstrained parameter vector.
    fn dim(&self) -> usize;

    /// Log-density at `position`, writing its gradient into `gradient`.
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::NonFiniteDensity` when the density or a
    /// gradient component is not finite, and `DimensionMismatch` for
    /// wrongly sized slices.
    fn log_density_and_gradient(
        &self,
        position: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, InferenceError>;

    /// # Errors
    ///
    /// Same conditions as [`LogDensity::log_density_and_gradient`].
    fn log_density(&self, position: &[f64]) -> Result<f64, InferenceError> {
        let mut gradient = vec![0.0; self.dim()];
        self.log_density_and_gradient(position, &mut gradient)
    }

    /// # Errors
    ///
    /// Same conditions as [`LogDensity::log_density_and_gradient`].
    fn gradient(&self, position: &[f64]) -> Result<Vec<f64>, InferenceError> {
        let mut gradient = vec![0.0; self.dim()];
        self.log_density_and_gradient(position, &mut gradient)?;
        Ok(gradient)
    }
}

/// Shape of the mass matrix adapted during warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MetricKind {
    #[default]
    Diagonal,
    Dense,
}

/// Sampler options shared by every chain of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Dual-averaging target for the mean acceptance statistic.
    pub target_accept: f64,
    /// Maximum number of trajectory doublings per transition.
    pub max_tree_depth: usize,
    pub num_chains: usize,
    /// Warmup iterations (step size and metric adaptation), discarded.
    pub num_warmup: usize,
    /// Retained iterations per chain.
    pub num_draws: usize,
    pub seed: u64,
    /// Chain `i` uses `seed + i * seed_stride` (wrapping add).
    ///
    /// Zero gives every chain the same random stream.
    pub seed_stride: u64,
    /// Standard deviation of Gaussian jitter applied to each chain's start.
    pub init_jitter: f64,
    pub metric: MetricKind,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            max_tree_depth: 10,
            num_chains: 4,
            num_warmup: 1_000,
            num_draws: 1_000,
            seed: 42,
            seed_stride: 10_000,
            init_jitter: 0.1,
            metric: MetricKind::Diagonal,
        }
    }
}

impl SamplerConfig {
    /// # Errors
    ///
    /// Returns `InferenceError` for out-of-range options.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(InferenceError::InvalidTargetAccept(self.target_accept));
        }
        if self.max_tree_depth == 0 || self.max_tree_depth > MAX_TREE_DEPTH_LIMIT {
            return Err(InferenceError::InvalidMaxTreeDepth {
                found: self.max_tree_depth,
                max: MAX_TREE_DEPTH_LIMIT,
            });
        }
        if self.num_chains == 0 {
            return Err(InferenceError::InvalidChainCount);
        }
        if self.num_draws == 0 {
            return Err(InferenceError::InvalidDraws);
        }
        if !(self.init_jitter.is_finite() && self.init_jitter >= 0.0) {
            return Err(InferenceError::InvalidJitter(self.init_jitter));
        }
        Ok(())
    }

    /// Seed used by chain `chain_index`.
    #[must_use]
    pub fn chain_seed(&self, chain_index: usize) -> u64 {
        let index = u64::try_from(chain_index).unwrap_or(u64::MAX);
        self.seed.wrapping_add(index.saturating_mul(self.seed_stride))
    }
}
