//! Core public types for the Gompertz module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::{ChainPhase, InferenceError, SamplerConfig};
use crate::input::{InputError, StratumKey};

use super::diagnostics::ConvergenceReport;
use super::draws::ChainOutcome;
use super::hazard::{DEFAULT_AGE_REFERENCE, GompertzHazard};
use super::likelihood::{DEFAULT_SURVIVAL_LOGIT_SCALE, ObservationModel};
use super::summary::PosteriorSummary;

/// Errors returned by Gompertz configuration, validation, and fitting.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GompertzError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("invalid Gompertz prior configuration")]
    InvalidPriorConfig,
    #[error("invalid fit option `{field}`: {value}")]
    InvalidFitOptions { field: &'static str, value: f64 },
    #[error("posterior draws are required")]
    EmptyPosterior,
    #[error("diagnostics require at least {min} chain(s); found {found}")]
    InvalidChainCount { min: usize, found: usize },
    #[error("each chain must retain at least {minimum} draws; maximum found {found}")]
    InsufficientChainDraws { minimum: usize, found: usize },
    #[error("posterior dimensions differ across chains")]
    InconsistentPosteriorDimensions,
    #[error("all {chains} chains failed; first failure at {phase:?} iteration {iteration}")]
    AllChainsFailed {
        chains: usize,
        phase: ChainPhase,
        iteration: usize,
    },
}

/// Model-level options for a Gompertz fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GompertzFitOptions {
    /// Centering age of the log-linear hazard.
    pub age_reference: f64,
    /// Scale of the logit-Normal likelihood for survival-only areas.
    pub survival_logit_scale: f64,
    /// Mass of the equal-tailed credible interval in summaries.
    pub credible_level: f64,
    /// Minimum effective sample size for a `Converged` verdict.
    pub min_ess: f64,
    /// Maximum split-R-hat for a `Converged` verdict.
    pub max_rhat: f64,
}

impl Default for GompertzFitOptions {
    fn default() -> Self {
        Self {
            age_reference: DEFAULT_AGE_REFERENCE,
            survival_logit_scale: DEFAULT_SURVIVAL_LOGIT_SCALE,
            credible_level: 0.95,
            min_ess: 400.0,
            max_rhat: 1.01,
        }
    }
}

impl GompertzFitOptions {
    /// # Errors
    ///
    /// Returns `GompertzError::InvalidFitOptions` naming the first bad field.
    pub fn validate(&self) -> Result<(), GompertzError> {
        let invalid = |field, value| Err(GompertzError::InvalidFitOptions { field, value });
        if !self.age_reference.is_finite() {
            return invalid("age_reference", self.age_reference);
        }
        if !(self.survival_logit_scale.is_finite() && self.survival_logit_scale > 0.0) {
            return invalid("survival_logit_scale", self.survival_logit_scale);
        }
        if !(self.credible_level > 0.0 && self.credible_level < 1.0) {
            return invalid("credible_level", self.credible_level);
        }
        if !(self.min_ess.is_finite() && self.min_ess >= 0.0) {
            return invalid("min_ess", self.min_ess);
        }
        if !(self.max_rhat.is_finite() && self.max_rhat >= 1.0) {
            return invalid("max_rhat", self.max_rhat);
        }
        Ok(())
    }
}

/// Sampler and model options for one fit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GompertzConfig {
    pub sampler: SamplerConfig,
    pub fit: GompertzFitOptions,
}

impl GompertzConfig {
    /// # Errors
    ///
    /// Returns `GompertzError` if either part is invalid.
    pub fn validate(&self) -> Result<(), GompertzError> {
        self.sampler.validate()?;
        self.fit.validate()
    }
}

/// Result of a multi-chain Gompertz fit.
///
/// Every chain is kept, including failed and cancelled ones. `convergence`
/// and `summary` are `None` when no chain retained enough draws.
#[derive(Debug, Clone)]
pub struct GompertzFit {
    pub model: ObservationModel,
    pub hazard: GompertzHazard,
    /// Names of the scalar parameters, in draw order.
    pub parameter_names: Vec<String>,
    /// Stratum keys in panel order.
    pub strata: Vec<StratumKey>,
    pub chains: Vec<ChainOutcome>,
    pub convergence: Option<ConvergenceReport>,
    pub summary: Option<PosteriorSummary>,
}
