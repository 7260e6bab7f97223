//! Bayesian Gompertz mortality models.
//!
//! Three observation regimes share one hazard and one sampler:
//! independent count strata, count strata linked over time by a random walk,
//! and geographic areas where some areas report only an aggregate
//! probability of death.

pub mod diagnostics;
pub mod draws;
pub mod hazard;
pub mod likelihood;
pub mod posterior;
pub mod priors;
pub mod sampler;
pub mod summary;
pub mod types;

pub use diagnostics::{
    ConvergenceReport, ConvergenceVerdict, MIN_DIAGNOSTIC_DRAWS, ParameterConvergence,
    autocorrelation, effective_sample_size, multi_chain_ess, split_rhat, summarize_convergence,
};
pub use draws::{ChainOutcome, Draw, RandomWalkScales};
pub use hazard::{CumulativeHazard, DEFAULT_AGE_REFERENCE, GompertzHazard, GompertzParams};
pub use likelihood::{
    LogLikelihood, ObservationModel, count_log_likelihood, poisson_log_probability,
    survival_log_likelihood,
};
pub use posterior::GompertzPosterior;
pub use priors::{GompertzPriorConfig, NormalPrior};
pub use sampler::{
    fit_gompertz, fit_gompertz_with_cancel, fit_gompertz_with_priors, fit_posterior_target,
};
pub use summary::{
    ParameterSummary, PosteriorSummary, SummaryRow, nqx_summary, summarize_posterior,
};
pub use types::{GompertzConfig, GompertzError, GompertzFit, GompertzFitOptions};
