#![forbid(unsafe_code)]

//! # `gompertz_mortality`
//!
//! Bayesian Gompertz hazard models for human mortality data, fitted with a
//! No-U-Turn Hamiltonian Monte Carlo sampler.
//!
//! Three observation regimes are supported: a single cross-section of death
//! counts, a time-ordered panel linked by a random-walk prior, and a panel
//! of areas where some areas report only an aggregate probability of death.
//! Fits return immutable draws, convergence diagnostics, and posterior
//! summaries including modal age at death and `nqx`.

pub mod inference;
pub mod input;
pub mod models;
pub mod preprocess;
pub mod simulate;
pub mod utils;

pub use inference::{InferenceError, LogDensity, MetricKind, SamplerConfig};
pub use input::{
    AgeGrid, CountObservation, InputError, Observation, Panel, Stratum, StratumKey, StratumKind,
    SurvivalObservation,
};
pub use preprocess::{PanelDiagnostics, crude_rates, panel_diagnostics};
pub use simulate::{SimulatedObservation, SimulatedStratum, simulate_panel};

pub use models::gompertz::{
    ChainOutcome, ConvergenceReport, ConvergenceVerdict, Draw, GompertzConfig, GompertzError,
    GompertzFit, GompertzFitOptions, GompertzHazard, GompertzParams, GompertzPosterior,
    GompertzPriorConfig, NormalPrior, ObservationModel, ParameterConvergence, ParameterSummary,
    PosteriorSummary, RandomWalkScales, SummaryRow, fit_gompertz, fit_gompertz_with_cancel,
    fit_gompertz_with_priors, fit_posterior_target,
};
