//! Sampler entrypoints for the Gompertz models.

use std::sync::atomic::AtomicBool;

use crate::inference::{ChainStatus, InferenceError, LogDensity, sample_chains};
use crate::input::Panel;

use super::diagnostics::{
    ConvergenceReport, MIN_DIAGNOSTIC_DRAWS, diagnostic_chains, summarize_convergence,
};
use super::draws::{ChainOutcome, Draw};
use super::likelihood::ObservationModel;
use super::posterior::GompertzPosterior;
use super::priors::GompertzPriorConfig;
use super::summary::{ParameterSummary, PosteriorSummary, nqx_summary, summarize_posterior};
use super::types::{GompertzConfig, GompertzError, GompertzFit, GompertzFitOptions};

/// Fit a Gompertz model with the default priors.
///
/// # Errors
///
/// Returns `GompertzError` if the panel or configuration is invalid.
pub fn fit_gompertz(
    panel: &Panel,
    model: ObservationModel,
    config: GompertzConfig,
) -> Result<GompertzFit, GompertzError> {
    fit_gompertz_with_priors(panel, model, GompertzPriorConfig::default(), config)
}

/// Fit a Gompertz model with explicit priors.
///
/// # Errors
///
/// Returns `GompertzError` if the panel, priors, or configuration is invalid.
pub fn fit_gompertz_with_priors(
    panel: &Panel,
    model: ObservationModel,
    priors: GompertzPriorConfig,
    config: GompertzConfig,
) -> Result<GompertzFit, GompertzError> {
    let cancel = AtomicBool::new(false);
    fit_gompertz_with_cancel(panel, model, priors, config, &cancel)
}

/// Fit a Gompertz model that stops early once `cancel` is set.
///
/// Chains check the flag between iterations and keep their draws so far,
/// tagged `ChainStatus::Truncated`. Chains whose target evaluation fails keep
/// their draws as well and are listed in the convergence report. Partial
/// runs always come back as a `GompertzFit`; `summary` and `convergence`
/// are `None` when too few draws were retained.
///
/// # Errors
///
/// Returns `GompertzError` if the panel, priors, or configuration is
/// invalid, or if a chain thread panics.
pub fn fit_gompertz_with_cancel(
    panel: &Panel,
    model: ObservationModel,
    priors: GompertzPriorConfig,
    config: GompertzConfig,
    cancel: &AtomicBool,
) -> Result<GompertzFit, GompertzError> {
    config.validate()?;
    let posterior = GompertzPosterior::new(panel, model, priors, &config.fit)?;
    fit_posterior_target(&posterior, &posterior, &config, cancel)
}

/// Run the sampler on `target` and map its draws through `posterior`.
///
/// `target` must use the posterior's parameter layout. It is usually the
/// posterior itself, or a wrapper around it that instruments or perturbs
/// evaluations.
///
/// # Errors
///
/// Returns `GompertzError` if the configuration is invalid, the target's
/// dimension differs from the posterior's, or a chain thread panics.
pub fn fit_posterior_target<T: LogDensity + ?Sized>(
    posterior: &GompertzPosterior,
    target: &T,
    config: &GompertzConfig,
    cancel: &AtomicBool,
) -> Result<GompertzFit, GompertzError> {
    config.validate()?;
    if target.dim() != posterior.dim() {
        return Err(InferenceError::DimensionMismatch {
            expected: posterior.dim(),
            found: target.dim(),
        }
        .into());
    }

    let raw = sample_chains(
        target,
        &config.sampler,
        &posterior.initial_position(),
        cancel,
    )?;
    let chains = raw
        .into_iter()
        .map(|chain| ChainOutcome::from_raw(chain, posterior))
        .collect();
    GompertzFit::from_chains(posterior, chains, &config.fit)
}

impl GompertzFit {
    /// Assemble a fit from finished chains: diagnostics and summaries over
    /// the chains with enough draws, every chain kept as returned.
    ///
    /// # Errors
    ///
    /// Returns `GompertzError::InconsistentPosteriorDimensions` if a draw
    /// does not match the posterior's parameter layout.
    pub fn from_chains(
        posterior: &GompertzPosterior,
        chains: Vec<ChainOutcome>,
        options: &GompertzFitOptions,
    ) -> Result<Self, GompertzError> {
        let parameter_names = posterior.parameter_names();
        let strata: Vec<_> = posterior.stratum_keys().cloned().collect();

        for chain in &chains {
            match &chain.status {
                ChainStatus::Completed => {}
                ChainStatus::Truncated => log::warn!(
                    "chain {} was cancelled during {:?} after {} draws",
                    chain.chain_id,
                    chain.phase,
                    chain.len()
                ),
                ChainStatus::Failed {
                    phase,
                    iteration,
                    error,
                } => log::warn!(
                    "chain {} failed during {phase:?} at iteration {iteration}: {error}; kept {} draws",
                    chain.chain_id,
                    chain.len()
                ),
            }
        }

        let convergence = match summarize_convergence(&chains, &parameter_names, options) {
            Ok(report) => Some(report),
            Err(GompertzError::InsufficientChainDraws { minimum, found }) => {
                log::warn!(
                    "no chain retained {minimum} draws (most: {found}); returning draws without diagnostics"
                );
                None
            }
            Err(error) => return Err(error),
        };
        let pooled: Vec<&Draw> = diagnostic_chains(&chains)
            .into_iter()
            .flat_map(|chain| chain.draws.iter())
            .collect();
        let summary = match convergence {
            Some(_) => Some(summarize_posterior(
                &pooled,
                &parameter_names,
                posterior.hazard(),
                &strata,
                options.credible_level,
            )?),
            None => None,
        };

        if let Some(report) = &convergence {
            log::info!(
                "fitted {:?} Gompertz model: {} strata, {} chains, {} pooled draws, max split R-hat {:.3}, min ESS {:.0}, {} divergences",
                posterior.model(),
                strata.len(),
                chains.len(),
                pooled.len(),
                report.max_split_rhat,
                report.min_ess,
                report.divergences
            );
        }

        Ok(Self {
            model: posterior.model(),
            hazard: *posterior.hazard(),
            parameter_names,
            strata,
            chains,
            convergence,
            summary,
        })
    }

    /// Draws entering the summary: completed chains, or every chain with
    /// enough draws when none completed.
    #[must_use]
    pub fn pooled_draws(&self) -> Vec<&Draw> {
        diagnostic_chains(&self.chains)
            .into_iter()
            .flat_map(|chain| chain.draws.iter())
            .collect()
    }

    /// The posterior summary, or why none could be formed.
    ///
    /// # Errors
    ///
    /// Returns `GompertzError::AllChainsFailed` when every chain failed
    /// before retaining enough draws, and `InsufficientChainDraws` when the
    /// run was cut short otherwise.
    pub fn require_summary(&self) -> Result<&PosteriorSummary, GompertzError> {
        self.summary.as_ref().ok_or_else(|| self.missing_draws())
    }

    /// The convergence report, or why none could be formed.
    ///
    /// # Errors
    ///
    /// Same conditions as [`GompertzFit::require_summary`].
    pub fn require_convergence(&self) -> Result<&ConvergenceReport, GompertzError> {
        self.convergence.as_ref().ok_or_else(|| self.missing_draws())
    }

    #[must_use]
    pub fn all_chains_failed(&self) -> bool {
        self.chains.iter().all(|chain| chain.status.is_failed())
    }

    fn missing_draws(&self) -> GompertzError {
        let first_failure = self.chains.iter().find_map(|chain| match chain.status {
            ChainStatus::Failed {
                phase, iteration, ..
            } => Some((phase, iteration)),
            _ => None,
        });
        match first_failure {
            Some((phase, iteration)) if self.all_chains_failed() => {
                GompertzError::AllChainsFailed {
                    chains: self.chains.len(),
                    phase,
                    iteration,
                }
            }
            _ => GompertzError::InsufficientChainDraws {
                minimum: MIN_DIAGNOSTIC_DRAWS,
                found: self.chains.iter().map(ChainOutcome::len).max().unwrap_or(0),
            },
        }
    }

    /// Posterior of `nqx` per stratum for ages `age_start..=age_end`.
    ///
    /// # Errors
    ///
    /// Returns `GompertzError` if the range leaves the age grid or the fit
    /// retained too few draws.
    pub fn nqx_summary(
        &self,
        age_start: i32,
        age_end: i32,
    ) -> Result<Vec<ParameterSummary>, GompertzError> {
        let credible_level = self.require_summary()?.credible_level;
        nqx_summary(
            &self.pooled_draws(),
            &self.hazard,
            &self.strata,
            age_start,
            age_end,
            credible_level,
        )
    }

    #[must_use]
    pub fn total_draws(&self) -> usize {
        self.chains.iter().map(ChainOutcome::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::inference::SamplerConfig;
    use crate::input::{AgeGrid, CountObservation, Observation, StratumKey};

    fn panel() -> Panel {
        let observations: Vec<Observation> = (40..=49)
            .map(|age| {
                let deaths = 20 + 2 * u64::try_from(age - 40).unwrap_or(0);
                CountObservation::new(age, 1.0e4, deaths).into()
            })
            .collect();
        Panel::single(AgeGrid::new(40, 49).expect("grid"), observations).expect("panel")
    }

    fn quick_config() -> GompertzConfig {
        GompertzConfig {
            sampler: SamplerConfig {
                num_chains: 2,
                num_warmup: 150,
                num_draws: 150,
                ..SamplerConfig::default()
            },
            ..GompertzConfig::default()
        }
    }

    #[test]
    fn fit_returns_chains_report_and_summary() {
        let fit = fit_gompertz(&panel(), ObservationModel::Count, quick_config()).expect("fit");
        assert_eq!(fit.chains.len(), 2);
        assert_eq!(fit.total_draws(), 300);
        assert_eq!(fit.parameter_names, vec!["log_alpha[all]", "beta[all]"]);
        let summary = fit.require_summary().expect("summary");
        assert!(summary.get("beta[all]").is_some());
        assert!(summary.get("modal_age[all]").is_some());
        assert_eq!(
            fit.require_convergence().expect("report").chains_used,
            vec![0, 1]
        );

        let nqx = fit.nqx_summary(40, 49).expect("on grid");
        assert_eq!(nqx[0].name, "10q40[all]");
        assert!(nqx[0].median > 0.0 && nqx[0].median < 1.0);
    }

    #[test]
    fn invalid_config_aborts_before_sampling() {
        let mut config = quick_config();
        config.sampler.target_accept = 1.5;
        assert_eq!(
            fit_gompertz(&panel(), ObservationModel::Count, config).map(|fit| fit.chains.len()),
            Err(GompertzError::Inference(InferenceError::InvalidTargetAccept(
                1.5
            )))
        );
    }

    #[test]
    fn cancelled_fit_without_draws_is_reported() {
        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::Relaxed);
        let fit = fit_gompertz_with_cancel(
            &panel(),
            ObservationModel::Count,
            GompertzPriorConfig::default(),
            quick_config(),
            &cancel,
        )
        .expect("cancelled fits still return their chains");
        assert_eq!(fit.chains.len(), 2);
        assert!(
            fit.chains
                .iter()
                .all(|chain| chain.status == ChainStatus::Truncated && chain.is_empty())
        );
        assert!(fit.summary.is_none() && fit.convergence.is_none());
        assert!(matches!(
            fit.require_summary(),
            Err(GompertzError::InsufficientChainDraws { found: 0, .. })
        ));
        assert!(fit.nqx_summary(40, 49).is_err());
    }

    #[test]
    fn mismatched_target_dimension_is_rejected() {
        let posterior = GompertzPosterior::new(
            &panel(),
            ObservationModel::Count,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        let two_strata = panel()
            .with_stratum(StratumKey::area("b"), panel().strata()[0].observations.clone())
            .expect("second stratum");
        let other = GompertzPosterior::new(
            &two_strata,
            ObservationModel::Count,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        let cancel = AtomicBool::new(false);
        assert_eq!(
            fit_posterior_target(&posterior, &other, &quick_config(), &cancel)
                .map(|fit| fit.chains.len()),
            Err(GompertzError::Inference(InferenceError::DimensionMismatch {
                expected: 2,
                found: 4
            }))
        );
    }
}
