//! Convergence diagnostics across chains: split-R-hat, ESS and divergences.

use comfy_table::{Attribute, Cell, Color};
use serde::{Deserialize, Serialize};

use crate::inference::ChainStatus;
use crate::utils::{mean, sample_variance, usize_to_f64};

use super::draws::ChainOutcome;
use super::summary::make_table;
use super::types::{GompertzError, GompertzFitOptions};

/// Minimum retained draws for a chain to enter the diagnostics.
pub const MIN_DIAGNOSTIC_DRAWS: usize = 4;

/// Autocorrelation lags beyond this are never summed.
const MAX_ESS_LAG: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceVerdict {
    Converged,
    NotConverged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConvergence {
    pub name: String,
    pub split_rhat: f64,
    pub ess: f64,
    pub verdict: ConvergenceVerdict,
}

/// Structured convergence report of a multi-chain fit.
///
/// Non-convergence is reported here and never raised as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    /// Ids of the chains whose draws entered the diagnostics.
    pub chains_used: Vec<usize>,
    pub draws_per_chain_used: usize,
    pub parameters: Vec<ParameterConvergence>,
    /// Divergent transitions over all chains' sampling iterations.
    pub divergences: usize,
    pub failed_chains: Vec<usize>,
    pub truncated_chains: Vec<usize>,
    pub max_split_rhat: f64,
    pub min_ess: f64,
    pub all_converged: bool,
}

impl ConvergenceReport {
    pub fn not_converged(&self) -> impl Iterator<Item = &ParameterConvergence> + '_ {
        self.parameters
            .iter()
            .filter(|parameter| parameter.verdict == ConvergenceVerdict::NotConverged)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParameterConvergence> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }

    /// Render split R-hat and ESS per parameter; failing rows are highlighted.
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut table = make_table(&["parameter", "split R-hat", "ESS", "verdict"]);
        for parameter in &self.parameters {
            let verdict = match parameter.verdict {
                ConvergenceVerdict::Converged => Cell::new("ok"),
                ConvergenceVerdict::NotConverged => Cell::new("not converged")
                    .fg(Color::Red)
                    .add_attribute(Attribute::Bold),
            };
            table.add_row(vec![
                Cell::new(&parameter.name),
                Cell::new(format!("{:.3}", parameter.split_rhat)),
                Cell::new(format!("{:.0}", parameter.ess)),
                verdict,
            ]);
        }
        table.to_string()
    }
}

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let center = mean(series);
    let denominator: f64 = series.iter().map(|value| (value - center).powi(2)).sum();
    if denominator <= 0.0 {
        return 0.0;
    }

    let numerator: f64 = series
        .iter()
        .zip(&series[lag..])
        .map(|(a, b)| (a - center) * (b - center))
        .sum();
    numerator / denominator
}

/// Single-chain effective sample size with positive-autocorrelation truncation.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n.min(MAX_ESS_LAG + 1) {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / 2.0f64.mul_add(rho_sum, 1.0).max(1.0)
}

/// Split-R-hat of equally long chains (already split by the caller).
///
/// Degenerate inputs (zero within-chain variance) report 1.
///
/// # Errors
///
/// Returns `GompertzError` with fewer than two chains, fewer than two draws,
/// or chains of unequal length.
pub fn split_rhat(chains: &[Vec<f64>]) -> Result<f64, GompertzError> {
    let n = check_split_chains(chains)?;

    let chain_means: Vec<f64> = chains.iter().map(|chain| mean(chain)).collect();
    let within = chains
        .iter()
        .zip(&chain_means)
        .map(|(chain, chain_mean)| sample_variance(chain, *chain_mean))
        .sum::<f64>()
        / usize_to_f64(chains.len());
    let between = usize_to_f64(n) * sample_variance(&chain_means, mean(&chain_means));

    if !(within.is_finite() && within > 0.0 && between.is_finite()) {
        return Ok(1.0);
    }

    let n_f64 = usize_to_f64(n);
    let var_plus = ((n_f64 - 1.0) / n_f64).mul_add(within, between / n_f64);
    if !var_plus.is_finite() || var_plus <= 0.0 {
        return Ok(1.0);
    }

    Ok((var_plus / within).sqrt().max(1.0))
}

/// Multi-chain effective sample size with Geyer's initial monotone sequence.
///
/// Autocorrelations combine within- and between-chain variance,
/// `rho_t = 1 - (W - mean_acov_t) / var_plus`, so chains that disagree with
/// each other lower the estimate. Lag pairs are summed until one turns
/// non-positive. The result lies in `[1, m n]`.
///
/// # Errors
///
/// Returns `GompertzError` with fewer than two chains, fewer than two draws,
/// or chains of unequal length.
pub fn multi_chain_ess(chains: &[Vec<f64>]) -> Result<f64, GompertzError> {
    let n = check_split_chains(chains)?;
    let total = usize_to_f64(chains.len() * n);
    if n < MIN_DIAGNOSTIC_DRAWS {
        return Ok(total);
    }

    let n_f64 = usize_to_f64(n);
    let m_f64 = usize_to_f64(chains.len());
    let means: Vec<f64> = chains.iter().map(|chain| mean(chain)).collect();
    let within = chains
        .iter()
        .zip(&means)
        .map(|(chain, chain_mean)| sample_variance(chain, *chain_mean))
        .sum::<f64>()
        / m_f64;
    let var_plus =
        ((n_f64 - 1.0) / n_f64).mul_add(within, sample_variance(&means, mean(&means)));
    if !(var_plus.is_finite() && var_plus > 0.0) {
        return Ok(total);
    }

    let mean_autocovariance = |lag: usize| -> f64 {
        chains
            .iter()
            .zip(&means)
            .map(|(chain, chain_mean)| {
                chain
                    .iter()
                    .zip(&chain[lag..])
                    .map(|(a, b)| (a - chain_mean) * (b - chain_mean))
                    .sum::<f64>()
                    / n_f64
            })
            .sum::<f64>()
            / m_f64
    };
    let rho = |lag: usize| 1.0 - (within - mean_autocovariance(lag)) / var_plus;

    let max_lag = (n - 1).min(MAX_ESS_LAG);
    let mut tau = -1.0;
    let mut previous_pair = f64::INFINITY;
    let mut lag = 0;
    while lag < max_lag {
        let pair = rho(lag) + rho(lag + 1);
        if !pair.is_finite() || pair <= 0.0 {
            break;
        }
        let pair = pair.min(previous_pair);
        tau += 2.0 * pair;
        previous_pair = pair;
        lag += 2;
    }

    if !(tau.is_finite() && tau > 0.0) {
        return Ok(total);
    }
    Ok((total / tau).clamp(1.0, total))
}

fn check_split_chains(chains: &[Vec<f64>]) -> Result<usize, GompertzError> {
    if chains.len() < 2 {
        return Err(GompertzError::InvalidChainCount {
            min: 2,
            found: chains.len(),
        });
    }
    let n = chains.first().map_or(0, Vec::len);
    if n < 2 {
        return Err(GompertzError::InsufficientChainDraws {
            minimum: 2,
            found: n,
        });
    }
    if chains.iter().any(|chain| chain.len() != n) {
        return Err(GompertzError::InconsistentPosteriorDimensions);
    }
    Ok(n)
}

/// Chains whose draws enter the diagnostics and the posterior summary.
///
/// Completed chains are preferred; chains that stopped early are used only
/// when no completed chain has enough draws.
pub(crate) fn diagnostic_chains(chains: &[ChainOutcome]) -> Vec<&ChainOutcome> {
    let long_enough = |chain: &&ChainOutcome| chain.len() >= MIN_DIAGNOSTIC_DRAWS;
    let completed: Vec<&ChainOutcome> = chains
        .iter()
        .filter(|chain| chain.status.is_completed())
        .filter(long_enough)
        .collect();
    if completed.is_empty() {
        chains.iter().filter(long_enough).collect()
    } else {
        completed
    }
}

/// Split-R-hat, ESS and verdict for every scalar parameter.
///
/// Chains are truncated to a common even length and each is split in half.
///
/// # Errors
///
/// Returns `GompertzError` if no chain retained at least four draws or the
/// draws disagree with `parameter_names`.
pub fn summarize_convergence(
    chains: &[ChainOutcome],
    parameter_names: &[String],
    options: &GompertzFitOptions,
) -> Result<ConvergenceReport, GompertzError> {
    let used = diagnostic_chains(chains);
    let min_draws = used.iter().map(|chain| chain.len()).min().unwrap_or(0);
    let draws_per_chain_used = min_draws - (min_draws % 2);
    if used.is_empty() || draws_per_chain_used < MIN_DIAGNOSTIC_DRAWS {
        return Err(GompertzError::InsufficientChainDraws {
            minimum: MIN_DIAGNOSTIC_DRAWS,
            found: chains.iter().map(ChainOutcome::len).max().unwrap_or(0),
        });
    }

    let values: Vec<Vec<Vec<f64>>> = used
        .iter()
        .map(|chain| {
            chain
                .draws
                .iter()
                .take(draws_per_chain_used)
                .map(super::draws::Draw::values)
                .collect()
        })
        .collect();
    if values
        .iter()
        .flatten()
        .any(|draw| draw.len() != parameter_names.len())
    {
        return Err(GompertzError::InconsistentPosteriorDimensions);
    }

    let half = draws_per_chain_used / 2;
    let parameters = parameter_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let split: Vec<Vec<f64>> = values
                .iter()
                .flat_map(|chain| {
                    let series: Vec<f64> = chain.iter().map(|draw| draw[index]).collect();
                    [series[..half].to_vec(), series[half..].to_vec()]
                })
                .collect();
            let split_rhat = split_rhat(&split)?;
            let ess = multi_chain_ess(&split)?;
            let verdict = if split_rhat > options.max_rhat || ess < options.min_ess {
                ConvergenceVerdict::NotConverged
            } else {
                ConvergenceVerdict::Converged
            };
            Ok(ParameterConvergence {
                name: name.clone(),
                split_rhat,
                ess,
                verdict,
            })
        })
        .collect::<Result<Vec<_>, GompertzError>>()?;

    let chain_ids = |predicate: fn(&ChainStatus) -> bool| -> Vec<usize> {
        chains
            .iter()
            .filter(|chain| predicate(&chain.status))
            .map(|chain| chain.chain_id)
            .collect()
    };

    let report = ConvergenceReport {
        chains_used: used.iter().map(|chain| chain.chain_id).collect(),
        draws_per_chain_used,
        divergences: chains.iter().map(|chain| chain.divergences).sum(),
        failed_chains: chain_ids(ChainStatus::is_failed),
        truncated_chains: chain_ids(|status| matches!(status, ChainStatus::Truncated)),
        max_split_rhat: parameters
            .iter()
            .map(|parameter| parameter.split_rhat)
            .fold(1.0, f64::max),
        min_ess: parameters
            .iter()
            .map(|parameter| parameter.ess)
            .fold(f64::INFINITY, f64::min),
        all_converged: parameters
            .iter()
            .all(|parameter| parameter.verdict == ConvergenceVerdict::Converged),
        parameters,
    };

    if report.divergences > 0 {
        log::warn!(
            "{} divergent transitions after warmup; consider a higher target_accept or tighter priors",
            report.divergences
        );
    }
    for parameter in report.not_converged() {
        log::warn!(
            "parameter {} has not converged (split R-hat {:.3}, ESS {:.0})",
            parameter.name,
            parameter.split_rhat,
            parameter.ess
        );
    }
    Ok(report)
}
