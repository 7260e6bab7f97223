//! Constrained posterior draws and per-chain outcomes.

use serde::{Deserialize, Serialize};

use crate::inference::{ChainPhase, ChainStatus, RawChain};
use crate::utils::{mean, usize_to_f64};

use super::hazard::GompertzParams;
use super::posterior::GompertzPosterior;

/// Random-walk step scales on their natural (positive) scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomWalkScales {
    pub sigma_alpha: f64,
    pub sigma_beta: f64,
}

/// One retained posterior draw. Values follow `parameter_names()` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draw {
    pub chain_id: usize,
    /// Index among the chain's retained draws.
    pub iteration: usize,
    pub params: Vec<GompertzParams>,
    pub scales: Option<RandomWalkScales>,
}

impl Draw {
    /// Flattened scalar values: `log_alpha`/`beta` per stratum, then scales.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self
            .params
            .iter()
            .flat_map(|params| [params.log_alpha, params.beta])
            .collect();
        if let Some(scales) = self.scales {
            values.extend([scales.sigma_alpha, scales.sigma_beta]);
        }
        values
    }
}

/// Draws and sampler statistics of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub chain_id: usize,
    pub seed: u64,
    pub status: ChainStatus,
    /// Phase the chain stopped in.
    pub phase: ChainPhase,
    pub draws: Vec<Draw>,
    /// Divergent transitions after warmup.
    pub divergences: usize,
    pub warmup_divergences: usize,
    pub step_size: f64,
    pub mean_accept_prob: f64,
    pub mean_tree_depth: f64,
    pub inv_mass_diagonal: Vec<f64>,
}

impl ChainOutcome {
    /// Map a raw chain's unconstrained positions through the posterior.
    #[must_use]
    pub fn from_raw(raw: RawChain, posterior: &GompertzPosterior) -> Self {
        let accept: Vec<f64> = raw.stats.iter().map(|stats| stats.accept_prob).collect();
        let depth: Vec<f64> = raw
            .stats
            .iter()
            .map(|stats| usize_to_f64(stats.tree_depth))
            .collect();
        let divergences = raw.divergences();
        let draws = raw
            .positions
            .iter()
            .enumerate()
            .map(|(iteration, position)| {
                let (params, scales) = posterior.constrain(position);
                Draw {
                    chain_id: raw.chain_id,
                    iteration,
                    params,
                    scales,
                }
            })
            .collect();

        Self {
            chain_id: raw.chain_id,
            seed: raw.seed,
            status: raw.status,
            phase: raw.phase,
            draws,
            divergences,
            warmup_divergences: raw.warmup_divergences,
            step_size: raw.step_size,
            mean_accept_prob: if accept.is_empty() { f64::NAN } else { mean(&accept) },
            mean_tree_depth: if depth.is_empty() { f64::NAN } else { mean(&depth) },
            inv_mass_diagonal: raw.inv_mass_diagonal,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.draws.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Values of scalar parameter `index` across this chain's draws.
    #[must_use]
    pub fn series(&self, index: usize) -> Vec<f64> {
        self.draws
            .iter()
            .filter_map(|draw| draw.values().get(index).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_follow_parameter_order() {
        let draw = Draw {
            chain_id: 0,
            iteration: 3,
            params: vec![GompertzParams::new(-6.0, 0.1), GompertzParams::new(-5.5, 0.09)],
            scales: Some(RandomWalkScales {
                sigma_alpha: 0.2,
                sigma_beta: 0.01,
            }),
        };
        assert_eq!(draw.values(), vec![-6.0, 0.1, -5.5, 0.09, 0.2, 0.01]);
    }

    #[test]
    fn series_extracts_one_parameter() {
        let chain = |chain_id, n| ChainOutcome {
            chain_id,
            seed: 0,
            status: ChainStatus::Completed,
            phase: ChainPhase::Done,
            draws: (0..n)
                .map(|iteration| Draw {
                    chain_id,
                    iteration,
                    params: vec![GompertzParams::new(-6.0, 0.1)],
                    scales: None,
                })
                .collect(),
            divergences: 0,
            warmup_divergences: 0,
            step_size: 0.1,
            mean_accept_prob: 0.8,
            mean_tree_depth: 3.0,
            inv_mass_diagonal: vec![1.0, 1.0],
        };
        let chains = vec![chain(0, 3), chain(1, 2)];
        assert_eq!(chains.iter().map(ChainOutcome::len).sum::<usize>(), 5);
        assert_eq!(chains[1].series(1), vec![0.1, 0.1]);
    }
}
