//! Chain lifecycle: warmup, sampling, and the multi-chain driver.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::utils::sample_standard_normal;

use super::adaptation::{DualAveraging, MetricEstimator, WarmupSchedule, find_reasonable_step_size};
use super::hmc::{Metric, PhasePoint};
use super::nuts::{TransitionStats, nuts_transition};
use super::{InferenceError, LogDensity, SamplerConfig};

/// Chain state machine: `Warmup -> Sampling -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainPhase {
    Warmup,
    Sampling,
    Done,
}

/// How a chain ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainStatus {
    Completed,
    /// Cancelled between iterations; holds the draws retained so far.
    Truncated,
    /// Target evaluation failed at `iteration` (counted within `phase`).
    Failed {
        phase: ChainPhase,
        iteration: usize,
        #[serde(skip, default = "non_finite")]
        error: InferenceError,
    },
}

const fn non_finite() -> InferenceError {
    InferenceError::NonFiniteDensity
}

impl ChainStatus {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Unconstrained output of one chain.
#[derive(Debug, Clone)]
pub struct RawChain {
    pub chain_id: usize,
    pub seed: u64,
    pub status: ChainStatus,
    /// Retained post-warmup positions, in iteration order.
    pub positions: Vec<Vec<f64>>,
    pub stats: Vec<TransitionStats>,
    pub warmup_divergences: usize,
    /// Step size frozen at the end of warmup.
    pub step_size: f64,
    pub inv_mass_diagonal: Vec<f64>,
    /// Phase the chain stopped in; `Done` only after every draw was taken.
    pub phase: ChainPhase,
}

impl RawChain {
    #[must_use]
    pub fn divergences(&self) -> usize {
        self.stats.iter().filter(|stats| stats.divergent).count()
    }
}

struct ChainRun {
    status: ChainStatus,
    phase: ChainPhase,
    positions: Vec<Vec<f64>>,
    stats: Vec<TransitionStats>,
    warmup_divergences: usize,
    step_size: f64,
    metric: Metric,
}

/// Run a single chain from `initial_position` (jittered by `config.init_jitter`).
///
/// Target failures and cancellation end the chain early but are reported
/// through [`ChainStatus`], never as an `Err`.
///
/// # Errors
///
/// Returns `InferenceError::DimensionMismatch` if `initial_position` does not
/// match the target.
pub fn run_chain<T: LogDensity + ?Sized>(
    target: &T,
    config: &SamplerConfig,
    chain_id: usize,
    initial_position: &[f64],
    cancel: &AtomicBool,
) -> Result<RawChain, InferenceError> {
    let dim = target.dim();
    if initial_position.len() != dim {
        return Err(InferenceError::DimensionMismatch {
            expected: dim,
            found: initial_position.len(),
        });
    }

    let seed = config.chain_seed(chain_id);
    let mut rng = StdRng::seed_from_u64(seed);
    let start: Vec<f64> = initial_position
        .iter()
        .map(|value| config.init_jitter.mul_add(sample_standard_normal(&mut rng), *value))
        .collect();

    let run = sample_from(target, config, start, cancel, &mut rng);
    log::debug!(
        "chain {chain_id}: step size {:.4e}, {:?} metric, {} draws ({:?})",
        run.step_size,
        run.metric.kind(),
        run.positions.len(),
        run.status
    );

    Ok(RawChain {
        chain_id,
        seed,
        status: run.status,
        positions: run.positions,
        stats: run.stats,
        warmup_divergences: run.warmup_divergences,
        step_size: run.step_size,
        inv_mass_diagonal: run.metric.inv_mass_diagonal(),
        phase: run.phase,
    })
}

fn sample_from<T: LogDensity + ?Sized>(
    target: &T,
    config: &SamplerConfig,
    start: Vec<f64>,
    cancel: &AtomicBool,
    rng: &mut StdRng,
) -> ChainRun {
    let mut run = ChainRun {
        status: ChainStatus::Completed,
        phase: ChainPhase::Warmup,
        positions: Vec::with_capacity(config.num_draws),
        stats: Vec::with_capacity(config.num_draws),
        warmup_divergences: 0,
        step_size: 1.0,
        metric: Metric::identity(start.len(), config.metric),
    };
    let fail = |phase, iteration, error| ChainStatus::Failed {
        phase,
        iteration,
        error,
    };

    let mut point = match PhasePoint::at(target, start) {
        Ok(point) => point,
        Err(error) => {
            run.status = fail(ChainPhase::Warmup, 0, error);
            return run;
        }
    };
    match find_reasonable_step_size(target, &run.metric, &point, 1.0, rng) {
        Ok(step) => run.step_size = step,
        Err(error) => {
            run.status = fail(ChainPhase::Warmup, 0, error);
            return run;
        }
    }

    let schedule = WarmupSchedule::new(config.num_warmup);
    let mut step_size = DualAveraging::new(run.step_size, config.target_accept);
    let mut estimator = MetricEstimator::new(point.position.len(), config.metric);

    for iteration in 0..config.num_warmup {
        if cancel.load(Ordering::Relaxed) {
            run.status = ChainStatus::Truncated;
            return run;
        }
        let transition = match nuts_transition(
            target,
            &run.metric,
            &point,
            step_size.current(),
            config.max_tree_depth,
            rng,
        ) {
            Ok(transition) => transition,
            Err(error) => {
                run.status = fail(ChainPhase::Warmup, iteration, error);
                return run;
            }
        };
        point = transition.point;
        step_size.update(transition.stats.accept_prob);
        if transition.stats.divergent {
            run.warmup_divergences += 1;
        }

        if schedule.in_slow_window(iteration) {
            estimator.add(&point.position);
        }
        if schedule.is_window_end(iteration) {
            if let Some(metric) = estimator.metric() {
                run.metric = metric;
            }
            estimator.reset();
            let restart =
                find_reasonable_step_size(target, &run.metric, &point, step_size.current(), rng);
            match restart {
                Ok(step) => step_size.restart(step),
                Err(error) => {
                    run.status = fail(ChainPhase::Warmup, iteration, error);
                    return run;
                }
            }
        }
    }
    run.step_size = step_size.final_step_size();
    run.phase = ChainPhase::Sampling;

    for iteration in 0..config.num_draws {
        if cancel.load(Ordering::Relaxed) {
            run.status = ChainStatus::Truncated;
            return run;
        }
        match nuts_transition(
            target,
            &run.metric,
            &point,
            run.step_size,
            config.max_tree_depth,
            rng,
        ) {
            Ok(transition) => {
                point = transition.point;
                run.positions.push(point.position.clone());
                run.stats.push(transition.stats);
            }
            Err(error) => {
                run.status = fail(ChainPhase::Sampling, iteration, error);
                return run;
            }
        }
    }
    run.phase = ChainPhase::Done;
    run
}

/// Run `config.num_chains` chains on scoped threads sharing `target`.
///
/// # Errors
///
/// Returns `InferenceError` for invalid configuration, a mismatched initial
/// position, or a panicking chain thread.
pub fn sample_chains<T: LogDensity + ?Sized>(
    target: &T,
    config: &SamplerConfig,
    initial_position: &[f64],
    cancel: &AtomicBool,
) -> Result<Vec<RawChain>, InferenceError> {
    config.validate()?;

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.num_chains)
            .map(|chain_id| {
                scope.spawn(move || run_chain(target, config, chain_id, initial_position, cancel))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(chain_id, handle)| {
                handle
                    .join()
                    .map_err(|_| InferenceError::ChainPanicked(chain_id))?
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::super::MetricKind;
    use super::super::hmc::test_targets::StandardNormal;
    use super::*;
    use crate::utils::{mean, sample_variance};

    /// Unit normal whose evaluations fail once `budget` calls are used up.
    struct Exhausting {
        budget: usize,
        calls: AtomicUsize,
    }

    impl LogDensity for Exhausting {
        fn dim(&self) -> usize {
            1
        }

        fn log_density_and_gradient(
            &self,
            position: &[f64],
            gradient: &mut [f64],
        ) -> Result<f64, InferenceError> {
            if self.calls.fetch_add(1, Ordering::Relaxed) >= self.budget {
                return Err(InferenceError::NonFiniteDensity);
            }
            gradient[0] = -position[0];
            Ok(-0.5 * position[0] * position[0])
        }
    }

    fn small_config() -> SamplerConfig {
        SamplerConfig {
            num_chains: 2,
            num_warmup: 300,
            num_draws: 1_000,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn chains_recover_target_moments() {
        let target = StandardNormal {
            scales: vec![0.5, 4.0],
        };
        let cancel = AtomicBool::new(false);
        let chains =
            sample_chains(&target, &small_config(), &[0.0, 0.0], &cancel).expect("chains run");
        assert_eq!(chains.len(), 2);
        for chain in &chains {
            assert!(chain.status.is_completed());
            assert_eq!(chain.positions.len(), 1_000);
            assert_eq!(chain.phase, ChainPhase::Done);
            let wide: Vec<f64> = chain.positions.iter().map(|p| p[1]).collect();
            let sd = sample_variance(&wide, mean(&wide)).sqrt();
            assert!((sd - 4.0).abs() < 1.0, "sd {sd}");
        }
        // Adapted metric tracks the scale ordering.
        assert!(chains[0].inv_mass_diagonal[1] > chains[0].inv_mass_diagonal[0]);
    }

    #[test]
    fn dense_metric_chains_complete() {
        let target = StandardNormal {
            scales: vec![1.0, 2.0],
        };
        let config = SamplerConfig {
            metric: MetricKind::Dense,
            num_chains: 1,
            ..small_config()
        };
        let cancel = AtomicBool::new(false);
        let chain = run_chain(&target, &config, 0, &[0.1, 0.1], &cancel).expect("chain runs");
        assert!(chain.status.is_completed());
        assert!(chain.step_size > 0.0);
    }

    #[test]
    fn failing_chain_keeps_draws_before_failure() {
        let target = Exhausting {
            budget: 500,
            calls: AtomicUsize::new(0),
        };
        let config = SamplerConfig {
            num_chains: 1,
            num_warmup: 0,
            num_draws: 20_000,
            init_jitter: 0.0,
            ..SamplerConfig::default()
        };
        let cancel = AtomicBool::new(false);
        let chain = run_chain(&target, &config, 0, &[0.0], &cancel).expect("chain runs");
        let ChainStatus::Failed {
            phase, iteration, ..
        } = chain.status
        else {
            panic!("chain should fail once its evaluation budget is spent");
        };
        assert_eq!(phase, ChainPhase::Sampling);
        assert_eq!(chain.phase, ChainPhase::Sampling);
        assert_eq!(chain.positions.len(), iteration);
        assert_eq!(chain.stats.len(), iteration);
        assert!(!chain.positions.is_empty());
        assert!(chain.positions.len() < 20_000);
    }

    #[test]
    fn cancelled_chain_is_truncated() {
        let target = StandardNormal { scales: vec![1.0] };
        let cancel = AtomicBool::new(true);
        let chains = sample_chains(&target, &small_config(), &[0.0], &cancel).expect("chains run");
        for chain in chains {
            assert_eq!(chain.status, ChainStatus::Truncated);
            assert_eq!(chain.phase, ChainPhase::Warmup);
            assert!(chain.positions.is_empty());
        }
    }

    #[test]
    fn wrong_initial_dimension_is_rejected() {
        let target = StandardNormal { scales: vec![1.0] };
        let cancel = AtomicBool::new(false);
        let err = sample_chains(&target, &small_config(), &[0.0, 1.0], &cancel)
            .expect_err("dimension mismatch");
        assert_eq!(
            err,
            InferenceError::DimensionMismatch {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn replica_chains_are_identical() {
        let target = StandardNormal {
            scales: vec![1.0, 1.0],
        };
        let config = SamplerConfig {
            seed_stride: 0,
            num_warmup: 100,
            num_draws: 200,
            ..small_config()
        };
        let cancel = AtomicBool::new(false);
        let chains = sample_chains(&target, &config, &[0.0, 0.0], &cancel).expect("chains run");
        assert_eq!(chains[0].positions, chains[1].positions);
    }
}
