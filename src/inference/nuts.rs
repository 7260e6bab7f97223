//! Multinomial No-U-Turn transition with recursive tree doubling.

use rand::RngExt;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::utils::{log_sum_exp, usize_to_f64};

use super::hmc::{Metric, PhasePoint, dot, leapfrog};
use super::{InferenceError, LogDensity};

/// Energy error beyond which a trajectory is flagged divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 1_000.0;

/// Per-iteration sampler statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionStats {
    /// Mean of `min(1, exp(H0 - H))` over the trajectory.
    pub accept_prob: f64,
    pub tree_depth: usize,
    pub n_leapfrog: usize,
    pub divergent: bool,
    /// Hamiltonian at the start of the transition.
    pub energy: f64,
    pub step_size: f64,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub point: PhasePoint,
    pub stats: TransitionStats,
}

struct Trajectory {
    left: PhasePoint,
    right: PhasePoint,
    proposal: PhasePoint,
    log_weight: f64,
    sum_accept: f64,
    n_leapfrog: usize,
    divergent: bool,
    turning: bool,
}

impl Trajectory {
    const fn is_valid(&self) -> bool {
        !self.divergent && !self.turning
    }

    const fn edge(&self, direction: f64) -> &PhasePoint {
        if direction > 0.0 { &self.right } else { &self.left }
    }
}

struct TreeBuilder<'a, T: LogDensity + ?Sized> {
    target: &'a T,
    metric: &'a Metric,
    step_size: f64,
    initial_energy: f64,
}

impl<T: LogDensity + ?Sized> TreeBuilder<'_, T> {
    fn leaf(&self, from: &PhasePoint, direction: f64) -> Result<Trajectory, InferenceError> {
        let point = leapfrog(self.target, self.metric, from, direction * self.step_size)?;
        let energy = point.hamiltonian(self.metric);
        let energy_error = energy - self.initial_energy;
        let divergent = !energy_error.is_finite() || energy_error > DIVERGENCE_THRESHOLD;
        let log_weight = if energy_error.is_nan() {
            f64::NEG_INFINITY
        } else {
            -energy_error
        };
        let sum_accept = if energy_error.is_nan() {
            0.0
        } else {
            (-energy_error).exp().min(1.0)
        };
        Ok(Trajectory {
            left: point.clone(),
            right: point.clone(),
            proposal: point,
            log_weight,
            sum_accept,
            n_leapfrog: 1,
            divergent,
            turning: false,
        })
    }

    fn build(
        &self,
        from: &PhasePoint,
        depth: usize,
        direction: f64,
        rng: &mut StdRng,
    ) -> Result<Trajectory, InferenceError> {
        if depth == 0 {
            return self.leaf(from, direction);
        }

        let inner = self.build(from, depth - 1, direction, rng)?;
        if !inner.is_valid() {
            return Ok(inner);
        }
        let outer = self.build(inner.edge(direction), depth - 1, direction, rng)?;

        let log_weight = log_sum_exp(inner.log_weight, outer.log_weight);
        let take_outer = outer.is_valid()
            && rng.random::<f64>().ln() < outer.log_weight - log_weight;
        let (left, right) = if direction > 0.0 {
            (inner.left, outer.right)
        } else {
            (outer.left, inner.right)
        };
        let turning = outer.turning || is_turning(self.metric, &left, &right);
        Ok(Trajectory {
            proposal: if take_outer { outer.proposal } else { inner.proposal },
            left,
            right,
            log_weight,
            sum_accept: inner.sum_accept + outer.sum_accept,
            n_leapfrog: inner.n_leapfrog + outer.n_leapfrog,
            divergent: outer.divergent,
            turning,
        })
    }
}

/// Endpoint no-U-turn criterion using velocities `M^{-1} p`.
fn is_turning(metric: &Metric, left: &PhasePoint, right: &PhasePoint) -> bool {
    let span: Vec<f64> = right
        .position
        .iter()
        .zip(&left.position)
        .map(|(r, l)| r - l)
        .collect();
    dot(&span, &metric.velocity(&left.momentum)) < 0.0
        || dot(&span, &metric.velocity(&right.momentum)) < 0.0
}

/// One NUTS transition from `current`.
///
/// # Errors
///
/// Propagates `NonFiniteDensity` from the target; divergences are reported in
/// the statistics instead.
pub fn nuts_transition<T: LogDensity + ?Sized>(
    target: &T,
    metric: &Metric,
    current: &PhasePoint,
    step_size: f64,
    max_tree_depth: usize,
    rng: &mut StdRng,
) -> Result<Transition, InferenceError> {
    let mut start = current.clone();
    start.momentum = metric.sample_momentum(rng);
    let initial_energy = start.hamiltonian(metric);
    let builder = TreeBuilder {
        target,
        metric,
        step_size,
        initial_energy,
    };

    let mut tree = Trajectory {
        left: start.clone(),
        right: start.clone(),
        proposal: start,
        log_weight: 0.0,
        sum_accept: 0.0,
        n_leapfrog: 0,
        divergent: false,
        turning: false,
    };
    let mut depth = 0;

    while depth < max_tree_depth {
        let direction = if rng.random::<f64>() < 0.5 { -1.0 } else { 1.0 };
        let subtree = builder.build(tree.edge(direction), depth, direction, rng)?;
        depth += 1;

        tree.sum_accept += subtree.sum_accept;
        tree.n_leapfrog += subtree.n_leapfrog;
        if !subtree.is_valid() {
            tree.divergent = subtree.divergent;
            break;
        }

        // Biased progressive sampling favours the newer subtree.
        let accept = (subtree.log_weight - tree.log_weight).exp().min(1.0);
        let Trajectory {
            left: sub_left,
            right: sub_right,
            proposal: sub_proposal,
            log_weight: sub_log_weight,
            ..
        } = subtree;
        if rng.random::<f64>() < accept {
            tree.proposal = sub_proposal;
        }
        tree.log_weight = log_sum_exp(tree.log_weight, sub_log_weight);
        if direction > 0.0 {
            tree.right = sub_right;
        } else {
            tree.left = sub_left;
        }

        if is_turning(metric, &tree.left, &tree.right) {
            break;
        }
    }

    let accept_prob = if tree.n_leapfrog == 0 {
        0.0
    } else {
        tree.sum_accept / usize_to_f64(tree.n_leapfrog)
    };
    Ok(Transition {
        point: tree.proposal,
        stats: TransitionStats {
            accept_prob,
            tree_depth: depth,
            n_leapfrog: tree.n_leapfrog,
            divergent: tree.divergent,
            energy: initial_energy,
            step_size,
        },
    })
}
