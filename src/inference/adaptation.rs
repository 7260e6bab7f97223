//! Warmup adaptation: dual-averaging step size and windowed metric estimation.

use faer::Mat;
use rand::rngs::StdRng;

use crate::utils::usize_to_f64;

use super::hmc::{Metric, PhasePoint, leapfrog};
use super::{InferenceError, LogDensity, MetricKind};

const DUAL_AVERAGING_GAMMA: f64 = 0.05;
const DUAL_AVERAGING_T0: f64 = 10.0;
const DUAL_AVERAGING_KAPPA: f64 = 0.75;

const INIT_BUFFER: usize = 75;
const TERM_BUFFER: usize = 50;
const BASE_WINDOW: usize = 25;
/// Below this many warmup iterations only the step size is adapted.
const MIN_METRIC_WARMUP: usize = 20;

const METRIC_SHRINKAGE_COUNT: f64 = 5.0;
const METRIC_SHRINKAGE_TARGET: f64 = 1.0e-3;

const STEP_SIZE_SEARCH_LIMIT: usize = 100;

/// Nesterov dual averaging of `ln(step_size)` (Hoffman and Gelman, 2014).
#[derive(Debug, Clone, Copy)]
pub struct DualAveraging {
    target_accept: f64,
    mu: f64,
    log_step: f64,
    log_step_bar: f64,
    h_bar: f64,
    counter: f64,
}

impl DualAveraging {
    #[must_use]
    pub fn new(initial_step: f64, target_accept: f64) -> Self {
        let mut state = Self {
            target_accept,
            mu: 0.0,
            log_step: 0.0,
            log_step_bar: 0.0,
            h_bar: 0.0,
            counter: 0.0,
        };
        state.restart(initial_step);
        state
    }

    /// Reset the averaging around a new starting step size.
    pub fn restart(&mut self, initial_step: f64) {
        self.mu = (10.0 * initial_step).ln();
        self.log_step = initial_step.ln();
        self.log_step_bar = 0.0;
        self.h_bar = 0.0;
        self.counter = 0.0;
    }

    pub fn update(&mut self, accept_prob: f64) {
        self.counter += 1.0;
        let eta = 1.0 / (self.counter + DUAL_AVERAGING_T0);
        self.h_bar = (1.0 - eta).mul_add(self.h_bar, eta * (self.target_accept - accept_prob));
        self.log_step = self.mu - self.counter.sqrt() / DUAL_AVERAGING_GAMMA * self.h_bar;
        let weight = self.counter.powf(-DUAL_AVERAGING_KAPPA);
        self.log_step_bar = weight.mul_add(self.log_step, (1.0 - weight) * self.log_step_bar);
    }

    /// Step size for the next warmup iteration.
    #[must_use]
    pub fn current(&self) -> f64 {
        self.log_step.exp()
    }

    /// Averaged step size frozen for sampling.
    #[must_use]
    pub fn final_step_size(&self) -> f64 {
        if self.counter == 0.0 {
            self.current()
        } else {
            self.log_step_bar.exp()
        }
    }
}

/// Stan-style warmup windows: a fast initial buffer, doubling slow windows,
/// and a fast terminal buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupSchedule {
    slow_start: usize,
    slow_end: usize,
    /// Last iteration (inclusive) of each slow window.
    window_ends: Vec<usize>,
}

impl WarmupSchedule {
    #[must_use]
    pub fn new(num_warmup: usize) -> Self {
        if num_warmup < MIN_METRIC_WARMUP {
            return Self {
                slow_start: num_warmup,
                slow_end: num_warmup,
                window_ends: Vec::new(),
            };
        }

        let (init_buffer, term_buffer, base_window) =
            if INIT_BUFFER + BASE_WINDOW + TERM_BUFFER > num_warmup {
                let init = num_warmup * 15 / 100;
                let term = num_warmup / 10;
                (init, term, num_warmup - init - term)
            } else {
                (INIT_BUFFER, TERM_BUFFER, BASE_WINDOW)
            };

        let slow_end = num_warmup - term_buffer;
        let mut window_ends = Vec::new();
        let mut start = init_buffer;
        let mut size = base_window;
        while start < slow_end {
            let mut end = (start + size).min(slow_end);
            if end + 2 * size > slow_end {
                end = slow_end;
            }
            window_ends.push(end - 1);
            start = end;
            size *= 2;
        }

        Self {
            slow_start: init_buffer,
            slow_end,
            window_ends,
        }
    }

    /// Whether warmup iteration `iteration` feeds the metric estimator.
    #[must_use]
    pub const fn in_slow_window(&self, iteration: usize) -> bool {
        iteration >= self.slow_start && iteration < self.slow_end
    }

    /// Whether the metric is refreshed after warmup iteration `iteration`.
    #[must_use]
    pub fn is_window_end(&self, iteration: usize) -> bool {
        self.window_ends.contains(&iteration)
    }

    #[must_use]
    pub fn window_ends(&self) -> &[usize] {
        &self.window_ends
    }
}

/// Welford accumulator for the position covariance within one slow window.
#[derive(Debug, Clone)]
pub struct MetricEstimator {
    kind: MetricKind,
    count: usize,
    mean: Vec<f64>,
    /// Sum of outer products of deviations (only the diagonal for `Diagonal`).
    scatter: Mat<f64>,
}

impl MetricEstimator {
    #[must_use]
    pub fn new(dim: usize, kind: MetricKind) -> Self {
        let cols = match kind {
            MetricKind::Diagonal => 1,
            MetricKind::Dense => dim,
        };
        Self {
            kind,
            count: 0,
            mean: vec![0.0; dim],
            scatter: Mat::zeros(dim, cols),
        }
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    pub fn add(&mut self, position: &[f64]) {
        self.count += 1;
        let n = usize_to_f64(self.count);
        let before: Vec<f64> = position
            .iter()
            .zip(&self.mean)
            .map(|(x, m)| x - m)
            .collect();
        for (m, delta) in self.mean.iter_mut().zip(&before) {
            *m += delta / n;
        }
        let after: Vec<f64> = position
            .iter()
            .zip(&self.mean)
            .map(|(x, m)| x - m)
            .collect();
        match self.kind {
            MetricKind::Diagonal => {
                for (i, (b, a)) in before.iter().zip(&after).enumerate() {
                    self.scatter[(i, 0)] += b * a;
                }
            }
            MetricKind::Dense => {
                for (i, b) in before.iter().enumerate() {
                    for (j, a) in after.iter().enumerate() {
                        self.scatter[(i, j)] += b * a;
                    }
                }
            }
        }
    }

    /// Regularized metric `(n / (n + 5)) * cov + 1e-3 * (5 / (n + 5)) * I`.
    ///
    /// Returns `None` with fewer than three samples or when a dense estimate is
    /// not positive definite.
    #[must_use]
    pub fn metric(&self) -> Option<Metric> {
        if self.count < 3 {
            return None;
        }
        let n = usize_to_f64(self.count);
        let weight = n / (n + METRIC_SHRINKAGE_COUNT);
        let shrinkage =
            METRIC_SHRINKAGE_TARGET * (METRIC_SHRINKAGE_COUNT / (n + METRIC_SHRINKAGE_COUNT));
        let dim = self.mean.len();
        match self.kind {
            MetricKind::Diagonal => {
                let inv_mass: Vec<f64> = (0..dim)
                    .map(|i| weight.mul_add(self.scatter[(i, 0)] / (n - 1.0), shrinkage))
                    .collect();
                inv_mass
                    .iter()
                    .all(|value| value.is_finite() && *value > 0.0)
                    .then_some(Metric::Diagonal { inv_mass })
            }
            MetricKind::Dense => {
                let covariance = Mat::from_fn(dim, dim, |i, j| {
                    let scaled = weight * self.scatter[(i, j)] / (n - 1.0);
                    if i == j { scaled + shrinkage } else { scaled }
                });
                Metric::dense(covariance)
            }
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.mean.fill(0.0);
        let (rows, cols) = (self.scatter.nrows(), self.scatter.ncols());
        self.scatter = Mat::zeros(rows, cols);
    }
}

/// Heuristic initial step size: double or halve until the one-step
/// acceptance ratio crosses 0.8.
///
/// # Errors
///
/// Propagates target failures.
pub fn find_reasonable_step_size<T: LogDensity + ?Sized>(
    target: &T,
    metric: &Metric,
    point: &PhasePoint,
    initial_step: f64,
    rng: &mut StdRng,
) -> Result<f64, InferenceError> {
    let log_threshold = 0.8_f64.ln();
    let mut start = point.clone();
    start.momentum = metric.sample_momentum(rng);
    let h0 = start.hamiltonian(metric);

    let log_accept = |step: f64| -> Result<f64, InferenceError> {
        let next = leapfrog(target, metric, &start, step)?;
        let delta = h0 - next.hamiltonian(metric);
        Ok(if delta.is_nan() { f64::NEG_INFINITY } else { delta })
    };

    let mut step = initial_step;
    let increase = log_accept(step)? > log_threshold;
    for _ in 0..STEP_SIZE_SEARCH_LIMIT {
        let candidate = if increase { step * 2.0 } else { step * 0.5 };
        if !(1.0e-10..=1.0e7).contains(&candidate) {
            break;
        }
        let crossed = if increase {
            log_accept(candidate)? <= log_threshold
        } else {
            log_accept(candidate)? > log_threshold
        };
        if crossed {
            // Keep the last step on the accepting side of the threshold.
            if !increase {
                step = candidate;
            }
            break;
        }
        step = candidate;
    }
    Ok(step)
}
