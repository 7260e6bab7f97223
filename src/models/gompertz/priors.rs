//! Prior specifications and log-density helpers for the Gompertz models.

use serde::{Deserialize, Serialize};

const LN_SQRT_TAU: f64 = 0.918_938_533_204_672_8;

/// `Normal(mean, sd)` prior on an unconstrained scalar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalPrior {
    pub mean: f64,
    pub sd: f64,
}

impl NormalPrior {
    #[must_use]
    pub const fn new(mean: f64, sd: f64) -> Self {
        Self { mean, sd }
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.mean.is_finite() && self.sd.is_finite() && self.sd > 0.0
    }

    /// Log-density at `value` and its derivative.
    #[must_use]
    pub fn log_density_with_gradient(self, value: f64) -> (f64, f64) {
        normal_log_density_with_gradient(value, self.mean, self.sd)
    }
}

/// Hyperparameters for every Gompertz variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GompertzPriorConfig {
    /// `log_alpha` prior of the static count model.
    pub static_log_alpha: NormalPrior,
    /// `beta` prior of the static count model.
    pub static_beta: NormalPrior,
    /// `log_alpha` prior of the first random-walk stratum and of every area.
    pub initial_log_alpha: NormalPrior,
    /// `beta` prior of the first random-walk stratum and of every area.
    pub initial_beta: NormalPrior,
    /// Half-normal scale for the random-walk step of `log_alpha`.
    pub sigma_alpha_scale: f64,
    /// Half-normal scale for the random-walk step of `beta`.
    pub sigma_beta_scale: f64,
}

impl Default for GompertzPriorConfig {
    fn default() -> Self {
        Self {
            static_log_alpha: NormalPrior::new(0.0, 10.0),
            static_beta: NormalPrior::new(0.0, 0.1),
            initial_log_alpha: NormalPrior::new(-6.0, 1.0),
            initial_beta: NormalPrior::new(0.1, 0.1),
            sigma_alpha_scale: 1.0,
            sigma_beta_scale: 1.0,
        }
    }
}

impl GompertzPriorConfig {
    /// Whether all prior hyperparameters are numerically valid.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.static_log_alpha.is_valid()
            && self.static_beta.is_valid()
            && self.initial_log_alpha.is_valid()
            && self.initial_beta.is_valid()
            && self.sigma_alpha_scale.is_finite()
            && self.sigma_alpha_scale > 0.0
            && self.sigma_beta_scale.is_finite()
            && self.sigma_beta_scale > 0.0
    }
}

/// `ln Normal(value | mean, sd)` and its derivative with respect to `value`.
#[must_use]
pub fn normal_log_density_with_gradient(value: f64, mean: f64, sd: f64) -> (f64, f64) {
    let z = (value - mean) / sd;
    (-0.5 * z * z - sd.ln() - LN_SQRT_TAU, -z / sd)
}

/// Log-density for `HalfNormal(scale)`.
#[must_use]
pub fn log_half_normal_density(value: f64, scale: f64) -> f64 {
    if !(value >= 0.0 && scale > 0.0) {
        return f64::NEG_INFINITY;
    }
    let z = value / scale;
    std::f64::consts::LN_2 - 0.5 * z * z - scale.ln() - LN_SQRT_TAU
}

/// Half-normal prior on `sigma = exp(log_sigma)` plus the log-Jacobian
/// `log_sigma`, with the derivative with respect to `log_sigma`.
#[must_use]
pub fn log_sigma_prior_with_gradient(log_sigma: f64, scale: f64) -> (f64, f64) {
    let sigma = log_sigma.exp();
    let ratio = sigma / scale;
    (
        log_half_normal_density(sigma, scale) + log_sigma,
        1.0 - ratio * ratio,
    )
}

/// `ln Normal(current | previous, exp(log_sigma))` with derivatives with
/// respect to `current`, `previous` and `log_sigma`.
#[must_use]
pub fn random_walk_step_with_gradient(
    current: f64,
    previous: f64,
    log_sigma: f64,
) -> (f64, [f64; 3]) {
    let sigma = log_sigma.exp();
    let diff = current - previous;
    let scaled = diff / sigma;
    let d_current = -scaled / sigma;
    (
        -0.5 * scaled * scaled - log_sigma - LN_SQRT_TAU,
        [d_current, -d_current, scaled.mul_add(scaled, -1.0)],
    )
}
