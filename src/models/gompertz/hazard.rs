//! Gompertz hazard `mu(x) = exp(log_alpha + beta * (x - age_reference))`.

use serde::{Deserialize, Serialize};

use crate::input::{AgeGrid, InputError};

/// Underflow guard on the log hazard; `exp` stays a positive normal `f64`.
pub const LOG_HAZARD_MIN: f64 = -700.0;
/// Upper clamp on the log hazard, `ln(1e6)`.
pub const LOG_HAZARD_MAX: f64 = 13.815_510_557_964_274;

/// Default centering age for the linear predictor.
pub const DEFAULT_AGE_REFERENCE: f64 = 40.0;

/// Level and slope of one stratum's log hazard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GompertzParams {
    pub log_alpha: f64,
    pub beta: f64,
}

impl GompertzParams {
    #[must_use]
    pub const fn new(log_alpha: f64, beta: f64) -> Self {
        Self { log_alpha, beta }
    }
}

/// Clamped log hazard and its derivative with respect to the raw predictor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampedLogHazard {
    pub eta: f64,
    /// `1` inside the clamp, `0` outside.
    pub slope: f64,
}

impl ClampedLogHazard {
    #[must_use]
    pub fn hazard(self) -> f64 {
        self.eta.exp()
    }
}

/// Clamp a linear predictor to `[LOG_HAZARD_MIN, LOG_HAZARD_MAX]`.
#[must_use]
pub fn log_hazard_clamped(eta: f64) -> ClampedLogHazard {
    if eta < LOG_HAZARD_MIN {
        ClampedLogHazard {
            eta: LOG_HAZARD_MIN,
            slope: 0.0,
        }
    } else if eta > LOG_HAZARD_MAX {
        ClampedLogHazard {
            eta: LOG_HAZARD_MAX,
            slope: 0.0,
        }
    } else {
        ClampedLogHazard { eta, slope: 1.0 }
    }
}

/// Cumulative hazard over an age range with its parameter gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CumulativeHazard {
    pub value: f64,
    pub d_log_alpha: f64,
    pub d_beta: f64,
}

/// Gompertz hazard bound to an age grid and a centering age.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GompertzHazard {
    age_grid: AgeGrid,
    age_reference: f64,
}

impl GompertzHazard {
    #[must_use]
    pub const fn new(age_grid: AgeGrid, age_reference: f64) -> Self {
        Self {
            age_grid,
            age_reference,
        }
    }

    #[must_use]
    pub const fn age_grid(&self) -> &AgeGrid {
        &self.age_grid
    }

    #[must_use]
    pub const fn age_reference(&self) -> f64 {
        self.age_reference
    }

    /// Centered age `x - age_reference`.
    #[must_use]
    pub fn centered(&self, age: i32) -> f64 {
        f64::from(age) - self.age_reference
    }

    /// Clamped log hazard at `age`, without a grid check.
    #[must_use]
    pub fn log_hazard(&self, params: GompertzParams, age: i32) -> ClampedLogHazard {
        log_hazard_clamped(params.beta.mul_add(self.centered(age), params.log_alpha))
    }

    /// # Errors
    ///
    /// Returns `InputError::AgeOutsideGrid` if `age` is not on the grid.
    pub fn hazard(&self, params: GompertzParams, age: i32) -> Result<f64, InputError> {
        self.age_grid.index_of(age)?;
        Ok(self.log_hazard(params, age).hazard())
    }

    /// Sum of `mu(x)` for `x` in `age_start..=age_end`, with its gradient.
    ///
    /// # Errors
    ///
    /// Returns `InputError` for an inverted or out-of-grid range.
    pub fn cumulative_hazard(
        &self,
        params: GompertzParams,
        age_start: i32,
        age_end: i32,
    ) -> Result<CumulativeHazard, InputError> {
        self.age_grid.check_range(age_start, age_end)?;
        Ok(self.accumulate(params, age_start, age_end))
    }

    /// [`GompertzHazard::cumulative_hazard`] for a range already checked against the grid.
    pub(crate) fn accumulate(
        &self,
        params: GompertzParams,
        age_start: i32,
        age_end: i32,
    ) -> CumulativeHazard {
        let mut total = CumulativeHazard {
            value: 0.0,
            d_log_alpha: 0.0,
            d_beta: 0.0,
        };
        for age in age_start..=age_end {
            let log_hazard = self.log_hazard(params, age);
            let mu = log_hazard.hazard();
            let d_eta = mu * log_hazard.slope;
            total.value += mu;
            total.d_log_alpha += d_eta;
            total.d_beta += d_eta * self.centered(age);
        }
        total
    }

    /// Probability of dying within `age_start..=age_end`, `-expm1(-sum mu(x))`.
    ///
    /// # Errors
    ///
    /// Returns `InputError` for an inverted or out-of-grid range.
    pub fn survival_prob(
        &self,
        params: GompertzParams,
        age_start: i32,
        age_end: i32,
    ) -> Result<f64, InputError> {
        let cumulative = self.cumulative_hazard(params, age_start, age_end)?;
        Ok(-(-cumulative.value).exp_m1())
    }

    /// Age at which the Gompertz death density peaks; `None` unless `beta > 0`.
    #[must_use]
    pub fn modal_age_at_death(&self, params: GompertzParams) -> Option<f64> {
        if params.beta <= 0.0 || !params.beta.is_finite() {
            return None;
        }
        let modal = (params.beta.ln() - params.log_alpha) / params.beta + self.age_reference;
        modal.is_finite().then_some(modal)
    }

    /// Single-year death probabilities `q(x) = 1 - exp(-mu(x))` over the grid.
    #[must_use]
    pub fn life_table_probabilities(&self, params: GompertzParams) -> Vec<(i32, f64)> {
        self.age_grid
            .ages()
            .map(|age| (age, -(-self.log_hazard(params, age).hazard()).exp_m1()))
            .collect()
    }
}
