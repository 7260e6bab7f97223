//! Observation models: Poisson death counts and aggregate survival probabilities.

use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::input::{CountObservation, InputError, SurvivalObservation};
use crate::utils::u64_to_f64;

use super::hazard::{CumulativeHazard, GompertzHazard, GompertzParams};

/// Observed survival probabilities are clamped to `[EPS, 1 - EPS]` before the logit.
pub const SURVIVAL_PROBABILITY_EPS: f64 = 1.0e-9;

/// Default scale of the logit-Normal survival likelihood.
pub const DEFAULT_SURVIVAL_LOGIT_SCALE: f64 = 0.1;

/// Which variant of the Gompertz model a panel is fitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObservationModel {
    /// Independent strata of death counts under the static priors.
    #[default]
    Count,
    /// Time-ordered count strata linked by a Gaussian random walk.
    RandomWalk,
    /// Areas with counts or a single aggregate survival observation.
    MixedArea,
}

/// Log-likelihood and its gradient with respect to `(log_alpha, beta)`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LogLikelihood {
    pub value: f64,
    pub d_log_alpha: f64,
    pub d_beta: f64,
}

impl LogLikelihood {
    fn add(&mut self, value: f64, d_log_alpha: f64, d_beta: f64) {
        self.value += value;
        self.d_log_alpha += d_log_alpha;
        self.d_beta += d_beta;
    }
}

/// Poisson log-probability of `count` given rate `exposure * exp(eta)`, with
/// its derivative with respect to `eta`.
///
/// Zero exposure contributes nothing regardless of the count.
#[must_use]
pub fn poisson_log_probability(count: u64, exposure: f64, eta: f64) -> (f64, f64) {
    if exposure <= 0.0 {
        return (0.0, 0.0);
    }
    let k = u64_to_f64(count);
    let expected = exposure * eta.exp();
    (
        k.mul_add(exposure.ln() + eta, -expected) - ln_gamma(k + 1.0),
        k - expected,
    )
}

/// Poisson log-likelihood of one stratum's death counts.
#[must_use]
pub fn count_log_likelihood<'a>(
    hazard: &GompertzHazard,
    params: GompertzParams,
    counts: impl IntoIterator<Item = &'a CountObservation>,
) -> LogLikelihood {
    let mut total = LogLikelihood::default();
    for observation in counts {
        let log_hazard = hazard.log_hazard(params, observation.age);
        let (value, d_eta) =
            poisson_log_probability(observation.count, observation.exposure, log_hazard.eta);
        let d_eta = d_eta * log_hazard.slope;
        total.add(value, d_eta, d_eta * hazard.centered(observation.age));
    }
    total
}

/// Log-likelihood of one aggregate survival observation.
///
/// Without a sample size, `logit(observed) ~ Normal(logit(q), logit_scale)`.
/// With a sample size `n`, the observation counts as `n` Binomial
/// pseudo-trials: `n * (p ln q + (1 - p) ln(1 - q))`.
///
/// # Errors
///
/// Returns `InputError` if the observation's age range is not on the grid.
pub fn survival_log_likelihood(
    hazard: &GompertzHazard,
    params: GompertzParams,
    observation: &SurvivalObservation,
    logit_scale: f64,
) -> Result<LogLikelihood, InputError> {
    let cumulative = hazard.cumulative_hazard(params, observation.age_start, observation.age_end)?;
    Ok(survival_term(cumulative, observation, logit_scale))
}

/// Survival log-likelihood given the cumulative hazard over the observation's range.
#[must_use]
pub fn survival_term(
    cumulative: CumulativeHazard,
    observation: &SurvivalObservation,
    logit_scale: f64,
) -> LogLikelihood {
    // ln(1 - q) = -S; keep q inside the same bounds as the observation.
    let s_min = -(-SURVIVAL_PROBABILITY_EPS).ln_1p();
    let s_max = -SURVIVAL_PROBABILITY_EPS.ln();
    let (s, s_slope) = if cumulative.value < s_min {
        (s_min, 0.0)
    } else if cumulative.value > s_max {
        (s_max, 0.0)
    } else {
        (cumulative.value, 1.0)
    };
    let q = -(-s).exp_m1();

    let (value, d_s) = match observation.sample_size {
        None => {
            let observed = observation
                .observed_probability
                .clamp(SURVIVAL_PROBABILITY_EPS, 1.0 - SURVIVAL_PROBABILITY_EPS);
            let observed_logit = (observed / (1.0 - observed)).ln();
            let model_logit = q.ln() + s;
            let z = (observed_logit - model_logit) / logit_scale;
            let value = -0.5 * z * z - logit_scale.ln() - 0.5 * std::f64::consts::TAU.ln();
            // d logit(q) / dS = 1 / q
            (value, z / logit_scale / q)
        }
        Some(n) => {
            let p = observation.observed_probability;
            let value = n * p.mul_add(q.ln(), -(1.0 - p) * s);
            (value, n * (p * (1.0 - q) / q - (1.0 - p)))
        }
    };

    let d_s = d_s * s_slope;
    LogLikelihood {
        value,
        d_log_alpha: d_s * cumulative.d_log_alpha,
        d_beta: d_s * cumulative.d_beta,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::input::AgeGrid;
    use crate::models::gompertz::hazard::DEFAULT_AGE_REFERENCE;

    fn hazard() -> GompertzHazard {
        GompertzHazard::new(AgeGrid::new(40, 59).expect("grid"), DEFAULT_AGE_REFERENCE)
    }

    fn finite_difference<F: Fn(GompertzParams) -> f64>(f: F, params: GompertzParams) -> [f64; 2] {
        let h = 1.0e-6;
        [
            (f(GompertzParams::new(params.log_alpha + h, params.beta))
                - f(GompertzParams::new(params.log_alpha - h, params.beta)))
                / (2.0 * h),
            (f(GompertzParams::new(params.log_alpha, params.beta + h))
                - f(GompertzParams::new(params.log_alpha, params.beta - h)))
                / (2.0 * h),
        ]
    }

    #[test]
    fn poisson_matches_direct_formula() {
        let (value, d_eta) = poisson_log_probability(3, 100.0, -3.0);
        let lambda = 100.0 * (-3.0_f64).exp();
        let expected = 3.0 * lambda.ln() - lambda - 6.0_f64.ln();
        assert_relative_eq!(value, expected, epsilon = 1.0e-12);
        assert_relative_eq!(d_eta, 3.0 - lambda, epsilon = 1.0e-12);
    }

    #[test]
    fn zero_exposure_contributes_nothing() {
        assert_eq!(poisson_log_probability(7, 0.0, -2.0), (0.0, 0.0));
    }

    #[test]
    fn count_gradient_matches_finite_differences() {
        let model = hazard();
        let counts: Vec<CountObservation> = (40..=59)
            .map(|age| CountObservation::new(age, 1.0e4, u64::try_from(age - 35).unwrap_or(0)))
            .collect();
        let params = GompertzParams::new(-6.2, 0.09);
        let analytic = count_log_likelihood(&model, params, &counts);
        let numeric =
            finite_difference(|p| count_log_likelihood(&model, p, &counts).value, params);
        assert_relative_eq!(analytic.d_log_alpha, numeric[0], max_relative = 1.0e-5);
        assert_relative_eq!(analytic.d_beta, numeric[1], max_relative = 1.0e-5);
    }

    #[test]
    fn logit_survival_gradient_matches_finite_differences() {
        let model = hazard();
        let observation = SurvivalObservation::new(40, 59, 0.05);
        let params = GompertzParams::new(-6.5, 0.12);
        let analytic =
            survival_log_likelihood(&model, params, &observation, 0.1).expect("valid range");
        let numeric = finite_difference(
            |p| {
                survival_log_likelihood(&model, p, &observation, 0.1)
                    .expect("valid range")
                    .value
            },
            params,
        );
        assert_relative_eq!(analytic.d_log_alpha, numeric[0], max_relative = 1.0e-5);
        assert_relative_eq!(analytic.d_beta, numeric[1], max_relative = 1.0e-5);
    }

    #[test]
    fn binomial_survival_gradient_matches_finite_differences() {
        let model = hazard();
        let observation = SurvivalObservation::new(45, 55, 0.04).with_sample_size(2_000.0);
        let params = GompertzParams::new(-6.0, 0.1);
        let analytic =
            survival_log_likelihood(&model, params, &observation, 0.1).expect("valid range");
        let numeric = finite_difference(
            |p| {
                survival_log_likelihood(&model, p, &observation, 0.1)
                    .expect("valid range")
                    .value
            },
            params,
        );
        assert_relative_eq!(analytic.d_log_alpha, numeric[0], max_relative = 1.0e-5);
        assert_relative_eq!(analytic.d_beta, numeric[1], max_relative = 1.0e-5);
    }

    #[test]
    fn logit_likelihood_peaks_at_matching_probability() {
        let model = hazard();
        let params = GompertzParams::new(-6.0, 0.1);
        let q = model.survival_prob(params, 40, 59).expect("valid range");
        let at_truth =
            survival_log_likelihood(&model, params, &SurvivalObservation::new(40, 59, q), 0.1)
                .expect("valid range");
        let off = survival_log_likelihood(
            &model,
            params,
            &SurvivalObservation::new(40, 59, q * 1.5),
            0.1,
        )
        .expect("valid range");
        assert!(at_truth.value > off.value);
        assert_relative_eq!(at_truth.d_log_alpha, 0.0, epsilon = 1.0e-6);
    }

    #[test]
    fn extreme_observations_stay_finite() {
        let model = hazard();
        let params = GompertzParams::new(-6.0, 0.1);
        for probability in [0.0, 1.0] {
            let ll = survival_log_likelihood(
                &model,
                params,
                &SurvivalObservation::new(40, 59, probability),
                0.1,
            )
            .expect("valid range");
            assert!(ll.value.is_finite());
        }
    }
}
