//! Joint log-density of the Gompertz models over an unconstrained vector.
//!
//! The layout is `[la_1, b_1, ..., la_S, b_S]`, followed by
//! `[ln sigma_alpha, ln sigma_beta]` for the random walk.

use crate::inference::{InferenceError, LogDensity};
use crate::input::{
    CountObservation, InputError, Panel, StratumKey, StratumKind, SurvivalObservation,
};
use crate::preprocess::{log_linear_start, pooled_start, survival_start};

use super::draws::RandomWalkScales;
use super::hazard::{GompertzHazard, GompertzParams};
use super::likelihood::{ObservationModel, count_log_likelihood, survival_term};
use super::priors::{
    GompertzPriorConfig, NormalPrior, log_sigma_prior_with_gradient,
    random_walk_step_with_gradient,
};
use super::types::{GompertzError, GompertzFitOptions};

/// Starting value of `ln sigma` for both random-walk scales.
const INITIAL_LOG_SIGMA: f64 = -2.302_585_092_994_046;

#[derive(Debug, Clone, PartialEq)]
enum StratumData {
    Counts(Vec<CountObservation>),
    Survival(SurvivalObservation),
}

#[derive(Debug, Clone, PartialEq)]
struct PreparedStratum {
    key: StratumKey,
    data: StratumData,
}

/// Posterior of one Gompertz variant on one panel.
///
/// Evaluation is pure, so chains share one instance across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct GompertzPosterior {
    model: ObservationModel,
    hazard: GompertzHazard,
    priors: GompertzPriorConfig,
    survival_logit_scale: f64,
    strata: Vec<PreparedStratum>,
}

impl GompertzPosterior {
    /// # Errors
    ///
    /// Returns `GompertzError` if the panel is empty, a stratum's contents do
    /// not suit `model`, or the priors or options are invalid.
    pub fn new(
        panel: &Panel,
        model: ObservationModel,
        priors: GompertzPriorConfig,
        options: &GompertzFitOptions,
    ) -> Result<Self, GompertzError> {
        panel.validate()?;
        options.validate()?;
        if !priors.is_valid() {
            return Err(GompertzError::InvalidPriorConfig);
        }

        let strata = panel
            .strata()
            .iter()
            .map(|stratum| {
                let unsupported = |expected| InputError::UnsupportedStratumContent {
                    stratum: stratum.key.to_string(),
                    expected,
                };
                let data = match (model, stratum.kind()) {
                    (_, StratumKind::Counts) => {
                        StratumData::Counts(stratum.counts().copied().collect())
                    }
                    (ObservationModel::MixedArea, StratumKind::SurvivalOnly) => {
                        let survival = stratum.survival().copied().ok_or_else(|| {
                            unsupported("either death counts or one survival observation")
                        })?;
                        StratumData::Survival(survival)
                    }
                    (ObservationModel::MixedArea, _) => {
                        return Err(unsupported(
                            "either death counts or one survival observation",
                        ));
                    }
                    (ObservationModel::Count | ObservationModel::RandomWalk, _) => {
                        return Err(unsupported("only death counts"));
                    }
                };
                Ok(PreparedStratum {
                    key: stratum.key.clone(),
                    data,
                })
            })
            .collect::<Result<Vec<_>, InputError>>()?;

        Ok(Self {
            model,
            hazard: GompertzHazard::new(*panel.age_grid(), options.age_reference),
            priors,
            survival_logit_scale: options.survival_logit_scale,
            strata,
        })
    }

    #[must_use]
    pub const fn model(&self) -> ObservationModel {
        self.model
    }

    #[must_use]
    pub const fn hazard(&self) -> &GompertzHazard {
        &self.hazard
    }

    #[must_use]
    pub const fn priors(&self) -> &GompertzPriorConfig {
        &self.priors
    }

    #[must_use]
    pub fn n_strata(&self) -> usize {
        self.strata.len()
    }

    pub fn stratum_keys(&self) -> impl Iterator<Item = &StratumKey> + '_ {
        self.strata.iter().map(|stratum| &stratum.key)
    }

    /// Whether stratum `index` is informed only by a survival observation.
    #[must_use]
    pub fn is_survival_only(&self, index: usize) -> bool {
        self.strata
            .get(index)
            .is_some_and(|stratum| matches!(stratum.data, StratumData::Survival(_)))
    }

    #[must_use]
    pub fn has_random_walk_scales(&self) -> bool {
        self.model == ObservationModel::RandomWalk
    }

    /// Scalar parameter names in position order, on the constrained scale.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .strata
            .iter()
            .flat_map(|stratum| {
                [
                    format!("log_alpha[{}]", stratum.key),
                    format!("beta[{}]", stratum.key),
                ]
            })
            .collect();
        if self.has_random_walk_scales() {
            names.push("sigma_alpha".to_string());
            names.push("sigma_beta".to_string());
        }
        names
    }

    /// Per-stratum parameters and random-walk scales at `position`.
    #[must_use]
    pub fn constrain(&self, position: &[f64]) -> (Vec<GompertzParams>, Option<RandomWalkScales>) {
        let params = (0..self.strata.len())
            .map(|index| stratum_params(position, index))
            .collect();
        let scales = self.has_random_walk_scales().then(|| {
            let offset = 2 * self.strata.len();
            RandomWalkScales {
                sigma_alpha: position[offset].exp(),
                sigma_beta: position[offset + 1].exp(),
            }
        });
        (params, scales)
    }

    /// Starting point from crude-rate least squares.
    ///
    /// Count strata use a weighted log-linear fit; survival-only areas match
    /// their observed probability at the pooled slope; anything left falls
    /// back to the prior means.
    #[must_use]
    pub fn initial_position(&self) -> Vec<f64> {
        let count_starts: Vec<Option<GompertzParams>> = self
            .strata
            .iter()
            .map(|stratum| match &stratum.data {
                StratumData::Counts(counts) => log_linear_start(&self.hazard, counts),
                StratumData::Survival(_) => None,
            })
            .collect();
        let available: Vec<GompertzParams> = count_starts.iter().flatten().copied().collect();
        let (prior_log_alpha, prior_beta) = self.stratum_priors();
        let fallback = pooled_start(&available)
            .unwrap_or_else(|| GompertzParams::new(prior_log_alpha.mean, prior_beta.mean));

        let mut position = Vec::with_capacity(self.dim());
        for (stratum, start) in self.strata.iter().zip(count_starts) {
            let params = match (&stratum.data, start) {
                (_, Some(start)) => start,
                (StratumData::Survival(observation), None) => {
                    survival_start(&self.hazard, observation, fallback.beta).unwrap_or(fallback)
                }
                (StratumData::Counts(_), None) => fallback,
            };
            position.extend([params.log_alpha, params.beta]);
        }
        if self.has_random_walk_scales() {
            position.extend([INITIAL_LOG_SIGMA, INITIAL_LOG_SIGMA]);
        }
        position
    }

    /// Priors on `(log_alpha, beta)` for strata without a predecessor term.
    ///
    /// Random-walk strata after the first are tied to their predecessor instead.
    const fn stratum_priors(&self) -> (NormalPrior, NormalPrior) {
        match self.model {
            ObservationModel::Count => (self.priors.static_log_alpha, self.priors.static_beta),
            ObservationModel::RandomWalk | ObservationModel::MixedArea => {
                (self.priors.initial_log_alpha, self.priors.initial_beta)
            }
        }
    }

    fn accumulate(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        gradient.fill(0.0);
        let mut total = 0.0;

        for (index, stratum) in self.strata.iter().enumerate() {
            let params = stratum_params(position, index);
            let likelihood = match &stratum.data {
                StratumData::Counts(counts) => count_log_likelihood(&self.hazard, params, counts),
                StratumData::Survival(observation) => survival_term(
                    self.hazard
                        .accumulate(params, observation.age_start, observation.age_end),
                    observation,
                    self.survival_logit_scale,
                ),
            };
            total += likelihood.value;
            gradient[2 * index] += likelihood.d_log_alpha;
            gradient[2 * index + 1] += likelihood.d_beta;

            if self.model == ObservationModel::RandomWalk && index > 0 {
                continue;
            }
            let (log_alpha_prior, beta_prior) = self.stratum_priors();
            let (lp_alpha, d_alpha) = log_alpha_prior.log_density_with_gradient(params.log_alpha);
            let (lp_beta, d_beta) = beta_prior.log_density_with_gradient(params.beta);
            total += lp_alpha + lp_beta;
            gradient[2 * index] += d_alpha;
            gradient[2 * index + 1] += d_beta;
        }

        if self.has_random_walk_scales() {
            total += self.random_walk_terms(position, gradient);
        }
        total
    }

    fn random_walk_terms(&self, position: &[f64], gradient: &mut [f64]) -> f64 {
        let offset = 2 * self.strata.len();
        let (log_sigma_alpha, log_sigma_beta) = (position[offset], position[offset + 1]);

        let (lp_sigma_alpha, d_sigma_alpha) =
            log_sigma_prior_with_gradient(log_sigma_alpha, self.priors.sigma_alpha_scale);
        let (lp_sigma_beta, d_sigma_beta) =
            log_sigma_prior_with_gradient(log_sigma_beta, self.priors.sigma_beta_scale);
        let mut total = lp_sigma_alpha + lp_sigma_beta;
        gradient[offset] += d_sigma_alpha;
        gradient[offset + 1] += d_sigma_beta;

        for index in 1..self.strata.len() {
            let previous = stratum_params(position, index - 1);
            let current = stratum_params(position, index);

            let (lp, [d_current, d_previous, d_log_sigma]) = random_walk_step_with_gradient(
                current.log_alpha,
                previous.log_alpha,
                log_sigma_alpha,
            );
            total += lp;
            gradient[2 * index] += d_current;
            gradient[2 * (index - 1)] += d_previous;
            gradient[offset] += d_log_sigma;

            let (lp, [d_current, d_previous, d_log_sigma]) =
                random_walk_step_with_gradient(current.beta, previous.beta, log_sigma_beta);
            total += lp;
            gradient[2 * index + 1] += d_current;
            gradient[2 * (index - 1) + 1] += d_previous;
            gradient[offset + 1] += d_log_sigma;
        }
        total
    }
}

fn stratum_params(position: &[f64], index: usize) -> GompertzParams {
    GompertzParams::new(position[2 * index], position[2 * index + 1])
}

impl LogDensity for GompertzPosterior {
    fn dim(&self) -> usize {
        2 * self.strata.len() + if self.has_random_walk_scales() { 2 } else { 0 }
    }

    fn log_density_and_gradient(
        &self,
        position: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, InferenceError> {
        let dim = self.dim();
        for found in [position.len(), gradient.len()] {
            if found != dim {
                return Err(InferenceError::DimensionMismatch {
                    expected: dim,
                    found,
                });
            }
        }

        let value = self.accumulate(position, gradient);
        if !value.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
            return Err(InferenceError::NonFiniteDensity);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use num_traits::ToPrimitive;

    use super::*;
    use crate::input::{AgeGrid, Observation};

    fn counts(log_alpha: f64, beta: f64) -> Vec<Observation> {
        (40..=59)
            .map(|age| {
                let rate = beta.mul_add(f64::from(age - 40), log_alpha).exp();
                let deaths = (rate * 1.0e4).round();
                CountObservation::new(age, 1.0e4, deaths.to_u64().unwrap_or(0)).into()
            })
            .collect()
    }

    fn grid() -> AgeGrid {
        AgeGrid::new(40, 59).expect("grid")
    }

    fn random_walk_panel() -> Panel {
        let mut panel = Panel::new(grid());
        for (period, shift) in [(2000, 0.0), (2001, -0.05), (2002, -0.1)] {
            panel
                .add_stratum(StratumKey::period(period), counts(-6.0 + shift, 0.1))
                .expect("stratum");
        }
        panel
    }

    fn mixed_panel() -> Panel {
        Panel::new(grid())
            .with_stratum(StratumKey::area("north"), counts(-6.0, 0.1))
            .and_then(|panel| {
                panel.with_stratum(
                    StratumKey::area("south"),
                    vec![SurvivalObservation::new(40, 59, 0.06).into()],
                )
            })
            .and_then(|panel| {
                panel.with_stratum(
                    StratumKey::area("east"),
                    vec![
                        SurvivalObservation::new(40, 59, 0.05)
                            .with_sample_size(500.0)
                            .into(),
                    ],
                )
            })
            .expect("panel")
    }

    fn assert_gradient_matches(posterior: &GompertzPosterior, position: &[f64]) {
        let analytic = posterior.gradient(position).expect("finite gradient");
        let h = 1.0e-6;
        for index in 0..position.len() {
            let mut up = position.to_vec();
            let mut down = position.to_vec();
            up[index] += h;
            down[index] -= h;
            let numeric = (posterior.log_density(&up).expect("finite")
                - posterior.log_density(&down).expect("finite"))
                / (2.0 * h);
            assert_relative_eq!(analytic[index], numeric, epsilon = 1.0e-4, max_relative = 1.0e-5);
        }
    }

    #[test]
    fn static_gradient_matches_finite_differences() {
        let panel = Panel::single(grid(), counts(-6.0, 0.1)).expect("panel");
        let posterior = GompertzPosterior::new(
            &panel,
            ObservationModel::Count,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        assert_eq!(posterior.dim(), 2);
        assert_gradient_matches(&posterior, &[-5.8, 0.095]);
    }

    #[test]
    fn random_walk_gradient_matches_finite_differences() {
        let posterior = GompertzPosterior::new(
            &random_walk_panel(),
            ObservationModel::RandomWalk,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        assert_eq!(posterior.dim(), 8);
        assert_gradient_matches(
            &posterior,
            &[-6.0, 0.1, -6.1, 0.098, -6.05, 0.102, -1.5, -3.0],
        );
    }

    #[test]
    fn mixed_area_gradient_matches_finite_differences() {
        let posterior = GompertzPosterior::new(
            &mixed_panel(),
            ObservationModel::MixedArea,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        assert!(posterior.is_survival_only(1));
        assert!(!posterior.is_survival_only(0));
        assert_gradient_matches(&posterior, &[-6.0, 0.1, -5.9, 0.11, -6.2, 0.09]);
    }

    #[test]
    fn parameter_names_follow_layout() {
        let posterior = GompertzPosterior::new(
            &random_walk_panel(),
            ObservationModel::RandomWalk,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        let names = posterior.parameter_names();
        assert_eq!(names.len(), posterior.dim());
        assert_eq!(names[0], "log_alpha[2000]");
        assert_eq!(names[5], "beta[2002]");
        assert_eq!(names[6], "sigma_alpha");
        assert_eq!(names[7], "sigma_beta");
    }

    #[test]
    fn survival_strata_need_the_mixed_model() {
        let err = GompertzPosterior::new(
            &mixed_panel(),
            ObservationModel::RandomWalk,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect_err("survival data in a random walk");
        assert!(matches!(
            err,
            GompertzError::InvalidInput(InputError::UnsupportedStratumContent { .. })
        ));
    }

    #[test]
    fn irregular_areas_are_rejected() {
        let mut observations = counts(-6.0, 0.1);
        observations.push(SurvivalObservation::new(40, 59, 0.05).into());
        let panel = Panel::single(grid(), observations).expect("panel");
        let err = GompertzPosterior::new(
            &panel,
            ObservationModel::MixedArea,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect_err("mixed contents");
        assert!(matches!(
            err,
            GompertzError::InvalidInput(InputError::UnsupportedStratumContent { .. })
        ));
    }

    #[test]
    fn invalid_priors_are_rejected() {
        let panel = Panel::single(grid(), counts(-6.0, 0.1)).expect("panel");
        let priors = GompertzPriorConfig {
            static_beta: NormalPrior::new(0.0, -1.0),
            ..GompertzPriorConfig::default()
        };
        assert_eq!(
            GompertzPosterior::new(
                &panel,
                ObservationModel::Count,
                priors,
                &GompertzFitOptions::default()
            ),
            Err(GompertzError::InvalidPriorConfig)
        );
    }

    #[test]
    fn wrong_dimension_is_reported() {
        let panel = Panel::single(grid(), counts(-6.0, 0.1)).expect("panel");
        let posterior = GompertzPosterior::new(
            &panel,
            ObservationModel::Count,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        assert_eq!(
            posterior.log_density(&[0.0]),
            Err(InferenceError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn non_finite_density_is_an_error() {
        let panel = Panel::single(grid(), counts(-6.0, 0.1)).expect("panel");
        let posterior = GompertzPosterior::new(
            &panel,
            ObservationModel::Count,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        assert_eq!(
            posterior.log_density(&[f64::NAN, 0.1]),
            Err(InferenceError::NonFiniteDensity)
        );
    }

    #[test]
    fn initial_position_is_near_truth() {
        let posterior = GompertzPosterior::new(
            &mixed_panel(),
            ObservationModel::MixedArea,
            GompertzPriorConfig::default(),
            &GompertzFitOptions::default(),
        )
        .expect("posterior");
        let start = posterior.initial_position();
        assert_eq!(start.len(), posterior.dim());
        assert!((start[0] + 6.0).abs() < 0.2);
        assert!((start[1] - 0.1).abs() < 0.02);
        let q = posterior
            .hazard()
            .survival_prob(GompertzParams::new(start[2], start[3]), 40, 59)
            .expect("valid range");
        assert_relative_eq!(q, 0.06, epsilon = 1.0e-9);
        assert!(posterior.log_density(&start).is_ok());
    }
}
