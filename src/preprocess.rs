//! Crude mortality rates, data diagnostics, and sampler starting values.

use faer::Mat;

use crate::input::{CountObservation, Observation, Panel, SurvivalObservation};
use crate::models::gompertz::hazard::{GompertzHazard, GompertzParams};
use crate::utils::{solve_linear_system, u64_to_f64, usize_to_f64};

/// Added to deaths before taking logs so empty cells stay finite.
const CONTINUITY_CORRECTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelDiagnostics {
    pub n_strata: usize,
    pub n_count_observations: usize,
    pub n_survival_observations: usize,
    pub n_zero_exposure: usize,
    pub n_zero_deaths: usize,
    pub total_deaths: u64,
    pub total_exposure: f64,
    /// Pooled crude death rate; `None` without exposure.
    pub crude_rate: Option<f64>,
}

#[must_use]
pub fn panel_diagnostics(panel: &Panel) -> PanelDiagnostics {
    let mut diagnostics = PanelDiagnostics {
        n_strata: panel.len(),
        n_count_observations: 0,
        n_survival_observations: 0,
        n_zero_exposure: 0,
        n_zero_deaths: 0,
        total_deaths: 0,
        total_exposure: 0.0,
        crude_rate: None,
    };

    for observation in panel.strata().iter().flat_map(|s| &s.observations) {
        match observation {
            Observation::Count(count) => {
                diagnostics.n_count_observations += 1;
                if count.exposure == 0.0 {
                    diagnostics.n_zero_exposure += 1;
                }
                if count.count == 0 {
                    diagnostics.n_zero_deaths += 1;
                }
                diagnostics.total_deaths += count.count;
                diagnostics.total_exposure += count.exposure;
            }
            Observation::Survival(_) => diagnostics.n_survival_observations += 1,
        }
    }

    if diagnostics.total_exposure > 0.0 {
        diagnostics.crude_rate =
            Some(u64_to_f64(diagnostics.total_deaths) / diagnostics.total_exposure);
    }
    diagnostics
}

/// Observed death rate `count / exposure` per age; `None` where exposure is zero.
#[must_use]
pub fn crude_rates(counts: &[CountObservation]) -> Vec<(i32, Option<f64>)> {
    counts
        .iter()
        .map(|observation| {
            let rate = (observation.exposure > 0.0)
                .then(|| u64_to_f64(observation.count) / observation.exposure);
            (observation.age, rate)
        })
        .collect()
}

/// Weighted least-squares fit of `ln((d + 0.5) / E)` on centered age.
///
/// Weights are `d + 0.5`, the approximate inverse variance of the log rate.
/// Returns `None` with fewer than two exposed ages or a singular system.
#[must_use]
pub fn log_linear_start(
    hazard: &GompertzHazard,
    counts: &[CountObservation],
) -> Option<GompertzParams> {
    let exposed: Vec<&CountObservation> = counts.iter().filter(|c| c.exposure > 0.0).collect();
    if exposed.len() < 2 {
        return None;
    }

    let mut normal = Mat::<f64>::zeros(2, 2);
    let mut rhs = Mat::<f64>::zeros(2, 1);
    for observation in exposed {
        let deaths = u64_to_f64(observation.count) + CONTINUITY_CORRECTION;
        let weight = deaths;
        let response = (deaths / observation.exposure).ln();
        let x = hazard.centered(observation.age);
        normal[(0, 0)] += weight;
        normal[(0, 1)] += weight * x;
        normal[(1, 1)] += weight * x * x;
        rhs[(0, 0)] += weight * response;
        rhs[(1, 0)] += weight * x * response;
    }
    normal[(1, 0)] = normal[(0, 1)];

    let solution = solve_linear_system(&normal, &rhs)?;
    Some(GompertzParams::new(solution[(0, 0)], solution[(1, 0)]))
}

/// Level matching an aggregate death probability for a fixed slope `beta`.
///
/// Solves `sum_x exp(la + beta * (x - ref)) = -ln(1 - p)` for `la`.
#[must_use]
pub fn survival_start(
    hazard: &GompertzHazard,
    observation: &SurvivalObservation,
    beta: f64,
) -> Option<GompertzParams> {
    let probability = observation.observed_probability.clamp(1.0e-9, 1.0 - 1.0e-9);
    let cumulative = -(-probability).ln_1p();
    let shape: f64 = (observation.age_start..=observation.age_end)
        .map(|age| (beta * hazard.centered(age)).exp())
        .sum();
    let log_alpha = (cumulative / shape).ln();
    log_alpha
        .is_finite()
        .then_some(GompertzParams::new(log_alpha, beta))
}

/// Mean of the per-stratum starting values, used when a stratum has none.
#[must_use]
pub fn pooled_start(starts: &[GompertzParams]) -> Option<GompertzParams> {
    if starts.is_empty() {
        return None;
    }
    let n = usize_to_f64(starts.len());
    Some(GompertzParams::new(
        starts.iter().map(|p| p.log_alpha).sum::<f64>() / n,
        starts.iter().map(|p| p.beta).sum::<f64>() / n,
    ))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use num_traits::ToPrimitive;

    use super::*;
    use crate::input::{AgeGrid, StratumKey};

    fn hazard() -> GompertzHazard {
        GompertzHazard::new(AgeGrid::new(40, 59).expect("grid"), 40.0)
    }

    #[test]
    fn diagnostics_count_cells() {
        let grid = AgeGrid::new(40, 42).expect("grid");
        let panel = Panel::new(grid)
            .with_stratum(
                StratumKey::area("a"),
                vec![
                    CountObservation::new(40, 100.0, 0).into(),
                    CountObservation::new(41, 0.0, 0).into(),
                    CountObservation::new(42, 100.0, 4).into(),
                ],
            )
            .and_then(|panel| {
                panel.with_stratum(
                    StratumKey::area("b"),
                    vec![SurvivalObservation::new(40, 42, 0.1).into()],
                )
            })
            .expect("panel");
        let diagnostics = panel_diagnostics(&panel);
        assert_eq!(diagnostics.n_strata, 2);
        assert_eq!(diagnostics.n_count_observations, 3);
        assert_eq!(diagnostics.n_survival_observations, 1);
        assert_eq!(diagnostics.n_zero_exposure, 1);
        assert_eq!(diagnostics.n_zero_deaths, 2);
        assert_eq!(diagnostics.total_deaths, 4);
        assert_relative_eq!(diagnostics.crude_rate.expect("exposed"), 0.02);
    }

    #[test]
    fn crude_rates_skip_unexposed_ages() {
        let rates = crude_rates(&[
            CountObservation::new(40, 200.0, 2),
            CountObservation::new(41, 0.0, 1),
        ]);
        assert_eq!(rates, vec![(40, Some(0.01)), (41, None)]);
    }

    #[test]
    fn log_linear_start_recovers_exact_rates() {
        let model = hazard();
        // Large exposure makes the continuity correction negligible.
        let counts: Vec<CountObservation> = (40..=59)
            .map(|age| {
                let rate = (-6.0 + 0.1 * f64::from(age - 40)).exp();
                let exposure = 1.0e9;
                let deaths = (rate * exposure).round();
                CountObservation::new(age, exposure, deaths.to_u64().expect("non-negative"))
            })
            .collect();
        let start = log_linear_start(&model, &counts).expect("regular system");
        assert_relative_eq!(start.log_alpha, -6.0, epsilon = 1.0e-3);
        assert_relative_eq!(start.beta, 0.1, epsilon = 1.0e-4);
    }

    #[test]
    fn log_linear_start_needs_two_exposed_ages() {
        let counts = [CountObservation::new(40, 10.0, 1), CountObservation::new(41, 0.0, 0)];
        assert!(log_linear_start(&hazard(), &counts).is_none());
    }

    #[test]
    fn survival_start_reproduces_observed_probability() {
        let model = hazard();
        let observation = SurvivalObservation::new(40, 59, 0.05);
        let start = survival_start(&model, &observation, 0.1).expect("finite start");
        let q = model.survival_prob(start, 40, 59).expect("valid range");
        assert_relative_eq!(q, 0.05, epsilon = 1.0e-12);
    }

    #[test]
    fn pooled_start_averages() {
        let starts = [GompertzParams::new(-6.0, 0.1), GompertzParams::new(-5.0, 0.2)];
        let pooled = pooled_start(&starts).expect("non-empty");
        assert_relative_eq!(pooled.log_alpha, -5.5);
        assert_relative_eq!(pooled.beta, 0.15, epsilon = 1.0e-12);
        assert!(pooled_start(&[]).is_none());
    }
}
