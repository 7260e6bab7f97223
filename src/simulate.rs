//! Synthetic mortality data drawn from known Gompertz parameters.
//!
//! Used by parameter-recovery tests and the demos. Every simulation is driven
//! by a seeded `StdRng`, so equal seeds give equal panels.

use num_traits::ToPrimitive;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use statrs::function::gamma::ln_gamma;

use crate::input::{
    AgeGrid, CountObservation, InputError, Observation, Panel, StratumKey, SurvivalObservation,
};
use crate::models::gompertz::hazard::{GompertzHazard, GompertzParams};
use crate::utils::sample_standard_normal;

/// Below this mean Poisson draws use sequential multiplication.
const POISSON_INVERSION_LIMIT: f64 = 10.0;

/// Poisson draw with mean `lambda`.
///
/// Small means use Knuth's multiplication method, larger ones the PTRS
/// transformed-rejection sampler. Non-positive or non-finite means give 0.
pub fn sample_poisson(rng: &mut StdRng, lambda: f64) -> u64 {
    if !(lambda.is_finite() && lambda > 0.0) {
        return 0;
    }
    if lambda < POISSON_INVERSION_LIMIT {
        let limit = (-lambda).exp();
        let mut product = rng.random::<f64>();
        let mut count = 0;
        while product > limit {
            product *= rng.random::<f64>();
            count += 1;
        }
        return count;
    }

    let sqrt_lambda = lambda.sqrt();
    let log_lambda = lambda.ln();
    let b = 2.53f64.mul_add(sqrt_lambda, 0.931);
    let a = 0.02483f64.mul_add(b, -0.059);
    let inv_alpha = 1.1239 + 1.1328 / (b - 3.4);
    let v_r = 0.9277 - 3.6224 / (b - 2.0);

    loop {
        let u = rng.random::<f64>() - 0.5;
        let v = rng.random::<f64>();
        let us = 0.5 - u.abs();
        let k = ((2.0 * a / us + b).mul_add(u, lambda) + 0.43).floor();
        if us >= 0.07 && v <= v_r {
            return k.to_u64().unwrap_or(0);
        }
        if k < 0.0 || (us < 0.013 && v > us) {
            continue;
        }
        let lhs = v.ln() + inv_alpha.ln() - (a / (us * us) + b).ln();
        let rhs = k.mul_add(log_lambda, -lambda) - ln_gamma(k + 1.0);
        if lhs <= rhs {
            return k.to_u64().unwrap_or(0);
        }
    }
}

/// Poisson death counts at every grid age with a common exposure.
pub fn simulate_counts(
    hazard: &GompertzHazard,
    params: GompertzParams,
    exposure: f64,
    rng: &mut StdRng,
) -> Vec<CountObservation> {
    hazard
        .age_grid()
        .ages()
        .map(|age| {
            let rate = hazard.log_hazard(params, age).hazard();
            CountObservation::new(age, exposure, sample_poisson(rng, exposure * rate))
        })
        .collect()
}

/// Exact probability of death over `age_start..=age_end` as a survival observation.
///
/// # Errors
///
/// Returns `InputError` if the range is not on the hazard's grid.
pub fn survival_observation(
    hazard: &GompertzHazard,
    params: GompertzParams,
    age_start: i32,
    age_end: i32,
) -> Result<SurvivalObservation, InputError> {
    let probability = hazard.survival_prob(params, age_start, age_end)?;
    Ok(SurvivalObservation::new(age_start, age_end, probability))
}

/// Gompertz parameters following a Gaussian random walk from `initial`.
///
/// Returns `periods` parameter pairs; the first equals `initial`.
pub fn random_walk_params(
    initial: GompertzParams,
    sigma_alpha: f64,
    sigma_beta: f64,
    periods: usize,
    rng: &mut StdRng,
) -> Vec<GompertzParams> {
    let mut current = initial;
    (0..periods)
        .map(|period| {
            if period > 0 {
                current = GompertzParams::new(
                    sigma_alpha.mul_add(sample_standard_normal(rng), current.log_alpha),
                    sigma_beta.mul_add(sample_standard_normal(rng), current.beta),
                );
            }
            current
        })
        .collect()
}

/// How each simulated stratum is observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimulatedObservation {
    /// Poisson counts at every grid age with this exposure.
    Counts { exposure: f64 },
    /// One exact probability of death over an age range.
    Survival { age_start: i32, age_end: i32 },
}

/// One stratum of a simulated panel.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedStratum {
    pub key: StratumKey,
    pub params: GompertzParams,
    pub observation: SimulatedObservation,
}

/// Build a panel from known per-stratum parameters.
///
/// # Errors
///
/// Returns `InputError` if keys repeat or a survival range leaves the grid.
pub fn simulate_panel(
    age_grid: AgeGrid,
    age_reference: f64,
    strata: &[SimulatedStratum],
    seed: u64,
) -> Result<Panel, InputError> {
    let hazard = GompertzHazard::new(age_grid, age_reference);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut panel = Panel::new(age_grid);
    for stratum in strata {
        let observations: Vec<Observation> = match stratum.observation {
            SimulatedObservation::Counts { exposure } => {
                simulate_counts(&hazard, stratum.params, exposure, &mut rng)
                    .into_iter()
                    .map(Observation::from)
                    .collect()
            }
            SimulatedObservation::Survival { age_start, age_end } => {
                vec![survival_observation(&hazard, stratum.params, age_start, age_end)?.into()]
            }
        };
        panel.add_stratum(stratum.key.clone(), observations)?;
    }
    Ok(panel)
}
