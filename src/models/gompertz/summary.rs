//! Posterior point and interval estimates, including per-draw derived quantities.

use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::{Deserialize, Serialize};

use crate::input::StratumKey;
use crate::utils::{mean, percentile, sample_variance};

use super::draws::Draw;
use super::hazard::GompertzHazard;
use super::types::GompertzError;

/// Summary of one scalar quantity over the pooled draws.
///
/// Quantiles interpolate linearly between order statistics (type 7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
    /// Draws behind the summary; derived quantities may drop undefined draws.
    pub n_draws: usize,
}

impl ParameterSummary {
    /// Summarize `values` with an equal-tailed interval of mass `credible_level`.
    #[must_use]
    pub fn from_values(name: impl Into<String>, values: &[f64], credible_level: f64) -> Self {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let tail = 0.5 * (1.0 - credible_level);
        let center = mean(values);
        Self {
            name: name.into(),
            mean: center,
            sd: sample_variance(values, center).sqrt(),
            median: percentile(&sorted, 0.5),
            lower: percentile(&sorted, tail),
            upper: percentile(&sorted, 1.0 - tail),
            n_draws: values.len(),
        }
    }

    #[must_use]
    pub fn interval_width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// One row of the reporting table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub parameter: String,
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub credible_level: f64,
    /// Model parameters in draw order.
    pub parameters: Vec<ParameterSummary>,
    /// `modal_age[key]` per stratum.
    pub derived: Vec<ParameterSummary>,
}

impl PosteriorSummary {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParameterSummary> {
        self.iter().find(|summary| summary.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterSummary> + '_ {
        self.parameters.iter().chain(&self.derived)
    }

    /// Rows `{ parameter, median, lower, upper }` for parameters, then derived quantities.
    #[must_use]
    pub fn table(&self) -> Vec<SummaryRow> {
        self.iter()
            .map(|summary| SummaryRow {
                parameter: summary.name.clone(),
                median: summary.median,
                lower: summary.lower,
                upper: summary.upper,
            })
            .collect()
    }

    /// Render the summary as a text table with a `{level}% CrI` column.
    #[must_use]
    pub fn render_table(&self) -> String {
        let interval = format!("{:.0}% CrI", 100.0 * self.credible_level);
        let mut table = make_table(&["parameter", "mean", "sd", "median", interval.as_str()]);
        for summary in self.iter() {
            table.add_row(vec![
                Cell::new(&summary.name),
                Cell::new(format!("{:.4}", summary.mean)),
                Cell::new(format!("{:.4}", summary.sd)),
                Cell::new(format!("{:.4}", summary.median)),
                Cell::new(format!("[{:.4}, {:.4}]", summary.lower, summary.upper)),
            ]);
        }
        table.to_string()
    }
}

pub(crate) fn make_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| Cell::new(*h)).collect::<Vec<_>>());
    table
}

/// Summaries of every parameter and of the modal age at death per stratum.
///
/// # Errors
///
/// Returns `GompertzError` if there are no draws or a draw's length
/// disagrees with `parameter_names`.
pub fn summarize_posterior(
    draws: &[&Draw],
    parameter_names: &[String],
    hazard: &GompertzHazard,
    strata: &[StratumKey],
    credible_level: f64,
) -> Result<PosteriorSummary, GompertzError> {
    if draws.is_empty() {
        return Err(GompertzError::EmptyPosterior);
    }
    let values: Vec<Vec<f64>> = draws.iter().map(|draw| draw.values()).collect();
    if values.iter().any(|row| row.len() != parameter_names.len())
        || draws.iter().any(|draw| draw.params.len() != strata.len())
    {
        return Err(GompertzError::InconsistentPosteriorDimensions);
    }

    let parameters = parameter_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let column: Vec<f64> = values.iter().map(|row| row[index]).collect();
            ParameterSummary::from_values(name.as_str(), &column, credible_level)
        })
        .collect();

    // Modal age is undefined for draws with beta <= 0; those are left out.
    let derived = strata
        .iter()
        .enumerate()
        .filter_map(|(index, key)| {
            let ages: Vec<f64> = draws
                .iter()
                .filter_map(|draw| hazard.modal_age_at_death(draw.params[index]))
                .collect();
            (!ages.is_empty()).then(|| {
                ParameterSummary::from_values(format!("modal_age[{key}]"), &ages, credible_level)
            })
        })
        .collect();

    Ok(PosteriorSummary {
        credible_level,
        parameters,
        derived,
    })
}

/// Per-stratum summary of `nqx`, the probability of death between
/// `age_start` and `age_end` inclusive, computed per draw.
///
/// Names follow the demographic convention, e.g. `20q40[key]` for ages 40..=59.
///
/// # Errors
///
/// Returns `GompertzError` if there are no draws or the age range is not on
/// the hazard's grid.
pub fn nqx_summary(
    draws: &[&Draw],
    hazard: &GompertzHazard,
    strata: &[StratumKey],
    age_start: i32,
    age_end: i32,
    credible_level: f64,
) -> Result<Vec<ParameterSummary>, GompertzError> {
    if draws.is_empty() {
        return Err(GompertzError::EmptyPosterior);
    }
    hazard.age_grid().check_range(age_start, age_end)?;
    let width = age_end - age_start + 1;

    strata
        .iter()
        .enumerate()
        .map(|(index, key)| {
            let probabilities = draws
                .iter()
                .map(|draw| {
                    let params = draw
                        .params
                        .get(index)
                        .ok_or(GompertzError::InconsistentPosteriorDimensions)?;
                    Ok(hazard.survival_prob(*params, age_start, age_end)?)
                })
                .collect::<Result<Vec<f64>, GompertzError>>()?;
            Ok(ParameterSummary::from_values(
                format!("{width}q{age_start}[{key}]"),
                &probabilities,
                credible_level,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::input::{AgeGrid, InputError};
    use crate::models::gompertz::hazard::GompertzParams;

    fn hazard() -> GompertzHazard {
        GompertzHazard::new(AgeGrid::new(40, 59).expect("grid"), 40.0)
    }

    fn draws() -> Vec<Draw> {
        (0..=100_i32)
            .map(|iteration| {
                let shift = f64::from(iteration) / 100.0 - 0.5;
                Draw {
                    chain_id: 0,
                    iteration: usize::try_from(iteration).unwrap_or_default(),
                    params: vec![GompertzParams::new(-6.0 + shift, 0.1 + 0.01 * shift)],
                    scales: None,
                }
            })
            .collect()
    }

    fn names() -> Vec<String> {
        vec!["log_alpha[all]".to_string(), "beta[all]".to_string()]
    }

    #[test]
    fn from_values_uses_type_seven_quantiles() {
        let values: Vec<f64> = (1..=5_i32).map(f64::from).collect();
        let summary = ParameterSummary::from_values("x", &values, 0.5);
        assert_relative_eq!(summary.median, 3.0);
        assert_relative_eq!(summary.lower, 2.0);
        assert_relative_eq!(summary.upper, 4.0);
        assert_relative_eq!(summary.mean, 3.0);
        assert_relative_eq!(summary.sd, 2.5_f64.sqrt());
    }

    #[test]
    fn summary_covers_parameters_and_modal_age() {
        let owned = draws();
        let refs: Vec<&Draw> = owned.iter().collect();
        let summary =
            summarize_posterior(&refs, &names(), &hazard(), &[StratumKey::default()], 0.95)
                .expect("draws");
        let log_alpha = summary.get("log_alpha[all]").expect("parameter");
        assert_relative_eq!(log_alpha.median, -6.0, epsilon = 1.0e-12);
        assert_relative_eq!(log_alpha.lower, -6.475, epsilon = 1.0e-12);
        assert_relative_eq!(log_alpha.upper, -5.525, epsilon = 1.0e-12);

        let modal = summary.get("modal_age[all]").expect("derived");
        let at_median = hazard()
            .modal_age_at_death(GompertzParams::new(-6.0, 0.1))
            .expect("positive beta");
        assert_relative_eq!(modal.median, at_median, epsilon = 1.0e-9);

        let table = summary.table();
        assert_eq!(table.len(), 3);
        assert_eq!(table[2].parameter, "modal_age[all]");

        let rendered = summary.render_table();
        assert!(rendered.contains("95% CrI"));
        assert!(rendered.contains("modal_age[all]"));
        assert!(rendered.contains("-6.0000"));
    }

    #[test]
    fn derived_quantities_are_summarized_per_draw() {
        // Mean of a nonlinear transform differs from the transform of the mean.
        let owned = draws();
        let refs: Vec<&Draw> = owned.iter().collect();
        let summary =
            summarize_posterior(&refs, &names(), &hazard(), &[StratumKey::default()], 0.95)
                .expect("draws");
        let modal = summary.get("modal_age[all]").expect("derived");
        let plug_in = hazard()
            .modal_age_at_death(GompertzParams::new(-6.0, 0.1))
            .expect("positive beta");
        assert!((modal.mean - plug_in).abs() > 1.0e-6);
    }

    #[test]
    fn empty_draws_are_rejected() {
        assert_eq!(
            summarize_posterior(&[], &names(), &hazard(), &[StratumKey::default()], 0.95),
            Err(GompertzError::EmptyPosterior)
        );
    }

    #[test]
    fn nqx_matches_survival_probability_at_median() {
        let owned = draws();
        let refs: Vec<&Draw> = owned.iter().collect();
        let rows = nqx_summary(&refs, &hazard(), &[StratumKey::default()], 40, 59, 0.9)
            .expect("valid range");
        assert_eq!(rows[0].name, "20q40[all]");
        let expected = hazard()
            .survival_prob(GompertzParams::new(-6.0, 0.1), 40, 59)
            .expect("valid range");
        assert_relative_eq!(rows[0].median, expected, epsilon = 1.0e-12);
        assert!(rows[0].lower < rows[0].median && rows[0].median < rows[0].upper);
    }

    #[test]
    fn nqx_rejects_ranges_off_the_grid() {
        let owned = draws();
        let refs: Vec<&Draw> = owned.iter().collect();
        assert!(matches!(
            nqx_summary(&refs, &hazard(), &[StratumKey::default()], 30, 59, 0.95),
            Err(GompertzError::InvalidInput(InputError::AgeOutsideGrid { .. }))
        ));
    }
}
