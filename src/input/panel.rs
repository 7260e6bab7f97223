//! Stratified mortality panels.
//!
//! A panel pairs one [`AgeGrid`] with an ordered list of strata. Strata are
//! keyed by period, area, or both; insertion order is the time order used by
//! the random-walk model.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{AgeGrid, CountObservation, InputError, Observation, SurvivalObservation};

/// Identifier of one stratum (time period and/or geographic area).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StratumKey {
    pub period: Option<i32>,
    pub area: Option<String>,
}

impl StratumKey {
    #[must_use]
    pub const fn period(period: i32) -> Self {
        Self {
            period: Some(period),
            area: None,
        }
    }

    #[must_use]
    pub fn area(area: impl Into<String>) -> Self {
        Self {
            period: None,
            area: Some(area.into()),
        }
    }

    #[must_use]
    pub fn area_period(area: impl Into<String>, period: i32) -> Self {
        Self {
            period: Some(period),
            area: Some(area.into()),
        }
    }
}

impl fmt::Display for StratumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.area, self.period) {
            (Some(area), Some(period)) => write!(f, "{area}@{period}"),
            (Some(area), None) => write!(f, "{area}"),
            (None, Some(period)) => write!(f, "{period}"),
            (None, None) => write!(f, "all"),
        }
    }
}

/// What a stratum carries, as seen by the observation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumKind {
    /// Only age-specific death counts.
    Counts,
    /// Exactly one aggregate survival observation.
    SurvivalOnly,
    /// Anything else (mixed kinds or several survival observations).
    Irregular,
}

/// Observations sharing one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stratum {
    pub key: StratumKey,
    pub observations: Vec<Observation>,
}

impl Stratum {
    #[must_use]
    pub fn kind(&self) -> StratumKind {
        let counts = self.counts().count();
        let survival = self.observations.len() - counts;
        match (counts, survival) {
            (c, 0) if c > 0 => StratumKind::Counts,
            (0, 1) => StratumKind::SurvivalOnly,
            _ => StratumKind::Irregular,
        }
    }

    /// Count observations in insertion order.
    pub fn counts(&self) -> impl Iterator<Item = &CountObservation> + '_ {
        self.observations.iter().filter_map(|observation| match observation {
            Observation::Count(count) => Some(count),
            Observation::Survival(_) => None,
        })
    }

    /// The single survival observation of a survival-only stratum.
    #[must_use]
    pub fn survival(&self) -> Option<&SurvivalObservation> {
        if self.kind() != StratumKind::SurvivalOnly {
            return None;
        }
        self.observations.iter().find_map(|observation| match observation {
            Observation::Survival(survival) => Some(survival),
            Observation::Count(_) => None,
        })
    }

    /// Total deaths and exposure across count observations.
    #[must_use]
    pub fn totals(&self) -> (u64, f64) {
        self.counts().fold((0, 0.0), |(deaths, exposure), observation| {
            (deaths + observation.count, exposure + observation.exposure)
        })
    }
}

/// Age-indexed observations for one or more strata on a shared grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    age_grid: AgeGrid,
    strata: Vec<Stratum>,
}

impl Panel {
    #[must_use]
    pub const fn new(age_grid: AgeGrid) -> Self {
        Self {
            age_grid,
            strata: Vec::new(),
        }
    }

    /// Panel with one stratum, the usual shape of a single cross-section.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if any observation is malformed.
    pub fn single(
        age_grid: AgeGrid,
        observations: Vec<Observation>,
    ) -> Result<Self, InputError> {
        let mut panel = Self::new(age_grid);
        panel.add_stratum(StratumKey::default(), observations)?;
        Ok(panel)
    }

    /// Append a stratum after validating each observation against the grid.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if the key repeats, the stratum is empty, an age
    /// leaves the grid, or a count age appears twice.
    pub fn add_stratum(
        &mut self,
        key: StratumKey,
        observations: Vec<Observation>,
    ) -> Result<(), InputError> {
        if self.strata.iter().any(|stratum| stratum.key == key) {
            return Err(InputError::DuplicateStratum(key.to_string()));
        }
        check_stratum(&self.age_grid, &key, &observations)?;
        self.strata.push(Stratum { key, observations });
        Ok(())
    }

    /// Builder form of [`Panel::add_stratum`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`Panel::add_stratum`].
    pub fn with_stratum(
        mut self,
        key: StratumKey,
        observations: Vec<Observation>,
    ) -> Result<Self, InputError> {
        self.add_stratum(key, observations)?;
        Ok(self)
    }

    #[must_use]
    pub const fn age_grid(&self) -> &AgeGrid {
        &self.age_grid
    }

    #[must_use]
    pub fn strata(&self) -> &[Stratum] {
        &self.strata
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strata.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strata.is_empty()
    }

    /// Re-run every check of [`Panel::add_stratum`] over the whole panel.
    ///
    /// Panels built through `add_stratum` always pass; deserialized panels
    /// are checked here before fitting.
    ///
    /// # Errors
    ///
    /// Returns `InputError::EmptyPanel` if no stratum was added, and the
    /// first grid, key, or observation error otherwise.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.strata.is_empty() {
            return Err(InputError::EmptyPanel);
        }
        AgeGrid::new(self.age_grid.start(), self.age_grid.end())?;
        let mut keys = HashSet::new();
        for stratum in &self.strata {
            if !keys.insert(&stratum.key) {
                return Err(InputError::DuplicateStratum(stratum.key.to_string()));
            }
            check_stratum(&self.age_grid, &stratum.key, &stratum.observations)?;
        }
        Ok(())
    }
}

fn check_stratum(
    age_grid: &AgeGrid,
    key: &StratumKey,
    observations: &[Observation],
) -> Result<(), InputError> {
    if observations.is_empty() {
        return Err(InputError::EmptyStratum(key.to_string()));
    }
    let mut seen_ages = HashSet::new();
    for observation in observations {
        observation.validate(age_grid)?;
        if let Observation::Count(count) = observation
            && !seen_ages.insert(count.age)
        {
            return Err(InputError::DuplicateAge {
                stratum: key.to_string(),
                age: count.age,
            });
        }
    }
    Ok(())
}
