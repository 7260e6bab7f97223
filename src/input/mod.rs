//! # Mortality inputs
//!
//! Age grids, single observations, and the stratified [`Panel`] handed to the
//! Gompertz models. Everything here is validated once at construction and is
//! read-only afterwards.
//!
//! # Examples
//!
//! ```
//! use gompertz_mortality::{AgeGrid, CountObservation, Panel, StratumKey};
//!
//! let grid = AgeGrid::new(40, 42).expect("valid grid");
//! let mut panel = Panel::new(grid);
//! panel
//!     .add_stratum(
//!         StratumKey::period(2020),
//!         vec![
//!             CountObservation::new(40, 1_000.0, 3).into(),
//!             CountObservation::new(41, 1_000.0, 4).into(),
//!             CountObservation::new(42, 1_000.0, 4).into(),
//!         ],
//!     )
//!     .expect("ages lie inside the grid");
//!
//! assert_eq!(panel.len(), 1);
//! ```
//!
//! ```
//! use gompertz_mortality::AgeGrid;
//!
//! assert!(AgeGrid::from_ages(&[40, 41, 43]).is_err());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod panel;

pub use panel::{Panel, Stratum, StratumKey, StratumKind};

/// Domain errors raised while building or querying mortality inputs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InputError {
    #[error("age grid must contain at least one age")]
    EmptyAgeGrid,
    #[error("age grid end ({end}) precedes start ({start})")]
    InvertedAgeGrid { start: i32, end: i32 },
    #[error("age grid must increase in unit steps; found {previous} followed by {next}")]
    NonContiguousAgeGrid { previous: i32, next: i32 },
    #[error("age {age} lies outside the age grid [{start}, {end}]")]
    AgeOutsideGrid { age: i32, start: i32, end: i32 },
    #[error("exposure at age {age} must be finite and non-negative; found {exposure}")]
    InvalidExposure { age: i32, exposure: f64 },
    #[error("observed probability must lie in [0, 1]; found {0}")]
    InvalidProbability(f64),
    #[error("age range start ({age_start}) exceeds end ({age_end})")]
    InvertedAgeRange { age_start: i32, age_end: i32 },
    #[error("survival pseudo sample size must be finite and positive; found {0}")]
    InvalidSampleSize(f64),
    #[error("stratum `{0}` appears more than once")]
    DuplicateStratum(String),
    #[error("age {age} appears more than once in stratum `{stratum}`")]
    DuplicateAge { stratum: String, age: i32 },
    #[error("panel must contain at least one stratum")]
    EmptyPanel,
    #[error("stratum `{0}` has no observations")]
    EmptyStratum(String),
    #[error("stratum `{stratum}` must contain {expected}")]
    UnsupportedStratumContent {
        stratum: String,
        expected: &'static str,
    },
}

/// Contiguous, strictly increasing integer ages with unit spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeGrid {
    start: i32,
    end: i32,
}

impl AgeGrid {
    /// Grid covering `start..=end`.
    ///
    /// # Errors
    ///
    /// Returns `InputError::InvertedAgeGrid` if `end < start`.
    pub const fn new(start: i32, end: i32) -> Result<Self, InputError> {
        if end < start {
            return Err(InputError::InvertedAgeGrid { start, end });
        }
        Ok(Self { start, end })
    }

    /// Grid from an explicit age list, which must step by exactly one year.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if `ages` is empty or not contiguous.
    pub fn from_ages(ages: &[i32]) -> Result<Self, InputError> {
        let (&first, rest) = ages.split_first().ok_or(InputError::EmptyAgeGrid)?;
        let mut previous = first;
        for &next in rest {
            if next != previous + 1 {
                return Err(InputError::NonContiguousAgeGrid { previous, next });
            }
            previous = next;
        }
        Self::new(first, previous)
    }

    #[must_use]
    pub const fn start(&self) -> i32 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> i32 {
        self.end
    }

    /// Number of ages in the grid.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.abs_diff(self.start) as usize + 1
    }

    /// Always `false`: construction rejects empty grids.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub const fn contains(&self, age: i32) -> bool {
        age >= self.start && age <= self.end
    }

    /// Ages in increasing order.
    pub fn ages(&self) -> impl Iterator<Item = i32> + '_ {
        self.start..=self.end
    }

    /// Position of `age` within the grid.
    ///
    /// # Errors
    ///
    /// Returns `InputError::AgeOutsideGrid` if `age` is not covered.
    pub const fn index_of(&self, age: i32) -> Result<usize, InputError> {
        if !self.contains(age) {
            return Err(InputError::AgeOutsideGrid {
                age,
                start: self.start,
                end: self.end,
            });
        }
        Ok(age.abs_diff(self.start) as usize)
    }

    /// Validate an inclusive age range against the grid.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if the range is inverted or leaves the grid.
    pub fn check_range(&self, age_start: i32, age_end: i32) -> Result<(), InputError> {
        if age_start > age_end {
            return Err(InputError::InvertedAgeRange { age_start, age_end });
        }
        self.index_of(age_start)?;
        self.index_of(age_end)?;
        Ok(())
    }
}

/// Deaths and population at risk for one single-year age.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CountObservation {
    pub age: i32,
    /// Population at risk (person-years).
    pub exposure: f64,
    /// Observed deaths.
    pub count: u64,
}

impl CountObservation {
    #[must_use]
    pub const fn new(age: i32, exposure: f64, count: u64) -> Self {
        Self {
            age,
            exposure,
            count,
        }
    }

    /// # Errors
    ///
    /// Returns `InputError` if the age leaves the grid or exposure is invalid.
    pub fn validate(&self, grid: &AgeGrid) -> Result<(), InputError> {
        grid.index_of(self.age)?;
        if !(self.exposure.is_finite() && self.exposure >= 0.0) {
            return Err(InputError::InvalidExposure {
                age: self.age,
                exposure: self.exposure,
            });
        }
        Ok(())
    }
}

/// Aggregate probability of dying between `age_start` and `age_end` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurvivalObservation {
    pub age_start: i32,
    pub age_end: i32,
    pub observed_probability: f64,
    /// Number of pseudo-trials behind the estimate, when the source states one.
    pub sample_size: Option<f64>,
}

impl SurvivalObservation {
    #[must_use]
    pub const fn new(age_start: i32, age_end: i32, observed_probability: f64) -> Self {
        Self {
            age_start,
            age_end,
            observed_probability,
            sample_size: None,
        }
    }

    #[must_use]
    pub const fn with_sample_size(mut self, sample_size: f64) -> Self {
        self.sample_size = Some(sample_size);
        self
    }

    /// # Errors
    ///
    /// Returns `InputError` if the range, probability, or sample size is invalid.
    pub fn validate(&self, grid: &AgeGrid) -> Result<(), InputError> {
        grid.check_range(self.age_start, self.age_end)?;
        if !(0.0..=1.0).contains(&self.observed_probability) {
            return Err(InputError::InvalidProbability(self.observed_probability));
        }
        if let Some(n) = self.sample_size
            && !(n.is_finite() && n > 0.0)
        {
            return Err(InputError::InvalidSampleSize(n));
        }
        Ok(())
    }
}

/// One data point attached to a stratum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Observation {
    Count(CountObservation),
    Survival(SurvivalObservation),
}

impl Observation {
    /// # Errors
    ///
    /// Returns `InputError` if the observation is malformed for `grid`.
    pub fn validate(&self, grid: &AgeGrid) -> Result<(), InputError> {
        match self {
            Self::Count(count) => count.validate(grid),
            Self::Survival(survival) => survival.validate(grid),
        }
    }
}

impl From<CountObservation> for Observation {
    fn from(value: CountObservation) -> Self {
        Self::Count(value)
    }
}

impl From<SurvivalObservation> for Observation {
    fn from(value: SurvivalObservation) -> Self {
        Self::Survival(value)
    }
}
