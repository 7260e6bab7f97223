//! # Models
//!
//! Gompertz hazard models for age-specific mortality, fitted by NUTS.

pub mod gompertz;
