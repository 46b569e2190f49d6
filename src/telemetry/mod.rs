//! Telemetry module for PulseWatch.
//!
//! Holds the sample model, the entity registry and the in-memory rollup
//! store that every classification and query reads from.

mod entity;
mod horizon;
mod rollup;
mod sample;

pub use entity::*;
pub use horizon::*;
pub use rollup::*;
pub use sample::*;

use thiserror::Error;

/// Rejection reasons for an appended sample.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("entity key must not be empty")]
    EmptyKey,
    #[error("sample carries no metrics")]
    Empty,
    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },
    #[error("{field}={value} outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Unknown or malformed window label.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("unknown window: {0}")]
    Unknown(String),
}
