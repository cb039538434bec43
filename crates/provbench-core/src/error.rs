//! Core domain errors.

use thiserror::Error;

/// Core domain errors for provbench.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid activity state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Offer property missing or of the wrong type.
    #[error("Offer property '{0}' missing or malformed")]
    MalformedOffer(String),

    /// Payment amount could not be parsed as a number.
    #[error("Invalid payment amount: {0}")]
    InvalidAmount(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
