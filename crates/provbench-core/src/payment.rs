//! Payment events emitted by the marketplace's settlement engine.

use serde::{Deserialize, Serialize};

use crate::{CoreError, ProviderId};

/// A payment accepted for a provider's invoice or debit note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Provider that was paid.
    pub provider_id: ProviderId,

    /// Amount as reported by the settlement engine (decimal string).
    pub amount: String,
}

impl PaymentEvent {
    /// Create a new payment event.
    pub fn new(provider_id: ProviderId, amount: impl Into<String>) -> Self {
        Self {
            provider_id,
            amount: amount.into(),
        }
    }

    /// Parse the amount as a finite number.
    pub fn parse_amount(&self) -> Result<f64, CoreError> {
        self.amount
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|a| a.is_finite())
            .ok_or_else(|| CoreError::InvalidAmount(self.amount.clone()))
    }
}
