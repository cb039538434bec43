//! Marketplace offers and their pricing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CoreError, ProviderId};

/// Property carrying the number of CPU threads a provider declares.
pub const PROP_CPU_THREADS: &str = "golem.inf.cpu.threads";

/// Property carrying the operator's payout wallet address.
pub const PROP_OPERATOR_ADDRESS: &str = "golem.com.payment.platform.erc20-polygon-glm.address";

/// Hourly price components of an offer, in GLM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// One-off price charged when the activity starts.
    pub start: f64,
    /// Price per hour of CPU time, per thread.
    pub cpu_per_hour: f64,
    /// Price per hour of wall-clock environment time.
    pub env_per_hour: f64,
}

impl Pricing {
    /// Create pricing from its three components.
    pub fn new(start: f64, cpu_per_hour: f64, env_per_hour: f64) -> Self {
        Self {
            start,
            cpu_per_hour,
            env_per_hour,
        }
    }
}

/// A provider's bid on the marketplace. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Provider that published the offer.
    pub provider_id: ProviderId,

    /// Human-readable provider name.
    pub provider_name: String,

    /// Price components.
    pub pricing: Pricing,

    /// Declared CPU thread count.
    pub cpu_threads: u32,

    /// Operator wallet address, when published.
    pub operator_address: Option<String>,

    /// Raw property bag as received from the marketplace.
    pub properties: Map<String, Value>,
}

impl Offer {
    /// Create a new Offer with an empty property bag.
    pub fn new(provider_id: ProviderId, pricing: Pricing, cpu_threads: u32) -> Self {
        Self {
            provider_name: provider_id.to_string(),
            provider_id,
            pricing,
            cpu_threads,
            operator_address: None,
            properties: Map::new(),
        }
    }

    /// Build an offer from a raw property bag.
    ///
    /// The thread count and operator address are read from their well-known
    /// properties; a missing thread count is an error.
    pub fn from_properties(
        provider_id: ProviderId,
        provider_name: impl Into<String>,
        pricing: Pricing,
        properties: Map<String, Value>,
    ) -> Result<Self, CoreError> {
        let cpu_threads = properties
            .get(PROP_CPU_THREADS)
            .and_then(Value::as_u64)
            .and_then(|t| u32::try_from(t).ok())
            .ok_or_else(|| CoreError::MalformedOffer(PROP_CPU_THREADS.to_string()))?;

        let operator_address = properties
            .get(PROP_OPERATOR_ADDRESS)
            .and_then(Value::as_str)
            .map(str::to_owned);

        Ok(Self {
            provider_id,
            provider_name: provider_name.into(),
            pricing,
            cpu_threads,
            operator_address,
            properties,
        })
    }

    /// Builder method to set the provider name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    /// Builder method to set the operator address.
    pub fn with_operator(mut self, address: impl Into<String>) -> Self {
        let address = address.into();
        self.properties
            .insert(PROP_OPERATOR_ADDRESS.to_string(), Value::String(address.clone()));
        self.operator_address = Some(address);
        self
    }

    /// Estimated cost of renting this offer for `hours`.
    ///
    /// A non-zero start price makes the estimate infinite.
    pub fn estimate_cost(&self, hours: f64) -> f64 {
        if self.pricing.start > 0.0 {
            return f64::INFINITY;
        }
        self.pricing.cpu_per_hour * f64::from(self.cpu_threads) * hours
            + self.pricing.env_per_hour * hours
    }
}
