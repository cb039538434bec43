//! Error types for the marketplace seam.

use provbench_core::{ActivityId, ProviderId};
use thiserror::Error;

/// Errors that can occur while talking to the marketplace.
#[derive(Debug, Error)]
pub enum MarketError {
    /// Demand could not be published or negotiation could not start.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Negotiation has not been started.
    #[error("Marketplace is not negotiating")]
    NotNegotiating,

    /// The provider refused or failed to sign the agreement.
    #[error("Agreement with provider {provider} failed: {reason}")]
    Agreement { provider: ProviderId, reason: String },

    /// The provider failed to deploy the activity.
    #[error("Provider {provider} failed to deploy the activity: {reason}")]
    Provisioning { provider: ProviderId, reason: String },

    /// Remote command could not be executed.
    #[error("Execution on activity {activity} failed: {reason}")]
    Exec { activity: ActivityId, reason: String },

    /// Activity is unknown to the marketplace.
    #[error("Activity not found: {0}")]
    ActivityNotFound(ActivityId),

    /// Transient communication failure with the marketplace node.
    #[error("Communication error: {0}")]
    Communication(String),

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The payment feed was already handed out.
    #[error("Payment feed already subscribed")]
    AlreadySubscribed,
}

impl MarketError {
    /// Provider the error is attributable to, if any.
    pub fn provider(&self) -> Option<&ProviderId> {
        match self {
            Self::Agreement { provider, .. } | Self::Provisioning { provider, .. } => {
                Some(provider)
            }
            _ => None,
        }
    }
}
