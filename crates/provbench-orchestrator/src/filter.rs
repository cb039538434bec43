//! Offer filtering.
//!
//! [`ProviderFilter`] decides whether an offer may be turned into an
//! agreement. It is a pure function of the offer and the inputs fixed at run
//! start: blacklists, provider scope, reputation snapshot and the budget per
//! slot. Rules, first match wins:
//!
//! 1. operator wallet blacklisted: reject
//! 2. provider blacklisted: reject
//! 3. provider outside the configured scope: reject
//! 4. non-zero start price: reject
//! 5. with a reputation snapshot: missing record rejects, cheaper than the
//!    reference accepts, overpriced beyond 20% rejects, anything else accepts
//! 6. without a snapshot: accept when the estimated cost fits the slot budget
//!
//! [`FilterGate`] installs the filter into the marketplace and reports every
//! decision to the backend without waiting for the result.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use provbench_backend::{OfferReport, ReputationBackend};
use provbench_core::{Blacklist, Offer, ProviderId, ReputationIndex, RunId};
use provbench_market::ProposalGate;
use serde_json::Value;
use tracing::{debug, warn};

/// Overpricing tolerated relative to the reference price.
pub const OVERPRICE_MARGIN: f64 = 0.2;

/// Whether a scope lists the only permitted providers or the excluded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMode {
    Allow,
    Deny,
}

/// Allow or deny list of provider ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderScope {
    pub mode: ScopeMode,
    pub providers: HashSet<ProviderId>,
}

impl ProviderScope {
    /// Only the listed providers are permitted.
    pub fn allow(providers: impl IntoIterator<Item = ProviderId>) -> Self {
        Self {
            mode: ScopeMode::Allow,
            providers: providers.into_iter().collect(),
        }
    }

    /// The listed providers are excluded.
    pub fn deny(providers: impl IntoIterator<Item = ProviderId>) -> Self {
        Self {
            mode: ScopeMode::Deny,
            providers: providers.into_iter().collect(),
        }
    }

    /// Returns true if the provider may be used.
    pub fn permits(&self, provider_id: &ProviderId) -> bool {
        let listed = self.providers.contains(provider_id);
        match self.mode {
            ScopeMode::Allow => listed,
            ScopeMode::Deny => !listed,
        }
    }
}

/// Accept/reject decision with a human-readable reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub accepted: bool,
    pub reason: String,
}

impl Decision {
    fn accept(reason: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason: reason.into(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
        }
    }
}

/// Offer filter with the inputs fixed for one run.
#[derive(Debug, Clone)]
pub struct ProviderFilter {
    blacklist: Blacklist,
    reputation: Option<ReputationIndex>,
    scope: Option<ProviderScope>,
    budget_per_slot: f64,
    rent_hours: f64,
}

impl ProviderFilter {
    /// Create a filter judging offers on blacklist and budget.
    pub fn new(blacklist: Blacklist, budget_per_slot: f64, rent_hours: f64) -> Self {
        Self {
            blacklist,
            reputation: None,
            scope: None,
            budget_per_slot,
            rent_hours,
        }
    }

    /// Builder method to judge prices against a reputation snapshot.
    pub fn with_reputation(mut self, reputation: ReputationIndex) -> Self {
        self.reputation = Some(reputation);
        self
    }

    /// Builder method to restrict the providers considered.
    pub fn with_scope(mut self, scope: Option<ProviderScope>) -> Self {
        self.scope = scope;
        self
    }

    /// Budget available to one rented slot.
    pub fn budget_per_slot(&self) -> f64 {
        self.budget_per_slot
    }

    /// Decide whether the offer may be rented.
    pub fn evaluate(&self, offer: &Offer) -> Decision {
        if let Some(operator) = offer.operator_address.as_deref() {
            if self.blacklist.contains_operator(operator) {
                return Decision::reject(format!("Operator {operator} is blacklisted"));
            }
        }

        if self.blacklist.contains_provider(&offer.provider_id) {
            return Decision::reject("Provider is blacklisted");
        }

        if let Some(scope) = &self.scope {
            if !scope.permits(&offer.provider_id) {
                return Decision::reject(match scope.mode {
                    ScopeMode::Allow => "Provider is not on the allow list",
                    ScopeMode::Deny => "Provider is on the deny list",
                });
            }
        }

        if offer.pricing.start != 0.0 {
            return Decision::reject(format!(
                "Offer has a non-zero start price ({})",
                offer.pricing.start
            ));
        }

        match &self.reputation {
            Some(reputation) => Self::judge_reputation(reputation, &offer.provider_id),
            None => self.judge_budget(offer),
        }
    }

    fn judge_reputation(reputation: &ReputationIndex, provider_id: &ProviderId) -> Decision {
        let Some(comparison) = reputation.get(provider_id) else {
            return Decision::reject("No reputation data for provider");
        };

        if comparison.is_cheaper() {
            return Decision::accept(format!(
                "Provider is {:.2} times cheaper than the reference price",
                comparison.times_cheaper.unwrap_or_default()
            ));
        }

        if comparison.overpriced_beyond(OVERPRICE_MARGIN) {
            return Decision::reject(match comparison.times_more_expensive {
                Some(factor) => format!(
                    "Provider is overpriced: {factor:.2} times the reference price"
                ),
                None => "Provider is overpriced".to_string(),
            });
        }

        Decision::accept("Provider price is within the margin of the reference price")
    }

    fn judge_budget(&self, offer: &Offer) -> Decision {
        let estimate = offer.estimate_cost(self.rent_hours);
        if estimate <= self.budget_per_slot {
            Decision::accept(format!(
                "Estimated cost {estimate:.4} fits the budget per slot {:.4}",
                self.budget_per_slot
            ))
        } else {
            Decision::reject(format!(
                "Estimated cost {estimate:.4} exceeds the budget per slot {:.4}",
                self.budget_per_slot
            ))
        }
    }
}

/// [`ProposalGate`] that applies a [`ProviderFilter`] and audits every
/// decision with the backend.
pub struct FilterGate {
    filter: Arc<ProviderFilter>,
    backend: Arc<dyn ReputationBackend>,
    run_id: RunId,
}

impl FilterGate {
    /// Create a new gate for a run.
    pub fn new(
        filter: Arc<ProviderFilter>,
        backend: Arc<dyn ReputationBackend>,
        run_id: RunId,
    ) -> Self {
        Self {
            filter,
            backend,
            run_id,
        }
    }
}

#[async_trait]
impl ProposalGate for FilterGate {
    async fn admit(&self, offer: &Offer) -> bool {
        let decision = self.filter.evaluate(offer);

        debug!(
            provider_id = %offer.provider_id,
            provider_name = %offer.provider_name,
            accepted = decision.accepted,
            reason = %decision.reason,
            "Offer evaluated"
        );

        let report = OfferReport {
            provider_id: offer.provider_id.clone(),
            offer: Value::Object(offer.properties.clone()),
            run_id: self.run_id.clone(),
            accepted: decision.accepted,
            reason: decision.reason,
        };
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.submit_offer(&report).await {
                warn!(provider_id = %report.provider_id, error = %e, "Failed to report offer");
            }
        });

        decision.accepted
    }
}
