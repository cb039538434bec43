//! The marketplace collaborator, seen from the requestor side.
//!
//! Negotiation, agreement signing, activity control and payment settlement
//! all live behind [`Marketplace`]. The orchestrator only ever talks to this
//! trait, so the real node client and the [`SimulatedMarket`] are
//! interchangeable.
//!
//! [`SimulatedMarket`]: crate::SimulatedMarket

use std::sync::Arc;

use async_trait::async_trait;
use provbench_core::{ActivityId, AgreementId, Offer, PaymentEvent};
use tokio::sync::mpsc;

use crate::error::MarketError;
use crate::types::{
    Activity, ActivityOptions, Agreement, Demand, ExecResult, Proposal, RemoteState,
};

/// Gate consulted for every offer the marketplace receives.
///
/// Only offers admitted by the gate become [`Proposal`]s.
#[async_trait]
pub trait ProposalGate: Send + Sync {
    /// Decide whether the offer may be turned into an agreement.
    async fn admit(&self, offer: &Offer) -> bool;
}

/// Requestor-side view of the marketplace.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Publish the demand and start negotiating. Every incoming offer is
    /// passed through `gate`.
    async fn negotiate(&self, demand: Demand, gate: Arc<dyn ProposalGate>)
        -> Result<(), MarketError>;

    /// Proposals admitted by the gate and not yet turned into agreements.
    async fn proposals(&self) -> Result<Vec<Proposal>, MarketError>;

    /// Sign an agreement on an admitted proposal.
    async fn create_agreement(&self, proposal: &Proposal) -> Result<Agreement, MarketError>;

    /// Release an agreement. With `allow_reuse = false` the agreement is
    /// terminated and never handed out again.
    async fn release_agreement(
        &self,
        agreement_id: &AgreementId,
        allow_reuse: bool,
    ) -> Result<(), MarketError>;

    /// Start accepting invoices and debit notes for the agreement.
    async fn accept_payments(&self, agreement: &Agreement) -> Result<(), MarketError>;

    /// Deploy and start an activity under the agreement.
    async fn create_activity(
        &self,
        agreement: &Agreement,
        options: &ActivityOptions,
    ) -> Result<Activity, MarketError>;

    /// Run a shell command on the activity.
    async fn run(&self, activity_id: &ActivityId, command: &str) -> Result<ExecResult, MarketError>;

    /// Query the activity's state on the provider.
    async fn activity_state(&self, activity_id: &ActivityId) -> Result<RemoteState, MarketError>;

    /// Stop the activity on the provider.
    async fn terminate_activity(&self, activity_id: &ActivityId) -> Result<(), MarketError>;

    /// Take the single consumer end of the payment-accepted feed.
    async fn subscribe_payments(&self) -> Result<mpsc::Receiver<PaymentEvent>, MarketError>;

    /// Stop negotiating and settle outstanding payments. Closes the payment feed.
    async fn shutdown(&self) -> Result<(), MarketError>;
}
