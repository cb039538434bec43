//! provbench Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - The marketplace
//! - Runtime specifics
//!
//! All types here describe offers, providers, activities and the records a
//! benchmark run produces.

pub mod blacklist;
pub mod error;
pub mod ids;
pub mod offer;
pub mod outcome;
pub mod payment;
pub mod reputation;
pub mod status;

// Re-export commonly used types
pub use blacklist::Blacklist;
pub use error::CoreError;
pub use ids::{ActivityId, AgreementId, ProviderId, RunId};
pub use offer::{Offer, Pricing};
pub use outcome::{
    BenchmarkKind, BenchmarkRecord, CostUpdate, TaskCompletion, TaskKind, FULL_SUITE_TASK,
};
pub use payment::PaymentEvent;
pub use reputation::{PriceComparison, ProviderRecord, ReputationIndex};
pub use status::ActivityState;
