//! Marketplace seam for provbench.
//!
//! The orchestrator negotiates with providers, signs agreements, drives
//! activities and listens for payments through the [`Marketplace`] trait.
//! [`SimulatedMarket`] implements it in memory for dry runs and tests.

pub mod error;
pub mod protocol;
pub mod sim;
pub mod types;

pub use error::MarketError;
pub use protocol::{Marketplace, ProposalGate};
pub use sim::{ProviderBehavior, SimGpu, SimStats, SimulatedMarket};
pub use types::{
    Activity, ActivityOptions, Agreement, Demand, ExecResult, ExecStatus, Image, Proposal,
    RemoteState, Resources,
};
