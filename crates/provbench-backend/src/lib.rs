//! Reporting backend client for provbench.
//!
//! The backend stores runs, offer audits, task statuses, benchmark records and
//! per-provider costs, and publishes the persisted blacklists. The
//! orchestrator only depends on [`ReputationBackend`]; [`HttpBackend`] is the
//! REST implementation.

pub mod backend;
pub mod error;
pub mod http;
pub mod payload;

pub use backend::ReputationBackend;
pub use error::BackendError;
pub use http::HttpBackend;
pub use payload::{OfferReport, RUN_NAME};
