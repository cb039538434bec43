//! Types exchanged with the marketplace.

use std::time::Duration;

use provbench_core::{ActivityId, AgreementId, Offer, ProviderId};
use serde::{Deserialize, Serialize};

/// Minimum resources requested from providers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Minimum CPU threads.
    pub min_cpu: u32,
    /// Upper bound used for budgeting, when known.
    pub max_cpu: Option<u32>,
    /// Minimum memory in GiB.
    pub min_mem_gib: f64,
    /// Minimum storage in GiB.
    pub min_storage_gib: f64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            min_cpu: 1,
            max_cpu: None,
            min_mem_gib: 0.5,
            min_storage_gib: 12.0,
        }
    }
}

/// Workload image to deploy on providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Image {
    /// Image published in the repository, addressed by hash.
    Hash(String),
    /// Base64 encoded computation manifest.
    Manifest(String),
}

/// Demand published on the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demand {
    /// Workload image.
    pub image: Image,
    /// Resource constraints.
    pub resources: Resources,
    /// How long the demand stays on the market.
    pub expiration: Duration,
}

impl Demand {
    /// Create a demand for an image with default resources.
    pub fn new(image: Image) -> Self {
        Self {
            image,
            resources: Resources::default(),
            expiration: Duration::from_secs(10 * 60),
        }
    }

    /// Builder method to set resources.
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}

/// An offer that passed the proposal gate and can be turned into an agreement.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Marketplace proposal id.
    pub id: String,
    /// The offer behind the proposal.
    pub offer: Offer,
}

impl Proposal {
    /// Provider that published the proposal.
    pub fn provider_id(&self) -> &ProviderId {
        &self.offer.provider_id
    }
}

/// A committed offer with one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    /// Agreement id.
    pub id: AgreementId,
    /// Offer the agreement was made on.
    pub offer: Offer,
}

impl Agreement {
    /// Provider bound by the agreement.
    pub fn provider_id(&self) -> &ProviderId {
        &self.offer.provider_id
    }

    /// Provider's display name.
    pub fn provider_name(&self) -> &str {
        &self.offer.provider_name
    }
}

/// Options for provisioning an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityOptions {
    /// Maximum time to wait for the activity to be deployed and started.
    pub provision_timeout: Duration,
    /// Maximum time a single remote command may run.
    pub execute_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(60),
            execute_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Handle to a provisioned remote execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    /// Activity id.
    pub id: ActivityId,
    /// Agreement the activity runs under.
    pub agreement: Agreement,
    /// Per-command execute timeout negotiated at creation.
    pub execute_timeout: Duration,
}

impl Activity {
    /// Provider hosting the activity.
    pub fn provider_id(&self) -> &ProviderId {
        self.agreement.provider_id()
    }
}

/// Outcome reported by the provider for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Ok,
    Error,
}

/// Result of running a command on an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Result sentinel reported by the provider.
    pub result: ExecStatus,
    /// Captured standard output.
    pub stdout: Option<String>,
    /// Captured standard error.
    pub stderr: Option<String>,
}

impl ExecResult {
    /// A successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            result: ExecStatus::Ok,
            stdout: Some(stdout.into()),
            stderr: None,
        }
    }

    /// A failed result with the given stderr.
    pub fn error(stderr: impl Into<String>) -> Self {
        Self {
            result: ExecStatus::Error,
            stdout: None,
            stderr: Some(stderr.into()),
        }
    }

    /// Returns true if the provider reported the error sentinel.
    pub fn is_error(&self) -> bool {
        self.result == ExecStatus::Error
    }

    /// Non-empty stdout, if any.
    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Best message describing the result: stdout, else stderr.
    pub fn message(&self) -> Option<&str> {
        self.stdout()
            .or_else(|| self.stderr.as_deref().filter(|s| !s.trim().is_empty()))
    }
}

/// Activity state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteState {
    New,
    Initialized,
    Deployed,
    Ready,
    Unresponsive,
    Terminated,
}

impl RemoteState {
    /// Returns true if the activity can no longer run commands.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_message_prefers_stdout() {
        let result = ExecResult {
            result: ExecStatus::Error,
            stdout: Some("  ".to_string()),
            stderr: Some("boom".to_string()),
        };
        assert!(result.is_error());
        assert_eq!(result.message(), Some("boom"));
        assert_eq!(ExecResult::ok("fine").message(), Some("fine"));
    }
}
