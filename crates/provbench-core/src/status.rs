//! Activity lifecycle state.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Lifecycle of an activity held by the pool.
///
/// `Creating → Ready → InUse → Terminated`, with `Ready ⇄ InUse` when an
/// activity is returned for reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    /// Being provisioned on the provider.
    #[default]
    Creating,
    /// Provisioned and idle in the pool.
    Ready,
    /// Lent to a task.
    InUse,
    /// Terminated, either by us or by the provider.
    Terminated,
}

impl ActivityState {
    /// Returns true if the activity is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns true if the activity counts against the pool's slot limit.
    pub fn is_allocated(&self) -> bool {
        matches!(self, Self::Ready | Self::InUse)
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(self, next: ActivityState) -> Result<ActivityState, CoreError> {
        use ActivityState::*;

        let allowed = matches!(
            (self, next),
            (Creating, Ready) | (Ready, InUse) | (InUse, Ready) | (_, Terminated)
        );
        if allowed && !self.is_terminal() {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}
