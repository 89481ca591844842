//! Server-tracked activities.
//!
//! Every mutating operation on the custody API is recorded as an activity.
//! Operations guarded by a multi-party policy do not execute immediately:
//! the activity sits in a consensus-needed state until enough approvers have
//! signed off, then transitions to one of the terminal states.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    /// Recorded but not yet scheduled.
    Created,
    /// Executing; no further approvals required.
    Pending,
    /// Waiting for additional approvers.
    ConsensusNeeded,
    /// Executed successfully; the result is populated.
    Completed,
    /// Executed and included in a batch; the result is populated.
    Included,
    /// Execution failed.
    Failed,
    /// Cancelled before execution.
    Cancelled,
    /// An approver rejected the operation.
    Rejected,
}

impl ActivityStatus {
    /// Whether this status ends polling: the activity will never change
    /// again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Included | Self::Failed | Self::Cancelled | Self::Rejected
        )
    }

    /// Whether this is a terminal success carrying a result.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Included)
    }
}

/// One server-tracked operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Unique activity id.
    pub id: String,
    /// Operation type, e.g. `ACTIVITY_TYPE_SIGN_RAW_PAYLOAD`.
    #[serde(rename = "type")]
    pub activity_type: String,
    /// Current status.
    pub status: ActivityStatus,
    /// Error message attached by the server. An error on a non-terminal
    /// status still fails the operation; error presence wins over status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operation result. Populated only for [`ActivityStatus::is_success`]
    /// statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Envelope the custody API wraps activities in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    /// The activity the request created or queried.
    pub activity: Activity,
}
