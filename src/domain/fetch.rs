//! Execution backend request/result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the execution backend is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Routine or manual fetch of an existing working copy
    Update,
    /// Discard the working copy and clone it again
    Reclone,
    /// Synchronize a batch of changesets
    ChangesetSync,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Update => "update",
            OperationKind::Reclone => "reclone",
            OperationKind::ChangesetSync => "changeset_sync",
        };
        f.write_str(s)
    }
}

/// Result reported by the execution backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    pub success: bool,
    pub error_detail: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl FetchResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_detail: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
            completed_at: Utc::now(),
        }
    }
}
