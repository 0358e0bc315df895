//! Data types shared by the git checkpoint/diff/rollback wrapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single commit as reported by `git log`, with a flag for whether it
/// carries the harness's checkpoint commit-message prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitInfo {
    /// Commit hash (short)
    pub hash: String,

    /// Commit message (first line)
    pub message: String,

    /// Commit timestamp
    pub timestamp: Option<DateTime<Utc>>,

    /// Whether this is a harness checkpoint
    pub is_harness_checkpoint: bool,
}
