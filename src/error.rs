//! Error taxonomy for the agent core (spec §7).
//!
//! Internal plumbing wraps failures in `anyhow::Error` with `.context(...)`,
//! the way `ccswarm`'s `utils::error::ResultExt` does. At each component's
//! public boundary (`SessionManager`, `ConversationManager`,
//! `CheckpointManager`, `Engine`) those failures are converted into one of
//! the kinds below, so callers match on a closed, documented set rather than
//! downcasting an opaque error chain.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Even after trimming, the history does not fit the active window.
    #[error("context window capacity exceeded: {used} tokens over a {limit} token budget")]
    CapacityExceeded { used: usize, limit: usize },

    /// Primary and backup session files both failed to load.
    #[error("session {session_id} is corrupted: {reason}")]
    SessionCorrupted { session_id: String, reason: String },

    /// A write to the session or checkpoint store failed after retrying once.
    #[error("failed to persist {what} at {path}: {source}")]
    PersistenceFailed {
        what: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// The LLM gateway failed after exhausting its retry budget.
    #[error("LLM gateway unavailable after {attempts} attempts: {reason}")]
    GatewayUnavailable { attempts: u32, reason: String },

    /// A tool invocation returned `ok: false`.
    #[error("tool '{tool_name}' failed: {reason}")]
    ToolFailure { tool_name: String, reason: String },

    /// Checkpoint capture failed; not surfaced to the Engine but recorded.
    #[error("checkpoint capture failed for session {session_id}: {reason}")]
    CheckpointCaptureFailed { session_id: String, reason: String },

    /// An explicit restore/rollback/branch call failed.
    #[error("checkpoint restore failed for {checkpoint_id}: {reason}")]
    CheckpointRestoreFailed {
        checkpoint_id: String,
        reason: String,
    },

    /// Cooperative cancellation — not a failure, but modeled as an outcome
    /// so callers can match it alongside the other kinds.
    #[error("operation cancelled")]
    Cancelled,

    /// Programmer error: violates an invariant the core guarantees
    /// internally (e.g. finalizing an unknown streaming handle).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A requested session or checkpoint id is not known to the store.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CoreError::InvariantViolation(_))
    }
}
