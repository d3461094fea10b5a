//! Session Store & Session Manager (spec §4.2, component C2).
//!
//! A `Session` is the ordered, append-only log of messages; `SessionManager`
//! (in `store`) owns its persistence, lineage, rollover, and crash-safe
//! recovery. Grounded on `ccswarm`'s `PersistentSessionManager` (the
//! `Arc<RwLock<HashMap<...>>>` registry shape, tracing on every lifecycle
//! transition) and `ai-session`'s `session_cache.rs` (JSON-file-per-record
//! persistence), adapted from process-session bookkeeping to message-log
//! bookkeeping.

pub mod store;

use crate::message::{Message, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub use store::{SessionManager, SessionManagerConfig};

/// Opaque session identifier (spec §3 "Session.id"). Backed by a v4 UUID;
/// sort order for lineage walks uses `Session.created_at`, not the id
/// itself — see DESIGN.md for why a sortable id scheme (e.g. UUIDv7) was
/// not adopted given the teacher's dependency stack only enables v4.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-level metadata (spec §3 "Session.metadata").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub continued_from: Option<SessionId>,
    pub continued_to: Vec<SessionId>,
    /// Cached root -> self chain, oldest first, including this session.
    pub lineage: Vec<SessionId>,
    pub branch_point: Option<MessageId>,
    /// Effective context-window clamp (spec §4.1 "Sub-agent clamping").
    pub cw_max_tokens: usize,
    /// Set by the recovery path when a primary and backup load both failed;
    /// not part of the spec's field list but carries the notice required
    /// by "Failure modes" without inventing a new top-level field.
    pub recovery_notice: Option<String>,
}

impl SessionMetadata {
    pub fn root(cw_max_tokens: usize, id: SessionId) -> Self {
        Self {
            continued_from: None,
            continued_to: Vec::new(),
            lineage: vec![id],
            branch_point: None,
            cw_max_tokens,
            recovery_notice: None,
        }
    }
}

/// The ordered, append-only message log (spec §3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub messages: Vec<Message>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new_root(cw_max_tokens: usize) -> Self {
        let id = SessionId::new();
        let now = chrono::Utc::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            last_active: now,
            metadata: SessionMetadata::root(cw_max_tokens, id),
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.messages.iter().map(Message::tokens_or_zero).sum()
    }

    pub fn push(&mut self, message: Message) {
        self.last_active = chrono::Utc::now();
        self.messages.push(message);
    }

    /// Build a new Session with the same id/metadata but a replaced message
    /// list (spec §4.1 step 5, "emit a new Session value").
    pub fn with_messages(&self, messages: Vec<Message>) -> Self {
        Self {
            id: self.id,
            messages,
            created_at: self.created_at,
            last_active: self.last_active,
            metadata: self.metadata.clone(),
        }
    }

    /// SYSTEM and CONTEXT messages, used both by rollover (copied forward
    /// into the continuation session) and by lineage flattening
    /// (de-duplicated across continuations).
    pub fn carry_forward_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| {
                matches!(
                    m.category,
                    crate::message::MessageCategory::System | crate::message::MessageCategory::Context
                )
            })
            .cloned()
            .collect()
    }
}

/// De-duplicate repeated SYSTEM/CONTEXT headers carried across
/// continuations, keeping the first occurrence (spec §4.2
/// "build_flat_snapshot... de-duplicating repeated SYSTEM/CONTEXT headers").
pub(crate) fn dedupe_headers(messages: Vec<Message>) -> Vec<Message> {
    let mut seen: HashSet<MessageId> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let is_header = matches!(
            message.category,
            crate::message::MessageCategory::System | crate::message::MessageCategory::Context
        );
        if is_header {
            if !seen.insert(message.id.clone()) {
                continue;
            }
        }
        out.push(message);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Content, MessageCategory, Role};

    #[test]
    fn new_root_session_has_self_lineage() {
        let session = Session::new_root(10_000);
        assert_eq!(session.metadata.lineage, vec![session.id]);
        assert!(session.metadata.continued_from.is_none());
    }

    #[test]
    fn carry_forward_filters_to_system_and_context() {
        let mut session = Session::new_root(10_000);
        session.push(Message::new(Role::System, MessageCategory::System, Content::text("sys")));
        session.push(Message::new(Role::User, MessageCategory::Dialog, Content::text("hi")));
        session.push(Message::new(Role::User, MessageCategory::Context, Content::text("doc")));
        let carried = session.carry_forward_messages();
        assert_eq!(carried.len(), 2);
    }
}
