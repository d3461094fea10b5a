//! `SessionManager`: persistence, lineage, and rollover for `Session`
//! (spec §4.2). Grounded on `ccswarm`'s `PersistentSessionManager::new`/
//! cleanup-task wiring and `ai-session`'s JSON-sidecar session cache, with
//! the atomic write protocol (temp -> fsync -> `.bak` -> rename -> index
//! update) spelled out explicitly in spec §4.2.

use super::{dedupe_headers, Session, SessionId, SessionMetadata};
use crate::config::SessionConfig;
use crate::error::{CoreError, Result};
use crate::message::{Content, Message, MessageCategory, Role};
use penguin_snapshot_store::compress::{self, Compression};
use penguin_snapshot_store::index::RecordIndex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Sidecar compressed form is only worth writing past this size; small
/// sessions stay pure JSON (spec §4.2 "optional binary compressed form for
/// large payloads").
const COMPRESSED_SIDECAR_THRESHOLD_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionIndexEntry {
    created_at: chrono::DateTime<chrono::Utc>,
    last_active: chrono::DateTime<chrono::Utc>,
    message_count: usize,
    continued_from: Option<SessionId>,
    continued_to: Vec<SessionId>,
    lineage: Vec<SessionId>,
}

impl From<&Session> for SessionIndexEntry {
    fn from(session: &Session) -> Self {
        Self {
            created_at: session.created_at,
            last_active: session.last_active,
            message_count: session.message_count(),
            continued_from: session.metadata.continued_from,
            continued_to: session.metadata.continued_to.clone(),
            lineage: session.metadata.lineage.clone(),
        }
    }
}

pub struct SessionManagerConfig {
    pub root_dir: PathBuf,
    pub session: SessionConfig,
}

/// Owns session persistence under `root_dir/sessions/`. Cheap to clone
/// (internals are behind an `Arc`), mirroring how `ccswarm` shares its
/// session registry across task handles.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    root_dir: PathBuf,
    config: SessionConfig,
    index: Mutex<RecordIndex<SessionId, SessionIndexEntry>>,
}

impl SessionManager {
    pub async fn new(config: SessionManagerConfig) -> Result<Self> {
        let sessions_dir = config.root_dir.join("sessions");
        tokio::fs::create_dir_all(&sessions_dir)
            .await
            .map_err(|e| CoreError::PersistenceFailed {
                what: "sessions directory".into(),
                path: sessions_dir.clone(),
                source: e.into(),
            })?;
        let index_path = sessions_dir.join("index.json");
        let index = RecordIndex::load(&index_path).map_err(|e| CoreError::PersistenceFailed {
            what: "session index".into(),
            path: index_path,
            source: e.into(),
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                root_dir: config.root_dir,
                config: config.session,
                index: Mutex::new(index),
            }),
        })
    }

    fn sessions_dir(&self) -> PathBuf {
        self.inner.root_dir.join("sessions")
    }

    fn primary_path(&self, id: SessionId) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json"))
    }

    fn backup_path(&self, id: SessionId) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json.bak"))
    }

    fn sidecar_path(&self, id: SessionId) -> PathBuf {
        self.sessions_dir().join(format!("{id}.snapshot.bin"))
    }

    pub fn create_root(&self, cw_max_tokens: usize) -> Session {
        Session::new_root(cw_max_tokens)
    }

    /// Atomic write protocol (spec §4.2), retried once on failure before
    /// propagating (spec §7 "retried by SessionManager once, then
    /// propagated").
    pub async fn save(&self, session: &Session) -> Result<()> {
        match self.try_save(session).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "session save failed, retrying once");
                self.try_save(session).await
            }
        }
    }

    async fn try_save(&self, session: &Session) -> Result<()> {
        let target = self.primary_path(session.id);
        let temp = self.sessions_dir().join(format!("{}.tmp", session.id));
        let json = serde_json::to_vec_pretty(session).map_err(|e| CoreError::PersistenceFailed {
            what: "session".into(),
            path: target.clone(),
            source: e.into(),
        })?;

        self.write_and_sync(&temp, &json).await.map_err(|e| CoreError::PersistenceFailed {
            what: "session".into(),
            path: temp.clone(),
            source: e,
        })?;

        if target.exists() {
            let backup = self.backup_path(session.id);
            tokio::fs::rename(&target, &backup)
                .await
                .map_err(|e| CoreError::PersistenceFailed {
                    what: "session backup rotation".into(),
                    path: backup,
                    source: e.into(),
                })?;
        }

        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| CoreError::PersistenceFailed {
                what: "session".into(),
                path: target.clone(),
                source: e.into(),
            })?;

        if json.len() > COMPRESSED_SIDECAR_THRESHOLD_BYTES {
            if let Err(e) = self.write_sidecar(session).await {
                warn!(session_id = %session.id, error = %e, "compressed sidecar write failed, JSON record remains authoritative");
            }
        }

        let entry = SessionIndexEntry::from(session);
        let mut index = self.inner.index.lock().await;
        index
            .upsert(session.id, entry)
            .map_err(|e| CoreError::PersistenceFailed {
                what: "session index".into(),
                path: self.sessions_dir().join("index.json"),
                source: e.into(),
            })?;

        info!(session_id = %session.id, messages = session.message_count(), "session saved");
        Ok(())
    }

    async fn write_sidecar(&self, session: &Session) -> anyhow::Result<()> {
        let bytes = compress::encode(session, Compression::Lz4)?;
        tokio::fs::write(self.sidecar_path(session.id), bytes).await?;
        Ok(())
    }

    async fn write_and_sync(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Load a session: primary, then `.bak`, then a synthesized recovery
    /// session (spec §4.2 "Atomic write protocol" / §7 `SessionCorrupted`).
    pub async fn load(&self, id: SessionId) -> Result<Session> {
        let primary = self.primary_path(id);
        match self.load_from(&primary).await {
            Ok(session) => return Ok(session),
            Err(e) => warn!(session_id = %id, error = %e, "primary session record failed to load, trying backup"),
        }

        let backup = self.backup_path(id);
        match self.load_from(&backup).await {
            Ok(session) => {
                warn!(session_id = %id, "recovered session from backup record");
                return Ok(session);
            }
            Err(e) => warn!(session_id = %id, error = %e, "backup session record failed to load, synthesizing recovery session"),
        }

        Ok(self.synthesize_recovery_session(id))
    }

    async fn load_from(&self, path: &Path) -> anyhow::Result<Session> {
        let bytes = tokio::fs::read(path).await?;
        let session: Session = serde_json::from_slice(&bytes)?;
        Ok(session)
    }

    fn synthesize_recovery_session(&self, original_id: SessionId) -> Session {
        let mut session = Session::new_root(crate::config::ContextWindowConfig::default().total_tokens);
        session.metadata.recovery_notice = Some(format!(
            "original session {original_id} was unreadable (primary and backup both failed)"
        ));
        session.push(Message::new(
            Role::System,
            MessageCategory::System,
            Content::text(format!(
                "recovered session: original id {original_id} could not be loaded; history before this point is unavailable"
            )),
        ));
        session
    }

    /// Persist the current session, create its continuation, copy forward
    /// SYSTEM/CONTEXT headers, and link both sides (spec §4.2 "Rollover").
    pub async fn rollover(&self, current: Session) -> Result<(Session, Session)> {
        self.save(&current).await?;

        let mut next = Session::new_root(current.metadata.cw_max_tokens);
        next.metadata.continued_from = Some(current.id);
        next.metadata.lineage = {
            let mut lineage = current.metadata.lineage.clone();
            lineage.push(next.id);
            lineage
        };

        for message in current.carry_forward_messages() {
            next.push(message);
        }
        next.push(Message::new(
            Role::System,
            MessageCategory::System,
            Content::text(format!("continued from session {}", current.id)),
        ).with_metadata("type", serde_json::json!("continuation")));

        let mut current = current;
        current.push(Message::new(
            Role::System,
            MessageCategory::System,
            Content::text(format!("continued into session {}", next.id)),
        ).with_metadata("type", serde_json::json!("continuation")));
        current.metadata.continued_to.push(next.id);

        self.save(&current).await?;
        self.save(&next).await?;

        Ok((current, next))
    }

    pub fn should_rollover(&self, session: &Session) -> bool {
        session.message_count() > self.inner.config.max_messages_per_session
    }

    /// Walk `continued_from` back to the root (spec §4.2 "Lineage queries").
    pub async fn collect_lineage(&self, session_id: SessionId) -> Result<Vec<SessionId>> {
        let mut chain = Vec::new();
        let mut current = Some(session_id);
        let mut guard_count = 0usize;
        while let Some(id) = current {
            chain.push(id);
            let session = self.load(id).await?;
            current = session.metadata.continued_from;
            guard_count += 1;
            if guard_count > 100_000 {
                return Err(CoreError::InvariantViolation(format!(
                    "lineage walk for session {session_id} exceeded the sanity bound; possible cycle"
                )));
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Concatenate every session in the lineage up to (optionally)
    /// `upto_message_id` within the final session, de-duplicating repeated
    /// SYSTEM/CONTEXT headers (spec §4.2 "build_flat_snapshot").
    pub async fn build_flat_snapshot(
        &self,
        session_id: SessionId,
        upto_message_id: Option<crate::message::MessageId>,
    ) -> Result<Session> {
        let lineage = self.collect_lineage(session_id).await?;
        let mut flattened = Vec::new();
        for (i, id) in lineage.iter().enumerate() {
            let session = self.load(*id).await?;
            let is_final = i + 1 == lineage.len();
            if is_final {
                if let Some(boundary) = upto_message_id {
                    let mut messages = Vec::new();
                    for message in session.messages {
                        let stop = message.id == boundary;
                        messages.push(message);
                        if stop {
                            break;
                        }
                    }
                    flattened.extend(messages);
                } else {
                    flattened.extend(session.messages);
                }
            } else {
                flattened.extend(session.messages);
            }
        }

        let deduped = dedupe_headers(flattened);
        let final_session = self.load(session_id).await?;
        Ok(Session {
            id: final_session.id,
            messages: deduped,
            created_at: final_session.created_at,
            last_active: final_session.last_active,
            metadata: SessionMetadata {
                lineage,
                ..final_session.metadata
            },
        })
    }
}
