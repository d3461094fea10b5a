//! Checkpoint/Snapshot Manager (spec §4.4, component C4). Grounded on
//! `ccswarm`'s background-task pattern in `PersistentSessionManager::start`
//! (a `tokio::spawn`ed loop reading off a shared handle) combined with
//! `ai-session`'s JSON-index persistence, here feeding a bounded
//! `async-channel` worker queue instead of a timer.

pub mod retention;

use crate::config::CheckpointConfig;
use crate::error::{CoreError, Result};
use crate::message::{Message, MessageId};
use crate::session::{Session, SessionId, SessionManager};
use penguin_snapshot_store::compress::{self, Compression};
use penguin_snapshot_store::index::RecordIndex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

const CAPTURE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckpointId(pub uuid::Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checkpoint taxonomy (spec §3 "Checkpoint.type").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Auto,
    Manual,
    Branch,
    Rollback,
}

/// State machine of a checkpoint record (spec §4.4). Only `Committed`
/// records are returnable by listing APIs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Writing,
    Committed,
    Referenced,
    Expired,
    Deleted,
}

/// Checkpoint header, persisted in the checkpoint index (spec §6
/// "Checkpoint record schema").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: CheckpointId,
    pub kind: CheckpointKind,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub auto: bool,
    pub state: CheckpointState,
}

/// A manual/branch/rollback capture request. Sent over the reliable,
/// awaited channel — these never get dropped under backpressure (spec §5
/// "never manual/branch/rollback"). AUTO requests bypass this channel
/// entirely; see `Inner::auto_queue`.
struct NamedCaptureRequest {
    session: Session,
    kind: CheckpointKind,
    name: Option<String>,
    description: Option<String>,
    reply: tokio::sync::oneshot::Sender<Result<CheckpointId>>,
}

pub struct CheckpointManagerConfig {
    pub root_dir: PathBuf,
    pub sessions: SessionManager,
    pub config: CheckpointConfig,
}

/// Owns the checkpoint index and the bounded capture queue (spec §4.4,
/// §5 "The Checkpoint Manager runs on a separate cooperative worker").
#[derive(Clone)]
pub struct CheckpointManager {
    inner: Arc<Inner>,
}

struct Inner {
    root_dir: PathBuf,
    sessions: SessionManager,
    config: CheckpointConfig,
    index: Mutex<RecordIndex<CheckpointId, CheckpointRecord>>,
    sender: async_channel::Sender<NamedCaptureRequest>,
    consecutive_failures: AtomicUsize,
    auto_disabled: std::sync::atomic::AtomicBool,
    messages_since_last_auto: AtomicUsize,
    /// FIFO queue of pending AUTO captures, bounded at
    /// `CAPTURE_QUEUE_CAPACITY`. A full queue evicts its oldest entry rather
    /// than rejecting the newest (spec §5 Backpressure).
    auto_queue: Mutex<VecDeque<Session>>,
    auto_notify: Notify,
    auto_checkpoints_dropped: AtomicUsize,
}

impl CheckpointManager {
    pub async fn new(config: CheckpointManagerConfig) -> Result<Self> {
        let checkpoints_dir = config.root_dir.join("checkpoints");
        tokio::fs::create_dir_all(&checkpoints_dir)
            .await
            .map_err(|e| CoreError::PersistenceFailed {
                what: "checkpoints directory".into(),
                path: checkpoints_dir.clone(),
                source: e.into(),
            })?;
        let index_path = checkpoints_dir.join("checkpoint_index.json");
        let index = RecordIndex::load(&index_path).map_err(|e| CoreError::PersistenceFailed {
            what: "checkpoint index".into(),
            path: index_path,
            source: e.into(),
        })?;

        let (sender, receiver) = async_channel::bounded(CAPTURE_QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            root_dir: config.root_dir,
            sessions: config.sessions,
            config: config.config,
            index: Mutex::new(index),
            sender,
            consecutive_failures: AtomicUsize::new(0),
            auto_disabled: std::sync::atomic::AtomicBool::new(false),
            messages_since_last_auto: AtomicUsize::new(0),
            auto_queue: Mutex::new(VecDeque::with_capacity(CAPTURE_QUEUE_CAPACITY)),
            auto_notify: Notify::new(),
            auto_checkpoints_dropped: AtomicUsize::new(0),
        });

        spawn_worker(Arc::clone(&inner), receiver);

        Ok(Self { inner })
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.inner.root_dir.join("checkpoints")
    }

    fn snapshot_path(&self, id: CheckpointId) -> PathBuf {
        self.checkpoints_dir().join(format!("{id}.snapshot.zst"))
    }

    /// Called after every message append; enqueues an AUTO capture every
    /// `frequency` messages without awaiting completion (spec §4.4
    /// "Capture protocol" step 1).
    pub async fn on_message_appended(&self, session: &Session) {
        if !self.inner.config.enabled || self.inner.auto_disabled.load(Ordering::Relaxed) {
            return;
        }
        let count = self.inner.messages_since_last_auto.fetch_add(1, Ordering::Relaxed) + 1;
        if count < self.inner.config.frequency {
            return;
        }
        self.inner.messages_since_last_auto.store(0, Ordering::Relaxed);

        let mut queue = self.inner.auto_queue.lock().await;
        if queue.len() >= CAPTURE_QUEUE_CAPACITY {
            queue.pop_front();
            let dropped = self.inner.auto_checkpoints_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(session_id = %session.id, total_dropped = dropped, "AUTO checkpoint queue full, evicted oldest queued AUTO request");
        }
        queue.push_back(session.clone());
        drop(queue);
        self.inner.auto_notify.notify_one();
    }

    /// Number of AUTO capture requests evicted under backpressure so far
    /// (spec §5 "records a metric").
    pub fn dropped_auto_checkpoint_count(&self) -> usize {
        self.inner.auto_checkpoints_dropped.load(Ordering::Relaxed)
    }

    /// spec §6 "create_manual_checkpoint". Awaited: unlike AUTO captures,
    /// callers need the resulting id back.
    pub async fn create_manual_checkpoint(
        &self,
        session: &Session,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<CheckpointId> {
        self.submit_named(session.clone(), CheckpointKind::Manual, name, description).await
    }

    async fn submit_named(
        &self,
        session: Session,
        kind: CheckpointKind,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<CheckpointId> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.inner
            .sender
            .send(NamedCaptureRequest {
                session,
                kind,
                name,
                description,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoreError::InvariantViolation("checkpoint worker channel closed".into()))?;
        reply_rx
            .await
            .map_err(|_| CoreError::InvariantViolation("checkpoint worker dropped reply channel".into()))?
    }

    /// spec §4.4 "Restore protocol". Returns the restored Session; the
    /// caller (ConversationManager) decides how to install it as active.
    /// This implementation keeps the original session id (spec §4.4
    /// "implementations MUST choose one and document it") so external
    /// references to the session id remain valid across a rollback.
    pub async fn rollback_to_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Session> {
        let record = self.committed_record(checkpoint_id).await?;
        let snapshot = self.load_snapshot(checkpoint_id).await?;

        let replaced_session = self.inner.sessions.load(record.session_id).await?;
        self.submit_named(
            replaced_session,
            CheckpointKind::Rollback,
            Some(format!("pre-rollback-to-{checkpoint_id}")),
            Some("state replaced by rollback_to_checkpoint".to_string()),
        )
        .await?;

        let mut restored = snapshot;
        restored.id = record.session_id;
        self.inner.sessions.save(&restored).await?;
        info!(checkpoint_id = %checkpoint_id, session_id = %restored.id, "rolled back to checkpoint");
        Ok(restored)
    }

    /// spec §4.4 "Branch protocol". Returns the new session's id without
    /// switching it active (spec §9 "or return its id for deferred
    /// switching" — the decision recorded for this implementation).
    pub async fn branch_from_checkpoint(&self, checkpoint_id: CheckpointId, name: Option<String>) -> Result<SessionId> {
        let record = self.committed_record(checkpoint_id).await?;
        let snapshot = self.load_snapshot(checkpoint_id).await?;

        let mut branch = Session::new_root(snapshot.metadata.cw_max_tokens);
        branch.metadata.continued_from = Some(record.session_id);
        branch.metadata.branch_point = Some(record.message_id.clone());
        branch.metadata.lineage = {
            let mut lineage = snapshot.metadata.lineage.clone();
            lineage.push(branch.id);
            lineage
        };
        branch.messages = snapshot.messages;
        self.inner.sessions.save(&branch).await?;

        self.submit_named(branch.clone(), CheckpointKind::Branch, name, None).await?;
        info!(checkpoint_id = %checkpoint_id, branch_session_id = %branch.id, "branched from checkpoint");
        Ok(branch.id)
    }

    /// spec §6 "list_checkpoints": only `Committed` records.
    pub async fn list_checkpoints(&self, session_id: Option<SessionId>) -> Vec<CheckpointRecord> {
        let index = self.inner.index.lock().await;
        index
            .iter()
            .filter(|(_, r)| r.state == CheckpointState::Committed)
            .filter(|(_, r)| session_id.map(|sid| r.session_id == sid).unwrap_or(true))
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// spec §6 "cleanup": runs the retention policy now (spec says retention
    /// normally runs opportunistically on the worker; exposing it here lets
    /// callers force a pass, e.g. in tests).
    pub async fn cleanup(&self) -> Result<usize> {
        let mut index = self.inner.index.lock().await;
        let records: Vec<CheckpointRecord> = index.iter().map(|(_, r)| r.clone()).collect();
        let expired = retention::select_expired(&records, &self.inner.config.retention, self.inner.config.max_auto);
        for id in &expired {
            if let Some(record) = index.get(id).cloned() {
                let mut record = record;
                record.state = CheckpointState::Deleted;
                let _ = index.upsert(*id, record);
            }
            let path = self.snapshot_path(*id);
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(expired.len())
    }

    async fn committed_record(&self, id: CheckpointId) -> Result<CheckpointRecord> {
        let index = self.inner.index.lock().await;
        index
            .get(&id)
            .filter(|r| r.state == CheckpointState::Committed)
            .cloned()
            .ok_or_else(|| CoreError::CheckpointRestoreFailed {
                checkpoint_id: id.to_string(),
                reason: "no committed checkpoint with this id".to_string(),
            })
    }

    async fn load_snapshot(&self, id: CheckpointId) -> Result<Session> {
        let bytes = tokio::fs::read(self.snapshot_path(id))
            .await
            .map_err(|e| CoreError::CheckpointRestoreFailed {
                checkpoint_id: id.to_string(),
                reason: format!("snapshot file unreadable: {e}"),
            })?;
        compress::decode(&bytes, Compression::Zstd { level: 3 }).map_err(|e| CoreError::CheckpointRestoreFailed {
            checkpoint_id: id.to_string(),
            reason: format!("snapshot decode failed: {e}"),
        })
    }
}

/// The background worker: builds flattened snapshots, writes them, updates
/// the index, and runs opportunistic retention (spec §4.4 "Capture
/// protocol" steps 2-3, §5 "fully off the Engine's critical path").
///
/// Named (manual/branch/rollback) requests arrive on the reliable
/// `receiver`; AUTO requests are drained from `inner.auto_queue` instead, so
/// that queue's own eviction policy (oldest-first, on `on_message_appended`)
/// is the only place AUTO requests are ever dropped. `biased` gives named
/// requests priority so a rollback is never held up behind a backlog of
/// AUTO captures.
fn spawn_worker(inner: Arc<Inner>, receiver: async_channel::Receiver<NamedCaptureRequest>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                request = receiver.recv() => {
                    match request {
                        Ok(NamedCaptureRequest { session, kind, name, description, reply }) => {
                            let result = capture(&inner, &session, kind, name, description, false).await;
                            let _ = reply.send(result);
                        }
                        Err(_) => break,
                    }
                }
                _ = inner.auto_notify.notified() => {
                    while let Some(session) = {
                        let mut queue = inner.auto_queue.lock().await;
                        queue.pop_front()
                    } {
                        let result = capture(&inner, &session, CheckpointKind::Auto, None, None, true).await;
                        if let Err(e) = &result {
                            error!(session_id = %session.id, error = %e, "AUTO checkpoint capture failed");
                            let failures = inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            if failures >= 3 {
                                inner.auto_disabled.store(true, Ordering::Relaxed);
                                warn!("auto-checkpointing disabled after 3 consecutive failures");
                            }
                        } else {
                            inner.consecutive_failures.store(0, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    });
}

async fn capture(
    inner: &Arc<Inner>,
    session: &Session,
    kind: CheckpointKind,
    name: Option<String>,
    description: Option<String>,
    auto: bool,
) -> Result<CheckpointId> {
    let boundary = match session.messages.last() {
        Some(message) => message.id.clone(),
        None => return Err(CoreError::CheckpointCaptureFailed {
            session_id: session.id.to_string(),
            reason: "cannot checkpoint an empty session".to_string(),
        }),
    };

    let id = CheckpointId::new();
    let mut record = CheckpointRecord {
        id,
        kind,
        created_at: chrono::Utc::now(),
        session_id: session.id,
        message_id: boundary.clone(),
        name,
        description,
        auto,
        state: CheckpointState::Pending,
    };

    {
        let mut index = inner.index.lock().await;
        index.upsert(id, record.clone()).map_err(|e| CoreError::CheckpointCaptureFailed {
            session_id: session.id.to_string(),
            reason: e.to_string(),
        })?;
    }

    record.state = CheckpointState::Writing;
    {
        let mut index = inner.index.lock().await;
        let _ = index.upsert(id, record.clone());
    }

    let snapshot = inner
        .sessions
        .build_flat_snapshot(session.id, Some(boundary))
        .await
        .map_err(|e| CoreError::CheckpointCaptureFailed {
            session_id: session.id.to_string(),
            reason: e.to_string(),
        })?;

    let bytes = compress::encode(&snapshot, Compression::Zstd { level: 3 }).map_err(|e| CoreError::CheckpointCaptureFailed {
        session_id: session.id.to_string(),
        reason: e.to_string(),
    })?;
    let path = inner.root_dir.join("checkpoints").join(format!("{id}.snapshot.zst"));
    tokio::fs::write(&path, bytes).await.map_err(|e| CoreError::CheckpointCaptureFailed {
        session_id: session.id.to_string(),
        reason: e.to_string(),
    })?;

    record.state = CheckpointState::Committed;
    {
        let mut index = inner.index.lock().await;
        index.upsert(id, record).map_err(|e| CoreError::CheckpointCaptureFailed {
            session_id: session.id.to_string(),
            reason: e.to_string(),
        })?;
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Content, MessageCategory, Role};
    use crate::session::SessionManagerConfig;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, CheckpointManager, SessionManager) {
        let dir = TempDir::new().unwrap();
        let sessions = SessionManager::new(SessionManagerConfig {
            root_dir: dir.path().to_path_buf(),
            session: crate::config::SessionConfig::default(),
        })
        .await
        .unwrap();
        let checkpoints = CheckpointManager::new(CheckpointManagerConfig {
            root_dir: dir.path().to_path_buf(),
            sessions: sessions.clone(),
            config: CheckpointConfig::default(),
        })
        .await
        .unwrap();
        (dir, checkpoints, sessions)
    }

    #[tokio::test]
    async fn manual_checkpoint_is_immediately_committed() {
        let (_dir, checkpoints, sessions) = setup().await;
        let mut session = sessions.create_root(150_000);
        session.push(Message::new(Role::User, MessageCategory::Dialog, Content::text("hi")));
        sessions.save(&session).await.unwrap();

        let id = checkpoints
            .create_manual_checkpoint(&session, Some("first".to_string()), None)
            .await
            .unwrap();
        let listed = checkpoints.list_checkpoints(Some(session.id)).await;
        assert!(listed.iter().any(|r| r.id == id));
    }

    #[tokio::test]
    async fn rollback_restores_session_id() {
        let (_dir, checkpoints, sessions) = setup().await;
        let mut session = sessions.create_root(150_000);
        session.push(Message::new(Role::User, MessageCategory::Dialog, Content::text("hi")));
        sessions.save(&session).await.unwrap();
        let checkpointed = session.clone();
        let id = checkpoints.create_manual_checkpoint(&session, None, None).await.unwrap();

        session.push(Message::new(Role::Assistant, MessageCategory::Dialog, Content::text("more")));
        sessions.save(&session).await.unwrap();

        let restored = checkpoints.rollback_to_checkpoint(id).await.unwrap();
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.messages.len(), 1);
        // The restored session must match the checkpointed state exactly,
        // not just its length, down to per-message metadata and timestamps.
        pretty_assert_eq!(restored.messages, checkpointed.messages);
    }

    #[tokio::test]
    async fn branch_preserves_source_session() {
        let (_dir, checkpoints, sessions) = setup().await;
        let mut session = sessions.create_root(150_000);
        session.push(Message::new(Role::User, MessageCategory::Dialog, Content::text("hi")));
        sessions.save(&session).await.unwrap();
        let id = checkpoints.create_manual_checkpoint(&session, None, None).await.unwrap();

        let branch_id = checkpoints.branch_from_checkpoint(id, Some("try-b".to_string())).await.unwrap();
        assert_ne!(branch_id, session.id);

        let original = sessions.load(session.id).await.unwrap();
        assert_eq!(original.messages.len(), 1);
    }
}
