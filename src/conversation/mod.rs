//! Conversation Manager (spec §4.3, component C3): the single façade the
//! Engine uses for all message operations. Grounded on `ccswarm::agent`'s
//! facade pattern over task execution (one struct owning the mutable
//! pointer, collaborators injected by reference), adapted from task
//! dispatch to message/session bookkeeping.

use crate::capabilities::{FormattedHistory, FormattedMessage};
use crate::checkpoint::CheckpointManager;
use crate::error::{CoreError, Result};
use crate::message::{Content, ContentPart, Message, MessageCategory, MessageId, Role};
use crate::session::{Session, SessionId, SessionManager};
use crate::tokens::ContextWindow;
use tracing::{debug, info};

/// State of a live assistant message being streamed into (spec §9
/// "Streaming as state machine", `OPEN -> APPENDING -> FINALIZED`).
struct StreamingHandle {
    message_id: MessageId,
}

/// The façade the Engine and tests drive (spec §4.3). Depends only on the
/// capability-shaped collaborators named in the spec: `SessionManager`,
/// `ContextWindow`, and `CheckpointManager`; the token counter lives inside
/// `ContextWindow`.
pub struct ConversationManager {
    sessions: SessionManager,
    context_window: ContextWindow,
    checkpoints: CheckpointManager,
    active: Session,
    streaming: Option<StreamingHandle>,
    /// Set for sub-agents; used only to stamp `cw_clamp_notice` metadata.
    parent: Option<SubAgentLink>,
}

struct SubAgentLink {
    parent_session_id: SessionId,
    parent_max_tokens: usize,
}

impl ConversationManager {
    pub async fn new(
        sessions: SessionManager,
        context_window: ContextWindow,
        checkpoints: CheckpointManager,
    ) -> Self {
        let active = sessions.create_root(context_window.total_tokens);
        Self {
            sessions,
            context_window,
            checkpoints,
            active,
            streaming: None,
            parent: None,
        }
    }

    /// Spec §4.1 "Sub-agent clamping": effective W = min(parent.W, hint); a
    /// `cw_clamp_notice` SYSTEM message is appended to both sides.
    pub async fn new_sub_agent(
        sessions: SessionManager,
        mut context_window: ContextWindow,
        checkpoints: CheckpointManager,
        parent_session_id: SessionId,
        parent_max_tokens: usize,
        shared_context_window_max_tokens: usize,
    ) -> Self {
        let clamped = shared_context_window_max_tokens.min(parent_max_tokens);
        let was_clamped = clamped < shared_context_window_max_tokens;
        context_window.total_tokens = clamped;

        let mut manager = Self::new(sessions, context_window, checkpoints).await;
        manager.parent = Some(SubAgentLink {
            parent_session_id,
            parent_max_tokens,
        });
        manager.active.metadata.cw_max_tokens = clamped;

        let notice = Message::new(Role::System, MessageCategory::System, Content::text("context window clamped for sub-agent"))
            .with_metadata("type", serde_json::json!("cw_clamp_notice"))
            .with_metadata("sub_agent", serde_json::json!(manager.active.id.to_string()))
            .with_metadata("child_max", serde_json::json!(clamped))
            .with_metadata("parent_max", serde_json::json!(parent_max_tokens))
            .with_metadata("clamped", serde_json::json!(was_clamped));
        manager.active.push(notice);
        manager
    }

    pub fn active_session_id(&self) -> SessionId {
        self.active.id
    }

    pub fn get_history(&self) -> &[Message] {
        &self.active.messages
    }

    /// spec §4.3 `add_message`.
    pub async fn add_message(
        &mut self,
        role: Role,
        content: Content,
        category: MessageCategory,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        let mut message = Message::new(role, category, content);
        if let Some(serde_json::Value::Object(map)) = metadata {
            for (k, v) in map {
                message.metadata.insert(k, v);
            }
        }
        message.tokens = Some(self.context_window.counter().count_content(&message.content));

        self.active.push(message.clone());
        self.reconcile_window().await?;
        self.maybe_rollover().await?;
        self.checkpoints.on_message_appended(&self.active).await;
        Ok(message)
    }

    /// spec §4.3 `add_context`.
    pub async fn add_context(&mut self, content: Content, _source: Option<String>) -> Result<Message> {
        self.add_message(Role::User, content, MessageCategory::Context, None).await
    }

    /// spec §4.3 `add_tool_result`.
    pub async fn add_tool_result(
        &mut self,
        tool_id: &str,
        invoking_message_id: MessageId,
        result: &crate::capabilities::ToolOutcome,
    ) -> Result<Message> {
        let metadata = serde_json::json!({
            "tool_id": tool_id,
            "invoking_message_id": invoking_message_id.to_string(),
            "error": !result.ok,
        });
        let text = if result.ok {
            result.output.clone()
        } else {
            result.error.clone().unwrap_or_default()
        };
        self.add_message(Role::Tool, Content::text(text), MessageCategory::SystemOutput, Some(metadata))
            .await
    }

    /// spec §4.3 `prepare_turn`.
    pub async fn prepare_turn(&mut self, user_input: &str, attachments: Vec<ContentPart>) -> Result<FormattedHistory> {
        let content = if attachments.is_empty() {
            Content::text(user_input)
        } else {
            let mut parts = vec![ContentPart::text(user_input)];
            parts.extend(attachments);
            Content::Parts(parts)
        };
        self.add_message(Role::User, content, MessageCategory::Dialog, None).await?;
        self.reconcile_window().await?;
        Ok(self.formatted_history())
    }

    fn formatted_history(&self) -> FormattedHistory {
        self.active
            .messages
            .iter()
            .map(|m| FormattedMessage {
                role: m.role,
                content: m.content.to_flat_text(),
                parts: match &m.content {
                    Content::Parts(parts) => parts.clone(),
                    Content::Text(_) => Vec::new(),
                },
            })
            .collect()
    }

    /// spec §4.3 `add_assistant_streaming`: opens (or resumes) a live
    /// assistant message.
    pub fn add_assistant_streaming(&mut self) -> MessageId {
        if let Some(handle) = &self.streaming {
            return handle.message_id;
        }
        let message = Message::new(Role::Assistant, MessageCategory::Dialog, Content::text(""));
        let id = message.id.clone();
        self.active.push(message);
        self.streaming = Some(StreamingHandle { message_id: id.clone() });
        id
    }

    pub fn append_streaming_chunk(&mut self, chunk: &str) -> Result<()> {
        let handle = self
            .streaming
            .as_ref()
            .ok_or_else(|| CoreError::InvariantViolation("append_streaming_chunk with no open stream".into()))?;
        let message = self
            .active
            .messages
            .iter_mut()
            .find(|m| m.id == handle.message_id)
            .ok_or_else(|| CoreError::InvariantViolation(format!("streaming message {} missing from active session", handle.message_id)))?;
        message.content.append_text(chunk);
        message.invalidate_tokens();
        Ok(())
    }

    /// spec §4.3 `finalize_streaming`: recomputes tokens, freezes the record.
    pub async fn finalize_streaming(&mut self, cancelled: bool) -> Result<Message> {
        let handle = self
            .streaming
            .take()
            .ok_or_else(|| CoreError::InvariantViolation("finalize_streaming with no open stream".into()))?;
        let message = self
            .active
            .messages
            .iter_mut()
            .find(|m| m.id == handle.message_id)
            .ok_or_else(|| CoreError::InvariantViolation(format!("streaming message {} missing from active session", handle.message_id)))?;
        message.tokens = Some(self.context_window.counter().count_content(&message.content));
        if cancelled {
            message.metadata.insert("cancelled".to_string(), serde_json::json!(true));
        }
        let finalized = message.clone();
        self.reconcile_window().await?;
        Ok(finalized)
    }

    /// Finalizes a streaming message that a gateway retry attempt is
    /// abandoning (spec §4.5 "finalize the assistant message with whatever
    /// content was received, record the error in metadata"), distinct from
    /// `finalize_streaming`'s cancellation path.
    pub async fn abandon_streaming_with_error(&mut self, reason: &str) -> Result<Message> {
        let handle = self
            .streaming
            .take()
            .ok_or_else(|| CoreError::InvariantViolation("abandon_streaming_with_error with no open stream".into()))?;
        let message = self
            .active
            .messages
            .iter_mut()
            .find(|m| m.id == handle.message_id)
            .ok_or_else(|| CoreError::InvariantViolation(format!("streaming message {} missing from active session", handle.message_id)))?;
        message.tokens = Some(self.context_window.counter().count_content(&message.content));
        message.metadata.insert("gateway_error".to_string(), serde_json::json!(reason));
        let finalized = message.clone();
        self.reconcile_window().await?;
        Ok(finalized)
    }

    async fn reconcile_window(&mut self) -> Result<()> {
        let outcome = self.context_window.enforce(&self.active.messages)?;
        if outcome.changed {
            debug!(session_id = %self.active.id, usage = %outcome.usage.summary(), "context window reconciled");
            self.active = self.active.with_messages(outcome.messages);
        }
        Ok(())
    }

    async fn maybe_rollover(&mut self) -> Result<()> {
        if !self.sessions.should_rollover(&self.active) {
            return Ok(());
        }
        let current = std::mem::replace(&mut self.active, Session::new_root(self.context_window.total_tokens));
        let (_old, new_session) = self.sessions.rollover(current).await?;
        info!(new_session_id = %new_session.id, "session rolled over");
        self.active = new_session;
        Ok(())
    }

    /// spec §4.3 `reset`: closes the active session and starts a fresh one.
    pub async fn reset(&mut self) -> Result<()> {
        self.save().await?;
        self.active = Session::new_root(self.context_window.total_tokens);
        Ok(())
    }

    /// spec §4.3 `load`.
    pub async fn load(&mut self, session_id: SessionId) -> Result<()> {
        let session = self.sessions.load(session_id).await?;
        if session.metadata.recovery_notice.is_some() && session.id != session_id {
            return Err(CoreError::NotFound(session_id.to_string()));
        }
        self.active = session;
        Ok(())
    }

    /// spec §4.3 `save`: forces a synchronous persist.
    pub async fn save(&self) -> Result<()> {
        self.sessions.save(&self.active).await
    }

    /// Used by the checkpoint manager's rollback/branch protocols to
    /// replace the active session wholesale without re-deriving it from a
    /// `Message` event (spec §4.4 "Restore protocol").
    pub fn replace_active_session(&mut self, session: Session) {
        self.active = session;
        self.streaming = None;
    }

    pub fn active_session(&self) -> &Session {
        &self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::FixedToolRegistry;
    use crate::capabilities::ToolRegistry;
    use crate::checkpoint::{CheckpointManager, CheckpointManagerConfig};
    use crate::config::{CategoryRatios, CheckpointConfig, SessionConfig, TokenCounterStrategy};
    use crate::session::SessionManagerConfig;
    use crate::tokens::TokenCounterChain;
    use tempfile::TempDir;

    async fn manager(max_messages: usize) -> (TempDir, ConversationManager) {
        let dir = TempDir::new().unwrap();
        let sessions = SessionManager::new(SessionManagerConfig {
            root_dir: dir.path().to_path_buf(),
            session: SessionConfig {
                max_messages_per_session: max_messages,
                ..SessionConfig::default()
            },
        })
        .await
        .unwrap();
        let context_window = ContextWindow::new(
            150_000,
            CategoryRatios::default(),
            TokenCounterChain::from_preference(&[TokenCounterStrategy::CharRate]),
        );
        let checkpoints = CheckpointManager::new(CheckpointManagerConfig {
            root_dir: dir.path().to_path_buf(),
            sessions: sessions.clone(),
            config: CheckpointConfig::default(),
        })
        .await
        .unwrap();
        let manager = ConversationManager::new(sessions, context_window, checkpoints).await;
        (dir, manager)
    }

    #[tokio::test]
    async fn add_message_is_immediately_visible_in_history() {
        let (_dir, mut cm) = manager(100).await;
        cm.add_message(Role::System, Content::text("sys"), MessageCategory::System, None)
            .await
            .unwrap();
        assert_eq!(cm.get_history().len(), 1);
    }

    #[tokio::test]
    async fn streaming_message_appears_once_and_accumulates() {
        let (_dir, mut cm) = manager(100).await;
        cm.add_assistant_streaming();
        cm.append_streaming_chunk("Hi").unwrap();
        cm.append_streaming_chunk("!").unwrap();
        let finalized = cm.finalize_streaming(false).await.unwrap();
        assert_eq!(finalized.content.to_flat_text(), "Hi!");
        assert_eq!(
            cm.get_history().iter().filter(|m| m.id == finalized.id).count(),
            1
        );
    }

    #[tokio::test]
    async fn exactly_max_messages_does_not_trigger_rollover() {
        let (_dir, mut cm) = manager(2).await;
        let original_id = cm.active_session_id();
        cm.add_message(Role::User, Content::text("1"), MessageCategory::Dialog, None)
            .await
            .unwrap();
        cm.add_message(Role::User, Content::text("2"), MessageCategory::Dialog, None)
            .await
            .unwrap();
        assert_eq!(cm.active_session_id(), original_id);
        assert_eq!(cm.active_session().messages.len(), 2);
    }

    #[tokio::test]
    async fn one_more_than_max_messages_triggers_rollover() {
        let (_dir, mut cm) = manager(2).await;
        let original_id = cm.active_session_id();
        for text in ["1", "2", "3"] {
            cm.add_message(Role::User, Content::text(text), MessageCategory::Dialog, None)
                .await
                .unwrap();
        }
        assert_ne!(cm.active_session_id(), original_id);
        assert_eq!(cm.active_session().metadata.continued_from, Some(original_id));
    }

    #[tokio::test]
    async fn streaming_message_with_zero_chunks_finalizes_empty() {
        let (_dir, mut cm) = manager(100).await;
        cm.add_assistant_streaming();
        let finalized = cm.finalize_streaming(false).await.unwrap();
        assert_eq!(finalized.content.to_flat_text(), "");
        assert_eq!(finalized.tokens, Some(0));
        assert_eq!(finalized.category, MessageCategory::Dialog);
    }

    #[tokio::test]
    async fn add_tool_result_carries_tool_id_and_invoking_message() {
        let (_dir, mut cm) = manager(100).await;
        let assistant = cm
            .add_message(Role::Assistant, Content::text("calling a tool"), MessageCategory::Dialog, None)
            .await
            .unwrap();
        let registry = FixedToolRegistry::always_ok("a.txt\nb.txt");
        let outcome = registry
            .execute(&crate::capabilities::Action {
                id: "call-1".into(),
                name: "list_files".into(),
                params: crate::capabilities::ActionParams::Raw(String::new()),
            })
            .await
            .unwrap();
        let result_message = cm.add_tool_result("call-1", assistant.id, &outcome).await.unwrap();
        assert_eq!(result_message.category, MessageCategory::SystemOutput);
        assert_eq!(
            result_message.metadata.get("tool_id").and_then(|v| v.as_str()),
            Some("call-1")
        );
    }
}
