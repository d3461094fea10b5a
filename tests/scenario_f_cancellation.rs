//! End-to-end scenario F: the gateway stream is cancelled mid-turn. The
//! assistant message must finalize with whatever partial content arrived,
//! stamped `metadata.cancelled`, with no further LLM call or tool
//! execution and `stop_reason: Cancelled`.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use penguin_core::capabilities::testing::{FixedToolRegistry, RecordingEventSink, TagActionParser};
use penguin_core::capabilities::{Chunk, FormattedHistory, GatewayConfig, GatewayResponse, LLMGateway};
use penguin_core::checkpoint::{CheckpointManager, CheckpointManagerConfig};
use penguin_core::config::{CategoryRatios, CheckpointConfig, EngineConfig, SessionConfig, TokenCounterStrategy};
use penguin_core::error::{CoreError, Result};
use penguin_core::message::{Content, MessageCategory, Role};
use penguin_core::session::{SessionManager, SessionManagerConfig};
use penguin_core::tokens::{ContextWindow, TokenCounterChain};
use penguin_core::{ConversationManager, Engine, StopCondition, StopReason};
use std::sync::Arc;
use tempfile::TempDir;

/// Streams a couple of chunks, then a cancellation error, then never
/// returns a second turn — asserting the Engine never re-calls it.
struct CancellingGateway;

#[async_trait]
impl LLMGateway for CancellingGateway {
    async fn complete(&self, _history: &FormattedHistory, _config: &GatewayConfig) -> Result<GatewayResponse> {
        unimplemented!("scenario only drives the streaming path")
    }

    async fn stream(&self, _history: &FormattedHistory, _config: &GatewayConfig) -> Result<BoxStream<'static, Result<Chunk>>> {
        let items: Vec<Result<Chunk>> = vec![
            Ok(Chunk {
                delta_text: "Working on".to_string(),
                ..Default::default()
            }),
            Ok(Chunk {
                delta_text: " it".to_string(),
                ..Default::default()
            }),
            Err(CoreError::Cancelled),
        ];
        Ok(stream::iter(items).boxed())
    }
}

#[tokio::test]
async fn cancellation_finalizes_partial_message_and_stops_the_turn() {
    let dir = TempDir::new().unwrap();
    let sessions = SessionManager::new(SessionManagerConfig {
        root_dir: dir.path().to_path_buf(),
        session: SessionConfig::default(),
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
    let mut conversation = ConversationManager::new(sessions, context_window, checkpoints).await;
    conversation
        .add_message(Role::System, Content::text("You are helpful."), MessageCategory::System, None)
        .await
        .unwrap();

    let engine = Engine::new(
        Arc::new(CancellingGateway),
        Arc::new(TagActionParser::default()),
        Arc::new(FixedToolRegistry::always_ok("")),
        Arc::new(RecordingEventSink::default()),
        EngineConfig::default(),
    );

    let summary = engine
        .run_task(
            &mut conversation,
            "start a long task",
            5,
            &[StopCondition::NoActions, StopCondition::IterationCap(5)],
        )
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.tool_invocations, 0);

    let history = conversation.get_history();
    let assistant_message = history
        .iter()
        .find(|m| m.role == Role::Assistant)
        .expect("partial assistant message must still be recorded");
    assert_eq!(assistant_message.content.to_flat_text(), "Working on it");
    assert_eq!(assistant_message.metadata.get("cancelled").and_then(|v| v.as_bool()), Some(true));

    // No tool-result message was appended: a cancelled turn skips pending
    // tool calls entirely.
    assert!(!history.iter().any(|m| m.category == MessageCategory::SystemOutput));
}
