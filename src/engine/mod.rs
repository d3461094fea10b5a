//! Reasoning Engine (spec §4.5, component C5): runs the act/observe loop
//! against an `LLMGateway`, interleaving tool calls via `ActionParser` and
//! `ToolRegistry`, honoring stop conditions, and reporting a `TurnSummary`.
//! Grounded on `ccswarm::agent::Agent::execute_task`'s iterate-until-done
//! shape (act, observe, check completion), generalized from a single
//! provider call to the full streaming/tool/stop-condition loop spec §4.5
//! describes.

pub mod stop_conditions;

use crate::capabilities::{
    dedupe_actions, Action, ActionParser, EngineEvent, EventSink, GatewayConfig, LLMGateway, ToolOutcome,
    ToolRegistry,
};
use crate::config::EngineConfig;
use crate::conversation::ConversationManager;
use crate::error::{CoreError, Result};
use crate::message::{Content, MessageCategory, Role};
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
pub use stop_conditions::{StopCondition, StopReason};
use tracing::{info, warn};

/// Result of running one or more turns (spec §4.5 "Outputs").
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSummary {
    pub iterations: usize,
    pub tool_invocations: usize,
    pub tokens_prompt: usize,
    pub tokens_completion: usize,
    pub stop_reason: StopReason,
    pub final_text: String,
}

/// Executes the act/observe loop. Holds no mutable conversational state of
/// its own — that lives in the injected `ConversationManager` (spec §9
/// "Global mutable state -> owned state").
pub struct Engine {
    gateway: Arc<dyn LLMGateway>,
    parser: Arc<dyn ActionParser>,
    tools: Arc<dyn ToolRegistry>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        gateway: Arc<dyn LLMGateway>,
        parser: Arc<dyn ActionParser>,
        tools: Arc<dyn ToolRegistry>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            gateway,
            parser,
            tools,
            events,
            config,
        }
    }

    /// spec §4.5 `run_single_turn`: exactly one iteration, no stop-condition
    /// loop beyond it.
    pub async fn run_single_turn(
        &self,
        conversation: &mut ConversationManager,
        prompt: &str,
        conditions: &[StopCondition],
    ) -> Result<TurnSummary> {
        self.run_task(conversation, prompt, 1, conditions).await
    }

    /// spec §4.5 `run_task`: injects `prompt` as a user message, then runs
    /// iterations until a stop condition fires.
    pub async fn run_task(
        &self,
        conversation: &mut ConversationManager,
        prompt: &str,
        max_iterations: usize,
        conditions: &[StopCondition],
    ) -> Result<TurnSummary> {
        conversation.prepare_turn(prompt, Vec::new()).await?;

        let started_at = Instant::now();
        let mut tokens_prompt = 0usize;
        let mut tokens_completion = 0usize;
        let mut tool_invocations = 0usize;
        let mut final_text = String::new();
        let iteration_cap = max_iterations.min(self.config.max_iterations);

        for iteration in 1..=iteration_cap {
            self.events.emit(EngineEvent::TurnStarted { iteration });

            let turn_result = self
                .run_single_iteration(conversation, iteration)
                .await;

            let iteration_outcome = match turn_result {
                Ok(outcome) => outcome,
                Err(CoreError::Cancelled) => {
                    return Ok(TurnSummary {
                        iterations: iteration,
                        tool_invocations,
                        tokens_prompt,
                        tokens_completion,
                        stop_reason: StopReason::Cancelled,
                        final_text,
                    });
                }
                Err(e) => return Err(e),
            };

            tokens_prompt += iteration_outcome.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
            tokens_completion += iteration_outcome.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0);
            tool_invocations += iteration_outcome.tool_calls_executed;
            final_text = iteration_outcome.assistant_text.clone();

            let context = stop_conditions::EvalContext {
                iteration,
                assistant_text: &iteration_outcome.assistant_text,
                had_tool_calls: iteration_outcome.tool_calls_executed > 0,
                cumulative_tokens: tokens_prompt + tokens_completion,
                elapsed: started_at.elapsed(),
            };

            if let Some(reason) = stop_conditions::evaluate(conditions, &context) {
                self.events.emit(EngineEvent::TurnFinished {
                    iteration,
                    stop_reason: Some(format!("{reason:?}")),
                });
                return Ok(TurnSummary {
                    iterations: iteration,
                    tool_invocations,
                    tokens_prompt,
                    tokens_completion,
                    stop_reason: reason,
                    final_text,
                });
            }
            self.events.emit(EngineEvent::TurnFinished { iteration, stop_reason: None });
        }

        Ok(TurnSummary {
            iterations: iteration_cap,
            tool_invocations,
            tokens_prompt,
            tokens_completion,
            stop_reason: StopReason::IterationCap,
            final_text,
        })
    }

    async fn run_single_iteration(&self, conversation: &mut ConversationManager, iteration: usize) -> Result<IterationOutcome> {
        let formatted = conversation_formatted_history(conversation);
        let gateway_config = GatewayConfig::default();

        let mut native_tool_calls = Vec::new();
        let mut usage = None;
        let mut cancelled = false;
        let mut last_error = None;
        let mut finalized = None;

        'attempts: for attempt in 0..self.config.retry.max_attempts {
            if attempt > 0 {
                self.backoff_sleep(attempt).await;
                info!(iteration, attempt, "retrying gateway call after backoff");
            }

            // Each attempt is its own streaming message: spec §4.5's
            // "finalize the assistant message with whatever content was
            // received" on an aborted attempt means the partial record is
            // kept, not reused, by the next attempt.
            conversation.add_assistant_streaming();

            let mut stream = match self.gateway.stream(&formatted, &gateway_config).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(iteration, attempt, error = %e, "gateway stream failed to open");
                    conversation.abandon_streaming_with_error(&e.to_string()).await?;
                    last_error = Some(e);
                    continue 'attempts;
                }
            };

            native_tool_calls.clear();
            usage = None;
            let mut aborted = false;

            while let Some(chunk_result) = stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        conversation.append_streaming_chunk(&chunk.delta_text)?;
                        self.events.emit(EngineEvent::AssistantChunk { delta_text: chunk.delta_text.clone() });
                        native_tool_calls.extend(chunk.native_tool_calls);
                        if chunk.usage.is_some() {
                            usage = chunk.usage;
                        }
                    }
                    Err(CoreError::Cancelled) => {
                        cancelled = true;
                        break;
                    }
                    Err(e) => {
                        warn!(iteration, attempt, error = %e, "gateway stream aborted mid-chunk");
                        conversation.abandon_streaming_with_error(&e.to_string()).await?;
                        last_error = Some(e);
                        aborted = true;
                        break;
                    }
                }
            }

            if aborted {
                continue 'attempts;
            }
            last_error = None;
            finalized = Some(conversation.finalize_streaming(cancelled).await?);
            break 'attempts;
        }

        if let Some(e) = last_error {
            return Err(CoreError::GatewayUnavailable {
                attempts: self.config.retry.max_attempts,
                reason: e.to_string(),
            });
        }
        let finalized = finalized.expect("loop only exits via break after setting finalized, or via the error return above");

        if cancelled {
            return Err(CoreError::Cancelled);
        }

        let assistant_text = finalized.content.to_flat_text();
        let parsed = self.parser.parse(&assistant_text);
        let actions = dedupe_actions(native_tool_calls, parsed);

        let mut tool_calls_executed = 0usize;
        for action in &actions {
            self.events.emit(EngineEvent::ToolCallStarted {
                action_id: action.id.clone(),
                name: action.name.clone(),
            });
            let outcome = self.execute_tool(action).await;
            let ok = outcome.as_ref().map(|o| o.ok).unwrap_or(false);
            let result = outcome.unwrap_or_else(|e| ToolOutcome {
                ok: false,
                output: String::new(),
                error: Some(e.to_string()),
            });
            conversation
                .add_tool_result(&action.id, finalized.id.clone(), &result)
                .await?;
            self.events.emit(EngineEvent::ToolCallFinished { action_id: action.id.clone(), ok });
            tool_calls_executed += 1;
        }

        Ok(IterationOutcome {
            assistant_text,
            tool_calls_executed,
            usage,
        })
    }

    async fn execute_tool(&self, action: &Action) -> Result<ToolOutcome> {
        match self.tools.execute(action).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "tool execution returned an error, recording as a failed outcome");
                Ok(ToolOutcome {
                    ok: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                })
            }
        }
    }

    /// spec §4.5 "Failure handling": exponential backoff with jitter
    /// between gateway retry attempts.
    async fn backoff_sleep(&self, attempt: u32) {
        let backoff = Duration::from_millis(self.config.retry.base_backoff_millis * 2u64.pow(attempt - 1));
        let jitter_millis = rand::rng().random_range(0..=(backoff.as_millis() as u64 / 4).max(1));
        tokio::time::sleep(backoff + Duration::from_millis(jitter_millis)).await;
    }
}

struct IterationOutcome {
    assistant_text: String,
    tool_calls_executed: usize,
    usage: Option<crate::capabilities::Usage>,
}

fn conversation_formatted_history(conversation: &ConversationManager) -> crate::capabilities::FormattedHistory {
    conversation
        .get_history()
        .iter()
        .map(|m| crate::capabilities::FormattedMessage {
            role: m.role,
            content: m.content.to_flat_text(),
            parts: match &m.content {
                Content::Parts(parts) => parts.clone(),
                Content::Text(_) => Vec::new(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{FixedToolRegistry, RecordingEventSink, ScriptedGateway, TagActionParser};
    use crate::checkpoint::{CheckpointManager, CheckpointManagerConfig};
    use crate::config::{CategoryRatios, CheckpointConfig, SessionConfig, TokenCounterStrategy};
    use crate::session::{SessionManager, SessionManagerConfig};
    use crate::tokens::{ContextWindow, TokenCounterChain};
    use tempfile::TempDir;

    async fn conversation(dir: &TempDir) -> ConversationManager {
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
        ConversationManager::new(sessions, context_window, checkpoints).await
    }

    #[tokio::test]
    async fn scenario_a_basic_turn_without_tools() {
        let dir = TempDir::new().unwrap();
        let mut conversation = conversation(&dir).await;
        conversation
            .add_message(Role::System, Content::text("You are helpful."), MessageCategory::System, None)
            .await
            .unwrap();

        let gateway = Arc::new(ScriptedGateway::text_turns(vec![vec!["Hi", "!"]]));
        let engine = Engine::new(
            gateway,
            Arc::new(TagActionParser::default()),
            Arc::new(FixedToolRegistry::always_ok("")),
            Arc::new(RecordingEventSink::default()),
            EngineConfig::default(),
        );

        let summary = engine
            .run_task(&mut conversation, "Say hi.", 5, &[StopCondition::NoActions, StopCondition::IterationCap(5)])
            .await
            .unwrap();

        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.tool_invocations, 0);
        assert_eq!(summary.stop_reason, StopReason::NoActions);
        assert_eq!(conversation.get_history().len(), 3);
        assert_eq!(conversation.get_history()[2].content.to_flat_text(), "Hi!");
    }

    #[tokio::test]
    async fn scenario_b_tool_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut conversation = conversation(&dir).await;

        let gateway = Arc::new(ScriptedGateway::text_turns(vec![
            vec![r#"<action name="list_files" id="call-1">{"path":"."}</action>"#],
            vec!["Here are the files: a.txt, b.txt. TASK_COMPLETED"],
        ]));
        let engine = Engine::new(
            gateway,
            Arc::new(TagActionParser::default()),
            Arc::new(FixedToolRegistry::always_ok("a.txt\nb.txt")),
            Arc::new(RecordingEventSink::default()),
            EngineConfig::default(),
        );

        let summary = engine
            .run_task(
                &mut conversation,
                "list files",
                5,
                &[StopCondition::CompletionPhrase(vec!["TASK_COMPLETED".to_string()]), StopCondition::IterationCap(5)],
            )
            .await
            .unwrap();

        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.stop_reason, StopReason::CompletionPhrase);
        // user, assistant_1, SYSTEM_OUTPUT(tool), assistant_2
        assert_eq!(conversation.get_history().len(), 4);
        assert_eq!(conversation.get_history()[2].category, MessageCategory::SystemOutput);
    }
}
