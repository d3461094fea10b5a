//! Capability interfaces the Engine consumes but never implements
//! concretely (spec §4.5, §9 "Dynamic tool dispatch -> capability
//! interface"). Grounded on `ccswarm::agent::Agent`'s trait-object pattern
//! for pluggable agent backends, generalized from one trait per backend to
//! one trait per concern (gateway, parser, registry, event sink).
//!
//! `testing` supplies deterministic stand-ins used by the integration
//! scenarios in `tests/`.

pub mod testing;

use crate::error::Result;
use crate::message::ContentPart;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A role/content record in the shape an LLM provider expects (spec §4.3
/// "`prepare_turn` ... emits a list of role/content records").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormattedMessage {
    pub role: crate::message::Role,
    pub content: String,
    pub parts: Vec<ContentPart>,
}

pub type FormattedHistory = Vec<FormattedMessage>;

/// Knobs a gateway call may honor; intentionally sparse since the core does
/// not prescribe a provider's full request shape.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub deadline: Option<std::time::Duration>,
}

/// A tool call surfaced either natively by the provider or parsed from text
/// (spec §4.5 "extract tool calls by combining...").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: String,
    pub name: String,
    pub params: ActionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ActionParams {
    Structured(serde_json::Value),
    Raw(String),
}

/// A streamed chunk from `LLMGateway::stream`.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub delta_text: String,
    pub native_tool_calls: Vec<Action>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub content: String,
    pub tool_calls: Vec<Action>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

/// The LLM provider boundary (spec §4.5). Core never implements this
/// concretely; callers inject one.
#[async_trait]
pub trait LLMGateway: Send + Sync {
    async fn complete(&self, history: &FormattedHistory, config: &GatewayConfig) -> Result<GatewayResponse>;

    async fn stream(
        &self,
        history: &FormattedHistory,
        config: &GatewayConfig,
    ) -> Result<BoxStream<'static, Result<Chunk>>>;
}

/// Extracts tag-style or embedded tool invocations from assistant text
/// (spec §4.5 "ActionParser").
pub trait ActionParser: Send + Sync {
    fn parse(&self, assistant_text: &str) -> Vec<Action>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
}

/// The tool execution boundary (spec §4.5 "ToolRegistry").
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn execute(&self, action: &Action) -> Result<ToolOutcome>;
}

/// UI-facing events the Engine emits during a turn (spec §4.5 "EventSink").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TurnStarted { iteration: usize },
    AssistantChunk { delta_text: String },
    ToolCallStarted { action_id: String, name: String },
    ToolCallFinished { action_id: String, ok: bool },
    TurnFinished { iteration: usize, stop_reason: Option<String> },
    Error { message: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// An `EventSink` that drops everything; used where no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Deduplicate actions by id, preserving first-seen order (spec §9
/// "deduplicate before execution"). Native tool calls are listed first so a
/// native call wins identity ties against a parsed duplicate of the same id.
pub fn dedupe_actions(native: Vec<Action>, parsed: Vec<Action>) -> Vec<Action> {
    let mut seen = HashMap::new();
    let mut ordered = Vec::new();
    for action in native.into_iter().chain(parsed.into_iter()) {
        if seen.insert(action.id.clone(), ()).is_none() {
            ordered.push(action);
        }
    }
    ordered
}
