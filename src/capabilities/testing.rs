//! Deterministic capability stand-ins used by the end-to-end scenario
//! tests under `tests/` (spec §8 "End-to-end scenarios"). Grounded on
//! `ccswarm::providers`'s pattern of one struct per backend implementing a
//! shared trait, here scripted rather than live.

use super::{
    Action, ActionParser, Chunk, EventSink, FormattedHistory, GatewayConfig, GatewayResponse,
    LLMGateway, ToolOutcome, ToolRegistry,
};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Mutex;

/// A gateway that replays a fixed sequence of turns, one per call to
/// `complete`/`stream`. Each turn is a list of chunks; `stream` yields them
/// one at a time, `complete` joins them into a single response.
pub struct ScriptedGateway {
    turns: Mutex<Vec<Vec<Chunk>>>,
}

impl ScriptedGateway {
    pub fn new(turns: Vec<Vec<Chunk>>) -> Self {
        Self {
            turns: Mutex::new(turns),
        }
    }

    /// Convenience constructor for a turn made of plain text chunks with no
    /// native tool calls (spec §8 scenario A).
    pub fn text_turns(turns: Vec<Vec<&str>>) -> Self {
        let turns = turns
            .into_iter()
            .map(|chunks| {
                chunks
                    .into_iter()
                    .map(|text| Chunk {
                        delta_text: text.to_string(),
                        ..Default::default()
                    })
                    .collect()
            })
            .collect();
        Self::new(turns)
    }

    fn next_turn(&self) -> Result<Vec<Chunk>> {
        let mut turns = self.turns.lock().expect("scripted gateway mutex poisoned");
        if turns.is_empty() {
            return Err(CoreError::GatewayUnavailable {
                attempts: 1,
                reason: "scripted gateway has no remaining turns".to_string(),
            });
        }
        Ok(turns.remove(0))
    }
}

#[async_trait]
impl LLMGateway for ScriptedGateway {
    async fn complete(&self, _history: &FormattedHistory, _config: &GatewayConfig) -> Result<GatewayResponse> {
        let chunks = self.next_turn()?;
        let content = chunks.iter().map(|c| c.delta_text.clone()).collect::<String>();
        let tool_calls = chunks.iter().flat_map(|c| c.native_tool_calls.clone()).collect();
        Ok(GatewayResponse {
            content,
            tool_calls,
            usage: chunks.last().and_then(|c| c.usage),
            finish_reason: chunks.last().and_then(|c| c.finish_reason.clone()),
        })
    }

    async fn stream(
        &self,
        _history: &FormattedHistory,
        _config: &GatewayConfig,
    ) -> Result<BoxStream<'static, Result<Chunk>>> {
        let chunks = self.next_turn()?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// Recognizes a single embedded tag shape: `<action name="..." id="...">{json params}</action>`.
/// Minimal by design — real tag grammars belong to a concrete adapter, out
/// of scope here (spec §9 "Action parsing").
pub struct TagActionParser {
    pattern: regex::Regex,
}

impl Default for TagActionParser {
    fn default() -> Self {
        Self {
            pattern: regex::Regex::new(
                r#"<action\s+name="(?P<name>[^"]+)"\s+id="(?P<id>[^"]+)">(?P<params>.*?)</action>"#,
            )
            .expect("static pattern compiles"),
        }
    }
}

impl ActionParser for TagActionParser {
    fn parse(&self, assistant_text: &str) -> Vec<Action> {
        self.pattern
            .captures_iter(assistant_text)
            .map(|c| {
                let raw = c["params"].trim();
                let params = serde_json::from_str(raw)
                    .map(super::ActionParams::Structured)
                    .unwrap_or_else(|_| super::ActionParams::Raw(raw.to_string()));
                Action {
                    id: c["id"].to_string(),
                    name: c["name"].to_string(),
                    params,
                }
            })
            .collect()
    }
}

/// Always reports the fixed outcome it was built with; useful for driving
/// the Engine loop without a real tool sandbox.
pub struct FixedToolRegistry {
    outcome: ToolOutcome,
}

impl FixedToolRegistry {
    pub fn always_ok(output: impl Into<String>) -> Self {
        Self {
            outcome: ToolOutcome {
                ok: true,
                output: output.into(),
                error: None,
            },
        }
    }

    pub fn always_failing(error: impl Into<String>) -> Self {
        Self {
            outcome: ToolOutcome {
                ok: false,
                output: String::new(),
                error: Some(error.into()),
            },
        }
    }
}

#[async_trait]
impl ToolRegistry for FixedToolRegistry {
    async fn execute(&self, _action: &Action) -> Result<ToolOutcome> {
        Ok(self.outcome.clone())
    }
}

/// Collects every emitted event for assertions, in emission order.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<super::EngineEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<super::EngineEvent> {
        self.events.lock().expect("recording sink mutex poisoned").clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: super::EngineEvent) {
        self.events.lock().expect("recording sink mutex poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_gateway_replays_turns_in_order() {
        let gateway = ScriptedGateway::text_turns(vec![vec!["Hi", "!"], vec!["Bye"]]);
        let history = FormattedHistory::new();
        let config = GatewayConfig::default();

        let first = gateway.complete(&history, &config).await.unwrap();
        assert_eq!(first.content, "Hi!");
        let second = gateway.complete(&history, &config).await.unwrap();
        assert_eq!(second.content, "Bye");
        assert!(gateway.complete(&history, &config).await.is_err());
    }

    #[test]
    fn tag_parser_extracts_id_and_structured_params() {
        let parser = TagActionParser::default();
        let text = r#"before <action name="list_files" id="a1">{"path":"."}</action> after"#;
        let actions = parser.parse(text);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id, "a1");
        assert_eq!(actions[0].name, "list_files");
    }
}
