//! Stop conditions for the reasoning loop (spec §4.5 "Stop conditions").
//! A tagged variant rather than a trait object hierarchy, per spec §9
//! "Exception-driven control flow -> result/outcome values": evaluation is
//! a pure function over an `EvalContext`, no callback registration needed.

use std::time::Duration;

/// Registered stop conditions; any may fire first (spec §4.5).
#[derive(Debug, Clone)]
pub enum StopCondition {
    CompletionPhrase(Vec<String>),
    IterationCap(usize),
    TokenBudget(usize),
    WallClock(Duration),
    ExternalSignal(tokio_util::sync::CancellationToken),
    NoActions,
}

/// The fired reason, recorded verbatim in `TurnSummary` (spec §4.5
/// "its identity is recorded in the TurnSummary").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    CompletionPhrase,
    IterationCap,
    TokenBudget,
    WallClock,
    ExternalSignal,
    NoActions,
    Cancelled,
}

pub struct EvalContext<'a> {
    pub iteration: usize,
    pub assistant_text: &'a str,
    pub had_tool_calls: bool,
    pub cumulative_tokens: usize,
    pub elapsed: Duration,
}

/// Evaluate all registered conditions in registration order; the first to
/// fire wins (spec §4.5 "the first one to fire wins").
pub fn evaluate(conditions: &[StopCondition], ctx: &EvalContext<'_>) -> Option<StopReason> {
    for condition in conditions {
        let fired = match condition {
            StopCondition::CompletionPhrase(phrases) => phrases.iter().any(|p| ctx.assistant_text.contains(p.as_str())),
            StopCondition::IterationCap(max) => ctx.iteration >= *max,
            StopCondition::TokenBudget(cap) => ctx.cumulative_tokens > *cap,
            StopCondition::WallClock(duration) => ctx.elapsed > *duration,
            StopCondition::ExternalSignal(token) => token.is_cancelled(),
            // Spec §8 scenario A fires NoActions even with non-empty
            // assistant text as long as no tool call was produced this
            // iteration.
            StopCondition::NoActions => !ctx.had_tool_calls,
        };
        if fired {
            return Some(match condition {
                StopCondition::CompletionPhrase(_) => StopReason::CompletionPhrase,
                StopCondition::IterationCap(_) => StopReason::IterationCap,
                StopCondition::TokenBudget(_) => StopReason::TokenBudget,
                StopCondition::WallClock(_) => StopReason::WallClock,
                StopCondition::ExternalSignal(_) => StopReason::ExternalSignal,
                StopCondition::NoActions => StopReason::NoActions,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(had_tool_calls: bool) -> EvalContext<'static> {
        EvalContext {
            iteration: 1,
            assistant_text: "Hi!",
            had_tool_calls,
            cumulative_tokens: 0,
            elapsed: Duration::from_secs(0),
        }
    }

    #[test]
    fn no_actions_fires_when_no_tool_calls() {
        let conditions = vec![StopCondition::NoActions];
        assert_eq!(evaluate(&conditions, &ctx(false)), Some(StopReason::NoActions));
    }

    #[test]
    fn no_actions_does_not_fire_when_tools_ran() {
        let conditions = vec![StopCondition::NoActions];
        assert_eq!(evaluate(&conditions, &ctx(true)), None);
    }

    #[test]
    fn first_condition_to_fire_wins() {
        let conditions = vec![StopCondition::IterationCap(1), StopCondition::NoActions];
        assert_eq!(evaluate(&conditions, &ctx(false)), Some(StopReason::IterationCap));
    }

    #[test]
    fn completion_phrase_matches_substring() {
        let conditions = vec![StopCondition::CompletionPhrase(vec!["TASK_COMPLETED".to_string()])];
        let mut context = ctx(false);
        context.assistant_text = "All done. TASK_COMPLETED";
        assert_eq!(evaluate(&conditions, &context), Some(StopReason::CompletionPhrase));
    }
}
