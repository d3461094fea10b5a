//! Token Counter / Context-Window Manager (spec §4.1, component C1).
//!
//! Counts tokens per message, allocates per-category budgets, and trims a
//! message list to fit a configured window. Grounded on the
//! `ContextManager`/`ContextConfig` shape used across the retrieved agent
//! corpus (priority-based reduction over a character-rate estimate), with
//! the character-rate fallback promoted to one tier of a pluggable,
//! ordered `TokenCounter` chain (spec §4.1 "Token counting capability").

use crate::config::{CategoryRatios, TokenCounterStrategy};
use crate::error::{CoreError, Result};
use crate::message::{Content, Message, MessageCategory};
use std::collections::HashMap;
use tracing::warn;

/// Characters-per-token ratio for the zero-dependency fallback estimator.
pub const CHARS_PER_TOKEN: f64 = 4.0;

/// Pluggable token counting strategy (spec §4.1 "Token counting capability").
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;
    fn name(&self) -> &'static str;
}

/// Tier 3: a character-rate estimate. Always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharRateCounter;

impl TokenCounter for CharRateCounter {
    fn count_text(&self, text: &str) -> usize {
        (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as usize
    }

    fn name(&self) -> &'static str {
        "char_rate"
    }
}

/// Tier 2: a named-encoding counter backed by `tiktoken-rs`.
pub struct NamedEncodingCounter {
    bpe: tiktoken_rs::CoreBPE,
    encoding_name: &'static str,
}

impl NamedEncodingCounter {
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| {
            CoreError::InvariantViolation(format!("failed to load cl100k_base encoding: {e}"))
        })?;
        Ok(Self {
            bpe,
            encoding_name: "cl100k_base",
        })
    }
}

impl TokenCounter for NamedEncodingCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn name(&self) -> &'static str {
        self.encoding_name
    }
}

/// Tier 1: counts reported by the LLM provider itself. The core never talks
/// to a provider directly (spec §1 "Out of scope"); callers that have a
/// live `LLMGateway` wire its usage-reporting side in by registering a
/// closure here per request, which is out of this trait's hands — in
/// practice the Engine records provider-native counts directly onto
/// finalized messages and this tier is skipped by the chain below once a
/// count is already cached (see `TokenCounterChain::count_message`).
pub struct ProviderNativeCounter;

impl TokenCounter for ProviderNativeCounter {
    fn count_text(&self, _text: &str) -> usize {
        // No provider session is reachable from here; the chain falls
        // through to the next tier. A real count only ever arrives via
        // `Message.tokens` already being populated by the Engine.
        0
    }

    fn name(&self) -> &'static str {
        "provider_native"
    }
}

/// Tries counters in the configured preference order, falling back to the
/// next tier only if a tier is unavailable.
pub struct TokenCounterChain {
    tiers: Vec<Box<dyn TokenCounter>>,
}

impl TokenCounterChain {
    pub fn from_preference(preference: &[TokenCounterStrategy]) -> Self {
        let mut tiers: Vec<Box<dyn TokenCounter>> = Vec::new();
        for strategy in preference {
            match strategy {
                TokenCounterStrategy::ProviderNative => tiers.push(Box::new(ProviderNativeCounter)),
                TokenCounterStrategy::NamedEncoding => match NamedEncodingCounter::cl100k() {
                    Ok(counter) => tiers.push(Box::new(counter)),
                    Err(e) => warn!("named-encoding token counter unavailable: {e}"),
                },
                TokenCounterStrategy::CharRate => tiers.push(Box::new(CharRateCounter)),
            }
        }
        if tiers.is_empty() {
            tiers.push(Box::new(CharRateCounter));
        }
        Self { tiers }
    }

    /// Count a message's content, preferring an already-cached count
    /// (provider-native tier, populated by the Engine on finalize) and
    /// otherwise running the first tier that returns a non-placeholder
    /// count.
    pub fn count_message(&self, message: &Message) -> usize {
        if let Some(cached) = message.tokens {
            return cached;
        }
        self.count_content(&message.content)
    }

    pub fn count_content(&self, content: &Content) -> usize {
        let text = content.to_flat_text();
        for tier in &self.tiers {
            let count = tier.count_text(&text);
            if count > 0 || text.is_empty() {
                return count;
            }
        }
        CharRateCounter.count_text(&text)
    }
}

/// Per-category allocation state (spec §3 "TokenBudget").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudget {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub current_tokens: usize,
}

impl TokenBudget {
    pub fn usage_percentage(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.current_tokens as f32 / self.max_tokens as f32) * 100.0
    }

    pub fn exceeds_max(&self) -> bool {
        self.current_tokens > self.max_tokens
    }
}

/// Resolves a total window `W` into per-category maxima (spec §4.1
/// "Budget allocation"), guaranteeing SYSTEM keeps its full share.
pub fn allocate_budgets(total: usize, ratios: &CategoryRatios) -> HashMap<MessageCategory, TokenBudget> {
    let mut budgets = HashMap::new();
    let pairs = [
        (MessageCategory::System, ratios.system),
        (MessageCategory::Context, ratios.context),
        (MessageCategory::Dialog, ratios.dialog),
        (MessageCategory::SystemOutput, ratios.system_output),
        (MessageCategory::Error, ratios.error),
    ];
    for (category, ratio) in pairs {
        let max_tokens = ((total as f64) * (ratio as f64)).floor() as usize;
        let min_tokens = if category == MessageCategory::System {
            max_tokens
        } else {
            0
        };
        budgets.insert(
            category,
            TokenBudget {
                min_tokens,
                max_tokens,
                current_tokens: 0,
            },
        );
    }
    budgets
}

/// Snapshot of per-category usage for observability (spec §4.1 "Observability").
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub budgets: HashMap<MessageCategory, TokenBudget>,
    pub total_tokens: usize,
    pub total_limit: usize,
    /// Categories that crossed their max during the last trim/check.
    pub over_budget: Vec<MessageCategory>,
}

impl UsageReport {
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .budgets
            .iter()
            .map(|(category, budget)| {
                format!(
                    "{category:?}: {}/{} ({:.1}%)",
                    budget.current_tokens,
                    budget.max_tokens,
                    budget.usage_percentage()
                )
            })
            .collect();
        parts.sort();
        format!(
            "{}/{} tokens total — {}",
            self.total_tokens,
            self.total_limit,
            parts.join(", ")
        )
    }
}

/// Result of a trim pass (spec §4.1 "Trimming algorithm").
pub struct TrimOutcome {
    pub messages: Vec<Message>,
    pub changed: bool,
    pub usage: UsageReport,
}

/// The context window manager: a resolved limit, category ratios, and a
/// counter chain, all bundled for repeated enforcement calls against a
/// session's message list.
pub struct ContextWindow {
    pub total_tokens: usize,
    pub ratios: CategoryRatios,
    counter: TokenCounterChain,
}

impl ContextWindow {
    pub fn new(total_tokens: usize, ratios: CategoryRatios, counter: TokenCounterChain) -> Self {
        Self {
            total_tokens,
            ratios,
            counter,
        }
    }

    pub fn counter(&self) -> &TokenCounterChain {
        &self.counter
    }

    fn usage_of(&self, messages: &[Message]) -> UsageReport {
        let mut budgets = allocate_budgets(self.total_tokens, &self.ratios);
        let mut total = 0usize;
        for message in messages {
            let tokens = self.counter.count_message(message);
            total += tokens;
            if let Some(budget) = budgets.get_mut(&message.category) {
                budget.current_tokens += tokens;
            }
        }
        let over_budget = budgets
            .iter()
            .filter(|(_, b)| b.exceeds_max())
            .map(|(c, _)| *c)
            .collect();
        UsageReport {
            budgets,
            total_tokens: total,
            total_limit: self.total_tokens,
            over_budget,
        }
    }

    /// Refresh token counts, then trim per spec §4.1 steps 1–5. Returns the
    /// (possibly unchanged) message list plus a usage report.
    pub fn enforce(&self, messages: &[Message]) -> Result<TrimOutcome> {
        if messages.is_empty() {
            return Ok(TrimOutcome {
                messages: Vec::new(),
                changed: false,
                usage: self.usage_of(messages),
            });
        }

        let mut working: Vec<Message> = messages.to_vec();
        for message in &mut working {
            if message.tokens.is_none() {
                message.tokens = Some(self.counter.count_content(&message.content));
            }
        }

        let usage = self.usage_of(&working);
        if usage.total_tokens <= self.total_tokens && usage.over_budget.is_empty() {
            return Ok(TrimOutcome {
                messages: working,
                changed: false,
                usage,
            });
        }

        // Step 3: clamp multi-image messages to their most recent image.
        let mut clamped_any = false;
        for message in &mut working {
            if message.content.image_count() > 1 && message.content.clamp_images_to_latest() {
                message.invalidate_tokens();
                clamped_any = true;
            }
        }
        if clamped_any {
            for message in &mut working {
                if message.tokens.is_none() {
                    message.tokens = Some(self.counter.count_content(&message.content));
                }
            }
            let usage = self.usage_of(&working);
            if usage.total_tokens <= self.total_tokens && usage.over_budget.is_empty() {
                return Ok(TrimOutcome {
                    messages: working,
                    changed: true,
                    usage,
                });
            }
        }

        // Step 4: trim in priority order low -> high, oldest-first within a category.
        for &category in MessageCategory::TRIM_ORDER.iter() {
            loop {
                let usage = self.usage_of(&working);
                let fits = usage.total_tokens <= self.total_tokens && usage.over_budget.is_empty();
                if fits {
                    break;
                }
                let oldest_index = working
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.category == category)
                    .min_by_key(|(_, m)| m.timestamp)
                    .map(|(i, _)| i);
                match oldest_index {
                    Some(index) => {
                        working.remove(index);
                    }
                    None => break, // nothing left in this category, move to the next
                }
            }
        }

        let usage = self.usage_of(&working);
        let fits = usage.total_tokens <= self.total_tokens && usage.over_budget.is_empty();
        if !fits {
            let only_system = working.iter().all(|m| m.category == MessageCategory::System);
            if only_system {
                return Err(CoreError::CapacityExceeded {
                    used: usage.total_tokens,
                    limit: self.total_tokens,
                });
            }
        }

        Ok(TrimOutcome {
            messages: working,
            changed: true,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn window(total: usize) -> ContextWindow {
        ContextWindow::new(
            total,
            CategoryRatios::default(),
            TokenCounterChain::from_preference(&[TokenCounterStrategy::CharRate]),
        )
    }

    fn msg(category: MessageCategory, text: &str) -> Message {
        Message::new(Role::User, category, Content::text(text))
    }

    #[test]
    fn empty_session_short_circuits() {
        let outcome = window(1000).enforce(&[]).unwrap();
        assert!(outcome.messages.is_empty());
        assert!(!outcome.changed);
    }

    #[test]
    fn compliant_session_is_returned_unchanged() {
        let messages = vec![msg(MessageCategory::System, "hello")];
        let outcome = window(1000).enforce(&messages).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.messages.len(), 1);
    }

    #[test]
    fn system_messages_are_never_removed() {
        let cw = window(20); // tiny window: 20 tokens ~= 80 chars
        let messages = vec![
            msg(MessageCategory::System, "you are a helpful assistant with lots of rules"),
            msg(MessageCategory::Dialog, "a very long filler message to push us over budget"),
            msg(MessageCategory::Dialog, "another very long filler message pushing further"),
        ];
        let outcome = cw.enforce(&messages).unwrap();
        assert!(outcome
            .messages
            .iter()
            .any(|m| m.category == MessageCategory::System));
    }

    #[test]
    fn trimming_removes_oldest_within_category_first() {
        let cw = window(15);
        let mut old = msg(MessageCategory::Dialog, "old message content here");
        old.timestamp = utc_now_minus(10);
        let new = msg(MessageCategory::Dialog, "new message content here");
        let messages = vec![old.clone(), new.clone()];
        let outcome = cw.enforce(&messages).unwrap();
        // If anything got dropped, it must be the older one.
        if outcome.messages.len() == 1 {
            assert_eq!(outcome.messages[0].id, new.id);
        }
    }

    #[test]
    fn only_system_messages_over_budget_is_an_error() {
        let cw = window(1);
        let messages = vec![msg(
            MessageCategory::System,
            "this system prompt is far too long to ever fit in one token",
        )];
        let result = cw.enforce(&messages);
        assert!(matches!(result, Err(CoreError::CapacityExceeded { .. })));
    }

    fn utc_now_minus(seconds: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now() - chrono::Duration::seconds(seconds)
    }
}
