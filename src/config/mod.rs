//! Agent core configuration (spec §6).
//!
//! Mirrors `ccswarm::config`'s shape — plain `Default`-backed structs — but
//! adds a layered loader built on the `config` crate: built-in defaults,
//! then an optional file, then `PENGUIN_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Counter strategies tried in order until one succeeds (spec §4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenCounterStrategy {
    ProviderNative,
    NamedEncoding,
    CharRate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRatios {
    pub system: f32,
    pub context: f32,
    pub dialog: f32,
    pub system_output: f32,
    pub error: f32,
}

impl Default for CategoryRatios {
    fn default() -> Self {
        Self {
            system: 0.10,
            context: 0.35,
            dialog: 0.50,
            system_output: 0.05,
            error: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextWindowConfig {
    pub total_tokens: usize,
    pub category_ratios: CategoryRatios,
    pub token_counter_preference: Vec<TokenCounterStrategy>,
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            total_tokens: 150_000,
            category_ratios: CategoryRatios::default(),
            token_counter_preference: vec![
                TokenCounterStrategy::ProviderNative,
                TokenCounterStrategy::NamedEncoding,
                TokenCounterStrategy::CharRate,
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub max_messages_per_session: usize,
    pub auto_save_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_messages_per_session: 5_000,
            auto_save_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn auto_save_interval(&self) -> Option<Duration> {
        if self.auto_save_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.auto_save_interval_secs))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    pub keep_all_hours: u64,
    pub keep_every_nth: usize,
    pub max_age_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_all_hours: 24,
            keep_every_nth: 5,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub frequency: usize,
    pub retention: RetentionConfig,
    pub max_auto: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: 1,
            retention: RetentionConfig::default(),
            max_auto: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_millis: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_millis: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub max_iterations: usize,
    pub stop_phrases: Vec<String>,
    pub streaming: bool,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            stop_phrases: vec![
                "TASK_COMPLETED".to_string(),
                "NEED_USER_CLARIFICATION".to_string(),
                "EMERGENCY_STOP".to_string(),
            ],
            streaming: true,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PenguinConfig {
    pub context_window: ContextWindowConfig,
    pub session: SessionConfig,
    pub checkpoint: CheckpointConfig,
    pub engine: EngineConfig,
}

impl PenguinConfig {
    /// Layer built-in defaults, an optional config file, then `PENGUIN_*`
    /// environment variables (e.g. `PENGUIN_SESSION__MAX_MESSAGES_PER_SESSION=8000`).
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = PenguinConfig::default();
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PENGUIN")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}
