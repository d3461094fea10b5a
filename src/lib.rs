//! Penguin agent core: a reasoning Engine, Conversation/Session store, and
//! Checkpoint/Snapshot layer for an autonomous coding-assistant runtime.
//!
//! This crate owns the coupled subsystem that drives multi-step LLM
//! conversations, dispatches parsed tool calls, and persists the
//! interaction so it can be resumed, rewound, or branched. It does not ship
//! a concrete LLM provider, tool sandbox, or UI surface — those are
//! injected through the `capabilities` traits.

pub mod capabilities;
pub mod checkpoint;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod message;
pub mod session;
pub mod tokens;

pub use config::PenguinConfig;
pub use conversation::ConversationManager;
pub use engine::{Engine, StopCondition, StopReason, TurnSummary};
pub use error::{CoreError, Result};
pub use message::{Content, Message, MessageCategory, MessageId, Role};
pub use session::{Session, SessionId, SessionManager, SessionManagerConfig};
pub use tokens::{ContextWindow, TokenCounterChain};

/// Library version, mirroring `ai_session::VERSION`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installs an `EnvFilter`-driven `tracing` subscriber. Library code never
/// initializes the subscriber itself; only binaries and tests call this.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
