//! # Penguin Snapshot Store
//!
//! Low-level persistence primitives for `penguin-core`'s Session Store and
//! Checkpoint/Snapshot Manager: a generic JSON-backed index (the same shape
//! as a directory's `session_index.json` / `checkpoint_index.json`), and
//! compressed binary encoding for flattened checkpoint payloads.
//!
//! This crate owns no domain types — it is generic over whatever
//! `Serialize + DeserializeOwned` record `penguin-core` hands it, the same
//! way the session cache it is descended from only ever shuffled bytes
//! around without understanding what a "session" was.

pub mod compress;
pub mod index;

pub use compress::{Codec, Compression};
pub use index::{IndexError, RecordIndex};

/// Library version, re-exported for diagnostics the way `ai-session` did.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
