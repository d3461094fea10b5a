//! A small JSON-backed index mapping an id to metadata, shared by the
//! session store's `session_index.json` and the checkpoint manager's
//! `checkpoint_index.json` (spec §6, "On-disk layout").

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read index at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write index at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse index at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// An in-memory index, mirrored to a single JSON file on every mutation.
///
/// This intentionally does not try to be a database: callers that need
/// transactional guarantees across the index and the records it describes
/// (the session store's atomic write protocol, for instance) layer that on
/// top by writing the record first and the index entry second.
pub struct RecordIndex<K, V> {
    path: PathBuf,
    entries: HashMap<K, V>,
}

impl<K, V> RecordIndex<K, V>
where
    K: Eq + Hash + Serialize + DeserializeOwned + Clone,
    V: Serialize + DeserializeOwned + Clone,
{
    /// Load an index from `path`, creating an empty one if the file is absent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| IndexError::Read {
                path: path.clone(),
                source,
            })?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content).map_err(|source| IndexError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            HashMap::new()
        };

        Ok(Self { path, entries })
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace an entry and persist the index immediately.
    pub fn upsert(&mut self, key: K, value: V) -> Result<(), IndexError> {
        self.entries.insert(key, value);
        self.persist()
    }

    /// Remove an entry and persist the index immediately.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>, IndexError> {
        let removed = self.entries.remove(key);
        self.persist()?;
        Ok(removed)
    }

    fn persist(&self) -> Result<(), IndexError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| IndexError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let json =
            serde_json::to_string_pretty(&self.entries).expect("index entries always serialize");
        fs::write(&self.path, json).map_err(|source| IndexError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

pub fn default_cache_dir(namespace: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("penguin")
        .join(namespace)
}
