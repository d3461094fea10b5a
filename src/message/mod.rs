//! The conversation's atomic unit (spec §3, "Message").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority tag controlling trimming order. Total order for preservation:
/// `System > Context > Dialog > SystemOutput > Error`; trimming removes from
/// the lowest-priority category first (spec §3, §4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    /// Never trimmed.
    Error = 0,
    SystemOutput = 1,
    Dialog = 2,
    Context = 3,
    System = 4,
}

impl MessageCategory {
    /// All categories ordered from lowest to highest trim priority
    /// (i.e. the order trimming removes messages in).
    pub const TRIM_ORDER: [MessageCategory; 4] = [
        MessageCategory::Error,
        MessageCategory::SystemOutput,
        MessageCategory::Dialog,
        MessageCategory::Context,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Where an image part's bytes live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ImageRef {
    Url { url: String },
    Base64 { data: String, mime_type: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image: ImageRef },
    File { name: String, data: String },
    /// Stand-in left by `Content::clamp_images_to_latest` for an image part
    /// it dropped (spec §4.1 step 3: "a lightweight textual placeholder
    /// carrying the original reference in metadata"). The reference lives
    /// in this structured field, not smashed into the placeholder prose.
    ElidedImage { original_reference: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            ContentPart::ElidedImage { .. } => Some("[image elided]"),
            _ => None,
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            ContentPart::Text { text } => text.chars().count(),
            ContentPart::Image { image } => match image {
                ImageRef::Url { url } => url.len(),
                ImageRef::Base64 { data, .. } => data.len(),
            },
            ContentPart::File { name, data } => name.len() + data.len(),
            ContentPart::ElidedImage { .. } => "[image elided]".len(),
        }
    }
}

/// Message content: either a bare text scalar or an ordered list of typed
/// parts (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text(text.into())
    }

    /// Render as a single string, the way `prepare_turn` collapses
    /// multi-part content for the gateway (spec §4.3).
    pub fn to_flat_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.as_text())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn char_len(&self) -> usize {
        match self {
            Content::Text(text) => text.chars().count(),
            Content::Parts(parts) => parts.iter().map(ContentPart::char_len).sum(),
        }
    }

    /// Number of image parts, used by the image-clamping trim step (spec §4.1 step 3).
    pub fn image_count(&self) -> usize {
        match self {
            Content::Text(_) => 0,
            Content::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::Image { .. }))
                .count(),
        }
    }

    pub fn append_text(&mut self, chunk: &str) {
        match self {
            Content::Text(text) => text.push_str(chunk),
            Content::Parts(parts) => {
                if let Some(ContentPart::Text { text }) = parts.last_mut() {
                    text.push_str(chunk);
                } else {
                    parts.push(ContentPart::text(chunk));
                }
            }
        }
    }

    /// Replace all but the most recent image part with a placeholder that
    /// keeps the original reference in a structured field rather than in
    /// prose text (spec §4.1 step 3). Returns `true` if any replacement
    /// happened.
    pub fn clamp_images_to_latest(&mut self) -> bool {
        let Content::Parts(parts) = self else {
            return false;
        };
        let image_indices: Vec<usize> = parts
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, ContentPart::Image { .. }))
            .map(|(i, _)| i)
            .collect();
        if image_indices.len() <= 1 {
            return false;
        }
        let keep = *image_indices.last().unwrap();
        let mut replaced = false;
        for &idx in &image_indices {
            if idx == keep {
                continue;
            }
            if let ContentPart::Image { image } = &parts[idx] {
                let original_reference = match image {
                    ImageRef::Url { url } => url.clone(),
                    ImageRef::Base64 { mime_type, .. } => format!("<inline {mime_type}>"),
                };
                parts[idx] = ContentPart::ElidedImage { original_reference };
                replaced = true;
            }
        }
        replaced
    }
}

pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub category: MessageCategory,
    pub content: Content,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
    /// Cached token count; `None` until first counted.
    pub tokens: Option<usize>,
}

impl Message {
    pub fn new(role: Role, category: MessageCategory, content: Content) -> Self {
        Self {
            id: MessageId::new(),
            role,
            category,
            content,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
            tokens: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn metadata_type(&self) -> Option<&str> {
        self.metadata.get("type").and_then(|v| v.as_str())
    }

    /// Invalidate the cached token count, e.g. after a streaming append.
    pub fn invalidate_tokens(&mut self) {
        self.tokens = None;
    }

    pub fn tokens_or_zero(&self) -> usize {
        self.tokens.unwrap_or(0)
    }
}
