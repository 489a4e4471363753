use serde::{Deserialize, Serialize};

use super::now_millis;

/// Conversation metadata. Messages are stored separately and keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// `None` for guest or not-yet-persisted conversations.
    #[serde(default)]
    pub owner_id: Option<String>,
    pub title: String,
    pub model_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_message_at: Option<i64>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, owner_id: Option<String>, model_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            owner_id,
            title: String::new(),
            model_id: model_id.into(),
            created_at: now,
            updated_at: now,
            last_message_at: None,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.owner_id.is_none()
    }
}

/// Default title derived from the first user message: first line, at most 60 characters.
pub fn derive_title(text: &str) -> String {
    const MAX_CHARS: usize = 60;

    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if first_line.chars().count() <= MAX_CHARS {
        return first_line.to_string();
    }

    let mut title: String = first_line.chars().take(MAX_CHARS - 1).collect();
    title = title.trim_end().to_string();
    title.push('…');
    title
}
