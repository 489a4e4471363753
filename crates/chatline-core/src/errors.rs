use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repositories::RepositoryError;
use crate::streams::{BrokerError, StreamStoreError};

/// Classification of an upstream model/service failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderErrorKind {
    RateLimited,
    InsufficientCredits,
    ModerationFlagged,
    ProviderUnavailable,
    Unknown,
}

impl ProviderErrorKind {
    /// Classify a provider failure from its HTTP status (when known) and message text.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        match status {
            Some(429) => return Self::RateLimited,
            Some(402) => return Self::InsufficientCredits,
            Some(s) if (500..600).contains(&s) => return Self::ProviderUnavailable,
            _ => {}
        }

        if lower.contains("rate limit") || lower.contains("too many requests") {
            Self::RateLimited
        } else if lower.contains("insufficient credits")
            || lower.contains("insufficient_quota")
            || lower.contains("quota")
        {
            Self::InsufficientCredits
        } else if lower.contains("moderation")
            || lower.contains("flagged")
            || lower.contains("content policy")
        {
            Self::ModerationFlagged
        } else if lower.contains("overloaded")
            || lower.contains("unavailable")
            || lower.contains("bad gateway")
        {
            Self::ProviderUnavailable
        } else {
            Self::Unknown
        }
    }
}

/// Wire-level error discriminant carried by `error` frames and `error:<kind>` terminal reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Credential,
    RateLimited,
    InsufficientCredits,
    ModerationFlagged,
    ProviderUnavailable,
    Provider,
    Network,
    Timeout,
    Conflict,
    NotFound,
    LimitReached,
    Storage,
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Credential => "credential",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::InsufficientCredits => "insufficient-credits",
            ErrorKind::ModerationFlagged => "moderation-flagged",
            ErrorKind::ProviderUnavailable => "provider-unavailable",
            ErrorKind::Provider => "provider",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not-found",
            ErrorKind::LimitReached => "limit-reached",
            ErrorKind::Storage => "storage",
            ErrorKind::Interrupted => "interrupted",
        }
    }

    /// Whether the client may re-attach to the stream automatically.
    pub fn is_resumable(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ProviderErrorKind> for ErrorKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::RateLimited => ErrorKind::RateLimited,
            ProviderErrorKind::InsufficientCredits => ErrorKind::InsufficientCredits,
            ProviderErrorKind::ModerationFlagged => ErrorKind::ModerationFlagged,
            ProviderErrorKind::ProviderUnavailable => ErrorKind::ProviderUnavailable,
            ProviderErrorKind::Unknown => ErrorKind::Provider,
        }
    }
}

/// Engine-wide error taxonomy.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ChatError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Missing or invalid credentials for {provider}: {message}")]
    Credential { provider: String, message: String },

    #[error("Provider error ({kind:?}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("Network error: {message}")]
    Network { message: String, timeout: bool },

    #[error("A generation is already streaming for conversation {conversation_id}")]
    AlreadyStreaming { conversation_id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Guest message limit of {cap} reached")]
    LimitReached { cap: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Tool decision for {tool_call_id} could not be delivered: {message}")]
    ToolDelivery {
        tool_call_id: String,
        message: String,
    },
}

impl ChatError {
    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        ChatError::Provider {
            kind: ProviderErrorKind::classify(status, &message),
            message,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        ChatError::Network {
            message: message.into(),
            timeout: true,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::Credential { .. } => ErrorKind::Credential,
            ChatError::Provider { kind, .. } => (*kind).into(),
            ChatError::Network { timeout: true, .. } => ErrorKind::Timeout,
            ChatError::Network { .. } => ErrorKind::Network,
            ChatError::AlreadyStreaming { .. } => ErrorKind::Conflict,
            ChatError::NotFound(_) => ErrorKind::NotFound,
            ChatError::LimitReached { .. } => ErrorKind::LimitReached,
            ChatError::Storage(_) => ErrorKind::Storage,
            ChatError::ToolDelivery { .. } => ErrorKind::NotFound,
        }
    }

    /// Build the user-facing rendition of this error.
    pub fn to_displayable(&self) -> DisplayableError {
        let (title, category, action) = match self {
            ChatError::Validation(_) => ("Invalid request", ErrorCategory::Failure, None),
            ChatError::Credential { .. } => (
                "API key required",
                ErrorCategory::Credential,
                Some(ErrorAction::AddCredentials),
            ),
            ChatError::Provider { kind, .. } => match kind {
                ProviderErrorKind::RateLimited => (
                    "Rate limited",
                    ErrorCategory::Transient,
                    Some(ErrorAction::Retry),
                ),
                ProviderErrorKind::InsufficientCredits => (
                    "Insufficient credits",
                    ErrorCategory::Credential,
                    Some(ErrorAction::AddCredentials),
                ),
                ProviderErrorKind::ModerationFlagged => {
                    ("Content flagged", ErrorCategory::Warning, None)
                }
                ProviderErrorKind::ProviderUnavailable => (
                    "Provider unavailable",
                    ErrorCategory::Transient,
                    Some(ErrorAction::Retry),
                ),
                ProviderErrorKind::Unknown => (
                    "Provider error",
                    ErrorCategory::Failure,
                    Some(ErrorAction::Retry),
                ),
            },
            ChatError::Network { timeout: true, .. } => (
                "Request timed out",
                ErrorCategory::Transient,
                Some(ErrorAction::Resume),
            ),
            ChatError::Network { .. } => (
                "Connection lost",
                ErrorCategory::Transient,
                Some(ErrorAction::Resume),
            ),
            ChatError::AlreadyStreaming { .. } => {
                ("Response in progress", ErrorCategory::Warning, None)
            }
            ChatError::NotFound(_) => ("Not found", ErrorCategory::Warning, None),
            ChatError::LimitReached { .. } => {
                ("Message limit reached", ErrorCategory::Warning, None)
            }
            ChatError::Storage(_) => ("Could not save", ErrorCategory::Failure, None),
            ChatError::ToolDelivery { .. } => (
                "Decision not delivered",
                ErrorCategory::Warning,
                Some(ErrorAction::Retry),
            ),
        };

        DisplayableError {
            title: title.to_string(),
            message: self.to_string(),
            kind: self.kind(),
            category,
            action,
        }
    }

    /// Rebuild an error from a wire `error` frame.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Validation => ChatError::Validation(message),
            ErrorKind::Credential => ChatError::Credential {
                provider: "provider".to_string(),
                message,
            },
            ErrorKind::RateLimited => ChatError::Provider {
                kind: ProviderErrorKind::RateLimited,
                message,
            },
            ErrorKind::InsufficientCredits => ChatError::Provider {
                kind: ProviderErrorKind::InsufficientCredits,
                message,
            },
            ErrorKind::ModerationFlagged => ChatError::Provider {
                kind: ProviderErrorKind::ModerationFlagged,
                message,
            },
            ErrorKind::ProviderUnavailable => ChatError::Provider {
                kind: ProviderErrorKind::ProviderUnavailable,
                message,
            },
            ErrorKind::Provider | ErrorKind::Interrupted => ChatError::Provider {
                kind: ProviderErrorKind::Unknown,
                message,
            },
            ErrorKind::Network => ChatError::Network {
                message,
                timeout: false,
            },
            ErrorKind::Timeout => ChatError::Network {
                message,
                timeout: true,
            },
            ErrorKind::Conflict => ChatError::AlreadyStreaming {
                conversation_id: message,
            },
            ErrorKind::NotFound => ChatError::NotFound(message),
            ErrorKind::LimitReached => ChatError::LimitReached { cap: 0 },
            ErrorKind::Storage => ChatError::Storage(message),
        }
    }
}

impl From<RepositoryError> for ChatError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::LimitReached { cap } => ChatError::LimitReached { cap },
            RepositoryError::NotFound { id } => ChatError::NotFound(id),
            RepositoryError::InvalidConversationId { id } => {
                ChatError::Validation(format!("invalid conversation id {id:?}"))
            }
            other => ChatError::Storage(other.to_string()),
        }
    }
}

impl From<StreamStoreError> for ChatError {
    fn from(err: StreamStoreError) -> Self {
        match err {
            StreamStoreError::Conflict { .. } => ChatError::Storage(err.to_string()),
            StreamStoreError::Repository(inner) => inner.into(),
        }
    }
}

impl From<BrokerError> for ChatError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::NotFound { stream_id } => ChatError::NotFound(stream_id),
            other => ChatError::Storage(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Dismissible, auto-expiring notice.
    Transient,
    Credential,
    /// Expected outcomes such as moderation rejections.
    Warning,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Resume,
    AddCredentials,
    Retry,
}

/// Structured, user-displayable error surfaced by the session controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayableError {
    pub title: String,
    pub message: String,
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ErrorAction>,
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_status() {
        assert_eq!(
            ProviderErrorKind::classify(Some(429), "slow down"),
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            ProviderErrorKind::classify(Some(402), ""),
            ProviderErrorKind::InsufficientCredits
        );
        assert_eq!(
            ProviderErrorKind::classify(Some(503), ""),
            ProviderErrorKind::ProviderUnavailable
        );
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(
            ProviderErrorKind::classify(None, "Request was flagged by moderation"),
            ProviderErrorKind::ModerationFlagged
        );
        assert_eq!(
            ProviderErrorKind::classify(None, "You exceeded your current quota"),
            ProviderErrorKind::InsufficientCredits
        );
        assert_eq!(
            ProviderErrorKind::classify(None, "something odd"),
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn test_moderation_is_warning_not_failure() {
        let err = ChatError::provider(None, "content policy violation");
        let shown = err.to_displayable();
        assert_eq!(shown.category, ErrorCategory::Warning);
        assert_eq!(shown.kind, ErrorKind::ModerationFlagged);
    }

    #[test]
    fn test_credential_error_offers_remediation() {
        let err = ChatError::Credential {
            provider: "openai".to_string(),
            message: "no key".to_string(),
        };
        let shown = err.to_displayable();
        assert_eq!(shown.category, ErrorCategory::Credential);
        assert_eq!(shown.action, Some(ErrorAction::AddCredentials));
    }

    #[test]
    fn test_timeout_is_resumable() {
        let err = ChatError::timeout("read timed out");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().is_resumable());
        assert_eq!(err.to_displayable().action, Some(ErrorAction::Resume));
    }

    #[test]
    fn test_wire_kind_strings() {
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate-limited");
        let json = serde_json::to_string(&ErrorKind::ProviderUnavailable).unwrap();
        assert_eq!(json, "\"provider-unavailable\"");
    }
}
