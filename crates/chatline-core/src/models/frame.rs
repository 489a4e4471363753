use std::fmt;

use serde::{Deserialize, Serialize};

use super::message::ToolInvocation;
use super::token_usage::TokenUsage;
use crate::errors::ErrorKind;

/// Why the model stopped producing output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Stopped by the reader before the model finished.
    Cancelled,
    /// A human decision never arrived.
    DecisionTimeout,
    Other,
}

/// One unit of streamed output flowing through the broker.
///
/// Frames are self-describing: replaying the buffered frames of a stream in
/// order onto an empty assistant message reconstructs the full message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Start {
        conversation_id: String,
        message_id: String,
    },
    Text {
        delta: String,
    },
    Reasoning {
        delta: String,
    },
    ToolCall {
        invocation: ToolInvocation,
    },
    ToolResult {
        tool_call_id: String,
        result: serde_json::Value,
    },
    Finish {
        reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        /// Sequence number assigned to the persisted assistant message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<i64>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Frame {
    pub fn discriminant(&self) -> &'static str {
        match self {
            Frame::Start { .. } => "start",
            Frame::Text { .. } => "text",
            Frame::Reasoning { .. } => "reasoning",
            Frame::ToolCall { .. } => "tool-call",
            Frame::ToolResult { .. } => "tool-result",
            Frame::Finish { .. } => "finish",
            Frame::Error { .. } => "error",
        }
    }
}

/// Terminal marker recorded when a stream is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "kind", rename_all = "kebab-case")]
pub enum TerminalReason {
    Done,
    Error(ErrorKind),
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::Done => f.write_str("done"),
            TerminalReason::Error(kind) => write!(f, "error:{kind}"),
        }
    }
}
