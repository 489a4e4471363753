use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::Frame;
use super::now_millis;
use super::token_usage::TokenUsage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Lifecycle of a single tool call.
///
/// Order is `partial-call → call → result`; `awaiting-user-input` is a detour
/// between `call` and `result` for tools that need a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    PartialCall,
    Call,
    AwaitingUserInput,
    Result(serde_json::Value),
}

impl ToolState {
    pub fn name(&self) -> &'static str {
        match self {
            ToolState::PartialCall => "partial-call",
            ToolState::Call => "call",
            ToolState::AwaitingUserInput => "awaiting-user-input",
            ToolState::Result(_) => "result",
        }
    }

    pub fn can_transition_to(&self, next: &ToolState) -> bool {
        match (self, next) {
            (ToolState::Result(_), _) => false,
            (ToolState::PartialCall, _) => true,
            (ToolState::Call, ToolState::PartialCall) => false,
            (ToolState::Call, _) => true,
            (ToolState::AwaitingUserInput, ToolState::AwaitingUserInput)
            | (ToolState::AwaitingUserInput, ToolState::Result(_)) => true,
            (ToolState::AwaitingUserInput, _) => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolStateError {
    #[error("Tool call {tool_call_id} cannot move from {from} to {to}")]
    IllegalTransition {
        tool_call_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Unknown tool call {tool_call_id}")]
    UnknownToolCall { tool_call_id: String },
}

/// A model-requested call to an external capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    pub state: ToolState,
}

impl ToolInvocation {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        state: ToolState,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args,
            state,
        }
    }

    pub fn transition(&mut self, next: ToolState) -> Result<(), ToolStateError> {
        if !self.state.can_transition_to(&next) {
            return Err(ToolStateError::IllegalTransition {
                tool_call_id: self.tool_call_id.clone(),
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn is_awaiting_user_input(&self) -> bool {
        matches!(self.state, ToolState::AwaitingUserInput)
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.state {
            ToolState::Result(value) => Some(value),
            _ => None,
        }
    }
}

/// Content attached to an assistant message, kept in arrival order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolInvocation(ToolInvocation),
    Source {
        source_id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    File {
        media_type: String,
        url: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parts: Vec<Part>,
    /// Zero until the backing store assigns it at append time.
    #[serde(default)]
    pub sequence: i64,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    pub fn new(id: impl Into<String>, conversation_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            role,
            content: String::new(),
            parts: Vec::new(),
            sequence: 0,
            created_at: now_millis(),
            usage: None,
        }
    }

    /// A user message with a freshly generated client-side id.
    pub fn user(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(uuid::Uuid::new_v4().to_string(), conversation_id, Role::User);
        message.content = text.into();
        message
    }

    pub fn assistant(id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self::new(id, conversation_id, Role::Assistant)
    }

    pub fn is_persisted(&self) -> bool {
        self.sequence > 0
    }

    pub fn push_text(&mut self, delta: &str) {
        self.content.push_str(delta);
        match self.parts.last_mut() {
            Some(Part::Text { text }) => text.push_str(delta),
            _ => self.parts.push(Part::Text {
                text: delta.to_string(),
            }),
        }
    }

    pub fn push_reasoning(&mut self, delta: &str) {
        match self.parts.last_mut() {
            Some(Part::Reasoning { text }) => text.push_str(delta),
            _ => self.parts.push(Part::Reasoning {
                text: delta.to_string(),
            }),
        }
    }

    pub fn tool_invocation(&self, tool_call_id: &str) -> Option<&ToolInvocation> {
        self.parts.iter().find_map(|part| match part {
            Part::ToolInvocation(inv) if inv.tool_call_id == tool_call_id => Some(inv),
            _ => None,
        })
    }

    pub fn tool_invocation_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.parts.iter_mut().find_map(|part| match part {
            Part::ToolInvocation(inv) if inv.tool_call_id == tool_call_id => Some(inv),
            _ => None,
        })
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|part| match part {
            Part::ToolInvocation(inv) => Some(inv),
            _ => None,
        })
    }

    pub fn awaiting_tools(&self) -> Vec<ToolInvocation> {
        self.tool_invocations()
            .filter(|inv| inv.is_awaiting_user_input())
            .cloned()
            .collect()
    }

    /// Insert a tool invocation, or advance the existing part with the same `tool_call_id`.
    pub fn upsert_tool_invocation(
        &mut self,
        invocation: ToolInvocation,
    ) -> Result<(), ToolStateError> {
        match self.tool_invocation_mut(&invocation.tool_call_id) {
            Some(existing) => {
                if existing.state == invocation.state {
                    existing.args = invocation.args;
                    return Ok(());
                }
                existing.transition(invocation.state)?;
                existing.args = invocation.args;
                Ok(())
            }
            None => {
                self.parts.push(Part::ToolInvocation(invocation));
                Ok(())
            }
        }
    }

    /// Move a tool invocation to `result`. A later result replaces an earlier one.
    pub fn apply_tool_result(
        &mut self,
        tool_call_id: &str,
        result: serde_json::Value,
    ) -> Result<(), ToolStateError> {
        let invocation =
            self.tool_invocation_mut(tool_call_id)
                .ok_or_else(|| ToolStateError::UnknownToolCall {
                    tool_call_id: tool_call_id.to_string(),
                })?;

        if let ToolState::Result(existing) = &mut invocation.state {
            *existing = result;
            return Ok(());
        }
        invocation.transition(ToolState::Result(result))
    }

    /// Apply one broker frame to this (assistant) message.
    pub fn apply_frame(&mut self, frame: &Frame) -> Result<(), ToolStateError> {
        match frame {
            Frame::Start { .. } | Frame::Error { .. } => Ok(()),
            Frame::Text { delta } => {
                self.push_text(delta);
                Ok(())
            }
            Frame::Reasoning { delta } => {
                self.push_reasoning(delta);
                Ok(())
            }
            Frame::ToolCall { invocation } => self.upsert_tool_invocation(invocation.clone()),
            Frame::ToolResult {
                tool_call_id,
                result,
            } => self.apply_tool_result(tool_call_id, result.clone()),
            Frame::Finish {
                usage, sequence, ..
            } => {
                if let Some(usage) = usage {
                    self.usage = Some(usage.clone());
                }
                if let Some(sequence) = sequence {
                    self.sequence = *sequence;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn location_call(state: ToolState) -> ToolInvocation {
        ToolInvocation::new("call-1", "get_user_location", json!({}), state)
    }

    #[test]
    fn test_text_deltas_merge_into_one_part() {
        let mut msg = Message::assistant("a1", "c1");
        msg.push_text("Hel");
        msg.push_text("lo");
        assert_eq!(msg.content, "Hello");
        assert_eq!(msg.parts.len(), 1);
    }

    #[test]
    fn test_parts_keep_arrival_order() {
        let mut msg = Message::assistant("a1", "c1");
        msg.push_reasoning("thinking");
        msg.push_text("answer");
        msg.push_reasoning("more");
        assert!(matches!(msg.parts[0], Part::Reasoning { .. }));
        assert!(matches!(msg.parts[1], Part::Text { .. }));
        assert!(matches!(msg.parts[2], Part::Reasoning { .. }));
    }

    #[test]
    fn test_tool_state_never_regresses() {
        let mut inv = location_call(ToolState::Call);
        assert!(inv.transition(ToolState::PartialCall).is_err());
        inv.transition(ToolState::AwaitingUserInput).unwrap();
        assert!(inv.transition(ToolState::Call).is_err());
        inv.transition(ToolState::Result(json!({"denied": true})))
            .unwrap();
        assert!(inv.transition(ToolState::AwaitingUserInput).is_err());
    }

    #[test]
    fn test_upsert_keeps_single_part_per_call() {
        let mut msg = Message::assistant("a1", "c1");
        msg.upsert_tool_invocation(location_call(ToolState::PartialCall))
            .unwrap();
        msg.upsert_tool_invocation(location_call(ToolState::Call))
            .unwrap();
        msg.upsert_tool_invocation(location_call(ToolState::AwaitingUserInput))
            .unwrap();
        msg.apply_tool_result("call-1", json!({"status": "denied"}))
            .unwrap();
        msg.apply_tool_result("call-1", json!({"status": "denied"}))
            .unwrap();

        assert_eq!(msg.tool_invocations().count(), 1);
        assert_eq!(
            msg.tool_invocation("call-1").unwrap().result(),
            Some(&json!({"status": "denied"}))
        );
    }

    #[test]
    fn test_later_result_replaces_earlier_one() {
        let mut msg = Message::assistant("a1", "c1");
        msg.upsert_tool_invocation(location_call(ToolState::AwaitingUserInput))
            .unwrap();
        msg.apply_tool_result("call-1", json!({"status": "denied", "note": "local"}))
            .unwrap();
        msg.apply_frame(&Frame::ToolResult {
            tool_call_id: "call-1".into(),
            result: json!({"status": "denied"}),
        })
        .unwrap();

        assert_eq!(msg.tool_invocations().count(), 1);
        assert_eq!(
            msg.tool_invocation("call-1").unwrap().result(),
            Some(&json!({"status": "denied"}))
        );
    }

    #[test]
    fn test_result_for_unknown_call_is_error() {
        let mut msg = Message::assistant("a1", "c1");
        let err = msg.apply_tool_result("nope", json!(null)).unwrap_err();
        assert!(matches!(err, ToolStateError::UnknownToolCall { .. }));
    }

    #[test]
    fn test_part_serialization_is_tagged() {
        let part = Part::ToolInvocation(location_call(ToolState::AwaitingUserInput));
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool-invocation");
        assert_eq!(value["state"], "awaiting-user-input");

        let back: Part = serde_json::from_value(value).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn test_apply_finish_sets_sequence_and_usage() {
        let mut msg = Message::assistant("a1", "c1");
        msg.apply_frame(&Frame::Finish {
            reason: crate::models::FinishReason::Stop,
            usage: Some(TokenUsage::new(3, 4)),
            sequence: Some(2),
        })
        .unwrap();
        assert_eq!(msg.sequence, 2);
        assert_eq!(msg.usage.as_ref().unwrap().output_tokens, 4);
    }
}
