use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::provider::{CompletionRequest, ModelProvider, ProviderEvent, ProviderStream};
use crate::errors::{ChatError, ChatResult};
use crate::models::{FinishReason, Message, Part, Role, TokenUsage};

/// One step of a scripted model turn.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Text(String),
    Reasoning(String),
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    /// Text built from the latest resolved tool result in the request.
    EchoToolResult { prefix: String },
    /// Fail the stream with this error.
    Fail(ChatError),
    /// Never produce another item.
    Stall,
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptStep::Text(text.into())
    }

    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        ScriptStep::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }
}

/// Deterministic provider replaying scripted turns, one per `stream` call.
///
/// Once the script is exhausted it echoes the last user message word by
/// word, which is what the offline CLI runs on.
#[derive(Clone)]
pub struct ScriptedProvider {
    turns: Arc<Mutex<VecDeque<Vec<ScriptStep>>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    step_delay: Duration,
    credential_error: Option<String>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
            step_delay: Duration::ZERO,
            credential_error: None,
        }
    }

    /// Pause before each step, so readers can act mid-stream.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn without_credentials(mut self, message: impl Into<String>) -> Self {
        self.credential_error = Some(message.into());
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn echo_turn(messages: &[Message]) -> Vec<ScriptStep> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let mut steps = vec![ScriptStep::text("You said:")];
        steps.extend(
            last_user
                .split_whitespace()
                .map(|word| ScriptStep::Text(format!(" {word}"))),
        );
        steps
    }
}

fn latest_tool_result(messages: &[Message]) -> Option<serde_json::Value> {
    messages.iter().rev().find_map(|message| {
        message.parts.iter().rev().find_map(|part| match part {
            Part::ToolInvocation(invocation) => invocation.result().cloned(),
            _ => None,
        })
    })
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn check_credentials(&self) -> ChatResult<()> {
        match &self.credential_error {
            Some(message) => Err(ChatError::Credential {
                provider: "scripted".to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn stream(&self, request: CompletionRequest) -> ChatResult<ProviderStream> {
        let steps = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::echo_turn(&request.messages));
        let tool_result = latest_tool_result(&request.messages);
        let input_tokens: u64 = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        self.requests.lock().push(request);

        let delay = self.step_delay;
        Ok(Box::pin(async_stream::stream! {
            let mut output_tokens = 0u64;
            let mut saw_tool_call = false;

            for step in steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match step {
                    ScriptStep::Text(text) => {
                        output_tokens += 1;
                        yield Ok(ProviderEvent::TextDelta(text));
                    }
                    ScriptStep::Reasoning(text) => {
                        yield Ok(ProviderEvent::ReasoningDelta(text));
                    }
                    ScriptStep::ToolCall { tool_call_id, tool_name, args } => {
                        saw_tool_call = true;
                        yield Ok(ProviderEvent::ToolCallDelta {
                            tool_call_id: tool_call_id.clone(),
                            tool_name: tool_name.clone(),
                            args_delta: args.to_string(),
                        });
                        yield Ok(ProviderEvent::ToolCall { tool_call_id, tool_name, args });
                    }
                    ScriptStep::EchoToolResult { prefix } => {
                        let result = tool_result
                            .as_ref()
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "no tool result".to_string());
                        output_tokens += 1;
                        yield Ok(ProviderEvent::TextDelta(format!("{prefix}{result}")));
                    }
                    ScriptStep::Fail(err) => {
                        yield Err(err);
                        return;
                    }
                    ScriptStep::Stall => {
                        futures::future::pending::<()>().await;
                    }
                }
            }

            let reason = if saw_tool_call {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            };
            yield Ok(ProviderEvent::Finish {
                reason,
                usage: Some(TokenUsage::new(input_tokens, output_tokens)),
            });
        }))
    }
}
