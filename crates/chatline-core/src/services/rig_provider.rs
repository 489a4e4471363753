use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rig::OneOrMany;
use rig::client::CompletionClient;
use rig::completion::message::{
    AssistantContent, Reasoning, ReasoningContent, ToolCall, ToolFunction, ToolResultContent,
    UserContent,
};
use rig::completion::{CompletionError, CompletionModel, GetTokenUsage, Message as RigMessage};
use rig::streaming::StreamedAssistantContent;
use tracing::debug;

use super::provider::{CompletionRequest, ModelProvider, ProviderEvent, ProviderStream};
use crate::errors::{ChatError, ChatResult};
use crate::models::{FinishReason, Message, Part, Role, TokenUsage};
use crate::settings::{ProviderConfig, ProviderType};

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Map a rig completion failure onto the engine taxonomy.
pub fn classify_completion_error(err: impl std::fmt::Display) -> ChatError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("timed out") || lower.contains("timeout") {
        ChatError::timeout(message)
    } else if lower.contains("error sending request")
        || lower.contains("connection")
        || lower.contains("dns error")
    {
        ChatError::Network {
            message,
            timeout: false,
        }
    } else {
        ChatError::provider(http_status_in(&lower), message)
    }
}

fn http_status_in(message: &str) -> Option<u16> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .filter(|word| word.len() == 3)
        .filter_map(|word| word.parse::<u16>().ok())
        .find(|status| (400..600).contains(status))
}

/// Translate a transcript into rig messages.
///
/// Resolved tool invocations become an assistant tool call followed by a
/// user tool result, in part order. Invocations still awaiting a decision are
/// left out. System messages are returned separately for the preamble.
pub fn to_rig_messages(messages: &[Message]) -> (Vec<RigMessage>, Vec<String>) {
    let mut out = Vec::new();
    let mut system = Vec::new();

    for message in messages {
        match message.role {
            Role::System => system.push(message.content.clone()),
            Role::User => {
                if !message.content.is_empty() {
                    out.push(RigMessage::user(message.content.clone()));
                }
            }
            Role::Assistant => {
                let mut content: Vec<AssistantContent> = Vec::new();
                for part in &message.parts {
                    match part {
                        Part::Text { text } if !text.is_empty() => {
                            content.push(AssistantContent::text(text.clone()));
                        }
                        Part::ToolInvocation(invocation) => {
                            let Some(result) = invocation.result() else {
                                continue;
                            };
                            content.push(AssistantContent::ToolCall(ToolCall {
                                id: invocation.tool_call_id.clone(),
                                call_id: Some(invocation.tool_call_id.clone()),
                                function: ToolFunction {
                                    name: invocation.tool_name.clone(),
                                    arguments: invocation.args.clone(),
                                },
                                signature: None,
                                additional_params: None,
                            }));
                            if let Ok(turn) = OneOrMany::many(std::mem::take(&mut content)) {
                                out.push(RigMessage::Assistant {
                                    id: None,
                                    content: turn,
                                });
                            }
                            out.push(RigMessage::User {
                                content: OneOrMany::one(UserContent::tool_result_with_call_id(
                                    invocation.tool_call_id.clone(),
                                    invocation.tool_call_id.clone(),
                                    OneOrMany::one(ToolResultContent::text(result.to_string())),
                                )),
                            });
                        }
                        _ => {}
                    }
                }
                if let Ok(turn) = OneOrMany::many(content) {
                    out.push(RigMessage::Assistant {
                        id: None,
                        content: turn,
                    });
                }
            }
        }
    }

    (out, system)
}

/// Translate rig's streamed assistant content into provider events.
fn rig_events<R, S>(stream: S) -> ProviderStream
where
    R: GetTokenUsage + Send + 'static,
    S: Stream<Item = Result<StreamedAssistantContent<R>, CompletionError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut stream = Box::pin(stream);
        let mut saw_tool_call = false;
        let mut streamed_reasoning = false;
        let mut usage = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamedAssistantContent::Text(text)) => {
                    yield Ok(ProviderEvent::TextDelta(text.text));
                }
                Ok(StreamedAssistantContent::ToolCall { tool_call, .. }) => {
                    saw_tool_call = true;
                    let tool_call_id = tool_call.call_id.clone()
                        .unwrap_or_else(|| tool_call.id.clone());
                    yield Ok(ProviderEvent::ToolCall {
                        tool_call_id,
                        tool_name: tool_call.function.name,
                        args: tool_call.function.arguments,
                    });
                }
                Ok(StreamedAssistantContent::ReasoningDelta { reasoning, .. }) => {
                    streamed_reasoning = true;
                    yield Ok(ProviderEvent::ReasoningDelta(reasoning));
                }
                // A closed block repeats the deltas that preceded it.
                Ok(StreamedAssistantContent::Reasoning(reasoning)) => {
                    if !std::mem::take(&mut streamed_reasoning) {
                        let text = readable_reasoning(&reasoning);
                        if !text.is_empty() {
                            yield Ok(ProviderEvent::ReasoningDelta(text));
                        }
                    }
                }
                Ok(StreamedAssistantContent::Final(response)) => {
                    usage = response
                        .token_usage()
                        .filter(|u| u.input_tokens > 0 || u.output_tokens > 0)
                        .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens));
                }
                Ok(StreamedAssistantContent::ToolCallDelta { .. }) => {}
                Err(e) => {
                    yield Err(classify_completion_error(e));
                    return;
                }
            }
        }

        let reason = if saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        yield Ok(ProviderEvent::Finish { reason, usage });
    })
}

/// Plain-text reasoning and summaries; encrypted and redacted blocks stay opaque.
fn readable_reasoning(reasoning: &Reasoning) -> String {
    reasoning
        .content
        .iter()
        .filter_map(|content| match content {
            ReasoningContent::Text { text, .. } => Some(text.as_str()),
            ReasoningContent::Summary(summary) => Some(summary.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stream a completion request through any rig completion model.
macro_rules! stream_completion {
    ($model:expr, $prompt:expr, $history:expr, $preamble:expr, $request:expr) => {{
        let request = $request;
        let mut builder = $model
            .completion_request($prompt)
            .messages($history)
            .preamble($preamble)
            .temperature(request.model.temperature as f64);

        if !request.tools.is_empty() {
            builder = builder.tools(request.tools.clone());
        }
        if let Some(max_tokens) = request.model.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        if let Some(effort) = &request.model.reasoning_effort {
            builder = builder.additional_params(serde_json::json!({ "reasoning_effort": effort }));
        }

        let stream = builder.stream().await.map_err(classify_completion_error)?;
        rig_events(stream)
    }};
}

/// Model provider backed by rig-core clients.
pub struct RigProvider {
    config: ProviderConfig,
}

impl RigProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn api_key(&self) -> ChatResult<String> {
        self.config
            .resolved_api_key()
            .ok_or_else(|| ChatError::Credential {
                provider: self.config.provider_type.display_name().to_string(),
                message: match self.config.provider_type.api_key_env_var() {
                    Some(var) => format!("no API key configured; set one in settings or {var}"),
                    None => "no API key configured".to_string(),
                },
            })
    }

    fn client_error(&self, err: impl std::fmt::Display) -> ChatError {
        ChatError::Credential {
            provider: self.config.provider_type.display_name().to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ModelProvider for RigProvider {
    fn name(&self) -> &str {
        self.config.provider_type.display_name()
    }

    fn check_credentials(&self) -> ChatResult<()> {
        if self.config.provider_type.requires_api_key() {
            self.api_key()?;
        }
        Ok(())
    }

    async fn stream(&self, request: CompletionRequest) -> ChatResult<ProviderStream> {
        let (mut history, system) = to_rig_messages(&request.messages);
        let prompt = history
            .pop()
            .ok_or_else(|| ChatError::Validation("conversation has no messages".into()))?;

        let preamble = std::iter::once(request.model.preamble.clone())
            .chain(system)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        debug!(
            provider = self.name(),
            model = %request.model.model_identifier,
            history = history.len(),
            tools = request.tools.len(),
            "Starting provider stream"
        );

        let model_id = request.model.model_identifier.clone();
        let stream = match self.config.provider_type {
            ProviderType::OpenAI => {
                let client = rig::providers::openai::Client::new(&self.api_key()?)
                    .map_err(|e| self.client_error(e))?;
                let model = client.completion_model(&model_id);
                stream_completion!(model, prompt, history, preamble, &request)
            }
            ProviderType::Anthropic => {
                let client = rig::providers::anthropic::Client::new(&self.api_key()?)
                    .map_err(|e| self.client_error(e))?;
                let model = client.completion_model(&model_id);
                stream_completion!(model, prompt, history, preamble, &request)
            }
            ProviderType::Gemini => {
                let client = rig::providers::gemini::Client::new(&self.api_key()?)
                    .map_err(|e| self.client_error(e))?;
                let model = client.completion_model(&model_id);
                stream_completion!(model, prompt, history, preamble, &request)
            }
            ProviderType::Ollama => {
                let url = self
                    .config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
                let client = rig::providers::ollama::Client::builder()
                    .api_key(rig::client::Nothing)
                    .base_url(&url)
                    .build()
                    .map_err(|e| self.client_error(e))?;
                let model = client.completion_model(&model_id);
                stream_completion!(model, prompt, history, preamble, &request)
            }
        };

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, ProviderErrorKind};
    use crate::models::{ToolInvocation, ToolState};
    use serde_json::json;

    #[derive(Clone)]
    struct FinalUsage(u64, u64);

    impl GetTokenUsage for FinalUsage {
        fn token_usage(&self) -> Option<rig::completion::Usage> {
            Some(rig::completion::Usage {
                input_tokens: self.0,
                output_tokens: self.1,
                ..rig::completion::Usage::new()
            })
        }
    }

    type Item = Result<StreamedAssistantContent<FinalUsage>, CompletionError>;

    async fn collect(items: Vec<Item>) -> Vec<ChatResult<ProviderEvent>> {
        rig_events(futures::stream::iter(items)).collect().await
    }

    #[tokio::test]
    async fn test_rig_stream_carries_reasoning_and_usage() {
        let call = ToolCall::new(
            "toolu_1".into(),
            ToolFunction::new("get_user_location".into(), json!({"purpose": "weather"})),
        );
        let events = collect(vec![
            Ok(StreamedAssistantContent::ReasoningDelta {
                id: None,
                reasoning: "The user ".into(),
            }),
            Ok(StreamedAssistantContent::ReasoningDelta {
                id: None,
                reasoning: "wants weather.".into(),
            }),
            Ok(StreamedAssistantContent::Reasoning(Reasoning::new(
                "The user wants weather.",
            ))),
            Ok(StreamedAssistantContent::Reasoning(Reasoning::redacted("opaque"))),
            Ok(StreamedAssistantContent::Reasoning(Reasoning::summaries(vec![
                "Needs a location.".into(),
            ]))),
            Ok(StreamedAssistantContent::text("Checking.")),
            Ok(StreamedAssistantContent::ToolCall {
                tool_call: call,
                internal_call_id: "internal-1".into(),
            }),
            Ok(StreamedAssistantContent::Final(FinalUsage(120, 45))),
        ])
        .await;

        let events: Vec<ProviderEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![
                ProviderEvent::ReasoningDelta("The user ".into()),
                ProviderEvent::ReasoningDelta("wants weather.".into()),
                ProviderEvent::ReasoningDelta("Needs a location.".into()),
                ProviderEvent::TextDelta("Checking.".into()),
                ProviderEvent::ToolCall {
                    tool_call_id: "toolu_1".into(),
                    tool_name: "get_user_location".into(),
                    args: json!({"purpose": "weather"}),
                },
                ProviderEvent::Finish {
                    reason: FinishReason::ToolCalls,
                    usage: Some(TokenUsage::new(120, 45)),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_rig_stream_without_usage_or_after_error() {
        let events = collect(vec![
            Ok(StreamedAssistantContent::text("Hi")),
            Ok(StreamedAssistantContent::Final(FinalUsage(0, 0))),
        ])
        .await;
        assert_eq!(
            events.last(),
            Some(&Ok(ProviderEvent::Finish {
                reason: FinishReason::Stop,
                usage: None,
            }))
        );

        let events = collect(vec![
            Ok(StreamedAssistantContent::text("Hi")),
            Err(CompletionError::ProviderError("status 503 overloaded".into())),
            Ok(StreamedAssistantContent::text("never")),
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(ChatError::Provider { .. })));
    }

    #[test]
    fn test_classify_completion_errors() {
        assert_eq!(
            classify_completion_error("HttpError: operation timed out").kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify_completion_error("error sending request for url").kind(),
            ErrorKind::Network
        );
        assert_eq!(
            classify_completion_error("ProviderError: status 429 Too Many Requests"),
            ChatError::Provider {
                kind: ProviderErrorKind::RateLimited,
                message: "ProviderError: status 429 Too Many Requests".into(),
            }
        );
    }

    #[test]
    fn test_resolved_tool_becomes_call_and_result() {
        let mut reply = Message::assistant("a1", "c1");
        reply.push_text("Checking.");
        reply.parts.push(Part::ToolInvocation(ToolInvocation::new(
            "call-1",
            "get_user_location",
            json!({}),
            ToolState::Result(json!({"status": "denied", "reason": "no"})),
        )));
        reply.push_text("Without your location I can't say.");

        let mut system = Message::new("s1", "c1", Role::System);
        system.content = "Be brief.".into();

        let (messages, preamble) = to_rig_messages(&[
            system,
            Message::user("c1", "What's the weather?"),
            reply,
        ]);

        assert_eq!(preamble, vec!["Be brief.".to_string()]);
        // user, assistant(text + call), user(result), assistant(text)
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[1], RigMessage::Assistant { .. }));
        assert!(matches!(messages[2], RigMessage::User { .. }));
        assert!(matches!(messages[3], RigMessage::Assistant { .. }));
    }

    #[test]
    fn test_pending_tool_call_is_omitted() {
        let mut reply = Message::assistant("a1", "c1");
        reply.parts.push(Part::ToolInvocation(ToolInvocation::new(
            "call-1",
            "get_user_location",
            json!({}),
            ToolState::AwaitingUserInput,
        )));

        let (messages, _) = to_rig_messages(&[Message::user("c1", "hi"), reply]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_missing_key_is_credential_error() {
        let provider = RigProvider::new(ProviderConfig::new("anthropic", ProviderType::Anthropic));
        // Only meaningful when the environment has no key set.
        if std::env::var("CHATLINE_ANTHROPIC_API_KEY").is_err() {
            let err = provider.check_credentials().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Credential);
        }

        let ollama = RigProvider::new(ProviderConfig::new("ollama", ProviderType::Ollama));
        assert!(ollama.check_credentials().is_ok());
    }
}
