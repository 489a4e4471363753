use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::provider::{CompletionRequest, ModelProvider, ProviderEvent, ProviderStream};
use crate::errors::{ChatError, ChatResult, ErrorKind};
use crate::models::{FinishReason, Frame, Message, TerminalReason, TokenUsage, ToolInvocation, ToolState};
use crate::repositories::{DualBackingStore, TranscriptRepository};
use crate::settings::{EngineSettings, ModelConfig};
use crate::streams::Producer;
use crate::tools::{ToolPolicy, ToolRegistry};

/// Lifecycle of one generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationState {
    Pending,
    Streaming,
    /// Waiting for a human decision on a tool call.
    Suspended,
    Completed,
    Failed(ErrorKind),
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationState::Completed | GenerationState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            GenerationState::Pending => "pending",
            GenerationState::Streaming => "streaming",
            GenerationState::Suspended => "suspended",
            GenerationState::Completed => "completed",
            GenerationState::Failed(_) => "failed",
        }
    }
}

enum WorkerControl {
    ResolveTool {
        tool_call_id: String,
        result: serde_json::Value,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    Cancel,
}

/// Control handle for a running generation.
#[derive(Clone)]
pub struct GenerationHandle {
    pub conversation_id: String,
    pub stream_id: String,
    pub assistant_message_id: String,
    control: mpsc::Sender<WorkerControl>,
    state: watch::Receiver<GenerationState>,
}

impl GenerationHandle {
    pub fn state(&self) -> GenerationState {
        self.state.borrow().clone()
    }

    /// Deliver a human decision for a suspended tool call.
    pub async fn resolve_tool(
        &self,
        tool_call_id: &str,
        result: serde_json::Value,
    ) -> ChatResult<()> {
        let not_delivered = |message: &str| ChatError::ToolDelivery {
            tool_call_id: tool_call_id.to_string(),
            message: message.to_string(),
        };

        let (reply, response) = oneshot::channel();
        self.control
            .send(WorkerControl::ResolveTool {
                tool_call_id: tool_call_id.to_string(),
                result,
                reply,
            })
            .await
            .map_err(|_| not_delivered("generation has already finished"))?;

        response
            .await
            .map_err(|_| not_delivered("generation has already finished"))?
    }

    /// Ask the worker to stop. Cooperative: the worker completes with what it has.
    pub async fn cancel(&self) {
        // A closed channel means the worker already finished.
        let _ = self.control.send(WorkerControl::Cancel).await;
    }

    /// Wait until the generation reaches a terminal state.
    pub async fn finished(&self) -> GenerationState {
        let mut state = self.state.clone();
        let current = state
            .wait_for(GenerationState::is_terminal)
            .await
            .map(|current| current.clone());
        match current {
            Ok(current) => current,
            Err(_) => state.borrow().clone(),
        }
    }
}

/// Conversations with a generation in flight. At most one per conversation.
#[derive(Clone, Default)]
pub struct ActiveGenerations {
    inner: Arc<Mutex<HashMap<String, Option<GenerationHandle>>>>,
}

impl ActiveGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the conversation's generation slot.
    pub fn claim(&self, conversation_id: &str) -> ChatResult<GenerationClaim> {
        let mut active = self.inner.lock();
        if active.contains_key(conversation_id) {
            return Err(ChatError::AlreadyStreaming {
                conversation_id: conversation_id.to_string(),
            });
        }
        active.insert(conversation_id.to_string(), None);
        Ok(GenerationClaim {
            conversation_id: conversation_id.to_string(),
            generations: self.clone(),
        })
    }

    pub fn get(&self, conversation_id: &str) -> Option<GenerationHandle> {
        self.inner.lock().get(conversation_id).cloned().flatten()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.inner.lock().contains_key(conversation_id)
    }
}

/// Holds a conversation's generation slot; dropping it frees the slot.
pub struct GenerationClaim {
    conversation_id: String,
    generations: ActiveGenerations,
}

impl GenerationClaim {
    fn attach(&self, handle: GenerationHandle) {
        self.generations
            .inner
            .lock()
            .insert(self.conversation_id.clone(), Some(handle));
    }
}

impl Drop for GenerationClaim {
    fn drop(&mut self) {
        self.generations.inner.lock().remove(&self.conversation_id);
    }
}

/// Everything a worker needs to run one generation.
pub struct GenerationJob {
    pub conversation_id: String,
    pub assistant_message_id: String,
    /// Persisted transcript the model answers, oldest first.
    pub history: Vec<Message>,
    pub model: ModelConfig,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: ToolRegistry,
    pub store: DualBackingStore,
    pub settings: EngineSettings,
}

enum RoundOutcome {
    Finished(Option<TokenUsage>),
    Cancelled,
    Failed(ChatError),
}

enum SuspendOutcome {
    Resumed,
    Cancelled,
    TimedOut,
}

enum Outcome {
    Completed(FinishReason),
    Failed(ChatError),
}

/// Drives one model invocation: publishes frames, runs or suspends on tool
/// calls, and persists the assistant message exactly once on completion.
pub struct GenerationWorker {
    job: GenerationJob,
    assistant: Message,
    usage: Option<TokenUsage>,
    /// Tool calls requested in the current round, in request order.
    requested_calls: Vec<String>,
    partial_args: HashMap<String, String>,
    producer: Producer,
    claim: Option<GenerationClaim>,
    control: mpsc::Receiver<WorkerControl>,
    state: watch::Sender<GenerationState>,
}

impl GenerationWorker {
    /// Start the worker on the runtime and return its handle.
    pub fn spawn(job: GenerationJob, producer: Producer, claim: GenerationClaim) -> GenerationHandle {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(GenerationState::Pending);

        let handle = GenerationHandle {
            conversation_id: job.conversation_id.clone(),
            stream_id: producer.stream_id().to_string(),
            assistant_message_id: job.assistant_message_id.clone(),
            control: control_tx,
            state: state_rx,
        };
        claim.attach(handle.clone());

        let worker = GenerationWorker {
            assistant: Message::assistant(job.assistant_message_id.clone(), job.conversation_id.clone()),
            job,
            usage: None,
            requested_calls: Vec::new(),
            partial_args: HashMap::new(),
            producer,
            claim: Some(claim),
            control: control_rx,
            state: state_tx,
        };

        tokio::spawn(worker.run());
        handle
    }

    fn set_state(&self, state: GenerationState) {
        debug!(
            conversation_id = %self.job.conversation_id,
            stream_id = %self.producer.stream_id(),
            state = state.name(),
            "Generation state changed"
        );
        self.state.send_replace(state);
    }

    fn publish(&self, frame: Frame) {
        if let Err(e) = self.producer.publish(frame) {
            warn!(stream_id = %self.producer.stream_id(), error = %e, "Failed to publish frame");
        }
    }

    async fn run(mut self) {
        self.set_state(GenerationState::Streaming);
        self.publish(Frame::Start {
            conversation_id: self.job.conversation_id.clone(),
            message_id: self.assistant.id.clone(),
        });

        let outcome = self.generate().await;
        self.finish(outcome).await;
    }

    async fn generate(&mut self) -> Outcome {
        let mut tool_rounds = 0;

        loop {
            let stream = match self.open_stream().await {
                Ok(stream) => stream,
                Err(e) => return Outcome::Failed(e),
            };

            match self.consume(stream).await {
                RoundOutcome::Cancelled => return Outcome::Completed(FinishReason::Cancelled),
                RoundOutcome::Failed(e) => return Outcome::Failed(e),
                RoundOutcome::Finished(usage) => {
                    if let Some(usage) = usage {
                        self.usage.get_or_insert_with(TokenUsage::default).accumulate(&usage);
                    }
                }
            }

            let calls = std::mem::take(&mut self.requested_calls);
            if calls.is_empty() {
                return Outcome::Completed(FinishReason::Stop);
            }

            tool_rounds += 1;
            if tool_rounds > self.job.settings.max_tool_rounds {
                warn!(
                    conversation_id = %self.job.conversation_id,
                    rounds = tool_rounds,
                    "Tool round limit reached"
                );
                return Outcome::Completed(FinishReason::Length);
            }

            if self.run_tools(&calls).await {
                match self.suspend().await {
                    SuspendOutcome::Resumed => {}
                    SuspendOutcome::Cancelled => {
                        self.settle_awaiting("cancelled");
                        return Outcome::Completed(FinishReason::Cancelled);
                    }
                    SuspendOutcome::TimedOut => {
                        self.settle_awaiting("timed_out");
                        return Outcome::Completed(FinishReason::DecisionTimeout);
                    }
                }
            }
        }
    }

    async fn open_stream(&self) -> ChatResult<ProviderStream> {
        let mut messages = self.job.history.clone();
        if !self.assistant.parts.is_empty() {
            messages.push(self.assistant.clone());
        }
        let request = CompletionRequest {
            model: self.job.model.clone(),
            messages,
            tools: self.job.tools.definitions(),
        };

        let timeout = self.job.settings.provider_read_timeout();
        match tokio::time::timeout(timeout, self.job.provider.stream(request)).await {
            Ok(result) => result,
            Err(_) => Err(read_timeout(timeout)),
        }
    }

    /// Read one provider round, applying and publishing each event.
    async fn consume(&mut self, mut stream: ProviderStream) -> RoundOutcome {
        let timeout = self.job.settings.provider_read_timeout();

        loop {
            tokio::select! {
                biased;

                Some(control) = self.control.recv() => match control {
                    WorkerControl::Cancel => return RoundOutcome::Cancelled,
                    WorkerControl::ResolveTool { tool_call_id, reply, .. } => {
                        let _ = reply.send(Err(ChatError::ToolDelivery {
                            tool_call_id,
                            message: "generation is not waiting for a decision".into(),
                        }));
                    }
                },

                item = tokio::time::timeout(timeout, stream.next()) => match item {
                    Err(_) => return RoundOutcome::Failed(read_timeout(timeout)),
                    Ok(None) => return RoundOutcome::Finished(None),
                    Ok(Some(Err(e))) => return RoundOutcome::Failed(e),
                    Ok(Some(Ok(ProviderEvent::Finish { usage, .. }))) => {
                        return RoundOutcome::Finished(usage);
                    }
                    Ok(Some(Ok(event))) => self.apply_event(event),
                },
            }
        }
    }

    fn apply_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::TextDelta(delta) => {
                self.assistant.push_text(&delta);
                self.publish(Frame::Text { delta });
            }
            ProviderEvent::ReasoningDelta(delta) => {
                self.assistant.push_reasoning(&delta);
                self.publish(Frame::Reasoning { delta });
            }
            ProviderEvent::ToolCallDelta {
                tool_call_id,
                tool_name,
                args_delta,
            } => {
                let partial = self.partial_args.entry(tool_call_id.clone()).or_default();
                partial.push_str(&args_delta);
                let args = serde_json::from_str(partial).unwrap_or(serde_json::Value::Null);
                self.upsert_and_publish(ToolInvocation::new(
                    tool_call_id,
                    tool_name,
                    args,
                    ToolState::PartialCall,
                ));
            }
            ProviderEvent::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                self.partial_args.remove(&tool_call_id);
                if !self.requested_calls.contains(&tool_call_id) {
                    self.requested_calls.push(tool_call_id.clone());
                }
                self.upsert_and_publish(ToolInvocation::new(
                    tool_call_id,
                    tool_name,
                    args,
                    ToolState::Call,
                ));
            }
            ProviderEvent::Finish { .. } => {}
        }
    }

    fn upsert_and_publish(&mut self, invocation: ToolInvocation) {
        match self.assistant.upsert_tool_invocation(invocation.clone()) {
            Ok(()) => self.publish(Frame::ToolCall { invocation }),
            Err(e) => warn!(error = %e, "Ignoring out-of-order tool call update"),
        }
    }

    /// Run automatic tools and mark confirmation tools as awaiting input.
    /// Returns whether any call now waits for a human decision.
    async fn run_tools(&mut self, calls: &[String]) -> bool {
        let mut awaiting = false;

        for tool_call_id in calls {
            let Some(invocation) = self.assistant.tool_invocation(tool_call_id).cloned() else {
                continue;
            };

            let Some(tool) = self.job.tools.get(&invocation.tool_name) else {
                warn!(tool = %invocation.tool_name, "Model requested an unknown tool");
                self.record_tool_result(
                    tool_call_id,
                    serde_json::json!({ "error": format!("unknown tool '{}'", invocation.tool_name) }),
                );
                continue;
            };

            match tool.policy() {
                ToolPolicy::RequiresConfirmation => {
                    let mut waiting = invocation.clone();
                    waiting.state = ToolState::AwaitingUserInput;
                    self.upsert_and_publish(waiting);
                    awaiting = true;
                }
                ToolPolicy::Automatic => {
                    let timeout = self.job.settings.tool_timeout();
                    info!(tool = %invocation.tool_name, tool_call_id = %tool_call_id, "Running tool");
                    let result = match tokio::time::timeout(timeout, tool.execute(invocation.args.clone())).await {
                        Ok(Ok(value)) => value,
                        Ok(Err(e)) => serde_json::json!({ "error": e.to_string() }),
                        Err(_) => serde_json::json!({
                            "error": format!("tool timed out after {}s", timeout.as_secs())
                        }),
                    };
                    self.record_tool_result(tool_call_id, result);
                }
            }
        }

        awaiting
    }

    /// Close out calls nobody answered, so the stored reply holds no open prompt.
    fn settle_awaiting(&mut self, status: &str) {
        for invocation in self.assistant.awaiting_tools() {
            debug!(tool_call_id = %invocation.tool_call_id, status, "Settling unanswered tool call");
            self.record_tool_result(
                &invocation.tool_call_id,
                serde_json::json!({ "status": status }),
            );
        }
    }

    fn record_tool_result(&mut self, tool_call_id: &str, result: serde_json::Value) {
        match self.assistant.apply_tool_result(tool_call_id, result.clone()) {
            Ok(()) => self.publish(Frame::ToolResult {
                tool_call_id: tool_call_id.to_string(),
                result,
            }),
            Err(e) => warn!(tool_call_id, error = %e, "Could not record tool result"),
        }
    }

    /// Wait for decisions on every awaiting tool call.
    async fn suspend(&mut self) -> SuspendOutcome {
        self.set_state(GenerationState::Suspended);
        let deadline = tokio::time::sleep(self.job.settings.suspend_timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        conversation_id = %self.job.conversation_id,
                        "No tool decision arrived before the suspend timeout"
                    );
                    return SuspendOutcome::TimedOut;
                }
                Some(control) = self.control.recv() => match control {
                    WorkerControl::Cancel => return SuspendOutcome::Cancelled,
                    WorkerControl::ResolveTool { tool_call_id, result, reply } => {
                        let outcome = self.accept_decision(&tool_call_id, result);
                        let _ = reply.send(outcome);
                        if self.assistant.awaiting_tools().is_empty() {
                            self.set_state(GenerationState::Streaming);
                            return SuspendOutcome::Resumed;
                        }
                    }
                },
            }
        }
    }

    fn accept_decision(&mut self, tool_call_id: &str, result: serde_json::Value) -> ChatResult<()> {
        let not_delivered = |message: String| ChatError::ToolDelivery {
            tool_call_id: tool_call_id.to_string(),
            message,
        };

        let invocation = self
            .assistant
            .tool_invocation(tool_call_id)
            .cloned()
            .ok_or_else(|| not_delivered("unknown tool call".into()))?;
        if !invocation.is_awaiting_user_input() {
            return Err(not_delivered(format!(
                "tool call is in state {}",
                invocation.state.name()
            )));
        }

        let result = match self.job.tools.get(&invocation.tool_name) {
            // Still suspended: the client may answer again.
            Some(tool) => tool.accept_decision(result).map_err(|e| {
                ChatError::Validation(format!("decision for {tool_call_id} rejected: {e}"))
            })?,
            None => result,
        };

        info!(tool_call_id, tool = %invocation.tool_name, "Tool decision received");
        self.record_tool_result(tool_call_id, result);
        Ok(())
    }

    async fn finish(mut self, outcome: Outcome) {
        let outcome = match outcome {
            Outcome::Completed(reason) => match self.persist().await {
                Ok(sequence) => {
                    self.publish(Frame::Finish {
                        reason,
                        usage: self.usage.clone(),
                        sequence,
                    });
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Outcome::Failed(e) => Err(e),
        };

        let terminal = match outcome {
            Ok(()) => {
                self.set_state(GenerationState::Completed);
                TerminalReason::Done
            }
            Err(e) => {
                let kind = e.kind();
                warn!(
                    conversation_id = %self.job.conversation_id,
                    stream_id = %self.producer.stream_id(),
                    kind = %kind,
                    error = %e,
                    "Generation failed"
                );
                self.publish(Frame::Error {
                    kind,
                    message: e.to_string(),
                });
                self.set_state(GenerationState::Failed(kind));
                TerminalReason::Error(kind)
            }
        };

        // Free the conversation before readers observe the end of the stream.
        self.claim.take();
        let GenerationWorker { producer, .. } = self;
        producer.close(terminal);
    }

    /// The single durable write of the assistant message.
    async fn persist(&mut self) -> ChatResult<Option<i64>> {
        if self.assistant.parts.is_empty() {
            debug!(conversation_id = %self.job.conversation_id, "Nothing to persist");
            return Ok(None);
        }

        if let Some(usage) = self.usage.as_mut() {
            if let (Some(input), Some(output)) = (
                self.job.model.cost_per_million_input_tokens,
                self.job.model.cost_per_million_output_tokens,
            ) {
                usage.calculate_cost(input, output);
            }
        }

        let mut message = self.assistant.clone();
        message.usage = self.usage.clone();
        let stored = self
            .job
            .store
            .append(&self.job.conversation_id, message)
            .await?;

        info!(
            conversation_id = %self.job.conversation_id,
            message_id = %stored.id,
            sequence = stored.sequence,
            "Persisted assistant message"
        );
        self.assistant.sequence = stored.sequence;
        Ok(Some(stored.sequence))
    }
}

fn read_timeout(timeout: Duration) -> ChatError {
    ChatError::timeout(format!(
        "model provider did not respond within {}s",
        timeout.as_secs()
    ))
}
