use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backend::ChatBackend;
use super::resume::{ResumePlan, StreamCursor, plan_resume};
use crate::errors::{ChatError, DisplayableError};
use crate::models::{Frame, Message, Notice, NoticeStore, Role, TerminalReason, ToolInvocation};
use crate::services::GenerationRequest;
use crate::settings::{EngineSettings, ResumePolicy};
use crate::streams::{StreamEvent, StreamStatus};

/// Where the session is in the submit/stream cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Ready,
    /// A generation was requested and no frame has arrived yet.
    Submitted,
    Streaming,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Ready => "ready",
            SessionStatus::Submitted => "submitted",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Error => "error",
        }
    }
}

/// Observable state handed to the UI layer.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub status: SessionStatus,
    /// False while a dropped subscription is being re-established.
    pub connected: bool,
    pub error: Option<DisplayableError>,
    pub notices: Vec<Notice>,
    pub awaiting_tools: Vec<ToolInvocation>,
}

struct ActiveStream {
    cursor: StreamCursor,
    events: BoxStream<'static, StreamEvent>,
    /// Error carried by an `error` frame, reported once the stream closes.
    error: Option<ChatError>,
}

/// Client-side state machine for one open conversation.
///
/// Every public operation resolves failures into the `error` status plus a
/// displayable error; the message list is never rolled back.
pub struct ClientSessionController {
    backend: Arc<dyn ChatBackend>,
    conversation_id: String,
    model_id: String,
    messages: Vec<Message>,
    input: String,
    status: SessionStatus,
    error: Option<DisplayableError>,
    connected: bool,
    notices: NoticeStore,
    stream: Option<ActiveStream>,
    resume_policy: ResumePolicy,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl ClientSessionController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        conversation_id: impl Into<String>,
        model_id: impl Into<String>,
        settings: &EngineSettings,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot {
            messages: Vec::new(),
            status: SessionStatus::Ready,
            connected: true,
            error: None,
            notices: Vec::new(),
            awaiting_tools: Vec::new(),
        });

        Self {
            backend,
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            messages: Vec::new(),
            input: String::new(),
            status: SessionStatus::Ready,
            error: None,
            connected: true,
            notices: NoticeStore::new(settings.max_notices, settings.notice_ttl()),
            stream: None,
            resume_policy: settings.resume.clone(),
            snapshots,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn set_model(&mut self, model_id: impl Into<String>) {
        self.model_id = model_id.into();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&DisplayableError> {
        self.error.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Tool calls of the streaming reply that wait for a local human decision.
    /// Calls in earlier replies can no longer be answered.
    pub fn awaiting_tools(&self) -> Vec<ToolInvocation> {
        let Some(message_id) = self
            .stream
            .as_ref()
            .and_then(|s| s.cursor.message_id.as_deref())
        else {
            return Vec::new();
        };
        self.messages
            .iter()
            .find(|m| m.id == message_id)
            .map(Message::awaiting_tools)
            .unwrap_or_default()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&mut self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.messages.clone(),
            status: self.status,
            connected: self.connected,
            error: self.error.clone(),
            notices: self.notices.active(Instant::now()),
            awaiting_tools: self.awaiting_tools(),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.snapshots.send_replace(snapshot);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!(
                conversation_id = %self.conversation_id,
                from = self.status.as_str(),
                to = status.as_str(),
                "Session status changed"
            );
            self.status = status;
        }
    }

    fn accepts_input(&self) -> bool {
        self.stream.is_none()
            && matches!(self.status, SessionStatus::Ready | SessionStatus::Error)
    }

    /// Load the persisted transcript and, for signed-in sessions, re-attach to
    /// a generation that is still running. Returns whether a stream was attached.
    pub async fn mount(&mut self) -> bool {
        match self.backend.load_messages(&self.conversation_id).await {
            Ok(persisted) => self.merge_persisted(persisted),
            Err(ChatError::NotFound(_)) => {}
            Err(e) => self.report(e),
        }

        if self.backend.is_guest() {
            self.publish();
            return false;
        }
        let attached = self.resume().await;
        self.publish();
        attached
    }

    /// Re-attach to the conversation's latest stream if the broker still runs it;
    /// otherwise reconcile with the persisted transcript.
    pub async fn resume(&mut self) -> bool {
        if self.backend.is_guest() || self.stream.is_some() {
            return self.stream.is_some();
        }

        let handle = match self.backend.latest_stream(&self.conversation_id).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return false,
            Err(e) => {
                self.report(e);
                return false;
            }
        };

        match self.backend.stream_status(&handle.stream_id) {
            Some(StreamStatus::Live) => {
                info!(
                    conversation_id = %self.conversation_id,
                    stream_id = %handle.stream_id,
                    "Resuming live generation"
                );
                self.set_status(SessionStatus::Streaming);
                self.attach(handle.stream_id, 0)
            }
            status => {
                debug!(
                    conversation_id = %self.conversation_id,
                    stream_id = %handle.stream_id,
                    buffered = status.is_some(),
                    "Latest stream is finished; reconciling"
                );
                self.reconcile().await;
                false
            }
        }
    }

    /// Submit the input buffer.
    pub async fn submit_input(&mut self) -> bool {
        let text = std::mem::take(&mut self.input);
        let accepted = self.submit(&text).await;
        if !accepted && self.input.is_empty() {
            self.input = text;
        }
        accepted
    }

    /// Append a user turn optimistically and start a generation for it.
    pub async fn submit(&mut self, text: &str) -> bool {
        if !self.accepts_input() {
            debug!(status = self.status.as_str(), "Submit ignored while busy");
            return false;
        }
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        match self.backend.can_add_message().await {
            Ok(true) => {}
            Ok(false) => {
                let cap = self.backend.message_cap().unwrap_or_default();
                self.fail(ChatError::LimitReached { cap });
                return false;
            }
            Err(e) => {
                self.fail(e);
                return false;
            }
        }

        let message = Message::user(self.conversation_id.clone(), text);
        self.messages.push(message.clone());
        self.input.clear();
        self.error = None;
        self.set_status(SessionStatus::Submitted);
        self.publish();

        let request =
            GenerationRequest::submit(self.conversation_id.clone(), self.model_id.clone(), message);
        self.start(request).await
    }

    /// Discard the last reply and generate a new one for the prior user turn.
    pub async fn reload(&mut self) -> bool {
        if !self.accepts_input() {
            return false;
        }
        let Some(last_user) = self.messages.iter().rposition(|m| m.role == Role::User) else {
            debug!(conversation_id = %self.conversation_id, "Nothing to retry");
            return false;
        };
        self.messages.truncate(last_user + 1);
        let user_message = self.messages[last_user].clone();

        self.error = None;
        self.set_status(SessionStatus::Submitted);
        self.publish();

        // A turn the server never stored is sent again as a new submission.
        let request = if user_message.is_persisted() {
            GenerationRequest::retry(self.conversation_id.clone(), self.model_id.clone())
        } else {
            GenerationRequest::submit(
                self.conversation_id.clone(),
                self.model_id.clone(),
                user_message,
            )
        };
        self.start(request).await
    }

    async fn start(&mut self, request: GenerationRequest) -> bool {
        match self.backend.start_generation(request).await {
            Ok(ticket) => {
                if let Some(local) = self
                    .messages
                    .iter_mut()
                    .find(|m| m.id == ticket.user_message.id)
                {
                    *local = ticket.user_message.clone();
                }
                info!(
                    conversation_id = %self.conversation_id,
                    stream_id = %ticket.stream_id,
                    "Generation accepted"
                );
                self.attach(ticket.stream_id, 0)
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn attach(&mut self, stream_id: String, from_offset: usize) -> bool {
        match self.backend.subscribe(&stream_id, from_offset) {
            Ok(events) => {
                let mut cursor = StreamCursor::new(stream_id);
                cursor.next_offset = from_offset;
                self.stream = Some(ActiveStream {
                    cursor,
                    events,
                    error: None,
                });
                self.connected = true;
                self.publish();
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    /// Detach from the stream and cancel the generation. Content received so far stays.
    pub async fn stop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        debug!(
            conversation_id = %self.conversation_id,
            stream_id = %stream.cursor.stream_id,
            offset = stream.cursor.next_offset,
            "Stopping stream"
        );
        drop(stream);

        if let Err(e) = self.backend.cancel(&self.conversation_id).await {
            warn!(error = ?e, conversation_id = %self.conversation_id, "Failed to cancel generation");
        }
        self.set_status(SessionStatus::Ready);
        self.publish();
    }

    /// Forward a human decision to the generation. The decision is applied
    /// locally once accepted, or when the generation is gone; a rejected
    /// decision leaves the call awaiting so it can be answered again.
    pub async fn resolve_tool(&mut self, tool_call_id: &str, result: serde_json::Value) -> bool {
        let awaiting = self
            .messages
            .iter()
            .rev()
            .find_map(|m| m.tool_invocation(tool_call_id))
            .map(ToolInvocation::is_awaiting_user_input);
        let refusal = match awaiting {
            Some(true) => None,
            Some(false) => Some("tool call is not waiting for a decision"),
            None => Some("unknown tool call"),
        };
        if let Some(message) = refusal {
            self.report(ChatError::ToolDelivery {
                tool_call_id: tool_call_id.to_string(),
                message: message.into(),
            });
            self.publish();
            return false;
        }

        let delivered = match self
            .backend
            .resolve_tool(&self.conversation_id, tool_call_id, result.clone())
            .await
        {
            Ok(()) => true,
            Err(e @ ChatError::Validation(_)) => {
                warn!(tool_call_id, error = %e, "Tool decision rejected");
                self.report(e);
                self.publish();
                return false;
            }
            Err(e) => {
                warn!(tool_call_id, error = %e, "Tool decision not delivered");
                self.report(e);
                false
            }
        };

        if let Some(message) = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.tool_invocation(tool_call_id).is_some())
        {
            if let Err(e) = message.apply_tool_result(tool_call_id, result) {
                warn!(tool_call_id, error = %e, "Could not apply tool decision locally");
            }
        }
        self.publish();
        delivered
    }

    /// Process one stream event. Returns false once there is nothing more to read.
    pub async fn poll_stream(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        let more = match stream.events.next().await {
            Some(StreamEvent::Frame { offset, frame }) => {
                self.apply_frame(offset, frame);
                true
            }
            Some(StreamEvent::Closed(reason)) => {
                self.finish_stream(reason);
                false
            }
            None => self.recover_stream().await,
        };
        self.publish();
        more
    }

    /// Read the stream until it ends or a tool call waits for a human decision.
    pub async fn drive(&mut self) {
        while self.poll_stream().await {
            if !self.awaiting_tools().is_empty() {
                debug!(conversation_id = %self.conversation_id, "Waiting for a tool decision");
                break;
            }
        }
    }

    fn apply_frame(&mut self, offset: usize, frame: Frame) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if !stream.cursor.accepts(offset) {
            debug!(offset, "Skipping already applied frame");
            return;
        }
        stream.cursor.advance(offset);
        self.connected = true;
        if self.status == SessionStatus::Submitted {
            self.status = SessionStatus::Streaming;
        }

        match frame {
            Frame::Start { message_id, .. } => {
                // Replaying from the start rebuilds a message we already hold.
                let fresh = Message::assistant(message_id.clone(), self.conversation_id.clone());
                match self.messages.iter_mut().find(|m| m.id == message_id) {
                    Some(existing) => *existing = fresh,
                    None => self.messages.push(fresh),
                }
                stream.cursor.message_id = Some(message_id);
            }
            Frame::Error { kind, message } => {
                stream.error = Some(ChatError::from_wire(kind, message));
            }
            frame => {
                let Some(message_id) = stream.cursor.message_id.as_deref() else {
                    warn!(offset, kind = frame.discriminant(), "Frame before start; ignored");
                    return;
                };
                let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) else {
                    return;
                };
                if let Err(e) = message.apply_frame(&frame) {
                    warn!(offset, error = %e, "Could not apply frame");
                }
            }
        }
    }

    fn finish_stream(&mut self, reason: TerminalReason) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        debug!(
            conversation_id = %self.conversation_id,
            stream_id = %stream.cursor.stream_id,
            reason = %reason,
            "Stream closed"
        );

        match reason {
            TerminalReason::Done => self.set_status(SessionStatus::Ready),
            TerminalReason::Error(kind) => {
                let error = stream
                    .error
                    .unwrap_or_else(|| ChatError::from_wire(kind, format!("generation ended with {reason}")));
                self.fail(error);
            }
        }
    }

    /// The subscription ended without a terminal marker: reconnect with backoff,
    /// or fall back to the persisted transcript.
    async fn recover_stream(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        self.connected = false;
        let stream_id = stream.cursor.stream_id.clone();
        let status = self.backend.stream_status(&stream_id);

        match plan_resume(&stream.cursor, status, &self.resume_policy) {
            ResumePlan::Resubscribe { delay, from_offset } => {
                stream.cursor.attempts += 1;
                warn!(
                    stream_id = %stream_id,
                    attempt = stream.cursor.attempts,
                    from_offset,
                    "Stream connection lost; resubscribing"
                );
                self.publish();
                tokio::time::sleep(delay).await;

                match self.backend.subscribe(&stream_id, from_offset) {
                    Ok(events) => {
                        if let Some(stream) = self.stream.as_mut() {
                            stream.events = events;
                        }
                        true
                    }
                    Err(ChatError::NotFound(_)) => {
                        self.stream = None;
                        self.reconcile().await;
                        false
                    }
                    // Counted as another attempt on the next poll.
                    Err(_) => true,
                }
            }
            ResumePlan::Reconcile => {
                info!(stream_id = %stream_id, "Stream no longer buffered; reconciling");
                self.stream = None;
                self.reconcile().await;
                false
            }
            ResumePlan::GiveUp => {
                self.stream = None;
                self.fail(ChatError::Network {
                    message: "lost connection to the response stream".into(),
                    timeout: false,
                });
                false
            }
        }
    }

    /// Replace local state with the persisted transcript, keeping local-only messages.
    async fn reconcile(&mut self) {
        match self.backend.load_messages(&self.conversation_id).await {
            Ok(persisted) => {
                self.merge_persisted(persisted);
                self.connected = true;
                if self.status != SessionStatus::Error {
                    self.set_status(SessionStatus::Ready);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn merge_persisted(&mut self, persisted: Vec<Message>) {
        let local_only: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|local| !persisted.iter().any(|p| p.id == local.id))
            .collect();
        self.messages = persisted;
        self.messages.extend(local_only);
    }

    /// Record a recoverable error without changing the status.
    fn report(&mut self, error: ChatError) {
        let displayable = error.to_displayable();
        self.notices.push(displayable.clone());
        self.error = Some(displayable);
    }

    fn fail(&mut self, error: ChatError) {
        warn!(
            conversation_id = %self.conversation_id,
            kind = %error.kind(),
            error = %error,
            "Session error"
        );
        self.report(error);
        self.set_status(SessionStatus::Error);
        self.publish();
    }

    /// Dismiss a notice before it expires.
    pub fn dismiss_notice(&mut self, id: u64) -> bool {
        let dismissed = self.notices.dismiss(id);
        if dismissed {
            self.publish();
        }
        dismissed
    }

    /// Clear the displayed error and return to `ready`.
    pub fn clear_error(&mut self) {
        self.error = None;
        if self.status == SessionStatus::Error {
            self.set_status(SessionStatus::Ready);
        }
        self.publish();
    }
}
