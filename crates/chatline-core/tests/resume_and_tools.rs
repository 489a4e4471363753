mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatline_core::ChatResult;
use chatline_core::client::{ChatBackend, ClientSessionController, LocalBackend, SessionStatus};
use chatline_core::models::{Message, ToolState};
use chatline_core::repositories::TranscriptRepository;
use chatline_core::services::{
    GenerationRequest, GenerationState, GenerationTicket, ScriptStep, ScriptedProvider,
};
use chatline_core::streams::{StreamEvent, StreamHandle, StreamStatus};
use chatline_core::tools::{LocationDecision, LocationTool};
use common::Harness;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::json;

fn location_script() -> ScriptedProvider {
    ScriptedProvider::new(vec![
        vec![
            ScriptStep::text("Let me check where you are."),
            ScriptStep::tool_call("call-loc", LocationTool::NAME, json!({"purpose": "weather"})),
        ],
        vec![ScriptStep::EchoToolResult {
            prefix: " Location result: ".into(),
        }],
    ])
}

#[tokio::test]
async fn denied_location_resumes_generation_with_the_denial() {
    let harness = Harness::authenticated(location_script()).await;
    let mut session = harness.session("conv-1");

    session.submit("what's the weather here?").await;
    session.drive().await;

    let awaiting = session.awaiting_tools();
    assert_eq!(awaiting.len(), 1);
    assert_eq!(awaiting[0].tool_call_id, "call-loc");
    assert_eq!(session.status(), SessionStatus::Streaming);

    let denial = LocationDecision::denied("user declined").to_value();
    assert!(session.resolve_tool("call-loc", denial.clone()).await);
    session.drive().await;
    assert_eq!(session.status(), SessionStatus::Ready);

    let reply = &session.messages()[1];
    assert_eq!(reply.tool_invocations().count(), 1);
    assert_eq!(
        reply.tool_invocation("call-loc").unwrap().state,
        ToolState::Result(denial.clone())
    );
    assert!(reply.content.contains("user declined"));

    let stored = harness.store.list("conv-1").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].tool_invocations().count(), 1);
    assert_eq!(stored[1].tool_invocation("call-loc").unwrap().result(), Some(&denial));
}

#[tokio::test]
async fn undeliverable_decision_is_still_applied_locally() {
    let harness = Harness::authenticated(location_script()).await;
    let mut session = harness.session("conv-1");

    session.submit("where am I?").await;
    session.drive().await;
    assert_eq!(session.awaiting_tools().len(), 1);

    // The generation goes away before the decision arrives.
    harness.service.cancel("conv-1").await;

    let decision = LocationDecision::denied("no").to_value();
    assert!(!session.resolve_tool("call-loc", decision.clone()).await);
    assert_eq!(
        session.error().map(|e| e.title.as_str()),
        Some("Decision not delivered")
    );
    assert!(session.awaiting_tools().is_empty());
    let local = session.messages()[1].tool_invocation("call-loc").unwrap();
    assert_eq!(local.result(), Some(&decision));
}

#[tokio::test]
async fn rejected_decision_can_be_answered_again() {
    let harness = Harness::authenticated(location_script()).await;
    let mut session = harness.session("conv-1");

    session.submit("where am I?").await;
    session.drive().await;

    let out_of_range = json!({
        "status": "granted",
        "latitude": 200.0,
        "longitude": 4.89,
        "timezone": "Europe/Amsterdam"
    });
    assert!(!session.resolve_tool("call-loc", out_of_range).await);
    assert_eq!(
        session.error().map(|e| e.title.as_str()),
        Some("Invalid request")
    );
    assert_eq!(session.awaiting_tools().len(), 1);
    assert_eq!(
        harness.service.generation_state("conv-1"),
        Some(GenerationState::Suspended)
    );

    // The tool drops the unknown field; its normalised result replaces ours.
    let decision = json!({"status": "denied", "reason": "not now", "remember": true});
    assert!(session.resolve_tool("call-loc", decision).await);
    session.drive().await;
    assert_eq!(session.status(), SessionStatus::Ready);

    let normalised = LocationDecision::denied("not now").to_value();
    let local = session.messages()[1].tool_invocation("call-loc").unwrap();
    assert_eq!(local.result(), Some(&normalised));
    let stored = harness.store.list("conv-1").await.unwrap();
    assert_eq!(stored[1].tool_invocation("call-loc"), Some(local));
}

#[tokio::test]
async fn stopping_a_suspended_reply_leaves_no_open_prompt() {
    let provider = ScriptedProvider::new(vec![
        vec![
            ScriptStep::text("Let me check where you are."),
            ScriptStep::tool_call("call-loc", LocationTool::NAME, json!({})),
        ],
        vec![ScriptStep::text("Sure, next topic.")],
    ]);
    let harness = Harness::authenticated(provider).await;
    let mut session = harness.session("conv-1");

    session.submit("where am I?").await;
    session.drive().await;
    assert_eq!(session.awaiting_tools().len(), 1);

    session.stop().await;
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.awaiting_tools().is_empty());

    assert!(session.submit("next").await);
    session.drive().await;
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(!session.is_streaming());
    assert_eq!(
        session.messages().last().map(|m| m.content.as_str()),
        Some("Sure, next topic.")
    );

    let stored = harness.store.list("conv-1").await.unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(
        stored[1].tool_invocation("call-loc").unwrap().result(),
        Some(&json!({"status": "cancelled"}))
    );

    let mut reopened = harness.session("conv-1");
    assert!(!reopened.mount().await);
    assert!(reopened.awaiting_tools().is_empty());
    assert!(reopened.messages().iter().all(|m| m.awaiting_tools().is_empty()));
}

#[tokio::test]
async fn reopened_session_attaches_to_live_generation_without_duplicates() {
    let harness = Harness::authenticated(location_script()).await;

    let mut first_tab = harness.session("conv-1");
    first_tab.submit("where am I?").await;
    first_tab.drive().await;
    drop(first_tab);

    let mut second_tab = harness.session("conv-1");
    assert!(second_tab.mount().await);
    second_tab.drive().await;

    assert_eq!(second_tab.messages().len(), 2);
    assert_eq!(second_tab.awaiting_tools().len(), 1);

    let granted = LocationDecision::Granted {
        latitude: 52.37,
        longitude: 4.89,
        timezone: "Europe/Amsterdam".into(),
    }
    .to_value();
    assert!(second_tab.resolve_tool("call-loc", granted).await);
    second_tab.drive().await;
    assert_eq!(second_tab.status(), SessionStatus::Ready);

    // Mounting again after completion reconciles instead of replaying.
    assert!(!second_tab.mount().await);
    assert_eq!(second_tab.messages().len(), 2);
    assert!(second_tab.messages()[1].content.contains("Europe/Amsterdam"));
    assert_eq!(second_tab.messages()[1].tool_invocations().count(), 1);
}

/// Backend whose first subscription drops after a few events.
struct FlakyBackend {
    inner: Arc<LocalBackend>,
    drop_after: Mutex<Option<usize>>,
    forget_streams: bool,
    subscriptions: Mutex<Vec<usize>>,
}

impl FlakyBackend {
    fn new(inner: Arc<LocalBackend>, drop_after: usize, forget_streams: bool) -> Self {
        Self {
            inner,
            drop_after: Mutex::new(Some(drop_after)),
            forget_streams,
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChatBackend for FlakyBackend {
    fn is_guest(&self) -> bool {
        self.inner.is_guest()
    }

    fn message_cap(&self) -> Option<usize> {
        self.inner.message_cap()
    }

    async fn can_add_message(&self) -> ChatResult<bool> {
        self.inner.can_add_message().await
    }

    async fn start_generation(&self, request: GenerationRequest) -> ChatResult<GenerationTicket> {
        self.inner.start_generation(request).await
    }

    fn subscribe(
        &self,
        stream_id: &str,
        from_offset: usize,
    ) -> ChatResult<BoxStream<'static, StreamEvent>> {
        self.subscriptions.lock().push(from_offset);
        let events = self.inner.subscribe(stream_id, from_offset)?;
        Ok(match self.drop_after.lock().take() {
            Some(n) => events.take(n).boxed(),
            None => events,
        })
    }

    fn stream_status(&self, stream_id: &str) -> Option<StreamStatus> {
        if self.forget_streams {
            return None;
        }
        self.inner.stream_status(stream_id)
    }

    async fn latest_stream(&self, conversation_id: &str) -> ChatResult<Option<StreamHandle>> {
        self.inner.latest_stream(conversation_id).await
    }

    async fn resolve_tool(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        result: serde_json::Value,
    ) -> ChatResult<()> {
        self.inner
            .resolve_tool(conversation_id, tool_call_id, result)
            .await
    }

    async fn cancel(&self, conversation_id: &str) -> ChatResult<()> {
        self.inner.cancel(conversation_id).await
    }

    async fn load_messages(&self, conversation_id: &str) -> ChatResult<Vec<Message>> {
        self.inner.load_messages(conversation_id).await
    }
}

fn counting_script() -> ScriptedProvider {
    ScriptedProvider::new(vec![
        (1..=6).map(|i| ScriptStep::text(format!("{i} "))).collect(),
    ])
}

#[tokio::test(start_paused = true)]
async fn dropped_subscription_resumes_from_last_applied_offset() {
    let harness = Harness::in_memory(counting_script().with_step_delay(Duration::from_millis(100)));
    let flaky = Arc::new(FlakyBackend::new(harness.backend.clone(), 3, false));
    let mut session = ClientSessionController::new(flaky.clone(), "conv-1", common::MODEL, &harness.settings);

    session.submit("count to six").await;
    session.drive().await;

    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.is_connected());
    assert_eq!(session.messages()[1].content, "1 2 3 4 5 6 ");
    // start + two text frames were applied before the drop
    assert_eq!(*flaky.subscriptions.lock(), vec![0, 3]);

    let stored = harness.store.list("conv-1").await.unwrap();
    assert_eq!(stored[1].content, session.messages()[1].content);
}

#[tokio::test(start_paused = true)]
async fn evicted_stream_falls_back_to_persisted_transcript() {
    let harness = Harness::in_memory(counting_script());
    let flaky = Arc::new(FlakyBackend::new(harness.backend.clone(), 2, true));
    let mut session = ClientSessionController::new(flaky, "conv-1", common::MODEL, &harness.settings);

    session.submit("count").await;
    harness.service.wait_for_generation("conv-1").await;
    session.drive().await;

    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(!session.is_streaming());
    assert_eq!(session.messages().len(), 2);
    assert_eq!(session.messages()[1].content, "1 2 3 4 5 6 ");
    assert!(session.messages()[1].is_persisted());
}
