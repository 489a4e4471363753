mod common;

use std::time::Duration;

use chatline_core::ChatError;
use chatline_core::client::{ChatBackend, SessionStatus};
use chatline_core::models::{Message, Role};
use chatline_core::repositories::TranscriptRepository;
use chatline_core::services::{GenerationRequest, ScriptStep, ScriptedProvider};
use chatline_core::streams::StreamEvent;
use common::{Harness, MODEL};
use futures::StreamExt;

#[tokio::test]
async fn hello_on_fresh_conversation_persists_two_turns() {
    let harness = Harness::authenticated(ScriptedProvider::default()).await;
    let mut session = harness.session("conv-1");
    assert_eq!(session.status(), SessionStatus::Ready);

    assert!(session.submit("hello").await);
    assert_eq!(session.status(), SessionStatus::Submitted);

    assert!(session.poll_stream().await);
    assert_eq!(session.status(), SessionStatus::Streaming);

    session.drive().await;
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.error().is_none());

    let stored = harness.store.list("conv-1").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!((stored[0].role, stored[0].sequence), (Role::User, 1));
    assert_eq!((stored[1].role, stored[1].sequence), (Role::Assistant, 2));
    assert_eq!(stored[0].content, "hello");
    assert_eq!(stored[1].content, "You said: hello");

    let conversation = harness
        .store
        .load_conversation("conv-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.last_message_at, Some(stored[1].created_at));
    assert_eq!(conversation.title, "hello");

    // The local copy carries the sequence assigned by the store.
    assert_eq!(session.messages()[1].sequence, 2);
}

#[tokio::test]
async fn concurrent_submissions_accept_exactly_one() {
    let harness = Harness::authenticated(ScriptedProvider::default()).await;

    let first = harness.service.start_generation(
        GenerationRequest::submit("conv-1", MODEL, Message::user("conv-1", "a")),
        &harness.store,
    );
    let second = harness.service.start_generation(
        GenerationRequest::submit("conv-1", MODEL, Message::user("conv-1", "b")),
        &harness.store,
    );
    let (first, second) = tokio::join!(first, second);

    let results = [first, second];
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(ChatError::AlreadyStreaming { .. })))
        .count();
    assert_eq!((accepted, conflicts), (1, 1));

    harness.service.wait_for_generation("conv-1").await;
    let stored = harness.store.list("conv-1").await.unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn sequence_numbers_strictly_interleave_turns() {
    let harness = Harness::authenticated(ScriptedProvider::default()).await;
    let mut session = harness.session("conv-1");

    for text in ["one", "two", "three"] {
        assert!(session.submit(text).await);
        session.drive().await;
    }

    let stored = harness.store.list("conv-1").await.unwrap();
    let sequences: Vec<i64> = stored.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    for pair in stored.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
    }
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_content_received_so_far() {
    let provider = ScriptedProvider::new(vec![vec![
        ScriptStep::text("one"),
        ScriptStep::text(" two"),
        ScriptStep::text(" three"),
    ]])
    .with_step_delay(Duration::from_secs(10));
    let harness = Harness::in_memory(provider);
    let mut session = harness.session("conv-1");

    session.submit("count").await;
    // start frame, then the first text delta
    assert!(session.poll_stream().await);
    assert!(session.poll_stream().await);
    assert_eq!(session.messages()[1].content, "one");

    session.stop().await;
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(!session.is_streaming());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!session.poll_stream().await);
    assert_eq!(session.messages()[1].content, "one");

    let stored = harness.store.list("conv-1").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].content, "one");

    // The conversation is usable again.
    assert!(session.submit("again").await);
    session.drive().await;
    assert_eq!(harness.store.list("conv-1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn subscribers_observe_identical_frame_order() {
    let provider = ScriptedProvider::new(vec![
        (0..20).map(|i| ScriptStep::text(format!("{i} "))).collect(),
    ]);
    let harness = Harness::authenticated(provider).await;
    let ticket = harness
        .service
        .start_generation(
            GenerationRequest::submit("conv-1", MODEL, Message::user("conv-1", "go")),
            &harness.store,
        )
        .await
        .unwrap();

    let first = harness.service.subscribe(&ticket.stream_id, 0).unwrap();
    let second = harness.service.subscribe(&ticket.stream_id, 0).unwrap();
    let (first, second) = tokio::join!(
        first.collect::<Vec<StreamEvent>>(),
        second.collect::<Vec<StreamEvent>>()
    );

    assert_eq!(first, second);
    assert!(matches!(first.last(), Some(StreamEvent::Closed(_))));

    // Re-subscribing from k replays exactly the tail.
    let k = 5;
    let tail: Vec<StreamEvent> = harness
        .service
        .subscribe(&ticket.stream_id, k)
        .unwrap()
        .collect()
        .await;
    assert_eq!(tail.as_slice(), &first[k..]);
}

#[tokio::test]
async fn guest_cap_blocks_new_turns_until_a_conversation_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::guest(ScriptedProvider::default(), dir.path(), 2);

    let mut first = harness.session("guest-1");
    assert!(first.submit("one").await);
    first.drive().await;
    assert!(first.submit("two").await);
    first.drive().await;

    assert!(!harness.backend.can_add_message().await.unwrap());
    let mut second = harness.session("guest-2");
    assert!(!second.submit("three").await);
    assert_eq!(second.status(), SessionStatus::Error);

    // Replies completing accepted exchanges were all stored.
    assert_eq!(harness.store.list("guest-1").await.unwrap().len(), 4);

    harness.store.delete("guest-1").await.unwrap();
    assert!(harness.backend.can_add_message().await.unwrap());
    assert!(second.submit("three").await);
    second.drive().await;
    assert_eq!(second.status(), SessionStatus::Ready);
}
