use std::time::Duration;

use crate::settings::ResumePolicy;
use crate::streams::StreamStatus;

/// A session's position within one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCursor {
    pub stream_id: String,
    /// Offset of the next frame this session has not applied yet.
    pub next_offset: usize,
    /// Assistant message the stream builds, once its `start` frame arrived.
    pub message_id: Option<String>,
    /// Consecutive reconnection attempts since the last received frame.
    pub attempts: u32,
}

impl StreamCursor {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            next_offset: 0,
            message_id: None,
            attempts: 0,
        }
    }

    /// Whether the frame at `offset` still needs applying.
    pub fn accepts(&self, offset: usize) -> bool {
        offset >= self.next_offset
    }

    pub fn advance(&mut self, offset: usize) {
        self.next_offset = offset + 1;
        self.attempts = 0;
    }
}

/// What to do after a subscription ended without a terminal marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResumePlan {
    /// Wait, then re-attach from the cursor's offset.
    Resubscribe { delay: Duration, from_offset: usize },
    /// The broker no longer has the stream; re-fetch the persisted transcript.
    Reconcile,
    /// Out of attempts; surface a network error.
    GiveUp,
}

/// Decide how to recover a dropped subscription from the broker's view of the stream.
pub fn plan_resume(
    cursor: &StreamCursor,
    status: Option<StreamStatus>,
    policy: &ResumePolicy,
) -> ResumePlan {
    match status {
        None => ResumePlan::Reconcile,
        Some(_) if cursor.attempts >= policy.max_attempts => ResumePlan::GiveUp,
        // A terminated stream still holds its buffer: re-attach to read the rest.
        Some(_) => ResumePlan::Resubscribe {
            delay: policy.backoff(cursor.attempts),
            from_offset: cursor.next_offset,
        },
    }
}
