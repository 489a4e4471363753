use std::time::{Duration, Instant};

use crate::errors::{DisplayableError, ErrorCategory};

/// A user-visible notice derived from an error.
#[derive(Clone, Debug)]
pub struct Notice {
    pub id: u64,
    pub error: DisplayableError,
    pub created_at: Instant,
    /// `None` for notices that stay until dismissed.
    pub expires_at: Option<Instant>,
}

impl Notice {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bounded store of notices. Transient notices expire after `ttl`; all
/// notices can be dismissed.
pub struct NoticeStore {
    entries: Vec<Notice>,
    max_entries: usize,
    ttl: Duration,
    next_id: u64,
}

impl NoticeStore {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            ttl,
            next_id: 1,
        }
    }

    pub fn push(&mut self, error: DisplayableError) -> u64 {
        self.push_at(error, Instant::now())
    }

    pub fn push_at(&mut self, error: DisplayableError, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let expires_at = match error.category {
            ErrorCategory::Transient | ErrorCategory::Warning => Some(now + self.ttl),
            ErrorCategory::Credential | ErrorCategory::Failure => None,
        };

        self.entries.push(Notice {
            id,
            error,
            created_at: now,
            expires_at,
        });

        // FIFO eviction when exceeding max
        if self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }

        id
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|n| n.id != id);
        self.entries.len() != before
    }

    /// Notices still visible at `now`; expired ones are dropped.
    pub fn active(&mut self, now: Instant) -> Vec<Notice> {
        self.entries.retain(|n| !n.is_expired(now));
        self.entries.clone()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
