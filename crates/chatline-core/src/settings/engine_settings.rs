use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy for automatic stream resumption after a network error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumePolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
        }
    }
}

impl ResumePolicy {
    /// Delay before the given (zero-based) attempt: doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Tunables of the conversation engine. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How long a closed stream's frames stay available for late readers
    pub broker_grace_period_secs: u64,
    /// User turns a guest may store across all guest conversations
    pub guest_message_cap: usize,
    pub provider_read_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// How long a suspended generation waits for a human decision
    pub suspend_timeout_secs: u64,
    pub max_tool_rounds: usize,
    pub resume: ResumePolicy,
    pub notice_ttl_secs: u64,
    pub max_notices: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            broker_grace_period_secs: 300,
            guest_message_cap: 10,
            provider_read_timeout_secs: 60,
            tool_timeout_secs: 60,
            suspend_timeout_secs: 600,
            max_tool_rounds: 10,
            resume: ResumePolicy::default(),
            notice_ttl_secs: 8,
            max_notices: 5,
        }
    }
}

impl EngineSettings {
    pub fn broker_grace_period(&self) -> Duration {
        Duration::from_secs(self.broker_grace_period_secs)
    }

    pub fn provider_read_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_read_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_secs(self.suspend_timeout_secs)
    }

    pub fn notice_ttl(&self) -> Duration {
        Duration::from_secs(self.notice_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"guest_message_cap": 3, "resume": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(settings.guest_message_cap, 3);
        assert_eq!(settings.broker_grace_period_secs, 300);
        assert_eq!(settings.resume.max_attempts, 2);
        assert_eq!(settings.resume.initial_backoff_ms, 250);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ResumePolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(10), Duration::from_millis(4000));
        assert_eq!(policy.backoff(200), Duration::from_millis(4000));
    }
}
