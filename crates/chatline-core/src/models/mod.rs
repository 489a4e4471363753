pub mod conversation;
pub mod frame;
pub mod message;
pub mod notice_store;
pub mod token_usage;

pub use conversation::{Conversation, derive_title};
pub use frame::{FinishReason, Frame, TerminalReason};
pub use message::{Message, Part, Role, ToolInvocation, ToolState, ToolStateError};
pub use notice_store::{Notice, NoticeStore};
pub use token_usage::TokenUsage;

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
