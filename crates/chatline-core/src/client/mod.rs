pub mod backend;
pub mod resume;
pub mod session_controller;

pub use backend::{ChatBackend, LocalBackend};
pub use resume::{ResumePlan, StreamCursor, plan_resume};
pub use session_controller::{ClientSessionController, SessionSnapshot, SessionStatus};
