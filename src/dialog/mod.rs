//! Dialog state machine — per-user sessions and event application.

pub mod engine;
pub mod state;

pub use engine::{DialogEngine, Event, Reply, ReplyKind};
pub use state::DialogState;
