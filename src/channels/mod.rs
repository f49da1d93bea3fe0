//! Channel abstraction for event I/O.

pub mod channel;
pub mod telegram;

pub use channel::*;
pub use telegram::TelegramChannel;
