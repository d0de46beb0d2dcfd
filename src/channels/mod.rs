//! Channel abstraction for the chat transport session.

pub mod channel;
pub mod cli;
pub mod telegram;

pub use channel::*;
pub use cli::CliChannel;
pub use telegram::TelegramChannel;
