//! Courier: a two-requester chat bot that fetches media from links and
//! delivers it to a photo library or file host, one job at a time.

pub mod catalog;
pub mod channels;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executors;
pub mod lyrics;
pub mod notify;
pub mod router;
pub mod scheduler;
