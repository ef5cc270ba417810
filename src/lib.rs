//! Relays chat turns to long-lived worker processes, one worker per channel,
//! and streams each worker's output back as a chain of edited messages.

pub mod attachments;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logger;
pub mod relay;
pub mod render;
pub mod session;
pub mod surface;
pub mod telegram;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use worker_protocol;
