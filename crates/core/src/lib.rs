//! Shared domain types for the task event relay.
//!
//! Everything here is transport- and runtime-agnostic: channel naming,
//! task status and event payloads, the WebSocket wire messages, and the
//! boundary traits for the external job system.

pub mod channels;
pub mod error;
pub mod event;
pub mod jobs;
pub mod messages;
pub mod task;
pub mod types;
