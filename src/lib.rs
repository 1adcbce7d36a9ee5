//! ccbridge - gateway/supervisor between interactive clients and a local
//! Agent CLI.
//!
//! Clients connect over WebSocket and submit conversational prompts; the
//! gateway spawns one Agent CLI process per turn, aggregates its streamed
//! records into a compact event set, gates delivery on conversational
//! permission requests, and buffers events across client disconnects.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod paths;
pub mod permission;
pub mod protocol;
pub mod queue;
pub mod session;
