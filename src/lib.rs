//! pincer: model-routing and session-relay proxy.
//!
//! Clients open a WebSocket, configure a session (bring-your-own-key or
//! managed), and relay chat messages to an upstream LLM provider chosen
//! per message by a classifier/router, with budget metering and one
//! round of web-search tool use.

pub mod agent;
pub mod cli;
pub mod config;
pub mod logging;
pub mod router;
pub mod search;
pub mod server;
pub mod sessions;
pub mod subscription;
