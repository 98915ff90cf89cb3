//! Session core for mediating interactive WebSocket clients and long-running,
//! subprocess-based ACP agent servers.
//!
//! See [`session`] for the state machine that owns one conversation,
//! [`eventlog`] for durable per-session event storage, [`markdown`] for the
//! streaming markdown-to-HTML coalescing buffer, [`subscriber`] for the
//! per-client dedup layer, and [`acp`] for the agent subprocess adapter.

#![forbid(unsafe_code)]

pub mod acp;
pub mod audit;
pub mod config;
pub mod errors;
pub mod eventlog;
pub mod markdown;
pub mod session;
pub mod subscriber;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
