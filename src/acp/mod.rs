//! Agent Client Protocol (ACP) stream handling.
//!
//! Manages bidirectional NDJSON stream communication with headless agent
//! processes spawned by the server. Each agent subprocess owns a pair of
//! read/write tasks communicating over its stdio.
//!
//! # Submodules
//!
//! - [`codec`]: [`tokio_util::codec::LinesCodec`]-based NDJSON framing with a
//!   1 MiB per-line limit.
//! - [`protocol`]: JSON-RPC envelope shapes and classification.
//! - [`reader`]: Async read task that parses incoming agent messages and
//!   forwards [`adapter::AgentNotification`]s.
//! - [`writer`]: Async write task that serialises outbound JSON-RPC values to
//!   the agent's stdin.
//! - [`spawner`]: Process spawning with environment isolation and stdio capture.
//! - [`adapter`]: The [`adapter::AgentAdapter`] trait and its ACP-backed implementation.

pub mod adapter;
pub mod codec;
pub mod protocol;
pub mod reader;
pub mod spawner;
pub mod writer;

pub use adapter::{AcpAdapter, AgentAdapter, AgentNotification};
