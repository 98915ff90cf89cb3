//! Append-only per-session event storage.
//!
//! An [`EventLog`] is the durable record of one conversation: a strictly
//! ordered, sparsely-numbered sequence of [`Event`] rows plus one
//! [`SessionMetadata`] row tracking `event_count` and `max_seq`. The Session
//! (see [`crate::session`]) is the sole writer; subscribers only read.

mod model;
mod schema;
mod store;

pub use model::{Event, EventType, SessionMetadata, SessionStatus};
pub use store::EventLog;

#[cfg(test)]
pub(crate) use schema::bootstrap_schema as bootstrap_schema_for_tests;
