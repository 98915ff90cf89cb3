//! The client-facing WebSocket layer: per-connection dedup state, the wire
//! protocol, and the axum handler bridging a socket to a [`Session`](crate::session::Session).

pub mod dedup;
pub mod protocol;
pub mod ws;

pub use dedup::Subscriber;
pub use protocol::{InboundFrame, OutboundFrame};
pub use ws::{ws_handler, AppState};
