//! Streaming markdown coalescing buffer.
//!
//! [`MarkdownBuffer`] receives opaque UTF-8 chunks from the agent subprocess
//! and emits complete, safely-splittable HTML fragments through [`flush`] and
//! the size/inactivity triggers described in the component design. HTML
//! generation itself is delegated to an [`HtmlRenderer`] collaborator so the
//! buffer's own responsibility stays at "this run of markdown is complete."
//!
//! [`flush`]: MarkdownBuffer::flush

mod buffer;
mod render;

pub use buffer::{BufferLimits, Flushed, MarkdownBuffer};
pub use render::{HtmlRenderer, PulldownRenderer};
