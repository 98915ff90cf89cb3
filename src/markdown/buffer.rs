//! Block detection and flush-trigger state machine for one streamed message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::render::HtmlRenderer;

/// The kind of structured block currently accumulating, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockState {
    /// No open structured block; accumulated text (if any) is a loose paragraph.
    None,
    /// Inside a list (tight: splitting it would produce two broken `<ol>`/`<ul>`).
    List,
    /// Inside a pipe-delimited table (tight).
    Table,
    /// Inside a fenced code block, with the fence marker that will close it.
    Code { fence: String },
}

/// Tunable flush-trigger thresholds. Defaults match the values named in the
/// component design (~2s hard inactivity, ~200ms soft, ~64KB code, ~4KB paragraph).
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    /// Hard inactivity window: emit regardless of structural state.
    pub hard_inactivity: Duration,
    /// Soft inactivity window: emit only outside a block with balanced inline formatting.
    pub soft_inactivity: Duration,
    /// Size ceiling for an accumulating fenced code block, in bytes.
    pub code_ceiling_bytes: usize,
    /// Size ceiling for an accumulating non-block paragraph, in bytes.
    pub paragraph_ceiling_bytes: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            hard_inactivity: Duration::from_millis(2_000),
            soft_inactivity: Duration::from_millis(200),
            code_ceiling_bytes: 64 * 1024,
            paragraph_ceiling_bytes: 4 * 1024,
        }
    }
}

/// A coalesced, not-yet-flushed run of markdown text and the seq of the first
/// chunk that contributed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed {
    /// Seq of the first chunk in this fragment. Never raised by later writes
    /// into the same in-progress accumulator.
    pub seq: i64,
    /// Rendered HTML for the fragment.
    pub html: String,
}

/// Single-writer streaming markdown coalescing buffer.
///
/// Owned by exactly one Session. Receives chunks via [`write`](Self::write)
/// and emits [`Flushed`] fragments on block boundaries, size ceilings, or
/// inactivity — see the module-level flush-trigger precedence.
pub struct MarkdownBuffer {
    renderer: Arc<dyn HtmlRenderer>,
    limits: BufferLimits,
    /// Complete (newline-terminated) lines accumulated for the current fragment.
    accumulated: String,
    /// The current line, not yet terminated by `\n`.
    line_buf: String,
    state: BlockState,
    current_seq: Option<i64>,
    last_write: Instant,
}

impl MarkdownBuffer {
    /// Construct a new, empty buffer.
    #[must_use]
    pub fn new(renderer: Arc<dyn HtmlRenderer>, limits: BufferLimits) -> Self {
        Self {
            renderer,
            limits,
            accumulated: String::new(),
            line_buf: String::new(),
            state: BlockState::None,
            current_seq: None,
            last_write: Instant::now(),
        }
    }

    /// Whether a structured block (list, table, or fenced code) is currently open.
    #[must_use]
    pub fn is_in_block(&self) -> bool {
        matches!(self.state, BlockState::List | BlockState::Table | BlockState::Code { .. })
    }

    /// Whether the accumulated text (including the in-progress line) has an
    /// unmatched `**bold**` or `` `code` `` inline run. Gates the soft
    /// inactivity flush only — the hard flush ignores this entirely so a
    /// stalled agent mid-bold-phrase still makes progress.
    #[must_use]
    pub fn has_unmatched_inline(&self) -> bool {
        let bold_pairs = self.accumulated.matches("**").count() + self.line_buf.matches("**").count();
        let combined_backticks =
            self.accumulated.chars().filter(|c| *c == '`').count() + self.line_buf.chars().filter(|c| *c == '`').count();
        bold_pairs % 2 != 0 || combined_backticks % 2 != 0
    }

    /// Accept a new chunk at the given seq. Returns any fragments the write
    /// synchronously triggered (structured-block close or size ceiling), in
    /// the order they were produced.
    pub fn write(&mut self, seq: i64, chunk: &str) -> Vec<Flushed> {
        if self.current_seq.is_none() && !chunk.is_empty() {
            self.current_seq = Some(seq);
        }
        self.last_write = Instant::now();

        let mut flushed = Vec::new();
        self.line_buf.push_str(chunk);

        while let Some(idx) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=idx).collect();
            if let Some(f) = self.consume_line(&line) {
                flushed.push(f);
            }
        }

        if let Some(f) = self.check_size_ceiling() {
            flushed.push(f);
        }

        flushed
    }

    /// Explicit hard flush: emits any accumulator — even mid-block, even with
    /// unmatched inline formatting — closing the accumulation conservatively.
    /// No-op if nothing is accumulated.
    pub fn flush(&mut self) -> Option<Flushed> {
        if !self.line_buf.is_empty() {
            self.accumulated.push_str(&self.line_buf);
            self.line_buf.clear();
        }
        self.state = BlockState::None;
        self.emit_now()
    }

    /// Called periodically (e.g. every ~50ms) by the owning Session's timer.
    /// Applies the hard/soft inactivity triggers and returns a fragment if
    /// either fired.
    pub fn check_inactivity(&mut self, now: Instant) -> Option<Flushed> {
        if self.current_seq.is_none() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_write);

        if elapsed >= self.limits.hard_inactivity {
            return self.flush();
        }

        if elapsed >= self.limits.soft_inactivity && !self.is_in_block() && !self.has_unmatched_inline() {
            return self.flush();
        }

        None
    }

    fn consume_line(&mut self, line: &str) -> Option<Flushed> {
        let content = line.trim_end_matches('\n').trim_end_matches('\r');
        let is_blank = content.trim().is_empty();

        match &self.state {
            BlockState::Code { fence } => {
                let fence = fence.clone();
                self.accumulated.push_str(line);
                if content.trim_start() == fence {
                    self.state = BlockState::None;
                    return self.emit_now();
                }
                None
            }
            BlockState::List | BlockState::Table => {
                self.accumulated.push_str(line);
                if is_blank {
                    self.state = BlockState::None;
                    return self.emit_now();
                }
                None
            }
            BlockState::None => {
                if is_blank {
                    if self.accumulated.trim().is_empty() {
                        self.accumulated.clear();
                        return None;
                    }
                    self.accumulated.push_str(line);
                    return self.emit_now();
                }

                if let Some(fence) = code_fence_open(content) {
                    self.state = BlockState::Code { fence };
                } else if is_list_item(content) {
                    self.state = BlockState::List;
                } else if looks_like_table_row(content) {
                    self.state = BlockState::Table;
                }
                self.accumulated.push_str(line);
                None
            }
        }
    }

    fn check_size_ceiling(&mut self) -> Option<Flushed> {
        let ceiling = match self.state {
            BlockState::Code { .. } => self.limits.code_ceiling_bytes,
            _ => self.limits.paragraph_ceiling_bytes,
        };
        if self.accumulated.len() + self.line_buf.len() > ceiling {
            self.state = BlockState::None;
            if !self.line_buf.is_empty() {
                self.accumulated.push_str(&self.line_buf);
                self.line_buf.clear();
            }
            self.emit_now()
        } else {
            None
        }
    }

    fn emit_now(&mut self) -> Option<Flushed> {
        if self.accumulated.trim().is_empty() {
            self.accumulated.clear();
            self.current_seq = None;
            return None;
        }
        let seq = self.current_seq.take().unwrap_or(0);
        let html = self.renderer.render(&self.accumulated);
        self.accumulated.clear();
        Some(Flushed { seq, html })
    }
}

fn code_fence_open(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let _ = rest;
        return Some("```".to_owned());
    }
    if let Some(rest) = trimmed.strip_prefix("~~~") {
        let _ = rest;
        return Some("~~~".to_owned());
    }
    None
}

fn is_list_item(line: &str) -> bool {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix(['-', '*', '+']) {
        return rest.starts_with(' ') || rest.is_empty();
    }
    let digits: String = trimmed.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return false;
    }
    trimmed[digits.len()..].starts_with(". ") || trimmed[digits.len()..].starts_with(") ")
}

fn looks_like_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.matches('|').count() >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> MarkdownBuffer {
        MarkdownBuffer::new(Arc::new(super::super::render::PulldownRenderer), BufferLimits::default())
    }

    #[test]
    fn list_is_not_split_across_flush_calls() {
        let mut buf = buffer();
        assert!(buf.write(1, "1. **A**\n").is_empty());
        assert!(buf.is_in_block());
        assert!(buf.write(2, "2. **B**\n").is_empty());
        assert!(buf.write(3, "3. **C**\n").is_empty());
        let flushed = buf.write(4, "4. **D**\n\n");

        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].seq, 1, "emitted seq must be the first chunk's seq");
        assert_eq!(flushed[0].html.matches("<li>").count(), 4);
        assert!(!buf.is_in_block());
    }

    #[test]
    fn flush_after_list_close_is_noop() {
        let mut buf = buffer();
        buf.write(1, "1. a\n2. b\n\n");
        assert!(buf.flush().is_none(), "buffer must hold no content after flush");
    }

    #[test]
    fn coalescing_preserves_first_seq_across_many_writes() {
        let mut buf = buffer();
        assert!(buf.write(1, "1. a\n").is_empty());
        assert!(buf.write(2, "2. b\n").is_empty());
        let flushed = buf.write(3, "3. c\n\n");
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].seq, 1);
    }

    #[test]
    fn fenced_code_block_is_not_split_on_internal_blank_lines() {
        let mut buf = buffer();
        assert!(buf.write(1, "```rust\n").is_empty());
        assert!(buf.is_in_block());
        assert!(buf.write(1, "fn main() {}\n\n").is_empty(), "blank line inside code fence must not close it");
        let flushed = buf.write(1, "```\n");
        assert_eq!(flushed.len(), 1);
        assert!(!buf.is_in_block());
        assert!(flushed[0].html.contains("<pre>") || flushed[0].html.contains("<code>"));
    }

    #[test]
    fn table_closes_on_blank_line() {
        let mut buf = buffer();
        buf.write(1, "| a | b |\n");
        buf.write(1, "|---|---|\n");
        assert!(buf.is_in_block());
        let flushed = buf.write(1, "| 1 | 2 |\n\n");
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].html.contains("<table>"));
    }

    #[test]
    fn hard_external_flush_emits_mid_block_with_unmatched_inline() {
        let mut buf = buffer();
        buf.write(1, "1. **unterminated bold\n");
        assert!(buf.is_in_block());
        assert!(buf.has_unmatched_inline());
        let flushed = buf.flush();
        assert!(flushed.is_some());
        assert!(!buf.is_in_block());
    }

    #[test]
    fn soft_inactivity_does_not_fire_inside_a_block() {
        let mut buf = buffer();
        buf.write(1, "1. still typing\n");
        let past_soft = Instant::now() + Duration::from_millis(500);
        assert!(buf.check_inactivity(past_soft).is_none(), "tight block must wait for hard inactivity");
    }

    #[test]
    fn soft_inactivity_fires_for_balanced_loose_paragraph() {
        let mut buf = buffer();
        buf.write(1, "plain text, no block");
        let past_soft = Instant::now() + Duration::from_millis(500);
        let flushed = buf.check_inactivity(past_soft);
        assert!(flushed.is_some());
    }

    #[test]
    fn soft_inactivity_withholds_for_unmatched_inline_formatting() {
        let mut buf = buffer();
        buf.write(1, "this is **unterminated");
        let past_soft = Instant::now() + Duration::from_millis(500);
        assert!(buf.check_inactivity(past_soft).is_none());
    }

    #[test]
    fn hard_inactivity_fires_even_with_unmatched_inline_formatting() {
        let mut buf = buffer();
        buf.write(1, "this is **unterminated");
        let past_hard = Instant::now() + Duration::from_millis(2_100);
        assert!(buf.check_inactivity(past_hard).is_some());
    }

    #[test]
    fn hard_inactivity_fires_even_inside_a_tight_block() {
        let mut buf = buffer();
        buf.write(1, "1. still going\n");
        assert!(buf.is_in_block());
        let past_hard = Instant::now() + Duration::from_millis(2_100);
        let flushed = buf.check_inactivity(past_hard);
        assert!(flushed.is_some());
        assert!(!buf.is_in_block());
    }

    #[test]
    fn size_ceiling_forces_emission_for_oversized_paragraph() {
        let mut buf = MarkdownBuffer::new(
            Arc::new(super::super::render::PulldownRenderer),
            BufferLimits {
                paragraph_ceiling_bytes: 16,
                ..BufferLimits::default()
            },
        );
        let flushed = buf.write(1, "this paragraph is definitely longer than sixteen bytes");
        assert!(!flushed.is_empty());
    }

    #[test]
    fn emitted_seq_is_monotone_non_decreasing_across_successive_flushes() {
        let mut buf = buffer();
        let f1 = buf.write(1, "1. a\n2. b\n\n");
        let f2 = buf.write(5, "some text");
        let f2_flush = buf.flush();
        assert_eq!(f1[0].seq, 1);
        assert!(f2.is_empty());
        if let Some(f) = f2_flush {
            assert!(f.seq >= f1[0].seq);
        }
    }
}
