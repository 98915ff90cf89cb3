//! The HTML rendering collaborator.
//!
//! The buffer decides *when* a run of markdown is complete; it never decides
//! *how* that text becomes HTML. That policy — escaping, sanitization, which
//! CommonMark/GFM extensions are enabled — belongs entirely to the
//! [`HtmlRenderer`] implementation plugged into it.

/// Converts a complete markdown fragment into an HTML string.
///
/// Implementations must be side-effect free and fast: they run inline on the
/// Session's single dispatch task.
pub trait HtmlRenderer: Send + Sync {
    /// Render `markdown` to HTML.
    fn render(&self, markdown: &str) -> String;
}

/// Default [`HtmlRenderer`] backed by `pulldown-cmark` with GFM tables and
/// strikethrough enabled, matching the block model the buffer itself
/// recognizes (lists, tables, fenced code).
#[derive(Debug, Default, Clone, Copy)]
pub struct PulldownRenderer;

impl HtmlRenderer for PulldownRenderer {
    fn render(&self, markdown: &str) -> String {
        let mut options = pulldown_cmark::Options::empty();
        options.insert(pulldown_cmark::Options::ENABLE_TABLES);
        options.insert(pulldown_cmark::Options::ENABLE_STRIKETHROUGH);
        let parser = pulldown_cmark::Parser::new_ext(markdown, options);

        let mut html = String::with_capacity(markdown.len() * 2);
        pulldown_cmark::html::push_html(&mut html, parser);
        html
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_ordered_list_with_four_items() {
        let renderer = PulldownRenderer;
        let html = renderer.render("1. **A**\n2. **B**\n3. **C**\n4. **D**\n");
        assert!(html.contains("<ol>"));
        assert_eq!(html.matches("<li>").count(), 4);
    }

    #[test]
    fn renders_table() {
        let renderer = PulldownRenderer;
        let html = renderer.render("| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.contains("<table>"));
    }
}
