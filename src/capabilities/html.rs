//! Visible-text extraction for `htmlText` and `webscrap`.

use super::HtmlExtractor;

/// Text wrapping width for html2text conversion.
const TEXT_WIDTH: usize = 100;

pub struct Html2TextExtractor {
    width: usize,
}

impl Default for Html2TextExtractor {
    fn default() -> Self {
        Self { width: TEXT_WIDTH }
    }
}

impl HtmlExtractor for Html2TextExtractor {
    fn extract_text(&self, html: &str) -> String {
        html2text::from_read(html.as_bytes(), self.width)
            .unwrap_or_else(|_| html.to_string())
            .trim()
            .to_string()
    }
}

/// Returns true if the content type looks like HTML.
pub fn is_html(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/html") || ct.contains("application/xhtml")
}
