//! HTML body to plain text.

use scraper::Html;

/// Elements whose text never belongs in the readable body.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "head", "title", "noscript"];

/// Render an HTML email body as text, one text node per line.
///
/// Returns `None` when the document has no visible text at all.
pub fn html_to_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let mut lines: Vec<&str> = Vec::new();

    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(|a| a.value().as_element())
            .any(|e| SKIPPED_ELEMENTS.contains(&e.name()));
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed);
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
