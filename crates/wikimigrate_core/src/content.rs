//! Heuristics for deciding whether a page body carries real content.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::model::PageDetail;

pub const DEFAULT_MIN_TEXT_LENGTH: usize = 10;

const TRIVIAL_HTML: [&str; 5] = [
    "<p></p>",
    "<p><br></p>",
    "<p><br/></p>",
    "<p>&nbsp;</p>",
    "<p> </p>",
];
const MARKDOWN_STRUCTURE_MARKERS: [&str; 5] = ["#", "*", "-", "`", "!["];

static STRUCTURAL_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:h[1-6]|ul|ol|li|img|ac:image|pre|code|table)\b").ok()
});
static ANY_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]*>").ok());

/// Markdown wins when present; otherwise the HTML body is inspected.
pub fn is_page_effectively_empty(page: &PageDetail, min_text_length: usize) -> bool {
    if let Some(markdown) = page.markdown.as_deref()
        && !markdown.trim().is_empty()
    {
        return is_markdown_effectively_empty(markdown, min_text_length);
    }
    is_html_effectively_empty(page.html.as_deref().unwrap_or(""), min_text_length)
}

pub fn is_markdown_effectively_empty(markdown: &str, min_text_length: usize) -> bool {
    let trimmed = markdown.trim();
    if trimmed.is_empty() {
        return true;
    }
    if MARKDOWN_STRUCTURE_MARKERS
        .iter()
        .any(|marker| trimmed.contains(marker))
    {
        return false;
    }
    collapse_whitespace(trimmed).chars().count() <= min_text_length
}

pub fn is_html_effectively_empty(html: &str, min_text_length: usize) -> bool {
    let trimmed = html.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if TRIVIAL_HTML.contains(&lowered.as_str()) {
        return true;
    }
    if STRUCTURAL_TAG
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(trimmed))
    {
        return false;
    }
    visible_text(trimmed).chars().count() <= min_text_length
}

/// Tag-stripped, entity-decoded, whitespace-collapsed text.
pub fn visible_text(html: &str) -> String {
    let stripped = match ANY_TAG.as_ref() {
        Some(pattern) => pattern.replace_all(html, " ").into_owned(),
        None => html.to_string(),
    };
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    collapse_whitespace(&decoded)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(html: Option<&str>, markdown: Option<&str>) -> PageDetail {
        PageDetail {
            id: 1,
            book_id: 1,
            name: "Introduction".to_string(),
            html: html.map(str::to_string),
            markdown: markdown.map(str::to_string),
            ..PageDetail::default()
        }
    }

    #[test]
    fn trivial_placeholders_are_empty() {
        for html in TRIVIAL_HTML {
            assert!(is_page_effectively_empty(&page(Some(html), None), 10), "{html}");
        }
        assert!(is_page_effectively_empty(&page(Some("<P><BR></P>"), None), 10));
        assert!(is_page_effectively_empty(&page(None, None), 10));
        assert!(is_page_effectively_empty(&page(Some("   "), Some("")), 10));
    }

    #[test]
    fn structural_html_is_never_empty() {
        for html in [
            "<h2>x</h2>",
            "<ul><li></li></ul>",
            "<p><img src=\"a.png\"></p>",
            "<ac:image><ri:attachment ri:filename=\"a.png\"/></ac:image>",
            "<pre>x</pre>",
            "<table><tr><td></td></tr></table>",
        ] {
            assert!(!is_html_effectively_empty(html, 10), "{html}");
        }
    }

    #[test]
    fn short_text_is_empty_and_long_text_is_not() {
        assert!(is_html_effectively_empty("<p>todo</p>", 10));
        assert!(is_html_effectively_empty("<p>&nbsp;&nbsp;tbd&nbsp;</p>", 10));
        assert!(!is_html_effectively_empty(
            "<p>This page explains the deploy flow.</p>",
            10
        ));
        // exactly the threshold still counts as empty
        assert!(is_html_effectively_empty("<p>0123456789</p>", 10));
        assert!(!is_html_effectively_empty("<p>0123456789a</p>", 10));
    }

    #[test]
    fn markdown_takes_precedence_over_html() {
        assert!(!is_page_effectively_empty(
            &page(Some("<p></p>"), Some("# Heading")),
            10
        ));
        assert!(is_page_effectively_empty(
            &page(Some("<p>a long html paragraph here</p>"), Some("short")),
            10
        ));
        assert!(!is_markdown_effectively_empty("plain words well past ten", 10));
    }

    #[test]
    fn visible_text_strips_tags_and_entities() {
        assert_eq!(
            visible_text("<p>a &amp; b</p>\n<p>  c&nbsp;d </p>"),
            "a & b c d"
        );
    }
}
