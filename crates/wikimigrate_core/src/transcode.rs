//! Rewrites Confluence code-block macros into plain `<pre><code>` markup.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex_lite::Regex;
use tracing::warn;

struct MacroPatterns {
    code_macro: Regex,
    code_open: Regex,
    language: Regex,
    plain_text_body: Regex,
    cdata: Regex,
}

static PATTERNS: LazyLock<Option<MacroPatterns>> = LazyLock::new(|| {
    let build = || -> Result<MacroPatterns, regex_lite::Error> {
        Ok(MacroPatterns {
            code_macro: Regex::new(
                r#"(?s)<ac:structured-macro\b[^>]*\bac:name="(code|noformat)"[^>]*>(.*?)</ac:structured-macro>"#,
            )?,
            code_open: Regex::new(
                r#"<ac:structured-macro\b[^>]*\bac:name="(?:code|noformat)"[^>]*>"#,
            )?,
            language: Regex::new(
                r#"(?s)<ac:parameter\b[^>]*\bac:name="language"[^>]*>(.*?)</ac:parameter>"#,
            )?,
            plain_text_body: Regex::new(
                r"(?s)<ac:plain-text-body\b[^>]*>(.*?)</ac:plain-text-body>",
            )?,
            cdata: Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>")?,
        })
    };
    build().ok()
});

/// Transcode every code/noformat macro in `body`. Never fails: malformed
/// input is returned unchanged with a warning.
pub fn transcode(body: &str) -> String {
    match try_transcode(body) {
        Ok(output) => output,
        Err(error) => {
            warn!(error = %format!("{error:#}"), "code macro left untouched");
            body.to_string()
        }
    }
}

pub fn try_transcode(body: &str) -> Result<String> {
    if !body.contains("ac:structured-macro") {
        return Ok(body.to_string());
    }
    let patterns = PATTERNS
        .as_ref()
        .context("code macro patterns failed to compile")?;

    let openings = patterns.code_open.find_iter(body).count();
    let mut output = String::with_capacity(body.len());
    let mut cursor = 0;
    let mut converted = 0;
    for captures in patterns.code_macro.captures_iter(body) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(2)) else {
            continue;
        };
        output.push_str(&body[cursor..whole.start()]);
        output.push_str(&render_code_block(patterns, inner.as_str()).with_context(|| {
            format!("malformed code macro at byte {}", whole.start())
        })?);
        cursor = whole.end();
        converted += 1;
    }
    if converted != openings {
        bail!("{} code macro(s) without a closing tag", openings - converted);
    }
    output.push_str(&body[cursor..]);
    Ok(output)
}

fn render_code_block(patterns: &MacroPatterns, inner: &str) -> Result<String> {
    let language = patterns
        .language
        .captures(inner)
        .and_then(|captures| captures.get(1))
        .map(|value| normalize_language(value.as_str()))
        .unwrap_or_default();

    let raw_body = patterns
        .plain_text_body
        .captures(inner)
        .and_then(|captures| captures.get(1))
        .context("macro has no plain-text-body")?
        .as_str();

    let code = if raw_body.contains("<![CDATA[") {
        let joined: String = patterns
            .cdata
            .captures_iter(raw_body)
            .filter_map(|captures| captures.get(1))
            .map(|section| section.as_str())
            .collect();
        escape_html(&joined.replace("\\n", "\n"))
    } else {
        // Already entity-encoded storage text.
        raw_body.replace("\\n", "\n")
    };

    Ok(if language.is_empty() {
        format!("<pre><code>{code}</code></pre>")
    } else {
        format!("<pre><code class=\"language-{language}\">{code}</code></pre>")
    })
}

fn normalize_language(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+' | '#'))
        .collect()
}

fn escape_html(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            _ => output.push(ch),
        }
    }
    output
}
