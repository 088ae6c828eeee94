//! Query sanitizing.
//!
//! Generated or pasted DAX frequently arrives wrapped in artifacts: stray
//! markup tags, typographic quotes and dashes, markdown code fences and
//! trailing comment lines. [`sanitize`] strips those before a query is sent to
//! the remote server. It is a pure text transform and is idempotent.
//!
//! Text inside string literals (`"..."`), quoted table names (`'...'`) and
//! bracketed column references (`[...]`) is never re-spaced.

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches an opening, closing or self-closing markup tag candidate.
///
/// A tag name must follow `<` or `</` directly, which keeps spaced DAX
/// comparisons such as `a < b` and `x > 0` intact. Unspaced comparisons are
/// filtered out afterwards by [`is_markup`].
static MARKUP_TAG: Lazy<Regex> = Lazy::new(|| {
    let pattern = r"</?[A-Za-z][A-Za-z0-9_:.-]*(?:\s[^<>]*)?/?>";
    Regex::new(pattern)
        .unwrap_or_else(|e| panic!("Internal error: invalid regex pattern '{}': {}", pattern, e))
});

/// Sanitize a declarative query.
///
/// Runs the cleanup pass until it reaches a fixed point, so
/// `sanitize(&sanitize(q)) == sanitize(q)` holds for every input.
pub fn sanitize(raw: &str) -> String {
    let mut current = clean_pass(raw);
    loop {
        let next = clean_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn clean_pass(input: &str) -> String {
    let text = normalize_punctuation(input);
    let text = strip_markup(&text);

    let mut lines: Vec<String> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect();

    strip_trailing_directives(&mut lines);
    lines.join("\n")
}

/// Replace typographic punctuation with its ASCII equivalent.
fn normalize_punctuation(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => out.push('"'),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => out.push('-'),
            '\u{00A0}' | '\u{2007}' | '\u{202F}' | '\u{3000}' => out.push(' '),
            '\u{2026}' => out.push_str("..."),
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\r' => {}
            other => out.push(other),
        }
    }
    out
}

fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for candidate in MARKUP_TAG.find_iter(input) {
        if !is_markup(&input[..candidate.start()], candidate.as_str()) {
            continue;
        }
        out.push_str(&input[last..candidate.start()]);
        last = candidate.end();
    }
    out.push_str(&input[last..]);
    out
}

/// Whether a tag candidate is markup rather than part of an expression.
///
/// `Sales[Qty]<Limit && Sales[Amount]>0` looks like a tag to the pattern. A
/// body carrying operators or references, or an opening tag glued to the end
/// of an operand, is left alone.
fn is_markup(before: &str, candidate: &str) -> bool {
    let body = &candidate[1..candidate.len() - 1];
    if ["&&", "||", "[", "("].iter().any(|op| body.contains(op)) {
        return false;
    }

    let closing = candidate.starts_with("</");
    let self_closing = candidate.ends_with("/>");
    if !closing && !self_closing {
        let glued = before
            .chars()
            .next_back()
            .map_or(false, |c| matches!(c, ']' | ')' | '\'' | '"') || c.is_ascii_digit());
        if glued {
            return false;
        }
    }
    true
}

/// Collapse runs of blanks outside quoted regions and trim the line.
fn collapse_whitespace(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut closing: Option<char> = None;
    let mut pending_space = false;

    for c in line.chars() {
        if let Some(close) = closing {
            out.push(c);
            if c == close {
                closing = None;
            }
            continue;
        }

        if c == ' ' || c == '\t' {
            pending_space = true;
            continue;
        }

        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;

        closing = match c {
            '"' => Some('"'),
            '\'' => Some('\''),
            '[' => Some(']'),
            _ => None,
        };
        out.push(c);
    }

    out
}

fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("--") || trimmed.starts_with("//")
}

/// Drop trailing comment lines and statement terminators.
fn strip_trailing_directives(lines: &mut Vec<String>) {
    loop {
        let Some(last) = lines.last_mut() else {
            return;
        };

        if is_comment_line(last) {
            lines.pop();
            continue;
        }

        let trimmed = last.trim_end_matches(|c: char| c == ';' || c == ' ' || c == '\t');
        if trimmed.len() != last.len() {
            if trimmed.is_empty() {
                lines.pop();
            } else {
                *last = trimmed.to_string();
            }
            continue;
        }

        return;
    }
}
