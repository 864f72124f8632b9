use regex::Regex;

/// Characters kept on each side of a match.
pub const MATCH_CONTEXT_CHARS: usize = 50;
/// Length of the fallback preview.
pub const PREVIEW_CHARS: usize = 100;

const ELLIPSIS: &str = "...";

pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Window of `MATCH_CONTEXT_CHARS` around the first match of `pattern`, marked with an
/// ellipsis on each side that was cut. Falls back to `preview` when nothing matches.
pub fn excerpt(text: &str, pattern: &Regex) -> String {
    match pattern.find(text) {
        Some(m) => around(text, m.start(), m.end()),
        None => preview(text),
    }
}

/// `start`/`end` are byte offsets on char boundaries.
fn around(text: &str, start: usize, end: usize) -> String {
    let total = text.chars().count();
    let start_char = text[..start].chars().count();
    let end_char = start_char + text[start..end].chars().count();

    let from = start_char.saturating_sub(MATCH_CONTEXT_CHARS);
    let to = (end_char + MATCH_CONTEXT_CHARS).min(total);

    let mut out = String::new();
    if from > 0 {
        out.push_str(ELLIPSIS);
    }
    out.extend(text.chars().skip(from).take(to - from));
    if to < total {
        out.push_str(ELLIPSIS);
    }
    out
}
