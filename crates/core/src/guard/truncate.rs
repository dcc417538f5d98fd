/// Bytes held back from the cap so the truncation marker fits alongside the content.
pub const MARKER_RESERVE: usize = 96;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TruncatedText {
    pub text: String,
    pub shown_bytes: usize,
    pub total_bytes: usize,
    pub truncated: bool,
}

/// Caps `text` at `max_bytes`, preferring to cut at a line break, then at
/// whitespace, then at the nearest char boundary.
pub fn truncate_text(text: &str, max_bytes: usize) -> TruncatedText {
    let total_bytes = text.len();
    if total_bytes <= max_bytes {
        return TruncatedText {
            text: text.to_owned(),
            shown_bytes: total_bytes,
            total_bytes,
            truncated: false,
        };
    }

    let budget = content_budget(max_bytes);
    let cut = cut_point(text, budget);
    let shown = &text[..cut];
    let marker = format!("\n[... output truncated: showed {cut} of {total_bytes} bytes]");

    TruncatedText {
        text: format!("{shown}{marker}"),
        shown_bytes: cut,
        total_bytes,
        truncated: true,
    }
}

fn content_budget(max_bytes: usize) -> usize {
    if max_bytes > MARKER_RESERVE * 2 {
        max_bytes - MARKER_RESERVE
    } else {
        max_bytes
    }
}

fn cut_point(text: &str, budget: usize) -> usize {
    let mut end = budget.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let window = &text[..end];

    if let Some(index) = window.rfind('\n').filter(|index| *index > 0) {
        return index;
    }
    if let Some(index) = window.rfind(char::is_whitespace).filter(|index| *index > 0) {
        return index;
    }
    end
}
