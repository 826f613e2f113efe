use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Single-line preview for logs and the CLI: newlines escaped, cut at `n` chars.
pub fn snippet(s: &str, n: usize) -> Cow<'_, str> {
    let cut = prefix_chars(s, n);
    if cut.len() == s.len() && !s.contains('\n') {
        Cow::Borrowed(s)
    } else if cut.len() == s.len() {
        Cow::Owned(cut.replace('\n', "\\n"))
    } else {
        Cow::Owned(format!("{}...", cut.replace('\n', "\\n")))
    }
}

/// Chat title derived from the first message.
pub fn chat_name(first_message: &str, max_chars: usize) -> String {
    prefix_chars(first_message.trim(), max_chars).to_string()
}
