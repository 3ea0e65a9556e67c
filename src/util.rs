//! Shared helpers: slugs, branch names, text truncation and JSON extraction.

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        // ASCII only, so byte and char boundaries coincide
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Branch name for a new task: `<prefix>/<slug>-<suffix>`.
///
/// The suffix is the last six digits of the Unix timestamp, which keeps
/// repeated runs of the same description from colliding.
pub fn branch_name(prefix: &str, description: &str, unix_secs: u64) -> String {
    let mut slug = slugify(description, 40);
    if slug.is_empty() {
        slug = "task".to_string();
    }
    format!("{}/{}-{:06}", prefix, slug, unix_secs % 1_000_000)
}

/// Truncate to at most `max_chars` characters, appending `...` when shortened.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Keep the last `max_chars` characters, prefixing `...` when shortened.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", kept)
}

/// Extract the outermost bracketed JSON value (`open`..`close`) from text that
/// may contain other content. Brace counting ignores brackets inside strings.
fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract a JSON object from text that may contain other content.
pub fn extract_json_object(text: &str) -> Option<String> {
    extract_balanced(text, '{', '}')
}

/// Extract a JSON array from text that may contain other content.
pub fn extract_json_array(text: &str) -> Option<String> {
    extract_balanced(text, '[', ']')
}
