use std::borrow::Cow;

use unicode_width::UnicodeWidthChar;

/// Longest slug we emit. Keeps `<slug>-<id8>.md` well under common
/// filename limits even with multi-byte input collapsed to ASCII.
const MAX_SLUG_LEN: usize = 60;

/// Turns arbitrary text into a lowercase, filesystem-safe label.
///
/// ASCII letters and digits are kept, every other run of characters becomes a
/// single `-`, and leading/trailing dashes are trimmed. Returns an empty string
/// when nothing usable remains; callers pick their own fallback.
///
/// ```
/// use rivulet::util::slugify;
///
/// assert_eq!(slugify("Hello, World!"), "hello-world");
/// assert_eq!(slugify("  Rust 2024 -- Edition  "), "rust-2024-edition");
/// assert_eq!(slugify("日本語"), "");
/// ```
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_SLUG_LEN));
    let mut pending_dash = false;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                if out.len() + 2 > MAX_SLUG_LEN {
                    break;
                }
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
            if out.len() >= MAX_SLUG_LEN {
                break;
            }
        } else {
            pending_dash = true;
        }
    }

    out
}

/// SEC-001: Removes terminal control characters and ANSI escape sequences from
/// a single-line, publisher-controlled string (feed titles, authors) and
/// collapses internal whitespace.
///
/// Returns `Cow::Borrowed` when the input is already clean.
pub fn clean_inline(s: &str) -> Cow<'_, str> {
    let needs_work = s.chars().any(|c| c.is_control())
        || s.contains("  ")
        || s.starts_with(char::is_whitespace)
        || s.ends_with(char::is_whitespace);
    if !needs_work {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                // CSI: parameters until a final byte in 0x40..=0x7e
                Some('[') => {
                    chars.next();
                    for n in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ST
                Some(']') => {
                    chars.next();
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if c.is_control() {
            continue;
        }

        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }

    Cow::Owned(out)
}

/// Truncates `s` so it occupies at most `max_width` terminal columns,
/// appending `…` when anything was cut.
pub fn truncate_to_width(s: &str, max_width: usize) -> Cow<'_, str> {
    let total: usize = s.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= max_width {
        return Cow::Borrowed(s);
    }
    if max_width == 0 {
        return Cow::Borrowed("");
    }

    // One column is reserved for the ellipsis.
    let budget = max_width - 1;
    let mut used = 0;
    let mut out = String::new();
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push('…');
    Cow::Owned(out)
}
