/// Text segmenting for the speech API's per-request length limit
///
/// Long input is cut into an ordered list of segments, preferring line breaks,
/// then spaces, and falling back to a hard cut when a run has no delimiter.
/// All lengths are counted in characters, and cuts always land on UTF-8
/// boundaries.

/// One bounded slice of the input text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    /// Position of this segment in the original text (0-indexed)
    pub index: usize,
    pub text: String,
}

/// Split `text` into segments of at most `max_length` characters
///
/// The cut is made before the last newline within the first `max_length + 1`
/// characters, otherwise before the last space, otherwise exactly at
/// `max_length`. Leading whitespace of the remainder is dropped, and so is
/// any part that is nothing but whitespace.
///
/// # Examples
///
/// ```
/// use tts_batch::segmenter::split;
///
/// let parts = split("first line\nsecond line", 15);
/// assert_eq!(parts, vec!["first line", "second line"]);
/// ```
pub fn split(text: &str, max_length: usize) -> Vec<String> {
    // Zero would never make progress
    let max_length = max_length.max(1);
    let mut parts = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        // Byte offset of the first character past the limit
        let limit = match rest.char_indices().nth(max_length) {
            Some((byte_idx, _)) => byte_idx,
            None => {
                push_part(&mut parts, rest);
                break;
            }
        };

        // The delimiter itself may sit at position max_length
        let window_end = limit + rest[limit..].chars().next().map_or(0, char::len_utf8);
        let cut = find_cut(&rest[..window_end]).unwrap_or(limit);

        push_part(&mut parts, &rest[..cut]);
        rest = rest[cut..].trim_start();
    }

    parts
}

/// Split `text` and tag each part with its position
pub fn segments(text: &str, max_length: usize) -> Vec<TextSegment> {
    split(text, max_length)
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextSegment { index, text })
        .collect()
}

/// Whitespace-only parts would cost an API call for nothing
fn push_part(parts: &mut Vec<String>, part: &str) {
    if !part.trim().is_empty() {
        parts.push(part.to_string());
    }
}

/// Byte offset of the preferred delimiter, ignoring one at offset 0
fn find_cut(window: &str) -> Option<usize> {
    window
        .rfind('\n')
        .filter(|&i| i > 0)
        .or_else(|| window.rfind(' ').filter(|&i| i > 0))
}
