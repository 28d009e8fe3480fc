//! Text preparation for embedding input and lexical matching.

use std::borrow::Cow;

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Default cap on embedding input (characters, roughly 8k tokens)
pub const DEFAULT_MAX_INPUT_CHARS: usize = 30_000;

/// Truncate `text` to at most `max_chars` characters.
///
/// Cuts on a char boundary; returns the input untouched when it already fits.
pub fn truncate_for_embedding(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Cow::Borrowed(&text[..byte_idx]),
        None => Cow::Borrowed(text),
    }
}

/// Fold text for accent- and case-insensitive matching.
///
/// Lowercases, decomposes (NFD) and drops combining marks, so
/// "Resolución" and "RESOLUCION" fold to the same string.
pub fn fold_for_match(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}
