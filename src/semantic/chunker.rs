//! Fixed-size chunking with overlap.
//!
//! Sizes are measured in characters, not bytes, so multi-byte text is never
//! cut inside a code point. Each segment after the first starts exactly
//! `overlap` characters before the end of the previous one, which makes the
//! split lossless: the first segment followed by every later segment minus
//! its first `overlap` characters is the original text.
//!
//! A cut prefers the last whitespace within the final tenth of the window so
//! words are not split when avoidable.

/// Default target segment length in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 3000;

/// Default overlap between consecutive segments in characters.
pub const DEFAULT_OVERLAP: usize = 300;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("overlap ({overlap}) must be smaller than chunk size ({chunk_size})")]
    OverlapTooLarge { chunk_size: usize, overlap: usize },
}

/// Split `text` into ordered, overlapping segments of at most `chunk_size`
/// characters.
///
/// Blank text yields no segments. Text no longer than `chunk_size` yields a
/// single segment equal to the input. The final segment is always kept, no
/// matter how short.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>, ChunkError> {
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }
    if overlap >= chunk_size {
        return Err(ChunkError::OverlapTooLarge {
            chunk_size,
            overlap,
        });
    }

    if text.trim().is_empty() {
        return Ok(vec![]);
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    if total <= chunk_size {
        return Ok(vec![text.to_string()]);
    }

    let mut segments = Vec::with_capacity(total / (chunk_size - overlap) + 1);
    let mut start = 0;

    loop {
        let target_end = (start + chunk_size).min(total);
        let end = if target_end == total {
            total
        } else {
            // the next start must move forward, so never cut inside the overlap
            find_break_point(&chars, start + overlap + 1, target_end, chunk_size / 10)
        };

        segments.push(chars[start..end].iter().collect());

        if end == total {
            break;
        }
        start = end - overlap;
    }

    Ok(segments)
}

/// Find a cut at or before `target_end` that follows whitespace.
///
/// Only the last `window` characters are considered, and never anything
/// before `min_end`. Falls back to `target_end`.
fn find_break_point(chars: &[char], min_end: usize, target_end: usize, window: usize) -> usize {
    let lowest = target_end.saturating_sub(window).max(min_end);

    (lowest..=target_end)
        .rev()
        .find(|&i| i > 0 && chars[i - 1].is_whitespace())
        .unwrap_or(target_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(segments: &[String], overlap: usize) -> String {
        let mut out = String::new();
        for (i, segment) in segments.iter().enumerate() {
            if i == 0 {
                out.push_str(segment);
            } else {
                out.extend(segment.chars().skip(overlap));
            }
        }
        out
    }

    fn sample_text(words: usize) -> String {
        (0..words)
            .map(|i| format!("palabra{} ", i % 97))
            .collect::<String>()
    }

    #[test]
    fn test_short_text_is_single_segment() {
        let text = "A short regulation.";
        let segments = chunk_text(text, 3000, 300).unwrap();
        assert_eq!(segments, vec![text.to_string()]);
    }

    #[test]
    fn test_exact_size_is_single_segment() {
        let text = "x".repeat(100);
        let segments = chunk_text(&text, 100, 10).unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_blank_text_has_no_segments() {
        assert!(chunk_text("", 100, 10).unwrap().is_empty());
        assert!(chunk_text("  \n\t ", 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(chunk_text("abc", 0, 0), Err(ChunkError::ZeroChunkSize));
        assert_eq!(
            chunk_text("abc", 10, 10),
            Err(ChunkError::OverlapTooLarge {
                chunk_size: 10,
                overlap: 10
            })
        );
    }

    #[test]
    fn test_segments_respect_size_bound() {
        let text = sample_text(2000);
        let segments = chunk_text(&text, 3000, 300).unwrap();

        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(segment.chars().count() <= 3000);
        }
    }

    #[test]
    fn test_reconstruction_is_lossless() {
        for (size, overlap) in [(3000, 300), (100, 10), (50, 49), (7, 0)] {
            let text = sample_text(900);
            let segments = chunk_text(&text, size, overlap).unwrap();
            assert_eq!(reconstruct(&segments, overlap), text, "size={size} overlap={overlap}");
        }
    }

    #[test]
    fn test_reconstruction_without_whitespace() {
        let text = "abcdefghij".repeat(120);
        let segments = chunk_text(&text, 100, 30).unwrap();
        assert_eq!(reconstruct(&segments, 30), text);
        assert!(segments[..segments.len() - 1]
            .iter()
            .all(|s| s.chars().count() == 100));
    }

    #[test]
    fn test_multibyte_text_is_cut_on_char_boundaries() {
        let text = "áéíóú ñandú çà 日本語 ".repeat(200);
        let segments = chunk_text(&text, 64, 8).unwrap();
        assert_eq!(reconstruct(&segments, 8), text);
        for segment in &segments {
            assert!(segment.chars().count() <= 64);
        }
    }

    #[test]
    fn test_consecutive_segments_share_overlap() {
        let text = sample_text(500);
        let overlap = 40;
        let segments = chunk_text(&text, 400, overlap).unwrap();

        for pair in segments.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let tail: String = prev[prev.len() - overlap..].iter().collect();
            let head: String = pair[1].chars().take(overlap).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn test_last_segment_is_kept_even_if_tiny() {
        // 101 chars with size 100 / overlap 10: second segment starts at 90
        let text = "y".repeat(101);
        let segments = chunk_text(&text, 100, 10).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].chars().count(), 11);
    }

    #[test]
    fn test_prefers_whitespace_cut() {
        let text = format!("{} {}", "a".repeat(95), "b".repeat(50));
        let segments = chunk_text(&text, 100, 10).unwrap();
        // cut right after the space at position 95
        assert_eq!(segments[0].chars().count(), 96);
        assert!(segments[0].ends_with(' '));
    }

    #[test]
    fn test_deterministic() {
        let text = sample_text(1500);
        let first = chunk_text(&text, 500, 50).unwrap();
        let second = chunk_text(&text, 500, 50).unwrap();
        assert_eq!(first, second);
    }
}
