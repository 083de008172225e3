//! Splitting extracted document text into overlapping passages.
//!
//! Text is normalized first (see [`normalize_text`]), then cut into windows
//! of roughly `chunk_size` characters. Each cut prefers the strongest natural
//! boundary in the second half of the window: a paragraph break, then the end
//! of a sentence, then a line break, then any whitespace. Consecutive chunks
//! share about `chunk_overlap` characters, aligned to a word start.
//!
//! All offsets are character offsets into the normalized text.

use crate::settings::Settings;

/// A passage of a larger document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The chunk text content.
    pub text: String,
    /// Zero-based chunk index within the document.
    pub index: usize,
    /// Character offset where this chunk starts in the normalized text.
    pub start: usize,
    /// Character offset one past the chunk's last character.
    pub end: usize,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// Collapse horizontal whitespace, trim every line and keep at most two
/// consecutive blank lines.
///
/// ```
/// use docrag::chunking::normalize_text;
///
/// assert_eq!(normalize_text("  a   b \n\n\n\n\nc  "), "a b\n\n\nc");
/// ```
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            for _ in 0..blank_run.min(2) {
                out.push('\n');
            }
        }
        blank_run = 0;
        out.push_str(&collapsed);
    }

    out
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
    max_chunk_size: usize,
}

impl Chunker {
    pub fn new(
        chunk_size: usize,
        overlap: usize,
        min_chunk_size: usize,
        max_chunk_size: usize,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        let min_chunk_size = min_chunk_size.min(chunk_size);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
            min_chunk_size,
            max_chunk_size: max_chunk_size.max(chunk_size),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let c = &settings.chunking;
        Self::new(
            c.chunk_size,
            c.chunk_overlap,
            c.min_chunk_size,
            settings.max_chunk_size(),
        )
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Normalize `text` and split it into chunks.
    ///
    /// Whitespace-only input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let normalized = normalize_text(text);
        self.chunk_normalized(&normalized)
    }

    /// Split text that has already been through [`normalize_text`].
    pub fn chunk_normalized(&self, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();

        if n == 0 {
            tracing::debug!("empty document text, no chunks produced");
            return Vec::new();
        }

        let spans = self.spans(&chars);

        // Build a map of char index -> byte index for O(1) lookups
        let char_to_byte: Vec<usize> = text
            .char_indices()
            .map(|(byte_idx, _)| byte_idx)
            .chain(std::iter::once(text.len()))
            .collect();

        spans
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| Chunk {
                text: text[char_to_byte[start]..char_to_byte[end]].to_string(),
                index,
                start,
                end,
            })
            .collect()
    }

    fn spans(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let n = chars.len();
        let mut spans = Vec::new();
        let mut start = 0;

        while start < n {
            if n - start <= self.chunk_size {
                spans.push((start, n));
                break;
            }

            let end = self.find_boundary(chars, start);
            spans.push((start, end));
            start = self.next_start(chars, start, end);
        }

        if spans.len() > 1 {
            let last = spans.len() - 1;
            let (tail_start, tail_end) = spans[last];
            if tail_end - tail_start < self.min_chunk_size {
                let (prev_start, _) = spans[last - 1];
                if tail_end - prev_start <= self.max_chunk_size {
                    spans.pop();
                    spans[last - 1].1 = tail_end;
                } else {
                    spans[last].0 = tail_end.saturating_sub(self.min_chunk_size);
                }
            }
        }

        spans
    }

    /// End offset for the chunk beginning at `start`. Requires
    /// `start + chunk_size < chars.len()`.
    fn find_boundary(&self, chars: &[char], start: usize) -> usize {
        let hi = start + self.chunk_size;
        let lo = start + (self.chunk_size / 2).max(self.min_chunk_size).min(self.chunk_size);
        let window = || (lo..hi).rev();

        for i in window() {
            if chars[i] == '\n' && chars.get(i + 1) == Some(&'\n') && i > start {
                return i;
            }
        }
        for i in window() {
            if matches!(chars[i], '.' | '!' | '?')
                && chars.get(i + 1).is_some_and(|c| c.is_whitespace())
            {
                return i + 1;
            }
        }
        for i in window() {
            if chars[i] == '\n' && i > start {
                return i;
            }
        }
        for i in window() {
            if chars[i].is_whitespace() && i > start {
                return i;
            }
        }
        hi
    }

    fn next_start(&self, chars: &[char], start: usize, end: usize) -> usize {
        let mut next = end.saturating_sub(self.overlap).max(start + 1);
        if next >= end {
            next = end;
            while next < chars.len() && chars[next].is_whitespace() {
                next += 1;
            }
            return next;
        }

        let aligned = chars[next - 1].is_whitespace();
        if !aligned
            && let Some(offset) =
                chars[next..end].iter().position(|c| c.is_whitespace())
            && next + offset + 1 < end
        {
            next += offset + 1;
        }
        while next + 1 < end && chars[next].is_whitespace() {
            next += 1;
        }
        next
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Generate a chunk-specific document ID by combining the base ID with chunk index.
///
/// Format: `base_id XOR (chunk_index << 48)`.
/// Chunk 0 returns the base ID unchanged.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{chunk_doc_id, parse_chunk_doc_id};
///
/// let base = 12345678u64;
/// assert_eq!(chunk_doc_id(base, 0), base);
///
/// let chunk1 = chunk_doc_id(base, 1);
/// assert_ne!(chunk1, base);
/// let (recovered, idx) = parse_chunk_doc_id(chunk1);
/// assert_eq!(recovered, base);
/// assert_eq!(idx, 1);
/// ```
pub fn chunk_doc_id(base_id: u64, chunk_index: usize) -> u64 {
    if chunk_index == 0 {
        base_id
    } else {
        base_id ^ ((chunk_index as u64) << 48)
    }
}

/// Extract the base document ID and chunk index from a chunk doc ID.
///
/// Only exact when the base ID's top 16 bits are zero; callers that know the
/// base ID should compare against [`chunk_doc_id`] instead.
pub fn parse_chunk_doc_id(chunk_id: u64) -> (u64, usize) {
    let chunk_index = (chunk_id >> 48) as usize;
    if chunk_index == 0 {
        (chunk_id, 0)
    } else {
        let base_id = chunk_id ^ ((chunk_index as u64) << 48);
        (base_id, chunk_index)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn small() -> Chunker {
        Chunker::new(200, 40, 30, 300)
    }

    fn sentences(n: usize) -> String {
        (0..n)
            .map(|i| format!("Sentence number {i} talks about topic {}.", i % 7))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn normalize_collapses_whitespace_and_blank_lines() {
        let text = "  Hello \t  world  \n\n\n\n\n  next   line \n";
        assert_eq!(normalize_text(text), "Hello world\n\n\nnext line");
    }

    #[test]
    fn normalize_keeps_single_paragraph_breaks() {
        assert_eq!(normalize_text("a\n\nb\nc"), "a\n\nb\nc");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(Chunker::default().chunk("").is_empty());
        assert!(Chunker::default().chunk(" \n\t \n").is_empty());
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks = Chunker::default().chunk("Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].index, 0);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 13));
    }

    #[test]
    fn short_single_chunk_may_be_below_minimum() {
        let chunks = Chunker::default().chunk("tiny");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].char_len() < 100);
    }

    #[test]
    fn prefers_paragraph_break() {
        let first = "a".repeat(150);
        let text = format!("{first}.\n\n{}", "word ".repeat(60));
        let chunks = small().chunk(&text);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].text, format!("{first}."));
    }

    #[test]
    fn prefers_sentence_end_over_whitespace() {
        let text = sentences(20);
        let chunks = small().chunk(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.text.ends_with('.'), "chunk ended mid-sentence: {:?}", c.text);
        }
    }

    #[test]
    fn hard_cut_without_any_boundary() {
        let text = "x".repeat(450);
        let chunks = small().chunk(&text);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].char_len(), 200);
    }

    #[test]
    fn spans_match_text() {
        let text = normalize_text(&sentences(30));
        let chars: Vec<char> = text.chars().collect();
        for c in small().chunk_normalized(&text) {
            let expected: String = chars[c.start..c.end].iter().collect();
            assert_eq!(c.text, expected);
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let chunks = small().chunk(&sentences(30));
        assert!(chunks.len() >= 3);
        for w in chunks.windows(2) {
            assert!(w[1].start < w[0].end, "no overlap between {} and {}", w[0].index, w[1].index);
            assert!(w[1].start > w[0].start);
        }
    }

    #[test]
    fn short_tail_is_merged_into_previous() {
        let chunker = Chunker::new(100, 0, 30, 150);
        let text = format!("{} tail", "abcd ".repeat(20));
        let chunks = chunker.chunk(&text);
        let last = chunks.last().unwrap();
        assert!(last.text.ends_with("tail"));
        assert!(last.char_len() >= 30);
        assert!(last.char_len() <= 150);
    }

    #[test]
    fn short_tail_extended_backwards_when_merge_too_long() {
        let chunker = Chunker::new(100, 0, 30, 100);
        let text = format!("{} tail", "abcd ".repeat(20));
        let chunks = chunker.chunk(&text);
        let last = chunks.last().unwrap();
        assert!(last.text.ends_with("tail"));
        assert_eq!(last.char_len(), 30);
    }

    #[test]
    fn handles_emoji_and_multibyte_chars() {
        let emoji_text = "Hello 👉 world 🌍 test ".repeat(100);
        let chunks = Chunker::new(200, 50, 40, 300).chunk(&emoji_text);

        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(!chunk.text.is_empty());
            assert_eq!(chunk.text.chars().count(), chunk.char_len());
        }
    }

    #[test]
    fn handles_mixed_length_unicode() {
        let text = "café ☕ naïve 日本語 🎉 ".repeat(50);
        let chunks = Chunker::new(100, 20, 20, 150).chunk(&text);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn chunk_doc_id_roundtrip() {
        let base = 12345678u64;
        assert_eq!(chunk_doc_id(base, 0), base);
        let (recovered, idx) = parse_chunk_doc_id(chunk_doc_id(base, 3));
        assert_eq!(recovered, base);
        assert_eq!(idx, 3);
    }

    proptest! {
        #[test]
        fn chunk_lengths_stay_within_bounds(
            words in prop::collection::vec("[a-zé]{1,12}[.!?]?", 1..400),
            chunk_size in 60usize..300,
            overlap_pct in 0usize..40,
        ) {
            let text = words.join(" ");
            let overlap = chunk_size * overlap_pct / 100;
            let min = chunk_size / 4;
            let max = chunk_size + chunk_size / 2;
            let chunker = Chunker::new(chunk_size, overlap, min, max);
            let chunks = chunker.chunk(&text);

            prop_assert!(!chunks.is_empty());
            if chunks.len() > 1 {
                for c in &chunks {
                    prop_assert!(c.char_len() >= min, "chunk {} too short: {}", c.index, c.char_len());
                    prop_assert!(c.char_len() <= max, "chunk {} too long: {}", c.index, c.char_len());
                }
            }
        }

        #[test]
        fn overlap_never_exceeds_configured(
            words in prop::collection::vec("[a-z]{1,10}", 50..400),
            overlap in 1usize..60,
        ) {
            let text = words.join(" ");
            let chunker = Chunker::new(200, overlap, 50, 300);
            let chunks = chunker.chunk(&text);
            if chunks.len() > 2 {
                for w in chunks[..chunks.len() - 1].windows(2) {
                    let shared = w[0].end.saturating_sub(w[1].start);
                    prop_assert!(shared <= overlap);
                    prop_assert!(w[1].start > w[0].start);
                }
            }
        }

        #[test]
        fn chunks_cover_whole_text(
            words in prop::collection::vec("[a-z]{1,10}", 1..300),
        ) {
            let text = words.join(" ");
            let chunks = Chunker::new(120, 20, 30, 180).chunk(&text);
            prop_assert_eq!(chunks[0].start, 0);
            prop_assert_eq!(chunks.last().unwrap().end, text.chars().count());
            for w in chunks.windows(2) {
                prop_assert!(w[1].start <= w[0].end);
            }
        }
    }
}
