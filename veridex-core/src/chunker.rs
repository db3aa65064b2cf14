//! Document chunking.
//!
//! Splits normalized text into overlapping passages, preferring semantic
//! boundaries (paragraph, then sentence, then whitespace) and falling back
//! to hard character cuts when a single unit exceeds the target size.
//!
//! Chunking is lazy: [`chunk`] returns an iterator so callers can consume
//! chunks incrementally for large documents without materializing the full
//! list.

use crate::error::ConfigError;
use crate::types::Chunk;

/// Normalize raw extracted text before chunking.
///
/// Collapses runs of spaces and tabs, normalizes line endings, and caps
/// blank-line runs at one (preserving paragraph breaks, which the chunker
/// uses as split points).
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.replace("\r\n", "\n").split('\n') {
        let mut collapsed = String::with_capacity(line.len());
        let mut in_space = false;
        for c in line.chars() {
            if c == ' ' || c == '\t' {
                if !in_space && !collapsed.is_empty() {
                    collapsed.push(' ');
                }
                in_space = true;
            } else {
                collapsed.push(c);
                in_space = false;
            }
        }
        let trimmed = collapsed.trim_end();

        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push_str("\n\n");
            }
        } else {
            if blank_run == 0 && !out.is_empty() {
                out.push('\n');
            }
            blank_run = 0;
            out.push_str(trimmed);
        }
    }

    out.trim_end().to_string()
}

/// Split `text` into overlapping chunks of at most `target_size` characters.
///
/// `target_size` and `overlap` must be positive with `overlap < target_size`.
/// Every character of input is covered by at least one chunk; neighboring
/// chunks share up to `overlap` characters so no semantic unit spanning a
/// boundary is lost entirely.
pub fn chunk(
    text: &str,
    document_id: &str,
    target_size: usize,
    overlap: usize,
) -> Result<ChunkIter, ConfigError> {
    if target_size == 0 {
        return Err(ConfigError::NonPositive {
            field: "chunk_size",
            value: target_size,
        });
    }
    if overlap == 0 {
        return Err(ConfigError::NonPositive {
            field: "chunk_overlap",
            value: overlap,
        });
    }
    if overlap >= target_size {
        return Err(ConfigError::InvalidChunking {
            chunk_size: target_size,
            overlap,
        });
    }
    Ok(ChunkIter {
        chars: text.chars().collect(),
        document_id: document_id.to_string(),
        target_size,
        overlap,
        pos: 0,
        prev_end: 0,
        seq: 0,
        done: false,
    })
}

/// Lazy chunk iterator. Offsets are character indices into the input.
pub struct ChunkIter {
    chars: Vec<char>,
    document_id: String,
    target_size: usize,
    overlap: usize,
    pos: usize,
    prev_end: usize,
    seq: usize,
    done: bool,
}

impl ChunkIter {
    /// Find the cut point for a chunk starting at `start`.
    ///
    /// Searches the second half of the window for, in order of preference, a
    /// paragraph break, a sentence end, or any whitespace; a window with no
    /// boundary is cut hard at `target_size` characters.
    fn cut_point(&self, start: usize) -> usize {
        let limit = (start + self.target_size).min(self.chars.len());
        if limit == self.chars.len() {
            return limit;
        }
        let floor = start + self.target_size / 2;

        // Paragraph break: cut after the second of two consecutive newlines.
        for i in (floor.max(start + 1)..limit).rev() {
            if self.chars[i] == '\n' && self.chars[i - 1] == '\n' {
                return i + 1;
            }
        }
        // Sentence end: terminal punctuation followed by whitespace.
        for i in (floor.max(1)..limit.saturating_sub(1)).rev() {
            if matches!(self.chars[i], '.' | '!' | '?') && self.chars[i + 1].is_whitespace() {
                return i + 2;
            }
        }
        // Any whitespace.
        for i in (floor.max(start + 1)..limit).rev() {
            if self.chars[i].is_whitespace() {
                return i + 1;
            }
        }
        // Hard cut.
        limit
    }
}

impl Iterator for ChunkIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done || self.pos >= self.chars.len() {
            return None;
        }

        let start = self.pos;
        let end = self.cut_point(start);
        let text: String = self.chars[start..end].iter().collect();

        let chunk = Chunk {
            document_id: self.document_id.clone(),
            seq: self.seq,
            text,
            start,
            end,
            // What this chunk actually shares with its predecessor; the
            // first chunk shares nothing.
            overlap: self.prev_end.saturating_sub(start),
        };

        if end >= self.chars.len() {
            self.done = true;
        } else {
            // Step back by `overlap`, but always make forward progress even
            // when a boundary cut produced a chunk shorter than the overlap.
            self.pos = end.saturating_sub(self.overlap).max(start + 1);
        }
        self.prev_end = end;
        self.seq += 1;
        Some(chunk)
    }
}
