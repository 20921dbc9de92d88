//! Boundary-aware overlapping text chunker.
//!
//! Splits a document body into spans of at most `hard_limit` characters that
//! prefer to start and end on sentence boundaries, then word boundaries, and
//! only fall back to hard cuts when neither fits.
//!
//! # Algorithm
//!
//! 1. Lay out raw windows `[n × chunk_len, (n + 1) × chunk_len + overlap_len)`
//!    until a window would start at or past the end of the body.
//! 2. For each window, scan left from the raw start and right from the raw
//!    end for the nearest sentence boundary (`". "`, `"! "`, `"? "`, `".\n"`,
//!    `"!\n"`, `"?\n"`, `"\n\n"`) and, independently, the nearest word
//!    boundary (space, tab, newline). Scans stop at `0` and at the body
//!    length.
//! 3. Take the first combination whose length fits `hard_limit`, in order:
//!    sentence/sentence, sentence/word, word/sentence, word/word,
//!    word/raw end, raw start/word. Otherwise keep the raw window.
//! 4. Drop the last span when it ends where the one before it ends.
//! 5. Drop every span contained in another one. Of identical spans only the
//!    first survives. The span ending at the body length is never contained
//!    by anything but another span ending there, so coverage is unchanged.
//!
//! Positions are character offsets (Unicode scalar values), so a span never
//! cuts through a multi-byte character. Use [`slice_chars`] to extract the
//! text of a span.
//!
//! # Example
//!
//! ```rust
//! use stuart::chunk::{chunk_text, slice_chars, ChunkParams};
//!
//! let body = "Hello world. This is a test.";
//! let params = ChunkParams { chunk_len: 10, overlap_len: 2, hard_limit: 15 };
//! let spans = chunk_text(body, &params).unwrap();
//! assert_eq!(slice_chars(body, spans[0]), "Hello world. ");
//! assert_eq!(spans.last().unwrap().end, body.chars().count());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SENTENCE_DELIMITERS: [[char; 2]; 7] = [
    ['.', ' '],
    ['!', ' '],
    ['?', ' '],
    ['.', '\n'],
    ['!', '\n'],
    ['?', '\n'],
    ['\n', '\n'],
];

const WORD_DELIMITERS: [char; 3] = [' ', '\t', '\n'];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid chunking parameters: {0}")]
    InvalidParameters(String),
    #[error("chunker consistency check failed: {0}")]
    Consistency(String),
}

/// Window sizes, all in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub chunk_len: usize,
    pub overlap_len: usize,
    pub hard_limit: usize,
}

impl ChunkParams {
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.chunk_len < 1 || self.hard_limit < 1 {
            return Err(ChunkError::InvalidParameters(format!(
                "chunk_len ({}) and hard_limit ({}) must be >= 1",
                self.chunk_len, self.hard_limit
            )));
        }
        if self.chunk_len + self.overlap_len > self.hard_limit {
            return Err(ChunkError::InvalidParameters(format!(
                "chunk_len + overlap_len ({}) exceeds hard_limit ({})",
                self.chunk_len + self.overlap_len,
                self.hard_limit
            )));
        }
        if self.overlap_len > self.chunk_len {
            return Err(ChunkError::InvalidParameters(format!(
                "overlap_len ({}) exceeds chunk_len ({})",
                self.overlap_len, self.chunk_len
            )));
        }
        Ok(())
    }
}

/// Half-open character range `[start, end)` of a document body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Left,
    Right,
}

impl Direction {
    fn step(self) -> isize {
        match self {
            Direction::Left => -1,
            Direction::Right => 1,
        }
    }
}

/// Split `body` into boundary-aware spans.
///
/// Returns an empty list for an empty body. Otherwise the spans are ordered,
/// each is at most `hard_limit` long, none lies inside another, and the last
/// one ends at the body's character count.
///
/// # Errors
///
/// [`ChunkError::InvalidParameters`] when `params` are inconsistent, and
/// [`ChunkError::Consistency`] if a produced span breaks the bounds above.
pub fn chunk_text(body: &str, params: &ChunkParams) -> Result<Vec<Span>, ChunkError> {
    params.validate()?;

    let chars: Vec<char> = body.chars().collect();
    let len = chars.len();

    let mut spans = Vec::new();
    let mut n = 0usize;
    while n * params.chunk_len < len {
        spans.push(Span {
            start: n * params.chunk_len,
            end: (n + 1) * params.chunk_len + params.overlap_len,
        });
        n += 1;
    }

    for span in spans.iter_mut() {
        *span = fit_span(&chars, *span, params.hard_limit);
        if span.len() > params.hard_limit || span.start >= span.end || span.end > len {
            return Err(ChunkError::Consistency(format!(
                "span {}..{} violates bounds (hard_limit {}, body length {})",
                span.start, span.end, params.hard_limit, len
            )));
        }
    }

    if spans.len() >= 2 && spans[spans.len() - 1].end == spans[spans.len() - 2].end {
        spans.pop();
    }
    let spans = drop_contained(spans);

    if let Some(last) = spans.last() {
        if last.end != len {
            return Err(ChunkError::Consistency(format!(
                "last span ends at {} but body length is {}",
                last.end, len
            )));
        }
    }

    Ok(spans)
}

/// Remove spans that lie inside another span, keeping order.
fn drop_contained(spans: Vec<Span>) -> Vec<Span> {
    let inside = |inner: &Span, outer: &Span| outer.start <= inner.start && inner.end <= outer.end;
    spans
        .iter()
        .enumerate()
        .filter(|&(i, span)| {
            !spans
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && inside(span, other) && (other != span || j < i))
        })
        .map(|(_, span)| *span)
        .collect()
}

/// Grow or shrink a raw window to the nicest boundaries within `hard_limit`.
fn fit_span(chars: &[char], raw: Span, hard_limit: usize) -> Span {
    let start_s = find_sentence_boundary(chars, raw.start, Direction::Left);
    let end_s = find_sentence_boundary(chars, raw.end, Direction::Right);
    let start_w = find_word_boundary(chars, raw.start, Direction::Left);
    let end_w = find_word_boundary(chars, raw.end, Direction::Right);

    let candidates = [
        (start_s, end_s),
        (start_s, end_w),
        (start_w, end_s),
        (start_w, end_w),
        (start_w, raw.end),
        (raw.start, end_w),
    ];

    candidates
        .into_iter()
        .find(|&(start, end)| end.saturating_sub(start) <= hard_limit)
        .map(|(start, end)| Span { start, end })
        .unwrap_or(raw)
}

/// Position just past the nearest sentence delimiter, scanning from two
/// characters before `pos`.
fn find_sentence_boundary(chars: &[char], pos: usize, direction: Direction) -> usize {
    let len = chars.len() as isize;
    let mut pos = pos as isize - 2;
    loop {
        match direction {
            Direction::Left if pos < 0 => return 0,
            Direction::Right if pos >= len => return chars.len(),
            _ => {}
        }
        if pos >= 0 && pos + 2 <= len {
            let (a, b) = (chars[pos as usize], chars[pos as usize + 1]);
            if SENTENCE_DELIMITERS.iter().any(|d| d[0] == a && d[1] == b) {
                return pos as usize + 2;
            }
        }
        pos += direction.step();
    }
}

/// Position just past the nearest whitespace, scanning from one character
/// before `pos`.
fn find_word_boundary(chars: &[char], pos: usize, direction: Direction) -> usize {
    let len = chars.len() as isize;
    let mut pos = pos as isize - 1;
    loop {
        match direction {
            Direction::Left if pos < 0 => return 0,
            Direction::Right if pos >= len => return chars.len(),
            _ => {}
        }
        if pos >= 0 && WORD_DELIMITERS.contains(&chars[pos as usize]) {
            return pos as usize + 1;
        }
        pos += direction.step();
    }
}

/// Extract the text of a character span.
///
/// Out-of-range positions are clamped to the end of `body`.
pub fn slice_chars(body: &str, span: Span) -> &str {
    let mut offsets = body
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(body.len()));
    let start = offsets.nth(span.start).unwrap_or(body.len());
    let end = if span.end <= span.start {
        start
    } else {
        offsets.nth(span.end - span.start - 1).unwrap_or(body.len())
    };
    &body[start..end]
}
