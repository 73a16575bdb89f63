//! Paragraph-boundary chunker.
//!
//! Runs of text are packed paragraph by paragraph into chunks of at most
//! `max_tokens` (approximated as 4 chars per token). Each text chunk after
//! the first in a run starts with the tail of its predecessor
//! (`overlap_tokens`), so a sentence cut at a boundary is still retrievable.
//! Tables and equations are never merged with prose; each becomes its own
//! chunk tagged with its [`Modality`].
//!
//! Every chunk carries a SHA-256 of its text, used to detect stale embeddings.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, Modality};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Input to the chunker: a piece of content and what kind it is.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub modality: Modality,
    pub text: String,
}

impl Segment {
    pub fn new(modality: Modality, text: impl Into<String>) -> Self {
        Self {
            modality,
            text: text.into(),
        }
    }
}

/// Chunk a sequence of segments. Indices are contiguous from 0 across the
/// whole document; blank segments produce no chunks.
pub fn chunk_segments(
    document_id: &str,
    segments: &[Segment],
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    let mut text_run: Vec<&str> = Vec::new();

    for segment in segments {
        if segment.modality == Modality::Text {
            text_run.push(&segment.text);
            continue;
        }
        flush_text_run(document_id, &mut text_run, max_chars, overlap_chars, &mut chunks);
        for piece in hard_split(segment.text.trim(), max_chars) {
            let index = chunks.len() as i64;
            chunks.push(make_chunk(document_id, index, segment.modality, piece));
        }
    }
    flush_text_run(document_id, &mut text_run, max_chars, overlap_chars, &mut chunks);
    chunks
}

fn flush_text_run(
    document_id: &str,
    run: &mut Vec<&str>,
    max_chars: usize,
    overlap_chars: usize,
    out: &mut Vec<Chunk>,
) {
    if run.is_empty() {
        return;
    }
    let joined = run.join("\n\n");
    run.clear();

    let pieces = pack_paragraphs(&joined, max_chars);
    let mut previous: Option<&str> = None;
    for piece in &pieces {
        let text = match previous {
            Some(prev) if overlap_chars > 0 => {
                let tail = overlap_tail(prev, overlap_chars);
                if tail.is_empty() {
                    piece.clone()
                } else {
                    format!("{} {}", tail, piece)
                }
            }
            _ => piece.clone(),
        };
        let index = out.len() as i64;
        out.push(make_chunk(document_id, index, Modality::Text, &text));
        previous = Some(piece.as_str());
    }
}

/// Greedy paragraph packing; oversized paragraphs are hard split.
fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            pieces.extend(hard_split(trimmed, max_chars).into_iter().map(str::to_string));
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }
    pieces
}

/// Split at most every `max_chars` bytes, preferring newline then space
/// boundaries and never cutting inside a UTF-8 sequence.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            let piece = remaining.trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            break;
        }
        let limit = floor_char_boundary(remaining, max_chars);
        let head = &remaining[..limit];
        let split_at = head
            .rfind('\n')
            .or_else(|| head.rfind(' '))
            .map(|pos| pos + 1)
            .filter(|&pos| pos > 0)
            .unwrap_or(if limit == 0 {
                next_char_boundary(remaining)
            } else {
                limit
            });
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        remaining = &remaining[split_at..];
    }
    out
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(s.len())
}

/// Last `overlap_chars` of `text`, advanced to the next word start.
fn overlap_tail(text: &str, overlap_chars: usize) -> &str {
    if text.len() <= overlap_chars {
        return text;
    }
    let mut start = text.len() - overlap_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
}

fn make_chunk(document_id: &str, index: i64, modality: Modality, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        modality,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
