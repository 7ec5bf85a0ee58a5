//! Recursive character text chunker.
//!
//! Splits extracted document text into pieces of at most `chunk_size`
//! characters, preferring the coarsest boundary that works: paragraphs
//! (`\n\n`), then lines, then sentences, then words, and finally single
//! characters. Neighbouring pieces share up to `chunk_overlap` characters
//! of context so a fact straddling a boundary is retrievable from either
//! side.
//!
//! Lengths are counted in `char`s, never bytes, so multi-byte text is never
//! split inside a code point.

const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];

/// Split `text` into chunks. Returns an empty vector for blank input;
/// the caller treats that as a pipeline failure.
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size.saturating_sub(1));
    if text.trim().is_empty() {
        return Vec::new();
    }
    split_recursive(text, SEPARATORS, chunk_size, chunk_overlap)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_recursive(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    // First separator present in the text; "" always matches.
    let (idx, separator) = separators
        .iter()
        .enumerate()
        .find(|(_, s)| s.is_empty() || text.contains(**s))
        .map(|(i, s)| (i, *s))
        .unwrap_or((separators.len().saturating_sub(1), ""));
    let remaining = &separators[(idx + 1).min(separators.len())..];

    let pieces: Vec<String> = if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(separator)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };

    let mut out = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for piece in pieces {
        if char_len(&piece) <= chunk_size {
            pending.push(piece);
            continue;
        }
        if !pending.is_empty() {
            out.extend(merge_pieces(&pending, separator, chunk_size, chunk_overlap));
            pending.clear();
        }
        if remaining.is_empty() {
            out.push(piece);
        } else {
            out.extend(split_recursive(&piece, remaining, chunk_size, chunk_overlap));
        }
    }
    if !pending.is_empty() {
        out.extend(merge_pieces(&pending, separator, chunk_size, chunk_overlap));
    }
    out
}

/// Greedily pack small pieces into chunks, carrying a tail of at most
/// `chunk_overlap` characters into the next chunk.
fn merge_pieces(
    pieces: &[String],
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut chunks = Vec::new();
    let mut window: Vec<&str> = Vec::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(piece);
        let joined_len = |window: &[&str], total: usize| {
            total + len + if window.is_empty() { 0 } else { sep_len }
        };

        if joined_len(&window, total) > chunk_size && !window.is_empty() {
            push_chunk(&mut chunks, &window.join(separator));
            // Drop from the front until the tail fits the overlap budget
            // and leaves room for the incoming piece.
            while !window.is_empty()
                && (total > chunk_overlap || joined_len(&window, total) > chunk_size)
            {
                let first = window.remove(0);
                total -= char_len(first) + if window.is_empty() { 0 } else { sep_len };
            }
        }

        total += len + if window.is_empty() { 0 } else { sep_len };
        window.push(piece);
    }

    if !window.is_empty() {
        push_chunk(&mut chunks, &window.join(separator));
    }
    chunks
}

fn push_chunk(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}
