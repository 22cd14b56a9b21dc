//! Length-adaptive sliding-window chunker.
//!
//! Splits document text into overlapping windows whose size scales with the
//! document: short documents get windows near the configured minimum, long
//! documents get proportionally larger windows (capped), keeping the total
//! chunk count bounded. Window ends prefer paragraph, then sentence, then
//! word boundaries.

use crate::config::ChunkingConfig;

/// A chunk-to-be: contiguous text span plus its position in the document.
/// Embedding and the denormalized access triple are attached at write time
/// by the embedding manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub index: i64,
    pub text: String,
}

/// Window and overlap sizes (in chars) for a document of `text_chars` length.
pub fn chunk_plan(cfg: &ChunkingConfig, text_chars: usize) -> (usize, usize) {
    let window = (text_chars / cfg.target_chunks.max(1))
        .clamp(cfg.min_chunk_chars, cfg.max_chunk_chars);
    let overlap = window / cfg.overlap_divisor;
    (window, overlap)
}

/// Split `text` into overlapping chunks. Returns an empty vec for
/// empty/whitespace-only input (the caller treats that as unembeddable).
pub fn chunk_text(cfg: &ChunkingConfig, text: &str) -> Vec<ChunkSpan> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    // Char-index → byte-offset table so windows never split a code point.
    let byte_offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let total_chars = byte_offsets.len();
    let byte_at = |ci: usize| {
        if ci >= total_chars {
            text.len()
        } else {
            byte_offsets[ci]
        }
    };

    let (window, overlap) = chunk_plan(cfg, total_chars);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    loop {
        let hard_end = (start + window).min(total_chars);
        let end = if hard_end < total_chars {
            seek_boundary(text, byte_at(start), byte_at(hard_end))
                .map(|byte_pos| start + text[byte_at(start)..byte_pos].chars().count())
                // Only take a boundary that keeps the chunk at least half-sized.
                .filter(|&ci| ci >= start + window / 2)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let piece = text[byte_at(start)..byte_at(end)].trim();
        if !piece.is_empty() {
            chunks.push(ChunkSpan {
                index,
                text: piece.to_string(),
            });
            index += 1;
        }

        if end >= total_chars {
            break;
        }
        // Overlap the next window, but always make forward progress.
        start = (end.saturating_sub(overlap)).max(start + (window / 2).max(1));
    }

    chunks
}

/// Best break position inside `[start_byte, end_byte)`: paragraph break,
/// then sentence end, then whitespace. Returns an absolute byte offset.
fn seek_boundary(text: &str, start_byte: usize, end_byte: usize) -> Option<usize> {
    let slice = &text[start_byte..end_byte];
    if let Some(pos) = slice.rfind("\n\n") {
        return Some(start_byte + pos);
    }
    if let Some(pos) = slice.rfind(". ") {
        return Some(start_byte + pos + 1);
    }
    slice
        .rfind(|c: char| c.is_whitespace())
        .map(|pos| start_byte + pos)
}
