//! Text chunking for RAG.
//!
//! Two policies are provided:
//! - a character window with overlap that prefers to end on a sentence or
//!   line break, for free-form documents
//! - a literal separator split, for curated markdown with explicit sections
//!
//! Windows are measured in characters, not bytes, so multi-byte text is never
//! split inside a code point.

use thiserror::Error;

/// Errors caused by invalid chunking parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    InvalidSize,

    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { overlap: usize, size: usize },

    #[error("markdown separator must not be empty")]
    EmptySeparator,
}

pub type Result<T> = std::result::Result<T, ChunkError>;

/// Splits `text` into windows of at most `chunk_size` characters.
///
/// A window that does not reach the end of the text is cut after its last `.`
/// or newline when that break lies past half the window. The next window starts
/// `overlap` characters before the previous end. Chunks are trimmed and empty
/// ones dropped.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    check_params(chunk_size, overlap)?;

    let chars: Vec<char> = text.chars().collect();
    let chunks = windows(&chars, chunk_size, overlap)
        .into_iter()
        .filter_map(|(start, end)| {
            let chunk: String = chars[start..end].iter().collect();
            let trimmed = chunk.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect();

    Ok(chunks)
}

/// Splits on every occurrence of `separator`, trimming pieces and dropping
/// empty ones. No size bound and no overlap.
pub fn chunk_by_markdown_separator(text: &str, separator: &str) -> Result<Vec<String>> {
    if separator.is_empty() {
        return Err(ChunkError::EmptySeparator);
    }

    Ok(text
        .split(separator)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect())
}

/// Collapses every whitespace run into a single space.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn check_params(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(ChunkError::InvalidSize);
    }
    if overlap >= chunk_size {
        return Err(ChunkError::OverlapTooLarge {
            overlap,
            size: chunk_size,
        });
    }
    Ok(())
}

/// Character ranges `[start, end)` of each window, before trimming.
fn windows(chars: &[char], chunk_size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let len = chars.len();
    let mut ranges = Vec::new();
    let mut start = 0;

    while start < len {
        let mut end = (start + chunk_size).min(len);

        if end < len {
            let window = &chars[start..end];
            if let Some(break_point) = window.iter().rposition(|&c| c == '.' || c == '\n') {
                if break_point * 2 > chunk_size {
                    end = start + break_point + 1;
                }
            }
        }

        ranges.push((start, end));

        if end >= len {
            break;
        }
        // A sentence cut can shorten the window below the overlap.
        start = end.saturating_sub(overlap).max(start + 1);
    }

    ranges
}
