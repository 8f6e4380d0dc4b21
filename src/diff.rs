//! Minimal text-replacement diffs for incremental document sync.
//!
//! The broker keeps the server on incremental sync no matter what clients
//! send, so every debounced flush needs the smallest set of LSP content
//! changes turning the stored snapshot into the tracker's snapshot. Diffing
//! a whole-file paste can take far longer than just resending the file, so
//! the computation runs under a deadline (cooperatively checked inside the
//! diff algorithm) and the caller falls back to one full-text replace when
//! it trips.

use std::time::Duration;

use lsp_types::{Position, Range, TextDocumentContentChangeEvent};
use ropey::Rope;
use similar::{Algorithm, DiffOp, TextDiffConfig};
use tokio::time::Instant;

use crate::error::{Error, Result};

pub const DEFAULT_DIFF_BUDGET: Duration = Duration::from_millis(20);

/// One coalesced replacement in character-offset space.
#[derive(Debug, PartialEq)]
struct CharEdit {
    old_start: usize,
    old_end: usize,
    new_start: usize,
    new_end: usize,
}

/// Computes the LSP content changes that turn `old` into `new`, in reverse
/// document order so earlier offsets stay valid while a peer applies them
/// top-down. Positions and range lengths are UTF-16 code units.
///
/// Fails with [`Error::Timeout`] when `budget` is exhausted; the caller is
/// expected to substitute a single full-text change.
pub fn lsp_diff(
    old: &str,
    new: &str,
    budget: Duration,
) -> Result<Vec<TextDocumentContentChangeEvent>> {
    if old == new {
        return Ok(Vec::new());
    }

    let started = Instant::now();
    let deadline = started + budget;

    let diff = TextDiffConfig::default()
        .algorithm(Algorithm::Myers)
        .deadline(deadline.into_std())
        .diff_chars(old, new);

    let mut edits: Vec<CharEdit> = Vec::new();
    for op in diff.ops() {
        let (old_range, new_range) = match op {
            DiffOp::Equal { .. } => continue,
            DiffOp::Delete {
                old_index, old_len, new_index, ..
            } => (*old_index..*old_index + *old_len, *new_index..*new_index),
            DiffOp::Insert {
                old_index, new_index, new_len, ..
            } => (*old_index..*old_index, *new_index..*new_index + *new_len),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => (
                *old_index..*old_index + *old_len,
                *new_index..*new_index + *new_len,
            ),
        };
        // Coalesce edits that touch at the same offset into one replacement.
        match edits.last_mut() {
            Some(last) if last.old_end == old_range.start && last.new_end == new_range.start => {
                last.old_end = old_range.end;
                last.new_end = new_range.end;
            }
            _ => edits.push(CharEdit {
                old_start: old_range.start,
                old_end: old_range.end,
                new_start: new_range.start,
                new_end: new_range.end,
            }),
        }
    }

    // The diff algorithm degrades under its deadline rather than aborting;
    // an exhausted budget still means the caller should resend the file.
    if Instant::now() >= deadline {
        return Err(Error::Timeout(budget));
    }

    let old_rope = Rope::from_str(old);
    let new_rope = Rope::from_str(new);

    let mut changes = Vec::with_capacity(edits.len());
    for edit in edits.iter().rev() {
        changes.push(TextDocumentContentChangeEvent {
            range: Some(Range {
                start: position_at(&old_rope, edit.old_start),
                end: position_at(&old_rope, edit.old_end),
            }),
            range_length: Some(utf16_width(&old_rope, edit.old_start, edit.old_end)),
            text: new_rope.slice(edit.new_start..edit.new_end).to_string(),
        });
    }

    if Instant::now() >= deadline {
        return Err(Error::Timeout(budget));
    }

    Ok(changes)
}

/// A change that replaces the whole document; what the broker sends when the
/// diff budget trips or the server only supports full sync.
pub fn full_replace(new_text: &str) -> TextDocumentContentChangeEvent {
    TextDocumentContentChangeEvent {
        range: None,
        range_length: None,
        text: new_text.to_string(),
    }
}

/// Converts a character offset into an LSP position over the same rope used
/// for line splitting, so trailing-newline handling cannot diverge.
fn position_at(text: &Rope, char_offset: usize) -> Position {
    let line = text.char_to_line(char_offset);
    let line_start = text.line_to_char(line);
    let character = text.char_to_utf16_cu(char_offset) - text.char_to_utf16_cu(line_start);
    Position {
        line: line as u32,
        character: character as u32,
    }
}

fn utf16_width(text: &Rope, start: usize, end: usize) -> u32 {
    (text.char_to_utf16_cu(end) - text.char_to_utf16_cu(start)) as u32
}
