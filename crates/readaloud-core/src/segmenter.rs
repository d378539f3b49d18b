//! Splitting cleaned chapter text into speakable units.
//!
//! Units are one paragraph (or one title) each, capped at `chunk_limit` UTF-16
//! code units so a single synthesis request stays bounded. UTF-16 is used for
//! every length and offset because resume offsets are stored that way.

use std::sync::Arc;

/// Smallest accepted limit; a surrogate pair must always fit in one unit.
pub const MIN_CHUNK_LIMIT: usize = 2;

/// One paragraph- or title-sized piece of chapter text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakableUnit {
    pub index: usize,
    pub text: String,
    pub is_title: bool,
}

impl SpeakableUnit {
    pub fn len_utf16(&self) -> usize {
        utf16_len(&self.text)
    }

    /// Text still to be spoken when resuming at `char_offset`.
    pub fn remaining_text(&self, char_offset: usize) -> &str {
        suffix_from_utf16(&self.text, char_offset)
    }

    pub fn is_trivial(&self) -> bool {
        is_trivial(&self.text)
    }
}

/// The unit list of one chapter, shared between the session and prefetch workers.
#[derive(Debug, Clone)]
pub struct ChapterUnits {
    pub chapter_index: usize,
    pub units: Arc<[SpeakableUnit]>,
}

impl ChapterUnits {
    pub fn new(chapter_index: usize, units: Vec<SpeakableUnit>) -> Self {
        Self {
            chapter_index,
            units: units.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, unit_index: usize) -> Option<&SpeakableUnit> {
        self.units.get(unit_index)
    }

    pub fn has_title(&self) -> bool {
        self.units.first().map(|u| u.is_title).unwrap_or(false)
    }

    /// Fractional reading position of `(unit_index, char_offset)` within the body text.
    ///
    /// Title units are excluded from both numerator and denominator.
    pub fn fraction_at(&self, unit_index: usize, char_offset: usize) -> f64 {
        let mut total = 0usize;
        let mut before = 0usize;
        for unit in self.units.iter().filter(|u| !u.is_title) {
            let len = unit.len_utf16();
            if unit.index < unit_index {
                before += len;
            } else if unit.index == unit_index {
                before += char_offset.min(len);
            }
            total += len;
        }
        if total == 0 {
            return 0.0;
        }
        (before as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Split cleaned chapter text into speakable units.
///
/// Blank lines are dropped, over-long lines are split at the last breakable
/// character at or before `chunk_limit`, and an optional title becomes unit 0.
pub fn segment(
    raw_cleaned_text: &str,
    title: &str,
    include_title: bool,
    chunk_limit: usize,
) -> Vec<SpeakableUnit> {
    let limit = chunk_limit.max(MIN_CHUNK_LIMIT);
    let mut pieces = Vec::new();
    for line in raw_cleaned_text.lines() {
        split_line(line, limit, &mut pieces);
    }

    let mut title_piece = None;
    if include_title {
        // Only the first piece of an over-long title is kept so unit 0 stays one unit.
        let mut title_pieces = Vec::new();
        split_line(title, limit, &mut title_pieces);
        title_piece = title_pieces.into_iter().next();
    }

    let mut units = Vec::with_capacity(pieces.len() + 1);
    let mut body = pieces.into_iter().peekable();
    if let Some(title) = title_piece {
        let first_is_title = body.peek().map(|first| *first == title).unwrap_or(false);
        if first_is_title {
            body.next();
        }
        units.push(SpeakableUnit {
            index: 0,
            text: title,
            is_title: true,
        });
    }
    for text in body {
        units.push(SpeakableUnit {
            index: units.len(),
            text,
            is_title: false,
        });
    }
    units
}

/// Join units back into text that [`segment`] reproduces unit-for-unit.
pub fn segment_to_text(units: &[SpeakableUnit]) -> String {
    units
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// A unit with nothing to pronounce: only whitespace and punctuation.
pub fn is_trivial(text: &str) -> bool {
    !text.chars().any(char::is_alphanumeric)
}

pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// The suffix of `text` starting at UTF-16 offset `offset`.
///
/// Offsets past the end give an empty string; an offset inside a surrogate pair
/// rounds down to the start of that character.
pub fn suffix_from_utf16(text: &str, offset: usize) -> &str {
    let mut units = 0usize;
    for (byte_idx, ch) in text.char_indices() {
        let next = units + ch.len_utf16();
        if next > offset {
            return &text[byte_idx..];
        }
        units = next;
    }
    ""
}

fn split_line(line: &str, limit: usize, out: &mut Vec<String>) {
    let mut rest = line.trim();
    while utf16_len(rest) > limit {
        let cut = break_point(rest, limit);
        let (head, tail) = rest.split_at(cut);
        let head = head.trim_end();
        if !head.is_empty() {
            out.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
}

/// Byte index to cut `text` at so the head fits in `limit` UTF-16 units.
fn break_point(text: &str, limit: usize) -> usize {
    let mut units = 0usize;
    let mut hard = 0usize;
    let mut soft = None;
    for (byte_idx, ch) in text.char_indices() {
        let next = units + ch.len_utf16();
        if next > limit {
            break;
        }
        units = next;
        hard = byte_idx + ch.len_utf8();
        if is_breakable(ch) {
            soft = Some(hard);
        }
    }
    if hard == 0 {
        return text.chars().next().map(char::len_utf8).unwrap_or(text.len());
    }
    soft.unwrap_or(hard)
}

fn is_breakable(ch: char) -> bool {
    ch.is_whitespace()
        || matches!(
            ch,
            '.' | ',' | '!' | '?' | ';' | ':' | '。' | '，' | '！' | '？' | '；' | '：' | '、' | '…'
        )
}
