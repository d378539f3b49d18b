//! Turns raw chapter files into speakable prose.

use crate::config::AppConfig;
use once_cell::sync::Lazy;
use readaloud_core::TextCleaner;
use regex::Regex;
use std::cmp::Reverse;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

static RE_MARKUP_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[A-Za-z!][^>]*>").expect("valid tag regex"));
static RE_FOOTNOTE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[\d+\]:.*$").expect("valid footnote regex"));
static RE_MARKDOWN_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("valid link regex"));
static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#+[ \t]*").expect("valid heading regex"));
static RE_EMPHASIS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*{1,2}([^*\n]+)\*{1,2}").expect("valid emphasis regex"));
static RE_NUMERIC_BRACKET_CITE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*\d+(?:\s*,\s*\d+)*\s*\]").expect("valid citation regex"));
static RE_SUPERSCRIPT_CITE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[⁰¹²³⁴⁵⁶⁷⁸⁹]+").expect("valid superscript regex"));
static RE_HORIZONTAL_WS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\u{00A0}]+").expect("valid whitespace regex"));
static RE_SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+([,.;:!?])").expect("valid punctuation regex"));
static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank regex"));

#[derive(Debug, Clone)]
pub struct MarkupCleaner {
    strip_markup: bool,
    drop_bracket_citations: bool,
    /// Longest pattern first so overlapping rules prefer the specific one.
    replacements: Vec<(String, String)>,
}

impl MarkupCleaner {
    pub fn new(config: &AppConfig) -> Self {
        let mut replacements: Vec<(String, String)> = config
            .replacements
            .iter()
            .filter(|(from, _)| !from.is_empty())
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect();
        replacements.sort_by_key(|(from, _)| Reverse(from.chars().count()));
        Self {
            strip_markup: config.strip_markup,
            drop_bracket_citations: config.drop_bracket_citations,
            replacements,
        }
    }

    fn strip(&self, raw: &str) -> String {
        let mut text = if RE_MARKUP_TAG.is_match(raw) {
            // Wide lines so no hard wraps get baked into the prose.
            match html2text::from_read(raw.as_bytes(), 10_000) {
                Ok(plain) => RE_FOOTNOTE_LINE.replace_all(&plain, "").into_owned(),
                Err(err) => {
                    warn!("html2text failed, dropping tags instead: {err}");
                    RE_MARKUP_TAG.replace_all(raw, " ").into_owned()
                }
            }
        } else {
            raw.to_string()
        };
        text = RE_MARKDOWN_LINK.replace_all(&text, "$1").into_owned();
        text = RE_HEADING.replace_all(&text, "").into_owned();
        RE_EMPHASIS.replace_all(&text, "$1").into_owned()
    }
}

impl TextCleaner for MarkupCleaner {
    fn clean(&self, raw: &str) -> String {
        let mut text = if self.strip_markup {
            self.strip(raw)
        } else {
            raw.to_string()
        };
        if self.drop_bracket_citations {
            text = RE_NUMERIC_BRACKET_CITE.replace_all(&text, "").into_owned();
            text = RE_SUPERSCRIPT_CITE.replace_all(&text, "").into_owned();
        }
        for (from, to) in &self.replacements {
            if text.contains(from.as_str()) {
                text = text.replace(from.as_str(), to);
            }
        }
        text = text.nfc().collect();
        text = RE_HORIZONTAL_WS.replace_all(&text, " ").into_owned();
        text = RE_SPACE_BEFORE_PUNCT.replace_all(&text, "$1").into_owned();
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let joined = lines.join("\n");
        RE_BLANK_RUN.replace_all(joined.trim(), "\n\n").into_owned()
    }
}
