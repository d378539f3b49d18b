//! Voice selection for remote synthesis.
//!
//! Priority: an explicit per-speaker mapping, then the per-role voice
//! (dialogue or narration), then the default voice.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use unicode_normalization::UnicodeNormalization;

const QUOTE_MARKS: &[char] = &['"', '“', '”', '「', '」', '『', '』', '«', '»', '„'];

static RE_SPEAKER_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?P<speaker>[^:：“”"「」『』\s][^:：“”"「」『』]{0,31}?)\s*[:：]\s*["“「『]"#)
        .expect("speaker tag pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceProfile {
    pub default_voice: Option<String>,
    pub narration_voice: Option<String>,
    pub dialogue_voice: Option<String>,
    /// Speaker name to voice id. Names match case-insensitively after NFKC normalization.
    pub speaker_voices: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceRole {
    Narration,
    Dialogue,
}

impl VoiceProfile {
    /// Whether any remote voice can be chosen for some unit.
    pub fn has_remote_voice(&self) -> bool {
        self.default_voice.is_some()
            || self.narration_voice.is_some()
            || self.dialogue_voice.is_some()
            || !self.speaker_voices.is_empty()
    }

    /// Voice id for `text`, or `None` when no remote voice applies.
    pub fn select(&self, text: &str, is_title: bool) -> Option<&str> {
        if !is_title {
            if let Some(voice) = self.speaker_voice(text) {
                return Some(voice);
            }
        }
        let role = if is_title {
            VoiceRole::Narration
        } else {
            role_of(text)
        };
        let role_voice = match role {
            VoiceRole::Narration => self.narration_voice.as_deref(),
            VoiceRole::Dialogue => self.dialogue_voice.as_deref(),
        };
        role_voice.or(self.default_voice.as_deref())
    }

    fn speaker_voice(&self, text: &str) -> Option<&str> {
        if self.speaker_voices.is_empty() {
            return None;
        }
        if let Some(caps) = RE_SPEAKER_TAG.captures(text) {
            let tagged = normalize_name(&caps["speaker"]);
            if let Some(voice) = self
                .speaker_voices
                .iter()
                .find(|(name, _)| normalize_name(name) == tagged)
                .map(|(_, voice)| voice.as_str())
            {
                return Some(voice);
            }
        }
        let quote_at = text.find(QUOTE_MARKS)?;
        let lead = normalize_name(&text[..quote_at]);
        self.speaker_voices
            .iter()
            .filter(|(name, _)| !name.trim().is_empty())
            .find(|(name, _)| lead.contains(&normalize_name(name)))
            .map(|(_, voice)| voice.as_str())
    }
}

/// Dialogue is any unit containing quotation marks.
pub fn role_of(text: &str) -> VoiceRole {
    if text.contains(QUOTE_MARKS) {
        VoiceRole::Dialogue
    } else {
        VoiceRole::Narration
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().nfkc().collect::<String>().to_lowercase()
}
