//! Engine tuning knobs.
//!
//! Hosts usually build this from their own settings file; every field also
//! has a serde default so a partial TOML table deserializes cleanly.

use crate::prefetch::PrefetchConfig;
use crate::segmenter::MIN_CHUNK_LIMIT;
use crate::voice::VoiceProfile;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum unit length in UTF-16 code units.
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
    #[serde(default = "default_include_title")]
    pub include_title: bool,
    /// Units after the cursor kept synthesized ahead of playback.
    #[serde(default = "default_look_ahead")]
    pub look_ahead: usize,
    #[serde(default = "default_prefetch_workers")]
    pub prefetch_workers: usize,
    #[serde(default = "default_next_chapter_workers")]
    pub next_chapter_workers: usize,
    /// Units of the following chapter synthesized before it starts.
    #[serde(default = "default_next_chapter_preload")]
    pub next_chapter_preload: usize,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Cached payloads per chapter map.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_progress_debounce_ms")]
    pub progress_debounce_ms: u64,
    #[serde(default = "default_follow_enabled")]
    pub follow_enabled: bool,
    #[serde(default = "default_follow_cooldown_ms")]
    pub follow_cooldown_ms: u64,
    #[serde(default = "default_keepalive_max_wait_ms")]
    pub keepalive_max_wait_ms: u64,
    #[serde(default = "default_speech_rate")]
    pub speech_rate: f32,
    /// Voice name passed to the on-device voice.
    #[serde(default)]
    pub local_voice: Option<String>,
    #[serde(default)]
    pub voices: VoiceProfile,
}

fn default_chunk_limit() -> usize {
    1800
}

fn default_include_title() -> bool {
    true
}

fn default_look_ahead() -> usize {
    3
}

fn default_prefetch_workers() -> usize {
    2
}

fn default_next_chapter_workers() -> usize {
    1
}

fn default_next_chapter_preload() -> usize {
    2
}

fn default_retry_budget() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1500
}

fn default_fetch_timeout_ms() -> u64 {
    20_000
}

fn default_cache_capacity() -> usize {
    32
}

fn default_progress_debounce_ms() -> u64 {
    1000
}

fn default_follow_enabled() -> bool {
    true
}

fn default_follow_cooldown_ms() -> u64 {
    5000
}

fn default_keepalive_max_wait_ms() -> u64 {
    30_000
}

fn default_speech_rate() -> f32 {
    1.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_limit: default_chunk_limit(),
            include_title: default_include_title(),
            look_ahead: default_look_ahead(),
            prefetch_workers: default_prefetch_workers(),
            next_chapter_workers: default_next_chapter_workers(),
            next_chapter_preload: default_next_chapter_preload(),
            retry_budget: default_retry_budget(),
            retry_delay_ms: default_retry_delay_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            cache_capacity: default_cache_capacity(),
            progress_debounce_ms: default_progress_debounce_ms(),
            follow_enabled: default_follow_enabled(),
            follow_cooldown_ms: default_follow_cooldown_ms(),
            keepalive_max_wait_ms: default_keepalive_max_wait_ms(),
            speech_rate: default_speech_rate(),
            local_voice: None,
            voices: VoiceProfile::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp values that would stall or starve the engine.
    pub fn sanitized(mut self) -> Self {
        self.chunk_limit = self.chunk_limit.max(MIN_CHUNK_LIMIT);
        self.look_ahead = self.look_ahead.max(1);
        self.prefetch_workers = self.prefetch_workers.max(1);
        self.next_chapter_workers = self.next_chapter_workers.clamp(1, self.prefetch_workers);
        self.retry_budget = self.retry_budget.max(1);
        self.cache_capacity = self.cache_capacity.max(self.look_ahead + 1);
        if !self.speech_rate.is_finite() || self.speech_rate <= 0.0 {
            self.speech_rate = default_speech_rate();
        }
        self
    }

    pub fn prefetch(&self) -> PrefetchConfig {
        PrefetchConfig {
            workers: self.prefetch_workers,
            next_chapter_workers: self.next_chapter_workers,
            retry_budget: self.retry_budget,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn progress_debounce(&self) -> Duration {
        Duration::from_millis(self.progress_debounce_ms)
    }

    pub fn follow_cooldown(&self) -> Duration {
        Duration::from_millis(self.follow_cooldown_ms)
    }

    pub fn keepalive_max_wait(&self) -> Duration {
        Duration::from_millis(self.keepalive_max_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
look_ahead = 5
speech_rate = 1.25

[voices]
default_voice = "en-narrator"
"#,
        )
        .expect("parse");
        assert_eq!(config.look_ahead, 5);
        assert_eq!(config.speech_rate, 1.25);
        assert_eq!(config.chunk_limit, 1800);
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.voices.default_voice.as_deref(), Some("en-narrator"));
    }

    #[test]
    fn sanitized_clamps_degenerate_values() {
        let config = EngineConfig {
            chunk_limit: 0,
            look_ahead: 0,
            prefetch_workers: 0,
            next_chapter_workers: 4,
            retry_budget: 0,
            cache_capacity: 0,
            speech_rate: f32::NAN,
            ..EngineConfig::default()
        }
        .sanitized();
        assert_eq!(config.chunk_limit, MIN_CHUNK_LIMIT);
        assert_eq!(config.look_ahead, 1);
        assert_eq!(config.prefetch_workers, 1);
        assert_eq!(config.next_chapter_workers, 1);
        assert_eq!(config.retry_budget, 1);
        assert_eq!(config.cache_capacity, 2);
        assert_eq!(config.speech_rate, 1.0);
    }
}
