use readaloud_core::{EngineConfig, VoiceProfile};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Flattened host configuration; the on-disk file is sectioned (see `tables`).
#[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq)]
pub struct AppConfig {
    #[serde(default = "crate::config::defaults::default_log_level")]
    pub log_level: LogLevel,
    /// Remote synthesis endpoint. Without one every unit uses the local voice.
    #[serde(default)]
    pub tts_endpoint: Option<String>,
    #[serde(default = "crate::config::defaults::default_tts_api_key_env")]
    pub tts_api_key_env: String,
    #[serde(default = "crate::config::defaults::default_tts_timeout_secs")]
    pub tts_timeout_secs: f32,
    #[serde(default = "crate::config::defaults::default_tts_speed")]
    pub tts_speed: f32,
    #[serde(default = "crate::config::defaults::default_local_voice_program")]
    pub local_voice_program: String,
    #[serde(default)]
    pub local_voice_name: Option<String>,
    #[serde(default)]
    pub default_voice: Option<String>,
    #[serde(default)]
    pub narration_voice: Option<String>,
    #[serde(default)]
    pub dialogue_voice: Option<String>,
    #[serde(default)]
    pub speaker_voices: BTreeMap<String, String>,
    #[serde(default = "crate::config::defaults::default_include_title")]
    pub include_title: bool,
    #[serde(default = "crate::config::defaults::default_chunk_limit")]
    pub chunk_limit: usize,
    #[serde(default = "crate::config::defaults::default_keepalive_max_wait_secs")]
    pub keepalive_max_wait_secs: f32,
    #[serde(default = "crate::config::defaults::default_look_ahead")]
    pub look_ahead: usize,
    #[serde(default = "crate::config::defaults::default_prefetch_workers")]
    pub prefetch_workers: usize,
    #[serde(default = "crate::config::defaults::default_next_chapter_workers")]
    pub next_chapter_workers: usize,
    #[serde(default = "crate::config::defaults::default_next_chapter_preload")]
    pub next_chapter_preload: usize,
    #[serde(default = "crate::config::defaults::default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "crate::config::defaults::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "crate::config::defaults::default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "crate::config::defaults::default_follow_enabled")]
    pub follow_enabled: bool,
    #[serde(default = "crate::config::defaults::default_follow_cooldown_secs")]
    pub follow_cooldown_secs: f32,
    #[serde(default = "crate::config::defaults::default_progress_debounce_ms")]
    pub progress_debounce_ms: u64,
    #[serde(default = "crate::config::defaults::default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "crate::config::defaults::default_strip_markup")]
    pub strip_markup: bool,
    #[serde(default = "crate::config::defaults::default_drop_bracket_citations")]
    pub drop_bracket_citations: bool,
    /// Literal text replacements applied before segmentation.
    #[serde(default)]
    pub replacements: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_level: crate::config::defaults::default_log_level(),
            tts_endpoint: None,
            tts_api_key_env: crate::config::defaults::default_tts_api_key_env(),
            tts_timeout_secs: crate::config::defaults::default_tts_timeout_secs(),
            tts_speed: crate::config::defaults::default_tts_speed(),
            local_voice_program: crate::config::defaults::default_local_voice_program(),
            local_voice_name: None,
            default_voice: None,
            narration_voice: None,
            dialogue_voice: None,
            speaker_voices: BTreeMap::new(),
            include_title: crate::config::defaults::default_include_title(),
            chunk_limit: crate::config::defaults::default_chunk_limit(),
            keepalive_max_wait_secs: crate::config::defaults::default_keepalive_max_wait_secs(),
            look_ahead: crate::config::defaults::default_look_ahead(),
            prefetch_workers: crate::config::defaults::default_prefetch_workers(),
            next_chapter_workers: crate::config::defaults::default_next_chapter_workers(),
            next_chapter_preload: crate::config::defaults::default_next_chapter_preload(),
            retry_budget: crate::config::defaults::default_retry_budget(),
            retry_delay_ms: crate::config::defaults::default_retry_delay_ms(),
            cache_capacity: crate::config::defaults::default_cache_capacity(),
            follow_enabled: crate::config::defaults::default_follow_enabled(),
            follow_cooldown_secs: crate::config::defaults::default_follow_cooldown_secs(),
            progress_debounce_ms: crate::config::defaults::default_progress_debounce_ms(),
            cache_dir: crate::config::defaults::default_cache_dir(),
            strip_markup: crate::config::defaults::default_strip_markup(),
            drop_bracket_citations: crate::config::defaults::default_drop_bracket_citations(),
            replacements: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    pub fn voices(&self) -> VoiceProfile {
        VoiceProfile {
            default_voice: self.default_voice.clone(),
            narration_voice: self.narration_voice.clone(),
            dialogue_voice: self.dialogue_voice.clone(),
            speaker_voices: self.speaker_voices.clone(),
        }
    }

    /// Engine settings. Voices are only offered when a synthesis endpoint exists.
    pub fn engine_config(&self) -> EngineConfig {
        let voices = if self.tts_endpoint.is_some() {
            self.voices()
        } else {
            VoiceProfile::default()
        };
        EngineConfig {
            chunk_limit: self.chunk_limit,
            include_title: self.include_title,
            look_ahead: self.look_ahead,
            prefetch_workers: self.prefetch_workers,
            next_chapter_workers: self.next_chapter_workers,
            next_chapter_preload: self.next_chapter_preload,
            retry_budget: self.retry_budget,
            retry_delay_ms: self.retry_delay_ms,
            fetch_timeout_ms: secs_to_ms(self.tts_timeout_secs),
            cache_capacity: self.cache_capacity,
            progress_debounce_ms: self.progress_debounce_ms,
            follow_enabled: self.follow_enabled,
            follow_cooldown_ms: secs_to_ms(self.follow_cooldown_secs),
            keepalive_max_wait_ms: secs_to_ms(self.keepalive_max_wait_secs),
            speech_rate: self.tts_speed,
            local_voice: self.local_voice_name.clone(),
            voices,
        }
        .sanitized()
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(secs_to_ms(self.tts_timeout_secs))
    }
}

fn secs_to_ms(secs: f32) -> u64 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    (secs * 1000.0).round() as u64
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
