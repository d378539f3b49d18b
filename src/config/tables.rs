use super::defaults;
use super::models::{AppConfig, LogLevel};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub(super) struct ConfigTables {
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    tts: TtsConfig,
    #[serde(default)]
    voices: VoicesConfig,
    #[serde(default)]
    playback: PlaybackConfig,
    #[serde(default)]
    prefetch: PrefetchConfig,
    #[serde(default)]
    reading: ReadingConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    cleaning: CleaningConfig,
}

impl From<ConfigTables> for AppConfig {
    fn from(tables: ConfigTables) -> Self {
        AppConfig {
            log_level: tables.logging.log_level,
            tts_endpoint: tables.tts.endpoint.filter(|url| !url.trim().is_empty()),
            tts_api_key_env: tables.tts.api_key_env,
            tts_timeout_secs: tables.tts.timeout_secs,
            tts_speed: tables.tts.speed,
            local_voice_program: tables.tts.local_program,
            local_voice_name: tables.tts.local_voice,
            default_voice: tables.voices.default,
            narration_voice: tables.voices.narration,
            dialogue_voice: tables.voices.dialogue,
            speaker_voices: tables.voices.speakers,
            include_title: tables.playback.include_title,
            chunk_limit: tables.playback.chunk_limit,
            keepalive_max_wait_secs: tables.playback.keepalive_max_wait_secs,
            look_ahead: tables.prefetch.look_ahead,
            prefetch_workers: tables.prefetch.workers,
            next_chapter_workers: tables.prefetch.next_chapter_workers,
            next_chapter_preload: tables.prefetch.next_chapter_preload,
            retry_budget: tables.prefetch.retry_budget,
            retry_delay_ms: tables.prefetch.retry_delay_ms,
            cache_capacity: tables.prefetch.cache_capacity,
            follow_enabled: tables.reading.follow_enabled,
            follow_cooldown_secs: tables.reading.follow_cooldown_secs,
            progress_debounce_ms: tables.reading.progress_debounce_ms,
            cache_dir: tables.storage.cache_dir,
            strip_markup: tables.cleaning.strip_markup,
            drop_bracket_citations: tables.cleaning.drop_bracket_citations,
            replacements: tables.cleaning.replacements,
        }
    }
}

impl From<&AppConfig> for ConfigTables {
    fn from(config: &AppConfig) -> Self {
        ConfigTables {
            logging: LoggingConfig {
                log_level: config.log_level,
            },
            tts: TtsConfig {
                endpoint: config.tts_endpoint.clone(),
                api_key_env: config.tts_api_key_env.clone(),
                timeout_secs: config.tts_timeout_secs,
                speed: config.tts_speed,
                local_program: config.local_voice_program.clone(),
                local_voice: config.local_voice_name.clone(),
            },
            voices: VoicesConfig {
                default: config.default_voice.clone(),
                narration: config.narration_voice.clone(),
                dialogue: config.dialogue_voice.clone(),
                speakers: config.speaker_voices.clone(),
            },
            playback: PlaybackConfig {
                include_title: config.include_title,
                chunk_limit: config.chunk_limit,
                keepalive_max_wait_secs: config.keepalive_max_wait_secs,
            },
            prefetch: PrefetchConfig {
                look_ahead: config.look_ahead,
                workers: config.prefetch_workers,
                next_chapter_workers: config.next_chapter_workers,
                next_chapter_preload: config.next_chapter_preload,
                retry_budget: config.retry_budget,
                retry_delay_ms: config.retry_delay_ms,
                cache_capacity: config.cache_capacity,
            },
            reading: ReadingConfig {
                follow_enabled: config.follow_enabled,
                follow_cooldown_secs: config.follow_cooldown_secs,
                progress_debounce_ms: config.progress_debounce_ms,
            },
            storage: StorageConfig {
                cache_dir: config.cache_dir.clone(),
            },
            cleaning: CleaningConfig {
                strip_markup: config.strip_markup,
                drop_bracket_citations: config.drop_bracket_citations,
                replacements: config.replacements.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    log_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: defaults::default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct TtsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(default = "defaults::default_tts_api_key_env")]
    api_key_env: String,
    #[serde(default = "defaults::default_tts_timeout_secs")]
    timeout_secs: f32,
    #[serde(default = "defaults::default_tts_speed")]
    speed: f32,
    #[serde(default = "defaults::default_local_voice_program")]
    local_program: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_voice: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        TtsConfig {
            endpoint: None,
            api_key_env: defaults::default_tts_api_key_env(),
            timeout_secs: defaults::default_tts_timeout_secs(),
            speed: defaults::default_tts_speed(),
            local_program: defaults::default_local_voice_program(),
            local_voice: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
struct VoicesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    narration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dialogue: Option<String>,
    #[serde(default)]
    speakers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct PlaybackConfig {
    #[serde(default = "defaults::default_include_title")]
    include_title: bool,
    #[serde(default = "defaults::default_chunk_limit")]
    chunk_limit: usize,
    #[serde(default = "defaults::default_keepalive_max_wait_secs")]
    keepalive_max_wait_secs: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            include_title: defaults::default_include_title(),
            chunk_limit: defaults::default_chunk_limit(),
            keepalive_max_wait_secs: defaults::default_keepalive_max_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct PrefetchConfig {
    #[serde(default = "defaults::default_look_ahead")]
    look_ahead: usize,
    #[serde(default = "defaults::default_prefetch_workers")]
    workers: usize,
    #[serde(default = "defaults::default_next_chapter_workers")]
    next_chapter_workers: usize,
    #[serde(default = "defaults::default_next_chapter_preload")]
    next_chapter_preload: usize,
    #[serde(default = "defaults::default_retry_budget")]
    retry_budget: u32,
    #[serde(default = "defaults::default_retry_delay_ms")]
    retry_delay_ms: u64,
    #[serde(default = "defaults::default_cache_capacity")]
    cache_capacity: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        PrefetchConfig {
            look_ahead: defaults::default_look_ahead(),
            workers: defaults::default_prefetch_workers(),
            next_chapter_workers: defaults::default_next_chapter_workers(),
            next_chapter_preload: defaults::default_next_chapter_preload(),
            retry_budget: defaults::default_retry_budget(),
            retry_delay_ms: defaults::default_retry_delay_ms(),
            cache_capacity: defaults::default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct ReadingConfig {
    #[serde(default = "defaults::default_follow_enabled")]
    follow_enabled: bool,
    #[serde(default = "defaults::default_follow_cooldown_secs")]
    follow_cooldown_secs: f32,
    #[serde(default = "defaults::default_progress_debounce_ms")]
    progress_debounce_ms: u64,
}

impl Default for ReadingConfig {
    fn default() -> Self {
        ReadingConfig {
            follow_enabled: defaults::default_follow_enabled(),
            follow_cooldown_secs: defaults::default_follow_cooldown_secs(),
            progress_debounce_ms: defaults::default_progress_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct StorageConfig {
    #[serde(default = "defaults::default_cache_dir")]
    cache_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            cache_dir: defaults::default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct CleaningConfig {
    #[serde(default = "defaults::default_strip_markup")]
    strip_markup: bool,
    #[serde(default = "defaults::default_drop_bracket_citations")]
    drop_bracket_citations: bool,
    #[serde(default)]
    replacements: BTreeMap<String, String>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        CleaningConfig {
            strip_markup: defaults::default_strip_markup(),
            drop_bracket_citations: defaults::default_drop_bracket_citations(),
            replacements: BTreeMap::new(),
        }
    }
}
