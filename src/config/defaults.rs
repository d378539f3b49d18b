pub(crate) fn default_log_level() -> crate::config::LogLevel {
    crate::config::LogLevel::Info
}

pub(crate) fn default_tts_api_key_env() -> String {
    "READALOUD_TTS_KEY".to_string()
}

pub(crate) fn default_tts_timeout_secs() -> f32 {
    20.0
}

pub(crate) fn default_tts_speed() -> f32 {
    1.0
}

pub(crate) fn default_local_voice_program() -> String {
    "espeak-ng".to_string()
}

pub(crate) fn default_include_title() -> bool {
    true
}

pub(crate) fn default_chunk_limit() -> usize {
    1800
}

pub(crate) fn default_keepalive_max_wait_secs() -> f32 {
    30.0
}

pub(crate) fn default_look_ahead() -> usize {
    3
}

pub(crate) fn default_prefetch_workers() -> usize {
    2
}

pub(crate) fn default_next_chapter_workers() -> usize {
    1
}

pub(crate) fn default_next_chapter_preload() -> usize {
    2
}

pub(crate) fn default_retry_budget() -> u32 {
    3
}

pub(crate) fn default_retry_delay_ms() -> u64 {
    1500
}

pub(crate) fn default_cache_capacity() -> usize {
    32
}

pub(crate) fn default_follow_enabled() -> bool {
    true
}

pub(crate) fn default_follow_cooldown_secs() -> f32 {
    5.0
}

pub(crate) fn default_progress_debounce_ms() -> u64 {
    1000
}

pub(crate) fn default_cache_dir() -> String {
    ".cache".to_string()
}

pub(crate) fn default_strip_markup() -> bool {
    true
}

pub(crate) fn default_drop_bracket_citations() -> bool {
    true
}
