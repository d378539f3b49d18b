//! Turns one speakable unit into playable audio or a fallback decision.

use crate::cache::{AudioStore, CacheKey, ChapterScope};
use crate::capabilities::{PayloadProbe, RemoteSynthesizer, SynthesisRequest, SynthesizedAudio};
use crate::error::FetchError;
use crate::segmenter::SpeakableUnit;
use crate::voice::VoiceProfile;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandle {
    pub key: CacheKey,
    pub audio: Arc<[u8]>,
    /// False when the payload was just synthesized and still needs caching.
    pub from_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// Remote retries for this unit were exhausted earlier in the session.
    Exhausted,
    NoRemoteVoice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Audio(AudioHandle),
    Fallback(FallbackReason),
}

/// Stateless apart from read access to the shared [`AudioStore`].
pub struct AudioResolver {
    store: AudioStore,
    synthesizer: Arc<dyn RemoteSynthesizer>,
    probe: Arc<dyn PayloadProbe>,
    voices: VoiceProfile,
    speech_rate: f32,
    timeout: Duration,
}

impl AudioResolver {
    pub fn new(
        store: AudioStore,
        synthesizer: Arc<dyn RemoteSynthesizer>,
        probe: Arc<dyn PayloadProbe>,
        voices: VoiceProfile,
        speech_rate: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            synthesizer,
            probe,
            voices,
            speech_rate,
            timeout,
        }
    }

    pub fn has_remote_voice(&self) -> bool {
        self.voices.has_remote_voice()
    }

    /// Cache lookup only; never performs I/O.
    pub fn cached(
        &self,
        scope: &ChapterScope,
        unit_index: usize,
        char_offset: usize,
    ) -> Option<AudioHandle> {
        let key = CacheKey::new(scope, unit_index, char_offset);
        let audio = self.store.get(&key)?;
        Some(AudioHandle {
            key,
            audio,
            from_cache: true,
        })
    }

    /// One resolution attempt for `unit` starting at UTF-16 `char_offset`.
    ///
    /// The caller decides whether to retry, and writes fresh audio into the cache.
    pub fn resolve(
        &self,
        scope: &ChapterScope,
        unit: &SpeakableUnit,
        char_offset: usize,
    ) -> Result<Resolution, FetchError> {
        if let Some(handle) = self.cached(scope, unit.index, char_offset) {
            return Ok(Resolution::Audio(handle));
        }
        if self.store.is_fallback(scope, unit.index) {
            return Ok(Resolution::Fallback(FallbackReason::Exhausted));
        }
        let Some(voice_id) = self.voices.select(&unit.text, unit.is_title) else {
            return Ok(Resolution::Fallback(FallbackReason::NoRemoteVoice));
        };

        let text = unit.remaining_text(char_offset);
        debug!(
            chapter_index = scope.chapter_index,
            unit_index = unit.index,
            char_offset,
            voice_id,
            "Requesting remote synthesis"
        );
        let request = SynthesisRequest {
            voice_id,
            text,
            speech_rate: self.speech_rate,
            timeout: self.timeout,
        };
        let audio = self
            .synthesizer
            .synthesize(&request)
            .map_err(|err| FetchError::Network(format!("{err:#}")))?;
        self.validate(&audio)?;

        Ok(Resolution::Audio(AudioHandle {
            key: CacheKey::new(scope, unit.index, char_offset),
            audio: Arc::from(audio.bytes),
            from_cache: false,
        }))
    }

    fn validate(&self, audio: &SynthesizedAudio) -> Result<(), FetchError> {
        if audio.bytes.is_empty() {
            return Err(FetchError::EmptyPayload);
        }
        if let Some(content_type) = audio.content_type.as_deref() {
            if !is_audio_content_type(content_type) {
                return Err(FetchError::UnexpectedContentType(content_type.to_string()));
            }
        }
        if !self.probe.accepts(&audio.bytes) {
            return Err(FetchError::Undecodable);
        }
        Ok(())
    }
}

fn is_audio_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("audio/") || essence == "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeSynth;

    struct RejectAll;

    impl PayloadProbe for RejectAll {
        fn accepts(&self, _bytes: &[u8]) -> bool {
            false
        }
    }

    fn unit(index: usize, text: &str) -> SpeakableUnit {
        SpeakableUnit {
            index,
            text: text.to_string(),
            is_title: false,
        }
    }

    fn voices() -> VoiceProfile {
        VoiceProfile {
            default_voice: Some("narrator".to_string()),
            dialogue_voice: Some("dialogue".to_string()),
            ..VoiceProfile::default()
        }
    }

    fn resolver(store: &AudioStore, synth: &Arc<FakeSynth>) -> AudioResolver {
        AudioResolver::new(
            store.clone(),
            synth.clone(),
            Arc::new(crate::capabilities::AcceptAnyPayload),
            voices(),
            1.0,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn cache_hit_performs_no_io() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(0);
        store.insert(&scope, 1, 0, Arc::from(&b"cached"[..]));
        let synth = Arc::new(FakeSynth::default());

        let resolution = resolver(&store, &synth)
            .resolve(&scope, &unit(1, "Hello."), 0)
            .expect("resolves");
        match resolution {
            Resolution::Audio(handle) => {
                assert!(handle.from_cache);
                assert_eq!(&*handle.audio, b"cached");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(synth.call_count(), 0);
    }

    #[test]
    fn fallback_units_skip_the_network() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(0);
        store.mark_fallback(&scope, 2);
        let synth = Arc::new(FakeSynth::default());

        let resolution = resolver(&store, &synth).resolve(&scope, &unit(2, "Hi."), 0);
        assert_eq!(
            resolution,
            Ok(Resolution::Fallback(FallbackReason::Exhausted))
        );
        assert_eq!(synth.call_count(), 0);
    }

    #[test]
    fn mid_unit_offset_requests_the_suffix_and_never_writes_cache() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(0);
        let synth = Arc::new(FakeSynth::default());

        let resolution = resolver(&store, &synth)
            .resolve(&scope, &unit(5, "Hello world, again."), 6)
            .expect("resolves");
        let Resolution::Audio(handle) = resolution else {
            panic!("expected audio");
        };
        assert!(!handle.from_cache);
        assert_eq!(&*handle.audio, "world, again.".as_bytes());
        assert_eq!(handle.key.char_offset, 6);
        assert_eq!(synth.requests(), vec![("narrator".to_string(), "world, again.".to_string())]);
        assert!(!store.contains(&scope, 5, 6));
    }

    #[test]
    fn dialogue_uses_dialogue_voice() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(0);
        let synth = Arc::new(FakeSynth::default());
        resolver(&store, &synth)
            .resolve(&scope, &unit(0, "“Stop,” she said."), 0)
            .expect("resolves");
        assert_eq!(synth.requests()[0].0, "dialogue");
    }

    #[test]
    fn no_remote_voice_falls_back() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(0);
        let synth: Arc<FakeSynth> = Arc::new(FakeSynth::default());
        let resolver = AudioResolver::new(
            store,
            synth.clone(),
            Arc::new(crate::capabilities::AcceptAnyPayload),
            VoiceProfile::default(),
            1.0,
            Duration::from_secs(5),
        );
        assert_eq!(
            resolver.resolve(&scope, &unit(0, "Hi."), 0),
            Ok(Resolution::Fallback(FallbackReason::NoRemoteVoice))
        );
        assert_eq!(synth.call_count(), 0);
    }

    #[test]
    fn invalid_payloads_are_failed_attempts() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(0);

        let html = Arc::new(FakeSynth::with_content_type("text/html; charset=utf-8"));
        assert_eq!(
            resolver(&store, &html).resolve(&scope, &unit(0, "Hi."), 0),
            Err(FetchError::UnexpectedContentType(
                "text/html; charset=utf-8".to_string()
            ))
        );

        let empty = Arc::new(FakeSynth::with_payload(Vec::new()));
        assert_eq!(
            resolver(&store, &empty).resolve(&scope, &unit(0, "Hi."), 0),
            Err(FetchError::EmptyPayload)
        );

        let synth: Arc<FakeSynth> = Arc::new(FakeSynth::default());
        let rejecting = AudioResolver::new(
            store.clone(),
            synth,
            Arc::new(RejectAll),
            voices(),
            1.0,
            Duration::from_secs(5),
        );
        assert_eq!(
            rejecting.resolve(&scope, &unit(0, "Hi."), 0),
            Err(FetchError::Undecodable)
        );
    }

    #[test]
    fn network_failures_map_to_fetch_errors() {
        let store = AudioStore::new("book", 8);
        let scope = store.begin_session(0);
        let synth = Arc::new(FakeSynth::default());
        synth.fail_always("Broken.");
        let result = resolver(&store, &synth).resolve(&scope, &unit(0, "Broken."), 0);
        assert!(matches!(result, Err(FetchError::Network(_))));
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        assert!(is_audio_content_type("audio/mpeg"));
        assert!(is_audio_content_type("Audio/Ogg; codecs=opus"));
        assert!(is_audio_content_type("application/octet-stream"));
        assert!(!is_audio_content_type("application/json"));
    }
}
