//! Remote synthesis over an OpenAI-style `/audio/speech` endpoint.

use anyhow::{Context, Result, bail};
use readaloud_core::{RemoteSynthesizer, SynthesisRequest, SynthesizedAudio};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

const SPEECH_MODEL: &str = "tts-1";
const RESPONSE_FORMAT: &str = "mp3";

pub struct HttpSynthesizer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSynthesizer {
    /// `api_key_env` names the environment variable holding an optional bearer token.
    pub fn new(endpoint: &str, api_key_env: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let api_key = std::env::var(api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        debug!(
            endpoint,
            authenticated = api_key.is_some(),
            "Configured remote synthesizer"
        );
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

fn request_body(request: &SynthesisRequest<'_>) -> serde_json::Value {
    serde_json::json!({
        "model": SPEECH_MODEL,
        "input": request.text,
        "voice": request.voice_id,
        "speed": request.speech_rate,
        "response_format": RESPONSE_FORMAT,
    })
}

impl RemoteSynthesizer for HttpSynthesizer {
    fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<SynthesizedAudio> {
        let body = serde_json::to_vec(&request_body(request))
            .context("Failed to encode synthesis request")?;
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .with_context(|| format!("POST {}", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            bail!("synthesis failed with {status}: {}", detail.trim());
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("Failed to read synthesized audio")?
            .to_vec();
        debug!(
            voice = request.voice_id,
            bytes = bytes.len(),
            content_type = content_type.as_deref().unwrap_or("unknown"),
            "Received synthesized audio"
        );
        Ok(SynthesizedAudio {
            bytes,
            content_type,
        })
    }
}

/// Stands in when no endpoint is configured; the engine never selects a remote voice then.
pub struct DisabledSynthesizer;

impl RemoteSynthesizer for DisabledSynthesizer {
    fn synthesize(&self, _request: &SynthesisRequest<'_>) -> Result<SynthesizedAudio> {
        bail!("no synthesis endpoint is configured")
    }
}
