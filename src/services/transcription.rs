//! Speech-to-text over an OpenAI-compatible `/audio/transcriptions` endpoint.
//!
//! Batches arrive as the concatenated bytes of the browser's recorder chunks,
//! which are WebM/Opus, and are uploaded as a single multipart file.

use super::{Transcriber, UNRECOGNIZED_AUDIO};
use crate::config::ServicesConfig;
use crate::error::{EvalResult, EvaluationError};
use async_trait::async_trait;
use reqwest::multipart;
use std::time::Duration;
use tracing::debug;

pub struct HttpTranscriber {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpTranscriber {
    pub fn new(services: &ServicesConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(services.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: services.transcription_base_url.trim().trim_end_matches('/').to_string(),
            model: services.transcription_model.clone(),
            api_key: services.transcription_api_key.trim().to_string(),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> EvalResult<String> {
        if !self.is_configured() {
            return Err(EvaluationError::TransientUpstreamFailure(
                "transcription service not configured".to_string(),
            ));
        }

        if audio.is_empty() {
            return Ok(UNRECOGNIZED_AUDIO.to_string());
        }

        let part = multipart::Part::bytes(audio.to_vec())
            .file_name("audio.webm")
            .mime_str("audio/webm")
            .map_err(|e| EvaluationError::TransientUpstreamFailure(e.to_string()))?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "text");

        let mut request = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EvaluationError::TransientUpstreamFailure(format!("transcription request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(EvaluationError::TransientUpstreamFailure(format!(
                "transcription service returned {}: {}",
                status, error_text
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| EvaluationError::MalformedUpstreamResponse(format!("transcription body: {}", e)))?;

        debug!(bytes = audio.len(), chars = text.len(), "Batch transcribed");
        Ok(normalize_transcript(&text))
    }

    fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }
}

/// Collapse whitespace; empty output becomes the unrecognized marker.
pub(crate) fn normalize_transcript(raw: &str) -> String {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        UNRECOGNIZED_AUDIO.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_normalize_transcript() {
        assert_eq!(normalize_transcript("  hello \n world  "), "hello world");
        assert_eq!(normalize_transcript(" \n\t "), UNRECOGNIZED_AUDIO);
    }

    #[tokio::test]
    async fn test_unconfigured_transcriber_fails_transiently() {
        let config = AppConfig::default();
        let transcriber = HttpTranscriber::new(&config.services).unwrap();
        assert!(!transcriber.is_configured());

        let err = transcriber.transcribe(b"abc").await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
