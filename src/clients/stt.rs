use super::{logprob_to_confidence, STT_TIMEOUT};
use crate::error::GatewayError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SttResult {
    pub transcript: String,
    pub confidence: f64,
}

#[async_trait]
pub trait SttClient: Send + Sync {
    async fn transcribe(&self, wav: &[u8], language_hint: &str) -> Result<SttResult, GatewayError>;
}

/// Adapter over an OpenAI-Whisper-compatible transcription endpoint.
#[derive(Clone)]
pub struct HttpSttClient {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
}

impl HttpSttClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpSttClient {
            client: Arc::new(Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    avg_logprob: f64,
}

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[async_trait]
impl SttClient for HttpSttClient {
    async fn transcribe(&self, wav: &[u8], language_hint: &str) -> Result<SttResult, GatewayError> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec()).file_name("utterance.wav"),
            )
            .text("model", "whisper-1")
            .text("language", language_hint.to_string())
            .text("response_format", "verbose_json");

        let response = tokio::time::timeout(
            STT_TIMEOUT,
            self.client
                .post(format!("{}/audio/transcriptions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .multipart(form)
                .send(),
        )
        .await
        .map_err(|_| GatewayError::transient("stt", anyhow::anyhow!("stt request timed out")))?
        .map_err(|err| GatewayError::transient("stt", err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let err = anyhow::anyhow!("stt adapter error ({status}): {body}");
            return Err(if status.is_client_error() {
                GatewayError::permanent("stt", err)
            } else {
                GatewayError::transient("stt", err)
            });
        }

        let body: WhisperResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::transient("stt", err))?;

        if body.text.trim().is_empty() {
            return Ok(SttResult {
                transcript: String::new(),
                confidence: 0.0,
            });
        }

        let avg_logprob = if body.segments.is_empty() {
            -1.0
        } else {
            body.segments.iter().map(|s| s.avg_logprob).sum::<f64>() / body.segments.len() as f64
        };

        Ok(SttResult {
            transcript: body.text,
            confidence: logprob_to_confidence(avg_logprob),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    pub struct StubSttClient {
        pub responses: Mutex<Vec<SttResult>>,
    }

    #[async_trait]
    impl SttClient for StubSttClient {
        async fn transcribe(&self, _wav: &[u8], _language_hint: &str) -> Result<SttResult, GatewayError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(GatewayError::permanent("stt", anyhow::anyhow!("stub exhausted")));
            }
            Ok(responses.remove(0))
        }
    }

    #[tokio::test]
    async fn stub_returns_queued_results_in_order() {
        let stub = StubSttClient {
            responses: Mutex::new(vec![SttResult {
                transcript: "Pronto".into(),
                confidence: 0.9,
            }]),
        };
        let result = stub.transcribe(&[], "it").await.unwrap();
        assert_eq!(result.transcript, "Pronto");
    }
}
