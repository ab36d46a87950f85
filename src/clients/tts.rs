use super::TTS_TIMEOUT;
use crate::error::GatewayError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TtsResult {
    /// 24kHz mono linear PCM samples.
    pub pcm: Vec<i16>,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<TtsResult, GatewayError>;
}

#[derive(Clone)]
pub struct HttpTtsClient {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
}

impl HttpTtsClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        HttpTtsClient {
            client: Arc::new(Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'static str,
}

#[async_trait]
impl TtsClient for HttpTtsClient {
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<TtsResult, GatewayError> {
        let request = SpeechRequest {
            input: text,
            voice,
            speed,
            response_format: "pcm",
        };

        let outcome = tokio::time::timeout(TTS_TIMEOUT, async {
            let response = self
                .client
                .post(format!("{}/audio/speech", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await
                .map_err(|err| GatewayError::transient("tts", err))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let err = anyhow::anyhow!("tts adapter error ({status}): {body}");
                return Err(if status.is_client_error() {
                    GatewayError::permanent("tts", err)
                } else {
                    GatewayError::transient("tts", err)
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|err| GatewayError::transient("tts", err))?;
            let pcm: Vec<i16> = bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            Ok(pcm)
        })
        .await;

        match outcome {
            Ok(inner) => inner.map(|pcm| TtsResult { pcm }),
            Err(_) => Err(GatewayError::transient("tts", anyhow::anyhow!("tts request timed out"))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub struct StubTtsClient {
        pub samples: usize,
    }

    #[async_trait]
    impl TtsClient for StubTtsClient {
        async fn synthesize(&self, _text: &str, _voice: &str, _speed: f32) -> Result<TtsResult, GatewayError> {
            Ok(TtsResult {
                pcm: vec![0i16; self.samples],
            })
        }
    }

    #[tokio::test]
    async fn stub_returns_requested_sample_count() {
        let stub = StubTtsClient { samples: 24000 };
        let result = stub.synthesize("ciao", "it-female", 1.0).await.unwrap();
        assert_eq!(result.pcm.len(), 24000);
    }
}
