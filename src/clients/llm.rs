use super::LLM_TIMEOUT;
use crate::error::GatewayError;
use crate::types::{Message, Speaker, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Used by the pipeline as the stall phrase once the adapter (and its retry)
/// both fail, so the call never goes silent even if the model is unreachable.
pub const FALLBACK_REPLY: &str = "Mi scusi, un momento per favore.";

#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn reply(
        &self,
        system_prompt: &str,
        history: &[Message],
        max_tokens: u32,
    ) -> Result<LlmReply, GatewayError>;
}

#[derive(Clone)]
pub struct HttpLlmClient {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        HttpLlmClient {
            client: Arc::new(Client::new()),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn reply(
        &self,
        system_prompt: &str,
        history: &[Message],
        max_tokens: u32,
    ) -> Result<LlmReply, GatewayError> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: system_prompt.to_string(),
        }];
        for m in history {
            messages.push(ChatMessage {
                role: match m.speaker {
                    Speaker::Caller => "user",
                    Speaker::Ai => "assistant",
                },
                content: m.text.clone(),
            });
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens,
        };

        let result = tokio::time::timeout(LLM_TIMEOUT, async {
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await
                .map_err(|err| GatewayError::transient("llm", err))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let err = anyhow::anyhow!("llm adapter error ({status}): {body}");
                return Err(if status.is_client_error() {
                    GatewayError::permanent("llm", err)
                } else {
                    GatewayError::transient("llm", err)
                });
            }

            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|err| GatewayError::transient("llm", err))?;

            let content = body
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|a| a.first())
                .and_then(|choice| choice.get("message"))
                .and_then(|msg| msg.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();

            let usage: Usage = body
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok())
                .unwrap_or_default();

            Ok(LlmReply {
                text: content,
                usage: TokenUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                },
            })
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(GatewayError::transient("llm", anyhow::anyhow!("llm request timed out"))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub struct StubLlmClient {
        pub reply_text: String,
    }

    #[async_trait]
    impl LlmClient for StubLlmClient {
        async fn reply(
            &self,
            _system_prompt: &str,
            _history: &[Message],
            _max_tokens: u32,
        ) -> Result<LlmReply, GatewayError> {
            Ok(LlmReply {
                text: self.reply_text.clone(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }
    }

    #[tokio::test]
    async fn stub_client_echoes_configured_reply() {
        let stub = StubLlmClient {
            reply_text: "Salve, mi dica.".into(),
        };
        let reply = stub.reply("sys", &[], 80).await.unwrap();
        assert_eq!(reply.text, "Salve, mi dica.");
    }
}
