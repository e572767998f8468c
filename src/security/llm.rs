//! LLM provider clients for the intent verifier.
//!
//! One small vendor-neutral chat interface with three HTTP-backed
//! implementations (Anthropic, OpenAI-compatible, Ollama) plus a no-op
//! client used when verification is disabled. Providers must not panic on
//! transient failures; errors propagate as [`BridgeError::Internal`] and the
//! verifier decides how to degrade.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::errors::{BridgeError, BridgeResult};

#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, messages: &[LlmMessage], timeout: Duration)
        -> BridgeResult<LlmResponse>;
}

/// Always approves; used when verification is disabled.
pub struct NullLlmClient;

#[async_trait]
impl LlmClient for NullLlmClient {
    async fn chat(
        &self,
        _messages: &[LlmMessage],
        _timeout: Duration,
    ) -> BridgeResult<LlmResponse> {
        Ok(LlmResponse {
            content: r#"{"verdict": "approve", "risk_level": "low", "reasoning": "verification disabled"}"#
                .to_string(),
            model: "null".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.anthropic.com")
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(
        &self,
        messages: &[LlmMessage],
        timeout: Duration,
    ) -> BridgeResult<LlmResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let system: String = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");
        let chat: Vec<_> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let body = json!({
            "model": self.model,
            "max_tokens": 1024,
            "system": system,
            "messages": chat,
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Internal(format!("anthropic request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BridgeError::Internal(format!(
                "anthropic API error {}: {}",
                status, text
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Internal(format!("anthropic response invalid: {}", e)))?;
        let content = value["content"][0]["text"]
            .as_str()
            .ok_or_else(|| BridgeError::Internal("anthropic response missing content".into()))?
            .to_string();

        Ok(LlmResponse {
            content,
            model: self.model.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(
        &self,
        messages: &[LlmMessage],
        timeout: Duration,
    ) -> BridgeResult<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "temperature": 0.0,
            "max_tokens": 1024,
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Internal(format!("openai request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BridgeError::Internal(format!(
                "openai API error {}: {}",
                status, text
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Internal(format!("openai response invalid: {}", e)))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BridgeError::Internal("openai response missing content".into()))?
            .to_string();

        Ok(LlmResponse {
            content,
            model: self.model.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Ollama (local)
// ---------------------------------------------------------------------------

pub struct OllamaClient {
    client: Client,
    model: String,
    base_url: String,
}

impl OllamaClient {
    pub fn new(model: &str, base_url: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("http://127.0.0.1:11434")
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(
        &self,
        messages: &[LlmMessage],
        timeout: Duration,
    ) -> BridgeResult<LlmResponse> {
        let url = format!("{}/api/chat", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "stream": false,
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Internal(format!("ollama request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BridgeError::Internal(format!("ollama API error {}", status)));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Internal(format!("ollama response invalid: {}", e)))?;
        let content = value["message"]["content"]
            .as_str()
            .ok_or_else(|| BridgeError::Internal("ollama response missing content".into()))?
            .to_string();

        Ok(LlmResponse {
            content,
            model: self.model.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_client_always_approves() {
        let client = NullLlmClient;
        let reply = client
            .chat(&[LlmMessage::user("anything")], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.content.contains("approve"));
    }

    #[tokio::test]
    async fn unreachable_provider_errors_cleanly() {
        let client = OllamaClient::new("tiny", Some("http://127.0.0.1:1"));
        let err = client
            .chat(&[LlmMessage::user("x")], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal_error");
    }
}
