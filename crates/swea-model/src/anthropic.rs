// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use swea_config::ModelConfig;

use crate::provider::classify_api_error;
use crate::retry::with_retries;
use crate::types::{history_to_api_messages, split_system, Role};
use crate::{catalog, Message, ModelError, ModelProvider, StatsLedger};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// Anthropic messages-API backend.
pub struct AnthropicProvider {
    client: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    temperature: f32,
    top_p: f32,
    ledger: Arc<StatsLedger>,
}

impl AnthropicProvider {
    pub fn new(config: &ModelConfig, ledger: Arc<StatsLedger>) -> anyhow::Result<Self> {
        let key_var = config.api_key_env.as_deref().unwrap_or("ANTHROPIC_API_KEY");
        let api_key = std::env::var(key_var)
            .map_err(|_| anyhow::anyhow!("environment variable {key_var} is not set"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            model: config.name.clone(),
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            temperature: config.temperature,
            top_p: config.top_p,
            ledger,
        })
    }

    fn build_body(&self, history: &[Message]) -> Value {
        // Anthropic takes the system prompt as a separate field; role-tagged
        // demonstrations are supported, so no demo collapsing is needed.
        let mapped = history_to_api_messages(history, false);
        let (system, rest) = split_system(&mapped);
        let messages: Vec<Value> = rest
            .iter()
            .map(|(role, content)| {
                json!({
                    "role": if *role == Role::Assistant { "assistant" } else { "user" },
                    "content": content,
                })
            })
            .collect();
        json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "system": system,
            "messages": messages,
        })
    }

    async fn query_once(&self, body: &Value) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Api(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ModelError::Api(e.to_string()))?;
        if status != 200 {
            return Err(classify_api_error(status, &text));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| ModelError::Api(e.to_string()))?;
        let reply = parsed["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let tokens_sent = parsed["usage"]["input_tokens"].as_u64().unwrap_or_else(|| {
            warn!(model = %self.model, "backend did not report input tokens");
            0
        });
        let tokens_received = parsed["usage"]["output_tokens"].as_u64().unwrap_or(0);
        let cost = catalog::cost_for(&self.model, tokens_sent, tokens_received);
        self.ledger.record(tokens_sent, tokens_received, cost);
        Ok(reply)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn query(&self, history: &[Message]) -> Result<String, ModelError> {
        self.ledger.check_limits()?;
        let body = self.build_body(history);
        with_retries(|| self.query_once(&body)).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider {
            client: reqwest::Client::new(),
            model: "claude-3-opus-20240229".into(),
            api_key: "test-key".into(),
            base_url: DEFAULT_BASE_URL.into(),
            temperature: 0.0,
            top_p: 0.95,
            ledger: Arc::new(StatsLedger::default()),
        }
    }

    #[test]
    fn body_splits_system_from_messages() {
        let history = vec![
            Message::system("you are an agent", "primary"),
            Message::user("hello", "primary"),
            Message::assistant("hi", "primary", "", ""),
        ];
        let body = provider().build_body(&history);
        assert_eq!(body["system"], "you are an agent");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[test]
    fn body_carries_sampling_parameters() {
        let body = provider().build_body(&[Message::user("x", "primary")]);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["top_p"], 0.95);
        assert_eq!(body["model"], "claude-3-opus-20240229");
    }

    #[test]
    fn demo_messages_keep_their_roles() {
        let history = vec![
            Message::user("demo turn", "primary").demo(),
            Message::user("real turn", "primary"),
        ];
        let body = provider().build_body(&history);
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }
}
