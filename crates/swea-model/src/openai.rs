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
use crate::types::history_to_api_messages;
use crate::{catalog, Message, ModelError, ModelProvider, StatsLedger};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI chat-completions backend; also serves `azure:` and fine-tuned
/// models through the same wire format.
pub struct OpenAiProvider {
    client: reqwest::Client,
    /// Configured name, e.g. `gpt-4` or `azure:gpt-4` (used for pricing).
    model: String,
    /// Name sent on the wire, with routing prefixes stripped.
    api_model: String,
    api_key: String,
    base_url: String,
    temperature: f32,
    top_p: f32,
    ledger: Arc<StatsLedger>,
}

impl OpenAiProvider {
    pub fn new(config: &ModelConfig, ledger: Arc<StatsLedger>) -> anyhow::Result<Self> {
        let key_var = config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
        let api_key = std::env::var(key_var)
            .map_err(|_| anyhow::anyhow!("environment variable {key_var} is not set"))?;
        let api_model = config
            .name
            .strip_prefix("azure:")
            .unwrap_or(&config.name)
            .to_string();
        Ok(Self {
            client: reqwest::Client::new(),
            model: config.name.clone(),
            api_model,
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
        // The chat API takes system messages inline and supports role-tagged
        // demonstrations, so the history maps through unchanged.
        let messages: Vec<Value> = history_to_api_messages(history, false)
            .into_iter()
            .map(|(role, content)| json!({ "role": role.to_string(), "content": content }))
            .collect();
        json!({
            "model": self.api_model,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "messages": messages,
        })
    }

    async fn query_once(&self, body: &Value) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
        let reply = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let tokens_sent = parsed["usage"]["prompt_tokens"].as_u64().unwrap_or_else(|| {
            warn!(model = %self.model, "backend did not report prompt tokens");
            0
        });
        let tokens_received = parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        let cost = catalog::cost_for(&self.model, tokens_sent, tokens_received);
        self.ledger.record(tokens_sent, tokens_received, cost);
        Ok(reply)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
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
