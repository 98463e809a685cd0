// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use swea_config::ModelConfig;

use crate::retry::with_retries;
use crate::types::history_to_api_messages;
use crate::{Message, ModelError, ModelProvider, StatsLedger};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local Ollama backend.  Costs nothing; token counts come from the
/// server's eval counters when it reports them.
pub struct OllamaProvider {
    client: reqwest::Client,
    /// Configured name including the `ollama:` prefix.
    model: String,
    /// Model name as the Ollama server knows it.
    api_model: String,
    base_url: String,
    temperature: f32,
    top_p: f32,
    ledger: Arc<StatsLedger>,
}

impl OllamaProvider {
    pub fn new(config: &ModelConfig, ledger: Arc<StatsLedger>) -> Self {
        let api_model = config
            .name
            .strip_prefix("ollama:")
            .unwrap_or(&config.name)
            .to_string();
        Self {
            client: reqwest::Client::new(),
            model: config.name.clone(),
            api_model,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            temperature: config.temperature,
            top_p: config.top_p,
            ledger,
        }
    }

    fn build_body(&self, history: &[Message]) -> Value {
        // Local models frequently mishandle role-tagged few-shot turns, so
        // demonstrations are collapsed into a single user message.
        let messages: Vec<Value> = history_to_api_messages(history, true)
            .into_iter()
            .map(|(role, content)| json!({ "role": role.to_string(), "content": content }))
            .collect();
        json!({
            "model": self.api_model,
            "stream": false,
            "messages": messages,
            "options": {
                "temperature": self.temperature,
                "top_p": self.top_p,
            },
        })
    }

    async fn query_once(&self, body: &Value) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
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
            return Err(ModelError::Api(format!("status {status}: {text}")));
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| ModelError::Api(e.to_string()))?;
        let reply = parsed["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let tokens_sent = parsed["prompt_eval_count"].as_u64().unwrap_or_else(|| {
            warn!(model = %self.model, "ollama did not report prompt_eval_count");
            0
        });
        let tokens_received = parsed["eval_count"].as_u64().unwrap_or(0);
        self.ledger.record(tokens_sent, tokens_received, 0.0);
        Ok(reply)
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
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
