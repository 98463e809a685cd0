// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use swea_config::{CommandDescriptor, ModelConfig};

use crate::{Message, StatsLedger};

/// Errors surfaced by a model backend.
///
/// The agent loop maps these onto its terminal states: context overflow →
/// `exit_context`, cost governor → `exit_cost`, exhausted retries →
/// `exit_api`, anything else → `exit_error`.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("context window exceeded")]
    ContextWindowExceeded,
    #[error("cost limit exceeded")]
    CostLimitExceeded,
    #[error("api retries exhausted: {0}")]
    RetriesExhausted(String),
    /// Transient API failure; eligible for retry.
    #[error("api error: {0}")]
    Api(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Uniform query interface over the concrete LLM backends.
///
/// Implementations are flat — no shared base type.  The cost ledger is an
/// orthogonal collaborator passed in at construction; every implementation
/// calls `ledger.check_limits()` before issuing a request and
/// `ledger.record(..)` after a successful reply, so crossing a threshold
/// raises [`ModelError::CostLimitExceeded`] out of the next `query`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Model name as configured (used in run metadata and logs).
    fn name(&self) -> &str;

    /// Send the history, return the assistant's raw reply text.
    async fn query(&self, history: &[Message]) -> Result<String, ModelError>;
}

/// Instantiate the backend selected by `config.name`.
///
/// Selection is by prefix, matching the conventions of the dataset tooling:
/// `claude*` → anthropic, `gpt*`/`ft:gpt*`/`azure:gpt*` → openai,
/// `ollama:<model>` → ollama, and the special names `human`, `human_thought`,
/// `replay` and `mock`.
pub fn from_config(
    config: &ModelConfig,
    ledger: Arc<StatsLedger>,
    commands: &[CommandDescriptor],
) -> anyhow::Result<Box<dyn ModelProvider>> {
    let name = config.name.as_str();
    let provider: Box<dyn ModelProvider> = match name {
        "human" => Box::new(crate::human::HumanProvider::new(commands, false)),
        "human_thought" => Box::new(crate::human::HumanProvider::new(commands, true)),
        "replay" => {
            let path = config
                .replay_path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("replay backend requires model.replay_path"))?;
            Box::new(crate::replay::ReplayProvider::from_path(path)?)
        }
        "mock" => Box::new(crate::mock::ScriptedProvider::new(vec![], ledger)),
        _ if name.starts_with("claude") => {
            Box::new(crate::anthropic::AnthropicProvider::new(config, ledger)?)
        }
        _ if name.starts_with("gpt")
            || name.starts_with("ft:gpt")
            || name.starts_with("azure:gpt") =>
        {
            Box::new(crate::openai::OpenAiProvider::new(config, ledger)?)
        }
        _ if name.starts_with("ollama:") => {
            Box::new(crate::ollama::OllamaProvider::new(config, ledger))
        }
        other => anyhow::bail!("invalid model name: {other}"),
    };
    Ok(provider)
}

/// Classify an HTTP error body: context-window overflows get their own
/// variant so the loop can terminate with `exit_context` instead of retrying.
pub(crate) fn classify_api_error(status: u16, body: &str) -> ModelError {
    let lowered = body.to_lowercase();
    if lowered.contains("context_length_exceeded")
        || lowered.contains("maximum context length")
        || lowered.contains("prompt is too long")
    {
        return ModelError::ContextWindowExceeded;
    }
    ModelError::Api(format!("status {status}: {body}"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_context_error_is_classified() {
        let err = classify_api_error(
            400,
            r#"{"error":{"code":"context_length_exceeded","message":"..."}}"#,
        );
        assert!(matches!(err, ModelError::ContextWindowExceeded));
    }

    #[test]
    fn anthropic_context_error_is_classified() {
        let err = classify_api_error(400, "prompt is too long: 210000 tokens");
        assert!(matches!(err, ModelError::ContextWindowExceeded));
    }

    #[test]
    fn other_errors_stay_transient() {
        let err = classify_api_error(529, "overloaded");
        assert!(matches!(err, ModelError::Api(_)));
    }

    #[test]
    fn from_config_rejects_unknown_model() {
        let cfg = ModelConfig {
            name: "made-up-model".into(),
            ..Default::default()
        };
        let result = from_config(&cfg, Arc::new(StatsLedger::default()), &[]);
        assert!(result.is_err());
    }

    #[test]
    fn from_config_replay_requires_path() {
        let cfg = ModelConfig {
            name: "replay".into(),
            replay_path: None,
            ..Default::default()
        };
        assert!(from_config(&cfg, Arc::new(StatsLedger::default()), &[]).is_err());
    }
}
