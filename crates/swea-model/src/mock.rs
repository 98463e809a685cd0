// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{Message, ModelError, ModelProvider, StatsLedger};

/// One scripted reply for the [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text as the model output.
    Text(String),
    /// Fail the query with a context-window error.
    ContextWindowExceeded,
    /// Fail the query with a transient API error (retried, then exhausted).
    ApiFailure(String),
}

/// Deterministic pre-scripted provider for tests.  Each `query` pops the next
/// reply; the full history of every call is captured for inspection.
pub struct ScriptedProvider {
    replies: Mutex<Vec<ScriptedReply>>,
    /// Every history this provider was queried with.
    pub queries: Mutex<Vec<Vec<Message>>>,
    ledger: Arc<StatsLedger>,
    cost_per_call: f64,
    tokens_per_call: (u64, u64),
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>, ledger: Arc<StatsLedger>) -> Self {
        Self {
            replies: Mutex::new(replies),
            queries: Mutex::new(Vec::new()),
            ledger,
            cost_per_call: 0.0,
            tokens_per_call: (10, 10),
        }
    }

    /// Convenience: a sequence of plain text replies.
    pub fn texts<S: Into<String>>(replies: Vec<S>, ledger: Arc<StatsLedger>) -> Self {
        Self::new(
            replies.into_iter().map(|r| ScriptedReply::Text(r.into())).collect(),
            ledger,
        )
    }

    /// Report this cost to the ledger on every call.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn query(&self, history: &[Message]) -> Result<String, ModelError> {
        self.ledger.check_limits()?;
        self.queries.lock().unwrap().push(history.to_vec());

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(ModelError::Other(anyhow::anyhow!(
                    "scripted provider has no replies left"
                )));
            }
            replies.remove(0)
        };

        match reply {
            ScriptedReply::Text(text) => {
                let (sent, received) = self.tokens_per_call;
                self.ledger.record(sent, received, self.cost_per_call);
                Ok(text)
            }
            ScriptedReply::ContextWindowExceeded => Err(ModelError::ContextWindowExceeded),
            ScriptedReply::ApiFailure(msg) => Err(ModelError::RetriesExhausted(msg)),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
