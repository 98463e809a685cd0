// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::ops::Add;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ModelError;

/// Per-task token and cost counters.  Additive: a sub-agent's statistics are
/// merged back into the caller's ledger on return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiStats {
    pub total_cost: f64,
    pub instance_cost: f64,
    pub tokens_sent: u64,
    pub tokens_received: u64,
    pub api_calls: u64,
}

impl Add for ApiStats {
    type Output = ApiStats;

    fn add(self, other: ApiStats) -> ApiStats {
        ApiStats {
            total_cost: self.total_cost + other.total_cost,
            instance_cost: self.instance_cost + other.instance_cost,
            tokens_sent: self.tokens_sent + other.tokens_sent,
            tokens_received: self.tokens_received + other.tokens_received,
            api_calls: self.api_calls + other.api_calls,
        }
    }
}

/// The cost governor shared by a model client and any sub-agents it spawns.
///
/// Orthogonal to the providers: it is passed in at construction, never
/// inherited.  Providers call [`StatsLedger::check_limits`] at the top of
/// every `query` and [`StatsLedger::record`] after a successful reply, so a
/// crossed threshold surfaces as [`ModelError::CostLimitExceeded`] out of the
/// *next* query.
#[derive(Debug, Default)]
pub struct StatsLedger {
    stats: Mutex<ApiStats>,
    /// Abort the instance above this cost; `0.0` disables the check.
    pub per_instance_limit: f64,
    /// Abort the whole run above this cost; `0.0` disables the check.
    pub total_limit: f64,
}

impl StatsLedger {
    pub fn new(per_instance_limit: f64, total_limit: f64) -> Self {
        Self {
            stats: Mutex::new(ApiStats::default()),
            per_instance_limit,
            total_limit,
        }
    }

    /// Start from an inherited baseline (sub-agent construction).
    pub fn with_baseline(per_instance_limit: f64, total_limit: f64, baseline: ApiStats) -> Self {
        Self {
            stats: Mutex::new(baseline),
            per_instance_limit,
            total_limit,
        }
    }

    pub fn snapshot(&self) -> ApiStats {
        *self.stats.lock().unwrap()
    }

    /// Reset for a new instance, carrying the run-wide total cost forward.
    pub fn reset_instance(&self) {
        let mut stats = self.stats.lock().unwrap();
        *stats = ApiStats {
            total_cost: stats.total_cost,
            ..ApiStats::default()
        };
    }

    /// Merge a returning sub-agent's *delta* into this ledger.
    pub fn absorb(&self, delta: ApiStats) {
        let mut stats = self.stats.lock().unwrap();
        *stats = *stats + delta;
    }

    /// Raise `CostLimitExceeded` when either threshold has been crossed.
    pub fn check_limits(&self) -> Result<(), ModelError> {
        let stats = self.stats.lock().unwrap();
        if self.total_limit > 0.0 && stats.total_cost >= self.total_limit {
            warn!(
                total_cost = stats.total_cost,
                limit = self.total_limit,
                "total cost limit exceeded"
            );
            return Err(ModelError::CostLimitExceeded);
        }
        if self.per_instance_limit > 0.0 && stats.instance_cost >= self.per_instance_limit {
            warn!(
                instance_cost = stats.instance_cost,
                limit = self.per_instance_limit,
                "instance cost limit exceeded"
            );
            return Err(ModelError::CostLimitExceeded);
        }
        Ok(())
    }

    /// Record one completed API call.
    pub fn record(&self, tokens_sent: u64, tokens_received: u64, cost: f64) {
        let mut stats = self.stats.lock().unwrap();
        stats.total_cost += cost;
        stats.instance_cost += cost;
        stats.tokens_sent += tokens_sent;
        stats.tokens_received += tokens_received;
        stats.api_calls += 1;
        info!(
            tokens_sent,
            tokens_received,
            cost,
            instance_cost = stats.instance_cost,
            total_cost = stats.total_cost,
            api_calls = stats.api_calls,
            "api call recorded"
        );
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
