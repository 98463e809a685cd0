// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::ModelError;

/// Maximum number of attempts for one logical query.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay doubled on every attempt.
const BASE_DELAY_MS: u64 = 500;

/// Run `op` with exponential backoff and jitter, at most [`MAX_ATTEMPTS`]
/// times.
///
/// Only [`ModelError::Api`] is retried.  Cost-limit and context-window errors
/// re-raise immediately — retrying them would burn budget on a request that
/// can never succeed.  When the attempts are exhausted the last API error is
/// wrapped in [`ModelError::RetriesExhausted`].
pub async fn with_retries<T, F, Fut>(mut op: F) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut last_error = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ModelError::Api(msg)) => {
                warn!(attempt = attempt + 1, error = %msg, "api error, backing off");
                last_error = msg;
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(ModelError::RetriesExhausted(last_error))
}

/// Exponential delay with deterministic-per-call jitter drawn from the
/// subsecond clock (no RNG dependency needed for a retry smear).
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_DELAY_MS << attempt;
    let jitter = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_millis() as u64 % BASE_DELAY_MS)
        .unwrap_or(0);
    Duration::from_millis(base + jitter)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ModelError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_api_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retries(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ModelError::Api("overloaded".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_last_error() {
        let result: Result<(), _> =
            with_retries(|| async { Err(ModelError::Api("boom".into())) }).await;
        match result {
            Err(ModelError::RetriesExhausted(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cost_limit_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::CostLimitExceeded) }
        })
        .await;
        assert!(matches!(result, Err(ModelError::CostLimitExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn context_window_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ModelError::ContextWindowExceeded) }
        })
        .await;
        assert!(matches!(result, Err(ModelError::ContextWindowExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
