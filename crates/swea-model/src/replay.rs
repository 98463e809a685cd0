// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{Message, ModelError, ModelProvider};

/// Backend that replays recorded actions instead of calling an API.
///
/// Accepts either a single `.traj` file (its `trajectory[*].action` entries
/// become one action sequence) or a `.jsonl` file with one trajectory per
/// line (a bare JSON array of actions, or an object with an `actions` field).
/// A `submit` action auto-advances the cursor to the next trajectory.
pub struct ReplayProvider {
    trajectories: Vec<Vec<String>>,
    /// `(trajectory index, action index)`
    cursor: Mutex<(usize, usize)>,
}

impl ReplayProvider {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay file {}", path.display()))?;
        let trajectories = if path.extension().and_then(|e| e.to_str()) == Some("traj") {
            vec![actions_from_traj(&text)?]
        } else {
            text.lines()
                .filter(|l| !l.trim().is_empty())
                .map(actions_from_line)
                .collect::<anyhow::Result<Vec<_>>>()?
        };
        anyhow::ensure!(!trajectories.is_empty(), "replay file contains no actions");
        debug!(count = trajectories.len(), "loaded replay trajectories");
        Ok(Self {
            trajectories,
            cursor: Mutex::new((0, 0)),
        })
    }

    pub fn from_actions(trajectories: Vec<Vec<String>>) -> Self {
        Self {
            trajectories,
            cursor: Mutex::new((0, 0)),
        }
    }
}

fn actions_from_traj(text: &str) -> anyhow::Result<Vec<String>> {
    let parsed: Value = serde_json::from_str(text).context("parsing .traj replay file")?;
    let steps = parsed["trajectory"]
        .as_array()
        .context(".traj file has no trajectory array")?;
    Ok(steps
        .iter()
        .filter_map(|s| s["action"].as_str().map(str::to_string))
        .collect())
}

fn actions_from_line(line: &str) -> anyhow::Result<Vec<String>> {
    let parsed: Value = serde_json::from_str(line).context("parsing replay line")?;
    let actions = match &parsed {
        Value::Array(items) => items.iter(),
        Value::Object(map) => map
            .get("actions")
            .and_then(Value::as_array)
            .context("replay line object has no actions array")?
            .iter(),
        _ => anyhow::bail!("replay line is neither an array nor an object"),
    };
    Ok(actions
        .filter_map(|a| a.as_str().map(str::to_string))
        .collect())
}

/// Wrap a bare action in a fenced block so the standard thought-action parser
/// accepts it; recorded full replies pass through untouched.
fn as_model_output(action: &str) -> String {
    if action.contains("```") {
        action.to_string()
    } else {
        format!("```\n{action}\n```")
    }
}

#[async_trait]
impl ModelProvider for ReplayProvider {
    fn name(&self) -> &str {
        "replay"
    }

    async fn query(&self, _history: &[Message]) -> Result<String, ModelError> {
        let mut cursor = self.cursor.lock().unwrap();
        let (traj_idx, action_idx) = *cursor;
        let trajectory = self
            .trajectories
            .get(traj_idx)
            .ok_or_else(|| ModelError::Other(anyhow::anyhow!("replay trajectories exhausted")))?;
        let action = trajectory.get(action_idx).ok_or_else(|| {
            ModelError::Other(anyhow::anyhow!(
                "replay trajectory {traj_idx} exhausted at action {action_idx}"
            ))
        })?;

        if action.trim() == "submit" {
            *cursor = (traj_idx + 1, 0);
        } else {
            *cursor = (traj_idx, action_idx + 1);
        }
        Ok(as_model_output(action))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
