// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::EnvironmentRecipe;

/// One task instance, immutable for the lifetime of a run.
///
/// Created by the loader; consumed read-only by the workspace manager and the
/// prompt assembler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub instance_id: String,
    /// `owner/name` of the target repository.
    pub repo: String,
    /// Commit the working tree is pinned to before the agent starts.
    pub base_commit: String,
    pub problem_statement: String,
    /// Gold patch, when the dataset carries one.  Never shown to the model.
    #[serde(default)]
    pub patch: Option<String>,
    /// Test patch pre-applied in oracle mode.
    #[serde(default)]
    pub test_patch: Option<String>,
    /// Tests expected to flip from failing to passing.
    #[serde(default, rename = "FAIL_TO_PASS")]
    pub fail_to_pass: Vec<String>,
    /// Repository version used to select the environment recipe.
    #[serde(default)]
    pub version: Option<String>,
    /// Declarative runtime environment for this task.
    #[serde(default)]
    pub environment: Option<EnvironmentRecipe>,
}

impl TaskRecord {
    /// Directory name of the checkout inside the sandbox.
    pub fn repo_directory(&self) -> String {
        self.repo.replace('/', "__")
    }
}

/// Load task records from a `.json` array, a `.jsonl` stream, or a single
/// JSON object.
pub fn load_instances(path: &Path) -> anyhow::Result<Vec<TaskRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading instances from {}", path.display()))?;
    let trimmed = text.trim_start();

    let is_jsonl = path.extension().and_then(|e| e.to_str()) == Some("jsonl");

    if trimmed.starts_with('[') {
        return serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()));
    }
    if !is_jsonl {
        // A pretty-printed single object spans multiple lines; try it whole.
        if let Ok(record) = serde_json::from_str::<TaskRecord>(&text) {
            return Ok(vec![record]);
        }
    }

    // JSON-lines: one record per non-empty line.
    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TaskRecord = serde_json::from_str(line)
            .with_context(|| format!("parsing {} line {}", path.display(), lineno + 1))?;
        records.push(record);
    }
    Ok(records)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
