// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use tracing::{info, warn};

use swea_config::{AgentConfig, HistoryProcessorConfig};
use swea_model::{Message, Role};

/// Substitute `{placeholder}` slots.  Unknown placeholders are left in place
/// so a template typo is visible in the transcript instead of vanishing.
pub fn format_template(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

// ─── History processors ───────────────────────────────────────────────────────

/// Composable post-filter applied to the history before every query, keeping
/// the model input within the context window.
#[derive(Debug, Clone)]
pub enum HistoryProcessor {
    /// Identity.
    Default,
    /// Keep the first user message and the last N user messages verbatim;
    /// elide the content of the rest.
    LastN(usize),
    /// Keep only the most recent rendered file window per file.
    ClosedWindow,
}

impl HistoryProcessor {
    pub fn from_config(config: &HistoryProcessorConfig) -> anyhow::Result<Self> {
        match config.name.as_str() {
            "default" => Ok(Self::Default),
            "last_n" => {
                let n = config
                    .n
                    .context("history_processor: last_n requires an 'n' value")?;
                anyhow::ensure!(n > 0, "history_processor: n must be a positive integer");
                Ok(Self::LastN(n))
            }
            "closed_window" => Ok(Self::ClosedWindow),
            other => anyhow::bail!("unknown history processor: {other}"),
        }
    }

    pub fn process(&self, history: &[Message]) -> Vec<Message> {
        match self {
            Self::Default => history.to_vec(),
            Self::LastN(n) => last_n_history(history, *n),
            Self::ClosedWindow => closed_window_history(history),
        }
    }
}

fn last_n_history(history: &[Message], n: usize) -> Vec<Message> {
    let user_messages = history
        .iter()
        .filter(|m| m.role == Role::User && !m.is_demo)
        .count();
    let mut user_msg_idx = 0;
    history
        .iter()
        .map(|entry| {
            if entry.role != Role::User || entry.is_demo {
                return entry.clone();
            }
            user_msg_idx += 1;
            // The first user message carries the task statement; the last N
            // carry the observations the model still needs verbatim.
            if user_msg_idx == 1 || user_msg_idx + n > user_messages {
                entry.clone()
            } else {
                let mut elided = entry.clone();
                elided.content =
                    format!("Old output omitted ({} lines)", entry.content.lines().count());
                elided
            }
        })
        .collect()
}

fn closed_window_history(history: &[Message]) -> Vec<Message> {
    let line_pattern = Regex::new(r"(?m)^(\d+):.*(?:\n|$)").expect("line pattern must compile");
    let file_pattern =
        Regex::new(r"\[File:\s+(.*)\s+\(\d+\s+lines\s+total\)\]").expect("file pattern");

    // Walk backwards so the latest window for each file is the one kept open.
    let mut seen_files: Vec<String> = Vec::new();
    let mut reversed: Vec<Message> = Vec::new();
    for entry in history.iter().rev() {
        if entry.role != Role::User || entry.is_demo {
            reversed.push(entry.clone());
            continue;
        }
        let windowed: Vec<_> = line_pattern.find_iter(&entry.content).collect();
        let file = file_pattern
            .captures(&entry.content)
            .map(|c| c[1].to_string());
        match (windowed.first(), windowed.last(), file) {
            (Some(first), Some(last), Some(file)) => {
                let mut entry = entry.clone();
                if seen_files.contains(&file) {
                    entry.content = format!(
                        "{}Outdated window with {} lines omitted...\n{}",
                        &entry.content[..first.start()],
                        windowed.len(),
                        &entry.content[last.end()..]
                    );
                } else {
                    seen_files.push(file);
                }
                reversed.push(entry);
            }
            _ => reversed.push(entry.clone()),
        }
    }
    reversed.reverse();
    reversed
}

// ─── Demonstrations ───────────────────────────────────────────────────────────

/// Load the configured demonstration trajectories into history messages.
///
/// Each demonstration is either spliced as its own role-tagged messages
/// (`put_demos_in_history`) or rendered through the demonstration template
/// into a single user message.
pub fn load_demonstrations(
    config: &AgentConfig,
    agent_name: &str,
) -> anyhow::Result<Vec<Message>> {
    let mut messages = Vec::new();
    for path in &config.demonstrations {
        info!(path = %path.display(), "loading demonstration");
        let entries = demo_history(path, agent_name)?;
        if config.put_demos_in_history {
            messages.extend(
                entries
                    .into_iter()
                    .filter(|m| m.role != Role::System)
                    .map(Message::demo),
            );
        } else {
            let template = config.demonstration_template.as_deref().context(
                "demonstrations need a demonstration_template unless put_demos_in_history is set",
            )?;
            let rendered = entries
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| format!("{}:\n{}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n\n");
            let vars = HashMap::from([("demonstration".to_string(), rendered)]);
            messages.push(
                Message::user(format_template(template, &vars), agent_name).demo(),
            );
        }
    }
    Ok(messages)
}

/// Read a `.traj` file's history, keeping entries that belong to this agent
/// (or carry no agent tag at all).
fn demo_history(path: &Path, agent_name: &str) -> anyhow::Result<Vec<Message>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading demonstration {}", path.display()))?;
    let parsed: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing demonstration {}", path.display()))?;
    let Some(entries) = parsed["history"].as_array() else {
        warn!(path = %path.display(), "demonstration has no history array");
        return Ok(Vec::new());
    };
    let mut messages = Vec::new();
    for entry in entries {
        let role = match entry["role"].as_str() {
            Some("system") => Role::System,
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            _ => continue,
        };
        match entry["agent"].as_str() {
            Some(agent) if agent != agent_name => continue,
            _ => {}
        }
        let content = entry["content"].as_str().unwrap_or_default().to_string();
        messages.push(Message {
            role,
            content,
            agent: agent_name.to_string(),
            is_demo: false,
            thought: None,
            action: None,
        });
    }
    Ok(messages)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ── Templates ─────────────────────────────────────────────────────────────

    #[test]
    fn template_substitutes_placeholders() {
        let out = format_template("issue: {problem_statement}", &vars(&[(
            "problem_statement",
            "it breaks",
        )]));
        assert_eq!(out, "issue: it breaks");
    }

    #[test]
    fn unknown_placeholders_stay_visible() {
        let out = format_template("{mystery}", &vars(&[]));
        assert_eq!(out, "{mystery}");
    }

    // ── last_n ────────────────────────────────────────────────────────────────

    fn user(content: &str) -> Message {
        Message::user(content, "primary")
    }

    #[test]
    fn last_n_keeps_first_and_recent_users() {
        let history = vec![
            Message::system("sys", "primary"),
            user("task statement"),
            user("obs 1\nline"),
            user("obs 2"),
            user("obs 3"),
        ];
        let processed = HistoryProcessor::LastN(2).process(&history);
        assert_eq!(processed[1].content, "task statement");
        assert_eq!(processed[2].content, "Old output omitted (2 lines)");
        assert_eq!(processed[3].content, "obs 2");
        assert_eq!(processed[4].content, "obs 3");
    }

    #[test]
    fn last_n_leaves_assistant_and_demo_messages_alone() {
        let history = vec![
            user("first"),
            Message::assistant("reply", "primary", "", ""),
            user("demo content").demo(),
            user("middle"),
            user("last"),
        ];
        let processed = HistoryProcessor::LastN(1).process(&history);
        assert_eq!(processed[1].content, "reply");
        assert_eq!(processed[2].content, "demo content");
        // "middle" is elided; "last" survives.
        assert!(processed[3].content.contains("omitted"));
        assert_eq!(processed[4].content, "last");
    }

    #[test]
    fn last_n_from_config_requires_n() {
        let bad = HistoryProcessorConfig {
            name: "last_n".into(),
            n: None,
        };
        assert!(HistoryProcessor::from_config(&bad).is_err());
    }

    // ── closed_window ─────────────────────────────────────────────────────────

    fn window_message(file: &str, first_line: usize) -> Message {
        let body: String = (first_line..first_line + 3)
            .map(|i| format!("{i}:code line {i}\n"))
            .collect();
        user(&format!("[File: {file} (100 lines total)]\n{body}"))
    }

    #[test]
    fn closed_window_keeps_only_latest_window_per_file() {
        let history = vec![
            window_message("/repo/a.py", 1),
            window_message("/repo/a.py", 50),
        ];
        let processed = HistoryProcessor::ClosedWindow.process(&history);
        assert!(processed[0].content.contains("Outdated window with 3 lines omitted"));
        assert!(processed[1].content.contains("50:code line 50"));
    }

    #[test]
    fn closed_window_keeps_windows_of_different_files() {
        let history = vec![
            window_message("/repo/a.py", 1),
            window_message("/repo/b.py", 1),
        ];
        let processed = HistoryProcessor::ClosedWindow.process(&history);
        assert!(processed[0].content.contains("1:code line 1"));
        assert!(processed[1].content.contains("1:code line 1"));
    }

    #[test]
    fn closed_window_ignores_messages_without_windows() {
        let history = vec![user("plain observation"), window_message("/repo/a.py", 1)];
        let processed = HistoryProcessor::ClosedWindow.process(&history);
        assert_eq!(processed[0].content, "plain observation");
    }

    // ── Demonstrations ────────────────────────────────────────────────────────

    fn demo_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("demo.traj");
        let traj = serde_json::json!({
            "history": [
                {"role": "system", "content": "sys", "agent": "primary"},
                {"role": "user", "content": "look at the issue", "agent": "primary"},
                {"role": "assistant", "content": "```\nls\n```", "agent": "primary"},
            ]
        });
        std::fs::write(&path, traj.to_string()).unwrap();
        path
    }

    #[test]
    fn demos_splice_role_tagged_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.demonstrations = vec![demo_file(&dir)];
        config.put_demos_in_history = true;
        let messages = load_demonstrations(&config, "primary").unwrap();
        assert_eq!(messages.len(), 2); // system entry dropped
        assert!(messages.iter().all(|m| m.is_demo));
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[test]
    fn demos_render_into_single_user_message_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.demonstrations = vec![demo_file(&dir)];
        let messages = load_demonstrations(&config, "primary").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[0].is_demo);
        assert!(messages[0].content.contains("DEMONSTRATION"));
        assert!(messages[0].content.contains("look at the issue"));
    }
}
