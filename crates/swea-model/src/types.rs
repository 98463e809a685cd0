// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// A single message in the agent's conversation history.
///
/// The history is append-only: entries are created by the agent loop and
/// never rewritten.  `agent` scopes an entry to the agent (primary or
/// subroutine) that produced it; `thought` and `action` are only present on
/// assistant entries that went through the reply parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Name of the agent this entry belongs to.
    pub agent: String,
    /// Entry was spliced in from a demonstration trajectory.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_demo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !b
}

impl Message {
    pub fn system(content: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            agent: agent.into(),
            is_demo: false,
            thought: None,
            action: None,
        }
    }

    pub fn user(content: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            agent: agent.into(),
            is_demo: false,
            thought: None,
            action: None,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        agent: impl Into<String>,
        thought: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            agent: agent.into(),
            is_demo: false,
            thought: Some(thought.into()),
            action: Some(action.into()),
        }
    }

    pub fn demo(mut self) -> Self {
        self.is_demo = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Map a history to the `(role, content)` pairs a chat API consumes.
///
/// When `collapse_demos` is set (backends without role-tagged demonstration
/// support), every run of `is_demo` entries is folded into one user message.
pub fn history_to_api_messages(history: &[Message], collapse_demos: bool) -> Vec<(Role, String)> {
    let mut out: Vec<(Role, String)> = Vec::with_capacity(history.len());
    let mut demo_buf: Vec<&str> = Vec::new();

    let flush = |buf: &mut Vec<&str>, out: &mut Vec<(Role, String)>| {
        if !buf.is_empty() {
            out.push((Role::User, buf.join("\n\n")));
            buf.clear();
        }
    };

    for msg in history {
        if collapse_demos && msg.is_demo {
            demo_buf.push(&msg.content);
            continue;
        }
        flush(&mut demo_buf, &mut out);
        out.push((msg.role, msg.content.clone()));
    }
    flush(&mut demo_buf, &mut out);
    out
}

/// Concatenate all system messages into a single system string, returning it
/// together with the non-system remainder.  Backends whose API takes the
/// system prompt as a separate field use this split.
pub fn split_system(history: &[(Role, String)]) -> (String, Vec<(Role, String)>) {
    let system = history
        .iter()
        .filter(|(r, _)| *r == Role::System)
        .map(|(_, c)| c.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let rest = history
        .iter()
        .filter(|(r, _)| *r != Role::System)
        .cloned()
        .collect();
    (system, rest)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s", "primary").role, Role::System);
        assert_eq!(Message::user("u", "primary").role, Role::User);
        assert_eq!(
            Message::assistant("a", "primary", "t", "ls").role,
            Role::Assistant
        );
    }

    #[test]
    fn assistant_carries_thought_and_action() {
        let m = Message::assistant("out", "primary", "thinking", "ls -l");
        assert_eq!(m.thought.as_deref(), Some("thinking"));
        assert_eq!(m.action.as_deref(), Some("ls -l"));
    }

    #[test]
    fn serialization_omits_empty_markers() {
        let m = Message::user("hi", "primary");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("is_demo"));
        assert!(!json.contains("thought"));
    }

    #[test]
    fn demo_flag_round_trips() {
        let m = Message::user("example", "primary").demo();
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(back.is_demo);
    }

    #[test]
    fn collapse_folds_demo_run_into_one_user_message() {
        let history = vec![
            Message::system("sys", "primary"),
            Message::user("demo 1", "primary").demo(),
            Message::assistant("demo 2", "primary", "", "").demo(),
            Message::user("real", "primary"),
        ];
        let msgs = history_to_api_messages(&history, true);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].0, Role::User);
        assert!(msgs[1].1.contains("demo 1"));
        assert!(msgs[1].1.contains("demo 2"));
        assert_eq!(msgs[2].1, "real");
    }

    #[test]
    fn no_collapse_keeps_roles() {
        let history = vec![
            Message::user("demo", "primary").demo(),
            Message::user("real", "primary"),
        ];
        let msgs = history_to_api_messages(&history, false);
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn split_system_concatenates_and_removes() {
        let msgs = vec![
            (Role::System, "a".to_string()),
            (Role::User, "u".to_string()),
            (Role::System, "b".to_string()),
        ];
        let (system, rest) = split_system(&msgs);
        assert_eq!(system, "a\nb");
        assert_eq!(rest.len(), 1);
    }
}
