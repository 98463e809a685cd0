// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use crate::registry::CommandRegistry;

/// One executable unit peeled out of a raw action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEnvelope {
    /// Agent the envelope belongs to (the primary agent, or a subroutine
    /// name when the parser recognized one at the head).
    pub agent: String,
    pub kind: EnvelopeKind,
    /// The matched text, command name included.
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// A catalogue command (or submit), named.
    Command(String),
    /// A subroutine invocation, named.
    Subroutine(String),
    /// Preamble text between matches, forwarded to the shell verbatim.
    Shell,
}

/// Compiled per-command patterns: single-line commands match to end of line,
/// heredoc commands span to their terminator line.
pub struct ActionSplitter {
    patterns: Vec<(String, bool, Regex)>,
}

impl ActionSplitter {
    pub fn new(registry: &CommandRegistry) -> Self {
        let submit = registry.submit_command();
        let mut patterns = Vec::new();
        for cmd in registry.commands() {
            if cmd.name == submit {
                continue;
            }
            patterns.push((
                cmd.name.clone(),
                false,
                command_pattern(&cmd.name, cmd.end_name.as_deref()),
            ));
        }
        for sub in registry.subroutines() {
            patterns.push((
                sub.name.clone(),
                true,
                command_pattern(&sub.name, sub.end_name.as_deref()),
            ));
        }
        // The submit command only ever matches on a bare line.
        patterns.push((submit.to_string(), false, submit_pattern(submit)));
        Self { patterns }
    }

    /// Greedily peel the leftmost command/subroutine match; text between
    /// matches becomes shell envelopes under the primary agent.
    pub fn split(&self, action: &str, primary_agent: &str) -> Vec<ActionEnvelope> {
        let mut envelopes = Vec::new();
        let mut rest = action;
        loop {
            let earliest = self
                .patterns
                .iter()
                .filter_map(|(name, is_sub, pat)| {
                    pat.find(rest).map(|m| (m.start(), m.end(), name, *is_sub))
                })
                .min_by_key(|(start, ..)| *start);

            let Some((start, end, name, is_sub)) = earliest else {
                push_shell(&mut envelopes, rest, primary_agent);
                break;
            };

            push_shell(&mut envelopes, &rest[..start], primary_agent);
            let matched = rest[start..end].trim().to_string();
            let (agent, kind) = if is_sub {
                (name.clone(), EnvelopeKind::Subroutine(name.clone()))
            } else {
                (primary_agent.to_string(), EnvelopeKind::Command(name.clone()))
            };
            envelopes.push(ActionEnvelope {
                agent,
                kind,
                raw: matched,
            });
            rest = &rest[end..];
            if rest.trim().is_empty() {
                break;
            }
        }
        envelopes
    }
}

fn push_shell(envelopes: &mut Vec<ActionEnvelope>, text: &str, agent: &str) {
    if !text.trim().is_empty() {
        envelopes.push(ActionEnvelope {
            agent: agent.to_string(),
            kind: EnvelopeKind::Shell,
            raw: text.trim().to_string(),
        });
    }
}

fn command_pattern(name: &str, end_name: Option<&str>) -> Regex {
    let name = regex::escape(name);
    let pattern = match end_name {
        Some(end) => {
            let end = regex::escape(end);
            // Heredoc commands span lines up to their terminator.
            format!(r"(?ms)^\s*({name})\s*(.*?)^({end})\s*$")
        }
        None => format!(r"(?m)^\s*({name})(?:[ \t]+(\S.*)|[ \t]*)$"),
    };
    Regex::new(&pattern).expect("command pattern must compile")
}

fn submit_pattern(name: &str) -> Regex {
    let name = regex::escape(name);
    Regex::new(&format!(r"(?m)^\s*({name})(\s*)$")).expect("submit pattern must compile")
}

/// Rewrite a multi-line command for shell delivery: the opening line gains
/// `<< '<end_marker>'` so the payload arrives as a quoted heredoc.
pub fn rewrite_heredoc(raw: &str, end_marker: &str) -> String {
    match raw.split_once('\n') {
        Some((first, rest)) => format!("{first} << '{end_marker}'\n{rest}"),
        None => raw.to_string(),
    }
}

/// Extract the captured submission from shell output, if the sentinel pair
/// is present.  Greedy and newline-tolerant.
pub fn extract_submission(output: &str) -> Option<String> {
    // Compiled on use; submission extraction happens at most twice per task.
    let pattern = Regex::new(r"(?s)<<SUBMISSION\|\|(.*)\|\|SUBMISSION>>")
        .expect("submission pattern must compile");
    pattern
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// First-word / exact-match blocklists: interactive tools are rejected
/// before anything reaches the shell.
pub fn should_block(action: &str, blocklist: &[String], blocklist_standalone: &[String]) -> bool {
    let trimmed = action.trim();
    let Some(first) = trimmed.split_whitespace().next() else {
        return false;
    };
    if blocklist.iter().any(|b| b == first) {
        return true;
    }
    blocklist_standalone.iter().any(|b| b == trimmed)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
