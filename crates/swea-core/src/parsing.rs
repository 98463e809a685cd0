// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;

use thiserror::Error;

use crate::editor::sh_quote;
use crate::registry::CommandRegistry;

/// The model's reply could not be parsed into `(thought, action)`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct FormatError(pub String);

/// Reply parsers, selected by name from configuration at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyParser {
    /// Free-text discussion plus a fenced code block; the action is the last
    /// non-nested block.
    ThoughtAction,
    /// Same structure with `<command>…</command>` tags.
    XmlThoughtAction,
    /// A single JSON object `{thought, command: {name, arguments}}`.
    Json,
    /// Pass-through; only used with the human-in-the-loop backend.
    Identity,
}

impl ReplyParser {
    pub fn by_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "thought_action" => Ok(Self::ThoughtAction),
            "xml_thought_action" => Ok(Self::XmlThoughtAction),
            "json" => Ok(Self::Json),
            "identity" => Ok(Self::Identity),
            other => anyhow::bail!("unknown reply parser: {other}"),
        }
    }

    /// Parse a raw model reply into `(thought, action)`.
    pub fn parse(
        &self,
        response: &str,
        registry: &CommandRegistry,
    ) -> Result<(String, String), FormatError> {
        match self {
            Self::ThoughtAction => parse_thought_action(response),
            Self::XmlThoughtAction => parse_xml_thought_action(response),
            Self::Json => parse_json(response, registry),
            Self::Identity => Ok((response.to_string(), response.to_string())),
        }
    }
}

/// The action is the contents of the last non-nested fenced block; the
/// thought is everything outside it.
fn parse_thought_action(response: &str) -> Result<(String, String), FormatError> {
    // Fence lines: ```lang opens (lang may be empty); a bare ``` closes when
    // a block is open, otherwise it opens an anonymous block.
    struct Fence {
        line_start: usize,
        line_end: usize,
    }
    let mut stack: Vec<Fence> = Vec::new();
    let mut last_block: Option<(Fence, Fence)> = None;

    let mut offset = 0;
    for line in response.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let trimmed = line.trim_end_matches('\n');
        if !trimmed.starts_with("```") {
            continue;
        }
        let tag = trimmed[3..].trim();
        let fence = Fence {
            line_start: start,
            line_end: offset,
        };
        if !stack.is_empty() && tag.is_empty() {
            let open = stack.pop().expect("stack checked non-empty");
            if stack.is_empty() {
                last_block = Some((open, fence));
            }
        } else {
            stack.push(fence);
        }
    }

    match last_block {
        Some((open, close)) => {
            let action = response[open.line_end..close.line_start].to_string();
            let thought = format!(
                "{}{}",
                &response[..open.line_start],
                &response[close.line_end..]
            );
            Ok((thought.trim().to_string(), action.trim().to_string()))
        }
        None => Err(FormatError("No action found in model response.".into())),
    }
}

/// The action is everything between the last `<command>` and `</command>`
/// pair; the thought is everything outside it.
fn parse_xml_thought_action(response: &str) -> Result<(String, String), FormatError> {
    const OPEN: &str = "<command>";
    const CLOSE: &str = "</command>";
    let (Some(open_at), Some(close_at)) = (response.rfind(OPEN), response.rfind(CLOSE)) else {
        return Err(FormatError("No action found in model response.".into()));
    };
    if close_at < open_at {
        return Err(FormatError("No action found in model response.".into()));
    }
    let action = &response[open_at + OPEN.len()..close_at];
    let thought = format!(
        "{}{}",
        &response[..open_at],
        &response[close_at + CLOSE.len()..]
    );
    Ok((thought.trim().to_string(), action.trim().to_string()))
}

/// `{thought, command: {name, arguments}}`, re-rendered through the command's
/// declared signature.
fn parse_json(response: &str, registry: &CommandRegistry) -> Result<(String, String), FormatError> {
    let data: serde_json::Value = serde_json::from_str(response)
        .map_err(|_| FormatError("Model output is not valid JSON.".into()))?;
    if !data.is_object() {
        return Err(FormatError("Model output is not a JSON object.".into()));
    }
    let thought = data
        .get("thought")
        .and_then(|t| t.as_str())
        .ok_or_else(|| FormatError("Key 'thought' is missing from model output.".into()))?;
    let command = data
        .get("command")
        .and_then(|c| c.as_object())
        .ok_or_else(|| FormatError("Key 'command' is missing from model output.".into()))?;
    let name = command
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| FormatError("Key 'name' is missing from 'command' object.".into()))?;
    let arguments = command.get("arguments").and_then(|a| a.as_object());

    let action = match registry.get(name) {
        None => {
            // Unknown command: degrade to name plus space-joined arguments.
            let mut action = name.to_string();
            if let Some(args) = arguments {
                for value in args.values() {
                    action.push(' ');
                    action.push_str(&value_to_text(value));
                }
            }
            action
        }
        Some(descriptor) => {
            // `<arg>` and `[<arg>]` in the signature become `{arg}` slots.
            let template = descriptor
                .signature
                .replace(['[', ']'], "")
                .replace('<', "{")
                .replace('>', "}");
            let mut action = template.clone();
            for key in extract_keys(&template) {
                let value = arguments
                    .and_then(|args| args.get(&key))
                    .map(|v| {
                        let text = value_to_text(v);
                        // String arguments of single-line commands are quoted
                        // so the rendered action re-splits losslessly.
                        if v.is_string() && descriptor.end_name.is_none() {
                            sh_quote(&text)
                        } else {
                            text
                        }
                    })
                    .unwrap_or_default();
                action = action.replace(&format!("{{{key}}}"), &value);
            }
            action
        }
    };
    Ok((thought.to_string(), action.trim().to_string()))
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// All `{key}` placeholders of a format template.
pub fn extract_keys(template: &str) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close_rel) = rest[open + 1..].find('}') else {
            break;
        };
        let key = &rest[open + 1..open + 1 + close_rel];
        if !key.is_empty() && !key.contains('{') {
            keys.insert(key.to_string());
        }
        rest = &rest[open + 1 + close_rel + 1..];
    }
    keys
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
