// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::{BufRead, Write};

use async_trait::async_trait;

use swea_config::CommandDescriptor;

use crate::{Message, ModelError, ModelProvider, Role};

/// Human-in-the-loop backend: prompts on stdin instead of calling an API.
///
/// Multi-line commands are recognized by their heredoc terminator: when the
/// first word of the input names a command with an `end_name`, lines are read
/// until the sentinel line appears.  In thought mode a free-text thought is
/// collected first and the reply is rendered in the standard
/// discussion-plus-fenced-block format.
pub struct HumanProvider {
    /// `(command name, end marker)` for every multi-line command.
    multi_line_endings: Vec<(String, String)>,
    thought_mode: bool,
}

impl HumanProvider {
    pub fn new(commands: &[CommandDescriptor], thought_mode: bool) -> Self {
        let multi_line_endings = commands
            .iter()
            .filter_map(|c| c.end_name.clone().map(|end| (c.name.clone(), end)))
            .collect();
        Self {
            multi_line_endings,
            thought_mode,
        }
    }

    fn end_marker_for(&self, first_word: &str) -> Option<&str> {
        self.multi_line_endings
            .iter()
            .find(|(name, _)| name == first_word)
            .map(|(_, end)| end.as_str())
    }

    fn read_action(&self, input: &mut dyn BufRead, output: &mut dyn Write) -> std::io::Result<String> {
        write!(output, "> ")?;
        output.flush()?;
        let mut line = String::new();
        input.read_line(&mut line)?;
        let mut action = line.trim_end_matches('\n').to_string();

        let first_word = action.split_whitespace().next().unwrap_or("").to_string();
        if let Some(end_marker) = self.end_marker_for(&first_word) {
            let end_marker = end_marker.to_string();
            loop {
                let mut next = String::new();
                if input.read_line(&mut next)? == 0 {
                    break;
                }
                let next = next.trim_end_matches('\n');
                action.push('\n');
                action.push_str(next);
                if next.trim() == end_marker {
                    break;
                }
            }
        }
        Ok(action)
    }
}

#[async_trait]
impl ModelProvider for HumanProvider {
    fn name(&self) -> &str {
        if self.thought_mode {
            "human_thought"
        } else {
            "human"
        }
    }

    async fn query(&self, history: &[Message]) -> Result<String, ModelError> {
        // Show the observation the model would have seen.
        if let Some(last) = history.iter().rev().find(|m| m.role == Role::User) {
            println!("{}", last.content);
        }

        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();

        let thought = if self.thought_mode {
            print!("Thought: ");
            stdout.flush().map_err(|e| ModelError::Other(e.into()))?;
            let mut t = String::new();
            stdin
                .lock()
                .read_line(&mut t)
                .map_err(|e| ModelError::Other(e.into()))?;
            t.trim_end().to_string()
        } else {
            String::new()
        };

        let action = self
            .read_action(&mut stdin.lock(), &mut stdout)
            .map_err(|e| ModelError::Other(e.into()))?;

        if self.thought_mode {
            Ok(format!("{thought}\n```\n{action}\n```"))
        } else {
            Ok(action)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn edit_command() -> CommandDescriptor {
        CommandDescriptor {
            name: "edit".into(),
            signature: "edit <start>:<end>".into(),
            docstring: String::new(),
            end_name: Some("end_of_edit".into()),
            arguments: BTreeMap::new(),
            code: String::new(),
        }
    }

    #[test]
    fn single_line_input_is_returned_as_is() {
        let p = HumanProvider::new(&[edit_command()], false);
        let mut input = std::io::Cursor::new(b"ls -l\n".to_vec());
        let mut out = Vec::new();
        let action = p.read_action(&mut input, &mut out).unwrap();
        assert_eq!(action, "ls -l");
    }

    #[test]
    fn multi_line_input_reads_until_sentinel() {
        let p = HumanProvider::new(&[edit_command()], false);
        let mut input = std::io::Cursor::new(b"edit 1:2\nnew text\nend_of_edit\n".to_vec());
        let mut out = Vec::new();
        let action = p.read_action(&mut input, &mut out).unwrap();
        assert_eq!(action, "edit 1:2\nnew text\nend_of_edit");
    }

    #[test]
    fn eof_terminates_multi_line_read() {
        let p = HumanProvider::new(&[edit_command()], false);
        let mut input = std::io::Cursor::new(b"edit 1:2\nunterminated".to_vec());
        let mut out = Vec::new();
        let action = p.read_action(&mut input, &mut out).unwrap();
        assert!(action.starts_with("edit 1:2"));
    }

    #[test]
    fn name_reflects_thought_mode() {
        assert_eq!(HumanProvider::new(&[], false).name(), "human");
        assert_eq!(HumanProvider::new(&[], true).name(), "human_thought");
    }
}
