// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use swea_config::{render_command_docs, CommandDescriptor, SubroutineConfig};

/// The immutable command surface presented to the model: catalogue commands,
/// subroutine declarations, and the submit command.
///
/// A plain runtime table — commands are registered here at startup from the
/// loaded catalogue, with no registration side effects anywhere else.
pub struct CommandRegistry {
    commands: Vec<CommandDescriptor>,
    subroutines: Vec<SubroutineConfig>,
    submit_command: String,
}

impl CommandRegistry {
    pub fn new(
        commands: Vec<CommandDescriptor>,
        subroutines: Vec<SubroutineConfig>,
        submit_command: impl Into<String>,
    ) -> Self {
        Self {
            commands,
            subroutines,
            submit_command: submit_command.into(),
        }
    }

    pub fn commands(&self) -> &[CommandDescriptor] {
        &self.commands
    }

    pub fn subroutines(&self) -> &[SubroutineConfig] {
        &self.subroutines
    }

    pub fn submit_command(&self) -> &str {
        &self.submit_command
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn get_subroutine(&self, name: &str) -> Option<&SubroutineConfig> {
        self.subroutines.iter().find(|s| s.name == name)
    }

    pub fn is_known_command(&self, name: &str) -> bool {
        name == self.submit_command || self.get(name).is_some()
    }

    /// The `{command_docs}` placeholder: catalogue commands first, then
    /// subroutines, in declaration order.
    pub fn command_docs(&self) -> String {
        let command_entries = self
            .commands
            .iter()
            .map(|c| (c.signature.as_str(), c.docstring.as_str()));
        let subroutine_entries = self.subroutines.iter().map(|s| {
            (
                s.signature.as_str(),
                s.docstring.as_deref().unwrap_or_default(),
            )
        });
        render_command_docs(command_entries.chain(subroutine_entries))
    }

    /// Heredoc terminators, keyed by command name.
    ///
    /// Built from the command catalogue side only; subroutine end markers are
    /// kept on their own declarations and never merged into this map, so a
    /// submit command appearing on both sides cannot collide.
    pub fn multi_line_command_endings(&self) -> BTreeMap<String, String> {
        self.commands
            .iter()
            .filter_map(|c| c.end_name.clone().map(|end| (c.name.clone(), end)))
            .collect()
    }

    pub fn end_marker(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|c| c.end_name.as_deref())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
