// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod catalogue;
mod loader;
mod schema;
mod task;

pub use catalogue::{
    load_command_files, render_command_docs, ArgumentSpec, CommandDescriptor, CommandFile,
    CommandKind,
};
pub use loader::load;
pub use schema::{
    AgentConfig, Config, EnvironmentRecipe, HistoryProcessorConfig, ModelConfig, PullRequestConfig,
    SandboxConfig, SandboxKind, SubroutineConfig, SubroutineReturnType,
};
pub use task::{load_instances, TaskRecord};
