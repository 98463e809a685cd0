// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "swea",
    about = "Autonomous software-engineering agent for repository issues",
    version
)]
pub struct Cli {
    /// Explicit config file merged over the discovered layers.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Task instances: a .json / .jsonl dataset file.
    #[arg(long)]
    pub data_path: Option<PathBuf>,

    /// Run only the instance with this id.
    #[arg(long)]
    pub instance: Option<String>,

    /// Model name override (e.g. gpt-4, claude-3-opus-20240229, human, replay).
    #[arg(long)]
    pub model: Option<String>,

    /// Sampling temperature override.
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Nucleus sampling override.
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Per-instance cost ceiling in USD (0 disables).
    #[arg(long)]
    pub per_instance_cost_limit: Option<f64>,

    /// Directory run artifacts are written under.
    #[arg(long, default_value = "trajectories")]
    pub traj_dir: PathBuf,

    /// Optional suffix appended to the run directory name.
    #[arg(long)]
    pub suffix: Option<String>,

    /// Pre-apply the dataset's test patch (oracle mode).
    #[arg(long)]
    pub apply_test_patch: bool,

    /// Skip instances that already have a trajectory in the run directory.
    #[arg(long)]
    pub skip_existing: bool,

    /// Open a draft PR after a successful submission (requires --issue-url).
    #[arg(long)]
    pub open_pr: bool,

    /// GitHub issue the run resolves; used by --open-pr.
    #[arg(long)]
    pub issue_url: Option<String>,

    /// Container image override.
    #[arg(long)]
    pub image: Option<String>,

    /// Reuse (and pause on exit) this named container.
    #[arg(long)]
    pub container_name: Option<String>,

    /// Run the sandbox as a local shell instead of docker.
    #[arg(long)]
    pub local_sandbox: bool,

    /// Skip building the task's interpreter environment.
    #[arg(long)]
    pub skip_install: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the effective merged configuration as YAML.
    ShowConfig,
}

impl Cli {
    /// Fold the CLI overrides into the loaded configuration.
    pub fn apply_overrides(&self, config: &mut swea_config::Config) {
        if let Some(model) = &self.model {
            config.model.name = model.clone();
        }
        if let Some(temperature) = self.temperature {
            config.model.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            config.model.top_p = top_p;
        }
        if let Some(limit) = self.per_instance_cost_limit {
            config.model.per_instance_cost_limit = limit;
        }
        if let Some(image) = &self.image {
            config.sandbox.image = image.clone();
        }
        if let Some(name) = &self.container_name {
            config.sandbox.container_name = Some(name.clone());
        }
        if self.local_sandbox {
            config.sandbox.kind = swea_config::SandboxKind::Local;
        }
        if self.skip_install {
            config.sandbox.install_environment = false;
        }
        if self.open_pr {
            config.pull_request.open_pr = true;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
