// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use swea_config::{load_command_files, Config, TaskRecord};
use swea_core::{Agent, CommandRegistry, RunResult};
use swea_env::{pr, CommandChannel, WorkspaceManager};
use swea_model::{ModelProvider, StatsLedger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = swea_config::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    if let Some(Commands::ShowConfig) = &cli.command {
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    run(cli, config).await
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let data_path = cli
        .data_path
        .clone()
        .context("--data-path is required (a .json or .jsonl dataset file)")?;
    let mut tasks = swea_config::load_instances(&data_path)?;
    if let Some(instance) = &cli.instance {
        tasks.retain(|t| &t.instance_id == instance);
        anyhow::ensure!(!tasks.is_empty(), "instance {instance} not found in dataset");
    }
    info!(count = tasks.len(), "loaded task instances");

    let run_dir = cli.traj_dir.join(run_directory_name(
        &config,
        &data_path,
        cli.config.as_deref(),
        cli.suffix.as_deref(),
    ));
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    info!(run_dir = %run_dir.display(), "run directory");

    // ── Command catalogue ────────────────────────────────────────────────────
    let (descriptors, command_files) = load_command_files(&config.agent.command_files)?;
    let registry = Arc::new(CommandRegistry::new(
        descriptors,
        config.agent.subroutines.clone(),
        config.agent.submit_command.clone(),
    ));

    // ── Model client + cost governor ─────────────────────────────────────────
    let ledger = Arc::new(StatsLedger::new(
        config.model.per_instance_cost_limit,
        config.model.total_cost_limit,
    ));
    let model: Arc<dyn ModelProvider> = Arc::from(swea_model::from_config(
        &config.model,
        Arc::clone(&ledger),
        registry.commands(),
    )?);

    // ── Sandbox ──────────────────────────────────────────────────────────────
    let mut channel = swea_env::start_channel(&config.sandbox).await?;
    channel.install_commands(&command_files).await?;
    let workspace = WorkspaceManager::new(config.sandbox.clone());

    let mut agent = Agent::new(
        "primary",
        Arc::new(config.agent.clone()),
        Arc::clone(&registry),
        model,
        Arc::clone(&ledger),
    )?
    .with_command_timeout(std::time::Duration::from_secs(config.sandbox.timeout_secs));

    // One task at a time; tasks are independent and the sandbox is reset
    // between them.
    for task in &tasks {
        let traj_path = run_dir.join(format!("{}.traj", task.instance_id));
        if cli.skip_existing && traj_path.exists() {
            info!(instance = %task.instance_id, "trajectory exists, skipping");
            continue;
        }

        ledger.reset_instance();
        info!(instance = %task.instance_id, repo = %task.repo, "starting task");

        if let Err(e) = workspace
            .reset(
                channel.as_mut(),
                task,
                &config.agent.env_variables,
                cli.apply_test_patch,
            )
            .await
        {
            warn!(instance = %task.instance_id, error = %e, "task setup failed");
            append_prediction(&run_dir, &config.model.name, &task.instance_id, None)?;
            continue;
        }

        // A user interrupt at any blocking point unwinds cleanly: the agent
        // future is dropped, the channel is released (pausing or removing the
        // container), and the trajectory written after the last completed
        // step remains authoritative.
        let outcome = tokio::select! {
            result = agent.run(channel.as_mut(), task, Some(&run_dir), "swe_main", None) => result,
            _ = tokio::signal::ctrl_c() => {
                warn!(instance = %task.instance_id, "interrupted, shutting down");
                channel.close().await?;
                return Ok(());
            }
        };

        match outcome {
            Ok(result) => {
                report_result(&task.instance_id, &result);
                append_prediction(
                    &run_dir,
                    &config.model.name,
                    &task.instance_id,
                    result.info.submission.as_deref(),
                )?;
                maybe_open_pr(&cli, &config, channel.as_mut(), task, &result).await;
            }
            Err(e) => {
                warn!(instance = %task.instance_id, error = %e, "agent run failed");
                append_prediction(&run_dir, &config.model.name, &task.instance_id, None)?;
            }
        }
    }

    channel.close().await?;
    Ok(())
}

fn report_result(instance_id: &str, result: &RunResult) {
    let status = result.info.exit_status.as_deref().unwrap_or("unknown");
    let stats = &result.info.model_stats;
    info!(
        instance = %instance_id,
        exit_status = status,
        steps = result.trajectory.len(),
        api_calls = stats.api_calls,
        instance_cost = stats.instance_cost,
        "task finished"
    );
}

async fn maybe_open_pr(
    cli: &Cli,
    config: &Config,
    channel: &mut dyn CommandChannel,
    task: &TaskRecord,
    result: &RunResult,
) {
    if !config.pull_request.open_pr {
        return;
    }
    let submitted = result
        .info
        .exit_status
        .as_deref()
        .map(|s| s.starts_with("submitted"))
        .unwrap_or(false);
    if !submitted {
        return;
    }
    let Some(issue_url) = &cli.issue_url else {
        warn!("--open-pr requires --issue-url; skipping PR creation");
        return;
    };
    let steps: Vec<(String, String, String)> = result
        .trajectory
        .iter()
        .map(|s| (s.thought.clone(), s.action.clone(), s.observation.clone()))
        .collect();
    if let Err(e) = pr::open_pull_request(channel, &config.pull_request, issue_url, &steps).await {
        warn!(instance = %task.instance_id, error = %e, "failed to open pull request");
    }
}

/// `{model}__{dataset_stem}__{config_stem}__t-{t:.2}__p-{p:.2}__c-{c:.2}__install-{0|1}[__suffix]`
fn run_directory_name(
    config: &Config,
    data_path: &Path,
    config_path: Option<&Path>,
    suffix: Option<&str>,
) -> String {
    let model = config.model.name.replace(['/', ':'], "-");
    let dataset_stem = data_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset");
    let config_stem = config_path
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .unwrap_or("default");
    let install = u8::from(config.sandbox.install_environment);
    let mut name = format!(
        "{model}__{dataset_stem}__{config_stem}__t-{:.2}__p-{:.2}__c-{:.2}__install-{install}",
        config.model.temperature, config.model.top_p, config.model.per_instance_cost_limit,
    );
    if let Some(suffix) = suffix {
        name.push_str("__");
        name.push_str(suffix);
    }
    name
}

/// Append one line to `<run_dir>/all_preds.jsonl`.
fn append_prediction(
    run_dir: &Path,
    model_name: &str,
    instance_id: &str,
    model_patch: Option<&str>,
) -> anyhow::Result<()> {
    let line = serde_json::json!({
        "model_name_or_path": model_name,
        "instance_id": instance_id,
        "model_patch": model_patch,
    });
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join("all_preds.jsonl"))
        .context("opening predictions file")?;
    writeln!(file, "{line}").context("appending prediction")?;
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_directory_name_encodes_parameters() {
        let mut config = Config::default();
        config.model.name = "gpt-4".into();
        config.model.temperature = 0.0;
        config.model.top_p = 0.95;
        config.model.per_instance_cost_limit = 2.0;
        let name = run_directory_name(
            &config,
            Path::new("data/swe-bench.json"),
            Some(Path::new("config/default.yaml")),
            None,
        );
        assert_eq!(
            name,
            "gpt-4__swe-bench__default__t-0.00__p-0.95__c-2.00__install-1"
        );
    }

    #[test]
    fn run_directory_name_appends_suffix() {
        let config = Config::default();
        let name = run_directory_name(&config, Path::new("d.jsonl"), None, Some("trial2"));
        assert!(name.ends_with("__trial2"));
    }

    #[test]
    fn run_directory_name_sanitizes_model_separators() {
        let mut config = Config::default();
        config.model.name = "ollama:llama3".into();
        let name = run_directory_name(&config, Path::new("d.json"), None, None);
        assert!(name.starts_with("ollama-llama3__"));
    }

    #[test]
    fn predictions_file_appends_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        append_prediction(dir.path(), "gpt-4", "inst-1", Some("diff")).unwrap();
        append_prediction(dir.path(), "gpt-4", "inst-2", None).unwrap();
        let text = std::fs::read_to_string(dir.path().join("all_preds.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["instance_id"], "inst-1");
        assert_eq!(first["model_patch"], "diff");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(second["model_patch"].is_null());
    }
}
