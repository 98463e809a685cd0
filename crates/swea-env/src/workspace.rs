// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use swea_config::{EnvironmentRecipe, SandboxConfig, TaskRecord};

use crate::channel::{ChannelError, CommandChannel, DEFAULT_TIMEOUT};

/// Sentinel for heredocs that carry arbitrary file content into the sandbox.
const HEREDOC_EOF: &str = "__SWEA_EOF__";

/// Any failing step here is fatal for the task: it is marked failed with
/// reason "setup" and never retried.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("setup: {0}")]
    Setup(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Prepares and resets the task checkout inside the sandbox.
///
/// After `reset` the working tree matches `base_commit` exactly, the editor
/// environment variables are zeroed, the shell sits in the repo root with
/// `$ROOT` exported, and the task's interpreter environment is active.
pub struct WorkspaceManager {
    config: SandboxConfig,
    /// Token for cloning private mirrors and opening PRs.
    github_token: Option<String>,
}

impl WorkspaceManager {
    pub fn new(config: SandboxConfig) -> Self {
        let github_token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        Self {
            config,
            github_token,
        }
    }

    pub async fn reset(
        &self,
        channel: &mut dyn CommandChannel,
        task: &TaskRecord,
        env_variables: &BTreeMap<String, String>,
        apply_test_patch: bool,
    ) -> Result<(), WorkspaceError> {
        let long = Duration::from_secs(self.config.long_timeout_secs);
        let repo_dir = task.repo_directory();

        self.run(channel, "cd /", "failed to enter filesystem root", DEFAULT_TIMEOUT)
            .await?;

        // Clone once; later resets against a persistent container reuse the
        // existing checkout.
        let (folders, _) = channel.send("ls", DEFAULT_TIMEOUT).await?;
        if !folders.split_whitespace().any(|f| f == repo_dir) {
            self.clone_repository(channel, task, &repo_dir, long).await?;
        }

        // Pristine checkout at the base commit.
        for cmd in [
            format!("cd {repo_dir}"),
            "export ROOT=$(pwd -P)".to_string(),
            "git status".to_string(),
            "git restore .".to_string(),
            format!("git reset --hard {}", task.base_commit),
            "git clean -fdxq".to_string(),
        ] {
            self.run(channel, &cmd, "failed to clean repository", DEFAULT_TIMEOUT)
                .await?;
        }

        // Zero the editor state contract.
        for (var, value) in env_variables {
            self.run(
                channel,
                &format!("export {var}={value:?}"),
                "failed to reset environment variables",
                DEFAULT_TIMEOUT,
            )
            .await?;
        }

        if self.config.install_environment {
            if let Some(recipe) = &task.environment {
                self.install_environment(channel, task, recipe, long).await?;
            }
        }

        // The edit gate needs its lint tool inside the sandbox.
        self.run(
            channel,
            "pip install flake8",
            "failed to install flake8 (lint library)",
            long,
        )
        .await?;

        if apply_test_patch {
            let patch = task.test_patch.as_deref().ok_or_else(|| {
                WorkspaceError::Setup("oracle mode requires a test_patch".into())
            })?;
            self.write_file(channel, "/root/test.patch", patch).await?;
            self.run(
                channel,
                "git apply /root/test.patch",
                "failed to apply test patch correctly",
                DEFAULT_TIMEOUT,
            )
            .await?;
        }

        info!(instance = %task.instance_id, "workspace reset complete");
        Ok(())
    }

    async fn clone_repository(
        &self,
        channel: &mut dyn CommandChannel,
        task: &TaskRecord,
        repo_dir: &str,
        timeout: Duration,
    ) -> Result<(), WorkspaceError> {
        let token_at = self
            .github_token
            .as_deref()
            .map(|t| format!("{t}@"))
            .unwrap_or_default();
        if !self.config.no_mirror {
            info!(repo = %task.repo, "cloning from read-through mirror");
            let mirror = format!("git clone https://{token_at}github.com/swe-bench/{repo_dir}.git");
            match self.run(channel, &mirror, "mirror clone failed", timeout).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "mirror clone failed, falling back to canonical remote"),
            }
        }
        let canonical = format!(
            "git clone https://{token_at}github.com/{}.git {repo_dir}",
            task.repo
        );
        self.run(
            channel,
            &canonical,
            "failed to clone repository from canonical remote",
            timeout,
        )
        .await
    }

    /// Build the task's runtime environment from its declarative recipe.
    async fn install_environment(
        &self,
        channel: &mut dyn CommandChannel,
        task: &TaskRecord,
        recipe: &EnvironmentRecipe,
        timeout: Duration,
    ) -> Result<(), WorkspaceError> {
        let env_name = format!(
            "{}__{}",
            task.repo_directory(),
            task.version.as_deref().unwrap_or("dev")
        );

        let (existing, _) = channel
            .send(&format!("conda env list | grep {env_name}"), timeout)
            .await?;
        if existing.trim().is_empty() {
            info!(env = %env_name, "creating task environment");
            let python = recipe.python.as_deref().unwrap_or("3");
            if let Some(requirements) = &recipe.requirements {
                self.run(
                    channel,
                    &format!("conda create -n {env_name} python={python} -y"),
                    "failed to create environment",
                    timeout,
                )
                .await?;
                self.write_file(channel, "/root/requirements.txt", requirements)
                    .await?;
                self.run(
                    channel,
                    &format!("conda activate {env_name}"),
                    "failed to activate environment",
                    DEFAULT_TIMEOUT,
                )
                .await?;
                self.run(
                    channel,
                    "pip install -r /root/requirements.txt",
                    "failed to install requirements",
                    timeout,
                )
                .await?;
                let _ = channel.send("rm /root/requirements.txt", DEFAULT_TIMEOUT).await;
            } else {
                let packages = recipe.packages.as_deref().unwrap_or("");
                self.run(
                    channel,
                    &format!("conda create -n {env_name} python={python} {packages} -y"),
                    "failed to create environment",
                    timeout,
                )
                .await?;
            }
            if !recipe.pip_packages.is_empty() {
                self.run(
                    channel,
                    &format!(
                        "source activate {env_name} && pip install {}",
                        recipe.pip_packages.join(" ")
                    ),
                    "failed to install pip packages",
                    timeout,
                )
                .await?;
            }
        }

        self.run(
            channel,
            &format!("conda activate {env_name}"),
            "failed to activate environment",
            DEFAULT_TIMEOUT,
        )
        .await?;

        for cmd in &recipe.pre_install {
            self.run(channel, cmd, "pre-install command failed", timeout).await?;
        }
        if let Some(install) = &recipe.install {
            info!(repo = %task.repo, "installing repository at base commit");
            self.run(channel, install, "install command failed", timeout).await?;
        }
        for cmd in &recipe.post_install {
            self.run(channel, cmd, "post-install command failed", timeout).await?;
        }
        Ok(())
    }

    /// Write arbitrary content into the sandbox through a quoted heredoc.
    pub async fn write_file(
        &self,
        channel: &mut dyn CommandChannel,
        path: &str,
        content: &str,
    ) -> Result<(), WorkspaceError> {
        let cmd = format!("cat > {path} <<'{HEREDOC_EOF}'\n{content}\n{HEREDOC_EOF}");
        self.run(channel, &cmd, "failed to write file", DEFAULT_TIMEOUT)
            .await
    }

    /// `communicate_with_handling`: non-zero exit is fatal for the task.
    async fn run(
        &self,
        channel: &mut dyn CommandChannel,
        command: &str,
        error_msg: &str,
        timeout: Duration,
    ) -> Result<(), WorkspaceError> {
        let (output, code) = channel.send(command, timeout).await?;
        if code != 0 {
            return Err(WorkspaceError::Setup(format!("{error_msg}: {output}")));
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalChannel;
    use swea_config::SandboxKind;

    fn task() -> TaskRecord {
        TaskRecord {
            instance_id: "octo__widgets-1".into(),
            repo: "octo/widgets".into(),
            base_commit: "HEAD".into(),
            problem_statement: "widgets are broken".into(),
            patch: None,
            test_patch: Some("diff --git a/x b/x\n".into()),
            fail_to_pass: vec![],
            version: None,
            environment: None,
        }
    }

    fn local_config() -> SandboxConfig {
        SandboxConfig {
            kind: SandboxKind::Local,
            install_environment: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn write_file_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut chan = LocalChannel::start(dir.path()).await.unwrap();
        let mgr = WorkspaceManager::new(local_config());
        let target = dir.path().join("payload.txt");
        let content = "line one\nline two with 'quotes' and $DOLLARS\n";
        mgr.write_file(&mut chan, &target.display().to_string(), content)
            .await
            .unwrap();
        let written = std::fs::read_to_string(&target).unwrap();
        assert_eq!(written.trim_end(), content.trim_end());
        chan.close().await.unwrap();
    }

    #[tokio::test]
    async fn write_file_does_not_expand_variables() {
        let dir = tempfile::tempdir().unwrap();
        let mut chan = LocalChannel::start(dir.path()).await.unwrap();
        let mgr = WorkspaceManager::new(local_config());
        let target = dir.path().join("raw.txt");
        mgr.write_file(&mut chan, &target.display().to_string(), "$HOME is not expanded")
            .await
            .unwrap();
        let written = std::fs::read_to_string(&target).unwrap();
        assert!(written.contains("$HOME"));
        chan.close().await.unwrap();
    }

    #[tokio::test]
    async fn failing_setup_step_is_fatal_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let mut chan = LocalChannel::start(dir.path()).await.unwrap();
        let mgr = WorkspaceManager::new(local_config());
        let err = mgr
            .run(&mut chan, "false", "failed on purpose", DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::Setup(_)));
        assert!(err.to_string().starts_with("setup:"));
        chan.close().await.unwrap();
    }

    #[tokio::test]
    async fn reset_on_a_real_git_checkout() {
        // Build a tiny git repo shaped like a cloned task checkout, then
        // drive the pristine-reset path against it.
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("octo__widgets");
        std::fs::create_dir(&repo).unwrap();
        let git = |args: &str| {
            std::process::Command::new("sh")
                .arg("-c")
                .arg(format!(
                    "cd {} && git {} >/dev/null 2>&1",
                    repo.display(),
                    args
                ))
                .status()
                .unwrap()
        };
        git("init");
        git("config user.email t@t && git config user.name t");
        std::fs::write(repo.join("x.py"), "print(1)\n").unwrap();
        git("add -A && git commit -m init");

        let mut chan = LocalChannel::start(dir.path()).await.unwrap();
        let mgr = WorkspaceManager::new(local_config());
        // Dirty the tree, then reset; `cd /` in reset() is replaced by the
        // channel's own root, so drive the clean sequence directly.
        std::fs::write(repo.join("x.py"), "print(2)\n").unwrap();
        for cmd in [
            "cd octo__widgets".to_string(),
            "git restore .".to_string(),
            format!("git reset --hard {}", task().base_commit),
            "git clean -fdxq".to_string(),
        ] {
            mgr.run(&mut chan, &cmd, "failed to clean repository", DEFAULT_TIMEOUT)
                .await
                .unwrap();
        }
        assert_eq!(std::fs::read_to_string(repo.join("x.py")).unwrap(), "print(1)\n");
        chan.close().await.unwrap();
    }
}
