// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use swea_config::{CommandFile, CommandKind, SandboxConfig};

use crate::channel::{
    communicate, parse_pid_table, read_until_idle, syntax_check_command, ChannelError,
    CommandChannel, ShellIo,
};

/// Time the container gets to come up before the shell is probed.
const START_UP_DELAY: Duration = Duration::from_secs(2);

/// Interactive bash inside a docker container.
///
/// Ephemeral by default (`docker run -i --rm`); when a container name is
/// configured the channel attaches to that container with `docker exec` and
/// pauses instead of removing it on close, so repository clones survive
/// across runs.
pub struct DockerChannel {
    image: String,
    container_name: String,
    persistent: bool,
    /// Pids belonging to the shell/container infrastructure, excluded from
    /// the idle test and from interrupts.
    parent_pids: Vec<String>,
    io: Option<ShellIo>,
    registered: Vec<CommandFile>,
}

impl DockerChannel {
    pub async fn start(config: &SandboxConfig) -> Result<Self, ChannelError> {
        let persistent = config.container_name.is_some();
        let container_name = config.container_name.clone().unwrap_or_else(|| {
            // Colons and slashes are meaningful in image names but not legal
            // in container names.
            let sanitized = config.image.replace(['/', ':'], "-");
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{sanitized}-{}", &suffix[..10])
        });
        let mut channel = Self {
            image: config.image.clone(),
            container_name,
            persistent,
            parent_pids: Vec::new(),
            io: None,
            registered: Vec::new(),
        };
        channel.start_shell().await?;
        channel.init_scripts().await?;
        info!(container = %channel.container_name, "sandbox container initialized");
        Ok(channel)
    }

    async fn start_shell(&mut self) -> Result<(), ChannelError> {
        let mut io = if self.persistent {
            self.ensure_persistent_container().await?;
            let mut cmd = Command::new("docker");
            cmd.args([
                "exec",
                "-i",
                self.container_name.as_str(),
                "/bin/bash",
                "-l",
                "-m",
            ]);
            ShellIo::spawn(cmd).await?
        } else {
            let mut cmd = Command::new("docker");
            cmd.args([
                "run",
                "-i",
                "--rm",
                "--name",
                self.container_name.as_str(),
                self.image.as_str(),
                "/bin/bash",
                "-l",
                "-m",
            ]);
            ShellIo::spawn(cmd).await?
        };

        tokio::time::sleep(START_UP_DELAY).await;
        let startup_noise = io.drain();
        if !startup_noise.trim().is_empty() {
            warn!(output = %startup_noise, "unexpected container startup output");
        }
        if io.shell_exited() {
            return Err(ChannelError::Crashed(format!(
                "container shell exited at startup: {startup_noise}"
            )));
        }
        self.io = Some(io);

        self.parent_pids = if self.persistent {
            self.detect_parent_pids().await?
        } else {
            // The shell is the container's PID 1.
            vec!["1".to_string()]
        };
        Ok(())
    }

    /// Bring the named container into a running state, creating it if needed.
    async fn ensure_persistent_container(&self) -> Result<(), ChannelError> {
        let status = docker_output(&["inspect", "-f", "{{.State.Status}}", &self.container_name])
            .await
            .unwrap_or_default();
        match status.trim() {
            "running" => {}
            "paused" => {
                docker_checked(&["unpause", &self.container_name]).await?;
            }
            "exited" => {
                docker_checked(&["restart", &self.container_name]).await?;
            }
            "created" => {
                docker_checked(&["start", &self.container_name]).await?;
            }
            "" => {
                docker_checked(&[
                    "run",
                    "-d",
                    "-i",
                    "--name",
                    &self.container_name,
                    &self.image,
                    "/bin/bash",
                    "-l",
                    "-m",
                ])
                .await?;
            }
            other => {
                return Err(ChannelError::Crashed(format!(
                    "unexpected container status: {other}"
                )))
            }
        }
        Ok(())
    }

    /// For a persistent container: PID 1 plus the container's own bash.
    /// Anything else already running means another agent owns the container.
    async fn detect_parent_pids(&self) -> Result<Vec<String>, ChannelError> {
        let raw = docker_output(&[
            "exec",
            &self.container_name,
            "ps",
            "-eo",
            "pid,comm",
            "--no-headers",
        ])
        .await?;
        let all = parse_pid_table(&raw, &["1".to_string()]);
        let (bash, alien): (Vec<_>, Vec<_>) = all.into_iter().partition(|(_, c)| c == "bash");
        if bash.len() > 1 || !alien.is_empty() {
            return Err(ChannelError::Crashed(format!(
                "alien processes attached to container: bash={bash:?} other={alien:?}"
            )));
        }
        let mut parents = vec!["1".to_string()];
        parents.extend(bash.into_iter().map(|(pid, _)| pid));
        Ok(parents)
    }

    async fn init_scripts(&mut self) -> Result<(), ChannelError> {
        self.checked("source /root/.bashrc", "failed to source .bashrc")
            .await?;
        self.checked("mkdir -p /root/commands", "failed to create commands directory")
            .await?;
        self.checked(
            "touch /root/commands/__init__.py",
            "failed to create __init__.py",
        )
        .await?;
        self.checked(
            "export PATH=$PATH:/root/commands",
            "failed to add commands directory to PATH",
        )
        .await?;
        Ok(())
    }

    async fn checked(&mut self, command: &str, error_msg: &str) -> Result<String, ChannelError> {
        let (output, code) = self.send(command, Duration::from_secs(25)).await?;
        if code != 0 {
            return Err(ChannelError::Crashed(format!("{error_msg}: {output}")));
        }
        Ok(output)
    }

    async fn sandbox_pids(
        container: &str,
        parents: &[String],
    ) -> Result<Vec<(String, String)>, ChannelError> {
        let raw = docker_output(&["exec", container, "ps", "-eo", "pid,comm", "--no-headers"])
            .await?;
        Ok(parse_pid_table(&raw, parents))
    }

    async fn busy_probe(container: String, parents: Vec<String>) -> Result<bool, ChannelError> {
        Ok(!Self::sandbox_pids(&container, &parents).await?.is_empty())
    }

    async fn raw_send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, i32), ChannelError> {
        let container = self.container_name.clone();
        let parents = self.parent_pids.clone();
        let io = self.io.as_mut().ok_or(ChannelError::BrokenPipe)?;
        communicate(
            io,
            || Self::busy_probe(container.clone(), parents.clone()),
            command,
            timeout,
        )
        .await
    }
}

#[async_trait]
impl CommandChannel for DockerChannel {
    async fn send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, i32), ChannelError> {
        let (syntax_errors, code) = self
            .raw_send(&syntax_check_command(command), Duration::from_secs(10))
            .await?;
        if code != 0 {
            return Ok((syntax_errors, code));
        }

        match self.raw_send(command, timeout).await {
            Ok(result) => Ok(result),
            Err(ChannelError::Timeout(_)) => {
                warn!(cmd = %command, "command timed out, attempting interrupt");
                match self.interrupt().await {
                    Ok(()) => Ok(("EXECUTION TIMED OUT".to_string(), 1)),
                    Err(_) => {
                        self.reset().await?;
                        Err(ChannelError::InterruptFailed)
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn interrupt(&mut self) -> Result<(), ChannelError> {
        let pids = Self::sandbox_pids(&self.container_name, &self.parent_pids).await?;
        for (pid, comm) in pids {
            debug!(pid = %pid, comm = %comm, "killing runaway container process");
            let _ = docker_output(&["exec", &self.container_name, "kill", "-9", &pid]).await;
        }
        let container = self.container_name.clone();
        let parents = self.parent_pids.clone();
        if let Some(io) = self.io.as_mut() {
            let _ = read_until_idle(
                io,
                || Self::busy_probe(container.clone(), parents.clone()),
                Duration::from_secs(20),
            )
            .await;
        }
        let (output, _) = self
            .raw_send("echo 'interrupted'", Duration::from_secs(5))
            .await
            .map_err(|_| ChannelError::InterruptFailed)?;
        if !output.trim_end().ends_with("interrupted") {
            return Err(ChannelError::InterruptFailed);
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), ChannelError> {
        if let Some(mut io) = self.io.take() {
            let _ = io.child.kill().await;
        }
        if !self.persistent {
            let _ = docker_output(&["rm", "-f", &self.container_name]).await;
        }
        self.start_shell().await?;
        self.init_scripts().await?;
        let files = self.registered.clone();
        self.registered.clear();
        self.install_commands(&files).await
    }

    async fn install_commands(&mut self, files: &[CommandFile]) -> Result<(), ChannelError> {
        if files.is_empty() {
            return Ok(());
        }
        // Ship all files in one in-memory tar stream: `docker cp -` extracts
        // it into /root/commands without touching the host filesystem.
        let archive = build_tar(files).map_err(ChannelError::Other)?;
        let destination = format!("{}:/root/commands", self.container_name);
        let mut cp = Command::new("docker")
            .args(["cp", "-", destination.as_str()])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = cp.stdin.take() {
            stdin.write_all(&archive).await?;
            drop(stdin);
        }
        let status = cp.wait().await?;
        if !status.success() {
            return Err(ChannelError::Crashed("docker cp of commands failed".into()));
        }

        for file in files {
            match file.kind {
                CommandKind::SourceFile => {
                    self.checked(
                        &format!("source /root/commands/{}", file.name),
                        "failed to source command file",
                    )
                    .await?;
                }
                CommandKind::Script => {
                    self.checked(
                        &format!("chmod +x /root/commands/{}", file.name),
                        "failed to chmod command script",
                    )
                    .await?;
                }
                CommandKind::Utility => {}
            }
        }
        self.registered.extend(files.iter().cloned());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(mut io) = self.io.take() {
            let _ = io.child.kill().await;
        }
        if self.persistent {
            let _ = docker_output(&["pause", &self.container_name]).await;
            info!(container = %self.container_name, "container paused");
        } else {
            let _ = docker_output(&["rm", "-f", &self.container_name]).await;
            info!(container = %self.container_name, "container removed");
        }
        Ok(())
    }
}

async fn docker_output(args: &[&str]) -> Result<String, ChannelError> {
    let output = Command::new("docker").args(args).output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn docker_checked(args: &[&str]) -> Result<(), ChannelError> {
    let output = Command::new("docker").args(args).output().await?;
    if !output.status.success() {
        return Err(ChannelError::Crashed(format!(
            "docker {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Build a tar archive of the command files, paths relative to the
/// extraction directory.
fn build_tar(files: &[CommandFile]) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let data = file.contents.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &file.name, data)
            .with_context(|| format!("adding {} to command archive", file.name))?;
    }
    builder.into_inner().context("finishing command archive")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_archive_contains_all_files() {
        let files = vec![
            CommandFile {
                name: "defaults.sh".into(),
                contents: "state() {\n    echo ok\n}\n".into(),
                kind: CommandKind::SourceFile,
            },
            CommandFile {
                name: "edit_linting".into(),
                contents: "#!/usr/bin/env python3\nprint('x')\n".into(),
                kind: CommandKind::Script,
            },
        ];
        let bytes = build_tar(&files).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["defaults.sh", "edit_linting"]);
    }

    #[test]
    fn tar_round_trips_contents() {
        use std::io::Read;
        let files = vec![CommandFile {
            name: "f.sh".into(),
            contents: "hello\n".into(),
            kind: CommandKind::SourceFile,
        }];
        let bytes = build_tar(&files).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello\n");
    }
}
