// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use swea_config::{CommandFile, CommandKind};

use crate::channel::{
    communicate, parse_pid_table, read_until_idle, syntax_check_command, ChannelError,
    CommandChannel, ShellIo,
};

/// Interactive bash on the host, isolated in its own session.
///
/// Implements the same send/interrupt/reset protocol as the docker channel —
/// including process-table idle detection — against a shell started with
/// `setsid`, so every descendant is identifiable by its session id.  Used by
/// the test suite and the `local` sandbox kind.
pub struct LocalChannel {
    io: Option<ShellIo>,
    shell_pid: u32,
    /// Directory the shell starts in.
    root_dir: PathBuf,
    /// Where command files are installed (stands in for `/root/commands`).
    commands_dir: tempfile::TempDir,
    registered: Vec<CommandFile>,
}

impl LocalChannel {
    pub async fn start(root_dir: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        let commands_dir = tempfile::tempdir().map_err(ChannelError::Io)?;
        let (io, shell_pid) = Self::spawn_shell(&root_dir).await?;
        let mut channel = Self {
            io: Some(io),
            shell_pid,
            root_dir,
            commands_dir,
            registered: Vec::new(),
        };
        channel.init_shell().await?;
        Ok(channel)
    }

    async fn spawn_shell(root_dir: &Path) -> Result<(ShellIo, u32), ChannelError> {
        let mut cmd = Command::new("/bin/bash");
        cmd.current_dir(root_dir);
        // setsid() detaches the shell into its own session, so the idle probe
        // can find every descendant by session id, and interrupt() cannot
        // accidentally kill processes outside the sandbox.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        let io = ShellIo::spawn(cmd).await?;
        let shell_pid = io
            .child
            .id()
            .ok_or_else(|| ChannelError::Crashed("shell exited at startup".into()))?;
        debug!(shell_pid, "local sandbox shell started");
        Ok((io, shell_pid))
    }

    async fn init_shell(&mut self) -> Result<(), ChannelError> {
        let commands_path = self.commands_dir.path().display().to_string();
        self.checked(&format!("export PATH=\"$PATH:{commands_path}\""))
            .await?;
        Ok(())
    }

    /// Run one command, mapping a non-zero exit to a crashed-channel error.
    /// Setup-path helper, not the model-facing `send`.
    async fn checked(&mut self, command: &str) -> Result<String, ChannelError> {
        let (output, code) = self.send(command, Duration::from_secs(10)).await?;
        if code != 0 {
            return Err(ChannelError::Crashed(format!(
                "setup command {command:?} failed with {code}: {output}"
            )));
        }
        Ok(output)
    }

    fn io_mut(&mut self) -> Result<&mut ShellIo, ChannelError> {
        self.io.as_mut().ok_or(ChannelError::BrokenPipe)
    }

    /// List `(pid, comm)` of every process in the shell's session except the
    /// shell itself.
    async fn sandbox_pids(shell_pid: u32) -> Result<Vec<(String, String)>, ChannelError> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,sess=,comm="])
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let shell = shell_pid.to_string();
        let raw: String = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let pid = parts.next()?;
                let sess = parts.next()?;
                let comm = parts.next().unwrap_or("");
                (sess == shell).then(|| format!("{pid} {comm}\n"))
            })
            .collect();
        Ok(parse_pid_table(&raw, &[shell]))
    }

    async fn busy_probe(shell_pid: u32) -> Result<bool, ChannelError> {
        Ok(!Self::sandbox_pids(shell_pid).await?.is_empty())
    }

    async fn raw_send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, i32), ChannelError> {
        let shell_pid = self.shell_pid;
        let io = self.io_mut()?;
        communicate(io, || Self::busy_probe(shell_pid), command, timeout).await
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<(String, i32), ChannelError> {
        // Preflight: validate syntax without executing.  A failure comes back
        // as the command's output with its non-zero exit.
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
        for (pid, comm) in Self::sandbox_pids(self.shell_pid).await? {
            debug!(pid = %pid, comm = %comm, "killing runaway process");
            if let Ok(pid) = pid.parse::<i32>() {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
        // Exhaust whatever the killed processes left in the pipe.
        let shell_pid = self.shell_pid;
        if let Ok(io) = self.io_mut() {
            let _ = read_until_idle(io, || Self::busy_probe(shell_pid), Duration::from_secs(20))
                .await;
        }
        // Health check: the shell must still answer.
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
        self.close().await?;
        let (io, shell_pid) = Self::spawn_shell(&self.root_dir).await?;
        self.io = Some(io);
        self.shell_pid = shell_pid;
        self.init_shell().await?;
        let files = self.registered.clone();
        self.registered.clear();
        self.install_commands(&files).await
    }

    async fn install_commands(&mut self, files: &[CommandFile]) -> Result<(), ChannelError> {
        for file in files {
            let path = self.commands_dir.path().join(&file.name);
            std::fs::write(&path, &file.contents).map_err(ChannelError::Io)?;
            match file.kind {
                CommandKind::SourceFile => {
                    self.checked(&format!("source '{}'", path.display())).await?;
                }
                CommandKind::Script => {
                    self.checked(&format!("chmod +x '{}'", path.display())).await?;
                }
                CommandKind::Utility => {}
            }
        }
        self.registered.extend(files.iter().cloned());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if let Some(mut io) = self.io.take() {
            // Kill the whole session: negative pid addresses the process group
            // created by setsid.
            unsafe {
                libc::kill(-(self.shell_pid as i32), libc::SIGKILL);
            }
            let _ = io.child.kill().await;
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
