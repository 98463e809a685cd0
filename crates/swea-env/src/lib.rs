// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! The sandbox side of the agent: an interactive shell inside an isolated
//! container (or a host session for tests), workspace lifecycle management,
//! and the post-submission pull-request protocol.

mod channel;
mod docker;
mod local;
pub mod pr;
mod workspace;

pub use channel::{ChannelError, CommandChannel, DEFAULT_TIMEOUT, LONG_TIMEOUT};
pub use docker::DockerChannel;
pub use local::LocalChannel;
pub use workspace::{WorkspaceError, WorkspaceManager};

use swea_config::{SandboxConfig, SandboxKind};

/// Start the channel selected by the sandbox configuration.
///
/// The local kind runs in the current directory unless the caller gives it a
/// root; production tasks use docker.
pub async fn start_channel(
    config: &SandboxConfig,
) -> Result<Box<dyn CommandChannel>, ChannelError> {
    match config.kind {
        SandboxKind::Docker => Ok(Box::new(DockerChannel::start(config).await?)),
        SandboxKind::Local => {
            let cwd = std::env::current_dir().map_err(ChannelError::Io)?;
            Ok(Box::new(LocalChannel::start(cwd).await?))
        }
    }
}
