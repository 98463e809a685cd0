// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_recursion::async_recursion;
use tracing::{debug, info, warn};

use swea_config::{AgentConfig, SubroutineReturnType, TaskRecord};
use std::time::Duration;

use swea_env::{ChannelError, CommandChannel, DEFAULT_TIMEOUT};
use swea_model::{Message, ModelError, ModelProvider, Role, StatsLedger};

use crate::editor::EditorState;
use crate::history::{format_template, load_demonstrations, HistoryProcessor};
use crate::parsing::ReplyParser;
use crate::registry::CommandRegistry;
use crate::splitter::{
    extract_submission, rewrite_heredoc, should_block, ActionSplitter, EnvelopeKind,
};
use crate::trajectory::{save_trajectory, RunInfo, TrajectoryStep};

/// Commands resolved against the editor state instead of the shell.
const EDITOR_COMMANDS: &[&str] = &[
    "open_file",
    "goto_line",
    "scroll_up",
    "scroll_down",
    "create_file",
    "edit_linting",
    "find_file",
    "search_file",
    "search_dir",
    "ls",
    "cd",
];

/// Combined cap on format and blocklist correction attempts per turn.
const MAX_FORMAT_FAILS: u32 = 2;

/// Bound on nested subroutine calls.
const MAX_SUBROUTINE_DEPTH: usize = 3;

/// Terminal states of the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Submitted,
    Skipped,
    ExitContext,
    ExitCost,
    ExitApi,
    ExitError,
    ExitFormat,
    EarlyExit,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::Submitted => "submitted",
            Terminal::Skipped => "skipped",
            Terminal::ExitContext => "exit_context",
            Terminal::ExitCost => "exit_cost",
            Terminal::ExitApi => "exit_api",
            Terminal::ExitError => "exit_error",
            Terminal::ExitFormat => "exit_format",
            Terminal::EarlyExit => "early_exit",
        }
    }

    /// Terminals that still warrant a salvage submit before giving up.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Terminal::ExitContext
                | Terminal::ExitCost
                | Terminal::ExitApi
                | Terminal::ExitError
                | Terminal::ExitFormat
        )
    }
}

/// Outcome of one model turn, before dispatch.
///
/// Exceptional conditions are explicit variants, not control-flow
/// exceptions: either the model produced a dispatchable action, or the turn
/// resolved to a terminal.
enum ModelTurn {
    Reply {
        thought: String,
        action: String,
        output: String,
    },
    Exit {
        terminal: Terminal,
        thought: String,
        output: String,
    },
}

/// What a completed run hands back to the caller.
#[derive(Debug)]
pub struct RunResult {
    pub info: RunInfo,
    pub trajectory: Vec<TrajectoryStep>,
    pub history: Vec<Message>,
}

/// The turn-based state machine coupling the model, the sandbox channel, the
/// editor state and the cost governor.
pub struct Agent {
    pub name: String,
    config: Arc<AgentConfig>,
    registry: Arc<CommandRegistry>,
    splitter: ActionSplitter,
    parser: ReplyParser,
    processor: HistoryProcessor,
    model: Arc<dyn ModelProvider>,
    ledger: Arc<StatsLedger>,
    pub editor: EditorState,
    history: Vec<Message>,
    depth: usize,
    /// Per-command sandbox timeout (the setup-class long timeout lives with
    /// the workspace manager, not here).
    command_timeout: Duration,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        config: Arc<AgentConfig>,
        registry: Arc<CommandRegistry>,
        model: Arc<dyn ModelProvider>,
        ledger: Arc<StatsLedger>,
    ) -> anyhow::Result<Self> {
        let parser = ReplyParser::by_name(&config.parse_function)?;
        let processor = HistoryProcessor::from_config(&config.history_processor)?;
        let splitter = ActionSplitter::new(&registry);
        let editor = EditorState::new("/", config.window, config.overlap);
        Ok(Self {
            name: name.into(),
            config,
            registry,
            splitter,
            parser,
            processor,
            model,
            ledger,
            editor,
            history: Vec::new(),
            depth: 0,
            command_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-command sandbox timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Reset the agent for a new instance: system message plus any
    /// demonstrations.
    fn setup(&mut self, task: &TaskRecord) -> anyhow::Result<()> {
        self.history.clear();
        let vars = self.template_vars(task, "", "");
        let system = format_template(&self.config.system_template, &vars);
        debug!(agent = %self.name, "SYSTEM\n{system}");
        self.history.push(Message::system(system, &self.name));
        let demos = load_demonstrations(&self.config, &self.name)?;
        self.history.extend(demos);
        Ok(())
    }

    /// Run the task to a terminal state.
    pub async fn run(
        &mut self,
        channel: &mut dyn CommandChannel,
        task: &TaskRecord,
        traj_dir: Option<&Path>,
        environment: &str,
        initial_observation: Option<String>,
    ) -> anyhow::Result<RunResult> {
        self.setup(task)?;
        let lint_command = self.editor.lint_command.clone();
        self.editor = EditorState::new("/", self.config.window, self.config.overlap);
        self.editor.lint_command = lint_command;
        self.sync_working_directory(channel).await;

        let mut trajectory: Vec<TrajectoryStep> = Vec::new();
        let mut info = RunInfo::default();
        let mut observation = initial_observation.unwrap_or_default();

        loop {
            // 1. Probe the sandbox state.  Failure is fatal for the turn.
            let state = match self.probe_state(channel).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "state probe failed");
                    self.finish_exhausted(channel, Terminal::ExitError, &mut info).await;
                    break;
                }
            };
            self.sync_working_directory(channel).await;

            // 2–4. Prompt, query, parse (with in-place correction retries).
            let turn = self.model_turn(&observation, &state, task).await;

            let (thought, action, output, terminal) = match turn {
                ModelTurn::Reply {
                    thought,
                    action,
                    output,
                } => (thought, action, output, None),
                ModelTurn::Exit {
                    terminal,
                    thought,
                    output,
                } => (thought, terminal.as_str().to_string(), output, Some(terminal)),
            };

            self.history.push(Message::assistant(
                output.clone(),
                &self.name,
                thought.clone(),
                action.clone(),
            ));
            info!(agent = %self.name, "THOUGHT\n{thought}");
            info!(agent = %self.name, "ACTION\n{action}");

            let mut done = terminal;
            observation = match done {
                Some(terminal) => {
                    self.finish_exhausted(channel, terminal, &mut info).await;
                    String::new()
                }
                None if action.trim() == "skip" => {
                    done = Some(Terminal::Skipped);
                    info.exit_status = Some(Terminal::Skipped.as_str().into());
                    "Skipped".to_string()
                }
                None => {
                    // 5. Dispatch the action's envelopes.
                    let (obs, submission, early_exit) =
                        self.dispatch(channel, task, &action).await;
                    if let Some(submission) = submission {
                        done = Some(Terminal::Submitted);
                        info.exit_status = Some(Terminal::Submitted.as_str().into());
                        info.submission = Some(submission);
                    } else if early_exit {
                        done = Some(Terminal::EarlyExit);
                        info.exit_status = Some(Terminal::EarlyExit.as_str().into());
                    }
                    obs
                }
            };

            // 7. Record the step and flush the trajectory.
            trajectory.push(TrajectoryStep {
                action,
                observation: observation.clone(),
                response: output,
                state: state.clone(),
                thought,
            });
            info.model_stats = self.ledger.snapshot();
            if let Some(dir) = traj_dir {
                save_trajectory(
                    dir,
                    &task.instance_id,
                    environment,
                    &trajectory,
                    &self.history,
                    &info,
                )?;
            }

            if done.is_some() {
                break;
            }
        }

        info.model_stats = self.ledger.snapshot();
        if let Some(dir) = traj_dir {
            save_trajectory(
                dir,
                &task.instance_id,
                environment,
                &trajectory,
                &self.history,
                &info,
            )?;
        }
        Ok(RunResult {
            info,
            trajectory,
            history: self.history.clone(),
        })
    }

    /// 6. Exhaustion terminals get one salvage submit; a recovered non-empty
    /// diff rewrites the exit status to `submitted (<terminal>)`.
    async fn finish_exhausted(
        &mut self,
        channel: &mut dyn CommandChannel,
        terminal: Terminal,
        info: &mut RunInfo,
    ) {
        if terminal.is_exhaustion() {
            if let Some(submission) = self.salvage_submit(channel).await {
                info!(terminal = terminal.as_str(), "salvaged a submission");
                info.exit_status = Some(format!("submitted ({})", terminal.as_str()));
                info.submission = Some(submission);
                return;
            }
        }
        info.exit_status = Some(terminal.as_str().into());
    }

    async fn salvage_submit(&mut self, channel: &mut dyn CommandChannel) -> Option<String> {
        let submit = self.registry.submit_command().to_string();
        match channel.send(&submit, self.command_timeout).await {
            Ok((output, _)) => extract_submission(&output)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            Err(e) => {
                warn!(error = %e, "salvage submit failed");
                None
            }
        }
    }

    // ── Probe ─────────────────────────────────────────────────────────────────

    /// Run the `state` command and validate its contract: a single JSON
    /// object with a `working_dir` string.
    async fn probe_state(
        &mut self,
        channel: &mut dyn CommandChannel,
    ) -> anyhow::Result<String> {
        let (output, code) = channel
            .send(&self.config.state_command, self.command_timeout)
            .await?;
        if code != 0 {
            anyhow::bail!("state command failed with exit code {code}: {output}");
        }
        let trimmed = output.trim();
        let parsed: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| anyhow::anyhow!("state command produced invalid JSON ({e}): {trimmed}"))?;
        if !parsed["working_dir"].is_string() {
            anyhow::bail!("state output is missing working_dir: {trimmed}");
        }
        Ok(trimmed.to_string())
    }

    /// Keep the editor's notion of the working directory aligned with the
    /// shell (a raw `cd` in a shell action would otherwise desync them).
    async fn sync_working_directory(&mut self, channel: &mut dyn CommandChannel) {
        if let Ok((output, 0)) = channel.send("pwd -P", self.command_timeout).await {
            if let Some(cwd) = output.lines().rev().find(|l| l.starts_with('/')) {
                self.editor.current_directory = PathBuf::from(cwd.trim());
            }
        }
    }

    // ── Prompt + query + parse ────────────────────────────────────────────────

    fn template_vars(
        &self,
        task: &TaskRecord,
        state_json: &str,
        observation: &str,
    ) -> HashMap<String, String> {
        let working_dir = serde_json::from_str::<serde_json::Value>(state_json)
            .ok()
            .and_then(|v| v["working_dir"].as_str().map(str::to_string))
            .unwrap_or_default();
        let open_file = self
            .editor
            .absolute_file()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "n/a".to_string());
        HashMap::from([
            ("command_docs".into(), self.registry.command_docs()),
            ("window".into(), self.config.window.to_string()),
            ("overlap".into(), self.config.overlap.to_string()),
            ("instance_id".into(), task.instance_id.clone()),
            ("repo".into(), task.repo.clone()),
            ("base_commit".into(), task.base_commit.clone()),
            ("problem_statement".into(), task.problem_statement.clone()),
            ("working_dir".into(), working_dir),
            ("open_file".into(), open_file),
            ("observation".into(), observation.to_string()),
        ])
    }

    /// The history slice this agent's model actually sees.
    fn overall_history(&self) -> Vec<Message> {
        let own: Vec<Message> = self
            .history
            .iter()
            .filter(|m| m.agent == self.name)
            .cloned()
            .collect();
        self.processor.process(&own)
    }

    /// 2–4: append the templated user message, query the model, and parse
    /// with bounded in-place correction.
    async fn model_turn(
        &mut self,
        observation: &str,
        state: &str,
        task: &TaskRecord,
    ) -> ModelTurn {
        let vars = self.template_vars(task, state, observation);
        let last = self.history.last();
        let templates: Vec<&str> =
            if last.map(|m| m.role == Role::System || m.is_demo).unwrap_or(true) {
                let mut selected = vec![self.config.instance_template.as_str()];
                if let Some(strategy) = &self.config.strategy_template {
                    selected.push(strategy);
                }
                selected
            } else if observation.trim().is_empty() {
                vec![self.config.next_step_no_output_template.as_str()]
            } else {
                vec![self.config.next_step_template.as_str()]
            };
        let message = templates
            .iter()
            .map(|t| format_template(t, &vars))
            .collect::<Vec<_>>()
            .join("\n");
        self.history.push(Message::user(message, &self.name));

        let mut output = match self.model.query(&self.overall_history()).await {
            Ok(output) => output,
            Err(e) => return self.exit_for(e),
        };

        // Human backends bypass the parser: the input is the action.
        if self.model.name() == "human" {
            return ModelTurn::Reply {
                thought: String::new(),
                action: output.clone(),
                output,
            };
        }
        if self.model.name() == "human_thought" {
            return match ReplyParser::ThoughtAction.parse(&output, &self.registry) {
                Ok((thought, action)) => ModelTurn::Reply {
                    thought,
                    action,
                    output,
                },
                Err(_) => ModelTurn::Reply {
                    thought: String::new(),
                    action: output.clone(),
                    output,
                },
            };
        }

        // Parse-or-retry: corrective requeries never touch the persistent
        // history; the cap covers format and blocklist failures combined.
        let mut fails = 0u32;
        loop {
            let correction = match self.parser.parse(&output, &self.registry) {
                Ok((thought, action)) => {
                    if !should_block(
                        &action,
                        &self.config.blocklist,
                        &self.config.blocklist_standalone,
                    ) {
                        return ModelTurn::Reply {
                            thought,
                            action,
                            output,
                        };
                    }
                    let name = action
                        .trim()
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_string();
                    warn!(command = %name, "blocked command");
                    let vars = HashMap::from([("name".to_string(), name)]);
                    format_template(&self.config.blocklist_error_template, &vars)
                }
                Err(e) => {
                    warn!(error = %e, "malformed model output");
                    self.config.format_error_template.clone()
                }
            };

            fails += 1;
            if fails >= MAX_FORMAT_FAILS {
                warn!("malformat limit reached");
                return ModelTurn::Exit {
                    terminal: Terminal::ExitFormat,
                    thought: "Exit due to format error".into(),
                    output,
                };
            }

            let mut temp_history = self.overall_history();
            temp_history.push(Message::assistant(output.clone(), &self.name, "", ""));
            temp_history.push(Message::user(correction, &self.name));
            output = match self.model.query(&temp_history).await {
                Ok(output) => output,
                Err(e) => return self.exit_for(e),
            };
        }
    }

    /// 3. Map model-client errors onto the loop's terminals.
    fn exit_for(&self, error: ModelError) -> ModelTurn {
        let (terminal, text) = match error {
            ModelError::ContextWindowExceeded => {
                (Terminal::ExitContext, "Exit due to context window".to_string())
            }
            ModelError::CostLimitExceeded => {
                (Terminal::ExitCost, "Exit due to cost limit".to_string())
            }
            ModelError::RetriesExhausted(msg) => {
                (Terminal::ExitApi, format!("Exit due to retry error: {msg}"))
            }
            ModelError::Api(msg) => {
                (Terminal::ExitApi, format!("Exit due to retry error: {msg}"))
            }
            ModelError::Other(e) => {
                (Terminal::ExitError, format!("Exit due to runtime error: {e}"))
            }
        };
        warn!(terminal = terminal.as_str(), "{text}");
        ModelTurn::Exit {
            terminal,
            thought: text.clone(),
            output: text,
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// 5. Split the action and execute each envelope in order.
    /// Returns `(observation, submission, early_exit)`.
    async fn dispatch(
        &mut self,
        channel: &mut dyn CommandChannel,
        task: &TaskRecord,
        action: &str,
    ) -> (String, Option<String>, bool) {
        let envelopes = self.splitter.split(action, &self.name);
        let mut parts: Vec<String> = Vec::new();
        let mut submission = None;
        let mut early_exit = false;

        for envelope in envelopes {
            let result = match &envelope.kind {
                EnvelopeKind::Subroutine(name) => {
                    self.call_subroutine(channel, task, name, &envelope.raw).await
                }
                EnvelopeKind::Command(name) if name == self.registry.submit_command() => {
                    channel
                        .send(&envelope.raw, self.command_timeout)
                        .await
                        .map(|(output, _)| output)
                }
                EnvelopeKind::Command(name) => {
                    match self.run_editor_command(channel, name, &envelope.raw).await {
                        Ok(Some(observation)) => Ok(observation),
                        Ok(None) => self.run_shell(channel, name, &envelope.raw).await,
                        Err(e) => Err(e),
                    }
                }
                EnvelopeKind::Shell => channel
                    .send(&envelope.raw, self.command_timeout)
                    .await
                    .map(|(output, _)| output),
            };

            match result {
                Ok(output) => {
                    if let Some(found) = extract_submission(&output) {
                        submission = Some(found.trim().to_string());
                        parts.push(output);
                        break;
                    }
                    parts.push(output);
                }
                Err(e) => {
                    // Interrupt failure, broken pipe, container crash: the
                    // channel has already reset itself where it could; the
                    // turn ends early.
                    warn!(error = %e, "sandbox failure during dispatch");
                    early_exit = true;
                    break;
                }
            }
        }

        let observation = parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        (observation, submission, early_exit)
    }

    /// A catalogue command destined for the shell; multi-line payloads are
    /// delivered as quoted heredocs.
    async fn run_shell(
        &mut self,
        channel: &mut dyn CommandChannel,
        name: &str,
        raw: &str,
    ) -> Result<String, ChannelError> {
        let command = match self.registry.end_marker(name) {
            Some(end) => rewrite_heredoc(raw, end),
            None => raw.to_string(),
        };
        channel
            .send(&command, self.command_timeout)
            .await
            .map(|(output, _)| output)
    }

    /// Resolve an editor command.  `Ok(None)` means the envelope is not an
    /// editor operation after all and should go to the shell.
    async fn run_editor_command(
        &mut self,
        channel: &mut dyn CommandChannel,
        name: &str,
        raw: &str,
    ) -> Result<Option<String>, ChannelError> {
        if !EDITOR_COMMANDS.contains(&name) {
            return Ok(None);
        }
        let payload = raw.strip_prefix(name).unwrap_or(raw);
        let (first_line, body) = match payload.split_once('\n') {
            Some((first, rest)) => (first.trim(), rest),
            None => (payload.trim(), ""),
        };
        let args = shell_words(first_line);
        let arg = |i: usize| args.get(i).map(String::as_str);

        let observation = match name {
            "open_file" => {
                let Some(path) = arg(0) else {
                    return Ok(Some("Usage: open_file <path> [<line_number>]".into()));
                };
                let line = arg(1).and_then(|l| l.parse().ok());
                self.editor.open_file(channel, path, line).await?
            }
            "goto_line" => match arg(0).and_then(|l| l.parse().ok()) {
                Some(line) => self.editor.goto_line(channel, line).await?,
                None => "Usage: goto_line <line>".into(),
            },
            "scroll_up" => self.editor.scroll(channel, false).await?,
            "scroll_down" => self.editor.scroll(channel, true).await?,
            "create_file" => match arg(0) {
                Some(path) => self.editor.create_file(channel, path).await?,
                None => "Usage: create_file <path>".into(),
            },
            "edit_linting" => {
                let Some((start, end)) = arg(0).and_then(|r| r.split_once(':')) else {
                    return Ok(Some(
                        "Usage: edit_linting <start_line>:<end_line>\n<replacement_text>\nend_of_edit"
                            .into(),
                    ));
                };
                let (start, end) = (start.to_string(), end.to_string());
                let marker = self.registry.end_marker(name).unwrap_or("end_of_edit").to_string();
                let body = strip_end_marker(body, &marker);
                self.editor.edit(channel, &start, &end, &body).await?
            }
            "find_file" => match arg(0) {
                Some(file_name) => {
                    self.editor.find_file(channel, file_name, arg(1)).await?
                }
                None => "Usage: find_file <file_name> [<dir>]".into(),
            },
            "search_file" => match arg(0) {
                Some(term) => self.editor.search_file(channel, term, arg(1)).await?,
                None => "Usage: search_file <search_term> [<file>]".into(),
            },
            "search_dir" => match arg(0) {
                Some(term) => self.editor.search_dir(channel, term, arg(1)).await?,
                None => "Usage: search_dir <search_term> [<dir>]".into(),
            },
            "ls" => {
                // Flagged invocations are plain shell, not the editor listing.
                if arg(0).map(|a| a.starts_with('-')).unwrap_or(false) {
                    return Ok(None);
                }
                self.editor.list_files(channel, arg(0)).await?
            }
            "cd" => match arg(0) {
                Some(path) => self.editor.change_directory(channel, path).await?,
                None => "Usage: cd <dir>".into(),
            },
            _ => return Ok(None),
        };

        self.editor.export_state(channel).await?;
        Ok(Some(observation))
    }

    // ── Subroutines ───────────────────────────────────────────────────────────

    /// Run a nested agent over the same channel and ledger.  The parent's
    /// working directory and exported editor state are restored afterwards,
    /// and the child's history is folded into the parent's record.
    #[async_recursion]
    async fn call_subroutine(
        &mut self,
        channel: &mut dyn CommandChannel,
        task: &TaskRecord,
        name: &str,
        raw: &str,
    ) -> Result<String, ChannelError> {
        if self.depth >= MAX_SUBROUTINE_DEPTH {
            return Ok(format!(
                "maximum subroutine depth ({MAX_SUBROUTINE_DEPTH}) reached"
            ));
        }
        let Some(subroutine) = self.registry.get_subroutine(name).cloned() else {
            return Ok(format!("unknown subroutine: {name}"));
        };
        let prompt = raw.strip_prefix(name).unwrap_or(raw).trim().to_string();
        info!(subroutine = %name, depth = self.depth + 1, "entering subroutine");

        // Snapshot the parent's working directory for the post-call restore.
        let saved_dir = match channel.send("pwd -P", self.command_timeout).await {
            Ok((output, 0)) => output.trim().to_string(),
            _ => String::new(),
        };

        let initial_observation = match &subroutine.init_observation {
            Some(template) => {
                let vars = HashMap::from([("args".to_string(), prompt.clone())]);
                let command = format_template(template, &vars);
                match channel.send(&command, self.command_timeout).await {
                    Ok((output, _)) => Some(output),
                    Err(e) => return Err(e),
                }
            }
            None => Some(prompt.clone()),
        };

        let child_config = match &subroutine.agent_file {
            Some(path) => match load_agent_config(path) {
                Ok(config) => Arc::new(config),
                Err(e) => return Ok(format!("failed to load subroutine config: {e}")),
            },
            None => Arc::clone(&self.config),
        };

        let mut child = match Agent::new(
            name,
            child_config,
            Arc::clone(&self.registry),
            Arc::clone(&self.model),
            Arc::clone(&self.ledger),
        ) {
            Ok(child) => child,
            Err(e) => return Ok(format!("failed to start subroutine: {e}")),
        };
        child.depth = self.depth + 1;
        child.command_timeout = self.command_timeout;

        let result = child
            .run(channel, task, None, "subroutine", initial_observation)
            .await;

        // Restore the parent's view regardless of how the child ended.
        if !saved_dir.is_empty() {
            let _ = channel
                .send(&format!("cd {}", crate::editor::sh_quote(&saved_dir)), self.command_timeout)
                .await;
        }
        let _ = self.editor.export_state(channel).await;

        match result {
            Ok(run) => {
                self.history.extend(
                    run.history
                        .iter()
                        .filter(|m| m.agent == name)
                        .cloned(),
                );
                let value = run
                    .trajectory
                    .last()
                    .map(|step| match subroutine.return_type {
                        SubroutineReturnType::Action => step.action.clone(),
                        SubroutineReturnType::Observation => step.observation.clone(),
                        SubroutineReturnType::Response => step.response.clone(),
                        SubroutineReturnType::State => step.state.clone(),
                        SubroutineReturnType::Thought => step.thought.clone(),
                    })
                    .unwrap_or_default();
                Ok(value)
            }
            Err(e) => Ok(format!("subroutine {name} failed: {e}")),
        }
    }
}

/// Load a standalone agent configuration for a subroutine.
fn load_agent_config(path: &Path) -> anyhow::Result<AgentConfig> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Strip the heredoc terminator line from a multi-line payload.
fn strip_end_marker(body: &str, marker: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let end = lines
        .iter()
        .rposition(|l| l.trim() == marker)
        .unwrap_or(lines.len());
    lines[..end].join("\n")
}

/// Minimal shell-style word splitting: whitespace separation with single and
/// double quote grouping (enough to undo the JSON parser's quoting).
fn shell_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut has_word = false;
    for c in s.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                has_word = true;
            }
            None if c.is_whitespace() => {
                if has_word || !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            None => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word || !current.is_empty() {
        words.push(current);
    }
    words
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
