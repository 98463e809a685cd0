// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for enabled-by-default
/// fields.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub pull_request: PullRequestConfig,
}

// ─── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model name.  Selects the backend by prefix: `claude*` → anthropic,
    /// `gpt*` / `azure:gpt*` → openai, `ollama:<model>` → ollama, plus the
    /// special names `human`, `human_thought`, `replay` and `mock`.
    pub name: String,
    /// Sampling temperature forwarded to the backend.
    pub temperature: f32,
    /// Nucleus sampling parameter forwarded to the backend.
    pub top_p: f32,
    /// Abort the instance once its accumulated cost reaches this limit (USD).
    /// `0.0` disables the per-instance check.
    pub per_instance_cost_limit: f64,
    /// Abort the whole run once total cost reaches this limit (USD).
    /// `0.0` disables the total check.
    pub total_cost_limit: f64,
    /// Environment variable holding the API key.  When unset, the backend's
    /// canonical variable is used (ANTHROPIC_API_KEY, OPENAI_API_KEY, …).
    pub api_key_env: Option<String>,
    /// Base URL override for self-hosted or proxied endpoints.
    pub base_url: Option<String>,
    /// Trajectory file (or directory of trajectories) consumed by the
    /// `replay` backend.
    pub replay_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-4".into(),
            temperature: 0.0,
            top_p: 0.95,
            per_instance_cost_limit: 2.0,
            total_cost_limit: 0.0,
            api_key_env: None,
            base_url: None,
            replay_path: None,
        }
    }
}

// ─── Agent ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// System message template.  Placeholders: `{command_docs}`, `{window}`,
    /// `{overlap}`.
    pub system_template: String,
    /// First user message of an instance.  Placeholders include the task
    /// fields (`{problem_statement}`, `{instance_id}`, …) plus
    /// `{working_dir}`.
    pub instance_template: String,
    /// Subsequent user messages when the previous observation was non-empty.
    pub next_step_template: String,
    /// Subsequent user messages when the previous observation was empty.
    pub next_step_no_output_template: String,
    /// Optional strategy hint appended after the instance message.
    #[serde(default)]
    pub strategy_template: Option<String>,
    /// Template rendering a whole demonstration into one user message.
    /// Required unless `put_demos_in_history` is set.
    #[serde(default)]
    pub demonstration_template: Option<String>,
    /// Corrective message sent on a malformed reply (never stored in history).
    pub format_error_template: String,
    /// Corrective message sent on a blocked command; `{name}` is the command.
    pub blocklist_error_template: String,

    /// Prior trajectories spliced into the initial history as examples.
    #[serde(default)]
    pub demonstrations: Vec<PathBuf>,
    /// Splice demonstrations as role-tagged messages instead of rendering
    /// them through `demonstration_template`.
    #[serde(default)]
    pub put_demos_in_history: bool,

    /// Command catalogue files (shell function files and shebang scripts).
    #[serde(default)]
    pub command_files: Vec<PathBuf>,

    /// Environment variables exported into the sandbox at reset and kept in
    /// sync with the editor state after every action.
    #[serde(default = "default_env_variables")]
    pub env_variables: BTreeMap<String, String>,

    /// Editor viewport height in lines.
    pub window: usize,
    /// Lines of overlap kept when scrolling.
    pub overlap: usize,

    /// Commands rejected when they appear as the first word of an action.
    pub blocklist: Vec<String>,
    /// Commands rejected only when the action equals them exactly.
    pub blocklist_standalone: Vec<String>,

    /// Reply parser selected by name: `thought_action`, `xml_thought_action`,
    /// `json` or `identity`.
    pub parse_function: String,
    /// History post-processing applied before each query.
    #[serde(default)]
    pub history_processor: HistoryProcessorConfig,

    /// Name of the in-sandbox function that reports `{"working_dir": …}`.
    pub state_command: String,
    /// Name of the in-sandbox function that emits the submission sentinel.
    pub submit_command: String,

    /// Sub-agent subroutines callable from the action stream.
    #[serde(default)]
    pub subroutines: Vec<SubroutineConfig>,
}

fn default_env_variables() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("CURRENT_FILE".into(), "".into()),
        ("CURRENT_LINE".into(), "0".into()),
        ("OVERLAP".into(), "2".into()),
        ("SEARCH_FILES".into(), "()".into()),
        ("SEARCH_INDEX".into(), "0".into()),
        ("SEARCH_RESULTS".into(), "()".into()),
        ("WINDOW".into(), "100".into()),
    ])
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_template: DEFAULT_SYSTEM_TEMPLATE.into(),
            instance_template: DEFAULT_INSTANCE_TEMPLATE.into(),
            next_step_template: DEFAULT_NEXT_STEP_TEMPLATE.into(),
            next_step_no_output_template: DEFAULT_NEXT_STEP_NO_OUTPUT_TEMPLATE.into(),
            strategy_template: None,
            demonstration_template: Some(DEFAULT_DEMONSTRATION_TEMPLATE.into()),
            format_error_template: DEFAULT_FORMAT_ERROR_TEMPLATE.into(),
            blocklist_error_template: DEFAULT_BLOCKLIST_ERROR_TEMPLATE.into(),
            demonstrations: Vec::new(),
            put_demos_in_history: false,
            command_files: Vec::new(),
            env_variables: default_env_variables(),
            window: 100,
            overlap: 2,
            blocklist: ["vim", "vi", "emacs", "nano", "nohup", "git"]
                .map(String::from)
                .to_vec(),
            blocklist_standalone: [
                "python",
                "python3",
                "ipython",
                "bash",
                "sh",
                "exit",
                "/bin/bash",
                "/bin/sh",
                "nohup",
                "vi",
                "vim",
                "emacs",
                "nano",
            ]
            .map(String::from)
            .to_vec(),
            parse_function: "thought_action".into(),
            history_processor: HistoryProcessorConfig::default(),
            state_command: "state".into(),
            submit_command: "submit".into(),
            subroutines: Vec::new(),
        }
    }
}

const DEFAULT_SYSTEM_TEMPLATE: &str = "\
SETTING: You are an autonomous programmer, and you're working directly in the command line with a special interface.

The special interface consists of a file editor that shows you {window} lines of a file at a time.
In addition to typical bash commands, you can also use the following commands to help you navigate and edit files.

COMMANDS:
{command_docs}

Please note that THE EDIT COMMAND REQUIRES PROPER INDENTATION.

RESPONSE FORMAT:
Your shell prompt is formatted as follows:
(Open file: <path>) <cwd> $

You need to format your output using two fields; discussion and command.
Everything you include in the DISCUSSION section will be saved for future reference.
Then, for the command, remember that you should only include a SINGLE command inside of triple backticks.
You're working directly in the command line, so interactive session commands (e.g. python, vim) are NOT allowed — they will be blocked.";

const DEFAULT_INSTANCE_TEMPLATE: &str = "\
We're currently solving the following issue within our repository. Here's the issue text:
ISSUE:
{problem_statement}

INSTRUCTIONS:
Now, you're going to solve this issue on your own. Edit the necessary files, then run any tests you need to, to verify the fix.
When you're satisfied with all of the changes you've made, you can submit your changes to the code base by running the submit command.
Note however that you cannot use any interactive session commands (e.g. python, vim) in this environment.

(Open file: {open_file})
(Current directory: {working_dir})
bash-$";

const DEFAULT_NEXT_STEP_TEMPLATE: &str = "\
{observation}
(Open file: {open_file})
(Current directory: {working_dir})
bash-$";

const DEFAULT_NEXT_STEP_NO_OUTPUT_TEMPLATE: &str = "\
Your command ran successfully and did not produce any output.
(Open file: {open_file})
(Current directory: {working_dir})
bash-$";

const DEFAULT_DEMONSTRATION_TEMPLATE: &str = "\
Here is a demonstration of how to correctly accomplish a similar task.
It is included to show you how to correctly use the interface.
You do not need to follow exactly what is done in the demonstration.
--- DEMONSTRATION ---
{demonstration}
--- END OF DEMONSTRATION ---";

const DEFAULT_FORMAT_ERROR_TEMPLATE: &str = "\
Your output was not formatted correctly. You must always include one discussion and one command as part of your response. Make sure you do not have multiple discussion/command tags.
Please make sure your output precisely matches the following format:
DISCUSSION
Discuss here with yourself about what your planning and what you're going to do in this step.

```
command(s) that you're going to run
```";

const DEFAULT_BLOCKLIST_ERROR_TEMPLATE: &str = "\
Interactive operation '{name}' is not supported by this environment.";

// ─── History processors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryProcessorConfig {
    /// `default`, `last_n` or `closed_window`.
    pub name: String,
    /// Number of recent observations kept verbatim (`last_n` only).
    #[serde(default)]
    pub n: Option<usize>,
}

impl Default for HistoryProcessorConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            n: None,
        }
    }
}

// ─── Subroutines ──────────────────────────────────────────────────────────────

/// What a subroutine call evaluates to in the parent's action stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubroutineReturnType {
    Action,
    Observation,
    Response,
    State,
    Thought,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubroutineConfig {
    /// Name the model invokes at the head of an action.
    pub name: String,
    /// Signature shown in the command docs.
    pub signature: String,
    /// Docstring shown in the command docs.
    #[serde(default)]
    pub docstring: Option<String>,
    /// Heredoc terminator for multi-line invocations.
    #[serde(default)]
    pub end_name: Option<String>,
    /// Command executed before the sub-agent starts; its output becomes the
    /// sub-agent's first observation.
    #[serde(default)]
    pub init_observation: Option<String>,
    pub return_type: SubroutineReturnType,
    /// Agent configuration for the sub-agent.  `None` inherits the caller's.
    #[serde(default)]
    pub agent_file: Option<PathBuf>,
}

// ─── Sandbox ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Interactive shell inside a docker container (the production setting).
    #[default]
    Docker,
    /// Interactive shell on the host, in its own process group.  Used by the
    /// test suite and for fully local experimentation.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub kind: SandboxKind,
    /// Container image to run.
    pub image: String,
    /// Reuse (and pause on exit) a named container instead of a throwaway one.
    #[serde(default)]
    pub container_name: Option<String>,
    /// Per-command timeout (seconds).
    pub timeout_secs: u64,
    /// Timeout for setup-class commands: clone, dependency install (seconds).
    pub long_timeout_secs: u64,
    /// Build the task's interpreter environment during workspace reset.
    #[serde(default = "default_true")]
    pub install_environment: bool,
    /// Clone from the canonical remote instead of the read-through mirror.
    #[serde(default)]
    pub no_mirror: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Docker,
            image: "sweagent/swe-agent:latest".into(),
            container_name: None,
            timeout_secs: 25,
            long_timeout_secs: 500,
            install_environment: true,
            no_mirror: false,
        }
    }
}

/// Declarative recipe for a task's runtime environment.
///
/// Carried by the dataset record when the task needs more than the base
/// image; mirrors the interpreter-version + dependency-manifest shape of the
/// SWE-bench install maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentRecipe {
    /// Interpreter version, e.g. `"3.9"`.
    #[serde(default)]
    pub python: Option<String>,
    /// Inline package list passed to the environment creation command.
    #[serde(default)]
    pub packages: Option<String>,
    /// Requirements manifest written into the sandbox and pip-installed.
    #[serde(default)]
    pub requirements: Option<String>,
    /// Extra pip packages installed after environment creation.
    #[serde(default)]
    pub pip_packages: Vec<String>,
    #[serde(default)]
    pub pre_install: Vec<String>,
    #[serde(default)]
    pub install: Option<String>,
    #[serde(default)]
    pub post_install: Vec<String>,
}

// ─── Pull requests ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullRequestConfig {
    /// Open a draft PR after a successful submission.
    #[serde(default)]
    pub open_pr: bool,
    /// Skip PR creation when commits already reference the issue.
    #[serde(default = "default_true")]
    pub skip_if_commits_reference_issue: bool,
    /// Push to this fork instead of `origin` (`owner/repo` URL).
    #[serde(default)]
    pub push_gh_repo_url: Option<String>,
}

impl Default for PullRequestConfig {
    fn default() -> Self {
        Self {
            open_pr: false,
            skip_if_commits_reference_issue: true,
            push_gh_repo_url: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agent_config_has_editor_env_contract() {
        let cfg = AgentConfig::default();
        for var in [
            "CURRENT_FILE",
            "CURRENT_LINE",
            "WINDOW",
            "OVERLAP",
            "SEARCH_RESULTS",
            "SEARCH_FILES",
            "SEARCH_INDEX",
        ] {
            assert!(cfg.env_variables.contains_key(var), "missing {var}");
        }
    }

    #[test]
    fn default_overlap_is_smaller_than_window() {
        let cfg = AgentConfig::default();
        assert!(cfg.overlap < cfg.window);
    }

    #[test]
    fn default_blocklist_contains_interactive_editors() {
        let cfg = AgentConfig::default();
        assert!(cfg.blocklist.iter().any(|b| b == "vim"));
        assert!(cfg.blocklist_standalone.iter().any(|b| b == "python"));
    }

    #[test]
    fn blocklist_standalone_does_not_leak_into_blocklist() {
        let cfg = AgentConfig::default();
        assert!(!cfg.blocklist.iter().any(|b| b == "python"));
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.agent.window, cfg.agent.window);
        assert_eq!(back.model.name, cfg.model.name);
    }

    #[test]
    fn sandbox_defaults_match_timeout_policy() {
        let sb = SandboxConfig::default();
        assert_eq!(sb.timeout_secs, 25);
        assert_eq!(sb.long_timeout_secs, 500);
    }

    #[test]
    fn subroutine_return_type_deserializes_snake_case() {
        let rt: SubroutineReturnType = serde_yaml::from_str("observation").unwrap();
        assert_eq!(rt, SubroutineReturnType::Observation);
    }
}
