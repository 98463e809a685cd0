// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! End-to-end scenarios for the agent loop: a scripted model driving a real
//! local sandbox shell over a real git checkout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swea_config::{
    load_command_files, AgentConfig, CommandDescriptor, SubroutineConfig, SubroutineReturnType,
    TaskRecord,
};
use swea_env::{CommandChannel, LocalChannel};
use swea_model::mock::ScriptedProvider;
use swea_model::{ModelProvider, StatsLedger};

use crate::agent::Agent;
use crate::parsing::ReplyParser;
use crate::registry::CommandRegistry;
use crate::splitter::{ActionSplitter, EnvelopeKind};

const DEFAULTS_SH: &str = include_str!("../../../config/commands/defaults.sh");
const SEARCH_SH: &str = include_str!("../../../config/commands/search.sh");
const EDIT_LINTING_PY: &str = include_str!("../../../config/commands/edit_linting.py");

/// Stand-in lint with the same reject semantics as the flake8 error set.
const PYTHON_LINT: &str =
    "python3 -c 'import ast,sys; ast.parse(open(sys.argv[1]).read())' {file}";

struct Harness {
    _dir: tempfile::TempDir,
    channel: LocalChannel,
    descriptors: Vec<CommandDescriptor>,
    registry: Arc<CommandRegistry>,
    task: TaskRecord,
    repo: PathBuf,
}

/// Build a git checkout, install the real command catalogue into a local
/// sandbox shell, and park the shell in the repo root with `$ROOT` exported —
/// the state the workspace manager leaves a task in.
async fn harness(repo_files: &[(&str, &str)], extra_commands: &[(&str, &str)]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("octo__widgets");
    std::fs::create_dir(&repo).unwrap();
    for (name, content) in repo_files {
        std::fs::write(repo.join(name), content).unwrap();
    }
    let git = |args: &str| {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("cd {} && {args} >/dev/null 2>&1", repo.display()))
            .status()
            .unwrap();
        assert!(status.success(), "repo setup failed: {args}");
    };
    git("git init -q");
    git("git config user.email swea@test.invalid && git config user.name swea");
    git("git add -A && git commit -q --allow-empty -m init");

    let catalogue_dir = dir.path().join("catalogue");
    std::fs::create_dir(&catalogue_dir).unwrap();
    let mut entries: Vec<(&str, &str)> = vec![
        ("defaults.sh", DEFAULTS_SH),
        ("search.sh", SEARCH_SH),
        ("edit_linting.py", EDIT_LINTING_PY),
    ];
    entries.extend(extra_commands.iter().copied());
    let mut paths = Vec::new();
    for (name, content) in entries {
        let path = catalogue_dir.join(name);
        std::fs::write(&path, content).unwrap();
        paths.push(path);
    }
    let (descriptors, command_files) = load_command_files(&paths).unwrap();

    let mut channel = LocalChannel::start(dir.path()).await.unwrap();
    channel.install_commands(&command_files).await.unwrap();
    let (_, code) = channel
        .send(
            "cd octo__widgets && export ROOT=$(pwd -P)",
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(code, 0);

    let registry = Arc::new(CommandRegistry::new(descriptors.clone(), vec![], "submit"));
    let task = TaskRecord {
        instance_id: "octo__widgets-1".into(),
        repo: "octo/widgets".into(),
        base_commit: "HEAD".into(),
        problem_statement: "widgets are broken".into(),
        patch: None,
        test_patch: None,
        fail_to_pass: vec![],
        version: None,
        environment: None,
    };
    Harness {
        _dir: dir,
        channel,
        descriptors,
        registry,
        task,
        repo,
    }
}

fn test_agent_config() -> Arc<AgentConfig> {
    Arc::new(AgentConfig {
        window: 10,
        ..AgentConfig::default()
    })
}

fn agent_for(h: &Harness, model: Arc<dyn ModelProvider>, ledger: Arc<StatsLedger>) -> Agent {
    let mut agent = Agent::new(
        "primary",
        test_agent_config(),
        Arc::clone(&h.registry),
        model,
        ledger,
    )
    .unwrap();
    agent.editor.lint_command = PYTHON_LINT.into();
    agent
}

/// A well-formed model reply carrying one action.
fn reply(action: &str) -> String {
    format!("DISCUSSION\nproceeding with the next step.\n```\n{action}\n```")
}

// ─── S1: trivial submit ───────────────────────────────────────────────────────

#[tokio::test]
async fn trivial_submit_produces_empty_submission() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(vec![reply("submit")], ledger.clone()));
    let mut agent = agent_for(&h, model.clone(), ledger);

    let mut task = h.task.clone();
    task.problem_statement = String::new();
    let result = agent
        .run(&mut h.channel, &task, None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(result.info.exit_status.as_deref(), Some("submitted"));
    assert_eq!(result.info.submission.as_deref(), Some(""));
    assert_eq!(result.trajectory.len(), 1);
    assert_eq!(result.history.len(), 3, "system, user, assistant");
    h.channel.close().await.unwrap();
}

// ─── S2: edit then submit ─────────────────────────────────────────────────────

#[tokio::test]
async fn edit_then_submit_yields_a_diff() {
    let mut h = harness(&[("x.py", "print(1\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![
            reply("open_file x.py"),
            reply("edit_linting 1:1\nprint(1)\nend_of_edit"),
            reply("submit"),
        ],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model, ledger);

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(result.trajectory.len(), 3);
    assert_eq!(result.info.exit_status.as_deref(), Some("submitted"));
    // The file is now syntactically valid.
    let content = std::fs::read_to_string(h.repo.join("x.py")).unwrap();
    assert_eq!(content.trim_end(), "print(1)");
    // The submission is a unified diff touching x.py.
    let submission = result.info.submission.unwrap();
    assert!(submission.contains("diff --git"), "got: {submission}");
    assert!(submission.contains("x.py"));
    assert!(submission.contains("+print(1)"));
    h.channel.close().await.unwrap();
}

#[tokio::test]
async fn open_file_observation_follows_the_window_contract() {
    let mut h = harness(&[("x.py", "print(1\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![reply("open_file x.py"), reply("submit")],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model, ledger);
    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();
    let obs = &result.trajectory[0].observation;
    assert!(obs.contains("[File:"), "got: {obs}");
    assert!(obs.contains("(1 lines total)]"));
    assert!(obs.contains("1:print(1"));
    h.channel.close().await.unwrap();
}

// ─── S3: lint rejection ───────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_edit_reverts_then_a_correct_edit_succeeds() {
    let mut h = harness(&[("x.py", "print(1\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![
            reply("open_file x.py"),
            reply("edit_linting 1:1\nprint(\nend_of_edit"),
            reply("edit_linting 1:1\nprint(1)\nend_of_edit"),
            reply("submit"),
        ],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model, ledger);

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(result.trajectory.len(), 4);
    let rejection = &result.trajectory[1].observation;
    assert!(
        rejection.contains("introduced new syntax error(s)"),
        "got: {rejection}"
    );
    // The rejected edit left no trace on disk: the third step starts from the
    // original bytes and applies cleanly.
    let content = std::fs::read_to_string(h.repo.join("x.py")).unwrap();
    assert_eq!(content.trim_end(), "print(1)");
    assert!(result.info.submission.unwrap().contains("diff --git"));
    h.channel.close().await.unwrap();
}

// ─── S4: format retry ─────────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_replies_requery_once_then_exit_format() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec!["no code block here".to_string(), "still no code block".to_string()],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model.clone(), ledger);

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(result.info.exit_status.as_deref(), Some("exit_format"));
    assert_eq!(model.calls(), 2, "initial query plus one corrective requery");

    // The corrective requery carried the format-error template plus the
    // malformed reply, without committing either to the persistent history.
    let queries = model.queries.lock().unwrap();
    let requery = &queries[1];
    assert!(requery
        .iter()
        .any(|m| m.content.contains("was not formatted correctly")));
    assert!(requery.iter().any(|m| m.content == "no code block here"));
    assert!(
        !result
            .history
            .iter()
            .any(|m| m.content == "no code block here"),
        "malformed reply must not enter the persistent history"
    );
    h.channel.close().await.unwrap();
}

#[tokio::test]
async fn blocked_commands_requery_with_the_blocklist_template() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![reply("vim x.py"), reply("submit")],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model.clone(), ledger);

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(result.info.exit_status.as_deref(), Some("submitted"));
    let queries = model.queries.lock().unwrap();
    assert!(queries[1]
        .iter()
        .any(|m| m.content.contains("'vim' is not supported")));
    h.channel.close().await.unwrap();
}

// ─── S5: cost exit ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cost_limit_salvages_pending_changes_as_a_submission() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::new(0.001, 0.0));
    let model = Arc::new(
        ScriptedProvider::texts(vec![reply("echo tweak >> x.py")], ledger.clone())
            .with_cost(0.01),
    );
    let mut agent = agent_for(&h, model.clone(), ledger);

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(model.calls(), 1, "the gated second query never reaches the backend");
    assert_eq!(
        result.info.exit_status.as_deref(),
        Some("submitted (exit_cost)")
    );
    let submission = result.info.submission.unwrap();
    assert!(submission.contains("x.py"), "got: {submission}");
    h.channel.close().await.unwrap();
}

#[tokio::test]
async fn cost_limit_without_changes_stays_exit_cost() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::new(0.001, 0.0));
    let model = Arc::new(
        ScriptedProvider::texts(vec![reply("true")], ledger.clone()).with_cost(0.01),
    );
    let mut agent = agent_for(&h, model.clone(), ledger);

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(result.info.exit_status.as_deref(), Some("exit_cost"));
    assert!(result.info.submission.is_none());
    h.channel.close().await.unwrap();
}

#[tokio::test]
async fn ledger_total_is_monotonic_across_turns() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(
        ScriptedProvider::texts(
            vec![reply("true"), reply("echo ok"), reply("submit")],
            ledger.clone(),
        )
        .with_cost(0.01),
    );
    let mut agent = agent_for(&h, model, ledger.clone());
    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();
    let stats = result.info.model_stats;
    assert_eq!(stats.api_calls, 3);
    assert!((stats.total_cost - 0.03).abs() < 1e-9);
    assert!((stats.instance_cost - 0.03).abs() < 1e-9);
    h.channel.close().await.unwrap();
}

// ─── S6: timeout then interrupt ───────────────────────────────────────────────

#[tokio::test]
async fn runaway_command_is_interrupted_and_the_loop_continues() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![reply("sleep 60"), reply("submit")],
        ledger.clone(),
    ));
    let mut agent =
        agent_for(&h, model, ledger).with_command_timeout(Duration::from_secs(1));

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert!(
        result.trajectory[0].observation.contains("EXECUTION TIMED OUT"),
        "got: {}",
        result.trajectory[0].observation
    );
    assert_eq!(result.info.exit_status.as_deref(), Some("submitted"));
    h.channel.close().await.unwrap();
}

// ─── Trajectory artifacts ─────────────────────────────────────────────────────

#[tokio::test]
async fn trajectory_file_is_written_after_every_step() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let traj_dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![reply("echo hi"), reply("submit")],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model, ledger);
    let result = agent
        .run(
            &mut h.channel,
            &h.task.clone(),
            Some(traj_dir.path()),
            "swe_main",
            None,
        )
        .await
        .unwrap();

    let path = traj_dir.path().join("octo__widgets-1.traj");
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(parsed["environment"], "swe_main");
    assert_eq!(
        parsed["trajectory"].as_array().unwrap().len(),
        result.trajectory.len()
    );
    assert_eq!(parsed["info"]["exit_status"], "submitted");
    assert!(parsed["info"]["model_stats"]["api_calls"].as_u64().unwrap() >= 2);
    h.channel.close().await.unwrap();
}

#[tokio::test]
async fn state_snapshots_record_the_working_dir() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(vec![reply("submit")], ledger.clone()));
    let mut agent = agent_for(&h, model, ledger);
    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();
    let state: serde_json::Value =
        serde_json::from_str(&result.trajectory[0].state).unwrap();
    assert_eq!(state["working_dir"], "octo__widgets");
    h.channel.close().await.unwrap();
}

// ─── Heredoc dispatch ─────────────────────────────────────────────────────────

const RECORD_NOTE_SH: &str = r#"# @yaml
# signature: |-
#   record_note
#   <text>
#   end_note
# docstring: records the given text into note.txt in the current directory.
# end_name: end_note
record_note() {
    cat > note.txt
}
"#;

#[tokio::test]
async fn multi_line_shell_commands_are_delivered_as_heredocs() {
    let mut h = harness(
        &[("x.py", "print(1)\n")],
        &[("record_note.sh", RECORD_NOTE_SH)],
    )
    .await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![
            reply("record_note\nremember the milk\nend_note"),
            reply("submit"),
        ],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model, ledger);

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    let note = std::fs::read_to_string(h.repo.join("note.txt")).unwrap();
    assert_eq!(note.trim_end(), "remember the milk");
    assert_eq!(result.info.exit_status.as_deref(), Some("submitted"));
    h.channel.close().await.unwrap();
}

// ─── Subroutines ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn subroutine_restores_parent_working_dir_and_merges_history() {
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    std::fs::create_dir(h.repo.join("sub")).unwrap();

    let helper = SubroutineConfig {
        name: "helper".into(),
        signature: "helper <prompt>".into(),
        docstring: Some("spawns a helper agent.".into()),
        end_name: None,
        init_observation: None,
        return_type: SubroutineReturnType::Observation,
        agent_file: None,
    };
    let registry = Arc::new(CommandRegistry::new(
        h.descriptors.clone(),
        vec![helper],
        "submit",
    ));

    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::texts(
        vec![
            // Parent: delegate to the helper.
            reply("helper look into the sub directory"),
            // Helper: wander off into a subdirectory, then give up.
            reply("cd sub"),
            reply("skip"),
            // Parent resumes: its cwd must be restored.
            reply("pwd"),
            reply("submit"),
        ],
        ledger.clone(),
    ));
    let mut agent = Agent::new("primary", test_agent_config(), registry, model, ledger).unwrap();
    agent.editor.lint_command = PYTHON_LINT.into();

    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();

    assert_eq!(result.info.exit_status.as_deref(), Some("submitted"));
    // The helper's final observation is the subroutine's return value.
    assert_eq!(result.trajectory[0].observation, "Skipped");
    // Parent cwd snapshot/restore held across the call.
    let pwd = result.trajectory[1].observation.trim();
    assert!(
        pwd.ends_with("octo__widgets"),
        "parent cwd not restored: {pwd}"
    );
    // The child's turns are folded into the parent's record under its name.
    assert!(result.history.iter().any(|m| m.agent == "helper"));
    h.channel.close().await.unwrap();
}

// ─── Parser ↔ splitter round trip ─────────────────────────────────────────────

#[tokio::test]
async fn json_parser_round_trips_through_the_splitter() {
    let h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let splitter = ActionSplitter::new(&h.registry);

    let response = r#"{"thought":"open it","command":{"name":"open_file","arguments":{"path":"src file.py","line_number":3}}}"#;
    let (_, action) = ReplyParser::Json.parse(response, &h.registry).unwrap();
    assert_eq!(action, "open_file 'src file.py' 3");

    let envelopes = splitter.split(&action, "primary");
    assert_eq!(envelopes.len(), 1);
    assert_eq!(
        envelopes[0].kind,
        EnvelopeKind::Command("open_file".into())
    );
    assert_eq!(envelopes[0].raw, action);
}

// ─── Context window exit ──────────────────────────────────────────────────────

#[tokio::test]
async fn context_window_error_maps_to_exit_context() {
    use swea_model::mock::ScriptedReply;
    let mut h = harness(&[("x.py", "print(1)\n")], &[]).await;
    let ledger = Arc::new(StatsLedger::default());
    let model = Arc::new(ScriptedProvider::new(
        vec![ScriptedReply::ContextWindowExceeded],
        ledger.clone(),
    ));
    let mut agent = agent_for(&h, model, ledger);
    let result = agent
        .run(&mut h.channel, &h.task.clone(), None, "swe_main", None)
        .await
        .unwrap();
    assert_eq!(result.info.exit_status.as_deref(), Some("exit_context"));
    h.channel.close().await.unwrap();
}
