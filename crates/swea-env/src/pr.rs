// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use swea_config::PullRequestConfig;

use crate::channel::CommandChannel;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "swea";

/// The subset of the issue the skip checks need.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueInfo {
    pub number: u64,
    pub title: String,
    pub state: String,
    #[serde(default)]
    pub assignees: Vec<serde_json::Value>,
    #[serde(default)]
    pub locked: bool,
}

/// `https://github.com/owner/repo/issues/N` → `(owner, repo, N)`.
pub fn parse_issue_url(url: &str) -> anyhow::Result<(String, String, u64)> {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let mut parts = trimmed.split('/');
    let host = parts.next().unwrap_or_default();
    if host != "github.com" {
        bail!("unsupported git host: {host}");
    }
    let owner = parts.next().context("issue url missing owner")?;
    let repo = parts.next().context("issue url missing repo")?;
    let kind = parts.next().unwrap_or_default();
    if kind != "issues" {
        bail!("not an issue url: {url}");
    }
    let number: u64 = parts
        .next()
        .context("issue url missing number")?
        .parse()
        .context("issue number is not an integer")?;
    Ok((owner.to_string(), repo.to_string(), number))
}

/// `https://github.com/owner/repo[.git]` → `(owner, repo)`.
pub fn parse_repo_url(url: &str) -> anyhow::Result<(String, String)> {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches(".git");
    let mut parts = trimmed.split('/');
    let host = parts.next().unwrap_or_default();
    if host != "github.com" {
        bail!("unsupported git host: {host}");
    }
    let owner = parts.next().context("repo url missing owner")?;
    let repo = parts.next().context("repo url missing repo")?;
    Ok((owner.to_string(), repo.to_string()))
}

/// Decide whether a PR should be opened for this issue at all.
///
/// Closed, assigned, locked, or already-referenced issues are skipped — the
/// last of those can be overridden from configuration.
pub fn should_skip(
    issue: &IssueInfo,
    has_referencing_commits: bool,
    config: &PullRequestConfig,
) -> Option<String> {
    if issue.state != "open" {
        return Some(format!("issue #{} is {}", issue.number, issue.state));
    }
    if !issue.assignees.is_empty() {
        return Some(format!("issue #{} is assigned", issue.number));
    }
    if issue.locked {
        return Some(format!("issue #{} is locked", issue.number));
    }
    if has_referencing_commits && config.skip_if_commits_reference_issue {
        return Some(format!(
            "issue #{} already has referencing commits",
            issue.number
        ));
    }
    None
}

/// Render a trajectory into the collapsible markdown block embedded in the
/// PR body.
pub fn format_trajectory_markdown(steps: &[(String, String, String)]) -> String {
    let mut out = String::from("<details>\n<summary>Agent trajectory</summary>\n\n");
    for (i, (thought, action, observation)) in steps.iter().enumerate() {
        out.push_str(&format!("**Step {}**\n\n", i + 1));
        if !thought.trim().is_empty() {
            out.push_str(&format!("{}\n\n", thought.trim()));
        }
        out.push_str(&format!("```\n{}\n```\n\n", action.trim()));
        if !observation.trim().is_empty() {
            out.push_str(&format!(
                "<blockquote>\n\n```\n{}\n```\n\n</blockquote>\n\n",
                observation.trim()
            ));
        }
    }
    out.push_str("</details>\n");
    out
}

/// Open a draft pull request for a submitted task.
///
/// Branches, commits and pushes through the sandbox shell, then calls the
/// forge API.  Out-of-core relative to the agent loop: invoked by the runner
/// only after a `submitted` terminal.
pub async fn open_pull_request(
    channel: &mut dyn CommandChannel,
    config: &PullRequestConfig,
    issue_url: &str,
    trajectory: &[(String, String, String)],
) -> anyhow::Result<()> {
    let token = std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN is required to open a PR")?;
    let (issue_owner, issue_repo, number) = parse_issue_url(issue_url)?;

    let client = reqwest::Client::new();
    let issue: IssueInfo = client
        .get(format!(
            "{API_BASE}/repos/{issue_owner}/{issue_repo}/issues/{number}"
        ))
        .header("User-Agent", USER_AGENT)
        .bearer_auth(&token)
        .send()
        .await?
        .error_for_status()
        .context("fetching issue")?
        .json()
        .await?;

    let has_refs = issue_has_referencing_commits(&client, &token, &issue_owner, &issue_repo, number)
        .await
        .unwrap_or(false);
    if let Some(reason) = should_skip(&issue, has_refs, config) {
        warn!(reason = %reason, "skipping pull request");
        return Ok(());
    }

    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    let branch = format!("swe-agent-fix-#{number}-{suffix}");
    let timeout = Duration::from_secs(10);

    let run = |cmd: String| (cmd, timeout);
    for (cmd, t) in [
        run(format!("git checkout -b {branch}")),
        run("git add -A".to_string()),
        run(format!(
            "git commit -m 'Fix: {}' -m 'Closes #{number}'",
            issue.title.replace('\'', "")
        )),
    ] {
        let (output, code) = channel.send(&cmd, t).await?;
        if code != 0 {
            bail!("pr git step {cmd:?} failed: {output}");
        }
    }

    // Push to origin, or to a configured fork added as a second remote.
    let (push_owner, remote) = match &config.push_gh_repo_url {
        Some(fork_url) => {
            let (owner, repo) = parse_repo_url(fork_url)?;
            let fork = format!("https://{token}@github.com/{owner}/{repo}.git");
            let (output, code) = channel
                .send(&format!("git remote add fork {fork}"), timeout)
                .await?;
            if code != 0 {
                bail!("failed to add fork remote: {output}");
            }
            (owner, "fork")
        }
        None => (issue_owner.clone(), "origin"),
    };
    let (output, code) = channel
        .send(&format!("git push {remote} {branch}"), Duration::from_secs(60))
        .await?;
    if code != 0 {
        bail!(
            "failed to push branch (check token permissions, or configure \
             pull_request.push_gh_repo_url to push to a fork): {output}"
        );
    }

    let head = if remote == "fork" {
        format!("{push_owner}:{branch}")
    } else {
        branch.clone()
    };
    let body = format!(
        "This is a PR opened by the swea agent to close \
         [#{number}]({issue_url}) ({title}).\n\nCloses #{number}.\n\n{traj}",
        title = issue.title,
        traj = format_trajectory_markdown(trajectory),
    );
    let response = client
        .post(format!("{API_BASE}/repos/{issue_owner}/{issue_repo}/pulls"))
        .header("User-Agent", USER_AGENT)
        .bearer_auth(&token)
        .json(&json!({
            "title": format!("swea[bot] PR to fix: {}", issue.title),
            "head": head,
            "base": "main",
            "body": body,
            "draft": true,
        }))
        .send()
        .await?
        .error_for_status()
        .context("creating pull request")?;
    let pr: serde_json::Value = response.json().await?;
    info!(url = %pr["html_url"].as_str().unwrap_or("?"), "draft PR created");
    Ok(())
}

async fn issue_has_referencing_commits(
    client: &reqwest::Client,
    token: &str,
    owner: &str,
    repo: &str,
    number: u64,
) -> anyhow::Result<bool> {
    let events: Vec<serde_json::Value> = client
        .get(format!(
            "{API_BASE}/repos/{owner}/{repo}/issues/{number}/events"
        ))
        .header("User-Agent", USER_AGENT)
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(events
        .iter()
        .any(|e| e["event"] == "referenced" && !e["commit_id"].is_null()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
