// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use swea_model::{ApiStats, Message};

/// One recorded model turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub action: String,
    pub observation: String,
    /// The raw model output the action was parsed from.
    pub response: String,
    /// JSON snapshot of the sandbox state (`{"working_dir": …}`).
    pub state: String,
    pub thought: String,
}

/// Run metadata carried in the `.traj` file's `info` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<String>,
    pub model_stats: ApiStats,
}

#[derive(Debug, Serialize)]
struct TrajectoryFile<'a> {
    environment: &'a str,
    trajectory: &'a [TrajectoryStep],
    history: &'a [Message],
    info: &'a RunInfo,
}

/// Rewrite `<traj_dir>/<instance_id>.traj` after a step.
///
/// Write-to-temp, fsync, rename: a crash mid-write leaves the previous
/// complete file, never a torn one, so any `.traj` on disk is valid JSON and
/// a prefix of the final trace.
pub fn save_trajectory(
    traj_dir: &Path,
    instance_id: &str,
    environment: &str,
    trajectory: &[TrajectoryStep],
    history: &[Message],
    info: &RunInfo,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(traj_dir)
        .with_context(|| format!("creating trajectory dir {}", traj_dir.display()))?;
    let final_path = traj_dir.join(format!("{instance_id}.traj"));

    let payload = serde_json::to_vec_pretty(&TrajectoryFile {
        environment,
        trajectory,
        history,
        info,
    })
    .context("serializing trajectory")?;

    let mut tmp = tempfile::NamedTempFile::new_in(traj_dir)
        .context("creating temporary trajectory file")?;
    tmp.write_all(&payload).context("writing trajectory")?;
    tmp.as_file().sync_all().context("syncing trajectory")?;
    tmp.persist(&final_path)
        .with_context(|| format!("renaming trajectory into {}", final_path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: usize) -> TrajectoryStep {
        TrajectoryStep {
            action: format!("action {n}"),
            observation: format!("observation {n}"),
            response: format!("response {n}"),
            state: r#"{"working_dir": "repo"}"#.into(),
            thought: format!("thought {n}"),
        }
    }

    #[test]
    fn trajectory_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![step(1), step(2)];
        let history = vec![Message::user("u", "primary")];
        let info = RunInfo {
            exit_status: Some("submitted".into()),
            submission: Some("diff".into()),
            model_stats: ApiStats::default(),
        };
        save_trajectory(dir.path(), "inst-1", "swe_main", &steps, &history, &info).unwrap();

        let text = std::fs::read_to_string(dir.path().join("inst-1.traj")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["environment"], "swe_main");
        assert_eq!(parsed["trajectory"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["info"]["exit_status"], "submitted");
        assert_eq!(parsed["info"]["submission"], "diff");
        assert_eq!(parsed["history"][0]["role"], "user");
    }

    #[test]
    fn rewrite_preserves_earlier_steps_byte_identically() {
        // Append-only history: once step i is recorded, its serialized form
        // is identical in every subsequent write.
        let dir = tempfile::tempdir().unwrap();
        let mut steps = vec![step(1)];
        let info = RunInfo::default();

        save_trajectory(dir.path(), "i", "swe_main", &steps, &[], &info).unwrap();
        let first: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("i.traj")).unwrap(),
        )
        .unwrap();

        steps.push(step(2));
        save_trajectory(dir.path(), "i", "swe_main", &steps, &[], &info).unwrap();
        let second: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("i.traj")).unwrap(),
        )
        .unwrap();

        assert_eq!(
            serde_json::to_string(&first["trajectory"][0]).unwrap(),
            serde_json::to_string(&second["trajectory"][0]).unwrap(),
        );
    }

    #[test]
    fn info_without_submission_omits_the_field() {
        let dir = tempfile::tempdir().unwrap();
        save_trajectory(dir.path(), "i", "swe_main", &[], &[], &RunInfo::default()).unwrap();
        let text = std::fs::read_to_string(dir.path().join("i.traj")).unwrap();
        assert!(!text.contains("submission"));
        assert!(text.contains("model_stats"));
    }
}
