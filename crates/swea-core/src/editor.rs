// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use swea_env::{ChannelError, CommandChannel};

const TIMEOUT: Duration = Duration::from_secs(25);
/// Sentinel for heredocs that carry file content; single-quoted so the shell
/// never expands the payload.
const HEREDOC_EOF: &str = "__SWEA_EOF__";
/// Cap on reported search matches before asking the model to narrow.
const MAX_SEARCH_MATCHES: usize = 100;

/// The editor the model believes it is using.
///
/// The state lives here; the files live in the sandbox.  Every operation
/// reads or writes the repository through the command channel and then
/// re-exports the state contract (`CURRENT_FILE`, `CURRENT_LINE`, `WINDOW`,
/// `OVERLAP`) so the in-sandbox helpers agree with this struct.
///
/// Operations return the rendered text the model will see next turn.  Invalid
/// input (missing file, bad line number, rejected edit) is an observation,
/// not an error; `Err` is reserved for channel failures.
#[derive(Debug, Clone)]
pub struct EditorState {
    pub current_directory: PathBuf,
    pub current_file: Option<PathBuf>,
    /// 1-based cursor; 0 when no file is open.
    pub current_line: usize,
    pub window: usize,
    pub overlap: usize,
    /// Lint invocation with a `{file}` placeholder; the edit gate refuses a
    /// Python edit that makes it emit diagnostics.
    pub lint_command: String,
}

impl EditorState {
    pub fn new(root: impl Into<PathBuf>, window: usize, overlap: usize) -> Self {
        Self {
            current_directory: root.into(),
            current_file: None,
            current_line: 0,
            window,
            overlap,
            lint_command:
                "flake8 --isolated --select=F821,F822,F831,E111,E112,E113,E999,E902 {file}".into(),
        }
    }

    /// Absolute path of the open file, if any.
    pub fn absolute_file(&self) -> Option<PathBuf> {
        self.current_file.as_ref().map(|f| self.resolve(f))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.current_directory.join(path)
        }
    }

    /// Re-export the editor contract into the sandbox shell.
    pub async fn export_state(
        &self,
        channel: &mut dyn CommandChannel,
    ) -> Result<(), ChannelError> {
        let file = self
            .absolute_file()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let cmd = format!(
            "export CURRENT_FILE={} CURRENT_LINE={} WINDOW={} OVERLAP={}",
            sh_quote(&file),
            self.current_line,
            self.window,
            self.overlap,
        );
        let (_, code) = channel.send(&cmd, TIMEOUT).await?;
        if code != 0 {
            warn!("failed to export editor state to sandbox");
        }
        Ok(())
    }

    // ── File probes through the channel ───────────────────────────────────────

    async fn is_file(
        &self,
        channel: &mut dyn CommandChannel,
        path: &Path,
    ) -> Result<bool, ChannelError> {
        let (_, code) = channel
            .send(&format!("test -f {}", sh_quote_path(path)), TIMEOUT)
            .await?;
        Ok(code == 0)
    }

    async fn is_dir(
        &self,
        channel: &mut dyn CommandChannel,
        path: &Path,
    ) -> Result<bool, ChannelError> {
        let (_, code) = channel
            .send(&format!("test -d {}", sh_quote_path(path)), TIMEOUT)
            .await?;
        Ok(code == 0)
    }

    async fn read_file(
        &self,
        channel: &mut dyn CommandChannel,
        path: &Path,
    ) -> Result<String, ChannelError> {
        let (output, code) = channel
            .send(&format!("cat -- {}", sh_quote_path(path)), TIMEOUT)
            .await?;
        if code != 0 {
            return Err(ChannelError::Crashed(format!(
                "cat failed for {}: {output}",
                path.display()
            )));
        }
        Ok(output)
    }

    async fn write_file(
        &self,
        channel: &mut dyn CommandChannel,
        path: &Path,
        content: &str,
    ) -> Result<(), ChannelError> {
        // The heredoc necessarily ends the payload with a newline; strip one
        // from the content when present, otherwise truncate it away after the
        // write so the bytes land exactly as given.
        let (body, strip_trailing) = match content.strip_suffix('\n') {
            Some(stripped) => (stripped, false),
            None => (content, true),
        };
        let mut cmd = format!(
            "cat > {} <<'{HEREDOC_EOF}'\n{body}\n{HEREDOC_EOF}",
            sh_quote_path(path),
        );
        if strip_trailing && !content.is_empty() {
            cmd.push_str(&format!("\ntruncate -s -1 {}", sh_quote_path(path)));
        }
        let (output, code) = channel.send(&cmd, TIMEOUT).await?;
        if code != 0 {
            return Err(ChannelError::Crashed(format!(
                "write failed for {}: {output}",
                path.display()
            )));
        }
        Ok(())
    }

    // ── Navigation ────────────────────────────────────────────────────────────

    pub async fn open_file(
        &mut self,
        channel: &mut dyn CommandChannel,
        path: &str,
        line: Option<usize>,
    ) -> Result<String, ChannelError> {
        let resolved = self.resolve(Path::new(path));
        if self.is_dir(channel, &resolved).await? {
            return Ok(format!("Error: {path} is a directory. Use cd or ls to navigate it."));
        }
        if !self.is_file(channel, &resolved).await? {
            return Ok(format!("File {path} not found"));
        }
        let content = self.read_file(channel, &resolved).await?;
        let max_line = count_lines(&content);
        if let Some(line) = line {
            if line < 1 || line > max_line {
                return Ok(format!(
                    "Error: <line_number> must be less than or equal to {max_line}"
                ));
            }
        }
        self.current_file = Some(PathBuf::from(path));
        self.current_line = constrain_line(line.unwrap_or(1), max_line, self.window);
        debug!(file = %path, line = self.current_line, "opened file");
        Ok(render_window(
            &resolved,
            &content,
            self.current_line,
            self.window,
        ))
    }

    pub async fn goto_line(
        &mut self,
        channel: &mut dyn CommandChannel,
        line: usize,
    ) -> Result<String, ChannelError> {
        let Some(abs) = self.absolute_file() else {
            return Ok(no_file_open());
        };
        let content = self.read_file(channel, &abs).await?;
        let max_line = count_lines(&content);
        if line > max_line {
            return Ok(format!(
                "Error: <line> must be less than or equal to {max_line}"
            ));
        }
        self.current_line = constrain_line(line, max_line, self.window);
        Ok(render_window(&abs, &content, self.current_line, self.window))
    }

    pub async fn scroll(
        &mut self,
        channel: &mut dyn CommandChannel,
        down: bool,
    ) -> Result<String, ChannelError> {
        let Some(abs) = self.absolute_file() else {
            return Ok(no_file_open());
        };
        let content = self.read_file(channel, &abs).await?;
        let max_line = count_lines(&content);
        let step = self.window.saturating_sub(self.overlap);
        let target = if down {
            self.current_line.saturating_add(step)
        } else {
            self.current_line.saturating_sub(step).max(1)
        };
        self.current_line = constrain_line(target, max_line, self.window);
        Ok(render_window(&abs, &content, self.current_line, self.window))
    }

    // ── Mutation ──────────────────────────────────────────────────────────────

    pub async fn create_file(
        &mut self,
        channel: &mut dyn CommandChannel,
        path: &str,
    ) -> Result<String, ChannelError> {
        let resolved = self.resolve(Path::new(path));
        if self.is_file(channel, &resolved).await? || self.is_dir(channel, &resolved).await? {
            return Ok(format!("Error: File '{path}' already exists."));
        }
        self.write_file(channel, &resolved, "").await?;
        self.current_file = Some(PathBuf::from(path));
        self.current_line = 1;
        let content = self.read_file(channel, &resolved).await?;
        Ok(format!(
            "[File {path} created.]\n{}",
            render_window(&resolved, &content, self.current_line, self.window)
        ))
    }

    /// Replace lines `[start, end]` (1-based, inclusive) with `body`.
    ///
    /// Python edits must pass the lint gate; a rejected edit restores the
    /// pre-edit bytes exactly.
    pub async fn edit(
        &mut self,
        channel: &mut dyn CommandChannel,
        start: &str,
        end: &str,
        body: &str,
    ) -> Result<String, ChannelError> {
        let Some(abs) = self.absolute_file() else {
            return Ok(no_file_open());
        };
        let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
            return Ok("start_line and end_line must be natural numbers.".to_string());
        };
        if start < 1 {
            return Ok("start_line must be a natural number (1-based).".to_string());
        }
        if end < start {
            return Ok(format!(
                "start_line must be less than or equal to end_line ({start} > {end})"
            ));
        }

        let original = self.read_file(channel, &abs).await?;
        let lines: Vec<&str> = split_lines(&original);
        let max_line = lines.len();
        if start > max_line || end > max_line {
            return Ok(format!(
                "Error: start_line and end_line must be within the file ({max_line} lines total)"
            ));
        }

        let mut edited: Vec<&str> = Vec::with_capacity(max_line);
        edited.extend(&lines[..start - 1]);
        edited.extend(split_lines(body));
        edited.extend(&lines[end..]);
        let edited = edited.join("\n");

        self.write_file(channel, &abs, &edited).await?;

        // Lint gate: Python files only.
        if abs.extension().and_then(|e| e.to_str()) == Some("py") {
            let lint_cmd = self
                .lint_command
                .replace("{file}", &sh_quote_path(&abs));
            let (lint_output, lint_code) = channel.send(&lint_cmd, TIMEOUT).await?;
            let diagnostics = lint_output.trim();
            // Exit 127 means the lint tool itself is missing; the gate cannot
            // run, so the edit stands and we log the gap.
            if lint_code == 127 {
                warn!("lint tool unavailable, edit committed without the gate");
            } else if !diagnostics.is_empty() {
                // Revert from the in-memory backup, byte for byte.
                self.write_file(channel, &abs, &original).await?;
                self.current_line = constrain_line(start, max_line, self.window);
                let shown_edit = render_window(&abs, &edited, self.current_line, self.window);
                let shown_orig = render_window(&abs, &original, self.current_line, self.window);
                return Ok(format!(
                    "Your proposed edit has introduced new syntax error(s). \
                     Please read this error message carefully and then retry editing the file.\n\
                     \nERRORS:\n{diagnostics}\n\
                     \nThis is how your edit would have looked if applied\n\
                     -------------------------------------------------\n{shown_edit}\
                     -------------------------------------------------\n\
                     \nThis is the original code before your edit\n\
                     -------------------------------------------------\n{shown_orig}\
                     -------------------------------------------------\n\
                     Your changes have NOT been applied. Please fix your edit command and try again."
                ));
            }
        }

        let new_content = self.read_file(channel, &abs).await?;
        self.current_line = constrain_line(start, count_lines(&new_content), self.window);
        Ok(format!(
            "File updated. Please review the changes and make sure they are correct \
             (correct indentation, no duplicate lines, etc). Edit the file again if necessary.\n{}",
            render_window(&abs, &new_content, self.current_line, self.window)
        ))
    }

    // ── Search ────────────────────────────────────────────────────────────────

    pub async fn find_file(
        &mut self,
        channel: &mut dyn CommandChannel,
        name: &str,
        dir: Option<&str>,
    ) -> Result<String, ChannelError> {
        let dir_path = dir
            .map(|d| self.resolve(Path::new(d)))
            .unwrap_or_else(|| self.current_directory.clone());
        if !self.is_dir(channel, &dir_path).await? {
            return Ok(format!("Directory {} not found", dir.unwrap_or(".")));
        }
        let (output, _) = channel
            .send(
                &format!(
                    "find {} -name {}",
                    sh_quote_path(&dir_path),
                    sh_quote(name)
                ),
                TIMEOUT,
            )
            .await?;
        let matches: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        if matches.is_empty() {
            return Ok(format!(
                "No matches found for \"{name}\" in {}",
                dir_path.display()
            ));
        }
        Ok(format!(
            "Found {} matches for \"{name}\" in {}:\n{}",
            matches.len(),
            dir_path.display(),
            matches.join("\n")
        ))
    }

    pub async fn search_file(
        &mut self,
        channel: &mut dyn CommandChannel,
        term: &str,
        file: Option<&str>,
    ) -> Result<String, ChannelError> {
        let path = match file {
            Some(f) => self.resolve(Path::new(f)),
            None => match self.absolute_file() {
                Some(p) => p,
                None => return Ok(no_file_open()),
            },
        };
        if !self.is_file(channel, &path).await? {
            return Ok(format!("File {} not found", path.display()));
        }
        let content = self.read_file(channel, &path).await?;
        let matches: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| line.contains(term))
            .map(|(i, line)| (i + 1, line))
            .collect();
        if matches.is_empty() {
            return Ok(format!(
                "No matches found for \"{term}\" in {}",
                path.display()
            ));
        }
        if matches.len() > MAX_SEARCH_MATCHES {
            return Ok(format!(
                "More than {MAX_SEARCH_MATCHES} lines matched for \"{term}\" in {}. \
                 Please narrow your search.",
                path.display()
            ));
        }
        let mut out = format!(
            "Found {} matches for \"{term}\" in {}:\n",
            matches.len(),
            path.display()
        );
        for (line_no, line) in &matches {
            out.push_str(&format!("Line {line_no}:{line}\n"));
        }
        out.push_str(&format!("End of matches for \"{term}\" in {}", path.display()));
        Ok(out)
    }

    pub async fn search_dir(
        &mut self,
        channel: &mut dyn CommandChannel,
        term: &str,
        dir: Option<&str>,
    ) -> Result<String, ChannelError> {
        let dir_path = dir
            .map(|d| self.resolve(Path::new(d)))
            .unwrap_or_else(|| self.current_directory.clone());
        if !self.is_dir(channel, &dir_path).await? {
            return Ok(format!("Directory {} not found", dir.unwrap_or(".")));
        }
        let (output, _) = channel
            .send(
                &format!(
                    "grep -rn --binary-files=without-match -- {} {}",
                    sh_quote(term),
                    sh_quote_path(&dir_path)
                ),
                TIMEOUT,
            )
            .await?;
        // grep -rn lines look like `path:line:content`.
        let matches: Vec<&str> = output
            .lines()
            .filter(|l| l.splitn(3, ':').count() == 3)
            .collect();
        if matches.is_empty() {
            return Ok(format!(
                "No matches found for \"{term}\" in {}",
                dir_path.display()
            ));
        }
        // The short-circuit counts match lines, not files.
        if matches.len() > MAX_SEARCH_MATCHES {
            return Ok(format!(
                "More than {MAX_SEARCH_MATCHES} matches found for \"{term}\" in {}. \
                 Please narrow your search.",
                dir_path.display()
            ));
        }
        let mut per_file: Vec<(String, usize)> = Vec::new();
        for m in &matches {
            let file = m.splitn(2, ':').next().unwrap_or("").to_string();
            match per_file.iter_mut().find(|(f, _)| *f == file) {
                Some((_, count)) => *count += 1,
                None => per_file.push((file, 1)),
            }
        }
        let mut out = format!(
            "Found {} matches for \"{term}\" in {}:\n",
            matches.len(),
            dir_path.display()
        );
        for (file, count) in &per_file {
            let noun = if *count == 1 { "match" } else { "matches" };
            out.push_str(&format!("{file} ({count} {noun})\n"));
        }
        out.push_str(&format!(
            "End of matches for \"{term}\" in {}",
            dir_path.display()
        ));
        Ok(out)
    }

    // ── Directory operations ──────────────────────────────────────────────────

    pub async fn list_files(
        &mut self,
        channel: &mut dyn CommandChannel,
        dir: Option<&str>,
    ) -> Result<String, ChannelError> {
        let dir_path = dir
            .map(|d| self.resolve(Path::new(d)))
            .unwrap_or_else(|| self.current_directory.clone());
        let (output, code) = channel
            .send(&format!("ls -l -- {}", sh_quote_path(&dir_path)), TIMEOUT)
            .await?;
        if code != 0 {
            return Ok(format!("Directory {} not found", dir_path.display()));
        }
        Ok(output)
    }

    pub async fn change_directory(
        &mut self,
        channel: &mut dyn CommandChannel,
        path: &str,
    ) -> Result<String, ChannelError> {
        let (output, code) = channel
            .send(&format!("cd -- {} && pwd -P", sh_quote(path)), TIMEOUT)
            .await?;
        if code != 0 {
            return Ok(format!("Directory {path} not found"));
        }
        if let Some(cwd) = output.lines().rev().find(|l| l.starts_with('/')) {
            self.current_directory = PathBuf::from(cwd.trim());
        }
        Ok(format!(
            "Current directory is now {}",
            self.current_directory.display()
        ))
    }
}

// ─── Pure helpers ─────────────────────────────────────────────────────────────

fn no_file_open() -> String {
    "No file open. Use the open_file command first.".to_string()
}

/// Lines of `s` without a phantom trailing entry for the final newline.
fn split_lines(s: &str) -> Vec<&str> {
    if s.is_empty() {
        vec![""]
    } else {
        s.trim_end_matches('\n').split('\n').collect()
    }
}

fn count_lines(s: &str) -> usize {
    split_lines(s).len()
}

/// Clamp the cursor so the viewport always fills: with window `W` the valid
/// range is `[⌊W/2⌋, max_line − ⌊W/2⌋]` whenever the file is at least a
/// window tall.
pub fn constrain_line(line: usize, max_line: usize, window: usize) -> usize {
    let half = (window / 2) as i64;
    let clamped = (line as i64).min(max_line as i64 - half).max(half);
    clamped.max(1) as usize
}

/// Render the viewport contract: header, elided-line markers, and the
/// 1-based numbered slice centered on `current_line`.
pub fn render_window(abs_path: &Path, content: &str, current_line: usize, window: usize) -> String {
    let lines = split_lines(content);
    let total = lines.len();
    let end = (current_line + window / 2).min(total);
    let start = (end as i64 - window as i64).max(0) as usize;

    let mut out = format!("[File: {} ({total} lines total)]\n", abs_path.display());
    if start > 0 {
        out.push_str(&format!("({start} more lines above)\n"));
    }
    for (i, line) in lines[start..end].iter().enumerate() {
        out.push_str(&format!("{}:{line}\n", start + i + 1));
    }
    if total > end {
        out.push_str(&format!("({} more lines below)\n", total - end));
    }
    out
}

/// Quote for the sandbox shell; plain words pass through untouched.
pub fn sh_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn sh_quote_path(p: &Path) -> String {
    sh_quote(&p.display().to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
