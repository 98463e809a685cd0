// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One LLM-visible operation from the command catalogue.
///
/// Loaded once at startup and immutable thereafter.  A command with an
/// `end_name` is multi-line: its payload is terminated by a line equal to the
/// marker, and the dispatcher delivers it to the shell as a heredoc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    pub signature: String,
    pub docstring: String,
    pub end_name: Option<String>,
    /// Argument schema: name → (type, description, required), as declared in
    /// the `@yaml` block.  Used by the JSON reply parser to re-render actions.
    pub arguments: BTreeMap<String, ArgumentSpec>,
    /// The function or script body installed into the sandbox.
    pub code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentSpec {
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// How a catalogue file is installed into `/root/commands`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `.sh` without shebang — sourced into the shell.
    SourceFile,
    /// Shebang script — copied and made executable.
    Script,
    /// Underscore-prefixed helper — copied, neither sourced nor chmodded.
    Utility,
}

/// A catalogue file as it will be shipped into the sandbox.
#[derive(Debug, Clone)]
pub struct CommandFile {
    /// Installed filename (scripts lose their extension so they are callable
    /// by bare name).
    pub name: String,
    pub contents: String,
    pub kind: CommandKind,
}

/// Metadata block parsed from an `@yaml` docstring.
#[derive(Debug, Default, Deserialize)]
struct YamlMeta {
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    docstring: Option<String>,
    #[serde(default)]
    end_name: Option<String>,
    #[serde(default)]
    arguments: BTreeMap<String, ArgumentSpec>,
}

/// Load the command catalogue from the given files.
///
/// Returns the descriptors (model-visible commands, in file order) and the
/// files to install into the sandbox.
pub fn load_command_files<P: AsRef<Path>>(
    paths: &[P],
) -> anyhow::Result<(Vec<CommandDescriptor>, Vec<CommandFile>)> {
    let mut descriptors = Vec::new();
    let mut files = Vec::new();

    for path in paths {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading command file {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if contents.trim_start().starts_with("#!") {
            // Standalone script: one descriptor named after the file stem.
            let stem = filename
                .rsplit_once('.')
                .map(|(s, _)| s.to_string())
                .unwrap_or_else(|| filename.clone());
            descriptors.push(parse_script(&stem, &contents)?);
            files.push(CommandFile {
                name: stem,
                contents,
                kind: CommandKind::Script,
            });
        } else if filename.starts_with('_') {
            files.push(CommandFile {
                name: filename,
                contents,
                kind: CommandKind::Utility,
            });
        } else if filename.ends_with(".sh") {
            let mut cmds = parse_shell_functions(&contents)
                .with_context(|| format!("parsing {}", path.display()))?;
            debug!(file = %path.display(), count = cmds.len(), "loaded shell command file");
            descriptors.append(&mut cmds);
            files.push(CommandFile {
                name: filename,
                contents,
                kind: CommandKind::SourceFile,
            });
        } else {
            bail!(
                "command file {} has no shebang; add one, rename to .sh to have it \
                 sourced, or prefix with an underscore to mark it as a utility",
                path.display()
            );
        }
    }

    Ok((descriptors, files))
}

/// Parse a `.sh` file into one descriptor per function.
///
/// A function is `name() {` through the first line that is exactly `}`.
/// The `# @yaml` comment block immediately above a function supplies its
/// metadata.
fn parse_shell_functions(contents: &str) -> anyhow::Result<Vec<CommandDescriptor>> {
    let mut commands = Vec::new();
    let mut meta_lines: Vec<String> = Vec::new();
    let mut in_meta = false;

    let mut lines = contents.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_end();
        if trimmed.trim_start() == "# @yaml" {
            in_meta = true;
            meta_lines.clear();
            continue;
        }
        if in_meta {
            if let Some(rest) = strip_comment_prefix(trimmed) {
                meta_lines.push(rest.to_string());
                continue;
            }
            in_meta = false;
        }
        if let Some(name) = function_header(trimmed) {
            let mut body = vec![format!("{name}() {{")];
            for body_line in lines.by_ref() {
                body.push(body_line.to_string());
                if body_line.trim_end() == "}" {
                    break;
                }
            }
            let meta = parse_meta(&meta_lines)?;
            meta_lines.clear();
            // Underscore-prefixed functions are internal helpers, not part of
            // the model-visible surface.
            if !name.starts_with('_') {
                commands.push(descriptor_from_meta(&name, body.join("\n"), meta));
            }
        } else if !trimmed.trim_start().starts_with('#') && !trimmed.trim().is_empty() {
            // Loose code between functions discards any pending metadata.
            meta_lines.clear();
        }
    }

    Ok(commands)
}

/// Parse a shebang script: the `@yaml` block anywhere in the leading comment
/// run supplies the metadata; the whole file is the code.
fn parse_script(stem: &str, contents: &str) -> anyhow::Result<CommandDescriptor> {
    let mut meta_lines = Vec::new();
    let mut in_meta = false;
    for line in contents.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim_start() == "# @yaml" {
            in_meta = true;
            continue;
        }
        if in_meta {
            match strip_comment_prefix(trimmed) {
                Some(rest) => meta_lines.push(rest.to_string()),
                None => break,
            }
        }
    }
    let meta = parse_meta(&meta_lines)?;
    Ok(descriptor_from_meta(stem, contents.to_string(), meta))
}

fn descriptor_from_meta(name: &str, code: String, meta: YamlMeta) -> CommandDescriptor {
    let signature = meta.signature.unwrap_or_else(|| {
        // Derive `name <arg1> [<arg2>]` from the argument schema.
        let mut sig = name.to_string();
        for (arg, spec) in &meta.arguments {
            if spec.required {
                sig.push_str(&format!(" <{arg}>"));
            } else {
                sig.push_str(&format!(" [<{arg}>]"));
            }
        }
        sig
    });
    CommandDescriptor {
        name: name.to_string(),
        signature,
        docstring: meta.docstring.unwrap_or_default(),
        end_name: meta.end_name,
        arguments: meta.arguments,
        code,
    }
}

fn parse_meta(lines: &[String]) -> anyhow::Result<YamlMeta> {
    if lines.is_empty() {
        return Ok(YamlMeta::default());
    }
    let text = lines.join("\n");
    serde_yaml::from_str(&text).with_context(|| format!("parsing @yaml block:\n{text}"))
}

/// Strip the `# ` prefix of a metadata comment line; a bare `#` yields an
/// empty string.  Returns `None` for non-comment lines (end of the block).
fn strip_comment_prefix(line: &str) -> Option<&str> {
    let t = line.trim_start();
    if t == "#" {
        Some("")
    } else {
        t.strip_prefix("# ")
    }
}

/// Match `name() {` allowing leading whitespace, returning the name.
fn function_header(line: &str) -> Option<String> {
    let t = line.trim();
    let open = t.strip_suffix("{")?.trim_end();
    let name = open.strip_suffix("()")?.trim_end();
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Some(name.to_string())
    } else {
        None
    }
}

/// Render the `{command_docs}` template placeholder: `signature\n  docstring`
/// per command, in catalogue order.
pub fn render_command_docs<'a>(
    entries: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut docs = String::new();
    for (signature, docstring) in entries {
        if docstring.is_empty() {
            continue;
        }
        docs.push_str(signature);
        docs.push('\n');
        for line in docstring.lines() {
            docs.push_str("  ");
            docs.push_str(line);
            docs.push('\n');
        }
        docs.push('\n');
    }
    docs
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
