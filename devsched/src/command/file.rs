/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Command file parsing.
//!
//! A command file is line oriented:
//!
//! ```text
//! # comment
//! MACRO common = --min-loop-time 0 --cutoff-battery 15
//! INCLUDE nightly.txt
//! run instrument-suite common() --loop
//! ```
//!
//! * Blank lines and lines starting with `#` are ignored.
//! * `MACRO <name> = <tokens…>` defines a macro; a token `<name>()` anywhere
//!   in a command line expands to those tokens.  Macros are global to one
//!   parse (includes share them) and may be used before they are defined.
//! * `INCLUDE <path>` parses another file; relative paths are resolved
//!   against the directory of the including file.
//! * Every other line is one command.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::tokenizer::tokenize;

/// Nesting limit for macros that expand to other macros.
const MAX_MACRO_DEPTH: usize = 16;

/// One command produced by a command file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCommand {
    pub args: Vec<String>,
    /// File and 1-based line the command came from.
    pub source: PathBuf,
    pub line: usize,
}

/// Result of parsing a command file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCommandFile {
    pub commands: Vec<FileCommand>,
    /// Files pulled in through `INCLUDE`, transitively, in first-seen order.
    pub included_files: Vec<PathBuf>,
}

/// Stateless parser; every [`parse_file`](Self::parse_file) call starts from
/// an empty macro table.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandFileParser;

#[derive(Default)]
struct ParseState {
    macros: HashMap<String, Vec<String>>,
    raw: Vec<FileCommand>,
    included: Vec<PathBuf>,
    stack: Vec<PathBuf>,
}

impl CommandFileParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse `path` and everything it includes.
    ///
    /// # Errors
    /// [`ConfigError::ReadFile`], [`ConfigError::Syntax`],
    /// [`ConfigError::UnterminatedQuote`] or [`ConfigError::IncludeCycle`].
    pub fn parse_file(&self, path: &Path) -> Result<ParsedCommandFile, ConfigError> {
        let mut state = ParseState::default();
        state.parse(path)?;

        let ParseState {
            macros,
            raw,
            included,
            ..
        } = state;

        let commands = raw
            .into_iter()
            .map(|cmd| {
                let args = expand_macros(&macros, &cmd)?;
                Ok(FileCommand { args, ..cmd })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        debug!(
            file = %path.display(),
            commands = commands.len(),
            includes = included.len(),
            "parsed command file"
        );
        Ok(ParsedCommandFile {
            commands,
            included_files: included,
        })
    }
}

impl ParseState {
    fn parse(&mut self, path: &Path) -> Result<(), ConfigError> {
        let canonical = fs::canonicalize(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        if self.stack.contains(&canonical) {
            return Err(ConfigError::IncludeCycle(path.to_path_buf()));
        }
        let content = fs::read_to_string(&canonical).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        self.stack.push(canonical);
        let result = self.parse_lines(path, &content);
        self.stack.pop();
        result
    }

    fn parse_lines(&mut self, path: &Path, content: &str) -> Result<(), ConfigError> {
        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tokens = tokenize(line)?;
            let syntax = |reason: &str| ConfigError::Syntax {
                path: path.to_path_buf(),
                line: line_no,
                reason: reason.to_string(),
            };

            match tokens.first().map(String::as_str) {
                Some("MACRO") => {
                    if tokens.len() < 4 || tokens[2] != "=" {
                        return Err(syntax("expected 'MACRO <name> = <tokens>'"));
                    }
                    let name = tokens[1].clone();
                    if self.macros.contains_key(&name) {
                        return Err(syntax(&format!("macro '{name}' redefined")));
                    }
                    self.macros.insert(name, tokens[3..].to_vec());
                }
                Some("INCLUDE") => {
                    if tokens.len() != 2 {
                        return Err(syntax("expected 'INCLUDE <path>'"));
                    }
                    let target = resolve_include(path, &tokens[1]);
                    if !self.included.contains(&target) {
                        self.included.push(target.clone());
                    }
                    self.parse(&target)?;
                }
                Some(_) => self.raw.push(FileCommand {
                    args: tokens,
                    source: path.to_path_buf(),
                    line: line_no,
                }),
                None => {}
            }
        }
        Ok(())
    }
}

fn resolve_include(including: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    including
        .parent()
        .map_or_else(|| target.to_path_buf(), |dir| dir.join(target))
}

/// `name()` → macro name, for tokens of that exact shape.
fn macro_call(token: &str) -> Option<&str> {
    token.strip_suffix("()").filter(|name| !name.is_empty())
}

fn expand_macros(
    macros: &HashMap<String, Vec<String>>,
    cmd: &FileCommand,
) -> Result<Vec<String>, ConfigError> {
    let mut args = cmd.args.clone();
    for _ in 0..MAX_MACRO_DEPTH {
        if !args.iter().any(|t| macro_call(t).is_some()) {
            return Ok(args);
        }
        let mut expanded = Vec::with_capacity(args.len());
        for token in args {
            match macro_call(&token) {
                Some(name) => match macros.get(name) {
                    Some(body) => expanded.extend(body.iter().cloned()),
                    None => {
                        return Err(ConfigError::Syntax {
                            path: cmd.source.clone(),
                            line: cmd.line,
                            reason: format!("unknown macro '{name}'"),
                        })
                    }
                },
                None => expanded.push(token),
            }
        }
        args = expanded;
    }
    Err(ConfigError::Syntax {
        path: cmd.source.clone(),
        line: cmd.line,
        reason: "macro expansion too deep".to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
