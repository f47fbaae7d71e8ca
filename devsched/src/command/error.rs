/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Configuration errors – everything that can be wrong with a submitted
//! command before it ever reaches the queue.
//!
//! These are surfaced synchronously to the caller of `add_command` /
//! `add_command_file`; they never stop the scheduler.

use std::path::PathBuf;

use thiserror::Error;

/// Why a command line (or a command file) could not be turned into a
/// [`Configuration`](super::Configuration).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The argument vector was empty – there is no configuration name.
    #[error("no configuration name given")]
    MissingConfigName,

    /// The configuration name is not one the factory knows about.
    #[error("unknown configuration '{0}'")]
    UnknownConfig(String),

    /// Option parsing failed (unknown flag, missing value, bad number …).
    ///
    /// Carries clap's rendered message so the caller can print it verbatim.
    #[error("invalid arguments for '{config}': {message}")]
    InvalidArgs { config: String, message: String },

    /// Positional arguments were left over and the factory does not tolerate
    /// them.
    #[error("unconsumed arguments for '{config}': {args:?}")]
    Unconsumed { config: String, args: Vec<String> },

    /// An option value parsed but is semantically invalid.
    #[error("invalid value for option '{option}': {reason}")]
    InvalidOption { option: &'static str, reason: String },

    /// A command line contains an unterminated quote.
    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),

    /// A command file could not be read.
    #[error("failed to read command file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A command file line is malformed.
    #[error("{path}:{line}: {reason}")]
    Syntax {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// A command file includes itself, directly or transitively.
    #[error("include cycle detected at {0}")]
    IncludeCycle(PathBuf),

    /// One command inside a command file was rejected.
    #[error("failed to add command '{command}': {source}")]
    InFile {
        command: String,
        #[source]
        source: Box<ConfigError>,
    },
}
