//! Command model: turning an argument vector into a [`Configuration`].
//!
//! The scheduler treats a configuration as mostly opaque.  It only reads the
//! fields declared here: scheduling flags ([`CommandOptions`]), the device
//! filter ([`DeviceRequirements`]), run-time device options and the
//! pass-through arguments handed to the invocation runner.
//!
//! Construction goes through an injected [`ConfigurationFactory`] so tests
//! and embedders can restrict which configuration names exist.

pub mod error;
pub mod file;
pub mod options;
pub mod tokenizer;

pub use error::ConfigError;
pub use file::{CommandFileParser, ParsedCommandFile};
pub use options::{CommandOptions, DeviceSelectionArgs};
pub use tokenizer::{combine_tokens, tokenize};

use std::collections::BTreeSet;
use std::io::{self, Write};

use clap::{CommandFactory, FromArgMatches};
use serde::Serialize;

use crate::device::{DeviceOptions, DeviceRequirements};
use options::ParsedArgs;

// ── Configuration ─────────────────────────────────────────────────────────────

/// A fully parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// First token of the command line.
    pub name: String,
    pub command_options: CommandOptions,
    pub device_requirements: DeviceRequirements,
    pub device_options: DeviceOptions,
    /// Arguments passed through to the invocation runner.
    pub test_args: Vec<String>,
}

impl Configuration {
    /// A configuration with default options and no pass-through arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_options: CommandOptions::default(),
            device_requirements: DeviceRequirements::default(),
            device_options: DeviceOptions::default(),
            test_args: Vec::new(),
        }
    }

    /// Semantic checks that clap's typed parsing cannot express.
    ///
    /// # Errors
    /// [`ConfigError::MissingConfigName`] or [`ConfigError::InvalidOption`].
    pub fn validate_options(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingConfigName);
        }
        if let Some(level) = self.device_requirements.min_battery {
            check_percent("min-battery", level)?;
        }
        if let Some(level) = self.device_options.cutoff_battery {
            check_percent("cutoff-battery", level)?;
        }
        if let Some(serial) = self
            .device_requirements
            .serials
            .iter()
            .find(|s| self.device_requirements.exclude_serials.contains(s))
        {
            return Err(ConfigError::InvalidOption {
                option: "serial",
                reason: format!("'{serial}' is both required and excluded"),
            });
        }
        Ok(())
    }

    /// Write an XML rendering of this configuration.
    pub fn dump_xml<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let opts = &self.command_options;
        let req = &self.device_requirements;

        writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(out, r#"<configuration name="{}">"#, xml_escape(&self.name))?;

        writeln!(out, "  <command_options>")?;
        write_option(out, "loop", opts.loop_mode)?;
        write_option(out, "min-loop-time", opts.min_loop_time_ms)?;
        if let Some(max) = opts.max_random_loop_time_ms {
            write_option(out, "max-random-loop-time", max)?;
        }
        write_option(out, "all-devices", opts.all_devices)?;
        write_option(out, "dry-run", opts.is_dry_run())?;
        write_option(
            out,
            "bugreport-on-invocation-ended",
            opts.bugreport_on_invocation_ended,
        )?;
        writeln!(out, "  </command_options>")?;

        writeln!(out, "  <device_requirements>")?;
        for serial in &req.serials {
            write_option(out, "serial", serial)?;
        }
        for serial in &req.exclude_serials {
            write_option(out, "exclude-serial", serial)?;
        }
        if let Some(product) = &req.product_type {
            write_option(out, "product-type", product)?;
        }
        if let Some(level) = req.min_battery {
            write_option(out, "min-battery", level)?;
        }
        if let Some(level) = self.device_options.cutoff_battery {
            write_option(out, "cutoff-battery", level)?;
        }
        writeln!(out, "  </device_requirements>")?;

        for arg in &self.test_args {
            writeln!(out, r#"  <arg value="{}" />"#, xml_escape(arg))?;
        }
        writeln!(out, "</configuration>")
    }
}

fn check_percent(option: &'static str, level: u8) -> Result<(), ConfigError> {
    if level > 100 {
        return Err(ConfigError::InvalidOption {
            option,
            reason: format!("{level} is not a percentage"),
        });
    }
    Ok(())
}

fn write_option<W: Write>(out: &mut W, name: &str, value: impl ToString) -> io::Result<()> {
    writeln!(
        out,
        r#"    <option name="{}" value="{}" />"#,
        name,
        xml_escape(&value.to_string())
    )
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

// ── Factory ───────────────────────────────────────────────────────────────────

/// Builds configurations from argument vectors.
pub trait ConfigurationFactory: Send + Sync {
    /// Parse `args` (first element = configuration name).
    ///
    /// # Errors
    /// Any [`ConfigError`] describing why `args` is not a valid command.
    fn create_configuration_from_args(&self, args: &[String]) -> Result<Configuration, ConfigError>;

    /// Usage text for the configuration named by `args[0]`.
    ///
    /// `important_only` selects the short form (`--help`) over the full one
    /// (`--help-all`).
    fn help_for_config(&self, args: &[String], important_only: bool) -> String;

    /// JSON description of the options `config` accepts.
    fn json_usage(&self, config: &Configuration) -> serde_json::Result<String>;
}

/// Factory backed by the clap declarations in [`options`].
#[derive(Debug, Clone, Default)]
pub struct ArgsConfigurationFactory {
    /// When set, only these configuration names are accepted.
    known_configs: Option<BTreeSet<String>>,
    /// Keep unrecognised flags as pass-through arguments instead of failing.
    allow_leftovers: bool,
}

impl ArgsConfigurationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_configs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_configs = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn allow_leftovers(mut self, allow: bool) -> Self {
        self.allow_leftovers = allow;
        self
    }
}

/// Split `rest` into tokens clap knows how to parse and unrecognised flags.
///
/// Values of known value-taking flags travel with their flag; everything after
/// a bare `--` is positional.
fn split_unknown_flags(cmd: &clap::Command, rest: &[String]) -> (Vec<String>, Vec<String>) {
    let mut known = Vec::with_capacity(rest.len());
    let mut unknown = Vec::new();
    let mut iter = rest.iter();

    while let Some(token) = iter.next() {
        if token == "--" {
            known.push(token.clone());
            known.extend(iter.by_ref().cloned());
            break;
        }
        let arg = if let Some(long) = token.strip_prefix("--") {
            let name = long.split_once('=').map_or(long, |(n, _)| n);
            cmd.get_arguments().find(|a| a.get_long() == Some(name))
        } else if let Some(short) = token.strip_prefix('-').filter(|s| !s.is_empty()) {
            let c = short.chars().next();
            cmd.get_arguments().find(|a| a.get_short() == c)
        } else {
            known.push(token.clone());
            continue;
        };

        match arg {
            Some(arg) => {
                known.push(token.clone());
                let inline = token.contains('=') || (!token.starts_with("--") && token.len() > 2);
                if arg.get_action().takes_values() && !inline {
                    if let Some(value) = iter.next() {
                        known.push(value.clone());
                    }
                }
            }
            None => unknown.push(token.clone()),
        }
    }
    (known, unknown)
}

impl ConfigurationFactory for ArgsConfigurationFactory {
    fn create_configuration_from_args(&self, args: &[String]) -> Result<Configuration, ConfigError> {
        let (name, rest) = args.split_first().ok_or(ConfigError::MissingConfigName)?;
        if name.trim().is_empty() {
            return Err(ConfigError::MissingConfigName);
        }
        if let Some(known) = &self.known_configs {
            if !known.contains(name) {
                return Err(ConfigError::UnknownConfig(name.clone()));
            }
        }

        let cmd = ParsedArgs::command();
        let (known, leftovers) = split_unknown_flags(&cmd, rest);
        if !leftovers.is_empty() && !self.allow_leftovers {
            return Err(ConfigError::Unconsumed {
                config: name.clone(),
                args: leftovers,
            });
        }

        let invalid = |e: clap::Error| ConfigError::InvalidArgs {
            config: name.clone(),
            message: e
                .to_string()
                .lines()
                .next()
                .unwrap_or_default()
                .trim_start_matches("error: ")
                .to_string(),
        };
        let matches = cmd
            .no_binary_name(true)
            .try_get_matches_from(&known)
            .map_err(invalid)?;
        let parsed = ParsedArgs::from_arg_matches(&matches).map_err(invalid)?;

        let mut test_args = parsed.extra;
        test_args.extend(leftovers);
        Ok(Configuration {
            name: name.clone(),
            device_requirements: DeviceRequirements::from(&parsed.device),
            device_options: DeviceOptions::from(&parsed.device),
            command_options: parsed.command,
            test_args,
        })
    }

    fn help_for_config(&self, args: &[String], important_only: bool) -> String {
        let name = args.first().cloned().unwrap_or_else(|| "command".to_string());
        let mut cmd = ParsedArgs::command().bin_name(name);
        let help = if important_only {
            cmd.render_help()
        } else {
            cmd.render_long_help()
        };
        help.to_string()
    }

    fn json_usage(&self, config: &Configuration) -> serde_json::Result<String> {
        let cmd = ParsedArgs::command();
        let options = cmd
            .get_arguments()
            .filter(|a| !a.is_positional())
            .map(|a| OptionUsage {
                name: a.get_long().unwrap_or(a.get_id().as_str()).to_string(),
                short: a.get_short(),
                description: a.get_help().map(|h| h.to_string()).unwrap_or_default(),
                takes_value: a.get_action().takes_values(),
                default: a
                    .get_default_values()
                    .first()
                    .map(|v| v.to_string_lossy().into_owned()),
            })
            .collect();
        serde_json::to_string_pretty(&CommandUsage {
            config: &config.name,
            options,
        })
    }
}

#[derive(Serialize)]
struct CommandUsage<'a> {
    config: &'a str,
    options: Vec<OptionUsage>,
}

#[derive(Serialize)]
struct OptionUsage {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    short: Option<char>,
    description: String,
    takes_value: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<String>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
