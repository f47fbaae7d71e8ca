/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Human-readable views of the scheduler state.

use std::env;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use super::tracker::by_id;
use super::{CommandScheduler, SchedulerError};

/// `1h:02:03` when at least an hour, `2m:03` otherwise.
pub fn format_time(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, mins, secs) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if hours > 0 {
        format!("{hours}h:{mins:02}:{secs:02}")
    } else {
        format!("{mins}m:{secs:02}")
    }
}

/// Left-aligned columns separated by two spaces.
fn format_table(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|c| {
            rows.iter()
                .filter_map(|r| r.get(c))
                .map(|cell| cell.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (cell, width) in row.iter().zip(&widths) {
            line.push_str(&format!("{cell:<width$}  "));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn header(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| (*c).to_string()).collect()
}

fn compile_filter(filter: Option<&str>) -> Result<Option<Regex>, SchedulerError> {
    Ok(filter.map(Regex::new).transpose()?)
}

impl CommandScheduler {
    /// Running invocations, one row each.  Empty when nothing runs.
    pub fn invocations_table(&self) -> String {
        let mut threads = self.invocation_threads();
        if threads.is_empty() {
            return String::new();
        }
        threads.sort_by_key(|t| t.command().command_id());

        let mut rows = vec![header(&["Command Id", "Exec Time", "Device", "State"])];
        rows.extend(threads.iter().map(|t| {
            vec![
                t.command().command_id().to_string(),
                format_time(t.elapsed()),
                t.device().serial().to_string(),
                t.status().to_string(),
            ]
        }));
        format_table(&rows)
    }

    /// Every executing, ready and sleeping command.  Empty when idle.
    pub fn command_queue_table(&self) -> String {
        let commands = self.all_commands();
        if commands.is_empty() {
            return String::new();
        }

        let mut rows = vec![header(&[
            "Id",
            "Config",
            "Created",
            "Exec time",
            "State",
            "Sleep time",
            "Rescheduled",
            "Loop",
        ])];
        rows.extend(commands.iter().map(|(cmd, state)| {
            vec![
                cmd.command_id().to_string(),
                cmd.tracker().config_name().to_string(),
                format_time(cmd.age()),
                format_time(cmd.tracker().total_exec_time()),
                state.display_name().to_string(),
                cmd.sleep_time()
                    .map_or_else(|| "N/A".to_string(), format_time),
                cmd.is_rescheduled().to_string(),
                cmd.is_loop_mode().to_string(),
            ]
        }));
        format_table(&rows)
    }

    /// One line per distinct command, by id, optionally only those whose
    /// space-joined arguments match `filter`.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidFilter`] for a malformed regex.
    pub fn commands_info(&self, filter: Option<&str>) -> Result<Vec<String>, SchedulerError> {
        let filter = compile_filter(filter)?;
        let mut trackers = self.command_trackers();
        trackers.sort_by(|a, b| by_id(a, b));
        Ok(trackers
            .iter()
            .filter_map(|t| {
                let args = t.args().join(" ");
                if filter.as_ref().is_some_and(|re| !re.is_match(&args)) {
                    return None;
                }
                Some(format!(
                    "Command {}: [{}] {}",
                    t.id(),
                    format_time(t.total_exec_time()),
                    args
                ))
            })
            .collect())
    }

    /// [`dump_commands_xml_to`](Self::dump_commands_xml_to) the system temp
    /// directory.
    pub fn dump_commands_xml(&self, filter: Option<&str>) -> Result<Vec<PathBuf>, SchedulerError> {
        self.dump_commands_xml_to(&env::temp_dir(), filter)
    }

    /// Write the configuration of every queued or running command to its own
    /// XML file in `dir`, returning the paths written.
    ///
    /// Files are named `config__<name>__<random>.xml` where `<name>` is the
    /// configuration name, or the value of `--template:map test <name>` when
    /// present, with `/` replaced by `__`.
    pub fn dump_commands_xml_to(
        &self,
        dir: &Path,
        filter: Option<&str>,
    ) -> Result<Vec<PathBuf>, SchedulerError> {
        let filter = compile_filter(filter)?;
        let mut written = Vec::new();
        for (cmd, _) in self.all_commands() {
            let args = cmd.tracker().args();
            if filter
                .as_ref()
                .is_some_and(|re| !re.is_match(&args.join(" ")))
            {
                continue;
            }

            let config = cmd.configuration();
            let name = args
                .windows(3)
                .find(|w| w[0] == "--template:map" && w[1] == "test")
                .map_or(config.name.as_str(), |w| w[2].as_str())
                .replace('/', "__");

            let file = tempfile::Builder::new()
                .prefix(&format!("config__{name}__"))
                .suffix(".xml")
                .tempfile_in(dir)?;
            let (file, path) = file.keep().map_err(|e| e.error)?;
            let mut out = BufWriter::new(file);
            config.dump_xml(&mut out)?;
            out.flush()?;

            debug!(command_id = cmd.command_id(), path = %path.display(), "dumped command");
            println!("Saved command dump to {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
