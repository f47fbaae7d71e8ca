/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Command-file change detection.
//!
//! Polls the modification time of every watched command file and of the
//! files it includes.  When any of them changes, the listener (the
//! scheduler) is told to reload the top-level file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Receives reload requests for changed command files.
pub trait CommandFileListener: Send + Sync {
    fn notify_file_changed(&self, file: &Path, extra_args: Vec<String>);
}

#[derive(Debug)]
struct WatchedFile {
    extra_args: Vec<String>,
    /// The file itself followed by its includes, with the last seen mtime.
    dependencies: Vec<(PathBuf, Option<SystemTime>)>,
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[derive(Debug)]
pub struct CommandFileWatcher {
    files: Mutex<HashMap<PathBuf, WatchedFile>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl CommandFileWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchedFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch `file` (and `includes`), replacing any previous registration.
    pub fn add_cmd_file(&self, file: &Path, extra_args: Vec<String>, includes: &[PathBuf]) {
        let dependencies = std::iter::once(file)
            .chain(includes.iter().map(PathBuf::as_path))
            .map(|p| (p.to_path_buf(), modified(p)))
            .collect();
        debug!(file = %file.display(), includes = includes.len(), "watching command file");
        self.files().insert(
            file.to_path_buf(),
            WatchedFile {
                extra_args,
                dependencies,
            },
        );
    }

    pub fn is_file_watched(&self, file: &Path) -> bool {
        self.files().contains_key(file)
    }

    pub fn extra_args_for_file(&self, file: &Path) -> Option<Vec<String>> {
        self.files().get(file).map(|w| w.extra_args.clone())
    }

    pub fn remove_all_files(&self) {
        self.files().clear();
    }

    /// Files whose own mtime or an include's mtime changed since the last
    /// check, with their extra arguments.  The new mtimes are recorded, so a
    /// change is reported once.
    pub fn check_for_updates(&self) -> Vec<(PathBuf, Vec<String>)> {
        let mut files = self.files();
        let mut changed = Vec::new();
        for (file, watched) in files.iter_mut() {
            let mut dirty = false;
            for (path, last) in watched.dependencies.iter_mut() {
                let now = modified(path);
                if now != *last {
                    debug!(path = %path.display(), "command file dependency changed");
                    *last = now;
                    dirty = true;
                }
            }
            if dirty {
                changed.push((file.clone(), watched.extra_args.clone()));
            }
        }
        changed
    }

    /// Start polling on `runtime` until [`cancel`](Self::cancel) or until the
    /// listener is dropped.
    pub fn start(
        self: &Arc<Self>,
        runtime: &Handle,
        listener: Weak<dyn CommandFileListener>,
    ) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        info!(interval_ms = watcher.poll_interval.as_millis() as u64, "command file watcher started");
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(watcher.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = watcher.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let changed = watcher.check_for_updates();
                let Some(listener) = listener.upgrade() else {
                    break;
                };
                for (file, extra_args) in changed {
                    listener.notify_file_changed(&file, extra_args);
                }
            }
            debug!("command file watcher stopped");
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
