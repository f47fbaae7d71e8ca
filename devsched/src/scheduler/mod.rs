//! Command scheduler.
//!
//! [`CommandScheduler`] owns the command queue and drives it against a
//! [`DevicePool`]: every command waits in the ready set until a matching
//! device is free, then runs on a blocking worker as an [`InvocationThread`].
//! Ready commands are served least-cumulative-execution-time first, so a
//! command that has run for a long time yields to ones that have not.
//!
//! ```text
//!            add_command / add_command_file / remote AddCommand
//!                               │
//!                 delay > 0 ┌───┴───┐ delay == 0
//!                           ▼       ▼
//!                      sleeping ──► ready ──(device allocated)──► executing
//!                        ▲  timer                                    │
//!                        └──── loop mode / reschedule ◄──────────────┘
//! ```
//!
//! # Concurrency
//!
//! | Actor | Runs on |
//! |---|---|
//! | Main loop | one tokio task, woken by [`WaitObj`] or the poll timeout |
//! | Invocations | `spawn_blocking` workers, one per leased device |
//! | Sleep timers | one tokio task per sleeping command |
//! | Command file watcher | one tokio task while reloading is enabled |
//! | Remote control | tonic server tasks |
//!
//! All queue state lives behind a single `std::sync::Mutex`; no lock is held
//! across an `.await`.
//!
//! # Shutdown
//!
//! * [`shutdown`](CommandScheduler::shutdown) drops all queued commands and
//!   lets running invocations finish.
//! * [`shutdown_on_empty`](CommandScheduler::shutdown_on_empty) keeps
//!   scheduling until nothing is ready, sleeping or executing.
//! * [`shutdown_hard`](CommandScheduler::shutdown_hard) also stops every
//!   running invocation.
//! * [`handover_shutdown`](CommandScheduler::handover_shutdown) first moves
//!   devices and commands to another instance over the remote channel.

pub mod display;
pub mod error;
pub mod invocation;
pub mod tracker;
pub mod wait;
pub mod watcher;

pub use error::{InvocationError, SchedulerError};
pub use invocation::{
    InvocationContext, InvocationRunner, InvocationStatus, InvocationThread, Rescheduler,
    ScheduledInvocationListener,
};
pub use tracker::{CommandState, CommandTracker, ExecutableCommand};
pub use wait::WaitObj;
pub use watcher::{CommandFileListener, CommandFileWatcher};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::command::{
    combine_tokens, CommandFileParser, ConfigError, Configuration, ConfigurationFactory,
};
use crate::config::SchedulerConfig;
use crate::device::{AllocationState, DeviceDescriptor, DeviceHandle, DevicePool, FreeDeviceState};
use crate::remote::{RemoteClient, RemoteCommandHandler, RemoteError, RemoteManager};

use invocation::{DeviceRelease, InvocationOutcome};
use tracker::by_exec_time;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Internal state ────────────────────────────────────────────────────────────

struct InvocationEntry {
    thread: Arc<InvocationThread>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    started: bool,
    runtime: Option<Handle>,

    ready: Vec<ExecutableCommand>,
    sleeping: Vec<ExecutableCommand>,
    /// Wake-up timers of sleeping commands, by exec id.
    timers: HashMap<u64, AbortHandle>,
    executing: BTreeMap<u64, ExecutableCommand>,
    /// Running invocations by device serial.
    invocations: HashMap<String, InvocationEntry>,

    current_command_id: u32,
    next_exec_id: u64,

    /// Set by `shutdown`: the loop exits as soon as it notices.
    timer_shutdown: bool,
    /// Set by `shutdown_on_empty`: the loop exits once all sets are empty.
    shutdown_on_empty: bool,
    performing_handover: bool,

    /// Client to the peer instance during (either side of) a handover.
    remote_client: Option<RemoteClient>,
    remote_port: Option<u16>,
    /// Devices allocated on behalf of a remote peer.
    remote_devices: HashMap<String, DeviceHandle>,
    /// Devices announced to the handover peer that it has not been told are
    /// free yet.
    handed_devices: HashSet<String>,

    loop_handle: Option<JoinHandle<()>>,
    watcher_task: Option<JoinHandle<()>>,
}

impl State {
    fn all_commands_size(&self) -> usize {
        self.ready.len() + self.sleeping.len() + self.executing.len()
    }

    fn is_shutdown(&self) -> bool {
        self.timer_shutdown || (self.shutdown_on_empty && self.all_commands_size() == 0)
    }

    fn is_shutting_down(&self) -> bool {
        self.timer_shutdown || self.shutdown_on_empty
    }

    fn cancel_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }

    /// Distinct trackers: executing first, then ready, then sleeping.
    fn command_trackers(&self) -> Vec<Arc<CommandTracker>> {
        let mut seen = HashSet::new();
        self.executing
            .values()
            .chain(&self.ready)
            .chain(&self.sleeping)
            .map(|cmd| Arc::clone(cmd.tracker()))
            .filter(|t| seen.insert(t.id()))
            .collect()
    }

    fn clear_queued_commands(&mut self) {
        self.cancel_timers();
        self.ready.clear();
        self.sleeping.clear();
    }
}

/// Number of commands in each scheduler set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSizes {
    pub ready: usize,
    pub sleeping: usize,
    pub executing: usize,
}

// ── CommandScheduler ──────────────────────────────────────────────────────────

/// Schedules test commands onto devices.
///
/// Always handled through an `Arc`; see [`CommandScheduler::new`].
pub struct CommandScheduler {
    this: Weak<CommandScheduler>,
    pool: Arc<dyn DevicePool>,
    factory: Arc<dyn ConfigurationFactory>,
    runner: Arc<dyn InvocationRunner>,
    config: SchedulerConfig,
    parser: CommandFileParser,
    watcher: Arc<CommandFileWatcher>,

    state: Mutex<State>,
    listeners: Mutex<Vec<Arc<dyn ScheduledInvocationListener>>>,
    remote_manager: tokio::sync::Mutex<Option<RemoteManager>>,
    /// Held while devices are announced to a handover peer, so a device
    /// freed meanwhile is reported only after its allocation went out.
    handover_send: tokio::sync::Mutex<()>,

    /// Wakes the main loop: new ready command, freed device, shutdown.
    command_process_wait: WaitObj,
    /// Raised once the main loop is running.
    run_latch: WaitObj,
    /// Raised when the peer reports that handover initiation is complete.
    handover_handshake: WaitObj,
}

impl CommandScheduler {
    pub fn new(
        pool: Arc<dyn DevicePool>,
        factory: Arc<dyn ConfigurationFactory>,
        runner: Arc<dyn InvocationRunner>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let watcher = Arc::new(CommandFileWatcher::new(
            config.scheduler.cmdfile_poll_interval(),
        ));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pool,
            factory,
            runner,
            config,
            parser: CommandFileParser::new(),
            watcher,
            state: Mutex::new(State::default()),
            listeners: Mutex::new(Vec::new()),
            remote_manager: tokio::sync::Mutex::new(None),
            handover_send: tokio::sync::Mutex::new(()),
            command_process_wait: WaitObj::new(),
            run_latch: WaitObj::new(),
            handover_handshake: WaitObj::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn ensure_started(&self) -> Result<(), SchedulerError> {
        if self.state().started {
            Ok(())
        } else {
            Err(SchedulerError::NotStarted)
        }
    }

    fn runtime(&self) -> Result<Handle, SchedulerError> {
        self.state().runtime.clone().ok_or(SchedulerError::NotStarted)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Start the main loop on the current tokio runtime.
    ///
    /// When the remote channel is configured to start on boot, it is brought
    /// up (and an automatic handover attempted) before the loop begins.
    ///
    /// # Errors
    /// [`SchedulerError::NoRuntime`] outside a runtime,
    /// [`SchedulerError::AlreadyStarted`] on a second call.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let this = self.this.upgrade().ok_or(SchedulerError::ShuttingDown)?;
        {
            let mut st = self.state();
            if st.started {
                return Err(SchedulerError::AlreadyStarted);
            }
            st.started = true;
            st.runtime = Some(runtime.clone());
        }

        let weak = self.this.clone();
        self.pool.add_monitor(Arc::new(move |serial: &str| {
            if let Some(scheduler) = weak.upgrade() {
                debug!(serial, "device available, waking scheduler");
                scheduler.command_process_wait.signal();
            }
        }));

        self.start_remote_manager().await;

        let handle = runtime.spawn(this.run_loop());
        self.state().loop_handle = Some(handle);
        Ok(())
    }

    /// Wait until the main loop has started.
    pub async fn await_running(&self) {
        self.run_latch.wait_for_event(None).await;
    }

    /// Wait for the main loop to exit and teardown to finish.
    pub async fn join(&self) {
        let handle = self.state().loop_handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop terminated abnormally");
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        self.run_latch.signal();
        info!(
            poll_ms = self.config.scheduler.max_poll_time_ms,
            "command scheduler running"
        );
        let poll = self.config.scheduler.max_poll_time();
        while !self.is_shutdown() {
            self.command_process_wait.wait_and_reset(poll).await;
            self.check_invocations();
            self.process_ready_commands();
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.state().cancel_timers();

        info!("waiting for invocation threads to complete");
        loop {
            let handles: Vec<JoinHandle<()>> = self
                .state()
                .invocations
                .values_mut()
                .filter_map(|e| e.handle.take())
                .collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "invocation worker terminated abnormally");
                }
            }
        }

        self.close_remote_client().await;
        let manager = self.remote_manager.lock().await.take();
        if let Some(manager) = manager {
            manager.cancel_and_wait().await;
        }
        self.state().remote_port = None;

        self.watcher.cancel();
        let watcher_task = self.state().watcher_task.take();
        if let Some(task) = watcher_task {
            let _ = task.await;
        }

        self.pool.terminate();
        info!("All done");
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Whether the main loop will exit (or has exited).
    pub fn is_shutdown(&self) -> bool {
        self.state().is_shutdown()
    }

    /// Whether any shutdown mode has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.state().is_shutting_down()
    }

    /// Stop accepting work, drop all queued commands and let running
    /// invocations finish.  Idempotent.
    pub fn shutdown(&self) {
        let mut st = self.state();
        if !st.started {
            warn!("shutdown requested before the scheduler was started");
        }
        if st.timer_shutdown {
            return;
        }
        info!("initiating scheduler shutdown");
        if self.config.scheduler.reload_cmdfiles {
            self.watcher.remove_all_files();
            self.watcher.cancel();
        }
        st.clear_queued_commands();
        st.timer_shutdown = true;
        drop(st);
        self.command_process_wait.signal();
    }

    /// Keep scheduling until no command is ready, sleeping or executing,
    /// then shut down.  Looping commands keep the scheduler alive forever.
    pub fn shutdown_on_empty(&self) {
        let mut st = self.state();
        if st.is_shutting_down() {
            return;
        }
        info!("scheduler will shut down once the queue is empty");
        st.shutdown_on_empty = true;
        drop(st);
        self.command_process_wait.signal();
    }

    /// [`shutdown`](Self::shutdown), then stop every running invocation and
    /// terminate the device pool hard.
    pub fn shutdown_hard(&self) {
        self.shutdown();
        warn!("stopping all running invocations");
        for thread in self.invocation_threads() {
            thread.stop_invocation("scheduler is shutting down");
        }
        self.pool.terminate_hard();
    }

    // ── Adding commands ───────────────────────────────────────────────────────

    /// Add a command to the queue.
    ///
    /// Returns `Ok(false)` when nothing was queued: the command was only a
    /// help or dry-run request, or the scheduler is already shut down.
    ///
    /// # Errors
    /// [`SchedulerError::NotStarted`] or [`SchedulerError::Config`].
    pub fn add_command(&self, args: &[String]) -> Result<bool, SchedulerError> {
        self.add_command_with_exec_time(args, Duration::ZERO)
    }

    /// Like [`add_command`](Self::add_command), with the cumulative execution
    /// time the command already accrued elsewhere (handover).
    pub fn add_command_with_exec_time(
        &self,
        args: &[String],
        total_exec_time: Duration,
    ) -> Result<bool, SchedulerError> {
        self.ensure_started()?;
        self.internal_add_command(args, total_exec_time, None)
    }

    fn internal_add_command(
        &self,
        args: &[String],
        total_exec_time: Duration,
        cmd_file: Option<&Path>,
    ) -> Result<bool, SchedulerError> {
        let config = self.factory.create_configuration_from_args(args)?;
        let opts = &config.command_options;

        if opts.help {
            println!("{}", self.factory.help_for_config(args, true));
            return Ok(false);
        }
        if opts.help_all {
            println!("{}", self.factory.help_for_config(args, false));
            return Ok(false);
        }
        if opts.json_help {
            match self.factory.json_usage(&config) {
                Ok(json) => println!("{json}"),
                Err(e) => error!(error = %e, "failed to render usage as JSON"),
            }
            return Ok(false);
        }
        if opts.is_dry_run() {
            config.validate_options()?;
            let cmd_line = combine_tokens(args);
            debug!("dry run mode; skipping adding command: {cmd_line}");
            if opts.noisy_dry_run {
                println!("{}", cmd_line.replace("--noisy-dry-run", "").trim_end());
                println!();
            }
            return Ok(false);
        }

        config.validate_options()?;
        if opts.all_devices {
            self.add_command_for_all_devices(total_exec_time, args, cmd_file)?;
            return Ok(true);
        }
        let tracker = self.create_command_tracker(args.to_vec(), cmd_file);
        tracker.increment_exec_time(total_exec_time);
        let cmd = self.create_executable_command(tracker, config, false);
        Ok(self.add_exec_command_to_queue(cmd, Duration::ZERO))
    }

    /// One tracker per non-stub device, each pinned to that device's serial.
    fn add_command_for_all_devices(
        &self,
        total_exec_time: Duration,
        args: &[String],
        cmd_file: Option<&Path>,
    ) -> Result<(), SchedulerError> {
        for device in self.pool.list_devices().into_iter().filter(|d| !d.stub) {
            let mut device_args = args.to_vec();
            device_args.push("-s".to_string());
            device_args.push(device.serial.clone());
            let tracker = self.create_command_tracker(device_args, cmd_file);
            tracker.increment_exec_time(total_exec_time);

            let mut config = self.factory.create_configuration_from_args(tracker.args())?;
            info!(
                command_id = tracker.id(),
                serial = %device.serial,
                "scheduling '{}' on device",
                tracker.config_name()
            );
            config.device_requirements.set_serial(device.serial);
            let cmd = self.create_executable_command(tracker, config, false);
            self.add_exec_command_to_queue(cmd, Duration::ZERO);
        }
        Ok(())
    }

    fn create_command_tracker(
        &self,
        args: Vec<String>,
        cmd_file: Option<&Path>,
    ) -> Arc<CommandTracker> {
        let mut st = self.state();
        st.current_command_id += 1;
        let id = st.current_command_id;
        debug!(command_id = id, "creating command tracker");
        Arc::new(CommandTracker::new(id, args, cmd_file.map(Path::to_path_buf)))
    }

    fn create_executable_command(
        &self,
        tracker: Arc<CommandTracker>,
        config: Configuration,
        rescheduled: bool,
    ) -> ExecutableCommand {
        let mut st = self.state();
        st.next_exec_id += 1;
        ExecutableCommand::new(st.next_exec_id, tracker, config, rescheduled)
    }

    /// Queue `cmd`, sleeping for `delay` first if non-zero.  Returns `false`
    /// when the scheduler is shut down and the command was dropped.
    fn add_exec_command_to_queue(&self, mut cmd: ExecutableCommand, delay: Duration) -> bool {
        let mut st = self.state();
        if st.is_shutdown() {
            debug!(command_id = cmd.command_id(), "scheduler is shut down, dropping command");
            return false;
        }
        if delay.is_zero() {
            st.ready.push(cmd);
            drop(st);
            self.command_process_wait.signal();
            return true;
        }

        let Some(runtime) = st.runtime.clone() else {
            return false;
        };
        let exec_id = cmd.exec_id;
        debug!(
            command_id = cmd.command_id(),
            delay_ms = delay.as_millis() as u64,
            "command sleeping before it becomes ready"
        );
        cmd.set_sleep_until(Some(Instant::now() + delay));
        st.sleeping.push(cmd);
        let weak = self.this.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = weak.upgrade() {
                scheduler.wake_sleeping_command(exec_id);
            }
        });
        st.timers.insert(exec_id, timer.abort_handle());
        true
    }

    fn wake_sleeping_command(&self, exec_id: u64) {
        let mut st = self.state();
        st.timers.remove(&exec_id);
        let Some(pos) = st.sleeping.iter().position(|c| c.exec_id == exec_id) else {
            return;
        };
        let mut cmd = st.sleeping.remove(pos);
        cmd.set_sleep_until(None);
        debug!(command_id = cmd.command_id(), "sleeping command is ready");
        st.ready.push(cmd);
        drop(st);
        self.command_process_wait.signal();
    }

    /// Queue the next loop iteration of `tracker` after its loop delay.
    fn add_new_exec_command_to_queue(&self, tracker: &Arc<CommandTracker>) {
        match self.factory.create_configuration_from_args(tracker.args()) {
            Ok(config) => {
                let delay = config.command_options.loop_time();
                let cmd = self.create_executable_command(Arc::clone(tracker), config, false);
                self.add_exec_command_to_queue(cmd, delay);
            }
            Err(e) => {
                error!(command_id = tracker.id(), error = %e, "failed to re-create looping command");
            }
        }
    }

    // ── Command files ─────────────────────────────────────────────────────────

    /// Add every command in `path`, each with `extra_args` appended.
    ///
    /// With command-file reloading enabled, re-adding a watched file first
    /// removes the commands it previously contributed, and the file (plus its
    /// includes) is watched for further changes.  If any command fails, the
    /// commands this call already queued from the file are removed again.
    ///
    /// # Errors
    /// [`SchedulerError::Config`] for unreadable or malformed files and for
    /// invalid commands ([`ConfigError::InFile`]).
    pub fn add_command_file(&self, path: &Path, extra_args: &[String]) -> Result<(), SchedulerError> {
        self.ensure_started()?;
        let file = fs::canonicalize(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        if self.config.scheduler.reload_cmdfiles && self.watcher.is_file_watched(&file) {
            info!(file = %file.display(), "command file already watched, reloading");
            self.remove_commands_from_file(&file);
        }
        self.internal_add_command_file(&file, extra_args)
    }

    /// Whether the daemon should stop when a command file fails to load.
    pub fn should_shutdown_on_cmdfile_error(&self) -> bool {
        self.config.scheduler.shutdown_on_cmdfile_error
    }

    fn internal_add_command_file(
        &self,
        file: &Path,
        extra_args: &[String],
    ) -> Result<(), SchedulerError> {
        let parsed = self.parser.parse_file(file)?;
        if self.config.scheduler.reload_cmdfiles {
            self.watcher
                .add_cmd_file(file, extra_args.to_vec(), &parsed.included_files);
            self.ensure_watcher_started()?;
        }

        let first_id = self.state().current_command_id;
        for command in parsed.commands {
            let mut args = command.args;
            args.extend(extra_args.iter().cloned());
            let cmd_line = combine_tokens(&args);
            debug!(file = %file.display(), line = command.line, "adding command: {cmd_line}");
            if let Err(e) = self.internal_add_command(&args, Duration::ZERO, Some(file)) {
                self.remove_file_commands_after(file, first_id);
                return Err(match e {
                    SchedulerError::Config(source) => ConfigError::InFile {
                        command: cmd_line,
                        source: Box::new(source),
                    }
                    .into(),
                    other => other,
                });
            }
        }
        Ok(())
    }

    fn ensure_watcher_started(&self) -> Result<(), SchedulerError> {
        let mut st = self.state();
        if st.watcher_task.is_some() || st.is_shutting_down() {
            return Ok(());
        }
        let runtime = st.runtime.clone().ok_or(SchedulerError::NotStarted)?;
        let listener: Weak<dyn CommandFileListener> = self.this.clone();
        st.watcher_task = Some(self.watcher.start(&runtime, listener));
        Ok(())
    }

    /// Remove queued commands from `file` whose tracker is newer than
    /// `after_id` (the rollback of a partially applied file).
    fn remove_file_commands_after(&self, file: &Path, after_id: u32) {
        self.remove_queued_where(|cmd| {
            cmd.command_id() > after_id && cmd.tracker().command_file() == Some(file)
        });
    }

    /// Remove every ready or sleeping command that came from `file`.
    /// Executing commands are left to finish.
    fn remove_commands_from_file(&self, file: &Path) {
        self.remove_queued_where(|cmd| cmd.tracker().command_file() == Some(file));
    }

    fn remove_queued_where(&self, matches: impl Fn(&ExecutableCommand) -> bool) {
        let mut st = self.state();
        st.ready.retain(|c| !matches(c));
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut st.sleeping).into_iter().partition(|c| matches(c));
        st.sleeping = kept;
        for cmd in removed {
            if let Some(timer) = st.timers.remove(&cmd.exec_id) {
                timer.abort();
            }
        }
        let signal = st.is_shutting_down();
        drop(st);
        if signal {
            self.command_process_wait.signal();
        }
    }

    /// Drop every ready and sleeping command (and stop watching command
    /// files).  Running invocations are not affected.
    pub fn remove_all_commands(&self) {
        let mut st = self.state();
        debug!("removing all commands");
        if self.config.scheduler.reload_cmdfiles {
            self.watcher.remove_all_files();
        }
        st.clear_queued_commands();
        let signal = st.is_shutting_down();
        drop(st);
        if signal {
            self.command_process_wait.signal();
        }
    }

    // ── Main loop steps ───────────────────────────────────────────────────────

    fn check_invocations(&self) {
        for thread in self.invocation_threads() {
            thread.check_device_battery_level();
        }
    }

    /// Pair ready commands with free devices, least-executed first.
    fn process_ready_commands(&self) {
        let mut scheduled: Vec<(ExecutableCommand, DeviceHandle)> = Vec::new();
        let mut rejected: Vec<DeviceHandle> = Vec::new();
        {
            let mut st = self.state();
            // queued commands belong to the handover peer from now on
            if st.ready.is_empty() || st.performing_handover {
                return;
            }
            st.ready.sort_by(|a, b| by_exec_time(a.tracker(), b.tracker()));

            let ready = std::mem::take(&mut st.ready);
            for cmd in ready {
                let device = self
                    .pool
                    .allocate(&cmd.configuration().device_requirements);
                match device {
                    Some(device) if st.invocations.contains_key(device.serial()) => {
                        error!(
                            serial = device.serial(),
                            "pool allocated a device that is already running an invocation"
                        );
                        st.ready.push(cmd);
                        rejected.push(device);
                    }
                    Some(device) => {
                        st.executing.insert(cmd.exec_id, cmd.clone());
                        scheduled.push((cmd, device));
                    }
                    None => st.ready.push(cmd),
                }
            }
        }

        for device in rejected {
            self.pool.free(device, FreeDeviceState::Available);
        }

        for (cmd, device) in scheduled {
            if cmd.is_loop_mode() {
                self.add_new_exec_command_to_queue(cmd.tracker());
            }
            let exec_id = cmd.exec_id;
            let leased = Arc::clone(&device);
            if let Err(e) = self.start_invocation(device, cmd, DeviceRelease::ReturnToPool, None) {
                error!(error = %e, "failed to start invocation");
                self.state().executing.remove(&exec_id);
                self.pool.free(leased, FreeDeviceState::Available);
            }
        }
    }

    fn start_invocation(
        &self,
        device: DeviceHandle,
        cmd: ExecutableCommand,
        release: DeviceRelease,
        listener: Option<Arc<dyn ScheduledInvocationListener>>,
    ) -> Result<(), SchedulerError> {
        let this = self.this.upgrade().ok_or(SchedulerError::ShuttingDown)?;
        let mut listeners = lock(&self.listeners).clone();
        listeners.extend(listener);

        let serial = device.serial().to_string();
        let mut st = self.state();
        let runtime = st.runtime.clone().ok_or(SchedulerError::NotStarted)?;
        if st.invocations.contains_key(&serial) {
            return Err(SchedulerError::DeviceBusy { serial });
        }
        info!(
            command_id = cmd.command_id(),
            serial = %serial,
            "executing '{}' on device",
            cmd.tracker().config_name()
        );
        let thread = Arc::new(InvocationThread::new(cmd, device, release, listeners));
        let worker = Arc::clone(&thread);
        // Spawned under the lock so teardown always sees the join handle.
        let handle = runtime.spawn_blocking(move || this.run_invocation(worker));
        st.invocations.insert(
            serial,
            InvocationEntry {
                thread,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    /// Body of an invocation worker.
    fn run_invocation(self: Arc<Self>, thread: Arc<InvocationThread>) {
        let rescheduler = Arc::new(CommandRescheduler {
            scheduler: self.this.clone(),
            tracker: Arc::clone(thread.command().tracker()),
        });
        let outcome = thread.run(self.runner.as_ref(), rescheduler);
        if outcome.fatal {
            self.shutdown();
        }
        self.invocation_finished(&thread, outcome);
    }

    /// Completion bookkeeping, in order: registry, listeners, device
    /// release, execution time.
    fn invocation_finished(&self, thread: &Arc<InvocationThread>, outcome: InvocationOutcome) {
        let device = thread.device();
        let serial = device.serial().to_string();

        {
            let mut st = self.state();
            if st
                .invocations
                .get(&serial)
                .is_some_and(|e| Arc::ptr_eq(&e.thread, thread))
            {
                st.invocations.remove(&serial);
            }
        }

        for listener in &thread.listeners {
            let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.invocation_complete(device.as_ref(), outcome.state)
            }));
            if notified.is_err() {
                error!(serial = %serial, "invocation listener panicked");
            }
        }

        if thread.release == DeviceRelease::ReturnToPool {
            self.pool.free(Arc::clone(device), outcome.state);
            self.remote_free_device(&serial);
        }

        self.command_finished(thread.command(), outcome.elapsed);
    }

    fn command_finished(&self, cmd: &ExecutableCommand, elapsed: Duration) {
        cmd.tracker().increment_exec_time(elapsed);
        debug!(command_id = cmd.command_id(), "removing finished command");
        let signal = {
            let mut st = self.state();
            st.executing.remove(&cmd.exec_id);
            st.is_shutting_down()
        };
        if signal {
            self.command_process_wait.signal();
        }
    }

    // ── Direct execution ──────────────────────────────────────────────────────

    /// Run a command right now on any matching free device, bypassing the
    /// queue.  The device is freed when the invocation ends; `listener` is
    /// notified first.
    ///
    /// # Errors
    /// [`SchedulerError::NoDeviceAvailable`] when no device matches, plus
    /// the errors of [`add_command`](Self::add_command).
    pub fn exec_command(
        &self,
        listener: Arc<dyn ScheduledInvocationListener>,
        args: &[String],
    ) -> Result<(), SchedulerError> {
        self.ensure_started()?;
        let cmd = self.create_direct_command(args)?;
        let device = {
            let mut st = self.state();
            if st.performing_handover {
                return Err(SchedulerError::HandoverInProgress);
            }
            if st.timer_shutdown {
                return Err(SchedulerError::ShuttingDown);
            }
            let device = self
                .pool
                .allocate(&cmd.configuration().device_requirements)
                .ok_or_else(|| SchedulerError::NoDeviceAvailable {
                    command: combine_tokens(args),
                })?;
            st.executing.insert(cmd.exec_id, cmd.clone());
            device
        };
        self.start_direct(device, cmd, DeviceRelease::ReturnToPool, listener)
    }

    /// Run a command on a device the caller already holds.  The caller keeps
    /// ownership: the scheduler never frees it.
    pub fn exec_command_on_device(
        &self,
        listener: Arc<dyn ScheduledInvocationListener>,
        device: DeviceHandle,
        args: &[String],
    ) -> Result<(), SchedulerError> {
        self.ensure_started()?;
        let cmd = self.create_direct_command(args)?;
        {
            let mut st = self.state();
            if st.performing_handover {
                return Err(SchedulerError::HandoverInProgress);
            }
            if st.timer_shutdown {
                return Err(SchedulerError::ShuttingDown);
            }
            st.executing.insert(cmd.exec_id, cmd.clone());
        }
        self.start_direct(device, cmd, DeviceRelease::CallerOwned, listener)
    }

    fn create_direct_command(&self, args: &[String]) -> Result<ExecutableCommand, SchedulerError> {
        let config = self.factory.create_configuration_from_args(args)?;
        config.validate_options()?;
        let tracker = self.create_command_tracker(args.to_vec(), None);
        Ok(self.create_executable_command(tracker, config, false))
    }

    fn start_direct(
        &self,
        device: DeviceHandle,
        cmd: ExecutableCommand,
        release: DeviceRelease,
        listener: Arc<dyn ScheduledInvocationListener>,
    ) -> Result<(), SchedulerError> {
        let exec_id = cmd.exec_id;
        let result = self.start_invocation(Arc::clone(&device), cmd, release, Some(listener));
        if result.is_err() {
            self.state().executing.remove(&exec_id);
            if release == DeviceRelease::ReturnToPool {
                self.pool.free(device, FreeDeviceState::Available);
            }
        }
        result
    }

    /// Stop the running invocation of command `command_id`.  Returns whether
    /// one was found.
    pub fn stop_invocation(&self, command_id: u32) -> bool {
        let thread = self
            .invocation_threads()
            .into_iter()
            .find(|t| t.command().command_id() == command_id);
        match thread {
            Some(thread) => {
                thread.stop_invocation("stop requested");
                true
            }
            None => false,
        }
    }

    /// Register a listener told about every invocation started after this
    /// call.
    pub fn add_invocation_listener(&self, listener: Arc<dyn ScheduledInvocationListener>) {
        lock(&self.listeners).push(listener);
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn queue_sizes(&self) -> QueueSizes {
        let st = self.state();
        QueueSizes {
            ready: st.ready.len(),
            sleeping: st.sleeping.len(),
            executing: st.executing.len(),
        }
    }

    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.pool.list_devices()
    }

    /// Port of the running remote control server, if any.
    pub fn remote_port(&self) -> Option<u16> {
        self.state().remote_port
    }

    pub(crate) fn invocation_threads(&self) -> Vec<Arc<InvocationThread>> {
        self.state()
            .invocations
            .values()
            .map(|e| Arc::clone(&e.thread))
            .collect()
    }

    /// Every queued or running command with its state: executing, then
    /// ready, then sleeping.
    pub(crate) fn all_commands(&self) -> Vec<(ExecutableCommand, CommandState)> {
        let st = self.state();
        st.executing
            .values()
            .map(|c| (c.clone(), CommandState::Executing))
            .chain(st.ready.iter().map(|c| (c.clone(), CommandState::WaitingForDevice)))
            .chain(st.sleeping.iter().map(|c| (c.clone(), CommandState::Sleeping)))
            .collect()
    }

    /// Distinct trackers, in the order of [`all_commands`](Self::all_commands).
    pub(crate) fn command_trackers(&self) -> Vec<Arc<CommandTracker>> {
        self.state().command_trackers()
    }

    // ── Handover ──────────────────────────────────────────────────────────────

    /// Hand devices and commands over to the instance listening on `port`,
    /// then shut down.
    ///
    /// Sends, in order: every allocated device, every command (one
    /// add-command-file per watched file when reloading is enabled, one
    /// add-command with its accrued execution time otherwise), and the
    /// initiation-complete message.  Local dispatch is frozen from the start
    /// so nothing that was sent also runs here; devices and commands are
    /// captured in one snapshot.  Nothing is rolled back on failure, but
    /// local dispatch resumes.
    ///
    /// # Errors
    /// [`SchedulerError::HandoverInProgress`] when a handover was already
    /// initiated, [`SchedulerError::Remote`] when the peer is unreachable or
    /// rejects a message.
    pub async fn handover_shutdown(&self, port: u16) -> Result<(), SchedulerError> {
        self.ensure_started()?;
        {
            let mut st = self.state();
            if st.remote_client.is_some() || st.performing_handover {
                error!("a handover has already been initiated");
                return Err(SchedulerError::HandoverInProgress);
            }
            st.performing_handover = true;
        }

        let client = match RemoteClient::connect(port).await {
            Ok(client) => client,
            Err(e) => {
                error!(port, error = %e, "failed to connect to handover target");
                self.state().performing_handover = false;
                return Err(e.into());
            }
        };
        info!(port, "connected to handover target");

        let sent = async {
            let send_guard = self.handover_send.lock().await;
            let (devices, trackers) = {
                let mut st = self.state();
                st.remote_client = Some(client.clone());
                let devices: Vec<String> = self
                    .pool
                    .list_devices()
                    .into_iter()
                    .filter(|d| d.state == AllocationState::Allocated)
                    .map(|d| d.serial)
                    .collect();
                st.handed_devices = devices.iter().cloned().collect();
                (devices, st.command_trackers())
            };
            for serial in &devices {
                client.send_allocate_device(serial).await?;
                debug!(serial = %serial, "sent allocated device");
            }
            // frees queued behind the lock may go out from here on
            drop(send_guard);
            self.handover_commands(&client, trackers).await?;
            client.send_handover_init_complete().await?;
            Ok::<(), RemoteError>(())
        }
        .await;

        match sent {
            Ok(()) => {
                info!("handover initiation sent, shutting down");
                self.shutdown();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "handover failed part way; already sent state is not rolled back");
                {
                    let mut st = self.state();
                    st.performing_handover = false;
                    st.handed_devices.clear();
                }
                self.command_process_wait.signal();
                Err(e.into())
            }
        }
    }

    async fn handover_commands(
        &self,
        client: &RemoteClient,
        trackers: Vec<Arc<CommandTracker>>,
    ) -> Result<(), RemoteError> {
        let reload = self.config.scheduler.reload_cmdfiles;
        let mut files_sent: HashSet<PathBuf> = HashSet::new();
        let mut commands = Vec::new();
        for tracker in trackers {
            match tracker.command_file() {
                Some(file) if reload => {
                    if files_sent.insert(file.to_path_buf()) {
                        let extra_args = self.watcher.extra_args_for_file(file).unwrap_or_default();
                        client.send_add_command_file(file, &extra_args).await?;
                        debug!(file = %file.display(), "sent command file");
                    }
                }
                _ => commands.push(tracker),
            }
        }
        for tracker in commands {
            client
                .send_add_command(tracker.total_exec_time(), tracker.args())
                .await?;
            debug!(command_id = tracker.id(), "sent command");
        }
        Ok(())
    }

    /// Tell the handover peer a device is free again.  Only for devices it
    /// was told are allocated, once per device.
    fn remote_free_device(&self, serial: &str) {
        if !self.state().handed_devices.contains(serial) {
            return;
        }
        // Waits until the allocation messages are out.
        let _send = self.handover_send.blocking_lock();
        let (client, runtime) = {
            let mut st = self.state();
            if !st.handed_devices.remove(serial) {
                return;
            }
            (st.remote_client.clone(), st.runtime.clone())
        };
        let (Some(client), Some(runtime)) = (client, runtime) else {
            return;
        };
        // Runs on a blocking worker, so blocking on the runtime is fine.
        if let Err(e) = runtime.block_on(client.send_free_device(serial)) {
            error!(serial, error = %e, "failed to notify remote of freed device");
        }
    }

    async fn close_remote_client(&self) {
        let client = self.state().remote_client.take();
        if let Some(client) = client {
            if let Err(e) = client.send_handover_complete().await {
                error!(error = %e, "failed to send handover complete");
            }
        }
    }

    /// Start the remote control server on the configured port.  When the
    /// port is taken and automatic handover is enabled, ask the instance
    /// holding it to hand over to a temporary server, then wait for its
    /// initiation-complete message.
    async fn start_remote_manager(&self) {
        let remote = &self.config.remote;
        if !remote.start_on_boot {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let handler: Arc<dyn RemoteCommandHandler> = this;

        match RemoteManager::bind(Arc::clone(&handler), remote.port).await {
            Ok(manager) => {
                info!(port = manager.port(), "started remote manager");
                self.set_remote_manager(manager).await;
                return;
            }
            Err(e) => info!(port = remote.port, error = %e, "failed to start remote manager on default port"),
        }

        if !remote.auto_handover {
            match RemoteManager::bind(handler, 0).await {
                Ok(manager) => {
                    info!(port = manager.port(), "started remote manager with no handover");
                    self.set_remote_manager(manager).await;
                }
                Err(e) => error!(error = %e, "failed to auto start a remote manager on boot"),
            }
            return;
        }

        info!(port = remote.port, "initiating handover with remote instance");
        self.handover_handshake.reset();
        if let Err(e) = self.initiate_handover(handler, remote.port).await {
            error!(error = %e, "failed to initiate handover");
            return;
        }
        let timeout = remote.handover_init_timeout();
        if self.handover_handshake.wait_for_event(Some(timeout)).await {
            info!("handover initiation complete");
        } else {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "remote instance did not complete handover initiation, continuing"
            );
        }
    }

    async fn initiate_handover(
        &self,
        handler: Arc<dyn RemoteCommandHandler>,
        port: u16,
    ) -> Result<(), RemoteError> {
        let client = RemoteClient::connect(port).await?;
        info!(port, "connected to existing instance, attempting takeover");
        self.state().remote_client = Some(client.clone());

        let tmp = RemoteManager::bind(handler, 0).await?;
        let tmp_port = tmp.port();
        info!(port = tmp_port, "started temporary remote manager for handover");
        self.set_remote_manager(tmp).await;

        client.send_start_handover(tmp_port).await?;
        Ok(())
    }

    async fn set_remote_manager(&self, manager: RemoteManager) {
        self.state().remote_port = Some(manager.port());
        *self.remote_manager.lock().await = Some(manager);
    }

    /// Receiving side, once the old instance has exited: drop the client,
    /// stop the temporary server and rebind the default port.
    async fn complete_handover(&self) {
        info!("completing handover");
        if self.state().remote_client.take().is_none() {
            error!("received handover complete without an active remote client");
        }
        let old = self.remote_manager.lock().await.take();
        match old {
            Some(manager) => manager.cancel_and_wait().await,
            None => error!("received handover complete without a running remote manager"),
        }
        self.state().remote_port = None;

        let Some(this) = self.this.upgrade() else {
            return;
        };
        let handler: Arc<dyn RemoteCommandHandler> = this;
        let remote = &self.config.remote;
        for attempt in 1..=remote.rebind_attempts {
            tokio::time::sleep(remote.rebind_delay()).await;
            match RemoteManager::bind(Arc::clone(&handler), remote.port).await {
                Ok(manager) => {
                    info!(port = manager.port(), attempt, "started remote manager after handover");
                    self.set_remote_manager(manager).await;
                    return;
                }
                Err(e) => debug!(attempt, error = %e, "remote manager port not free yet"),
            }
        }
        error!(port = remote.port, "failed to start remote manager after handover");
    }
}

// ── Rescheduling ──────────────────────────────────────────────────────────────

/// [`Rescheduler`] handed to each invocation; bound to its command.
struct CommandRescheduler {
    scheduler: Weak<CommandScheduler>,
    tracker: Arc<CommandTracker>,
}

impl Rescheduler for CommandRescheduler {
    fn schedule_config(&self, mut config: Configuration) -> bool {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return false;
        };
        config.command_options.loop_mode = false;
        let cmd = scheduler.create_executable_command(Arc::clone(&self.tracker), config, true);
        scheduler.add_exec_command_to_queue(cmd, Duration::ZERO)
    }

    fn reschedule_command(&self) -> bool {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return false;
        };
        debug!(command_id = self.tracker.id(), "rescheduling command");
        match scheduler
            .factory
            .create_configuration_from_args(self.tracker.args())
        {
            Ok(config) => {
                let delay = config.command_options.loop_time();
                let cmd = scheduler.create_executable_command(Arc::clone(&self.tracker), config, true);
                scheduler.add_exec_command_to_queue(cmd, delay)
            }
            Err(e) => {
                // args may carry credentials
                error!(command_id = self.tracker.id(), error = %e, "failed to reschedule command");
                false
            }
        }
    }
}

// ── Collaborator impls ────────────────────────────────────────────────────────

impl CommandFileListener for CommandScheduler {
    fn notify_file_changed(&self, file: &Path, extra_args: Vec<String>) {
        info!(file = %file.display(), "command file changed, reloading");
        self.remove_commands_from_file(file);
        if let Err(e) = self.internal_add_command_file(file, &extra_args) {
            error!(file = %file.display(), error = %e, "failed to reload command file");
        }
    }
}

#[tonic::async_trait]
impl RemoteCommandHandler for CommandScheduler {
    fn allocate_device(&self, serial: &str) -> Result<(), SchedulerError> {
        let device = self
            .pool
            .force_allocate(serial)
            .ok_or_else(|| SchedulerError::DeviceBusy {
                serial: serial.to_string(),
            })?;
        info!(serial, "allocated device for remote");
        self.state().remote_devices.insert(serial.to_string(), device);
        Ok(())
    }

    fn free_device(&self, serial: &str) -> Result<(), SchedulerError> {
        let devices: Vec<DeviceHandle> = {
            let mut st = self.state();
            if serial == "*" {
                st.remote_devices.drain().map(|(_, d)| d).collect()
            } else {
                let device = st.remote_devices.remove(serial).ok_or_else(|| {
                    SchedulerError::DeviceNotFound {
                        serial: serial.to_string(),
                    }
                })?;
                vec![device]
            }
        };
        for device in devices {
            info!(serial = device.serial(), "freeing device held for remote");
            self.pool.free(device, FreeDeviceState::Available);
        }
        Ok(())
    }

    fn add_command(&self, exec_time: Duration, args: Vec<String>) -> Result<bool, SchedulerError> {
        self.add_command_with_exec_time(&args, exec_time)
    }

    fn add_command_file(&self, path: &Path, extra_args: Vec<String>) -> Result<(), SchedulerError> {
        CommandScheduler::add_command_file(self, path, &extra_args)
    }

    async fn start_handover(&self, port: u16) -> Result<(), SchedulerError> {
        self.handover_shutdown(port).await
    }

    fn handover_init_complete(&self) {
        info!("remote instance completed handover initiation");
        self.handover_handshake.signal();
    }

    fn handover_complete(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let Ok(runtime) = self.runtime() else {
            return;
        };
        runtime.spawn(async move { this.complete_handover().await });
    }

    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.pool.list_devices()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests;
