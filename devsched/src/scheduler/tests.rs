/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! End-to-end scheduler tests against an in-memory pool and a scripted
//! invocation runner.

use super::*;
use crate::command::ArgsConfigurationFactory;
use crate::device::{LocalDevice, StaticDevicePool, TestDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn args(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| (*s).to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pass,
    Fatal,
    Unavailable,
    Panic,
    /// Queue one follow-up run through the rescheduler, then pass.
    RescheduleOnce,
}

/// Records every invocation; optionally blocks until released or cancelled.
struct ScriptedRunner {
    outcome: Mutex<Outcome>,
    hold: AtomicBool,
    runs: Mutex<Vec<(u32, String)>>,
}

impl ScriptedRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Outcome::Pass),
            hold: AtomicBool::new(false),
            runs: Mutex::new(Vec::new()),
        })
    }

    fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    fn runs(&self) -> Vec<(u32, String)> {
        self.runs.lock().unwrap().clone()
    }
}

impl InvocationRunner for ScriptedRunner {
    fn invoke(&self, ctx: InvocationContext) -> Result<(), InvocationError> {
        self.runs
            .lock()
            .unwrap()
            .push((ctx.command_id, ctx.device.serial().to_string()));
        while self.hold.load(Ordering::SeqCst) {
            if ctx.is_cancelled() {
                return Err(InvocationError::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        // a measurable execution time
        std::thread::sleep(Duration::from_millis(2));

        let outcome = {
            let mut current = self.outcome.lock().unwrap();
            let outcome = *current;
            if outcome == Outcome::RescheduleOnce {
                *current = Outcome::Pass;
            }
            outcome
        };
        match outcome {
            Outcome::Pass => Ok(()),
            Outcome::Fatal => Err(InvocationError::FatalHost("disk full".into())),
            Outcome::Unavailable => Err(InvocationError::DeviceNotAvailable {
                serial: ctx.device.serial().to_string(),
                reason: "usb disconnect".into(),
            }),
            Outcome::Panic => panic!("runner bug"),
            Outcome::RescheduleOnce => {
                assert!(ctx.rescheduler.schedule_config(ctx.config));
                Ok(())
            }
        }
    }
}

/// Pool wrapper that records every `free`.
struct CountingPool {
    inner: StaticDevicePool,
    frees: Mutex<Vec<(String, FreeDeviceState)>>,
}

impl CountingPool {
    fn frees(&self) -> Vec<(String, FreeDeviceState)> {
        self.frees.lock().unwrap().clone()
    }
}

impl DevicePool for CountingPool {
    fn allocate(&self, requirements: &crate::device::DeviceRequirements) -> Option<DeviceHandle> {
        self.inner.allocate(requirements)
    }

    fn force_allocate(&self, serial: &str) -> Option<DeviceHandle> {
        self.inner.force_allocate(serial)
    }

    fn free(&self, device: DeviceHandle, state: FreeDeviceState) {
        self.frees
            .lock()
            .unwrap()
            .push((device.serial().to_string(), state));
        self.inner.free(device, state);
    }

    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.list_devices()
    }

    fn add_monitor(&self, monitor: crate::device::DeviceMonitor) {
        self.inner.add_monitor(monitor);
    }

    fn terminate(&self) {
        self.inner.terminate();
    }

    fn terminate_hard(&self) {
        self.inner.terminate_hard();
    }
}

fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.scheduler.max_poll_time_ms = 50;
    config.scheduler.cmdfile_poll_interval_ms = 20;
    config.remote.rebind_delay_ms = 50;
    config.remote.rebind_attempts = 40;
    config.remote.handover_init_timeout_ms = 5_000;
    config
}

struct Harness {
    scheduler: Arc<CommandScheduler>,
    pool: Arc<CountingPool>,
    runner: Arc<ScriptedRunner>,
    devices: Vec<Arc<LocalDevice>>,
}

impl Harness {
    async fn finish(&self) {
        self.scheduler.shutdown();
        self.join().await;
    }

    async fn join(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.scheduler.join())
            .await
            .expect("scheduler did not stop");
    }

    fn sizes(&self) -> QueueSizes {
        self.scheduler.queue_sizes()
    }
}

async fn harness_with(
    devices: Vec<LocalDevice>,
    config: SchedulerConfig,
    factory: ArgsConfigurationFactory,
) -> Harness {
    let devices: Vec<Arc<LocalDevice>> = devices.into_iter().map(Arc::new).collect();
    let pool = Arc::new(CountingPool {
        inner: StaticDevicePool::from_devices(
            devices.iter().map(|d| Arc::clone(d) as DeviceHandle),
        ),
        frees: Mutex::new(Vec::new()),
    });
    let runner = ScriptedRunner::new();
    let scheduler = CommandScheduler::new(
        pool.clone(),
        Arc::new(factory),
        runner.clone(),
        config,
    );
    scheduler.start().await.unwrap();
    scheduler.await_running().await;
    Harness {
        scheduler,
        pool,
        runner,
        devices,
    }
}

async fn harness(serials: &[&str]) -> Harness {
    harness_with(
        serials.iter().map(|s| LocalDevice::new(*s, "sdk")).collect(),
        test_config(),
        ArgsConfigurationFactory::new(),
    )
    .await
}

async fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn sizes(ready: usize, sleeping: usize, executing: usize) -> QueueSizes {
    QueueSizes {
        ready,
        sleeping,
        executing,
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[test]
fn operations_before_start_are_rejected() {
    let scheduler = CommandScheduler::new(
        Arc::new(StaticDevicePool::new()),
        Arc::new(ArgsConfigurationFactory::new()),
        ScriptedRunner::new(),
        test_config(),
    );
    assert!(matches!(
        scheduler.add_command(&args(&["run"])),
        Err(SchedulerError::NotStarted)
    ));
    assert!(matches!(
        scheduler.add_command_file(Path::new("/nonexistent"), &[]),
        Err(SchedulerError::NotStarted)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_twice_fails() {
    let h = harness(&[]).await;
    assert!(matches!(
        h.scheduler.start().await,
        Err(SchedulerError::AlreadyStarted)
    ));
    h.finish().await;
}

// ── Scheduling ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn command_runs_once_and_device_is_freed_once() {
    let h = harness(&["emu-1"]).await;
    assert!(h.scheduler.add_command(&args(&["run", "suite"])).unwrap());

    assert!(wait_until(|| h.pool.frees().len() == 1 && h.sizes() == QueueSizes::default()).await);
    assert_eq!(h.runner.runs(), vec![(1, "emu-1".to_string())]);
    assert_eq!(
        h.pool.frees(),
        vec![("emu-1".to_string(), FreeDeviceState::Available)]
    );
    assert_eq!(
        h.pool.inner.state_of("emu-1"),
        Some(AllocationState::Available)
    );
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn command_waits_until_a_matching_device_appears() {
    let h = harness(&["a"]).await;
    h.scheduler.add_command(&args(&["run", "-s", "b"])).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.sizes(), sizes(1, 0, 0));
    assert!(h.runner.runs().is_empty());

    // the pool's availability monitor wakes the loop
    h.pool
        .inner
        .add_device(Arc::new(LocalDevice::new("b", "sdk")));
    assert!(wait_until(|| h.runner.runs() == vec![(1, "b".to_string())]).await);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn least_executed_command_is_served_first() {
    let h = harness(&[]).await;
    h.scheduler
        .add_command_with_exec_time(&args(&["run", "a"]), Duration::from_secs(10))
        .unwrap();
    h.scheduler
        .add_command_with_exec_time(&args(&["run", "b"]), Duration::ZERO)
        .unwrap();

    h.pool
        .inner
        .add_device(Arc::new(LocalDevice::new("emu-1", "sdk")));
    assert!(wait_until(|| h.runner.runs().len() == 2).await);
    let order: Vec<u32> = h.runner.runs().into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, vec![2, 1]);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_command_is_requeued_while_its_run_is_still_executing() {
    let h = harness(&["emu-1"]).await;
    h.runner.hold();
    h.scheduler
        .add_command(&args(&["run", "--loop", "--min-loop-time", "60000"]))
        .unwrap();

    assert!(wait_until(|| h.sizes() == sizes(0, 1, 1)).await);
    let table = h.scheduler.command_queue_table();
    assert!(table.contains("Executing"), "{table}");
    assert!(table.contains("Sleeping"), "{table}");
    // both runs belong to the same command
    assert_eq!(h.scheduler.commands_info(None).unwrap().len(), 1);

    h.scheduler.shutdown_hard();
    h.join().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_delay_loop_command_is_ready_again_at_once() {
    let h = harness(&["emu-1"]).await;
    h.runner.hold();
    h.scheduler
        .add_command(&args(&["run", "--loop", "--min-loop-time", "0"]))
        .unwrap();

    // one run executing, the next one already waiting for a device
    assert!(wait_until(|| h.sizes() == sizes(1, 0, 1)).await);
    assert_eq!(h.runner.runs().len(), 1);

    h.scheduler.shutdown_hard();
    h.join().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_run_adds_to_the_command_exec_time() {
    let h = harness(&["emu-1"]).await;
    h.scheduler
        .add_command(&args(&["run", "--loop", "--min-loop-time", "60000"]))
        .unwrap();

    assert!(wait_until(|| h.runner.runs().len() == 1 && h.sizes() == sizes(0, 1, 0)).await);
    let commands = h.scheduler.all_commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].0.tracker().total_exec_time() > Duration::ZERO);
    h.finish().await;
}

/// Pool that leases the same device to every request, busy or not.
struct SameDevicePool {
    device: DeviceHandle,
    frees: Mutex<Vec<(String, FreeDeviceState)>>,
}

impl DevicePool for SameDevicePool {
    fn allocate(&self, _requirements: &crate::device::DeviceRequirements) -> Option<DeviceHandle> {
        Some(Arc::clone(&self.device))
    }

    fn force_allocate(&self, _serial: &str) -> Option<DeviceHandle> {
        Some(Arc::clone(&self.device))
    }

    fn free(&self, device: DeviceHandle, state: FreeDeviceState) {
        self.frees
            .lock()
            .unwrap()
            .push((device.serial().to_string(), state));
    }

    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        Vec::new()
    }

    fn add_monitor(&self, _monitor: crate::device::DeviceMonitor) {}

    fn terminate(&self) {}

    fn terminate_hard(&self) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_device_from_the_pool_is_handed_back() {
    let pool = Arc::new(SameDevicePool {
        device: Arc::new(LocalDevice::new("a", "sdk")),
        frees: Mutex::new(Vec::new()),
    });
    let runner = ScriptedRunner::new();
    runner.hold();
    let scheduler = CommandScheduler::new(
        pool.clone(),
        Arc::new(ArgsConfigurationFactory::new()),
        runner.clone(),
        test_config(),
    );
    scheduler.start().await.unwrap();
    scheduler.await_running().await;

    scheduler.add_command(&args(&["run", "first"])).unwrap();
    assert!(wait_until(|| runner.runs().len() == 1).await);
    scheduler.add_command(&args(&["run", "second"])).unwrap();

    // the second lease is returned untouched and the command waits
    assert!(wait_until(|| !pool.frees.lock().unwrap().is_empty()).await);
    assert_eq!(
        pool.frees.lock().unwrap()[0],
        ("a".to_string(), FreeDeviceState::Available)
    );
    assert_eq!(runner.runs().len(), 1);
    assert_eq!(scheduler.queue_sizes(), sizes(1, 0, 1));

    scheduler.shutdown_hard();
    tokio::time::timeout(Duration::from_secs(10), scheduler.join())
        .await
        .expect("scheduler did not stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn all_devices_command_fans_out_to_every_non_stub_device() {
    let h = harness_with(
        vec![
            LocalDevice::new("a", "sdk"),
            LocalDevice::new("b", "sdk"),
            LocalDevice::new("stub-0", "sdk").with_stub(true),
        ],
        test_config(),
        ArgsConfigurationFactory::new(),
    )
    .await;
    h.runner.hold();
    h.scheduler
        .add_command(&args(&["run", "--all-devices"]))
        .unwrap();

    assert!(wait_until(|| h.sizes() == sizes(0, 0, 2)).await);
    let info = h.scheduler.commands_info(None).unwrap();
    assert_eq!(info.len(), 2);
    assert!(info[0].starts_with("Command 1:") && info[0].ends_with("run --all-devices -s a"));
    assert!(info[1].starts_with("Command 2:") && info[1].ends_with("run --all-devices -s b"));

    let mut ran_on: Vec<String> = h.runner.runs().into_iter().map(|(_, s)| s).collect();
    ran_on.sort();
    assert_eq!(ran_on, vec!["a", "b"]);

    h.runner.release();
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reschedule_from_a_running_invocation_queues_another_run() {
    let h = harness(&["emu-1"]).await;
    h.runner.set_outcome(Outcome::RescheduleOnce);
    h.scheduler
        .add_command(&args(&["run", "--loop", "--min-loop-time", "60000"]))
        .unwrap();

    // the original run, then the rescheduled copy
    assert!(wait_until(|| h.runner.runs().iter().filter(|(id, _)| *id == 1).count() == 2).await);
    // the rescheduled copy has loop mode forced off, so only the loop
    // iteration queued by the first run is left sleeping
    assert!(wait_until(|| h.sizes() == sizes(0, 1, 0)).await);
    h.finish().await;
}

// ── Invocation outcomes ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_device_is_freed_as_unavailable() {
    let h = harness(&["emu-1"]).await;
    h.runner.set_outcome(Outcome::Unavailable);
    h.scheduler.add_command(&args(&["run"])).unwrap();

    assert!(wait_until(|| !h.pool.frees().is_empty()).await);
    assert_eq!(
        h.pool.frees(),
        vec![("emu-1".to_string(), FreeDeviceState::Unavailable)]
    );
    assert_eq!(
        h.pool.inner.state_of("emu-1"),
        Some(AllocationState::Unavailable)
    );
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_runner_still_releases_the_device() {
    let h = harness(&["emu-1"]).await;
    h.runner.set_outcome(Outcome::Panic);
    h.scheduler.add_command(&args(&["run"])).unwrap();

    assert!(wait_until(|| h.pool.frees().len() == 1 && h.sizes() == QueueSizes::default()).await);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_host_error_shuts_the_scheduler_down() {
    let h = harness(&["emu-1"]).await;
    h.runner.set_outcome(Outcome::Fatal);
    h.scheduler.add_command(&args(&["run", "a"])).unwrap();
    h.scheduler.add_command(&args(&["run", "b"])).unwrap();

    h.join().await;
    assert!(h.scheduler.is_shutdown());
    assert_eq!(h.runner.runs().len(), 1);
    assert_eq!(h.pool.frees().len(), 1);
    assert_eq!(h.sizes(), QueueSizes::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_listener_does_not_prevent_release() {
    let h = harness(&["emu-1"]).await;
    h.scheduler
        .add_invocation_listener(Arc::new(|_: &dyn TestDevice, _: FreeDeviceState| {
            panic!("listener bug")
        }));
    h.scheduler.add_command(&args(&["run"])).unwrap();

    assert!(wait_until(|| h.pool.frees().len() == 1 && h.sizes() == QueueSizes::default()).await);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn low_battery_stops_the_invocation() {
    let h = harness_with(
        vec![LocalDevice::new("emu-1", "sdk").with_battery(Some(50))],
        test_config(),
        ArgsConfigurationFactory::new(),
    )
    .await;
    h.runner.hold();
    h.scheduler
        .add_command(&args(&["run", "--cutoff-battery", "60"]))
        .unwrap();

    assert!(wait_until(|| h.pool.frees().len() == 1).await);
    assert!(h.devices[0]
        .shell_history()
        .contains(&"am kill-all".to_string()));
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_invocation_targets_a_command_id() {
    let h = harness(&["emu-1"]).await;
    h.runner.hold();
    h.scheduler.add_command(&args(&["run"])).unwrap();
    assert!(wait_until(|| h.sizes() == sizes(0, 0, 1)).await);

    assert!(!h.scheduler.stop_invocation(99));
    assert!(h.scheduler.stop_invocation(1));
    assert!(wait_until(|| h.sizes() == QueueSizes::default()).await);
    h.finish().await;
}

// ── Direct execution ──────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn exec_command_without_a_free_device_fails() {
    let h = harness(&[]).await;
    let listener = Arc::new(|_: &dyn TestDevice, _: FreeDeviceState| {});
    assert!(matches!(
        h.scheduler.exec_command(listener, &args(&["run"])),
        Err(SchedulerError::NoDeviceAvailable { .. })
    ));
    assert_eq!(h.sizes(), QueueSizes::default());
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_command_notifies_listener_before_freeing() {
    let h = harness(&["emu-1"]).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let seen = Arc::clone(&seen);
        let pool = Arc::clone(&h.pool);
        Arc::new(move |device: &dyn TestDevice, state: FreeDeviceState| {
            let pool_state = pool.inner.state_of(device.serial());
            seen.lock().unwrap().push((state, pool_state));
        })
    };
    h.scheduler.exec_command(listener, &args(&["run"])).unwrap();

    assert!(wait_until(|| h.pool.frees().len() == 1).await);
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[(FreeDeviceState::Available, Some(AllocationState::Allocated))]
    );
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_command_on_caller_device_never_frees_it() {
    let h = harness(&["emu-1"]).await;
    let device = h.pool.force_allocate("emu-1").unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let listener = {
        let done = Arc::clone(&done);
        Arc::new(move |_: &dyn TestDevice, _: FreeDeviceState| done.store(true, Ordering::SeqCst))
    };
    h.scheduler
        .exec_command_on_device(listener, device, &args(&["run"]))
        .unwrap();

    assert!(wait_until(|| done.load(Ordering::SeqCst) && h.sizes() == QueueSizes::default()).await);
    assert!(h.pool.frees().is_empty());
    assert_eq!(
        h.pool.inner.state_of("emu-1"),
        Some(AllocationState::Allocated)
    );
    h.finish().await;
}

// ── Command parsing ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn help_and_dry_run_commands_are_not_queued() {
    let h = harness(&[]).await;
    assert!(!h.scheduler.add_command(&args(&["run", "--help"])).unwrap());
    assert!(!h.scheduler.add_command(&args(&["run", "--json-help"])).unwrap());
    assert!(!h.scheduler.add_command(&args(&["run", "--dry-run"])).unwrap());
    assert!(!h
        .scheduler
        .add_command(&args(&["run", "--noisy-dry-run"]))
        .unwrap());
    assert!(matches!(
        h.scheduler
            .add_command(&args(&["run", "--dry-run", "--min-battery", "200"])),
        Err(SchedulerError::Config(_))
    ));
    assert_eq!(h.sizes(), QueueSizes::default());
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_commands_are_rejected() {
    let h = harness(&[]).await;
    assert!(matches!(
        h.scheduler.add_command(&args(&["run", "--bogus"])),
        Err(SchedulerError::Config(ConfigError::Unconsumed { .. }))
    ));
    assert!(matches!(
        h.scheduler.add_command(&[]),
        Err(SchedulerError::Config(ConfigError::MissingConfigName))
    ));
    assert_eq!(h.sizes(), QueueSizes::default());
    h.finish().await;
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_on_empty_with_nothing_queued_exits() {
    let h = harness(&[]).await;
    h.scheduler.shutdown_on_empty();
    h.join().await;
    assert!(h.scheduler.is_shutdown());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_on_empty_waits_for_the_running_command() {
    let h = harness(&["emu-1"]).await;
    h.runner.hold();
    h.scheduler.add_command(&args(&["run"])).unwrap();
    assert!(wait_until(|| h.sizes() == sizes(0, 0, 1)).await);

    h.scheduler.shutdown_on_empty();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.scheduler.is_shutting_down());
    assert!(!h.scheduler.is_shutdown());

    h.runner.release();
    h.join().await;
    assert_eq!(h.runner.runs().len(), 1);
    assert_eq!(h.pool.frees().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drops_queued_commands_and_rejects_new_ones() {
    let h = harness(&[]).await;
    h.scheduler.add_command(&args(&["run", "a"])).unwrap();
    h.scheduler.add_command(&args(&["run", "b"])).unwrap();
    assert_eq!(h.sizes(), sizes(2, 0, 0));

    h.scheduler.shutdown();
    assert_eq!(h.sizes(), QueueSizes::default());
    h.join().await;
    assert!(!h.scheduler.add_command(&args(&["run", "c"])).unwrap());
    assert_eq!(h.sizes(), QueueSizes::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_hard_interrupts_running_invocations() {
    let h = harness(&["emu-1"]).await;
    h.runner.hold();
    h.scheduler.add_command(&args(&["run"])).unwrap();
    assert!(wait_until(|| h.sizes() == sizes(0, 0, 1)).await);

    h.scheduler.shutdown_hard();
    h.join().await;
    assert_eq!(h.pool.frees().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_all_commands_keeps_running_invocations() {
    let h = harness(&["emu-1"]).await;
    h.runner.hold();
    h.scheduler.add_command(&args(&["run"])).unwrap();
    assert!(wait_until(|| h.sizes() == sizes(0, 0, 1)).await);
    h.scheduler.add_command(&args(&["run", "-s", "other"])).unwrap();
    h.scheduler
        .add_command(&args(&["run", "--loop", "--min-loop-time", "60000", "-s", "other"]))
        .unwrap();

    h.scheduler.remove_all_commands();
    assert_eq!(h.sizes(), sizes(0, 0, 1));
    h.runner.release();
    h.finish().await;
}

// ── Command files ─────────────────────────────────────────────────────────────

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[tokio::test(flavor = "multi_thread")]
async fn command_file_adds_every_command_with_extra_args() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "cmds.txt", "# nightly\nrun alpha\n\nrun beta\n");
    let h = harness(&[]).await;

    h.scheduler
        .add_command_file(&file, &args(&["extra"]))
        .unwrap();
    let info = h.scheduler.commands_info(None).unwrap();
    assert_eq!(
        info,
        vec![
            "Command 1: [0m:00] run alpha extra",
            "Command 2: [0m:00] run beta extra",
        ]
    );
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_command_file_rolls_back_its_commands() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "cmds.txt", "run alpha\nrun --bogus\n");
    let h = harness(&[]).await;
    h.scheduler.add_command(&args(&["run", "direct"])).unwrap();

    let err = h.scheduler.add_command_file(&file, &[]).unwrap_err();
    match err {
        SchedulerError::Config(ConfigError::InFile { command, .. }) => {
            assert_eq!(command, "run --bogus")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // only the directly added command is left
    assert_eq!(h.sizes(), sizes(1, 0, 0));
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_command_file_is_a_config_error() {
    let h = harness(&[]).await;
    assert!(matches!(
        h.scheduler
            .add_command_file(Path::new("/nonexistent/cmds.txt"), &[]),
        Err(SchedulerError::Config(ConfigError::ReadFile { .. }))
    ));
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn re_adding_a_watched_file_replaces_its_commands() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "cmds.txt", "run alpha\n");
    let mut config = test_config();
    config.scheduler.reload_cmdfiles = true;
    let h = harness_with(Vec::new(), config, ArgsConfigurationFactory::new()).await;

    h.scheduler.add_command(&args(&["run", "direct"])).unwrap();
    h.scheduler.add_command_file(&file, &[]).unwrap();
    h.scheduler.add_command_file(&file, &[]).unwrap();

    let info = h.scheduler.commands_info(None).unwrap();
    assert_eq!(
        info,
        vec![
            "Command 1: [0m:00] run direct",
            "Command 3: [0m:00] run alpha",
        ]
    );
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_command_file_is_reloaded() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "cmds.txt", "run alpha\n");
    let mut config = test_config();
    config.scheduler.reload_cmdfiles = true;
    let h = harness_with(Vec::new(), config, ArgsConfigurationFactory::new()).await;
    h.scheduler.add_command_file(&file, &[]).unwrap();

    // replace atomically, retrying until the mtime visibly changes
    let before = fs::metadata(&file).unwrap().modified().unwrap();
    let staged = dir.path().join("cmds.txt.new");
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&staged, "run beta\nrun gamma\n").unwrap();
        fs::rename(&staged, &file).unwrap();
        if fs::metadata(&file).unwrap().modified().unwrap() != before {
            break;
        }
    }

    assert!(
        wait_until(|| {
            let info = h.scheduler.commands_info(None).unwrap();
            info.len() == 2 && info[0].ends_with("run beta") && info[1].ends_with("run gamma")
        })
        .await
    );
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_commands_of_an_unknown_file_changes_nothing() {
    let h = harness(&[]).await;
    h.scheduler.add_command(&args(&["run"])).unwrap();
    h.scheduler
        .remove_commands_from_file(Path::new("/nonexistent/cmds.txt"));
    assert_eq!(h.sizes(), sizes(1, 0, 0));
    h.finish().await;
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn tables_are_empty_when_idle() {
    let h = harness(&[]).await;
    assert_eq!(h.scheduler.invocations_table(), "");
    assert_eq!(h.scheduler.command_queue_table(), "");
    assert!(h.scheduler.commands_info(None).unwrap().is_empty());
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_list_executing_before_waiting_commands() {
    let h = harness(&["emu-1"]).await;
    h.runner.hold();
    h.scheduler.add_command(&args(&["run"])).unwrap();
    assert!(wait_until(|| h.runner.runs().len() == 1).await);
    h.scheduler.add_command(&args(&["wait", "-s", "other"])).unwrap();

    let queue = h.scheduler.command_queue_table();
    let lines: Vec<&str> = queue.lines().collect();
    assert_eq!(lines.len(), 3, "{queue}");
    assert!(lines[0].starts_with("Id"));
    assert!(lines[1].starts_with('1') && lines[1].contains("Executing"));
    assert!(lines[2].starts_with('2') && lines[2].contains("Wait_for_device"));
    assert!(lines[2].contains("N/A"));

    let invocations = h.scheduler.invocations_table();
    assert!(invocations.starts_with("Command Id"), "{invocations}");
    assert!(invocations.contains("emu-1") && invocations.contains("Running"));

    h.runner.release();
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_info_filters_by_regex() {
    let h = harness(&[]).await;
    h.scheduler.add_command(&args(&["run", "alpha"])).unwrap();
    h.scheduler.add_command(&args(&["run", "beta"])).unwrap();

    let info = h.scheduler.commands_info(Some("be.a")).unwrap();
    assert_eq!(info, vec!["Command 2: [0m:00] run beta"]);
    assert!(matches!(
        h.scheduler.commands_info(Some("(")),
        Err(SchedulerError::InvalidFilter(_))
    ));
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn xml_dump_writes_one_file_per_command() {
    let dir = TempDir::new().unwrap();
    let h = harness_with(
        Vec::new(),
        test_config(),
        ArgsConfigurationFactory::new().allow_leftovers(true),
    )
    .await;
    h.scheduler.add_command(&args(&["suite/smoke"])).unwrap();
    h.scheduler
        .add_command(&args(&["run", "--template:map", "test", "cts/camera"]))
        .unwrap();

    let paths = h.scheduler.dump_commands_xml_to(dir.path(), None).unwrap();
    assert_eq!(paths.len(), 2);
    let names: Vec<String> = paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names[0].starts_with("config__suite__smoke__") && names[0].ends_with(".xml"));
    assert!(names[1].starts_with("config__cts__camera__"));
    let xml = fs::read_to_string(&paths[0]).unwrap();
    assert!(xml.contains(r#"<configuration name="suite/smoke">"#));

    let filtered = h
        .scheduler
        .dump_commands_xml_to(dir.path(), Some("camera"))
        .unwrap();
    assert_eq!(filtered.len(), 1);
    h.finish().await;
}

// ── Handover ──────────────────────────────────────────────────────────────────

/// Remote peer that only records what it is sent.
#[derive(Default)]
struct RecordingPeer {
    calls: Mutex<Vec<String>>,
    /// Let held invocations finish while commands are being received.
    release_on_add: Option<Arc<ScriptedRunner>>,
}

impl RecordingPeer {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl RemoteCommandHandler for RecordingPeer {
    fn allocate_device(&self, serial: &str) -> Result<(), SchedulerError> {
        self.record(format!("allocate {serial}"));
        Ok(())
    }

    fn free_device(&self, serial: &str) -> Result<(), SchedulerError> {
        self.record(format!("free {serial}"));
        Ok(())
    }

    fn add_command(&self, exec_time: Duration, args: Vec<String>) -> Result<bool, SchedulerError> {
        self.record(format!("add {} {}", exec_time.as_millis(), args.join(" ")));
        if let Some(runner) = &self.release_on_add {
            runner.release();
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(true)
    }

    fn add_command_file(&self, path: &Path, extra_args: Vec<String>) -> Result<(), SchedulerError> {
        self.record(format!("file {} {}", path.display(), extra_args.join(" ")));
        Ok(())
    }

    async fn start_handover(&self, port: u16) -> Result<(), SchedulerError> {
        self.record(format!("handover {port}"));
        Ok(())
    }

    fn handover_init_complete(&self) {
        self.record("init complete".into());
    }

    fn handover_complete(&self) {
        self.record("complete".into());
    }

    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        Vec::new()
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test(flavor = "multi_thread")]
async fn handover_sends_devices_then_commands_then_shuts_down() {
    let dir = TempDir::new().unwrap();
    let file = write_file(&dir, "cmds.txt", "run f1\nrun f2\n");
    let mut config = test_config();
    config.scheduler.reload_cmdfiles = true;
    let h = harness_with(
        vec![LocalDevice::new("a", "sdk"), LocalDevice::new("b", "sdk")],
        config,
        ArgsConfigurationFactory::new(),
    )
    .await;
    h.runner.hold();

    h.scheduler
        .add_command_file(&file, &args(&["extra"]))
        .unwrap();
    assert!(wait_until(|| h.sizes() == sizes(0, 0, 2)).await);
    h.scheduler
        .add_command_with_exec_time(&args(&["run", "-s", "zzz"]), Duration::from_millis(1500))
        .unwrap();
    h.scheduler.add_command(&args(&["run", "-s", "yyy"])).unwrap();

    let peer = Arc::new(RecordingPeer::default());
    let manager = RemoteManager::bind(peer.clone(), 0).await.unwrap();
    h.scheduler.handover_shutdown(manager.port()).await.unwrap();

    let canonical = fs::canonicalize(&file).unwrap();
    let calls = peer.calls();
    assert_eq!(calls.len(), 6, "{calls:?}");
    assert_eq!(
        calls[..3],
        [
            "allocate a".to_string(),
            "allocate b".to_string(),
            format!("file {} extra", canonical.display()),
        ]
    );
    // ready commands are kept in fairness order, which the loop may or may
    // not have applied yet
    let mut added = calls[3..5].to_vec();
    added.sort();
    assert_eq!(added, vec!["add 0 run -s yyy", "add 1500 run -s zzz"]);
    assert_eq!(calls[5], "init complete");
    assert!(h.scheduler.is_shutting_down());
    assert!(matches!(
        h.scheduler.handover_shutdown(manager.port()).await,
        Err(SchedulerError::HandoverInProgress)
    ));

    // devices are reported free as their invocations end, then the peer is
    // told the handover is complete
    h.runner.release();
    h.join().await;
    let calls = peer.calls();
    assert!(calls.contains(&"free a".to_string()));
    assert!(calls.contains(&"free b".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("complete"));
    manager.cancel_and_wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handed_over_commands_do_not_run_locally() {
    let h = harness(&["a"]).await;
    h.runner.hold();
    h.scheduler.add_command(&args(&["run", "first"])).unwrap();
    assert!(wait_until(|| h.sizes() == sizes(0, 0, 1)).await);
    h.scheduler.add_command(&args(&["run", "second"])).unwrap();
    assert!(wait_until(|| h.sizes() == sizes(1, 0, 1)).await);

    // the device frees up while the commands are in flight to the peer
    let peer = Arc::new(RecordingPeer {
        release_on_add: Some(Arc::clone(&h.runner)),
        ..Default::default()
    });
    let manager = RemoteManager::bind(peer.clone(), 0).await.unwrap();
    h.scheduler.handover_shutdown(manager.port()).await.unwrap();
    h.join().await;

    assert_eq!(h.runner.runs(), vec![(1, "a".to_string())]);
    let calls = peer.calls();
    let allocate = calls.iter().position(|c| c == "allocate a");
    let frees: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| *c == "free a")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(frees.len(), 1, "{calls:?}");
    assert!(allocate.is_some_and(|i| i < frees[0]), "{calls:?}");
    assert_eq!(calls.last().map(String::as_str), Some("complete"));
    manager.cancel_and_wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_handover_connection_can_be_retried() {
    let h = harness(&[]).await;
    let port = free_port();
    assert!(matches!(
        h.scheduler.handover_shutdown(port).await,
        Err(SchedulerError::Remote(_))
    ));
    assert!(matches!(
        h.scheduler.handover_shutdown(port).await,
        Err(SchedulerError::Remote(_))
    ));
    assert!(!h.scheduler.is_shutting_down());
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_peer_allocates_and_frees_devices() {
    let h = harness(&["a", "b"]).await;
    h.scheduler.allocate_device("a").unwrap();
    assert_eq!(h.pool.inner.state_of("a"), Some(AllocationState::Allocated));
    assert!(matches!(
        h.scheduler.allocate_device("a"),
        Err(SchedulerError::DeviceBusy { .. })
    ));
    assert!(matches!(
        RemoteCommandHandler::free_device(h.scheduler.as_ref(), "b"),
        Err(SchedulerError::DeviceNotFound { .. })
    ));

    // a command for the remotely held device waits until it is freed
    h.scheduler.add_command(&args(&["run", "-s", "a"])).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.runner.runs().is_empty());
    RemoteCommandHandler::free_device(h.scheduler.as_ref(), "*").unwrap();
    assert!(wait_until(|| h.runner.runs() == vec![(1, "a".to_string())]).await);
    h.finish().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_manager_starts_on_boot() {
    let mut config = test_config();
    config.remote.start_on_boot = true;
    config.remote.port = 0;
    let h = harness_with(Vec::new(), config, ArgsConfigurationFactory::new()).await;

    let port = h.scheduler.remote_port().unwrap();
    let client = RemoteClient::connect(port).await.unwrap();
    assert!(client
        .send_add_command(Duration::ZERO, &args(&["run"]))
        .await
        .unwrap());
    assert_eq!(h.sizes(), sizes(1, 0, 0));
    drop(client);

    h.finish().await;
    assert_eq!(h.scheduler.remote_port(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn new_instance_takes_over_from_the_running_one() {
    let port = free_port();
    let mut config = test_config();
    config.remote.start_on_boot = true;
    config.remote.port = port;
    config.remote.auto_handover = true;

    let old = harness_with(Vec::new(), config.clone(), ArgsConfigurationFactory::new()).await;
    assert_eq!(old.scheduler.remote_port(), Some(port));
    old.scheduler
        .add_command_with_exec_time(&args(&["run", "-s", "zzz"]), Duration::from_secs(3))
        .unwrap();

    // the default port is taken: the new instance asks the old one to hand over
    let new = harness_with(Vec::new(), config, ArgsConfigurationFactory::new()).await;
    old.join().await;
    assert!(old.scheduler.is_shutdown());

    assert_eq!(new.sizes(), sizes(1, 0, 0));
    let info = new.scheduler.commands_info(None).unwrap();
    assert_eq!(info, vec!["Command 1: [0m:03] run -s zzz"]);

    // once the old instance is gone the new one moves to the default port
    assert!(wait_until(|| new.scheduler.remote_port() == Some(port)).await);
    new.finish().await;
}
