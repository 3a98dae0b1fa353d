//! Executive core
//!
//! Owns the task table, the scheduler, the timer heap, SVC dispatch, and
//! the debug surface (breakpoints, watches, trace). The executive is the
//! only writer of task state; the control plane mutates tasks exclusively
//! through these APIs, and the executive itself touches VM registers and
//! memory only through the MiniVM accessors.

pub mod svc;
pub mod task;
pub mod timer;

use crate::events::{EventLog, EventPayload, MemAccessInfo};
use crate::hal::HalVtables;
use crate::image::{HxeImage, LoadError};
use crate::mailbox::{self, MailboxManager, Message, RecvWake, SendWake};
use crate::persist::PersistStore;
use crate::profile::{MemoryLayout, Profile};
use crate::registry::{Registry, ValueDesc};
use crate::symbols::SymbolTable;
use crate::vm::{opcode, MiniVm, StepOutcome, VmContext};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;
use task::{MetaSummary, Task, TaskState, TraceConfig, TraceEntry, Watch};
use thiserror::Error;
use timer::{TimerEntry, TimerHeap, TimerKind};
use tracing::{debug, info, warn};

/// Runtime version reported by `info` and the core SVC module.
pub const RUNTIME_VERSION: u32 = 0x0002_0000;

/// Step budget for synchronous command handler invocation.
const CMD_STEP_BUDGET: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("instance of {0} already running")]
    InstanceExists(String),
    #[error("task table full")]
    TooManyTasks,
    #[error("no such pid {0}")]
    NoSuchPid(u32),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("address 0x{0:08x} out of range")]
    BadAddress(u32),
    #[error("register index {0} out of range")]
    BadRegister(u32),
    #[error("breakpoint limit reached")]
    TooManyBreakpoints,
    #[error("watch limit reached")]
    TooManyWatches,
    #[error("cannot resolve expression {0}")]
    BadExpression(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("symbols: {0}")]
    Symbols(#[from] crate::symbols::SymbolError),
    #[error("no such command oid {0:#06x}")]
    NoSuchCommand(u16),
}

impl ExecError {
    /// Stable wire string for the control protocol.
    pub fn wire_code(&self) -> String {
        match self {
            ExecError::Load(e) => e.wire_code(),
            ExecError::InstanceExists(_) => "instance_exists".into(),
            ExecError::TooManyTasks => "too_many_tasks".into(),
            ExecError::NoSuchPid(p) => format!("no_such_pid:{p}"),
            ExecError::InvalidTransition { .. } => "invalid_transition".into(),
            ExecError::BadAddress(_) => "bad_address".into(),
            ExecError::BadRegister(_) => "bad_register".into(),
            ExecError::TooManyBreakpoints => "too_many_breakpoints".into(),
            ExecError::TooManyWatches => "too_many_watches".into(),
            ExecError::BadExpression(_) => "bad_expression".into(),
            ExecError::Io(_) => "io_error".into(),
            ExecError::Symbols(_) => "symbol_error".into(),
            ExecError::NoSuchCommand(_) => "no_such_command".into(),
        }
    }
}

/// Clock mode reported over the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    Stopped,
    Paused,
    Active,
    Rate,
    Sleep,
    Throttled,
    Idle,
}

impl ClockMode {
    pub fn name(&self) -> &'static str {
        match self {
            ClockMode::Stopped => "stopped",
            ClockMode::Paused => "paused",
            ClockMode::Active => "active",
            ClockMode::Rate => "rate",
            ClockMode::Sleep => "sleep",
            ClockMode::Throttled => "throttled",
            ClockMode::Idle => "idle",
        }
    }
}

/// Auto-clock bookkeeping.
#[derive(Debug, Clone)]
pub struct ClockState {
    pub mode: ClockMode,
    pub rate_hz: f64,
    pub throttle_reason: Option<String>,
    pub last_wait_s: f64,
}

impl Default for ClockState {
    fn default() -> Self {
        Self { mode: ClockMode::Stopped, rate_hz: 0.0, throttle_reason: None, last_wait_s: 0.0 }
    }
}

/// Result of a `load`.
#[derive(Debug, Clone)]
pub struct LoadInfo {
    pub pid: u32,
    pub app_name: String,
    pub meta: MetaSummary,
}

/// Result of a `step`/batch run.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub executed: u64,
    /// Why the loop stopped early, when it did.
    pub stopped: Option<String>,
}

/// Snapshot for `ps`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskInfo {
    pub pid: u32,
    pub app_name: String,
    pub state: String,
    pub path: String,
    pub priority: u8,
    pub quantum: u32,
    pub steps: u64,
    pub pc: u32,
    pub meta: MetaSummary,
}

struct PrevRun {
    pid: u32,
    executed: u64,
    post_state: &'static str,
    reason: String,
}

pub struct Executive {
    profile: Profile,
    layout: MemoryLayout,
    vm: MiniVm,
    tasks: BTreeMap<u32, Task>,
    ready: VecDeque<u32>,
    next_pid: u32,
    windows: Vec<Option<u32>>,
    timers: TimerHeap,
    pub mailboxes: MailboxManager,
    pub registry: Registry,
    pub events: EventLog,
    pub hal: HalVtables,
    persist: Option<Box<dyn PersistStore>>,
    pub clock: ClockState,
    start: Instant,
    prev_run: Option<PrevRun>,
    /// Terminal state of the most recently reaped task, for the scheduler
    /// event emitted after it is gone.
    last_terminal: Option<(u32, TaskState)>,
}

impl Executive {
    pub fn new(profile: Profile) -> Self {
        let layout = MemoryLayout::default();
        Self {
            profile,
            layout,
            vm: MiniVm::new(layout),
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            next_pid: 1,
            windows: vec![None; profile.max_tasks],
            timers: TimerHeap::default(),
            mailboxes: MailboxManager::new(profile),
            registry: Registry::new(profile),
            events: EventLog::default(),
            hal: HalVtables::default(),
            persist: None,
            clock: ClockState::default(),
            start: Instant::now(),
            prev_run: None,
            last_terminal: None,
        }
    }

    pub fn set_persist(&mut self, store: Box<dyn PersistStore>) {
        self.persist = Some(store);
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Milliseconds since executive start; the time base for all deadlines.
    pub fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    // ------------------------------------------------------------------
    // Task admission

    /// Load an image from disk, admitting it as a task.
    pub fn load_path(&mut self, path: &Path) -> Result<LoadInfo, ExecError> {
        let bytes = std::fs::read(path)?;
        self.load_bytes(&bytes, path.to_path_buf())
    }

    /// Admit an image already in memory.
    pub fn load_bytes(&mut self, bytes: &[u8], path: PathBuf) -> Result<LoadInfo, ExecError> {
        let image = HxeImage::parse(bytes)?;

        let base_name = image
            .app_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("app")
                    .to_string()
            });
        let instances = self
            .tasks
            .values()
            .filter(|t| t.base_name == base_name)
            .count();
        if instances > 0 {
            let allows = image.allows_multiple_instances()
                && self
                    .tasks
                    .values()
                    .filter(|t| t.base_name == base_name)
                    .all(|t| t.allow_multiple);
            if !allows {
                return Err(ExecError::InstanceExists(base_name));
            }
        }
        let app_name = if instances == 0 {
            base_name.clone()
        } else {
            format!("{base_name}_#{instances}")
        };

        let slot = self
            .windows
            .iter()
            .position(|w| w.is_none())
            .ok_or(ExecError::TooManyTasks)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        self.windows[slot] = Some(pid);

        let window_base = slot as u32 * self.layout.window_len;
        self.vm.ensure_arena((slot + 1) * self.layout.window_len as usize);
        let ctx = VmContext {
            reg_base: window_base + self.layout.reg_file_off(),
            sp: self.layout.stack_top(),
            stack_limit: 0,
            pc: image.entry,
            psw: 0,
            code_len: image.code.len() as u32,
        };
        self.vm.set_context(ctx);
        if let Err(f) = self.vm.attach_image(&image) {
            self.windows[slot] = None;
            return Err(ExecError::BadAddress(match f {
                crate::vm::Fault::OutOfBounds(a) => a,
                _ => 0,
            }));
        }
        let ctx = self.vm.context();

        let symbols = match SymbolTable::load_for_image(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!(pid, "symbol sidecar rejected: {e}");
                None
            }
        };

        let mut task = Task {
            pid,
            path,
            app_name: app_name.clone(),
            base_name,
            allow_multiple: image.allows_multiple_instances(),
            state: TaskState::Ready,
            ctx,
            window_base,
            window_slot: slot,
            entry: image.entry,
            priority: 0,
            time_slice: 1,
            steps: 0,
            auth_level: 0,
            sleep_deadline_ms: None,
            wait: None,
            exit_status: None,
            breakpoints: Default::default(),
            bp_skip_once: false,
            watches: Vec::new(),
            next_watch_id: 1,
            symbols,
            meta: MetaSummary::default(),
            trace: TraceConfig::default(),
            trace_ring: VecDeque::new(),
            last_trace: None,
        };
        task.meta = self.wire_metadata(pid, &image);
        self.tasks.insert(pid, task);
        self.enqueue_ready(pid);
        self.events.emit(Some(pid), EventPayload::TaskState {
            prev_state: "none".into(),
            new_state: "ready".into(),
            reason: "loaded".into(),
            details: Some(serde_json::json!({ "app_name": app_name })),
        });
        info!(pid, app = %app_name, "task loaded");
        Ok(LoadInfo { pid, app_name, meta: self.tasks[&pid].meta })
    }

    /// Register image metadata: mailboxes, values (persisted inits applied),
    /// commands, and the task's stdio channels.
    fn wire_metadata(&mut self, pid: u32, image: &HxeImage) -> MetaSummary {
        let mut meta = MetaSummary::default();

        for stream in ["svc:stdio.in", "svc:stdio.out", "svc:stdio.err"] {
            let (st, _, _) =
                self.mailboxes
                    .bind(pid, stream, 0, mailbox::Mode::RDWR, &mut self.events);
            if st != mailbox::status::OK {
                warn!(pid, stream, "stdio bind failed: {st}");
            }
        }

        for m in &image.mailboxes {
            let Some(target) = image.pool_str(m.target_off) else { continue };
            let mode = mailbox::Mode::from_bits_truncate(m.mode_flags);
            let mode = if mode.intersection(mailbox::Mode::RDWR).is_empty() {
                mode | mailbox::Mode::RDWR
            } else {
                mode
            };
            let (st, _, _) =
                self.mailboxes
                    .bind(pid, target, m.depth as u32, mode, &mut self.events);
            if st == mailbox::status::OK {
                meta.mailboxes += 1;
            } else {
                warn!(pid, target, "metadata mailbox bind failed: {st}");
            }
        }

        for v in &image.values {
            let mut init = v.init_half;
            let persist_key = (v.persist_key != 0).then_some(v.persist_key);
            if let (Some(key), Some(store)) = (persist_key, self.persist.as_deref()) {
                if let Some(stored) = store.load(key) {
                    init = stored;
                }
            }
            let desc = ValueDesc {
                name: image.pool_str(v.name_off).map(str::to_string),
                unit: image.pool_str(v.unit_off).map(str::to_string),
                epsilon_half: v.epsilon_half,
                min_half: v.min_half,
                max_half: v.max_half,
                persist_key,
            };
            let (st, _) = self.registry.register_value(
                pid,
                v.group,
                v.value_id,
                v.flags,
                v.auth_level,
                init,
                desc,
                &mut self.events,
            );
            if st == crate::registry::status::OK {
                meta.values += 1;
            } else {
                warn!(pid, oid = v.oid(), "metadata value rejected: {st}");
            }
        }

        for c in &image.commands {
            let (st, _) = self.registry.register_command(
                pid,
                c.group,
                c.cmd_id,
                c.flags,
                c.auth_level,
                c.handler_off,
                image.pool_str(c.name_off),
                image.pool_str(c.help_off),
                &mut self.events,
            );
            if st == crate::registry::status::OK {
                meta.commands += 1;
            } else {
                warn!(pid, oid = c.oid(), "metadata command rejected: {st}");
            }
        }
        meta
    }

    // ------------------------------------------------------------------
    // State machine

    fn task(&self, pid: u32) -> Result<&Task, ExecError> {
        self.tasks.get(&pid).ok_or(ExecError::NoSuchPid(pid))
    }

    fn task_mut(&mut self, pid: u32) -> Result<&mut Task, ExecError> {
        self.tasks.get_mut(&pid).ok_or(ExecError::NoSuchPid(pid))
    }

    pub fn has_task(&self, pid: u32) -> bool {
        self.tasks.contains_key(&pid)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.tasks.keys().copied().collect()
    }

    fn enqueue_ready(&mut self, pid: u32) {
        if !self.ready.contains(&pid) {
            self.ready.push_back(pid);
        }
    }

    /// Central transition point: validates, emits `task_state`, and runs
    /// terminal cleanup. Terminal tasks are removed after their event.
    fn set_state(
        &mut self,
        pid: u32,
        to: TaskState,
        reason: &str,
        details: Option<serde_json::Value>,
    ) -> Result<(), ExecError> {
        let task = self.tasks.get_mut(&pid).ok_or(ExecError::NoSuchPid(pid))?;
        let from = task.state;
        if !task::transition_allowed(from, to) {
            return Err(ExecError::InvalidTransition { from: from.name(), to: to.name() });
        }
        task.state = to;
        if to == TaskState::Ready {
            self.enqueue_ready(pid);
        } else {
            self.ready.retain(|&p| p != pid);
        }
        self.events.emit(Some(pid), EventPayload::TaskState {
            prev_state: from.name().into(),
            new_state: to.name().into(),
            reason: reason.into(),
            details,
        });
        if to.is_terminal() {
            self.last_terminal = Some((pid, to));
            self.reap(pid);
        }
        Ok(())
    }

    /// Free everything a terminal task owned.
    fn reap(&mut self, pid: u32) {
        self.mailboxes.purge_pid(pid);
        self.registry.purge_pid(pid, &mut self.events);
        self.timers.remove_pid(pid);
        self.ready.retain(|&p| p != pid);
        if let Some(task) = self.tasks.remove(&pid) {
            self.windows[task.window_slot] = None;
            debug!(pid, "task reaped");
        }
    }

    /// Cancel a blocking wait or sleep, pushing the timeout status into the
    /// task's register window.
    fn cancel_blocking(&mut self, pid: u32) {
        let Some(task) = self.tasks.get_mut(&pid) else { return };
        task.sleep_deadline_ms = None;
        if let Some(wait) = task.wait.take() {
            self.mailboxes.cancel_wait(pid, wait.descriptor);
            let ctx = task.ctx;
            let saved = self.vm.context();
            self.vm.set_context(ctx);
            self.vm.register_write(0, mailbox::status::TIMEOUT as u32);
            if let Some(t) = self.tasks.get_mut(&pid) {
                t.ctx = self.vm.context();
            }
            self.vm.set_context(saved);
        }
    }

    pub fn pause(&mut self, pid: u32, reason: &str) -> Result<(), ExecError> {
        self.task(pid)?;
        self.cancel_blocking(pid);
        self.set_state(pid, TaskState::Paused, reason, None)
    }

    pub fn resume(&mut self, pid: u32) -> Result<(), ExecError> {
        self.task(pid)?;
        self.set_state(pid, TaskState::Ready, "resume", None)
    }

    pub fn kill(&mut self, pid: u32) -> Result<(), ExecError> {
        self.task(pid)?;
        // Kill wins any race with a pending wake or deadline; the wait is
        // dropped before the single terminal event.
        if let Some(task) = self.tasks.get_mut(&pid) {
            if let Some(wait) = task.wait.take() {
                self.mailboxes.cancel_wait(pid, wait.descriptor);
            }
        }
        self.set_state(pid, TaskState::Killed, "killed", None)
    }

    /// Kill every task and stop the clock.
    pub fn shutdown(&mut self) {
        for pid in self.pids() {
            let _ = self.kill(pid);
        }
        self.clock.mode = ClockMode::Stopped;
    }

    pub fn restart(&mut self, pids: &[u32]) -> Result<Vec<LoadInfo>, ExecError> {
        let mut out = Vec::new();
        for &pid in pids {
            let path = self.task(pid)?.path.clone();
            self.kill(pid)?;
            out.push(self.load_path(&path)?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Scheduling

    fn expire_timers(&mut self) {
        let now = self.now_ms();
        for entry in self.timers.expire(now) {
            let TimerEntry { pid, kind, deadline_ms } = entry;
            match kind {
                TimerKind::Sleep => {
                    let due = self
                        .tasks
                        .get(&pid)
                        .is_some_and(|t| {
                            t.state == TaskState::Sleeping
                                && t.sleep_deadline_ms == Some(deadline_ms)
                        });
                    if due {
                        if let Some(t) = self.tasks.get_mut(&pid) {
                            t.sleep_deadline_ms = None;
                        }
                        let _ = self.set_state(pid, TaskState::Ready, "timeout", None);
                    }
                }
                TimerKind::MbxTimeout { descriptor } => {
                    let waiting = self.tasks.get(&pid).is_some_and(|t| {
                        t.state == TaskState::WaitMbx
                            && t.wait.as_ref().map(|w| w.descriptor) == Some(descriptor)
                    });
                    if waiting {
                        self.cancel_blocking(pid);
                        self.events.emit(Some(pid), EventPayload::MailboxTimeout {
                            descriptor,
                            pid,
                        });
                        let _ = self.set_state(pid, TaskState::Ready, "timeout", None);
                    }
                }
            }
        }
    }

    fn pick_next(&mut self, filter: Option<u32>) -> Option<u32> {
        if let Some(pid) = filter {
            return self
                .tasks
                .get(&pid)
                .filter(|t| t.state == TaskState::Ready)
                .map(|t| t.pid);
        }
        while let Some(pid) = self.ready.pop_front() {
            if self.tasks.get(&pid).is_some_and(|t| t.state == TaskState::Ready) {
                return Some(pid);
            }
        }
        None
    }

    fn emit_switch(&mut self, next_pid: u32, quantum: u32, source: &str) {
        let prev = self.prev_run.take();
        self.events.emit(None, EventPayload::Scheduler {
            state: "switch".into(),
            prev_pid: prev.as_ref().map(|p| p.pid),
            next_pid: Some(next_pid),
            reason: prev.as_ref().map(|p| p.reason.clone()).unwrap_or_else(|| "dispatch".into()),
            quantum_remaining: Some(quantum),
            prev_state: prev.as_ref().map(|p| p.post_state.into()),
            post_state: prev.as_ref().map(|p| p.post_state.into()),
            next_state: Some("running".into()),
            executed: prev.as_ref().map(|p| p.executed),
            source: source.into(),
        });
    }

    /// Run up to `n` instructions, optionally restricted to one PID.
    /// Strict round-robin; each turn runs the task's time-slice weight.
    pub fn step_n(&mut self, n: u64, filter: Option<u32>, source: &str) -> StepReport {
        if let Some(pid) = filter {
            if !self.has_task(pid) {
                return StepReport { executed: 0, stopped: Some(format!("no_such_pid:{pid}")) };
            }
        }
        let mut report = StepReport::default();
        'outer: while report.executed < n {
            self.expire_timers();
            let Some(pid) = self.pick_next(filter) else {
                report.stopped = Some(self.idle_reason());
                break;
            };
            let quantum = self
                .tasks
                .get(&pid)
                .map(|t| t.time_slice.max(1))
                .unwrap_or(1)
                .min((n - report.executed) as u32);
            if self.set_state(pid, TaskState::Running, "dispatch", None).is_err() {
                continue;
            }
            self.emit_switch(pid, quantum, source);
            if let Some(task) = self.tasks.get(&pid) {
                self.vm.set_context(task.ctx);
            }
            let mut q_exec = 0u64;
            let mut still_running = true;
            for _ in 0..quantum {
                still_running = self.exec_instruction(pid, &mut q_exec);
                if !still_running {
                    break;
                }
            }
            report.executed += q_exec;
            if !still_running {
                let post = self
                    .tasks
                    .get(&pid)
                    .map(|t| t.state)
                    .or_else(|| {
                        self.last_terminal
                            .filter(|(p, _)| *p == pid)
                            .map(|(_, s)| s)
                    })
                    .unwrap_or(TaskState::Killed);
                self.prev_run = Some(PrevRun {
                    pid,
                    executed: q_exec,
                    post_state: post.name(),
                    reason: stop_reason(post).into(),
                });
                continue 'outer;
            }
            // Quantum spent with the task still running: preempt.
            if self.tasks.get(&pid).is_some_and(|t| t.state == TaskState::Running) {
                let _ = self.set_state(pid, TaskState::Ready, "quantum_expired", None);
                self.prev_run = Some(PrevRun {
                    pid,
                    executed: q_exec,
                    post_state: "ready",
                    reason: "quantum_expired".into(),
                });
            }
        }
        self.update_clock_idle();
        report
    }

    fn idle_reason(&self) -> String {
        if self.tasks.is_empty() {
            "no_tasks".into()
        } else if self
            .tasks
            .values()
            .any(|t| matches!(t.state, TaskState::Sleeping | TaskState::WaitMbx))
        {
            "all_blocked".into()
        } else {
            "all_paused".into()
        }
    }

    fn update_clock_idle(&mut self) {
        if !matches!(self.clock.mode, ClockMode::Active | ClockMode::Rate) {
            return;
        }
        let runnable = self.tasks.values().any(|t| t.state == TaskState::Ready);
        if runnable {
            self.clock.throttle_reason = None;
            return;
        }
        if let Some(deadline) = self.timers.next_deadline() {
            let wait = (deadline - self.now_ms()).max(0) as f64 / 1000.0;
            self.clock.throttle_reason = Some("all_blocked".into());
            self.clock.last_wait_s = wait;
        } else if self.tasks.is_empty() {
            self.clock.throttle_reason = Some("no_tasks".into());
        } else {
            self.clock.throttle_reason = Some("all_paused".into());
        }
    }

    /// Execute exactly one instruction of the running task. Returns false
    /// when the task left `RUNNING`. `executed` counts retired instructions.
    fn exec_instruction(&mut self, pid: u32, executed: &mut u64) -> bool {
        let pc = self.vm.pc();
        let (hit_bp, trace_on) = {
            let Some(task) = self.tasks.get(&pid) else { return false };
            (
                !task.bp_skip_once && task.breakpoints.contains(&pc),
                task.trace.enabled,
            )
        };
        if hit_bp {
            self.save_running_ctx(pid);
            self.events.emit(Some(pid), EventPayload::DebugBreak {
                pc,
                reason: "BRK".into(),
                breakpoint_id: Some(pc),
            });
            if let Some(task) = self.tasks.get_mut(&pid) {
                task.bp_skip_once = true;
            }
            let _ = self.set_state(pid, TaskState::Paused, "debug_break", None);
            return false;
        }
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.bp_skip_once = false;
        }

        let mut regs_before = [0u32; 16];
        for (i, slot) in regs_before.iter_mut().enumerate() {
            *slot = self.vm.register_read(i);
        }
        let outcome = self.vm.step(None);
        *executed += 1;
        self.save_running_ctx(pid);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.steps += 1;
        }
        self.record_trace(pid, regs_before, trace_on);
        self.check_watches(pid);

        match outcome {
            StepOutcome::Normal => true,
            StepOutcome::Halt(_) => {
                let status = self.vm.register_read(0) as i32;
                if let Some(task) = self.tasks.get_mut(&pid) {
                    task.exit_status = Some(status);
                }
                let _ = self.set_state(
                    pid,
                    TaskState::Returned,
                    "returned",
                    Some(serde_json::json!({ "status": status })),
                );
                false
            }
            StepOutcome::Fault(f) => {
                let status = f.code() as i32;
                if let Some(task) = self.tasks.get_mut(&pid) {
                    task.exit_status = Some(status);
                }
                let _ = self.set_state(
                    pid,
                    TaskState::Returned,
                    "returned",
                    Some(serde_json::json!({ "status": status, "fault": f.name() })),
                );
                false
            }
            StepOutcome::SyscallTrap { module, function, args } => {
                self.dispatch_svc(pid, module, function, args)
            }
            // Breakpoints are checked above, never inside the VM here.
            StepOutcome::BreakPoint(_) => true,
        }
    }

    /// The running task's context snapshot after the current instruction.
    fn save_running_ctx(&mut self, pid: u32) {
        let ctx = self.vm.context();
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.ctx = ctx;
        }
    }

    fn record_trace(&mut self, pid: u32, regs_before: [u32; 16], ring: bool) {
        let regs_after = self.vm.last_regs();
        let changed: Vec<u8> = (0..16u8)
            .filter(|&i| regs_before[i as usize] != regs_after[i as usize])
            .collect();
        let word = self.vm.last_word();
        let op = (word >> 24) as u8;
        let entry = TraceEntry {
            pc: self.vm.last_pc(),
            next_pc: self.vm.pc(),
            word,
            opcode: opcode::mnemonic(op).unwrap_or("??").to_string(),
            flags: self.vm.psw_bits(),
            regs: regs_after.to_vec(),
            changed_regs: changed.clone(),
            steps: self.tasks.get(&pid).map(|t| t.steps).unwrap_or(0),
            mem_op: self
                .vm
                .last_mem_access()
                .map(|a| if a.write { "write".into() } else { "read".into() }),
            mem_addr: self.vm.last_mem_access().map(|a| a.address),
        };
        if ring {
            self.events.emit(Some(pid), EventPayload::TraceStep {
                pc: entry.pc,
                next_pc: entry.next_pc,
                opcode: entry.opcode.clone(),
                flags: Some(entry.flags),
                regs: entry.regs.clone(),
                steps: entry.steps,
                changed_regs: changed,
                mem_access: self.vm.last_mem_access().map(|a| MemAccessInfo {
                    op: if a.write { "write".into() } else { "read".into() },
                    address: a.address,
                    width: Some(a.width),
                    value: Some(a.value),
                }),
            });
        }
        if let Some(task) = self.tasks.get_mut(&pid) {
            if ring {
                task.push_trace(entry.clone());
            }
            task.last_trace = Some(entry);
        }
    }

    fn check_watches(&mut self, pid: u32) {
        let watch_specs: Vec<(u32, String, u32, u32, Vec<u8>)> = match self.tasks.get(&pid) {
            Some(t) if !t.watches.is_empty() => t
                .watches
                .iter()
                .map(|w| (w.id, w.expr.clone(), w.address, w.length, w.last.clone()))
                .collect(),
            _ => return,
        };
        for (id, expr, address, length, last) in watch_specs {
            let Ok(now) = self.vm.read_bytes(address, length) else { continue };
            if now != last {
                self.events.emit(Some(pid), EventPayload::WatchUpdate {
                    id,
                    expr,
                    address,
                    length,
                    bytes: hex(&now),
                    prev: hex(&last),
                });
                if let Some(task) = self.tasks.get_mut(&pid) {
                    if let Some(w) = task.watches.iter_mut().find(|w| w.id == id) {
                        w.last = now;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Wake plumbing (mailbox deliveries into parked tasks)

    /// Apply receive wakes: copy payload + info into the waiter's window and
    /// unblock it.
    fn apply_recv_wakes(&mut self, wakes: Vec<RecvWake>) {
        for wake in wakes {
            let RecvWake { pid, ctx: wait, msg } = wake;
            let Some(task) = self.tasks.get_mut(&pid) else { continue };
            if task.state != TaskState::WaitMbx {
                continue;
            }
            let task_ctx = task.ctx;
            let saved = self.vm.context();
            self.vm.set_context(task_ctx);
            self.write_recv_result(&wait, &msg);
            if let Some(t) = self.tasks.get_mut(&pid) {
                t.ctx = self.vm.context();
                t.wait = None;
            }
            self.vm.set_context(saved);
            self.events.emit(Some(pid), EventPayload::MailboxWake {
                descriptor: wait.descriptor,
                target: self
                    .mailboxes
                    .descriptor(wait.descriptor)
                    .map(|d| d.name.clone())
                    .unwrap_or_default(),
                pid,
            });
            let _ = self.set_state(pid, TaskState::Ready, "mailbox_wake", None);
        }
    }

    /// Marshal a received message into the current VM context's registers
    /// and buffers. Register convention: R0 status, R1 length, R2 flags,
    /// R3 channel, R4 src_pid.
    fn write_recv_result(&mut self, wait: &mailbox::WaitCtx, msg: &Message) {
        let full_len = msg.payload.len() as u32;
        let copy_len = full_len.min(wait.max_len) as usize;
        if wait.buf_ptr != 0 && copy_len > 0 {
            let _ = self.vm.write_bytes(wait.buf_ptr, &msg.payload[..copy_len]);
        }
        if wait.info_ptr != 0 {
            let mut info = Vec::with_capacity(8);
            info.extend_from_slice(&(full_len as u16).to_le_bytes());
            info.push(msg.flags);
            info.push(msg.channel);
            info.extend_from_slice(&(msg.src_pid as u16).to_le_bytes());
            info.extend_from_slice(&[0, 0]);
            let _ = self.vm.write_bytes(wait.info_ptr, &info);
        }
        let status = if full_len > wait.max_len {
            mailbox::status::MSG_TOO_LARGE
        } else {
            mailbox::status::OK
        };
        self.vm.register_write(0, status as u32);
        self.vm.register_write(1, full_len);
        self.vm.register_write(2, msg.flags as u32);
        self.vm.register_write(3, msg.channel as u32);
        self.vm.register_write(4, msg.src_pid);
    }

    /// Apply sender wakes: report the accepted byte count and unblock.
    fn apply_send_wakes(&mut self, wakes: Vec<SendWake>) {
        for wake in wakes {
            let SendWake { pid, bytes } = wake;
            let Some(task) = self.tasks.get_mut(&pid) else { continue };
            if task.state != TaskState::WaitMbx {
                continue;
            }
            let task_ctx = task.ctx;
            let saved = self.vm.context();
            self.vm.set_context(task_ctx);
            self.vm.register_write(0, mailbox::status::OK as u32);
            self.vm.register_write(1, bytes);
            if let Some(t) = self.tasks.get_mut(&pid) {
                t.ctx = self.vm.context();
                t.wait = None;
            }
            self.vm.set_context(saved);
            let _ = self.set_state(pid, TaskState::Ready, "mailbox_wake", None);
        }
    }

    /// Post a message to a canonical mailbox target on behalf of the
    /// control plane or the registry (src_pid 0 = executive origin).
    pub fn post_message(&mut self, caller: u32, target: &str, payload: &[u8], channel: u8) -> i32 {
        let (st, handle) =
            self.mailboxes
                .open(caller, target, mailbox::Mode::WRONLY, &mut self.events);
        if st != mailbox::status::OK {
            return st;
        }
        let verdict = self.mailboxes.send(
            caller,
            handle,
            payload,
            0,
            channel,
            mailbox::Timeout::Poll,
            &mut self.events,
        );
        self.mailboxes.close(caller, handle);
        match verdict {
            mailbox::IoVerdict::Done { status, result } => {
                self.apply_recv_wakes(result.recv_wakes);
                self.apply_send_wakes(result.send_wakes);
                status
            }
            mailbox::IoVerdict::Blocked { .. } => mailbox::status::WOULDBLOCK,
        }
    }

    // ------------------------------------------------------------------
    // Debug surface

    pub fn bp_set(&mut self, pid: u32, addr: u32) -> Result<(), ExecError> {
        let max = self.profile.max_breakpoints;
        let task = self.task_mut(pid)?;
        if task.breakpoints.len() >= max && !task.breakpoints.contains(&addr) {
            return Err(ExecError::TooManyBreakpoints);
        }
        task.breakpoints.insert(addr);
        Ok(())
    }

    pub fn bp_clear(&mut self, pid: u32, addr: u32) -> Result<(), ExecError> {
        // Clearing an absent breakpoint is not an error.
        self.task_mut(pid)?.breakpoints.remove(&addr);
        Ok(())
    }

    pub fn bp_list(&self, pid: u32) -> Result<Vec<u32>, ExecError> {
        let mut v: Vec<u32> = self.task(pid)?.breakpoints.iter().copied().collect();
        v.sort_unstable();
        Ok(v)
    }

    pub fn watch_add(&mut self, pid: u32, expr: &str, length: u32) -> Result<u32, ExecError> {
        let max = self.profile.max_watches;
        let address = {
            let task = self.task(pid)?;
            task.symbols
                .as_ref()
                .and_then(|s| s.resolve(expr))
                .or_else(|| SymbolTable::default().resolve(expr))
                .ok_or_else(|| ExecError::BadExpression(expr.to_string()))?
        };
        let length = length.clamp(1, 64);
        let initial = self.read_task_mem(pid, address, length)?;
        let task = self.task_mut(pid)?;
        if task.watches.len() >= max {
            return Err(ExecError::TooManyWatches);
        }
        let id = task.next_watch_id;
        task.next_watch_id += 1;
        task.watches.push(Watch {
            id,
            expr: expr.to_string(),
            address,
            length,
            last: initial,
        });
        Ok(id)
    }

    pub fn watch_clear(&mut self, pid: u32, id: u32) -> Result<(), ExecError> {
        self.task_mut(pid)?.watches.retain(|w| w.id != id);
        Ok(())
    }

    pub fn watch_list(&self, pid: u32) -> Result<Vec<(u32, String, u32, u32)>, ExecError> {
        Ok(self
            .task(pid)?
            .watches
            .iter()
            .map(|w| (w.id, w.expr.clone(), w.address, w.length))
            .collect())
    }

    pub fn trace_configure(&mut self, pid: u32, cfg: TraceConfig) -> Result<(), ExecError> {
        self.task_mut(pid)?.trace = cfg;
        Ok(())
    }

    pub fn trace_export(&self, pid: u32) -> Result<Vec<TraceEntry>, ExecError> {
        Ok(self.task(pid)?.trace_ring.iter().cloned().collect())
    }

    /// Replace the trace ring (offline replay aid).
    pub fn trace_import(&mut self, pid: u32, entries: Vec<TraceEntry>) -> Result<(), ExecError> {
        let task = self.task_mut(pid)?;
        task.trace_ring = entries.into_iter().take(task::TRACE_RING).collect();
        Ok(())
    }

    pub fn vm_trace_last(&self, pid: u32) -> Result<Option<TraceEntry>, ExecError> {
        Ok(self.task(pid)?.last_trace.clone())
    }

    // ------------------------------------------------------------------
    // Inspection through the VM API boundary

    fn with_task_ctx<R>(
        &mut self,
        pid: u32,
        f: impl FnOnce(&mut MiniVm) -> R,
    ) -> Result<R, ExecError> {
        let ctx = self.task(pid)?.ctx;
        let saved = self.vm.context();
        self.vm.set_context(ctx);
        let out = f(&mut self.vm);
        let after = self.vm.context();
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.ctx = after;
        }
        self.vm.set_context(saved);
        Ok(out)
    }

    pub fn read_task_mem(&mut self, pid: u32, addr: u32, len: u32) -> Result<Vec<u8>, ExecError> {
        self.with_task_ctx(pid, |vm| vm.read_bytes(addr, len))?
            .map_err(|_| ExecError::BadAddress(addr))
    }

    pub fn write_task_mem(&mut self, pid: u32, addr: u32, data: &[u8]) -> Result<(), ExecError> {
        self.with_task_ctx(pid, |vm| vm.write_bytes(addr, data))?
            .map_err(|_| ExecError::BadAddress(addr))
    }

    pub fn reg_get(&mut self, pid: u32, reg: u32) -> Result<u32, ExecError> {
        if reg > 15 {
            return Err(ExecError::BadRegister(reg));
        }
        self.with_task_ctx(pid, |vm| vm.register_read(reg as usize))
    }

    pub fn reg_set(&mut self, pid: u32, reg: u32, value: u32) -> Result<(), ExecError> {
        if reg > 15 {
            return Err(ExecError::BadRegister(reg));
        }
        self.with_task_ctx(pid, |vm| vm.register_write(reg as usize, value))
    }

    /// `(regs, pc, sp, psw)`.
    pub fn dumpregs(&mut self, pid: u32) -> Result<([u32; 16], u32, u32, u32), ExecError> {
        let ctx = self.task(pid)?.ctx;
        let regs = self.with_task_ctx(pid, |vm| {
            let mut r = [0u32; 16];
            for (i, slot) in r.iter_mut().enumerate() {
                *slot = vm.register_read(i);
            }
            r
        })?;
        Ok((regs, ctx.pc, ctx.sp, ctx.psw))
    }

    pub fn disasm(
        &mut self,
        pid: u32,
        addr: Option<u32>,
        count: usize,
    ) -> Result<Vec<crate::disasm::DisasmLine>, ExecError> {
        let task = self.task(pid)?;
        let code_len = task.ctx.code_len;
        let start = addr.unwrap_or(task.ctx.pc).min(code_len);
        let code = self.read_task_mem(pid, 0, code_len)?;
        Ok(crate::disasm::disassemble_range(&code, start, count))
    }

    /// Best-effort stack walk: scan for plausible return addresses.
    pub fn stack_walk(&mut self, pid: u32, max: usize) -> Result<Vec<(u32, Option<String>)>, ExecError> {
        let (sp, code_len, symbols) = {
            let task = self.task(pid)?;
            (task.ctx.sp, task.ctx.code_len, task.symbols.clone())
        };
        let top = self.layout.stack_top();
        let mut frames = Vec::new();
        let mut at = sp;
        while at + 4 <= top && frames.len() < max {
            let word = self
                .with_task_ctx(pid, |vm| vm.memory_read(at, 4))?
                .map_err(|_| ExecError::BadAddress(at))?;
            if word % 4 == 0 && word != 0 && word < code_len {
                let name = symbols
                    .as_ref()
                    .and_then(|s| s.lookup_addr(word))
                    .map(|s| s.name.clone());
                frames.push((word, name));
            }
            at += 4;
        }
        Ok(frames)
    }

    /// Region map for the `memory` RPC.
    pub fn memory_regions(&self, pid: u32) -> Result<Vec<(String, u32, u32)>, ExecError> {
        let task = self.task(pid)?;
        let code_len = task.ctx.code_len;
        let ro_base = self.layout.rodata_base;
        let stack_top = self.layout.stack_top();
        Ok(vec![
            ("code".into(), 0, code_len),
            ("rodata".into(), ro_base, task.ctx.stack_limit.saturating_sub(ro_base)),
            ("heap".into(), task.ctx.stack_limit, task.ctx.sp.saturating_sub(task.ctx.stack_limit)),
            ("stack".into(), task.ctx.sp, stack_top.saturating_sub(task.ctx.sp)),
        ])
    }

    pub fn sym_load(&mut self, pid: u32, path: &Path) -> Result<usize, ExecError> {
        let table = SymbolTable::load(path)?;
        let count = table.symbols.len();
        self.task_mut(pid)?.symbols = Some(table);
        Ok(count)
    }

    pub fn symbols_of(&self, pid: u32) -> Result<Option<&SymbolTable>, ExecError> {
        Ok(self.task(pid)?.symbols.as_ref())
    }

    // ------------------------------------------------------------------
    // Scheduler / clock controls

    pub fn sched_set(
        &mut self,
        pid: u32,
        priority: Option<u8>,
        quantum: Option<u32>,
    ) -> Result<(), ExecError> {
        let task = self.task_mut(pid)?;
        if let Some(p) = priority {
            task.priority = p;
        }
        if let Some(q) = quantum {
            task.time_slice = q.max(1);
        }
        Ok(())
    }

    pub fn clock_set(&mut self, mode: ClockMode, rate_hz: Option<f64>) {
        self.clock.mode = mode;
        if let Some(r) = rate_hz {
            self.clock.rate_hz = r;
        }
        let state = EventPayload::Clock {
            state: self.clock.mode.name().into(),
            rate: Some(self.clock.rate_hz),
            throttle_reason: self.clock.throttle_reason.clone(),
            last_wait_s: Some(self.clock.last_wait_s),
        };
        self.events.emit(None, state);
    }

    pub fn ps(&self) -> Vec<TaskInfo> {
        self.tasks
            .values()
            .map(|t| TaskInfo {
                pid: t.pid,
                app_name: t.app_name.clone(),
                state: t.state.name().into(),
                path: t.path.display().to_string(),
                priority: t.priority,
                quantum: t.time_slice,
                steps: t.steps,
                pc: t.ctx.pc,
                meta: t.meta,
            })
            .collect()
    }

    pub fn task_info(&self, pid: u32) -> Result<TaskInfo, ExecError> {
        let t = self.task(pid)?;
        Ok(TaskInfo {
            pid: t.pid,
            app_name: t.app_name.clone(),
            state: t.state.name().into(),
            path: t.path.display().to_string(),
            priority: t.priority,
            quantum: t.time_slice,
            steps: t.steps,
            pc: t.ctx.pc,
            meta: t.meta,
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Scheduler-event reason for a task that left RUNNING mid-quantum.
fn stop_reason(state: TaskState) -> &'static str {
    match state {
        TaskState::WaitMbx => "mailbox_wait",
        TaskState::Sleeping => "sleep",
        TaskState::Paused => "debug_break",
        TaskState::Returned => "returned",
        TaskState::Killed => "killed",
        TaskState::Ready | TaskState::Running => "dispatch",
    }
}
