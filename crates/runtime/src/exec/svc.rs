//! SVC dispatch
//!
//! The executive receives `SyscallTrap` outcomes from the VM and routes
//! them by `(module, function)`: core info, task/stdio, CAN, filesystem,
//! mailboxes, exec (sleep/yield), values, commands, fds, and the libm
//! shim. Results are written back through the VM register API; unknown
//! selectors answer `ENOSYS` in R0.
//!
//! Register conventions: arguments arrive in R1..R5 (captured at trap
//! time), R0 carries the primary status/result, R1..R4 carry secondary
//! results.

use super::{ClockMode, ExecError, Executive, CMD_STEP_BUDGET, RUNTIME_VERSION};
use crate::events::EventPayload;
use crate::exec::task::TaskState;
use crate::exec::timer::{TimerEntry, TimerKind};
use crate::mailbox::{self, IoVerdict, Timeout};
use crate::registry::{self, cmd_done_frame, ValueDesc};
use crate::vm::StepOutcome;
use tracing::debug;

/// `ENOSYS` for unknown `(module, function)` selectors.
pub const ENOSYS: i32 = -38;

/// Module numbers.
pub mod module {
    pub const CORE: u8 = 0x00;
    pub const TASK: u8 = 0x01;
    pub const CAN: u8 = 0x02;
    pub const FS: u8 = 0x04;
    pub const MAILBOX: u8 = 0x05;
    pub const EXEC: u8 = 0x06;
    pub const VALUE: u8 = 0x07;
    pub const COMMAND: u8 = 0x08;
    pub const FD: u8 = 0x0A;
    pub const LIBM: u8 = 0x0E;
}

impl Executive {
    /// Handle one trap for the running task. Returns false when the task
    /// left `RUNNING` (blocked, slept, or exited).
    pub(super) fn dispatch_svc(
        &mut self,
        pid: u32,
        module: u8,
        function: u8,
        args: [u32; 5],
    ) -> bool {
        match module {
            module::CORE => self.svc_core(function, args),
            module::TASK => return self.svc_task(pid, function, args),
            module::CAN => self.svc_can(function, args),
            module::FS => self.svc_fs(function, args),
            module::MAILBOX => return self.svc_mailbox(pid, function, args),
            module::EXEC => return self.svc_exec(pid, function, args),
            module::VALUE => self.svc_value(pid, function, args),
            module::COMMAND => self.svc_command(pid, function, args),
            module::FD => self.svc_fd(function, args),
            module::LIBM => self.svc_libm(function, args),
            _ => {
                debug!(pid, module, function, "unknown svc module");
                self.vm.register_write(0, ENOSYS as u32);
            }
        }
        true
    }

    fn svc_core(&mut self, function: u8, _args: [u32; 5]) {
        match function {
            0x00 => self.vm.register_write(0, 0),
            0x01 => self.vm.register_write(0, RUNTIME_VERSION),
            0x02 => self.vm.register_write(0, self.now_ms() as u32),
            _ => self.vm.register_write(0, ENOSYS as u32),
        }
    }

    fn svc_task(&mut self, pid: u32, function: u8, args: [u32; 5]) -> bool {
        match function {
            // exit(status = R1)
            0x00 => {
                let status = args[0] as i32;
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
            // write(fd = R1, ptr = R2, len = R3)
            0x01 => {
                let (fd, ptr, len) = (args[0], args[1], args[2]);
                let Ok(bytes) = self.vm.read_bytes(ptr, len) else {
                    self.vm.register_write(0, mailbox::status::MSG_TOO_LARGE as u32);
                    return true;
                };
                let stream = if fd == 2 { "svc:stdio.err" } else { "svc:stdio.out" };
                let text = String::from_utf8_lossy(&bytes).to_string();
                let payload = if fd == 2 {
                    EventPayload::Stderr { text }
                } else {
                    EventPayload::Stdout { text }
                };
                self.events.emit(Some(pid), payload);
                // Console mirror for deployments with a physical port.
                self.hal.uart.write(&bytes);
                self.post_message(pid, stream, &bytes, 0);
                self.vm.register_write(0, len);
                true
            }
            // read(fd = R1, ptr = R2, max = R3): poll the stdio.in channel
            0x02 => {
                let (_, ptr, max) = (args[0], args[1], args[2]);
                let (st, handle) = self.mailboxes.open(
                    pid,
                    "svc:stdio.in",
                    mailbox::Mode::RDONLY,
                    &mut self.events,
                );
                if st != mailbox::status::OK {
                    self.vm.register_write(0, 0);
                    return true;
                }
                let verdict = self.mailboxes.recv(
                    pid,
                    handle,
                    ptr,
                    max,
                    0,
                    Timeout::Poll,
                    &mut self.events,
                );
                self.mailboxes.close(pid, handle);
                match verdict {
                    IoVerdict::Done { status, result } if status == mailbox::status::OK => {
                        let msg = result.msg.unwrap_or(mailbox::Message {
                            flags: 0,
                            channel: 0,
                            src_pid: 0,
                            payload: Vec::new(),
                        });
                        let copy = msg.payload.len().min(max as usize);
                        let _ = self.vm.write_bytes(ptr, &msg.payload[..copy]);
                        self.vm.register_write(0, copy as u32);
                    }
                    _ => self.vm.register_write(0, 0),
                }
                true
            }
            0x03 => {
                self.vm.register_write(0, pid);
                true
            }
            // yield
            0x04 => {
                let _ = self.set_state(pid, TaskState::Ready, "yield", None);
                false
            }
            _ => {
                self.vm.register_write(0, ENOSYS as u32);
                true
            }
        }
    }

    fn svc_can(&mut self, function: u8, args: [u32; 5]) {
        let Some(can) = self.hal.can.as_mut() else {
            self.vm.register_write(0, ENOSYS as u32);
            return;
        };
        match function {
            0x00 => {
                let (id, ptr, len) = (args[0], args[1], args[2]);
                match self.vm.read_bytes(ptr, len) {
                    Ok(bytes) => {
                        let st = can.send(id, &bytes);
                        self.vm.register_write(0, st as u32);
                    }
                    Err(_) => self.vm.register_write(0, mailbox::status::MSG_TOO_LARGE as u32),
                }
            }
            0x01 => match can.recv() {
                Some((id, data)) => {
                    let (ptr, max) = (args[0], args[1]);
                    let copy = data.len().min(max as usize);
                    let _ = self.vm.write_bytes(ptr, &data[..copy]);
                    self.vm.register_write(0, copy as u32);
                    self.vm.register_write(1, id);
                }
                None => self.vm.register_write(0, mailbox::status::NO_DATA as u32),
            },
            _ => self.vm.register_write(0, ENOSYS as u32),
        }
    }

    fn svc_fs(&mut self, function: u8, args: [u32; 5]) {
        let Some(path) = self.read_guest_str(args[0], args[1]) else {
            self.vm.register_write(0, crate::hal::HAL_ENOENT as u32);
            return;
        };
        let Some(fs) = self.hal.fs.as_mut() else {
            self.vm.register_write(0, ENOSYS as u32);
            return;
        };
        match function {
            0x00 => {
                let size = fs.size(&path);
                self.vm.register_write(0, size as u32);
            }
            0x01 => {
                let st = fs.remove(&path);
                self.vm.register_write(0, st as u32);
            }
            _ => self.vm.register_write(0, ENOSYS as u32),
        }
    }

    fn svc_mailbox(&mut self, pid: u32, function: u8, args: [u32; 5]) -> bool {
        match function {
            // open(target_ptr = R1, target_len = R2, mode = R3)
            0x00 => {
                let target = self.read_guest_str(args[0], args[1]).unwrap_or_default();
                let mode = mode_or_rdwr(args[2]);
                let (st, handle) = self.mailboxes.open(pid, &target, mode, &mut self.events);
                self.vm.register_write(0, st as u32);
                self.vm.register_write(1, handle);
                true
            }
            // bind(target_ptr, target_len, capacity = R3, mode = R4)
            0x01 => {
                let target = self.read_guest_str(args[0], args[1]).unwrap_or_default();
                let mode = mode_or_rdwr(args[3]);
                let (st, desc, handle) =
                    self.mailboxes
                        .bind(pid, &target, args[2], mode, &mut self.events);
                self.vm.register_write(0, st as u32);
                self.vm.register_write(1, desc);
                self.vm.register_write(2, handle);
                true
            }
            // send(handle, buf, len, flags<<8|channel, timeout)
            0x02 => {
                let (handle, buf, len) = (args[0], args[1], args[2]);
                let flags = (args[3] >> 8) as u8;
                let channel = args[3] as u8;
                let timeout = Timeout::from_raw(args[4]);
                let Ok(payload) = self.vm.read_bytes(buf, len) else {
                    self.vm.register_write(0, mailbox::status::MSG_TOO_LARGE as u32);
                    return true;
                };
                let verdict = self.mailboxes.send(
                    pid,
                    handle,
                    &payload,
                    flags,
                    channel,
                    timeout,
                    &mut self.events,
                );
                match verdict {
                    IoVerdict::Done { status, result } => {
                        self.vm.register_write(0, status as u32);
                        self.vm.register_write(1, result.bytes);
                        self.apply_recv_wakes(result.recv_wakes);
                        self.apply_send_wakes(result.send_wakes);
                        true
                    }
                    IoVerdict::Blocked { ctx } => {
                        self.park_in_mailbox(pid, ctx, timeout);
                        false
                    }
                }
            }
            // recv(handle, buf, max, timeout, info_ptr)
            0x03 => {
                let timeout = Timeout::from_raw(args[3]);
                let verdict = self.mailboxes.recv(
                    pid,
                    args[0],
                    args[1],
                    args[2],
                    args[4],
                    timeout,
                    &mut self.events,
                );
                match verdict {
                    IoVerdict::Done { status, result } => {
                        if let Some(msg) = result.msg {
                            let wait = mailbox::WaitCtx {
                                descriptor: 0,
                                handle: args[0],
                                buf_ptr: args[1],
                                max_len: args[2],
                                info_ptr: args[4],
                                send_msg: None,
                            };
                            self.write_recv_result(&wait, &msg);
                        } else {
                            self.vm.register_write(0, status as u32);
                        }
                        self.apply_send_wakes(result.send_wakes);
                        self.apply_recv_wakes(result.recv_wakes);
                        true
                    }
                    IoVerdict::Blocked { ctx } => {
                        self.park_in_mailbox(pid, ctx, timeout);
                        false
                    }
                }
            }
            // peek(handle)
            0x04 => {
                let (st, depth, used, next_len) = self.mailboxes.peek(pid, args[0]);
                self.vm.register_write(0, st as u32);
                self.vm.register_write(1, depth);
                self.vm.register_write(2, used);
                self.vm.register_write(3, next_len);
                true
            }
            // tap(handle, enable)
            0x05 => {
                let st = self.mailboxes.tap(pid, args[0], args[1] != 0);
                self.vm.register_write(0, st as u32);
                true
            }
            // close(handle)
            0x06 => {
                let st = self.mailboxes.close(pid, args[0]);
                self.vm.register_write(0, st as u32);
                true
            }
            _ => {
                self.vm.register_write(0, ENOSYS as u32);
                true
            }
        }
    }

    /// Park the running task in `WAIT_MBX`, arming the deadline when finite.
    fn park_in_mailbox(&mut self, pid: u32, ctx: mailbox::WaitCtx, timeout: Timeout) {
        let descriptor = ctx.descriptor;
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.wait = Some(ctx);
        }
        if let Timeout::Ms(ms) = timeout {
            self.timers.insert(TimerEntry {
                deadline_ms: self.now_ms() + ms as i64,
                pid,
                kind: TimerKind::MbxTimeout { descriptor },
            });
        }
        let _ = self.set_state(pid, TaskState::WaitMbx, "mailbox_wait", None);
    }

    fn svc_exec(&mut self, pid: u32, function: u8, args: [u32; 5]) -> bool {
        match function {
            // sleep_ms(ms = R1)
            0x00 => {
                let ms = args[0] as i64;
                let deadline = self.now_ms() + ms;
                if let Some(task) = self.tasks.get_mut(&pid) {
                    task.sleep_deadline_ms = Some(deadline);
                }
                self.timers.insert(TimerEntry {
                    deadline_ms: deadline,
                    pid,
                    kind: TimerKind::Sleep,
                });
                let _ = self.set_state(pid, TaskState::Sleeping, "sleep", None);
                false
            }
            0x01 => {
                let _ = self.set_state(pid, TaskState::Ready, "yield", None);
                false
            }
            _ => {
                self.vm.register_write(0, ENOSYS as u32);
                true
            }
        }
    }

    fn svc_value(&mut self, pid: u32, function: u8, args: [u32; 5]) {
        let auth = self.tasks.get(&pid).map(|t| t.auth_level).unwrap_or(0);
        match function {
            // register(group, value, flags, desc_ptr)
            0x00 => {
                let (group, value, flags, desc_ptr) =
                    (args[0] as u8, args[1] as u8, args[2] as u8, args[3]);
                let desc = self.read_value_desc(desc_ptr);
                let (init, auth_level, vd) = desc;
                let (st, oid) = self.registry.register_value(
                    pid, group, value, flags, auth_level, init, vd, &mut self.events,
                );
                self.vm.register_write(0, st as u32);
                self.vm.register_write(1, oid as u32);
            }
            // lookup(group, value) -> oid | -1
            0x01 => {
                let oid = self
                    .registry
                    .lookup_value(args[0] as u8, args[1] as u8)
                    .map(|o| o as u32)
                    .unwrap_or(u32::MAX);
                self.vm.register_write(0, oid);
            }
            // get(oid)
            0x02 => {
                let (st, half) = self.registry.get(pid, auth, args[0] as u16);
                self.vm.register_write(0, st as u32);
                self.vm.register_write(1, half as u32);
            }
            // set(oid, half)
            0x03 => {
                let st = self.value_set(pid, auth, args[0] as u16, args[1] as u16);
                self.vm.register_write(0, st as u32);
            }
            // list(group_filter, out_ptr, max_items)
            0x04 => {
                let filter = if args[0] > 0xFF { None } else { Some(args[0] as u8) };
                let items = self.registry.list_values(filter);
                let max = args[2] as usize;
                let mut written = 0u32;
                let mut at = args[1];
                for (oid, half) in items.into_iter().take(max) {
                    let mut rec = Vec::with_capacity(4);
                    rec.extend_from_slice(&oid.to_le_bytes());
                    rec.extend_from_slice(&half.to_le_bytes());
                    if self.vm.write_bytes(at, &rec).is_err() {
                        break;
                    }
                    at += 4;
                    written += 1;
                }
                self.vm.register_write(0, written);
            }
            // sub(oid, target_ptr, target_len)
            0x05 => {
                let target = self.read_guest_str(args[1], args[2]).unwrap_or_default();
                let st = self.registry.subscribe(pid, args[0] as u16, &target);
                self.vm.register_write(0, st as u32);
            }
            // persist(oid, mode)
            0x06 => {
                let st = self.registry.set_persist(pid, args[0] as u16, args[1] as u8);
                self.vm.register_write(0, st as u32);
            }
            _ => self.vm.register_write(0, ENOSYS as u32),
        }
    }

    /// Optional 12-byte value descriptor block in task memory:
    /// init, epsilon, min, max, persist_key (u16 LE each), auth u8, pad u8.
    fn read_value_desc(&mut self, desc_ptr: u32) -> (u16, u8, ValueDesc) {
        if desc_ptr == 0 {
            return (0, 0, ValueDesc::default());
        }
        let Ok(b) = self.vm.read_bytes(desc_ptr, 12) else {
            return (0, 0, ValueDesc::default());
        };
        let u = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let persist_key = u(8);
        (
            u(0),
            b[10],
            ValueDesc {
                name: None,
                unit: None,
                epsilon_half: u(2),
                min_half: u(4),
                max_half: u(6),
                persist_key: (persist_key != 0).then_some(persist_key),
            },
        )
    }

    /// Shared `set` path: registry update, persistence, notification fan-out.
    pub fn value_set(&mut self, caller: u32, auth: u8, oid: u16, half: u16) -> i32 {
        let now = self.now_ms();
        let (st, notifies) = self.registry.set(caller, auth, oid, half, now, &mut self.events);
        if st != registry::status::OK {
            return st;
        }
        if let Some(key) = self.registry.persist_key_of(oid) {
            if let Some(store) = self.persist.as_mut() {
                if let Err(e) = store.store(key, half) {
                    tracing::warn!(oid, "persist failed: {e}");
                }
            }
        }
        for n in notifies {
            let st = self.post_message(n.subscriber_pid, &n.target, &n.frame, 0);
            if st == mailbox::status::NO_DESCRIPTOR || st == mailbox::status::INVALID_HANDLE {
                // Subscriber's mailbox is gone; drop the subscription.
                self.registry.prune_subscription(&n.target);
            }
        }
        registry::status::OK
    }

    fn svc_command(&mut self, pid: u32, function: u8, args: [u32; 5]) {
        match function {
            // register(group, cmd, flags, handler_off)
            0x00 => {
                let (st, oid) = self.registry.register_command(
                    pid,
                    args[0] as u8,
                    args[1] as u8,
                    args[2] as u8,
                    0,
                    args[3],
                    None,
                    None,
                    &mut self.events,
                );
                self.vm.register_write(0, st as u32);
                self.vm.register_write(1, oid as u32);
            }
            0x01 => {
                let oid = self
                    .registry
                    .lookup_command(args[0] as u8, args[1] as u8)
                    .map(|o| o as u32)
                    .unwrap_or(u32::MAX);
                self.vm.register_write(0, oid);
            }
            // call(oid, token) -> rc
            0x02 => {
                let rc = self
                    .command_call(args[0] as u16, args[1])
                    .unwrap_or(registry::status::ENOENT);
                self.vm.register_write(0, rc as u32);
            }
            // call_async(oid, token, target_ptr, target_len)
            0x03 => {
                let oid = args[0] as u16;
                let target = self.read_guest_str(args[2], args[3]).unwrap_or_default();
                let rc = self
                    .command_call(oid, args[1])
                    .unwrap_or(registry::status::ENOENT);
                let frame = cmd_done_frame(oid, rc);
                self.post_message(pid, &target, &frame, 0);
                self.vm.register_write(0, registry::status::OK as u32);
            }
            // help(oid, out_ptr, max)
            0x04 => {
                let text = self
                    .registry
                    .command_help(args[0] as u16)
                    .unwrap_or_default()
                    .as_bytes()
                    .to_vec();
                let copy = text.len().min(args[2] as usize);
                let _ = self.vm.write_bytes(args[1], &text[..copy]);
                self.vm.register_write(0, copy as u32);
            }
            _ => self.vm.register_write(0, ENOSYS as u32),
        }
    }

    /// Invoke a command handler synchronously inside the owning task's
    /// window: the context is saved, PC is aimed at the handler with a
    /// sentinel return address on the stack, and execution is bounded by a
    /// step budget. The handler's R0 at the balancing RET is the rc.
    pub fn command_call(&mut self, oid: u16, token: u32) -> Result<i32, ExecError> {
        let entry = self
            .registry
            .command(oid)
            .cloned()
            .ok_or(ExecError::NoSuchCommand(oid))?;
        let owner = entry.owner_pid;
        let saved_task_ctx = self.task(owner)?.ctx;
        let saved_vm = self.vm.context();

        let sentinel = saved_task_ctx.code_len;
        let mut ctx = saved_task_ctx;
        ctx.sp = saved_task_ctx.sp.wrapping_sub(4);
        ctx.pc = entry.handler_off;
        self.vm.set_context(ctx);
        if self.vm.memory_write(ctx.sp, 4, sentinel).is_err() {
            self.vm.set_context(saved_vm);
            return Ok(registry::status::ENOSPC);
        }
        self.vm.register_write(1, token);

        let mut rc = -1i32;
        for _ in 0..CMD_STEP_BUDGET {
            match self.vm.step(None) {
                StepOutcome::Normal => {
                    if self.vm.pc() == sentinel {
                        rc = self.vm.register_read(0) as i32;
                        break;
                    }
                }
                StepOutcome::SyscallTrap { module, function, args } => {
                    if !self.svc_in_handler(owner, module, function, args) {
                        rc = -11; // EAGAIN: handler tried to block
                        break;
                    }
                    if self.vm.pc() == sentinel {
                        rc = self.vm.register_read(0) as i32;
                        break;
                    }
                }
                _ => {
                    rc = -1;
                    break;
                }
            }
        }

        self.vm.set_context(saved_vm);
        if let Some(task) = self.tasks.get_mut(&owner) {
            task.ctx = saved_task_ctx;
        }
        Ok(rc)
    }

    /// Restricted dispatch inside a synchronous handler invocation: core
    /// and value modules only; anything that could block or re-enter the
    /// scheduler aborts the handler.
    fn svc_in_handler(&mut self, owner: u32, module: u8, function: u8, args: [u32; 5]) -> bool {
        match module {
            module::CORE => {
                self.svc_core(function, args);
                true
            }
            module::VALUE => {
                self.svc_value(owner, function, args);
                true
            }
            _ => false,
        }
    }

    fn svc_fd(&mut self, function: u8, args: [u32; 5]) {
        match function {
            0x00 => {
                let Some(path) = self.read_guest_str(args[0], args[1]) else {
                    self.vm.register_write(0, crate::hal::HAL_ENOENT as u32);
                    return;
                };
                let Some(fs) = self.hal.fs.as_mut() else {
                    self.vm.register_write(0, ENOSYS as u32);
                    return;
                };
                let fd = fs.open(&path);
                self.vm.register_write(0, fd as u32);
            }
            0x01 => {
                let (fd, ptr, len) = (args[0] as i32, args[1], args[2]);
                let Some(fs) = self.hal.fs.as_mut() else {
                    self.vm.register_write(0, ENOSYS as u32);
                    return;
                };
                let mut buf = vec![0u8; len as usize];
                let n = fs.read(fd, &mut buf);
                if n > 0 {
                    let _ = self.vm.write_bytes(ptr, &buf[..n as usize]);
                }
                self.vm.register_write(0, n as u32);
            }
            0x02 => {
                let (fd, ptr, len) = (args[0] as i32, args[1], args[2]);
                let Ok(bytes) = self.vm.read_bytes(ptr, len) else {
                    self.vm.register_write(0, crate::hal::HAL_EIO as u32);
                    return;
                };
                let Some(fs) = self.hal.fs.as_mut() else {
                    self.vm.register_write(0, ENOSYS as u32);
                    return;
                };
                let n = fs.write(fd, &bytes);
                self.vm.register_write(0, n as u32);
            }
            0x03 => {
                let Some(fs) = self.hal.fs.as_mut() else {
                    self.vm.register_write(0, ENOSYS as u32);
                    return;
                };
                let st = fs.close(args[0] as i32);
                self.vm.register_write(0, st as u32);
            }
            _ => self.vm.register_write(0, ENOSYS as u32),
        }
    }

    /// dev-libm: f32 math on raw bit patterns, one or two operands.
    fn svc_libm(&mut self, function: u8, args: [u32; 5]) {
        let a = f32::from_bits(args[0]);
        let b = f32::from_bits(args[1]);
        let out = match function {
            0x00 => libm::sinf(a),
            0x01 => libm::cosf(a),
            0x02 => libm::sqrtf(a),
            0x03 => libm::expf(a),
            0x04 => libm::logf(a),
            0x05 => libm::powf(a, b),
            0x06 => libm::fabsf(a),
            0x07 => libm::floorf(a),
            _ => {
                self.vm.register_write(0, ENOSYS as u32);
                return;
            }
        };
        self.vm.register_write(0, out.to_bits());
    }

    fn read_guest_str(&mut self, ptr: u32, len: u32) -> Option<String> {
        if len > 256 {
            return None;
        }
        let bytes = self.vm.read_bytes(ptr, len).ok()?;
        Some(String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string())
    }

    /// External clock-mode effective state, for `clock`/`info` replies.
    pub fn clock_effective_mode(&self) -> ClockMode {
        match self.clock.mode {
            ClockMode::Active | ClockMode::Rate => match self.clock.throttle_reason.as_deref() {
                Some("all_blocked") => ClockMode::Sleep,
                Some("no_tasks") => ClockMode::Idle,
                Some(_) => ClockMode::Throttled,
                None => self.clock.mode,
            },
            m => m,
        }
    }
}

fn mode_or_rdwr(raw: u32) -> mailbox::Mode {
    let mode = mailbox::Mode::from_bits_truncate(raw);
    if mode.intersection(mailbox::Mode::RDWR).is_empty() {
        mode | mailbox::Mode::RDWR
    } else {
        mode
    }
}
