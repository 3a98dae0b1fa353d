//! MiniVM interpreter
//!
//! Executes one 32-bit instruction per `step()` against the currently bound
//! register/stack window. All task state lives inside a single memory arena
//! addressed by offsets; a context switch rebinds the register base, stack
//! pointer, and PC without copying anything. The VM never interprets
//! syscalls: `SVC` yields a `SyscallTrap` outcome for the executive.

pub mod alu;
pub mod opcode;

use crate::image::HxeImage;
use crate::profile::{MemoryLayout, REG_FILE_BYTES};
use bitflags::bitflags;
use opcode::*;
use std::collections::HashSet;

bitflags! {
    /// Status word flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Psw: u32 {
        const Z = 1 << 0;
        const C = 1 << 1;
        const N = 1 << 2;
        const V = 1 << 3;
    }
}

/// Fault taxonomy; each halts stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    DivZero,
    UnknownOpcode(u8),
    UnalignedAccess(u32),
    OutOfBounds(u32),
    StackOverflow,
}

impl Fault {
    /// Error code latched in R0 when the fault halts the task.
    pub fn code(&self) -> u32 {
        match self {
            Fault::DivZero => 1,
            Fault::UnknownOpcode(_) => 2,
            Fault::UnalignedAccess(_) => 3,
            Fault::OutOfBounds(_) => 4,
            Fault::StackOverflow => 5,
        }
    }

    /// Stable string used in `task_state` details.
    pub fn name(&self) -> &'static str {
        match self {
            Fault::DivZero => "div_zero",
            Fault::UnknownOpcode(_) => "unknown_opcode",
            Fault::UnalignedAccess(_) => "unaligned",
            Fault::OutOfBounds(_) => "oob",
            Fault::StackOverflow => "stack_overflow",
        }
    }
}

/// Why the VM halted voluntarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// `HALT` instruction.
    Halted,
}

/// Result of a single `step()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Normal,
    BreakPoint(u32),
    SyscallTrap { module: u8, function: u8, args: [u32; 5] },
    Halt(HaltReason),
    Fault(Fault),
}

/// Memory access recorded for trace polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub write: bool,
    pub address: u32,
    pub width: u8,
    pub value: u32,
}

/// Per-task execution context installed by `set_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmContext {
    /// Arena-absolute address of the 16-word register file.
    pub reg_base: u32,
    /// Current stack pointer (guest address).
    pub sp: u32,
    /// Stack ceiling; PUSH/CALL below this faults.
    pub stack_limit: u32,
    pub pc: u32,
    pub psw: u32,
    /// Length of the attached code section.
    pub code_len: u32,
}

pub struct MiniVm {
    mem: Vec<u8>,
    layout: MemoryLayout,
    window_base: u32,
    reg_base: u32,
    sp: u32,
    stack_limit: u32,
    pc: u32,
    psw: Psw,
    code_len: u32,
    steps: u64,
    last_pc: u32,
    last_word: u32,
    last_regs: [u32; 16],
    last_mem_access: Option<MemAccess>,
}

impl MiniVm {
    pub fn new(layout: MemoryLayout) -> Self {
        Self {
            mem: Vec::new(),
            layout,
            window_base: 0,
            reg_base: 0,
            sp: layout.stack_top(),
            stack_limit: 0,
            pc: 0,
            psw: Psw::empty(),
            code_len: 0,
            steps: 0,
            last_pc: 0,
            last_word: 0,
            last_regs: [0; 16],
            last_mem_access: None,
        }
    }

    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    /// Grow the arena to cover at least `len` bytes.
    pub fn ensure_arena(&mut self, len: usize) {
        if self.mem.len() < len {
            self.mem.resize(len, 0);
        }
    }

    /// O(1) context switch: rebind register window, stack, PC, status.
    pub fn set_context(&mut self, ctx: VmContext) {
        self.reg_base = ctx.reg_base;
        self.window_base = ctx.reg_base + REG_FILE_BYTES - self.layout.window_len;
        self.sp = ctx.sp;
        self.stack_limit = ctx.stack_limit;
        self.pc = ctx.pc;
        self.psw = Psw::from_bits_truncate(ctx.psw);
        self.code_len = ctx.code_len;
    }

    /// Snapshot the current context (for switching the task out).
    pub fn context(&self) -> VmContext {
        VmContext {
            reg_base: self.reg_base,
            sp: self.sp,
            stack_limit: self.stack_limit,
            pc: self.pc,
            psw: self.psw.bits(),
            code_len: self.code_len,
        }
    }

    /// Install code/rodata into the current window, zero bss, seed SP.
    ///
    /// The caller must have bound a context whose window the image fits:
    /// code below the rodata base, rodata + bss below the stack region.
    pub fn attach_image(&mut self, image: &HxeImage) -> Result<(), Fault> {
        let code_len = image.code.len() as u32;
        let ro_len = image.rodata.len() as u32;
        if code_len > self.layout.rodata_base {
            return Err(Fault::OutOfBounds(code_len));
        }
        let bss_end = self.layout.rodata_base + ro_len + image.bss_size;
        if bss_end > self.layout.stack_top() {
            return Err(Fault::OutOfBounds(bss_end));
        }
        let base = self.window_base as usize;
        let wlen = self.layout.window_len as usize;
        self.ensure_arena(base + wlen);
        self.mem[base..base + wlen].fill(0);
        self.mem[base..base + image.code.len()].copy_from_slice(&image.code);
        let ro = base + self.layout.rodata_base as usize;
        self.mem[ro..ro + image.rodata.len()].copy_from_slice(&image.rodata);
        self.sp = self.layout.stack_top();
        self.stack_limit = bss_end;
        self.pc = image.entry;
        self.psw = Psw::empty();
        self.code_len = code_len;
        Ok(())
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn sp(&self) -> u32 {
        self.sp
    }

    pub fn psw_bits(&self) -> u32 {
        self.psw.bits()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn last_pc(&self) -> u32 {
        self.last_pc
    }

    /// Raw instruction word of the last executed step.
    pub fn last_word(&self) -> u32 {
        self.last_word
    }

    pub fn last_regs(&self) -> [u32; 16] {
        self.last_regs
    }

    pub fn last_mem_access(&self) -> Option<MemAccess> {
        self.last_mem_access
    }

    pub fn register_read(&self, idx: usize) -> u32 {
        let at = self.reg_base as usize + (idx & 0xF) * 4;
        u32::from_le_bytes([self.mem[at], self.mem[at + 1], self.mem[at + 2], self.mem[at + 3]])
    }

    pub fn register_write(&mut self, idx: usize, value: u32) {
        let at = self.reg_base as usize + (idx & 0xF) * 4;
        self.mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn phys(&self, guest: u32, len: u32) -> Result<usize, Fault> {
        let end = guest.checked_add(len).ok_or(Fault::OutOfBounds(guest))?;
        if end > self.layout.window_len {
            return Err(Fault::OutOfBounds(guest));
        }
        Ok(self.window_base as usize + guest as usize)
    }

    /// Width ∈ {1, 2, 4}; value zero-extended on read.
    pub fn memory_read(&self, addr: u32, width: u8) -> Result<u32, Fault> {
        if addr % width as u32 != 0 {
            return Err(Fault::UnalignedAccess(addr));
        }
        let at = self.phys(addr, width as u32)?;
        Ok(match width {
            1 => self.mem[at] as u32,
            2 => u16::from_le_bytes([self.mem[at], self.mem[at + 1]]) as u32,
            4 => u32::from_le_bytes([
                self.mem[at],
                self.mem[at + 1],
                self.mem[at + 2],
                self.mem[at + 3],
            ]),
            _ => return Err(Fault::UnalignedAccess(addr)),
        })
    }

    pub fn memory_write(&mut self, addr: u32, width: u8, value: u32) -> Result<(), Fault> {
        if addr % width as u32 != 0 {
            return Err(Fault::UnalignedAccess(addr));
        }
        let at = self.phys(addr, width as u32)?;
        match width {
            1 => self.mem[at] = value as u8,
            2 => self.mem[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes()),
            4 => self.mem[at..at + 4].copy_from_slice(&value.to_le_bytes()),
            _ => return Err(Fault::UnalignedAccess(addr)),
        }
        Ok(())
    }

    /// Bulk guest-memory read used by syscall buffer marshalling.
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, Fault> {
        let at = self.phys(addr, len)?;
        Ok(self.mem[at..at + len as usize].to_vec())
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Fault> {
        let at = self.phys(addr, bytes.len() as u32)?;
        self.mem[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn fetch(&self, at: u32) -> Result<u32, Fault> {
        if at % 4 != 0 {
            return Err(Fault::UnalignedAccess(at));
        }
        if at.checked_add(4).map_or(true, |end| end > self.code_len) {
            return Err(Fault::OutOfBounds(at));
        }
        let p = self.window_base as usize + at as usize;
        Ok(u32::from_le_bytes([
            self.mem[p],
            self.mem[p + 1],
            self.mem[p + 2],
            self.mem[p + 3],
        ]))
    }

    fn push_word(&mut self, value: u32) -> Result<(), Fault> {
        let new_sp = self.sp.wrapping_sub(4);
        if new_sp < self.stack_limit || new_sp > self.sp {
            return Err(Fault::StackOverflow);
        }
        self.sp = new_sp;
        let r = self.memory_write(new_sp, 4, value);
        if r.is_err() {
            self.sp = new_sp.wrapping_add(4);
        }
        r
    }

    fn pop_word(&mut self) -> Result<u32, Fault> {
        let v = self.memory_read(self.sp, 4)?;
        self.sp = self.sp.wrapping_add(4);
        Ok(v)
    }

    /// Execute one instruction. When `breakpoints` contains the current PC
    /// the instruction is not executed and `BreakPoint` is returned.
    pub fn step(&mut self, breakpoints: Option<&HashSet<u32>>) -> StepOutcome {
        if let Some(set) = breakpoints {
            if set.contains(&self.pc) {
                return StepOutcome::BreakPoint(self.pc);
            }
        }

        self.last_pc = self.pc;
        self.last_mem_access = None;

        let outcome = self.exec_one();

        if let StepOutcome::Fault(f) = &outcome {
            // Fault code latched in R0 for the executive's exit status.
            self.register_write(0, f.code());
        }
        self.steps += 1;
        for i in 0..16 {
            self.last_regs[i] = self.register_read(i);
        }
        outcome
    }

    fn exec_one(&mut self) -> StepOutcome {
        let word = match self.fetch(self.pc) {
            Ok(w) => w,
            Err(f) => return StepOutcome::Fault(f),
        };
        self.last_word = word;
        let f = Fields::decode(word);
        let mut next_pc = self.pc.wrapping_add(4);

        macro_rules! fault {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(f) => return StepOutcome::Fault(f),
                }
            };
        }

        match f.op {
            OP_NOP => {}
            OP_HALT => {
                self.pc = next_pc;
                return StepOutcome::Halt(HaltReason::Halted);
            }
            OP_LDI => self.register_write(f.rd, f.simm() as u32),
            OP_LDI32 => {
                let lit = fault!(self.fetch(self.pc.wrapping_add(4)));
                self.register_write(f.rd, lit);
                next_pc = self.pc.wrapping_add(8);
            }
            OP_MOV => {
                let v = self.register_read(f.rs);
                self.register_write(f.rd, v);
            }
            OP_ADD | OP_SUB | OP_ADC | OP_SBC | OP_MUL | OP_DIV | OP_AND | OP_OR | OP_XOR
            | OP_LSL | OP_LSR | OP_ASR => {
                let a = self.register_read(f.rs);
                let b = self.register_read(f.rt);
                let carry = self.psw.contains(Psw::C);
                let (res, psw) = match f.op {
                    OP_ADD => alu::add(a, b, false),
                    OP_SUB => alu::sub(a, b, true),
                    OP_ADC => alu::add(a, b, carry),
                    OP_SBC => alu::sub(a, b, carry),
                    OP_MUL => alu::mul(a, b),
                    OP_DIV => {
                        if b == 0 {
                            return StepOutcome::Fault(Fault::DivZero);
                        }
                        alu::div(a, b)
                    }
                    OP_AND => alu::logic(a & b),
                    OP_OR => alu::logic(a | b),
                    OP_XOR => alu::logic(a ^ b),
                    OP_LSL => alu::shift(alu::Shift::Lsl, a, b),
                    OP_LSR => alu::shift(alu::Shift::Lsr, a, b),
                    OP_ASR => alu::shift(alu::Shift::Asr, a, b),
                    _ => unreachable!(),
                };
                self.register_write(f.rd, res);
                self.psw = psw;
            }
            OP_NOT => {
                let (res, psw) = alu::logic(!self.register_read(f.rs));
                self.register_write(f.rd, res);
                self.psw = psw;
            }
            OP_CMP => {
                let (_, psw) = alu::sub(self.register_read(f.rs), self.register_read(f.rt), true);
                self.psw = psw;
            }
            OP_ADDI => {
                let (res, psw) = alu::add(self.register_read(f.rs), f.simm() as u32, false);
                self.register_write(f.rd, res);
                self.psw = psw;
            }
            OP_CMPI => {
                let (_, psw) = alu::sub(self.register_read(f.rs), f.simm() as u32, true);
                self.psw = psw;
            }
            OP_LDW | OP_LDH | OP_LDB => {
                let addr = self.register_read(f.rs).wrapping_add(f.simm() as u32);
                let width = match f.op {
                    OP_LDW => 4,
                    OP_LDH => 2,
                    _ => 1,
                };
                let raw = fault!(self.memory_read(addr, width));
                // Byte/halfword loads sign-extend.
                let v = match width {
                    1 => raw as u8 as i8 as i32 as u32,
                    2 => raw as u16 as i16 as i32 as u32,
                    _ => raw,
                };
                self.register_write(f.rd, v);
                self.last_mem_access = Some(MemAccess { write: false, address: addr, width, value: v });
            }
            OP_STW | OP_STH | OP_STB => {
                let addr = self.register_read(f.rs).wrapping_add(f.simm() as u32);
                let width = match f.op {
                    OP_STW => 4,
                    OP_STH => 2,
                    _ => 1,
                };
                let v = self.register_read(f.rd);
                fault!(self.memory_write(addr, width, v));
                self.last_mem_access = Some(MemAccess { write: true, address: addr, width, value: v });
            }
            // Absolute jumps zero-extend a word index into the code window.
            OP_JMP => next_pc = (f.imm as u32) << 2,
            OP_JZ => {
                if self.psw.contains(Psw::Z) {
                    next_pc = (f.imm as u32) << 2;
                }
            }
            OP_JNZ => {
                if !self.psw.contains(Psw::Z) {
                    next_pc = (f.imm as u32) << 2;
                }
            }
            OP_CALL => {
                fault!(self.push_word(self.pc.wrapping_add(4)));
                next_pc = self.pc.wrapping_add((f.simm() << 2) as u32);
            }
            OP_RET => next_pc = fault!(self.pop_word()),
            OP_PUSH => {
                let v = self.register_read(f.rs);
                fault!(self.push_word(v));
            }
            OP_POP => {
                let v = fault!(self.pop_word());
                self.register_write(f.rd, v);
            }
            OP_FADD | OP_FSUB | OP_FMUL | OP_FDIV => {
                let a = self.register_read(f.rs);
                let b = self.register_read(f.rt);
                let op = match f.op {
                    OP_FADD => alu::FloatOp::Add,
                    OP_FSUB => alu::FloatOp::Sub,
                    OP_FMUL => alu::FloatOp::Mul,
                    _ => alu::FloatOp::Div,
                };
                self.register_write(f.rd, alu::float(op, a, b));
            }
            OP_I2F => {
                let v = alu::int_to_half(self.register_read(f.rs));
                self.register_write(f.rd, v);
            }
            OP_F2I => {
                let v = alu::half_to_int(self.register_read(f.rs));
                self.register_write(f.rd, v);
            }
            OP_SVC => {
                let module = (f.imm >> 8) as u8;
                let function = (f.imm & 0xFF) as u8;
                let args = [
                    self.register_read(1),
                    self.register_read(2),
                    self.register_read(3),
                    self.register_read(4),
                    self.register_read(5),
                ];
                // Return slot pre-cleared before the executive writes it.
                self.register_write(0, 0);
                self.pc = next_pc;
                return StepOutcome::SyscallTrap { module, function, args };
            }
            other => return StepOutcome::Fault(Fault::UnknownOpcode(other)),
        }

        self.pc = next_pc;
        StepOutcome::Normal
    }
}
