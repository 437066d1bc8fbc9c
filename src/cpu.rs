//! Intel 8080 CPU Core
//!
//! The CPU owns the fetch/decode/execute loop and nothing else: registers
//! and flags live in [`Registers`], the opcode handlers in
//! [`crate::instructions`], and scheduling in [`Time`]. The machine drives
//! the CPU exclusively through [`Cpu::clock`], which executes instructions
//! until a cycle target is met or something ends the burst early.
//!
//! # Interrupts
//!
//! Peripherals raise interrupts through a shared [`IntrLine`] handle rather
//! than by touching the CPU directly, so a device deep inside an IO-port
//! listener can post a level without re-entering the CPU. The line is a
//! bitmask: bits 0–7 are pending levels (serviced lowest-first as `RST
//! level`), bit 8 records a HLT in effect. Dispatch happens only at
//! instruction boundaries — at the top of a burst, or immediately after `EI`
//! completes — and posting a level while IF is set asks the scheduler to end
//! the burst so the dispatch happens promptly.
//!
//! # HALT
//!
//! `HLT` backs PC up onto the instruction itself (so the service routine's
//! `RET` re-enters the wait loop, and a debugger shows the `HLT`), posts the
//! HALT bit, and ends the burst. If IF is clear at that point nothing can
//! ever wake the CPU, so the scheduler is stopped outright.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::Bus;
use crate::instructions;
use crate::registers::Registers;
use crate::time::Time;

/// Interrupt-line flag bits.
pub mod intflag {
    /// Pending interrupt levels 0–7.
    pub const INTR: u16 = 0x00FF;
    /// A HLT instruction is in effect.
    pub const HALT: u16 = 0x0100;
}

struct IntrInner {
    flags: Cell<u16>,
    /// Mirror of the CPU's IF flip-flop, so devices can decide whether a
    /// posted level warrants ending the burst.
    iff: Cell<bool>,
    time: Time,
}

/// Shared interrupt-request channel between peripherals and the CPU.
#[derive(Clone)]
pub struct IntrLine {
    inner: Rc<IntrInner>,
}

impl IntrLine {
    #[must_use]
    pub fn new(time: Time) -> Self {
        Self {
            inner: Rc::new(IntrInner {
                flags: Cell::new(0),
                iff: Cell::new(false),
                time,
            }),
        }
    }

    /// Posts interrupt level 0–7. Ends the current burst when interrupts are
    /// enabled so the level is taken promptly.
    pub fn request_intr(&self, level: u8) {
        let bit = 1u16 << (level & 0x07);
        self.inner.flags.set(self.inner.flags.get() | bit);
        if self.inner.iff.get() {
            self.inner.time.end_burst();
        }
    }

    /// Posts the HALT bit and ends the current burst.
    pub fn request_halt(&self) {
        self.inner.flags.set(self.inner.flags.get() | intflag::HALT);
        self.inner.time.end_burst();
    }

    #[must_use]
    pub fn flags(&self) -> u16 {
        self.inner.flags.get()
    }

    pub fn clear_level(&self, level: u8) {
        self.inner.flags.set(self.inner.flags.get() & !(1u16 << (level & 0x07)));
    }

    pub fn clear_halt(&self) {
        self.inner.flags.set(self.inner.flags.get() & !intflag::HALT);
    }

    pub fn clear_all(&self) {
        self.inner.flags.set(0);
    }

    fn set_iff(&self, enabled: bool) {
        self.inner.iff.set(enabled);
    }

    fn restore(&self, flags: u16) {
        self.inner.flags.set(flags);
    }
}

/// Persisted CPU state (id + version prefix, then fields in fixed order).
#[derive(Serialize, Deserialize)]
pub struct CpuState {
    pub id: String,
    pub version: u32,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
    pub pc_last: u16,
    pub ps: u8,
    pub intr_enabled: bool,
    pub int_flags: u16,
}

/// State-format version for [`CpuState`].
pub const CPU_STATE_VERSION: u32 = 1;

/// The 8080 interpreter.
pub struct Cpu {
    pub regs: Registers,
    bus_mem: Rc<RefCell<Bus>>,
    bus_io: Rc<RefCell<Bus>>,
    time: Time,
    intr: IntrLine,
    /// Cycles clocked within the current `clock` call.
    burst_cycles: u64,
}

impl Cpu {
    #[must_use]
    pub fn new(
        bus_mem: Rc<RefCell<Bus>>,
        bus_io: Rc<RefCell<Bus>>,
        time: Time,
        intr: IntrLine,
    ) -> Self {
        Self {
            regs: Registers::new(),
            bus_mem,
            bus_io,
            time,
            intr,
            burst_cycles: 0,
        }
    }

    /// The interrupt line, for distributing to peripherals.
    #[must_use]
    pub fn intr_line(&self) -> IntrLine {
        self.intr.clone()
    }

    /// Resets registers and pending interrupts; PC restarts at 0.
    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.intr.clear_all();
        self.intr.set_iff(false);
    }

    // ==================== EXECUTION ====================

    /// Executes instructions until at least `n_cycles_target` cycles have
    /// been clocked, the burst is ended early, or the CPU is asleep in HLT.
    /// Returns the cycles clocked.
    pub fn clock(&mut self, n_cycles_target: u64) -> u64 {
        self.burst_cycles = 0;
        if !self.check_intr() {
            return 0;
        }
        while self.burst_cycles <= n_cycles_target {
            if self.time.burst_ended() {
                break;
            }
            self.regs.pc_last = self.regs.pc;
            let opcode = self.fetch_byte();
            let cycles = instructions::execute(self, opcode);
            self.spend(cycles);
        }
        self.burst_cycles
    }

    /// Services pending interrupts and HALT state at an instruction
    /// boundary. Returns `false` when the CPU has nothing to do (halted with
    /// no serviceable interrupt).
    pub fn check_intr(&mut self) -> bool {
        let flags = self.intr.flags();
        if self.time.is_running() && flags & intflag::INTR != 0 && self.regs.intr_enabled {
            let level = (flags & intflag::INTR).trailing_zeros() as u8;
            self.intr.clear_level(level);
            self.set_if(false);
            self.intr.clear_halt();
            // Dispatch is the RST sequence: push the resume address, vector
            // to level * 8.
            let pc = self.regs.pc;
            self.push_word(pc);
            self.regs.pc = u16::from(level) << 3;
            self.spend(11);
            return true;
        }
        if flags & intflag::HALT != 0 {
            self.time.end_burst();
            return false;
        }
        true
    }

    /// Posts interrupt level 0–7 (peripheral entry point).
    pub fn request_intr(&self, level: u8) {
        self.intr.request_intr(level);
    }

    /// Sets the interrupt-enable flip-flop and its shared mirror.
    pub(crate) fn set_if(&mut self, enabled: bool) {
        self.regs.intr_enabled = enabled;
        self.intr.set_iff(enabled);
    }

    /// HLT semantics: back PC up onto the instruction, stop the scheduler
    /// entirely when interrupts can never wake us, and post the HALT bit.
    pub(crate) fn halt(&mut self) {
        self.regs.pc = self.regs.pc.wrapping_sub(1);
        if !self.regs.intr_enabled {
            debug!("HLT at {:#06x} with interrupts disabled", self.regs.pc);
            self.time.stop();
        }
        self.intr.request_halt();
    }

    pub(crate) fn spend(&mut self, n: u64) {
        self.burst_cycles += n;
        self.time.add_cycles(n);
    }

    /// Scheduler handle (EI re-checks interrupts through it).
    pub(crate) fn time(&self) -> &Time {
        &self.time
    }

    // ==================== BUS ACCESS ====================

    #[must_use]
    pub fn read_byte(&self, addr: u16) -> u8 {
        self.bus_mem.borrow_mut().read_byte(u32::from(addr))
    }

    pub fn write_byte(&mut self, addr: u16, value: u8) {
        self.bus_mem.borrow_mut().write_byte(u32::from(addr), value);
    }

    #[must_use]
    pub fn read_pair(&self, addr: u16) -> u16 {
        self.bus_mem.borrow_mut().read_pair(u32::from(addr))
    }

    pub fn write_pair(&mut self, addr: u16, value: u16) {
        self.bus_mem.borrow_mut().write_pair(u32::from(addr), value);
    }

    pub(crate) fn fetch_byte(&mut self) -> u8 {
        let value = self.read_byte(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    pub(crate) fn fetch_pair(&mut self) -> u16 {
        let value = self.read_pair(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(2);
        value
    }

    pub fn push_word(&mut self, value: u16) {
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        self.write_pair(self.regs.sp, value);
    }

    pub fn pop_word(&mut self) -> u16 {
        let value = self.read_pair(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(2);
        value
    }

    pub(crate) fn input(&mut self, port: u8) -> u8 {
        self.bus_io.borrow_mut().read_byte(u32::from(port))
    }

    pub(crate) fn output(&mut self, port: u8, value: u8) {
        self.bus_io.borrow_mut().write_byte(u32::from(port), value);
    }

    // ==================== STATE ====================

    #[must_use]
    pub fn save_state(&self) -> CpuState {
        CpuState {
            id: "cpu8080".to_string(),
            version: CPU_STATE_VERSION,
            a: self.regs.a,
            b: self.regs.b,
            c: self.regs.c,
            d: self.regs.d,
            e: self.regs.e,
            h: self.regs.h,
            l: self.regs.l,
            sp: self.regs.sp,
            pc: self.regs.pc,
            pc_last: self.regs.pc_last,
            ps: self.regs.get_ps(),
            intr_enabled: self.regs.intr_enabled,
            int_flags: self.intr.flags(),
        }
    }

    pub fn load_state(&mut self, state: &CpuState) -> bool {
        if state.id != "cpu8080" || state.version != CPU_STATE_VERSION {
            return false;
        }
        self.regs.a = state.a;
        self.regs.b = state.b;
        self.regs.c = state.c;
        self.regs.d = state.d;
        self.regs.e = state.e;
        self.regs.h = state.h;
        self.regs.l = state.l;
        self.regs.sp = state.sp;
        self.regs.pc = state.pc;
        self.regs.pc_last = state.pc_last;
        self.regs.set_ps(state.ps);
        self.regs.intr_enabled = state.intr_enabled;
        self.intr.set_iff(state.intr_enabled);
        self.intr.restore(state.int_flags);
        true
    }
}
