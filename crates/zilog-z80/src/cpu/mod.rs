//! The Z80 core: register file, micro-op drive loop, and the public
//! instruction-level and interrupt-level entry points.

mod execute;

use std::collections::VecDeque;

use emu_core::{Bus, Cpu, Observable, Value};

use crate::flags::{CF, PF, SF, ZF};
use crate::microcode::MicroOp;
use crate::registers::Registers;

/// A cycle-accurate Zilog Z80 core.
///
/// `step` executes exactly one instruction (including any prefix bytes)
/// and returns the number of T-states it took. `accept_interrupt` and
/// `accept_nmi` are called by the system around `step` at whatever point
/// the host's interrupt line timing dictates — the core does not poll for
/// interrupts on its own.
pub struct Z80 {
    pub regs: Registers,

    micro_ops: VecDeque<MicroOp>,
    opcode: u8,
    prefix: u8,
    prefix2: u8,
    addr: u16,
    data_lo: u8,
    data_hi: u8,
    displacement: u8,
    followup_stage: u8,

    /// Set by `EI`; consumed by the next instruction boundary so interrupts
    /// are never accepted immediately after `EI`.
    ei_delay: bool,
    /// Set by `LD A,I`/`LD A,R`; cleared at the start of every instruction.
    last_was_ld_a_ir: bool,
    /// The Q register: flags as left by the last flag-affecting instruction.
    /// Feeds the undocumented X/Y bits of `SCF`/`CCF`.
    last_q: u8,
    prev_q: u8,

    irq_line: bool,
    nmi_line: bool,
}

impl Default for Z80 {
    fn default() -> Self {
        Self::new()
    }
}

impl Z80 {
    #[must_use]
    pub fn new() -> Self {
        let mut z80 = Self {
            regs: Registers::default(),
            micro_ops: VecDeque::new(),
            opcode: 0,
            prefix: 0,
            prefix2: 0,
            addr: 0,
            data_lo: 0,
            data_hi: 0,
            displacement: 0,
            followup_stage: 0,
            ei_delay: false,
            last_was_ld_a_ir: false,
            last_q: 0,
            prev_q: 0,
            irq_line: false,
            nmi_line: false,
        };
        z80.reset();
        z80
    }

    /// Reset to power-on state: `PC=0`, interrupts disabled, `IM0`.
    pub fn reset(&mut self) {
        self.regs = Registers {
            sp: 0xFFFF,
            a: 0xFF,
            f: 0xFF,
            ..Registers::default()
        };
        self.micro_ops.clear();
        self.opcode = 0;
        self.prefix = 0;
        self.prefix2 = 0;
        self.followup_stage = 0;
        self.ei_delay = false;
        self.last_was_ld_a_ir = false;
        self.last_q = 0;
        self.prev_q = 0;
        self.irq_line = false;
        self.nmi_line = false;
    }

    /// Execute exactly one instruction (all prefix bytes and follow-ups
    /// included) and return its T-state count.
    ///
    /// While halted, each call consumes a single `NOP`-equivalent 4
    /// T-states and refetches the same address, matching the real Z80's
    /// behaviour of re-running the last fetched opcode until interrupted.
    pub fn step(&mut self, bus: &mut impl Bus) -> u32 {
        if self.regs.halted {
            self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);
            return 4;
        }

        self.prefix = 0;
        self.prefix2 = 0;
        self.followup_stage = 0;
        self.micro_ops.clear();
        self.micro_ops.push_back(MicroOp::FetchOpcode);

        let mut total = 0u32;
        while let Some(op) = self.micro_ops.pop_front() {
            total += self.run_microop(op, bus);
        }
        total
    }

    /// Service a maskable interrupt if `IFF1` is set and the previous
    /// instruction was not `EI`. Returns the T-states consumed (0 if the
    /// interrupt was not accepted).
    ///
    /// `data_bus_byte` is whatever value the interrupting device (the ULA,
    /// for this crate's purposes) is driving onto the data bus when `/INT`
    /// is sampled. In `IM 2` it is the low byte of the vector-table
    /// address; in `IM 0` it is interpreted as the opcode to execute.
    pub fn accept_interrupt(&mut self, bus: &mut impl Bus, data_bus_byte: u8) -> u32 {
        if self.ei_delay {
            self.ei_delay = false;
            return 0;
        }
        if !self.regs.iff1 {
            return 0;
        }

        self.regs.halted = false;
        self.regs.iff1 = false;
        self.regs.iff2 = false;
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);

        match self.regs.im {
            2 => {
                let vector = (u16::from(self.regs.i) << 8) | u16::from(data_bus_byte);
                let lo = bus.read(vector).value;
                let hi = bus.read(vector.wrapping_add(1)).value;
                let target = u16::from(lo) | (u16::from(hi) << 8);
                self.push_pc_and_jump(bus, target);
                19
            }
            1 => {
                self.push_pc_and_jump(bus, 0x0038);
                13
            }
            _ => {
                // IM 0: the bus byte is treated as the opcode to run.
                self.prefix = 0;
                self.prefix2 = 0;
                self.followup_stage = 0;
                self.micro_ops.clear();
                self.opcode = data_bus_byte;
                self.ei_delay = false;
                self.last_was_ld_a_ir = false;
                self.prev_q = self.last_q;
                self.last_q = 0;
                self.execute_unprefixed();
                let mut total = 2u32;
                while let Some(op) = self.micro_ops.pop_front() {
                    total += self.run_microop(op, bus);
                }
                total
            }
        }
    }

    /// Service a non-maskable interrupt. Always accepted; exits `HALT`,
    /// clears `IFF1` only (so `RETN` can restore it from `IFF2`). Returns
    /// 11, the fixed T-state cost.
    pub fn accept_nmi(&mut self, bus: &mut impl Bus) -> u32 {
        self.regs.halted = false;
        self.regs.iff1 = false;
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);
        self.push_pc_and_jump(bus, 0x0066);
        11
    }

    fn push_pc_and_jump(&mut self, bus: &mut impl Bus, target: u16) {
        let ret_addr = self.regs.pc;
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write(self.regs.sp, (ret_addr >> 8) as u8);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        bus.write(self.regs.sp, ret_addr as u8);
        self.regs.pc = target;
        self.regs.wz = target;
    }

    fn run_microop(&mut self, op: MicroOp, bus: &mut impl Bus) -> u32 {
        match op {
            MicroOp::FetchOpcode => {
                let pc = self.regs.pc;
                let result = bus.read(pc);
                self.regs.pc = pc.wrapping_add(1);
                self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);
                self.opcode = result.value;
                self.dispatch_opcode();
                4 + u32::from(result.wait_states)
            }
            MicroOp::FetchDisplacement => {
                let pc = self.regs.pc;
                let result = bus.read(pc);
                self.regs.pc = pc.wrapping_add(1);
                self.displacement = result.value;
                3 + u32::from(result.wait_states)
            }
            MicroOp::ReadImm8 | MicroOp::ReadImm16Lo => {
                let pc = self.regs.pc;
                let result = bus.read(pc);
                self.regs.pc = pc.wrapping_add(1);
                self.data_lo = result.value;
                3 + u32::from(result.wait_states)
            }
            MicroOp::ReadImm16Hi => {
                let pc = self.regs.pc;
                let result = bus.read(pc);
                self.regs.pc = pc.wrapping_add(1);
                self.data_hi = result.value;
                3 + u32::from(result.wait_states)
            }
            MicroOp::ReadMem | MicroOp::ReadMem16Lo => {
                let result = bus.read(self.addr);
                self.data_lo = result.value;
                3 + u32::from(result.wait_states)
            }
            MicroOp::ReadMem16Hi => {
                let result = bus.read(self.addr.wrapping_add(1));
                self.data_hi = result.value;
                3 + u32::from(result.wait_states)
            }
            MicroOp::WriteMem | MicroOp::WriteMem16Lo => {
                let wait = bus.write(self.addr, self.data_lo);
                3 + u32::from(wait)
            }
            MicroOp::WriteMem16Hi => {
                let wait = bus.write(self.addr.wrapping_add(1), self.data_hi);
                3 + u32::from(wait)
            }
            MicroOp::WriteMemHiFirst => {
                self.regs.sp = self.regs.sp.wrapping_sub(1);
                let wait = bus.write(self.regs.sp, self.data_hi);
                3 + u32::from(wait)
            }
            MicroOp::WriteMemLoSecond => {
                self.regs.sp = self.regs.sp.wrapping_sub(1);
                let wait = bus.write(self.regs.sp, self.data_lo);
                3 + u32::from(wait)
            }
            MicroOp::IoRead => {
                let result = bus.io_read(self.addr);
                self.data_lo = result.value;
                4 + u32::from(result.wait_states)
            }
            MicroOp::IoWrite => {
                let wait = bus.io_write(self.addr, self.data_lo);
                4 + u32::from(wait)
            }
            MicroOp::Internal(n) => n,
            MicroOp::Followup => {
                self.execute_followup();
                0
            }
        }
    }

    /// Called after every `FetchOpcode` completes. Runs the fresh-instruction
    /// preamble only for a genuinely new instruction (no prefix pending
    /// yet), then dispatches to the right prefix table. `DD`/`FD` followed
    /// by `CB` is special-cased here because that combination has no
    /// standalone execute step of its own — only a follow-up.
    fn dispatch_opcode(&mut self) {
        if self.prefix == 0 {
            self.ei_delay_reset_for_new_instruction();
            self.execute_unprefixed();
        } else if self.prefix == 0xCB {
            self.execute_cb();
        } else if self.prefix == 0xED {
            self.execute_ed();
        } else if self.prefix == 0xDD || self.prefix == 0xFD {
            if self.opcode == 0xCB {
                self.prefix2 = 0xCB;
                self.micro_ops.push_back(MicroOp::FetchDisplacement);
                self.micro_ops.push_back(MicroOp::ReadImm8);
                self.queue_execute_followup();
            } else {
                self.execute_dd_fd();
            }
        }
    }

    fn ei_delay_reset_for_new_instruction(&mut self) {
        self.ei_delay = false;
        self.last_was_ld_a_ir = false;
        self.prev_q = self.last_q;
        self.last_q = 0;
    }

    fn set_f(&mut self, flags: u8) {
        self.regs.f = flags;
        self.last_q = flags;
    }

    fn queue_internal(&mut self, n: u32) {
        self.micro_ops.push_back(MicroOp::Internal(n));
    }

    fn queue_execute_followup(&mut self) {
        self.followup_stage += 1;
        self.micro_ops.push_back(MicroOp::Followup);
    }

    fn get_reg8(&self, r: u8) -> u8 {
        match r {
            0 => self.regs.b,
            1 => self.regs.c,
            2 => self.regs.d,
            3 => self.regs.e,
            4 => self.regs.h,
            5 => self.regs.l,
            7 => self.regs.a,
            _ => unreachable!("register code 6 is (HL), handled separately"),
        }
    }

    fn set_reg8(&mut self, r: u8, value: u8) {
        match r {
            0 => self.regs.b = value,
            1 => self.regs.c = value,
            2 => self.regs.d = value,
            3 => self.regs.e = value,
            4 => self.regs.h = value,
            5 => self.regs.l = value,
            7 => self.regs.a = value,
            _ => unreachable!("register code 6 is (HL), handled separately"),
        }
    }

    fn get_reg16(&self, rp: u8) -> u16 {
        match rp {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            3 => self.regs.sp,
            _ => unreachable!(),
        }
    }

    fn set_reg16(&mut self, rp: u8, value: u16) {
        match rp {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.regs.set_hl(value),
            3 => self.regs.sp = value,
            _ => unreachable!(),
        }
    }

    fn get_reg16_af(&self, rp: u8) -> u16 {
        match rp {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl(),
            3 => self.regs.af(),
            _ => unreachable!(),
        }
    }

    fn set_reg16_af(&mut self, rp: u8, value: u16) {
        match rp {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.regs.set_hl(value),
            3 => self.regs.set_af(value),
            _ => unreachable!(),
        }
    }

    fn get_index_reg(&self) -> u16 {
        if self.prefix == 0xFD {
            self.regs.iy
        } else {
            self.regs.ix
        }
    }

    fn set_index_reg(&mut self, value: u16) {
        if self.prefix == 0xFD {
            self.regs.iy = value;
        } else {
            self.regs.ix = value;
        }
    }

    /// Register access for undocumented `LD r,r'` forms under a `DD`/`FD`
    /// prefix, where codes 4/5 mean the index register's high/low byte
    /// instead of H/L.
    fn get_reg8_indexed(&self, r: u8) -> u8 {
        match r {
            4 => (self.get_index_reg() >> 8) as u8,
            5 => self.get_index_reg() as u8,
            _ => self.get_reg8(r),
        }
    }

    fn set_reg8_indexed(&mut self, r: u8, value: u8) {
        match r {
            4 => {
                let idx = self.get_index_reg();
                self.set_index_reg((idx & 0x00FF) | (u16::from(value) << 8));
            }
            5 => {
                let idx = self.get_index_reg();
                self.set_index_reg((idx & 0xFF00) | u16::from(value));
            }
            _ => self.set_reg8(r, value),
        }
    }

    fn condition(&self, cc: u8) -> bool {
        match cc {
            0 => self.regs.f & ZF == 0,
            1 => self.regs.f & ZF != 0,
            2 => self.regs.f & CF == 0,
            3 => self.regs.f & CF != 0,
            4 => self.regs.f & PF == 0,
            5 => self.regs.f & PF != 0,
            6 => self.regs.f & SF == 0,
            7 => self.regs.f & SF != 0,
            _ => unreachable!(),
        }
    }
}

#[cfg(feature = "test-utils")]
impl Z80 {
    /// Force the program counter, for constructing mid-program test states.
    pub fn force_pc(&mut self, pc: u16) {
        self.regs.pc = pc;
    }

    /// Force the stack pointer, for constructing mid-program test states.
    pub fn set_sp(&mut self, sp: u16) {
        self.regs.sp = sp;
    }
}

impl Cpu for Z80 {
    type Registers = Registers;

    fn tick<B: Bus>(&mut self, bus: &mut B) {
        if self.nmi_line {
            self.nmi_line = false;
            self.accept_nmi(bus);
            return;
        }
        if self.irq_line {
            self.irq_line = false;
            self.accept_interrupt(bus, 0xFF);
            return;
        }
        self.step(bus);
    }

    fn pc(&self) -> u32 {
        u32::from(self.regs.pc)
    }

    fn registers(&self) -> Self::Registers {
        self.regs
    }

    fn is_halted(&self) -> bool {
        self.regs.halted
    }

    fn interrupt(&mut self) -> bool {
        self.irq_line = true;
        true
    }

    fn nmi(&mut self) {
        self.nmi_line = true;
    }

    fn reset(&mut self) {
        Self::reset(self);
    }
}

impl Observable for Z80 {
    fn query(&self, path: &str) -> Option<Value> {
        Some(match path {
            "pc" => Value::U16(self.regs.pc),
            "sp" => Value::U16(self.regs.sp),
            "a" => Value::U8(self.regs.a),
            "f" => Value::U8(self.regs.f),
            "bc" => Value::U16(self.regs.bc()),
            "de" => Value::U16(self.regs.de()),
            "hl" => Value::U16(self.regs.hl()),
            "ix" => Value::U16(self.regs.ix),
            "iy" => Value::U16(self.regs.iy),
            "i" => Value::U8(self.regs.i),
            "r" => Value::U8(self.regs.r),
            "im" => Value::U8(self.regs.im),
            "iff1" => Value::Bool(self.regs.iff1),
            "iff2" => Value::Bool(self.regs.iff2),
            "halted" => Value::Bool(self.regs.halted),
            "flags.s" => Value::Bool(self.regs.f & SF != 0),
            "flags.z" => Value::Bool(self.regs.f & ZF != 0),
            "flags.c" => Value::Bool(self.regs.f & CF != 0),
            "flags.pv" => Value::Bool(self.regs.f & PF != 0),
            _ => return None,
        })
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "pc", "sp", "a", "f", "bc", "de", "hl", "ix", "iy", "i", "r", "im", "iff1", "iff2",
            "halted", "flags.s", "flags.z", "flags.c", "flags.pv",
        ]
    }
}
