//! Cycle-accurate Z80 CPU emulator.
//!
//! `Z80::step` executes exactly one instruction, including any prefix
//! bytes, and returns the T-states it took. `accept_interrupt`/`accept_nmi`
//! are called by the system around `step` wherever the host's interrupt
//! line timing dictates.

mod alu;
mod cpu;
mod flags;
mod microcode;
mod registers;

pub use cpu::Z80;
pub use flags::{CF, HF, NF, PF, SF, XF, YF, ZF};
pub use registers::Registers;

#[cfg(feature = "test-utils")]
pub use microcode::MicroOp;
