//! Port bus and ULA port model.
//!
//! Port decoding is bit-based: any even port addresses the ULA regardless of
//! the high byte. Writes to the ULA are not applied immediately — they are
//! timestamped and queued, then replayed in order by `process_events` once
//! the current instruction has finished, so a tight beeper loop gets
//! sub-instruction-accurate event timestamps without the bus needing to
//! know where in the instruction it is being called from.
//!
//! The `Bus` trait this implements has no notion of "progress through the
//! current instruction" — the CPU core doesn't thread one through. This
//! model approximates it with a per-instruction write counter that advances
//! a fixed amount per queued write, which is enough to keep multiple writes
//! from the same instruction strictly ordered and inside `[base, base+T)`
//! for every real instruction that performs more than one I/O write
//! (`OUT (C),r` in a loop, `OTIR`/`OTDR`).

use emu_core::{Bus, ReadResult};

use crate::keyboard::KeyboardState;
use crate::memory::Memory;

/// Per-write progress step, in T-states, used to keep same-instruction
/// writes monotonically ordered (see module docs).
const PROGRESS_STEP: u64 = 4;

#[derive(Debug, Clone, Copy)]
struct QueuedWrite {
    value: u8,
    event_t: u64,
}

/// Border colour + beeper + MIC events produced by one `process_events` call.
#[derive(Debug, Default)]
pub struct UlaEvents {
    pub beeper: Vec<(u64, bool)>,
    pub mic: Vec<(u64, bool)>,
}

pub struct PortBus {
    pub memory: Memory,
    pub keyboard: KeyboardState,

    border_colour: u8,
    current_beeper_level: bool,

    queue: std::collections::VecDeque<QueuedWrite>,
    last_event_t: u64,

    instruction_base: u64,
    instruction_progress: u64,

    /// `Some(level)` while a tape source drives the EAR input; `None` reads
    /// as a steady 1 (no cassette connected).
    pub tape_ear: Option<bool>,
}

const QUEUE_CAPACITY: usize = 256;

impl PortBus {
    #[must_use]
    pub fn new(memory: Memory) -> Self {
        Self {
            memory,
            keyboard: KeyboardState::new(),
            border_colour: 0,
            current_beeper_level: false,
            queue: std::collections::VecDeque::with_capacity(QUEUE_CAPACITY),
            last_event_t: 0,
            instruction_base: 0,
            instruction_progress: 0,
            tape_ear: None,
        }
    }

    #[must_use]
    pub fn border_colour(&self) -> u8 {
        self.border_colour
    }

    /// Called by the `Emulator` before `cpu.step()`, establishing the base
    /// T-state that subsequent writes this instruction are timestamped from.
    pub fn begin_instruction(&mut self, base_t: u64) {
        self.instruction_base = base_t;
        self.instruction_progress = 0;
    }

    fn queue_write(&mut self, value: u8) {
        let mut event_t = self.instruction_base + self.instruction_progress;
        self.instruction_progress += PROGRESS_STEP;
        if event_t < self.last_event_t {
            event_t = self.last_event_t;
        }
        self.last_event_t = event_t;

        if self.queue.len() >= QUEUE_CAPACITY {
            self.queue.pop_front();
        }
        self.queue.push_back(QueuedWrite { value, event_t });
    }

    /// Replay all queued writes in order, updating border colour directly
    /// and returning the beeper level changes and MIC transitions produced.
    pub fn process_events(&mut self) -> UlaEvents {
        let mut events = UlaEvents::default();
        while let Some(write) = self.queue.pop_front() {
            self.border_colour = write.value & 0x07;

            let new_beeper = (write.value >> 4) & 1 != 0;
            if new_beeper != self.current_beeper_level {
                self.current_beeper_level = new_beeper;
                events.beeper.push((write.event_t, new_beeper));
            }

            let mic_level = (write.value >> 3) & 1 != 0;
            events.mic.push((write.event_t, mic_level));
        }
        events
    }
}

impl Bus for PortBus {
    fn read(&mut self, address: u16) -> ReadResult {
        ReadResult::new(self.memory.read(address))
    }

    fn write(&mut self, address: u16, value: u8) -> u8 {
        self.memory.write(address, value);
        0
    }

    fn io_read(&mut self, port: u16) -> ReadResult {
        if port & 1 == 0 {
            let addr_high = (port >> 8) as u8;
            // `keyboard.read` forces bits 5-7 high; clear bit 6 back out so
            // the EAR level below is the one that actually lands there.
            let mut value = self.keyboard.read(addr_high) & !0x40;
            if self.tape_ear.unwrap_or(true) {
                value |= 0x40;
            }
            ReadResult::new(value)
        } else {
            ReadResult::new(0xFF)
        }
    }

    fn io_write(&mut self, port: u16, value: u8) -> u8 {
        if port & 1 == 0 {
            self.queue_write(value);
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bus() -> PortBus {
        let rom = vec![0u8; crate::memory::ROM_SIZE];
        PortBus::new(Memory::new(&rom).unwrap())
    }

    #[test]
    fn unimplemented_port_returns_ff() {
        let mut bus = make_bus();
        assert_eq!(bus.io_read(0x00FF).value, 0xFF);
    }

    #[test]
    fn border_and_beeper_update_on_process_events() {
        let mut bus = make_bus();
        bus.begin_instruction(100);
        bus.io_write(0x00FE, 0x10);
        let events = bus.process_events();
        assert_eq!(bus.border_colour(), 0);
        assert_eq!(events.beeper, vec![(100, true)]);
        assert_eq!(events.mic, vec![(100, false)]);
    }

    #[test]
    fn repeated_beeper_level_produces_no_further_events() {
        let mut bus = make_bus();
        bus.begin_instruction(0);
        bus.io_write(0x00FE, 0x10);
        bus.io_write(0x00FE, 0x10);
        let events = bus.process_events();
        assert_eq!(events.beeper.len(), 1);
    }

    #[test]
    fn two_writes_in_one_instruction_are_monotonic_and_in_window() {
        let mut bus = make_bus();
        bus.begin_instruction(1000);
        bus.io_write(0x00FE, 0x00);
        bus.io_write(0x00FE, 0x10);
        let events = bus.process_events();
        assert!(events.beeper[0].0 >= 1000);
        assert!(events.beeper[0].0 < 1000 + 23);
    }

    #[test]
    fn keyboard_read_via_io() {
        let mut bus = make_bus();
        let result = bus.io_read(0xFEFE);
        assert_eq!(result.value & 0x1F, 0x1F);
        bus.keyboard.set_key(0, 0, true);
        let result = bus.io_read(0xFEFE);
        assert_eq!(result.value & 0x01, 0x00);
    }

    #[test]
    fn ear_defaults_high_with_no_tape() {
        let mut bus = make_bus();
        assert_eq!(bus.io_read(0xFEFE).value & 0x40, 0x40);
        bus.tape_ear = Some(false);
        assert_eq!(bus.io_read(0xFEFE).value & 0x40, 0x00);
    }
}
