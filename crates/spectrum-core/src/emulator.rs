//! Top-level Spectrum 48K system: owns the CPU, memory/port bus, beeper
//! pipeline, tape playback and recorder, and drives one frame at a time.
//!
//! Wall-clock pacing, presenting frames, and pumping the audio device are a
//! host main-loop responsibility (`4.9`); this crate only guarantees that
//! `run_frame()` advances exactly one 69,888 T-state frame and fires the
//! maskable interrupt at the frame boundary when `IFF1` is set.

use emu_core::{Cpu, Observable, Value};
use zilog_z80::Z80;

use crate::beeper::BeeperState;
use crate::config::{SpectrumConfig, TapeInputFormat, TapeOutputFormat};
use crate::error::SpectrumError;
use crate::keyboard::KeyboardState;
use crate::memory::Memory;
use crate::port_bus::PortBus;
use crate::tape::{TapePlayer, TapeRecorder};

/// T-states per 48K PAL frame (69,888).
pub const FRAME_TSTATES: u64 = 69_888;
/// CPU frequency in Hz (3.5 MHz).
pub const CPU_FREQUENCY: u32 = 3_500_000;

/// Top-level Spectrum 48K emulator.
pub struct Emulator {
    cpu: Z80,
    bus: PortBus,

    master_tstates: u64,
    frame_tstates: u64,
    frame_count: u64,

    beeper: BeeperState,
    tape_player: Option<TapePlayer>,
    recorder: TapeRecorder,
}

impl Emulator {
    /// # Errors
    ///
    /// Returns `InvalidRom` if the configured ROM is not exactly 16,384
    /// bytes.
    pub fn new(config: &SpectrumConfig) -> Result<Self, SpectrumError> {
        let memory = Memory::new(&config.rom)?;
        let bus = PortBus::new(memory);
        let mut beeper = BeeperState::new(CPU_FREQUENCY, config.sample_rate);
        beeper.set_log_resync(config.beeper_log);

        let tape_player = match (&config.tape_input_path, config.tape_input_format) {
            (Some(path), TapeInputFormat::Tap) => {
                Some(TapePlayer::load_tap(path, true, CPU_FREQUENCY)?)
            }
            (Some(path), TapeInputFormat::Tzx) => {
                Some(TapePlayer::load_tzx(path, true, CPU_FREQUENCY)?)
            }
            (Some(path), TapeInputFormat::Wav) => {
                Some(TapePlayer::load_wav(path, true, CPU_FREQUENCY)?)
            }
            _ => None,
        };

        let mut recorder = TapeRecorder::new(
            config.recorder_output_format,
            config.recorder_output_path.clone(),
            config.audio_dump_path.clone(),
            config.sample_rate,
        );
        recorder.set_log_decode(config.tape_debug);

        Ok(Self {
            cpu: Z80::new(),
            bus,
            master_tstates: 0,
            frame_tstates: 0,
            frame_count: 0,
            beeper,
            tape_player,
            recorder,
        })
    }

    /// Advance exactly one 69,888 T-state frame.
    ///
    /// Per instruction: `step` → `bus.process_events` (border/beeper/MIC) →
    /// tape playback update → recorder idle-check. At the frame boundary,
    /// fires the maskable interrupt if `IFF1` is set.
    ///
    /// Returns the number of T-states actually executed this frame (always
    /// `>= FRAME_TSTATES`, since the loop only breaks once the boundary is
    /// crossed — the final instruction of a frame may overrun slightly).
    pub fn run_frame(&mut self) -> u64 {
        let start = self.master_tstates;
        loop {
            self.bus.begin_instruction(self.master_tstates);
            let elapsed = u64::from(self.cpu.step(&mut self.bus));
            self.master_tstates += elapsed;
            self.frame_tstates += elapsed;

            let events = self.bus.process_events();
            for (t, level) in events.beeper {
                self.beeper.push_event(t, level);
            }
            for (t, level) in events.mic {
                self.recorder.capture(t, level);
            }

            if let Some(player) = &mut self.tape_player {
                let ear = player.update(elapsed);
                self.bus.tape_ear = Some(ear);
            }
            self.recorder.update(self.master_tstates);

            if self.frame_tstates >= FRAME_TSTATES {
                self.frame_tstates -= FRAME_TSTATES;
                self.frame_count += 1;
                if self.cpu.registers().iff1 {
                    self.cpu.accept_interrupt(&mut self.bus, 0xFF);
                }
                break;
            }
        }
        self.master_tstates - start
    }

    #[must_use]
    pub fn cpu(&self) -> &Z80 {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Z80 {
        &mut self.cpu
    }

    #[must_use]
    pub fn keyboard(&self) -> &KeyboardState {
        &self.bus.keyboard
    }

    pub fn keyboard_mut(&mut self) -> &mut KeyboardState {
        &mut self.bus.keyboard
    }

    #[must_use]
    pub fn border_colour(&self) -> u8 {
        self.bus.border_colour()
    }

    #[must_use]
    pub fn screen_slice(&self) -> &[u8] {
        self.bus.memory.screen_slice()
    }

    #[must_use]
    pub fn master_tstates(&self) -> u64 {
        self.master_tstates
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Drain the rendered beeper samples. The caller (audio callback) should
    /// call `render_beeper_samples` first to fill the buffer.
    pub fn take_audio_buffer(&mut self) -> Vec<i16> {
        self.beeper.take_buffer()
    }

    pub fn render_beeper_samples(&mut self, n: usize) {
        self.beeper.render(n);
    }

    #[must_use]
    pub fn beeper_latency_samples(&self) -> f64 {
        self.beeper.latency_samples()
    }

    #[must_use]
    pub fn beeper_idle(&self) -> bool {
        self.beeper.is_idle()
    }

    pub fn tape_play(&mut self) {
        if let Some(player) = &mut self.tape_player {
            player.play();
        }
    }

    pub fn tape_pause(&mut self) {
        if let Some(player) = &mut self.tape_player {
            player.pause();
        }
    }

    pub fn tape_resume(&mut self) {
        if let Some(player) = &mut self.tape_player {
            player.resume();
        }
    }

    pub fn tape_rewind(&mut self) {
        if let Some(player) = &mut self.tape_player {
            player.rewind();
        }
    }

    #[must_use]
    pub fn tape_is_playing(&self) -> bool {
        self.tape_player.as_ref().is_some_and(TapePlayer::is_playing)
    }

    pub fn recorder_start(&mut self, append: bool) {
        self.recorder.start(append);
    }

    /// Shutdown sequence per `5. CONCURRENCY & RESOURCE MODEL`: force-flush
    /// the recorder, stop playback, and serialise output files.
    ///
    /// # Errors
    ///
    /// Returns whatever `TapeRecorder::write_out` returns.
    pub fn shutdown(&mut self) -> Result<(), SpectrumError> {
        if let Some(player) = &mut self.tape_player {
            player.pause();
        }
        self.recorder.flush(self.master_tstates);
        self.recorder.write_out()
    }
}

impl Observable for Emulator {
    fn query(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("cpu.") {
            return self.cpu.query(rest);
        }
        match path {
            "master_tstates" => Some(Value::U64(self.master_tstates)),
            "frame_count" => Some(Value::U64(self.frame_count)),
            "border_colour" => Some(Value::U8(self.bus.border_colour())),
            "tape.playing" => Some(Value::Bool(self.tape_is_playing())),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &["master_tstates", "frame_count", "border_colour", "tape.playing"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> SpectrumConfig {
        SpectrumConfig {
            rom: vec![0u8; crate::memory::ROM_SIZE],
            ..SpectrumConfig::default()
        }
    }

    #[test]
    fn run_frame_advances_at_least_one_frame_worth_of_tstates() {
        let mut emulator = Emulator::new(&make_config()).unwrap();
        let elapsed = emulator.run_frame();
        assert!(elapsed >= FRAME_TSTATES);
        assert_eq!(emulator.frame_count(), 1);
    }

    #[test]
    fn interrupt_vector_jumps_to_0x38_in_im1_when_iff1_set() {
        let mut emulator = Emulator::new(&make_config()).unwrap();
        emulator.cpu_mut().regs.iff1 = true;
        emulator.cpu_mut().regs.iff2 = true;
        emulator.cpu_mut().regs.im = 1;
        emulator.cpu_mut().regs.sp = 0xFFF0;

        emulator.run_frame();

        assert_eq!(emulator.cpu().regs.pc, 0x0038);
        assert!(!emulator.cpu().regs.iff1, "IM1 acceptance clears IFF1");
    }

    #[test]
    fn query_reports_frame_and_border_state() {
        let emulator = Emulator::new(&make_config()).unwrap();
        assert_eq!(emulator.query("frame_count"), Some(Value::U64(0)));
        assert_eq!(emulator.query("border_colour"), Some(Value::U8(0)));
    }
}
