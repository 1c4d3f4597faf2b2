//! Tape signal generator — converts TZX blocks (including TAP blocks lifted
//! to `TzxBlock::StandardSpeed`) into T-state-accurate EAR bit transitions.
//!
//! The signal generator is a state machine that produces one boolean (EAR
//! level) per CPU T-state. `update()` advances it by a batch of T-states
//! from the main loop rather than one at a time, but the underlying phase
//! machine is unchanged.
//!
//! Each data bit consists of **two** equal-length pulses (one complete
//! square wave cycle). Bits are transmitted MSB first within each byte.

#![allow(clippy::cast_possible_truncation)]

use crate::tap::TapFile;
use crate::tzx::TzxBlock;

const PILOT_PULSE: u16 = 2168;
const SYNC1_PULSE: u16 = 667;
const SYNC2_PULSE: u16 = 735;
const ZERO_PULSE: u16 = 855;
const ONE_PULSE: u16 = 1710;
const HEADER_PILOT_COUNT: u16 = 8063;
const DATA_PILOT_COUNT: u16 = 3223;

/// Inter-block pause synthesised between TAP blocks, which carry no pause
/// field of their own (unlike TZX's explicit `pause_ms`).
const TAP_INTERBLOCK_PAUSE_MS: u16 = 1000;

/// Current position within a block's signal output.
#[derive(Debug, Clone)]
enum SignalPhase {
    Idle,
    Pilot {
        pulse_len: u16,
        remaining: u16,
    },
    Sync1 {
        sync2_len: u16,
    },
    Sync2,
    Data {
        zero_pulse: u16,
        one_pulse: u16,
        data: Vec<u8>,
        byte_idx: usize,
        bit_idx: u8,
        used_bits_last: u8,
        second_half: bool,
        pause_ms: u16,
    },
    Tone {
        pulse_len: u16,
        remaining: u16,
    },
    PulseSeq {
        pulses: Vec<u16>,
        idx: usize,
    },
    Pause {
        remaining: u64,
    },
    Stopped,
}

/// Tape signal generator state machine, driving the EAR input from a list of
/// blocks (TAP blocks converted to `StandardSpeed`, or native TZX blocks).
pub struct PlaybackSignal {
    blocks: Vec<TzxBlock>,
    block_index: usize,
    level: bool,
    pulse_remaining: u64,
    phase: SignalPhase,
    loop_stack: Vec<(usize, u16)>,
    playing: bool,
    is_48k: bool,
    cpu_freq: u32,
    /// Total T-states consumed since the tape was loaded. Zeroed by `rewind`.
    position_tstates: u64,
}

impl PlaybackSignal {
    #[must_use]
    pub fn from_tzx_blocks(blocks: Vec<TzxBlock>, is_48k: bool, cpu_freq: u32) -> Self {
        Self {
            blocks,
            block_index: 0,
            level: false,
            pulse_remaining: 0,
            phase: SignalPhase::Idle,
            loop_stack: Vec::new(),
            playing: false,
            is_48k,
            cpu_freq,
            position_tstates: 0,
        }
    }

    /// Build a signal generator from a TAP file: each block is lifted to a
    /// `StandardSpeed` TZX block (flag + data + recomputed checksum byte,
    /// since a real tape transmits the checksum too) with a 1s pause
    /// synthesised after it, matching how the ROM loader expects gaps
    /// between blocks on a physical cassette.
    #[must_use]
    pub fn from_tap(tap: &TapFile, is_48k: bool, cpu_freq: u32) -> Self {
        let blocks = tap
            .blocks
            .iter()
            .map(|block| {
                let mut data = Vec::with_capacity(block.data.len() + 2);
                data.push(block.flag);
                data.extend_from_slice(&block.data);
                let checksum = data.iter().fold(0u8, |acc, &b| acc ^ b);
                data.push(checksum);
                TzxBlock::StandardSpeed {
                    pause_ms: TAP_INTERBLOCK_PAUSE_MS,
                    data,
                }
            })
            .collect();
        Self::from_tzx_blocks(blocks, is_48k, cpu_freq)
    }

    /// Start (or resume) playback. Idempotent: calling `play` while already
    /// playing is a no-op.
    pub fn play(&mut self) {
        if self.playing {
            return;
        }
        self.playing = true;
        if matches!(self.phase, SignalPhase::Stopped) {
            self.phase = SignalPhase::Idle;
        }
    }

    /// Pause playback. Idempotent.
    pub fn pause(&mut self) {
        self.playing = false;
    }

    /// Resume from a pause. Equivalent to `play`, exposed separately so
    /// callers can express intent without reasoning about `Stopped` state.
    pub fn resume(&mut self) {
        self.play();
    }

    /// Rewind to the start of the tape. Always zeroes `position_tstates`,
    /// even if already at the start.
    pub fn rewind(&mut self) {
        self.block_index = 0;
        self.level = false;
        self.pulse_remaining = 0;
        self.phase = SignalPhase::Idle;
        self.loop_stack.clear();
        self.position_tstates = 0;
    }

    /// Seek to an absolute T-state offset by resimulating from the start.
    /// The signal machine has no O(1) random-access representation, so a
    /// seek is a rewind followed by silently advancing playback state.
    pub fn seek(&mut self, target_tstates: u64) {
        self.rewind();
        let was_playing = self.playing;
        self.playing = true;
        let mut remaining = target_tstates;
        while remaining > 0 && !self.is_finished() {
            let _ = self.tick();
            remaining -= 1;
        }
        self.playing = was_playing;
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.block_index >= self.blocks.len() && matches!(self.phase, SignalPhase::Idle)
    }

    #[must_use]
    pub fn level(&self) -> bool {
        self.level
    }

    #[must_use]
    pub fn block_index(&self) -> usize {
        self.block_index
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn position_tstates(&self) -> u64 {
        self.position_tstates
    }

    /// Advance one CPU T-state. Returns the current EAR level.
    pub fn tick(&mut self) -> bool {
        if !self.playing {
            return self.level;
        }
        self.position_tstates += 1;

        if self.pulse_remaining > 0 {
            self.pulse_remaining -= 1;
            return self.level;
        }

        self.advance_phase();
        self.level
    }

    /// Advance by `n` T-states in one call, as driven by the main loop
    /// after each CPU step. Returns the EAR level at the end of the batch.
    pub fn update(&mut self, n: u64) -> bool {
        for _ in 0..n {
            self.tick();
        }
        self.level
    }

    fn advance_phase(&mut self) {
        match self.phase.clone() {
            SignalPhase::Idle => self.advance_block(),
            SignalPhase::Pilot { pulse_len, remaining } => {
                self.level = !self.level;
                if remaining <= 1 {
                    self.finish_pilot();
                } else {
                    self.phase = SignalPhase::Pilot {
                        pulse_len,
                        remaining: remaining - 1,
                    };
                    self.pulse_remaining = u64::from(pulse_len);
                }
            }
            SignalPhase::Sync1 { sync2_len } => {
                self.level = !self.level;
                self.phase = SignalPhase::Sync2;
                self.pulse_remaining = u64::from(sync2_len);
            }
            SignalPhase::Sync2 => {
                self.level = !self.level;
                self.start_data_from_current_block();
            }
            SignalPhase::Data {
                zero_pulse,
                one_pulse,
                ref data,
                byte_idx,
                bit_idx,
                used_bits_last,
                second_half,
                pause_ms,
            } => {
                self.level = !self.level;
                if !second_half {
                    let bit = (data[byte_idx] >> bit_idx) & 1;
                    let pulse = if bit == 1 { one_pulse } else { zero_pulse };
                    self.phase = SignalPhase::Data {
                        zero_pulse,
                        one_pulse,
                        data: data.clone(),
                        byte_idx,
                        bit_idx,
                        used_bits_last,
                        second_half: true,
                        pause_ms,
                    };
                    self.pulse_remaining = u64::from(pulse);
                } else {
                    let is_last_byte = byte_idx == data.len() - 1;
                    if bit_idx == 0 {
                        if is_last_byte {
                            self.finish_data_block(pause_ms);
                        } else {
                            let new_byte_idx = byte_idx + 1;
                            let new_is_last = new_byte_idx == data.len() - 1;
                            let new_bits = if new_is_last { used_bits_last } else { 8 };
                            let new_bit_idx = new_bits - 1;
                            let bit = (data[new_byte_idx] >> new_bit_idx) & 1;
                            let pulse = if bit == 1 { one_pulse } else { zero_pulse };
                            self.phase = SignalPhase::Data {
                                zero_pulse,
                                one_pulse,
                                data: data.clone(),
                                byte_idx: new_byte_idx,
                                bit_idx: new_bit_idx,
                                used_bits_last,
                                second_half: false,
                                pause_ms,
                            };
                            self.pulse_remaining = u64::from(pulse);
                        }
                    } else {
                        let new_bit_idx = bit_idx - 1;
                        let bit = (data[byte_idx] >> new_bit_idx) & 1;
                        let pulse = if bit == 1 { one_pulse } else { zero_pulse };
                        self.phase = SignalPhase::Data {
                            zero_pulse,
                            one_pulse,
                            data: data.clone(),
                            byte_idx,
                            bit_idx: new_bit_idx,
                            used_bits_last,
                            second_half: false,
                            pause_ms,
                        };
                        self.pulse_remaining = u64::from(pulse);
                    }
                }
            }
            SignalPhase::Tone { pulse_len, remaining } => {
                self.level = !self.level;
                if remaining <= 1 {
                    self.phase = SignalPhase::Idle;
                } else {
                    self.phase = SignalPhase::Tone {
                        pulse_len,
                        remaining: remaining - 1,
                    };
                    self.pulse_remaining = u64::from(pulse_len);
                }
            }
            SignalPhase::PulseSeq { ref pulses, idx } => {
                self.level = !self.level;
                let next_idx = idx + 1;
                if next_idx >= pulses.len() {
                    self.phase = SignalPhase::Idle;
                } else {
                    self.pulse_remaining = u64::from(pulses[next_idx]);
                    self.phase = SignalPhase::PulseSeq {
                        pulses: pulses.clone(),
                        idx: next_idx,
                    };
                }
            }
            SignalPhase::Pause { remaining } => {
                self.level = false;
                if remaining <= 1 {
                    self.phase = SignalPhase::Idle;
                } else {
                    self.phase = SignalPhase::Pause {
                        remaining: remaining - 1,
                    };
                }
            }
            SignalPhase::Stopped => {}
        }
    }

    fn finish_pilot(&mut self) {
        let idx = self.block_index - 1;
        match &self.blocks[idx] {
            TzxBlock::StandardSpeed { .. } => {
                self.phase = SignalPhase::Sync1 { sync2_len: SYNC2_PULSE };
                self.pulse_remaining = u64::from(SYNC1_PULSE);
            }
            TzxBlock::TurboSpeed { sync1, sync2, .. } => {
                self.phase = SignalPhase::Sync1 { sync2_len: *sync2 };
                self.pulse_remaining = u64::from(*sync1);
            }
            _ => self.phase = SignalPhase::Idle,
        }
    }

    fn start_data_from_current_block(&mut self) {
        let idx = self.block_index - 1;
        let (zero_pulse, one_pulse, used_bits, pause_ms, data) = match &self.blocks[idx] {
            TzxBlock::StandardSpeed { pause_ms, data } => {
                (ZERO_PULSE, ONE_PULSE, 8u8, *pause_ms, data.clone())
            }
            TzxBlock::TurboSpeed {
                zero_pulse,
                one_pulse,
                used_bits,
                pause_ms,
                data,
                ..
            } => (*zero_pulse, *one_pulse, *used_bits, *pause_ms, data.clone()),
            _ => {
                self.phase = SignalPhase::Idle;
                return;
            }
        };
        self.start_data_phase(zero_pulse, one_pulse, used_bits, pause_ms, data);
    }

    fn start_data_phase(
        &mut self,
        zero_pulse: u16,
        one_pulse: u16,
        used_bits: u8,
        pause_ms: u16,
        data: Vec<u8>,
    ) {
        if data.is_empty() {
            self.finish_data_block(pause_ms);
            return;
        }
        let used = if used_bits == 0 { 8 } else { used_bits };
        let bits_first_byte = if data.len() == 1 { used } else { 8 };
        let bit_idx = bits_first_byte - 1;
        let bit = (data[0] >> bit_idx) & 1;
        let pulse = if bit == 1 { one_pulse } else { zero_pulse };

        self.phase = SignalPhase::Data {
            zero_pulse,
            one_pulse,
            data,
            byte_idx: 0,
            bit_idx,
            used_bits_last: used,
            second_half: false,
            pause_ms,
        };
        self.pulse_remaining = u64::from(pulse);
    }

    fn finish_data_block(&mut self, pause_ms: u16) {
        if pause_ms > 0 {
            let tstates = ms_to_tstates(pause_ms, self.cpu_freq);
            self.level = false;
            self.phase = SignalPhase::Pause { remaining: tstates };
        } else {
            self.phase = SignalPhase::Idle;
        }
    }

    fn advance_block(&mut self) {
        if self.block_index >= self.blocks.len() {
            self.playing = false;
            self.phase = SignalPhase::Idle;
            return;
        }

        let block = self.blocks[self.block_index].clone();
        self.block_index += 1;

        match block {
            TzxBlock::StandardSpeed { data, .. } => {
                if data.is_empty() {
                    self.phase = SignalPhase::Idle;
                    return;
                }
                let pilot_count = if data[0] == 0x00 {
                    HEADER_PILOT_COUNT
                } else {
                    DATA_PILOT_COUNT
                };
                self.phase = SignalPhase::Pilot {
                    pulse_len: PILOT_PULSE,
                    remaining: pilot_count,
                };
                self.pulse_remaining = u64::from(PILOT_PULSE);
            }
            TzxBlock::TurboSpeed {
                pilot_pulse,
                pilot_count,
                ..
            } => {
                if pilot_count == 0 {
                    self.finish_pilot();
                    return;
                }
                self.phase = SignalPhase::Pilot {
                    pulse_len: pilot_pulse,
                    remaining: pilot_count,
                };
                self.pulse_remaining = u64::from(pilot_pulse);
            }
            TzxBlock::PureTone { pulse_len, count } => {
                if count == 0 {
                    self.phase = SignalPhase::Idle;
                    return;
                }
                self.phase = SignalPhase::Tone {
                    pulse_len,
                    remaining: count,
                };
                self.pulse_remaining = u64::from(pulse_len);
            }
            TzxBlock::PulseSequence { pulses } => {
                if pulses.is_empty() {
                    self.phase = SignalPhase::Idle;
                    return;
                }
                self.pulse_remaining = u64::from(pulses[0]);
                self.phase = SignalPhase::PulseSeq { pulses, idx: 0 };
            }
            TzxBlock::PureData {
                zero_pulse,
                one_pulse,
                used_bits,
                pause_ms,
                data,
            } => self.start_data_phase(zero_pulse, one_pulse, used_bits, pause_ms, data),
            TzxBlock::Pause { duration_ms: 0 } => {
                self.phase = SignalPhase::Stopped;
                self.playing = false;
            }
            TzxBlock::Pause { duration_ms } => {
                let tstates = ms_to_tstates(duration_ms, self.cpu_freq);
                self.level = false;
                self.phase = SignalPhase::Pause { remaining: tstates };
            }
            TzxBlock::LoopStart { repetitions } => {
                self.loop_stack.push((self.block_index, repetitions));
                self.phase = SignalPhase::Idle;
            }
            TzxBlock::LoopEnd => {
                if let Some((loop_start, remaining)) = self.loop_stack.pop() {
                    if remaining > 1 {
                        self.loop_stack.push((loop_start, remaining - 1));
                        self.block_index = loop_start;
                    }
                }
                self.phase = SignalPhase::Idle;
            }
            TzxBlock::StopIf48K => {
                if self.is_48k {
                    self.phase = SignalPhase::Stopped;
                    self.playing = false;
                } else {
                    self.phase = SignalPhase::Idle;
                }
            }
            TzxBlock::SetSignalLevel { level } => {
                self.level = level;
                self.phase = SignalPhase::Idle;
            }
            TzxBlock::GroupStart { .. }
            | TzxBlock::GroupEnd
            | TzxBlock::TextDescription { .. }
            | TzxBlock::ArchiveInfo { .. }
            | TzxBlock::Unknown { .. } => {
                self.phase = SignalPhase::Idle;
            }
        }
    }
}

fn ms_to_tstates(ms: u16, cpu_freq: u32) -> u64 {
    u64::from(ms) * u64::from(cpu_freq) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tap::TapBlock;

    const CPU_3_5MHZ: u32 = 3_500_000;

    fn run_tstates(sig: &mut PlaybackSignal, n: u32) -> Vec<bool> {
        let mut levels = Vec::with_capacity(n as usize);
        for _ in 0..n {
            levels.push(sig.tick());
        }
        levels
    }

    fn count_transitions(levels: &[bool]) -> u32 {
        levels.windows(2).filter(|w| w[0] != w[1]).count() as u32
    }

    #[test]
    fn empty_blocks_finish_immediately() {
        let mut sig = PlaybackSignal::from_tzx_blocks(vec![], true, CPU_3_5MHZ);
        sig.play();
        let _ = sig.tick();
        assert!(sig.is_finished());
    }

    #[test]
    fn pure_tone_toggles_correctly() {
        let pulse_len = 10u16;
        let count = 4u16;
        let mut sig = PlaybackSignal::from_tzx_blocks(
            vec![TzxBlock::PureTone { pulse_len, count }],
            true,
            CPU_3_5MHZ,
        );
        sig.play();
        let total = 1 + (u32::from(pulse_len) + 1) * u32::from(count) + 1;
        let levels = run_tstates(&mut sig, total);
        assert_eq!(count_transitions(&levels), u32::from(count));
    }

    #[test]
    fn play_is_idempotent() {
        let mut sig = PlaybackSignal::from_tzx_blocks(
            vec![TzxBlock::PureTone { pulse_len: 10, count: 4 }],
            true,
            CPU_3_5MHZ,
        );
        sig.play();
        let _ = sig.tick();
        let pos = sig.position_tstates();
        sig.play();
        assert_eq!(sig.position_tstates(), pos, "play() while playing is a no-op");
    }

    #[test]
    fn pause_then_resume_preserves_position() {
        let mut sig = PlaybackSignal::from_tzx_blocks(
            vec![TzxBlock::PureTone { pulse_len: 10, count: 4 }],
            true,
            CPU_3_5MHZ,
        );
        sig.play();
        let _ = run_tstates(&mut sig, 5);
        sig.pause();
        let pos = sig.position_tstates();
        sig.pause();
        assert_eq!(sig.position_tstates(), pos, "pause() while paused is a no-op");
        sig.resume();
        let _ = sig.tick();
        assert_eq!(sig.position_tstates(), pos + 1);
    }

    #[test]
    fn rewind_zeroes_position() {
        let mut sig = PlaybackSignal::from_tzx_blocks(
            vec![TzxBlock::PureTone { pulse_len: 10, count: 4 }],
            true,
            CPU_3_5MHZ,
        );
        sig.play();
        let _ = run_tstates(&mut sig, 5);
        sig.rewind();
        assert_eq!(sig.position_tstates(), 0);
        assert_eq!(sig.block_index(), 0);
    }

    #[test]
    fn tap_block_becomes_standard_speed_with_synthesised_pause() {
        let tap = TapFile {
            blocks: vec![TapBlock {
                flag: 0x00,
                data: vec![1, 2, 3],
            }],
        };
        let sig = PlaybackSignal::from_tap(&tap, true, CPU_3_5MHZ);
        assert_eq!(sig.block_count(), 1);
        match &sig.blocks[0] {
            TzxBlock::StandardSpeed { pause_ms, data } => {
                assert_eq!(*pause_ms, TAP_INTERBLOCK_PAUSE_MS);
                // flag + 3 data bytes + checksum
                assert_eq!(data.len(), 5);
                assert_eq!(data[0], 0x00);
            }
            other => panic!("expected StandardSpeed, got {other:?}"),
        }
    }

    #[test]
    fn data_bit_encoding_zero_and_one() {
        let mut sig = PlaybackSignal::from_tzx_blocks(
            vec![TzxBlock::PureData {
                zero_pulse: 10,
                one_pulse: 20,
                used_bits: 8,
                pause_ms: 0,
                data: vec![0x80],
            }],
            true,
            CPU_3_5MHZ,
        );
        sig.play();
        let levels = run_tstates(&mut sig, 200);
        assert_eq!(count_transitions(&levels), 16);
    }

    #[test]
    fn seek_advances_position_without_audible_side_effects() {
        let mut sig = PlaybackSignal::from_tzx_blocks(
            vec![TzxBlock::PureTone { pulse_len: 10, count: 100 }],
            true,
            CPU_3_5MHZ,
        );
        sig.seek(50);
        assert_eq!(sig.position_tstates(), 50);
        assert!(!sig.is_playing(), "seek should not leave playback enabled if it wasn't");
    }
}
