//! Tape recorder: MIC-transition capture, block finalisation, TAP pulse
//! decoding, and TAP/WAV write-out.

use std::path::PathBuf;

use log::{debug, warn};

use crate::config::TapeOutputFormat;
use crate::error::SpectrumError;
use crate::tap::{TapBlock, TapFile};

use super::wav;

const PILOT_PULSE: u64 = 2168;
const SYNC1_PULSE: u64 = 667;
const SYNC2_PULSE: u64 = 735;
const ZERO_PULSE: u64 = 855;
const ONE_PULSE: u64 = 1710;

/// Idle silence, in T-states, after which the active block is finalised.
/// ~350,000 T-states at 3.5 MHz is ~0.1s.
const IDLE_THRESHOLD_TSTATES: u64 = 350_000;
/// A block needs at least this many captured pulses before TAP decoding is
/// attempted at all — below this it's almost certainly not real data.
const MIN_PULSES_FOR_TAP_ATTEMPT: usize = 100;
/// `4.8.1` additionally requires this many leading pilot pulses.
const MIN_PILOT_PULSES: usize = 100;

struct ActiveBlock {
    start_level: bool,
    last_level: bool,
    last_transition_t: u64,
    pulses: Vec<u64>,
}

/// Captures MIC transitions into blocks and serialises them to TAP or WAV.
pub struct TapeRecorder {
    format: TapeOutputFormat,
    output_path: Option<PathBuf>,
    audio_dump_path: Option<PathBuf>,
    sample_rate: u32,

    active: Option<ActiveBlock>,
    decoded_blocks: Vec<TapBlock>,
    audio_samples: Vec<i16>,
    dirty: bool,
    append_mode: bool,
    log_decode: bool,
}

impl TapeRecorder {
    #[must_use]
    pub fn new(
        format: TapeOutputFormat,
        output_path: Option<PathBuf>,
        audio_dump_path: Option<PathBuf>,
        sample_rate: u32,
    ) -> Self {
        Self {
            format,
            output_path,
            audio_dump_path,
            sample_rate,
            active: None,
            decoded_blocks: Vec::new(),
            audio_samples: Vec::new(),
            dirty: false,
            append_mode: false,
            log_decode: false,
        }
    }

    pub fn set_log_decode(&mut self, enabled: bool) {
        self.log_decode = enabled;
    }

    /// Begin a fresh recording session. A normal start clears any previous
    /// capture; `append` preserves it and grows the destination past its
    /// current end instead of truncating from the playback head.
    pub fn start(&mut self, append: bool) {
        self.active = None;
        self.decoded_blocks.clear();
        self.audio_samples.clear();
        self.dirty = false;
        self.append_mode = append;
    }

    /// Capture a MIC transition observed at T-state `t`.
    pub fn capture(&mut self, t: u64, level: bool) {
        match &mut self.active {
            None => {
                self.active = Some(ActiveBlock {
                    start_level: level,
                    last_level: level,
                    last_transition_t: t,
                    pulses: Vec::new(),
                });
            }
            Some(block) => {
                if level == block.last_level {
                    return;
                }
                block.pulses.push(t.saturating_sub(block.last_transition_t));
                block.last_level = level;
                block.last_transition_t = t;
            }
        }
    }

    /// Called periodically (e.g. once per frame) with the current T-state
    /// clock; finalises the active block once it has been idle for longer
    /// than the idle threshold.
    pub fn update(&mut self, now: u64) {
        if let Some(block) = &self.active {
            if now.saturating_sub(block.last_transition_t) > IDLE_THRESHOLD_TSTATES {
                self.finalize(now);
            }
        }
    }

    /// Force finalisation of the active block, e.g. on explicit stop.
    pub fn flush(&mut self, now: u64) {
        self.finalize(now);
    }

    fn finalize(&mut self, now: u64) {
        let Some(block) = self.active.take() else {
            return;
        };
        self.dirty = true;

        if self.audio_dump_path.is_some() || self.format == TapeOutputFormat::Wav {
            let idle = now.saturating_sub(block.last_transition_t);
            self.audio_samples
                .extend(render_block_samples(&block, idle, self.sample_rate));
        }

        if self.format == TapeOutputFormat::Tap && block.pulses.len() >= MIN_PULSES_FOR_TAP_ATTEMPT {
            match decode_tap_pulses(&block.pulses) {
                Some(bytes) if bytes.len() >= 2 => {
                    let flag = bytes[0];
                    let data = bytes[1..bytes.len() - 1].to_vec();
                    if self.log_decode {
                        debug!(bytes = bytes.len(), "decoded TAP block from captured pulses");
                    }
                    self.decoded_blocks.push(TapBlock { flag, data });
                }
                _ => {
                    warn!(pulses = block.pulses.len(), "failed to decode captured block as TAP, dropping");
                }
            }
        }
    }

    /// Write out the session if dirty: TAP blocks as a `.tap` file, or WAV
    /// samples with overwrite/append semantics per the session's mode.
    ///
    /// # Errors
    ///
    /// Returns `TapeIo` on file failures or `TapeStateConflict` if append
    /// was requested against a non-WAV destination.
    pub fn write_out(&mut self) -> Result<(), SpectrumError> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = self.output_path.clone() else {
            return Ok(());
        };

        match self.format {
            TapeOutputFormat::Tap => {
                if self.append_mode {
                    return Err(SpectrumError::TapeStateConflict(
                        "append requested on a TAP destination".to_string(),
                    ));
                }
                let tap = TapFile {
                    blocks: self.decoded_blocks.clone(),
                };
                std::fs::write(&path, tap.to_bytes()).map_err(|source| SpectrumError::TapeIo {
                    path: path.clone(),
                    source,
                })?;
            }
            TapeOutputFormat::Wav => {
                if self.append_mode && path.exists() {
                    wav::append(&path, self.sample_rate, &self.audio_samples)?;
                } else {
                    wav::write_new(&path, self.sample_rate, &self.audio_samples)?;
                }
            }
            TapeOutputFormat::None => {}
        }

        if let Some(dump_path) = &self.audio_dump_path {
            wav::write_new(dump_path, self.sample_rate, &self.audio_samples)?;
        }

        self.dirty = false;
        Ok(())
    }
}

fn render_block_samples(block: &ActiveBlock, idle_tstates: u64, sample_rate: u32) -> Vec<i16> {
    const AMPLITUDE: i16 = 2000;
    let cpu_freq = 3_500_000u64;
    let mut samples = Vec::new();
    let mut level = block.start_level;

    for &pulse in &block.pulses {
        let n = ((pulse as f64 * f64::from(sample_rate) / cpu_freq as f64).round() as u64).max(1);
        let amplitude = if level { AMPLITUDE } else { -AMPLITUDE };
        samples.extend(std::iter::repeat(amplitude).take(n as usize));
        level = !level;
    }

    let idle_samples = ((idle_tstates as f64 * f64::from(sample_rate) / cpu_freq as f64).round() as u64).max(0);
    let amplitude = if level { AMPLITUDE } else { -AMPLITUDE };
    samples.extend(std::iter::repeat(amplitude).take(idle_samples as usize));
    samples
}

fn tolerance(reference: u64) -> u64 {
    (reference / 4).max(200)
}

fn within(pulse: u64, reference: u64) -> bool {
    pulse.abs_diff(reference) <= tolerance(reference)
}

/// Decode a captured pulse train back into bytes, per the TAP pulse decoder
/// algorithm: pilot run, sync pair, then data bit pairs MSB-first.
fn decode_tap_pulses(pulses: &[u64]) -> Option<Vec<u8>> {
    let mut i = 0;
    let mut pilot_count = 0;
    while i < pulses.len() && within(pulses[i], PILOT_PULSE) {
        pilot_count += 1;
        i += 1;
    }
    if pilot_count < MIN_PILOT_PULSES {
        return None;
    }
    if i + 2 > pulses.len() || !within(pulses[i], SYNC1_PULSE) || !within(pulses[i + 1], SYNC2_PULSE) {
        return None;
    }
    i += 2;

    let data_pulses = &pulses[i..];
    let usable_len = data_pulses.len() - (data_pulses.len() % 16);
    let data_pulses = &data_pulses[..usable_len];

    let mut bytes = Vec::new();
    let mut current_byte = 0u8;
    let mut bit_count = 0u8;
    for pair in data_pulses.chunks_exact(2) {
        let bit = classify_bit(pair[0], pair[1])?;
        current_byte = (current_byte << 1) | bit;
        bit_count += 1;
        if bit_count == 8 {
            bytes.push(current_byte);
            current_byte = 0;
            bit_count = 0;
        }
    }

    if bytes.len() < 2 {
        None
    } else {
        Some(bytes)
    }
}

fn classify_bit(p0: u64, p1: u64) -> Option<u8> {
    let zero_ok = within(p0, ZERO_PULSE) && within(p1, ZERO_PULSE);
    let one_ok = within(p0, ONE_PULSE) && within(p1, ONE_PULSE);
    match (zero_ok, one_ok) {
        (true, false) => Some(0),
        (false, true) => Some(1),
        _ => tie_break(p0, p1),
    }
}

fn tie_break(p0: u64, p1: u64) -> Option<u8> {
    let sum = p0 + p1;
    let zero_dist = sum.abs_diff(2 * ZERO_PULSE);
    let one_dist = sum.abs_diff(2 * ONE_PULSE);
    if zero_dist <= one_dist && zero_dist <= tolerance(ZERO_PULSE) * 2 {
        Some(0)
    } else if one_dist < zero_dist && one_dist <= tolerance(ONE_PULSE) * 2 {
        Some(1)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthesize_standard_block(flag: u8, data: &[u8]) -> Vec<u64> {
        let mut pulses = Vec::new();
        let pilot_count = if flag == 0x00 { 8063 } else { 3223 };
        for _ in 0..pilot_count {
            pulses.push(PILOT_PULSE);
        }
        pulses.push(SYNC1_PULSE);
        pulses.push(SYNC2_PULSE);

        let mut bytes = vec![flag];
        bytes.extend_from_slice(data);
        let checksum = bytes.iter().fold(0u8, |acc, &b| acc ^ b);
        bytes.push(checksum);

        for byte in bytes {
            for bit_idx in (0..8).rev() {
                let bit = (byte >> bit_idx) & 1;
                let pulse = if bit == 1 { ONE_PULSE } else { ZERO_PULSE };
                pulses.push(pulse);
                pulses.push(pulse);
            }
        }
        pulses
    }

    #[test]
    fn decodes_synthesized_standard_block() {
        let pulses = synthesize_standard_block(0xFF, &[1, 2, 3, 4]);
        let decoded = decode_tap_pulses(&pulses).expect("should decode");
        assert_eq!(decoded[0], 0xFF);
        assert_eq!(&decoded[1..5], &[1, 2, 3, 4]);
    }

    #[test]
    fn rejects_too_few_pilot_pulses() {
        let mut pulses = vec![PILOT_PULSE; 10];
        pulses.push(SYNC1_PULSE);
        pulses.push(SYNC2_PULSE);
        assert!(decode_tap_pulses(&pulses).is_none());
    }

    #[test]
    fn capture_ignores_repeated_level() {
        let mut recorder = TapeRecorder::new(TapeOutputFormat::Tap, None, None, 44_100);
        recorder.start(false);
        recorder.capture(0, true);
        recorder.capture(100, true); // same level, ignored
        recorder.capture(200, false);
        let block = recorder.active.as_ref().unwrap();
        assert_eq!(block.pulses, vec![200]);
    }

    #[test]
    fn idle_timeout_finalizes_block() {
        let mut recorder = TapeRecorder::new(TapeOutputFormat::Tap, None, None, 44_100);
        recorder.start(false);
        recorder.capture(0, true);
        recorder.capture(100, false);
        recorder.update(100 + IDLE_THRESHOLD_TSTATES + 1);
        assert!(recorder.active.is_none());
        assert!(recorder.dirty);
    }

    #[test]
    fn tie_break_prefers_closer_sum() {
        // Both pulses individually ambiguous, but sum close to 2*ONE_PULSE.
        assert_eq!(classify_bit(1700, 1720), Some(1));
    }
}
