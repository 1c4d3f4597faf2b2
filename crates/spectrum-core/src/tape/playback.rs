//! Tape playback: loads a TAP, TZX, or WAV source into the unified signal
//! engine and exposes the play/pause/resume/rewind/seek contract.

use std::path::Path;

use log::debug;

use crate::error::SpectrumError;
use crate::tap::TapFile;
use crate::tzx::{TzxBlock, TzxFile};

use super::signal::PlaybackSignal;
use super::wav::WavFile;

/// A loaded tape source driving the EAR input.
pub struct TapePlayer {
    signal: PlaybackSignal,
    log_debug: bool,
    last_logged_block: usize,
}

impl TapePlayer {
    /// # Errors
    ///
    /// Returns `TapeParse` if the file doesn't parse as the requested
    /// format, or `TapeIo` if it can't be read.
    pub fn load_tap(path: &Path, is_48k: bool, cpu_freq: u32) -> Result<Self, SpectrumError> {
        let data = read_file(path)?;
        let tap = TapFile::parse(&data)?;
        Ok(Self::from_signal(PlaybackSignal::from_tap(&tap, is_48k, cpu_freq)))
    }

    /// # Errors
    ///
    /// See [`Self::load_tap`].
    pub fn load_tzx(path: &Path, is_48k: bool, cpu_freq: u32) -> Result<Self, SpectrumError> {
        let data = read_file(path)?;
        let tzx = TzxFile::parse(&data)?;
        Ok(Self::from_signal(PlaybackSignal::from_tzx_blocks(
            tzx.blocks, is_48k, cpu_freq,
        )))
    }

    /// # Errors
    ///
    /// See [`Self::load_tap`].
    pub fn load_wav(path: &Path, is_48k: bool, cpu_freq: u32) -> Result<Self, SpectrumError> {
        let data = read_file(path)?;
        let wav = WavFile::parse(&data)?;
        let (initial_level, pulses) = wav.to_pulses(cpu_freq);
        let pulses_u16 = pulses
            .into_iter()
            .map(|p| u16::try_from(p).unwrap_or(u16::MAX))
            .collect();
        let blocks = vec![
            TzxBlock::SetSignalLevel { level: initial_level },
            TzxBlock::PulseSequence { pulses: pulses_u16 },
        ];
        Ok(Self::from_signal(PlaybackSignal::from_tzx_blocks(
            blocks, is_48k, cpu_freq,
        )))
    }

    fn from_signal(signal: PlaybackSignal) -> Self {
        Self {
            signal,
            log_debug: false,
            last_logged_block: 0,
        }
    }

    pub fn set_tape_debug(&mut self, enabled: bool) {
        self.log_debug = enabled;
    }

    pub fn play(&mut self) {
        self.signal.play();
    }

    pub fn pause(&mut self) {
        self.signal.pause();
    }

    pub fn resume(&mut self) {
        self.signal.resume();
    }

    pub fn rewind(&mut self) {
        self.signal.rewind();
        self.last_logged_block = 0;
    }

    pub fn seek(&mut self, target_tstates: u64) {
        self.signal.seek(target_tstates);
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.signal.is_playing()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.signal.is_finished()
    }

    /// Advance playback by `delta_tstates` T-states. Returns the EAR level.
    pub fn update(&mut self, delta_tstates: u64) -> bool {
        let level = self.signal.update(delta_tstates);
        if self.log_debug && self.signal.block_index() != self.last_logged_block {
            self.last_logged_block = self.signal.block_index();
            debug!(
                block = self.last_logged_block,
                of = self.signal.block_count(),
                "tape playback advanced to next block"
            );
        }
        level
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, SpectrumError> {
    std::fs::read(path).map_err(|source| SpectrumError::TapeIo {
        path: path.to_path_buf(),
        source,
    })
}
