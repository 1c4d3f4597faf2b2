//! Spectrum model configuration.

use std::path::PathBuf;

/// Supported Spectrum models. v1 implements 48K only: 128K/+2/+3 paging is
/// out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumModel {
    Spectrum48K,
}

/// Tape input container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapeInputFormat {
    #[default]
    None,
    Tap,
    Tzx,
    Wav,
}

/// Tape recorder output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapeOutputFormat {
    #[default]
    None,
    Tap,
    Wav,
}

/// Configuration for creating a Spectrum instance.
pub struct SpectrumConfig {
    pub model: SpectrumModel,
    /// ROM data. Must be exactly 16,384 bytes.
    pub rom: Vec<u8>,
    /// Host audio sample rate for the beeper pipeline.
    pub sample_rate: u32,

    pub tape_input_path: Option<PathBuf>,
    pub tape_input_format: TapeInputFormat,
    pub recorder_output_path: Option<PathBuf>,
    pub recorder_output_format: TapeOutputFormat,
    pub audio_dump_path: Option<PathBuf>,

    /// Log tape block transitions and resync events via `log`.
    pub tape_debug: bool,
    /// Log beeper resync/backpressure events via `log`.
    pub beeper_log: bool,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            model: SpectrumModel::Spectrum48K,
            rom: Vec::new(),
            sample_rate: 48_000,
            tape_input_path: None,
            tape_input_format: TapeInputFormat::None,
            recorder_output_path: None,
            recorder_output_format: TapeOutputFormat::None,
            audio_dump_path: None,
            tape_debug: false,
            beeper_log: false,
        }
    }
}
