//! Error types for the Spectrum core.
//!
//! Recoverable failures (tape I/O, malformed files, unavailable audio) are
//! returned to the caller. An unknown opcode is not recoverable: it signals
//! ROM/RAM corruption in the emulator itself, so the core logs and aborts
//! rather than returning a value a caller could plausibly act on.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the Spectrum core.
#[derive(Debug, Error)]
pub enum SpectrumError {
    #[error("ROM must be exactly {expected} bytes, got {actual}")]
    InvalidRom { expected: usize, actual: usize },

    #[error("tape parse error at offset {offset}: {message}")]
    TapeParse { offset: usize, message: String },

    #[error("tape I/O error on {path}: {source}")]
    TapeIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tape state conflict: {0}")]
    TapeStateConflict(String),

    #[error("audio device unavailable: {0}")]
    AudioDeviceUnavailable(String),

    #[error("unknown opcode ${opcode:02X} (prefix ${prefix:02X}) at PC=${pc:04X}")]
    UnknownOpcode { pc: u16, prefix: u8, opcode: u8 },
}

pub type Result<T> = std::result::Result<T, SpectrumError>;
