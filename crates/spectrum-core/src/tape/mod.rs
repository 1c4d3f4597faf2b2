//! Cassette tape subsystem: unified playback signal generation, the
//! higher-level player wrapping TAP/TZX/WAV sources, and the recorder that
//! captures MIC transitions back into TAP or WAV.

pub mod playback;
pub mod recorder;
pub mod signal;
pub mod wav;

pub use playback::TapePlayer;
pub use recorder::TapeRecorder;
