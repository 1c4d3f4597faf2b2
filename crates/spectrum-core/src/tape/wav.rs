//! WAV container I/O: loading for playback, writing/appending for the
//! recorder.
//!
//! Only the narrow slice of RIFF/WAVE this emulator needs is supported: a
//! single `fmt ` chunk followed by a single `data` chunk, PCM format, mono,
//! 8- or 16-bit samples. Anything else is a parse error with a message
//! naming what was rejected.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::SpectrumError;

const RIFF_HEADER_LEN: usize = 12;
const FMT_PCM: u16 = 1;

/// A decoded WAV file: sample rate plus samples normalised to `i16`.
pub struct WavFile {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub samples: Vec<i16>,
}

impl WavFile {
    /// # Errors
    ///
    /// Returns `TapeParse` if the RIFF/WAVE structure is malformed or uses
    /// an unsupported format (non-PCM, stereo, or a bit depth other than
    /// 8/16).
    pub fn parse(data: &[u8]) -> Result<Self, SpectrumError> {
        if data.len() < RIFF_HEADER_LEN || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
            return Err(parse_err(0, "not a RIFF/WAVE file"));
        }

        let mut pos = 12;
        let mut fmt: Option<(u16, u16, u32, u16)> = None; // (format, channels, rate, bits)
        let mut pcm_data: Option<&[u8]> = None;

        while pos + 8 <= data.len() {
            let chunk_id = &data[pos..pos + 4];
            let chunk_size = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
            let body_start = pos + 8;
            if body_start + chunk_size > data.len() {
                return Err(parse_err(pos, "chunk runs past end of file"));
            }
            let body = &data[body_start..body_start + chunk_size];

            match chunk_id {
                b"fmt " => {
                    if chunk_size < 16 {
                        return Err(parse_err(pos, "fmt chunk smaller than 16 bytes"));
                    }
                    let format = u16::from_le_bytes(body[0..2].try_into().unwrap());
                    let channels = u16::from_le_bytes(body[2..4].try_into().unwrap());
                    let rate = u32::from_le_bytes(body[4..8].try_into().unwrap());
                    let bits = u16::from_le_bytes(body[14..16].try_into().unwrap());
                    fmt = Some((format, channels, rate, bits));
                }
                b"data" => pcm_data = Some(body),
                _ => {}
            }

            pos = body_start + chunk_size + (chunk_size & 1);
        }

        let (format, channels, rate, bits) =
            fmt.ok_or_else(|| parse_err(0, "missing fmt chunk"))?;
        let pcm_data = pcm_data.ok_or_else(|| parse_err(0, "missing data chunk"))?;

        if format != FMT_PCM {
            return Err(parse_err(0, &format!("unsupported format tag {format}, only PCM is supported")));
        }
        if channels != 1 {
            return Err(parse_err(0, &format!("unsupported channel count {channels}, only mono is supported")));
        }
        if bits != 8 && bits != 16 {
            return Err(parse_err(0, &format!("unsupported bit depth {bits}, only 8 or 16 is supported")));
        }

        let samples = match bits {
            8 => pcm_data.iter().map(|&b| (i16::from(b) - 128) * 256).collect(),
            16 => pcm_data
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
            _ => unreachable!(),
        };

        Ok(Self {
            sample_rate: rate,
            bits_per_sample: bits,
            samples,
        })
    }

    /// Walk the sample stream, emitting one pulse per run of same-sign
    /// samples, and the initial level (sign of the first sample).
    ///
    /// `tstates_per_sample` should be `cpu_freq / sample_rate`. Returned
    /// durations are rounded to the nearest T-state, minimum 1.
    #[must_use]
    pub fn to_pulses(&self, cpu_freq: u32) -> (bool, Vec<u32>) {
        if self.samples.is_empty() {
            return (false, Vec::new());
        }
        let tstates_per_sample = f64::from(cpu_freq) / f64::from(self.sample_rate.max(1));
        let initial_level = self.samples[0] >= 0;

        let mut pulses = Vec::new();
        let mut current_level = initial_level;
        let mut run_len: u64 = 0;
        for &sample in &self.samples {
            let level = sample >= 0;
            if level == current_level {
                run_len += 1;
            } else {
                pulses.push(pulse_duration(run_len, tstates_per_sample));
                current_level = level;
                run_len = 1;
            }
        }
        pulses.push(pulse_duration(run_len, tstates_per_sample));
        (initial_level, pulses)
    }
}

fn pulse_duration(run_len: u64, tstates_per_sample: f64) -> u32 {
    ((run_len as f64 * tstates_per_sample).round() as u64).max(1) as u32
}

fn parse_err(offset: usize, message: &str) -> SpectrumError {
    SpectrumError::TapeParse {
        offset,
        message: message.to_string(),
    }
}

/// Write a fresh mono 16-bit PCM WAV file, truncating any existing file.
///
/// # Errors
///
/// Returns `TapeIo` if the file cannot be created or written.
pub fn write_new(path: &Path, sample_rate: u32, samples: &[i16]) -> Result<(), SpectrumError> {
    let mut file = std::fs::File::create(path).map_err(|source| io_err(path, source))?;
    let header = build_header(sample_rate, samples.len());
    file.write_all(&header).map_err(|source| io_err(path, source))?;
    for &sample in samples {
        file.write_all(&sample.to_le_bytes()).map_err(|source| io_err(path, source))?;
    }
    Ok(())
}

/// Append samples to an existing mono 16-bit PCM WAV file, patching the
/// RIFF and data chunk sizes.
///
/// # Errors
///
/// Returns `TapeIo` on I/O failure, or `TapeParse` if the existing file's
/// format doesn't match (sample rate, channel count, bit depth).
pub fn append(path: &Path, sample_rate: u32, samples: &[i16]) -> Result<(), SpectrumError> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| io_err(path, source))?;

    let mut existing = Vec::new();
    file.read_to_end(&mut existing).map_err(|source| io_err(path, source))?;
    let parsed = WavFile::parse(&existing)?;
    if parsed.sample_rate != sample_rate || parsed.bits_per_sample != 16 {
        return Err(SpectrumError::TapeStateConflict(format!(
            "append target has sample_rate={} bits={}, expected {sample_rate}/16",
            parsed.sample_rate, parsed.bits_per_sample
        )));
    }

    let new_data_len = existing.len() - 44 + samples.len() * 2;
    let riff_size = (36 + new_data_len) as u32;
    let data_size = new_data_len as u32;
    existing[4..8].copy_from_slice(&riff_size.to_le_bytes());
    existing[40..44].copy_from_slice(&data_size.to_le_bytes());

    file.seek(SeekFrom::Start(0)).map_err(|source| io_err(path, source))?;
    file.write_all(&existing[0..44]).map_err(|source| io_err(path, source))?;
    file.seek(SeekFrom::End(0)).map_err(|source| io_err(path, source))?;
    for &sample in samples {
        file.write_all(&sample.to_le_bytes()).map_err(|source| io_err(path, source))?;
    }
    Ok(())
}

fn build_header(sample_rate: u32, sample_count: usize) -> Vec<u8> {
    let data_size = (sample_count * 2) as u32;
    let riff_size = 36 + data_size;
    let byte_rate = sample_rate * 2;
    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&riff_size.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&FMT_PCM.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // mono
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&2u16.to_le_bytes()); // block align
    header.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    header.extend_from_slice(b"data");
    header.extend_from_slice(&data_size.to_le_bytes());
    header
}

fn io_err(path: &Path, source: std::io::Error) -> SpectrumError {
    SpectrumError::TapeIo {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_written_file() {
        let dir = std::env::temp_dir().join(format!("spectrum-core-wav-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.wav");

        let samples = vec![1000i16, -1000, 1000, -1000];
        write_new(&path, 44_100, &samples).unwrap();

        let raw = std::fs::read(&path).unwrap();
        let parsed = WavFile::parse(&raw).unwrap();
        assert_eq!(parsed.sample_rate, 44_100);
        assert_eq!(parsed.samples, samples);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn append_grows_data_chunk() {
        let dir = std::env::temp_dir().join(format!("spectrum-core-wav-test-append-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.wav");

        write_new(&path, 44_100, &[1000, -1000]).unwrap();
        append(&path, 44_100, &[500, -500, 500]).unwrap();

        let raw = std::fs::read(&path).unwrap();
        let parsed = WavFile::parse(&raw).unwrap();
        assert_eq!(parsed.samples, vec![1000, -1000, 500, -500, 500]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_non_pcm_and_stereo() {
        let mut data = build_header(44_100, 0);
        data[20] = 3; // format tag -> IEEE float
        assert!(WavFile::parse(&data).is_err());
    }

    #[test]
    fn to_pulses_emits_one_pulse_per_run() {
        let wav = WavFile {
            sample_rate: 44_100,
            bits_per_sample: 16,
            samples: vec![1000, 1000, -1000, -1000, -1000, 1000],
        };
        let (initial_level, pulses) = wav.to_pulses(3_500_000);
        assert!(initial_level);
        assert_eq!(pulses.len(), 3);
    }
}
