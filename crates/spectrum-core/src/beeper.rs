//! Beeper pipeline: CPU-rate level transitions in, host-rate PCM out.
//!
//! The ULA (port $FE bit 4) produces a sparse stream of level-change events
//! timestamped in T-states. The audio callback consumes them at the host
//! sample rate through a small ring buffer, the only structure in this crate
//! that is genuinely touched from two threads (producer: main loop via the
//! ULA; consumer: the host audio callback).

use log::debug;

/// Amplitude of a beeper high/low sample, pre DC-block.
const AMPLITUDE: i32 = 2000;
/// DC-blocking filter pole. `y = raw - x_prev + alpha * y_prev`.
const DC_ALPHA: f32 = 0.995;
/// Idle interval (in samples) after which the consumer falls back to silence
/// bookkeeping rather than waiting on a producer event.
const IDLE_SAMPLES: u64 = 512;
/// How far behind `playback_position` an incoming event may be before it is
/// treated as a rewind instead of jitter.
const REWIND_TOLERANCE_SAMPLES: u64 = 8;
/// Ring buffer capacity. Sized generously above a frame's worth of bursts.
const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct LevelEvent {
    /// T-state timestamp, in the CPU's T-state clock.
    t: u64,
    level: bool,
}

/// CPU-rate to host-rate beeper resampler.
pub struct BeeperState {
    cpu_frequency: u32,
    sample_rate: u32,

    queue: std::collections::VecDeque<LevelEvent>,
    current_level: bool,

    /// T-state position of the next sample boundary the consumer will cross.
    playback_position: u64,
    /// Highest event timestamp seen so far (monotone, used for backpressure).
    writer_cursor: u64,
    idle_samples: u64,

    dc_x_prev: f32,
    dc_y_prev: f32,

    out: Vec<i16>,
    log_resync: bool,
}

impl BeeperState {
    #[must_use]
    pub fn new(cpu_frequency: u32, sample_rate: u32) -> Self {
        Self {
            cpu_frequency,
            sample_rate,
            queue: std::collections::VecDeque::with_capacity(QUEUE_CAPACITY),
            current_level: false,
            playback_position: 0,
            writer_cursor: 0,
            idle_samples: 0,
            dc_x_prev: 0.0,
            dc_y_prev: 0.0,
            out: Vec::new(),
            log_resync: false,
        }
    }

    pub fn set_log_resync(&mut self, enabled: bool) {
        self.log_resync = enabled;
    }

    fn cycles_per_sample(&self) -> f64 {
        f64::from(self.cpu_frequency) / f64::from(self.sample_rate)
    }

    /// Producer side: queue a level change observed at T-state `t`.
    ///
    /// Handles three policies from the beeper pipeline contract: drop the
    /// oldest event on overflow, treat a timestamp that arrives far behind
    /// `playback_position` as a rewind (flush + resync), and otherwise just
    /// advance `writer_cursor` monotonically.
    pub fn push_event(&mut self, t: u64, level: bool) {
        let tolerance_t =
            (REWIND_TOLERANCE_SAMPLES as f64 * self.cycles_per_sample()) as u64;
        if t.saturating_add(tolerance_t) < self.playback_position {
            if self.log_resync {
                debug!(t, playback_position = self.playback_position, "beeper rewind detected, resyncing");
            }
            self.queue.clear();
            self.playback_position = t;
            self.writer_cursor = t;
            self.current_level = level;
            self.dc_x_prev = 0.0;
            self.dc_y_prev = if level { AMPLITUDE as f32 } else { -(AMPLITUDE as f32) };
            return;
        }

        if self.queue.len() >= QUEUE_CAPACITY {
            self.queue.pop_front();
        }
        self.queue.push_back(LevelEvent { t, level });
        self.writer_cursor = self.writer_cursor.max(t);
    }

    /// Latency between the producer and the consumer, expressed in samples.
    #[must_use]
    pub fn latency_samples(&self) -> f64 {
        let behind = self.writer_cursor.saturating_sub(self.playback_position);
        behind as f64 / self.cycles_per_sample()
    }

    /// Consumer side: render `n` host-rate samples into the internal buffer.
    pub fn render(&mut self, n: usize) {
        let cycles_per_sample = self.cycles_per_sample();
        self.out.reserve(n);

        for _ in 0..n {
            let t_next = self.playback_position + cycles_per_sample as u64;

            let mut had_event = false;
            while let Some(event) = self.queue.front() {
                if event.t > t_next {
                    break;
                }
                self.current_level = event.level;
                self.queue.pop_front();
                had_event = true;
            }

            if had_event || !self.queue.is_empty() {
                self.idle_samples = 0;
            } else {
                self.idle_samples += 1;
            }

            let raw = if self.current_level {
                AMPLITUDE as f32
            } else {
                -(AMPLITUDE as f32)
            };
            let y = raw - self.dc_x_prev + DC_ALPHA * self.dc_y_prev;
            self.dc_x_prev = raw;
            self.dc_y_prev = y;

            self.out.push(y.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            self.playback_position = t_next;
        }
    }

    /// Drain the rendered sample buffer.
    pub fn take_buffer(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.out)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle_samples >= IDLE_SAMPLES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beeper() -> BeeperState {
        BeeperState::new(3_500_000, 44_100)
    }

    #[test]
    fn toggling_square_wave_has_no_long_term_dc() {
        let mut beeper = beeper();
        let cycles_per_sample = beeper.cycles_per_sample();
        let toggle_every = (cycles_per_sample * 4.0) as u64;
        let mut level = false;
        let mut t = 0u64;
        for _ in 0..2000 {
            beeper.push_event(t, level);
            level = !level;
            t += toggle_every;
        }
        beeper.render(2000);
        let samples = beeper.take_buffer();
        let sum: i64 = samples.iter().map(|&s| i64::from(s)).sum();
        let mean = sum as f64 / samples.len() as f64;
        assert!(mean.abs() < 50.0, "mean {mean} should be close to zero");
    }

    #[test]
    fn overflow_drops_oldest_event() {
        let mut beeper = beeper();
        for i in 0..(QUEUE_CAPACITY + 10) {
            beeper.push_event(i as u64 * 10, i % 2 == 0);
        }
        assert_eq!(beeper.queue.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn rewind_flushes_and_resyncs() {
        let mut beeper = beeper();
        beeper.push_event(10_000, true);
        beeper.render(100);
        let pos_before = beeper.playback_position;
        assert!(pos_before > 0);

        // An event far behind playback_position triggers a rewind.
        beeper.push_event(0, false);
        assert_eq!(beeper.playback_position, 0);
        assert!(beeper.queue.is_empty());
    }

    #[test]
    fn idle_after_512_samples_with_no_events() {
        let mut beeper = beeper();
        beeper.render(513);
        assert!(beeper.is_idle());
    }
}
