use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default time window for speed calculation.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default maximum retained samples.
const DEFAULT_MAX_SAMPLES: usize = 100;

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    /// Cumulative bytes transferred when the sample was taken.
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed from a sliding window of cumulative samples.
#[derive(Debug)]
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

#[derive(Debug)]
struct SpeedInner {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: VecDeque::new(),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
                window_size: window_size.unwrap_or(DEFAULT_WINDOW),
            }),
        }
    }

    /// Records the cumulative byte count at the current instant.
    pub fn add_sample(&self, total_bytes: u64) {
        self.add_sample_at(Instant::now(), total_bytes);
    }

    fn add_sample_at(&self, now: Instant, total_bytes: u64) {
        let mut s = self.inner.lock();
        s.samples.push_back(SpeedSample {
            bytes: total_bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        let window = s.window_size;
        while s
            .samples
            .front()
            .is_some_and(|sample| now.saturating_duration_since(sample.timestamp) > window)
        {
            s.samples.pop_front();
        }

        while s.samples.len() > s.max_samples {
            s.samples.pop_front();
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples or no elapsed time.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock();
        let (Some(first), Some(last)) = (s.samples.front(), s.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.saturating_duration_since(first.timestamp);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }

        last.bytes.saturating_sub(first.bytes) as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        eta_at(self.bytes_per_second(), remaining_bytes)
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        self.inner.lock().samples.clear();
    }
}

/// Remaining time at `speed` bytes/second.
pub(crate) fn eta_at(speed: f64, remaining_bytes: u64) -> Option<Duration> {
    if speed <= 0.0 || !speed.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
}

/// Integer completion percentage, clamped to `0..=100`.
///
/// An empty total counts as done.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u128::from(done.min(total)) * 100) / u128::from(total)) as u8
}
