use std::time::{Duration, Instant};

/// Wall-clock accumulator for repeated `tic`/`toc` pairs.
#[derive(Debug, Default, Clone)]
pub struct Timer {
    start: Option<Instant>,
    total: Duration,
    calls: u32,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tic(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Stops the running interval and returns the average seconds per call
    /// since the last `clear`. A `toc` without a matching `tic` only reports.
    pub fn toc(&mut self) -> f64 {
        if let Some(start) = self.start.take() {
            self.total += start.elapsed();
            self.calls += 1;
        }
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total.as_secs_f64() / self.calls as f64
        }
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn calls(&self) -> u32 {
        self.calls
    }

    pub fn clear(&mut self) {
        self.start = None;
        self.total = Duration::ZERO;
        self.calls = 0;
    }
}
