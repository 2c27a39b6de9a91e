use std::time::Duration;
use tokio::time::Instant;

/// Fixed-cadence pacing for producer pulls.
///
/// A tick sleeps only for what is left of the interval after the work that
/// started it; work that overruns the interval is not made up later.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    started: Instant,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
        }
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(frame_interval(fps))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Mark the start of a unit of work.
    pub fn start(&mut self) {
        self.started = Instant::now();
    }

    pub fn remainder(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }

    /// Sleep the rest of the interval measured from the last `start`.
    pub async fn wait(&mut self) {
        let remaining = self.remainder(self.started.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }
}

pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / fps.max(1) as u64)
}
