use std::collections::VecDeque;
use std::time::Instant;

const ARRIVAL_WINDOW: usize = 100;
const DELTA_WINDOW: usize = 50;
/// Below this many inter-arrival deltas the estimate is too noisy to use.
const MIN_DELTAS: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct JitterBounds {
    pub min_delay_ms: u32,
    pub max_delay_ms: u32,
    pub target_delay_ms: u32,
}

impl Default for JitterBounds {
    fn default() -> Self {
        Self {
            min_delay_ms: 20,
            max_delay_ms: 200,
            target_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterStatus {
    pub current_delay_ms: u32,
    pub jitter_ms: f64,
    pub buffer_size: usize,
}

/// Per-stream estimator of inter-arrival variance, recommending a playout delay.
pub struct JitterBuffer {
    bounds: JitterBounds,
    current_delay_ms: u32,
    arrivals: VecDeque<Instant>,
    deltas: VecDeque<f64>,
}

impl JitterBuffer {
    pub fn new(bounds: JitterBounds) -> Self {
        Self {
            bounds,
            current_delay_ms: bounds.target_delay_ms,
            arrivals: VecDeque::with_capacity(ARRIVAL_WINDOW),
            deltas: VecDeque::with_capacity(DELTA_WINDOW),
        }
    }

    pub fn record_arrival(&mut self, at: Instant) {
        if let Some(&prev) = self.arrivals.back() {
            let delta_ms = at.saturating_duration_since(prev).as_micros() as f64 / 1000.0;
            push_bounded(&mut self.deltas, delta_ms, DELTA_WINDOW);
        }
        push_bounded(&mut self.arrivals, at, ARRIVAL_WINDOW);
    }

    /// `mean + 2 * stdev` of the retained deltas, clamped to the configured bounds.
    pub fn optimal_delay_ms(&mut self) -> u32 {
        if self.deltas.len() < MIN_DELTAS {
            return self.bounds.target_delay_ms;
        }
        let mean = mean(&self.deltas);
        let optimal = (mean + 2.0 * sample_stdev(&self.deltas, mean)) as i64;
        self.current_delay_ms = optimal.clamp(
            self.bounds.min_delay_ms as i64,
            self.bounds.max_delay_ms as i64,
        ) as u32;
        self.current_delay_ms
    }

    pub fn status(&self) -> JitterStatus {
        let jitter_ms = if self.deltas.len() > 1 {
            sample_stdev(&self.deltas, mean(&self.deltas))
        } else {
            0.0
        };
        JitterStatus {
            current_delay_ms: self.current_delay_ms,
            jitter_ms,
            buffer_size: self.arrivals.len(),
        }
    }

    #[cfg(test)]
    pub fn delta_count(&self) -> usize {
        self.deltas.len()
    }
}

pub(crate) fn push_bounded<T>(window: &mut VecDeque<T>, value: T, bound: usize) {
    if window.len() == bound {
        window.pop_front();
    }
    window.push_back(value);
}

pub(crate) fn mean(values: &VecDeque<f64>) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_stdev(values: &VecDeque<f64>, mean: f64) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn feed(buf: &mut JitterBuffer, gaps_ms: &[u64]) {
        let mut at = Instant::now();
        buf.record_arrival(at);
        for gap in gaps_ms {
            at += Duration::from_millis(*gap);
            buf.record_arrival(at);
        }
    }

    #[test]
    fn fewer_than_five_deltas_returns_target() {
        for n in 0..5 {
            let mut buf = JitterBuffer::new(JitterBounds::default());
            feed(&mut buf, &vec![500; n]);
            assert_eq!(buf.delta_count(), n);
            assert_eq!(buf.optimal_delay_ms(), 50);
        }
    }

    #[test]
    fn steady_arrivals_use_mean() {
        let mut buf = JitterBuffer::new(JitterBounds::default());
        feed(&mut buf, &[40; 10]);
        // mean 40, stdev 0
        assert_eq!(buf.optimal_delay_ms(), 40);
    }

    #[test]
    fn variance_widens_delay() {
        let mut buf = JitterBuffer::new(JitterBounds::default());
        feed(&mut buf, &[30, 50, 30, 50, 30, 50]);
        // mean 40, sample stdev ~10.95 -> 61
        assert_eq!(buf.optimal_delay_ms(), 61);
    }

    #[test]
    fn delay_clamped_to_bounds() {
        let mut fast = JitterBuffer::new(JitterBounds::default());
        feed(&mut fast, &[1; 10]);
        assert_eq!(fast.optimal_delay_ms(), 20);

        let mut slow = JitterBuffer::new(JitterBounds::default());
        feed(&mut slow, &[1000; 10]);
        assert_eq!(slow.optimal_delay_ms(), 200);
    }

    #[test]
    fn windows_never_exceed_bounds() {
        let mut buf = JitterBuffer::new(JitterBounds::default());
        feed(&mut buf, &vec![10; 1000]);
        assert_eq!(buf.delta_count(), 50);
        assert_eq!(buf.status().buffer_size, 100);
    }

    #[test]
    fn oldest_deltas_evicted_first() {
        let mut buf = JitterBuffer::new(JitterBounds::default());
        let mut gaps = vec![1000u64; 10];
        gaps.extend(std::iter::repeat_n(30, 50));
        feed(&mut buf, &gaps);
        // The 1000ms gaps have been pushed out.
        assert_eq!(buf.optimal_delay_ms(), 30);
    }

    #[test]
    fn status_reports_jitter() {
        let mut buf = JitterBuffer::new(JitterBounds::default());
        assert_eq!(buf.status().jitter_ms, 0.0);
        feed(&mut buf, &[10, 30]);
        assert!((buf.status().jitter_ms - 14.142).abs() < 0.01);
        assert_eq!(buf.status().current_delay_ms, 50);
    }
}
