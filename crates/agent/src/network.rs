use crate::bitrate::{AdaptiveBitrateController, QualityTier};
use crate::jitter::{JitterBounds, JitterBuffer, JitterStatus, push_bounded};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const HISTORY_WINDOW: usize = 100;

/// One observation of the media path, from transport stats or the viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkSample {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    /// Fraction in 0.0..=1.0
    pub packet_loss: f64,
    pub bandwidth_kbps: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecommendedSettings {
    pub tier: &'static QualityTier,
    pub tier_changed: bool,
    pub buffer_delay_ms: u32,
    pub quality_score: u32,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStatus {
    pub last_sample: NetworkSample,
    pub quality_score: u32,
    pub jitter: JitterStatus,
    pub tier: &'static QualityTier,
    pub history_len: usize,
    /// Means over the retained measurement history
    pub mean_latency_ms: f64,
    pub mean_quality_score: f64,
}

#[derive(Debug, Clone, Copy)]
struct Measurement {
    latency_ms: f64,
    quality_score: u32,
}

/// Advisory 0..=100 score. Not used for tier selection.
pub fn quality_score(latency_ms: f64, packet_loss: f64) -> u32 {
    let latency_score = (100.0 - latency_ms).max(0.0);
    let loss_score = (100.0 - packet_loss * 100.0).max(0.0);
    ((latency_score + loss_score) / 2.0) as u32
}

struct StreamOptimizer {
    jitter: JitterBuffer,
    abr: AdaptiveBitrateController,
    last_sample: NetworkSample,
    quality_score: u32,
    history: VecDeque<Measurement>,
}

impl StreamOptimizer {
    fn new(bounds: JitterBounds, cooldown: Duration, now: Instant) -> Self {
        Self {
            jitter: JitterBuffer::new(bounds),
            abr: AdaptiveBitrateController::new(cooldown, now),
            last_sample: NetworkSample::default(),
            quality_score: 100,
            history: VecDeque::with_capacity(HISTORY_WINDOW),
        }
    }
}

/// Aggregates a jitter buffer and a bitrate controller per live stream.
pub struct NetworkOptimizer {
    bounds: JitterBounds,
    cooldown: Duration,
    streams: Mutex<HashMap<Uuid, StreamOptimizer>>,
}

impl NetworkOptimizer {
    pub fn new(bounds: JitterBounds, cooldown: Duration) -> Self {
        Self {
            bounds,
            cooldown,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(&self, stream: Uuid, sample: NetworkSample, now: Instant) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let opt = streams
            .entry(stream)
            .or_insert_with(|| StreamOptimizer::new(self.bounds, self.cooldown, now));

        opt.jitter.record_arrival(now);
        opt.abr.record(sample.latency_ms, sample.bandwidth_kbps);
        opt.quality_score = quality_score(sample.latency_ms, sample.packet_loss);
        opt.last_sample = sample;
        push_bounded(
            &mut opt.history,
            Measurement {
                latency_ms: sample.latency_ms,
                quality_score: opt.quality_score,
            },
            HISTORY_WINDOW,
        );
        debug!(
            %stream,
            latency_ms = format!("{:.0}", sample.latency_ms),
            loss_pct = format!("{:.1}", sample.packet_loss * 100.0),
            quality_score = opt.quality_score,
            "Network sample"
        );
    }

    /// Current tier preset plus buffer delay. Evaluates tier selection once,
    /// subject to the cooldown.
    pub fn recommended_settings(&self, stream: Uuid, now: Instant) -> Option<RecommendedSettings> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let opt = streams.get_mut(&stream)?;
        let decision = opt.abr.evaluate(now);
        Some(RecommendedSettings {
            tier: decision.tier,
            tier_changed: decision.changed,
            buffer_delay_ms: opt.jitter.optimal_delay_ms(),
            quality_score: opt.quality_score,
            latency_ms: opt.last_sample.latency_ms,
        })
    }

    pub fn status(&self, stream: Uuid) -> Option<StreamStatus> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let opt = streams.get(&stream)?;
        let n = opt.history.len().max(1) as f64;
        Some(StreamStatus {
            mean_latency_ms: opt.history.iter().map(|m| m.latency_ms).sum::<f64>() / n,
            mean_quality_score: opt.history.iter().map(|m| m.quality_score as f64).sum::<f64>() / n,
            last_sample: opt.last_sample,
            quality_score: opt.quality_score,
            jitter: opt.jitter.status(),
            tier: opt.abr.current(),
            history_len: opt.history.len(),
        })
    }

    pub fn remove(&self, stream: Uuid) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if streams.remove(&stream).is_some() {
            debug!(%stream, "Network optimizer state dropped");
        }
    }

    #[cfg(test)]
    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> NetworkOptimizer {
        NetworkOptimizer::new(JitterBounds::default(), Duration::from_secs(3))
    }

    fn sample(latency_ms: f64, bandwidth_kbps: f64) -> NetworkSample {
        NetworkSample {
            latency_ms,
            jitter_ms: 0.0,
            packet_loss: 0.0,
            bandwidth_kbps: Some(bandwidth_kbps),
        }
    }

    #[test]
    fn quality_score_formula() {
        assert_eq!(quality_score(0.0, 0.0), 100);
        assert_eq!(quality_score(50.0, 0.1), 70);
        assert_eq!(quality_score(250.0, 2.0), 0);
        assert_eq!(quality_score(33.0, 0.005), 83);
    }

    #[test]
    fn unknown_stream_has_no_recommendation() {
        let opt = optimizer();
        assert!(opt.recommended_settings(Uuid::new_v4(), Instant::now()).is_none());
        assert!(opt.status(Uuid::new_v4()).is_none());
    }

    #[test]
    fn streams_are_independent() {
        let opt = optimizer();
        let start = Instant::now();
        let bad = Uuid::new_v4();
        let good = Uuid::new_v4();
        for i in 0..5u64 {
            let at = start + Duration::from_millis(i * 100);
            opt.update(bad, sample(300.0, 200.0), at);
            opt.update(good, sample(5.0, 50_000.0), at);
        }
        let later = start + Duration::from_secs(4);
        assert_eq!(opt.recommended_settings(bad, later).unwrap().tier.name, "480p");
        assert_eq!(opt.recommended_settings(good, later).unwrap().tier.name, "4K");
        assert_eq!(opt.stream_count(), 2);
    }

    #[test]
    fn recommendation_carries_buffer_and_latency() {
        let opt = optimizer();
        let stream = Uuid::new_v4();
        let start = Instant::now();
        opt.update(stream, sample(42.0, 5000.0), start);
        let rec = opt.recommended_settings(stream, start).unwrap();
        assert_eq!(rec.tier.name, "1080p");
        assert!(!rec.tier_changed);
        assert_eq!(rec.buffer_delay_ms, 50);
        assert_eq!(rec.latency_ms, 42.0);
        assert_eq!(rec.quality_score, 79);
    }

    #[test]
    fn history_bounded() {
        let opt = optimizer();
        let stream = Uuid::new_v4();
        let start = Instant::now();
        for i in 0..250u64 {
            opt.update(stream, sample(10.0, 9000.0), start + Duration::from_millis(i));
        }
        let status = opt.status(stream).unwrap();
        assert_eq!(status.history_len, 100);
        assert_eq!(status.jitter.buffer_size, 100);
        assert_eq!(status.mean_latency_ms, 10.0);
        assert_eq!(status.mean_quality_score, 95.0);
    }

    #[test]
    fn remove_forgets_stream() {
        let opt = optimizer();
        let stream = Uuid::new_v4();
        opt.update(stream, sample(10.0, 9000.0), Instant::now());
        opt.remove(stream);
        opt.remove(stream);
        assert_eq!(opt.stream_count(), 0);
    }
}
