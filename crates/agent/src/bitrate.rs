use crate::jitter::{mean, push_bounded};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::info;

const LATENCY_WINDOW: usize = 30;
const BANDWIDTH_WINDOW: usize = 20;
const MIN_LATENCY_SAMPLES: usize = 3;
/// Assumed bandwidth when no estimate has been reported yet.
const FALLBACK_BANDWIDTH_KBPS: f64 = 5000.0;

/// Resolution/bitrate/frame-rate bundle selected as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityTier {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
}

/// Ranked lowest to highest.
pub static TIERS: [QualityTier; 6] = [
    QualityTier {
        name: "360p",
        width: 640,
        height: 360,
        bitrate_kbps: 500,
        fps: 24,
    },
    QualityTier {
        name: "480p",
        width: 854,
        height: 480,
        bitrate_kbps: 1000,
        fps: 30,
    },
    QualityTier {
        name: "720p",
        width: 1280,
        height: 720,
        bitrate_kbps: 2500,
        fps: 30,
    },
    QualityTier {
        name: "1080p",
        width: 1920,
        height: 1080,
        bitrate_kbps: 5000,
        fps: 60,
    },
    QualityTier {
        name: "1440p",
        width: 2560,
        height: 1440,
        bitrate_kbps: 8000,
        fps: 60,
    },
    QualityTier {
        name: "4K",
        width: 3840,
        height: 2160,
        bitrate_kbps: 15000,
        fps: 60,
    },
];

pub fn initial_tier() -> &'static QualityTier {
    &TIERS[3]
}

pub fn tier_by_name(name: &str) -> Option<&'static QualityTier> {
    TIERS.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Threshold table, first match wins.
pub fn select_tier(latency_ms: f64, bandwidth_kbps: f64) -> &'static QualityTier {
    let name = if latency_ms > 150.0 || bandwidth_kbps < 1000.0 {
        "480p"
    } else if latency_ms > 100.0 || bandwidth_kbps < 2000.0 {
        "720p"
    } else if latency_ms > 50.0 || bandwidth_kbps < 5000.0 {
        "1080p"
    } else if latency_ms > 20.0 || bandwidth_kbps < 10000.0 {
        "1440p"
    } else {
        "4K"
    };
    tier_by_name(name).unwrap_or_else(initial_tier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierDecision {
    pub tier: &'static QualityTier,
    pub changed: bool,
}

/// Per-stream tier selection over rolling latency/bandwidth windows with a
/// cooldown between changes.
pub struct AdaptiveBitrateController {
    current: &'static QualityTier,
    latency: VecDeque<f64>,
    bandwidth: VecDeque<f64>,
    last_change: Instant,
    cooldown: Duration,
    changes: u64,
}

impl AdaptiveBitrateController {
    /// The cooldown clock starts at `now`, so the first change can happen
    /// no earlier than one cooldown after creation.
    pub fn new(cooldown: Duration, now: Instant) -> Self {
        Self {
            current: initial_tier(),
            latency: VecDeque::with_capacity(LATENCY_WINDOW),
            bandwidth: VecDeque::with_capacity(BANDWIDTH_WINDOW),
            last_change: now,
            cooldown,
            changes: 0,
        }
    }

    pub fn record(&mut self, latency_ms: f64, bandwidth_kbps: Option<f64>) {
        push_bounded(&mut self.latency, latency_ms, LATENCY_WINDOW);
        if let Some(bw) = bandwidth_kbps {
            push_bounded(&mut self.bandwidth, bw, BANDWIDTH_WINDOW);
        }
    }

    /// Evaluate the windows once. A target computed inside the cooldown is
    /// discarded.
    pub fn evaluate(&mut self, now: Instant) -> TierDecision {
        let unchanged = TierDecision {
            tier: self.current,
            changed: false,
        };
        if self.latency.len() < MIN_LATENCY_SAMPLES {
            return unchanged;
        }
        if now.saturating_duration_since(self.last_change) < self.cooldown {
            return unchanged;
        }

        let avg_latency = mean(&self.latency);
        let avg_bandwidth = if self.bandwidth.is_empty() {
            FALLBACK_BANDWIDTH_KBPS
        } else {
            mean(&self.bandwidth)
        };

        let target = select_tier(avg_latency, avg_bandwidth);
        if target == self.current {
            return unchanged;
        }

        self.changes += 1;
        info!(
            from = self.current.name,
            to = target.name,
            avg_latency = format!("{avg_latency:.0}"),
            avg_bandwidth = format!("{avg_bandwidth:.0}"),
            changes = self.changes,
            "Quality tier change"
        );
        self.current = target;
        self.last_change = now;
        TierDecision {
            tier: target,
            changed: true,
        }
    }

    pub fn current(&self) -> &'static QualityTier {
        self.current
    }

    #[cfg(test)]
    pub fn change_count(&self) -> u64 {
        self.changes
    }

    #[cfg(test)]
    pub fn window_lens(&self) -> (usize, usize) {
        (self.latency.len(), self.bandwidth.len())
    }
}
