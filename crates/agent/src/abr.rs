use crate::error::Result;
use crate::network::{NetworkOptimizer, NetworkSample, RecommendedSettings};
use crate::transport::{PeerTransport, TransportStats};
use crate::video::VideoControl;
use lumen_protocol::ControlReply;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Turns one connection's transport statistics into optimizer samples and
/// applies the optimizer's recommendation to the video producer.
pub struct QualityMonitor {
    stream: Uuid,
    optimizer: Arc<NetworkOptimizer>,
    video: Arc<VideoControl>,
    loss_ema: f64,
    prev_sent: u64,
    prev_lost: u64,
}

impl QualityMonitor {
    pub fn new(stream: Uuid, optimizer: Arc<NetworkOptimizer>, video: Arc<VideoControl>) -> Self {
        Self {
            stream,
            optimizer,
            video,
            loss_ema: 0.0,
            prev_sent: 0,
            prev_lost: 0,
        }
    }

    /// Counters are cumulative; loss is computed per interval and smoothed.
    /// No sample until the remote side has reported an RTT.
    pub fn sample_from(&mut self, stats: &TransportStats) -> Option<NetworkSample> {
        let interval_sent = stats.packets_sent.saturating_sub(self.prev_sent);
        let interval_lost = stats.packets_lost.saturating_sub(self.prev_lost);
        self.prev_sent = stats.packets_sent;
        self.prev_lost = stats.packets_lost;

        let loss_rate = if interval_sent > 0 {
            (interval_lost as f64 / interval_sent as f64).min(1.0)
        } else {
            0.0
        };
        self.loss_ema = self.loss_ema * 0.7 + loss_rate * 0.3;

        debug!(
            stream = %self.stream,
            packets_sent = stats.packets_sent,
            packets_lost = stats.packets_lost,
            rtt_ms = ?stats.rtt_ms,
            loss_pct = format!("{:.1}", self.loss_ema * 100.0),
            "Transport stats"
        );

        let latency_ms = stats.rtt_ms?;
        Some(NetworkSample {
            latency_ms,
            jitter_ms: 0.0,
            packet_loss: self.loss_ema,
            bandwidth_kbps: stats.available_outgoing_kbps,
        })
    }

    /// Feed one stats snapshot. Returns the status message to send when the
    /// tier changed.
    pub fn apply(&mut self, stats: &TransportStats, now: Instant) -> Option<ControlReply> {
        if let Some(sample) = self.sample_from(stats) {
            self.optimizer.update(self.stream, sample, now);
        }
        let settings = self.optimizer.recommended_settings(self.stream, now)?;
        self.video.apply_tier(settings.tier);
        if !settings.tier_changed {
            return None;
        }
        info!(
            stream = %self.stream,
            tier = settings.tier.name,
            bitrate_kbps = settings.tier.bitrate_kbps,
            quality_score = settings.quality_score,
            "Stream quality tier changed"
        );
        Some(network_status(&settings))
    }

    pub async fn poll(&mut self, transport: &dyn PeerTransport) -> Result<Option<ControlReply>> {
        let stats = transport.stats().await?;
        Ok(self.apply(&stats, Instant::now()))
    }

    #[cfg(test)]
    pub fn loss_ema(&self) -> f64 {
        self.loss_ema
    }
}

pub fn network_status(settings: &RecommendedSettings) -> ControlReply {
    ControlReply::NetworkStatus {
        tier: settings.tier.name.to_string(),
        width: settings.tier.width,
        height: settings.tier.height,
        bitrate_kbps: settings.tier.bitrate_kbps,
        fps: settings.tier.fps,
        buffer_delay_ms: settings.buffer_delay_ms,
        quality_score: settings.quality_score,
        latency_ms: settings.latency_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitter::JitterBounds;
    use lumen_protocol::StreamSettings;
    use std::time::Duration;

    fn monitor(cooldown: Duration) -> (QualityMonitor, Arc<VideoControl>, Arc<NetworkOptimizer>) {
        let optimizer = Arc::new(NetworkOptimizer::new(JitterBounds::default(), cooldown));
        let video = Arc::new(VideoControl::new(&StreamSettings::default()));
        (
            QualityMonitor::new(Uuid::new_v4(), optimizer.clone(), video.clone()),
            video,
            optimizer,
        )
    }

    fn stats(rtt_ms: f64, sent: u64, lost: u64) -> TransportStats {
        TransportStats {
            rtt_ms: Some(rtt_ms),
            packets_sent: sent,
            packets_lost: lost,
            available_outgoing_kbps: None,
        }
    }

    #[test]
    fn loss_is_per_interval_and_smoothed() {
        let (mut m, _, _) = monitor(Duration::ZERO);
        m.sample_from(&stats(10.0, 100, 0));
        let sample = m.sample_from(&stats(10.0, 200, 10)).unwrap();
        // 10 of 100 lost this interval, EMA 0.7/0.3 from zero.
        assert!((sample.packet_loss - 0.03).abs() < 1e-9);
        let sample = m.sample_from(&stats(10.0, 300, 10)).unwrap();
        assert!((sample.packet_loss - 0.021).abs() < 1e-9);
    }

    #[test]
    fn no_sample_without_rtt() {
        let (mut m, _, optimizer) = monitor(Duration::ZERO);
        let mut s = stats(0.0, 10, 0);
        s.rtt_ms = None;
        assert!(m.sample_from(&s).is_none());
        assert!(m.apply(&s, Instant::now()).is_none());
        assert_eq!(optimizer.stream_count(), 0);
    }

    #[test]
    fn high_latency_downgrades_and_reports_once() {
        let (mut m, video, _) = monitor(Duration::ZERO);
        let now = Instant::now();
        assert!(m.apply(&stats(200.0, 100, 0), now).is_none());
        assert!(m.apply(&stats(200.0, 200, 0), now).is_none());

        let reply = m.apply(&stats(200.0, 300, 0), now).unwrap();
        match reply {
            ControlReply::NetworkStatus {
                tier,
                width,
                bitrate_kbps,
                ..
            } => {
                assert_eq!(tier, "480p");
                assert_eq!(width, 854);
                assert_eq!(bitrate_kbps, 1000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(video.tier().name, "480p");
        assert_eq!(video.bitrate_kbps(), 1000);

        assert!(m.apply(&stats(200.0, 400, 0), now).is_none());
    }

    #[test]
    fn cooldown_holds_the_tier() {
        let (mut m, video, _) = monitor(Duration::from_secs(3));
        let now = Instant::now();
        for i in 1..=5 {
            assert!(m.apply(&stats(200.0, i * 100, 0), now).is_none());
        }
        assert_eq!(video.tier().name, "1080p");
        assert!(
            m.apply(&stats(200.0, 600, 0), now + Duration::from_secs(4))
                .is_some()
        );
    }
}
