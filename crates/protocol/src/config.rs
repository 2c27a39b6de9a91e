use serde::{Deserialize, Serialize};

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// X11 display to capture and inject input into
    #[serde(default = "default_display")]
    pub display: String,
    /// Initial monitor (0 = all monitors)
    #[serde(default)]
    pub monitor: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Initial frames per second, clamped to 5..=60
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Initial resize width cap, clamped to 640..=3840
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// Encoder preset knob, clamped to 10..=100
    #[serde(default = "default_quality")]
    pub quality: u32,
    /// Force a specific GStreamer encoder element, e.g. "x264enc"
    pub encoder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Enable audio streaming
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// PulseAudio source; the default monitor captures system output
    #[serde(default = "default_audio_source")]
    pub source: String,
    /// Capacity of the capture queue in 20ms blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Opus bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: u32,
}

/// Adaptive network controller tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u32,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u32,
    #[serde(default = "default_target_delay")]
    pub target_delay_ms: u32,
    /// Minimum time between automatic tier changes
    #[serde(default = "default_tier_cooldown")]
    pub tier_cooldown_ms: u64,
    /// Transport statistics polling interval
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// Upper bound on waiting for ICE gathering before sending a description
    #[serde(default = "default_gather_timeout")]
    pub gather_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Viewer session lifetime without activity
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket URL; empty disables signaling
    #[serde(default)]
    pub server_url: String,
    /// Identifier used in the relay path
    pub agent_id: Option<String>,
    /// PEM certificate to pin for the relay connection
    pub tls_cert: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            display: default_display(),
            monitor: 0,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            max_width: default_max_width(),
            quality: default_quality(),
            encoder: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            source: default_audio_source(),
            queue_capacity: default_queue_capacity(),
            bitrate: default_audio_bitrate(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            target_delay_ms: default_target_delay(),
            tier_cooldown_ms: default_tier_cooldown(),
            stats_interval_ms: default_stats_interval(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
            gather_timeout_ms: default_gather_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl AgentConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, agent should not start) or
    /// "WARNING:" (advisory, agent can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Video knobs (clamped at runtime, flagged here) ---
        if !(crate::FPS_MIN..=crate::FPS_MAX).contains(&self.video.fps) {
            issues.push(format!(
                "WARNING: video.fps {} is outside {}..={} and will be clamped.",
                self.video.fps,
                crate::FPS_MIN,
                crate::FPS_MAX
            ));
        }
        if !(crate::MAX_WIDTH_MIN..=crate::MAX_WIDTH_MAX).contains(&self.video.max_width) {
            issues.push(format!(
                "WARNING: video.max_width {} is outside {}..={} and will be clamped.",
                self.video.max_width,
                crate::MAX_WIDTH_MIN,
                crate::MAX_WIDTH_MAX
            ));
        }
        if !(crate::QUALITY_MIN..=crate::QUALITY_MAX).contains(&self.video.quality) {
            issues.push(format!(
                "WARNING: video.quality {} is outside {}..={} and will be clamped.",
                self.video.quality,
                crate::QUALITY_MIN,
                crate::QUALITY_MAX
            ));
        }

        // --- Audio ---
        if ![8000, 12000, 16000, 24000, 48000].contains(&self.audio.sample_rate) {
            issues.push(format!(
                "ERROR: audio.sample_rate must be an Opus rate (8000, 12000, 16000, 24000, 48000), got {}.",
                self.audio.sample_rate
            ));
        }
        if self.audio.channels == 0 || self.audio.channels > 2 {
            issues.push(format!(
                "ERROR: audio.channels must be 1 or 2, got {}.",
                self.audio.channels
            ));
        }
        if self.audio.queue_capacity == 0 {
            issues.push("ERROR: audio.queue_capacity must be >= 1.".to_string());
        }

        // --- Jitter delays ---
        if self.network.min_delay_ms > self.network.max_delay_ms {
            issues.push(format!(
                "ERROR: network.min_delay_ms ({}) must not exceed network.max_delay_ms ({}).",
                self.network.min_delay_ms, self.network.max_delay_ms
            ));
        } else if !(self.network.min_delay_ms..=self.network.max_delay_ms)
            .contains(&self.network.target_delay_ms)
        {
            issues.push(format!(
                "WARNING: network.target_delay_ms {} is outside {}..={}.",
                self.network.target_delay_ms, self.network.min_delay_ms, self.network.max_delay_ms
            ));
        }
        if self.network.stats_interval_ms < 100 {
            issues.push(format!(
                "ERROR: network.stats_interval_ms must be at least 100, got {}.",
                self.network.stats_interval_ms
            ));
        }

        // --- ICE ---
        if self.ice.gather_timeout_ms == 0 {
            issues.push(
                "ERROR: ice.gather_timeout_ms must be > 0. Gathering must be bounded.".to_string(),
            );
        }
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: TURN URLs are set without turn_username/turn_credential.".to_string(),
            );
        }

        // --- Sessions ---
        if self.session.ttl_secs < 60 {
            issues.push(format!(
                "ERROR: session.ttl_secs must be at least 60, got {}.",
                self.session.ttl_secs
            ));
        }
        if self.session.cleanup_interval_secs == 0 {
            issues.push("ERROR: session.cleanup_interval_secs must be >= 1.".to_string());
        }

        // --- Signaling ---
        let url = &self.signaling.server_url;
        if !url.is_empty() && !url.starts_with("ws://") && !url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: signaling.server_url '{}' must start with 'ws://' or 'wss://'.",
                url
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_display() -> String {
    ":0".to_string()
}
fn default_fps() -> u32 {
    15
}
fn default_max_width() -> u32 {
    1280
}
fn default_quality() -> u32 {
    70
}
fn default_true() -> bool {
    true
}
fn default_sample_rate() -> u32 {
    48000
}
fn default_channels() -> u16 {
    2
}
fn default_audio_source() -> String {
    "@DEFAULT_MONITOR@".to_string()
}
fn default_queue_capacity() -> usize {
    50
}
fn default_audio_bitrate() -> u32 {
    128
}
fn default_min_delay() -> u32 {
    20
}
fn default_max_delay() -> u32 {
    200
}
fn default_target_delay() -> u32 {
    50
}
fn default_tier_cooldown() -> u64 {
    3000
}
fn default_stats_interval() -> u64 {
    1000
}
fn default_gather_timeout() -> u64 {
    5000
}
fn default_session_ttl() -> u64 {
    3600 // 1 hour
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> AgentConfig {
        toml::from_str(toml_str).expect("config should deserialize")
    }

    #[test]
    fn default_config_from_empty_string() {
        let config = parse("");

        assert_eq!(config.capture.display, ":0");
        assert_eq!(config.capture.monitor, 0);

        assert_eq!(config.video.fps, 15);
        assert_eq!(config.video.max_width, 1280);
        assert_eq!(config.video.quality, 70);
        assert!(config.video.encoder.is_none());

        assert!(config.audio.enabled);
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.audio.source, "@DEFAULT_MONITOR@");
        assert_eq!(config.audio.queue_capacity, 50);

        assert_eq!(config.network.min_delay_ms, 20);
        assert_eq!(config.network.max_delay_ms, 200);
        assert_eq!(config.network.target_delay_ms, 50);
        assert_eq!(config.network.tier_cooldown_ms, 3000);

        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
        assert_eq!(config.ice.gather_timeout_ms, 5000);

        assert_eq!(config.session.ttl_secs, 3600);
        assert_eq!(config.session.cleanup_interval_secs, 300);

        assert!(config.signaling.server_url.is_empty());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
        assert!(parse("").validate().is_ok());
    }

    #[test]
    fn partial_config_only_video_section() {
        let config = parse(
            r#"
[video]
fps = 30
encoder = "x264enc"
"#,
        );
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.video.encoder.as_deref(), Some("x264enc"));
        assert_eq!(config.video.max_width, 1280);
        assert!(config.audio.enabled);
        assert_eq!(config.network.tier_cooldown_ms, 3000);
    }

    #[test]
    fn out_of_range_video_knobs_warn() {
        let config = parse(
            r#"
[video]
fps = 240
max_width = 100
"#,
        );
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn non_opus_sample_rate_is_error() {
        let config = parse("[audio]\nsample_rate = 44100\n");
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("audio.sample_rate")));
    }

    #[test]
    fn inverted_delay_bounds_is_error() {
        let config = parse("[network]\nmin_delay_ms = 300\nmax_delay_ms = 100\n");
        let issues = config.validate().unwrap_err();
        assert!(issues[0].starts_with("ERROR:"));
        assert!(issues[0].contains("min_delay_ms"));
    }

    #[test]
    fn zero_gather_timeout_is_error() {
        let config = parse("[ice]\ngather_timeout_ms = 0\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_stun_url_is_error() {
        let config = parse("[ice]\nstun_urls = [\"http://stun.example.com\"]\n");
        let issues = config.validate().unwrap_err();
        assert!(issues[0].contains("must start with 'stun:'"));
    }

    #[test]
    fn turn_without_credentials_warns() {
        let config = parse("[ice]\nturn_urls = [\"turn:turn.example.com:3478\"]\n");
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("WARNING:"));
    }

    #[test]
    fn signaling_url_must_be_websocket() {
        let config = parse("[signaling]\nserver_url = \"https://relay.example.com\"\n");
        assert!(config.validate().is_err());
        let config = parse("[signaling]\nserver_url = \"wss://relay.example.com\"\n");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn short_session_ttl_is_error() {
        let config = parse("[session]\nttl_secs = 5\n");
        assert!(config.validate().is_err());
    }
}
