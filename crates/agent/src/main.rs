mod abr;
mod audio;
mod bitrate;
mod capture;
mod cli;
mod codec;
mod convert;
mod encoder;
mod error;
mod input;
mod jitter;
mod network;
mod pacer;
mod peer;
mod registry;
mod rtc;
mod session;
mod signaling;
mod transport;
mod video;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lumen_protocol::StreamSettings;
use lumen_protocol::config::AgentConfig;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use audio::{AudioBackendFactory, OpusEncoderFactory, PulseBackendFactory};
use capture::{CaptureSource, GrabberFactory, Monitor, X11GrabberFactory};
use encoder::{GstEncoderCheck, GstEncoderFactory};
use input::{DeviceExecutor, InputExecutor, UnavailableInput, XTestDevice};
use jitter::JitterBounds;
use network::NetworkOptimizer;
use peer::{PeerConnectionManager, PeerDeps, PeerTimings};
use registry::HardwareEncoderRegistry;
use rtc::RtcTransportFactory;
use session::SessionRegistry;
use signaling::SignalingCtx;

/// Fallback capture size when the display cannot be queried at startup.
const FALLBACK_WIDTH: u32 = 1920;
const FALLBACK_HEIGHT: u32 = 1080;

fn load_config(args: &cli::Args) -> anyhow::Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => AgentConfig::default(),
    };
    args.apply(&mut config);

    if let Err(issues) = config.validate() {
        let mut fatal = false;
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{issue}");
                fatal = true;
            } else {
                warn!("{issue}");
            }
        }
        if fatal {
            anyhow::bail!("Invalid configuration ({} issue(s))", issues.len());
        }
    }
    Ok(config)
}

fn initial_settings(config: &AgentConfig) -> StreamSettings {
    StreamSettings {
        fps: StreamSettings::clamp_fps(config.video.fps.into()),
        quality: StreamSettings::clamp_quality(config.video.quality.into()),
        max_width: StreamSettings::clamp_max_width(config.video.max_width.into()),
        audio_enabled: config.audio.enabled,
    }
}

fn query_monitors(grabbers: &dyn GrabberFactory) -> error::Result<Vec<Monitor>> {
    let monitors = grabbers.open().and_then(|mut g| g.monitors())?;
    for m in &monitors {
        info!(
            index = m.index,
            name = %m.name,
            width = m.rect.width,
            height = m.rect.height,
            primary = m.primary,
            "Monitor"
        );
    }
    Ok(monitors)
}

/// Monitor layout from RandR, or a single virtual desktop when the display
/// is unreachable. Grabbers retry the display on every connection.
fn discover_monitors(grabbers: &dyn GrabberFactory) -> Vec<Monitor> {
    query_monitors(grabbers).unwrap_or_else(|e| {
        warn!("Display not available ({e}), assuming a {FALLBACK_WIDTH}x{FALLBACK_HEIGHT} desktop");
        vec![Monitor::virtual_desktop(FALLBACK_WIDTH, FALLBACK_HEIGHT)]
    })
}

fn log_encoders(encoders: &HardwareEncoderRegistry) {
    for d in encoders.descriptors() {
        debug!(
            element = d.element,
            codec = %d.codec,
            listed = d.listed,
            available = d.available,
            priority = d.priority,
            "{}",
            d.description
        );
    }
    let selected = encoders.selected();
    info!(
        encoder = selected.element,
        backend = selected.backend.display_name(),
        hardware = ?encoders.hardware_codecs(),
        "Video encoder selected"
    );
}

/// Re-runs encoder detection and monitor discovery on the blocking pool.
/// A display that cannot be reached keeps the previous layout.
async fn rescan(
    encoders: &Arc<HardwareEncoderRegistry>,
    grabbers: &Arc<dyn GrabberFactory>,
    capture: &Arc<CaptureSource>,
) {
    let encoders = Arc::clone(encoders);
    let grabbers = Arc::clone(grabbers);
    let capture = Arc::clone(capture);
    let result = tokio::task::spawn_blocking(move || {
        encoders.rescan();
        log_encoders(&encoders);
        match query_monitors(grabbers.as_ref()) {
            Ok(monitors) => capture.refresh(monitors),
            Err(e) => warn!("Display not available ({e}), keeping the current monitor layout"),
        }
    })
    .await;
    if let Err(e) = result {
        warn!("Rescan failed: {e}");
    }
}

fn input_executor(display: &str, capture: &Arc<CaptureSource>) -> Arc<dyn InputExecutor> {
    match XTestDevice::connect(display) {
        Ok(device) => Arc::new(DeviceExecutor::new(device, Arc::clone(capture), display)),
        Err(e) => {
            warn!("Input injection unavailable: {e:#}");
            Arc::new(UnavailableInput {
                reason: format!("{e:#}"),
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // TLS WebSocket to the relay
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let args = cli::parse_args()?;
    let config = load_config(&args)?;
    let agent_id = config
        .signaling
        .agent_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(
        display = %config.capture.display,
        agent_id = %agent_id,
        server_url = %config.signaling.server_url,
        "Starting lumen-agent"
    );

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let grabbers: Arc<dyn GrabberFactory> =
        Arc::new(X11GrabberFactory::new(config.capture.display.clone()));
    let capture = Arc::new(CaptureSource::new(
        discover_monitors(grabbers.as_ref()),
        config.capture.monitor,
    ));

    let encoders = Arc::new(HardwareEncoderRegistry::scan(Arc::new(GstEncoderCheck)));
    if let Some(element) = &config.video.encoder
        && let Err(e) = encoders.select_encoder(element)
    {
        warn!("Configured encoder not usable, keeping auto-detected one: {e}");
    }
    log_encoders(&encoders);

    let audio_backends: Arc<dyn AudioBackendFactory> =
        Arc::new(PulseBackendFactory::new(config.audio.source.clone()));
    if config.audio.enabled {
        for device in audio_backends.devices() {
            info!(
                name = %device.name,
                loopback = device.loopback,
                "Audio source: {}",
                device.description
            );
        }
    }

    let optimizer = Arc::new(NetworkOptimizer::new(
        JitterBounds {
            min_delay_ms: config.network.min_delay_ms,
            max_delay_ms: config.network.max_delay_ms,
            target_delay_ms: config.network.target_delay_ms,
        },
        Duration::from_millis(config.network.tier_cooldown_ms),
    ));

    let transports = Arc::new(
        RtcTransportFactory::new(&config.ice).context("Failed to set up WebRTC transport")?,
    );

    let deps = PeerDeps {
        transports,
        capture: Arc::clone(&capture),
        grabbers: Arc::clone(&grabbers),
        encoders: Arc::clone(&encoders),
        encoder_factory: Arc::new(GstEncoderFactory),
        audio_backends,
        audio_encoders: Arc::new(OpusEncoderFactory {
            bitrate_kbps: config.audio.bitrate,
        }),
        audio: config.audio.clone(),
        optimizer,
        input: input_executor(&config.capture.display, &capture),
        timings: PeerTimings::from_config(&config),
    };
    let manager = PeerConnectionManager::new(deps, initial_settings(&config));

    let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(
        config.session.ttl_secs,
    )));
    let cancel = CancellationToken::new();
    let cleanup = tokio::spawn({
        let sessions = Arc::clone(&sessions);
        let cancel = cancel.clone();
        let interval = Duration::from_secs(config.session.cleanup_interval_secs);
        async move { sessions.run_cleanup(interval, cancel).await }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    // SIGHUP re-detects encoders and monitors after a hotplug
    let mut sighup = signal(SignalKind::hangup())?;

    let signaling_ctx = SignalingCtx {
        server_url: &config.signaling.server_url,
        agent_id: &agent_id,
        agent_token: args.agent_token.as_deref(),
        tls_cert_path: config.signaling.tls_cert.as_deref(),
        manager: &manager,
        sessions: &sessions,
    };

    let signaling = signaling::run_signaling(&signaling_ctx);
    tokio::pin!(signaling);
    loop {
        tokio::select! {
            _ = &mut signaling => {
                info!("Signaling ended");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, rescanning encoders and monitors");
                rescan(&encoders, &grabbers, &capture).await;
            }
        }
    }

    manager.close_all().await;
    cancel.cancel();
    let _ = cleanup.await;
    info!("lumen-agent stopped");
    Ok(())
}
