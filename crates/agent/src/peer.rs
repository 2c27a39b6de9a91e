//! Peer-connection lifecycle: negotiation, per-connection media pumps,
//! control-channel dispatch and teardown.

use crate::abr::QualityMonitor;
use crate::audio::{AudioBackendFactory, AudioControl, AudioEncoderFactory, AudioFormat, AudioTrack};
use crate::capture::{CaptureSource, GrabberFactory};
use crate::encoder::EncoderFactory;
use crate::error::{Result, StreamError};
use crate::input::InputExecutor;
use crate::network::{NetworkOptimizer, NetworkSample};
use crate::registry::HardwareEncoderRegistry;
use crate::transport::{
    CONTROL_LABEL, ControlChannel, PeerTransport, TransportEvent, TransportFactory,
    TransportHandles, TransportState,
};
use crate::video::{EncoderSource, VideoControl, VideoTrackProducer};
use lumen_protocol::config::{AgentConfig, AudioConfig};
use lumen_protocol::{
    ConfigUpdate, ControlCommand, ControlMessage, ControlReply, InputCommand, InputOutcome,
    StreamSettings,
};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Quality-loop polls between stream status log lines.
const STATUS_LOG_POLLS: u64 = 30;

/// A state enum with an explicit transition graph.
pub trait StateGraph: Copy + PartialEq + Debug {
    const NAME: &'static str;
    fn can_become(self, next: Self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl StateGraph for SignalingState {
    const NAME: &'static str = "signaling";

    fn can_become(self, next: Self) -> bool {
        use SignalingState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Stable, HaveLocalOffer | HaveRemoteOffer) => true,
            (HaveLocalOffer | HaveRemoteOffer, Stable) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

impl StateGraph for IceGatheringState {
    const NAME: &'static str = "ICE gathering";

    fn can_become(self, next: Self) -> bool {
        use IceGatheringState::*;
        matches!((self, next), (New, Gathering) | (Gathering, Complete))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl StateGraph for ConnectionState {
    const NAME: &'static str = "connection";

    fn can_become(self, next: Self) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Failed, Closed) => true,
            (Failed, _) => false,
            (_, Failed | Closed) => true,
            (New, Connecting) | (Connecting, Connected) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStates {
    pub signaling: SignalingState,
    pub ice_gathering: IceGatheringState,
    pub connection: ConnectionState,
}

impl Default for ConnectionStates {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            ice_gathering: IceGatheringState::New,
            connection: ConnectionState::New,
        }
    }
}

/// Applies `next` if the graph allows it. Same-state is a silent no-op.
fn advance<S: StateGraph>(connection: Uuid, current: &mut S, next: S) -> bool {
    if *current == next {
        return false;
    }
    if !current.can_become(next) {
        warn!(
            %connection,
            from = ?current,
            to = ?next,
            "Rejected {} state transition",
            S::NAME
        );
        return false;
    }
    debug!(%connection, from = ?current, to = ?next, "{} state", S::NAME);
    *current = next;
    true
}

#[derive(Debug, Clone, Copy)]
pub struct PeerTimings {
    pub ice_gather_timeout: Duration,
    pub stats_interval: Duration,
}

impl PeerTimings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            ice_gather_timeout: Duration::from_millis(config.ice.gather_timeout_ms),
            stats_interval: Duration::from_millis(config.network.stats_interval_ms),
        }
    }
}

impl Default for PeerTimings {
    fn default() -> Self {
        Self {
            ice_gather_timeout: Duration::from_secs(5),
            stats_interval: Duration::from_secs(1),
        }
    }
}

/// Everything a connection is built from.
pub struct PeerDeps {
    pub transports: Arc<dyn TransportFactory>,
    pub capture: Arc<CaptureSource>,
    pub grabbers: Arc<dyn GrabberFactory>,
    pub encoders: Arc<HardwareEncoderRegistry>,
    pub encoder_factory: Arc<dyn EncoderFactory>,
    pub audio_backends: Arc<dyn AudioBackendFactory>,
    pub audio_encoders: Arc<dyn AudioEncoderFactory>,
    pub audio: AudioConfig,
    pub optimizer: Arc<NetworkOptimizer>,
    pub input: Arc<dyn InputExecutor>,
    pub timings: PeerTimings,
}

struct Connection {
    id: Uuid,
    transport: Arc<dyn PeerTransport>,
    states: Mutex<ConnectionStates>,
    video: Arc<VideoControl>,
    audio: Option<Arc<AudioControl>>,
    channel: Mutex<Option<Arc<dyn ControlChannel>>>,
    cancel: CancellationToken,
}

impl Connection {
    fn states(&self) -> ConnectionStates {
        *self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_signaling(&self, next: SignalingState) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        advance(self.id, &mut states.signaling, next)
    }

    fn set_ice_gathering(&self, next: IceGatheringState) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        advance(self.id, &mut states.ice_gathering, next)
    }

    fn set_connection(&self, next: ConnectionState) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        advance(self.id, &mut states.connection, next)
    }

    fn channel(&self) -> Option<Arc<dyn ControlChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_channel(&self, channel: Option<Arc<dyn ControlChannel>>) -> Option<Arc<dyn ControlChannel>> {
        std::mem::replace(
            &mut *self.channel.lock().unwrap_or_else(|e| e.into_inner()),
            channel,
        )
    }

    /// Best effort; replies to a closed channel are dropped.
    async fn reply(&self, reply: &ControlReply) {
        let Some(channel) = self.channel().filter(|c| c.is_open()) else {
            debug!(connection = %self.id, "No open control channel for reply");
            return;
        };
        let text = match serde_json::to_string(reply) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize control reply: {e}");
                return;
            }
        };
        if let Err(e) = channel.send_text(&text).await {
            debug!(connection = %self.id, "Control reply not sent: {e}");
        }
    }
}

pub struct PeerConnectionManager {
    deps: PeerDeps,
    settings: Mutex<StreamSettings>,
    connections: Mutex<HashMap<Uuid, Arc<Connection>>>,
}

impl PeerConnectionManager {
    pub fn new(deps: PeerDeps, settings: StreamSettings) -> Arc<Self> {
        Arc::new(Self {
            deps,
            settings: Mutex::new(settings),
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> StreamSettings {
        *self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Agent is the offerer. Returns the local description once ICE
    /// gathering completed or timed out.
    pub async fn create_offer(self: &Arc<Self>) -> Result<(String, Uuid)> {
        let conn = self.open_connection(true).await?;
        match self.negotiate_offer(&conn).await {
            Ok(sdp) => Ok((sdp, conn.id)),
            Err(e) => {
                warn!(connection = %conn.id, "Offer failed: {e}");
                self.close(conn.id).await;
                Err(e)
            }
        }
    }

    pub async fn accept_answer(&self, id: Uuid, sdp: &str) -> Result<()> {
        let conn = self.get(id).ok_or_else(|| {
            StreamError::invalid_state("accept_answer", format!("unknown connection {id}"))
        })?;
        let states = conn.states();
        if states.connection == ConnectionState::Closed {
            return Err(StreamError::invalid_state(
                "accept_answer",
                "connection is closed",
            ));
        }
        if states.signaling != SignalingState::HaveLocalOffer {
            return Err(StreamError::invalid_state(
                "accept_answer",
                format!("signaling state is {:?}", states.signaling),
            ));
        }

        if let Err(e) = conn.transport.set_remote_answer(sdp).await {
            warn!(connection = %id, "Remote answer rejected: {e}");
            self.close(id).await;
            return Err(e);
        }
        conn.set_signaling(SignalingState::Stable);
        info!(connection = %id, "Answer applied");
        Ok(())
    }

    /// Viewer is the offerer; the agent answers.
    pub async fn accept_offer(self: &Arc<Self>, sdp: &str) -> Result<(String, Uuid)> {
        let conn = self.open_connection(false).await?;
        match self.negotiate_answer(&conn, sdp).await {
            Ok(answer) => Ok((answer, conn.id)),
            Err(e) => {
                warn!(connection = %conn.id, "Answer failed: {e}");
                self.close(conn.id).await;
                Err(e)
            }
        }
    }

    /// Clamps and applies to every live video producer at its next pull.
    /// `audio_enabled` affects connections created afterwards.
    pub fn update_settings(
        &self,
        fps: Option<i64>,
        max_width: Option<i64>,
        audio_enabled: Option<bool>,
    ) -> StreamSettings {
        let update = ConfigUpdate {
            fps: fps.map(|v| v as f64),
            max_width: max_width.map(|v| v as f64),
            quality: None,
        };
        self.apply_settings(&update, audio_enabled)
    }

    /// Returns false when the connection was already gone.
    pub async fn close(&self, id: Uuid) -> bool {
        let Some(conn) = self.lock_connections().remove(&id) else {
            return false;
        };
        conn.set_signaling(SignalingState::Closed);
        conn.set_connection(ConnectionState::Closed);
        conn.cancel.cancel();
        if let Some(channel) = conn.set_channel(None) {
            channel.close().await;
        }
        self.deps.optimizer.remove(id);
        conn.transport.close().await;
        info!(connection = %id, "Peer connection closed");
        true
    }

    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.lock_connections().keys().copied().collect();
        for id in ids {
            self.close(id).await;
        }
    }

    pub async fn send_control(&self, id: Uuid, text: &str) -> Result<()> {
        let channel = self
            .get(id)
            .and_then(|conn| conn.channel())
            .filter(|channel| channel.is_open())
            .ok_or(StreamError::ChannelClosed(id))?;
        channel.send_text(text).await.map_err(|e| {
            if channel.is_open() {
                e
            } else {
                StreamError::ChannelClosed(id)
            }
        })
    }

    pub fn connection_states(&self, id: Uuid) -> Option<ConnectionStates> {
        self.get(id).map(|conn| conn.states())
    }

    pub fn live_connections(&self) -> Vec<Uuid> {
        self.lock_connections().keys().copied().collect()
    }

    fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.lock_connections().get(&id).cloned()
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_settings(&self, update: &ConfigUpdate, audio_enabled: Option<bool>) -> StreamSettings {
        let settings = {
            let mut current = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            *current = current.merged(update);
            if let Some(enabled) = audio_enabled {
                current.audio_enabled = enabled;
            }
            *current
        };
        let live: Vec<Arc<Connection>> = self.lock_connections().values().cloned().collect();
        for conn in &live {
            conn.video.apply_settings(&settings);
        }
        info!(
            fps = settings.fps,
            max_width = settings.max_width,
            quality = settings.quality,
            audio_enabled = settings.audio_enabled,
            connections = live.len(),
            "Stream settings updated"
        );
        settings
    }

    async fn open_connection(self: &Arc<Self>, offerer: bool) -> Result<Arc<Connection>> {
        let (transport, handles) = self.deps.transports.create().await?;
        let settings = self.settings();
        let conn = Arc::new(Connection {
            id: Uuid::new_v4(),
            transport,
            states: Mutex::new(ConnectionStates::default()),
            video: Arc::new(VideoControl::new(&settings)),
            audio: settings
                .audio_enabled
                .then(|| Arc::new(AudioControl::default())),
            channel: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        self.lock_connections().insert(conn.id, Arc::clone(&conn));

        if let Err(e) = self.attach(&conn, offerer, handles).await {
            warn!(connection = %conn.id, "Failed to set up connection: {e}");
            self.close(conn.id).await;
            return Err(e);
        }
        info!(
            connection = %conn.id,
            offerer,
            audio = conn.audio.is_some(),
            fps = settings.fps,
            max_width = settings.max_width,
            "Peer connection created"
        );
        Ok(conn)
    }

    async fn attach(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        offerer: bool,
        handles: TransportHandles,
    ) -> Result<()> {
        let video_sink = conn.transport.add_video_track().await?;
        let producer = VideoTrackProducer::new(
            Arc::clone(&self.deps.capture),
            Arc::clone(&self.deps.grabbers),
            Arc::clone(&conn.video),
        );
        let encoders = EncoderSource {
            registry: Arc::clone(&self.deps.encoders),
            factory: Arc::clone(&self.deps.encoder_factory),
        };
        tokio::spawn(crate::video::run_video_pump(
            producer,
            encoders,
            video_sink,
            conn.cancel.child_token(),
        ));

        if let Some(control) = &conn.audio {
            let audio_sink = conn.transport.add_audio_track().await?;
            let backends = Arc::clone(&self.deps.audio_backends);
            let config = self.deps.audio.clone();
            let control = Arc::clone(control);
            let track =
                tokio::task::spawn_blocking(move || AudioTrack::start(backends, &config, control))
                    .await
                    .map_err(|e| StreamError::DeviceUnavailable(format!("audio start: {e}")))?;
            match self
                .deps
                .audio_encoders
                .create(AudioFormat::from_config(&self.deps.audio))
            {
                Ok(encoder) => {
                    tokio::spawn(crate::audio::run_audio_pump(
                        track,
                        encoder,
                        audio_sink,
                        conn.cancel.child_token(),
                    ));
                }
                Err(e) => {
                    warn!(connection = %conn.id, "Audio encoder unavailable, no audio: {e:#}");
                    tokio::task::spawn_blocking(move || drop(track));
                }
            }
        }

        if offerer {
            let channel = conn.transport.create_control_channel(CONTROL_LABEL).await?;
            conn.set_channel(Some(channel));
        }

        let TransportHandles {
            events,
            control_messages,
        } = handles;
        tokio::spawn(Arc::clone(self).run_events(Arc::clone(conn), events));
        tokio::spawn(Arc::clone(self).run_control(Arc::clone(conn), control_messages));
        tokio::spawn(Arc::clone(self).run_quality(Arc::clone(conn)));
        Ok(())
    }

    async fn negotiate_offer(&self, conn: &Arc<Connection>) -> Result<String> {
        conn.transport.create_offer().await?;
        conn.set_signaling(SignalingState::HaveLocalOffer);
        conn.set_connection(ConnectionState::Connecting);
        conn.set_ice_gathering(IceGatheringState::Gathering);
        self.finish_gathering(conn).await
    }

    async fn negotiate_answer(&self, conn: &Arc<Connection>, sdp: &str) -> Result<String> {
        conn.transport.set_remote_offer(sdp).await?;
        conn.set_signaling(SignalingState::HaveRemoteOffer);
        conn.set_connection(ConnectionState::Connecting);
        conn.transport.create_answer().await?;
        conn.set_signaling(SignalingState::Stable);
        conn.set_ice_gathering(IceGatheringState::Gathering);
        self.finish_gathering(conn).await
    }

    /// Waits for gathering up to the configured bound. On timeout the
    /// description goes out with the candidates gathered so far.
    async fn finish_gathering(&self, conn: &Arc<Connection>) -> Result<String> {
        let limit = self.deps.timings.ice_gather_timeout;
        match tokio::time::timeout(limit, conn.transport.gathering_complete()).await {
            Ok(()) => {
                conn.set_ice_gathering(IceGatheringState::Complete);
            }
            Err(_) => {
                let err = StreamError::IceGatheringTimeout(limit.as_millis() as u64);
                warn!(connection = %conn.id, "{err}, sending partial candidates");
                let late = Arc::clone(conn);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = late.cancel.cancelled() => {}
                        _ = late.transport.gathering_complete() => {
                            late.set_ice_gathering(IceGatheringState::Complete);
                        }
                    }
                });
            }
        }
        conn.transport.local_description().await
    }

    async fn run_events(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                TransportEvent::State(state) => {
                    if self.on_transport_state(&conn, state).await {
                        break;
                    }
                }
                TransportEvent::KeyframeRequested => conn.video.request_keyframe(),
                TransportEvent::ControlChannelOpened(channel) => {
                    info!(connection = %conn.id, label = %channel.label(), "Control channel open");
                    conn.set_channel(Some(channel));
                }
                TransportEvent::ControlChannelClosed => {
                    info!(connection = %conn.id, "Control channel closed");
                    conn.set_channel(None);
                }
            }
        }
    }

    /// Returns true once the connection has been torn down.
    async fn on_transport_state(&self, conn: &Connection, state: TransportState) -> bool {
        match state {
            TransportState::New => false,
            TransportState::Connecting => {
                conn.set_connection(ConnectionState::Connecting);
                false
            }
            TransportState::Connected => {
                if conn.set_connection(ConnectionState::Connected) {
                    info!(connection = %conn.id, "Peer connected");
                    conn.video.request_keyframe();
                }
                false
            }
            TransportState::Disconnected => {
                warn!(connection = %conn.id, "Peer disconnected, waiting for ICE to recover");
                false
            }
            TransportState::Failed => {
                conn.set_connection(ConnectionState::Failed);
                warn!(connection = %conn.id, "Peer connection failed");
                self.close(conn.id).await;
                true
            }
            TransportState::Closed => {
                self.close(conn.id).await;
                true
            }
        }
    }

    /// One message at a time, in arrival order.
    async fn run_control(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut messages: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            let text = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                text = messages.recv() => match text {
                    Some(text) => text,
                    None => break,
                },
            };
            self.handle_control(&conn, &text).await;
        }
    }

    async fn handle_control(&self, conn: &Connection, text: &str) {
        let message = match ControlMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = %conn.id, "Dropping control message: {e}");
                return;
            }
        };
        let reply = match message {
            ControlMessage::Input(command) => {
                Some(ControlReply::InputResult(self.execute_input(command).await))
            }
            ControlMessage::Control(command) => self.handle_command(conn, command),
        };
        if let Some(reply) = reply {
            conn.reply(&reply).await;
        }
    }

    fn handle_command(&self, conn: &Connection, command: ControlCommand) -> Option<ControlReply> {
        match command {
            ControlCommand::Config(update) => Some(ControlReply::SettingsApplied {
                settings: self.apply_settings(&update, None),
            }),
            ControlCommand::SelectMonitor { index } => {
                Some(match self.deps.capture.select(index) {
                    Ok(monitor) => ControlReply::MonitorSelected {
                        index: monitor.index,
                        width: monitor.rect.width,
                        height: monitor.rect.height,
                    },
                    Err(e) => ControlReply::Error {
                        message: e.to_string(),
                    },
                })
            }
            ControlCommand::Audio(update) => match &conn.audio {
                Some(audio) => {
                    audio.apply(&update);
                    debug!(
                        connection = %conn.id,
                        muted = audio.muted(),
                        volume = audio.volume(),
                        "Audio settings applied"
                    );
                    None
                }
                None => Some(ControlReply::Error {
                    message: "audio is disabled for this connection".to_string(),
                }),
            },
            ControlCommand::NetworkReport(report) => {
                self.deps.optimizer.update(
                    conn.id,
                    NetworkSample {
                        latency_ms: report.latency_ms.max(0.0),
                        jitter_ms: report.jitter_ms.max(0.0),
                        packet_loss: report.packet_loss.clamp(0.0, 1.0),
                        bandwidth_kbps: report.bandwidth_kbps,
                    },
                    Instant::now(),
                );
                None
            }
        }
    }

    fn log_stream_status(&self, id: Uuid) {
        let Some(status) = self.deps.optimizer.status(id) else {
            return;
        };
        info!(
            connection = %id,
            tier = status.tier.name,
            quality_score = status.quality_score,
            latency_ms = format!("{:.0}", status.last_sample.latency_ms),
            loss_pct = format!("{:.1}", status.last_sample.packet_loss * 100.0),
            mean_latency_ms = format!("{:.0}", status.mean_latency_ms),
            mean_quality_score = format!("{:.0}", status.mean_quality_score),
            jitter_ms = format!("{:.1}", status.jitter.jitter_ms),
            buffer_delay_ms = status.jitter.current_delay_ms,
            arrivals = status.jitter.buffer_size,
            samples = status.history_len,
            "Stream status"
        );
    }

    async fn execute_input(&self, command: InputCommand) -> InputOutcome {
        let input = Arc::clone(&self.deps.input);
        tokio::task::spawn_blocking(move || input.execute(&command))
            .await
            .unwrap_or_else(|e| InputOutcome::Error {
                message: format!("input task failed: {e}"),
            })
    }

    /// Polls transport statistics while connected and steers the video
    /// producer's tier.
    async fn run_quality(self: Arc<Self>, conn: Arc<Connection>) {
        let mut monitor = QualityMonitor::new(
            conn.id,
            Arc::clone(&self.deps.optimizer),
            Arc::clone(&conn.video),
        );
        let mut ticker = tokio::time::interval(self.deps.timings.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut errors: u64 = 0;
        let mut polls: u64 = 0;
        loop {
            tokio::select! {
                _ = conn.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if conn.states().connection != ConnectionState::Connected {
                continue;
            }
            polls += 1;
            if polls.is_multiple_of(STATUS_LOG_POLLS) {
                self.log_stream_status(conn.id);
            }
            match monitor.poll(conn.transport.as_ref()).await {
                Ok(Some(status)) => conn.reply(&status).await,
                Ok(None) => {}
                Err(e) => {
                    errors += 1;
                    if errors <= 3 || errors.is_multiple_of(100) {
                        debug!(connection = %conn.id, errors, "Stats poll failed: {e}");
                    }
                }
            }
        }
    }
}
