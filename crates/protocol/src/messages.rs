use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const FPS_MIN: u32 = 5;
pub const FPS_MAX: u32 = 60;
pub const QUALITY_MIN: u32 = 10;
pub const QUALITY_MAX: u32 = 100;
pub const MAX_WIDTH_MIN: u32 = 640;
pub const MAX_WIDTH_MAX: u32 = 3840;

/// Errors raised while decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type '{0}'")]
    UnknownKind(String),
}

/// Message from the signaling relay to the agent.
/// Adjacently tagged so the nested request keeps its own "type" tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum AgentCommand {
    Signal(SignalEnvelope),
    Shutdown,
}

/// A signaling request plus the relay's correlation id, echoed on the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub request: SignalRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRequest {
    /// Agent is the offerer.
    CreateOffer,
    /// Remote answer to an offer we created.
    AcceptAnswer { connection_id: Uuid, sdp: String },
    /// Remote offer; agent answers.
    AcceptOffer { sdp: String },
    Close { connection_id: Uuid },
    /// Create a viewer session, or resume one when `session_id` is set.
    OpenSession {
        #[serde(default)]
        session_id: Option<Uuid>,
        #[serde(default)]
        client_info: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub response: SignalResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalResponse {
    Offer {
        connection_id: Uuid,
        sdp: String,
    },
    Answer {
        connection_id: Uuid,
        sdp: String,
    },
    Accepted {
        connection_id: Uuid,
    },
    Closed {
        connection_id: Uuid,
    },
    Session {
        session_id: Uuid,
        expires_in: u64,
        connection_count: u32,
        settings: SessionSettings,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidState,
    ChannelClosed,
    EncoderUnavailable,
    SessionNotFound,
    SessionExpired,
    Transport,
    Internal,
}

/// Per-viewer preferences remembered across reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub fps: u32,
    pub max_width: u32,
    pub audio_enabled: bool,
    pub audio_muted: bool,
    pub volume: f32,
    pub selected_monitor: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            fps: 15,
            max_width: 1280,
            audio_enabled: true,
            audio_muted: false,
            volume: 1.0,
            selected_monitor: 0,
        }
    }
}

/// Streaming knobs exposed to viewers. Values are clamped, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub fps: u32,
    pub quality: u32,
    pub max_width: u32,
    pub audio_enabled: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            fps: 15,
            quality: 70,
            max_width: 1280,
            audio_enabled: true,
        }
    }
}

impl StreamSettings {
    pub fn clamp_fps(fps: i64) -> u32 {
        fps.clamp(FPS_MIN as i64, FPS_MAX as i64) as u32
    }

    pub fn clamp_quality(quality: i64) -> u32 {
        quality.clamp(QUALITY_MIN as i64, QUALITY_MAX as i64) as u32
    }

    pub fn clamp_max_width(width: i64) -> u32 {
        width.clamp(MAX_WIDTH_MIN as i64, MAX_WIDTH_MAX as i64) as u32
    }

    /// Returns a copy with every present field of `update` applied.
    pub fn merged(mut self, update: &ConfigUpdate) -> Self {
        if let Some(fps) = update.fps {
            self.fps = Self::clamp_fps(round_knob(fps));
        }
        if let Some(quality) = update.quality {
            self.quality = Self::clamp_quality(round_knob(quality));
        }
        if let Some(width) = update.max_width {
            self.max_width = Self::clamp_max_width(round_knob(width));
        }
        self
    }
}

/// Float to integer casts saturate, so any JSON number lands in range.
fn round_knob(value: f64) -> i64 {
    value.round() as i64
}

/// `config` payload. Accepts the camelCase `maxWidth` some viewers send.
/// Any JSON number is taken; rounding and clamping happen in
/// [`StreamSettings::merged`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default, alias = "maxWidth")]
    pub max_width: Option<f64>,
    #[serde(default)]
    pub quality: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioUpdate {
    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub volume: Option<f32>,
}

/// Viewer-side measurements of the media path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkReport {
    pub latency_ms: f64,
    #[serde(default)]
    pub jitter_ms: f64,
    #[serde(default)]
    pub packet_loss: f64,
    #[serde(default)]
    pub bandwidth_kbps: Option<f64>,
}

/// Agent-level control messages carried on the "control" data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlCommand {
    Config(ConfigUpdate),
    SelectMonitor { index: u32 },
    Audio(AudioUpdate),
    NetworkReport(NetworkReport),
}

impl ControlCommand {
    pub const KINDS: &'static [&'static str] =
        &["config", "select_monitor", "audio", "network_report"];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

/// Pointer destination: normalized [0,1] coordinates or absolute pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointerTarget {
    Normalized { nx: f64, ny: f64 },
    Absolute { x: i32, y: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DragTarget {
    Between {
        from_x: i32,
        from_y: i32,
        to_x: i32,
        to_y: i32,
    },
    Normalized {
        nx: f64,
        ny: f64,
    },
    Relative {
        dx: i32,
        dy: i32,
    },
}

fn one() -> u32 {
    1
}

/// Input commands forwarded to the input executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InputCommand {
    MouseMove(PointerTarget),
    MouseMoveRelative {
        dx: i32,
        dy: i32,
    },
    MouseClick {
        #[serde(default)]
        button: MouseButton,
        #[serde(default = "one")]
        clicks: u32,
    },
    DoubleClick {
        #[serde(default)]
        button: MouseButton,
    },
    MouseDown {
        #[serde(default)]
        button: MouseButton,
    },
    MouseUp {
        #[serde(default)]
        button: MouseButton,
    },
    Scroll {
        amount: i32,
    },
    ScrollHorizontal {
        amount: i32,
    },
    KeyType {
        text: String,
    },
    KeyPress {
        key: String,
    },
    Hotkey {
        keys: Vec<String>,
    },
    OpenApp {
        app: String,
    },
    MouseDrag(DragTarget),
}

impl InputCommand {
    pub const KINDS: &'static [&'static str] = &[
        "mouse_move",
        "mouse_move_relative",
        "mouse_click",
        "double_click",
        "mouse_down",
        "mouse_up",
        "scroll",
        "scroll_horizontal",
        "key_type",
        "key_press",
        "hotkey",
        "open_app",
        "mouse_drag",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MouseMove(_) => "mouse_move",
            Self::MouseMoveRelative { .. } => "mouse_move_relative",
            Self::MouseClick { .. } => "mouse_click",
            Self::DoubleClick { .. } => "double_click",
            Self::MouseDown { .. } => "mouse_down",
            Self::MouseUp { .. } => "mouse_up",
            Self::Scroll { .. } => "scroll",
            Self::ScrollHorizontal { .. } => "scroll_horizontal",
            Self::KeyType { .. } => "key_type",
            Self::KeyPress { .. } => "key_press",
            Self::Hotkey { .. } => "hotkey",
            Self::OpenApp { .. } => "open_app",
            Self::MouseDrag(_) => "mouse_drag",
        }
    }
}

/// Anything that may arrive on the control channel, validated before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Control(ControlCommand),
    Input(InputCommand),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let kind = envelope.kind.as_str();
        if ControlCommand::KINDS.contains(&kind) {
            Ok(Self::Control(serde_json::from_str(text)?))
        } else if InputCommand::KINDS.contains(&kind) {
            Ok(Self::Input(serde_json::from_str(text)?))
        } else {
            Err(ProtocolError::UnknownKind(envelope.kind))
        }
    }
}

/// Result of executing an input command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InputOutcome {
    Ok { executed: String },
    Error { message: String },
}

impl InputOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Messages the agent sends to a viewer over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    InputResult(InputOutcome),
    SettingsApplied {
        settings: StreamSettings,
    },
    MonitorSelected {
        index: u32,
        width: u32,
        height: u32,
    },
    NetworkStatus {
        tier: String,
        width: u32,
        height: u32,
        bitrate_kbps: u32,
        fps: u32,
        buffer_delay_ms: u32,
        quality_score: u32,
        latency_ms: f64,
    },
    Error {
        message: String,
    },
}
