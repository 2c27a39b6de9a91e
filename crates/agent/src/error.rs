use lumen_protocol::ErrorKind;
use uuid::Uuid;

/// Errors surfaced by the streaming core.
///
/// Transient capture failures are absorbed by the producers and only show up
/// here so the grabber and audio backends can report them.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("{operation} not permitted: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: String,
    },

    #[error("control channel closed for connection {0}")]
    ChannelClosed(Uuid),

    #[error("ICE gathering did not complete within {0} ms")]
    IceGatheringTimeout(u64),

    #[error("encoder '{0}' is not available")]
    EncoderUnavailable(String),

    #[error("capture failed: {0}")]
    CaptureTransient(String),

    #[error("no capture device: {0}")]
    DeviceUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("session {0} expired")]
    SessionExpired(Uuid),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StreamError {
    pub fn invalid_state(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            operation,
            reason: reason.into(),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Wire classification for signaling replies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::ChannelClosed(_) => ErrorKind::ChannelClosed,
            Self::EncoderUnavailable(_) => ErrorKind::EncoderUnavailable,
            Self::IceGatheringTimeout(_) | Self::Transport(_) => ErrorKind::Transport,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::SessionExpired(_) => ErrorKind::SessionExpired,
            Self::CaptureTransient(_) | Self::DeviceUnavailable(_) | Self::Config(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_operation() {
        let err = StreamError::invalid_state("accept_answer", "connection is closed");
        assert_eq!(
            err.to_string(),
            "accept_answer not permitted: connection is closed"
        );
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn kinds_map_to_wire() {
        assert_eq!(
            StreamError::ChannelClosed(Uuid::nil()).kind(),
            ErrorKind::ChannelClosed
        );
        assert_eq!(
            StreamError::EncoderUnavailable("nvh264enc".into()).kind(),
            ErrorKind::EncoderUnavailable
        );
        assert_eq!(StreamError::transport("boom").kind(), ErrorKind::Transport);
        assert_eq!(
            StreamError::SessionExpired(Uuid::nil()).kind(),
            ErrorKind::SessionExpired
        );
        assert_eq!(
            StreamError::Config("bad".into()).kind(),
            ErrorKind::Internal
        );
    }
}
