//! Seam between the peer-connection manager and the WebRTC stack.
//!
//! The manager only talks to these traits; `rtc` implements them on top of
//! webrtc-rs and the tests implement them in memory.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Label of the ordered data channel carrying control and input messages.
pub const CONTROL_LABEL: &str = "control";

/// Transport-level connection state as reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum TransportEvent {
    State(TransportState),
    /// The viewer asked for a keyframe (PLI/FIR).
    KeyframeRequested,
    /// The remote side opened the control channel.
    ControlChannelOpened(Arc<dyn ControlChannel>),
    ControlChannelClosed,
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State(s) => f.debug_tuple("State").field(s).finish(),
            Self::KeyframeRequested => f.write_str("KeyframeRequested"),
            Self::ControlChannelOpened(c) => f
                .debug_tuple("ControlChannelOpened")
                .field(&c.label())
                .finish(),
            Self::ControlChannelClosed => f.write_str("ControlChannelClosed"),
        }
    }
}

/// Receivers handed out once per transport.
pub struct TransportHandles {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Text messages from the control channel, in arrival order.
    pub control_messages: mpsc::UnboundedReceiver<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub rtt_ms: Option<f64>,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub available_outgoing_kbps: Option<f64>,
}

/// Encoded media samples written to an outgoing track.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()>;
}

#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_video_track(&self) -> Result<Arc<dyn MediaSink>>;
    async fn add_audio_track(&self) -> Result<Arc<dyn MediaSink>>;
    async fn create_control_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>>;

    /// Create an offer and apply it as the local description. Starts ICE
    /// gathering.
    async fn create_offer(&self) -> Result<()>;
    /// Create an answer to the applied remote offer and apply it locally.
    async fn create_answer(&self) -> Result<()>;
    async fn set_remote_offer(&self, sdp: &str) -> Result<()>;
    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    /// Resolves when ICE gathering for the current local description is
    /// complete.
    async fn gathering_complete(&self);
    /// Local SDP including whatever candidates have been gathered so far.
    async fn local_description(&self) -> Result<String>;

    async fn stats(&self) -> Result<TransportStats>;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportHandles)>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory transport for manager tests.

    use super::*;
    use crate::error::StreamError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    pub struct RecordingSink {
        pub samples: Mutex<Vec<(usize, Duration)>>,
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
            self.samples.lock().unwrap().push((data.len(), duration));
            Ok(())
        }
    }

    impl RecordingSink {
        pub fn count(&self) -> usize {
            self.samples.lock().unwrap().len()
        }
    }

    pub struct FakeChannel {
        pub label: String,
        pub open: AtomicBool,
        /// The remote side hangs up while the next send is in flight.
        pub close_on_send: AtomicBool,
        pub sent: Mutex<Vec<String>>,
    }

    impl FakeChannel {
        pub fn new(label: &str) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                open: AtomicBool::new(true),
                close_on_send: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ControlChannel for FakeChannel {
        fn label(&self) -> String {
            self.label.clone()
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            if self.close_on_send.load(Ordering::SeqCst) {
                self.open.store(false, Ordering::SeqCst);
            }
            if !self.is_open() {
                return Err(StreamError::transport("channel closed"));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    /// Transport whose ICE gathering completes only when told to. Applying
    /// a remote answer connects right away.
    pub struct FakeTransport {
        pub gathered: Notify,
        pub gathering_done: AtomicBool,
        pub closed: AtomicBool,
        pub video: Arc<RecordingSink>,
        pub audio: Arc<RecordingSink>,
        pub channel: Mutex<Option<Arc<FakeChannel>>>,
        pub local: Mutex<Option<String>>,
        pub remote: Mutex<Option<String>>,
        pub stats: Mutex<TransportStats>,
        pub stats_calls: AtomicUsize,
        pub events: mpsc::UnboundedSender<TransportEvent>,
        pub messages: mpsc::UnboundedSender<String>,
    }

    impl FakeTransport {
        pub fn complete_gathering(&self) {
            self.gathering_done.store(true, Ordering::SeqCst);
            self.gathered.notify_waiters();
        }

        pub fn emit(&self, event: TransportEvent) {
            let _ = self.events.send(event);
        }

        pub fn deliver(&self, text: &str) {
            let _ = self.messages.send(text.to_string());
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn add_video_track(&self) -> Result<Arc<dyn MediaSink>> {
            Ok(self.video.clone())
        }

        async fn add_audio_track(&self) -> Result<Arc<dyn MediaSink>> {
            Ok(self.audio.clone())
        }

        async fn create_control_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>> {
            let channel = FakeChannel::new(label);
            *self.channel.lock().unwrap() = Some(channel.clone());
            Ok(channel)
        }

        async fn create_offer(&self) -> Result<()> {
            *self.local.lock().unwrap() = Some("v=0 offer".into());
            Ok(())
        }

        async fn create_answer(&self) -> Result<()> {
            if self.remote.lock().unwrap().is_none() {
                return Err(StreamError::transport("no remote offer"));
            }
            *self.local.lock().unwrap() = Some("v=0 answer".into());
            Ok(())
        }

        async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
            if sdp.is_empty() {
                return Err(StreamError::transport("empty sdp"));
            }
            *self.remote.lock().unwrap() = Some(sdp.to_string());
            Ok(())
        }

        async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
            self.set_remote_offer(sdp).await?;
            self.emit(TransportEvent::State(TransportState::Connecting));
            self.emit(TransportEvent::State(TransportState::Connected));
            Ok(())
        }

        async fn gathering_complete(&self) {
            let notified = self.gathered.notified();
            if self.gathering_done.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }

        async fn local_description(&self) -> Result<String> {
            let local = self.local.lock().unwrap().clone();
            let suffix = if self.gathering_done.load(Ordering::SeqCst) {
                " candidates=complete"
            } else {
                " candidates=partial"
            };
            local
                .map(|sdp| sdp + suffix)
                .ok_or_else(|| StreamError::transport("no local description"))
        }

        async fn stats(&self) -> Result<TransportStats> {
            self.stats_calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.stats.lock().unwrap())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out fake transports and keeps them for inspection.
    #[derive(Default)]
    pub struct FakeTransportFactory {
        pub created: Mutex<Vec<Arc<FakeTransport>>>,
        pub gather_immediately: bool,
    }

    impl FakeTransportFactory {
        pub fn last(&self) -> Arc<FakeTransport> {
            self.created.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl TransportFactory for FakeTransportFactory {
        async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportHandles)> {
            let (events_tx, events) = mpsc::unbounded_channel();
            let (messages_tx, control_messages) = mpsc::unbounded_channel();
            let transport = Arc::new(FakeTransport {
                gathered: Notify::new(),
                gathering_done: AtomicBool::new(self.gather_immediately),
                closed: AtomicBool::new(false),
                video: Arc::new(RecordingSink::default()),
                audio: Arc::new(RecordingSink::default()),
                channel: Mutex::new(None),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                stats: Mutex::new(TransportStats::default()),
                stats_calls: AtomicUsize::new(0),
                events: events_tx,
                messages: messages_tx,
            });
            self.created.lock().unwrap().push(transport.clone());
            Ok((
                transport,
                TransportHandles {
                    events,
                    control_messages,
                },
            ))
        }
    }
}
