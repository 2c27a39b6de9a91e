//! `PeerTransport` on top of webrtc-rs.

use crate::error::{Result, StreamError};
use crate::transport::{
    CONTROL_LABEL, ControlChannel, MediaSink, PeerTransport, TransportEvent, TransportFactory,
    TransportHandles, TransportState, TransportStats,
};
use crate::video::VIDEO_CLOCK_RATE;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use lumen_protocol::config::IceConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const H264_BASELINE_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const H264_MAIN_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f";
const OPUS_CLOCK_RATE: u32 = 48000;
const STREAM_ID: &str = "lumen";

fn h264_feedback() -> Vec<RTCPFeedback> {
    [
        ("goog-remb", ""),
        ("ccm", "fir"),
        ("nack", ""),
        ("nack", "pli"),
        ("transport-cc", ""),
    ]
    .into_iter()
    .map(|(typ, parameter)| RTCPFeedback {
        typ: typ.into(),
        parameter: parameter.into(),
    })
    .collect()
}

/// Only H.264 and Opus are registered; offering VP8/VP9 lets browsers pick a
/// codec the agent never sends.
fn media_engine() -> anyhow::Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    // Constrained Baseline first; browsers always offer it and decode Main
    // profile streams under it. Main is registered for exact matches.
    for (fmtp, payload_type) in [(H264_BASELINE_FMTP, 125), (H264_MAIN_FMTP, 102)] {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE as u32,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_string(),
                    rtcp_feedback: h264_feedback(),
                },
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
    }

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    Ok(media_engine)
}

pub fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !config.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice: &IceConfig) -> anyhow::Result<Self> {
        let mut media_engine = media_engine().context("Failed to register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("Failed to register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let ice_servers = ice_servers(ice);
        info!(servers = ice_servers.len(), "WebRTC transport factory ready");
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportHandles)> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(StreamError::transport)?,
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let (messages_tx, control_messages) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let mapped = match state {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    TransportState::New
                }
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
            };
            debug!(?state, "Peer connection state changed");
            let _ = tx.send(TransportEvent::State(mapped));
            Box::pin(async {})
        }));

        // Answerer path: the viewer opens the control channel.
        let tx = events_tx.clone();
        let messages = messages_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let messages = messages.clone();
            Box::pin(async move {
                if dc.label() != CONTROL_LABEL {
                    warn!(label = dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                attach_channel_handlers(&dc, tx.clone(), messages, false);
                let _ = tx.send(TransportEvent::ControlChannelOpened(Arc::new(RtcChannel {
                    dc,
                })));
            })
        }));

        let transport = Arc::new(RtcTransport {
            pc,
            gather: Mutex::new(None),
            events: events_tx,
            messages: messages_tx,
        });
        Ok((
            transport,
            TransportHandles {
                events,
                control_messages,
            },
        ))
    }
}

fn attach_channel_handlers(
    dc: &Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<TransportEvent>,
    messages: mpsc::UnboundedSender<String>,
    announce_open: bool,
) {
    if announce_open {
        let tx = events.clone();
        let opened = Arc::clone(dc);
        dc.on_open(Box::new(move || {
            let _ = tx.send(TransportEvent::ControlChannelOpened(Arc::new(RtcChannel {
                dc: opened,
            })));
            Box::pin(async {})
        }));
    }

    let tx = events;
    dc.on_close(Box::new(move || {
        let _ = tx.send(TransportEvent::ControlChannelClosed);
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        let _ = messages.send(text);
        Box::pin(async {})
    }));
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Completion signal for the current local description's gathering.
    gather: Mutex<Option<mpsc::Receiver<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    messages: mpsc::UnboundedSender<String>,
}

impl RtcTransport {
    async fn add_track(
        &self,
        capability: RTCRtpCodecCapability,
        id: &str,
        watch_rtcp: bool,
    ) -> Result<Arc<dyn MediaSink>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.to_string(),
            STREAM_ID.to_string(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(StreamError::transport)?;

        // The RTCP loop must run even for audio or the interceptors stall.
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                if !watch_rtcp {
                    continue;
                }
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        debug!("PLI/FIR keyframe request from viewer");
                        let _ = events.send(TransportEvent::KeyframeRequested);
                    }
                }
            }
        });

        Ok(Arc::new(TrackSink { track }))
    }

    /// Arms the gathering signal, then applies the description.
    async fn set_local(&self, desc: RTCSessionDescription) -> Result<()> {
        let promise = self.pc.gathering_complete_promise().await;
        *self.gather.lock().await = Some(promise);
        self.pc
            .set_local_description(desc)
            .await
            .map_err(StreamError::transport)
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_video_track(&self) -> Result<Arc<dyn MediaSink>> {
        self.add_track(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: VIDEO_CLOCK_RATE as u32,
                sdp_fmtp_line: H264_BASELINE_FMTP.to_string(),
                ..Default::default()
            },
            "video",
            true,
        )
        .await
    }

    async fn add_audio_track(&self) -> Result<Arc<dyn MediaSink>> {
        self.add_track(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio",
            false,
        )
        .await
    }

    async fn create_control_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(StreamError::transport)?;
        attach_channel_handlers(&dc, self.events.clone(), self.messages.clone(), true);
        Ok(Arc::new(RtcChannel { dc }))
    }

    async fn create_offer(&self) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(StreamError::transport)?;
        self.set_local(offer).await
    }

    async fn create_answer(&self) -> Result<()> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(StreamError::transport)?;
        self.set_local(answer).await
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(StreamError::transport)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(StreamError::transport)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).map_err(StreamError::transport)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(StreamError::transport)
    }

    async fn gathering_complete(&self) {
        // Holding the lock keeps the receiver across a timed-out wait.
        let mut gather = self.gather.lock().await;
        if let Some(rx) = gather.as_mut() {
            let _ = rx.recv().await;
        }
    }

    async fn local_description(&self) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| StreamError::transport("no local description"))
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(rtp) if rtp.kind == "video" => {
                    stats.packets_sent = rtp.packets_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) if remote.kind == "video" => {
                    stats.packets_lost = remote.packets_lost.max(0) as u64;
                    if let Some(rtt) = remote.round_trip_time {
                        stats.rtt_ms = Some(rtt * 1000.0);
                    }
                }
                StatsReportType::CandidatePair(pair)
                    if pair.nominated && pair.available_outgoing_bitrate > 0.0 =>
                {
                    stats.available_outgoing_kbps = Some(pair.available_outgoing_bitrate / 1000.0);
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {e}");
        }
    }
}

struct TrackSink {
    track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl MediaSink for TrackSink {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        self.track
            .write_sample(&webrtc::media::Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(StreamError::transport)
    }
}

struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ControlChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(StreamError::transport)
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("Data channel close failed: {e}");
        }
    }
}
