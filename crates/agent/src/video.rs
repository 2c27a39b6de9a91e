use crate::bitrate::{QualityTier, TIERS, initial_tier};
use crate::capture::{CaptureSource, GrabberFactory, Rect, ScreenGrabber};
use crate::codec::EncoderParams;
use crate::convert::{FrameConverter, I420Frame, target_size};
use crate::encoder::{EncoderFactory, VideoEncoder};
use crate::error::StreamError;
use crate::pacer::{Pacer, frame_interval};
use crate::registry::HardwareEncoderRegistry;
use crate::transport::MediaSink;
use bytes::Bytes;
use lumen_protocol::StreamSettings;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 90 kHz RTP video clock.
pub const VIDEO_CLOCK_RATE: u64 = 90_000;
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);
const ENCODER_RETRY: Duration = Duration::from_secs(1);

/// Per-connection knobs shared between the producer and its controllers.
/// Read once per pull, so changes land between frames.
pub struct VideoControl {
    fps: AtomicU32,
    max_width: AtomicU32,
    quality: AtomicU32,
    tier: AtomicUsize,
    keyframe: AtomicBool,
}

impl VideoControl {
    pub fn new(settings: &StreamSettings) -> Self {
        let tier = TIERS
            .iter()
            .position(|t| t == initial_tier())
            .unwrap_or_default();
        Self {
            fps: AtomicU32::new(settings.fps),
            max_width: AtomicU32::new(settings.max_width),
            quality: AtomicU32::new(settings.quality),
            tier: AtomicUsize::new(tier),
            keyframe: AtomicBool::new(false),
        }
    }

    pub fn apply_settings(&self, settings: &StreamSettings) {
        self.fps.store(settings.fps, Ordering::Relaxed);
        self.max_width.store(settings.max_width, Ordering::Relaxed);
        self.quality.store(settings.quality, Ordering::Relaxed);
    }

    pub fn apply_tier(&self, tier: &QualityTier) {
        if let Some(index) = TIERS.iter().position(|t| t == tier) {
            self.tier.store(index, Ordering::Relaxed);
        }
    }

    pub fn tier(&self) -> &'static QualityTier {
        TIERS
            .get(self.tier.load(Ordering::Relaxed))
            .unwrap_or_else(initial_tier)
    }

    pub fn quality(&self) -> u32 {
        self.quality.load(Ordering::Relaxed)
    }

    /// min(user fps, tier fps)
    pub fn effective_fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed).min(self.tier().fps).max(1)
    }

    /// min(user max width, tier width, source width)
    pub fn effective_width(&self, source_width: u32) -> u32 {
        self.max_width
            .load(Ordering::Relaxed)
            .min(self.tier().width)
            .min(source_width)
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.tier().bitrate_kbps
    }

    pub fn request_keyframe(&self) {
        self.keyframe.store(true, Ordering::Relaxed);
    }

    fn take_keyframe_request(&self) -> bool {
        self.keyframe.swap(false, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: I420Frame,
    /// 90 kHz ticks
    pub pts: u64,
    pub duration: Duration,
    /// Repeated or synthesized because capture failed.
    pub substituted: bool,
}

struct GrabState {
    grabber: Option<Box<dyn ScreenGrabber>>,
    converter: FrameConverter,
}

/// Produces paced, converted frames from the shared capture source.
pub struct VideoTrackProducer {
    source: Arc<CaptureSource>,
    grabbers: Arc<dyn GrabberFactory>,
    control: Arc<VideoControl>,
    state: Option<GrabState>,
    reopen_at: Option<Instant>,
    pts: u64,
    /// Last good frame and the region it was grabbed from
    last_frame: Option<(Rect, I420Frame)>,
    failures: u64,
}

impl VideoTrackProducer {
    pub fn new(
        source: Arc<CaptureSource>,
        grabbers: Arc<dyn GrabberFactory>,
        control: Arc<VideoControl>,
    ) -> Self {
        Self {
            source,
            grabbers,
            control,
            state: Some(GrabState {
                grabber: None,
                converter: FrameConverter::new(),
            }),
            reopen_at: None,
            pts: 0,
            last_frame: None,
            failures: 0,
        }
    }

    pub fn control(&self) -> &Arc<VideoControl> {
        &self.control
    }

    /// Grab and convert the next frame. Never fails: capture errors yield
    /// the previous frame, or black before the first success and right
    /// after a monitor switch.
    pub async fn next_frame(&mut self) -> VideoFrame {
        let monitor = self.source.active();
        let region = monitor.rect;
        let max_width = self.control.effective_width(region.width);
        let fps = self.control.effective_fps();

        let result = self.grab(region, max_width).await;
        let (image, substituted) = match result {
            Ok(image) => {
                if self.failures > 0 {
                    info!(failures = self.failures, "Screen capture recovered");
                    self.failures = 0;
                }
                self.last_frame = Some((region, image.clone()));
                (image, false)
            }
            Err(e) => {
                self.failures += 1;
                if self.failures <= 3 || self.failures.is_multiple_of(100) {
                    warn!(failures = self.failures, "Screen capture failed: {e}");
                }
                let image = match &self.last_frame {
                    Some((from, last)) if *from == region => last.clone(),
                    _ => {
                        let (w, h) = target_size(region.width, region.height, max_width);
                        I420Frame::black(w, h)
                    }
                };
                (image, true)
            }
        };

        let frame = VideoFrame {
            image,
            pts: self.pts,
            duration: frame_interval(fps),
            substituted,
        };
        self.pts += VIDEO_CLOCK_RATE / fps as u64;
        frame
    }

    async fn grab(
        &mut self,
        region: Rect,
        max_width: u32,
    ) -> Result<I420Frame, StreamError> {
        let mut state = self.state.take().unwrap_or_else(|| GrabState {
            grabber: None,
            converter: FrameConverter::new(),
        });
        if state.grabber.is_none() && self.reopen_at.is_some_and(|at| Instant::now() < at) {
            self.state = Some(state);
            return Err(StreamError::DeviceUnavailable("waiting to reopen".into()));
        }

        let grabbers = Arc::clone(&self.grabbers);
        let joined = tokio::task::spawn_blocking(move || {
            let result = grab_blocking(&mut state, grabbers.as_ref(), region, max_width);
            (state, result)
        })
        .await;

        match joined {
            Ok((state, result)) => {
                if let Err(StreamError::DeviceUnavailable(_)) = &result {
                    self.reopen_at = Some(Instant::now() + REOPEN_BACKOFF);
                }
                self.state = Some(state);
                result
            }
            Err(e) => Err(StreamError::CaptureTransient(format!("capture task: {e}"))),
        }
    }
}

fn grab_blocking(
    state: &mut GrabState,
    grabbers: &dyn GrabberFactory,
    region: Rect,
    max_width: u32,
) -> Result<I420Frame, StreamError> {
    if state.grabber.is_none() {
        state.grabber = Some(grabbers.open()?);
    }
    let Some(grabber) = state.grabber.as_mut() else {
        return Err(StreamError::DeviceUnavailable("no grabber".into()));
    };
    let captured = match grabber.grab(region) {
        Ok(frame) => frame,
        Err(e @ StreamError::DeviceUnavailable(_)) => {
            state.grabber = None;
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    state
        .converter
        .convert(&captured, max_width)
        .map_err(|e| StreamError::CaptureTransient(format!("{e:#}")))
}

/// Where the video pump gets its encoders from.
pub struct EncoderSource {
    pub registry: Arc<HardwareEncoderRegistry>,
    pub factory: Arc<dyn EncoderFactory>,
}

impl EncoderSource {
    fn params(&self, control: &VideoControl, width: u32, height: u32) -> EncoderParams {
        let descriptor = self.registry.selected();
        self.registry.codec_selector().params_for(
            &descriptor,
            control.tier(),
            control.quality(),
            width,
            height,
            control.effective_fps(),
        )
    }
}

struct ActiveEncoder {
    encoder: Box<dyn VideoEncoder>,
    width: u32,
    height: u32,
    bitrate_kbps: u32,
}

/// Pull, encode and write frames until cancelled. Frames are written only
/// once the first keyframe after start has been produced.
pub async fn run_video_pump(
    mut producer: VideoTrackProducer,
    encoders: EncoderSource,
    sink: Arc<dyn MediaSink>,
    cancel: CancellationToken,
) {
    let control = Arc::clone(producer.control());
    let mut pacer = Pacer::from_fps(control.effective_fps());
    let mut active: Option<ActiveEncoder> = None;
    let mut retry_at: Option<Instant> = None;
    let mut waiting_for_keyframe = true;
    let mut written: u64 = 0;
    let mut write_errors: u64 = 0;

    info!("Video pump started");
    loop {
        pacer.start();
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = producer.next_frame() => frame,
        };
        let (width, height) = (frame.image.width, frame.image.height);

        // Resolution change or a failed pipeline needs a new encoder.
        if active
            .as_ref()
            .is_some_and(|a| a.width != width || a.height != height || a.encoder.has_error())
        {
            debug!(width, height, "Recreating encoder");
            active = None;
        }
        if active.is_none() && retry_at.is_none_or(|at| Instant::now() >= at) {
            let params = encoders.params(&control, width, height);
            match encoders.factory.create(&params) {
                Ok(encoder) => {
                    active = Some(ActiveEncoder {
                        encoder,
                        width,
                        height,
                        bitrate_kbps: params.bitrate_kbps,
                    });
                    retry_at = None;
                    waiting_for_keyframe = true;
                    control.request_keyframe();
                }
                Err(e) => {
                    warn!(encoder = params.element, "Failed to create encoder: {e:#}");
                    retry_at = Some(Instant::now() + ENCODER_RETRY);
                }
            }
        }

        if let Some(a) = active.as_mut() {
            let bitrate = control.bitrate_kbps();
            if bitrate != a.bitrate_kbps {
                a.encoder.set_bitrate(bitrate);
                a.bitrate_kbps = bitrate;
            }
            if control.take_keyframe_request() {
                a.encoder.force_keyframe();
            }
            if let Err(e) = a.encoder.encode(&frame.image, frame.pts) {
                warn!("Encode failed: {e:#}");
                active = None;
            }
        }

        while let Some(a) = active.as_mut() {
            let data = match a.encoder.pull_encoded() {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    warn!("Encoder output lost: {e:#}");
                    active = None;
                    break;
                }
            };
            if waiting_for_keyframe {
                if !contains_idr(&data) {
                    continue;
                }
                debug!(size = data.len(), "First keyframe");
                waiting_for_keyframe = false;
            }
            match sink.write_sample(Bytes::from(data), frame.duration).await {
                Ok(()) => {
                    written += 1;
                    if written.is_multiple_of(300) {
                        debug!(written, "Video samples written");
                    }
                }
                Err(e) => {
                    write_errors += 1;
                    if write_errors <= 3 || write_errors.is_multiple_of(100) {
                        warn!(write_errors, "Write video sample: {e}");
                    }
                }
            }
        }

        pacer.set_interval(frame_interval(control.effective_fps()));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pacer.wait() => {}
        }
    }
    info!(written, "Video pump stopped");
}

/// True when an Annex B access unit carries an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if data[i + 3] & 0x1F == 5 {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}
