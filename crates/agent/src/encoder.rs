use crate::codec::{EncoderParams, RateControl, SpeedKnob, VideoCodec};
use crate::convert::I420Frame;
use crate::error::StreamError;
use crate::registry::{EncoderBackend, EncoderCheck};
use anyhow::{Context, bail};
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;
use tracing::{debug, info, warn};

const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(2);
const SMOKE_TEST_FRAMES: u32 = 3;

/// Encodes I420 frames into H.264 access units.
pub trait VideoEncoder: Send {
    /// `pts` is on the 90 kHz media clock.
    fn encode(&mut self, frame: &I420Frame, pts: u64) -> anyhow::Result<()>;
    fn pull_encoded(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
    fn set_bitrate(&mut self, bitrate_kbps: u32);
    fn force_keyframe(&self);
    fn has_error(&self) -> bool;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self, params: &EncoderParams) -> anyhow::Result<Box<dyn VideoEncoder>>;
}

pub struct GstEncoderFactory;

impl EncoderFactory for GstEncoderFactory {
    fn create(&self, params: &EncoderParams) -> anyhow::Result<Box<dyn VideoEncoder>> {
        Ok(Box::new(GstEncoder::new(params)?))
    }
}

/// appsrc(I420) → videoconvert → encoder → h264parse → appsink
pub struct GstEncoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoded_rx: mpsc::Receiver<Vec<u8>>,
    _bus_watch: gst::bus::BusWatchGuard,
    backend: EncoderBackend,
    width: u32,
    height: u32,
    /// Set by the bus watch on pipeline error; the producer recreates the
    /// encoder when it sees this.
    pipeline_error: Arc<AtomicBool>,
}

fn pts_to_clock(pts_90k: u64) -> ClockTime {
    ClockTime::from_nseconds(pts_90k * 100_000 / 9)
}

impl GstEncoder {
    pub fn new(params: &EncoderParams) -> anyhow::Result<Self> {
        if params.codec != VideoCodec::H264 {
            return Err(StreamError::EncoderUnavailable(params.element.clone()).into());
        }
        info!(
            encoder = params.element,
            backend = ?params.backend,
            width = params.width,
            height = params.height,
            fps = params.fps,
            bitrate_kbps = params.bitrate_kbps,
            rate_control = ?params.rate_control,
            "Creating H.264 encoder pipeline"
        );

        let pipeline = gst::Pipeline::new();

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", params.width as i32)
            .field("height", params.height as i32)
            .field("framerate", gst::Fraction::new(params.fps as i32, 1))
            .build();
        let appsrc = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("Failed to create appsrc")?
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSrc"))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // push_buffer must never block the producer when a hardware encoder stalls
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);
        appsrc.set_property("min-latency", 0i64);
        appsrc.set_property("max-latency", 0i64);

        let convert = ElementFactory::make("videoconvert")
            .build()
            .context("Failed to create videoconvert")?;
        let encoder = build_encoder_element(params)?;

        // Inline SPS/PPS with every keyframe.
        let parser = ElementFactory::make("h264parse")
            .property_from_str("config-interval", "-1")
            .build()
            .context("Failed to create h264parse")?;
        // Annex B with complete access units for the sample writer.
        let parse_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_capsfilter = ElementFactory::make("capsfilter")
            .name("parse-caps")
            .property("caps", &parse_caps)
            .build()
            .context("Failed to create h264parse output capsfilter")?;

        let appsink = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 1u32)
            .property("drop", true)
            .build()
            .context("Failed to create appsink")?
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let _ = encoded_tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let mut chain: Vec<&gst::Element> = vec![appsrc.upcast_ref(), &convert, &encoder];
        // Software output is forced to the profile the SDP advertises.
        let profile_filter;
        if params.backend == EncoderBackend::Software {
            let profile_caps = gst::Caps::builder("video/x-h264")
                .field("profile", "constrained-baseline")
                .build();
            profile_filter = ElementFactory::make("capsfilter")
                .property("caps", &profile_caps)
                .build()
                .context("Failed to create profile capsfilter")?;
            chain.push(&profile_filter);
        }
        chain.extend([&parser, &parse_capsfilter, appsink.upcast_ref()]);

        pipeline
            .add_many(chain.iter().copied())
            .context("Failed to add elements to pipeline")?;
        gst::Element::link_many(chain.iter().copied()).context("Failed to link pipeline elements")?;

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let pipeline_error_flag = Arc::clone(&pipeline_error);
        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        let _bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        tracing::error!(
                            source = ?err.src().map(|s| s.name().to_string()),
                            error = %err.error(),
                            debug = ?err.debug(),
                            "GStreamer pipeline error"
                        );
                        pipeline_error_flag.store(true, Ordering::Relaxed);
                    }
                    MessageView::Warning(w) => {
                        tracing::warn!(
                            source = ?w.src().map(|s| s.name().to_string()),
                            warning = %w.error(),
                            "GStreamer pipeline warning"
                        );
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .context("Failed to add bus watch")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to Playing")?;

        Ok(Self {
            pipeline,
            appsrc,
            encoded_rx,
            _bus_watch,
            backend: params.backend,
            width: params.width,
            height: params.height,
            pipeline_error,
        })
    }
}

impl VideoEncoder for GstEncoder {
    fn encode(&mut self, frame: &I420Frame, pts: u64) -> anyhow::Result<()> {
        if frame.width != self.width || frame.height != self.height {
            bail!(
                "Frame size {}x{} does not match encoder {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }
        let mut buffer = gst::Buffer::from_slice(frame.data.clone());
        if let Some(buffer_mut) = buffer.get_mut() {
            buffer_mut.set_pts(pts_to_clock(pts));
        }
        self.appsrc
            .push_buffer(buffer)
            .context("Failed to push buffer to appsrc")?;
        Ok(())
    }

    fn pull_encoded(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        match self.encoded_rx.try_recv() {
            Ok(data) => Ok(Some(data)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => bail!("Encoder pipeline disconnected"),
        }
    }

    /// Runtime changes corrupt NVENC output, so NVENC keeps its initial rate.
    fn set_bitrate(&mut self, bitrate_kbps: u32) {
        if self.backend == EncoderBackend::Nvenc {
            debug!(bitrate_kbps, "NVENC bitrate is fixed at pipeline creation");
            return;
        }
        match self.pipeline.by_name("encoder") {
            Some(elem) => {
                elem.set_property("bitrate", bitrate_kbps);
                debug!(bitrate_kbps, "Bitrate updated");
            }
            None => warn!(bitrate_kbps, "No encoder element in pipeline, bitrate unchanged"),
        }
    }

    fn force_keyframe(&self) {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        self.appsrc.send_event(event);
        debug!("Forced IDR keyframe");
    }

    fn has_error(&self) -> bool {
        self.pipeline_error.load(Ordering::Relaxed)
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!("Encoder pipeline stopped");
    }
}

fn build_encoder_element(params: &EncoderParams) -> anyhow::Result<gst::Element> {
    let bitrate = params.bitrate_kbps;
    let keyframe_interval = params.fps.max(1) * 2;
    let builder = ElementFactory::make(&params.element).name("encoder");
    let builder = match params.backend {
        EncoderBackend::Nvenc => builder
            .property_from_str("preset", "low-latency-hq")
            .property_from_str("rc-mode", "cbr-ld-hq")
            .property("bitrate", bitrate)
            .property("gop-size", i32::MAX)
            .property("zerolatency", true)
            .property("rc-lookahead", 0u32)
            .property("bframes", 0u32)
            .property("strict-gop", true)
            .property("vbv-buffer-size", bitrate / params.fps.max(1)),
        EncoderBackend::QuickSync => builder
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate)
            .property("gop-size", keyframe_interval)
            .property("target-usage", target_usage(params.preset.speed)),
        EncoderBackend::Amf => builder
            .property_from_str("rate-control", "cbr")
            .property_from_str("usage", "ultra-low-latency")
            .property("bitrate", bitrate),
        EncoderBackend::VaApi => builder
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate)
            .property("target-usage", target_usage(params.preset.speed))
            .property("key-int-max", keyframe_interval),
        EncoderBackend::VideoToolbox => builder
            .property("bitrate", bitrate)
            .property("realtime", true)
            .property("allow-frame-reordering", false),
        EncoderBackend::Software => {
            let speed = match params.preset.speed {
                SpeedKnob::Named(name) => name,
                _ => "veryfast",
            };
            let builder = builder
                .property_from_str("tune", "zerolatency")
                .property_from_str("speed-preset", speed)
                .property("bitrate", bitrate)
                .property("key-int-max", keyframe_interval)
                .property("bframes", 0u32);
            match params.rate_control {
                // Constant quality, bitrate acts as the VBV cap.
                RateControl::Vbr => builder
                    .property_from_str("pass", "qual")
                    .property("quantizer", params.preset.crf),
                RateControl::Cbr => builder.property_from_str("pass", "cbr"),
            }
        }
    };
    builder
        .build()
        .with_context(|| format!("Failed to create {}", params.element))
}

/// Hardware target-usage, 1 (best quality) to 7 (fastest).
fn target_usage(speed: SpeedKnob) -> u32 {
    match speed {
        SpeedKnob::Named("veryfast" | "ultrafast" | "superfast") => 7,
        SpeedKnob::Named("slow" | "slower" | "veryslow") => 1,
        _ => 4,
    }
}

/// Capability query and smoke test against the local GStreamer registry.
pub struct GstEncoderCheck;

impl EncoderCheck for GstEncoderCheck {
    fn is_listed(&self, element: &str) -> bool {
        ElementFactory::find(element).is_some()
    }

    fn smoke_test(&self, element: &str) -> Result<(), String> {
        let description = format!(
            "videotestsrc num-buffers={SMOKE_TEST_FRAMES} \
             ! video/x-raw,format=I420,width=256,height=144,framerate=30/1 \
             ! videoconvert ! {element} ! fakesink"
        );
        let pipeline = gst::parse::launch(&description).map_err(|e| e.to_string())?;
        let bus = pipeline.bus().ok_or("pipeline has no bus")?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| format!("failed to start: {e}"))?;

        let msg = bus.timed_pop_filtered(
            ClockTime::from_nseconds(SMOKE_TEST_TIMEOUT.as_nanos() as u64),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        );
        let _ = pipeline.set_state(gst::State::Null);

        match msg.as_ref().map(|m| m.view()) {
            Some(gst::MessageView::Eos(_)) => Ok(()),
            Some(gst::MessageView::Error(err)) => Err(err.error().to_string()),
            _ => Err(format!(
                "no EOS within {} ms",
                SMOKE_TEST_TIMEOUT.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_converts_to_nanoseconds() {
        assert_eq!(pts_to_clock(90_000).nseconds(), 1_000_000_000);
        assert_eq!(pts_to_clock(3_000).nseconds(), 33_333_333);
    }

    #[test]
    fn target_usage_follows_preset() {
        assert_eq!(target_usage(SpeedKnob::Named("veryfast")), 7);
        assert_eq!(target_usage(SpeedKnob::Named("medium")), 4);
        assert_eq!(target_usage(SpeedKnob::Named("slow")), 1);
        assert_eq!(target_usage(SpeedKnob::Speed(8)), 4);
    }

    /// Colorimetry in the appsrc caps ends up in the SPS VUI, which some
    /// browser decoders reject.
    #[test]
    fn appsrc_caps_carry_no_colorimetry() {
        gst::init().unwrap();
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", 1920i32)
            .field("height", 1080i32)
            .field("framerate", gst::Fraction::new(60, 1))
            .build();
        assert!(!caps.to_string().contains("colorimetry"));
    }

    #[test]
    fn missing_element_is_not_listed() {
        gst::init().unwrap();
        assert!(!GstEncoderCheck.is_listed("definitely_not_an_encoder"));
        assert!(GstEncoderCheck.smoke_test("definitely_not_an_encoder").is_err());
    }
}
