use crate::error::{Result, StreamError};
use crate::pacer::Pacer;
use crate::transport::MediaSink;
use anyhow::Context;
use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use libpulse_binding as pulse;
use libpulse_simple_binding::Simple;
use lumen_protocol::{AudioConfig, AudioUpdate};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const BLOCK_DURATION: Duration = Duration::from_millis(20);
const STOP_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_OPUS_PACKET: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    /// Frames per channel in one 20 ms block.
    pub fn frames_per_block(&self) -> usize {
        (self.sample_rate / 50) as usize
    }

    pub fn samples_per_block(&self) -> usize {
        self.frames_per_block() * self.channels as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// One 20 ms block of interleaved float samples in -1.0..=1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
}

impl AudioBlock {
    pub fn silence(format: AudioFormat) -> Self {
        Self {
            samples: vec![0.0; format.samples_per_block()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub name: String,
    pub description: String,
    pub loopback: bool,
}

/// Blocking capture device. Opened and read on the capture thread only.
pub trait AudioBackend {
    /// Fill `out` with one block. Blocks for roughly one block duration.
    fn read_block(&mut self, out: &mut [f32]) -> Result<()>;
}

pub trait AudioBackendFactory: Send + Sync {
    fn devices(&self) -> Vec<AudioDevice>;
    fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioBackend>>;
}

pub struct PulseBackendFactory {
    source: String,
}

impl PulseBackendFactory {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl AudioBackendFactory for PulseBackendFactory {
    fn devices(&self) -> Vec<AudioDevice> {
        vec![
            AudioDevice {
                name: self.source.clone(),
                description: "Configured capture source".into(),
                loopback: self.source.ends_with("MONITOR@") || self.source.ends_with(".monitor"),
            },
            AudioDevice {
                name: "@DEFAULT_SOURCE@".into(),
                description: "Default input".into(),
                loopback: false,
            },
        ]
    }

    fn open(&self, format: AudioFormat) -> Result<Box<dyn AudioBackend>> {
        Ok(Box::new(PulseBackend::open(&self.source, format)?))
    }
}

/// PulseAudio simple-API record stream.
pub struct PulseBackend {
    simple: Simple,
    pcm: Vec<u8>,
}

impl PulseBackend {
    pub fn open(source: &str, format: AudioFormat) -> Result<Self> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: format.channels as u8,
            rate: format.sample_rate,
        };
        let block_bytes = format.samples_per_block() * 2;
        // One block per fragment keeps capture latency at 20 ms.
        let buf_attr = pulse::def::BufferAttr {
            maxlength: u32::MAX,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: block_bytes as u32,
        };
        let simple = Simple::new(
            None,
            "lumen-agent",
            pulse::stream::Direction::Record,
            Some(source),
            "screen audio",
            &spec,
            None,
            Some(&buf_attr),
        )
        .map_err(|e| StreamError::DeviceUnavailable(format!("PulseAudio {source}: {e}")))?;

        info!(
            source,
            sample_rate = format.sample_rate,
            channels = format.channels,
            block_bytes,
            "Audio capture opened"
        );
        Ok(Self {
            simple,
            pcm: vec![0u8; block_bytes],
        })
    }
}

impl AudioBackend for PulseBackend {
    fn read_block(&mut self, out: &mut [f32]) -> Result<()> {
        self.pcm.resize(out.len() * 2, 0);
        self.simple
            .read(&mut self.pcm)
            .map_err(|e| StreamError::CaptureTransient(format!("PulseAudio read: {e}")))?;
        for (sample, chunk) in out.iter_mut().zip(self.pcm.chunks_exact(2)) {
            *sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0;
        }
        Ok(())
    }
}

/// Dedicated thread moving blocks from a backend into a bounded queue.
///
/// A full queue drops the newest block and counts it; the consumer never
/// blocks the capture thread.
pub struct AudioCaptureLoop {
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    done_rx: std_mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCaptureLoop {
    pub fn start(
        backends: Arc<dyn AudioBackendFactory>,
        format: AudioFormat,
        capacity: usize,
    ) -> anyhow::Result<(Self, mpsc::Receiver<AudioBlock>)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = std_mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn({
                let stop = Arc::clone(&stop);
                let dropped = Arc::clone(&dropped);
                move || {
                    capture_loop(backends.as_ref(), format, &tx, &stop, &dropped);
                    let _ = done_tx.send(());
                }
            })
            .context("Failed to spawn audio capture thread")?;

        Ok((
            Self {
                stop,
                dropped,
                done_rx,
                thread: Some(thread),
            },
            rx,
        ))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait up to one second for it to exit. Returns
    /// false when the thread had to be detached.
    pub fn stop(&mut self) -> bool {
        self.stop.store(true, Ordering::Relaxed);
        let Some(thread) = self.thread.take() else {
            return true;
        };
        match self.done_rx.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                debug!(dropped = self.dropped(), "Audio capture stopped");
                true
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!("Audio capture thread did not stop within 1s, detaching");
                false
            }
        }
    }
}

impl Drop for AudioCaptureLoop {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn capture_loop(
    backends: &dyn AudioBackendFactory,
    format: AudioFormat,
    tx: &mpsc::Sender<AudioBlock>,
    stop: &AtomicBool,
    dropped: &AtomicU64,
) {
    let mut backend = match backends.open(format) {
        Ok(backend) => backend,
        Err(e) => {
            warn!("No audio capture, streaming silence: {e}");
            return;
        }
    };
    let mut failures: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        let mut block = AudioBlock::silence(format);
        if let Err(e) = backend.read_block(&mut block.samples) {
            failures += 1;
            if failures <= 3 || failures.is_multiple_of(100) {
                warn!(failures, "Audio read failed: {e}");
            }
            std::thread::sleep(BLOCK_DURATION);
            continue;
        }
        match tx.try_send(block) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= 3 || n.is_multiple_of(100) {
                    debug!(dropped = n, "Audio queue full, dropping block");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

/// Mute and volume for one connection's audio track.
pub struct AudioControl {
    muted: AtomicBool,
    volume_bits: AtomicU32,
}

impl AudioControl {
    pub fn new(muted: bool, volume: f32) -> Self {
        Self {
            muted: AtomicBool::new(muted),
            volume_bits: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn apply(&self, update: &AudioUpdate) {
        if let Some(muted) = update.muted {
            self.muted.store(muted, Ordering::Relaxed);
        }
        if let Some(volume) = update.volume {
            self.volume_bits
                .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        }
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }
}

impl Default for AudioControl {
    fn default() -> Self {
        Self::new(false, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    pub pcm: Vec<i16>,
    /// Sample clock
    pub pts: u64,
    pub silent: bool,
}

/// Pull side of the capture queue.
pub struct AudioTrackProducer {
    queue: Option<mpsc::Receiver<AudioBlock>>,
    control: Arc<AudioControl>,
    format: AudioFormat,
    pts: u64,
    underruns: u64,
}

impl AudioTrackProducer {
    /// `queue` is `None` when no capture backend could be started.
    pub fn new(
        queue: Option<mpsc::Receiver<AudioBlock>>,
        control: Arc<AudioControl>,
        format: AudioFormat,
    ) -> Self {
        Self {
            queue,
            control,
            format,
            pts: 0,
            underruns: 0,
        }
    }

    /// Next block, or silence of the same shape when nothing is queued.
    pub fn next_packet(&mut self) -> AudioPacket {
        let block = self.queue.as_mut().and_then(|q| q.try_recv().ok());
        let silent = block.is_none();
        if silent && self.queue.is_some() {
            self.underruns += 1;
        }
        let block = block.unwrap_or_else(|| AudioBlock::silence(self.format));

        let gain = if self.control.muted() {
            0.0
        } else {
            self.control.volume()
        };
        let pcm = block
            .samples
            .iter()
            .map(|s| ((s * gain) * 32767.0).clamp(-32768.0, 32767.0) as i16)
            .collect();

        let packet = AudioPacket {
            pcm,
            pts: self.pts,
            silent,
        };
        self.pts += self.format.frames_per_block() as u64;
        packet
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

pub trait AudioEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> anyhow::Result<Vec<u8>>;
}

pub struct OpusAudioEncoder {
    encoder: OpusEncoder,
    out: Vec<u8>,
}

impl OpusAudioEncoder {
    pub fn new(format: AudioFormat, bitrate_kbps: u32) -> anyhow::Result<Self> {
        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => anyhow::bail!("Unsupported channel count: {n}"),
        };
        let sample_rate = match format.sample_rate {
            48000 => SampleRate::Hz48000,
            24000 => SampleRate::Hz24000,
            16000 => SampleRate::Hz16000,
            12000 => SampleRate::Hz12000,
            8000 => SampleRate::Hz8000,
            n => anyhow::bail!("Unsupported sample rate for Opus: {n}"),
        };
        let mut encoder = OpusEncoder::new(sample_rate, channels, Application::LowDelay)
            .map_err(|e| anyhow::anyhow!("Failed to create Opus encoder: {e:?}"))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate_kbps as i32 * 1000))
            .map_err(|e| anyhow::anyhow!("Failed to set Opus bitrate: {e:?}"))?;
        Ok(Self {
            encoder,
            out: vec![0u8; MAX_OPUS_PACKET],
        })
    }
}

impl AudioEncoder for OpusAudioEncoder {
    fn encode(&mut self, pcm: &[i16]) -> anyhow::Result<Vec<u8>> {
        let len = self
            .encoder
            .encode(pcm, &mut self.out)
            .map_err(|e| anyhow::anyhow!("Opus encode failed: {e:?}"))?;
        Ok(self.out[..len].to_vec())
    }
}

pub trait AudioEncoderFactory: Send + Sync {
    fn create(&self, format: AudioFormat) -> anyhow::Result<Box<dyn AudioEncoder>>;
}

pub struct OpusEncoderFactory {
    pub bitrate_kbps: u32,
}

impl AudioEncoderFactory for OpusEncoderFactory {
    fn create(&self, format: AudioFormat) -> anyhow::Result<Box<dyn AudioEncoder>> {
        Ok(Box::new(OpusAudioEncoder::new(format, self.bitrate_kbps)?))
    }
}

/// Everything one audio track owns; dropped when the connection closes.
pub struct AudioTrack {
    pub producer: AudioTrackProducer,
    pub capture: Option<AudioCaptureLoop>,
}

impl AudioTrack {
    /// Capture failure degrades to a silent track.
    pub fn start(
        backends: Arc<dyn AudioBackendFactory>,
        config: &AudioConfig,
        control: Arc<AudioControl>,
    ) -> Self {
        let format = AudioFormat::from_config(config);
        match AudioCaptureLoop::start(backends, format, config.queue_capacity) {
            Ok((capture, queue)) => Self {
                producer: AudioTrackProducer::new(Some(queue), control, format),
                capture: Some(capture),
            },
            Err(e) => {
                warn!("Audio capture unavailable, track will be silent: {e:#}");
                Self {
                    producer: AudioTrackProducer::new(None, control, format),
                    capture: None,
                }
            }
        }
    }
}

/// Encode and write one block every 20 ms until cancelled, then stop the
/// capture thread.
pub async fn run_audio_pump(
    track: AudioTrack,
    mut encoder: Box<dyn AudioEncoder>,
    sink: Arc<dyn MediaSink>,
    cancel: CancellationToken,
) {
    let AudioTrack {
        mut producer,
        capture,
    } = track;
    let mut pacer = Pacer::new(BLOCK_DURATION);
    let mut errors: u64 = 0;
    loop {
        pacer.start();
        let packet = producer.next_packet();
        match encoder.encode(&packet.pcm) {
            Ok(data) => {
                if let Err(e) = sink.write_sample(Bytes::from(data), BLOCK_DURATION).await {
                    errors += 1;
                    if errors <= 3 || errors.is_multiple_of(100) {
                        debug!(errors, "Write audio sample: {e}");
                    }
                }
            }
            Err(e) => {
                errors += 1;
                if errors <= 3 || errors.is_multiple_of(100) {
                    warn!(errors, "Audio encode: {e:#}");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pacer.wait() => {}
        }
    }

    if let Some(mut capture) = capture {
        let _ = tokio::task::spawn_blocking(move || capture.stop()).await;
    }
    info!(underruns = producer.underruns(), "Audio pump stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::fake::RecordingSink;
    use std::sync::Mutex;

    /// Produces blocks filled with `level` as fast as asked, or blocks
    /// forever when `hang` is set.
    pub(crate) struct FakeBackend {
        level: f32,
        delay: Duration,
        hang: bool,
    }

    impl AudioBackend for FakeBackend {
        fn read_block(&mut self, out: &mut [f32]) -> Result<()> {
            if self.hang {
                std::thread::sleep(Duration::from_secs(5));
            }
            std::thread::sleep(self.delay);
            out.fill(self.level);
            Ok(())
        }
    }

    pub(crate) struct FakeBackendFactory {
        pub level: f32,
        pub delay: Duration,
        pub hang: bool,
        pub available: bool,
    }

    impl Default for FakeBackendFactory {
        fn default() -> Self {
            Self {
                level: 0.5,
                delay: Duration::from_millis(1),
                hang: false,
                available: true,
            }
        }
    }

    impl AudioBackendFactory for FakeBackendFactory {
        fn devices(&self) -> Vec<AudioDevice> {
            vec![]
        }

        fn open(&self, _format: AudioFormat) -> Result<Box<dyn AudioBackend>> {
            if !self.available {
                return Err(StreamError::DeviceUnavailable("no sound card".into()));
            }
            Ok(Box::new(FakeBackend {
                level: self.level,
                delay: self.delay,
                hang: self.hang,
            }))
        }
    }

    #[test]
    fn block_shape_at_48k_stereo() {
        let format = AudioFormat::default();
        assert_eq!(format.frames_per_block(), 960);
        assert_eq!(format.samples_per_block(), 1920);
    }

    #[test]
    fn full_queue_drops_newest_and_counts() {
        let factory = Arc::new(FakeBackendFactory::default());
        let (mut capture, mut rx) =
            AudioCaptureLoop::start(factory, AudioFormat::default(), 4).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(capture.stop());
        assert!(capture.dropped() > 0);

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    #[test]
    fn stop_detaches_a_hung_thread() {
        let factory = Arc::new(FakeBackendFactory {
            hang: true,
            ..Default::default()
        });
        let (mut capture, _rx) =
            AudioCaptureLoop::start(factory, AudioFormat::default(), 4).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let started = std::time::Instant::now();
        assert!(!capture.stop());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn empty_queue_yields_silence_of_same_shape() {
        let (_tx, rx) = mpsc::channel(4);
        let mut producer = AudioTrackProducer::new(
            Some(rx),
            Arc::new(AudioControl::default()),
            AudioFormat::default(),
        );
        let packet = producer.next_packet();
        assert!(packet.silent);
        assert_eq!(packet.pcm.len(), 1920);
        assert!(packet.pcm.iter().all(|&s| s == 0));
        assert_eq!(producer.underruns(), 1);
    }

    #[test]
    fn timestamps_advance_by_block_frames() {
        let mut producer =
            AudioTrackProducer::new(None, Arc::new(AudioControl::default()), AudioFormat::default());
        let pts: Vec<u64> = (0..4).map(|_| producer.next_packet().pts).collect();
        assert_eq!(pts, vec![0, 960, 1920, 2880]);
    }

    #[test]
    fn mute_volume_and_clamping() {
        let format = AudioFormat {
            sample_rate: 8000,
            channels: 1,
        };
        let (tx, rx) = mpsc::channel(8);
        let control = Arc::new(AudioControl::default());
        let mut producer = AudioTrackProducer::new(Some(rx), control.clone(), format);

        let block = |v: f32| AudioBlock {
            samples: vec![v; format.samples_per_block()],
        };
        tx.try_send(block(0.5)).unwrap();
        assert_eq!(producer.next_packet().pcm[0], 16383);

        control.apply(&AudioUpdate {
            muted: None,
            volume: Some(0.5),
        });
        tx.try_send(block(0.5)).unwrap();
        assert_eq!(producer.next_packet().pcm[0], 8191);

        control.apply(&AudioUpdate {
            muted: Some(true),
            volume: None,
        });
        tx.try_send(block(0.5)).unwrap();
        assert_eq!(producer.next_packet().pcm[0], 0);

        control.apply(&AudioUpdate {
            muted: Some(false),
            volume: Some(7.0),
        });
        assert_eq!(control.volume(), 1.0);
        tx.try_send(block(3.0)).unwrap();
        tx.try_send(block(-3.0)).unwrap();
        assert_eq!(producer.next_packet().pcm[0], i16::MAX);
        assert_eq!(producer.next_packet().pcm[0], i16::MIN);
    }

    #[test]
    fn missing_backend_streams_silence() {
        let factory = Arc::new(FakeBackendFactory {
            available: false,
            ..Default::default()
        });
        let mut track = AudioTrack::start(
            factory,
            &AudioConfig::default(),
            Arc::new(AudioControl::default()),
        );
        std::thread::sleep(Duration::from_millis(20));
        let packet = track.producer.next_packet();
        assert!(packet.silent);
        assert_eq!(packet.pcm.len(), 1920);
        assert!(track.capture.as_mut().unwrap().stop());
    }

    pub(crate) struct FakeAudioEncoder {
        pub encoded: Arc<Mutex<u64>>,
    }

    impl AudioEncoder for FakeAudioEncoder {
        fn encode(&mut self, pcm: &[i16]) -> anyhow::Result<Vec<u8>> {
            *self.encoded.lock().unwrap() += 1;
            Ok(vec![0xFC; pcm.len() / 100])
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeAudioEncoderFactory {
        pub encoded: Arc<Mutex<u64>>,
    }

    impl AudioEncoderFactory for FakeAudioEncoderFactory {
        fn create(&self, _format: AudioFormat) -> anyhow::Result<Box<dyn AudioEncoder>> {
            Ok(Box::new(FakeAudioEncoder {
                encoded: self.encoded.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn pump_writes_blocks_and_stops_capture() {
        let factory = Arc::new(FakeBackendFactory {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let track = AudioTrack::start(
            factory,
            &AudioConfig::default(),
            Arc::new(AudioControl::default()),
        );
        let sink = Arc::new(RecordingSink::default());
        let encoded = Arc::new(Mutex::new(0));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_audio_pump(
            track,
            Box::new(FakeAudioEncoder {
                encoded: encoded.clone(),
            }),
            sink.clone(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(sink.count() >= 3);
        assert!(sink
            .samples
            .lock()
            .unwrap()
            .iter()
            .all(|(_, d)| *d == BLOCK_DURATION));
    }
}
