use crate::codec::{CodecConstraints, CodecSelector, VideoCodec};
use crate::error::{Result, StreamError};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderBackend {
    Nvenc,
    QuickSync,
    Amf,
    VaApi,
    VideoToolbox,
    Software,
}

impl EncoderBackend {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Self::Software)
    }

    /// Higher wins.
    pub fn priority(&self) -> u32 {
        match self {
            Self::Nvenc => 60,
            Self::QuickSync => 50,
            Self::Amf => 40,
            Self::VaApi => 30,
            Self::VideoToolbox => 20,
            Self::Software => 10,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Nvenc => "NVIDIA NVENC",
            Self::QuickSync => "Intel Quick Sync",
            Self::Amf => "AMD AMF",
            Self::VaApi => "VA-API",
            Self::VideoToolbox => "Apple VideoToolbox",
            Self::Software => "Software (x264)",
        }
    }
}

/// Encoder elements tried at startup, in preference order.
const CANDIDATES: [(EncoderBackend, &str, VideoCodec); 7] = [
    (EncoderBackend::Nvenc, "nvh264enc", VideoCodec::H264),
    (EncoderBackend::Nvenc, "nvh265enc", VideoCodec::H265),
    (EncoderBackend::QuickSync, "qsvh264enc", VideoCodec::H264),
    (EncoderBackend::Amf, "amfh264enc", VideoCodec::H264),
    (EncoderBackend::VaApi, "vah264enc", VideoCodec::H264),
    (EncoderBackend::VideoToolbox, "vtenc_h264", VideoCodec::H264),
    (EncoderBackend::Software, "x264enc", VideoCodec::H264),
];

/// Codecs the WebRTC media engine registers.
pub const NEGOTIABLE_CODECS: &[VideoCodec] = &[VideoCodec::H264];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderDescriptor {
    pub backend: EncoderBackend,
    pub element: &'static str,
    pub codec: VideoCodec,
    /// Element factory present in the plugin registry
    pub listed: bool,
    /// Listed and passed the smoke test
    pub available: bool,
    pub priority: u32,
    pub description: String,
}

impl EncoderDescriptor {
    pub fn candidate(backend: EncoderBackend, element: &'static str, codec: VideoCodec) -> Self {
        Self {
            backend,
            element,
            codec,
            listed: false,
            available: false,
            priority: backend.priority(),
            description: format!("{} {}", backend.display_name(), codec),
        }
    }
}

/// Capability query and smoke test for one encoder element.
///
/// Listing only says the plugin is installed. A hardware element can be
/// listed on a machine without the device, so availability is decided by
/// actually encoding a few frames.
pub trait EncoderCheck: Send + Sync {
    fn is_listed(&self, element: &str) -> bool;
    fn smoke_test(&self, element: &str) -> std::result::Result<(), String>;
}

struct RegistryState {
    descriptors: Vec<EncoderDescriptor>,
    selected: usize,
    software_codecs: Vec<VideoCodec>,
}

/// Detected video encoders with exactly one selected at any time.
pub struct HardwareEncoderRegistry {
    checker: Arc<dyn EncoderCheck>,
    state: RwLock<RegistryState>,
}

impl HardwareEncoderRegistry {
    /// Check every candidate and select the best available H.264 encoder.
    pub fn scan(checker: Arc<dyn EncoderCheck>) -> Self {
        let state = detect(checker.as_ref(), None);
        Self {
            checker,
            state: RwLock::new(state),
        }
    }

    /// Re-run detection. The current selection is kept if it is still
    /// available.
    pub fn rescan(&self) {
        let previous = self.selected().element;
        let state = detect(self.checker.as_ref(), Some(previous));
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn selected(&self) -> EncoderDescriptor {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.descriptors[state.selected].clone()
    }

    pub fn descriptors(&self) -> Vec<EncoderDescriptor> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .descriptors
            .clone()
    }

    /// Switch to `element`. The previous selection stays when the element is
    /// unknown, failed its smoke test, or encodes a codec the transport
    /// cannot negotiate.
    pub fn select_encoder(&self, element: &str) -> Result<EncoderDescriptor> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let index = state
            .descriptors
            .iter()
            .position(|d| {
                d.element == element && d.available && NEGOTIABLE_CODECS.contains(&d.codec)
            })
            .ok_or_else(|| StreamError::EncoderUnavailable(element.to_string()))?;
        state.selected = index;
        let desc = state.descriptors[index].clone();
        info!(encoder = desc.element, backend = ?desc.backend, "Encoder selected");
        Ok(desc)
    }

    /// Codecs with at least one working hardware encoder.
    pub fn hardware_codecs(&self) -> Vec<VideoCodec> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        hardware_codecs(&state.descriptors)
    }

    /// Codec ranking over everything this host can encode.
    pub fn codec_selector(&self) -> CodecSelector {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        selector(&state.descriptors, &state.software_codecs)
    }
}

fn hardware_codecs(descriptors: &[EncoderDescriptor]) -> Vec<VideoCodec> {
    let mut codecs: Vec<VideoCodec> = Vec::new();
    for desc in descriptors {
        if desc.available && desc.backend.is_hardware() && !codecs.contains(&desc.codec) {
            codecs.push(desc.codec);
        }
    }
    codecs
}

fn selector(descriptors: &[EncoderDescriptor], software_codecs: &[VideoCodec]) -> CodecSelector {
    let hardware = hardware_codecs(descriptors);
    let mut available = software_codecs.to_vec();
    for codec in &hardware {
        if !available.contains(codec) {
            available.push(*codec);
        }
    }
    CodecSelector::new(available, hardware)
}

fn detect(checker: &dyn EncoderCheck, keep: Option<&str>) -> RegistryState {
    let mut descriptors = Vec::with_capacity(CANDIDATES.len());
    for (backend, element, codec) in CANDIDATES {
        let mut desc = EncoderDescriptor::candidate(backend, element, codec);
        desc.listed = backend == EncoderBackend::Software || checker.is_listed(element);
        if desc.listed {
            match checker.smoke_test(element) {
                Ok(()) => {
                    desc.available = true;
                    debug!(encoder = element, "Encoder smoke test passed");
                }
                Err(e) => {
                    warn!(encoder = element, "Encoder smoke test failed: {e}");
                }
            }
        } else {
            debug!(encoder = element, "Encoder not installed");
        }
        descriptors.push(desc);
    }

    let software_codecs: Vec<VideoCodec> = [
        VideoCodec::Av1,
        VideoCodec::H265,
        VideoCodec::Vp9,
        VideoCodec::H264,
        VideoCodec::Vp8,
    ]
    .into_iter()
    .filter(|codec| {
        codec
            .software_elements()
            .iter()
            .any(|element| checker.is_listed(element))
    })
    .collect();

    let codec = selector(&descriptors, &software_codecs)
        .best_codec(CodecConstraints::default(), NEGOTIABLE_CODECS);
    let best = descriptors
        .iter()
        .enumerate()
        .filter(|(_, d)| d.available && d.codec == codec)
        .max_by_key(|(_, d)| d.priority)
        .map(|(i, _)| i);
    let kept = keep.and_then(|name| {
        descriptors
            .iter()
            .position(|d| d.element == name && d.available && NEGOTIABLE_CODECS.contains(&d.codec))
    });
    let selected = match kept.or(best) {
        Some(i) => i,
        None => {
            error!(%codec, "No working encoder found, video will fail to start");
            descriptors
                .iter()
                .position(|d| d.backend == EncoderBackend::Software)
                .unwrap_or(descriptors.len() - 1)
        }
    };

    let desc = &descriptors[selected];
    info!(
        encoder = desc.element,
        backend = desc.backend.display_name(),
        available = descriptors.iter().filter(|d| d.available).count(),
        "Encoder detection complete"
    );

    RegistryState {
        descriptors,
        selected,
        software_codecs,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Checks answering from fixed sets; `working` can change between scans.
    pub(crate) struct FakeChecks {
        pub listed: HashSet<&'static str>,
        pub working: Mutex<HashSet<&'static str>>,
    }

    impl FakeChecks {
        pub(crate) fn new(listed: &[&'static str], working: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                listed: listed.iter().copied().collect(),
                working: Mutex::new(working.iter().copied().collect()),
            })
        }
    }

    impl EncoderCheck for FakeChecks {
        fn is_listed(&self, element: &str) -> bool {
            self.listed.contains(element)
        }

        fn smoke_test(&self, element: &str) -> std::result::Result<(), String> {
            if self.working.lock().unwrap().contains(element) {
                Ok(())
            } else {
                Err("no device".into())
            }
        }
    }

    #[test]
    fn software_only_host() {
        let checker = FakeChecks::new(&["x264enc"], &["x264enc"]);
        let registry = HardwareEncoderRegistry::scan(checker);
        let selected = registry.selected();
        assert_eq!(selected.element, "x264enc");
        assert_eq!(selected.backend, EncoderBackend::Software);
        assert!(registry.hardware_codecs().is_empty());
    }

    #[test]
    fn listed_hardware_failing_smoke_test_is_unavailable() {
        let checker = FakeChecks::new(&["nvh264enc", "x264enc"], &["x264enc"]);
        let registry = HardwareEncoderRegistry::scan(checker);
        assert_eq!(registry.selected().element, "x264enc");
        let nv = registry
            .descriptors()
            .into_iter()
            .find(|d| d.element == "nvh264enc")
            .unwrap();
        assert!(nv.listed);
        assert!(!nv.available);
    }

    #[test]
    fn preference_order_picks_nvenc_over_vaapi() {
        let checker = FakeChecks::new(
            &["vah264enc", "nvh264enc", "x264enc"],
            &["vah264enc", "nvh264enc", "x264enc"],
        );
        let registry = HardwareEncoderRegistry::scan(checker);
        assert_eq!(registry.selected().element, "nvh264enc");
        assert_eq!(registry.hardware_codecs(), vec![VideoCodec::H264]);
    }

    #[test]
    fn h265_only_hardware_is_not_selected() {
        let checker = FakeChecks::new(&["nvh265enc", "x264enc"], &["nvh265enc", "x264enc"]);
        let registry = HardwareEncoderRegistry::scan(checker);
        assert_eq!(registry.selected().element, "x264enc");
        assert_eq!(registry.hardware_codecs(), vec![VideoCodec::H265]);
    }

    #[test]
    fn select_rejects_codec_the_transport_cannot_carry() {
        let checker = FakeChecks::new(&["nvh265enc", "x264enc"], &["nvh265enc", "x264enc"]);
        let registry = HardwareEncoderRegistry::scan(checker);
        assert_eq!(registry.selected().element, "x264enc");

        let err = registry.select_encoder("nvh265enc").unwrap_err();
        assert!(matches!(err, StreamError::EncoderUnavailable(ref e) if e == "nvh265enc"));
        let selected = registry.selected();
        assert_eq!(selected.element, "x264enc");
        assert_eq!(selected.codec, VideoCodec::H264);
    }

    #[test]
    fn exactly_one_selected_even_when_nothing_works() {
        let checker = FakeChecks::new(&[], &[]);
        let registry = HardwareEncoderRegistry::scan(checker);
        let selected = registry.selected();
        assert_eq!(selected.element, "x264enc");
        assert!(!selected.available);
    }

    #[test]
    fn select_unavailable_keeps_previous() {
        let checker = FakeChecks::new(&["vah264enc", "x264enc"], &["vah264enc", "x264enc"]);
        let registry = HardwareEncoderRegistry::scan(checker);
        assert_eq!(registry.selected().element, "vah264enc");

        let err = registry.select_encoder("nvh264enc").unwrap_err();
        assert!(matches!(err, StreamError::EncoderUnavailable(ref e) if e == "nvh264enc"));
        assert_eq!(registry.selected().element, "vah264enc");

        assert!(registry.select_encoder("bogus").is_err());
        assert_eq!(registry.select_encoder("x264enc").unwrap().element, "x264enc");
        assert_eq!(registry.selected().element, "x264enc");
    }

    #[test]
    fn rescan_refreshes_availability() {
        let checker = FakeChecks::new(&["qsvh264enc", "x264enc"], &["x264enc"]);
        let registry = HardwareEncoderRegistry::scan(checker.clone());
        assert_eq!(registry.selected().element, "x264enc");

        checker.working.lock().unwrap().insert("qsvh264enc");
        registry.rescan();
        // Previous selection still works, so it is kept.
        assert_eq!(registry.selected().element, "x264enc");
        assert!(registry.select_encoder("qsvh264enc").is_ok());

        checker.working.lock().unwrap().remove("qsvh264enc");
        registry.rescan();
        assert_eq!(registry.selected().element, "x264enc");
    }

    #[test]
    fn codec_selector_reflects_installed_encoders() {
        let checker = FakeChecks::new(
            &["x264enc", "vp8enc", "nvh265enc"],
            &["x264enc", "nvh265enc"],
        );
        let registry = HardwareEncoderRegistry::scan(checker);
        let ranked = registry
            .codec_selector()
            .rank(crate::codec::CodecConstraints::default());
        assert_eq!(ranked[0].profile.codec, VideoCodec::H265);
        assert_eq!(ranked[0].score, 110);
        assert!(ranked.iter().any(|r| r.profile.codec == VideoCodec::Vp8));
        assert!(!ranked.iter().any(|r| r.profile.codec == VideoCodec::Av1));
    }
}
