use crate::error::{Result, StreamError};
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ImageFormat, Screen};
use x11rb::protocol::{randr, shm, xproto};
use x11rb::rust_connection::RustConnection;

const BYTES_PER_PIXEL: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    pub index: u32,
    pub name: String,
    pub rect: Rect,
    pub primary: bool,
    /// Spans every physical monitor
    pub is_virtual: bool,
}

impl Monitor {
    pub fn virtual_desktop(width: u32, height: u32) -> Self {
        Self {
            index: 0,
            name: "all".into(),
            rect: Rect {
                x: 0,
                y: 0,
                width,
                height,
            },
            primary: false,
            is_virtual: true,
        }
    }
}

/// Tightly packed BGRx pixels, alpha byte forced to 0xFF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Grabs rectangular regions of the screen. Blocking; called from the
/// blocking pool.
pub trait ScreenGrabber: Send {
    fn monitors(&mut self) -> Result<Vec<Monitor>>;
    fn grab(&mut self, region: Rect) -> Result<CapturedFrame>;
}

pub trait GrabberFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn ScreenGrabber>>;
}

/// The monitor every video producer captures from.
///
/// Selection is swapped atomically; producers pick up a new monitor on their
/// next pull. Concurrent selections resolve last writer wins.
pub struct CaptureSource {
    monitors: ArcSwap<Vec<Monitor>>,
    active: ArcSwap<Monitor>,
}

impl CaptureSource {
    /// `monitors` must start with the virtual desktop at index 0.
    pub fn new(monitors: Vec<Monitor>, initial: u32) -> Self {
        let monitors = if monitors.is_empty() {
            vec![Monitor::virtual_desktop(0, 0)]
        } else {
            monitors
        };
        let active = monitors
            .iter()
            .find(|m| m.index == initial)
            .unwrap_or(&monitors[0])
            .clone();
        Self {
            monitors: ArcSwap::from_pointee(monitors),
            active: ArcSwap::from_pointee(active),
        }
    }

    pub fn active(&self) -> Arc<Monitor> {
        self.active.load_full()
    }

    pub fn monitors(&self) -> Arc<Vec<Monitor>> {
        self.monitors.load_full()
    }

    pub fn select(&self, index: u32) -> Result<Arc<Monitor>> {
        let monitors = self.monitors.load();
        let monitor = monitors
            .iter()
            .find(|m| m.index == index)
            .ok_or_else(|| {
                StreamError::invalid_state(
                    "select_monitor",
                    format!("monitor {index} does not exist ({} known)", monitors.len()),
                )
            })?;
        let monitor = Arc::new(monitor.clone());
        self.active.store(Arc::clone(&monitor));
        info!(
            index,
            width = monitor.rect.width,
            height = monitor.rect.height,
            "Capture monitor selected"
        );
        Ok(monitor)
    }

    /// Replace the monitor list after a layout change. The active selection
    /// is re-resolved by index, falling back to the virtual desktop.
    pub fn refresh(&self, monitors: Vec<Monitor>) {
        if monitors.is_empty() {
            return;
        }
        let current = self.active().index;
        let active = monitors
            .iter()
            .find(|m| m.index == current)
            .unwrap_or(&monitors[0])
            .clone();
        self.monitors.store(Arc::new(monitors));
        self.active.store(Arc::new(active));
    }
}

pub struct X11GrabberFactory {
    display: String,
}

impl X11GrabberFactory {
    pub fn new(display: impl Into<String>) -> Self {
        Self {
            display: display.into(),
        }
    }
}

impl GrabberFactory for X11GrabberFactory {
    fn open(&self) -> Result<Box<dyn ScreenGrabber>> {
        Ok(Box::new(X11Grabber::connect(&self.display)?))
    }
}

struct ShmSegment {
    seg: shm::Seg,
    ptr: *mut u8,
    size: usize,
}

/// MIT-SHM capture of the root window.
pub struct X11Grabber {
    conn: RustConnection,
    root: u32,
    width: u32,
    height: u32,
    segment: Option<ShmSegment>,
}

// SAFETY: The SHM pointer is only accessed through &mut self methods,
// so there is no concurrent access.
unsafe impl Send for X11Grabber {}

fn device(context: &str, err: impl std::fmt::Display) -> StreamError {
    StreamError::DeviceUnavailable(format!("{context}: {err}"))
}

fn transient(context: &str, err: impl std::fmt::Display) -> StreamError {
    StreamError::CaptureTransient(format!("{context}: {err}"))
}

impl X11Grabber {
    pub fn connect(display: &str) -> Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(Some(display)).map_err(|e| device("X11 connect", e))?;

        shm::query_version(&conn)
            .map_err(|e| device("SHM extension not available", e))?
            .reply()
            .map_err(|e| device("SHM query_version failed", e))?;

        let screen: &Screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let width = screen.width_in_pixels as u32;
        let height = screen.height_in_pixels as u32;
        let display_name = display;
        info!(width, height, depth = screen.root_depth, display = display_name, "Connected to X display");

        let mut grabber = Self {
            conn,
            root,
            width,
            height,
            segment: None,
        };
        grabber.ensure_segment((width * height * BYTES_PER_PIXEL) as usize)?;
        Ok(grabber)
    }

    fn ensure_segment(&mut self, size: usize) -> Result<()> {
        if self.segment.as_ref().is_some_and(|s| s.size >= size) {
            return Ok(());
        }
        self.release_segment();

        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            return Err(device("shmget", std::io::Error::last_os_error()));
        }
        let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if ptr == usize::MAX as *mut libc::c_void {
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
            return Err(device("shmat", std::io::Error::last_os_error()));
        }
        // Removed once every process detaches.
        unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };

        let seg = self
            .conn
            .generate_id()
            .map_err(|e| device("SHM seg id", e))?;
        shm::attach(&self.conn, seg, shm_id as u32, false)
            .map_err(|e| device("SHM attach request", e))?
            .check()
            .map_err(|e| device("SHM attach", e))?;
        debug!(seg, size, "SHM segment attached");

        self.segment = Some(ShmSegment {
            seg,
            ptr: ptr as *mut u8,
            size,
        });
        Ok(())
    }

    fn release_segment(&mut self) {
        if let Some(segment) = self.segment.take() {
            let _ = shm::detach(&self.conn, segment.seg);
            let _ = self.conn.flush();
            unsafe {
                libc::shmdt(segment.ptr as *const libc::c_void);
            }
            debug!("SHM segment detached");
        }
    }

    fn atom_name(&self, atom: u32) -> String {
        xproto::get_atom_name(&self.conn, atom)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .map(|reply| String::from_utf8_lossy(&reply.name).into_owned())
            .unwrap_or_default()
    }
}

impl ScreenGrabber for X11Grabber {
    /// Index 0 is the virtual desktop; physical monitors follow with the
    /// primary monitor first.
    fn monitors(&mut self) -> Result<Vec<Monitor>> {
        let mut monitors = vec![Monitor::virtual_desktop(self.width, self.height)];
        let reply = randr::get_monitors(&self.conn, self.root, true)
            .map_err(|e| transient("RandR get_monitors request", e))?
            .reply()
            .map_err(|e| transient("RandR get_monitors", e))?;

        let mut physical: Vec<_> = reply.monitors.iter().collect();
        physical.sort_by_key(|m| (!m.primary, m.x, m.y));
        for (i, m) in physical.into_iter().enumerate() {
            monitors.push(Monitor {
                index: i as u32 + 1,
                name: self.atom_name(m.name),
                rect: Rect {
                    x: m.x as i32,
                    y: m.y as i32,
                    width: m.width as u32,
                    height: m.height as u32,
                },
                primary: m.primary,
                is_virtual: false,
            });
        }
        debug!(count = monitors.len() - 1, "Enumerated monitors");
        Ok(monitors)
    }

    fn grab(&mut self, region: Rect) -> Result<CapturedFrame> {
        if region.width == 0 || region.height == 0 {
            return Err(transient("grab", "empty region"));
        }
        let size = (region.width * region.height * BYTES_PER_PIXEL) as usize;
        self.ensure_segment(size)?;
        let Some(segment) = self.segment.as_ref() else {
            return Err(transient("grab", "no SHM segment"));
        };

        shm::get_image(
            &self.conn,
            self.root,
            region.x as i16,
            region.y as i16,
            region.width as u16,
            region.height as u16,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            segment.seg,
            0,
        )
        .map_err(|e| transient("SHM GetImage request", e))?
        .reply()
        .map_err(|e| transient("SHM GetImage", e))?;

        // SAFETY: the segment holds at least `size` bytes and &mut self
        // excludes concurrent access.
        let pixels = unsafe { std::slice::from_raw_parts(segment.ptr, size) };
        let mut data = pixels.to_vec();
        // Depth-24 pixmaps leave the fourth byte undefined.
        for pixel in data.chunks_exact_mut(4) {
            pixel[3] = 0xFF;
        }
        Ok(CapturedFrame {
            width: region.width,
            height: region.height,
            data,
        })
    }
}

impl Drop for X11Grabber {
    fn drop(&mut self) {
        self.release_segment();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn layout() -> Vec<Monitor> {
        vec![
            Monitor::virtual_desktop(3840, 1080),
            Monitor {
                index: 1,
                name: "DP-1".into(),
                rect: Rect {
                    x: 0,
                    y: 0,
                    width: 1920,
                    height: 1080,
                },
                primary: true,
                is_virtual: false,
            },
            Monitor {
                index: 2,
                name: "HDMI-1".into(),
                rect: Rect {
                    x: 1920,
                    y: 0,
                    width: 1920,
                    height: 1080,
                },
                primary: false,
                is_virtual: false,
            },
        ]
    }

    /// Solid-colour frames; fails every grab listed in `fail_on` (1-based).
    pub(crate) struct FakeGrabber {
        pub grabs: Arc<AtomicUsize>,
        pub fail_on: Arc<Mutex<Vec<usize>>>,
        pub regions: Arc<Mutex<Vec<Rect>>>,
    }

    impl ScreenGrabber for FakeGrabber {
        fn monitors(&mut self) -> Result<Vec<Monitor>> {
            Ok(layout())
        }

        fn grab(&mut self, region: Rect) -> Result<CapturedFrame> {
            let n = self.grabs.fetch_add(1, Ordering::SeqCst) + 1;
            self.regions.lock().unwrap().push(region);
            if self.fail_on.lock().unwrap().contains(&n) {
                return Err(StreamError::CaptureTransient(format!("grab {n}")));
            }
            let value = (n % 250) as u8;
            Ok(CapturedFrame {
                width: region.width,
                height: region.height,
                data: vec![value; (region.width * region.height * 4) as usize],
            })
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeGrabberFactory {
        pub grabs: Arc<AtomicUsize>,
        pub fail_on: Arc<Mutex<Vec<usize>>>,
        pub regions: Arc<Mutex<Vec<Rect>>>,
        pub unavailable: bool,
    }

    impl GrabberFactory for FakeGrabberFactory {
        fn open(&self) -> Result<Box<dyn ScreenGrabber>> {
            if self.unavailable {
                return Err(StreamError::DeviceUnavailable("no display".into()));
            }
            Ok(Box::new(FakeGrabber {
                grabs: Arc::clone(&self.grabs),
                fail_on: Arc::clone(&self.fail_on),
                regions: Arc::clone(&self.regions),
            }))
        }
    }

    #[test]
    fn defaults_to_requested_monitor() {
        let source = CaptureSource::new(layout(), 2);
        assert_eq!(source.active().name, "HDMI-1");
        let fallback = CaptureSource::new(layout(), 9);
        assert!(fallback.active().is_virtual);
    }

    #[test]
    fn empty_layout_still_has_a_virtual_desktop() {
        let source = CaptureSource::new(vec![], 0);
        assert!(source.active().is_virtual);
        assert_eq!(source.monitors().len(), 1);
    }

    #[test]
    fn select_replaces_active_monitor() {
        let source = CaptureSource::new(layout(), 0);
        let before = source.active();
        source.select(1).unwrap();
        assert_eq!(source.active().index, 1);
        // Earlier readers keep their snapshot.
        assert!(before.is_virtual);
    }

    #[test]
    fn select_unknown_monitor_is_rejected() {
        let source = CaptureSource::new(layout(), 1);
        let err = source.select(7).unwrap_err();
        assert!(matches!(err, StreamError::InvalidState { .. }));
        assert_eq!(source.active().index, 1);
    }

    #[test]
    fn last_writer_wins() {
        let source = Arc::new(CaptureSource::new(layout(), 0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || source.select(i % 3).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        source.select(2).unwrap();
        assert_eq!(source.active().index, 2);
    }

    #[test]
    fn refresh_keeps_selection_when_present() {
        let source = CaptureSource::new(layout(), 2);
        source.refresh(layout()[..2].to_vec());
        assert!(source.active().is_virtual);

        let source = CaptureSource::new(layout(), 1);
        source.refresh(layout());
        assert_eq!(source.active().index, 1);
    }
}
