use crate::capture::{CaptureSource, Rect};
use anyhow::{Context, bail};
use lumen_protocol::{DragTarget, InputCommand, InputOutcome, MouseButton, PointerTarget};
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::{xproto, xtest};
use x11rb::rust_connection::RustConnection;

const SHIFT_L: u32 = 0xffe1;

/// Executes viewer input commands. Blocking; called on the blocking pool.
pub trait InputExecutor: Send + Sync {
    fn execute(&self, command: &InputCommand) -> InputOutcome;
}

/// Primitive event injection the executor is built on.
pub trait InputDevice: Send {
    fn move_to(&mut self, x: i32, y: i32) -> anyhow::Result<()>;
    fn move_by(&mut self, dx: i32, dy: i32) -> anyhow::Result<()>;
    fn button(&mut self, button: u8, pressed: bool) -> anyhow::Result<()>;
    fn key(&mut self, keysym: u32, pressed: bool) -> anyhow::Result<()>;
    fn pointer(&mut self) -> anyhow::Result<(i32, i32)>;
}

/// X11 button number.
pub fn button_number(button: MouseButton) -> u8 {
    match button {
        MouseButton::Left => 1,
        MouseButton::Middle => 2,
        MouseButton::Right => 3,
    }
}

/// Keysym for a key name as viewers send them ("enter", "ctrl", "f5", "a").
pub fn keysym_for_name(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let sym = match lower.as_str() {
        "enter" | "return" => 0xff0d,
        "tab" => 0xff09,
        "esc" | "escape" => 0xff1b,
        "space" => 0x20,
        "backspace" => 0xff08,
        "delete" | "del" => 0xffff,
        "insert" => 0xff63,
        "home" => 0xff50,
        "end" => 0xff57,
        "pageup" | "pgup" => 0xff55,
        "pagedown" | "pgdn" => 0xff56,
        "left" => 0xff51,
        "up" => 0xff52,
        "right" => 0xff53,
        "down" => 0xff54,
        "capslock" => 0xffe5,
        "printscreen" | "prtsc" => 0xff61,
        "ctrl" | "control" | "ctrlleft" => 0xffe3,
        "ctrlright" => 0xffe4,
        "shift" | "shiftleft" => SHIFT_L,
        "shiftright" => 0xffe2,
        "alt" | "altleft" => 0xffe9,
        "altright" | "altgr" => 0xffea,
        "win" | "super" | "cmd" | "command" | "meta" | "winleft" => 0xffeb,
        _ => {
            if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u32>().ok())
                && (1..=24).contains(&n)
            {
                return Some(0xffbe + n - 1);
            }
            let mut chars = name.chars();
            return match (chars.next(), chars.next()) {
                (Some(c), None) => Some(keysym_for_char(c)),
                _ => None,
            };
        }
    };
    Some(sym)
}

/// Latin-1 characters map to themselves, the rest to Unicode keysyms.
pub fn keysym_for_char(c: char) -> u32 {
    match c {
        '\n' => 0xff0d,
        '\t' => 0xff09,
        c if (' '..='~').contains(&c) || ('\u{a0}'..='\u{ff}').contains(&c) => c as u32,
        c => 0x0100_0000 + c as u32,
    }
}

fn resolve(rect: Rect, target: PointerTarget) -> (i32, i32) {
    match target {
        PointerTarget::Normalized { nx, ny } => normalized_to_pixels(rect, nx, ny),
        PointerTarget::Absolute { x, y } => (x, y),
    }
}

/// Normalized coordinates are relative to the monitor being streamed.
pub fn normalized_to_pixels(rect: Rect, nx: f64, ny: f64) -> (i32, i32) {
    let max_x = rect.width.saturating_sub(1) as f64;
    let max_y = rect.height.saturating_sub(1) as f64;
    (
        rect.x + (nx.clamp(0.0, 1.0) * max_x).round() as i32,
        rect.y + (ny.clamp(0.0, 1.0) * max_y).round() as i32,
    )
}

/// Runs input commands against an [`InputDevice`], resolving normalized
/// coordinates against the currently captured monitor.
pub struct DeviceExecutor<D> {
    device: Mutex<D>,
    source: Arc<CaptureSource>,
    type_interval: Duration,
    display: String,
}

impl<D: InputDevice> DeviceExecutor<D> {
    pub fn new(device: D, source: Arc<CaptureSource>, display: impl Into<String>) -> Self {
        Self {
            device: Mutex::new(device),
            source,
            type_interval: Duration::from_millis(10),
            display: display.into(),
        }
    }

    pub fn with_type_interval(mut self, interval: Duration) -> Self {
        self.type_interval = interval;
        self
    }

    fn run(&self, command: &InputCommand) -> anyhow::Result<()> {
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        let device = &mut *device;
        let rect = self.source.active().rect;
        match command {
            InputCommand::MouseMove(target) => {
                let (x, y) = resolve(rect, *target);
                device.move_to(x, y)
            }
            InputCommand::MouseMoveRelative { dx, dy } => device.move_by(*dx, *dy),
            InputCommand::MouseClick { button, clicks } => {
                click(device, button_number(*button), (*clicks).max(1))
            }
            InputCommand::DoubleClick { button } => click(device, button_number(*button), 2),
            InputCommand::MouseDown { button } => device.button(button_number(*button), true),
            InputCommand::MouseUp { button } => device.button(button_number(*button), false),
            // Positive scrolls up / right.
            InputCommand::Scroll { amount } => {
                let button = if *amount > 0 { 4 } else { 5 };
                click(device, button, amount.unsigned_abs())
            }
            InputCommand::ScrollHorizontal { amount } => {
                let button = if *amount > 0 { 7 } else { 6 };
                click(device, button, amount.unsigned_abs())
            }
            InputCommand::KeyType { text } => {
                for c in text.chars() {
                    tap(device, keysym_for_char(c))?;
                    if !self.type_interval.is_zero() {
                        std::thread::sleep(self.type_interval);
                    }
                }
                Ok(())
            }
            InputCommand::KeyPress { key } => {
                let sym = keysym_for_name(key).with_context(|| format!("Unknown key: {key}"))?;
                tap(device, sym)
            }
            InputCommand::Hotkey { keys } => {
                let syms = keys
                    .iter()
                    .map(|k| keysym_for_name(k).with_context(|| format!("Unknown key: {k}")))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                for sym in &syms {
                    device.key(*sym, true)?;
                }
                for sym in syms.iter().rev() {
                    device.key(*sym, false)?;
                }
                Ok(())
            }
            InputCommand::OpenApp { app } => self.launch(app),
            InputCommand::MouseDrag(target) => {
                let (from, to) = match *target {
                    DragTarget::Between {
                        from_x,
                        from_y,
                        to_x,
                        to_y,
                    } => ((from_x, from_y), (to_x, to_y)),
                    DragTarget::Normalized { nx, ny } => {
                        (device.pointer()?, normalized_to_pixels(rect, nx, ny))
                    }
                    DragTarget::Relative { dx, dy } => {
                        let (x, y) = device.pointer()?;
                        ((x, y), (x + dx, y + dy))
                    }
                };
                device.move_to(from.0, from.1)?;
                device.button(1, true)?;
                device.move_to(to.0, to.1)?;
                device.button(1, false)
            }
        }
    }

    fn launch(&self, app: &str) -> anyhow::Result<()> {
        let mut parts = app.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("Empty application name");
        };
        let child = Command::new(program)
            .args(parts)
            .env("DISPLAY", &self.display)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch {program}"))?;
        info!(app, pid = child.id(), "Application launched");
        Ok(())
    }
}

fn click(device: &mut dyn InputDevice, button: u8, count: u32) -> anyhow::Result<()> {
    for _ in 0..count {
        device.button(button, true)?;
        device.button(button, false)?;
    }
    Ok(())
}

fn tap(device: &mut dyn InputDevice, keysym: u32) -> anyhow::Result<()> {
    device.key(keysym, true)?;
    device.key(keysym, false)
}

impl<D: InputDevice> InputExecutor for DeviceExecutor<D> {
    fn execute(&self, command: &InputCommand) -> InputOutcome {
        match self.run(command) {
            Ok(()) => {
                debug!(kind = command.kind(), "Input executed");
                InputOutcome::Ok {
                    executed: command.kind().to_string(),
                }
            }
            Err(e) => InputOutcome::Error {
                message: format!("{e:#}"),
            },
        }
    }
}

/// Used when no display is reachable for input injection.
pub struct UnavailableInput {
    pub reason: String,
}

impl InputExecutor for UnavailableInput {
    fn execute(&self, _command: &InputCommand) -> InputOutcome {
        InputOutcome::Error {
            message: format!("input unavailable: {}", self.reason),
        }
    }
}

/// XTEST fake input on the root window.
pub struct XTestDevice {
    conn: RustConnection,
    root: xproto::Window,
    /// keysym -> (keycode, needs shift)
    keymap: HashMap<u32, (u8, bool)>,
}

impl XTestDevice {
    pub fn connect(display: &str) -> anyhow::Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(Some(display)).context("Failed to connect to X display")?;
        let root = conn.setup().roots[screen_num].root;

        conn.extension_information(xtest::X11_EXTENSION_NAME)
            .context("Failed to query XTEST extension")?
            .ok_or_else(|| anyhow::anyhow!("XTEST extension not available"))?;

        let keymap = load_keymap(&conn)?;
        let display_name = display;
        info!(display = display_name, keysyms = keymap.len(), "Input injection via XTEST");
        Ok(Self { conn, root, keymap })
    }

    fn fake(&self, event: u8, detail: u8, x: i16, y: i16) -> anyhow::Result<()> {
        xtest::fake_input(&self.conn, event, detail, 0, self.root, x, y, 0)?;
        Ok(())
    }
}

fn load_keymap(conn: &RustConnection) -> anyhow::Result<HashMap<u32, (u8, bool)>> {
    let setup = conn.setup();
    let (min, max) = (setup.min_keycode, setup.max_keycode);
    let reply = xproto::get_keyboard_mapping(conn, min, max - min + 1)
        .context("GetKeyboardMapping request failed")?
        .reply()
        .context("GetKeyboardMapping failed")?;
    let per = reply.keysyms_per_keycode.max(1) as usize;

    let mut keymap = HashMap::new();
    for (i, syms) in reply.keysyms.chunks(per).enumerate() {
        let keycode = min + i as u8;
        for (level, &sym) in syms.iter().take(2).enumerate() {
            if sym != 0 {
                keymap.entry(sym).or_insert((keycode, level == 1));
            }
        }
    }
    Ok(keymap)
}

impl InputDevice for XTestDevice {
    fn move_to(&mut self, x: i32, y: i32) -> anyhow::Result<()> {
        self.fake(xproto::MOTION_NOTIFY_EVENT, 0, x as i16, y as i16)?;
        self.conn.flush()?;
        Ok(())
    }

    fn move_by(&mut self, dx: i32, dy: i32) -> anyhow::Result<()> {
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        xtest::fake_input(
            &self.conn,
            xproto::MOTION_NOTIFY_EVENT,
            1,
            0,
            x11rb::NONE,
            dx as i16,
            dy as i16,
            0,
        )?;
        self.conn.flush()?;
        Ok(())
    }

    fn button(&mut self, button: u8, pressed: bool) -> anyhow::Result<()> {
        let event = if pressed {
            xproto::BUTTON_PRESS_EVENT
        } else {
            xproto::BUTTON_RELEASE_EVENT
        };
        self.fake(event, button, 0, 0)?;
        self.conn.flush()?;
        Ok(())
    }

    fn key(&mut self, keysym: u32, pressed: bool) -> anyhow::Result<()> {
        let Some(&(keycode, shifted)) = self.keymap.get(&keysym) else {
            bail!("No keycode for keysym {keysym:#x}");
        };
        let shift = match self.keymap.get(&SHIFT_L) {
            Some(&(code, _)) if shifted => Some(code),
            _ => None,
        };
        if pressed {
            if let Some(code) = shift {
                self.fake(xproto::KEY_PRESS_EVENT, code, 0, 0)?;
            }
            self.fake(xproto::KEY_PRESS_EVENT, keycode, 0, 0)?;
        } else {
            self.fake(xproto::KEY_RELEASE_EVENT, keycode, 0, 0)?;
            if let Some(code) = shift {
                self.fake(xproto::KEY_RELEASE_EVENT, code, 0, 0)?;
            }
        }
        self.conn.flush()?;
        Ok(())
    }

    fn pointer(&mut self) -> anyhow::Result<(i32, i32)> {
        let reply = xproto::query_pointer(&self.conn, self.root)
            .context("QueryPointer request failed")?
            .reply()
            .context("QueryPointer failed")?;
        Ok((reply.root_x as i32, reply.root_y as i32))
    }
}
