//! Output serializer: backlight, M-key LEDs and LCD.
//!
//! Producers never touch the device. [`OutputHandle::submit`] renders and
//! validates a command on the caller's thread, stores it as the desired state
//! of its target and wakes the writer thread, which owns the write half of the
//! device. The writer flushes each target whose desired state differs from
//! what was last written, so commands that pile up between two writes collapse
//! into the latest one, and writing the same thing twice costs nothing.
//!
//! LED effects are the one exception to "write only on change": while an
//! effect plays, the writer thread renders a frame per effect tick straight to
//! the device. The logical state keeps the effect itself, not its frames.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusEvent, EventBus};
use crate::buttons::Mode;
use crate::comm::{write_with_retry, ErrorClass};
use crate::error::{Error, Result};
use crate::lcd::Framebuffer;
use crate::report::{
    OutputReport, BACKLIGHT_REPORT_ID, BACKLIGHT_REPORT_LEN, LCD_HEADER_LEN, LCD_REPORT_ID,
    LCD_REPORT_LEN, MODE_LEDS_REPORT_ID, MODE_LEDS_REPORT_LEN,
};
use crate::safety;
use crate::transport::ReportWriter;

/// Backlight color.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Brightness in percent.
pub const FULL_BRIGHTNESS: u8 = 100;

const NAMED_COLORS: &[(&str, Rgb)] = &[
    ("red", Rgb::new(255, 0, 0)),
    ("green", Rgb::new(0, 255, 0)),
    ("blue", Rgb::new(0, 0, 255)),
    ("yellow", Rgb::new(255, 255, 0)),
    ("cyan", Rgb::new(0, 255, 255)),
    ("magenta", Rgb::new(255, 0, 255)),
    ("white", Rgb::new(255, 255, 255)),
    ("black", Rgb::new(0, 0, 0)),
    ("orange", Rgb::new(255, 128, 0)),
    ("purple", Rgb::new(128, 0, 255)),
    ("pink", Rgb::new(255, 105, 180)),
    ("lime", Rgb::new(0, 255, 128)),
    ("teal", Rgb::new(0, 128, 128)),
    ("coral", Rgb::new(255, 127, 80)),
    ("gold", Rgb::new(255, 215, 0)),
    ("crimson", Rgb::new(220, 20, 60)),
    ("indigo", Rgb::new(75, 0, 130)),
    ("violet", Rgb::new(238, 130, 238)),
    ("turquoise", Rgb::new(64, 224, 208)),
    ("salmon", Rgb::new(250, 128, 114)),
];

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Case-insensitive lookup in the named color table.
    pub fn from_name(name: &str) -> Option<Self> {
        NAMED_COLORS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, c)| *c)
    }

    /// Each channel scaled to `percent` of its value (clamped to 100).
    pub fn scaled(self, percent: u8) -> Self {
        self.dimmed(f32::from(percent.min(FULL_BRIGHTNESS)) / 100.0)
    }

    fn dimmed(self, level: f32) -> Self {
        let level = level.clamp(0.0, 1.0);
        let ch = |v: u8| (f32::from(v) * level).round() as u8;
        Self::new(ch(self.r), ch(self.g), ch(self.b))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl FromStr for Rgb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(named) = Self::from_name(s.trim()) {
            return Ok(named);
        }
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Profile(format!(
                "invalid color '{s}', expected #RRGGBB or a color name"
            )));
        }
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16);
        match (byte(0), byte(2), byte(4)) {
            (Ok(r), Ok(g), Ok(b)) => Ok(Self { r, g, b }),
            _ => Err(Error::Profile(format!("invalid color '{s}'"))),
        }
    }
}

impl TryFrom<String> for Rgb {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Rgb> for String {
    fn from(c: Rgb) -> Self {
        c.to_string()
    }
}

/// M-key LED bitmask as sent to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeLeds(pub u8);

impl ModeLeds {
    pub const M1: u8 = 0x01;
    pub const M2: u8 = 0x02;
    pub const M3: u8 = 0x04;
    pub const MR: u8 = 0x08;

    /// LEDs for the active mode, plus MR while a recording runs.
    pub fn for_mode(mode: Mode, recording: bool) -> Self {
        let mut mask = match mode {
            Mode::M1 => Self::M1,
            Mode::M2 => Self::M2,
            Mode::M3 => Self::M3,
        };
        if recording {
            mask |= Self::MR;
        }
        Self(mask)
    }
}

/// Animated backlight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum LedEffect {
    /// Breathe between 20% and 100% of `color`, one cycle per `period_ms`.
    Pulse { color: Rgb, period_ms: u64 },
    /// Flash `color` on and off `count` times, then go back to the
    /// backlight color.
    Alert { color: Rgb, count: u8 },
}

const PULSE_FRAME: Duration = Duration::from_millis(40);
const ALERT_FLASH: Duration = Duration::from_millis(150);

impl LedEffect {
    /// Color `elapsed` after the effect started, or `None` once it is over.
    pub fn frame(&self, elapsed: Duration) -> Option<Rgb> {
        match *self {
            Self::Pulse { color, period_ms } => {
                let period = period_ms.max(1) as f32 / 1000.0;
                let phase = (elapsed.as_secs_f32() / period * std::f32::consts::TAU).sin();
                Some(color.dimmed(0.2 + 0.8 * (phase + 1.0) / 2.0))
            }
            Self::Alert { color, count } => {
                let slot = elapsed.as_millis() / ALERT_FLASH.as_millis();
                if slot >= 2 * u128::from(count) {
                    None
                } else if slot % 2 == 0 {
                    Some(color)
                } else {
                    Some(Rgb::BLACK)
                }
            }
        }
    }

    /// How often a new frame is rendered.
    pub fn frame_interval(&self) -> Duration {
        match self {
            Self::Pulse { .. } => PULSE_FRAME,
            Self::Alert { .. } => ALERT_FLASH,
        }
    }
}

/// A logical request for a device output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OutputCommand {
    /// Solid backlight color; stops any running effect.
    SetLedColor(Rgb),
    /// Backlight brightness in percent, applied to colors and effects.
    SetBrightness(u8),
    PlayLedEffect(LedEffect),
    SetLcdText(Vec<String>),
    SetLcdBitmap(Framebuffer),
    SetModeLeds(ModeLeds),
}

impl OutputCommand {
    pub fn target(&self) -> OutputTarget {
        match self {
            Self::SetLedColor(_) | Self::SetBrightness(_) | Self::PlayLedEffect(_) => {
                OutputTarget::Backlight
            }
            Self::SetLcdText(_) | Self::SetLcdBitmap(_) => OutputTarget::Lcd,
            Self::SetModeLeds(_) => OutputTarget::ModeLeds,
        }
    }
}

/// Independently written device output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    Backlight,
    ModeLeds,
    Lcd,
}

impl OutputTarget {
    pub const ALL: [OutputTarget; 3] = [Self::Backlight, Self::ModeLeds, Self::Lcd];

    fn slot(self) -> usize {
        match self {
            Self::Backlight => 0,
            Self::ModeLeds => 1,
            Self::Lcd => 2,
        }
    }
}

/// Logical contents of each output. `None` means never set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    pub backlight: Option<Rgb>,
    pub brightness: Option<u8>,
    /// Effect playing on the backlight, if any.
    pub effect: Option<LedEffect>,
    pub mode_leds: Option<ModeLeds>,
    pub lcd: Option<Framebuffer>,
}

impl OutputState {
    fn differs(&self, other: &OutputState, target: OutputTarget) -> bool {
        match target {
            OutputTarget::Backlight => {
                self.backlight != other.backlight
                    || self.brightness != other.brightness
                    || self.effect != other.effect
            }
            OutputTarget::ModeLeds => self.mode_leds != other.mode_leds,
            OutputTarget::Lcd => self.lcd != other.lcd,
        }
    }

    fn copy_target(&mut self, from: &OutputState, target: OutputTarget) {
        match target {
            OutputTarget::Backlight => {
                self.backlight = from.backlight;
                self.brightness = from.brightness;
                self.effect = from.effect;
            }
            OutputTarget::ModeLeds => self.mode_leds = from.mode_leds,
            OutputTarget::Lcd => self.lcd = from.lcd.clone(),
        }
    }

    fn brightness(&self) -> u8 {
        self.brightness.unwrap_or(FULL_BRIGHTNESS)
    }

    /// Encode one target into its output report, if it has been set. The
    /// backlight is encoded as its solid color at the current brightness.
    pub fn encode(&self, target: OutputTarget) -> Option<OutputReport> {
        match target {
            OutputTarget::Backlight => self
                .backlight
                .map(|c| encode_backlight(c.scaled(self.brightness()))),
            OutputTarget::ModeLeds => self.mode_leds.map(encode_mode_leds),
            OutputTarget::Lcd => self.lcd.as_ref().map(encode_lcd),
        }
    }
}

pub fn encode_backlight(c: Rgb) -> OutputReport {
    let mut data = vec![0u8; BACKLIGHT_REPORT_LEN];
    data[0] = BACKLIGHT_REPORT_ID;
    data[1] = c.r;
    data[2] = c.g;
    data[3] = c.b;
    OutputReport::feature(data)
}

pub fn encode_mode_leds(leds: ModeLeds) -> OutputReport {
    let mut data = vec![0u8; MODE_LEDS_REPORT_LEN];
    data[0] = MODE_LEDS_REPORT_ID;
    data[1] = leds.0;
    OutputReport::feature(data)
}

pub fn encode_lcd(fb: &Framebuffer) -> OutputReport {
    let mut data = Vec::with_capacity(LCD_REPORT_LEN);
    data.push(LCD_REPORT_ID);
    data.resize(LCD_HEADER_LEN, 0);
    data.extend_from_slice(fb.as_bytes());
    OutputReport::interrupt(data)
}

/// Per-target write pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub lcd_min_interval_ms: u64,
    pub led_min_interval_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            lcd_min_interval_ms: 50,
            led_min_interval_ms: 0,
        }
    }
}

impl OutputConfig {
    fn min_interval(&self, target: OutputTarget) -> Duration {
        match target {
            OutputTarget::Lcd => Duration::from_millis(self.lcd_min_interval_ms),
            _ => Duration::from_millis(self.led_min_interval_ms),
        }
    }
}

enum Msg {
    Wake,
    Attach(Box<dyn ReportWriter>),
    Detach(Sender<()>),
    Sync(Sender<()>),
    Shutdown,
}

struct Shared {
    desired: Mutex<OutputState>,
    written: Mutex<OutputState>,
}

/// Producer side of the output serializer. Cheap to clone.
#[derive(Clone)]
pub struct OutputHandle {
    tx: Sender<Msg>,
    shared: Arc<Shared>,
}

impl OutputHandle {
    /// Render, validate and queue a command. Supersedes any not-yet-written
    /// command for the same target.
    pub fn submit(&self, cmd: OutputCommand) -> Result<()> {
        let target = cmd.target();
        {
            safety::validate_output_command(&cmd)?;
            let mut desired = self.shared.desired.lock();
            match cmd {
                OutputCommand::SetLedColor(c) => {
                    desired.backlight = Some(c);
                    desired.effect = None;
                }
                OutputCommand::SetBrightness(b) => desired.brightness = Some(b),
                OutputCommand::PlayLedEffect(e) => desired.effect = Some(e),
                OutputCommand::SetModeLeds(m) => desired.mode_leds = Some(m),
                OutputCommand::SetLcdText(lines) => {
                    desired.lcd = Some(Framebuffer::from_text(&lines));
                }
                OutputCommand::SetLcdBitmap(fb) => desired.lcd = Some(fb),
            }
        }
        trace!(?target, "Output command queued");
        self.tx.send(Msg::Wake).map_err(|_| Error::EngineStopped)
    }

    /// Hand the device's write half to the writer thread.
    pub fn attach(&self, writer: Box<dyn ReportWriter>) -> Result<()> {
        self.tx
            .send(Msg::Attach(writer))
            .map_err(|_| Error::EngineStopped)
    }

    /// Drop the write half and wait until the writer has let go of it.
    pub fn detach(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(Msg::Detach(ack_tx))
            .map_err(|_| Error::EngineStopped)?;
        ack_rx.recv().map_err(|_| Error::EngineStopped)
    }

    /// Wait until every pending write has been attempted (or no device is
    /// attached).
    pub fn sync(&self, timeout: Duration) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(Msg::Sync(ack_tx))
            .map_err(|_| Error::EngineStopped)?;
        ack_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout("output sync".into()),
            RecvTimeoutError::Disconnected => Error::EngineStopped,
        })
    }

    /// What the device is known to show.
    pub fn written(&self) -> OutputState {
        self.shared.written.lock().clone()
    }

    /// What producers last asked for.
    pub fn desired(&self) -> OutputState {
        self.shared.desired.lock().clone()
    }
}

/// Owner of the writer thread.
pub struct OutputSerializer {
    handle: OutputHandle,
    thread: Option<JoinHandle<()>>,
}

impl OutputSerializer {
    pub fn spawn(config: OutputConfig, bus: EventBus) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            desired: Mutex::new(OutputState::default()),
            written: Mutex::new(OutputState::default()),
        });
        let worker = Worker {
            rx,
            shared: Arc::clone(&shared),
            config,
            bus,
            writer: None,
            last_write: [None; 3],
            animation: None,
            pending_syncs: Vec::new(),
        };
        let thread = std::thread::Builder::new()
            .name("g13-output".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            handle: OutputHandle { tx, shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> OutputHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.handle.tx.send(Msg::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Output thread panicked");
            }
        }
    }
}

impl Drop for OutputSerializer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    rx: Receiver<Msg>,
    shared: Arc<Shared>,
    config: OutputConfig,
    bus: EventBus,
    writer: Option<Box<dyn ReportWriter>>,
    last_write: [Option<Instant>; 3],
    animation: Option<Animation>,
    pending_syncs: Vec<Sender<()>>,
}

/// Effect being rendered on the backlight.
struct Animation {
    effect: LedEffect,
    started: Instant,
    /// Last frame sent to the device.
    last_frame: Option<Rgb>,
}

impl Worker {
    fn run(mut self) {
        debug!("Output thread started");
        loop {
            let msg = match self.next_deadline() {
                Some(deadline) => match self.rx.recv_deadline(deadline) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                },
            };

            match msg {
                None | Some(Msg::Wake) => {}
                Some(Msg::Attach(writer)) => {
                    info!("Output writer attached, rewriting desired state");
                    self.writer = Some(writer);
                    *self.shared.written.lock() = OutputState::default();
                    self.last_write = [None; 3];
                    if let Some(anim) = self.animation.as_mut() {
                        anim.last_frame = None;
                    }
                }
                Some(Msg::Detach(ack)) => {
                    if self.writer.take().is_some() {
                        debug!("Output writer detached");
                    }
                    let _ = ack.send(());
                }
                Some(Msg::Sync(ack)) => self.pending_syncs.push(ack),
                Some(Msg::Shutdown) => break,
            }

            let now = Instant::now();
            self.flush(now);
            self.animate(now);

            if self.writer.is_none() || !self.any_dirty() {
                for ack in self.pending_syncs.drain(..) {
                    let _ = ack.send(());
                }
            }
        }
        debug!("Output thread stopped");
    }

    fn any_dirty(&self) -> bool {
        let desired = self.shared.desired.lock();
        let written = self.shared.written.lock();
        OutputTarget::ALL
            .iter()
            .any(|t| desired.differs(&written, *t))
    }

    /// Earliest time a rate-limited dirty target may be written or the
    /// next effect frame is due.
    fn next_deadline(&self) -> Option<Instant> {
        self.writer.as_ref()?;
        let desired = self.shared.desired.lock();
        let written = self.shared.written.lock();
        OutputTarget::ALL
            .iter()
            .filter(|t| desired.differs(&written, **t))
            .filter_map(|t| {
                self.last_write[t.slot()].map(|at| at + self.config.min_interval(*t))
            })
            .chain(self.next_frame_at(Instant::now()))
            .min()
    }

    fn next_frame_at(&self, now: Instant) -> Option<Instant> {
        let anim = self.animation.as_ref()?;
        let step = anim.effect.frame_interval();
        let elapsed = now.saturating_duration_since(anim.started);
        let ticks = elapsed.as_nanos() / step.as_nanos().max(1) + 1;
        Some(anim.started + step * u32::try_from(ticks).unwrap_or(u32::MAX))
    }

    /// Backlight report for the desired state. Starts, keeps or stops the
    /// effect animation to match it.
    fn backlight_report(&mut self, desired: &OutputState, now: Instant) -> Option<OutputReport> {
        let Some(effect) = desired.effect else {
            self.animation = None;
            return desired.encode(OutputTarget::Backlight);
        };
        // A brightness change keeps the effect's phase.
        let started = match &self.animation {
            Some(anim) if anim.effect == effect => anim.started,
            _ => {
                debug!(?effect, "LED effect started");
                now
            }
        };
        let frame = effect
            .frame(now.saturating_duration_since(started))
            .map(|c| c.scaled(desired.brightness()));
        self.animation = Some(Animation {
            effect,
            started,
            last_frame: frame,
        });
        frame.map(encode_backlight)
    }

    /// Render the next effect frame, or end the effect once it has run out.
    fn animate(&mut self, now: Instant) {
        if self.writer.is_none() {
            return;
        }
        let brightness = self.shared.written.lock().brightness();
        let Some(anim) = self.animation.as_mut() else {
            return;
        };
        match anim.effect.frame(now.saturating_duration_since(anim.started)) {
            Some(color) => {
                let color = color.scaled(brightness);
                if anim.last_frame == Some(color) {
                    return;
                }
                anim.last_frame = Some(color);
                self.write_frame(&encode_backlight(color));
            }
            None => {
                let effect = anim.effect;
                self.animation = None;
                debug!(?effect, "LED effect finished");
                {
                    let mut desired = self.shared.desired.lock();
                    if desired.effect == Some(effect) {
                        desired.effect = None;
                    }
                }
                // Puts the solid color back.
                self.flush(now);
            }
        }
    }

    fn write_frame(&mut self, report: &OutputReport) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        match write_with_retry(writer.as_mut(), report) {
            Ok(()) => trace!("LED effect frame written"),
            Err(e) if ErrorClass::classify(&e) == ErrorClass::Disconnected => {
                warn!(error = %e, "Device lost during LED effect");
                self.writer = None;
            }
            Err(e) => warn!(error = %e, "LED effect frame dropped"),
        }
    }

    fn flush(&mut self, now: Instant) {
        for target in OutputTarget::ALL {
            if self.writer.is_none() {
                return;
            }
            if let Some(last) = self.last_write[target.slot()] {
                if now < last + self.config.min_interval(target) {
                    continue;
                }
            }
            // Snapshot the latest desired value; anything newer arriving
            // during the write is picked up on the next pass.
            let snapshot = {
                let desired = self.shared.desired.lock();
                let written = self.shared.written.lock();
                if !desired.differs(&written, target) {
                    continue;
                }
                desired.clone()
            };
            let report = match target {
                OutputTarget::Backlight => self.backlight_report(&snapshot, now),
                _ => snapshot.encode(target),
            };
            let Some(report) = report else {
                // Nothing to show (e.g. brightness without a color yet).
                self.shared.written.lock().copy_target(&snapshot, target);
                continue;
            };
            self.write_target(target, &snapshot, &report, now);
        }
    }

    fn write_target(
        &mut self,
        target: OutputTarget,
        snapshot: &OutputState,
        report: &OutputReport,
        now: Instant,
    ) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        self.last_write[target.slot()] = Some(now);
        match write_with_retry(writer.as_mut(), report) {
            Ok(()) => {
                trace!(
                    ?target,
                    report_id = format_args!("0x{:02X}", report.report_id()),
                    len = report.data.len(),
                    "Output report written"
                );
                self.shared.written.lock().copy_target(snapshot, target);
                self.bus.publish(BusEvent::OutputChanged { target });
            }
            Err(e) if ErrorClass::classify(&e) == ErrorClass::Disconnected => {
                warn!(?target, error = %e, "Device lost during output write");
                self.writer = None;
            }
            Err(e) => {
                warn!(?target, error = %e, "Output write failed, dropping command");
                // Fall back to what the device still shows so the failed
                // command is not retried forever.
                let written = self.shared.written.lock().clone();
                let mut desired = self.shared.desired.lock();
                if !desired.differs(snapshot, target) {
                    desired.copy_target(&written, target);
                }
            }
        }
    }
}
