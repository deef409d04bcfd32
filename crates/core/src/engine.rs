//! The running driver: dispatch thread, macro scheduler and output writer.
//!
//! The dispatch thread owns the read half of the device. It blocks on reads,
//! decodes each report against the previous state, resolves the transition
//! and hands the results off (keys to the sink, macros to the scheduler,
//! output to the writer thread). It never sleeps on macro timing or waits
//! on device writes.
//!
//! When the device goes away the thread stops dispatching, cancels every
//! macro run, releases held keys, detaches the writer and reopens with
//! backoff. The first report after reopening only seeds the input state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::bus::{BusEvent, EventBus};
use crate::buttons::Mode;
use crate::comm::{into_device_lost, DeviceStatus, MAX_CONSECUTIVE_READ_ERRORS};
use crate::config::EngineConfig;
use crate::control::Controller;
use crate::decoder::{Decoder, InputState};
use crate::error::{Error, Result};
use crate::macros::MacroLibrary;
use crate::output::{ModeLeds, OutputCommand, OutputSerializer};
use crate::profile::Profile;
use crate::resolver::{BindingResolver, BindingState, Dispatch};
use crate::scheduler::{CancelReason, MacroScheduler};
use crate::sink::InputSink;
use crate::transport::{DeviceConnector, DeviceLink, ReportReader};

/// Longest single sleep while waiting to reconnect, so stop stays prompt.
const STOP_POLL: Duration = Duration::from_millis(50);

/// A started driver. Dropping it stops it.
pub struct Engine {
    controller: Controller,
    stop: Arc<AtomicBool>,
    dispatch: Option<JoinHandle<()>>,
    scheduler: MacroScheduler,
    output: OutputSerializer,
}

impl Engine {
    /// Start with the built-in default profile and no macros.
    pub fn start(
        connector: Box<dyn DeviceConnector>,
        sink: Arc<dyn InputSink>,
        config: EngineConfig,
    ) -> Result<Self> {
        let state = BindingState::new(Profile::default(), MacroLibrary::new());
        Self::start_with(connector, sink, config, state)
    }

    /// Start with the given bindings already loaded.
    pub fn start_with(
        connector: Box<dyn DeviceConnector>,
        sink: Arc<dyn InputSink>,
        config: EngineConfig,
        state: BindingState,
    ) -> Result<Self> {
        let bus = EventBus::new(config.bus);
        let scheduler = MacroScheduler::spawn(Arc::clone(&sink), bus.clone())?;
        let output = OutputSerializer::spawn(config.output, bus.clone())?;
        let state = Arc::new(state);
        let controller = Controller::new(
            Arc::clone(&state),
            scheduler.handle(),
            output.handle(),
            bus,
        );

        controller.apply_profile_outputs(&state.profile(), Mode::default())?;

        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            decoder: Decoder::new(config.model.decode_table(), config.decoder),
            resolver: BindingResolver::new(state),
            connector,
            sink,
            controller: controller.clone(),
            config,
            stop: Arc::clone(&stop),
        };
        let dispatch = std::thread::Builder::new()
            .name("g13-dispatch".into())
            .spawn(move || dispatcher.run())?;

        info!("Engine started");
        Ok(Self {
            controller,
            stop,
            dispatch: Some(dispatch),
            scheduler,
            output,
        })
    }

    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    /// Stop dispatching, cancel every macro run, release held keys and join
    /// all worker threads. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(dispatch) = self.dispatch.take() else {
            return;
        };
        if dispatch.join().is_err() {
            warn!("Dispatch thread panicked");
        }
        self.scheduler.shutdown();
        self.output.shutdown();
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SessionEnd {
    Stopped,
    Lost(Error),
}

struct Dispatcher {
    decoder: Decoder,
    resolver: BindingResolver,
    connector: Box<dyn DeviceConnector>,
    sink: Arc<dyn InputSink>,
    controller: Controller,
    config: EngineConfig,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn bus(&self) -> &EventBus {
        self.controller.bus()
    }

    fn publish_status(&self, status: DeviceStatus) {
        self.bus().publish(BusEvent::Device { status });
    }

    fn run(mut self) {
        debug!("Dispatch thread started");
        let mut announced = false;
        while let Some(link) = self.connect(announced) {
            match self.session(link) {
                SessionEnd::Stopped => {
                    self.teardown(CancelReason::Shutdown);
                    break;
                }
                SessionEnd::Lost(e) => {
                    warn!(error = %e, "Device lost, reconnecting");
                    self.teardown(CancelReason::DeviceLost);
                    self.publish_status(DeviceStatus::Reconnecting);
                    announced = true;
                }
            }
        }
        self.publish_status(DeviceStatus::Stopped);
        debug!("Dispatch thread stopped");
    }

    /// Open the device, retrying with backoff. `None` once stop is requested.
    fn connect(&self, announced: bool) -> Option<DeviceLink> {
        let mut backoff = self.config.reconnect.backoff();
        let mut attempt: u32 = 0;
        loop {
            if self.stopping() {
                return None;
            }
            attempt += 1;
            match self.connector.open() {
                Ok(link) => {
                    if attempt > 1 {
                        info!(attempt, "Device reopened");
                    }
                    return Some(link);
                }
                Err(e) => {
                    if attempt == 1 && !announced {
                        self.publish_status(DeviceStatus::Reconnecting);
                    }
                    if let Error::PermissionDenied(_) = e {
                        warn!(error = %e, "No access to the device; check the hidraw permissions");
                    }
                    if backoff.take_give_up() {
                        error!(
                            elapsed_ms = backoff.elapsed().as_millis() as u64,
                            error = %e,
                            "Device unavailable, still retrying"
                        );
                        self.publish_status(DeviceStatus::Unavailable);
                    }
                    let delay = backoff.next_delay();
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Open failed");
                    self.sleep(delay);
                }
            }
        }
    }

    fn sleep(&self, total: Duration) {
        let until = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= until || self.stopping() {
                return;
            }
            std::thread::sleep((until - now).min(STOP_POLL));
        }
    }

    fn session(&mut self, link: DeviceLink) -> SessionEnd {
        let DeviceLink { mut reader, writer } = link;

        let mut state = match self.resync(reader.as_mut()) {
            Ok(state) => state,
            Err(e) => return SessionEnd::Lost(e),
        };
        if self.stopping() {
            return SessionEnd::Stopped;
        }
        if let Err(e) = self.controller.output().attach(writer) {
            return SessionEnd::Lost(e);
        }
        self.bus().set_snapshot(state);
        self.resolver.resync(&state);
        self.submit_mode_leds(state.mode);
        self.publish_status(DeviceStatus::Connected);
        info!(mode = %state.mode, "Device connected");

        let read_timeout = self.config.read_timeout();
        let idle_timeout = self.config.recording_idle_timeout();
        let mut errors: u32 = 0;
        loop {
            if self.stopping() {
                return SessionEnd::Stopped;
            }
            if let Some(done) = self
                .controller
                .binding_state()
                .expire_recording(Instant::now(), idle_timeout)
            {
                match done {
                    Ok(done) => self.controller.recording_finished(&done),
                    Err(e) => warn!(error = %e, "Failed to store idle recording"),
                }
            }

            let raw = match reader.read_report(read_timeout) {
                Ok(Some(raw)) => {
                    errors = 0;
                    raw
                }
                Ok(None) => continue,
                Err(e) => match into_device_lost(e) {
                    lost @ Error::DeviceLost(_) => return SessionEnd::Lost(lost),
                    other => {
                        errors += 1;
                        warn!(errors, error = %other, "Read failed");
                        if errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            return SessionEnd::Lost(Error::DeviceLost(format!(
                                "{errors} consecutive read errors, last: {other}"
                            )));
                        }
                        continue;
                    }
                },
            };
            trace!(report_hex = format_args!("{:02X?}", raw.data), "Input report");

            let (next, transition) = match self.decoder.decode(&state, &raw) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "Dropping input report");
                    continue;
                }
            };
            state = next;
            if transition.is_empty() {
                continue;
            }
            self.bus().set_snapshot(state);
            self.bus().record_transition(&transition);
            let dispatches = self.resolver.resolve(&transition, raw.received);
            self.execute(dispatches);
            state.mode = self.resolver.mode();
        }
    }

    /// Read the first report after connecting to learn which buttons are
    /// already down. Falls back to an idle state if the device stays quiet.
    fn resync(&self, reader: &mut dyn ReportReader) -> Result<InputState> {
        let mode = self.resolver.mode();
        let deadline = Instant::now() + self.config.resync_timeout();
        let read_timeout = self.config.read_timeout();
        while Instant::now() < deadline && !self.stopping() {
            match reader.read_report(read_timeout) {
                Ok(Some(raw)) => match self.decoder.seed(&raw, mode) {
                    Ok(state) => {
                        debug!(buttons = state.buttons.len(), "Input state seeded");
                        return Ok(state);
                    }
                    Err(e) => warn!(error = %e, "Ignoring report during resync"),
                },
                Ok(None) => {}
                Err(e) => match into_device_lost(e) {
                    lost @ Error::DeviceLost(_) => return Err(lost),
                    other => warn!(error = %other, "Read failed during resync"),
                },
            }
        }
        debug!("No report during resync, assuming idle device");
        Ok(InputState {
            mode,
            ..InputState::default()
        })
    }

    /// Undo everything a session left behind: macro runs, held keys, the
    /// attached writer.
    fn teardown(&mut self, reason: CancelReason) {
        if let Err(e) = self.controller.scheduler().cancel_all(reason) {
            warn!(error = %e, "Failed to cancel macro runs");
        }
        let releases = self.resolver.release_all();
        self.execute(releases);
        if let Err(e) = self.controller.output().detach() {
            warn!(error = %e, "Failed to detach output writer");
        }
        self.bus().set_snapshot(InputState {
            mode: self.resolver.mode(),
            ..InputState::default()
        });
    }

    fn execute(&self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            match dispatch {
                Dispatch::Press(key) => {
                    if let Err(e) = self.sink.press(key) {
                        warn!(%key, error = %e, "Key press failed");
                    }
                }
                Dispatch::Release(key) => {
                    if let Err(e) = self.sink.release(key) {
                        warn!(%key, error = %e, "Key release failed");
                    }
                }
                Dispatch::TriggerMacro { button, macro_ } => {
                    if let Err(e) = self.controller.scheduler().trigger(button, macro_) {
                        warn!(%button, error = %e, "Failed to start macro");
                    }
                }
                Dispatch::CancelMacro { button } => {
                    if let Err(e) = self
                        .controller
                        .scheduler()
                        .cancel(button, CancelReason::Released)
                    {
                        warn!(%button, error = %e, "Failed to cancel macro");
                    }
                }
                Dispatch::Output(cmd) => {
                    if let Err(e) = self.controller.output().submit(cmd) {
                        warn!(error = %e, "Output command dropped");
                    }
                }
                Dispatch::ModeChanged(mode) => {
                    self.bus().set_mode(mode);
                    self.bus().publish(BusEvent::ModeChanged { mode });
                    self.submit_mode_leds(mode);
                    let profile = self.controller.binding_state().profile();
                    if let Err(e) = self.controller.show_status(&profile, mode) {
                        warn!(%mode, error = %e, "Status screen dropped");
                    }
                }
            }
        }
    }

    fn submit_mode_leds(&self, mode: Mode) {
        let recording = self.controller.is_recording();
        let leds = ModeLeds::for_mode(mode, recording);
        if let Err(e) = self
            .controller
            .output()
            .submit(OutputCommand::SetModeLeds(leds))
        {
            warn!(error = %e, "Failed to update mode LEDs");
        }
    }
}
