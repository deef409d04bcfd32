//! Control plane: the thread-safe API external tools use to change bindings,
//! macros and device output while the engine runs.
//!
//! Every operation validates its input first and fails without touching any
//! state. Successful edits go through [`BindingState`]'s swap-on-write
//! snapshots, so the dispatch thread picks them up at its next report.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus, Subscription};
use crate::buttons::{ButtonId, Mode};
use crate::decoder::{InputState, Transition};
use crate::error::{Error, Result};
use crate::macros::{Macro, MacroLibrary};
use crate::output::{ModeLeds, OutputCommand, OutputHandle, OutputState};
use crate::profile::{Action, Profile};
use crate::resolver::{BindingState, Recorded};
use crate::safety;
use crate::scheduler::{CancelReason, SchedulerHandle};
use crate::store::JsonStore;

/// Handle to a running engine. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct Controller {
    state: Arc<BindingState>,
    scheduler: SchedulerHandle,
    output: OutputHandle,
    bus: EventBus,
}

impl Controller {
    pub fn new(
        state: Arc<BindingState>,
        scheduler: SchedulerHandle,
        output: OutputHandle,
        bus: EventBus,
    ) -> Self {
        Self {
            state,
            scheduler,
            output,
            bus,
        }
    }

    pub(crate) fn binding_state(&self) -> &Arc<BindingState> {
        &self.state
    }

    pub(crate) fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub(crate) fn output(&self) -> &OutputHandle {
        &self.output
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    // --- Profiles ---

    /// Make `profile` the active profile. Running macros keep playing; the
    /// next report is resolved against the new bindings.
    pub fn load_profile(&self, profile: Profile) -> Result<Arc<Profile>> {
        safety::validate_profile(&profile)?;
        let library = self.state.macros();
        for (mode, button, macro_id) in profile.macro_refs() {
            if !library.contains(macro_id) {
                warn!(%mode, %button, %macro_id, "Profile binds a macro that is not loaded");
            }
        }
        let active = self.state.replace_profile(profile);
        self.apply_profile_outputs(&active, self.bus.snapshot().mode)?;
        info!(profile = %active.name, version = active.version, "Profile activated");
        self.announce_profile(&active);
        Ok(active)
    }

    /// Push the profile's backlight and status screen to the device.
    pub(crate) fn apply_profile_outputs(&self, profile: &Profile, mode: Mode) -> Result<()> {
        if let Some(backlight) = profile.backlight {
            self.output
                .submit(OutputCommand::SetBrightness(backlight.brightness))?;
            self.output
                .submit(OutputCommand::SetLedColor(backlight.color))?;
        }
        self.show_status(profile, mode)
    }

    pub(crate) fn show_status(&self, profile: &Profile, mode: Mode) -> Result<()> {
        if !profile.lcd.enabled {
            return Ok(());
        }
        self.output
            .submit(OutputCommand::SetLcdText(profile.status_lines(mode)))
    }

    /// Load `name` from `store` and activate it.
    pub fn load_stored_profile(&self, store: &JsonStore<Profile>, name: &str) -> Result<Arc<Profile>> {
        let profile = store.load(name)?;
        self.load_profile(profile)
    }

    pub fn get_active_profile(&self) -> Arc<Profile> {
        self.state.profile()
    }

    /// Bind (or with `None`, unbind) `button` in `mode` of the active profile.
    pub fn set_binding(
        &self,
        mode: Mode,
        button: ButtonId,
        action: Option<Action>,
    ) -> Result<Arc<Profile>> {
        if let Some(action) = &action {
            safety::validate_action(action)?;
            if let Action::RunMacro { macro_id } = action {
                if !self.state.macros().contains(macro_id) {
                    return Err(Error::MacroNotFound(macro_id.clone()));
                }
            }
        }
        let updated = self.state.update_profile(|p| {
            p.set_binding(mode, button, action);
            Ok(())
        })?;
        debug!(%mode, %button, version = updated.version, "Binding updated");
        self.announce_profile(&updated);
        Ok(updated)
    }

    // --- Macros ---

    /// Add or replace a macro. Runs already playing the old definition
    /// finish with it.
    pub fn add_macro(&self, m: Macro) -> Result<()> {
        safety::validate_macro(&m)?;
        info!(macro_id = %m.id, steps = m.steps.len(), "Macro added");
        self.state.add_macro(m);
        Ok(())
    }

    /// Remove a macro and cancel any run still playing it.
    pub fn delete_macro(&self, id: &str) -> Result<()> {
        self.state.remove_macro(id)?;
        let cancelled = self.scheduler.cancel_macro(id, CancelReason::Requested)?;
        info!(macro_id = %id, cancelled, "Macro deleted");
        Ok(())
    }

    pub fn macros(&self) -> Arc<MacroLibrary> {
        self.state.macros()
    }

    /// Buttons with a running macro.
    pub fn active_macros(&self) -> Result<Vec<(ButtonId, String)>> {
        self.scheduler.active()
    }

    // --- Recording ---

    /// Start capturing synthesized key events for `button` in the current
    /// mode. Stops any macro playing on that button and lights MR.
    pub fn start_recording(&self, button: ButtonId) -> Result<()> {
        let mode = self.bus.snapshot().mode;
        self.state.start_recording(button, mode, Instant::now())?;
        let armed = self
            .scheduler
            .cancel(button, CancelReason::Requested)
            .and_then(|()| {
                self.output
                    .submit(OutputCommand::SetModeLeds(ModeLeds::for_mode(mode, true)))
            });
        if let Err(e) = armed {
            self.state.abort_recording();
            return Err(e);
        }
        Ok(())
    }

    /// Finish the recording, store the macro and bind it to the recorded
    /// button. Returns `None` if nothing was captured.
    pub fn stop_recording(&self) -> Result<Option<Arc<Macro>>> {
        let done = self.state.stop_recording()?;
        self.recording_finished(&done);
        Ok(done.macro_)
    }

    pub fn is_recording(&self) -> bool {
        self.state.recording_target().is_some()
    }

    /// Announce a finished recording and turn MR off.
    pub(crate) fn recording_finished(&self, done: &Recorded) {
        self.bus.publish(BusEvent::RecordingFinished {
            button: done.button,
            macro_id: done.macro_.as_ref().map(|m| m.id.clone()),
        });
        if done.macro_.is_some() {
            self.announce_profile(&self.state.profile());
        }
        let leds = ModeLeds::for_mode(self.bus.snapshot().mode, false);
        if let Err(e) = self.output.submit(OutputCommand::SetModeLeds(leds)) {
            warn!(error = %e, "Failed to clear recording LED");
        }
    }

    // --- Output ---

    pub fn set_output(&self, cmd: OutputCommand) -> Result<()> {
        safety::validate_output_command(&cmd)?;
        self.output.submit(cmd)
    }

    /// What the device is known to display.
    pub fn output_state(&self) -> OutputState {
        self.output.written()
    }

    // --- Observation ---

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn snapshot(&self) -> InputState {
        self.bus.snapshot()
    }

    pub fn recent_transitions(&self) -> Vec<Transition> {
        self.bus.recent_transitions()
    }

    fn announce_profile(&self, profile: &Profile) {
        self.bus.publish(BusEvent::ProfileActivated {
            name: profile.name.clone(),
            version: profile.version,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::keys::KeyCode;
    use crate::lcd::Framebuffer;
    use crate::macros::MacroStep;
    use crate::output::{OutputConfig, OutputSerializer, Rgb};
    use crate::profile::{Backlight, KeyCombo};
    use crate::scheduler::MacroScheduler;
    use crate::sink::mock::RecordingSink;

    struct Fixture {
        controller: Controller,
        scheduler: MacroScheduler,
        _output: OutputSerializer,
    }

    fn fixture(profile: Profile) -> Fixture {
        let bus = EventBus::new(BusConfig::default());
        let scheduler = MacroScheduler::spawn(Arc::new(RecordingSink::new()), bus.clone()).unwrap();
        let output = OutputSerializer::spawn(OutputConfig::default(), bus.clone()).unwrap();
        let state = Arc::new(BindingState::new(profile, MacroLibrary::new()));
        let controller = Controller::new(state, scheduler.handle(), output.handle(), bus);
        Fixture {
            controller,
            scheduler,
            _output: output,
        }
    }

    #[test]
    fn load_profile_applies_backlight_and_announces() {
        let f = fixture(Profile::empty("start"));
        let mut sub = f.controller.subscribe();
        let mut p = Profile::empty("next");
        p.backlight = Some(Backlight {
            color: Rgb::new(1, 2, 3),
            brightness: 40,
        });
        p.lcd.default_text = "ready".into();
        f.controller.load_profile(p).unwrap();

        assert_eq!(f.controller.get_active_profile().name, "next");
        let desired = f.controller.output().desired();
        assert_eq!(desired.backlight, Some(Rgb::new(1, 2, 3)));
        assert_eq!(desired.brightness, Some(40));
        assert_eq!(
            desired.lcd,
            Some(Framebuffer::from_text(&["M1: next", "ready"]))
        );
        assert!(matches!(
            sub.try_recv(),
            Some(BusEvent::ProfileActivated { name, .. }) if name == "next"
        ));
    }

    #[test]
    fn disabled_lcd_keeps_status_screen_off() {
        let f = fixture(Profile::empty("start"));
        let mut p = Profile::empty("quiet");
        p.lcd.enabled = false;
        f.controller.load_profile(p).unwrap();
        assert_eq!(f.controller.output().desired().lcd, None);
    }

    #[test]
    fn invalid_profile_is_rejected_without_change() {
        let f = fixture(Profile::empty("start"));
        let mut bad = Profile::empty("bad");
        bad.set_binding(
            Mode::M1,
            ButtonId::G1,
            Some(Action::EmitKeyCombo {
                keys: KeyCombo(vec![KeyCode(30); 9]),
            }),
        );
        assert!(f.controller.load_profile(bad).is_err());
        assert_eq!(f.controller.get_active_profile().name, "start");
    }

    #[test]
    fn binding_unknown_macro_fails() {
        let f = fixture(Profile::empty("p"));
        let err = f
            .controller
            .set_binding(
                Mode::M1,
                ButtonId::G1,
                Some(Action::RunMacro {
                    macro_id: "ghost".into(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, Error::MacroNotFound(_)));
        assert_eq!(f.controller.get_active_profile().version, 0);
    }

    #[test]
    fn set_binding_bumps_version() {
        let f = fixture(Profile::empty("p"));
        f.controller
            .add_macro(Macro::new("m", vec![MacroStep::press(KeyCode(30), 0)]))
            .unwrap();
        let p = f
            .controller
            .set_binding(
                Mode::M2,
                ButtonId::G7,
                Some(Action::RunMacro {
                    macro_id: "m".into(),
                }),
            )
            .unwrap();
        assert_eq!(p.version, 1);
        assert!(p.binding(Mode::M2, ButtonId::G7).is_some());
    }

    #[test]
    fn add_macro_validates() {
        let f = fixture(Profile::empty("p"));
        let mut m = Macro::new("fast", vec![]);
        m.speed_multiplier = 50.0;
        assert!(f.controller.add_macro(m).is_err());
        assert!(f.controller.macros().is_empty());
    }

    #[test]
    fn delete_unknown_macro_fails() {
        let f = fixture(Profile::empty("p"));
        assert!(matches!(
            f.controller.delete_macro("nope"),
            Err(Error::MacroNotFound(_))
        ));
    }

    #[test]
    fn delete_macro_cancels_only_its_runs() {
        let f = fixture(Profile::empty("p"));
        let slow = |id: &str| {
            Macro::new(
                id,
                vec![
                    MacroStep::press(KeyCode(30), 0),
                    MacroStep::release(KeyCode(30), 5_000),
                ],
            )
        };
        f.controller.add_macro(slow("gone")).unwrap();
        f.controller.add_macro(slow("stays")).unwrap();
        let library = f.controller.macros();
        let sched = f.controller.scheduler();
        sched.trigger(ButtonId::G1, library.get("gone").unwrap()).unwrap();
        sched.trigger(ButtonId::G2, library.get("stays").unwrap()).unwrap();

        f.controller.delete_macro("gone").unwrap();
        assert!(!f.controller.macros().contains("gone"));
        assert_eq!(
            f.controller.active_macros().unwrap(),
            vec![(ButtonId::G2, "stays".to_string())]
        );
    }

    #[test]
    fn failed_recording_start_leaves_no_recording() {
        let mut f = fixture(Profile::empty("p"));
        f.scheduler.shutdown();
        assert!(matches!(
            f.controller.start_recording(ButtonId::G5),
            Err(Error::EngineStopped)
        ));
        assert!(!f.controller.is_recording());
        assert_eq!(f.controller.output().desired().mode_leds, None);
    }

    #[test]
    fn recording_lights_and_clears_mr() {
        let f = fixture(Profile::empty("p"));
        let mut sub = f.controller.subscribe();
        f.controller.start_recording(ButtonId::G5).unwrap();
        assert!(f.controller.is_recording());
        assert_eq!(
            f.controller.output().desired().mode_leds,
            Some(ModeLeds(ModeLeds::M1 | ModeLeds::MR))
        );
        assert!(matches!(
            f.controller.start_recording(ButtonId::G6),
            Err(Error::RecordingInProgress(ButtonId::G5))
        ));

        assert_eq!(f.controller.stop_recording().unwrap(), None);
        assert_eq!(
            f.controller.output().desired().mode_leds,
            Some(ModeLeds(ModeLeds::M1))
        );
        assert!(matches!(
            sub.try_recv(),
            Some(BusEvent::RecordingFinished {
                button: ButtonId::G5,
                macro_id: None
            })
        ));
        assert!(f.controller.macros().is_empty());
        assert!(matches!(
            f.controller.stop_recording(),
            Err(Error::NotRecording)
        ));
    }

    #[test]
    fn too_many_lcd_lines_are_rejected() {
        let f = fixture(Profile::empty("p"));
        let lines = vec!["x".to_string(); 6];
        assert!(f
            .controller
            .set_output(OutputCommand::SetLcdText(lines))
            .is_err());
        assert!(f.controller.output().desired().lcd.is_none());
    }
}
