//! Binding resolution: decoded transitions in, dispatches out.
//!
//! The active profile and the macro library live in [`BindingState`] as
//! `Arc` snapshots behind locks. Edits build a complete new value and swap
//! the reference, so a reader holding a snapshot never sees a half-applied
//! change. [`BindingResolver::resolve`] takes one profile snapshot per
//! report, so a swap lands between two reports, never inside one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::buttons::{ButtonId, Mode};
use crate::decoder::{Edge, InputState, Joystick, Transition};
use crate::error::{Error, Result};
use crate::keys::KeyCode;
use crate::macros::{KeyDirection, Macro, MacroLibrary, PlaybackMode, Recording};
use crate::output::OutputCommand;
use crate::profile::{Action, Direction, KeyCombo, Profile};
use crate::safety::{MAX_MACRO_STEPS, MAX_STEP_DELAY_MS};

/// What the engine must do in response to a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Press(KeyCode),
    Release(KeyCode),
    TriggerMacro { button: ButtonId, macro_: Arc<Macro> },
    CancelMacro { button: ButtonId },
    Output(OutputCommand),
    ModeChanged(Mode),
}

/// Shared, swappable binding configuration plus the recording buffer.
pub struct BindingState {
    profile: RwLock<Arc<Profile>>,
    macros: RwLock<Arc<MacroLibrary>>,
    recording: Mutex<Option<Recording>>,
    // Serializes read-modify-swap edits so concurrent edits don't lose
    // each other's changes.
    edit: Mutex<()>,
}

impl BindingState {
    pub fn new(profile: Profile, macros: MacroLibrary) -> Self {
        Self {
            profile: RwLock::new(Arc::new(profile)),
            macros: RwLock::new(Arc::new(macros)),
            recording: Mutex::new(None),
            edit: Mutex::new(()),
        }
    }

    pub fn profile(&self) -> Arc<Profile> {
        self.profile.read().clone()
    }

    pub fn macros(&self) -> Arc<MacroLibrary> {
        self.macros.read().clone()
    }

    /// Swap in a whole new profile.
    pub fn replace_profile(&self, profile: Profile) -> Arc<Profile> {
        let _edit = self.edit.lock();
        let profile = Arc::new(profile);
        *self.profile.write() = Arc::clone(&profile);
        profile
    }

    /// Edit a copy of the active profile and swap it in. The version is
    /// bumped only if `f` succeeds; on error nothing changes.
    pub fn update_profile<F>(&self, f: F) -> Result<Arc<Profile>>
    where
        F: FnOnce(&mut Profile) -> Result<()>,
    {
        let _edit = self.edit.lock();
        let mut next = (*self.profile()).clone();
        f(&mut next)?;
        next.version = next.version.wrapping_add(1);
        let next = Arc::new(next);
        *self.profile.write() = Arc::clone(&next);
        Ok(next)
    }

    pub fn add_macro(&self, m: Macro) {
        let _edit = self.edit.lock();
        let next = self.macros().with(m);
        *self.macros.write() = Arc::new(next);
    }

    pub fn remove_macro(&self, id: &str) -> Result<Arc<Macro>> {
        let _edit = self.edit.lock();
        let current = self.macros();
        let removed = current
            .get(id)
            .ok_or_else(|| Error::MacroNotFound(id.to_string()))?;
        *self.macros.write() = Arc::new(current.without(id));
        Ok(removed)
    }

    /// Begin capturing key events for `button`.
    pub fn start_recording(&self, button: ButtonId, mode: Mode, now: Instant) -> Result<()> {
        let mut rec = self.recording.lock();
        if let Some(active) = rec.as_ref() {
            return Err(Error::RecordingInProgress(active.button));
        }
        *rec = Some(Recording::new(button, mode, now));
        info!(%button, %mode, "Macro recording started");
        Ok(())
    }

    /// Drop the recording without storing anything.
    pub fn abort_recording(&self) -> bool {
        let aborted = self.recording.lock().take();
        if let Some(rec) = &aborted {
            debug!(button = %rec.button, "Macro recording aborted");
        }
        aborted.is_some()
    }

    /// Button being recorded for, if any.
    pub fn recording_target(&self) -> Option<ButtonId> {
        self.recording.lock().as_ref().map(|r| r.button)
    }

    fn capture(&self, key: KeyCode, direction: KeyDirection, at: Instant) {
        if let Some(rec) = self.recording.lock().as_mut() {
            rec.capture(key, direction, at);
        }
    }

    /// End the recording and store the macro.
    pub fn stop_recording(&self) -> Result<Recorded> {
        let rec = self.recording.lock().take().ok_or(Error::NotRecording)?;
        self.finish_recording(rec)
    }

    /// End the recording if it has been idle for `timeout`.
    pub fn expire_recording(&self, now: Instant, timeout: Duration) -> Option<Result<Recorded>> {
        let rec = {
            let mut guard = self.recording.lock();
            let idle = guard.as_ref().is_some_and(|r| r.is_idle(now, timeout));
            if idle {
                guard.take()
            } else {
                None
            }
        }?;
        info!(button = %rec.button, "Macro recording idle, stopping");
        Some(self.finish_recording(rec))
    }

    fn finish_recording(&self, rec: Recording) -> Result<Recorded> {
        let button = rec.button;
        let mode = rec.mode;
        if rec.steps().is_empty() {
            info!(%button, "Macro recording finished with nothing captured");
            return Ok(Recorded {
                button,
                macro_: None,
            });
        }

        let base = format!("rec-{}-{}", button, unix_millis());
        let library = self.macros();
        let mut id = base.clone();
        let mut n = 1;
        while library.contains(&id) {
            id = format!("{base}-{n}");
            n += 1;
        }

        let mut m = rec.finish(id);
        m.steps.truncate(MAX_MACRO_STEPS);
        for step in &mut m.steps {
            step.delay_ms = step.delay_ms.min(MAX_STEP_DELAY_MS);
        }
        let m = Arc::new(m);
        self.add_macro((*m).clone());

        let macro_id = m.id.clone();
        self.update_profile(|p| {
            p.set_binding(mode, button, Some(Action::RunMacro { macro_id }));
            Ok(())
        })?;
        info!(macro_id = %m.id, steps = m.steps.len(), %button, "Macro recording finished");
        Ok(Recorded {
            button,
            macro_: Some(m),
        })
    }
}

/// Result of a finished recording. `macro_` is `None` when nothing was
/// captured; such recordings are neither stored nor bound.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub button: ButtonId,
    pub macro_: Option<Arc<Macro>>,
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// What a pressed button left behind that its release must undo.
#[derive(Debug, Clone)]
enum Held {
    Combo(KeyCombo),
    HoldMacro,
}

/// Per-device resolver; lives on the dispatch thread.
pub struct BindingResolver {
    state: Arc<BindingState>,
    mode: Mode,
    held: HashMap<ButtonId, Held>,
    stick: Joystick,
    /// Direction combos held by the stick, as pressed.
    stick_held: BTreeMap<Direction, KeyCombo>,
}

impl BindingResolver {
    pub fn new(state: Arc<BindingState>) -> Self {
        Self {
            state,
            mode: Mode::default(),
            held: HashMap::new(),
            stick: Joystick::default(),
            stick_held: BTreeMap::new(),
        }
    }

    /// Adopt the state read right after (re)connecting. Nothing is pressed
    /// for it; only later movement counts.
    pub fn resync(&mut self, state: &InputState) {
        self.stick = state.joystick;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> &Arc<BindingState> {
        &self.state
    }

    /// Map one transition to dispatches, in edge order.
    pub fn resolve(&mut self, transition: &Transition, now: Instant) -> Vec<Dispatch> {
        let mut out = Vec::new();
        if transition.is_empty() {
            return out;
        }
        let profile = self.state.profile();
        for edge in &transition.buttons {
            match edge.edge {
                Edge::Pressed => self.pressed(&profile, edge.button, now, &mut out),
                Edge::Released => self.released(edge.button, now, &mut out),
            }
        }
        if !transition.axes.is_empty() {
            for motion in &transition.axes {
                self.stick.set(motion.axis, motion.value);
            }
            self.stick_moved(&profile, now, &mut out);
        }
        out
    }

    /// Release directions the stick left, then press the ones it entered.
    fn stick_moved(&mut self, profile: &Profile, now: Instant, out: &mut Vec<Dispatch>) {
        let pushed = profile.joystick.pushed(self.stick);
        let left: Vec<Direction> = self
            .stick_held
            .keys()
            .filter(|d| !pushed.contains(*d))
            .copied()
            .collect();
        for direction in left {
            if let Some(keys) = self.stick_held.remove(&direction) {
                trace!(?direction, "Stick direction released");
                self.release_combo(&keys, now, out);
            }
        }
        for direction in pushed {
            if self.stick_held.contains_key(&direction) {
                continue;
            }
            let Some(keys) = profile.joystick.key(direction) else {
                continue;
            };
            debug!(?direction, "Stick direction pressed");
            for key in keys.keys() {
                out.push(Dispatch::Press(*key));
                self.state.capture(*key, KeyDirection::Press, now);
            }
            self.stick_held.insert(direction, keys.clone());
        }
    }

    fn pressed(&mut self, profile: &Profile, button: ButtonId, now: Instant, out: &mut Vec<Dispatch>) {
        let Some(action) = profile.binding(self.mode, button) else {
            trace!(%button, mode = %self.mode, "Unbound button");
            return;
        };
        debug!(%button, mode = %self.mode, ?action, "Resolved binding");
        match action {
            Action::EmitKeyCombo { keys } => {
                // A press without a matching release (lost report) must not
                // leave the previous combo stuck.
                if let Some(Held::Combo(old)) = self.held.remove(&button) {
                    self.release_combo(&old, now, out);
                }
                for key in keys.keys() {
                    out.push(Dispatch::Press(*key));
                    self.state.capture(*key, KeyDirection::Press, now);
                }
                self.held.insert(button, Held::Combo(keys.clone()));
            }
            Action::RunMacro { macro_id } => {
                if self.state.recording_target() == Some(button) {
                    debug!(%button, "Recording on this button, not starting its macro");
                    return;
                }
                match self.state.macros().get(macro_id) {
                    Some(m) => {
                        if m.playback == PlaybackMode::HoldToRepeat {
                            self.held.insert(button, Held::HoldMacro);
                        }
                        out.push(Dispatch::TriggerMacro { button, macro_: m });
                    }
                    None => warn!(%button, %macro_id, "Binding refers to unknown macro"),
                }
            }
            Action::SwitchMode { mode } => {
                if *mode != self.mode {
                    info!(from = %self.mode, to = %mode, "Mode switch");
                    self.mode = *mode;
                    out.push(Dispatch::ModeChanged(*mode));
                }
            }
            Action::SetOutput { command } => out.push(Dispatch::Output(command.clone())),
        }
    }

    fn released(&mut self, button: ButtonId, now: Instant, out: &mut Vec<Dispatch>) {
        match self.held.remove(&button) {
            Some(Held::Combo(keys)) => self.release_combo(&keys, now, out),
            Some(Held::HoldMacro) => out.push(Dispatch::CancelMacro { button }),
            None => {}
        }
    }

    fn release_combo(&self, keys: &KeyCombo, now: Instant, out: &mut Vec<Dispatch>) {
        for key in keys.keys().iter().rev() {
            out.push(Dispatch::Release(*key));
            self.state.capture(*key, KeyDirection::Release, now);
        }
    }

    /// Release every key this resolver is holding down. Used when the device
    /// goes away or the engine stops.
    pub fn release_all(&mut self) -> Vec<Dispatch> {
        let mut out = Vec::new();
        let mut buttons: Vec<ButtonId> = self.held.keys().copied().collect();
        buttons.sort();
        for button in buttons {
            if let Some(Held::Combo(keys)) = self.held.remove(&button) {
                for key in keys.keys().iter().rev() {
                    out.push(Dispatch::Release(*key));
                }
            }
        }
        self.held.clear();
        for (_, keys) in std::mem::take(&mut self.stick_held) {
            for key in keys.keys().iter().rev() {
                out.push(Dispatch::Release(*key));
            }
        }
        self.stick = Joystick::default();
        out
    }
}
