//! Macros: timed key-event sequences, the macro library, and live recording.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::buttons::{ButtonId, Mode};
use crate::keys::KeyCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDirection {
    Press,
    Release,
}

/// One key event, `delay_ms` after the previous step (or after the run
/// starts, for the first step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroStep {
    pub key: KeyCode,
    pub direction: KeyDirection,
    #[serde(default)]
    pub delay_ms: u64,
}

impl MacroStep {
    pub fn press(key: KeyCode, delay_ms: u64) -> Self {
        Self {
            key,
            direction: KeyDirection::Press,
            delay_ms,
        }
    }

    pub fn release(key: KeyCode, delay_ms: u64) -> Self {
        Self {
            key,
            direction: KeyDirection::Release,
            delay_ms,
        }
    }
}

/// How a macro behaves once triggered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// Play the sequence once.
    #[default]
    Once,
    /// Play the sequence `repeat_count` times.
    Repeat,
    /// Loop while the trigger button is held.
    HoldToRepeat,
    /// Loop until the trigger button is pressed again.
    Toggle,
}

impl PlaybackMode {
    /// Whether a run keeps looping until something stops it.
    pub fn loops(self) -> bool {
        matches!(self, Self::HoldToRepeat | Self::Toggle)
    }
}

fn default_repeat_count() -> u32 {
    1
}

fn default_speed() -> f32 {
    1.0
}

/// A recorded, replayable key sequence. Immutable once in the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<MacroStep>,
    #[serde(default)]
    pub playback: PlaybackMode,
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,
    /// Pause between passes of a repeating macro.
    #[serde(default)]
    pub repeat_delay_ms: u64,
    /// Playback speed; 2.0 plays twice as fast.
    #[serde(default = "default_speed")]
    pub speed_multiplier: f32,
}

impl Macro {
    pub fn new(id: impl Into<String>, steps: Vec<MacroStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            steps,
            playback: PlaybackMode::Once,
            repeat_count: 1,
            repeat_delay_ms: 0,
            speed_multiplier: 1.0,
        }
    }

    pub fn with_playback(mut self, playback: PlaybackMode) -> Self {
        self.playback = playback;
        self
    }

    /// Nominal length of one pass at 1x speed.
    pub fn pass_duration(&self) -> Duration {
        Duration::from_millis(self.steps.iter().map(|s| s.delay_ms).sum())
    }

    /// Scale a recorded delay by the playback speed.
    pub fn scaled(&self, delay_ms: u64) -> Duration {
        let speed = if self.speed_multiplier > 0.0 {
            self.speed_multiplier
        } else {
            1.0
        };
        Duration::from_secs_f64(delay_ms as f64 / 1000.0 / speed as f64)
    }
}

/// Every known macro by id. Replaced wholesale on change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroLibrary {
    macros: BTreeMap<String, Arc<Macro>>,
}

impl MacroLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Macro>> {
        self.macros.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.macros.contains_key(id)
    }

    /// Copy of this library with `m` added (or replacing the same id).
    pub fn with(&self, m: Macro) -> Self {
        let mut next = self.clone();
        next.macros.insert(m.id.clone(), Arc::new(m));
        next
    }

    /// Copy of this library without `id`.
    pub fn without(&self, id: &str) -> Self {
        let mut next = self.clone();
        next.macros.remove(id);
        next
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.macros.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Macro>> {
        self.macros.values()
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

impl FromIterator<Macro> for MacroLibrary {
    fn from_iter<I: IntoIterator<Item = Macro>>(iter: I) -> Self {
        Self {
            macros: iter
                .into_iter()
                .map(|m| (m.id.clone(), Arc::new(m)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// A recording with no captured event for this long stops by itself.
    pub idle_timeout_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5000,
        }
    }
}

/// A macro being captured from live key events.
#[derive(Debug, Clone)]
pub struct Recording {
    pub button: ButtonId,
    pub mode: Mode,
    started: Instant,
    last: Option<Instant>,
    steps: Vec<MacroStep>,
}

impl Recording {
    pub fn new(button: ButtonId, mode: Mode, now: Instant) -> Self {
        Self {
            button,
            mode,
            started: now,
            last: None,
            steps: Vec::new(),
        }
    }

    /// Append one key event. The first event gets delay 0; later ones the
    /// time since the previous event.
    pub fn capture(&mut self, key: KeyCode, direction: KeyDirection, at: Instant) {
        let delay_ms = self
            .last
            .map(|last| at.saturating_duration_since(last).as_millis() as u64)
            .unwrap_or(0);
        self.last = Some(at);
        self.steps.push(MacroStep {
            key,
            direction,
            delay_ms,
        });
    }

    /// No event captured for `timeout` (counting from the start if none yet).
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        let since = self.last.unwrap_or(self.started);
        now.saturating_duration_since(since) >= timeout
    }

    pub fn steps(&self) -> &[MacroStep] {
        &self.steps
    }

    /// Freeze into a macro.
    pub fn finish(self, id: String) -> Macro {
        let mut m = Macro::new(id, self.steps);
        m.name = format!("Recorded on {}", self.button);
        m
    }
}
