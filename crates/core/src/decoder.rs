//! Input report decoding.
//!
//! `Decoder::decode` is a pure function of the previous [`InputState`] and one
//! [`RawReport`]: the same inputs always give the same next state and the same
//! [`Transition`]. A report that does not match the decode table is rejected
//! as a whole and the previous state stays live.

use serde::{Deserialize, Serialize};

use crate::buttons::{Axis, ButtonId, ButtonSet, DecodeTable, Mode};
use crate::error::{Error, Result};
use crate::report::RawReport;

/// Joystick shaping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Normalized magnitude below which an axis reads as centered.
    pub dead_zone: f32,
    /// Minimum change that produces an [`AxisMotion`].
    pub axis_threshold: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            dead_zone: 0.1,
            axis_threshold: 0.05,
        }
    }
}

/// Normalized stick position, each axis in -1.0..=1.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Joystick {
    pub x: f32,
    pub y: f32,
}

impl Joystick {
    pub fn get(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }

    pub fn set(&mut self, axis: Axis, value: f32) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
        }
    }
}

/// Everything the device currently reports, plus the active mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InputState {
    pub buttons: ButtonSet,
    pub joystick: Joystick,
    pub mode: Mode,
}

impl InputState {
    pub fn is_pressed(&self, button: ButtonId) -> bool {
        self.buttons.contains(button)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonEdge {
    pub button: ButtonId,
    pub edge: Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisMotion {
    pub axis: Axis,
    pub value: f32,
    pub delta: f32,
}

/// Differences between two consecutive input states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub buttons: Vec<ButtonEdge>,
    pub axes: Vec<AxisMotion>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty() && self.axes.is_empty()
    }

    pub fn pressed(&self) -> impl Iterator<Item = ButtonId> + '_ {
        self.buttons
            .iter()
            .filter(|e| e.edge == Edge::Pressed)
            .map(|e| e.button)
    }

    pub fn released(&self) -> impl Iterator<Item = ButtonId> + '_ {
        self.buttons
            .iter()
            .filter(|e| e.edge == Edge::Released)
            .map(|e| e.button)
    }
}

/// Table-driven report decoder for one device model.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    table: &'static DecodeTable,
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(table: &'static DecodeTable, config: DecoderConfig) -> Self {
        Self { table, config }
    }

    pub fn table(&self) -> &'static DecodeTable {
        self.table
    }

    /// Check the report against the table without decoding it.
    pub fn validate(&self, raw: &RawReport) -> Result<()> {
        let id = raw.report_id().unwrap_or(0);
        if raw.data.len() != self.table.report_len || id != self.table.report_id {
            return Err(Error::MalformedReport {
                report_id: id,
                expected: self.table.report_len,
                actual: raw.data.len(),
            });
        }
        Ok(())
    }

    /// Produce the next state and the transition from `prev`.
    pub fn decode(&self, prev: &InputState, raw: &RawReport) -> Result<(InputState, Transition)> {
        self.validate(raw)?;
        let data = &raw.data;

        let mut next = InputState {
            buttons: ButtonSet::empty(),
            joystick: prev.joystick,
            mode: prev.mode,
        };
        let mut transition = Transition::default();

        for loc in self.table.buttons {
            let down = data[loc.byte] & (1 << loc.bit) != 0;
            if down {
                next.buttons.insert(loc.button);
            }
            if down != prev.buttons.contains(loc.button) {
                transition.buttons.push(ButtonEdge {
                    button: loc.button,
                    edge: if down { Edge::Pressed } else { Edge::Released },
                });
            }
        }

        for entry in self.table.axes {
            let value = self.normalize(data[entry.byte], entry.center, entry.scale);
            let old = prev.joystick.get(entry.axis);
            let delta = value - old;
            if delta == 0.0 {
                continue;
            }
            let at_limit = value == 0.0 || value.abs() >= 1.0;
            if delta.abs() >= self.config.axis_threshold || at_limit {
                next.joystick.set(entry.axis, value);
                transition.axes.push(AxisMotion {
                    axis: entry.axis,
                    value,
                    delta,
                });
            }
        }

        Ok((next, transition))
    }

    /// Decode a report as the first one after (re)connect: no transitions.
    pub fn seed(&self, raw: &RawReport, mode: Mode) -> Result<InputState> {
        let base = InputState {
            mode,
            ..InputState::default()
        };
        let (mut state, _) = self.decode(&base, raw)?;
        // Seed the stick exactly, ignoring the motion threshold.
        for entry in self.table.axes {
            let value = self.normalize(raw.data[entry.byte], entry.center, entry.scale);
            state.joystick.set(entry.axis, value);
        }
        Ok(state)
    }

    fn normalize(&self, raw: u8, center: u8, scale: f32) -> f32 {
        let v = ((raw as f32 - center as f32) / scale).clamp(-1.0, 1.0);
        if v.abs() < self.config.dead_zone {
            0.0
        } else {
            v
        }
    }
}
