//! Profiles: named, versioned binding sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buttons::{ButtonId, Mode};
use crate::decoder::Joystick;
use crate::error::Result;
use crate::keys::KeyCode;
use crate::output::{OutputCommand, Rgb, FULL_BRIGHTNESS};

/// Keys pressed together, in order, and released in reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ComboRepr", into = "Vec<KeyCode>")]
pub struct KeyCombo(pub Vec<KeyCode>);

// Profiles may write a single key as a bare string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ComboRepr {
    One(KeyCode),
    Many(Vec<KeyCode>),
}

impl From<ComboRepr> for KeyCombo {
    fn from(repr: ComboRepr) -> Self {
        match repr {
            ComboRepr::One(k) => KeyCombo(vec![k]),
            ComboRepr::Many(keys) => KeyCombo(keys),
        }
    }
}

impl From<KeyCombo> for Vec<KeyCode> {
    fn from(combo: KeyCombo) -> Self {
        combo.0
    }
}

impl KeyCombo {
    /// Parse `"ctrl+shift+a"` style strings.
    pub fn parse(s: &str) -> Result<Self> {
        s.split('+')
            .map(|part| KeyCode::from_name(part))
            .collect::<Result<Vec<_>>>()
            .map(KeyCombo)
    }

    pub fn keys(&self) -> &[KeyCode] {
        &self.0
    }
}

/// What a button does when pressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    EmitKeyCombo { keys: KeyCombo },
    RunMacro { macro_id: String },
    SwitchMode { mode: Mode },
    SetOutput { command: OutputCommand },
}

/// Backlight applied when a profile is activated. Accepts a bare color
/// string or `{ "color": .., "brightness": .. }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BacklightRepr")]
pub struct Backlight {
    pub color: Rgb,
    /// Percent, 0-100.
    pub brightness: u8,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BacklightRepr {
    Color(Rgb),
    Full {
        color: Rgb,
        #[serde(default = "full_brightness")]
        brightness: u8,
    },
}

fn full_brightness() -> u8 {
    FULL_BRIGHTNESS
}

impl From<BacklightRepr> for Backlight {
    fn from(repr: BacklightRepr) -> Self {
        match repr {
            BacklightRepr::Color(color) => Backlight::solid(color),
            BacklightRepr::Full { color, brightness } => Backlight { color, brightness },
        }
    }
}

impl Backlight {
    pub fn solid(color: Rgb) -> Self {
        Self {
            color,
            brightness: FULL_BRIGHTNESS,
        }
    }
}

/// LCD behavior while the profile is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcdSettings {
    /// Show the status screen on activation and mode changes.
    pub enabled: bool,
    /// Shown under the status line, one LCD line per text line.
    pub default_text: String,
}

impl Default for LcdSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_text: String::new(),
        }
    }
}

impl LcdSettings {
    pub fn default_lines(&self) -> Vec<String> {
        self.default_text.lines().map(str::to_string).collect()
    }
}

/// What the thumbstick does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickMode {
    /// Position is published on the event bus only.
    #[default]
    Analog,
    /// Deflection past the deadzone holds the direction keys.
    Digital,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// Thumbstick bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoystickBinding {
    pub mode: StickMode,
    /// Fraction of full deflection an axis must pass to count as pushed.
    pub deadzone: f32,
    pub key_up: Option<KeyCombo>,
    pub key_down: Option<KeyCombo>,
    pub key_left: Option<KeyCombo>,
    pub key_right: Option<KeyCombo>,
    /// Without diagonals only the axis pushed further counts.
    pub allow_diagonals: bool,
}

const KEY_UP: KeyCode = KeyCode(103);
const KEY_LEFT: KeyCode = KeyCode(105);
const KEY_RIGHT: KeyCode = KeyCode(106);
const KEY_DOWN: KeyCode = KeyCode(108);

impl Default for JoystickBinding {
    /// Analog, with the arrow keys ready for digital mode.
    fn default() -> Self {
        Self {
            mode: StickMode::Analog,
            deadzone: 0.4,
            key_up: Some(KeyCombo(vec![KEY_UP])),
            key_down: Some(KeyCombo(vec![KEY_DOWN])),
            key_left: Some(KeyCombo(vec![KEY_LEFT])),
            key_right: Some(KeyCombo(vec![KEY_RIGHT])),
            allow_diagonals: true,
        }
    }
}

impl JoystickBinding {
    pub fn digital() -> Self {
        Self {
            mode: StickMode::Digital,
            ..Self::default()
        }
    }

    pub fn key(&self, direction: Direction) -> Option<&KeyCombo> {
        match direction {
            Direction::Up => self.key_up.as_ref(),
            Direction::Down => self.key_down.as_ref(),
            Direction::Left => self.key_left.as_ref(),
            Direction::Right => self.key_right.as_ref(),
        }
    }

    /// Bound directions and their combos.
    pub fn directions(&self) -> impl Iterator<Item = (Direction, &KeyCombo)> + '_ {
        [Direction::Up, Direction::Down, Direction::Left, Direction::Right]
            .into_iter()
            .filter_map(|d| self.key(d).map(|k| (d, k)))
    }

    /// Directions the stick is pushed towards. Empty unless digital.
    /// Negative Y is up.
    pub fn pushed(&self, stick: Joystick) -> Vec<Direction> {
        if self.mode != StickMode::Digital {
            return Vec::new();
        }
        let dz = self.deadzone;
        let vertical = if stick.y < -dz {
            Some(Direction::Up)
        } else if stick.y > dz {
            Some(Direction::Down)
        } else {
            None
        };
        let horizontal = if stick.x < -dz {
            Some(Direction::Left)
        } else if stick.x > dz {
            Some(Direction::Right)
        } else {
            None
        };
        match (vertical, horizontal) {
            (Some(v), Some(h)) if !self.allow_diagonals => {
                if stick.x.abs() > stick.y.abs() {
                    vec![h]
                } else {
                    vec![v]
                }
            }
            (v, h) => v.into_iter().chain(h).collect(),
        }
    }
}

/// A complete binding set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Bumped on every edit made through the engine.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    /// Applied when the profile is activated.
    #[serde(default)]
    pub backlight: Option<Backlight>,
    #[serde(default)]
    pub lcd: LcdSettings,
    #[serde(default)]
    pub joystick: JoystickBinding,
    #[serde(default)]
    pub modes: BTreeMap<Mode, BTreeMap<ButtonId, Action>>,
}

impl Profile {
    /// Empty profile: every button unbound.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            description: String::new(),
            backlight: None,
            lcd: LcdSettings::default(),
            joystick: JoystickBinding::default(),
            modes: BTreeMap::new(),
        }
    }

    /// LCD status screen: the mode and profile name, then the default text.
    pub fn status_lines(&self, mode: Mode) -> Vec<String> {
        let mut lines = vec![format!("{mode}: {}", self.name)];
        lines.extend(self.lcd.default_lines());
        lines
    }

    pub fn binding(&self, mode: Mode, button: ButtonId) -> Option<&Action> {
        self.modes.get(&mode).and_then(|m| m.get(&button))
    }

    /// Set or clear (`None`) one binding.
    pub fn set_binding(&mut self, mode: Mode, button: ButtonId, action: Option<Action>) {
        match action {
            Some(action) => {
                self.modes.entry(mode).or_default().insert(button, action);
            }
            None => {
                if let Some(m) = self.modes.get_mut(&mode) {
                    m.remove(&button);
                }
            }
        }
    }

    /// Macro ids referenced anywhere in the profile.
    pub fn macro_refs(&self) -> impl Iterator<Item = (Mode, ButtonId, &str)> + '_ {
        self.modes.iter().flat_map(|(mode, buttons)| {
            buttons.iter().filter_map(move |(button, action)| match action {
                Action::RunMacro { macro_id } => Some((*mode, *button, macro_id.as_str())),
                _ => None,
            })
        })
    }
}

impl Default for Profile {
    /// G1-G10 type the digit row in M1; M1-M3 switch modes everywhere; the
    /// stick drives the arrow keys.
    fn default() -> Self {
        let mut p = Profile::empty("default");
        p.description = "Digit row on G1-G10".into();
        p.backlight = Some(Backlight::solid(Rgb::new(0, 0x80, 0xFF)));
        p.joystick = JoystickBinding::digital();
        let digits = [
            "KEY_1", "KEY_2", "KEY_3", "KEY_4", "KEY_5", "KEY_6", "KEY_7", "KEY_8", "KEY_9",
            "KEY_0",
        ];
        for (n, name) in digits.iter().enumerate() {
            if let (Some(button), Ok(key)) =
                (ButtonId::g_key(n as u8 + 1), KeyCode::from_name(name))
            {
                p.set_binding(
                    Mode::M1,
                    button,
                    Some(Action::EmitKeyCombo {
                        keys: KeyCombo(vec![key]),
                    }),
                );
            }
        }
        for mode in Mode::ALL {
            for (button, target) in [
                (ButtonId::M1, Mode::M1),
                (ButtonId::M2, Mode::M2),
                (ButtonId::M3, Mode::M3),
            ] {
                p.set_binding(*mode, button, Some(Action::SwitchMode { mode: target }));
            }
        }
        p
    }
}
