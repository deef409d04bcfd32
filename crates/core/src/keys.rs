//! Linux input key codes and their names.
//!
//! Codes follow `linux/input-event-codes.h`, so a [`KeyCode`] can be handed
//! straight to uinput. Profiles refer to keys by name (`"KEY_A"`, `"ctrl"`);
//! parsing is case-insensitive and the `KEY_` prefix is optional.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A Linux `EV_KEY` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyCode(pub u16);

/// Name/code table. The first entry for a code is its canonical name.
static KEY_NAMES: &[(&str, u16)] = &[
    ("KEY_ESC", 1),
    ("KEY_1", 2),
    ("KEY_2", 3),
    ("KEY_3", 4),
    ("KEY_4", 5),
    ("KEY_5", 6),
    ("KEY_6", 7),
    ("KEY_7", 8),
    ("KEY_8", 9),
    ("KEY_9", 10),
    ("KEY_0", 11),
    ("KEY_MINUS", 12),
    ("KEY_EQUAL", 13),
    ("KEY_BACKSPACE", 14),
    ("KEY_TAB", 15),
    ("KEY_Q", 16),
    ("KEY_W", 17),
    ("KEY_E", 18),
    ("KEY_R", 19),
    ("KEY_T", 20),
    ("KEY_Y", 21),
    ("KEY_U", 22),
    ("KEY_I", 23),
    ("KEY_O", 24),
    ("KEY_P", 25),
    ("KEY_LEFTBRACE", 26),
    ("KEY_RIGHTBRACE", 27),
    ("KEY_ENTER", 28),
    ("KEY_LEFTCTRL", 29),
    ("KEY_A", 30),
    ("KEY_S", 31),
    ("KEY_D", 32),
    ("KEY_F", 33),
    ("KEY_G", 34),
    ("KEY_H", 35),
    ("KEY_J", 36),
    ("KEY_K", 37),
    ("KEY_L", 38),
    ("KEY_SEMICOLON", 39),
    ("KEY_APOSTROPHE", 40),
    ("KEY_GRAVE", 41),
    ("KEY_LEFTSHIFT", 42),
    ("KEY_BACKSLASH", 43),
    ("KEY_Z", 44),
    ("KEY_X", 45),
    ("KEY_C", 46),
    ("KEY_V", 47),
    ("KEY_B", 48),
    ("KEY_N", 49),
    ("KEY_M", 50),
    ("KEY_COMMA", 51),
    ("KEY_DOT", 52),
    ("KEY_SLASH", 53),
    ("KEY_RIGHTSHIFT", 54),
    ("KEY_KPASTERISK", 55),
    ("KEY_LEFTALT", 56),
    ("KEY_SPACE", 57),
    ("KEY_CAPSLOCK", 58),
    ("KEY_F1", 59),
    ("KEY_F2", 60),
    ("KEY_F3", 61),
    ("KEY_F4", 62),
    ("KEY_F5", 63),
    ("KEY_F6", 64),
    ("KEY_F7", 65),
    ("KEY_F8", 66),
    ("KEY_F9", 67),
    ("KEY_F10", 68),
    ("KEY_NUMLOCK", 69),
    ("KEY_SCROLLLOCK", 70),
    ("KEY_KP7", 71),
    ("KEY_KP8", 72),
    ("KEY_KP9", 73),
    ("KEY_KPMINUS", 74),
    ("KEY_KP4", 75),
    ("KEY_KP5", 76),
    ("KEY_KP6", 77),
    ("KEY_KPPLUS", 78),
    ("KEY_KP1", 79),
    ("KEY_KP2", 80),
    ("KEY_KP3", 81),
    ("KEY_KP0", 82),
    ("KEY_KPDOT", 83),
    ("KEY_F11", 87),
    ("KEY_F12", 88),
    ("KEY_KPENTER", 96),
    ("KEY_RIGHTCTRL", 97),
    ("KEY_KPSLASH", 98),
    ("KEY_SYSRQ", 99),
    ("KEY_RIGHTALT", 100),
    ("KEY_HOME", 102),
    ("KEY_UP", 103),
    ("KEY_PAGEUP", 104),
    ("KEY_LEFT", 105),
    ("KEY_RIGHT", 106),
    ("KEY_END", 107),
    ("KEY_DOWN", 108),
    ("KEY_PAGEDOWN", 109),
    ("KEY_INSERT", 110),
    ("KEY_DELETE", 111),
    ("KEY_MUTE", 113),
    ("KEY_VOLUMEDOWN", 114),
    ("KEY_VOLUMEUP", 115),
    ("KEY_PAUSE", 119),
    ("KEY_LEFTMETA", 125),
    ("KEY_RIGHTMETA", 126),
    ("KEY_COMPOSE", 127),
    ("KEY_NEXTSONG", 163),
    ("KEY_PLAYPAUSE", 164),
    ("KEY_PREVIOUSSONG", 165),
    ("KEY_STOPCD", 166),
    ("KEY_F13", 183),
    ("KEY_F14", 184),
    ("KEY_F15", 185),
    ("KEY_F16", 186),
    ("KEY_F17", 187),
    ("KEY_F18", 188),
    ("KEY_F19", 189),
    ("KEY_F20", 190),
    ("KEY_F21", 191),
    ("KEY_F22", 192),
    ("KEY_F23", 193),
    ("KEY_F24", 194),
    // Aliases
    ("KEY_ESCAPE", 1),
    ("KEY_RETURN", 28),
    ("KEY_CTRL", 29),
    ("KEY_CONTROL", 29),
    ("KEY_SHIFT", 42),
    ("KEY_ALT", 56),
    ("KEY_META", 125),
    ("KEY_SUPER", 125),
    ("KEY_WIN", 125),
    ("KEY_PERIOD", 52),
    ("KEY_PGUP", 104),
    ("KEY_PGDN", 109),
    ("KEY_DEL", 111),
    ("KEY_INS", 110),
];

impl KeyCode {
    /// Parse a key name. Accepts `KEY_A`, `a`, `Ctrl`, `leftshift`, ...
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let full = if upper.starts_with("KEY_") {
            upper
        } else {
            format!("KEY_{upper}")
        };
        KEY_NAMES
            .iter()
            .find(|(n, _)| *n == full)
            .map(|(_, code)| KeyCode(*code))
            .ok_or_else(|| Error::UnknownKey(name.to_string()))
    }

    /// Canonical name, or `None` for codes outside the table.
    pub fn name(self) -> Option<&'static str> {
        KEY_NAMES
            .iter()
            .find(|(_, code)| *code == self.0)
            .map(|(n, _)| *n)
    }

    pub fn code(self) -> u16 {
        self.0
    }

    /// Every distinct code in the table; used to declare uinput capabilities.
    pub fn all() -> impl Iterator<Item = KeyCode> {
        let mut codes: Vec<u16> = KEY_NAMES.iter().map(|(_, c)| *c).collect();
        codes.sort_unstable();
        codes.dedup();
        codes.into_iter().map(KeyCode)
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => f.write_str(n),
            None => write!(f, "KEY_{}", self.0),
        }
    }
}

impl TryFrom<String> for KeyCode {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        KeyCode::from_name(&s)
    }
}

impl From<KeyCode> for String {
    fn from(k: KeyCode) -> Self {
        k.to_string()
    }
}
