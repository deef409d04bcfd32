//! Button identifiers, modes, and the static G13 decode table.
//!
//! G13 input report (interrupt IN, report ID 0x01, 8 bytes):
//!   - byte 0: report ID
//!   - byte 1: joystick X (0x00 left .. 0xFF right, rest ~0x80)
//!   - byte 2: joystick Y (0x00 up .. 0xFF down, rest ~0x80)
//!   - byte 3: G1..G8 (bit 0..7)
//!   - byte 4: G9..G16 (bit 0..7)
//!   - byte 5: G17..G22 (bit 0..5); bits 6-7 reserved
//!   - byte 6: BD, L1, L2, L3, L4, M1, M2, M3 (bit 0..7)
//!   - byte 7: MR, LEFT, DOWN, STICK (bit 0..3); bits 4-7 reserved
//!
//! Reserved bits carry backlight and toggle status on some firmware and are
//! never decoded as buttons. Bit positions beyond G1-G5 and MR were taken from
//! community captures and should be checked with `open-g13 monitor` on new
//! hardware revisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every physical input on the G13 that reports as a bit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum ButtonId {
    G1,
    G2,
    G3,
    G4,
    G5,
    G6,
    G7,
    G8,
    G9,
    G10,
    G11,
    G12,
    G13,
    G14,
    G15,
    G16,
    G17,
    G18,
    G19,
    G20,
    G21,
    G22,
    /// LCD "back" key.
    Bd,
    /// LCD soft keys under the display.
    L1,
    L2,
    L3,
    L4,
    M1,
    M2,
    M3,
    /// Macro record key.
    Mr,
    /// Thumb key left of the stick.
    Left,
    /// Thumb key below the stick.
    Down,
    /// Stick click.
    Stick,
}

impl ButtonId {
    /// All buttons, in decode-table order.
    pub const ALL: &'static [ButtonId] = &[
        ButtonId::G1,
        ButtonId::G2,
        ButtonId::G3,
        ButtonId::G4,
        ButtonId::G5,
        ButtonId::G6,
        ButtonId::G7,
        ButtonId::G8,
        ButtonId::G9,
        ButtonId::G10,
        ButtonId::G11,
        ButtonId::G12,
        ButtonId::G13,
        ButtonId::G14,
        ButtonId::G15,
        ButtonId::G16,
        ButtonId::G17,
        ButtonId::G18,
        ButtonId::G19,
        ButtonId::G20,
        ButtonId::G21,
        ButtonId::G22,
        ButtonId::Bd,
        ButtonId::L1,
        ButtonId::L2,
        ButtonId::L3,
        ButtonId::L4,
        ButtonId::M1,
        ButtonId::M2,
        ButtonId::M3,
        ButtonId::Mr,
        ButtonId::Left,
        ButtonId::Down,
        ButtonId::Stick,
    ];

    /// Bit index inside a [`ButtonSet`].
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Canonical name as used in profiles ("G1", "MR", "STICK").
    pub fn name(self) -> &'static str {
        match self {
            Self::G1 => "G1",
            Self::G2 => "G2",
            Self::G3 => "G3",
            Self::G4 => "G4",
            Self::G5 => "G5",
            Self::G6 => "G6",
            Self::G7 => "G7",
            Self::G8 => "G8",
            Self::G9 => "G9",
            Self::G10 => "G10",
            Self::G11 => "G11",
            Self::G12 => "G12",
            Self::G13 => "G13",
            Self::G14 => "G14",
            Self::G15 => "G15",
            Self::G16 => "G16",
            Self::G17 => "G17",
            Self::G18 => "G18",
            Self::G19 => "G19",
            Self::G20 => "G20",
            Self::G21 => "G21",
            Self::G22 => "G22",
            Self::Bd => "BD",
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
            Self::L4 => "L4",
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M3 => "M3",
            Self::Mr => "MR",
            Self::Left => "LEFT",
            Self::Down => "DOWN",
            Self::Stick => "STICK",
        }
    }

    /// The G-key with the given 1-based number.
    pub fn g_key(n: u8) -> Option<Self> {
        if (1..=22).contains(&n) {
            Some(Self::ALL[(n - 1) as usize])
        } else {
            None
        }
    }
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ButtonId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        // "JOYSTICK" is what older profiles call the stick click.
        if upper == "JOYSTICK" {
            return Ok(Self::Stick);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|b| b.name() == upper)
            .ok_or_else(|| format!("unknown button '{s}'"))
    }
}

/// Binding layer selected by the M1/M2/M3 keys.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Mode {
    #[default]
    M1,
    M2,
    M3,
}

impl Mode {
    pub const ALL: &'static [Mode] = &[Mode::M1, Mode::M2, Mode::M3];

    pub fn name(self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M3 => "M3",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M1" | "1" => Ok(Self::M1),
            "M2" | "2" => Ok(Self::M2),
            "M3" | "3" => Ok(Self::M3),
            _ => Err(format!("unknown mode '{s}'")),
        }
    }
}

/// Set of pressed buttons, one bit per [`ButtonId`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<ButtonId>", from = "Vec<ButtonId>")]
pub struct ButtonSet(u64);

impl ButtonSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, button: ButtonId) -> bool {
        self.0 & (1u64 << button.index()) != 0
    }

    pub fn insert(&mut self, button: ButtonId) {
        self.0 |= 1u64 << button.index();
    }

    pub fn remove(&mut self, button: ButtonId) {
        self.0 &= !(1u64 << button.index());
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = ButtonId> + '_ {
        ButtonId::ALL.iter().copied().filter(|b| self.contains(*b))
    }
}

impl From<ButtonSet> for Vec<ButtonId> {
    fn from(set: ButtonSet) -> Self {
        set.iter().collect()
    }
}

impl From<Vec<ButtonId>> for ButtonSet {
    fn from(buttons: Vec<ButtonId>) -> Self {
        let mut set = ButtonSet::empty();
        for b in buttons {
            set.insert(b);
        }
        set
    }
}

/// Joystick axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

/// Location of one button bit inside an input report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitLocation {
    pub button: ButtonId,
    pub byte: usize,
    pub bit: u8,
}

/// Location and calibration of one joystick axis byte.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSpec {
    pub axis: Axis,
    pub byte: usize,
    /// Raw value at rest.
    pub center: u8,
    /// Raw distance from center that maps to full deflection.
    pub scale: f32,
}

/// Declarative input-report layout for one device model.
#[derive(Debug, PartialEq)]
pub struct DecodeTable {
    pub report_id: u8,
    pub report_len: usize,
    pub buttons: &'static [BitLocation],
    pub axes: &'static [AxisSpec],
}

impl DecodeTable {
    /// Look up where a button lives in the report.
    pub fn location(&self, button: ButtonId) -> Option<BitLocation> {
        self.buttons.iter().copied().find(|l| l.button == button)
    }
}

const fn at(button: ButtonId, byte: usize, bit: u8) -> BitLocation {
    BitLocation { button, byte, bit }
}

/// G13 input report ID.
pub const G13_INPUT_REPORT_ID: u8 = 0x01;
/// G13 input report length, report ID included.
pub const G13_INPUT_REPORT_LEN: usize = 8;

const G13_BUTTONS: &[BitLocation] = &[
    at(ButtonId::G1, 3, 0),
    at(ButtonId::G2, 3, 1),
    at(ButtonId::G3, 3, 2),
    at(ButtonId::G4, 3, 3),
    at(ButtonId::G5, 3, 4),
    at(ButtonId::G6, 3, 5),
    at(ButtonId::G7, 3, 6),
    at(ButtonId::G8, 3, 7),
    at(ButtonId::G9, 4, 0),
    at(ButtonId::G10, 4, 1),
    at(ButtonId::G11, 4, 2),
    at(ButtonId::G12, 4, 3),
    at(ButtonId::G13, 4, 4),
    at(ButtonId::G14, 4, 5),
    at(ButtonId::G15, 4, 6),
    at(ButtonId::G16, 4, 7),
    at(ButtonId::G17, 5, 0),
    at(ButtonId::G18, 5, 1),
    at(ButtonId::G19, 5, 2),
    at(ButtonId::G20, 5, 3),
    at(ButtonId::G21, 5, 4),
    at(ButtonId::G22, 5, 5),
    at(ButtonId::Bd, 6, 0),
    at(ButtonId::L1, 6, 1),
    at(ButtonId::L2, 6, 2),
    at(ButtonId::L3, 6, 3),
    at(ButtonId::L4, 6, 4),
    at(ButtonId::M1, 6, 5),
    at(ButtonId::M2, 6, 6),
    at(ButtonId::M3, 6, 7),
    at(ButtonId::Mr, 7, 0),
    at(ButtonId::Left, 7, 1),
    at(ButtonId::Down, 7, 2),
    at(ButtonId::Stick, 7, 3),
];

const G13_AXES: &[AxisSpec] = &[
    AxisSpec {
        axis: Axis::X,
        byte: 1,
        center: 0x80,
        scale: 127.0,
    },
    AxisSpec {
        axis: Axis::Y,
        byte: 2,
        center: 0x80,
        scale: 127.0,
    },
];

/// Decode table for the Logitech G13.
pub static G13_TABLE: DecodeTable = DecodeTable {
    report_id: G13_INPUT_REPORT_ID,
    report_len: G13_INPUT_REPORT_LEN,
    buttons: G13_BUTTONS,
    axes: G13_AXES,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_covers_every_button_once() {
        let mapped: HashSet<ButtonId> = G13_TABLE.buttons.iter().map(|l| l.button).collect();
        assert_eq!(mapped.len(), G13_TABLE.buttons.len());
        for b in ButtonId::ALL {
            assert!(mapped.contains(b), "{b} missing from G13 table");
        }
    }

    #[test]
    fn table_bits_do_not_overlap() {
        let mut seen = HashSet::new();
        for loc in G13_TABLE.buttons {
            assert!(loc.bit < 8);
            assert!(loc.byte < G13_TABLE.report_len);
            assert!(
                seen.insert((loc.byte, loc.bit)),
                "bit {}.{} mapped twice",
                loc.byte,
                loc.bit
            );
        }
    }

    #[test]
    fn reserved_status_bits_are_unmapped() {
        for (byte, bit) in [(5, 6), (5, 7), (7, 4), (7, 5), (7, 6), (7, 7)] {
            assert!(!G13_TABLE
                .buttons
                .iter()
                .any(|l| l.byte == byte && l.bit == bit));
        }
    }

    #[test]
    fn button_names_roundtrip() {
        for b in ButtonId::ALL {
            assert_eq!(b.name().parse::<ButtonId>().unwrap(), *b);
        }
        assert_eq!("mr".parse::<ButtonId>().unwrap(), ButtonId::Mr);
        assert_eq!("joystick".parse::<ButtonId>().unwrap(), ButtonId::Stick);
        assert!("G23".parse::<ButtonId>().is_err());
    }

    #[test]
    fn button_serde_uses_profile_names() {
        let json = serde_json::to_string(&ButtonId::Left).unwrap();
        assert_eq!(json, "\"LEFT\"");
        let back: ButtonId = serde_json::from_str("\"G17\"").unwrap();
        assert_eq!(back, ButtonId::G17);
    }

    #[test]
    fn g_key_lookup() {
        assert_eq!(ButtonId::g_key(1), Some(ButtonId::G1));
        assert_eq!(ButtonId::g_key(22), Some(ButtonId::G22));
        assert_eq!(ButtonId::g_key(0), None);
        assert_eq!(ButtonId::g_key(23), None);
    }

    #[test]
    fn button_set_operations() {
        let mut set = ButtonSet::empty();
        assert!(set.is_empty());
        set.insert(ButtonId::G1);
        set.insert(ButtonId::Stick);
        assert!(set.contains(ButtonId::G1));
        assert!(set.contains(ButtonId::Stick));
        assert!(!set.contains(ButtonId::G2));
        assert_eq!(set.len(), 2);
        set.remove(ButtonId::G1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![ButtonId::Stick]);
    }

    #[test]
    fn mode_parses_short_forms() {
        assert_eq!("m2".parse::<Mode>().unwrap(), Mode::M2);
        assert_eq!("3".parse::<Mode>().unwrap(), Mode::M3);
        assert!("M4".parse::<Mode>().is_err());
    }
}
